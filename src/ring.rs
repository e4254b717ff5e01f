//! Lock-free SPSC ring-buffer channel over shared memory
//!
//! # Layout
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ RingHeader: magic, version, capacity       │
//! │   write_index (own cache line, producer)   │
//! │   read_index  (own cache line, consumer)   │
//! ├────────────────────────────────────────────┤
//! │ RingSlot[capacity]  (256 bytes each)       │
//! └────────────────────────────────────────────┘
//! ```
//!
//! Indices increase monotonically and are masked into the slot array. The
//! producer publishes a slot with a release store of `write_index`; the
//! consumer acquires it before reading the slot and hands the slot back with
//! a release store of `read_index`.
//!
//! Exactly one producer and one consumer may use a ring at a time. Two
//! writers are not detected and corrupt the stream.

use crate::backoff::{wait_for, BackoffConfig};
use crate::codec;
use crate::error::{LinkError, Result};
use crate::pool::{BlockRef, Pool};
use crate::shm::{align_up, Segment};
use crate::value::Value;
use crossbeam_utils::CachePadded;
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

const RING_MAGIC: u32 = 0x5249_4E47; // "RING"
const RING_VERSION: u32 = 1;

/// Largest payload carried inside a slot
pub const INLINE_CAPACITY: usize = 240;

/// Default number of slots
pub const DEFAULT_CAPACITY: usize = 256;

const KIND_INLINE: u8 = 0;
const KIND_POOLED: u8 = 1;

/// Configuration for a new channel
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Number of slots, a power of two
    pub capacity: usize,
    /// Waiting policy of the blocking variants
    pub backoff: BackoffConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            backoff: BackoffConfig::default(),
        }
    }
}

#[repr(C)]
struct RingHeader {
    magic: AtomicU32,
    version: u32,
    capacity: u64,
    slot_size: u64,
    write_index: CachePadded<AtomicU64>,
    read_index: CachePadded<AtomicU64>,
}

#[repr(C, align(64))]
struct RingSlot {
    domain: u8,
    kind: u8,
    len: u16,
    msg_type: u32,
    request_id: u64,
    payload: [u8; INLINE_CAPACITY],
}

const _: () = assert!(std::mem::size_of::<RingSlot>() == 256);

/// Message body: bytes in the slot, or a block in a companion [`Pool`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Inline(Vec<u8>),
    Pooled(BlockRef),
}

/// One channel message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Small category number
    pub domain: u8,
    /// Message type and flags
    pub msg_type: u32,
    /// Correlation id for request/response pairs
    pub request_id: u64,
    pub payload: Payload,
}

impl Message {
    /// Message with an inline payload
    pub fn inline(domain: u8, msg_type: u32, request_id: u64, bytes: &[u8]) -> Self {
        Self {
            domain,
            msg_type,
            request_id,
            payload: Payload::Inline(bytes.to_vec()),
        }
    }

    /// Message referencing a pool block
    pub fn pooled(domain: u8, msg_type: u32, request_id: u64, block: BlockRef) -> Self {
        Self {
            domain,
            msg_type,
            request_id,
            payload: Payload::Pooled(block),
        }
    }

    /// Decode the payload as a codec value.
    ///
    /// A pooled payload is read from `pool` and its block handed back, so
    /// call this once per received message.
    pub fn decode_value(&self, pool: Option<&Pool>) -> Result<Value> {
        match &self.payload {
            Payload::Inline(bytes) => codec::decode(bytes),
            Payload::Pooled(block) => {
                let pool = pool.ok_or(LinkError::InvalidBlock {
                    offset: block.offset,
                    size: block.size,
                })?;
                let decoded = codec::decode(pool.slice(block)?);
                pool.deallocate(*block)?;
                decoded
            }
        }
    }
}

/// Zero-copy view of a message still sitting in its slot
#[derive(Debug)]
pub struct MessageView<'a> {
    pub domain: u8,
    pub msg_type: u32,
    pub request_id: u64,
    /// Inline bytes, empty for pooled messages
    pub inline: &'a [u8],
    /// Pool reference for pooled messages
    pub block: Option<BlockRef>,
}

impl MessageView<'_> {
    fn to_message(&self) -> Message {
        Message {
            domain: self.domain,
            msg_type: self.msg_type,
            request_id: self.request_id,
            payload: match self.block {
                Some(block) => Payload::Pooled(block),
                None => Payload::Inline(self.inline.to_vec()),
            },
        }
    }
}

/// SPSC message channel
///
/// One handle may both send and receive, but across all handles of a ring
/// there must be a single sender and a single receiver.
pub struct Channel {
    shm: Segment,
    header: *const RingHeader,
    slots: *mut RingSlot,
    mask: u64,
    capacity: u64,
    // Last observed peer index, refreshed only when the ring looks full/empty
    cached_read: Cell<u64>,
    cached_write: Cell<u64>,
    backoff: BackoffConfig,
}

// SAFETY: a handle moves between threads freely; it is not Sync because the
// index caches belong to one side.
unsafe impl Send for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name())
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl Channel {
    /// Create a channel with `capacity` slots
    pub fn create(name: &str, capacity: usize) -> Result<Self> {
        Self::create_with(
            name,
            ChannelConfig {
                capacity,
                ..ChannelConfig::default()
            },
        )
    }

    /// Create a channel from a full configuration
    pub fn create_with(name: &str, config: ChannelConfig) -> Result<Self> {
        let capacity = config.capacity;
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(LinkError::NotPowerOfTwo(capacity));
        }
        let slots_offset = align_up(std::mem::size_of::<RingHeader>(), 64);
        let total = slots_offset + capacity * std::mem::size_of::<RingSlot>();
        let shm = Segment::create(name, total)?;
        let base = shm.as_ptr();
        let header = base as *mut RingHeader;

        unsafe {
            std::ptr::write(
                header,
                RingHeader {
                    magic: AtomicU32::new(0),
                    version: RING_VERSION,
                    capacity: capacity as u64,
                    slot_size: std::mem::size_of::<RingSlot>() as u64,
                    write_index: CachePadded::new(AtomicU64::new(0)),
                    read_index: CachePadded::new(AtomicU64::new(0)),
                },
            );
            (*header).magic.store(RING_MAGIC, Ordering::Release);
        }

        tracing::debug!(name, capacity, "created ring channel");

        Ok(Self {
            slots: unsafe { base.add(slots_offset) as *mut RingSlot },
            shm,
            header,
            mask: capacity as u64 - 1,
            capacity: capacity as u64,
            cached_read: Cell::new(0),
            cached_write: Cell::new(0),
            backoff: config.backoff,
        })
    }

    /// Open a channel created by the peer
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(name, BackoffConfig::default())
    }

    /// Open a channel with a custom waiting policy
    pub fn open_with(name: &str, backoff: BackoffConfig) -> Result<Self> {
        let shm = Segment::open(name)?;
        let slots_offset = align_up(std::mem::size_of::<RingHeader>(), 64);
        if shm.size() < slots_offset {
            return Err(LinkError::LayoutMismatch {
                expected: slots_offset,
                got: shm.size(),
            });
        }
        let base = shm.as_ptr();
        let header = base as *const RingHeader;

        let capacity = unsafe {
            let magic = (*header).magic.load(Ordering::Acquire);
            if magic != RING_MAGIC {
                return Err(LinkError::InvalidMagic {
                    expected: RING_MAGIC,
                    got: magic,
                });
            }
            if (*header).version != RING_VERSION {
                return Err(LinkError::VersionMismatch {
                    expected: RING_VERSION,
                    got: (*header).version,
                });
            }
            let slot_size = (*header).slot_size as usize;
            if slot_size != std::mem::size_of::<RingSlot>() {
                return Err(LinkError::LayoutMismatch {
                    expected: std::mem::size_of::<RingSlot>(),
                    got: slot_size,
                });
            }
            (*header).capacity
        };
        let needed = slots_offset + capacity as usize * std::mem::size_of::<RingSlot>();
        if !capacity.is_power_of_two() || shm.size() < needed {
            return Err(LinkError::LayoutMismatch {
                expected: needed,
                got: shm.size(),
            });
        }

        let (read, write) = unsafe {
            (
                (*header).read_index.load(Ordering::Acquire),
                (*header).write_index.load(Ordering::Acquire),
            )
        };

        Ok(Self {
            slots: unsafe { base.add(slots_offset) as *mut RingSlot },
            shm,
            header,
            mask: capacity - 1,
            capacity,
            cached_read: Cell::new(read),
            cached_write: Cell::new(write),
            backoff,
        })
    }

    #[inline(always)]
    fn header(&self) -> &RingHeader {
        unsafe { &*self.header }
    }

    #[inline(always)]
    fn slot(&self, index: u64) -> *mut RingSlot {
        unsafe { self.slots.add((index & self.mask) as usize) }
    }

    /// Send a message without waiting.
    ///
    /// Returns [`LinkError::Full`] if every slot is occupied; the ring is left
    /// untouched in that case.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let (kind, len) = match &msg.payload {
            Payload::Inline(bytes) => {
                if bytes.len() > INLINE_CAPACITY {
                    return Err(LinkError::PayloadTooLarge {
                        max: INLINE_CAPACITY,
                        got: bytes.len(),
                    });
                }
                (KIND_INLINE, bytes.len())
            }
            Payload::Pooled(_) => (KIND_POOLED, 16),
        };

        let header = self.header();
        let write = header.write_index.load(Ordering::Relaxed);
        if !self.has_room(write) {
            return Err(LinkError::Full);
        }

        unsafe {
            let slot = self.slot(write);
            (*slot).domain = msg.domain;
            (*slot).kind = kind;
            (*slot).len = len as u16;
            (*slot).msg_type = msg.msg_type;
            (*slot).request_id = msg.request_id;
            let payload = std::ptr::addr_of_mut!((*slot).payload) as *mut u8;
            match &msg.payload {
                Payload::Pooled(block) => {
                    std::ptr::copy_nonoverlapping(block.offset.to_le_bytes().as_ptr(), payload, 8);
                    std::ptr::copy_nonoverlapping(
                        block.size.to_le_bytes().as_ptr(),
                        payload.add(8),
                        8,
                    );
                }
                Payload::Inline(bytes) => {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), payload, bytes.len());
                }
            }
        }

        header.write_index.store(write + 1, Ordering::Release);
        Ok(())
    }

    /// Whether slot `write` is free, refreshing the cached read index once
    fn has_room(&self, write: u64) -> bool {
        if write - self.cached_read.get() < self.capacity {
            return true;
        }
        self.cached_read
            .set(self.header().read_index.load(Ordering::Acquire));
        write - self.cached_read.get() < self.capacity
    }

    /// Send, waiting for a free slot up to `timeout` (`None` waits forever).
    ///
    /// Returns `Ok(false)` if the timeout expired first.
    pub fn send_timeout(&self, msg: &Message, timeout: Option<Duration>) -> Result<bool> {
        let mut failure = None;
        let sent = wait_for(&self.backoff, timeout, || match self.send(msg) {
            Ok(()) => Some(()),
            Err(LinkError::Full) => None,
            Err(e) => {
                failure = Some(e);
                Some(())
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(sent.is_some()),
        }
    }

    /// Run `f` on the oldest pending message in place, then release its slot.
    ///
    /// Returns `None` when the ring is empty.
    pub fn try_receive_with<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(MessageView<'_>) -> R,
    {
        let header = self.header();
        let read = header.read_index.load(Ordering::Relaxed);
        if read == self.cached_write.get() {
            self.cached_write
                .set(header.write_index.load(Ordering::Acquire));
            if read == self.cached_write.get() {
                return None;
            }
        }

        let result = unsafe {
            let slot = &*self.slot(read);
            let view = if slot.kind == KIND_POOLED {
                let mut offset = [0u8; 8];
                let mut size = [0u8; 8];
                offset.copy_from_slice(&slot.payload[..8]);
                size.copy_from_slice(&slot.payload[8..16]);
                MessageView {
                    domain: slot.domain,
                    msg_type: slot.msg_type,
                    request_id: slot.request_id,
                    inline: &[],
                    block: Some(BlockRef {
                        offset: u64::from_le_bytes(offset),
                        size: u64::from_le_bytes(size),
                    }),
                }
            } else {
                let len = (slot.len as usize).min(INLINE_CAPACITY);
                MessageView {
                    domain: slot.domain,
                    msg_type: slot.msg_type,
                    request_id: slot.request_id,
                    inline: &slot.payload[..len],
                    block: None,
                }
            };
            f(view)
        };

        header.read_index.store(read + 1, Ordering::Release);
        Some(result)
    }

    /// Take the oldest pending message, `None` when empty
    pub fn try_receive(&self) -> Option<Message> {
        self.try_receive_with(|view| view.to_message())
    }

    /// Receive, waiting up to `timeout` (`None` waits forever)
    pub fn receive_timeout(&self, timeout: Option<Duration>) -> Option<Message> {
        wait_for(&self.backoff, timeout, || self.try_receive())
    }

    /// Receive, waiting as long as it takes
    pub fn receive(&self) -> Message {
        loop {
            if let Some(msg) = self.receive_timeout(None) {
                return msg;
            }
        }
    }

    /// Encode `value` and send it, spilling into `pool` when it does not fit
    /// inline.
    ///
    /// Fullness is checked before anything is taken from the pool, so a
    /// [`LinkError::Full`] result leaves both the ring and the pool as they
    /// were.
    pub fn send_value(
        &self,
        domain: u8,
        msg_type: u32,
        request_id: u64,
        value: &Value,
        pool: Option<&Pool>,
    ) -> Result<()> {
        if !self.has_room(self.header().write_index.load(Ordering::Relaxed)) {
            return Err(LinkError::Full);
        }
        let len = codec::checked_len(value)?;
        let msg = if len <= INLINE_CAPACITY {
            let mut buf = [0u8; INLINE_CAPACITY];
            let n = codec::encode_into(value, &mut buf)?;
            Message::inline(domain, msg_type, request_id, &buf[..n])
        } else {
            let pool = pool.ok_or(LinkError::PayloadTooLarge {
                max: INLINE_CAPACITY,
                got: len,
            })?;
            let block = pool.allocate(len)?;
            // SAFETY: the block was just allocated and is not yet published
            let dst = unsafe { pool.slice_mut(&block)? };
            codec::encode_into(value, dst)?;
            Message::pooled(domain, msg_type, request_id, block)
        };
        self.send(&msg)
    }

    /// Receive a message sent with [`Channel::send_value`] and decode it.
    ///
    /// Pooled payloads are decoded straight out of `pool` and the block is
    /// deallocated afterwards.
    pub fn receive_value(&self, pool: Option<&Pool>) -> Option<Result<(Message, Value)>> {
        let msg = self.try_receive()?;
        Some(decode_message(msg, pool))
    }

    /// Messages waiting to be received
    pub fn len(&self) -> usize {
        let header = self.header();
        let write = header.write_index.load(Ordering::Acquire);
        let read = header.read_index.load(Ordering::Acquire);
        write.saturating_sub(read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Name of the backing segment
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Whether this handle created the ring
    pub fn is_owner(&self) -> bool {
        self.shm.is_owner()
    }
}

fn decode_message(msg: Message, pool: Option<&Pool>) -> Result<(Message, Value)> {
    let value = msg.decode_value(pool)?;
    Ok((msg, value))
}

/// Bidirectional link made of two rings.
///
/// The owner sends on `<name>.a2b` and receives on `<name>.b2a`; the peer the
/// other way round.
pub struct ChannelPair {
    tx: Channel,
    rx: Channel,
}

impl ChannelPair {
    /// Create both rings as the owner side
    pub fn create(name: &str, config: ChannelConfig) -> Result<Self> {
        let tx = Channel::create_with(&format!("{}.a2b", name), config.clone())?;
        let rx = Channel::create_with(&format!("{}.b2a", name), config)?;
        Ok(Self { tx, rx })
    }

    /// Attach to both rings as the peer side
    pub fn connect(name: &str) -> Result<Self> {
        let rx = Channel::open(&format!("{}.a2b", name))?;
        let tx = Channel::open(&format!("{}.b2a", name))?;
        Ok(Self { tx, rx })
    }

    /// Outgoing ring
    pub fn sender(&self) -> &Channel {
        &self.tx
    }

    /// Incoming ring
    pub fn receiver(&self) -> &Channel {
        &self.rx
    }

    pub fn send(&self, msg: &Message) -> Result<()> {
        self.tx.send(msg)
    }

    pub fn try_receive(&self) -> Option<Message> {
        self.rx.try_receive()
    }

    /// Send a request and wait for the reply carrying the same request id.
    ///
    /// Replies to other requests that arrive first are dropped. Returns
    /// `Ok(None)` if nothing matching arrived within `timeout`.
    pub fn request(&self, msg: &Message, timeout: Option<Duration>) -> Result<Option<Message>> {
        if !self.tx.send_timeout(msg, timeout)? {
            return Ok(None);
        }
        let wanted = msg.request_id;
        Ok(wait_for(&self.rx.backoff, timeout, || {
            self.rx.try_receive().filter(|reply| reply.request_id == wanted)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::test_name;
    use proptest::prelude::*;
    use std::thread;

    #[test]
    fn test_two_messages_then_empty() {
        let name = test_name("ring_ab");
        let producer = Channel::create(&name, 8).unwrap();
        let consumer = Channel::open(&name).unwrap();

        producer.send(&Message::inline(1, 0, 0, b"a")).unwrap();
        producer.send(&Message::inline(1, 0, 0, b"b")).unwrap();

        let first = consumer.try_receive().unwrap();
        assert_eq!(first.domain, 1);
        assert_eq!(first.payload, Payload::Inline(b"a".to_vec()));
        assert_eq!(
            consumer.try_receive().unwrap().payload,
            Payload::Inline(b"b".to_vec())
        );
        assert!(consumer.try_receive().is_none());
    }

    #[test]
    fn test_full_has_no_effect() {
        let name = test_name("ring_full");
        let producer = Channel::create(&name, 4).unwrap();
        let consumer = Channel::open(&name).unwrap();

        for i in 0..4u64 {
            producer.send(&Message::inline(0, 0, i, &[i as u8])).unwrap();
        }
        assert_eq!(producer.len(), 4);
        let err = producer.send(&Message::inline(0, 0, 99, b"x")).unwrap_err();
        assert!(matches!(err, LinkError::Full));
        assert_eq!(producer.len(), 4);

        for i in 0..4u64 {
            assert_eq!(consumer.try_receive().unwrap().request_id, i);
        }
        assert!(consumer.try_receive().is_none());
    }

    #[test]
    fn test_configuration_errors() {
        assert!(matches!(
            Channel::create(&test_name("ring_np2"), 6),
            Err(LinkError::NotPowerOfTwo(6))
        ));
        assert!(matches!(
            Channel::open(&test_name("ring_none")),
            Err(LinkError::NotFound { .. })
        ));
        let name = test_name("ring_dup");
        let _owner = Channel::create(&name, 2).unwrap();
        assert!(matches!(
            Channel::create(&name, 2),
            Err(LinkError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_oversized_inline_rejected() {
        let name = test_name("ring_big");
        let producer = Channel::create(&name, 2).unwrap();
        let err = producer
            .send(&Message::inline(0, 0, 0, &[0u8; INLINE_CAPACITY + 1]))
            .unwrap_err();
        assert!(matches!(err, LinkError::PayloadTooLarge { .. }));
        assert!(producer.is_empty());
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let name = test_name("ring_magic");
        let _pool = Pool::create(&name, 4096).unwrap();
        assert!(matches!(
            Channel::open(&name),
            Err(LinkError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_receive_timeout_expires() {
        let name = test_name("ring_timeout");
        let ring = Channel::create(&name, 2).unwrap();
        assert!(ring
            .receive_timeout(Some(Duration::from_millis(5)))
            .is_none());
        ring.send(&Message::inline(0, 0, 0, b"x")).unwrap();
        ring.send(&Message::inline(0, 0, 1, b"y")).unwrap();
        assert!(!ring
            .send_timeout(&Message::inline(0, 0, 2, b"z"), Some(Duration::from_millis(5)))
            .unwrap());
    }

    #[test]
    fn test_values_inline_and_pooled() {
        let name = test_name("ring_values");
        let pool_name = test_name("ring_values_pool");
        let producer = Channel::create(&name, 4).unwrap();
        let consumer = Channel::open(&name).unwrap();
        let pool = Pool::create(&pool_name, 64 * 1024).unwrap();
        let peer_pool = Pool::open(&pool_name).unwrap();

        let small = Value::from("hello");
        let big: Value = (0..200).map(Value::Int64).collect();

        producer.send_value(2, 7, 1, &small, Some(&pool)).unwrap();
        producer.send_value(2, 7, 2, &big, Some(&pool)).unwrap();

        let (msg, v) = consumer.receive_value(Some(&peer_pool)).unwrap().unwrap();
        assert!(matches!(msg.payload, Payload::Inline(_)));
        assert_eq!(v, small);

        let (msg, v) = consumer.receive_value(Some(&peer_pool)).unwrap().unwrap();
        assert!(matches!(msg.payload, Payload::Pooled(_)));
        assert_eq!(v, big);
        assert_eq!(pool.stats().deallocations, 1);

        assert!(matches!(
            producer.send_value(0, 0, 0, &big, None),
            Err(LinkError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_too_deep_value_sends_nothing() {
        let name = test_name("ring_deep");
        let pool_name = test_name("ring_deep_pool");
        let producer = Channel::create(&name, 4).unwrap();
        let pool = Pool::create(&pool_name, 64 * 1024).unwrap();

        let deep = (0..=codec::MAX_DEPTH).fold(Value::Null, |v, _| Value::from(vec![v]));
        assert!(matches!(
            producer.send_value(0, 0, 0, &deep, Some(&pool)),
            Err(LinkError::TooDeep(codec::MAX_DEPTH))
        ));
        assert!(producer.is_empty());
        assert_eq!(pool.stats().allocations, 0);
        assert!(format!("{producer:?}").contains("capacity: 4"));
    }

    #[test]
    fn test_threaded_fifo() {
        let name = test_name("ring_threads");
        let producer = Channel::create(&name, 16).unwrap();
        let consumer = Channel::open(&name).unwrap();
        const N: u64 = 10_000;

        let handle = thread::spawn(move || {
            for i in 0..N {
                let msg = Message::inline(3, 0, i, &i.to_le_bytes());
                assert!(producer.send_timeout(&msg, None).unwrap());
            }
            producer
        });

        for i in 0..N {
            let msg = consumer.receive();
            assert_eq!(msg.request_id, i);
            assert_eq!(msg.payload, Payload::Inline(i.to_le_bytes().to_vec()));
        }
        assert!(consumer.try_receive().is_none());
        drop(consumer);
        drop(handle.join().unwrap());
    }

    #[test]
    fn test_pair_request_reply() {
        let name = test_name("pair");
        let owner = ChannelPair::create(&name, ChannelConfig::default()).unwrap();
        let peer = ChannelPair::connect(&name).unwrap();

        let server = thread::spawn(move || {
            let req = peer.rx.receive();
            let reply = Message::inline(req.domain, 1, req.request_id, b"pong");
            peer.send(&reply).unwrap();
            peer
        });

        let reply = owner
            .request(&Message::inline(5, 0, 42, b"ping"), Some(Duration::from_secs(5)))
            .unwrap()
            .unwrap();
        assert_eq!(reply.request_id, 42);
        assert_eq!(reply.payload, Payload::Inline(b"pong".to_vec()));
        drop(server.join().unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_fifo_byte_identical(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..=INLINE_CAPACITY), 1..32)
        ) {
            let name = test_name("ring_prop");
            let producer = Channel::create(&name, 32).unwrap();
            let consumer = Channel::open(&name).unwrap();
            for (i, p) in payloads.iter().enumerate() {
                producer.send(&Message::inline(i as u8, i as u32, i as u64, p)).unwrap();
            }
            for (i, p) in payloads.iter().enumerate() {
                let msg = consumer.try_receive().unwrap();
                prop_assert_eq!(msg.request_id, i as u64);
                prop_assert_eq!(msg.payload, Payload::Inline(p.clone()));
            }
            prop_assert!(consumer.try_receive().is_none());
        }
    }
}
