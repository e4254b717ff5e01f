//! Shared memory block pool for payloads too large for a ring slot
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ PoolHeader                                   │
//! │   magic, version, pool_size                  │
//! │   producer line: bump cursor + counters      │
//! │   consumer line: dealloc counters            │
//! │   free_heads[class]  (LIFO free caches)      │
//! ├──────────────────────────────────────────────┤
//! │ data area (pool_size bytes)                  │
//! │   [BlockHeader | user data ...] ...          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Blocks are power-of-two sized, at least [`MIN_BLOCK`] bytes including a
//! 16 byte header. Each size class has an intrusive LIFO stack of freed
//! blocks linked through the block headers.
//!
//! # Discipline
//!
//! Only the producer allocates and only the consumer deallocates. The stacks
//! therefore have a single popper, which makes a plain CAS stack free of ABA
//! without any lock. Breaking this rule is undefined behavior.

use crate::error::{LinkError, Result};
use crate::shm::{align_up, Segment};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const POOL_MAGIC: u32 = 0x504F_4F4C; // "POOL"
const POOL_VERSION: u32 = 1;

/// Smallest block, header included
pub const MIN_BLOCK: usize = 64;

/// Bytes in front of every block's user data
pub const BLOCK_HEADER: usize = std::mem::size_of::<BlockHeader>();

const MIN_SHIFT: u32 = MIN_BLOCK.trailing_zeros();
const MAX_CLASSES: usize = 40;
const NIL: u64 = u64::MAX;

/// Header in front of every block
#[repr(C)]
struct BlockHeader {
    /// Total block size, header included
    capacity: u64,
    /// Next block in the free stack while cached
    next: AtomicU64,
}

#[repr(C)]
#[derive(Default)]
struct ProducerLine {
    bump: AtomicU64,
    allocations: AtomicU64,
    cache_hits: AtomicU64,
    bump_allocations: AtomicU64,
    allocated_bytes: AtomicU64,
}

#[repr(C)]
#[derive(Default)]
struct ConsumerLine {
    deallocations: AtomicU64,
    freed_bytes: AtomicU64,
}

/// Pool header at the start of the segment
#[repr(C)]
struct PoolHeader {
    magic: AtomicU32,
    version: u32,
    pool_size: u64,
    data_offset: u64,
    producer: CachePadded<ProducerLine>,
    consumer: CachePadded<ConsumerLine>,
    free_heads: [AtomicU64; MAX_CLASSES],
}

/// Reference to a pool block, valid in every process mapping the pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockRef {
    /// Offset of the user data from the start of the data area
    pub offset: u64,
    /// Bytes the caller asked for
    pub size: u64,
}

/// Snapshot of pool counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocations: u64,
    pub deallocations: u64,
    /// Allocations served from a free cache
    pub cache_hits: u64,
    /// Allocations that advanced the bump cursor
    pub bump_allocations: u64,
    /// Bytes in live blocks, headers and rounding included
    pub bytes_in_use: u64,
    /// Bytes never yet handed out by the bump cursor
    pub bytes_untouched: u64,
}

/// Size class index of a block of `total` bytes, `None` past the largest
/// power of two
#[inline]
fn class_of(total: usize) -> Option<usize> {
    let size = total.max(MIN_BLOCK).checked_next_power_of_two()?;
    Some((size.trailing_zeros() - MIN_SHIFT) as usize)
}

#[inline]
fn class_size(class: usize) -> u64 {
    (MIN_BLOCK as u64) << class
}

/// Shared memory block pool
pub struct Pool {
    shm: Segment,
    header: *const PoolHeader,
    data: *mut u8,
    pool_size: u64,
}

// SAFETY: all shared state lives behind atomics; the SPSC discipline is a
// documented caller obligation.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Create a pool with `size` bytes of block storage
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size < MIN_BLOCK || size % MIN_BLOCK != 0 {
            return Err(LinkError::InvalidSize {
                got: size,
                reason: "pool size must be a non-zero multiple of 64",
            });
        }
        let data_offset = align_up(std::mem::size_of::<PoolHeader>(), MIN_BLOCK);
        let shm = Segment::create(name, data_offset + size)?;
        let base = shm.as_ptr();
        let header = base as *mut PoolHeader;

        unsafe {
            std::ptr::write(
                header,
                PoolHeader {
                    magic: AtomicU32::new(0),
                    version: POOL_VERSION,
                    pool_size: size as u64,
                    data_offset: data_offset as u64,
                    producer: CachePadded::new(ProducerLine::default()),
                    consumer: CachePadded::new(ConsumerLine::default()),
                    free_heads: std::array::from_fn(|_| AtomicU64::new(NIL)),
                },
            );
            (*header).magic.store(POOL_MAGIC, Ordering::Release);
        }

        tracing::debug!(name, size, "created block pool");

        Ok(Self {
            data: unsafe { base.add(data_offset) },
            shm,
            header,
            pool_size: size as u64,
        })
    }

    /// Open a pool created by the peer
    pub fn open(name: &str) -> Result<Self> {
        let shm = Segment::open(name)?;
        if shm.size() < std::mem::size_of::<PoolHeader>() {
            return Err(LinkError::LayoutMismatch {
                expected: std::mem::size_of::<PoolHeader>(),
                got: shm.size(),
            });
        }
        let base = shm.as_ptr();
        let header = base as *const PoolHeader;

        let (pool_size, data_offset) = unsafe {
            let magic = (*header).magic.load(Ordering::Acquire);
            if magic != POOL_MAGIC {
                return Err(LinkError::InvalidMagic {
                    expected: POOL_MAGIC,
                    got: magic,
                });
            }
            if (*header).version != POOL_VERSION {
                return Err(LinkError::VersionMismatch {
                    expected: POOL_VERSION,
                    got: (*header).version,
                });
            }
            ((*header).pool_size, (*header).data_offset as usize)
        };
        if data_offset as u64 + pool_size > shm.size() as u64 {
            return Err(LinkError::LayoutMismatch {
                expected: data_offset + pool_size as usize,
                got: shm.size(),
            });
        }

        Ok(Self {
            data: unsafe { base.add(data_offset) },
            shm,
            header,
            pool_size,
        })
    }

    #[inline(always)]
    fn header(&self) -> &PoolHeader {
        unsafe { &*self.header }
    }

    #[inline(always)]
    fn block_ptr(&self, at: u64) -> *mut BlockHeader {
        unsafe { self.data.add(at as usize) as *mut BlockHeader }
    }

    #[inline(always)]
    fn block(&self, at: u64) -> &BlockHeader {
        unsafe { &*self.block_ptr(at) }
    }

    /// Pop the top of a free stack. Producer only.
    fn pop(&self, class: usize) -> Option<u64> {
        let head = &self.header().free_heads[class];
        let mut top = head.load(Ordering::Acquire);
        while top != NIL {
            let next = self.block(top).next.load(Ordering::Relaxed);
            match head.compare_exchange_weak(top, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(top),
                Err(actual) => top = actual,
            }
        }
        None
    }

    /// Push onto a free stack. Consumer only.
    fn push(&self, class: usize, at: u64) {
        let head = &self.header().free_heads[class];
        let block = self.block(at);
        let mut top = head.load(Ordering::Relaxed);
        loop {
            block.next.store(top, Ordering::Relaxed);
            match head.compare_exchange_weak(top, at, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => top = actual,
            }
        }
    }

    /// Allocate a block of at least `n` bytes. Producer only.
    ///
    /// Tries the free cache of the matching size class first, then the bump
    /// cursor, then any larger cached block.
    pub fn allocate(&self, n: usize) -> Result<BlockRef> {
        let exhausted = || LinkError::PoolExhausted {
            requested: n,
            available: self.untouched() as usize,
        };
        let class = n
            .checked_add(BLOCK_HEADER)
            .filter(|&total| total as u64 <= self.pool_size)
            .and_then(class_of)
            .filter(|&class| class < MAX_CLASSES)
            .ok_or_else(exhausted)?;
        let producer = &self.header().producer;

        let at = if let Some(at) = self.pop(class) {
            producer.cache_hits.fetch_add(1, Ordering::Relaxed);
            at
        } else if let Some(at) = self.bump(class_size(class)) {
            producer.bump_allocations.fetch_add(1, Ordering::Relaxed);
            unsafe {
                std::ptr::write(
                    self.block_ptr(at),
                    BlockHeader {
                        capacity: class_size(class),
                        next: AtomicU64::new(NIL),
                    },
                );
            }
            at
        } else if let Some(at) = (class + 1..MAX_CLASSES).find_map(|c| self.pop(c)) {
            producer.cache_hits.fetch_add(1, Ordering::Relaxed);
            at
        } else {
            return Err(exhausted());
        };

        producer.allocations.fetch_add(1, Ordering::Relaxed);
        producer
            .allocated_bytes
            .fetch_add(self.block(at).capacity, Ordering::Relaxed);

        Ok(BlockRef {
            offset: at + BLOCK_HEADER as u64,
            size: n as u64,
        })
    }

    /// Allocate a block and copy `bytes` into it. Producer only.
    pub fn allocate_with(&self, bytes: &[u8]) -> Result<BlockRef> {
        let block = self.allocate(bytes.len())?;
        self.write(&block, bytes)?;
        Ok(block)
    }

    fn bump(&self, size: u64) -> Option<u64> {
        let cursor = &self.header().producer.bump;
        let at = cursor.load(Ordering::Relaxed);
        if at + size > self.pool_size {
            return None;
        }
        cursor.store(at + size, Ordering::Release);
        Some(at)
    }

    fn untouched(&self) -> u64 {
        self.pool_size - self.header().producer.bump.load(Ordering::Acquire)
    }

    /// Return a block to the free cache. Consumer only.
    ///
    /// The block must not be touched through `block` afterwards.
    pub fn deallocate(&self, block: BlockRef) -> Result<()> {
        let at = self.validate(&block)?;
        let capacity = self.block(at).capacity;
        let class = class_of(capacity as usize).ok_or(LinkError::InvalidBlock {
            offset: block.offset,
            size: block.size,
        })?;
        self.push(class, at);

        let consumer = &self.header().consumer;
        consumer.deallocations.fetch_add(1, Ordering::Relaxed);
        consumer.freed_bytes.fetch_add(capacity, Ordering::Relaxed);
        Ok(())
    }

    /// Check a handle against the pool and return its block start
    fn validate(&self, block: &BlockRef) -> Result<u64> {
        let invalid = || LinkError::InvalidBlock {
            offset: block.offset,
            size: block.size,
        };
        let at = block
            .offset
            .checked_sub(BLOCK_HEADER as u64)
            .filter(|at| at % MIN_BLOCK as u64 == 0)
            .ok_or_else(invalid)?;
        let bumped = self.header().producer.bump.load(Ordering::Acquire);
        if at >= bumped {
            return Err(invalid());
        }
        let capacity = self.block(at).capacity;
        if !capacity.is_power_of_two()
            || capacity < MIN_BLOCK as u64
            || at + capacity > bumped
            || block.size > capacity - BLOCK_HEADER as u64
        {
            return Err(invalid());
        }
        Ok(at)
    }

    /// Borrow a block's bytes
    pub fn slice(&self, block: &BlockRef) -> Result<&[u8]> {
        self.validate(block)?;
        Ok(unsafe {
            std::slice::from_raw_parts(self.data.add(block.offset as usize), block.size as usize)
        })
    }

    /// Borrow a block's bytes mutably
    ///
    /// # Safety
    /// The caller must hold the block live and be the only one touching it.
    pub unsafe fn slice_mut(&self, block: &BlockRef) -> Result<&mut [u8]> {
        self.validate(block)?;
        Ok(std::slice::from_raw_parts_mut(
            self.data.add(block.offset as usize),
            block.size as usize,
        ))
    }

    /// Copy `bytes` into the front of a live block
    pub fn write(&self, block: &BlockRef, bytes: &[u8]) -> Result<()> {
        self.validate(block)?;
        if bytes.len() as u64 > block.size {
            return Err(LinkError::BufferOverflow {
                max: block.size as usize,
                got: bytes.len(),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.data.add(block.offset as usize),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Counter snapshot
    pub fn stats(&self) -> PoolStats {
        let h = self.header();
        let allocated = h.producer.allocated_bytes.load(Ordering::Relaxed);
        let freed = h.consumer.freed_bytes.load(Ordering::Relaxed);
        PoolStats {
            allocations: h.producer.allocations.load(Ordering::Relaxed),
            deallocations: h.consumer.deallocations.load(Ordering::Relaxed),
            cache_hits: h.producer.cache_hits.load(Ordering::Relaxed),
            bump_allocations: h.producer.bump_allocations.load(Ordering::Relaxed),
            bytes_in_use: allocated.saturating_sub(freed),
            bytes_untouched: self.untouched(),
        }
    }

    /// Bytes of block storage
    pub fn capacity(&self) -> usize {
        self.pool_size as usize
    }

    /// Name of the backing segment
    pub fn name(&self) -> &str {
        self.shm.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::test_name;
    use proptest::prelude::*;

    #[test]
    fn test_size_classes() {
        assert_eq!(class_of(1), Some(0));
        assert_eq!(class_of(64), Some(0));
        assert_eq!(class_of(65), Some(1));
        assert_eq!(class_of(916), Some(4));
        assert_eq!(class_of(usize::MAX / 2 + 2), None);
        assert_eq!(class_size(4), 1024);
        assert_eq!(BLOCK_HEADER, 16);
    }

    #[test]
    fn test_exhaustion_until_free() {
        let pool = Pool::create(&test_name("pool_small"), 1024).unwrap();
        let big = pool.allocate(900).unwrap();

        let err = pool.allocate(200).unwrap_err();
        assert!(err.is_capacity());

        pool.deallocate(big).unwrap();
        let small = pool.allocate(200).unwrap();
        assert_eq!(small.size, 200);
        assert_eq!(pool.slice(&small).unwrap().len(), 200);
    }

    #[test]
    fn test_huge_request_is_exhaustion() {
        let pool = Pool::create(&test_name("pool_huge"), 4096).unwrap();
        for n in [4096, usize::MAX / 2 + 2, usize::MAX - 8, usize::MAX] {
            assert!(matches!(
                pool.allocate(n),
                Err(LinkError::PoolExhausted { requested, .. }) if requested == n
            ));
        }
        assert_eq!(pool.stats().allocations, 0);
        assert!(pool.allocate(4096 - BLOCK_HEADER).is_ok());
    }

    #[test]
    fn test_free_cache_reuse_counts_hits() {
        let pool = Pool::create(&test_name("pool_hits"), 64 * 1024).unwrap();
        let blocks: Vec<_> = (0..8).map(|_| pool.allocate(100).unwrap()).collect();
        assert_eq!(pool.stats().bump_allocations, 8);

        for b in blocks.iter().copied() {
            pool.deallocate(b).unwrap();
        }
        let again: Vec<_> = (0..8).map(|_| pool.allocate(100).unwrap()).collect();

        let stats = pool.stats();
        assert_eq!(stats.cache_hits, 8);
        assert_eq!(stats.bump_allocations, 8);
        assert_eq!(stats.allocations, 16);
        assert_eq!(stats.deallocations, 8);
        // LIFO: the last freed block comes back first
        assert_eq!(again[0], blocks[7]);
    }

    #[test]
    fn test_peer_sees_writes_and_frees() {
        let name = test_name("pool_peer");
        let owner = Pool::create(&name, 4096).unwrap();
        let peer = Pool::open(&name).unwrap();

        let block = owner.allocate_with(b"large payload").unwrap();
        assert_eq!(peer.slice(&block).unwrap(), b"large payload");

        peer.deallocate(block).unwrap();
        assert_eq!(owner.stats().deallocations, 1);
        assert_eq!(owner.allocate(13).unwrap(), block);
        assert_eq!(owner.stats().cache_hits, 1);
    }

    #[test]
    fn test_invalid_handles_rejected() {
        let pool = Pool::create(&test_name("pool_bad"), 4096).unwrap();
        let block = pool.allocate(10).unwrap();
        let bogus = [
            BlockRef { offset: 0, size: 1 },
            BlockRef { offset: block.offset + 8, size: 1 },
            BlockRef { offset: 4096 + 16, size: 1 },
            BlockRef { offset: block.offset, size: 4096 },
        ];
        for b in bogus {
            assert!(matches!(pool.slice(&b), Err(LinkError::InvalidBlock { .. })));
        }
        assert!(matches!(
            pool.write(&block, &[0u8; 11]),
            Err(LinkError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn test_bad_pool_size() {
        assert!(matches!(
            Pool::create(&test_name("pool_odd"), 100),
            Err(LinkError::InvalidSize { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_live_blocks_never_overlap(ops in prop::collection::vec((any::<bool>(), 1usize..600), 1..80)) {
            let pool = Pool::create(&test_name("pool_prop"), 16 * 1024).unwrap();
            let mut live: Vec<BlockRef> = Vec::new();
            for (alloc, n) in ops {
                if alloc || live.is_empty() {
                    if let Ok(b) = pool.allocate(n) {
                        live.push(b);
                    }
                } else {
                    let b = live.swap_remove(n % live.len());
                    pool.deallocate(b).unwrap();
                }
                let mut ranges: Vec<(u64, u64)> =
                    live.iter().map(|b| (b.offset, b.offset + b.size)).collect();
                ranges.sort();
                for pair in ranges.windows(2) {
                    prop_assert!(pair[0].1 <= pair[1].0);
                }
            }
        }
    }
}
