//! Shared value region - a [`Value`] tree laid out inside a shared segment
//!
//! The owner copies a process-local value into a bump-allocated arena once,
//! then flips the region to `Ready`. From then on the arena is immutable and
//! a peer can walk it in place through [`SharedNode`] or copy it back out
//! with [`SharedRegion::to_local`].
//!
//! ```text
//! [RegionHeader][arena ........................................]
//!                node := tag:u8 pad:[u8;3] len:u32 payload (8-aligned)
//! ```
//!
//! Payload by tag:
//! - scalars: one 8-byte little-endian word
//! - string: `len` UTF-8 bytes
//! - vec/mat: `len` f32 components
//! - vector/array: `len` u64 child offsets
//! - map/table: `len` pairs of (key string offset, value offset), keys ascending
//!
//! All references are arena offsets and every child sits before its parent,
//! so nodes need no per-node reference count and the peer never has to
//! translate addresses. The whole arena is released with the mapping.

use crate::error::{LinkError, Result};
use crate::shm::{align_up, Segment, SegmentOptions};
use crate::value::{Tag, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

const REGION_MAGIC: u32 = 0x5256_414C; // "RVAL"
const REGION_VERSION: u32 = 1;
const NODE_HEADER: usize = 8;
const NO_ROOT: u64 = u64::MAX;

/// How the owner builds the arena
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BuildMode {
    /// Bounds check every allocation, then verify the arena matches
    /// [`SharedRegion::required_size`]
    #[default]
    Checked,
    /// Size the whole tree up front, then bump without per-node checks
    Fast,
}

/// Lifecycle of a region
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionState {
    Empty = 0,
    Building = 1,
    Ready = 2,
    TornDown = 3,
}

impl RegionState {
    fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(RegionState::Empty),
            1 => Some(RegionState::Building),
            2 => Some(RegionState::Ready),
            3 => Some(RegionState::TornDown),
            _ => None,
        }
    }
}

#[repr(C)]
struct RegionHeader {
    magic: AtomicU32,
    version: u32,
    state: AtomicU32,
    build_mode: AtomicU32,
    arena_offset: u64,
    arena_capacity: u64,
    used: AtomicU64,
    root: AtomicU64,
    node_count: AtomicU64,
}

/// A named segment holding one published value
pub struct SharedRegion {
    shm: Segment,
    header: *const RegionHeader,
    arena: *mut u8,
    capacity: usize,
}

// SAFETY: the arena is written by the owner only before `Ready` is released
// and is immutable afterwards.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create an empty region with `arena_size` bytes of node storage
    pub fn create(name: &str, arena_size: usize) -> Result<Self> {
        Self::create_with(name, arena_size, &SegmentOptions::default())
    }

    /// Create an empty region with mapping options
    pub fn create_with(name: &str, arena_size: usize, options: &SegmentOptions) -> Result<Self> {
        if arena_size < NODE_HEADER {
            return Err(LinkError::InvalidSize {
                got: arena_size,
                reason: "arena must hold at least one node",
            });
        }
        let arena_offset = align_up(std::mem::size_of::<RegionHeader>(), 64);
        let capacity = align_up(arena_size, 8);
        let shm = Segment::create_with(name, arena_offset + capacity, options)?;
        let base = shm.as_ptr();
        let header = base as *mut RegionHeader;

        unsafe {
            std::ptr::write(
                header,
                RegionHeader {
                    magic: AtomicU32::new(0),
                    version: REGION_VERSION,
                    state: AtomicU32::new(RegionState::Empty as u32),
                    build_mode: AtomicU32::new(0),
                    arena_offset: arena_offset as u64,
                    arena_capacity: capacity as u64,
                    used: AtomicU64::new(0),
                    root: AtomicU64::new(NO_ROOT),
                    node_count: AtomicU64::new(0),
                },
            );
            (*header).magic.store(REGION_MAGIC, Ordering::Release);
        }

        tracing::debug!(name, capacity, "created shared region");

        Ok(Self {
            arena: unsafe { base.add(arena_offset) },
            shm,
            header,
            capacity,
        })
    }

    /// Attach to a published region
    ///
    /// Fails with [`LinkError::RegionNotReady`] until the owner has finished
    /// building it.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(name, &SegmentOptions::default())
    }

    /// Attach to a published region with mapping options
    pub fn open_with(name: &str, options: &SegmentOptions) -> Result<Self> {
        let shm = Segment::open_with(name, options)?;
        if shm.size() < std::mem::size_of::<RegionHeader>() {
            return Err(LinkError::LayoutMismatch {
                expected: std::mem::size_of::<RegionHeader>(),
                got: shm.size(),
            });
        }
        let base = shm.as_ptr();
        let header = base as *const RegionHeader;
        let h = unsafe { &*header };

        let magic = h.magic.load(Ordering::Acquire);
        if magic != REGION_MAGIC {
            return Err(LinkError::InvalidMagic {
                expected: REGION_MAGIC,
                got: magic,
            });
        }
        if h.version != REGION_VERSION {
            return Err(LinkError::VersionMismatch {
                expected: REGION_VERSION,
                got: h.version,
            });
        }
        let state = h.state.load(Ordering::Acquire);
        if state != RegionState::Ready as u32 {
            return Err(LinkError::RegionNotReady(state));
        }

        let arena_offset = h.arena_offset as usize;
        let capacity = h.arena_capacity as usize;
        if arena_offset + capacity > shm.size() {
            return Err(LinkError::LayoutMismatch {
                expected: arena_offset + capacity,
                got: shm.size(),
            });
        }

        tracing::debug!(name, capacity, "opened shared region");

        Ok(Self {
            arena: unsafe { base.add(arena_offset) },
            shm,
            header,
            capacity,
        })
    }

    #[inline(always)]
    fn header(&self) -> &RegionHeader {
        unsafe { &*self.header }
    }

    /// Arena bytes needed to hold `value`, counting shared subtrees once
    pub fn required_size(value: &Value) -> usize {
        let mut seen = HashSet::new();
        measure(value, &mut seen)
    }

    /// Copy `value` into the arena and mark the region ready
    ///
    /// Owner only, and only once: a second call fails with
    /// [`LinkError::RegionAlreadyBuilt`]. If the copy fails the region drops
    /// back to `Empty` with nothing published.
    pub fn publish(&self, value: &Value, mode: BuildMode) -> Result<()> {
        if !self.shm.is_owner() {
            return Err(LinkError::RegionAlreadyBuilt);
        }
        let header = self.header();
        header
            .state
            .compare_exchange(
                RegionState::Empty as u32,
                RegionState::Building as u32,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .map_err(|_| LinkError::RegionAlreadyBuilt)?;

        let built = self.build(value, mode);
        match built {
            Ok((root, used, nodes)) => {
                header.build_mode.store(mode as u32, Ordering::Relaxed);
                header.used.store(used as u64, Ordering::Relaxed);
                header.root.store(root, Ordering::Relaxed);
                header.node_count.store(nodes, Ordering::Relaxed);
                header
                    .state
                    .store(RegionState::Ready as u32, Ordering::Release);
                tracing::debug!(name = self.shm.name(), used, nodes, ?mode, "shared region ready");
                Ok(())
            }
            Err(e) => {
                header
                    .state
                    .store(RegionState::Empty as u32, Ordering::Release);
                Err(e)
            }
        }
    }

    fn build(&self, value: &Value, mode: BuildMode) -> Result<(u64, usize, u64)> {
        if mode == BuildMode::Fast {
            let needed = Self::required_size(value);
            if needed > self.capacity {
                return Err(LinkError::ArenaExhausted {
                    requested: needed,
                    remaining: self.capacity,
                });
            }
        }
        let mut writer = ArenaWriter {
            base: self.arena,
            capacity: self.capacity,
            cursor: 0,
            mode,
            seen: HashMap::new(),
            nodes: 0,
        };
        let root = writer.write(value)?;
        if mode == BuildMode::Checked && writer.cursor != Self::required_size(value) {
            return Err(LinkError::CorruptRegion {
                offset: writer.cursor as u64,
                reason: "arena size disagrees with measured size",
            });
        }
        Ok((root, writer.cursor, writer.nodes))
    }

    /// Current lifecycle state
    pub fn state(&self) -> RegionState {
        RegionState::from_u32(self.header().state.load(Ordering::Acquire))
            .unwrap_or(RegionState::TornDown)
    }

    fn ready_arena(&self) -> Result<&[u8]> {
        let header = self.header();
        let state = header.state.load(Ordering::Acquire);
        if state != RegionState::Ready as u32 {
            return Err(LinkError::RegionNotReady(state));
        }
        let used = header.used.load(Ordering::Relaxed) as usize;
        if used > self.capacity {
            return Err(LinkError::CorruptRegion {
                offset: used as u64,
                reason: "used bytes exceed arena",
            });
        }
        Ok(unsafe { std::slice::from_raw_parts(self.arena, used) })
    }

    /// Zero-copy view of the root node
    pub fn root(&self) -> Result<SharedNode<'_>> {
        let arena = self.ready_arena()?;
        let root = self.header().root.load(Ordering::Relaxed);
        SharedNode::at(arena, root)
    }

    /// Copy the tree into process-local memory
    ///
    /// The result does not borrow the mapping. Nodes shared inside the arena
    /// come back as shared `Arc`s.
    pub fn to_local(&self) -> Result<Value> {
        let arena = self.ready_arena()?;
        let root = self.header().root.load(Ordering::Relaxed);
        let mut memo = HashMap::new();
        copy_out(arena, root, &mut memo, 0)
    }

    /// Mode the region was built with
    pub fn build_mode(&self) -> BuildMode {
        match self.header().build_mode.load(Ordering::Relaxed) {
            1 => BuildMode::Fast,
            _ => BuildMode::Checked,
        }
    }

    /// Arena bytes in use
    pub fn used(&self) -> usize {
        self.header().used.load(Ordering::Relaxed) as usize
    }

    /// Number of nodes written
    pub fn node_count(&self) -> u64 {
        self.header().node_count.load(Ordering::Relaxed)
    }

    /// Arena capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.shm.is_owner() {
            self.header()
                .state
                .store(RegionState::TornDown as u32, Ordering::Release);
            tracing::debug!(name = self.shm.name(), "shared region torn down");
        }
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("used", &self.used())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Create a region sized for `value`, copy it in and publish it
pub fn deep_copy_to_shared(name: &str, value: &Value, mode: BuildMode) -> Result<SharedRegion> {
    let region = SharedRegion::create(name, SharedRegion::required_size(value).max(NODE_HEADER))?;
    region.publish(value, mode)?;
    Ok(region)
}

/// Copy a published region back into an ordinary [`Value`]
pub fn deep_copy_to_local(region: &SharedRegion) -> Result<Value> {
    region.to_local()
}

fn payload_len(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::String(s) => align_up(s.len(), 8),
        Value::Vector(s) | Value::Array(s) => 8 * s.len(),
        Value::Map(d) | Value::Table(d) => 16 * d.len(),
        other => match other.as_floats() {
            Some(f) => align_up(4 * f.len(), 8),
            None => 8,
        },
    }
}

fn measure(value: &Value, seen: &mut HashSet<(usize, Tag)>) -> usize {
    if let Some(id) = value.node_id() {
        if !seen.insert((id, value.tag())) {
            return 0;
        }
    }
    let own = NODE_HEADER + payload_len(value);
    match value {
        Value::Vector(s) | Value::Array(s) => own + s.iter().map(|v| measure(v, seen)).sum::<usize>(),
        Value::Map(d) | Value::Table(d) => {
            own + d
                .iter()
                .map(|(k, v)| NODE_HEADER + align_up(k.len(), 8) + measure(v, seen))
                .sum::<usize>()
        }
        _ => own,
    }
}

struct ArenaWriter {
    base: *mut u8,
    capacity: usize,
    cursor: usize,
    mode: BuildMode,
    seen: HashMap<(usize, Tag), u64>,
    nodes: u64,
}

impl ArenaWriter {
    /// Bump-allocate one node and write its header
    fn node(&mut self, tag: Tag, len: usize, payload: usize) -> Result<usize> {
        let size = NODE_HEADER + payload;
        if self.mode == BuildMode::Checked && size > self.capacity - self.cursor {
            return Err(LinkError::ArenaExhausted {
                requested: size,
                remaining: self.capacity - self.cursor,
            });
        }
        debug_assert!(self.cursor + size <= self.capacity);
        let offset = self.cursor;
        self.cursor += size;
        self.nodes += 1;

        let mut head = [0u8; NODE_HEADER];
        head[0] = tag as u8;
        head[4..8].copy_from_slice(&(len as u32).to_le_bytes());
        self.put(offset, &head);
        Ok(offset)
    }

    #[inline]
    fn put(&mut self, offset: usize, bytes: &[u8]) {
        // Fast mode relies on the up-front size check
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset), bytes.len());
        }
    }

    fn string(&mut self, s: &str) -> Result<u64> {
        let offset = self.node(Tag::String, s.len(), align_up(s.len(), 8))?;
        self.put(offset + NODE_HEADER, s.as_bytes());
        Ok(offset as u64)
    }

    fn write(&mut self, value: &Value) -> Result<u64> {
        let key = value.node_id().map(|id| (id, value.tag()));
        if let Some(found) = key.and_then(|k| self.seen.get(&k)) {
            return Ok(*found);
        }

        let offset = match value {
            Value::Null => self.node(Tag::Null, 0, 0)? as u64,
            Value::String(s) => self.string(s)?,
            Value::Vector(items) | Value::Array(items) => {
                let children = items
                    .iter()
                    .map(|v| self.write(v))
                    .collect::<Result<Vec<u64>>>()?;
                let offset = self.node(value.tag(), children.len(), 8 * children.len())?;
                for (i, child) in children.iter().enumerate() {
                    self.put(offset + NODE_HEADER + 8 * i, &child.to_le_bytes());
                }
                offset as u64
            }
            Value::Map(entries) | Value::Table(entries) => {
                let mut pairs = Vec::with_capacity(entries.len());
                for (k, v) in entries.iter() {
                    let key = self.string(k)?;
                    pairs.push((key, self.write(v)?));
                }
                let offset = self.node(value.tag(), pairs.len(), 16 * pairs.len())?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    let at = offset + NODE_HEADER + 16 * i;
                    self.put(at, &k.to_le_bytes());
                    self.put(at + 8, &v.to_le_bytes());
                }
                offset as u64
            }
            other => match other.as_floats() {
                Some(floats) => {
                    let offset =
                        self.node(other.tag(), floats.len(), align_up(4 * floats.len(), 8))?;
                    self.put(offset + NODE_HEADER, bytemuck::cast_slice(floats));
                    offset as u64
                }
                None => {
                    let offset = self.node(other.tag(), 0, 8)?;
                    self.put(offset + NODE_HEADER, &scalar_word(other).to_le_bytes());
                    offset as u64
                }
            },
        };

        if let Some(k) = key {
            self.seen.insert(k, offset);
        }
        Ok(offset)
    }
}

fn scalar_word(value: &Value) -> u64 {
    match *value {
        Value::Bool(b) => b as u64,
        Value::Int8(v) => v as i64 as u64,
        Value::Int16(v) => v as i64 as u64,
        Value::Int32(v) => v as i64 as u64,
        Value::Int64(v) => v as u64,
        Value::UInt8(v) => v.into(),
        Value::UInt16(v) => v.into(),
        Value::UInt32(v) => v.into(),
        Value::UInt64(v) => v,
        Value::Float32(v) => v.to_bits().into(),
        Value::Float64(v) => v.to_bits(),
        _ => 0,
    }
}

fn corrupt(offset: u64, reason: &'static str) -> LinkError {
    LinkError::CorruptRegion { offset, reason }
}

fn read_u64(arena: &[u8], at: usize) -> Option<u64> {
    let bytes = arena.get(at..at.checked_add(8)?)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Read-only view of one node inside a published region
///
/// Borrowing the region keeps the mapping alive for the view's lifetime.
#[derive(Clone, Copy)]
pub struct SharedNode<'a> {
    arena: &'a [u8],
    offset: usize,
    tag: Tag,
    len: usize,
}

impl<'a> SharedNode<'a> {
    /// Validate the node at `offset` and its payload bounds
    fn at(arena: &'a [u8], offset: u64) -> Result<Self> {
        if offset % 8 != 0 {
            return Err(corrupt(offset, "misaligned node"));
        }
        let start = usize::try_from(offset).map_err(|_| corrupt(offset, "offset out of range"))?;
        let head = arena
            .get(start..start.saturating_add(NODE_HEADER))
            .ok_or_else(|| corrupt(offset, "node header outside arena"))?;
        let tag = Tag::from_u8(head[0]).ok_or_else(|| corrupt(offset, "unknown tag"))?;
        let len = u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as usize;

        let payload = match tag {
            Tag::Null => 0,
            Tag::String => align_up(len, 8),
            Tag::Vector | Tag::Array => len.saturating_mul(8),
            Tag::Map | Tag::Table => len.saturating_mul(16),
            t => match t.float_count() {
                Some(n) if n == len => align_up(4 * n, 8),
                Some(_) => return Err(corrupt(offset, "wrong component count")),
                None => 8,
            },
        };
        if start + NODE_HEADER + payload > arena.len() {
            return Err(corrupt(offset, "payload outside arena"));
        }
        Ok(Self {
            arena,
            offset: start,
            tag,
            len,
        })
    }

    /// Follow a child reference; children always precede their parent
    fn child(&self, child: u64) -> Result<SharedNode<'a>> {
        if child >= self.offset as u64 {
            return Err(corrupt(child, "forward reference"));
        }
        SharedNode::at(self.arena, child)
    }

    #[inline]
    fn payload(&self) -> usize {
        self.offset + NODE_HEADER
    }

    fn word(&self) -> u64 {
        read_u64(self.arena, self.payload()).unwrap_or(0)
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Children for containers, bytes for strings, components for math
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_null(&self) -> bool {
        self.tag == Tag::Null
    }

    pub fn as_bool(&self) -> Option<bool> {
        (self.tag == Tag::Bool).then(|| self.word() != 0)
    }

    /// Any integer node that fits an `i64`
    pub fn as_i64(&self) -> Option<i64> {
        let w = self.word();
        match self.tag {
            Tag::Int8 | Tag::Int16 | Tag::Int32 | Tag::Int64 => Some(w as i64),
            Tag::UInt8 | Tag::UInt16 | Tag::UInt32 => Some(w as i64),
            Tag::UInt64 => i64::try_from(w).ok(),
            _ => None,
        }
    }

    /// Any numeric node widened to `f64`
    pub fn as_f64(&self) -> Option<f64> {
        match self.tag {
            Tag::Float32 => Some(f32::from_bits(self.word() as u32).into()),
            Tag::Float64 => Some(f64::from_bits(self.word())),
            Tag::UInt64 => Some(self.word() as f64),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    /// String contents, borrowed from the mapping
    pub fn as_str(&self) -> Option<&'a str> {
        if self.tag != Tag::String {
            return None;
        }
        let bytes = &self.arena[self.payload()..self.payload() + self.len];
        std::str::from_utf8(bytes).ok()
    }

    /// Math components, borrowed from the mapping
    pub fn as_floats(&self) -> Option<&'a [f32]> {
        self.tag.float_count()?;
        let bytes = &self.arena[self.payload()..self.payload() + 4 * self.len];
        bytemuck::try_cast_slice(bytes).ok()
    }

    /// Element `index` of a vector or array
    pub fn get(&self, index: usize) -> Option<SharedNode<'a>> {
        if !matches!(self.tag, Tag::Vector | Tag::Array) || index >= self.len {
            return None;
        }
        let child = read_u64(self.arena, self.payload() + 8 * index)?;
        self.child(child).ok()
    }

    fn entry(&self, index: usize) -> Option<(&'a str, SharedNode<'a>)> {
        let at = self.payload() + 16 * index;
        let key = self.child(read_u64(self.arena, at)?).ok()?;
        let value = self.child(read_u64(self.arena, at + 8)?).ok()?;
        Some((key.as_str()?, value))
    }

    /// Entry of a map or table by key (binary search)
    pub fn get_key(&self, key: &str) -> Option<SharedNode<'a>> {
        if !matches!(self.tag, Tag::Map | Tag::Table) {
            return None;
        }
        let (mut lo, mut hi) = (0, self.len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (k, v) = self.entry(mid)?;
            match k.cmp(key) {
                std::cmp::Ordering::Equal => return Some(v),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        None
    }

    /// Elements of a vector or array; empty for other tags
    pub fn iter(&self) -> impl Iterator<Item = SharedNode<'a>> + '_ {
        let n = if matches!(self.tag, Tag::Vector | Tag::Array) {
            self.len
        } else {
            0
        };
        (0..n).filter_map(move |i| self.get(i))
    }

    /// Entries of a map or table in key order; empty for other tags
    pub fn entries(&self) -> impl Iterator<Item = (&'a str, SharedNode<'a>)> + '_ {
        let n = if matches!(self.tag, Tag::Map | Tag::Table) {
            self.len
        } else {
            0
        };
        (0..n).filter_map(move |i| self.entry(i))
    }

    /// Copy this subtree into process-local memory
    pub fn to_value(&self) -> Result<Value> {
        let mut memo = HashMap::new();
        copy_out(self.arena, self.offset as u64, &mut memo, 0)
    }
}

impl fmt::Debug for SharedNode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedNode")
            .field("offset", &self.offset)
            .field("tag", &self.tag)
            .field("len", &self.len)
            .finish()
    }
}

fn copy_out(arena: &[u8], offset: u64, memo: &mut HashMap<u64, Value>, depth: usize) -> Result<Value> {
    if let Some(v) = memo.get(&offset) {
        return Ok(v.clone());
    }
    // Children precede parents, so a valid tree is never deeper than its node count
    if depth > arena.len() / NODE_HEADER {
        return Err(corrupt(offset, "reference cycle"));
    }
    let node = SharedNode::at(arena, offset)?;
    let w = node.word();

    let value = match node.tag {
        Tag::Null => Value::Null,
        Tag::Bool => Value::Bool(w != 0),
        Tag::Int8 => Value::Int8(w as i8),
        Tag::Int16 => Value::Int16(w as i16),
        Tag::Int32 => Value::Int32(w as i32),
        Tag::Int64 => Value::Int64(w as i64),
        Tag::UInt8 => Value::UInt8(w as u8),
        Tag::UInt16 => Value::UInt16(w as u16),
        Tag::UInt32 => Value::UInt32(w as u32),
        Tag::UInt64 => Value::UInt64(w),
        Tag::Float32 => Value::Float32(f32::from_bits(w as u32)),
        Tag::Float64 => Value::Float64(f64::from_bits(w)),
        Tag::String => {
            let s = node
                .as_str()
                .ok_or_else(|| corrupt(offset, "string is not UTF-8"))?;
            Value::String(Arc::from(s))
        }
        Tag::Vec2 | Tag::Vec3 | Tag::Vec4 | Tag::Mat3 | Tag::Mat4x3 | Tag::Mat4 => {
            let at = node.payload();
            let mut floats = [0f32; 16];
            for (i, slot) in floats.iter_mut().take(node.len).enumerate() {
                let b = &arena[at + 4 * i..at + 4 * i + 4];
                *slot = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            }
            math_value(node.tag, &floats)
        }
        Tag::Vector | Tag::Array => {
            let mut items = Vec::with_capacity(node.len);
            for i in 0..node.len {
                let child = read_u64(arena, node.payload() + 8 * i)
                    .ok_or_else(|| corrupt(offset, "child table outside arena"))?;
                if child >= offset {
                    return Err(corrupt(child, "forward reference"));
                }
                items.push(copy_out(arena, child, memo, depth + 1)?);
            }
            if node.tag == Tag::Vector {
                Value::Vector(Arc::new(items))
            } else {
                Value::Array(Arc::new(items))
            }
        }
        Tag::Map | Tag::Table => {
            let mut entries = BTreeMap::new();
            for i in 0..node.len {
                let at = node.payload() + 16 * i;
                let (k, v) = read_u64(arena, at)
                    .zip(read_u64(arena, at + 8))
                    .ok_or_else(|| corrupt(offset, "entry table outside arena"))?;
                if k >= offset || v >= offset {
                    return Err(corrupt(offset, "forward reference"));
                }
                let key = SharedNode::at(arena, k)?
                    .as_str()
                    .ok_or_else(|| corrupt(k, "map key is not a string"))?
                    .to_string();
                let value = copy_out(arena, v, memo, depth + 1)?;
                if entries.insert(key.clone(), value).is_some() {
                    return Err(LinkError::DuplicateKey(key));
                }
            }
            if node.tag == Tag::Map {
                Value::Map(Arc::new(entries))
            } else {
                Value::Table(Arc::new(entries))
            }
        }
    };

    if node.tag.is_container() || node.tag == Tag::String {
        memo.insert(offset, value.clone());
    }
    Ok(value)
}

fn math_value(tag: Tag, f: &[f32; 16]) -> Value {
    fn take<const N: usize>(f: &[f32; 16]) -> [f32; N] {
        let mut out = [0f32; N];
        out.copy_from_slice(&f[..N]);
        out
    }
    match tag {
        Tag::Vec2 => Value::Vec2(take(f)),
        Tag::Vec3 => Value::Vec3(take(f)),
        Tag::Vec4 => Value::Vec4(take(f)),
        Tag::Mat3 => Value::Mat3(take(f)),
        Tag::Mat4x3 => Value::Mat4x3(take(f)),
        _ => Value::Mat4(*f),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::test_name;

    fn scene() -> Value {
        let mesh = Value::table()
            .with("m1", Value::from("cube"))
            .and_then(|t| t.with("m2", Value::Mat4([1.0; 16])))
            .unwrap_or_default();
        let layer = |z: i32| -> Value {
            vec![
                Value::Int32(z),
                mesh.clone(),
                Value::Vec3([z as f32, 0.5, -1.0]),
            ]
            .into()
        };
        let mut root = BTreeMap::new();
        root.insert("name".to_string(), Value::from("level-1"));
        root.insert("layers".to_string(), Value::from(vec![layer(0), layer(1)]));
        root.insert("visible".to_string(), Value::Bool(true));
        root.insert("mass".to_string(), Value::Float64(12.5));
        root.insert("id".to_string(), Value::UInt64(u64::MAX));
        root.insert("offset".to_string(), Value::Int8(-7));
        root.insert("empty".to_string(), Value::map());
        root.insert("nothing".to_string(), Value::Null);
        Value::from(root)
    }

    #[test]
    fn test_round_trip_outlives_region() {
        let original = scene();
        for mode in [BuildMode::Checked, BuildMode::Fast] {
            let name = test_name("sv_round");
            let copy = {
                let _owner = deep_copy_to_shared(&name, &original, mode).unwrap();
                let peer = SharedRegion::open(&name).unwrap();
                assert_eq!(peer.build_mode(), mode);
                deep_copy_to_local(&peer).unwrap()
            };
            assert_eq!(copy, original);
        }
    }

    #[test]
    fn test_shared_subtrees_written_once() {
        let leaf: Value = (0..100).map(Value::Int64).collect();
        let twice: Value = vec![leaf.clone(), leaf.clone()].into();
        let once: Value = vec![leaf.clone()].into();
        assert!(SharedRegion::required_size(&twice) < 2 * SharedRegion::required_size(&once));

        let name = test_name("sv_dedup");
        let region = deep_copy_to_shared(&name, &twice, BuildMode::Checked).unwrap();
        assert_eq!(region.used(), SharedRegion::required_size(&twice));

        let local = region.to_local().unwrap();
        let items = local.as_seq().unwrap();
        assert!(items[0].ptr_eq(&items[1]));
    }

    #[test]
    fn test_math_values_in_place() {
        let components: Vec<f32> = (1..=16).map(|i| i as f32 * 0.25).collect();
        let take = |n: usize| components[..n].to_vec();
        let maths = vec![
            Value::Vec2([0.25, 0.5]),
            Value::Vec3([0.25, 0.5, 0.75]),
            Value::Vec4([0.25, 0.5, 0.75, 1.0]),
            Value::Mat3(std::array::from_fn(|i| components[i])),
            Value::Mat4x3(std::array::from_fn(|i| components[i])),
            Value::Mat4(std::array::from_fn(|i| components[i])),
        ];
        let original = Value::from(maths.clone());

        for mode in [BuildMode::Checked, BuildMode::Fast] {
            let name = test_name("sv_math");
            let owner = deep_copy_to_shared(&name, &original, mode).unwrap();
            let peer = SharedRegion::open(&name).unwrap();
            let root = peer.root().unwrap();
            assert_eq!(root.len(), maths.len());

            for (node, expected) in root.iter().zip(&maths) {
                let n = expected.tag().float_count().unwrap();
                assert_eq!(node.tag(), expected.tag());
                assert_eq!(node.len(), n);
                assert_eq!(node.as_floats(), Some(&take(n)[..]));
                assert_eq!(node.to_value().unwrap(), *expected);
            }
            assert_eq!(deep_copy_to_local(&peer).unwrap(), original);
            drop(owner);
        }
    }

    #[test]
    fn test_checked_build_fills_measured_size() {
        let original = scene();
        let needed = SharedRegion::required_size(&original);
        for mode in [BuildMode::Checked, BuildMode::Fast] {
            let name = test_name("sv_measured");
            let region = SharedRegion::create(&name, needed).unwrap();
            region.publish(&original, mode).unwrap();
            assert_eq!(region.used(), needed);
            assert_eq!(region.build_mode(), mode);
        }
    }

    #[test]
    fn test_zero_copy_views() {
        let name = test_name("sv_view");
        let _owner = deep_copy_to_shared(&name, &scene(), BuildMode::Fast).unwrap();
        let peer = SharedRegion::open(&name).unwrap();
        let root = peer.root().unwrap();

        assert_eq!(root.tag(), Tag::Map);
        assert_eq!(root.get_key("name").unwrap().as_str(), Some("level-1"));
        assert_eq!(root.get_key("mass").unwrap().as_f64(), Some(12.5));
        assert_eq!(root.get_key("offset").unwrap().as_i64(), Some(-7));
        assert_eq!(root.get_key("id").unwrap().as_i64(), None);
        assert!(root.get_key("nothing").unwrap().is_null());
        assert!(root.get_key("missing").is_none());

        let layers = root.get_key("layers").unwrap();
        assert_eq!(layers.len(), 2);
        let second = layers.get(1).unwrap();
        assert_eq!(second.get(0).unwrap().as_i64(), Some(1));
        assert_eq!(second.get(2).unwrap().as_floats(), Some(&[1.0, 0.5, -1.0][..]));
        let mesh = second.get(1).unwrap();
        assert_eq!(mesh.tag(), Tag::Table);
        let keys: Vec<&str> = mesh.entries().map(|(k, _)| k).collect();
        assert_eq!(keys, ["m1", "m2"]);
        assert_eq!(layers.iter().count(), 2);
        assert_eq!(root.entries().count(), 8);
    }

    #[test]
    fn test_state_machine() {
        let name = test_name("sv_state");
        let region = SharedRegion::create(&name, 4096).unwrap();
        assert_eq!(region.state(), RegionState::Empty);
        assert!(matches!(
            SharedRegion::open(&name),
            Err(LinkError::RegionNotReady(0))
        ));
        assert!(matches!(region.root(), Err(LinkError::RegionNotReady(_))));

        region.publish(&Value::Int32(3), BuildMode::Checked).unwrap();
        assert_eq!(region.state(), RegionState::Ready);
        assert!(matches!(
            region.publish(&Value::Int32(4), BuildMode::Checked),
            Err(LinkError::RegionAlreadyBuilt)
        ));

        let peer = SharedRegion::open(&name).unwrap();
        assert!(matches!(
            peer.publish(&Value::Null, BuildMode::Checked),
            Err(LinkError::RegionAlreadyBuilt)
        ));
        drop(region);
        assert_eq!(peer.state(), RegionState::TornDown);
        assert!(peer.to_local().is_err());
    }

    #[test]
    fn test_exhausted_arena_stays_empty() {
        let name = test_name("sv_small");
        let region = SharedRegion::create(&name, 64).unwrap();
        let big: Value = (0..32).map(Value::Int32).collect();
        for mode in [BuildMode::Checked, BuildMode::Fast] {
            assert!(matches!(
                region.publish(&big, mode),
                Err(LinkError::ArenaExhausted { .. })
            ));
            assert_eq!(region.state(), RegionState::Empty);
        }
        region.publish(&Value::from("ok"), BuildMode::Checked).unwrap();
        assert_eq!(region.to_local().unwrap(), Value::from("ok"));
    }

    #[test]
    fn test_corrupt_root_is_reported() {
        let name = test_name("sv_corrupt");
        let region = deep_copy_to_shared(&name, &Value::from("abc"), BuildMode::Checked).unwrap();
        unsafe { *region.arena = 0xEE };
        assert!(matches!(
            region.to_local(),
            Err(LinkError::CorruptRegion { .. })
        ));
    }
}
