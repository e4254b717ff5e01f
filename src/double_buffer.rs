//! Double buffer - latest-value cell over shared memory
//!
//! Two record slots and an `active` index. The writer fills the inactive
//! slot and publishes it by flipping `active` and bumping `generation`; it
//! never waits for readers. Readers always find a complete record in the
//! active slot.
//!
//! Each slot also carries a sequence counter (odd while being written, as in
//! a seqlock). A reader that is overtaken by two writes during its copy sees
//! the counter move and retries, so a torn record is never returned; a
//! reader racing a single flip just gets the previous record.
//!
//! Only the latest record is kept. This is for "current state", not a queue.

use crate::error::{LinkError, Result};
use crate::shm::{align_up, Segment};
use bytemuck::Pod;
use crossbeam_utils::CachePadded;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

const DB_MAGIC: u32 = 0x4442_5546; // "DBUF"
const DB_VERSION: u32 = 1;

#[repr(C)]
struct DoubleBufferHeader {
    magic: AtomicU32,
    version: u32,
    record_size: u64,
    record_align: u64,
    slots_offset: u64,
    active: CachePadded<AtomicU32>,
    generation: CachePadded<AtomicU64>,
    sequences: [CachePadded<AtomicU64>; 2],
}

/// Latest-value cell holding a `T`
///
/// `T` must be plain old data so both processes can read the bytes as-is.
pub struct DoubleBuffer<T: Pod> {
    shm: Segment,
    header: *const DoubleBufferHeader,
    slots: *mut T,
    last_seen: Cell<u64>,
    _marker: PhantomData<T>,
}

// SAFETY: the slots are synchronized through the header atomics; the handle
// is not Sync because `last_seen` belongs to one reader.
unsafe impl<T: Pod> Send for DoubleBuffer<T> {}

impl<T: Pod> DoubleBuffer<T> {
    /// Create a cell whose both slots start as `initial`
    pub fn create(name: &str, initial: &T) -> Result<Self> {
        let slots_offset = align_up(
            std::mem::size_of::<DoubleBufferHeader>(),
            std::mem::align_of::<T>().max(64),
        );
        let total = slots_offset + 2 * std::mem::size_of::<T>().max(1);
        let shm = Segment::create(name, total)?;
        let base = shm.as_ptr();
        let header = base as *mut DoubleBufferHeader;
        let slots = unsafe { base.add(slots_offset) as *mut T };

        unsafe {
            std::ptr::write(
                header,
                DoubleBufferHeader {
                    magic: AtomicU32::new(0),
                    version: DB_VERSION,
                    record_size: std::mem::size_of::<T>() as u64,
                    record_align: std::mem::align_of::<T>() as u64,
                    slots_offset: slots_offset as u64,
                    active: CachePadded::new(AtomicU32::new(0)),
                    generation: CachePadded::new(AtomicU64::new(0)),
                    sequences: [
                        CachePadded::new(AtomicU64::new(0)),
                        CachePadded::new(AtomicU64::new(0)),
                    ],
                },
            );
            std::ptr::write(slots, *initial);
            std::ptr::write(slots.add(1), *initial);
            (*header).magic.store(DB_MAGIC, Ordering::Release);
        }

        tracing::debug!(name, record_size = std::mem::size_of::<T>(), "created double buffer");

        Ok(Self {
            shm,
            header,
            slots,
            last_seen: Cell::new(0),
            _marker: PhantomData,
        })
    }

    /// Open a cell created by the peer with the same record type
    pub fn open(name: &str) -> Result<Self> {
        let shm = Segment::open(name)?;
        if shm.size() < std::mem::size_of::<DoubleBufferHeader>() {
            return Err(LinkError::LayoutMismatch {
                expected: std::mem::size_of::<DoubleBufferHeader>(),
                got: shm.size(),
            });
        }
        let base = shm.as_ptr();
        let header = base as *const DoubleBufferHeader;

        let slots_offset = unsafe {
            let magic = (*header).magic.load(Ordering::Acquire);
            if magic != DB_MAGIC {
                return Err(LinkError::InvalidMagic {
                    expected: DB_MAGIC,
                    got: magic,
                });
            }
            if (*header).version != DB_VERSION {
                return Err(LinkError::VersionMismatch {
                    expected: DB_VERSION,
                    got: (*header).version,
                });
            }
            let size = (*header).record_size as usize;
            let align = (*header).record_align as usize;
            if size != std::mem::size_of::<T>() || align != std::mem::align_of::<T>() {
                return Err(LinkError::LayoutMismatch {
                    expected: std::mem::size_of::<T>(),
                    got: size,
                });
            }
            (*header).slots_offset as usize
        };
        if slots_offset % std::mem::align_of::<T>() != 0
            || slots_offset + 2 * std::mem::size_of::<T>() > shm.size()
        {
            return Err(LinkError::LayoutMismatch {
                expected: slots_offset + 2 * std::mem::size_of::<T>(),
                got: shm.size(),
            });
        }

        let generation = unsafe { (*header).generation.load(Ordering::Acquire) };

        Ok(Self {
            slots: unsafe { base.add(slots_offset) as *mut T },
            shm,
            header,
            last_seen: Cell::new(generation),
            _marker: PhantomData,
        })
    }

    #[inline(always)]
    fn header(&self) -> &DoubleBufferHeader {
        unsafe { &*self.header }
    }

    /// Publish a new record. Writer only; never blocks.
    pub fn write(&mut self, record: &T) {
        let mut guard = self.write_guard();
        *guard = *record;
    }

    /// Borrow the inactive slot for in-place edits, published on drop.
    ///
    /// The slot starts out as a copy of the current record.
    pub fn write_guard(&mut self) -> WriteGuard<'_, T> {
        let header = self.header();
        let current = header.active.load(Ordering::Relaxed) as usize;
        let target = current ^ 1;
        let sequence = &header.sequences[target];

        // Odd: slot under construction
        sequence.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);

        unsafe {
            let current_record = std::ptr::read_volatile(self.slots.add(current));
            std::ptr::write_volatile(self.slots.add(target), current_record);
        }

        WriteGuard {
            slot: unsafe { &mut *self.slots.add(target) },
            header,
            target,
        }
    }

    /// Copy of the current record
    pub fn read(&self) -> T {
        self.read_slot(|slot| unsafe { std::ptr::read_volatile(slot) })
    }

    /// Run `f` on the current record in place, without copying it out.
    ///
    /// `f` may run more than once if the writer laps the reader, and a run
    /// that overlapped a write is thrown away. It should be a pure function
    /// of the record.
    pub fn read_with<R, F>(&self, f: F) -> R
    where
        F: Fn(&T) -> R,
    {
        self.read_slot(|slot| f(unsafe { &*slot }))
    }

    /// Seqlock read loop over the active slot
    fn read_slot<R>(&self, mut visit: impl FnMut(*const T) -> R) -> R {
        let header = self.header();
        loop {
            let generation = header.generation.load(Ordering::Acquire);
            let index = header.active.load(Ordering::Acquire) as usize;
            let sequence = &header.sequences[index];

            let before = sequence.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let result = visit(unsafe { self.slots.add(index) } as *const T);
            fence(Ordering::Acquire);

            if sequence.load(Ordering::Relaxed) == before {
                self.last_seen.set(generation);
                return result;
            }
            std::hint::spin_loop();
        }
    }

    /// Copy the current record into `out` if a write happened since this
    /// handle last looked. Returns whether `out` was updated.
    pub fn try_read(&self, out: &mut T) -> bool {
        if !self.has_update() {
            return false;
        }
        *out = self.read();
        true
    }

    /// Whether the generation advanced since this handle last read
    pub fn has_update(&self) -> bool {
        self.generation() != self.last_seen.get()
    }

    /// Number of records published so far
    pub fn generation(&self) -> u64 {
        self.header().generation.load(Ordering::Acquire)
    }

    /// Name of the backing segment
    pub fn name(&self) -> &str {
        self.shm.name()
    }
}

/// In-place access to the slot being written; publishes on drop
pub struct WriteGuard<'a, T: Pod> {
    slot: &'a mut T,
    header: &'a DoubleBufferHeader,
    target: usize,
}

impl<T: Pod> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.slot
    }
}

impl<T: Pod> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.slot
    }
}

impl<T: Pod> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        // Even again: slot complete
        self.header.sequences[self.target].fetch_add(1, Ordering::Release);
        self.header
            .active
            .store(self.target as u32, Ordering::Release);
        self.header.generation.fetch_add(1, Ordering::Release);
    }
}
