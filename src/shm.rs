//! Low-level POSIX shared memory segments
//!
//! A [`Segment`] is a named shm object mapped read/write into this process.
//! The owner creates it exclusively and unlinks it on drop; peers open an
//! existing one and only unmap. Everything stored inside a segment addresses
//! other parts of the segment by offset, so the mapping address is free to
//! differ between processes.

use crate::error::{LinkError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

const SHM_PREFIX: &str = "/shmlink_";
const MAX_NAME_LEN: usize = 255 - SHM_PREFIX.len();

/// Mapping options for a segment
#[derive(Clone, Debug, Default)]
pub struct SegmentOptions {
    /// Preferred virtual address for the mapping.
    ///
    /// Passed to the kernel as a hint only; if the range is taken the
    /// mapping lands elsewhere and [`Segment::mapped_at_hint`] reports
    /// `false`.
    pub address_hint: Option<usize>,
}

/// Handle to a mapped shared memory segment
pub struct Segment {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    is_owner: bool,
    hinted: bool,
}

// SAFETY: the mapping itself is plain memory; every structure placed in it
// synchronizes through atomics.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

fn os_name(name: &str) -> Result<CString> {
    if name.is_empty() || name.contains('/') {
        return Err(LinkError::InvalidName(name.to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(LinkError::NameTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }
    CString::new(format!("{}{}", SHM_PREFIX, name))
        .map_err(|_| LinkError::InvalidName(name.to_string()))
}

/// Map `size` bytes of `fd` read/write, honoring an optional address hint
fn map_shared(fd: &OwnedFd, size: usize, hint: Option<usize>) -> Result<(NonNull<u8>, bool)> {
    let wanted = hint.unwrap_or(0) as *mut std::ffi::c_void;
    let addr = unsafe {
        mmap(
            wanted,
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| LinkError::Mmap(e.into()))?
    };
    let addr = NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| LinkError::Mmap(std::io::Error::other("mmap returned null")))?;
    let hinted = hint.map_or(false, |h| addr.as_ptr() as usize == h);
    Ok((addr, hinted))
}

impl Segment {
    /// Create a new shared memory segment
    ///
    /// Fails with [`LinkError::AlreadyExists`] if the name is taken. The new
    /// segment is zero filled.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::create_with(name, size, &SegmentOptions::default())
    }

    /// Create a new shared memory segment with mapping options
    pub fn create_with(name: &str, size: usize, options: &SegmentOptions) -> Result<Self> {
        if size == 0 {
            return Err(LinkError::InvalidSize {
                got: size,
                reason: "segment size must be non-zero",
            });
        }
        let c_name = os_name(name)?;

        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        )
        .map_err(|e| match e {
            Errno::EXIST => LinkError::AlreadyExists {
                name: name.to_string(),
            },
            other => LinkError::ShmCreate {
                name: name.to_string(),
                source: other.into(),
            },
        })?;

        // From here on a failure must not leave the name behind
        let mapped = ftruncate(&fd, size as u64)
            .map_err(|e| LinkError::Truncate(e.into()))
            .and_then(|_| map_shared(&fd, size, options.address_hint));
        let (addr, hinted) = match mapped {
            Ok(m) => m,
            Err(e) => {
                let _ = shm_unlink(c_name.as_c_str());
                return Err(e);
            }
        };

        tracing::debug!(name, size, hinted, "created shared memory segment");

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: true,
            hinted,
        })
    }

    /// Open an existing shared memory segment
    ///
    /// Fails with [`LinkError::NotFound`] if nobody created it.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(name, &SegmentOptions::default())
    }

    /// Open an existing shared memory segment with mapping options
    pub fn open_with(name: &str, options: &SegmentOptions) -> Result<Self> {
        let c_name = os_name(name)?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            match e {
                Errno::NOENT => LinkError::NotFound {
                    name: name.to_string(),
                },
                other => LinkError::ShmOpen {
                    name: name.to_string(),
                    source: other.into(),
                },
            }
        })?;

        // Get size from file
        let stat = rustix::fs::fstat(&fd).map_err(|e| LinkError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;
        if size == 0 {
            // Owner has not sized it yet
            return Err(LinkError::InvalidSize {
                got: 0,
                reason: "segment has not been initialized",
            });
        }

        let (addr, hinted) = map_shared(&fd, size, options.address_hint)?;

        tracing::debug!(name, size, hinted, "opened shared memory segment");

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: false,
            hinted,
        })
    }

    /// Remove a named segment without mapping it.
    ///
    /// Used to clear an object left behind by an owner that crashed. Returns
    /// `true` if something was removed.
    pub fn unlink(name: &str) -> Result<bool> {
        let c_name = os_name(name)?;
        match shm_unlink(c_name.as_c_str()) {
            Ok(()) => Ok(true),
            Err(Errno::NOENT) => Ok(false),
            Err(e) => Err(LinkError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            }),
        }
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of shared memory region
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the name of shared memory
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this handle owns the shared memory
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Whether the mapping landed on the requested address hint
    #[inline]
    pub fn mapped_at_hint(&self) -> bool {
        self.hinted
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = munmap(self.addr.as_ptr().cast(), self.size) {
                tracing::warn!(name = %self.name, error = %e, "munmap failed");
            }
        }

        if self.is_owner {
            if let Ok(c_name) = os_name(&self.name) {
                match shm_unlink(c_name.as_c_str()) {
                    Ok(()) | Err(Errno::NOENT) => {
                        tracing::debug!(name = %self.name, "unlinked shared memory segment")
                    }
                    Err(e) => tracing::warn!(name = %self.name, error = %e, "shm_unlink failed"),
                }
            }
        }
    }
}

/// Round `n` up to a multiple of `align` (a power of two)
#[inline(always)]
pub(crate) const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
pub(crate) fn test_name(tag: &str) -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(0);
    format!(
        "t_{}_{}_{}",
        tag,
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_open() {
        let name = test_name("shm_create");
        let size = 4096;

        let shm1 = Segment::create(&name, size).unwrap();
        assert!(shm1.is_owner());
        assert_eq!(shm1.size(), size);

        unsafe {
            std::ptr::write(shm1.as_ptr(), 42u8);
        }

        // Open from another "process"
        let shm2 = Segment::open(&name).unwrap();
        assert!(!shm2.is_owner());
        assert_eq!(shm2.size(), size);

        let val = unsafe { std::ptr::read(shm2.as_ptr()) };
        assert_eq!(val, 42u8);

        drop(shm2);
        drop(shm1);
    }

    #[test]
    fn test_create_twice_fails() {
        let name = test_name("shm_twice");
        let _owner = Segment::create(&name, 4096).unwrap();
        let err = Segment::create(&name, 4096).err().unwrap();
        assert!(matches!(err, LinkError::AlreadyExists { .. }));
    }

    #[test]
    fn test_open_missing_fails() {
        let err = Segment::open(&test_name("shm_missing")).err().unwrap();
        assert!(matches!(err, LinkError::NotFound { .. }));
    }

    #[test]
    fn test_owner_drop_unlinks() {
        let name = test_name("shm_unlink");
        drop(Segment::create(&name, 4096).unwrap());
        assert!(matches!(
            Segment::open(&name),
            Err(LinkError::NotFound { .. })
        ));
        assert!(!Segment::unlink(&name).unwrap());
    }

    #[test]
    fn test_bad_names() {
        assert!(matches!(
            Segment::create("a/b", 64),
            Err(LinkError::InvalidName(_))
        ));
        let long = "x".repeat(300);
        assert!(matches!(
            Segment::create(&long, 64),
            Err(LinkError::NameTooLong { .. })
        ));
        assert!(matches!(
            Segment::create(&test_name("zero"), 0),
            Err(LinkError::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 8), 72);
    }
}
