//! Error types for shmlink

use std::io;
use thiserror::Error;

/// Result type for shmlink operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Coarse classification of a [`LinkError`].
///
/// Capacity errors are expected and recoverable; everything else is fatal to
/// the call that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad name, bad size, object already present or missing
    Configuration,
    /// Ring full, pool or arena exhausted
    Capacity,
    /// Mismatched build or corrupted segment
    Protocol,
    /// Encoding into or decoding from a byte buffer failed
    Serialization,
    /// The operating system refused a shm/mmap call
    Os,
}

/// Errors that can occur in shmlink operations
#[derive(Debug, Error)]
pub enum LinkError {
    /// A shared memory object with this name already exists
    #[error("Shared memory '{name}' already exists")]
    AlreadyExists { name: String },

    /// No shared memory object with this name exists
    #[error("Shared memory '{name}' does not exist")]
    NotFound { name: String },

    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Name too long
    #[error("Name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Name contains a slash or a NUL byte
    #[error("Invalid shared memory name '{0}'")]
    InvalidName(String),

    /// Ring capacity must be a power of two
    #[error("Capacity must be a non-zero power of two, got {0}")]
    NotPowerOfTwo(usize),

    /// A requested size is unusable
    #[error("Invalid size {got}: {reason}")]
    InvalidSize { got: usize, reason: &'static str },

    /// Ring buffer has no free slot
    #[error("Ring buffer is full")]
    Full,

    /// Pool has no block large enough
    #[error("Pool exhausted: requested {requested} bytes, {available} bytes left")]
    PoolExhausted { requested: usize, available: usize },

    /// Shared value arena ran out of room while building
    #[error("Arena exhausted: requested {requested} bytes, {remaining} bytes left")]
    ArenaExhausted { requested: usize, remaining: usize },

    /// Invalid magic number in a segment header
    #[error("Invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Segment was created by an incompatible layout version
    #[error("Version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    /// Record or slot size stored in the segment disagrees with this build
    #[error("Layout mismatch: expected {expected} bytes, segment says {got}")]
    LayoutMismatch { expected: usize, got: usize },

    /// Inline payload is larger than a ring slot can carry
    #[error("Payload too large for inline slot: max {max} bytes, got {got} bytes")]
    PayloadTooLarge { max: usize, got: usize },

    /// A block handle does not describe a block of this pool
    #[error("Invalid block handle: offset {offset}, size {size}")]
    InvalidBlock { offset: u64, size: u64 },

    /// Shared value region has not been published yet
    #[error("Shared region is not ready (state {0})")]
    RegionNotReady(u32),

    /// Shared value region can only be built once
    #[error("Shared region was already built")]
    RegionAlreadyBuilt,

    /// A node reference points outside the arena or has a bad tag
    #[error("Corrupt shared region at offset {offset}: {reason}")]
    CorruptRegion { offset: u64, reason: &'static str },

    /// Encoding does not fit in the destination buffer
    #[error("Buffer overflow: max {max} bytes, got {got} bytes")]
    BufferOverflow { max: usize, got: usize },

    /// Input ended before the value was complete
    #[error("Truncated input: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    /// Unknown wire tag
    #[error("Unknown value tag 0x{0:02X}")]
    UnknownTag(u8),

    /// String payload is not valid UTF-8
    #[error("Invalid UTF-8 in string at offset {0}")]
    InvalidUtf8(usize),

    /// Nesting deeper than the decoder accepts
    #[error("Value nesting exceeds {0} levels")]
    TooDeep(usize),

    /// Bytes left over after a complete value
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// Map or table keys not strictly ascending
    #[error("Keys out of order near '{0}'")]
    UnorderedKeys(String),

    /// Same key appears twice in one map or table
    #[error("Duplicate key '{0}'")]
    DuplicateKey(String),
}

impl LinkError {
    /// Which bucket of the error taxonomy this error belongs to
    pub fn class(&self) -> ErrorClass {
        use LinkError::*;
        match self {
            AlreadyExists { .. }
            | NotFound { .. }
            | NameTooLong { .. }
            | InvalidName(_)
            | NotPowerOfTwo(_)
            | InvalidSize { .. } => ErrorClass::Configuration,
            Full | PoolExhausted { .. } | ArenaExhausted { .. } => ErrorClass::Capacity,
            InvalidMagic { .. }
            | VersionMismatch { .. }
            | LayoutMismatch { .. }
            | PayloadTooLarge { .. }
            | InvalidBlock { .. }
            | RegionNotReady(_)
            | RegionAlreadyBuilt
            | CorruptRegion { .. } => ErrorClass::Protocol,
            BufferOverflow { .. }
            | Truncated { .. }
            | UnknownTag(_)
            | InvalidUtf8(_)
            | TooDeep(_)
            | TrailingBytes(_)
            | UnorderedKeys(_)
            | DuplicateKey(_) => ErrorClass::Serialization,
            ShmCreate { .. } | ShmOpen { .. } | Mmap(_) | Truncate(_) => ErrorClass::Os,
        }
    }

    /// True for conditions the caller may retry after the peer makes progress
    #[inline]
    pub fn is_capacity(&self) -> bool {
        self.class() == ErrorClass::Capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(LinkError::Full.is_capacity());
        assert!(LinkError::PoolExhausted {
            requested: 10,
            available: 0
        }
        .is_capacity());
        assert_eq!(
            LinkError::NotPowerOfTwo(3).class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            LinkError::InvalidMagic {
                expected: 1,
                got: 2
            }
            .class(),
            ErrorClass::Protocol
        );
        assert_eq!(LinkError::UnknownTag(0xFF).class(), ErrorClass::Serialization);
    }

    #[test]
    fn test_display_mentions_name() {
        let err = LinkError::NotFound {
            name: "frame_state".into(),
        };
        assert!(err.to_string().contains("frame_state"));
    }
}
