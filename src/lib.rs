//! shmlink - zero-copy value transport between two processes
//!
//! Two processes on one machine exchange immutable, tree-shaped [`Value`]s
//! through named POSIX shared memory, without a broker and without locks on
//! the hot path.
//!
//! # Building blocks
//!
//! - [`Channel`]: SPSC ring of fixed 256-byte slots, small payloads inline
//! - [`Pool`]: block allocator for payloads too big for a slot
//! - [`DoubleBuffer`]: latest-value cell for per-frame state
//! - [`SharedRegion`]: a whole value tree laid out in shared memory, readable
//!   in place by the peer
//! - [`codec`]: compact binary encoding of [`Value`] for channel payloads
//!
//! Every object is created by one process (the owner, which removes the name
//! on drop) and opened by its peer. Internal references are offsets, so the
//! two mappings may sit at different addresses.
//!
//! ```no_run
//! use shmlink::{Channel, Message};
//!
//! let tx = Channel::create("frames", 256)?;
//! let rx = Channel::open("frames")?;
//! tx.send(&Message::inline(1, 0, 0, b"tick"))?;
//! assert!(rx.try_receive().is_some());
//! # Ok::<(), shmlink::LinkError>(())
//! ```

pub mod backoff;
pub mod bindings;
pub mod codec;
pub mod double_buffer;
pub mod error;
pub mod pool;
pub mod registry;
pub mod ring;
pub mod shared_value;
pub mod shm;
pub mod value;

pub use backoff::BackoffConfig;
pub use double_buffer::{DoubleBuffer, WriteGuard};
pub use error::{ErrorClass, LinkError, Result};
pub use pool::{BlockRef, Pool, PoolStats};
pub use registry::Registry;
pub use ring::{Channel, ChannelConfig, ChannelPair, Message, MessageView, Payload};
pub use shared_value::{
    deep_copy_to_local, deep_copy_to_shared, BuildMode, RegionState, SharedNode, SharedRegion,
};
pub use shm::{Segment, SegmentOptions};
pub use value::{Tag, Value};
