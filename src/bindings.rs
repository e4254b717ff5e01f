//! C bindings for shmlink
//!
//! Raw C API over channels and pools so a non-Rust peer can attach to the
//! same named objects. Values cross this boundary as codec-encoded bytes.

use crate::pool::{BlockRef, Pool};
use crate::ring::{Channel, ChannelConfig, Message};
use crate::error::LinkError;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr;
use std::slice;

// Opaque handles
pub struct ShmlinkChannel(Channel);
pub struct ShmlinkPool(Pool);

/// Send succeeded
pub const SHMLINK_OK: i32 = 0;
/// Ring is full, nothing was written
pub const SHMLINK_FULL: i32 = 1;
/// Bad argument or oversized payload
pub const SHMLINK_ERROR: i32 = -1;

/// Header of a received message
#[repr(C)]
#[derive(Default)]
pub struct ShmlinkMessageInfo {
    pub domain: u8,
    pub msg_type: u32,
    pub request_id: u64,
    /// Inline payload length (may exceed the caller's buffer)
    pub len: usize,
    /// Non-zero when the payload lives in a pool block
    pub pooled: u8,
    pub block_offset: u64,
    pub block_size: u64,
}

unsafe fn name_arg<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    CStr::from_ptr(name).to_str().ok()
}

fn send_status(result: crate::Result<()>) -> i32 {
    match result {
        Ok(()) => SHMLINK_OK,
        Err(LinkError::Full) => SHMLINK_FULL,
        Err(_) => SHMLINK_ERROR,
    }
}

// --- Channel ---

/// Create a new channel with `capacity` slots (0 for the default)
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn shmlink_channel_create(
    name: *const c_char,
    capacity: usize,
) -> *mut ShmlinkChannel {
    let Some(name) = name_arg(name) else {
        return ptr::null_mut();
    };
    let mut config = ChannelConfig::default();
    if capacity != 0 {
        config.capacity = capacity;
    }
    match Channel::create_with(name, config) {
        Ok(channel) => Box::into_raw(Box::new(ShmlinkChannel(channel))),
        Err(e) => {
            tracing::debug!(name, error = %e, "channel create failed");
            ptr::null_mut()
        }
    }
}

/// Open an existing channel
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn shmlink_channel_open(name: *const c_char) -> *mut ShmlinkChannel {
    let Some(name) = name_arg(name) else {
        return ptr::null_mut();
    };
    match Channel::open(name) {
        Ok(channel) => Box::into_raw(Box::new(ShmlinkChannel(channel))),
        Err(e) => {
            tracing::debug!(name, error = %e, "channel open failed");
            ptr::null_mut()
        }
    }
}

/// Destroy a channel handle; the creator's handle also removes the name
#[no_mangle]
pub unsafe extern "C" fn shmlink_channel_destroy(handle: *mut ShmlinkChannel) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Send an inline message
///
/// Returns `SHMLINK_OK`, `SHMLINK_FULL`, or `SHMLINK_ERROR`.
#[no_mangle]
pub unsafe extern "C" fn shmlink_channel_send(
    handle: *mut ShmlinkChannel,
    domain: u8,
    msg_type: u32,
    request_id: u64,
    data: *const u8,
    len: usize,
) -> i32 {
    let Some(channel) = handle.as_ref() else {
        return SHMLINK_ERROR;
    };
    let bytes = if len == 0 {
        &[][..]
    } else if data.is_null() {
        return SHMLINK_ERROR;
    } else {
        slice::from_raw_parts(data, len)
    };
    send_status(channel.0.send(&Message::inline(domain, msg_type, request_id, bytes)))
}

/// Send a message referencing a block of the companion pool
#[no_mangle]
pub unsafe extern "C" fn shmlink_channel_send_block(
    handle: *mut ShmlinkChannel,
    domain: u8,
    msg_type: u32,
    request_id: u64,
    block_offset: u64,
    block_size: u64,
) -> i32 {
    let Some(channel) = handle.as_ref() else {
        return SHMLINK_ERROR;
    };
    let block = BlockRef {
        offset: block_offset,
        size: block_size,
    };
    send_status(channel.0.send(&Message::pooled(domain, msg_type, request_id, block)))
}

/// Try to receive a message (non-blocking)
///
/// Returns true if a message was taken. Inline bytes are copied into `buf`
/// up to `max_len`; `info.len` holds the full length.
#[no_mangle]
pub unsafe extern "C" fn shmlink_channel_try_receive(
    handle: *mut ShmlinkChannel,
    info: *mut ShmlinkMessageInfo,
    buf: *mut u8,
    max_len: usize,
) -> bool {
    let Some(channel) = handle.as_ref() else {
        return false;
    };
    let out = if buf.is_null() || max_len == 0 {
        &mut [][..]
    } else {
        slice::from_raw_parts_mut(buf, max_len)
    };

    let received = channel.0.try_receive_with(|view| {
        let n = view.inline.len().min(out.len());
        out[..n].copy_from_slice(&view.inline[..n]);
        let block = view.block.unwrap_or(BlockRef { offset: 0, size: 0 });
        ShmlinkMessageInfo {
            domain: view.domain,
            msg_type: view.msg_type,
            request_id: view.request_id,
            len: view.inline.len(),
            pooled: view.block.is_some() as u8,
            block_offset: block.offset,
            block_size: block.size,
        }
    });

    match received {
        Some(header) => {
            if !info.is_null() {
                *info = header;
            }
            true
        }
        None => false,
    }
}

/// Number of messages waiting
#[no_mangle]
pub unsafe extern "C" fn shmlink_channel_len(handle: *mut ShmlinkChannel) -> usize {
    handle.as_ref().map_or(0, |c| c.0.len())
}

// --- Pool ---

/// Create a pool with `size` bytes of block storage
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn shmlink_pool_create(name: *const c_char, size: usize) -> *mut ShmlinkPool {
    let Some(name) = name_arg(name) else {
        return ptr::null_mut();
    };
    match Pool::create(name, size) {
        Ok(pool) => Box::into_raw(Box::new(ShmlinkPool(pool))),
        Err(e) => {
            tracing::debug!(name, error = %e, "pool create failed");
            ptr::null_mut()
        }
    }
}

/// Open an existing pool
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn shmlink_pool_open(name: *const c_char) -> *mut ShmlinkPool {
    let Some(name) = name_arg(name) else {
        return ptr::null_mut();
    };
    match Pool::open(name) {
        Ok(pool) => Box::into_raw(Box::new(ShmlinkPool(pool))),
        Err(e) => {
            tracing::debug!(name, error = %e, "pool open failed");
            ptr::null_mut()
        }
    }
}

/// Destroy a pool handle
#[no_mangle]
pub unsafe extern "C" fn shmlink_pool_destroy(handle: *mut ShmlinkPool) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Allocate `size` bytes. Producer side only.
///
/// Returns false when the pool is exhausted.
#[no_mangle]
pub unsafe extern "C" fn shmlink_pool_allocate(
    handle: *mut ShmlinkPool,
    size: usize,
    out_offset: *mut u64,
) -> bool {
    let Some(pool) = handle.as_ref() else {
        return false;
    };
    match pool.0.allocate(size) {
        Ok(block) => {
            if !out_offset.is_null() {
                *out_offset = block.offset;
            }
            true
        }
        Err(_) => false,
    }
}

/// Return a block. Consumer side only.
#[no_mangle]
pub unsafe extern "C" fn shmlink_pool_deallocate(
    handle: *mut ShmlinkPool,
    offset: u64,
    size: u64,
) -> bool {
    let Some(pool) = handle.as_ref() else {
        return false;
    };
    pool.0.deallocate(BlockRef { offset, size }).is_ok()
}

/// Get raw pointer to a block's bytes in this process's mapping
///
/// Returns null for a handle that does not describe a block of the pool.
#[no_mangle]
pub unsafe extern "C" fn shmlink_pool_ptr(
    handle: *mut ShmlinkPool,
    offset: u64,
    size: u64,
) -> *mut u8 {
    let Some(pool) = handle.as_ref() else {
        return ptr::null_mut();
    };
    match pool.0.slice_mut(&BlockRef { offset, size }) {
        Ok(bytes) => bytes.as_mut_ptr(),
        Err(_) => ptr::null_mut(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::test_name;
    use std::ffi::CString;

    #[test]
    fn test_channel_through_c_api() {
        let name = CString::new(test_name("ffi_chan")).unwrap();
        unsafe {
            let tx = shmlink_channel_create(name.as_ptr(), 2);
            assert!(!tx.is_null());
            let rx = shmlink_channel_open(name.as_ptr());
            assert!(!rx.is_null());

            let payload = b"hello";
            assert_eq!(shmlink_channel_send(tx, 1, 7, 42, payload.as_ptr(), payload.len()), SHMLINK_OK);
            assert_eq!(shmlink_channel_send(tx, 1, 7, 43, ptr::null(), 0), SHMLINK_OK);
            assert_eq!(shmlink_channel_send(tx, 1, 7, 44, ptr::null(), 0), SHMLINK_FULL);
            assert_eq!(shmlink_channel_len(rx), 2);

            let mut info = ShmlinkMessageInfo::default();
            let mut buf = [0u8; 3];
            assert!(shmlink_channel_try_receive(rx, &mut info, buf.as_mut_ptr(), buf.len()));
            assert_eq!((info.msg_type, info.request_id, info.len), (7, 42, 5));
            assert_eq!(&buf, b"hel");
            assert!(shmlink_channel_try_receive(rx, &mut info, ptr::null_mut(), 0));
            assert!(!shmlink_channel_try_receive(rx, &mut info, ptr::null_mut(), 0));

            shmlink_channel_destroy(rx);
            shmlink_channel_destroy(tx);
        }
        assert!(unsafe { shmlink_channel_open(ptr::null()) }.is_null());
    }

    #[test]
    fn test_pool_block_through_c_api() {
        let chan = CString::new(test_name("ffi_pchan")).unwrap();
        let pool = CString::new(test_name("ffi_pool")).unwrap();
        unsafe {
            let tx = shmlink_channel_create(chan.as_ptr(), 0);
            let rx = shmlink_channel_open(chan.as_ptr());
            let producer = shmlink_pool_create(pool.as_ptr(), 4096);
            let consumer = shmlink_pool_open(pool.as_ptr());

            let mut offset = 0;
            assert!(!shmlink_pool_allocate(producer, usize::MAX, &mut offset));
            assert!(shmlink_pool_allocate(producer, 300, &mut offset));
            let p = shmlink_pool_ptr(producer, offset, 300);
            assert!(!p.is_null());
            ptr::write_bytes(p, 0xAB, 300);
            assert_eq!(shmlink_channel_send_block(tx, 2, 1, 9, offset, 300), SHMLINK_OK);

            let mut info = ShmlinkMessageInfo::default();
            assert!(shmlink_channel_try_receive(rx, &mut info, ptr::null_mut(), 0));
            assert_eq!(info.pooled, 1);
            let q = shmlink_pool_ptr(consumer, info.block_offset, info.block_size);
            assert_eq!(*q.add(299), 0xAB);
            assert!(shmlink_pool_deallocate(consumer, info.block_offset, info.block_size));
            assert!(shmlink_pool_ptr(consumer, 1, 300).is_null());

            shmlink_pool_destroy(consumer);
            shmlink_pool_destroy(producer);
            shmlink_channel_destroy(rx);
            shmlink_channel_destroy(tx);
        }
    }
}
