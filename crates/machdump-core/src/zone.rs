//! # Dedicated Allocation Zone
//!
//! Every bulk allocation the dump writer makes goes through a dedicated
//! malloc zone instead of the default process heap. If the target of a
//! self-dump crashed because its heap is corrupt (a depressingly common
//! case), touching the default heap from the crash handler would deadlock
//! or re-fault before a single byte of the core file is written.
//!
//! The zone is a process-wide singleton, created lazily on first use. If
//! zone creation fails, we fall back to the default zone so the library
//! stays usable.
//!
//! On non-Darwin hosts (where the platform introspection half of this crate
//! is compiled out anyway, but the builder and its tests are not) there is
//! no zone-malloc subsystem, and [`ZoneBuffer`] falls back to the global
//! allocator.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::error::{DumpError, Result};

#[cfg(target_os = "macos")]
mod sys
{
    use std::ffi::{c_char, c_uint, c_void};

    use once_cell::sync::Lazy;
    use tracing::warn;

    /// Opaque `malloc_zone_t`. We only ever hold pointers to it.
    #[repr(C)]
    pub struct MallocZone
    {
        _opaque: [u8; 0],
    }

    // The malloc-zone family lives in libSystem, not in the Mach bindings,
    // so it is declared here rather than in the platform ffi module.
    extern "C" {
        fn malloc_create_zone(start_size: usize, flags: c_uint) -> *mut MallocZone;
        fn malloc_default_zone() -> *mut MallocZone;
        fn malloc_set_zone_name(zone: *mut MallocZone, name: *const c_char);
        fn malloc_zone_calloc(zone: *mut MallocZone, num_items: usize, size: usize) -> *mut c_void;
        fn malloc_zone_free(zone: *mut MallocZone, ptr: *mut c_void);
    }

    struct ZoneHandle(*mut MallocZone);

    // The zone pointer is only handed to thread-safe libSystem entry points.
    unsafe impl Send for ZoneHandle {}
    unsafe impl Sync for ZoneHandle {}

    static ZONE: Lazy<ZoneHandle> = Lazy::new(|| unsafe {
        let zone = malloc_create_zone(0, 0);
        if zone.is_null() {
            warn!("failed to create dedicated malloc zone, falling back to the default zone");
            return ZoneHandle(malloc_default_zone());
        }

        malloc_set_zone_name(zone, b"machdump zone\0".as_ptr().cast());
        ZoneHandle(zone)
    });

    pub fn alloc_zeroed(len: usize) -> *mut u8
    {
        unsafe { malloc_zone_calloc(ZONE.0, 1, len).cast() }
    }

    pub fn free(ptr: *mut u8, _len: usize)
    {
        unsafe { malloc_zone_free(ZONE.0, ptr.cast()) }
    }
}

#[cfg(not(target_os = "macos"))]
mod sys
{
    use std::alloc::Layout;

    pub fn alloc_zeroed(len: usize) -> *mut u8
    {
        // Layout construction cannot fail for align 1 unless len overflows
        // isize, which the caller has already bounds-checked away.
        match Layout::from_size_align(len, 1) {
            Ok(layout) => unsafe { std::alloc::alloc_zeroed(layout) },
            Err(_) => std::ptr::null_mut(),
        }
    }

    pub fn free(ptr: *mut u8, len: usize)
    {
        if let Ok(layout) = Layout::from_size_align(len, 1) {
            unsafe { std::alloc::dealloc(ptr, layout) };
        }
    }
}

/// Exclusively-owned byte buffer allocated from the dedicated zone.
///
/// This is the smart-owner wrapper all bulk working memory of a dump flows
/// through: target-memory reads, module header bytes, note payloads, and the
/// rolling window buffer of the process-memory payload source.
pub struct ZoneBuffer
{
    ptr: NonNull<u8>,
    len: usize,
}

// A ZoneBuffer is a plain heap allocation with unique ownership.
unsafe impl Send for ZoneBuffer {}
unsafe impl Sync for ZoneBuffer {}

impl ZoneBuffer
{
    /// Allocate a zero-filled buffer of `len` bytes.
    ///
    /// ## Errors
    ///
    /// `DumpError::OutOfMemory` if the zone refuses the request.
    pub fn zeroed(len: usize) -> Result<Self>
    {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
            });
        }
        if len > isize::MAX as usize {
            return Err(DumpError::OutOfMemory(len));
        }

        let ptr = sys::alloc_zeroed(len);
        match NonNull::new(ptr) {
            Some(ptr) => Ok(Self { ptr, len }),
            None => Err(DumpError::OutOfMemory(len)),
        }
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self>
    {
        let mut buffer = Self::zeroed(bytes.len())?;
        buffer.as_mut_slice().copy_from_slice(bytes);
        Ok(buffer)
    }

    pub fn len(&self) -> usize
    {
        self.len
    }

    pub fn is_empty(&self) -> bool
    {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8]
    {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8]
    {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8
    {
        self.ptr.as_ptr()
    }
}

impl Deref for ZoneBuffer
{
    type Target = [u8];

    fn deref(&self) -> &[u8]
    {
        self.as_slice()
    }
}

impl DerefMut for ZoneBuffer
{
    fn deref_mut(&mut self) -> &mut [u8]
    {
        self.as_mut_slice()
    }
}

impl Drop for ZoneBuffer
{
    fn drop(&mut self)
    {
        if self.len > 0 {
            sys::free(self.ptr.as_ptr(), self.len);
        }
    }
}

impl std::fmt::Debug for ZoneBuffer
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("ZoneBuffer").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_zeroed_buffer_is_zeroed()
    {
        let buffer = ZoneBuffer::zeroed(64).unwrap();
        assert_eq!(buffer.len(), 64);
        assert!(buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_from_slice_round_trip()
    {
        let data = [0xDEu8, 0xAD, 0xBE, 0xEF];
        let buffer = ZoneBuffer::from_slice(&data).unwrap();
        assert_eq!(&*buffer, &data);
    }

    #[test]
    fn test_zero_length_buffer()
    {
        let buffer = ZoneBuffer::zeroed(0).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.as_slice(), &[] as &[u8]);
    }

    #[test]
    fn test_mutation_through_deref()
    {
        let mut buffer = ZoneBuffer::zeroed(8).unwrap();
        buffer[3] = 0x7F;
        assert_eq!(buffer[3], 0x7F);
        assert_eq!(buffer[4], 0);
    }
}
