//! # Target-Task Memory Access
//!
//! Best-effort reads of another task's address space, built on
//! `mach_vm_read_overwrite` (whole-buffer-or-nothing, no short reads).
//! Reads may fail or race with task activity at any time; every entry point
//! returns a `Result` and the caller decides what a failed read means.

use libc::mach_port_t;
use mach2::kern_return::KERN_SUCCESS;

use crate::error::{DumpError, Result};
use crate::platform::macos::ffi;
use crate::provider::PayloadSource;
use crate::stackwalk::DerefMemory;
use crate::zone::ZoneBuffer;

/// Read `length` bytes at `address` in the target task.
pub fn read_task_memory(task: mach_port_t, address: u64, length: usize) -> Result<ZoneBuffer>
{
    let mut buffer = ZoneBuffer::zeroed(length)?;
    if length == 0 {
        return Ok(buffer);
    }

    let mut out_size: u64 = 0;
    let kr = unsafe { ffi::mach_vm_read_overwrite(task, address, length as u64, buffer.as_mut_ptr() as u64, &mut out_size) };
    if kr != KERN_SUCCESS {
        return Err(DumpError::NotReadable { address });
    }

    Ok(buffer)
}

/// Read one plain-old-data value at `address` in the target task.
///
/// `T` must be a `#[repr(C)]` type for which every bit pattern is valid
/// (integers and structs thereof); everything this crate reads qualifies.
pub fn read_task_value<T: Copy + Default>(task: mach_port_t, address: u64) -> Result<T>
{
    let mut value = T::default();
    let size = std::mem::size_of::<T>() as u64;
    let mut out_size: u64 = 0;

    let kr =
        unsafe { ffi::mach_vm_read_overwrite(task, address, size, &mut value as *mut T as u64, &mut out_size) };
    if kr != KERN_SUCCESS {
        return Err(DumpError::NotReadable { address });
    }

    Ok(value)
}

/// How many readable bytes remain between `address` and the end of its
/// region. When the region boundary is less than a page away, one adjacent
/// readable region is folded in, so strings sitting right at a region seam
/// still come out whole.
fn region_end_distance(task: mach_port_t, address: u64) -> Result<u64>
{
    const PAGE_SIZE: u64 = 4096;

    let mut base = address;
    let mut size: u64 = 0;
    let mut depth: libc::natural_t = 0;
    let mut info = unsafe { std::mem::zeroed::<ffi::VmRegionSubmapInfo64>() };
    let mut count = ffi::VM_REGION_SUBMAP_INFO_COUNT_64;

    let kr = unsafe {
        ffi::mach_vm_region_recurse(task, &mut base, &mut size, &mut depth, (&mut info as *mut ffi::VmRegionSubmapInfo64).cast(), &mut count)
    };
    if kr != KERN_SUCCESS || base > address {
        return Err(DumpError::NotReadable { address });
    }

    let mut end = base + size;
    if end - address < PAGE_SIZE {
        let mut next_base = end;
        let mut next_size: u64 = 0;
        let mut next_info = unsafe { std::mem::zeroed::<ffi::VmRegionSubmapInfo64>() };
        let mut next_count = ffi::VM_REGION_SUBMAP_INFO_COUNT_64;

        let kr = unsafe {
            ffi::mach_vm_region_recurse(
                task,
                &mut next_base,
                &mut next_size,
                &mut depth,
                (&mut next_info as *mut ffi::VmRegionSubmapInfo64).cast(),
                &mut next_count,
            )
        };
        let readable = { next_info.protection } & crate::region::PROT_READ != 0;
        if kr == KERN_SUCCESS && next_base == end && readable {
            end += next_size;
        }
    }

    Ok(end - address)
}

/// Read a NUL-terminated string at `address`, scanning at most `max_length`
/// bytes and never past the end of readable memory.
///
/// ## Errors
///
/// `NotReadable` when the containing region cannot be determined, the read
/// fails, or no NUL appears inside the window.
pub fn read_task_cstring(task: mach_port_t, address: u64, max_length: usize) -> Result<String>
{
    let window = region_end_distance(task, address)?.min(max_length as u64) as usize;
    let bytes = read_task_memory(task, address, window)?;

    match bytes.iter().position(|&b| b == 0) {
        Some(nul) => Ok(String::from_utf8_lossy(&bytes[..nul]).into_owned()),
        None => Err(DumpError::NotReadable { address }),
    }
}

/// Pointer-sized reads for the stack walker. A failed read yields 0, which
/// the walk loop treats as end-of-chain.
pub struct TaskMemory
{
    pub task: mach_port_t,
}

impl DerefMemory for TaskMemory
{
    fn deref(&self, address: u64) -> u64
    {
        read_task_value::<u64>(self.task, address).unwrap_or(0)
    }
}

/// Payload source that reads segment bytes straight out of the target task
/// at write time, window by window, through a rolling zone buffer.
///
/// Holds the task port non-owning: the orchestrator's suspension guard
/// outlives every provider.
pub struct TaskMemorySource
{
    task: mach_port_t,
    base: u64,
    size: u64,
    window: Option<ZoneBuffer>,
}

impl TaskMemorySource
{
    pub fn new(task: mach_port_t, base: u64, size: u64) -> Self
    {
        Self {
            task,
            base,
            size,
            window: None,
        }
    }
}

impl PayloadSource for TaskMemorySource
{
    fn size(&self) -> u64
    {
        self.size
    }

    fn window(&mut self, offset: u64, len: usize) -> Result<&[u8]>
    {
        let end = offset
            .checked_add(len as u64)
            .ok_or(DumpError::Layout("payload window overflows"))?;
        if end > self.size {
            return Err(DumpError::Layout("payload window out of bounds"));
        }

        let buffer = read_task_memory(self.task, self.base + offset, len)?;
        Ok(&**self.window.insert(buffer))
    }
}
