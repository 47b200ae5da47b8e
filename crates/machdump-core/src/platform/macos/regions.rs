//! # Region Map Construction
//!
//! Walks the target task's VM map with `mach_vm_region_recurse` and
//! classifies each region by its kernel allocation tag.

use libc::mach_port_t;
use mach2::kern_return::KERN_SUCCESS;
use tracing::debug;

use crate::error::{DumpError, Result};
use crate::platform::macos::ffi;
use crate::region::{MemoryRegionMap, Region, RegionKind, PROT_NONE};

fn classify(user_tag: u32, protection: i32) -> RegionKind
{
    match user_tag {
        // A stack tag with no protection at all is a guard page.
        ffi::VM_MEMORY_STACK => {
            if protection != PROT_NONE {
                RegionKind::Stack
            } else {
                RegionKind::Unknown
            }
        }

        ffi::VM_MEMORY_MALLOC_NANO
        | ffi::VM_MEMORY_MALLOC_TINY
        | ffi::VM_MEMORY_MALLOC_SMALL
        | ffi::VM_MEMORY_MALLOC_LARGE
        | ffi::VM_MEMORY_MALLOC_LARGE_REUSED
        | ffi::VM_MEMORY_MALLOC_LARGE_REUSABLE
        | ffi::VM_MEMORY_MALLOC_HUGE
        | ffi::VM_MEMORY_REALLOC
        | ffi::VM_MEMORY_SBRK => RegionKind::Heap,

        _ => RegionKind::Unknown,
    }
}

/// Enumerate the task's memory regions.
///
/// The walk starts at address 0 and tiles the address space; it ends when
/// the kernel reports no further region. Failure of the *first* query is
/// fatal (the task is gone or the port is not a task), anything after that
/// is simply the end of the map.
pub fn load_memory_region_map(task: mach_port_t) -> Result<MemoryRegionMap>
{
    let mut regions = Vec::new();

    let mut address: u64 = 0;
    let mut depth: libc::natural_t = 0;
    let mut first = true;

    loop {
        let mut size: u64 = 0;
        let mut info = unsafe { std::mem::zeroed::<ffi::VmRegionSubmapInfo64>() };
        let mut count = ffi::VM_REGION_SUBMAP_INFO_COUNT_64;

        let kr = unsafe {
            ffi::mach_vm_region_recurse(
                task,
                &mut address,
                &mut size,
                &mut depth,
                (&mut info as *mut ffi::VmRegionSubmapInfo64).cast(),
                &mut count,
            )
        };

        if kr != KERN_SUCCESS {
            if first {
                return Err(DumpError::TaskIntrospection {
                    call: "mach_vm_region_recurse",
                    kr,
                });
            }
            break;
        }
        first = false;

        if size == 0 {
            break;
        }

        let protection = { info.protection };
        let user_tag = { info.user_tag };
        regions.push(Region {
            base: address,
            size,
            protection,
            kind: classify(user_tag, protection),
        });

        address = match address.checked_add(size) {
            Some(next) => next,
            None => break,
        };
    }

    debug!("enumerated {} memory regions", regions.len());
    Ok(MemoryRegionMap::from_regions(regions))
}
