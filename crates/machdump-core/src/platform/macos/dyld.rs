//! # Module Catalog Construction
//!
//! Builds the loaded-image catalog from the target's dyld bookkeeping. The
//! chain of custody: `task_info(TASK_DYLD_INFO)` points at the target's
//! `dyld_all_image_infos`, which points at the image-info array, which
//! points at each image's Mach-O header and path string. All of it lives in
//! the *target's* address space and is pulled over with task-memory reads.
//!
//! Any read failure along the way invalidates the whole catalog; a core
//! file with a partial image list would silently break symbolication for
//! whatever was missing.

use libc::mach_port_t;
use mach2::kern_return::KERN_SUCCESS;
use tracing::{debug, warn};

use crate::module::{ModuleCatalog, ModuleInfo};
use crate::platform::macos::ffi;
use crate::platform::macos::memory::{read_task_cstring, read_task_memory, read_task_value};

const DEFAULT_DYLD_PATH: &str = "/usr/lib/dyld";

/// `dyld_all_image_infos.dyldPath` appeared in this version.
const DYLD_PATH_MIN_VERSION: u32 = 15;

/// Longest path string we will chase out of the target.
const MAX_PATH_LEN: usize = 4096;

fn read_module(task: mach_port_t, load_address: u64, file_path: String) -> Option<ModuleInfo>
{
    let header = read_task_memory(task, load_address, 32).ok()?;
    let sizeofcmds = u32::from_le_bytes(header[20..24].try_into().ok()?);

    let full = read_task_memory(task, load_address, 32 + sizeofcmds as usize).ok()?;
    ModuleInfo::parse(load_address, file_path, full)
}

/// Build the module catalog for `task`. Returns an invalidated catalog when
/// any part of the dyld bookkeeping cannot be read.
pub fn load_module_catalog(task: mach_port_t) -> ModuleCatalog
{
    let mut dyld_info = ffi::TaskDyldInfo::default();
    let mut count = ffi::TASK_DYLD_INFO_COUNT;
    let kr = unsafe {
        ffi::task_info(
            task,
            ffi::TASK_DYLD_INFO,
            (&mut dyld_info as *mut ffi::TaskDyldInfo).cast(),
            &mut count,
        )
    };
    if kr != KERN_SUCCESS {
        warn!(kr, "task_info(TASK_DYLD_INFO) failed");
        return ModuleCatalog::invalid();
    }

    let all_image_info_addr = { dyld_info.all_image_info_addr };
    let image_infos: ffi::DyldAllImageInfos = match read_task_value(task, all_image_info_addr) {
        Ok(infos) => infos,
        Err(err) => {
            warn!(%err, "unable to read dyld_all_image_infos");
            return ModuleCatalog::invalid();
        }
    };

    let array_bytes = match read_task_memory(
        task,
        image_infos.info_array,
        image_infos.info_array_count as usize * std::mem::size_of::<ffi::DyldImageInfo>(),
    ) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%err, "unable to read dyld image info array");
            return ModuleCatalog::invalid();
        }
    };

    let mut modules = Vec::with_capacity(image_infos.info_array_count as usize + 1);

    // Quirk: the dyld image itself is not listed in the image array and has
    // to be added from the dedicated field of the info record.
    let dyld_path = if image_infos.version >= DYLD_PATH_MIN_VERSION && image_infos.dyld_path != 0 {
        read_task_cstring(task, image_infos.dyld_path, MAX_PATH_LEN).unwrap_or_else(|_| DEFAULT_DYLD_PATH.to_string())
    } else {
        DEFAULT_DYLD_PATH.to_string()
    };

    match read_module(task, image_infos.dyld_image_load_address, dyld_path) {
        Some(module) => modules.push(module),
        None => {
            warn!(
                load_address = format_args!("{:#x}", image_infos.dyld_image_load_address),
                "unable to read the dyld image"
            );
            return ModuleCatalog::invalid();
        }
    }

    for (index, entry_bytes) in array_bytes.chunks_exact(std::mem::size_of::<ffi::DyldImageInfo>()).enumerate() {
        let entry: ffi::DyldImageInfo = unsafe { std::ptr::read_unaligned(entry_bytes.as_ptr().cast()) };

        let path = match read_task_cstring(task, entry.file_path, MAX_PATH_LEN) {
            Ok(path) => path,
            Err(err) => {
                warn!(index, %err, "unable to read image path");
                return ModuleCatalog::invalid();
            }
        };

        match read_module(task, entry.load_address, path) {
            Some(module) => modules.push(module),
            None => {
                warn!(
                    index,
                    load_address = format_args!("{:#x}", entry.load_address),
                    "unable to read image header"
                );
                return ModuleCatalog::invalid();
            }
        }
    }

    debug!("cataloged {} loaded images", modules.len());
    ModuleCatalog::from_modules(modules)
}
