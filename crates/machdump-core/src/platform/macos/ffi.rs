//! # Mach API FFI Declarations
//!
//! Unsafe `extern "C"` declarations and kernel struct definitions for the
//! Mach APIs this crate needs beyond what the `mach2` crate covers, kept in
//! one place so the raw surface is easy to review.
//!
//! ## Safety Notes
//!
//! Everything here talks directly to the kernel about another process. The
//! wrappers in the sibling modules are the only intended callers.
//!
//! ## References
//!
//! - `<mach/vm_region.h>`, `<mach/task_info.h>`, `<mach/thread_info.h>`
//! - `<mach-o/dyld_images.h>` for the dyld bookkeeping structures
//! - XNU source at [apple-oss-distributions/xnu](https://github.com/apple-oss-distributions/xnu)

use libc::{c_int, kern_return_t, mach_msg_type_number_t, mach_port_t, natural_t, thread_act_t, vm_address_t, vm_size_t};

/// `vm_region_submap_info_64` with `VM_REGION_SUBMAP_INFO` flavor.
///
/// The interesting fields for region classification are `protection` and
/// `user_tag`; everything else is along for the ride because the kernel
/// fills the whole record. The Mach headers wrap this in `#pragma pack(4)`.
#[repr(C, packed(4))]
#[derive(Clone, Copy)]
pub struct VmRegionSubmapInfo64
{
    /// Current protection (`VM_PROT_*` bits)
    pub protection: i32,
    /// Maximum allowed protection
    pub max_protection: i32,
    /// Inheritance behavior for child processes
    pub inheritance: u32,
    /// Offset into the backing memory object
    pub offset: u64,
    /// Allocation tag (`VM_MEMORY_*`), the basis of region classification
    pub user_tag: u32,
    pub pages_resident: u32,
    pub pages_shared_now_private: u32,
    pub pages_swapped_out: u32,
    pub pages_dirtied: u32,
    pub ref_count: u32,
    pub shadow_depth: u16,
    pub external_pager: u8,
    pub share_mode: u8,
    pub is_submap: i32,
    pub behavior: i32,
    pub object_id: u32,
    pub user_wired_count: u16,
    pub pages_reusable: u32,
    pub object_id_full: u64,
}

/// `VM_REGION_SUBMAP_INFO_COUNT_64`: size of the info record in 32-bit words.
pub const VM_REGION_SUBMAP_INFO_COUNT_64: mach_msg_type_number_t =
    (std::mem::size_of::<VmRegionSubmapInfo64>() / std::mem::size_of::<natural_t>()) as mach_msg_type_number_t;

/// `task_dyld_info`: where the target's `dyld_all_image_infos` lives.
#[repr(C, packed(4))]
#[derive(Clone, Copy, Default)]
pub struct TaskDyldInfo
{
    pub all_image_info_addr: u64,
    pub all_image_info_size: u64,
    pub all_image_info_format: i32,
}

/// `TASK_DYLD_INFO` flavor for `task_info()`.
pub const TASK_DYLD_INFO: u32 = 17;

pub const TASK_DYLD_INFO_COUNT: mach_msg_type_number_t =
    (std::mem::size_of::<TaskDyldInfo>() / std::mem::size_of::<natural_t>()) as mach_msg_type_number_t;

/// `thread_identifier_info`: stable system-wide thread id plus libdispatch
/// bookkeeping.
#[repr(C, packed(4))]
#[derive(Clone, Copy, Default)]
pub struct ThreadIdentifierInfo
{
    /// System-wide unique thread id (same value `pthread_threadid_np`
    /// reports)
    pub thread_id: u64,
    pub thread_handle: u64,
    pub dispatch_qaddr: u64,
}

/// `THREAD_IDENTIFIER_INFO` flavor for `thread_info()`.
pub const THREAD_IDENTIFIER_INFO: u32 = 4;

pub const THREAD_IDENTIFIER_INFO_COUNT: mach_msg_type_number_t =
    (std::mem::size_of::<ThreadIdentifierInfo>() / std::mem::size_of::<natural_t>()) as mach_msg_type_number_t;

/// Leading portion of `dyld_all_image_infos` (64-bit layout), through the
/// `dyldPath` field. Pointer fields are plain `u64` because they point into
/// the *target* task and must never be dereferenced locally.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct DyldAllImageInfos
{
    pub version: u32,
    pub info_array_count: u32,
    pub info_array: u64,
    pub notification: u64,
    pub process_detached_from_shared_region: u8,
    pub lib_system_initialized: u8,
    /// The dyld image itself; absent from `info_array` (added in version 9)
    pub dyld_image_load_address: u64,
    pub jit_info: u64,
    pub dyld_version: u64,
    pub error_message: u64,
    pub termination_flags: u64,
    pub core_symbolication_shm_page: u64,
    pub system_order_flag: u64,
    pub uuid_array_count: u64,
    pub uuid_array: u64,
    pub dyld_all_image_infos_address: u64,
    pub initial_image_count: u64,
    pub error_kind: u64,
    pub error_client_of_dylib_path: u64,
    pub error_target_dylib_path: u64,
    pub error_symbol: u64,
    pub shared_cache_slide: u64,
    pub shared_cache_uuid: [u8; 16],
    pub shared_cache_base_address: u64,
    pub info_array_change_timestamp: u64,
    /// Path dyld was loaded from (added in version 15)
    pub dyld_path: u64,
}

/// One entry of the target's `dyld_image_info` array.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct DyldImageInfo
{
    pub load_address: u64,
    pub file_path: u64,
    pub file_mod_date: u64,
}

// Allocation tags reported in `VmRegionSubmapInfo64::user_tag`; from
// <mach/vm_statistics.h>.
pub const VM_MEMORY_MALLOC_SMALL: u32 = 2;
pub const VM_MEMORY_MALLOC_LARGE: u32 = 3;
pub const VM_MEMORY_MALLOC_HUGE: u32 = 4;
pub const VM_MEMORY_SBRK: u32 = 5;
pub const VM_MEMORY_REALLOC: u32 = 6;
pub const VM_MEMORY_MALLOC_TINY: u32 = 7;
pub const VM_MEMORY_MALLOC_LARGE_REUSABLE: u32 = 8;
pub const VM_MEMORY_MALLOC_LARGE_REUSED: u32 = 9;
pub const VM_MEMORY_MALLOC_NANO: u32 = 11;
pub const VM_MEMORY_STACK: u32 = 30;

// Task and thread introspection.
#[link(name = "c", kind = "dylib")]
extern "C" {
    /// Resolve the pid a task port refers to. The cheapest way to check
    /// that a port is alive and actually a task.
    pub fn pid_for_task(task: mach_port_t, pid: *mut c_int) -> kern_return_t;

    /// Send right to the calling thread. The returned right is owned by the
    /// caller and must be deallocated.
    pub fn mach_thread_self() -> mach_port_t;

    /// Read a register set (`flavor`) out of a thread.
    ///
    /// See: [thread_get_state](https://developer.apple.com/documentation/kernel/1418576-thread_get_state/)
    pub fn thread_get_state(
        thread: thread_act_t,
        flavor: c_int,
        state: *mut natural_t,
        state_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;

    /// Increment a thread's suspend count. Threads can start and exit while
    /// we hold their ports; failures here are expected and non-fatal.
    pub fn thread_suspend(thread: thread_act_t) -> kern_return_t;

    /// Decrement a thread's suspend count.
    pub fn thread_resume(thread: thread_act_t) -> kern_return_t;

    /// Query thread metadata (`THREAD_IDENTIFIER_INFO` here).
    pub fn thread_info(
        thread: thread_act_t,
        flavor: u32,
        info: *mut c_int,
        info_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;

    /// Query task metadata (`TASK_DYLD_INFO` here).
    pub fn task_info(task: mach_port_t, flavor: u32, info: *mut c_int, info_count: *mut mach_msg_type_number_t)
        -> kern_return_t;

    /// Release one reference to a port right.
    pub fn mach_port_deallocate(task: mach_port_t, name: mach_port_t) -> kern_return_t;

    /// Free memory the kernel allocated into our address space (the
    /// `task_threads` array).
    pub fn vm_deallocate(task: mach_port_t, address: vm_address_t, size: vm_size_t) -> kern_return_t;
}

// Target-memory access.
#[link(name = "c", kind = "dylib")]
extern "C" {
    /// Copy target-task memory into a caller-supplied buffer. Unlike
    /// `vm_read` there is no kernel allocation to clean up, and the call
    /// either fills the buffer completely or fails.
    pub fn mach_vm_read_overwrite(
        task: mach_port_t,
        address: u64,
        size: u64,
        data: u64,
        out_size: *mut u64,
    ) -> kern_return_t;

    /// Walk the target's VM map. `address` is rounded up to the next region
    /// on return; advancing by `size` tiles the address space.
    pub fn mach_vm_region_recurse(
        task: mach_port_t,
        address: *mut u64,
        size: *mut u64,
        nesting_depth: *mut natural_t,
        info: *mut c_int,
        info_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;
}
