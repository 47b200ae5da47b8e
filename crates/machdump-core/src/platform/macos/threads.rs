//! # Thread Enumeration and State Capture
//!
//! Wrappers over `task_threads`, `thread_info`, and `thread_get_state`.
//! Every port right returned by `task_threads` is owned by a [`SendRight`]
//! before anything fallible happens, and the kernel-allocated array itself
//! is released with `vm_deallocate`; both are required to keep a dump from
//! leaking rights (see the leak check in the integration tests).

use libc::{mach_msg_type_number_t, mach_port_t, thread_act_t, vm_address_t, vm_size_t};
use mach2::kern_return::KERN_SUCCESS;
use mach2::task::task_threads;
use mach2::traps::mach_task_self;
use tracing::warn;

use crate::error::{DumpError, Result};
use crate::platform::macos::ffi;
use crate::platform::macos::port::SendRight;
use crate::thread_state::{ExcState, GprState, EXC_FLAVOR, EXC_WORD_COUNT, GPR_FLAVOR, GPR_WORD_COUNT};

/// Enumerate the task's threads, taking ownership of every returned right.
pub fn enumerate_threads(task: mach_port_t) -> Result<Vec<SendRight>>
{
    unsafe {
        let mut list: *mut thread_act_t = std::ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;

        let kr = task_threads(task, &mut list, &mut count);
        if kr != KERN_SUCCESS {
            return Err(DumpError::TaskIntrospection {
                call: "task_threads",
                kr,
            });
        }

        let threads = std::slice::from_raw_parts(list, count as usize)
            .iter()
            .map(|&port| SendRight::wrap(port))
            .collect();

        // The thread array itself is kernel-allocated into our map.
        let size = (count as usize).saturating_mul(std::mem::size_of::<thread_act_t>()) as vm_size_t;
        let _ = ffi::vm_deallocate(mach_task_self(), list as vm_address_t, size);

        Ok(threads)
    }
}

/// The system-wide id of a thread, or `None` if the kernel will not say.
pub fn thread_id(thread: thread_act_t) -> Option<u64>
{
    let mut info = ffi::ThreadIdentifierInfo::default();
    let mut count = ffi::THREAD_IDENTIFIER_INFO_COUNT;

    let kr = unsafe {
        ffi::thread_info(
            thread,
            ffi::THREAD_IDENTIFIER_INFO,
            (&mut info as *mut ffi::ThreadIdentifierInfo).cast(),
            &mut count,
        )
    };

    if kr == KERN_SUCCESS {
        Some({ info.thread_id })
    } else {
        warn!(thread, kr, "thread_info(THREAD_IDENTIFIER_INFO) failed");
        None
    }
}

/// Capture the general-purpose and exception register sets of a thread.
pub fn capture_thread_state(thread: thread_act_t) -> Result<(GprState, ExcState)>
{
    let mut gpr = GprState::default();
    let mut gpr_count: mach_msg_type_number_t = GPR_WORD_COUNT;
    let kr = unsafe { ffi::thread_get_state(thread, GPR_FLAVOR, (&mut gpr as *mut GprState).cast(), &mut gpr_count) };
    if kr != KERN_SUCCESS {
        return Err(DumpError::TaskIntrospection {
            call: "thread_get_state(GPR)",
            kr,
        });
    }

    let mut exc = ExcState::default();
    let mut exc_count: mach_msg_type_number_t = EXC_WORD_COUNT;
    let kr = unsafe { ffi::thread_get_state(thread, EXC_FLAVOR, (&mut exc as *mut ExcState).cast(), &mut exc_count) };
    if kr != KERN_SUCCESS {
        return Err(DumpError::TaskIntrospection {
            call: "thread_get_state(EXC)",
            kr,
        });
    }

    Ok((gpr, exc))
}
