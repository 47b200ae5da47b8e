//! # Mach Port Send-Right Ownership
//!
//! Thread enumeration hands back one send right per thread, and every one
//! of them must be deallocated exactly once, including on early-error
//! paths. Leaked rights are invisible in normal operation and the chief
//! resource bug a dumper can have, so rights are owned by a move-only
//! handle from the moment they enter this crate.

use libc::mach_port_t;
use mach2::port::MACH_PORT_NULL;
use mach2::traps::mach_task_self;

use crate::platform::macos::ffi;

/// Scoped owner of one Mach send right.
///
/// Dropping a non-null handle performs one `mach_port_deallocate` against
/// the owning task. Handles are move-only; a moved-from handle no longer
/// deallocates (plain Rust move semantics, no `Clone`).
#[derive(Debug)]
pub struct SendRight
{
    port: mach_port_t,
    owning_task: mach_port_t,
}

impl SendRight
{
    /// Take ownership of `port`, owned by the current task.
    pub fn wrap(port: mach_port_t) -> Self
    {
        Self::wrap_for_task(port, unsafe { mach_task_self() })
    }

    /// Take ownership of `port`, owned by `owning_task`.
    pub fn wrap_for_task(port: mach_port_t, owning_task: mach_port_t) -> Self
    {
        Self { port, owning_task }
    }

    pub fn get(&self) -> mach_port_t
    {
        self.port
    }

    /// Give up ownership without deallocating.
    pub fn release(mut self) -> mach_port_t
    {
        std::mem::replace(&mut self.port, MACH_PORT_NULL)
    }
}

impl Drop for SendRight
{
    fn drop(&mut self)
    {
        if self.port != MACH_PORT_NULL {
            unsafe {
                let _ = ffi::mach_port_deallocate(self.owning_task, self.port);
            }
        }
    }
}
