//! # Error Types
//!
//! Error handling for the core dump writer.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.
//!
//! Per-thread and per-segment problems during a dump are deliberately *not*
//! errors: a thread that refuses to report state is skipped with a warning,
//! and a memory window that cannot be read leaves a hole in the core file.
//! Only conditions that make the resulting file useless abort the dump.

use thiserror::Error;

/// Main error type for core dump operations
///
/// Each variant corresponds to a class of failure that aborts the dump.
/// The output sink will contain a truncated file in that case; callers are
/// expected to delete or ignore it. No partial-success contract is offered.
#[derive(Error, Debug)]
pub enum DumpError
{
    /// The task handle does not resolve to a process
    ///
    /// `pid_for_task()` failed on the handle passed to `write_core()`. This
    /// happens when the port is dead (target exited) or is not a task port
    /// at all.
    #[error("task handle does not resolve to a process")]
    InvalidTask,

    /// Write/seek/truncate on the output sink failed
    #[error("output sink I/O error: {0}")]
    SinkIo(#[from] std::io::Error),

    /// A kernel call on the task failed where recovery is impossible
    ///
    /// Examples: thread enumeration, the dyld info query, the first memory
    /// region query, the addressable-bits sysctl.
    #[error("{call} failed with kernel return code {kr}")]
    TaskIntrospection
    {
        /// The kernel call that failed
        call: &'static str,
        /// The raw `kern_return_t` (or errno, for sysctl)
        kr: i32,
    },

    /// Reading target-process memory at a required address failed
    #[error("unable to read target process memory at {address:#018x}")]
    NotReadable
    {
        /// The address the read started at
        address: u64,
    },

    /// The builder was asked to violate its layout contract
    ///
    /// Adding commands after finalization, asking for a payload offset
    /// before finalization, or naming a command that does not exist.
    #[error("load command layout violation: {0}")]
    Layout(&'static str),

    /// The dedicated allocation zone refused a request
    #[error("zone allocator refused a request of {0} bytes")]
    OutOfMemory(usize),
}

/// Convenience type alias for `Result<T, DumpError>`
pub type Result<T> = std::result::Result<T, DumpError>;
