//! # machdump-core
//!
//! Writes Mach-O core files capturing a consistent snapshot of a live or
//! crashing Darwin process: register state for every thread, reconstructed
//! call stacks, loaded-image metadata with UUIDs, and enough memory that an
//! offline debugger (LLDB's core conventions) can symbolicate even when the
//! source binaries are missing.
//!
//! ## Entry points
//!
//! All synchronous, all on `platform::macos` (re-exported here on macOS):
//!
//! - [`write_core`]: dump `task` into any [`sink::RandomAccessSink`]
//! - [`write_core_to_fd`]: dump over a raw descriptor (the crash-handler
//!   path)
//! - [`write_core_to_file`]: dump into an owned `std::fs::File`
//!
//! A dump of the *current* task works from inside a crash: a signal
//! trampoline passes the fault-time register state in as a
//! [`crash_context::CrashContext`], and all working memory comes from a
//! dedicated allocation zone so a corrupt process heap is never touched.
//!
//! ## Why unsafe code is needed
//!
//! Reading another process's memory, registers, and image list is kernel
//! business; the Mach calls involved are inherently unsafe and so are the
//! couple of spots that reinterpret kernel-filled structs as bytes. Each
//! unsafe block is wrapped in a safe, Result-returning interface.

#![allow(unsafe_code)]

pub mod builder;
pub mod error;
pub mod guard;
pub mod interval;
pub mod layout;
pub mod module;
pub mod notes;
pub mod platform;
pub mod provider;
pub mod region;
pub mod sink;
pub mod stackwalk;
pub mod zone;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub mod crash_context;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub mod thread_state;

pub use builder::CoreFileBuilder;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use crash_context::CrashContext;
pub use error::{DumpError, Result};
#[cfg(target_os = "macos")]
pub use platform::macos::{write_core, write_core_to_fd, write_core_to_file};
pub use sink::{FileSink, RandomAccessSink};
#[cfg(unix)]
pub use sink::FdSink;
