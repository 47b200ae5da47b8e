//! # Dump Orchestration
//!
//! The single entry point of the crate: validate the task, freeze it,
//! collect threads / images / memory, lay the file out, write it, thaw the
//! task. Everything else in the crate exists to serve one of those steps.
//!
//! ## Suspension protocol
//!
//! The point of suspending is a *consistent* snapshot: registers captured
//! from a running thread would disagree with its stack moments later.
//!
//! - *Cross-task dump*: one `task_suspend` before any collection, matching
//!   `task_resume` on every exit path.
//! - *Self dump*: `task_suspend` on the current task would deadlock the
//!   thread doing the dumping, so instead every *other* thread is suspended
//!   individually and resumed at the end. Threads start and exit while this
//!   happens; a thread that refuses to suspend is logged and skipped.
//!
//! The dumping thread's own stack is deliberately not captured in a self
//! dump: it keeps mutating under us while we work, so the bytes would not
//! match the captured registers anyway. Known limitation: that one thread's
//! call stack is garbled in the resulting core.

use std::fs::File;

use libc::{c_int, mach_port_t};
use mach2::kern_return::KERN_SUCCESS;
use mach2::task::{task_resume, task_suspend};
use mach2::traps::mach_task_self;
use tracing::{debug, info, warn};

use crate::builder::CoreFileBuilder;
use crate::crash_context::CrashContext;
use crate::error::{DumpError, Result};
use crate::guard::ScopeGuard;
use crate::interval::DisjointIntervalSet;
use crate::layout::{ADDRABLE_BITS_OWNER, ALL_IMAGE_INFOS_OWNER};
use crate::module::ModuleCatalog;
use crate::notes::{addressable_bits_payload, all_image_infos_payload};
use crate::platform::macos::memory::TaskMemorySource;
use crate::platform::macos::port::SendRight;
use crate::platform::macos::threads::{capture_thread_state, enumerate_threads, thread_id};
use crate::platform::macos::unwind::walk_thread_stack;
use crate::platform::macos::{dyld, ffi, regions};
use crate::provider::CopiedBytes;
use crate::region::{MemoryRegionMap, RegionKind};
use crate::sink::{FdSink, FileSink, RandomAccessSink};
use crate::thread_state::thread_command_blocks;

/// Bytes of memory preserved on each side of every call-stack address.
///
/// The debugger checks the protection of the memory return addresses point
/// into while unwinding; without these bytes, addresses in images that are
/// unavailable at open time (system libraries, usually) read as
/// non-executable and the reconstruction stops dead. Carrying the
/// surrounding code also makes a little disassembly possible with no
/// binaries at hand, modified code bytes included.
const SURROUNDING_CODE_RANGE: u64 = 256;

/// Write a Mach-O core of `task` to `sink`.
///
/// `crash_context` carries the register state of a crashed thread as
/// captured by a signal trampoline; when the enumerated thread with that id
/// comes up, the supplied state is used instead of the live state (which
/// would show the trampoline, not the fault). `None` means no thread is
/// special.
///
/// On error the sink holds a truncated file; delete or ignore it.
pub fn write_core(task: mach_port_t, sink: &mut dyn RandomAccessSink, crash_context: Option<&CrashContext>) -> Result<()>
{
    let mut pid: c_int = 0;
    if unsafe { ffi::pid_for_task(task, &mut pid) } != KERN_SUCCESS {
        return Err(DumpError::InvalidTask);
    }

    info!(pid, "writing core dump");
    sink.set_size(0)?;

    let self_dump = task == unsafe { mach_task_self() };
    let suspended_threads = if self_dump {
        suspend_all_threads_except_current(task)?
    } else {
        let kr = unsafe { task_suspend(task) };
        if kr != KERN_SUCCESS {
            return Err(DumpError::TaskIntrospection {
                call: "task_suspend",
                kr,
            });
        }
        Vec::new()
    };

    // Resume on every exit path, success and failure alike.
    let _resume = ScopeGuard::new(move || {
        if self_dump {
            resume_threads(&suspended_threads);
        } else {
            let kr = unsafe { task_resume(task) };
            if kr != KERN_SUCCESS {
                warn!(kr, "task_resume failed");
            }
        }
    });

    // Core files cross-reference payload offsets from the load commands at
    // the front, so everything is decided before anything is written: add
    // all commands, finalize, compute offsets, then write.
    let mut builder = CoreFileBuilder::new();
    let mut modules = dyld::load_module_catalog(task);
    if !modules.is_valid() {
        return Err(DumpError::TaskIntrospection {
            call: "dyld image enumeration",
            kr: mach2::kern_return::KERN_FAILURE,
        });
    }
    let region_map = regions::load_memory_region_map(task)?;

    let mut memory_ranges = DisjointIntervalSet::new();
    add_threads_to_core(task, &mut builder, &mut modules, &region_map, crash_context, &mut memory_ranges)?;

    // One segment command per merged range, streamed from the (suspended)
    // task at write time.
    for (start, length) in memory_ranges.iter() {
        match region_map.lookup(start) {
            Some(region) => {
                let source = TaskMemorySource::new(task, start, length);
                builder.add_segment_command(start, region.protection, Some(Box::new(source)))?;
            }
            None => {
                warn!(
                    start = format_args!("{start:#x}"),
                    length, "no region information for memory range, skipping segment"
                );
            }
        }
    }

    builder.add_note_command(ADDRABLE_BITS_OWNER, None)?;
    builder.add_note_command(ALL_IMAGE_INFOS_OWNER, None)?;

    let n_bits = addressable_bits()?;
    builder.set_note_payload(ADDRABLE_BITS_OWNER, Box::new(CopiedBytes::new(&addressable_bits_payload(n_bits))?))?;

    // The image-infos payload embeds absolute file offsets into itself, so
    // the load command layout must be frozen before it can be produced.
    builder.finalize();
    let payload_offset = builder.offset_for_note(ALL_IMAGE_INFOS_OWNER)?;
    let payload = all_image_infos_payload(payload_offset, &modules)?;
    builder.set_note_payload(ALL_IMAGE_INFOS_OWNER, Box::new(CopiedBytes::new(&payload)?))?;

    builder.build(sink)?;

    info!(pid, "core dump complete");
    Ok(())
}

/// `write_core` over a raw file descriptor. The sink takes ownership of the
/// descriptor; this is the crash-handler entry point, where an fd is the
/// only thing safe to hold.
pub fn write_core_to_fd(task: mach_port_t, fd: c_int, crash_context: Option<&CrashContext>) -> Result<()>
{
    let mut sink = FdSink::new(fd);
    write_core(task, &mut sink, crash_context)
}

/// `write_core` over an owned [`File`].
pub fn write_core_to_file(task: mach_port_t, file: File, crash_context: Option<&CrashContext>) -> Result<()>
{
    let mut sink = FileSink::new(file);
    write_core(task, &mut sink, crash_context)
}

/// Suspend every thread of the current task except the one running this
/// function. Returns the rights of the threads that were actually
/// suspended; each must see exactly one `thread_resume`.
fn suspend_all_threads_except_current(task: mach_port_t) -> Result<Vec<SendRight>>
{
    let current_thread = SendRight::wrap(unsafe { ffi::mach_thread_self() });
    let threads = enumerate_threads(task)?;

    let mut suspended = Vec::with_capacity(threads.len());
    for (index, thread) in threads.into_iter().enumerate() {
        if thread.get() == current_thread.get() {
            continue;
        }

        let kr = unsafe { ffi::thread_suspend(thread.get()) };
        if kr == KERN_SUCCESS {
            suspended.push(thread);
        } else {
            // Threads start and end between task_threads and here.
            debug!(index, kr, "failed to suspend thread, skipping");
        }
    }

    debug!("suspended {} threads for self-dump", suspended.len());
    Ok(suspended)
}

fn resume_threads(threads: &[SendRight])
{
    for thread in threads {
        let kr = unsafe { ffi::thread_resume(thread.get()) };
        if kr != KERN_SUCCESS {
            warn!(port = thread.get(), kr, "failed to resume thread");
        }
    }
}

/// Emit one `LC_THREAD` per thread and collect the memory ranges worth
/// preserving: code around every call-stack address, plus each thread's
/// stack from `sp` to the top of its stack region.
fn add_threads_to_core(
    task: mach_port_t,
    builder: &mut CoreFileBuilder,
    modules: &mut ModuleCatalog,
    region_map: &MemoryRegionMap,
    crash_context: Option<&CrashContext>,
    memory_ranges: &mut DisjointIntervalSet,
) -> Result<()>
{
    let current_thread = SendRight::wrap(unsafe { ffi::mach_thread_self() });
    let threads = enumerate_threads(task)?;
    debug!("enumerating {} threads", threads.len());

    for (index, thread) in threads.iter().enumerate() {
        let tid = thread_id(thread.get());
        if tid.is_none() {
            warn!(index, "unable to resolve thread id");
        }

        let crashed = crash_context.filter(|context| tid == Some(context.crashed_tid));
        let (gpr, exc) = match crashed {
            Some(context) => {
                debug!(tid = context.crashed_tid, "substituting crash-context register state");
                (*context.gpr(), *context.exc())
            }
            None => match capture_thread_state(thread.get()) {
                Ok(state) => state,
                Err(err) => {
                    warn!(index, %err, "skipping thread");
                    continue;
                }
            },
        };

        builder.add_thread_command(&thread_command_blocks(&gpr, &exc))?;

        let call_stack = walk_thread_stack(task, region_map, modules, &gpr, &exc);
        for &ip in &call_stack {
            if ip >= SURROUNDING_CODE_RANGE && ip <= u64::MAX - SURROUNDING_CODE_RANGE {
                memory_ranges.insert(ip - SURROUNDING_CODE_RANGE, 2 * SURROUNDING_CODE_RANGE + 1);
            } else {
                warn!(index, ip = format_args!("{ip:#x}"), "call stack address out of range, skipping");
            }

            modules.mark_as_executing(ip);
        }

        let sp = gpr.stack_pointer();
        let Some(stack_region) = region_map.lookup(sp) else {
            warn!(index, sp = format_args!("{sp:#x}"), "stack pointer is in unmapped memory");
            continue;
        };
        if stack_region.kind != RegionKind::Stack {
            debug!(index, sp = format_args!("{sp:#x}"), "stack pointer is in non-stack memory");
        }

        // The current thread's stack keeps changing after its registers
        // were captured; including it would pair fresh bytes with stale
        // registers and produce a garbled trace. With a crash context the
        // interesting state was captured at fault time and the stack below
        // it is frozen, so it goes in.
        if thread.get() != current_thread.get() || crash_context.is_some() {
            memory_ranges.insert(sp, stack_region.end() - sp);
        }
    }

    Ok(())
}

/// How many bits of a virtual address are actually significant, per the
/// kernel.
fn addressable_bits() -> Result<u32>
{
    const NAMES: [&std::ffi::CStr; 2] = [c"machdep.virtual_address_size", c"machdep.cpu.address_bits.virtual"];

    for name in NAMES {
        let mut value: u32 = 0;
        let mut len = std::mem::size_of::<u32>();
        let rc = unsafe {
            libc::sysctlbyname(
                name.as_ptr(),
                (&mut value as *mut u32).cast(),
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc == 0 {
            return Ok(value);
        }
    }

    Err(DumpError::TaskIntrospection {
        call: "sysctlbyname(machdep.virtual_address_size)",
        kr: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
    })
}
