//! Crash-handler demo: install a trampoline, crash through a null function
//! pointer, and let the handler write a core carrying the fault-time
//! register state.
//!
//! ```sh
//! cargo run --example crash_core -- /tmp/crash.core
//! ```

#[cfg(target_os = "macos")]
fn main()
{
    demo::run();
}

#[cfg(not(target_os = "macos"))]
fn main()
{
    eprintln!("machdump only supports Darwin targets");
}

#[cfg(target_os = "macos")]
mod demo
{
    use std::ffi::CString;
    use std::sync::OnceLock;

    use libc::{c_int, c_void, siginfo_t};
    use machdump_core::crash_context::{CrashContext, Mcontext64};
    use machdump_core::write_core_to_fd;

    static CORE_PATH: OnceLock<CString> = OnceLock::new();

    extern "C" {
        fn pthread_threadid_np(thread: *mut c_void, tid: *mut u64) -> c_int;
    }

    extern "C" fn handler(_sig: c_int, _info: *mut siginfo_t, context: *mut c_void)
    {
        unsafe {
            let ucontext = context.cast::<libc::ucontext_t>();
            let mut crashed_tid: u64 = 0;
            pthread_threadid_np(std::ptr::null_mut(), &mut crashed_tid);

            let crash_context = CrashContext {
                mcontext: std::ptr::read((*ucontext).uc_mcontext.cast::<Mcontext64>()),
                crashed_tid,
            };

            if let Some(path) = CORE_PATH.get() {
                let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, 0o666);
                if fd >= 0 {
                    let _ = write_core_to_fd(mach2::traps::mach_task_self(), fd, Some(&crash_context));
                }
            }

            libc::kill(libc::getpid(), libc::SIGKILL);
        }
    }

    pub fn run()
    {
        machdump_utils::init_logging().expect("Failed to initialize logging");

        let path = std::env::args().nth(1).unwrap_or_else(|| "crash.core".to_string());
        CORE_PATH.set(CString::new(path).unwrap()).unwrap();

        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
            libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut());
        }

        // Crash: call through a null function pointer.
        unsafe {
            let target: usize = std::ptr::read_volatile(&0usize);
            let func: extern "C" fn() = std::mem::transmute(target);
            func();
        }
    }
}
