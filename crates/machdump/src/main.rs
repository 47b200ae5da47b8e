//! # machdump driver
//!
//! Test driver exercising machdump-core end to end: plain self dumps,
//! in-process crash dumps via a signal trampoline, and out-of-process
//! dumps where a parent dumps its crashed worker.
//!
//! ```text
//! machdump <operation> <ip|oop> <main-thread|background-thread> <core-path>
//! ```
//!
//! Operations: `create-core`, `crash-null-call`, `crash-invalid-write`,
//! `crash-invalid-call`, `crash-nonexec-call`.

#[cfg(target_os = "macos")]
fn main()
{
    driver::run();
}

#[cfg(not(target_os = "macos"))]
fn main()
{
    eprintln!("machdump only supports Darwin targets");
    std::process::exit(1);
}

#[cfg(target_os = "macos")]
mod driver
{
    use std::ffi::CString;
    use std::sync::OnceLock;
    use std::thread;
    use std::time::Duration;

    use libc::{c_int, c_void, mach_port_t, pid_t, siginfo_t};
    use machdump_core::crash_context::{CrashContext, Mcontext64};
    use machdump_core::{write_core_to_fd, write_core_to_file};
    use machdump_utils::init_logging;
    use tracing::{error, info};

    extern "C" {
        fn task_for_pid(target: mach_port_t, pid: c_int, task: *mut mach_port_t) -> c_int;
        fn pthread_threadid_np(thread: *mut c_void, tid: *mut u64) -> c_int;
    }

    /// A pointer that is neither mapped nor mappable.
    const INVALID_PTR: usize = 0xFFFF_FFFF_FFFA_7B00;

    /// Core path for the signal handler, set before any crash operation.
    static CORE_PATH: OnceLock<CString> = OnceLock::new();

    static mut SPIN_SINK: u32 = 0;

    /// Busy loop for cross-task dump scenarios; a dump of this process must
    /// show a frame inside `spin`.
    #[inline(never)]
    fn spin() -> u32
    {
        for _ in 0..u64::MAX {
            unsafe {
                let value = std::ptr::read_volatile(std::ptr::addr_of!(SPIN_SINK));
                std::ptr::write_volatile(std::ptr::addr_of_mut!(SPIN_SINK), value.wrapping_mul(2));
            }
        }
        unsafe { std::ptr::read_volatile(std::ptr::addr_of!(SPIN_SINK)) }
    }

    /// A couple of extra threads so dumps carry multi-thread state.
    fn setup_misc_threads()
    {
        thread::Builder::new()
            .name("spinner".into())
            .spawn(|| {
                spin();
            })
            .expect("failed to spawn spinner");

        thread::Builder::new()
            .name("sleeper".into())
            .spawn(|| thread::sleep(Duration::from_secs(60)))
            .expect("failed to spawn sleeper");
    }

    fn current_tid() -> u64
    {
        let mut tid: u64 = 0;
        unsafe {
            pthread_threadid_np(std::ptr::null_mut(), &mut tid);
        }
        tid
    }

    /// Build a [`CrashContext`] out of the signal-delivered ucontext.
    unsafe fn crash_context_from_ucontext(context: *mut c_void) -> CrashContext
    {
        let ucontext = context.cast::<libc::ucontext_t>();
        let mcontext = (*ucontext).uc_mcontext.cast::<Mcontext64>();

        CrashContext {
            mcontext: std::ptr::read(mcontext),
            crashed_tid: current_tid(),
        }
    }

    fn open_core_file(path: &CString) -> c_int
    {
        unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, 0o666) }
    }

    /// In-process trampoline: capture the fault state, dump self, die.
    extern "C" fn crash_handler(_sig: c_int, _info: *mut siginfo_t, context: *mut c_void)
    {
        unsafe {
            let crash_context = crash_context_from_ucontext(context);

            if let Some(path) = CORE_PATH.get() {
                let fd = open_core_file(path);
                if fd >= 0 {
                    let task = mach2::traps::mach_task_self();
                    let _ = write_core_to_fd(task, fd, Some(&crash_context));
                }
            }

            libc::kill(libc::getpid(), libc::SIGKILL);
        }
    }

    /// Out-of-process trampoline: ship the raw crash context to the parent
    /// over stdout and park until the parent kills us.
    extern "C" fn oop_crash_handler(_sig: c_int, _info: *mut siginfo_t, context: *mut c_void)
    {
        unsafe {
            let crash_context = crash_context_from_ucontext(context);
            let bytes = crash_context.as_bytes();
            let _ = libc::write(libc::STDOUT_FILENO, bytes.as_ptr().cast(), bytes.len());

            libc::sleep(60);
            libc::kill(libc::getpid(), libc::SIGKILL);
        }
    }

    type Handler = extern "C" fn(c_int, *mut siginfo_t, *mut c_void);

    fn install_crash_signals(handler: Handler) -> bool
    {
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as usize;
            // SA_NODEFER keeps reentrant faults from deadlocking; the
            // handler never returns anyway.
            action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
            libc::sigemptyset(&mut action.sa_mask);

            for signal in [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGABRT, libc::SIGFPE] {
                if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                    return false;
                }
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    fn create_core(core_path: &str) -> bool
    {
        let file = match std::fs::File::create(core_path) {
            Ok(file) => file,
            Err(err) => {
                error!(%err, core_path, "unable to create core file");
                return false;
            }
        };

        let task = unsafe { mach2::traps::mach_task_self() };
        match write_core_to_file(task, file, None) {
            Ok(()) => {
                info!(core_path, "core written");
                true
            }
            Err(err) => {
                error!(%err, "core dump failed");
                false
            }
        }
    }

    #[inline(never)]
    fn crash_null_call(_core_path: &str) -> bool
    {
        unsafe {
            let target: usize = std::ptr::read_volatile(&0usize);
            let func: extern "C" fn() = std::mem::transmute(target);
            func();
        }
        false // unreachable
    }

    #[inline(never)]
    fn crash_invalid_write(_core_path: &str) -> bool
    {
        unsafe {
            std::ptr::write_volatile(INVALID_PTR as *mut u32, 42);
        }
        false // unreachable
    }

    #[inline(never)]
    fn crash_invalid_call(_core_path: &str) -> bool
    {
        unsafe {
            let func: extern "C" fn() = std::mem::transmute(INVALID_PTR);
            func();
        }
        false // unreachable
    }

    /// Call through a pointer into readable but non-executable memory; on
    /// ARM64 the walker must classify the top frame as partial and recover
    /// the caller from lr.
    #[inline(never)]
    fn crash_nonexec_call(_core_path: &str) -> bool
    {
        static NOT_CODE: [u8; 64] = [0xC3; 64];
        unsafe {
            let func: extern "C" fn() = std::mem::transmute(NOT_CODE.as_ptr());
            func();
        }
        false // unreachable
    }

    const OPERATIONS: [(&str, fn(&str) -> bool); 5] = [
        ("create-core", create_core),
        ("crash-null-call", crash_null_call),
        ("crash-invalid-write", crash_invalid_write),
        ("crash-invalid-call", crash_invalid_call),
        ("crash-nonexec-call", crash_nonexec_call),
    ];

    fn operation_fn(name: &str) -> Option<fn(&str) -> bool>
    {
        OPERATIONS.iter().find(|(op, _)| *op == name).map(|(_, f)| *f)
    }

    fn is_crash_operation(name: &str) -> bool
    {
        name.starts_with("crash-")
    }

    fn run_operation(operation: fn(&str) -> bool, on_background_thread: bool, core_path: &str) -> bool
    {
        if on_background_thread {
            let path = core_path.to_string();
            let handle = thread::Builder::new()
                .name("operation".into())
                .spawn(move || operation(&path))
                .expect("failed to spawn operation thread");
            handle.join().unwrap_or(false)
        } else {
            operation(core_path)
        }
    }

    // ------------------------------------------------------------------
    // Out-of-process mode
    // ------------------------------------------------------------------

    /// Spawn ourselves in worker mode with stdout piped back, so a crash
    /// context can travel up the pipe.
    fn spawn_oop_worker(operation: &str, on_background_thread: bool, core_path: &str, crash: bool)
        -> Option<(pid_t, c_int)>
    {
        let exe = std::env::current_exe().ok()?;
        let exe = CString::new(exe.to_str()?).ok()?;

        let args: Vec<CString> = [
            exe.to_str().ok()?,
            "oop-worker",
            operation,
            if on_background_thread { "background-thread" } else { "main-thread" },
            core_path,
        ]
        .iter()
        .map(|s| CString::new(*s).ok())
        .collect::<Option<_>>()?;
        let mut argv: Vec<*mut libc::c_char> = args.iter().map(|a| a.as_ptr() as *mut _).collect();
        argv.push(std::ptr::null_mut());

        unsafe {
            let mut pipe_fds = [0 as c_int; 2];
            if crash && libc::pipe(pipe_fds.as_mut_ptr()) != 0 {
                return None;
            }

            let mut file_actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            if crash {
                libc::posix_spawn_file_actions_init(&mut file_actions);
                libc::posix_spawn_file_actions_adddup2(&mut file_actions, pipe_fds[1], libc::STDOUT_FILENO);
                libc::posix_spawn_file_actions_addclose(&mut file_actions, pipe_fds[0]);
                libc::posix_spawn_file_actions_addclose(&mut file_actions, pipe_fds[1]);
            }

            let mut pid: pid_t = 0;
            let rc = libc::posix_spawn(
                &mut pid,
                exe.as_ptr(),
                if crash { &file_actions } else { std::ptr::null() },
                std::ptr::null(),
                argv.as_ptr(),
                std::ptr::null(),
            );

            if crash {
                libc::posix_spawn_file_actions_destroy(&mut file_actions);
                libc::close(pipe_fds[1]);
            }

            if rc != 0 {
                if crash {
                    libc::close(pipe_fds[0]);
                }
                error!(rc, "posix_spawn failed");
                return None;
            }

            Some((pid, if crash { pipe_fds[0] } else { -1 }))
        }
    }

    /// Parent side of the out-of-process protocol: read exactly one raw
    /// crash context off the worker's stdout, dump the worker cross-task,
    /// then kill it.
    fn run_oop(operation_name: &str, on_background_thread: bool, core_path: &str) -> bool
    {
        let crash = is_crash_operation(operation_name);
        let Some((pid, stdout_fd)) = spawn_oop_worker(operation_name, on_background_thread, core_path, crash) else {
            return false;
        };

        if !crash {
            let mut status: c_int = 0;
            unsafe { libc::waitpid(pid, &mut status, 0) };
            return libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0;
        }

        let result = (|| {
            let mut bytes = vec![0u8; std::mem::size_of::<CrashContext>()];
            let mut read_total = 0usize;
            while read_total < bytes.len() {
                let n = unsafe {
                    libc::read(stdout_fd, bytes[read_total..].as_mut_ptr().cast(), bytes.len() - read_total)
                };
                if n <= 0 {
                    error!("worker closed the pipe before sending a full crash context");
                    return false;
                }
                read_total += n as usize;
            }
            let Some(crash_context) = CrashContext::from_bytes(&bytes) else {
                return false;
            };

            let mut task: mach_port_t = 0;
            if unsafe { task_for_pid(mach2::traps::mach_task_self(), pid, &mut task) } != 0 {
                error!(pid, "task_for_pid failed (needs sudo or a debugger entitlement)");
                return false;
            }

            let file = match std::fs::File::create(core_path) {
                Ok(file) => file,
                Err(err) => {
                    error!(%err, core_path, "unable to create core file");
                    return false;
                }
            };

            match write_core_to_file(task, file, Some(&crash_context)) {
                Ok(()) => {
                    info!(pid, core_path, "worker core written");
                    true
                }
                Err(err) => {
                    error!(%err, "worker core dump failed");
                    false
                }
            }
        })();

        unsafe {
            libc::close(stdout_fd);
            libc::kill(pid, libc::SIGKILL);
            let mut status: c_int = 0;
            loop {
                if libc::waitpid(pid, &mut status, 0) != -1 || *libc::__error() != libc::EINTR {
                    break;
                }
            }
        }

        result
    }

    fn run_oop_worker(operation_name: &str, on_background_thread: bool, core_path: &str) -> bool
    {
        if is_crash_operation(operation_name) && !install_crash_signals(oop_crash_handler) {
            return false;
        }

        let Some(operation) = operation_fn(operation_name) else {
            return false;
        };
        run_operation(operation, on_background_thread, core_path)
    }

    // ------------------------------------------------------------------
    // Entry
    // ------------------------------------------------------------------

    fn usage(argv0: &str) -> !
    {
        eprintln!("Usage: {argv0} <operation> <ip|oop> <main-thread|background-thread> <core-path>");
        eprintln!("Operations:");
        for (name, _) in OPERATIONS {
            eprintln!("\t{name}");
        }
        std::process::exit(1);
    }

    pub fn run()
    {
        if let Err(err) = init_logging() {
            eprintln!("Failed to initialize logging: {err}");
            std::process::exit(1);
        }

        let args: Vec<String> = std::env::args().collect();
        let argv0 = args.first().map(String::as_str).unwrap_or("machdump").to_string();

        setup_misc_threads();

        // Worker mode is a technical detail, not part of the CLI surface.
        if args.len() == 5 && args[1] == "oop-worker" {
            let ok = run_oop_worker(&args[2], args[3] == "background-thread", &args[4]);
            std::process::exit(if ok { 0 } else { 1 });
        }

        if args.len() != 5 {
            usage(&argv0);
        }

        let operation_name = args[1].as_str();
        let oop = match args[2].as_str() {
            "ip" => false,
            "oop" => true,
            other => {
                eprintln!("Unknown process mode: {other}");
                usage(&argv0);
            }
        };
        let on_background_thread = match args[3].as_str() {
            "main-thread" => false,
            "background-thread" => true,
            other => {
                eprintln!("Unknown thread mode: {other}");
                usage(&argv0);
            }
        };
        let core_path = args[4].as_str();

        if operation_fn(operation_name).is_none() {
            eprintln!("Unknown operation: {operation_name}");
            usage(&argv0);
        }

        let ok = if oop {
            run_oop(operation_name, on_background_thread, core_path)
        } else {
            if is_crash_operation(operation_name) {
                let path = CString::new(core_path).expect("core path contains a NUL");
                CORE_PATH.set(path).expect("core path already set");
                if !install_crash_signals(crash_handler) {
                    error!("failed to install crash signal handlers");
                    std::process::exit(1);
                }
            }

            let operation = operation_fn(operation_name).unwrap_or_else(|| usage(&argv0));
            run_operation(operation, on_background_thread, core_path)
        };

        std::process::exit(if ok { 0 } else { 1 });
    }
}
