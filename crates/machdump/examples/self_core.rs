//! Minimal self-dump: write a core of the current process and exit.
//!
//! ```sh
//! cargo run --example self_core -- /tmp/self.core
//! ```

#[cfg(target_os = "macos")]
fn main()
{
    use machdump_core::write_core_to_file;

    machdump_utils::init_logging().expect("Failed to initialize logging");

    let path = std::env::args().nth(1).unwrap_or_else(|| "self.core".to_string());
    let file = std::fs::File::create(&path).expect("unable to create core file");

    let task = unsafe { mach2::traps::mach_task_self() };
    match write_core_to_file(task, file, None) {
        Ok(()) => println!("core written to {path}"),
        Err(err) => {
            eprintln!("core dump failed: {err}");
            std::process::exit(1);
        }
    }
}

#[cfg(not(target_os = "macos"))]
fn main()
{
    eprintln!("machdump only supports Darwin targets");
}
