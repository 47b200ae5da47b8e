//! Integration tests that dump the test process itself and check the
//! resulting file and the resource discipline around it.
//!
//! These run on macOS only; a self-dump needs no special permissions.

#![cfg(target_os = "macos")]

use std::io::Read;
use std::thread;
use std::time::Duration;

use machdump_core::layout;
use machdump_core::sink::FileSink;
use machdump_core::{write_core, DumpError};

use mach2::traps::mach_task_self;

fn u32_at(bytes: &[u8], offset: usize) -> u32
{
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], offset: usize) -> u64
{
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

/// Total uref count over all port rights the task holds. Used to prove a
/// dump gives back every right it acquired.
mod port_refs
{
    use libc::{mach_msg_type_number_t, mach_port_t};
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;

    extern "C" {
        fn mach_port_names(
            task: mach_port_t,
            names: *mut *mut mach_port_t,
            names_count: *mut mach_msg_type_number_t,
            types: *mut *mut u32,
            types_count: *mut mach_msg_type_number_t,
        ) -> libc::kern_return_t;

        fn mach_port_get_refs(
            task: mach_port_t,
            name: mach_port_t,
            right: u32,
            refs: *mut u32,
        ) -> libc::kern_return_t;

        fn vm_deallocate(task: mach_port_t, address: libc::vm_address_t, size: libc::vm_size_t)
            -> libc::kern_return_t;
    }

    const MACH_PORT_RIGHT_SEND: u32 = 0;
    const MACH_PORT_RIGHT_RECEIVE: u32 = 1;
    const MACH_PORT_RIGHT_SEND_ONCE: u32 = 2;

    pub fn total() -> usize
    {
        unsafe {
            let task = mach_task_self();
            let mut names: *mut mach_port_t = std::ptr::null_mut();
            let mut names_count: mach_msg_type_number_t = 0;
            let mut types: *mut u32 = std::ptr::null_mut();
            let mut types_count: mach_msg_type_number_t = 0;

            if mach_port_names(task, &mut names, &mut names_count, &mut types, &mut types_count) != KERN_SUCCESS {
                return 0;
            }

            let mut total = 0usize;
            for i in 0..names_count as usize {
                let name = *names.add(i);
                for right in [MACH_PORT_RIGHT_RECEIVE, MACH_PORT_RIGHT_SEND, MACH_PORT_RIGHT_SEND_ONCE] {
                    let mut refs: u32 = 0;
                    if mach_port_get_refs(task, name, right, &mut refs) == KERN_SUCCESS {
                        total += refs as usize;
                    }
                }
            }

            let _ = vm_deallocate(
                task,
                names as libc::vm_address_t,
                names_count as usize * std::mem::size_of::<mach_port_t>(),
            );
            let _ = vm_deallocate(
                task,
                types as libc::vm_address_t,
                types_count as usize * std::mem::size_of::<u32>(),
            );

            total
        }
    }
}

fn dump_self_to_bytes() -> Vec<u8>
{
    let mut file = tempfile::tempfile().unwrap();
    {
        let sink_file = file.try_clone().unwrap();
        write_core(unsafe { mach_task_self() }, &mut FileSink::new(sink_file), None).unwrap();
    }

    let mut bytes = Vec::new();
    use std::io::Seek;
    file.rewind().unwrap();
    file.read_to_end(&mut bytes).unwrap();
    bytes
}

#[test]
fn test_self_dump_structure()
{
    // A couple of parked threads so the dump carries more than one thread.
    let spinner = thread::spawn(|| thread::sleep(Duration::from_secs(30)));

    let bytes = dump_self_to_bytes();
    assert!(bytes.len() > 0x1000);

    // Valid core header.
    assert_eq!(u32_at(&bytes, 0), layout::MH_MAGIC_64);
    assert_eq!(u32_at(&bytes, 12), layout::MH_CORE);

    let ncmds = u32_at(&bytes, 16);
    let sizeofcmds = u32_at(&bytes, 20) as usize;

    // Walk the whole command block.
    let mut offset = 32usize;
    let mut notes = 0;
    let mut threads = 0;
    let mut segments = 0;
    let mut first_note_payload = None;
    let mut first_segment_fileoff = None;
    let mut saw_addrable = false;
    let mut saw_image_infos = false;

    for _ in 0..ncmds {
        let cmd = u32_at(&bytes, offset);
        let cmdsize = u32_at(&bytes, offset + 4) as usize;

        match cmd {
            layout::LC_NOTE => {
                notes += 1;
                let owner = &bytes[offset + 8..offset + 24];
                if owner.starts_with(b"addrable bits") {
                    saw_addrable = true;
                }
                if owner.starts_with(b"all image infos") {
                    saw_image_infos = true;
                }
                first_note_payload.get_or_insert(u64_at(&bytes, offset + 24));
            }
            layout::LC_THREAD => threads += 1,
            layout::LC_SEGMENT_64 => {
                segments += 1;
                assert_eq!(u64_at(&bytes, offset + 32), u64_at(&bytes, offset + 48)); // vmsize == filesize
                first_segment_fileoff.get_or_insert(u64_at(&bytes, offset + 40));
            }
            other => panic!("unexpected load command {other:#x}"),
        }

        offset += cmdsize;
    }

    assert_eq!(offset, 32 + sizeofcmds);
    assert_eq!(notes, 2);
    assert!(saw_addrable);
    assert!(saw_image_infos);
    assert!(threads >= 1, "at least the dumping thread must appear");
    assert!(segments >= 1);
    assert_eq!(ncmds as usize, notes + threads + segments);

    // Alignment contract.
    assert_eq!(first_note_payload.unwrap() % 16, 0);
    assert_eq!(first_segment_fileoff.unwrap() % 0x1000, 0);

    // The dyld image must be present in the image-infos path strings.
    let haystack = bytes.windows(b"/usr/lib/dyld".len()).any(|w| w == b"/usr/lib/dyld");
    assert!(haystack, "dyld image path missing from the core");

    drop(spinner); // leave it parked; the process exits anyway
}

#[test]
fn test_self_dump_does_not_leak_port_rights()
{
    // Warm up lazy allocations (zone, logging) so they do not show up as
    // a diff.
    let _ = dump_self_to_bytes();

    let before = port_refs::total();
    let _ = dump_self_to_bytes();
    let after = port_refs::total();

    assert_eq!(before, after, "port right refs leaked across write_core");
}

#[test]
fn test_invalid_task_is_rejected()
{
    let mut file = FileSink::new(tempfile::tempfile().unwrap());
    let result = write_core(0, &mut file, None);
    assert!(matches!(result, Err(DumpError::InvalidTask)));
}
