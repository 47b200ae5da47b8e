//! # Top-Frame Classification and the Per-Thread Walk
//!
//! Frame-pointer chasing handles every frame except the topmost one, which
//! may not exist yet (prologue never ran) or at all (frameless leaf). On
//! ARM64 we classify the top frame before unwinding:
//!
//! 1. If the exception looks like a control-transfer fault and the pc is
//!    not in executable memory, control jumped somewhere bogus; if the
//!    instruction before the return address is a branch-with-link, the
//!    frame is partial.
//! 2. Otherwise consult the image's `__unwind_info` (compact unwind): a
//!    `FRAMELESS` encoding means leaf, `FRAME` means conventional.
//! 3. If compact unwind has no answer and the previous instruction is an
//!    SVC, treat as frameless: the syscall wrappers in
//!    libsystem_kernel.dylib carry no unwind entries, and threads parked in
//!    a syscall are the common case in a dump.
//!
//! On x86-64 none of this is attempted (correct top-frame classification
//! would need a full disassembler) and plain frame-pointer chasing is used.
//!
//! Compact unwind reference: a two-level page table; the first level maps
//! function offsets to second-level pages, each either *regular* (explicit
//! `(offset, encoding)` pairs) or *compressed* (packed entries indexing a
//! common-encodings table). See <https://faultlore.com/blah/compact-unwinding/>.

use libc::mach_port_t;

use crate::module::ModuleCatalog;
use crate::region::MemoryRegionMap;
use crate::stackwalk::{walk_stack, WalkSeed};
use crate::thread_state::{ExcState, GprState};

use crate::platform::macos::memory::TaskMemory;

/// Walk one thread's call stack from its captured register state. Returns
/// instruction pointers in call order, topmost frame first.
pub fn walk_thread_stack(
    task: mach_port_t,
    regions: &MemoryRegionMap,
    modules: &ModuleCatalog,
    gpr: &GprState,
    exc: &ExcState,
) -> Vec<u64>
{
    #[cfg(target_arch = "aarch64")]
    let top_frame_has_no_frame = arm64::top_frame_has_no_frame(task, regions, modules, gpr, exc);
    #[cfg(not(target_arch = "aarch64"))]
    let top_frame_has_no_frame = {
        let _ = (regions, modules, exc);
        false
    };

    let seed = WalkSeed {
        instruction_pointer: gpr.instruction_pointer(),
        frame_pointer: gpr.frame_pointer(),
        link_register: gpr.link_register(),
        top_frame_has_no_frame,
    };

    walk_stack(&TaskMemory { task }, &seed)
}

#[cfg(target_arch = "aarch64")]
mod arm64
{
    use libc::mach_port_t;
    use tracing::warn;

    use crate::layout::{self, LC_SEGMENT_64};
    use crate::module::{ModuleCatalog, ModuleInfo};
    use crate::platform::macos::memory::read_task_value;
    use crate::region::MemoryRegionMap;
    use crate::stackwalk::{exception_class_is_control_transfer, is_branch_link_instruction, is_svc_instruction};
    use crate::thread_state::{ExcState, GprState};

    const UNWIND_SECOND_LEVEL_REGULAR: u32 = 2;
    const UNWIND_SECOND_LEVEL_COMPRESSED: u32 = 3;
    const UNWIND_ARM64_MODE_MASK: u32 = 0x0F00_0000;
    const UNWIND_ARM64_MODE_FRAMELESS: u32 = 0x0200_0000;
    const UNWIND_ARM64_MODE_FRAME: u32 = 0x0400_0000;

    /// `unwind_info_section_header`
    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct UnwindSectionHeader
    {
        version: u32,
        common_encodings_array_section_offset: u32,
        common_encodings_array_count: u32,
        personality_array_section_offset: u32,
        personality_array_count: u32,
        index_section_offset: u32,
        index_count: u32,
    }

    /// `unwind_info_section_header_index_entry`
    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct UnwindIndexEntry
    {
        function_offset: u32,
        second_level_pages_section_offset: u32,
        lsda_index_array_section_offset: u32,
    }

    /// `unwind_info_regular_second_level_page_header`
    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct RegularPageHeader
    {
        kind: u32,
        entry_page_offset: u16,
        entry_count: u16,
    }

    /// `unwind_info_regular_second_level_entry`
    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct RegularPageEntry
    {
        function_offset: u32,
        encoding: u32,
    }

    /// `unwind_info_compressed_second_level_page_header`
    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct CompressedPageHeader
    {
        kind: u32,
        entry_page_offset: u16,
        entry_count: u16,
        encodings_page_offset: u16,
        encodings_count: u16,
    }

    fn compressed_entry_func_offset(entry: u32) -> u32
    {
        entry & 0x00FF_FFFF
    }

    fn compressed_entry_encoding_index(entry: u32) -> u16
    {
        ((entry >> 24) & 0xFF) as u16
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FrameLookup
    {
        HasFrame,
        Frameless,
        Unknown,
    }

    /// The instruction immediately before `address`, if readable. ARM64
    /// instructions are a fixed 4 bytes.
    fn previous_instruction(task: mach_port_t, address: u64) -> Option<u32>
    {
        let location = address.checked_sub(4)?;
        match read_task_value::<u32>(task, location) {
            Ok(instruction) => Some(instruction),
            Err(_) => {
                warn!(address = format_args!("{location:#x}"), "failed to read instruction");
                None
            }
        }
    }

    /// Binary-search for the last entry with `function_offset <= target`,
    /// reading entries through `fetch`. Returns the winning index.
    fn search_entries<F: Fn(u32) -> Option<u32>>(count: u32, target: u32, fetch: F) -> Option<u32>
    {
        let mut low = 0u32;
        let mut high = count;
        while low < high {
            let mid = low + (high - low) / 2;
            let function_offset = fetch(mid)?;
            if function_offset <= target {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        low.checked_sub(1)
    }

    /// Find the `__unwind_info` section address and the pre-slide `__TEXT`
    /// vmaddr by re-walking the image's raw load commands. (The parsed
    /// segment list has `__TEXT` rewritten to the slid address, so the raw
    /// bytes are the only place the file-side vmaddr still lives.)
    fn unwind_section_of(module: &ModuleInfo) -> Option<(u64, u64)>
    {
        const SECTION_64_SIZE: usize = 80;

        let bytes = &*module.header_bytes;
        let read_u32 = |off: usize| -> Option<u32> { Some(u32::from_le_bytes(bytes.get(off..off + 4)?.try_into().ok()?)) };
        let read_u64 = |off: usize| -> Option<u64> { Some(u64::from_le_bytes(bytes.get(off..off + 8)?.try_into().ok()?)) };

        let ncmds = read_u32(16)?;
        let mut unwind_info_addr = None;
        let mut text_vmaddr = None;

        let mut offset = 32usize;
        for _ in 0..ncmds {
            let cmd = read_u32(offset)?;
            let cmdsize = read_u32(offset + 4)? as usize;
            if cmdsize < 8 {
                return None;
            }

            if cmd == LC_SEGMENT_64 {
                let name = bytes.get(offset + 8..offset + 24)?;
                if name == layout::name_field("__TEXT") {
                    text_vmaddr = Some(read_u64(offset + 24)?);
                }

                let nsects = read_u32(offset + 64)? as usize;
                for section in 0..nsects {
                    let sect_offset = offset + 72 + section * SECTION_64_SIZE;
                    let sectname = bytes.get(sect_offset..sect_offset + 16)?;
                    if sectname == layout::name_field("__unwind_info") {
                        unwind_info_addr = Some(read_u64(sect_offset + 32)?);
                    }
                }
            }

            offset = offset.checked_add(cmdsize)?;
        }

        Some((unwind_info_addr?, text_vmaddr?))
    }

    /// Consult compact unwind for `pc`: does the covering function set up a
    /// frame?
    fn lookup_stack_frame(task: mach_port_t, modules: &ModuleCatalog, pc: u64) -> FrameLookup
    {
        let Some(module) = modules.lookup(pc) else {
            return FrameLookup::Unknown;
        };
        let Some((unwind_vmaddr, text_vmaddr)) = unwind_section_of(module) else {
            return FrameLookup::Unknown;
        };

        let slide = module.load_address.wrapping_sub(text_vmaddr);
        let unwind_addr = unwind_vmaddr.wrapping_add(slide);

        let Ok(header) = read_task_value::<UnwindSectionHeader>(task, unwind_addr) else {
            return FrameLookup::Unknown;
        };

        let index_addr = unwind_addr + header.index_section_offset as u64;
        let pc_offset = (pc - module.load_address) as u32;

        let entry_size = std::mem::size_of::<UnwindIndexEntry>() as u64;
        let Some(winner) = search_entries(header.index_count, pc_offset, |i| {
            read_task_value::<UnwindIndexEntry>(task, index_addr + i as u64 * entry_size)
                .ok()
                .map(|e| e.function_offset)
        }) else {
            return FrameLookup::Unknown;
        };

        let Ok(index_entry) = read_task_value::<UnwindIndexEntry>(task, index_addr + winner as u64 * entry_size) else {
            return FrameLookup::Unknown;
        };
        if index_entry.second_level_pages_section_offset == 0 {
            return FrameLookup::Unknown;
        }

        let page_addr = unwind_addr + index_entry.second_level_pages_section_offset as u64;
        let Ok(page_kind) = read_task_value::<u32>(task, page_addr) else {
            return FrameLookup::Unknown;
        };

        let encoding = match page_kind {
            UNWIND_SECOND_LEVEL_REGULAR => {
                let Ok(page) = read_task_value::<RegularPageHeader>(task, page_addr) else {
                    return FrameLookup::Unknown;
                };
                let entries_addr = page_addr + std::mem::size_of::<RegularPageHeader>() as u64;
                let entry_size = std::mem::size_of::<RegularPageEntry>() as u64;

                let Some(winner) = search_entries(page.entry_count as u32, pc_offset, |i| {
                    read_task_value::<RegularPageEntry>(task, entries_addr + i as u64 * entry_size)
                        .ok()
                        .map(|e| e.function_offset)
                }) else {
                    return FrameLookup::Unknown;
                };

                match read_task_value::<RegularPageEntry>(task, entries_addr + winner as u64 * entry_size) {
                    Ok(entry) => entry.encoding,
                    Err(_) => return FrameLookup::Unknown,
                }
            }

            UNWIND_SECOND_LEVEL_COMPRESSED => {
                let Ok(page) = read_task_value::<CompressedPageHeader>(task, page_addr) else {
                    return FrameLookup::Unknown;
                };
                let entries_addr = page_addr + std::mem::size_of::<CompressedPageHeader>() as u64;

                // Compressed entries store offsets relative to the page's
                // base function.
                let relative_pc = pc_offset - index_entry.function_offset;
                let Some(winner) = search_entries(page.entry_count as u32, relative_pc, |i| {
                    read_task_value::<u32>(task, entries_addr + i as u64 * 4)
                        .ok()
                        .map(compressed_entry_func_offset)
                }) else {
                    return FrameLookup::Unknown;
                };

                let Ok(entry) = read_task_value::<u32>(task, entries_addr + winner as u64 * 4) else {
                    return FrameLookup::Unknown;
                };
                let encoding_index = compressed_entry_encoding_index(entry);

                let encoding_addr = if (encoding_index as u32) < header.common_encodings_array_count {
                    unwind_addr + header.common_encodings_array_section_offset as u64 + encoding_index as u64 * 4
                } else {
                    let page_index = encoding_index - header.common_encodings_array_count as u16;
                    page_addr + page.encodings_page_offset as u64 + page_index as u64 * 4
                };

                match read_task_value::<u32>(task, encoding_addr) {
                    Ok(encoding) => encoding,
                    Err(_) => return FrameLookup::Unknown,
                }
            }

            _ => return FrameLookup::Unknown,
        };

        match encoding & UNWIND_ARM64_MODE_MASK {
            UNWIND_ARM64_MODE_FRAME => FrameLookup::HasFrame,
            UNWIND_ARM64_MODE_FRAMELESS => FrameLookup::Frameless,
            _ => FrameLookup::Unknown,
        }
    }

    /// Decide whether the top function has no (complete) stack frame.
    pub fn top_frame_has_no_frame(
        task: mach_port_t,
        regions: &MemoryRegionMap,
        modules: &ModuleCatalog,
        gpr: &GprState,
        exc: &ExcState,
    ) -> bool
    {
        let pc = gpr.instruction_pointer();

        if exception_class_is_control_transfer(exc.esr) {
            let executable = regions.lookup(pc).is_some_and(|region| region.is_executable());
            if !executable {
                warn!(
                    pc = format_args!("{pc:#x}"),
                    "instruction pointer is in unmapped or non-executable memory"
                );
                // The call never completed a prologue. If lr really was set
                // by a branch-with-link, it points into the true caller.
                if previous_instruction(task, gpr.link_register()).is_some_and(is_branch_link_instruction) {
                    return true;
                }
            }
        }

        let mut lookup = lookup_stack_frame(task, modules, pc);
        if lookup == FrameLookup::Unknown && previous_instruction(task, pc).is_some_and(is_svc_instruction) {
            lookup = FrameLookup::Frameless;
        }

        // Unknown presumes a frame; it is the safer assumption.
        lookup == FrameLookup::Frameless
    }
}
