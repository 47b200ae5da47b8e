//! # Stack Walking
//!
//! Frame-pointer chasing over a target task's memory. The loop itself is
//! architecture-independent and reads memory through the narrow
//! [`DerefMemory`] trait; the ARM64-only classification of the *top* frame
//! (did the faulting function ever get a frame?) lives in
//! `platform::macos::unwind`, which feeds its verdict in through
//! [`WalkSeed::top_frame_has_no_frame`].
//!
//! Two top-frame cases would otherwise lose the caller:
//!
//! 1. *Partial frames*: control was transferred to a bad address, so the
//!    callee's prologue never ran and the frame pointer still belongs to the
//!    caller. The link register holds the return address.
//! 2. *Frameless leaves*: the function legitimately has no frame (compact
//!    unwind says frameless, or it is a syscall wrapper).
//!
//! In both cases frame 0 substitutes `lr` for the dereferenced return slot
//! and leaves the frame pointer untouched.

use tracing::warn;

/// Hard cap on walked frames; bounds runaway chains the zero-terminator
/// check never reaches.
pub const MAX_STACK_FRAMES: usize = 512;

/// Reader of single pointers out of the target address space.
pub trait DerefMemory
{
    /// Read the 8-byte pointer stored at `address`. Returns 0 when the read
    /// fails; the walk treats that like a terminated chain.
    fn deref(&self, address: u64) -> u64;
}

/// Starting point of one thread's walk, extracted from its register state.
#[derive(Debug, Clone, Copy)]
pub struct WalkSeed
{
    pub instruction_pointer: u64,
    pub frame_pointer: u64,
    pub link_register: u64,
    /// Top-frame verdict from the ARM64 classifier; always false on x86-64.
    pub top_frame_has_no_frame: bool,
}

/// Strip pointer-authentication bits from a code address.
///
/// On Apple Silicon every return address on the stack may carry a PAC
/// signature in its upper bits; a debugger fed such a value would look up a
/// nonsense address. XPACI clears the signature without needing the key.
#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
pub fn strip_pointer_auth(pointer: u64) -> u64
{
    let mut value = pointer;
    unsafe {
        std::arch::asm!("xpaci {ptr}", ptr = inout(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

#[cfg(not(all(target_arch = "aarch64", target_os = "macos")))]
pub fn strip_pointer_auth(pointer: u64) -> u64
{
    pointer
}

/// Walk one call stack, returning instruction pointers root-first (frame 0
/// first), each stripped of authentication bits.
pub fn walk_stack<M: DerefMemory>(memory: &M, seed: &WalkSeed) -> Vec<u64>
{
    let mut result = vec![strip_pointer_auth(seed.instruction_pointer)];

    let mut frame_pointer = seed.frame_pointer;
    let mut frame_index = 0usize;

    loop {
        let frameless_top = frame_index == 0 && seed.top_frame_has_no_frame;

        let (next_ip, next_fp) = if frameless_top {
            // The prologue never ran (or the function has no frame); the
            // caller's return address is still in lr and fp is untouched.
            (seed.link_register, frame_pointer)
        } else {
            let return_slot = match frame_pointer.checked_add(8) {
                Some(slot) => slot,
                None => break,
            };
            (memory.deref(return_slot), memory.deref(frame_pointer))
        };

        if next_fp == 0 {
            break;
        }

        result.push(strip_pointer_auth(next_ip));

        // A frame pointer that fails to advance would loop forever.
        if !frameless_top && next_fp == frame_pointer {
            warn!(frame_pointer, "frame pointer chain cycles, stopping walk");
            break;
        }

        frame_pointer = next_fp;
        frame_index += 1;

        if result.len() >= MAX_STACK_FRAMES {
            warn!("stack walk exceeded {MAX_STACK_FRAMES} frames, stopping");
            break;
        }
    }

    result
}

// ---------------------------------------------------------------------------
// ARM64 instruction predicates
//
// Pure decoders over a fetched 4-byte instruction. The task-memory fetch
// wrappers live with the rest of the platform code.
// ---------------------------------------------------------------------------

/// ESR_EL1 exception classes indicating a control-transfer-related fault.
///
/// Instruction Abort (0x20) and Data Abort (0x24); see
/// AArch64.ExceptionClass in the ARM Architecture Reference Manual.
pub fn exception_class_is_control_transfer(esr: u32) -> bool
{
    matches!((esr >> 26) & 0x3F, 0x20 | 0x24)
}

/// Is `instruction` any of the branch-with-link forms (BL, BLR, BLRA*)?
pub fn is_branch_link_instruction(instruction: u32) -> bool
{
    // BL: bits [31:26] = 100101
    if (instruction >> 26) & 0b111111 == 0b100101 {
        return true;
    }

    // BLR: bits [31:10] = 1101011000111111000000
    if (instruction >> 10) & 0b1111111111111111111111 == 0b1101011000111111000000 {
        return true;
    }

    // BLRAA/BLRAAZ/BLRAB/BLRABZ: bits [31:11] with bit 24 (Z) masked out
    (instruction >> 11) & 0b111111101111111111111 == 0b110101100011111100001
}

/// Is `instruction` an SVC (supervisor call)? Bits [31:21] = 11010100000.
pub fn is_svc_instruction(instruction: u32) -> bool
{
    (instruction >> 21) & 0x7FF == 0b11010100000
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;

    /// Frame layouts are described as (address -> value) pairs; any address
    /// not present reads as 0, like an unmapped page.
    struct MockMemory
    {
        words: HashMap<u64, u64>,
    }

    impl MockMemory
    {
        fn new(words: &[(u64, u64)]) -> Self
        {
            Self {
                words: words.iter().copied().collect(),
            }
        }
    }

    impl DerefMemory for MockMemory
    {
        fn deref(&self, address: u64) -> u64
        {
            self.words.get(&address).copied().unwrap_or(0)
        }
    }

    fn seed(ip: u64, fp: u64) -> WalkSeed
    {
        WalkSeed {
            instruction_pointer: ip,
            frame_pointer: fp,
            link_register: 0,
            top_frame_has_no_frame: false,
        }
    }

    #[test]
    fn test_walk_conventional_chain()
    {
        // Two stacked frames: fp 0x7000 -> fp 0x7100 -> 0.
        let memory = MockMemory::new(&[
            (0x7000, 0x7100),
            (0x7008, 0x1111),
            (0x7100, 0x7200),
            (0x7108, 0x2222),
            (0x7200, 0),
        ]);

        let stack = walk_stack(&memory, &seed(0xAAAA, 0x7000));
        assert_eq!(stack, vec![0xAAAA, 0x1111, 0x2222]);
    }

    #[test]
    fn test_walk_terminates_on_zero_frame_pointer()
    {
        let memory = MockMemory::new(&[]);
        let stack = walk_stack(&memory, &seed(0xAAAA, 0x7000));
        // Dereferencing unmapped memory yields 0, ending the walk after the
        // top frame.
        assert_eq!(stack, vec![0xAAAA]);
    }

    #[test]
    fn test_walk_terminates_on_self_referencing_frame()
    {
        // fp slot points at itself: a cycle that a naive chase never exits.
        let memory = MockMemory::new(&[(0x7000, 0x7000), (0x7008, 0x1111)]);
        let stack = walk_stack(&memory, &seed(0xAAAA, 0x7000));
        assert_eq!(stack, vec![0xAAAA, 0x1111]);
    }

    #[test]
    fn test_walk_is_bounded_on_long_chains()
    {
        // An advancing chain with no terminator: every fp points 16 bytes up.
        let mut words = Vec::new();
        for i in 0..10_000u64 {
            let fp = 0x10_0000 + i * 16;
            words.push((fp, fp + 16));
            words.push((fp + 8, 0xC0DE));
        }
        let memory = MockMemory::new(&words);

        let stack = walk_stack(&memory, &seed(0xAAAA, 0x10_0000));
        assert_eq!(stack.len(), MAX_STACK_FRAMES);
    }

    #[test]
    fn test_frameless_top_frame_substitutes_link_register()
    {
        let memory = MockMemory::new(&[
            (0x7000, 0x7100),
            (0x7008, 0xBAD0), // would be wrong: fp still belongs to the caller
            (0x7100, 0),
        ]);

        let seed = WalkSeed {
            instruction_pointer: 0xAAAA,
            frame_pointer: 0x7000,
            link_register: 0xCCCC,
            top_frame_has_no_frame: true,
        };

        let stack = walk_stack(&memory, &seed);
        // Frame 1 comes from lr, frame 2 from the (caller-owned) frame record.
        assert_eq!(stack, vec![0xAAAA, 0xCCCC, 0xBAD0]);
    }

    #[test]
    fn test_exception_class_decoding()
    {
        assert!(exception_class_is_control_transfer(0x20 << 26));
        assert!(exception_class_is_control_transfer(0x24 << 26 | 0x3FF));
        assert!(!exception_class_is_control_transfer(0x15 << 26)); // SVC class
        assert!(!exception_class_is_control_transfer(0));
    }

    #[test]
    fn test_branch_link_decoding()
    {
        assert!(is_branch_link_instruction(0x9400_0001)); // BL #4
        assert!(is_branch_link_instruction(0xD63F_0100)); // BLR x8
        assert!(is_branch_link_instruction(0xD63F_0901)); // BLRAA x8, x1
        assert!(is_branch_link_instruction(0xD73F_091F)); // BLRAAZ x8 (Z bit set)
        assert!(!is_branch_link_instruction(0xD65F_03C0)); // RET
        assert!(!is_branch_link_instruction(0x1400_0001)); // B #4
    }

    #[test]
    fn test_svc_decoding()
    {
        assert!(is_svc_instruction(0xD400_0001)); // SVC #0
        assert!(is_svc_instruction(0xD400_1081)); // SVC #0x84
        assert!(!is_svc_instruction(0xD440_0000)); // HLT-space
        assert!(!is_svc_instruction(0x9400_0001)); // BL
    }
}
