//! # Thread Register State
//!
//! Architecture-specific general-purpose and exception register blocks, laid
//! out exactly as the kernel's `thread_get_state()` flavors report them (and
//! as `LC_THREAD` consumers expect to find them).
//!
//! ## Register-set kinds
//!
//! The `kind` value stored in front of each record inside an `LC_THREAD`
//! command is the thread-state flavor number:
//!
//! - x86-64: GPR = 4 (`x86_THREAD_STATE64`), EXC = 6 (`x86_EXCEPTION_STATE64`)
//! - ARM64: GPR = 6 (`ARM_THREAD_STATE64`), EXC = 7 (`ARM_EXCEPTION_STATE64`)

use crate::layout::RegisterBlock;

/// View a register state struct as the 32-bit words the kernel traffics in.
///
/// Sound for the `#[repr(C)]` all-integer states below; their sizes are
/// multiples of four and every bit pattern is a valid value.
fn state_words<T: Copy>(state: &T) -> Vec<u32>
{
    let len = std::mem::size_of::<T>() / 4;
    let words = unsafe { std::slice::from_raw_parts((state as *const T).cast::<u32>(), len) };
    words.to_vec()
}

#[cfg(target_arch = "aarch64")]
mod arch
{
    use super::state_words;
    use crate::layout::RegisterBlock;

    /// `ARM_THREAD_STATE64` flavor and register-set kind.
    pub const GPR_FLAVOR: i32 = 6;
    /// `ARM_EXCEPTION_STATE64` flavor and register-set kind.
    pub const EXC_FLAVOR: i32 = 7;
    pub const GPR_KIND: u32 = 6;
    pub const EXC_KIND: u32 = 7;

    /// `_STRUCT_ARM_THREAD_STATE64`: x0-x28, fp, lr, sp, pc, cpsr.
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct GprState
    {
        pub x: [u64; 29],
        pub fp: u64,
        pub lr: u64,
        pub sp: u64,
        pub pc: u64,
        pub cpsr: u32,
        pub pad: u32,
    }

    /// `_STRUCT_ARM_EXCEPTION_STATE64`.
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct ExcState
    {
        /// Fault address register.
        pub far: u64,
        /// Exception syndrome register.
        pub esr: u32,
        pub exception: u32,
    }

    impl Default for GprState
    {
        fn default() -> Self
        {
            // No Default for [u64; 29] via derive; spell it out.
            Self {
                x: [0; 29],
                fp: 0,
                lr: 0,
                sp: 0,
                pc: 0,
                cpsr: 0,
                pad: 0,
            }
        }
    }

    impl Default for ExcState
    {
        fn default() -> Self
        {
            Self {
                far: 0,
                esr: 0,
                exception: 0,
            }
        }
    }

    impl GprState
    {
        pub fn instruction_pointer(&self) -> u64
        {
            self.pc
        }

        pub fn frame_pointer(&self) -> u64
        {
            self.fp
        }

        pub fn stack_pointer(&self) -> u64
        {
            self.sp
        }

        pub fn link_register(&self) -> u64
        {
            self.lr
        }

        pub fn register_block(&self) -> RegisterBlock
        {
            RegisterBlock::new(GPR_KIND, state_words(self))
        }
    }

    impl ExcState
    {
        pub fn register_block(&self) -> RegisterBlock
        {
            RegisterBlock::new(EXC_KIND, state_words(self))
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod arch
{
    use super::state_words;
    use crate::layout::RegisterBlock;

    /// `x86_THREAD_STATE64` flavor and register-set kind.
    pub const GPR_FLAVOR: i32 = 4;
    /// `x86_EXCEPTION_STATE64` flavor and register-set kind.
    pub const EXC_FLAVOR: i32 = 6;
    pub const GPR_KIND: u32 = 4;
    pub const EXC_KIND: u32 = 6;

    /// `_STRUCT_X86_THREAD_STATE64`.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct GprState
    {
        pub rax: u64,
        pub rbx: u64,
        pub rcx: u64,
        pub rdx: u64,
        pub rdi: u64,
        pub rsi: u64,
        pub rbp: u64,
        pub rsp: u64,
        pub r8: u64,
        pub r9: u64,
        pub r10: u64,
        pub r11: u64,
        pub r12: u64,
        pub r13: u64,
        pub r14: u64,
        pub r15: u64,
        pub rip: u64,
        pub rflags: u64,
        pub cs: u64,
        pub fs: u64,
        pub gs: u64,
    }

    /// `_STRUCT_X86_EXCEPTION_STATE64`.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ExcState
    {
        pub trapno: u16,
        pub cpu: u16,
        pub err: u32,
        pub faultvaddr: u64,
    }

    impl GprState
    {
        pub fn instruction_pointer(&self) -> u64
        {
            self.rip
        }

        pub fn frame_pointer(&self) -> u64
        {
            self.rbp
        }

        pub fn stack_pointer(&self) -> u64
        {
            self.rsp
        }

        /// No link register on x86-64; the walker never consults it here.
        pub fn link_register(&self) -> u64
        {
            0
        }

        pub fn register_block(&self) -> RegisterBlock
        {
            RegisterBlock::new(GPR_KIND, state_words(self))
        }
    }

    impl ExcState
    {
        pub fn register_block(&self) -> RegisterBlock
        {
            RegisterBlock::new(EXC_KIND, state_words(self))
        }
    }
}

#[cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]
pub use arch::{ExcState, GprState, EXC_FLAVOR, EXC_KIND, GPR_FLAVOR, GPR_KIND};

/// Number of 32-bit words in the GPR state.
#[cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]
pub const GPR_WORD_COUNT: u32 = (std::mem::size_of::<GprState>() / 4) as u32;

/// Number of 32-bit words in the exception state.
#[cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]
pub const EXC_WORD_COUNT: u32 = (std::mem::size_of::<ExcState>() / 4) as u32;

/// Pack a `(GPR, EXC)` pair into the records of one `LC_THREAD` command, GPR
/// first.
#[cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]
pub fn thread_command_blocks(gpr: &GprState, exc: &ExcState) -> [RegisterBlock; 2]
{
    [gpr.register_block(), exc.register_block()]
}

#[cfg(all(test, any(target_arch = "aarch64", target_arch = "x86_64")))]
mod tests
{
    use super::*;

    #[test]
    fn test_gpr_word_count_matches_kernel_flavor()
    {
        #[cfg(target_arch = "aarch64")]
        assert_eq!(GPR_WORD_COUNT, 68); // ARM_THREAD_STATE64_COUNT
        #[cfg(target_arch = "x86_64")]
        assert_eq!(GPR_WORD_COUNT, 42); // x86_THREAD_STATE64_COUNT
        assert_eq!(EXC_WORD_COUNT, 4);
    }

    #[test]
    fn test_register_block_carries_exact_words()
    {
        let mut gpr = GprState::default();
        #[cfg(target_arch = "aarch64")]
        {
            gpr.pc = 0x1_0000_0004;
        }
        #[cfg(target_arch = "x86_64")]
        {
            gpr.rip = 0x1_0000_0004;
        }

        let block = gpr.register_block();
        assert_eq!(block.kind, GPR_KIND);
        assert_eq!(block.words.len() as u32, GPR_WORD_COUNT);

        // The instruction pointer must appear in the words, low half first.
        let words = &block.words;
        let found = words
            .windows(2)
            .any(|w| w[0] == 0x0000_0004 && w[1] == 0x0000_0001);
        assert!(found, "pc value not found in serialized words");
    }
}
