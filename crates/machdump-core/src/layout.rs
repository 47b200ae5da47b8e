//! # Mach-O Core File Layouts
//!
//! On-disk structure definitions shared by the builder and the orchestrator.
//!
//! Mach-O is a little-endian format on every CPU this crate targets, so each
//! structure serializes itself explicitly with `to_le_bytes` instead of being
//! blitted from memory. That keeps the writer independent of host struct
//! padding and makes the emitted bytes testable on any platform.
//!
//! ## References
//!
//! - `<mach-o/loader.h>` for `mach_header_64`, `segment_command_64`,
//!   `thread_command`, `note_command`
//! - LLDB `ObjectFileMachO` for the `addrable bits` / `all image infos`
//!   note payload formats

pub const MH_MAGIC_64: u32 = 0xFEED_FACF;
pub const MH_CORE: u32 = 0x4;

pub const LC_THREAD: u32 = 0x4;
pub const LC_UUID: u32 = 0x1B;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_NOTE: u32 = 0x31;

pub const CPU_TYPE_X86_64: i32 = 0x0100_0007;
pub const CPU_TYPE_ARM64: i32 = 0x0100_000C;
pub const CPU_SUBTYPE_I386_ALL: i32 = 3;

/// Fixed width of a load command owner / segment name field.
pub const NAME_FIELD_LEN: usize = 16;

/// Owner string of the addressable-bits note.
pub const ADDRABLE_BITS_OWNER: &str = "addrable bits";
/// Owner string of the all-image-infos note.
pub const ALL_IMAGE_INFOS_OWNER: &str = "all image infos";

/// Alignment of the first note payload.
pub const NOTE_PAYLOAD_ALIGN: u64 = 16;
/// Alignment of the first segment payload.
pub const SEGMENT_PAYLOAD_ALIGN: u64 = 0x1000;

pub const MACH_HEADER_64_SIZE: u64 = 32;
pub const NOTE_COMMAND_SIZE: u32 = 40;
pub const THREAD_COMMAND_HEADER_SIZE: u32 = 8;
pub const SEGMENT_COMMAND_64_SIZE: u32 = 72;
pub const IMAGE_ENTRY_SIZE: u32 = 48;
pub const SEGMENT_VMADDR_SIZE: usize = 32;
pub const ALL_IMAGE_INFOS_HEADER_SIZE: usize = 24;

/// The `(cputype, cpusubtype)` pair describing the build architecture.
pub fn host_cpu_type() -> (i32, i32)
{
    #[cfg(target_arch = "aarch64")]
    {
        (CPU_TYPE_ARM64, 0)
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        (CPU_TYPE_X86_64, CPU_SUBTYPE_I386_ALL)
    }
}

/// Round `value` up to the next multiple of `align`.
pub fn round_up(value: u64, align: u64) -> u64
{
    match value % align {
        0 => value,
        rem => value + (align - rem),
    }
}

/// Copy `name` into a fixed 16-byte field. The field is zero-padded but not
/// NUL-terminated; a 16-byte name fills it completely.
pub fn name_field(name: &str) -> [u8; NAME_FIELD_LEN]
{
    let mut field = [0u8; NAME_FIELD_LEN];
    let bytes = name.as_bytes();
    field[..bytes.len()].copy_from_slice(bytes);
    field
}

/// `mach_header_64` with `filetype = MH_CORE`.
#[derive(Debug, Clone, Copy)]
pub struct MachHeader64
{
    pub magic: u32,
    pub cputype: i32,
    pub cpusubtype: i32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl MachHeader64
{
    pub fn core_header() -> Self
    {
        let (cputype, cpusubtype) = host_cpu_type();
        Self {
            magic: MH_MAGIC_64,
            cputype,
            cpusubtype,
            filetype: MH_CORE,
            ncmds: 0,
            sizeofcmds: 0,
            flags: 0,
            reserved: 0,
        }
    }

    pub fn emit(&self, out: &mut Vec<u8>)
    {
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.cputype.to_le_bytes());
        out.extend_from_slice(&self.cpusubtype.to_le_bytes());
        out.extend_from_slice(&self.filetype.to_le_bytes());
        out.extend_from_slice(&self.ncmds.to_le_bytes());
        out.extend_from_slice(&self.sizeofcmds.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.reserved.to_le_bytes());
    }
}

/// `LC_NOTE` load command.
#[derive(Debug, Clone)]
pub struct NoteCommand
{
    pub data_owner: [u8; NAME_FIELD_LEN],
    pub offset: u64,
    pub size: u64,
}

impl NoteCommand
{
    pub fn new(owner: &str) -> Self
    {
        Self {
            data_owner: name_field(owner),
            offset: 0,
            size: 0,
        }
    }

    pub fn owner_is(&self, owner: &str) -> bool
    {
        self.data_owner == name_field(owner)
    }

    pub fn emit(&self, out: &mut Vec<u8>)
    {
        out.extend_from_slice(&LC_NOTE.to_le_bytes());
        out.extend_from_slice(&NOTE_COMMAND_SIZE.to_le_bytes());
        out.extend_from_slice(&self.data_owner);
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }
}

/// `LC_SEGMENT_64` load command. Core file segments carry no sections and an
/// empty name.
#[derive(Debug, Clone)]
pub struct SegmentCommand64
{
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: i32,
    pub initprot: i32,
}

impl SegmentCommand64
{
    pub fn new(vmaddr: u64, size: u64, prot: i32) -> Self
    {
        Self {
            vmaddr,
            vmsize: size,
            fileoff: 0,
            filesize: size,
            maxprot: prot,
            initprot: prot,
        }
    }

    pub fn emit(&self, out: &mut Vec<u8>)
    {
        out.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
        out.extend_from_slice(&SEGMENT_COMMAND_64_SIZE.to_le_bytes());
        out.extend_from_slice(&[0u8; NAME_FIELD_LEN]); // segname
        out.extend_from_slice(&self.vmaddr.to_le_bytes());
        out.extend_from_slice(&self.vmsize.to_le_bytes());
        out.extend_from_slice(&self.fileoff.to_le_bytes());
        out.extend_from_slice(&self.filesize.to_le_bytes());
        out.extend_from_slice(&self.maxprot.to_le_bytes());
        out.extend_from_slice(&self.initprot.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // nsects
        out.extend_from_slice(&0u32.to_le_bytes()); // flags
    }
}

/// One `(kind, word_count, words)` register-set record inside an `LC_THREAD`
/// command.
#[derive(Debug, Clone)]
pub struct RegisterBlock
{
    /// Thread-state flavor identifying the record to the consumer.
    pub kind: u32,
    /// Register contents as 32-bit words, exactly as the kernel reports them.
    pub words: Vec<u32>,
}

impl RegisterBlock
{
    pub fn new(kind: u32, words: Vec<u32>) -> Self
    {
        Self { kind, words }
    }

    /// On-disk size of this record: kind + word count + words.
    pub fn encoded_size(&self) -> u32
    {
        8 + (self.words.len() as u32) * 4
    }
}

/// Serialize an `LC_THREAD` command holding the given register records.
///
/// `cmdsize` is computed from the record word counts rather than from any
/// in-memory struct size, so no compiler padding can leak into the file.
pub fn emit_thread_command(blocks: &[RegisterBlock]) -> Vec<u8>
{
    let cmdsize: u32 = THREAD_COMMAND_HEADER_SIZE + blocks.iter().map(RegisterBlock::encoded_size).sum::<u32>();

    let mut out = Vec::with_capacity(cmdsize as usize);
    out.extend_from_slice(&LC_THREAD.to_le_bytes());
    out.extend_from_slice(&cmdsize.to_le_bytes());
    for block in blocks {
        out.extend_from_slice(&block.kind.to_le_bytes());
        out.extend_from_slice(&(block.words.len() as u32).to_le_bytes());
        for word in &block.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }

    out
}

/// Payload of the `addrable bits` note: how many bits of a pointer are
/// meaningful address, so the debugger can strip metadata bits (PAC, tags).
#[derive(Debug, Clone, Copy)]
pub struct AddrableBitsInfo
{
    pub version: u32,
    pub n_bits: u32,
    pub unused: u64,
}

impl AddrableBitsInfo
{
    pub fn new(n_bits: u32) -> Self
    {
        Self {
            version: 3,
            n_bits,
            unused: 0,
        }
    }

    pub fn emit(&self, out: &mut Vec<u8>)
    {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.n_bits.to_le_bytes());
        out.extend_from_slice(&self.unused.to_le_bytes());
    }
}

/// Header of the `all image infos` note payload.
#[derive(Debug, Clone, Copy)]
pub struct AllImageInfosHeader
{
    pub version: u32,
    pub imgcount: u32,
    /// Absolute file offset of the first [`ImageEntry`].
    pub entries_fileoff: u64,
    pub entries_size: u32,
    pub reserved: u32,
}

impl AllImageInfosHeader
{
    pub fn emit(&self, out: &mut Vec<u8>)
    {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.imgcount.to_le_bytes());
        out.extend_from_slice(&self.entries_fileoff.to_le_bytes());
        out.extend_from_slice(&self.entries_size.to_le_bytes());
        out.extend_from_slice(&self.reserved.to_le_bytes());
    }
}

/// One image record inside the all-image-infos payload. All offsets are
/// absolute file offsets.
#[derive(Debug, Clone, Copy)]
pub struct ImageEntry
{
    pub filepath_offset: u64,
    pub uuid: [u8; 16],
    pub load_address: u64,
    pub seg_addrs_offset: u64,
    pub segment_count: u32,
    /// 1 if the image was executing on some thread, else 0.
    pub reserved: u32,
}

impl ImageEntry
{
    pub fn emit(&self, out: &mut Vec<u8>)
    {
        out.extend_from_slice(&self.filepath_offset.to_le_bytes());
        out.extend_from_slice(&self.uuid);
        out.extend_from_slice(&self.load_address.to_le_bytes());
        out.extend_from_slice(&self.seg_addrs_offset.to_le_bytes());
        out.extend_from_slice(&self.segment_count.to_le_bytes());
        out.extend_from_slice(&self.reserved.to_le_bytes());
    }
}

/// Per-segment `(name, vmaddr)` record inside the all-image-infos payload.
#[derive(Debug, Clone, Copy)]
pub struct SegmentVmAddr
{
    pub segname: [u8; NAME_FIELD_LEN],
    pub vmaddr: u64,
    pub unused: u64,
}

impl SegmentVmAddr
{
    pub fn emit(&self, out: &mut Vec<u8>)
    {
        out.extend_from_slice(&self.segname);
        out.extend_from_slice(&self.vmaddr.to_le_bytes());
        out.extend_from_slice(&self.unused.to_le_bytes());
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_header_emits_32_bytes()
    {
        let mut out = Vec::new();
        MachHeader64::core_header().emit(&mut out);
        assert_eq!(out.len() as u64, MACH_HEADER_64_SIZE);
        assert_eq!(&out[0..4], &MH_MAGIC_64.to_le_bytes());
        assert_eq!(&out[12..16], &MH_CORE.to_le_bytes());
    }

    #[test]
    fn test_note_command_emits_40_bytes()
    {
        let mut out = Vec::new();
        NoteCommand::new(ADDRABLE_BITS_OWNER).emit(&mut out);
        assert_eq!(out.len(), NOTE_COMMAND_SIZE as usize);
        assert_eq!(&out[8..8 + 13], ADDRABLE_BITS_OWNER.as_bytes());
        // Owner field is zero-padded, not NUL-terminated.
        assert_eq!(&out[8 + 13..24], &[0, 0, 0]);
    }

    #[test]
    fn test_segment_command_emits_72_bytes()
    {
        let mut out = Vec::new();
        SegmentCommand64::new(0x1000, 0x200, 3).emit(&mut out);
        assert_eq!(out.len(), SEGMENT_COMMAND_64_SIZE as usize);
    }

    #[test]
    fn test_thread_command_size_counts_words_not_padding()
    {
        let blocks = [
            RegisterBlock::new(6, vec![0; 68]),
            RegisterBlock::new(7, vec![0; 4]),
        ];
        let bytes = emit_thread_command(&blocks);
        let expected = 8 + (8 + 68 * 4) + (8 + 4 * 4);
        assert_eq!(bytes.len(), expected);

        let cmdsize = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(cmdsize as usize, expected);

        // First record starts right after the command header.
        let kind = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let count = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(kind, 6);
        assert_eq!(count, 68);
    }

    #[test]
    fn test_round_up()
    {
        assert_eq!(round_up(0, 16), 0);
        assert_eq!(round_up(1, 16), 16);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(4097, 0x1000), 8192);
    }

    #[test]
    fn test_name_field_pads_with_zeros()
    {
        let field = name_field("__TEXT");
        assert_eq!(&field[..6], b"__TEXT");
        assert!(field[6..].iter().all(|&b| b == 0));
    }
}
