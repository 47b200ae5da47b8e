//! Structural tests for the core file builder: header bookkeeping, payload
//! alignment and packing, and the finalization guard rails. Everything here
//! runs against an in-memory sink, so the layout contract is checked on any
//! host.

use machdump_core::builder::CoreFileBuilder;
use machdump_core::error::{DumpError, Result};
use machdump_core::layout::{self, RegisterBlock};
use machdump_core::provider::CopiedBytes;
use machdump_core::sink::RandomAccessSink;

/// Grow-on-demand in-memory sink.
#[derive(Default)]
struct MemSink
{
    data: Vec<u8>,
    pos: u64,
}

impl RandomAccessSink for MemSink
{
    fn write(&mut self, bytes: &[u8]) -> Result<()>
    {
        let end = self.pos as usize + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.pos as usize..end].copy_from_slice(bytes);
        self.pos = end as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()>
    {
        Ok(())
    }

    fn position(&mut self) -> Result<u64>
    {
        Ok(self.pos)
    }

    fn set_position(&mut self, pos: u64) -> Result<()>
    {
        self.pos = pos;
        Ok(())
    }

    fn size(&mut self) -> Result<u64>
    {
        Ok(self.data.len() as u64)
    }

    fn set_size(&mut self, size: u64) -> Result<()>
    {
        self.data.resize(size as usize, 0);
        self.pos = self.pos.min(size);
        Ok(())
    }
}

fn u32_at(bytes: &[u8], offset: usize) -> u32
{
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], offset: usize) -> u64
{
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

fn provider(bytes: &[u8]) -> Box<CopiedBytes>
{
    Box::new(CopiedBytes::new(bytes).unwrap())
}

/// A builder with two notes, one thread, and two segments; the shape every
/// real dump has.
fn populated_builder() -> CoreFileBuilder
{
    let mut builder = CoreFileBuilder::new();
    builder
        .add_note_command(layout::ADDRABLE_BITS_OWNER, Some(provider(&[0xAA; 16])))
        .unwrap();
    builder
        .add_note_command(layout::ALL_IMAGE_INFOS_OWNER, Some(provider(&[0xBB; 100])))
        .unwrap();
    builder
        .add_thread_command(&[
            RegisterBlock::new(6, vec![1; 68]),
            RegisterBlock::new(7, vec![2; 4]),
        ])
        .unwrap();
    builder
        .add_segment_command(0x10_0000, 0x3, Some(provider(&[0xCC; 513])))
        .unwrap();
    builder
        .add_segment_command(0x20_0000, 0x5, Some(provider(&[0xDD; 4097])))
        .unwrap();
    builder
}

#[test]
fn test_header_counts_commands()
{
    let mut builder = populated_builder();
    let mut sink = MemSink::default();
    builder.build(&mut sink).unwrap();

    let bytes = &sink.data;
    assert_eq!(u32_at(bytes, 0), layout::MH_MAGIC_64);
    assert_eq!(u32_at(bytes, 12), layout::MH_CORE);

    let ncmds = u32_at(bytes, 16);
    assert_eq!(ncmds, 5);

    let thread_cmdsize = 8 + (8 + 68 * 4) + (8 + 4 * 4);
    let expected_sizeofcmds = 2 * 40 + thread_cmdsize + 2 * 72;
    assert_eq!(u32_at(bytes, 20), expected_sizeofcmds as u32);
}

#[test]
fn test_sizeofcmds_matches_walked_commands()
{
    let mut builder = populated_builder();
    let mut sink = MemSink::default();
    builder.build(&mut sink).unwrap();

    let bytes = &sink.data;
    let ncmds = u32_at(bytes, 16);
    let sizeofcmds = u32_at(bytes, 20) as usize;

    let mut offset = 32usize;
    let mut walked = 0u32;
    while walked < ncmds {
        let cmd = u32_at(bytes, offset);
        assert!(
            cmd == layout::LC_NOTE || cmd == layout::LC_THREAD || cmd == layout::LC_SEGMENT_64,
            "unexpected load command {cmd:#x}"
        );
        offset += u32_at(bytes, offset + 4) as usize;
        walked += 1;
    }

    assert_eq!(offset, 32 + sizeofcmds);
}

#[test]
fn test_note_payloads_are_aligned_and_packed()
{
    let mut builder = populated_builder();
    builder.finalize();

    let first = builder.offset_for_note(layout::ADDRABLE_BITS_OWNER).unwrap();
    let second = builder.offset_for_note(layout::ALL_IMAGE_INFOS_OWNER).unwrap();

    assert_eq!(first % 16, 0);
    // Successive payloads pack back to back with no extra alignment.
    assert_eq!(second, first + 16);
}

#[test]
fn test_segment_payloads_are_aligned_and_packed()
{
    let mut builder = populated_builder();
    builder.finalize();

    let notes_end = builder.offset_for_note(layout::ALL_IMAGE_INFOS_OWNER).unwrap() + 100;
    let first = builder.offset_for_segment(0x10_0000).unwrap();
    let second = builder.offset_for_segment(0x20_0000).unwrap();

    assert_eq!(first % 0x1000, 0);
    assert!(first >= notes_end);
    assert_eq!(second, first + 513);
}

#[test]
fn test_note_payload_end_precedes_segment_payloads()
{
    let mut builder = populated_builder();
    builder.finalize();

    let last_note_end = builder.offset_for_note(layout::ALL_IMAGE_INFOS_OWNER).unwrap() + 100;
    let first_segment = builder.offset_for_segment(0x10_0000).unwrap();
    assert!(last_note_end <= first_segment);
}

#[test]
fn test_built_file_payload_cross_references()
{
    let mut builder = populated_builder();
    let mut sink = MemSink::default();
    builder.build(&mut sink).unwrap();

    let bytes = &sink.data;

    // Walk the command block, checking every command's payload pointer
    // lands on the bytes its provider produced.
    let ncmds = u32_at(bytes, 16);
    let mut offset = 32usize;
    let mut segments_seen = 0;
    for _ in 0..ncmds {
        let cmd = u32_at(bytes, offset);
        let cmdsize = u32_at(bytes, offset + 4) as usize;

        if cmd == layout::LC_NOTE {
            let payload_offset = u64_at(bytes, offset + 24) as usize;
            let payload_size = u64_at(bytes, offset + 32) as usize;
            let payload = &bytes[payload_offset..payload_offset + payload_size];
            assert!(payload.iter().all(|&b| b == payload[0]));
        }

        if cmd == layout::LC_SEGMENT_64 {
            let vmsize = u64_at(bytes, offset + 32);
            let fileoff = u64_at(bytes, offset + 40) as usize;
            let filesize = u64_at(bytes, offset + 48);
            assert_eq!(vmsize, filesize);

            let expected = if segments_seen == 0 { 0xCC } else { 0xDD };
            let payload = &bytes[fileoff..fileoff + filesize as usize];
            assert!(payload.iter().all(|&b| b == expected));
            segments_seen += 1;
        }

        offset += cmdsize;
    }
    assert_eq!(segments_seen, 2);
}

#[test]
fn test_add_after_finalize_fails()
{
    let mut builder = populated_builder();
    builder.finalize();

    assert!(matches!(
        builder.add_note_command("late note", None),
        Err(DumpError::Layout(_))
    ));
    assert!(matches!(
        builder.add_thread_command(&[RegisterBlock::new(6, vec![0; 4])]),
        Err(DumpError::Layout(_))
    ));
    assert!(matches!(
        builder.add_segment_command(0x30_0000, 0x1, None),
        Err(DumpError::Layout(_))
    ));
}

#[test]
fn test_finalize_is_idempotent()
{
    let mut builder = populated_builder();
    builder.finalize();
    let first = builder.offset_for_segment(0x10_0000).unwrap();
    builder.finalize();
    assert_eq!(builder.offset_for_segment(0x10_0000).unwrap(), first);
}

#[test]
fn test_offsets_require_finalization()
{
    let builder = populated_builder();
    assert!(matches!(
        builder.offset_for_note(layout::ADDRABLE_BITS_OWNER),
        Err(DumpError::Layout(_))
    ));
    assert!(matches!(builder.offset_for_segment(0x10_0000), Err(DumpError::Layout(_))));
}

#[test]
fn test_owner_name_limit()
{
    let mut builder = CoreFileBuilder::new();
    assert!(builder.add_note_command("exactly sixteen!", None).is_ok());
    assert!(matches!(
        builder.add_note_command("seventeen bytes!!", None),
        Err(DumpError::Layout(_))
    ));
}

#[test]
fn test_late_provider_attachment()
{
    let mut builder = CoreFileBuilder::new();
    builder.add_note_command("owner", None).unwrap();

    // Providers may arrive after finalization; they do not move commands.
    builder.finalize();
    builder.set_note_payload("owner", provider(&[1, 2, 3])).unwrap();

    assert!(matches!(
        builder.set_note_payload("owner", provider(&[4])),
        Err(DumpError::Layout(_))
    ));
    assert!(matches!(
        builder.set_note_payload("missing", provider(&[4])),
        Err(DumpError::Layout(_))
    ));
}

#[test]
fn test_unknown_command_offsets_fail()
{
    let mut builder = populated_builder();
    builder.finalize();
    assert!(matches!(builder.offset_for_note("missing"), Err(DumpError::Layout(_))));
    assert!(matches!(builder.offset_for_segment(0xDEAD), Err(DumpError::Layout(_))));
}
