//! # Core File Builder
//!
//! Assembles a Mach-O core file out of three command lists (notes, threads,
//! segments) and writes it to a sink.
//!
//! Core files have a peculiar structure: payload offsets are embedded in the
//! load commands (and in some payloads), and the load command block sits at
//! the very beginning of the file. Nothing can be written until every
//! command has been added, so building is a two-phase affair:
//!
//! 1. add commands (payload providers may be attached late);
//! 2. finalize, after which the layout is frozen, offsets become
//!    computable, and the file can be written.
//!
//! The builder guarantees structural correctness only; which commands make a
//! *meaningful* core is the orchestrator's business.
//!
//! ## Layout contract
//!
//! - byte 0: `mach_header_64`
//! - immediately after: note command headers, then thread commands, then
//!   segment command headers, each list in insertion order
//! - note payloads: first at the next 16-byte boundary after the command
//!   block, then packed back-to-back
//! - segment payloads: first at the next 4096-byte boundary after the note
//!   payloads, then packed back-to-back

use tracing::warn;

use crate::error::{DumpError, Result};
use crate::layout::{
    emit_thread_command, round_up, MachHeader64, NoteCommand, RegisterBlock, SegmentCommand64, MACH_HEADER_64_SIZE,
    NAME_FIELD_LEN, NOTE_COMMAND_SIZE, NOTE_PAYLOAD_ALIGN, SEGMENT_COMMAND_64_SIZE, SEGMENT_PAYLOAD_ALIGN,
};
use crate::provider::PayloadSource;
use crate::sink::RandomAccessSink;

/// Segment payloads are streamed out in chunks of at most this many bytes;
/// process-memory providers cannot materialize a multi-gigabyte stack in one
/// buffer.
const MAX_WRITE_CHUNK: usize = 4096 * 1024;

type Provider = Box<dyn PayloadSource>;

/// Records byte ranges written during `build` and trips an assertion if any
/// write would overlap an earlier one. Catches offset-calculation bugs in
/// debug builds; compiles to nothing in release.
#[derive(Default)]
struct WrittenRanges
{
    #[cfg(debug_assertions)]
    ranges: Vec<(u64, u64)>,
}

impl WrittenRanges
{
    #[cfg(debug_assertions)]
    fn record(&mut self, start: u64, len: usize)
    {
        let end = start + len as u64;
        for &(existing_start, existing_end) in &self.ranges {
            debug_assert!(
                end <= existing_start || start >= existing_end,
                "write [{start:#x}, {end:#x}) overlaps already-written [{existing_start:#x}, {existing_end:#x})"
            );
        }
        self.ranges.push((start, end));
    }

    #[cfg(not(debug_assertions))]
    fn record(&mut self, _start: u64, _len: usize) {}
}

/// Builder for one Mach-O core file.
pub struct CoreFileBuilder
{
    header: MachHeader64,
    notes: Vec<(NoteCommand, Option<Provider>)>,
    threads: Vec<Vec<u8>>,
    segments: Vec<(SegmentCommand64, Option<Provider>)>,
    finalized: bool,
}

impl Default for CoreFileBuilder
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl CoreFileBuilder
{
    pub fn new() -> Self
    {
        Self {
            header: MachHeader64::core_header(),
            notes: Vec::new(),
            threads: Vec::new(),
            segments: Vec::new(),
            finalized: false,
        }
    }

    /// Append an `LC_NOTE` command. The payload provider may be attached
    /// later with [`set_note_payload`](Self::set_note_payload).
    pub fn add_note_command(&mut self, owner: &str, provider: Option<Provider>) -> Result<()>
    {
        if self.finalized {
            return Err(DumpError::Layout("cannot add note command after finalization"));
        }
        if owner.len() > NAME_FIELD_LEN {
            return Err(DumpError::Layout("note owner name exceeds 16 bytes"));
        }

        let mut command = NoteCommand::new(owner);
        if let Some(provider) = &provider {
            command.size = provider.size();
        }
        self.notes.push((command, provider));
        Ok(())
    }

    /// Append an `LC_THREAD` command holding the given register records.
    /// Thread commands are self-contained; they carry no payload section.
    pub fn add_thread_command(&mut self, blocks: &[RegisterBlock]) -> Result<()>
    {
        if self.finalized {
            return Err(DumpError::Layout("cannot add thread command after finalization"));
        }

        self.threads.push(emit_thread_command(blocks));
        Ok(())
    }

    /// Append an `LC_SEGMENT_64` command for memory at `vmaddr`. Both
    /// `vmsize` and `filesize` come from the provider; `maxprot` and
    /// `initprot` are set to `prot`.
    pub fn add_segment_command(&mut self, vmaddr: u64, prot: i32, provider: Option<Provider>) -> Result<()>
    {
        if self.finalized {
            return Err(DumpError::Layout("cannot add segment command after finalization"));
        }

        let size = provider.as_ref().map_or(0, |p| p.size());
        self.segments.push((SegmentCommand64::new(vmaddr, size, prot), provider));
        Ok(())
    }

    /// Attach the payload provider of a previously added note command.
    /// Allowed after finalization; payload sizes do not move load commands.
    pub fn set_note_payload(&mut self, owner: &str, provider: Provider) -> Result<()>
    {
        for (command, slot) in &mut self.notes {
            if command.owner_is(owner) {
                if slot.is_some() {
                    return Err(DumpError::Layout("note command already has a payload provider"));
                }
                command.size = provider.size();
                *slot = Some(provider);
                return Ok(());
            }
        }

        Err(DumpError::Layout("no note command with that owner"))
    }

    /// Attach the payload provider of a previously added segment command.
    pub fn set_segment_payload(&mut self, vmaddr: u64, provider: Provider) -> Result<()>
    {
        for (command, slot) in &mut self.segments {
            if command.vmaddr == vmaddr {
                if slot.is_some() {
                    return Err(DumpError::Layout("segment command already has a payload provider"));
                }
                let size = provider.size();
                command.vmsize = size;
                command.filesize = size;
                *slot = Some(provider);
                return Ok(());
            }
        }

        Err(DumpError::Layout("no segment command at that address"))
    }

    /// Freeze the command lists and fill in `ncmds` / `sizeofcmds`.
    /// Idempotent; adding commands afterwards fails.
    pub fn finalize(&mut self)
    {
        if self.finalized {
            return;
        }

        self.header.ncmds = (self.notes.len() + self.threads.len() + self.segments.len()) as u32;
        self.header.sizeofcmds = self.notes.len() as u32 * NOTE_COMMAND_SIZE
            + self.threads.iter().map(|t| t.len() as u32).sum::<u32>()
            + self.segments.len() as u32 * SEGMENT_COMMAND_64_SIZE;

        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool
    {
        self.finalized
    }

    pub fn note_count(&self) -> usize
    {
        self.notes.len()
    }

    pub fn thread_count(&self) -> usize
    {
        self.threads.len()
    }

    pub fn segment_count(&self) -> usize
    {
        self.segments.len()
    }

    /// Segment command addresses in insertion order.
    pub fn segment_vmaddrs(&self) -> Vec<u64>
    {
        self.segments.iter().map(|(command, _)| command.vmaddr).collect()
    }

    fn command_block_end(&self) -> u64
    {
        MACH_HEADER_64_SIZE + self.header.sizeofcmds as u64
    }

    /// Absolute file offset of a note command's payload. Deterministic once
    /// the layout is finalized; every preceding note must have a known size.
    pub fn offset_for_note(&self, owner: &str) -> Result<u64>
    {
        if !self.finalized {
            return Err(DumpError::Layout("note payload offsets require finalized load commands"));
        }

        let mut offset = round_up(self.command_block_end(), NOTE_PAYLOAD_ALIGN);
        for (command, provider) in &self.notes {
            if command.owner_is(owner) {
                return Ok(offset);
            }
            if provider.is_none() {
                return Err(DumpError::Layout("preceding note payload size is not known yet"));
            }
            offset += command.size;
        }

        Err(DumpError::Layout("no note command with that owner"))
    }

    /// Absolute file offset of a segment command's payload.
    pub fn offset_for_segment(&self, vmaddr: u64) -> Result<u64>
    {
        if !self.finalized {
            return Err(DumpError::Layout("segment payload offsets require finalized load commands"));
        }

        let notes_end = match self.notes.last() {
            Some((command, _)) => self.offset_for_note(note_owner_str(command))? + command.size,
            None => self.command_block_end(),
        };

        let mut offset = round_up(notes_end, SEGMENT_PAYLOAD_ALIGN);
        for (command, provider) in &self.segments {
            if command.vmaddr == vmaddr {
                return Ok(offset);
            }
            if provider.is_none() {
                return Err(DumpError::Layout("preceding segment payload size is not known yet"));
            }
            offset += command.filesize;
        }

        Err(DumpError::Layout("no segment command at that address"))
    }

    /// Write the complete core file to `sink`.
    pub fn build(&mut self, sink: &mut dyn RandomAccessSink) -> Result<()>
    {
        self.finalize();

        // Resolve every payload offset into its command header first.
        let note_offsets: Vec<u64> = self
            .notes
            .iter()
            .map(|(command, _)| self.offset_for_note(note_owner_str(command)))
            .collect::<Result<_>>()?;
        let segment_offsets: Vec<u64> = self
            .segments
            .iter()
            .map(|(command, _)| self.offset_for_segment(command.vmaddr))
            .collect::<Result<_>>()?;
        for (entry, offset) in self.notes.iter_mut().zip(&note_offsets) {
            entry.0.offset = *offset;
        }
        for (entry, offset) in self.segments.iter_mut().zip(&segment_offsets) {
            entry.0.fileoff = *offset;
        }

        let mut written = WrittenRanges::default();

        // Header and command block, front to back.
        let mut front = Vec::with_capacity(self.command_block_end() as usize);
        self.header.emit(&mut front);
        for (command, _) in &self.notes {
            command.emit(&mut front);
        }
        for thread in &self.threads {
            front.extend_from_slice(thread);
        }
        for (command, _) in &self.segments {
            command.emit(&mut front);
        }

        sink.set_position(0)?;
        written.record(0, front.len());
        sink.write(&front)?;

        // Note payloads are small; write each in one piece.
        for ((command, provider), offset) in self.notes.iter_mut().zip(&note_offsets) {
            let provider = provider
                .as_mut()
                .ok_or(DumpError::Layout("note command has no payload provider"))?;

            sink.set_position(*offset)?;
            let payload = provider.window(0, command.size as usize)?;
            written.record(*offset, payload.len());
            sink.write(payload)?;
        }

        // Segment payloads can be huge and are streamed in chunks. A window
        // that cannot be produced (memory vanished under us) leaves a hole
        // instead of failing the dump.
        for ((command, provider), offset) in self.segments.iter_mut().zip(&segment_offsets) {
            let Some(provider) = provider.as_mut() else {
                continue;
            };

            sink.set_position(*offset)?;
            let total = command.filesize;
            let mut done: u64 = 0;
            while done < total {
                let chunk = ((total - done) as usize).min(MAX_WRITE_CHUNK);
                match provider.window(done, chunk) {
                    Ok(bytes) => {
                        written.record(*offset + done, bytes.len());
                        sink.write(bytes)?;
                    }
                    Err(err) => {
                        warn!(
                            vmaddr = format_args!("{:#x}", command.vmaddr),
                            offset = done,
                            %err,
                            "segment window unavailable, leaving a hole"
                        );
                        sink.set_position(*offset + done + chunk as u64)?;
                    }
                }
                done += chunk as u64;
            }
        }

        sink.flush()?;
        Ok(())
    }
}

fn note_owner_str(command: &NoteCommand) -> &str
{
    let end = command
        .data_owner
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(NAME_FIELD_LEN);
    // Owners are inserted from &str, so this cannot fail.
    std::str::from_utf8(&command.data_owner[..end]).unwrap_or("")
}
