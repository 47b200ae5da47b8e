//! # Module (Image) Catalog
//!
//! Loaded-image records for the target task: load address, UUID, file path,
//! segment list, and whether any thread was executing inside the image when
//! the dump was taken.
//!
//! The catalog itself is plain data parsed out of each image's Mach-O header
//! and load commands; fetching those bytes from the task is the job of
//! `platform::macos::dyld`. Keeping the parsing here means it can be
//! exercised against synthetic images on any host.
//!
//! Note the `__TEXT` rewrite: a Mach-O header stores pre-slide vmaddrs, so
//! the `__TEXT` segment's address is replaced with the actual (slid) load
//! address at parse time. Debuggers use exactly that segment to map file
//! addresses onto the live layout.

use std::collections::BTreeMap;

use crate::layout::{self, LC_SEGMENT_64, LC_UUID, MACH_HEADER_64_SIZE};
use crate::zone::ZoneBuffer;

const TEXT_SEGMENT: &str = "__TEXT";

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32>
{
    Some(u32::from_le_bytes(bytes.get(offset..offset + 4)?.try_into().ok()?))
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64>
{
    Some(u64::from_le_bytes(bytes.get(offset..offset + 8)?.try_into().ok()?))
}

/// One `LC_SEGMENT_64` of a loaded image.
#[derive(Debug, Clone, Copy)]
pub struct SegmentInfo
{
    pub name: [u8; layout::NAME_FIELD_LEN],
    pub vmaddr: u64,
    pub vmsize: u64,
}

impl SegmentInfo
{
    pub fn name_is(&self, name: &str) -> bool
    {
        self.name == layout::name_field(name)
    }
}

/// One loaded image of the target task.
#[derive(Debug)]
pub struct ModuleInfo
{
    pub load_address: u64,
    pub uuid: [u8; 16],
    pub file_path: String,
    pub segments: Vec<SegmentInfo>,
    /// Set when some thread's call stack contains an address in this image.
    /// Consumed by debuggers as a symbol-load hint; not load-bearing.
    pub executing: bool,
    /// Raw header plus load commands, as read from the task.
    pub header_bytes: ZoneBuffer,
}

impl ModuleInfo
{
    /// Parse an image from its raw header + load command bytes.
    ///
    /// Returns `None` when the buffer is too short or a load command walks
    /// out of bounds. The `__TEXT` segment's vmaddr is rewritten to
    /// `load_address`.
    pub fn parse(load_address: u64, file_path: String, header_bytes: ZoneBuffer) -> Option<Self>
    {
        let bytes = &*header_bytes;
        let ncmds = read_u32(bytes, 16)?;

        let mut segments = Vec::new();
        let mut uuid = [0u8; 16];

        let mut offset = MACH_HEADER_64_SIZE as usize;
        for _ in 0..ncmds {
            let cmd = read_u32(bytes, offset)?;
            let cmdsize = read_u32(bytes, offset + 4)? as usize;
            if cmdsize < 8 {
                return None;
            }

            match cmd {
                LC_SEGMENT_64 => {
                    let mut name = [0u8; layout::NAME_FIELD_LEN];
                    name.copy_from_slice(bytes.get(offset + 8..offset + 24)?);
                    let vmaddr = read_u64(bytes, offset + 24)?;
                    let vmsize = read_u64(bytes, offset + 32)?;
                    segments.push(SegmentInfo {
                        name,
                        vmaddr,
                        vmsize,
                    });
                }
                LC_UUID => {
                    uuid.copy_from_slice(bytes.get(offset + 8..offset + 24)?);
                }
                _ => {}
            }

            offset = offset.checked_add(cmdsize)?;
        }

        for segment in &mut segments {
            if segment.name_is(TEXT_SEGMENT) {
                segment.vmaddr = load_address;
                break;
            }
        }

        Some(Self {
            load_address,
            uuid,
            file_path,
            segments,
            executing: false,
            header_bytes,
        })
    }

    pub fn text_segment(&self) -> Option<&SegmentInfo>
    {
        self.segments.iter().find(|s| s.name_is(TEXT_SEGMENT))
    }

    fn text_contains(&self, address: u64) -> bool
    {
        match self.text_segment() {
            Some(text) => address >= text.vmaddr && address < text.vmaddr + text.vmsize,
            None => false,
        }
    }
}

/// All loaded images of one task, keyed by load address.
///
/// A catalog that hit a read failure during construction is *invalid*: it is
/// emptied wholesale, because a partial image list would make the resulting
/// core file lie about what was loaded.
#[derive(Debug, Default)]
pub struct ModuleCatalog
{
    modules: BTreeMap<u64, ModuleInfo>,
}

impl ModuleCatalog
{
    pub fn from_modules<I: IntoIterator<Item = ModuleInfo>>(modules: I) -> Self
    {
        Self {
            modules: modules.into_iter().map(|m| (m.load_address, m)).collect(),
        }
    }

    /// An invalidated (empty) catalog.
    pub fn invalid() -> Self
    {
        Self::default()
    }

    pub fn is_valid(&self) -> bool
    {
        !self.modules.is_empty()
    }

    pub fn len(&self) -> usize
    {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleInfo>
    {
        self.modules.values()
    }

    /// Find the module whose `__TEXT` range covers `address`, using the same
    /// ordered-map discipline as the region map.
    pub fn lookup(&self, address: u64) -> Option<&ModuleInfo>
    {
        let candidate = match self.modules.range(address..).next() {
            Some((&base, module)) if base == address => Some(module),
            _ => self.modules.range(..address).next_back().map(|(_, module)| module),
        };

        candidate.filter(|module| module.text_contains(address))
    }

    /// Flag the module covering `address` as executing. Returns whether a
    /// module matched.
    pub fn mark_as_executing(&mut self, address: u64) -> bool
    {
        let base = match self.lookup(address) {
            Some(module) => module.load_address,
            None => return false,
        };

        if let Some(module) = self.modules.get_mut(&base) {
            module.executing = true;
        }
        true
    }
}
