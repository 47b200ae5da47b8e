//! # Note Payload Construction
//!
//! Builders for the two `LC_NOTE` payloads every core carries: the
//! addressable-bits record and the all-image-infos block.
//!
//! The all-image-infos payload is the reason load commands are finalized
//! before payloads exist: it embeds *absolute file offsets* pointing into
//! itself (image entries reference their segment arrays and path strings),
//! so its own file offset must be known before a single byte of it can be
//! produced.
//!
//! ```text
//!            ┌─────────────────┐ <- payload_offset
//!            │     Header      │
//!            ├─────────────────┤
//!            │  Image entry 1  │
//!            │       ...       │
//!            │  Image entry N  │
//!            ├─────────────────┤
//!            │ Segment vmaddrs │  per image, contiguous, image order
//!            ├─────────────────┤
//!            │  Path strings   │  NUL-terminated, image order
//!            └─────────────────┘
//! ```

use crate::error::{DumpError, Result};
use crate::layout::{
    AddrableBitsInfo, AllImageInfosHeader, ImageEntry, SegmentVmAddr, ALL_IMAGE_INFOS_HEADER_SIZE, IMAGE_ENTRY_SIZE,
    SEGMENT_VMADDR_SIZE,
};
use crate::module::ModuleCatalog;

/// Payload of the `addrable bits` note.
pub fn addressable_bits_payload(n_bits: u32) -> Vec<u8>
{
    let mut out = Vec::with_capacity(16);
    AddrableBitsInfo::new(n_bits).emit(&mut out);
    out
}

/// Payload of the `all image infos` note.
///
/// `payload_offset` is the absolute file offset the payload will be written
/// at; every offset embedded in the payload is computed from it.
///
/// ## Errors
///
/// `DumpError::Layout` when the catalog was invalidated during construction;
/// a core without image records would defeat symbolication entirely.
pub fn all_image_infos_payload(payload_offset: u64, modules: &ModuleCatalog) -> Result<Vec<u8>>
{
    if !modules.is_valid() {
        return Err(DumpError::Layout("module catalog is invalid"));
    }

    let n_modules = modules.len();
    let n_segments: usize = modules.iter().map(|m| m.segments.len()).sum();
    let paths_size: usize = modules.iter().map(|m| m.file_path.len() + 1).sum();

    let entries_size = n_modules * IMAGE_ENTRY_SIZE as usize;
    let segments_size = n_segments * SEGMENT_VMADDR_SIZE;
    let payload_size = ALL_IMAGE_INFOS_HEADER_SIZE + entries_size + segments_size + paths_size;

    let mut out = Vec::with_capacity(payload_size);

    AllImageInfosHeader {
        version: 1,
        imgcount: n_modules as u32,
        entries_fileoff: payload_offset + ALL_IMAGE_INFOS_HEADER_SIZE as u64,
        entries_size: IMAGE_ENTRY_SIZE,
        reserved: 0,
    }
    .emit(&mut out);

    // Image entries reference the two trailing areas, so walk their offsets
    // alongside.
    let mut path_offset = payload_offset + (payload_size - paths_size) as u64;
    let mut seg_addrs_offset = payload_offset + (ALL_IMAGE_INFOS_HEADER_SIZE + entries_size) as u64;
    for module in modules.iter() {
        ImageEntry {
            filepath_offset: path_offset,
            uuid: module.uuid,
            load_address: module.load_address,
            seg_addrs_offset,
            segment_count: module.segments.len() as u32,
            reserved: u32::from(module.executing),
        }
        .emit(&mut out);

        path_offset += module.file_path.len() as u64 + 1;
        seg_addrs_offset += (module.segments.len() * SEGMENT_VMADDR_SIZE) as u64;
    }

    for module in modules.iter() {
        for segment in &module.segments {
            SegmentVmAddr {
                segname: segment.name,
                vmaddr: segment.vmaddr,
                unused: 0,
            }
            .emit(&mut out);
        }
    }

    for module in modules.iter() {
        out.extend_from_slice(module.file_path.as_bytes());
        out.push(0);
    }

    debug_assert_eq!(out.len(), payload_size);

    Ok(out)
}
