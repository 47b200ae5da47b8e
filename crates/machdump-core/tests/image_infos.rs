//! Tests for the all-image-infos note payload: every embedded offset must
//! resolve to the right bytes inside the payload itself.

use machdump_core::error::DumpError;
use machdump_core::layout;
use machdump_core::module::{ModuleCatalog, ModuleInfo};
use machdump_core::notes::{addressable_bits_payload, all_image_infos_payload};
use machdump_core::zone::ZoneBuffer;

fn u32_at(bytes: &[u8], offset: usize) -> u32
{
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], offset: usize) -> u64
{
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

/// Header + load commands of a minimal image: __TEXT, __DATA, LC_UUID.
fn image_bytes(text_vmsize: u64, uuid: [u8; 16]) -> Vec<u8>
{
    let mut commands = Vec::new();

    for (name, vmaddr, vmsize) in [("__TEXT", 0u64, text_vmsize), ("__DATA", text_vmsize, 0x1000)] {
        commands.extend_from_slice(&layout::LC_SEGMENT_64.to_le_bytes());
        commands.extend_from_slice(&72u32.to_le_bytes());
        commands.extend_from_slice(&layout::name_field(name));
        commands.extend_from_slice(&vmaddr.to_le_bytes());
        commands.extend_from_slice(&vmsize.to_le_bytes());
        commands.extend_from_slice(&[0u8; 32]); // fileoff, filesize, prots, nsects, flags
    }

    commands.extend_from_slice(&layout::LC_UUID.to_le_bytes());
    commands.extend_from_slice(&24u32.to_le_bytes());
    commands.extend_from_slice(&uuid);

    let mut bytes = Vec::new();
    let mut header = layout::MachHeader64::core_header();
    header.ncmds = 3;
    header.sizeofcmds = commands.len() as u32;
    header.emit(&mut bytes);
    bytes.extend_from_slice(&commands);
    bytes
}

fn module(load_address: u64, path: &str, uuid: [u8; 16]) -> ModuleInfo
{
    let bytes = image_bytes(0x4000, uuid);
    ModuleInfo::parse(load_address, path.to_string(), ZoneBuffer::from_slice(&bytes).unwrap()).unwrap()
}

fn catalog() -> ModuleCatalog
{
    let mut executing = module(0x1_0000_0000, "/usr/lib/dyld", [0x11; 16]);
    executing.executing = true;
    ModuleCatalog::from_modules([executing, module(0x2_0000_0000, "/bin/target", [0x22; 16])])
}

#[test]
fn test_addressable_bits_payload_format()
{
    let payload = addressable_bits_payload(47);
    assert_eq!(payload.len(), 16);
    assert_eq!(u32_at(&payload, 0), 3); // version
    assert_eq!(u32_at(&payload, 4), 47);
    assert_eq!(u64_at(&payload, 8), 0);
}

#[test]
fn test_image_infos_header()
{
    const PAYLOAD_OFFSET: u64 = 0x2000;
    let payload = all_image_infos_payload(PAYLOAD_OFFSET, &catalog()).unwrap();

    assert_eq!(u32_at(&payload, 0), 1); // version
    assert_eq!(u32_at(&payload, 4), 2); // imgcount
    assert_eq!(u64_at(&payload, 8), PAYLOAD_OFFSET + 24); // entries_fileoff
    assert_eq!(u32_at(&payload, 16), 48); // entries_size
}

#[test]
fn test_image_entries_resolve_paths_and_segments()
{
    const PAYLOAD_OFFSET: u64 = 0x3000;
    let catalog = catalog();
    let payload = all_image_infos_payload(PAYLOAD_OFFSET, &catalog).unwrap();

    let expectations = [
        (0x1_0000_0000u64, "/usr/lib/dyld", [0x11u8; 16], 1u32),
        (0x2_0000_0000u64, "/bin/target", [0x22u8; 16], 0u32),
    ];

    for (index, (load_address, path, uuid, executing)) in expectations.iter().enumerate() {
        let entry = 24 + index * 48;

        let filepath_offset = u64_at(&payload, entry);
        assert_eq!(&payload[entry + 8..entry + 24], uuid);
        assert_eq!(u64_at(&payload, entry + 24), *load_address);
        let seg_addrs_offset = u64_at(&payload, entry + 32);
        let segment_count = u32_at(&payload, entry + 40);
        assert_eq!(segment_count, 2);
        assert_eq!(u32_at(&payload, entry + 44), *executing);

        // The path offset must land inside the payload on a NUL-terminated
        // string.
        let rel = (filepath_offset - PAYLOAD_OFFSET) as usize;
        let nul = payload[rel..].iter().position(|&b| b == 0).expect("missing NUL");
        assert_eq!(&payload[rel..rel + nul], path.as_bytes());

        // The segment array must land inside the payload and lead with the
        // slid __TEXT address.
        let seg = (seg_addrs_offset - PAYLOAD_OFFSET) as usize;
        assert_eq!(&payload[seg..seg + 6], b"__TEXT");
        assert_eq!(u64_at(&payload, seg + 16), *load_address);
    }
}

#[test]
fn test_payload_size_accounts_for_every_area()
{
    let catalog = catalog();
    let payload = all_image_infos_payload(0, &catalog).unwrap();

    let paths: usize = catalog.iter().map(|m| m.file_path.len() + 1).sum();
    let segments: usize = catalog.iter().map(|m| m.segments.len() * 32).sum();
    assert_eq!(payload.len(), 24 + 2 * 48 + segments + paths);
}

#[test]
fn test_invalid_catalog_is_rejected()
{
    let result = all_image_infos_payload(0, &ModuleCatalog::invalid());
    assert!(matches!(result, Err(DumpError::Layout(_))));
}
