//! Recursive descent parser for firmware images.
//!
//! The engine walks a byte buffer top-down through the format nesting:
//! capsule, flash regions, firmware volumes, FFS files, sections. A first
//! pass builds the item tree; once the last Volume Top File is known, a
//! second pass assigns physical memory addresses and validates the FIT and
//! Boot Guard protected ranges. Diagnostics accumulate throughout; a
//! child's structural failure never aborts its parent's sibling loop.

pub mod image;
pub mod second;
pub mod section;
pub mod volume;

use log::{info, warn};

use crate::fit::{FitRow, ProtectedRange, VendorHashKind};
use crate::tree::{ItemId, PaddingSubtype, TreeModel};
use crate::{Diagnostic, ParseError};

pub struct FfsParser<'a> {
    pub(crate) image: &'a [u8],
    pub(crate) model: TreeModel<'a>,
    pub(crate) diagnostics: Vec<Diagnostic>,
    pub(crate) capsule_offset_fixup: usize,
    pub(crate) last_vtf: Option<ItemId>,
    pub(crate) bg_dxe_core: Option<ItemId>,
    pub(crate) address_diff: u64,
    pub(crate) vendor_hash_files: Vec<(VendorHashKind, ItemId)>,
    pub(crate) fit_table: Vec<FitRow>,
    pub(crate) protected_ranges: Vec<ProtectedRange>,
    pub(crate) bg_info: String,
}

impl<'a> FfsParser<'a> {
    pub fn new(image: &'a [u8]) -> Self {
        Self {
            image,
            model: TreeModel::new(image),
            diagnostics: Vec::new(),
            capsule_offset_fixup: 0,
            last_vtf: None,
            bg_dxe_core: None,
            address_diff: 0,
            vendor_hash_files: Vec::new(),
            fit_table: Vec::new(),
            protected_ranges: Vec::new(),
            bg_info: String::new(),
        }
    }

    /// Parse the whole image. A non-success result still leaves behind
    /// whatever partial tree and diagnostics were produced.
    pub fn parse(&mut self) -> Result<(), ParseError> {
        info!("parsing image of {:X}h ({}) bytes", self.image.len(), self.image.len());
        let result = self.perform_first_pass();
        self.add_offsets_recursive(self.model.root());
        if let Err(error) = result {
            warn!("first pass stopped: {error}");
            self.add_flags_info_recursive(self.model.root());
            return Err(error);
        }

        match self.last_vtf {
            Some(_) => self.perform_second_pass()?,
            None => self.msg(
                None,
                "parse: not a single Volume Top File is found, the image may be corrupted",
            ),
        }

        self.add_flags_info_recursive(self.model.root());
        Ok(())
    }

    pub fn model(&self) -> &TreeModel<'a> {
        &self.model
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn fit_table(&self) -> &[FitRow] {
        &self.fit_table
    }

    pub fn protected_ranges(&self) -> &[ProtectedRange] {
        &self.protected_ranges
    }

    pub fn bootguard_info(&self) -> &str {
        &self.bg_info
    }

    pub fn last_vtf(&self) -> Option<ItemId> {
        self.last_vtf
    }

    pub(crate) fn msg(&mut self, item: Option<ItemId>, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            item,
            message: message.into(),
        });
    }

    /// Classify padding content the way rebuilders care about: erased to
    /// zeros, erased to ones, or carrying data.
    pub(crate) fn padding_subtype(padding: &[u8]) -> PaddingSubtype {
        if padding.iter().all(|byte| *byte == 0x00) {
            PaddingSubtype::Zero
        } else if padding.iter().all(|byte| *byte == 0xFF) {
            PaddingSubtype::One
        } else {
            PaddingSubtype::Data
        }
    }

    /// FFS version of the nearest enclosing volume; sections met outside
    /// any volume (decompressed streams during dry runs) default to v2.
    pub(crate) fn enclosing_ffs_version(&self, item: ItemId) -> u8 {
        use crate::tree::{ItemType, ParsingData};
        let volume = if self.model.item_type(item) == ItemType::Volume {
            Some(item)
        } else {
            self.model.find_parent_of_type(item, ItemType::Volume)
        };
        match volume.map(|id| self.model.parsing_data(id)) {
            Some(ParsingData::Volume(data)) => data.ffs_version,
            _ => 2,
        }
    }
}

pub(crate) fn align8(value: usize) -> usize {
    (value + 7) & !7
}

pub(crate) fn align4(value: usize) -> usize {
    (value + 3) & !3
}

pub(crate) fn full_size_info(size: usize) -> String {
    format!("Full size: {size:X}h ({size})")
}

#[cfg(test)]
mod tests {
    use zerocopy::{FromZeros, IntoBytes};

    use super::volume::test_support::{build_file, build_volume};
    use super::*;
    use crate::descriptor::{FlashRegion, FLMAP0, FLMAP1};
    use crate::ffs::{
        u32_to_uint24, EFI_FFS_VOLUME_TOP_FILE_GUID, EFI_FV_FILETYPE_DRIVER, EFI_FV_FILETYPE_RAW,
        EFI_GUIDED_SECTION_AUTH_STATUS_VALID, EFI_GUIDED_SECTION_CRC32, EFI_SECTION_COMPRESSION,
        EFI_SECTION_GUID_DEFINED, EFI_SECTION_PE32, EFI_SECTION_RAW, NOT_COMPRESSED,
    };
    use crate::fit::{FitEntry, ProtectedRange, ProtectedRangeKind, FIT_POINTER_OFFSET};
    use crate::guid::Guid;
    use crate::pe::{
        DosHeader, ImageFileHeader, OptionalHeader64, IMAGE_DOS_SIGNATURE,
        IMAGE_FILE_MACHINE_AMD64, IMAGE_PE_OPTIONAL_HDR64_MAGIC, IMAGE_PE_SIGNATURE,
    };
    use crate::tree::{
        ImageSubtype, ItemId, ItemType, Marking, PaddingSubtype, RegionSubtype, TreeModel,
    };
    use crate::ParseError;

    const TEST_FILE_GUID: Guid = Guid::new(
        0x11223344,
        0x5566,
        0x7788,
        [0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00],
    );

    fn build_section(section_type: u8, body: &[u8]) -> Vec<u8> {
        let size = 4 + body.len();
        let mut raw = Vec::new();
        raw.extend_from_slice(&u32_to_uint24(size as u32));
        raw.push(section_type);
        raw.extend_from_slice(body);
        raw
    }

    fn build_compressed_section(
        compression_type: u8,
        uncompressed_length: u32,
        payload: &[u8],
    ) -> Vec<u8> {
        let size = 4 + 5 + payload.len();
        let mut raw = Vec::new();
        raw.extend_from_slice(&u32_to_uint24(size as u32));
        raw.push(EFI_SECTION_COMPRESSION);
        raw.extend_from_slice(&uncompressed_length.to_le_bytes());
        raw.push(compression_type);
        raw.extend_from_slice(payload);
        raw
    }

    fn build_crc32_section(crc: u32, payload: &[u8]) -> Vec<u8> {
        let data_offset = 4 + 20 + 4;
        let size = data_offset + payload.len();
        let mut raw = Vec::new();
        raw.extend_from_slice(&u32_to_uint24(size as u32));
        raw.push(EFI_SECTION_GUID_DEFINED);
        raw.extend_from_slice(EFI_GUIDED_SECTION_CRC32.as_bytes());
        raw.extend_from_slice(&(data_offset as u16).to_le_bytes());
        raw.extend_from_slice(&EFI_GUIDED_SECTION_AUTH_STATUS_VALID.to_le_bytes());
        raw.extend_from_slice(&crc.to_le_bytes());
        raw.extend_from_slice(payload);
        raw
    }

    fn build_pe32_image() -> Vec<u8> {
        let mut dos = DosHeader::new_zeroed();
        dos.e_magic = IMAGE_DOS_SIGNATURE;
        dos.e_lfanew = 64;

        let mut file_header = ImageFileHeader::new_zeroed();
        file_header.machine = IMAGE_FILE_MACHINE_AMD64;
        file_header.number_of_sections = 1;
        file_header.size_of_optional_header = core::mem::size_of::<OptionalHeader64>() as u16;

        let mut optional = OptionalHeader64::new_zeroed();
        optional.magic = IMAGE_PE_OPTIONAL_HDR64_MAGIC;
        optional.subsystem = 0x000B;
        optional.image_base = 0xFFF0_0000;

        let mut raw = Vec::new();
        raw.extend_from_slice(dos.as_bytes());
        raw.extend_from_slice(&IMAGE_PE_SIGNATURE.to_le_bytes());
        raw.extend_from_slice(file_header.as_bytes());
        raw.extend_from_slice(optional.as_bytes());
        raw
    }

    /// Pad a volume body to the size the block map claims.
    fn fill_body(mut content: Vec<u8>, body_size: usize) -> Vec<u8> {
        assert!(content.len() <= body_size);
        content.resize(body_size, 0xFF);
        content
    }

    fn parse_image(image: &[u8]) -> (FfsParser<'_>, Result<(), ParseError>) {
        let mut parser = FfsParser::new(image);
        let result = parser.parse();
        (parser, result)
    }

    fn only_child(model: &TreeModel, item: ItemId) -> ItemId {
        assert_eq!(model.row_count(item), 1, "expected exactly one child");
        model.child(item, 0).unwrap()
    }

    /// header + children (or body) + tail must reproduce the item bytes.
    fn reassemble(model: &TreeModel, item: ItemId) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(model.bytes(model.header(item)));
        if model.row_count(item) == 0 {
            out.extend_from_slice(model.bytes(model.body(item)));
        } else {
            for row in 0..model.row_count(item) {
                let child = model.child(item, row).unwrap();
                out.extend_from_slice(&reassemble(model, child));
            }
        }
        out.extend_from_slice(model.bytes(model.tail(item)));
        out
    }

    fn assert_tree_invariants(model: &TreeModel, item: ItemId) {
        let parent_start = model.offset(item);
        let parent_end = parent_start + model.full_size(item);
        let mut previous_end = None;
        for row in 0..model.row_count(item) {
            let child = model.child(item, row).unwrap();
            if model.header(child).buffer != model.header(item).buffer
                || model.body(child).buffer != model.body(item).buffer
            {
                continue;
            }
            let child_start = model.offset(child);
            let child_end = child_start + model.full_size(child);
            if model.item_type(item) != ItemType::Root {
                assert!(parent_start <= child_start, "child starts before parent");
                assert!(child_end <= parent_end, "child overflows parent");
            }
            if let Some(end) = previous_end {
                assert!(end <= child_start, "siblings overlap");
            }
            previous_end = Some(child_end);
            assert_tree_invariants(model, child);
        }
    }

    #[test]
    fn minimum_size_is_enforced() {
        let image = [0xFFu8; 28];
        let (parser, result) = parse_image(&image);
        assert_eq!(result, Err(ParseError::InvalidParameter));
        assert_eq!(parser.model().row_count(parser.model().root()), 0);
    }

    #[test]
    fn tiny_all_ones_buffer_becomes_image_with_padding() {
        let image = [0xFFu8; 29];
        let (parser, result) = parse_image(&image);
        assert_eq!(result, Ok(()));
        let model = parser.model();
        let image_item = only_child(model, model.root());
        assert_eq!(model.item_type(image_item), ItemType::Image);
        assert_eq!(model.subtype(image_item), ImageSubtype::Uefi as u8);
        let padding = only_child(model, image_item);
        assert_eq!(model.item_type(padding), ItemType::Padding);
        assert_eq!(model.subtype(padding), PaddingSubtype::One as u8);
    }

    #[test]
    fn plain_uefi_image_with_pe32_driver() {
        let mut pe = build_pe32_image();
        // Pad the payload so the file ends on an 8-byte boundary and the
        // byte-exact reassembly below holds.
        pe.resize(164, 0);
        let section = build_section(EFI_SECTION_PE32, &pe);
        let file = build_file(TEST_FILE_GUID, EFI_FV_FILETYPE_DRIVER, &section);
        let body = fill_body(file, 0x8000 - 72);
        let image = build_volume(&body, 0x1000, true);
        assert_eq!(image.len(), 0x8000);

        let (parser, result) = parse_image(&image);
        assert_eq!(result, Ok(()));

        let model = parser.model();
        let image_item = only_child(model, model.root());
        assert_eq!(model.item_type(image_item), ItemType::Image);
        let volume = only_child(model, image_item);
        assert_eq!(model.item_type(volume), ItemType::Volume);

        // One driver file plus trailing free space.
        assert_eq!(model.row_count(volume), 2);
        let file_item = model.child(volume, 0).unwrap();
        assert_eq!(model.item_type(file_item), ItemType::File);
        assert_eq!(model.subtype(file_item), EFI_FV_FILETYPE_DRIVER);
        let free_space = model.child(volume, 1).unwrap();
        assert_eq!(model.item_type(free_space), ItemType::FreeSpace);

        let section_item = only_child(model, file_item);
        assert_eq!(model.item_type(section_item), ItemType::Section);
        assert_eq!(model.subtype(section_item), EFI_SECTION_PE32);
        assert!(model.info(section_item).contains("Machine type: x86-64"));

        assert_tree_invariants(model, model.root());
        assert_eq!(reassemble(model, image_item), image);
    }

    #[test]
    fn intel_image_with_descriptor_me_and_bios() {
        let mut image = vec![0xFFu8; 0x80_0000];
        image[..0x1000].fill(0);

        // Signature and descriptor map.
        image[16..20].copy_from_slice(&[0x5A, 0xA5, 0xF0, 0x0F]);
        let flmap0 = FLMAP0::new().with_FCBA(3).with_FRBA(4).with_NR(4);
        image[20..24].copy_from_slice(&flmap0.into_bits().to_le_bytes());
        let flmap1 = FLMAP1::new().with_FMBA(6).with_NM(2);
        image[24..28].copy_from_slice(&flmap1.into_bits().to_le_bytes());

        // Component section at 0x30 stays zeroed: 20 MHz read clock means
        // a version 1 descriptor.

        // Region section at 0x40: BIOS at [400000h, 800000h), ME at
        // [1000h, 400000h).
        let bios = FlashRegion::new().with_base(0x400).with_limit(0x7FF);
        image[0x44..0x48].copy_from_slice(&bios.into_bits().to_le_bytes());
        let me = FlashRegion::new().with_base(0x001).with_limit(0x3FF);
        image[0x48..0x4C].copy_from_slice(&me.into_bits().to_le_bytes());

        // BIOS region holds one small volume, the rest is erased.
        let volume = build_volume(&vec![0xFFu8; 0x8000 - 72], 0x1000, true);
        image[0x40_0000..0x40_0000 + volume.len()].copy_from_slice(&volume);

        let (parser, result) = parse_image(&image);
        assert_eq!(result, Ok(()));

        let model = parser.model();
        let image_item = only_child(model, model.root());
        assert_eq!(model.item_type(image_item), ItemType::Image);
        assert_eq!(model.subtype(image_item), ImageSubtype::Intel as u8);

        assert_eq!(model.row_count(image_item), 3);
        let subtypes: Vec<u8> = (0..3)
            .map(|row| model.subtype(model.child(image_item, row).unwrap()))
            .collect();
        assert_eq!(
            subtypes,
            vec![
                RegionSubtype::Descriptor as u8,
                RegionSubtype::Me as u8,
                RegionSubtype::Bios as u8
            ]
        );

        // ME region is erased and diagnosed as empty.
        assert!(parser
            .diagnostics()
            .iter()
            .any(|diagnostic| diagnostic.message.contains("ME region is empty")));

        // BIOS region was scanned for volumes.
        let bios_region = model.child(image_item, 2).unwrap();
        assert_eq!(model.item_type(bios_region), ItemType::Region);
        assert!(model.row_count(bios_region) >= 1);
        let bios_volume = model.child(bios_region, 0).unwrap();
        assert_eq!(model.item_type(bios_volume), ItemType::Volume);

        assert_tree_invariants(model, model.root());
    }

    #[test]
    fn not_compressed_section_wraps_parsed_payload() {
        let inner = build_section(EFI_SECTION_RAW, b"HELLO");
        let compressed = build_compressed_section(NOT_COMPRESSED, inner.len() as u32, &inner);
        let file = build_file(TEST_FILE_GUID, EFI_FV_FILETYPE_DRIVER, &compressed);
        let image = build_volume(&fill_body(file, 0x2000 - 72), 0x1000, true);

        let (parser, result) = parse_image(&image);
        assert_eq!(result, Ok(()));

        let model = parser.model();
        let image_item = only_child(model, model.root());
        let volume = only_child(model, image_item);
        let file_item = model.child(volume, 0).unwrap();
        let compression_section = only_child(model, file_item);
        assert_eq!(model.subtype(compression_section), EFI_SECTION_COMPRESSION);
        assert!(model
            .info(compression_section)
            .contains("Compression algorithm: None"));
        assert!(!model.compressed(compression_section));

        let raw_section = only_child(model, compression_section);
        assert_eq!(model.subtype(raw_section), EFI_SECTION_RAW);
        assert_eq!(model.bytes(model.body(raw_section)), b"HELLO");
    }

    #[test]
    fn crc32_guided_section_with_wrong_crc_is_diagnosed_but_parsed() {
        let inner = build_section(EFI_SECTION_RAW, b"HELLO");
        let guided = build_crc32_section(0xDEAD_BEEF, &inner);
        let file = build_file(TEST_FILE_GUID, EFI_FV_FILETYPE_DRIVER, &guided);
        let image = build_volume(&fill_body(file, 0x2000 - 72), 0x1000, true);

        let (parser, result) = parse_image(&image);
        assert_eq!(result, Ok(()));

        assert!(parser.diagnostics().iter().any(|diagnostic| diagnostic
            .message
            .contains("GUID defined section with invalid CRC32")));

        let model = parser.model();
        let image_item = only_child(model, model.root());
        let volume = only_child(model, image_item);
        let file_item = model.child(volume, 0).unwrap();
        let guided_section = only_child(model, file_item);
        assert_eq!(model.subtype(guided_section), EFI_SECTION_GUID_DEFINED);
        let raw_section = only_child(model, guided_section);
        assert_eq!(model.subtype(raw_section), EFI_SECTION_RAW);
        assert_eq!(model.bytes(model.body(raw_section)), b"HELLO");
    }

    #[test]
    fn duplicate_file_guids_are_diagnosed() {
        let first = build_file(TEST_FILE_GUID, EFI_FV_FILETYPE_RAW, &[0xAAu8; 16]);
        let second = build_file(TEST_FILE_GUID, EFI_FV_FILETYPE_RAW, &[0xBBu8; 16]);
        let mut content = first;
        content.extend_from_slice(&second);
        let image = build_volume(&fill_body(content, 0x2000 - 72), 0x1000, true);

        let (parser, result) = parse_image(&image);
        assert_eq!(result, Ok(()));
        assert!(parser.diagnostics().iter().any(|diagnostic| diagnostic
            .message
            .contains(&format!("file with duplicate GUID {TEST_FILE_GUID}"))));
    }

    #[test]
    fn large_file_size_overflow_is_diagnosed_as_invalid_file() {
        // An FFSv3-style bogus file: a header claiming more bytes than the
        // volume holds. The header probe is non-empty, so the remainder
        // turns into non-UEFI data with an invalid-file diagnostic.
        let mut bogus = build_file(TEST_FILE_GUID, EFI_FV_FILETYPE_RAW, &[0u8; 8]);
        bogus[20..23].copy_from_slice(&u32_to_uint24(0xFF_FFF0));
        let image = build_volume(&fill_body(bogus, 0x2000 - 72), 0x1000, true);

        let (parser, result) = parse_image(&image);
        assert_eq!(result, Ok(()));
        assert!(parser
            .diagnostics()
            .iter()
            .any(|diagnostic| diagnostic.message.contains("invalid file")));
    }

    fn build_vtf_image() -> (Vec<u8>, usize, usize) {
        // One volume filling the whole image; the VTF is its first file
        // with a FIT table and FIT pointer inside its body.
        let volume_header_size = 72usize;
        let vtf_body_size = 0x100usize;
        let fit_offset_in_body = 0x10usize;

        let mut vtf_body = vec![0xFFu8; vtf_body_size];

        // FIT header entry: the address field holds the signature.
        let header_entry = FitEntry {
            address: u64::from_le_bytes(*b"_FIT_   "),
            size: [2, 0, 0],
            reserved: 0,
            version: 0x0100,
            type_checksum_valid: 0x00,
            checksum: 0,
        };
        let empty_entry = FitEntry {
            address: 0,
            size: [0, 0, 0],
            reserved: 0,
            version: 0,
            type_checksum_valid: 0x7F,
            checksum: 0,
        };
        vtf_body[fit_offset_in_body..fit_offset_in_body + 16]
            .copy_from_slice(header_entry.as_bytes());
        vtf_body[fit_offset_in_body + 16..fit_offset_in_body + 32]
            .copy_from_slice(empty_entry.as_bytes());

        // The FIT pointer holds the table's physical address; the address
        // translation pins the last VTF byte to 0xFFFFFFFF.
        let file_header_size = 24usize;
        let vtf_offset = volume_header_size;
        let vtf_size = file_header_size + vtf_body_size;
        let diff = 0x1_0000_0000u64 - (vtf_offset + vtf_size) as u64;
        let fit_address = diff + (vtf_offset + file_header_size + fit_offset_in_body) as u64;
        let pointer_at = vtf_body_size - FIT_POINTER_OFFSET;
        vtf_body[pointer_at..pointer_at + 4]
            .copy_from_slice(&(fit_address as u32).to_le_bytes());

        let vtf_file = build_file(
            EFI_FFS_VOLUME_TOP_FILE_GUID,
            EFI_FV_FILETYPE_RAW,
            &vtf_body,
        );
        let image_size = 0x2000usize;
        let body = fill_body(vtf_file, image_size - volume_header_size);
        let image = build_volume(&body, 0x1000, true);
        (image, vtf_offset, vtf_size)
    }

    #[test]
    fn vtf_enables_second_pass_and_fit_discovery() {
        let (image, vtf_offset, vtf_size) = build_vtf_image();
        let (parser, result) = parse_image(&image);
        assert_eq!(result, Ok(()));

        let model = parser.model();
        let vtf = parser.last_vtf().expect("VTF must be recorded");
        assert_eq!(model.item_type(vtf), ItemType::File);
        assert_eq!(model.offset(vtf), vtf_offset);
        assert_eq!(model.full_size(vtf), vtf_size);
        assert_eq!(model.text(vtf), "Volume Top File");

        // Addresses were assigned by the rigid translation.
        let expected = 0x1_0000_0000u64 - (vtf_offset + vtf_size) as u64 + vtf_offset as u64;
        assert_eq!(model.address(vtf), Some(expected));
        assert!(model.info(vtf).contains("Header memory address:"));

        // The FIT header row plus the one empty entry.
        assert_eq!(parser.fit_table().len(), 2);
        assert_eq!(parser.fit_table()[0].address, "_FIT_   ");
        assert_eq!(parser.fit_table()[1].entry_type.trim_end(), "Empty");
    }

    #[test]
    fn protected_range_marking_and_validation() {
        use sha2::{Digest, Sha256};

        let (image, vtf_offset, vtf_size) = build_vtf_image();
        let (mut parser, result) = parse_image(&image);
        assert_eq!(result, Ok(()));

        let digest: [u8; 32] =
            Sha256::digest(&image[vtf_offset..vtf_offset + vtf_size]).into();
        parser.protected_ranges.push(ProtectedRange {
            kind: ProtectedRangeKind::BootGuard,
            segments: vec![(vtf_offset, vtf_size)],
            digest,
        });
        parser.validate_protected_ranges();

        let vtf = parser.last_vtf().unwrap();
        assert_eq!(parser.model().marking(vtf), Marking::BootGuard);
        assert!(parser.model().fixed(vtf));
        assert!(!parser
            .diagnostics()
            .iter()
            .any(|diagnostic| diagnostic.message.contains("hash mismatch")));

        // A corrupted digest is a mismatch diagnostic, not a failure.
        parser.protected_ranges.push(ProtectedRange {
            kind: ProtectedRangeKind::BootGuard,
            segments: vec![(vtf_offset, vtf_size)],
            digest: [0u8; 32],
        });
        parser.protected_ranges.remove(0);
        parser.validate_protected_ranges();
        assert!(parser
            .diagnostics()
            .iter()
            .any(|diagnostic| diagnostic.message.contains("hash mismatch")));
    }
}
