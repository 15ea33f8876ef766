//! Section headers and type-specific section body handlers.

use zerocopy::FromBytes;

use crate::decomp::{decompress, CompressionAlgorithm, Decompressed, EFI_CUSTOMIZED_COMPRESSION_LZMAF86};
use crate::ffs::{
    section_type_to_string, uint24_to_u32, CompressionSectionFields, FreeformSubtypeGuidSectionFields,
    GuidDefinedSectionFields, PostcodeSectionFields, VersionSectionFields, WinCertificate,
    WinCertificateUefiGuid, EFI_CERT_TYPE_RSA2048_SHA256_GUID, EFI_DEP_AFTER, EFI_DEP_AND,
    EFI_DEP_BEFORE, EFI_DEP_END, EFI_DEP_FALSE, EFI_DEP_NOT, EFI_DEP_OR, EFI_DEP_PUSH, EFI_DEP_SOR,
    EFI_DEP_TRUE, EFI_DXE_APRIORI_FILE_GUID, EFI_FIRMWARE_CONTENTS_SIGNED_GUID,
    EFI_GUIDED_SECTION_AUTH_STATUS_VALID, EFI_GUIDED_SECTION_CRC32, EFI_GUIDED_SECTION_LZMA,
    EFI_GUIDED_SECTION_LZMAF86, EFI_GUIDED_SECTION_PROCESSING_REQUIRED, EFI_GUIDED_SECTION_TIANO,
    EFI_PEI_APRIORI_FILE_GUID, EFI_SECTION2_IS_USED, EFI_SECTION_APPLE_USED, EFI_SECTION_COMPRESSION,
    EFI_SECTION_COMPATIBILITY16, EFI_SECTION_DISPOSABLE, EFI_SECTION_DXE_DEPEX,
    EFI_SECTION_FIRMWARE_VOLUME_IMAGE, EFI_SECTION_FREEFORM_SUBTYPE_GUID, EFI_SECTION_GUID_DEFINED,
    EFI_SECTION_MM_DEPEX, EFI_SECTION_PE32, EFI_SECTION_PEI_DEPEX, EFI_SECTION_PIC,
    EFI_SECTION_RAW, EFI_SECTION_TE, EFI_SECTION_USER_INTERFACE, EFI_SECTION_VERSION,
    EFI_STANDARD_COMPRESSION, INSYDE_SECTION_POSTCODE, PHOENIX_SECTION_POSTCODE,
    WIN_CERT_TYPE_EFI_GUID,
};
use crate::guid::Guid;
use crate::parser::{align4, full_size_info, FfsParser};
use crate::pe::{
    machine_type_to_string, DosHeader, ImageFileHeader, OptionalHeader32, OptionalHeader64,
    PeHeader, TeHeader, IMAGE_DOS_SIGNATURE, IMAGE_PE_OPTIONAL_HDR32_MAGIC,
    IMAGE_PE_OPTIONAL_HDR64_MAGIC, IMAGE_PE_SIGNATURE, IMAGE_TE_SIGNATURE,
};
use crate::tree::{
    ByteSlice, CompressedSectionParsingData, FreeformGuidedSectionParsingData,
    GuidedSectionParsingData, ItemId, ItemType, PaddingSubtype, ParsingData,
    TeBaseKind, TeImageSectionParsingData,
};
use crate::ParseError;

const COMMON_HEADER_SIZE: usize = 4;
const EXTENDED_HEADER_SIZE: usize = 8;

impl<'a> FfsParser<'a> {
    /// Walk a sections area at 4-byte-aligned offsets. In dry-run mode the
    /// first malformed header aborts with InvalidSection and nothing is
    /// inserted; the mode resolves ambiguous decompression candidates.
    pub(crate) fn parse_sections(
        &mut self,
        area: ByteSlice,
        parent: ItemId,
        dry_run: bool,
    ) -> Result<(), ParseError> {
        let ffs_version = self.enclosing_ffs_version(parent);
        let data = self.model.bytes(area).to_vec();
        let body_size = data.len();
        let mut section_offset = 0usize;

        while section_offset < body_size {
            let section_size = Self::get_section_size(&data, section_offset, ffs_version);

            if section_size < COMMON_HEADER_SIZE || section_size > body_size - section_offset {
                if dry_run {
                    return Err(ParseError::InvalidSection);
                }
                // The remainder cannot be a section; keep it as padding.
                let padding_size = body_size - section_offset;
                let info = full_size_info(padding_size);
                let padding_index = self.model.add_item(
                    parent,
                    area.start + section_offset,
                    ItemType::Padding,
                    PaddingSubtype::Data as u8,
                    "Non-UEFI data",
                    "",
                    info,
                    ByteSlice::EMPTY,
                    area.sub(section_offset, padding_size),
                    ByteSlice::EMPTY,
                    true,
                )?;
                self.msg(
                    Some(padding_index),
                    "parseSections: non-UEFI data found in sections area",
                );
                break;
            }

            let section_slice = area.sub(section_offset, section_size);
            if let Err(error) = self.parse_section_header(section_slice, parent, dry_run) {
                if dry_run {
                    return Err(ParseError::InvalidSection);
                }
                self.msg(
                    Some(parent),
                    format!("parseSections: section header parsing failed with error {error}"),
                );
            }

            section_offset = align4(section_offset + section_size);
        }

        if dry_run {
            return Ok(());
        }

        for row in 0..self.model.row_count(parent) {
            let child = self.model.child(parent, row).unwrap();
            match self.model.item_type(child) {
                ItemType::Section => {
                    let _ = self.parse_section_body(child);
                }
                ItemType::Padding => {}
                _ => return Err(ParseError::UnknownItemType),
            }
        }

        Ok(())
    }

    fn get_section_size(data: &[u8], offset: usize, ffs_version: u8) -> usize {
        if data.len() < offset + COMMON_HEADER_SIZE {
            return 0;
        }
        let size24 = uint24_to_u32(&[data[offset], data[offset + 1], data[offset + 2]]);
        if ffs_version == 3 && size24 == EFI_SECTION2_IS_USED {
            if data.len() < offset + EXTENDED_HEADER_SIZE {
                return 0;
            }
            u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap()) as usize
        } else {
            size24 as usize
        }
    }

    /// Size of the common header part: 4 bytes ordinarily, 8 when the
    /// extended 32-bit size is in use or the Apple used-marker is present.
    fn common_header_size(section: &[u8], ffs_version: u8) -> usize {
        let size24 = uint24_to_u32(&[section[0], section[1], section[2]]);
        if ffs_version == 3 && size24 == EFI_SECTION2_IS_USED {
            return EXTENDED_HEADER_SIZE;
        }
        if section.len() >= 8 {
            let reserved = u32::from_le_bytes(section[4..8].try_into().unwrap());
            if reserved == EFI_SECTION_APPLE_USED {
                return EXTENDED_HEADER_SIZE;
            }
        }
        COMMON_HEADER_SIZE
    }

    fn parse_section_header(
        &mut self,
        section: ByteSlice,
        parent: ItemId,
        dry_run: bool,
    ) -> Result<(), ParseError> {
        if section.len < COMMON_HEADER_SIZE {
            return Err(ParseError::InvalidSection);
        }
        let section_type = self.model.bytes(section)[3];
        match section_type {
            EFI_SECTION_COMPRESSION => self.parse_compressed_section_header(section, parent, dry_run),
            EFI_SECTION_GUID_DEFINED => self.parse_guided_section_header(section, parent, dry_run),
            EFI_SECTION_FREEFORM_SUBTYPE_GUID => {
                self.parse_freeform_guided_section_header(section, parent, dry_run)
            }
            EFI_SECTION_VERSION => self.parse_version_section_header(section, parent, dry_run),
            PHOENIX_SECTION_POSTCODE | INSYDE_SECTION_POSTCODE => {
                self.parse_postcode_section_header(section, parent, dry_run)
            }
            EFI_SECTION_DISPOSABLE
            | EFI_SECTION_DXE_DEPEX
            | EFI_SECTION_PEI_DEPEX
            | EFI_SECTION_MM_DEPEX
            | EFI_SECTION_PE32
            | EFI_SECTION_PIC
            | EFI_SECTION_TE
            | EFI_SECTION_COMPATIBILITY16
            | EFI_SECTION_USER_INTERFACE
            | EFI_SECTION_FIRMWARE_VOLUME_IMAGE
            | EFI_SECTION_RAW => self.parse_common_section_header(section, parent, dry_run),
            unknown => {
                let result = self.parse_common_section_header(section, parent, dry_run);
                if !dry_run {
                    self.msg(
                        Some(parent),
                        format!("parseSectionHeader: section with unknown type {unknown:02X}h"),
                    );
                }
                result
            }
        }
    }

    fn parse_common_section_header(
        &mut self,
        section: ByteSlice,
        parent: ItemId,
        dry_run: bool,
    ) -> Result<(), ParseError> {
        let ffs_version = self.enclosing_ffs_version(parent);
        let data = self.model.bytes(section).to_vec();
        let header_size = Self::common_header_size(&data, ffs_version);
        if section.len < header_size {
            return Err(ParseError::InvalidSection);
        }
        let section_type = data[3];

        if dry_run {
            return Ok(());
        }

        let name = format!("{} section", section_type_to_string(section_type));
        let info = format!(
            "Type: {:02X}h\n{}\nHeader size: {:X}h ({})\nBody size: {:X}h ({})",
            section_type,
            full_size_info(section.len),
            header_size,
            header_size,
            section.len - header_size,
            section.len - header_size
        );
        self.model.add_item(
            parent,
            section.start,
            ItemType::Section,
            section_type,
            name,
            "",
            info,
            section.sub(0, header_size),
            section.sub(header_size, section.len - header_size),
            ByteSlice::EMPTY,
            false,
        )?;
        Ok(())
    }

    fn parse_compressed_section_header(
        &mut self,
        section: ByteSlice,
        parent: ItemId,
        dry_run: bool,
    ) -> Result<(), ParseError> {
        let ffs_version = self.enclosing_ffs_version(parent);
        let data = self.model.bytes(section).to_vec();
        let common_size = Self::common_header_size(&data, ffs_version);
        let header_size = common_size + core::mem::size_of::<CompressionSectionFields>();
        if section.len < header_size {
            return Err(ParseError::InvalidSection);
        }
        let (fields, _) = CompressionSectionFields::read_from_prefix(&data[common_size..])
            .map_err(|_| ParseError::InvalidSection)?;
        let section_type = data[3];
        let compression_type = fields.compression_type;
        let uncompressed_length = fields.uncompressed_length;

        if dry_run {
            return Ok(());
        }

        let name = format!("{} section", section_type_to_string(section_type));
        let info = format!(
            "Type: {:02X}h\n{}\nHeader size: {:X}h ({})\nBody size: {:X}h ({})\nCompression type: {:02X}h\nDecompressed size: {:X}h ({})",
            section_type,
            full_size_info(section.len),
            header_size, header_size,
            section.len - header_size, section.len - header_size,
            compression_type,
            uncompressed_length, uncompressed_length
        );
        let index = self.model.add_item(
            parent,
            section.start,
            ItemType::Section,
            section_type,
            name,
            "",
            info,
            section.sub(0, header_size),
            section.sub(header_size, section.len - header_size),
            ByteSlice::EMPTY,
            false,
        )?;
        self.model.set_parsing_data(
            index,
            ParsingData::CompressedSection(CompressedSectionParsingData {
                compression_type,
                uncompressed_size: uncompressed_length,
                algorithm: CompressionAlgorithm::Unknown,
            }),
        );
        Ok(())
    }

    fn parse_guided_section_header(
        &mut self,
        section: ByteSlice,
        parent: ItemId,
        dry_run: bool,
    ) -> Result<(), ParseError> {
        let ffs_version = self.enclosing_ffs_version(parent);
        let data = self.model.bytes(section).to_vec();
        let common_size = Self::common_header_size(&data, ffs_version);
        let fields_size = core::mem::size_of::<GuidDefinedSectionFields>();
        if section.len < common_size + fields_size {
            return Err(ParseError::InvalidSection);
        }
        let (fields, _) = GuidDefinedSectionFields::read_from_prefix(&data[common_size..])
            .map_err(|_| ParseError::InvalidSection)?;
        let section_type = data[3];
        let guid = fields.section_definition_guid;
        let attributes = fields.attributes;
        let mut data_offset = fields.data_offset as usize;
        let next_header_offset = common_size + fields_size;
        if data_offset < next_header_offset || data_offset > section.len {
            return Err(ParseError::InvalidSection);
        }

        let mut additional_info = String::new();
        let mut msg_signed_section = false;
        let mut msg_no_auth_status = false;
        let mut msg_no_processing_required_compressed = false;
        let mut msg_no_processing_required_signed = false;
        let mut msg_invalid_crc = false;
        let mut msg_unknown_cert_type = false;
        let mut msg_unknown_cert_subtype = false;

        if guid == EFI_GUIDED_SECTION_CRC32 {
            if attributes & EFI_GUIDED_SECTION_AUTH_STATUS_VALID == 0 {
                msg_no_auth_status = true;
            }
            if section.len < next_header_offset + 4 {
                return Err(ParseError::InvalidSection);
            }
            let crc = u32::from_le_bytes(
                data[next_header_offset..next_header_offset + 4]
                    .try_into()
                    .unwrap(),
            );
            additional_info.push_str("\nChecksum type: CRC32");
            let calculated = crc32fast::hash(&data[data_offset..]);
            if crc == calculated {
                additional_info.push_str(&format!("\nChecksum: {crc:08X}h, valid"));
            } else {
                additional_info.push_str(&format!(
                    "\nChecksum: {crc:08X}h, invalid, should be {calculated:08X}h"
                ));
                msg_invalid_crc = true;
            }
        } else if guid == EFI_GUIDED_SECTION_LZMA
            || guid == EFI_GUIDED_SECTION_LZMAF86
            || guid == EFI_GUIDED_SECTION_TIANO
        {
            if attributes & EFI_GUIDED_SECTION_PROCESSING_REQUIRED == 0 {
                msg_no_processing_required_compressed = true;
            }
        } else if guid == EFI_FIRMWARE_CONTENTS_SIGNED_GUID {
            if attributes & EFI_GUIDED_SECTION_PROCESSING_REQUIRED == 0 {
                msg_no_processing_required_signed = true;
            }
            if section.len < next_header_offset + core::mem::size_of::<WinCertificate>() {
                return Err(ParseError::InvalidSection);
            }
            let (certificate, _) = WinCertificate::read_from_prefix(&data[next_header_offset..])
                .map_err(|_| ParseError::InvalidSection)?;
            data_offset += certificate.length as usize;
            if section.len < data_offset {
                return Err(ParseError::InvalidSection);
            }
            if certificate.certificate_type == WIN_CERT_TYPE_EFI_GUID {
                additional_info.push_str("\nCertificate type: UEFI");
                let (uefi_cert, _) =
                    WinCertificateUefiGuid::read_from_prefix(&data[next_header_offset..])
                        .map_err(|_| ParseError::InvalidSection)?;
                if uefi_cert.cert_type == EFI_CERT_TYPE_RSA2048_SHA256_GUID {
                    additional_info.push_str("\nCertificate subtype: RSA2048/SHA256");
                } else {
                    additional_info.push_str(&format!(
                        "\nCertificate subtype: unknown, GUID {}",
                        uefi_cert.cert_type
                    ));
                    msg_unknown_cert_subtype = true;
                }
            } else {
                additional_info.push_str(&format!(
                    "\nCertificate type: unknown {:04X}h",
                    certificate.certificate_type
                ));
                msg_unknown_cert_type = true;
            }
            msg_signed_section = true;
        }

        if dry_run {
            return Ok(());
        }

        let mut info = format!(
            "Section GUID: {}\nType: {:02X}h\n{}\nHeader size: {:X}h ({})\nBody size: {:X}h ({})\nData offset: {:X}h\nAttributes: {:04X}h",
            guid,
            section_type,
            full_size_info(section.len),
            data_offset, data_offset,
            section.len - data_offset, section.len - data_offset,
            data_offset,
            attributes
        );
        info.push_str(&additional_info);

        let index = self.model.add_item(
            parent,
            section.start,
            ItemType::Section,
            section_type,
            guid.to_string(),
            "",
            info,
            section.sub(0, data_offset),
            section.sub(data_offset, section.len - data_offset),
            ByteSlice::EMPTY,
            false,
        )?;
        self.model.set_parsing_data(
            index,
            ParsingData::GuidedSection(GuidedSectionParsingData { guid }),
        );

        if msg_signed_section {
            self.msg(
                Some(index),
                "parseGuidedSectionHeader: section signature may become invalid after any modification",
            );
        }
        if msg_no_auth_status {
            self.msg(
                Some(index),
                "parseGuidedSectionHeader: CRC32 GUIDed section without AuthStatusValid attribute",
            );
        }
        if msg_no_processing_required_compressed {
            self.msg(
                Some(index),
                "parseGuidedSectionHeader: compressed GUIDed section without ProcessingRequired attribute",
            );
        }
        if msg_no_processing_required_signed {
            self.msg(
                Some(index),
                "parseGuidedSectionHeader: signed GUIDed section without ProcessingRequired attribute",
            );
        }
        if msg_invalid_crc {
            self.msg(
                Some(index),
                "parseGuidedSectionHeader: GUID defined section with invalid CRC32",
            );
        }
        if msg_unknown_cert_type {
            self.msg(
                Some(index),
                "parseGuidedSectionHeader: signed GUIDed section with unknown type",
            );
        }
        if msg_unknown_cert_subtype {
            self.msg(
                Some(index),
                "parseGuidedSectionHeader: signed GUIDed section with unknown subtype",
            );
        }

        Ok(())
    }

    fn parse_freeform_guided_section_header(
        &mut self,
        section: ByteSlice,
        parent: ItemId,
        dry_run: bool,
    ) -> Result<(), ParseError> {
        let ffs_version = self.enclosing_ffs_version(parent);
        let data = self.model.bytes(section).to_vec();
        let common_size = Self::common_header_size(&data, ffs_version);
        let header_size = common_size + core::mem::size_of::<FreeformSubtypeGuidSectionFields>();
        if section.len < header_size {
            return Err(ParseError::InvalidSection);
        }
        let (fields, _) = FreeformSubtypeGuidSectionFields::read_from_prefix(&data[common_size..])
            .map_err(|_| ParseError::InvalidSection)?;
        let section_type = data[3];
        let guid = fields.subtype_guid;

        if dry_run {
            return Ok(());
        }

        let info = format!(
            "Type: {:02X}h\n{}\nHeader size: {:X}h ({})\nBody size: {:X}h ({})\nSubtype GUID: {}",
            section_type,
            full_size_info(section.len),
            header_size,
            header_size,
            section.len - header_size,
            section.len - header_size,
            guid
        );
        let index = self.model.add_item(
            parent,
            section.start,
            ItemType::Section,
            section_type,
            // The subtype GUID is a better identity than the type name.
            guid.to_string(),
            "",
            info,
            section.sub(0, header_size),
            section.sub(header_size, section.len - header_size),
            ByteSlice::EMPTY,
            false,
        )?;
        self.model.set_parsing_data(
            index,
            ParsingData::FreeformGuidedSection(FreeformGuidedSectionParsingData { guid }),
        );
        Ok(())
    }

    fn parse_version_section_header(
        &mut self,
        section: ByteSlice,
        parent: ItemId,
        dry_run: bool,
    ) -> Result<(), ParseError> {
        let ffs_version = self.enclosing_ffs_version(parent);
        let data = self.model.bytes(section).to_vec();
        let common_size = Self::common_header_size(&data, ffs_version);
        let header_size = common_size + core::mem::size_of::<VersionSectionFields>();
        if section.len < header_size {
            return Err(ParseError::InvalidSection);
        }
        let (fields, _) = VersionSectionFields::read_from_prefix(&data[common_size..])
            .map_err(|_| ParseError::InvalidSection)?;
        let section_type = data[3];

        if dry_run {
            return Ok(());
        }

        let name = format!("{} section", section_type_to_string(section_type));
        let info = format!(
            "Type: {:02X}h\n{}\nHeader size: {:X}h ({})\nBody size: {:X}h ({})\nBuild number: {}",
            section_type,
            full_size_info(section.len),
            header_size,
            header_size,
            section.len - header_size,
            section.len - header_size,
            fields.build_number
        );
        self.model.add_item(
            parent,
            section.start,
            ItemType::Section,
            section_type,
            name,
            "",
            info,
            section.sub(0, header_size),
            section.sub(header_size, section.len - header_size),
            ByteSlice::EMPTY,
            false,
        )?;
        Ok(())
    }

    fn parse_postcode_section_header(
        &mut self,
        section: ByteSlice,
        parent: ItemId,
        dry_run: bool,
    ) -> Result<(), ParseError> {
        let ffs_version = self.enclosing_ffs_version(parent);
        let data = self.model.bytes(section).to_vec();
        let common_size = Self::common_header_size(&data, ffs_version);
        let header_size = common_size + core::mem::size_of::<PostcodeSectionFields>();
        if section.len < header_size {
            return Err(ParseError::InvalidSection);
        }
        let (fields, _) = PostcodeSectionFields::read_from_prefix(&data[common_size..])
            .map_err(|_| ParseError::InvalidSection)?;
        let section_type = data[3];

        if dry_run {
            return Ok(());
        }

        let name = format!("{} section", section_type_to_string(section_type));
        let info = format!(
            "Type: {:02X}h\n{}\nHeader size: {:X}h ({})\nBody size: {:X}h ({})\nPostcode: {:X}h",
            section_type,
            full_size_info(section.len),
            header_size,
            header_size,
            section.len - header_size,
            section.len - header_size,
            fields.postcode
        );
        self.model.add_item(
            parent,
            section.start,
            ItemType::Section,
            section_type,
            name,
            "",
            info,
            section.sub(0, header_size),
            section.sub(header_size, section.len - header_size),
            ByteSlice::EMPTY,
            false,
        )?;
        Ok(())
    }

    fn parse_section_body(&mut self, section: ItemId) -> Result<(), ParseError> {
        if self.model.header(section).len < COMMON_HEADER_SIZE {
            return Err(ParseError::InvalidSection);
        }
        match self.model.subtype(section) {
            EFI_SECTION_COMPRESSION => self.parse_compressed_section_body(section),
            EFI_SECTION_GUID_DEFINED => self.parse_guided_section_body(section),
            EFI_SECTION_DISPOSABLE => {
                let body = self.model.body(section);
                self.parse_sections(body, section, false)
            }
            EFI_SECTION_FREEFORM_SUBTYPE_GUID | EFI_SECTION_FIRMWARE_VOLUME_IMAGE => {
                match self.parse_raw_area(section) {
                    Ok(())
                    | Err(ParseError::VolumesNotFound)
                    | Err(ParseError::InvalidVolume) => Ok(()),
                    Err(error) => Err(error),
                }
            }
            EFI_SECTION_VERSION => self.parse_version_section_body(section),
            EFI_SECTION_DXE_DEPEX | EFI_SECTION_PEI_DEPEX | EFI_SECTION_MM_DEPEX => {
                self.parse_depex_section_body(section)
            }
            EFI_SECTION_TE => self.parse_te_image_section_body(section),
            EFI_SECTION_PE32 | EFI_SECTION_PIC => self.parse_pe_image_section_body(section),
            EFI_SECTION_USER_INTERFACE => self.parse_ui_section_body(section),
            EFI_SECTION_RAW => self.parse_raw_section_body(section),
            _ => Ok(()),
        }
    }

    /// Resolve a standard-compression result into the slice to parse:
    /// not-compressed output aliases the body, a decided algorithm lands in
    /// an owned buffer, and an undecided pair is settled by dry runs.
    fn resolve_decompressed(
        &mut self,
        section: ItemId,
        mut decompressed: Decompressed,
    ) -> (CompressionAlgorithm, ByteSlice, bool) {
        let mut algorithm = decompressed.algorithm;
        match algorithm {
            CompressionAlgorithm::None => (algorithm, self.model.body(section), false),
            CompressionAlgorithm::Undecided => {
                let tiano_len = decompressed.data.len();
                let tiano_buffer = self.model.add_buffer(core::mem::take(&mut decompressed.data));
                let tiano_slice = ByteSlice::new(tiano_buffer, 0, tiano_len);
                let efi11 = decompressed.efi11_data.take().unwrap_or_default();
                let efi11_len = efi11.len();
                let efi11_buffer = self.model.add_buffer(efi11);
                let efi11_slice = ByteSlice::new(efi11_buffer, 0, efi11_len);

                if self.parse_sections(tiano_slice, section, true).is_ok() {
                    algorithm = CompressionAlgorithm::Tiano;
                    (algorithm, tiano_slice, true)
                } else if self.parse_sections(efi11_slice, section, true).is_ok() {
                    algorithm = CompressionAlgorithm::Efi11;
                    (algorithm, efi11_slice, true)
                } else {
                    (CompressionAlgorithm::Undecided, tiano_slice, true)
                }
            }
            _ => {
                let len = decompressed.data.len();
                let buffer = self.model.add_buffer(core::mem::take(&mut decompressed.data));
                (algorithm, ByteSlice::new(buffer, 0, len), true)
            }
        }
    }

    fn parse_compressed_section_body(&mut self, section: ItemId) -> Result<(), ParseError> {
        let ParsingData::CompressedSection(cdata) = self.model.parsing_data(section).clone()
        else {
            return Err(ParseError::InvalidParameter);
        };

        let body = self.model.body(section);
        let body_bytes = self.model.bytes(body).to_vec();
        let decompressed = match decompress(&body_bytes, cdata.compression_type) {
            Ok(result) => result,
            Err(error) => {
                self.msg(
                    Some(section),
                    format!("parseCompressedSectionBody: decompression failed with error {error}"),
                );
                return Ok(());
            }
        };

        if cdata.uncompressed_size as usize != decompressed.data.len() {
            let actual = decompressed.data.len();
            self.msg(
                Some(section),
                format!(
                    "parseCompressedSectionBody: decompressed size stored in header {:X}h ({}) differs from actual {:X}h ({})",
                    cdata.uncompressed_size, cdata.uncompressed_size, actual, actual
                ),
            );
            self.model.add_info(
                section,
                &format!("\nActual decompressed size: {actual:X}h ({actual})"),
            );
        }

        let was_undecided = decompressed.algorithm == CompressionAlgorithm::Undecided;
        let (algorithm, parse_slice, owned) = self.resolve_decompressed(section, decompressed);
        if was_undecided && algorithm == CompressionAlgorithm::Undecided {
            self.msg(
                Some(section),
                "parseCompressedSectionBody: can't guess the correct decompression algorithm, both preparse steps are failed",
            );
        }

        self.model
            .add_info(section, &format!("\nCompression algorithm: {algorithm}"));
        self.model.set_parsing_data(
            section,
            ParsingData::CompressedSection(CompressedSectionParsingData {
                compression_type: cdata.compression_type,
                uncompressed_size: cdata.uncompressed_size,
                algorithm,
            }),
        );
        if owned {
            self.model.set_compressed(section, true);
        }

        self.parse_sections(parse_slice, section, false)
    }

    fn parse_guided_section_body(&mut self, section: ItemId) -> Result<(), ParseError> {
        let ParsingData::GuidedSection(gdata) = self.model.parsing_data(section).clone() else {
            return Err(ParseError::InvalidParameter);
        };
        let guid = gdata.guid;
        let body = self.model.body(section);

        if guid == EFI_GUIDED_SECTION_TIANO {
            let body_bytes = self.model.bytes(body).to_vec();
            let decompressed = match decompress(&body_bytes, EFI_STANDARD_COMPRESSION) {
                Ok(result) => result,
                Err(error) => {
                    self.msg(
                        Some(section),
                        format!("parseGuidedSectionBody: decompression failed with error {error}"),
                    );
                    return Ok(());
                }
            };
            let was_undecided = decompressed.algorithm == CompressionAlgorithm::Undecided;
            let (algorithm, parse_slice, owned) = self.resolve_decompressed(section, decompressed);
            if was_undecided && algorithm == CompressionAlgorithm::Undecided {
                self.msg(
                    Some(section),
                    "parseGuidedSectionBody: can't guess the correct decompression algorithm, both preparse steps are failed",
                );
            }
            self.model.add_info(
                section,
                &format!(
                    "\nCompression algorithm: {algorithm}\nDecompressed size: {:X}h ({})",
                    parse_slice.len, parse_slice.len
                ),
            );
            if owned {
                self.model.set_compressed(section, true);
            }
            return self.parse_sections(parse_slice, section, false);
        }

        if guid == EFI_GUIDED_SECTION_LZMA || guid == EFI_GUIDED_SECTION_LZMAF86 {
            let declared = if guid == EFI_GUIDED_SECTION_LZMA {
                crate::ffs::EFI_CUSTOMIZED_COMPRESSION
            } else {
                EFI_CUSTOMIZED_COMPRESSION_LZMAF86
            };
            let body_bytes = self.model.bytes(body).to_vec();
            let decompressed = match decompress(&body_bytes, declared) {
                Ok(result) => result,
                Err(error) => {
                    self.msg(
                        Some(section),
                        format!("parseGuidedSectionBody: decompression failed with error {error}"),
                    );
                    return Ok(());
                }
            };
            let (algorithm, parse_slice, owned) = self.resolve_decompressed(section, decompressed);
            self.model.add_info(
                section,
                &format!(
                    "\nCompression algorithm: {algorithm}\nDecompressed size: {:X}h ({})",
                    parse_slice.len, parse_slice.len
                ),
            );
            if owned {
                self.model.set_compressed(section, true);
            }
            return self.parse_sections(parse_slice, section, false);
        }

        if guid == EFI_GUIDED_SECTION_CRC32 || guid == EFI_FIRMWARE_CONTENTS_SIGNED_GUID {
            return self.parse_sections(body, section, false);
        }

        // Unknown GUID: the body stays opaque apart from a volume scan.
        match self.parse_raw_area(section) {
            Ok(()) | Err(ParseError::VolumesNotFound) | Err(ParseError::InvalidVolume) => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn parse_version_section_body(&mut self, section: ItemId) -> Result<(), ParseError> {
        let body = self.model.body(section);
        let text = ucs2_to_string(self.model.bytes(body));
        self.model
            .add_info(section, &format!("\nVersion string: {text}"));
        Ok(())
    }

    fn parse_ui_section_body(&mut self, section: ItemId) -> Result<(), ParseError> {
        let body = self.model.body(section);
        let text = ucs2_to_string(self.model.bytes(body));
        if let Some(file) = self.model.find_parent_of_type(section, ItemType::File) {
            self.model.set_text(file, text.clone());
        }
        self.model.add_info(section, &format!("\nText: {text}"));
        Ok(())
    }

    fn parse_depex_section_body(&mut self, section: ItemId) -> Result<(), ParseError> {
        let body = self.model.body(section);
        let data = self.model.bytes(body).to_vec();

        // One opcode plus END is the minimum sane expression.
        if data.len() < 2 {
            self.msg(Some(section), "parseDepexSectionBody: DEPEX section too short");
            return Err(ParseError::DepexParseFailed);
        }

        let mut parsed = String::new();
        let mut pos = 0usize;

        match data[0] {
            EFI_DEP_BEFORE | EFI_DEP_AFTER => {
                let opcode_name = if data[0] == EFI_DEP_BEFORE { "BEFORE" } else { "AFTER" };
                if data.len() != 2 + Guid::SIZE {
                    self.msg(
                        Some(section),
                        format!(
                            "parseDepexSectionBody: DEPEX section too long for a section starting with {opcode_name} opcode"
                        ),
                    );
                    return Ok(());
                }
                let guid = Guid::read(&data[1..]).unwrap();
                if data[1 + Guid::SIZE] != EFI_DEP_END {
                    self.msg(
                        Some(section),
                        "parseDepexSectionBody: DEPEX section ends with non-END opcode",
                    );
                    return Ok(());
                }
                self.model.add_info(
                    section,
                    &format!("\nParsed expression:\n{opcode_name} {guid}\nEND"),
                );
                return Ok(());
            }
            EFI_DEP_SOR => {
                if data.len() <= 2 {
                    self.msg(
                        Some(section),
                        "parseDepexSectionBody: DEPEX section too short for a section starting with SOR opcode",
                    );
                    return Ok(());
                }
                parsed.push_str("\nSOR");
                pos += 1;
            }
            _ => {}
        }

        while pos < data.len() {
            match data[pos] {
                EFI_DEP_BEFORE => {
                    self.msg(Some(section), "parseDepexSectionBody: misplaced BEFORE opcode");
                    return Ok(());
                }
                EFI_DEP_AFTER => {
                    self.msg(Some(section), "parseDepexSectionBody: misplaced AFTER opcode");
                    return Ok(());
                }
                EFI_DEP_SOR => {
                    self.msg(Some(section), "parseDepexSectionBody: misplaced SOR opcode");
                    return Ok(());
                }
                EFI_DEP_PUSH => {
                    if data.len() - pos <= 1 + Guid::SIZE {
                        self.msg(
                            Some(section),
                            "parseDepexSectionBody: remains of DEPEX section too short for PUSH opcode",
                        );
                        return Ok(());
                    }
                    let guid = Guid::read(&data[pos + 1..]).unwrap();
                    parsed.push_str(&format!("\nPUSH {guid}"));
                    pos += 1 + Guid::SIZE;
                }
                EFI_DEP_AND => {
                    parsed.push_str("\nAND");
                    pos += 1;
                }
                EFI_DEP_OR => {
                    parsed.push_str("\nOR");
                    pos += 1;
                }
                EFI_DEP_NOT => {
                    parsed.push_str("\nNOT");
                    pos += 1;
                }
                EFI_DEP_TRUE => {
                    parsed.push_str("\nTRUE");
                    pos += 1;
                }
                EFI_DEP_FALSE => {
                    parsed.push_str("\nFALSE");
                    pos += 1;
                }
                EFI_DEP_END => {
                    parsed.push_str("\nEND");
                    pos += 1;
                    if pos < data.len() {
                        self.msg(
                            Some(section),
                            "parseDepexSectionBody: DEPEX section ends with non-END opcode",
                        );
                        return Ok(());
                    }
                }
                _ => {
                    self.msg(Some(section), "parseDepexSectionBody: unknown opcode");
                    return Ok(());
                }
            }
        }

        self.model
            .add_info(section, &format!("\nParsed expression:{parsed}"));
        Ok(())
    }

    fn parse_raw_section_body(&mut self, section: ItemId) -> Result<(), ParseError> {
        let Some(file) = self.model.find_parent_of_type(section, ItemType::File) else {
            return Ok(());
        };
        let ParsingData::File(fdata) = self.model.parsing_data(file) else {
            return Ok(());
        };
        let file_guid = fdata.guid;

        if file_guid == EFI_PEI_APRIORI_FILE_GUID || file_guid == EFI_DXE_APRIORI_FILE_GUID {
            let text = if file_guid == EFI_PEI_APRIORI_FILE_GUID {
                "PEI apriori file"
            } else {
                "DXE apriori file"
            };
            let body = self.model.body(section);
            let data = self.model.bytes(body).to_vec();
            if data.len() % Guid::SIZE != 0 {
                self.msg(
                    Some(section),
                    "parseAprioriRawSection: apriori file has size is not a multiple of 16",
                );
            }
            let mut list = String::new();
            for chunk in data.chunks_exact(Guid::SIZE) {
                let guid = Guid::read(chunk).unwrap();
                list.push_str(&format!("\n{guid}"));
            }
            if !list.is_empty() {
                self.model
                    .add_info(section, &format!("\nFile list:{list}"));
            }
            self.model.set_text(file, text);
            return Ok(());
        }

        match self.parse_raw_area(section) {
            Ok(()) | Err(ParseError::VolumesNotFound) | Err(ParseError::InvalidVolume) => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn parse_pe_image_section_body(&mut self, section: ItemId) -> Result<(), ParseError> {
        let body = self.model.body(section);
        let data = self.model.bytes(body).to_vec();

        if data.len() < core::mem::size_of::<DosHeader>() {
            self.msg(
                Some(section),
                "parsePeImageSectionBody: section body size is smaller than DOS header size",
            );
            return Ok(());
        }

        let (dos_header, _) =
            DosHeader::read_from_prefix(&data).map_err(|_| ParseError::InvalidSection)?;
        if dos_header.e_magic != IMAGE_DOS_SIGNATURE {
            self.model.add_info(
                section,
                &format!("\nDOS signature: {:04X}h, invalid", dos_header.e_magic),
            );
            self.msg(
                Some(section),
                "parsePeImageSectionBody: PE32 image with invalid DOS signature",
            );
            return Ok(());
        }

        let pe_offset = dos_header.e_lfanew as usize;
        let Ok((pe_header, _)) = PeHeader::read_from_prefix(&data[pe_offset.min(data.len())..])
        else {
            self.model.add_info(section, "\nDOS header: invalid");
            self.msg(
                Some(section),
                "parsePeImageSectionBody: PE32 image with invalid DOS header",
            );
            return Ok(());
        };
        if pe_header.signature != IMAGE_PE_SIGNATURE {
            self.model.add_info(
                section,
                &format!("\nPE signature: {:08X}h, invalid", pe_header.signature),
            );
            self.msg(
                Some(section),
                "parsePeImageSectionBody: PE32 image with invalid PE signature",
            );
            return Ok(());
        }

        let file_header_offset = pe_offset + core::mem::size_of::<PeHeader>();
        let Ok((file_header, _)) =
            ImageFileHeader::read_from_prefix(&data[file_header_offset.min(data.len())..])
        else {
            self.model.add_info(section, "\nPE header: invalid");
            self.msg(
                Some(section),
                "parsePeImageSectionBody: PE32 image with invalid PE header",
            );
            return Ok(());
        };

        let mut info = format!(
            "\nDOS signature: {:04X}h\nPE signature: {:08X}h\nMachine type: {}\nNumber of sections: {}\nCharacteristics: {:04X}h",
            dos_header.e_magic,
            pe_header.signature,
            machine_type_to_string(file_header.machine),
            file_header.number_of_sections,
            file_header.characteristics
        );

        let optional_offset = file_header_offset + core::mem::size_of::<ImageFileHeader>();
        let optional_magic = if optional_offset + 2 <= data.len() {
            u16::from_le_bytes(data[optional_offset..optional_offset + 2].try_into().unwrap())
        } else {
            0
        };
        let mut msg_invalid_optional = false;
        match optional_magic {
            IMAGE_PE_OPTIONAL_HDR32_MAGIC => {
                if let Ok((optional, _)) =
                    OptionalHeader32::read_from_prefix(&data[optional_offset..])
                {
                    info.push_str(&format!(
                        "\nOptional header signature: {:04X}h\nSubsystem: {:04X}h\nAddress of entry point: {:X}h\nBase of code: {:X}h\nImage base: {:X}h",
                        optional.magic,
                        optional.subsystem,
                        optional.address_of_entry_point,
                        optional.base_of_code,
                        optional.image_base
                    ));
                } else {
                    msg_invalid_optional = true;
                }
            }
            IMAGE_PE_OPTIONAL_HDR64_MAGIC => {
                if let Ok((optional, _)) =
                    OptionalHeader64::read_from_prefix(&data[optional_offset..])
                {
                    info.push_str(&format!(
                        "\nOptional header signature: {:04X}h\nSubsystem: {:04X}h\nAddress of entry point: {:X}h\nBase of code: {:X}h\nImage base: {:X}h",
                        optional.magic,
                        optional.subsystem,
                        optional.address_of_entry_point,
                        optional.base_of_code,
                        optional.image_base
                    ));
                } else {
                    msg_invalid_optional = true;
                }
            }
            unknown => {
                info.push_str(&format!(
                    "\nOptional header signature: {unknown:04X}h, unknown"
                ));
                self.msg(
                    Some(section),
                    "parsePeImageSectionBody: PE32 image with invalid optional PE header signature",
                );
            }
        }
        if msg_invalid_optional {
            info.push_str("\nPE optional header: invalid");
            self.msg(
                Some(section),
                "parsePeImageSectionBody: PE32 image with invalid PE optional header",
            );
        }

        self.model.add_info(section, &info);
        Ok(())
    }

    fn parse_te_image_section_body(&mut self, section: ItemId) -> Result<(), ParseError> {
        let body = self.model.body(section);
        let data = self.model.bytes(body).to_vec();

        if data.len() < core::mem::size_of::<TeHeader>() {
            self.msg(
                Some(section),
                "parseTeImageSectionBody: section body size is smaller than TE header size",
            );
            return Ok(());
        }

        let (te_header, _) =
            TeHeader::read_from_prefix(&data).map_err(|_| ParseError::InvalidSection)?;
        let adjusted_image_base = te_header
            .image_base
            .wrapping_add(te_header.stripped_size as u64)
            .wrapping_sub(core::mem::size_of::<TeHeader>() as u64);

        if te_header.signature != IMAGE_TE_SIGNATURE {
            self.model.add_info(
                section,
                &format!("\nSignature: {:04X}h, invalid", te_header.signature),
            );
            self.msg(
                Some(section),
                "parseTeImageSectionBody: TE image with invalid TE signature",
            );
            return Ok(());
        }

        let info = format!(
            "\nSignature: {:04X}h\nMachine type: {}\nNumber of sections: {}\nSubsystem: {:02X}h\nStripped size: {:X}h ({})\nBase of code: {:X}h\nAddress of entry point: {:X}h\nImage base: {:X}h\nAdjusted image base: {:X}h",
            te_header.signature,
            machine_type_to_string(te_header.machine),
            te_header.number_of_sections,
            te_header.subsystem,
            te_header.stripped_size, te_header.stripped_size,
            te_header.base_of_code,
            te_header.address_of_entry_point,
            te_header.image_base,
            adjusted_image_base
        );
        self.model.add_info(section, &info);
        self.model.set_parsing_data(
            section,
            ParsingData::TeImageSection(TeImageSectionParsingData {
                image_base: te_header.image_base,
                adjusted_image_base,
                base_kind: TeBaseKind::Unknown,
            }),
        );

        Ok(())
    }
}

/// Decode a UCS-2 little-endian string, stopping at the terminator.
fn ucs2_to_string(body: &[u8]) -> String {
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}
