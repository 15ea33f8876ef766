//! Raw-area scanning, firmware volume headers and bodies, FFS files.

use zerocopy::FromBytes;

use crate::ffs::{
    calculate_checksum8, calculate_checksum16, uint24_to_u32, BlockMapEntry, FfsFileHeader,
    FfsFileHeader2, FirmwareVolumeHeader, VolumeExtHeader, ADDITIONAL_NVRAM_STORE_VOLUME_GUID,
    EFI_DXE_CORE_GUID, EFI_FFS_VOLUME_TOP_FILE_GUID, EFI_FVB2_ALIGNMENT, EFI_FVB2_WEAK_ALIGNMENT,
    EFI_FVB_ALIGNMENT_CAP, EFI_FVB_ERASE_POLARITY, EFI_FV_FILETYPE_ALL, EFI_FV_FILETYPE_MM_CORE_STANDALONE,
    EFI_FV_FILETYPE_PAD, EFI_FV_FILETYPE_RAW, FFS_ALIGNMENT_TABLE, FFS_ATTRIB_CHECKSUM,
    FFS_ATTRIB_DATA_ALIGNMENT, FFS_ATTRIB_FIXED, FFS_ATTRIB_LARGE_FILE, FFS_ATTRIB_TAIL_PRESENT,
    FFS_FIXED_CHECKSUM, FFS_FIXED_CHECKSUM2, FFS_V2_VOLUMES, FFS_V3_VOLUMES, FVH_SIGNATURE,
    FVH_SIGNATURE_OFFSET, NVAR_STORE_FILE_GUID, NVRAM_MAIN_STORE_VOLUME_GUID,
    VENDOR_HASH_FILE_GUID_AMI, VENDOR_HASH_FILE_GUID_PHOENIX,
};
use crate::fit::VendorHashKind;
use crate::guid::known_file_name;
use crate::parser::{align8, full_size_info, FfsParser};
use crate::tree::{
    ByteSlice, FileParsingData, ItemId, ItemType, PaddingSubtype, ParsingData, VolumeParsingData,
    VolumeSubtype, IMAGE_BUFFER,
};
use crate::ParseError;

const VOLUME_HEADER_SIZE: usize = core::mem::size_of::<FirmwareVolumeHeader>();
const FILE_HEADER_SIZE: usize = core::mem::size_of::<FfsFileHeader>();
const FILE_HEADER2_SIZE: usize = core::mem::size_of::<FfsFileHeader2>();

impl<'a> FfsParser<'a> {
    /// Scan an area (a parent's body) for firmware volumes, classifying
    /// everything between them as padding.
    pub(crate) fn parse_raw_area(&mut self, parent: ItemId) -> Result<(), ParseError> {
        let area = self.model.body(parent);
        let data = self.model.bytes(area).to_vec();

        let Some(mut volume_offset) = self.find_next_volume(parent, area, &data, 0) else {
            // No volumes at all. BIOS-like spaces keep their bytes visible
            // as one padding child; other containers stay opaque.
            if !data.is_empty()
                && matches!(
                    self.model.item_type(parent),
                    ItemType::Image | ItemType::Region
                )
            {
                let subtype = Self::padding_subtype(&data);
                let info = full_size_info(data.len());
                self.model.add_item(
                    parent,
                    area.start,
                    ItemType::Padding,
                    subtype as u8,
                    "Padding",
                    "",
                    info,
                    ByteSlice::EMPTY,
                    area,
                    ByteSlice::EMPTY,
                    true,
                )?;
            }
            return Err(ParseError::VolumesNotFound);
        };

        if volume_offset > 0 {
            let subtype = Self::padding_subtype(&data[..volume_offset]);
            let info = full_size_info(volume_offset);
            self.model.add_item(
                parent,
                area.start,
                ItemType::Padding,
                subtype as u8,
                "Padding",
                "",
                info,
                ByteSlice::EMPTY,
                area.sub(0, volume_offset),
                ByteSlice::EMPTY,
                true,
            )?;
        }

        let mut prev_volume_offset = volume_offset;
        let mut prev_volume_size = 0usize;

        loop {
            // Padding between volumes.
            if volume_offset > prev_volume_offset + prev_volume_size {
                let padding_offset = prev_volume_offset + prev_volume_size;
                let padding_size = volume_offset - padding_offset;
                let subtype = Self::padding_subtype(&data[padding_offset..volume_offset]);
                let info = full_size_info(padding_size);
                self.model.add_item(
                    parent,
                    area.start + padding_offset,
                    ItemType::Padding,
                    subtype as u8,
                    "Padding",
                    "",
                    info,
                    ByteSlice::EMPTY,
                    area.sub(padding_offset, padding_size),
                    ByteSlice::EMPTY,
                    true,
                )?;
            }

            let (volume_size, bm_volume_size) = match self.get_volume_size(&data, volume_offset) {
                Ok(sizes) => sizes,
                Err(error) => {
                    self.msg(
                        Some(parent),
                        format!("parseRawArea: getVolumeSize failed with error {error}"),
                    );
                    return Err(error);
                }
            };

            // A volume claiming more bytes than the area holds becomes
            // padding, and the scan stops.
            if volume_offset + volume_size > data.len() {
                let padding_size = data.len() - volume_offset;
                let subtype = Self::padding_subtype(&data[volume_offset..]);
                let info = full_size_info(padding_size);
                let padding_index = self.model.add_item(
                    parent,
                    area.start + volume_offset,
                    ItemType::Padding,
                    subtype as u8,
                    "Padding",
                    "",
                    info,
                    ByteSlice::EMPTY,
                    area.sub(volume_offset, padding_size),
                    ByteSlice::EMPTY,
                    true,
                )?;
                self.msg(
                    Some(padding_index),
                    "parseRawArea: one of volumes inside overlaps the end of data",
                );
                prev_volume_offset = volume_offset;
                prev_volume_size = padding_size;
                break;
            }

            let volume_slice = area.sub(volume_offset, volume_size);
            match self.parse_volume_header(volume_slice, parent) {
                Err(error) => self.msg(
                    Some(parent),
                    format!("parseRawArea: volume header parsing failed with error {error}"),
                ),
                Ok(volume_index) => {
                    if volume_size != bm_volume_size {
                        self.msg(
                            Some(volume_index),
                            format!(
                                "parseRawArea: volume size stored in header {:X}h ({}) differs from calculated using block map {:X}h ({})",
                                volume_size, volume_size, bm_volume_size, bm_volume_size
                            ),
                        );
                    }
                }
            }

            prev_volume_offset = volume_offset;
            prev_volume_size = volume_size;
            match self.find_next_volume(parent, area, &data, volume_offset + volume_size) {
                Some(next) => volume_offset = next,
                None => break,
            }
        }

        // Padding at the end of the area.
        let area_end = prev_volume_offset + prev_volume_size;
        if data.len() > area_end {
            let subtype = Self::padding_subtype(&data[area_end..]);
            let info = full_size_info(data.len() - area_end);
            self.model.add_item(
                parent,
                area.start + area_end,
                ItemType::Padding,
                subtype as u8,
                "Padding",
                "",
                info,
                ByteSlice::EMPTY,
                area.sub(area_end, data.len() - area_end),
                ByteSlice::EMPTY,
                true,
            )?;
        }

        // Parse volume bodies.
        for row in 0..self.model.row_count(parent) {
            let child = self.model.child(parent, row).unwrap();
            match self.model.item_type(child) {
                ItemType::Volume => {
                    self.parse_volume_body(child)?;
                }
                ItemType::Padding | ItemType::FreeSpace => {}
                _ => return Err(ParseError::UnknownItemType),
            }
        }

        Ok(())
    }

    /// Find the next plausible volume header at or after `from`. Candidates
    /// with nonsense lengths, reserved bytes, or revisions are skipped with
    /// a diagnostic each.
    fn find_next_volume(
        &mut self,
        parent: ItemId,
        area: ByteSlice,
        data: &[u8],
        from: usize,
    ) -> Option<usize> {
        let mut search_at = from;
        loop {
            let window = &data[search_at.min(data.len())..];
            let signature_at = window
                .windows(4)
                .position(|w| w == FVH_SIGNATURE.to_le_bytes())?
                + search_at;
            search_at = signature_at + 1;
            if signature_at < FVH_SIGNATURE_OFFSET {
                continue;
            }
            let candidate = signature_at - FVH_SIGNATURE_OFFSET;
            let Ok((header, _)) = FirmwareVolumeHeader::read_from_prefix(&data[candidate..]) else {
                continue;
            };
            if (header.fv_length as usize)
                < VOLUME_HEADER_SIZE + 2 * core::mem::size_of::<BlockMapEntry>()
                || header.fv_length >= 0xFFFF_FFFF
            {
                let message = format!(
                    "findNextVolume: volume candidate at offset {:X}h skipped, has invalid FvLength {:X}h",
                    area.start + candidate,
                    header.fv_length
                );
                self.msg(Some(parent), message);
                continue;
            }
            if header.reserved != 0xFF && header.reserved != 0x00 {
                let message = format!(
                    "findNextVolume: volume candidate at offset {:X}h skipped, has invalid Reserved byte value {}",
                    area.start + candidate,
                    header.reserved
                );
                self.msg(Some(parent), message);
                continue;
            }
            if header.revision != 1 && header.revision != 2 {
                let message = format!(
                    "findNextVolume: volume candidate at offset {:X}h skipped, has invalid Revision byte value {}",
                    area.start + candidate,
                    header.revision
                );
                self.msg(Some(parent), message);
                continue;
            }
            return Some(candidate);
        }
    }

    /// Volume size from the header plus the size the block map adds up to.
    fn get_volume_size(&self, data: &[u8], offset: usize) -> Result<(usize, usize), ParseError> {
        if data.len() < offset + VOLUME_HEADER_SIZE + 2 * core::mem::size_of::<BlockMapEntry>() {
            return Err(ParseError::InvalidVolume);
        }
        let (header, _) = FirmwareVolumeHeader::read_from_prefix(&data[offset..])
            .map_err(|_| ParseError::InvalidVolume)?;
        if header.signature != FVH_SIGNATURE {
            return Err(ParseError::InvalidVolume);
        }

        let mut bm_size = 0usize;
        let mut entry_offset = offset + VOLUME_HEADER_SIZE;
        loop {
            if entry_offset + core::mem::size_of::<BlockMapEntry>() > data.len() {
                return Err(ParseError::InvalidVolume);
            }
            let (entry, _) = BlockMapEntry::read_from_prefix(&data[entry_offset..])
                .map_err(|_| ParseError::InvalidVolume)?;
            if entry.num_blocks == 0 || entry.length == 0 {
                break;
            }
            bm_size += entry.num_blocks as usize * entry.length as usize;
            entry_offset += core::mem::size_of::<BlockMapEntry>();
        }

        if header.fv_length == 0 || bm_size == 0 {
            return Err(ParseError::InvalidVolume);
        }
        Ok((header.fv_length as usize, bm_size))
    }

    fn parse_volume_header(
        &mut self,
        volume: ByteSlice,
        parent: ItemId,
    ) -> Result<ItemId, ParseError> {
        if volume.is_empty() {
            return Err(ParseError::InvalidParameter);
        }
        if volume.len < VOLUME_HEADER_SIZE {
            self.msg(
                None,
                format!(
                    "parseVolumeHeader: input volume size {:X}h ({}) is smaller than volume header size 40h (64)",
                    volume.len, volume.len
                ),
            );
            return Err(ParseError::InvalidVolume);
        }

        let data = self.model.bytes(volume).to_vec();
        let (header, _) = FirmwareVolumeHeader::read_from_prefix(&data)
            .map_err(|_| ParseError::InvalidVolume)?;

        if (header.header_length as usize) < VOLUME_HEADER_SIZE
            || align8(header.header_length as usize) > volume.len
        {
            self.msg(None, "parseVolumeHeader: volume header overlaps the end of data");
            return Err(ParseError::InvalidVolume);
        }
        let ext_header_present = header.revision > 1 && header.ext_header_offset != 0;
        if ext_header_present
            && align8(header.ext_header_offset as usize + core::mem::size_of::<VolumeExtHeader>())
                > volume.len
        {
            self.msg(
                None,
                "parseVolumeHeader: extended volume header overlaps the end of data",
            );
            return Err(ParseError::InvalidVolume);
        }

        let mut extended_header_guid = None;
        let mut ext_header_size = 0usize;
        let mut header_size = header.header_length as usize;
        if ext_header_present {
            let (ext_header, _) =
                VolumeExtHeader::read_from_prefix(&data[header.ext_header_offset as usize..])
                    .map_err(|_| ParseError::InvalidVolume)?;
            header_size = header.ext_header_offset as usize + ext_header.ext_header_size as usize;
            ext_header_size = ext_header.ext_header_size as usize;
            extended_header_guid = Some(ext_header.fv_name);
        }
        header_size = align8(header_size);
        if header_size > volume.len {
            self.msg(
                None,
                "parseVolumeHeader: extended volume header overlaps the end of data",
            );
            return Err(ParseError::InvalidVolume);
        }

        // Filesystem identification.
        let fs_guid = header.file_system_guid;
        let mut ffs_version = 0u8;
        let mut subtype = VolumeSubtype::Unknown;
        if FFS_V2_VOLUMES.contains(&fs_guid) {
            ffs_version = 2;
            subtype = VolumeSubtype::Ffs2;
        }
        if FFS_V3_VOLUMES.contains(&fs_guid) {
            ffs_version = 3;
            subtype = VolumeSubtype::Ffs3;
        }
        if fs_guid == NVRAM_MAIN_STORE_VOLUME_GUID || fs_guid == ADDITIONAL_NVRAM_STORE_VOLUME_GUID
        {
            subtype = VolumeSubtype::Nvram;
        }
        let is_unknown = subtype == VolumeSubtype::Unknown || subtype == VolumeSubtype::Nvram;

        // Revision and alignment.
        let mut msg_alignment_bits_set = false;
        let mut msg_unaligned = false;
        let mut msg_unknown_revision = false;
        let mut alignment = 65536u32;
        if header.revision == 1 {
            // Revision 1 alignment bits are unreliable in the wild; only
            // complain when they are set without the capability bit.
            let alignment_cap = header.attributes & EFI_FVB_ALIGNMENT_CAP != 0;
            if !alignment_cap && header.attributes & 0xFFFF_0000 != 0 {
                msg_alignment_bits_set = true;
            }
        } else if header.revision == 2 {
            alignment = 1u32 << ((header.attributes & EFI_FVB2_ALIGNMENT) >> 16);
            if !is_unknown
                && !self.model.compressed(parent)
                && volume.buffer == IMAGE_BUFFER
                && volume.start.saturating_sub(self.capsule_offset_fixup) % alignment as usize != 0
            {
                msg_unaligned = true;
            }
        } else {
            msg_unknown_revision = true;
        }

        let empty_byte: u8 = if header.attributes & EFI_FVB_ERASE_POLARITY != 0 {
            0xFF
        } else {
            0x00
        };

        // Apple volumes put a body CRC32 and a used-space offset into the
        // ZeroVector.
        let stored_crc32 = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let used_space = u32::from_le_bytes(data[12..16].try_into().unwrap());
        let mut has_apple_crc32 = false;
        if stored_crc32 != 0 {
            let body_crc = crc32fast::hash(&data[header.header_length as usize..]);
            if body_crc == stored_crc32 {
                has_apple_crc32 = true;
            }
        }

        // Header checksum over HeaderLength bytes with the field zeroed.
        let mut temp_header = data[..header.header_length as usize].to_vec();
        temp_header[50] = 0;
        temp_header[51] = 0;
        let calculated = calculate_checksum16(&temp_header);
        let msg_invalid_checksum = header.checksum != calculated;
        let checksum_text = if msg_invalid_checksum {
            format!("invalid, should be {calculated:04X}h")
        } else {
            "valid".to_string()
        };

        let zv = &header.zero_vector;
        let mut info = format!(
            "ZeroVector:\n{:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X}\n{:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X}",
            zv[0], zv[1], zv[2], zv[3], zv[4], zv[5], zv[6], zv[7],
            zv[8], zv[9], zv[10], zv[11], zv[12], zv[13], zv[14], zv[15]
        );
        info.push_str(&format!(
            "\nFileSystem GUID: {}\n{}\nHeader size: {:X}h ({})\nBody size: {:X}h ({})\nRevision: {}\nAttributes: {:08X}h\nErase polarity: {}\nChecksum: {:04X}h, {}",
            fs_guid,
            full_size_info(volume.len),
            header_size, header_size,
            volume.len - header_size, volume.len - header_size,
            header.revision,
            header.attributes,
            if empty_byte == 0xFF { "1" } else { "0" },
            header.checksum,
            checksum_text
        ));
        if let Some(ext_guid) = extended_header_guid {
            info.push_str(&format!(
                "\nExtended header size: {:X}h ({})\nVolume GUID: {}",
                ext_header_size, ext_header_size, ext_guid
            ));
        }

        let name = extended_header_guid
            .map(|guid| guid.to_string())
            .unwrap_or_else(|| fs_guid.to_string());
        let text = if has_apple_crc32 { "AppleCRC32 " } else { "" };

        let index = self.model.add_item(
            parent,
            volume.start,
            ItemType::Volume,
            subtype as u8,
            name,
            text,
            info,
            volume.sub(0, header_size),
            volume.sub(header_size, volume.len - header_size),
            ByteSlice::EMPTY,
            true,
        )?;
        self.model.set_parsing_data(
            index,
            ParsingData::Volume(VolumeParsingData {
                empty_byte,
                ffs_version,
                alignment,
                revision: header.revision,
                extended_header_guid,
                has_apple_crc32,
                used_space,
                has_valid_used_space: false,
                is_weak_aligned: header.revision > 1
                    && header.attributes & EFI_FVB2_WEAK_ALIGNMENT != 0,
            }),
        );

        if is_unknown && subtype != VolumeSubtype::Nvram {
            self.msg(
                Some(index),
                format!("parseVolumeHeader: unknown file system {fs_guid}"),
            );
        }
        if msg_invalid_checksum {
            self.msg(Some(index), "parseVolumeHeader: volume header checksum is invalid");
        }
        if msg_alignment_bits_set {
            self.msg(
                Some(index),
                "parseVolumeHeader: alignment bits set on volume without alignment capability",
            );
        }
        if msg_unaligned {
            self.msg(Some(index), "parseVolumeHeader: unaligned volume");
        }
        if msg_unknown_revision {
            self.msg(Some(index), "parseVolumeHeader: unknown volume revision");
        }

        Ok(index)
    }

    fn parse_volume_body(&mut self, volume: ItemId) -> Result<(), ParseError> {
        let body = self.model.body(volume);
        let header_size = self.model.header(volume).len;

        let ParsingData::Volume(vdata) = self.model.parsing_data(volume).clone() else {
            return Err(ParseError::InvalidParameter);
        };
        if vdata.ffs_version != 2 && vdata.ffs_version != 3 {
            return Ok(());
        }

        let data = self.model.bytes(body).to_vec();
        let body_size = data.len();
        let mut file_offset = 0usize;
        let mut has_valid_used_space = vdata.has_valid_used_space;

        while file_offset < body_size {
            // Newer Apple images track the used space boundary; accept it
            // only when it lands exactly on a file boundary.
            if vdata.used_space != 0
                && !has_valid_used_space
                && vdata.used_space as usize == header_size + file_offset
            {
                has_valid_used_space = true;
                let mut updated = vdata.clone();
                updated.has_valid_used_space = true;
                self.model
                    .set_parsing_data(volume, ParsingData::Volume(updated));
                self.model.add_text(volume, "UsedSpace ");
            }

            let file_size = Self::get_file_size(&data, file_offset, vdata.ffs_version);

            if file_size < FILE_HEADER_SIZE || file_size > body_size - file_offset {
                let probe_end = (file_offset + FILE_HEADER_SIZE).min(body_size);
                let header_probe = &data[file_offset..probe_end];
                if header_probe.iter().all(|byte| *byte == vdata.empty_byte) {
                    let free_space = &data[file_offset..];
                    if free_space.iter().all(|byte| *byte == vdata.empty_byte) {
                        let info = full_size_info(free_space.len());
                        self.model.add_item(
                            volume,
                            body.start + file_offset,
                            ItemType::FreeSpace,
                            0,
                            "Volume free space",
                            "",
                            info,
                            ByteSlice::EMPTY,
                            body.sub(file_offset, free_space.len()),
                            ByteSlice::EMPTY,
                            false,
                        )?;
                    } else {
                        // Split into a free-space prefix, 8-byte aligned,
                        // and a non-UEFI data suffix.
                        let mut first_used = free_space
                            .iter()
                            .position(|byte| *byte != vdata.empty_byte)
                            .unwrap();
                        if first_used != align8(first_used) {
                            first_used = align8(first_used).saturating_sub(8);
                        }
                        if first_used > 0 {
                            let info = full_size_info(first_used);
                            self.model.add_item(
                                volume,
                                body.start + file_offset,
                                ItemType::FreeSpace,
                                0,
                                "Volume free space",
                                "",
                                info,
                                ByteSlice::EMPTY,
                                body.sub(file_offset, first_used),
                                ByteSlice::EMPTY,
                                false,
                            )?;
                        }
                        let rest = body.sub(
                            file_offset + first_used,
                            body_size - file_offset - first_used,
                        );
                        self.parse_volume_non_uefi_data(rest, volume)?;
                    }
                } else {
                    if file_size != 0 {
                        self.msg(
                            Some(volume),
                            format!(
                                "parseVolumeBody: file header parsing failed with error {}",
                                ParseError::InvalidFile
                            ),
                        );
                    }
                    let rest = body.sub(file_offset, body_size - file_offset);
                    self.parse_volume_non_uefi_data(rest, volume)?;
                }
                break;
            }

            let file_slice = body.sub(file_offset, file_size);
            if let Err(error) = self.parse_file_header(file_slice, volume, &vdata) {
                self.msg(
                    Some(volume),
                    format!("parseVolumeBody: file header parsing failed with error {error}"),
                );
            }

            file_offset = align8(file_offset + file_size);
        }

        // Duplicate GUIDs among non-pad files.
        let child_count = self.model.row_count(volume);
        for row in 0..child_count {
            let current = self.model.child(volume, row).unwrap();
            if self.model.item_type(current) != ItemType::File
                || self.model.subtype(current) == EFI_FV_FILETYPE_PAD
            {
                continue;
            }
            let ParsingData::File(current_data) = self.model.parsing_data(current) else {
                continue;
            };
            let current_guid = current_data.guid;
            let mut duplicates = Vec::new();
            for later_row in row + 1..child_count {
                let another = self.model.child(volume, later_row).unwrap();
                if self.model.item_type(another) != ItemType::File {
                    continue;
                }
                let ParsingData::File(another_data) = self.model.parsing_data(another) else {
                    continue;
                };
                if another_data.guid == current_guid {
                    duplicates.push(another);
                }
            }
            for another in duplicates {
                self.msg(
                    Some(another),
                    format!("parseVolumeBody: file with duplicate GUID {current_guid}"),
                );
            }
        }

        // Parse file bodies.
        for row in 0..self.model.row_count(volume) {
            let child = self.model.child(volume, row).unwrap();
            match self.model.item_type(child) {
                ItemType::File => {
                    let _ = self.parse_file_body(child);
                }
                ItemType::Padding | ItemType::FreeSpace => {}
                _ => return Err(ParseError::UnknownItemType),
            }
        }

        Ok(())
    }

    /// Non-UEFI bytes inside a volume become fixed data padding, then get
    /// re-scanned for nested volumes.
    fn parse_volume_non_uefi_data(
        &mut self,
        data_slice: ByteSlice,
        parent: ItemId,
    ) -> Result<(), ParseError> {
        let info = full_size_info(data_slice.len);
        let padding_index = self.model.add_item(
            parent,
            data_slice.start,
            ItemType::Padding,
            PaddingSubtype::Data as u8,
            "Non-UEFI data",
            "",
            info,
            ByteSlice::EMPTY,
            data_slice,
            ByteSlice::EMPTY,
            true,
        )?;
        self.msg(
            Some(padding_index),
            "parseVolumeNonUefiData: non-UEFI data found in volume's free space",
        );
        match self.parse_raw_area(padding_index) {
            Ok(()) | Err(ParseError::VolumesNotFound) | Err(ParseError::InvalidVolume) => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn get_file_size(data: &[u8], file_offset: usize, ffs_version: u8) -> usize {
        if ffs_version == 2 {
            if data.len() < file_offset + FILE_HEADER_SIZE {
                return 0;
            }
            let (header, _) = FfsFileHeader::read_from_prefix(&data[file_offset..]).unwrap();
            uint24_to_u32(&header.size) as usize
        } else if ffs_version == 3 {
            if data.len() < file_offset + FILE_HEADER2_SIZE {
                return 0;
            }
            let (header, _) = FfsFileHeader2::read_from_prefix(&data[file_offset..]).unwrap();
            if header.header.attributes & FFS_ATTRIB_LARGE_FILE != 0 {
                header.extended_size as usize
            } else {
                uint24_to_u32(&header.header.size) as usize
            }
        } else {
            0
        }
    }

    fn parse_file_header(
        &mut self,
        file: ByteSlice,
        volume: ItemId,
        vdata: &VolumeParsingData,
    ) -> Result<ItemId, ParseError> {
        if file.is_empty() {
            return Err(ParseError::InvalidParameter);
        }
        if file.len < FILE_HEADER_SIZE {
            return Err(ParseError::InvalidFile);
        }

        let data = self.model.bytes(file).to_vec();
        let (header, _) =
            FfsFileHeader::read_from_prefix(&data).map_err(|_| ParseError::InvalidFile)?;
        let large_file = vdata.ffs_version == 3 && header.attributes & FFS_ATTRIB_LARGE_FILE != 0;
        let header_size = if large_file {
            if file.len < FILE_HEADER2_SIZE {
                return Err(ParseError::InvalidFile);
            }
            FILE_HEADER2_SIZE
        } else {
            FILE_HEADER_SIZE
        };

        // Alignment relative to the volume start.
        let alignment_power =
            FFS_ALIGNMENT_TABLE[((header.attributes & FFS_ATTRIB_DATA_ALIGNMENT) >> 3) as usize];
        let alignment = 1u32 << alignment_power;
        let offset_in_volume = file.start - self.model.offset(volume);
        let msg_unaligned_file = (offset_in_volume + header_size) % alignment as usize != 0;
        let msg_file_alignment_exceeds_volume =
            !vdata.is_weak_aligned && vdata.alignment < alignment;

        // Header checksum over the header with both checksum bytes zeroed,
        // excluding the State byte.
        let mut temp_header = data[..header_size].to_vec();
        temp_header[16] = 0;
        temp_header[17] = 0;
        let calculated_header = calculate_checksum8(&temp_header[..header_size - 1]);
        let msg_invalid_header_checksum = header.header_checksum != calculated_header;
        let header_checksum_text = if msg_invalid_header_checksum {
            format!("invalid, should be {calculated_header:02X}")
        } else {
            "valid".to_string()
        };

        let has_tail =
            vdata.revision == 1 && header.attributes & FFS_ATTRIB_TAIL_PRESENT != 0;
        let tail_size = if has_tail { 2usize } else { 0 };
        if file.len < header_size + tail_size {
            return Err(ParseError::InvalidFile);
        }

        // Data checksum, or its fixed stand-in value.
        let mut msg_invalid_data_checksum = false;
        let data_checksum_text;
        if header.attributes & FFS_ATTRIB_CHECKSUM != 0 {
            let checksum_span = &data[header_size..data.len() - tail_size];
            let calculated_data = calculate_checksum8(checksum_span);
            msg_invalid_data_checksum = header.data_checksum != calculated_data;
            data_checksum_text = if msg_invalid_data_checksum {
                format!("invalid, should be {calculated_data:02X}")
            } else {
                "valid".to_string()
            };
        } else {
            let expected = if vdata.revision == 1 {
                FFS_FIXED_CHECKSUM
            } else {
                FFS_FIXED_CHECKSUM2
            };
            if header.data_checksum != expected {
                msg_invalid_data_checksum = true;
            }
            data_checksum_text = if msg_invalid_data_checksum {
                format!("invalid, should be {expected:02X}")
            } else {
                "valid".to_string()
            };
        }

        let msg_unknown_type = header.file_type > EFI_FV_FILETYPE_MM_CORE_STANDALONE
            && header.file_type != EFI_FV_FILETYPE_PAD;

        // Tail bytes must be the bitwise inverse of the checksum pair.
        let mut msg_invalid_tail_value = false;
        let mut tail = 0u16;
        if has_tail {
            tail = u16::from_le_bytes(
                data[data.len() - 2..].try_into().unwrap(),
            );
            let tail_reference =
                u16::from_le_bytes([header.header_checksum, header.data_checksum]);
            if tail_reference != !tail {
                msg_invalid_tail_value = true;
            }
        }

        let body_size = file.len - header_size - tail_size;
        let guid = header.name;
        let name = if header.file_type == EFI_FV_FILETYPE_PAD {
            "Pad-file".to_string()
        } else {
            guid.to_string()
        };
        let is_vtf = guid == EFI_FFS_VOLUME_TOP_FILE_GUID;
        let text = known_file_name(&guid).unwrap_or("");

        let mut info = format!(
            "File GUID: {}\nType: {:02X}h\nAttributes: {:02X}h\n{}\nHeader size: {:X}h ({})\nBody size: {:X}h ({})",
            guid,
            header.file_type,
            header.attributes,
            full_size_info(file.len),
            header_size, header_size,
            body_size, body_size
        );
        info.push_str(&format!(
            "\nState: {:02X}h\nHeader checksum: {:02X}h, {}\nData checksum: {:02X}h, {}",
            header.state, header.header_checksum, header_checksum_text, header.data_checksum,
            data_checksum_text
        ));

        let fixed = header.attributes & FFS_ATTRIB_FIXED != 0;
        let tail_slice = if has_tail {
            file.sub(file.len - 2, 2)
        } else {
            ByteSlice::EMPTY
        };
        let index = self.model.add_item(
            volume,
            file.start,
            ItemType::File,
            header.file_type,
            name,
            text,
            info,
            file.sub(0, header_size),
            file.sub(header_size, body_size),
            tail_slice,
            fixed,
        )?;
        self.model.set_parsing_data(
            index,
            ParsingData::File(FileParsingData {
                guid,
                empty_byte: vdata.empty_byte,
                has_tail,
                tail,
            }),
        );

        // The last byte of the last VTF maps to physical 0xFFFFFFFF; the
        // second pass keys on it.
        if is_vtf {
            self.last_vtf = Some(index);
        }
        if guid == EFI_DXE_CORE_GUID && self.bg_dxe_core.is_none() {
            self.bg_dxe_core = Some(index);
        }

        if msg_unaligned_file {
            self.msg(Some(index), "parseFileHeader: unaligned file");
        }
        if msg_file_alignment_exceeds_volume {
            self.msg(
                Some(index),
                format!(
                    "parseFileHeader: file alignment {:X}h is greater than parent volume alignment {:X}h",
                    alignment, vdata.alignment
                ),
            );
        }
        if msg_invalid_header_checksum {
            self.msg(Some(index), "parseFileHeader: invalid header checksum");
        }
        if msg_invalid_data_checksum {
            self.msg(Some(index), "parseFileHeader: invalid data checksum");
        }
        if msg_invalid_tail_value {
            self.msg(Some(index), "parseFileHeader: invalid tail value");
        }
        if msg_unknown_type {
            self.msg(
                Some(index),
                format!("parseFileHeader: unknown file type {:02X}h", header.file_type),
            );
        }

        Ok(index)
    }

    fn parse_file_body(&mut self, file: ItemId) -> Result<(), ParseError> {
        if self.model.item_type(file) != ItemType::File {
            return Ok(());
        }

        let file_type = self.model.subtype(file);
        if file_type == EFI_FV_FILETYPE_PAD {
            return self.parse_pad_file_body(file);
        }

        if file_type == EFI_FV_FILETYPE_RAW || file_type == EFI_FV_FILETYPE_ALL {
            let ParsingData::File(fdata) = self.model.parsing_data(file) else {
                return Err(ParseError::InvalidParameter);
            };
            let guid = fdata.guid;
            // Store and vendor-hash files hang off well-known GUIDs and are
            // handled by their own collaborators; the protected-range data
            // is collected for the second pass.
            if guid == NVAR_STORE_FILE_GUID {
                return Ok(());
            }
            if guid == VENDOR_HASH_FILE_GUID_PHOENIX {
                self.vendor_hash_files.push((VendorHashKind::Phoenix, file));
                return Ok(());
            }
            if guid == VENDOR_HASH_FILE_GUID_AMI {
                self.vendor_hash_files.push((VendorHashKind::Ami, file));
                return Ok(());
            }
            match self.parse_raw_area(file) {
                Ok(()) | Err(ParseError::VolumesNotFound) | Err(ParseError::InvalidVolume) => {
                    return Ok(())
                }
                Err(error) => return Err(error),
            }
        }

        let body = self.model.body(file);
        self.parse_sections(body, file, false)
    }

    fn parse_pad_file_body(&mut self, file: ItemId) -> Result<(), ParseError> {
        let ParsingData::File(fdata) = self.model.parsing_data(file) else {
            return Err(ParseError::InvalidParameter);
        };
        let empty_byte = fdata.empty_byte;
        let body = self.model.body(file);
        let data = self.model.bytes(body).to_vec();

        if data.iter().all(|byte| *byte == empty_byte) {
            return Ok(());
        }

        let mut first_used = data.iter().position(|byte| *byte != empty_byte).unwrap();
        if first_used >= 8 {
            if first_used != align8(first_used) {
                first_used = align8(first_used) - 8;
            }
            let info = full_size_info(first_used);
            self.model.add_item(
                file,
                body.start,
                ItemType::FreeSpace,
                0,
                "Free space",
                "",
                info,
                ByteSlice::EMPTY,
                body.sub(0, first_used),
                ByteSlice::EMPTY,
                false,
            )?;
        } else {
            first_used = 0;
        }

        let info = full_size_info(data.len() - first_used);
        let data_index = self.model.add_item(
            file,
            body.start + first_used,
            ItemType::Padding,
            PaddingSubtype::Data as u8,
            "Non-UEFI data",
            "",
            info,
            ByteSlice::EMPTY,
            body.sub(first_used, data.len() - first_used),
            ByteSlice::EMPTY,
            true,
        )?;
        self.msg(
            Some(data_index),
            "parsePadFileBody: non-UEFI data found in pad-file",
        );
        self.model.set_name(file, "Non-empty pad-file");

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use zerocopy::IntoBytes;

    /// Build a minimal FFSv2 volume header + one block map entry pair.
    pub(crate) fn build_volume(
        body: &[u8],
        block_length: u32,
        erase_polarity_one: bool,
    ) -> Vec<u8> {
        let total_header = VOLUME_HEADER_SIZE + 2 * core::mem::size_of::<BlockMapEntry>();
        let fv_length = (total_header + body.len()) as u64;
        let mut header = FirmwareVolumeHeader {
            zero_vector: [0u8; 16],
            file_system_guid: crate::ffs::EFI_FIRMWARE_FILE_SYSTEM2_GUID,
            fv_length,
            signature: FVH_SIGNATURE,
            attributes: if erase_polarity_one { EFI_FVB_ERASE_POLARITY } else { 0 },
            header_length: total_header as u16,
            checksum: 0,
            ext_header_offset: 0,
            reserved: 0,
            revision: 2,
        };
        let num_blocks = (fv_length as u32).div_ceil(block_length);
        // The block map must cover FvLength exactly for the size cross
        // check to stay quiet.
        let map = [
            BlockMapEntry {
                num_blocks,
                length: block_length,
            },
            BlockMapEntry {
                num_blocks: 0,
                length: 0,
            },
        ];

        let mut raw = Vec::new();
        raw.extend_from_slice(header.as_bytes());
        for entry in &map {
            raw.extend_from_slice(entry.as_bytes());
        }
        let checksum = calculate_checksum16(&raw[..total_header]);
        header.checksum = checksum;
        raw.clear();
        raw.extend_from_slice(header.as_bytes());
        for entry in &map {
            raw.extend_from_slice(entry.as_bytes());
        }
        raw.extend_from_slice(body);
        raw
    }

    /// Build an FFSv2 file with a valid header checksum and fixed data
    /// checksum placeholder.
    pub(crate) fn build_file(guid: crate::guid::Guid, file_type: u8, body: &[u8]) -> Vec<u8> {
        let size = FILE_HEADER_SIZE + body.len();
        let mut header = FfsFileHeader {
            name: guid,
            header_checksum: 0,
            data_checksum: FFS_FIXED_CHECKSUM2,
            file_type,
            attributes: 0,
            size: crate::ffs::u32_to_uint24(size as u32),
            state: 0xF8,
        };
        let mut temp = header;
        temp.header_checksum = 0;
        temp.data_checksum = 0;
        header.header_checksum = calculate_checksum8(&temp.as_bytes()[..FILE_HEADER_SIZE - 1]);

        let mut raw = Vec::new();
        raw.extend_from_slice(header.as_bytes());
        raw.extend_from_slice(body);
        raw
    }
}
