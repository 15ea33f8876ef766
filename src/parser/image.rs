//! First-pass entry: capsule peel, Intel flash descriptor, region dispatch.

use zerocopy::FromBytes;

use crate::descriptor::{
    ComponentSection, DescriptorMap, FlashMasterV1, FlashMasterV2, FlashRegion, Frequency,
    RegionSection, UpperMap, VsccTableEntry, FLASH_DESCRIPTOR_MAX_BASE,
    FLASH_DESCRIPTOR_SIGNATURE, FLASH_DESCRIPTOR_SIZE, FLASH_DESCRIPTOR_UPPER_MAP_BASE,
    REGION_ACCESS_BIOS, REGION_ACCESS_DESC, REGION_ACCESS_EC, REGION_ACCESS_GBE, REGION_ACCESS_ME,
    REGION_ACCESS_PDR,
};
use crate::ffs::{
    AptioCapsuleHeader, CapsuleHeader, ToshibaCapsuleHeader, APTIO_SIGNED_CAPSULE_GUID,
    APTIO_UNSIGNED_CAPSULE_GUID, EFI_CAPSULE_GUID, INTEL_CAPSULE_GUID, LENOVO2_CAPSULE_GUID,
    LENOVO_CAPSULE_GUID, TOSHIBA_CAPSULE_GUID,
};
use crate::guid::Guid;
use crate::parser::{full_size_info, FfsParser};
use crate::tree::{
    ByteSlice, CapsuleSubtype, ImageSubtype, ItemId, ItemType, RegionSubtype, IMAGE_BUFFER,
};
use crate::ver::{MeVersion, ME_VERSION_SIGNATURE, ME_VERSION_SIGNATURE2};
use crate::{ParseError, MIN_IMAGE_SIZE};

/// GbE region version record location.
const GBE_VERSION_OFFSET: usize = 0x0A;

struct RegionInfo {
    offset: usize,
    length: usize,
    subtype: RegionSubtype,
}

impl<'a> FfsParser<'a> {
    pub(crate) fn perform_first_pass(&mut self) -> Result<(), ParseError> {
        self.capsule_offset_fixup = 0;

        let image_len = self.image.len();
        if image_len <= MIN_IMAGE_SIZE {
            self.msg(
                None,
                "performFirstPass: image file is smaller than minimum size of 1Ch (28) bytes",
            );
            return Err(ParseError::InvalidParameter);
        }

        let mut capsule_index = None;
        let mut capsule_header_size = 0usize;
        let leading_guid = Guid::read(self.image);

        if let Some(guid) = leading_guid {
            if guid == EFI_CAPSULE_GUID
                || guid == INTEL_CAPSULE_GUID
                || guid == LENOVO_CAPSULE_GUID
                || guid == LENOVO2_CAPSULE_GUID
            {
                let (header, _) = CapsuleHeader::read_from_prefix(self.image)
                    .map_err(|_| ParseError::InvalidCapsule)?;
                let header_size = header.header_size as usize;
                if header_size == 0
                    || header_size > image_len
                    || header.header_size > header.capsule_image_size
                {
                    self.msg(
                        None,
                        format!(
                            "performFirstPass: UEFI capsule header size of {:X}h ({}) bytes is invalid",
                            header.header_size, header.header_size
                        ),
                    );
                    return Err(ParseError::InvalidCapsule);
                }
                if header.capsule_image_size == 0 || header.capsule_image_size as usize > image_len
                {
                    self.msg(
                        None,
                        format!(
                            "performFirstPass: UEFI capsule image size of {:X}h ({}) bytes is invalid",
                            header.capsule_image_size, header.capsule_image_size
                        ),
                    );
                    return Err(ParseError::InvalidCapsule);
                }

                capsule_header_size = header_size;
                let image_size = header.capsule_image_size as usize - header_size;
                let info = format!(
                    "Capsule GUID: {}\n{}\nHeader size: {:X}h ({})\nImage size: {:X}h ({})\nFlags: {:08X}h",
                    header.capsule_guid,
                    full_size_info(image_len),
                    header_size, header_size,
                    image_size, image_size,
                    header.flags
                );
                self.capsule_offset_fixup = capsule_header_size;
                let index = self.model.add_item(
                    self.model.root(),
                    0,
                    ItemType::Capsule,
                    CapsuleSubtype::Uefi as u8,
                    "UEFI capsule",
                    "",
                    info,
                    ByteSlice::new(IMAGE_BUFFER, 0, header_size),
                    ByteSlice::new(IMAGE_BUFFER, header_size, image_len - header_size),
                    ByteSlice::EMPTY,
                    true,
                )?;
                capsule_index = Some(index);
            } else if guid == TOSHIBA_CAPSULE_GUID {
                let (header, _) = ToshibaCapsuleHeader::read_from_prefix(self.image)
                    .map_err(|_| ParseError::InvalidCapsule)?;
                let header_size = header.header_size as usize;
                if header_size == 0 || header_size > image_len || header.header_size > header.full_size
                {
                    self.msg(
                        None,
                        format!(
                            "performFirstPass: Toshiba capsule header size of {:X}h ({}) bytes is invalid",
                            header.header_size, header.header_size
                        ),
                    );
                    return Err(ParseError::InvalidCapsule);
                }
                if header.full_size == 0 || header.full_size as usize > image_len {
                    self.msg(
                        None,
                        format!(
                            "performFirstPass: Toshiba capsule full size of {:X}h ({}) bytes is invalid",
                            header.full_size, header.full_size
                        ),
                    );
                    return Err(ParseError::InvalidCapsule);
                }

                capsule_header_size = header_size;
                let image_size = header.full_size as usize - header_size;
                let info = format!(
                    "Capsule GUID: {}\n{}\nHeader size: {:X}h ({})\nImage size: {:X}h ({})\nFlags: {:08X}h",
                    header.capsule_guid,
                    full_size_info(image_len),
                    header_size, header_size,
                    image_size, image_size,
                    header.flags
                );
                self.capsule_offset_fixup = capsule_header_size;
                let index = self.model.add_item(
                    self.model.root(),
                    0,
                    ItemType::Capsule,
                    CapsuleSubtype::Toshiba as u8,
                    "Toshiba capsule",
                    "",
                    info,
                    ByteSlice::new(IMAGE_BUFFER, 0, header_size),
                    ByteSlice::new(IMAGE_BUFFER, header_size, image_len - header_size),
                    ByteSlice::EMPTY,
                    true,
                )?;
                capsule_index = Some(index);
            } else if guid == APTIO_SIGNED_CAPSULE_GUID || guid == APTIO_UNSIGNED_CAPSULE_GUID {
                let signed = guid == APTIO_SIGNED_CAPSULE_GUID;
                if image_len <= core::mem::size_of::<AptioCapsuleHeader>() {
                    self.msg(
                        None,
                        "performFirstPass: AMI capsule image file is smaller than minimum size of 20h (32) bytes",
                    );
                    return Err(ParseError::InvalidParameter);
                }
                let (header, _) = AptioCapsuleHeader::read_from_prefix(self.image)
                    .map_err(|_| ParseError::InvalidCapsule)?;
                let rom_offset = header.rom_image_offset as usize;
                if rom_offset == 0
                    || rom_offset > image_len
                    || header.rom_image_offset as u32 > header.capsule_header.capsule_image_size
                {
                    self.msg(
                        None,
                        format!(
                            "performFirstPass: AMI capsule image offset of {:X}h ({}) bytes is invalid",
                            rom_offset, rom_offset
                        ),
                    );
                    return Err(ParseError::InvalidCapsule);
                }
                if header.capsule_header.capsule_image_size == 0
                    || header.capsule_header.capsule_image_size as usize > image_len
                {
                    self.msg(
                        None,
                        format!(
                            "performFirstPass: AMI capsule image size of {:X}h ({}) bytes is invalid",
                            header.capsule_header.capsule_image_size,
                            header.capsule_header.capsule_image_size
                        ),
                    );
                    return Err(ParseError::InvalidCapsule);
                }

                capsule_header_size = rom_offset;
                let image_size =
                    header.capsule_header.capsule_image_size as usize - capsule_header_size;
                let info = format!(
                    "Capsule GUID: {}\n{}\nHeader size: {:X}h ({})\nImage size: {:X}h ({})\nFlags: {:08X}h",
                    header.capsule_header.capsule_guid,
                    full_size_info(image_len),
                    capsule_header_size, capsule_header_size,
                    image_size, image_size,
                    header.capsule_header.flags
                );
                self.capsule_offset_fixup = capsule_header_size;
                let subtype = if signed {
                    CapsuleSubtype::AptioSigned
                } else {
                    CapsuleSubtype::AptioUnsigned
                };
                let index = self.model.add_item(
                    self.model.root(),
                    0,
                    ItemType::Capsule,
                    subtype as u8,
                    "AMI Aptio capsule",
                    "",
                    info,
                    ByteSlice::new(IMAGE_BUFFER, 0, capsule_header_size),
                    ByteSlice::new(
                        IMAGE_BUFFER,
                        capsule_header_size,
                        image_len - capsule_header_size,
                    ),
                    ByteSlice::EMPTY,
                    true,
                )?;
                capsule_index = Some(index);
                if signed {
                    self.msg(
                        Some(index),
                        "performFirstPass: Aptio capsule signature may become invalid after image modifications",
                    );
                }
            }
        }

        // Flash chip image behind the capsule header, if any.
        let flash = ByteSlice::new(
            IMAGE_BUFFER,
            capsule_header_size,
            image_len - capsule_header_size,
        );
        let parent = capsule_index.unwrap_or(self.model.root());

        // Intel descriptor probe: the signature sits behind a 16-byte vector.
        let flash_bytes = &self.image[flash.start..flash.start + flash.len];
        if flash_bytes.len() >= 20 {
            let signature = u32::from_le_bytes(flash_bytes[16..20].try_into().unwrap());
            if signature == FLASH_DESCRIPTOR_SIGNATURE {
                let result = self.parse_intel_image(flash, parent);
                if result != Err(ParseError::InvalidFlashDescriptor) {
                    return result;
                }
            }
        }

        let info = full_size_info(flash.len);
        let bios_index = self.model.add_item(
            parent,
            flash.start,
            ItemType::Image,
            ImageSubtype::Uefi as u8,
            "UEFI image",
            "",
            info,
            ByteSlice::EMPTY,
            flash,
            ByteSlice::EMPTY,
            true,
        )?;

        match self.parse_raw_area(bios_index) {
            Err(ParseError::VolumesNotFound) => {
                self.msg(
                    Some(bios_index),
                    "performFirstPass: no firmware volumes found in UEFI image",
                );
                Ok(())
            }
            other => other,
        }
    }

    fn parse_intel_image(&mut self, flash: ByteSlice, parent: ItemId) -> Result<(), ParseError> {
        if flash.len == 0 {
            return Err(ParseError::InvalidParameter);
        }
        if flash.len < FLASH_DESCRIPTOR_SIZE {
            self.msg(
                None,
                "parseIntelImage: input file is smaller than minimum descriptor size of 1000h (4096) bytes",
            );
            return Err(ParseError::InvalidFlashDescriptor);
        }

        let data = &self.image[flash.start..flash.start + flash.len];
        let (map, _) = DescriptorMap::read_from_prefix(&data[20..])
            .map_err(|_| ParseError::InvalidFlashDescriptor)?;

        let master_base = map.flmap1.master_base();
        let region_base = map.flmap0.region_base();
        let component_base = map.flmap0.component_base();
        if master_base > FLASH_DESCRIPTOR_MAX_BASE
            || master_base == region_base
            || master_base == component_base
        {
            self.msg(
                None,
                format!("parseIntelImage: invalid descriptor master base {master_base:02X}h"),
            );
            return Err(ParseError::InvalidFlashDescriptor);
        }
        if region_base > FLASH_DESCRIPTOR_MAX_BASE || region_base == component_base {
            self.msg(
                None,
                format!("parseIntelImage: invalid descriptor region base {region_base:02X}h"),
            );
            return Err(ParseError::InvalidFlashDescriptor);
        }
        if component_base > FLASH_DESCRIPTOR_MAX_BASE {
            self.msg(
                None,
                format!("parseIntelImage: invalid descriptor component base {component_base:02X}h"),
            );
            return Err(ParseError::InvalidFlashDescriptor);
        }

        let (regions_section, _) = RegionSection::read_from_prefix(&data[map.flmap0.region_offset()..])
            .map_err(|_| ParseError::InvalidFlashDescriptor)?;
        let (components, _) = ComponentSection::read_from_prefix(&data[map.flmap0.component_offset()..])
            .map_err(|_| ParseError::InvalidFlashDescriptor)?;

        // Version probe via the hard-coded read clock frequency: 20 MHz
        // before Skylake, 17 MHz from Skylake on.
        let descriptor_version = match components.FLCOMP.read_clock_frequency() {
            Frequency::M20 => 1,
            Frequency::M17 => 2,
            other => {
                self.msg(
                    None,
                    format!(
                        "parseIntelImage: unknown descriptor version with ReadClockFrequency {other:?}"
                    ),
                );
                return Err(ParseError::InvalidFlashDescriptor);
            }
        };

        let mut regions: Vec<RegionInfo> = Vec::new();

        let mut me_region: Option<(usize, usize)> = None;
        if regions_section.me.is_present() {
            let info = RegionInfo {
                offset: regions_section.me.region_offset(),
                length: regions_section.me.region_size(),
                subtype: RegionSubtype::Me,
            };
            me_region = Some((info.offset, info.length));
            regions.push(info);
        }

        if regions_section.bios.is_present() {
            let mut offset = regions_section.bios.region_offset();
            let mut length = regions_section.bios.region_size();
            // Gigabyte-specific map: BIOS region claims the whole chip.
            if length == flash.len {
                let Some((me_offset, me_length)) = me_region else {
                    self.msg(
                        None,
                        "parseIntelImage: can't determine BIOS region start from Gigabyte-specific descriptor",
                    );
                    return Err(ParseError::InvalidFlashDescriptor);
                };
                offset = me_offset + me_length;
                length = flash.len - offset;
            }
            regions.push(RegionInfo {
                offset,
                length,
                subtype: RegionSubtype::Bios,
            });
        } else {
            self.msg(
                None,
                "parseIntelImage: descriptor parsing failed, BIOS region not found in descriptor",
            );
            return Err(ParseError::InvalidFlashDescriptor);
        }

        let push_simple = |target: &mut Vec<RegionInfo>, flreg: FlashRegion, subtype| {
            if flreg.is_present() {
                target.push(RegionInfo {
                    offset: flreg.region_offset(),
                    length: flreg.region_size(),
                    subtype,
                });
            }
        };
        push_simple(&mut regions, regions_section.gbe, RegionSubtype::Gbe);
        push_simple(&mut regions, regions_section.pdr, RegionSubtype::Pdr);

        // All-ones FLREGs also mean "unused" for the reserved pair.
        let reserved_present = |flreg: FlashRegion| {
            flreg.is_present() && !(flreg.base() == 0x1FFF && flreg.limit() == 0x1FFF)
        };
        if reserved_present(regions_section.reserved1) {
            push_simple(
                &mut regions,
                regions_section.reserved1,
                RegionSubtype::Reserved1,
            );
        }
        if reserved_present(regions_section.reserved2) {
            push_simple(
                &mut regions,
                regions_section.reserved2,
                RegionSubtype::Reserved2,
            );
        }

        if descriptor_version == 2 {
            push_simple(
                &mut regions,
                regions_section.reserved3,
                RegionSubtype::Reserved3,
            );
            push_simple(&mut regions, regions_section.ec, RegionSubtype::Ec);
            push_simple(
                &mut regions,
                regions_section.reserved4,
                RegionSubtype::Reserved4,
            );
        }

        regions.sort_by_key(|region| region.offset);

        // Descriptor overlap, gaps, and truncation checks.
        if regions[0].offset < FLASH_DESCRIPTOR_SIZE {
            self.msg(
                None,
                format!(
                    "parseIntelImage: {} region has intersection with flash descriptor",
                    regions[0].subtype.as_str()
                ),
            );
            return Err(ParseError::InvalidFlashDescriptor);
        }

        let mut laid_out: Vec<(usize, usize, Option<RegionSubtype>)> = Vec::new();
        if regions[0].offset > FLASH_DESCRIPTOR_SIZE {
            laid_out.push((
                FLASH_DESCRIPTOR_SIZE,
                regions[0].offset - FLASH_DESCRIPTOR_SIZE,
                None,
            ));
        }
        for (index, region) in regions.iter().enumerate() {
            if region.offset + region.length > flash.len {
                self.msg(
                    None,
                    format!(
                        "parseIntelImage: {} region is located outside of opened image, if your system uses dual-chip storage, please append another part to the opened image",
                        region.subtype.as_str()
                    ),
                );
                return Err(ParseError::TruncatedImage);
            }
            if index > 0 {
                let previous_end = regions[index - 1].offset + regions[index - 1].length;
                if region.offset < previous_end {
                    self.msg(
                        None,
                        format!(
                            "parseIntelImage: {} region has intersection with {} region",
                            region.subtype.as_str(),
                            regions[index - 1].subtype.as_str()
                        ),
                    );
                    return Err(ParseError::InvalidFlashDescriptor);
                }
                if region.offset > previous_end {
                    laid_out.push((previous_end, region.offset - previous_end, None));
                }
            }
            laid_out.push((region.offset, region.length, Some(region.subtype)));
        }
        let last_end = regions.last().map(|r| r.offset + r.length).unwrap();
        if last_end < flash.len {
            laid_out.push((last_end, flash.len - last_end, None));
        }

        // Region map is consistent; build the Intel image item.
        let info = format!(
            "{}\nFlash chips: {}\nRegions: {}\nMasters: {}\nPCH straps: {}\nPROC straps: {}",
            full_size_info(flash.len),
            map.flmap0.number_of_flash_chips(),
            map.flmap0.number_of_regions(),
            map.flmap1.number_of_masters(),
            map.flmap1.number_of_pch_straps(),
            map.flmap2.number_of_proc_straps()
        );
        let image_index = self.model.add_item(
            parent,
            flash.start,
            ItemType::Image,
            ImageSubtype::Intel as u8,
            "Intel image",
            "",
            info,
            ByteSlice::EMPTY,
            flash,
            ByteSlice::EMPTY,
            true,
        )?;

        // Descriptor region info: actual region offsets, access table, VSCC.
        let mut descriptor_info = String::from("Full size: 1000h (4096)");
        for region in &regions {
            descriptor_info.push_str(&format!(
                "\n{} region offset: {:X}h",
                region.subtype.as_str(),
                region.offset + flash.start
            ));
        }

        descriptor_info.push_str("\nRegion access settings:");
        let master_offset = map.flmap1.master_offset();
        if descriptor_version == 1 {
            let bios = FlashMasterV1::from_bits(read_u32(data, master_offset));
            let me = FlashMasterV1::from_bits(read_u32(data, master_offset + 4));
            let gbe = FlashMasterV1::from_bits(read_u32(data, master_offset + 8));
            descriptor_info.push_str(&format!(
                "\nBIOS: {:02X}h {:02X}h ME: {:02X}h {:02X}h\nGbE:  {:02X}h {:02X}h",
                bios.read_access(),
                bios.write_access(),
                me.read_access(),
                me.write_access(),
                gbe.read_access(),
                gbe.write_access()
            ));
            descriptor_info.push_str("\nBIOS access table:");
            descriptor_info.push_str("\n      Read  Write");
            let row = |bit| {
                format!(
                    "{}  {}",
                    if bios.can_read(bit) { "Yes " } else { "No  " },
                    if bios.can_write(bit) { "Yes " } else { "No  " }
                )
            };
            descriptor_info.push_str(&format!("\nDesc  {}", row(REGION_ACCESS_DESC)));
            descriptor_info.push_str("\nBIOS  Yes   Yes");
            descriptor_info.push_str(&format!("\nME    {}", row(REGION_ACCESS_ME)));
            descriptor_info.push_str(&format!("\nGbE   {}", row(REGION_ACCESS_GBE)));
            descriptor_info.push_str(&format!("\nPDR   {}", row(REGION_ACCESS_PDR)));
        } else {
            let bios = FlashMasterV2::from_bits(read_u32(data, master_offset));
            let me = FlashMasterV2::from_bits(read_u32(data, master_offset + 4));
            let gbe = FlashMasterV2::from_bits(read_u32(data, master_offset + 8));
            let ec = FlashMasterV2::from_bits(read_u32(data, master_offset + 16));
            descriptor_info.push_str(&format!(
                "\nBIOS: {:03X}h {:03X}h ME: {:03X}h {:03X}h\nGbE:  {:03X}h {:03X}h EC: {:03X}h {:03X}h",
                bios.read_access(),
                bios.write_access(),
                me.read_access(),
                me.write_access(),
                gbe.read_access(),
                gbe.write_access(),
                ec.read_access(),
                ec.write_access()
            ));
            descriptor_info.push_str("\nBIOS access table:");
            descriptor_info.push_str("\n      Read  Write");
            let row = |bit| {
                format!(
                    "{}  {}",
                    if bios.can_read(bit) { "Yes " } else { "No  " },
                    if bios.can_write(bit) { "Yes " } else { "No  " }
                )
            };
            descriptor_info.push_str(&format!("\nDesc  {}", row(REGION_ACCESS_DESC)));
            descriptor_info.push_str("\nBIOS  Yes   Yes");
            descriptor_info.push_str(&format!("\nME    {}", row(REGION_ACCESS_ME)));
            descriptor_info.push_str(&format!("\nGbE   {}", row(REGION_ACCESS_GBE)));
            descriptor_info.push_str(&format!("\nPDR   {}", row(REGION_ACCESS_PDR)));
            descriptor_info.push_str(&format!("\nEC    {}", row(REGION_ACCESS_EC)));
        }

        if let Ok((upper_map, _)) =
            UpperMap::read_from_prefix(&data[FLASH_DESCRIPTOR_UPPER_MAP_BASE..])
        {
            descriptor_info.push_str("\nFlash chips in VSCC table:");
            let mut entry_offset = upper_map.vscc_table_offset();
            for _ in 0..upper_map.vscc_table_entries() {
                let Ok((entry, _)) = VsccTableEntry::read_from_prefix(&data[entry_offset..]) else {
                    break;
                };
                descriptor_info.push_str(&format!(
                    "\n{:02X}{:02X}{:02X}h",
                    entry.vendor_id, entry.device_id0, entry.device_id1
                ));
                entry_offset += core::mem::size_of::<VsccTableEntry>();
            }
        }

        self.model.add_item(
            image_index,
            flash.start,
            ItemType::Region,
            RegionSubtype::Descriptor as u8,
            "Descriptor region",
            "",
            descriptor_info,
            ByteSlice::EMPTY,
            flash.sub(0, FLASH_DESCRIPTOR_SIZE),
            ByteSlice::EMPTY,
            true,
        )?;

        // Parse remaining regions in offset order; remember the first
        // failure but keep going.
        let mut parse_result = Ok(());
        for (offset, length, subtype) in laid_out {
            let slice = flash.sub(offset, length);
            let result = match subtype {
                Some(RegionSubtype::Bios) => self.parse_bios_region(slice, image_index),
                Some(RegionSubtype::Me) => self.parse_me_region(slice, image_index),
                Some(RegionSubtype::Gbe) => self.parse_gbe_region(slice, image_index),
                Some(RegionSubtype::Pdr) => self.parse_pdr_region(slice, image_index),
                Some(other) => self.parse_general_region(slice, other, image_index),
                None => {
                    let padding = &self.image[slice.start..slice.start + slice.len];
                    let subtype = Self::padding_subtype(padding);
                    let info = full_size_info(length);
                    self.model
                        .add_item(
                            image_index,
                            slice.start,
                            ItemType::Padding,
                            subtype as u8,
                            "Padding",
                            "",
                            info,
                            ByteSlice::EMPTY,
                            slice,
                            ByteSlice::EMPTY,
                            true,
                        )
                        .map(|_| ())
                }
            };
            if parse_result.is_ok() {
                if let Err(error) = result {
                    parse_result = Err(error);
                }
            }
        }

        parse_result
    }

    fn parse_bios_region(&mut self, region: ByteSlice, parent: ItemId) -> Result<(), ParseError> {
        if region.is_empty() {
            return Err(ParseError::EmptyRegion);
        }
        let info = full_size_info(region.len);
        let index = self.model.add_item(
            parent,
            region.start,
            ItemType::Region,
            RegionSubtype::Bios as u8,
            "BIOS region",
            "",
            info,
            ByteSlice::EMPTY,
            region,
            ByteSlice::EMPTY,
            true,
        )?;
        self.parse_raw_area(index)
    }

    fn parse_me_region(&mut self, region: ByteSlice, parent: ItemId) -> Result<(), ParseError> {
        if region.is_empty() {
            return Err(ParseError::EmptyRegion);
        }

        let data = &self.image[region.start..region.start + region.len];
        let mut info = full_size_info(region.len);

        let mut empty_region = false;
        let mut version_found = true;
        let mut version_info = None;
        if data.iter().all(|byte| *byte == 0xFF) || data.iter().all(|byte| *byte == 0x00) {
            empty_region = true;
            info.push_str("\nState: empty");
        } else {
            let version_offset = find_signature(data, ME_VERSION_SIGNATURE2)
                .or_else(|| find_signature(data, ME_VERSION_SIGNATURE));
            match version_offset {
                Some(offset) => {
                    if data.len() < offset + core::mem::size_of::<MeVersion>() {
                        return Err(ParseError::InvalidRegion);
                    }
                    let (version, _) = MeVersion::read_from_prefix(&data[offset..])
                        .map_err(|_| ParseError::InvalidRegion)?;
                    version_info = Some(version.version);
                }
                None => {
                    info.push_str("\nVersion: unknown");
                    version_found = false;
                }
            }
            if let Some(version) = version_info {
                info.push_str(&format!("\nVersion: {version}"));
            }
        }

        let index = self.model.add_item(
            parent,
            region.start,
            ItemType::Region,
            RegionSubtype::Me as u8,
            "ME region",
            "",
            info,
            ByteSlice::EMPTY,
            region,
            ByteSlice::EMPTY,
            true,
        )?;

        if empty_region {
            self.msg(Some(index), "parseMeRegion: ME region is empty");
        } else if !version_found {
            self.msg(
                Some(index),
                "parseMeRegion: ME version is unknown, it can be damaged",
            );
        }

        Ok(())
    }

    fn parse_gbe_region(&mut self, region: ByteSlice, parent: ItemId) -> Result<(), ParseError> {
        if region.is_empty() {
            return Err(ParseError::EmptyRegion);
        }
        if region.len < GBE_VERSION_OFFSET + 2 {
            return Err(ParseError::InvalidRegion);
        }

        let data = &self.image[region.start..region.start + region.len];
        let mac = &data[0..6];
        let version_low = data[GBE_VERSION_OFFSET];
        let version_major = data[GBE_VERSION_OFFSET + 1];
        let info = format!(
            "{}\nMAC: {:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}\nVersion: {}.{}",
            full_size_info(region.len),
            mac[0],
            mac[1],
            mac[2],
            mac[3],
            mac[4],
            mac[5],
            version_major,
            version_low >> 4
        );

        self.model.add_item(
            parent,
            region.start,
            ItemType::Region,
            RegionSubtype::Gbe as u8,
            "GbE region",
            "",
            info,
            ByteSlice::EMPTY,
            region,
            ByteSlice::EMPTY,
            true,
        )?;

        Ok(())
    }

    fn parse_pdr_region(&mut self, region: ByteSlice, parent: ItemId) -> Result<(), ParseError> {
        if region.is_empty() {
            return Err(ParseError::EmptyRegion);
        }
        let info = full_size_info(region.len);
        let index = self.model.add_item(
            parent,
            region.start,
            ItemType::Region,
            RegionSubtype::Pdr as u8,
            "PDR region",
            "",
            info,
            ByteSlice::EMPTY,
            region,
            ByteSlice::EMPTY,
            true,
        )?;

        // PDR may carry a BIOS-like volume layout but usually does not.
        match self.parse_raw_area(index) {
            Ok(())
            | Err(ParseError::VolumesNotFound)
            | Err(ParseError::InvalidVolume) => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn parse_general_region(
        &mut self,
        region: ByteSlice,
        subtype: RegionSubtype,
        parent: ItemId,
    ) -> Result<(), ParseError> {
        if region.is_empty() {
            return Err(ParseError::EmptyRegion);
        }
        let info = full_size_info(region.len);
        self.model.add_item(
            parent,
            region.start,
            ItemType::Region,
            subtype as u8,
            format!("{} region", subtype.as_str()),
            "",
            info,
            ByteSlice::EMPTY,
            region,
            ByteSlice::EMPTY,
            true,
        )?;
        Ok(())
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    if offset + 4 > data.len() {
        return 0;
    }
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn find_signature(data: &[u8], signature: &[u8; 4]) -> Option<usize> {
    data.windows(4).position(|window| window == signature)
}
