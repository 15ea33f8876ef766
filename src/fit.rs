//! Firmware Interface Table and Boot Guard post-processing.
//!
//! The last VTF stores a physical pointer to the FIT at a fixed distance
//! from its end. FIT entries reference microcode updates, the BIOS ACM,
//! and the Boot Guard key and boot policy manifests by physical address.
//! The boot policy lists IBB segments whose SHA-256 digest the CPU
//! measures before releasing reset; vendors add their own protected
//! ranges through hash files with well-known GUIDs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::ffs::{calculate_checksum8, uint24_to_u32};
use crate::parser::FfsParser;
use crate::tree::{ItemId, ItemType, Marking, IMAGE_BUFFER};
use crate::ParseError;

pub const FIT_SIGNATURE: [u8; 8] = *b"_FIT_   ";
/// Distance of the FIT pointer from the end of the last VTF.
pub const FIT_POINTER_OFFSET: usize = 0x40;

pub const FIT_TYPE_HEADER: u8 = 0x00;
pub const FIT_TYPE_MICROCODE: u8 = 0x01;
pub const FIT_TYPE_BIOS_AC_MODULE: u8 = 0x02;
pub const FIT_TYPE_BIOS_INIT_MODULE: u8 = 0x07;
pub const FIT_TYPE_TPM_POLICY: u8 = 0x08;
pub const FIT_TYPE_BIOS_POLICY_DATA: u8 = 0x09;
pub const FIT_TYPE_TXT_CONF_POLICY: u8 = 0x0A;
pub const FIT_TYPE_AC_KEY_MANIFEST: u8 = 0x0B;
pub const FIT_TYPE_AC_BOOT_POLICY: u8 = 0x0C;
pub const FIT_TYPE_EMPTY: u8 = 0x7F;

const INTEL_VENDOR_ID: u32 = 0x8086;
const ACM_MODULE_TYPE: u16 = 0x0002;

const KEY_MANIFEST_TAG: [u8; 8] = *b"__KEYM__";
const BOOT_POLICY_TAG: [u8; 8] = *b"__ACBP__";
const IBB_ELEMENT_TAG: [u8; 8] = *b"__IBBS__";
const PMDA_ELEMENT_TAG: [u8; 8] = *b"__PMDA__";
const PMSG_ELEMENT_TAG: [u8; 8] = *b"__PMSG__";

/// How far behind a boot policy header elements are searched for.
const BOOT_POLICY_SEARCH_WINDOW: usize = 0x8000;

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct FitEntry {
    pub address: u64,
    pub size: [u8; 3],
    pub reserved: u8,
    pub version: u16,
    pub type_checksum_valid: u8,
    pub checksum: u8,
}

impl FitEntry {
    pub fn entry_type(&self) -> u8 {
        self.type_checksum_valid & 0x7F
    }

    pub fn checksum_valid(&self) -> bool {
        self.type_checksum_valid & 0x80 != 0
    }

    pub fn entry_size(&self) -> u32 {
        uint24_to_u32(&self.size)
    }
}

pub fn fit_entry_type_to_string(entry_type: u8) -> &'static str {
    match entry_type & 0x7F {
        FIT_TYPE_HEADER => "Header          ",
        FIT_TYPE_MICROCODE => "Microcode       ",
        FIT_TYPE_BIOS_AC_MODULE => "BIOS ACM        ",
        FIT_TYPE_BIOS_INIT_MODULE => "BIOS Init       ",
        FIT_TYPE_TPM_POLICY => "TPM Policy      ",
        FIT_TYPE_BIOS_POLICY_DATA => "BIOS Policy Data",
        FIT_TYPE_TXT_CONF_POLICY => "TXT Conf Policy ",
        FIT_TYPE_AC_KEY_MANIFEST => "BG Key Manifest ",
        FIT_TYPE_AC_BOOT_POLICY => "BG Boot Policy  ",
        FIT_TYPE_EMPTY => "Empty           ",
        _ => "Unknown Type    ",
    }
}

/// One row of the reported FIT table.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FitRow {
    pub address: String,
    pub size: String,
    pub version: String,
    pub entry_type: String,
    pub checksum: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VendorHashKind {
    Phoenix,
    Ami,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtectedRangeKind {
    BootGuard,
    VendorHashPhoenix,
    VendorHashAmiNew,
    VendorHashAmiOld,
    MicrosoftPmda,
}

impl ProtectedRangeKind {
    fn as_str(&self) -> &'static str {
        match self {
            ProtectedRangeKind::BootGuard => "BG-protected",
            ProtectedRangeKind::VendorHashPhoenix => "Phoenix-protected",
            ProtectedRangeKind::VendorHashAmiNew => "AMI-protected",
            ProtectedRangeKind::VendorHashAmiOld => "AMI-protected (old)",
            ProtectedRangeKind::MicrosoftPmda => "PMDA-protected",
        }
    }
}

/// A digest-protected set of image ranges. Segments are image offsets;
/// the digest covers their byte-wise concatenation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProtectedRange {
    pub kind: ProtectedRangeKind,
    pub segments: Vec<(usize, usize)>,
    pub digest: [u8; 32],
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct MicrocodeHeader {
    pub header_version: u32,
    pub update_revision: u32,
    pub date: u32,
    pub processor_signature: u32,
    pub checksum: u32,
    pub loader_revision: u32,
    pub processor_flags: u32,
    pub data_size: u32,
    pub total_size: u32,
    pub reserved: [u8; 12],
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct AcmHeader {
    pub module_type: u16,
    pub module_subtype: u16,
    pub header_length: u32,
    pub header_version: u32,
    pub chipset_id: u16,
    pub flags: u16,
    pub module_vendor: u32,
    pub date: u32,
    pub module_size: u32,
    pub acm_svn: u16,
    pub reserved1: u16,
    pub gdt_base: u32,
    pub gdt_max: u32,
    pub seg_sel: u32,
    pub entry_point: u32,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct BgSha256Hash {
    pub hash_algorithm_id: u16,
    pub size: u16,
    pub hash: [u8; 32],
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct KeyManifest {
    pub tag: [u8; 8],
    pub version: u8,
    pub km_version: u8,
    pub km_svn: u8,
    pub km_id: u8,
    pub bp_key_hash: BgSha256Hash,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct BootPolicyHeader {
    pub tag: [u8; 8],
    pub version: u8,
    pub header_version: u8,
    pub pmbpm_version: u8,
    pub bp_svn: u8,
    pub acm_svn: u8,
    pub reserved: u8,
    pub nem_data_stack: u16,
}

#[derive(Immutable, IntoBytes, FromBytes, KnownLayout, Clone, Copy)]
#[repr(C, packed)]
pub struct IbbElement {
    pub tag: [u8; 8],
    pub version: u8,
    pub unknown: u8,
    pub reserved0: u16,
    pub flags: u32,
    pub ibb_mch_bar: u64,
    pub vtd_bar: u64,
    pub dma_protection_base0: u32,
    pub dma_protection_limit0: u32,
    pub dma_protection_base1: u64,
    pub dma_protection_limit1: u64,
    pub post_ibb_hash: BgSha256Hash,
    pub ibb_entry_point: u32,
    pub digest: BgSha256Hash,
    pub ibb_seg_count: u8,
}

/// An IBB segment flagged 0 is measured into the IBB digest.
pub const IBB_SEGMENT_FLAG_NON_IBB: u16 = 0x0001;

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct IbbSegment {
    pub reserved: u16,
    pub flags: u16,
    pub base: u32,
    pub size: u32,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct PmdaHeader {
    pub version: u32,
    pub num_entries: u32,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct PmdaEntry {
    pub address: u32,
    pub size: u32,
    pub hash: [u8; 32],
}

/// Phoenix vendor hash file table: `$HS2` plus counted entries.
pub const PHOENIX_HASH_TABLE_SIGNATURE: [u8; 4] = *b"$HS2";

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct PhoenixHashTableHeader {
    pub signature: [u8; 4],
    pub num_entries: u32,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct PhoenixHashTableEntry {
    pub base: u32,
    pub size: u32,
    pub hash: [u8; 32],
}

/// AMI vendor hash file, newer layout.
#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct AmiHashFile {
    pub hash: [u8; 32],
    pub base: u32,
    pub size: u32,
}

impl<'a> FfsParser<'a> {
    /// Locate the FIT through the pointer stored in the last VTF, validate
    /// it, and tabulate its entries. Must run after memory addresses are
    /// assigned.
    pub(crate) fn parse_fit(&mut self) -> Result<(), ParseError> {
        let Some(vtf) = self.last_vtf else {
            return Err(ParseError::InvalidParameter);
        };
        let vtf_body = self.model.body(vtf);
        if vtf_body.len < FIT_POINTER_OFFSET {
            self.msg(
                Some(vtf),
                "parseFit: the last VTF is too small to hold a FIT pointer",
            );
            return Err(ParseError::InvalidFit);
        }
        let vtf_bytes = self.model.bytes(vtf_body);
        let pointer_at = vtf_bytes.len() - FIT_POINTER_OFFSET;
        let fit_pointer =
            u32::from_le_bytes(vtf_bytes[pointer_at..pointer_at + 4].try_into().unwrap());

        // Collect signature occurrences bottom-up, then look for the one
        // whose physical address the VTF references.
        let mut candidates = Vec::new();
        self.collect_fit_candidates(self.model.root(), &mut candidates);

        let mut found = None;
        for (item, offset, is_leaf) in candidates {
            let Some(address) = self.model.address(item) else {
                continue;
            };
            let candidate_address = address + self.model.header(item).len as u64 + offset as u64;
            if candidate_address == fit_pointer as u64 {
                self.msg(
                    Some(item),
                    format!("parseFit: real FIT table found at physical address {candidate_address:08X}h"),
                );
                found = Some((item, offset));
                break;
            } else if is_leaf {
                self.msg(
                    Some(item),
                    "parseFit: FIT table candidate found, but not referenced from the last VTF",
                );
            }
        }
        let Some((fit_item, fit_offset)) = found else {
            return Ok(());
        };

        // The FIT must stay where it is for the pointer to keep working.
        self.model.set_fixed(fit_item, true);

        let body = self.model.body(fit_item);
        let data = self.model.bytes(body).to_vec();
        let Ok((header_entry, _)) = FitEntry::read_from_prefix(&data[fit_offset..]) else {
            self.msg(Some(fit_item), "parseFit: invalid FIT header");
            return Err(ParseError::InvalidFit);
        };
        let entry_count = header_entry.entry_size() as usize;
        if entry_count == 0 {
            self.msg(Some(fit_item), "parseFit: FIT with zero entries");
            return Err(ParseError::InvalidFit);
        }
        let fit_size = entry_count << 4;
        if fit_offset + fit_size > data.len() {
            self.msg(
                Some(fit_item),
                "parseFit: declared FIT size overlaps the end of data",
            );
            return Err(ParseError::InvalidFit);
        }

        if header_entry.checksum_valid() {
            let mut temp = data[fit_offset..fit_offset + fit_size].to_vec();
            temp[15] = 0;
            let calculated = calculate_checksum8(&temp);
            if calculated != header_entry.checksum {
                self.msg(
                    Some(fit_item),
                    format!(
                        "parseFit: invalid FIT table checksum {:02X}h, should be {:02X}h",
                        header_entry.checksum, calculated
                    ),
                );
            }
        }

        if header_entry.entry_type() != FIT_TYPE_HEADER {
            self.msg(Some(fit_item), "parseFit: invalid FIT header type");
        }

        self.fit_table.push(FitRow {
            address: "_FIT_   ".to_string(),
            size: format!("{fit_size:08X}"),
            version: format!("{:04X}", header_entry.version),
            entry_type: fit_entry_type_to_string(header_entry.type_checksum_valid).to_string(),
            checksum: format!("{:02X}", header_entry.checksum),
        });

        let mut msg_modified_image_may_not_work = false;
        for index in 1..entry_count {
            let entry_offset = fit_offset + (index << 4);
            let Ok((entry, _)) = FitEntry::read_from_prefix(&data[entry_offset..]) else {
                break;
            };

            match entry.entry_type() {
                FIT_TYPE_HEADER => {
                    self.msg(
                        Some(fit_item),
                        "parseFit: second FIT header found, the table is damaged",
                    );
                }
                FIT_TYPE_EMPTY => {}
                FIT_TYPE_MICROCODE => {
                    let _ = self.parse_fit_microcode(&entry, fit_item);
                }
                FIT_TYPE_BIOS_AC_MODULE => {
                    let _ = self.parse_fit_acm(&entry, fit_item);
                    msg_modified_image_may_not_work = true;
                }
                FIT_TYPE_AC_KEY_MANIFEST => {
                    let _ = self.parse_fit_key_manifest(&entry, fit_item);
                    msg_modified_image_may_not_work = true;
                }
                FIT_TYPE_AC_BOOT_POLICY => {
                    let _ = self.parse_fit_boot_policy(&entry, fit_item);
                    msg_modified_image_may_not_work = true;
                }
                _ => {
                    msg_modified_image_may_not_work = true;
                }
            }

            self.fit_table.push(FitRow {
                address: format!("{:08X}", entry.address),
                size: format!("{:08X}", entry.entry_size()),
                version: format!("{:04X}", entry.version),
                entry_type: fit_entry_type_to_string(entry.type_checksum_valid).to_string(),
                checksum: format!("{:02X}", entry.checksum),
            });
        }

        if msg_modified_image_may_not_work {
            self.msg(None, "parseFit: opened image may not work after any modification");
        }

        Ok(())
    }

    fn collect_fit_candidates(&self, item: ItemId, out: &mut Vec<(ItemId, usize, bool)>) {
        for row in 0..self.model.row_count(item) {
            let child = self.model.child(item, row).unwrap();
            self.collect_fit_candidates(child, out);
        }
        if self.model.item_type(item) == ItemType::Root {
            return;
        }
        let body = self.model.body(item);
        if body.buffer != IMAGE_BUFFER || body.is_empty() {
            return;
        }
        let data = self.model.bytes(body);
        let is_leaf = self.model.row_count(item) == 0;
        let mut search_from = 0usize;
        while let Some(position) = data[search_from..]
            .windows(FIT_SIGNATURE.len())
            .position(|window| window == FIT_SIGNATURE)
        {
            out.push((item, search_from + position, is_leaf));
            search_from += position + 1;
        }
    }

    /// Physical address to image offset, bounds checked.
    fn physical_to_offset(&self, address: u64) -> Option<usize> {
        let offset = address.checked_sub(self.address_diff)?;
        let offset = usize::try_from(offset).ok()?;
        if offset >= self.image.len() {
            return None;
        }
        Some(offset)
    }

    fn parse_fit_microcode(&mut self, entry: &FitEntry, fit_item: ItemId) -> Result<(), ParseError> {
        let Some(offset) = self.physical_to_offset(entry.address) else {
            self.msg(
                Some(fit_item),
                format!(
                    "parseFitMicrocode: microcode address {:08X}h lies outside the opened image",
                    entry.address
                ),
            );
            return Err(ParseError::InvalidMicrocode);
        };
        let Ok((header, _)) = MicrocodeHeader::read_from_prefix(&self.image[offset..]) else {
            self.msg(Some(fit_item), "parseFitMicrocode: truncated microcode header");
            return Err(ParseError::InvalidMicrocode);
        };
        if header.header_version != 1 {
            self.msg(
                Some(fit_item),
                format!(
                    "parseFitMicrocode: invalid microcode header version {:08X}h",
                    header.header_version
                ),
            );
            return Err(ParseError::InvalidMicrocode);
        }
        // TotalSize covers header and data; the dword sum over it is zero.
        let total_size = if header.total_size == 0 {
            2048
        } else {
            header.total_size as usize
        };
        if offset + total_size > self.image.len() || total_size % 4 != 0 {
            self.msg(Some(fit_item), "parseFitMicrocode: invalid microcode total size");
            return Err(ParseError::InvalidMicrocode);
        }
        let mut sum: u32 = 0;
        for chunk in self.image[offset..offset + total_size].chunks_exact(4) {
            sum = sum.wrapping_add(u32::from_le_bytes(chunk.try_into().unwrap()));
        }
        if sum != 0 {
            self.msg(Some(fit_item), "parseFitMicrocode: invalid microcode checksum");
        }
        self.bg_info.push_str(&format!(
            "Microcode at {:08X}h: CPUID {:08X}h, revision {:08X}h, date {:02X}.{:02X}.{:04X}\n",
            entry.address,
            header.processor_signature,
            header.update_revision,
            (header.date >> 24) & 0xFF,
            (header.date >> 16) & 0xFF,
            header.date & 0xFFFF
        ));
        Ok(())
    }

    fn parse_fit_acm(&mut self, entry: &FitEntry, fit_item: ItemId) -> Result<(), ParseError> {
        let Some(offset) = self.physical_to_offset(entry.address) else {
            self.msg(
                Some(fit_item),
                format!(
                    "parseFitAcm: ACM address {:08X}h lies outside the opened image",
                    entry.address
                ),
            );
            return Err(ParseError::InvalidAcm);
        };
        let Ok((header, _)) = AcmHeader::read_from_prefix(&self.image[offset..]) else {
            self.msg(Some(fit_item), "parseFitAcm: truncated ACM header");
            return Err(ParseError::InvalidAcm);
        };
        if header.module_type != ACM_MODULE_TYPE {
            self.msg(
                Some(fit_item),
                format!("parseFitAcm: invalid ACM module type {:04X}h", header.module_type),
            );
            return Err(ParseError::InvalidAcm);
        }
        if header.module_vendor != INTEL_VENDOR_ID {
            self.msg(
                Some(fit_item),
                format!("parseFitAcm: unknown ACM vendor {:08X}h", header.module_vendor),
            );
        }
        self.bg_info.push_str(&format!(
            "BIOS ACM at {:08X}h: SVN {}, date {:02X}.{:02X}.{:04X}, size {:X}h\n",
            entry.address,
            header.acm_svn,
            header.date & 0xFF,
            (header.date >> 8) & 0xFF,
            header.date >> 16,
            header.module_size * 4
        ));
        Ok(())
    }

    fn parse_fit_key_manifest(
        &mut self,
        entry: &FitEntry,
        fit_item: ItemId,
    ) -> Result<(), ParseError> {
        let Some(offset) = self.physical_to_offset(entry.address) else {
            self.msg(
                Some(fit_item),
                format!(
                    "parseFitKeyManifest: key manifest address {:08X}h lies outside the opened image",
                    entry.address
                ),
            );
            return Err(ParseError::InvalidBgKeyManifest);
        };
        let Ok((manifest, _)) = KeyManifest::read_from_prefix(&self.image[offset..]) else {
            self.msg(Some(fit_item), "parseFitKeyManifest: truncated key manifest");
            return Err(ParseError::InvalidBgKeyManifest);
        };
        if manifest.tag != KEY_MANIFEST_TAG {
            self.msg(Some(fit_item), "parseFitKeyManifest: invalid key manifest tag");
            return Err(ParseError::InvalidBgKeyManifest);
        }
        self.bg_info.push_str(&format!(
            "Boot Guard Key Manifest at {:08X}h: version {}, KM version {}, KM SVN {}, KM ID {}\nBoot Policy key hash: {}\n",
            entry.address,
            manifest.version,
            manifest.km_version,
            manifest.km_svn,
            manifest.km_id,
            hex_string(&manifest.bp_key_hash.hash)
        ));
        Ok(())
    }

    fn parse_fit_boot_policy(
        &mut self,
        entry: &FitEntry,
        fit_item: ItemId,
    ) -> Result<(), ParseError> {
        let Some(offset) = self.physical_to_offset(entry.address) else {
            self.msg(
                Some(fit_item),
                format!(
                    "parseFitBootPolicy: boot policy address {:08X}h lies outside the opened image",
                    entry.address
                ),
            );
            return Err(ParseError::InvalidBgBootPolicy);
        };
        let Ok((header, _)) = BootPolicyHeader::read_from_prefix(&self.image[offset..]) else {
            self.msg(Some(fit_item), "parseFitBootPolicy: truncated boot policy manifest");
            return Err(ParseError::InvalidBgBootPolicy);
        };
        if header.tag != BOOT_POLICY_TAG {
            self.msg(Some(fit_item), "parseFitBootPolicy: invalid boot policy manifest tag");
            return Err(ParseError::InvalidBgBootPolicy);
        }
        self.bg_info.push_str(&format!(
            "Boot Guard Boot Policy Manifest at {:08X}h: version {}, BP SVN {}, ACM SVN {}\n",
            entry.address, header.version, header.bp_svn, header.acm_svn
        ));

        let window_end = (offset + BOOT_POLICY_SEARCH_WINDOW).min(self.image.len());
        let window = &self.image[offset..window_end];

        let ibb_offset = find_tag(window, &IBB_ELEMENT_TAG);
        let pmda_offset = find_tag(window, &PMDA_ELEMENT_TAG);
        let pmsg_offset = find_tag(window, &PMSG_ELEMENT_TAG);
        if ibb_offset.is_none() && pmda_offset.is_none() && pmsg_offset.is_none() {
            self.msg(
                Some(fit_item),
                "parseFitBootPolicy: no elements found in boot policy manifest",
            );
            return Err(ParseError::ElementsNotFound);
        }

        if let Some(ibb_offset) = ibb_offset {
            self.parse_ibb_element(offset + ibb_offset);
        }
        if let Some(pmda_offset) = pmda_offset {
            self.parse_pmda_element(offset + pmda_offset, fit_item);
        }
        if pmsg_offset.is_some() {
            self.bg_info.push_str("Boot Policy Manifest signature present\n");
        }

        Ok(())
    }

    fn parse_ibb_element(&mut self, offset: usize) {
        let Ok((element, _)) = IbbElement::read_from_prefix(&self.image[offset..]) else {
            self.msg(None, "parseFitBootPolicy: truncated IBB element");
            return;
        };
        let seg_count = element.ibb_seg_count as usize;
        let segments_offset = offset + core::mem::size_of::<IbbElement>();

        let mut segments = Vec::new();
        for index in 0..seg_count {
            let seg_offset = segments_offset + index * core::mem::size_of::<IbbSegment>();
            let Ok((segment, _)) = IbbSegment::read_from_prefix(&self.image[seg_offset.min(self.image.len())..])
            else {
                self.msg(None, "parseFitBootPolicy: truncated IBB segment list");
                return;
            };
            if segment.flags & IBB_SEGMENT_FLAG_NON_IBB != 0 || segment.size == 0 {
                continue;
            }
            let Some(segment_offset) = self.physical_to_offset(segment.base as u64) else {
                self.msg(
                    None,
                    format!(
                        "parseFitBootPolicy: IBB segment base {:08X}h lies outside the opened image",
                        segment.base
                    ),
                );
                continue;
            };
            segments.push((segment_offset, segment.size as usize));
        }

        let digest = element.digest;
        self.bg_info.push_str(&format!(
            "IBB segments: {}, IBB digest: {}\n",
            segments.len(),
            hex_string(&digest.hash)
        ));
        if !segments.is_empty() {
            self.protected_ranges.push(ProtectedRange {
                kind: ProtectedRangeKind::BootGuard,
                segments,
                digest: digest.hash,
            });
        }
    }

    fn parse_pmda_element(&mut self, offset: usize, fit_item: ItemId) {
        let header_offset = offset + PMDA_ELEMENT_TAG.len() + 4;
        let Ok((header, _)) = PmdaHeader::read_from_prefix(&self.image[header_offset.min(self.image.len())..])
        else {
            self.msg(Some(fit_item), "parseFitBootPolicy: truncated PMDA element");
            return;
        };
        let mut entry_offset = header_offset + core::mem::size_of::<PmdaHeader>();
        for _ in 0..header.num_entries.min(64) {
            let Ok((entry, _)) = PmdaEntry::read_from_prefix(&self.image[entry_offset.min(self.image.len())..])
            else {
                self.msg(Some(fit_item), "parseFitBootPolicy: truncated PMDA entry list");
                return;
            };
            if entry.size != 0 {
                if let Some(range_offset) = self.physical_to_offset(entry.address as u64) {
                    self.protected_ranges.push(ProtectedRange {
                        kind: ProtectedRangeKind::MicrosoftPmda,
                        segments: vec![(range_offset, entry.size as usize)],
                        digest: entry.hash,
                    });
                }
            }
            entry_offset += core::mem::size_of::<PmdaEntry>();
        }
    }

    /// Turn vendor hash files recorded during the first pass into
    /// protected ranges.
    pub(crate) fn parse_vendor_hash_files(&mut self) {
        let files = self.vendor_hash_files.clone();
        for (kind, file) in files {
            let body = self.model.body(file);
            let data = self.model.bytes(body).to_vec();
            match kind {
                VendorHashKind::Phoenix => {
                    let Ok((header, _)) = PhoenixHashTableHeader::read_from_prefix(&data) else {
                        self.msg(
                            Some(file),
                            "parseVendorHashFile: Phoenix hash file too small",
                        );
                        continue;
                    };
                    if header.signature != PHOENIX_HASH_TABLE_SIGNATURE {
                        self.msg(
                            Some(file),
                            "parseVendorHashFile: Phoenix hash file has invalid signature",
                        );
                        continue;
                    }
                    let mut entry_offset = core::mem::size_of::<PhoenixHashTableHeader>();
                    for _ in 0..header.num_entries.min(64) {
                        let Ok((entry, _)) =
                            PhoenixHashTableEntry::read_from_prefix(&data[entry_offset.min(data.len())..])
                        else {
                            self.msg(
                                Some(file),
                                "parseVendorHashFile: truncated Phoenix hash table",
                            );
                            break;
                        };
                        if entry.size != 0 {
                            if let Some(range_offset) = self.physical_to_offset(entry.base as u64) {
                                self.protected_ranges.push(ProtectedRange {
                                    kind: ProtectedRangeKind::VendorHashPhoenix,
                                    segments: vec![(range_offset, entry.size as usize)],
                                    digest: entry.hash,
                                });
                            }
                        }
                        entry_offset += core::mem::size_of::<PhoenixHashTableEntry>();
                    }
                }
                VendorHashKind::Ami => {
                    if data.len() == 32 {
                        // Old layout: one digest over the BIOS region from
                        // its start up to the hash file itself.
                        let Some(bios) = self.find_bios_region() else {
                            self.msg(
                                Some(file),
                                "parseVendorHashFile: AMI hash file found without BIOS region",
                            );
                            continue;
                        };
                        let bios_start = self.model.offset(bios);
                        let file_start = self.model.offset(file);
                        if file_start <= bios_start {
                            continue;
                        }
                        let mut digest = [0u8; 32];
                        digest.copy_from_slice(&data);
                        self.protected_ranges.push(ProtectedRange {
                            kind: ProtectedRangeKind::VendorHashAmiOld,
                            segments: vec![(bios_start, file_start - bios_start)],
                            digest,
                        });
                    } else if let Ok((file_data, _)) = AmiHashFile::read_from_prefix(&data) {
                        if file_data.size != 0 {
                            if let Some(range_offset) =
                                self.physical_to_offset(file_data.base as u64)
                            {
                                self.protected_ranges.push(ProtectedRange {
                                    kind: ProtectedRangeKind::VendorHashAmiNew,
                                    segments: vec![(range_offset, file_data.size as usize)],
                                    digest: file_data.hash,
                                });
                            }
                        }
                    } else {
                        self.msg(Some(file), "parseVendorHashFile: AMI hash file too small");
                    }
                }
            }
        }
    }

    fn find_bios_region(&self) -> Option<ItemId> {
        self.find_region_recursive(self.model.root())
    }

    fn find_region_recursive(&self, item: ItemId) -> Option<ItemId> {
        use crate::tree::RegionSubtype;
        if self.model.item_type(item) == ItemType::Region
            && self.model.subtype(item) == RegionSubtype::Bios as u8
        {
            return Some(item);
        }
        for row in 0..self.model.row_count(item) {
            let child = self.model.child(item, row).unwrap();
            if let Some(found) = self.find_region_recursive(child) {
                return Some(found);
            }
        }
        None
    }

    /// Hash every protected range over the original input buffer, compare
    /// against the stored digests, and colour the covered items.
    pub(crate) fn validate_protected_ranges(&mut self) {
        let ranges = self.protected_ranges.clone();
        if ranges.is_empty() {
            return;
        }

        for range in &ranges {
            let mut hasher = Sha256::new();
            let mut in_bounds = true;
            for (offset, size) in &range.segments {
                if offset + size > self.image.len() {
                    self.msg(
                        None,
                        format!(
                            "validateProtectedRanges: {} range at {:X}h overlaps the end of the image",
                            range.kind.as_str(),
                            offset
                        ),
                    );
                    in_bounds = false;
                    break;
                }
                hasher.update(&self.image[*offset..offset + size]);
            }
            if !in_bounds {
                continue;
            }
            let digest: [u8; 32] = hasher.finalize().into();
            let digest_matches = digest == range.digest;
            if !digest_matches {
                self.msg(
                    None,
                    format!(
                        "validateProtectedRanges: {} ranges hash mismatch, opened image may refuse to boot",
                        range.kind.as_str()
                    ),
                );
            }

            for (offset, size) in &range.segments {
                self.bg_info.push_str(&format!(
                    "{} range [{:X}h:{:X}h], digest {}\n",
                    range.kind.as_str(),
                    offset,
                    offset + size,
                    if digest_matches { "valid" } else { "invalid" }
                ));
            }

            let marking = if range.kind == ProtectedRangeKind::BootGuard {
                Marking::BootGuard
            } else {
                Marking::VendorHash
            };
            for (offset, size) in &range.segments {
                self.mark_protected_range_recursive(
                    self.model.root(),
                    *offset,
                    offset + size,
                    marking,
                );
            }
        }

        // The DXE core must sit inside a measured range, or Boot Guard's
        // chain of trust ends before it.
        if let Some(dxe_core) = self.bg_dxe_core {
            let has_bg_ranges = ranges
                .iter()
                .any(|range| range.kind == ProtectedRangeKind::BootGuard);
            if has_bg_ranges
                && !self.model.compressed(dxe_core)
                && self.model.marking(dxe_core) != Marking::BootGuard
            {
                self.msg(
                    Some(dxe_core),
                    "validateProtectedRanges: DXE core is outside Boot Guard protected ranges",
                );
            }
        }
    }

    fn mark_protected_range_recursive(
        &mut self,
        item: ItemId,
        start: usize,
        end: usize,
        marking: Marking,
    ) {
        if self.model.item_type(item) != ItemType::Root
            && !self.model.compressed(item)
            && self.model.header(item).buffer == IMAGE_BUFFER
        {
            let item_start = self.model.offset(item);
            let item_end = item_start + self.model.full_size(item);
            if item_start >= start && item_end <= end {
                self.model.set_marking(item, marking);
                self.model.set_fixed(item, true);
            } else if item_start < end && item_end > start && self.model.marking(item) == Marking::None
            {
                self.model.set_marking(item, Marking::Partial);
            }
        }

        for row in 0..self.model.row_count(item) {
            let child = self.model.child(item, row).unwrap();
            self.mark_protected_range_recursive(child, start, end, marking);
        }
    }
}

fn find_tag(window: &[u8], tag: &[u8; 8]) -> Option<usize> {
    window.windows(tag.len()).position(|candidate| candidate == tag)
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_entry_fields() {
        let entry = FitEntry {
            address: 0xFFFF_0000,
            size: [0x04, 0x00, 0x00],
            reserved: 0,
            version: 0x0100,
            type_checksum_valid: 0x80 | FIT_TYPE_HEADER,
            checksum: 0x5A,
        };
        assert_eq!(entry.entry_type(), FIT_TYPE_HEADER);
        assert!(entry.checksum_valid());
        assert_eq!(entry.entry_size(), 4);
    }

    #[test]
    fn entry_type_names() {
        assert_eq!(fit_entry_type_to_string(0x01).trim_end(), "Microcode");
        assert_eq!(fit_entry_type_to_string(0x0B).trim_end(), "BG Key Manifest");
        assert_eq!(fit_entry_type_to_string(0x55).trim_end(), "Unknown Type");
    }

    #[test]
    fn hex_string_formats_digest() {
        assert_eq!(hex_string(&[0xDE, 0xAD, 0x01]), "DEAD01");
    }
}
