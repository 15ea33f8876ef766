//! On-flash structures of the UEFI firmware file system.
//!
//! Layouts follow the PI specification (volume headers, FFS file headers,
//! section headers) plus the vendor extensions commonly met in shipped
//! images: Toshiba and AMI Aptio capsules, Apple section headers, Insyde
//! and Phoenix postcode sections. All multi-byte fields are little-endian;
//! structures that are unaligned on flash are declared packed.

use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::guid::Guid;

// Capsule GUIDs recognized at the very start of an image.
pub const EFI_CAPSULE_GUID: Guid = Guid::new(
    0x3B6686BD,
    0x0D76,
    0x4030,
    [0xB7, 0x0E, 0xB5, 0x51, 0x9E, 0x2F, 0xC5, 0xA0],
);
pub const INTEL_CAPSULE_GUID: Guid = Guid::new(
    0x539182B9,
    0xABB5,
    0x4391,
    [0xB6, 0x9A, 0xE3, 0xA9, 0x43, 0xF7, 0x2F, 0xCC],
);
pub const LENOVO_CAPSULE_GUID: Guid = Guid::new(
    0xE20BAFD3,
    0x9914,
    0x4F4F,
    [0x95, 0x37, 0x31, 0x29, 0xE0, 0x90, 0xEB, 0x3C],
);
pub const LENOVO2_CAPSULE_GUID: Guid = Guid::new(
    0x25B5FE76,
    0x8243,
    0x4A5C,
    [0xA9, 0xBD, 0x7E, 0xE3, 0x24, 0x61, 0x98, 0xB5],
);
pub const TOSHIBA_CAPSULE_GUID: Guid = Guid::new(
    0x3BE07062,
    0x1D51,
    0x45D2,
    [0x83, 0x2B, 0xF0, 0x93, 0x25, 0x7E, 0xD4, 0x61],
);
pub const APTIO_SIGNED_CAPSULE_GUID: Guid = Guid::new(
    0x4A3CA68B,
    0x7723,
    0x48FB,
    [0x80, 0x3D, 0x57, 0x8C, 0xC1, 0xFE, 0xC4, 0x4D],
);
pub const APTIO_UNSIGNED_CAPSULE_GUID: Guid = Guid::new(
    0x14EEBB90,
    0x890A,
    0x43DB,
    [0xAE, 0xD1, 0x5D, 0x3C, 0x45, 0x88, 0xA4, 0x18],
);

/// Standard EFI capsule header.
#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct CapsuleHeader {
    pub capsule_guid: Guid,
    pub header_size: u32,
    pub flags: u32,
    pub capsule_image_size: u32,
}

/// Toshiba capsule header, same size but a FullSize field instead.
#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct ToshibaCapsuleHeader {
    pub capsule_guid: Guid,
    pub header_size: u32,
    pub full_size: u32,
    pub flags: u32,
}

/// AMI Aptio capsule header, a standard capsule plus ROM layout offsets.
#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct AptioCapsuleHeader {
    pub capsule_header: CapsuleHeader,
    pub rom_image_offset: u16,
    pub rom_layout_offset: u16,
}

// Firmware volume

/// `_FVH`
pub const FVH_SIGNATURE: u32 = u32::from_le_bytes(*b"_FVH");
/// The signature sits this many bytes into the volume header.
pub const FVH_SIGNATURE_OFFSET: usize = 40;

pub const EFI_FIRMWARE_FILE_SYSTEM_GUID: Guid = Guid::new(
    0x7A9354D9,
    0x0468,
    0x444A,
    [0x81, 0xCE, 0x0B, 0xF6, 0x17, 0xD8, 0x90, 0xDF],
);
pub const EFI_FIRMWARE_FILE_SYSTEM2_GUID: Guid = Guid::new(
    0x8C8CE578,
    0x8A3D,
    0x4F1C,
    [0x99, 0x35, 0x89, 0x61, 0x85, 0xC3, 0x2D, 0xD3],
);
pub const EFI_FIRMWARE_FILE_SYSTEM3_GUID: Guid = Guid::new(
    0x5473C07A,
    0x3DCB,
    0x4DCA,
    [0xBD, 0x6F, 0x1E, 0x96, 0x89, 0xE7, 0x34, 0x9A],
);
pub const EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM_GUID: Guid = Guid::new(
    0x04ADEEAD,
    0x61FF,
    0x4D31,
    [0xB6, 0xBA, 0x64, 0xF8, 0xBF, 0x90, 0x1F, 0x5A],
);
pub const EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM2_GUID: Guid = Guid::new(
    0xBD001B8C,
    0x6A71,
    0x487B,
    [0xA1, 0x4F, 0x0C, 0x2A, 0x2D, 0xCF, 0x7A, 0x5D],
);
pub const EFI_INTEL_FILE_SYSTEM_GUID: Guid = Guid::new(
    0xAD3FFFFF,
    0xD28B,
    0x44C4,
    [0x9F, 0x13, 0x9E, 0xA9, 0x8A, 0x97, 0xF9, 0xF0],
);
pub const EFI_INTEL_FILE_SYSTEM2_GUID: Guid = Guid::new(
    0xD6A1CD70,
    0x4B33,
    0x4994,
    [0xA6, 0xEA, 0x37, 0x5F, 0x2C, 0xCC, 0x54, 0x37],
);
pub const EFI_SONY_FILE_SYSTEM_GUID: Guid = Guid::new(
    0x4F494156,
    0xAED6,
    0x4D64,
    [0xA5, 0x37, 0xB8, 0xA5, 0x55, 0x7B, 0xCE, 0xEC],
);

/// Filesystem GUIDs parsed as FFSv2.
pub const FFS_V2_VOLUMES: &[Guid] = &[
    EFI_FIRMWARE_FILE_SYSTEM_GUID,
    EFI_FIRMWARE_FILE_SYSTEM2_GUID,
    EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM_GUID,
    EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM2_GUID,
    EFI_INTEL_FILE_SYSTEM_GUID,
    EFI_INTEL_FILE_SYSTEM2_GUID,
    EFI_SONY_FILE_SYSTEM_GUID,
];

/// Filesystem GUIDs parsed as FFSv3.
pub const FFS_V3_VOLUMES: &[Guid] = &[EFI_FIRMWARE_FILE_SYSTEM3_GUID];

pub const NVRAM_MAIN_STORE_VOLUME_GUID: Guid = Guid::new(
    0xFFF12B8D,
    0x7696,
    0x4C8B,
    [0xA9, 0x85, 0x27, 0x47, 0x07, 0x5B, 0x4F, 0x50],
);
pub const ADDITIONAL_NVRAM_STORE_VOLUME_GUID: Guid = Guid::new(
    0x00504624,
    0x8A59,
    0x4EEB,
    [0xBD, 0x0F, 0x6B, 0x36, 0xE9, 0x61, 0x28, 0xE0],
);

// Volume attributes
pub const EFI_FVB_ERASE_POLARITY: u32 = 0x0000_0800;
pub const EFI_FVB_ALIGNMENT_CAP: u32 = 0x0000_8000;
pub const EFI_FVB2_ALIGNMENT: u32 = 0x001F_0000;
pub const EFI_FVB2_WEAK_ALIGNMENT: u32 = 0x8000_0000;

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct FirmwareVolumeHeader {
    pub zero_vector: [u8; 16],
    pub file_system_guid: Guid,
    pub fv_length: u64,
    pub signature: u32,
    pub attributes: u32,
    pub header_length: u16,
    pub checksum: u16,
    pub ext_header_offset: u16,
    pub reserved: u8,
    pub revision: u8,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct BlockMapEntry {
    pub num_blocks: u32,
    pub length: u32,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct VolumeExtHeader {
    pub fv_name: Guid,
    pub ext_header_size: u32,
}

// FFS files

pub const EFI_FFS_VOLUME_TOP_FILE_GUID: Guid = Guid::new(
    0x1BA0062E,
    0xC779,
    0x4582,
    [0x85, 0x66, 0x33, 0x6A, 0xE8, 0xF7, 0x8F, 0x09],
);
pub const EFI_PEI_APRIORI_FILE_GUID: Guid = Guid::new(
    0x1B45CC0A,
    0x156A,
    0x428A,
    [0xAF, 0x62, 0x49, 0x86, 0x4D, 0xA0, 0xE6, 0xE6],
);
pub const EFI_DXE_APRIORI_FILE_GUID: Guid = Guid::new(
    0xFC510EE7,
    0xFFDC,
    0x11D4,
    [0xBD, 0x41, 0x00, 0x80, 0xC7, 0x3C, 0x88, 0x81],
);
pub const EFI_DXE_CORE_GUID: Guid = Guid::new(
    0xD6A2CB7F,
    0x6A18,
    0x4E2F,
    [0xB4, 0x3B, 0x99, 0x20, 0xA7, 0x33, 0x70, 0x0A],
);
pub const NVAR_STORE_FILE_GUID: Guid = Guid::new(
    0xCEF5B9A3,
    0x476D,
    0x497F,
    [0x9F, 0xDC, 0xE9, 0x81, 0x43, 0xE0, 0x42, 0x2C],
);
pub const VENDOR_HASH_FILE_GUID_PHOENIX: Guid = Guid::new(
    0x389CC6F2,
    0x1EA8,
    0x467B,
    [0xAB, 0x8A, 0x78, 0xE7, 0x69, 0xAE, 0x2A, 0x15],
);
pub const VENDOR_HASH_FILE_GUID_AMI: Guid = Guid::new(
    0xCBC91F44,
    0xA4BC,
    0x4A5B,
    [0x86, 0x96, 0x70, 0x34, 0x51, 0xD0, 0xB0, 0x53],
);

// File attributes
pub const FFS_ATTRIB_TAIL_PRESENT: u8 = 0x01; // revision 1 volumes
pub const FFS_ATTRIB_LARGE_FILE: u8 = 0x01; // FFSv3 volumes
pub const FFS_ATTRIB_FIXED: u8 = 0x04;
pub const FFS_ATTRIB_DATA_ALIGNMENT: u8 = 0x38;
pub const FFS_ATTRIB_CHECKSUM: u8 = 0x40;

/// Data checksum placeholder when FFS_ATTRIB_CHECKSUM is clear.
pub const FFS_FIXED_CHECKSUM: u8 = 0x55;
pub const FFS_FIXED_CHECKSUM2: u8 = 0xAA;

/// Alignment power lookup for `(Attributes & FFS_ATTRIB_DATA_ALIGNMENT) >> 3`.
pub const FFS_ALIGNMENT_TABLE: [u8; 8] = [0, 4, 7, 9, 10, 12, 15, 16];

// File types
pub const EFI_FV_FILETYPE_ALL: u8 = 0x00;
pub const EFI_FV_FILETYPE_RAW: u8 = 0x01;
pub const EFI_FV_FILETYPE_FREEFORM: u8 = 0x02;
pub const EFI_FV_FILETYPE_SECURITY_CORE: u8 = 0x03;
pub const EFI_FV_FILETYPE_PEI_CORE: u8 = 0x04;
pub const EFI_FV_FILETYPE_DXE_CORE: u8 = 0x05;
pub const EFI_FV_FILETYPE_PEIM: u8 = 0x06;
pub const EFI_FV_FILETYPE_DRIVER: u8 = 0x07;
pub const EFI_FV_FILETYPE_COMBINED_PEIM_DRIVER: u8 = 0x08;
pub const EFI_FV_FILETYPE_APPLICATION: u8 = 0x09;
pub const EFI_FV_FILETYPE_MM: u8 = 0x0A;
pub const EFI_FV_FILETYPE_FIRMWARE_VOLUME_IMAGE: u8 = 0x0B;
pub const EFI_FV_FILETYPE_COMBINED_MM_DXE: u8 = 0x0C;
pub const EFI_FV_FILETYPE_MM_CORE: u8 = 0x0D;
pub const EFI_FV_FILETYPE_MM_STANDALONE: u8 = 0x0E;
pub const EFI_FV_FILETYPE_MM_CORE_STANDALONE: u8 = 0x0F;
pub const EFI_FV_FILETYPE_PAD: u8 = 0xF0;

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct FfsFileHeader {
    pub name: Guid,
    pub header_checksum: u8,
    pub data_checksum: u8,
    pub file_type: u8,
    pub attributes: u8,
    pub size: [u8; 3],
    pub state: u8,
}

/// FFSv3 header for files with FFS_ATTRIB_LARGE_FILE.
#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct FfsFileHeader2 {
    pub header: FfsFileHeader,
    pub extended_size: u64,
}

// Sections

pub const EFI_SECTION_COMPRESSION: u8 = 0x01;
pub const EFI_SECTION_GUID_DEFINED: u8 = 0x02;
pub const EFI_SECTION_DISPOSABLE: u8 = 0x03;
pub const EFI_SECTION_PE32: u8 = 0x10;
pub const EFI_SECTION_PIC: u8 = 0x11;
pub const EFI_SECTION_TE: u8 = 0x12;
pub const EFI_SECTION_DXE_DEPEX: u8 = 0x13;
pub const EFI_SECTION_VERSION: u8 = 0x14;
pub const EFI_SECTION_USER_INTERFACE: u8 = 0x15;
pub const EFI_SECTION_COMPATIBILITY16: u8 = 0x16;
pub const EFI_SECTION_FIRMWARE_VOLUME_IMAGE: u8 = 0x17;
pub const EFI_SECTION_FREEFORM_SUBTYPE_GUID: u8 = 0x18;
pub const EFI_SECTION_RAW: u8 = 0x19;
pub const EFI_SECTION_PEI_DEPEX: u8 = 0x1B;
pub const EFI_SECTION_MM_DEPEX: u8 = 0x1C;
pub const INSYDE_SECTION_POSTCODE: u8 = 0x20;
pub const PHOENIX_SECTION_POSTCODE: u8 = 0xF0;

/// A 24-bit Size of all-ones means the 32-bit ExtendedSize field is used.
pub const EFI_SECTION2_IS_USED: u32 = 0x00FF_FFFF;

/// Marker in the Reserved field of Apple's 8-byte common section header.
pub const EFI_SECTION_APPLE_USED: u32 = 0x7FFF_7FFF;

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct CommonSectionHeader {
    pub size: [u8; 3],
    pub section_type: u8,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct CommonSectionHeaderApple {
    pub size: [u8; 3],
    pub section_type: u8,
    pub reserved: u32,
}

// Compression types of a compressed section
pub const NOT_COMPRESSED: u8 = 0x00;
pub const EFI_STANDARD_COMPRESSION: u8 = 0x01;
pub const EFI_CUSTOMIZED_COMPRESSION: u8 = 0x02;

#[derive(Immutable, IntoBytes, FromBytes, KnownLayout, Clone, Copy)]
#[repr(C, packed)]
pub struct CompressionSectionFields {
    pub uncompressed_length: u32,
    pub compression_type: u8,
}

// GUID-defined section attributes
pub const EFI_GUIDED_SECTION_PROCESSING_REQUIRED: u16 = 0x01;
pub const EFI_GUIDED_SECTION_AUTH_STATUS_VALID: u16 = 0x02;

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct GuidDefinedSectionFields {
    pub section_definition_guid: Guid,
    pub data_offset: u16,
    pub attributes: u16,
}

pub const EFI_GUIDED_SECTION_CRC32: Guid = Guid::new(
    0xFC1BCDB0,
    0x7D31,
    0x49AA,
    [0x93, 0x6A, 0xA4, 0x60, 0x0D, 0x9D, 0xD0, 0x83],
);
pub const EFI_GUIDED_SECTION_TIANO: Guid = Guid::new(
    0xA31280AD,
    0x481E,
    0x41B6,
    [0x95, 0xE8, 0x12, 0x7F, 0x4C, 0x98, 0x47, 0x79],
);
pub const EFI_GUIDED_SECTION_LZMA: Guid = Guid::new(
    0xEE4E5898,
    0x3914,
    0x4259,
    [0x9D, 0x6E, 0xDC, 0x7B, 0xD7, 0x94, 0x03, 0xCF],
);
pub const EFI_GUIDED_SECTION_LZMAF86: Guid = Guid::new(
    0xD42AE6BD,
    0x1352,
    0x4BFB,
    [0x90, 0x9A, 0xCA, 0x72, 0xA6, 0xEA, 0xE8, 0x89],
);
pub const EFI_FIRMWARE_CONTENTS_SIGNED_GUID: Guid = Guid::new(
    0x0F9D89E8,
    0x9259,
    0x4F76,
    [0xA5, 0xAF, 0x0C, 0x89, 0xE3, 0x40, 0x23, 0xDF],
);
pub const EFI_CERT_TYPE_RSA2048_SHA256_GUID: Guid = Guid::new(
    0xA7717414,
    0xC616,
    0x4977,
    [0x94, 0x20, 0x84, 0x47, 0x12, 0xA7, 0x35, 0xBF],
);

pub const WIN_CERT_TYPE_EFI_GUID: u16 = 0x0EF1;

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct WinCertificate {
    pub length: u32,
    pub revision: u16,
    pub certificate_type: u16,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct WinCertificateUefiGuid {
    pub certificate: WinCertificate,
    pub cert_type: Guid,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct FreeformSubtypeGuidSectionFields {
    pub subtype_guid: Guid,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct VersionSectionFields {
    pub build_number: u16,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct PostcodeSectionFields {
    pub postcode: u32,
}

// Dependency expression opcodes
pub const EFI_DEP_BEFORE: u8 = 0x00;
pub const EFI_DEP_AFTER: u8 = 0x01;
pub const EFI_DEP_PUSH: u8 = 0x02;
pub const EFI_DEP_AND: u8 = 0x03;
pub const EFI_DEP_OR: u8 = 0x04;
pub const EFI_DEP_NOT: u8 = 0x05;
pub const EFI_DEP_TRUE: u8 = 0x06;
pub const EFI_DEP_FALSE: u8 = 0x07;
pub const EFI_DEP_END: u8 = 0x08;
pub const EFI_DEP_SOR: u8 = 0x09;

// Size codec and checksums

pub fn uint24_to_u32(size: &[u8; 3]) -> u32 {
    u32::from_le_bytes([size[0], size[1], size[2], 0])
}

pub fn u32_to_uint24(size: u32) -> [u8; 3] {
    let b = size.to_le_bytes();
    [b[0], b[1], b[2]]
}

/// 8-bit two's-complement checksum: adding the result to the byte sum
/// yields zero.
pub fn calculate_checksum8(data: &[u8]) -> u8 {
    let mut counter: u8 = 0;
    for byte in data {
        counter = counter.wrapping_add(*byte);
    }
    0u8.wrapping_sub(counter)
}

/// 16-bit two's-complement checksum over little-endian words. A trailing
/// odd byte is ignored, as on flash every checksummed header is word-sized.
pub fn calculate_checksum16(data: &[u8]) -> u16 {
    let mut counter: u16 = 0;
    for pair in data.chunks_exact(2) {
        counter = counter.wrapping_add(u16::from_le_bytes([pair[0], pair[1]]));
    }
    0u16.wrapping_sub(counter)
}

pub fn file_type_to_string(file_type: u8) -> &'static str {
    match file_type {
        EFI_FV_FILETYPE_RAW => "Raw",
        EFI_FV_FILETYPE_FREEFORM => "Freeform",
        EFI_FV_FILETYPE_SECURITY_CORE => "SEC core",
        EFI_FV_FILETYPE_PEI_CORE => "PEI core",
        EFI_FV_FILETYPE_DXE_CORE => "DXE core",
        EFI_FV_FILETYPE_PEIM => "PEI module",
        EFI_FV_FILETYPE_DRIVER => "DXE driver",
        EFI_FV_FILETYPE_COMBINED_PEIM_DRIVER => "Combined PEI/DXE",
        EFI_FV_FILETYPE_APPLICATION => "Application",
        EFI_FV_FILETYPE_MM => "SMM module",
        EFI_FV_FILETYPE_FIRMWARE_VOLUME_IMAGE => "Volume image",
        EFI_FV_FILETYPE_COMBINED_MM_DXE => "Combined SMM/DXE",
        EFI_FV_FILETYPE_MM_CORE => "SMM core",
        EFI_FV_FILETYPE_MM_STANDALONE => "SMM standalone",
        EFI_FV_FILETYPE_MM_CORE_STANDALONE => "SMM core standalone",
        EFI_FV_FILETYPE_PAD => "Pad",
        _ => "Unknown",
    }
}

pub fn section_type_to_string(section_type: u8) -> &'static str {
    match section_type {
        EFI_SECTION_COMPRESSION => "Compressed",
        EFI_SECTION_GUID_DEFINED => "GUID defined",
        EFI_SECTION_DISPOSABLE => "Disposable",
        EFI_SECTION_PE32 => "PE32 image",
        EFI_SECTION_PIC => "PIC image",
        EFI_SECTION_TE => "TE image",
        EFI_SECTION_DXE_DEPEX => "DXE dependency",
        EFI_SECTION_VERSION => "Version",
        EFI_SECTION_USER_INTERFACE => "UI",
        EFI_SECTION_COMPATIBILITY16 => "16-bit image",
        EFI_SECTION_FIRMWARE_VOLUME_IMAGE => "Volume image",
        EFI_SECTION_FREEFORM_SUBTYPE_GUID => "Freeform subtype GUID",
        EFI_SECTION_RAW => "Raw",
        EFI_SECTION_PEI_DEPEX => "PEI dependency",
        EFI_SECTION_MM_DEPEX => "SMM dependency",
        INSYDE_SECTION_POSTCODE => "Insyde postcode",
        PHOENIX_SECTION_POSTCODE => "Phoenix postcode",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn struct_sizes_match_flash_layout() {
        assert_eq!(size_of::<CapsuleHeader>(), 28);
        assert_eq!(size_of::<ToshibaCapsuleHeader>(), 28);
        assert_eq!(size_of::<AptioCapsuleHeader>(), 32);
        assert_eq!(size_of::<FirmwareVolumeHeader>(), 56);
        assert_eq!(size_of::<BlockMapEntry>(), 8);
        assert_eq!(size_of::<FfsFileHeader>(), 24);
        assert_eq!(size_of::<FfsFileHeader2>(), 32);
        assert_eq!(size_of::<CommonSectionHeader>(), 4);
        assert_eq!(size_of::<CommonSectionHeaderApple>(), 8);
        assert_eq!(size_of::<CompressionSectionFields>(), 5);
        assert_eq!(size_of::<GuidDefinedSectionFields>(), 20);
    }

    #[test]
    fn uint24_round_trip() {
        assert_eq!(uint24_to_u32(&[0x78, 0x56, 0x34]), 0x345678);
        assert_eq!(u32_to_uint24(0x345678), [0x78, 0x56, 0x34]);
        assert_eq!(uint24_to_u32(&[0xFF, 0xFF, 0xFF]), EFI_SECTION2_IS_USED);
    }

    #[test]
    fn checksum8_sums_to_zero() {
        let data = [0x12u8, 0x34, 0x56, 0x78, 0x9A];
        let checksum = calculate_checksum8(&data);
        let total: u8 = data
            .iter()
            .fold(checksum, |acc, byte| acc.wrapping_add(*byte));
        assert_eq!(total, 0);
    }

    #[test]
    fn checksum16_sums_to_zero() {
        let data = [0x12u8, 0x34, 0x56, 0x78];
        let checksum = calculate_checksum16(&data);
        let mut total = checksum;
        for pair in data.chunks_exact(2) {
            total = total.wrapping_add(u16::from_le_bytes([pair[0], pair[1]]));
        }
        assert_eq!(total, 0);
    }
}
