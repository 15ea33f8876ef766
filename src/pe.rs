//! PE32 and Terse Executable headers.
//!
//! Only the fields the image info needs are interpreted; the loader view
//! of these structures is out of scope.

use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // MZ
pub const IMAGE_PE_SIGNATURE: u32 = 0x0000_4550; // PE\0\0
pub const IMAGE_TE_SIGNATURE: u16 = 0x5A56; // VZ

pub const IMAGE_PE_OPTIONAL_HDR32_MAGIC: u16 = 0x010B;
pub const IMAGE_PE_OPTIONAL_HDR64_MAGIC: u16 = 0x020B;

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014C;
pub const IMAGE_FILE_MACHINE_ARM: u16 = 0x01C0;
pub const IMAGE_FILE_MACHINE_THUMB: u16 = 0x01C2;
pub const IMAGE_FILE_MACHINE_ARMNT: u16 = 0x01C4;
pub const IMAGE_FILE_MACHINE_POWERPC: u16 = 0x01F0;
pub const IMAGE_FILE_MACHINE_POWERPCFP: u16 = 0x01F1;
pub const IMAGE_FILE_MACHINE_IA64: u16 = 0x0200;
pub const IMAGE_FILE_MACHINE_EBC: u16 = 0x0EBC;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
pub const IMAGE_FILE_MACHINE_ARM64: u16 = 0xAA64;

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct DosHeader {
    pub e_magic: u16,
    #[serde(
        serialize_with = "serialize_reserved",
        deserialize_with = "deserialize_reserved"
    )]
    pub reserved: [u8; 58],
    pub e_lfanew: u32,
}

fn serialize_reserved<S>(v: &[u8; 58], s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    v.as_slice().serialize(s)
}

fn deserialize_reserved<'de, D>(d: D) -> Result<[u8; 58], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v: Vec<u8> = Vec::deserialize(d)?;
    v.try_into()
        .map_err(|_| serde::de::Error::custom("reserved field must be 58 bytes"))
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct PeHeader {
    pub signature: u32,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct ImageFileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct OptionalHeader32 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
}

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct ImageDataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// Terse Executable header, a stripped PE32 used in PEI.
#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct TeHeader {
    pub signature: u16,
    pub machine: u16,
    pub number_of_sections: u8,
    pub subsystem: u8,
    pub stripped_size: u16,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub data_directory: [ImageDataDirectory; 2],
}

pub fn machine_type_to_string(machine_type: u16) -> String {
    match machine_type {
        IMAGE_FILE_MACHINE_AMD64 => "x86-64".to_string(),
        IMAGE_FILE_MACHINE_ARM => "ARM".to_string(),
        IMAGE_FILE_MACHINE_ARMNT => "ARMv7".to_string(),
        IMAGE_FILE_MACHINE_ARM64 => "ARM64".to_string(),
        IMAGE_FILE_MACHINE_EBC => "EBC".to_string(),
        IMAGE_FILE_MACHINE_I386 => "x86".to_string(),
        IMAGE_FILE_MACHINE_IA64 => "IA64".to_string(),
        IMAGE_FILE_MACHINE_POWERPC => "PowerPC".to_string(),
        IMAGE_FILE_MACHINE_POWERPCFP => "PowerPC FP".to_string(),
        IMAGE_FILE_MACHINE_THUMB => "Thumb".to_string(),
        _ => format!("Unknown: {machine_type:04X}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn header_sizes() {
        assert_eq!(size_of::<DosHeader>(), 64);
        assert_eq!(size_of::<ImageFileHeader>(), 20);
        assert_eq!(size_of::<TeHeader>(), 40);
    }

    #[test]
    fn machine_names() {
        assert_eq!(machine_type_to_string(IMAGE_FILE_MACHINE_I386), "x86");
        assert_eq!(machine_type_to_string(0x1234), "Unknown: 1234");
    }
}
