//! Intel flash descriptor
//!
//! The descriptor is a 4 KiB table at the very start of an Intel flash
//! image. Its map points at the component, region, and master sections;
//! the region section partitions the rest of the chip into up to ten
//! regions with base and limit in 4 KiB units. See the ICH8 and the
//! 100/600 series chipset PCH datasheets, and coreboot `util/ifdtool/`.
//!
//! Later descriptors moved fields around without public documentation.
//! The reliable version probe is the hard-coded read clock frequency in
//! the component section: 20 MHz before Skylake, 17 MHz from Skylake on.

// The all-uppercase acronyms from the datasheets are retained.
#![allow(non_snake_case)]

use bitfield_struct::bitfield;
use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// LE representation of the signature at offset 16.
pub const FLASH_DESCRIPTOR_SIGNATURE: u32 = 0x0FF0_A55A;
/// The descriptor region always spans the first 4 KiB.
pub const FLASH_DESCRIPTOR_SIZE: usize = 0x1000;
/// Section bases are stored compact; expanded bases must stay below this.
pub const FLASH_DESCRIPTOR_MAX_BASE: u8 = 0xE0;
/// Upper map location near the end of the descriptor.
pub const FLASH_DESCRIPTOR_UPPER_MAP_BASE: usize = 0x0EFC;


// Region access bits in master sections.
pub const REGION_ACCESS_DESC: u16 = 0x01;
pub const REGION_ACCESS_BIOS: u16 = 0x02;
pub const REGION_ACCESS_ME: u16 = 0x04;
pub const REGION_ACCESS_GBE: u16 = 0x08;
pub const REGION_ACCESS_PDR: u16 = 0x10;
pub const REGION_ACCESS_EC: u16 = 0x20;

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct DescriptorHeader {
    pub reserved_vector: [u8; 16],
    pub signature: u32,
}

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FLMAP0 {
    pub FCBA: u8,
    #[bits(2)]
    NC: u8,
    #[bits(6)]
    _0: u8,
    pub FRBA: u8,
    #[bits(3)]
    pub NR: u8,
    #[bits(5)]
    _1: u8,
}

impl FLMAP0 {
    pub fn component_base(self) -> u8 {
        self.FCBA()
    }
    pub fn component_offset(self) -> usize {
        (self.FCBA() as usize) << 4
    }
    pub fn number_of_flash_chips(self) -> usize {
        self.NC() as usize + 1
    }

    pub fn region_base(self) -> u8 {
        self.FRBA()
    }
    pub fn region_offset(self) -> usize {
        (self.FRBA() as usize) << 4
    }
    pub fn number_of_regions(self) -> usize {
        self.NR() as usize + 1
    }
}

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FLMAP1 {
    pub FMBA: u8,
    #[bits(2)]
    pub NM: u8,
    #[bits(6)]
    _0: u8,
    FPSBA: u8,
    PSL: u8,
}

impl FLMAP1 {
    pub fn master_base(self) -> u8 {
        self.FMBA()
    }
    pub fn master_offset(self) -> usize {
        (self.FMBA() as usize) << 4
    }
    pub fn number_of_masters(self) -> usize {
        self.NM() as usize + 1
    }

    pub fn pch_straps_offset(self) -> usize {
        (self.FPSBA() as usize) << 4
    }
    pub fn number_of_pch_straps(self) -> usize {
        self.PSL() as usize
    }
}

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FLMAP2 {
    FMSBA: u8,
    MSL: u8,
    _0: u16,
}

impl FLMAP2 {
    pub fn proc_straps_offset(self) -> usize {
        (self.FMSBA() as usize) << 4
    }
    pub fn number_of_proc_straps(self) -> usize {
        self.MSL() as usize
    }
}

/// Descriptor map: the three FLMAP dwords right after the signature.
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct DescriptorMap {
    pub flmap0: FLMAP0,
    pub flmap1: FLMAP1,
    pub flmap2: FLMAP2,
    pub flmap3: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frequency {
    M20,
    M33,
    M48,
    M50_30,
    M17,
    _Undefined,
    _Reserved,
}

impl Frequency {
    pub const fn from_bits(val: u8) -> Self {
        match val {
            0b000 => Self::M20,
            0b001 => Self::M33,
            0b010 => Self::M48,
            0b100 => Self::M50_30,
            0b110 => Self::M17,
            0b111 => Self::_Reserved,
            _ => Self::_Undefined,
        }
    }

    pub const fn into_bits(self) -> u8 {
        match self {
            Self::M20 => 0b000,
            Self::M33 => 0b001,
            Self::M48 => 0b010,
            Self::M50_30 => 0b100,
            Self::M17 => 0b110,
            Self::_Reserved => 0b111,
            Self::_Undefined => 0b011,
        }
    }
}

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FlashParameters {
    #[bits(3)]
    comp1_density: u8,
    #[bits(3)]
    comp2_density: u8,
    #[bits(2)]
    _0: u8,

    #[bits(8)]
    _1: u8,

    #[bits(1)]
    _2: u8,
    #[bits(3)]
    pub read_clock_frequency: Frequency,
    pub fast_read_support: bool,
    #[bits(3)]
    fast_read_clock_frequency: Frequency,

    #[bits(3)]
    write_erase_clock_frequency: Frequency,
    #[bits(3)]
    read_id_status_clock_frequency: Frequency,
    #[bits(2)]
    _3: u8,
}

/// Component section: flash parts and their parameters.
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct ComponentSection {
    pub FLCOMP: FlashParameters,
    pub FLILL0: u32,
    pub FLILL1: u32,
}

/// One FLREG dword: base and limit in 4 KiB units, 13 bits each.
#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FlashRegion {
    #[bits(13)]
    pub base: u16,
    #[bits(3)]
    _0: u8,
    #[bits(13)]
    pub limit: u16,
    #[bits(3)]
    _1: u8,
}

impl FlashRegion {
    /// A region is laid out on flash iff its limit is non-zero.
    pub fn is_present(self) -> bool {
        self.limit() != 0
    }

    pub fn region_offset(self) -> usize {
        (self.base() as usize) * 0x1000
    }

    pub fn region_size(self) -> usize {
        if self.limit() == 0 {
            0
        } else {
            (self.limit() as usize + 1 - self.base() as usize) * 0x1000
        }
    }
}

/// Region section: up to ten FLREGs. The first five exist on every
/// descriptor generation; EC and the last reserved pair are v2-only.
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct RegionSection {
    pub descriptor: FlashRegion,
    pub bios: FlashRegion,
    pub me: FlashRegion,
    pub gbe: FlashRegion,
    pub pdr: FlashRegion,
    pub reserved1: FlashRegion,
    pub reserved2: FlashRegion,
    pub reserved3: FlashRegion,
    pub ec: FlashRegion,
    pub reserved4: FlashRegion,
}

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FlashMasterV1 {
    requester_id: u16,
    pub read_access: u8,
    pub write_access: u8,
}

impl FlashMasterV1 {
    pub fn can_read(self, region_bit: u16) -> bool {
        (self.read_access() as u16) & region_bit != 0
    }
    pub fn can_write(self, region_bit: u16) -> bool {
        (self.write_access() as u16) & region_bit != 0
    }
}

/// Skylake and later master dword: 12-bit read and write access fields.
#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FlashMasterV2 {
    #[bits(8)]
    _0: u8,
    #[bits(12)]
    pub read_access: u16,
    #[bits(12)]
    pub write_access: u16,
}

impl FlashMasterV2 {
    pub fn can_read(self, region_bit: u16) -> bool {
        self.read_access() & region_bit != 0
    }
    pub fn can_write(self, region_bit: u16) -> bool {
        self.write_access() & region_bit != 0
    }
}

/// Upper map, pointing at the VSCC table.
#[derive(Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct UpperMap {
    pub VTBA: u8,
    pub VTL: u8,
    pub reserved: u16,
}

impl UpperMap {
    pub fn vscc_table_offset(self) -> usize {
        (self.VTBA as usize) << 4
    }

    /// Entry count: VTL counts dwords, an entry is two dwords.
    pub fn vscc_table_entries(self) -> usize {
        (self.VTL as usize) / 2
    }
}

#[derive(Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct VsccTableEntry {
    pub vendor_id: u8,
    pub device_id0: u8,
    pub device_id1: u8,
    pub reserved: u8,
    pub vscc_register_value: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_math_uses_4k_units() {
        let region = FlashRegion::new().with_base(0x400).with_limit(0x7FF);
        assert!(region.is_present());
        assert_eq!(region.region_offset(), 0x40_0000);
        assert_eq!(region.region_size(), 0x40_0000);
    }

    #[test]
    fn absent_region_has_zero_size() {
        let region = FlashRegion::new().with_base(0x123).with_limit(0);
        assert!(!region.is_present());
        assert_eq!(region.region_size(), 0);
    }

    #[test]
    fn map_bases_expand_by_16() {
        let flmap0 = FLMAP0::new().with_FCBA(0x03).with_FRBA(0x04).with_NR(4);
        assert_eq!(flmap0.component_offset(), 0x30);
        assert_eq!(flmap0.region_offset(), 0x40);
        assert_eq!(flmap0.number_of_regions(), 5);
    }

    #[test]
    fn master_access_bits() {
        let master = FlashMasterV1::new()
            .with_read_access(0x0B)
            .with_write_access(0x0A);
        assert!(master.can_read(REGION_ACCESS_DESC));
        assert!(master.can_read(REGION_ACCESS_BIOS));
        assert!(!master.can_read(REGION_ACCESS_ME));
        assert!(master.can_write(REGION_ACCESS_GBE));
        assert!(!master.can_write(REGION_ACCESS_DESC));
    }
}
