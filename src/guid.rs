//! EFI GUID value type.
//!
//! GUIDs name almost everything inside a firmware image: filesystems,
//! files, GUID-defined sections, capsule formats. The on-flash layout is
//! the mixed-endian EFI registry format (little-endian first three fields).

use core::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
    PartialEq, Eq, Hash,
)]
#[repr(C)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const SIZE: usize = 16;

    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// Read a GUID from the first 16 bytes of a slice.
    pub fn read(data: &[u8]) -> Option<Self> {
        use zerocopy::FromBytes;
        Self::read_from_prefix(data).ok().map(|(guid, _)| guid)
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7]
        )
    }
}

/// Display names for files whose GUID alone tells their role.
static KNOWN_FILE_NAMES: phf::Map<&'static str, &'static str> = phf::phf_map! {
    "1BA0062E-C779-4582-8566-336AE8F78F09" => "Volume Top File",
    "1B45CC0A-156A-428A-AF62-49864DA0E6E6" => "PEI apriori file",
    "FC510EE7-FFDC-11D4-BD41-0080C73C8881" => "DXE apriori file",
    "CEF5B9A3-476D-497F-9FDC-E98143E0422C" => "NVAR store",
    "D6A2CB7F-6A18-4E2F-B43B-9920A733700A" => "DXE core",
    "389CC6F2-1EA8-467B-AB8A-78E769AE2A15" => "Phoenix vendor hash file",
    "CBC91F44-A4BC-4A5B-8696-703451D0B053" => "AMI vendor hash file",
};

/// Well-known display name for a file GUID, if any.
pub fn known_file_name(guid: &Guid) -> Option<&'static str> {
    KNOWN_FILE_NAMES.get(guid.to_string().as_str()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_registry_format() {
        let guid = Guid::new(
            0x8C8CE578,
            0x8A3D,
            0x4F1C,
            [0x99, 0x35, 0x89, 0x61, 0x85, 0xC3, 0x2D, 0xD3],
        );
        assert_eq!(guid.to_string(), "8C8CE578-8A3D-4F1C-9935-896185C32DD3");
    }

    #[test]
    fn read_is_little_endian_in_first_fields() {
        let bytes = [
            0x78, 0xE5, 0x8C, 0x8C, 0x3D, 0x8A, 0x1C, 0x4F, 0x99, 0x35, 0x89, 0x61, 0x85, 0xC3,
            0x2D, 0xD3,
        ];
        let guid = Guid::read(&bytes).unwrap();
        assert_eq!(guid.data1, 0x8C8CE578);
        assert_eq!(guid.data2, 0x8A3D);
        assert_eq!(guid.data3, 0x4F1C);
    }

    #[test]
    fn known_names_resolve() {
        let vtf = Guid::new(
            0x1BA0062E,
            0xC779,
            0x4582,
            [0x85, 0x66, 0x33, 0x6A, 0xE8, 0xF7, 0x8F, 0x09],
        );
        assert_eq!(known_file_name(&vtf), Some("Volume Top File"));
    }
}
