//! Common struct for version information
//!
//! This layout occurs in several firmware structures; the ME region stores
//! it behind a version signature.

use core::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub bugfix: u16,
    pub build: u16,
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Version {
            major,
            minor,
            bugfix,
            build,
        } = self;
        write!(f, "{major}.{minor}.{bugfix}.{build}")
    }
}

/// ME firmware version signature, new generations.
pub const ME_VERSION_SIGNATURE2: &[u8; 4] = b"$MN2";
/// ME firmware version signature, old generations.
pub const ME_VERSION_SIGNATURE: &[u8; 4] = b"$MAN";

/// Version record found behind `$MN2`/`$MAN` inside the ME region.
#[derive(
    Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug,
)]
#[repr(C)]
pub struct MeVersion {
    pub signature: [u8; 4],
    pub reserved: u32,
    pub version: Version,
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromBytes;

    #[test]
    fn me_version_reads_behind_signature() {
        let mut raw = Vec::new();
        raw.extend_from_slice(ME_VERSION_SIGNATURE2);
        raw.extend_from_slice(&0u32.to_le_bytes());
        for v in [11u16, 8, 50, 3425] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        let (mv, _) = MeVersion::read_from_prefix(&raw).unwrap();
        assert_eq!(mv.version.to_string(), "11.8.50.3425");
    }
}
