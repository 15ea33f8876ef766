#![doc = include_str!("../README.md")]

use core::fmt::{self, Display};

use serde::{Deserialize, Serialize};

pub mod decomp;
pub mod descriptor;
pub mod ffs;
pub mod fit;
pub mod guid;
pub mod parser;
pub mod pe;
pub mod tree;
pub mod ver;

pub use parser::FfsParser;
pub use tree::{ItemId, ItemType, TreeModel};

/// Minimum input size: anything smaller cannot even hold a capsule header.
pub const MIN_IMAGE_SIZE: usize = 28;

/// Terminal status of a parse sub-operation. The top-level parse may still
/// leave a usable partial tree behind one of these.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidParameter,
    InvalidCapsule,
    InvalidFlashDescriptor,
    InvalidVolume,
    InvalidFile,
    InvalidSection,
    InvalidFit,
    InvalidMicrocode,
    InvalidAcm,
    InvalidBgKeyManifest,
    InvalidBgBootPolicy,
    InvalidRegion,
    TruncatedImage,
    VolumesNotFound,
    EmptyRegion,
    DecompressionFailed,
    DepexParseFailed,
    ElementsNotFound,
    UnknownItemType,
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ParseError::InvalidParameter => "invalid parameter",
            ParseError::InvalidCapsule => "invalid capsule",
            ParseError::InvalidFlashDescriptor => "invalid flash descriptor",
            ParseError::InvalidVolume => "invalid volume",
            ParseError::InvalidFile => "invalid file",
            ParseError::InvalidSection => "invalid section",
            ParseError::InvalidFit => "invalid FIT",
            ParseError::InvalidMicrocode => "invalid microcode",
            ParseError::InvalidAcm => "invalid ACM",
            ParseError::InvalidBgKeyManifest => "invalid Boot Guard key manifest",
            ParseError::InvalidBgBootPolicy => "invalid Boot Guard boot policy",
            ParseError::InvalidRegion => "invalid region",
            ParseError::TruncatedImage => "truncated image",
            ParseError::VolumesNotFound => "volumes not found",
            ParseError::EmptyRegion => "empty region",
            ParseError::DecompressionFailed => "decompression failed",
            ParseError::DepexParseFailed => "dependency expression parsing failed",
            ParseError::ElementsNotFound => "elements not found",
            ParseError::UnknownItemType => "unknown item type",
        };
        write!(f, "{text}")
    }
}

impl std::error::Error for ParseError {}

/// One entry of the ordered parser log. Advisory conditions land here and
/// parsing continues; structural failures land here right before the
/// matching [`ParseError`] is returned upward.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Diagnostic {
    pub item: Option<ItemId>,
    pub message: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
