//! Arena tree model for parsed image elements.
//!
//! Items live in one flat vector and refer to each other through 32-bit
//! indices; children are kept in insertion order, which the parser
//! guarantees to be ascending offset order. Byte content is never copied
//! per item: a [`ByteSlice`] points either into the caller's input image
//! or into one of the owned decompressed payload buffers pooled here.

use serde::{Deserialize, Serialize};

use crate::guid::Guid;
use crate::ParseError;

/// Stable handle of an item in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(pub u32);

/// Backing buffer 0 is the input image; higher ids are decompressed payloads.
pub const IMAGE_BUFFER: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteSlice {
    pub buffer: u32,
    pub start: usize,
    pub len: usize,
}

impl ByteSlice {
    pub const EMPTY: ByteSlice = ByteSlice {
        buffer: IMAGE_BUFFER,
        start: 0,
        len: 0,
    };

    pub fn new(buffer: u32, start: usize, len: usize) -> Self {
        Self { buffer, start, len }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sub-slice relative to this slice's start.
    pub fn sub(&self, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= self.len);
        Self {
            buffer: self.buffer,
            start: self.start + offset,
            len,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemType {
    Root,
    Capsule,
    Image,
    Region,
    Padding,
    Volume,
    File,
    Section,
    FreeSpace,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Root => "Root",
            ItemType::Capsule => "Capsule",
            ItemType::Image => "Image",
            ItemType::Region => "Region",
            ItemType::Padding => "Padding",
            ItemType::Volume => "Volume",
            ItemType::File => "File",
            ItemType::Section => "Section",
            ItemType::FreeSpace => "Free space",
        }
    }
}

// Kind-specific subtypes, stored as the raw byte an item carries.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageSubtype {
    Intel = 0,
    Uefi,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CapsuleSubtype {
    Uefi = 0,
    Toshiba,
    AptioSigned,
    AptioUnsigned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum VolumeSubtype {
    Unknown = 0,
    Ffs2,
    Ffs3,
    Nvram,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionSubtype {
    Descriptor = 0,
    Bios,
    Me,
    Gbe,
    Pdr,
    Reserved1,
    Reserved2,
    Reserved3,
    Ec,
    Reserved4,
}

impl RegionSubtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionSubtype::Descriptor => "Descriptor",
            RegionSubtype::Bios => "BIOS",
            RegionSubtype::Me => "ME",
            RegionSubtype::Gbe => "GbE",
            RegionSubtype::Pdr => "PDR",
            RegionSubtype::Reserved1 => "Reserved1",
            RegionSubtype::Reserved2 => "Reserved2",
            RegionSubtype::Reserved3 => "Reserved3",
            RegionSubtype::Ec => "EC",
            RegionSubtype::Reserved4 => "Reserved4",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PaddingSubtype {
    Zero = 0,
    One,
    Data,
}

/// Colour tag visualising protected-range coverage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Marking {
    None,
    /// Fully inside a Boot Guard IBB range.
    BootGuard,
    /// Fully inside a vendor-hash protected range.
    VendorHash,
    /// Overlaps a protected range without being contained in it.
    Partial,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeBaseKind {
    Unknown,
    Original,
    Adjusted,
    Other,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeParsingData {
    pub empty_byte: u8,
    pub ffs_version: u8,
    pub alignment: u32,
    pub revision: u8,
    pub extended_header_guid: Option<Guid>,
    pub has_apple_crc32: bool,
    pub used_space: u32,
    pub has_valid_used_space: bool,
    pub is_weak_aligned: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileParsingData {
    pub guid: Guid,
    pub empty_byte: u8,
    pub has_tail: bool,
    pub tail: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompressedSectionParsingData {
    pub compression_type: u8,
    pub uncompressed_size: u32,
    pub algorithm: crate::decomp::CompressionAlgorithm,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GuidedSectionParsingData {
    pub guid: Guid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FreeformGuidedSectionParsingData {
    pub guid: Guid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TeImageSectionParsingData {
    pub image_base: u64,
    pub adjusted_image_base: u64,
    pub base_kind: TeBaseKind,
}

/// Parser-private state attached to an item, dispatched by tag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ParsingData {
    None,
    Volume(VolumeParsingData),
    File(FileParsingData),
    CompressedSection(CompressedSectionParsingData),
    GuidedSection(GuidedSectionParsingData),
    FreeformGuidedSection(FreeformGuidedSectionParsingData),
    TeImageSection(TeImageSectionParsingData),
}

#[derive(Clone, Debug)]
pub struct TreeItem {
    pub(crate) item_type: ItemType,
    pub(crate) subtype: u8,
    pub(crate) name: String,
    pub(crate) text: String,
    pub(crate) info: String,
    pub(crate) offset: usize,
    pub(crate) header: ByteSlice,
    pub(crate) body: ByteSlice,
    pub(crate) tail: ByteSlice,
    pub(crate) fixed: bool,
    pub(crate) compressed: bool,
    pub(crate) marking: Marking,
    pub(crate) address: Option<u64>,
    pub(crate) parsing_data: ParsingData,
    pub(crate) parent: Option<ItemId>,
    pub(crate) children: Vec<ItemId>,
}

pub struct TreeModel<'a> {
    image: &'a [u8],
    buffers: Vec<Vec<u8>>,
    items: Vec<TreeItem>,
}

impl<'a> TreeModel<'a> {
    pub fn new(image: &'a [u8]) -> Self {
        let root = TreeItem {
            item_type: ItemType::Root,
            subtype: 0,
            name: String::new(),
            text: String::new(),
            info: String::new(),
            offset: 0,
            header: ByteSlice::EMPTY,
            body: ByteSlice::EMPTY,
            tail: ByteSlice::EMPTY,
            fixed: false,
            compressed: false,
            marking: Marking::None,
            address: None,
            parsing_data: ParsingData::None,
            parent: None,
            children: Vec::new(),
        };
        Self {
            image,
            buffers: Vec::new(),
            items: vec![root],
        }
    }

    pub fn root(&self) -> ItemId {
        ItemId(0)
    }

    /// Register a decompressed payload and get its buffer id.
    pub fn add_buffer(&mut self, data: Vec<u8>) -> u32 {
        self.buffers.push(data);
        self.buffers.len() as u32
    }

    pub fn bytes(&self, slice: ByteSlice) -> &[u8] {
        let backing: &[u8] = if slice.buffer == IMAGE_BUFFER {
            self.image
        } else {
            &self.buffers[(slice.buffer - 1) as usize]
        };
        &backing[slice.start..slice.start + slice.len]
    }

    pub fn buffer_len(&self, buffer: u32) -> usize {
        if buffer == IMAGE_BUFFER {
            self.image.len()
        } else {
            self.buffers[(buffer - 1) as usize].len()
        }
    }

    fn get(&self, id: ItemId) -> Option<&TreeItem> {
        self.items.get(id.0 as usize)
    }

    fn get_mut(&mut self, id: ItemId) -> Option<&mut TreeItem> {
        self.items.get_mut(id.0 as usize)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_item(
        &mut self,
        parent: ItemId,
        offset: usize,
        item_type: ItemType,
        subtype: u8,
        name: impl Into<String>,
        text: impl Into<String>,
        info: impl Into<String>,
        header: ByteSlice,
        body: ByteSlice,
        tail: ByteSlice,
        fixed: bool,
    ) -> Result<ItemId, ParseError> {
        let compressed = match self.get(parent) {
            Some(item) => item.compressed,
            None => return Err(ParseError::InvalidParameter),
        };
        let id = ItemId(self.items.len() as u32);
        self.items.push(TreeItem {
            item_type,
            subtype,
            name: name.into(),
            text: text.into(),
            info: info.into(),
            offset,
            header,
            body,
            tail,
            fixed,
            compressed,
            marking: Marking::None,
            address: None,
            parsing_data: ParsingData::None,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.items[parent.0 as usize].children.push(id);
        if fixed {
            self.propagate_fixed(id);
        }
        Ok(id)
    }

    /// Walk up from a fixed item making ancestors fixed. Propagation stops
    /// at a compressed boundary: a compressed container's position does not
    /// depend on where its payload content sits.
    fn propagate_fixed(&mut self, id: ItemId) {
        let mut current = id;
        while let Some(parent) = self.items[current.0 as usize].parent {
            let child_compressed = self.items[current.0 as usize].compressed;
            let parent_compressed = self.items[parent.0 as usize].compressed;
            if child_compressed && !parent_compressed {
                break;
            }
            if self.items[parent.0 as usize].fixed {
                break;
            }
            self.items[parent.0 as usize].fixed = true;
            current = parent;
        }
    }

    // Queries

    pub fn item_type(&self, id: ItemId) -> ItemType {
        self.items[id.0 as usize].item_type
    }

    pub fn subtype(&self, id: ItemId) -> u8 {
        self.items[id.0 as usize].subtype
    }

    pub fn offset(&self, id: ItemId) -> usize {
        self.items[id.0 as usize].offset
    }

    pub fn name(&self, id: ItemId) -> &str {
        &self.items[id.0 as usize].name
    }

    pub fn text(&self, id: ItemId) -> &str {
        &self.items[id.0 as usize].text
    }

    pub fn info(&self, id: ItemId) -> &str {
        &self.items[id.0 as usize].info
    }

    pub fn header(&self, id: ItemId) -> ByteSlice {
        self.items[id.0 as usize].header
    }

    pub fn body(&self, id: ItemId) -> ByteSlice {
        self.items[id.0 as usize].body
    }

    pub fn tail(&self, id: ItemId) -> ByteSlice {
        self.items[id.0 as usize].tail
    }

    /// header + body + tail length.
    pub fn full_size(&self, id: ItemId) -> usize {
        let item = &self.items[id.0 as usize];
        item.header.len + item.body.len + item.tail.len
    }

    pub fn fixed(&self, id: ItemId) -> bool {
        self.items[id.0 as usize].fixed
    }

    pub fn compressed(&self, id: ItemId) -> bool {
        self.items[id.0 as usize].compressed
    }

    pub fn marking(&self, id: ItemId) -> Marking {
        self.items[id.0 as usize].marking
    }

    pub fn address(&self, id: ItemId) -> Option<u64> {
        self.items[id.0 as usize].address
    }

    pub fn parsing_data(&self, id: ItemId) -> &ParsingData {
        &self.items[id.0 as usize].parsing_data
    }

    pub fn row_count(&self, id: ItemId) -> usize {
        self.items[id.0 as usize].children.len()
    }

    pub fn child(&self, id: ItemId, row: usize) -> Option<ItemId> {
        self.items[id.0 as usize].children.get(row).copied()
    }

    pub fn parent(&self, id: ItemId) -> Option<ItemId> {
        self.items[id.0 as usize].parent
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Nearest ancestor of the given type.
    pub fn find_parent_of_type(&self, id: ItemId, item_type: ItemType) -> Option<ItemId> {
        let mut current = self.parent(id)?;
        loop {
            if self.item_type(current) == item_type {
                return Some(current);
            }
            current = self.parent(current)?;
        }
    }

    /// Furthest ancestor of the given type.
    pub fn find_last_parent_of_type(&self, id: ItemId, item_type: ItemType) -> Option<ItemId> {
        let mut found = None;
        let mut current = self.parent(id);
        while let Some(item) = current {
            if self.item_type(item) == item_type {
                found = Some(item);
            }
            current = self.parent(item);
        }
        found
    }

    /// Deepest non-compressed item whose bytes contain the given image
    /// offset.
    pub fn find_by_offset(&self, offset: usize) -> Option<ItemId> {
        let mut current = self.root();
        let mut found = None;
        'descend: loop {
            for row in 0..self.row_count(current) {
                let child = self.child(current, row).unwrap();
                if self.compressed(child) || self.header(child).buffer != IMAGE_BUFFER {
                    continue;
                }
                let start = self.offset(child);
                let end = start + self.full_size(child);
                if (start..end).contains(&offset) {
                    found = Some(child);
                    current = child;
                    continue 'descend;
                }
            }
            return found;
        }
    }

    // Mutators

    pub fn set_name(&mut self, id: ItemId, name: impl Into<String>) {
        if let Some(item) = self.get_mut(id) {
            item.name = name.into();
        }
    }

    pub fn set_text(&mut self, id: ItemId, text: impl Into<String>) {
        if let Some(item) = self.get_mut(id) {
            item.text = text.into();
        }
    }

    pub fn add_text(&mut self, id: ItemId, text: &str) {
        if let Some(item) = self.get_mut(id) {
            item.text.push_str(text);
        }
    }

    pub fn add_info(&mut self, id: ItemId, info: &str) {
        if let Some(item) = self.get_mut(id) {
            item.info.push_str(info);
        }
    }

    pub fn add_info_front(&mut self, id: ItemId, info: &str) {
        if let Some(item) = self.get_mut(id) {
            item.info.insert_str(0, info);
        }
    }

    pub fn set_parsing_data(&mut self, id: ItemId, data: ParsingData) {
        if let Some(item) = self.get_mut(id) {
            item.parsing_data = data;
        }
    }

    pub fn set_compressed(&mut self, id: ItemId, compressed: bool) {
        if let Some(item) = self.get_mut(id) {
            item.compressed = compressed;
        }
    }

    pub fn set_fixed(&mut self, id: ItemId, fixed: bool) {
        if let Some(item) = self.get_mut(id) {
            item.fixed = fixed;
            if fixed {
                self.propagate_fixed(id);
            }
        }
    }

    pub fn set_marking(&mut self, id: ItemId, marking: Marking) {
        if let Some(item) = self.get_mut(id) {
            item.marking = marking;
        }
    }

    pub fn set_address(&mut self, id: ItemId, address: u64) {
        if let Some(item) = self.get_mut(id) {
            item.address = Some(address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_with(image: &[u8]) -> TreeModel<'_> {
        TreeModel::new(image)
    }

    #[test]
    fn add_item_rejects_missing_parent() {
        let image = [0u8; 16];
        let mut model = model_with(&image);
        let result = model.add_item(
            ItemId(99),
            0,
            ItemType::Image,
            0,
            "x",
            "",
            "",
            ByteSlice::EMPTY,
            ByteSlice::EMPTY,
            ByteSlice::EMPTY,
            false,
        );
        assert!(matches!(result, Err(ParseError::InvalidParameter)));
    }

    #[test]
    fn fixed_propagates_to_ancestors() {
        let image = [0u8; 64];
        let mut model = model_with(&image);
        let root = model.root();
        let image_item = model
            .add_item(
                root,
                0,
                ItemType::Image,
                ImageSubtype::Uefi as u8,
                "image",
                "",
                "",
                ByteSlice::EMPTY,
                ByteSlice::new(IMAGE_BUFFER, 0, 64),
                ByteSlice::EMPTY,
                false,
            )
            .unwrap();
        let volume = model
            .add_item(
                image_item,
                0,
                ItemType::Volume,
                VolumeSubtype::Ffs2 as u8,
                "volume",
                "",
                "",
                ByteSlice::new(IMAGE_BUFFER, 0, 8),
                ByteSlice::new(IMAGE_BUFFER, 8, 56),
                ByteSlice::EMPTY,
                false,
            )
            .unwrap();
        let file = model
            .add_item(
                volume,
                8,
                ItemType::File,
                0x07,
                "file",
                "",
                "",
                ByteSlice::new(IMAGE_BUFFER, 8, 24),
                ByteSlice::new(IMAGE_BUFFER, 32, 32),
                ByteSlice::EMPTY,
                true,
            )
            .unwrap();
        assert!(model.fixed(file));
        assert!(model.fixed(volume));
        assert!(model.fixed(image_item));
    }

    #[test]
    fn fixed_stops_at_compressed_boundary() {
        let image = [0u8; 64];
        let mut model = model_with(&image);
        let root = model.root();
        let section = model
            .add_item(
                root,
                0,
                ItemType::Section,
                0x01,
                "compressed",
                "",
                "",
                ByteSlice::new(IMAGE_BUFFER, 0, 9),
                ByteSlice::new(IMAGE_BUFFER, 9, 55),
                ByteSlice::EMPTY,
                false,
            )
            .unwrap();
        model.set_compressed(section, true);
        let inner = model
            .add_item(
                section,
                0,
                ItemType::Section,
                0x19,
                "raw",
                "",
                "",
                ByteSlice::new(IMAGE_BUFFER, 9, 4),
                ByteSlice::new(IMAGE_BUFFER, 13, 10),
                ByteSlice::EMPTY,
                false,
            )
            .unwrap();
        model.set_fixed(inner, true);
        // inner is compressed (inherited), section's parent (root) is not,
        // but section itself carries the flag stop: root stays movable.
        assert!(model.fixed(inner));
        assert!(model.fixed(section));
        assert!(!model.fixed(model.root()));
    }

    #[test]
    fn parent_lookups() {
        let image = [0u8; 64];
        let mut model = model_with(&image);
        let root = model.root();
        let outer = model
            .add_item(
                root,
                0,
                ItemType::Volume,
                VolumeSubtype::Ffs2 as u8,
                "outer",
                "",
                "",
                ByteSlice::EMPTY,
                ByteSlice::new(IMAGE_BUFFER, 0, 64),
                ByteSlice::EMPTY,
                false,
            )
            .unwrap();
        let file = model
            .add_item(
                outer,
                0,
                ItemType::File,
                0x0B,
                "file",
                "",
                "",
                ByteSlice::new(IMAGE_BUFFER, 0, 24),
                ByteSlice::new(IMAGE_BUFFER, 24, 40),
                ByteSlice::EMPTY,
                false,
            )
            .unwrap();
        let inner = model
            .add_item(
                file,
                24,
                ItemType::Volume,
                VolumeSubtype::Ffs2 as u8,
                "inner",
                "",
                "",
                ByteSlice::EMPTY,
                ByteSlice::new(IMAGE_BUFFER, 24, 40),
                ByteSlice::EMPTY,
                false,
            )
            .unwrap();
        let section = model
            .add_item(
                inner,
                24,
                ItemType::Section,
                0x19,
                "raw",
                "",
                "",
                ByteSlice::new(IMAGE_BUFFER, 24, 4),
                ByteSlice::new(IMAGE_BUFFER, 28, 16),
                ByteSlice::EMPTY,
                false,
            )
            .unwrap();
        assert_eq!(
            model.find_parent_of_type(section, ItemType::Volume),
            Some(inner)
        );
        assert_eq!(
            model.find_last_parent_of_type(section, ItemType::Volume),
            Some(outer)
        );
        assert_eq!(model.find_parent_of_type(section, ItemType::File), Some(file));
    }

    #[test]
    fn find_by_offset_returns_deepest_item() {
        let image = [0u8; 64];
        let mut model = model_with(&image);
        let root = model.root();
        let volume = model
            .add_item(
                root,
                0,
                ItemType::Volume,
                VolumeSubtype::Ffs2 as u8,
                "volume",
                "",
                "",
                ByteSlice::new(IMAGE_BUFFER, 0, 8),
                ByteSlice::new(IMAGE_BUFFER, 8, 56),
                ByteSlice::EMPTY,
                false,
            )
            .unwrap();
        let file = model
            .add_item(
                volume,
                8,
                ItemType::File,
                0x07,
                "file",
                "",
                "",
                ByteSlice::new(IMAGE_BUFFER, 8, 24),
                ByteSlice::new(IMAGE_BUFFER, 32, 16),
                ByteSlice::EMPTY,
                false,
            )
            .unwrap();
        assert_eq!(model.find_by_offset(40), Some(file));
        assert_eq!(model.find_by_offset(50), Some(volume));
        assert_eq!(model.find_by_offset(70), None);
    }
}
