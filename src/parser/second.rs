//! Second pass: physical memory addresses, TE image classification.
//!
//! The last byte of the last Volume Top File is mapped to physical
//! 0xFFFFFFFF, which pins every non-compressed element's address as a
//! rigid translation of its buffer offset.

use crate::parser::FfsParser;
use crate::tree::{ItemId, ItemType, ParsingData, TeBaseKind};
use crate::ffs::EFI_SECTION_TE;
use crate::ParseError;

impl<'a> FfsParser<'a> {
    pub(crate) fn perform_second_pass(&mut self) -> Result<(), ParseError> {
        let Some(last_vtf) = self.last_vtf else {
            return Err(ParseError::InvalidParameter);
        };

        if self.model.compressed(last_vtf) {
            self.msg(
                Some(last_vtf),
                "performSecondPass: the last VTF appears inside compressed item, the image may be damaged",
            );
            return Ok(());
        }

        let vtf_size = self.model.full_size(last_vtf) as u64;
        let vtf_offset = self.model.offset(last_vtf) as u64;
        self.address_diff = 0xFFFF_FFFFu64 - vtf_offset - vtf_size + 1;

        let diff = self.address_diff;
        self.add_memory_addresses_recursive(self.model.root(), diff);

        // FIT and protected ranges need the addresses computed above. A
        // damaged FIT is already on record; it must not hide the rest.
        let _ = self.parse_fit();
        self.parse_vendor_hash_files();
        self.validate_protected_ranges();

        Ok(())
    }

    /// Prepend the buffer offset to each reachable item's info. Offsets of
    /// items buried under a compressed boundary are relative to their
    /// decompressed stream and are only shown one level deep.
    pub(crate) fn add_offsets_recursive(&mut self, item: ItemId) {
        let compressed = self.model.compressed(item);
        let parent_compressed = self
            .model
            .parent(item)
            .map(|parent| self.model.compressed(parent))
            .unwrap_or(false);
        if !compressed || !parent_compressed {
            let offset = self.model.offset(item);
            if self.model.item_type(item) != ItemType::Root {
                self.model
                    .add_info_front(item, &format!("Offset: {offset:X}h\n"));
            }
        }

        for row in 0..self.model.row_count(item) {
            let child = self.model.child(item, row).unwrap();
            self.add_offsets_recursive(child);
        }
    }

    /// Append the final Compressed/Fixed state to each item's info; runs
    /// after the FIT pass so fixed flags are settled.
    pub(crate) fn add_flags_info_recursive(&mut self, item: ItemId) {
        if self.model.item_type(item) != ItemType::Root {
            let compressed = if self.model.compressed(item) { "Yes" } else { "No" };
            let fixed = if self.model.fixed(item) { "Yes" } else { "No" };
            self.model.add_info(item, &format!("\nCompressed: {compressed}"));
            self.model.add_info(item, &format!("\nFixed: {fixed}"));
        }

        for row in 0..self.model.row_count(item) {
            let child = self.model.child(item, row).unwrap();
            self.add_flags_info_recursive(child);
        }
    }

    fn add_memory_addresses_recursive(&mut self, item: ItemId, diff: u64) {
        if self.model.item_type(item) != ItemType::Root && !self.model.compressed(item) {
            let offset = self.model.offset(item) as u64;
            let address = diff + offset;
            if address <= 0xFFFF_FFFF {
                self.model.set_address(item, address);
                let header_size = self.model.header(item).len as u64;
                if header_size != 0 {
                    self.model.add_info(
                        item,
                        &format!(
                            "\nHeader memory address: {address:08X}h\nData memory address: {:08X}h",
                            address + header_size
                        ),
                    );
                } else {
                    self.model
                        .add_info(item, &format!("\nMemory address: {address:08X}h"));
                }

                // Classify uncompressed TE images by their stored base.
                if self.model.item_type(item) == ItemType::Section
                    && self.model.subtype(item) == EFI_SECTION_TE
                {
                    if let ParsingData::TeImageSection(te_data) =
                        self.model.parsing_data(item).clone()
                    {
                        let data_address = address + header_size;
                        let base_kind = classify_te_base(
                            te_data.image_base,
                            te_data.adjusted_image_base,
                            data_address,
                        );
                        if base_kind == TeBaseKind::Other {
                            self.msg(
                                Some(item),
                                "addMemoryAddressesRecursive: image base is neither original nor adjusted, it's likely a part of backup PEI volume or DXE volume, but can also be damaged",
                            );
                        }
                        self.model.set_parsing_data(
                            item,
                            ParsingData::TeImageSection(crate::tree::TeImageSectionParsingData {
                                base_kind,
                                ..te_data
                            }),
                        );
                    }
                }
            }
        }

        for row in 0..self.model.row_count(item) {
            let child = self.model.child(item, row).unwrap();
            self.add_memory_addresses_recursive(child, diff);
        }
    }
}

/// Match a TE base against the section's data address. A single flipped
/// bit still matches, which catches top-swapped backup volumes.
fn classify_te_base(image_base: u64, adjusted_image_base: u64, data_address: u64) -> TeBaseKind {
    let near = |base: u64| {
        let xor = base ^ data_address;
        xor == 0 || xor.count_ones() == 1
    };
    if image_base == data_address {
        TeBaseKind::Original
    } else if adjusted_image_base == data_address {
        TeBaseKind::Adjusted
    } else if near(image_base) {
        TeBaseKind::Original
    } else if near(adjusted_image_base) {
        TeBaseKind::Adjusted
    } else {
        TeBaseKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn te_base_classification() {
        assert_eq!(
            classify_te_base(0xFFF0_1000, 0xFFF0_2000, 0xFFF0_1000),
            TeBaseKind::Original
        );
        assert_eq!(
            classify_te_base(0xFFF0_1000, 0xFFF0_2000, 0xFFF0_2000),
            TeBaseKind::Adjusted
        );
        // One-bit difference tolerated for top-swapped volumes.
        assert_eq!(
            classify_te_base(0xFFF0_1000, 0, 0xFFF0_1000 ^ 0x0008_0000),
            TeBaseKind::Original
        );
        assert_eq!(
            classify_te_base(0xFFF0_1000, 0xFFF0_2000, 0x1234_5678),
            TeBaseKind::Other
        );
    }
}
