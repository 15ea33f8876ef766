//! Decompression service for encapsulated section payloads.
//!
//! Standard EFI compression is ambiguous on flash: the same tag covers the
//! EFI 1.1 and the Tiano (PI 1.1) encodings, which differ only in the
//! position-code bit width. Both decoders run on every standard stream;
//! when both produce output the caller resolves the tie by dry-run parsing
//! the candidates. Customized compression is LZMA, optionally behind the
//! x86 branch-call filter or an Intel legacy 4-byte prefix.

use core::fmt::{self, Display};
use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::ffs::{EFI_CUSTOMIZED_COMPRESSION, EFI_STANDARD_COMPRESSION, NOT_COMPRESSED};
use crate::ParseError;

/// Internal tag for LZMA with the x86 branch-call filter (selected by the
/// GUID of a GUID-defined section, never stored on flash).
pub const EFI_CUSTOMIZED_COMPRESSION_LZMAF86: u8 = 0x86;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    Efi11,
    Tiano,
    /// Both standard decoders succeeded with different output; the caller
    /// must pick by parsing the candidates.
    Undecided,
    Lzma,
    LzmaF86,
    Unknown,
}

impl Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionAlgorithm::None => "None",
            CompressionAlgorithm::Efi11 => "EFI 1.1",
            CompressionAlgorithm::Tiano => "Tiano",
            CompressionAlgorithm::Undecided => "Undecided",
            CompressionAlgorithm::Lzma => "LZMA",
            CompressionAlgorithm::LzmaF86 => "LZMA+x86",
            CompressionAlgorithm::Unknown => "Unknown",
        };
        write!(f, "{name}")
    }
}

pub struct Decompressed {
    pub algorithm: CompressionAlgorithm,
    pub data: Vec<u8>,
    /// Second candidate when the algorithm is undecided.
    pub efi11_data: Option<Vec<u8>>,
}

/// Decompress a section body according to its declared compression type.
pub fn decompress(data: &[u8], declared_type: u8) -> Result<Decompressed, ParseError> {
    match declared_type {
        NOT_COMPRESSED => Ok(Decompressed {
            algorithm: CompressionAlgorithm::None,
            data: data.to_vec(),
            efi11_data: None,
        }),
        EFI_STANDARD_COMPRESSION => {
            let tiano = efi_tiano_decompress(data, 5);
            let efi11 = efi_tiano_decompress(data, 4);
            match (tiano, efi11) {
                (Some(tiano), Some(efi11)) => {
                    if tiano == efi11 {
                        Ok(Decompressed {
                            algorithm: CompressionAlgorithm::Tiano,
                            data: tiano,
                            efi11_data: None,
                        })
                    } else {
                        Ok(Decompressed {
                            algorithm: CompressionAlgorithm::Undecided,
                            data: tiano,
                            efi11_data: Some(efi11),
                        })
                    }
                }
                (Some(tiano), None) => Ok(Decompressed {
                    algorithm: CompressionAlgorithm::Tiano,
                    data: tiano,
                    efi11_data: None,
                }),
                (None, Some(efi11)) => Ok(Decompressed {
                    algorithm: CompressionAlgorithm::Efi11,
                    data: efi11,
                    efi11_data: None,
                }),
                (None, None) => Err(ParseError::DecompressionFailed),
            }
        }
        EFI_CUSTOMIZED_COMPRESSION => {
            // Plain LZMA first, then the Intel legacy variant with a
            // 4-byte prefix before the properties.
            if let Some(out) = lzma_decompress_slice(data) {
                return Ok(Decompressed {
                    algorithm: CompressionAlgorithm::Lzma,
                    data: out,
                    efi11_data: None,
                });
            }
            if data.len() > 4 {
                if let Some(out) = lzma_decompress_slice(&data[4..]) {
                    return Ok(Decompressed {
                        algorithm: CompressionAlgorithm::Lzma,
                        data: out,
                        efi11_data: None,
                    });
                }
            }
            Err(ParseError::DecompressionFailed)
        }
        EFI_CUSTOMIZED_COMPRESSION_LZMAF86 => {
            let mut out = lzma_decompress_slice(data).ok_or(ParseError::DecompressionFailed)?;
            let mut state = 0u32;
            x86_convert(&mut out, 0, &mut state, false);
            Ok(Decompressed {
                algorithm: CompressionAlgorithm::LzmaF86,
                data: out,
                efi11_data: None,
            })
        }
        _ => Err(ParseError::DecompressionFailed),
    }
}

fn lzma_decompress_slice(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 13 {
        return None;
    }
    let mut cursor = Cursor::new(data);
    let mut out = Vec::new();
    lzma_rs::lzma_decompress(&mut cursor, &mut out).ok()?;
    Some(out)
}

// EFI 1.1 / Tiano decompression.
//
// The encoding is LZ77 with canonical Huffman coded literals, lengths and
// positions; a stream starts with a [compressed size: u32][uncompressed
// size: u32] header. The single format parameter is the position-set bit
// width: 4 for EFI 1.1, 5 for Tiano.

const BITBUFSIZ: u16 = 32;
const MAXMATCH: usize = 256;
const THRESHOLD: usize = 3;
const CODE_BIT: usize = 16;
const NT: usize = CODE_BIT + 3;
const NC: usize = 0xFF + MAXMATCH + 2 - THRESHOLD;
const MAXPBIT: usize = 5;
const TBIT: u16 = 5;
const CBIT: u16 = 9;
const MAXNP: usize = (1 << MAXPBIT) - 1;
const NPT: usize = MAXNP;

struct Scratch<'a> {
    src: &'a [u8],
    in_pos: usize,
    comp_size: usize,
    bit_buf: u32,
    sub_bit_buf: u32,
    bit_count: u16,
    block_size: u16,
    bad: bool,
    out: Vec<u8>,
    out_pos: usize,
    orig_size: usize,
    left: Vec<u16>,
    right: Vec<u16>,
    c_len: [u8; NC],
    pt_len: [u8; NPT],
    c_table: Vec<u16>,
    pt_table: [u16; 256],
    pbit: u16,
}

impl<'a> Scratch<'a> {
    fn new(src: &'a [u8], comp_size: usize, orig_size: usize, pbit: u16) -> Self {
        Self {
            src,
            in_pos: 0,
            comp_size,
            bit_buf: 0,
            sub_bit_buf: 0,
            bit_count: 0,
            block_size: 0,
            bad: false,
            out: vec![0u8; orig_size],
            out_pos: 0,
            orig_size,
            left: vec![0u16; 2 * NC - 1],
            right: vec![0u16; 2 * NC - 1],
            c_len: [0u8; NC],
            pt_len: [0u8; NPT],
            c_table: vec![0u16; 4096],
            pt_table: [0u16; 256],
            pbit,
        }
    }

    fn fill_buf(&mut self, num_of_bits: u16) {
        self.bit_buf = if num_of_bits >= 32 {
            0
        } else {
            self.bit_buf << num_of_bits
        };
        let mut remaining = num_of_bits;
        while remaining > self.bit_count {
            remaining -= self.bit_count;
            if remaining < 32 {
                self.bit_buf |= self.sub_bit_buf << remaining;
            }
            if self.comp_size > 0 {
                self.comp_size -= 1;
                self.sub_bit_buf = self.src.get(self.in_pos).copied().unwrap_or(0) as u32;
                self.in_pos += 1;
            } else {
                self.sub_bit_buf = 0;
            }
            self.bit_count = 8;
        }
        self.bit_count -= remaining;
        self.bit_buf |= self.sub_bit_buf >> self.bit_count;
    }

    fn get_bits(&mut self, num_of_bits: u16) -> u32 {
        let out = self.bit_buf >> (BITBUFSIZ - num_of_bits);
        self.fill_buf(num_of_bits);
        out
    }

    fn make_table(
        &mut self,
        num_of_char: usize,
        len_source: LenSource,
        table_bits: u16,
        table: TableKind,
    ) -> bool {
        let bit_len = |scratch: &Self, index: usize| match len_source {
            LenSource::CLen => scratch.c_len[index],
            LenSource::PtLen => scratch.pt_len[index],
        };

        let mut count = [0u16; 17];
        for index in 0..num_of_char {
            let len = bit_len(self, index) as usize;
            if len > 16 {
                return false;
            }
            count[len] += 1;
        }

        // Start offsets accumulate modulo 2^16; a complete code wraps
        // exactly back to zero.
        let mut start = [0u16; 18];
        for index in 1..=16usize {
            start[index + 1] =
                (start[index] as u32 + ((count[index] as u32) << (16 - index))) as u16;
        }
        if start[17] != 0 {
            return false;
        }

        let ju_bits = 16 - table_bits;
        let mut weight = [0u16; 17];
        for index in 1..=(table_bits as usize) {
            start[index] >>= ju_bits;
            weight[index] = 1 << (table_bits as usize - index);
        }
        for index in (table_bits as usize + 1)..=16 {
            weight[index] = 1 << (16 - index);
        }

        let table_size = 1usize << table_bits;
        {
            let index = (start[table_bits as usize + 1] >> ju_bits) as usize;
            if index != 0 && index < table_size {
                for slot in index..table_size {
                    self.set_table(table, slot, 0);
                }
            }
        }

        let mut avail = num_of_char as u16;
        let mask = 1u16 << (15 - table_bits);
        for ch in 0..num_of_char {
            let len = bit_len(self, ch) as usize;
            if len == 0 || len >= 17 {
                continue;
            }
            let next_code = start[len].wrapping_add(weight[len]);
            if len <= table_bits as usize {
                if start[len] >= next_code || next_code as usize > table_size {
                    return false;
                }
                for slot in (start[len] as usize)..(next_code as usize) {
                    self.set_table(table, slot, ch as u16);
                }
            } else {
                let mut index3 = start[len];
                let mut pointer = Pointer::Table(table, (index3 >> ju_bits) as usize);
                let mut depth = len - table_bits as usize;
                while depth > 0 {
                    if self.deref(pointer) == 0 && (avail as usize) < 2 * NC - 1 {
                        self.right[avail as usize] = 0;
                        self.left[avail as usize] = 0;
                        self.set_deref(pointer, avail);
                        avail += 1;
                    }
                    let value = self.deref(pointer);
                    if (value as usize) < 2 * NC - 1 {
                        pointer = if index3 & mask != 0 {
                            Pointer::Right(value as usize)
                        } else {
                            Pointer::Left(value as usize)
                        };
                    }
                    index3 <<= 1;
                    depth -= 1;
                }
                self.set_deref(pointer, ch as u16);
            }
            start[len] = next_code;
        }
        true
    }

    fn set_table(&mut self, table: TableKind, index: usize, value: u16) {
        match table {
            TableKind::CTable => self.c_table[index] = value,
            TableKind::PtTable => self.pt_table[index] = value,
        }
    }

    fn deref(&self, pointer: Pointer) -> u16 {
        match pointer {
            Pointer::Table(TableKind::CTable, index) => self.c_table[index],
            Pointer::Table(TableKind::PtTable, index) => self.pt_table[index],
            Pointer::Left(index) => self.left[index],
            Pointer::Right(index) => self.right[index],
        }
    }

    fn set_deref(&mut self, pointer: Pointer, value: u16) {
        match pointer {
            Pointer::Table(TableKind::CTable, index) => self.c_table[index] = value,
            Pointer::Table(TableKind::PtTable, index) => self.pt_table[index] = value,
            Pointer::Left(index) => self.left[index] = value,
            Pointer::Right(index) => self.right[index] = value,
        }
    }

    fn read_pt_len(&mut self, nn: usize, nbit: u16, special: Option<usize>) -> bool {
        let number = self.get_bits(nbit) as usize;
        if number == 0 {
            let char_c = self.get_bits(nbit) as u16;
            self.pt_table = [char_c; 256];
            for len in self.pt_len.iter_mut().take(nn) {
                *len = 0;
            }
            return true;
        }
        if number > NPT {
            return false;
        }
        let mut index = 0usize;
        while index < number {
            let mut char_c = (self.bit_buf >> (BITBUFSIZ - 3)) as u16;
            if char_c == 7 {
                let mut mask = 1u32 << (BITBUFSIZ - 1 - 3);
                while mask & self.bit_buf != 0 {
                    mask >>= 1;
                    char_c += 1;
                }
            }
            self.fill_buf(if char_c < 7 { 3 } else { char_c - 3 });
            if index >= NPT {
                return false;
            }
            self.pt_len[index] = char_c as u8;
            index += 1;
            if Some(index) == special {
                let mut skip = self.get_bits(2) as i32;
                skip -= 1;
                while skip >= 0 && index < NPT {
                    self.pt_len[index] = 0;
                    index += 1;
                    skip -= 1;
                }
            }
        }
        while index < nn && index < NPT {
            self.pt_len[index] = 0;
            index += 1;
        }
        self.make_table(nn, LenSource::PtLen, 8, TableKind::PtTable)
    }

    fn read_c_len(&mut self) -> bool {
        let number = self.get_bits(CBIT) as usize;
        if number == 0 {
            let char_c = self.get_bits(CBIT) as u16;
            self.c_len = [0u8; NC];
            for slot in self.c_table.iter_mut() {
                *slot = char_c;
            }
            return true;
        }
        let mut index = 0usize;
        while index < number && index < NC {
            let mut char_c = self.pt_table[(self.bit_buf >> (BITBUFSIZ - 8)) as usize];
            if char_c as usize >= NT {
                let mut mask = 1u32 << (BITBUFSIZ - 1 - 8);
                loop {
                    char_c = if mask & self.bit_buf != 0 {
                        self.right[char_c as usize]
                    } else {
                        self.left[char_c as usize]
                    };
                    mask >>= 1;
                    if (char_c as usize) < NT {
                        break;
                    }
                    if mask == 0 {
                        return false;
                    }
                }
            }
            self.fill_buf(self.pt_len[char_c as usize] as u16);
            if char_c <= 2 {
                let mut skip: i32 = match char_c {
                    0 => 1,
                    1 => self.get_bits(4) as i32 + 3,
                    _ => self.get_bits(CBIT) as i32 + 20,
                };
                skip -= 1;
                while skip >= 0 && index < NC {
                    self.c_len[index] = 0;
                    index += 1;
                    skip -= 1;
                }
            } else {
                self.c_len[index] = (char_c - 2) as u8;
                index += 1;
            }
        }
        while index < NC {
            self.c_len[index] = 0;
            index += 1;
        }
        self.make_table(NC, LenSource::CLen, 12, TableKind::CTable)
    }

    fn decode_p(&mut self) -> u32 {
        let mut val = self.pt_table[(self.bit_buf >> (BITBUFSIZ - 8)) as usize];
        if val as usize >= MAXNP {
            let mut mask = 1u32 << (BITBUFSIZ - 1 - 8);
            loop {
                val = if self.bit_buf & mask != 0 {
                    self.right[val as usize]
                } else {
                    self.left[val as usize]
                };
                mask >>= 1;
                if (val as usize) < MAXNP {
                    break;
                }
                if mask == 0 {
                    self.bad = true;
                    return 0;
                }
            }
        }
        self.fill_buf(self.pt_len[val as usize] as u16);
        let mut pos = val as u32;
        if val > 1 {
            pos = (1 << (val - 1)) + self.get_bits(val as u16 - 1);
        }
        pos
    }

    fn decode_c(&mut self) -> u16 {
        if self.block_size == 0 {
            self.block_size = self.get_bits(16) as u16;
            if !self.read_pt_len(NT, TBIT, Some(3)) {
                self.bad = true;
                return 0;
            }
            if !self.read_c_len() {
                self.bad = true;
                return 0;
            }
            let pbit = self.pbit;
            if !self.read_pt_len(MAXNP, pbit, None) {
                self.bad = true;
                return 0;
            }
        }
        self.block_size = self.block_size.wrapping_sub(1);
        let mut index = self.c_table[(self.bit_buf >> (BITBUFSIZ - 12)) as usize];
        if index as usize >= NC {
            let mut mask = 1u32 << (BITBUFSIZ - 1 - 12);
            loop {
                index = if self.bit_buf & mask != 0 {
                    self.right[index as usize]
                } else {
                    self.left[index as usize]
                };
                mask >>= 1;
                if (index as usize) < NC {
                    break;
                }
                if mask == 0 {
                    self.bad = true;
                    return 0;
                }
            }
        }
        self.fill_buf(self.c_len[index as usize] as u16);
        index
    }

    fn decode(&mut self) {
        loop {
            let char_c = self.decode_c();
            if self.bad {
                return;
            }
            if char_c < 256 {
                if self.out_pos >= self.orig_size {
                    return;
                }
                self.out[self.out_pos] = char_c as u8;
                self.out_pos += 1;
            } else {
                let mut bytes_remain = (char_c as usize) - (0x100 + 1 - THRESHOLD);
                let distance = self.decode_p() as usize;
                if self.bad {
                    return;
                }
                let Some(mut data_idx) = self.out_pos.checked_sub(distance + 1) else {
                    self.bad = true;
                    return;
                };
                loop {
                    if bytes_remain == 0 {
                        break;
                    }
                    if self.out_pos >= self.orig_size || data_idx >= self.orig_size {
                        return;
                    }
                    self.out[self.out_pos] = self.out[data_idx];
                    self.out_pos += 1;
                    data_idx += 1;
                    bytes_remain -= 1;
                }
                if self.out_pos >= self.orig_size {
                    return;
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum LenSource {
    CLen,
    PtLen,
}

#[derive(Clone, Copy)]
enum TableKind {
    CTable,
    PtTable,
}

#[derive(Clone, Copy)]
enum Pointer {
    Table(TableKind, usize),
    Left(usize),
    Right(usize),
}

/// One standard-compression decode; `pbit` selects EFI 1.1 (4) or Tiano (5).
fn efi_tiano_decompress(data: &[u8], pbit: u16) -> Option<Vec<u8>> {
    if data.len() < 8 {
        return None;
    }
    let comp_size = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
    let orig_size = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    if comp_size + 8 > data.len() {
        return None;
    }
    // An absurd stated size means a corrupt header, not a huge payload.
    if orig_size > 0x4000_0000 {
        return None;
    }
    if orig_size == 0 {
        return Some(Vec::new());
    }
    let mut scratch = Scratch::new(&data[8..], comp_size, orig_size, pbit);
    scratch.fill_buf(BITBUFSIZ);
    scratch.decode();
    if scratch.bad || scratch.out_pos != orig_size {
        return None;
    }
    Some(scratch.out)
}

fn test86_ms_byte(b: u8) -> bool {
    b == 0 || b == 0xFF
}

/// x86 branch-call filter from the LZMA SDK, both directions. Converts
/// absolute call/jump targets back to relative ones after decompression.
pub fn x86_convert(data: &mut [u8], ip: u32, state: &mut u32, encoding: bool) -> usize {
    let size = data.len();
    let mut mask = *state & 7;
    if size < 5 {
        return 0;
    }
    let size = size - 4;
    let ip = ip.wrapping_add(5);
    let mut pos = 0usize;

    loop {
        let mut scan = pos;
        while scan < size && data[scan] & 0xFE != 0xE8 {
            scan += 1;
        }
        let d = scan - pos;
        pos = scan;
        if scan >= size {
            *state = if d > 2 { 0 } else { mask >> d };
            return pos;
        }
        if d > 2 {
            mask = 0;
        } else {
            mask >>= d;
            if mask != 0
                && (mask > 4
                    || mask == 3
                    || test86_ms_byte(data[pos + (mask >> 1) as usize + 1]))
            {
                mask = (mask >> 1) | 4;
                pos += 1;
                continue;
            }
        }
        if test86_ms_byte(data[pos + 4]) {
            let mut v = u32::from_le_bytes([
                data[pos + 1],
                data[pos + 2],
                data[pos + 3],
                data[pos + 4],
            ]);
            let cur = ip.wrapping_add(pos as u32);
            pos += 5;
            if encoding {
                v = v.wrapping_add(cur);
            } else {
                v = v.wrapping_sub(cur);
            }
            if mask != 0 {
                let sh = (mask & 6) << 2;
                if test86_ms_byte((v >> sh) as u8) {
                    v ^= (0x100u32 << sh).wrapping_sub(1);
                    if encoding {
                        v = v.wrapping_add(cur);
                    } else {
                        v = v.wrapping_sub(cur);
                    }
                }
                mask = 0;
            }
            data[pos - 4] = v as u8;
            data[pos - 3] = (v >> 8) as u8;
            data[pos - 2] = (v >> 16) as u8;
            data[pos - 1] = 0u8.wrapping_sub(((v >> 24) & 1) as u8);
        } else {
            mask = (mask >> 1) | 4;
            pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_compressed_passes_through() {
        let data = b"plain bytes";
        let result = decompress(data, NOT_COMPRESSED).unwrap();
        assert_eq!(result.algorithm, CompressionAlgorithm::None);
        assert_eq!(result.data, data);
        assert!(result.efi11_data.is_none());
    }

    #[test]
    fn standard_with_garbage_fails() {
        // All-ones bit stream drives the length reader past the 16-bit
        // maximum, so both decoders reject the table.
        let mut data = vec![0xFFu8; 64];
        data[0..4].copy_from_slice(&32u32.to_le_bytes());
        data[4..8].copy_from_slice(&128u32.to_le_bytes());
        assert!(matches!(
            decompress(&data, EFI_STANDARD_COMPRESSION),
            Err(ParseError::DecompressionFailed)
        ));
    }

    #[test]
    fn standard_with_truncated_header_fails() {
        assert!(decompress(&[1, 2, 3], EFI_STANDARD_COMPRESSION).is_err());
    }

    #[test]
    fn lzma_known_stream() {
        // Pre-compressed "Hello, World!"
        let compressed: &[u8] = &[
            0x5D, 0x00, 0x00, 0x80, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00,
            0x24, 0x19, 0x49, 0x98, 0x6F, 0x16, 0x02, 0x89, 0x0A, 0x98, 0xE7, 0x3F, 0xA8, 0xC3,
            0x95, 0x48, 0x4D, 0xFF, 0xFF, 0x75, 0xF0, 0x00, 0x00,
        ];
        let result = decompress(compressed, EFI_CUSTOMIZED_COMPRESSION).unwrap();
        assert_eq!(result.algorithm, CompressionAlgorithm::Lzma);
        assert_eq!(result.data, b"Hello, World!");
    }

    #[test]
    fn lzma_invalid_stream_fails() {
        assert!(decompress(&[0x00, 0x01, 0x02, 0x03], EFI_CUSTOMIZED_COMPRESSION).is_err());
    }

    #[test]
    fn x86_filter_round_trips() {
        // A call instruction followed by filler; encode then decode must
        // restore the original bytes.
        let original: Vec<u8> = vec![
            0x90, 0x90, 0xE8, 0x12, 0x34, 0x00, 0x00, 0x90, 0x90, 0x90, 0x90, 0x90,
        ];
        let mut converted = original.clone();
        let mut state = 0u32;
        x86_convert(&mut converted, 0, &mut state, true);
        let mut state = 0u32;
        x86_convert(&mut converted, 0, &mut state, false);
        assert_eq!(converted, original);
    }
}
