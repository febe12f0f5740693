//! `LC_DYLD_CHAINED_FIXUPS` decoding.
//!
//! The payload starts with a `dyld_chained_fixups_header`, followed by the
//! per-segment page-start tables, the import table and the symbol strings.
//! Each page start points at the first fixup of a chain; every fixup carries
//! the distance to the next one in its `next` field. All of it is little
//! endian.

use super::{AuthInfo, FixupEntry, SlotMap};
use crate::macho::constants::*;
use crate::macho::reader::{Endian, Reader};
use crate::ptrauth::PacKey;
use crate::{Error, Result};
use tracing::{debug, trace};

fn bits(value: u64, shift: u32, width: u32) -> u64 {
    (value >> shift) & ((1u64 << width) - 1)
}

/// One decoded chain element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainedPointer {
    Rebase { target: u64, high8: u8 },
    AuthRebase { target: u64, auth: AuthInfo },
    Bind { ordinal: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PointerFormat(u16);

impl PointerFormat {
    fn check(format: u16) -> Result<Self> {
        match format {
            DYLD_CHAINED_PTR_64
            | DYLD_CHAINED_PTR_64_OFFSET
            | DYLD_CHAINED_PTR_ARM64E
            | DYLD_CHAINED_PTR_ARM64E_USERLAND
            | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => Ok(Self(format)),
            other => Err(Error::UnsupportedImageType(format!(
                "chained pointer format {other} is not supported"
            ))),
        }
    }

    fn is_arm64e(&self) -> bool {
        matches!(
            self.0,
            DYLD_CHAINED_PTR_ARM64E
                | DYLD_CHAINED_PTR_ARM64E_USERLAND
                | DYLD_CHAINED_PTR_ARM64E_USERLAND24
        )
    }

    /// Bytes per unit of the `next` field.
    fn stride(&self) -> u64 {
        if self.is_arm64e() { 8 } else { 4 }
    }

    /// Decode `raw` into the distance to the next element (in strides) and
    /// the pointer it describes. Offset-style targets are turned into
    /// preferred addresses with `base`.
    fn decode(&self, raw: u64, base: u64) -> (u64, ChainedPointer) {
        if !self.is_arm64e() {
            let next = bits(raw, 51, 12);
            if bits(raw, 63, 1) != 0 {
                let ordinal = bits(raw, 0, 24) as u32;
                return (next, ChainedPointer::Bind { ordinal });
            }
            let target = bits(raw, 0, 36);
            let target = if self.0 == DYLD_CHAINED_PTR_64_OFFSET {
                base.wrapping_add(target)
            } else {
                target
            };
            let high8 = bits(raw, 36, 8) as u8;
            return (next, ChainedPointer::Rebase { target, high8 });
        }

        let next = bits(raw, 51, 11);
        let is_bind = bits(raw, 62, 1) != 0;
        let is_auth = bits(raw, 63, 1) != 0;
        let pointer = match (is_bind, is_auth) {
            (true, _) => {
                let ordinal_bits = if self.0 == DYLD_CHAINED_PTR_ARM64E_USERLAND24 {
                    24
                } else {
                    16
                };
                ChainedPointer::Bind {
                    ordinal: bits(raw, 0, ordinal_bits) as u32,
                }
            }
            (false, true) => ChainedPointer::AuthRebase {
                target: base.wrapping_add(bits(raw, 0, 32)),
                auth: AuthInfo {
                    key: PacKey::from_bits(bits(raw, 49, 2) as u8),
                    diversity: bits(raw, 32, 16) as u16,
                    addr_div: bits(raw, 48, 1) != 0,
                },
            },
            (false, false) => {
                let target = bits(raw, 0, 43);
                let target = if self.0 == DYLD_CHAINED_PTR_ARM64E {
                    target
                } else {
                    base.wrapping_add(target)
                };
                ChainedPointer::Rebase {
                    target,
                    high8: bits(raw, 43, 8) as u8,
                }
            }
        };
        (next, pointer)
    }
}

/// Import table, used only to name the symbol of a rejected bind.
struct Imports<'a> {
    data: &'a [u8],
    imports_offset: usize,
    symbols_offset: usize,
    count: u32,
    format: u32,
    symbols_format: u32,
}

impl Imports<'_> {
    fn name(&self, ordinal: u32) -> String {
        self.lookup(ordinal)
            .unwrap_or_else(|| format!("<import #{ordinal}>"))
    }

    fn lookup(&self, ordinal: u32) -> Option<String> {
        if ordinal >= self.count || self.symbols_format != 0 {
            return None;
        }
        let index = ordinal as usize;
        let name_offset = match self.format {
            DYLD_CHAINED_IMPORT | DYLD_CHAINED_IMPORT_ADDEND => {
                let size = if self.format == DYLD_CHAINED_IMPORT { 4 } else { 8 };
                let mut reader =
                    Reader::at(self.data, self.imports_offset + index * size, Endian::Little).ok()?;
                bits(reader.u32().ok()? as u64, 9, 23)
            }
            DYLD_CHAINED_IMPORT_ADDEND64 => {
                let mut reader =
                    Reader::at(self.data, self.imports_offset + index * 16, Endian::Little).ok()?;
                bits(reader.u64().ok()?, 32, 32)
            }
            _ => return None,
        };
        Reader::at(
            self.data,
            self.symbols_offset + name_offset as usize,
            Endian::Little,
        )
        .ok()?
        .cstr()
        .ok()
    }
}

/// Decode every chain in a chained fixups payload.
pub fn parse_chained_fixups(data: &[u8], slots: &SlotMap<'_>) -> Result<Vec<FixupEntry>> {
    let mut header = Reader::new(data, Endian::Little);
    let version = header.u32()?;
    let starts_offset = header.u32()? as usize;
    let imports_offset = header.u32()? as usize;
    let symbols_offset = header.u32()? as usize;
    let imports_count = header.u32()?;
    let imports_format = header.u32()?;
    let symbols_format = header.u32()?;
    if version != 0 {
        return Err(Error::UnsupportedImageType(format!(
            "chained fixups version {version} is not supported"
        )));
    }

    let imports = Imports {
        data,
        imports_offset,
        symbols_offset,
        count: imports_count,
        format: imports_format,
        symbols_format,
    };

    let mut starts = Reader::at(data, starts_offset, Endian::Little)?;
    let seg_count = starts.u32()? as usize;
    let mut fixups = Vec::new();
    for segment_index in 0..seg_count {
        let seg_info_offset = starts.u32()? as usize;
        if seg_info_offset == 0 {
            continue;
        }
        parse_segment_chains(
            data,
            starts_offset + seg_info_offset,
            segment_index,
            slots,
            &imports,
            &mut fixups,
        )?;
    }

    debug!("Parsed {} chained fixups", fixups.len());
    Ok(fixups)
}

fn parse_segment_chains(
    data: &[u8],
    offset: usize,
    segment_index: usize,
    slots: &SlotMap<'_>,
    imports: &Imports<'_>,
    fixups: &mut Vec<FixupEntry>,
) -> Result<()> {
    let mut reader = Reader::at(data, offset, Endian::Little)?;
    let _size = reader.u32()?;
    let page_size = reader.u16()? as u64;
    let format = PointerFormat::check(reader.u16()?)?;
    let _segment_offset = reader.u64()?;
    let _max_valid_pointer = reader.u32()?;
    let page_count = reader.u16()?;
    if page_size == 0 {
        return Err(Error::MalformedContainer(format!(
            "chained fixups for segment {segment_index} have a zero page size"
        )));
    }

    let segment = slots.segment(segment_index)?;
    trace!(
        "Chained fixups for {}: format {}, {} pages of 0x{:x}",
        segment.name, format.0, page_count, page_size
    );

    for page in 0..page_count as u64 {
        let start = reader.u16()?;
        if start == DYLD_CHAINED_PTR_START_NONE {
            continue;
        }
        if start & DYLD_CHAINED_PTR_START_MULTI != 0 {
            return Err(Error::UnsupportedImageType(
                "chained fixup pages with multiple starts are not supported".to_string(),
            ));
        }

        let mut chain_offset = page * page_size + start as u64;
        loop {
            let address = slots.segment_address(segment_index, chain_offset, 8)?;
            let raw = slots.read(address, 8)?;
            let (next, pointer) = format.decode(raw, slots.header_vmaddr());
            match pointer {
                ChainedPointer::Rebase { target, high8 } => fixups.push(FixupEntry {
                    high8,
                    ..FixupEntry::rebase(address, 8, target)
                }),
                ChainedPointer::AuthRebase { target, auth } => fixups.push(FixupEntry {
                    auth: Some(auth),
                    ..FixupEntry::rebase(address, 8, target)
                }),
                ChainedPointer::Bind { ordinal } => {
                    return Err(Error::UnsupportedDynamicBinding {
                        symbol: imports.name(ordinal),
                    });
                }
            }
            if next == 0 {
                break;
            }
            chain_offset += next * format.stride();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixup::tests::{DATA, TEXT, data_segments};

    /// Payload with one segment-start table for segment 2 (`__DATA`), one
    /// page starting at offset 0, and one import named `_puts`.
    ///
    /// header 0..28, starts_in_image 28..44, starts_in_segment 44..68,
    /// imports 68..72, symbols 72..
    fn payload(format: u16) -> Vec<u8> {
        let mut out = Vec::new();
        for field in [0u32, 28, 68, 72, 1, DYLD_CHAINED_IMPORT, 0] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for field in [3u32, 0, 0, 16] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out.extend_from_slice(&24u32.to_le_bytes());
        out.extend_from_slice(&0x4000u16.to_le_bytes());
        out.extend_from_slice(&format.to_le_bytes());
        out.extend_from_slice(&(DATA - TEXT).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&((1u32 << 9) | 1).to_le_bytes());
        out.extend_from_slice(b"\0_puts\0");
        out
    }

    fn set_page_start(payload: &mut [u8], start: u16) {
        payload[66..68].copy_from_slice(&start.to_le_bytes());
    }

    fn slice_with_chain(words: &[(u64, u64)]) -> Vec<u8> {
        let mut slice = vec![0u8; 0x4100];
        for (offset, word) in words {
            let at = 0x4000 + *offset as usize;
            slice[at..at + 8].copy_from_slice(&word.to_le_bytes());
        }
        slice
    }

    #[test]
    fn test_ptr64_rebase_chain() {
        // Two rebases 16 bytes apart: next = 16 / 4 = 4.
        let first = (TEXT + 0x40) | (4 << 51);
        let second = (DATA + 0x20) | (0x7Fu64 << 36);
        let slice = slice_with_chain(&[(0, first), (16, second)]);
        let segments = data_segments();
        let slots = SlotMap::from_parts(segments.iter().collect(), &slice, Endian::Little, 8);

        let fixups = parse_chained_fixups(&payload(DYLD_CHAINED_PTR_64), &slots).unwrap();
        assert_eq!(
            fixups,
            vec![
                FixupEntry::rebase(DATA, 8, TEXT + 0x40),
                FixupEntry {
                    high8: 0x7F,
                    ..FixupEntry::rebase(DATA + 16, 8, DATA + 0x20)
                }
            ]
        );
    }

    #[test]
    fn test_offset_format_adds_base() {
        let slice = slice_with_chain(&[(8, 0x40)]);
        let segments = data_segments();
        let slots = SlotMap::from_parts(segments.iter().collect(), &slice, Endian::Little, 8);

        let mut data = payload(DYLD_CHAINED_PTR_64_OFFSET);
        set_page_start(&mut data, 8);
        let fixups = parse_chained_fixups(&data, &slots).unwrap();
        assert_eq!(fixups, vec![FixupEntry::rebase(DATA + 8, 8, TEXT + 0x40)]);
    }

    #[test]
    fn test_arm64e_auth_rebase() {
        let raw = 0x100u64 | (0xBEEF << 32) | (1 << 48) | (2 << 49) | (1 << 63);
        let slice = slice_with_chain(&[(0, raw)]);
        let segments = data_segments();
        let slots = SlotMap::from_parts(segments.iter().collect(), &slice, Endian::Little, 8);

        let fixups = parse_chained_fixups(&payload(DYLD_CHAINED_PTR_ARM64E), &slots).unwrap();
        assert_eq!(fixups.len(), 1);
        assert_eq!(fixups[0].target, TEXT + 0x100);
        assert_eq!(
            fixups[0].auth,
            Some(AuthInfo {
                key: PacKey::DA,
                diversity: 0xBEEF,
                addr_div: true
            })
        );
    }

    #[test]
    fn test_bind_names_import() {
        let slice = slice_with_chain(&[(0, 1u64 << 63)]);
        let segments = data_segments();
        let slots = SlotMap::from_parts(segments.iter().collect(), &slice, Endian::Little, 8);

        match parse_chained_fixups(&payload(DYLD_CHAINED_PTR_64), &slots) {
            Err(Error::UnsupportedDynamicBinding { symbol }) => assert_eq!(symbol, "_puts"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_chain_leaving_segment() {
        // next points 0x3ffc bytes ahead, past the end of __DATA.
        let slice = slice_with_chain(&[(0xf8, (TEXT + 0x40) | (0xfff << 51))]);
        let segments = data_segments();
        let slots = SlotMap::from_parts(segments.iter().collect(), &slice, Endian::Little, 8);
        let mut data = payload(DYLD_CHAINED_PTR_64);
        set_page_start(&mut data, 0xf8);
        assert!(matches!(
            parse_chained_fixups(&data, &slots),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_unsupported_format() {
        let segments = data_segments();
        let slots = SlotMap::from_parts(segments.iter().collect(), &[], Endian::Little, 8);
        assert!(matches!(
            parse_chained_fixups(&payload(3), &slots),
            Err(Error::UnsupportedImageType(_))
        ));
    }
}
