//! `LC_DYLD_INFO` opcode streams.
//!
//! Rebase streams are interpreted into slot addresses. Bind streams are only
//! scanned: a statically linked image has nothing to bind, so the first bind
//! found is reported as an error naming its symbol.

use super::SlotMap;
use crate::macho::constants::*;
use crate::macho::reader::{read_sleb128, read_uleb128};
use crate::{Error, Result};
use tracing::{debug, trace};

/// A rebase slot from the opcode stream: preferred address and width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebaseSlot {
    pub address: u64,
    pub width: usize,
}

struct RebaseState<'a> {
    slots: &'a SlotMap<'a>,
    pointer_size: usize,
    width: usize,
    segment_index: usize,
    segment_offset: u64,
    out: Vec<RebaseSlot>,
}

impl RebaseState<'_> {
    fn rebase(&mut self) -> Result<()> {
        let address = self
            .slots
            .segment_address(self.segment_index, self.segment_offset, self.width)?;
        self.out.push(RebaseSlot {
            address,
            width: self.width,
        });
        Ok(())
    }

    fn advance(&mut self, delta: u64) {
        self.segment_offset = self.segment_offset.wrapping_add(delta);
    }

    /// Rebase `count` slots `step` bytes apart. The whole run must fit in
    /// the current segment before any of it is recorded.
    fn rebase_run(&mut self, count: u64, step: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let segment = self.slots.segment(self.segment_index)?;
        let room = segment
            .vmsize
            .checked_sub(self.segment_offset)
            .and_then(|room| room.checked_sub(self.width as u64));
        let fits = match (count, room) {
            (1, Some(_)) => true,
            (_, Some(room)) => step != 0 && (count - 1) <= room / step,
            (_, None) => false,
        };
        if !fits {
            return Err(Error::MalformedContainer(format!(
                "rebase run of {count} slots every 0x{step:x} bytes from {}+0x{:x} overruns the segment",
                segment.name, self.segment_offset
            )));
        }
        for _ in 0..count {
            self.rebase()?;
            self.advance(step);
        }
        Ok(())
    }
}

/// Interpret a rebase opcode stream.
pub fn parse_rebase_opcodes(data: &[u8], slots: &SlotMap<'_>) -> Result<Vec<RebaseSlot>> {
    let pointer_size = slots.pointer_size();
    let mut state = RebaseState {
        slots,
        pointer_size,
        width: pointer_size,
        segment_index: 0,
        segment_offset: 0,
        out: Vec::new(),
    };
    let stride = pointer_size as u64;
    let mut i = 0;

    while i < data.len() {
        let opcode = data[i];
        let immediate = opcode & REBASE_IMMEDIATE_MASK;
        i += 1;

        match opcode & REBASE_OPCODE_MASK {
            REBASE_OPCODE_DONE => break,
            REBASE_OPCODE_SET_TYPE_IMM => {
                state.width = match immediate {
                    REBASE_TYPE_POINTER => state.pointer_size,
                    REBASE_TYPE_TEXT_ABSOLUTE32 => 4,
                    REBASE_TYPE_TEXT_PCREL32 => {
                        return Err(Error::UnsupportedImageType(
                            "pc-relative text rebases are not supported".to_string(),
                        ));
                    }
                    other => {
                        return Err(Error::MalformedContainer(format!(
                            "unknown rebase type {other}"
                        )));
                    }
                };
            }
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                let (offset, consumed) = read_uleb128(data, i)?;
                state.segment_index = immediate as usize;
                state.segment_offset = offset;
                i += consumed;
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => {
                let (delta, consumed) = read_uleb128(data, i)?;
                state.advance(delta);
                i += consumed;
            }
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                state.advance(immediate as u64 * stride);
            }
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                state.rebase_run(immediate as u64, stride)?;
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                let (count, consumed) = read_uleb128(data, i)?;
                i += consumed;
                state.rebase_run(count, stride)?;
            }
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                let (delta, consumed) = read_uleb128(data, i)?;
                i += consumed;
                state.rebase()?;
                state.advance(delta.wrapping_add(stride));
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                let (count, count_len) = read_uleb128(data, i)?;
                let (skip, skip_len) = read_uleb128(data, i + count_len)?;
                i += count_len + skip_len;
                state.rebase_run(count, skip.wrapping_add(stride))?;
            }
            other => {
                return Err(Error::MalformedContainer(format!(
                    "unknown rebase opcode 0x{other:02x}"
                )));
            }
        }
    }

    debug!("Parsed {} rebase entries", state.out.len());
    Ok(state.out)
}

/// Scan a bind, weak-bind or lazy-bind stream and fail on the first bind.
pub fn reject_binds(data: &[u8], stream: &str) -> Result<()> {
    let mut symbol: Option<String> = None;
    let mut i = 0;

    while i < data.len() {
        let opcode = data[i];
        let immediate = opcode & BIND_IMMEDIATE_MASK;
        i += 1;

        match opcode & BIND_OPCODE_MASK {
            // Lazy-bind streams separate entries with DONE.
            BIND_OPCODE_DONE
            | BIND_OPCODE_SET_DYLIB_ORDINAL_IMM
            | BIND_OPCODE_SET_DYLIB_SPECIAL_IMM
            | BIND_OPCODE_SET_TYPE_IMM => {}
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB
            | BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB
            | BIND_OPCODE_ADD_ADDR_ULEB => {
                i += read_uleb128(data, i)?.1;
            }
            BIND_OPCODE_SET_ADDEND_SLEB => {
                i += read_sleb128(data, i)?.1;
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let rest = &data[i..];
                let len = rest.iter().position(|&b| b == 0).ok_or_else(|| {
                    Error::MalformedContainer(format!("unterminated symbol in {stream} stream"))
                })?;
                let name = String::from_utf8_lossy(&rest[..len]).into_owned();
                trace!("{} stream names {} (flags 0x{:x})", stream, name, immediate);
                symbol = Some(name);
                i += len + 1;
            }
            BIND_OPCODE_DO_BIND
            | BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB
            | BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED
            | BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                return Err(Error::UnsupportedDynamicBinding {
                    symbol: symbol.unwrap_or_else(|| format!("<unnamed {stream} bind>")),
                });
            }
            BIND_OPCODE_THREADED => {
                return Err(Error::UnsupportedDynamicBinding {
                    symbol: symbol.unwrap_or_else(|| format!("<threaded {stream} binds>")),
                });
            }
            other => {
                return Err(Error::MalformedContainer(format!(
                    "unknown {stream} opcode 0x{other:02x}"
                )));
            }
        }
    }
    Ok(())
}
