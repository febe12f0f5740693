//! Rebase fixups.
//!
//! Fixups are collected in one pure pass over the slice bytes, before any
//! address space is reserved, and applied once the segments have been copied
//! in. Each [`FixupEntry`] records the preferred address of a pointer slot
//! and the preferred value that belongs there; applying it adds the slide.
//!
//! Only internal rebases are supported. Any bind to an external symbol fails
//! the load with [`Error::UnsupportedDynamicBinding`].

use crate::macho::reader::{Endian, Reader};
use crate::macho::{FixupTable, MachImage, Segment};
use crate::mapper::{MappedImage, loadable_segments};
use crate::ptrauth::{self, PacKey};
use crate::vm::AddressSpace;
use crate::{Error, Result};
use tracing::{debug, trace};

pub mod chained;
pub mod opcodes;

/// Signing parameters of an authenticated arm64e rebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthInfo {
    pub key: PacKey,
    pub diversity: u16,
    pub addr_div: bool,
}

impl AuthInfo {
    /// The modifier the slot's value is signed with.
    pub fn discriminator(&self, slot: u64) -> u64 {
        let diversity = self.diversity as u64;
        if self.addr_div {
            (slot & 0x0000_FFFF_FFFF_FFFF) | (diversity << 48)
        } else {
            diversity
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixupEntry {
    /// Preferred (unslid) address of the slot.
    pub address: u64,
    /// Slot width in bytes.
    pub width: usize,
    /// Preferred address the slot must point at.
    pub target: u64,
    /// Top byte carried through unchanged (tagged pointers).
    pub high8: u8,
    pub auth: Option<AuthInfo>,
}

impl FixupEntry {
    pub fn rebase(address: u64, width: usize, target: u64) -> Self {
        Self {
            address,
            width,
            target,
            high8: 0,
            auth: None,
        }
    }

    /// The value to store once the image has moved by `slide`.
    pub fn resolve(&self, slide: u64) -> u64 {
        let rebased = self.target.wrapping_add(slide);
        match self.auth {
            Some(auth) if ptrauth::is_supported() => {
                let slot = self.address.wrapping_add(slide);
                ptrauth::sign(rebased, auth.key, auth.discriminator(slot))
            }
            _ => rebased | ((self.high8 as u64) << 56),
        }
    }
}

/// Preferred-address view of the segments, backed by the slice bytes.
#[derive(Debug)]
pub struct SlotMap<'a> {
    segments: Vec<&'a Segment>,
    slice: &'a [u8],
    endian: Endian,
    pointer_size: usize,
    header_vmaddr: u64,
}

impl<'a> SlotMap<'a> {
    pub fn new(image: &'a MachImage, slice: &'a [u8]) -> Self {
        Self::from_parts(
            image.segments().collect(),
            slice,
            image.header.endian,
            image.header.pointer_size(),
        )
    }

    pub fn from_parts(
        segments: Vec<&'a Segment>,
        slice: &'a [u8],
        endian: Endian,
        pointer_size: usize,
    ) -> Self {
        // The Mach header is mapped at the start of the segment that covers
        // file offset zero.
        let header_vmaddr = segments
            .iter()
            .find(|segment| segment.fileoff == 0 && segment.filesize > 0)
            .or_else(|| segments.iter().find(|segment| !segment.is_guard()))
            .map(|segment| segment.vmaddr)
            .unwrap_or(0);
        Self {
            segments,
            slice,
            endian,
            pointer_size,
            header_vmaddr,
        }
    }

    pub fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    /// Preferred address of the Mach header.
    pub fn header_vmaddr(&self) -> u64 {
        self.header_vmaddr
    }

    /// Segment command `index`, counting every segment in load-command order.
    pub fn segment(&self, index: usize) -> Result<&'a Segment> {
        self.segments.get(index).copied().ok_or_else(|| {
            Error::MalformedContainer(format!("fixup names missing segment {index}"))
        })
    }

    /// Preferred address of `offset` within segment `index`, checked so that
    /// a `width`-byte slot fits inside the segment.
    pub fn segment_address(&self, index: usize, offset: u64, width: usize) -> Result<u64> {
        let segment = self.segment(index)?;
        let fits = offset
            .checked_add(width as u64)
            .is_some_and(|end| end <= segment.vmsize);
        if segment.is_guard() || !fits {
            return Err(Error::MalformedContainer(format!(
                "fixup at {}+0x{:x} lies outside the segment",
                segment.name, offset
            )));
        }
        segment.vmaddr.checked_add(offset).ok_or_else(|| {
            Error::MalformedContainer(format!(
                "fixup at {}+0x{:x} wraps the address space",
                segment.name, offset
            ))
        })
    }

    /// The value stored in the file for the slot at preferred `address`.
    /// Slots in a segment's zero-fill tail read as zero.
    pub fn read(&self, address: u64, width: usize) -> Result<u64> {
        let segment = self
            .segments
            .iter()
            .find(|segment| {
                !segment.is_guard()
                    && address >= segment.vmaddr
                    && (address - segment.vmaddr)
                        .checked_add(width as u64)
                        .is_some_and(|end| end <= segment.vmsize)
            })
            .ok_or_else(|| {
                Error::MalformedContainer(format!(
                    "fixup slot 0x{address:x} lies outside every segment"
                ))
            })?;
        let offset = address - segment.vmaddr;
        if offset >= segment.filesize {
            return Ok(0);
        }
        if offset + width as u64 > segment.filesize {
            return Err(Error::MalformedContainer(format!(
                "fixup slot 0x{address:x} straddles the end of {}'s file data",
                segment.name
            )));
        }
        let file_offset = segment.fileoff.checked_add(offset).ok_or_else(|| {
            Error::MalformedContainer(format!("fixup slot 0x{address:x} has no file data"))
        })?;
        let mut reader = Reader::at(self.slice, file_offset as usize, self.endian)?;
        Ok(match width {
            4 => reader.u32()? as u64,
            _ => reader.u64()?,
        })
    }
}

/// Collect every fixup the image needs, failing on the first external bind.
pub fn collect_fixups(image: &MachImage, slice: &[u8]) -> Result<Vec<FixupEntry>> {
    let slots = SlotMap::new(image, slice);
    let mut fixups = Vec::new();

    for table in image.fixup_tables() {
        match table {
            FixupTable::DyldInfo(info) => {
                opcodes::reject_binds(info.bind.slice(slice)?, "bind")?;
                opcodes::reject_binds(info.weak_bind.slice(slice)?, "weak bind")?;
                opcodes::reject_binds(info.lazy_bind.slice(slice)?, "lazy bind")?;
                for slot in opcodes::parse_rebase_opcodes(info.rebase.slice(slice)?, &slots)? {
                    let target = slots.read(slot.address, slot.width)?;
                    fixups.push(FixupEntry::rebase(slot.address, slot.width, target));
                }
            }
            FixupTable::Chained(range) => {
                if !range.is_empty() {
                    fixups.extend(chained::parse_chained_fixups(range.slice(slice)?, &slots)?);
                }
            }
        }
    }

    debug!("Collected {} fixups", fixups.len());
    Ok(fixups)
}

/// Write every fixup into the mapped image. Segments must still be writable.
pub fn apply_fixups(
    space: &mut dyn AddressSpace,
    image: &MappedImage,
    fixups: &[FixupEntry],
) -> Result<()> {
    for fixup in fixups {
        let slot = image.slid(fixup.address);
        let value = fixup.resolve(image.slide);
        trace!(
            "Fixup at 0x{:x}: 0x{:x} -> 0x{:x}",
            slot, fixup.target, value
        );
        image.write_ptr(space, slot, fixup.width, value)?;
    }
    debug!("Applied {} fixups (slide {:#x})", fixups.len(), image.slide as i64);
    Ok(())
}

/// Whether every fixup slot falls in a loadable segment.
pub fn check_fixup_slots(image: &MachImage, fixups: &[FixupEntry]) -> Result<()> {
    let segments: Vec<&Segment> = loadable_segments(image).collect();
    for fixup in fixups {
        let inside = segments.iter().any(|segment| {
            fixup.address >= segment.vmaddr
                && (fixup.address - segment.vmaddr)
                    .checked_add(fixup.width as u64)
                    .is_some_and(|end| end <= segment.vmsize)
        });
        if !inside {
            return Err(Error::MalformedContainer(format!(
                "fixup slot 0x{:x} lies outside every loadable segment",
                fixup.address
            )));
        }
    }
    Ok(())
}
