//! Segment mapping.
//!
//! The mapper reserves one contiguous span of address space covering every
//! loadable segment, commits each segment read+write, copies its file bytes
//! and zero-fills the rest. Final protections are applied separately by
//! [`finalize_protections`] once fixups have been written.
//!
//! Mapped memory is only ever accessed through [`MappedImage`]'s bounds
//! checked accessors, which refuse any address outside a mapped segment.

use crate::macho::reader::Endian;
use crate::macho::{MachImage, Segment};
use crate::vm::{AddressSpace, Placement, Region, VmError, VmProt, page_align_down, page_align_up};
use crate::{Error, Result};
use tracing::{debug, warn};

/// How the image base is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImagePlacement {
    /// Map at the image's preferred address, sliding position-independent
    /// images elsewhere if that range is taken.
    #[default]
    Preferred,
    /// Let the address space choose. Only valid for position-independent
    /// images.
    Anywhere,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedSegment {
    pub name: String,
    /// Preferred (unslid) virtual address.
    pub vmaddr: u64,
    pub vmsize: u64,
    pub filesize: u64,
    /// Page-aligned slid range backing the segment.
    pub region: Region,
    pub initprot: VmProt,
    pub maxprot: VmProt,
}

impl MappedSegment {
    /// Slid start address.
    pub fn address(&self) -> u64 {
        self.region.start
    }

    /// Whether `addr..addr+len` (slid) lies within the segment's vmsize.
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        Region::new(self.region.start, self.vmsize).contains(addr, len)
    }
}

/// Segments of one image committed into an address space.
#[derive(Debug, Clone)]
pub struct MappedImage {
    /// The single reservation covering every segment.
    pub reservation: Region,
    /// Lowest preferred page address of the loadable segments.
    pub preferred_base: u64,
    /// Actual minus preferred base, as a wrapping offset.
    pub slide: u64,
    pub endian: Endian,
    pub segments: Vec<MappedSegment>,
}

impl MappedImage {
    pub fn base(&self) -> u64 {
        self.reservation.start
    }

    /// Translate a preferred address into its slid address.
    pub fn slid(&self, vmaddr: u64) -> u64 {
        vmaddr.wrapping_add(self.slide)
    }

    /// The segment containing `addr..addr+len` (slid addresses).
    pub fn segment_for(&self, addr: u64, len: u64) -> Option<&MappedSegment> {
        self.segments.iter().find(|seg| seg.contains(addr, len))
    }

    fn check_slot(&self, addr: u64, width: usize) -> Result<()> {
        if self.segment_for(addr, width as u64).is_none() {
            return Err(Error::MalformedContainer(format!(
                "fixup slot 0x{addr:x} ({width} bytes) lies outside every mapped segment"
            )));
        }
        Ok(())
    }

    /// Read a pointer-sized slot at slid address `addr`.
    pub fn read_ptr(&self, space: &dyn AddressSpace, addr: u64, width: usize) -> Result<u64> {
        self.check_slot(addr, width)?;
        let mut buf = [0u8; 8];
        space.read(addr, &mut buf[..width])?;
        Ok(match (self.endian, width) {
            (Endian::Little, 4) => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64,
            (Endian::Big, 4) => u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64,
            (Endian::Little, _) => u64::from_le_bytes(buf),
            (Endian::Big, _) => u64::from_be_bytes(buf),
        })
    }

    /// Write a pointer-sized slot at slid address `addr`.
    pub fn write_ptr(
        &self,
        space: &mut dyn AddressSpace,
        addr: u64,
        width: usize,
        value: u64,
    ) -> Result<()> {
        self.check_slot(addr, width)?;
        match (self.endian, width) {
            (Endian::Little, 4) => space.write(addr, &(value as u32).to_le_bytes())?,
            (Endian::Big, 4) => space.write(addr, &(value as u32).to_be_bytes())?,
            (Endian::Little, _) => space.write(addr, &value.to_le_bytes())?,
            (Endian::Big, _) => space.write(addr, &value.to_be_bytes())?,
        }
        Ok(())
    }
}

/// Segments that occupy memory, in load-command order.
pub fn loadable_segments(image: &MachImage) -> impl Iterator<Item = &Segment> {
    image
        .segments()
        .filter(|segment| !segment.is_guard() && segment.vmsize > 0)
}

/// Check every loadable segment against the slice and the page size.
fn validate_segments(segments: &[&Segment], slice_len: usize, page_size: u64) -> Result<()> {
    for (index, segment) in segments.iter().enumerate() {
        if segment.filesize > segment.vmsize {
            return Err(Error::MalformedContainer(format!(
                "segment {} has filesize 0x{:x} larger than vmsize 0x{:x}",
                segment.name, segment.filesize, segment.vmsize
            )));
        }
        let end = segment.fileoff.checked_add(segment.filesize);
        if end.is_none_or(|end| end > slice_len as u64) {
            return Err(Error::ShortRead {
                segment: segment.name.clone(),
                end: end.unwrap_or(u64::MAX),
                available: slice_len as u64,
            });
        }
        if segment.vmaddr % page_size != 0 {
            return Err(Error::MalformedContainer(format!(
                "segment {} at 0x{:x} is not aligned to the 0x{:x} byte page size",
                segment.name, segment.vmaddr, page_size
            )));
        }
        if segment.vmaddr.checked_add(segment.vmsize).is_none() {
            return Err(Error::MalformedContainer(format!(
                "segment {} wraps the address space",
                segment.name
            )));
        }
        if let Some(earlier) = segments[..index]
            .iter()
            .find(|earlier| ranges_overlap(earlier, segment, page_size))
        {
            return Err(Error::MalformedContainer(format!(
                "segment {} overlaps earlier segment {}",
                segment.name, earlier.name
            )));
        }
    }
    Ok(())
}

fn page_span(segment: &Segment, page_size: u64) -> Region {
    let end = page_align_up(segment.vmaddr + segment.vmsize, page_size).unwrap_or(u64::MAX);
    Region::new(segment.vmaddr, end - segment.vmaddr)
}

fn ranges_overlap(a: &Segment, b: &Segment, page_size: u64) -> bool {
    page_span(a, page_size).overlaps(&page_span(b, page_size))
}

/// Reserve the image span, then copy and zero-fill every loadable segment.
///
/// On error every reservation made here has been released.
pub fn map_segments(
    space: &mut dyn AddressSpace,
    image: &MachImage,
    slice: &[u8],
    placement: ImagePlacement,
) -> Result<MappedImage> {
    let page_size = space.page_size();
    let segments: Vec<&Segment> = loadable_segments(image).collect();
    if segments.is_empty() {
        return Err(Error::MalformedContainer(
            "image has no loadable segments".to_string(),
        ));
    }
    validate_segments(&segments, slice.len(), page_size)?;

    let low = segments
        .iter()
        .map(|segment| page_align_down(segment.vmaddr, page_size))
        .min()
        .unwrap_or(0);
    let high = segments
        .iter()
        .map(|segment| page_span(segment, page_size).end())
        .max()
        .unwrap_or(low);

    let reservation = reserve_span(space, image, low, high - low, placement)?;
    let slide = reservation.start.wrapping_sub(low);
    if slide != 0 {
        debug!(
            "Image slid by {:#x} (preferred base 0x{:x}, actual 0x{:x})",
            slide as i64, low, reservation.start
        );
    }

    let mapped = MappedImage {
        reservation,
        preferred_base: low,
        slide,
        endian: image.header.endian,
        segments: segments
            .iter()
            .map(|segment| MappedSegment {
                name: segment.name.clone(),
                vmaddr: segment.vmaddr,
                vmsize: segment.vmsize,
                filesize: segment.filesize,
                region: Region::new(
                    segment.vmaddr.wrapping_add(slide),
                    page_span(segment, page_size).size,
                ),
                initprot: segment.initprot,
                maxprot: segment.maxprot,
            })
            .collect(),
    };

    for (segment, source) in mapped.segments.iter().zip(&segments) {
        if let Err(err) = commit_segment(space, segment, source, slice) {
            release(space, reservation);
            return Err(err);
        }
    }
    Ok(mapped)
}

fn reserve_span(
    space: &mut dyn AddressSpace,
    image: &MachImage,
    preferred: u64,
    size: u64,
    placement: ImagePlacement,
) -> Result<Region> {
    let pie = image.header.is_pie();
    if placement == ImagePlacement::Anywhere {
        if !pie {
            return Err(Error::SegmentConflict(format!(
                "image is not position independent and must be mapped at 0x{preferred:x}"
            )));
        }
        return Ok(space.reserve(Placement::Anywhere, size)?);
    }

    match space.reserve(Placement::Exact(preferred), size) {
        Ok(region) => Ok(region),
        Err(VmError::Unavailable { .. }) if pie => {
            debug!(
                "Preferred range 0x{:x}+0x{:x} unavailable, sliding image",
                preferred, size
            );
            Ok(space.reserve(Placement::Anywhere, size)?)
        }
        Err(VmError::Unavailable { .. }) => Err(Error::SegmentConflict(format!(
            "fixed range 0x{:x}..0x{:x} is unavailable and the image cannot be relocated",
            preferred,
            preferred.saturating_add(size)
        ))),
        Err(err) => Err(err.into()),
    }
}

fn commit_segment(
    space: &mut dyn AddressSpace,
    segment: &MappedSegment,
    source: &Segment,
    slice: &[u8],
) -> Result<()> {
    debug!(
        "Loading segment {} at 0x{:016x} (vmsize={} filesize={}) prot={}",
        segment.name, segment.region.start, segment.vmsize, segment.filesize, segment.initprot
    );
    space.protect(segment.region, VmProt::RW)?;

    let start = source.fileoff as usize;
    let data = &slice[start..start + source.filesize as usize];
    space.write(segment.address(), data)?;
    if segment.vmsize > segment.filesize {
        space.fill(
            segment.address() + segment.filesize,
            segment.vmsize - segment.filesize,
            0,
        )?;
    }
    Ok(())
}

/// Apply each segment's declared protection. Writable+executable segments
/// lose write access.
pub fn finalize_protections(space: &mut dyn AddressSpace, image: &MappedImage) -> Result<()> {
    for segment in &image.segments {
        let mut prot = segment.initprot;
        if prot.is_wx() {
            warn!(
                "Segment {} requests {}, dropping write access",
                segment.name, prot
            );
            prot.remove(VmProt::WRITE);
        }
        space.protect(segment.region, prot)?;
    }
    Ok(())
}

/// Release a reservation on an error path. A failure to release is logged;
/// the original error is what the caller reports.
pub fn release(space: &mut dyn AddressSpace, region: Region) {
    if let Err(err) = space.release(region) {
        warn!("Failed to release {}: {}", region, err);
    }
}
