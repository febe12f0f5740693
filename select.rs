//! Host slice selection.
//!
//! Narrows a parsed container down to the one Mach-O image the remaining
//! stages operate on. Nothing here reserves memory.

use crate::macho::{Container, CpuArch, MachImage};
use crate::{Error, Result};
use std::ops::Range;
use tracing::debug;

/// The image chosen for the host, and where its bytes live in the raw image.
#[derive(Debug)]
pub struct SelectedSlice<'a> {
    pub image: MachImage,
    pub range: Range<usize>,
    pub bytes: &'a [u8],
}

/// Pick the slice of `container` that runs on `host`.
///
/// Fat slices whose CPU type and subtype both match are preferred; otherwise
/// the first slice with the host's CPU type is used.
pub fn select_slice<'a>(
    container: Container,
    raw: &'a [u8],
    host: CpuArch,
) -> Result<SelectedSlice<'a>> {
    match container {
        Container::Thin(image) => {
            if image.header.arch.cputype != host.cputype {
                return Err(Error::ArchitectureMismatch {
                    host,
                    available: vec![image.header.arch],
                });
            }
            debug!("Using thin {} image", image.header.arch);
            Ok(SelectedSlice {
                image,
                range: 0..raw.len(),
                bytes: raw,
            })
        }
        Container::Fat(fat) => {
            let index = fat
                .arches
                .iter()
                .position(|slice| slice.arch.matches_exactly(&host))
                .or_else(|| {
                    fat.arches
                        .iter()
                        .position(|slice| slice.arch.cputype == host.cputype)
                })
                .ok_or_else(|| Error::ArchitectureMismatch {
                    host,
                    available: fat.arches.iter().map(|slice| slice.arch).collect(),
                })?;
            let range = fat.arches[index].range();
            debug!(
                "Selected fat slice {} ({}) at 0x{:x}..0x{:x}",
                index, fat.arches[index].arch, range.start, range.end
            );
            let image = fat.parse_slice(raw, index)?;
            Ok(SelectedSlice {
                image,
                bytes: &raw[range.clone()],
                range,
            })
        }
    }
}
