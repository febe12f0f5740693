//! Machload - an in-process loader for statically linked Mach-O executables.
//!
//! Machload takes the raw bytes of a Mach-O (or Fat/universal Mach-O) image,
//! picks the slice built for the running host, maps its segments into the
//! current process, applies internal rebase fixups and then jumps to the
//! image's entry point on the calling thread. It never returns on success:
//! the loaded image owns the process from that point on.
//!
//! # Modules
//!
//! - [`macho`] - Mach-O and Fat container parsing
//! - [`select`] - Host slice selection
//! - [`vm`] - Address space resource (host and simulated backends)
//! - [`mapper`] - Segment mapping and protection finalisation
//! - [`fixup`] - Rebase fixups from dyld-info and chained fixup tables
//! - [`ptrauth`] - Pointer authentication on arm64 hosts
//! - [`launch`] - Initial stack construction and entry transfer
//! - [`loader`] - The load pipeline and its configuration
//! - [`mmap`] - Memory-mapped file handling for the driver
//!
//! # Error Handling
//!
//! Every stage returns the consolidated [`Error`] type. Any error returned
//! before the entry transfer leaves the address space as it was found.

use std::convert::Infallible;

pub mod fixup;
pub mod launch;
pub mod loader;
pub mod macho;
pub mod mapper;
pub mod mmap;
pub mod ptrauth;
pub mod select;
pub mod vm;

pub use loader::{LoadedImage, Loader, LoaderBuilder};
pub use macho::CpuArch;
pub use mmap::MappedFile;
pub use vm::{AddressSpace, Placement, VmError, VmProt};

/// Consolidated error type for all loader operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed container: {0}")]
    MalformedContainer(String),

    #[error("no slice for host {host}, image provides [{}]", arch_list(.available))]
    ArchitectureMismatch {
        host: CpuArch,
        available: Vec<CpuArch>,
    },

    #[error("unsupported image type: {0}")]
    UnsupportedImageType(String),

    #[error("segment conflict: {0}")]
    SegmentConflict(String),

    #[error("address space allocation failed: {0}")]
    AllocationFailure(#[from] VmError),

    #[error("segment {segment} needs file bytes up to 0x{end:x}, slice has 0x{available:x}")]
    ShortRead {
        segment: String,
        end: u64,
        available: u64,
    },

    #[error("fixup requires external symbol `{symbol}`")]
    UnsupportedDynamicBinding { symbol: String },

    #[error("pointer authentication round trip failed for 0x{address:016x}")]
    PointerAuthFailure { address: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

fn arch_list(arches: &[CpuArch]) -> String {
    arches
        .iter()
        .map(|arch| arch.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Probe the host architecture
pub fn probe_host_arch() -> Option<CpuArch> {
    if cfg!(target_arch = "aarch64") {
        Some(CpuArch::ARM64)
    } else if cfg!(target_arch = "x86_64") {
        Some(CpuArch::X86_64)
    } else {
        None
    }
}

/// Load `image` for `host` into the current process and transfer control to
/// its entry point with default settings.
///
/// Only returns on failure, and only after every reservation made for the
/// image has been released.
pub fn execvm(image: &[u8], host: CpuArch) -> Result<Infallible> {
    LoaderBuilder::new(host).build().exec(image)
}
