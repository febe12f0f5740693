//! Address space resource.
//!
//! The loader never touches process memory directly. Every reservation,
//! protection change and byte copy goes through an [`AddressSpace`] handle so
//! the whole pipeline can run against the live process ([`HostAddressSpace`])
//! or against an in-memory model ([`SimulatedAddressSpace`]).
//!
//! Both backends validate accesses against their live reservations and the
//! protection of every page touched, so an out-of-bounds fixup is an error
//! instead of a stray write.

use bitflags::bitflags;
use std::fmt::{self, Display};

#[cfg(unix)]
mod host;
mod simulated;

#[cfg(unix)]
pub use host::HostAddressSpace;
pub use simulated::SimulatedAddressSpace;

bitflags! {
    /// Memory protection, with the same bit values as Mach-O `vm_prot_t`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VmProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

impl VmProt {
    pub const RW: VmProt = VmProt::READ.union(VmProt::WRITE);
    pub const RX: VmProt = VmProt::READ.union(VmProt::EXECUTE);

    /// Writable and executable at the same time.
    pub fn is_wx(&self) -> bool {
        self.contains(VmProt::WRITE | VmProt::EXECUTE)
    }

    #[cfg(unix)]
    pub fn to_libc(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(VmProt::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(VmProt::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(VmProt::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

impl Display for VmProt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit, c| if self.contains(bit) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(VmProt::READ, 'r'),
            flag(VmProt::WRITE, 'w'),
            flag(VmProt::EXECUTE, 'x')
        )
    }
}

/// Errors produced by address space backends.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("range 0x{addr:x}+0x{size:x} is unavailable")]
    Unavailable { addr: u64, size: u64 },

    #[error("no free range of 0x{size:x} bytes")]
    Exhausted { size: u64 },

    #[error("access 0x{addr:x}+0x{len:x} is outside any reservation")]
    OutOfRange { addr: u64, len: u64 },

    #[error("0x{addr:x} is not aligned to the 0x{page_size:x} byte page size")]
    Misaligned { addr: u64, page_size: u64 },

    #[error("access at 0x{addr:x} needs {required}, page is {actual}")]
    ProtectionViolation {
        addr: u64,
        required: VmProt,
        actual: VmProt,
    },

    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        source: std::io::Error,
    },
}

/// A contiguous, page-aligned range of virtual addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub start: u64,
    pub size: u64,
}

impl Region {
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.start && addr.checked_add(len).is_some_and(|end| end <= self.end())
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}..0x{:x}", self.start, self.end())
    }
}

/// Where a reservation should be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Exactly at this address, or fail with [`VmError::Unavailable`].
    Exact(u64),
    /// Wherever the backend finds room.
    Anywhere,
}

/// Handle on an address space the loader maps images into.
pub trait AddressSpace {
    fn page_size(&self) -> u64;

    /// Reserve `size` bytes (rounded up to the page size). Reserved pages start
    /// out inaccessible.
    fn reserve(&mut self, placement: Placement, size: u64) -> Result<Region, VmError>;

    /// Change the protection of a page-aligned range inside one reservation.
    fn protect(&mut self, region: Region, prot: VmProt) -> Result<(), VmError>;

    /// Give back a whole reservation returned by [`AddressSpace::reserve`].
    fn release(&mut self, region: Region) -> Result<(), VmError>;

    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), VmError>;

    fn fill(&mut self, addr: u64, len: u64, byte: u8) -> Result<(), VmError>;

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), VmError>;
}

pub(crate) fn page_align_up(value: u64, page_size: u64) -> Option<u64> {
    value
        .checked_add(page_size - 1)
        .map(|value| value & !(page_size - 1))
}

pub(crate) fn page_align_down(value: u64, page_size: u64) -> u64 {
    value & !(page_size - 1)
}

/// A live reservation and the protection of each of its pages.
#[derive(Debug, Clone)]
struct Reservation {
    region: Region,
    prots: Vec<VmProt>,
}

/// Reservation bookkeeping shared by the backends.
#[derive(Debug)]
struct Reservations {
    page_size: u64,
    live: Vec<Reservation>,
}

impl Reservations {
    fn new(page_size: u64) -> Self {
        Self {
            page_size,
            live: Vec::new(),
        }
    }

    fn overlaps(&self, region: &Region) -> bool {
        self.live.iter().any(|r| r.region.overlaps(region))
    }

    fn insert(&mut self, region: Region) {
        let pages = (region.size / self.page_size) as usize;
        self.live.push(Reservation {
            region,
            prots: vec![VmProt::empty(); pages],
        });
    }

    fn remove(&mut self, region: Region) -> Result<(), VmError> {
        let index = self
            .live
            .iter()
            .position(|r| r.region == region)
            .ok_or(VmError::OutOfRange {
                addr: region.start,
                len: region.size,
            })?;
        self.live.swap_remove(index);
        Ok(())
    }

    fn find(&self, addr: u64, len: u64) -> Result<&Reservation, VmError> {
        self.live
            .iter()
            .find(|r| r.region.contains(addr, len))
            .ok_or(VmError::OutOfRange { addr, len })
    }

    fn check_aligned(&self, addr: u64) -> Result<(), VmError> {
        if addr % self.page_size != 0 {
            return Err(VmError::Misaligned {
                addr,
                page_size: self.page_size,
            });
        }
        Ok(())
    }

    fn set_protection(&mut self, region: Region, prot: VmProt) -> Result<(), VmError> {
        self.check_aligned(region.start)?;
        self.check_aligned(region.size)?;
        let page_size = self.page_size;
        let reservation = self
            .live
            .iter_mut()
            .find(|r| r.region.contains(region.start, region.size))
            .ok_or(VmError::OutOfRange {
                addr: region.start,
                len: region.size,
            })?;
        let first = ((region.start - reservation.region.start) / page_size) as usize;
        let count = (region.size / page_size) as usize;
        for page in &mut reservation.prots[first..first + count] {
            *page = prot;
        }
        Ok(())
    }

    /// Every page touched by `addr..addr+len` must grant `required`.
    fn check_access(&self, addr: u64, len: u64, required: VmProt) -> Result<(), VmError> {
        let reservation = self.find(addr, len)?;
        if len == 0 {
            return Ok(());
        }
        let first = (addr - reservation.region.start) / self.page_size;
        let last = (addr + len - 1 - reservation.region.start) / self.page_size;
        for page in first..=last {
            let actual = reservation.prots[page as usize];
            if !actual.contains(required) {
                return Err(VmError::ProtectionViolation {
                    addr: (reservation.region.start + page * self.page_size).max(addr),
                    required,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn protection_at(&self, addr: u64) -> Option<VmProt> {
        let reservation = self.find(addr, 1).ok()?;
        let page = (addr - reservation.region.start) / self.page_size;
        Some(reservation.prots[page as usize])
    }
}
