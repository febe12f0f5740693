//! In-memory address space model.
//!
//! Behaves like the host backend (page-granular reservations that start out
//! inaccessible, per-page protections, exact placement that can fail) but
//! keeps all bytes in ordinary heap buffers. Ranges can be marked as already
//! occupied to force placement conflicts.

use super::{AddressSpace, Placement, Region, Reservations, VmError, VmProt, page_align_up};
use std::collections::BTreeMap;
use tracing::trace;

const DEFAULT_PAGE_SIZE: u64 = 0x4000;
const ANYWHERE_BASE: u64 = 0x6000_0000_0000;
const ADDRESS_LIMIT: u64 = 0x8000_0000_0000;
const DEFAULT_MEMORY_LIMIT: u64 = 256 * 1024 * 1024;

#[derive(Debug)]
pub struct SimulatedAddressSpace {
    reservations: Reservations,
    memory: BTreeMap<u64, Vec<u8>>,
    occupied: Vec<Region>,
    memory_limit: u64,
}

impl SimulatedAddressSpace {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: u64) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        Self {
            reservations: Reservations::new(page_size),
            memory: BTreeMap::new(),
            occupied: Vec::new(),
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }

    /// Cap the total number of bytes that may be reserved at once.
    pub fn with_memory_limit(mut self, limit: u64) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Mark a range as in use by something other than the loader.
    pub fn occupy(&mut self, region: Region) {
        self.occupied.push(region);
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.live.len()
    }

    pub fn reservations(&self) -> Vec<Region> {
        self.reservations.live.iter().map(|r| r.region).collect()
    }

    /// Protection of the page containing `addr`, if it is reserved.
    pub fn protection_at(&self, addr: u64) -> Option<VmProt> {
        self.reservations.protection_at(addr)
    }

    /// Read bytes regardless of page protection.
    pub fn peek(&self, addr: u64, len: usize) -> Result<Vec<u8>, VmError> {
        let (start, bytes) = self.backing(addr, len as u64)?;
        let offset = (addr - start) as usize;
        Ok(bytes[offset..offset + len].to_vec())
    }

    fn reserved_bytes(&self) -> u64 {
        self.reservations.live.iter().map(|r| r.region.size).sum()
    }

    fn is_free(&self, region: &Region) -> bool {
        region.start != 0
            && region.end() <= ADDRESS_LIMIT
            && !self.reservations.overlaps(region)
            && !self.occupied.iter().any(|o| o.overlaps(region))
    }

    fn find_free(&self, size: u64) -> Option<u64> {
        let page_size = self.page_size();
        let mut candidate = ANYWHERE_BASE;
        loop {
            let region = Region::new(candidate, size);
            if region.end() > ADDRESS_LIMIT {
                return None;
            }
            let blocker = self
                .reservations
                .live
                .iter()
                .map(|r| r.region)
                .chain(self.occupied.iter().copied())
                .filter(|other| other.overlaps(&region))
                .map(|other| other.end())
                .max();
            match blocker {
                Some(end) => candidate = page_align_up(end, page_size)?,
                None => return Some(candidate),
            }
        }
    }

    fn backing(&self, addr: u64, len: u64) -> Result<(u64, &Vec<u8>), VmError> {
        let reservation = self.reservations.find(addr, len)?;
        let start = reservation.region.start;
        let bytes = self
            .memory
            .get(&start)
            .ok_or(VmError::OutOfRange { addr, len })?;
        Ok((start, bytes))
    }

    fn backing_mut(&mut self, addr: u64, len: u64) -> Result<&mut [u8], VmError> {
        self.reservations.check_access(addr, len, VmProt::WRITE)?;
        let start = self.reservations.find(addr, len)?.region.start;
        let bytes = self
            .memory
            .get_mut(&start)
            .ok_or(VmError::OutOfRange { addr, len })?;
        let offset = (addr - start) as usize;
        Ok(&mut bytes[offset..offset + len as usize])
    }
}

impl Default for SimulatedAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for SimulatedAddressSpace {
    fn page_size(&self) -> u64 {
        self.reservations.page_size
    }

    fn reserve(&mut self, placement: Placement, size: u64) -> Result<Region, VmError> {
        let size = page_align_up(size.max(1), self.page_size()).ok_or(VmError::Exhausted { size })?;
        if self.reserved_bytes().saturating_add(size) > self.memory_limit {
            return Err(VmError::Exhausted { size });
        }
        let start = match placement {
            Placement::Exact(addr) => {
                self.reservations.check_aligned(addr)?;
                if !self.is_free(&Region::new(addr, size)) {
                    return Err(VmError::Unavailable { addr, size });
                }
                addr
            }
            Placement::Anywhere => self.find_free(size).ok_or(VmError::Exhausted { size })?,
        };
        let region = Region::new(start, size);
        self.reservations.insert(region);
        self.memory.insert(start, vec![0; size as usize]);
        trace!("Simulated reservation {} ({:?})", region, placement);
        Ok(region)
    }

    fn protect(&mut self, region: Region, prot: VmProt) -> Result<(), VmError> {
        self.reservations.set_protection(region, prot)
    }

    fn release(&mut self, region: Region) -> Result<(), VmError> {
        self.reservations.remove(region)?;
        self.memory.remove(&region.start);
        Ok(())
    }

    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), VmError> {
        self.backing_mut(addr, bytes.len() as u64)?
            .copy_from_slice(bytes);
        Ok(())
    }

    fn fill(&mut self, addr: u64, len: u64, byte: u8) -> Result<(), VmError> {
        self.backing_mut(addr, len)?.fill(byte);
        Ok(())
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), VmError> {
        self.reservations
            .check_access(addr, buf.len() as u64, VmProt::READ)?;
        let (start, bytes) = self.backing(addr, buf.len() as u64)?;
        let offset = (addr - start) as usize;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_placement_conflicts() {
        let mut space = SimulatedAddressSpace::new();
        space.occupy(Region::new(0x1_0000_0000, 0x4000));

        assert!(matches!(
            space.reserve(Placement::Exact(0x1_0000_0000), 0x4000),
            Err(VmError::Unavailable { .. })
        ));
        assert!(matches!(
            space.reserve(Placement::Exact(0x1_0000_1000), 0x4000),
            Err(VmError::Misaligned { .. })
        ));
        let region = space
            .reserve(Placement::Exact(0x1_0000_4000), 0x100)
            .unwrap();
        assert_eq!(region, Region::new(0x1_0000_4000, 0x4000));
        assert!(matches!(
            space.reserve(Placement::Exact(0x1_0000_4000), 0x4000),
            Err(VmError::Unavailable { .. })
        ));
        assert_eq!(space.reservation_count(), 1);
    }

    #[test]
    fn test_anywhere_skips_occupied() {
        let mut space = SimulatedAddressSpace::new();
        space.occupy(Region::new(ANYWHERE_BASE, 0x5000));
        let first = space.reserve(Placement::Anywhere, 0x4000).unwrap();
        assert_eq!(first.start, ANYWHERE_BASE + 0x8000);
        let second = space.reserve(Placement::Anywhere, 0x4000).unwrap();
        assert!(!first.overlaps(&second));
    }

    #[test]
    fn test_protection_enforced() {
        let mut space = SimulatedAddressSpace::new();
        let region = space.reserve(Placement::Anywhere, 0x8000).unwrap();
        assert!(space.write(region.start, &[1, 2, 3]).is_err());

        space.protect(region, VmProt::RW).unwrap();
        space.write(region.start, &[1, 2, 3]).unwrap();
        space.fill(region.start + 3, 5, 0xAA).unwrap();
        space
            .protect(Region::new(region.start, 0x4000), VmProt::READ)
            .unwrap();

        let mut buf = [0u8; 8];
        space.read(region.start, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA]);
        assert!(matches!(
            space.write(region.start, &[0]),
            Err(VmError::ProtectionViolation { .. })
        ));
        assert_eq!(space.protection_at(region.start + 0x4000), Some(VmProt::RW));

        space.release(region).unwrap();
        assert_eq!(space.reservation_count(), 0);
        assert!(space.peek(region.start, 1).is_err());
    }

    #[test]
    fn test_memory_limit() {
        let mut space = SimulatedAddressSpace::new().with_memory_limit(0x8000);
        let region = space.reserve(Placement::Anywhere, 0x8000).unwrap();
        assert!(matches!(
            space.reserve(Placement::Anywhere, 1),
            Err(VmError::Exhausted { .. })
        ));
        space.release(region).unwrap();
        assert!(space.reserve(Placement::Anywhere, 1).is_ok());
    }
}
