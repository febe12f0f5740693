//! The live process address space, backed by `mmap`/`mprotect`/`munmap`.

use super::{AddressSpace, Placement, Region, Reservations, VmError, VmProt, page_align_up};
use tracing::{debug, trace};

// Other kernels take the address as a hint; `reserve` checks the result.
#[cfg(target_os = "linux")]
const MAP_EXACT: libc::c_int = libc::MAP_FIXED_NOREPLACE;
#[cfg(not(target_os = "linux"))]
const MAP_EXACT: libc::c_int = 0;

/// The calling process's own address space.
///
/// Reservations are not unmapped when the handle is dropped:
/// once an image is launched its memory must outlive the loader.
#[derive(Debug)]
pub struct HostAddressSpace {
    reservations: Reservations,
}

impl HostAddressSpace {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 { page_size as u64 } else { 4096 };
        Self {
            reservations: Reservations::new(page_size),
        }
    }

    /// Regions currently reserved through this handle.
    pub fn reservations(&self) -> Vec<Region> {
        self.reservations.live.iter().map(|r| r.region).collect()
    }

    fn mmap_none(&self, hint: u64, size: u64, exact: bool) -> Result<u64, VmError> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        if exact {
            flags |= MAP_EXACT;
        }
        let addr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                size as usize,
                libc::PROT_NONE,
                flags,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EEXIST) => VmError::Unavailable { addr: hint, size },
                Some(libc::ENOMEM) if exact => VmError::Unavailable { addr: hint, size },
                Some(libc::ENOMEM) => VmError::Exhausted { size },
                _ => VmError::Os {
                    op: "mmap",
                    source: err,
                },
            });
        }
        Ok(addr as u64)
    }
}

impl Default for HostAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for HostAddressSpace {
    fn page_size(&self) -> u64 {
        self.reservations.page_size
    }

    fn reserve(&mut self, placement: Placement, size: u64) -> Result<Region, VmError> {
        let size = page_align_up(size.max(1), self.page_size()).ok_or(VmError::Exhausted { size })?;
        let addr = match placement {
            Placement::Exact(addr) => {
                self.reservations.check_aligned(addr)?;
                let region = Region::new(addr, size);
                if addr == 0 || self.reservations.overlaps(&region) {
                    return Err(VmError::Unavailable { addr, size });
                }
                let mapped = self.mmap_none(addr, size, true)?;
                if mapped != addr {
                    // The kernel treated the address as a hint only.
                    unsafe {
                        libc::munmap(mapped as *mut libc::c_void, size as usize);
                    }
                    return Err(VmError::Unavailable { addr, size });
                }
                mapped
            }
            Placement::Anywhere => self.mmap_none(0, size, false)?,
        };
        let region = Region::new(addr, size);
        self.reservations.insert(region);
        debug!("Reserved {} ({:?})", region, placement);
        Ok(region)
    }

    fn protect(&mut self, region: Region, prot: VmProt) -> Result<(), VmError> {
        self.reservations.set_protection(region, prot)?;
        let ret = unsafe {
            libc::mprotect(
                region.start as *mut libc::c_void,
                region.size as usize,
                prot.to_libc(),
            )
        };
        if ret < 0 {
            return Err(VmError::Os {
                op: "mprotect",
                source: std::io::Error::last_os_error(),
            });
        }
        trace!("Protected {} as {}", region, prot);
        Ok(())
    }

    fn release(&mut self, region: Region) -> Result<(), VmError> {
        self.reservations.remove(region)?;
        let ret = unsafe { libc::munmap(region.start as *mut libc::c_void, region.size as usize) };
        if ret < 0 {
            return Err(VmError::Os {
                op: "munmap",
                source: std::io::Error::last_os_error(),
            });
        }
        debug!("Released {}", region);
        Ok(())
    }

    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), VmError> {
        self.reservations
            .check_access(addr, bytes.len() as u64, VmProt::WRITE)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        Ok(())
    }

    fn fill(&mut self, addr: u64, len: u64, byte: u8) -> Result<(), VmError> {
        self.reservations.check_access(addr, len, VmProt::WRITE)?;
        unsafe {
            std::ptr::write_bytes(addr as *mut u8, byte, len as usize);
        }
        Ok(())
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), VmError> {
        self.reservations
            .check_access(addr, buf.len() as u64, VmProt::READ)?;
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_write_release() {
        let mut space = HostAddressSpace::new();
        let page = space.page_size();
        let region = space.reserve(Placement::Anywhere, page + 1).unwrap();
        assert_eq!(region.size, 2 * page);

        // Fresh reservations are inaccessible.
        assert!(matches!(
            space.write(region.start, &[1]),
            Err(VmError::ProtectionViolation { .. })
        ));

        space.protect(region, VmProt::RW).unwrap();
        space.write(region.start + 8, b"machload").unwrap();
        let mut buf = [0u8; 16];
        space.read(region.start, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[0; 8]);
        assert_eq!(&buf[8..], b"machload");

        space.release(region).unwrap();
        assert!(space.reservations().is_empty());
        assert!(space.read(region.start, &mut buf).is_err());
    }

    #[test]
    fn test_exact_conflict_with_own_reservation() {
        let mut space = HostAddressSpace::new();
        let page = space.page_size();
        let region = space.reserve(Placement::Anywhere, 4 * page).unwrap();
        assert!(matches!(
            space.reserve(Placement::Exact(region.start + page), page),
            Err(VmError::Unavailable { .. })
        ));
        space.release(region).unwrap();
    }
}
