//! Pointer authentication.
//!
//! On arm64 hosts with FEAT_PAuth, code and data pointers can carry a
//! signature in their unused top bits. The loader uses the instruction-A key
//! to sign the entry address with a zero modifier and immediately
//! authenticates it again; the round trip must give back the original
//! address. Authenticated rebases from arm64e chained fixups are signed here
//! too.
//!
//! On every other host these functions pass pointers through unchanged.

use crate::{Error, Result};
use tracing::debug;

/// The four pointer authentication keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacKey {
    IA,
    IB,
    DA,
    DB,
}

impl PacKey {
    /// Decode the two-bit key field used by chained fixups.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => PacKey::IA,
            1 => PacKey::IB,
            2 => PacKey::DA,
            _ => PacKey::DB,
        }
    }
}

/// Whether the host can sign and authenticate pointers.
pub fn is_supported() -> bool {
    arch::is_supported()
}

/// Sign `ptr` with `key` and `modifier`.
pub fn sign(ptr: u64, key: PacKey, modifier: u64) -> u64 {
    if !is_supported() {
        return ptr;
    }
    unsafe { arch::sign(ptr, key, modifier) }
}

/// Authenticate a signed pointer. A mismatch either yields a pointer that
/// differs from the original or, on FEAT_FPAC hardware, traps.
pub fn auth(ptr: u64, key: PacKey, modifier: u64) -> u64 {
    if !is_supported() {
        return ptr;
    }
    unsafe { arch::auth(ptr, key, modifier) }
}

/// Sign `address` with the instruction key and a zero modifier, then
/// authenticate it, returning the authenticated address.
pub fn authenticate_entry(address: u64) -> Result<u64> {
    if !is_supported() {
        return Ok(address);
    }
    let signed = sign(address, PacKey::IA, 0);
    let authenticated = auth(signed, PacKey::IA, 0);
    debug!(
        "Entry 0x{:x} signed as 0x{:x}, authenticated as 0x{:x}",
        address, signed, authenticated
    );
    if authenticated != address {
        return Err(Error::PointerAuthFailure { address });
    }
    Ok(authenticated)
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::PacKey;
    use std::arch::asm;

    pub fn is_supported() -> bool {
        std::arch::is_aarch64_feature_detected!("paca")
    }

    #[target_feature(enable = "paca")]
    pub unsafe fn sign(ptr: u64, key: PacKey, modifier: u64) -> u64 {
        let mut ptr = ptr;
        unsafe {
            match key {
                PacKey::IA => asm!("pacia {ptr}, {m}", ptr = inout(reg) ptr, m = in(reg) modifier, options(pure, nomem, nostack)),
                PacKey::IB => asm!("pacib {ptr}, {m}", ptr = inout(reg) ptr, m = in(reg) modifier, options(pure, nomem, nostack)),
                PacKey::DA => asm!("pacda {ptr}, {m}", ptr = inout(reg) ptr, m = in(reg) modifier, options(pure, nomem, nostack)),
                PacKey::DB => asm!("pacdb {ptr}, {m}", ptr = inout(reg) ptr, m = in(reg) modifier, options(pure, nomem, nostack)),
            }
        }
        ptr
    }

    #[target_feature(enable = "paca")]
    pub unsafe fn auth(ptr: u64, key: PacKey, modifier: u64) -> u64 {
        let mut ptr = ptr;
        unsafe {
            match key {
                PacKey::IA => asm!("autia {ptr}, {m}", ptr = inout(reg) ptr, m = in(reg) modifier, options(pure, nomem, nostack)),
                PacKey::IB => asm!("autib {ptr}, {m}", ptr = inout(reg) ptr, m = in(reg) modifier, options(pure, nomem, nostack)),
                PacKey::DA => asm!("autda {ptr}, {m}", ptr = inout(reg) ptr, m = in(reg) modifier, options(pure, nomem, nostack)),
                PacKey::DB => asm!("autdb {ptr}, {m}", ptr = inout(reg) ptr, m = in(reg) modifier, options(pure, nomem, nostack)),
            }
        }
        ptr
    }
}

#[cfg(not(target_arch = "aarch64"))]
mod arch {
    use super::PacKey;

    pub fn is_supported() -> bool {
        false
    }

    pub unsafe fn sign(ptr: u64, _key: PacKey, _modifier: u64) -> u64 {
        ptr
    }

    pub unsafe fn auth(ptr: u64, _key: PacKey, _modifier: u64) -> u64 {
        ptr
    }
}
