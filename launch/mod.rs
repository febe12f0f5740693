//! Entry transfer.
//!
//! Once an image is mapped and fixed up, the launcher builds a fresh stack
//! and jumps to the entry point on the calling thread. The jump is one-way:
//! the loader's frames are abandoned along with the old stack pointer.
//!
//! Two entry flavours exist:
//!
//! - `LC_UNIXTHREAD` images start like a freshly exec'd process: the stack
//!   pointer addresses `argc` and the argument registers are zero.
//! - `LC_MAIN` images have their entry called as
//!   `main(argc, argv, envp, apple)`. Returning from it lands in an exit
//!   trampoline that passes the return value to `exit`.

use crate::Result;
use std::convert::Infallible;
use tracing::debug;

pub mod stack;

#[cfg(target_arch = "aarch64")]
pub mod arm64;

#[cfg(target_arch = "aarch64")]
pub use arm64 as arch;

#[cfg(target_arch = "x86_64")]
pub mod x86;

#[cfg(target_arch = "x86_64")]
pub use x86 as arch;

pub use stack::{DEFAULT_STACK_SIZE, InitialStack, StartupVector, build_stack};

/// How control reaches the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// `LC_MAIN`, with the stack size the image asked for (0 = default).
    Main { stack_size: u64 },
    /// `LC_UNIXTHREAD`.
    Thread,
}

/// Slid (and, where applicable, authenticated) entry address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub address: u64,
    pub kind: EntryKind,
}

/// Register state handed to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRegisters {
    pub pc: u64,
    pub sp: u64,
    /// First four integer argument registers.
    pub args: [u64; 4],
    /// Return address, or zero for a raw process start.
    pub ret: u64,
}

impl EntryRegisters {
    pub fn new(entry: &Entry, stack: &InitialStack, exit_trampoline: u64) -> Self {
        match entry.kind {
            EntryKind::Main { .. } => Self {
                pc: entry.address,
                sp: stack.sp,
                args: [stack.argc, stack.argv, stack.envp, stack.apple],
                ret: exit_trampoline,
            },
            EntryKind::Thread => Self {
                pc: entry.address,
                sp: stack.sp,
                args: [0; 4],
                ret: 0,
            },
        }
    }
}

/// Jump to `entry` on `stack`.
///
/// # Safety
///
/// `entry` must be the entry point of an image that is fully mapped, fixed
/// up and protected, and `stack` must be a populated stack in the live
/// address space. Nothing the caller owns is cleaned up.
#[cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]
pub unsafe fn transfer(entry: &Entry, stack: &InitialStack) -> Result<Infallible> {
    let regs = EntryRegisters::new(entry, stack, arch::exit_trampoline_address());
    debug!(
        "Transferring control to 0x{:x} (sp=0x{:x}, {:?})",
        regs.pc, regs.sp, entry.kind
    );
    unsafe { arch::jump(&regs) }
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
pub unsafe fn transfer(_entry: &Entry, _stack: &InitialStack) -> Result<Infallible> {
    Err(crate::Error::UnsupportedImageType(
        "entry transfer is not implemented for this host architecture".to_string(),
    ))
}

/// Called by the exit trampolines with the value `main` returned.
#[cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]
extern "C" fn exit_with_status(status: libc::c_int) -> ! {
    unsafe { libc::exit(status) }
}
