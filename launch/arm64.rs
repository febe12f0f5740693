//! AArch64 entry transfer.

use super::{EntryRegisters, exit_with_status};
use crate::Result;
use std::arch::{asm, naked_asm};
use std::convert::Infallible;

/// Landing pad for a returning `main`: the return value is already in `w0`
/// and the stack is 16-byte aligned.
#[unsafe(naked)]
unsafe extern "C" fn exit_trampoline() -> ! {
    naked_asm!("bl {exit}", "brk #1", exit = sym exit_with_status)
}

pub fn exit_trampoline_address() -> u64 {
    exit_trampoline as unsafe extern "C" fn() -> ! as usize as u64
}

/// Switch to `regs.sp`, clear the remaining general purpose registers and
/// branch to `regs.pc` with `x30` holding the return address.
///
/// `x18` is left alone; it is reserved by the platform on Darwin.
///
/// # Safety
///
/// See [`super::transfer`].
pub unsafe fn jump(regs: &EntryRegisters) -> Result<Infallible> {
    unsafe {
        asm!(
            "mov sp, x9",
            "mov x4, xzr",
            "mov x5, xzr",
            "mov x6, xzr",
            "mov x7, xzr",
            "mov x8, xzr",
            "mov x9, xzr",
            "mov x10, xzr",
            "mov x11, xzr",
            "mov x12, xzr",
            "mov x13, xzr",
            "mov x14, xzr",
            "mov x15, xzr",
            "mov x17, xzr",
            "mov x19, xzr",
            "mov x20, xzr",
            "mov x21, xzr",
            "mov x22, xzr",
            "mov x23, xzr",
            "mov x24, xzr",
            "mov x25, xzr",
            "mov x26, xzr",
            "mov x27, xzr",
            "mov x28, xzr",
            "mov x29, xzr",
            "br x16",
            in("x0") regs.args[0],
            in("x1") regs.args[1],
            in("x2") regs.args[2],
            in("x3") regs.args[3],
            in("x9") regs.sp,
            in("x30") regs.ret,
            in("x16") regs.pc,
            options(noreturn)
        )
    }
}
