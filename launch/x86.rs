//! x86-64 entry transfer.

use super::{EntryRegisters, exit_with_status};
use crate::Result;
use std::arch::{asm, naked_asm};
use std::convert::Infallible;

/// Landing pad for a returning `main`: the return value is in `eax`.
#[unsafe(naked)]
unsafe extern "C" fn exit_trampoline() -> ! {
    naked_asm!(
        "mov edi, eax",
        "and rsp, -16",
        "call {exit}",
        "ud2",
        exit = sym exit_with_status,
    )
}

pub fn exit_trampoline_address() -> u64 {
    exit_trampoline as unsafe extern "C" fn() -> ! as usize as u64
}

/// Switch to `regs.sp`, push the return address if there is one, clear the
/// remaining general purpose registers and jump.
///
/// # Safety
///
/// See [`super::transfer`].
pub unsafe fn jump(regs: &EntryRegisters) -> Result<Infallible> {
    unsafe {
        asm!(
            "mov rsp, r8",
            "test r9, r9",
            "jz 2f",
            "push r9",
            "2:",
            "cld",
            "xor eax, eax",
            "xor ebx, ebx",
            "xor ebp, ebp",
            "xor r8d, r8d",
            "xor r9d, r9d",
            "xor r11d, r11d",
            "xor r12d, r12d",
            "xor r13d, r13d",
            "xor r14d, r14d",
            "xor r15d, r15d",
            "jmp r10",
            in("rdi") regs.args[0],
            in("rsi") regs.args[1],
            in("rdx") regs.args[2],
            in("rcx") regs.args[3],
            in("r8") regs.sp,
            in("r9") regs.ret,
            in("r10") regs.pc,
            options(noreturn)
        )
    }
}
