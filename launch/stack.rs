//! Initial process stack.
//!
//! The stack is a fresh reservation with an inaccessible guard page at its
//! low end. Its top holds copies of the argument and environment strings;
//! below them, starting at the 16-byte aligned stack pointer, sits the
//! vector block a kernel would build for a new process:
//!
//! ```text
//! sp -> argc
//!       argv[0] .. argv[argc-1], NULL
//!       envp[0] .. envp[n-1], NULL
//!       apple[0] .. apple[m-1], NULL     (Darwin)
//!       AT_NULL, 0                       (other hosts)
//!       ... strings ...
//! ```

use crate::vm::{AddressSpace, Placement, Region, VmProt, page_align_up};
use crate::{Error, Result};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use tracing::debug;

pub const DEFAULT_STACK_SIZE: u64 = 8 * 1024 * 1024;

const AT_NULL: u64 = 0;

/// The process-specific vector that follows `envp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupVector {
    /// Darwin's `apple[]` strings, e.g. `executable_path=...`.
    Apple(Vec<Vec<u8>>),
    /// An ELF-style auxiliary vector holding only `AT_NULL`.
    EmptyAuxv,
}

impl StartupVector {
    /// The vector a freshly exec'd process would get on this host.
    pub fn for_host(executable_path: &OsStr) -> Self {
        if cfg!(target_os = "macos") {
            let mut entry = b"executable_path=".to_vec();
            entry.extend_from_slice(executable_path.as_bytes());
            StartupVector::Apple(vec![entry])
        } else {
            StartupVector::EmptyAuxv
        }
    }
}

/// A populated initial stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialStack {
    /// The whole reservation, guard page included.
    pub region: Region,
    /// Address of `argc`; 16-byte aligned.
    pub sp: u64,
    pub argc: u64,
    pub argv: u64,
    pub envp: u64,
    /// `apple[]` on Darwin, the auxiliary vector elsewhere.
    pub apple: u64,
}

/// Reserve a stack of `size` usable bytes and lay out the startup vectors.
/// Strings are raw bytes without their terminators.
///
/// On error the reservation has been released.
pub fn build_stack(
    space: &mut dyn AddressSpace,
    size: u64,
    args: &[Vec<u8>],
    env: &[Vec<u8>],
    startup: &StartupVector,
) -> Result<InitialStack> {
    let page_size = space.page_size();
    let usable = page_align_up(size.max(page_size), page_size).ok_or_else(|| {
        Error::AllocationFailure(crate::vm::VmError::Exhausted { size })
    })?;
    let region = space.reserve(Placement::Anywhere, usable + page_size)?;
    let stack = Region::new(region.start + page_size, usable);

    match populate(space, region, stack, args, env, startup) {
        Ok(initial) => Ok(initial),
        Err(err) => {
            crate::mapper::release(space, region);
            Err(err)
        }
    }
}

fn populate(
    space: &mut dyn AddressSpace,
    region: Region,
    stack: Region,
    args: &[Vec<u8>],
    env: &[Vec<u8>],
    startup: &StartupVector,
) -> Result<InitialStack> {
    space.protect(stack, VmProt::RW)?;

    let apple_strings: &[Vec<u8>] = match startup {
        StartupVector::Apple(strings) => strings,
        StartupVector::EmptyAuxv => &[],
    };

    // Strings, from the top down.
    let mut cursor = stack.end();
    let mut place_all = |strings: &[Vec<u8>]| -> Result<Vec<u64>> {
        let mut addrs = Vec::with_capacity(strings.len());
        for s in strings {
            cursor = place_string(space, cursor, stack, s)?;
            addrs.push(cursor);
        }
        Ok(addrs)
    };
    let arg_addrs = place_all(args)?;
    let env_addrs = place_all(env)?;
    let apple_addrs = place_all(apple_strings)?;

    // Vector block.
    let mut words: Vec<u64> = Vec::new();
    words.push(args.len() as u64);
    let argv_index = words.len();
    words.extend(&arg_addrs);
    words.push(0);
    let envp_index = words.len();
    words.extend(&env_addrs);
    words.push(0);
    let apple_index = words.len();
    match startup {
        StartupVector::Apple(_) => {
            words.extend(&apple_addrs);
            words.push(0);
        }
        StartupVector::EmptyAuxv => words.extend([AT_NULL, 0]),
    }

    let block_size = words.len() as u64 * 8;
    let sp = cursor
        .checked_sub(block_size)
        .map(|sp| sp & !15)
        .filter(|sp| *sp >= stack.start)
        .ok_or_else(|| stack_overflow(stack))?;
    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_ne_bytes()).collect();
    space.write(sp, &bytes)?;

    let initial = InitialStack {
        region,
        sp,
        argc: args.len() as u64,
        argv: sp + argv_index as u64 * 8,
        envp: sp + envp_index as u64 * 8,
        apple: sp + apple_index as u64 * 8,
    };
    debug!(
        "Allocated stack at {} (sp=0x{:x}, argc={}, envc={})",
        stack,
        sp,
        args.len(),
        env.len()
    );
    Ok(initial)
}

/// Copy `bytes` and a terminator just below `cursor`, returning its address.
fn place_string(
    space: &mut dyn AddressSpace,
    cursor: u64,
    stack: Region,
    bytes: &[u8],
) -> Result<u64> {
    let len = bytes.len() as u64 + 1;
    if cursor < stack.start + len {
        return Err(stack_overflow(stack));
    }
    let addr = cursor - len;
    space.write(addr, bytes)?;
    space.write(addr + bytes.len() as u64, &[0])?;
    Ok(addr)
}

fn stack_overflow(stack: Region) -> Error {
    Error::AllocationFailure(crate::vm::VmError::Exhausted { size: stack.size })
}
