//! Synthetic Mach-O images for the integration tests.

#![allow(dead_code)]

use machload::macho::constants::*;

pub const PAGE: u64 = 0x4000;
pub const TEXT: u64 = 0x1_0000_0000;
pub const DATA: u64 = TEXT + PAGE;

pub const PROT_R: u32 = 1;
pub const PROT_RW: u32 = 3;
pub const PROT_RX: u32 = 5;
pub const PROT_RWX: u32 = 7;

struct SegmentSpec {
    name: String,
    vmaddr: u64,
    vmsize: u64,
    prot: u32,
    data: Vec<u8>,
}

enum EntrySpec {
    Main {
        segment: usize,
        offset: u64,
        stacksize: u64,
    },
    Thread(u64),
}

/// Builds a 64-bit little-endian Mach-O image.
///
/// Segment contents are laid out after the load commands, followed by the
/// fixup tables. No segment covers file offset zero.
pub struct ImageBuilder {
    cputype: u32,
    cpusubtype: u32,
    filetype: u32,
    flags: u32,
    segments: Vec<SegmentSpec>,
    entry: Option<EntrySpec>,
    rebase: Vec<u8>,
    bind: Vec<u8>,
    chained: Option<Vec<u8>>,
    dylibs: Vec<String>,
}

impl ImageBuilder {
    pub fn new(cputype: u32, cpusubtype: u32) -> Self {
        Self {
            cputype,
            cpusubtype,
            filetype: MH_EXECUTE,
            flags: MH_PIE,
            segments: Vec::new(),
            entry: None,
            rebase: Vec::new(),
            bind: Vec::new(),
            chained: None,
            dylibs: Vec::new(),
        }
    }

    /// The usual layout: `__PAGEZERO`, a one-page `__TEXT` holding `code`
    /// with the thread entry at its first byte.
    pub fn executable(cputype: u32, cpusubtype: u32, code: &[u8]) -> Self {
        Self::new(cputype, cpusubtype)
            .guard("__PAGEZERO", 0, TEXT)
            .segment("__TEXT", TEXT, PAGE, PROT_RX, code.to_vec())
            .thread_entry(TEXT)
    }

    pub fn filetype(mut self, filetype: u32) -> Self {
        self.filetype = filetype;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn segment(mut self, name: &str, vmaddr: u64, vmsize: u64, prot: u32, data: Vec<u8>) -> Self {
        self.segments.push(SegmentSpec {
            name: name.to_string(),
            vmaddr,
            vmsize,
            prot,
            data,
        });
        self
    }

    pub fn guard(self, name: &str, vmaddr: u64, vmsize: u64) -> Self {
        self.segment(name, vmaddr, vmsize, 0, Vec::new())
    }

    pub fn thread_entry(mut self, pc: u64) -> Self {
        self.entry = Some(EntrySpec::Thread(pc));
        self
    }

    /// `LC_MAIN` pointing at `offset` within segment `segment`'s file data.
    pub fn main_entry(mut self, segment: usize, offset: u64, stacksize: u64) -> Self {
        self.entry = Some(EntrySpec::Main {
            segment,
            offset,
            stacksize,
        });
        self
    }

    pub fn no_entry(mut self) -> Self {
        self.entry = None;
        self
    }

    pub fn rebase_opcodes(mut self, opcodes: Vec<u8>) -> Self {
        self.rebase = opcodes;
        self
    }

    pub fn bind_opcodes(mut self, opcodes: Vec<u8>) -> Self {
        self.bind = opcodes;
        self
    }

    pub fn chained_fixups(mut self, payload: Vec<u8>) -> Self {
        self.chained = Some(payload);
        self
    }

    pub fn dylib(mut self, name: &str) -> Self {
        self.dylibs.push(name.to_string());
        self
    }

    pub fn build(self) -> Vec<u8> {
        let has_dyld_info = !self.rebase.is_empty() || !self.bind.is_empty();
        let thread_state_size = thread_state(self.cputype, 0).len();

        let mut ncmds = self.segments.len() as u32;
        let mut sizeofcmds = self.segments.len() * SEGMENT_COMMAND_64_SIZE;
        match &self.entry {
            Some(EntrySpec::Main { .. }) => {
                ncmds += 1;
                sizeofcmds += ENTRY_POINT_COMMAND_SIZE;
            }
            Some(EntrySpec::Thread(_)) => {
                ncmds += 1;
                sizeofcmds += 8 + thread_state_size;
            }
            None => {}
        }
        if has_dyld_info {
            ncmds += 1;
            sizeofcmds += DYLD_INFO_COMMAND_SIZE;
        }
        if self.chained.is_some() {
            ncmds += 1;
            sizeofcmds += LINKEDIT_DATA_COMMAND_SIZE;
        }
        for name in &self.dylibs {
            ncmds += 1;
            sizeofcmds += dylib_command(LC_LOAD_DYLIB, name).len();
        }

        // File layout.
        let mut cursor = align(MACH_HEADER_64_SIZE + sizeofcmds, 16);
        let mut fileoffs = Vec::new();
        for segment in &self.segments {
            if segment.data.is_empty() {
                fileoffs.push(0);
            } else {
                fileoffs.push(cursor);
                cursor = align(cursor + segment.data.len(), 16);
            }
        }
        let rebase_off = cursor;
        cursor += self.rebase.len();
        let bind_off = cursor;
        cursor += self.bind.len();
        cursor = align(cursor, 8);
        let chained_off = cursor;
        cursor += self.chained.as_ref().map_or(0, Vec::len);
        let file_size = align(cursor, 16);

        let mut out = Vec::with_capacity(file_size);
        for field in [
            MH_MAGIC_64,
            self.cputype,
            self.cpusubtype,
            self.filetype,
            ncmds,
            sizeofcmds as u32,
            self.flags,
            0,
        ] {
            put32(&mut out, field);
        }

        for (segment, fileoff) in self.segments.iter().zip(&fileoffs) {
            put32(&mut out, LC_SEGMENT_64);
            put32(&mut out, SEGMENT_COMMAND_64_SIZE as u32);
            out.extend_from_slice(&name16(&segment.name));
            put64(&mut out, segment.vmaddr);
            put64(&mut out, segment.vmsize);
            put64(&mut out, *fileoff as u64);
            put64(&mut out, segment.data.len() as u64);
            put32(&mut out, segment.prot);
            put32(&mut out, segment.prot);
            put32(&mut out, 0);
            put32(&mut out, 0);
        }
        match &self.entry {
            Some(EntrySpec::Main {
                segment,
                offset,
                stacksize,
            }) => {
                put32(&mut out, LC_MAIN);
                put32(&mut out, ENTRY_POINT_COMMAND_SIZE as u32);
                put64(&mut out, fileoffs[*segment] as u64 + offset);
                put64(&mut out, *stacksize);
            }
            Some(EntrySpec::Thread(pc)) => {
                put32(&mut out, LC_UNIXTHREAD);
                put32(&mut out, (8 + thread_state_size) as u32);
                out.extend_from_slice(&thread_state(self.cputype, *pc));
            }
            None => {}
        }
        if has_dyld_info {
            put32(&mut out, LC_DYLD_INFO_ONLY);
            put32(&mut out, DYLD_INFO_COMMAND_SIZE as u32);
            for (offset, size) in [
                (rebase_off, self.rebase.len()),
                (bind_off, self.bind.len()),
                (0, 0),
                (0, 0),
                (0, 0),
            ] {
                put32(&mut out, if size == 0 { 0 } else { offset as u32 });
                put32(&mut out, size as u32);
            }
        }
        if let Some(payload) = &self.chained {
            put32(&mut out, LC_DYLD_CHAINED_FIXUPS);
            put32(&mut out, LINKEDIT_DATA_COMMAND_SIZE as u32);
            put32(&mut out, chained_off as u32);
            put32(&mut out, payload.len() as u32);
        }
        for name in &self.dylibs {
            out.extend_from_slice(&dylib_command(LC_LOAD_DYLIB, name));
        }
        assert_eq!(out.len(), MACH_HEADER_64_SIZE + sizeofcmds);

        out.resize(file_size, 0);
        for (segment, fileoff) in self.segments.iter().zip(&fileoffs) {
            out[*fileoff..*fileoff + segment.data.len()].copy_from_slice(&segment.data);
        }
        out[rebase_off..rebase_off + self.rebase.len()].copy_from_slice(&self.rebase);
        out[bind_off..bind_off + self.bind.len()].copy_from_slice(&self.bind);
        if let Some(payload) = &self.chained {
            out[chained_off..chained_off + payload.len()].copy_from_slice(payload);
        }
        out
    }
}

/// A Fat image with big-endian 32-bit arch entries, slices aligned to 16K.
pub fn fat(slices: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&FAT_MAGIC.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());

    let mut offset = PAGE as usize;
    let mut placed = Vec::new();
    for (cputype, cpusubtype, bytes) in slices {
        for field in [*cputype, *cpusubtype, offset as u32, bytes.len() as u32, 14] {
            out.extend_from_slice(&field.to_be_bytes());
        }
        placed.push(offset);
        offset = align(offset + bytes.len(), PAGE as usize);
    }
    out.resize(offset, 0);
    for ((_, _, bytes), at) in slices.iter().zip(placed) {
        out[at..at + bytes.len()].copy_from_slice(bytes);
    }
    out
}

/// Thread state whose program counter is `pc`.
fn thread_state(cputype: u32, pc: u64) -> Vec<u8> {
    let mut out = Vec::new();
    match cputype {
        CPU_TYPE_ARM64 => {
            put32(&mut out, ARM_THREAD_STATE64);
            put32(&mut out, 68);
            let mut regs = vec![0u64; 34];
            regs[32] = pc;
            regs.iter().for_each(|reg| put64(&mut out, *reg));
        }
        _ => {
            put32(&mut out, X86_THREAD_STATE64);
            put32(&mut out, 42);
            let mut regs = vec![0u64; 21];
            regs[16] = pc;
            regs.iter().for_each(|reg| put64(&mut out, *reg));
        }
    }
    out
}

fn dylib_command(cmd: u32, name: &str) -> Vec<u8> {
    let cmdsize = align(24 + name.len() + 1, 8);
    let mut out = Vec::new();
    put32(&mut out, cmd);
    put32(&mut out, cmdsize as u32);
    put32(&mut out, 24);
    put32(&mut out, 2);
    put32(&mut out, 0x10000);
    put32(&mut out, 0x10000);
    out.extend_from_slice(name.as_bytes());
    out.resize(cmdsize, 0);
    out
}

/// `dyld_chained_fixups_header` and tables for chains in one segment,
/// one page, with the given imports.
pub fn chained_payload(
    format: u16,
    segment_count: u32,
    segment_index: u32,
    page_start: u16,
    imports: &[&str],
) -> Vec<u8> {
    let starts_offset = 28u32;
    let starts_size = 4 + 4 * segment_count;
    let seg_info_offset = starts_size;
    let imports_offset = starts_offset + starts_size + 24;
    let symbols_offset = imports_offset + 4 * imports.len() as u32;

    let mut out = Vec::new();
    for field in [
        0,
        starts_offset,
        imports_offset,
        symbols_offset,
        imports.len() as u32,
        DYLD_CHAINED_IMPORT,
        0,
    ] {
        put32(&mut out, field);
    }
    put32(&mut out, segment_count);
    for index in 0..segment_count {
        put32(&mut out, if index == segment_index { seg_info_offset } else { 0 });
    }
    put32(&mut out, 24);
    out.extend_from_slice(&(PAGE as u16).to_le_bytes());
    out.extend_from_slice(&format.to_le_bytes());
    put64(&mut out, 0);
    put32(&mut out, 0);
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&page_start.to_le_bytes());

    let mut strings = vec![0u8];
    for name in imports {
        let name_offset = strings.len() as u32;
        // lib_ordinal 1, not weak
        put32(&mut out, 1 | (name_offset << 9));
        strings.extend_from_slice(name.as_bytes());
        strings.push(0);
    }
    out.extend_from_slice(&strings);
    out
}

pub fn uleb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub fn put32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

fn align(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}
