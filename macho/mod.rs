//! Mach-O and Fat container parsing.
//!
//! This module decodes the raw image bytes into a structured description of
//! the container: either a single (thin) Mach-O image or a Fat header listing
//! architecture slices, each of which can be decoded on demand. Parsing is a
//! pure function of the input buffer; nothing here touches process memory.
//!
//! Every multi-byte field is read with the byte order implied by the magic
//! number of the structure it belongs to (see [`reader::Endian`]).

use crate::vm::VmProt;
use crate::{Error, Result};
use std::fmt::{self, Display};
use std::ops::Range;
use tracing::{debug, trace};

pub mod constants;
pub mod reader;

use constants::*;
use reader::{Endian, Reader};

/// CPU type and subtype pair, as stored in Mach and Fat headers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CpuArch {
    pub cputype: u32,
    pub cpusubtype: u32,
}

impl CpuArch {
    pub const X86_64: CpuArch = CpuArch::new(CPU_TYPE_X86_64, 3);
    pub const ARM64: CpuArch = CpuArch::new(CPU_TYPE_ARM64, 0);
    pub const ARM64E: CpuArch = CpuArch::new(CPU_TYPE_ARM64, 2);
    pub const I386: CpuArch = CpuArch::new(CPU_TYPE_X86, 3);

    pub const fn new(cputype: u32, cpusubtype: u32) -> Self {
        Self {
            cputype,
            cpusubtype,
        }
    }

    /// Subtype with the capability bits stripped.
    pub fn subtype(&self) -> u32 {
        self.cpusubtype & !CPU_SUBTYPE_MASK
    }

    /// Same CPU type and the same subtype, ignoring capability bits.
    pub fn matches_exactly(&self, other: &CpuArch) -> bool {
        self.cputype == other.cputype && self.subtype() == other.subtype()
    }
}

impl Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match goblin::mach::cputype::get_arch_name_from_types(self.cputype, self.subtype()) {
            Some(name) => write!(f, "{name}"),
            None => write!(
                f,
                "cputype 0x{:x} subtype 0x{:x}",
                self.cputype, self.cpusubtype
            ),
        }
    }
}

/// Result of decoding the outermost container.
#[derive(Debug)]
pub enum Container {
    Thin(MachImage),
    Fat(FatHeader),
}

/// Fat (universal) header and its ordered architecture descriptors.
#[derive(Debug, Clone)]
pub struct FatHeader {
    /// `FAT_MAGIC` or `FAT_MAGIC_64`, whatever the byte order on disk.
    pub magic: u32,
    pub arches: Vec<FatArch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatArch {
    pub arch: CpuArch,
    pub offset: u64,
    pub size: u64,
    /// Slice alignment as a power of two.
    pub align: u32,
}

impl FatArch {
    /// Byte range of this slice within the raw image. Bounds were validated
    /// when the header was parsed.
    pub fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.size) as usize
    }
}

impl FatHeader {
    /// Decode the Mach-O image of the slice at `index`.
    pub fn parse_slice(&self, raw: &[u8], index: usize) -> Result<MachImage> {
        let fat_arch = self.arches.get(index).ok_or_else(|| {
            Error::MalformedContainer(format!("fat slice index {index} out of range"))
        })?;
        let bytes = raw.get(fat_arch.range()).ok_or_else(|| {
            Error::MalformedContainer(format!(
                "fat slice {index} at 0x{:x}+0x{:x} exceeds image",
                fat_arch.offset, fat_arch.size
            ))
        })?;
        let image = parse_macho(bytes)?;
        if image.header.arch.cputype != fat_arch.arch.cputype {
            return Err(Error::MalformedContainer(format!(
                "fat descriptor {index} declares {} but slice header is {}",
                fat_arch.arch, image.header.arch
            )));
        }
        Ok(image)
    }
}

#[derive(Debug, Clone)]
pub struct MachHeader {
    /// `MH_MAGIC` or `MH_MAGIC_64`; the byte order is in `endian`.
    pub magic: u32,
    pub is_64: bool,
    pub endian: Endian,
    pub arch: CpuArch,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

impl MachHeader {
    pub fn header_size(&self) -> usize {
        if self.is_64 {
            MACH_HEADER_64_SIZE
        } else {
            MACH_HEADER_SIZE
        }
    }

    /// Width in bytes of a pointer-sized slot in this image.
    pub fn pointer_size(&self) -> usize {
        if self.is_64 { 8 } else { 4 }
    }

    pub fn is_pie(&self) -> bool {
        self.flags & MH_PIE != 0
    }
}

/// A segment load command, in either its 32- or 64-bit form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: VmProt,
    pub initprot: VmProt,
    pub flags: u32,
    pub sections: Vec<Section>,
}

impl Segment {
    /// Guard segments such as `__PAGEZERO` reserve address space in the
    /// image's layout but carry no data and no access rights.
    pub fn is_guard(&self) -> bool {
        self.filesize == 0 && self.initprot.is_empty() && self.maxprot.is_empty()
    }

    pub fn vm_range(&self) -> Range<u64> {
        self.vmaddr..self.vmaddr.saturating_add(self.vmsize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub sectname: String,
    pub segname: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
}

/// `LC_MAIN`: entry point expressed as a file offset into the slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub entryoff: u64,
    pub stacksize: u64,
}

/// `LC_UNIXTHREAD`: initial thread state. `pc` is the program counter of
/// the first thread state flavor this loader understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadEntry {
    pub flavor: u32,
    pub pc: Option<u64>,
}

/// Offset/size pair pointing into the slice's `__LINKEDIT` data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataRange {
    pub offset: u32,
    pub size: u32,
}

impl DataRange {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Borrow the bytes this range describes from the slice.
    pub fn slice<'a>(&self, image: &'a [u8]) -> Result<&'a [u8]> {
        let start = self.offset as usize;
        let end = start + self.size as usize;
        image.get(start..end).ok_or_else(|| {
            Error::MalformedContainer(format!(
                "linkedit range 0x{start:x}..0x{end:x} exceeds slice of 0x{:x} bytes",
                image.len()
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DyldInfo {
    pub rebase: DataRange,
    pub bind: DataRange,
    pub weak_bind: DataRange,
    pub lazy_bind: DataRange,
    pub export: DataRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupTable {
    /// `LC_DYLD_INFO` / `LC_DYLD_INFO_ONLY` opcode streams.
    DyldInfo(DyldInfo),
    /// `LC_DYLD_CHAINED_FIXUPS` payload.
    Chained(DataRange),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadCommand {
    Segment32(Segment),
    Segment64(Segment),
    EntryPoint(EntryPoint),
    UnixThread(ThreadEntry),
    FixupTable(FixupTable),
    LoadDylib { cmd: u32, name: String },
    LoadDylinker { name: String },
    Unknown { cmd: u32, bytes: Vec<u8> },
}

/// Entry point derived from the load commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryCommand {
    Main(EntryPoint),
    Thread(u64),
}

/// A decoded Mach-O image: header plus its load-command stream.
#[derive(Debug, Clone)]
pub struct MachImage {
    pub header: MachHeader,
    pub commands: Vec<LoadCommand>,
}

impl MachImage {
    /// Segment commands in load-command order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.commands.iter().filter_map(|cmd| match cmd {
            LoadCommand::Segment32(segment) | LoadCommand::Segment64(segment) => Some(segment),
            _ => None,
        })
    }

    pub fn fixup_tables(&self) -> impl Iterator<Item = &FixupTable> {
        self.commands.iter().filter_map(|cmd| match cmd {
            LoadCommand::FixupTable(table) => Some(table),
            _ => None,
        })
    }

    pub fn dylibs(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().filter_map(|cmd| match cmd {
            LoadCommand::LoadDylib { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    /// `LC_MAIN` wins over `LC_UNIXTHREAD` when both are present.
    pub fn entry(&self) -> Result<EntryCommand> {
        let mut thread = None;
        for cmd in &self.commands {
            match cmd {
                LoadCommand::EntryPoint(main) => return Ok(EntryCommand::Main(*main)),
                LoadCommand::UnixThread(state) if thread.is_none() => thread = Some(*state),
                _ => {}
            }
        }
        match thread {
            Some(ThreadEntry { pc: Some(pc), .. }) => Ok(EntryCommand::Thread(pc)),
            Some(ThreadEntry { flavor, pc: None }) => Err(Error::MalformedContainer(format!(
                "unsupported thread state flavor {flavor} in LC_UNIXTHREAD"
            ))),
            None => Err(Error::MalformedContainer(
                "image has no entry point command".to_string(),
            )),
        }
    }
}

/// Decode the outermost container of `raw`.
pub fn parse_container(raw: &[u8]) -> Result<Container> {
    let magic = read_magic(raw)?;
    match magic {
        MH_MAGIC | MH_CIGAM | MH_MAGIC_64 | MH_CIGAM_64 => {
            debug!("Detected thin Mach-O image ({} bytes)", raw.len());
            Ok(Container::Thin(parse_macho(raw)?))
        }
        FAT_MAGIC | FAT_CIGAM | FAT_MAGIC_64 | FAT_CIGAM_64 => {
            let fat = parse_fat(raw, magic)?;
            debug!("Detected universal binary with {} slices", fat.arches.len());
            Ok(Container::Fat(fat))
        }
        magic => Err(Error::MalformedContainer(format!(
            "unrecognized magic 0x{magic:08x}"
        ))),
    }
}

fn read_magic(raw: &[u8]) -> Result<u32> {
    Reader::new(raw, Endian::Little).u32()
}

fn parse_fat(raw: &[u8], magic: u32) -> Result<FatHeader> {
    let (is_64, endian) = match magic {
        FAT_MAGIC => (false, Endian::Little),
        FAT_CIGAM => (false, Endian::Big),
        FAT_MAGIC_64 => (true, Endian::Little),
        _ => (true, Endian::Big),
    };
    let mut reader = Reader::at(raw, 4, endian)?;
    let nfat_arch = reader.u32()? as usize;

    let arch_size = if is_64 { FAT_ARCH_64_SIZE } else { FAT_ARCH_SIZE };
    let table_end = nfat_arch
        .checked_mul(arch_size)
        .and_then(|size| size.checked_add(FAT_HEADER_SIZE))
        .filter(|end| *end <= raw.len())
        .ok_or_else(|| {
            Error::MalformedContainer(format!(
                "fat header declares {nfat_arch} slices, table exceeds image of 0x{:x} bytes",
                raw.len()
            ))
        })?;
    trace!("Fat arch table ends at 0x{:x}", table_end);

    let mut arches = Vec::with_capacity(nfat_arch);
    for index in 0..nfat_arch {
        let cputype = reader.u32()?;
        let cpusubtype = reader.u32()?;
        let (offset, size) = if is_64 {
            (reader.u64()?, reader.u64()?)
        } else {
            (reader.u32()? as u64, reader.u32()? as u64)
        };
        let align = reader.u32()?;
        if is_64 {
            reader.skip(4)?;
        }

        let in_bounds = offset
            .checked_add(size)
            .is_some_and(|end| end <= raw.len() as u64);
        if !in_bounds {
            return Err(Error::MalformedContainer(format!(
                "fat slice {index} at 0x{offset:x}+0x{size:x} exceeds image of 0x{:x} bytes",
                raw.len()
            )));
        }

        let arch = FatArch {
            arch: CpuArch::new(cputype, cpusubtype),
            offset,
            size,
            align,
        };
        trace!(
            "Fat slice {}: {} at 0x{:x}, size 0x{:x}",
            index, arch.arch, offset, size
        );
        arches.push(arch);
    }

    let magic = if is_64 { FAT_MAGIC_64 } else { FAT_MAGIC };
    Ok(FatHeader { magic, arches })
}

/// Decode a single (thin) Mach-O image occupying all of `slice`.
pub fn parse_macho(slice: &[u8]) -> Result<MachImage> {
    let magic = read_magic(slice)?;
    let (is_64, endian) = match magic {
        MH_MAGIC => (false, Endian::Little),
        MH_CIGAM => (false, Endian::Big),
        MH_MAGIC_64 => (true, Endian::Little),
        MH_CIGAM_64 => (true, Endian::Big),
        magic => {
            return Err(Error::MalformedContainer(format!(
                "not a Mach-O image: magic 0x{magic:08x}"
            )));
        }
    };

    let mut reader = Reader::at(slice, 4, endian)?;
    let cputype = reader.u32()?;
    let cpusubtype = reader.u32()?;
    let filetype = reader.u32()?;
    let ncmds = reader.u32()?;
    let sizeofcmds = reader.u32()?;
    let flags = reader.u32()?;
    if is_64 {
        reader.skip(4)?;
    }

    let header = MachHeader {
        magic: if is_64 { MH_MAGIC_64 } else { MH_MAGIC },
        is_64,
        endian,
        arch: CpuArch::new(cputype, cpusubtype),
        filetype,
        ncmds,
        sizeofcmds,
        flags,
    };

    let commands_start = header.header_size();
    let commands_end = commands_start
        .checked_add(sizeofcmds as usize)
        .filter(|end| *end <= slice.len())
        .ok_or_else(|| {
            Error::MalformedContainer(format!(
                "load commands (0x{sizeofcmds:x} bytes) exceed image of 0x{:x} bytes",
                slice.len()
            ))
        })?;

    let commands = parse_load_cmds(slice, &header, commands_start, commands_end)?;
    debug!(
        "Parsed {} Mach-O: {} load commands, filetype 0x{:x}, flags 0x{:x}",
        header.arch,
        commands.len(),
        filetype,
        flags
    );
    Ok(MachImage { header, commands })
}

fn parse_load_cmds(
    slice: &[u8],
    header: &MachHeader,
    start: usize,
    end: usize,
) -> Result<Vec<LoadCommand>> {
    let region = &slice[..end];
    let capacity = (header.ncmds as usize).min((end - start) / LOAD_COMMAND_SIZE);
    let mut commands = Vec::with_capacity(capacity);
    let mut offset = start;
    for index in 0..header.ncmds {
        let mut reader = Reader::at(region, offset, header.endian)?;
        let cmd = reader.u32()?;
        let cmdsize = reader.u32()? as usize;
        if cmdsize < LOAD_COMMAND_SIZE {
            return Err(Error::MalformedContainer(format!(
                "load command {index} (0x{cmd:x}) has invalid size {cmdsize}"
            )));
        }
        let cmd_end = offset
            .checked_add(cmdsize)
            .filter(|cmd_end| *cmd_end <= end)
            .ok_or_else(|| {
                Error::MalformedContainer(format!(
                    "load command {index} (0x{cmd:x}, {cmdsize} bytes) runs past the load command area"
                ))
            })?;

        let command = parse_load_command(cmd, &region[offset..cmd_end], header)?;
        trace!("Load command {}: 0x{:x} ({} bytes)", index, cmd, cmdsize);
        commands.push(command);
        offset = cmd_end;
    }
    Ok(commands)
}

/// Decode one load command. `bytes` is exactly the command's `cmdsize`
/// bytes, so no field can be read from outside the command.
fn parse_load_command(cmd: u32, bytes: &[u8], header: &MachHeader) -> Result<LoadCommand> {
    if let Some(size) = fixed_command_size(cmd)
        && bytes.len() < size
    {
        return Err(Error::MalformedContainer(format!(
            "load command 0x{cmd:x} has cmdsize {}, smaller than its fixed size {size}",
            bytes.len()
        )));
    }
    let mut reader = Reader::at(bytes, LOAD_COMMAND_SIZE, header.endian)?;
    let command = match cmd {
        LC_SEGMENT => LoadCommand::Segment32(parse_segment(&mut reader, false)?),
        LC_SEGMENT_64 => LoadCommand::Segment64(parse_segment(&mut reader, true)?),
        LC_MAIN => LoadCommand::EntryPoint(EntryPoint {
            entryoff: reader.u64()?,
            stacksize: reader.u64()?,
        }),
        LC_UNIXTHREAD => LoadCommand::UnixThread(parse_thread_state(&mut reader, header)?),
        LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
            let mut range = || -> Result<DataRange> {
                Ok(DataRange {
                    offset: reader.u32()?,
                    size: reader.u32()?,
                })
            };
            LoadCommand::FixupTable(FixupTable::DyldInfo(DyldInfo {
                rebase: range()?,
                bind: range()?,
                weak_bind: range()?,
                lazy_bind: range()?,
                export: range()?,
            }))
        }
        LC_DYLD_CHAINED_FIXUPS => LoadCommand::FixupTable(FixupTable::Chained(DataRange {
            offset: reader.u32()?,
            size: reader.u32()?,
        })),
        LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LAZY_LOAD_DYLIB
        | LC_LOAD_UPWARD_DYLIB => LoadCommand::LoadDylib {
            cmd,
            name: command_string(&mut reader, bytes)?,
        },
        LC_LOAD_DYLINKER => LoadCommand::LoadDylinker {
            name: command_string(&mut reader, bytes)?,
        },
        cmd => LoadCommand::Unknown {
            cmd,
            bytes: bytes.to_vec(),
        },
    };
    Ok(command)
}

/// Size of the fixed part of the commands this parser decodes.
fn fixed_command_size(cmd: u32) -> Option<usize> {
    let size = match cmd {
        LC_SEGMENT => SEGMENT_COMMAND_SIZE,
        LC_SEGMENT_64 => SEGMENT_COMMAND_64_SIZE,
        LC_MAIN => ENTRY_POINT_COMMAND_SIZE,
        LC_UNIXTHREAD => THREAD_COMMAND_SIZE,
        LC_DYLD_INFO | LC_DYLD_INFO_ONLY => DYLD_INFO_COMMAND_SIZE,
        LC_DYLD_CHAINED_FIXUPS => LINKEDIT_DATA_COMMAND_SIZE,
        LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LAZY_LOAD_DYLIB
        | LC_LOAD_UPWARD_DYLIB => DYLIB_COMMAND_SIZE,
        LC_LOAD_DYLINKER => DYLINKER_COMMAND_SIZE,
        _ => return None,
    };
    Some(size)
}

/// Read an `lc_str` (offset from the start of the command) and the string it
/// points to.
fn command_string(reader: &mut Reader<'_>, bytes: &[u8]) -> Result<String> {
    let name_offset = reader.u32()? as usize;
    Reader::at(bytes, name_offset, reader.endian())?.cstr()
}

fn parse_segment(reader: &mut Reader<'_>, is_64: bool) -> Result<Segment> {
    let name = reader.name16()?;
    let (vmaddr, vmsize, fileoff, filesize) = if is_64 {
        (reader.u64()?, reader.u64()?, reader.u64()?, reader.u64()?)
    } else {
        (
            reader.u32()? as u64,
            reader.u32()? as u64,
            reader.u32()? as u64,
            reader.u32()? as u64,
        )
    };
    let maxprot = VmProt::from_bits_truncate(reader.u32()?);
    let initprot = VmProt::from_bits_truncate(reader.u32()?);
    let nsects = reader.u32()? as usize;
    let flags = reader.u32()?;

    let section_size = if is_64 { SECTION_64_SIZE } else { SECTION_SIZE };
    let fits = nsects
        .checked_mul(section_size)
        .is_some_and(|size| size <= reader.remaining());
    if !fits {
        return Err(Error::MalformedContainer(format!(
            "segment {name} declares {nsects} sections that do not fit in its load command"
        )));
    }

    let mut sections = Vec::with_capacity(nsects);
    for _ in 0..nsects {
        let sectname = reader.name16()?;
        let segname = reader.name16()?;
        let (addr, size) = if is_64 {
            (reader.u64()?, reader.u64()?)
        } else {
            (reader.u32()? as u64, reader.u32()? as u64)
        };
        let section = Section {
            sectname,
            segname,
            addr,
            size,
            offset: reader.u32()?,
            align: reader.u32()?,
            reloff: reader.u32()?,
            nreloc: reader.u32()?,
            flags: reader.u32()?,
        };
        // reserved1, reserved2 (and reserved3 for 64-bit)
        reader.skip(if is_64 { 12 } else { 8 })?;
        sections.push(section);
    }

    Ok(Segment {
        name,
        vmaddr,
        vmsize,
        fileoff,
        filesize,
        maxprot,
        initprot,
        flags,
        sections,
    })
}

/// Walk the thread state flavors of an `LC_UNIXTHREAD` and pull out the
/// initial program counter.
fn parse_thread_state(reader: &mut Reader<'_>, header: &MachHeader) -> Result<ThreadEntry> {
    let mut first_flavor = None;
    while reader.remaining() >= 8 {
        let flavor = reader.u32()?;
        let count = reader.u32()? as usize;
        first_flavor.get_or_insert(flavor);
        let state_size = count.checked_mul(4).ok_or_else(|| {
            Error::MalformedContainer(format!("thread state count {count} overflows"))
        })?;
        let state = reader.bytes(state_size)?;
        let mut regs = Reader::new(state, header.endian);

        // (register width, index of the program counter)
        let pc_slot = match (header.arch.cputype, flavor) {
            (CPU_TYPE_X86_64, X86_THREAD_STATE64) => Some((8, 16)), // rip
            (CPU_TYPE_ARM64, ARM_THREAD_STATE64) => Some((8, 32)),  // pc
            (CPU_TYPE_X86, X86_THREAD_STATE32) => Some((4, 10)),    // eip
            (CPU_TYPE_ARM, ARM_THREAD_STATE) => Some((4, 15)),      // pc
            _ => None,
        };
        if let Some((width, index)) = pc_slot {
            regs.seek(width * index)?;
            let pc = if width == 8 {
                regs.u64()?
            } else {
                regs.u32()? as u64
            };
            return Ok(ThreadEntry {
                flavor,
                pc: Some(pc),
            });
        }
    }
    Ok(ThreadEntry {
        flavor: first_flavor.unwrap_or(0),
        pc: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_le(cputype: u32, ncmds: u32, sizeofcmds: u32) -> Vec<u8> {
        let mut out = Vec::new();
        for field in [
            MH_MAGIC_64,
            cputype,
            0,
            MH_EXECUTE,
            ncmds,
            sizeofcmds,
            MH_PIE,
            0,
        ] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_unrecognized_magic() {
        let data = [0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0];
        assert!(matches!(
            parse_container(&data),
            Err(Error::MalformedContainer(_))
        ));
        assert!(matches!(
            parse_container(&[0xcf, 0xfa]),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_command_shorter_than_fixed_size() {
        let mut data = header_le(CPU_TYPE_ARM64, 1, 16);
        for field in [LC_MAIN, 16, 0, 0] {
            data.extend_from_slice(&field.to_le_bytes());
        }
        let err = parse_container(&data).unwrap_err();
        assert!(
            matches!(&err, Error::MalformedContainer(msg) if msg.contains("fixed size 24")),
            "{err}"
        );
    }

    #[test]
    fn test_sizeofcmds_exceeds_buffer() {
        let data = header_le(CPU_TYPE_ARM64, 1, 0x1000);
        assert!(matches!(
            parse_macho(&data),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_zero_sized_load_command() {
        let mut data = header_le(CPU_TYPE_ARM64, 1, 8);
        data.extend_from_slice(&0x1bu32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            parse_macho(&data),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_unknown_command_is_kept_raw() {
        let mut data = header_le(CPU_TYPE_X86_64, 1, 16);
        let mut cmd = Vec::new();
        cmd.extend_from_slice(&0x1bu32.to_le_bytes()); // LC_UUID
        cmd.extend_from_slice(&16u32.to_le_bytes());
        cmd.extend_from_slice(&[0xAB; 8]);
        data.extend_from_slice(&cmd);

        let image = parse_macho(&data).unwrap();
        assert_eq!(image.header.arch.cputype, CPU_TYPE_X86_64);
        assert!(image.header.is_pie());
        assert_eq!(
            image.commands,
            vec![LoadCommand::Unknown {
                cmd: 0x1b,
                bytes: cmd
            }]
        );
    }

    #[test]
    fn test_big_endian_header() {
        let mut data = Vec::new();
        for field in [0xfeedfaceu32, 18, 0, MH_EXECUTE, 0, 0, 0] {
            data.extend_from_slice(&field.to_be_bytes());
        }
        let image = parse_macho(&data).unwrap();
        assert_eq!(image.header.endian, Endian::Big);
        assert_eq!(image.header.magic, MH_MAGIC);
        assert!(!image.header.is_64);
        assert_eq!(image.header.arch.cputype, 18);
        assert_eq!(image.header.pointer_size(), 4);
    }

    #[test]
    fn test_fat_magic_is_canonical() {
        let mut data = Vec::new();
        for field in [FAT_MAGIC, 0] {
            data.extend_from_slice(&field.to_be_bytes());
        }
        let Container::Fat(fat) = parse_container(&data).unwrap() else {
            panic!("expected a fat container");
        };
        assert_eq!(fat.magic, FAT_MAGIC);

        let mut data = Vec::new();
        for field in [FAT_MAGIC_64, 0] {
            data.extend_from_slice(&field.to_le_bytes());
        }
        let Container::Fat(fat) = parse_container(&data).unwrap() else {
            panic!("expected a fat container");
        };
        assert_eq!(fat.magic, FAT_MAGIC_64);
    }

    #[test]
    fn test_fat_slice_out_of_bounds() {
        let mut data = Vec::new();
        for field in [FAT_MAGIC, 1, CPU_TYPE_ARM64, 0, 0x1000, 0x10, 14] {
            data.extend_from_slice(&field.to_be_bytes());
        }
        assert!(matches!(
            parse_container(&data),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_fat_table_exceeds_buffer() {
        let mut data = Vec::new();
        for field in [FAT_MAGIC, 0x1000_0000] {
            data.extend_from_slice(&field.to_be_bytes());
        }
        assert!(matches!(
            parse_container(&data),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_arch_display() {
        assert_eq!(CpuArch::X86_64.to_string(), "x86_64");
        assert_eq!(CpuArch::ARM64.to_string(), "arm64");
        assert!(CpuArch::new(0x1234, 0).to_string().contains("0x1234"));
    }

    #[test]
    fn test_subtype_capability_bits_ignored() {
        let lib64 = CpuArch::new(CPU_TYPE_X86_64, 0x8000_0003);
        assert!(lib64.matches_exactly(&CpuArch::X86_64));
        assert!(!CpuArch::ARM64E.matches_exactly(&CpuArch::ARM64));
    }
}
