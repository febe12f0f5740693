//! The load pipeline.
//!
//! [`Loader::load`] runs every stage that can fail (parsing, slice
//! selection, validation, fixup collection, mapping, fixup application,
//! protection finalisation and entry authentication) against any
//! [`AddressSpace`]. [`Loader::exec`] does the same in the live process and
//! then builds a stack and jumps to the image.

use crate::fixup::{apply_fixups, check_fixup_slots, collect_fixups};
use crate::launch::{self, DEFAULT_STACK_SIZE, Entry, EntryKind, InitialStack, StartupVector};
use crate::macho::constants::{MH_DYLIB, MH_EXECUTE, MH_OBJECT};
use crate::macho::{CpuArch, EntryCommand, MachImage, parse_container};
use crate::mapper::{
    ImagePlacement, MappedImage, finalize_protections, loadable_segments, map_segments, release,
};
use crate::select::select_slice;
use crate::vm::{AddressSpace, Region, VmProt};
use crate::{Error, Result, ptrauth};
use std::convert::Infallible;
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use tracing::debug;

pub struct LoaderBuilder {
    host: CpuArch,
    args: Vec<OsString>,
    inherit_env: bool,
    env: Vec<(OsString, OsString)>,
    stack_size: Option<u64>,
    placement: ImagePlacement,
    executable_path: OsString,
}

impl LoaderBuilder {
    pub fn new(host: CpuArch) -> Self {
        Self {
            host,
            args: Vec::new(),
            inherit_env: true,
            env: Vec::new(),
            stack_size: None,
            placement: ImagePlacement::Preferred,
            executable_path: OsString::from("a.out"),
        }
    }

    /// Arguments passed to the image, `argv[0]` included. Defaults to the
    /// executable path alone.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the image sees the loader's own environment.
    pub fn inherit_env(mut self, inherit_env: bool) -> Self {
        self.inherit_env = inherit_env;
        self
    }

    /// Extra environment variables, appended after inherited ones.
    pub fn env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env = env
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self
    }

    /// Stack size override. Without one, `LC_MAIN`'s stack size is used if
    /// set, else 8 MiB.
    pub fn stack_size(mut self, stack_size: u64) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    pub fn placement(mut self, placement: ImagePlacement) -> Self {
        self.placement = placement;
        self
    }

    /// Path reported to the image (`executable_path=` on Darwin).
    pub fn executable_path(mut self, path: impl Into<OsString>) -> Self {
        self.executable_path = path.into();
        self
    }

    pub fn build(self) -> Loader {
        Loader {
            host: self.host,
            args: self.args,
            inherit_env: self.inherit_env,
            env: self.env,
            stack_size: self.stack_size,
            placement: self.placement,
            executable_path: self.executable_path,
        }
    }
}

/// Loads Mach-O images for one host architecture.
pub struct Loader {
    host: CpuArch,
    args: Vec<OsString>,
    inherit_env: bool,
    env: Vec<(OsString, OsString)>,
    stack_size: Option<u64>,
    placement: ImagePlacement,
    executable_path: OsString,
}

/// An image mapped, fixed up and protected, ready for entry.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub arch: CpuArch,
    /// Lowest mapped address.
    pub base: u64,
    /// Actual minus preferred base.
    pub slide: u64,
    pub entry: Entry,
    pub mapped: MappedImage,
    pub fixup_count: usize,
}

impl LoadedImage {
    /// Regions owned by the image.
    pub fn regions(&self) -> Vec<Region> {
        vec![self.mapped.reservation]
    }

    /// Give the image's memory back to `space`.
    pub fn unload(self, space: &mut dyn AddressSpace) -> Result<()> {
        space.release(self.mapped.reservation)?;
        Ok(())
    }
}

impl Loader {
    pub fn host(&self) -> CpuArch {
        self.host
    }

    /// Map `raw` into `space` without running it.
    ///
    /// On error nothing is left reserved in `space`.
    pub fn load(&self, space: &mut dyn AddressSpace, raw: &[u8]) -> Result<LoadedImage> {
        let container = parse_container(raw)?;
        let slice = select_slice(container, raw, self.host)?;
        let image = &slice.image;
        validate_image(image)?;

        let (preferred_entry, kind) = preferred_entry(image)?;
        let fixups = collect_fixups(image, slice.bytes)?;
        check_fixup_slots(image, &fixups)?;

        let mapped = map_segments(space, image, slice.bytes, self.placement)?;
        match finish(space, &mapped, &fixups, preferred_entry) {
            Ok(address) => {
                debug!(
                    "Loaded {} image at 0x{:x}, entry 0x{:x}",
                    image.header.arch,
                    mapped.base(),
                    address
                );
                Ok(LoadedImage {
                    arch: image.header.arch,
                    base: mapped.base(),
                    slide: mapped.slide,
                    entry: Entry { address, kind },
                    fixup_count: fixups.len(),
                    mapped,
                })
            }
            Err(err) => {
                release(space, mapped.reservation);
                Err(err)
            }
        }
    }

    /// Load `raw` into the current process and jump to it.
    ///
    /// Returns only on failure, with the address space restored.
    #[cfg(unix)]
    pub fn exec(&self, raw: &[u8]) -> Result<Infallible> {
        let mut space = crate::vm::HostAddressSpace::new();
        let image = self.load(&mut space, raw)?;
        self.launch(&mut space, image)
    }

    /// Build the initial stack for a loaded image and transfer control.
    #[cfg(unix)]
    pub fn launch(
        &self,
        space: &mut crate::vm::HostAddressSpace,
        image: LoadedImage,
    ) -> Result<Infallible> {
        self.start(space, image, |entry, stack| unsafe {
            launch::transfer(entry, stack)
        })
    }

    /// Build the stack and hand it to `transfer`. If `transfer` comes back,
    /// the stack and the image are released.
    fn start<F>(
        &self,
        space: &mut dyn AddressSpace,
        image: LoadedImage,
        transfer: F,
    ) -> Result<Infallible>
    where
        F: FnOnce(&Entry, &InitialStack) -> Result<Infallible>,
    {
        let stack_size = match (self.stack_size, image.entry.kind) {
            (Some(size), _) => size,
            (None, EntryKind::Main { stack_size }) if stack_size != 0 => stack_size,
            _ => DEFAULT_STACK_SIZE,
        };
        let args = self.argv();
        let env = self.envp();
        let startup = StartupVector::for_host(&self.executable_path);

        let stack = match launch::build_stack(space, stack_size, &args, &env, &startup) {
            Ok(stack) => stack,
            Err(err) => {
                release(space, image.mapped.reservation);
                return Err(err);
            }
        };
        let err = match transfer(&image.entry, &stack) {
            Ok(never) => match never {},
            Err(err) => err,
        };
        release(space, stack.region);
        release(space, image.mapped.reservation);
        Err(err)
    }

    fn argv(&self) -> Vec<Vec<u8>> {
        if self.args.is_empty() {
            vec![self.executable_path.as_bytes().to_vec()]
        } else {
            self.args.iter().map(|arg| arg.as_bytes().to_vec()).collect()
        }
    }

    /// `KEY=value` entries as raw bytes; inherited entries need not be UTF-8.
    fn envp(&self) -> Vec<Vec<u8>> {
        let inherited: Vec<(OsString, OsString)> = if self.inherit_env {
            std::env::vars_os().collect()
        } else {
            Vec::new()
        };
        inherited
            .iter()
            .chain(&self.env)
            .map(|(key, value)| {
                let mut entry = key.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                entry
            })
            .collect()
    }
}

/// Reject images this loader cannot run.
fn validate_image(image: &MachImage) -> Result<()> {
    let kind = match image.header.filetype {
        MH_EXECUTE => None,
        MH_OBJECT => Some("a relocatable object"),
        MH_DYLIB => Some("a dynamic library"),
        _ => Some("not an executable"),
    };
    if let Some(kind) = kind {
        return Err(Error::UnsupportedImageType(format!(
            "file type 0x{:x} is {kind}",
            image.header.filetype
        )));
    }
    if let Some(dylib) = image.dylibs().next() {
        return Err(Error::UnsupportedImageType(format!(
            "image links against {dylib}; only statically linked images are supported"
        )));
    }
    Ok(())
}

/// Preferred entry address and flavour. The entry must be in an executable
/// segment.
fn preferred_entry(image: &MachImage) -> Result<(u64, EntryKind)> {
    let (address, kind) = match image.entry()? {
        EntryCommand::Main(main) => {
            let segment = loadable_segments(image)
                .find(|segment| {
                    main.entryoff >= segment.fileoff
                        && main.entryoff - segment.fileoff < segment.filesize
                })
                .ok_or_else(|| {
                    Error::MalformedContainer(format!(
                        "entry offset 0x{:x} is not inside any segment's file data",
                        main.entryoff
                    ))
                })?;
            (
                segment.vmaddr.wrapping_add(main.entryoff - segment.fileoff),
                EntryKind::Main {
                    stack_size: main.stacksize,
                },
            )
        }
        EntryCommand::Thread(pc) => (pc, EntryKind::Thread),
    };

    let executable = loadable_segments(image).any(|segment| {
        segment.initprot.contains(VmProt::EXECUTE)
            && address >= segment.vmaddr
            && address - segment.vmaddr < segment.vmsize
    });
    if !executable {
        return Err(Error::MalformedContainer(format!(
            "entry point 0x{address:x} is not in an executable segment"
        )));
    }
    Ok((address, kind))
}

/// Everything after mapping that can still fail.
fn finish(
    space: &mut dyn AddressSpace,
    mapped: &MappedImage,
    fixups: &[crate::fixup::FixupEntry],
    preferred_entry: u64,
) -> Result<u64> {
    apply_fixups(space, mapped, fixups)?;
    finalize_protections(space, mapped)?;
    ptrauth::authenticate_entry(mapped.slid(preferred_entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::constants::{
        CPU_TYPE_X86_64, LC_SEGMENT_64, LC_UNIXTHREAD, MH_MAGIC_64, MH_PIE,
    };
    use crate::vm::SimulatedAddressSpace;
    use std::ffi::OsStr;

    #[test]
    fn test_argv_defaults_to_executable_path() {
        let loader = LoaderBuilder::new(CpuArch::X86_64)
            .executable_path("/bin/hello")
            .build();
        assert_eq!(loader.argv(), vec![b"/bin/hello".to_vec()]);

        let loader = LoaderBuilder::new(CpuArch::X86_64)
            .args(["hello", "world"])
            .build();
        assert_eq!(loader.argv(), vec![b"hello".to_vec(), b"world".to_vec()]);
    }

    #[test]
    fn test_envp() {
        let loader = LoaderBuilder::new(CpuArch::ARM64)
            .inherit_env(false)
            .env([("LANG", "C"), ("EMPTY", "")])
            .build();
        assert_eq!(loader.envp(), vec![b"LANG=C".to_vec(), b"EMPTY=".to_vec()]);

        let inherited = LoaderBuilder::new(CpuArch::ARM64).build().envp();
        assert_eq!(inherited.len(), std::env::vars_os().count());

        // Inherited entries are copied as bytes, UTF-8 or not.
        let key = "MACHLOAD_TEST_NON_UTF8";
        unsafe { std::env::set_var(key, OsStr::from_bytes(b"\xff\xfe")) };
        let envp = LoaderBuilder::new(CpuArch::ARM64).build().envp();
        unsafe { std::env::remove_var(key) };
        assert!(envp.contains(&b"MACHLOAD_TEST_NON_UTF8=\xff\xfe".to_vec()));

        let loader = LoaderBuilder::new(CpuArch::ARM64)
            .inherit_env(false)
            .executable_path(OsStr::from_bytes(b"/tmp/\xe9"))
            .build();
        assert_eq!(loader.argv(), vec![b"/tmp/\xe9".to_vec()]);
    }

    /// A PIE x86_64 executable: `__PAGEZERO`, one RX `__TEXT` page holding
    /// `code` and a thread entry at its start.
    fn tiny_image(code: &[u8]) -> Vec<u8> {
        const TEXT: u64 = 0x1_0000_0000;
        fn put32(out: &mut Vec<u8>, value: u32) {
            out.extend_from_slice(&value.to_le_bytes());
        }
        fn put64(out: &mut Vec<u8>, value: u64) {
            out.extend_from_slice(&value.to_le_bytes());
        }
        fn segment(out: &mut Vec<u8>, name: &[u8], vmaddr: u64, vmsize: u64, prot: u32) {
            let filesize = if prot == 0 { 0 } else { vmsize };
            put32(out, LC_SEGMENT_64);
            put32(out, 72);
            let mut segname = [0u8; 16];
            segname[..name.len()].copy_from_slice(name);
            out.extend_from_slice(&segname);
            for value in [vmaddr, vmsize, 0, filesize] {
                put64(out, value);
            }
            for value in [prot, prot, 0, 0] {
                put32(out, value);
            }
        }

        let mut commands = Vec::new();
        segment(&mut commands, b"__PAGEZERO", 0, TEXT, 0);
        segment(&mut commands, b"__TEXT", TEXT, 0x4000, 5);
        // x86_THREAD_STATE64: 21 registers, rip at index 16.
        put32(&mut commands, LC_UNIXTHREAD);
        put32(&mut commands, 16 + 21 * 8);
        put32(&mut commands, 4);
        put32(&mut commands, 42);
        for index in 0..21 {
            put64(&mut commands, if index == 16 { TEXT + 0x1000 } else { 0 });
        }

        let mut image = Vec::new();
        let sizeofcmds = commands.len() as u32;
        for field in [MH_MAGIC_64, CPU_TYPE_X86_64, 3, MH_EXECUTE, 3, sizeofcmds, MH_PIE, 0] {
            put32(&mut image, field);
        }
        image.extend_from_slice(&commands);
        image.resize(0x1000, 0);
        image.extend_from_slice(code);
        image.resize(0x4000, 0);
        image
    }

    #[test]
    fn test_failed_transfer_releases_stack_and_image() {
        let mut space = SimulatedAddressSpace::new();
        let loader = LoaderBuilder::new(CpuArch::X86_64)
            .inherit_env(false)
            .stack_size(0x10000)
            .build();
        let image = loader.load(&mut space, &tiny_image(&[0xc3])).unwrap();
        let entry = image.entry.address;

        let mut seen = None;
        let err = loader
            .start(&mut space, image, |entry, stack| {
                seen = Some((entry.address, stack.argc));
                Err(Error::UnsupportedImageType("no transfer".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedImageType(_)));
        assert_eq!(seen, Some((entry, 1)));
        assert_eq!(space.reservation_count(), 0);
    }
}
