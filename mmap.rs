//! Memory-mapped image files.
//!
//! The driver maps the image read-only and hands the bytes to the loader,
//! which copies what it needs into its own reservations. The mapping is
//! never aliased by a loaded image.

use crate::Result;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::debug;

/// A read-only private mapping of a regular file.
pub struct MappedFile {
    fd: libc::c_int,
    addr: *mut libc::c_void,
    size: usize,
}

impl MappedFile {
    /// Open and map `path`. Empty files map to an empty slice.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<MappedFile> {
        let path = path.as_ref();
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        match Self::map(fd) {
            Ok((addr, size)) => {
                debug!("Mapped {} ({} bytes)", path.display(), size);
                Ok(Self { fd, addr, size })
            }
            Err(err) => {
                unsafe {
                    libc::close(fd);
                }
                Err(err.into())
            }
        }
    }

    fn map(fd: libc::c_int) -> io::Result<(*mut libc::c_void, usize)> {
        let mut statbuf: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut statbuf) } < 0 {
            return Err(io::Error::last_os_error());
        }
        if (statbuf.st_mode & libc::S_IFMT) != libc::S_IFREG {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }
        let size = usize::try_from(statbuf.st_size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad file size"))?;
        if size == 0 {
            return Ok((std::ptr::null_mut(), 0));
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok((addr, size))
    }

    pub fn data(&self) -> &[u8] {
        if self.size == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.size) }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            if self.size != 0 {
                libc::munmap(self.addr, self.size);
            }
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("machload-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_map_file_contents() {
        let path = temp_path("contents");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"\xcf\xfa\xed\xfe rest").unwrap();
        drop(file);

        let mapped = MappedFile::open(&path).unwrap();
        assert_eq!(mapped.data(), b"\xcf\xfa\xed\xfe rest");
        assert_eq!(mapped.len(), 9);
        drop(mapped);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_map_empty_file() {
        let path = temp_path("empty");
        std::fs::File::create(&path).unwrap();
        let mapped = MappedFile::open(&path).unwrap();
        assert!(mapped.is_empty());
        assert_eq!(mapped.data(), b"");
        drop(mapped);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_reject_directory_and_missing() {
        let dir = std::env::temp_dir();
        assert!(matches!(
            MappedFile::open(&dir),
            Err(crate::Error::Io(_))
        ));
        assert!(MappedFile::open("/nonexistent/machload/image").is_err());
    }
}
