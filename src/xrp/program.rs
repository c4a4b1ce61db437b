//! Attaching the offload program.
//!
//! The program is loaded and verified by the kernel ahead of time (for
//! example `bpftool prog load walk.o /sys/fs/bpf/walk type xrp`) and pinned
//! in bpffs. Opening the pin yields a program descriptor; the kernel refuses
//! to pin a program that failed verification, so a successful open is a
//! verified program.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;

use crate::error::Result;
use crate::Error;

/// Raw handle passed to the offload call when no program is attached.
pub const DETACHED_PROGRAM_FD: RawFd = -1234;

const BPF_OBJ_GET: libc::c_long = 7;

#[repr(C)]
#[derive(Default)]
struct ObjGetAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

/// An attached program, or the detached sentinel. Dropping an attached
/// handle closes its descriptor.
#[derive(Debug)]
pub struct ProgramHandle {
    fd: RawFd,
}

impl ProgramHandle {
    pub fn detached() -> Self {
        Self {
            fd: DETACHED_PROGRAM_FD,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.fd >= 0
    }

    /// The value passed as the program argument of the offload call.
    pub fn raw(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for ProgramHandle {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl Drop for ProgramHandle {
    fn drop(&mut self) {
        if !self.is_attached() {
            return;
        }
        if unsafe { libc::close(self.fd) } != 0 {
            tracing::error!(
                fd = self.fd,
                error = %io::Error::last_os_error(),
                "Failed to release offload program"
            );
        }
    }
}

pub trait ProgramLoader {
    /// Attaches the program at `path`. Errors are fatal to the context
    /// being opened.
    fn load(&self, path: &Path) -> Result<ProgramHandle>;
}

/// Opens programs pinned in bpffs.
#[derive(Debug, Clone, Default)]
pub struct PinnedProgramLoader {
    expected_prog_type: Option<u32>,
}

impl PinnedProgramLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects pinned programs whose type differs from `prog_type`.
    pub fn expect_prog_type(mut self, prog_type: u32) -> Self {
        self.expected_prog_type = Some(prog_type);
        self
    }
}

impl ProgramLoader for PinnedProgramLoader {
    fn load(&self, path: &Path) -> Result<ProgramHandle> {
        let load_error = |err: io::Error| Error::ProgramLoad(path.display().to_string(), err);

        let pathname = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| load_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let attr = ObjGetAttr {
            pathname: pathname.as_ptr() as u64,
            ..Default::default()
        };

        // SAFETY: `attr` outlives the call and `pathname` outlives `attr`.
        let fd = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_OBJ_GET,
                &attr as *const ObjGetAttr,
                std::mem::size_of::<ObjGetAttr>(),
            )
        };
        if fd < 0 {
            return Err(load_error(io::Error::last_os_error()));
        }
        // SAFETY: the kernel just handed us this descriptor.
        let handle = unsafe { ProgramHandle::from_raw_fd(fd as RawFd) };

        let prog_type = program_type(handle.raw()).map_err(load_error)?;
        if let Some(expected) = self.expected_prog_type {
            if prog_type != expected {
                return Err(load_error(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("program type {} does not match {}", prog_type, expected),
                )));
            }
        }

        tracing::info!(path = %path.display(), fd = handle.raw(), prog_type, "Attached offload program");
        Ok(handle)
    }
}

/// Reads the program type of `fd` from procfs. Fails if `fd` is not a BPF
/// program, e.g. a pinned map.
fn program_type(fd: RawFd) -> io::Result<u32> {
    let fdinfo = fs::read_to_string(format!("/proc/self/fdinfo/{}", fd))?;
    parse_prog_type(&fdinfo).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "pinned object is not a program")
    })
}

fn parse_prog_type(fdinfo: &str) -> Option<u32> {
    fdinfo
        .lines()
        .find_map(|line| line.strip_prefix("prog_type:"))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;

    #[test]
    fn test_detached_handle() {
        let handle = ProgramHandle::detached();
        assert!(!handle.is_attached());
        assert_eq!(handle.raw(), DETACHED_PROGRAM_FD);
    }

    #[test]
    fn test_attached_handle_from_fd() {
        let fd = fs::File::open("/dev/null").unwrap().into_raw_fd();
        let handle = unsafe { ProgramHandle::from_raw_fd(fd) };
        assert!(handle.is_attached());
        assert_eq!(handle.raw(), fd);
    }

    #[test]
    fn test_load_missing_pin_fails() {
        let result = PinnedProgramLoader::new().load(Path::new("/sys/fs/bpf/ashdb-no-such-program"));
        assert!(matches!(result, Err(Error::ProgramLoad(_, _))));
    }

    #[test]
    fn test_parse_prog_type() {
        let fdinfo = "pos:\t0\nflags:\t02000002\nprog_type:\t28\nprog_jited:\t1\n";
        assert_eq!(parse_prog_type(fdinfo), Some(28));
        assert_eq!(parse_prog_type("map_type:\t1\n"), None);
    }
}
