use std::io;
use std::os::unix::io::RawFd;

/// Syscall number of `read_xrp` in XRP-enabled kernels.
pub const SYS_READ_XRP: libc::c_long = 445;

/// Arguments of one offload call.
pub struct OffloadRequest<'a> {
    /// Table file the first hop reads from.
    pub fd: RawFd,
    /// Receives the raw bytes of every block read.
    pub transfer: &'a mut [u8],
    pub request_size: usize,
    /// Aligned offset of the first hop.
    pub file_offset: u64,
    pub program: RawFd,
    /// The scratch descriptor, read and written by the program.
    pub descriptor: &'a mut [u8],
}

/// The privileged multi-hop read.
pub trait ReadOffload {
    /// Blocks until the walk completes. Returns the number of bytes read,
    /// or a negated errno.
    fn read_xrp(&mut self, request: OffloadRequest<'_>) -> i64;
}

/// Issues the real `read_xrp` syscall.
#[derive(Debug, Clone, Copy, Default)]
pub struct XrpSyscall;

impl ReadOffload for XrpSyscall {
    fn read_xrp(&mut self, request: OffloadRequest<'_>) -> i64 {
        if request.request_size > request.transfer.len() {
            return -(libc::EINVAL as i64);
        }
        // SAFETY: both buffers are exclusively borrowed for the duration of
        // the call, and the kernel writes at most `request_size` bytes into
        // the transfer buffer.
        let ret = unsafe {
            libc::syscall(
                SYS_READ_XRP,
                request.fd,
                request.transfer.as_mut_ptr(),
                request.request_size,
                request.file_offset,
                request.program,
                request.descriptor.as_mut_ptr(),
            )
        };
        if ret < 0 {
            let errno = io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            return -(errno as i64);
        }
        ret as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_request_larger_than_transfer() {
        let mut transfer = vec![0u8; 512];
        let mut descriptor = vec![0u8; 4096];
        let ret = XrpSyscall.read_xrp(OffloadRequest {
            fd: -1,
            transfer: &mut transfer,
            request_size: 1024,
            file_offset: 0,
            program: -1,
            descriptor: &mut descriptor,
        });
        assert_eq!(ret, -(libc::EINVAL as i64));
    }
}
