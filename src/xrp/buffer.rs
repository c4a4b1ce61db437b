//! Buffers shared with the offload call.
//!
//! Every context owns two buffers:
//!
//! 1. The **descriptor buffer**, one page holding a `ScratchDescriptor`.
//!    It is allocated the same way in both modes.
//! 2. The **transfer buffer**, which receives the raw bytes of the blocks
//!    the program reads. How it is allocated depends on the mode, and that
//!    choice is captured once in a `TransferStrategy` object:
//!    - `HugePageBuffer` maps a 2 MiB hugetlb page (privileged mode). The
//!      kernel writes into it on every call, so it is never cleared.
//!    - `HeapBuffer` is an aligned heap allocation (simulated mode), zeroed
//!      on every reset.
//!
//! Allocation failures surface as `Error::ResourceExhaustion`.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use super::descriptor::ScratchDescriptor;
use super::{HUGE_PAGE_SIZE, SCRATCH_BUFFER_SIZE};
use crate::error::Result;
use crate::Error;

/// Alignment of every buffer handed to the offload call.
const ALIGNMENT: usize = 4096;

const MAP_HUGE_SHIFT: i32 = 26;
const MAP_HUGE_2MB: i32 = 21 << MAP_HUGE_SHIFT;

/// How a context reaches the offload program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Hugepage transfer buffer, program attached in the kernel.
    Privileged,
    /// Heap transfer buffer, no program attached.
    Simulated,
}

impl Mode {
    /// Allocates the transfer buffer this mode reads into.
    pub fn allocate_transfer(self) -> Result<Box<dyn TransferStrategy>> {
        match self {
            Mode::Privileged => Ok(Box::new(HugePageBuffer::map(HUGE_PAGE_SIZE)?)),
            Mode::Simulated => Ok(Box::new(HeapBuffer::allocate(SCRATCH_BUFFER_SIZE)?)),
        }
    }
}

/// A transfer buffer together with its reset policy.
pub trait TransferStrategy: Send {
    fn mode(&self) -> Mode;

    fn as_slice(&self) -> &[u8];

    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Clears whatever the previous lookup left in the buffer, if this
    /// strategy clears at all.
    fn reset(&mut self);
}

/// Zero-initialized, page-aligned heap memory.
pub struct AlignedBuffer {
    data: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        let layout = Layout::from_size_align(capacity.max(1), ALIGNMENT).map_err(|e| {
            Error::ResourceExhaustion("aligned buffer", io::Error::new(io::ErrorKind::InvalidInput, e))
        })?;
        // SAFETY: the layout has a non-zero size.
        let data = unsafe { alloc_zeroed(layout) };
        let data = NonNull::new(data).ok_or_else(|| {
            Error::ResourceExhaustion("aligned buffer", io::ErrorKind::OutOfMemory.into())
        })?;
        Ok(Self { data, layout })
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.data.as_ptr(), self.layout) }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.layout.size()) }
    }
}

/// Heap transfer buffer used in simulated mode.
pub struct HeapBuffer {
    buffer: AlignedBuffer,
}

impl HeapBuffer {
    pub fn allocate(capacity: usize) -> Result<Self> {
        Ok(Self {
            buffer: AlignedBuffer::new(capacity)?,
        })
    }
}

impl TransferStrategy for HeapBuffer {
    fn mode(&self) -> Mode {
        Mode::Simulated
    }

    fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    fn reset(&mut self) {
        self.buffer.fill(0);
    }
}

/// Anonymous hugetlb mapping used in privileged mode.
pub struct HugePageBuffer {
    data: NonNull<u8>,
    len: usize,
}

unsafe impl Send for HugePageBuffer {}

impl HugePageBuffer {
    /// Maps `len` bytes of 2 MiB hugepages. `len` must be a multiple of the
    /// hugepage size. Anonymous mappings come back zero-filled.
    pub fn map(len: usize) -> Result<Self> {
        debug_assert!(len % HUGE_PAGE_SIZE == 0, "len must be a multiple of 2M");
        // SAFETY: anonymous private mapping; no existing memory is touched.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | MAP_HUGE_2MB,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::ResourceExhaustion(
                "hugepage transfer buffer",
                io::Error::last_os_error(),
            ));
        }
        let data = NonNull::new(ptr as *mut u8).ok_or_else(|| {
            Error::ResourceExhaustion("hugepage transfer buffer", io::ErrorKind::OutOfMemory.into())
        })?;
        Ok(Self { data, len })
    }
}

impl TransferStrategy for HugePageBuffer {
    fn mode(&self) -> Mode {
        Mode::Privileged
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }

    // The kernel overwrites the bytes each call reads. Bytes past the last
    // request keep their old contents.
    fn reset(&mut self) {}
}

impl Drop for HugePageBuffer {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.data.as_ptr() as *mut libc::c_void, self.len) };
        if rc != 0 {
            tracing::error!(
                addr = ?self.data.as_ptr(),
                len = self.len,
                error = %io::Error::last_os_error(),
                "Failed to unmap transfer buffer"
            );
        }
    }
}

#[repr(C, align(4096))]
struct DescriptorPage(ScratchDescriptor);

/// One page holding the scratch descriptor.
pub struct DescriptorBuffer {
    page: Box<DescriptorPage>,
}

impl DescriptorBuffer {
    pub fn allocate() -> Result<Self> {
        let layout = Layout::new::<DescriptorPage>();
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) } as *mut DescriptorPage;
        if ptr.is_null() {
            return Err(Error::ResourceExhaustion(
                "descriptor buffer",
                io::ErrorKind::OutOfMemory.into(),
            ));
        }
        // SAFETY: the pointer comes from the global allocator with the
        // layout of `DescriptorPage`, and all-zero bytes are a valid
        // `ScratchDescriptor`.
        let mut page = unsafe { Box::from_raw(ptr) };
        page.0.clear();
        Ok(Self { page })
    }
}

impl Deref for DescriptorBuffer {
    type Target = ScratchDescriptor;

    fn deref(&self) -> &ScratchDescriptor {
        &self.page.0
    }
}

impl DerefMut for DescriptorBuffer {
    fn deref_mut(&mut self) -> &mut ScratchDescriptor {
        &mut self.page.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xrp::descriptor::DESCRIPTOR_VERSION;
    use zerocopy::IntoBytes;

    #[test]
    fn test_aligned_buffer_allocation() {
        let buffer = AlignedBuffer::new(8192).unwrap();
        assert_eq!(buffer.capacity(), 8192);
        assert_eq!(buffer.as_ptr() as usize % ALIGNMENT, 0);
        assert!(buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_aligned_buffer_deref() {
        let mut buffer = AlignedBuffer::new(8192).unwrap();
        buffer[0] = 42;
        buffer[100] = 99;
        assert_eq!(buffer[0], 42);
        assert_eq!(buffer[100], 99);
    }

    #[test]
    fn test_heap_buffer_reset_clears() {
        let mut transfer = Mode::Simulated.allocate_transfer().unwrap();
        assert_eq!(transfer.mode(), Mode::Simulated);
        assert_eq!(transfer.as_slice().len(), SCRATCH_BUFFER_SIZE);

        transfer.as_mut_slice()[17] = 0xaa;
        transfer.reset();
        assert!(transfer.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_descriptor_buffer_is_page_aligned() {
        let descriptor = DescriptorBuffer::allocate().unwrap();
        let bytes = descriptor.as_bytes();
        assert_eq!(bytes.len(), SCRATCH_BUFFER_SIZE);
        assert_eq!(bytes.as_ptr() as usize % ALIGNMENT, 0);
        assert_eq!(descriptor.version(), DESCRIPTOR_VERSION);
    }

    #[test]
    fn test_hugepage_map_reports_exhaustion() {
        // Hosts without a reserved hugetlb pool refuse the mapping; either
        // outcome must leave a usable buffer or a typed error.
        match HugePageBuffer::map(HUGE_PAGE_SIZE) {
            Ok(mut buffer) => {
                assert_eq!(buffer.as_slice().len(), HUGE_PAGE_SIZE);
                buffer.as_mut_slice()[0] = 1;
                buffer.reset();
                assert_eq!(buffer.as_slice()[0], 1);
            }
            Err(e) => assert!(matches!(e, Error::ResourceExhaustion(_, _))),
        }
    }
}
