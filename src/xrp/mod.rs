//! Kernel-offloaded point lookups.
//!
//! A point lookup against a table normally costs two reads: the index
//! block to find the data block, then the data block to find the value.
//! The offload path hands both hops to a program attached in the kernel.
//! User space describes the chain in a shared scratch descriptor, issues a
//! single `read_xrp` call, and the program walks index → data block inside
//! the kernel, writing the result back into the descriptor.
//!
//! ```text
//!   ReadContext                       kernel
//!  ┌──────────────┐  read_xrp(fd,   ┌─────────────────────────┐
//!  │ descriptor   │──transfer, size,▶│ read first hop          │
//!  │  key, files  │  offset, prog,  │ program: index → handle │
//!  │              │  descriptor)    │ read second hop         │
//!  │ found, value │◀────────────────│ program: data → value   │
//!  └──────────────┘                 └─────────────────────────┘
//! ```
//!
//! # Modes
//!
//! - **Privileged**: the transfer buffer is a 2 MiB hugepage mapping and the
//!   program is attached from a pinned bpffs path.
//! - **Simulated**: the transfer buffer is an aligned heap allocation and no
//!   program is attached; the call carries a sentinel program handle.
//!
//! The mode is chosen once, when the context is opened.
//!
//! # Binary contract
//!
//! The constants below are compiled into the offload program as well. A
//! mismatch between the two sides is not detected at run time; it corrupts
//! lookups silently.

pub mod buffer;
pub mod context;
pub mod descriptor;
pub mod key;
pub mod program;
pub mod sampler;
pub mod syscall;

#[cfg(test)]
mod emulator;

use std::os::unix::io::RawFd;

pub use buffer::{HugePageBuffer, Mode, TransferStrategy};
pub use context::{FileRequest, Lookup, ReadContext};
pub use descriptor::{FileContext, ScratchDescriptor, Stage};
pub use key::{InternalKey, LookupState, PointLookup, ValueSink, ValueType};
pub use program::{PinnedProgramLoader, ProgramHandle, ProgramLoader};
pub use sampler::{AdaptiveSampler, EnvSettings, MemorySettings, OffloadThrottle, SampleSettings};
pub use syscall::{OffloadRequest, ReadOffload, XrpSyscall};

use crate::sstable::BlockHandle;

/// Longest key the program accepts.
pub const MAX_KEY_LEN: usize = 63;

/// Capacity of the descriptor's block chain.
pub const MAX_FILE_COUNT: usize = 8;

/// Alignment unit for file offsets and request sizes on the offload path.
pub const OFFLOAD_BLOCK_SIZE: usize = 512;

/// Request size used when the first hop is neither an index nor a data read.
pub const DEFAULT_REQUEST_SIZE: usize = 4096;

/// Size of the descriptor buffer, and of the simulated transfer buffer.
pub const SCRATCH_BUFFER_SIZE: usize = 4096;

/// Size of the privileged transfer buffer.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

pub use crate::sstable::BLOCK_TRAILER_SIZE;

/// A table the offload path can read from.
pub trait OffloadTable {
    /// Handle of the table's index block, as recorded in its footer.
    fn index_handle(&self) -> BlockHandle;

    /// Descriptor of the open table file.
    fn raw_fd(&self) -> RawFd;
}
