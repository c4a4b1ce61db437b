//! Offload call stand-ins for tests.
//!
//! `UserspaceWalk` performs the same index → data walk the kernel program
//! performs, with ordinary reads, so lookups can be checked end to end on
//! machines without an XRP kernel. `Scripted` answers with a canned
//! descriptor update and records what it was asked.

use std::fs::File;
use std::mem::ManuallyDrop;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{FromRawFd, RawFd};

use super::descriptor::{align_offset, request_size, ScratchDescriptor, Stage};
use super::key::ValueType;
use super::syscall::{OffloadRequest, ReadOffload};
use super::BLOCK_TRAILER_SIZE;
use crate::error::Result;
use crate::sstable::block::{self, Block};
use crate::sstable::index::Index;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedCall {
    pub fd: RawFd,
    pub request_size: usize,
    pub file_offset: u64,
    pub program: RawFd,
}

impl RecordedCall {
    fn of(request: &OffloadRequest<'_>) -> Self {
        Self {
            fd: request.fd,
            request_size: request.request_size,
            file_offset: request.file_offset,
            program: request.program,
        }
    }
}

/// Walks index and data blocks in user space.
#[derive(Debug, Default)]
pub struct UserspaceWalk {
    pub calls: Vec<RecordedCall>,
    pub sequence: u64,
}

impl UserspaceWalk {
    fn walk(&mut self, request: OffloadRequest<'_>) -> Result<usize> {
        // The descriptor belongs to the table, which outlives the call.
        let file = ManuallyDrop::new(unsafe { File::from_raw_fd(request.fd) });
        let transfer = request.transfer;
        let descriptor = ScratchDescriptor::from_bytes_mut(request.descriptor)?;
        let key = descriptor.key().to_vec();

        let mut total = read_at(&file, &mut transfer[..request.request_size], request.file_offset)?;
        let mut stage = descriptor.stage();
        let mut block_offset = descriptor.block_offset() as usize;
        let (_, mut size) = descriptor.handle();

        loop {
            let end = usize::try_from(size)
                .ok()
                .and_then(|size| block_offset.checked_add(size))
                .and_then(|end| end.checked_add(BLOCK_TRAILER_SIZE))
                .filter(|&end| end <= total)
                .ok_or_else(|| {
                    Error::Corruption(format!(
                        "block at {} runs past the {} bytes read",
                        block_offset, total
                    ))
                })?;
            let contents = block::unseal(&transfer[block_offset..end])?;

            match stage {
                Stage::Index => {
                    let index = Index::try_from(contents)?;
                    let Some(entry) = index.find(&key) else {
                        return Ok(total);
                    };
                    let handle = entry.handle;
                    let (aligned, remainder) = align_offset(handle.offset);
                    let next = request_size(Stage::Data, remainder, handle.size)
                        .and_then(|size| usize::try_from(size).ok())
                        .filter(|&size| size <= transfer.len())
                        .ok_or_else(|| {
                            Error::Corruption("data block exceeds transfer buffer".into())
                        })?;
                    descriptor.set_position(Stage::Data, remainder, aligned, handle.size);
                    total = read_at(&file, &mut transfer[..next], aligned)?;
                    stage = Stage::Data;
                    block_offset = remainder as usize;
                    size = handle.size;
                }
                Stage::Data => {
                    let block = Block::new(contents.to_vec())?;
                    if let Some(value) = block.get(&key)? {
                        descriptor.set_found(ValueType::Value.to_raw(), self.sequence, &value);
                    }
                    return Ok(total);
                }
                Stage::Other => {
                    return Err(Error::Corruption("unexpected stage".into()));
                }
            }
        }
    }
}

impl ReadOffload for UserspaceWalk {
    fn read_xrp(&mut self, request: OffloadRequest<'_>) -> i64 {
        self.calls.push(RecordedCall::of(&request));
        match self.walk(request) {
            Ok(read) => read as i64,
            Err(_) => -(libc::EIO as i64),
        }
    }
}

/// Reads until `buf` is full or the file ends.
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

type Responder = Box<dyn FnMut(&mut ScratchDescriptor) -> i64 + Send>;

/// Answers every call with `respond`, recording the request.
pub struct Scripted {
    pub calls: Vec<RecordedCall>,
    respond: Responder,
}

impl Scripted {
    pub fn new(respond: impl FnMut(&mut ScratchDescriptor) -> i64 + Send + 'static) -> Self {
        Self {
            calls: Vec::new(),
            respond: Box::new(respond),
        }
    }

    /// Reports a miss.
    pub fn not_found() -> Self {
        Self::new(|_| 512)
    }

    pub fn failing(errno: i32) -> Self {
        Self::new(move |_| -(errno as i64))
    }
}

impl ReadOffload for Scripted {
    fn read_xrp(&mut self, request: OffloadRequest<'_>) -> i64 {
        self.calls.push(RecordedCall::of(&request));
        match ScratchDescriptor::from_bytes_mut(request.descriptor) {
            Ok(descriptor) => (self.respond)(descriptor),
            Err(_) => -(libc::EINVAL as i64),
        }
    }
}
