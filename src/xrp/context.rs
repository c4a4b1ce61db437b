//! The per-thread offload read context.
//!
//! A `ReadContext` owns everything one offloaded lookup needs: the
//! descriptor buffer, the transfer buffer and the program handle. A lookup
//! goes through these states:
//!
//! ```text
//!   Idle ──add_file──▶ Building ──get──▶ Issued ──▶ Resolved | NotFound
//!    ▲                                                     │
//!    └──────────────────────────reset──────────────────────┘
//! ```
//!
//! `add_file` and `get` after a completed lookup fail with
//! `Error::InvalidState` until the context is reset. A context is `Send`
//! but not `Sync`; keep one per thread.

use std::io;
use std::path::Path;

use zerocopy::IntoBytes;

use super::buffer::{DescriptorBuffer, Mode, TransferStrategy};
use super::descriptor::{
    align_offset, request_size, FileContext, ScratchDescriptor, Stage, INLINE_VALUE_CAPACITY,
};
use super::key::{InternalKey, ValueSink, ValueType};
use super::program::{PinnedProgramLoader, ProgramHandle, ProgramLoader};
use super::syscall::{OffloadRequest, ReadOffload, XrpSyscall};
use super::{OffloadTable, MAX_KEY_LEN};
use crate::config::OffloadConfig;
use crate::error::Result;
use crate::Error;

/// Which block of a table a registered read starts at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRequest {
    stage: Stage,
    offset: u64,
    bytes_to_read: u64,
}

impl FileRequest {
    /// A data block at an absolute file offset.
    pub fn data(offset: u64, bytes_to_read: u64) -> Self {
        Self {
            stage: Stage::Data,
            offset,
            bytes_to_read,
        }
    }

    /// The table's index block, located through its footer.
    pub fn index() -> Self {
        Self {
            stage: Stage::Index,
            offset: 0,
            bytes_to_read: 0,
        }
    }
}

/// Outcome of an offloaded lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    NotFound,
    Found {
        value_type: ValueType,
        sequence: u64,
        /// What the sink answered.
        matched: bool,
    },
}

impl Lookup {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found { .. })
    }

    pub fn matched(&self) -> bool {
        matches!(self, Lookup::Found { matched: true, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Building,
    Issued,
    Resolved,
    NotFound,
}

pub struct ReadContext<O = XrpSyscall> {
    // Fields drop in declaration order, the reverse of acquisition.
    program: ProgramHandle,
    transfer: Box<dyn TransferStrategy>,
    descriptor: DescriptorBuffer,
    offload: O,
    state: State,
    value_len: Option<usize>,
}

impl ReadContext<XrpSyscall> {
    /// Opens a context that issues the real offload syscall.
    pub fn open(mode: Mode, program_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_parts(
            mode,
            program_path.as_ref(),
            &PinnedProgramLoader::new(),
            XrpSyscall,
        )
    }

    pub fn from_config(config: &OffloadConfig) -> Result<Self> {
        let mut loader = PinnedProgramLoader::new();
        if let Some(prog_type) = config.program_type {
            loader = loader.expect_prog_type(prog_type);
        }
        Self::with_parts(config.mode, &config.program_path, &loader, XrpSyscall)
    }
}

impl<O: ReadOffload> ReadContext<O> {
    /// Acquires the descriptor buffer, the transfer buffer and, in
    /// privileged mode, the program, in that order. A failure releases
    /// whatever was already acquired.
    pub fn with_parts(
        mode: Mode,
        program_path: &Path,
        loader: &dyn ProgramLoader,
        offload: O,
    ) -> Result<Self> {
        let descriptor = DescriptorBuffer::allocate()?;
        let transfer = mode.allocate_transfer()?;
        let program = match mode {
            Mode::Privileged => loader.load(program_path)?,
            Mode::Simulated => ProgramHandle::detached(),
        };

        tracing::info!(
            ?mode,
            program = program.raw(),
            transfer_len = transfer.as_slice().len(),
            "Opened offload read context"
        );

        Ok(Self {
            program,
            transfer,
            descriptor,
            offload,
            state: State::Idle,
            value_len: None,
        })
    }

    pub fn mode(&self) -> Mode {
        self.transfer.mode()
    }

    pub fn program(&self) -> &ProgramHandle {
        &self.program
    }

    pub fn descriptor(&self) -> &ScratchDescriptor {
        &self.descriptor
    }

    pub fn transfer(&self) -> &[u8] {
        self.transfer.as_slice()
    }

    pub fn offload(&self) -> &O {
        &self.offload
    }

    pub fn file_count(&self) -> usize {
        self.descriptor.file_count()
    }

    /// Registers a block read against `table`. `None` is skipped.
    pub fn add_file<T>(&mut self, table: &T, request: Option<FileRequest>) -> Result<()>
    where
        T: OffloadTable + ?Sized,
    {
        let Some(request) = request else {
            return Ok(());
        };
        if !matches!(self.state, State::Idle | State::Building) {
            return Err(Error::InvalidState(
                "cannot add a file after a lookup; reset the context first".into(),
            ));
        }

        let (stage, offset, bytes_to_read) = match request.stage {
            Stage::Data => (Stage::Data, request.offset, request.bytes_to_read),
            Stage::Index | Stage::Other => {
                let handle = table.index_handle();
                (Stage::Index, handle.offset, handle.size)
            }
        };
        let (aligned, block_offset) = align_offset(offset);
        let file = FileContext::new(table.raw_fd(), stage, aligned, block_offset, bytes_to_read);
        self.descriptor.push_file(file)?;
        self.state = State::Building;

        tracing::debug!(
            fd = table.raw_fd(),
            ?stage,
            offset = aligned,
            block_offset,
            bytes_to_read,
            count = self.descriptor.file_count(),
            "Registered offload read"
        );
        Ok(())
    }

    /// Looks up `key` with one offload call starting at the first
    /// registered read. A hit is handed to `sink` before returning.
    pub fn get<S>(&mut self, key: &[u8], sink: &mut S) -> Result<Lookup>
    where
        S: ValueSink + ?Sized,
    {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidArgument(format!(
                "key length {} exceeds {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        if self.descriptor.file_count() == 0 {
            return Err(Error::InvalidArgument(
                "no block registered for the lookup".into(),
            ));
        }
        if self.state != State::Building {
            return Err(Error::InvalidState(
                "lookup already issued; reset the context first".into(),
            ));
        }

        let first = self.descriptor.files()[0];
        let transfer_len = self.transfer.as_slice().len();
        let size = request_size(first.stage(), first.block_offset(), first.bytes_to_read())
            .and_then(|size| usize::try_from(size).ok())
            .filter(|&size| size <= transfer_len)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "block of {} bytes at offset {} does not fit the {} byte transfer buffer",
                    first.bytes_to_read(),
                    first.block_offset(),
                    transfer_len
                ))
            })?;

        self.descriptor.set_key(key)?;
        self.descriptor.seed_from(&first);
        self.state = State::Issued;

        tracing::debug!(
            fd = first.fd(),
            offset = first.offset(),
            request_size = size,
            program = self.program.raw(),
            "Issuing offload read"
        );
        let ret = self.offload.read_xrp(OffloadRequest {
            fd: first.fd(),
            transfer: self.transfer.as_mut_slice(),
            request_size: size,
            file_offset: first.offset(),
            program: self.program.raw(),
            descriptor: self.descriptor.as_mut_bytes(),
        });
        if ret < 0 {
            let errno = ret
                .checked_neg()
                .and_then(|errno| i32::try_from(errno).ok())
                .unwrap_or(libc::EIO);
            let err = io::Error::from_raw_os_error(errno);
            tracing::error!(error = %err, ret, fd = first.fd(), "Offload read failed");
            return Err(Error::Corruption(format!(
                "offload read failed ({}): {}",
                ret, err
            )));
        }

        if !self.descriptor.found() {
            self.state = State::NotFound;
            return Ok(Lookup::NotFound);
        }

        let value_type = ValueType::try_from(self.descriptor.value_type())?;
        let sequence = self.descriptor.sequence();
        let value_len = match value_type {
            ValueType::Value | ValueType::Merge => self.inline_value_len()?,
            ValueType::Deletion | ValueType::SingleDeletion => 0,
        };

        let internal_key = InternalKey::new(key, sequence, value_type);
        let matched = sink.save(&internal_key, &self.descriptor.inline_value()[..value_len]);

        self.value_len = Some(value_len);
        self.state = State::Resolved;
        Ok(Lookup::Found {
            value_type,
            sequence,
            matched,
        })
    }

    /// The value of the last resolved lookup.
    pub fn value(&self) -> Option<&[u8]> {
        if self.state != State::Resolved {
            return None;
        }
        self.value_len.map(|len| &self.descriptor.inline_value()[..len])
    }

    /// Returns the context to `Idle`, clearing the descriptor and, in
    /// simulated mode, the transfer buffer.
    pub fn reset(&mut self) {
        self.descriptor.clear();
        self.transfer.reset();
        self.state = State::Idle;
        self.value_len = None;
    }

    fn inline_value_len(&self) -> Result<usize> {
        match self.descriptor.value_len() {
            Some(len) if len <= INLINE_VALUE_CAPACITY => Ok(len),
            Some(len) => Err(Error::Corruption(format!(
                "value length {} exceeds inline capacity {}",
                len, INLINE_VALUE_CAPACITY
            ))),
            None => {
                let inline = self.descriptor.inline_value();
                let len = inline.iter().position(|&b| b == 0).unwrap_or(inline.len());
                tracing::warn!(
                    len,
                    "Offload result has no value length; reading up to the first NUL byte"
                );
                Ok(len)
            }
        }
    }
}
