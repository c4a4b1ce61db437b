//! The scratch descriptor shared with the offload program.
//!
//! The descriptor is the only channel between a `ReadContext` and the
//! program running inside the kernel: user space writes the lookup key and
//! the chain of blocks to read, the program writes back whether it found
//! the key and the value it found. Both sides compile the same layout, so
//! the struct below is the binary contract. It has no implicit padding,
//! every multi-byte field is little-endian, and its size is pinned to
//! `SCRATCH_BUFFER_SIZE` at compile time.
//!
//! ```text
//! offset  size  field
//!      0     4  version
//!      4     4  flags
//!      8     4  file_count
//!     12     4  stage            (current hop)
//!     16     8  block_offset     (current intra-page offset)
//!     24     8  handle_offset    (current block handle)
//!     32     8  handle_size
//!     40     4  key_len
//!     44    64  key
//!    108     4  found
//!    112     4  value_type
//!    116     8  sequence
//!    124     4  value_len
//!    128   256  files[MAX_FILE_COUNT]
//!    384  3712  value            (inline value bytes)
//! ```

use zerocopy::little_endian::{I32, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{MAX_FILE_COUNT, MAX_KEY_LEN, OFFLOAD_BLOCK_SIZE, SCRATCH_BUFFER_SIZE};
use super::{BLOCK_TRAILER_SIZE, DEFAULT_REQUEST_SIZE};
use crate::error::Result;
use crate::Error;

pub const DESCRIPTOR_VERSION: u32 = 1;

/// Set by the producer when `value_len` holds the exact value length.
pub const FLAG_VALUE_LEN: u32 = 1 << 0;

const DESCRIPTOR_HEADER_SIZE: usize = 128 + MAX_FILE_COUNT * FILE_CONTEXT_SIZE;
const FILE_CONTEXT_SIZE: usize = 32;

/// Capacity of the inline value area at the tail of the descriptor.
pub const INLINE_VALUE_CAPACITY: usize = SCRATCH_BUFFER_SIZE - DESCRIPTOR_HEADER_SIZE;

/// Which hop of a point lookup a block read serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Resolve a data block handle from an index block.
    Index,
    /// Fetch the value from a data block.
    Data,
    Other,
}

impl Stage {
    pub fn to_raw(self) -> u32 {
        match self {
            Stage::Index => 0,
            Stage::Data => 1,
            Stage::Other => 2,
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Stage::Index,
            1 => Stage::Data,
            _ => Stage::Other,
        }
    }
}

/// One block read in the lookup chain.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileContext {
    fd: I32,
    stage: U32,
    /// File offset rounded down to `OFFLOAD_BLOCK_SIZE`.
    offset: U64,
    /// Distance from `offset` to the first byte of the block.
    block_offset: U64,
    bytes_to_read: U64,
}

const _: () = assert!(std::mem::size_of::<FileContext>() == FILE_CONTEXT_SIZE);

impl FileContext {
    pub fn new(fd: i32, stage: Stage, offset: u64, block_offset: u64, bytes_to_read: u64) -> Self {
        Self {
            fd: I32::new(fd),
            stage: U32::new(stage.to_raw()),
            offset: U64::new(offset),
            block_offset: U64::new(block_offset),
            bytes_to_read: U64::new(bytes_to_read),
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd.get()
    }

    pub fn stage(&self) -> Stage {
        Stage::from_raw(self.stage.get())
    }

    pub fn offset(&self) -> u64 {
        self.offset.get()
    }

    pub fn block_offset(&self) -> u64 {
        self.block_offset.get()
    }

    pub fn bytes_to_read(&self) -> u64 {
        self.bytes_to_read.get()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ScratchDescriptor {
    version: U32,
    flags: U32,
    file_count: U32,
    stage: U32,
    block_offset: U64,
    handle_offset: U64,
    handle_size: U64,
    key_len: U32,
    key: [u8; MAX_KEY_LEN + 1],
    found: U32,
    value_type: U32,
    sequence: U64,
    value_len: U32,
    files: [FileContext; MAX_FILE_COUNT],
    value: [u8; INLINE_VALUE_CAPACITY],
}

const _: () = assert!(std::mem::size_of::<ScratchDescriptor>() == SCRATCH_BUFFER_SIZE);

impl ScratchDescriptor {
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(bytes)
            .map(|(descriptor, _)| descriptor)
            .map_err(|_| {
                Error::Corruption(format!(
                    "descriptor buffer too small: {} < {}",
                    bytes.len(),
                    SCRATCH_BUFFER_SIZE
                ))
            })
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        let len = bytes.len();
        Self::mut_from_prefix(bytes)
            .map(|(descriptor, _)| descriptor)
            .map_err(|_| {
                Error::Corruption(format!(
                    "descriptor buffer too small: {} < {}",
                    len, SCRATCH_BUFFER_SIZE
                ))
            })
    }

    /// Zeroes every field and stamps the layout version.
    pub fn clear(&mut self) {
        self.as_mut_bytes().fill(0);
        self.version = U32::new(DESCRIPTOR_VERSION);
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn file_count(&self) -> usize {
        self.file_count.get() as usize
    }

    /// The registered block reads, in registration order.
    pub fn files(&self) -> &[FileContext] {
        &self.files[..self.file_count().min(MAX_FILE_COUNT)]
    }

    /// Appends a block read. Fails once `MAX_FILE_COUNT` entries are present.
    pub fn push_file(&mut self, file: FileContext) -> Result<()> {
        let count = self.file_count();
        if count >= MAX_FILE_COUNT {
            return Err(Error::InvalidArgument(format!(
                "descriptor chain is full ({} entries)",
                MAX_FILE_COUNT
            )));
        }
        self.files[count] = file;
        self.file_count = U32::new(count as u32 + 1);
        Ok(())
    }

    pub fn key(&self) -> &[u8] {
        &self.key[..(self.key_len.get() as usize).min(MAX_KEY_LEN)]
    }

    /// Stores the lookup key, NUL-terminated for the program's benefit.
    pub fn set_key(&mut self, key: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidArgument(format!(
                "key length {} exceeds {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        self.key.fill(0);
        self.key[..key.len()].copy_from_slice(key);
        self.key_len = U32::new(key.len() as u32);
        Ok(())
    }

    pub fn stage(&self) -> Stage {
        Stage::from_raw(self.stage.get())
    }

    pub fn block_offset(&self) -> u64 {
        self.block_offset.get()
    }

    pub fn handle(&self) -> (u64, u64) {
        (self.handle_offset.get(), self.handle_size.get())
    }

    /// Positions the walk at `file`, the first hop of the chain.
    pub fn seed_from(&mut self, file: &FileContext) {
        self.stage = file.stage;
        self.block_offset = file.block_offset;
        self.handle_offset = file.offset;
        self.handle_size = file.bytes_to_read;
    }

    /// Sets the current hop. The program calls this between hops.
    pub fn set_position(&mut self, stage: Stage, block_offset: u64, offset: u64, size: u64) {
        self.stage = U32::new(stage.to_raw());
        self.block_offset = U64::new(block_offset);
        self.handle_offset = U64::new(offset);
        self.handle_size = U64::new(size);
    }

    pub fn found(&self) -> bool {
        self.found.get() == 1
    }

    pub fn value_type(&self) -> u32 {
        self.value_type.get()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.get()
    }

    /// The length reported by the producer, if it marked it as valid.
    pub fn value_len(&self) -> Option<usize> {
        (self.flags.get() & FLAG_VALUE_LEN != 0).then(|| self.value_len.get() as usize)
    }

    pub fn inline_value(&self) -> &[u8] {
        &self.value
    }

    /// Records a hit. Values longer than the inline area are truncated and
    /// the full length is kept in `value_len`, which the reader rejects.
    pub fn set_found(&mut self, value_type: u32, sequence: u64, value: &[u8]) {
        let copied = value.len().min(INLINE_VALUE_CAPACITY);
        self.found = U32::new(1);
        self.value_type = U32::new(value_type);
        self.sequence = U64::new(sequence);
        self.value_len = U32::new(value.len() as u32);
        self.flags = U32::new(self.flags.get() | FLAG_VALUE_LEN);
        self.value.fill(0);
        self.value[..copied].copy_from_slice(&value[..copied]);
    }

    /// Records a hit the way older programs do: no length, a NUL-terminated
    /// value.
    pub fn set_found_terminated(&mut self, value_type: u32, sequence: u64, value: &[u8]) {
        self.set_found(value_type, sequence, value);
        self.value_len = U32::new(0);
        self.flags = U32::new(self.flags.get() & !FLAG_VALUE_LEN);
    }
}

/// Splits an absolute file offset into the aligned offset the offload call
/// reads from and the remainder inside that first aligned unit.
pub fn align_offset(offset: u64) -> (u64, u64) {
    let block = OFFLOAD_BLOCK_SIZE as u64;
    let aligned = (offset / block) * block;
    (aligned, offset - aligned)
}

/// Number of bytes the offload call must read to cover a block and its
/// trailer, starting at the aligned offset. `None` if the size does not
/// fit in a `u64`.
pub fn request_size(stage: Stage, block_offset: u64, bytes_to_read: u64) -> Option<u64> {
    let unit = OFFLOAD_BLOCK_SIZE as u64;
    match stage {
        Stage::Index | Stage::Data => block_offset
            .checked_add(bytes_to_read)?
            .checked_add(BLOCK_TRAILER_SIZE as u64)?
            .div_ceil(unit)
            .checked_mul(unit),
        Stage::Other => Some(DEFAULT_REQUEST_SIZE as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    fn descriptor() -> Box<ScratchDescriptor> {
        let mut descriptor = Box::new(ScratchDescriptor::new_zeroed());
        descriptor.clear();
        descriptor
    }

    #[test]
    fn test_layout_offsets() {
        let mut descriptor = descriptor();
        descriptor.set_key(b"k").unwrap();
        descriptor
            .push_file(FileContext::new(7, Stage::Data, 4608, 392, 200))
            .unwrap();
        descriptor.set_found(1, 42, b"v");

        let bytes = descriptor.as_bytes();
        assert_eq!(&bytes[0..4], &DESCRIPTOR_VERSION.to_le_bytes());
        assert_eq!(&bytes[8..12], &1u32.to_le_bytes());
        assert_eq!(&bytes[40..44], &1u32.to_le_bytes());
        assert_eq!(bytes[44], b'k');
        assert_eq!(&bytes[108..112], &1u32.to_le_bytes());
        assert_eq!(&bytes[116..124], &42u64.to_le_bytes());
        assert_eq!(&bytes[128..132], &7i32.to_le_bytes());
        assert_eq!(&bytes[136..144], &4608u64.to_le_bytes());
        assert_eq!(bytes[DESCRIPTOR_HEADER_SIZE], b'v');
    }

    #[test]
    fn test_clear_zeroes_everything_but_version() {
        let mut descriptor = descriptor();
        descriptor.set_key(b"some key").unwrap();
        descriptor.set_found(1, 9, b"value");
        descriptor.clear();

        assert_eq!(descriptor.version(), DESCRIPTOR_VERSION);
        assert!(descriptor.as_bytes()[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_push_file_respects_capacity() {
        let mut descriptor = descriptor();
        for i in 0..MAX_FILE_COUNT {
            descriptor
                .push_file(FileContext::new(i as i32, Stage::Index, 0, 0, 10))
                .unwrap();
        }
        let result = descriptor.push_file(FileContext::new(99, Stage::Data, 0, 0, 10));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(descriptor.file_count(), MAX_FILE_COUNT);
        assert_eq!(descriptor.files()[MAX_FILE_COUNT - 1].fd(), MAX_FILE_COUNT as i32 - 1);
    }

    #[test]
    fn test_set_key_bounds() {
        let mut descriptor = descriptor();
        descriptor.set_key(&[b'a'; MAX_KEY_LEN]).unwrap();
        assert_eq!(descriptor.key(), &[b'a'; MAX_KEY_LEN][..]);

        let result = descriptor.set_key(&[b'b'; MAX_KEY_LEN + 1]);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(descriptor.key(), &[b'a'; MAX_KEY_LEN][..]);
    }

    #[test]
    fn test_value_len_only_when_flagged() {
        let mut descriptor = descriptor();
        descriptor.set_found(1, 1, b"abc");
        assert_eq!(descriptor.value_len(), Some(3));

        descriptor.set_found_terminated(1, 1, b"abc");
        assert_eq!(descriptor.value_len(), None);
        assert_eq!(&descriptor.inline_value()[..4], b"abc\0");
    }

    #[test]
    fn test_from_bytes_rejects_short_buffer() {
        let bytes = vec![0u8; SCRATCH_BUFFER_SIZE - 1];
        assert!(matches!(
            ScratchDescriptor::from_bytes(&bytes),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_stage_raw_values() {
        assert_eq!(Stage::from_raw(Stage::Index.to_raw()), Stage::Index);
        assert_eq!(Stage::from_raw(Stage::Data.to_raw()), Stage::Data);
        assert_eq!(Stage::from_raw(17), Stage::Other);
    }

    #[test]
    fn test_align_offset() {
        assert_eq!(align_offset(0), (0, 0));
        assert_eq!(align_offset(511), (0, 511));
        assert_eq!(align_offset(512), (512, 0));
        assert_eq!(align_offset(5000), (4608, 392));
    }

    #[test]
    fn test_request_size_law() {
        for stage in [Stage::Index, Stage::Data] {
            for block_offset in [0u64, 1, 100, 392, 511] {
                for bytes in [0u64, 1, 200, 507, 4096, 65_000] {
                    let size = request_size(stage, block_offset, bytes).unwrap();
                    assert_eq!(size % OFFLOAD_BLOCK_SIZE as u64, 0);
                    assert!(size >= block_offset + bytes + BLOCK_TRAILER_SIZE as u64);
                    assert!(size < block_offset + bytes + BLOCK_TRAILER_SIZE as u64 + 512);
                }
            }
        }
        assert_eq!(request_size(Stage::Other, 392, 65_000), Some(4096));
        assert_eq!(request_size(Stage::Data, 392, 200), Some(1024));
    }

    #[test]
    fn test_request_size_overflow() {
        assert_eq!(request_size(Stage::Data, 5, u64::MAX), None);
        assert_eq!(request_size(Stage::Index, 0, u64::MAX - 4), None);
        // Fits before rounding up, overflows once rounded to the unit.
        assert_eq!(request_size(Stage::Data, 0, u64::MAX - 10), None);
        assert_eq!(request_size(Stage::Other, 5, u64::MAX), Some(4096));
    }
}
