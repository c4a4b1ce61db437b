//! Writing and reading table files.
//!
//! `TableWriter` appends sealed data blocks and, on `finish`, the index
//! block and the footer. `Table` opens a finished file, keeps the index in
//! memory and serves conventional point lookups: one read for the data
//! block, after the index was loaded at open time.
//!
//! The footer is the last `FOOTER_SIZE` bytes of the file:
//!
//! ```text
//! +------------------+----------------+-----------+
//! |index_offset:u64  |index_size:u64  |magic:u64  |
//! +------------------+----------------+-----------+
//! ```
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::block::{self, Block, Builder};
use super::index::Index;
use super::BlockHandle;
use crate::error::Result;
use crate::xrp::OffloadTable;
use crate::Error;

/// The target maximum size for a data block. A block may run slightly over
/// to hold the entry that crossed the limit.
pub const MAX_BLOCK_SIZE: usize = 4096;

pub const FOOTER_SIZE: usize = 24;

const TABLE_MAGIC: u64 = u64::from_be_bytes(*b"ASHDBXRP");

/// Builds a table file from keys added in strictly increasing order.
pub struct TableWriter {
    file: File,
    path: PathBuf,
    index: Index,
    offset: u64,
    builder: Builder,
    first_key_in_block: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
    block_size: usize,
}

impl TableWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            file,
            path,
            index: Index::new(),
            offset: 0,
            builder: Builder::new(),
            first_key_in_block: None,
            last_key: None,
            block_size: MAX_BLOCK_SIZE,
        })
    }

    /// Sets the target data block size. Tables read through a simulated
    /// context need blocks that fit the smaller transfer buffer.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Adds an entry to the current data block, sealing the block once it
    /// reaches the target block size. Keys must be strictly increasing.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(Error::InvalidArgument(format!(
                    "key {:?} is not greater than the previous key {:?}",
                    String::from_utf8_lossy(key),
                    String::from_utf8_lossy(last)
                )));
            }
        }
        self.last_key = Some(key.to_vec());
        if self.first_key_in_block.is_none() {
            self.first_key_in_block = Some(key.to_vec());
        }
        self.builder.add_entry(key, value);
        if self.builder.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Writes the index block and the footer and reopens the file for reads.
    pub fn finish(mut self) -> Result<Table> {
        self.flush_block()?;

        let index_block = self.index.encode()?;
        let index_handle = self.write_sealed(index_block)?;
        self.file.write_u64::<BigEndian>(index_handle.offset)?;
        self.file.write_u64::<BigEndian>(index_handle.size)?;
        self.file.write_u64::<BigEndian>(TABLE_MAGIC)?;
        self.file.flush()?;
        self.file.sync_all()?;

        Table::open(&self.path)
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.builder.is_empty() {
            return Ok(());
        }
        let builder = std::mem::replace(&mut self.builder, Builder::new());
        let first_key = self.first_key_in_block.take().unwrap_or_default();
        let handle = self.write_sealed(builder.finish())?;
        self.index.push(first_key, handle);
        Ok(())
    }

    fn write_sealed(&mut self, contents: Vec<u8>) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, contents.len() as u64);
        let sealed = block::seal(contents);
        self.file.write_all(&sealed)?;
        self.offset += sealed.len() as u64;
        Ok(handle)
    }
}

/// A finished table opened for reading.
pub struct Table {
    file: File,
    index: Index,
    index_handle: BlockHandle,
}

impl Table {
    /// Opens a table file, validates its footer and loads the index block.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::InvalidData(format!(
                "Table file too short: {} bytes",
                file_size
            )));
        }

        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer, file_size - FOOTER_SIZE as u64)
            .map_err(|e| Error::ReadError("table footer", e))?;
        let mut cursor = &footer[..];
        let index_offset = cursor.read_u64::<BigEndian>()?;
        let index_size = cursor.read_u64::<BigEndian>()?;
        let magic = cursor.read_u64::<BigEndian>()?;
        if magic != TABLE_MAGIC {
            return Err(Error::InvalidData("Invalid table magic number".into()));
        }

        let index_handle = BlockHandle::new(index_offset, index_size);
        let footer_offset = file_size - FOOTER_SIZE as u64;
        if index_handle.end().map_or(true, |end| end > footer_offset) {
            return Err(Error::InvalidData(format!(
                "Index handle {:?} points past the end of the file",
                index_handle
            )));
        }

        let raw = read_block(&file, index_handle)?;
        let index = Index::try_from(block::unseal(&raw)?)?;

        Ok(Self {
            file,
            index,
            index_handle,
        })
    }

    /// Conventional point lookup through the in-memory index.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.index.find(key) else {
            return Ok(None);
        };
        if entry.handle.end().map_or(true, |end| end > self.index_handle.offset) {
            return Err(Error::InvalidData(format!(
                "Data block handle {:?} overlaps the index block",
                entry.handle
            )));
        }
        let raw = read_block(&self.file, entry.handle)?;
        let block = Block::new(block::unseal(&raw)?.to_vec())?;
        block.get(key)
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn index_handle(&self) -> BlockHandle {
        self.index_handle
    }
}

impl OffloadTable for Table {
    fn index_handle(&self) -> BlockHandle {
        self.index_handle
    }

    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Reads a block together with its trailer.
fn read_block(file: &File, handle: BlockHandle) -> Result<Vec<u8>> {
    let len = handle
        .len_with_trailer()
        .and_then(|len| usize::try_from(len).ok())
        .ok_or_else(|| Error::InvalidData(format!("Block handle {:?} is too large", handle)))?;
    let mut raw = vec![0u8; len];
    file.read_exact_at(&mut raw, handle.offset)
        .map_err(|e| Error::ReadError("block", e))?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    format!("key_{:05}", i).into_bytes(),
                    format!("value_{:05}", i).into_bytes(),
                )
            })
            .collect()
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.sst");

        let mut writer = TableWriter::create(&path).expect("Failed to create table");
        let entries = entries(2000);
        for (key, value) in &entries {
            writer.add(key, value).unwrap();
        }
        let table = writer.finish().expect("Failed to finish table");

        assert!(table.index().len() > 1, "expected several data blocks");
        for (key, value) in &entries {
            let result = table.get(key).unwrap().expect("Key not found");
            assert_eq!(&result, value, "Value mismatch for key {:?}", key);
        }
        assert!(table.get(b"key_99999").unwrap().is_none());
        assert!(table.get(b"aaa").unwrap().is_none());
    }

    #[test]
    fn test_reopen_reads_same_index_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000002.sst");

        let mut writer = TableWriter::create(&path).unwrap();
        for (key, value) in entries(10) {
            writer.add(&key, &value).unwrap();
        }
        let written = writer.finish().unwrap();
        let reopened = Table::open(&path).unwrap();

        assert_eq!(written.index_handle(), reopened.index_handle());
        let file_size = std::fs::metadata(&path).unwrap().len();
        let handle = reopened.index_handle();
        assert_eq!(handle.end(), Some(file_size - FOOTER_SIZE as u64));
    }

    #[test]
    fn test_add_rejects_unordered_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000003.sst");

        let mut writer = TableWriter::create(&path).unwrap().block_size(64);
        writer.add(b"apple", b"fruit").unwrap();
        writer.add(b"band", b"music").unwrap();

        let duplicate = writer.add(b"band", b"again");
        assert!(matches!(duplicate, Err(Error::InvalidArgument(_))));
        let backwards = writer.add(b"aardvark", b"animal");
        assert!(matches!(backwards, Err(Error::InvalidArgument(_))));

        writer.add(b"cherry", b"red").unwrap();
        let table = writer.finish().unwrap();
        assert_eq!(table.get(b"band").unwrap(), Some(b"music".to_vec()));
        assert_eq!(table.get(b"cherry").unwrap(), Some(b"red".to_vec()));
        assert_eq!(table.get(b"aardvark").unwrap(), None);
    }

    fn write_footer(path: &Path, body_len: usize, index_offset: u64, index_size: u64) {
        let mut bytes = vec![0u8; body_len];
        bytes.extend_from_slice(&index_offset.to_be_bytes());
        bytes.extend_from_slice(&index_size.to_be_bytes());
        bytes.extend_from_slice(&TABLE_MAGIC.to_be_bytes());
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_open_rejects_footer_past_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("footer.sst");

        for (index_offset, index_size) in [
            (u64::MAX, 16),
            (0, u64::MAX),
            (u64::MAX - 4, 0),
            (40, 30),
        ] {
            write_footer(&path, 64, index_offset, index_size);
            let result = Table::open(&path);
            assert!(
                matches!(result, Err(Error::InvalidData(_))),
                "footer ({}, {}) accepted",
                index_offset,
                index_size
            );
        }
    }

    #[test]
    fn test_small_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000005.sst");

        let mut writer = TableWriter::create(&path).unwrap().block_size(512);
        for (key, value) in entries(200) {
            writer.add(&key, &value).unwrap();
        }
        let table = writer.finish().unwrap();

        assert!(table.index().len() > 5, "expected many small blocks");
        assert_eq!(table.get(b"key_00150").unwrap(), Some(b"value_00150".to_vec()));
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bogus.sst");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        assert!(matches!(Table::open(&path), Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_detects_corrupted_data_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000004.sst");

        let mut writer = TableWriter::create(&path).unwrap();
        writer.add(b"apple", b"fruit").unwrap();
        writer.finish().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let table = Table::open(&path).unwrap();
        assert!(matches!(table.get(b"apple"), Err(Error::ChecksumMismatch)));
    }
}
