//! Sparse index block mapping the first key of each data block to its handle.

use std::convert::TryFrom;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::BlockHandle;
use crate::error::Result;
use crate::Error;

/// An entry in the sparse index, representing a single data block.
#[derive(Debug)]
pub struct Entry<'a> {
    pub index: usize,
    pub key: &'a [u8],
    pub handle: BlockHandle,
}

/// The sparse index for a table. Entries are ordered by key; each one
/// points at a data block whose size excludes the block trailer.
#[derive(Debug, Clone, Default)]
pub struct Index {
    entries: Vec<(Vec<u8>, BlockHandle)>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, key: Vec<u8>, handle: BlockHandle) {
        self.entries.push((key, handle));
    }

    /// Finds the data block that may contain the given key.
    ///
    /// Returns the exact match when a block starts with `key`, otherwise the
    /// block that *precedes* the insertion point. Keys smaller than every
    /// block's first key have no candidate block.
    pub fn find(&self, key: &[u8]) -> Option<Entry<'_>> {
        let idx = match self
            .entries
            .binary_search_by(|(first_key, _)| first_key.as_slice().cmp(key))
        {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let (key, handle) = &self.entries[idx];
        Some(Entry {
            index: idx,
            key,
            handle: *handle,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        for (key, handle) in &self.entries {
            buffer.write_u16::<BigEndian>(key.len() as u16)?;
            buffer.write_all(key)?;
            buffer.write_u64::<BigEndian>(handle.offset)?;
            buffer.write_u64::<BigEndian>(handle.size)?;
        }
        Ok(buffer)
    }
}

impl TryFrom<&[u8]> for Index {
    type Error = Error;

    /// Decodes an index block. Entries must be in strictly increasing key
    /// order, since `find` binary-searches them.
    fn try_from(mut cursor: &[u8]) -> Result<Self> {
        let mut index = Index::new();
        while !cursor.is_empty() {
            let key_len = cursor
                .read_u16::<BigEndian>()
                .map_err(|e| Error::ReadError("index key length", e))?;
            let mut key = vec![0u8; key_len as usize];
            cursor
                .read_exact(&mut key)
                .map_err(|e| Error::ReadError("index key", e))?;
            let mut handle = [0u64; 2];
            cursor
                .read_u64_into::<BigEndian>(&mut handle)
                .map_err(|e| Error::ReadError("index block handle", e))?;

            if let Some((last, _)) = index.entries.last() {
                if last.as_slice() >= key.as_slice() {
                    return Err(Error::InvalidData(format!(
                        "index keys out of order at entry {}",
                        index.len()
                    )));
                }
            }
            index.push(key, BlockHandle::new(handle[0], handle[1]));
        }
        Ok(index)
    }
}
