use std::cmp::Ordering;
use std::io;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::{error::Result, Error};

const RESTART_INTERVAL: usize = 16;

/// Size of the trailer that follows every block on disk: one compression tag
/// byte and a CRC-32C over the block contents and the tag.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// The only compression tag this format writes.
pub const NO_COMPRESSION: u8 = 0;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Appends the block trailer to `data`.
pub fn seal(mut data: Vec<u8>) -> Vec<u8> {
    let mut digest = CRC32C.digest();
    digest.update(&data);
    digest.update(&[NO_COMPRESSION]);
    let checksum = digest.finalize();

    data.push(NO_COMPRESSION);
    data.extend_from_slice(&checksum.to_be_bytes());
    data
}

/// Verifies the trailer at the end of `raw` and returns the block contents.
pub fn unseal(raw: &[u8]) -> Result<&[u8]> {
    if raw.len() < BLOCK_TRAILER_SIZE {
        return Err(Error::Decode(
            "block trailer",
            io::Error::new(io::ErrorKind::UnexpectedEof, "Data too short"),
        ));
    }
    let (contents, trailer) = raw.split_at(raw.len() - BLOCK_TRAILER_SIZE);
    if trailer[0] != NO_COMPRESSION {
        return Err(Error::InvalidData(format!(
            "Unsupported block compression tag {}",
            trailer[0]
        )));
    }

    let stored = (&trailer[1..]).read_u32::<BigEndian>()?;
    let mut digest = CRC32C.digest();
    digest.update(contents);
    digest.update(&trailer[..1]);
    if digest.finalize() != stored {
        return Err(Error::ChecksumMismatch);
    }
    Ok(contents)
}

pub struct Builder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl Builder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Keys must be added in strictly increasing order.
    pub fn add_entry(&mut self, key: &[u8], value: &[u8]) {
        let shared_prefix_len = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };
        let unshared_key_len = key.len() - shared_prefix_len;

        // Writes into a Vec cannot fail.
        let _ = self.buffer.write_u16::<BigEndian>(shared_prefix_len as u16);
        let _ = self.buffer.write_u16::<BigEndian>(unshared_key_len as u16);
        let _ = self.buffer.write_u32::<BigEndian>(value.len() as u32);
        self.buffer.extend_from_slice(&key[shared_prefix_len..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            let _ = self.buffer.write_u32::<BigEndian>(*pos);
        }
        let _ = self
            .buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32);
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(a, b)| a == b).count()
}

/// A decoded data block: prefix-compressed entries followed by the restart
/// array and its length.
#[derive(Clone)]
pub struct Block {
    data: Vec<u8>,
    restart_positions: Vec<u32>,
}

impl Block {
    /// Splits sealed-off block contents into entries and restart array.
    pub fn new(mut data: Vec<u8>) -> Result<Self> {
        let too_short = |what: &'static str| {
            Error::Decode(what, io::Error::from(io::ErrorKind::UnexpectedEof))
        };
        let count_at = data.len().checked_sub(4).ok_or_else(|| too_short("restart count"))?;
        let count = (&data[count_at..]).read_u32::<BigEndian>()? as usize;
        let restarts_at = count
            .checked_mul(4)
            .and_then(|len| count_at.checked_sub(len))
            .ok_or_else(|| too_short("restart array"))?;

        let restart_positions = data[restarts_at..count_at]
            .chunks_exact(4)
            .map(|mut chunk| chunk.read_u32::<BigEndian>())
            .collect::<io::Result<Vec<u32>>>()?;
        if restart_positions.iter().any(|&p| p as usize >= restarts_at) {
            return Err(Error::InvalidData("Restart point past block entries".into()));
        }

        data.truncate(restarts_at);
        Ok(Self {
            data,
            restart_positions,
        })
    }

    /// Point lookup: binary search over restart points, then a linear scan
    /// of the restart run that may hold `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut left = 0;
        let mut right = self.restart_positions.len();
        while left < right {
            let mid = left + (right - left) / 2;
            let (restart_key, _, _) = self.entry_at(self.restart_positions[mid] as usize, &[])?;
            match restart_key.as_slice().cmp(key) {
                Ordering::Greater => right = mid,
                _ => left = mid + 1,
            }
        }
        if left == 0 {
            return Ok(None);
        }

        let mut offset = self.restart_positions[left - 1] as usize;
        let end = self
            .restart_positions
            .get(left)
            .map_or(self.data.len(), |&p| p as usize);
        let mut last_key = Vec::new();
        while offset < end {
            let (entry_key, value, next) = self.entry_at(offset, &last_key)?;
            match entry_key.as_slice().cmp(key) {
                Ordering::Equal => return Ok(Some(value.to_vec())),
                Ordering::Greater => return Ok(None),
                Ordering::Less => {}
            }
            last_key = entry_key;
            offset = next;
        }
        Ok(None)
    }

    /// Decodes the entry at `offset`, returning its full key, its value and
    /// the offset of the next entry.
    fn entry_at(&self, offset: usize, last_key: &[u8]) -> Result<(Vec<u8>, &[u8], usize)> {
        let data = &self.data;
        if offset + 8 > data.len() {
            return Err(Error::InvalidData("Block entry header out of bounds".into()));
        }
        let mut header = &data[offset..offset + 8];
        let shared_len = header
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Decode("shared_len", e))? as usize;
        let unshared_len = header
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Decode("unshared_len", e))? as usize;
        let value_len = header
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("value_len", e))? as usize;

        let pos = offset + 8;
        if shared_len > last_key.len() || pos + unshared_len + value_len > data.len() {
            return Err(Error::InvalidData("Block entry out of bounds".into()));
        }

        let mut key = Vec::with_capacity(shared_len + unshared_len);
        key.extend_from_slice(&last_key[..shared_len]);
        key.extend_from_slice(&data[pos..pos + unshared_len]);
        let value_start = pos + unshared_len;
        let value = &data[value_start..value_start + value_len];

        Ok((key, value, value_start + value_len))
    }
}
