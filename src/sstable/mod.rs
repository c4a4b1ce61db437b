//! Sorted table files read by the offload path.
//!
//! A table is a run of data blocks, one index block and a fixed footer.
//! Every block is followed by a 5-byte trailer, so the offload program can
//! verify a block it fetched without consulting any other part of the file.
//!
//! ```text
//! +---------------------------+
//! | Data Block 1 | trailer    |  ← prefix-compressed entries, ~4KB target
//! +---------------------------+
//! | ...                       |
//! +---------------------------+
//! | Data Block N | trailer    |
//! +---------------------------+
//! | Index Block  | trailer    |  ← first key → data block handle
//! +---------------------------+
//! | Footer (24 bytes)         |  ← index handle + magic
//! +---------------------------+
//! ```
//!
//! ### Block Entry Format
//! ```text
//! +----------------+----------------+-------------+--------+-------+
//! |shared_len:u16  |unshared_len:u16|value_len:u32| key   | value |
//! +----------------+----------------+-------------+--------+-------+
//! ```
//!
//! ### Index Entry Format
//! ```text
//! +-------------+-----+----------+----------+
//! |key_len:u16  | key |offset:u64|size:u64  |
//! +-------------+-----+----------+----------+
//! ```
//!
//! ### Block Trailer
//! ```text
//! +----------------+---------------------------------+
//! |compression:u8  |crc32c(contents ‖ compression):u32|
//! +----------------+---------------------------------+
//! ```
//!
//! Block handles always describe the block contents only; the trailer
//! follows at `offset + size`.

pub mod block;
pub mod index;
pub mod table;

pub use block::BLOCK_TRAILER_SIZE;
pub use table::{Table, TableWriter, FOOTER_SIZE};

/// Location of a block inside a table file, excluding its trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Bytes occupied on disk, trailer included. `None` on overflow.
    pub fn len_with_trailer(&self) -> Option<u64> {
        self.size.checked_add(BLOCK_TRAILER_SIZE as u64)
    }

    /// File offset just past the trailer. `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.len_with_trailer()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_bounds() {
        let handle = BlockHandle::new(100, 20);
        assert_eq!(handle.len_with_trailer(), Some(25));
        assert_eq!(handle.end(), Some(125));

        assert_eq!(BlockHandle::new(0, u64::MAX).len_with_trailer(), None);
        assert_eq!(BlockHandle::new(u64::MAX, 16).end(), None);
    }
}
