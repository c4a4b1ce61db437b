//! Internal keys and the sink that receives offload results.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::Result;
use crate::Error;

/// Largest sequence number that fits next to the type tag.
pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

/// Kind of record stored under an internal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Deletion,
    Value,
    Merge,
    SingleDeletion,
}

impl ValueType {
    pub fn to_raw(self) -> u32 {
        match self {
            ValueType::Deletion => 0x0,
            ValueType::Value => 0x1,
            ValueType::Merge => 0x2,
            ValueType::SingleDeletion => 0x7,
        }
    }
}

impl TryFrom<u32> for ValueType {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0x0 => Ok(ValueType::Deletion),
            0x1 => Ok(ValueType::Value),
            0x2 => Ok(ValueType::Merge),
            0x7 => Ok(ValueType::SingleDeletion),
            other => Err(Error::Corruption(format!("unknown value type {:#x}", other))),
        }
    }
}

/// A user key tagged with the sequence number and type of its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: u64,
    pub value_type: ValueType,
}

impl<'a> InternalKey<'a> {
    pub fn new(user_key: &'a [u8], sequence: u64, value_type: ValueType) -> Self {
        Self {
            user_key,
            sequence,
            value_type,
        }
    }

    /// Encodes the key as `user_key ‖ le64(sequence << 8 | type)`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.sequence > MAX_SEQUENCE {
            return Err(Error::InvalidArgument(format!(
                "sequence {} exceeds {}",
                self.sequence, MAX_SEQUENCE
            )));
        }
        let mut buf = Vec::with_capacity(self.user_key.len() + 8);
        buf.extend_from_slice(self.user_key);
        buf.write_u64::<LittleEndian>((self.sequence << 8) | u64::from(self.value_type.to_raw()))?;
        Ok(buf)
    }
}

/// Receives the record an offload lookup found.
pub trait ValueSink {
    /// Returns whether the record answered the lookup.
    fn save(&mut self, key: &InternalKey<'_>, value: &[u8]) -> bool;
}

impl<F> ValueSink for F
where
    F: FnMut(&InternalKey<'_>, &[u8]) -> bool,
{
    fn save(&mut self, key: &InternalKey<'_>, value: &[u8]) -> bool {
        self(key, value)
    }
}

/// What a point lookup resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupState {
    NotFound,
    Found(Vec<u8>),
    Deleted,
    /// A merge operand; resolving it needs the merge operator.
    Merge(Vec<u8>),
}

/// Sink for a single-key lookup: accepts records for its user key only.
#[derive(Debug, Clone)]
pub struct PointLookup {
    user_key: Vec<u8>,
    state: LookupState,
    sequence: Option<u64>,
}

impl PointLookup {
    pub fn new(user_key: impl Into<Vec<u8>>) -> Self {
        Self {
            user_key: user_key.into(),
            state: LookupState::NotFound,
            sequence: None,
        }
    }

    pub fn state(&self) -> &LookupState {
        &self.state
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        match self.state {
            LookupState::Found(value) => Some(value),
            _ => None,
        }
    }
}

impl ValueSink for PointLookup {
    fn save(&mut self, key: &InternalKey<'_>, value: &[u8]) -> bool {
        if key.user_key != self.user_key.as_slice() {
            return false;
        }
        self.state = match key.value_type {
            ValueType::Value => LookupState::Found(value.to_vec()),
            ValueType::Deletion | ValueType::SingleDeletion => LookupState::Deleted,
            ValueType::Merge => LookupState::Merge(value.to_vec()),
        };
        self.sequence = Some(key.sequence);
        true
    }
}
