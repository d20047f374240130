//! Byte-ordered keys
//!
//! Row keys use the table record layout `t{table_id}_r{handle}` where both
//! integers are written big-endian with the sign bit flipped, so the byte
//! order of encoded keys matches the numeric order of `(table_id, handle)`.

use serde::{Deserialize, Serialize};
use std::fmt;

const TABLE_PREFIX: u8 = b't';
const RECORD_SEP: &[u8] = b"_r";
const SIGN_MASK: u64 = 1 << 63;
const RECORD_KEY_LEN: usize = 1 + 8 + 2 + 8;

/// An ordered byte key.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

fn encode_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ SIGN_MASK).to_be_bytes()
}

fn decode_i64(bytes: &[u8]) -> Option<i64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some((u64::from_be_bytes(raw) ^ SIGN_MASK) as i64)
}

impl Key {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Key of the row with `handle` in table `table_id`.
    pub fn record(table_id: i64, handle: i64) -> Self {
        let mut bytes = Self::table_record_prefix(table_id).0;
        bytes.extend_from_slice(&encode_i64(handle));
        Self(bytes)
    }

    /// Common prefix of every row key of a table.
    pub fn table_record_prefix(table_id: i64) -> Self {
        let mut bytes = Vec::with_capacity(RECORD_KEY_LEN);
        bytes.push(TABLE_PREFIX);
        bytes.extend_from_slice(&encode_i64(table_id));
        bytes.extend_from_slice(RECORD_SEP);
        Self(bytes)
    }

    /// Half-open range `[start, end)` covering every row key of a table.
    pub fn table_record_range(table_id: i64) -> (Key, Key) {
        let start = Self::table_record_prefix(table_id);
        let end = start.prefix_next();
        (start, end)
    }

    /// Decode `(table_id, handle)` from a row key.
    pub fn decode_record(&self) -> Option<(i64, i64)> {
        if self.0.len() != RECORD_KEY_LEN || self.0[0] != TABLE_PREFIX || &self.0[9..11] != RECORD_SEP
        {
            return None;
        }
        Some((decode_i64(&self.0[1..9])?, decode_i64(&self.0[11..])?))
    }

    /// Smallest key greater than every key with this prefix.
    ///
    /// Returns the empty key (unbounded) when the prefix is all `0xff`.
    pub fn prefix_next(&self) -> Key {
        let mut bytes = self.0.clone();
        while let Some(last) = bytes.pop() {
            if last < u8::MAX {
                bytes.push(last + 1);
                return Key(bytes);
            }
        }
        Key::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode_record() {
            Some((table, handle)) => write!(f, "t{}_r{}", table, handle),
            None => {
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
