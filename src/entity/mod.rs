//! # Entity Module
//!
//! Defines [`Entity`], the single versioned record stored by every layer of
//! the engine, together with its fixed, byte-exact binary encoding.
//!
//! # Wire format
//!
//! Every record is encoded **big-endian** in this exact order:
//!
//! ```text
//! [u16 key_len][i64 timestamp][i8 deleted_flag][i32 value_len][key bytes][value bytes]
//! ```
//!
//! | Field          | Size | Notes                                          |
//! |----------------|------|------------------------------------------------|
//! | `key_len`      | 2 B  | unsigned, keys are limited to 65 535 bytes      |
//! | `timestamp`    | 8 B  | signed, higher is more recent                  |
//! | `deleted_flag` | 1 B  | `127` = tombstone, `-128` = live, else corrupt |
//! | `value_len`    | 4 B  | signed, negative lengths are corrupt           |
//!
//! Region files are nothing more than these records back-to-back; there is
//! no header, footer, record count or checksum.
//!
//! # Zero-panic guarantee
//!
//! Decoding never indexes past the end of its input. Truncated or malformed
//! records surface as [`CodecError::CorruptRecord`] with the byte offset of
//! the record that could not be decoded.

pub mod ordering;

#[cfg(test)]
mod tests;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const KEY_LEN_SIZE: usize = std::mem::size_of::<u16>();
const TIMESTAMP_SIZE: usize = std::mem::size_of::<i64>();
const FLAG_SIZE: usize = std::mem::size_of::<i8>();
const VALUE_LEN_SIZE: usize = std::mem::size_of::<i32>();

/// Size of the fixed record preamble preceding the key and value bytes.
pub const HEADER_SIZE: usize = KEY_LEN_SIZE + TIMESTAMP_SIZE + FLAG_SIZE + VALUE_LEN_SIZE;

/// Flag byte marking a tombstone.
pub const DELETED_FLAG: i8 = i8::MAX;

/// Flag byte marking a live record.
pub const LIVE_FLAG: i8 = i8::MIN;

/// Largest key the format can represent.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Largest value the format can represent.
pub const MAX_VALUE_LEN: usize = i32::MAX as usize;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors produced while encoding or decoding an [`Entity`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// The record starting at `offset` is truncated or malformed.
    ///
    /// Offsets after a corrupt record cannot be trusted, so readers stop
    /// at the first occurrence.
    #[error("corrupt record at offset {offset}: {reason}")]
    CorruptRecord {
        /// Byte offset of the record within its buffer.
        offset: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// Key or value length is outside what the wire format can represent.
    #[error("encoding limit exceeded: {0}")]
    EncodingLimitExceeded(String),
}

// ------------------------------------------------------------------------------------------------
// Entity
// ------------------------------------------------------------------------------------------------

/// A single timestamp-versioned record.
///
/// Entities are immutable once constructed. Two entities are equal iff key,
/// value, timestamp and deleted flag are all equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entity {
    key: Vec<u8>,
    value: Vec<u8>,
    timestamp: i64,
    deleted: bool,
}

impl Entity {
    /// Creates an entity from all four fields.
    pub fn new(
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        timestamp: i64,
        deleted: bool,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp,
            deleted,
        }
    }

    /// Creates a live (non-deleted) entity.
    pub fn live(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, timestamp: i64) -> Self {
        Self::new(key, value, timestamp, false)
    }

    /// Creates a tombstone for `key` as of `timestamp`. Tombstones carry an
    /// empty value.
    pub fn tombstone(key: impl Into<Vec<u8>>, timestamp: i64) -> Self {
        Self::new(key, Vec::new(), timestamp, true)
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Consumes the entity, returning `(key, value)`.
    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        (self.key, self.value)
    }

    /// Number of bytes [`Entity::encode_to`] appends.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.key.len() + self.value.len()
    }

    /// Rejects keys and values the wire format cannot represent.
    pub fn check_limits(&self) -> Result<(), CodecError> {
        if self.key.len() > MAX_KEY_LEN {
            return Err(CodecError::EncodingLimitExceeded(format!(
                "key length {} exceeds {MAX_KEY_LEN}",
                self.key.len()
            )));
        }
        if self.value.len() > MAX_VALUE_LEN {
            return Err(CodecError::EncodingLimitExceeded(format!(
                "value length {} exceeds {MAX_VALUE_LEN}",
                self.value.len()
            )));
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Encoding
    // --------------------------------------------------------------------------------------------

    /// Appends the encoded record to `buf`.
    ///
    /// Nothing is written when the limits check fails.
    pub fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.check_limits()?;

        buf.reserve(self.encoded_len());
        buf.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        let flag = if self.deleted { DELETED_FLAG } else { LIVE_FLAG };
        buf.extend_from_slice(&flag.to_be_bytes());
        buf.extend_from_slice(&(self.value.len() as i32).to_be_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        Ok(())
    }

    /// Encodes the record into a freshly allocated buffer.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_to(&mut buf)?;
        Ok(buf)
    }

    // --------------------------------------------------------------------------------------------
    // Decoding
    // --------------------------------------------------------------------------------------------

    /// Decodes one record from the start of `buf`.
    ///
    /// Returns `(entity, bytes_consumed)`.
    pub fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        Self::decode_at(buf, 0)
    }

    /// Decodes the record starting at `buf[offset]`.
    ///
    /// Errors report `offset` so that a reader walking a whole file can say
    /// which record was bad. Returns `(entity, bytes_consumed)`.
    pub fn decode_at(buf: &[u8], offset: usize) -> Result<(Self, usize), CodecError> {
        let rest = buf.get(offset..).unwrap_or_default();

        let header = take(rest, HEADER_SIZE, offset, "record header")?;
        let key_len = u16::from_be_bytes([header[0], header[1]]) as usize;
        let timestamp = i64::from_be_bytes([
            header[2], header[3], header[4], header[5], header[6], header[7], header[8], header[9],
        ]);
        let flag = i8::from_be_bytes([header[10]]);
        let value_len = i32::from_be_bytes([header[11], header[12], header[13], header[14]]);

        let deleted = match flag {
            DELETED_FLAG => true,
            LIVE_FLAG => false,
            other => {
                return Err(CodecError::CorruptRecord {
                    offset,
                    reason: format!("invalid deleted flag {other}"),
                });
            }
        };

        let value_len = usize::try_from(value_len).map_err(|_| CodecError::CorruptRecord {
            offset,
            reason: format!("negative value length {value_len}"),
        })?;

        let payload = take(&rest[HEADER_SIZE..], key_len + value_len, offset, "key/value")?;
        let (key, value) = payload.split_at(key_len);

        Ok((
            Self {
                key: key.to_vec(),
                value: value.to_vec(),
                timestamp,
                deleted,
            },
            HEADER_SIZE + key_len + value_len,
        ))
    }
}

/// Returns the first `needed` bytes of `buf`, or a truncation error.
#[inline]
fn take<'a>(
    buf: &'a [u8],
    needed: usize,
    offset: usize,
    what: &str,
) -> Result<&'a [u8], CodecError> {
    buf.get(..needed).ok_or_else(|| CodecError::CorruptRecord {
        offset,
        reason: format!("truncated {what}: need {needed} bytes, have {}", buf.len()),
    })
}

// ------------------------------------------------------------------------------------------------
// Tracing Helper
// ------------------------------------------------------------------------------------------------

/// Renders a key as hex for log lines, eliding the middle of long keys.
pub(crate) struct HexKey<'a>(pub &'a [u8]);

impl std::fmt::Display for HexKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{:02x}", byte)?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{:02x}", byte)?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HexKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
