//! # Record Module
//!
//! Defines the two value types everything else is built from — [`Key`] and
//! [`Record`] — and the byte-stable binary codec used by the WAL and by
//! segment data files. Because stratumdb owns this format, the on-disk
//! representation never changes due to a dependency upgrade.
//!
//! # Wire format
//!
//! ```text
//! [8 B last_modified LE][1 B key_len][key_len B key][4 B value_len LE][value_len B value]
//! ```
//!
//! Key and value payloads are **independently gzip-compressed** before
//! length-prefixing; both length fields hold the *compressed* length. The
//! gzip streams carry their own CRC32 trailer, so payload corruption is
//! detected at decode time.
//!
//! # Limits
//!
//! - Raw key length ≤ [`MAX_KEY_LEN`] (255 — the 1-byte length field).
//! - Raw value length ≤ [`MAX_VALUE_LEN`] (4 MiB), enforced by the engine,
//!   not the codec.
//! - Decoding rejects length fields beyond what a well-formed record can
//!   produce, preventing allocation bombs from corrupted input.
//!
//! # Zero-panic guarantee
//!
//! No function in this module uses `unwrap()` or `expect()`. All failures
//! are propagated via [`CodecError`] and are fatal to the single read that
//! hit them — never retried, never escalated to a crash.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::borrow::Borrow;
use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Maximum raw key length in bytes. Dictated by the 1-byte length field of
/// the record format and the segment index format.
pub const MAX_KEY_LEN: usize = 255;

/// Maximum raw value length in bytes (4 MiB). Enforced by the engine before
/// a record is ever constructed; the codec only guards against corrupt
/// length fields.
pub const MAX_VALUE_LEN: usize = 4 * 1024 * 1024;

/// Fixed header bytes per record: timestamp (8) + key length (1) + value
/// length (4). The key/value payloads follow their respective length fields.
pub const RECORD_HEADER_LEN: usize = 8 + 1 + 4;

/// Upper bound accepted for the compressed-value length field during
/// decoding. A well-formed 4 MiB value cannot compress to more than a few
/// bytes beyond its raw size; anything past this bound is corruption.
const MAX_COMPRESSED_VALUE_LEN: usize = MAX_VALUE_LEN + 64 * 1024;

const U32_SIZE: usize = std::mem::size_of::<u32>();
const U64_SIZE: usize = std::mem::size_of::<u64>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors produced while encoding or decoding a [`Record`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of record bytes (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A compressed key payload does not fit the 1-byte length field.
    ///
    /// Long keys of incompressible bytes can inflate past 255 bytes under
    /// gzip; such keys cannot be represented in the stable format.
    #[error("compressed key is {0} bytes, exceeding the 255-byte length field")]
    KeyOverflow(usize),

    /// A length field exceeds what a well-formed record can produce.
    #[error("length field overflow: {0}")]
    LengthOverflow(String),

    /// A decompressed payload exceeds its raw-size limit.
    #[error("decompressed {what} is larger than {limit} bytes")]
    PayloadTooLarge {
        /// Which payload overflowed ("key" or "value").
        what: &'static str,
        /// The applicable raw-size limit.
        limit: usize,
    },

    /// The gzip stream failed to compress or decompress.
    #[error("compression error: {0}")]
    Compression(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// Key
// ------------------------------------------------------------------------------------------------

/// An immutable byte-string key.
///
/// Ordering is unsigned lexicographic, byte by byte; when one key is a
/// strict prefix of the other, the shorter key sorts first. This is exactly
/// the ordering derived from the inner `Vec<u8>`, and it is the sort order
/// of the memtable and of every segment index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key(Vec<u8>);

impl Key {
    /// Creates a key from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is zero-length.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the key, returning the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
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

impl<const N: usize> From<&[u8; N]> for Key {
    fn from(bytes: &[u8; N]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Allows map lookups by `&[u8]` without allocating a `Key`.
impl Borrow<[u8]> for Key {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

// ------------------------------------------------------------------------------------------------
// Record
// ------------------------------------------------------------------------------------------------

/// A single key-value entry with its last-modified timestamp.
///
/// An **empty value is the tombstone**: deletes are stored as a record with
/// a zero-length value and a fresh timestamp, and "key never written" is
/// reported as an empty value with timestamp 0. There is no separate delete
/// marker. Records compare and sort solely by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The record key.
    pub key: Key,

    /// The stored value. Zero-length means deleted / absent.
    pub value: Vec<u8>,

    /// Milliseconds since the UNIX epoch at the time of the write.
    pub last_modified: u64,
}

impl Record {
    /// Creates a record stamped with the current wall-clock time.
    pub fn new(key: Key, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            last_modified: now_millis(),
        }
    }

    /// Creates the record reported for a key that has no stored value:
    /// empty value, timestamp 0.
    pub fn absent(key: Key) -> Self {
        Self {
            key,
            value: Vec::new(),
            last_modified: 0,
        }
    }

    /// Whether this record represents a deletion (or absence).
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }

    // --------------------------------------------------------------------------------------------
    // Codec
    // --------------------------------------------------------------------------------------------

    /// Serializes this record into the stable wire format.
    ///
    /// # Errors
    ///
    /// [`CodecError::KeyOverflow`] if the compressed key does not fit the
    /// 1-byte length field; [`CodecError::Compression`] on gzip failure.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let key_z = gzip(self.key.as_bytes())?;
        if key_z.len() > MAX_KEY_LEN {
            return Err(CodecError::KeyOverflow(key_z.len()));
        }
        let value_z = gzip(&self.value)?;
        if value_z.len() > u32::MAX as usize {
            return Err(CodecError::LengthOverflow(format!(
                "compressed value is {} bytes",
                value_z.len()
            )));
        }

        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + key_z.len() + value_z.len());
        buf.extend_from_slice(&self.last_modified.to_le_bytes());
        buf.push(key_z.len() as u8);
        buf.extend_from_slice(&key_z);
        buf.extend_from_slice(&(value_z.len() as u32).to_le_bytes());
        buf.extend_from_slice(&value_z);
        Ok(buf)
    }

    /// Decodes one record from the beginning of `buf`.
    ///
    /// Returns `(record, bytes_consumed)` so callers can advance a cursor
    /// through a buffer holding multiple records.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut off = 0;

        let ts_bytes = take(buf, &mut off, U64_SIZE)?;
        let mut ts = [0u8; U64_SIZE];
        ts.copy_from_slice(ts_bytes);
        let last_modified = u64::from_le_bytes(ts);

        let key_z_len = take(buf, &mut off, 1)?[0] as usize;
        let key_z = take(buf, &mut off, key_z_len)?;
        let key = gunzip(key_z, "key", MAX_KEY_LEN)?;

        let len_bytes = take(buf, &mut off, U32_SIZE)?;
        let mut len = [0u8; U32_SIZE];
        len.copy_from_slice(len_bytes);
        let value_z_len = u32::from_le_bytes(len) as usize;
        if value_z_len > MAX_COMPRESSED_VALUE_LEN {
            return Err(CodecError::LengthOverflow(format!(
                "compressed value length {value_z_len} exceeds {MAX_COMPRESSED_VALUE_LEN}"
            )));
        }
        let value_z = take(buf, &mut off, value_z_len)?;
        let value = gunzip(value_z, "value", MAX_VALUE_LEN)?;

        Ok((
            Self {
                key: Key::new(key),
                value,
                last_modified,
            },
            off,
        ))
    }

    /// Length in bytes of the encoded record starting at `buf[0]`, computed
    /// by walking the length fields alone — no decompression. Compaction
    /// uses this to copy record bytes between data files unmodified.
    pub fn encoded_span(buf: &[u8]) -> Result<usize, CodecError> {
        let mut off = 0;
        take(buf, &mut off, U64_SIZE)?;
        let key_z_len = take(buf, &mut off, 1)?[0] as usize;
        take(buf, &mut off, key_z_len)?;
        let len_bytes = take(buf, &mut off, U32_SIZE)?;
        let mut len = [0u8; U32_SIZE];
        len.copy_from_slice(len_bytes);
        let value_z_len = u32::from_le_bytes(len) as usize;
        if value_z_len > MAX_COMPRESSED_VALUE_LEN {
            return Err(CodecError::LengthOverflow(format!(
                "compressed value length {value_z_len} exceeds {MAX_COMPRESSED_VALUE_LEN}"
            )));
        }
        take(buf, &mut off, value_z_len)?;
        Ok(off)
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Returns the current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Slices `count` bytes out of `buf` at `*off`, advancing the cursor.
#[inline]
fn take<'a>(buf: &'a [u8], off: &mut usize, count: usize) -> Result<&'a [u8], CodecError> {
    let available = buf.len().saturating_sub(*off);
    if available < count {
        return Err(CodecError::UnexpectedEof {
            needed: count,
            available,
        });
    }
    let slice = &buf[*off..*off + count];
    *off += count;
    Ok(slice)
}

/// Gzip-compresses a payload.
fn gzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Gzip-decompresses a payload, rejecting output beyond `limit` bytes.
fn gunzip(data: &[u8], what: &'static str, limit: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let mut decoder = GzDecoder::new(data).take(limit as u64 + 1);
    decoder.read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(CodecError::PayloadTooLarge { what, limit });
    }
    Ok(out)
}
