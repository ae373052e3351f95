//! # Write-Ahead Log Module
//!
//! An **append-only**, **length-prefixed** log of encoded [`Record`]s,
//! replayed at startup to reconstruct the memtable state that had not yet
//! been flushed to segments.
//!
//! # On-disk layout
//!
//! ```text
//! [FRAME_LEN_LE (4 B)][RECORD_BYTES]
//! [FRAME_LEN_LE (4 B)][RECORD_BYTES]
//! ...
//! ```
//!
//! Each frame holds one record in the codec format of
//! [`record`](crate::record). Files are named `wal-{secs}.{nanos}.log`
//! inside a dedicated log directory; the timestamp orders files for
//! oldest-first replay and is compared **numerically**, never lexically,
//! so differing digit widths cannot misorder recovery.
//!
//! # Guarantees
//!
//! - **Durability:** every [`Wal::append`] ends with an `fsync`; the engine
//!   appends before the corresponding memtable insert becomes visible.
//! - **Truncated-write tolerance:** a partial trailing frame (interrupted
//!   append) is detected at replay and silently discarded.
//! - **Partial recovery:** a frame that fails record decoding ends replay
//!   of that file; everything decoded before it is kept.
//!
//! # Rotation
//!
//! The WAL never rotates by itself. The engine opens a fresh file whenever
//! the active memtable rotates (and when the active file outgrows its size
//! bound), and deletes a file only after every record in it is durably
//! persisted inside a segment.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::record::{CodecError, MAX_VALUE_LEN, Record};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Upper bound accepted for a frame length during replay. A well-formed
/// frame holds one encoded record, whose compressed value cannot meaningfully
/// exceed the raw value limit; anything past this bound is corruption.
const MAX_FRAME_LEN: usize = MAX_VALUE_LEN + 128 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A replayed frame failed record decoding.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A replayed frame length exceeds any well-formed record.
    #[error("frame of {0} bytes exceeds the maximum record size")]
    FrameTooLarge(usize),
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// Builds the canonical WAL filename for a creation timestamp.
fn file_name(secs: u64, nanos: u32) -> String {
    format!("wal-{secs}.{nanos:09}.log")
}

/// Parses `(secs, nanos)` out of a WAL filename, or `None` if the name does
/// not match the `wal-{secs}.{nanos}.log` pattern.
fn parse_timestamp(name: &str) -> Option<(u64, u32)> {
    let stem = name.strip_prefix("wal-")?.strip_suffix(".log")?;
    let (secs, nanos) = stem.split_once('.')?;
    Some((secs.parse().ok()?, nanos.parse().ok()?))
}

/// Enumerates the WAL files in `dir`, sorted oldest first by the numeric
/// timestamp embedded in each name. Files with unrecognized names are
/// ignored.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>, WalError> {
    let mut found: Vec<((u64, u32), PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(ts) = parse_timestamp(name) {
            found.push((ts, path));
        }
    }
    found.sort_by_key(|(ts, _)| *ts);
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

// ------------------------------------------------------------------------------------------------
// Wal — append side
// ------------------------------------------------------------------------------------------------

/// The active write-ahead log file.
#[derive(Debug)]
pub struct Wal {
    file: File,
    path: PathBuf,

    /// Total bytes in the file, maintained across appends; drives the
    /// engine's size-bound rotation check.
    size: u64,
}

impl Wal {
    /// Creates a fresh, timestamp-named WAL file in `dir`.
    pub fn create(dir: &Path) -> Result<Self, WalError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let (secs, mut nanos) = (now.as_secs(), now.subsec_nanos());

        // Two rotations inside one nanosecond cannot happen, but a clock
        // that lost precision can repeat a timestamp; bump until unique.
        loop {
            let path = dir.join(file_name(secs, nanos));
            match OpenOptions::new().create_new(true).append(true).open(&path) {
                Ok(file) => {
                    debug!(path = %path.display(), "created WAL file");
                    return Ok(Self {
                        file,
                        path,
                        size: 0,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    nanos = nanos.wrapping_add(1);
                }
                Err(e) => return Err(WalError::Io(e)),
            }
        }
    }

    /// Appends one frame — `[4 B length LE][record_bytes]` — and fsyncs.
    ///
    /// The caller must not make the corresponding memtable mutation visible
    /// until this returns.
    pub fn append(&mut self, record_bytes: &[u8]) -> Result<(), WalError> {
        let len = record_bytes.len() as u32;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(record_bytes)?;
        self.file.sync_all()?;

        self.size += (U32_SIZE + record_bytes.len()) as u64;
        trace!(frame_len = len, total = self.size, "WAL append");
        Ok(())
    }

    /// Total bytes written to this file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.file.sync_all() {
            error!(path = %self.path.display(), "failed to sync WAL on drop: {e}");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Replay
// ------------------------------------------------------------------------------------------------

/// Opens a streaming replay over the frames of one WAL file.
pub fn replay(path: &Path) -> Result<ReplayIter, WalError> {
    let file = File::open(path)?;
    debug!(path = %path.display(), "starting WAL replay");
    Ok(ReplayIter {
        reader: BufReader::new(file),
        path: path.to_path_buf(),
        done: false,
    })
}

/// Iterator yielding the decodable prefix of a WAL file as [`Record`]s.
///
/// A partial trailing frame ends iteration silently (logged at warn); a
/// frame that fails decoding yields one `Err` and then ends.
pub struct ReplayIter {
    reader: BufReader<File>,
    path: PathBuf,
    done: bool,
}

impl ReplayIter {
    /// Reads exactly `buf.len()` bytes. Distinguishes a clean EOF at a
    /// frame boundary (`Ok(false)` with `at_start`) from a torn frame.
    fn read_frame_part(&mut self, buf: &mut [u8], part: &str) -> Result<bool, WalError> {
        match self.reader.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(
                    path = %self.path.display(),
                    "discarding truncated trailing WAL frame ({part})"
                );
                Ok(false)
            }
            Err(e) => Err(WalError::Io(e)),
        }
    }
}

impl Iterator for ReplayIter {
    type Item = Result<Record, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // Frame length. A clean EOF here is the normal end of the log; a
        // partial read is a torn frame and is discarded.
        let mut len_bytes = [0u8; U32_SIZE];
        match self.reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(WalError::Io(e)));
            }
        }

        let frame_len = u32::from_le_bytes(len_bytes) as usize;
        if frame_len > MAX_FRAME_LEN {
            self.done = true;
            return Some(Err(WalError::FrameTooLarge(frame_len)));
        }

        // Frame body. EOF mid-body means the append was interrupted; the
        // frame is dropped and iteration ends.
        let mut frame = vec![0u8; frame_len];
        match self.read_frame_part(&mut frame, "body") {
            Ok(true) => {}
            Ok(false) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        }

        match Record::decode(&frame) {
            Ok((record, _)) => Some(Ok(record)),
            Err(e) => {
                self.done = true;
                Some(Err(WalError::Codec(e)))
            }
        }
    }
}
