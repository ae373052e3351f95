//! # Segment Module
//!
//! An immutable on-disk batch of sorted records, stored as an **index +
//! data file pair**.
//!
//! ## Design Overview
//!
//! The data file is an append-only sequence of records in the codec format
//! of [`record`](crate::record); byte offsets into it are only meaningful
//! through the index. The index file is a **full (non-sparse)** mapping of
//! every key in the segment to its data-file offset, written in key order:
//!
//! ```text
//! index: [1 B key_len][key_len B raw key][8 B offset LE]  × entry count
//! data:  [record bytes][record bytes]...
//! ```
//!
//! On open, the index is parsed completely into an in-memory sorted map and
//! the data file is memory-mapped; a point lookup is a map probe plus one
//! record decode at the found offset.
//!
//! ## Atomicity
//!
//! 1. Data file written and fsynced under its canonical name.
//! 2. Index written and fsynced under the temporary `.idxtmp` name.
//! 3. [`Segment::finalize`] renames `.idxtmp` → `.idx`.
//!
//! Readers discover segments only through canonical `.idx` names, so a
//! partially-written segment is never visible; a crash leaves at most an
//! orphaned `.idxtmp`/`.dat` pair that recovery removes.
//!
//! ## Naming
//!
//! `seg-{level}-{secs}.{nanos:09}` + `.idx` / `.dat` / `.idxtmp`. The
//! embedded creation timestamp orders segments within a level (newest
//! first) and is always compared numerically.
//!
//! ## Concurrency
//!
//! Finalized segments are immutable; any number of threads may search one
//! concurrently through a shared handle with no locking.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::record::{CodecError, Key, Record};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Extension of a finalized index file.
pub const INDEX_EXT: &str = "idx";

/// Extension of an index file still being written by a flush or merge.
pub const TMP_INDEX_EXT: &str = "idxtmp";

/// Extension of a data file.
pub const DATA_EXT: &str = "dat";

const U64_SIZE: usize = std::mem::size_of::<u64>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment operations.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record failed to decode from the data file.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The index file does not parse as a sequence of entries.
    #[error("malformed index: {0}")]
    MalformedIndex(String),

    /// An index offset points outside the data file.
    #[error("offset {offset} out of range for data file of {len} bytes")]
    OffsetOutOfRange {
        /// The offending offset.
        offset: u64,
        /// The data file length.
        len: u64,
    },
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// Builds the filename stem `seg-{level}-{secs}.{nanos:09}`.
fn stem(level: usize, secs: u64, nanos: u32) -> String {
    format!("seg-{level}-{secs}.{nanos:09}")
}

/// Parses `(level, secs, nanos)` out of a segment filename stem.
pub(crate) fn parse_stem(stem: &str) -> Option<(usize, u64, u32)> {
    let rest = stem.strip_prefix("seg-")?;
    let (level, ts) = rest.split_once('-')?;
    let (secs, nanos) = ts.split_once('.')?;
    Some((level.parse().ok()?, secs.parse().ok()?, nanos.parse().ok()?))
}

// ------------------------------------------------------------------------------------------------
// SegmentWriter
// ------------------------------------------------------------------------------------------------

/// Streams records in key order into a fresh segment.
///
/// The caller must feed strictly ascending keys — either a frozen
/// memtable's sorted iteration (flush) or a merged index walk (compaction).
/// [`SegmentWriter::finish`] produces an **unfinalized** [`Segment`] whose
/// index still lives under its `.idxtmp` name.
pub struct SegmentWriter {
    dir: PathBuf,
    level: usize,
    created: (u64, u32),
    data: BufWriter<File>,
    offset: u64,
    entries: Vec<(Key, u64)>,
}

impl SegmentWriter {
    /// Opens a fresh, timestamp-named data file at `level` in `dir`.
    pub fn create(dir: &Path, level: usize) -> Result<Self, SegmentError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let (secs, mut nanos) = (now.as_secs(), now.subsec_nanos());

        // Bump the nanosecond component until the name is unused.
        loop {
            let data_path = dir.join(format!("{}.{DATA_EXT}", stem(level, secs, nanos)));
            match OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&data_path)
            {
                Ok(file) => {
                    debug!(path = %data_path.display(), "created segment data file");
                    return Ok(Self {
                        dir: dir.to_path_buf(),
                        level,
                        created: (secs, nanos),
                        data: BufWriter::new(file),
                        offset: 0,
                        entries: Vec::new(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    nanos = nanos.wrapping_add(1);
                }
                Err(e) => return Err(SegmentError::Io(e)),
            }
        }
    }

    /// Encodes and appends one record, recording its `(key, offset)` entry.
    pub fn append_record(&mut self, record: &Record) -> Result<(), SegmentError> {
        let bytes = record.encode()?;
        self.append_raw(record.key.clone(), &bytes)
    }

    /// Appends already-encoded record bytes unmodified. Compaction uses
    /// this to move records between data files without a decode cycle.
    pub fn append_raw(&mut self, key: Key, record_bytes: &[u8]) -> Result<(), SegmentError> {
        self.data.write_all(record_bytes)?;
        self.entries.push((key, self.offset));
        self.offset += record_bytes.len() as u64;
        Ok(())
    }

    /// Flushes and fsyncs the data file, then writes the full index under
    /// its temporary name. The returned segment is searchable but not yet
    /// visible to recovery until [`Segment::finalize`] runs.
    pub fn finish(mut self) -> Result<Segment, SegmentError> {
        // Data must be durable before any index that references it.
        self.data.flush()?;
        self.data.get_ref().sync_all()?;
        drop(self.data);

        let name = stem(self.level, self.created.0, self.created.1);
        let tmp_index_path = self.dir.join(format!("{name}.{TMP_INDEX_EXT}"));
        let index_file = File::create(&tmp_index_path)?;
        let mut writer = BufWriter::new(index_file);
        for (key, offset) in &self.entries {
            writer.write_all(&[key.len() as u8])?;
            writer.write_all(key.as_bytes())?;
            writer.write_all(&offset.to_le_bytes())?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        let data_path = self.dir.join(format!("{name}.{DATA_EXT}"));
        let data_size = self.offset;
        let data = mmap_data(&data_path)?;

        Ok(Segment {
            dir: self.dir,
            level: self.level,
            created: self.created,
            index: self.entries.into_iter().collect(),
            data,
            data_size,
            finalized: false,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Segment
// ------------------------------------------------------------------------------------------------

/// An immutable index + data file pair.
pub struct Segment {
    dir: PathBuf,
    level: usize,
    created: (u64, u32),

    /// Full key → data-file offset mapping, parsed eagerly.
    index: BTreeMap<Key, u64>,

    /// Memory-mapped data file; `None` when the segment is empty.
    data: Option<Mmap>,

    /// Data file length in bytes.
    data_size: u64,

    /// Whether the index lives under its canonical `.idx` name.
    finalized: bool,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("level", &self.level)
            .field("created", &self.created)
            .field("entries", &self.index.len())
            .field("data_size", &self.data_size)
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl Segment {
    /// Opens a finalized segment from its on-disk pair.
    ///
    /// A missing index file yields an empty segment rather than an error;
    /// a missing or empty data file is tolerated the same way (lookups
    /// simply find nothing).
    pub fn open(dir: &Path, level: usize, secs: u64, nanos: u32) -> Result<Self, SegmentError> {
        let name = stem(level, secs, nanos);
        let index_path = dir.join(format!("{name}.{INDEX_EXT}"));
        let data_path = dir.join(format!("{name}.{DATA_EXT}"));

        let index = match std::fs::read(&index_path) {
            Ok(bytes) => parse_index(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %index_path.display(), "segment index missing, treating as empty");
                BTreeMap::new()
            }
            Err(e) => return Err(SegmentError::Io(e)),
        };

        let data = mmap_data(&data_path)?;
        let data_size = data.as_ref().map_or(0, |m| m.len() as u64);

        Ok(Self {
            dir: dir.to_path_buf(),
            level,
            created: (secs, nanos),
            index,
            data,
            data_size,
            finalized: true,
        })
    }

    /// Renames the index from `.idxtmp` to its canonical `.idx` name,
    /// making the segment visible to recovery. Idempotent.
    pub fn finalize(&mut self) -> Result<(), SegmentError> {
        if self.finalized {
            return Ok(());
        }
        std::fs::rename(self.tmp_index_path(), self.index_path())?;
        self.finalized = true;
        debug!(path = %self.index_path().display(), "finalized segment");
        Ok(())
    }

    /// Looks `key` up in the cached index and decodes its record.
    pub fn search(&self, key: &[u8]) -> Result<Option<Record>, SegmentError> {
        match self.index.get(key) {
            Some(&offset) => Ok(Some(self.read_record_at(offset)?)),
            None => Ok(None),
        }
    }

    /// Decodes the record stored at `offset` in the data file.
    pub fn read_record_at(&self, offset: u64) -> Result<Record, SegmentError> {
        let data = self.data_slice(offset)?;
        let (record, _) = Record::decode(data)?;
        Ok(record)
    }

    /// The undecoded byte span of the record at `offset`, determined by
    /// walking its length fields. No decompression happens.
    pub fn raw_record_at(&self, offset: u64) -> Result<&[u8], SegmentError> {
        let data = self.data_slice(offset)?;
        let span = Record::encoded_span(data)?;
        Ok(&data[..span])
    }

    /// The segment's key → offset entries, in key order.
    pub(crate) fn index(&self) -> &BTreeMap<Key, u64> {
        &self.index
    }

    /// Number of keys in the segment.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the segment holds no keys.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Data file length in bytes; the segment's size for level thresholds.
    pub fn size_bytes(&self) -> u64 {
        self.data_size
    }

    /// The level this segment belongs to.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Creation timestamp `(secs, nanos)`; newer segments compare greater.
    pub fn created(&self) -> (u64, u32) {
        self.created
    }

    /// Canonical index path.
    pub fn index_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{INDEX_EXT}", self.stem_name()))
    }

    /// Temporary index path used before finalization.
    pub fn tmp_index_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{TMP_INDEX_EXT}", self.stem_name()))
    }

    /// Data file path.
    pub fn data_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{DATA_EXT}", self.stem_name()))
    }

    /// Removes this segment's files from disk (whichever index name is
    /// current). Used for consumed merge intermediates and aborted passes.
    pub fn remove_files(&self) -> Result<(), SegmentError> {
        let index = if self.finalized {
            self.index_path()
        } else {
            self.tmp_index_path()
        };
        for path in [index, self.data_path()] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(SegmentError::Io(e));
                }
            }
        }
        Ok(())
    }

    fn stem_name(&self) -> String {
        stem(self.level, self.created.0, self.created.1)
    }

    /// Bounds-checked view of the data file from `offset` to the end.
    fn data_slice(&self, offset: u64) -> Result<&[u8], SegmentError> {
        let data = self.data.as_deref().unwrap_or(&[]);
        if offset >= data.len() as u64 {
            return Err(SegmentError::OffsetOutOfRange {
                offset,
                len: data.len() as u64,
            });
        }
        Ok(&data[offset as usize..])
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Memory-maps a data file; a missing or zero-length file maps to `None`.
fn mmap_data(path: &Path) -> Result<Option<Mmap>, SegmentError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SegmentError::Io(e)),
    };
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    // Safe: segment data files are never written again once the writer
    // has synced them, and the mapping is read-only.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(Some(mmap))
}

/// Parses a full index file into its sorted key → offset map.
fn parse_index(bytes: &[u8]) -> Result<BTreeMap<Key, u64>, SegmentError> {
    let mut index = BTreeMap::new();
    let mut off = 0;
    while off < bytes.len() {
        let key_len = bytes[off] as usize;
        off += 1;
        if off + key_len + U64_SIZE > bytes.len() {
            return Err(SegmentError::MalformedIndex(format!(
                "entry at byte {} runs past end of file",
                off - 1
            )));
        }
        let key = Key::from(&bytes[off..off + key_len]);
        off += key_len;
        let mut offset_bytes = [0u8; U64_SIZE];
        offset_bytes.copy_from_slice(&bytes[off..off + U64_SIZE]);
        off += U64_SIZE;
        index.insert(key, u64::from_le_bytes(offset_bytes));
    }
    Ok(index)
}
