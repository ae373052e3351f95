//! # Engine Module
//!
//! The LSM engine core: coordinates the active memtable, the write-ahead
//! log, the frozen-memtable queue, the level hierarchy, and recovery.
//!
//! ## Write path
//!
//! `set`/`delete` encode a [`Record`], append it to the WAL (fsync), then
//! insert it into the active skip list — all under the engine write lock,
//! so the WAL append happens-before the write becomes visible to any
//! reader. When the active memtable's tracked size crosses the buffer
//! threshold (or the WAL outgrows its size bound), the memtable is swapped
//! for an empty one, the old one joins the frozen queue together with the
//! WAL files backing it, and the caller is told to wake the flusher.
//!
//! ## Read path
//!
//! `get` probes the active memtable, then frozen memtables newest first,
//! then levels 0..N with each level's newest segment first. The first hit
//! wins — **including an explicitly stored empty value**, which is how a
//! delete masks older on-disk versions. Only the in-memory probes and the
//! snapshot of segment handles happen under the shared lock; segment I/O
//! runs lock-free against immutable files, skipping any segment the
//! deletion registry has condemned.
//!
//! ## Recovery
//!
//! On open: orphaned `.idxtmp`/`.dat` leftovers are removed, finalized
//! segments are loaded into their levels, and every WAL file is replayed
//! oldest-to-newest through the normal insert path — without re-appending
//! to the WAL. Replayed files are retired only after the generation
//! holding their records is flushed to a segment.
//!
//! ## Background entry points
//!
//! [`Engine::flush_oldest_frozen`] and [`Engine::compact_once`] are called
//! by the dedicated worker threads owned by [`Db`](crate::Db); the engine
//! itself never spawns threads. Compaction carries an atomic re-entrancy
//! guard, so overlapping triggers collapse into one pass.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compaction::{self, CompactionError, DeletionRegistry};
use crate::level::{Level, LevelThresholds};
use crate::memtable::SkipList;
use crate::record::{CodecError, Key, MAX_KEY_LEN, MAX_VALUE_LEN, Record};
use crate::segment::{self, Segment, SegmentError, SegmentWriter};
use crate::wal::{self, Wal, WalError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Sub-directory of the data directory holding segment files.
pub const SEGMENT_DIR: &str = "segments";

/// Sub-directory of the data directory holding WAL files.
pub const WAL_DIR: &str = "wal";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An oversized or empty key/value was rejected. Nothing was mutated.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Corrupt or truncated serialized bytes on a read path.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Error originating from the write-ahead log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error originating from the segment subsystem.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Error originating from a compaction pass.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`Engine`] instance.
///
/// Defaults mirror the reference deployment values; everything is
/// overridable through [`DbConfig`](crate::DbConfig).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max tracked memtable size (bytes) before rotation.
    pub write_buffer_size: usize,

    /// Files allowed at level 0 before compaction.
    pub level0_file_count: usize,

    /// Bytes allowed per file at level 0.
    pub level0_file_size: u64,

    /// Growth factor applied per level to both file count and file size.
    pub level_multiplier: u64,

    /// Number of levels in the hierarchy. The top level never compacts.
    pub max_levels: usize,

    /// Active WAL size (bytes) that forces a rotation even below the
    /// write-buffer threshold, bounding log growth.
    pub wal_max_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 4 * 1024,
            level0_file_count: 5,
            level0_file_size: 4 * 1024,
            level_multiplier: 2,
            max_levels: 5,
            wal_max_bytes: 1024 * 1024,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Snapshot of engine state returned by [`Engine::stats`].
#[derive(Debug)]
pub struct EngineStats {
    /// Number of frozen memtables pending flush.
    pub frozen_count: usize,

    /// Per-level segment statistics, level 0 first.
    pub levels: Vec<LevelStats>,
}

/// Statistics for one level.
#[derive(Debug)]
pub struct LevelStats {
    /// Level index.
    pub level: usize,

    /// Number of segments in the level.
    pub file_count: usize,

    /// Sum of the level's segment data sizes in bytes.
    pub total_bytes: u64,
}

// ------------------------------------------------------------------------------------------------
// Internal state
// ------------------------------------------------------------------------------------------------

/// A rotated-out memtable waiting for the flusher, together with the WAL
/// files whose records it holds. The files are deleted only after the
/// flush durably lands in a level-0 segment.
struct FrozenMemtable {
    list: Arc<SkipList>,
    wal_paths: Vec<PathBuf>,
}

/// All mutable engine state, guarded by one `RwLock`.
struct EngineInner {
    /// The active write buffer. Mutated only under the write lock.
    active: SkipList,

    /// WAL receiving the active memtable's appends.
    active_wal: Wal,

    /// WAL files backing the **current** generation — normally just the
    /// active file, plus all pre-existing files right after recovery.
    carried_wals: Vec<PathBuf>,

    /// Frozen memtables in rotation order; front is oldest.
    frozen: VecDeque<FrozenMemtable>,

    /// The segment hierarchy, level 0 first.
    levels: Vec<Level>,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// The LSM storage engine handle.
///
/// Cheap to clone; all clones share the same state. Exposes the three-way
/// contract — `get`, `set`, `delete` — plus the background entry points
/// the worker threads drive.
pub struct Engine {
    inner: Arc<RwLock<EngineInner>>,
    registry: Arc<DeletionRegistry>,
    compacting: Arc<AtomicBool>,
    config: Arc<EngineConfig>,
    thresholds: LevelThresholds,
    segment_dir: PathBuf,
    wal_dir: PathBuf,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            registry: Arc::clone(&self.registry),
            compacting: Arc::clone(&self.compacting),
            config: Arc::clone(&self.config),
            thresholds: self.thresholds,
            segment_dir: self.segment_dir.clone(),
            wal_dir: self.wal_dir.clone(),
        }
    }
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    /// Acquires a shared lock on the engine state.
    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, EngineInner>, EngineError> {
        self.inner
            .read()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    /// Acquires an exclusive lock on the engine state.
    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, EngineInner>, EngineError> {
        self.inner
            .write()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens (or creates) an engine rooted at the given data directory.
    ///
    /// On a fresh directory the segment and WAL sub-directories are
    /// created. On an existing directory, recovery runs: orphaned segment
    /// files are removed, finalized segments are loaded, and all WAL files
    /// are replayed oldest-to-newest.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let base = path.as_ref();
        let segment_dir = base.join(SEGMENT_DIR);
        let wal_dir = base.join(WAL_DIR);
        fs::create_dir_all(&segment_dir)?;
        fs::create_dir_all(&wal_dir)?;

        // 1. Remove leftovers of interrupted flushes and merges. Safe here:
        //    no background threads exist yet.
        Self::remove_orphans(&segment_dir)?;

        // 2. Discover finalized segments and slot them into their levels,
        //    newest first within each level.
        let mut levels: Vec<Level> = (0..config.max_levels).map(Level::new).collect();
        for entry in fs::read_dir(&segment_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(segment::INDEX_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((level, secs, nanos)) = segment::parse_stem(stem) else {
                warn!(path = %path.display(), "ignoring unrecognized segment file");
                continue;
            };
            let segment = Segment::open(&segment_dir, level, secs, nanos)?;
            let slot = level.min(config.max_levels - 1);
            levels[slot].insert(Arc::new(segment));
        }

        // 3. Replay WAL files oldest → newest through the normal insert
        //    path, without re-appending. A file that stops decoding
        //    contributes its decodable prefix.
        let wal_files = wal::list_files(&wal_dir)?;
        let mut active = SkipList::new();
        let mut replayed = 0usize;
        for file in &wal_files {
            match wal::replay(file) {
                Ok(iter) => {
                    for item in iter {
                        match item {
                            Ok(record) => {
                                active.put(record);
                                replayed += 1;
                            }
                            Err(e) => {
                                warn!(
                                    path = %file.display(),
                                    "stopping WAL replay on undecodable frame: {e}"
                                );
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %file.display(), "cannot open WAL for replay: {e}");
                }
            }
        }

        // 4. Fresh WAL for new writes. The replayed files stay attached to
        //    this generation and are deleted once it flushes.
        let active_wal = Wal::create(&wal_dir)?;
        let mut carried_wals = wal_files;
        carried_wals.push(active_wal.path().to_path_buf());

        let mut inner = EngineInner {
            active,
            active_wal,
            carried_wals,
            frozen: VecDeque::new(),
            levels,
        };

        // 5. If replay refilled a whole buffer, rotate now so the flusher
        //    persists the recovered state promptly.
        if inner.active.approximate_size() >= config.write_buffer_size {
            Self::rotate(&mut inner, &wal_dir)?;
        }

        info!(
            path = %base.display(),
            replayed_records = replayed,
            "engine opened"
        );

        let thresholds = LevelThresholds::new(
            config.level0_file_count,
            config.level0_file_size,
            config.level_multiplier,
        );

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
            registry: Arc::new(DeletionRegistry::new()),
            compacting: Arc::new(AtomicBool::new(false)),
            config: Arc::new(config),
            thresholds,
            segment_dir,
            wal_dir,
        })
    }

    /// Gracefully shuts the engine down: every frozen memtable is flushed
    /// to a level-0 segment, then the directories are fsynced. The active
    /// memtable's contents survive in its WAL and are replayed on the next
    /// open.
    pub fn close(&self) -> Result<(), EngineError> {
        while self.flush_oldest_frozen()? {}

        for dir in [&self.segment_dir, &self.wal_dir] {
            if let Ok(handle) = fs::File::open(dir) {
                handle.sync_all()?;
            }
        }
        info!("engine closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Public contract: get / set / delete
    // --------------------------------------------------------------------------------------------

    /// Retrieves the newest record for `key`.
    ///
    /// An absent key yields a record with an empty value and timestamp 0;
    /// a deleted key yields its tombstone (empty value, deletion time).
    pub fn get(&self, key: &[u8]) -> Result<Record, EngineError> {
        Self::validate_key(key)?;

        // Probe the in-memory layers and snapshot segment handles under
        // the shared lock; segment I/O runs after release.
        let snapshot: Vec<Arc<Segment>> = {
            let guard = self.read_lock()?;
            if let Some(record) = guard.active.get(key) {
                return Ok(record.clone());
            }
            for generation in guard.frozen.iter().rev() {
                if let Some(record) = generation.list.get(key) {
                    return Ok(record.clone());
                }
            }
            guard
                .levels
                .iter()
                .flat_map(|level| level.segments().iter().cloned())
                .collect()
        };

        for segment in snapshot {
            if self.registry.is_marked(&segment.index_path()) {
                continue;
            }
            if let Some(record) = segment.search(key)? {
                return Ok(record);
            }
        }
        Ok(Record::absent(Key::from(key)))
    }

    /// Stores `value` under `key`.
    ///
    /// Returns the stored record plus `true` when the write rotated the
    /// memtable — the caller should wake the flusher.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(Record, bool), EngineError> {
        Self::validate_key(key)?;
        Self::validate_value(value)?;

        let record = Record::new(Key::from(key), value.to_vec());
        let rotated = self.apply(record.clone())?;
        Ok((record, rotated))
    }

    /// Deletes `key` by storing an empty-value record with a fresh
    /// timestamp. Same rotation contract as [`Engine::set`].
    pub fn delete(&self, key: &[u8]) -> Result<(Record, bool), EngineError> {
        Self::validate_key(key)?;

        let record = Record::new(Key::from(key), Vec::new());
        let rotated = self.apply(record.clone())?;
        Ok((record, rotated))
    }

    /// WAL-appends and inserts one record, rotating if a threshold is
    /// crossed. The write lock spans the whole sequence, so the append
    /// happens-before visibility and rotation is atomic w.r.t. writers.
    fn apply(&self, record: Record) -> Result<bool, EngineError> {
        let bytes = record.encode()?;

        let mut guard = self.write_lock()?;
        guard.active_wal.append(&bytes)?;
        guard.active.put(record);

        let over_buffer = guard.active.approximate_size() >= self.config.write_buffer_size;
        let over_wal = guard.active_wal.size() >= self.config.wal_max_bytes;
        if over_buffer || over_wal {
            Self::rotate(&mut guard, &self.wal_dir)?;
            return Ok(true);
        }
        Ok(false)
    }

    // --------------------------------------------------------------------------------------------
    // Rotation
    // --------------------------------------------------------------------------------------------

    /// Swaps in an empty memtable + fresh WAL and queues the old pair for
    /// the flusher. The replacement WAL is created first so a failure
    /// leaves the current generation untouched.
    fn rotate(inner: &mut EngineInner, wal_dir: &Path) -> Result<(), EngineError> {
        let new_wal = Wal::create(wal_dir)?;
        let new_carried = vec![new_wal.path().to_path_buf()];

        let old_wal = std::mem::replace(&mut inner.active_wal, new_wal);
        drop(old_wal); // closes with a final sync

        let old_list = std::mem::take(&mut inner.active);
        let wal_paths = std::mem::replace(&mut inner.carried_wals, new_carried);
        inner.frozen.push_back(FrozenMemtable {
            list: Arc::new(old_list),
            wal_paths,
        });

        debug!(frozen = inner.frozen.len(), "rotated memtable");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Whether any frozen memtable awaits flushing.
    pub fn has_pending_frozen(&self) -> Result<bool, EngineError> {
        Ok(!self.read_lock()?.frozen.is_empty())
    }

    /// Flushes the oldest frozen memtable to a level-0 segment.
    ///
    /// Returns `Ok(false)` when the queue is empty. On failure the
    /// memtable stays queued — acknowledged writes are never discarded —
    /// and the flusher retries on its next trigger. Retired WAL files are
    /// deleted only after the segment is finalized.
    pub fn flush_oldest_frozen(&self) -> Result<bool, EngineError> {
        // Snapshot the oldest generation; the single flusher thread is the
        // only caller that ever pops.
        let generation = {
            let guard = self.read_lock()?;
            match guard.frozen.front() {
                Some(generation) => FrozenMemtable {
                    list: Arc::clone(&generation.list),
                    wal_paths: generation.wal_paths.clone(),
                },
                None => return Ok(false),
            }
        };

        if !generation.list.is_empty() {
            let mut writer = SegmentWriter::create(&self.segment_dir, 0)?;
            for record in generation.list.iter() {
                writer.append_record(record)?;
            }
            let mut segment = writer.finish()?;
            segment.finalize()?;
            let segment = Arc::new(segment);

            {
                let mut guard = self.write_lock()?;
                guard.frozen.pop_front();
                guard.levels[0].insert(Arc::clone(&segment));
            }
            info!(
                entries = segment.len(),
                bytes = segment.size_bytes(),
                "flushed frozen memtable to level 0"
            );
        } else {
            self.write_lock()?.frozen.pop_front();
        }

        // Records are durable in the segment; the backing log can go.
        for path in &generation.wal_paths {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "retired WAL file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "failed to retire WAL file: {e}"),
            }
        }
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Runs one compaction pass over the level hierarchy.
    ///
    /// A concurrent trigger while a pass is active is a no-op (`Ok(false)`).
    /// Each level whose thresholds are exceeded is merged wholesale into
    /// the next level; a level that overflows *because* of the pass is
    /// compacted in the same pass (cascade). Returns `true` if any level
    /// was compacted.
    pub fn compact_once(&self) -> Result<bool, EngineError> {
        if self
            .compacting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        let result = self.run_compaction_pass();
        self.compacting.store(false, Ordering::Release);
        result
    }

    fn run_compaction_pass(&self) -> Result<bool, EngineError> {
        let mut did_work = false;

        // Bottom-up; overflow created at level L+1 is handled when the
        // walk reaches it. The top level has no destination and never
        // compacts.
        for level_idx in 0..self.config.max_levels.saturating_sub(1) {
            loop {
                let sources: Vec<Arc<Segment>> = {
                    let guard = self.read_lock()?;
                    if !guard.levels[level_idx].needs_compaction(&self.thresholds) {
                        break;
                    }
                    guard.levels[level_idx].segments().to_vec()
                };
                if sources.is_empty() {
                    break;
                }

                // The heavy merge runs without the lock; sources are
                // immutable and still referenced by the levels.
                let mut merged =
                    compaction::merge_level(&sources, &self.segment_dir, level_idx + 1)?;
                merged.finalize()?;
                let merged = Arc::new(merged);

                {
                    let mut guard = self.write_lock()?;
                    guard.levels[level_idx].remove(&sources);
                    guard.levels[level_idx + 1].insert(Arc::clone(&merged));
                }

                // Mark first so racing readers skip the condemned files,
                // then delete and clear the marks.
                self.registry.mark(sources.iter().map(|s| s.index_path()));
                for source in &sources {
                    if let Err(e) = source.remove_files() {
                        warn!("failed to delete compacted segment: {e}");
                    }
                    self.registry.unmark(&source.index_path());
                }

                info!(
                    level = level_idx,
                    consumed = sources.len(),
                    produced_bytes = merged.size_bytes(),
                    "compacted level into next tier"
                );
                did_work = true;
            }
        }
        Ok(did_work)
    }

    // --------------------------------------------------------------------------------------------
    // Statistics
    // --------------------------------------------------------------------------------------------

    /// A point-in-time snapshot of queue depth and level occupancy.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let guard = self.read_lock()?;
        Ok(EngineStats {
            frozen_count: guard.frozen.len(),
            levels: guard
                .levels
                .iter()
                .map(|level| LevelStats {
                    level: level.index(),
                    file_count: level.file_count(),
                    total_bytes: level.total_bytes(),
                })
                .collect(),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Validation
    // --------------------------------------------------------------------------------------------

    fn validate_key(key: &[u8]) -> Result<(), EngineError> {
        if key.is_empty() {
            return Err(EngineError::Validation("key must not be empty".into()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(EngineError::Validation(format!(
                "key length {} exceeds the {MAX_KEY_LEN}-byte limit",
                key.len()
            )));
        }
        Ok(())
    }

    fn validate_value(value: &[u8]) -> Result<(), EngineError> {
        if value.len() > MAX_VALUE_LEN {
            return Err(EngineError::Validation(format!(
                "value length {} exceeds the {MAX_VALUE_LEN}-byte limit",
                value.len()
            )));
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Recovery helpers
    // --------------------------------------------------------------------------------------------

    /// Deletes `.idxtmp` files and data files lacking a finalized index —
    /// leftovers of flushes or merges interrupted mid-write.
    fn remove_orphans(segment_dir: &Path) -> Result<(), EngineError> {
        let mut finalized_stems: Vec<String> = Vec::new();
        let mut candidates: Vec<PathBuf> = Vec::new();

        for entry in fs::read_dir(segment_dir)? {
            let entry = entry?;
            let path = entry.path();
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|e| e.to_str()),
            ) else {
                continue;
            };
            match ext {
                segment::INDEX_EXT => finalized_stems.push(stem.to_string()),
                segment::TMP_INDEX_EXT | segment::DATA_EXT => candidates.push(path.clone()),
                _ => {}
            }
        }

        for path in candidates {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let is_tmp = path.extension().and_then(|e| e.to_str()) == Some(segment::TMP_INDEX_EXT);
            if is_tmp || !finalized_stems.iter().any(|s| s == stem) {
                warn!(path = %path.display(), "removing orphaned segment file");
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
