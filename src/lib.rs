//! # stratumdb
//!
//! An embeddable, persistent key-value storage engine built on a **leveled
//! Log-Structured Merge Tree (LSM-tree)**. Designed for fast writes, crash
//! safety, and automatic background flushing and compaction.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratumdb::{Db, DbConfig};
//!
//! let db = Db::open("/tmp/my_db", DbConfig::default()).unwrap();
//!
//! // Write
//! db.set(b"hello", b"world").unwrap();
//!
//! // Read
//! assert_eq!(db.get(b"hello").unwrap().value, b"world");
//!
//! // Delete — reads afterwards yield an empty value
//! db.delete(b"hello").unwrap();
//! assert!(db.get(b"hello").unwrap().value.is_empty());
//!
//! // Graceful shutdown
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Write-ahead logging** — every mutation is fsynced to the log before
//!   it becomes visible.
//! - **Skip-list memtable** — arena-backed probabilistic ordered map as the
//!   write buffer.
//! - **Leveled segments** — immutable index + data file pairs with full
//!   key→offset indexes, organized in geometrically growing tiers.
//! - **Background flush & compaction** — dedicated worker threads drain
//!   frozen memtables and merge overflowing levels.
//! - **Crash recovery** — WAL replay restores every acknowledged write.
//! - **Compressed payloads** — keys and values are gzip-compressed on disk.

#![allow(dead_code)]

pub(crate) mod compaction;
pub(crate) mod engine;
pub(crate) mod level;
pub(crate) mod memtable;
pub(crate) mod record;
pub(crate) mod segment;
pub(crate) mod wal;

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Sender, tick, unbounded};
use crossbeam::select;
use thiserror::Error;
use tracing::{debug, error, info};

use engine::{Engine, EngineConfig, EngineError};
pub use engine::{EngineStats, LevelStats};
pub use record::{Key, MAX_KEY_LEN, MAX_VALUE_LEN, Record};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
///
/// All fields have defaults mirroring the reference deployment via
/// [`DbConfig::default()`]; everything is validated by [`Db::open`].
///
/// # Example
///
/// ```rust
/// use stratumdb::DbConfig;
///
/// let config = DbConfig {
///     write_buffer_size: 64 * 1024,
///     ..DbConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Maximum tracked size of the in-memory write buffer in bytes. When
    /// crossed, the memtable rotates and a background flush is scheduled.
    ///
    /// Default: 4 KiB. Must be ≥ 1024.
    pub write_buffer_size: usize,

    /// Files allowed at level 0 before compaction merges the level.
    ///
    /// Default: 5. Must be ≥ 1.
    pub level0_file_count: usize,

    /// Bytes allowed per file at level 0; each deeper level multiplies
    /// this by `level_multiplier`.
    ///
    /// Default: 4 KiB. Must be ≥ 1024.
    pub level0_file_size: u64,

    /// Growth factor applied per level to both the file-count and
    /// file-size allowances.
    ///
    /// Default: 2. Must be ≥ 1.
    pub level_multiplier: u64,

    /// Number of levels in the hierarchy. The top level never compacts.
    ///
    /// Default: 5. Must be ≥ 2.
    pub max_levels: usize,

    /// Active WAL size that forces a rotation even below the write-buffer
    /// threshold, bounding log growth.
    ///
    /// Default: 1 MiB. Must be ≥ 1024.
    pub wal_max_bytes: u64,

    /// Period of the background compaction timer.
    ///
    /// Default: 500 ms. Must be non-zero.
    pub compaction_interval: Duration,

    /// Period of the flusher's retry tick, which re-attempts failed
    /// flushes even when no new rotation arrives.
    ///
    /// Default: 1 s. Must be non-zero.
    pub flush_retry_interval: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 4 * 1024,
            level0_file_count: 5,
            level0_file_size: 4 * 1024,
            level_multiplier: 2,
            max_levels: 5,
            wal_max_bytes: 1024 * 1024,
            compaction_interval: Duration::from_millis(500),
            flush_retry_interval: Duration::from_secs(1),
        }
    }
}

impl DbConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), DbError> {
        if self.write_buffer_size < 1024 {
            return Err(DbError::InvalidConfig(
                "write_buffer_size must be >= 1024".into(),
            ));
        }
        if self.level0_file_count < 1 {
            return Err(DbError::InvalidConfig(
                "level0_file_count must be >= 1".into(),
            ));
        }
        if self.level0_file_size < 1024 {
            return Err(DbError::InvalidConfig(
                "level0_file_size must be >= 1024".into(),
            ));
        }
        if self.level_multiplier < 1 {
            return Err(DbError::InvalidConfig(
                "level_multiplier must be >= 1".into(),
            ));
        }
        if self.max_levels < 2 {
            return Err(DbError::InvalidConfig("max_levels must be >= 2".into()));
        }
        if self.wal_max_bytes < 1024 {
            return Err(DbError::InvalidConfig(
                "wal_max_bytes must be >= 1024".into(),
            ));
        }
        if self.compaction_interval.is_zero() {
            return Err(DbError::InvalidConfig(
                "compaction_interval must be non-zero".into(),
            ));
        }
        if self.flush_retry_interval.is_zero() {
            return Err(DbError::InvalidConfig(
                "flush_retry_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            write_buffer_size: self.write_buffer_size,
            level0_file_count: self.level0_file_count,
            level0_file_size: self.level0_file_size,
            level_multiplier: self.level_multiplier,
            max_levels: self.max_levels,
            wal_max_bytes: self.wal_max_bytes,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// An engine error occurred (validation, codec, I/O, ...).
    #[error("{0}")]
    Engine(#[from] EngineError),
}

// ------------------------------------------------------------------------------------------------
// Storage capability
// ------------------------------------------------------------------------------------------------

/// The engine's three-operation storage contract.
///
/// The network-facing layer programs against this trait alone; it never
/// interprets storage-level file formats.
pub trait KvStorage {
    /// Retrieves the newest record for `key`. An absent or deleted key
    /// yields a record with an empty value.
    fn get(&self, key: &[u8]) -> Result<Record, DbError>;

    /// Stores `value` under `key`, returning the stored record.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<Record, DbError>;

    /// Deletes `key` by storing an empty-value tombstone, returning it.
    fn delete(&self, key: &[u8]) -> Result<Record, DbError>;
}

// ------------------------------------------------------------------------------------------------
// Background workers
// ------------------------------------------------------------------------------------------------

/// Channel ends and join handles for the two worker threads.
/// Taken (`Option::take`) on shutdown to ensure single cleanup.
struct Background {
    flush_tx: Sender<()>,
    stop_tx: Sender<()>,
    flusher: thread::JoinHandle<()>,
    compactor: thread::JoinHandle<()>,
}

/// Flushes until the frozen queue is empty. Errors are logged and left
/// for the next trigger — a failed generation stays queued.
fn drain_flush(engine: &Engine) {
    loop {
        match engine.flush_oldest_frozen() {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) => {
                error!("background flush failed: {e}");
                break;
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The main database handle.
///
/// Thread-safe: share it across threads via `Arc<Db>`. Implements
/// [`KvStorage`] — the exact contract the out-of-scope network layer
/// consumes.
///
/// # Background work
///
/// Two dedicated threads run for the lifetime of the handle:
///
/// - the **flusher** drains frozen memtables (oldest first) into level-0
///   segments whenever a rotation signals it, retrying failures on a
///   periodic tick;
/// - the **compactor** wakes on a fixed period and merges every level
///   that exceeds its thresholds, cascading upward.
///
/// # Shutdown
///
/// [`Db::close`] signals both workers, waits for their current pass to
/// finish, flushes whatever remains frozen, and fsyncs directories. A
/// handle dropped without `close` attempts the same cleanup, ignoring
/// errors.
pub struct Db {
    engine: Engine,
    bg: Mutex<Option<Background>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) a database at the given directory.
    ///
    /// Recovery runs before the handle is returned: orphaned segment files
    /// are removed and all WAL files are replayed. If recovery left a
    /// frozen memtable behind, a flush is scheduled immediately.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidConfig`] if any parameter is out of range.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;

        let engine = Engine::open(&path, config.to_engine_config())?;

        // Flusher: woken by rotation signals, with a retry tick so a
        // failed flush is re-attempted even in a quiet database.
        let (flush_tx, flush_rx) = unbounded::<()>();
        let flush_retry = config.flush_retry_interval;
        let flusher = {
            let engine = engine.clone();
            thread::Builder::new()
                .name("stratumdb-flush".into())
                .spawn(move || {
                    let retry = tick(flush_retry);
                    loop {
                        select! {
                            recv(flush_rx) -> msg => match msg {
                                Ok(()) => drain_flush(&engine),
                                Err(_) => {
                                    // Sender dropped: final drain, then exit.
                                    drain_flush(&engine);
                                    break;
                                }
                            },
                            recv(retry) -> _ => {
                                if engine.has_pending_frozen().unwrap_or(false) {
                                    drain_flush(&engine);
                                }
                            }
                        }
                    }
                    debug!("flusher exiting");
                })
                .map_err(|e| EngineError::Internal(format!("failed to spawn flusher: {e}")))?
        };

        // Compactor: fixed-period timer; the engine's internal guard makes
        // overlapping triggers a no-op.
        let (stop_tx, stop_rx) = unbounded::<()>();
        let interval = config.compaction_interval;
        let compactor = {
            let engine = engine.clone();
            thread::Builder::new()
                .name("stratumdb-compact".into())
                .spawn(move || {
                    let timer = tick(interval);
                    loop {
                        select! {
                            recv(stop_rx) -> _ => break, // sender dropped or signalled
                            recv(timer) -> _ => {
                                match engine.compact_once() {
                                    Ok(true) => debug!("background compaction pass completed"),
                                    Ok(false) => {}
                                    Err(e) => error!("background compaction failed: {e}"),
                                }
                            }
                        }
                    }
                    debug!("compactor exiting");
                })
                .map_err(|e| EngineError::Internal(format!("failed to spawn compactor: {e}")))?
        };

        let db = Self {
            engine,
            bg: Mutex::new(Some(Background {
                flush_tx,
                stop_tx,
                flusher,
                compactor,
            })),
            closed: AtomicBool::new(false),
        };

        // Recovery may have rotated a full buffer; persist it promptly.
        if db.engine.has_pending_frozen()? {
            db.signal_flush();
        }

        info!(path = %path.as_ref().display(), "database opened");
        Ok(db)
    }

    /// Gracefully shuts down the database.
    ///
    /// Stops both background workers after their current pass, flushes
    /// all remaining frozen memtables, and fsyncs the data directories.
    /// Subsequent operations return [`DbError::Closed`]; calling `close`
    /// again is harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown_workers();
        self.engine.close()?;

        info!("database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Operations
    // --------------------------------------------------------------------------------------------

    /// See [`KvStorage::get`].
    pub fn get(&self, key: &[u8]) -> Result<Record, DbError> {
        self.check_open()?;
        Ok(self.engine.get(key)?)
    }

    /// See [`KvStorage::set`].
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<Record, DbError> {
        self.check_open()?;
        let (record, rotated) = self.engine.set(key, value)?;
        if rotated {
            self.signal_flush();
        }
        Ok(record)
    }

    /// See [`KvStorage::delete`].
    pub fn delete(&self, key: &[u8]) -> Result<Record, DbError> {
        self.check_open()?;
        let (record, rotated) = self.engine.delete(key)?;
        if rotated {
            self.signal_flush();
        }
        Ok(record)
    }

    /// Triggers a compaction pass immediately, returning whether any
    /// level was merged. A pass already running makes this a no-op.
    pub fn compact(&self) -> Result<bool, DbError> {
        self.check_open()?;
        Ok(self.engine.compact_once()?)
    }

    /// A point-in-time snapshot of queue depth and level occupancy.
    pub fn stats(&self) -> Result<EngineStats, DbError> {
        self.check_open()?;
        Ok(self.engine.stats()?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(DbError::Closed)` if the database has been closed.
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    /// Wakes the flusher. Send failure means shutdown is in progress; the
    /// closing path drains the queue itself.
    fn signal_flush(&self) {
        if let Ok(guard) = self.bg.lock() {
            if let Some(bg) = guard.as_ref() {
                let _ = bg.flush_tx.send(());
            }
        }
    }

    /// Signals both workers and joins them.
    fn shutdown_workers(&self) {
        let taken = match self.bg.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(bg) = taken {
            // Dropping the senders ends both select loops; the flusher
            // drains the frozen queue on its way out.
            drop(bg.flush_tx);
            drop(bg.stop_tx);
            let _ = bg.flusher.join();
            let _ = bg.compactor.join();
        }
    }
}

impl KvStorage for Db {
    fn get(&self, key: &[u8]) -> Result<Record, DbError> {
        Db::get(self, key)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<Record, DbError> {
        Db::set(self, key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<Record, DbError> {
        Db::delete(self, key)
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.shutdown_workers();
            let _ = self.engine.close();
        }
    }
}
