//! # Compaction Module
//!
//! Merge machinery for the level hierarchy: when a level exceeds its
//! thresholds, all of its segments are merged into a single larger segment
//! at the next level, and consumed files are retired through a shared
//! deletion registry that readers consult before touching a segment.
//!
//! ## Merge algorithm
//!
//! Segments merge pairwise through a **balanced binary merge tree**: the
//! newest-first segment list is split in half, each half merges
//! recursively (a single segment needs no merge), and the two results
//! merge last. A two-segment merge parses both indexes into one combined
//! sorted map, inserting the *older* segment's entries first and the
//! *newer* segment's second, so a key collision resolves to the newer
//! offset — last-write-wins by **segment recency**, not by embedded record
//! timestamp. Surviving records are copied between data files as raw
//! bytes, never re-encoded.
//!
//! Intermediate tree outputs are ordinary next-level segments that are
//! deleted as soon as the parent merge consumes them. Every output keeps
//! its index under the temporary `.idxtmp` name; only the pass's final
//! segment is renamed to `.idx`, and only after the whole level has been
//! reduced.
//!
//! ## Failure semantics
//!
//! An I/O error aborts the pass with source segments untouched — nothing
//! was renamed and nothing is deleted, so the next scheduled pass retries
//! from clean state. Temporary files leaked by an aborted pass carry the
//! `.idxtmp` extension and are removed by startup recovery.
//!
//! ## Deletion registry
//!
//! Between "segment consumed" and "file unlinked" there is a window where
//! a reader holding an older view could open a stale segment. The
//! [`DeletionRegistry`] closes it: the compactor marks consumed index
//! paths before deleting, and every reader checks the registry before
//! searching a segment.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::record::Key;
use crate::segment::{Segment, SegmentError, SegmentWriter};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors produced while merging segments.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Segment read/write failure.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// DeletionRegistry
// ------------------------------------------------------------------------------------------------

/// Shared set of segment index paths that are condemned but may still
/// exist on disk.
///
/// The compactor marks paths after swapping a level's contents and before
/// unlinking files; readers skip any segment whose index path is marked.
#[derive(Debug, Default)]
pub struct DeletionRegistry {
    marked: Mutex<HashSet<PathBuf>>,
}

impl DeletionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Condemns a batch of index paths.
    pub fn mark(&self, paths: impl IntoIterator<Item = PathBuf>) {
        let mut guard = self.lock();
        guard.extend(paths);
    }

    /// Whether a path is condemned. Readers call this before searching a
    /// segment.
    pub fn is_marked(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    /// Clears one path, after its file is gone.
    pub fn unmark(&self, path: &Path) {
        self.lock().remove(path);
    }

    /// Number of condemned paths still registered.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no paths are condemned.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        // The registry holds no invariants that a panic could tear; a
        // poisoned lock still guards a usable set.
        self.marked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ------------------------------------------------------------------------------------------------
// Pairwise merge
// ------------------------------------------------------------------------------------------------

/// Where a surviving index entry's bytes come from.
#[derive(Clone, Copy)]
enum Source {
    Older,
    Newer,
}

/// Merges two segments into a new unfinalized segment at `target_level`.
///
/// `older` and `newer` are ranked by segment recency; on key collision the
/// newer segment's record survives.
fn merge_pair(
    older: &Segment,
    newer: &Segment,
    dir: &Path,
    target_level: usize,
) -> Result<Segment, CompactionError> {
    let mut combined: BTreeMap<Key, (Source, u64)> = BTreeMap::new();
    for (key, &offset) in older.index() {
        combined.insert(key.clone(), (Source::Older, offset));
    }
    for (key, &offset) in newer.index() {
        combined.insert(key.clone(), (Source::Newer, offset));
    }

    let mut writer = SegmentWriter::create(dir, target_level)?;
    for (key, (source, offset)) in combined {
        let from = match source {
            Source::Older => older,
            Source::Newer => newer,
        };
        let raw = from.raw_record_at(offset)?;
        writer.append_raw(key, raw)?;
    }
    Ok(writer.finish()?)
}

/// Copies a single segment's contents into a new unfinalized segment at
/// `target_level`. Used when a one-segment level exceeds its byte
/// allowance and must still promote upward.
fn promote_single(
    segment: &Segment,
    dir: &Path,
    target_level: usize,
) -> Result<Segment, CompactionError> {
    let mut writer = SegmentWriter::create(dir, target_level)?;
    for (key, &offset) in segment.index() {
        let raw = segment.raw_record_at(offset)?;
        writer.append_raw(key.clone(), raw)?;
    }
    Ok(writer.finish()?)
}

// ------------------------------------------------------------------------------------------------
// Merge tree
// ------------------------------------------------------------------------------------------------

/// A node of the in-flight merge tree: either one of the original source
/// segments or an owned intermediate output.
enum MergeOut {
    Leaf(Arc<Segment>),
    Merged(Segment),
}

impl MergeOut {
    fn segment(&self) -> &Segment {
        match self {
            Self::Leaf(segment) => segment,
            Self::Merged(segment) => segment,
        }
    }

    /// Deletes an intermediate's files; original source segments are left
    /// for the caller to retire through the deletion registry.
    fn discard_if_intermediate(self) {
        if let Self::Merged(segment) = self {
            if let Err(e) = segment.remove_files() {
                warn!("failed to remove merge intermediate: {e}");
            }
        }
    }
}

/// Recursively merges a newest-first slice of segments.
fn merge_range(
    segments: &[Arc<Segment>],
    dir: &Path,
    target_level: usize,
) -> Result<MergeOut, CompactionError> {
    if segments.len() == 1 {
        return Ok(MergeOut::Leaf(Arc::clone(&segments[0])));
    }

    // The list is newest first, so the front half is the newer half.
    let mid = segments.len() / 2;
    let newer = merge_range(&segments[..mid], dir, target_level)?;
    let older = merge_range(&segments[mid..], dir, target_level)?;

    let merged = merge_pair(older.segment(), newer.segment(), dir, target_level)?;
    older.discard_if_intermediate();
    newer.discard_if_intermediate();
    Ok(MergeOut::Merged(merged))
}

/// Merges all of a level's segments (newest first) into one **unfinalized**
/// segment at `target_level`. The caller finalizes it after swapping level
/// contents, then retires the sources.
pub fn merge_level(
    segments: &[Arc<Segment>],
    dir: &Path,
    target_level: usize,
) -> Result<Segment, CompactionError> {
    debug_assert!(!segments.is_empty());
    debug!(
        source_count = segments.len(),
        target_level, "merging level into next tier"
    );

    match merge_range(segments, dir, target_level)? {
        MergeOut::Merged(segment) => Ok(segment),
        MergeOut::Leaf(single) => promote_single(&single, dir, target_level),
    }
}
