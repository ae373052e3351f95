//! # Level Module
//!
//! Bookkeeping for one tier of the segment hierarchy: an ordered list of
//! segments (newest first) plus the geometric size/count thresholds that
//! decide when a tier must compact into the next one.
//!
//! Level 0 receives memtable flushes and allows a fixed file count of a
//! fixed file size; each subsequent level multiplies both the allowed file
//! count and the allowed file size by a configurable factor, so capacity
//! grows geometrically with depth. A level needs compaction when its file
//! count **or** its total byte size exceeds the allowance.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::Arc;

use crate::segment::Segment;

// ------------------------------------------------------------------------------------------------
// Thresholds
// ------------------------------------------------------------------------------------------------

/// Per-level capacity rules.
///
/// Level `L` allows `level0_file_count × multiplier^L` files of
/// `level0_file_size × multiplier^L` bytes each; the byte allowance is the
/// product of the two.
#[derive(Debug, Clone, Copy)]
pub struct LevelThresholds {
    /// Files allowed at level 0.
    level0_file_count: usize,

    /// Bytes allowed per file at level 0.
    level0_file_size: u64,

    /// Growth factor applied per level to both dimensions.
    multiplier: u64,
}

impl LevelThresholds {
    /// Creates the threshold table from the level-0 base values.
    pub fn new(level0_file_count: usize, level0_file_size: u64, multiplier: u64) -> Self {
        Self {
            level0_file_count,
            level0_file_size,
            multiplier,
        }
    }

    /// Files allowed at `level`.
    pub fn max_files(&self, level: usize) -> usize {
        let factor = self.multiplier.saturating_pow(level as u32);
        (self.level0_file_count as u64).saturating_mul(factor) as usize
    }

    /// Bytes allowed per file at `level`.
    pub fn max_file_size(&self, level: usize) -> u64 {
        let factor = self.multiplier.saturating_pow(level as u32);
        self.level0_file_size.saturating_mul(factor)
    }

    /// Total bytes allowed at `level`.
    pub fn max_total_bytes(&self, level: usize) -> u64 {
        (self.max_files(level) as u64).saturating_mul(self.max_file_size(level))
    }
}

// ------------------------------------------------------------------------------------------------
// Level
// ------------------------------------------------------------------------------------------------

/// One tier of segments, ordered newest first.
#[derive(Debug)]
pub struct Level {
    index: usize,
    segments: Vec<Arc<Segment>>,
}

impl Level {
    /// Creates an empty level.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            segments: Vec::new(),
        }
    }

    /// This level's position in the hierarchy.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The level's segments, newest first.
    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.segments
    }

    /// Inserts a segment at its recency position (creation timestamp
    /// descending), so reads probe newer segments first.
    pub fn insert(&mut self, segment: Arc<Segment>) {
        let created = segment.created();
        let position = self
            .segments
            .iter()
            .position(|s| s.created() < created)
            .unwrap_or(self.segments.len());
        self.segments.insert(position, segment);
    }

    /// Removes every segment that is pointer-identical to one in `consumed`.
    pub fn remove(&mut self, consumed: &[Arc<Segment>]) {
        self.segments
            .retain(|s| !consumed.iter().any(|c| Arc::ptr_eq(s, c)));
    }

    /// Number of segments.
    pub fn file_count(&self) -> usize {
        self.segments.len()
    }

    /// Sum of segment data sizes in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes()).sum()
    }

    /// Whether this level currently exceeds its allowance.
    pub fn needs_compaction(&self, thresholds: &LevelThresholds) -> bool {
        self.file_count() > thresholds.max_files(self.index)
            || self.total_bytes() > thresholds.max_total_bytes(self.index)
    }
}
