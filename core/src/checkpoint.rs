//! Checkpoint tables for seekable gzip decompression.
//!
//! A checkpoint pairs a compressed offset with the uncompressed offset that
//! a fresh decoder started there would produce. Tables are built once per
//! layer by the indexer and never modified afterwards.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// A resume point inside a compressed layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checkpoint {
    pub compressed_offset: u64,
    pub uncompressed_offset: u64,
}

impl Checkpoint {
    pub const ORIGIN: Checkpoint = Checkpoint {
        compressed_offset: 0,
        uncompressed_offset: 0,
    };

    pub fn new(compressed_offset: u64, uncompressed_offset: u64) -> Self {
        Self {
            compressed_offset,
            uncompressed_offset,
        }
    }
}

/// Ordered checkpoints for one layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointTable {
    entries: Vec<Checkpoint>,
}

impl CheckpointTable {
    /// Create a table holding only the (0, 0) checkpoint.
    pub fn new() -> Self {
        Self {
            entries: vec![Checkpoint::ORIGIN],
        }
    }

    /// Build a table from raw entries, checking ordering.
    pub fn from_entries(entries: Vec<Checkpoint>) -> Result<Self> {
        let table = Self { entries };
        table.validate()?;
        Ok(table)
    }

    /// Append a checkpoint unless it duplicates the last one.
    ///
    /// Returns whether the checkpoint was recorded. Offsets going backwards
    /// are ignored, the table stays non-decreasing.
    pub fn push(&mut self, checkpoint: Checkpoint) -> bool {
        match self.entries.last() {
            Some(last) if *last == checkpoint => false,
            Some(last)
                if checkpoint.compressed_offset < last.compressed_offset
                    || checkpoint.uncompressed_offset < last.uncompressed_offset =>
            {
                false
            }
            _ => {
                self.entries.push(checkpoint);
                true
            }
        }
    }

    pub fn last(&self) -> Option<&Checkpoint> {
        self.entries.last()
    }

    pub fn entries(&self) -> &[Checkpoint] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the checkpoint with the greatest uncompressed offset <= `target`.
    ///
    /// Falls back to the first entry when `target` precedes every entry, and
    /// to (0, 0) for an empty table.
    pub fn nearest(&self, target: u64) -> Checkpoint {
        if self.entries.is_empty() {
            return Checkpoint::ORIGIN;
        }
        // Index of the first entry strictly above target
        let idx = self
            .entries
            .partition_point(|c| c.uncompressed_offset <= target);
        if idx == 0 {
            self.entries[0]
        } else {
            self.entries[idx - 1]
        }
    }

    /// Check the table invariants: first entry (0, 0), non-decreasing in
    /// both fields.
    pub fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        if self.entries[0] != Checkpoint::ORIGIN {
            return Err(StrataError::IndexCorrupt(format!(
                "checkpoint table starts at ({}, {}) instead of (0, 0)",
                self.entries[0].compressed_offset, self.entries[0].uncompressed_offset
            )));
        }
        for pair in self.entries.windows(2) {
            if pair[1].compressed_offset < pair[0].compressed_offset
                || pair[1].uncompressed_offset < pair[0].uncompressed_offset
            {
                return Err(StrataError::IndexCorrupt(format!(
                    "checkpoint table decreases at ({}, {})",
                    pair[1].compressed_offset, pair[1].uncompressed_offset
                )));
            }
        }
        Ok(())
    }
}
