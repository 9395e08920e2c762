//! Ingestion cursor: tracks the current position in the blk-file sequence.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// File name of the `number`-th blk-file (`blk00000.dat`, …).
pub fn blk_file_name(number: u32) -> String {
    format!("blk{number:05}.dat")
}

/// The indexer's position inside one data directory.
///
/// The store keeps one row per file switch; the newest row for a directory
/// is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlkCursor {
    /// Row id once persisted; `None` for a cursor not yet saved.
    pub id: Option<i64>,
    /// Directory holding the blk-files.
    pub dirname: String,
    /// Number of the blk-file being read.
    pub blkfile_number: u32,
    /// Byte offset of the first record not yet committed.
    pub blkfile_offset: u64,
    /// Unix timestamp of when this row was created.
    pub created_at: i64,
}

impl BlkCursor {
    /// A fresh cursor at the start of `blk00000.dat`.
    pub fn new(dirname: impl Into<String>) -> Self {
        Self {
            id: None,
            dirname: dirname.into(),
            blkfile_number: 0,
            blkfile_offset: 0,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Path of the blk-file this cursor points into.
    pub fn file_path(&self) -> PathBuf {
        PathBuf::from(&self.dirname).join(blk_file_name(self.blkfile_number))
    }

    /// Move to a new offset within the current file.
    pub fn advance(&mut self, offset: u64) {
        self.blkfile_offset = offset;
    }

    /// A new, unsaved cursor at the start of the following blk-file.
    pub fn next_file(&self) -> Self {
        Self {
            id: None,
            dirname: self.dirname.clone(),
            blkfile_number: self.blkfile_number + 1,
            blkfile_offset: 0,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}
