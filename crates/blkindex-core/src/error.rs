//! Error types for the blkindex pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while decoding a single record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of data: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("malformed data at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: String },
}

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {file} at offset {offset}: {source}")]
    Parse {
        file: String,
        offset: u64,
        #[source]
        source: DecodeError,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Discovered {count} forks with in_longest=1 after block {block_hash}")]
    ForkConflict { block_hash: String, count: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the store is in a state a rerun cannot repair.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ForkConflict { .. })
    }

    /// Returns `true` if the error came from decoding blk-file bytes.
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }
}
