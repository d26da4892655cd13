use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by archive operations.
///
/// Variants carry the offending archive path where one is meaningful.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("invalid archive path: {0:?}")]
    InvalidPath(String),

    #[error("crc32c mismatch for {path}: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("integrity: {0}")]
    Integrity(String),

    #[error("archive is read-only")]
    ReadOnly,

    #[error("shard {shard} missing: {path}")]
    ShardMissing { shard: u32, path: PathBuf },

    #[error("ingest of {path} failed: {source}")]
    IngestFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("unsupported schema version {major}.{minor}, run an upgrade")]
    UnsupportedSchema { major: i64, minor: i64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
