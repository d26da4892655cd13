//! Barecat: an archive engine for very large sets of small files.
//!
//! Data lives in one or more append-only shard files holding raw bytes
//! back-to-back; metadata lives in a SQLite index mapping each path to
//! `(shard, offset, size, crc32c)` plus POSIX-style attributes, with
//! per-directory aggregate statistics maintained by database triggers.
//!
//! The [`Barecat`] facade ties the two together with a path-addressed,
//! filesystem-flavored API; the maintenance modules cover
//! defragmentation, resharding, verification, merging and schema
//! migration.

pub mod barecat;
pub mod cancel;
pub mod defrag;
pub mod error;
pub mod glob;
pub mod index;
pub mod merge;
pub mod migrate;
pub mod paths;
pub mod reshard;
pub mod sharder;
pub mod types;
pub mod verify;

pub use barecat::{Barecat, BarecatOptions, FileReader, FileWriter, Walk};
pub use cancel::CancelToken;
pub use defrag::DefragStats;
pub use error::{Error, Result};
pub use glob::GlobPattern;
pub use index::{DirStats, DirStatsMismatch, Index, IndexOptions};
pub use merge::{DuplicatePolicy, MergeOptions, merge_copy, merge_symlink};
pub use migrate::{schema_version, upgrade};
pub use sharder::{OpenMode, Sharder};
pub use types::{
    DirInfo, EntryInfo, FileInfo, Gap, Order, SCHEMA_VERSION_MAJOR, SCHEMA_VERSION_MINOR,
    SHARD_SIZE_UNLIMITED,
};
pub use verify::{VerifyIssue, VerifyReport};
