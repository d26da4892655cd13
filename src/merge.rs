//! Merging archives.
//!
//! Copy mode streams every source file through the output facade, so the
//! result is one self-contained archive. Symlink mode copies no bytes at
//! all: output shards are symlinks to the source shards, renumbered so
//! they never collide, and only the index is rebuilt.
//!
//! Duplicate paths keep the first-seen entry, bytes and metadata both
//! (or fail, per policy). Directory metadata merges as mode-union,
//! first owner, newest mtime.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::barecat::{Barecat, BarecatOptions};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::index::{Index, IndexOptions};
pub use crate::index::DuplicatePolicy;
use crate::sharder;
use crate::types::Order;

const BATCH: usize = 1024;

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub policy: DuplicatePolicy,
    pub shard_size_limit: Option<u64>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            policy: DuplicatePolicy::Fail,
            shard_size_limit: None,
        }
    }
}

/// Merge `sources` into the archive at `output` by copying bytes. The
/// output is created if missing and appended to otherwise. Sources are
/// read in address order for sequential I/O.
pub fn merge_copy(
    sources: &[PathBuf],
    output: &Path,
    options: &MergeOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let mut out = Barecat::open_with(
        output,
        &BarecatOptions {
            readonly: false,
            shard_size_limit: options.shard_size_limit,
            ..BarecatOptions::default()
        },
    )?;
    let mut copied = 0u64;
    let mut skipped = 0u64;

    for source in sources {
        let src = Barecat::open(source)?;
        for dir in src.index().all_dirs(Order::Path)? {
            out.index.upsert_dir_metadata(&dir)?;
        }

        let mut cursor: Option<(u32, u64, String)> = None;
        loop {
            let after = cursor.as_ref().map(|(s, o, p)| (*s, *o, p.as_str()));
            let page = src.index().files_after_address(after, BATCH)?;
            let Some(last) = page.last() else { break };
            cursor = Some((last.shard, last.offset, last.path.clone()));

            for fi in &page {
                cancel.check()?;
                if out.index.is_file(&fi.path)? {
                    match options.policy {
                        DuplicatePolicy::Fail => {
                            return Err(Error::AlreadyExists(fi.path.clone()));
                        }
                        DuplicatePolicy::KeepFirst => {
                            skipped += 1;
                            continue;
                        }
                    }
                }
                let (_, mut reader) = src.emit(&fi.path)?;
                out.add_streamed(fi.clone(), &mut reader)?;
                copied += 1;
            }
        }
        info!(source = %source.display(), copied, skipped, "merged source");
    }
    out.close()?;
    Ok(())
}

/// Merge barecat sources into a fresh archive at `output` without
/// copying bytes: each output shard is a symlink to a source shard,
/// renumbered past the shards of earlier sources, and the output index
/// cites the renumbered shards at identical offsets.
#[cfg(unix)]
pub fn merge_symlink(
    sources: &[PathBuf],
    output: &Path,
    policy: DuplicatePolicy,
    cancel: &CancelToken,
) -> Result<()> {
    if output.exists() {
        return Err(Error::AlreadyExists(output.display().to_string()));
    }
    let out_index = Index::open(
        output,
        &IndexOptions {
            readonly: false,
            ..IndexOptions::default()
        },
    )?;

    let mut shard_base = 0u32;
    for source in sources {
        cancel.check()?;
        let src_index = Index::open(source, &IndexOptions::default())?;
        let num_shards = src_index.num_used_shards()?;
        src_index.close()?;

        for shard in 0..num_shards {
            let target = sharder::shard_path(source, shard);
            let target = fs::canonicalize(&target).map_err(|_| Error::ShardMissing {
                shard,
                path: target.clone(),
            })?;
            let link = sharder::shard_path(output, shard_base + shard);
            std::os::unix::fs::symlink(&target, &link)?;
        }

        out_index.merge_from_index(source, shard_base, policy)?;
        shard_base += num_shards;
        info!(source = %source.display(), shard_base, "linked source shards");
    }

    out_index.rebuild_stats()?;
    out_index.close()?;
    Ok(())
}
