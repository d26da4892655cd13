//! Defragmentation: reclaim the gaps that deletions and overwrites leave
//! in the shards.
//!
//! Full mode rewrites every misplaced file down to the next free
//! position. Smart mode does the same but moves contiguous runs of files
//! as single block copies. Quick mode fills earlier gaps with tail files
//! until a time budget runs out.
//!
//! Moves always land at or below the source address: the shrink guard on
//! `shard_size_limit` keeps every existing shard within the limit, so
//! dense repacking can never push a file past where it already is. Bytes
//! are copied before the index row is updated, so a crash between the
//! two leaves the entry pointing at the old, still-intact copy.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::barecat::Barecat;
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::types::{FileInfo, Gap};

const BATCH: usize = 1024;
const MAX_SKIP_NORMAL: u32 = 2;
const MAX_SKIP_OUTLIER: u32 = 10;
const OUTLIER_QUANTILE: f64 = 0.95;

/// Outcome of a defrag pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefragStats {
    pub bytes_reclaimed: u64,
    pub files_moved: u64,
}

/// Compact every shard completely: after this, adjacent files in address
/// order touch, shard tails are truncated, and trailing empty shards are
/// deleted. Idempotent.
pub fn defrag_full(bc: &mut Barecat, cancel: &CancelToken) -> Result<DefragStats> {
    let old_total = bc.total_physical_size();
    let limit = bc.shard_size_limit()?;
    let mut new_shard: u32 = 0;
    let mut new_offset: u64 = 0;
    let mut files_moved = 0u64;
    let mut cursor: Option<(u32, u64, String)> = None;

    loop {
        let after = cursor.as_ref().map(|(s, o, p)| (*s, *o, p.as_str()));
        let page = bc.index.files_after_address(after, BATCH)?;
        let Some(last) = page.last() else { break };
        cursor = Some((last.shard, last.offset, last.path.clone()));

        for fi in &page {
            cancel.check()?;
            if new_offset > 0 && new_offset + fi.size > limit {
                bc.sharder.truncate(new_shard, new_offset)?;
                new_shard += 1;
                new_offset = 0;
            }
            if fi.shard != new_shard || fi.offset != new_offset {
                while bc.sharder.num_shards() <= new_shard {
                    bc.sharder.start_new_shard()?;
                }
                bc.sharder
                    .copy_range(fi.shard, fi.offset, new_shard, new_offset, fi.size)?;
                bc.index
                    .update_file_location(&fi.path, new_shard, new_offset)?;
                files_moved += 1;
            }
            new_offset += fi.size;
        }
    }

    if new_shard < bc.sharder.num_shards() {
        bc.sharder.truncate(new_shard, new_offset)?;
    }
    bc.sharder.remove_shards_after(new_shard)?;

    let stats = DefragStats {
        bytes_reclaimed: old_total.saturating_sub(bc.total_physical_size()),
        files_moved,
    };
    info!(
        bytes_reclaimed = stats.bytes_reclaimed,
        files_moved = stats.files_moved,
        "full defrag done"
    );
    Ok(stats)
}

/// Like [`defrag_full`], but contiguous runs of files move as one block
/// read/write and one batch index update.
pub fn defrag_smart(bc: &mut Barecat, cancel: &CancelToken) -> Result<DefragStats> {
    let old_total = bc.total_physical_size();
    let limit = bc.shard_size_limit()?;

    // zero-size entries occupy no bytes; park them at the shard origin so
    // the chunk walk only ever sees real extents
    let parked = bc.index.relocate_zero_size_files()?;
    let total_files = bc.index.num_files()? - bc.index.num_zero_size_files()?;

    let mut new_shard: u32 = 0;
    let mut new_offset: u64 = 0;
    let mut src_shard: u32 = 0;
    let mut src_offset: u64 = 0;
    let mut files_moved = parked;
    let mut processed = 0u64;

    while processed < total_files {
        cancel.check()?;
        let available = limit.saturating_sub(new_offset);
        let chunk = bc.index.next_contiguous_chunk(src_shard, src_offset, available)?;
        let Some(chunk) = chunk else {
            if new_offset > 0 {
                bc.sharder.truncate(new_shard, new_offset)?;
                new_shard += 1;
                new_offset = 0;
                continue;
            }
            break;
        };

        if chunk.shard != new_shard || chunk.start_offset != new_offset {
            while bc.sharder.num_shards() <= new_shard {
                bc.sharder.start_new_shard()?;
            }
            bc.sharder.copy_range(
                chunk.shard,
                chunk.start_offset,
                new_shard,
                new_offset,
                chunk.total_size(),
            )?;
            let delta = new_offset as i64 - chunk.start_offset as i64;
            bc.index.shift_file_range(
                chunk.shard,
                chunk.start_offset,
                chunk.end_offset,
                new_shard,
                delta,
            )?;
            files_moved += chunk.file_count;
        }
        new_offset += chunk.total_size();
        processed += chunk.file_count;
        src_shard = chunk.shard;
        src_offset = chunk.end_offset;
    }

    if new_shard < bc.sharder.num_shards() {
        bc.sharder.truncate(new_shard, new_offset)?;
    }
    bc.sharder.remove_shards_after(new_shard)?;

    let stats = DefragStats {
        bytes_reclaimed: old_total.saturating_sub(bc.total_physical_size()),
        files_moved,
    };
    info!(
        bytes_reclaimed = stats.bytes_reclaimed,
        files_moved = stats.files_moved,
        "smart defrag done"
    );
    Ok(stats)
}

/// Opportunistic defrag: walk files from the archive's tail, moving each
/// into the earliest earlier gap that fits, until the time budget runs
/// out or the gaps are exhausted. Shards end up partially defragmented
/// and are truncated to their logical ends.
pub fn defrag_quick(
    bc: &mut Barecat,
    budget: Duration,
    cancel: &CancelToken,
) -> Result<DefragStats> {
    let started = Instant::now();
    let old_total = bc.total_physical_size();
    let limit = bc.shard_size_limit()?;

    let mut gaps = bc.index.gaps(Some(limit))?;
    for shard in 0..bc.sharder.num_shards() {
        if bc.index.logical_shard_end(shard)? == 0 {
            gaps.push(Gap {
                shard,
                offset: 0,
                size: limit,
            });
        }
    }
    gaps.sort_by_key(|g| (g.shard, g.offset));

    let outlier_threshold = bc
        .index
        .size_quantile(OUTLIER_QUANTILE)?
        .unwrap_or(u64::MAX);
    let mut normal_skipped = 0u32;
    let mut outlier_skipped = 0u32;
    let mut files_moved = 0u64;
    let mut cursor: Option<(u32, u64, String)> = None;

    'scan: loop {
        let before = cursor.as_ref().map(|(s, o, p)| (*s, *o, p.as_str()));
        let page = bc.index.files_before_address(before, BATCH)?;
        if page.is_empty() {
            break;
        }
        for fi in &page {
            cancel.check()?;
            if started.elapsed() > budget {
                debug!("quick defrag budget exhausted");
                break 'scan;
            }
            cursor = Some((fi.shard, fi.offset, fi.path.clone()));
            if fi.size == 0 {
                continue;
            }
            // files moved earlier in this pass resurface when the cursor
            // descends to their new address; skip the stale sighting
            let current = bc.index.lookup_file(&fi.path)?;
            if current.shard != fi.shard || current.offset != fi.offset {
                continue;
            }
            if move_to_earlier_gap(bc, fi, &mut gaps)? {
                insert_gap_sorted(
                    &mut gaps,
                    Gap {
                        shard: fi.shard,
                        offset: fi.offset,
                        size: fi.size,
                    },
                );
                files_moved += 1;
            } else if fi.size >= outlier_threshold {
                outlier_skipped += 1;
                if outlier_skipped > MAX_SKIP_OUTLIER {
                    break 'scan;
                }
            } else {
                normal_skipped += 1;
                if normal_skipped > MAX_SKIP_NORMAL {
                    break 'scan;
                }
            }
        }
    }

    bc.truncate_to_logical()?;
    let used = bc.index.num_used_shards()?;
    bc.sharder.remove_shards_after(used.saturating_sub(1))?;

    let stats = DefragStats {
        bytes_reclaimed: old_total.saturating_sub(bc.total_physical_size()),
        files_moved,
    };
    info!(
        bytes_reclaimed = stats.bytes_reclaimed,
        files_moved = stats.files_moved,
        "quick defrag done"
    );
    Ok(stats)
}

/// True iff the shards hold more bytes than the live files account for.
pub fn needs_defrag(bc: &Barecat) -> Result<bool> {
    Ok(bc.total_physical_size() > bc.total_logical_size()?)
}

fn move_to_earlier_gap(bc: &mut Barecat, fi: &FileInfo, gaps: &mut Vec<Gap>) -> Result<bool> {
    for i in 0..gaps.len() {
        let gap = gaps[i];
        if gap.shard > fi.shard || (gap.shard == fi.shard && gap.offset >= fi.offset) {
            // only gaps after the file remain, no move possible
            return Ok(false);
        }
        if gap.size >= fi.size {
            bc.sharder
                .copy_range(fi.shard, fi.offset, gap.shard, gap.offset, fi.size)?;
            bc.index
                .update_file_location(&fi.path, gap.shard, gap.offset)?;
            let gap = &mut gaps[i];
            gap.offset += fi.size;
            gap.size -= fi.size;
            if gap.size == 0 {
                gaps.remove(i);
            }
            return Ok(true);
        }
    }
    Ok(false)
}

/// Insert into the address-sorted gap list, merging with adjacent gaps.
fn insert_gap_sorted(gaps: &mut Vec<Gap>, new_gap: Gap) {
    let i = gaps.partition_point(|g| (g.shard, g.offset) < (new_gap.shard, new_gap.offset));

    if i > 0 {
        let prev = gaps[i - 1];
        if prev.shard == new_gap.shard && prev.offset + prev.size == new_gap.offset {
            gaps[i - 1].size += new_gap.size;
            if i < gaps.len() {
                let merged = gaps[i - 1];
                let next = gaps[i];
                if next.shard == merged.shard && merged.offset + merged.size == next.offset {
                    gaps[i - 1].size += next.size;
                    gaps.remove(i);
                }
            }
            return;
        }
    }

    if i < gaps.len() {
        let next = gaps[i];
        if next.shard == new_gap.shard && new_gap.offset + new_gap.size == next.offset {
            gaps[i].offset = new_gap.offset;
            gaps[i].size += new_gap.size;
            return;
        }
    }

    gaps.insert(i, new_gap);
}
