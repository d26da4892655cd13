//! Integrity verification.
//!
//! Full mode re-reads every file and recomputes its checksum on top of
//! the index-level checks. Quick mode never touches file bytes: it runs
//! the storage engine's own integrity check, recomputes the directory
//! counters, and validates shard presence and length.

use tracing::info;

use crate::barecat::Barecat;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::index::DirStatsMismatch;

const BATCH: usize = 1024;
const READ_BUFSIZE: usize = 256 * 1024;

#[derive(Debug)]
pub enum VerifyIssue {
    /// Stored and recomputed CRC32C disagree.
    CrcMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },
    /// The file's byte range could not be read at all.
    UnreadableFile { path: String, error: String },
    /// A referenced shard file is absent on disk.
    ShardMissing { shard: u32 },
    /// A shard file is shorter than its highest referenced byte.
    ShardTooShort {
        shard: u32,
        needed: u64,
        actual: u64,
    },
    /// Bytes past the logical end of a shard, typically left by a crash
    /// between a shard append and the index commit. Defrag reclaims them.
    OrphanTail { shard: u32, bytes: u64 },
    /// Stored directory counters disagree with a recomputation.
    DirStats(DirStatsMismatch),
    /// A path exists as both a file and a directory.
    PathConflict { path: String },
    /// Two files claim overlapping byte ranges in one shard.
    Overlap {
        shard: u32,
        first: String,
        second: String,
    },
    /// The storage engine's own integrity check complained.
    IndexCorrupt(String),
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub issues: Vec<VerifyIssue>,
    pub files_checked: u64,
    pub bytes_checked: u64,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Every file re-read and CRC-compared, plus all index-level checks.
pub fn verify_full(bc: &Barecat, cancel: &CancelToken) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    index_checks(bc, &mut report)?;

    let mut buf = vec![0u8; READ_BUFSIZE];
    let mut cursor: Option<(u32, u64, String)> = None;
    loop {
        let after = cursor.as_ref().map(|(s, o, p)| (*s, *o, p.as_str()));
        let page = bc.index.files_after_address(after, BATCH)?;
        let Some(last) = page.last() else { break };
        cursor = Some((last.shard, last.offset, last.path.clone()));

        for fi in &page {
            cancel.check()?;
            let mut crc = 0u32;
            let mut read = 0u64;
            let mut failed = false;
            while read < fi.size {
                let n = (buf.len() as u64).min(fi.size - read) as usize;
                match bc.sharder.read_into(fi.shard, fi.offset + read, &mut buf[..n]) {
                    Ok(()) => {
                        crc = crc32c::crc32c_append(crc, &buf[..n]);
                        read += n as u64;
                    }
                    Err(e) => {
                        report.issues.push(VerifyIssue::UnreadableFile {
                            path: fi.path.clone(),
                            error: e.to_string(),
                        });
                        failed = true;
                        break;
                    }
                }
            }
            if !failed {
                if let Some(expected) = fi.crc32c
                    && expected != crc
                {
                    report.issues.push(VerifyIssue::CrcMismatch {
                        path: fi.path.clone(),
                        expected,
                        actual: crc,
                    });
                }
                report.bytes_checked += fi.size;
            }
            report.files_checked += 1;
        }
    }

    info!(
        files = report.files_checked,
        issues = report.issues.len(),
        "full verify done"
    );
    Ok(report)
}

/// Index-level checks only; file bytes are not read.
pub fn verify_quick(bc: &Barecat) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    index_checks(bc, &mut report)?;
    info!(issues = report.issues.len(), "quick verify done");
    Ok(report)
}

fn index_checks(bc: &Barecat, report: &mut VerifyReport) -> Result<()> {
    for line in bc.index.integrity_check()? {
        report.issues.push(VerifyIssue::IndexCorrupt(line));
    }
    for mismatch in bc.index.dir_stats_mismatches()? {
        report.issues.push(VerifyIssue::DirStats(mismatch));
    }
    for path in bc.index.file_dir_conflicts()? {
        report.issues.push(VerifyIssue::PathConflict { path });
    }
    for (shard, first, second) in bc.index.overlapping_files()? {
        report.issues.push(VerifyIssue::Overlap {
            shard,
            first,
            second,
        });
    }
    for shard in 0..bc.index.num_used_shards()? {
        let needed = bc.index.logical_shard_end(shard)?;
        match bc.sharder.physical_end(shard) {
            Err(Error::ShardMissing { .. }) => {
                report.issues.push(VerifyIssue::ShardMissing { shard });
            }
            Err(e) => return Err(e),
            Ok(actual) if actual < needed => {
                report.issues.push(VerifyIssue::ShardTooShort {
                    shard,
                    needed,
                    actual,
                });
            }
            Ok(actual) if actual > needed => {
                report.issues.push(VerifyIssue::OrphanTail {
                    shard,
                    bytes: actual - needed,
                });
            }
            Ok(_) => {}
        }
    }
    Ok(())
}
