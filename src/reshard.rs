//! Resharding: repack all bytes under a new shard size limit.
//!
//! Files are streamed in address order into sibling `-shard-new-*` files
//! packed under the new limit, the siblings are renamed over the
//! originals, and the index rows are rewritten in one transaction. A
//! file larger than the limit gets a fresh shard to itself; it is never
//! split.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::barecat::Barecat;
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::sharder;

const BATCH: usize = 1024;
const COPY_BUFSIZE: usize = 1024 * 1024;

fn new_shard_path(base: &Path, shard: u32) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!("-shard-new-{shard:05}"));
    PathBuf::from(name)
}

pub fn reshard(bc: &mut Barecat, new_limit: u64, cancel: &CancelToken) -> Result<()> {
    let base = bc.path().to_path_buf();
    let old_num_shards = bc.sharder.num_shards();

    let open_new = |shard: u32| -> std::io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(new_shard_path(&base, shard))
    };

    let mut out = open_new(0)?;
    let mut new_shard: u32 = 0;
    let mut new_offset: u64 = 0;
    let mut moves: Vec<(String, u32, u64)> = Vec::new();
    let mut buf = vec![0u8; COPY_BUFSIZE];
    let mut cursor: Option<(u32, u64, String)> = None;

    loop {
        let after = cursor.as_ref().map(|(s, o, p)| (*s, *o, p.as_str()));
        let page = bc.index.files_after_address(after, BATCH)?;
        let Some(last) = page.last() else { break };
        cursor = Some((last.shard, last.offset, last.path.clone()));

        for fi in &page {
            cancel.check()?;
            if new_offset > 0 && new_offset + fi.size > new_limit {
                out.flush()?;
                new_shard += 1;
                new_offset = 0;
                out = open_new(new_shard)?;
            }
            let mut copied = 0u64;
            while copied < fi.size {
                let n = (buf.len() as u64).min(fi.size - copied) as usize;
                bc.sharder
                    .read_into(fi.shard, fi.offset + copied, &mut buf[..n])?;
                out.write_all(&buf[..n])?;
                copied += n as u64;
            }
            moves.push((fi.path.clone(), new_shard, new_offset));
            new_offset += fi.size;
        }
    }
    out.flush()?;
    drop(out);

    // old shards beyond the new count will not be overwritten by a rename
    for shard in (new_shard + 1)..old_num_shards {
        fs::remove_file(sharder::shard_path(&base, shard))?;
    }
    for shard in 0..=new_shard {
        fs::rename(new_shard_path(&base, shard), sharder::shard_path(&base, shard))?;
    }

    bc.index.update_file_locations(&moves)?;
    bc.index.set_shard_size_limit_unchecked(new_limit)?;
    bc.sharder.set_shard_size_limit(new_limit);
    bc.sharder.reopen()?;

    info!(
        new_limit,
        shards = new_shard + 1,
        files = moves.len(),
        "resharded archive"
    );
    Ok(())
}
