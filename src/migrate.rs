//! Schema migration between on-disk format versions.
//!
//! Pre-versioned archives (no config table) get a fresh index built
//! beside the old one, with CRC32C computed for every file from the
//! shards in parallel; the old index is kept as a `.old` backup. Schema
//! 0.1/0.2 archives get the corrected trigger set and a full stats
//! rebuild. Upgrading an already-current archive is a no-op, so the
//! whole operation is idempotent.

use std::fs::File;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::index::{self, Index, IndexOptions};
use crate::sharder;
use crate::types::{FileInfo, SCHEMA_VERSION_MAJOR, SCHEMA_VERSION_MINOR};

const BATCH: usize = 4096;
const READ_BUFSIZE: usize = 256 * 1024;

/// Trigger names used by the 0.1/0.2 schema, known to propagate
/// `num_files` through ancestors on directory move and delete.
const LEGACY_TRIGGER_NAMES: &[&str] = &[
    "add_file",
    "del_file",
    "move_file",
    "resize_file",
    "add_subdir",
    "del_subdir",
    "move_subdir",
    "resize_dir",
];

/// Read the schema version of an index file without opening it as an
/// archive. An index without a config table reports major -1.
pub fn schema_version(index_path: &Path) -> Result<(i64, i64)> {
    let conn = Connection::open_with_flags(
        index_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
    )?;
    let has_config: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_schema WHERE type = 'table' AND name = 'config'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if has_config.is_none() {
        return Ok((-1, 0));
    }
    let get = |key: &str| -> Result<Option<i64>> {
        Ok(conn
            .query_row(
                "SELECT value_int FROM config WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?
            .flatten())
    };
    let major = get("schema_version_major")?.unwrap_or(SCHEMA_VERSION_MAJOR - 1);
    let minor = get("schema_version_minor")?.unwrap_or(0);
    Ok((major, minor))
}

/// Upgrade the archive at `path` to the current schema version. The old
/// index survives as `<path>.old` when a full rebuild was needed.
pub fn upgrade(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(Error::NotFound(path.display().to_string()));
    }
    let (major, minor) = schema_version(path)?;
    if (major, minor) == (SCHEMA_VERSION_MAJOR, SCHEMA_VERSION_MINOR) {
        info!(major, minor, "schema already current, nothing to do");
        return Ok(());
    }
    if major > SCHEMA_VERSION_MAJOR || (major == SCHEMA_VERSION_MAJOR && minor > SCHEMA_VERSION_MINOR)
    {
        return Err(Error::UnsupportedSchema { major, minor });
    }
    if major < SCHEMA_VERSION_MAJOR {
        info!(major, minor, "upgrading pre-versioned archive");
        upgrade_from_unversioned(path)
    } else {
        info!(major, minor, "upgrading trigger set and rebuilding stats");
        upgrade_0x_to_0_3(path)
    }
}

/// Full rebuild: fresh index with the current schema, rows copied over,
/// CRC32C computed for every file from the shard bytes.
fn upgrade_from_unversioned(path: &Path) -> Result<()> {
    let temp_path = scratch_path(path);
    let new_index = Index::open(
        &temp_path,
        &IndexOptions {
            readonly: false,
            ..IndexOptions::default()
        },
    )?;

    new_index.with_triggers_off(|index| {
        let conn = index.conn();
        let source = path.to_string_lossy();
        conn.execute(
            "ATTACH DATABASE ?1 AS source",
            [format!("file:{source}?mode=ro")],
        )?;
        let result = (|| -> Result<()> {
            // older layouts called the table 'directories'
            let dirs_table: Option<String> = conn
                .query_row(
                    "SELECT name FROM source.sqlite_schema
                     WHERE type = 'table' AND name IN ('directories', 'dirs')",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(table) = dirs_table {
                conn.execute(
                    &format!("INSERT OR IGNORE INTO dirs (path) SELECT path FROM source.\"{table}\" WHERE path != ''"),
                    [],
                )?;
            }
            conn.execute(
                "INSERT INTO files (path, shard, offset, size)
                 SELECT path, shard, offset, size FROM source.files",
                [],
            )?;
            Ok(())
        })();
        let detached = conn.execute("DETACH DATABASE source", []);
        result?;
        detached?;
        Ok(())
    })?;
    new_index.rebuild_stats()?;
    compute_all_crcs(path, &new_index)?;
    new_index.close()?;

    let backup = backup_path(path);
    std::fs::rename(path, &backup)?;
    std::fs::rename(&temp_path, path)?;
    info!(backup = %backup.display(), "upgrade complete, old index preserved");
    Ok(())
}

/// 0.1/0.2 to 0.3: replace the buggy trigger set with the corrected one
/// (`num_files` is a direct-child counter and must not be propagated
/// through ancestors on move or delete) and rebuild every counter.
fn upgrade_0x_to_0_3(path: &Path) -> Result<()> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI,
    )?;
    for name in LEGACY_TRIGGER_NAMES.iter().chain(index::TRIGGER_NAMES) {
        conn.execute_batch(&format!("DROP TRIGGER IF EXISTS {name}"))?;
    }
    conn.execute_batch(index::TRIGGERS_SQL)?;
    conn.execute(
        "INSERT INTO config (key, value_int) VALUES ('schema_version_minor', ?1)
         ON CONFLICT (key) DO UPDATE SET value_int = excluded.value_int",
        params![SCHEMA_VERSION_MINOR],
    )?;
    conn.close().map_err(|(_conn, e)| Error::Sqlite(e))?;

    let index = Index::open(
        path,
        &IndexOptions {
            readonly: false,
            ..IndexOptions::default()
        },
    )?;
    index.rebuild_stats()?;
    index.close()?;
    Ok(())
}

/// Recompute CRC32C for every file, reading the shards in parallel.
/// Positioned reads make shared shard handles safe across threads.
fn compute_all_crcs(base: &Path, index: &Index) -> Result<()> {
    let num_shards = index.num_used_shards()?;
    let mut shards = Vec::with_capacity(num_shards as usize);
    for shard in 0..num_shards {
        let path = sharder::shard_path(base, shard);
        let file = File::open(&path).map_err(|_| Error::ShardMissing { shard, path })?;
        shards.push(file);
    }

    let mut cursor: Option<(u32, u64, String)> = None;
    let mut total = 0u64;
    loop {
        let after = cursor.as_ref().map(|(s, o, p)| (*s, *o, p.as_str()));
        let page = index.files_after_address(after, BATCH)?;
        let Some(last) = page.last() else { break };
        cursor = Some((last.shard, last.offset, last.path.clone()));

        let crcs: Vec<Result<(String, u32)>> = page
            .par_iter()
            .map_init(
                || vec![0u8; READ_BUFSIZE],
                |buf, fi| Ok((fi.path.clone(), crc_of(&shards, fi, buf)?)),
            )
            .collect();

        let tx = index.conn().unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached("UPDATE files SET crc32c = ?1 WHERE path = ?2")?;
            for crc in crcs {
                let (path, crc) = crc?;
                stmt.execute(params![crc as i64, path])?;
                total += 1;
            }
        }
        tx.commit()?;
    }
    info!(files = total, "checksummed all files");
    Ok(())
}

fn crc_of(shards: &[File], fi: &FileInfo, buf: &mut [u8]) -> Result<u32> {
    use std::os::unix::fs::FileExt;
    let file = shards.get(fi.shard as usize).ok_or(Error::ShardMissing {
        shard: fi.shard,
        path: PathBuf::new(),
    })?;
    let mut crc = 0u32;
    let mut read = 0u64;
    while read < fi.size {
        let n = (buf.len() as u64).min(fi.size - read) as usize;
        file.read_exact_at(&mut buf[..n], fi.offset + read)?;
        crc = crc32c::crc32c_append(crc, &buf[..n]);
        read += n as u64;
    }
    Ok(crc)
}

fn scratch_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!("-upgrade-{}", Uuid::new_v4().simple()));
    PathBuf::from(name)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".old");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barecat::Barecat;

    #[test]
    fn test_upgrade_current_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cur.barecat");
        let mut bc = Barecat::create(&path).unwrap();
        bc.put("a.bin", b"data", false).unwrap();
        bc.close().unwrap();

        upgrade(&path).unwrap();
        upgrade(&path).unwrap();
        assert_eq!(
            schema_version(&path).unwrap(),
            (SCHEMA_VERSION_MAJOR, SCHEMA_VERSION_MINOR)
        );
        let bc = Barecat::open(&path).unwrap();
        assert_eq!(bc.get("a.bin").unwrap(), b"data");
    }

    #[test]
    fn test_upgrade_0_2_fixes_stats_and_bumps_minor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.barecat");
        let mut bc = Barecat::create(&path).unwrap();
        bc.put("d/a.bin", &[1u8; 10], false).unwrap();
        bc.put("d/e/b.bin", &[2u8; 20], false).unwrap();
        bc.close().unwrap();

        // damage the archive the way the 0.2 trigger bug would have:
        // wrong counters, old version stamp
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE config SET value_int = 2 WHERE key = 'schema_version_minor'",
            [],
        )
        .unwrap();
        conn.execute("UPDATE dirs SET num_files = 7 WHERE path = 'd'", [])
            .unwrap();
        conn.close().unwrap();

        assert_eq!(schema_version(&path).unwrap(), (0, 2));
        upgrade(&path).unwrap();
        assert_eq!(
            schema_version(&path).unwrap(),
            (SCHEMA_VERSION_MAJOR, SCHEMA_VERSION_MINOR)
        );

        let bc = Barecat::open(&path).unwrap();
        let d = bc.index().lookup_dir("d").unwrap();
        assert_eq!(d.num_files, 1);
        assert_eq!(d.size_tree, 30);
        assert!(bc.index().dir_stats_mismatches().unwrap().is_empty());
    }

    #[test]
    fn test_upgrade_pre_versioned_computes_crcs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ancient.barecat");

        // the pre-versioned layout: files/directories tables, no config,
        // no crc column
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE files (
                 path TEXT PRIMARY KEY,
                 shard INTEGER, offset INTEGER, size INTEGER
             );
             CREATE TABLE directories (path TEXT PRIMARY KEY);",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO files (path, shard, offset, size) VALUES
                 ('one.bin', 0, 0, 5),
                 ('sub/two.bin', 0, 5, 3)",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO directories (path) VALUES ('sub')", [])
            .unwrap();
        conn.close().unwrap();
        std::fs::write(sharder::shard_path(&path, 0), b"hellofoo").unwrap();

        assert_eq!(schema_version(&path).unwrap(), (-1, 0));
        upgrade(&path).unwrap();
        assert!(backup_path(&path).exists());

        let bc = Barecat::open(&path).unwrap();
        assert_eq!(bc.get("one.bin").unwrap(), b"hello");
        assert_eq!(bc.get("sub/two.bin").unwrap(), b"foo");
        let info = bc.index().lookup_file("one.bin").unwrap();
        assert_eq!(info.crc32c, Some(crc32c::crc32c(b"hello")));
        assert_eq!(bc.index().lookup_dir("").unwrap().num_files_tree, 2);
        assert!(bc.index().dir_stats_mismatches().unwrap().is_empty());

        // idempotence: a second upgrade is a no-op
        upgrade(&path).unwrap();
        assert_eq!(bc.get("one.bin").unwrap(), b"hello");
    }
}
