//! The relational index: a SQLite database mapping archive paths to shard
//! addresses and metadata, with per-directory aggregate statistics kept
//! up to date by a cascade of triggers.
//!
//! The `parent` column of both tables is a generated virtual column, so
//! renames and inserts can never desynchronize it from `path`.

use std::cell::Cell;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::glob::{self, GlobPattern};
use crate::paths;
use crate::types::{
    DirInfo, EntryInfo, FileInfo, Gap, Order, SCHEMA_VERSION_MAJOR, SCHEMA_VERSION_MINOR,
    SHARD_SIZE_UNLIMITED,
};

const FILE_COLS: &str = "path, shard, offset, size, crc32c, mode, uid, gid, mtime_ns";
const DIR_COLS: &str =
    "path, num_subdirs, num_files, num_files_tree, size_tree, mode, uid, gid, mtime_ns";

pub(crate) const SCHEMA_SQL: &str = r#"
CREATE TABLE config (
    key TEXT PRIMARY KEY NOT NULL,
    value_text TEXT,
    value_int INTEGER
) WITHOUT ROWID;

CREATE TABLE dirs (
    path TEXT NOT NULL,
    parent TEXT GENERATED ALWAYS AS (
        CASE
            WHEN path = '' THEN NULL
            ELSE rtrim(rtrim(path, replace(path, '/', '')), '/')
        END) VIRTUAL,
    num_subdirs INTEGER NOT NULL DEFAULT 0,
    num_files INTEGER NOT NULL DEFAULT 0,
    num_files_tree INTEGER NOT NULL DEFAULT 0,
    size_tree INTEGER NOT NULL DEFAULT 0,
    mode INTEGER,
    uid INTEGER,
    gid INTEGER,
    mtime_ns INTEGER
);
CREATE UNIQUE INDEX idx_dirs_path ON dirs(path);
CREATE INDEX idx_dirs_parent ON dirs(parent);

CREATE TABLE files (
    path TEXT NOT NULL,
    parent TEXT GENERATED ALWAYS AS (
        rtrim(rtrim(path, replace(path, '/', '')), '/')) VIRTUAL,
    shard INTEGER NOT NULL DEFAULT 0,
    offset INTEGER NOT NULL DEFAULT 0,
    size INTEGER NOT NULL DEFAULT 0,
    crc32c INTEGER,
    mode INTEGER,
    uid INTEGER,
    gid INTEGER,
    mtime_ns INTEGER
);
CREATE UNIQUE INDEX idx_files_path ON files(path);
CREATE INDEX idx_files_parent ON files(parent);
CREATE INDEX idx_files_shard_offset ON files(shard, offset);
"#;

/// The stats cascade. Each trigger is guarded by `config.use_triggers` so
/// bulk loaders can switch propagation off and rebuild afterwards.
///
/// Tree counters (`num_files_tree`, `size_tree`) are adjusted one level up
/// by each operation trigger; `dirs_bubble` then carries the delta the
/// rest of the way to the root via recursive trigger invocation.
/// `num_files` and `num_subdirs` are direct-child counters and never
/// propagate past the parent.
pub(crate) const TRIGGERS_SQL: &str = r#"
CREATE TRIGGER files_bi_guard BEFORE INSERT ON files
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND EXISTS (SELECT 1 FROM dirs WHERE path = NEW.path)
BEGIN
    SELECT RAISE(ABORT, 'path already exists as directory');
END;

CREATE TRIGGER dirs_bi_guard BEFORE INSERT ON dirs
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND EXISTS (SELECT 1 FROM files WHERE path = NEW.path)
BEGIN
    SELECT RAISE(ABORT, 'path already exists as file');
END;

CREATE TRIGGER files_ai AFTER INSERT ON files
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
BEGIN
    INSERT OR IGNORE INTO dirs (path) VALUES (NEW.parent);
    UPDATE dirs SET
        num_files = num_files + 1,
        num_files_tree = num_files_tree + 1,
        size_tree = size_tree + NEW.size
    WHERE path = NEW.parent;
END;

CREATE TRIGGER files_ad AFTER DELETE ON files
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
BEGIN
    UPDATE dirs SET
        num_files = num_files - 1,
        num_files_tree = num_files_tree - 1,
        size_tree = size_tree - OLD.size
    WHERE path = OLD.parent;
END;

CREATE TRIGGER files_au_path AFTER UPDATE OF path ON files
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND NEW.path != OLD.path
BEGIN
    UPDATE dirs SET
        num_files = num_files - 1,
        num_files_tree = num_files_tree - 1,
        size_tree = size_tree - OLD.size
    WHERE path = OLD.parent;
    INSERT OR IGNORE INTO dirs (path) VALUES (NEW.parent);
    UPDATE dirs SET
        num_files = num_files + 1,
        num_files_tree = num_files_tree + 1,
        size_tree = size_tree + NEW.size
    WHERE path = NEW.parent;
END;

CREATE TRIGGER files_au_size AFTER UPDATE OF size ON files
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND NEW.path = OLD.path AND NEW.size != OLD.size
BEGIN
    UPDATE dirs SET size_tree = size_tree + NEW.size - OLD.size
    WHERE path = NEW.parent;
END;

CREATE TRIGGER dirs_ai AFTER INSERT ON dirs
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND NEW.parent IS NOT NULL
BEGIN
    INSERT OR IGNORE INTO dirs (path) VALUES (NEW.parent);
    UPDATE dirs SET
        num_subdirs = num_subdirs + 1,
        num_files_tree = num_files_tree + NEW.num_files_tree,
        size_tree = size_tree + NEW.size_tree
    WHERE path = NEW.parent;
END;

CREATE TRIGGER dirs_ad AFTER DELETE ON dirs
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND OLD.parent IS NOT NULL
BEGIN
    UPDATE dirs SET
        num_subdirs = num_subdirs - 1,
        num_files_tree = num_files_tree - OLD.num_files_tree,
        size_tree = size_tree - OLD.size_tree
    WHERE path = OLD.parent;
END;

CREATE TRIGGER dirs_au_path AFTER UPDATE OF path ON dirs
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND NEW.path != OLD.path AND OLD.parent IS NOT NULL
BEGIN
    UPDATE dirs SET
        num_subdirs = num_subdirs - 1,
        num_files_tree = num_files_tree - OLD.num_files_tree,
        size_tree = size_tree - OLD.size_tree
    WHERE path = OLD.parent;
    INSERT OR IGNORE INTO dirs (path) VALUES (NEW.parent);
    UPDATE dirs SET
        num_subdirs = num_subdirs + 1,
        num_files_tree = num_files_tree + NEW.num_files_tree,
        size_tree = size_tree + NEW.size_tree
    WHERE path = NEW.parent;
END;

CREATE TRIGGER dirs_bubble AFTER UPDATE OF num_files_tree, size_tree ON dirs
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND NEW.path = OLD.path
     AND NEW.parent IS NOT NULL
     AND (NEW.num_files_tree != OLD.num_files_tree OR NEW.size_tree != OLD.size_tree)
BEGIN
    UPDATE dirs SET
        num_files_tree = num_files_tree + (NEW.num_files_tree - OLD.num_files_tree),
        size_tree = size_tree + (NEW.size_tree - OLD.size_tree)
    WHERE path = NEW.parent;
END;
"#;

pub(crate) const TRIGGER_NAMES: &[&str] = &[
    "files_bi_guard",
    "dirs_bi_guard",
    "files_ai",
    "files_ad",
    "files_au_path",
    "files_au_size",
    "dirs_ai",
    "dirs_ad",
    "dirs_au_path",
    "dirs_bubble",
];

/// Escape a literal path for use with SQLite GLOB, then append `/*` to
/// match the whole subtree.
const SUBTREE_GLOB: &str =
    "replace(replace(replace(?1, '[', '[[]'), '?', '[?]'), '*', '[*]') || '/*'";

/// Options for [`Index::open`].
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub readonly: bool,
    pub wal: bool,
    pub shard_size_limit: Option<u64>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            readonly: true,
            wal: false,
            shard_size_limit: None,
        }
    }
}

/// Direct-child and subtree counters of one directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirStats {
    pub num_files: u64,
    pub num_subdirs: u64,
    pub num_files_tree: u64,
    pub size_tree: u64,
}

/// A directory whose stored counters disagree with a recomputation.
#[derive(Debug, Clone)]
pub struct DirStatsMismatch {
    pub path: String,
    pub stored: DirStats,
    pub computed: DirStats,
}

/// Duplicate handling for index-level merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Error out on the first colliding path.
    Fail,
    /// Keep the first-seen entry, bytes and metadata both.
    KeepFirst,
}

/// Handle to the SQLite index of one archive.
pub struct Index {
    conn: Connection,
    readonly: bool,
    shard_size_limit_cache: Cell<Option<u64>>,
}

impl Index {
    /// Open (or, in a writable mode, create) the index at `path`.
    pub fn open(path: &Path, options: &IndexOptions) -> Result<Self> {
        let is_new = !path.exists();
        if is_new && options.readonly {
            return Err(Error::NotFound(path.display().to_string()));
        }
        let flags = if options.readonly {
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        conn.pragma_update(None, "temp_store", "memory")?;
        if options.readonly {
            conn.pragma_update(None, "cache_size", -64000)?;
        } else {
            conn.pragma_update(None, "recursive_triggers", true)?;
            if options.wal {
                let _: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get(0)
                })?;
            }
        }

        let index = Self {
            conn,
            readonly: options.readonly,
            shard_size_limit_cache: Cell::new(None),
        };

        if is_new {
            index.initialize(options.shard_size_limit)?;
        } else {
            index.check_schema_version()?;
            if let Some(limit) = options.shard_size_limit
                && !options.readonly
            {
                index.set_shard_size_limit(limit)?;
            }
        }
        Ok(index)
    }

    fn initialize(&self, shard_size_limit: Option<u64>) -> Result<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        self.conn.execute_batch(TRIGGERS_SQL)?;
        self.conn.execute(
            "INSERT INTO config (key, value_int) VALUES
                ('use_triggers', 1),
                ('shard_size_limit', ?1),
                ('schema_version_major', ?2),
                ('schema_version_minor', ?3)",
            params![
                shard_size_limit.unwrap_or(SHARD_SIZE_UNLIMITED) as i64,
                SCHEMA_VERSION_MAJOR,
                SCHEMA_VERSION_MINOR
            ],
        )?;
        let (uid, gid) = current_ids();
        self.conn.execute(
            "INSERT INTO dirs (path, uid, gid, mtime_ns) VALUES ('', ?1, ?2, ?3)",
            params![uid, gid, now_ns()],
        )?;
        debug!("created fresh index");
        Ok(())
    }

    fn check_schema_version(&self) -> Result<()> {
        let (major, minor) = self.schema_version()?;
        if major != SCHEMA_VERSION_MAJOR {
            return Err(Error::UnsupportedSchema { major, minor });
        }
        if minor < SCHEMA_VERSION_MINOR {
            warn!(
                major,
                minor,
                "index schema is outdated, directory statistics may be wrong; run an upgrade"
            );
        } else if minor > SCHEMA_VERSION_MINOR {
            warn!(
                major,
                minor,
                "index schema is newer than this reader; unknown columns will be ignored"
            );
        }
        Ok(())
    }

    /// Schema version recorded in the config table. An index without a
    /// config table reports major -1 (pre-versioned).
    pub fn schema_version(&self) -> Result<(i64, i64)> {
        let has_config: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_schema WHERE type = 'table' AND name = 'config'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if has_config.is_none() {
            return Ok((-1, 0));
        }
        let major = self
            .config_int("schema_version_major")?
            .unwrap_or(SCHEMA_VERSION_MAJOR - 1);
        let minor = self.config_int("schema_version_minor")?.unwrap_or(0);
        Ok((major, minor))
    }

    pub(crate) fn config_int(&self, key: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value_int FROM config WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?
            .flatten())
    }

    pub(crate) fn set_config_int(&self, key: &str, value: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO config (key, value_int) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value_int = excluded.value_int",
            params![key, value],
        )?;
        Ok(())
    }

    // READING

    pub fn lookup_file(&self, path: &str) -> Result<FileInfo> {
        let path = paths::normalize_file(path)?;
        self.conn
            .query_row(
                &format!("SELECT {FILE_COLS} FROM files WHERE path = ?1"),
                [&path],
                file_from_row,
            )
            .optional()?
            .ok_or(Error::NotFound(path))
    }

    pub fn lookup_dir(&self, path: &str) -> Result<DirInfo> {
        let path = paths::normalize(path)?;
        self.conn
            .query_row(
                &format!("SELECT {DIR_COLS} FROM dirs WHERE path = ?1"),
                [&path],
                dir_from_row,
            )
            .optional()?
            .ok_or(Error::NotFound(path))
    }

    /// Look up a path as a file first, then as a directory.
    pub fn lookup(&self, path: &str) -> Result<EntryInfo> {
        match self.lookup_file(path) {
            Ok(info) => Ok(EntryInfo::File(info)),
            Err(Error::NotFound(_)) | Err(Error::InvalidPath(_)) => {
                self.lookup_dir(path).map(EntryInfo::Dir)
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_file(&self, path: &str) -> Result<bool> {
        let Ok(path) = paths::normalize_file(path) else {
            return Ok(false);
        };
        Ok(self
            .conn
            .query_row("SELECT 1 FROM files WHERE path = ?1", [&path], |_| Ok(()))
            .optional()?
            .is_some())
    }

    pub fn is_dir(&self, path: &str) -> Result<bool> {
        let Ok(path) = paths::normalize(path) else {
            return Ok(false);
        };
        Ok(self
            .conn
            .query_row("SELECT 1 FROM dirs WHERE path = ?1", [&path], |_| Ok(()))
            .optional()?
            .is_some())
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.is_file(path)? || self.is_dir(path)?)
    }

    /// Number of files in the whole archive, from the root's tree counter.
    pub fn num_files(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT num_files_tree FROM dirs WHERE path = ''",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn num_dirs(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM dirs", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Total size of all file contents, from the root's tree counter.
    pub fn total_size(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT size_tree FROM dirs WHERE path = ''",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    // LISTING

    /// Immediate files of a directory.
    pub fn list_files_in(&self, dirpath: &str, order: Order) -> Result<Vec<FileInfo>> {
        let dirpath = paths::normalize(dirpath)?;
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {FILE_COLS} FROM files WHERE parent = ?1{}",
            order.as_sql()
        ))?;
        let rows = stmt.query_map([&dirpath], file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Immediate subdirectories of a directory.
    pub fn list_subdirs(&self, dirpath: &str, order: Order) -> Result<Vec<DirInfo>> {
        let dirpath = paths::normalize(dirpath)?;
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {DIR_COLS} FROM dirs WHERE parent = ?1{}",
            order.as_sql()
        ))?;
        let rows = stmt.query_map([&dirpath], dir_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Names of all immediate entries, interleaved, lexicographic by path.
    pub fn listdir_names(&self, dirpath: &str) -> Result<Vec<String>> {
        let info = self.lookup_dir(dirpath)?;
        let mut stmt = self.conn.prepare_cached(
            "SELECT path FROM dirs WHERE parent = ?1
             UNION ALL
             SELECT path FROM files WHERE parent = ?1
             ORDER BY path",
        )?;
        let rows = stmt.query_map([&info.path], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(paths::basename(&row?).to_string());
        }
        Ok(names)
    }

    /// Immediate entries as infos, interleaved, lexicographic by path.
    pub fn listdir_infos(&self, dirpath: &str) -> Result<Vec<EntryInfo>> {
        let info = self.lookup_dir(dirpath)?;
        let mut out: Vec<EntryInfo> = self
            .list_subdirs(&info.path, Order::Path)?
            .into_iter()
            .map(EntryInfo::Dir)
            .chain(
                self.list_files_in(&info.path, Order::Path)?
                    .into_iter()
                    .map(EntryInfo::File),
            )
            .collect();
        out.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(out)
    }

    /// One page of files in address order, strictly after `after`
    /// (`(shard, offset, path)` — path breaks ties between zero-size
    /// files sharing an address). Drives the lazy whole-archive scans.
    pub fn files_after_address(
        &self,
        after: Option<(u32, u64, &str)>,
        limit: usize,
    ) -> Result<Vec<FileInfo>> {
        let (shard, offset, path) = match after {
            Some((s, o, p)) => (s as i64, o as i64, p.to_string()),
            None => (-1, -1, String::new()),
        };
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {FILE_COLS} FROM files
             WHERE (shard, offset, path) > (?1, ?2, ?3)
             ORDER BY shard, offset, path LIMIT ?4"
        ))?;
        let rows = stmt.query_map(params![shard, offset, path, limit as i64], file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// One page of files in descending address order, strictly before
    /// `before`. `None` starts from the archive's end.
    pub fn files_before_address(
        &self,
        before: Option<(u32, u64, &str)>,
        limit: usize,
    ) -> Result<Vec<FileInfo>> {
        let mut stmt;
        let rows = match before {
            Some((s, o, p)) => {
                stmt = self.conn.prepare_cached(&format!(
                    "SELECT {FILE_COLS} FROM files
                     WHERE (shard, offset, path) < (?1, ?2, ?3)
                     ORDER BY shard DESC, offset DESC, path DESC LIMIT ?4"
                ))?;
                stmt.query_map(
                    params![s as i64, o as i64, p.to_string(), limit as i64],
                    file_from_row,
                )?
            }
            None => {
                stmt = self.conn.prepare_cached(&format!(
                    "SELECT {FILE_COLS} FROM files
                     ORDER BY shard DESC, offset DESC, path DESC LIMIT ?1"
                ))?;
                stmt.query_map(params![limit as i64], file_from_row)?
            }
        };
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// One page of files in path order, strictly after `after`.
    pub fn files_after_path(&self, after: Option<&str>, limit: usize) -> Result<Vec<FileInfo>> {
        let after = after.unwrap_or("");
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {FILE_COLS} FROM files WHERE path > ?1 ORDER BY path LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![after, limit as i64], file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// A random sample of file entries.
    pub fn random_files(&self, limit: usize) -> Result<Vec<FileInfo>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {FILE_COLS} FROM files ORDER BY random() LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// All directory entries. Directories are few compared to files, so
    /// this one is not paginated.
    pub fn all_dirs(&self, order: Order) -> Result<Vec<DirInfo>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {DIR_COLS} FROM dirs{}", order.as_sql()))?;
        let rows = stmt.query_map([], dir_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Paths matching a glob pattern, in lexicographic order. The scan is
    /// narrowed to the pattern's literal prefix before the compiled regex
    /// filter runs.
    pub fn glob_paths(
        &self,
        pattern: &str,
        recursive: bool,
        only_files: bool,
    ) -> Result<Vec<String>> {
        let compiled = GlobPattern::compile(pattern, recursive)?;
        let prefix = glob::literal_prefix(pattern);
        let hi = format!("{prefix}\u{10FFFF}");
        let sql = if only_files {
            "SELECT path FROM files WHERE path >= ?1 AND path < ?2 ORDER BY path"
        } else {
            "SELECT path FROM files WHERE path >= ?1 AND path < ?2
             UNION
             SELECT path FROM dirs WHERE path >= ?1 AND path < ?2
             ORDER BY path"
        };
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![prefix, hi], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let path = row?;
            if compiled.matches(&path) {
                out.push(path);
            }
        }
        Ok(out)
    }

    // SHARD BOOKKEEPING

    /// One past the last referenced byte in a shard.
    pub fn logical_shard_end(&self, shard: u32) -> Result<u64> {
        let end: i64 = self.conn.query_row(
            "SELECT coalesce(MAX(offset + size), 0) FROM files WHERE shard = ?1",
            [shard as i64],
            |row| row.get(0),
        )?;
        Ok(end as u64)
    }

    /// Highest shard number referenced by any file, plus one. Trailing
    /// logically empty shards are not counted.
    pub fn num_used_shards(&self) -> Result<u32> {
        let n: i64 = self.conn.query_row(
            "SELECT coalesce(MAX(shard), -1) + 1 FROM files",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }

    pub fn shard_size_limit(&self) -> Result<u64> {
        if let Some(limit) = self.shard_size_limit_cache.get() {
            return Ok(limit);
        }
        let limit = self
            .config_int("shard_size_limit")?
            .unwrap_or(SHARD_SIZE_UNLIMITED as i64) as u64;
        self.shard_size_limit_cache.set(Some(limit));
        Ok(limit)
    }

    /// Change the shard size limit. Shrinking below the largest existing
    /// logical shard end is refused; reshard first.
    pub fn set_shard_size_limit(&self, limit: u64) -> Result<()> {
        self.check_writable()?;
        if limit == self.shard_size_limit()? {
            return Ok(());
        }
        let mut largest = 0;
        for shard in 0..self.num_used_shards()? {
            largest = largest.max(self.logical_shard_end(shard)?);
        }
        if limit < largest {
            return Err(Error::Integrity(format!(
                "shard size limit {limit} is below the largest existing shard end {largest}; \
                 reshard the archive instead"
            )));
        }
        self.set_shard_size_limit_unchecked(limit)
    }

    pub(crate) fn set_shard_size_limit_unchecked(&self, limit: u64) -> Result<()> {
        self.set_config_int("shard_size_limit", limit as i64)?;
        self.shard_size_limit_cache.set(Some(limit));
        Ok(())
    }

    // WRITING

    pub fn add_file(&self, info: &FileInfo) -> Result<()> {
        self.check_writable()?;
        let path = paths::normalize_file(&info.path)?;
        let mut stmt = self.conn.prepare_cached(&format!(
            "INSERT INTO files ({FILE_COLS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ))?;
        stmt.execute(params![
            path,
            info.shard as i64,
            info.offset as i64,
            info.size as i64,
            info.crc32c.map(|v| v as i64),
            info.mode.map(|v| v as i64),
            info.uid.map(|v| v as i64),
            info.gid.map(|v| v as i64),
            info.mtime_ns,
        ])
        .map_err(|e| map_constraint_err(e, &path))?;
        Ok(())
    }

    /// Insert many files with one prepared statement, in one transaction.
    pub fn add_files(&self, infos: &[FileInfo]) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO files ({FILE_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ))?;
            for info in infos {
                let path = paths::normalize_file(&info.path)?;
                stmt.execute(params![
                    path,
                    info.shard as i64,
                    info.offset as i64,
                    info.size as i64,
                    info.crc32c.map(|v| v as i64),
                    info.mode.map(|v| v as i64),
                    info.uid.map(|v| v as i64),
                    info.gid.map(|v| v as i64),
                    info.mtime_ns,
                ])
                .map_err(|e| map_constraint_err(e, &path))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn add_dir(&self, info: &DirInfo, exist_ok: bool) -> Result<()> {
        self.check_writable()?;
        let path = paths::normalize(&info.path)?;
        if path.is_empty() {
            if !exist_ok {
                return Err(Error::AlreadyExists(path));
            }
            self.conn.execute(
                "UPDATE dirs SET mode = ?1, uid = ?2, gid = ?3, mtime_ns = ?4 WHERE path = ''",
                params![
                    info.mode.map(|v| v as i64),
                    info.uid.map(|v| v as i64),
                    info.gid.map(|v| v as i64),
                    info.mtime_ns
                ],
            )?;
            return Ok(());
        }
        let result = self.conn.execute(
            "INSERT INTO dirs (path, mode, uid, gid, mtime_ns) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                path,
                info.mode.map(|v| v as i64),
                info.uid.map(|v| v as i64),
                info.gid.map(|v| v as i64),
                info.mtime_ns
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) => match map_constraint_err(e, &path) {
                Error::AlreadyExists(_) if exist_ok => Ok(()),
                other => Err(other),
            },
        }
    }

    /// Remove a file entry, returning what was removed.
    pub fn remove_file(&self, path: &str) -> Result<FileInfo> {
        self.check_writable()?;
        let info = self.lookup_file(path)?;
        self.conn
            .execute("DELETE FROM files WHERE path = ?1", [&info.path])?;
        Ok(info)
    }

    /// Remove an empty directory.
    pub fn remove_empty_dir(&self, path: &str) -> Result<()> {
        self.check_writable()?;
        let info = self.lookup_dir(path)?;
        if info.path.is_empty() {
            return Err(Error::InvalidPath("cannot remove the root directory".into()));
        }
        if info.num_entries() != 0 {
            return Err(Error::DirectoryNotEmpty(info.path));
        }
        self.conn
            .execute("DELETE FROM dirs WHERE path = ?1", [&info.path])?;
        Ok(())
    }

    /// Remove a directory and everything under it. Descendants are bulk
    /// deleted with triggers off; deleting the directory row itself then
    /// transfers its recorded subtree stats out of the ancestors.
    pub fn remove_recursively(&self, path: &str) -> Result<()> {
        self.check_writable()?;
        let info = self.lookup_dir(path)?;
        if info.path.is_empty() {
            return Err(Error::InvalidPath("cannot remove the root directory".into()));
        }
        let tx = self.conn.unchecked_transaction()?;
        if info.num_files_tree > 0 || info.num_subdirs > 0 {
            self.with_triggers_off(|index| {
                index.conn.execute(
                    &format!("DELETE FROM files WHERE path GLOB {SUBTREE_GLOB}"),
                    [&info.path],
                )?;
                index.conn.execute(
                    &format!("DELETE FROM dirs WHERE path GLOB {SUBTREE_GLOB}"),
                    [&info.path],
                )?;
                Ok(())
            })?;
        }
        self.conn
            .execute("DELETE FROM dirs WHERE path = ?1", [&info.path])?;
        tx.commit()?;
        Ok(())
    }

    pub fn rename_file(&self, old: &str, new: &str, allow_overwrite: bool) -> Result<()> {
        self.check_writable()?;
        let old = paths::normalize_file(old)?;
        let new = paths::normalize_file(new)?;
        if old == new {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        if self.is_file(&new)? {
            if !allow_overwrite {
                return Err(Error::AlreadyExists(new));
            }
            self.remove_file(&new)?;
        }
        if self.is_dir(&new)? {
            return Err(Error::IsADirectory(new));
        }
        let changed = self
            .conn
            .execute(
                "UPDATE files SET path = ?1 WHERE path = ?2",
                params![new, old],
            )
            .map_err(|e| map_constraint_err(e, &new))?;
        if changed == 0 {
            return Err(Error::NotFound(old));
        }
        tx.commit()?;
        Ok(())
    }

    /// Rename a directory. The row rename runs with triggers on, which
    /// transfers the subtree stats between the old and new parents; the
    /// descendants' path rewrite then runs with triggers off.
    pub fn rename_dir(&self, old: &str, new: &str, allow_overwrite: bool) -> Result<()> {
        self.check_writable()?;
        let old = paths::normalize(old)?;
        let new = paths::normalize_file(new)?;
        if old == new {
            return Ok(());
        }
        if old.is_empty() {
            return Err(Error::InvalidPath("cannot rename the root directory".into()));
        }
        let info = self.lookup_dir(&old)?;
        let tx = self.conn.unchecked_transaction()?;
        if self.is_file(&new)? {
            return Err(Error::NotADirectory(new));
        }
        if self.is_dir(&new)? {
            if !allow_overwrite {
                return Err(Error::AlreadyExists(new));
            }
            self.remove_empty_dir(&new)?;
        }
        self.conn
            .execute(
                "UPDATE dirs SET path = ?1 WHERE path = ?2",
                params![new, old],
            )
            .map_err(|e| map_constraint_err(e, &new))?;
        if info.num_files_tree > 0 || info.num_subdirs > 0 {
            self.with_triggers_off(|index| {
                index.conn.execute(
                    &format!(
                        "UPDATE files SET path = ?2 || substr(path, length(?1) + 1)
                         WHERE path GLOB {SUBTREE_GLOB}"
                    ),
                    params![old, new],
                )?;
                index.conn.execute(
                    &format!(
                        "UPDATE dirs SET path = ?2 || substr(path, length(?1) + 1)
                         WHERE path GLOB {SUBTREE_GLOB}"
                    ),
                    params![old, new],
                )?;
                Ok(())
            })?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Point an entry at a new shard address after its bytes moved.
    pub fn update_file_location(&self, path: &str, shard: u32, offset: u64) -> Result<()> {
        self.check_writable()?;
        let changed = self.conn.execute(
            "UPDATE files SET shard = ?1, offset = ?2 WHERE path = ?3",
            params![shard as i64, offset as i64, path],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(path.to_string()));
        }
        Ok(())
    }

    /// Batch variant of [`Self::update_file_location`], one transaction.
    pub fn update_file_locations(&self, moves: &[(String, u32, u64)]) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx
                .prepare_cached("UPDATE files SET shard = ?1, offset = ?2 WHERE path = ?3")?;
            for (path, shard, offset) in moves {
                stmt.execute(params![*shard as i64, *offset as i64, path])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Shift every file in `[start, end)` of `old_shard` to `new_shard`
    /// with offsets displaced by `delta`. Used by smart defrag to move a
    /// contiguous run with one statement.
    pub fn shift_file_range(
        &self,
        old_shard: u32,
        start: u64,
        end: u64,
        new_shard: u32,
        delta: i64,
    ) -> Result<usize> {
        self.check_writable()?;
        Ok(self.conn.execute(
            "UPDATE files SET shard = ?1, offset = offset + ?2
             WHERE shard = ?3 AND offset >= ?4 AND offset < ?5",
            params![
                new_shard as i64,
                delta,
                old_shard as i64,
                start as i64,
                end as i64
            ],
        )?)
    }

    /// Set the mode of a file or directory.
    pub fn set_mode(&self, path: &str, mode: u32) -> Result<()> {
        self.update_metadata(path, "mode = ?2", params![path, mode as i64])
    }

    /// Set the owner of a file or directory.
    pub fn set_owner(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.update_metadata(
            path,
            "uid = ?2, gid = ?3",
            params![path, uid as i64, gid as i64],
        )
    }

    /// Set the modification time of a file or directory.
    pub fn set_mtime_ns(&self, path: &str, mtime_ns: i64) -> Result<()> {
        self.update_metadata(path, "mtime_ns = ?2", params![path, mtime_ns])
    }

    fn update_metadata(
        &self,
        path: &str,
        set_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<()> {
        self.check_writable()?;
        let changed = self.conn.execute(
            &format!("UPDATE files SET {set_clause} WHERE path = ?1"),
            params,
        )?;
        if changed > 0 {
            return Ok(());
        }
        let changed = self.conn.execute(
            &format!("UPDATE dirs SET {set_clause} WHERE path = ?1"),
            params,
        )?;
        if changed == 0 {
            return Err(Error::NotFound(path.to_string()));
        }
        Ok(())
    }

    // STATS ENGINE

    pub fn triggers_enabled(&self) -> Result<bool> {
        Ok(self.config_int("use_triggers")? == Some(1))
    }

    pub fn set_triggers_enabled(&self, enabled: bool) -> Result<()> {
        self.check_writable()?;
        self.set_config_int("use_triggers", i64::from(enabled))
    }

    /// Run `f` with live stat propagation off, restoring the previous
    /// state afterwards even if `f` fails. Callers are responsible for
    /// rebuilding stats when they are done (see [`Self::rebuild_stats`]).
    pub fn with_triggers_off<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        if !self.triggers_enabled()? {
            return f(self);
        }
        self.set_triggers_enabled(false)?;
        let result = f(self);
        let restored = self.set_triggers_enabled(true);
        match (result, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
        }
    }

    /// Materialize every missing ancestor directory of the current file
    /// and directory rows, up to and including the root.
    pub fn update_dirs(&self) -> Result<()> {
        self.check_writable()?;
        self.conn.execute(
            "WITH RECURSIVE
                all_ancestors AS (
                    SELECT DISTINCT parent AS path FROM files WHERE parent != ''
                    UNION
                    SELECT DISTINCT parent AS path FROM dirs WHERE parent IS NOT NULL
                    UNION
                    SELECT rtrim(rtrim(path, replace(path, '/', '')), '/')
                    FROM all_ancestors
                    WHERE path LIKE '%/%'
                )
            INSERT OR IGNORE INTO dirs (path)
            SELECT path FROM all_ancestors
            UNION ALL SELECT ''",
            [],
        )?;
        Ok(())
    }

    /// Recompute every directory's counters bottom-up. The tree counters
    /// come from a recursive CTE that expands each file to all its
    /// ancestors, which is O(files x depth) rather than O(dirs x files).
    pub fn update_treestats(&self) -> Result<()> {
        self.check_writable()?;
        debug!("recomputing directory tree statistics");
        self.with_triggers_off(|index| {
            index.conn.execute_batch(
                r#"
                CREATE TEMPORARY TABLE tmp_treestats AS
                    WITH RECURSIVE file_ancestors AS (
                        SELECT parent AS ancestor, size FROM files
                        UNION ALL
                        SELECT rtrim(rtrim(ancestor, replace(ancestor, '/', '')), '/'), size
                        FROM file_ancestors
                        WHERE ancestor != ''
                    )
                    SELECT ancestor AS path,
                           SUM(size) AS size_tree,
                           COUNT(*) AS num_files_tree
                    FROM file_ancestors
                    GROUP BY ancestor;

                CREATE TEMPORARY TABLE tmp_file_counts AS
                    SELECT parent AS path, COUNT(*) AS num_files
                    FROM files GROUP BY parent;

                CREATE TEMPORARY TABLE tmp_subdir_counts AS
                    SELECT parent AS path, COUNT(*) AS num_subdirs
                    FROM dirs GROUP BY parent;

                UPDATE dirs
                SET num_files = COALESCE(fc.num_files, 0),
                    num_subdirs = COALESCE(sc.num_subdirs, 0),
                    size_tree = COALESCE(ts.size_tree, 0),
                    num_files_tree = COALESCE(ts.num_files_tree, 0)
                FROM dirs d
                LEFT JOIN tmp_file_counts fc ON fc.path = d.path
                LEFT JOIN tmp_subdir_counts sc ON sc.path = d.path
                LEFT JOIN tmp_treestats ts ON ts.path = d.path
                WHERE dirs.path = d.path;

                DROP TABLE tmp_treestats;
                DROP TABLE tmp_file_counts;
                DROP TABLE tmp_subdir_counts;
                "#,
            )?;
            Ok(())
        })
    }

    /// Ancestor materialization plus full counter recomputation, the
    /// closing step of every bulk section.
    pub fn rebuild_stats(&self) -> Result<()> {
        self.update_dirs()?;
        self.update_treestats()
    }

    // VERIFICATION SUPPORT

    /// Directories whose stored counters disagree with a recomputation.
    pub fn dir_stats_mismatches(&self) -> Result<Vec<DirStatsMismatch>> {
        let mut stmt = self.conn.prepare(
            r#"
            WITH RECURSIVE file_ancestors AS (
                SELECT parent AS ancestor, size FROM files
                UNION ALL
                SELECT rtrim(rtrim(ancestor, replace(ancestor, '/', '')), '/'), size
                FROM file_ancestors
                WHERE ancestor != ''
            ),
            treestats AS (
                SELECT ancestor AS path, SUM(size) AS size_tree, COUNT(*) AS num_files_tree
                FROM file_ancestors GROUP BY ancestor
            ),
            file_counts AS (
                SELECT parent AS path, COUNT(*) AS num_files FROM files GROUP BY parent
            ),
            subdir_counts AS (
                SELECT parent AS path, COUNT(*) AS num_subdirs FROM dirs GROUP BY parent
            )
            SELECT d.path,
                   d.num_files, COALESCE(fc.num_files, 0),
                   d.num_subdirs, COALESCE(sc.num_subdirs, 0),
                   d.num_files_tree, COALESCE(ts.num_files_tree, 0),
                   d.size_tree, COALESCE(ts.size_tree, 0)
            FROM dirs d
            LEFT JOIN file_counts fc ON fc.path = d.path
            LEFT JOIN subdir_counts sc ON sc.path = d.path
            LEFT JOIN treestats ts ON ts.path = d.path
            WHERE d.num_files != COALESCE(fc.num_files, 0)
               OR d.num_subdirs != COALESCE(sc.num_subdirs, 0)
               OR d.num_files_tree != COALESCE(ts.num_files_tree, 0)
               OR d.size_tree != COALESCE(ts.size_tree, 0)
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DirStatsMismatch {
                path: row.get(0)?,
                stored: DirStats {
                    num_files: row.get::<_, i64>(1)? as u64,
                    num_subdirs: row.get::<_, i64>(3)? as u64,
                    num_files_tree: row.get::<_, i64>(5)? as u64,
                    size_tree: row.get::<_, i64>(7)? as u64,
                },
                computed: DirStats {
                    num_files: row.get::<_, i64>(2)? as u64,
                    num_subdirs: row.get::<_, i64>(4)? as u64,
                    num_files_tree: row.get::<_, i64>(6)? as u64,
                    size_tree: row.get::<_, i64>(8)? as u64,
                },
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Output of the storage engine's own integrity check, minus the
    /// all-clear row.
    pub fn integrity_check(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("PRAGMA integrity_check")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut problems = Vec::new();
        for row in rows {
            let line = row?;
            if line != "ok" {
                problems.push(line);
            }
        }
        Ok(problems)
    }

    /// Paths present in both the files and the dirs table.
    pub fn file_dir_conflicts(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM dirs WHERE path IN (SELECT path FROM files)")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Pairs of files whose byte ranges overlap within a shard. Zero-size
    /// files are exempt: they occupy no bytes and may share an address.
    pub fn overlapping_files(&self) -> Result<Vec<(u32, String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT shard, prev_path, path FROM (
                 SELECT shard, offset, path,
                        LAG(offset + size) OVER w AS prev_end,
                        LAG(path) OVER w AS prev_path
                 FROM files WHERE size > 0
                 WINDOW w AS (PARTITION BY shard ORDER BY offset, path)
             )
             WHERE prev_end IS NOT NULL AND offset < prev_end",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)? as u32,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // DEFRAG SUPPORT

    /// Unreferenced ranges per shard, in address order. With
    /// `to_shard_limit`, the trailing range of each shard up to the shard
    /// size limit counts as a gap too (that is the defrag view; the stats
    /// view only wants gaps between files). Zero-size entries occupy no
    /// bytes and are invisible here.
    pub fn gaps(&self, to_shard_limit: Option<u64>) -> Result<Vec<Gap>> {
        let limit = to_shard_limit.unwrap_or(0) as i64;
        let sql = if to_shard_limit.is_some() {
            "WITH first_gaps AS (
                 SELECT shard, 0 AS offset, MIN(offset) AS size
                 FROM files WHERE size > 0 GROUP BY shard
             ),
             nonfirst_gaps AS (
                 SELECT shard,
                        (offset + size) AS offset,
                        coalesce(
                            lead(offset, 1) OVER (PARTITION BY shard ORDER BY offset),
                            ?1
                        ) - (offset + size) AS size
                 FROM files WHERE size > 0
             ),
             all_gaps AS (SELECT * FROM first_gaps UNION ALL SELECT * FROM nonfirst_gaps)
             SELECT shard, offset, size FROM all_gaps
             WHERE size > 0 ORDER BY shard, offset"
        } else {
            "WITH first_gaps AS (
                 SELECT shard, 0 AS offset, MIN(offset) AS size
                 FROM files WHERE size > 0 GROUP BY shard
             ),
             nonfirst_gaps AS (
                 SELECT shard,
                        (offset + size) AS offset,
                        lead(offset, 1) OVER (PARTITION BY shard ORDER BY offset)
                            - (offset + size) AS size
                 FROM files WHERE size > 0
             ),
             all_gaps AS (SELECT * FROM first_gaps UNION ALL SELECT * FROM nonfirst_gaps)
             SELECT shard, offset, size FROM all_gaps
             WHERE size > 0 ORDER BY shard, offset"
        };
        let mut stmt = self.conn.prepare_cached(sql)?;
        let map = |row: &Row| {
            Ok(Gap {
                shard: row.get::<_, i64>(0)? as u32,
                offset: row.get::<_, i64>(1)? as u64,
                size: row.get::<_, i64>(2)? as u64,
            })
        };
        let rows = if to_shard_limit.is_some() {
            stmt.query_map([limit], map)?
        } else {
            stmt.query_map([], map)?
        };
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// File size at the given quantile (0..1), the outlier threshold used
    /// by quick defrag to tell huge stuck files from exhausted gaps.
    pub fn size_quantile(&self, quantile: f64) -> Result<Option<u64>> {
        let size: Option<i64> = self
            .conn
            .query_row(
                "SELECT size FROM files ORDER BY size
                 LIMIT 1 OFFSET (SELECT CAST(COUNT(*) * ?1 AS INTEGER) FROM files)",
                [quantile],
                |row| row.get(0),
            )
            .optional()?;
        Ok(size.map(|s| s as u64))
    }

    /// How many zero-size file entries exist.
    pub fn num_zero_size_files(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM files WHERE size = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Point every zero-size entry at `(0, 0)`. Empty files occupy no
    /// bytes, and sharing an address is explicitly fine for them; parking
    /// them at the origin keeps them clear of the contiguous-chunk walk.
    pub fn relocate_zero_size_files(&self) -> Result<u64> {
        self.check_writable()?;
        let changed = self.conn.execute(
            "UPDATE files SET shard = 0, offset = 0
             WHERE size = 0 AND (shard != 0 OR offset != 0)",
            [],
        )?;
        Ok(changed as u64)
    }

    /// The next contiguous run of files at or after `(min_shard,
    /// min_offset)` whose total size fits in `max_size`. Walks file
    /// adjacency with a recursive CTE, stopping at the first gap.
    /// Zero-size entries are skipped; they carry no bytes to move.
    pub fn next_contiguous_chunk(
        &self,
        min_shard: u32,
        min_offset: u64,
        max_size: u64,
    ) -> Result<Option<ChunkInfo>> {
        let mut stmt = self.conn.prepare_cached(
            "WITH RECURSIVE
             first_file AS (
                 SELECT shard, offset, size, offset + size AS end_offset
                 FROM files
                 WHERE size > 0 AND (shard > ?1 OR (shard = ?1 AND offset >= ?2))
                 ORDER BY shard, offset
                 LIMIT 1
             ),
             chunk_files AS (
                 SELECT shard, offset, size, end_offset, offset AS chunk_start
                 FROM first_file
                 WHERE size <= ?3

                 UNION ALL

                 SELECT f.shard, f.offset, f.size, f.offset + f.size, c.chunk_start
                 FROM chunk_files c
                 JOIN files f ON f.shard = c.shard AND f.offset = c.end_offset
                 WHERE f.size > 0 AND f.offset + f.size <= c.chunk_start + ?3
             )
             SELECT MIN(shard), MIN(offset), MAX(end_offset), COUNT(*)
             FROM chunk_files",
        )?;
        let row = stmt.query_row(
            params![min_shard as i64, min_offset as i64, max_size as i64],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;
        match row {
            (Some(shard), Some(start), Some(end), count) if count > 0 => Ok(Some(ChunkInfo {
                shard: shard as u32,
                start_offset: start as u64,
                end_offset: end as u64,
                file_count: count as u64,
            })),
            _ => Ok(None),
        }
    }

    // MERGE SUPPORT

    /// Merge the file and directory rows of another barecat index into
    /// this one, with every source shard number displaced by
    /// `shard_base` and offsets unchanged. This is the symlink-merge
    /// path: no bytes move, only metadata. Runs with triggers off; the
    /// caller rebuilds stats once all sources are in.
    pub fn merge_from_index(
        &self,
        source_index: &Path,
        shard_base: u32,
        policy: DuplicatePolicy,
    ) -> Result<()> {
        self.check_writable()?;
        let source = source_index.to_string_lossy();
        self.conn.execute(
            "ATTACH DATABASE ?1 AS sourcedb",
            [format!("file:{source}?mode=ro")],
        )?;
        let result = self.with_triggers_off(|index| {
            let tx = index.conn.unchecked_transaction()?;
            let maybe_ignore = match policy {
                DuplicatePolicy::Fail => "",
                DuplicatePolicy::KeepFirst => "OR IGNORE",
            };
            // dir-vs-file collisions in either direction are always errors
            let conflict: Option<String> = index
                .conn
                .query_row(
                    "SELECT path FROM sourcedb.files
                     WHERE path IN (SELECT path FROM main.dirs)
                     UNION ALL
                     SELECT path FROM sourcedb.dirs
                     WHERE path IN (SELECT path FROM main.files)
                     LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(path) = conflict {
                return Err(Error::NotADirectory(path));
            }
            index.conn.execute(
                "INSERT INTO dirs (path, mode, uid, gid, mtime_ns)
                 SELECT path, mode, uid, gid, mtime_ns FROM sourcedb.dirs
                 WHERE true
                 ON CONFLICT (path) DO UPDATE SET
                     mode = COALESCE(dirs.mode | excluded.mode,
                                     COALESCE(dirs.mode, 0) | excluded.mode,
                                     dirs.mode | COALESCE(excluded.mode, 0)),
                     uid = COALESCE(dirs.uid, excluded.uid),
                     gid = COALESCE(dirs.gid, excluded.gid),
                     mtime_ns = COALESCE(
                         MAX(dirs.mtime_ns, excluded.mtime_ns),
                         MAX(COALESCE(dirs.mtime_ns, 0), excluded.mtime_ns),
                         MAX(dirs.mtime_ns, COALESCE(excluded.mtime_ns, 0)))",
                [],
            )?;
            index
                .conn
                .execute(
                    &format!(
                        "INSERT {maybe_ignore} INTO files ({FILE_COLS})
                         SELECT path, shard + ?1, offset, size, crc32c,
                                mode, uid, gid, mtime_ns
                         FROM sourcedb.files"
                    ),
                    [shard_base as i64],
                )
                .map_err(|e| match e {
                    rusqlite::Error::SqliteFailure(_, Some(ref msg))
                        if msg.contains("UNIQUE constraint failed") =>
                    {
                        Error::AlreadyExists("duplicate path between archives".into())
                    }
                    other => other.into(),
                })?;
            tx.commit()?;
            Ok(())
        });
        let detached = self.conn.execute("DETACH DATABASE sourcedb", []);
        result?;
        detached?;
        Ok(())
    }

    /// Insert a directory row or merge its metadata into an existing one
    /// (mode is OR-ed, owner keeps first, mtime takes the max).
    pub fn upsert_dir_metadata(&self, info: &DirInfo) -> Result<()> {
        self.check_writable()?;
        let path = paths::normalize(&info.path)?;
        self.conn
            .execute(
                "INSERT INTO dirs (path, mode, uid, gid, mtime_ns)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (path) DO UPDATE SET
                     mode = COALESCE(dirs.mode | excluded.mode,
                                     COALESCE(dirs.mode, 0) | excluded.mode,
                                     dirs.mode | COALESCE(excluded.mode, 0)),
                     uid = COALESCE(dirs.uid, excluded.uid),
                     gid = COALESCE(dirs.gid, excluded.gid),
                     mtime_ns = COALESCE(
                         MAX(dirs.mtime_ns, excluded.mtime_ns),
                         MAX(COALESCE(dirs.mtime_ns, 0), excluded.mtime_ns),
                         MAX(dirs.mtime_ns, COALESCE(excluded.mtime_ns, 0)))",
                params![
                    path,
                    info.mode.map(|v| v as i64),
                    info.uid.map(|v| v as i64),
                    info.gid.map(|v| v as i64),
                    info.mtime_ns
                ],
            )
            .map_err(|e| map_constraint_err(e, &path))?;
        Ok(())
    }

    // LIFECYCLE

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Commit outstanding work and run the planner's maintenance pragma.
    pub fn close(self) -> Result<()> {
        if !self.readonly {
            self.conn.execute_batch("PRAGMA optimize")?;
        }
        self.conn
            .close()
            .map_err(|(_conn, e)| Error::Sqlite(e))?;
        Ok(())
    }

    /// ANALYZE + VACUUM, for after heavy maintenance.
    pub fn optimize(&self) -> Result<()> {
        self.check_writable()?;
        self.conn.execute_batch("ANALYZE; VACUUM; PRAGMA optimize;")?;
        Ok(())
    }
}

/// A contiguous run of files, as found by the smart-defrag chunk scan.
#[derive(Debug, Clone, Copy)]
pub struct ChunkInfo {
    pub shard: u32,
    pub start_offset: u64,
    pub end_offset: u64,
    pub file_count: u64,
}

impl ChunkInfo {
    pub fn total_size(&self) -> u64 {
        self.end_offset - self.start_offset
    }
}

fn file_from_row(row: &Row) -> rusqlite::Result<FileInfo> {
    Ok(FileInfo {
        path: row.get(0)?,
        shard: row.get::<_, i64>(1)? as u32,
        offset: row.get::<_, i64>(2)? as u64,
        size: row.get::<_, i64>(3)? as u64,
        crc32c: row.get::<_, Option<i64>>(4)?.map(|v| v as u32),
        mode: row.get::<_, Option<i64>>(5)?.map(|v| v as u32),
        uid: row.get::<_, Option<i64>>(6)?.map(|v| v as u32),
        gid: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
        mtime_ns: row.get(8)?,
    })
}

fn dir_from_row(row: &Row) -> rusqlite::Result<DirInfo> {
    Ok(DirInfo {
        path: row.get(0)?,
        num_subdirs: row.get::<_, i64>(1)? as u64,
        num_files: row.get::<_, i64>(2)? as u64,
        num_files_tree: row.get::<_, i64>(3)? as u64,
        size_tree: row.get::<_, i64>(4)? as u64,
        mode: row.get::<_, Option<i64>>(5)?.map(|v| v as u32),
        uid: row.get::<_, Option<i64>>(6)?.map(|v| v as u32),
        gid: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
        mtime_ns: row.get(8)?,
    })
}

/// Translate constraint failures into the archive error taxonomy. The
/// guard triggers abort with recognizable messages when a path collides
/// with an entry of the other kind.
fn map_constraint_err(e: rusqlite::Error, path: &str) -> Error {
    if let rusqlite::Error::SqliteFailure(_, Some(ref msg)) = e {
        if msg.contains("exists as file") {
            return Error::NotADirectory(path.to_string());
        }
        if msg.contains("exists as directory") {
            return Error::IsADirectory(path.to_string());
        }
        if msg.contains("UNIQUE constraint failed") {
            return Error::AlreadyExists(path.to_string());
        }
    }
    e.into()
}

pub(crate) fn now_ns() -> i64 {
    jiff::Timestamp::now().as_nanosecond() as i64
}

#[cfg(unix)]
fn current_ids() -> (Option<i64>, Option<i64>) {
    // SAFETY: getuid/getgid cannot fail
    unsafe { (Some(libc::getuid() as i64), Some(libc::getgid() as i64)) }
}

#[cfg(not(unix))]
fn current_ids() -> (Option<i64>, Option<i64>) {
    (None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_index() -> (tempfile::TempDir, Index) {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(
            &dir.path().join("archive"),
            &IndexOptions {
                readonly: false,
                ..IndexOptions::default()
            },
        )
        .unwrap();
        (dir, index)
    }

    fn file(path: &str, size: u64) -> FileInfo {
        FileInfo {
            size,
            crc32c: Some(0),
            ..FileInfo::new(path)
        }
    }

    #[test]
    fn test_fresh_index_has_empty_root() {
        let (_dir, index) = temp_index();
        let root = index.lookup_dir("").unwrap();
        assert_eq!(root.num_files_tree, 0);
        assert_eq!(root.size_tree, 0);
        assert_eq!(index.num_files().unwrap(), 0);
        assert_eq!(
            index.schema_version().unwrap(),
            (SCHEMA_VERSION_MAJOR, SCHEMA_VERSION_MINOR)
        );
    }

    #[test]
    fn test_add_file_creates_ancestors_and_propagates() {
        let (_dir, index) = temp_index();
        index.add_file(&file("x/y/z.bin", 1000)).unwrap();

        assert_eq!(index.lookup_dir("").unwrap().num_subdirs, 1);
        assert_eq!(index.lookup_dir("").unwrap().num_files_tree, 1);
        assert_eq!(index.lookup_dir("").unwrap().size_tree, 1000);
        assert_eq!(index.lookup_dir("x").unwrap().num_subdirs, 1);
        assert_eq!(index.lookup_dir("x").unwrap().size_tree, 1000);
        let xy = index.lookup_dir("x/y").unwrap();
        assert_eq!(xy.num_files, 1);
        assert_eq!(xy.num_subdirs, 0);
        assert_eq!(xy.num_files_tree, 1);
    }

    #[test]
    fn test_remove_file_decrements() {
        let (_dir, index) = temp_index();
        index.add_file(&file("a/b.bin", 10)).unwrap();
        index.add_file(&file("a/c.bin", 20)).unwrap();
        index.remove_file("a/b.bin").unwrap();

        let a = index.lookup_dir("a").unwrap();
        assert_eq!(a.num_files, 1);
        assert_eq!(a.size_tree, 20);
        assert_eq!(index.lookup_dir("").unwrap().size_tree, 20);
        assert!(matches!(
            index.remove_file("a/b.bin"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let (_dir, index) = temp_index();
        index.add_file(&file("a.txt", 1)).unwrap();
        assert!(matches!(
            index.add_file(&file("a.txt", 1)),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_file_dir_collision_detected() {
        let (_dir, index) = temp_index();
        index.add_file(&file("a/b.bin", 1)).unwrap();
        // "a" exists as a directory
        assert!(matches!(
            index.add_file(&file("a", 1)),
            Err(Error::IsADirectory(_))
        ));
        // a parent of the new file exists as a file
        assert!(matches!(
            index.add_file(&file("a/b.bin/c", 1)),
            Err(Error::NotADirectory(_))
        ));
    }

    #[test]
    fn test_rmdir_requires_empty() {
        let (_dir, index) = temp_index();
        index.add_file(&file("d/f.bin", 5)).unwrap();
        assert!(matches!(
            index.remove_empty_dir("d"),
            Err(Error::DirectoryNotEmpty(_))
        ));
        index.remove_file("d/f.bin").unwrap();
        index.remove_empty_dir("d").unwrap();
        assert!(!index.is_dir("d").unwrap());
        assert_eq!(index.lookup_dir("").unwrap().num_subdirs, 0);
    }

    #[test]
    fn test_rmtree_updates_ancestors() {
        let (_dir, index) = temp_index();
        index.add_file(&file("keep.bin", 1)).unwrap();
        index.add_file(&file("top/a/f1.bin", 10)).unwrap();
        index.add_file(&file("top/a/f2.bin", 20)).unwrap();
        index.add_file(&file("top/b/f3.bin", 30)).unwrap();
        index.remove_recursively("top/a").unwrap();

        assert!(!index.is_dir("top/a").unwrap());
        assert!(!index.is_file("top/a/f1.bin").unwrap());
        let top = index.lookup_dir("top").unwrap();
        assert_eq!(top.num_subdirs, 1);
        assert_eq!(top.num_files_tree, 1);
        assert_eq!(top.size_tree, 30);
        let root = index.lookup_dir("").unwrap();
        assert_eq!(root.num_files_tree, 2);
        assert_eq!(root.size_tree, 31);
    }

    #[test]
    fn test_rename_file_moves_stats() {
        let (_dir, index) = temp_index();
        index.add_file(&file("src/a.bin", 100)).unwrap();
        index.rename_file("src/a.bin", "dst/sub/b.bin", false).unwrap();

        assert!(!index.is_file("src/a.bin").unwrap());
        assert!(index.is_file("dst/sub/b.bin").unwrap());
        assert_eq!(index.lookup_dir("src").unwrap().size_tree, 0);
        assert_eq!(index.lookup_dir("dst").unwrap().size_tree, 100);
        assert_eq!(index.lookup_dir("dst/sub").unwrap().num_files, 1);
        assert_eq!(index.lookup_dir("").unwrap().size_tree, 100);
        assert_eq!(index.lookup_dir("").unwrap().num_files_tree, 1);
    }

    #[test]
    fn test_rename_dir_moves_subtree() {
        let (_dir, index) = temp_index();
        index.add_file(&file("old/x/f.bin", 10)).unwrap();
        index.add_file(&file("old/g.bin", 5)).unwrap();
        index.rename_dir("old", "new/place", false).unwrap();

        assert!(!index.is_dir("old").unwrap());
        assert!(index.is_file("new/place/x/f.bin").unwrap());
        assert!(index.is_file("new/place/g.bin").unwrap());
        assert_eq!(index.lookup_dir("new/place").unwrap().size_tree, 15);
        assert_eq!(index.lookup_dir("new").unwrap().num_files_tree, 2);
        let root = index.lookup_dir("").unwrap();
        assert_eq!(root.size_tree, 15);
        assert_eq!(root.num_subdirs, 1);
    }

    #[test]
    fn test_bulk_mode_and_rebuild() {
        let (_dir, index) = temp_index();
        index
            .with_triggers_off(|index| {
                index.add_file(&file("bulk/a.bin", 7))?;
                index.add_file(&file("bulk/deep/b.bin", 8))?;
                Ok(())
            })
            .unwrap();
        // no propagation happened, ancestors do not even exist yet
        assert!(!index.is_dir("bulk").unwrap());
        index.rebuild_stats().unwrap();
        assert_eq!(index.lookup_dir("bulk").unwrap().size_tree, 15);
        assert_eq!(index.lookup_dir("bulk/deep").unwrap().num_files, 1);
        assert_eq!(index.lookup_dir("").unwrap().num_files_tree, 2);
        assert!(index.dir_stats_mismatches().unwrap().is_empty());
    }

    #[test]
    fn test_listdir_interleaves_lexicographically() {
        let (_dir, index) = temp_index();
        index.add_file(&file("d/zz.bin", 1)).unwrap();
        index.add_file(&file("d/aa/x.bin", 1)).unwrap();
        index.add_file(&file("d/mm.bin", 1)).unwrap();
        assert_eq!(index.listdir_names("d").unwrap(), ["aa", "mm.bin", "zz.bin"]);
        assert!(matches!(
            index.listdir_names("nosuch"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_glob_paths() {
        let (_dir, index) = temp_index();
        index.add_file(&file("logs/a.txt", 1)).unwrap();
        index.add_file(&file("logs/b.bin", 1)).unwrap();
        index.add_file(&file("logs/deep/c.txt", 1)).unwrap();
        assert_eq!(
            index.glob_paths("logs/*.txt", false, true).unwrap(),
            ["logs/a.txt"]
        );
        assert_eq!(
            index.glob_paths("logs/**/*.txt", true, true).unwrap(),
            ["logs/a.txt", "logs/deep/c.txt"]
        );
        // non-recursive: ** does not cross segments
        assert_eq!(
            index.glob_paths("logs/**", false, true).unwrap(),
            ["logs/a.txt", "logs/b.bin"]
        );
    }

    #[test]
    fn test_address_pagination_with_zero_size_ties() {
        let (_dir, index) = temp_index();
        let mut empty_a = file("empty_a", 0);
        empty_a.shard = 0;
        empty_a.offset = 0;
        let mut empty_b = file("empty_b", 0);
        empty_b.shard = 0;
        empty_b.offset = 0;
        index.add_file(&empty_a).unwrap();
        index.add_file(&empty_b).unwrap();

        let page1 = index.files_after_address(None, 1).unwrap();
        assert_eq!(page1.len(), 1);
        let f = &page1[0];
        let page2 = index
            .files_after_address(Some((f.shard, f.offset, &f.path)), 10)
            .unwrap();
        assert_eq!(page2.len(), 1);
        assert_ne!(page1[0].path, page2[0].path);
        assert!(index.overlapping_files().unwrap().is_empty());
    }

    #[test]
    fn test_gap_discovery() {
        let (_dir, index) = temp_index();
        let mut a = file("a", 100);
        a.offset = 0;
        let mut b = file("b", 50);
        b.offset = 150;
        index.add_file(&a).unwrap();
        index.add_file(&b).unwrap();

        let gaps = index.gaps(None).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!((gaps[0].offset, gaps[0].size), (100, 50));

        let gaps = index.gaps(Some(1000)).unwrap();
        assert_eq!(gaps.len(), 2);
        assert_eq!((gaps[1].offset, gaps[1].size), (200, 800));
    }

    #[test]
    fn test_shard_size_limit_shrink_guard() {
        let (_dir, index) = temp_index();
        let mut a = file("a", 500);
        a.offset = 0;
        index.add_file(&a).unwrap();
        assert!(index.set_shard_size_limit(100).is_err());
        index.set_shard_size_limit(1000).unwrap();
        assert_eq!(index.shard_size_limit().unwrap(), 1000);
    }

    #[test]
    fn test_readonly_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive");
        Index::open(
            &path,
            &IndexOptions {
                readonly: false,
                ..IndexOptions::default()
            },
        )
        .unwrap();
        let index = Index::open(&path, &IndexOptions::default()).unwrap();
        assert!(matches!(
            index.add_file(&file("a", 1)),
            Err(Error::ReadOnly)
        ));
    }

    #[test]
    fn test_path_pagination_and_random_sample() {
        let (_dir, index) = temp_index();
        for name in ["c", "a", "b", "d"] {
            index.add_file(&file(name, 1)).unwrap();
        }
        let page = index.files_after_path(None, 3).unwrap();
        let names: Vec<&str> = page.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        let rest = index.files_after_path(Some("c"), 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].path, "d");

        let sample = index.random_files(2).unwrap();
        assert_eq!(sample.len(), 2);
    }

    #[test]
    fn test_metadata_updates() {
        let (_dir, index) = temp_index();
        index.add_file(&file("d/f.bin", 4)).unwrap();
        index.set_mode("d/f.bin", 0o600).unwrap();
        index.set_owner("d", 12, 34).unwrap();
        index.set_mtime_ns("d/f.bin", 1_700_000_000_000_000_000).unwrap();

        let f = index.lookup_file("d/f.bin").unwrap();
        assert_eq!(f.mode, Some(0o600));
        assert_eq!(f.mtime_ns, Some(1_700_000_000_000_000_000));
        let d = index.lookup_dir("d").unwrap();
        assert_eq!((d.uid, d.gid), (Some(12), Some(34)));
        assert!(matches!(
            index.set_mode("nosuch", 0o600),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_next_contiguous_chunk() {
        let (_dir, index) = temp_index();
        let mut a = file("a", 10);
        a.offset = 0;
        let mut b = file("b", 20);
        b.offset = 10;
        let mut c = file("c", 5);
        c.offset = 100;
        index.add_file(&a).unwrap();
        index.add_file(&b).unwrap();
        index.add_file(&c).unwrap();

        let chunk = index.next_contiguous_chunk(0, 0, u64::MAX >> 1).unwrap().unwrap();
        assert_eq!(chunk.start_offset, 0);
        assert_eq!(chunk.end_offset, 30);
        assert_eq!(chunk.file_count, 2);

        let chunk = index.next_contiguous_chunk(0, 30, u64::MAX >> 1).unwrap().unwrap();
        assert_eq!(chunk.start_offset, 100);
        assert_eq!(chunk.file_count, 1);
    }
}
