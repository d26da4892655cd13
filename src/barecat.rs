//! The archive facade: path-addressed reads and writes over an index
//! plus a shard store.
//!
//! Writes append bytes to the shard store first, then insert the index
//! row; the row insert and its stats cascade commit as one transaction.
//! A crash in between leaves orphan tail bytes that a quick verify will
//! flag and defrag will reclaim, but never a dangling index entry.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::defrag::{self, DefragStats};
use crate::error::{Error, Result};
use crate::index::{self, Index, IndexOptions};
use crate::paths;
use crate::reshard;
use crate::sharder::{self, OpenMode, Sharder};
use crate::types::{DirInfo, EntryInfo, FileInfo, Order};
use crate::verify::{self, VerifyReport};

/// How to open or create an archive. The default is read-only.
#[derive(Debug, Clone)]
pub struct BarecatOptions {
    pub readonly: bool,
    /// Existing bytes are immutable; only new entries may be added.
    pub append_only: bool,
    /// Delete an existing archive first.
    pub overwrite: bool,
    /// Opening an existing archive for writing is fine (the default);
    /// otherwise it is an error.
    pub exist_ok: bool,
    pub shard_size_limit: Option<u64>,
    /// Open the index with WAL journaling so readers do not block each
    /// other.
    pub wal: bool,
}

impl Default for BarecatOptions {
    fn default() -> Self {
        Self {
            readonly: true,
            append_only: false,
            overwrite: false,
            exist_ok: true,
            shard_size_limit: None,
            wal: false,
        }
    }
}

/// An archive of many small files: shard files holding raw bytes
/// back-to-back, and a SQLite index mapping paths to shard addresses.
///
/// One `Barecat` exclusively owns its index connection and shard handles.
/// A single archive takes one writer at a time; concurrent readers each
/// open their own `Barecat`.
pub struct Barecat {
    path: PathBuf,
    pub(crate) index: Index,
    pub(crate) sharder: Sharder,
    readonly: bool,
    append_only: bool,
}

impl Barecat {
    /// Open an existing archive read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &BarecatOptions::default())
    }

    /// Open an archive for writing, creating it if missing.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(
            path,
            &BarecatOptions {
                readonly: false,
                ..BarecatOptions::default()
            },
        )
    }

    pub fn open_with(path: impl AsRef<Path>, options: &BarecatOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !options.readonly && path.exists() {
            if !options.exist_ok {
                return Err(Error::AlreadyExists(path.display().to_string()));
            }
            if options.overwrite {
                info!(path = %path.display(), "overwriting existing archive");
                remove_archive_files(&path)?;
            }
        }
        let index = Index::open(
            &path,
            &IndexOptions {
                readonly: options.readonly,
                wal: options.wal,
                shard_size_limit: options.shard_size_limit,
            },
        )?;
        let mode = if options.readonly {
            OpenMode::ReadOnly
        } else if options.append_only {
            OpenMode::AppendOnly
        } else {
            OpenMode::ReadWrite
        };
        let sharder = Sharder::open(&path, mode, index.shard_size_limit()?)?;
        Ok(Self {
            path,
            index,
            sharder,
            readonly: options.readonly,
            append_only: options.append_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// The metadata index. Read-level access for callers that want raw
    /// listings or statistics.
    pub fn index(&self) -> &Index {
        &self.index
    }

    // MAPPING-STYLE API

    /// Read a whole file and verify its checksum.
    pub fn get(&self, path: &str) -> Result<Vec<u8>> {
        let info = self.index.lookup_file(path)?;
        let data = self.sharder.read(info.shard, info.offset, info.size)?;
        if let Some(expected) = info.crc32c {
            let actual = crc32c::crc32c(&data);
            if actual != expected {
                return Err(Error::CrcMismatch {
                    path: info.path,
                    expected,
                    actual,
                });
            }
        }
        Ok(data)
    }

    /// Like [`Self::get`], but absence is `None` rather than an error.
    pub fn try_get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.get(path) {
            Ok(data) => Ok(Some(data)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Store a file. Overwriting removes the old entry first; the old
    /// bytes become a gap for defrag to reclaim.
    pub fn put(&mut self, path: &str, data: &[u8], overwrite: bool) -> Result<()> {
        self.check_writable()?;
        let path = paths::normalize_file(path)?;
        if self.index.is_file(&path)? {
            if !overwrite {
                return Err(Error::AlreadyExists(path));
            }
            self.remove(&path)?;
        }
        let (shard, offset, crc) = self.sharder.append(data)?;
        let info = FileInfo {
            path,
            shard,
            offset,
            size: data.len() as u64,
            crc32c: Some(crc),
            mtime_ns: Some(index::now_ns()),
            ..FileInfo::default()
        };
        if let Err(e) = self.index.add_file(&info) {
            self.sharder.truncate(shard, offset)?;
            return Err(e);
        }
        Ok(())
    }

    /// True iff a file (not a directory) exists at `path`.
    pub fn contains(&self, path: &str) -> Result<bool> {
        self.index.is_file(path)
    }

    /// Remove a file entry. The bytes stay in the shard as a gap, except
    /// at the shard tail, which is truncated away; interior gaps get a
    /// best-effort hole punch.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.check_writable()?;
        self.check_not_append_only()?;
        let path = paths::normalize_file(path)?;
        let info = match self.index.lookup_file(&path) {
            Ok(info) => info,
            Err(Error::NotFound(p)) => {
                if self.index.is_dir(&path)? {
                    return Err(Error::IsADirectory(path));
                }
                return Err(Error::NotFound(p));
            }
            Err(e) => return Err(e),
        };
        let logical_end = self.index.logical_shard_end(info.shard)?;
        self.index.remove_file(&path)?;
        if info.end() >= logical_end && info.shard < self.sharder.num_shards() {
            let new_end = self.index.logical_shard_end(info.shard)?;
            self.sharder.truncate(info.shard, new_end)?;
        } else {
            self.sharder.punch_hole(info.shard, info.offset, info.size)?;
        }
        Ok(())
    }

    // FILESYSTEM-STYLE API

    pub fn exists(&self, path: &str) -> Result<bool> {
        self.index.exists(path)
    }

    pub fn is_file(&self, path: &str) -> Result<bool> {
        self.index.is_file(path)
    }

    pub fn is_dir(&self, path: &str) -> Result<bool> {
        self.index.is_dir(path)
    }

    /// Metadata of a file or directory.
    pub fn stat(&self, path: &str) -> Result<EntryInfo> {
        self.index.lookup(path)
    }

    /// Open a file for reading. Handle reads are raw positioned reads
    /// with no checksum: there is no cheap integrity over arbitrary
    /// ranges. Whole-file [`Self::get`] is the verified read.
    pub fn reader(&self, path: &str) -> Result<FileReader<'_>> {
        let info = self.index.lookup_file(path)?;
        Ok(FileReader {
            sharder: &self.sharder,
            shard: info.shard,
            base: info.offset,
            size: info.size,
            pos: 0,
        })
    }

    /// Open a buffered writer that stores its contents as one file when
    /// finished.
    pub fn writer(&mut self, path: &str, overwrite: bool) -> Result<FileWriter<'_>> {
        self.check_writable()?;
        let path = paths::normalize_file(path)?;
        if !overwrite && self.index.is_file(&path)? {
            return Err(Error::AlreadyExists(path));
        }
        Ok(FileWriter {
            bc: self,
            path,
            overwrite,
            buf: Vec::new(),
        })
    }

    /// Read part of a file, without checksum verification.
    pub fn read_range(&self, path: &str, offset: u64, size: u64) -> Result<Vec<u8>> {
        let info = self.index.lookup_file(path)?;
        let offset = offset.min(info.size);
        let size = size.min(info.size - offset);
        self.sharder.read(info.shard, info.offset + offset, size)
    }

    /// Names of all entries directly in a directory, lexicographic by
    /// path, files and subdirectories interleaved.
    pub fn listdir(&self, path: &str) -> Result<Vec<String>> {
        self.index.listdir_names(path)
    }

    /// Infos of all entries directly in a directory.
    pub fn entries(&self, path: &str) -> Result<Vec<EntryInfo>> {
        self.index.listdir_infos(path)
    }

    /// Top-down traversal from `top`, one `(dirpath, subdir names, file
    /// names)` tuple per directory. Lazy; each directory is listed as the
    /// iterator reaches it.
    pub fn walk(&self, top: &str) -> Result<Walk<'_>> {
        let top = paths::normalize(top)?;
        self.index.lookup_dir(&top)?;
        Ok(Walk {
            bc: self,
            queue: VecDeque::from([top]),
        })
    }

    /// Paths of files and directories matching a glob pattern.
    pub fn glob(&self, pattern: &str, recursive: bool) -> Result<Vec<String>> {
        self.index.glob_paths(pattern, recursive, false)
    }

    /// Paths of files matching a glob pattern.
    pub fn glob_files(&self, pattern: &str, recursive: bool) -> Result<Vec<String>> {
        self.index.glob_paths(pattern, recursive, true)
    }

    /// Create a directory; missing ancestors are created along the way.
    pub fn mkdir(&mut self, path: &str, exist_ok: bool) -> Result<()> {
        self.check_writable()?;
        let info = DirInfo {
            path: paths::normalize(path)?,
            mode: Some(0o755),
            mtime_ns: Some(index::now_ns()),
            ..DirInfo::default()
        };
        self.index.add_dir(&info, exist_ok)
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.check_writable()?;
        self.check_not_append_only()?;
        self.index.remove_empty_dir(path)
    }

    /// Remove a directory and all its contents. Shard bytes of the
    /// removed files stay behind as gaps.
    pub fn rmtree(&mut self, path: &str) -> Result<()> {
        self.check_writable()?;
        self.check_not_append_only()?;
        self.index.remove_recursively(path)
    }

    /// Change the permission bits of a file or directory.
    pub fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        self.check_writable()?;
        let path = paths::normalize(path)?;
        self.index.set_mode(&path, mode)
    }

    /// Change the owner of a file or directory.
    pub fn chown(&mut self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.check_writable()?;
        let path = paths::normalize(path)?;
        self.index.set_owner(&path, uid, gid)
    }

    /// Set the modification time of a file or directory.
    pub fn set_mtime_ns(&mut self, path: &str, mtime_ns: i64) -> Result<()> {
        self.check_writable()?;
        let path = paths::normalize(path)?;
        self.index.set_mtime_ns(&path, mtime_ns)
    }

    /// Rename a file or a directory (with its whole subtree).
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        self.check_writable()?;
        self.check_not_append_only()?;
        if self.index.is_file(old)? {
            self.index.rename_file(old, new, false)
        } else if self.index.is_dir(old)? {
            self.index.rename_dir(old, new, false)
        } else {
            Err(Error::NotFound(old.to_string()))
        }
    }

    // IMPORT

    /// Add one file or directory from the filesystem, metadata included.
    pub fn add_by_path(
        &mut self,
        filesys_path: &Path,
        store_path: Option<&str>,
        dir_exist_ok: bool,
    ) -> Result<()> {
        self.check_writable()?;
        let store = match store_path {
            Some(s) => s.to_string(),
            None => filesys_path.to_string_lossy().into_owned(),
        };
        let meta = fs::metadata(filesys_path)?;
        if meta.is_dir() {
            let mut info = DirInfo::new(paths::normalize(&store)?);
            info.fill_from_metadata(&meta);
            return self.index.add_dir(&info, dir_exist_ok);
        }
        let mut info = FileInfo::new(paths::normalize_file(&store)?);
        info.fill_from_metadata(&meta);
        let mut reader = File::open(filesys_path)?;
        self.add_streamed(info, &mut reader)?;
        Ok(())
    }

    /// Recursively import a filesystem tree under `store_prefix`.
    /// Returns the number of files added. Symlinks and special files are
    /// skipped.
    pub fn add_tree(&mut self, root: &Path, store_prefix: &str) -> Result<u64> {
        self.check_writable()?;
        let prefix = paths::normalize(store_prefix)?;
        let mut num_files = 0u64;
        for entry in WalkDir::new(root) {
            let entry = entry.map_err(io::Error::from)?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or_else(|_| entry.path());
            let rel = rel.to_string_lossy().replace('\\', "/");
            let store = paths::join(&prefix, &rel);
            let store = paths::normalize(&store)?;
            if entry.file_type().is_dir() {
                if !store.is_empty() {
                    let mut info = DirInfo::new(store);
                    info.fill_from_metadata(&entry.metadata().map_err(io::Error::from)?);
                    self.index.add_dir(&info, true)?;
                }
            } else if entry.file_type().is_file() {
                self.add_by_path(entry.path(), Some(&store), true)?;
                num_files += 1;
            }
        }
        info!(root = %root.display(), num_files, "imported tree");
        Ok(num_files)
    }

    /// Add a file with explicit metadata and in-memory contents.
    pub fn add(&mut self, mut info: FileInfo, data: &[u8]) -> Result<FileInfo> {
        self.check_writable()?;
        info.path = paths::normalize_file(&info.path)?;
        let (shard, offset, crc) = self.sharder.append(data)?;
        info.shard = shard;
        info.offset = offset;
        info.size = data.len() as u64;
        info.crc32c = Some(crc);
        if let Err(e) = self.index.add_file(&info) {
            self.sharder.truncate(shard, offset)?;
            return Err(e);
        }
        Ok(info)
    }

    /// Add a file with explicit metadata, pulling its bytes from a
    /// reader.
    pub fn add_streamed<R: Read>(&mut self, mut info: FileInfo, reader: &mut R) -> Result<FileInfo> {
        self.check_writable()?;
        info.path = paths::normalize_file(&info.path)?;
        let (shard, offset, size, crc) =
            self.sharder.append_reader(reader).map_err(|e| match e {
                Error::Io(source) => Error::IngestFailed {
                    path: info.path.clone(),
                    source,
                },
                other => other,
            })?;
        info.shard = shard;
        info.offset = offset;
        info.size = size;
        info.crc32c = Some(crc);
        if let Err(e) = self.index.add_file(&info) {
            self.sharder.truncate(shard, offset)?;
            return Err(e);
        }
        Ok(info)
    }

    /// Streaming byte ingress for format adapters: pull bytes in chunks
    /// from `reader` straight into the shard store. A mid-stream failure
    /// truncates the shard back to its pre-call length and surfaces as
    /// [`Error::IngestFailed`].
    pub fn ingest<R: Read>(
        &mut self,
        path: &str,
        mtime_ns: Option<i64>,
        mode: Option<u32>,
        reader: &mut R,
    ) -> Result<FileInfo> {
        let info = FileInfo {
            path: path.to_string(),
            mtime_ns: mtime_ns.or_else(|| Some(index::now_ns())),
            mode,
            ..FileInfo::default()
        };
        self.add_streamed(info, reader)
    }

    /// Streaming byte egress: the file's size and an unverified reader
    /// over its bytes.
    pub fn emit(&self, path: &str) -> Result<(u64, FileReader<'_>)> {
        let reader = self.reader(path)?;
        Ok((reader.size, reader))
    }

    // SIZES

    pub fn num_files(&self) -> Result<u64> {
        self.index.num_files()
    }

    pub fn num_dirs(&self) -> Result<u64> {
        self.index.num_dirs()
    }

    /// Sum of all file sizes, from the index.
    pub fn total_logical_size(&self) -> Result<u64> {
        self.index.total_size()
    }

    /// Sum of all shard file lengths. Exceeds the logical size by the
    /// total gap size.
    pub fn total_physical_size(&self) -> u64 {
        self.sharder.total_physical_size()
    }

    pub fn shard_size_limit(&self) -> Result<u64> {
        self.index.shard_size_limit()
    }

    pub fn set_shard_size_limit(&mut self, limit: u64) -> Result<()> {
        self.index.set_shard_size_limit(limit)?;
        self.sharder.set_shard_size_limit(limit);
        Ok(())
    }

    pub fn logical_shard_end(&self, shard: u32) -> Result<u64> {
        self.index.logical_shard_end(shard)
    }

    /// Truncate every shard to its logical end, dropping orphan tails.
    pub fn truncate_to_logical(&mut self) -> Result<()> {
        self.check_writable()?;
        let mut ends = Vec::new();
        for shard in 0..self.sharder.num_shards() {
            ends.push(self.index.logical_shard_end(shard)?);
        }
        self.sharder.truncate_to_logical(&ends)
    }

    // BULK

    /// Run many inserts or deletes with live stat propagation off, then
    /// rebuild ancestors and counters once at the end. Triggers are
    /// restored and statistics rebuilt even when `f` fails.
    pub fn bulk_import<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.check_writable()?;
        self.index.set_triggers_enabled(false)?;
        let result = f(self);
        let restored = self.index.set_triggers_enabled(true);
        let rebuilt = self.index.rebuild_stats();
        match (result, restored, rebuilt) {
            (Ok(value), Ok(()), Ok(())) => Ok(value),
            (Err(e), _, _) => Err(e),
            (_, Err(e), _) => Err(e),
            (_, _, Err(e)) => Err(e),
        }
    }

    /// Rebuild every directory row and counter from the file table.
    pub fn rebuild_stats(&mut self) -> Result<()> {
        self.check_writable()?;
        self.index.rebuild_stats()
    }

    // MAINTENANCE

    /// Full integrity verification: every file re-read and checksummed,
    /// plus index-level checks.
    pub fn verify_full(&self, cancel: &CancelToken) -> Result<VerifyReport> {
        verify::verify_full(self, cancel)
    }

    /// Quick verification: index checks and shard bookkeeping only, no
    /// data reads.
    pub fn verify_quick(&self) -> Result<VerifyReport> {
        verify::verify_quick(self)
    }

    /// Full defragmentation: compact every shard, truncate tails, drop
    /// empty trailing shards.
    pub fn defrag(&mut self, cancel: &CancelToken) -> Result<DefragStats> {
        self.check_writable()?;
        self.check_not_append_only()?;
        defrag::defrag_full(self, cancel)
    }

    /// Defragment by moving contiguous runs of files as single block
    /// copies.
    pub fn defrag_smart(&mut self, cancel: &CancelToken) -> Result<DefragStats> {
        self.check_writable()?;
        self.check_not_append_only()?;
        defrag::defrag_smart(self, cancel)
    }

    /// Opportunistic defragmentation within a time budget: tail files are
    /// moved into earlier gaps until the deadline.
    pub fn defrag_quick(
        &mut self,
        budget: std::time::Duration,
        cancel: &CancelToken,
    ) -> Result<DefragStats> {
        self.check_writable()?;
        self.check_not_append_only()?;
        defrag::defrag_quick(self, budget, cancel)
    }

    /// Repack all bytes under a new shard size limit.
    pub fn reshard(&mut self, new_limit: u64, cancel: &CancelToken) -> Result<()> {
        self.check_writable()?;
        self.check_not_append_only()?;
        reshard::reshard(self, new_limit, cancel)
    }

    /// ANALYZE + VACUUM the index, for after heavy maintenance.
    pub fn optimize(&mut self) -> Result<()> {
        self.check_writable()?;
        self.index.optimize()
    }

    /// Close the archive, committing index housekeeping.
    pub fn close(self) -> Result<()> {
        self.index.close()
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.readonly {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_not_append_only(&self) -> Result<()> {
        if self.append_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }
}

/// Remove an archive's index, its journal sidecar files, and its shard
/// files from disk.
pub fn remove_archive_files(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    // WAL/rollback-journal leftovers from a previous writer
    for suffix in ["-journal", "-wal", "-shm"] {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        let sidecar = PathBuf::from(name);
        if sidecar.exists() {
            fs::remove_file(sidecar)?;
        }
    }
    let mut shard = 0u32;
    loop {
        let shard_file = sharder::shard_path(path, shard);
        if !shard_file.exists() {
            break;
        }
        fs::remove_file(shard_file)?;
        shard += 1;
    }
    Ok(())
}

/// Seekable read handle over one file's byte range in its shard.
pub struct FileReader<'a> {
    sharder: &'a Sharder,
    shard: u32,
    base: u64,
    size: u64,
    pos: u64,
}

impl FileReader<'_> {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for FileReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.pos);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.sharder
            .read_into(self.shard, self.base + self.pos, &mut buf[..n])
            .map_err(io::Error::other)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for FileReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::End(n) => self.size as i128 + n as i128,
            SeekFrom::Current(n) => self.pos as i128 + n as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

/// Buffered write handle; the contents become one archive file on
/// [`FileWriter::finish`]. Dropping without finishing discards the
/// buffer.
pub struct FileWriter<'a> {
    bc: &'a mut Barecat,
    path: String,
    overwrite: bool,
    buf: Vec<u8>,
}

impl FileWriter<'_> {
    pub fn finish(self) -> Result<FileInfo> {
        let FileWriter {
            bc,
            path,
            overwrite,
            buf,
        } = self;
        if overwrite && bc.index.is_file(&path)? {
            bc.remove(&path)?;
        }
        let info = FileInfo {
            path,
            mtime_ns: Some(index::now_ns()),
            ..FileInfo::default()
        };
        bc.add(info, &buf)
    }
}

impl Write for FileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Lazy top-down directory traversal. See [`Barecat::walk`].
pub struct Walk<'a> {
    bc: &'a Barecat,
    queue: VecDeque<String>,
}

impl Iterator for Walk<'_> {
    type Item = Result<(String, Vec<String>, Vec<String>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let dir = self.queue.pop_front()?;
        let subdirs = match self.bc.index.list_subdirs(&dir, Order::Path) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        let files = match self.bc.index.list_files_in(&dir, Order::Path) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        for sub in subdirs.iter().rev() {
            self.queue.push_front(sub.path.clone());
        }
        let subdir_names = subdirs
            .iter()
            .map(|d| paths::basename(&d.path).to_string())
            .collect();
        let file_names = files
            .iter()
            .map(|f| paths::basename(&f.path).to_string())
            .collect();
        Some(Ok((dir, subdir_names, file_names)))
    }
}
