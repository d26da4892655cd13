//! Shard file store: placement, rotation, append, positioned reads.
//!
//! Shard `k` of an archive at base path `B` is the file `B-shard-{k:05}`.
//! Bytes are only ever appended; deletions leave gaps that defrag
//! reclaims. All reads go through positioned I/O (`pread`), so shard
//! handles carry no cursor state and concurrent readers are safe.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

const COPY_BUFSIZE: usize = 128 * 1024;

/// How the shard files are opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    /// Existing bytes up to each shard's end are immutable; only appends
    /// (and the rollback truncation of a failed append) are allowed.
    AppendOnly,
}

impl OpenMode {
    pub fn writable(self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }
}

/// Path of shard `shard` for the archive at `base`.
pub fn shard_path(base: &Path, shard: u32) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!("-shard-{shard:05}"));
    PathBuf::from(name)
}

/// Owns the shard files of one archive.
pub struct Sharder {
    base: PathBuf,
    mode: OpenMode,
    shard_size_limit: u64,
    files: Vec<File>,
    /// Physical append cursor per shard.
    ends: Vec<u64>,
}

impl Sharder {
    /// Open all shards that exist on disk. In a writable mode with no
    /// shards present, shard 0 is created empty.
    pub fn open(base: &Path, mode: OpenMode, shard_size_limit: u64) -> Result<Self> {
        let mut files = Vec::new();
        let mut ends = Vec::new();
        loop {
            let path = shard_path(base, files.len() as u32);
            if !path.exists() {
                break;
            }
            let file = open_shard_file(&path, mode)?;
            ends.push(file.metadata()?.len());
            files.push(file);
        }
        let mut sharder = Self {
            base: base.to_path_buf(),
            mode,
            shard_size_limit,
            files,
            ends,
        };
        if sharder.files.is_empty() && mode.writable() {
            sharder.start_new_shard()?;
        }
        Ok(sharder)
    }

    /// Drop all handles and rescan the disk. Used after reshard and merge
    /// rewrite the shard set underneath us.
    pub fn reopen(&mut self) -> Result<()> {
        let fresh = Self::open(&self.base, self.mode, self.shard_size_limit)?;
        self.files = fresh.files;
        self.ends = fresh.ends;
        Ok(())
    }

    pub fn num_shards(&self) -> u32 {
        self.files.len() as u32
    }

    pub fn current_shard(&self) -> u32 {
        self.files.len().saturating_sub(1) as u32
    }

    /// End seek position of a shard file.
    pub fn physical_end(&self, shard: u32) -> Result<u64> {
        self.file(shard)?;
        Ok(self.ends[shard as usize])
    }

    pub fn total_physical_size(&self) -> u64 {
        self.ends.iter().sum()
    }

    pub fn set_shard_size_limit(&mut self, limit: u64) {
        self.shard_size_limit = limit;
    }

    /// Append `data` to the current shard, rotating first if it would
    /// overflow a non-empty shard. Returns the address and the CRC32C of
    /// the written bytes. The whole blob always lands in one shard; a blob
    /// larger than the limit gets a fresh shard to itself.
    pub fn append(&mut self, data: &[u8]) -> Result<(u32, u64, u32)> {
        self.check_writable()?;
        let (shard, offset) = self.placement(data.len() as u64)?;
        self.files[shard as usize].write_all_at(data, offset)?;
        self.ends[shard as usize] = offset + data.len() as u64;
        Ok((shard, offset, crc32c::crc32c(data)))
    }

    /// Stream an unknown number of bytes from `reader` into the store,
    /// computing the CRC on the way. If the stream turns out to overflow
    /// the current shard, the bytes are relocated to a fresh shard
    /// afterwards. Any read or write error truncates the shard back to
    /// its pre-call length before returning.
    pub fn append_reader<R: Read>(&mut self, reader: &mut R) -> Result<(u32, u64, u64, u32)> {
        self.check_writable()?;
        let shard = self.current_shard();
        let start = self.ends[shard as usize];
        let mut size = 0u64;
        let mut crc = 0u32;
        let mut buf = vec![0u8; COPY_BUFSIZE];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.truncate(shard, start)?;
                    return Err(Error::Io(e));
                }
            };
            if let Err(e) = self.files[shard as usize].write_all_at(&buf[..n], start + size) {
                self.truncate(shard, start)?;
                return Err(Error::Io(e));
            }
            crc = crc32c::crc32c_append(crc, &buf[..n]);
            size += n as u64;
        }
        self.ends[shard as usize] = start + size;

        if start > 0 && start + size > self.shard_size_limit {
            self.start_new_shard()?;
            let new_shard = self.current_shard();
            self.copy_range(shard, start, new_shard, 0, size)?;
            self.ends[new_shard as usize] = size;
            self.truncate(shard, start)?;
            return Ok((new_shard, 0, size, crc));
        }
        Ok((shard, start, size, crc))
    }

    /// Read `size` bytes at `(shard, offset)`. Never spans shards.
    pub fn read(&self, shard: u32, offset: u64, size: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        self.read_into(shard, offset, &mut buf)?;
        Ok(buf)
    }

    /// Fill `buf` exactly from `(shard, offset)`.
    pub fn read_into(&self, shard: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.file(shard)?.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Block-copy `size` bytes between shard addresses. Copying within one
    /// shard is only valid toward a lower offset (the defrag direction):
    /// each chunk is fully read into memory before it is written, and
    /// writes stay strictly below the next read position.
    pub fn copy_range(
        &mut self,
        src_shard: u32,
        src_offset: u64,
        dst_shard: u32,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.check_writable()?;
        let mut buf = vec![0u8; COPY_BUFSIZE.min(size.max(1) as usize)];
        let mut copied = 0u64;
        while copied < size {
            let n = buf.len().min((size - copied) as usize);
            self.file(src_shard)?
                .read_exact_at(&mut buf[..n], src_offset + copied)?;
            self.file(dst_shard)?
                .write_all_at(&buf[..n], dst_offset + copied)?;
            copied += n as u64;
        }
        let end = &mut self.ends[dst_shard as usize];
        *end = (*end).max(dst_offset + size);
        Ok(())
    }

    /// Shrink a shard file to `len` bytes.
    pub fn truncate(&mut self, shard: u32, len: u64) -> Result<()> {
        self.check_writable()?;
        self.file(shard)?.set_len(len)?;
        self.ends[shard as usize] = len;
        Ok(())
    }

    /// Truncate every shard to its logical end as recorded by the index.
    pub fn truncate_to_logical(&mut self, logical_ends: &[u64]) -> Result<()> {
        for (shard, &end) in logical_ends.iter().enumerate() {
            if (shard as u32) < self.num_shards() && self.ends[shard] > end {
                self.truncate(shard as u32, end)?;
            }
        }
        Ok(())
    }

    /// Delete shard files numbered above `last_keep`.
    pub fn remove_shards_after(&mut self, last_keep: u32) -> Result<()> {
        self.check_writable()?;
        while self.files.len() > (last_keep + 1) as usize {
            let shard = (self.files.len() - 1) as u32;
            let path = shard_path(&self.base, shard);
            self.files.pop();
            self.ends.pop();
            std::fs::remove_file(&path)?;
            debug!(shard, "removed empty shard");
        }
        Ok(())
    }

    /// Create the next shard file, empty, and make it current.
    pub fn start_new_shard(&mut self) -> Result<()> {
        self.check_writable()?;
        let shard = self.files.len() as u32;
        let path = shard_path(&self.base, shard);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        self.files.push(file);
        self.ends.push(0);
        debug!(shard, "started new shard");
        Ok(())
    }

    /// Deallocate the underlying storage of a byte range without changing
    /// the shard's apparent length. Best effort: a no-op where the
    /// platform or filesystem does not support hole punching.
    pub fn punch_hole(&self, shard: u32, offset: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;
            let file = self.file(shard)?;
            let ret = unsafe {
                libc::fallocate(
                    file.as_raw_fd(),
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    offset as libc::off_t,
                    size as libc::off_t,
                )
            };
            if ret != 0 {
                debug!(shard, offset, size, "hole punch not supported, gap left in place");
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (shard, offset, size);
        }
        Ok(())
    }

    fn placement(&mut self, size: u64) -> Result<(u32, u64)> {
        let current = self.current_shard();
        let end = self.ends[current as usize];
        if end > 0 && end + size > self.shard_size_limit {
            self.start_new_shard()?;
            return Ok((self.current_shard(), 0));
        }
        Ok((current, end))
    }

    fn file(&self, shard: u32) -> Result<&File> {
        self.files.get(shard as usize).ok_or_else(|| Error::ShardMissing {
            shard,
            path: shard_path(&self.base, shard),
        })
    }

    fn check_writable(&self) -> Result<()> {
        if self.mode.writable() {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }
}

fn open_shard_file(path: &Path, mode: OpenMode) -> io::Result<File> {
    match mode {
        OpenMode::ReadOnly => File::open(path),
        OpenMode::ReadWrite | OpenMode::AppendOnly => {
            OpenOptions::new().read(true).write(true).open(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_sharder(limit: u64) -> (tempfile::TempDir, Sharder) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("archive");
        let sharder = Sharder::open(&base, OpenMode::ReadWrite, limit).unwrap();
        (dir, sharder)
    }

    #[test]
    fn test_append_and_read() {
        let (_dir, mut sharder) = temp_sharder(u64::MAX);
        let (shard, offset, crc) = sharder.append(b"hello").unwrap();
        assert_eq!((shard, offset), (0, 0));
        assert_eq!(crc, crc32c::crc32c(b"hello"));
        assert_eq!(sharder.read(0, 0, 5).unwrap(), b"hello");
        let (shard, offset, _) = sharder.append(b"world").unwrap();
        assert_eq!((shard, offset), (0, 5));
        assert_eq!(sharder.read(0, 5, 5).unwrap(), b"world");
    }

    #[test]
    fn test_rotation_at_limit() {
        let (_dir, mut sharder) = temp_sharder(100);
        assert_eq!(sharder.append(&[1u8; 60]).unwrap().0, 0);
        // 60 + 50 > 100, rotates
        let (shard, offset, _) = sharder.append(&[2u8; 50]).unwrap();
        assert_eq!((shard, offset), (1, 0));
        // 50 + 70 > 100, rotates again
        let (shard, offset, _) = sharder.append(&[3u8; 70]).unwrap();
        assert_eq!((shard, offset), (2, 0));
        assert_eq!(sharder.num_shards(), 3);
    }

    #[test]
    fn test_oversized_blob_gets_own_shard() {
        let (_dir, mut sharder) = temp_sharder(100);
        sharder.append(&[1u8; 10]).unwrap();
        let (shard, offset, _) = sharder.append(&[2u8; 500]).unwrap();
        assert_eq!((shard, offset), (1, 0));
        assert_eq!(sharder.physical_end(1).unwrap(), 500);
        // a fresh empty shard takes an oversized blob without rotating
        let (shard, _, _) = sharder.append(&[3u8; 30]).unwrap();
        assert_eq!(shard, 2);
    }

    #[test]
    fn test_append_reader_relocates_on_overflow() {
        let (_dir, mut sharder) = temp_sharder(100);
        sharder.append(&[1u8; 80]).unwrap();
        let data = vec![7u8; 60];
        let (shard, offset, size, crc) = sharder.append_reader(&mut &data[..]).unwrap();
        assert_eq!((shard, offset, size), (1, 0, 60));
        assert_eq!(crc, crc32c::crc32c(&data));
        assert_eq!(sharder.read(1, 0, 60).unwrap(), data);
        // the overflow shard was truncated back
        assert_eq!(sharder.physical_end(0).unwrap(), 80);
    }

    #[test]
    fn test_append_reader_rolls_back_on_error() {
        struct FailingReader(usize);
        impl Read for FailingReader {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0 == 0 {
                    Err(io::Error::other("stream broke"))
                } else {
                    let n = self.0.min(buf.len());
                    self.0 -= n;
                    buf[..n].fill(9);
                    Ok(n)
                }
            }
        }
        let (_dir, mut sharder) = temp_sharder(u64::MAX);
        sharder.append(b"keep").unwrap();
        let err = sharder.append_reader(&mut FailingReader(10)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(sharder.physical_end(0).unwrap(), 4);
    }

    #[test]
    fn test_readonly_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("archive");
        Sharder::open(&base, OpenMode::ReadWrite, u64::MAX)
            .unwrap()
            .append(b"x")
            .unwrap();
        let mut readonly = Sharder::open(&base, OpenMode::ReadOnly, u64::MAX).unwrap();
        assert!(matches!(readonly.append(b"y"), Err(Error::ReadOnly)));
        assert_eq!(readonly.read(0, 0, 1).unwrap(), b"x");
    }

    #[test]
    fn test_missing_shard() {
        let (_dir, sharder) = temp_sharder(u64::MAX);
        assert!(matches!(
            sharder.read(7, 0, 1),
            Err(Error::ShardMissing { shard: 7, .. })
        ));
    }

    #[test]
    fn test_copy_range_within_shard_downward() {
        let (_dir, mut sharder) = temp_sharder(u64::MAX);
        sharder.append(&[0u8; 100]).unwrap();
        sharder.append(&[5u8; 50]).unwrap();
        sharder.copy_range(0, 100, 0, 0, 50).unwrap();
        assert_eq!(sharder.read(0, 0, 50).unwrap(), vec![5u8; 50]);
    }
}
