//! Ties the shard store, index store, allocator, reader, directory view, mutator, and
//! defragmenter together behind the public operation surface.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use log::{debug, warn};

use crate::cancel::{CancellationSource, CancellationToken};
use crate::defrag::{self, DefragMode, DefragReport};
use crate::dirview::{self, Stat, WalkIter};
use crate::error::{BarecatError, Result};
use crate::index::{self, DirStat, FileRow, IndexStore, Metadata};
use crate::mutator::{self, RenameFlags};
use crate::path as pathutil;
use crate::reader;
use crate::shard::{Blob, ShardMappingTable, ShardStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    CreateNew,
    Append,
    Overwrite,
}

impl OpenMode {
    fn is_writable(self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    pub mode: OpenMode,
    pub shard_size_limit: Option<u64>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self {
            mode: OpenMode::ReadOnly,
            shard_size_limit: None,
        }
    }

    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn shard_size_limit(mut self, limit: u64) -> Self {
        self.shard_size_limit = Some(limit);
        self
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub path: String,
}

pub struct Session {
    base: PathBuf,
    index: IndexStore,
    shards: ShardStore,
    mappings: ShardMappingTable,
    lock_file: Option<File>,
    writable: bool,
}

impl Session {
    pub fn open(base: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        let index_path = index::index_path(&base);
        let exists = index_path.exists();

        match options.mode {
            OpenMode::CreateNew if exists => {
                return Err(BarecatError::AlreadyExists(base.display().to_string()))
            }
            OpenMode::Overwrite => remove_archive_files(&base)?,
            OpenMode::ReadOnly | OpenMode::ReadWrite | OpenMode::Append if !exists => {
                return Err(BarecatError::NotFound(base.display().to_string()))
            }
            _ => {}
        }

        let writable = options.mode.is_writable();
        let lock_file = if writable {
            Some(acquire_lock(&index_path)?)
        } else {
            None
        };

        let index = IndexStore::open(&index_path, writable)?;
        if writable {
            if let Some(limit) = options.shard_size_limit {
                if !exists {
                    index.config_set_int(crate::index::CONFIG_SHARD_SIZE_LIMIT, limit as i64)?;
                }
            }
        }

        let shards = ShardStore::open(&base, writable)?;
        let mappings = build_mappings(&shards)?;
        debug!(
            "opened archive at {} ({} shards, writable={writable})",
            base.display(),
            shards.num_shards()
        );
        scan_for_orphans(&index, &shards)?;

        Ok(Self {
            base,
            index,
            shards,
            mappings,
            lock_file,
            writable,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn require_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(BarecatError::InvalidPath(
                "session is not writable".to_string(),
            ));
        }
        Ok(())
    }

    // --- reads ----------------------------------------------------------------------------

    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = pathutil::normalize(path)?;
        reader::read_buffered(&self.index, &self.shards, &path)
    }

    pub fn map_blob(&self, path: &str) -> Result<Blob<'_>> {
        let path = pathutil::normalize(path)?;
        reader::read_mapped(&self.index, &self.mappings, &path)
    }

    pub fn with_mapped_blob<R>(&self, path: &str, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let path = pathutil::normalize(path)?;
        reader::with_mapped_blob(&self.index, &self.mappings, &path, f)
    }

    pub fn open_stream(&self, path: &str) -> Result<BlobReader> {
        let path = pathutil::normalize(path)?;
        let row = reader::lookup(&self.index, &path)?;
        BlobReader::new(self.shards.file_for_mmap(row.shard)?, row.offset, row.size)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        dirview::exists(&self.index, &pathutil::normalize(path)?)
    }

    pub fn is_file(&self, path: &str) -> Result<bool> {
        dirview::is_file(&self.index, &pathutil::normalize(path)?)
    }

    pub fn is_dir(&self, path: &str) -> Result<bool> {
        dirview::is_dir(&self.index, &pathutil::normalize(path)?)
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        dirview::stat(&self.index, &pathutil::normalize(path)?)
    }

    pub fn listdir(&self, dir: &str) -> Result<(Vec<String>, Vec<String>)> {
        dirview::listdir(&self.index, &pathutil::normalize(dir)?)
    }

    pub fn iterdir_infos(&self, dir: &str) -> Result<(Vec<DirStat>, Vec<FileRow>)> {
        dirview::iterdir_infos(&self.index, &pathutil::normalize(dir)?)
    }

    pub fn walk(&self, dir: &str) -> WalkIter<'_> {
        dirview::walk(&self.index, dir, CancellationToken::noop())
    }

    pub fn walk_cancellable(&self, dir: &str, cancel: CancellationToken) -> WalkIter<'_> {
        dirview::walk(&self.index, dir, cancel)
    }

    pub fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        dirview::glob(&self.index, pattern)
    }

    // --- writes -----------------------------------------------------------------------------

    pub fn write(&mut self, path: &str, bytes: &[u8], metadata: Option<Metadata>) -> Result<()> {
        self.require_writable()?;
        let path = pathutil::normalize(path)?;
        let metadata = metadata.unwrap_or_else(Metadata::none);
        let crc = Some(crc32c::crc32c(bytes));
        crate::allocator::write_blob(&mut self.shards, &self.index, &path, bytes, &metadata, crc)
    }

    pub fn mkdir(&mut self, path: &str, metadata: Option<Metadata>) -> Result<()> {
        self.require_writable()?;
        let path = pathutil::normalize(path)?;
        let metadata = metadata.unwrap_or_else(Metadata::none);
        self.index.ensure_ancestor_dirs(&path)?;
        self.index.insert_dir(&path, &metadata)
    }

    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.require_writable()?;
        let path = pathutil::normalize(path)?;
        if self.index.dir_exists(&path)? {
            return mutator::delete_dir(&self.index, &path);
        }
        mutator::delete_file(&self.index, &path)
    }

    pub fn delete_recursive(&mut self, path: &str) -> Result<()> {
        self.require_writable()?;
        let path = pathutil::normalize(path)?;
        mutator::delete_dir_recursive(&self.index, &path)
    }

    pub fn rename(&mut self, old: &str, new: &str, flags: RenameFlags) -> Result<()> {
        self.require_writable()?;
        let old = pathutil::normalize(old)?;
        let new = pathutil::normalize(new)?;
        mutator::rename(&self.index, &old, &new, flags)
    }

    pub fn set_metadata(&mut self, path: &str, metadata: Metadata) -> Result<()> {
        self.require_writable()?;
        let path = pathutil::normalize(path)?;
        mutator::set_metadata(&self.index, &path, &metadata)
    }

    pub fn set_mode(&mut self, path: &str, mode: u32) -> Result<()> {
        self.set_metadata(
            path,
            Metadata {
                mode: Some(mode),
                ..Metadata::none()
            },
        )
    }

    pub fn set_owner(&mut self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.set_metadata(
            path,
            Metadata {
                uid: Some(uid),
                gid: Some(gid),
                ..Metadata::none()
            },
        )
    }

    pub fn set_mtime(&mut self, path: &str, mtime_ns: i64) -> Result<()> {
        self.set_metadata(
            path,
            Metadata {
                mtime_ns: Some(mtime_ns),
                ..Metadata::none()
            },
        )
    }

    pub fn truncate(&mut self, path: &str, size: u64) -> Result<()> {
        self.require_writable()?;
        let path = pathutil::normalize(path)?;
        mutator::truncate_file(&self.index, &path, size)
    }

    pub fn defrag(&mut self, mode: DefragMode) -> Result<DefragReport> {
        self.defrag_cancellable(mode, CancellationToken::noop())
    }

    /// Like [`Session::defrag`], but stops as soon as `cancel` trips. A cancelled run leaves the
    /// archive valid — every relocation it already made is committed, and nothing past the
    /// cancellation point is touched.
    pub fn defrag_cancellable(
        &mut self,
        mode: DefragMode,
        cancel: CancellationToken,
    ) -> Result<DefragReport> {
        self.require_writable()?;
        debug!("starting defrag ({mode:?})");
        let report = match mode {
            DefragMode::Full => defrag::full_compact(&mut self.shards, &self.index, cancel)?,
            DefragMode::Quick => defrag::quick_compact(&mut self.shards, &self.index, cancel)?,
        };
        self.mappings = build_mappings(&self.shards)?;
        debug!("defrag finished: {} files moved, {} bytes reclaimed", report.files_moved, report.bytes_reclaimed);
        Ok(report)
    }

    pub fn verify(&self, path: Option<&str>) -> Result<Vec<ChecksumMismatch>> {
        let rows = match path {
            Some(p) => vec![reader::lookup(&self.index, &pathutil::normalize(p)?)?],
            None => self.index.files_by_shard_offset()?,
        };
        let mut mismatches = Vec::new();
        for row in rows {
            if reader::verify_checksum(&self.shards, &row).is_err() {
                mismatches.push(ChecksumMismatch { path: row.path });
            }
        }
        Ok(mismatches)
    }

    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

fn build_mappings(shards: &ShardStore) -> Result<ShardMappingTable> {
    let files_and_lens: Result<Vec<_>> = (0..shards.num_shards())
        .map(|idx| Ok((shards.file_for_mmap(idx)?, shards.shard_len(idx)?)))
        .collect();
    ShardMappingTable::build(files_and_lens?.into_iter())
}

fn acquire_lock(index_path: &Path) -> Result<File> {
    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .open(lock_path(index_path))?;
    let acquired = file.try_lock_exclusive().map_err(|_| BarecatError::ConcurrentWriter)?;
    if !acquired {
        return Err(BarecatError::ConcurrentWriter);
    }
    Ok(file)
}

fn lock_path(index_path: &Path) -> PathBuf {
    let mut p = index_path.to_path_buf();
    let stem = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    p.set_file_name(format!("{stem}.lock"));
    p
}

fn remove_archive_files(base: &Path) -> Result<()> {
    let index_path = index::index_path(base);
    if index_path.exists() {
        fs::remove_file(&index_path)?;
    }
    let lock = lock_path(&index_path);
    if lock.exists() {
        fs::remove_file(lock)?;
    }
    for idx in 0.. {
        let shard = crate::shard::shard_path(base, idx);
        if !shard.exists() {
            break;
        }
        fs::remove_file(shard)?;
    }
    Ok(())
}

/// Detects orphan shard tails left by a write whose append succeeded but whose index
/// transaction never committed. Logged, not corrected — defrag reclaims them as gaps.
fn scan_for_orphans(index: &IndexStore, shards: &ShardStore) -> Result<()> {
    let gaps = defrag::find_gaps(index, shards)?;
    let orphan_bytes: u64 = gaps.iter().map(|(_, _, size)| size).sum();
    if orphan_bytes > 0 {
        warn!("archive has {orphan_bytes} bytes of unreferenced shard data (orphans or defrag-reclaimable gaps)");
    }
    Ok(())
}

/// A seekable, read-only view of one blob's bytes within its shard file.
pub struct BlobReader {
    file: File,
    start: u64,
    len: u64,
    pos: u64,
}

impl BlobReader {
    fn new(shard_file: &File, start: u64, len: u64) -> Result<Self> {
        Ok(Self {
            file: shard_file.try_clone()?,
            start,
            len,
            pos: 0,
        })
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        let to_read = (buf.len() as u64).min(remaining) as usize;
        if to_read == 0 {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.file.read(&mut buf[..to_read])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for BlobReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(p) => self.len as i64 + p,
            SeekFrom::Current(p) => self.pos as i64 + p,
        };
        if new_pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start"));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn base(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("archive")
    }

    #[test]
    fn scenario_one_write_two_files_with_rollover() {
        let dir = tempdir().unwrap();
        let mut session = Session::open(
            base(&dir),
            OpenOptions::new().mode(OpenMode::CreateNew).shard_size_limit(100),
        )
        .unwrap();

        session.write("a/x", &[0x41; 60], None).unwrap();
        session.write("a/y", &[0x42; 60], None).unwrap();

        let stat = match session.stat("").unwrap() {
            Stat::Dir(d) => d,
            _ => unreachable!(),
        };
        assert_eq!(stat.num_files_tree, 2);
        assert_eq!(stat.size_tree, 120);
        assert_eq!(session.read("a/x").unwrap(), vec![0x41; 60]);
    }

    #[test]
    fn scenario_two_delete_then_full_defrag() {
        let dir = tempdir().unwrap();
        let mut session = Session::open(
            base(&dir),
            OpenOptions::new().mode(OpenMode::CreateNew).shard_size_limit(100),
        )
        .unwrap();
        session.write("a/x", &[0x41; 60], None).unwrap();
        session.write("a/y", &[0x42; 60], None).unwrap();
        session.delete("a/x").unwrap();

        session.defrag(DefragMode::Full).unwrap();
        assert_eq!(session.read("a/y").unwrap(), vec![0x42; 60]);
    }

    #[test]
    fn scenario_three_thousand_files_in_one_dir() {
        let dir = tempdir().unwrap();
        let mut session = Session::open(base(&dir), OpenOptions::new().mode(OpenMode::CreateNew)).unwrap();
        for i in 0..1000 {
            let path = format!("d/{i:04}");
            session.write(&path, &[0u8; 10], None).unwrap();
        }
        let (_, files) = session.listdir("d").unwrap();
        assert_eq!(files.len(), 1000);
        let stat = match session.stat("d").unwrap() {
            Stat::Dir(d) => d,
            _ => unreachable!(),
        };
        assert_eq!(stat.num_files, 1000);
        assert_eq!(stat.num_files_tree, 1000);
        assert_eq!(stat.size_tree, 10000);
    }

    #[test]
    fn scenario_four_rename_dir_preserves_aggregates() {
        let dir = tempdir().unwrap();
        let mut session = Session::open(base(&dir), OpenOptions::new().mode(OpenMode::CreateNew)).unwrap();
        for i in 0..10 {
            session.write(&format!("d/{i:04}"), &[0u8; 1], None).unwrap();
        }
        session.rename("d", "e", RenameFlags::NONE).unwrap();
        assert!(!session.is_dir("d").unwrap());
        assert!(session.is_file("e/0000").unwrap());
        let root = match session.stat("").unwrap() {
            Stat::Dir(d) => d,
            _ => unreachable!(),
        };
        assert_eq!(root.num_subdirs, 1);
    }

    #[test]
    fn readonly_session_rejects_writes() {
        let dir = tempdir().unwrap();
        {
            let mut session = Session::open(base(&dir), OpenOptions::new().mode(OpenMode::CreateNew)).unwrap();
            session.write("a", &[1, 2, 3], None).unwrap();
        }
        let mut reopened = Session::open(base(&dir), OpenOptions::new().mode(OpenMode::ReadOnly)).unwrap();
        assert_eq!(reopened.read("a").unwrap(), vec![1, 2, 3]);
        assert!(reopened.write("b", &[1], None).is_err());
    }

    #[test]
    fn second_writer_is_rejected_while_first_holds_the_lock() {
        let dir = tempdir().unwrap();
        let _first = Session::open(base(&dir), OpenOptions::new().mode(OpenMode::CreateNew)).unwrap();
        let second = Session::open(base(&dir), OpenOptions::new().mode(OpenMode::ReadWrite));
        assert!(matches!(second, Err(BarecatError::ConcurrentWriter)));
    }
}
