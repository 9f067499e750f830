//! Append-only shard files: `<base>-shard-NNNNN`, pure byte concatenation, no header or footer.

mod mmap;

pub use mmap::{Blob, ShardMappingTable};

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{BarecatError, Result};

/// Width of the zero-padded decimal shard index in a shard file name.
const SHARD_DIGITS: usize = 5;

pub fn shard_path(base: &Path, index: u32) -> PathBuf {
    let base = base.to_string_lossy();
    PathBuf::from(format!("{base}-shard-{index:0width$}", width = SHARD_DIGITS))
}

/// One open shard: its file handle and currently known length.
struct ShardHandle {
    file: File,
    len: u64,
}

/// Owns every shard file handle for a session. The last shard is writable when the session is;
/// all others are opened read-only regardless of session mode, since only the allocator ever
/// appends and it only ever appends to the last shard.
pub struct ShardStore {
    base: PathBuf,
    shards: Vec<ShardHandle>,
    writable: bool,
}

impl ShardStore {
    /// Discovers and opens every `<base>-shard-NNNNN` file in index order. If none exist and
    /// `writable` is true, creates shard 0 empty; if none exist and `writable` is false, the
    /// store has zero shards (an archive with no blobs yet).
    pub fn open(base: &Path, writable: bool) -> Result<Self> {
        let mut indices = discover_shard_indices(base)?;
        indices.sort_unstable();

        let mut shards = Vec::with_capacity(indices.len());
        for (pos, &idx) in indices.iter().enumerate() {
            if idx != pos as u32 {
                return Err(BarecatError::CorruptIndex(format!(
                    "shard sequence has a gap before index {idx}"
                )));
            }
            let is_last = pos + 1 == indices.len();
            let path = shard_path(base, idx);
            let file = open_shard_file(&path, writable && is_last)?;
            let len = file.metadata()?.len();
            shards.push(ShardHandle { file, len });
        }

        let mut store = Self {
            base: base.to_path_buf(),
            shards,
            writable,
        };
        if store.shards.is_empty() && writable {
            store.create_shard(0)?;
        }
        Ok(store)
    }

    pub fn num_shards(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn shard_len(&self, shard: u32) -> Result<u64> {
        self.handle(shard).map(|h| h.len)
    }

    fn handle(&self, shard: u32) -> Result<&ShardHandle> {
        self.shards
            .get(shard as usize)
            .ok_or_else(|| BarecatError::CorruptIndex(format!("no such shard {shard}")))
    }

    fn create_shard(&mut self, index: u32) -> Result<()> {
        let path = shard_path(&self.base, index);
        let file = open_shard_file(&path, true)?;
        self.shards.push(ShardHandle { file, len: 0 });
        Ok(())
    }

    /// Opens the next shard for writing; called by the allocator when the last shard would
    /// overflow its cap.
    pub fn rollover(&mut self) -> Result<u32> {
        let next = self.num_shards();
        self.create_shard(next)?;
        Ok(next)
    }

    /// Appends `bytes` to `shard` and returns the pre-append offset (where the blob starts).
    pub fn append(&mut self, shard: u32, bytes: &[u8]) -> Result<u64> {
        if shard + 1 != self.num_shards() {
            return Err(BarecatError::CorruptIndex(
                "append target is not the last shard".into(),
            ));
        }
        let handle = self
            .shards
            .get_mut(shard as usize)
            .ok_or_else(|| BarecatError::CorruptIndex(format!("no such shard {shard}")))?;
        let offset = handle.len;
        handle
            .file
            .seek(SeekFrom::End(0))
            .map_err(|source| BarecatError::ShardIo { shard, source })?;
        handle
            .file
            .write_all(bytes)
            .map_err(|source| BarecatError::ShardIo { shard, source })?;
        handle.len += bytes.len() as u64;
        Ok(offset)
    }

    /// Reads `size` bytes at `offset` from `shard` into a freshly owned buffer.
    pub fn read(&self, shard: u32, offset: u64, size: u64) -> Result<Vec<u8>> {
        let handle = self.handle(shard)?;
        if offset + size > handle.len {
            return Err(BarecatError::CorruptIndex(format!(
                "file region [{offset}, {}) exceeds shard {shard} length {}",
                offset + size,
                handle.len
            )));
        }
        let mut file = handle.file.try_clone()?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|source| BarecatError::ShardIo { shard, source })?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact(&mut buf)
            .map_err(|source| BarecatError::ShardIo { shard, source })?;
        Ok(buf)
    }

    /// Performs an overlap-safe move of `size` bytes within/across shards, used by the
    /// defragmenter. Reads the whole region into memory first since source and destination may
    /// overlap on the same shard.
    pub fn relocate(
        &mut self,
        src_shard: u32,
        src_offset: u64,
        dst_shard: u32,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let bytes = self.read(src_shard, src_offset, size)?;
        let handle = self
            .shards
            .get_mut(dst_shard as usize)
            .ok_or_else(|| BarecatError::CorruptIndex(format!("no such shard {dst_shard}")))?;
        handle
            .file
            .seek(SeekFrom::Start(dst_offset))
            .map_err(|source| BarecatError::ShardIo {
                shard: dst_shard,
                source,
            })?;
        handle
            .file
            .write_all(&bytes)
            .map_err(|source| BarecatError::ShardIo {
                shard: dst_shard,
                source,
            })?;
        handle.len = handle.len.max(dst_offset + size);
        Ok(())
    }

    /// Truncates a shard to `length`, reclaiming a freed tail after defrag. A no-op if `length`
    /// is already the shard's length.
    pub fn truncate(&mut self, shard: u32, length: u64) -> Result<()> {
        let handle = self
            .shards
            .get_mut(shard as usize)
            .ok_or_else(|| BarecatError::CorruptIndex(format!("no such shard {shard}")))?;
        if handle.len == length {
            return Ok(());
        }
        handle
            .file
            .set_len(length)
            .map_err(|source| BarecatError::ShardIo { shard, source })?;
        handle.len = length;
        Ok(())
    }

    /// Drops the trailing shard entirely once defrag has emptied it. Only valid for the last
    /// shard, and only when its length is zero.
    pub fn drop_empty_trailing_shard(&mut self) -> Result<()> {
        if self.shards.len() <= 1 {
            return Ok(());
        }
        let last = self.shards.len() - 1;
        if self.shards[last].len != 0 {
            return Ok(());
        }
        let path = shard_path(&self.base, last as u32);
        self.shards.pop();
        fs::remove_file(path)?;
        Ok(())
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn file_for_mmap(&self, shard: u32) -> Result<&File> {
        Ok(&self.handle(shard)?.file)
    }
}

fn open_shard_file(path: &Path, writable: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true);
    if writable {
        opts.write(true).create(true);
    }
    Ok(opts.open(path)?)
}

fn discover_shard_indices(base: &Path) -> Result<Vec<u32>> {
    let dir = base.parent().unwrap_or_else(|| Path::new("."));
    let file_prefix = format!(
        "{}-shard-",
        base.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    );
    let mut indices = Vec::new();
    if !dir.exists() {
        return Ok(indices);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(suffix) = name.strip_prefix(&file_prefix) {
            if suffix.len() == SHARD_DIGITS && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(idx) = suffix.parse::<u32>() {
                    indices.push(idx);
                }
            }
        }
    }
    Ok(indices)
}
