//! Row types and the read-only prepared queries shared by the directory view, reader, and
//! defragmenter.

use rusqlite::{params, OptionalExtension};

use crate::error::Result;
use crate::index::store::IndexStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime_ns: Option<i64>,
}

impl Metadata {
    pub const fn none() -> Self {
        Self {
            mode: None,
            uid: None,
            gid: None,
            mtime_ns: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
    pub path: String,
    pub parent: String,
    pub shard: u32,
    pub offset: u64,
    pub size: u64,
    pub crc32c: Option<u32>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirStat {
    pub path: String,
    pub parent: Option<String>,
    pub num_subdirs: u64,
    pub num_files: u64,
    pub num_files_tree: u64,
    pub size_tree: u64,
    pub metadata: Metadata,
}

impl IndexStore {
    pub fn lookup_file(&self, path: &str) -> Result<Option<FileRow>> {
        let conn = self.conn().lock();
        let mut stmt = conn.prepare_cached(
            "SELECT path, parent, shard, offset, size, crc32c, mode, uid, gid, mtime_ns \
             FROM files WHERE path = ?1",
        )?;
        let row = stmt
            .query_row(params![path], Self::row_to_file)
            .optional()?;
        Ok(row)
    }

    pub fn dir_stat(&self, path: &str) -> Result<Option<DirStat>> {
        let conn = self.conn().lock();
        let mut stmt = conn.prepare_cached(
            "SELECT path, parent, num_subdirs, num_files, num_files_tree, size_tree, \
             mode, uid, gid, mtime_ns FROM dirs WHERE path = ?1",
        )?;
        let row = stmt
            .query_row(params![path], Self::row_to_dir)
            .optional()?;
        Ok(row)
    }

    pub fn dir_exists(&self, path: &str) -> Result<bool> {
        Ok(self.dir_stat(path)?.is_some())
    }

    pub fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.lookup_file(path)?.is_some())
    }

    /// Immediate children of `path`: (subdirectory names, file names), both sorted.
    pub fn listdir(&self, path: &str) -> Result<(Vec<String>, Vec<String>)> {
        let conn = self.conn().lock();
        let mut dir_stmt =
            conn.prepare_cached("SELECT path FROM dirs WHERE parent = ?1 ORDER BY path")?;
        let subdirs: Vec<String> = dir_stmt
            .query_map(params![path], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let mut file_stmt =
            conn.prepare_cached("SELECT path FROM files WHERE parent = ?1 ORDER BY path")?;
        let files: Vec<String> = file_stmt
            .query_map(params![path], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let basename = |p: &str| crate::path::basename(p).to_string();
        Ok((
            subdirs.iter().map(|p| basename(p)).collect(),
            files.iter().map(|p| basename(p)).collect(),
        ))
    }

    /// Immediate children of `path` with their full stat rows.
    pub fn iterdir_infos(&self, path: &str) -> Result<(Vec<DirStat>, Vec<FileRow>)> {
        let conn = self.conn().lock();
        let mut dir_stmt = conn.prepare_cached(
            "SELECT path, parent, num_subdirs, num_files, num_files_tree, size_tree, \
             mode, uid, gid, mtime_ns FROM dirs WHERE parent = ?1 ORDER BY path",
        )?;
        let dirs: Vec<DirStat> = dir_stmt
            .query_map(params![path], Self::row_to_dir)?
            .collect::<rusqlite::Result<_>>()?;

        let mut file_stmt = conn.prepare_cached(
            "SELECT path, parent, shard, offset, size, crc32c, mode, uid, gid, mtime_ns \
             FROM files WHERE parent = ?1 ORDER BY path",
        )?;
        let files: Vec<FileRow> = file_stmt
            .query_map(params![path], Self::row_to_file)?
            .collect::<rusqlite::Result<_>>()?;

        Ok((dirs, files))
    }

    /// Files whose path lies in `[prefix, upper_bound)`, used by glob to bound candidates by the
    /// pattern's literal prefix before running the per-candidate segment match.
    pub fn files_with_prefix(&self, prefix: &str) -> Result<Vec<FileRow>> {
        let conn = self.conn().lock();
        let mut stmt = conn.prepare_cached(
            "SELECT path, parent, shard, offset, size, crc32c, mode, uid, gid, mtime_ns \
             FROM files WHERE path >= ?1 AND path < ?2 ORDER BY path",
        )?;
        let upper = prefix_upper_bound(prefix);
        let rows = stmt
            .query_map(params![prefix, upper], Self::row_to_file)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    /// Every file ordered by (shard, offset), the order both compaction passes walk in.
    pub fn files_by_shard_offset(&self) -> Result<Vec<FileRow>> {
        let conn = self.conn().lock();
        let mut stmt = conn.prepare_cached(
            "SELECT path, parent, shard, offset, size, crc32c, mode, uid, gid, mtime_ns \
             FROM files ORDER BY shard, offset",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_file)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<FileRow> {
        Ok(FileRow {
            path: row.get(0)?,
            parent: row.get(1)?,
            shard: row.get::<_, i64>(2)? as u32,
            offset: row.get::<_, i64>(3)? as u64,
            size: row.get::<_, i64>(4)? as u64,
            crc32c: row.get::<_, Option<i64>>(5)?.map(|v| v as u32),
            metadata: Metadata {
                mode: row.get::<_, Option<i64>>(6)?.map(|v| v as u32),
                uid: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
                gid: row.get::<_, Option<i64>>(8)?.map(|v| v as u32),
                mtime_ns: row.get(9)?,
            },
        })
    }

    fn row_to_dir(row: &rusqlite::Row) -> rusqlite::Result<DirStat> {
        Ok(DirStat {
            path: row.get(0)?,
            parent: row.get(1)?,
            num_subdirs: row.get::<_, i64>(2)? as u64,
            num_files: row.get::<_, i64>(3)? as u64,
            num_files_tree: row.get::<_, i64>(4)? as u64,
            size_tree: row.get::<_, i64>(5)? as u64,
            metadata: Metadata {
                mode: row.get::<_, Option<i64>>(6)?.map(|v| v as u32),
                uid: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
                gid: row.get::<_, Option<i64>>(8)?.map(|v| v as u32),
                mtime_ns: row.get(9)?,
            },
        })
    }
}

/// The smallest string that is strictly greater than every string with `prefix` as a prefix,
/// used as the exclusive upper bound of a primary-key range scan. Appending `'\u{10FFFF}'`
/// bytes would also work but incrementing the last byte keeps the bound tight.
fn prefix_upper_bound(prefix: &str) -> String {
    if prefix.is_empty() {
        return "\u{10FFFF}".to_string();
    }
    let mut bytes: Vec<u8> = prefix.as_bytes().to_vec();
    for i in (0..bytes.len()).rev() {
        if bytes[i] != 0xFF {
            bytes[i] += 1;
            bytes.truncate(i + 1);
            return String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    "\u{10FFFF}".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_upper_bound_excludes_siblings() {
        let upper = prefix_upper_bound("a/b");
        assert!("a/b/anything" < upper.as_str());
        assert!("a/c" >= upper.as_str());
    }
}
