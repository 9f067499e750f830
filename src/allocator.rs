//! Blob placement: picks a (shard, offset) for a new blob, handles shard rollover, and performs
//! the append-then-record step as a single short critical section.

use crate::error::{BarecatError, Result};
use crate::index::{IndexStore, Metadata};
use crate::shard::ShardStore;

/// Appends `bytes` at `file_path`, creating any missing ancestor directories, and records the
/// resulting file row. Fails with `BlobTooLarge` before touching any shard if `bytes` could never
/// fit under the cap; fails with `AlreadyExists` if the path is already a file or directory.
pub fn write_blob(
    shards: &mut ShardStore,
    index: &IndexStore,
    file_path: &str,
    bytes: &[u8],
    metadata: &Metadata,
    crc32c: Option<u32>,
) -> Result<()> {
    let cap = index.shard_size_limit()?;
    let size = bytes.len() as u64;
    if size > cap {
        return Err(BarecatError::BlobTooLarge { size, limit: cap });
    }
    if index.file_exists(file_path)? || index.dir_exists(file_path)? {
        return Err(BarecatError::AlreadyExists(file_path.to_string()));
    }

    let shard = resolve_target_shard(shards, cap, size)?;
    let offset = shards.append(shard, bytes)?;

    // The bytes just appended are now either referenced by the new row (success) or become an
    // orphan region the next defrag pass reclaims as a gap (failure) — a tolerated
    // "append succeeded, record failed" window. The ancestor-dir creation and the row insert
    // happen inside one index transaction, so that window never leaves a half-created directory
    // with no file in it.
    index.insert_file_with_ancestors(file_path, shard, offset, size, crc32c, metadata)
}

/// Picks the shard a blob of `size` bytes should land in, rolling over first if the last shard
/// would overflow the cap. A blob that fits in an empty shard always gets one, even if `size`
/// itself equals `cap`.
fn resolve_target_shard(shards: &mut ShardStore, cap: u64, size: u64) -> Result<u32> {
    let last = shards.num_shards().saturating_sub(1);
    let current_len = shards.shard_len(last)?;
    if current_len > 0 && current_len + size > cap {
        return Ok(shards.rollover()?);
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexStore;
    use tempfile::tempdir;

    fn new_shards(dir: &tempfile::TempDir) -> ShardStore {
        ShardStore::open(&dir.path().join("archive"), true).unwrap()
    }

    #[test]
    fn writes_first_blob_to_shard_zero() {
        let dir = tempdir().unwrap();
        let mut shards = new_shards(&dir);
        let index = IndexStore::open_in_memory().unwrap();
        write_blob(&mut shards, &index, "a/x", &[0x41; 60], &Metadata::none(), None).unwrap();
        let row = index.lookup_file("a/x").unwrap().unwrap();
        assert_eq!(row.shard, 0);
        assert_eq!(row.offset, 0);
        assert_eq!(row.size, 60);
    }

    #[test]
    fn rolls_over_when_next_write_would_exceed_cap() {
        let dir = tempdir().unwrap();
        let mut shards = new_shards(&dir);
        let index = IndexStore::open_in_memory().unwrap();
        index.config_set_int(crate::index::CONFIG_SHARD_SIZE_LIMIT, 100).unwrap();

        write_blob(&mut shards, &index, "a/x", &[0x41; 60], &Metadata::none(), None).unwrap();
        write_blob(&mut shards, &index, "a/y", &[0x42; 60], &Metadata::none(), None).unwrap();

        let x = index.lookup_file("a/x").unwrap().unwrap();
        let y = index.lookup_file("a/y").unwrap().unwrap();
        assert_eq!(x.shard, 0);
        assert_eq!(y.shard, 1);
        assert_eq!(shards.shard_len(0).unwrap(), 60);
        assert_eq!(shards.shard_len(1).unwrap(), 60);

        let root = index.dir_stat("").unwrap().unwrap();
        assert_eq!(root.num_files_tree, 2);
        assert_eq!(root.size_tree, 120);
    }

    #[test]
    fn blob_larger_than_cap_is_rejected() {
        let dir = tempdir().unwrap();
        let mut shards = new_shards(&dir);
        let index = IndexStore::open_in_memory().unwrap();
        index.config_set_int(crate::index::CONFIG_SHARD_SIZE_LIMIT, 10).unwrap();
        let err = write_blob(&mut shards, &index, "a/x", &[0u8; 20], &Metadata::none(), None)
            .unwrap_err();
        assert!(matches!(err, BarecatError::BlobTooLarge { .. }));
    }
}
