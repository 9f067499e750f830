//! Blob reads: a lookup phase shared by both variants, a buffered reader that copies into an
//! owned `Vec<u8>`, and a zero-copy reader borrowing from the session's shard mappings.

use crate::error::{BarecatError, Result};
use crate::index::{FileRow, IndexStore};
use crate::shard::{Blob, ShardMappingTable, ShardStore};

pub fn lookup(index: &IndexStore, path: &str) -> Result<FileRow> {
    index
        .lookup_file(path)?
        .ok_or_else(|| BarecatError::NotFound(path.to_string()))
}

/// Reads the full blob at `path` into an owned buffer.
pub fn read_buffered(index: &IndexStore, shards: &ShardStore, path: &str) -> Result<Vec<u8>> {
    let row = lookup(index, path)?;
    read_from_address(shards, row.shard, row.offset, row.size)
}

/// Reads a region directly by (shard, offset, size), bypassing the index. Used by defrag
/// verification and by [`crc32c_from_address`].
pub fn read_from_address(shards: &ShardStore, shard: u32, offset: u64, size: u64) -> Result<Vec<u8>> {
    shards.read(shard, offset, size)
}

/// Computes the CRC32C of the blob bytes at (shard, offset, size) read straight from the shard.
pub fn crc32c_from_address(shards: &ShardStore, shard: u32, offset: u64, size: u64) -> Result<u32> {
    let bytes = read_from_address(shards, shard, offset, size)?;
    Ok(crc32c::crc32c(&bytes))
}

/// Borrows the blob at `path` from the session's shard mappings. The borrow's lifetime is tied
/// to `mappings`, so it cannot outlive the session that owns the table.
pub fn read_mapped<'a>(
    index: &IndexStore,
    mappings: &'a ShardMappingTable,
    path: &str,
) -> Result<Blob<'a>> {
    let row = lookup(index, path)?;
    mappings.get(row.shard, row.offset, row.size)
}

/// Scoped zero-copy access: the callback receives a borrow that cannot escape its own return
/// value. Preferred over [`read_mapped`] when the caller doesn't otherwise need to hold a
/// session-lifetime borrow, since misuse is impossible by construction.
pub fn with_mapped_blob<R>(
    index: &IndexStore,
    mappings: &ShardMappingTable,
    path: &str,
    f: impl FnOnce(&[u8]) -> R,
) -> Result<R> {
    let blob = read_mapped(index, mappings, path)?;
    Ok(f(blob.as_slice()))
}

/// Verifies the stored CRC (if any) of `row` against its shard bytes.
pub fn verify_checksum(shards: &ShardStore, row: &FileRow) -> Result<()> {
    let Some(expected) = row.crc32c else {
        return Ok(());
    };
    let actual = crc32c_from_address(shards, row.shard, row.offset, row.size)?;
    if actual != expected {
        return Err(BarecatError::ChecksumMismatch {
            path: row.path.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Metadata;
    use tempfile::tempdir;

    #[test]
    fn buffered_read_returns_exact_bytes() {
        let dir = tempdir().unwrap();
        let mut shards = ShardStore::open(&dir.path().join("archive"), true).unwrap();
        let index = IndexStore::open_in_memory().unwrap();
        let bytes = vec![0x41u8; 60];
        let offset = shards.append(0, &bytes).unwrap();
        index.ensure_ancestor_dirs("a/x").unwrap();
        let crc = crc32c::crc32c(&bytes);
        index
            .insert_file("a/x", 0, offset, bytes.len() as u64, Some(crc), &Metadata::none())
            .unwrap();

        let read_back = read_buffered(&index, &shards, "a/x").unwrap();
        assert_eq!(read_back, bytes);

        let row = lookup(&index, "a/x").unwrap();
        verify_checksum(&shards, &row).unwrap();
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let dir = tempdir().unwrap();
        let mut shards = ShardStore::open(&dir.path().join("archive"), true).unwrap();
        let index = IndexStore::open_in_memory().unwrap();
        let offset = shards.append(0, &[0x41; 10]).unwrap();
        index.ensure_ancestor_dirs("a/x").unwrap();
        index
            .insert_file("a/x", 0, offset, 10, Some(0xdeadbeef), &Metadata::none())
            .unwrap();
        let row = lookup(&index, "a/x").unwrap();
        let err = verify_checksum(&shards, &row).unwrap_err();
        assert!(matches!(err, BarecatError::ChecksumMismatch { .. }));
    }

    #[test]
    fn not_found_on_missing_path() {
        let index = IndexStore::open_in_memory().unwrap();
        let dir = tempdir().unwrap();
        let shards = ShardStore::open(&dir.path().join("archive"), true).unwrap();
        let err = read_buffered(&index, &shards, "nope").unwrap_err();
        assert!(matches!(err, BarecatError::NotFound(_)));
    }
}
