//! Read-only memory mappings of shard files, for zero-copy blob reads.
//!
//! One mapping is created per shard at session open and held for the session's lifetime;
//! `Blob` borrows never outlive the table that produced them.

use memmap2::{Mmap, MmapOptions};
use std::fs::File;

use crate::error::{BarecatError, Result};

/// A zero-copy view of one blob's bytes, borrowed from its shard's mapping.
pub struct Blob<'a> {
    bytes: &'a [u8],
}

impl<'a> Blob<'a> {
    pub fn as_slice(&self) -> &'a [u8] {
        self.bytes
    }
}

impl<'a> std::ops::Deref for Blob<'a> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

/// Holds one `PROT_READ, MAP_PRIVATE` mapping per shard. Built once at session open; it is a
/// snapshot, not a live view — shards added or grown afterward by further writes are not
/// visible through it until it is rebuilt.
///
/// A zero-length shard has nothing to map (the OS refuses to mmap an empty file), so its slot
/// is `None`; the only region ever requested from it is the empty one, which needs no backing
/// memory at all.
pub struct ShardMappingTable {
    mappings: Vec<Option<Mmap>>,
}

impl ShardMappingTable {
    pub fn build<'a>(files: impl Iterator<Item = (&'a File, u64)>) -> Result<Self> {
        let mut mappings = Vec::new();
        for (file, len) in files {
            if len == 0 {
                mappings.push(None);
                continue;
            }
            let mmap = unsafe { MmapOptions::new().map(file)? };
            mappings.push(Some(mmap));
        }
        Ok(Self { mappings })
    }

    pub fn get(&self, shard: u32, offset: u64, size: u64) -> Result<Blob<'_>> {
        if size == 0 {
            return Ok(Blob { bytes: &[] });
        }
        let mapping = self
            .mappings
            .get(shard as usize)
            .ok_or_else(|| BarecatError::CorruptIndex(format!("no mapping for shard {shard}")))?
            .as_ref()
            .ok_or_else(|| BarecatError::CorruptIndex(format!("shard {shard} has no bytes mapped")))?;
        let start = offset as usize;
        let end = start
            .checked_add(size as usize)
            .ok_or_else(|| BarecatError::CorruptIndex("blob region overflows usize".into()))?;
        if end > mapping.len() {
            return Err(BarecatError::CorruptIndex(format!(
                "blob region [{start}, {end}) exceeds mapped shard {shard} length {}",
                mapping.len()
            )));
        }
        Ok(Blob {
            bytes: &mapping[start..end],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn maps_and_reads_back_bytes() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0x41; 60]).unwrap();
        let table = ShardMappingTable::build(std::iter::once((&file, 60))).unwrap();
        let blob = table.get(0, 0, 60).unwrap();
        assert_eq!(blob.as_slice(), &[0x41; 60][..]);
    }

    #[test]
    fn rejects_out_of_range_region() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0x41; 10]).unwrap();
        let table = ShardMappingTable::build(std::iter::once((&file, 10))).unwrap();
        assert!(table.get(0, 5, 10).is_err());
    }
}
