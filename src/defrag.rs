//! Gap detection and the two compaction strategies: exhaustive forward-pack and a cheaper
//! first-fit-from-end heuristic.

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::index::{FileRow, IndexStore};
use crate::shard::ShardStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragMode {
    Full,
    Quick,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefragReport {
    pub files_moved: u64,
    pub bytes_reclaimed: u64,
}

#[derive(Debug, Clone, Copy)]
struct Gap {
    shard: u32,
    offset: u64,
    size: u64,
}

/// Gaps inferred purely from the index: adjacent file pairs ordered by (shard, offset) whose
/// offset exceeds the previous file's end, plus each shard's unreferenced tail.
pub fn find_gaps(index: &IndexStore, shards: &ShardStore) -> Result<Vec<(u32, u64, u64)>> {
    let files = index.files_by_shard_offset()?;
    let mut gaps = Vec::new();
    let mut prev_end = 0u64;
    let mut current_shard = 0u32;
    for file in &files {
        if file.shard != current_shard {
            close_shard_tail(shards, current_shard, prev_end, &mut gaps)?;
            current_shard = file.shard;
            prev_end = 0;
        }
        if file.offset > prev_end {
            gaps.push((current_shard, prev_end, file.offset - prev_end));
        }
        prev_end = file.offset + file.size;
    }
    close_shard_tail(shards, current_shard, prev_end, &mut gaps)?;
    // Any shard with no files at all still has a tail gap equal to its whole length.
    for shard in (current_shard + 1)..shards.num_shards() {
        close_shard_tail(shards, shard, 0, &mut gaps)?;
    }
    Ok(gaps)
}

fn close_shard_tail(
    shards: &ShardStore,
    shard: u32,
    prev_end: u64,
    gaps: &mut Vec<(u32, u64, u64)>,
) -> Result<()> {
    if shard >= shards.num_shards() {
        return Ok(());
    }
    let len = shards.shard_len(shard)?;
    if len > prev_end {
        gaps.push((shard, prev_end, len - prev_end));
    }
    Ok(())
}

/// Walks files in (shard, offset) order from the start, moving each one backward to the next
/// expected write position whenever it isn't already packed there. After the pass every shard's
/// length equals the sum of the files it contains, with no internal gaps.
pub fn full_compact(
    shards: &mut ShardStore,
    index: &IndexStore,
    cancel: CancellationToken,
) -> Result<DefragReport> {
    let cap = index.shard_size_limit()?;
    let files = index.files_by_shard_offset()?;

    let mut report = DefragReport::default();
    let mut write_shard = 0u32;
    let mut write_offset = 0u64;

    for (i, file) in files.iter().enumerate() {
        if cancel.is_cancelled_sparse(i).is_none() {
            break;
        }
        if write_offset > 0 && write_offset + file.size > cap {
            write_shard += 1;
            write_offset = 0;
        }
        if (file.shard, file.offset) != (write_shard, write_offset) {
            shards.relocate(file.shard, file.offset, write_shard, write_offset, file.size)?;
            index.relocate_file(&file.path, write_shard, write_offset)?;
            report.files_moved += 1;
            report.bytes_reclaimed += gap_before(file, write_shard, write_offset);
        }
        write_offset += file.size;
    }

    for shard in write_shard..shards.num_shards() {
        let target_len = if shard == write_shard { write_offset } else { 0 };
        shards.truncate(shard, target_len)?;
    }
    while shards.num_shards() > write_shard + 1 {
        shards.drop_empty_trailing_shard()?;
    }
    Ok(report)
}

fn gap_before(file: &FileRow, new_shard: u32, new_offset: u64) -> u64 {
    if file.shard == new_shard {
        file.offset.saturating_sub(new_offset)
    } else {
        0
    }
}

/// Walks files in reverse (shard, offset) order, relocating each into the earliest gap that
/// fits it. Stops as soon as a file has no fitting gap, on the heuristic that files encountered
/// even earlier (in forward order) have no more room ahead of them either.
pub fn quick_compact(
    shards: &mut ShardStore,
    index: &IndexStore,
    cancel: CancellationToken,
) -> Result<DefragReport> {
    let mut files = index.files_by_shard_offset()?;
    let mut gaps: Vec<Gap> = find_gaps(index, shards)?
        .into_iter()
        .map(|(shard, offset, size)| Gap { shard, offset, size })
        .collect();
    gaps.sort_by_key(|g| (g.shard, g.offset));

    let mut report = DefragReport::default();
    for (i, file) in files.iter_mut().enumerate().rev() {
        if cancel.is_cancelled_sparse(i).is_none() {
            break;
        }
        let Some(gap_idx) = gaps.iter().position(|g| {
            g.size >= file.size && (g.shard, g.offset) < (file.shard, file.offset)
        }) else {
            break;
        };

        let gap = gaps[gap_idx];
        shards.relocate(file.shard, file.offset, gap.shard, gap.offset, file.size)?;
        index.relocate_file(&file.path, gap.shard, gap.offset)?;
        report.files_moved += 1;
        report.bytes_reclaimed += file.size.min(gap.size);

        let freed = Gap {
            shard: file.shard,
            offset: file.offset,
            size: file.size,
        };
        if gap.size == file.size {
            gaps[gap_idx] = freed;
        } else {
            gaps[gap_idx] = Gap {
                shard: gap.shard,
                offset: gap.offset + file.size,
                size: gap.size - file.size,
            };
            insert_gap_sorted(&mut gaps, freed);
        }
        gaps.sort_by_key(|g| (g.shard, g.offset));

        file.shard = gap.shard;
        file.offset = gap.offset;
    }
    Ok(report)
}

fn insert_gap_sorted(gaps: &mut Vec<Gap>, gap: Gap) {
    gaps.push(gap);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Metadata;
    use tempfile::tempdir;

    fn archive(dir: &tempfile::TempDir) -> (ShardStore, IndexStore) {
        let shards = ShardStore::open(&dir.path().join("archive"), true).unwrap();
        let index = IndexStore::open_in_memory().unwrap();
        (shards, index)
    }

    #[test]
    fn full_compact_repacks_after_delete() {
        let dir = tempdir().unwrap();
        let (mut shards, index) = archive(&dir);
        index.config_set_int(crate::index::CONFIG_SHARD_SIZE_LIMIT, 100).unwrap();

        let off_x = shards.append(0, &[0x41; 60]).unwrap();
        index.ensure_ancestor_dirs("a/x").unwrap();
        index.insert_file("a/x", 0, off_x, 60, None, &Metadata::none()).unwrap();

        shards.rollover().unwrap();
        let off_y = shards.append(1, &[0x42; 60]).unwrap();
        index.ensure_ancestor_dirs("a/y").unwrap();
        index.insert_file("a/y", 1, off_y, 60, None, &Metadata::none()).unwrap();

        index.delete_file("a/x").unwrap();

        let report = full_compact(&mut shards, &index, CancellationToken::noop()).unwrap();
        assert_eq!(report.files_moved, 1);

        let row = index.lookup_file("a/y").unwrap().unwrap();
        assert_eq!((row.shard, row.offset), (0, 0));
        assert_eq!(shards.shard_len(0).unwrap(), 60);
        assert_eq!(shards.num_shards(), 1);
        assert_eq!(shards.read(0, 0, 60).unwrap(), vec![0x42; 60]);
    }

    #[test]
    fn quick_compact_never_increases_total_gap_bytes() {
        let dir = tempdir().unwrap();
        let (mut shards, index) = archive(&dir);

        for i in 0..5u64 {
            let bytes = vec![i as u8; 10];
            let offset = shards.append(0, &bytes).unwrap();
            let path = format!("f{i}");
            index.ensure_ancestor_dirs(&path).unwrap();
            index.insert_file(&path, 0, offset, 10, None, &Metadata::none()).unwrap();
        }
        index.delete_file("f1").unwrap();
        index.delete_file("f3").unwrap();

        let gap_before: u64 = find_gaps(&index, &shards).unwrap().iter().map(|g| g.2).sum();
        quick_compact(&mut shards, &index, CancellationToken::noop()).unwrap();
        let gap_after: u64 = find_gaps(&index, &shards).unwrap().iter().map(|g| g.2).sum();
        assert!(gap_after <= gap_before);
    }
}
