//! Path-oriented read surface: listdir, iterdir_infos, walk, glob, existence checks, and O(1)
//! aggregate stats.

use crate::cancel::CancellationToken;
use crate::error::{BarecatError, Result};
use crate::index::{DirStat, FileRow, IndexStore};
use crate::path::{self, GlobPattern};

pub fn exists(index: &IndexStore, path: &str) -> Result<bool> {
    Ok(index.file_exists(path)? || index.dir_exists(path)?)
}

pub fn is_file(index: &IndexStore, path: &str) -> Result<bool> {
    index.file_exists(path)
}

pub fn is_dir(index: &IndexStore, path: &str) -> Result<bool> {
    index.dir_exists(path)
}

#[derive(Debug, Clone)]
pub enum Stat {
    File(FileRow),
    Dir(DirStat),
}

pub fn stat(index: &IndexStore, path: &str) -> Result<Stat> {
    if let Some(row) = index.lookup_file(path)? {
        return Ok(Stat::File(row));
    }
    if let Some(row) = index.dir_stat(path)? {
        return Ok(Stat::Dir(row));
    }
    Err(BarecatError::NotFound(path.to_string()))
}

/// Immediate child names of `dir`, as (subdirectory names, file names).
pub fn listdir(index: &IndexStore, dir: &str) -> Result<(Vec<String>, Vec<String>)> {
    require_dir(index, dir)?;
    index.listdir(dir)
}

/// Immediate children of `dir` with their full stat rows.
pub fn iterdir_infos(index: &IndexStore, dir: &str) -> Result<(Vec<DirStat>, Vec<FileRow>)> {
    require_dir(index, dir)?;
    index.iterdir_infos(dir)
}

fn require_dir(index: &IndexStore, dir: &str) -> Result<()> {
    if !index.dir_exists(dir)? {
        return Err(BarecatError::NotFound(dir.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub dirpath: String,
    pub subdirnames: Vec<String>,
    pub filenames: Vec<String>,
}

/// Lazy pre-order walk, driven by an explicit stack of pending directories rather than
/// recursion, so each `next()` call does at most one directory's worth of queries.
pub struct WalkIter<'a> {
    index: &'a IndexStore,
    stack: Vec<String>,
    cancel: CancellationToken,
    counter: usize,
}

impl<'a> WalkIter<'a> {
    pub fn new(index: &'a IndexStore, root: &str, cancel: CancellationToken) -> Self {
        Self {
            index,
            stack: vec![root.to_string()],
            cancel,
            counter: 0,
        }
    }
}

impl<'a> Iterator for WalkIter<'a> {
    type Item = Result<WalkEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.counter += 1;
        if self.cancel.is_cancelled_sparse(self.counter).is_none() {
            return None;
        }
        let dirpath = self.stack.pop()?;
        match self.index.listdir(&dirpath) {
            Ok((subdirnames, filenames)) => {
                // push in reverse so pre-order visits subdirectories in listdir order
                for name in subdirnames.iter().rev() {
                    let child = if dirpath.is_empty() {
                        name.clone()
                    } else {
                        format!("{dirpath}/{name}")
                    };
                    self.stack.push(child);
                }
                Some(Ok(WalkEntry {
                    dirpath,
                    subdirnames,
                    filenames,
                }))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

pub fn walk<'a>(index: &'a IndexStore, dir: &str, cancel: CancellationToken) -> WalkIter<'a> {
    WalkIter::new(index, dir, cancel)
}

/// Resolves a glob pattern: bounds candidates with a range scan on the pattern's literal prefix,
/// then filters by the full segment matcher.
pub fn glob(index: &IndexStore, pattern: &str) -> Result<Vec<String>> {
    let compiled = GlobPattern::compile(pattern)?;
    let candidates = index.files_with_prefix(compiled.literal_prefix())?;
    Ok(candidates
        .into_iter()
        .filter(|row| compiled.matches(&row.path))
        .map(|row| row.path)
        .collect())
}

/// True if `path` is at or under `dir` — used by callers that need a descendant check without a
/// round trip through the index.
pub fn is_within(path: &str, dir: &str) -> bool {
    path::is_descendant_of(path, dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Metadata;

    fn seeded_index() -> IndexStore {
        let index = IndexStore::open_in_memory().unwrap();
        for (offset, path) in ["a/x1", "a/b/x2", "a/b/y3"].into_iter().enumerate() {
            index.ensure_ancestor_dirs(path).unwrap();
            index
                .insert_file(path, 0, offset as u64, 1, None, &Metadata::none())
                .unwrap();
        }
        index
    }

    #[test]
    fn listdir_returns_immediate_children() {
        let index = seeded_index();
        let (subdirs, files) = listdir(&index, "a").unwrap();
        assert_eq!(subdirs, vec!["b"]);
        assert_eq!(files, vec!["x1"]);
    }

    #[test]
    fn walk_visits_every_directory_preorder() {
        let index = seeded_index();
        let entries: Vec<_> = walk(&index, "", CancellationToken::noop())
            .collect::<Result<_>>()
            .unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.dirpath.as_str()).collect();
        assert_eq!(paths, vec!["", "a", "a/b"]);
    }

    #[test]
    fn glob_matches_concrete_scenario_five() {
        let index = seeded_index();
        let mut matched = glob(&index, "**/x*").unwrap();
        matched.sort();
        assert_eq!(matched, vec!["a/b/x2", "a/x1"]);
    }

    #[test]
    fn stat_distinguishes_file_and_dir() {
        let index = seeded_index();
        assert!(matches!(stat(&index, "a/x1").unwrap(), Stat::File(_)));
        assert!(matches!(stat(&index, "a").unwrap(), Stat::Dir(_)));
        assert!(stat(&index, "missing").is_err());
    }
}
