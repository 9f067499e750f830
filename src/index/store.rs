//! Owns the SQLite connection: schema creation, config, and the row-level mutations that the
//! allocator and mutator build their transactions from.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::error::{map_constraint_violation, BarecatError, Result};
use crate::index::queries::Metadata;
use crate::index::schema;
use crate::index::triggers;
use crate::path;

pub struct IndexStore {
    conn: Arc<Mutex<Connection>>,
}

impl IndexStore {
    /// Opens the index file at `path`. `writable` picks between a plain read-write connection
    /// (creating the file if absent) and an explicit `SQLITE_OPEN_READ_ONLY` connection, so a
    /// readonly session can never accidentally mutate the index even if a bug elsewhere tried.
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let conn = if writable {
            Connection::open(path)?
        } else {
            Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?
        };
        Self::init(conn, writable)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, true)
    }

    fn init(conn: Connection, writable: bool) -> Result<Self> {
        if writable {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.pragma_update(None, "recursive_triggers", "ON")?;
            for ddl in schema::all_ddl() {
                conn.execute(ddl, [])?;
            }
            triggers::install(&conn)?;
        }

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        if writable {
            store.init_config_defaults()?;
        } else {
            store.check_schema_version()?;
        }
        Ok(store)
    }

    fn init_config_defaults(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO config (key, value_int) VALUES (?1, ?2)",
            params![schema::CONFIG_USE_TRIGGERS, 1],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO config (key, value_int) VALUES (?1, ?2)",
            params![schema::CONFIG_SHARD_SIZE_LIMIT, schema::DEFAULT_SHARD_SIZE_LIMIT],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO config (key, value_int) VALUES (?1, ?2)",
            params![schema::CONFIG_SCHEMA_VERSION_MAJOR, schema::SCHEMA_VERSION_MAJOR],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO config (key, value_int) VALUES (?1, ?2)",
            params![schema::CONFIG_SCHEMA_VERSION_MINOR, schema::SCHEMA_VERSION_MINOR],
        )?;
        drop(conn);
        self.check_schema_version()
    }

    fn check_schema_version(&self) -> Result<()> {
        let major = self
            .config_get_int(schema::CONFIG_SCHEMA_VERSION_MAJOR)?
            .unwrap_or(schema::SCHEMA_VERSION_MAJOR);
        if major != schema::SCHEMA_VERSION_MAJOR {
            return Err(BarecatError::CorruptIndex(format!(
                "unsupported schema version {major}.x"
            )));
        }
        Ok(())
    }

    pub fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    // --- config -----------------------------------------------------------------------------

    pub fn config_get_int(&self, key: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value_int FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn config_set_int(&self, key: &str, value: i64) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO config (key, value_int) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value_int = excluded.value_int",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn shard_size_limit(&self) -> Result<u64> {
        Ok(self
            .config_get_int(schema::CONFIG_SHARD_SIZE_LIMIT)?
            .unwrap_or(schema::DEFAULT_SHARD_SIZE_LIMIT) as u64)
    }

    pub fn use_triggers(&self) -> Result<bool> {
        Ok(self
            .config_get_int(schema::CONFIG_USE_TRIGGERS)?
            .unwrap_or(1)
            != 0)
    }

    pub fn set_use_triggers(&self, enabled: bool) -> Result<()> {
        self.config_set_int(schema::CONFIG_USE_TRIGGERS, enabled as i64)
    }

    pub fn rebuild_aggregates(&self) -> Result<()> {
        triggers::rebuild_aggregates(&self.conn.lock())
    }

    // --- directories --------------------------------------------------------------------------

    /// Creates every missing ancestor directory of `path`, bottom-up, so each insert's upward
    /// trigger sees an already-existing parent. Does not create `path` itself.
    pub fn ensure_ancestor_dirs(&self, path: &str) -> Result<()> {
        ensure_ancestor_dirs_tx(&self.conn.lock(), path)
    }

    pub fn insert_dir(&self, path: &str, metadata: &Metadata) -> Result<()> {
        if self.dir_exists(path)? {
            return Err(BarecatError::AlreadyExists(path.to_string()));
        }
        let parent = crate::path::parent_of(path)
            .ok_or_else(|| BarecatError::InvalidPath(path.to_string()))?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO dirs (path, parent, mode, uid, gid, mtime_ns) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    path,
                    parent,
                    metadata.mode,
                    metadata.uid,
                    metadata.gid,
                    metadata.mtime_ns
                ],
            )
            .map_err(|e| map_constraint_violation(e, path))?;
        Ok(())
    }

    pub fn delete_dir(&self, path: &str) -> Result<()> {
        let stat = self
            .dir_stat(path)?
            .ok_or_else(|| BarecatError::NotFound(path.to_string()))?;
        if stat.num_subdirs != 0 || stat.num_files != 0 {
            return Err(BarecatError::DirNotEmpty(path.to_string()));
        }
        if path.is_empty() {
            return Err(BarecatError::InvalidPath("cannot delete root".into()));
        }
        self.conn
            .lock()
            .execute("DELETE FROM dirs WHERE path = ?1", params![path])?;
        Ok(())
    }

    // --- files --------------------------------------------------------------------------------

    pub fn insert_file(
        &self,
        file_path: &str,
        shard: u32,
        offset: u64,
        size: u64,
        crc32c: Option<u32>,
        metadata: &Metadata,
    ) -> Result<()> {
        insert_file_tx(&self.conn.lock(), file_path, shard, offset, size, crc32c, metadata)
    }

    /// Creates any missing ancestor directories and inserts the file row in one transaction, so
    /// a failure partway through (e.g. the row insert hitting a constraint) leaves neither the
    /// new ancestor directories nor the file row behind.
    pub fn insert_file_with_ancestors(
        &self,
        file_path: &str,
        shard: u32,
        offset: u64,
        size: u64,
        crc32c: Option<u32>,
        metadata: &Metadata,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("BEGIN", [])?;
        let result = (|| -> Result<()> {
            ensure_ancestor_dirs_tx(&conn, file_path)?;
            insert_file_tx(&conn, file_path, shard, offset, size, crc32c, metadata)
        })();
        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    pub fn delete_file(&self, path: &str) -> Result<()> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM files WHERE path = ?1", params![path])?;
        if n == 0 {
            return Err(BarecatError::NotFound(path.to_string()));
        }
        Ok(())
    }

    pub fn truncate_file(&self, path: &str, size: u64) -> Result<()> {
        let n = self.conn.lock().execute(
            "UPDATE files SET size = ?2 WHERE path = ?1",
            params![path, size as i64],
        )?;
        if n == 0 {
            return Err(BarecatError::NotFound(path.to_string()));
        }
        Ok(())
    }

    pub fn relocate_file(&self, path: &str, shard: u32, offset: u64) -> Result<()> {
        let n = self.conn.lock().execute(
            "UPDATE files SET shard = ?2, offset = ?3 WHERE path = ?1",
            params![path, shard, offset as i64],
        )?;
        if n == 0 {
            return Err(BarecatError::NotFound(path.to_string()));
        }
        Ok(())
    }

    pub fn set_file_metadata(&self, path: &str, metadata: &Metadata) -> Result<()> {
        let n = self.conn.lock().execute(
            "UPDATE files SET \
                mode = COALESCE(?2, mode), \
                uid = COALESCE(?3, uid), \
                gid = COALESCE(?4, gid), \
                mtime_ns = COALESCE(?5, mtime_ns) \
             WHERE path = ?1",
            params![path, metadata.mode, metadata.uid, metadata.gid, metadata.mtime_ns],
        )?;
        if n == 0 {
            return Err(BarecatError::NotFound(path.to_string()));
        }
        Ok(())
    }

    pub fn set_dir_metadata(&self, path: &str, metadata: &Metadata) -> Result<()> {
        let n = self.conn.lock().execute(
            "UPDATE dirs SET \
                mode = COALESCE(?2, mode), \
                uid = COALESCE(?3, uid), \
                gid = COALESCE(?4, gid), \
                mtime_ns = COALESCE(?5, mtime_ns) \
             WHERE path = ?1",
            params![path, metadata.mode, metadata.uid, metadata.gid, metadata.mtime_ns],
        )?;
        if n == 0 {
            return Err(BarecatError::NotFound(path.to_string()));
        }
        Ok(())
    }

    /// Renames a file in place: updates path (and re-derived parent) in one statement so the
    /// move/no-move trigger variants both apply correctly.
    pub fn rename_file(&self, old: &str, new: &str) -> Result<()> {
        let new_parent = crate::path::parent_of(new)
            .ok_or_else(|| BarecatError::InvalidPath(new.to_string()))?;
        let n = self
            .conn
            .lock()
            .execute(
                "UPDATE files SET path = ?2, parent = ?3 WHERE path = ?1",
                params![old, new, new_parent],
            )
            .map_err(|e| map_constraint_violation(e, new))?;
        if n == 0 {
            return Err(BarecatError::NotFound(old.to_string()));
        }
        Ok(())
    }

    /// Renames a directory and every descendant dir/file, rewriting path prefixes within one
    /// transaction. Only the moved subtree's own row changes parent; descendants keep their
    /// relative structure, so their trigger-visible parent is unchanged and no aggregate
    /// propagation fires for them.
    pub fn rename_dir(&self, old: &str, new: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("BEGIN", [])?;
        let result = (|| -> Result<()> {
            rename_dir_row(&conn, old, new)?;
            rename_descendant_dirs(&conn, old, new)?;
            rename_descendant_files(&conn, old, new)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    pub fn delete_dir_recursive(&self, path: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("BEGIN", [])?;
        let result = (|| -> Result<()> {
            let prefix = format!("{path}/");
            conn.execute(
                "DELETE FROM files WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'",
                params![path, like_prefix_pattern(&prefix)],
            )?;
            // deepest-first so each delete's upward trigger sees a still-present parent chain
            let mut stmt = conn.prepare(
                "SELECT path FROM dirs WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\' \
                 ORDER BY LENGTH(path) DESC",
            )?;
            let dirs: Vec<String> = stmt
                .query_map(params![path, like_prefix_pattern(&prefix)], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            drop(stmt);
            for dir in dirs {
                conn.execute("DELETE FROM dirs WHERE path = ?1", params![dir])?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }
}

fn dir_exists_tx(conn: &Connection, path: &str) -> Result<bool> {
    let exists = conn
        .query_row("SELECT 1 FROM dirs WHERE path = ?1", params![path], |_| Ok(()))
        .optional()?
        .is_some();
    Ok(exists)
}

fn ensure_ancestor_dirs_tx(conn: &Connection, path: &str) -> Result<()> {
    let mut missing = Vec::new();
    let mut cursor = path;
    loop {
        let Some(parent) = crate::path::parent_of(cursor) else {
            break;
        };
        if dir_exists_tx(conn, parent)? {
            break;
        }
        missing.push(parent.to_string());
        cursor = parent;
    }
    for dir in missing.into_iter().rev() {
        insert_dir_if_missing_tx(conn, &dir, &Metadata::none())?;
    }
    Ok(())
}

fn insert_dir_if_missing_tx(conn: &Connection, path: &str, metadata: &Metadata) -> Result<()> {
    let parent = crate::path::parent_of(path);
    conn.execute(
        "INSERT OR IGNORE INTO dirs (path, parent, mode, uid, gid, mtime_ns) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            path,
            parent,
            metadata.mode,
            metadata.uid,
            metadata.gid,
            metadata.mtime_ns
        ],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn insert_file_tx(
    conn: &Connection,
    file_path: &str,
    shard: u32,
    offset: u64,
    size: u64,
    crc32c: Option<u32>,
    metadata: &Metadata,
) -> Result<()> {
    let parent = crate::path::parent_of(file_path)
        .ok_or_else(|| BarecatError::InvalidPath(file_path.to_string()))?;
    conn.execute(
        "INSERT INTO files (path, parent, shard, offset, size, crc32c, mode, uid, gid, mtime_ns) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            file_path,
            parent,
            shard,
            offset as i64,
            size as i64,
            crc32c.map(|v| v as i64),
            metadata.mode,
            metadata.uid,
            metadata.gid,
            metadata.mtime_ns
        ],
    )
    .map_err(|e| map_constraint_violation(e, file_path))?;
    Ok(())
}

fn rename_dir_row(conn: &Connection, old: &str, new: &str) -> Result<()> {
    let new_parent = crate::path::parent_of(new)
        .ok_or_else(|| BarecatError::InvalidPath(new.to_string()))?;
    let n = conn
        .execute(
            "UPDATE dirs SET path = ?2, parent = ?3 WHERE path = ?1",
            params![old, new, new_parent],
        )
        .map_err(|e| map_constraint_violation(e, new))?;
    if n == 0 {
        return Err(BarecatError::NotFound(old.to_string()));
    }
    Ok(())
}

fn rename_descendant_dirs(conn: &Connection, old: &str, new: &str) -> Result<()> {
    let prefix = format!("{old}/");
    let mut stmt = conn.prepare(
        "SELECT path FROM dirs WHERE path LIKE ?1 ESCAPE '\\' ORDER BY LENGTH(path)",
    )?;
    let paths: Vec<String> = stmt
        .query_map(params![like_prefix_pattern(&prefix)], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);
    for old_path in paths {
        let new_path = path::rebase(&old_path, old, new);
        let new_parent = crate::path::parent_of(&new_path).unwrap_or("");
        conn.execute(
            "UPDATE dirs SET path = ?2, parent = ?3 WHERE path = ?1",
            params![old_path, new_path, new_parent],
        )?;
    }
    Ok(())
}

fn rename_descendant_files(conn: &Connection, old: &str, new: &str) -> Result<()> {
    let prefix = format!("{old}/");
    let mut stmt = conn.prepare(
        "SELECT path FROM files WHERE path LIKE ?1 ESCAPE '\\' ORDER BY LENGTH(path)",
    )?;
    let paths: Vec<String> = stmt
        .query_map(params![like_prefix_pattern(&prefix)], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);
    for old_path in paths {
        let new_path = path::rebase(&old_path, old, new);
        let new_parent = crate::path::parent_of(&new_path).unwrap_or("");
        conn.execute(
            "UPDATE files SET path = ?2, parent = ?3 WHERE path = ?1",
            params![old_path, new_path, new_parent],
        )?;
    }
    Ok(())
}

/// Escapes `%`/`_`/`\` so a literal path prefix can be used safely as a `LIKE` pattern.
fn like_prefix_pattern(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if c == '%' || c == '_' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkdir_twice_is_already_exists() {
        let store = IndexStore::open_in_memory().unwrap();
        store.insert_dir("a", &Metadata::none()).unwrap();
        let err = store.insert_dir("a", &Metadata::none()).unwrap_err();
        assert!(matches!(err, BarecatError::AlreadyExists(_)));
    }

    #[test]
    fn ensure_ancestor_dirs_creates_missing_bottom_up() {
        let store = IndexStore::open_in_memory().unwrap();
        store.ensure_ancestor_dirs("a/b/c").unwrap();
        assert!(store.dir_exists("a").unwrap());
        assert!(store.dir_exists("a/b").unwrap());
        assert!(!store.dir_exists("a/b/c").unwrap());
    }

    #[test]
    fn insert_file_updates_parent_aggregates() {
        let store = IndexStore::open_in_memory().unwrap();
        store.ensure_ancestor_dirs("a/x").unwrap();
        assert!(store.dir_exists("a").unwrap());
        store
            .insert_file("a/x", 0, 0, 60, None, &Metadata::none())
            .unwrap();
        let stat = store.dir_stat("a").unwrap().unwrap();
        assert_eq!(stat.num_files, 1);
        assert_eq!(stat.num_files_tree, 1);
        assert_eq!(stat.size_tree, 60);

        let root = store.dir_stat("").unwrap().unwrap();
        assert_eq!(root.num_files_tree, 1);
        assert_eq!(root.size_tree, 60);
    }

    #[test]
    fn insert_file_with_ancestors_creates_missing_dirs_and_the_row_together() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .insert_file_with_ancestors("a/b/x", 0, 0, 60, None, &Metadata::none())
            .unwrap();
        assert!(store.dir_exists("a").unwrap());
        assert!(store.dir_exists("a/b").unwrap());
        assert!(store.file_exists("a/b/x").unwrap());
        let stat = store.dir_stat("a/b").unwrap().unwrap();
        assert_eq!(stat.num_files_tree, 1);
        assert_eq!(stat.size_tree, 60);
    }

    #[test]
    fn insert_file_with_ancestors_rolls_back_new_dirs_on_row_conflict() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .insert_file_with_ancestors("a/x", 0, 0, 60, None, &Metadata::none())
            .unwrap();
        // "a/x" already exists as a file, so the row insert fails and the (already-present)
        // ancestor dir must be left exactly as it was, not re-created or left half-written.
        let err = store
            .insert_file_with_ancestors("a/x", 0, 60, 10, None, &Metadata::none())
            .unwrap_err();
        assert!(matches!(err, BarecatError::AlreadyExists(_)));
        let stat = store.dir_stat("a").unwrap().unwrap();
        assert_eq!(stat.num_files_tree, 1);
        assert_eq!(stat.size_tree, 60);
    }

    #[test]
    fn delete_file_decrements_aggregates() {
        let store = IndexStore::open_in_memory().unwrap();
        store.ensure_ancestor_dirs("a/x").unwrap();
        store
            .insert_file("a/x", 0, 0, 60, None, &Metadata::none())
            .unwrap();
        store.delete_file("a/x").unwrap();
        let stat = store.dir_stat("a").unwrap().unwrap();
        assert_eq!(stat.num_files, 0);
        assert_eq!(stat.size_tree, 0);
    }

    #[test]
    fn delete_nonempty_dir_fails() {
        let store = IndexStore::open_in_memory().unwrap();
        store.ensure_ancestor_dirs("a/x").unwrap();
        store
            .insert_file("a/x", 0, 0, 1, None, &Metadata::none())
            .unwrap();
        let err = store.delete_dir("a").unwrap_err();
        assert!(matches!(err, BarecatError::DirNotEmpty(_)));
    }

    #[test]
    fn rename_dir_rewrites_descendants_and_preserves_aggregates() {
        let store = IndexStore::open_in_memory().unwrap();
        for i in 0..3 {
            let p = format!("d/{i:04}");
            store.ensure_ancestor_dirs(&p).unwrap();
            store.insert_file(&p, 0, i * 10, 10, None, &Metadata::none()).unwrap();
        }
        let before = store.dir_stat("d").unwrap().unwrap();
        store.rename_dir("d", "e").unwrap();

        assert!(store.dir_stat("d").unwrap().is_none());
        let after = store.dir_stat("e").unwrap().unwrap();
        assert_eq!(before.num_files_tree, after.num_files_tree);
        assert_eq!(before.size_tree, after.size_tree);
        assert!(store.file_exists("e/0000").unwrap());
        assert!(!store.file_exists("d/0000").unwrap());

        let root = store.dir_stat("").unwrap().unwrap();
        assert_eq!(root.num_subdirs, 1);
    }

    #[test]
    fn delete_dir_recursive_removes_subtree() {
        let store = IndexStore::open_in_memory().unwrap();
        for i in 0..3 {
            let p = format!("d/{i:04}");
            store.ensure_ancestor_dirs(&p).unwrap();
            store.insert_file(&p, 0, i * 10, 10, None, &Metadata::none()).unwrap();
        }
        store.delete_dir_recursive("d").unwrap();
        assert!(store.dir_stat("d").unwrap().is_none());
        assert!(!store.file_exists("d/0000").unwrap());
        let root = store.dir_stat("").unwrap().unwrap();
        assert_eq!(root.num_subdirs, 0);
        assert_eq!(root.size_tree, 0);
    }
}
