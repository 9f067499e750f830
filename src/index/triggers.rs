//! SQL triggers maintaining the per-directory aggregates of invariant (4).
//!
//! Every trigger is guarded by `config.use_triggers` so a bulk import can disable them and call
//! [`rebuild_aggregates`] once at the end instead of paying per-row trigger overhead. Propagation
//! is upward only: a file or directory insert/delete/move/resize updates its immediate parent,
//! and an update to a directory's own tree aggregates (`dirs_au_resize`) re-fires for the
//! grandparent, chaining all the way to root. This requires `recursive_triggers` to be on, since
//! one trigger's UPDATE on `dirs` must be able to fire another trigger on `dirs`.

use rusqlite::Connection;

use crate::error::Result;

const USE_TRIGGERS_GUARD: &str =
    "(SELECT value_int FROM config WHERE key = 'use_triggers') = 1";

pub fn install(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        r#"
        CREATE TRIGGER IF NOT EXISTS files_ai AFTER INSERT ON files
        WHEN {guard}
        BEGIN
            UPDATE dirs SET
                num_files = num_files + 1,
                num_files_tree = num_files_tree + 1,
                size_tree = size_tree + NEW.size
            WHERE path = NEW.parent;
        END;

        CREATE TRIGGER IF NOT EXISTS files_ad AFTER DELETE ON files
        WHEN {guard}
        BEGIN
            UPDATE dirs SET
                num_files = num_files - 1,
                num_files_tree = num_files_tree - 1,
                size_tree = size_tree - OLD.size
            WHERE path = OLD.parent;
        END;

        CREATE TRIGGER IF NOT EXISTS files_au_move AFTER UPDATE OF parent ON files
        WHEN {guard} AND NEW.parent IS NOT OLD.parent
        BEGIN
            UPDATE dirs SET
                num_files = num_files - 1,
                num_files_tree = num_files_tree - 1,
                size_tree = size_tree - OLD.size
            WHERE path = OLD.parent;
            UPDATE dirs SET
                num_files = num_files + 1,
                num_files_tree = num_files_tree + 1,
                size_tree = size_tree + NEW.size
            WHERE path = NEW.parent;
        END;

        CREATE TRIGGER IF NOT EXISTS files_au_resize AFTER UPDATE OF size ON files
        WHEN {guard} AND NEW.parent IS OLD.parent AND NEW.size IS NOT OLD.size
        BEGIN
            UPDATE dirs SET size_tree = size_tree + (NEW.size - OLD.size)
            WHERE path = NEW.parent;
        END;

        CREATE TRIGGER IF NOT EXISTS dirs_ai AFTER INSERT ON dirs
        WHEN {guard} AND NEW.parent IS NOT NULL
        BEGIN
            UPDATE dirs SET num_subdirs = num_subdirs + 1 WHERE path = NEW.parent;
        END;

        CREATE TRIGGER IF NOT EXISTS dirs_ad AFTER DELETE ON dirs
        WHEN {guard} AND OLD.parent IS NOT NULL
        BEGIN
            UPDATE dirs SET
                num_subdirs = num_subdirs - 1,
                num_files_tree = num_files_tree - OLD.num_files_tree,
                size_tree = size_tree - OLD.size_tree
            WHERE path = OLD.parent;
        END;

        CREATE TRIGGER IF NOT EXISTS dirs_au_move AFTER UPDATE OF parent ON dirs
        WHEN {guard} AND NEW.parent IS NOT OLD.parent
        BEGIN
            UPDATE dirs SET
                num_subdirs = num_subdirs - 1,
                num_files_tree = num_files_tree - OLD.num_files_tree,
                size_tree = size_tree - OLD.size_tree
            WHERE path = OLD.parent;
            UPDATE dirs SET
                num_subdirs = num_subdirs + 1,
                num_files_tree = num_files_tree + NEW.num_files_tree,
                size_tree = size_tree + NEW.size_tree
            WHERE path = NEW.parent;
        END;

        CREATE TRIGGER IF NOT EXISTS dirs_au_resize AFTER UPDATE OF num_files_tree, size_tree ON dirs
        WHEN {guard}
            AND NEW.parent IS OLD.parent AND NEW.parent IS NOT NULL
            AND (NEW.num_files_tree IS NOT OLD.num_files_tree OR NEW.size_tree IS NOT OLD.size_tree)
        BEGIN
            UPDATE dirs SET
                num_files_tree = num_files_tree + (NEW.num_files_tree - OLD.num_files_tree),
                size_tree = size_tree + (NEW.size_tree - OLD.size_tree)
            WHERE path = NEW.parent;
        END;
        "#,
        guard = USE_TRIGGERS_GUARD
    ))?;
    Ok(())
}

/// Recomputes every directory's aggregates from scratch, deepest-first, ignoring
/// `use_triggers`. Used by the bulk-import fast path after a trigger-free insert pass, and by
/// `verify()` to detect trigger/recount divergence (reported as a corrupt index).
pub fn rebuild_aggregates(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        UPDATE dirs SET num_subdirs = (
            SELECT COUNT(*) FROM dirs AS child WHERE child.parent = dirs.path
        );

        UPDATE dirs SET num_files = (
            SELECT COUNT(*) FROM files WHERE files.parent = dirs.path
        );
        "#,
    )?;

    // num_files_tree/size_tree require bottom-up accumulation across arbitrary depth, which a
    // single UPDATE cannot express; walk directories deepest-first in Rust instead.
    let mut stmt = conn.prepare(
        "WITH RECURSIVE depth(path, d) AS ( \
            SELECT path, 0 FROM dirs WHERE parent IS NULL \
            UNION ALL \
            SELECT dirs.path, depth.d + 1 FROM dirs JOIN depth ON dirs.parent = depth.path \
        ) SELECT path FROM depth ORDER BY d DESC",
    )?;
    let paths: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    for path in paths {
        conn.execute(
            "UPDATE dirs SET
                num_files_tree = num_files + (
                    SELECT COALESCE(SUM(num_files_tree), 0) FROM dirs AS child WHERE child.parent = ?1
                ),
                size_tree = (
                    SELECT COALESCE(SUM(size), 0) FROM files WHERE files.parent = ?1
                ) + (
                    SELECT COALESCE(SUM(size_tree), 0) FROM dirs AS child WHERE child.parent = ?1
                )
            WHERE path = ?1",
            [&path],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::queries::Metadata;
    use crate::index::store::IndexStore;

    #[test]
    fn rebuild_matches_trigger_maintained_aggregates() {
        let store = IndexStore::open_in_memory().unwrap();
        store.insert_dir("a", &Metadata::none()).unwrap();
        store.insert_file("a/x", 0, 0, 60, None, &Metadata::none()).unwrap();
        store.insert_file("a/y", 0, 60, 60, None, &Metadata::none()).unwrap();

        let before = store.dir_stat("a").unwrap().unwrap();
        rebuild_aggregates(&store.conn().lock()).unwrap();
        let after = store.dir_stat("a").unwrap().unwrap();
        assert_eq!(before.size_tree, after.size_tree);
        assert_eq!(before.num_files_tree, after.num_files_tree);
    }
}
