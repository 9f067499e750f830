//! Schema DDL and the small set of config keys the engine recognizes.

pub const SCHEMA_VERSION_MAJOR: i64 = 1;
pub const SCHEMA_VERSION_MINOR: i64 = 0;

pub const CONFIG_USE_TRIGGERS: &str = "use_triggers";
pub const CONFIG_SHARD_SIZE_LIMIT: &str = "shard_size_limit";
pub const CONFIG_SCHEMA_VERSION_MAJOR: &str = "schema_version_major";
pub const CONFIG_SCHEMA_VERSION_MINOR: &str = "schema_version_minor";

/// Default shard size cap: effectively unbounded (2^63 - 1).
pub const DEFAULT_SHARD_SIZE_LIMIT: i64 = i64::MAX;

pub const CREATE_FILES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    path      TEXT PRIMARY KEY,
    parent    TEXT NOT NULL,
    shard     INTEGER NOT NULL,
    offset    INTEGER NOT NULL,
    size      INTEGER NOT NULL,
    crc32c    INTEGER,
    mode      INTEGER,
    uid       INTEGER,
    gid       INTEGER,
    mtime_ns  INTEGER
)
"#;

pub const CREATE_FILES_PARENT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS files_parent_idx ON files(parent)";

pub const CREATE_FILES_SHARD_OFFSET_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS files_shard_offset_idx ON files(shard, offset)";

pub const CREATE_DIRS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dirs (
    path            TEXT PRIMARY KEY,
    parent          TEXT,
    num_subdirs     INTEGER NOT NULL DEFAULT 0,
    num_files       INTEGER NOT NULL DEFAULT 0,
    num_files_tree  INTEGER NOT NULL DEFAULT 0,
    size_tree       INTEGER NOT NULL DEFAULT 0,
    mode            INTEGER,
    uid             INTEGER,
    gid             INTEGER,
    mtime_ns        INTEGER
)
"#;

pub const CREATE_DIRS_PARENT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS dirs_parent_idx ON dirs(parent)";

pub const CREATE_CONFIG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS config (
    key        TEXT PRIMARY KEY,
    value_text TEXT,
    value_int  INTEGER
)
"#;

pub const INSERT_ROOT_DIR: &str =
    "INSERT OR IGNORE INTO dirs (path, parent) VALUES ('', NULL)";

pub fn all_ddl() -> &'static [&'static str] {
    &[
        CREATE_FILES_TABLE,
        CREATE_FILES_PARENT_INDEX,
        CREATE_FILES_SHARD_OFFSET_INDEX,
        CREATE_DIRS_TABLE,
        CREATE_DIRS_PARENT_INDEX,
        CREATE_CONFIG_TABLE,
        INSERT_ROOT_DIR,
    ]
}
