//! The relational metadata index: one SQLite database per archive, `<base>-sqlite-index`.

mod queries;
mod schema;
mod store;
mod triggers;

pub use queries::{DirStat, FileRow, Metadata};
pub use schema::{
    CONFIG_SCHEMA_VERSION_MAJOR, CONFIG_SCHEMA_VERSION_MINOR, CONFIG_SHARD_SIZE_LIMIT,
    CONFIG_USE_TRIGGERS, DEFAULT_SHARD_SIZE_LIMIT,
};
pub use store::IndexStore;

pub fn index_path(base: &std::path::Path) -> std::path::PathBuf {
    let base = base.to_string_lossy();
    std::path::PathBuf::from(format!("{base}-sqlite-index"))
}
