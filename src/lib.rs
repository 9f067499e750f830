//! Aggregate storage format for very large collections of small immutable blobs.
//!
//! A barecat archive is a pair of on-disk structures: one or more append-only shard files
//! holding raw blob bytes back to back, and a SQLite index file mapping archive paths to
//! `(shard, offset, size)` plus directory aggregate statistics kept current by triggers. Reads
//! go index → shard; writes go shard (append) → index (record). See [`Session`] for the public
//! entry point.

pub mod allocator;
pub mod cancel;
pub mod defrag;
pub mod dirview;
pub mod error;
pub mod index;
pub mod mutator;
pub mod path;
pub mod reader;
pub mod session;
pub mod shard;

pub use cancel::{CancellationSource, CancellationToken, CANCEL_CHECK_INTERVAL};
pub use defrag::{DefragMode, DefragReport};
pub use dirview::{Stat, WalkEntry, WalkIter};
pub use error::{BarecatError, Result};
pub use index::{DirStat, FileRow, Metadata};
pub use mutator::RenameFlags;
pub use path::GlobPattern;
pub use session::{BlobReader, ChecksumMismatch, OpenMode, OpenOptions, Session};
pub use shard::Blob;
