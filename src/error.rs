use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum BarecatError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("path already exists: {0}")]
    AlreadyExists(String),

    #[error("expected a directory: {0}")]
    NotDir(String),

    #[error("expected a file: {0}")]
    IsDir(String),

    #[error("directory is not empty: {0}")]
    DirNotEmpty(String),

    #[error("blob of {size} bytes exceeds shard_size_limit of {limit} bytes")]
    BlobTooLarge { size: u64, limit: u64 },

    #[error("shard {shard} would exceed its size cap")]
    ShardCapExceeded { shard: u32 },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid glob pattern: {0}")]
    InvalidPattern(String),

    #[error("index is corrupt: {0}")]
    CorruptIndex(String),

    #[error("shard I/O error on shard {shard}: {source}")]
    ShardIo {
        shard: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("checksum mismatch for {path}")]
    ChecksumMismatch { path: String },

    #[error("another writer already holds the archive lock")]
    ConcurrentWriter,

    #[error("zero-copy borrow cannot outlive its session")]
    BorrowOutlivesSession,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Index(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, BarecatError>;

impl BarecatError {
    /// True for errors an operation caller might reasonably retry (transient OS-level I/O
    /// conditions), as opposed to ones that reflect a permanent precondition failure.
    pub fn is_retriable(&self) -> bool {
        match self {
            BarecatError::ShardIo { source, .. } => is_retriable_io(source),
            BarecatError::Io(source) => is_retriable_io(source),
            _ => false,
        }
    }
}

fn is_retriable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
    )
}

/// Wraps a rusqlite constraint violation on a named path into the matching domain error,
/// since callers should never need to pattern-match SQLite error codes for an already-exists.
pub(crate) fn map_constraint_violation(err: rusqlite::Error, path: impl fmt::Display) -> BarecatError {
    use rusqlite::ffi::ErrorCode;
    use rusqlite::Error as SqlError;
    if let SqlError::SqliteFailure(ref e, _) = err {
        if e.code == ErrorCode::ConstraintViolation {
            return BarecatError::AlreadyExists(path.to_string());
        }
    }
    BarecatError::Index(err)
}
