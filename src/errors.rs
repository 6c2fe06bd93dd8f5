//! Error kinds surfaced by the storage engine.
//!
//! Every fallible operation in this crate returns a value, never panics on bad
//! input. `StoreError::status_code` centralizes the kind -> HTTP status mapping so
//! call sites in `http/` never have to re-derive it.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed volume id, needle id, or file id.
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// Volume or needle does not exist (or is tombstoned).
    #[error("not found")]
    NotFound,

    /// The cookie presented by the caller does not match the one stored with the
    /// needle. Reported distinctly from `NotFound` only internally; at the HTTP
    /// boundary both map to 404 so key existence is never disclosed.
    #[error("cookie mismatch")]
    CookieMismatch,

    /// Stored CRC32 does not match the needle's data.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A record's on-disk framing is internally inconsistent (bad magic, size
    /// that would run past the file, footer misaligned, etc).
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Append would grow the volume past the 32 GiB padded-offset limit.
    #[error("volume is full")]
    VolumeFull,

    /// `/admin/sync/data` requested against a stale `CompactRevision`.
    #[error("stale compaction revision")]
    RevisionStale,

    /// Requested byte range cannot be satisfied against the resource length.
    #[error("range not satisfiable")]
    RangeNotSatisfiable,

    /// Per-volume writer rejected an append/delete because a compaction swap is
    /// in progress.
    #[error("volume busy")]
    Busy,

    /// Underlying filesystem or network failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Maps an error kind to the HTTP status it should be reported as.
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::InvalidId(_) => 400,
            StoreError::NotFound => 404,
            StoreError::CookieMismatch => 404,
            StoreError::ChecksumMismatch => 404,
            StoreError::Corrupt(_) => 404,
            StoreError::VolumeFull => 507,
            StoreError::RevisionStale => 417,
            StoreError::RangeNotSatisfiable => 416,
            StoreError::Busy => 503,
            StoreError::Io(_) => 500,
        }
    }
}
