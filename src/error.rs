//! Error taxonomy for the dedup pipeline.
//!
//! Skip-class failures (one file or one block dropped) never produce an
//! `Error` value that propagates out of the engine — they are logged and
//! folded into the run's counters as they happen. Only storage-reliability
//! failures and CLI misuse reach `main`.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Scratch storage (hash-storage runs, the chunk file) failed in a way
    /// the core treats as unrecoverable: disk full, short read, a broken
    /// invariant. The run aborts.
    #[error("fatal storage error: {0}")]
    Fatal(String),

    /// Wraps an I/O failure from a path the core treats as reliable.
    #[error("fatal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Command-line usage error; the caller should print help and exit
    /// non-zero without running any part of the pipeline.
    #[error("usage error: {0}")]
    Cli(String),
}

impl Error {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }
}

/// Why a whole file was dropped from processing.
#[derive(Debug)]
pub enum SkipFileReason {
    NotRegularFile,
    Stat(std::io::Error),
    Open(std::io::Error),
    ExtentQuery(std::io::Error),
    Empty,
}

impl std::fmt::Display for SkipFileReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipFileReason::NotRegularFile => write!(f, "not a regular file"),
            SkipFileReason::Stat(e) => write!(f, "lstat failed: {e}"),
            SkipFileReason::Open(e) => write!(f, "open failed: {e}"),
            SkipFileReason::ExtentQuery(e) => write!(f, "extent query failed: {e}"),
            SkipFileReason::Empty => write!(f, "empty file"),
        }
    }
}

/// Identifies the file a skip-file warning refers to, for logging.
#[derive(Debug, Clone)]
pub struct FileContext {
    pub path: PathBuf,
}

/// Why a single block was dropped from processing, as opposed to the whole
/// file it belongs to.
#[derive(Debug)]
pub enum SkipBlockReason {
    LseekFailed(std::io::Error),
    ReadFailed(std::io::Error),
    CopyRangeFailed,
    DedupNotCollapsed,
}

impl std::fmt::Display for SkipBlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipBlockReason::LseekFailed(e) => write!(f, "lseek failed: {e}"),
            SkipBlockReason::ReadFailed(e) => write!(f, "read failed: {e}"),
            SkipBlockReason::CopyRangeFailed => write!(f, "copy_range failed"),
            SkipBlockReason::DedupNotCollapsed => write!(f, "dedup range not fully collapsed"),
        }
    }
}

/// Identifies the block a skip-block warning refers to: a file path plus
/// byte offset below the logical-id mapping (extent enumeration), or a
/// logical block id above it (the dedup engine).
#[derive(Debug, Clone)]
pub enum BlockContext {
    FileOffset { path: PathBuf, offset: u64 },
    LogicalId(u64),
}

impl std::fmt::Display for BlockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockContext::FileOffset { path, offset } => write!(f, "{}@{offset}", path.display()),
            BlockContext::LogicalId(id) => write!(f, "logical_id={id}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
