use crate::path::RelPath;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a [`RemoteStore`](crate::RemoteStore) primitive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection-level failure (reset, timeout, lost session). Worth retrying.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no such path on remote: {0}")]
    NotFound(String),
    #[error("path already exists on remote: {0}")]
    AlreadyExists(String),
    /// Any other refusal by the remote (permissions, non-empty directory, ...).
    #[error("rejected by remote: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }
}

/// A local path that cannot be expressed as a store-relative path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty path")]
    Empty,
    #[error("{0} is outside the sync root")]
    OutsideRoot(PathBuf),
    #[error("path {0:?} contains a `.` or `..` component")]
    RelativeComponent(String),
    #[error("path {0:?} contains an empty segment")]
    EmptySegment(String),
    #[error("path {0:?} is absolute")]
    Absolute(String),
    #[error("path {0:?} contains a backslash")]
    Backslash(String),
    #[error("{0} is not valid UTF-8")]
    NonUtf8(PathBuf),
}

/// Why a single operation ended `Failed-permanent`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport failure after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: RemoteError,
    },
    #[error("ordering conflict on {path}: {reason}")]
    OrderingConflict { path: RelPath, reason: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("cannot read local source {path}: {source}")]
    LocalSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Recovery signal: the trees may have diverged and need a full pass.
    #[error("remote tree needs a full reconciliation")]
    ReconciliationRequired,
}

/// A reconciliation pass could not even be planned.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("scanning local tree {root}: {source}")]
    LocalScan {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("listing remote tree: {0}")]
    RemoteList(#[source] SyncError),
}
