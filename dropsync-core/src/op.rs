use crate::path::RelPath;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::File;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn is_dir(self) -> bool {
        self == EntryKind::Directory
    }
}

/// Deferred reference to the bytes of a local file.
///
/// Nothing is read when the operation is created; every [`open`](Self::open) sees whatever
/// the file contains at that moment, so a file that keeps growing is uploaded in its latest form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSource {
    local: PathBuf,
}

impl ContentSource {
    pub fn new(local: impl Into<PathBuf>) -> Self {
        Self {
            local: local.into(),
        }
    }

    pub fn local_path(&self) -> &Path {
        &self.local
    }

    pub async fn open(&self) -> std::io::Result<LocalContent> {
        let file = File::open(&self.local).await?;
        let meta = file.metadata().await?;
        if meta.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "content source is a directory",
            ));
        }
        Ok(LocalContent {
            file,
            len: meta.len(),
        })
    }
}

/// An opened content source, handed to [`RemoteStore::store`](crate::RemoteStore::store).
#[derive(Debug)]
pub struct LocalContent {
    pub file: File,
    /// Size at open time. The reader may yield more if the file grows meanwhile.
    pub len: u64,
}

/// Canonical, idempotent unit of remote mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOperation {
    CreateDir(RelPath),
    RemoveDir(RelPath),
    PutFile(RelPath, ContentSource),
    DeleteFile(RelPath),
    Move {
        from: RelPath,
        to: RelPath,
        kind: EntryKind,
    },
}

impl SyncOperation {
    /// The path the operation acts on (the destination for moves).
    pub fn path(&self) -> &RelPath {
        match self {
            SyncOperation::CreateDir(p)
            | SyncOperation::RemoveDir(p)
            | SyncOperation::PutFile(p, _)
            | SyncOperation::DeleteFile(p) => p,
            SyncOperation::Move { to, .. } => to,
        }
    }

    /// Whether this operation must stay ordered with respect to anything acting on `path`.
    pub fn touches(&self, path: &RelPath) -> bool {
        match self {
            SyncOperation::Move { from, to, .. } => from.overlaps(path) || to.overlaps(path),
            other => other.path().overlaps(path),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncOperation::CreateDir(_) => "create_dir",
            SyncOperation::RemoveDir(_) => "remove_dir",
            SyncOperation::PutFile(..) => "put_file",
            SyncOperation::DeleteFile(_) => "delete_file",
            SyncOperation::Move { .. } => "move",
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOperation::Move { from, to, .. } => write!(f, "move {from} -> {to}"),
            other => write!(f, "{} {}", other.name(), other.path()),
        }
    }
}
