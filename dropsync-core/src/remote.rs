use crate::error::RemoteError;
use crate::op::{EntryKind, LocalContent};
use crate::path::RelPath;
use async_trait::async_trait;

/// Metadata of one remote entry, as returned by `stat` and `list_tree`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: RelPath,
    pub kind: EntryKind,
    pub size: u64,
    /// Seconds since the Unix epoch, when the backend reports it.
    pub modified: Option<u64>,
    /// Hex content hash, only from backends where [`RemoteStore::provides_hashes`] is true.
    pub hash: Option<String>,
}

/// Primitive operations of a sequential, session-oriented remote store.
///
/// All paths are relative to the store's sync root. Calls are issued one at a time by the
/// executor; implementations need not support concurrent use.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Creates one directory. Fails with `NotFound` when the parent is missing and
    /// `AlreadyExists` when something is already there.
    async fn make_dir(&self, path: &RelPath) -> Result<(), RemoteError>;

    /// Removes a directory together with everything beneath it.
    async fn remove_dir(&self, path: &RelPath) -> Result<(), RemoteError>;

    /// Creates or overwrites a file with the content read from `content`.
    async fn store(&self, path: &RelPath, content: &mut LocalContent) -> Result<(), RemoteError>;

    async fn delete(&self, path: &RelPath) -> Result<(), RemoteError>;

    async fn rename(&self, from: &RelPath, to: &RelPath) -> Result<(), RemoteError>;

    /// `Ok(None)` when nothing exists at `path`.
    async fn stat(&self, path: &RelPath) -> Result<Option<RemoteEntry>, RemoteError>;

    async fn exists(&self, path: &RelPath) -> Result<bool, RemoteError> {
        Ok(self.stat(path).await?.is_some())
    }

    /// Every entry below the root, parents before children.
    async fn list_tree(&self) -> Result<Vec<RemoteEntry>, RemoteError>;

    async fn ping(&self) -> Result<(), RemoteError>;

    /// Whether `list_tree` entries carry content hashes comparable to local blake3 hashes.
    fn provides_hashes(&self) -> bool {
        false
    }
}
