use crate::filter::PathFilter;
use crate::op::EntryKind;
use crate::path::PathNormalizer;
use crate::path::RelPath;
use crate::remote::RemoteEntry;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub kind: EntryKind,
    pub size: u64,
    /// Directories never carry a hash.
    pub hash: Option<String>,
    pub modified: Option<u64>,
}

impl SnapshotEntry {
    pub fn dir() -> Self {
        Self {
            kind: EntryKind::Directory,
            size: 0,
            hash: None,
            modified: None,
        }
    }

    pub fn file(size: u64, hash: Option<String>, modified: Option<u64>) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            hash,
            modified,
        }
    }
}

/// Point-in-time view of one tree, keyed by store-relative path.
///
/// Ordered so that iteration always visits a directory before anything beneath it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSnapshot {
    entries: BTreeMap<RelPath, SnapshotEntry>,
}

impl TreeSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: RelPath, entry: SnapshotEntry) {
        self.entries.insert(path, entry);
    }

    pub fn get(&self, path: &RelPath) -> Option<&SnapshotEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&RelPath, &SnapshotEntry)> {
        self.entries.iter()
    }

    /// Walks `root` and records every directory and regular file accepted by `filter`.
    /// Symlinks are not followed and not recorded. Files are hashed when `with_hashes` is set.
    pub fn scan_local(root: &Path, filter: &PathFilter, with_hashes: bool) -> io::Result<Self> {
        let normalizer = PathNormalizer::new(root);
        let mut snapshot = Self::new();
        let walker = WalkDir::new(root).min_depth(1).into_iter();
        for entry in walker.filter_entry(|e| {
            normalizer
                .normalize(e.path())
                .map(|rel| filter.allows(rel.as_str(), e.file_type().is_dir()))
                .unwrap_or(false)
        }) {
            let entry = match entry {
                Ok(e) => e,
                // the tree keeps changing under us; later events cover what vanished
                Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            let rel = match normalizer.normalize(entry.path()) {
                Ok(rel) => rel,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "skipping unsyncable path");
                    continue;
                }
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                snapshot.insert(rel, SnapshotEntry::dir());
            } else if file_type.is_file() {
                let meta = match entry.metadata() {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs());
                let hash = if with_hashes {
                    match hash_file(entry.path()) {
                        Ok(h) => Some(h),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e),
                    }
                } else {
                    None
                };
                snapshot.insert(rel, SnapshotEntry::file(meta.len(), hash, modified));
            } else {
                debug!(path = %entry.path().display(), "ignoring special file");
            }
        }
        Ok(snapshot)
    }

    /// Builds a snapshot from a remote listing, applying the same filter as the local side.
    pub fn from_remote(entries: Vec<RemoteEntry>, filter: &PathFilter) -> Self {
        let mut snapshot = Self::new();
        for e in entries {
            if !filter.allows(e.path.as_str(), e.kind.is_dir()) {
                continue;
            }
            let entry = match e.kind {
                EntryKind::Directory => SnapshotEntry::dir(),
                EntryKind::File => SnapshotEntry::file(e.size, e.hash, e.modified),
            };
            snapshot.insert(e.path, entry);
        }
        snapshot
    }
}

/// Hex blake3 digest of a local file.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut file = std::fs::File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}
