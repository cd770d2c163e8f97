use crate::error::ValidationError;
use crate::event::{RawEvent, RawEventKind};
use crate::filter::PathFilter;
use crate::op::{ContentSource, EntryKind, SyncOperation};
use crate::path::{PathNormalizer, RelPath};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Maps raw watcher events onto canonical [`SyncOperation`]s.
#[derive(Debug, Clone)]
pub struct EventTranslator {
    normalizer: PathNormalizer,
    filter: Arc<PathFilter>,
}

impl EventTranslator {
    pub fn new(normalizer: PathNormalizer, filter: Arc<PathFilter>) -> Self {
        Self { normalizer, filter }
    }

    /// Operations for one event, in the order they must be applied.
    ///
    /// Events outside the root or rejected by the filter yield nothing. A malformed path
    /// is a `ValidationError` for this event only.
    pub fn translate(&self, event: &RawEvent) -> Result<Vec<SyncOperation>, ValidationError> {
        let kind = if event.is_dir {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        if let Some(dest) = event.dest.as_deref() {
            return self.translate_move(&event.path, dest, kind);
        }

        let Some(path) = self.accept(&event.path, event.is_dir)? else {
            return Ok(Vec::new());
        };
        let ops = match (event.kind, kind) {
            (RawEventKind::Created, EntryKind::Directory) => self.created_tree(path),
            (RawEventKind::Created | RawEventKind::Modified, EntryKind::File) => {
                vec![self.put(path)]
            }
            // a directory's own modification is visible through its children's events
            (RawEventKind::Modified, EntryKind::Directory) => Vec::new(),
            (RawEventKind::Deleted, EntryKind::Directory) => vec![SyncOperation::RemoveDir(path)],
            (RawEventKind::Deleted, EntryKind::File) => vec![SyncOperation::DeleteFile(path)],
            // a move without a destination carries nothing to mirror
            (RawEventKind::Moved, _) => {
                warn!(path = %path, "move event without destination");
                Vec::new()
            }
        };
        Ok(ops)
    }

    fn translate_move(
        &self,
        from: &Path,
        to: &Path,
        kind: EntryKind,
    ) -> Result<Vec<SyncOperation>, ValidationError> {
        let from_rel = self.accept(from, kind.is_dir())?;
        let to_rel = self.accept(to, kind.is_dir())?;
        let ops = match (from_rel, to_rel) {
            (Some(from), Some(to)) if from == to => Vec::new(),
            (Some(from), Some(to)) => vec![SyncOperation::Move { from, to, kind }],
            // moved out of the synced tree
            (Some(from), None) => match kind {
                EntryKind::Directory => vec![SyncOperation::RemoveDir(from)],
                EntryKind::File => vec![SyncOperation::DeleteFile(from)],
            },
            // moved in from outside
            (None, Some(to)) => match kind {
                EntryKind::Directory => self.created_tree(to),
                EntryKind::File => vec![self.put(to)],
            },
            (None, None) => Vec::new(),
        };
        Ok(ops)
    }

    /// `Ok(None)` for paths outside the root or filtered out.
    fn accept(&self, path: &Path, is_dir: bool) -> Result<Option<RelPath>, ValidationError> {
        let rel = match self.normalizer.normalize(path) {
            Ok(rel) => rel,
            Err(ValidationError::OutsideRoot(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !self.filter.allows(rel.as_str(), is_dir) {
            debug!(path = %rel, "filtered out");
            return Ok(None);
        }
        Ok(Some(rel))
    }

    fn put(&self, path: RelPath) -> SyncOperation {
        let source = ContentSource::new(self.normalizer.to_local(&path));
        SyncOperation::PutFile(path, source)
    }

    /// `CreateDir` for a new directory plus whatever already sits beneath it: a tree moved in
    /// from outside the root is reported as a single directory creation.
    fn created_tree(&self, dir: RelPath) -> Vec<SyncOperation> {
        let local = self.normalizer.to_local(&dir);
        let mut ops = vec![SyncOperation::CreateDir(dir)];
        let walker = WalkDir::new(&local).min_depth(1).into_iter();
        for entry in walker.filter_entry(|e| self.walk_allows(e)) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!(error = %e, "entry vanished while expanding new directory");
                    continue;
                }
            };
            let rel = match self.normalizer.normalize(entry.path()) {
                Ok(rel) => rel,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "skipping unsyncable path");
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                ops.push(SyncOperation::CreateDir(rel));
            } else if entry.file_type().is_file() {
                ops.push(self.put(rel));
            }
        }
        ops
    }

    fn walk_allows(&self, entry: &walkdir::DirEntry) -> bool {
        self.normalizer
            .normalize(entry.path())
            .map(|rel| self.filter.allows(rel.as_str(), entry.file_type().is_dir()))
            .unwrap_or(false)
    }
}
