//! Applies queued operations to the remote store.
//!
//! Each operation walks `Pending -> Applying -> {Applied | SatisfiedByFallback | FailedPermanent}`.
//! Transport errors are retried with bounded backoff. Application errors get exactly one
//! fallback probe of the remote state; blind retries cannot repair an ordering problem.

use crate::config::RetryPolicy;
use crate::error::{RemoteError, SyncError};
use crate::op::{ContentSource, EntryKind, SyncOperation};
use crate::path::RelPath;
use crate::queue::PendingEntry;
use crate::remote::{RemoteEntry, RemoteStore};
use crate::snapshot::hash_file;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Pending,
    Applying,
    Applied,
    SatisfiedByFallback,
    FailedPermanent,
}

/// Terminal result of applying one operation.
#[derive(Debug)]
pub enum Outcome {
    Applied,
    /// The operation failed but its intended effect was found already present.
    SatisfiedByFallback,
    FailedPermanent(SyncError),
}

impl Outcome {
    pub fn state(&self) -> OpState {
        match self {
            Outcome::Applied => OpState::Applied,
            Outcome::SatisfiedByFallback => OpState::SatisfiedByFallback,
            Outcome::FailedPermanent(_) => OpState::FailedPermanent,
        }
    }

    /// A permanent failure means the trees may have drifted apart.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, Outcome::FailedPermanent(_))
    }
}

#[derive(Debug)]
enum Failure {
    Remote(RemoteError),
    Exhausted { attempts: u32, source: RemoteError },
    Local(std::io::Error),
}

type Step<T> = Result<T, Failure>;

/// Sole issuer of remote commands for one sync task.
pub struct SyncExecutor<R: RemoteStore> {
    remote: Arc<R>,
    local_root: PathBuf,
    policy: RetryPolicy,
}

impl<R: RemoteStore> SyncExecutor<R> {
    pub fn new(remote: Arc<R>, local_root: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            remote,
            local_root: local_root.into(),
            policy,
        }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn apply(&self, entry: &PendingEntry) -> Outcome {
        debug!(seq = entry.seq, op = %entry.op, state = ?OpState::Applying, "applying");
        let outcome = match self.apply_op(&entry.op).await {
            Ok(outcome) => outcome,
            Err(failure) => Outcome::FailedPermanent(into_sync_error(entry.op.path(), failure)),
        };
        match &outcome {
            Outcome::Applied => debug!(seq = entry.seq, op = %entry.op, "applied"),
            Outcome::SatisfiedByFallback => {
                info!(seq = entry.seq, op = %entry.op, "already in effect on remote")
            }
            Outcome::FailedPermanent(e) => {
                warn!(seq = entry.seq, op = %entry.op, error = %e, "operation failed permanently")
            }
        }
        outcome
    }

    /// Full remote listing, with transport retries.
    pub async fn list_remote(&self) -> Result<Vec<RemoteEntry>, SyncError> {
        self.retry("list_tree", || async move {
            self.remote.list_tree().await.map_err(Failure::Remote)
        })
        .await
        .map_err(|f| session_error(f, &self.local_root))
    }

    pub async fn ping(&self) -> Result<(), SyncError> {
        self.retry("ping", || async move { self.remote.ping().await.map_err(Failure::Remote) })
            .await
            .map_err(|f| session_error(f, &self.local_root))
    }

    async fn apply_op(&self, op: &SyncOperation) -> Step<Outcome> {
        match op {
            SyncOperation::CreateDir(path) => self.create_dir(path).await,
            SyncOperation::RemoveDir(path) => self.remove_dir(path).await,
            SyncOperation::PutFile(path, source) => self.put_file(path, source).await,
            SyncOperation::DeleteFile(path) => self.delete_file(path).await,
            SyncOperation::Move { from, to, kind } => self.move_entry(from, to, *kind).await,
        }
    }

    async fn create_dir(&self, path: &RelPath) -> Step<Outcome> {
        if let Some(existing) = self.stat(path).await? {
            if existing.kind.is_dir() {
                return Ok(Outcome::Applied);
            }
        }
        match self.make_dir(path).await {
            Ok(()) => Ok(Outcome::Applied),
            Err(Failure::Remote(RemoteError::NotFound(_))) => {
                self.ensure_ancestors(path).await?;
                match self.make_dir(path).await {
                    Ok(()) => Ok(Outcome::Applied),
                    Err(Failure::Remote(e)) => self.dir_fallback(path, e).await,
                    Err(other) => Err(other),
                }
            }
            Err(Failure::Remote(e)) => self.dir_fallback(path, e).await,
            Err(other) => Err(other),
        }
    }

    async fn dir_fallback(&self, path: &RelPath, cause: RemoteError) -> Step<Outcome> {
        match self.stat(path).await? {
            Some(e) if e.kind.is_dir() => Ok(Outcome::SatisfiedByFallback),
            _ => Ok(conflict(path, format!("cannot create directory: {cause}"))),
        }
    }

    async fn remove_dir(&self, path: &RelPath) -> Step<Outcome> {
        let result = match self.stat(path).await? {
            None => return Ok(Outcome::Applied),
            // kind drifted since the event was observed
            Some(e) if !e.kind.is_dir() => self.delete(path).await,
            Some(_) => {
                self.retry("remove_dir", || async move {
                    self.remote.remove_dir(path).await.map_err(Failure::Remote)
                })
                .await
            }
        };
        self.absent_fallback(path, result).await
    }

    async fn delete_file(&self, path: &RelPath) -> Step<Outcome> {
        let result = match self.stat(path).await? {
            None => return Ok(Outcome::Applied),
            Some(e) if e.kind.is_dir() => {
                self.retry("remove_dir", || async move {
                    self.remote.remove_dir(path).await.map_err(Failure::Remote)
                })
                .await
            }
            Some(_) => self.delete(path).await,
        };
        self.absent_fallback(path, result).await
    }

    async fn absent_fallback(&self, path: &RelPath, result: Step<()>) -> Step<Outcome> {
        match result {
            Ok(()) => Ok(Outcome::Applied),
            Err(Failure::Remote(cause)) => match self.stat(path).await? {
                None => Ok(Outcome::SatisfiedByFallback),
                Some(_) => Ok(conflict(path, format!("cannot remove: {cause}"))),
            },
            Err(other) => Err(other),
        }
    }

    async fn put_file(&self, path: &RelPath, source: &ContentSource) -> Step<Outcome> {
        let cause = match self.store(path, source).await {
            Ok(()) => return Ok(Outcome::Applied),
            Err(Failure::Remote(RemoteError::NotFound(_))) => {
                // parent not there yet: the event for it may still be behind us in the queue
                self.ensure_ancestors(path).await?;
                match self.store(path, source).await {
                    Ok(()) => return Ok(Outcome::Applied),
                    Err(Failure::Remote(e)) => e,
                    Err(other) => return Err(other),
                }
            }
            Err(Failure::Remote(e)) => e,
            Err(Failure::Local(e)) => {
                // moved or deleted locally since the event; later events and a rescan settle it
                return Ok(Outcome::FailedPermanent(SyncError::LocalSource {
                    path: source.local_path().to_path_buf(),
                    source: e,
                }));
            }
            Err(other) => return Err(other),
        };

        let landed = match self.stat(path).await? {
            Some(e) if e.kind == EntryKind::File => matches_local(&e, source.local_path()).await,
            _ => false,
        };
        if landed {
            Ok(Outcome::SatisfiedByFallback)
        } else {
            Ok(conflict(path, format!("cannot store file: {cause}")))
        }
    }

    async fn move_entry(&self, from: &RelPath, to: &RelPath, kind: EntryKind) -> Step<Outcome> {
        let cause = match self
            .retry("rename", || async move {
                self.remote.rename(from, to).await.map_err(Failure::Remote)
            })
            .await
        {
            Ok(()) => return Ok(Outcome::Applied),
            Err(Failure::Remote(e)) => e,
            Err(other) => return Err(other),
        };

        // the move may already be reflected remotely, e.g. a second local move raced this one;
        // a source still present means the rename was refused, whatever sits at the destination
        if self.stat(from).await?.is_some() {
            return Ok(conflict(
                to,
                format!("move from {from} failed ({cause}) and the source is still there"),
            ));
        }
        let satisfied = match (kind, self.stat(to).await?) {
            (EntryKind::Directory, Some(e)) => e.kind.is_dir(),
            (EntryKind::File, Some(e)) if e.kind == EntryKind::File => {
                matches_local(&e, &to.to_local(&self.local_root)).await
            }
            _ => false,
        };
        if satisfied {
            Ok(Outcome::SatisfiedByFallback)
        } else {
            Ok(conflict(
                to,
                format!("move from {from} failed ({cause}) and destination does not reflect it"),
            ))
        }
    }

    /// Creates missing remote ancestors of `path`, outermost first.
    async fn ensure_ancestors(&self, path: &RelPath) -> Step<()> {
        let mut ancestors: Vec<RelPath> = path.ancestors().collect();
        ancestors.reverse();
        for dir in ancestors {
            match self.stat(&dir).await? {
                Some(e) if e.kind.is_dir() => continue,
                Some(_) => {
                    return Err(Failure::Remote(RemoteError::Rejected(format!(
                        "{dir} is a file, expected a directory"
                    ))))
                }
                None => {}
            }
            debug!(path = %dir, "creating missing ancestor");
            match self.make_dir(&dir).await {
                Ok(()) | Err(Failure::Remote(RemoteError::AlreadyExists(_))) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn stat(&self, path: &RelPath) -> Step<Option<RemoteEntry>> {
        self.retry("stat", || async move { self.remote.stat(path).await.map_err(Failure::Remote) })
            .await
    }

    async fn make_dir(&self, path: &RelPath) -> Step<()> {
        let result = self
            .retry("make_dir", || async move {
                self.remote.make_dir(path).await.map_err(Failure::Remote)
            })
            .await;
        if let Err(Failure::Remote(RemoteError::AlreadyExists(_))) = &result {
            // only a directory satisfies a directory creation
            if matches!(self.stat(path).await?, Some(e) if e.kind.is_dir()) {
                return Ok(());
            }
        }
        result
    }

    async fn delete(&self, path: &RelPath) -> Step<()> {
        self.retry("delete", || async move {
            self.remote.delete(path).await.map_err(Failure::Remote)
        })
        .await
    }

    /// Content is re-opened on every attempt so each one sends the current bytes.
    async fn store(&self, path: &RelPath, source: &ContentSource) -> Step<()> {
        self.retry("store", || async move {
            let mut content = source.open().await.map_err(Failure::Local)?;
            self.remote
                .store(path, &mut content)
                .await
                .map_err(Failure::Remote)
        })
        .await
    }

    async fn retry<T, F, Fut>(&self, what: &'static str, mut attempt: F) -> Step<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Step<T>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Err(Failure::Remote(e)) if e.is_transport() => {
                    if retries >= self.policy.max_retries {
                        return Err(Failure::Exhausted {
                            attempts: retries + 1,
                            source: e,
                        });
                    }
                    let delay = self.policy.backoff(retries);
                    warn!(
                        call = what,
                        attempt = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transport error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                other => return other,
            }
        }
    }
}

fn conflict(path: &RelPath, reason: String) -> Outcome {
    Outcome::FailedPermanent(SyncError::OrderingConflict {
        path: path.clone(),
        reason,
    })
}

fn into_sync_error(path: &RelPath, failure: Failure) -> SyncError {
    match failure {
        Failure::Exhausted { attempts, source } => SyncError::Transport { attempts, source },
        Failure::Remote(e) => SyncError::OrderingConflict {
            path: path.clone(),
            reason: e.to_string(),
        },
        Failure::Local(source) => SyncError::LocalSource {
            path: PathBuf::from(path.as_str()),
            source,
        },
    }
}

/// Errors of calls not tied to one operation (listing, liveness).
fn session_error(failure: Failure, root: &Path) -> SyncError {
    match failure {
        Failure::Exhausted { attempts, source } => SyncError::Transport { attempts, source },
        Failure::Remote(e) => SyncError::Remote(e),
        Failure::Local(source) => SyncError::LocalSource {
            path: root.to_path_buf(),
            source,
        },
    }
}

async fn local_file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

/// Whether `remote` holds what the local file at `local` holds now: same size, and the same
/// content hash when the backend reports one.
async fn matches_local(remote: &RemoteEntry, local: &Path) -> bool {
    if Some(remote.size) != local_file_size(local).await {
        return false;
    }
    let Some(expected) = remote.hash.clone() else {
        return true;
    };
    let local = local.to_path_buf();
    matches!(
        tokio::task::spawn_blocking(move || hash_file(&local)).await,
        Ok(Ok(actual)) if actual == expected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;

    fn p(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    fn entry(op: SyncOperation) -> PendingEntry {
        PendingEntry { seq: 1, op }
    }

    fn executor(
        root: &std::path::Path,
        remote: &Arc<MemoryRemote>,
        retries: u32,
    ) -> SyncExecutor<MemoryRemote> {
        SyncExecutor::new(remote.clone(), root, RetryPolicy::immediate(retries))
    }

    #[tokio::test]
    async fn existing_directory_is_not_recreated() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed_dir("a").unwrap();
        let exec = executor(std::path::Path::new("/w"), &remote, 0);
        let out = exec.apply(&entry(SyncOperation::CreateDir(p("a")))).await;
        assert_eq!(out.state(), OpState::Applied);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn put_ahead_of_its_directory_creates_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/c.txt"), "c").unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let exec = executor(dir.path(), &remote, 0);

        let source = ContentSource::new(dir.path().join("a/b/c.txt"));
        let put = SyncOperation::PutFile(p("a/b/c.txt"), source);
        assert_eq!(exec.apply(&entry(put)).await.state(), OpState::Applied);
        // the late CreateDir is then a no-op
        let mkdir = exec.apply(&entry(SyncOperation::CreateDir(p("a")))).await;
        assert_eq!(mkdir.state(), OpState::Applied);

        assert_eq!(remote.calls(), vec!["make_dir a", "make_dir a/b", "store a/b/c.txt"]);
        assert_eq!(remote.file_content("a/b/c.txt").as_deref(), Some(&b"c"[..]));
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next_transport(2);
        let exec = executor(std::path::Path::new("/w"), &remote, 3);
        let out = exec.apply(&entry(SyncOperation::CreateDir(p("a")))).await;
        assert_eq!(out.state(), OpState::Applied);
        assert_eq!(remote.paths(), vec!["a/"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_exponentially() {
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next_transport(3);
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: std::time::Duration::from_secs(1),
            max_backoff: std::time::Duration::from_secs(3),
        };
        let exec = SyncExecutor::new(remote.clone(), "/w", policy);
        let started = tokio::time::Instant::now();
        let out = exec.apply(&entry(SyncOperation::CreateDir(p("a")))).await;
        assert_eq!(out.state(), OpState::Applied);
        // 1s + 2s + 3s (capped)
        assert_eq!(started.elapsed().as_secs(), 6);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_permanently() {
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next_transport(10);
        let exec = executor(std::path::Path::new("/w"), &remote, 2);
        let out = exec.apply(&entry(SyncOperation::CreateDir(p("a")))).await;
        assert!(out.needs_reconciliation());
        match out {
            Outcome::FailedPermanent(SyncError::Transport { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(source.is_transport());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_move_with_matching_destination_is_satisfied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("y"), "same").unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.seed_file("y", "same").unwrap();
        let exec = executor(dir.path(), &remote, 0);

        let mv = SyncOperation::Move {
            from: p("x"),
            to: p("y"),
            kind: EntryKind::File,
        };
        let out = exec.apply(&entry(mv)).await;
        assert_eq!(out.state(), OpState::SatisfiedByFallback);
    }

    #[tokio::test]
    async fn failed_move_with_other_content_needs_reconciliation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("y"), "same").unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.seed_file("y", "something longer").unwrap();
        let exec = executor(dir.path(), &remote, 0);

        let mv = SyncOperation::Move {
            from: p("x"),
            to: p("y"),
            kind: EntryKind::File,
        };
        match exec.apply(&entry(mv)).await {
            Outcome::FailedPermanent(SyncError::OrderingConflict { path, .. }) => {
                assert_eq!(path, p("y"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_move_with_source_still_present_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "aaaa").unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.seed_file("a.txt", "aaaa").unwrap();
        remote.seed_file("b.txt", "aaaa").unwrap();
        let exec = executor(dir.path(), &remote, 0);

        let mv = SyncOperation::Move {
            from: p("a.txt"),
            to: p("b.txt"),
            kind: EntryKind::File,
        };
        let out = exec.apply(&entry(mv)).await;
        assert!(out.needs_reconciliation(), "{out:?}");

        // same for a directory landing on an existing one
        remote.seed_file("d/e.txt", "e").unwrap();
        remote.seed_dir("d2").unwrap();
        let mv = SyncOperation::Move {
            from: p("d"),
            to: p("d2"),
            kind: EntryKind::Directory,
        };
        assert!(exec.apply(&entry(mv)).await.needs_reconciliation());
    }

    #[tokio::test]
    async fn equal_size_is_not_equal_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("y"), "wxyz").unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.seed_file("y", "abcd").unwrap();
        let exec = executor(dir.path(), &remote, 0);

        let mv = SyncOperation::Move {
            from: p("x"),
            to: p("y"),
            kind: EntryKind::File,
        };
        assert_eq!(exec.apply(&entry(mv)).await.state(), OpState::FailedPermanent);
    }

    #[tokio::test]
    async fn removals_of_absent_or_drifted_entries() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed_file("d/inner.txt", "i").unwrap();
        remote.seed_file("f", "f").unwrap();
        let exec = executor(std::path::Path::new("/w"), &remote, 0);

        for op in [
            SyncOperation::DeleteFile(p("gone")),
            SyncOperation::RemoveDir(p("gone")),
            // reported as a file, but it is a directory remotely
            SyncOperation::DeleteFile(p("d")),
            SyncOperation::RemoveDir(p("f")),
        ] {
            assert_eq!(exec.apply(&entry(op)).await.state(), OpState::Applied);
        }
        assert!(remote.paths().is_empty());
    }

    #[tokio::test]
    async fn vanished_local_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let exec = executor(dir.path(), &remote, 0);
        let source = ContentSource::new(dir.path().join("lost.txt"));
        let put = SyncOperation::PutFile(p("lost.txt"), source);
        match exec.apply(&entry(put)).await {
            Outcome::FailedPermanent(SyncError::LocalSource { path, .. }) => {
                assert_eq!(path, dir.path().join("lost.txt"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(remote.calls().is_empty());
    }
}
