//! Wires the translator, queue, differ and executor into one sync engine.

use crate::config::{RetryPolicy, TaskConfig};
use crate::diff;
use crate::error::{ReconcileError, SyncError};
use crate::event::RawEvent;
use crate::executor::{OpState, Outcome, SyncExecutor};
use crate::filter::PathFilter;
use crate::path::PathNormalizer;
use crate::queue::{OperationQueue, PendingEntry};
use crate::remote::RemoteStore;
use crate::snapshot::TreeSnapshot;
use crate::translate::EventTranslator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Recovery passes `run_until_idle` performs before giving up on quiescence.
const MAX_RECOVERY_ROUNDS: u32 = 4;

/// Counters of terminal outcomes since the engine was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub applied: u64,
    pub satisfied: u64,
    pub failed: u64,
    pub reconciliations: u64,
}

/// Producer side of the engine: turns raw events into queued operations.
///
/// Cheap to clone; the watcher forwarder owns one while the executor drains the queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    translator: EventTranslator,
    queue: Arc<OperationQueue>,
}

impl EventSink {
    /// Translates and queues one event. Returns how many operations were queued.
    pub fn submit(&self, event: &RawEvent) -> usize {
        let ops = match self.translator.translate(event) {
            Ok(ops) => ops,
            Err(e) => {
                let err = SyncError::from(e);
                warn!(path = %event.path.display(), error = %err, "dropping event");
                return 0;
            }
        };
        let mut queued = 0;
        for op in ops {
            trace!(op = %op, state = ?OpState::Pending, "queueing");
            if self.queue.enqueue(op).is_some() {
                queued += 1;
            }
        }
        queued
    }

    /// Submits a batch on the blocking pool. Translation may walk a directory that was moved
    /// into the root, which must not stall the runtime.
    pub async fn submit_blocking(&self, events: Vec<RawEvent>) -> usize {
        if events.is_empty() {
            return 0;
        }
        let sink = self.clone();
        match tokio::task::spawn_blocking(move || events.iter().map(|e| sink.submit(e)).sum())
            .await
        {
            Ok(queued) => queued,
            Err(e) => {
                warn!(error = %e, "event translation aborted");
                0
            }
        }
    }
}

pub struct SyncEngine<R: RemoteStore> {
    root: PathBuf,
    filter: Arc<PathFilter>,
    sink: EventSink,
    queue: Arc<OperationQueue>,
    executor: SyncExecutor<R>,
    reconcile_pending: bool,
    // consecutive recovery passes triggered by failures
    recovery_round: u32,
    stats: SyncStats,
}

impl<R: RemoteStore> SyncEngine<R> {
    pub fn new(
        root: impl Into<PathBuf>,
        filter: PathFilter,
        remote: Arc<R>,
        policy: RetryPolicy,
    ) -> Self {
        let root = root.into();
        let filter = Arc::new(filter);
        let queue = Arc::new(OperationQueue::new());
        let translator = EventTranslator::new(PathNormalizer::new(&root), filter.clone());
        Self {
            executor: SyncExecutor::new(remote, &root, policy),
            sink: EventSink {
                translator,
                queue: queue.clone(),
            },
            root,
            filter,
            queue,
            reconcile_pending: false,
            recovery_round: 0,
            stats: SyncStats::default(),
        }
    }

    pub fn from_config(cfg: &TaskConfig, remote: Arc<R>) -> Self {
        let filter = PathFilter::new(&cfg.include, &cfg.exclude);
        Self::new(&cfg.local, filter, remote, cfg.retry_policy())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue(&self) -> Arc<OperationQueue> {
        self.queue.clone()
    }

    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn remote(&self) -> &Arc<R> {
        self.executor.remote()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn submit(&self, event: &RawEvent) -> usize {
        self.sink.submit(event)
    }

    pub async fn ping(&self) -> Result<(), SyncError> {
        self.executor.ping().await
    }

    /// Diffs the local tree against a fresh remote listing and queues the plan.
    ///
    /// Returns the number of queued operations. Failing to read either tree is fatal for the
    /// engine; individual operation failures are not.
    pub async fn reconcile(&mut self) -> Result<usize, ReconcileError> {
        let recovering = std::mem::take(&mut self.reconcile_pending);
        let root = self.root.clone();
        let filter = self.filter.clone();
        let with_hashes = self.executor.remote().provides_hashes();
        let local = tokio::task::spawn_blocking(move || {
            TreeSnapshot::scan_local(&root, &filter, with_hashes)
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|r| r)
        .map_err(|source| ReconcileError::LocalScan {
            root: self.root.clone(),
            source,
        })?;

        let entries = self
            .executor
            .list_remote()
            .await
            .map_err(ReconcileError::RemoteList)?;
        let remote = TreeSnapshot::from_remote(entries, &self.filter);

        let plan = diff::reconcile(&local, &remote, &self.root);
        let queued = self.queue.enqueue_all(plan);
        self.stats.reconciliations += 1;
        self.recovery_round = match (recovering, queued) {
            (_, 0) | (false, _) => 0,
            (true, _) => self.recovery_round + 1,
        };
        info!(
            root = %self.root.display(),
            local = local.len(),
            remote = remote.len(),
            queued,
            "reconciled"
        );
        Ok(queued)
    }

    /// Runs a scheduled recovery pass, but only while the queue is empty.
    ///
    /// Returns `None` and keeps the request pending when operations arrived in the meantime;
    /// those are applied first.
    pub async fn reconcile_if_quiescent(&mut self) -> Result<Option<usize>, ReconcileError> {
        if !self.queue.is_empty() {
            return Ok(None);
        }
        self.reconcile().await.map(Some)
    }

    /// Applies one dequeued entry and records its outcome.
    pub async fn step(&mut self, entry: &PendingEntry) -> OpState {
        let outcome = self.executor.apply(entry).await;
        match &outcome {
            Outcome::Applied => self.stats.applied += 1,
            Outcome::SatisfiedByFallback => self.stats.satisfied += 1,
            Outcome::FailedPermanent(_) => self.stats.failed += 1,
        }
        if outcome.needs_reconciliation() {
            let signal = SyncError::ReconciliationRequired;
            debug!(seq = entry.seq, "{signal}");
            self.schedule_reconcile();
        }
        outcome.state()
    }

    /// Requests a full pass once the queue is quiescent.
    pub fn schedule_reconcile(&mut self) {
        self.reconcile_pending = true;
    }

    pub fn reconcile_pending(&self) -> bool {
        self.reconcile_pending
    }

    /// Pause before the next recovery pass. Grows with consecutive passes that keep finding
    /// work, so a path that can never be applied does not spin the engine.
    pub fn recovery_delay(&self) -> Duration {
        match self.recovery_round {
            0 => Duration::ZERO,
            n => self.executor.policy().backoff(n - 1),
        }
    }

    /// Drains the queue, running scheduled recovery passes whenever it empties, until nothing
    /// is left to do.
    pub async fn run_until_idle(&mut self) -> Result<SyncStats, ReconcileError> {
        let mut rounds = 0;
        loop {
            while let Some(entry) = self.queue.try_dequeue() {
                self.step(&entry).await;
            }
            if !self.reconcile_pending || rounds >= MAX_RECOVERY_ROUNDS {
                break;
            }
            rounds += 1;
            self.reconcile().await?;
        }
        Ok(self.stats)
    }
}
