use crate::{
    config::TaskConfig,
    engine::{EventSink, SyncEngine},
    event::NotifyAdapter,
    remote::RemoteStore,
};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch::Ref;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often unpaired rename halves are checked for expiry.
const RELEASE_TICK: Duration = Duration::from_millis(100);

/// Public handle returned to callers for controlling a running sync task.
#[derive(Debug)]
pub struct SyncTaskHandle {
    cfg: TaskConfig,
    ctrl_tx: mpsc::Sender<TaskCommand>,
    state_rx: watch::Receiver<TaskState>,
    join: JoinHandle<()>,
}

impl SyncTaskHandle {
    pub fn config(&self) -> &TaskConfig {
        &self.cfg
    }

    /// Asks the task to stop after its in-flight operation.
    pub fn stop(&self) {
        let _ = self.ctrl_tx.try_send(TaskCommand::Stop);
    }

    pub fn state(&self) -> Ref<'_, TaskState> {
        self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state_rx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) -> Result<(), JoinError> {
        self.join.await
    }
}

#[derive(Debug, Clone)]
pub enum TaskCommand {
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Reconciling,
    Running,
    Error(String),
}

pub(crate) struct SyncTask<R: RemoteStore> {
    cfg: TaskConfig,
    engine: SyncEngine<R>,
}

impl<R: RemoteStore> SyncTask<R> {
    pub fn new(cfg: TaskConfig, remote: Arc<R>) -> Self {
        let engine = SyncEngine::from_config(&cfg, remote);
        Self { cfg, engine }
    }

    pub async fn run(
        mut self,
        mut ctrl_rx: mpsc::Receiver<TaskCommand>,
        state_tx: watch::Sender<TaskState>,
    ) {
        let fail = |msg: String| {
            error!(task = %self.cfg.name, "{msg}");
            let _ = state_tx.send(TaskState::Error(msg));
        };

        if let Err(e) = self.engine.ping().await {
            fail(format!("remote unreachable: {e}"));
            return;
        }

        // watch before the initial pass; events seen meanwhile wait in the channel
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let watcher = match self.spawn_watcher(raw_tx) {
            Ok(w) => w,
            Err(e) => {
                fail(format!("watch error: {e}"));
                return;
            }
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let forwarder = tokio::spawn(forward_events(raw_rx, self.engine.sink(), ready_rx));

        let _ = state_tx.send(TaskState::Reconciling);
        if let Err(e) = self.engine.reconcile().await {
            fail(format!("initial reconciliation failed: {e}"));
            drop(watcher);
            forwarder.abort();
            return;
        }
        let _ = ready_tx.send(());
        let _ = state_tx.send(TaskState::Running);
        info!(task = %self.cfg.name, root = %self.cfg.local.display(), "watching");

        let queue = self.engine.queue();
        let mut rescan = self
            .cfg
            .rescan_secs
            .filter(|secs| *secs > 0)
            .map(|secs| {
                let period = Duration::from_secs(secs);
                let mut i = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                i.set_missed_tick_behavior(MissedTickBehavior::Delay);
                i
            });
        let mut failed = false;
        loop {
            let recover = self.engine.reconcile_pending() && queue.is_empty();
            let recovery_delay = self.engine.recovery_delay();
            tokio::select! {
                biased;
                Some(cmd) = ctrl_rx.recv() => {
                    match cmd {
                        TaskCommand::Stop => break,
                    }
                }
                _ = tick(&mut rescan) => {
                    self.engine.schedule_reconcile();
                }
                _ = tokio::time::sleep(recovery_delay), if recover => {
                    let _ = state_tx.send(TaskState::Reconciling);
                    match self.engine.reconcile_if_quiescent().await {
                        Ok(Some(_)) => {}
                        // events queued while sleeping go first; the pass stays pending
                        Ok(None) => debug!(task = %self.cfg.name, "recovery deferred"),
                        Err(e) => {
                            fail(format!("reconciliation failed: {e}"));
                            failed = true;
                            break;
                        }
                    }
                    let _ = state_tx.send(TaskState::Running);
                }
                entry = queue.dequeue_next(), if !recover => {
                    match entry {
                        Some(entry) => {
                            self.engine.step(&entry).await;
                        }
                        None => break,
                    }
                }
            }
        }

        // unapplied operations are recovered by the next startup reconciliation
        queue.close();
        drop(watcher);
        if let Err(e) = forwarder.await {
            warn!(error = %e, "event forwarder ended abnormally");
        }
        let stats = self.engine.stats();
        info!(
            task = %self.cfg.name,
            applied = stats.applied,
            satisfied = stats.satisfied,
            failed = stats.failed,
            "stopped"
        );
        if !failed {
            let _ = state_tx.send(TaskState::Idle);
        }
    }

    fn spawn_watcher(
        &self,
        raw_tx: mpsc::UnboundedSender<notify::Result<notify::Event>>,
    ) -> notify::Result<RecommendedWatcher> {
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.cfg.local, RecursiveMode::Recursive)?;
        Ok(watcher)
    }
}

/// Feeds watcher output into the engine once the initial pass has been queued.
async fn forward_events(
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    sink: EventSink,
    ready: oneshot::Receiver<()>,
) {
    if ready.await.is_err() {
        return;
    }
    let mut adapter = NotifyAdapter::default();
    let mut release = tokio::time::interval(RELEASE_TICK);
    release.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            msg = raw_rx.recv() => match msg {
                Some(Ok(event)) => {
                    sink.submit_blocking(adapter.convert(event)).await;
                }
                Some(Err(e)) => warn!(error = %e, "watch error"),
                None => break,
            },
            _ = release.tick(), if adapter.has_pending() => {
                sink.submit_blocking(adapter.release_expired(Instant::now())).await;
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

pub fn spawn_task<R: RemoteStore>(cfg: TaskConfig, remote: Arc<R>) -> SyncTaskHandle {
    let (ctrl_tx, ctrl_rx) = mpsc::channel(4);
    let (state_tx, state_rx) = watch::channel(TaskState::Idle);
    let task = SyncTask::new(cfg.clone(), remote);
    let join = tokio::spawn(task.run(ctrl_rx, state_tx));
    SyncTaskHandle {
        cfg,
        ctrl_tx,
        state_rx,
        join,
    }
}
