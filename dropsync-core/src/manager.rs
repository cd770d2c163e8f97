use crate::{
    config::TaskConfig,
    remote::RemoteStore,
    task::{spawn_task, SyncTaskHandle, TaskState},
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct SyncManager {
    tasks: HashMap<Uuid, SyncTaskHandle>,
}

impl SyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a task unless one with the same id is already registered.
    pub fn start<R: RemoteStore>(&mut self, cfg: TaskConfig, remote: Arc<R>) -> bool {
        if self.tasks.contains_key(&cfg.id) {
            warn!(id = %cfg.id, "task already running");
            return false;
        }
        info!(id = %cfg.id, name = %cfg.name, "starting task");
        let id = cfg.id;
        self.tasks.insert(id, spawn_task(cfg, remote));
        true
    }

    pub fn stop(&self, id: &Uuid) -> bool {
        match self.tasks.get(id) {
            Some(h) => {
                h.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for h in self.tasks.values() {
            h.stop();
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&SyncTaskHandle> {
        self.tasks.get(id)
    }

    pub fn states(&self) -> Vec<(Uuid, TaskState)> {
        self.tasks
            .iter()
            .map(|(id, h)| (*id, h.state().clone()))
            .collect()
    }

    /// Waits for every task to exit and forgets them.
    pub async fn join_all(&mut self) {
        for (id, h) in self.tasks.drain() {
            if let Err(e) = h.join().await {
                warn!(id = %id, error = %e, "task panicked");
            }
        }
    }

    pub async fn shutdown(&mut self) {
        self.stop_all();
        self.join_all().await;
    }
}
