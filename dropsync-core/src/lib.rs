//! Core library for dropsync – one-way mirroring of a local directory onto a remote store.

mod config;
mod diff;
mod engine;
mod error;
mod event;
mod executor;
mod filter;
mod manager;
mod memory;
mod op;
mod path;
mod queue;
mod remote;
mod snapshot;
mod task;
mod translate;

pub use config::{Pattern, RemoteCfg, RetryPolicy, TaskConfig};
pub use diff::reconcile;
pub use engine::{EventSink, SyncEngine, SyncStats};
pub use error::{ReconcileError, RemoteError, SyncError, ValidationError};
pub use event::{NotifyAdapter, RawEvent, RawEventKind};
pub use executor::{OpState, Outcome, SyncExecutor};
pub use filter::PathFilter;
pub use manager::SyncManager;
pub use memory::MemoryRemote;
pub use op::{ContentSource, EntryKind, LocalContent, SyncOperation};
pub use path::{PathNormalizer, RelPath};
pub use queue::{OperationQueue, PendingEntry};
pub use remote::{RemoteEntry, RemoteStore};
pub use snapshot::{hash_file, SnapshotEntry, TreeSnapshot};
pub use task::{spawn_task, SyncTaskHandle, TaskCommand, TaskState};
pub use translate::EventTranslator;
