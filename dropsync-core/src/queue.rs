//! Pending operations, ordered by sequence number.
//!
//! The remote is a single sequential session, so the queue is plain FIFO: that trivially keeps
//! every pair of operations on overlapping paths in the order their numbers were assigned.

use crate::op::SyncOperation;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub seq: u64,
    pub op: SyncOperation,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<PendingEntry>,
    next_seq: u64,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct OperationQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `op` and returns its sequence number.
    ///
    /// A `PutFile` whose latest overlapping predecessor is a `PutFile` for the same path is
    /// absorbed into it: content is read at apply time, so the earlier entry already carries
    /// the newest bytes. The earlier entry's number is returned in that case.
    /// Returns `None` once the queue is closed.
    pub fn enqueue(&self, op: SyncOperation) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        if let SyncOperation::PutFile(path, _) = &op {
            let latest = inner.entries.iter().rev().find(|e| e.op.touches(path));
            if let Some(PendingEntry {
                seq,
                op: SyncOperation::PutFile(queued, _),
            }) = latest
            {
                if queued == path {
                    trace!(seq, path = %path, "coalesced duplicate put");
                    return Some(*seq);
                }
            }
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.entries.push_back(PendingEntry { seq, op });
        drop(inner);
        self.notify.notify_one();
        Some(seq)
    }

    pub fn enqueue_all(&self, ops: impl IntoIterator<Item = SyncOperation>) -> usize {
        ops.into_iter()
            .filter_map(|op| self.enqueue(op))
            .count()
    }

    /// Next entry in sequence order, waiting while the queue is empty.
    /// `None` once the queue is closed.
    pub async fn dequeue_next(&self) -> Option<PendingEntry> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                if let Some(entry) = inner.entries.pop_front() {
                    return Some(entry);
                }
            }
            notified.await;
        }
    }

    pub fn try_dequeue(&self) -> Option<PendingEntry> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        inner.entries.pop_front()
    }

    /// Stops the queue; pending entries are discarded and the consumer is woken.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.entries.clear();
        drop(inner);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::ContentSource;
    use crate::path::RelPath;
    use std::sync::Arc;
    use std::time::Duration;

    fn p(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    fn put(s: &str) -> SyncOperation {
        SyncOperation::PutFile(p(s), ContentSource::new(format!("/l/{s}")))
    }

    #[test]
    fn sequence_numbers_increase() {
        let q = OperationQueue::new();
        assert_eq!(q.enqueue(SyncOperation::CreateDir(p("a"))), Some(1));
        assert_eq!(q.enqueue(put("a/b")), Some(2));
        assert_eq!(q.enqueue(SyncOperation::DeleteFile(p("c"))), Some(3));
        let order: Vec<u64> = std::iter::from_fn(|| q.try_dequeue()).map(|e| e.seq).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_puts_coalesce_until_something_intervenes() {
        let q = OperationQueue::new();
        assert_eq!(q.enqueue(put("f")), Some(1));
        assert_eq!(q.enqueue(put("f")), Some(1));
        assert_eq!(q.enqueue(put("g")), Some(2));
        // unrelated path in between does not break coalescing
        assert_eq!(q.enqueue(put("f")), Some(1));
        assert_eq!(q.enqueue(SyncOperation::DeleteFile(p("f"))), Some(3));
        assert_eq!(q.enqueue(put("f")), Some(4));
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn move_touching_path_blocks_coalescing() {
        let q = OperationQueue::new();
        q.enqueue(put("d/f"));
        q.enqueue(SyncOperation::Move {
            from: p("d"),
            to: p("e"),
            kind: crate::op::EntryKind::Directory,
        });
        assert_eq!(q.enqueue(put("d/f")), Some(3));
    }

    #[tokio::test]
    async fn dequeue_waits_for_producer() {
        let q = Arc::new(OperationQueue::new());
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue_next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue(SyncOperation::CreateDir(p("late")));
        let entry = consumer.await.unwrap().unwrap();
        assert_eq!(entry.op, SyncOperation::CreateDir(p("late")));
    }

    #[tokio::test]
    async fn close_wakes_consumer_and_drops_entries() {
        let q = Arc::new(OperationQueue::new());
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue_next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        assert_eq!(consumer.await.unwrap(), None);
        assert_eq!(q.enqueue(put("x")), None);
        assert!(q.is_empty());
    }
}
