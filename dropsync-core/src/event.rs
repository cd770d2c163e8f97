//! Raw local filesystem events and their derivation from `notify`.

use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    EventKind,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Created,
    Deleted,
    Modified,
    Moved,
}

/// One observation from the local watcher. `dest` is set for moves only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub path: PathBuf,
    pub dest: Option<PathBuf>,
    pub is_dir: bool,
}

impl RawEvent {
    pub fn created(path: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self::single(RawEventKind::Created, path, is_dir)
    }

    pub fn deleted(path: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self::single(RawEventKind::Deleted, path, is_dir)
    }

    pub fn modified(path: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self::single(RawEventKind::Modified, path, is_dir)
    }

    pub fn moved(from: impl Into<PathBuf>, to: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self {
            kind: RawEventKind::Moved,
            path: from.into(),
            dest: Some(to.into()),
            is_dir,
        }
    }

    fn single(kind: RawEventKind, path: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self {
            kind,
            path: path.into(),
            dest: None,
            is_dir,
        }
    }
}

#[derive(Debug)]
struct PendingFrom {
    tracker: Option<usize>,
    path: PathBuf,
    since: Instant,
}

/// Converts `notify` events into [`RawEvent`]s.
///
/// Rename halves are paired through their tracker cookie so that one rename yields exactly
/// one `Moved`. A `From` half that never finds its partner means the entry left the watched
/// tree; it is released as a deletion after `grace`, or earlier when another event touches
/// an overlapping path.
#[derive(Debug)]
pub struct NotifyAdapter {
    pending: Vec<PendingFrom>,
    // trackers whose move was already emitted from the `To` half
    paired: Vec<usize>,
    grace: Duration,
}

impl Default for NotifyAdapter {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl NotifyAdapter {
    pub fn new(grace: Duration) -> Self {
        Self {
            pending: Vec::new(),
            paired: Vec::new(),
            grace,
        }
    }

    pub fn convert(&mut self, event: notify::Event) -> Vec<RawEvent> {
        self.convert_at(event, Instant::now())
    }

    pub fn convert_at(&mut self, event: notify::Event, now: Instant) -> Vec<RawEvent> {
        let tracker = event.tracker();
        let mut out = self.release_expired(now);

        let pairs_rename = matches!(
            event.kind,
            EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both))
        );
        if !pairs_rename {
            out.extend(self.release_overlapping(&event.paths));
        }

        match event.kind {
            EventKind::Create(CreateKind::Folder) => {
                for p in event.paths {
                    out.push(RawEvent::created(p, true));
                }
            }
            EventKind::Create(_) => {
                for p in event.paths {
                    if let Some(is_dir) = local_kind(&p) {
                        out.push(RawEvent::created(p, is_dir));
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for p in event.paths {
                    self.pending.push(PendingFrom {
                        tracker,
                        path: p,
                        since: now,
                    });
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for p in event.paths {
                    match self.take_pending(tracker) {
                        Some(from) => {
                            if let Some(t) = tracker {
                                self.paired.push(t);
                            }
                            let is_dir = local_kind(&p).unwrap_or(false);
                            out.push(RawEvent::moved(from, p, is_dir));
                        }
                        None => {
                            if let Some(is_dir) = local_kind(&p) {
                                out.push(RawEvent::created(p, is_dir));
                            }
                        }
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let Some(pos) = tracker.and_then(|t| self.paired.iter().position(|x| *x == t)) {
                    self.paired.swap_remove(pos);
                } else if let [from, to] = event.paths.as_slice() {
                    self.take_pending(tracker);
                    let is_dir = local_kind(to).unwrap_or(false);
                    out.push(RawEvent::moved(from.clone(), to.clone(), is_dir));
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                // unpaired rename notification: decide by what is on disk now
                for p in event.paths {
                    match local_kind(&p) {
                        Some(is_dir) => out.push(RawEvent::created(p, is_dir)),
                        None => out.push(RawEvent::deleted(p, false)),
                    }
                }
            }
            EventKind::Modify(_) => {
                for p in event.paths {
                    if let Some(is_dir) = local_kind(&p) {
                        out.push(RawEvent::modified(p, is_dir));
                    }
                }
            }
            EventKind::Remove(RemoveKind::Folder) => {
                for p in event.paths {
                    out.push(RawEvent::deleted(p, true));
                }
            }
            EventKind::Remove(_) => {
                for p in event.paths {
                    out.push(RawEvent::deleted(p, false));
                }
            }
            other => trace!(kind = ?other, "ignoring event"),
        }
        out
    }

    /// Releases `From` halves whose partner did not show up within the grace period.
    pub fn release_expired(&mut self, now: Instant) -> Vec<RawEvent> {
        let grace = self.grace;
        self.release_where(|p| now.saturating_duration_since(p.since) >= grace)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn release_overlapping(&mut self, paths: &[PathBuf]) -> Vec<RawEvent> {
        self.release_where(|p| paths.iter().any(|q| overlaps(&p.path, q)))
    }

    fn release_where(&mut self, pred: impl Fn(&PendingFrom) -> bool) -> Vec<RawEvent> {
        let mut released = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if pred(&self.pending[i]) {
                let p = self.pending.remove(i);
                released.push(RawEvent::deleted(p.path, false));
            } else {
                i += 1;
            }
        }
        released
    }

    fn take_pending(&mut self, tracker: Option<usize>) -> Option<PathBuf> {
        let t = tracker?;
        let pos = self.pending.iter().position(|p| p.tracker == Some(t))?;
        Some(self.pending.remove(pos).path)
    }
}

/// `Some(is_dir)` for an existing local entry, `None` when it is gone. Symlinks are not followed.
fn local_kind(path: &Path) -> Option<bool> {
    std::fs::symlink_metadata(path).ok().map(|m| m.is_dir())
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::Event;

    fn rename(mode: RenameMode, paths: &[&Path], tracker: usize) -> Event {
        let mut ev = Event::new(EventKind::Modify(ModifyKind::Name(mode))).set_tracker(tracker);
        for p in paths {
            ev = ev.add_path(p.to_path_buf());
        }
        ev
    }

    #[test]
    fn paired_rename_yields_one_move() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.txt");
        let to = dir.path().join("b.txt");
        std::fs::write(&to, "x").unwrap();

        let mut adapter = NotifyAdapter::default();
        let now = Instant::now();
        assert!(adapter
            .convert_at(rename(RenameMode::From, &[&from], 7), now)
            .is_empty());
        let out = adapter.convert_at(rename(RenameMode::To, &[&to], 7), now);
        assert_eq!(out, vec![RawEvent::moved(&from, &to, false)]);
        assert!(adapter
            .convert_at(rename(RenameMode::Both, &[&from, &to], 7), now)
            .is_empty());
        assert!(!adapter.has_pending());
    }

    #[test]
    fn unpaired_from_becomes_delete_after_grace() {
        let mut adapter = NotifyAdapter::new(Duration::from_millis(100));
        let start = Instant::now();
        adapter.convert_at(rename(RenameMode::From, &[Path::new("/w/gone")], 1), start);
        assert!(adapter.release_expired(start).is_empty());
        let out = adapter.release_expired(start + Duration::from_millis(150));
        assert_eq!(out, vec![RawEvent::deleted("/w/gone", false)]);
    }

    #[test]
    fn overlapping_event_flushes_pending_from_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.txt");
        let mut adapter = NotifyAdapter::default();
        let now = Instant::now();
        adapter.convert_at(rename(RenameMode::From, &[&path], 3), now);

        std::fs::write(&path, "new").unwrap();
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
        let out = adapter.convert_at(create, now);
        assert_eq!(
            out,
            vec![RawEvent::deleted(&path, false), RawEvent::created(&path, false)]
        );
    }

    #[test]
    fn unmatched_to_is_a_creation() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("moved-in");
        std::fs::create_dir(&sub).unwrap();
        let mut adapter = NotifyAdapter::default();
        let out = adapter.convert(rename(RenameMode::To, &[&sub], 9));
        assert_eq!(out, vec![RawEvent::created(&sub, true)]);
    }

    #[test]
    fn modify_of_vanished_path_is_dropped() {
        let mut adapter = NotifyAdapter::default();
        let ev = Event::new(EventKind::Modify(ModifyKind::Any)).add_path("/nonexistent/x".into());
        assert!(adapter.convert(ev).is_empty());
        let ev = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path("/w/d".into());
        assert_eq!(adapter.convert(ev), vec![RawEvent::deleted("/w/d", true)]);
    }
}
