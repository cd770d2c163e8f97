//! In-process remote store with the semantics of a strict session-oriented server.

use crate::error::{RemoteError, ValidationError};
use crate::op::{EntryKind, LocalContent};
use crate::path::RelPath;
use crate::remote::{RemoteEntry, RemoteStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File { data: Vec<u8>, modified: u64 },
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<RelPath, Node>,
    transport_faults: u32,
    calls: Vec<String>,
}

impl State {
    fn parent_is_dir(&self, path: &RelPath) -> bool {
        match path.parent() {
            None => true,
            Some(parent) => matches!(self.nodes.get(&parent), Some(Node::Dir)),
        }
    }

    fn record(&mut self, call: String) -> Result<(), RemoteError> {
        if self.transport_faults > 0 {
            self.transport_faults -= 1;
            return Err(RemoteError::Transport(format!("injected fault during {call}")));
        }
        self.calls.push(call);
        Ok(())
    }
}

/// Remote store kept entirely in memory. Cheap to construct, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` primitive calls fail with a transport error.
    pub fn fail_next_transport(&self, n: u32) {
        self.state.lock().transport_faults = n;
    }

    /// Seeds a directory (and its missing ancestors) without going through the primitives.
    pub fn seed_dir(&self, path: &str) -> Result<(), ValidationError> {
        let path = RelPath::new(path)?;
        let mut state = self.state.lock();
        for ancestor in path.ancestors() {
            state.nodes.insert(ancestor, Node::Dir);
        }
        state.nodes.insert(path, Node::Dir);
        Ok(())
    }

    /// Seeds a file (and its missing ancestors) without going through the primitives.
    pub fn seed_file(&self, path: &str, data: impl Into<Vec<u8>>) -> Result<(), ValidationError> {
        let path = RelPath::new(path)?;
        let mut state = self.state.lock();
        for ancestor in path.ancestors() {
            state.nodes.insert(ancestor, Node::Dir);
        }
        state.nodes.insert(
            path,
            Node::File {
                data: data.into(),
                modified: now_secs(),
            },
        );
        Ok(())
    }

    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        let path = RelPath::new(path).ok()?;
        match self.state.lock().nodes.get(&path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// All paths currently present, directories suffixed with `/`.
    pub fn paths(&self) -> Vec<String> {
        self.state
            .lock()
            .nodes
            .iter()
            .map(|(p, n)| match n {
                Node::Dir => format!("{p}/"),
                Node::File { .. } => p.to_string(),
            })
            .collect()
    }

    /// Successful mutating calls in the order they were applied, e.g. `"make_dir a"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn make_dir(&self, path: &RelPath) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        if state.nodes.contains_key(path) {
            return Err(RemoteError::AlreadyExists(path.to_string()));
        }
        if !state.parent_is_dir(path) {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        state.record(format!("make_dir {path}"))?;
        state.nodes.insert(path.clone(), Node::Dir);
        Ok(())
    }

    async fn remove_dir(&self, path: &RelPath) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        match state.nodes.get(path) {
            None => return Err(RemoteError::NotFound(path.to_string())),
            Some(Node::File { .. }) => {
                return Err(RemoteError::Rejected(format!("{path} is not a directory")))
            }
            Some(Node::Dir) => {}
        }
        state.record(format!("remove_dir {path}"))?;
        state
            .nodes
            .retain(|p, _| p != path && !path.is_ancestor_of(p));
        Ok(())
    }

    async fn store(&self, path: &RelPath, content: &mut LocalContent) -> Result<(), RemoteError> {
        let mut data = Vec::with_capacity(content.len as usize);
        content
            .file
            .read_to_end(&mut data)
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let mut state = self.state.lock();
        if matches!(state.nodes.get(path), Some(Node::Dir)) {
            return Err(RemoteError::Rejected(format!("{path} is a directory")));
        }
        if !state.parent_is_dir(path) {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        state.record(format!("store {path}"))?;
        state.nodes.insert(
            path.clone(),
            Node::File {
                data,
                modified: now_secs(),
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &RelPath) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        match state.nodes.get(path) {
            None => return Err(RemoteError::NotFound(path.to_string())),
            Some(Node::Dir) => return Err(RemoteError::Rejected(format!("{path} is a directory"))),
            Some(Node::File { .. }) => {}
        }
        state.record(format!("delete {path}"))?;
        state.nodes.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &RelPath, to: &RelPath) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(from) {
            return Err(RemoteError::NotFound(from.to_string()));
        }
        if state.nodes.contains_key(to) {
            return Err(RemoteError::AlreadyExists(to.to_string()));
        }
        if !state.parent_is_dir(to) {
            return Err(RemoteError::NotFound(to.to_string()));
        }
        if from.is_ancestor_of(to) {
            return Err(RemoteError::Rejected(format!("cannot move {from} into itself")));
        }
        state.record(format!("rename {from} {to}"))?;
        let moved: Vec<RelPath> = state
            .nodes
            .keys()
            .filter(|p| *p == from || from.is_ancestor_of(p))
            .cloned()
            .collect();
        for old in moved {
            if let (Some(node), Some(new)) = (state.nodes.remove(&old), old.rebase(from, to)) {
                state.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn stat(&self, path: &RelPath) -> Result<Option<RemoteEntry>, RemoteError> {
        let mut state = self.state.lock();
        if state.transport_faults > 0 {
            state.transport_faults -= 1;
            return Err(RemoteError::Transport(format!("injected fault during stat {path}")));
        }
        Ok(state.nodes.get(path).map(|n| entry(path, n)))
    }

    async fn list_tree(&self) -> Result<Vec<RemoteEntry>, RemoteError> {
        let mut state = self.state.lock();
        if state.transport_faults > 0 {
            state.transport_faults -= 1;
            return Err(RemoteError::Transport("injected fault during list".into()));
        }
        Ok(state.nodes.iter().map(|(p, n)| entry(p, n)).collect())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    fn provides_hashes(&self) -> bool {
        true
    }
}

fn entry(path: &RelPath, node: &Node) -> RemoteEntry {
    match node {
        Node::Dir => RemoteEntry {
            path: path.clone(),
            kind: EntryKind::Directory,
            size: 0,
            modified: None,
            hash: None,
        },
        Node::File { data, modified } => RemoteEntry {
            path: path.clone(),
            kind: EntryKind::File,
            size: data.len() as u64,
            modified: Some(*modified),
            hash: Some(blake3::hash(data).to_hex().to_string()),
        },
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn make_dir_requires_parent() {
        let remote = MemoryRemote::new();
        assert_eq!(
            remote.make_dir(&p("a/b")).await,
            Err(RemoteError::NotFound("a/b".into()))
        );
        remote.make_dir(&p("a")).await.unwrap();
        remote.make_dir(&p("a/b")).await.unwrap();
        assert_eq!(
            remote.make_dir(&p("a")).await,
            Err(RemoteError::AlreadyExists("a".into()))
        );
        assert_eq!(remote.paths(), vec!["a/", "a/b/"]);
    }

    #[tokio::test]
    async fn rename_moves_whole_subtree() {
        let remote = MemoryRemote::new();
        remote.seed_file("d/e.txt", "x").unwrap();
        remote.seed_file("d/sub/f.txt", "y").unwrap();
        remote.rename(&p("d"), &p("d2")).await.unwrap();
        assert_eq!(remote.paths(), vec!["d2/", "d2/e.txt", "d2/sub/", "d2/sub/f.txt"]);
        assert!(matches!(
            remote.rename(&p("d"), &p("d3")).await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn remove_dir_is_recursive() {
        let remote = MemoryRemote::new();
        remote.seed_file("a/b/c.txt", "c").unwrap();
        remote.seed_file("ab.txt", "keep").unwrap();
        remote.remove_dir(&p("a")).await.unwrap();
        assert_eq!(remote.paths(), vec!["ab.txt"]);
    }

    #[tokio::test]
    async fn injected_transport_faults_are_consumed() {
        let remote = MemoryRemote::new();
        remote.fail_next_transport(1);
        assert!(remote.make_dir(&p("a")).await.unwrap_err().is_transport());
        remote.make_dir(&p("a")).await.unwrap();
        assert_eq!(remote.calls(), vec!["make_dir a"]);
    }
}
