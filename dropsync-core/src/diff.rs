//! One-shot reconciliation plan between a local and a remote snapshot.

use crate::op::{ContentSource, EntryKind, SyncOperation};
use crate::snapshot::{SnapshotEntry, TreeSnapshot};
use std::path::Path;

/// Operations that make the remote tree match the local one.
///
/// Removals come first, children before their directory; then creations and transfers,
/// each directory before anything beneath it. Moves are never inferred: an entry that
/// disappeared here and appeared there is reconciled as a delete plus a create.
pub fn reconcile(local: &TreeSnapshot, remote: &TreeSnapshot, local_root: &Path) -> Vec<SyncOperation> {
    let mut ops = Vec::new();

    for (path, theirs) in remote.iter().rev() {
        let keep = matches!(local.get(path), Some(ours) if ours.kind == theirs.kind);
        if !keep {
            ops.push(match theirs.kind {
                EntryKind::Directory => SyncOperation::RemoveDir(path.clone()),
                EntryKind::File => SyncOperation::DeleteFile(path.clone()),
            });
        }
    }

    for (path, ours) in local.iter() {
        let theirs = remote.get(path).filter(|t| t.kind == ours.kind);
        match (ours.kind, theirs) {
            (EntryKind::Directory, Some(_)) => {}
            (EntryKind::Directory, None) => ops.push(SyncOperation::CreateDir(path.clone())),
            (EntryKind::File, Some(theirs)) if !content_differs(ours, theirs) => {}
            (EntryKind::File, _) => ops.push(SyncOperation::PutFile(
                path.clone(),
                ContentSource::new(path.to_local(local_root)),
            )),
        }
    }

    ops
}

fn content_differs(ours: &SnapshotEntry, theirs: &SnapshotEntry) -> bool {
    if let (Some(a), Some(b)) = (&ours.hash, &theirs.hash) {
        return a != b;
    }
    if ours.size != theirs.size {
        return true;
    }
    match (ours.modified, theirs.modified) {
        (Some(local), Some(remote)) => local > remote,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::RelPath;

    fn p(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    fn file(hash: &str) -> SnapshotEntry {
        SnapshotEntry::file(hash.len() as u64, Some(hash.to_string()), None)
    }

    fn snap(entries: &[(&str, SnapshotEntry)]) -> TreeSnapshot {
        let mut s = TreeSnapshot::new();
        for (path, e) in entries {
            s.insert(p(path), e.clone());
        }
        s
    }

    fn describe(ops: &[SyncOperation]) -> Vec<String> {
        ops.iter().map(|op| op.to_string()).collect()
    }

    #[test]
    fn identical_trees_need_nothing() {
        let tree = snap(&[("a", SnapshotEntry::dir()), ("a/f", file("h1"))]);
        assert!(reconcile(&tree, &tree.clone(), Path::new("/l")).is_empty());
    }

    #[test]
    fn creates_top_down_and_removes_bottom_up() {
        let local = snap(&[
            ("a", SnapshotEntry::dir()),
            ("a/b", SnapshotEntry::dir()),
            ("a/b/c.txt", file("c")),
            ("a-file", file("z")),
        ]);
        let remote = snap(&[
            ("old", SnapshotEntry::dir()),
            ("old/deep", SnapshotEntry::dir()),
            ("old/deep/x", file("x")),
            ("old/y", file("y")),
        ]);
        let ops = reconcile(&local, &remote, Path::new("/l"));
        assert_eq!(
            describe(&ops),
            vec![
                "delete_file old/y",
                "delete_file old/deep/x",
                "remove_dir old/deep",
                "remove_dir old",
                "create_dir a",
                "put_file a-file",
                "create_dir a/b",
                "put_file a/b/c.txt",
            ]
        );
        match &ops[7] {
            SyncOperation::PutFile(_, src) => {
                assert_eq!(src.local_path(), Path::new("/l/a/b/c.txt"))
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn changed_content_is_retransferred() {
        let local = snap(&[("f", file("new")), ("same", file("s"))]);
        let remote = snap(&[("f", file("old")), ("same", file("s"))]);
        assert_eq!(describe(&reconcile(&local, &remote, Path::new("/l"))), vec!["put_file f"]);
    }

    #[test]
    fn size_and_mtime_fallback_without_hashes() {
        let local = snap(&[
            ("grew", SnapshotEntry::file(10, Some("h".into()), Some(100))),
            ("newer", SnapshotEntry::file(5, Some("h".into()), Some(200))),
            ("older", SnapshotEntry::file(5, Some("h".into()), Some(100))),
        ]);
        let remote = snap(&[
            ("grew", SnapshotEntry::file(4, None, Some(100))),
            ("newer", SnapshotEntry::file(5, None, Some(150))),
            ("older", SnapshotEntry::file(5, None, Some(150))),
        ]);
        assert_eq!(
            describe(&reconcile(&local, &remote, Path::new("/l"))),
            vec!["put_file grew", "put_file newer"]
        );
    }

    #[test]
    fn kind_mismatch_replaces_entry() {
        let local = snap(&[("x", file("f")), ("y", SnapshotEntry::dir())]);
        let remote = snap(&[
            ("x", SnapshotEntry::dir()),
            ("x/inner", file("i")),
            ("y", file("g")),
        ]);
        assert_eq!(
            describe(&reconcile(&local, &remote, Path::new("/l"))),
            vec![
                "delete_file y",
                "delete_file x/inner",
                "remove_dir x",
                "put_file x",
                "create_dir y",
            ]
        );
    }

    #[test]
    fn renamed_tree_is_not_inferred_as_move() {
        let local = snap(&[("new", file("same"))]);
        let remote = snap(&[("old", file("same"))]);
        assert_eq!(
            describe(&reconcile(&local, &remote, Path::new("/l"))),
            vec!["delete_file old", "put_file new"]
        );
    }
}
