//! Registry mapping watched relative paths to backend watch handles.
//!
//! Facilities that only watch a single directory (inotify, kqueue) need an
//! explicit registry to fan a recursive watch out over a subtree, and a
//! reverse map to translate raw notifications (which identify the watched
//! directory, not the logical subtree) back into paths cheaply.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

/// Reverse lookup for a handle that is not currently tracked.
///
/// This is a benign race: a notification can be in flight for a watch that
/// an ancestor's removal already released. Callers drop the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("watch handle is not tracked")]
pub(crate) struct UnknownHandle;

/// Bijection between relative paths and per-platform watch handles.
///
/// A path is present here if and only if it has an active backend
/// subscription; both directions are updated together in every operation.
#[derive(Debug)]
pub(crate) struct WatchTree<H> {
    forward: HashMap<PathBuf, H>,
    reverse: HashMap<H, PathBuf>,
}

impl<H: Clone + Eq + Hash> WatchTree<H> {
    pub(crate) fn new() -> Self {
        Self {
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Registers `rel` under `handle`, returning the stale handle if the
    /// path was already tracked so the caller can release it.
    pub(crate) fn insert(&mut self, rel: PathBuf, handle: H) -> Option<H> {
        let stale = self.forward.insert(rel.clone(), handle.clone());
        if let Some(stale) = &stale {
            self.reverse.remove(stale);
        }
        self.reverse.insert(handle, rel);
        stale
    }

    /// Removes `rel` and every descendant (component-wise prefix match)
    /// from both maps, returning the removed entries so their backend
    /// handles can be released. Removing an untracked path is a no-op.
    pub(crate) fn remove_subtree(&mut self, rel: &Path) -> Vec<(PathBuf, H)> {
        let doomed: Vec<PathBuf> = self
            .forward
            .keys()
            .filter(|path| path.starts_with(rel))
            .cloned()
            .collect();

        doomed
            .into_iter()
            .filter_map(|path| {
                let handle = self.forward.remove(&path)?;
                self.reverse.remove(&handle);
                Some((path, handle))
            })
            .collect()
    }

    pub(crate) fn resolve(&self, handle: &H) -> Result<&Path, UnknownHandle> {
        self.reverse
            .get(handle)
            .map(PathBuf::as_path)
            .ok_or(UnknownHandle)
    }

    pub(crate) fn contains(&self, rel: &Path) -> bool {
        self.forward.contains_key(rel)
    }

    pub(crate) fn len(&self) -> usize {
        self.forward.len()
    }

    /// Empties the tree, returning every entry for handle release.
    pub(crate) fn drain(&mut self) -> Vec<(PathBuf, H)> {
        self.reverse.clear();
        self.forward.drain().collect()
    }
}

/// Result of walking one subtree on the blocking pool.
#[derive(Debug, Default)]
pub(crate) struct SubtreeScan {
    /// Relative paths of every directory in the subtree, `base` included.
    pub(crate) directories: Vec<PathBuf>,
    /// Relative paths of every entry below `base` (files and directories),
    /// `base` itself excluded.
    pub(crate) entries: Vec<PathBuf>,
}

/// Walks `root.join(base)` exhaustively and reports its directories and
/// entries as paths relative to `root`. Blocking; run via `spawn_blocking`.
///
/// Unreadable entries are skipped: their registration would fail anyway and
/// is reported at that point. A directory created concurrently with the
/// walk may be missed here; its own create notification re-triggers a scan.
pub(crate) fn scan_subtree(root: &Path, base: &Path) -> SubtreeScan {
    let abs = root.join(base);
    let mut scan = SubtreeScan::default();

    for entry in WalkDir::new(&abs).into_iter().filter_map(Result::ok) {
        let Ok(stripped) = entry.path().strip_prefix(&abs) else {
            continue;
        };
        let rel = base.join(stripped);
        if entry.depth() > 0 {
            scan.entries.push(rel.clone());
        }
        if entry.file_type().is_dir() {
            scan.directories.push(rel);
        }
    }

    scan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with(entries: &[(&str, u32)]) -> WatchTree<u32> {
        let mut tree = WatchTree::new();
        for (path, handle) in entries {
            tree.insert(PathBuf::from(path), *handle);
        }
        tree
    }

    #[test]
    fn insert_and_resolve_are_bijective() {
        let tree = tree_with(&[("", 1), ("sub", 2), ("sub/inner", 3)]);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.resolve(&2).unwrap(), Path::new("sub"));
        assert_eq!(tree.resolve(&1).unwrap(), Path::new(""));
        assert_eq!(tree.resolve(&9), Err(UnknownHandle));
    }

    #[test]
    fn reinserting_a_path_releases_the_stale_handle() {
        let mut tree = tree_with(&[("sub", 2)]);
        assert_eq!(tree.insert(PathBuf::from("sub"), 7), Some(2));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.resolve(&7).unwrap(), Path::new("sub"));
        assert_eq!(tree.resolve(&2), Err(UnknownHandle));
    }

    #[test]
    fn remove_subtree_takes_exactly_the_subtree() {
        // "subdir2" shares a string prefix with "sub" but is not beneath it
        let mut tree = tree_with(&[("", 1), ("sub", 2), ("sub/inner", 3), ("subdir2", 4)]);

        let mut removed: Vec<PathBuf> = tree
            .remove_subtree(Path::new("sub"))
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        removed.sort();

        assert_eq!(removed, vec![PathBuf::from("sub"), PathBuf::from("sub/inner")]);
        assert_eq!(tree.len(), 2);
        assert!(tree.contains(Path::new("subdir2")));
        assert_eq!(tree.resolve(&3), Err(UnknownHandle));
    }

    #[test]
    fn removing_the_root_empties_the_tree() {
        let mut tree = tree_with(&[("", 1), ("a", 2), ("a/b", 3)]);
        assert_eq!(tree.remove_subtree(Path::new("")).len(), 3);
        assert_eq!(tree.len(), 0);
    }

    #[test]
    fn remove_subtree_is_idempotent() {
        let mut tree = tree_with(&[("", 1)]);
        assert!(tree.remove_subtree(Path::new("gone")).is_empty());
        assert!(tree.remove_subtree(Path::new("gone")).is_empty());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn scan_lists_directories_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/file.txt"), b"x").unwrap();

        let scan = scan_subtree(dir.path(), Path::new(""));
        let mut dirs = scan.directories;
        dirs.sort();
        assert_eq!(
            dirs,
            vec![PathBuf::from(""), PathBuf::from("a"), PathBuf::from("a/b")]
        );
        let mut entries = scan.entries;
        entries.sort();
        assert_eq!(
            entries,
            vec![
                PathBuf::from("a"),
                PathBuf::from("a/b"),
                PathBuf::from("a/file.txt")
            ]
        );
    }

    #[test]
    fn scan_is_relative_to_the_watch_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("outer/inner")).unwrap();

        let scan = scan_subtree(dir.path(), Path::new("outer"));
        let mut dirs = scan.directories;
        dirs.sort();
        assert_eq!(dirs, vec![PathBuf::from("outer"), PathBuf::from("outer/inner")]);
        assert_eq!(scan.entries, vec![PathBuf::from("outer/inner")]);
    }
}
