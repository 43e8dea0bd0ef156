//! Portable stat-diffing fallback used by the polling backend.
//!
//! A [`Snapshot`] captures per-entry metadata for a whole tree at one
//! instant; two snapshots diff into a normalized event sequence. This is
//! the only backend with interval-granular visibility: two changes between
//! captures collapse into one emitted event, a documented limitation.

use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use walkdir::WalkDir;

use crate::event::{EventFilter, EventKind, FsEvent};

/// Metadata compared field-by-field between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryMeta {
    size: u64,
    mtime: FileTime,
    atime: FileTime,
    mode: u32,
    uid: u32,
    gid: u32,
}

impl EntryMeta {
    fn from_metadata(meta: &Metadata) -> Self {
        #[cfg(unix)]
        let (mode, uid, gid) = {
            use std::os::unix::fs::MetadataExt;
            (meta.mode(), meta.uid(), meta.gid())
        };
        #[cfg(not(unix))]
        let (mode, uid, gid) = (0, 0, 0);

        Self {
            size: meta.len(),
            mtime: FileTime::from_last_modification_time(meta),
            atime: FileTime::from_last_access_time(meta),
            mode,
            uid,
            gid,
        }
    }
}

/// Point-in-time metadata capture of a tree, keyed by relative path.
///
/// The root itself is keyed by the empty path.
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    entries: BTreeMap<PathBuf, EntryMeta>,
}

impl Snapshot {
    /// Walks the tree synchronously and records every entry. Blocking:
    /// call through `spawn_blocking`.
    ///
    /// Entries that vanish mid-walk are skipped; a vanished root yields an
    /// empty snapshot, so the next diff reports everything as deleted.
    pub(crate) fn capture(root: &Path, recursive: bool) -> Self {
        let mut entries = BTreeMap::new();

        let Ok(root_meta) = root.symlink_metadata() else {
            return Self { entries };
        };
        let root_is_dir = root_meta.is_dir();
        entries.insert(PathBuf::new(), EntryMeta::from_metadata(&root_meta));

        if root_is_dir && recursive {
            for entry in WalkDir::new(root).min_depth(1).into_iter().filter_map(Result::ok) {
                let Ok(rel) = entry.path().strip_prefix(root) else {
                    continue;
                };
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                entries.insert(rel.to_path_buf(), EntryMeta::from_metadata(&meta));
            }
        } else if root_is_dir {
            // one level only, mirroring a plain directory listing
            let Ok(listing) = std::fs::read_dir(root) else {
                return Self { entries };
            };
            for entry in listing.flatten() {
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                entries.insert(PathBuf::from(entry.file_name()), EntryMeta::from_metadata(&meta));
            }
        }

        Self { entries }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// One-step event set between `self` (older) and `new`.
    ///
    /// Emission order is deterministic: creates in sorted path order, then
    /// deletes in sorted path order, then per-path field comparisons in
    /// sorted path order. Access, attribute and modify changes are
    /// independent; all three may fire for one path in one pass.
    pub(crate) fn diff(&self, new: &Snapshot, filter: EventFilter) -> Vec<FsEvent> {
        let mut events = Vec::new();

        if filter.contains(EventKind::Create) {
            for path in new.entries.keys() {
                if !self.entries.contains_key(path) {
                    events.push(FsEvent::create(path.clone()));
                }
            }
        }

        if filter.contains(EventKind::Delete) {
            for path in self.entries.keys() {
                if !new.entries.contains_key(path) {
                    events.push(FsEvent::delete(path.clone()));
                }
            }
        }

        for (path, old) in &self.entries {
            let Some(current) = new.entries.get(path) else {
                continue;
            };

            if filter.contains(EventKind::Access) && old.atime != current.atime {
                events.push(FsEvent::access(path.clone()));
            }

            if filter.contains(EventKind::Attribute)
                && (old.mode != current.mode || old.uid != current.uid || old.gid != current.gid)
            {
                events.push(FsEvent::attribute(path.clone()));
            }

            if filter.contains(EventKind::Modify)
                && (old.mtime != current.mtime || old.size != current.size)
            {
                events.push(FsEvent::modify(path.clone()));
            }
        }

        events
    }

    #[cfg(test)]
    fn insert(&mut self, path: &str, meta: EntryMeta) {
        self.entries.insert(PathBuf::from(path), meta);
    }
}
