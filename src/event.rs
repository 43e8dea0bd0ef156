//! Normalized event model shared by all backends.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The five normalized change categories every backend maps its raw
/// notifications onto.
///
/// Same-directory renames are surfaced as a [`Delete`](EventKind::Delete) +
/// [`Create`](EventKind::Create) pair on every backend that can recover
/// them; no backend reports a rename as a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A file was read.
    Access,
    /// Mode, owner or group changed.
    Attribute,
    /// An entry appeared, including moves into the watched tree.
    Create,
    /// An entry disappeared, including moves out of the watched tree.
    Delete,
    /// Contents changed (write, truncate, extend).
    Modify,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Access,
        EventKind::Attribute,
        EventKind::Create,
        EventKind::Delete,
        EventKind::Modify,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Access => "access",
            EventKind::Attribute => "attribute",
            EventKind::Create => "create",
            EventKind::Delete => "delete",
            EventKind::Modify => "modify",
        }
    }

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an event kind name that is not one of the five
/// normalized categories.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event kind: {0:?}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_owned()))
    }
}

/// The set of event kinds a watcher is configured to observe.
///
/// A kind outside the filter is never emitted by any backend. An empty
/// filter is representable here but rejected at watcher construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFilter(u8);

impl EventFilter {
    /// All five kinds.
    pub fn all() -> Self {
        EventKind::ALL.into_iter().collect()
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, kind: EventKind) {
        self.0 |= kind.bit();
    }

    /// Kinds present in this filter, in `EventKind::ALL` order.
    pub fn iter(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl FromIterator<EventKind> for EventFilter {
    fn from_iter<I: IntoIterator<Item = EventKind>>(kinds: I) -> Self {
        let mut filter = EventFilter::empty();
        for kind in kinds {
            filter.insert(kind);
        }
        filter
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        Self(kind.bit())
    }
}

impl FromStr for EventFilter {
    type Err = UnknownEventKind;

    /// Parses a comma separated kind list, e.g. `"create,delete"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(EventKind::from_str)
            .collect()
    }
}

/// One observed filesystem change.
///
/// `path` is always relative to the watched root; the empty path refers to
/// the root itself. The absolute path is derivable via [`FsEvent::full_path`]
/// and is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FsEvent {
    pub kind: EventKind,
    pub path: PathBuf,
}

impl FsEvent {
    pub fn new(kind: EventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    pub fn access(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Access, path)
    }

    pub fn attribute(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Attribute, path)
    }

    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Create, path)
    }

    pub fn delete(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Delete, path)
    }

    pub fn modify(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Modify, path)
    }

    /// The absolute location of this event under the watched root.
    pub fn full_path(&self, root: &Path) -> PathBuf {
        root.join(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_from_kind_list() {
        let filter: EventFilter = [EventKind::Create, EventKind::Delete].into_iter().collect();
        assert!(filter.contains(EventKind::Create));
        assert!(filter.contains(EventKind::Delete));
        assert!(!filter.contains(EventKind::Modify));
        assert!(!filter.is_empty());
    }

    #[test]
    fn filter_parses_comma_separated_names() {
        let filter: EventFilter = "create, delete,modify".parse().unwrap();
        assert!(filter.contains(EventKind::Create));
        assert!(filter.contains(EventKind::Delete));
        assert!(filter.contains(EventKind::Modify));
        assert!(!filter.contains(EventKind::Access));
    }

    #[test]
    fn filter_rejects_unknown_names() {
        let err = "create,remove".parse::<EventFilter>().unwrap_err();
        assert_eq!(err, UnknownEventKind("remove".into()));
    }

    #[test]
    fn empty_string_parses_to_empty_filter() {
        let filter: EventFilter = "".parse().unwrap();
        assert!(filter.is_empty());
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn filter_iter_yields_only_members() {
        let filter = EventFilter::from(EventKind::Attribute);
        assert_eq!(filter.iter().collect::<Vec<_>>(), vec![EventKind::Attribute]);
        assert_eq!(EventFilter::all().iter().count(), 5);
    }

    #[test]
    fn full_path_joins_the_root() {
        let event = FsEvent::create("sub/file.txt");
        assert_eq!(
            event.full_path(Path::new("/watched")),
            PathBuf::from("/watched/sub/file.txt")
        );

        let root_event = FsEvent::delete("");
        assert_eq!(root_event.full_path(Path::new("/watched")), PathBuf::from("/watched"));
    }
}
