//! Filesystem change notifications behind one portable interface.
//!
//! A [`Watcher`] observes a single root path (directory or file) and
//! delivers [`FsEvent`]s through per-kind broadcast channels. Four
//! backends feed the same event model: inotify on Linux, kqueue on
//! macOS and the BSDs, directory-handle notifications on Windows, and a
//! stat-diffing poller anywhere. The platform's native facility is
//! chosen automatically, with polling as the fallback; a specific
//! backend may be pinned through [`WatchConfig::backend`].
//!
//! ```no_run
//! use pathwatch::{EventKind, WatchConfig, Watcher};
//!
//! # async fn demo() -> pathwatch::Result<()> {
//! let mut watcher = Watcher::new(WatchConfig::new("/srv/uploads"))?;
//! let mut created = watcher.subscribe(EventKind::Create);
//!
//! watcher.start().await?;
//! while let Ok(event) = created.recv().await {
//!     println!("new entry: {}", event.path.display());
//! }
//! watcher.stop().await;
//! # Ok(()) }
//! ```
//!
//! Event paths are always relative to the watched root; the root itself
//! is the empty path. Events of kinds outside the configured filter are
//! never delivered, whichever backend produced them.

mod backend;
mod error;
mod event;
mod sink;
mod snapshot;
mod tree;
mod watcher;

pub use backend::{BackendKind, UnknownBackend};
pub use error::{Error, Result};
pub use event::{EventFilter, EventKind, FsEvent, UnknownEventKind};
pub use watcher::{WatchConfig, Watcher, WatcherStatus};

/// Receiver half of a kind subscription, as returned by
/// [`Watcher::subscribe`].
pub type EventReceiver = tokio::sync::broadcast::Receiver<FsEvent>;
