use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendKind;

/// Errors surfaced by [`Watcher`](crate::Watcher) construction and startup.
///
/// Runtime failures inside a running backend do not go through this type;
/// they terminate the backend and are reported through
/// [`WatcherStatus::Failed`](crate::WatcherStatus).
#[derive(Debug, Error)]
pub enum Error {
    /// Bad construction arguments: an empty event filter or a path that
    /// does not exist.
    #[error("invalid watcher configuration: {0}")]
    InvalidConfig(String),

    /// `start()` was called while the watcher was already running.
    #[error("watcher is already running")]
    AlreadyRunning,

    /// The chosen notification facility cannot be initialized on this
    /// platform. Automatic backend selection catches this and falls back
    /// to polling; an explicitly requested backend propagates it.
    #[error("{backend} backend is unavailable: {source}")]
    BackendUnavailable {
        backend: BackendKind,
        source: io::Error,
    },

    /// A specific watch registration failed, e.g. permission denied on one
    /// subdirectory during the initial seed walk. The watcher is left
    /// stopped; registrations made before the failure are released.
    #[error("failed to register watch on {}: {source}", path.display())]
    Subscription { path: PathBuf, source: io::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
