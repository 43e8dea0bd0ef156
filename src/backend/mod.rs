//! Per-platform notification drivers behind one start/stop capability.
//!
//! One driver is selected at facade construction and never switched. Every
//! driver moves through the same states: Stopped -> Starting -> Running ->
//! Stopped. Runtime errors terminate the Running state and surface through
//! [`WatcherStatus::Failed`](crate::WatcherStatus); they are not retried
//! internally.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::error::{Error, Result};
use crate::watcher::WatchContext;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod inotify;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod kqueue;
mod poll;
#[cfg(windows)]
mod windows;

/// The notification facility backing a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Linux inode watches (inotify).
    Inotify,
    /// BSD/macOS kernel event queues (kqueue).
    Kqueue,
    /// Windows directory handles (`ReadDirectoryChangesW`).
    Windows,
    /// Portable stat-diffing on a timer.
    Poll,
}

impl BackendKind {
    /// The best facility for the current platform.
    pub fn platform_default() -> Self {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        return BackendKind::Inotify;
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
        return BackendKind::Kqueue;
        #[cfg(windows)]
        return BackendKind::Windows;
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            windows
        )))]
        BackendKind::Poll
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Inotify => "inotify",
            BackendKind::Kqueue => "kqueue",
            BackendKind::Windows => "windows",
            BackendKind::Poll => "poll",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing a backend name that is not one of the four
/// drivers.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("unknown backend: {0:?}")]
pub struct UnknownBackend(pub String);

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inotify" => Ok(BackendKind::Inotify),
            "kqueue" => Ok(BackendKind::Kqueue),
            "windows" => Ok(BackendKind::Windows),
            "poll" => Ok(BackendKind::Poll),
            other => Err(UnknownBackend(other.to_owned())),
        }
    }
}

/// Start/stop capability every platform driver implements.
///
/// `start` seeds the watch set from the root and spawns the driver's
/// event-processing task; seed subscription failures propagate and leave
/// the watcher stopped. `stop` is idempotent, safe without a prior
/// successful start, and only returns once the event task has joined, so
/// no event is emitted afterwards.
#[async_trait::async_trait]
pub(crate) trait Driver: Send {
    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self);
}

/// Instantiates the driver for `kind`, or reports it unavailable when the
/// facility does not exist on this platform.
pub(crate) fn build(
    kind: BackendKind,
    ctx: Arc<WatchContext>,
    poll_interval: Duration,
) -> Result<Box<dyn Driver>> {
    match kind {
        BackendKind::Poll => Ok(Box::new(poll::PollDriver::new(ctx, poll_interval))),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        BackendKind::Inotify => Ok(Box::new(inotify::InotifyDriver::new(ctx))),
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
        BackendKind::Kqueue => Ok(Box::new(kqueue::KqueueDriver::new(ctx))),
        #[cfg(windows)]
        BackendKind::Windows => Ok(Box::new(windows::WindowsDriver::new(ctx))),
        #[allow(unreachable_patterns)]
        other => Err(Error::BackendUnavailable {
            backend: other,
            source: io::Error::new(
                io::ErrorKind::Unsupported,
                "facility does not exist on this platform",
            ),
        }),
    }
}
