//! The watcher facade: configuration, lifecycle, and subscription surface.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::backend::{self, BackendKind, Driver};
use crate::error::{Error, Result};
use crate::event::{EventFilter, EventKind, FsEvent};
use crate::sink::EventSink;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle state, observable through [`Watcher::status_stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherStatus {
    Stopped,
    Starting,
    Running,
    /// The backend died without a stop request. The watcher emits no
    /// further events; a fresh [`Watcher::start`] brings it back up.
    Failed(String),
}

/// Everything a driver needs about its watcher, shared by reference so
/// driver tasks outlive a borrow of the facade.
pub(crate) struct WatchContext {
    pub(crate) root: PathBuf,
    pub(crate) filter: EventFilter,
    pub(crate) recursive: bool,
    pub(crate) sink: EventSink,
    pub(crate) status: watch::Sender<WatcherStatus>,
}

/// Builder for [`Watcher`].
///
/// ```no_run
/// # use pathwatch::{EventKind, WatchConfig, Watcher};
/// # fn demo() -> pathwatch::Result<()> {
/// let watcher = Watcher::new(
///     WatchConfig::new("/var/log")
///         .filter([EventKind::Create, EventKind::Delete])
///         .recursive(false),
/// )?;
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct WatchConfig {
    path: PathBuf,
    filter: EventFilter,
    recursive: bool,
    backend: Option<BackendKind>,
    poll_interval: Duration,
}

impl WatchConfig {
    /// Watches `path` for all five event kinds, recursively, on the
    /// platform's preferred backend.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            filter: EventFilter::all(),
            recursive: true,
            backend: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Restricts delivery to the given kinds. An empty selection is
    /// rejected by [`Watcher::new`].
    pub fn filter(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.filter = kinds.into_iter().collect();
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Pins a specific backend instead of the platform default. A pinned
    /// backend that cannot start fails [`Watcher::start`] rather than
    /// falling back.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Scan cadence for the polling backend. Ignored by the native ones.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// A watch on one filesystem root, delivering normalized events per kind.
///
/// Construction validates the configuration; no filesystem watches exist
/// until [`start`](Self::start). Subscriptions may be taken at any time
/// and survive stop/start cycles.
pub struct Watcher {
    config: WatchConfig,
    ctx: Arc<WatchContext>,
    status_rx: watch::Receiver<WatcherStatus>,
    driver: Option<Box<dyn Driver>>,
    backend: Option<BackendKind>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("config", &self.config)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Validates `config` against the filesystem.
    ///
    /// The root must exist and the filter must name at least one kind.
    /// A plain-file root is never recursive, whatever the configuration
    /// says.
    pub fn new(config: WatchConfig) -> Result<Self> {
        if config.filter.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one event kind must be selected".into(),
            ));
        }
        let meta = std::fs::metadata(&config.path).map_err(|e| {
            Error::InvalidConfig(format!("cannot watch {}: {e}", config.path.display()))
        })?;
        let recursive = config.recursive && meta.is_dir();

        let (status, status_rx) = watch::channel(WatcherStatus::Stopped);
        let ctx = Arc::new(WatchContext {
            root: config.path.clone(),
            filter: config.filter,
            recursive,
            sink: EventSink::new(config.filter),
            status,
        });

        Ok(Self {
            config,
            ctx,
            status_rx,
            driver: None,
            backend: None,
        })
    }

    /// Brings the backend up and begins emitting events.
    ///
    /// With no pinned backend the platform default is tried first and the
    /// polling backend is the fallback when the native facility is
    /// unavailable. Any start failure leaves the watcher stopped.
    ///
    /// Starting a running watcher is an error; a watcher whose backend
    /// [failed](WatcherStatus::Failed) restarts directly, releasing the
    /// dead backend's remnants first.
    pub async fn start(&mut self) -> Result<()> {
        if self.driver.is_some() {
            if !matches!(self.status(), WatcherStatus::Failed(_)) {
                return Err(Error::AlreadyRunning);
            }
            if let Some(mut driver) = self.driver.take() {
                driver.stop().await;
            }
            self.backend = None;
        }
        let _ = self.ctx.status.send(WatcherStatus::Starting);

        let outcome = match self.config.backend {
            Some(kind) => self.start_backend(kind).await.map(|()| kind),
            None => {
                let kind = BackendKind::platform_default();
                match self.start_backend(kind).await {
                    Ok(()) => Ok(kind),
                    Err(Error::BackendUnavailable { backend, source }) => {
                        warn!(%backend, ?source, "native backend unavailable, polling instead");
                        self.start_backend(BackendKind::Poll)
                            .await
                            .map(|()| BackendKind::Poll)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match outcome {
            Ok(kind) => {
                info!(backend = %kind, path = %self.config.path.display(), "watcher running");
                self.backend = Some(kind);
                let _ = self.ctx.status.send(WatcherStatus::Running);
                Ok(())
            }
            Err(e) => {
                let _ = self.ctx.status.send(WatcherStatus::Stopped);
                Err(e)
            }
        }
    }

    async fn start_backend(&mut self, kind: BackendKind) -> Result<()> {
        let mut driver = backend::build(kind, Arc::clone(&self.ctx), self.config.poll_interval)?;
        driver.start().await?;
        self.driver = Some(driver);
        Ok(())
    }

    /// Tears the backend down. Returns only once the driver task has
    /// joined, so no event is delivered afterwards. Stopping a stopped
    /// watcher is a no-op.
    pub async fn stop(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.stop().await;
            info!(path = %self.config.path.display(), "watcher stopped");
        }
        self.backend = None;
        let _ = self.ctx.status.send(WatcherStatus::Stopped);
    }

    /// A receiver for one event kind. Kinds outside the configured filter
    /// yield a channel that never fires.
    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<FsEvent> {
        self.ctx.sink.subscribe(kind)
    }

    pub fn status(&self) -> WatcherStatus {
        self.status_rx.borrow().clone()
    }

    /// Change notifications for the lifecycle state.
    pub fn status_stream(&self) -> watch::Receiver<WatcherStatus> {
        self.status_rx.clone()
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn filter(&self) -> EventFilter {
        self.ctx.filter
    }

    pub fn is_recursive(&self) -> bool {
        self.ctx.recursive
    }

    /// The backend currently running, if any.
    pub fn backend(&self) -> Option<BackendKind> {
        self.backend
    }
}
