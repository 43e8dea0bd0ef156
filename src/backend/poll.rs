//! Portable polling driver: stat-diffing on a fixed interval.
//!
//! The only backend with no native facility behind it, and the fallback
//! when automatic selection finds none. Visibility is interval-granular:
//! changes inside one interval coalesce into a single event.

use std::io;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use tokio::task::{spawn_blocking, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tracing::{error, trace};

use crate::backend::Driver;
use crate::error::{Error, Result};
use crate::snapshot::Snapshot;
use crate::watcher::{WatchContext, WatcherStatus};

pub(crate) struct PollDriver {
    ctx: Arc<WatchContext>,
    interval: Duration,
    stop_tx: Option<chan::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PollDriver {
    pub(crate) fn new(ctx: Arc<WatchContext>, interval: Duration) -> Self {
        Self {
            ctx,
            interval,
            stop_tx: None,
            handle: None,
        }
    }
}

#[async_trait::async_trait]
impl Driver for PollDriver {
    async fn start(&mut self) -> Result<()> {
        // The baseline snapshot predates any emission, so the first tick
        // reports genuine changes instead of the initial tree state.
        let root = self.ctx.root.clone();
        let recursive = self.ctx.recursive;
        let baseline = spawn_blocking(move || Snapshot::capture(&root, recursive))
            .await
            .map_err(|e| Error::Subscription {
                path: self.ctx.root.clone(),
                source: io::Error::new(io::ErrorKind::Other, e),
            })?;
        trace!(entries = baseline.len(), "captured baseline snapshot");

        let (stop_tx, stop_rx) = chan::bounded(1);
        self.handle = Some(tokio::spawn(run(
            Arc::clone(&self.ctx),
            baseline,
            self.interval,
            stop_rx,
        )));
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run(
    ctx: Arc<WatchContext>,
    mut previous: Snapshot,
    every: Duration,
    stop_rx: chan::Receiver<()>,
) {
    enum Message {
        Tick,
        Stop,
    }

    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut messages = pin!((
        IntervalStream::new(ticker).map(|_| Message::Tick),
        stop_rx.map(|()| Message::Stop),
    )
        .merge());

    while let Some(message) = messages.next().await {
        match message {
            Message::Tick => {
                let root = ctx.root.clone();
                let recursive = ctx.recursive;
                let current = match spawn_blocking(move || Snapshot::capture(&root, recursive)).await
                {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        error!(?e, "snapshot task failed");
                        ctx.status
                            .send_replace(WatcherStatus::Failed(e.to_string()));
                        return;
                    }
                };

                for event in previous.diff(&current, ctx.filter) {
                    ctx.sink.emit(event);
                }
                previous = current;
            }
            Message::Stop => break,
        }
    }
}
