//! Linux driver over inotify.
//!
//! inotify watches single directories, so a recursive watch is fanned out
//! over a [`WatchTree`]: one watch descriptor per directory, re-registered
//! as subtrees appear and released as they disappear. A newly created
//! directory gets its watch before its create event is emitted, so a file
//! created inside it in the same burst is never missed; the descendant
//! walk runs on the blocking pool and merges back into the event loop.
//!
//! Renames surface as a delete/create pair (`MOVED_FROM` / `MOVED_TO`).

use std::io;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use inotify::{EventMask, EventStream, Inotify, WatchDescriptor, WatchMask, Watches};
use tokio::task::{spawn_blocking, JoinHandle};
use tracing::{debug, error, trace, warn};

use crate::backend::{BackendKind, Driver};
use crate::error::{Error, Result};
use crate::event::{EventKind, FsEvent};
use crate::tree::{scan_subtree, SubtreeScan, WatchTree};
use crate::watcher::{WatchContext, WatcherStatus};

const EVENT_BUFFER_SIZE: usize = 4096;

pub(crate) struct InotifyDriver {
    ctx: Arc<WatchContext>,
    stop_tx: Option<chan::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl InotifyDriver {
    pub(crate) fn new(ctx: Arc<WatchContext>) -> Self {
        Self {
            ctx,
            stop_tx: None,
            handle: None,
        }
    }
}

fn watch_mask(ctx: &WatchContext) -> WatchMask {
    let mut mask = WatchMask::empty();
    for kind in ctx.filter.iter() {
        mask |= match kind {
            EventKind::Access => WatchMask::ACCESS,
            EventKind::Attribute => WatchMask::ATTRIB,
            EventKind::Create => WatchMask::CREATE | WatchMask::MOVED_TO,
            EventKind::Delete => {
                WatchMask::DELETE | WatchMask::DELETE_SELF | WatchMask::MOVED_FROM
            }
            EventKind::Modify => WatchMask::MODIFY,
        };
    }
    if ctx.recursive {
        // subtree bookkeeping needs the create/delete families even when
        // those kinds are not configured
        mask |= WatchMask::CREATE
            | WatchMask::MOVED_TO
            | WatchMask::DELETE
            | WatchMask::DELETE_SELF
            | WatchMask::MOVED_FROM;
    }
    mask
}

#[async_trait::async_trait]
impl Driver for InotifyDriver {
    async fn start(&mut self) -> Result<()> {
        let inotify = Inotify::init().map_err(|source| Error::BackendUnavailable {
            backend: BackendKind::Inotify,
            source,
        })?;
        let mut watches = inotify.watches();
        let mask = watch_mask(&self.ctx);

        let seeds = if self.ctx.recursive {
            let root = self.ctx.root.clone();
            spawn_blocking(move || scan_subtree(&root, Path::new("")).directories)
                .await
                .map_err(|e| Error::Subscription {
                    path: self.ctx.root.clone(),
                    source: io::Error::new(io::ErrorKind::Other, e),
                })?
        } else {
            vec![PathBuf::new()]
        };

        let mut tree = WatchTree::new();
        for rel in seeds {
            let path = self.ctx.root.join(&rel);
            let wd = watches
                .add(&path, mask)
                .map_err(|source| Error::Subscription { path, source })?;
            tree.insert(rel, wd);
        }
        debug!(watches = tree.len(), "seeded inotify watch tree");

        let stream = inotify
            .into_event_stream(vec![0u8; EVENT_BUFFER_SIZE])
            .map_err(|source| Error::BackendUnavailable {
                backend: BackendKind::Inotify,
                source,
            })?;

        let (stop_tx, stop_rx) = chan::bounded(1);
        self.handle = Some(tokio::spawn(run(
            Arc::clone(&self.ctx),
            tree,
            watches,
            stream,
            mask,
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
    mut tree: WatchTree<WatchDescriptor>,
    mut watches: Watches,
    stream: EventStream<Vec<u8>>,
    mask: WatchMask,
    stop_rx: chan::Receiver<()>,
) {
    enum Message {
        Raw(io::Result<inotify::EventOwned>),
        Scanned(SubtreeScan),
        Stop,
    }

    let (scan_tx, scan_rx) = chan::unbounded();

    let mut messages = pin!((
        stream.map(Message::Raw),
        scan_rx.map(Message::Scanned),
        stop_rx.map(|()| Message::Stop),
    )
        .merge());

    while let Some(message) = messages.next().await {
        match message {
            Message::Raw(Ok(event)) => {
                decode(&ctx, &mut tree, &mut watches, mask, &scan_tx, event);
            }
            Message::Raw(Err(e)) => {
                error!(?e, "inotify event stream failed");
                ctx.status
                    .send_replace(WatcherStatus::Failed(e.to_string()));
                break;
            }
            Message::Scanned(scan) => {
                absorb_scan(&ctx, &mut tree, &mut watches, mask, scan);
            }
            Message::Stop => break,
        }
    }

    for (_, wd) in tree.drain() {
        // the kernel may already have dropped the watch with the inode
        let _ = watches.remove(wd);
    }
}

/// Translates one raw notification, maintaining the watch tree as
/// subtrees come and go.
fn decode(
    ctx: &WatchContext,
    tree: &mut WatchTree<WatchDescriptor>,
    watches: &mut Watches,
    mask: WatchMask,
    scan_tx: &chan::Sender<SubtreeScan>,
    event: inotify::EventOwned,
) {
    if event.mask.intersects(EventMask::IGNORED | EventMask::Q_OVERFLOW) {
        return;
    }

    let Ok(base) = tree.resolve(&event.wd) else {
        // an ancestor's removal released this watch while the
        // notification was in flight
        trace!("dropping notification for untracked watch");
        return;
    };
    let mut rel = base.to_path_buf();
    if let Some(name) = &event.name {
        rel.push(name);
    }

    if event.mask.contains(EventMask::ACCESS) {
        ctx.sink.emit(FsEvent::access(rel.clone()));
    }

    if event.mask.contains(EventMask::ATTRIB) {
        ctx.sink.emit(FsEvent::attribute(rel.clone()));
    }

    if event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
        if ctx.recursive && event.mask.contains(EventMask::ISDIR) {
            // watch the new directory before reporting it, then walk its
            // descendants off the event loop
            match watches.add(ctx.root.join(&rel), mask) {
                Ok(wd) => {
                    tree.insert(rel.clone(), wd);
                    spawn_scan(ctx, rel.clone(), scan_tx);
                }
                Err(e) => {
                    warn!(path = %rel.display(), ?e, "failed to watch new subdirectory");
                }
            }
        }
        ctx.sink.emit(FsEvent::create(rel.clone()));
    }

    let delete_family = EventMask::DELETE | EventMask::DELETE_SELF | EventMask::MOVED_FROM;
    if event.mask.intersects(delete_family) {
        if tree.contains(&rel) {
            for (_, wd) in tree.remove_subtree(&rel) {
                let _ = watches.remove(wd);
            }
        }
        // a subtree's own DELETE_SELF duplicates the parent watch's DELETE;
        // only the root has no parent watch to report it
        if !event.mask.contains(EventMask::DELETE_SELF) || rel.as_os_str().is_empty() {
            ctx.sink.emit(FsEvent::delete(rel.clone()));
        }
    }

    if event.mask.contains(EventMask::MODIFY) {
        ctx.sink.emit(FsEvent::modify(rel));
    }
}

fn spawn_scan(ctx: &WatchContext, rel: PathBuf, scan_tx: &chan::Sender<SubtreeScan>) {
    let root = ctx.root.clone();
    let tx = scan_tx.clone();
    spawn_blocking(move || {
        let scan = scan_subtree(&root, &rel);
        // the loop may already have shut down; nothing to deliver to then
        let _ = tx.send_blocking(scan);
    });
}

/// Merges a completed background walk back into the tree: registers
/// directories discovered under a just-created subtree and reports the
/// entries that existed before their parent's watch was in place.
///
/// An entry created after the watch was added can be reported twice (once
/// by its own notification, once by the scan); it is never lost.
fn absorb_scan(
    ctx: &WatchContext,
    tree: &mut WatchTree<WatchDescriptor>,
    watches: &mut Watches,
    mask: WatchMask,
    scan: SubtreeScan,
) {
    for rel in scan.directories {
        if tree.contains(&rel) {
            continue;
        }
        match watches.add(ctx.root.join(&rel), mask) {
            Ok(wd) => {
                tree.insert(rel, wd);
            }
            Err(e) => {
                // the subtree stays unwatched; everything else keeps working
                warn!(path = %rel.display(), ?e, "failed to watch scanned subdirectory");
            }
        }
    }

    for rel in scan.entries {
        ctx.sink.emit(FsEvent::create(rel));
    }
}
