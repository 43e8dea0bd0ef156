//! macOS/BSD driver over kqueue vnode events.
//!
//! kqueue delivers one event source per open descriptor and carries no
//! name fragments, so the tree keeps one `O_EVTONLY` (Apple) or
//! `O_RDONLY|O_NONBLOCK` descriptor per watched directory plus a child
//! listing: a directory's `NOTE_WRITE` is decoded by re-listing it and
//! diffing the names into create/delete events, with the same subtree
//! registration choreography as the inotify driver.
//!
//! Like inotify, only directories (and a plain-file root) hold
//! descriptors. Content writes to files inside a watched directory do not
//! touch the directory's vnode and are therefore not observable at file
//! granularity on this facility; a plain-file root still reports its own
//! writes. This mirrors the directory-granularity watch contract and keeps
//! the descriptor budget proportional to directory count.
//!
//! Access events are never delivered here: the vnode fflag vocabulary has
//! no read notification, so a filter selecting only that kind observes
//! nothing on this backend.

use std::collections::{BTreeSet, HashMap};
use std::ffi::{CString, OsString};
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use tokio::task::{spawn_blocking, JoinHandle};
use tracing::{debug, error, trace, warn};

use crate::backend::{BackendKind, Driver};
use crate::error::{Error, Result};
use crate::event::{EventKind, FsEvent};
use crate::tree::{scan_subtree, SubtreeScan, WatchTree};
use crate::watcher::{WatchContext, WatcherStatus};

#[cfg(any(target_os = "macos", target_os = "ios"))]
const OPEN_FLAGS: libc::c_int = libc::O_EVTONLY;
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const OPEN_FLAGS: libc::c_int = libc::O_RDONLY | libc::O_NONBLOCK;

const READ_BATCH: usize = 16;
const READ_TIMEOUT_NS: libc::c_long = 250_000_000;

/// One raw vnode notification as read off the queue.
struct RawVnodeEvent {
    fd: libc::c_int,
    fflags: u32,
}

fn filter_fflags(ctx: &WatchContext) -> u32 {
    let mut fflags = 0;
    for kind in ctx.filter.iter() {
        fflags |= match kind {
            // no vnode fflag reports reads
            EventKind::Access => 0,
            EventKind::Attribute => libc::NOTE_ATTRIB,
            EventKind::Create => libc::NOTE_WRITE | libc::NOTE_EXTEND,
            EventKind::Delete => libc::NOTE_DELETE | libc::NOTE_RENAME | libc::NOTE_WRITE,
            EventKind::Modify => libc::NOTE_WRITE | libc::NOTE_EXTEND,
        };
    }
    if ctx.recursive {
        fflags |= libc::NOTE_WRITE | libc::NOTE_DELETE | libc::NOTE_RENAME;
    }
    fflags
}

fn open_watch(kq: libc::c_int, path: &Path, fflags: u32) -> io::Result<libc::c_int> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let fd = unsafe { libc::open(cpath.as_ptr(), OPEN_FLAGS) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut change: libc::kevent = unsafe { mem::zeroed() };
    change.ident = fd as usize;
    change.filter = libc::EVFILT_VNODE as _;
    change.flags = (libc::EV_ADD | libc::EV_CLEAR) as _;
    change.fflags = fflags as _;

    let rc = unsafe { libc::kevent(kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

fn close_watch(fd: libc::c_int) {
    // EV_DELETE is implicit when the descriptor closes
    unsafe { libc::close(fd) };
}

fn list_children(path: &Path) -> BTreeSet<OsString> {
    std::fs::read_dir(path)
        .map(|entries| entries.flatten().map(|e| e.file_name()).collect())
        .unwrap_or_default()
}

pub(crate) struct KqueueDriver {
    ctx: Arc<WatchContext>,
    stop_tx: Option<chan::Sender<()>>,
    stop_flag: Option<Arc<AtomicBool>>,
    handle: Option<JoinHandle<()>>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl KqueueDriver {
    pub(crate) fn new(ctx: Arc<WatchContext>) -> Self {
        Self {
            ctx,
            stop_tx: None,
            stop_flag: None,
            handle: None,
            reader: None,
        }
    }
}

#[async_trait::async_trait]
impl Driver for KqueueDriver {
    async fn start(&mut self) -> Result<()> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(Error::BackendUnavailable {
                backend: BackendKind::Kqueue,
                source: io::Error::last_os_error(),
            });
        }

        let fflags = filter_fflags(&self.ctx);
        let mut tree = WatchTree::new();
        let mut children = HashMap::new();

        let seeds = if self.ctx.recursive {
            let root = self.ctx.root.clone();
            match spawn_blocking(move || scan_subtree(&root, Path::new("")).directories).await {
                Ok(dirs) => dirs,
                Err(e) => {
                    unsafe { libc::close(kq) };
                    return Err(Error::Subscription {
                        path: self.ctx.root.clone(),
                        source: io::Error::new(io::ErrorKind::Other, e),
                    });
                }
            }
        } else {
            vec![PathBuf::new()]
        };

        for rel in seeds {
            let path = self.ctx.root.join(&rel);
            match open_watch(kq, &path, fflags) {
                Ok(fd) => {
                    if path.is_dir() {
                        children.insert(rel.clone(), list_children(&path));
                    }
                    tree.insert(rel, fd);
                }
                Err(source) => {
                    for (_, fd) in tree.drain() {
                        close_watch(fd);
                    }
                    unsafe { libc::close(kq) };
                    return Err(Error::Subscription { path, source });
                }
            }
        }
        debug!(watches = tree.len(), "seeded kqueue watch tree");

        let (raw_tx, raw_rx) = chan::unbounded();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let reader_flag = Arc::clone(&stop_flag);
        let reader = match std::thread::Builder::new()
            .name("pathwatch-kqueue".into())
            .spawn(move || read_loop(kq, reader_flag, raw_tx))
        {
            Ok(reader) => reader,
            Err(source) => {
                for (_, fd) in tree.drain() {
                    close_watch(fd);
                }
                unsafe { libc::close(kq) };
                return Err(Error::BackendUnavailable {
                    backend: BackendKind::Kqueue,
                    source,
                });
            }
        };

        let (stop_tx, stop_rx) = chan::bounded(1);
        self.handle = Some(tokio::spawn(run(
            Arc::clone(&self.ctx),
            kq,
            fflags,
            tree,
            children,
            raw_rx,
            stop_rx,
        )));
        self.stop_tx = Some(stop_tx);
        self.stop_flag = Some(stop_flag);
        self.reader = Some(reader);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(flag) = self.stop_flag.take() {
            flag.store(true, Ordering::Relaxed);
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        if let Some(reader) = self.reader.take() {
            let _ = spawn_blocking(move || reader.join()).await;
        }
    }
}

/// Blocking reader: drains the kernel queue in short timeouts so the stop
/// flag is observed promptly, forwarding raw events to the async loop.
fn read_loop(kq: libc::c_int, stop: Arc<AtomicBool>, tx: chan::Sender<io::Result<RawVnodeEvent>>) {
    let timeout = libc::timespec {
        tv_sec: 0,
        tv_nsec: READ_TIMEOUT_NS,
    };

    'outer: while !stop.load(Ordering::Relaxed) {
        let mut events: [libc::kevent; READ_BATCH] = unsafe { mem::zeroed() };
        let n = unsafe {
            libc::kevent(
                kq,
                ptr::null(),
                0,
                events.as_mut_ptr(),
                READ_BATCH as _,
                &timeout,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            let _ = tx.send_blocking(Err(err));
            break;
        }
        for event in &events[..n as usize] {
            let raw = RawVnodeEvent {
                fd: event.ident as libc::c_int,
                fflags: event.fflags as u32,
            };
            if tx.send_blocking(Ok(raw)).is_err() {
                break 'outer;
            }
        }
    }

    unsafe { libc::close(kq) };
}

async fn run(
    ctx: Arc<WatchContext>,
    kq: libc::c_int,
    fflags: u32,
    mut tree: WatchTree<libc::c_int>,
    mut children: HashMap<PathBuf, BTreeSet<OsString>>,
    raw_rx: chan::Receiver<io::Result<RawVnodeEvent>>,
    stop_rx: chan::Receiver<()>,
) {
    enum Message {
        Raw(io::Result<RawVnodeEvent>),
        Scanned(SubtreeScan),
        Stop,
    }

    let (scan_tx, scan_rx) = chan::unbounded();

    let mut messages = pin!((
        raw_rx.map(Message::Raw),
        scan_rx.map(Message::Scanned),
        stop_rx.map(|()| Message::Stop),
    )
        .merge());

    while let Some(message) = messages.next().await {
        match message {
            Message::Raw(Ok(raw)) => {
                decode(&ctx, kq, fflags, &mut tree, &mut children, &scan_tx, raw);
            }
            Message::Raw(Err(e)) => {
                error!(?e, "kqueue event read failed");
                ctx.status
                    .send_replace(WatcherStatus::Failed(e.to_string()));
                break;
            }
            Message::Scanned(scan) => {
                absorb_scan(&ctx, kq, fflags, &mut tree, &mut children, scan);
            }
            Message::Stop => break,
        }
    }

    for (_, fd) in tree.drain() {
        close_watch(fd);
    }
}

fn decode(
    ctx: &WatchContext,
    kq: libc::c_int,
    fflags: u32,
    tree: &mut WatchTree<libc::c_int>,
    children: &mut HashMap<PathBuf, BTreeSet<OsString>>,
    scan_tx: &chan::Sender<SubtreeScan>,
    raw: RawVnodeEvent,
) {
    let Ok(rel) = tree.resolve(&raw.fd).map(Path::to_path_buf) else {
        // removal raced an in-flight notification
        trace!("dropping notification for untracked descriptor");
        return;
    };
    let is_dir = children.contains_key(&rel);

    if raw.fflags & libc::NOTE_ATTRIB != 0 {
        ctx.sink.emit(FsEvent::attribute(rel.clone()));
    }

    if raw.fflags & (libc::NOTE_WRITE | libc::NOTE_EXTEND) != 0 {
        if is_dir {
            rescan_directory(ctx, kq, fflags, tree, children, scan_tx, &rel);
        } else {
            ctx.sink.emit(FsEvent::modify(rel.clone()));
        }
    }

    if raw.fflags & (libc::NOTE_DELETE | libc::NOTE_RENAME) != 0 {
        for (path, fd) in tree.remove_subtree(&rel) {
            children.remove(&path);
            close_watch(fd);
        }
        // a non-root path's deletion is reported once, by its parent's
        // rescan; the root has no parent watch
        if rel.as_os_str().is_empty() {
            ctx.sink.emit(FsEvent::delete(rel));
        }
    }
}

/// Converts a directory's `NOTE_WRITE` into named events by diffing its
/// listing, registering created subtrees and releasing deleted ones.
///
/// A newly appeared directory gets its own descriptor inline, before its
/// Create event is emitted; the walk over its descendants runs on the
/// blocking pool and merges back into the loop.
fn rescan_directory(
    ctx: &WatchContext,
    kq: libc::c_int,
    fflags: u32,
    tree: &mut WatchTree<libc::c_int>,
    children: &mut HashMap<PathBuf, BTreeSet<OsString>>,
    scan_tx: &chan::Sender<SubtreeScan>,
    rel: &Path,
) {
    let abs = ctx.root.join(rel);
    let current = list_children(&abs);
    let previous = children.insert(rel.to_path_buf(), current.clone()).unwrap_or_default();

    for name in current.difference(&previous) {
        let child_rel = rel.join(name);
        let child_abs = ctx.root.join(&child_rel);
        if ctx.recursive && child_abs.is_dir() {
            match open_watch(kq, &child_abs, fflags) {
                Ok(fd) => {
                    children.insert(child_rel.clone(), list_children(&child_abs));
                    tree.insert(child_rel.clone(), fd);
                    spawn_scan(ctx, child_rel.clone(), scan_tx);
                }
                Err(e) => {
                    warn!(path = %child_rel.display(), ?e, "failed to watch new subdirectory");
                }
            }
        }
        ctx.sink.emit(FsEvent::create(child_rel));
    }

    for name in previous.difference(&current) {
        let child_rel = rel.join(name);
        for (path, fd) in tree.remove_subtree(&child_rel) {
            children.remove(&path);
            close_watch(fd);
        }
        ctx.sink.emit(FsEvent::delete(child_rel));
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
/// entries that existed before their parent's descriptor was in place.
///
/// An entry created after the descriptor was added can be reported twice
/// (once by its parent's rescan, once by the walk); it is never lost.
fn absorb_scan(
    ctx: &WatchContext,
    kq: libc::c_int,
    fflags: u32,
    tree: &mut WatchTree<libc::c_int>,
    children: &mut HashMap<PathBuf, BTreeSet<OsString>>,
    scan: SubtreeScan,
) {
    for rel in scan.directories {
        if tree.contains(&rel) {
            continue;
        }
        let abs = ctx.root.join(&rel);
        match open_watch(kq, &abs, fflags) {
            Ok(fd) => {
                children.insert(rel.clone(), list_children(&abs));
                tree.insert(rel, fd);
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
