//! End-to-end coverage of the kqueue backend.

#![cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pathwatch::{BackendKind, EventKind, EventReceiver, FsEvent, WatchConfig, Watcher};
use tokio::time::{sleep, timeout};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE_WINDOW: Duration = Duration::from_millis(400);

fn kqueue_config(path: &Path) -> WatchConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    WatchConfig::new(path).backend(BackendKind::Kqueue)
}

async fn recv(rx: &mut EventReceiver) -> FsEvent {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Receives until an event for `path` arrives, skipping others.
async fn recv_for(rx: &mut EventReceiver, path: &str) -> FsEvent {
    loop {
        let event = recv(rx).await;
        if event.path == Path::new(path) {
            return event;
        }
    }
}

/// Collects `n` distinct paths from the channel, sorted.
async fn recv_paths(rx: &mut EventReceiver, n: usize) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    while paths.len() < n {
        let event = recv(rx).await;
        if !paths.contains(&event.path) {
            paths.push(event.path);
        }
    }
    paths.sort();
    paths
}

async fn assert_silent(rx: &mut EventReceiver) {
    tokio::select! {
        event = rx.recv() => panic!("expected silence, received {event:?}"),
        _ = sleep(SILENCE_WINDOW) => {}
    }
}

#[tokio::test]
async fn detects_create_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let mut watcher = Watcher::new(
        kqueue_config(dir.path()).filter([EventKind::Create, EventKind::Delete]),
    )
    .unwrap();
    let mut created = watcher.subscribe(EventKind::Create);
    let mut deleted = watcher.subscribe(EventKind::Delete);
    watcher.start().await.unwrap();
    assert_eq!(watcher.backend(), Some(BackendKind::Kqueue));

    fs::write(dir.path().join("x"), b"one").unwrap();
    assert_eq!(recv_for(&mut created, "x").await, FsEvent::create("x"));

    fs::remove_file(dir.path().join("x")).unwrap();
    assert_eq!(recv_for(&mut deleted, "x").await, FsEvent::delete("x"));

    watcher.stop().await;
}

#[tokio::test]
async fn new_directory_is_watched_before_its_contents_change() {
    let dir = tempfile::tempdir().unwrap();
    let mut watcher = Watcher::new(kqueue_config(dir.path()).filter([EventKind::Create])).unwrap();
    let mut created = watcher.subscribe(EventKind::Create);
    watcher.start().await.unwrap();

    fs::create_dir(dir.path().join("sub")).unwrap();
    assert_eq!(recv_for(&mut created, "sub").await, FsEvent::create("sub"));

    fs::write(dir.path().join("sub/inner"), b"x").unwrap();
    assert_eq!(
        recv_for(&mut created, "sub/inner").await,
        FsEvent::create("sub/inner")
    );

    watcher.stop().await;
}

#[tokio::test]
async fn burst_created_subtree_is_never_lost() {
    let dir = tempfile::tempdir().unwrap();
    let mut watcher = Watcher::new(kqueue_config(dir.path()).filter([EventKind::Create])).unwrap();
    let mut created = watcher.subscribe(EventKind::Create);
    watcher.start().await.unwrap();

    // entries may appear before their parent's descriptor lands; the
    // background walk backfills them when it merges into the loop
    fs::create_dir_all(dir.path().join("a/b")).unwrap();
    fs::write(dir.path().join("a/b/leaf"), b"x").unwrap();

    assert_eq!(
        recv_paths(&mut created, 3).await,
        vec![
            PathBuf::from("a"),
            PathBuf::from("a/b"),
            PathBuf::from("a/b/leaf"),
        ]
    );

    watcher.stop().await;
}

#[tokio::test]
async fn events_flow_while_a_large_subtree_is_being_registered() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("staging")).unwrap();
    for i in 0..50 {
        let sub = dir.path().join("staging").join(format!("d{i}"));
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("f"), b"x").unwrap();
    }

    let mut watcher = Watcher::new(kqueue_config(dir.path()).filter([EventKind::Create])).unwrap();
    let mut created = watcher.subscribe(EventKind::Create);
    watcher.start().await.unwrap();

    // moving a populated tree in triggers a background walk; an unrelated
    // create must still come through promptly
    fs::rename(dir.path().join("staging"), dir.path().join("moved")).unwrap();
    fs::write(dir.path().join("unrelated"), b"x").unwrap();

    assert_eq!(
        recv_for(&mut created, "unrelated").await,
        FsEvent::create("unrelated")
    );
    assert_eq!(
        recv_for(&mut created, "moved/d49/f").await,
        FsEvent::create("moved/d49/f")
    );

    watcher.stop().await;
}

#[tokio::test]
async fn deleted_subtree_root_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("gone/nested")).unwrap();

    let mut watcher = Watcher::new(kqueue_config(dir.path()).filter([EventKind::Delete])).unwrap();
    let mut deleted = watcher.subscribe(EventKind::Delete);
    watcher.start().await.unwrap();

    fs::remove_dir_all(dir.path().join("gone")).unwrap();
    assert_eq!(recv_for(&mut deleted, "gone").await, FsEvent::delete("gone"));

    watcher.stop().await;
}

#[tokio::test]
async fn file_root_reports_its_own_writes() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("tracked");
    fs::write(&file, b"one").unwrap();

    let mut watcher = Watcher::new(kqueue_config(&file).filter([EventKind::Modify])).unwrap();
    let mut modified = watcher.subscribe(EventKind::Modify);
    watcher.start().await.unwrap();

    fs::write(&file, b"a different body").unwrap();
    assert_eq!(recv_for(&mut modified, "").await, FsEvent::modify(""));

    watcher.stop().await;
}

#[tokio::test]
async fn stop_quiesces_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let mut watcher = Watcher::new(kqueue_config(dir.path()).filter([EventKind::Create])).unwrap();
    let mut created = watcher.subscribe(EventKind::Create);
    watcher.start().await.unwrap();

    fs::write(dir.path().join("before"), b"x").unwrap();
    assert_eq!(
        recv_for(&mut created, "before").await,
        FsEvent::create("before")
    );

    watcher.stop().await;
    fs::write(dir.path().join("after"), b"x").unwrap();
    assert_silent(&mut created).await;
}
