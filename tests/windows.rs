//! End-to-end coverage of the directory-handle backend.

#![cfg(windows)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use pathwatch::{BackendKind, EventKind, EventReceiver, FsEvent, WatchConfig, Watcher};
use tokio::time::{sleep, timeout};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE_WINDOW: Duration = Duration::from_millis(400);

fn windows_config(path: &Path) -> WatchConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    WatchConfig::new(path).backend(BackendKind::Windows)
}

async fn recv_for(rx: &mut EventReceiver, path: &str) -> FsEvent {
    loop {
        let event = timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if event.path == Path::new(path) {
            return event;
        }
    }
}

async fn assert_silent(rx: &mut EventReceiver) {
    tokio::select! {
        event = rx.recv() => panic!("expected silence, received {event:?}"),
        _ = sleep(SILENCE_WINDOW) => {}
    }
}

#[tokio::test]
async fn detects_create_modify_delete() {
    let dir = tempfile::tempdir().unwrap();
    let mut watcher = Watcher::new(
        windows_config(dir.path()).filter([EventKind::Create, EventKind::Delete, EventKind::Modify]),
    )
    .unwrap();
    let mut created = watcher.subscribe(EventKind::Create);
    let mut modified = watcher.subscribe(EventKind::Modify);
    let mut deleted = watcher.subscribe(EventKind::Delete);
    watcher.start().await.unwrap();
    assert_eq!(watcher.backend(), Some(BackendKind::Windows));

    fs::write(dir.path().join("x"), b"one").unwrap();
    assert_eq!(recv_for(&mut created, "x").await, FsEvent::create("x"));

    fs::write(dir.path().join("x"), b"a longer body").unwrap();
    assert_eq!(recv_for(&mut modified, "x").await, FsEvent::modify("x"));

    fs::remove_file(dir.path().join("x")).unwrap();
    assert_eq!(recv_for(&mut deleted, "x").await, FsEvent::delete("x"));

    watcher.stop().await;
}

#[tokio::test]
async fn rename_is_delete_then_create() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("old"), b"x").unwrap();

    let mut watcher = Watcher::new(
        windows_config(dir.path()).filter([EventKind::Create, EventKind::Delete]),
    )
    .unwrap();
    let mut created = watcher.subscribe(EventKind::Create);
    let mut deleted = watcher.subscribe(EventKind::Delete);
    watcher.start().await.unwrap();

    fs::rename(dir.path().join("old"), dir.path().join("new")).unwrap();
    assert_eq!(recv_for(&mut deleted, "old").await, FsEvent::delete("old"));
    assert_eq!(recv_for(&mut created, "new").await, FsEvent::create("new"));

    watcher.stop().await;
}

#[tokio::test]
async fn stop_returns_promptly_on_a_quiescent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let mut watcher = Watcher::new(windows_config(dir.path()).filter([EventKind::Create])).unwrap();
    watcher.start().await.unwrap();

    // no filesystem activity at all between start and stop; stop must not
    // wait for an unrelated change to unblock the pending read
    timeout(Duration::from_secs(2), watcher.stop())
        .await
        .expect("stop did not return on an idle watch");
}

#[tokio::test]
async fn stop_quiesces_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let mut watcher = Watcher::new(windows_config(dir.path()).filter([EventKind::Create])).unwrap();
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
