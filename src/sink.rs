//! Per-kind event fan-out.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::event::{EventFilter, FsEvent};
use crate::EventKind;

const CHANNEL_CAPACITY: usize = 256;

/// Five broadcast channels, one per [`EventKind`], guarded by the
/// configured filter.
///
/// Subscribing is safe while dispatch is active; subscribers that fall
/// more than [`CHANNEL_CAPACITY`] events behind observe a lag marker
/// instead of blocking the watcher (acceptable coalescing under bursts).
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    filter: EventFilter,
    channels: Arc<[broadcast::Sender<FsEvent>; 5]>,
}

impl EventSink {
    pub(crate) fn new(filter: EventFilter) -> Self {
        Self {
            filter,
            channels: Arc::new(std::array::from_fn(|_| {
                broadcast::channel(CHANNEL_CAPACITY).0
            })),
        }
    }

    pub(crate) fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<FsEvent> {
        self.channels[kind as usize].subscribe()
    }

    /// Delivers `event` to its kind's channel. Kinds outside the
    /// configured filter are dropped here, whatever a backend decoded.
    pub(crate) fn emit(&self, event: FsEvent) {
        if !self.filter.contains(event.kind) {
            return;
        }
        trace!(kind = %event.kind, path = %event.path.display(), "emitting event");
        // send only fails when nobody is subscribed
        let _ = self.channels[event.kind as usize].send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_configured_kinds() {
        let sink = EventSink::new(EventFilter::all());
        let mut created = sink.subscribe(EventKind::Create);

        sink.emit(FsEvent::create("a.txt"));
        assert_eq!(created.recv().await.unwrap(), FsEvent::create("a.txt"));
    }

    #[tokio::test]
    async fn drops_unconfigured_kinds() {
        let sink = EventSink::new(EventFilter::from(EventKind::Create));
        let mut modified = sink.subscribe(EventKind::Modify);

        sink.emit(FsEvent::modify("a.txt"));
        sink.emit(FsEvent::create("a.txt"));
        assert!(matches!(
            modified.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_events_only() {
        let sink = EventSink::new(EventFilter::all());
        sink.emit(FsEvent::delete("early"));

        let mut deleted = sink.subscribe(EventKind::Delete);
        sink.emit(FsEvent::delete("late"));
        assert_eq!(deleted.recv().await.unwrap(), FsEvent::delete("late"));
    }
}
