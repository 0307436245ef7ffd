//! Event sink contract and the manager's non-owning handle to it.
//!
//! The manager never keeps the sink alive. The consumer owns the
//! `Arc`; once it is dropped, or explicitly detached, events are dropped
//! without error.

use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::SocketEvent;

/// Consumer-side destination for [`SocketEvent`]s.
///
/// `on_event` runs on whichever task produced the event, with the
/// manager's registry locked. Implementations must not block and must not
/// call back into the [`super::SocketManager`]; queue the event instead
/// (see [`ChannelSink`]).
pub trait SocketEventSink: Send + Sync {
    /// Receives one event.
    fn on_event(&self, event: SocketEvent);
}

/// Sink that forwards every event into an unbounded tokio channel.
///
/// The consumer drains the receiver on its own schedule.
#[derive(Debug)]
pub struct ChannelSink {
    tx: UnboundedSender<SocketEvent>,
}

impl ChannelSink {
    /// Wraps an existing sender.
    pub fn new(tx: UnboundedSender<SocketEvent>) -> Self {
        Self { tx }
    }
}

impl SocketEventSink for ChannelSink {
    fn on_event(&self, event: SocketEvent) {
        if let Err(e) = self.tx.send(event) {
            log::trace!("[SocketManager] Receiver gone, dropping {} event", e.0.name());
        }
    }
}

/// Creates a channel-backed sink and the receiver that drains it.
///
/// Keep the returned `Arc` alive for as long as events should flow.
pub fn event_channel() -> (Arc<ChannelSink>, UnboundedReceiver<SocketEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelSink::new(tx)), rx)
}

/// Downgrades a concrete sink to the weak trait-object form the manager
/// stores.
///
/// Callers already holding an `Arc<dyn SocketEventSink>` can use
/// `Arc::downgrade` directly.
pub fn weak_sink<S: SocketEventSink + 'static>(sink: &Arc<S>) -> Weak<dyn SocketEventSink> {
    let weak: Weak<S> = Arc::downgrade(sink);
    weak
}

/// Weak, re-attachable reference to the current sink.
pub(crate) struct SinkHandle {
    sink: RwLock<Option<Weak<dyn SocketEventSink>>>,
}

impl SinkHandle {
    pub(crate) fn new(sink: Weak<dyn SocketEventSink>) -> Self {
        Self {
            sink: RwLock::new(Some(sink)),
        }
    }

    pub(crate) fn attach(&self, sink: Weak<dyn SocketEventSink>) {
        *self.sink.write().expect("SinkHandle lock poisoned") = Some(sink);
    }

    pub(crate) fn detach(&self) {
        *self.sink.write().expect("SinkHandle lock poisoned") = None;
    }

    /// Hands `event` to the sink if it still exists.
    ///
    /// Returns `false` if the event was dropped.
    pub(crate) fn deliver(&self, event: SocketEvent) -> bool {
        let sink = self
            .sink
            .read()
            .expect("SinkHandle lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade);

        match sink {
            Some(sink) => {
                sink.on_event(event);
                true
            }
            None => {
                log::trace!(
                    "[SocketManager] No sink, dropping {} event for id {}",
                    event.name(),
                    event.id()
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attached = self
            .sink
            .read()
            .map(|s| s.as_ref().is_some_and(|w| w.strong_count() > 0))
            .unwrap_or(false);
        f.debug_struct("SinkHandle")
            .field("attached", &attached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_event(id: u32) -> SocketEvent {
        SocketEvent::Timeout { id }
    }

    #[test]
    fn test_delivers_while_sink_alive() {
        let (sink, mut rx) = event_channel();
        let handle = SinkHandle::new(weak_sink(&sink));

        assert!(handle.deliver(timeout_event(1)));
        assert_eq!(rx.try_recv().unwrap(), timeout_event(1));
    }

    #[test]
    fn test_does_not_keep_sink_alive() {
        let (sink, mut rx) = event_channel();
        let handle = SinkHandle::new(weak_sink(&sink));
        drop(sink);

        assert!(!handle.deliver(timeout_event(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_detach_and_reattach() {
        let (sink, mut rx) = event_channel();
        let handle = SinkHandle::new(weak_sink(&sink));

        handle.detach();
        assert!(!handle.deliver(timeout_event(1)));

        handle.attach(weak_sink(&sink));
        assert!(handle.deliver(timeout_event(2)));
        assert_eq!(rx.try_recv().unwrap(), timeout_event(2));
    }

    #[test]
    fn test_accepts_trait_object_sink() {
        let (sink, mut rx) = event_channel();
        let shared: Arc<dyn SocketEventSink> = sink;
        let handle = SinkHandle::new(Arc::downgrade(&shared));

        assert!(handle.deliver(timeout_event(3)));
        assert_eq!(rx.try_recv().unwrap(), timeout_event(3));

        drop(shared);
        assert!(!handle.deliver(timeout_event(4)));
    }

    #[test]
    fn test_closed_receiver_is_not_a_fault() {
        let (sink, rx) = event_channel();
        drop(rx);
        let handle = SinkHandle::new(weak_sink(&sink));
        // Sink exists, channel is closed: still counts as delivered to the sink.
        assert!(handle.deliver(timeout_event(1)));
    }
}
