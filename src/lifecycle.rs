//! Consumer attachment lifecycle for the bridge's two outbound streams
//!
//! A [`Bridge`] is created once when the host starts the embedded runtime and
//! shut down when the runtime goes away. It owns the main event
//! [`QueueingChannel`] and the in-app [`SingleSlotSink`]; producers receive a
//! cloned [`BridgeStreams`] handle instead of looking up global state.

use std::sync::Arc;

use log::{debug, info};

use crate::{
    channel::{AttachmentId, EventConsumer, QueueingChannel},
    emitter::DeferredEmitter,
    sink::SingleSlotSink,
};

/// Attachment state of the main event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No consumer; queueing sends accumulate
    Detached,
    /// A consumer is attached; sends pass straight through
    Attached,
}

/// Shared handle to both outbound streams
#[derive(Clone, Default)]
pub struct BridgeStreams {
    events: Arc<QueueingChannel>,
    in_app: Arc<SingleSlotSink>,
}

impl BridgeStreams {
    /// Wraps an existing channel and sink
    pub fn new(events: Arc<QueueingChannel>, in_app: Arc<SingleSlotSink>) -> Self {
        Self { events, in_app }
    }

    /// The main, queueing event stream
    pub fn events(&self) -> &Arc<QueueingChannel> {
        &self.events
    }

    /// The in-app update stream
    pub fn in_app(&self) -> &Arc<SingleSlotSink> {
        &self.in_app
    }
}

/// Owner of the bridge's consumer-facing lifecycle
///
/// Only the bridge owner attaches and detaches consumers; any thread may
/// send through [`Bridge::streams`] or [`Bridge::emitter`].
pub struct Bridge {
    streams: BridgeStreams,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::start(QueueingChannel::new())
    }
}

impl Bridge {
    /// Starts the bridge around `events`, with both streams detached
    pub fn start(events: QueueingChannel) -> Self {
        info!("Starting host event bridge");
        Self {
            streams: BridgeStreams::new(Arc::new(events), Arc::new(SingleSlotSink::new())),
        }
    }

    /// Handle for producers
    pub fn streams(&self) -> BridgeStreams {
        self.streams.clone()
    }

    /// Emitter that adapts native callbacks onto this bridge's streams
    pub fn emitter(&self) -> DeferredEmitter {
        DeferredEmitter::new(self.streams())
    }

    /// Whether [`Bridge::shutdown`] has not run yet
    pub fn is_running(&self) -> bool {
        !self.streams.events.is_closed()
    }

    /// Current state of the main event stream
    pub fn event_stream_state(&self) -> StreamState {
        if self.streams.events.is_attached() {
            StreamState::Attached
        } else {
            StreamState::Detached
        }
    }

    /// The runtime started listening on the main stream; flushes the backlog
    pub fn listen_events(&self, consumer: impl EventConsumer + 'static) -> AttachmentId {
        debug!("Main event stream listener attached");
        self.streams.events.attach(consumer)
    }

    /// The runtime stopped listening on the main stream
    pub fn cancel_events(&self) {
        debug!("Main event stream listener cancelled");
        self.streams.events.detach();
    }

    /// The runtime started listening for in-app updates
    pub fn listen_in_app(&self, consumer: impl EventConsumer + 'static) -> AttachmentId {
        debug!("In-app update listener attached");
        self.streams.in_app.attach(consumer)
    }

    /// The runtime stopped listening for in-app updates
    pub fn cancel_in_app(&self) {
        debug!("In-app update listener cancelled");
        self.streams.in_app.detach();
    }

    /// Detaches every consumer and drops any backlog. Idempotent.
    ///
    /// The main stream is closed for good: producers still holding
    /// [`BridgeStreams`] get [`SendOutcome::Dropped`](crate::SendOutcome::Dropped)
    /// instead of growing a backlog nobody will drain.
    pub fn shutdown(&self) {
        if self.streams.events.close() {
            info!("Shutting down host event bridge");
        }
        self.streams.in_app.detach();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A stream whose consumer can be detached by attachment id
pub trait AttachedStream: Send + Sync {
    /// Detaches only if `id` still names the attached consumer
    fn detach_if_current(&self, id: AttachmentId) -> bool;
}

impl AttachedStream for QueueingChannel {
    fn detach_if_current(&self, id: AttachmentId) -> bool {
        QueueingChannel::detach_if_current(self, id)
    }
}

impl AttachedStream for SingleSlotSink {
    fn detach_if_current(&self, id: AttachmentId) -> bool {
        SingleSlotSink::detach_if_current(self, id)
    }
}

/// Detaches a consumer when dropped, unless it was replaced
pub struct ConsumerGuard {
    stream: Arc<dyn AttachedStream>,
    id: AttachmentId,
}

impl ConsumerGuard {
    /// Ties the attachment `id` on `stream` to this guard's lifetime
    pub fn new<S: AttachedStream + 'static>(stream: Arc<S>, id: AttachmentId) -> Self {
        Self { stream, id }
    }

    /// The attachment this guard controls
    pub fn id(&self) -> AttachmentId {
        self.id
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        if !self.stream.detach_if_current(self.id) {
            debug!("Consumer already replaced, leaving stream attached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::SendOutcome, emitter::PushMessage, envelope::EventEnvelope};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[test]
    fn listen_and_cancel_drive_state_machine() {
        let bridge = Bridge::default();
        assert_eq!(bridge.event_stream_state(), StreamState::Detached);

        bridge
            .streams()
            .events()
            .send(EventEnvelope::signal("push.opened").unwrap());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        bridge.listen_events(move |e: EventEnvelope| recorder.lock().unwrap().push(e));
        assert_eq!(bridge.event_stream_state(), StreamState::Attached);
        assert_eq!(seen.lock().unwrap().len(), 1);

        bridge.cancel_events();
        bridge.cancel_events();
        assert_eq!(bridge.event_stream_state(), StreamState::Detached);
    }

    #[test]
    fn shutdown_detaches_both_streams() {
        let bridge = Bridge::default();
        bridge.listen_events(|_: EventEnvelope| {});
        bridge.listen_in_app(|_: EventEnvelope| {});

        bridge.shutdown();
        assert!(!bridge.is_running());
        assert_eq!(bridge.event_stream_state(), StreamState::Detached);
        assert!(!bridge.streams().in_app().is_attached());
    }

    #[test]
    fn guard_detaches_only_its_own_consumer() {
        let bridge = Bridge::default();
        let events = Arc::clone(bridge.streams().events());

        let first = ConsumerGuard::new(Arc::clone(&events), bridge.listen_events(|_: EventEnvelope| {}));
        let second = ConsumerGuard::new(Arc::clone(&events), bridge.listen_events(|_: EventEnvelope| {}));

        drop(first);
        assert!(events.is_attached());
        drop(second);
        assert!(!events.is_attached());
    }

    #[test]
    fn in_app_guard_detaches_only_its_own_consumer() {
        let bridge = Bridge::default();
        let in_app = Arc::clone(bridge.streams().in_app());

        let first = ConsumerGuard::new(Arc::clone(&in_app), bridge.listen_in_app(|_: EventEnvelope| {}));
        let second = ConsumerGuard::new(Arc::clone(&in_app), bridge.listen_in_app(|_: EventEnvelope| {}));

        drop(first);
        assert!(in_app.is_attached());
        drop(second);
        assert!(!in_app.is_attached());
    }

    #[test]
    fn producers_outliving_the_bridge_no_longer_queue() {
        let bridge = Bridge::default();
        let producer = bridge.streams();
        drop(bridge);

        assert_eq!(
            producer
                .events()
                .send(EventEnvelope::signal("push.opened").unwrap()),
            SendOutcome::Dropped
        );
        assert_eq!(producer.events().pending_len(), 0);
    }

    #[test]
    fn shutdown_stops_late_listeners() {
        let bridge = Bridge::default();
        bridge.shutdown();
        bridge.shutdown();

        bridge.listen_events(|_: EventEnvelope| {});
        assert_eq!(bridge.event_stream_state(), StreamState::Detached);

        let push: PushMessage = serde_json::from_str(r#"{"id": 1}"#).unwrap();
        assert_eq!(
            bridge.emitter().push_opened(&push, None),
            Some(SendOutcome::Dropped)
        );
    }
}
