//! Bevy plugin that makes the embedded app the consumer of both host streams

use std::sync::Arc;

use bevy::{
    app::{App, Plugin, PreUpdate},
    ecs::{
        message::{Message, MessageWriter},
        resource::Resource,
        system::Res,
    },
};
use log::debug;

use crate::{
    channel::{EventStream, event_stream},
    envelope::EventEnvelope,
    lifecycle::{BridgeStreams, ConsumerGuard},
};

/// An envelope from the host's main event stream
#[derive(Message, Debug, Clone, PartialEq)]
pub struct HostEvent(pub EventEnvelope);

/// The in-app inbox changed; re-query it
#[derive(Message, Debug, Clone, Copy, Default)]
pub struct InboxUpdated;

/// Main event stream as seen from inside the Bevy app
///
/// Dropping this resource detaches the app from the stream.
#[derive(Resource)]
pub struct HostEvents {
    stream: EventStream,
    _guard: ConsumerGuard,
}

impl HostEvents {
    /// Receive the next host event (non-blocking)
    pub fn receive(&self) -> Option<EventEnvelope> {
        self.stream.receive()
    }
}

/// In-app update stream as seen from inside the Bevy app
///
/// Dropping this resource detaches the app from the sink, unless another
/// app has replaced it there since.
#[derive(Resource)]
pub struct InAppUpdates {
    stream: EventStream,
    _guard: ConsumerGuard,
}

/// Plugin that attaches the Bevy app to the host event bridge
///
/// The main stream's backlog is flushed when the plugin is built; every
/// frame, delivered envelopes are forwarded as [`HostEvent`] and
/// [`InboxUpdated`] messages during `PreUpdate`.
///
/// # Example
///
/// ```no_run
/// use bevy::prelude::*;
/// use bevy_embedded_bridge::{Bridge, BridgePlugin};
///
/// let bridge = Bridge::default();
/// App::new()
///     .add_plugins(BridgePlugin::new(bridge.streams()))
///     .run();
/// ```
pub struct BridgePlugin {
    streams: BridgeStreams,
}

impl BridgePlugin {
    /// Creates a plugin consuming `streams`
    pub fn new(streams: BridgeStreams) -> Self {
        Self { streams }
    }
}

impl Plugin for BridgePlugin {
    fn name(&self) -> &str {
        "bevy_embedded_bridge::BridgePlugin"
    }

    fn build(&self, app: &mut App) {
        let (consumer, stream) = event_stream();
        let id = self.streams.events().attach(consumer);
        let host_events = HostEvents {
            stream,
            _guard: ConsumerGuard::new(Arc::clone(self.streams.events()), id),
        };

        let (consumer, stream) = event_stream();
        let id = self.streams.in_app().attach(consumer);
        let in_app = InAppUpdates {
            stream,
            _guard: ConsumerGuard::new(Arc::clone(self.streams.in_app()), id),
        };

        debug!("Bevy app attached to host event streams");

        app.insert_resource(host_events)
            .insert_resource(in_app)
            .add_message::<HostEvent>()
            .add_message::<InboxUpdated>()
            .add_systems(PreUpdate, forward_host_events);
    }
}

/// System that forwards delivered envelopes into Bevy messages
fn forward_host_events(
    host_events: Res<HostEvents>,
    in_app: Res<InAppUpdates>,
    mut event_writer: MessageWriter<HostEvent>,
    mut inbox_writer: MessageWriter<InboxUpdated>,
) {
    for envelope in host_events.stream.drain() {
        event_writer.write(HostEvent(envelope));
    }

    // Several updates in one frame collapse into one re-query
    if in_app.stream.drain().count() > 0 {
        inbox_writer.write(InboxUpdated);
    }
}
