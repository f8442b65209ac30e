//! Host event bridge for Bevy apps embedded in native mobile shells
//!
//! Native SDK callbacks (push notifications, inbox updates, deferred deep link
//! resolution, crash capture) fire on arbitrary threads, often before the
//! embedded app is listening. This crate buffers and routes them to the
//! embedded runtime, and dispatches the runtime's commands back to the SDK.
//!
//! # Architecture
//!
//! - **EventEnvelope**: `{ type, data }` unit exchanged across the bridge
//! - **QueueingChannel**: buffers envelopes until a consumer attaches, then
//!   delivers in order; live-only envelopes are dropped while detached
//! - **SingleSlotSink**: unbuffered stream for "recompute" signals
//! - **Bridge**: explicit owner of both streams and their consumer lifecycle
//! - **DeferredEmitter**: adapts native callback shapes into envelopes
//! - **CommandDispatcher**: resolves runtime requests to native SDK calls
//! - **BridgePlugin**: attaches a Bevy app as the consumer of both streams
//! - C ABI (and JNI on Android) for the host shell

#![warn(missing_docs)]

mod channel;
mod config;
mod dispatch;
mod emitter;
mod envelope;
pub mod error;
mod lifecycle;
mod ordinals;
mod plugin;
mod sink;

pub mod ffi;

#[cfg(target_os = "android")]
pub mod android;

pub use channel::*;
pub use config::*;
pub use dispatch::*;
pub use emitter::*;
pub use envelope::*;
pub use error::BridgeError;
pub use lifecycle::*;
pub use ordinals::*;
pub use plugin::*;
pub use sink::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        channel::{DeliveryMode, EventConsumer, QueueingChannel, SendOutcome},
        emitter::DeferredEmitter,
        envelope::{EventEnvelope, event_types},
        lifecycle::{Bridge, BridgeStreams},
        plugin::{BridgePlugin, HostEvent, HostEvents, InboxUpdated},
        sink::SingleSlotSink,
    };
}
