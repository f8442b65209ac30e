//! Adapters from native SDK callbacks to bridge envelopes
//!
//! Each callback shape is translated into portable scalars (URLs as strings,
//! timestamps as second-precision ISO-8601 UTC, enums as fixed ordinals) and
//! routed to the stream matching its event class:
//!
//! | Event                    | Stream        | When detached |
//! |--------------------------|---------------|---------------|
//! | deep link resolved       | main          | queued        |
//! | in-app deep link pressed | main          | queued        |
//! | push opened              | main          | queued        |
//! | crash reported           | main          | queued        |
//! | push received            | main          | dropped       |
//! | inbox updated            | in-app sink   | dropped       |

use chrono::{DateTime, Utc};
use log::{error, trace};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    channel::{DeliveryMode, SendOutcome},
    envelope::{EventEnvelope, event_types},
    error::{BridgeError, Result},
    lifecycle::BridgeStreams,
    ordinals::DeepLinkResolution,
};

/// Formats a timestamp the way the embedded runtime parses dates
pub fn portable_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// A push notification as handed over by the native SDK
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Push id assigned by the backend
    pub id: i64,
    /// Notification title
    #[serde(default)]
    pub title: Option<String>,
    /// Notification body
    #[serde(default)]
    pub message: Option<String>,
    /// Custom data attached to the push
    #[serde(default)]
    pub data: Option<Value>,
    /// URL to open, if any, exactly as the platform reported it
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PushPayload<'a> {
    id: i64,
    title: Option<&'a str>,
    message: Option<&'a str>,
    action_id: Option<&'a str>,
    data: Option<&'a Value>,
    url: Option<&'a str>,
}

impl<'a> PushPayload<'a> {
    fn new(push: &'a PushMessage, action_id: Option<&'a str>) -> Self {
        Self {
            id: push.id,
            title: push.title.as_deref(),
            message: push.message.as_deref(),
            action_id,
            data: push.data.as_ref(),
            url: push.url.as_deref(),
        }
    }
}

/// Content block of a resolved deep link
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeepLinkContent {
    /// Link title
    #[serde(default)]
    pub title: Option<String>,
    /// Link description
    #[serde(default)]
    pub description: Option<String>,
}

/// A matched deep link
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeepLink {
    /// Human readable content
    #[serde(default)]
    pub content: DeepLinkContent,
    /// Custom data configured on the link
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Serialize)]
struct DeepLinkPayload<'a> {
    url: &'a str,
    resolution: DeepLinkResolution,
    link: Option<&'a DeepLink>,
}

/// Native shape of a deep link resolution callback
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NativeDeepLinkResolution {
    /// The URL that was clicked, passed through unparsed
    pub url: String,
    /// Resolution ordinal as reported by the platform
    pub resolution: u8,
    /// The matched link, when resolution succeeded
    #[serde(default)]
    pub link: Option<DeepLink>,
}

/// A captured crash forwarded to analytics
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashReport {
    /// Error message
    pub message: String,
    /// Rendered stack trace
    #[serde(default)]
    pub stack_trace: Option<String>,
    /// Whether the crash escaped every handler
    #[serde(default)]
    pub uncaught: bool,
}

impl CrashReport {
    /// Analytics properties for this report, shared with the native event
    pub fn properties(&self) -> Value {
        serde_json::json!({
            "format": "rust",
            "uncaught": self.uncaught,
            "report": {
                "message": self.message,
                "stackTrace": self.stack_trace,
            },
        })
    }
}

/// Builds envelopes from native callbacks and routes them onto the bridge
#[derive(Clone)]
pub struct DeferredEmitter {
    streams: BridgeStreams,
}

impl DeferredEmitter {
    /// Creates an emitter sending through `streams`
    pub fn new(streams: BridgeStreams) -> Self {
        Self { streams }
    }

    /// A deferred deep link finished resolving
    ///
    /// `url` reaches the runtime byte for byte; it is not normalized.
    pub fn deep_link_resolved(
        &self,
        url: &str,
        resolution: DeepLinkResolution,
        link: Option<&DeepLink>,
    ) -> Option<SendOutcome> {
        let payload = DeepLinkPayload {
            url,
            resolution,
            link,
        };
        self.route(
            EventEnvelope::from_payload(event_types::DEEP_LINK_RESOLVED, &payload),
            DeliveryMode::QueueIfNotReady,
        )
    }

    /// Like [`DeferredEmitter::deep_link_resolved`], from the platform shape
    pub fn native_deep_link_resolved(&self, native: &NativeDeepLinkResolution) -> Option<SendOutcome> {
        match DeepLinkResolution::from_u8(native.resolution) {
            Some(resolution) => self.deep_link_resolved(&native.url, resolution, native.link.as_ref()),
            None => self.route(
                Err(BridgeError::malformed(
                    event_types::DEEP_LINK_RESOLVED,
                    format!("unknown resolution ordinal {}", native.resolution),
                )),
                DeliveryMode::QueueIfNotReady,
            ),
        }
    }

    /// The in-app inbox changed; only a live listener cares
    pub fn inbox_updated(&self) -> SendOutcome {
        match EventEnvelope::signal(event_types::INBOX_UPDATED) {
            Ok(envelope) => self.streams.in_app().send(envelope),
            Err(err) => {
                error!("Skipping inbox update: {}", err);
                SendOutcome::Dropped
            }
        }
    }

    /// A push arrived while the app was in the foreground
    pub fn push_received(&self, push: &PushMessage) -> Option<SendOutcome> {
        self.route(
            EventEnvelope::from_payload(event_types::PUSH_RECEIVED, &PushPayload::new(push, None)),
            DeliveryMode::DropIfNotReady,
        )
    }

    /// The user opened a push, optionally through one of its action buttons
    pub fn push_opened(&self, push: &PushMessage, action_id: Option<&str>) -> Option<SendOutcome> {
        self.route(
            EventEnvelope::from_payload(
                event_types::PUSH_OPENED,
                &PushPayload::new(push, action_id),
            ),
            DeliveryMode::QueueIfNotReady,
        )
    }

    /// A deep link button inside an in-app message was pressed
    pub fn in_app_deep_link_pressed(&self, data: Value) -> Option<SendOutcome> {
        self.route(
            EventEnvelope::new(event_types::IN_APP_DEEP_LINK_PRESSED, Some(data)),
            DeliveryMode::QueueIfNotReady,
        )
    }

    /// A crash was captured
    pub fn crash_reported(&self, report: &CrashReport) -> Option<SendOutcome> {
        self.route(
            EventEnvelope::new(event_types::CRASH_REPORTED, Some(report.properties())),
            DeliveryMode::QueueIfNotReady,
        )
    }

    /// Sends a built envelope, or logs and skips a failed one
    fn route(&self, built: Result<EventEnvelope>, mode: DeliveryMode) -> Option<SendOutcome> {
        match built {
            Ok(envelope) => {
                trace!("Routing `{}` ({:?})", envelope.event_type(), mode);
                Some(self.streams.events().send_with(envelope, mode))
            }
            Err(err) => {
                error!("Skipping host event: {}", err);
                None
            }
        }
    }
}
