//! Event envelopes exchanged between the host and the embedded runtime

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, Result};

/// Dot-namespaced type tags understood by the embedded runtime
pub mod event_types {
    /// A push notification arrived while the app was in the foreground
    pub const PUSH_RECEIVED: &str = "push.received";
    /// The user opened a push notification or one of its actions
    pub const PUSH_OPENED: &str = "push.opened";
    /// The in-app message inbox changed and should be re-queried
    pub const INBOX_UPDATED: &str = "inbox.updated";
    /// A deferred deep link finished resolving
    pub const DEEP_LINK_RESOLVED: &str = "deep-linking.linkResolved";
    /// A deep link button was pressed inside an in-app message
    pub const IN_APP_DEEP_LINK_PRESSED: &str = "in-app.deepLinkPressed";
    /// A crash was captured and forwarded to analytics
    pub const CRASH_REPORTED: &str = "crash.reported";
}

/// A single event crossing the bridge
///
/// Serialized as `{ "type": ..., "data": ... }`, with `data` omitted when
/// absent. Envelopes are immutable once built; deserializing goes through
/// [`EventEnvelope::new`] and rejects an empty type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Option<Value>,
}

impl TryFrom<RawEnvelope> for EventEnvelope {
    type Error = BridgeError;

    fn try_from(raw: RawEnvelope) -> Result<Self> {
        Self::new(raw.event_type, raw.data)
    }
}

impl EventEnvelope {
    /// Creates an envelope carrying `data`
    pub fn new(event_type: impl Into<String>, data: Option<Value>) -> Result<Self> {
        let event_type = event_type.into();
        if event_type.is_empty() {
            return Err(BridgeError::EmptyEventType);
        }
        Ok(Self { event_type, data })
    }

    /// Creates an envelope without a payload
    pub fn signal(event_type: impl Into<String>) -> Result<Self> {
        Self::new(event_type, None)
    }

    /// Creates an envelope by converting a serializable payload into its portable form
    pub fn from_payload<T: Serialize>(event_type: impl Into<String>, payload: &T) -> Result<Self> {
        let event_type = event_type.into();
        let data = serde_json::to_value(payload).map_err(|source| BridgeError::Serialization {
            event_type: event_type.clone(),
            source,
        })?;
        Self::new(event_type, Some(data))
    }

    /// The dot-namespaced type tag
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The payload, if any
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Consumes the envelope, returning its tag and payload
    pub fn into_parts(self) -> (String, Option<Value>) {
        (self.event_type, self.data)
    }

    /// Serializes the envelope into the `{ type, data }` wire form
    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::with_capacity(2);
        object.insert("type".to_owned(), Value::String(self.event_type.clone()));
        if let Some(data) = &self.data {
            object.insert("data".to_owned(), data.clone());
        }
        Value::Object(object)
    }

    /// Serializes the envelope into UTF-8 JSON bytes for byte-oriented hosts
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }
}
