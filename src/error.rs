//! Error types shared across the bridge

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failures raised while building or routing host events
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// An envelope was constructed with an empty type tag
    #[error("event type tag must not be empty")]
    EmptyEventType,

    /// A native payload could not be converted into its portable form
    #[error("failed to serialize `{event_type}` payload: {source}")]
    Serialization {
        /// Type tag of the envelope that was being built
        event_type: String,
        /// Underlying serde failure
        #[source]
        source: serde_json::Error,
    },

    /// A native callback handed over data that does not match the expected shape
    #[error("malformed native payload for `{event_type}`: {message}")]
    MalformedPayload {
        /// Type tag of the envelope that was being built
        event_type: String,
        /// What was wrong with the payload
        message: String,
    },

    /// The host passed a null pointer where a value was required
    #[error("null {0} passed across the host boundary")]
    NullPointer(&'static str),

    /// The host passed a string that is not valid UTF-8
    #[error("host string is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// A host runtime string could not be read
    #[error("failed to read {what} from the host: {message}")]
    HostString {
        /// Which argument was being read
        what: &'static str,
        /// Underlying failure
        message: String,
    },
}

impl BridgeError {
    /// Build a [`BridgeError::MalformedPayload`]
    pub fn malformed(event_type: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::MalformedPayload {
            event_type: event_type.into(),
            message: message.to_string(),
        }
    }

    /// Build a [`BridgeError::HostString`]
    pub fn host_string(what: &'static str, message: impl std::fmt::Debug) -> Self {
        Self::HostString {
            what,
            message: format!("{message:?}"),
        }
    }
}
