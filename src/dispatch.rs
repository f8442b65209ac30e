//! Inbound command dispatch from the embedded runtime to the native SDK
//!
//! Requests arrive as a method name plus arguments and resolve to exactly one
//! [`NativeSdk`] call. Commands that raise bridge events (crash reports) go
//! through the [`DeferredEmitter`] like every other producer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use url::Url;

use crate::{
    config::{BridgeConfig, LayerInfo},
    emitter::{CrashReport, DeferredEmitter, portable_timestamp},
    ordinals::InboxPresentationResult,
};

/// Analytics event type used for crash reports
pub const CRASH_EVENT_TYPE: &str = "k.crash.loggedException";

/// Errors returned to the requester instead of a result
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No handler exists for the method
    #[error("method `{0}` is not implemented")]
    NotImplemented(String),

    /// An argument is missing or has the wrong type
    #[error("invalid argument `{name}` for `{method}`: {message}")]
    InvalidArgument {
        /// Method being dispatched
        method: String,
        /// Argument name, or `arguments` for positional payloads
        name: String,
        /// What went wrong
        message: String,
    },
}

/// A request from the embedded runtime
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MethodCall {
    /// Method name
    pub method: String,
    /// Named arguments, or a bare value for single-argument methods
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    /// Creates a call
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }

    fn invalid(&self, name: &str, message: impl std::fmt::Display) -> DispatchError {
        DispatchError::InvalidArgument {
            method: self.method.clone(),
            name: name.to_owned(),
            message: message.to_string(),
        }
    }

    fn optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, DispatchError> {
        match self.arguments.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| self.invalid(name, err)),
        }
    }

    fn required<T: DeserializeOwned>(&self, name: &str) -> Result<T, DispatchError> {
        self.optional(name)?
            .ok_or_else(|| self.invalid(name, "missing"))
    }

    fn positional<T: DeserializeOwned>(&self) -> Result<T, DispatchError> {
        serde_json::from_value(self.arguments.clone()).map_err(|err| self.invalid("arguments", err))
    }
}

/// A message in the in-app inbox
#[derive(Debug, Clone, PartialEq)]
pub struct InboxItem {
    /// Message id
    pub id: i64,
    /// Title
    pub title: String,
    /// Subtitle
    pub subtitle: String,
    /// When the message was sent
    pub sent_at: DateTime<Utc>,
    /// Start of the availability window
    pub available_from: Option<DateTime<Utc>>,
    /// End of the availability window
    pub available_to: Option<DateTime<Utc>>,
    /// When the user dismissed the message
    pub dismissed_at: Option<DateTime<Utc>>,
    /// Whether the message has been read
    pub is_read: bool,
    /// Custom data
    pub data: Option<Value>,
    /// Image shown alongside the message
    pub image_url: Option<Url>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PortableInboxItem<'a> {
    id: i64,
    title: &'a str,
    subtitle: &'a str,
    sent_at: String,
    available_from: Option<String>,
    available_to: Option<String>,
    dismissed_at: Option<String>,
    is_read: bool,
    data: Option<&'a Value>,
    image_url: Option<&'a str>,
}

impl InboxItem {
    fn portable(&self) -> PortableInboxItem<'_> {
        PortableInboxItem {
            id: self.id,
            title: &self.title,
            subtitle: &self.subtitle,
            sent_at: portable_timestamp(&self.sent_at),
            available_from: self.available_from.as_ref().map(portable_timestamp),
            available_to: self.available_to.as_ref().map(portable_timestamp),
            dismissed_at: self.dismissed_at.as_ref().map(portable_timestamp),
            is_read: self.is_read,
            data: self.data.as_ref(),
            image_url: self.image_url.as_ref().map(Url::as_str),
        }
    }
}

/// Inbox counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxSummary {
    /// All messages
    pub total_count: u32,
    /// Unread messages
    pub unread_count: u32,
}

/// Operations the native SDK exposes to the bridge
pub trait NativeSdk: Send + Sync {
    /// Starts the SDK from the parsed descriptor, tagging it with the layers
    /// it runs under
    fn initialize(&self, config: &BridgeConfig, runtime: &LayerInfo, sdk: &LayerInfo);

    /// Unique id of this install
    fn install_id(&self) -> String;

    /// Identifier of the associated user, or the install id
    fn current_user_identifier(&self) -> String;

    /// Associates a user (and optional attributes) with this install
    fn associate_user_with_install(&self, user_id: &str, attributes: Option<&Value>);

    /// Removes the user association
    fn clear_user_association(&self);

    /// Records an analytics event, sending immediately when `flush` is set
    fn track_event(&self, event_type: &str, properties: Option<&Value>, flush: bool);

    /// Reports the device location
    fn send_location_update(&self, lat: f64, lng: f64, at: DateTime<Utc>);

    /// Requests a push token and registers it
    fn push_register(&self);

    /// Unregisters from push
    fn push_unregister(&self);

    /// Records the user's in-app messaging consent
    fn update_in_app_consent(&self, consented: bool);

    /// Current inbox contents
    fn inbox_items(&self) -> Vec<InboxItem>;

    /// Presents an inbox message
    fn present_inbox_message(&self, item: &InboxItem) -> InboxPresentationResult;

    /// Deletes an inbox message
    fn delete_inbox_message(&self, item: &InboxItem) -> bool;

    /// Marks an inbox message as read
    fn mark_inbox_message_read(&self, item: &InboxItem) -> bool;

    /// Marks every inbox message as read
    fn mark_all_inbox_messages_read(&self) -> bool;

    /// Inbox counters
    fn inbox_summary(&self) -> InboxSummary;
}

/// Resolves [`MethodCall`]s against a [`NativeSdk`]
pub struct CommandDispatcher {
    sdk: Arc<dyn NativeSdk>,
    config: BridgeConfig,
    emitter: DeferredEmitter,
}

impl CommandDispatcher {
    /// Creates a dispatcher
    pub fn new(sdk: Arc<dyn NativeSdk>, config: BridgeConfig, emitter: DeferredEmitter) -> Self {
        Self {
            sdk,
            config,
            emitter,
        }
    }

    /// Initializes `sdk` from `config`, then dispatches to it
    pub fn start(sdk: Arc<dyn NativeSdk>, config: BridgeConfig, emitter: DeferredEmitter) -> Self {
        let runtime = LayerInfo::runtime();
        let layer = LayerInfo::sdk();
        info!(
            "Initializing native SDK (runtime {} {}, sdk {} {})",
            runtime.id, runtime.version, layer.id, layer.version
        );
        sdk.initialize(&config, &runtime, &layer);
        Self::new(sdk, config, emitter)
    }

    /// Handles one request, returning its result
    pub fn handle(&self, call: &MethodCall) -> Result<Value, DispatchError> {
        debug!("Dispatching `{}`", call.method);
        let sdk = self.sdk.as_ref();

        match call.method.as_str() {
            "getKeys" => Ok(json!([self.config.api_key(), self.config.secret_key()])),
            "getInstallId" => Ok(Value::String(sdk.install_id())),
            "getCurrentUserIdentifier" => Ok(Value::String(sdk.current_user_identifier())),
            "associateUserWithInstall" => {
                let user_id: String = call.required("id")?;
                let attrs: Option<Value> = call.optional("attrs")?;
                sdk.associate_user_with_install(&user_id, attrs.as_ref());
                Ok(Value::Null)
            }
            "clearUserAssociation" => {
                sdk.clear_user_association();
                Ok(Value::Null)
            }
            "trackEvent" => {
                let event_type: String = call.required("type")?;
                let props: Option<Value> = call.optional("props")?;
                let flush = call.optional("flush")?.unwrap_or(false);
                sdk.track_event(&event_type, props.as_ref(), flush);
                Ok(Value::Null)
            }
            "sendLocationUpdate" => {
                let lat: f64 = call.required("lat")?;
                let lng: f64 = call.required("lng")?;
                sdk.send_location_update(lat, lng, Utc::now());
                Ok(Value::Null)
            }
            "pushRequestDeviceToken" => {
                sdk.push_register();
                Ok(Value::Null)
            }
            "pushUnregister" => {
                sdk.push_unregister();
                Ok(Value::Null)
            }
            "inAppUpdateConsent" => {
                sdk.update_in_app_consent(call.positional()?);
                Ok(Value::Null)
            }
            "inAppGetInboxItems" => {
                let items = sdk.inbox_items();
                let portable: Vec<_> = items.iter().map(InboxItem::portable).collect();
                serde_json::to_value(portable).map_err(|err| call.invalid("items", err))
            }
            "inAppPresentInboxMessage" => {
                let result = self
                    .find_inbox_item(call)?
                    .map_or(InboxPresentationResult::Failed, |item| {
                        sdk.present_inbox_message(&item)
                    });
                Ok(json!(result))
            }
            "inAppDeleteMessageFromInbox" => {
                let deleted = self
                    .find_inbox_item(call)?
                    .is_some_and(|item| sdk.delete_inbox_message(&item));
                Ok(Value::Bool(deleted))
            }
            "inAppMarkAsRead" => {
                let marked = self
                    .find_inbox_item(call)?
                    .is_some_and(|item| sdk.mark_inbox_message_read(&item));
                Ok(Value::Bool(marked))
            }
            "inAppMarkAllInboxItemsAsRead" => Ok(Value::Bool(sdk.mark_all_inbox_messages_read())),
            "inAppGetInboxSummary" => Ok(json!(sdk.inbox_summary())),
            "reportCrash" => {
                let report = CrashReport {
                    message: call.required("error")?,
                    stack_trace: call.optional("stackTrace")?,
                    uncaught: call.optional("uncaught")?.unwrap_or(false),
                };
                if !self.config.crash_reporting_enabled() {
                    debug!("Crash reporting disabled, discarding report");
                    return Ok(Value::Null);
                }
                sdk.track_event(CRASH_EVENT_TYPE, Some(&report.properties()), true);
                self.emitter.crash_reported(&report);
                Ok(Value::Null)
            }
            other => {
                warn!("Unhandled bridge method `{}`", other);
                Err(DispatchError::NotImplemented(other.to_owned()))
            }
        }
    }

    fn find_inbox_item(&self, call: &MethodCall) -> Result<Option<InboxItem>, DispatchError> {
        let id: i64 = call.positional()?;
        Ok(self.sdk.inbox_items().into_iter().find(|item| item.id == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{envelope::EventEnvelope, lifecycle::Bridge};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSdk {
        calls: Mutex<Vec<String>>,
    }

    impl FakeSdk {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl NativeSdk for FakeSdk {
        fn initialize(&self, config: &BridgeConfig, runtime: &LayerInfo, sdk: &LayerInfo) {
            self.record(format!(
                "init {} crash={} runtime={}/{} sdk={}/{}",
                config.api_key(),
                config.crash_reporting_enabled(),
                runtime.id,
                runtime.version,
                sdk.id,
                sdk.version
            ));
        }

        fn install_id(&self) -> String {
            "install-1".to_owned()
        }

        fn current_user_identifier(&self) -> String {
            "user-1".to_owned()
        }

        fn associate_user_with_install(&self, user_id: &str, attributes: Option<&Value>) {
            self.record(format!("associate {user_id} {attributes:?}"));
        }

        fn clear_user_association(&self) {
            self.record("clear");
        }

        fn track_event(&self, event_type: &str, _properties: Option<&Value>, flush: bool) {
            self.record(format!("track {event_type} {flush}"));
        }

        fn send_location_update(&self, lat: f64, lng: f64, _at: DateTime<Utc>) {
            self.record(format!("location {lat} {lng}"));
        }

        fn push_register(&self) {
            self.record("push register");
        }

        fn push_unregister(&self) {
            self.record("push unregister");
        }

        fn update_in_app_consent(&self, consented: bool) {
            self.record(format!("consent {consented}"));
        }

        fn inbox_items(&self) -> Vec<InboxItem> {
            vec![InboxItem {
                id: 7,
                title: "Welcome".to_owned(),
                subtitle: "Hi".to_owned(),
                sent_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap(),
                available_from: None,
                available_to: Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()),
                dismissed_at: None,
                is_read: false,
                data: None,
                image_url: Some(Url::parse("https://cdn.example.com/i.png").unwrap()),
            }]
        }

        fn present_inbox_message(&self, _item: &InboxItem) -> InboxPresentationResult {
            InboxPresentationResult::FailedExpired
        }

        fn delete_inbox_message(&self, item: &InboxItem) -> bool {
            self.record(format!("delete {}", item.id));
            true
        }

        fn mark_inbox_message_read(&self, _item: &InboxItem) -> bool {
            true
        }

        fn mark_all_inbox_messages_read(&self) -> bool {
            true
        }

        fn inbox_summary(&self) -> InboxSummary {
            InboxSummary {
                total_count: 1,
                unread_count: 1,
            }
        }
    }

    fn dispatcher_with(bridge: &Bridge, config: &str) -> (Arc<FakeSdk>, CommandDispatcher) {
        let sdk = Arc::new(FakeSdk::default());
        let config = BridgeConfig::from_json_str(config).unwrap();
        let dispatcher = CommandDispatcher::new(sdk.clone(), config, bridge.emitter());
        (sdk, dispatcher)
    }

    fn dispatcher(bridge: &Bridge) -> (Arc<FakeSdk>, CommandDispatcher) {
        dispatcher_with(
            bridge,
            r#"{"apiKey": "a", "secretKey": "s", "enableCrashReporting": true}"#,
        )
    }

    #[test]
    fn start_initializes_sdk_with_layer_info() {
        let bridge = Bridge::default();
        let sdk = Arc::new(FakeSdk::default());
        let config = BridgeConfig::from_json_str(
            r#"{"apiKey": "a", "secretKey": "s", "enableCrashReporting": true}"#,
        )
        .unwrap();
        CommandDispatcher::start(sdk.clone(), config, bridge.emitter());

        assert_eq!(
            sdk.calls(),
            vec![format!(
                "init a crash=true runtime=9/unknown sdk=11/{}",
                env!("CARGO_PKG_VERSION")
            )]
        );
    }

    #[test]
    fn keys_and_ids() {
        let bridge = Bridge::default();
        let (_, dispatcher) = dispatcher(&bridge);

        assert_eq!(
            dispatcher.handle(&MethodCall::new("getKeys", Value::Null)).unwrap(),
            json!(["a", "s"])
        );
        assert_eq!(
            dispatcher
                .handle(&MethodCall::new("getInstallId", Value::Null))
                .unwrap(),
            json!("install-1")
        );
    }

    #[test]
    fn inbox_items_use_portable_dates() {
        let bridge = Bridge::default();
        let (_, dispatcher) = dispatcher(&bridge);

        let items = dispatcher
            .handle(&MethodCall::new("inAppGetInboxItems", Value::Null))
            .unwrap();
        assert_eq!(
            items,
            json!([{
                "id": 7,
                "title": "Welcome",
                "subtitle": "Hi",
                "sentAt": "2024-05-01T12:00:30Z",
                "availableFrom": null,
                "availableTo": "2024-06-01T00:00:00Z",
                "dismissedAt": null,
                "isRead": false,
                "data": null,
                "imageUrl": "https://cdn.example.com/i.png",
            }])
        );
    }

    #[test]
    fn inbox_actions_by_id() {
        let bridge = Bridge::default();
        let (sdk, dispatcher) = dispatcher(&bridge);

        assert_eq!(
            dispatcher
                .handle(&MethodCall::new("inAppPresentInboxMessage", json!(7)))
                .unwrap(),
            json!(1)
        );
        assert_eq!(
            dispatcher
                .handle(&MethodCall::new("inAppPresentInboxMessage", json!(99)))
                .unwrap(),
            json!(2)
        );
        assert_eq!(
            dispatcher
                .handle(&MethodCall::new("inAppDeleteMessageFromInbox", json!(99)))
                .unwrap(),
            json!(false)
        );
        assert_eq!(
            dispatcher
                .handle(&MethodCall::new("inAppMarkAsRead", json!(7)))
                .unwrap(),
            json!(true)
        );
        assert_eq!(
            dispatcher
                .handle(&MethodCall::new("inAppGetInboxSummary", Value::Null))
                .unwrap(),
            json!({ "totalCount": 1, "unreadCount": 1 })
        );
        assert!(sdk.calls().is_empty());
    }

    #[test]
    fn track_event_defaults_flush_to_false() {
        let bridge = Bridge::default();
        let (sdk, dispatcher) = dispatcher(&bridge);

        dispatcher
            .handle(&MethodCall::new("trackEvent", json!({ "type": "purchase" })))
            .unwrap();
        dispatcher
            .handle(&MethodCall::new(
                "trackEvent",
                json!({ "type": "purchase", "flush": true, "props": { "sku": 1 } }),
            ))
            .unwrap();
        assert_eq!(sdk.calls(), vec!["track purchase false", "track purchase true"]);
    }

    #[test]
    fn report_crash_tracks_and_emits_through_channel() {
        let bridge = Bridge::default();
        let (sdk, dispatcher) = dispatcher(&bridge);

        dispatcher
            .handle(&MethodCall::new(
                "reportCrash",
                json!({ "error": "boom", "stackTrace": "at main", "uncaught": true }),
            ))
            .unwrap();
        assert_eq!(sdk.calls(), vec![format!("track {CRASH_EVENT_TYPE} true")]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        bridge.listen_events(move |e: EventEnvelope| recorder.lock().unwrap().push(e));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type(), "crash.reported");
        assert_eq!(seen[0].data().unwrap()["report"]["message"], json!("boom"));
    }

    #[test]
    fn report_crash_is_discarded_when_crash_reporting_is_off() {
        let bridge = Bridge::default();
        let (sdk, dispatcher) = dispatcher_with(&bridge, r#"{"apiKey": "a", "secretKey": "s"}"#);

        assert_eq!(
            dispatcher
                .handle(&MethodCall::new("reportCrash", json!({ "error": "boom" })))
                .unwrap(),
            Value::Null
        );
        assert!(sdk.calls().is_empty());
        assert_eq!(bridge.streams().events().pending_len(), 0);
    }

    #[test]
    fn argument_errors() {
        let bridge = Bridge::default();
        let (_, dispatcher) = dispatcher(&bridge);

        assert!(matches!(
            dispatcher.handle(&MethodCall::new("associateUserWithInstall", json!({}))),
            Err(DispatchError::InvalidArgument { name, .. }) if name == "id"
        ));
        assert!(matches!(
            dispatcher.handle(&MethodCall::new("sendLocationUpdate", json!({ "lat": "north", "lng": 1.0 }))),
            Err(DispatchError::InvalidArgument { name, .. }) if name == "lat"
        ));
        assert!(matches!(
            dispatcher.handle(&MethodCall::new("inAppUpdateConsent", json!("yes"))),
            Err(DispatchError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn unknown_method() {
        let bridge = Bridge::default();
        let (_, dispatcher) = dispatcher(&bridge);
        assert!(matches!(
            dispatcher.handle(&MethodCall::new("launchRockets", Value::Null)),
            Err(DispatchError::NotImplemented(method)) if method == "launchRockets"
        ));
    }
}
