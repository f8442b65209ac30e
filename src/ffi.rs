//! C ABI used by the native host shell
//!
//! The host owns an explicit [`BridgeHandle`] from `bridge_create` until
//! `bridge_destroy`; nothing here is looked up through global state. Native
//! callbacks hand their payloads over as UTF-8 JSON strings. Functions that
//! can fail return 0 on success and 1 on error, in which case
//! `bridge_last_error` describes the failure.

#![allow(unsafe_code)]

use std::{
    ffi::{CStr, CString, c_char, c_void},
    num::NonZeroUsize,
    sync::{Mutex, PoisonError},
};

use log::{debug, error};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    channel::{AttachmentId, EventConsumer, QueueingChannel, SendOutcome},
    emitter::{DeferredEmitter, NativeDeepLinkResolution, PushMessage},
    envelope::{EventEnvelope, event_types},
    error::{BridgeError, Result},
    lifecycle::Bridge,
};

/// Callback the host registers to receive serialized envelopes
///
/// `json` is only valid for the duration of the call. The callback runs while
/// the stream it is registered on is locked. From inside it, producer calls
/// (`bridge_push_opened` and friends) and the matching `bridge_cancel_*` are
/// safe: sends are delivered once the callback returns and a cancel takes
/// effect then too. Calling `bridge_listen_*` from inside it fails with
/// status 1. Other threads calling into the same stream block until the
/// callback returns, so the callback must not wait on them.
pub type HostEventCallback = unsafe extern "C" fn(json: *const c_char, user_data: *mut c_void);

/// Bridge state owned by the host
pub struct BridgeHandle {
    bridge: Bridge,
    emitter: DeferredEmitter,
    last_error: Mutex<Option<String>>,
}

impl BridgeHandle {
    fn new(bridge: Bridge) -> Self {
        let emitter = bridge.emitter();
        Self {
            bridge,
            emitter,
            last_error: Mutex::new(None),
        }
    }

    /// The bridge behind this handle
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub(crate) fn store_error(&self, message: String) {
        error!("{}", message);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    pub(crate) fn take_last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn status(&self, result: Result<()>) -> u8 {
        match result {
            Ok(()) => 0,
            Err(err) => {
                self.store_error(err.to_string());
                1
            }
        }
    }
}

struct HostCallback {
    callback: HostEventCallback,
    user_data: *mut c_void,
}

// SAFETY: the host promises that `callback` and `user_data` may be used from
// any thread until the matching cancel call returns.
unsafe impl Send for HostCallback {}
unsafe impl Sync for HostCallback {}

impl EventConsumer for HostCallback {
    fn deliver(&self, envelope: EventEnvelope) {
        match CString::new(envelope.to_json().to_string()) {
            Ok(json) => unsafe { (self.callback)(json.as_ptr(), self.user_data) },
            Err(err) => error!("Envelope `{}` is not C-safe: {}", envelope.event_type(), err),
        }
    }
}

/// Borrow a handle passed in by the host
///
/// # Safety
/// `handle` must be null or a live pointer returned by `bridge_create`.
unsafe fn handle_ref<'a>(handle: *const BridgeHandle) -> Option<&'a BridgeHandle> {
    unsafe { handle.as_ref() }
}

/// Stores `err` on the handle, if there is one, and returns the failure status
///
/// # Safety
/// `handle` must be null or a live pointer returned by `bridge_create`.
pub(crate) unsafe fn record_error(handle: *const BridgeHandle, err: BridgeError) -> u8 {
    match unsafe { handle_ref(handle) } {
        Some(handle) => handle.status(Err(err)),
        None => {
            error!("{}", err);
            1
        }
    }
}

/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn read_str<'a>(ptr: *const c_char, what: &'static str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(BridgeError::NullPointer(what));
    }
    Ok(unsafe { CStr::from_ptr(ptr) }.to_str()?)
}

/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn read_json<T: DeserializeOwned>(ptr: *const c_char, event_type: &str) -> Result<T> {
    let json = unsafe { read_str(ptr, "payload") }?;
    serde_json::from_str(json).map_err(|err| BridgeError::malformed(event_type, err))
}

fn attached(handle: &BridgeHandle, id: AttachmentId, stream: &str) -> u8 {
    if id == AttachmentId::REFUSED {
        handle.store_error(format!(
            "cannot attach to the {stream} stream from inside its own callback"
        ));
        return 1;
    }
    0
}

fn routed(event_type: &str, outcome: Option<SendOutcome>) -> Result<()> {
    match outcome {
        Some(outcome) => {
            debug!("`{}` {:?}", event_type, outcome);
            Ok(())
        }
        None => Err(BridgeError::malformed(event_type, "event could not be built")),
    }
}

/// Start a bridge. `backlog_capacity` of 0 leaves the backlog unbounded.
#[unsafe(no_mangle)]
pub extern "C" fn bridge_create(backlog_capacity: usize) -> *mut BridgeHandle {
    let events = match NonZeroUsize::new(backlog_capacity) {
        Some(capacity) => QueueingChannel::with_capacity(capacity),
        None => QueueingChannel::new(),
    };
    Box::into_raw(Box::new(BridgeHandle::new(Bridge::start(events))))
}

/// Shut down and free a bridge
///
/// # Safety
/// `handle` must be null or a pointer returned by `bridge_create` that has
/// not been destroyed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bridge_destroy(handle: *mut BridgeHandle) {
    if !handle.is_null() {
        unsafe {
            let _ = Box::from_raw(handle);
        }
    }
}

/// Attach a host callback to the main event stream, flushing the backlog
///
/// The backlog is flushed to `callback` before this returns. Must not be
/// called from inside a [`HostEventCallback`]; it fails with status 1 there.
///
/// # Safety
/// `handle` must be a live bridge handle; see [`HostEventCallback`] for the
/// callback contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bridge_listen_events(
    handle: *const BridgeHandle,
    callback: HostEventCallback,
    user_data: *mut c_void,
) -> u8 {
    let Some(handle) = (unsafe { handle_ref(handle) }) else {
        return unsafe { record_error(handle, BridgeError::NullPointer("bridge handle")) };
    };
    let id = handle.bridge.listen_events(HostCallback {
        callback,
        user_data,
    });
    attached(handle, id, "events")
}

/// Detach the main event stream's consumer
///
/// Safe to call from inside the callback being detached.
///
/// # Safety
/// `handle` must be null or a live bridge handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bridge_cancel_events(handle: *const BridgeHandle) {
    if let Some(handle) = unsafe { handle_ref(handle) } {
        handle.bridge.cancel_events();
    }
}

/// Attach a host callback to the in-app update stream
///
/// Must not be called from inside a [`HostEventCallback`]; it fails with
/// status 1 there.
///
/// # Safety
/// Same contract as [`bridge_listen_events`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bridge_listen_in_app(
    handle: *const BridgeHandle,
    callback: HostEventCallback,
    user_data: *mut c_void,
) -> u8 {
    let Some(handle) = (unsafe { handle_ref(handle) }) else {
        return unsafe { record_error(handle, BridgeError::NullPointer("bridge handle")) };
    };
    let id = handle.bridge.listen_in_app(HostCallback {
        callback,
        user_data,
    });
    attached(handle, id, "in-app")
}

/// Detach the in-app update stream's consumer
///
/// Safe to call from inside the callback being detached.
///
/// # Safety
/// `handle` must be null or a live bridge handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bridge_cancel_in_app(handle: *const BridgeHandle) {
    if let Some(handle) = unsafe { handle_ref(handle) } {
        handle.bridge.cancel_in_app();
    }
}

/// A push arrived in the foreground. `push_json` is a push message object.
///
/// # Safety
/// `handle` must be a live bridge handle and `push_json` a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bridge_push_received(
    handle: *const BridgeHandle,
    push_json: *const c_char,
) -> u8 {
    let Some(handle) = (unsafe { handle_ref(handle) }) else {
        return unsafe { record_error(handle, BridgeError::NullPointer("bridge handle")) };
    };
    let result = unsafe { read_json::<PushMessage>(push_json, event_types::PUSH_RECEIVED) }
        .and_then(|push| {
            routed(
                event_types::PUSH_RECEIVED,
                handle.emitter.push_received(&push),
            )
        });
    handle.status(result)
}

/// The user opened a push. `action_id` may be null.
///
/// # Safety
/// `handle` must be a live bridge handle; `push_json` and a non-null
/// `action_id` must be NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bridge_push_opened(
    handle: *const BridgeHandle,
    push_json: *const c_char,
    action_id: *const c_char,
) -> u8 {
    let Some(handle) = (unsafe { handle_ref(handle) }) else {
        return unsafe { record_error(handle, BridgeError::NullPointer("bridge handle")) };
    };
    let result = (|| -> Result<()> {
        let push: PushMessage = unsafe { read_json(push_json, event_types::PUSH_OPENED) }?;
        let action_id = if action_id.is_null() {
            None
        } else {
            Some(unsafe { read_str(action_id, "action id") }?)
        };
        routed(
            event_types::PUSH_OPENED,
            handle.emitter.push_opened(&push, action_id),
        )
    })();
    handle.status(result)
}

/// A deferred deep link resolved. `resolution_json` is `{ url, resolution, link }`.
///
/// # Safety
/// `handle` must be a live bridge handle and `resolution_json` a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bridge_deep_link_resolved(
    handle: *const BridgeHandle,
    resolution_json: *const c_char,
) -> u8 {
    let Some(handle) = (unsafe { handle_ref(handle) }) else {
        return unsafe { record_error(handle, BridgeError::NullPointer("bridge handle")) };
    };
    let result = unsafe {
        read_json::<NativeDeepLinkResolution>(resolution_json, event_types::DEEP_LINK_RESOLVED)
    }
    .and_then(|native| {
        routed(
            event_types::DEEP_LINK_RESOLVED,
            handle.emitter.native_deep_link_resolved(&native),
        )
    });
    handle.status(result)
}

/// A deep link button was pressed in an in-app message
///
/// # Safety
/// `handle` must be a live bridge handle and `data_json` a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bridge_in_app_deep_link_pressed(
    handle: *const BridgeHandle,
    data_json: *const c_char,
) -> u8 {
    let Some(handle) = (unsafe { handle_ref(handle) }) else {
        return unsafe { record_error(handle, BridgeError::NullPointer("bridge handle")) };
    };
    let result = unsafe { read_json::<Value>(data_json, event_types::IN_APP_DEEP_LINK_PRESSED) }
        .and_then(|data| {
            routed(
                event_types::IN_APP_DEEP_LINK_PRESSED,
                handle.emitter.in_app_deep_link_pressed(data),
            )
        });
    handle.status(result)
}

/// The in-app inbox changed
///
/// # Safety
/// `handle` must be null or a live bridge handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bridge_inbox_updated(handle: *const BridgeHandle) {
    if let Some(handle) = unsafe { handle_ref(handle) } {
        handle.emitter.inbox_updated();
    }
}

/// Get the last error message (if any) and clear it
///
/// Returns a string the caller must free with `bridge_free_string`, or null.
///
/// # Safety
/// `handle` must be null or a live bridge handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bridge_last_error(handle: *const BridgeHandle) -> *mut c_char {
    let Some(handle) = (unsafe { handle_ref(handle) }) else {
        return std::ptr::null_mut();
    };
    handle
        .take_last_error()
        .and_then(|message| CString::new(message).ok())
        .map_or(std::ptr::null_mut(), CString::into_raw)
}

/// Free a string returned by `bridge_last_error`
///
/// # Safety
/// `string` must be null or a pointer returned by `bridge_last_error`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bridge_free_string(string: *mut c_char) {
    if !string.is_null() {
        unsafe {
            let _ = CString::from_raw(string);
        }
    }
}
