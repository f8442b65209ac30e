//! Android JNI entry points forwarding native SDK callbacks into the bridge
//!
//! Java/Kotlin keeps the bridge handle as a `long` and passes payloads as
//! JSON strings; every call is forwarded to the C ABI in [`crate::ffi`].
//! Wrappers returning `1` leave a message for `nativeLastError`.

#![allow(unsafe_code)]

use std::ffi::CString;

use jni::{
    JNIEnv,
    objects::{JClass, JObject, JString},
    sys::{jint, jlong},
};
use log::{debug, error};

use crate::{
    error::{BridgeError, Result},
    ffi::{self, BridgeHandle},
};

fn java_string(env: &mut JNIEnv, value: &JString, what: &'static str) -> Result<CString> {
    if value.is_null() {
        return Err(BridgeError::NullPointer(what));
    }
    let value: String = env
        .get_string(value)
        .map_err(|err| BridgeError::host_string(what, err))?
        .into();
    CString::new(value).map_err(|err| BridgeError::host_string(what, err))
}

fn optional_java_string(
    env: &mut JNIEnv,
    value: &JString,
    what: &'static str,
) -> Result<Option<CString>> {
    if value.is_null() {
        return Ok(None);
    }
    java_string(env, value, what).map(Some)
}

fn as_handle(handle: jlong) -> *const BridgeHandle {
    handle as *const BridgeHandle
}

fn failed(handle: jlong, err: BridgeError) -> jint {
    unsafe { ffi::record_error(as_handle(handle), err) as jint }
}

#[unsafe(no_mangle)]
pub extern "C" fn Java_com_example_bevyembedded_BridgeNative_nativeCreate(
    _env: JNIEnv,
    _class: JClass,
    backlog_capacity: jint,
) -> jlong {
    let handle = ffi::bridge_create(backlog_capacity.max(0) as usize);
    debug!("Bridge created: {:p}", handle);
    handle as jlong
}

#[unsafe(no_mangle)]
pub extern "C" fn Java_com_example_bevyembedded_BridgeNative_nativeDestroy(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if handle == 0 {
        return;
    }
    debug!("Destroying bridge");
    unsafe { ffi::bridge_destroy(handle as *mut BridgeHandle) }
}

#[unsafe(no_mangle)]
pub extern "C" fn Java_com_example_bevyembedded_BridgeNative_nativePushReceived(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    push_json: JString,
) -> jint {
    let push_json = match java_string(&mut env, &push_json, "push payload") {
        Ok(push_json) => push_json,
        Err(err) => return failed(handle, err),
    };
    unsafe { ffi::bridge_push_received(as_handle(handle), push_json.as_ptr()) as jint }
}

#[unsafe(no_mangle)]
pub extern "C" fn Java_com_example_bevyembedded_BridgeNative_nativePushOpened(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    push_json: JString,
    action_id: JString,
) -> jint {
    let push_json = match java_string(&mut env, &push_json, "push payload") {
        Ok(push_json) => push_json,
        Err(err) => return failed(handle, err),
    };
    let action_id = match optional_java_string(&mut env, &action_id, "action id") {
        Ok(action_id) => action_id,
        Err(err) => return failed(handle, err),
    };
    let action_ptr = action_id
        .as_ref()
        .map_or(std::ptr::null(), |id| id.as_ptr());
    unsafe { ffi::bridge_push_opened(as_handle(handle), push_json.as_ptr(), action_ptr) as jint }
}

#[unsafe(no_mangle)]
pub extern "C" fn Java_com_example_bevyembedded_BridgeNative_nativeDeepLinkResolved(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    resolution_json: JString,
) -> jint {
    let resolution_json = match java_string(&mut env, &resolution_json, "deep link payload") {
        Ok(resolution_json) => resolution_json,
        Err(err) => return failed(handle, err),
    };
    unsafe { ffi::bridge_deep_link_resolved(as_handle(handle), resolution_json.as_ptr()) as jint }
}

#[unsafe(no_mangle)]
pub extern "C" fn Java_com_example_bevyembedded_BridgeNative_nativeInAppDeepLinkPressed(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    data_json: JString,
) -> jint {
    let data_json = match java_string(&mut env, &data_json, "in-app payload") {
        Ok(data_json) => data_json,
        Err(err) => return failed(handle, err),
    };
    unsafe { ffi::bridge_in_app_deep_link_pressed(as_handle(handle), data_json.as_ptr()) as jint }
}

#[unsafe(no_mangle)]
pub extern "C" fn Java_com_example_bevyembedded_BridgeNative_nativeInboxUpdated(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    unsafe { ffi::bridge_inbox_updated(as_handle(handle)) }
}

/// Returns and clears the handle's last error, or null when there is none
#[unsafe(no_mangle)]
pub extern "C" fn Java_com_example_bevyembedded_BridgeNative_nativeLastError<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass,
    handle: jlong,
) -> JObject<'local> {
    let Some(handle) = (unsafe { as_handle(handle).as_ref() }) else {
        return JObject::null();
    };
    let Some(message) = handle.take_last_error() else {
        return JObject::null();
    };
    match env.new_string(message) {
        Ok(message) => message.into(),
        Err(err) => {
            error!("Failed to build Java error string: {:?}", err);
            JObject::null()
        }
    }
}
