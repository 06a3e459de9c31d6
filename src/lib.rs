//! ATF packet filter: classification engine and C ABI.
//!
//! A `ControlChannel` owns the filter policy and the callout registry and
//! serializes every administrative command; its `ClassifyEngine` is the
//! lock-free packet-path entry point. The `extern "C"` functions below wrap
//! one channel per opaque `AtfChannel` handle for hosts that drive the filter
//! over FFI.

pub mod config;
pub mod control;
pub mod error;
pub mod filter;
pub mod policy;

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::ptr;
use std::slice;

use config::ChannelOptions;
use control::ControlChannel;
use error::{
    clear_error, last_error_code, set_filter_error, take_last_error, FilterError,
    ERROR_BAD_PARAMETERS, SUCCESS,
};
use filter::host::{RegisterCallback, UnregisterCallback};
use filter::layers::{AddressFamily, DirectionSource};
use filter::{FieldValue, HostPlatform, IncomingValues, LayerKind};
use policy::PolicySettings;

pub use control::{Command, CommandCode, LifecycleState};
pub use error::PlatformError;
pub use filter::{CalloutPlatform, ClassifyEngine};
pub use policy::{Action, Direction, FilterPolicy, Verdict};

// ── Handle ──────────────────────────────────────────────────────────────────

/// Opaque handle returned by `atf_channel_create`.
pub struct AtfChannel {
    channel: ControlChannel<HostPlatform>,
}

/// Largest fixed-field index used by any IPv4 layer, plus one.
const MAX_FIELDS: usize = 16;

/// Run `body` against the channel behind `handle`.
/// Returns `ERROR_BAD_PARAMETERS` (and sets the last-error) on a null handle.
unsafe fn with_channel<F, R>(handle: *const AtfChannel, body: F) -> R
where
    F: FnOnce(&ControlChannel<HostPlatform>) -> R,
    R: From<i32>,
{
    match handle.as_ref() {
        Some(h) => body(&h.channel),
        None => {
            set_filter_error(&FilterError::BadParameters("channel handle is null".into()));
            R::from(ERROR_BAD_PARAMETERS)
        }
    }
}

/// Collapse a command result into a status code, recording any error.
fn status(result: Result<(), FilterError>) -> i32 {
    match result {
        Ok(()) => SUCCESS,
        Err(e) => {
            set_filter_error(&e);
            e.code()
        }
    }
}

/// Allocate a C string on the heap.  Caller frees via `atf_free_string`.
fn to_c_string(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn to_json_c_string<T: serde::Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => to_c_string(&json),
        Err(e) => {
            set_filter_error(&FilterError::BadParameters(format!(
                "JSON serialization failed: {}",
                e
            )));
            ptr::null_mut()
        }
    }
}

/// Read a `*const c_char` into a `&str`, returning `None` on null or invalid UTF-8.
unsafe fn from_c_str<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        return None;
    }
    CStr::from_ptr(p).to_str().ok()
}

/// View a caller buffer. A null pointer is only accepted with a zero length.
unsafe fn from_raw_buf<'a>(buf: *const u8, len: usize) -> Result<&'a [u8], FilterError> {
    if buf.is_null() {
        if len == 0 {
            return Ok(&[]);
        }
        return Err(FilterError::BadParameters("buffer is null".into()));
    }
    Ok(slice::from_raw_parts(buf, len))
}

// ═══════════════════════════════════════════════════════════════════════════
//  Core
// ═══════════════════════════════════════════════════════════════════════════

/// Create a control channel.
///
/// `options_json` may be null for defaults; see `ChannelOptions` for its
/// shape. Both callbacks are required: the channel calls them to register
/// and unregister one callout per enabled layer. Layer codes are
/// 0 inbound transport v4, 1 outbound transport v4, 2 inbound transport v6,
/// 3 outbound transport v6, 4 datagram v4, 5 inbound ICMP error v4.
///
/// Returns null on error.
#[no_mangle]
pub unsafe extern "C" fn atf_channel_create(
    options_json: *const c_char,
    register_cb: RegisterCallback,
    unregister_cb: UnregisterCallback,
    ctx: *mut c_void,
) -> *mut AtfChannel {
    clear_error();

    // Initialise logger (ignore errors if already set)
    let _ = env_logger::try_init();

    let created = ChannelOptions::from_json(from_c_str(options_json)).and_then(|options| {
        let platform = HostPlatform::new(register_cb, unregister_cb, ctx)?;
        ControlChannel::new(platform, options)
    });

    match created {
        Ok(channel) => {
            log::info!("ATF filter v{} channel created", env!("CARGO_PKG_VERSION"));
            Box::into_raw(Box::new(AtfChannel { channel }))
        }
        Err(e) => {
            set_filter_error(&e);
            ptr::null_mut()
        }
    }
}

/// Destroy a channel, stopping it first if it is running.
#[no_mangle]
pub unsafe extern "C" fn atf_channel_destroy(handle: *mut AtfChannel) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
        log::info!("ATF filter channel destroyed");
    }
}

/// Return the library version string.  Caller must free with `atf_free_string`.
#[no_mangle]
pub extern "C" fn atf_version() -> *mut c_char {
    to_c_string(env!("CARGO_PKG_VERSION"))
}

/// Free a string previously returned by this library.
#[no_mangle]
pub unsafe extern "C" fn atf_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Commands
// ═══════════════════════════════════════════════════════════════════════════

/// Run one command by control code with its input buffer.
/// Returns 0 on success, negative on error.
#[no_mangle]
pub unsafe extern "C" fn atf_dispatch(
    handle: *const AtfChannel,
    code: u32,
    buf: *const u8,
    len: usize,
) -> i32 {
    clear_error();
    with_channel(handle, |channel| {
        status(from_raw_buf(buf, len).and_then(|input| channel.dispatch(code, input)))
    })
}

/// Load a wire-format config buffer.  Returns 0 on success.
#[no_mangle]
pub unsafe extern "C" fn atf_load_config(handle: *const AtfChannel, buf: *const u8, len: usize) -> i32 {
    clear_error();
    with_channel(handle, |channel| {
        status(from_raw_buf(buf, len).and_then(|input| channel.load_config(input)))
    })
}

/// Load a config described as JSON (see `PolicySettings`).  Returns 0 on success.
#[no_mangle]
pub unsafe extern "C" fn atf_load_config_json(
    handle: *const AtfChannel,
    settings_json: *const c_char,
) -> i32 {
    clear_error();

    let json = match from_c_str(settings_json) {
        Some(s) => s,
        None => {
            let e = FilterError::BadParameters("settings_json is null or invalid".into());
            set_filter_error(&e);
            return e.code();
        }
    };

    with_channel(handle, |channel| {
        status(
            PolicySettings::from_json(json)
                .and_then(|settings| settings.to_wire())
                .and_then(|buf| channel.load_config(&buf)),
        )
    })
}

/// Append raw network-order IPv4 addresses to the blocklist.
/// Returns the number of addresses appended, negative on error.
#[no_mangle]
pub unsafe extern "C" fn atf_append_blacklist(
    handle: *const AtfChannel,
    buf: *const u8,
    len: usize,
) -> i32 {
    clear_error();
    with_channel(handle, |channel| {
        match from_raw_buf(buf, len).and_then(|raw| channel.append_blacklist(raw)) {
            // bounded by ChannelOptions::validate
            Ok(added) => i32::try_from(added).unwrap_or(i32::MAX),
            Err(e) => {
                set_filter_error(&e);
                e.code()
            }
        }
    })
}

/// Start interception.  Returns 0 on success.
#[no_mangle]
pub unsafe extern "C" fn atf_start(handle: *const AtfChannel) -> i32 {
    clear_error();
    with_channel(handle, |channel| status(channel.start()))
}

/// Stop interception, keeping the loaded config.  Returns 0 on success.
#[no_mangle]
pub unsafe extern "C" fn atf_stop(handle: *const AtfChannel) -> i32 {
    clear_error();
    with_channel(handle, |channel| status(channel.stop()))
}

/// Discard the loaded config.  Returns 0 on success.
#[no_mangle]
pub unsafe extern "C" fn atf_flush(handle: *const AtfChannel) -> i32 {
    clear_error();
    with_channel(handle, |channel| status(channel.flush()))
}

// ═══════════════════════════════════════════════════════════════════════════
//  State
// ═══════════════════════════════════════════════════════════════════════════

/// Get the lifecycle state as an integer code.
///
/// | Code | State         |
/// |------|---------------|
/// |  0   | Uninitialized |
/// |  1   | Configured    |
/// |  2   | Running       |
/// | -1   | null handle   |
#[no_mangle]
pub unsafe extern "C" fn atf_get_state(handle: *const AtfChannel) -> i32 {
    with_channel(handle, |channel| channel.state().as_code())
}

/// Get the loaded policy as JSON.  Returns null if no config is loaded.
/// Caller must free the returned string.
///
/// JSON shape: `{"state":"Configured","settings":{...},"trie":{"nodes":4,"bytes":16384,"addresses":2}}`
#[no_mangle]
pub unsafe extern "C" fn atf_get_policy_json(handle: *const AtfChannel) -> *mut c_char {
    clear_error();

    let channel = match handle.as_ref() {
        Some(h) => &h.channel,
        None => {
            set_filter_error(&FilterError::BadParameters("channel handle is null".into()));
            return ptr::null_mut();
        }
    };

    match channel.policy() {
        Some(policy) => to_json_c_string(&serde_json::json!({
            "state": channel.state().status_text(),
            "settings": policy.settings(),
            "trie": policy.trie_stats(),
        })),
        None => {
            set_filter_error(&FilterError::NotConfigured);
            ptr::null_mut()
        }
    }
}

/// Get packet-path counters as JSON.  Caller must free the returned string.
///
/// JSON shape:
/// `{"packets_classified":10,"packets_passed":8,"packets_blocked":1,"packets_alerted":1,"bad_data":0,"alerts_dropped":0}`
#[no_mangle]
pub unsafe extern "C" fn atf_get_stats_json(handle: *const AtfChannel) -> *mut c_char {
    clear_error();

    match handle.as_ref() {
        Some(h) => to_json_c_string(&h.channel.engine().stats()),
        None => {
            set_filter_error(&FilterError::BadParameters("channel handle is null".into()));
            ptr::null_mut()
        }
    }
}

/// Pop the oldest pending alert as JSON.  Returns null when none is queued.
/// Caller must free the returned string.
#[no_mangle]
pub unsafe extern "C" fn atf_poll_alert_json(handle: *const AtfChannel) -> *mut c_char {
    match handle.as_ref().and_then(|h| h.channel.engine().try_recv_alert()) {
        Some(alert) => to_json_c_string(&alert),
        None => ptr::null_mut(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Packet path
// ═══════════════════════════════════════════════════════════════════════════

/// Classify one IPv4 packet on `layer_code`.
///
/// Addresses are in network byte order. `direction` (0 outbound, 1 inbound)
/// is only read by the datagram layer; the others have a fixed direction.
/// Returns the verdict (0 pass, 1 block, 2 alert), or a negative error for a
/// null handle or a layer that is not IPv4. Never blocks.
#[no_mangle]
pub unsafe extern "C" fn atf_classify_v4(
    handle: *const AtfChannel,
    layer_code: u32,
    protocol: u8,
    local_addr: u32,
    remote_addr: u32,
    local_port: u16,
    remote_port: u16,
    direction: u32,
) -> i32 {
    let layer = match LayerKind::from_code(layer_code) {
        Some(layer) if layer.descriptor().family == AddressFamily::V4 => layer,
        _ => return ERROR_BAD_PARAMETERS,
    };
    let descriptor = layer.descriptor();
    let layout = &descriptor.fields;

    let mut values = [FieldValue::Empty; MAX_FIELDS];
    values[layout.protocol] = FieldValue::Uint8(protocol);
    values[layout.local_address] = FieldValue::Uint32(u32::from_be(local_addr));
    values[layout.remote_address] = FieldValue::Uint32(u32::from_be(remote_addr));
    if let Some(i) = layout.local_port {
        values[i] = FieldValue::Uint16(local_port);
    }
    if let Some(i) = layout.remote_port {
        values[i] = FieldValue::Uint16(remote_port);
    }
    if let DirectionSource::Field(i) = descriptor.direction {
        values[i] = FieldValue::Uint32(direction);
    }

    match handle.as_ref() {
        Some(h) => h
            .channel
            .engine()
            .classify(layer, &IncomingValues::new(&values))
            .as_code(),
        None => ERROR_BAD_PARAMETERS,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Error
// ═══════════════════════════════════════════════════════════════════════════

/// Get the last error message.  Returns null if no error.
/// Caller must free the returned string.
#[no_mangle]
pub extern "C" fn atf_get_last_error() -> *mut c_char {
    match take_last_error() {
        Some(msg) => to_c_string(&msg),
        None => ptr::null_mut(),
    }
}

/// Get the last error code.  Returns 0 (`SUCCESS`) if no error.
#[no_mangle]
pub extern "C" fn atf_get_last_error_code() -> i32 {
    last_error_code()
}

/// Clear the stored error state.
#[no_mangle]
pub extern "C" fn atf_clear_error() {
    clear_error();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicU32, Ordering};

    use error::{ERROR_ALREADY_RUNNING, ERROR_CORRUPT_CONFIG, ERROR_NOT_CONFIGURED};

    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    unsafe extern "C" fn register_cb(
        layer: u32,
        ctx: *mut c_void,
        out_callout: *mut u32,
        out_filter: *mut u64,
    ) -> i32 {
        let live = &*(ctx as *const AtomicU32);
        live.fetch_add(1, Ordering::SeqCst);
        *out_callout = layer + 1;
        *out_filter = (layer + 1) as u64;
        0
    }

    unsafe extern "C" fn unregister_cb(_layer: u32, _callout: u32, _filter: u64, ctx: *mut c_void) -> i32 {
        let live = &*(ctx as *const AtomicU32);
        live.fetch_sub(1, Ordering::SeqCst);
        0
    }

    fn network_order(addr: Ipv4Addr) -> u32 {
        u32::from_ne_bytes(addr.octets())
    }

    unsafe fn take_string(ptr: *mut c_char) -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        let s = CStr::from_ptr(ptr).to_string_lossy().into_owned();
        atf_free_string(ptr);
        Some(s)
    }

    #[test]
    fn test_channel_round_trip_over_c_abi() {
        let _guard = TEST_LOCK.lock().unwrap();
        let live = AtomicU32::new(0);
        let ctx = &live as *const AtomicU32 as *mut c_void;

        unsafe {
            let handle = atf_channel_create(ptr::null(), Some(register_cb), Some(unregister_cb), ctx);
            assert!(!handle.is_null());
            assert_eq!(atf_get_state(handle), 0);
            assert_eq!(atf_start(handle), ERROR_NOT_CONFIGURED);
            assert_eq!(atf_get_last_error_code(), ERROR_NOT_CONFIGURED);

            let settings = CString::new(
                r#"{"layers":["outbound_transport_v4","datagram_data_v4"],
                    "alert_outbound":true,"ipv4_action":"BLOCK",
                    "ipv4_blocklist":["203.0.113.5"]}"#,
            )
            .unwrap();
            assert_eq!(atf_load_config_json(handle, settings.as_ptr()), SUCCESS);
            let extra = [198u8, 51, 100, 7];
            assert_eq!(atf_append_blacklist(handle, extra.as_ptr(), extra.len()), 1);

            assert_eq!(atf_start(handle), SUCCESS);
            assert_eq!(atf_get_state(handle), 2);
            assert_eq!(live.load(Ordering::SeqCst), 2);
            assert_eq!(atf_flush(handle), ERROR_ALREADY_RUNNING);

            let local = network_order(Ipv4Addr::new(10, 0, 0, 1));
            let blocked = network_order(Ipv4Addr::new(203, 0, 113, 5));
            let appended = network_order(Ipv4Addr::new(198, 51, 100, 7));
            let clean = network_order(Ipv4Addr::new(1, 1, 1, 1));

            assert_eq!(atf_classify_v4(handle, 1, 6, local, blocked, 50000, 443, 0), 1);
            assert_eq!(atf_classify_v4(handle, 1, 6, local, clean, 50000, 443, 0), 0);
            assert_eq!(atf_classify_v4(handle, 4, 17, local, appended, 5353, 53, 0), 1);
            // inbound alerts are off
            assert_eq!(atf_classify_v4(handle, 4, 17, local, appended, 5353, 53, 1), 0);
            assert_eq!(atf_classify_v4(handle, 2, 6, local, blocked, 1, 2, 0), ERROR_BAD_PARAMETERS);

            let alert = take_string(atf_poll_alert_json(handle)).unwrap();
            assert!(alert.contains("\"matched\":\"203.0.113.5\""), "{}", alert);
            assert!(take_string(atf_poll_alert_json(handle)).is_some());
            assert!(take_string(atf_poll_alert_json(handle)).is_none());

            let stats = take_string(atf_get_stats_json(handle)).unwrap();
            assert!(stats.contains("\"packets_blocked\":2"), "{}", stats);

            let policy = take_string(atf_get_policy_json(handle)).unwrap();
            assert!(policy.contains("\"addresses\":2"), "{}", policy);

            assert_eq!(atf_stop(handle), SUCCESS);
            assert_eq!(live.load(Ordering::SeqCst), 0);

            assert_eq!(
                atf_dispatch(handle, CommandCode::Flush.code(), ptr::null(), 0),
                SUCCESS
            );
            assert_eq!(atf_get_state(handle), 0);

            atf_channel_destroy(handle);
        }
    }

    #[test]
    fn test_destroy_stops_running_channel() {
        let _guard = TEST_LOCK.lock().unwrap();
        let live = AtomicU32::new(0);
        let ctx = &live as *const AtomicU32 as *mut c_void;

        unsafe {
            let handle = atf_channel_create(ptr::null(), Some(register_cb), Some(unregister_cb), ctx);
            let settings = CString::new(r#"{"layers":["inbound_transport_v4"]}"#).unwrap();
            assert_eq!(atf_load_config_json(handle, settings.as_ptr()), SUCCESS);
            assert_eq!(atf_start(handle), SUCCESS);
            assert_eq!(live.load(Ordering::SeqCst), 1);

            atf_channel_destroy(handle);
            assert_eq!(live.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn test_errors_are_reported_through_last_error() {
        let _guard = TEST_LOCK.lock().unwrap();

        unsafe {
            assert_eq!(atf_start(ptr::null()), ERROR_BAD_PARAMETERS);
            assert_eq!(atf_get_last_error_code(), ERROR_BAD_PARAMETERS);
            assert!(take_string(atf_get_last_error()).is_some());
            assert!(take_string(atf_get_last_error()).is_none());

            let bad_options = CString::new(r#"{"alert_queue_capacity":0}"#).unwrap();
            let handle = atf_channel_create(
                bad_options.as_ptr(),
                Some(register_cb),
                Some(unregister_cb),
                ptr::null_mut(),
            );
            assert!(handle.is_null());
            assert_eq!(atf_get_last_error_code(), ERROR_BAD_PARAMETERS);

            let handle = atf_channel_create(ptr::null(), None, None, ptr::null_mut());
            assert!(handle.is_null());

            let handle = atf_channel_create(
                ptr::null(),
                Some(register_cb),
                Some(unregister_cb),
                ptr::null_mut(),
            );
            let garbage = [0u8; 32];
            assert_eq!(
                atf_load_config(handle, garbage.as_ptr(), garbage.len()),
                ERROR_CORRUPT_CONFIG
            );
            assert_eq!(
                atf_load_config(handle, ptr::null(), 4),
                ERROR_BAD_PARAMETERS
            );
            atf_clear_error();
            assert_eq!(atf_get_last_error_code(), SUCCESS);
            atf_channel_destroy(handle);
        }
    }

    #[test]
    fn test_version_is_exposed() {
        unsafe {
            assert_eq!(
                take_string(atf_version()).as_deref(),
                Some(env!("CARGO_PKG_VERSION"))
            );
        }
    }
}
