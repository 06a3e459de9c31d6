//! `CalloutPlatform` backed by C function pointers supplied by the host.

use std::os::raw::c_void;

use super::callout::{CalloutIds, CalloutPlatform};
use super::layers::{CalloutDescriptor, LayerKind};
use crate::error::{FilterError, PlatformError};

// ── Callback type aliases ───────────────────────────────────────────────────

/// `fn(layer_code: u32, user_context: *mut c_void, out_callout_id: *mut u32, out_filter_id: *mut u64) -> i32`
///
/// Returns 0 on success and fills both out-parameters.
pub type RegisterCallback = Option<unsafe extern "C" fn(u32, *mut c_void, *mut u32, *mut u64) -> i32>;

/// `fn(layer_code: u32, callout_id: u32, filter_id: u64, user_context: *mut c_void) -> i32`
pub type UnregisterCallback = Option<unsafe extern "C" fn(u32, u32, u64, *mut c_void) -> i32>;

// ── Send wrapper for the user context ───────────────────────────────────────

/// The caller is responsible for thread-safety of the pointed-to data.
#[derive(Clone, Copy)]
struct SendPtr(*mut c_void);
unsafe impl Send for SendPtr {}

// ── Platform ────────────────────────────────────────────────────────────────

pub struct HostPlatform {
    register_cb: unsafe extern "C" fn(u32, *mut c_void, *mut u32, *mut u64) -> i32,
    unregister_cb: unsafe extern "C" fn(u32, u32, u64, *mut c_void) -> i32,
    ctx: SendPtr,
}

impl HostPlatform {
    pub fn new(
        register_cb: RegisterCallback,
        unregister_cb: UnregisterCallback,
        ctx: *mut c_void,
    ) -> Result<Self, FilterError> {
        match (register_cb, unregister_cb) {
            (Some(register_cb), Some(unregister_cb)) => Ok(Self {
                register_cb,
                unregister_cb,
                ctx: SendPtr(ctx),
            }),
            _ => Err(FilterError::BadParameters(
                "register and unregister callbacks are required".into(),
            )),
        }
    }
}

impl CalloutPlatform for HostPlatform {
    fn register(&mut self, callout: &'static CalloutDescriptor) -> Result<CalloutIds, PlatformError> {
        let mut callout_id = 0u32;
        let mut filter_id = 0u64;
        let status = unsafe {
            (self.register_cb)(
                callout.layer.index() as u32,
                self.ctx.0,
                &mut callout_id,
                &mut filter_id,
            )
        };
        if status != 0 {
            return Err(PlatformError { status });
        }
        Ok(CalloutIds {
            callout_id,
            filter_id,
        })
    }

    fn unregister(&mut self, layer: LayerKind, ids: CalloutIds) -> Result<(), PlatformError> {
        let status = unsafe {
            (self.unregister_cb)(layer.index() as u32, ids.callout_id, ids.filter_id, self.ctx.0)
        };
        if status != 0 {
            return Err(PlatformError { status });
        }
        Ok(())
    }
}
