//! Filter error types, status codes, and last-error storage for the C ABI.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;

use crate::filter::LayerKind;

// ── Status codes ────────────────────────────────────────────────────────────

pub const SUCCESS: i32 = 0;
pub const ERROR_BAD_PARAMETERS: i32 = -1;
pub const ERROR_CORRUPT_CONFIG: i32 = -2;
pub const ERROR_OUT_OF_MEMORY: i32 = -3;
pub const ERROR_BUFFER_TOO_LARGE: i32 = -4;
pub const ERROR_ALREADY_RUNNING: i32 = -5;
pub const ERROR_NOT_RUNNING: i32 = -6;
pub const ERROR_NOT_CONFIGURED: i32 = -7;
pub const ERROR_BAD_DATA: i32 = -8;
pub const ERROR_REGISTRATION: i32 = -9;
pub const ERROR_UNKNOWN_COMMAND: i32 = -10;

// ── FilterError enum ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Bad parameters: {0}")]
    BadParameters(String),

    #[error("Corrupt config: {0}")]
    CorruptConfig(String),

    #[error("Out of memory while growing {0}")]
    OutOfMemory(&'static str),

    #[error("Buffer of {len} bytes exceeds the {max} byte transfer limit")]
    BufferTooLarge { len: usize, max: usize },

    #[error("Filter is already running")]
    AlreadyRunning,

    #[error("Filter is not running")]
    NotRunning,

    #[error("No filter config loaded")]
    NotConfigured,

    #[error("Bad packet data: {0}")]
    BadData(&'static str),

    #[error("Failed to register callout for {layer}")]
    Registration {
        layer: LayerKind,
        #[source]
        source: PlatformError,
    },

    #[error("Unknown control code {0:#010x}")]
    UnknownCommand(u32),
}

impl FilterError {
    /// Map this error to its integer status code for the C ABI.
    pub fn code(&self) -> i32 {
        match self {
            FilterError::BadParameters(_) => ERROR_BAD_PARAMETERS,
            FilterError::CorruptConfig(_) => ERROR_CORRUPT_CONFIG,
            FilterError::OutOfMemory(_) => ERROR_OUT_OF_MEMORY,
            FilterError::BufferTooLarge { .. } => ERROR_BUFFER_TOO_LARGE,
            FilterError::AlreadyRunning => ERROR_ALREADY_RUNNING,
            FilterError::NotRunning => ERROR_NOT_RUNNING,
            FilterError::NotConfigured => ERROR_NOT_CONFIGURED,
            FilterError::BadData(_) => ERROR_BAD_DATA,
            FilterError::Registration { .. } => ERROR_REGISTRATION,
            FilterError::UnknownCommand(_) => ERROR_UNKNOWN_COMMAND,
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        FilterError::CorruptConfig(msg.into())
    }
}

/// Status reported by the filtering platform when a callout operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("platform status {status:#010x}")]
pub struct PlatformError {
    pub status: i32,
}

// ── Last-error storage ──────────────────────────────────────────────────────

static LAST_ERROR: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));
static LAST_ERROR_CODE: Lazy<Mutex<i32>> = Lazy::new(|| Mutex::new(SUCCESS));

/// Store a `FilterError`, recording both the message and code.
pub fn set_filter_error(err: &FilterError) {
    *LAST_ERROR_CODE.lock() = err.code();
    *LAST_ERROR.lock() = Some(err.to_string());
}

/// Clear the stored error.
pub fn clear_error() {
    *LAST_ERROR.lock() = None;
    *LAST_ERROR_CODE.lock() = SUCCESS;
}

/// Take the last error message, leaving `None` behind.
pub fn take_last_error() -> Option<String> {
    LAST_ERROR.lock().take()
}

/// Return the last error code without clearing it.
pub fn last_error_code() -> i32 {
    *LAST_ERROR_CODE.lock()
}
