//! Runtime options for a control channel.

use serde::{Deserialize, Serialize};

use crate::error::FilterError;

/// Default cap on one `AppendBlacklist` payload (16384 addresses).
pub const DEFAULT_MAX_APPEND_BYTES: usize = 64 * 1024;

/// Upper bound on `max_append_bytes`; keeps an append's address count
/// representable in the C ABI's `i32` return.
pub const MAX_APPEND_BYTES_LIMIT: usize = i32::MAX as usize;

/// Default length of the packet-path alert queue.
pub const DEFAULT_ALERT_QUEUE_CAPACITY: usize = 1024;

/// JSON shape: `{"max_append_bytes":65536,"alert_queue_capacity":1024}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    pub max_append_bytes: usize,
    pub alert_queue_capacity: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_append_bytes: DEFAULT_MAX_APPEND_BYTES,
            alert_queue_capacity: DEFAULT_ALERT_QUEUE_CAPACITY,
        }
    }
}

impl ChannelOptions {
    /// Parse options from JSON. `None` or an empty string means defaults.
    pub fn from_json(raw: Option<&str>) -> Result<Self, FilterError> {
        let options = match raw.map(str::trim) {
            None | Some("") => Self::default(),
            Some(s) => serde_json::from_str(s)
                .map_err(|e| FilterError::BadParameters(format!("Invalid options json: {}", e)))?,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), FilterError> {
        if self.max_append_bytes == 0 {
            return Err(FilterError::BadParameters("max_append_bytes must be non-zero".into()));
        }
        if self.max_append_bytes > MAX_APPEND_BYTES_LIMIT {
            return Err(FilterError::BadParameters(format!(
                "max_append_bytes must not exceed {}",
                MAX_APPEND_BYTES_LIMIT
            )));
        }
        if self.max_append_bytes % crate::policy::wire::IPV4_ADDRESS_SIZE != 0 {
            return Err(FilterError::BadParameters(
                "max_append_bytes must be a multiple of the address size".into(),
            ));
        }
        if self.alert_queue_capacity == 0 {
            return Err(FilterError::BadParameters(
                "alert_queue_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_json_is_absent() {
        assert_eq!(ChannelOptions::from_json(None).unwrap(), ChannelOptions::default());
        assert_eq!(
            ChannelOptions::from_json(Some("  ")).unwrap(),
            ChannelOptions::default()
        );
    }

    #[test]
    fn test_defaults_when_optional_fields_are_omitted() {
        let parsed = ChannelOptions::from_json(Some(r#"{"alert_queue_capacity":8}"#)).unwrap();

        assert_eq!(parsed.alert_queue_capacity, 8);
        assert_eq!(parsed.max_append_bytes, DEFAULT_MAX_APPEND_BYTES);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(ChannelOptions::from_json(Some(r#"{"max_append_bytes":0}"#)).is_err());
        assert!(ChannelOptions::from_json(Some(r#"{"max_append_bytes":6}"#)).is_err());
        assert!(ChannelOptions::from_json(Some(r#"{"alert_queue_capacity":0}"#)).is_err());
        assert!(matches!(
            ChannelOptions::from_json(Some(r#"{"max_append_bytes":8589934592}"#)),
            Err(FilterError::BadParameters(_))
        ));
        assert!(matches!(
            ChannelOptions::from_json(Some("{not json")),
            Err(FilterError::BadParameters(_))
        ));
    }

    #[test]
    fn test_largest_accepted_append_fits_c_status() {
        let largest = MAX_APPEND_BYTES_LIMIT - MAX_APPEND_BYTES_LIMIT % 4;
        let options = ChannelOptions {
            max_append_bytes: largest,
            ..Default::default()
        };

        assert!(options.validate().is_ok());
        assert!(i32::try_from(largest / 4).is_ok());
        assert!(ChannelOptions {
            max_append_bytes: largest + 4,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
