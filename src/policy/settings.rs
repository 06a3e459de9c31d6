//! Structured policy description, convertible to and from the wire format.

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use super::wire::{self, PolicyHeader};
use super::{Action, FilterPolicy};
use crate::error::FilterError;
use crate::filter::{LayerKind, LayerSet};

/// JSON shape:
/// ```json
/// {
///   "layers": ["inbound_transport_v4", "outbound_transport_v4"],
///   "alert_inbound": true,
///   "alert_outbound": true,
///   "ipv4_action": "BLOCK",
///   "ipv6_action": "ALERT",
///   "dns_action": "PASS",
///   "ipv4_blocklist": ["203.0.113.5"],
///   "ipv6_blocklist": ["2001:db8::1"],
///   "dns_blocklist": ["evil.example"]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub layers: Vec<LayerKind>,
    pub alert_inbound: bool,
    pub alert_outbound: bool,
    pub ipv4_action: Action,
    pub ipv6_action: Action,
    pub dns_action: Action,
    pub ipv4_blocklist: Vec<Ipv4Addr>,
    pub ipv6_blocklist: Vec<Ipv6Addr>,
    pub dns_blocklist: Vec<String>,
}

impl PolicySettings {
    pub fn from_json(json: &str) -> Result<Self, FilterError> {
        serde_json::from_str(json)
            .map_err(|e| FilterError::BadParameters(format!("Invalid policy json: {}", e)))
    }

    pub(super) fn from_policy(policy: &FilterPolicy) -> Self {
        Self {
            layers: policy.enabled_layers().iter().collect(),
            alert_inbound: policy.alerts_enabled(super::Direction::Inbound),
            alert_outbound: policy.alerts_enabled(super::Direction::Outbound),
            ipv4_action: policy.ipv4_action(),
            ipv6_action: policy.ipv6_action(),
            dns_action: policy.dns_action(),
            ipv4_blocklist: policy.ipv4_pool().to_vec(),
            ipv6_blocklist: policy.ipv6_pool().to_vec(),
            dns_blocklist: policy
                .domains()
                .map(|name| String::from_utf8_lossy(name).into_owned())
                .collect(),
        }
    }

    pub fn to_header(&self) -> PolicyHeader {
        PolicyHeader {
            layers: LayerSet::from_layers(&self.layers),
            alert_inbound: self.alert_inbound,
            alert_outbound: self.alert_outbound,
            ipv4_action: self.ipv4_action,
            ipv6_action: self.ipv6_action,
            dns_action: self.dns_action,
            ipv6_blocklist: self.ipv6_blocklist.clone(),
            ipv4_blocklist: self.ipv4_blocklist.clone(),
            dns_buffer_size: 0,
        }
    }

    /// Encode into a `LoadConfig` buffer.
    ///
    /// Only capacity limits are checked here; content is validated when the
    /// buffer is loaded.
    pub fn to_wire(&self) -> Result<Vec<u8>, FilterError> {
        let dns_buffer = wire::encode_domain_buffer(&self.dns_blocklist);
        self.to_header().encode(&dns_buffer)
    }
}
