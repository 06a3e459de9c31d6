//! Filter policy: the validated configuration consulted by the packet path.
//!
//! A `FilterPolicy` is built once from a wire buffer, may grow through
//! `append_ipv4` while interception is stopped, and is read concurrently by
//! the classify engine while running.

pub mod settings;
pub mod trie;
pub mod wire;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FilterError;
use crate::filter::LayerSet;

pub use settings::PolicySettings;
pub use trie::{AddressTrie, TrieStats};
pub use wire::PolicyHeader;

// ============================================================================
// ACTIONS, DIRECTIONS, VERDICTS
// ============================================================================

/// Configured response to a blocklist match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Action {
    #[default]
    Pass,
    Alert,
    Block,
}

impl Action {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Action::Pass),
            1 => Some(Action::Alert),
            2 => Some(Action::Block),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u8 {
        match self {
            Action::Pass => 0,
            Action::Alert => 1,
            Action::Block => 2,
        }
    }

    /// Parse a rule-file action name. Unknown names fall back to `Pass`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "BLOCK" => Action::Block,
            "ALERT" => Action::Alert,
            _ => Action::Pass,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Action::Pass => "PASS",
            Action::Alert => "ALERT",
            Action::Block => "BLOCK",
        }
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Action::from_name(&name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Inbound => "INBOUND",
            Direction::Outbound => "OUTBOUND",
        })
    }
}

/// Outcome handed back to the filtering platform for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Block,
    Alert,
}

impl Verdict {
    /// Integer code for the C ABI.
    pub fn as_code(self) -> i32 {
        match self {
            Verdict::Pass => 0,
            Verdict::Block => 1,
            Verdict::Alert => 2,
        }
    }
}

/// A verdict plus the address that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub matched: Option<IpAddr>,
}

impl Decision {
    pub const PASS: Decision = Decision {
        verdict: Verdict::Pass,
        matched: None,
    };
}

fn try_copy<T: Copy>(src: &[T], what: &'static str) -> Result<Vec<T>, FilterError> {
    let mut copy = Vec::new();
    copy.try_reserve_exact(src.len())
        .map_err(|_| FilterError::OutOfMemory(what))?;
    copy.extend_from_slice(src);
    Ok(copy)
}

// ============================================================================
// FILTER POLICY
// ============================================================================

#[derive(Debug)]
pub struct FilterPolicy {
    layers: LayerSet,
    alert_inbound: bool,
    alert_outbound: bool,
    ipv4_action: Action,
    ipv6_action: Action,
    dns_action: Action,
    ipv4_pool: Vec<Ipv4Addr>,
    ipv4_trie: AddressTrie,
    ipv6_pool: Vec<Ipv6Addr>,
    domain_buffer: Vec<u8>,
}

impl FilterPolicy {
    /// Validate a wire buffer and build a policy from it.
    pub fn build(buf: &[u8]) -> Result<Self, FilterError> {
        let (header, dns_buffer) = PolicyHeader::decode(buf)?;

        let mut ipv4_trie = AddressTrie::new()?;
        ipv4_trie.insert_pool(&header.ipv4_blocklist)?;

        let mut domain_buffer = Vec::new();
        domain_buffer
            .try_reserve_exact(dns_buffer.len())
            .map_err(|_| FilterError::OutOfMemory("domain buffer"))?;
        domain_buffer.extend_from_slice(dns_buffer);

        let policy = Self {
            layers: header.layers,
            alert_inbound: header.alert_inbound,
            alert_outbound: header.alert_outbound,
            ipv4_action: header.ipv4_action,
            ipv6_action: header.ipv6_action,
            dns_action: header.dns_action,
            ipv4_pool: header.ipv4_blocklist,
            ipv4_trie,
            ipv6_pool: header.ipv6_blocklist,
            domain_buffer,
        };

        let stats = policy.trie_stats();
        log::info!(
            "Built filter policy: layers={:?}, ipv4={} ({} nodes, {} bytes), ipv6={}, domains={}, actions ipv4={} ipv6={} dns={}",
            policy.layers,
            stats.addresses,
            stats.nodes,
            stats.bytes,
            policy.ipv6_pool.len(),
            policy.domains().count(),
            policy.ipv4_action.name(),
            policy.ipv6_action.name(),
            policy.dns_action.name(),
        );

        Ok(policy)
    }

    /// Deep copy of the policy. Allocation failure is reported as
    /// `OutOfMemory` instead of aborting.
    pub fn try_clone(&self) -> Result<Self, FilterError> {
        Ok(Self {
            layers: self.layers,
            alert_inbound: self.alert_inbound,
            alert_outbound: self.alert_outbound,
            ipv4_action: self.ipv4_action,
            ipv6_action: self.ipv6_action,
            dns_action: self.dns_action,
            ipv4_pool: try_copy(&self.ipv4_pool, "ipv4 address pool")?,
            ipv4_trie: self.ipv4_trie.try_clone()?,
            ipv6_pool: try_copy(&self.ipv6_pool, "ipv6 address pool")?,
            domain_buffer: try_copy(&self.domain_buffer, "domain buffer")?,
        })
    }

    /// Append raw network-order IPv4 addresses to the blocklist.
    ///
    /// Only the new addresses are inserted into the trie. Returns how many
    /// addresses were appended.
    pub fn append_ipv4(&mut self, raw: &[u8], max_bytes: usize) -> Result<usize, FilterError> {
        if raw.is_empty() {
            return Err(FilterError::BadParameters("empty blocklist append".into()));
        }
        if raw.len() % wire::IPV4_ADDRESS_SIZE != 0 {
            return Err(FilterError::BadParameters(format!(
                "blocklist append of {} bytes is not a multiple of {}",
                raw.len(),
                wire::IPV4_ADDRESS_SIZE
            )));
        }
        if raw.len() > max_bytes {
            return Err(FilterError::BufferTooLarge {
                len: raw.len(),
                max: max_bytes,
            });
        }

        let added = wire::parse_ipv4_pool(raw)?;
        self.ipv4_pool
            .try_reserve(added.len())
            .map_err(|_| FilterError::OutOfMemory("ipv4 address pool"))?;
        self.ipv4_pool.extend_from_slice(&added);
        self.ipv4_trie.insert_pool(&added)?;

        log::info!(
            "Appended {} addresses to ipv4 blocklist ({} total)",
            added.len(),
            self.ipv4_trie.len()
        );
        Ok(added.len())
    }

    /// Match an IPv4 flow against the blocklist.
    ///
    /// When both ends match, the remote address is reported.
    #[inline]
    pub fn classify_ipv4(&self, local: Ipv4Addr, remote: Ipv4Addr, direction: Direction) -> Decision {
        if !self.alerts_enabled(direction) {
            return Decision::PASS;
        }

        let mut matched = None;
        if self.ipv4_trie.contains(local) {
            matched = Some(local);
        }
        if self.ipv4_trie.contains(remote) {
            matched = Some(remote);
        }

        match (matched, self.ipv4_action) {
            (None, _) | (_, Action::Pass) => Decision::PASS,
            (Some(addr), Action::Block) => Decision {
                verdict: Verdict::Block,
                matched: Some(IpAddr::V4(addr)),
            },
            (Some(addr), Action::Alert) => Decision {
                verdict: Verdict::Alert,
                matched: Some(IpAddr::V4(addr)),
            },
        }
    }

    #[inline]
    pub fn alerts_enabled(&self, direction: Direction) -> bool {
        match direction {
            Direction::Inbound => self.alert_inbound,
            Direction::Outbound => self.alert_outbound,
        }
    }

    pub fn enabled_layers(&self) -> LayerSet {
        self.layers
    }

    pub fn ipv4_action(&self) -> Action {
        self.ipv4_action
    }

    pub fn ipv6_action(&self) -> Action {
        self.ipv6_action
    }

    pub fn dns_action(&self) -> Action {
        self.dns_action
    }

    pub fn ipv4_pool(&self) -> &[Ipv4Addr] {
        &self.ipv4_pool
    }

    pub fn ipv6_pool(&self) -> &[Ipv6Addr] {
        &self.ipv6_pool
    }

    /// Domain names carried in the trailing buffer.
    pub fn domains(&self) -> impl Iterator<Item = &[u8]> {
        wire::domain_entries(&self.domain_buffer)
    }

    pub fn trie_stats(&self) -> TrieStats {
        self.ipv4_trie.stats()
    }

    /// The header fields this policy was built from.
    ///
    /// Addresses appended after the build are included, so the list may
    /// exceed the header's capacity.
    pub fn header(&self) -> PolicyHeader {
        PolicyHeader {
            layers: self.layers,
            alert_inbound: self.alert_inbound,
            alert_outbound: self.alert_outbound,
            ipv4_action: self.ipv4_action,
            ipv6_action: self.ipv6_action,
            dns_action: self.dns_action,
            ipv6_blocklist: self.ipv6_pool.clone(),
            ipv4_blocklist: self.ipv4_pool.clone(),
            dns_buffer_size: self.domain_buffer.len() as u16,
        }
    }

    pub fn settings(&self) -> PolicySettings {
        PolicySettings::from_policy(self)
    }
}
