//! Supported interception layers and their static callout table.
//!
//! The set of layers is closed: each `LayerKind` maps to exactly one
//! `CalloutDescriptor` describing where the platform places the packet's
//! fields and which classify function handles it.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::classify::PacketFields;
use crate::policy::{Decision, Direction, FilterPolicy};

pub const LAYER_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    InboundTransportV4,
    OutboundTransportV4,
    InboundTransportV6,
    OutboundTransportV6,
    DatagramDataV4,
    InboundIcmpErrorV4,
}

impl LayerKind {
    /// Every layer, in wire-flag order.
    pub const ALL: [LayerKind; LAYER_COUNT] = [
        LayerKind::InboundTransportV4,
        LayerKind::OutboundTransportV4,
        LayerKind::InboundTransportV6,
        LayerKind::OutboundTransportV6,
        LayerKind::DatagramDataV4,
        LayerKind::InboundIcmpErrorV4,
    ];

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    #[inline(always)]
    pub fn descriptor(self) -> &'static CalloutDescriptor {
        &CALLOUTS[self.index()]
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor().platform_layer)
    }
}

// ============================================================================
// LAYER SET
// ============================================================================

/// Set of enabled layers.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LayerSet(u8);

impl LayerSet {
    pub const fn empty() -> Self {
        LayerSet(0)
    }

    pub fn from_layers(layers: &[LayerKind]) -> Self {
        let mut set = Self::empty();
        for layer in layers {
            set.insert(*layer);
        }
        set
    }

    pub fn insert(&mut self, layer: LayerKind) {
        self.0 |= 1 << layer.index();
    }

    #[inline(always)]
    pub fn contains(self, layer: LayerKind) -> bool {
        self.0 & (1 << layer.index()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = LayerKind> {
        LayerKind::ALL.into_iter().filter(move |l| self.contains(*l))
    }
}

impl fmt::Debug for LayerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// ============================================================================
// CALLOUT DESCRIPTORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Indices of the fixed fields a layer delivers.
#[derive(Debug, Clone, Copy)]
pub struct FieldLayout {
    pub protocol: usize,
    pub local_address: usize,
    pub remote_address: usize,
    pub local_port: Option<usize>,
    pub remote_port: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub enum DirectionSource {
    Fixed(Direction),
    /// Read from a `Uint32` field: 0 outbound, 1 inbound.
    Field(usize),
}

pub type ClassifyFn = fn(&FilterPolicy, &PacketFields) -> Decision;

pub struct CalloutDescriptor {
    pub layer: LayerKind,
    pub name: &'static str,
    pub platform_layer: &'static str,
    pub family: AddressFamily,
    pub fields: FieldLayout,
    pub direction: DirectionSource,
    pub classify: ClassifyFn,
}

impl fmt::Debug for CalloutDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalloutDescriptor")
            .field("layer", &self.layer)
            .field("name", &self.name)
            .field("platform_layer", &self.platform_layer)
            .finish()
    }
}

const TRANSPORT_FIELDS: FieldLayout = FieldLayout {
    protocol: 0,
    local_address: 1,
    remote_address: 3,
    local_port: Some(4),
    remote_port: Some(5),
};

const DATAGRAM_FIELDS: FieldLayout = FieldLayout {
    protocol: 0,
    local_address: 1,
    remote_address: 2,
    local_port: Some(4),
    remote_port: Some(5),
};

const DATAGRAM_DIRECTION_FIELD: usize = 9;

const ICMP_ERROR_FIELDS: FieldLayout = FieldLayout {
    protocol: 0,
    local_address: 1,
    remote_address: 2,
    local_port: Some(5),
    remote_port: Some(6),
};

// Indexed by `LayerKind::index`.
static CALLOUTS: [CalloutDescriptor; LAYER_COUNT] = [
    CalloutDescriptor {
        layer: LayerKind::InboundTransportV4,
        name: "ATF inbound IPv4 transport callout",
        platform_layer: "FWPM_LAYER_INBOUND_TRANSPORT_V4",
        family: AddressFamily::V4,
        fields: TRANSPORT_FIELDS,
        direction: DirectionSource::Fixed(Direction::Inbound),
        classify: classify_ipv4,
    },
    CalloutDescriptor {
        layer: LayerKind::OutboundTransportV4,
        name: "ATF outbound IPv4 transport callout",
        platform_layer: "FWPM_LAYER_OUTBOUND_TRANSPORT_V4",
        family: AddressFamily::V4,
        fields: TRANSPORT_FIELDS,
        direction: DirectionSource::Fixed(Direction::Outbound),
        classify: classify_ipv4,
    },
    CalloutDescriptor {
        layer: LayerKind::InboundTransportV6,
        name: "ATF inbound IPv6 transport callout",
        platform_layer: "FWPM_LAYER_INBOUND_TRANSPORT_V6",
        family: AddressFamily::V6,
        fields: TRANSPORT_FIELDS,
        direction: DirectionSource::Fixed(Direction::Inbound),
        classify: classify_ipv6,
    },
    CalloutDescriptor {
        layer: LayerKind::OutboundTransportV6,
        name: "ATF outbound IPv6 transport callout",
        platform_layer: "FWPM_LAYER_OUTBOUND_TRANSPORT_V6",
        family: AddressFamily::V6,
        fields: TRANSPORT_FIELDS,
        direction: DirectionSource::Fixed(Direction::Outbound),
        classify: classify_ipv6,
    },
    CalloutDescriptor {
        layer: LayerKind::DatagramDataV4,
        name: "ATF IPv4 datagram callout",
        platform_layer: "FWPM_LAYER_DATAGRAM_DATA_V4",
        family: AddressFamily::V4,
        fields: DATAGRAM_FIELDS,
        direction: DirectionSource::Field(DATAGRAM_DIRECTION_FIELD),
        classify: classify_ipv4,
    },
    CalloutDescriptor {
        layer: LayerKind::InboundIcmpErrorV4,
        name: "ATF inbound ICMPv4 error callout",
        platform_layer: "FWPM_LAYER_INBOUND_ICMP_ERROR_V4",
        family: AddressFamily::V4,
        fields: ICMP_ERROR_FIELDS,
        direction: DirectionSource::Fixed(Direction::Inbound),
        classify: classify_ipv4,
    },
];

// ============================================================================
// CLASSIFY FUNCTIONS
// ============================================================================

fn classify_ipv4(policy: &FilterPolicy, packet: &PacketFields) -> Decision {
    match (packet.local_v4(), packet.remote_v4()) {
        (Some(local), Some(remote)) => policy.classify_ipv4(local, remote, packet.direction),
        _ => Decision::PASS,
    }
}

/// IPv6 blocklists are carried in the policy but not matched.
fn classify_ipv6(_policy: &FilterPolicy, _packet: &PacketFields) -> Decision {
    Decision::PASS
}
