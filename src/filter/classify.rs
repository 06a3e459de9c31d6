//! Packet-path classification.
//!
//! The engine holds the published policy in an `ArcSwapOption`: readers load
//! it without locks, and the control path swaps it in on start and out on
//! stop. Nothing here blocks or allocates per packet; alert events go into a
//! bounded queue with `try_send` and are dropped (and counted) when it is full.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;

use super::layers::{AddressFamily, CalloutDescriptor, DirectionSource, LayerKind};
use crate::error::FilterError;
use crate::policy::{Direction, FilterPolicy, Verdict};

// ============================================================================
// INCOMING VALUES
// ============================================================================

/// One fixed field as delivered by the filtering platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Empty,
    Uint8(u8),
    Uint16(u16),
    /// IPv4 addresses arrive in host-numeric form, as `u32::from(Ipv4Addr)`.
    Uint32(u32),
    ByteArray16([u8; 16]),
}

/// The platform's indexed array of fixed fields for one packet.
#[derive(Debug, Clone, Copy)]
pub struct IncomingValues<'a> {
    values: &'a [FieldValue],
}

impl<'a> IncomingValues<'a> {
    pub fn new(values: &'a [FieldValue]) -> Self {
        Self { values }
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> FieldValue {
        self.values.get(index).copied().unwrap_or(FieldValue::Empty)
    }
}

/// Addresses, ports, and direction pulled out of the fixed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketFields {
    pub layer: LayerKind,
    pub direction: Direction,
    pub protocol: u8,
    pub local: IpAddr,
    pub remote: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
}

impl PacketFields {
    pub fn extract(
        descriptor: &CalloutDescriptor,
        values: &IncomingValues<'_>,
    ) -> Result<Self, FilterError> {
        let layout = &descriptor.fields;

        let protocol = match values.get(layout.protocol) {
            FieldValue::Uint8(p) => p,
            _ => return Err(FilterError::BadData("ip protocol")),
        };
        let local = read_address(descriptor.family, values.get(layout.local_address))
            .ok_or(FilterError::BadData("local address"))?;
        let remote = read_address(descriptor.family, values.get(layout.remote_address))
            .ok_or(FilterError::BadData("remote address"))?;
        let local_port = read_port(layout.local_port, values).ok_or(FilterError::BadData("local port"))?;
        let remote_port =
            read_port(layout.remote_port, values).ok_or(FilterError::BadData("remote port"))?;

        let direction = match descriptor.direction {
            DirectionSource::Fixed(direction) => direction,
            DirectionSource::Field(index) => match values.get(index) {
                FieldValue::Uint32(0) => Direction::Outbound,
                FieldValue::Uint32(1) => Direction::Inbound,
                _ => return Err(FilterError::BadData("direction")),
            },
        };

        Ok(Self {
            layer: descriptor.layer,
            direction,
            protocol,
            local,
            remote,
            local_port,
            remote_port,
        })
    }

    #[inline(always)]
    pub fn local_v4(&self) -> Option<Ipv4Addr> {
        match self.local {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        }
    }

    #[inline(always)]
    pub fn remote_v4(&self) -> Option<Ipv4Addr> {
        match self.remote {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        }
    }
}

#[inline(always)]
fn read_address(family: AddressFamily, value: FieldValue) -> Option<IpAddr> {
    match (family, value) {
        (AddressFamily::V4, FieldValue::Uint32(raw)) => Some(IpAddr::V4(Ipv4Addr::from(raw))),
        (AddressFamily::V6, FieldValue::ByteArray16(raw)) => Some(IpAddr::V6(Ipv6Addr::from(raw))),
        _ => None,
    }
}

#[inline(always)]
fn read_port(index: Option<usize>, values: &IncomingValues<'_>) -> Option<u16> {
    match index {
        None => Some(0),
        Some(i) => match values.get(i) {
            FieldValue::Uint16(port) => Some(port),
            _ => None,
        },
    }
}

// ============================================================================
// STATS & ALERTS
// ============================================================================

#[derive(Debug, Default)]
pub struct ClassifyStats {
    pub packets_classified: AtomicU64,
    pub packets_passed: AtomicU64,
    pub packets_blocked: AtomicU64,
    pub packets_alerted: AtomicU64,
    pub bad_data: AtomicU64,
    pub alerts_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub packets_classified: u64,
    pub packets_passed: u64,
    pub packets_blocked: u64,
    pub packets_alerted: u64,
    pub bad_data: u64,
    pub alerts_dropped: u64,
}

impl ClassifyStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_classified: self.packets_classified.load(Ordering::Relaxed),
            packets_passed: self.packets_passed.load(Ordering::Relaxed),
            packets_blocked: self.packets_blocked.load(Ordering::Relaxed),
            packets_alerted: self.packets_alerted.load(Ordering::Relaxed),
            bad_data: self.bad_data.load(Ordering::Relaxed),
            alerts_dropped: self.alerts_dropped.load(Ordering::Relaxed),
        }
    }

    #[inline(always)]
    fn record(&self, verdict: Verdict) {
        self.packets_classified.fetch_add(1, Ordering::Relaxed);
        let counter = match verdict {
            Verdict::Pass => &self.packets_passed,
            Verdict::Block => &self.packets_blocked,
            Verdict::Alert => &self.packets_alerted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Report of a Block or Alert verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlertEvent {
    pub layer: LayerKind,
    pub verdict: Verdict,
    pub direction: Direction,
    pub matched: IpAddr,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub protocol: u8,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ClassifyEngine {
    active: ArcSwapOption<FilterPolicy>,
    stats: ClassifyStats,
    alert_tx: Sender<AlertEvent>,
    alert_rx: Receiver<AlertEvent>,
}

impl ClassifyEngine {
    pub fn new(alert_capacity: usize) -> Self {
        let (alert_tx, alert_rx) = bounded(alert_capacity.max(1));
        Self {
            active: ArcSwapOption::empty(),
            stats: ClassifyStats::default(),
            alert_tx,
            alert_rx,
        }
    }

    pub(crate) fn publish(&self, policy: Arc<FilterPolicy>) {
        self.active.store(Some(policy));
    }

    pub(crate) fn unpublish(&self) {
        self.active.store(None);
    }

    pub fn is_active(&self) -> bool {
        self.active.load().is_some()
    }

    /// Classify one packet arriving on `layer`.
    ///
    /// Any failure, including a missing policy or malformed fields, yields
    /// `Verdict::Pass`.
    pub fn classify(&self, layer: LayerKind, values: &IncomingValues<'_>) -> Verdict {
        let guard = self.active.load();
        let policy: &FilterPolicy = match &*guard {
            Some(policy) => policy,
            None => return Verdict::Pass,
        };
        if !policy.enabled_layers().contains(layer) {
            return Verdict::Pass;
        }

        let descriptor = layer.descriptor();
        let packet = match PacketFields::extract(descriptor, values) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.bad_data.fetch_add(1, Ordering::Relaxed);
                log::trace!("{}: {}, passing packet", layer, e);
                return Verdict::Pass;
            }
        };

        let decision = (descriptor.classify)(policy, &packet);
        self.stats.record(decision.verdict);

        if let Some(matched) = decision.matched {
            if decision.verdict != Verdict::Pass {
                self.report(&packet, decision.verdict, matched);
            }
        }
        decision.verdict
    }

    fn report(&self, packet: &PacketFields, verdict: Verdict, matched: IpAddr) {
        log::debug!(
            "SIGNAL {:?} ({}): IP: {} (local:{}:{} -> remote:{}:{})",
            verdict,
            packet.direction,
            matched,
            packet.local,
            packet.local_port,
            packet.remote,
            packet.remote_port,
        );

        let event = AlertEvent {
            layer: packet.layer,
            verdict,
            direction: packet.direction,
            matched,
            local: SocketAddr::new(packet.local, packet.local_port),
            remote: SocketAddr::new(packet.remote, packet.remote_port),
            protocol: packet.protocol,
        };
        match self.alert_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.alerts_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn try_recv_alert(&self) -> Option<AlertEvent> {
        self.alert_rx.try_recv().ok()
    }

    pub fn drain_alerts(&self) -> Vec<AlertEvent> {
        self.alert_rx.try_iter().collect()
    }
}
