//! Packet interception: supported layers, callout registration, and the
//! per-packet classify engine.

pub mod callout;
pub mod classify;
pub mod host;
pub mod layers;

#[cfg(test)]
pub(crate) mod mock;

pub use callout::{CalloutEntry, CalloutIds, CalloutPlatform, CalloutRegistry};
pub use classify::{
    AlertEvent, ClassifyEngine, FieldValue, IncomingValues, PacketFields, StatsSnapshot,
};
pub use host::HostPlatform;
pub use layers::{CalloutDescriptor, LayerKind, LayerSet, LAYER_COUNT};
