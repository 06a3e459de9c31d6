//! Callout registration against the filtering platform.
//!
//! `CalloutRegistry` records the ids the platform hands back for each
//! registered layer so every registration can be undone. Registration is
//! all-or-nothing: a failure part way through unregisters the layers that
//! already succeeded.

use arrayvec::ArrayVec;

use super::layers::{CalloutDescriptor, LayerKind, LayerSet, LAYER_COUNT};
use crate::error::{FilterError, PlatformError};

/// Ids assigned by the platform, needed only to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CalloutIds {
    pub callout_id: u32,
    pub filter_id: u64,
}

/// The filtering platform's registration surface.
///
/// Both calls are made with the control lock held and may block.
pub trait CalloutPlatform: Send {
    fn register(&mut self, callout: &'static CalloutDescriptor) -> Result<CalloutIds, PlatformError>;

    fn unregister(&mut self, layer: LayerKind, ids: CalloutIds) -> Result<(), PlatformError>;
}

impl<P: CalloutPlatform + ?Sized> CalloutPlatform for Box<P> {
    fn register(&mut self, callout: &'static CalloutDescriptor) -> Result<CalloutIds, PlatformError> {
        (**self).register(callout)
    }

    fn unregister(&mut self, layer: LayerKind, ids: CalloutIds) -> Result<(), PlatformError> {
        (**self).unregister(layer, ids)
    }
}

/// One registered layer and the ids needed to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalloutEntry {
    pub layer: LayerKind,
    pub ids: CalloutIds,
}

#[derive(Debug, Default)]
pub struct CalloutRegistry {
    entries: ArrayVec<CalloutEntry, LAYER_COUNT>,
}

impl CalloutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one callout per layer in `layers`.
    ///
    /// On failure every layer registered by this call is unregistered again
    /// and the registry is left empty.
    pub fn start<P>(&mut self, layers: LayerSet, platform: &mut P) -> Result<(), FilterError>
    where
        P: CalloutPlatform + ?Sized,
    {
        if !self.entries.is_empty() {
            return Err(FilterError::AlreadyRunning);
        }

        for layer in layers.iter() {
            let descriptor = layer.descriptor();
            match platform.register(descriptor) {
                Ok(ids) => {
                    log::trace!(
                        "Registered {} (callout {}, filter {})",
                        descriptor.name,
                        ids.callout_id,
                        ids.filter_id
                    );
                    self.entries.push(CalloutEntry { layer, ids });
                }
                Err(source) => {
                    log::warn!(
                        "Registering {} failed ({}), rolling back {} layer(s)",
                        layer,
                        source,
                        self.entries.len()
                    );
                    self.stop(platform);
                    return Err(FilterError::Registration { layer, source });
                }
            }
        }
        Ok(())
    }

    /// Unregister every recorded callout and clear the table.
    ///
    /// Failures are logged and do not stop the remaining unregistrations.
    /// Returns the number of failures.
    pub fn stop<P>(&mut self, platform: &mut P) -> usize
    where
        P: CalloutPlatform + ?Sized,
    {
        let mut failures = 0;
        while let Some(entry) = self.entries.pop() {
            match platform.unregister(entry.layer, entry.ids) {
                Ok(()) => log::trace!("Unregistered {}", entry.layer),
                Err(e) => {
                    failures += 1;
                    log::warn!("Failed to unregister {}: {}", entry.layer, e);
                }
            }
        }
        failures
    }

    pub fn entries(&self) -> &[CalloutEntry] {
        &self.entries
    }

    pub fn layers(&self) -> LayerSet {
        let mut set = LayerSet::empty();
        for entry in &self.entries {
            set.insert(entry.layer);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
