//! Recording `CalloutPlatform` for tests.

use std::sync::Arc;

use parking_lot::Mutex;

use super::callout::{CalloutIds, CalloutPlatform};
use super::layers::{CalloutDescriptor, LayerKind, LayerSet};
use crate::error::PlatformError;

#[derive(Debug, Default)]
struct MockState {
    live: Vec<(LayerKind, CalloutIds)>,
    fail_register_on: Option<LayerKind>,
    fail_unregister: bool,
    registrations: usize,
    unregistrations: usize,
    next_id: u32,
}

/// Clones share state, so a test can keep a handle after moving one into a channel.
#[derive(Debug, Clone, Default)]
pub struct MockPlatform {
    state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    pub fn fail_register_on(&self, layer: LayerKind) {
        self.state.lock().fail_register_on = Some(layer);
    }

    pub fn fail_unregister(&self, fail: bool) {
        self.state.lock().fail_unregister = fail;
    }

    pub fn live_layers(&self) -> LayerSet {
        let state = self.state.lock();
        let layers: Vec<LayerKind> = state.live.iter().map(|(layer, _)| *layer).collect();
        LayerSet::from_layers(&layers)
    }

    pub fn registrations(&self) -> usize {
        self.state.lock().registrations
    }

    pub fn unregistrations(&self) -> usize {
        self.state.lock().unregistrations
    }
}

impl CalloutPlatform for MockPlatform {
    fn register(&mut self, callout: &'static CalloutDescriptor) -> Result<CalloutIds, PlatformError> {
        let mut state = self.state.lock();
        state.registrations += 1;
        if state.fail_register_on == Some(callout.layer) {
            return Err(PlatformError { status: -1073741823 });
        }

        state.next_id += 1;
        let ids = CalloutIds {
            callout_id: state.next_id,
            filter_id: 0x1000 + state.next_id as u64,
        };
        state.live.push((callout.layer, ids));
        Ok(ids)
    }

    fn unregister(&mut self, layer: LayerKind, ids: CalloutIds) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        state.unregistrations += 1;
        // the callout is gone either way
        state.live.retain(|(l, i)| !(*l == layer && *i == ids));
        if state.fail_unregister {
            return Err(PlatformError { status: -1073741823 });
        }
        Ok(())
    }
}
