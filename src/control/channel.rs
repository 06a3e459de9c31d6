//! Control channel: the lifecycle state machine behind every administrative
//! command.
//!
//! | Command         | Allowed from  | Result        |
//! |-----------------|---------------|---------------|
//! | LoadConfig      | not Running   | Configured    |
//! | AppendBlacklist | Configured    | Configured    |
//! | Start           | Configured    | Running       |
//! | Stop            | Running       | Configured    |
//! | Flush           | Configured    | Uninitialized |
//! | Keepalive       | any           | unchanged     |
//!
//! All commands run end-to-end under one `parking_lot::Mutex`. Platform
//! registration calls are made while it is held, so it must stay a sleeping
//! lock. The packet path never takes it; it reads the policy the engine was
//! given on `Start`.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use super::command::{Command, CommandCode};
use crate::config::ChannelOptions;
use crate::error::FilterError;
use crate::filter::{CalloutPlatform, CalloutRegistry, ClassifyEngine, LayerSet};
use crate::policy::FilterPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecycleState {
    Uninitialized,
    Configured,
    Running,
}

impl LifecycleState {
    /// Integer code for the C ABI.
    pub fn as_code(self) -> i32 {
        match self {
            LifecycleState::Uninitialized => 0,
            LifecycleState::Configured => 1,
            LifecycleState::Running => 2,
        }
    }

    pub fn status_text(self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "Uninitialized",
            LifecycleState::Configured => "Configured",
            LifecycleState::Running => "Running",
        }
    }
}

/// Check `command` against the transition table.
fn precondition(state: LifecycleState, command: CommandCode) -> Result<(), FilterError> {
    use LifecycleState::*;

    match (command, state) {
        (CommandCode::Keepalive, _) => Ok(()),
        (CommandCode::Stop, Running) => Ok(()),
        (CommandCode::Stop, _) => Err(FilterError::NotRunning),
        (_, Running) => Err(FilterError::AlreadyRunning),
        (CommandCode::LoadConfig, _) => Ok(()),
        (_, Uninitialized) => Err(FilterError::NotConfigured),
        (_, Configured) => Ok(()),
    }
}

struct ChannelState<P> {
    lifecycle: LifecycleState,
    policy: Option<Arc<FilterPolicy>>,
    registry: CalloutRegistry,
    platform: P,
    last_keepalive: Option<Instant>,
}

impl<P> ChannelState<P> {
    fn check(&self, command: CommandCode) -> Result<(), FilterError> {
        precondition(self.lifecycle, command).map_err(|e| {
            log::warn!(
                "{} rejected in state {}: {}",
                command,
                self.lifecycle.status_text(),
                e
            );
            e
        })
    }
}

pub struct ControlChannel<P: CalloutPlatform> {
    state: Mutex<ChannelState<P>>,
    engine: Arc<ClassifyEngine>,
    options: ChannelOptions,
}

impl<P: CalloutPlatform> ControlChannel<P> {
    pub fn new(platform: P, options: ChannelOptions) -> Result<Self, FilterError> {
        options.validate()?;

        Ok(Self {
            state: Mutex::new(ChannelState {
                lifecycle: LifecycleState::Uninitialized,
                policy: None,
                registry: CalloutRegistry::new(),
                platform,
                last_keepalive: None,
            }),
            engine: Arc::new(ClassifyEngine::new(options.alert_queue_capacity)),
            options,
        })
    }

    /// Packet-path entry point shared with the filtering platform.
    pub fn engine(&self) -> &Arc<ClassifyEngine> {
        &self.engine
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub fn state(&self) -> LifecycleState {
        self.state.lock().lifecycle
    }

    /// Snapshot of the installed policy.
    pub fn policy(&self) -> Option<Arc<FilterPolicy>> {
        self.state.lock().policy.clone()
    }

    pub fn registered_layers(&self) -> LayerSet {
        self.state.lock().registry.layers()
    }

    pub fn last_keepalive(&self) -> Option<Instant> {
        self.state.lock().last_keepalive
    }

    /// Decode and run one command from its control code and input buffer.
    pub fn dispatch(&self, code: u32, input: &[u8]) -> Result<(), FilterError> {
        let command = Command::decode(code, input).map_err(|e| {
            log::warn!("{}", e);
            e
        })?;
        self.execute(command)
    }

    pub fn execute(&self, command: Command<'_>) -> Result<(), FilterError> {
        match command {
            Command::Keepalive => {
                self.keepalive();
                Ok(())
            }
            Command::LoadConfig(buf) => self.load_config(buf),
            Command::AppendBlacklist(raw) => self.append_blacklist(raw).map(|_| ()),
            Command::Start => self.start(),
            Command::Stop => self.stop(),
            Command::Flush => self.flush(),
        }
    }

    pub fn keepalive(&self) {
        self.state.lock().last_keepalive = Some(Instant::now());
    }

    /// Replace the policy with one built from `buf`.
    ///
    /// A buffer that fails validation leaves the previous policy and state in place.
    pub fn load_config(&self, buf: &[u8]) -> Result<(), FilterError> {
        let mut state = self.state.lock();
        state.check(CommandCode::LoadConfig)?;

        let policy = FilterPolicy::build(buf).map_err(|e| {
            log::warn!("Rejected filter config: {}", e);
            e
        })?;

        if state.policy.replace(Arc::new(policy)).is_some() {
            log::info!("Replaced previous filter config");
        }
        state.lifecycle = LifecycleState::Configured;
        Ok(())
    }

    /// Append raw network-order IPv4 addresses to the installed blocklist.
    ///
    /// Returns the number of addresses appended. When another holder still
    /// shares the policy, the append goes into a private copy that replaces
    /// it on success. Running out of memory discards the policy and returns
    /// the channel to `Uninitialized`.
    pub fn append_blacklist(&self, raw: &[u8]) -> Result<usize, FilterError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check(CommandCode::AppendBlacklist)?;

        let max_bytes = self.options.max_append_bytes;
        let policy = state.policy.as_mut().ok_or(FilterError::NotConfigured)?;
        let result = match Arc::get_mut(policy) {
            Some(owned) => owned.append_ipv4(raw, max_bytes),
            None => policy.try_clone().and_then(|mut copy| {
                let added = copy.append_ipv4(raw, max_bytes)?;
                *policy = Arc::new(copy);
                Ok(added)
            }),
        };
        match result {
            Ok(added) => Ok(added),
            Err(FilterError::OutOfMemory(what)) => {
                log::error!("Out of memory growing {}, discarding filter config", what);
                state.policy = None;
                state.lifecycle = LifecycleState::Uninitialized;
                Err(FilterError::OutOfMemory(what))
            }
            Err(e) => {
                log::warn!("Rejected blocklist append: {}", e);
                Err(e)
            }
        }
    }

    /// Publish the policy to the packet path and register its enabled layers.
    pub fn start(&self) -> Result<(), FilterError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check(CommandCode::Start)?;

        let policy = state.policy.clone().ok_or(FilterError::NotConfigured)?;
        let layers = policy.enabled_layers();

        // Callouts may fire as soon as they are registered.
        self.engine.publish(policy);

        if let Err(e) = state.registry.start(layers, &mut state.platform) {
            self.engine.unpublish();
            log::warn!("Start failed, filter remains stopped: {}", e);
            return Err(e);
        }

        state.lifecycle = LifecycleState::Running;
        log::info!("Filter started on {} layer(s): {:?}", layers.len(), layers);
        Ok(())
    }

    /// Unregister every callout and withdraw the policy from the packet path.
    pub fn stop(&self) -> Result<(), FilterError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check(CommandCode::Stop)?;

        let failures = state.registry.stop(&mut state.platform);
        self.engine.unpublish();
        state.lifecycle = LifecycleState::Configured;

        if failures > 0 {
            log::warn!("Filter stopped with {} unregister failure(s)", failures);
        } else {
            log::info!("Filter stopped");
        }
        Ok(())
    }

    /// Discard the installed policy.
    pub fn flush(&self) -> Result<(), FilterError> {
        let mut state = self.state.lock();
        state.check(CommandCode::Flush)?;

        state.policy = None;
        state.lifecycle = LifecycleState::Uninitialized;
        log::info!("Flushed filter config");
        Ok(())
    }
}

impl<P: CalloutPlatform> Drop for ControlChannel<P> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.lifecycle == LifecycleState::Running {
            state.registry.stop(&mut state.platform);
            self.engine.unpublish();
            log::info!("Filter stopped on channel teardown");
        }
    }
}
