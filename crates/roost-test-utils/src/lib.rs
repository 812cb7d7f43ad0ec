//! Testing utilities for the Roost realtime workspace
//!
//! Shared test helpers, a scriptable in-memory change-stream provider and
//! fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use roost_invalidation::{CacheInvalidator, InvalidationTarget, Principal, PrincipalResolver};
use roost_realtime::{
    ChangeCallback, ChangeEvent, ChangeMatcher, ChangeStreamProvider, ChannelError, ChannelState,
    ChannelStatus, ProviderChannel, ProviderError, RealtimeConfig, StatusCallback,
    SubscriberCallbacks,
};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Install a tracing subscriber writing to the test harness; `RUST_LOG` wins
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// How [`MockProvider`] answers a join with nothing scripted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinBehavior {
    /// Stay connecting until the test calls [`MockProvider::set_status`]
    #[default]
    Manual,
    /// Report `Joined` synchronously from inside `join`
    Immediate,
}

#[derive(Default)]
struct LiveChannel {
    matcher: Option<ChangeMatcher>,
    on_change: Option<ChangeCallback>,
    on_status: Option<StatusCallback>,
}

#[derive(Default)]
struct MockState {
    opened: Vec<String>,
    removed: Vec<String>,
    live: BTreeMap<String, LiveChannel>,
    join_script: VecDeque<(ChannelStatus, Option<ProviderError>)>,
    joins: usize,
}

/// In-memory provider recording every transport call
///
/// Callbacks are always invoked with the mock's lock released, so the
/// registry may call back into the provider from inside them.
#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
    behavior: JoinBehavior,
}

impl MockProvider {
    /// Provider whose joins stay pending
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Provider that joins every channel immediately
    pub fn immediate() -> Arc<Self> {
        Arc::new(Self {
            behavior: JoinBehavior::Immediate,
            ..Self::default()
        })
    }

    /// Answer the next joins with these statuses, in order
    pub fn script_joins<I>(&self, statuses: I)
    where
        I: IntoIterator<Item = (ChannelStatus, Option<ProviderError>)>,
    {
        self.state.lock().join_script.extend(statuses);
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opened.len()
    }

    pub fn opened_names(&self) -> Vec<String> {
        self.state.lock().opened.clone()
    }

    pub fn removed_count(&self) -> usize {
        self.state.lock().removed.len()
    }

    pub fn removed_names(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn live_names(&self) -> Vec<String> {
        self.state.lock().live.keys().cloned().collect()
    }

    pub fn join_count(&self) -> usize {
        self.state.lock().joins
    }

    /// Name of the live channel listening with `matcher`
    pub fn channel_for(&self, matcher: &ChangeMatcher) -> Option<String> {
        self.state
            .lock()
            .live
            .iter()
            .filter(|(_, live)| live.matcher.as_ref() == Some(matcher))
            .map(|(name, _)| name.clone())
            .last()
    }

    /// Deliver `event` to the live channel listening with `matcher`
    pub fn emit(&self, matcher: &ChangeMatcher, event: ChangeEvent) -> bool {
        match self.channel_for(matcher) {
            Some(name) => self.emit_to(&name, event),
            None => false,
        }
    }

    /// Deliver `event` on the named channel
    pub fn emit_to(&self, name: &str, event: ChangeEvent) -> bool {
        let callback = self
            .state
            .lock()
            .live
            .get(name)
            .and_then(|live| live.on_change.clone());
        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }

    /// Report a status on the named channel
    pub fn set_status(&self, name: &str, status: ChannelStatus, error: Option<ProviderError>) -> bool {
        let callback = self
            .state
            .lock()
            .live
            .get(name)
            .and_then(|live| live.on_status.clone());
        match callback {
            Some(callback) => {
                callback(status, error);
                true
            }
            None => false,
        }
    }

    /// Report `Joined` on every live channel
    pub fn join_all(&self) {
        for name in self.live_names() {
            self.set_status(&name, ChannelStatus::Joined, None);
        }
    }
}

impl ChangeStreamProvider for MockProvider {
    fn open_channel(&self, name: &str) -> Arc<dyn ProviderChannel> {
        let mut state = self.state.lock();
        state.opened.push(name.to_string());
        state.live.insert(name.to_string(), LiveChannel::default());
        Arc::new(MockChannel {
            name: name.to_string(),
            state: Arc::clone(&self.state),
            behavior: self.behavior,
        })
    }

    fn remove_channel(&self, channel: Arc<dyn ProviderChannel>) {
        let mut state = self.state.lock();
        state.live.remove(channel.name());
        state.removed.push(channel.name().to_string());
    }
}

/// Channel handle handed out by [`MockProvider`]
pub struct MockChannel {
    name: String,
    state: Arc<Mutex<MockState>>,
    behavior: JoinBehavior,
}

impl ProviderChannel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_change(&self, matcher: ChangeMatcher, callback: ChangeCallback) {
        if let Some(live) = self.state.lock().live.get_mut(&self.name) {
            live.matcher = Some(matcher);
            live.on_change = Some(callback);
        }
    }

    fn join(&self, callback: StatusCallback) {
        let scripted = {
            let mut state = self.state.lock();
            state.joins += 1;
            if let Some(live) = state.live.get_mut(&self.name) {
                live.on_status = Some(Arc::clone(&callback));
            }
            state.join_script.pop_front()
        };

        match (scripted, self.behavior) {
            (Some((status, error)), _) => callback(status, error),
            (None, JoinBehavior::Immediate) => callback(ChannelStatus::Joined, None),
            (None, JoinBehavior::Manual) => {}
        }
    }
}

/// Records what one subscriber observes
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
    statuses: Arc<Mutex<Vec<(ChannelState, Option<ChannelError>)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callbacks feeding this recorder
    pub fn callbacks(&self) -> SubscriberCallbacks {
        let events = Arc::clone(&self.events);
        let statuses = Arc::clone(&self.statuses);
        SubscriberCallbacks::new(move |event| events.lock().push(event.clone()))
            .with_status_change(move |state, error| statuses.lock().push((state, error.cloned())))
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    /// Numbers of events built with [`numbered_event`], in delivery order
    pub fn numbers(&self) -> Vec<u64> {
        self.events.lock().iter().filter_map(event_number).collect()
    }

    pub fn statuses(&self) -> Vec<(ChannelState, Option<ChannelError>)> {
        self.statuses.lock().clone()
    }

    pub fn last_state(&self) -> Option<ChannelState> {
        self.statuses.lock().last().map(|(state, _)| *state)
    }

    pub fn errors(&self) -> Vec<ChannelError> {
        self.statuses
            .lock()
            .iter()
            .filter_map(|(_, error)| error.clone())
            .collect()
    }
}

/// Resolves to a fixed principal
pub struct StaticPrincipal(pub Principal);

impl StaticPrincipal {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self(Principal::new(id)))
    }
}

#[async_trait]
impl PrincipalResolver for StaticPrincipal {
    async fn resolve(&self) -> Result<Principal, String> {
        Ok(self.0.clone())
    }
}

/// Never resolves a principal
pub struct FailingResolver(pub String);

impl FailingResolver {
    pub fn new(reason: &str) -> Arc<Self> {
        Arc::new(Self(reason.to_string()))
    }
}

#[async_trait]
impl PrincipalResolver for FailingResolver {
    async fn resolve(&self) -> Result<Principal, String> {
        Err(self.0.clone())
    }
}

/// Records every invalidation target
#[derive(Default)]
pub struct RecordingInvalidator {
    targets: Mutex<Vec<InvalidationTarget>>,
}

impl RecordingInvalidator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn targets(&self) -> Vec<InvalidationTarget> {
        self.targets.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.targets.lock().len()
    }
}

impl CacheInvalidator for RecordingInvalidator {
    fn invalidate(&self, target: &InvalidationTarget) {
        self.targets.lock().push(target.clone());
    }
}

/// Insert event carrying `{"n": n}`
pub fn numbered_event(n: u64) -> ChangeEvent {
    ChangeEvent::insert(json!({ "n": n }))
}

/// Number carried by a [`numbered_event`]
pub fn event_number(event: &ChangeEvent) -> Option<u64> {
    event.new_row.as_ref().and_then(|row| row["n"].as_u64())
}

/// Default configuration
pub fn test_config() -> RealtimeConfig {
    RealtimeConfig::default()
}
