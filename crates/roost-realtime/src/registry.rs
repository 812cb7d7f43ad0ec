//! Subscription registry
//!
//! Deduplicates logical subscriptions into shared channels, reference-counts
//! their subscribers and tears a channel down the moment its last subscriber
//! leaves.
//!
//! # Locking
//!
//! All registry state sits behind one mutex. It is never held while calling
//! into the provider's `join`, nor while running subscriber callbacks, so
//! both may call back into the registry (including `unsubscribe` from inside
//! an event handler). Every decision about creating or deleting a channel is
//! made synchronously under the lock.
//!
//! # Timers
//!
//! Batch flushes and reconnection backoff run as tokio tasks holding only a
//! weak reference to the registry. Their abort handles live on the channel
//! and are aborted at teardown; a timer that fires anyway re-checks the
//! channel instance before acting.

use crate::batcher::Admission;
use crate::channel::{
    Channel, ChannelState, EventHandler, StatusHandler, SubscriberCallbacks, SubscriberId,
};
use crate::config::RealtimeConfig;
use crate::error::{ChannelError, RealtimeError};
use crate::event::ChangeEvent;
use crate::provider::{
    ChangeCallback, ChangeStreamProvider, ChannelStatus, ProviderChannel, ProviderError,
    StatusCallback,
};
use crate::reconnect::FailureDecision;
use crate::spec::{ChangeKind, ChangeMatcher, ChannelKey, SubscriptionSpec};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;

static GLOBAL: Lazy<SubscriptionRegistry> =
    Lazy::new(|| SubscriptionRegistry::new(RealtimeConfig::default()));

/// Per-channel statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStats {
    /// Canonical key
    pub key: ChannelKey,
    /// Table name
    pub table: String,
    /// Event kind
    pub event: ChangeKind,
    /// Row filter
    pub filter: Option<String>,
    /// Live subscribers
    pub subscriber_count: usize,
    /// Lifecycle state
    pub state: ChannelState,
    /// Retries since the last successful join
    pub retry_attempt: u32,
    /// Events waiting for a flush
    pub queued_events: usize,
    /// Failed permanently; inert
    pub permanent: bool,
    /// Current transport name
    pub transport: Option<String>,
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    /// Live channels
    pub total_channels: usize,
    /// Live subscribers across all channels
    pub total_subscriptions: usize,
    /// Per-channel detail, ordered by key
    pub channels: Vec<ChannelStats>,
}

/// Provider plus the runtime that drives timers
#[derive(Clone)]
struct Backend {
    provider: Arc<dyn ChangeStreamProvider>,
    runtime: Handle,
}

struct Shared {
    config: RealtimeConfig,
    backend: RwLock<Option<Backend>>,
    channels: Mutex<HashMap<ChannelKey, Channel>>,
    next_instance: AtomicU64,
    next_transport: AtomicU64,
}

/// Shared change-stream subscription registry
///
/// Cloning is cheap; clones share the same channels.
///
/// # Example
///
/// ```rust,ignore
/// let registry = SubscriptionRegistry::with_provider(provider, RealtimeConfig::default())?;
/// let spec = SubscriptionSpec::new("messages").with_filter("chat_id=eq.42");
/// let id = registry.subscribe(&spec, SubscriberCallbacks::new(|event| println!("{event:?}")))?;
/// registry.unsubscribe(&spec.channel_key(), id);
/// ```
#[derive(Clone)]
pub struct SubscriptionRegistry {
    shared: Arc<Shared>,
}

impl SubscriptionRegistry {
    /// Create a registry with no provider installed
    #[must_use]
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                backend: RwLock::new(None),
                channels: Mutex::new(HashMap::new()),
                next_instance: AtomicU64::new(1),
                next_transport: AtomicU64::new(1),
            }),
        }
    }

    /// Create and initialize in one step
    ///
    /// # Errors
    /// See [`Self::initialize`]
    pub fn with_provider(
        provider: Arc<dyn ChangeStreamProvider>,
        config: RealtimeConfig,
    ) -> Result<Self, RealtimeError> {
        let registry = Self::new(config);
        registry.initialize(provider)?;
        Ok(registry)
    }

    /// Process-wide registry; still needs [`Self::initialize`]
    #[must_use]
    pub fn global() -> &'static SubscriptionRegistry {
        &GLOBAL
    }

    /// Install the provider; must run inside a tokio runtime
    ///
    /// # Errors
    /// - `RealtimeError::InvalidConfig` if the registry's config is invalid
    /// - `RealtimeError::AlreadyInitialized` on a second call
    /// - `RealtimeError::NoRuntime` outside a tokio runtime
    pub fn initialize(&self, provider: Arc<dyn ChangeStreamProvider>) -> Result<(), RealtimeError> {
        self.shared.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| RealtimeError::NoRuntime)?;
        let mut backend = self.shared.backend.write();
        if backend.is_some() {
            return Err(RealtimeError::AlreadyInitialized);
        }
        *backend = Some(Backend { provider, runtime });
        tracing::debug!("Subscription registry initialized");
        Ok(())
    }

    /// Whether a provider is installed
    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.shared.backend.read().is_some()
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RealtimeConfig {
        &self.shared.config
    }

    /// Canonical key for `spec`
    #[inline]
    #[must_use]
    pub fn channel_key(&self, spec: &SubscriptionSpec) -> ChannelKey {
        spec.channel_key()
    }

    /// Subscribe to the change stream named by `spec`
    ///
    /// Opens a channel on first use of the key; later subscribers share it
    /// and immediately receive its current state through their status
    /// handler.
    ///
    /// # Errors
    /// `RealtimeError::NotInitialized` if no provider is installed
    pub fn subscribe(
        &self,
        spec: &SubscriptionSpec,
        callbacks: SubscriberCallbacks,
    ) -> Result<SubscriberId, RealtimeError> {
        let backend = self.shared.backend().ok_or_else(|| {
            tracing::error!("subscribe called before the registry was initialized");
            RealtimeError::NotInitialized
        })?;

        let key = spec.channel_key();
        let id = SubscriberId::new();
        let mut channels = self.shared.channels.lock();

        if let Some(channel) = channels.get_mut(&key) {
            channel.subscribers.insert(id, callbacks.clone());
            let state = channel.state;
            let error = channel.last_error.clone();
            let count = channel.subscribers.len();
            drop(channels);

            tracing::debug!("Subscriber {} joined channel {} ({} subscribers)", id, key, count);
            if let Some(on_status) = callbacks.on_status_change {
                invoke_guarded(&key, || on_status(state, error.as_ref()));
            }
            return Ok(id);
        }

        let instance = self.shared.next_instance.fetch_add(1, Ordering::Relaxed);
        let mut channel = Channel::new(instance, spec.clone(), &self.shared.config);
        channel.subscribers.insert(id, callbacks);
        channels.insert(key.clone(), channel);
        drop(channels);

        tracing::debug!("Subscriber {} opened channel {}", id, key);
        self.shared.connect(&backend, &key, instance, spec.matcher());
        Ok(id)
    }

    /// Remove a subscriber; releases the channel with its last subscriber
    ///
    /// Idempotent: unknown keys and ids are ignored. No callback of this
    /// subscriber runs after this returns.
    pub fn unsubscribe(&self, key: &ChannelKey, id: SubscriberId) {
        let released = {
            let mut channels = self.shared.channels.lock();
            let Some(channel) = channels.get_mut(key) else {
                return;
            };
            if channel.subscribers.shift_remove(&id).is_none() {
                return;
            }
            if !channel.subscribers.is_empty() {
                tracing::debug!(
                    "Subscriber {} left channel {} ({} remaining)",
                    id,
                    key,
                    channel.subscribers.len()
                );
                return;
            }
            channels.remove(key).and_then(Channel::teardown)
        };

        tracing::debug!("Channel {} released by last subscriber {}", key, id);
        if let (Some(transport), Some(backend)) = (released, self.shared.backend()) {
            backend.provider.remove_channel(transport);
        }
    }

    /// Re-run the handshake for a channel left inert by exhausted retries
    ///
    /// # Errors
    /// - `RealtimeError::NotInitialized` if no provider is installed
    /// - `RealtimeError::UnknownChannel` if no channel has this key
    /// - `RealtimeError::PermanentChannel` if the channel failed permanently
    pub fn reconnect(&self, key: &ChannelKey) -> Result<(), RealtimeError> {
        let backend = self.shared.backend().ok_or(RealtimeError::NotInitialized)?;
        let (instance, matcher) = {
            let mut channels = self.shared.channels.lock();
            let channel = channels
                .get_mut(key)
                .ok_or_else(|| RealtimeError::UnknownChannel(key.clone()))?;
            if channel.permanent {
                return Err(RealtimeError::PermanentChannel(key.clone()));
            }
            channel.cancel_retry_timer();
            channel.retry.reset();
            (channel.instance, channel.spec.matcher())
        };

        tracing::info!("Manual reconnect of channel {}", key);
        self.shared.connect(&backend, key, instance, matcher);
        Ok(())
    }

    /// Whether a channel exists for `key`
    #[must_use]
    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.shared.channels.lock().contains_key(key)
    }

    /// Current state of the channel for `key`
    #[must_use]
    pub fn channel_state(&self, key: &ChannelKey) -> Option<ChannelState> {
        self.shared.channels.lock().get(key).map(|c| c.state)
    }

    /// Snapshot of all channels
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let channels = self.shared.channels.lock();
        let mut per_channel: Vec<ChannelStats> = channels
            .iter()
            .map(|(key, channel)| ChannelStats {
                key: key.clone(),
                table: channel.spec.table().to_string(),
                event: channel.spec.event(),
                filter: channel.spec.filter().map(str::to_string),
                subscriber_count: channel.subscribers.len(),
                state: channel.state,
                retry_attempt: channel.retry.attempt(),
                queued_events: channel.batcher.queued(),
                permanent: channel.permanent,
                transport: channel.transport.as_ref().map(|t| t.name().to_string()),
            })
            .collect();
        drop(channels);

        per_channel.sort_by(|a, b| a.key.cmp(&b.key));
        RegistryStats {
            total_channels: per_channel.len(),
            total_subscriptions: per_channel.iter().map(|c| c.subscriber_count).sum(),
            channels: per_channel,
        }
    }

    /// Tear down every channel
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("initialized", &self.is_initialized())
            .field("channels", &self.shared.channels.lock().len())
            .finish()
    }
}

enum Delivery {
    Nothing,
    Events(Vec<ChangeEvent>),
}

impl Shared {
    fn backend(&self) -> Option<Backend> {
        self.backend.read().clone()
    }

    /// Open a fresh transport for the channel and start its join handshake
    fn connect(self: &Arc<Self>, backend: &Backend, key: &ChannelKey, instance: u64, matcher: ChangeMatcher) {
        let seq = self.next_transport.fetch_add(1, Ordering::Relaxed);
        let name = format!("shared-{}-{}", key.sanitized(), seq);
        let transport = backend.provider.open_channel(&name);
        transport.on_change(matcher, self.change_callback(key, instance, seq));

        let installed = {
            let mut channels = self.channels.lock();
            channels
                .get_mut(key)
                .filter(|c| c.instance == instance)
                .map(|channel| {
                    channel.transport_seq = seq;
                    channel.state = ChannelState::Connecting;
                    channel.transport.replace(Arc::clone(&transport))
                })
        };

        // Released while the transport was being opened.
        let Some(previous) = installed else {
            backend.provider.remove_channel(transport);
            return;
        };
        if let Some(previous) = previous {
            backend.provider.remove_channel(previous);
        }

        tracing::debug!("Joining channel {} as {}", key, name);
        transport.join(self.status_callback(key, instance, seq));
    }

    fn change_callback(self: &Arc<Self>, key: &ChannelKey, instance: u64, seq: u64) -> ChangeCallback {
        let weak = Arc::downgrade(self);
        let key = key.clone();
        Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_event(&key, instance, seq, event);
            }
        })
    }

    fn status_callback(self: &Arc<Self>, key: &ChannelKey, instance: u64, seq: u64) -> StatusCallback {
        let weak = Arc::downgrade(self);
        let key = key.clone();
        Arc::new(move |status, error| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_status(&key, instance, seq, status, error);
            }
        })
    }

    fn handle_event(self: &Arc<Self>, key: &ChannelKey, instance: u64, seq: u64, event: ChangeEvent) {
        let Some(backend) = self.backend() else {
            return;
        };
        let now = Instant::now();

        let delivery = {
            let mut channels = self.channels.lock();
            let Some(channel) = channels.get_mut(key).filter(|c| c.is_current(instance, seq)) else {
                return;
            };
            tracing::trace!(summary = ?event.summary(), "Change event on channel {}", key);
            if !channel.spec.event().matches(event.event_type) {
                tracing::debug!("Dropping {} event on channel {}", event.event_type, key);
                return;
            }

            match channel.batcher.admit(now, event) {
                Admission::Deliver(event) => Delivery::Events(vec![event]),
                Admission::FlushNow => {
                    channel.cancel_flush_timer();
                    let batch = channel.batcher.drain(now);
                    if channel.batcher.has_queued() {
                        self.arm_flush(&backend, key, channel);
                    }
                    tracing::debug!("Forced flush of {} events on channel {}", batch.len(), key);
                    Delivery::Events(batch)
                }
                Admission::ScheduleFlush => {
                    self.arm_flush(&backend, key, channel);
                    Delivery::Nothing
                }
                Admission::Queued => Delivery::Nothing,
            }
        };

        if let Delivery::Events(events) = delivery {
            self.deliver(key, instance, &events);
        }
    }

    fn arm_flush(self: &Arc<Self>, backend: &Backend, key: &ChannelKey, channel: &mut Channel) {
        let weak = Arc::downgrade(self);
        let key = key.clone();
        let instance = channel.instance;
        let deadline = Instant::now() + channel.batcher.config().batch_window();

        let task = backend.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                shared.flush(&key, instance);
            }
        });

        channel.cancel_flush_timer();
        channel.flush_timer = Some(task.abort_handle());
        channel.batcher.mark_flush_pending();
    }

    fn flush(self: &Arc<Self>, key: &ChannelKey, instance: u64) {
        let Some(backend) = self.backend() else {
            return;
        };

        let batch = {
            let mut channels = self.channels.lock();
            let Some(channel) = channels.get_mut(key).filter(|c| c.instance == instance) else {
                return;
            };
            channel.flush_timer = None;
            let batch = channel.batcher.drain(Instant::now());
            if channel.batcher.has_queued() {
                self.arm_flush(&backend, key, channel);
            }
            batch
        };

        if !batch.is_empty() {
            tracing::debug!("Flushing {} batched events on channel {}", batch.len(), key);
            self.deliver(key, instance, &batch);
        }
    }

    /// Fan events out in order; membership is re-checked before every call
    fn deliver(&self, key: &ChannelKey, instance: u64, events: &[ChangeEvent]) {
        for event in events {
            let Some(ids) = self.subscriber_ids(key, instance) else {
                return;
            };
            for id in ids {
                let handler: Option<EventHandler> = {
                    let channels = self.channels.lock();
                    channels
                        .get(key)
                        .filter(|c| c.instance == instance)
                        .and_then(|c| c.subscribers.get(&id))
                        .map(|cb| Arc::clone(&cb.on_event))
                };
                if let Some(handler) = handler {
                    invoke_guarded(key, || handler(event));
                }
            }
        }
    }

    fn subscriber_ids(&self, key: &ChannelKey, instance: u64) -> Option<Vec<SubscriberId>> {
        let channels = self.channels.lock();
        channels
            .get(key)
            .filter(|c| c.instance == instance)
            .map(|c| c.subscribers.keys().copied().collect())
    }

    fn handle_status(
        self: &Arc<Self>,
        key: &ChannelKey,
        instance: u64,
        seq: u64,
        status: ChannelStatus,
        error: Option<ProviderError>,
    ) {
        let Some(backend) = self.backend() else {
            return;
        };

        let (state, report) = {
            let mut channels = self.channels.lock();
            let Some(channel) = channels.get_mut(key).filter(|c| c.is_current(instance, seq)) else {
                return;
            };
            if channel.permanent {
                return;
            }

            let report = match status {
                ChannelStatus::Joined => {
                    channel.state = ChannelState::Joined;
                    channel.retry.reset();
                    channel.cancel_retry_timer();
                    tracing::info!("Channel {} joined", key);
                    None
                }
                ChannelStatus::TimedOut | ChannelStatus::Errored => {
                    channel.state = status.into();
                    if let Some(err) = error.as_ref().filter(|e| self.config.is_auth_error(e.message())) {
                        tracing::error!("Authentication error on channel {}: {}", key, err);
                    }
                    Some(self.on_failure(&backend, key, channel, status, error.as_ref()))
                }
                ChannelStatus::Closed => {
                    channel.state = ChannelState::Closed;
                    tracing::debug!("Channel {} closed", key);
                    None
                }
            };
            channel.last_error.clone_from(&report);
            (channel.state, report)
        };

        self.notify_status(key, instance, state, report.as_ref());
    }

    fn on_failure(
        self: &Arc<Self>,
        backend: &Backend,
        key: &ChannelKey,
        channel: &mut Channel,
        status: ChannelStatus,
        error: Option<&ProviderError>,
    ) -> ChannelError {
        match channel.retry.on_failure(status, error, &self.config) {
            FailureDecision::Permanent(err) => {
                channel.permanent = true;
                channel.cancel_retry_timer();
                tracing::error!("Channel {} failed permanently, not retrying: {}", key, err.message());
                err
            }
            FailureDecision::Retry { delay, error: err } => {
                tracing::warn!(
                    "Channel {} {}; retry {}/{} in {:?}",
                    key,
                    status,
                    channel.retry.attempt(),
                    self.config.backoff.max_retries,
                    delay
                );
                self.arm_retry(backend, key, channel, delay);
                err
            }
            FailureDecision::Exhausted(err) => {
                channel.cancel_retry_timer();
                tracing::error!("Channel {} gave up reconnecting: {}", key, err);
                err
            }
        }
    }

    fn arm_retry(self: &Arc<Self>, backend: &Backend, key: &ChannelKey, channel: &mut Channel, delay: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let key = key.clone();
        let instance = channel.instance;
        let deadline = Instant::now() + delay;

        let task = backend.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                shared.retry(&key, instance);
            }
        });

        channel.cancel_retry_timer();
        channel.retry_timer = Some(task.abort_handle());
    }

    fn retry(self: &Arc<Self>, key: &ChannelKey, instance: u64) {
        let Some(backend) = self.backend() else {
            return;
        };
        let matcher = {
            let mut channels = self.channels.lock();
            let Some(channel) = channels.get_mut(key).filter(|c| c.instance == instance) else {
                return;
            };
            if channel.permanent {
                return;
            }
            channel.retry_timer = None;
            tracing::info!(
                "Retrying channel {} (attempt {}/{})",
                key,
                channel.retry.attempt(),
                self.config.backoff.max_retries
            );
            channel.spec.matcher()
        };
        self.connect(&backend, key, instance, matcher);
    }

    /// Notify status handlers in registration order
    fn notify_status(&self, key: &ChannelKey, instance: u64, state: ChannelState, error: Option<&ChannelError>) {
        let Some(ids) = self.subscriber_ids(key, instance) else {
            return;
        };
        for id in ids {
            let handler: Option<StatusHandler> = {
                let channels = self.channels.lock();
                channels
                    .get(key)
                    .filter(|c| c.instance == instance)
                    .and_then(|c| c.subscribers.get(&id))
                    .and_then(|cb| cb.on_status_change.clone())
            };
            if let Some(handler) = handler {
                invoke_guarded(key, || handler(state, error));
            }
        }
    }

    fn shutdown(&self) {
        let released: Vec<Arc<dyn ProviderChannel>> = {
            let mut channels = self.channels.lock();
            channels
                .drain()
                .filter_map(|(_, channel)| channel.teardown())
                .collect()
        };
        if released.is_empty() {
            return;
        }

        tracing::debug!("Releasing {} channels on shutdown", released.len());
        if let Some(backend) = self.backend() {
            for transport in released {
                backend.provider.remove_channel(transport);
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run a subscriber callback; a panic is logged, not propagated
fn invoke_guarded<F: FnOnce()>(key: &ChannelKey, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!("Subscriber callback panicked on channel {}", key);
    }
}
