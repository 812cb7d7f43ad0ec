//! Channels and their subscribers
//!
//! A [`Channel`] is one live transport connection shared by every subscriber
//! of the same [`ChannelKey`](crate::ChannelKey). It only ever exists inside
//! the registry's map.

use crate::batcher::EventBatcher;
use crate::config::RealtimeConfig;
use crate::error::ChannelError;
use crate::event::ChangeEvent;
use crate::provider::{ChannelStatus, ProviderChannel};
use crate::reconnect::RetryState;
use crate::spec::SubscriptionSpec;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::task::AbortHandle;
use ulid::Ulid;

/// Single-use subscriber identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SubscriberId(pub Ulid);

impl SubscriberId {
    /// Generate new subscriber ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ChannelState {
    /// Join handshake in flight
    #[default]
    Connecting,
    /// Joined and delivering events
    Joined,
    /// Last handshake errored
    Errored,
    /// Last handshake timed out
    TimedOut,
    /// Transport closed
    Closed,
}

impl From<ChannelStatus> for ChannelState {
    fn from(status: ChannelStatus) -> Self {
        match status {
            ChannelStatus::Joined => Self::Joined,
            ChannelStatus::TimedOut => Self::TimedOut,
            ChannelStatus::Errored => Self::Errored,
            ChannelStatus::Closed => Self::Closed,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Joined => "joined",
            Self::Errored => "errored",
            Self::TimedOut => "timed_out",
            Self::Closed => "closed",
        })
    }
}

/// Event handler of a subscriber
pub type EventHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Status handler of a subscriber
pub type StatusHandler = Arc<dyn Fn(ChannelState, Option<&ChannelError>) + Send + Sync>;

/// Callback pair registered by [`crate::SubscriptionRegistry::subscribe`]
#[derive(Clone)]
pub struct SubscriberCallbacks {
    pub(crate) on_event: EventHandler,
    pub(crate) on_status_change: Option<StatusHandler>,
}

impl SubscriberCallbacks {
    /// Callbacks with an event handler only
    pub fn new<F>(on_event: F) -> Self
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        Self {
            on_event: Arc::new(on_event),
            on_status_change: None,
        }
    }

    /// With status handler
    #[must_use]
    pub fn with_status_change<F>(mut self, on_status_change: F) -> Self
    where
        F: Fn(ChannelState, Option<&ChannelError>) + Send + Sync + 'static,
    {
        self.on_status_change = Some(Arc::new(on_status_change));
        self
    }
}

impl fmt::Debug for SubscriberCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberCallbacks")
            .field("on_status_change", &self.on_status_change.is_some())
            .finish_non_exhaustive()
    }
}

/// One shared transport connection
pub(crate) struct Channel {
    /// Distinguishes this channel from earlier ones under the same key
    pub(crate) instance: u64,
    pub(crate) spec: SubscriptionSpec,
    pub(crate) transport: Option<Arc<dyn ProviderChannel>>,
    /// Sequence of the current transport; callbacks from older ones are stale
    pub(crate) transport_seq: u64,
    pub(crate) state: ChannelState,
    pub(crate) last_error: Option<ChannelError>,
    pub(crate) permanent: bool,
    pub(crate) subscribers: IndexMap<SubscriberId, SubscriberCallbacks>,
    pub(crate) batcher: EventBatcher,
    pub(crate) flush_timer: Option<AbortHandle>,
    pub(crate) retry: RetryState,
    pub(crate) retry_timer: Option<AbortHandle>,
}

impl Channel {
    pub(crate) fn new(instance: u64, spec: SubscriptionSpec, config: &RealtimeConfig) -> Self {
        Self {
            instance,
            spec,
            transport: None,
            transport_seq: 0,
            state: ChannelState::Connecting,
            last_error: None,
            permanent: false,
            subscribers: IndexMap::new(),
            batcher: EventBatcher::new(config.rate_limit.clone()),
            flush_timer: None,
            retry: RetryState::new(),
            retry_timer: None,
        }
    }

    /// Whether callbacks tagged with `(instance, seq)` belong to this channel
    #[inline]
    pub(crate) fn is_current(&self, instance: u64, seq: u64) -> bool {
        self.instance == instance && self.transport_seq == seq
    }

    pub(crate) fn cancel_flush_timer(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn cancel_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    /// Cancel timers, drop queued events, hand back the transport to release
    pub(crate) fn teardown(mut self) -> Option<Arc<dyn ProviderChannel>> {
        self.cancel_flush_timer();
        self.cancel_retry_timer();
        self.batcher.clear();
        self.subscribers.clear();
        self.transport.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_ids_are_unique() {
        let a = SubscriberId::new();
        let b = SubscriberId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("sub_"));
    }

    #[test]
    fn status_maps_to_state() {
        assert_eq!(ChannelState::from(ChannelStatus::Joined), ChannelState::Joined);
        assert_eq!(ChannelState::from(ChannelStatus::TimedOut), ChannelState::TimedOut);
        assert_eq!(ChannelState::from(ChannelStatus::Closed), ChannelState::Closed);
    }

    #[test]
    fn new_channel_is_connecting_and_empty() {
        let channel = Channel::new(7, SubscriptionSpec::new("messages"), &RealtimeConfig::default());
        assert_eq!(channel.state, ChannelState::Connecting);
        assert!(channel.subscribers.is_empty());
        assert!(channel.is_current(7, 0));
        assert!(!channel.is_current(7, 1));
        assert!(channel.teardown().is_none());
    }
}
