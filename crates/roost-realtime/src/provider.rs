//! Change-stream provider seam
//!
//! The provider is the backing platform's realtime transport. The registry
//! only drives it through these traits; it never reimplements the transport.
//!
//! # Callback contract
//!
//! Providers may invoke change and status callbacks from any task, including
//! synchronously from inside [`ProviderChannel::join`]. Callbacks for one
//! channel must not run concurrently with each other.

use crate::event::ChangeEvent;
use crate::spec::ChangeMatcher;
use std::fmt;
use std::sync::Arc;

/// Callback receiving row-change events
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Callback receiving status transitions
pub type StatusCallback = Arc<dyn Fn(ChannelStatus, Option<ProviderError>) + Send + Sync>;

/// Status values reported by the provider's join handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    /// Joined and delivering events
    Joined,
    /// Handshake timed out
    TimedOut,
    /// Channel errored
    Errored,
    /// Channel closed
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Joined => "SUBSCRIBED",
            Self::TimedOut => "TIMED_OUT",
            Self::Errored => "CHANNEL_ERROR",
            Self::Closed => "CLOSED",
        })
    }
}

/// Error attached to a provider status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    message: String,
}

impl ProviderError {
    /// Error with human-readable message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Human-readable message
    #[inline]
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ProviderError {}

/// One named duplex channel opened on the provider
pub trait ProviderChannel: Send + Sync {
    /// Transport name the channel was opened under
    fn name(&self) -> &str;

    /// Register a listener for row changes matching `matcher`
    fn on_change(&self, matcher: ChangeMatcher, callback: ChangeCallback);

    /// Start the join handshake; status transitions are reported to `callback`
    fn join(&self, callback: StatusCallback);
}

/// The backing platform's realtime client
pub trait ChangeStreamProvider: Send + Sync {
    /// Open a channel under a globally unique `name`
    fn open_channel(&self, name: &str) -> Arc<dyn ProviderChannel>;

    /// Release a channel; no callbacks may be relied upon afterwards
    fn remove_channel(&self, channel: Arc<dyn ProviderChannel>);
}
