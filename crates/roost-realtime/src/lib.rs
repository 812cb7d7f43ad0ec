//! Roost Realtime - shared change-stream subscriptions
//!
//! Many UI components want change notifications for the same rows. This
//! crate collapses those into one provider channel per distinct
//! `(schema, table, event, filter)` and provides:
//! - Reference-counted channels torn down with their last subscriber
//! - Per-channel rate limiting that batches bursts without reordering
//! - Exponential-backoff reconnection with permanent-failure detection
//! - Panic-isolated fan-out to subscriber callbacks
//!
//! The transport itself is abstracted behind [`ChangeStreamProvider`].
//!
//! # Example
//!
//! ```rust,ignore
//! use roost_realtime::prelude::*;
//!
//! # fn example(provider: std::sync::Arc<dyn ChangeStreamProvider>) -> Result<(), RealtimeError> {
//! let registry = SubscriptionRegistry::global();
//! registry.initialize(provider)?;
//!
//! let spec = SubscriptionSpec::new("messages")
//!     .with_event(ChangeKind::Insert)
//!     .with_filter("chat_id=eq.42");
//! let id = registry.subscribe(&spec, SubscriberCallbacks::new(|event| {
//!     println!("new message: {:?}", event.new_row);
//! }))?;
//!
//! registry.unsubscribe(&spec.channel_key(), id);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod batcher;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod provider;
pub mod reconnect;
pub mod registry;
pub mod spec;

pub use batcher::{Admission, EventBatcher};
pub use channel::{ChannelState, EventHandler, StatusHandler, SubscriberCallbacks, SubscriberId};
pub use config::{BackoffPolicy, RateLimitConfig, RealtimeConfig};
pub use error::{ChannelError, RealtimeError};
pub use event::{ChangeEvent, EventSummary};
pub use provider::{
    ChangeCallback, ChangeStreamProvider, ChannelStatus, ProviderChannel, ProviderError,
    StatusCallback,
};
pub use reconnect::{FailureDecision, RetryState};
pub use registry::{ChannelStats, RegistryStats, SubscriptionRegistry};
pub use spec::{ChangeKind, ChangeMatcher, ChannelKey, SubscriptionSpec, UnknownChangeKind};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for subscribing to change streams
    pub use crate::{
        ChangeEvent, ChangeKind, ChangeStreamProvider, ChannelError, ChannelKey, ChannelState,
        RealtimeConfig, RealtimeError, SubscriberCallbacks, SubscriberId, SubscriptionRegistry,
        SubscriptionSpec,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
