//! Invalidation errors

use roost_realtime::{ChannelError, RealtimeError};

/// Errors raised while binding or running an invalidation consumer
#[derive(Debug, thiserror::Error)]
pub enum InvalidationError {
    /// No authenticated principal could be resolved
    #[error("authentication unavailable: {reason}")]
    AuthenticationUnavailable {
        /// Why resolution failed
        reason: String,
    },

    /// Filter scopes the subscription to a different principal
    #[error("security violation: filter {field}={found} does not match principal {expected}")]
    ScopeMismatch {
        /// Identity column
        field: String,
        /// Resolved principal id
        expected: String,
        /// Value found in the filter
        found: String,
    },

    /// Channel failure reported by the registry
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Registry misuse
    #[error(transparent)]
    Registry(#[from] RealtimeError),
}

impl InvalidationError {
    /// Rejected on security grounds; never retried
    #[inline]
    #[must_use]
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationUnavailable { .. } | Self::ScopeMismatch { .. }
        )
    }

    /// The registry is already retrying the underlying channel
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Channel(err) => err.is_retryable(),
            _ => false,
        }
    }
}
