//! Error types for the realtime layer
//!
//! Two families:
//! - [`RealtimeError`]: misuse of the registry or bad configuration,
//!   returned from calls
//! - [`ChannelError`]: channel failures, reported to subscribers through
//!   their status callback

use crate::provider::ChannelStatus;
use crate::spec::ChannelKey;
use std::path::PathBuf;
use std::time::Duration;

/// Registry and configuration errors
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// Registry used before a provider was installed
    #[error("subscription registry not initialized: call initialize() first")]
    NotInitialized,

    /// Provider installed twice
    #[error("subscription registry already initialized")]
    AlreadyInitialized,

    /// No tokio runtime to drive batch and retry timers
    #[error("no tokio runtime available for realtime timers")]
    NoRuntime,

    /// Channel not present in the registry
    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelKey),

    /// Channel failed permanently and will not reconnect
    #[error("channel {0} failed permanently")]
    PermanentChannel(ChannelKey),

    /// Configuration value out of range
    #[error("invalid realtime configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("failed to parse realtime configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration file could not be read
    #[error("failed to read realtime configuration {path}: {source}")]
    ConfigIo {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl RealtimeError {
    /// Programming errors: fail fast, never retry
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized | Self::AlreadyInitialized | Self::NoRuntime
        )
    }
}

/// Channel failure reported to subscribers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Stream source not configured for change notification; terminal
    #[error("permanent channel error: {message}")]
    Permanent {
        /// Provider message
        message: String,
    },

    /// Network or handshake failure; a retry is scheduled
    #[error("transient channel error ({status}), retry {attempt} in {retry_in:?}: {message}")]
    Transient {
        /// Status that triggered the failure
        status: ChannelStatus,
        /// Provider message
        message: String,
        /// Retry number about to run (1-based)
        attempt: u32,
        /// Delay before the retry
        retry_in: Duration,
    },

    /// Transient failures exceeded the retry budget
    #[error("channel error after {attempts} retries: {message}")]
    RetriesExhausted {
        /// Status that triggered the final failure
        status: ChannelStatus,
        /// Provider message
        message: String,
        /// Retries performed
        attempts: u32,
    },
}

impl ChannelError {
    /// Whether the registry is still retrying
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether the channel will never recover on its own
    #[inline]
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }

    /// Provider message
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Permanent { message }
            | Self::Transient { message, .. }
            | Self::RetriesExhausted { message, .. } => message,
        }
    }
}
