//! Reconnection controller
//!
//! Classifies channel failures and computes the retry schedule. Timers live
//! in the registry; this module only decides.

use crate::config::RealtimeConfig;
use crate::error::ChannelError;
use crate::provider::{ChannelStatus, ProviderError};
use std::time::Duration;

/// Outcome of a failed join
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// Source not configured for change notification; never retry
    Permanent(ChannelError),
    /// Re-run the handshake after `delay`
    Retry {
        /// Backoff delay
        delay: Duration,
        /// Error to report to subscribers
        error: ChannelError,
    },
    /// Retry budget spent; attempt counter has been reset
    Exhausted(ChannelError),
}

/// Per-channel retry counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
}

impl RetryState {
    /// Fresh state
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries performed since the last successful join
    #[inline]
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Channel joined: start over
    #[inline]
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Decide what to do after `status` with optional provider `error`
    pub fn on_failure(
        &mut self,
        status: ChannelStatus,
        error: Option<&ProviderError>,
        config: &RealtimeConfig,
    ) -> FailureDecision {
        let message = failure_message(status, error);

        if config.is_permanent_error(&message) {
            return FailureDecision::Permanent(ChannelError::Permanent { message });
        }

        if config.backoff.should_retry(self.attempt) {
            let delay = config.backoff.delay_for_attempt(self.attempt);
            self.attempt += 1;
            return FailureDecision::Retry {
                delay,
                error: ChannelError::Transient {
                    status,
                    message,
                    attempt: self.attempt,
                    retry_in: delay,
                },
            };
        }

        let attempts = self.attempt;
        self.attempt = 0;
        FailureDecision::Exhausted(ChannelError::RetriesExhausted {
            status,
            message,
            attempts,
        })
    }
}

/// Human-readable message for a failed status
#[must_use]
pub fn failure_message(status: ChannelStatus, error: Option<&ProviderError>) -> String {
    match (status, error) {
        (_, Some(err)) if !err.message().is_empty() => err.message().to_string(),
        (ChannelStatus::TimedOut, _) => "Subscription timeout".to_string(),
        (ChannelStatus::Closed, _) => "Channel closed".to_string(),
        _ => "Channel error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffPolicy;

    fn config_with_retries(max_retries: u32) -> RealtimeConfig {
        RealtimeConfig::default().with_backoff(BackoffPolicy {
            max_retries,
            ..BackoffPolicy::default()
        })
    }

    #[test]
    fn publication_error_is_permanent_and_does_not_count() {
        let config = RealtimeConfig::default();
        let mut state = RetryState::new();
        let err = ProviderError::new("relation is not part of any publication");

        for _ in 0..3 {
            let decision = state.on_failure(ChannelStatus::Errored, Some(&err), &config);
            assert!(matches!(decision, FailureDecision::Permanent(_)));
        }
        assert_eq!(state.attempt(), 0);
    }

    #[test]
    fn transient_errors_back_off() {
        let config = RealtimeConfig::default();
        let mut state = RetryState::new();

        let first = state.on_failure(ChannelStatus::TimedOut, None, &config);
        let second = state.on_failure(ChannelStatus::TimedOut, None, &config);

        assert_eq!(
            first,
            FailureDecision::Retry {
                delay: Duration::from_secs(2),
                error: ChannelError::Transient {
                    status: ChannelStatus::TimedOut,
                    message: "Subscription timeout".into(),
                    attempt: 1,
                    retry_in: Duration::from_secs(2),
                },
            }
        );
        assert!(matches!(
            second,
            FailureDecision::Retry { delay, .. } if delay == Duration::from_secs(3)
        ));
        assert_eq!(state.attempt(), 2);
    }

    #[test]
    fn exhaustion_resets_attempt() {
        let config = config_with_retries(2);
        let mut state = RetryState::new();
        let err = ProviderError::new("socket closed");

        state.on_failure(ChannelStatus::Errored, Some(&err), &config);
        state.on_failure(ChannelStatus::Errored, Some(&err), &config);
        let decision = state.on_failure(ChannelStatus::Errored, Some(&err), &config);

        assert_eq!(
            decision,
            FailureDecision::Exhausted(ChannelError::RetriesExhausted {
                status: ChannelStatus::Errored,
                message: "socket closed".into(),
                attempts: 2,
            })
        );
        assert_eq!(state.attempt(), 0);
    }

    #[test]
    fn reset_on_join() {
        let config = RealtimeConfig::default();
        let mut state = RetryState::new();
        state.on_failure(ChannelStatus::Errored, None, &config);
        state.reset();
        assert_eq!(state.attempt(), 0);
    }

    #[test]
    fn failure_messages() {
        assert_eq!(failure_message(ChannelStatus::TimedOut, None), "Subscription timeout");
        assert_eq!(failure_message(ChannelStatus::Errored, None), "Channel error");
        assert_eq!(
            failure_message(ChannelStatus::Errored, Some(&ProviderError::new(""))),
            "Channel error"
        );
        assert_eq!(
            failure_message(ChannelStatus::Errored, Some(&ProviderError::new("boom"))),
            "boom"
        );
    }
}
