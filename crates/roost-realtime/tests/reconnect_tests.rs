//! Reconnection Tests
//!
//! Backoff, retry exhaustion and permanent failures with a paused clock.
//!
use pretty_assertions::assert_eq;
use roost_realtime::prelude::*;
use roost_realtime::{BackoffPolicy, ChannelStatus, ProviderError};
use roost_test_utils::{init_test_tracing, numbered_event, MockProvider, Recorder};
use std::sync::Arc;
use std::time::Duration;

fn setup(provider: &Arc<MockProvider>, config: RealtimeConfig) -> SubscriptionRegistry {
    init_test_tracing();
    SubscriptionRegistry::with_provider(provider.clone(), config).unwrap()
}

fn spec() -> SubscriptionSpec {
    SubscriptionSpec::new("notifications").with_filter("user_id=eq.alice")
}

fn errored(message: &str) -> (ChannelStatus, Option<ProviderError>) {
    (ChannelStatus::Errored, Some(ProviderError::new(message)))
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_retry_with_backoff_until_joined() {
    let provider = MockProvider::new();
    provider.script_joins([
        (ChannelStatus::TimedOut, None),
        (ChannelStatus::TimedOut, None),
        (ChannelStatus::Joined, None),
    ]);
    let registry = setup(&provider, RealtimeConfig::default());
    let recorder = Recorder::new();
    registry.subscribe(&spec(), recorder.callbacks()).unwrap();

    assert_eq!(provider.open_count(), 1);
    assert_eq!(
        recorder.errors(),
        vec![ChannelError::Transient {
            status: ChannelStatus::TimedOut,
            message: "Subscription timeout".into(),
            attempt: 1,
            retry_in: Duration::from_millis(2_000),
        }]
    );

    tokio::time::sleep(Duration::from_millis(1_990)).await;
    assert_eq!(provider.open_count(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(provider.open_count(), 2);
    assert_eq!(provider.removed_count(), 1);
    assert_eq!(registry.stats().channels[0].retry_attempt, 2);

    tokio::time::sleep(Duration::from_millis(3_000)).await;
    assert_eq!(provider.open_count(), 3);
    assert_eq!(provider.live_count(), 1);

    let stats = registry.stats();
    assert_eq!(stats.channels[0].state, ChannelState::Joined);
    assert_eq!(stats.channels[0].retry_attempt, 0);
    assert_eq!(recorder.last_state(), Some(ChannelState::Joined));
}

#[tokio::test(start_paused = true)]
async fn test_retry_delay_counts_from_the_failure() {
    let provider = MockProvider::new();
    provider.script_joins([(ChannelStatus::TimedOut, None)]);
    let registry = setup(&provider, RealtimeConfig::default());
    registry.subscribe(&spec(), SubscriberCallbacks::new(|_| {})).unwrap();

    // Move the clock before the retry task first runs.
    tokio::time::advance(Duration::from_millis(1_500)).await;
    assert_eq!(provider.open_count(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(provider.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retried_channel_delivers_on_new_transport() {
    let provider = MockProvider::new();
    provider.script_joins([errored("socket closed"), (ChannelStatus::Joined, None)]);
    let registry = setup(&provider, RealtimeConfig::default());
    let recorder = Recorder::new();
    registry.subscribe(&spec(), recorder.callbacks()).unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(provider.emit(&spec().matcher(), numbered_event(1)));
    assert_eq!(recorder.numbers(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_go_quiet_and_reset() {
    let provider = MockProvider::new();
    provider.script_joins([errored("socket closed"), errored("socket closed"), errored("socket closed")]);
    let config = RealtimeConfig::default().with_backoff(BackoffPolicy {
        max_retries: 2,
        ..BackoffPolicy::default()
    });
    let registry = setup(&provider, config);
    let recorder = Recorder::new();
    registry.subscribe(&spec(), recorder.callbacks()).unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(provider.open_count(), 3);
    assert_eq!(
        recorder.errors().last(),
        Some(&ChannelError::RetriesExhausted {
            status: ChannelStatus::Errored,
            message: "socket closed".into(),
            attempts: 2,
        })
    );
    let channel = &registry.stats().channels[0];
    assert_eq!(channel.retry_attempt, 0);
    assert_eq!(channel.state, ChannelState::Errored);
    assert!(!channel.permanent);

    registry.reconnect(&spec().channel_key()).unwrap();
    assert_eq!(provider.open_count(), 4);
    provider.join_all();
    assert_eq!(recorder.last_state(), Some(ChannelState::Joined));
}

#[tokio::test(start_paused = true)]
async fn test_every_transient_failure_is_reported() {
    let provider = MockProvider::new();
    provider.script_joins([errored("a"), errored("b"), (ChannelStatus::Joined, None)]);
    let registry = setup(&provider, RealtimeConfig::default());
    let recorder = Recorder::new();
    registry.subscribe(&spec(), recorder.callbacks()).unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;

    let errors = recorder.errors();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(ChannelError::is_retryable));
    assert_eq!(errors[1].message(), "b");
}

#[tokio::test(start_paused = true)]
async fn test_publication_error_is_permanent() {
    let provider = MockProvider::new();
    provider.script_joins([errored("relation \"notifications\" is not in the publication")]);
    let registry = setup(&provider, RealtimeConfig::default());
    let recorder = Recorder::new();
    registry.subscribe(&spec(), recorder.callbacks()).unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(provider.open_count(), 1);
    let channel = &registry.stats().channels[0];
    assert!(channel.permanent);
    assert_eq!(channel.retry_attempt, 0);
    assert!(recorder.errors()[0].is_permanent());

    let result = registry.reconnect(&spec().channel_key());
    assert!(matches!(result, Err(RealtimeError::PermanentChannel(_))));
}

#[tokio::test(start_paused = true)]
async fn test_permanent_channel_ignores_later_status() {
    let provider = MockProvider::new();
    provider.script_joins([errored("replica identity not set")]);
    let registry = setup(&provider, RealtimeConfig::default());
    registry.subscribe(&spec(), SubscriberCallbacks::new(|_| {})).unwrap();

    let name = provider.channel_for(&spec().matcher()).unwrap();
    provider.set_status(&name, ChannelStatus::Joined, None);
    assert_eq!(registry.channel_state(&spec().channel_key()), Some(ChannelState::Errored));

    let late = Recorder::new();
    registry.subscribe(&spec(), late.callbacks()).unwrap();
    assert!(late.errors()[0].is_permanent());
}

#[tokio::test(start_paused = true)]
async fn test_release_cancels_pending_retry() {
    let provider = MockProvider::new();
    provider.script_joins([(ChannelStatus::TimedOut, None)]);
    let registry = setup(&provider, RealtimeConfig::default());
    let id = registry.subscribe(&spec(), SubscriberCallbacks::new(|_| {})).unwrap();

    registry.unsubscribe(&spec().channel_key(), id);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(provider.open_count(), 1);
    assert_eq!(provider.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_join_cancels_pending_retry() {
    let provider = MockProvider::new();
    provider.script_joins([(ChannelStatus::TimedOut, None)]);
    let registry = setup(&provider, RealtimeConfig::default());
    registry.subscribe(&spec(), SubscriberCallbacks::new(|_| {})).unwrap();

    provider.join_all();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(provider.open_count(), 1);
    assert_eq!(registry.channel_state(&spec().channel_key()), Some(ChannelState::Joined));
}

#[tokio::test]
async fn test_reconnect_unknown_channel() {
    let provider = MockProvider::new();
    let registry = setup(&provider, RealtimeConfig::default());
    let result = registry.reconnect(&spec().channel_key());
    assert!(matches!(result, Err(RealtimeError::UnknownChannel(_))));
}
