//! Invalidation consumer
//!
//! Binds one logical subscription to a scope (a screen, a component, a
//! request handler). On `enter` it resolves the principal, proves the row
//! filter stays within that principal's rows and subscribes through the
//! shared registry. Every delivered event invalidates the configured query
//! key. `exit`, or dropping the consumer, releases the subscription.
//!
//! # Example
//!
//! ```rust,ignore
//! let consumer = InvalidationConsumer::new(registry, resolver, Arc::new(cache.clone()))
//!     .on_error(|err| eprintln!("realtime: {err}"));
//!
//! let options = InvalidationOptions::new("messages", QueryKey::new(["chats"]))
//!     .with_event(ChangeKind::Insert)
//!     .with_required_identity("user_id");
//! consumer.enter(options).await?;
//! ```

use crate::cache::{CacheInvalidator, InvalidationTarget, QueryKey};
use crate::error::InvalidationError;
use crate::principal::PrincipalResolver;
use crate::scope::enforce_scope;
use parking_lot::Mutex;
use roost_realtime::{
    ChangeKind, ChannelKey, SubscriberCallbacks, SubscriberId, SubscriptionRegistry,
    SubscriptionSpec,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Called with the target before the cache is invalidated
pub type InvalidateHook = Arc<dyn Fn(&InvalidationTarget) + Send + Sync>;

/// Called with every error the consumer observes
pub type ErrorHook = Arc<dyn Fn(&InvalidationError) + Send + Sync>;

/// What to subscribe to and what to invalidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationOptions {
    /// Schema; the registry default when unset
    #[serde(default)]
    pub schema: Option<String>,
    /// Table
    pub table: String,
    /// Event kind
    #[serde(default)]
    pub event: ChangeKind,
    /// Row filter (`column=op.value`)
    #[serde(default)]
    pub filter: Option<String>,
    /// Column that must be pinned to the principal; `user_id` is still
    /// checked when unset
    #[serde(default)]
    pub required_identity_field: Option<String>,
    /// Prefix of the cache entries to invalidate
    pub query_key: QueryKey,
    /// Disabled options open nothing
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl InvalidationOptions {
    /// Options for `table`, invalidating `query_key` on any change
    pub fn new(table: impl Into<String>, query_key: QueryKey) -> Self {
        Self {
            schema: None,
            table: table.into(),
            event: ChangeKind::Any,
            filter: None,
            required_identity_field: None,
            query_key,
            enabled: true,
        }
    }

    /// With schema
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// With event kind
    #[must_use]
    pub fn with_event(mut self, event: ChangeKind) -> Self {
        self.event = event;
        self
    }

    /// With row filter
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Require `field` to be pinned to the principal
    #[must_use]
    pub fn with_required_identity(mut self, field: impl Into<String>) -> Self {
        self.required_identity_field = Some(field.into());
        self
    }

    /// Enable or disable
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn spec(&self, default_schema: &str, filter: Option<String>) -> SubscriptionSpec {
        let schema = self.schema.as_deref().unwrap_or(default_schema);
        let mut spec = SubscriptionSpec::new(self.table.clone())
            .with_schema(schema)
            .with_event(self.event);
        if let Some(filter) = filter {
            spec = spec.with_filter(filter);
        }
        spec
    }
}

#[derive(Debug)]
struct Binding {
    key: ChannelKey,
    id: SubscriberId,
}

/// Scope-bound cache invalidation subscription
pub struct InvalidationConsumer {
    registry: SubscriptionRegistry,
    resolver: Arc<dyn PrincipalResolver>,
    invalidator: Arc<dyn CacheInvalidator>,
    on_invalidate: Option<InvalidateHook>,
    on_error: Option<ErrorHook>,
    binding: Mutex<Option<Binding>>,
    /// Bumped by every enter and exit; a stale enter must not bind
    generation: AtomicU64,
}

impl InvalidationConsumer {
    /// Create consumer
    #[must_use]
    pub fn new(
        registry: SubscriptionRegistry,
        resolver: Arc<dyn PrincipalResolver>,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            registry,
            resolver,
            invalidator,
            on_invalidate: None,
            on_error: None,
            binding: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `hook` before each invalidation
    #[must_use]
    pub fn on_invalidate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&InvalidationTarget) + Send + Sync + 'static,
    {
        self.on_invalidate = Some(Arc::new(hook));
        self
    }

    /// Report errors to `hook`
    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&InvalidationError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Bind to `options`, replacing any previous subscription
    ///
    /// Returns the channel key subscribed to, or `None` when the options are
    /// disabled or a later `enter`/`exit` superseded this call.
    ///
    /// # Errors
    /// - `InvalidationError::AuthenticationUnavailable` if no principal resolves
    /// - `InvalidationError::ScopeMismatch` if the filter escapes the principal
    /// - `InvalidationError::Registry` if the registry rejects the subscription
    ///
    /// No provider channel is opened on error.
    pub async fn enter(
        &self,
        options: InvalidationOptions,
    ) -> Result<Option<ChannelKey>, InvalidationError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.release();

        if !options.enabled {
            tracing::debug!("Invalidation for {} disabled", options.table);
            return Ok(None);
        }

        let principal = match self.resolver.resolve().await {
            Ok(principal) => principal,
            Err(reason) => {
                return Err(self.report(InvalidationError::AuthenticationUnavailable { reason }));
            }
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            return Ok(None);
        }

        let filter = enforce_scope(
            options.filter.as_deref(),
            options.required_identity_field.as_deref(),
            &principal,
        )
        .map_err(|err| self.report(err))?;

        let spec = options.spec(&self.registry.config().default_schema, filter);
        let key = spec.channel_key();
        let callbacks = self.callbacks(&options, &spec, &key);
        let id = self
            .registry
            .subscribe(&spec, callbacks)
            .map_err(|err| self.report(err.into()))?;

        let mut binding = self.binding.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            drop(binding);
            self.registry.unsubscribe(&key, id);
            return Ok(None);
        }
        *binding = Some(Binding {
            key: key.clone(),
            id,
        });
        drop(binding);

        tracing::debug!("Invalidation bound to channel {} for {}", key, principal);
        Ok(Some(key))
    }

    /// Release the subscription; idempotent
    pub fn exit(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.release();
    }

    /// Channel currently bound
    #[must_use]
    pub fn channel_key(&self) -> Option<ChannelKey> {
        self.binding.lock().as_ref().map(|b| b.key.clone())
    }

    /// Whether a subscription is held
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.binding.lock().is_some()
    }

    fn release(&self) {
        let binding = self.binding.lock().take();
        if let Some(Binding { key, id }) = binding {
            tracing::debug!("Releasing invalidation subscription on {}", key);
            self.registry.unsubscribe(&key, id);
        }
    }

    fn callbacks(
        &self,
        options: &InvalidationOptions,
        spec: &SubscriptionSpec,
        key: &ChannelKey,
    ) -> SubscriberCallbacks {
        let invalidator = Arc::clone(&self.invalidator);
        let on_invalidate = self.on_invalidate.clone();
        let on_error = self.on_error.clone();
        let query_key = options.query_key.clone();
        let table = spec.table().to_string();
        let key = key.clone();

        SubscriberCallbacks::new(move |event| {
            let target = InvalidationTarget {
                query_key: query_key.clone(),
                channel_key: key.clone(),
                table: table.clone(),
                event_type: event.event_type,
            };
            if let Some(hook) = &on_invalidate {
                hook(&target);
            }
            invalidator.invalidate(&target);
        })
        .with_status_change(move |_, error| {
            if let (Some(hook), Some(error)) = (&on_error, error) {
                hook(&InvalidationError::Channel(error.clone()));
            }
        })
    }

    fn report(&self, err: InvalidationError) -> InvalidationError {
        if err.is_security_rejection() {
            tracing::error!("Security violation, subscription refused: {}", err);
        } else {
            tracing::warn!("Invalidation subscription failed: {}", err);
        }
        if let Some(hook) = &self.on_error {
            hook(&err);
        }
        err
    }
}

impl Drop for InvalidationConsumer {
    fn drop(&mut self) {
        self.exit();
    }
}

impl std::fmt::Debug for InvalidationConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationConsumer")
            .field("binding", &*self.binding.lock())
            .finish_non_exhaustive()
    }
}
