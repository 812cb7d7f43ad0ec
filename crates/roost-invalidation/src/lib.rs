//! Roost Invalidation - realtime-driven cache invalidation
//!
//! Binds shared change-stream subscriptions to a client-side query cache:
//! - Resolves the authenticated principal before subscribing
//! - Refuses filters that are not pinned to that principal
//! - Invalidates cached queries by key prefix on every change
//!
//! # Example
//!
//! ```rust,ignore
//! use roost_invalidation::prelude::*;
//!
//! # async fn example(registry: SubscriptionRegistry, resolver: Arc<dyn PrincipalResolver>) -> Result<(), InvalidationError> {
//! let cache: QueryCache<Vec<String>> = QueryCache::default();
//! let consumer = InvalidationConsumer::new(registry, resolver, Arc::new(cache.clone()));
//!
//! let options = InvalidationOptions::new("notifications", QueryKey::new(["notifications"]))
//!     .with_required_identity("user_id");
//! consumer.enter(options).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod cache;
pub mod consumer;
pub mod error;
pub mod principal;
pub mod scope;

pub use cache::{CacheInvalidator, InvalidationTarget, QueryCache, QueryKey};
pub use consumer::{ErrorHook, InvalidateHook, InvalidationConsumer, InvalidationOptions};
pub use error::InvalidationError;
pub use principal::{Principal, PrincipalResolver};
pub use scope::{enforce_scope, identity_filter, FilterClause, DEFAULT_IDENTITY_FIELD};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for realtime cache invalidation
    pub use crate::{
        CacheInvalidator, InvalidationConsumer, InvalidationError, InvalidationOptions,
        InvalidationTarget, Principal, PrincipalResolver, QueryCache, QueryKey,
    };
    pub use roost_realtime::{ChangeKind, SubscriptionRegistry};
    pub use std::sync::Arc;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
