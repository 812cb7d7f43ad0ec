//! Authenticated principal resolution

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authenticated identity scoping a subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// Stable identifier compared against identity filters
    pub id: String,
}

impl Principal {
    /// Principal with id
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Source of the current principal (session store, auth client)
#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    /// Resolve the current principal
    ///
    /// # Errors
    /// A human-readable reason when no principal is available
    async fn resolve(&self) -> Result<Principal, String>;
}
