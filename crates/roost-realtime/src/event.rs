//! Row-change events
//!
//! Events are passed through unmodified. The only inspection the layer does
//! is [`ChangeEvent::summary`], which keeps column names and drops values so
//! row contents never reach the logs.

use crate::spec::ChangeKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One row-level change emitted by the backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Kind of change (never [`ChangeKind::Any`] for a real event)
    pub event_type: ChangeKind,
    /// Row before the change (updates and deletes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_row: Option<Value>,
    /// Row after the change (inserts and updates)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_row: Option<Value>,
    /// Commit time reported by the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    /// Insert event
    #[must_use]
    pub fn insert(new_row: Value) -> Self {
        Self {
            event_type: ChangeKind::Insert,
            previous_row: None,
            new_row: Some(new_row),
            commit_timestamp: None,
        }
    }

    /// Update event
    #[must_use]
    pub fn update(previous_row: Value, new_row: Value) -> Self {
        Self {
            event_type: ChangeKind::Update,
            previous_row: Some(previous_row),
            new_row: Some(new_row),
            commit_timestamp: None,
        }
    }

    /// Delete event
    #[must_use]
    pub fn delete(previous_row: Value) -> Self {
        Self {
            event_type: ChangeKind::Delete,
            previous_row: Some(previous_row),
            new_row: None,
            commit_timestamp: None,
        }
    }

    /// Redacted view for logging
    #[must_use]
    pub fn summary(&self) -> EventSummary {
        let columns = self
            .new_row
            .as_ref()
            .or(self.previous_row.as_ref())
            .and_then(Value::as_object)
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default();

        EventSummary {
            event_type: self.event_type,
            has_previous: self.previous_row.is_some(),
            has_new: self.new_row.is_some(),
            columns,
        }
    }
}

/// Value-free description of a [`ChangeEvent`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    /// Kind of change
    pub event_type: ChangeKind,
    /// Previous row present
    pub has_previous: bool,
    /// New row present
    pub has_new: bool,
    /// Column names of the affected row
    pub columns: Vec<String>,
}
