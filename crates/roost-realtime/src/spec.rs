//! Subscription specifications and canonical channel keys
//!
//! A [`SubscriptionSpec`] names one logical change stream. It has no identity
//! of its own: the registry only ever looks channels up by the
//! [`ChannelKey`] derived from it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Schema used when a spec does not name one
pub const DEFAULT_SCHEMA: &str = "public";

/// Segment delimiter inside a [`ChannelKey`]
const KEY_DELIMITER: char = '|';

/// Escapes [`KEY_DELIMITER`] inside a key segment
const KEY_ESCAPE: char = '\\';

/// Row-change kind a subscription listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Row inserted
    #[serde(rename = "INSERT")]
    Insert,
    /// Row updated
    #[serde(rename = "UPDATE")]
    Update,
    /// Row deleted
    #[serde(rename = "DELETE")]
    Delete,
    /// Any of the above
    #[default]
    #[serde(rename = "*")]
    Any,
}

impl ChangeKind {
    /// Wire name of this kind
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Any => "*",
        }
    }

    /// Whether an event of kind `other` is covered by this kind
    #[inline]
    #[must_use]
    pub fn matches(self, other: ChangeKind) -> bool {
        self == Self::Any || self == other
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a [`ChangeKind`] from its wire name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown change kind: '{0}'")]
pub struct UnknownChangeKind(pub String);

impl FromStr for ChangeKind {
    type Err = UnknownChangeKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "*" | "" => Ok(Self::Any),
            _ => Err(UnknownChangeKind(s.to_string())),
        }
    }
}

/// Identifies one logical change stream: `(schema, table, event, filter)`
///
/// Fields are private so a spec cannot change after construction. An empty
/// filter is normalised to "no filter" so that both spellings map to the
/// same channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionSpec {
    schema: String,
    table: String,
    event: ChangeKind,
    filter: Option<String>,
}

impl SubscriptionSpec {
    /// Spec for every change on `table` in the default schema
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.into(),
            event: ChangeKind::Any,
            filter: None,
        }
    }

    /// With schema
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        let schema = schema.into();
        self.schema = if schema.is_empty() {
            DEFAULT_SCHEMA.to_string()
        } else {
            schema
        };
        self
    }

    /// With event kind
    #[inline]
    #[must_use]
    pub fn with_event(mut self, event: ChangeKind) -> Self {
        self.event = event;
        self
    }

    /// With row filter, e.g. `chat_id=eq.42`
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        let filter = filter.into();
        self.filter = if filter.is_empty() { None } else { Some(filter) };
        self
    }

    /// Schema name
    #[inline]
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Table name
    #[inline]
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Event kind
    #[inline]
    #[must_use]
    pub fn event(&self) -> ChangeKind {
        self.event
    }

    /// Row filter, if any
    #[inline]
    #[must_use]
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Canonical key of this spec
    ///
    /// Delimiters inside the schema, table or filter are escaped, so distinct
    /// specs never share a key.
    #[must_use]
    pub fn channel_key(&self) -> ChannelKey {
        ChannelKey(format!(
            "{schema}{d}{table}{d}{event}{d}{filter}",
            schema = escape_segment(&self.schema),
            table = escape_segment(&self.table),
            event = self.event,
            filter = escape_segment(self.filter.as_deref().unwrap_or("")),
            d = KEY_DELIMITER,
        ))
    }

    /// Listener matcher handed to the provider
    #[must_use]
    pub fn matcher(&self) -> ChangeMatcher {
        ChangeMatcher {
            schema: self.schema.clone(),
            table: self.table.clone(),
            event: self.event,
            filter: self.filter.clone(),
        }
    }
}

fn escape_segment(segment: &str) -> std::borrow::Cow<'_, str> {
    if !segment.contains([KEY_DELIMITER, KEY_ESCAPE]) {
        return segment.into();
    }
    let mut escaped = String::with_capacity(segment.len() + 2);
    for c in segment.chars() {
        if c == KEY_DELIMITER || c == KEY_ESCAPE {
            escaped.push(KEY_ESCAPE);
        }
        escaped.push(c);
    }
    escaped.into()
}

/// Canonical serialization of a [`SubscriptionSpec`]
///
/// Always four segments; the empty filter is kept as an empty trailing
/// segment rather than omitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Key as string
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key reduced to `[A-Za-z0-9-]`, for use inside transport names
    #[must_use]
    pub fn sanitized(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Listener registration passed to [`crate::ProviderChannel::on_change`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeMatcher {
    /// Schema name
    pub schema: String,
    /// Table name
    pub table: String,
    /// Event kind (`Any` means no event restriction)
    pub event: ChangeKind,
    /// Row filter
    pub filter: Option<String>,
}
