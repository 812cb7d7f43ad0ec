//! Principal scope enforcement for row filters
//!
//! Filters use the provider's `column=op.value` syntax. A filter that names
//! the identity column must pin it to the resolved principal with `eq`,
//! whether or not the subscription requires scoping. When a subscription
//! requires an identity column, a filter on any other column cannot be
//! proven to stay within the principal's rows.

use crate::error::InvalidationError;
use crate::principal::Principal;

/// Parsed `column=op.value` filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterClause<'a> {
    /// Column name
    pub column: &'a str,
    /// Operator (`eq`, `neq`, `in`, ...)
    pub operator: &'a str,
    /// Operand, verbatim
    pub value: &'a str,
}

impl<'a> FilterClause<'a> {
    /// Parse a single-clause filter; `None` if malformed
    #[must_use]
    pub fn parse(filter: &'a str) -> Option<Self> {
        let (column, rest) = filter.split_once('=')?;
        let (operator, value) = rest.split_once('.')?;
        let column = column.trim();
        if column.is_empty() || operator.is_empty() {
            return None;
        }
        Some(Self {
            column,
            operator,
            value,
        })
    }
}

/// Filter pinning `field` to the principal
#[must_use]
pub fn identity_filter(field: &str, principal: &Principal) -> String {
    format!("{field}=eq.{}", principal.id)
}

/// Identity column checked when a subscription names none
pub const DEFAULT_IDENTITY_FIELD: &str = "user_id";

/// Check `filter` against the principal, returning the filter to subscribe with
///
/// The identity column is `required_field`, or [`DEFAULT_IDENTITY_FIELD`]
/// when unset. A clause on it must be `eq` to the principal's id.
///
/// # Errors
/// `InvalidationError::ScopeMismatch` when the filter names the identity
/// column with another value or operator, or when `required_field` is set
/// and the filter does not pin it to `principal`
pub fn enforce_scope(
    filter: Option<&str>,
    required_field: Option<&str>,
    principal: &Principal,
) -> Result<Option<String>, InvalidationError> {
    let field = required_field.unwrap_or(DEFAULT_IDENTITY_FIELD);
    let mismatch = |found: &str| InvalidationError::ScopeMismatch {
        field: field.to_string(),
        expected: principal.id.clone(),
        found: found.to_string(),
    };

    let Some(filter) = filter.filter(|f| !f.is_empty()) else {
        return Ok(required_field.map(|field| identity_filter(field, principal)));
    };

    match FilterClause::parse(filter) {
        Some(clause) if clause.column == field => {
            if clause.operator == "eq" && clause.value == principal.id {
                Ok(Some(filter.to_string()))
            } else if clause.operator == "eq" {
                Err(mismatch(clause.value))
            } else {
                Err(mismatch(&format!("{}.{}", clause.operator, clause.value)))
            }
        }
        _ if required_field.is_some() => Err(mismatch(filter)),
        _ => Ok(Some(filter.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn alice() -> Principal {
        Principal::new("alice")
    }

    #[test]
    fn parses_clause() {
        let clause = FilterClause::parse("chat_id=eq.42").unwrap();
        assert_eq!(clause.column, "chat_id");
        assert_eq!(clause.operator, "eq");
        assert_eq!(clause.value, "42");

        assert_eq!(FilterClause::parse("id=in.(1,2.5)").unwrap().value, "(1,2.5)");
        assert!(FilterClause::parse("garbage").is_none());
        assert!(FilterClause::parse("=eq.1").is_none());
    }

    #[test]
    fn unscoped_subscription_passes_filter_through() {
        assert_eq!(
            enforce_scope(Some("chat_id=eq.42"), None, &alice()).unwrap(),
            Some("chat_id=eq.42".to_string())
        );
        assert_eq!(enforce_scope(None, None, &alice()).unwrap(), None);
        assert_eq!(enforce_scope(Some(""), None, &alice()).unwrap(), None);
    }

    #[test]
    fn unscoped_subscription_still_checks_default_identity() {
        let err = enforce_scope(Some("user_id=eq.bob"), None, &alice()).unwrap_err();
        assert!(matches!(
            err,
            InvalidationError::ScopeMismatch { ref field, ref found, .. }
                if field == DEFAULT_IDENTITY_FIELD && found == "bob"
        ));

        let err = enforce_scope(Some("user_id=in.(alice,bob)"), None, &alice()).unwrap_err();
        assert!(err.is_security_rejection());

        let filter = enforce_scope(Some("user_id=eq.alice"), None, &alice()).unwrap();
        assert_eq!(filter.as_deref(), Some("user_id=eq.alice"));
    }

    #[test]
    fn required_field_replaces_default_identity() {
        let filter = enforce_scope(Some("user_id=eq.bob"), Some("owner_id"), &alice());
        assert!(filter.is_err());

        let filter = enforce_scope(Some("owner_id=eq.alice"), Some("owner_id"), &alice()).unwrap();
        assert_eq!(filter.as_deref(), Some("owner_id=eq.alice"));
    }

    #[test]
    fn matching_identity_filter_is_kept() {
        let filter = enforce_scope(Some("user_id=eq.alice"), Some("user_id"), &alice()).unwrap();
        assert_eq!(filter.as_deref(), Some("user_id=eq.alice"));
    }

    #[test]
    fn missing_filter_gets_identity_injected() {
        let filter = enforce_scope(None, Some("user_id"), &alice()).unwrap();
        assert_eq!(filter.as_deref(), Some("user_id=eq.alice"));

        let filter = enforce_scope(Some(""), Some("user_id"), &alice()).unwrap();
        assert_eq!(filter.as_deref(), Some("user_id=eq.alice"));
    }

    #[test]
    fn other_principal_is_rejected() {
        let err = enforce_scope(Some("user_id=eq.bob"), Some("user_id"), &alice()).unwrap_err();
        match err {
            InvalidationError::ScopeMismatch {
                field,
                expected,
                found,
            } => {
                assert_eq!(field, "user_id");
                assert_eq!(expected, "alice");
                assert_eq!(found, "bob");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_eq_operator_on_identity_is_rejected() {
        let err = enforce_scope(Some("user_id=neq.alice"), Some("user_id"), &alice()).unwrap_err();
        assert!(err.is_security_rejection());
    }

    #[test]
    fn other_column_cannot_prove_scope() {
        let err = enforce_scope(Some("chat_id=eq.42"), Some("user_id"), &alice()).unwrap_err();
        assert!(matches!(
            err,
            InvalidationError::ScopeMismatch { ref found, .. } if found == "chat_id=eq.42"
        ));
    }

    proptest! {
        #[test]
        fn only_own_id_is_accepted(id in "[a-z0-9]{1,12}", other in "[a-z0-9]{1,12}") {
            let principal = Principal::new(id.clone());
            let filter = format!("user_id=eq.{other}");
            let result = enforce_scope(Some(&filter), Some("user_id"), &principal);
            prop_assert_eq!(result.is_ok(), id == other);
            let result = enforce_scope(Some(&filter), None, &principal);
            prop_assert_eq!(result.is_ok(), id == other);
        }
    }
}
