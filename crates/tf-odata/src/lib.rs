// SPDX-License-Identifier: MIT OR Apache-2.0
//! A small OData-flavored `$filter` grammar: `field op value` clauses joined
//! by `and`, evaluated against a `serde_json::Value` entity.
//!
//! Only the subset the transformation order API needs is implemented:
//! comparison operators (`eq`, `ne`, `gt`, `ge`, `lt`, `le`) over string,
//! number, boolean, and ISO-8601 date values, plus `/`-separated field
//! paths for nested entities like `InputProductReference/Reference`.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use tf_error::{ErrorCode, TfError};

/// A comparison operator recognised in a `$filter` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// `eq`
    Eq,
    /// `ne`
    Ne,
    /// `gt`
    Gt,
    /// `ge`
    Ge,
    /// `lt`
    Lt,
    /// `le`
    Le,
}

impl FilterOp {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "ge" => Some(Self::Ge),
            "lt" => Some(Self::Lt),
            "le" => Some(Self::Le),
            _ => None,
        }
    }
}

/// A literal value on the right-hand side of a `$filter` clause.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    /// A quoted string literal, e.g. `'completed'`.
    Str(String),
    /// A bare numeric literal.
    Num(f64),
    /// A bare `true`/`false` literal.
    Bool(bool),
}

fn parse_value(token: &str) -> FilterValue {
    if let Some(inner) = token.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return FilterValue::Str(inner.to_string());
    }
    match token {
        "true" => FilterValue::Bool(true),
        "false" => FilterValue::Bool(false),
        _ => token
            .parse::<f64>()
            .map(FilterValue::Num)
            .unwrap_or_else(|_| FilterValue::Str(token.to_string())),
    }
}

/// A single `field op value` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterClause {
    /// Field path, `/`-separated for nested entities (e.g.
    /// `InputProductReference/Reference`).
    pub field: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Right-hand-side literal.
    pub value: FilterValue,
}

/// Parse a raw `$filter` string into clauses, split on (case-insensitive)
/// ` and `.
///
/// An empty or whitespace-only filter parses to an empty clause list, which
/// [`matches_all`] treats as "match everything" — the same behaviour as
/// omitting `$filter` entirely.
pub fn parse_filter(raw: &str) -> Result<Vec<FilterClause>, TfError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    trimmed
        .split(" and ")
        .map(|part| parse_clause(part.trim()))
        .collect()
}

/// Fields whose values are ISO-8601 timestamps, not strings: a malformed
/// literal against one of these must fail the request rather than silently
/// degrade to a string comparison that can never match.
fn is_date_field(field: &str) -> bool {
    matches!(field, "SubmissionDate" | "CompletedDate")
}

/// Fields only meaningfully compared for equality; `gt`/`lt`/etc. against an
/// id or an enum-like field is always a client mistake, not a valid query.
fn eq_only_field(field: &str) -> bool {
    matches!(field, "Id" | "WorkflowId" | "Status" | "InputProductReference")
}

fn parse_clause(clause: &str) -> Result<FilterClause, TfError> {
    let mut parts = clause.splitn(3, ' ');
    let field = parts.next().unwrap_or_default();
    let op_token = parts.next().unwrap_or_default();
    let value_token = parts.next().unwrap_or_default();

    if field.is_empty() || op_token.is_empty() || value_token.is_empty() {
        return Err(TfError::new(
            ErrorCode::FilterInvalidSyntax,
            format!("malformed $filter clause: '{clause}'"),
        ));
    }

    let op = FilterOp::parse(op_token).ok_or_else(|| {
        TfError::new(
            ErrorCode::FilterInvalidSyntax,
            format!("unknown operator '{op_token}' in clause '{clause}'"),
        )
    })?;

    if eq_only_field(field) && op != FilterOp::Eq {
        return Err(TfError::new(
            ErrorCode::FilterInvalidSyntax,
            format!("operator '{op_token}' is not allowed on field '{field}', only 'eq' is"),
        ));
    }

    let value = parse_value(value_token);

    if is_date_field(field) {
        let FilterValue::Str(raw) = &value else {
            return Err(TfError::new(
                ErrorCode::DateInvalid,
                format!("'{value_token}' is not a valid ISO-8601 date literal for field '{field}'"),
            ));
        };
        if raw.parse::<DateTime<Utc>>().is_err() {
            return Err(TfError::new(
                ErrorCode::DateInvalid,
                format!("'{raw}' is not a valid ISO-8601 date literal for field '{field}'"),
            ));
        }
    }

    Ok(FilterClause {
        field: field.to_string(),
        op,
        value,
    })
}

/// Resolve a `/`-separated field path against a JSON entity.
///
/// `InputProductReference` without an explicit nested path is special-cased
/// to its `reference` string property: the field is a nested object on the
/// wire, but `$filter=InputProductReference eq '...'` is meant to match the
/// product reference string, the same as spelling out
/// `InputProductReference/reference` explicitly.
fn resolve_path<'a>(entity: &'a serde_json::Value, field: &str) -> Option<&'a serde_json::Value> {
    let field = if field == "InputProductReference" {
        "InputProductReference/reference"
    } else {
        field
    };
    field
        .split('/')
        .try_fold(entity, |cur, segment| cur.get(segment))
}

fn compare(op: FilterOp, actual: &serde_json::Value, expected: &FilterValue) -> bool {
    use std::cmp::Ordering;

    let ordering: Option<Ordering> = match (actual, expected) {
        (serde_json::Value::String(a), FilterValue::Str(b)) => {
            // Try ISO-8601 date comparison first, fall back to string ordering.
            match (
                a.parse::<DateTime<Utc>>(),
                b.parse::<DateTime<Utc>>(),
            ) {
                (Ok(da), Ok(db)) => Some(da.cmp(&db)),
                _ => Some(a.as_str().cmp(b.as_str())),
            }
        }
        (serde_json::Value::Number(a), FilterValue::Num(b)) => {
            a.as_f64().and_then(|a| a.partial_cmp(b))
        }
        (serde_json::Value::Bool(a), FilterValue::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match (op, ordering) {
        (FilterOp::Eq, Some(o)) => o == Ordering::Equal,
        (FilterOp::Ne, Some(o)) => o != Ordering::Equal,
        (FilterOp::Gt, Some(o)) => o == Ordering::Greater,
        (FilterOp::Ge, Some(o)) => o != Ordering::Less,
        (FilterOp::Lt, Some(o)) => o == Ordering::Less,
        (FilterOp::Le, Some(o)) => o != Ordering::Greater,
        // Type mismatch / unparseable: only `ne` can be vacuously true.
        (FilterOp::Ne, None) => true,
        (_, None) => false,
    }
}

/// Does `entity` satisfy every clause in `clauses`?
///
/// A field absent from `entity` (for example `CompletedDate` on an order
/// still in progress) never satisfies any clause that names it, matching
/// the original service's behaviour of excluding incomplete orders from
/// `CompletedDate`-based filters rather than raising an error.
///
/// An empty clause list always matches, so `filter([P, Q])` is exactly the
/// intersection of `filter([P])` and `filter([Q])`.
pub fn matches_all(entity: &serde_json::Value, clauses: &[FilterClause]) -> bool {
    clauses.iter().all(|clause| match resolve_path(entity, &clause.field) {
        Some(actual) if !actual.is_null() => compare(clause.op, actual, &clause.value),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_single_clause() {
        let clauses = parse_filter("Status eq 'completed'").unwrap();
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0].field, "Status");
        assert_eq!(clauses[0].op, FilterOp::Eq);
        assert_eq!(clauses[0].value, FilterValue::Str("completed".into()));
    }

    #[test]
    fn parses_multiple_clauses_joined_by_and() {
        let clauses =
            parse_filter("Status eq 'completed' and WorkflowId eq 'sen2cor_l1c_l2a'").unwrap();
        assert_eq!(clauses.len(), 2);
    }

    #[test]
    fn empty_filter_parses_to_no_clauses() {
        assert!(parse_filter("").unwrap().is_empty());
        assert!(parse_filter("   ").unwrap().is_empty());
    }

    #[test]
    fn unknown_operator_is_invalid_syntax() {
        let err = parse_filter("Status like 'x'").unwrap_err();
        assert_eq!(err.code, ErrorCode::FilterInvalidSyntax);
    }

    #[test]
    fn malformed_clause_missing_value_is_invalid_syntax() {
        let err = parse_filter("Status eq").unwrap_err();
        assert_eq!(err.code, ErrorCode::FilterInvalidSyntax);
    }

    #[test]
    fn nested_field_path_resolves_with_slash() {
        let entity = json!({"InputProductReference": {"reference": "S2A_MSIL1C"}});
        let clauses = parse_filter("InputProductReference/reference eq 'S2A_MSIL1C'").unwrap();
        assert!(matches_all(&entity, &clauses));
    }

    #[test]
    fn bare_input_product_reference_matches_nested_reference_string() {
        let entity = json!({"InputProductReference": {"reference": "S2A_MSIL1C"}});
        let clauses = parse_filter("InputProductReference eq 'S2A_MSIL1C'").unwrap();
        assert!(matches_all(&entity, &clauses));

        let clauses = parse_filter("InputProductReference eq 'S2B_MSIL1C'").unwrap();
        assert!(!matches_all(&entity, &clauses));
    }

    #[test]
    fn missing_completed_date_excludes_rather_than_errors() {
        let entity = json!({"Status": "in_progress"});
        let clauses = parse_filter("CompletedDate ge '2026-01-01T00:00:00Z'").unwrap();
        assert!(!matches_all(&entity, &clauses));
    }

    #[test]
    fn date_comparison_orders_chronologically() {
        let entity = json!({"SubmissionDate": "2026-06-01T00:00:00Z"});
        let clauses = parse_filter("SubmissionDate ge '2026-01-01T00:00:00Z'").unwrap();
        assert!(matches_all(&entity, &clauses));
        let clauses = parse_filter("SubmissionDate lt '2026-01-01T00:00:00Z'").unwrap();
        assert!(!matches_all(&entity, &clauses));
    }

    #[test]
    fn filter_composition_is_intersection() {
        let entity = json!({"Status": "completed", "WorkflowId": "wf-a"});
        let p = parse_filter("Status eq 'completed'").unwrap();
        let q = parse_filter("WorkflowId eq 'wf-b'").unwrap();
        let both: Vec<FilterClause> = p.iter().chain(q.iter()).cloned().collect();
        assert!(matches_all(&entity, &p));
        assert!(!matches_all(&entity, &q));
        assert!(!matches_all(&entity, &both));
    }

    #[test]
    fn no_clauses_matches_everything() {
        let entity = json!({});
        assert!(matches_all(&entity, &[]));
    }

    #[test]
    fn malformed_date_literal_is_date_invalid_not_empty_result() {
        let err = parse_filter("SubmissionDate eq 'not-a-date'").unwrap_err();
        assert_eq!(err.code, ErrorCode::DateInvalid);
    }

    #[test]
    fn unquoted_number_against_date_field_is_date_invalid() {
        let err = parse_filter("CompletedDate eq 123").unwrap_err();
        assert_eq!(err.code, ErrorCode::DateInvalid);
    }

    #[test]
    fn non_eq_operator_on_eq_only_field_is_invalid_syntax() {
        let err = parse_filter("Status gt 'completed'").unwrap_err();
        assert_eq!(err.code, ErrorCode::FilterInvalidSyntax);

        let err = parse_filter("InputProductReference ne 'S2A_MSIL1C'").unwrap_err();
        assert_eq!(err.code, ErrorCode::FilterInvalidSyntax);
    }

    #[test]
    fn numeric_and_bool_comparisons() {
        let entity = json!({"ResubmitCount": 2, "flag": true});
        let clauses = parse_filter("ResubmitCount gt 1").unwrap();
        assert!(matches_all(&entity, &clauses));
        let clauses = parse_filter("flag eq true").unwrap();
        assert!(matches_all(&entity, &clauses));
    }
}
