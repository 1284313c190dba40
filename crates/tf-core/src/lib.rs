// SPDX-License-Identifier: MIT OR Apache-2.0
//! Core data model for the transformation order server.
//!
//! This crate has no I/O of its own: it defines the shapes that flow between
//! the registry, the hub downloader, the job runner, and the HTTP layer, plus
//! the request-time validation that turns a submitted [`OrderRequest`] into a
//! [`TransformationOrder`].
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod product_ref;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tf_error::{ErrorCode, TfError};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow descriptors
// ---------------------------------------------------------------------------

/// Primitive type a [`WorkflowOptionSpec`] value must conform to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    /// JSON boolean.
    Boolean,
    /// JSON number with a fractional part allowed.
    Number,
    /// JSON number that must be a whole integer.
    Integer,
    /// JSON string.
    String,
}

impl OptionType {
    /// Does `value` conform to this type?
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            OptionType::Boolean => value.is_boolean(),
            OptionType::Number => value.is_number(),
            OptionType::Integer => value.is_i64() || value.is_u64(),
            OptionType::String => value.is_string(),
        }
    }
}

/// One configurable option exposed by a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowOptionSpec {
    /// Option name, as referenced in `WorkflowOptions`.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Required value type.
    #[serde(rename = "type")]
    pub option_type: OptionType,
    /// Default value applied when the caller omits this option.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Closed set of allowed values; empty means any value of `option_type`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<serde_json::Value>,
}

/// A processing workflow offered by a plugin, as reported by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDescriptor {
    /// Stable identifier referenced by `WorkflowId` in order requests.
    pub id: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Product type the workflow accepts as input (e.g. `"SLC"`).
    pub input_product_type: String,
    /// Product type the workflow produces (e.g. `"RTC"`).
    pub output_product_type: String,
    /// Plugin-reported workflow version.
    pub workflow_version: String,
    /// Configurable options this workflow accepts.
    #[serde(default)]
    pub options: Vec<WorkflowOptionSpec>,
    /// Whether this workflow can produce a signed provenance trace.
    #[serde(default = "default_supports_traceability")]
    pub supports_traceability: bool,
}

fn default_supports_traceability() -> bool {
    true
}

impl WorkflowDescriptor {
    /// Find an option spec by name.
    pub fn option(&self, name: &str) -> Option<&WorkflowOptionSpec> {
        self.options.iter().find(|o| o.name == name)
    }
}

// ---------------------------------------------------------------------------
// Product references
// ---------------------------------------------------------------------------

/// A time interval attached to a product reference.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ContentDate {
    /// ISO-8601 interval start.
    pub start: String,
    /// ISO-8601 interval end.
    pub end: String,
}

/// Reference to an input product, by name or by data-source query.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ProductReference {
    /// Product name, or a data-source-specific query fragment.
    pub reference: String,
    /// Name of the data source the reference should be resolved against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_name: Option<String>,
    /// Optional content date interval narrowing the reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_date: Option<ContentDate>,
}

// ---------------------------------------------------------------------------
// Inbound order request
// ---------------------------------------------------------------------------

/// Body of a `POST TransformationOrders` request, before validation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OrderRequest {
    /// Id of the workflow to run.
    pub workflow_id: String,
    /// Input product to run the workflow against.
    pub input_product_reference: ProductReference,
    /// Workflow-specific options, validated against the workflow's descriptor.
    #[serde(default)]
    pub workflow_options: BTreeMap<String, serde_json::Value>,
}

/// Validate and default an [`OrderRequest`]'s `workflow_options` against a
/// [`WorkflowDescriptor`], mirroring the strict option-checking the original
/// service performs before accepting an order: unknown option names, values
/// of the wrong JSON type, and values outside a closed enum all reject the
/// whole request rather than being silently dropped or coerced.
pub fn validate_workflow_options(
    descriptor: &WorkflowDescriptor,
    requested: &BTreeMap<String, serde_json::Value>,
) -> Result<BTreeMap<String, serde_json::Value>, TfError> {
    let mut resolved = BTreeMap::new();

    for (name, value) in requested {
        let spec = descriptor.option(name).ok_or_else(|| {
            TfError::new(ErrorCode::OptionUnknown, format!("unknown workflow option '{name}'"))
                .with_context("workflow_id", descriptor.id.clone())
                .with_context("option", name.clone())
        })?;

        if !spec.option_type.matches(value) {
            return Err(TfError::new(
                ErrorCode::OptionInvalidValue,
                format!("option '{name}' has the wrong type"),
            )
            .with_context("option", name.clone())
            .with_context("expected_type", format!("{:?}", spec.option_type)));
        }

        if !spec.values.is_empty() && !spec.values.contains(value) {
            return Err(TfError::new(
                ErrorCode::OptionInvalidValue,
                format!("option '{name}' is not one of the allowed values"),
            )
            .with_context("option", name.clone()));
        }

        resolved.insert(name.clone(), value.clone());
    }

    for spec in &descriptor.options {
        if !resolved.contains_key(&spec.name)
            && let Some(default) = &spec.default
        {
            resolved.insert(spec.name.clone(), default.clone());
        }
    }

    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Transformation order lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`TransformationOrder`].
///
/// These are the only four states the API exposes; they're the projection
/// of the richer set of internal job-runner states (see `tf-runner`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Submitted but not yet started by a worker.
    Queued,
    /// A worker has claimed the order and is running its pipeline.
    InProgress,
    /// The pipeline finished and the output product is available.
    Completed,
    /// The pipeline finished with an error, or its task was lost.
    Failed,
}

impl OrderStatus {
    /// `true` for `Completed` or `Failed` — the two states that carry a
    /// `CompletedDate` and are eligible for eviction.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Failed)
    }
}

/// A transformation order tracked by the queue.
///
/// Field names mirror the OData entity the HTTP API exposes (`Id`,
/// `SubmissionDate`, `CompletedDate`, `Status`, ...) via `#[serde(rename)]`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransformationOrder {
    /// Unique order id.
    #[serde(rename = "Id")]
    pub id: Uuid,
    /// User id that submitted the order (from `X-Username`).
    #[serde(rename = "UserId")]
    pub user_id: String,
    /// Roles the submitting user presented (from `X-Roles`).
    #[serde(rename = "UserRoles", default)]
    pub user_roles: Vec<String>,
    /// Id of the workflow being run.
    #[serde(rename = "WorkflowId")]
    pub workflow_id: String,
    /// Input product reference.
    #[serde(rename = "InputProductReference")]
    pub input_product_reference: ProductReference,
    /// Resolved (validated + defaulted) workflow options.
    #[serde(rename = "WorkflowOptions")]
    pub workflow_options: BTreeMap<String, serde_json::Value>,
    /// Current lifecycle status.
    #[serde(rename = "Status")]
    pub status: OrderStatus,
    /// Timestamp the order was accepted.
    #[serde(rename = "SubmissionDate")]
    pub submission_date: DateTime<Utc>,
    /// Timestamp the order reached a terminal state, if it has.
    #[serde(rename = "CompletedDate", skip_serializing_if = "Option::is_none")]
    pub completed_date: Option<DateTime<Utc>>,
    /// Output product reference, set once `status == Completed`.
    #[serde(rename = "OutputProductReference", skip_serializing_if = "Option::is_none")]
    pub output_product_reference: Option<String>,
    /// Fully-qualified download URL, derived from `OutputProductReference`.
    #[serde(rename = "DownloadURI", skip_serializing_if = "Option::is_none")]
    pub download_uri: Option<String>,
    /// Number of times this order has been resubmitted after a failure.
    #[serde(rename = "ResubmitCount", default)]
    pub resubmit_count: u32,
}

impl TransformationOrder {
    /// Construct a fresh order in `Queued` status from a validated request.
    pub fn new(
        id: Uuid,
        user_id: impl Into<String>,
        user_roles: Vec<String>,
        workflow_id: impl Into<String>,
        input_product_reference: ProductReference,
        workflow_options: BTreeMap<String, serde_json::Value>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            user_roles,
            workflow_id: workflow_id.into(),
            input_product_reference,
            workflow_options,
            status: OrderStatus::Queued,
            submission_date: submitted_at,
            completed_date: None,
            output_product_reference: None,
            download_uri: None,
            resubmit_count: 0,
        }
    }

    /// Build the `DownloadURI` for a just-completed order from the server's
    /// configured URI root and the output product's path relative to the
    /// output directory.
    pub fn build_download_uri(uri_root: &str, relative_output_path: &str) -> String {
        let root = uri_root.trim_end_matches('/');
        let rel = relative_output_path.trim_start_matches('/');
        format!("{root}/download/{rel}")
    }

    /// Transition this order to `Completed`, stamping `CompletedDate` and
    /// deriving `OutputProductReference`/`DownloadURI`.
    pub fn mark_completed(
        &mut self,
        completed_at: DateTime<Utc>,
        output_product_reference: String,
        uri_root: &str,
    ) {
        self.status = OrderStatus::Completed;
        self.completed_date = Some(completed_at);
        self.download_uri =
            Some(Self::build_download_uri(uri_root, &output_product_reference));
        self.output_product_reference = Some(output_product_reference);
    }

    /// Transition this order to `Failed`, stamping `CompletedDate`.
    pub fn mark_failed(&mut self, completed_at: DateTime<Utc>) {
        self.status = OrderStatus::Failed;
        self.completed_date = Some(completed_at);
        self.output_product_reference = None;
        self.download_uri = None;
    }

    /// Reset this order back to `Queued` for a resubmit attempt, clearing
    /// any terminal-state fields and bumping `ResubmitCount`.
    pub fn reset_for_resubmit(&mut self) {
        self.status = OrderStatus::Queued;
        self.completed_date = None;
        self.output_product_reference = None;
        self.download_uri = None;
        self.resubmit_count += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_descriptor() -> WorkflowDescriptor {
        WorkflowDescriptor {
            id: "sen2cor_l1c_l2a".into(),
            description: "Sen2Cor atmospheric correction".into(),
            input_product_type: "S2MSI1C".into(),
            output_product_type: "S2MSI2A".into(),
            workflow_version: "2.11".into(),
            options: vec![
                WorkflowOptionSpec {
                    name: "resolution".into(),
                    description: "target resolution in meters".into(),
                    option_type: OptionType::Integer,
                    default: Some(serde_json::json!(20)),
                    values: vec![serde_json::json!(10), serde_json::json!(20), serde_json::json!(60)],
                },
                WorkflowOptionSpec {
                    name: "cloud_mask".into(),
                    description: "apply cloud masking".into(),
                    option_type: OptionType::Boolean,
                    default: Some(serde_json::json!(true)),
                    values: vec![],
                },
            ],
            supports_traceability: true,
        }
    }

    #[test]
    fn unknown_option_is_rejected() {
        let descriptor = sample_descriptor();
        let mut requested = BTreeMap::new();
        requested.insert("nonexistent".into(), serde_json::json!(1));
        let err = validate_workflow_options(&descriptor, &requested).unwrap_err();
        assert_eq!(err.code, ErrorCode::OptionUnknown);
    }

    #[test]
    fn wrong_type_is_rejected() {
        let descriptor = sample_descriptor();
        let mut requested = BTreeMap::new();
        requested.insert("resolution".into(), serde_json::json!("twenty"));
        let err = validate_workflow_options(&descriptor, &requested).unwrap_err();
        assert_eq!(err.code, ErrorCode::OptionInvalidValue);
    }

    #[test]
    fn disallowed_enum_value_is_rejected() {
        let descriptor = sample_descriptor();
        let mut requested = BTreeMap::new();
        requested.insert("resolution".into(), serde_json::json!(15));
        let err = validate_workflow_options(&descriptor, &requested).unwrap_err();
        assert_eq!(err.code, ErrorCode::OptionInvalidValue);
    }

    #[test]
    fn missing_options_are_defaulted() {
        let descriptor = sample_descriptor();
        let requested = BTreeMap::new();
        let resolved = validate_workflow_options(&descriptor, &requested).unwrap();
        assert_eq!(resolved["resolution"], serde_json::json!(20));
        assert_eq!(resolved["cloud_mask"], serde_json::json!(true));
    }

    #[test]
    fn explicit_value_overrides_default() {
        let descriptor = sample_descriptor();
        let mut requested = BTreeMap::new();
        requested.insert("resolution".into(), serde_json::json!(10));
        let resolved = validate_workflow_options(&descriptor, &requested).unwrap();
        assert_eq!(resolved["resolution"], serde_json::json!(10));
    }

    #[test]
    fn new_order_starts_queued_with_no_completion_fields() {
        let order = TransformationOrder::new(
            Uuid::nil(),
            "alice",
            vec!["standard".into()],
            "sen2cor_l1c_l2a",
            ProductReference {
                reference: "S2A_MSIL1C_20260101T000000".into(),
                data_source_name: None,
                content_date: None,
            },
            BTreeMap::new(),
            Utc::now(),
        );
        assert_eq!(order.status, OrderStatus::Queued);
        assert!(order.completed_date.is_none());
        assert!(order.output_product_reference.is_none());
        assert!(order.download_uri.is_none());
    }

    #[test]
    fn mark_completed_sets_derived_fields() {
        let mut order = TransformationOrder::new(
            Uuid::nil(),
            "alice",
            vec![],
            "wf",
            ProductReference {
                reference: "r".into(),
                data_source_name: None,
                content_date: None,
            },
            BTreeMap::new(),
            Utc::now(),
        );
        order.mark_completed(Utc::now(), "2026/01/01/out.zip".into(), "https://dl.test/");
        assert_eq!(order.status, OrderStatus::Completed);
        assert!(order.completed_date.is_some());
        assert_eq!(
            order.download_uri.as_deref(),
            Some("https://dl.test/download/2026/01/01/out.zip")
        );
    }

    #[test]
    fn completed_date_present_iff_terminal() {
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::Queued.is_terminal());
        assert!(!OrderStatus::InProgress.is_terminal());
    }

    #[test]
    fn reset_for_resubmit_clears_terminal_fields_and_bumps_counter() {
        let mut order = TransformationOrder::new(
            Uuid::nil(),
            "alice",
            vec![],
            "wf",
            ProductReference {
                reference: "r".into(),
                data_source_name: None,
                content_date: None,
            },
            BTreeMap::new(),
            Utc::now(),
        );
        order.mark_failed(Utc::now());
        order.reset_for_resubmit();
        assert_eq!(order.status, OrderStatus::Queued);
        assert!(order.completed_date.is_none());
        assert_eq!(order.resubmit_count, 1);
    }

    #[test]
    fn serde_rename_matches_odata_field_names() {
        let order = TransformationOrder::new(
            Uuid::nil(),
            "alice",
            vec![],
            "wf",
            ProductReference {
                reference: "r".into(),
                data_source_name: None,
                content_date: None,
            },
            BTreeMap::new(),
            Utc::now(),
        );
        let json = serde_json::to_value(&order).unwrap();
        assert!(json.get("Id").is_some());
        assert!(json.get("WorkflowId").is_some());
        assert!(json.get("Status").is_some());
        assert!(json.get("CompletedDate").is_none());
    }
}
