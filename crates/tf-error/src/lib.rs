//! Unified error taxonomy with stable error codes for the transformation order server.
//!
//! Every error carries an [`ErrorCode`] (a machine-readable, stable string
//! tag), a human-readable message, an optional cause chain, and arbitrary
//! key-value context. Use the builder returned by [`TfError::new`] to
//! construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to, matching the conceptual
/// error kinds that govern OData/HTTP status mapping at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The request itself is malformed or fails validation.
    InvalidRequest,
    /// The referenced resource does not exist.
    NotFound,
    /// The caller lacks the role/quota required for this operation.
    Forbidden,
    /// The caller exceeded their concurrent order quota.
    QuotaExceeded,
    /// A downstream dependency (hub, plugin, trace service) failed.
    Downstream,
    /// Server configuration is missing or invalid.
    ConfigError,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidRequest => "invalid_request",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Downstream => "downstream",
            Self::ConfigError => "config_error",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- InvalidRequest --
    /// `$filter` expression failed to parse.
    FilterInvalidSyntax,
    /// A request field is missing or has the wrong type.
    RequestMalformed,
    /// A `WorkflowOptions` entry names an option the workflow doesn't have.
    OptionUnknown,
    /// A `WorkflowOptions` value has the wrong type or an invalid enum value.
    OptionInvalidValue,
    /// `InputProductReference.Reference` does not look like a product name.
    ProductReferenceInvalid,
    /// A date field could not be parsed as ISO-8601.
    DateInvalid,

    // -- NotFound --
    /// No transformation order exists with the given id.
    OrderNotFound,
    /// No workflow exists with the given id.
    WorkflowNotFound,

    // -- Forbidden --
    /// The caller's roles do not permit this operation.
    RoleNotPermitted,
    /// The order belongs to a different user and cross-user access is denied.
    OrderNotOwned,
    /// The workflow is configured as excluded from admission.
    WorkflowExcluded,

    // -- QuotaExceeded --
    /// The caller already has the maximum number of uncompleted orders.
    UncompletedOrderQuotaExceeded,

    // -- Downstream --
    /// Every configured hub failed to deliver the requested product.
    HubDownloadFailed,
    /// The product's checksum did not match after download.
    ChecksumMismatch,
    /// The processing plugin for a workflow failed to execute.
    PluginExecutionFailed,
    /// The trace-signing service rejected or failed to produce a provenance trace.
    TraceSigningFailed,
    /// The expected output product is missing after a run reported success.
    OutputMissing,

    // -- ConfigError --
    /// A configuration file is missing.
    ConfigMissing,
    /// A configuration file failed to parse.
    ConfigParseFailed,
    /// A configuration file is structurally invalid (missing required keys).
    ConfigInvalid,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::FilterInvalidSyntax
            | Self::RequestMalformed
            | Self::OptionUnknown
            | Self::OptionInvalidValue
            | Self::ProductReferenceInvalid
            | Self::DateInvalid => ErrorCategory::InvalidRequest,

            Self::OrderNotFound | Self::WorkflowNotFound => ErrorCategory::NotFound,

            Self::RoleNotPermitted | Self::OrderNotOwned | Self::WorkflowExcluded => {
                ErrorCategory::Forbidden
            }

            Self::UncompletedOrderQuotaExceeded => ErrorCategory::QuotaExceeded,

            Self::HubDownloadFailed
            | Self::ChecksumMismatch
            | Self::PluginExecutionFailed
            | Self::TraceSigningFailed
            | Self::OutputMissing => ErrorCategory::Downstream,

            Self::ConfigMissing | Self::ConfigParseFailed | Self::ConfigInvalid => {
                ErrorCategory::ConfigError
            }

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"WORKFLOW_NOT_FOUND"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FilterInvalidSyntax => "FILTER_INVALID_SYNTAX",
            Self::RequestMalformed => "REQUEST_MALFORMED",
            Self::OptionUnknown => "OPTION_UNKNOWN",
            Self::OptionInvalidValue => "OPTION_INVALID_VALUE",
            Self::ProductReferenceInvalid => "PRODUCT_REFERENCE_INVALID",
            Self::DateInvalid => "DATE_INVALID",
            Self::OrderNotFound => "ORDER_NOT_FOUND",
            Self::WorkflowNotFound => "WORKFLOW_NOT_FOUND",
            Self::RoleNotPermitted => "ROLE_NOT_PERMITTED",
            Self::OrderNotOwned => "ORDER_NOT_OWNED",
            Self::WorkflowExcluded => "WORKFLOW_EXCLUDED",
            Self::UncompletedOrderQuotaExceeded => "UNCOMPLETED_ORDER_QUOTA_EXCEEDED",
            Self::HubDownloadFailed => "HUB_DOWNLOAD_FAILED",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::PluginExecutionFailed => "PLUGIN_EXECUTION_FAILED",
            Self::TraceSigningFailed => "TRACE_SIGNING_FAILED",
            Self::OutputMissing => "OUTPUT_MISSING",
            Self::ConfigMissing => "CONFIG_MISSING",
            Self::ConfigParseFailed => "CONFIG_PARSE_FAILED",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::Internal => "INTERNAL",
        }
    }

    /// HTTP status code this error maps to at the API boundary.
    ///
    /// `Downstream` errors are deliberately absent here: they never surface
    /// directly to a client response, only as a transformation order's
    /// `failed` status.
    pub fn http_status(&self) -> u16 {
        match self.category() {
            ErrorCategory::InvalidRequest => 422,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Forbidden => 403,
            ErrorCategory::QuotaExceeded => 429,
            ErrorCategory::Downstream => 500,
            ErrorCategory::ConfigError => 500,
            ErrorCategory::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TfError
// ---------------------------------------------------------------------------

/// Unified error type for the transformation order server.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use tf_error::{TfError, ErrorCode};
///
/// let err = TfError::new(ErrorCode::HubDownloadFailed, "all hubs failed")
///     .with_context("product", "S2A_MSIL1C_20260101")
///     .with_context("hubs_tried", 3);
/// ```
pub struct TfError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl TfError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Shorthand for `self.code.http_status()`.
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

impl fmt::Debug for TfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("TfError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for TfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for TfError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`TfError`] (without the opaque source), used
/// as the JSON error body returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TfErrorBody {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl From<&TfError> for TfErrorBody {
    fn from(err: &TfError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::FilterInvalidSyntax,
        ErrorCode::RequestMalformed,
        ErrorCode::OptionUnknown,
        ErrorCode::OptionInvalidValue,
        ErrorCode::ProductReferenceInvalid,
        ErrorCode::DateInvalid,
        ErrorCode::OrderNotFound,
        ErrorCode::WorkflowNotFound,
        ErrorCode::RoleNotPermitted,
        ErrorCode::OrderNotOwned,
        ErrorCode::WorkflowExcluded,
        ErrorCode::UncompletedOrderQuotaExceeded,
        ErrorCode::HubDownloadFailed,
        ErrorCode::ChecksumMismatch,
        ErrorCode::PluginExecutionFailed,
        ErrorCode::TraceSigningFailed,
        ErrorCode::OutputMissing,
        ErrorCode::ConfigMissing,
        ErrorCode::ConfigParseFailed,
        ErrorCode::ConfigInvalid,
        ErrorCode::Internal,
    ];

    #[test]
    fn basic_construction() {
        let err = TfError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = TfError::new(ErrorCode::OrderNotFound, "no such order");
        assert_eq!(err.to_string(), "[ORDER_NOT_FOUND] no such order");
    }

    #[test]
    fn display_with_context() {
        let err = TfError::new(ErrorCode::UncompletedOrderQuotaExceeded, "quota hit")
            .with_context("limit", 5);
        let s = err.to_string();
        assert!(s.starts_with("[UNCOMPLETED_ORDER_QUOTA_EXCEEDED] quota hit"));
        assert!(s.contains("limit"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = TfError::new(ErrorCode::HubDownloadFailed, "download failed").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("file missing"));
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorCode::FilterInvalidSyntax.http_status(), 422);
        assert_eq!(ErrorCode::OrderNotFound.http_status(), 404);
        assert_eq!(ErrorCode::RoleNotPermitted.http_status(), 403);
        assert_eq!(
            ErrorCode::UncompletedOrderQuotaExceeded.http_status(),
            429
        );
        assert_eq!(ErrorCode::HubDownloadFailed.http_status(), 500);
        assert_eq!(ErrorCode::ConfigInvalid.http_status(), 500);
        assert_eq!(ErrorCode::Internal.http_status(), 500);
    }

    #[test]
    fn builder_with_context_multiple_keys() {
        let err = TfError::new(ErrorCode::HubDownloadFailed, "all hubs failed")
            .with_context("product", "S2A")
            .with_context("hubs_tried", 3);
        assert_eq!(err.context.len(), 2);
        assert_eq!(err.context["product"], serde_json::json!("S2A"));
        assert_eq!(err.context["hubs_tried"], serde_json::json!(3));
    }

    #[test]
    fn builder_with_source() {
        let src = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = TfError::new(ErrorCode::RoleNotPermitted, "denied").with_source(src);
        assert!(err.source.is_some());
        assert_eq!(err.source.as_ref().unwrap().to_string(), "access denied");
    }

    #[test]
    fn category_shorthand() {
        let err = TfError::new(ErrorCode::WorkflowNotFound, "unknown workflow");
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[test]
    fn error_code_serde_roundtrip() {
        let code = ErrorCode::OrderNotFound;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, r#""ORDER_NOT_FOUND""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn body_roundtrip() {
        let err = TfError::new(ErrorCode::OptionInvalidValue, "bad option")
            .with_context("option", "resolution");
        let body: TfErrorBody = (&err).into();
        let json = serde_json::to_string(&body).unwrap();
        let back: TfErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(body, back);
    }

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = TfError::new(ErrorCode::ConfigMissing, "missing").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            assert!(seen.insert(code.as_str()));
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn all_codes_display_matches_as_str() {
        for code in ALL_CODES {
            assert_eq!(code.to_string(), code.as_str());
        }
    }

    #[test]
    fn downstream_errors_never_surface_as_4xx() {
        for code in ALL_CODES {
            if code.category() == ErrorCategory::Downstream {
                assert_eq!(code.http_status(), 500);
            }
        }
    }
}
