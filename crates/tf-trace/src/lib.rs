// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pluggable provenance trace signing.
//!
//! Every completed order may be announced to an external trace-signing
//! service so that a product's processing history can later be verified.
//! The service itself is out of scope here — [`TraceSigner`] is the only
//! contract the job runner depends on, expressed as an interface rather
//! than a subprocess invocation of an external signing tool.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tf_config::TraceConfig;
use tf_error::{ErrorCode, TfError};
use tracing::{info, warn};

/// A single provenance event submitted for a completed order.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    /// Order id the trace is about.
    pub order_id: String,
    /// Input product reference.
    pub input_product: String,
    /// Output product reference.
    pub output_product: String,
    /// Workflow id that ran.
    pub workflow_id: String,
    /// Timestamp the order completed.
    pub completed_at: DateTime<Utc>,
}

/// Anything that can accept a [`TraceEvent`] and produce a signed trace.
///
/// Failures are always [`ErrorCode::TraceSigningFailed`] and never fail the
/// order itself — the job runner logs and continues when trace signing
/// fails, since the product was still produced successfully.
#[async_trait]
pub trait TraceSigner: Send + Sync {
    /// Submit a completed-order event for signing.
    async fn sign(&self, event: &TraceEvent) -> Result<(), TfError>;
}

/// A no-op signer used when no trace service is configured.
pub struct NullTraceSigner;

#[async_trait]
impl TraceSigner for NullTraceSigner {
    async fn sign(&self, event: &TraceEvent) -> Result<(), TfError> {
        info!(order_id = %event.order_id, "trace signing disabled, skipping");
        Ok(())
    }
}

#[derive(Serialize)]
struct TraceSubmission<'a> {
    event_type: &'a str,
    service_context: &'a str,
    service_type: &'a str,
    service_provider: &'a str,
    order_id: &'a str,
    input_product: &'a str,
    output_product: &'a str,
    workflow_id: &'a str,
    completed_at: DateTime<Utc>,
}

/// Signs traces by POSTing to an HTTP trace-signing service, authenticating
/// with the username/password from [`TraceConfig`].
pub struct HttpTraceSigner {
    http: reqwest::Client,
    config: TraceConfig,
}

impl HttpTraceSigner {
    /// Build a signer bound to the given service configuration.
    pub fn new(config: TraceConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl TraceSigner for HttpTraceSigner {
    async fn sign(&self, event: &TraceEvent) -> Result<(), TfError> {
        let submission = TraceSubmission {
            event_type: &self.config.event_type,
            service_context: &self.config.service_context,
            service_type: &self.config.service_type,
            service_provider: &self.config.service_provider,
            order_id: &event.order_id,
            input_product: &event.input_product,
            output_product: &event.output_product,
            workflow_id: &event.workflow_id,
            completed_at: event.completed_at,
        };

        let resp = self
            .http
            .post(format!("{}/traces", self.config.service_url.trim_end_matches('/')))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&submission)
            .send()
            .await
            .map_err(|e| {
                warn!(order_id = %event.order_id, error = %e, "trace signing request failed");
                TfError::new(ErrorCode::TraceSigningFailed, format!("trace request failed: {e}"))
                    .with_context("order_id", event.order_id.clone())
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            warn!(order_id = %event.order_id, %status, "trace service rejected submission");
            return Err(TfError::new(
                ErrorCode::TraceSigningFailed,
                format!("trace service returned status {status}"),
            )
            .with_context("order_id", event.order_id.clone()));
        }

        info!(order_id = %event.order_id, "trace signed");
        Ok(())
    }
}
