// SPDX-License-Identifier: MIT OR Apache-2.0
//! Job runner: orchestrates a single transformation order end to end.
//!
//! Responsibilities:
//! - prepare a scratch workspace under the processing directory
//! - download the input product from the first hub that has it
//! - unpack and hand the input to a pluggable processing backend
//! - repackage the backend's output and publish it
//! - hand published output's ownership to the deployment's configured
//!   owner/group, best-effort
//! - submit a provenance trace for the completed order
//! - track CPU/RAM/disk usage for the run's duration
//!
//! The actual scientific processing (e.g. atmospheric correction, SAR
//! focusing) is out of scope: [`ProcessingPlugin`] is the only contract this
//! crate depends on, with processors treated as plugins resolved by
//! workflow id rather than built into the runner.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Processing pipeline stages chained for a single run.
pub mod pipeline;

use async_trait::async_trait;
use pipeline::{
    ChownStage, DownloadStage, JobContext, Pipeline, PrepareWorkspaceStage, ProcessStage, RepackageStage,
    UnpackStage,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tf_config::HubsConfig;
use tf_core::{TransformationOrder, WorkflowDescriptor};
use tf_error::TfError;
use tf_monitor::{ResourceMonitor, ResourceUsage};
use tf_trace::{TraceEvent, TraceSigner};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A pluggable processing backend invoked for a single workflow.
///
/// Implementations wrap whatever the workflow actually runs (a Python
/// subprocess, a native library, a remote worker) — this crate only cares
/// that it's handed an input directory and asked to produce an output path.
#[async_trait]
pub trait ProcessingPlugin: Send + Sync {
    /// Run the workflow against `input_path`, using `workspace_dir` for
    /// scratch space, and return the path to the produced output (a file or
    /// a directory; [`pipeline::RepackageStage`] handles either).
    async fn execute(
        &self,
        input_path: &Path,
        workspace_dir: &Path,
        options: &BTreeMap<String, serde_json::Value>,
    ) -> Result<PathBuf, TfError>;
}

/// Progress events emitted while a [`JobRunner`] processes an order.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// The run has started.
    Started,
    /// Downloading the input product.
    Downloading,
    /// Unpacking the downloaded archive.
    Unpacking,
    /// Running the workflow's processing plugin.
    Processing,
    /// Zipping and publishing the output.
    Publishing,
    /// Submitting the provenance trace.
    Signing,
    /// The run finished successfully.
    Completed,
    /// The run failed.
    Failed {
        /// What went wrong.
        reason: String,
    },
}

/// Handle to a running job: an event stream plus a future resolving to the
/// order's final state.
///
/// The result future never errors: a failed pipeline still produces a
/// [`TransformationOrder`] in `Failed` status, mirroring the server's
/// contract that downstream failures surface as an order field, never as a
/// propagated error.
pub struct JobHandle {
    /// Id of the order being processed.
    pub order_id: Uuid,
    /// Stream of progress events.
    pub events: ReceiverStream<JobEvent>,
    /// Future resolving to the order's final state.
    pub result: JoinHandle<TransformationOrder>,
}

/// Static configuration the runner needs beyond what's already on an order.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Root directory scratch workspaces are created under.
    pub processing_dir: PathBuf,
    /// Root directory published outputs are written to.
    pub output_dir: PathBuf,
    /// Public URI root used to build `DownloadURI` values.
    pub download_uri_root: String,
    /// How often the resource monitor samples CPU/RAM/disk.
    pub monitor_poll: std::time::Duration,
}

/// Orchestrates the download → process → publish → trace pipeline for
/// transformation orders.
pub struct JobRunner {
    hubs: Arc<HubsConfig>,
    plugins: Arc<BTreeMap<String, Arc<dyn ProcessingPlugin>>>,
    trace_signer: Arc<dyn TraceSigner>,
    config: RunnerConfig,
}

impl JobRunner {
    /// Build a runner with the given hub list, plugin registry (keyed by
    /// workflow id), trace signer, and static configuration.
    pub fn new(
        hubs: Arc<HubsConfig>,
        plugins: Arc<BTreeMap<String, Arc<dyn ProcessingPlugin>>>,
        trace_signer: Arc<dyn TraceSigner>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            hubs,
            plugins,
            trace_signer,
            config,
        }
    }

    /// Start processing `order` against `descriptor` in a background task,
    /// returning a [`JobHandle`] to observe progress and await the result.
    pub fn run(&self, order: TransformationOrder, descriptor: WorkflowDescriptor) -> JobHandle {
        let order_id = order.id;
        let (event_tx, event_rx) = mpsc::channel(32);

        let hubs = Arc::clone(&self.hubs);
        let plugins = Arc::clone(&self.plugins);
        let trace_signer = Arc::clone(&self.trace_signer);
        let config = self.config.clone();

        let result = tokio::spawn(async move {
            let _ = event_tx.send(JobEvent::Started).await;
            let workspace_dir = config.processing_dir.join(order_id.to_string());

            let monitor = ResourceMonitor::start(std::process::id(), workspace_dir.clone(), config.monitor_poll);

            let mut ctx = JobContext {
                order,
                descriptor,
                workspace_dir,
                input_path: None,
                plugin_output_path: None,
                published_relative_path: None,
            };

            let run_result = run_pipeline(&mut ctx, hubs, plugins, &config, &event_tx).await;
            let usage = monitor.stop().await;

            finalize_order(&mut ctx, run_result, usage, &trace_signer, &config, &event_tx).await;
            ctx.order
        });

        JobHandle {
            order_id,
            events: ReceiverStream::new(event_rx),
            result,
        }
    }
}

async fn run_pipeline(
    ctx: &mut JobContext,
    hubs: Arc<HubsConfig>,
    plugins: Arc<BTreeMap<String, Arc<dyn ProcessingPlugin>>>,
    config: &RunnerConfig,
    events: &mpsc::Sender<JobEvent>,
) -> Result<(), TfError> {
    let pipeline = Pipeline::new()
        .stage(PrepareWorkspaceStage)
        .stage(DownloadStage::new(hubs));
    let _ = events.send(JobEvent::Downloading).await;
    pipeline.execute(ctx).await?;

    let _ = events.send(JobEvent::Unpacking).await;
    Pipeline::new().stage(UnpackStage).execute(ctx).await?;

    let _ = events.send(JobEvent::Processing).await;
    Pipeline::new().stage(ProcessStage::new(plugins)).execute(ctx).await?;

    let _ = events.send(JobEvent::Publishing).await;
    Pipeline::new()
        .stage(RepackageStage::new(config.output_dir.clone()))
        .stage(ChownStage::new(config.output_dir.clone()))
        .execute(ctx)
        .await?;

    Ok(())
}

async fn finalize_order(
    ctx: &mut JobContext,
    run_result: Result<(), TfError>,
    usage: ResourceUsage,
    trace_signer: &Arc<dyn TraceSigner>,
    config: &RunnerConfig,
    events: &mpsc::Sender<JobEvent>,
) {
    info!(
        order_id = %ctx.order.id,
        processing_time_secs = usage.processing_time_secs,
        peak_ram_bytes = usage.peak_ram_bytes,
        peak_disk_bytes = usage.peak_disk_bytes,
        "run finished, resource usage collected"
    );

    match run_result {
        Ok(()) => {
            let completed_at = chrono::Utc::now();
            let relative_path = ctx.published_relative_path.clone().unwrap_or_default();
            ctx.order.mark_completed(completed_at, relative_path, &config.download_uri_root);

            if ctx.descriptor.supports_traceability {
                let _ = events.send(JobEvent::Signing).await;
                let trace_event = TraceEvent {
                    order_id: ctx.order.id.to_string(),
                    input_product: ctx.order.input_product_reference.reference.clone(),
                    output_product: ctx.order.output_product_reference.clone().unwrap_or_default(),
                    workflow_id: ctx.order.workflow_id.clone(),
                    completed_at,
                };
                if let Err(e) = trace_signer.sign(&trace_event).await {
                    // Trace signing is best-effort: the product was still
                    // produced, so the order stays Completed.
                    warn!(order_id = %ctx.order.id, error = %e, "trace signing failed, order remains completed");
                }
            } else {
                debug!(order_id = %ctx.order.id, "workflow does not support traceability, skipping trace push");
            }

            let _ = events.send(JobEvent::Completed).await;
        }
        Err(e) => {
            error!(order_id = %ctx.order.id, error = %e, "order processing failed");
            ctx.order.mark_failed(chrono::Utc::now());
            let _ = events.send(JobEvent::Failed { reason: e.to_string() }).await;
        }
    }
}
