// SPDX-License-Identifier: MIT OR Apache-2.0
//! Processing pipeline for a single transformation order.
//!
//! A [`Pipeline`] chains [`PipelineStage`] implementations that prepare a
//! workspace, download the input product, run the processing plugin, and
//! repackage the output. Stages run in insertion order; any failure
//! short-circuits the remaining stages and the order is marked `Failed`.

use crate::ProcessingPlugin;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tf_config::HubsConfig;
use tf_core::{TransformationOrder, WorkflowDescriptor};
use tf_error::{ErrorCode, TfError};
use tracing::{debug, warn};

/// Mutable state threaded through a [`Pipeline`] run.
pub struct JobContext {
    /// The order being processed.
    pub order: TransformationOrder,
    /// Descriptor of the workflow the order requested.
    pub descriptor: WorkflowDescriptor,
    /// Scratch directory unique to this run, under the server's processing dir.
    pub workspace_dir: PathBuf,
    /// Path to the downloaded (and possibly unpacked) input product.
    pub input_path: Option<PathBuf>,
    /// Path to the plugin's raw output, before repackaging.
    pub plugin_output_path: Option<PathBuf>,
    /// Path to the final, zipped output product, relative to the output dir.
    pub published_relative_path: Option<String>,
}

/// A single stage applied to a [`JobContext`] in sequence.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Process (and optionally mutate) the job context.
    async fn process(&self, ctx: &mut JobContext) -> Result<(), TfError>;

    /// Human-readable name used in tracing output.
    fn name(&self) -> &str;
}

/// Creates the run's scratch directory under the processing root.
pub struct PrepareWorkspaceStage;

#[async_trait]
impl PipelineStage for PrepareWorkspaceStage {
    async fn process(&self, ctx: &mut JobContext) -> Result<(), TfError> {
        tokio::fs::create_dir_all(&ctx.workspace_dir).await.map_err(|e| {
            TfError::new(ErrorCode::Internal, format!("failed to create workspace: {e}"))
                .with_context("workspace_dir", ctx.workspace_dir.display().to_string())
        })
    }

    fn name(&self) -> &str {
        "prepare_workspace"
    }
}

/// Downloads the order's input product from the first hub that has it.
pub struct DownloadStage {
    hubs: Arc<HubsConfig>,
}

impl DownloadStage {
    /// Build a stage that tries each of `hubs` in order.
    pub fn new(hubs: Arc<HubsConfig>) -> Self {
        Self { hubs }
    }
}

#[async_trait]
impl PipelineStage for DownloadStage {
    async fn process(&self, ctx: &mut JobContext) -> Result<(), TfError> {
        let reference = &ctx.order.input_product_reference.reference;
        let path = tf_hubs::download_product(reference, &self.hubs.hubs, &ctx.workspace_dir).await?;
        ctx.input_path = Some(path);
        Ok(())
    }

    fn name(&self) -> &str {
        "download"
    }
}

/// Extracts a downloaded zip archive into `workspace_dir/input`, if the
/// download is in fact a zip (most hub products are).
pub struct UnpackStage;

#[async_trait]
impl PipelineStage for UnpackStage {
    async fn process(&self, ctx: &mut JobContext) -> Result<(), TfError> {
        let Some(archive_path) = ctx.input_path.clone() else {
            return Err(TfError::new(ErrorCode::Internal, "unpack stage ran before download"));
        };
        if archive_path.extension().and_then(|e| e.to_str()) != Some("zip") {
            return Ok(());
        }

        let dest = ctx.workspace_dir.join("input");
        let dest_clone = dest.clone();
        tokio::task::spawn_blocking(move || -> Result<(), TfError> {
            let file = std::fs::File::open(&archive_path).map_err(|e| {
                TfError::new(ErrorCode::Internal, format!("failed to open archive: {e}"))
            })?;
            let mut archive = zip::ZipArchive::new(file).map_err(|e| {
                TfError::new(ErrorCode::Internal, format!("invalid zip archive: {e}"))
            })?;
            archive.extract(&dest_clone).map_err(|e| {
                TfError::new(ErrorCode::Internal, format!("failed to extract archive: {e}"))
            })
        })
        .await
        .map_err(|e| TfError::new(ErrorCode::Internal, format!("unpack task panicked: {e}")))??;

        ctx.input_path = Some(dest);
        Ok(())
    }

    fn name(&self) -> &str {
        "unpack"
    }
}

/// Runs the workflow's registered [`ProcessingPlugin`] against the unpacked
/// input, producing the raw (unpackaged) output.
pub struct ProcessStage {
    plugins: Arc<BTreeMap<String, Arc<dyn ProcessingPlugin>>>,
}

impl ProcessStage {
    /// Build a stage that dispatches to one of `plugins`, keyed by workflow id.
    pub fn new(plugins: Arc<BTreeMap<String, Arc<dyn ProcessingPlugin>>>) -> Self {
        Self { plugins }
    }
}

#[async_trait]
impl PipelineStage for ProcessStage {
    async fn process(&self, ctx: &mut JobContext) -> Result<(), TfError> {
        let input_path = ctx.input_path.clone().ok_or_else(|| {
            TfError::new(ErrorCode::Internal, "process stage ran before download/unpack")
        })?;
        let plugin = self.plugins.get(&ctx.order.workflow_id).ok_or_else(|| {
            TfError::new(
                ErrorCode::WorkflowNotFound,
                format!("no plugin registered for workflow '{}'", ctx.order.workflow_id),
            )
        })?;

        debug!(workflow = %ctx.order.workflow_id, "dispatching to processing plugin");
        let output = plugin
            .execute(&input_path, &ctx.workspace_dir, &ctx.order.workflow_options)
            .await?;
        ctx.plugin_output_path = Some(output);
        Ok(())
    }

    fn name(&self) -> &str {
        "process"
    }
}

/// Zips the plugin's raw output into the server's output directory, under a
/// path derived from the order id.
pub struct RepackageStage {
    output_dir: PathBuf,
}

impl RepackageStage {
    /// Build a stage that publishes into `output_dir`.
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }
}

/// Derive the published zip's base name from the plugin's raw output path,
/// stripping a trailing `.SAFE` product marker if present.
fn product_stem(plugin_output: &std::path::Path) -> String {
    let name = plugin_output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    name.strip_suffix(".SAFE").unwrap_or(&name).to_string()
}

#[async_trait]
impl PipelineStage for RepackageStage {
    async fn process(&self, ctx: &mut JobContext) -> Result<(), TfError> {
        let plugin_output = ctx.plugin_output_path.clone().ok_or_else(|| {
            TfError::new(ErrorCode::Internal, "repackage stage ran before processing")
        })?;

        let stem = product_stem(&plugin_output);
        let order_dir = self.output_dir.join(ctx.order.id.to_string());
        let relative_name = format!("{}/{stem}.zip", ctx.order.id);
        let dest_path = order_dir.join(format!("{stem}.zip"));
        tokio::fs::create_dir_all(&order_dir).await.map_err(|e| {
            TfError::new(ErrorCode::OutputMissing, format!("failed to create output dir: {e}"))
        })?;

        let dest_clone = dest_path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), TfError> {
            let file = std::fs::File::create(&dest_clone).map_err(|e| {
                TfError::new(ErrorCode::OutputMissing, format!("failed to create output archive: {e}"))
            })?;
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();

            if plugin_output.is_dir() {
                for entry in walkdir::WalkDir::new(&plugin_output).into_iter().filter_map(|e| e.ok()) {
                    let path = entry.path();
                    let name = path.strip_prefix(&plugin_output).unwrap_or(path);
                    if entry.file_type().is_file() {
                        writer
                            .start_file(name.to_string_lossy(), options)
                            .map_err(|e| TfError::new(ErrorCode::OutputMissing, e.to_string()))?;
                        let mut src = std::fs::File::open(path)
                            .map_err(|e| TfError::new(ErrorCode::OutputMissing, e.to_string()))?;
                        std::io::copy(&mut src, &mut writer)
                            .map_err(|e| TfError::new(ErrorCode::OutputMissing, e.to_string()))?;
                    }
                }
            } else {
                let name = plugin_output
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "output".to_string());
                writer
                    .start_file(name, options)
                    .map_err(|e| TfError::new(ErrorCode::OutputMissing, e.to_string()))?;
                let mut src = std::fs::File::open(&plugin_output)
                    .map_err(|e| TfError::new(ErrorCode::OutputMissing, e.to_string()))?;
                std::io::copy(&mut src, &mut writer)
                    .map_err(|e| TfError::new(ErrorCode::OutputMissing, e.to_string()))?;
            }

            writer
                .finish()
                .map_err(|e| TfError::new(ErrorCode::OutputMissing, e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| TfError::new(ErrorCode::OutputMissing, format!("repackage task panicked: {e}")))??;

        ctx.published_relative_path = Some(relative_name);
        Ok(())
    }

    fn name(&self) -> &str {
        "repackage"
    }
}

/// Hands the published output directory over to the deployment's configured
/// owner/group, via the `OUTPUT_OWNER_ID`/`OUTPUT_GROUP_OWNER_ID` environment
/// variables.
///
/// Best-effort: a no-op when neither variable is set or on non-Unix targets,
/// and a failed `chown` only warns — the order is already `Completed` with a
/// real product on disk, and ownership is the deploying environment's
/// concern, not a reason to fail the run.
pub struct ChownStage {
    output_dir: PathBuf,
}

impl ChownStage {
    /// Build a stage that chowns published output under `output_dir`.
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }
}

#[async_trait]
impl PipelineStage for ChownStage {
    async fn process(&self, ctx: &mut JobContext) -> Result<(), TfError> {
        if !cfg!(unix) {
            return Ok(());
        }

        let owner = std::env::var("OUTPUT_OWNER_ID").ok().filter(|v| !v.is_empty());
        let group = std::env::var("OUTPUT_GROUP_OWNER_ID").ok().filter(|v| !v.is_empty());
        let (Some(owner), group) = (owner, group) else {
            return Ok(());
        };

        let spec = match group {
            Some(group) => format!("{owner}:{group}"),
            None => owner,
        };
        let order_dir = self.output_dir.join(ctx.order.id.to_string());

        match tokio::process::Command::new("chown").arg("-R").arg(&spec).arg(&order_dir).output().await
        {
            Ok(out) if out.status.success() => {}
            Ok(out) => warn!(
                order_id = %ctx.order.id,
                spec = %spec,
                stderr = %String::from_utf8_lossy(&out.stderr),
                "chown of published output failed, leaving default ownership"
            ),
            Err(e) => {
                warn!(order_id = %ctx.order.id, error = %e, "failed to spawn chown, leaving default ownership")
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "chown"
    }
}

/// An ordered chain of [`PipelineStage`]s executed sequentially.
pub struct Pipeline {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// Create an empty pipeline with no stages.
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a stage to the pipeline (builder pattern).
    #[must_use]
    pub fn stage<S: PipelineStage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Execute all stages in order against the given job context.
    pub async fn execute(&self, ctx: &mut JobContext) -> Result<(), TfError> {
        for stage in &self.stages {
            debug!(stage = %stage.name(), order_id = %ctx.order.id, "executing stage");
            stage.process(ctx).await?;
        }
        Ok(())
    }
}
