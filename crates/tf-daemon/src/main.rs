// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tf_daemon::middleware::{CorsConfig, RequestLogger, request_id_middleware};
use tf_daemon::{AppState, build_app};
use tf_queue::Queue;
use tf_registry::Registry;
use tf_runner::{JobRunner, ProcessingPlugin, RunnerConfig};
use tf_trace::{HttpTraceSigner, NullTraceSigner, TraceSigner};
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tf-daemon", version, about = "Transformation order server")]
struct Args {
    /// Path to the server's TOML configuration file.
    #[arg(long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Directory to scan for `*.workflow.yaml` workflow manifests.
    #[arg(long, default_value = "config/workflows")]
    workflows_dir: PathBuf,

    /// Enable verbose request/response logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("tf=debug,tower_http=debug")
    } else {
        EnvFilter::new("tf=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).json().init();

    let config = tf_config::load_server_config(&args.config)
        .with_context(|| format!("load server config from {}", args.config.display()))?;
    let warnings = tf_config::validate_server_config(&config).context("validate server config")?;
    for warning in warnings {
        tracing::warn!(%warning, "server configuration warning");
    }

    let roles = Arc::new(
        tf_config::load_roles_config(std::path::Path::new(&config.roles_config_path))
            .context("load roles config")?,
    );
    tf_config::validate_roles_config(&roles, &config.default_role)
        .context("validate roles config")?;

    let hubs = Arc::new(
        tf_config::load_hubs_config(std::path::Path::new(&config.hubs_config_path))
            .context("load hubs config")?,
    );

    let trace_signer: Arc<dyn TraceSigner> = match &config.trace_config_path {
        Some(path) => {
            let trace_config = tf_config::load_trace_config(std::path::Path::new(path))
                .context("load trace config")?;
            Arc::new(HttpTraceSigner::new(trace_config))
        }
        None => Arc::new(NullTraceSigner),
    };

    let registry = Arc::new(
        Registry::discover(&args.workflows_dir).context("discover workflow manifests")?,
    );
    info!(count = registry.len(), "workflows discovered");

    // Processing plugins are registered by the deployment, not discovered;
    // none are wired in by default here.
    let plugins: Arc<BTreeMap<String, Arc<dyn ProcessingPlugin>>> = Arc::new(BTreeMap::new());

    let runner = Arc::new(JobRunner::new(
        hubs,
        plugins,
        trace_signer,
        RunnerConfig {
            processing_dir: PathBuf::from(&config.processing_dir),
            output_dir: PathBuf::from(&config.output_dir),
            download_uri_root: config.download_uri_root.clone(),
            monitor_poll: std::time::Duration::from_secs(config.monitor_poll_secs),
        },
    ));

    let state = Arc::new(AppState {
        queue: Arc::new(Mutex::new(Queue::new())),
        registry,
        roles,
        config: config.clone(),
        runner,
        logs: Arc::new(Mutex::new(BTreeMap::new())),
    });

    let app = build_app(state)
        .layer(axum::middleware::from_fn(RequestLogger::layer))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(CorsConfig::permissive().to_cors_layer());

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!(bind = %config.bind, "tf-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
