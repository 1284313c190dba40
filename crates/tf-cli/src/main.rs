// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command-line client for the transformation order server.
//!
//! Talks to a running `tf-daemon` over its OData-flavored HTTP API. Identity
//! is carried the same way the server expects it: `X-Username`/`X-Roles`
//! headers rather than a session or bearer token.
#![deny(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tf_core::{OrderRequest, ProductReference, TransformationOrder, WorkflowDescriptor};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Exit code for errors surfaced by the server or by this client.
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "tf", version, about = "Transformation order server client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of the running server, e.g. http://localhost:8080.
    #[arg(long, env = "TF_SERVER_URL", default_value = "http://localhost:8080")]
    server: String,

    /// Username sent as the X-Username header.
    #[arg(long, env = "TF_USERNAME")]
    username: String,

    /// Comma-separated roles sent as the X-Roles header.
    #[arg(long, env = "TF_ROLES", default_value = "")]
    roles: String,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the workflows the server has discovered.
    Workflows,

    /// Submit a new transformation order.
    Submit {
        /// Id of the workflow to run.
        #[arg(long)]
        workflow: String,

        /// Reference of the input product.
        #[arg(long)]
        product: String,

        /// Workflow options as key=json-value pairs. Repeatable.
        ///
        /// Example: --option resolution=10 --option format=\"GeoTIFF\"
        #[arg(long = "option")]
        options: Vec<String>,

        /// Wait for the order to reach a terminal state before returning.
        #[arg(long)]
        wait: bool,
    },

    /// List orders visible to the caller, optionally filtered.
    List {
        /// An OData `$filter` expression, e.g. "Status eq 'completed'".
        #[arg(long = "filter")]
        filter: Option<String>,
    },

    /// Count orders visible to the caller, optionally filtered.
    Count {
        #[arg(long = "filter")]
        filter: Option<String>,
    },

    /// Fetch a single order by id.
    Get {
        /// Order id.
        id: Uuid,
    },

    /// Fetch the structured log for an order.
    Log {
        /// Order id.
        id: Uuid,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("tf=debug")
    } else {
        EnvFilter::new("tf=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let client = match Client::builder().timeout(Duration::from_secs(30)).build() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: building http client: {e}");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    };

    let ctx = RequestCtx {
        client,
        server: cli.server.trim_end_matches('/').to_string(),
        username: cli.username,
        roles: cli.roles,
    };

    let result = match cli.command {
        Commands::Workflows => cmd_workflows(&ctx).await,
        Commands::Submit {
            workflow,
            product,
            options,
            wait,
        } => cmd_submit(&ctx, workflow, product, options, wait).await,
        Commands::List { filter } => cmd_list(&ctx, filter).await,
        Commands::Count { filter } => cmd_count(&ctx, filter).await,
        Commands::Get { id } => cmd_get(&ctx, id).await,
        Commands::Log { id } => cmd_log(&ctx, id).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

struct RequestCtx {
    client: Client,
    server: String,
    username: String,
    roles: String,
}

impl RequestCtx {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.server, path))
            .header("x-username", &self.username)
            .header("x-roles", &self.roles)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    bail!("server returned {status}: {body}");
}

async fn cmd_workflows(ctx: &RequestCtx) -> Result<()> {
    let resp = ctx
        .request(reqwest::Method::GET, "/Workflows")
        .send()
        .await
        .context("request /Workflows")?;
    let resp = check_status(resp).await?;
    let workflows: Vec<WorkflowDescriptor> = resp.json().await.context("parse workflows")?;
    for w in workflows {
        println!(
            "{:<24} {} -> {} (v{})",
            w.id, w.input_product_type, w.output_product_type, w.workflow_version
        );
    }
    Ok(())
}

fn parse_options(raw: &[String]) -> Result<BTreeMap<String, serde_json::Value>> {
    let mut options = BTreeMap::new();
    for item in raw {
        let (key, value) = item
            .split_once('=')
            .with_context(|| format!("malformed --option '{item}', expected key=value"))?;
        let parsed: serde_json::Value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        options.insert(key.to_string(), parsed);
    }
    Ok(options)
}

async fn cmd_submit(
    ctx: &RequestCtx,
    workflow: String,
    product: String,
    options: Vec<String>,
    wait: bool,
) -> Result<()> {
    let body = OrderRequest {
        workflow_id: workflow,
        input_product_reference: ProductReference {
            reference: product,
            data_source_name: None,
            content_date: None,
        },
        workflow_options: parse_options(&options)?,
    };

    let resp = ctx
        .request(reqwest::Method::POST, "/TransformationOrders")
        .json(&body)
        .send()
        .await
        .context("submit order")?;
    let resp = check_status(resp).await?;
    let mut order: TransformationOrder = resp.json().await.context("parse order")?;
    println!("order_id: {}", order.id);
    println!("status:   {:?}", order.status);

    if wait {
        order = poll_until_terminal(ctx, order.id).await?;
        println!("final status: {:?}", order.status);
        if let Some(uri) = &order.download_uri {
            println!("download_uri: {uri}");
        }
    }
    Ok(())
}

async fn poll_until_terminal(ctx: &RequestCtx, id: Uuid) -> Result<TransformationOrder> {
    loop {
        let order = fetch_order(ctx, id).await?;
        if order.status.is_terminal() {
            return Ok(order);
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

async fn fetch_order(ctx: &RequestCtx, id: Uuid) -> Result<TransformationOrder> {
    let resp = ctx
        .request(reqwest::Method::GET, &format!("/TransformationOrders('{id}')"))
        .send()
        .await
        .context("fetch order")?;
    let resp = check_status(resp).await?;
    resp.json().await.context("parse order")
}

fn with_filter(path: &str, filter: &Option<String>) -> String {
    match filter {
        Some(f) => format!("{path}?$filter={}", urlencode(f)),
        None => path.to_string(),
    }
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

async fn cmd_list(ctx: &RequestCtx, filter: Option<String>) -> Result<()> {
    let path = with_filter("/TransformationOrders", &filter);
    let resp = ctx
        .request(reqwest::Method::GET, &path)
        .send()
        .await
        .context("list orders")?;
    let resp = check_status(resp).await?;
    let orders: Vec<TransformationOrder> = resp.json().await.context("parse orders")?;
    for o in orders {
        println!("{} {:?} {}", o.id, o.status, o.workflow_id);
    }
    Ok(())
}

async fn cmd_count(ctx: &RequestCtx, filter: Option<String>) -> Result<()> {
    let path = with_filter("/TransformationOrders/$count", &filter);
    let resp = ctx
        .request(reqwest::Method::GET, &path)
        .send()
        .await
        .context("count orders")?;
    let resp = check_status(resp).await?;
    let count: usize = resp.json().await.context("parse count")?;
    println!("{count}");
    Ok(())
}

async fn cmd_get(ctx: &RequestCtx, id: Uuid) -> Result<()> {
    let order = fetch_order(ctx, id).await?;
    println!("{}", serde_json::to_string_pretty(&order)?);
    Ok(())
}

async fn cmd_log(ctx: &RequestCtx, id: Uuid) -> Result<()> {
    let resp = ctx
        .request(reqwest::Method::GET, &format!("/TransformationOrders('{id}')/Log"))
        .send()
        .await
        .context("fetch log")?;
    let resp = check_status(resp).await?;
    let body: serde_json::Value = resp.json().await.context("parse log")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options_accepts_json_and_bare_strings() {
        let parsed = parse_options(&["resolution=10".into(), "format=\"GeoTIFF\"".into()]).unwrap();
        assert_eq!(parsed["resolution"], serde_json::json!(10));
        assert_eq!(parsed["format"], serde_json::json!("GeoTIFF"));
    }

    #[test]
    fn parse_options_rejects_missing_equals() {
        assert!(parse_options(&["resolution".into()]).is_err());
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("Status eq 'completed'"), "Status%20eq%20%27completed%27");
    }

    #[test]
    fn with_filter_appends_query_only_when_present() {
        assert_eq!(with_filter("/TransformationOrders", &None), "/TransformationOrders");
        assert!(with_filter("/TransformationOrders", &Some("a eq 1".into())).contains("$filter="));
    }
}
