// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control-plane for the transformation order server.
//!
//! Exposes the OData-flavored submission API: `Workflows`/
//! `TransformationOrders` collections, `$filter`/`$count` query support,
//! and identity carried by `X-Username`/`X-Roles` headers rather than a
//! session.
#![deny(unsafe_code)]

/// Middleware stack (request id, request logging, CORS).
pub mod middleware;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path as AxPath, Query, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tf_config::{RolesConfig, ServerConfig};
use tf_core::{OrderRequest, TransformationOrder, WorkflowDescriptor};
use tf_error::{ErrorCode, TfError};
use tf_queue::Queue;
use tf_registry::Registry;
use tf_runner::{JobEvent, JobRunner};
use tokio::sync::{Mutex, RwLock};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

const ROLE_MANAGER: &str = "manager";

/// Shared state handed to every Axum handler.
pub struct AppState {
    /// In-memory order table.
    pub queue: Arc<Mutex<Queue>>,
    /// Discovered workflow descriptors.
    pub registry: Arc<Registry>,
    /// Role-to-quota mapping.
    pub roles: Arc<RolesConfig>,
    /// Static server configuration.
    pub config: ServerConfig,
    /// Job runner used to execute admitted orders.
    pub runner: Arc<JobRunner>,
    /// Per-order structured log events, in arrival order.
    pub logs: Arc<Mutex<BTreeMap<Uuid, Vec<LogEntry>>>>,
}

/// A single structured log event attached to an order.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Event payload, as reported by the job runner.
    pub message: String,
}

/// Identity extracted from the `X-Username`/`X-Roles` headers.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Submitting user id.
    pub user_id: String,
    /// Comma-separated roles the caller presented.
    pub roles: Vec<String>,
}

impl Identity {
    fn is_manager(&self) -> bool {
        self.roles.iter().any(|r| r == ROLE_MANAGER)
    }
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let user_id = headers
            .get("x-username")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ApiError::from(
                    TfError::new(ErrorCode::RequestMalformed, "missing X-Username header"),
                )
            })?;
        let roles = headers
            .get("x-roles")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').map(|r| r.trim().to_string()).filter(|r| !r.is_empty()).collect())
            .unwrap_or_default();
        Ok(Identity { user_id, roles })
    }
}

/// An error ready to be rendered as a JSON API response.
#[derive(Debug)]
pub struct ApiError(TfError);

impl From<TfError> for ApiError {
    fn from(e: TfError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(tf_error::TfErrorBody::from(&self.0));
        (status, body).into_response()
    }
}

/// Build the Axum router with every documented route.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/Workflows", get(cmd_list_workflows))
        .route("/Workflows('{id}')", get(cmd_get_workflow))
        .route(
            "/TransformationOrders",
            get(cmd_list_orders).post(cmd_create_order),
        )
        .route("/TransformationOrders/$count", get(cmd_count_orders))
        .route("/TransformationOrders('{id}')", get(cmd_get_order))
        .route("/TransformationOrders('{id}')/Log", get(cmd_get_order_log))
        .with_state(state)
}

async fn cmd_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "time": Utc::now().to_rfc3339() }))
}

async fn cmd_list_workflows(State(state): State<Arc<AppState>>) -> Json<Vec<WorkflowDescriptor>> {
    Json(state.registry.all().into_iter().cloned().collect())
}

async fn cmd_get_workflow(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
) -> Result<Json<WorkflowDescriptor>, ApiError> {
    Ok(Json(state.registry.require(&id)?.clone()))
}

#[derive(Debug, Deserialize)]
struct OrdersQuery {
    #[serde(rename = "$filter")]
    filter: Option<String>,
}

async fn cmd_list_orders(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(q): Query<OrdersQuery>,
) -> Result<Json<Vec<TransformationOrder>>, ApiError> {
    let clauses = match &q.filter {
        Some(f) => tf_odata::parse_filter(f)?,
        None => Vec::new(),
    };
    let queue = state.queue.lock().await;
    let filter_by_user = !identity.is_manager();
    let orders: Vec<TransformationOrder> = queue
        .list(&clauses, &identity.user_id, filter_by_user)
        .into_iter()
        .cloned()
        .collect();
    Ok(Json(orders))
}

async fn cmd_count_orders(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(q): Query<OrdersQuery>,
) -> Result<Json<usize>, ApiError> {
    let clauses = match &q.filter {
        Some(f) => tf_odata::parse_filter(f)?,
        None => Vec::new(),
    };
    let queue = state.queue.lock().await;
    let filter_by_user = !identity.is_manager();
    Ok(Json(queue.count(&clauses, &identity.user_id, filter_by_user)))
}

async fn cmd_get_order(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    AxPath(id): AxPath<Uuid>,
) -> Result<Json<TransformationOrder>, ApiError> {
    let queue = state.queue.lock().await;
    let order = queue.require(id)?;
    if !identity.is_manager() && order.user_id != identity.user_id {
        return Err(ApiError::from(
            TfError::new(ErrorCode::RoleNotPermitted, "order belongs to a different user")
                .with_context("order_id", id.to_string()),
        ));
    }
    Ok(Json(order.clone()))
}

async fn cmd_get_order_log(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    AxPath(id): AxPath<Uuid>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    {
        let queue = state.queue.lock().await;
        let order = queue.require(id)?;
        if !identity.is_manager() && order.user_id != identity.user_id {
            return Err(ApiError::from(TfError::new(
                ErrorCode::RoleNotPermitted,
                "order belongs to a different user",
            )));
        }
    }
    let logs = state.logs.lock().await;
    Ok(Json(logs.get(&id).cloned().unwrap_or_default()))
}

async fn cmd_create_order(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(req): Json<OrderRequest>,
) -> Result<Response, ApiError> {
    let order = submit_workflow(&state, &identity, req).await?;
    let location = format!("/TransformationOrders('{}')", order.id);
    let mut response = (StatusCode::CREATED, Json(order)).into_response();
    if let Ok(value) = axum::http::HeaderValue::from_str(&location) {
        response.headers_mut().insert(axum::http::header::LOCATION, value);
    }
    Ok(response)
}

/// Resolve the caller's quota as the max over every mapped role, falling
/// back to `default_role`'s quota if none of the caller's roles are known.
fn effective_quota(roles: &[String], roles_cfg: &RolesConfig, default_role: &str) -> usize {
    let mapped: Vec<usize> = roles
        .iter()
        .filter_map(|r| match roles_cfg.roles.get(r) {
            Some(entry) => Some(entry.max_uncompleted_orders),
            None => {
                warn!(role = %r, "unknown role, skipping for quota purposes");
                None
            }
        })
        .collect();

    if let Some(max) = mapped.into_iter().max() {
        return max;
    }
    roles_cfg
        .roles
        .get(default_role)
        .map(|e| e.max_uncompleted_orders)
        .unwrap_or(0)
}

/// Whether a completed order's published output still exists on disk under
/// the configured output directory. A `Completed` order whose output has
/// since been removed (e.g. by the keeping-period sweep or manual cleanup)
/// is treated as if it had never completed, so resubmission produces it again.
fn completed_output_exists(state: &Arc<AppState>, order: &TransformationOrder) -> bool {
    match &order.output_product_reference {
        Some(rel) => std::path::Path::new(&state.config.output_dir).join(rel).exists(),
        None => false,
    }
}

/// Derive a stable order id for a submission, so identical resubmissions of
/// the same workflow/product/options/trace-effective-setting dedupe onto the
/// same order.
fn order_key(req: &OrderRequest, trace_enabled_effective: bool) -> Uuid {
    let namespace = Uuid::NAMESPACE_OID;
    let options_json = serde_json::to_string(&req.workflow_options).unwrap_or_default();
    let name = format!(
        "{}|{}|{}|{}",
        req.workflow_id, req.input_product_reference.reference, options_json, trace_enabled_effective
    );
    Uuid::new_v5(&namespace, name.as_bytes())
}

/// The admission sequence described for the Queue coordinator: quota
/// enforcement, workflow/option validation, dedup-by-content, and dispatch
/// to the job runner.
async fn submit_workflow(
    state: &Arc<AppState>,
    identity: &Identity,
    req: OrderRequest,
) -> Result<TransformationOrder, TfError> {
    {
        let mut queue = state.queue.lock().await;
        let evicted = queue.evict_old(
            chrono::Duration::minutes(state.config.keeping_period_minutes as i64),
            Utc::now(),
        );
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted stale orders during admission");
        }
    }

    let descriptor = state.registry.require(&req.workflow_id)?.clone();
    if state.config.excluded_workflows.iter().any(|w| w == &req.workflow_id) {
        return Err(TfError::new(
            ErrorCode::WorkflowExcluded,
            format!("workflow '{}' is excluded from admission", req.workflow_id),
        ));
    }
    if req.input_product_reference.data_source_name.is_none() {
        tf_core::product_ref::validate_product_reference_name(
            &req.input_product_reference.reference,
            &descriptor.input_product_type,
        )?;
    }
    let resolved_options = tf_core::validate_workflow_options(&descriptor, &req.workflow_options)?;

    let trace_enabled_effective = state.config.trace_config_path.is_some() && descriptor.supports_traceability;
    let order_id = order_key(&req, trace_enabled_effective);

    {
        let mut queue = state.queue.lock().await;
        if let Some(existing) = queue.get(order_id) {
            if existing.status == tf_core::OrderStatus::Failed {
                let mut resubmitted = existing.clone();
                resubmitted.reset_for_resubmit();
                queue.insert(resubmitted.clone());
                dispatch(state, resubmitted.clone(), descriptor);
                return Ok(resubmitted);
            }
            if existing.status == tf_core::OrderStatus::Completed && !completed_output_exists(state, existing)
            {
                let mut resubmitted = existing.clone();
                resubmitted.reset_for_resubmit();
                queue.insert(resubmitted.clone());
                dispatch(state, resubmitted.clone(), descriptor);
                return Ok(resubmitted);
            }
            return Ok(existing.clone());
        }
    }

    let quota = if state.config.quota_checking_enabled {
        effective_quota(&identity.roles, &state.roles, &state.config.default_role)
    } else {
        usize::MAX
    };
    let order = TransformationOrder::new(
        order_id,
        identity.user_id.clone(),
        identity.roles.clone(),
        req.workflow_id.clone(),
        req.input_product_reference,
        resolved_options,
        Utc::now(),
    );

    {
        let mut queue = state.queue.lock().await;
        queue.admit(order.clone(), quota)?;
    }

    dispatch(state, order.clone(), descriptor);
    Ok(order)
}

fn dispatch(state: &Arc<AppState>, order: TransformationOrder, descriptor: WorkflowDescriptor) {
    let order_id = order.id;
    let runner = Arc::clone(&state.runner);
    let queue = Arc::clone(&state.queue);
    let logs = Arc::clone(&state.logs);

    tokio::spawn(async move {
        let tf_runner::JobHandle { mut events, result, .. } = runner.run(order, descriptor);
        while let Some(event) = events.next().await {
            record_log(&logs, order_id, &event).await;
        }
        match result.await {
            Ok(final_order) => {
                let mut queue = queue.lock().await;
                queue.insert(final_order);
            }
            Err(e) => warn!(order_id = %order_id, error = %e, "job runner task panicked"),
        }
    });
}

async fn record_log(logs: &Arc<Mutex<BTreeMap<Uuid, Vec<LogEntry>>>>, order_id: Uuid, event: &JobEvent) {
    let message = format!("{event:?}");
    let mut guard = logs.lock().await;
    guard.entry(order_id).or_default().push(LogEntry {
        timestamp: Utc::now(),
        message,
    });
}
