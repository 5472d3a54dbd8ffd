// src/server/gateway.rs

//! The mTLS-authenticated HTTP API.
//!
//! Admission is deliberately thin: presence checks and numeric parsing
//! only, so the HTTP path never blocks on SQL. Everything heavier runs in
//! the worker, and the task id returned here is the handle for watching it.

use super::context::AppState;
use crate::config::Config;
use crate::core::autorepair::{ExceptionStatusEntry, update_exception_status};
use crate::core::cluster::ClusterSpec;
use crate::core::diff::TableName;
use crate::core::diff::rerun::RerunBehavior;
use crate::core::errors::AceError;
use crate::core::pool::ClusterPools;
use crate::core::runner::{
    RepsetDiffParams, SchemaDiffParams, SpockDiffParams, TableDiffParams, TableRepairParams,
    TableRerunParams, TaskPayload,
};
use crate::core::taskstore::TaskRecord;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Inclusive bounds accepted for `block_rows`.
const MIN_BLOCK_ROWS: u64 = 1_000;
const MAX_BLOCK_ROWS: u64 = 100_000;

/// Identity established by the TLS handshake: the client certificate's
/// subject CN. Attached to the connection before any request is served.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub cn: Option<String>,
}

/// Maps core errors onto the HTTP surface.
pub struct GatewayError(pub AceError);

impl From<AceError> for GatewayError {
    fn from(e: AceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AceError::Validation(_)
            | AceError::ClusterNotFound(_)
            | AceError::InvalidClusterSpec(_)
            | AceError::NoKey(_)
            | AceError::DiffFile(_) => StatusCode::BAD_REQUEST,
            AceError::Auth(_) => StatusCode::UNAUTHORIZED,
            AceError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Builds the API router. The identity middleware rejects any request that
/// arrives without a certificate CN.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ace/table-diff", post(table_diff_handler))
        .route("/ace/table-repair", post(table_repair_handler))
        .route("/ace/table-rerun", post(table_rerun_handler))
        .route("/ace/repset-diff", post(repset_diff_handler))
        .route("/ace/spock-diff", post(spock_diff_handler))
        .route("/ace/schema-diff", post(schema_diff_handler))
        .route("/ace/task-status", get(task_status_handler))
        .route(
            "/ace/update-spock-exception",
            post(update_spock_exception_handler),
        )
        .layer(middleware::from_fn(require_client_cn))
        .with_state(state)
}

/// Every endpoint requires an authenticated client CN.
async fn require_client_cn(req: Request, next: Next) -> Response {
    let cn = req
        .extensions()
        .get::<ClientIdentity>()
        .and_then(|identity| identity.cn.clone());
    match cn {
        Some(_) => next.run(req).await,
        None => GatewayError(AceError::Auth(
            "client certificate with a subject CN is required".to_string(),
        ))
        .into_response(),
    }
}

fn client_role(identity: &ClientIdentity) -> String {
    identity.cn.clone().unwrap_or_default()
}

// --- Query-parameter helpers -------------------------------------------------

type Params = HashMap<String, String>;

fn required<'a>(params: &'a Params, name: &str) -> Result<&'a str, AceError> {
    params
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AceError::Validation(format!("{name} is a required parameter")))
}

fn optional(params: &Params, name: &str) -> Option<String> {
    params.get(name).filter(|v| !v.trim().is_empty()).cloned()
}

fn parse_u64(params: &Params, name: &str, default: u64) -> Result<u64, AceError> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| AceError::Validation(format!("{name} must be an integer, got '{raw}'"))),
    }
}

fn parse_f64(params: &Params, name: &str, default: f64) -> Result<f64, AceError> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| AceError::Validation(format!("{name} must be a number, got '{raw}'"))),
    }
}

fn parse_bool(params: &Params, name: &str) -> Result<bool, AceError> {
    match params.get(name).map(|s| s.to_ascii_lowercase()) {
        None => Ok(false),
        Some(raw) => match raw.as_str() {
            "true" | "t" | "1" | "yes" => Ok(true),
            "false" | "f" | "0" | "no" => Ok(false),
            _ => Err(AceError::Validation(format!(
                "{name} must be a boolean, got '{raw}'"
            ))),
        },
    }
}

fn check_block_rows(block_rows: u64) -> Result<(), AceError> {
    if !(MIN_BLOCK_ROWS..=MAX_BLOCK_ROWS).contains(&block_rows) {
        return Err(AceError::Validation(format!(
            "block_rows must be between {MIN_BLOCK_ROWS} and {MAX_BLOCK_ROWS}"
        )));
    }
    Ok(())
}

fn check_output(output: &str) -> Result<(), AceError> {
    if output != "json" {
        return Err(AceError::Validation(format!(
            "unsupported output format '{output}'"
        )));
    }
    Ok(())
}

// --- Admission validation (pure; exercised directly by tests) ---------------

pub fn table_diff_params(params: &Params, config: &Config) -> Result<TableDiffParams, AceError> {
    let cluster_name = required(params, "cluster_name")?.to_string();
    let table_name = required(params, "table_name")?.to_string();
    TableName::parse(&table_name)?;

    let block_rows = parse_u64(params, "block_rows", config.block_rows)?;
    check_block_rows(block_rows)?;
    let max_cpu_ratio = parse_f64(params, "max_cpu_ratio", config.max_cpu_ratio)?;
    if !(max_cpu_ratio > 0.0 && max_cpu_ratio <= 1.0) {
        return Err(AceError::Validation(
            "max_cpu_ratio must be in (0.0, 1.0]".to_string(),
        ));
    }
    let batch_size = parse_u64(params, "batch_size", config.batch_size)?;
    if batch_size == 0 {
        return Err(AceError::Validation("batch_size cannot be 0".to_string()));
    }
    let output = optional(params, "output").unwrap_or_else(|| "json".to_string());
    check_output(&output)?;

    Ok(TableDiffParams {
        cluster_name,
        table_name,
        dbname: optional(params, "dbname"),
        block_rows,
        max_cpu_ratio,
        batch_size,
        nodes: optional(params, "nodes").unwrap_or_else(|| "all".to_string()),
        output,
        quiet: parse_bool(params, "quiet")?,
        table_filter: optional(params, "table_filter"),
    })
}

pub fn table_repair_params(
    params: &Params,
    _config: &Config,
) -> Result<TableRepairParams, AceError> {
    let cluster_name = required(params, "cluster_name")?.to_string();
    let diff_file = required(params, "diff_file")?.to_string();
    let table_name = required(params, "table_name")?.to_string();
    TableName::parse(&table_name)?;

    let fix_nulls = parse_bool(params, "fix_nulls")?;
    let source_of_truth = optional(params, "source_of_truth");
    if !fix_nulls && source_of_truth.is_none() {
        return Err(AceError::Validation(
            "source_of_truth is required when fix_nulls mode is not enabled".to_string(),
        ));
    }

    Ok(TableRepairParams {
        cluster_name,
        diff_file,
        source_of_truth,
        table_name,
        dbname: optional(params, "dbname"),
        dry_run: parse_bool(params, "dry_run")?,
        quiet: parse_bool(params, "quiet")?,
        generate_report: parse_bool(params, "generate_report")?,
        upsert_only: parse_bool(params, "upsert_only")?,
        fix_nulls,
    })
}

pub fn table_rerun_params(params: &Params, _config: &Config) -> Result<TableRerunParams, AceError> {
    let cluster_name = required(params, "cluster_name")?.to_string();
    let diff_file = required(params, "diff_file")?.to_string();
    let table_name = required(params, "table_name")?.to_string();
    TableName::parse(&table_name)?;

    let behavior = optional(params, "behavior").unwrap_or_else(|| "multiprocessing".to_string());
    RerunBehavior::from_str(&behavior)
        .map_err(|_| AceError::Validation(format!("Invalid behavior: {behavior}")))?;

    Ok(TableRerunParams {
        cluster_name,
        diff_file,
        table_name,
        dbname: optional(params, "dbname"),
        quiet: parse_bool(params, "quiet")?,
        behavior,
    })
}

pub fn repset_diff_params(params: &Params, config: &Config) -> Result<RepsetDiffParams, AceError> {
    let cluster_name = required(params, "cluster_name")?.to_string();
    let repset_name = required(params, "repset_name")?.to_string();

    let block_rows = parse_u64(params, "block_rows", config.block_rows)?;
    check_block_rows(block_rows)?;
    let max_cpu_ratio = parse_f64(params, "max_cpu_ratio", config.max_cpu_ratio)?;
    if !(max_cpu_ratio > 0.0 && max_cpu_ratio <= 1.0) {
        return Err(AceError::Validation(
            "max_cpu_ratio must be in (0.0, 1.0]".to_string(),
        ));
    }
    let batch_size = parse_u64(params, "batch_size", config.batch_size)?;
    if batch_size == 0 {
        return Err(AceError::Validation("batch_size cannot be 0".to_string()));
    }
    let output = optional(params, "output").unwrap_or_else(|| "json".to_string());
    check_output(&output)?;

    Ok(RepsetDiffParams {
        cluster_name,
        repset_name,
        dbname: optional(params, "dbname"),
        block_rows,
        max_cpu_ratio,
        batch_size,
        nodes: optional(params, "nodes").unwrap_or_else(|| "all".to_string()),
        output,
        quiet: parse_bool(params, "quiet")?,
        skip_tables: optional(params, "skip_tables"),
    })
}

pub fn schema_diff_params(params: &Params, _config: &Config) -> Result<SchemaDiffParams, AceError> {
    let cluster_name = required(params, "cluster_name")?.to_string();
    let schema_name = required(params, "schema_name")?.to_string();

    Ok(SchemaDiffParams {
        cluster_name,
        schema_name,
        dbname: optional(params, "dbname"),
        nodes: optional(params, "nodes").unwrap_or_else(|| "all".to_string()),
        quiet: parse_bool(params, "quiet")?,
    })
}

pub fn spock_diff_params(params: &Params, _config: &Config) -> Result<SpockDiffParams, AceError> {
    let cluster_name = required(params, "cluster_name")?.to_string();

    Ok(SpockDiffParams {
        cluster_name,
        dbname: optional(params, "dbname"),
        nodes: optional(params, "nodes").unwrap_or_else(|| "all".to_string()),
        quiet: parse_bool(params, "quiet")?,
    })
}

// --- Handlers ----------------------------------------------------------------

/// Enrols the task and queues it; the response carries the handle the
/// client polls with.
async fn submit(
    state: &AppState,
    payload: TaskPayload,
    role: String,
) -> Result<Json<Value>, GatewayError> {
    let record = TaskRecord::new(payload.task_type(), payload.context(), &role);
    let task_id = record.task_id.clone();
    let submitted_at = record.submitted_at;
    state.store.create(record).await?;

    let runner = state.runner.clone();
    state.workers.submit(runner.run(task_id.clone()))?;

    info!("Task {task_id} ({}) admitted for '{role}'.", payload.task_type());
    Ok(Json(json!({
        "task_id": task_id,
        "submitted_at": submitted_at.to_rfc3339(),
    })))
}

async fn table_diff_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Query(params): Query<Params>,
) -> Result<Json<Value>, GatewayError> {
    let p = table_diff_params(&params, &state.config)?;
    submit(&state, TaskPayload::TableDiff(p), client_role(&identity)).await
}

async fn table_repair_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Query(params): Query<Params>,
) -> Result<Json<Value>, GatewayError> {
    let p = table_repair_params(&params, &state.config)?;
    submit(&state, TaskPayload::TableRepair(p), client_role(&identity)).await
}

async fn table_rerun_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Query(params): Query<Params>,
) -> Result<Json<Value>, GatewayError> {
    let p = table_rerun_params(&params, &state.config)?;
    submit(&state, TaskPayload::TableRerun(p), client_role(&identity)).await
}

async fn repset_diff_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Query(params): Query<Params>,
) -> Result<Json<Value>, GatewayError> {
    let p = repset_diff_params(&params, &state.config)?;
    submit(&state, TaskPayload::RepsetDiff(p), client_role(&identity)).await
}

async fn schema_diff_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Query(params): Query<Params>,
) -> Result<Json<Value>, GatewayError> {
    let p = schema_diff_params(&params, &state.config)?;
    submit(&state, TaskPayload::SchemaDiff(p), client_role(&identity)).await
}

async fn spock_diff_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Query(params): Query<Params>,
) -> Result<Json<Value>, GatewayError> {
    let p = spock_diff_params(&params, &state.config)?;
    submit(&state, TaskPayload::SpockDiff(p), client_role(&identity)).await
}

async fn task_status_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Json<Value>, GatewayError> {
    let task_id = required(&params, "task_id")?;
    let record = state.store.get(task_id)?;
    Ok(Json(serde_json::to_value(&record).map_err(AceError::from)?))
}

/// Synchronous by design: the status update is a single small transaction
/// and the caller wants the outcome in the response.
async fn update_spock_exception_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
    Json(entry): Json<ExceptionStatusEntry>,
) -> Result<Json<Value>, GatewayError> {
    let cluster_name = required(&params, "cluster_name")?.to_string();
    let node_name = required(&params, "node_name")?.to_string();
    entry.validate()?;

    let spec = ClusterSpec::load(&state.config.cluster_dir, &cluster_name)?;
    let node = spec.resolve_one(None, &node_name)?;
    let pools = ClusterPools::build(
        std::slice::from_ref(&node),
        state.config.statement_timeout_ms,
        1,
    )?;
    update_exception_status(&pools, &node_name, &entry).await?;

    Ok(Json(json!({
        "message": "Exception status updated successfully"
    })))
}
