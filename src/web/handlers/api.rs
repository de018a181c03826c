use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::audit::AuditRecord;
use crate::db::schema_manager::TableSchema;
use crate::pipeline::{Caller, PipelineError, PipelineResult};
use crate::safety::Verdict;
use crate::web::state::AppState;

const MAX_AUDIT_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub sql: String,
    pub database: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteQueryRequest {
    pub query: String,
    pub database: String,
    #[serde(flatten)]
    pub caller: Caller,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NlQueryRequest {
    pub question: String,
    pub database: String,
    /// Optional `user_id` and `session_id`, recorded in the audit log
    #[serde(flatten)]
    pub caller: Caller,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub description: String,
    /// False when no connection pool could be opened
    pub available: bool,
    pub tables: Vec<TableSchema>,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub structural_check: bool,
    pub llm_backend: String,
    pub database_count: usize,
    pub audit_enabled: bool,
}

#[derive(Debug, Serialize)]
struct RejectionBody<'a> {
    error: String,
    sql: Option<&'a str>,
    repair_attempts: u32,
    verdict: Option<&'a Verdict>,
}

/// Validates SQL without running it.
pub async fn validate_sql(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ValidateRequest>,
) -> Json<Verdict> {
    Json(state.pipeline.gate().validate(&payload.sql, &payload.database))
}

/// Validates and executes caller-supplied SQL, returning an Arrow IPC file.
pub async fn execute_query(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExecuteQueryRequest>,
) -> Response {
    info!("Executing SQL on {}", payload.database);
    match state
        .pipeline
        .execute_direct_for(&payload.query, &payload.database, &payload.caller)
        .await
    {
        Ok(result) => arrow_response(&result),
        Err(e) => pipeline_error_response(e),
    }
}

/// Answers a natural-language question, returning an Arrow IPC file.
pub async fn nl_query(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NlQueryRequest>,
) -> Response {
    match state
        .pipeline
        .run_for(&payload.question, &payload.database, &payload.caller)
        .await
    {
        Ok(result) => arrow_response(&result),
        Err(e) => pipeline_error_response(e),
    }
}

pub async fn list_databases(State(state): State<Arc<AppState>>) -> Json<Vec<DatabaseInfo>> {
    let pipeline = &state.pipeline;
    let mut databases = Vec::new();
    for policy in pipeline.gate().allow_list().databases() {
        databases.push(DatabaseInfo {
            name: policy.name.clone(),
            description: policy.description.clone(),
            available: pipeline.executor().has_database(&policy.name),
            tables: pipeline.schema().tables_for(&policy.name).await,
        });
    }
    Json(databases)
}

pub async fn recent_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQuery>,
) -> Result<Json<Vec<AuditRecord>>, (StatusCode, String)> {
    let Some(audit) = &state.audit else {
        return Err((StatusCode::NOT_FOUND, "Audit log is disabled".to_string()));
    };
    let limit = params.limit.unwrap_or(50).min(MAX_AUDIT_LIMIT);
    audit.recent(limit).await.map(Json).map_err(|e| {
        error!("Failed to read audit log: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to read audit log".to_string(),
        )
    })
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.startup_time)
        .num_seconds();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        structural_check: state.pipeline.gate().structural_enabled(),
        llm_backend: state.llm_backend.clone(),
        database_count: state.pipeline.gate().allow_list().databases().count(),
        audit_enabled: state.audit.is_some(),
    })
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), v);
    }
}

fn arrow_response(result: &PipelineResult) -> Response {
    let output = &result.output;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/vnd.apache.arrow.file"),
    );

    // header values cannot carry line breaks
    let single_line_sql = result.sql.split_whitespace().collect::<Vec<_>>().join(" ");
    insert_header(&mut headers, "x-generated-sql", &single_line_sql);
    insert_header(&mut headers, "x-total-count", &output.row_count.to_string());
    insert_header(&mut headers, "x-execution-time", &output.execution_time_ms.to_string());
    insert_header(&mut headers, "x-row-limit", &output.row_limit.to_string());
    insert_header(&mut headers, "x-repaired", &result.repaired.to_string());
    insert_header(&mut headers, "x-repair-attempts", &result.repair_attempts.to_string());
    if let Ok(columns_json) = serde_json::to_string(&output.columns) {
        insert_header(&mut headers, "x-columns", &columns_json);
    }

    (StatusCode::OK, headers, output.arrow_ipc.clone()).into_response()
}

fn pipeline_error_response(e: PipelineError) -> Response {
    match &e {
        PipelineError::Rejected {
            sql,
            verdict,
            attempts,
        } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(RejectionBody {
                error: e.to_string(),
                sql: Some(sql),
                repair_attempts: *attempts,
                verdict: Some(verdict),
            }),
        )
            .into_response(),
        PipelineError::TimedOut { last } => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(RejectionBody {
                error: e.to_string(),
                sql: None,
                repair_attempts: 0,
                verdict: last.as_ref(),
            }),
        )
            .into_response(),
        PipelineError::UnknownDatabase(_) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        PipelineError::Generation(_) => {
            error!("{}", e);
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
        PipelineError::Execution(_) => {
            error!("{}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
