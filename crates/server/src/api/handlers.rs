use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use cascade_core::monitor::{HealthReport, WorkflowMetrics};
use cascade_core::types::{
    ExecutionId, ExecutionStatus, TriggerType, WorkflowExecution,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Engine health plus the monitor's aggregate report
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "cascade",
        version: env!("CARGO_PKG_VERSION"),
        health: state.engine.monitor().health_report(),
    })
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub health: HealthReport,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub workflow: Option<String>,
}

/// Execution history, newest first
pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ListExecutionsResponse>> {
    let store = state.engine.store();
    let executions = match query.workflow {
        Some(workflow) => {
            let mut matching = store.executions_for_workflow(&workflow).await?;
            matching.reverse();
            matching
        }
        None => store.recent_executions(query.limit.unwrap_or(50)).await?,
    };
    let executions = match query.limit {
        Some(limit) => executions.into_iter().take(limit).collect(),
        None => executions,
    };
    Ok(Json(ListExecutionsResponse { executions }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<WorkflowExecution>,
}

/// Fetch one execution by id
pub async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<WorkflowExecution>> {
    let id = execution_id
        .parse::<Uuid>()
        .map_err(|_| ApiError::bad_request(format!("invalid execution id: {execution_id}")))?;

    state
        .engine
        .store()
        .get_execution(ExecutionId(id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("execution {execution_id} not found")))
}

/// Registered workflows and their triggers
pub async fn list_workflows(State(state): State<AppState>) -> Json<ListWorkflowsResponse> {
    let mut workflows: Vec<WorkflowSummary> = state
        .workflows
        .iter()
        .map(|(name, workflow)| WorkflowSummary {
            name: name.clone(),
            workflow: workflow.name.clone(),
            version: workflow.version.clone(),
            trigger: workflow.trigger.trigger_type,
            tasks: workflow.tasks.len(),
        })
        .collect();
    workflows.sort_by(|a, b| a.name.cmp(&b.name));
    Json(ListWorkflowsResponse { workflows })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<WorkflowSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub workflow: String,
    pub version: String,
    pub trigger: TriggerType,
    pub tasks: usize,
}

/// Aggregates for one workflow, computed from stored history
pub async fn workflow_metrics(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<WorkflowMetrics>> {
    let workflow = state
        .workflows
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("workflow {name} not registered")))?;

    let metrics = state
        .engine
        .monitor()
        .workflow_metrics(state.engine.store().as_ref(), &workflow.name)
        .await?;
    Ok(Json(metrics))
}

/// Manually trigger a registered workflow. The optional JSON body becomes
/// environment overrides for the run.
pub async fn run_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<HashMap<String, String>>>,
) -> ApiResult<Json<RunResponse>> {
    let workflow = state
        .workflows
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("workflow {name} not registered")))?;

    let overrides = body.map(|Json(b)| b).unwrap_or_default();
    let execution = state.engine.run_workflow(workflow, overrides).await?;
    Ok(Json(RunResponse::from(execution)))
}

/// Webhook trigger endpoint. Only workflows declared with a webhook trigger
/// are reachable here.
pub async fn webhook(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<HashMap<String, String>>>,
) -> ApiResult<Json<RunResponse>> {
    let workflow = state
        .workflows
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("no webhook registered as {name}")))?;
    if workflow.trigger.trigger_type != TriggerType::Webhook {
        return Err(ApiError::bad_request(format!(
            "workflow {name} is not webhook-triggered"
        )));
    }

    let overrides = body.map(|Json(b)| b).unwrap_or_default();
    let execution = state.engine.run_workflow(workflow, overrides).await?;
    Ok(Json(RunResponse::from(execution)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub execution_id: String,
    pub workflow: String,
    pub status: ExecutionStatus,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl From<WorkflowExecution> for RunResponse {
    fn from(execution: WorkflowExecution) -> Self {
        Self {
            execution_id: execution.id.to_string(),
            workflow: execution.workflow,
            status: execution.status,
            duration_ms: execution.duration_ms,
            error: execution.error,
        }
    }
}
