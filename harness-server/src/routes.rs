//! HTTP route handlers for the evaluation service.

use std::collections::{BTreeMap, HashMap};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use harness::core::types::{InstanceResult, RunOptions};
use harness::evaluate::prepare_instances;
use harness::io::dataset::DatasetRecord;
use harness::io::log_sink::LogPaths;
use harness::scheduler::ScheduleOptions;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::state::AppState;

/// Build the service router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/run_one_instance", post(run_one_instance))
        .route("/run_many_instances", post(run_many_instances))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub instance_id: String,
    pub model_patch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    pub instance_id: String,
    pub resolved: bool,
    /// Seconds spent running the container; zero when the run failed.
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResponse {
    fn from_result(instance_id: &str, result: Option<&InstanceResult>) -> Self {
        match result {
            Some(result) => Self {
                instance_id: instance_id.to_string(),
                resolved: result.is_resolved(),
                time: result.elapsed_secs().unwrap_or_default(),
                error: result.error_message().map(str::to_string),
            },
            None => Self {
                instance_id: instance_id.to_string(),
                resolved: false,
                time: 0.0,
                error: Some("instance was not evaluated".to_string()),
            },
        }
    }
}

/// POST /run_one_instance - evaluate one model patch.
pub async fn run_one_instance(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunResponse>, (StatusCode, String)> {
    let predictions = HashMap::from([(req.instance_id, req.model_patch)]);
    let mut responses = run_predictions(&state, predictions).await?;
    responses
        .pop()
        .map(Json)
        .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "no result".to_string()))
}

/// POST /run_many_instances - evaluate `{instance_id: model_patch}` concurrently.
pub async fn run_many_instances(
    State(state): State<AppState>,
    Json(req): Json<HashMap<String, String>>,
) -> Result<Json<Vec<RunResponse>>, (StatusCode, String)> {
    run_predictions(&state, req).await.map(Json)
}

async fn run_predictions(
    state: &AppState,
    predictions: HashMap<String, String>,
) -> Result<Vec<RunResponse>, (StatusCode, String)> {
    let mut ids: Vec<String> = predictions.keys().cloned().collect();
    ids.sort();
    if let Some(unknown) = ids.iter().find(|id| !state.records.contains_key(*id)) {
        return Err((
            StatusCode::NOT_FOUND,
            format!("unknown instance id: {unknown}"),
        ));
    }

    let records: Vec<DatasetRecord> = ids.iter().map(|id| state.records[id].clone()).collect();
    let prepared = prepare_instances(&records, Some(ids.as_slice()), Some(&predictions))
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, format!("{e:#}")))?;

    let log_dir = state.request_log_dir();
    info!(instances = ids.len(), log_dir = %log_dir.display(), "evaluating request");
    let mut results: BTreeMap<String, InstanceResult> = state
        .engine
        .scheduler(LogPaths::new(&log_dir))
        .with_gate(state.gate.clone())
        .evaluate(
            prepared.instances,
            ScheduleOptions {
                max_workers: state.max_workers,
                timeout: state.timeout,
                batch_mode: false,
                run: RunOptions::default(),
            },
        )
        .await;
    results.extend(prepared.rejected);

    if let Err(e) = tokio::fs::remove_dir_all(&log_dir).await {
        warn!(err = %e, log_dir = %log_dir.display(), "failed to remove request logs");
    }

    Ok(ids
        .iter()
        .map(|id| RunResponse::from_result(id, results.get(id)))
        .collect())
}
