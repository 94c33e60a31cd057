//! HTTP status and trigger surface
//!
//! Read-only status plus manual sync triggers. A manual trigger goes
//! through the coordinator like any scheduled firing, so it attaches to an
//! in-flight run instead of duplicating it.

use crate::cache::CacheLayer;
use crate::error::{ApiError, ApiResult};
use crate::gateway::RateLimitedApiGateway;
use crate::scheduler::{JobStatus, Scheduler};
use crate::sink::PersistenceSink;
use crate::types::{BudgetSnapshot, EntityKind, EntityRef, SourceId, SyncJobType, SyncRun, UnifiedEntity};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub gateway: Arc<RateLimitedApiGateway>,
    pub cache: Arc<CacheLayer>,
    pub sink: Arc<dyn PersistenceSink>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/status/:job", get(job_status))
        .route("/runs/:job", get(recent_runs))
        .route("/sync/:job", post(trigger_sync))
        .route("/entities/:kind/:id", get(get_entity))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct StatusResponse {
    jobs: Vec<JobStatus>,
    budgets: BTreeMap<String, BudgetSnapshot>,
}

async fn status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let jobs = state.scheduler.status().await;
    let mut budgets = BTreeMap::new();
    for source in SourceId::ALL {
        if let Some(snapshot) = state.gateway.headroom(source).await {
            budgets.insert(source.to_string(), snapshot);
        }
    }
    Ok(Json(StatusResponse { jobs, budgets }))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job): Path<String>,
) -> ApiResult<Json<JobStatus>> {
    let job = parse_job(&job)?;
    Ok(Json(state.scheduler.job_status(job).await))
}

#[derive(Deserialize)]
struct RunsQuery {
    limit: Option<u32>,
}

async fn recent_runs(
    State(state): State<AppState>,
    Path(job): Path<String>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<Vec<SyncRun>>> {
    let job = parse_job(&job)?;
    let limit = query.limit.unwrap_or(20).min(100);
    let runs = state.sink.recent_runs(job, limit).await?;
    Ok(Json(runs))
}

async fn trigger_sync(
    State(state): State<AppState>,
    Path(job): Path<String>,
) -> ApiResult<Json<SyncRun>> {
    let job = parse_job(&job)?;
    let run = state.scheduler.trigger_now(job).await?;
    Ok(Json(run))
}

#[derive(Deserialize)]
struct EntityQuery {
    #[serde(default)]
    allow_stale: bool,
}

async fn get_entity(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, u64)>,
    Query(query): Query<EntityQuery>,
) -> ApiResult<Json<UnifiedEntity>> {
    let kind = match kind.as_str() {
        "rider" => EntityKind::Rider,
        "event" => EntityKind::Event,
        "race_results" => EntityKind::RaceResults,
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown entity kind '{other}'"
            )))
        }
    };
    let entity = EntityRef { kind, id };
    let cached = if query.allow_stale {
        state.cache.get_allow_stale(&entity)
    } else {
        state.cache.get(&entity)
    };
    cached
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no cached entity {entity}")))
}

fn parse_job(raw: &str) -> ApiResult<SyncJobType> {
    raw.parse::<SyncJobType>().map_err(ApiError::BadRequest)
}
