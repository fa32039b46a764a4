//! Control API (`spec.md` §7 "Control API" subset): a handful of read/write
//! endpoints layered onto the same `axum::Router` the webhook ingress uses,
//! composed out of small per-resource handler modules.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post, put};
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::autoscaler::analytics::{aggregate, Granularity};
use crate::containers::{CleanupPolicies, CleanupReport, ContainerError, ContainerLifecycle};
use crate::error::Classify;
use crate::ha::HaCoordinator;
use crate::model::{Job, JobState, RunnerPool};
use crate::pool::{PoolError, PoolManager};
use crate::queue::{JobQueue, QueueError};
use crate::store::{JobFilter, SharedStore, StoreError};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn SharedStore>,
    pub queue: Arc<JobQueue>,
    pub pool_manager: Arc<PoolManager>,
    pub lifecycle: Arc<ContainerLifecycle>,
    pub ha: Arc<HaCoordinator>,
}

/// `:repo` path segments carry a GitHub `owner/repo` full name, which axum's
/// router treats as a single segment; callers percent-encode the slash
/// (`acme%2Fsvc`) and axum's `Path` extractor decodes it back before it
/// reaches the handler.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/delegate", post(delegate_job))
        .route("/api/runners/pools", get(list_pools))
        .route(
            "/api/runners/pools/{repo}",
            get(get_pool).put(put_pool),
        )
        .route("/api/runners/pools/{repo}/scale", post(scale_pool))
        .route("/api/runners/pools/{repo}/metrics", get(pool_metrics))
        .route("/api/cleanup/trigger", post(trigger_cleanup))
        .route("/api/cleanup/policies", get(get_cleanup_policies))
        .route("/api/cleanup/policies/{id}", put(put_cleanup_policy))
        .route("/api/system/ha/status", get(ha_status))
        .with_state(state)
}

fn error_response(kind_err: &dyn Classify, message: String) -> axum::response::Response {
    (kind_err.kind().status_code(), Json(json!({"ok": false, "error": message}))).into_response()
}

impl IntoResponse for PoolError {
    fn into_response(self) -> axum::response::Response {
        let msg = self.to_string();
        error_response(&self, msg)
    }
}

impl IntoResponse for QueueError {
    fn into_response(self) -> axum::response::Response {
        let msg = self.to_string();
        error_response(&self, msg)
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> axum::response::Response {
        let msg = self.to_string();
        error_response(&self, msg)
    }
}

impl IntoResponse for ContainerError {
    fn into_response(self) -> axum::response::Response {
        let msg = self.to_string();
        error_response(&self, msg)
    }
}

/// `spec.md` §7: `{status, db, cache, leader}`; `db`/`cache` both reduce to
/// "can we reach the shared store", since this crate has one backend for
/// both concerns.
async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let store_ok = state.store.list_pools().await.is_ok();
    let status = if store_ok { "ok" } else { "degraded" };
    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "db": store_ok,
            "cache": store_ok,
            "leader": state.ha.is_leader(),
        })),
    )
}

#[derive(Debug, Deserialize)]
struct JobListQuery {
    state: Option<String>,
    repo: Option<String>,
    page: Option<usize>,
    limit: Option<usize>,
}

fn parse_job_state(raw: &str) -> Option<JobState> {
    match raw {
        "pending" => Some(JobState::Pending),
        "assigned" => Some(JobState::Assigned),
        "running" => Some(JobState::Running),
        "completed" => Some(JobState::Completed),
        "failed" => Some(JobState::Failed),
        "cancelled" => Some(JobState::Cancelled),
        "dead" => Some(JobState::Dead),
        _ => None,
    }
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<JobListQuery>,
) -> Result<impl IntoResponse, QueueError> {
    let filter = JobFilter {
        state: q.state.as_deref().and_then(parse_job_state),
        repository: q.repo.clone(),
    };
    let mut jobs = state.queue.list(&filter).await?;
    jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));

    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let page = q.page.unwrap_or(1).max(1);
    let start = (page - 1) * limit;
    let page_jobs: Vec<&Job> = jobs.iter().skip(start).take(limit).collect();

    Ok((
        StatusCode::OK,
        Json(json!({
            "jobs": page_jobs,
            "page": page,
            "limit": limit,
            "total": jobs.len(),
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct DelegateRequest {
    #[serde(rename = "jobId")]
    job_id: String,
    #[serde(rename = "runId")]
    run_id: u64,
    repository: String,
    workflow: String,
    #[serde(default)]
    labels: BTreeSet<String>,
}

/// `spec.md` §7: manual job injection, bypassing the webhook ingress. Used
/// by operators to backfill a job GitHub never delivered a clean event for.
async fn delegate_job(
    State(state): State<ApiState>,
    Json(req): Json<DelegateRequest>,
) -> Result<impl IntoResponse, QueueError> {
    let priority = crate::webhook::compute_priority(&req.labels, &req.repository);
    let job = Job::new(
        req.job_id,
        req.run_id,
        req.repository,
        req.workflow,
        req.labels,
        priority,
        5,
        Utc::now(),
    );
    state.queue.enqueue(job).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"delegationId": Uuid::new_v4().to_string()})),
    ))
}

async fn list_pools(State(state): State<ApiState>) -> Result<impl IntoResponse, StoreError> {
    let pools = state.store.list_pools().await?;
    Ok((StatusCode::OK, Json(json!({"pools": pools}))))
}

async fn get_pool(
    State(state): State<ApiState>,
    Path(repo): Path<String>,
) -> Result<impl IntoResponse, PoolError> {
    let pool = state.pool_manager.get_or_create_pool(&repo).await?;
    Ok((StatusCode::OK, Json(json!(pool))))
}

#[derive(Debug, Deserialize)]
struct PutPoolRequest {
    min_runners: Option<u32>,
    max_runners: Option<u32>,
    scale_increment: Option<u32>,
    scale_up_threshold: Option<f64>,
    scale_down_threshold: Option<f64>,
    idle_timeout_secs: Option<u64>,
}

async fn put_pool(
    State(state): State<ApiState>,
    Path(repo): Path<String>,
    Json(req): Json<PutPoolRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let pool: RunnerPool = state
        .pool_manager
        .update_pool(&repo, |p| {
            if let Some(v) = req.min_runners {
                p.min_runners = v;
            }
            if let Some(v) = req.max_runners {
                p.max_runners = v;
            }
            if let Some(v) = req.scale_increment {
                p.scale_increment = v;
            }
            if let Some(v) = req.scale_up_threshold {
                p.scale_up_threshold = v;
            }
            if let Some(v) = req.scale_down_threshold {
                p.scale_down_threshold = v;
            }
            if let Some(v) = req.idle_timeout_secs {
                p.idle_timeout_secs = v;
            }
        })
        .await?;
    Ok((StatusCode::OK, Json(json!(pool))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScaleAction {
    Up,
    Down,
}

#[derive(Debug, Deserialize)]
struct ScaleRequest {
    action: ScaleAction,
    count: Option<u32>,
}

async fn scale_pool(
    State(state): State<ApiState>,
    Path(repo): Path<String>,
    Json(req): Json<ScaleRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let magnitude = req.count.unwrap_or(1).max(1) as i32;
    let delta = match req.action {
        ScaleAction::Up => magnitude,
        ScaleAction::Down => -magnitude,
    };
    let decision = state.pool_manager.scale(&repo, delta).await?;
    Ok((StatusCode::OK, Json(json!(decision))))
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    granularity: Option<String>,
    limit: Option<usize>,
}

async fn pool_metrics(
    State(state): State<ApiState>,
    Path(repo): Path<String>,
    Query(q): Query<MetricsQuery>,
) -> Result<impl IntoResponse, StoreError> {
    let pool = state.store.get_pool(&repo).await?;
    let samples = state.store.recent_metric_samples(&repo, q.limit.unwrap_or(500)).await?;
    let granularity = match q.granularity.as_deref() {
        Some("hour") => Granularity::Hour,
        Some("day") => Granularity::Day,
        _ => Granularity::Minute,
    };
    let buckets = aggregate(&samples, granularity);
    let history = state.store.recent_scaling_decisions(&repo, 50).await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "pool": pool,
            "buckets": buckets,
            "scalingHistory": history,
        })),
    ))
}

async fn trigger_cleanup(State(state): State<ApiState>) -> Result<impl IntoResponse, ContainerError> {
    let report = state.lifecycle.cleanup().await?;
    Ok((StatusCode::OK, Json(cleanup_json(&report))))
}

fn cleanup_json(report: &CleanupReport) -> serde_json::Value {
    json!({"destroyed": report.destroyed, "drained": report.drained, "errors": report.errors})
}

#[derive(Debug, Serialize)]
struct PoliciesResponse {
    idle_enabled: bool,
    failed_enabled: bool,
    orphaned_enabled: bool,
    expired_enabled: bool,
    idle_timeout_secs: u64,
    max_age_secs: u64,
}

/// `spec.md` §7 exposes this as a collection addressed by `:id`, but
/// `ContainerLifecycle` holds a single policy set shared by every pool; `id`
/// is accepted and ignored rather than faked into a multi-policy model this
/// crate doesn't have.
async fn get_cleanup_policies(State(state): State<ApiState>) -> impl IntoResponse {
    let policies = state.lifecycle.policies_snapshot().await;
    (
        StatusCode::OK,
        Json(PoliciesResponse {
            idle_enabled: policies.idle_enabled,
            failed_enabled: policies.failed_enabled,
            orphaned_enabled: policies.orphaned_enabled,
            expired_enabled: policies.expired_enabled,
            idle_timeout_secs: policies.idle_timeout_secs,
            max_age_secs: policies.max_age_secs,
        }),
    )
}

#[derive(Debug, Deserialize)]
struct PutPolicyRequest {
    idle_enabled: Option<bool>,
    failed_enabled: Option<bool>,
    orphaned_enabled: Option<bool>,
    expired_enabled: Option<bool>,
    idle_timeout_secs: Option<u64>,
    max_age_secs: Option<u64>,
}

async fn put_cleanup_policy(
    State(state): State<ApiState>,
    Path(_id): Path<String>,
    Json(req): Json<PutPolicyRequest>,
) -> impl IntoResponse {
    let mut policies = state.lifecycle.policies_snapshot().await;
    if let Some(v) = req.idle_enabled {
        policies.idle_enabled = v;
    }
    if let Some(v) = req.failed_enabled {
        policies.failed_enabled = v;
    }
    if let Some(v) = req.orphaned_enabled {
        policies.orphaned_enabled = v;
    }
    if let Some(v) = req.expired_enabled {
        policies.expired_enabled = v;
    }
    if let Some(v) = req.idle_timeout_secs {
        policies.idle_timeout_secs = v;
    }
    if let Some(v) = req.max_age_secs {
        policies.max_age_secs = v;
    }
    state.lifecycle.set_policies(policies.clone()).await;
    (
        StatusCode::OK,
        Json(PoliciesResponse {
            idle_enabled: policies.idle_enabled,
            failed_enabled: policies.failed_enabled,
            orphaned_enabled: policies.orphaned_enabled,
            expired_enabled: policies.expired_enabled,
            idle_timeout_secs: policies.idle_timeout_secs,
            max_age_secs: policies.max_age_secs,
        }),
    )
}

async fn ha_status(State(state): State<ApiState>) -> Result<impl IntoResponse, StoreError> {
    let lease = state.store.get_lease().await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "isLeader": state.ha.is_leader(),
            "currentLeader": lease.as_ref().map(|l| l.holder_id.clone()),
            "term": lease.as_ref().map(|l| l.term).unwrap_or(0),
        })),
    ))
}
