//! Webhook Ingress (`spec.md` §4.1): HMAC verification, per-IP rate
//! limiting, delivery dedup, payload validation, and Job derivation from
//! `workflow_job` events — wired up as an `axum::Router`, the way the
//! teacher wires its single `/webhook` route.

pub mod events;

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::error::{Classify, ErrorKind};
use crate::events_bus::{EventBus, JobEvent};
use crate::model::{Conclusion, Delivery, DeliveryState, Job, JobState};
use crate::pool::RunnerReleaser;
use crate::queue::{JobQueue, QueueError};
use crate::store::{InsertOutcome, StoreError};
use crate::webhook::events::{validate_schema, WorkflowJobAction, WorkflowJobEvent, ALLOWED_EVENTS};

type HmacSha256 = Hmac<Sha256>;
type IpRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

const SIGNATURE_PREFIX: &str = "sha256=";
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    #[error("signature verification failed")]
    BadSignature,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for WebhookError {
    fn kind(&self) -> ErrorKind {
        match self {
            WebhookError::MissingHeader(_) | WebhookError::Malformed(_) => ErrorKind::Validation,
            WebhookError::BadSignature => ErrorKind::Validation,
            WebhookError::Store(e) => e.kind(),
        }
    }
}

impl From<QueueError> for WebhookError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Store(e) => WebhookError::Store(e),
            other => WebhookError::Malformed(other.to_string()),
        }
    }
}


impl IntoResponse for WebhookError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            WebhookError::BadSignature => StatusCode::UNAUTHORIZED,
            WebhookError::MissingHeader(_) | WebhookError::Malformed(_) => {
                StatusCode::BAD_REQUEST
            }
            WebhookError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"ok": false, "error": self.to_string()}))).into_response()
    }
}

#[derive(Clone)]
pub struct WebhookState {
    pub queue: Arc<JobQueue>,
    pub events: Arc<EventBus>,
    pub releaser: Arc<dyn RunnerReleaser>,
    pub webhook_secret: String,
    pub rate_limiter: Arc<IpRateLimiter>,
}

impl WebhookState {
    pub fn new(
        queue: Arc<JobQueue>,
        events: Arc<EventBus>,
        releaser: Arc<dyn RunnerReleaser>,
        webhook_secret: String,
    ) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(100).unwrap())
            .allow_burst(NonZeroU32::new(10).unwrap());
        Self {
            queue,
            events,
            releaser,
            webhook_secret,
            rate_limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook/github", post(webhook_handler))
        .route("/api/webhooks/github", post(webhook_handler))
        .with_state(state)
}

#[instrument(skip(state, headers, body), fields(delivery_id, event_type))]
async fn webhook_handler(
    State(state): State<WebhookState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if state.rate_limiter.check_key(&addr.ip()).is_err() {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"ok": false, "error": "rate_limited"})),
        )
            .into_response();
    }

    match handle_delivery(&state, &headers, &body).await {
        Ok(response) => response.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_delivery(
    state: &WebhookState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<impl IntoResponse, WebhookError> {
    let event_type = header_str(headers, "x-github-event")?;
    let delivery_id = header_str(headers, "x-github-delivery")?;
    let signature = header_str(headers, "x-hub-signature-256")?;

    verify_signature(&state.webhook_secret, &signature, body)?;

    if !ALLOWED_EVENTS.contains(&event_type.as_str()) {
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({"ok": true, "ignored": true})),
        ));
    }

    validate_schema(&event_type, body).map_err(|e| WebhookError::Malformed(e.to_string()))?;

    let delivery = Delivery {
        delivery_id: delivery_id.clone(),
        event_type: event_type.clone(),
        signature,
        payload_hash: hex::encode(Sha256::digest(body)),
        received_at: Utc::now(),
        processing_state: DeliveryState::Received,
    };

    match state.queue_delivery(delivery).await? {
        InsertOutcome::AlreadyExists => {
            return Ok((
                StatusCode::OK,
                Json(json!({"ok": true, "duplicate": true})),
            ));
        }
        InsertOutcome::Inserted => {}
    }

    if event_type == "workflow_job" {
        let event: WorkflowJobEvent =
            serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;
        state
            .set_delivery_state(&delivery_id, DeliveryState::Validated)
            .await?;
        handle_workflow_job(state, event).await?;
    }

    state
        .set_delivery_state(&delivery_id, DeliveryState::Processed)
        .await?;

    Ok((
        StatusCode::OK,
        Json(json!({"ok": true, "deliveryId": delivery_id})),
    ))
}

impl WebhookState {
    async fn queue_delivery(&self, delivery: Delivery) -> Result<InsertOutcome, StoreError> {
        self.queue.store_delivery(delivery).await
    }

    async fn set_delivery_state(
        &self,
        delivery_id: &str,
        state: DeliveryState,
    ) -> Result<(), StoreError> {
        self.queue.set_delivery_state(delivery_id, state).await
    }
}

async fn handle_workflow_job(
    state: &WebhookState,
    event: WorkflowJobEvent,
) -> Result<(), WebhookError> {
    let repository = event.repository.full_name.clone();
    let job_id = event.workflow_job.id.to_string();
    let labels = event.workflow_job.labels.iter().cloned().collect();

    match event.action {
        WorkflowJobAction::Queued => {
            let priority = compute_priority(&labels, &repository);
            let job = Job::new(
                job_id,
                event.workflow_job.run_id,
                repository,
                event.workflow_job.name.clone(),
                labels,
                priority,
                DEFAULT_MAX_ATTEMPTS,
                Utc::now(),
            );
            state.queue.enqueue(job).await?;
        }
        WorkflowJobAction::InProgress => {
            if let Some(runner_name) = event.workflow_job.runner_name.clone() {
                let _ = state
                    .queue
                    .record_runner_assignment(&job_id, &runner_name)
                    .await;
            }
            state.queue.ack(&job_id, JobState::Running).await?;
        }
        WorkflowJobAction::Completed => {
            let conclusion = event
                .workflow_job
                .conclusion
                .as_deref()
                .and_then(parse_conclusion);
            let final_state = match conclusion {
                Some(Conclusion::Success) => JobState::Completed,
                Some(Conclusion::Cancelled) => JobState::Cancelled,
                _ => JobState::Failed,
            };

            let runner_ref = match event.workflow_job.runner_name.clone() {
                Some(name) => Some(name),
                None => state.queue.get(&job_id).await?.and_then(|j| j.assigned_runner),
            };

            state.queue.ack(&job_id, final_state).await?;

            if let Some(runner_ref) = runner_ref {
                if let Err(e) = state.releaser.release_runner(&runner_ref).await {
                    warn!(job_id = %job_id, error = %e, "failed to release runner after job completion");
                }
            }

            state.events.publish_job(JobEvent {
                job_id,
                repository,
                state: final_state,
                conclusion,
                at: Utc::now(),
            });
        }
        WorkflowJobAction::Waiting => {}
    }

    Ok(())
}

fn parse_conclusion(raw: &str) -> Option<Conclusion> {
    match raw {
        "success" => Some(Conclusion::Success),
        "failure" => Some(Conclusion::Failure),
        "cancelled" => Some(Conclusion::Cancelled),
        "skipped" => Some(Conclusion::Skipped),
        "timed_out" => Some(Conclusion::TimedOut),
        _ => None,
    }
}

/// `spec.md` §4.1.1: base 50, adjusted by label/repository signals, clamped
/// to `[0, 100]`.
pub fn compute_priority(labels: &std::collections::BTreeSet<String>, repository: &str) -> u8 {
    let mut score: i32 = 50;

    if labels.contains("production") || labels.contains("deploy") {
        score += 30;
    }
    if labels.contains("critical") {
        score += 20;
    }
    if labels.contains("hotfix") {
        score += 10;
    }
    if labels.contains("large") || labels.contains("xlarge") {
        score -= 20;
    }
    if repository.contains("staging") || repository.contains("dev") {
        score -= 10;
    }

    score.clamp(0, 100) as u8
}

fn header_str(headers: &HeaderMap, name: &'static str) -> Result<String, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or(WebhookError::MissingHeader(name))
}

/// Constant-time HMAC-SHA256 verification (`spec.md` §4.1 step 1), grounded
/// in the `hmac`/`sha2` pattern used by `marysaka-octoling`'s webhook
/// handler.
fn verify_signature(secret: &str, header: &str, body: &[u8]) -> Result<(), WebhookError> {
    let hex_sig = header
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(WebhookError::BadSignature)?;
    let provided = hex::decode(hex_sig).map_err(|_| WebhookError::BadSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::BadSignature)?;
    mac.update(body);
    mac.verify_slice(&provided).map_err(|_| {
        warn!("webhook signature mismatch");
        WebhookError::BadSignature
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn labels(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn priority_applies_all_modifiers_and_clamps() {
        assert_eq!(compute_priority(&labels(&[]), "acme/svc"), 50);
        assert_eq!(compute_priority(&labels(&["production", "critical"]), "acme/svc"), 100);
        assert_eq!(compute_priority(&labels(&["large"]), "acme/staging-svc"), 20);
        assert_eq!(
            compute_priority(&labels(&["xlarge", "large"]), "acme/dev-svc"),
            20
        );
    }

    #[test]
    fn signature_round_trips() {
        let secret = "topsecret";
        let body = b"{\"hello\":true}";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let tag = mac.finalize().into_bytes();
        let header = format!("sha256={}", hex::encode(tag));

        assert!(verify_signature(secret, &header, body).is_ok());
        assert!(verify_signature(secret, "sha256=deadbeef", body).is_err());
        assert!(verify_signature("wrong", &header, body).is_err());
    }

    #[test]
    fn conclusion_parsing_covers_known_values() {
        assert_eq!(parse_conclusion("success"), Some(Conclusion::Success));
        assert_eq!(parse_conclusion("timed_out"), Some(Conclusion::TimedOut));
        assert_eq!(parse_conclusion("bogus"), None);
    }
}
