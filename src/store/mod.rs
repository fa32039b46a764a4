//! Shared KV/cache abstraction (`spec.md` §5 "Shared-resource policy", §6
//! "Persisted state"). C1–C6 never touch a concrete backend directly; they
//! go through `SharedStore`, which has a production `redis` implementation
//! and an in-memory `dashmap` fake used by tests.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::model::{
    Delivery, DeliveryState, Horizon, Job, JobState, LeaderLease, MetricSample, Prediction,
    PrewarmedContainer, Runner, RunnerPool, ScalingDecision,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("optimistic concurrency conflict on {0}")]
    Conflict(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Unavailable(_) => ErrorKind::TransientExternal,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::Serialization(_) => ErrorKind::FatalInternal,
        }
    }
}

/// Outcome of an atomic insert-if-absent, used by C1's dedup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub repository: Option<String>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.state.is_none_or(|s| s == job.state)
            && self
                .repository
                .as_deref()
                .is_none_or(|r| r == job.repository)
    }
}

/// The single source of truth for Job, Runner, Pool and LeaderLease state
/// (`spec.md` §5). Every method is a single round trip so components never
/// hold a lock across external I/O.
#[async_trait]
pub trait SharedStore: Send + Sync {
    // --- Deliveries ---
    async fn insert_delivery_if_absent(
        &self,
        delivery: Delivery,
    ) -> Result<InsertOutcome, StoreError>;
    async fn get_delivery(&self, delivery_id: &str) -> Result<Option<Delivery>, StoreError>;
    async fn set_delivery_state(
        &self,
        delivery_id: &str,
        state: DeliveryState,
    ) -> Result<(), StoreError>;

    // --- Jobs ---
    async fn put_job(&self, job: Job) -> Result<(), StoreError>;
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError>;
    /// Replace the job only if its current state equals `expected`; this is
    /// the "conditional write with version check" `spec.md` §4.2 requires for
    /// `reserve`/`nack`.
    async fn cas_job(
        &self,
        job_id: &str,
        expected: JobState,
        updated: Job,
    ) -> Result<(), StoreError>;
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;
    /// Pending jobs whose `scheduled_run_at <= now`, ordered by priority desc
    /// then `created_at` asc within a priority bucket (`spec.md` §4.2
    /// ordering guarantee).
    async fn list_reservable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;
    /// Jobs in `Assigned` whose lease has expired, for `recover()`.
    async fn list_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    // --- Pools ---
    async fn get_pool(&self, repository: &str) -> Result<Option<RunnerPool>, StoreError>;
    async fn put_pool(&self, pool: RunnerPool) -> Result<(), StoreError>;
    async fn list_pools(&self) -> Result<Vec<RunnerPool>, StoreError>;

    // --- Runners ---
    async fn get_runner(&self, runner_id: &str) -> Result<Option<Runner>, StoreError>;
    async fn put_runner(&self, runner: Runner) -> Result<(), StoreError>;
    async fn delete_runner(&self, runner_id: &str) -> Result<(), StoreError>;
    async fn list_runners_by_pool(&self, pool: &str) -> Result<Vec<Runner>, StoreError>;
    async fn list_runners(&self) -> Result<Vec<Runner>, StoreError>;

    // --- Pre-warmed containers ---
    async fn put_prewarmed(&self, container: PrewarmedContainer) -> Result<(), StoreError>;
    async fn take_ready_prewarmed(
        &self,
        template: &str,
    ) -> Result<Option<PrewarmedContainer>, StoreError>;
    async fn list_prewarmed(&self, template: &str) -> Result<Vec<PrewarmedContainer>, StoreError>;
    async fn delete_prewarmed(&self, container_id: &str) -> Result<(), StoreError>;

    // --- Metric samples (Demand Predictor input) ---
    async fn record_metric_sample(&self, sample: MetricSample) -> Result<(), StoreError>;
    async fn recent_metric_samples(
        &self,
        pool: &str,
        limit: usize,
    ) -> Result<Vec<MetricSample>, StoreError>;

    // --- Append-only logs ---
    async fn append_scaling_decision(&self, decision: ScalingDecision) -> Result<(), StoreError>;
    async fn recent_scaling_decisions(
        &self,
        pool: &str,
        limit: usize,
    ) -> Result<Vec<ScalingDecision>, StoreError>;
    async fn append_prediction(&self, prediction: Prediction) -> Result<(), StoreError>;
    async fn recent_predictions(
        &self,
        pool: &str,
        horizon: Horizon,
        limit: usize,
    ) -> Result<Vec<Prediction>, StoreError>;

    // --- Leader lease ---
    /// Atomic `SET key=holder EX ttl NX` (`spec.md` §4.6).
    async fn try_acquire_lease(
        &self,
        holder_id: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaderLease>, StoreError>;
    /// Conditional-on-self renewal; fails if another holder has taken over.
    async fn renew_lease(
        &self,
        holder_id: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaderLease>, StoreError>;
    async fn get_lease(&self) -> Result<Option<LeaderLease>, StoreError>;
    async fn release_lease(&self, holder_id: &str) -> Result<(), StoreError>;
}
