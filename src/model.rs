//! Core data model (`spec.md` §3): the records every component reads and
//! writes through the shared store. State-machine types expose guarded
//! transition methods instead of public field mutation, so the invariants
//! hold at the type level rather than by convention.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

/// Processing state of a raw webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Received,
    Validated,
    Processed,
    Failed,
    Duplicate,
}

/// Raw webhook envelope, one per `X-GitHub-Delivery` id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub delivery_id: String,
    pub event_type: String,
    pub signature: String,
    pub payload_hash: String,
    pub received_at: DateTime<Utc>,
    pub processing_state: DeliveryState,
}

/// Job lifecycle state (`spec.md` §3, §8 invariant 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    Dead,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal job transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: JobState,
    pub to: JobState,
}

impl Classify for IllegalTransition {
    fn kind(&self) -> ErrorKind {
        ErrorKind::FatalInternal
    }
}

/// Conclusion reported by GitHub for a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Success,
    Failure,
    Cancelled,
    Skipped,
    TimedOut,
}

/// A unit of work dispatchable to a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub run_id: u64,
    pub repository: String,
    pub workflow: String,
    pub labels: BTreeSet<String>,
    pub priority: u8,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_run_at: DateTime<Utc>,
    pub assigned_runner: Option<String>,
    pub assigned_worker: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub conclusion: Option<Conclusion>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(
        job_id: impl Into<String>,
        run_id: u64,
        repository: impl Into<String>,
        workflow: impl Into<String>,
        labels: BTreeSet<String>,
        priority: u8,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            run_id,
            repository: repository.into(),
            workflow: workflow.into(),
            labels,
            priority,
            state: JobState::Pending,
            attempts: 0,
            max_attempts,
            created_at: now,
            scheduled_run_at: now,
            assigned_runner: None,
            assigned_worker: None,
            lease_expires_at: None,
            started_at: None,
            conclusion: None,
            last_error: None,
        }
    }

    /// Whether `to` is a legal successor of `self.state`, per `spec.md` §8
    /// invariant 1: `pending -> assigned -> running -> {completed|failed|
    /// cancelled}` or `pending -> dead`, plus `assigned -> pending` on lease
    /// expiry.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self.state, to),
            (Pending, Assigned)
                | (Pending, Dead)
                | (Assigned, Pending)
                | (Assigned, Running)
                | (Assigned, Dead)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
        )
    }

    pub fn transition_to(&mut self, to: JobState) -> Result<(), IllegalTransition> {
        if !self.can_transition_to(to) {
            return Err(IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Dead
        )
    }

    /// A runner satisfies this job if its labels are a superset of the job's.
    pub fn matches_labels(&self, runner_labels: &BTreeSet<String>) -> bool {
        self.labels.is_subset(runner_labels)
    }
}

/// Per-repository bounded collection of runners (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerPool {
    pub repository: String,
    pub min_runners: u32,
    pub max_runners: u32,
    pub scale_increment: u32,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub current_size: u32,
    pub idle_timeout_secs: u64,
    pub last_scaled_at: Option<DateTime<Utc>>,
}

impl RunnerPool {
    pub fn default_for(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            min_runners: 0,
            max_runners: 10,
            scale_increment: 2,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            current_size: 0,
            idle_timeout_secs: 300,
            last_scaled_at: None,
        }
    }

    /// `spec.md` §8 invariant 2, checked outside the ≤10s scaling transient
    /// the caller is responsible for excluding.
    pub fn within_bounds(&self) -> bool {
        self.current_size >= self.min_runners && self.current_size <= self.max_runners
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Provisioning,
    Idle,
    Busy,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerType {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerLifecycle {
    OnDemand,
    Spot,
    PreWarmed,
}

/// A configured GitHub runner backed by a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub runner_id: String,
    pub pool: String,
    pub container_id: String,
    pub labels: BTreeSet<String>,
    pub state: RunnerState,
    pub runner_type: RunnerType,
    pub region: String,
    pub lifecycle: RunnerLifecycle,
    pub created_at: DateTime<Utc>,
    pub last_job_at: Option<DateTime<Utc>>,
    pub jobs_processed: u64,
    pub persistent: bool,
    pub consecutive_health_failures: u32,
}

impl Runner {
    pub fn is_idle_longer_than(&self, secs: u64, now: DateTime<Utc>) -> bool {
        if self.state != RunnerState::Idle {
            return false;
        }
        let since = self.last_job_at.unwrap_or(self.created_at);
        (now - since).num_seconds() >= secs as i64
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrewarmStatus {
    Warming,
    Ready,
    Claimed,
    Expired,
}

/// Ready-but-unclaimed runner template instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrewarmedContainer {
    pub container_id: String,
    pub template: String,
    pub status: PrewarmStatus,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingReason {
    Utilization,
    QueuePressure,
    Prediction,
    Budget,
    Manual,
}

/// Immutable append-only scaling decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub timestamp: DateTime<Utc>,
    pub pool: String,
    pub from_count: u32,
    pub to_count: u32,
    pub reason: ScalingReason,
    pub confidence: f64,
    pub applied: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    Short,
    Medium,
    Long,
}

impl Horizon {
    pub fn minutes(self) -> i64 {
        match self {
            Horizon::Short => 15,
            Horizon::Medium => 60,
            Horizon::Long => 240,
        }
    }
}

/// One-per-minute-per-repository observation the Demand Predictor consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub pool: String,
    pub queued_jobs: u32,
    pub running_jobs: u32,
    pub utilization: f64,
    pub avg_job_duration_secs: f64,
}

/// Demand forecast for one horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub issued_at: DateTime<Utc>,
    pub pool: String,
    pub horizon: Horizon,
    pub expected_jobs: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub confidence: f64,
}

/// Coordination token for single-writer control loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderLease {
    pub holder_id: String,
    pub term: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewal_count: u64,
}

impl LeaderLease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn job_transitions_follow_state_machine() {
        let mut job = Job::new("1", 1, "acme/svc", "ci", BTreeSet::new(), 50, 5, now());
        assert_eq!(job.state, JobState::Pending);
        job.transition_to(JobState::Assigned).unwrap();
        job.transition_to(JobState::Running).unwrap();
        job.transition_to(JobState::Completed).unwrap();
        assert!(job.is_terminal());
    }

    #[test]
    fn job_rejects_illegal_transition() {
        let mut job = Job::new("1", 1, "acme/svc", "ci", BTreeSet::new(), 50, 5, now());
        let err = job.transition_to(JobState::Running).unwrap_err();
        assert_eq!(err.from, JobState::Pending);
        assert_eq!(err.to, JobState::Running);
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn assigned_can_revert_to_pending_on_lease_expiry() {
        let mut job = Job::new("1", 1, "acme/svc", "ci", BTreeSet::new(), 50, 5, now());
        job.transition_to(JobState::Assigned).unwrap();
        job.transition_to(JobState::Pending).unwrap();
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn label_matching_is_superset_check() {
        let mut labels = BTreeSet::new();
        labels.insert("self-hosted".to_string());
        labels.insert("gpu".to_string());
        let job = Job::new("1", 1, "acme/svc", "ci", labels, 50, 5, now());

        let mut runner_labels: BTreeSet<String> = ["self-hosted", "gpu", "linux"]
            .into_iter()
            .map(String::from)
            .collect();
        assert!(job.matches_labels(&runner_labels));

        runner_labels.remove("gpu");
        assert!(!job.matches_labels(&runner_labels));
    }

    #[test]
    fn pool_bounds() {
        let mut pool = RunnerPool::default_for("acme/svc");
        pool.min_runners = 2;
        pool.max_runners = 5;
        pool.current_size = 3;
        assert!(pool.within_bounds());
        pool.current_size = 6;
        assert!(!pool.within_bounds());
    }

    #[test]
    fn lease_liveness() {
        let t = now();
        let lease = LeaderLease {
            holder_id: "node-a".into(),
            term: 1,
            acquired_at: t,
            expires_at: t + Duration::seconds(15),
            renewal_count: 0,
        };
        assert!(lease.is_live(t));
        assert!(!lease.is_live(t + Duration::seconds(16)));
    }
}
