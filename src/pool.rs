//! Pool Manager (`spec.md` §4.3): one `RunnerPool` per repository, plus the
//! scaling-trigger evaluation that feeds C5's decisions back through
//! `scale()`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::autoscaler::prewarmer::PreWarmer;
use crate::containers::{ContainerError, ContainerLifecycle};
use crate::error::{Classify, ErrorKind};
use crate::events_bus::{EventBus, ScalingEvent};
use crate::model::{Job, Runner, RunnerPool, RunnerState, RunnerType, ScalingDecision, ScalingReason};
use crate::queue::{JobDelegator, QueueError, RunnerFinder};
use crate::store::{SharedStore, StoreError};

const SCALE_EVALUATION_INTERVAL_SECS: u64 = 30;
const GLOBAL_INFLIGHT_SCALE_DEFAULT: usize = 8;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("pool {0} not found")]
    NotFound(String),
}

impl Classify for PoolError {
    fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Store(e) => e.kind(),
            PoolError::Container(e) => e.kind(),
            PoolError::NotFound(_) => ErrorKind::Validation,
        }
    }
}

const DEFAULT_PREWARM_TEMPLATE: &str = "ubuntu-latest";

pub struct PoolManager {
    store: Arc<dyn SharedStore>,
    lifecycle: Arc<ContainerLifecycle>,
    events: Arc<EventBus>,
    inflight: Arc<Semaphore>,
    prewarmer: Option<Arc<PreWarmer>>,
}

impl PoolManager {
    pub fn new(store: Arc<dyn SharedStore>, lifecycle: Arc<ContainerLifecycle>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            lifecycle,
            events,
            inflight: Arc::new(Semaphore::new(GLOBAL_INFLIGHT_SCALE_DEFAULT)),
            prewarmer: None,
        }
    }

    /// `spec.md` §4.5: scale-up requests consume from the pre-warm pool
    /// before provisioning fresh containers.
    pub fn with_prewarmer(mut self, prewarmer: Arc<PreWarmer>) -> Self {
        self.prewarmer = Some(prewarmer);
        self
    }

    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn get_or_create_pool(&self, repository: &str) -> Result<RunnerPool, PoolError> {
        if let Some(pool) = self.store.get_pool(repository).await? {
            return Ok(pool);
        }
        let pool = RunnerPool::default_for(repository);
        self.store.put_pool(pool.clone()).await?;
        Ok(pool)
    }

    #[instrument(skip(self, mutate), fields(repository = %repository))]
    pub async fn update_pool<F>(&self, repository: &str, mutate: F) -> Result<RunnerPool, PoolError>
    where
        F: FnOnce(&mut RunnerPool),
    {
        let mut pool = self.get_or_create_pool(repository).await?;
        mutate(&mut pool);
        pool.current_size = pool.current_size.clamp(pool.min_runners, pool.max_runners);
        self.store.put_pool(pool.clone()).await?;
        Ok(pool)
    }

    #[instrument(skip(self, labels), fields(repository = %repository))]
    pub async fn find_runner(
        &self,
        repository: &str,
        labels: &BTreeSet<String>,
    ) -> Result<Option<Runner>, PoolError> {
        let runners = self.store.list_runners_by_pool(repository).await?;
        Ok(runners.into_iter().find(|r| {
            r.state == RunnerState::Idle && labels.is_subset(&r.labels)
        }))
    }

    /// Records scaling demand for the pool; the actual decision comes from
    /// C5's Scaling Controller, which reads the pool and recent history.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, repository = %job.repository))]
    pub async fn request_capacity(&self, job: &Job) {
        let pool = match self.get_or_create_pool(&job.repository).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to load pool for capacity request");
                return;
            }
        };

        if pool.current_size >= pool.max_runners {
            return;
        }

        let decision = ScalingDecision {
            timestamp: Utc::now(),
            pool: job.repository.clone(),
            from_count: pool.current_size,
            to_count: pool.current_size,
            reason: ScalingReason::QueuePressure,
            confidence: 1.0,
            applied: false,
            error: Some("awaiting scaling controller decision".to_string()),
        };
        if let Err(e) = self.store.append_scaling_decision(decision.clone()).await {
            warn!(error = %e, "failed to record scaling decision");
        }
        self.events.publish_scaling(ScalingEvent { decision });
    }

    #[instrument(skip(self))]
    pub async fn drain(&self, runner_id: &str) -> Result<(), PoolError> {
        let runner = self
            .store
            .get_runner(runner_id)
            .await?
            .ok_or_else(|| PoolError::NotFound(runner_id.to_string()))?;
        let mut updated = runner;
        updated.state = RunnerState::Draining;
        self.store.put_runner(updated).await?;
        Ok(())
    }

    /// Destroys a drained runner once its current job completes or it has
    /// been idle past the pool's timeout.
    #[instrument(skip(self))]
    pub async fn reclaim(&self, runner_id: &str) -> Result<(), PoolError> {
        let runner = self
            .store
            .get_runner(runner_id)
            .await?
            .ok_or_else(|| PoolError::NotFound(runner_id.to_string()))?;

        if runner.state != RunnerState::Draining && runner.state != RunnerState::Idle {
            return Ok(());
        }

        self.lifecycle.destroy(&runner).await?;
        self.update_pool(&runner.pool, |p| {
            p.current_size = p.current_size.saturating_sub(1);
        })
        .await?;
        Ok(())
    }

    /// Executes a scaling operation: create/destroy `|delta|` runners via
    /// C4, bounded by the pool's min/max (`spec.md` §4.3 `scale`).
    #[instrument(skip(self), fields(repository = %repository, delta))]
    pub async fn scale(&self, repository: &str, delta: i32) -> Result<ScalingDecision, PoolError> {
        let _permit = self.inflight.acquire().await.expect("semaphore not closed");
        let pool = self.get_or_create_pool(repository).await?;
        let from_count = pool.current_size;
        let target = (pool.current_size as i32 + delta).clamp(pool.min_runners as i32, pool.max_runners as i32);
        let actual_delta = target - pool.current_size as i32;

        let mut error = None;
        if actual_delta > 0 {
            for _ in 0..actual_delta {
                if self.try_adopt_prewarmed(repository).await {
                    continue;
                }
                if let Err(e) = self
                    .lifecycle
                    .provision(RunnerType::Medium, BTreeSet::new(), repository)
                    .await
                {
                    warn!(error = %e, "provision failed during scale-up");
                    error = Some(e.to_string());
                    break;
                }
            }
        } else if actual_delta < 0 {
            let runners = self.store.list_runners_by_pool(repository).await?;
            let mut idle: Vec<Runner> = runners
                .into_iter()
                .filter(|r| r.state == RunnerState::Idle)
                .collect();
            idle.sort_by_key(|r| r.last_job_at.unwrap_or(r.created_at));

            for runner in idle.into_iter().take((-actual_delta) as usize) {
                if let Err(e) = self.lifecycle.destroy(&runner).await {
                    warn!(error = %e, "destroy failed during scale-down");
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        let actual_runners = self.store.list_runners_by_pool(repository).await?;
        let to_count = actual_runners
            .iter()
            .filter(|r| r.state != RunnerState::Terminated)
            .count() as u32;

        self.update_pool(repository, |p| {
            p.current_size = to_count;
            p.last_scaled_at = Some(Utc::now());
        })
        .await?;

        let decision = ScalingDecision {
            timestamp: Utc::now(),
            pool: repository.to_string(),
            from_count,
            to_count,
            reason: ScalingReason::Utilization,
            confidence: 1.0,
            applied: error.is_none(),
            error,
        };
        self.store.append_scaling_decision(decision.clone()).await?;
        self.events.publish_scaling(ScalingEvent { decision: decision.clone() });

        info!(repository = %repository, from_count, to_count, "scaling operation complete");
        Ok(decision)
    }

    /// Best-effort: adopts a ready pre-warmed container instead of
    /// provisioning fresh one. Returns `false` on any failure so the caller
    /// falls back to `provision` without surfacing a pre-warm miss as an
    /// error.
    async fn try_adopt_prewarmed(&self, repository: &str) -> bool {
        let Some(prewarmer) = &self.prewarmer else {
            return false;
        };
        match prewarmer
            .consume(DEFAULT_PREWARM_TEMPLATE, RunnerType::Medium, BTreeSet::new(), repository)
            .await
        {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "pre-warm adoption failed, falling back to fresh provision");
                false
            }
        }
    }

    /// Scaling triggers evaluated every 30s per pool (`spec.md` §4.3).
    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn evaluate_triggers(&self, repository: &str) -> Result<Option<i32>, PoolError> {
        let pool = self.get_or_create_pool(repository).await?;
        let runners = self.store.list_runners_by_pool(repository).await?;
        let busy = runners.iter().filter(|r| r.state == RunnerState::Busy).count() as f64;
        let utilization = busy / (pool.current_size.max(1) as f64);

        if utilization >= pool.scale_up_threshold && pool.current_size < pool.max_runners {
            return Ok(Some(pool.scale_increment as i32));
        }

        if utilization <= pool.scale_down_threshold && pool.current_size > pool.min_runners {
            let now = Utc::now();
            let idle_count = runners
                .iter()
                .filter(|r| r.is_idle_longer_than(pool.idle_timeout_secs, now))
                .count();
            if idle_count > 0 {
                return Ok(Some(-(idle_count as i32)));
            }
        }

        Ok(None)
    }
}

/// What C1 needs to release the runner a finished job was assigned to,
/// expressed as a capability so the webhook layer doesn't depend on the
/// concrete `PoolManager` (`spec.md` §9 "capability interfaces").
#[async_trait]
pub trait RunnerReleaser: Send + Sync {
    async fn release_runner(&self, runner_ref: &str) -> Result<(), PoolError>;
}

#[async_trait]
impl RunnerReleaser for PoolManager {
    /// Drains then destroys the runner a `completed`/`failed`/`cancelled`
    /// job was assigned to (`spec.md` §8 S1: "container destroyed within
    /// 60s"). `runner_ref` is whatever C1 has on hand: the GitHub-facing
    /// `runnerhub-<id>` name, or the bare runner id `delegate` recorded
    /// before GitHub echoed a name back.
    #[instrument(skip(self))]
    async fn release_runner(&self, runner_ref: &str) -> Result<(), PoolError> {
        let runner_id = runner_ref.strip_prefix("runnerhub-").unwrap_or(runner_ref);
        if self.store.get_runner(runner_id).await?.is_none() {
            return Ok(());
        }
        self.drain(runner_id).await?;
        self.reclaim(runner_id).await
    }
}

#[async_trait]
impl RunnerFinder for PoolManager {
    async fn find_runner(&self, repository: &str, labels: &BTreeSet<String>) -> Option<Runner> {
        self.find_runner(repository, labels).await.ok().flatten()
    }

    async fn request_capacity(&self, job: &Job) {
        self.request_capacity(job).await
    }
}

#[async_trait]
impl JobDelegator for PoolManager {
    /// Hands a reserved job to the idle runner that will execute it: marks
    /// the runner `busy` and records the assignment on the job.
    async fn delegate(&self, job: &Job, runner: &Runner) -> Result<(), QueueError> {
        let mut busy_runner = runner.clone();
        busy_runner.state = RunnerState::Busy;
        busy_runner.last_job_at = Some(Utc::now());
        busy_runner.jobs_processed += 1;
        self.store.put_runner(busy_runner).await.map_err(QueueError::Store)?;

        if let Some(current) = self.store.get_job(&job.job_id).await.map_err(QueueError::Store)? {
            let expected = current.state;
            let mut updated = current;
            updated.assigned_runner = Some(runner.runner_id.clone());
            self.store
                .cas_job(&job.job_id, expected, updated)
                .await
                .map_err(QueueError::Store)?;
        }

        Ok(())
    }
}

/// Drives `evaluate_triggers` + `scale` across all pools every 30s
/// (`spec.md` §9: single scheduler, not per-pool timers).
pub async fn run_scaling_loop(manager: Arc<PoolManager>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(StdDuration::from_secs(SCALE_EVALUATION_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {
                let pools = match manager.store.list_pools().await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "failed to list pools for scaling evaluation");
                        continue;
                    }
                };

                for pool in pools {
                    match manager.evaluate_triggers(&pool.repository).await {
                        Ok(Some(delta)) => {
                            if let Err(e) = manager.scale(&pool.repository, delta).await {
                                warn!(repository = %pool.repository, error = %e, "scale operation failed");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(repository = %pool.repository, error = %e, "trigger evaluation failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::fake::FakeRuntime;
    use crate::containers::lifecycle::RunnerRegistrar;
    use crate::store::MemoryStore;

    struct AlwaysRegistered;

    #[async_trait]
    impl RunnerRegistrar for AlwaysRegistered {
        async fn generate_token(&self, _pool: &str, _labels: &BTreeSet<String>) -> Result<String, ContainerError> {
            Ok("tok".into())
        }
        async fn is_registered(&self, _runner_name: &str) -> Result<bool, ContainerError> {
            Ok(true)
        }
        async fn delete_registration(&self, _runner_name: &str) -> Result<(), ContainerError> {
            Ok(())
        }
    }

    fn harness() -> PoolManager {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new());
        let lifecycle = Arc::new(ContainerLifecycle::new(
            Arc::new(FakeRuntime::new()),
            store.clone(),
            Arc::new(AlwaysRegistered),
            events.clone(),
        ));
        PoolManager::new(store, lifecycle, events)
    }

    #[tokio::test]
    async fn scale_up_provisions_and_updates_pool_size() {
        let manager = harness();
        manager.get_or_create_pool("acme/svc").await.unwrap();

        let decision = manager.scale("acme/svc", 2).await.unwrap();
        assert_eq!(decision.to_count, 2);

        let pool = manager.get_or_create_pool("acme/svc").await.unwrap();
        assert_eq!(pool.current_size, 2);
    }

    #[tokio::test]
    async fn scale_respects_max_runners_clamp() {
        let manager = harness();
        manager
            .update_pool("acme/svc", |p| p.max_runners = 1)
            .await
            .unwrap();

        let decision = manager.scale("acme/svc", 5).await.unwrap();
        assert_eq!(decision.to_count, 1);
    }

    #[tokio::test]
    async fn find_runner_requires_label_superset() {
        let manager = harness();
        manager.scale("acme/svc", 1).await.unwrap();

        let mut labels = BTreeSet::new();
        labels.insert("gpu".to_string());
        assert!(manager.find_runner("acme/svc", &labels).await.unwrap().is_none());
        assert!(manager
            .find_runner("acme/svc", &BTreeSet::new())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn evaluate_triggers_signals_scale_up_under_high_utilization() {
        let manager = harness();
        manager.scale("acme/svc", 1).await.unwrap();

        let runners = manager.store.list_runners_by_pool("acme/svc").await.unwrap();
        let mut busy = runners[0].clone();
        busy.state = RunnerState::Busy;
        manager.store.put_runner(busy).await.unwrap();

        let delta = manager.evaluate_triggers("acme/svc").await.unwrap();
        assert_eq!(delta, Some(2));
    }

    #[tokio::test]
    async fn release_runner_drains_and_destroys_a_busy_runner() {
        let manager = harness();
        manager.scale("acme/svc", 1).await.unwrap();
        let runner = manager.store.list_runners_by_pool("acme/svc").await.unwrap().remove(0);

        let mut busy = runner.clone();
        busy.state = RunnerState::Busy;
        manager.store.put_runner(busy).await.unwrap();

        manager
            .release_runner(&format!("runnerhub-{}", runner.runner_id))
            .await
            .unwrap();

        assert!(manager.store.get_runner(&runner.runner_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_runner_on_unknown_ref_is_a_no_op() {
        let manager = harness();
        assert!(manager.release_runner("runnerhub-does-not-exist").await.is_ok());
    }
}
