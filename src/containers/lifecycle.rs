//! Container Lifecycle (`spec.md` §4.4): `provision`/`monitor`/`cleanup`
//! against a `ContainerRuntime`, keeping `Runner` records in the shared
//! store in sync with what the daemon actually reports.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{Classify, ErrorKind};
use crate::events_bus::{EventBus, RunnerEvent};
use crate::model::{Runner, RunnerLifecycle, RunnerState, RunnerType};
use crate::store::{SharedStore, StoreError};

use super::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError, MANAGED_LABEL,
    PERSISTENT_LABEL, POOL_LABEL,
};

const MONITOR_INTERVAL_SECS: u64 = 10;
const CLEANUP_INTERVAL_SECS: u64 = 60;
const STOP_GRACE_SECS: i64 = 10;
const MAX_CONSECUTIVE_HEALTH_FAILURES: u32 = 3;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("runner did not register with GitHub within the warmup window")]
    WarmupTimedOut,
}

impl Classify for ContainerError {
    fn kind(&self) -> ErrorKind {
        match self {
            ContainerError::Runtime(e) => e.kind(),
            ContainerError::Store(e) => e.kind(),
            ContainerError::WarmupTimedOut => ErrorKind::TransientExternal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupPolicies {
    pub idle_enabled: bool,
    pub failed_enabled: bool,
    pub orphaned_enabled: bool,
    pub expired_enabled: bool,
    pub idle_timeout_secs: u64,
    pub max_age_secs: u64,
}

impl Default for CleanupPolicies {
    fn default() -> Self {
        Self {
            idle_enabled: true,
            failed_enabled: true,
            orphaned_enabled: true,
            expired_enabled: true,
            idle_timeout_secs: 300,
            max_age_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub destroyed: Vec<String>,
    pub drained: Vec<String>,
    pub errors: Vec<(String, String)>,
}

/// What the registration check needs from GitHub; kept abstract so the
/// lifecycle code doesn't take a hard `octocrab` dependency at this layer.
#[async_trait]
pub trait RunnerRegistrar: Send + Sync {
    async fn generate_token(&self, pool: &str, labels: &BTreeSet<String>) -> Result<String, ContainerError>;
    async fn is_registered(&self, runner_name: &str) -> Result<bool, ContainerError>;
    async fn delete_registration(&self, runner_name: &str) -> Result<(), ContainerError>;
}

pub struct ContainerLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn SharedStore>,
    registrar: Arc<dyn RunnerRegistrar>,
    events: Arc<EventBus>,
    policies: RwLock<CleanupPolicies>,
    warmup_timeout_secs: u64,
    image_by_type: fn(RunnerType) -> &'static str,
}

fn default_image_for(runner_type: RunnerType) -> &'static str {
    match runner_type {
        RunnerType::Small => "ghcr.io/actions/runner:small",
        RunnerType::Medium => "ghcr.io/actions/runner:medium",
        RunnerType::Large => "ghcr.io/actions/runner:large",
    }
}

fn cores_for(runner_type: RunnerType) -> u32 {
    match runner_type {
        RunnerType::Small => 1,
        RunnerType::Medium => 2,
        RunnerType::Large => 4,
    }
}

fn memory_bytes_for(runner_type: RunnerType) -> i64 {
    match runner_type {
        RunnerType::Small => 1 << 30,
        RunnerType::Medium => 4 << 30,
        RunnerType::Large => 8 << 30,
    }
}

impl ContainerLifecycle {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn SharedStore>,
        registrar: Arc<dyn RunnerRegistrar>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            runtime,
            store,
            registrar,
            events,
            policies: RwLock::new(CleanupPolicies::default()),
            warmup_timeout_secs: 90,
            image_by_type: default_image_for,
        }
    }

    pub async fn set_policies(&self, policies: CleanupPolicies) {
        *self.policies.write().await = policies;
    }

    pub async fn policies_snapshot(&self) -> CleanupPolicies {
        self.policies.read().await.clone()
    }

    #[instrument(skip(self, labels), fields(pool = %pool, ?runner_type))]
    pub async fn provision(
        &self,
        runner_type: RunnerType,
        labels: BTreeSet<String>,
        pool: &str,
    ) -> Result<Runner, ContainerError> {
        let runner_id = Uuid::new_v4().to_string();
        let runner_name = format!("runnerhub-{runner_id}");
        let token = self.registrar.generate_token(pool, &labels).await?;

        let mut env = std::collections::HashMap::new();
        env.insert("RUNNER_TOKEN".to_string(), token);
        env.insert("RUNNER_NAME".to_string(), runner_name.clone());
        env.insert("RUNNER_LABELS".to_string(), labels.iter().cloned().collect::<Vec<_>>().join(","));
        env.insert("RUNNER_WORKDIR".to_string(), "/home/runner/_work".to_string());

        let mut container_labels = std::collections::HashMap::new();
        container_labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        container_labels.insert(POOL_LABEL.to_string(), pool.to_string());

        let spec = ContainerSpec {
            image: (self.image_by_type)(runner_type).to_string(),
            name: runner_name.clone(),
            cpu_cores: cores_for(runner_type),
            memory_bytes: memory_bytes_for(runner_type),
            env,
            labels: container_labels,
        };

        let container_id = self.runtime.create_and_start(spec).await?;

        if !self.wait_for_registration(&runner_name).await {
            let _ = self.runtime.stop(&container_id, STOP_GRACE_SECS).await;
            let _ = self.runtime.remove(&container_id).await;
            let _ = self.registrar.delete_registration(&runner_name).await;
            return Err(ContainerError::WarmupTimedOut);
        }

        let runner = Runner {
            runner_id,
            pool: pool.to_string(),
            container_id,
            labels,
            state: RunnerState::Idle,
            runner_type,
            region: "local".to_string(),
            lifecycle: RunnerLifecycle::OnDemand,
            created_at: Utc::now(),
            last_job_at: None,
            jobs_processed: 0,
            persistent: false,
            consecutive_health_failures: 0,
        };

        self.store.put_runner(runner.clone()).await?;
        self.events.publish_runner(RunnerEvent {
            runner_id: runner.runner_id.clone(),
            pool: runner.pool.clone(),
            state: runner.state,
            at: Utc::now(),
        });

        Ok(runner)
    }

    /// Finishes registering an already-running pre-warmed container as a
    /// runner for `pool`: generates a token, configures and starts the agent
    /// in place, then waits for GitHub to observe the registration exactly
    /// as `provision` does for a freshly created container.
    #[instrument(skip(self, labels), fields(pool = %pool, %container_id))]
    pub async fn adopt_prewarmed(
        &self,
        container_id: &str,
        runner_type: RunnerType,
        labels: BTreeSet<String>,
        pool: &str,
    ) -> Result<Runner, ContainerError> {
        let runner_id = Uuid::new_v4().to_string();
        let runner_name = format!("runnerhub-{runner_id}");
        let token = self.registrar.generate_token(pool, &labels).await?;
        let label_csv = labels.iter().cloned().collect::<Vec<_>>().join(",");

        self.runtime
            .exec_run(
                container_id,
                vec![
                    "/actions-runner/configure-and-start.sh".to_string(),
                    token,
                    runner_name.clone(),
                    label_csv,
                ],
            )
            .await?;

        if !self.wait_for_registration(&runner_name).await {
            let _ = self.runtime.stop(container_id, STOP_GRACE_SECS).await;
            let _ = self.runtime.remove(container_id).await;
            let _ = self.registrar.delete_registration(&runner_name).await;
            return Err(ContainerError::WarmupTimedOut);
        }

        let runner = Runner {
            runner_id,
            pool: pool.to_string(),
            container_id: container_id.to_string(),
            labels,
            state: RunnerState::Idle,
            runner_type,
            region: "local".to_string(),
            lifecycle: RunnerLifecycle::PreWarmed,
            created_at: Utc::now(),
            last_job_at: None,
            jobs_processed: 0,
            persistent: false,
            consecutive_health_failures: 0,
        };

        self.store.put_runner(runner.clone()).await?;
        self.events.publish_runner(RunnerEvent {
            runner_id: runner.runner_id.clone(),
            pool: runner.pool.clone(),
            state: runner.state,
            at: Utc::now(),
        });

        Ok(runner)
    }

    async fn wait_for_registration(&self, runner_name: &str) -> bool {
        let deadline = Utc::now() + chrono::Duration::seconds(self.warmup_timeout_secs as i64);
        loop {
            match self.registrar.is_registered(runner_name).await {
                Ok(true) => return true,
                Ok(false) if Utc::now() >= deadline => return false,
                Ok(false) => tokio::time::sleep(StdDuration::from_secs(2)).await,
                Err(_) if Utc::now() >= deadline => return false,
                Err(_) => tokio::time::sleep(StdDuration::from_secs(2)).await,
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn destroy(&self, runner: &Runner) -> Result<(), ContainerError> {
        self.runtime.stop(&runner.container_id, STOP_GRACE_SECS).await?;
        self.runtime.remove(&runner.container_id).await?;
        let _ = self
            .registrar
            .delete_registration(&format!("runnerhub-{}", runner.runner_id))
            .await;
        self.store.delete_runner(&runner.runner_id).await?;
        self.events.publish_runner(RunnerEvent {
            runner_id: runner.runner_id.clone(),
            pool: runner.pool.clone(),
            state: RunnerState::Terminated,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Periodic sweep (`spec.md` §4.4 `monitor()`): container state, health
    /// check, pool-shrink signaling on unexpected exit.
    #[instrument(skip(self))]
    pub async fn monitor(&self) -> Result<(), ContainerError> {
        let runners = self.store.list_runners().await?;
        for runner in runners {
            if runner.state == RunnerState::Terminated {
                continue;
            }

            match self.runtime.inspect(&runner.container_id).await {
                Ok(ContainerStatus::Exited(code)) => {
                    warn!(runner_id = %runner.runner_id, exit_code = code, "runner container exited unexpectedly");
                    self.mark_terminated(&runner).await?;
                    continue;
                }
                Ok(ContainerStatus::Running) => {}
                Ok(ContainerStatus::Unknown) | Err(_) => continue,
            }

            let healthy = self
                .runtime
                .exec_check(&runner.container_id, "/actions-runner/.runner")
                .await
                .unwrap_or(false);

            let mut updated = runner.clone();
            if healthy {
                updated.consecutive_health_failures = 0;
            } else {
                updated.consecutive_health_failures += 1;
            }

            if updated.consecutive_health_failures >= MAX_CONSECUTIVE_HEALTH_FAILURES {
                self.mark_terminated(&updated).await?;
            } else if updated.consecutive_health_failures != runner.consecutive_health_failures {
                self.store.put_runner(updated).await?;
            }
        }
        Ok(())
    }

    async fn mark_terminated(&self, runner: &Runner) -> Result<(), ContainerError> {
        let mut updated = runner.clone();
        updated.state = RunnerState::Terminated;
        self.store.put_runner(updated).await?;
        self.events.publish_runner(RunnerEvent {
            runner_id: runner.runner_id.clone(),
            pool: runner.pool.clone(),
            state: RunnerState::Terminated,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Marks a runner `Draining` without destroying it, mirroring
    /// `PoolManager::drain()`'s effect directly against the store (this
    /// layer already owns `store`, and reaching back into `PoolManager`
    /// would invert the ownership `PoolManager` -> `ContainerLifecycle`).
    async fn drain(&self, runner: &Runner) -> Result<(), ContainerError> {
        let mut updated = runner.clone();
        updated.state = RunnerState::Draining;
        self.store.put_runner(updated).await?;
        self.events.publish_runner(RunnerEvent {
            runner_id: runner.runner_id.clone(),
            pool: runner.pool.clone(),
            state: RunnerState::Draining,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Policy-driven reclamation (`spec.md` §4.4 `cleanup()`). Destruction
    /// is idempotent; a `runnerhub.persistent=true` runner is exempt from
    /// every policy but manual removal. `expired` is the only policy that
    /// requires an intervening `Draining` step before destruction, so an
    /// expired runner mid-job gets one more cleanup cycle to finish rather
    /// than being killed outright.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<CleanupReport, ContainerError> {
        let policies = self.policies.read().await.clone();
        let now = Utc::now();
        let mut report = CleanupReport::default();

        let runners = self.store.list_runners().await?;
        let known_ids: BTreeSet<String> = runners.iter().map(|r| r.container_id.clone()).collect();

        for runner in &runners {
            if runner.persistent {
                continue;
            }

            let expired = policies.expired_enabled && runner.age_secs(now) > policies.max_age_secs as i64;

            let should_destroy = (policies.idle_enabled
                && runner.state == RunnerState::Idle
                && runner.is_idle_longer_than(policies.idle_timeout_secs, now))
                || (policies.failed_enabled && runner.state == RunnerState::Terminated)
                || (expired && runner.state == RunnerState::Draining);

            if should_destroy {
                match self.destroy(runner).await {
                    Ok(()) => report.destroyed.push(runner.runner_id.clone()),
                    Err(e) => report.errors.push((runner.runner_id.clone(), e.to_string())),
                }
            } else if expired && runner.state != RunnerState::Draining {
                match self.drain(runner).await {
                    Ok(()) => report.drained.push(runner.runner_id.clone()),
                    Err(e) => report.errors.push((runner.runner_id.clone(), e.to_string())),
                }
            }
        }

        if policies.orphaned_enabled {
            if let Ok(managed) = self.runtime.list_managed().await {
                for (container_id, labels) in managed {
                    let persistent = labels.get(PERSISTENT_LABEL).is_some_and(|v| v == "true");
                    if !known_ids.contains(&container_id) && !persistent {
                        let _ = self.runtime.stop(&container_id, STOP_GRACE_SECS).await;
                        if self.runtime.remove(&container_id).await.is_ok() {
                            report.destroyed.push(container_id);
                        }
                    }
                }
            }
        }

        if !report.destroyed.is_empty() {
            info!(count = report.destroyed.len(), "cleanup pass destroyed runners");
        }
        if !report.drained.is_empty() {
            info!(count = report.drained.len(), "cleanup pass drained expired runners");
        }

        Ok(report)
    }
}

pub async fn run_monitor_loop(lifecycle: Arc<ContainerLifecycle>, cancel: CancellationToken) {
    run_ticked(lifecycle, cancel, MONITOR_INTERVAL_SECS, |l| {
        Box::pin(async move {
            if let Err(e) = l.monitor().await {
                warn!(error = %e, "monitor pass failed");
            }
        })
    })
    .await;
}

pub async fn run_cleanup_loop(lifecycle: Arc<ContainerLifecycle>, cancel: CancellationToken) {
    run_ticked(lifecycle, cancel, CLEANUP_INTERVAL_SECS, |l| {
        Box::pin(async move {
            if let Err(e) = l.cleanup().await {
                warn!(error = %e, "cleanup pass failed");
            }
        })
    })
    .await;
}

async fn run_ticked<F>(
    lifecycle: Arc<ContainerLifecycle>,
    cancel: CancellationToken,
    interval_secs: u64,
    op: F,
) where
    F: Fn(Arc<ContainerLifecycle>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
{
    let mut tick = tokio::time::interval(StdDuration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => op(lifecycle.clone()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct AlwaysRegistered;

    #[async_trait]
    impl RunnerRegistrar for AlwaysRegistered {
        async fn generate_token(&self, _pool: &str, _labels: &BTreeSet<String>) -> Result<String, ContainerError> {
            Ok("tok".to_string())
        }
        async fn is_registered(&self, _runner_name: &str) -> Result<bool, ContainerError> {
            Ok(true)
        }
        async fn delete_registration(&self, _runner_name: &str) -> Result<(), ContainerError> {
            Ok(())
        }
    }

    fn harness() -> ContainerLifecycle {
        ContainerLifecycle::new(
            Arc::new(super::super::fake::FakeRuntime::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(AlwaysRegistered),
            Arc::new(EventBus::new()),
        )
    }

    #[tokio::test]
    async fn provision_registers_runner_as_idle() {
        let lifecycle = harness();
        let runner = lifecycle
            .provision(RunnerType::Small, BTreeSet::new(), "acme/svc")
            .await
            .unwrap();
        assert_eq!(runner.state, RunnerState::Idle);
    }

    #[tokio::test]
    async fn cleanup_drains_expired_runners_before_destroying() {
        let lifecycle = harness();
        lifecycle
            .set_policies(CleanupPolicies {
                idle_enabled: false,
                ..CleanupPolicies::default()
            })
            .await;
        let mut runner = lifecycle
            .provision(RunnerType::Small, BTreeSet::new(), "acme/svc")
            .await
            .unwrap();
        runner.state = RunnerState::Busy;
        runner.created_at = Utc::now() - chrono::Duration::hours(2);
        lifecycle.store.put_runner(runner.clone()).await.unwrap();

        let first_pass = lifecycle.cleanup().await.unwrap();
        assert!(first_pass.drained.contains(&runner.runner_id));
        assert!(!first_pass.destroyed.contains(&runner.runner_id));
        let stored = lifecycle.store.get_runner(&runner.runner_id).await.unwrap().unwrap();
        assert_eq!(stored.state, RunnerState::Draining);

        let second_pass = lifecycle.cleanup().await.unwrap();
        assert!(second_pass.destroyed.contains(&runner.runner_id));
    }

    #[tokio::test]
    async fn persistent_runners_are_exempt() {
        let lifecycle = harness();
        let mut runner = lifecycle
            .provision(RunnerType::Small, BTreeSet::new(), "acme/svc")
            .await
            .unwrap();
        runner.persistent = true;
        runner.created_at = Utc::now() - chrono::Duration::hours(10);
        lifecycle.store.put_runner(runner.clone()).await.unwrap();

        let report = lifecycle.cleanup().await.unwrap();
        assert!(!report.destroyed.contains(&runner.runner_id));
    }
}
