//! Pre-warmer (`spec.md` §4.5): keeps a bounded pool of ready-to-adopt
//! containers per template so `PoolManager::scale` can skip the provisioning
//! latency on the common path.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::config::PrewarmSettings;
use crate::containers::{ContainerError, ContainerLifecycle, ContainerRuntime, ContainerSpec};
use crate::error::{Classify, ErrorKind};
use crate::model::{PrewarmStatus, PrewarmedContainer, Runner, RunnerType};
use crate::store::{SharedStore, StoreError};

#[derive(Debug, Error)]
pub enum PrewarmError {
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for PrewarmError {
    fn kind(&self) -> ErrorKind {
        match self {
            PrewarmError::Container(e) => e.kind(),
            PrewarmError::Store(e) => e.kind(),
        }
    }
}

fn image_for_template(template: &str) -> String {
    format!("ghcr.io/actions/runner:{template}")
}

/// `spec.md` §4.5: `ceil(predicted_short_term_jobs / 10)` clamped to
/// `[min_pool, max_pool]`.
pub fn target_pool_size(predicted_short_term_jobs: f64, settings: &PrewarmSettings) -> u32 {
    let raw = (predicted_short_term_jobs / 10.0).ceil().max(0.0) as u32;
    raw.clamp(settings.min_pool, settings.max_pool)
}

pub struct PreWarmer {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn SharedStore>,
    lifecycle: Arc<ContainerLifecycle>,
    settings: PrewarmSettings,
    warmup_slots: Arc<Semaphore>,
}

impl PreWarmer {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn SharedStore>,
        lifecycle: Arc<ContainerLifecycle>,
        settings: PrewarmSettings,
    ) -> Self {
        let warmup_slots = Arc::new(Semaphore::new(settings.max_concurrent_warmups));
        Self {
            runtime,
            store,
            lifecycle,
            settings,
            warmup_slots,
        }
    }

    /// Tops up `template`'s ready pool to `target`, starting containers but
    /// not yet registering them with GitHub (`spec.md` §4.5: warm containers
    /// sit idle until a scale-up request adopts one).
    #[instrument(skip(self), fields(%template, target))]
    pub async fn fill(&self, template: &str, target: u32) -> Result<(), PrewarmError> {
        let existing = self.store.list_prewarmed(template).await?;
        let live = existing
            .iter()
            .filter(|c| c.status != PrewarmStatus::Expired)
            .count() as u32;
        let deficit = target.saturating_sub(live);

        for _ in 0..deficit {
            let _permit = self.warmup_slots.acquire().await.expect("semaphore not closed");
            match self.warm_one(template).await {
                Ok(()) => {}
                Err(e) => warn!(error = %e, %template, "failed to warm a container"),
            }
        }
        Ok(())
    }

    async fn warm_one(&self, template: &str) -> Result<(), PrewarmError> {
        let spec = ContainerSpec {
            image: image_for_template(template),
            name: format!("runnerhub-prewarm-{}", uuid::Uuid::new_v4()),
            cpu_cores: 1,
            memory_bytes: 1 << 30,
            env: std::collections::HashMap::new(),
            labels: std::collections::HashMap::new(),
        };
        let container_id = self.runtime.create_and_start(spec).await.map_err(ContainerError::from)?;

        let healthy = self
            .runtime
            .exec_check(&container_id, "/actions-runner/run.sh")
            .await
            .unwrap_or(false);

        let container = PrewarmedContainer {
            container_id,
            template: template.to_string(),
            status: if healthy {
                PrewarmStatus::Ready
            } else {
                PrewarmStatus::Warming
            },
            created_at: Utc::now(),
            last_health_check: Some(Utc::now()),
        };
        self.store.put_prewarmed(container).await?;
        Ok(())
    }

    /// Claims a ready container for `template` and finishes its GitHub
    /// registration against `pool`, or returns `None` if the pool is empty
    /// (the caller should fall back to a fresh `provision`).
    #[instrument(skip(self, labels), fields(%template, %pool))]
    pub async fn consume(
        &self,
        template: &str,
        runner_type: RunnerType,
        labels: BTreeSet<String>,
        pool: &str,
    ) -> Result<Option<Runner>, PrewarmError> {
        let Some(container) = self.store.take_ready_prewarmed(template).await? else {
            return Ok(None);
        };

        let runner = self
            .lifecycle
            .adopt_prewarmed(&container.container_id, runner_type, labels, pool)
            .await?;
        self.store.delete_prewarmed(&container.container_id).await?;
        Ok(Some(runner))
    }

    /// Destroys containers past `max_age_secs` or failing a health check
    /// (`spec.md` §4.5: "recycled after max_age or on health-check
    /// failure").
    #[instrument(skip(self))]
    pub async fn recycle(&self) -> Result<Vec<String>, PrewarmError> {
        let now = Utc::now();
        let mut destroyed = Vec::new();

        for template in &self.settings.templates {
            for container in self.store.list_prewarmed(template).await? {
                let age_secs = (now - container.created_at).num_seconds().max(0) as u64;
                let healthy = self
                    .runtime
                    .exec_check(&container.container_id, "/actions-runner/run.sh")
                    .await
                    .unwrap_or(false);

                if age_secs > self.settings.max_age_secs || !healthy {
                    let _ = self.runtime.stop(&container.container_id, 10).await;
                    let _ = self.runtime.remove(&container.container_id).await;
                    self.store.delete_prewarmed(&container.container_id).await?;
                    destroyed.push(container.container_id);
                } else if container.status == PrewarmStatus::Warming && healthy {
                    let mut ready = container.clone();
                    ready.status = PrewarmStatus::Ready;
                    ready.last_health_check = Some(now);
                    self.store.put_prewarmed(ready).await?;
                }
            }
        }
        Ok(destroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::fake::FakeRuntime;
    use crate::containers::lifecycle::RunnerRegistrar;
    use crate::events_bus::EventBus;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

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

    fn harness() -> PreWarmer {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime::new());
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let lifecycle = Arc::new(ContainerLifecycle::new(
            runtime.clone(),
            store.clone(),
            Arc::new(AlwaysRegistered),
            Arc::new(EventBus::new()),
        ));
        PreWarmer::new(runtime, store, lifecycle, PrewarmSettings::default())
    }

    #[test]
    fn target_size_is_clamped_to_bounds() {
        let settings = PrewarmSettings::default();
        assert_eq!(target_pool_size(0.0, &settings), settings.min_pool);
        assert_eq!(target_pool_size(1000.0, &settings), settings.max_pool);
        assert_eq!(target_pool_size(50.0, &settings), 5);
    }

    #[tokio::test]
    async fn fill_tops_up_to_target_and_is_idempotent() {
        let warmer = harness();
        warmer.fill("ubuntu-latest", 3).await.unwrap();
        let containers = warmer.store.list_prewarmed("ubuntu-latest").await.unwrap();
        assert_eq!(containers.len(), 3);

        warmer.fill("ubuntu-latest", 3).await.unwrap();
        let containers = warmer.store.list_prewarmed("ubuntu-latest").await.unwrap();
        assert_eq!(containers.len(), 3);
    }

    #[tokio::test]
    async fn consume_adopts_a_ready_container_as_an_idle_runner() {
        let warmer = harness();
        warmer.fill("ubuntu-latest", 1).await.unwrap();

        let runner = warmer
            .consume("ubuntu-latest", RunnerType::Small, BTreeSet::new(), "acme/svc")
            .await
            .unwrap();
        assert!(runner.is_some());
        assert!(warmer
            .store
            .list_prewarmed("ubuntu-latest")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn consume_returns_none_when_pool_is_empty() {
        let warmer = harness();
        let runner = warmer
            .consume("ubuntu-latest", RunnerType::Small, BTreeSet::new(), "acme/svc")
            .await
            .unwrap();
        assert!(runner.is_none());
    }

    #[tokio::test]
    async fn recycle_destroys_aged_out_containers() {
        let warmer = harness();
        warmer.fill("ubuntu-latest", 1).await.unwrap();
        let mut container = warmer.store.list_prewarmed("ubuntu-latest").await.unwrap().remove(0);
        container.created_at = Utc::now() - chrono::Duration::hours(2);
        warmer.store.put_prewarmed(container.clone()).await.unwrap();

        let destroyed = warmer.recycle().await.unwrap();
        assert_eq!(destroyed, vec![container.container_id]);
    }
}
