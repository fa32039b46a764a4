//! In-process `SharedStore` fake backed by `dashmap`, for unit and
//! integration tests (`SPEC_FULL.md` "Shared store").

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::model::{
    Delivery, DeliveryState, Horizon, Job, JobState, LeaderLease, MetricSample, Prediction,
    PrewarmedContainer, Runner, RunnerPool, ScalingDecision,
};

use super::{InsertOutcome, JobFilter, SharedStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    deliveries: DashMap<String, Delivery>,
    jobs: DashMap<String, Job>,
    pools: DashMap<String, RunnerPool>,
    runners: DashMap<String, Runner>,
    prewarmed: DashMap<String, PrewarmedContainer>,
    metric_samples: Mutex<Vec<MetricSample>>,
    scaling_log: Mutex<Vec<ScalingDecision>>,
    prediction_log: Mutex<Vec<Prediction>>,
    lease: Mutex<Option<LeaderLease>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn insert_delivery_if_absent(
        &self,
        delivery: Delivery,
    ) -> Result<InsertOutcome, StoreError> {
        match self.deliveries.entry(delivery.delivery_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(InsertOutcome::AlreadyExists),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(delivery);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn get_delivery(&self, delivery_id: &str) -> Result<Option<Delivery>, StoreError> {
        Ok(self.deliveries.get(delivery_id).map(|d| d.clone()))
    }

    async fn set_delivery_state(
        &self,
        delivery_id: &str,
        state: DeliveryState,
    ) -> Result<(), StoreError> {
        if let Some(mut d) = self.deliveries.get_mut(delivery_id) {
            d.processing_state = state;
        }
        Ok(())
    }

    async fn put_job(&self, job: Job) -> Result<(), StoreError> {
        self.jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.get(job_id).map(|j| j.clone()))
    }

    async fn cas_job(
        &self,
        job_id: &str,
        expected: JobState,
        updated: Job,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::Conflict(job_id.to_string()))?;
        if entry.state != expected {
            return Err(StoreError::Conflict(job_id.to_string()));
        }
        *entry = updated;
        Ok(())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn list_reservable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|e| e.value().state == JobState::Pending && e.value().scheduled_run_at <= now)
            .map(|e| e.value().clone())
            .collect();
        // Higher priority first; FIFO by created_at within a priority bucket.
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .iter()
            .filter(|e| {
                e.value().state == JobState::Assigned
                    && e.value().lease_expires_at.is_some_and(|exp| exp <= now)
            })
            .map(|e| e.value().clone())
            .collect())
    }

    async fn get_pool(&self, repository: &str) -> Result<Option<RunnerPool>, StoreError> {
        Ok(self.pools.get(repository).map(|p| p.clone()))
    }

    async fn put_pool(&self, pool: RunnerPool) -> Result<(), StoreError> {
        self.pools.insert(pool.repository.clone(), pool);
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<RunnerPool>, StoreError> {
        Ok(self.pools.iter().map(|p| p.value().clone()).collect())
    }

    async fn get_runner(&self, runner_id: &str) -> Result<Option<Runner>, StoreError> {
        Ok(self.runners.get(runner_id).map(|r| r.clone()))
    }

    async fn put_runner(&self, runner: Runner) -> Result<(), StoreError> {
        self.runners.insert(runner.runner_id.clone(), runner);
        Ok(())
    }

    async fn delete_runner(&self, runner_id: &str) -> Result<(), StoreError> {
        self.runners.remove(runner_id);
        Ok(())
    }

    async fn list_runners_by_pool(&self, pool: &str) -> Result<Vec<Runner>, StoreError> {
        Ok(self
            .runners
            .iter()
            .filter(|e| e.value().pool == pool)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn list_runners(&self) -> Result<Vec<Runner>, StoreError> {
        Ok(self.runners.iter().map(|e| e.value().clone()).collect())
    }

    async fn put_prewarmed(&self, container: PrewarmedContainer) -> Result<(), StoreError> {
        self.prewarmed
            .insert(container.container_id.clone(), container);
        Ok(())
    }

    async fn take_ready_prewarmed(
        &self,
        template: &str,
    ) -> Result<Option<PrewarmedContainer>, StoreError> {
        let candidate = self
            .prewarmed
            .iter()
            .find(|e| {
                e.value().template == template
                    && e.value().status == crate::model::PrewarmStatus::Ready
            })
            .map(|e| e.key().clone());

        match candidate {
            Some(id) => {
                let (_, mut container) = self.prewarmed.remove(&id).expect("checked above");
                container.status = crate::model::PrewarmStatus::Claimed;
                Ok(Some(container))
            }
            None => Ok(None),
        }
    }

    async fn list_prewarmed(&self, template: &str) -> Result<Vec<PrewarmedContainer>, StoreError> {
        Ok(self
            .prewarmed
            .iter()
            .filter(|e| e.value().template == template)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn delete_prewarmed(&self, container_id: &str) -> Result<(), StoreError> {
        self.prewarmed.remove(container_id);
        Ok(())
    }

    async fn record_metric_sample(&self, sample: MetricSample) -> Result<(), StoreError> {
        self.metric_samples
            .lock()
            .map_err(|_| StoreError::Unavailable("metric samples poisoned".into()))?
            .push(sample);
        Ok(())
    }

    async fn recent_metric_samples(
        &self,
        pool: &str,
        limit: usize,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let log = self
            .metric_samples
            .lock()
            .map_err(|_| StoreError::Unavailable("metric samples poisoned".into()))?;
        let mut samples: Vec<MetricSample> = log
            .iter()
            .rev()
            .filter(|s| s.pool == pool)
            .take(limit)
            .cloned()
            .collect();
        samples.reverse();
        Ok(samples)
    }

    async fn append_scaling_decision(&self, decision: ScalingDecision) -> Result<(), StoreError> {
        self.scaling_log
            .lock()
            .map_err(|_| StoreError::Unavailable("scaling log poisoned".into()))?
            .push(decision);
        Ok(())
    }

    async fn recent_scaling_decisions(
        &self,
        pool: &str,
        limit: usize,
    ) -> Result<Vec<ScalingDecision>, StoreError> {
        let log = self
            .scaling_log
            .lock()
            .map_err(|_| StoreError::Unavailable("scaling log poisoned".into()))?;
        Ok(log
            .iter()
            .rev()
            .filter(|d| d.pool == pool)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn append_prediction(&self, prediction: Prediction) -> Result<(), StoreError> {
        self.prediction_log
            .lock()
            .map_err(|_| StoreError::Unavailable("prediction log poisoned".into()))?
            .push(prediction);
        Ok(())
    }

    async fn recent_predictions(
        &self,
        pool: &str,
        horizon: Horizon,
        limit: usize,
    ) -> Result<Vec<Prediction>, StoreError> {
        let log = self
            .prediction_log
            .lock()
            .map_err(|_| StoreError::Unavailable("prediction log poisoned".into()))?;
        Ok(log
            .iter()
            .rev()
            .filter(|p| p.pool == pool && p.horizon == horizon)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn try_acquire_lease(
        &self,
        holder_id: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaderLease>, StoreError> {
        let mut guard = self
            .lease
            .lock()
            .map_err(|_| StoreError::Unavailable("lease poisoned".into()))?;

        if let Some(current) = guard.as_ref() {
            if current.is_live(now) {
                return Ok(None);
            }
        }

        let term = guard.as_ref().map(|l| l.term + 1).unwrap_or(1);
        let lease = LeaderLease {
            holder_id: holder_id.to_string(),
            term,
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs as i64),
            renewal_count: 0,
        };
        *guard = Some(lease.clone());
        Ok(Some(lease))
    }

    async fn renew_lease(
        &self,
        holder_id: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaderLease>, StoreError> {
        let mut guard = self
            .lease
            .lock()
            .map_err(|_| StoreError::Unavailable("lease poisoned".into()))?;

        match guard.as_mut() {
            Some(current) if current.holder_id == holder_id => {
                current.expires_at = now + chrono::Duration::seconds(ttl_secs as i64);
                current.renewal_count += 1;
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get_lease(&self) -> Result<Option<LeaderLease>, StoreError> {
        Ok(self
            .lease
            .lock()
            .map_err(|_| StoreError::Unavailable("lease poisoned".into()))?
            .clone())
    }

    async fn release_lease(&self, holder_id: &str) -> Result<(), StoreError> {
        let mut guard = self
            .lease
            .lock()
            .map_err(|_| StoreError::Unavailable("lease poisoned".into()))?;
        if guard.as_ref().is_some_and(|l| l.holder_id == holder_id) {
            *guard = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Conclusion;
    use std::collections::BTreeSet;

    fn job(id: &str, priority: u8, created_at: DateTime<Utc>) -> Job {
        let mut j = Job::new(id, 1, "acme/svc", "ci", BTreeSet::new(), priority, 5, created_at);
        j.scheduled_run_at = created_at;
        j
    }

    #[tokio::test]
    async fn delivery_dedup_is_atomic() {
        let store = MemoryStore::new();
        let d = Delivery {
            delivery_id: "dup-1".into(),
            event_type: "workflow_job".into(),
            signature: "sig".into(),
            payload_hash: "hash".into(),
            received_at: Utc::now(),
            processing_state: DeliveryState::Received,
        };
        assert_eq!(
            store.insert_delivery_if_absent(d.clone()).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_delivery_if_absent(d).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
    }

    #[tokio::test]
    async fn reservable_jobs_ordered_by_priority_then_fifo() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.put_job(job("low", 40, t0)).await.unwrap();
        store
            .put_job(job("high", 90, t0 + chrono::Duration::seconds(1)))
            .await
            .unwrap();
        store
            .put_job(job("mid", 60, t0 + chrono::Duration::seconds(2)))
            .await
            .unwrap();

        let reservable = store.list_reservable_jobs(Utc::now(), 10).await.unwrap();
        let ids: Vec<_> = reservable.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn cas_job_rejects_stale_expectation() {
        let store = MemoryStore::new();
        let mut j = job("1", 50, Utc::now());
        store.put_job(j.clone()).await.unwrap();
        j.transition_to(JobState::Assigned).unwrap();

        let err = store
            .cas_job("1", JobState::Running, j.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store
            .cas_job("1", JobState::Pending, j.clone())
            .await
            .unwrap();
        let stored = store.get_job("1").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Assigned);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let lease = store.try_acquire_lease("a", 15, t0).await.unwrap();
        assert!(lease.is_some());

        // Another node can't acquire while live.
        let second = store.try_acquire_lease("b", 15, t0).await.unwrap();
        assert!(second.is_none());

        // After expiry, a new holder can take over with an incremented term.
        let later = t0 + chrono::Duration::seconds(16);
        let taken_over = store.try_acquire_lease("b", 15, later).await.unwrap().unwrap();
        assert_eq!(taken_over.holder_id, "b");
        assert_eq!(taken_over.term, 2);
    }

    #[tokio::test]
    async fn renew_fails_for_non_holder() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.try_acquire_lease("a", 15, t0).await.unwrap();
        assert!(store.renew_lease("b", 15, t0).await.unwrap().is_none());
        assert!(store.renew_lease("a", 15, t0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn metric_samples_are_returned_oldest_first_per_pool() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        for i in 0..3u32 {
            store
                .record_metric_sample(MetricSample {
                    timestamp: t0 + chrono::Duration::minutes(i as i64),
                    pool: "acme/svc".into(),
                    queued_jobs: i,
                    running_jobs: 0,
                    utilization: 0.0,
                    avg_job_duration_secs: 0.0,
                })
                .await
                .unwrap();
        }
        let recent = store.recent_metric_samples("acme/svc", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].queued_jobs, 1);
        assert_eq!(recent[1].queued_jobs, 2);
    }

    #[tokio::test]
    async fn conclusion_round_trips_through_store() {
        let store = MemoryStore::new();
        let mut j = job("1", 50, Utc::now());
        j.conclusion = Some(Conclusion::Success);
        store.put_job(j).await.unwrap();
        let fetched = store.get_job("1").await.unwrap().unwrap();
        assert_eq!(fetched.conclusion, Some(Conclusion::Success));
    }
}
