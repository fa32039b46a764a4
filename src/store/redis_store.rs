//! Production `SharedStore` backed by Redis. Leases use atomic Lua scripts
//! (`spec.md` §9: "renewal must be conditional on current-holder match") and
//! job state transitions use a companion state key as the CAS version tag,
//! since Redis itself has no notion of per-document version numbers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use redis::aio::ConnectionManager;

use crate::model::{
    Delivery, DeliveryState, Horizon, Job, JobState, LeaderLease, MetricSample, Prediction,
    PrewarmStatus, PrewarmedContainer, Runner, RunnerPool, ScalingDecision,
};

use super::{InsertOutcome, JobFilter, SharedStore, StoreError};

const DELIVERY_TTL_SECS: i64 = 30 * 24 * 3600;

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn ser<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn de<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Composite score so `ZREVRANGE` yields priority-desc, then FIFO by
/// `created_at` within a priority bucket (`spec.md` §4.2).
fn pending_score(job: &Job) -> f64 {
    let priority = job.priority as f64;
    let age_penalty = job.created_at.timestamp_millis() as f64 / 1e13;
    priority - age_penalty
}

const CAS_JOB_SCRIPT: &str = r#"
local state_key = KEYS[1]
local job_key = KEYS[2]
local expected = ARGV[1]
local new_state = ARGV[2]
local new_job = ARGV[3]

local current = redis.call('GET', state_key)
if current == false or current ~= expected then
    return 0
end
redis.call('SET', state_key, new_state)
redis.call('SET', job_key, new_job)
return 1
"#;

const ACQUIRE_LEASE_SCRIPT: &str = r#"
local lease_key = KEYS[1]
local term_key = KEYS[2]
local holder = ARGV[1]
local ttl = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local existing = redis.call('GET', lease_key)
if existing ~= false then
    return redis.error_reply('held')
end

local term = redis.call('INCR', term_key)
local lease = cjson.encode({holder_id = holder, term = term, acquired_at = now, expires_at = now + ttl, renewal_count = 0})
redis.call('SET', lease_key, lease, 'EX', ttl)
return lease
"#;

const RENEW_LEASE_SCRIPT: &str = r#"
local lease_key = KEYS[1]
local holder = ARGV[1]
local ttl = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local existing = redis.call('GET', lease_key)
if existing == false then
    return redis.error_reply('absent')
end

local lease = cjson.decode(existing)
if lease.holder_id ~= holder then
    return redis.error_reply('not_holder')
end

lease.expires_at = now + ttl
lease.renewal_count = lease.renewal_count + 1
local encoded = cjson.encode(lease)
redis.call('SET', lease_key, encoded, 'EX', ttl)
return encoded
"#;

#[async_trait]
impl SharedStore for RedisStore {
    async fn insert_delivery_if_absent(
        &self,
        delivery: Delivery,
    ) -> Result<InsertOutcome, StoreError> {
        let mut conn = self.conn();
        let key = format!("delivery:{}", delivery.delivery_id);
        let payload = ser(&delivery)?;
        let ok: bool = redis::cmd("SET")
            .arg(&key)
            .arg(&payload)
            .arg("NX")
            .arg("EX")
            .arg(DELIVERY_TTL_SECS)
            .query_async(&mut conn)
            .await
            .map(|v: Option<String>| v.is_some())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(if ok {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyExists
        })
    }

    async fn get_delivery(&self, delivery_id: &str) -> Result<Option<Delivery>, StoreError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(format!("delivery:{delivery_id}"))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        raw.map(|r| de(&r)).transpose()
    }

    async fn set_delivery_state(
        &self,
        delivery_id: &str,
        state: DeliveryState,
    ) -> Result<(), StoreError> {
        if let Some(mut d) = self.get_delivery(delivery_id).await? {
            d.processing_state = state;
            let mut conn = self.conn();
            let _: () = conn
                .set(format!("delivery:{delivery_id}"), ser(&d)?)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }

    async fn put_job(&self, job: Job) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let key = format!("job:{}", job.job_id);
        let state_key = format!("job:{}:state", job.job_id);
        let payload = ser(&job)?;

        let _: () = conn
            .set(&key, &payload)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let _: () = conn
            .set(&state_key, format!("{:?}", job.state))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let _: () = conn
            .sadd("jobs:all", &job.job_id)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if job.state == JobState::Pending {
            let _: () = conn
                .zadd("jobs:pending", &job.job_id, pending_score(&job))
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        } else {
            let _: () = conn
                .zrem("jobs:pending", &job.job_id)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        if job.state == JobState::Assigned {
            let _: () = conn
                .sadd("jobs:assigned", &job.job_id)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        } else {
            let _: () = conn
                .srem("jobs:assigned", &job.job_id)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(format!("job:{job_id}"))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        raw.map(|r| de(&r)).transpose()
    }

    async fn cas_job(
        &self,
        job_id: &str,
        expected: JobState,
        updated: Job,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let state_key = format!("job:{job_id}:state");
        let job_key = format!("job:{job_id}");
        let payload = ser(&updated)?;

        let applied: i32 = Script::new(CAS_JOB_SCRIPT)
            .key(&state_key)
            .key(&job_key)
            .arg(format!("{expected:?}"))
            .arg(format!("{:?}", updated.state))
            .arg(&payload)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if applied == 0 {
            return Err(StoreError::Conflict(job_id.to_string()));
        }

        // Index maintenance best-effort; `put_job` keeps them canonical on
        // the next full write, the same indexing a pure CAS must still do.
        self.reindex_job(&mut conn, &updated).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .smembers("jobs:all")
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.get_job(&id).await? {
                if filter.matches(&job) {
                    out.push(job);
                }
            }
        }
        Ok(out)
    }

    async fn list_reservable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .zrevrange("jobs:pending", 0, (limit.saturating_mul(2)) as isize)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut out = Vec::with_capacity(limit);
        for id in ids {
            if out.len() >= limit {
                break;
            }
            if let Some(job) = self.get_job(&id).await? {
                if job.state == JobState::Pending && job.scheduled_run_at <= now {
                    out.push(job);
                }
            }
        }
        Ok(out)
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .smembers("jobs:assigned")
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut out = Vec::new();
        for id in ids {
            if let Some(job) = self.get_job(&id).await? {
                if job.lease_expires_at.is_some_and(|exp| exp <= now) {
                    out.push(job);
                }
            }
        }
        Ok(out)
    }

    async fn get_pool(&self, repository: &str) -> Result<Option<RunnerPool>, StoreError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(format!("pool:{repository}"))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        raw.map(|r| de(&r)).transpose()
    }

    async fn put_pool(&self, pool: RunnerPool) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn
            .set(format!("pool:{}", pool.repository), ser(&pool)?)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let _: () = conn
            .sadd("pools:all", &pool.repository)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<RunnerPool>, StoreError> {
        let mut conn = self.conn();
        let repos: Vec<String> = conn
            .smembers("pools:all")
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut out = Vec::with_capacity(repos.len());
        for r in repos {
            if let Some(p) = self.get_pool(&r).await? {
                out.push(p);
            }
        }
        Ok(out)
    }

    async fn get_runner(&self, runner_id: &str) -> Result<Option<Runner>, StoreError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(format!("runner:{runner_id}"))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        raw.map(|r| de(&r)).transpose()
    }

    async fn put_runner(&self, runner: Runner) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn
            .set(format!("runner:{}", runner.runner_id), ser(&runner)?)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let _: () = conn
            .sadd("runners:all", &runner.runner_id)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let _: () = conn
            .sadd(format!("runners:pool:{}", runner.pool), &runner.runner_id)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn delete_runner(&self, runner_id: &str) -> Result<(), StoreError> {
        if let Some(runner) = self.get_runner(runner_id).await? {
            let mut conn = self.conn();
            let _: () = conn
                .srem(format!("runners:pool:{}", runner.pool), runner_id)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        let mut conn = self.conn();
        let _: () = conn
            .srem("runners:all", runner_id)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let _: () = conn
            .del(format!("runner:{runner_id}"))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn list_runners_by_pool(&self, pool: &str) -> Result<Vec<Runner>, StoreError> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .smembers(format!("runners:pool:{pool}"))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self.get_runner(&id).await? {
                out.push(r);
            }
        }
        Ok(out)
    }

    async fn list_runners(&self) -> Result<Vec<Runner>, StoreError> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .smembers("runners:all")
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self.get_runner(&id).await? {
                out.push(r);
            }
        }
        Ok(out)
    }

    async fn put_prewarmed(&self, container: PrewarmedContainer) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn
            .set(
                format!("prewarm:{}", container.container_id),
                ser(&container)?,
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let _: () = conn
            .sadd(
                format!("prewarm:template:{}", container.template),
                &container.container_id,
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if container.status == PrewarmStatus::Ready {
            let _: () = conn
                .sadd(
                    format!("prewarm:ready:{}", container.template),
                    &container.container_id,
                )
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }

    async fn take_ready_prewarmed(
        &self,
        template: &str,
    ) -> Result<Option<PrewarmedContainer>, StoreError> {
        let mut conn = self.conn();
        let id: Option<String> = conn
            .spop(format!("prewarm:ready:{template}"))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let Some(id) = id else { return Ok(None) };
        let raw: Option<String> = conn
            .get(format!("prewarm:{id}"))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let Some(raw) = raw else { return Ok(None) };
        let mut container: PrewarmedContainer = de(&raw)?;
        container.status = PrewarmStatus::Claimed;
        self.put_prewarmed(container.clone()).await?;
        Ok(Some(container))
    }

    async fn list_prewarmed(&self, template: &str) -> Result<Vec<PrewarmedContainer>, StoreError> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .smembers(format!("prewarm:template:{template}"))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn
                .get(format!("prewarm:{id}"))
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            if let Some(raw) = raw {
                out.push(de(&raw)?);
            }
        }
        Ok(out)
    }

    async fn delete_prewarmed(&self, container_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn
            .del(format!("prewarm:{container_id}"))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn record_metric_sample(&self, sample: MetricSample) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn
            .lpush(format!("metric_samples:{}", sample.pool), ser(&sample)?)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn recent_metric_samples(
        &self,
        pool: &str,
        limit: usize,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let mut conn = self.conn();
        let raws: Vec<String> = conn
            .lrange(format!("metric_samples:{pool}"), 0, limit as isize - 1)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut samples: Vec<MetricSample> =
            raws.iter().map(|r| de(r)).collect::<Result<_, _>>()?;
        samples.reverse();
        Ok(samples)
    }

    async fn append_scaling_decision(&self, decision: ScalingDecision) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn
            .lpush(format!("scaling_log:{}", decision.pool), ser(&decision)?)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn recent_scaling_decisions(
        &self,
        pool: &str,
        limit: usize,
    ) -> Result<Vec<ScalingDecision>, StoreError> {
        let mut conn = self.conn();
        let raws: Vec<String> = conn
            .lrange(format!("scaling_log:{pool}"), 0, limit as isize - 1)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        raws.iter().map(|r| de(r)).collect()
    }

    async fn append_prediction(&self, prediction: Prediction) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let key = format!(
            "prediction_log:{}:{:?}",
            prediction.pool, prediction.horizon
        );
        let _: () = conn
            .lpush(key, ser(&prediction)?)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn recent_predictions(
        &self,
        pool: &str,
        horizon: Horizon,
        limit: usize,
    ) -> Result<Vec<Prediction>, StoreError> {
        let mut conn = self.conn();
        let key = format!("prediction_log:{pool}:{horizon:?}");
        let raws: Vec<String> = conn
            .lrange(key, 0, limit as isize - 1)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        raws.iter().map(|r| de(r)).collect()
    }

    async fn try_acquire_lease(
        &self,
        holder_id: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaderLease>, StoreError> {
        let mut conn = self.conn();
        let result: redis::RedisResult<String> = Script::new(ACQUIRE_LEASE_SCRIPT)
            .key("leader_lease")
            .key("leader_term")
            .arg(holder_id)
            .arg(ttl_secs)
            .arg(now.timestamp())
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok(raw) => Ok(Some(lease_from_json(&raw, now)?)),
            Err(e) if e.to_string().contains("held") => Ok(None),
            Err(e) => Err(StoreError::Unavailable(e.to_string())),
        }
    }

    async fn renew_lease(
        &self,
        holder_id: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaderLease>, StoreError> {
        let mut conn = self.conn();
        let result: redis::RedisResult<String> = Script::new(RENEW_LEASE_SCRIPT)
            .key("leader_lease")
            .arg(holder_id)
            .arg(ttl_secs)
            .arg(now.timestamp())
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok(raw) => Ok(Some(lease_from_json(&raw, now)?)),
            Err(e) if e.to_string().contains("absent") || e.to_string().contains("not_holder") => {
                Ok(None)
            }
            Err(e) => Err(StoreError::Unavailable(e.to_string())),
        }
    }

    async fn get_lease(&self) -> Result<Option<LeaderLease>, StoreError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get("leader_lease")
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        raw.map(|r| lease_from_json(&r, Utc::now())).transpose()
    }

    async fn release_lease(&self, holder_id: &str) -> Result<(), StoreError> {
        if let Some(lease) = self.get_lease().await? {
            if lease.holder_id == holder_id {
                let mut conn = self.conn();
                let _: () = conn
                    .del("leader_lease")
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }
        Ok(())
    }
}

impl RedisStore {
    async fn reindex_job(
        &self,
        conn: &mut ConnectionManager,
        job: &Job,
    ) -> Result<(), StoreError> {
        if job.state == JobState::Pending {
            let _: () = conn
                .zadd("jobs:pending", &job.job_id, pending_score(job))
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        } else {
            let _: () = conn
                .zrem("jobs:pending", &job.job_id)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        if job.state == JobState::Assigned {
            let _: () = conn
                .sadd("jobs:assigned", &job.job_id)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        } else {
            let _: () = conn
                .srem("jobs:assigned", &job.job_id)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }
}

/// Minimal JSON-ish field reader for the Lua-encoded lease blob, avoiding a
/// dependency on `cjson`'s exact numeric formatting by round-tripping through
/// `serde_json`.
fn lease_from_json(raw: &str, _now: DateTime<Utc>) -> Result<LeaderLease, StoreError> {
    #[derive(serde::Deserialize)]
    struct RawLease {
        holder_id: String,
        term: u64,
        acquired_at: i64,
        expires_at: i64,
        renewal_count: u64,
    }

    let parsed: RawLease =
        serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(LeaderLease {
        holder_id: parsed.holder_id,
        term: parsed.term,
        acquired_at: DateTime::from_timestamp(parsed.acquired_at, 0).unwrap_or_default(),
        expires_at: DateTime::from_timestamp(parsed.expires_at, 0).unwrap_or_default(),
        renewal_count: parsed.renewal_count,
    })
}
