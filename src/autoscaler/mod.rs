//! Auto-Scaler (`spec.md` §4.5): five cooperating sub-modules behind one
//! coordinator that fires every minute. Each sub-module degrades to a
//! fallback on failure rather than blocking the others.

pub mod analytics;
pub mod controller;
pub mod cost;
pub mod predictor;
pub mod prewarmer;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::config::{BudgetSettings, PrewarmSettings, ScalingSettings};
use crate::error::{Classify, ErrorKind};
use crate::model::{Horizon, MetricSample, RunnerState};
use crate::pool::{PoolError, PoolManager};
use crate::store::{SharedStore, StoreError};

pub use analytics::{Granularity, MetricBucket, ScalingAnalytics};
pub use controller::{CooldownOverride, ScalingController, SkipReason, TargetDecision};
pub use cost::{CostAdvice, CostOptimizer, Recommendation};
pub use predictor::{Anomaly, DemandPredictor, PredictorError};
pub use prewarmer::PreWarmer;

const METRICS_INTERVAL_SECS: u64 = 30;
const COORDINATOR_INTERVAL_SECS: u64 = 60;
const PREWARM_RECYCLE_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum AutoScalerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl Classify for AutoScalerError {
    fn kind(&self) -> ErrorKind {
        match self {
            AutoScalerError::Store(e) => e.kind(),
            AutoScalerError::Pool(e) => e.kind(),
        }
    }
}

/// Ties the Demand Predictor, Scaling Controller, Pre-warmer, Cost
/// Optimizer and Scaling Analytics together behind the per-minute
/// coordination loop from `spec.md` §4.5.
pub struct AutoScaler {
    store: Arc<dyn SharedStore>,
    pool_manager: Arc<PoolManager>,
    prewarmer: Arc<PreWarmer>,
    predictor: DemandPredictor,
    cost: CostOptimizer,
    scaling_settings: ScalingSettings,
    prewarm_settings: PrewarmSettings,
}

impl AutoScaler {
    pub fn new(
        store: Arc<dyn SharedStore>,
        pool_manager: Arc<PoolManager>,
        prewarmer: Arc<PreWarmer>,
        scaling_settings: ScalingSettings,
        prewarm_settings: PrewarmSettings,
        budget_settings: BudgetSettings,
    ) -> Self {
        Self {
            store,
            pool_manager,
            prewarmer,
            predictor: DemandPredictor::new(),
            cost: CostOptimizer::new(budget_settings),
            scaling_settings,
            prewarm_settings,
        }
    }

    /// Samples every pool's current demand, feeds the predictor, and
    /// persists the observation for analytics/MAPE. `spec.md` §4.5: "one
    /// per minute per repository" but collected every 30s per the Scaling
    /// Analytics cadence.
    #[instrument(skip(self))]
    pub async fn collect_metrics(&self) -> Result<(), AutoScalerError> {
        let pools = self.store.list_pools().await?;
        for pool in pools {
            let runners = self.store.list_runners_by_pool(&pool.repository).await?;
            let busy = runners.iter().filter(|r| r.state == RunnerState::Busy).count();
            let utilization = busy as f64 / (pool.current_size.max(1) as f64);

            let pending = self
                .store
                .list_jobs(&crate::store::JobFilter {
                    state: Some(crate::model::JobState::Pending),
                    repository: Some(pool.repository.clone()),
                })
                .await?
                .len();

            let sample = MetricSample {
                timestamp: chrono::Utc::now(),
                pool: pool.repository.clone(),
                queued_jobs: pending as u32,
                running_jobs: busy as u32,
                utilization,
                avg_job_duration_secs: 0.0,
            };

            if let Some(anomaly) = self.predictor.observe(&sample) {
                warn!(
                    pool = %anomaly.pool,
                    value = anomaly.value,
                    mean = anomaly.mean,
                    stddev = anomaly.stddev,
                    "demand anomaly detected"
                );
            }
            self.store.record_metric_sample(sample).await?;
        }
        Ok(())
    }

    /// One coordinator pass (`spec.md` §4.5 "Orchestration"): predict,
    /// compute target, apply policy, execute via `PoolManager::scale`.
    /// Predictor failures fall back to the last known prediction or no
    /// change, never blocking other pools.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<(), AutoScalerError> {
        let pools = self.store.list_pools().await?;
        let all_runners = self.store.list_runners().await?;
        let daily_spend = self.cost.projected_daily_spend(&all_runners);
        let budget_critical = self.cost.is_budget_critical(daily_spend);
        if budget_critical {
            warn!(daily_spend, "budget critical: scale-up refused fleet-wide");
        }

        for pool in &pools {
            let runners = self.store.list_runners_by_pool(&pool.repository).await?;
            let busy = runners.iter().filter(|r| r.state == RunnerState::Busy).count();
            let utilization = busy as f64 / (pool.current_size.max(1) as f64);

            let prediction = match self.predictor.predict(&pool.repository) {
                Ok(predictions) => {
                    let mut short = None;
                    for mut prediction in predictions {
                        let mape = ScalingAnalytics::rolling_mape(
                            self.store.as_ref(),
                            &pool.repository,
                            prediction.horizon,
                        )
                        .await
                        .unwrap_or(None);
                        prediction.confidence =
                            ScalingAnalytics::confidence_from_mape(mape, prediction.confidence);
                        self.store.append_prediction(prediction.clone()).await?;
                        if prediction.horizon == Horizon::Short {
                            short = Some(prediction);
                        }
                    }
                    short
                }
                Err(_) => {
                    // Fallback per `spec.md` §4.5: last known prediction, or none.
                    self.store
                        .recent_predictions(&pool.repository, Horizon::Short, 1)
                        .await?
                        .into_iter()
                        .next()
                }
            };

            let pending = self
                .store
                .list_jobs(&crate::store::JobFilter {
                    state: Some(crate::model::JobState::Pending),
                    repository: Some(pool.repository.clone()),
                })
                .await?
                .len();
            let cooldown_override = if pending as u32 > pool.current_size * 2 {
                CooldownOverride::QueuePressure
            } else {
                CooldownOverride::None
            };

            let decision = ScalingController::compute_target(
                pool,
                utilization,
                prediction.as_ref(),
                &self.scaling_settings,
                cooldown_override,
                budget_critical,
            );

            if let Some(reason) = decision.skipped {
                if reason == SkipReason::BudgetCritical {
                    warn!(repository = %pool.repository, "scale-up skipped: budget critical");
                }
                continue;
            }
            if decision.delta == 0 {
                continue;
            }

            if let Err(e) = self.pool_manager.scale(&pool.repository, decision.delta).await {
                warn!(repository = %pool.repository, error = %e, "coordinator-driven scale failed");
            }
        }
        Ok(())
    }

    /// Tops up every configured pre-warm template to the size the latest
    /// short-term predictions justify, defaulting to `min_pool` for
    /// templates with no prediction history yet.
    #[instrument(skip(self))]
    pub async fn run_prewarm_cycle(&self) -> Result<(), AutoScalerError> {
        let pools = self.store.list_pools().await?;
        let predicted_short_term: f64 = pools
            .iter()
            .filter_map(|p| self.predictor.predict(&p.repository).ok())
            .filter_map(|preds| preds.into_iter().next())
            .map(|p| p.expected_jobs)
            .sum();

        let target = prewarmer::target_pool_size(predicted_short_term, &self.prewarm_settings);
        for template in &self.prewarm_settings.templates {
            if let Err(e) = self.prewarmer.fill(template, target).await {
                warn!(error = %e, %template, "pre-warm fill failed");
            }
        }
        if let Err(e) = self.prewarmer.recycle().await {
            warn!(error = %e, "pre-warm recycle failed");
        }
        Ok(())
    }
}

pub async fn run_metrics_loop(autoscaler: Arc<AutoScaler>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(StdDuration::from_secs(METRICS_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {
                if let Err(e) = autoscaler.collect_metrics().await {
                    warn!(error = %e, "metrics collection pass failed");
                }
            }
        }
    }
}

pub async fn run_coordinator_loop(autoscaler: Arc<AutoScaler>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(StdDuration::from_secs(COORDINATOR_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {
                if let Err(e) = autoscaler.run_cycle().await {
                    warn!(error = %e, "autoscaler coordinator pass failed");
                }
            }
        }
    }
}

pub async fn run_prewarm_loop(autoscaler: Arc<AutoScaler>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(StdDuration::from_secs(PREWARM_RECYCLE_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {
                if let Err(e) = autoscaler.run_prewarm_cycle().await {
                    warn!(error = %e, "pre-warm cycle failed");
                }
            }
        }
    }
}
