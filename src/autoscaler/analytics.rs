//! Scaling Analytics (`spec.md` §4.5): bucket aggregation for the metrics
//! feed and rolling prediction accuracy (MAPE), computed from real
//! past-prediction-vs-realized comparisons per the resolved Open Question in
//! this crate's design notes (never a simulated placeholder).

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::model::{Horizon, MetricSample, Prediction};
use crate::store::{SharedStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    fn bucket_width(self) -> Duration {
        match self {
            Granularity::Minute => Duration::minutes(1),
            Granularity::Hour => Duration::hours(1),
            Granularity::Day => Duration::days(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricBucket {
    pub bucket_start: DateTime<Utc>,
    pub avg_queued_jobs: f64,
    pub avg_running_jobs: f64,
    pub avg_utilization: f64,
    pub sample_count: u32,
}

/// Buckets a flat sample stream to the requested granularity, oldest first.
/// Pure and store-independent so it can be unit tested without fixtures.
pub fn aggregate(samples: &[MetricSample], granularity: Granularity) -> Vec<MetricBucket> {
    if samples.is_empty() {
        return Vec::new();
    }
    let width = granularity.bucket_width();
    let mut sorted: Vec<&MetricSample> = samples.iter().collect();
    sorted.sort_by_key(|s| s.timestamp);

    let mut buckets: Vec<MetricBucket> = Vec::new();
    for sample in sorted {
        let bucket_start = floor_to(sample.timestamp, width);
        match buckets.last_mut() {
            Some(last) if last.bucket_start == bucket_start => {
                let n = last.sample_count as f64;
                last.avg_queued_jobs = (last.avg_queued_jobs * n + sample.queued_jobs as f64) / (n + 1.0);
                last.avg_running_jobs = (last.avg_running_jobs * n + sample.running_jobs as f64) / (n + 1.0);
                last.avg_utilization = (last.avg_utilization * n + sample.utilization) / (n + 1.0);
                last.sample_count += 1;
            }
            _ => buckets.push(MetricBucket {
                bucket_start,
                avg_queued_jobs: sample.queued_jobs as f64,
                avg_running_jobs: sample.running_jobs as f64,
                avg_utilization: sample.utilization,
                sample_count: 1,
            }),
        }
    }
    buckets
}

fn floor_to(t: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let width_secs = width.num_seconds().max(1);
    let epoch_secs = t.timestamp();
    let floored = epoch_secs - epoch_secs.rem_euclid(width_secs);
    DateTime::from_timestamp(floored, 0).unwrap_or(t)
}

const RETENTION_DAYS: i64 = 30;
const MAPE_SAMPLE_LIMIT: usize = 50;
const REALIZATION_TOLERANCE_SECS: i64 = 90;

pub struct ScalingAnalytics;

impl ScalingAnalytics {
    /// Retention cutoff a caller should use when pruning raw samples
    /// (`spec.md` §4.5: "retains 30 days").
    pub fn retention_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(RETENTION_DAYS)
    }

    /// Rolling MAPE for `pool`/`horizon`: compares each past `Prediction`
    /// whose target time has already elapsed against the metric sample
    /// closest to that target time, over the most recent
    /// `MAPE_SAMPLE_LIMIT` predictions with a realized match.
    pub async fn rolling_mape(
        store: &dyn SharedStore,
        pool: &str,
        horizon: Horizon,
    ) -> Result<Option<f64>, StoreError> {
        let predictions = store
            .recent_predictions(pool, horizon, MAPE_SAMPLE_LIMIT)
            .await?;
        if predictions.is_empty() {
            return Ok(None);
        }

        let samples = store.recent_metric_samples(pool, 2000).await?;
        let now = Utc::now();

        let mut errors = Vec::new();
        for prediction in &predictions {
            let target_time = prediction.issued_at + Duration::minutes(prediction.horizon.minutes());
            if target_time > now {
                continue;
            }
            if let Some(realized) = closest_sample(&samples, target_time) {
                if realized.queued_jobs > 0 {
                    let actual = realized.queued_jobs as f64;
                    let error = (actual - prediction.expected_jobs).abs() / actual;
                    errors.push(error);
                }
            }
        }

        if errors.is_empty() {
            return Ok(None);
        }
        Ok(Some(errors.iter().sum::<f64>() / errors.len() as f64))
    }

    /// Translates a rolling MAPE into a `[0,1]` confidence multiplier; no
    /// history yet falls back to the predictor's own fit-based confidence.
    pub fn confidence_from_mape(mape: Option<f64>, fallback: f64) -> f64 {
        match mape {
            Some(m) => (1.0 - m).clamp(0.05, 0.99),
            None => fallback,
        }
    }
}

fn closest_sample(samples: &[MetricSample], target: DateTime<Utc>) -> Option<&MetricSample> {
    samples
        .iter()
        .filter(|s| (s.timestamp - target).num_seconds().abs() <= REALIZATION_TOLERANCE_SECS)
        .min_by_key(|s| (s.timestamp - target).num_seconds().abs())
}
