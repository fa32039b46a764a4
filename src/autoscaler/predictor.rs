//! Demand Predictor (`spec.md` §4.5): per-pool Holt-Winters state plus a
//! moving-average fallback in place of full ARIMA(2,1,2), blended into a
//! single hybrid forecast for each of the three horizons.

use std::collections::VecDeque;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::model::{Horizon, MetricSample, Prediction};

const SEASONAL_PERIOD_MINUTES: usize = 1440;
const ALPHA: f64 = 0.3;
const BETA: f64 = 0.1;
const GAMMA: f64 = 0.1;
const ARIMA_WINDOW: usize = 200;
const ANOMALY_WINDOW: usize = 100;
const ANOMALY_SIGMA: f64 = 3.0;
const HYBRID_EXP_SMOOTH_WEIGHT: f64 = 0.4;
const HYBRID_MOVING_AVG_WEIGHT: f64 = 0.4;
const HYBRID_PATTERN_WEIGHT: f64 = 0.2;

#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("not enough samples for pool {0} to produce a prediction")]
    InsufficientHistory(String),
}

impl Classify for PredictorError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// An observation falling more than `ANOMALY_SIGMA` standard deviations from
/// the trailing mean (`spec.md` §4.5 anomaly detection).
#[derive(Debug, Clone)]
pub struct Anomaly {
    pub pool: String,
    pub value: f64,
    pub mean: f64,
    pub stddev: f64,
}

struct HoltWinters {
    level: f64,
    trend: f64,
    seasonal: Vec<f64>,
    tick: u64,
    initialized: bool,
}

impl HoltWinters {
    fn new() -> Self {
        Self {
            level: 0.0,
            trend: 0.0,
            seasonal: vec![0.0; SEASONAL_PERIOD_MINUTES],
            tick: 0,
            initialized: false,
        }
    }

    fn observe(&mut self, value: f64) {
        let slot = (self.tick as usize) % SEASONAL_PERIOD_MINUTES;
        if !self.initialized {
            self.level = value;
            self.trend = 0.0;
            self.initialized = true;
        } else {
            let seasonal = self.seasonal[slot];
            let prev_level = self.level;
            self.level = ALPHA * (value - seasonal) + (1.0 - ALPHA) * (prev_level + self.trend);
            self.trend = BETA * (self.level - prev_level) + (1.0 - BETA) * self.trend;
            self.seasonal[slot] = GAMMA * (value - self.level) + (1.0 - GAMMA) * seasonal;
        }
        self.tick += 1;
    }

    fn forecast(&self, steps_ahead: i64) -> f64 {
        let slot = ((self.tick as i64 + steps_ahead).rem_euclid(SEASONAL_PERIOD_MINUTES as i64))
            as usize;
        (self.level + self.trend * steps_ahead as f64 + self.seasonal[slot]).max(0.0)
    }
}

/// Per-pool rolling state the predictor needs between cycles.
struct PoolModel {
    hw: HoltWinters,
    recent: VecDeque<f64>,
}

impl PoolModel {
    fn new() -> Self {
        Self {
            hw: HoltWinters::new(),
            recent: VecDeque::with_capacity(ARIMA_WINDOW),
        }
    }

    fn push(&mut self, value: f64) {
        self.hw.observe(value);
        self.recent.push_back(value);
        if self.recent.len() > ARIMA_WINDOW {
            self.recent.pop_front();
        }
    }

    fn mean_and_stddev(&self, window: usize) -> (f64, f64) {
        let take = window.min(self.recent.len());
        if take == 0 {
            return (0.0, 0.0);
        }
        let values: Vec<f64> = self.recent.iter().rev().take(take).copied().collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        (mean, variance.sqrt())
    }

    /// Moving-average-with-trend stand-in for ARIMA(2,1,2) (`spec.md` §4.5:
    /// "simplified moving-average fallback is acceptable").
    fn moving_average_forecast(&self, steps_ahead: i64) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let (mean, _) = self.mean_and_stddev(ARIMA_WINDOW);
        let half = (self.recent.len() / 2).max(1);
        let (recent_mean, _) = self.mean_and_stddev(half);
        let (older_mean, _) = {
            let older: Vec<f64> = self
                .recent
                .iter()
                .rev()
                .skip(half)
                .take(half)
                .copied()
                .collect();
            if older.is_empty() {
                (recent_mean, 0.0)
            } else {
                let m = older.iter().sum::<f64>() / older.len() as f64;
                (m, 0.0)
            }
        };
        let slope_per_sample = (recent_mean - older_mean) / half as f64;
        (mean + slope_per_sample * steps_ahead as f64).max(0.0)
    }
}

/// Produces short/medium/long-horizon forecasts and anomaly events from a
/// per-minute metric stream.
pub struct DemandPredictor {
    models: DashMap<String, PoolModel>,
}

impl Default for DemandPredictor {
    fn default() -> Self {
        Self::new()
    }
}

impl DemandPredictor {
    pub fn new() -> Self {
        Self {
            models: DashMap::new(),
        }
    }

    /// Folds one minute's observation into the pool's rolling state and
    /// returns an anomaly if this sample is a >3σ outlier against the
    /// trailing 100 samples.
    pub fn observe(&self, sample: &MetricSample) -> Option<Anomaly> {
        let mut model = self.models.entry(sample.pool.clone()).or_insert_with(PoolModel::new);
        let (mean, stddev) = model.mean_and_stddev(ANOMALY_WINDOW);
        let value = sample.queued_jobs as f64;
        let anomaly = if model.recent.len() >= ANOMALY_WINDOW.min(10) {
            let is_outlier = if stddev > 0.0 {
                (value - mean).abs() > ANOMALY_SIGMA * stddev
            } else {
                value != mean
            };
            is_outlier.then_some(Anomaly {
                pool: sample.pool.clone(),
                value,
                mean,
                stddev,
            })
        } else {
            None
        };
        model.push(sample.queued_jobs as f64);
        anomaly
    }

    /// Produces the short/medium/long predictions for `pool` from its
    /// current rolling state. Confidence here reflects fit stability only;
    /// the coordinator refines it with `ScalingAnalytics`'s rolling MAPE.
    pub fn predict(&self, pool: &str) -> Result<Vec<Prediction>, PredictorError> {
        let model = self
            .models
            .get(pool)
            .ok_or_else(|| PredictorError::InsufficientHistory(pool.to_string()))?;

        if model.recent.len() < 3 {
            return Err(PredictorError::InsufficientHistory(pool.to_string()));
        }

        let (_, sigma) = model.mean_and_stddev(ANOMALY_WINDOW);
        let (pattern_mean, _) = model.mean_and_stddev(model.recent.len());
        let issued_at = Utc::now();

        let horizons = [Horizon::Short, Horizon::Medium, Horizon::Long];
        let predictions = horizons
            .into_iter()
            .map(|horizon| {
                let steps = horizon.minutes();
                let exp_smooth = model.hw.forecast(steps);
                let moving_avg = model.moving_average_forecast(steps);
                let expected_jobs = HYBRID_EXP_SMOOTH_WEIGHT * exp_smooth
                    + HYBRID_MOVING_AVG_WEIGHT * moving_avg
                    + HYBRID_PATTERN_WEIGHT * pattern_mean;

                // Fit-stability confidence: tighter relative spread around
                // the blended estimate means higher confidence, refined
                // later against realized accuracy by `ScalingAnalytics`.
                let relative_spread = if expected_jobs > 0.0 {
                    sigma / expected_jobs
                } else {
                    0.0
                };
                let confidence = (1.0 - relative_spread).clamp(0.05, 0.95);

                Prediction {
                    issued_at,
                    pool: pool.to_string(),
                    horizon,
                    expected_jobs,
                    lower_bound: (expected_jobs - 2.0 * sigma).max(0.0),
                    upper_bound: expected_jobs + 2.0 * sigma,
                    confidence,
                }
            })
            .collect();

        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pool: &str, queued: u32) -> MetricSample {
        MetricSample {
            timestamp: Utc::now(),
            pool: pool.to_string(),
            queued_jobs: queued,
            running_jobs: 0,
            utilization: 0.0,
            avg_job_duration_secs: 0.0,
        }
    }

    #[test]
    fn predict_requires_minimum_history() {
        let predictor = DemandPredictor::new();
        assert!(predictor.predict("acme/svc").is_err());
        predictor.observe(&sample("acme/svc", 5));
        predictor.observe(&sample("acme/svc", 5));
        assert!(predictor.predict("acme/svc").is_err());
    }

    #[test]
    fn predict_produces_all_three_horizons() {
        let predictor = DemandPredictor::new();
        for i in 0..20 {
            predictor.observe(&sample("acme/svc", 5 + (i % 3)));
        }
        let predictions = predictor.predict("acme/svc").unwrap();
        assert_eq!(predictions.len(), 3);
        assert_eq!(predictions[0].horizon, Horizon::Short);
        assert_eq!(predictions[1].horizon, Horizon::Medium);
        assert_eq!(predictions[2].horizon, Horizon::Long);
        for p in &predictions {
            assert!(p.expected_jobs >= 0.0);
            assert!(p.lower_bound <= p.upper_bound);
            assert!(p.confidence > 0.0 && p.confidence <= 1.0);
        }
    }

    #[test]
    fn steady_stream_trends_toward_observed_level() {
        let predictor = DemandPredictor::new();
        for _ in 0..50 {
            predictor.observe(&sample("acme/svc", 10));
        }
        let predictions = predictor.predict("acme/svc").unwrap();
        let short = &predictions[0];
        assert!((short.expected_jobs - 10.0).abs() < 3.0);
    }

    #[test]
    fn sharp_spike_after_steady_baseline_is_flagged_anomalous() {
        let predictor = DemandPredictor::new();
        for _ in 0..30 {
            predictor.observe(&sample("acme/svc", 5));
        }
        let anomaly = predictor.observe(&sample("acme/svc", 500));
        assert!(anomaly.is_some());
    }
}
