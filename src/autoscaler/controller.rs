//! Scaling Controller (`spec.md` §4.5): folds current utilization, the
//! short-horizon prediction, pool clamps, per-tick caps, cooldown and the
//! cost constraint into a single `target_runners` decision per cycle.

use chrono::Utc;

use crate::config::ScalingSettings;
use crate::model::{Prediction, RunnerPool};

/// `spec.md` §4.5 step 6: queue pressure is allowed to override cooldown,
/// everything else still has to wait it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownOverride {
    None,
    QueuePressure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Cooldown,
    BudgetCritical,
}

#[derive(Debug, Clone)]
pub struct TargetDecision {
    pub delta: i32,
    pub target: u32,
    pub skipped: Option<SkipReason>,
}

/// Computes the per-cycle scale delta for one pool (`spec.md` §4.5 "Scaling
/// Controller"). `budget_critical` is the Cost Optimizer's signal that
/// scale-up must be refused regardless of demand.
pub struct ScalingController;

impl ScalingController {
    pub fn compute_target(
        pool: &RunnerPool,
        utilization: f64,
        short_term_prediction: Option<&Prediction>,
        settings: &ScalingSettings,
        cooldown_override: CooldownOverride,
        budget_critical: bool,
    ) -> TargetDecision {
        let current = pool.current_size;

        // Step 1: utilization-based baseline.
        let mut target =
            (current as f64 * utilization / settings.target_utilization).ceil() as i32;

        // Step 2: prediction overrides the baseline if confident enough.
        if let Some(prediction) = short_term_prediction {
            if prediction.confidence > settings.confidence_threshold {
                let predicted_target = (prediction.expected_jobs / 10.0).ceil() as i32;
                target = target.max(predicted_target);
            }
        }

        // Step 3: pool clamps.
        target = target.clamp(pool.min_runners as i32, pool.max_runners as i32);

        // Step 4: per-tick caps relative to current size.
        let max_up = settings.effective_max_scale_up() as i32;
        let max_down = settings.effective_max_scale_down() as i32;
        let uncapped_delta = target - current as i32;
        let capped_delta = uncapped_delta.clamp(-max_down, max_up);
        target = current as i32 + capped_delta;

        // Step 5: cooldown, unless overridden by queue pressure.
        let in_cooldown = pool.last_scaled_at.is_some_and(|last| {
            (Utc::now() - last).num_seconds() < settings.effective_cooldown_secs() as i64
        });
        if in_cooldown && cooldown_override != CooldownOverride::QueuePressure {
            return TargetDecision {
                delta: 0,
                target: current,
                skipped: Some(SkipReason::Cooldown),
            };
        }

        // Step 6: cost constraint — a budget-critical pool cannot scale up.
        if budget_critical && target > current as i32 {
            return TargetDecision {
                delta: 0,
                target: current,
                skipped: Some(SkipReason::BudgetCritical),
            };
        }

        TargetDecision {
            delta: target - current as i32,
            target: target.max(0) as u32,
            skipped: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScalingPolicy;
    use crate::model::Horizon;

    fn pool() -> RunnerPool {
        let mut p = RunnerPool::default_for("acme/svc");
        p.current_size = 4;
        p.max_runners = 20;
        p
    }

    fn prediction(confidence: f64, expected_jobs: f64) -> Prediction {
        Prediction {
            issued_at: Utc::now(),
            pool: "acme/svc".into(),
            horizon: Horizon::Short,
            expected_jobs,
            lower_bound: 0.0,
            upper_bound: expected_jobs * 2.0,
            confidence,
        }
    }

    #[test]
    fn utilization_drives_target_without_prediction() {
        let settings = ScalingSettings::default();
        let decision = ScalingController::compute_target(
            &pool(),
            0.6,
            None,
            &settings,
            CooldownOverride::None,
            false,
        );
        assert_eq!(decision.target, 4);
        assert_eq!(decision.delta, 0);
    }

    #[test]
    fn confident_prediction_can_raise_target_above_utilization_baseline() {
        let settings = ScalingSettings::default();
        let pred = prediction(0.95, 100.0);
        let decision = ScalingController::compute_target(
            &pool(),
            0.3,
            Some(&pred),
            &settings,
            CooldownOverride::None,
            false,
        );
        assert!(decision.target >= 10);
    }

    #[test]
    fn low_confidence_prediction_is_ignored() {
        let settings = ScalingSettings::default();
        let pred = prediction(0.5, 1000.0);
        let decision = ScalingController::compute_target(
            &pool(),
            0.3,
            Some(&pred),
            &settings,
            CooldownOverride::None,
            false,
        );
        assert!(decision.target < 100);
    }

    #[test]
    fn per_tick_cap_limits_scale_up_burst() {
        let settings = ScalingSettings::default();
        let pred = prediction(0.95, 10_000.0);
        let decision = ScalingController::compute_target(
            &pool(),
            0.9,
            Some(&pred),
            &settings,
            CooldownOverride::None,
            false,
        );
        assert!(decision.delta <= settings.effective_max_scale_up() as i32);
    }

    #[test]
    fn cooldown_blocks_scaling_without_queue_pressure_override() {
        let settings = ScalingSettings::default();
        let mut p = pool();
        p.last_scaled_at = Some(Utc::now());
        let decision = ScalingController::compute_target(
            &p,
            0.95,
            None,
            &settings,
            CooldownOverride::None,
            false,
        );
        assert_eq!(decision.skipped, Some(SkipReason::Cooldown));
    }

    #[test]
    fn queue_pressure_overrides_cooldown() {
        let settings = ScalingSettings::default();
        let mut p = pool();
        p.last_scaled_at = Some(Utc::now());
        let decision = ScalingController::compute_target(
            &p,
            0.95,
            None,
            &settings,
            CooldownOverride::QueuePressure,
            false,
        );
        assert_eq!(decision.skipped, None);
    }

    #[test]
    fn budget_critical_blocks_scale_up_but_allows_scale_down() {
        let settings = ScalingSettings::default();
        let decision = ScalingController::compute_target(
            &pool(),
            0.95,
            None,
            &settings,
            CooldownOverride::None,
            true,
        );
        assert_eq!(decision.skipped, Some(SkipReason::BudgetCritical));

        let decision = ScalingController::compute_target(
            &pool(),
            0.05,
            None,
            &settings,
            CooldownOverride::None,
            true,
        );
        assert_eq!(decision.skipped, None);
        assert!(decision.delta <= 0);
    }

    #[test]
    fn aggressive_policy_doubles_scale_up_cap() {
        let mut settings = ScalingSettings::default();
        settings.policy = ScalingPolicy::Aggressive;
        let mut p = pool();
        p.max_runners = 1000;
        let pred = prediction(0.95, 10_000.0);
        let decision = ScalingController::compute_target(
            &p,
            0.9,
            Some(&pred),
            &settings,
            CooldownOverride::None,
            false,
        );
        assert_eq!(decision.delta, settings.effective_max_scale_up() as i32);
    }
}
