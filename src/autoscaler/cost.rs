//! Cost Optimizer (`spec.md` §4.5): per-runner hourly cost tracking,
//! right-sizing/idle-termination/spot-conversion recommendations, and the
//! budget gate the Scaling Controller checks before allowing scale-up.

use chrono::Utc;

use crate::config::BudgetSettings;
use crate::model::{Runner, RunnerLifecycle, RunnerState, RunnerType};

/// Hourly on-demand rate by type; spot/pre-emptible runs at a 60% discount.
fn hourly_rate(runner_type: RunnerType, lifecycle: RunnerLifecycle) -> f64 {
    let on_demand = match runner_type {
        RunnerType::Small => 0.05,
        RunnerType::Medium => 0.10,
        RunnerType::Large => 0.20,
    };
    match lifecycle {
        RunnerLifecycle::Spot => on_demand * 0.4,
        RunnerLifecycle::OnDemand | RunnerLifecycle::PreWarmed => on_demand,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    ConvertToSpot,
    RightSize,
    TerminateIdle,
}

#[derive(Debug, Clone)]
pub struct CostAdvice {
    pub runner_id: String,
    pub recommendation: Recommendation,
}

/// Per-runner utilization sample the optimizer needs alongside the runner
/// record itself; the pool manager/monitor loop is the natural source.
#[derive(Debug, Clone, Copy)]
pub struct RunnerUtilization {
    pub cpu_fraction: f64,
}

pub struct CostOptimizer {
    budget: BudgetSettings,
}

impl CostOptimizer {
    pub fn new(budget: BudgetSettings) -> Self {
        Self { budget }
    }

    /// Sum of `hourly_rate * 24` for every non-terminated runner, i.e. the
    /// projected cost if the current fleet ran unchanged for a day.
    pub fn projected_daily_spend(&self, runners: &[Runner]) -> f64 {
        runners
            .iter()
            .filter(|r| r.state != RunnerState::Terminated)
            .map(|r| hourly_rate(r.runner_type, r.lifecycle) * 24.0)
            .sum()
    }

    pub fn projected_monthly_spend(&self, runners: &[Runner]) -> f64 {
        self.projected_daily_spend(runners) * 30.0
    }

    /// `spec.md` §4.5 budget enforcement: `dailySpend / dailyBudget >= 0.95`.
    pub fn is_budget_critical(&self, daily_spend: f64) -> bool {
        self.budget.daily > 0.0 && daily_spend / self.budget.daily >= self.budget.critical_threshold
    }

    pub fn is_budget_warning(&self, daily_spend: f64) -> bool {
        self.budget.daily > 0.0 && daily_spend / self.budget.daily >= self.budget.warning_threshold
    }

    /// Per-runner advice from `spec.md` §4.5: convert long-lived on-demand
    /// runners to spot, right-size chronically under-loaded runners,
    /// terminate runners idle well past the pool's timeout.
    pub fn recommend(
        &self,
        runners: &[Runner],
        utilization: impl Fn(&Runner) -> Option<RunnerUtilization>,
        idle_timeout_secs: u64,
    ) -> Vec<CostAdvice> {
        let now = Utc::now();
        let mut advice = Vec::new();

        for runner in runners {
            if runner.state == RunnerState::Terminated {
                continue;
            }

            if runner.lifecycle == RunnerLifecycle::OnDemand && runner.age_secs(now) >= 2 * 3600 {
                advice.push(CostAdvice {
                    runner_id: runner.runner_id.clone(),
                    recommendation: Recommendation::ConvertToSpot,
                });
            }

            if let Some(u) = utilization(runner) {
                if u.cpu_fraction < 0.20 && runner.runner_type != RunnerType::Small {
                    advice.push(CostAdvice {
                        runner_id: runner.runner_id.clone(),
                        recommendation: Recommendation::RightSize,
                    });
                }
                if runner.is_idle_longer_than(idle_timeout_secs, now) && u.cpu_fraction < 0.05 {
                    advice.push(CostAdvice {
                        runner_id: runner.runner_id.clone(),
                        recommendation: Recommendation::TerminateIdle,
                    });
                }
            }
        }

        advice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn runner(lifecycle: RunnerLifecycle, age_hours: i64, state: RunnerState) -> Runner {
        Runner {
            runner_id: uuid::Uuid::new_v4().to_string(),
            pool: "acme/svc".into(),
            container_id: "c1".into(),
            labels: BTreeSet::new(),
            state,
            runner_type: RunnerType::Medium,
            region: "local".into(),
            lifecycle,
            created_at: Utc::now() - chrono::Duration::hours(age_hours),
            last_job_at: None,
            jobs_processed: 0,
            persistent: false,
            consecutive_health_failures: 0,
        }
    }

    #[test]
    fn budget_critical_triggers_at_95_percent() {
        let optimizer = CostOptimizer::new(BudgetSettings {
            daily: 100.0,
            ..BudgetSettings::default()
        });
        assert!(!optimizer.is_budget_critical(94.0));
        assert!(optimizer.is_budget_critical(95.0));
    }

    #[test]
    fn long_lived_on_demand_runner_recommends_spot_conversion() {
        let optimizer = CostOptimizer::new(BudgetSettings::default());
        let runners = vec![runner(RunnerLifecycle::OnDemand, 3, RunnerState::Idle)];
        let advice = optimizer.recommend(&runners, |_| None, 300);
        assert!(advice
            .iter()
            .any(|a| a.recommendation == Recommendation::ConvertToSpot));
    }

    #[test]
    fn terminated_runners_are_excluded_from_spend_and_advice() {
        let optimizer = CostOptimizer::new(BudgetSettings::default());
        let runners = vec![runner(RunnerLifecycle::OnDemand, 3, RunnerState::Terminated)];
        assert_eq!(optimizer.projected_daily_spend(&runners), 0.0);
        assert!(optimizer.recommend(&runners, |_| None, 300).is_empty());
    }

    #[test]
    fn idle_and_underutilized_runner_recommends_termination() {
        let optimizer = CostOptimizer::new(BudgetSettings::default());
        let mut r = runner(RunnerLifecycle::Spot, 1, RunnerState::Idle);
        r.last_job_at = Some(Utc::now() - chrono::Duration::hours(1));
        let runners = vec![r];
        let advice = optimizer.recommend(&runners, |_| Some(RunnerUtilization { cpu_fraction: 0.01 }), 300);
        assert!(advice
            .iter()
            .any(|a| a.recommendation == Recommendation::TerminateIdle));
    }
}
