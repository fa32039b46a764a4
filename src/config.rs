//! Environment-sourced configuration (`spec.md` §6): a `config::Config`
//! builder layering a file over environment overrides, deserialized into a
//! typed struct.

use serde::Deserialize;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config")]
    Load(#[from] config::ConfigError),
    #[error("invalid scaling policy: {0}")]
    InvalidScalingPolicy(String),
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScalingPolicy {
    Aggressive,
    Balanced,
    Conservative,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        ScalingPolicy::Balanced
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GitHubSettings {
    pub org: String,
    pub token: String,
    pub webhook_secret: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PoolDefaults {
    #[serde(default = "default_min_runners")]
    pub min_runners: u32,
    #[serde(default = "default_max_runners")]
    pub max_runners: u32,
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_runner_age_secs")]
    pub max_runner_age_secs: u64,
}

fn default_min_runners() -> u32 {
    0
}
fn default_max_runners() -> u32 {
    10
}
fn default_scale_up_threshold() -> f64 {
    0.8
}
fn default_scale_down_threshold() -> f64 {
    0.2
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_max_runner_age_secs() -> u64 {
    3600
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            min_runners: default_min_runners(),
            max_runners: default_max_runners(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: default_scale_down_threshold(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_runner_age_secs: default_max_runner_age_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ScalingSettings {
    #[serde(default)]
    pub policy: ScalingPolicy,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_scale_up")]
    pub max_scale_up: u32,
    #[serde(default = "default_max_scale_down")]
    pub max_scale_down: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_target_utilization")]
    pub target_utilization: f64,
    #[serde(default = "default_global_inflight_scale")]
    pub global_inflight_scale: usize,
}

fn default_cooldown_secs() -> u64 {
    300
}
fn default_max_scale_up() -> u32 {
    10
}
fn default_max_scale_down() -> u32 {
    5
}
fn default_confidence_threshold() -> f64 {
    0.8
}
fn default_target_utilization() -> f64 {
    0.6
}
fn default_global_inflight_scale() -> usize {
    8
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            policy: ScalingPolicy::default(),
            cooldown_secs: default_cooldown_secs(),
            max_scale_up: default_max_scale_up(),
            max_scale_down: default_max_scale_down(),
            confidence_threshold: default_confidence_threshold(),
            target_utilization: default_target_utilization(),
            global_inflight_scale: default_global_inflight_scale(),
        }
    }
}

impl ScalingSettings {
    /// Policy presets adjust the base caps/cooldown (`spec.md` §4.5).
    pub fn effective_max_scale_up(&self) -> u32 {
        match self.policy {
            ScalingPolicy::Aggressive => self.max_scale_up * 2,
            ScalingPolicy::Balanced => self.max_scale_up,
            ScalingPolicy::Conservative => (self.max_scale_up / 2).max(1),
        }
    }

    pub fn effective_cooldown_secs(&self) -> u64 {
        match self.policy {
            ScalingPolicy::Aggressive => self.cooldown_secs / 2,
            ScalingPolicy::Balanced => self.cooldown_secs,
            ScalingPolicy::Conservative => self.cooldown_secs * 2,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PrewarmSettings {
    #[serde(default = "default_prewarm_min_pool")]
    pub min_pool: u32,
    #[serde(default = "default_prewarm_max_pool")]
    pub max_pool: u32,
    #[serde(default = "default_prewarm_templates")]
    pub templates: Vec<String>,
    #[serde(default = "default_prewarm_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_max_concurrent_warmups")]
    pub max_concurrent_warmups: usize,
}

fn default_prewarm_min_pool() -> u32 {
    2
}
fn default_prewarm_max_pool() -> u32 {
    20
}
fn default_prewarm_templates() -> Vec<String> {
    vec![
        "ubuntu-latest".to_string(),
        "ubuntu-22.04".to_string(),
        "node".to_string(),
    ]
}
fn default_prewarm_max_age_secs() -> u64 {
    3600
}
fn default_max_concurrent_warmups() -> usize {
    5
}

impl Default for PrewarmSettings {
    fn default() -> Self {
        Self {
            min_pool: default_prewarm_min_pool(),
            max_pool: default_prewarm_max_pool(),
            templates: default_prewarm_templates(),
            max_age_secs: default_prewarm_max_age_secs(),
            max_concurrent_warmups: default_max_concurrent_warmups(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BudgetSettings {
    #[serde(default = "default_budget_daily")]
    pub daily: f64,
    #[serde(default = "default_budget_monthly")]
    pub monthly: f64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
}

fn default_budget_daily() -> f64 {
    500.0
}
fn default_budget_monthly() -> f64 {
    12000.0
}
fn default_warning_threshold() -> f64 {
    0.8
}
fn default_critical_threshold() -> f64 {
    0.95
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            daily: default_budget_daily(),
            monthly: default_budget_monthly(),
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct HaSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_leader_ttl_secs")]
    pub leader_ttl_secs: u64,
    #[serde(default = "default_leader_renew_interval_secs")]
    pub leader_renew_interval_secs: u64,
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_leader_ttl_secs() -> u64 {
    15
}
fn default_leader_renew_interval_secs() -> u64 {
    5
}

impl Default for HaSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: default_node_id(),
            leader_ttl_secs: default_leader_ttl_secs(),
            leader_renew_interval_secs: default_leader_renew_interval_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub db_url: Option<String>,
    #[serde(default = "default_cache_url")]
    pub cache_url: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_cache_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            db_url: None,
            cache_url: default_cache_url(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    pub github: GitHubSettings,
    #[serde(default)]
    pub pool_defaults: PoolDefaults,
    #[serde(default)]
    pub scaling: ScalingSettings,
    #[serde(default)]
    pub prewarm: PrewarmSettings,
    #[serde(default)]
    pub budget: BudgetSettings,
    #[serde(default)]
    pub ha: HaSettings,
    #[serde(default)]
    pub network: NetworkSettings,
}

impl Settings {
    /// Loads `config.{toml,yaml,json}` from the working directory, overridden
    /// by `RUNNERHUB_*` environment variables via
    /// `config::Config::builder().add_source(config::File::with_name(...))`.
    pub fn load() -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("RUNNERHUB").separator("__"))
            .build()?;

        raw.try_deserialize().map_err(ConfigError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_presets_adjust_caps() {
        let mut s = ScalingSettings::default();
        s.policy = ScalingPolicy::Aggressive;
        assert_eq!(s.effective_max_scale_up(), 20);
        assert_eq!(s.effective_cooldown_secs(), 150);

        s.policy = ScalingPolicy::Conservative;
        assert_eq!(s.effective_max_scale_up(), 5);
        assert_eq!(s.effective_cooldown_secs(), 600);
    }
}
