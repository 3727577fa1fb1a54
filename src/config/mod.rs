mod loader;
mod watcher;

pub use loader::{get_config_path, load_config, save_config};
pub use watcher::watch_config;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    Async,
    #[default]
    Blocking,
    Strict,
}

fn default_validation_level() -> ValidationLevel {
    ValidationLevel::Blocking
}
fn default_cache_ttl_ms() -> u64 {
    300_000
}
fn default_cache_max_entries() -> u64 {
    10_000
}
fn default_strict_block_threshold() -> f64 {
    0.9
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub default_level: ValidationLevel,
    pub auto_correction_enabled: bool,
    pub cache_ttl_ms: u64,
    pub cache_max_entries: u64,
    pub strict_block_threshold: f64,
    pub verdict_hard_cap_ms: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            default_level: default_validation_level(),
            auto_correction_enabled: true,
            cache_ttl_ms: default_cache_ttl_ms(),
            cache_max_entries: default_cache_max_entries(),
            strict_block_threshold: default_strict_block_threshold(),
            verdict_hard_cap_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MlConfig {
    pub enabled: bool,
}

fn default_hybrid_ratio() -> f64 {
    0.7
}
fn default_learning_rate() -> f64 {
    0.1
}
fn default_q_bounds() -> (f64, f64) {
    (-10.0, 10.0)
}
fn default_lambda_table() -> HashMap<String, f64> {
    [
        ("observe", 0.2),
        ("reason", 0.4),
        ("plan", 0.6),
        ("act", 0.7),
        ("reflect", 0.5),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
fn default_retrieval_hard_cap_ms() -> u64 {
    2_000
}
fn default_consolidation_interval_ms() -> u64 {
    3_600_000
}
fn default_promotion_q_threshold() -> f64 {
    5.0
}
fn default_promotion_usage_threshold() -> u32 {
    5
}
fn default_archive_after_ms() -> u64 {
    30 * 24 * 3_600_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub hybrid_ratio: f64,
    pub lambda: HashMap<String, f64>,
    pub learning_rate: f64,
    pub q_bounds: (f64, f64),
    pub retrieval_hard_cap_ms: u64,
    pub consolidation_interval_ms: u64,
    pub promotion_q_threshold: f64,
    pub promotion_usage_threshold: u32,
    pub archive_after_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            hybrid_ratio: default_hybrid_ratio(),
            lambda: default_lambda_table(),
            learning_rate: default_learning_rate(),
            q_bounds: default_q_bounds(),
            retrieval_hard_cap_ms: default_retrieval_hard_cap_ms(),
            consolidation_interval_ms: default_consolidation_interval_ms(),
            promotion_q_threshold: default_promotion_q_threshold(),
            promotion_usage_threshold: default_promotion_usage_threshold(),
            archive_after_ms: default_archive_after_ms(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    150_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub call_default_timeout_ms: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            call_default_timeout_ms: default_tool_timeout_ms(),
        }
    }
}

fn default_startup_timeout_ms() -> u64 {
    10_000
}
fn default_max_restart_attempts() -> u32 {
    3
}
fn default_health_check_interval_ms() -> u64 {
    10_000
}
fn default_health_failure_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalServerConfig {
    pub startup_timeout_ms: u64,
    pub max_restart_attempts: u32,
    pub health_check_interval_ms: u64,
    pub health_failure_threshold: u32,
}

impl Default for ExternalServerConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            max_restart_attempts: default_max_restart_attempts(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_failure_threshold: default_health_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DagConfig {
    pub auto_assign: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub interval_ms: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_consolidation_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub validation: ValidationConfig,
    pub ml: MlConfig,
    pub memory: MemoryConfig,
    pub heartbeat: HeartbeatConfig,
    pub tool: ToolConfig,
    pub external_server: ExternalServerConfig,
    pub dag: DagConfig,
    pub consolidation: ConsolidationConfig,
    #[serde(default = "default_true")]
    pub registry_changed_debounce_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            validation: ValidationConfig::default(),
            ml: MlConfig::default(),
            memory: MemoryConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            tool: ToolConfig::default(),
            external_server: ExternalServerConfig::default(),
            dag: DagConfig::default(),
            consolidation: ConsolidationConfig::default(),
            registry_changed_debounce_enabled: true,
        }
    }
}

impl Config {
    pub fn lambda_for_phase(&self, phase: &str) -> f64 {
        self.memory.lambda.get(phase).copied().unwrap_or(0.5)
    }

    /// Watches `path` for changes, reparsing and broadcasting on the
    /// returned channel; operators can tune `validation.*` and
    /// `memory.lambda` live rather than restarting the process.
    pub fn watch(
        self,
        path: &std::path::Path,
        bus: std::sync::Arc<crate::bus::EventBus>,
    ) -> anyhow::Result<(
        tokio::sync::watch::Receiver<Config>,
        tokio::task::JoinHandle<()>,
    )> {
        watcher::watch_config(path, self, bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.validation.default_level, ValidationLevel::Blocking);
        assert!((cfg.memory.hybrid_ratio - 0.7).abs() < f64::EPSILON);
        assert!((cfg.memory.learning_rate - 0.1).abs() < f64::EPSILON);
        assert_eq!(cfg.memory.q_bounds, (-10.0, 10.0));
        assert_eq!(cfg.heartbeat.interval_ms, 30_000);
        assert_eq!(cfg.heartbeat.timeout_ms, 150_000);
    }

    #[test]
    fn lambda_table_has_all_phases() {
        let cfg = Config::default();
        for phase in ["observe", "reason", "plan", "act", "reflect"] {
            assert!(cfg.lambda_for_phase(phase) > 0.0);
        }
        assert_eq!(cfg.lambda_for_phase("unknown"), 0.5);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = Config::default();
        let serialized = toml::to_string(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&serialized).expect("parse");
        assert_eq!(parsed.validation.default_level, cfg.validation.default_level);
    }
}
