use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::types::{DegradationLevel, OperationClass};

/// Top-level Strata configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub breakers: BreakersConfig,
    #[serde(default)]
    pub degradation: DegradationConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub decision: Option<DecisionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Live execution state expires this long after its last access.
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            state_ttl_secs: default_state_ttl(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

fn default_database_path() -> String { "~/.strata/strata.db".to_string() }
fn default_state_ttl() -> u64 { 3600 }
fn default_reaper_interval() -> u64 { 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_batch")]
    pub batch_size: usize,
    #[serde(default = "default_checkpoint_max_age")]
    pub max_age_ms: u64,
    #[serde(default = "default_checkpoint_sweep")]
    pub sweep_interval_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            batch_size: default_checkpoint_batch(),
            max_age_ms: default_checkpoint_max_age(),
            sweep_interval_ms: default_checkpoint_sweep(),
        }
    }
}

fn default_checkpoint_batch() -> usize { 10 }
fn default_checkpoint_max_age() -> u64 { 5000 }
fn default_checkpoint_sweep() -> u64 { 1000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Hard ceiling on plan iterations of an autonomous run.
    #[serde(default = "default_max_autonomous_steps")]
    pub max_autonomous_steps: u64,
    /// How many prior decisions the decision source gets to see.
    #[serde(default = "default_decision_history")]
    pub decision_history: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout(),
            max_autonomous_steps: default_max_autonomous_steps(),
            decision_history: default_decision_history(),
        }
    }
}

fn default_tool_timeout() -> u64 { 60 }
fn default_max_autonomous_steps() -> u64 { 10 }
fn default_decision_history() -> usize { 3 }

/// Tuning for one circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    /// Sub-second cooldown; takes precedence over `cooldown_secs` when set.
    #[serde(default)]
    pub cooldown_ms: Option<u64>,
}

impl BreakerConfig {
    /// Expensive calls: trip earlier, retry sooner.
    pub fn expensive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: default_success_threshold(),
            cooldown_secs: 30,
            half_open_max_calls: default_half_open_max_calls(),
            cooldown_ms: None,
        }
    }

    pub fn bulk() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_secs: default_cooldown(),
            half_open_max_calls: default_half_open_max_calls(),
            cooldown_ms: None,
        }
    }

    pub fn cooldown(&self) -> Duration {
        match self.cooldown_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.cooldown_secs),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::bulk()
    }
}

fn default_failure_threshold() -> u32 { 5 }
fn default_success_threshold() -> u32 { 2 }
fn default_cooldown() -> u64 { 60 }
fn default_half_open_max_calls() -> u32 { 1 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakersConfig {
    #[serde(default = "BreakerConfig::expensive")]
    pub decision: BreakerConfig,
    #[serde(default = "BreakerConfig::bulk")]
    pub data: BreakerConfig,
    #[serde(default = "BreakerConfig::bulk")]
    pub analysis: BreakerConfig,
    #[serde(default = "BreakerConfig::expensive")]
    pub generation: BreakerConfig,
    #[serde(default = "BreakerConfig::bulk")]
    pub output: BreakerConfig,
}

impl Default for BreakersConfig {
    fn default() -> Self {
        Self {
            decision: BreakerConfig::expensive(),
            data: BreakerConfig::bulk(),
            analysis: BreakerConfig::bulk(),
            generation: BreakerConfig::expensive(),
            output: BreakerConfig::bulk(),
        }
    }
}

impl BreakersConfig {
    pub fn for_class(&self, class: OperationClass) -> &BreakerConfig {
        match class {
            OperationClass::Decision => &self.decision,
            OperationClass::Data => &self.data,
            OperationClass::Analysis => &self.analysis,
            OperationClass::Generation => &self.generation,
            OperationClass::Output => &self.output,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationConfig {
    #[serde(default = "default_window")]
    pub window_secs: u64,
    #[serde(default = "default_reduced_threshold")]
    pub reduced_threshold: f64,
    #[serde(default = "default_minimal_threshold")]
    pub minimal_threshold: f64,
    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold: f64,
    /// Consecutive successes required before trying to move up one level.
    #[serde(default = "default_recovery_successes")]
    pub recovery_successes: u32,
    /// Manual override applied at startup.
    #[serde(default)]
    pub pinned_level: Option<DegradationLevel>,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
            reduced_threshold: default_reduced_threshold(),
            minimal_threshold: default_minimal_threshold(),
            emergency_threshold: default_emergency_threshold(),
            recovery_successes: default_recovery_successes(),
            pinned_level: None,
        }
    }
}

fn default_window() -> u64 { 300 }
fn default_reduced_threshold() -> f64 { 5.0 }
fn default_minimal_threshold() -> f64 { 15.0 }
fn default_emergency_threshold() -> f64 { 30.0 }
fn default_recovery_successes() -> u32 { 10 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_gateway_batch")]
    pub batch_size: usize,
    #[serde(default = "default_batch_max_age")]
    pub batch_max_age_ms: u64,
    #[serde(default = "default_gateway_sweep")]
    pub sweep_interval_ms: u64,
    /// Messages kept per session while no connection is live.
    #[serde(default = "default_offline_queue")]
    pub offline_queue_size: usize,
    #[serde(default = "default_inbound_per_minute")]
    pub inbound_per_minute: u32,
    /// Offline queues and rate-limit buckets of sessions quiet this long are dropped.
    #[serde(default = "default_idle_session_ttl")]
    pub idle_session_ttl_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            batch_size: default_gateway_batch(),
            batch_max_age_ms: default_batch_max_age(),
            sweep_interval_ms: default_gateway_sweep(),
            offline_queue_size: default_offline_queue(),
            inbound_per_minute: default_inbound_per_minute(),
            idle_session_ttl_secs: default_idle_session_ttl(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }
fn default_gateway_batch() -> usize { 10 }
fn default_batch_max_age() -> u64 { 100 }
fn default_gateway_sweep() -> u64 { 50 }
fn default_offline_queue() -> usize { 100 }
fn default_inbound_per_minute() -> u32 { 120 }
fn default_idle_session_ttl() -> u64 { 900 }

/// Remote decision source reached over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_decision_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_decision_retries")]
    pub max_retries: u32,
}

fn default_decision_timeout() -> u64 { 30 }
fn default_decision_retries() -> u32 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrataError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| StrataError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        let d = &self.degradation;
        if !(d.reduced_threshold <= d.minimal_threshold
            && d.minimal_threshold <= d.emergency_threshold)
        {
            return Err(StrataError::Config(
                "degradation thresholds must be ordered reduced <= minimal <= emergency".into(),
            ));
        }
        if self.checkpoint.batch_size == 0 || self.gateway.batch_size == 0 {
            return Err(StrataError::Config("batch sizes must be at least 1".into()));
        }
        for class in OperationClass::ALL {
            let breaker = self.breakers.for_class(class);
            if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
                return Err(StrataError::Config(format!(
                    "breaker thresholds for {class} must be at least 1"
                )));
            }
        }
        if self.executor.max_autonomous_steps == 0 {
            return Err(StrataError::Config(
                "executor.max_autonomous_steps must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.storage.database_path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset vars stay literal
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_STRATA_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STRATA_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STRATA_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STRATA_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STRATA_VAR}\"");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.checkpoint.batch_size, 10);
        assert_eq!(config.checkpoint.max_age_ms, 5000);
        assert_eq!(config.executor.max_autonomous_steps, 10);
        assert_eq!(config.degradation.window_secs, 300);
        assert_eq!(config.gateway.offline_queue_size, 100);
        assert_eq!(config.gateway.batch_max_age_ms, 100);
        assert_eq!(config.gateway.sweep_interval_ms, 50);
        assert!(config.decision.is_none());
    }

    #[test]
    fn test_expensive_classes_trip_earlier() {
        let config = AppConfig::default();
        let decision = config.breakers.for_class(OperationClass::Decision);
        let data = config.breakers.for_class(OperationClass::Data);
        assert!(decision.failure_threshold < data.failure_threshold);
        assert_eq!(
            config.breakers.for_class(OperationClass::Generation).failure_threshold,
            3
        );
    }

    #[test]
    fn test_partial_breaker_section() {
        let config = AppConfig::parse(
            r#"
[breakers.data]
failure_threshold = 8
cooldown_ms = 250
"#,
        )
        .unwrap();
        assert_eq!(config.breakers.data.failure_threshold, 8);
        assert_eq!(config.breakers.data.success_threshold, 2);
        assert_eq!(config.breakers.data.cooldown(), Duration::from_millis(250));
        assert_eq!(config.breakers.decision.failure_threshold, 3);
    }

    #[test]
    fn test_pinned_level_parses() {
        let config = AppConfig::parse("[degradation]\npinned_level = \"minimal\"\n").unwrap();
        assert_eq!(config.degradation.pinned_level, Some(DegradationLevel::Minimal));
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let err = AppConfig::parse("[degradation]\nreduced_threshold = 50.0\n").unwrap_err();
        assert!(matches!(err, StrataError::Config(_)));
    }

    #[test]
    fn test_database_path_expands_home() {
        std::env::set_var("HOME", "/home/tester");
        let config = AppConfig::default();
        assert_eq!(
            config.database_path(),
            PathBuf::from("/home/tester/.strata/strata.db")
        );
    }
}
