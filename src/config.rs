//! Runtime configuration (spec §6.4): environment-first with sane defaults,
//! mirroring the teacher's `Config::from_env` + `performance/config.rs`
//! serde-default idiom rather than a bespoke flag parser.

use crate::models::EvalEngineMode;
use serde::{Deserialize, Serialize};

fn default_port() -> u16 {
    8080
}

fn default_ws_port() -> u16 {
    8081
}

fn default_db_path() -> String {
    "interaction_engine.db".to_string()
}

fn default_batch_interval_ms() -> u64 {
    crate::batcher::DEFAULT_BATCH_INTERVAL_MS
}

fn default_batch_max_events() -> usize {
    crate::batcher::DEFAULT_BATCH_MAX_EVENTS
}

fn default_max_context_events() -> usize {
    100
}

fn default_llm_timeout_ms() -> u64 {
    15_000
}

fn default_true() -> bool {
    true
}

fn default_nightly_batch_cron() -> String {
    "0 0 3 * * *".to_string()
}

fn default_eval_engine() -> EvalEngineMode {
    EvalEngineMode::Auto
}

fn default_tier_agreement_floor() -> f64 {
    0.85
}

fn default_decision_agreement_floor() -> f64 {
    0.90
}

fn default_max_composite_divergence() -> f64 {
    15.0
}

fn default_signal_shift_threshold() -> f64 {
    12.0
}

fn default_conversion_rate_drop_percent() -> f64 {
    20.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSettings {
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_batch_max_events")]
    pub batch_max_events: usize,
    #[serde(default = "default_max_context_events")]
    pub max_context_events: usize,
    #[serde(default = "default_eval_engine")]
    pub eval_engine: EvalEngineMode,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            batch_max_events: default_batch_max_events(),
            max_context_events: default_max_context_events(),
            eval_engine: EvalEngineMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentSettings {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default)]
    pub disable_scheduler: bool,
    #[serde(default = "default_nightly_batch_cron")]
    pub nightly_batch_cron: String,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            disable_scheduler: false,
            nightly_batch_cron: default_nightly_batch_cron(),
        }
    }
}

/// Drift anomaly thresholds (spec §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftSettings {
    #[serde(default = "default_tier_agreement_floor")]
    pub tier_agreement_floor: f64,
    #[serde(default = "default_decision_agreement_floor")]
    pub decision_agreement_floor: f64,
    #[serde(default = "default_max_composite_divergence")]
    pub max_composite_divergence: f64,
    #[serde(default = "default_signal_shift_threshold")]
    pub signal_shift_threshold: f64,
    #[serde(default = "default_conversion_rate_drop_percent")]
    pub conversion_rate_drop_percent: f64,
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            tier_agreement_floor: default_tier_agreement_floor(),
            decision_agreement_floor: default_decision_agreement_floor(),
            max_composite_divergence: default_max_composite_divergence(),
            signal_shift_threshold: default_signal_shift_threshold(),
            conversion_rate_drop_percent: default_conversion_rate_drop_percent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_llm_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub evaluation: EvaluationSettings,
    #[serde(default)]
    pub shadow: ShadowSettings,
    #[serde(default)]
    pub experiments: ExperimentSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    #[serde(default)]
    pub drift: DriftSettings,
    #[serde(default)]
    pub llm: LlmSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            ws_port: default_ws_port(),
            db_path: default_db_path(),
            evaluation: EvaluationSettings::default(),
            shadow: ShadowSettings::default(),
            experiments: ExperimentSettings::default(),
            jobs: JobSettings::default(),
            drift: DriftSettings::default(),
            llm: LlmSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Loads `.env` (if present), then an optional `config.toml`, then
    /// environment variables prefixed `ENGINE_`, in that precedence order
    /// (env wins). Falls back to `EngineConfig::default()` for anything
    /// unset.
    pub fn load() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match std::fs::read_to_string("config.toml") {
            Ok(contents) => toml::from_str(&contents)?,
            Err(_) => EngineConfig::default(),
        };

        if let Ok(port) = std::env::var("ENGINE_PORT") {
            config.port = port.parse()?;
        }
        if let Ok(ws_port) = std::env::var("ENGINE_WS_PORT") {
            config.ws_port = ws_port.parse()?;
        }
        if let Ok(db_path) = std::env::var("ENGINE_DB_PATH") {
            config.db_path = db_path;
        }
        if let Ok(disabled) = std::env::var("ENGINE_JOBS_DISABLE_SCHEDULER") {
            config.jobs.disable_scheduler = disabled == "1" || disabled.eq_ignore_ascii_case("true");
        }
        if let Ok(enabled) = std::env::var("ENGINE_EXPERIMENTS_ENABLED") {
            config.experiments.enabled = enabled == "1" || enabled.eq_ignore_ascii_case("true");
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = EngineConfig::default();
        assert_eq!(config.evaluation.batch_max_events, 10);
        assert!(config.shadow.enabled);
        assert!(!config.experiments.enabled);
    }
}
