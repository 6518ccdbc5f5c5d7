//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - specforge.toml (default configuration)
//! - specforge.local.toml (git-ignored local overrides)
//! - Environment variables (SPECFORGE_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # specforge.toml
//! execution_mode = "hybrid"
//! strict_mode = false
//!
//! [repair]
//! max_iterations = 3
//! target_pass_rate = 0.8
//!
//! [docker]
//! enforce_runtime = false
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! SPECFORGE_EXECUTION_MODE=safe
//! SPECFORGE_REPAIR__MAX_ITERATIONS=5
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How much latitude the LLM stratum gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// LLM stratum disabled entirely; byte-deterministic output
    Safe,
    /// LLM confined to declared slots; learned patterns written (default)
    Hybrid,
    /// Slot enforcement relaxed; patterns written to a sandboxed store
    Research,
}

/// Smoke depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QaLevel {
    /// Syntactic checks and in-process smoke
    Fast,
    /// Docker deployment and full smoke
    Heavy,
}

/// Quality-gate policy environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateEnvironment {
    Dev,
    Staging,
    Prod,
}

/// Main configuration struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,

    /// Disables all IR enrichment (inferred endpoints, implied invariants)
    #[serde(default)]
    pub strict_mode: bool,

    #[serde(default = "default_qa_level")]
    pub qa_level: QaLevel,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub repair: RepairConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub learning: LearningConfig,

    #[serde(default)]
    pub quality_gate: QualityGateConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Hybrid
}

fn default_qa_level() -> QaLevel {
    QaLevel::Fast
}

/// Docker lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Abort when Docker is missing instead of degrading to in-process
    #[serde(default)]
    pub enforce_runtime: bool,

    /// Rebuild the container without cache between repair iterations
    #[serde(default)]
    pub rebuild_between_repairs: bool,

    /// Docker build deadline in seconds
    #[serde(default = "default_docker_build_secs")]
    pub build_timeout_seconds: u64,
}

fn default_docker_build_secs() -> u64 {
    300
}

impl Default for DockerConfig {
    fn default() -> Self {
        DockerConfig {
            enforce_runtime: false,
            rebuild_between_repairs: false,
            build_timeout_seconds: 300,
        }
    }
}

/// Repair loop budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_target_pass_rate")]
    pub target_pass_rate: f64,

    /// Attempts per canonical violation key before escalation
    #[serde(default = "default_per_violation_budget")]
    pub per_violation_budget: u32,

    /// Stall detection threshold on pass-rate deltas
    #[serde(default = "default_convergence_epsilon")]
    pub convergence_epsilon: f64,

    /// Wall-clock budget for one repair cycle, in seconds
    #[serde(default = "default_repair_wall_clock")]
    pub wall_clock_seconds: u64,
}

fn default_max_iterations() -> u32 {
    3
}
fn default_target_pass_rate() -> f64 {
    0.8
}
fn default_per_violation_budget() -> u32 {
    2
}
fn default_convergence_epsilon() -> f64 {
    0.01
}
fn default_repair_wall_clock() -> u64 {
    15 * 60
}

impl Default for RepairConfig {
    fn default() -> Self {
        RepairConfig {
            max_iterations: default_max_iterations(),
            target_pass_rate: default_target_pass_rate(),
            per_violation_budget: default_per_violation_budget(),
            convergence_epsilon: default_convergence_epsilon(),
            wall_clock_seconds: default_repair_wall_clock(),
        }
    }
}

/// IR cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Entry TTL in seconds (default: seven days)
    #[serde(default = "default_ir_cache_ttl")]
    pub ir_cache_ttl_seconds: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./.specforge/ir-cache")
}
fn default_ir_cache_ttl() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            dir: default_cache_dir(),
            ir_cache_ttl_seconds: default_ir_cache_ttl(),
        }
    }
}

/// Learning store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Abort when the store is unreachable instead of degrading
    #[serde(default)]
    pub required: bool,

    /// Anti-patterns injected per generation prompt
    #[serde(default = "default_max_patterns_per_prompt")]
    pub max_patterns_per_prompt: usize,

    /// Occurrences before an anti-pattern escalates prompt severity
    #[serde(default = "default_min_pattern_occurrences")]
    pub min_pattern_occurrences: u64,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./.specforge/patterns.json")
}
fn default_max_patterns_per_prompt() -> usize {
    5
}
fn default_min_pattern_occurrences() -> u64 {
    2
}

impl Default for LearningConfig {
    fn default() -> Self {
        LearningConfig {
            store_path: default_store_path(),
            required: false,
            max_patterns_per_prompt: default_max_patterns_per_prompt(),
            min_pattern_occurrences: default_min_pattern_occurrences(),
        }
    }
}

/// Quality-gate thresholds per environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateConfig {
    #[serde(default = "default_gate_environment")]
    pub environment: GateEnvironment,
}

fn default_gate_environment() -> GateEnvironment {
    GateEnvironment::Dev
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        QualityGateConfig {
            environment: default_gate_environment(),
        }
    }
}

/// LLM transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Per-call deadline in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,

    /// API key; usually supplied via SPECFORGE_LLM__API_KEY
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_llm_endpoint() -> String {
    "http://localhost:11434/v1/chat/completions".to_string()
}
fn default_llm_model() -> String {
    "qwen2.5-coder".to_string()
}
fn default_llm_timeout() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            timeout_seconds: default_llm_timeout(),
            api_key: None,
        }
    }
}

/// Where generated applications land.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./generated")
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            dir: default_output_dir(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file directory; stdout-only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            dir: None,
            json: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            execution_mode: default_execution_mode(),
            strict_mode: false,
            qa_level: default_qa_level(),
            docker: DockerConfig::default(),
            repair: RepairConfig::default(),
            cache: CacheConfig::default(),
            learning: LearningConfig::default(),
            quality_gate: QualityGateConfig::default(),
            llm: LlmConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from specforge.toml, specforge.local.toml, and
    /// SPECFORGE_* environment variables, in that precedence order.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("specforge.toml"))
            .merge(Toml::file("specforge.local.toml"))
            .merge(Env::prefixed("SPECFORGE_").split("__"))
            .extract()
    }

    /// Load from an explicit file path (tests, CLI --config).
    pub fn load_from(path: &std::path::Path) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SPECFORGE_").split("__"))
            .extract()
    }

    /// Fingerprint of the settings that affect lowering/enrichment output.
    /// Part of the IR cache key.
    pub fn enrichment_fingerprint(&self) -> String {
        format!("strict={};mode={:?}", self.strict_mode, self.execution_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.execution_mode, ExecutionMode::Hybrid);
        assert!(!config.strict_mode);
        assert_eq!(config.repair.max_iterations, 3);
        assert!((config.repair.target_pass_rate - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.repair.per_violation_budget, 2);
        assert!((config.repair.convergence_epsilon - 0.01).abs() < f64::EPSILON);
        assert_eq!(config.cache.ir_cache_ttl_seconds, 604_800);
        assert_eq!(config.learning.max_patterns_per_prompt, 5);
        assert_eq!(config.learning.min_pattern_occurrences, 2);
    }

    #[test]
    fn test_fingerprint_tracks_strict_mode() {
        let mut config = Config::default();
        let loose = config.enrichment_fingerprint();
        config.strict_mode = true;
        assert_ne!(loose, config.enrichment_fingerprint());
    }
}
