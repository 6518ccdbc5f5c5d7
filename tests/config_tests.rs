//! Config loading, TOML parsing, and default-value tests.

use specforge::config::{Config, ExecutionMode, GateEnvironment, QaLevel};
use std::io::Write;

#[test]
fn test_defaults_match_documented_contract() {
    let config = Config::default();
    assert_eq!(config.execution_mode, ExecutionMode::Hybrid);
    assert!(!config.strict_mode);
    assert_eq!(config.qa_level, QaLevel::Fast);
    assert!(!config.docker.enforce_runtime);
    assert!(!config.docker.rebuild_between_repairs);
    assert_eq!(config.docker.build_timeout_seconds, 300);
    assert_eq!(config.repair.max_iterations, 3);
    assert!((config.repair.target_pass_rate - 0.8).abs() < f64::EPSILON);
    assert_eq!(config.repair.per_violation_budget, 2);
    assert!((config.repair.convergence_epsilon - 0.01).abs() < f64::EPSILON);
    assert_eq!(config.repair.wall_clock_seconds, 900);
    assert_eq!(config.cache.ir_cache_ttl_seconds, 604_800);
    assert_eq!(config.learning.max_patterns_per_prompt, 5);
    assert_eq!(config.learning.min_pattern_occurrences, 2);
    assert_eq!(config.quality_gate.environment, GateEnvironment::Dev);
    assert_eq!(config.llm.timeout_seconds, 120);
}

#[test]
fn test_toml_overrides_defaults() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("specforge.toml");
    let mut file = std::fs::File::create(&path).expect("create");
    writeln!(
        file,
        "execution_mode = \"safe\"\nstrict_mode = true\n\n\
         [repair]\nmax_iterations = 5\ntarget_pass_rate = 0.95\n\n\
         [quality_gate]\nenvironment = \"prod\"\n"
    )
    .expect("write");

    let config = Config::load_from(&path).expect("load");
    assert_eq!(config.execution_mode, ExecutionMode::Safe);
    assert!(config.strict_mode);
    assert_eq!(config.repair.max_iterations, 5);
    assert!((config.repair.target_pass_rate - 0.95).abs() < f64::EPSILON);
    assert_eq!(config.quality_gate.environment, GateEnvironment::Prod);
    // Untouched sections keep their defaults.
    assert_eq!(config.repair.per_violation_budget, 2);
    assert_eq!(config.cache.ir_cache_ttl_seconds, 604_800);
}

#[test]
fn test_enrichment_fingerprint_changes_with_mode() {
    let mut config = Config::default();
    let hybrid = config.enrichment_fingerprint();
    config.execution_mode = ExecutionMode::Safe;
    let safe = config.enrichment_fingerprint();
    assert_ne!(hybrid, safe);

    config.strict_mode = true;
    assert_ne!(safe, config.enrichment_fingerprint());
}
