//! Learning substrate tests: cross-run persistence, the error bridge, and
//! prompt injection into the emission path.

mod common;

use common::test_config;
use specforge::emitter::llm_stratum::LlmStratum;
use specforge::ir::ApplicationIr;
use specforge::learning::{GenerationAntiPattern, LearningStore, PatternSeverity};

#[test]
fn test_store_survives_reopen() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("patterns.json");

    {
        let store = LearningStore::open_file(&path, "run_a", false).expect("open");
        store
            .record_error(
                "/carts/42/items",
                "DATABASE",
                "IntegrityError",
                "stock underflow on add",
            )
            .expect("record");
    }

    // Run B sees Run A's knowledge.
    let store = LearningStore::open_file(&path, "run_b", false).expect("reopen");
    assert_eq!(store.anti_pattern_count(), 1);
    let anti = store
        .anti_pattern("Cart|/carts/{id}/items")
        .expect("bridged pattern");
    assert_eq!(anti.occurrence_count, 1);
}

#[test]
fn test_prompt_injection_formats_avoid_prefer_blocks() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = LearningStore::open_file(tmp.path().join("p.json"), "proj", false).expect("open");
    store
        .record_anti_pattern(GenerationAntiPattern {
            entity_pattern: "Cart".to_string(),
            endpoint_pattern: "POST /carts/{id}/items".to_string(),
            wrong_snippet: "increment only".to_string(),
            correct_snippet: "decrement product.stock".to_string(),
            severity: PatternSeverity::High,
            occurrence_count: 2,
            prevention_count: 0,
            error_message: "IntegrityError stock".to_string(),
        })
        .expect("record");

    let ir = ApplicationIr::new("CartApp");
    let warnings = LlmStratum::pattern_warnings(Some(&store), &ir, "add_item_to_cart", 2, 5, false);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].starts_with("⚠️ AVOID"));
    assert!(warnings[0].contains("✅ PREFER: decrement product.stock"));
}

#[test]
fn test_injection_respects_occurrence_threshold_and_limit() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = LearningStore::open_file(tmp.path().join("p.json"), "proj", false).expect("open");

    // Below the occurrence threshold: bridged once, threshold two.
    store
        .record_error("/carts/9/items", "DATABASE", "IntegrityError", "stock")
        .expect("record");

    let ir = ApplicationIr::new("CartApp");
    let warnings = LlmStratum::pattern_warnings(Some(&store), &ir, "add_item_to_cart", 2, 5, false);
    assert!(warnings.is_empty(), "one occurrence stays below the threshold");

    // A second occurrence crosses it.
    store
        .record_error("/carts/11/items", "DATABASE", "IntegrityError", "stock")
        .expect("record");
    let warnings = LlmStratum::pattern_warnings(Some(&store), &ir, "add_item_to_cart", 2, 5, false);
    assert_eq!(warnings.len(), 1);
}

#[test]
fn test_strict_mode_filters_patterns_for_unknown_endpoints() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = LearningStore::open_file(tmp.path().join("p.json"), "proj", false).expect("open");
    store
        .record_anti_pattern(GenerationAntiPattern {
            entity_pattern: "Cart".to_string(),
            endpoint_pattern: "/carts/{id}/items".to_string(),
            wrong_snippet: "w".to_string(),
            correct_snippet: "c".to_string(),
            severity: PatternSeverity::High,
            occurrence_count: 5,
            prevention_count: 0,
            error_message: "cart item".to_string(),
        })
        .expect("record");

    // The (unenriched) API model declares no such endpoint, so strict mode
    // filters the pattern out of prompt injection.
    let ir = ApplicationIr::new("CartApp");
    let strict = LlmStratum::pattern_warnings(Some(&store), &ir, "add_item_to_cart", 1, 5, true);
    assert!(strict.is_empty());
    let loose = LlmStratum::pattern_warnings(Some(&store), &ir, "add_item_to_cart", 1, 5, false);
    assert_eq!(loose.len(), 1);
}

#[test]
fn test_fix_pattern_promotion_thresholds() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("p.json");

    // Three distinct projects succeed with the same fix.
    for project in ["a", "b", "c"] {
        let store = LearningStore::open_file(&path, project, false).expect("open");
        store
            .record_fix_outcome("sig|database", "database", "guard template", true)
            .expect("record");
    }

    let store = LearningStore::open_file(&path, "reader", false).expect("open");
    let candidates = store.promotion_candidates();
    assert_eq!(candidates.len(), 1);
    assert!(candidates[0].success_rate >= 0.7);
    assert!(candidates[0].projects.len() >= 3);

    // The pattern bank warms from the store's promotions.
    let bank = specforge::learning::PatternBank::new();
    bank.init_from(&store);
    assert_eq!(bank.len(), 1);
    assert!(bank.template("sig|database").is_some());
    bank.clear();
    assert!(bank.is_empty());
}

#[test]
fn test_config_wires_learning_paths() {
    // The test_config helper points the store into the temp root; the
    // pipeline-facing knobs carry the documented defaults.
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = test_config(tmp.path());
    assert_eq!(config.learning.max_patterns_per_prompt, 5);
    assert_eq!(config.learning.min_pattern_occurrences, 2);
    assert!(config.learning.store_path.starts_with(tmp.path()));
}
