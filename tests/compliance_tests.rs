//! Compliance validation against emitted trees: the three views and the
//! quality gate policies.

mod common;

use common::{ir_as_spec, test_config, widget_ir};
use specforge::compliance::{self, GateStatus};
use specforge::llm::ScriptedLlmClient;
use specforge::smoke::SmokeResult;
use specforge::{CancelToken, GateEnvironment, Pipeline};
use std::sync::Arc;

async fn emitted_widget_app() -> (specforge::ApplicationIr, std::path::PathBuf, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = test_config(tmp.path());
    let pipeline = Pipeline::new(config, Arc::new(ScriptedLlmClient::default()));
    let (ir, _manifest, app_dir) = pipeline
        .emit(&ir_as_spec(&widget_ir()), &CancelToken::unbounded())
        .await
        .expect("emission");
    (ir, app_dir, tmp)
}

#[tokio::test]
async fn test_emitted_tree_is_strictly_compliant() {
    let (ir, app_dir, _tmp) = emitted_widget_app().await;
    let report = compliance::validate(&ir, &app_dir);

    // What the emitter produced from the IR must match the IR exactly.
    assert!(report.strict.entities >= 0.99, "{:?}", report.strict);
    assert!(report.strict.constraints >= 0.99, "{:?}", report.strict);
    assert!(report.semantic.overall >= report.relaxed.overall);
    assert!(report.relaxed.overall >= report.strict.overall - f64::EPSILON);
}

#[tokio::test]
async fn test_drifted_schema_degrades_strict_before_semantic() {
    let (ir, app_dir, _tmp) = emitted_widget_app().await;

    // Hand-drift the schema file: `ge=0.01` becomes `gt=0` - semantically
    // equivalent, strictly different.
    let schemas_path = app_dir.join("src/models/schemas.py");
    let schemas = std::fs::read_to_string(&schemas_path).expect("schemas");
    std::fs::write(&schemas_path, schemas.replace("ge=0.01", "gt=0")).expect("write");

    let report = compliance::validate(&ir, &app_dir);
    assert!(
        report.semantic.constraints > report.strict.constraints,
        "semantic {:?} vs strict {:?}",
        report.semantic,
        report.strict
    );
}

#[tokio::test]
async fn test_quality_gate_combines_compliance_and_smoke() {
    let (ir, app_dir, _tmp) = emitted_widget_app().await;
    let report = compliance::validate(&ir, &app_dir);

    let good_smoke = SmokeResult {
        scenarios_total: 10,
        scenarios_passed: 10,
        scenarios_skipped: 0,
        pass_rate: 1.0,
        violations: vec![],
        server_logs: String::new(),
        fixture_snapshot: Default::default(),
    };
    let gate = compliance::quality_gate(GateEnvironment::Dev, &report, &good_smoke, &app_dir);
    assert_eq!(gate.status, GateStatus::Passed, "{:?}", gate.checks);
    assert!(gate.checks.infra);
    assert!(gate.checks.docker);
    assert!(gate.checks.alembic);
    assert!(gate.checks.syntax);

    // The same artifacts fail the gate when smoke collapses.
    let bad_smoke = SmokeResult {
        pass_rate: 0.2,
        ..good_smoke
    };
    let gate = compliance::quality_gate(GateEnvironment::Prod, &report, &bad_smoke, &app_dir);
    assert_eq!(gate.status, GateStatus::Failed);
    assert!(!gate.checks.smoke);
}
