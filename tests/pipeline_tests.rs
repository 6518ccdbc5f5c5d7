//! End-to-end pipeline tests driven through scripted executors and LLM
//! clients: convergence, regression rollback, template protection, and the
//! learning bridge.

mod common;

use common::{endpoint, field, fk_field, ir_as_spec, order_ir, test_config, RoundsExecutor};
use specforge::ir::{ApplicationIr, Entity, HttpMethod, SemanticType};
use specforge::llm::ScriptedLlmClient;
use specforge::{CancelToken, Pipeline, RunOutcome};
use std::sync::Arc;

const INTEGRITY_ERROR: &str =
    "sqlalchemy.exc.IntegrityError: null value in column \"customer_id\" violates not-null constraint";

#[tokio::test]
async fn test_all_passing_run_converges_immediately() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = test_config(tmp.path());
    let pipeline = Pipeline::new(config, Arc::new(ScriptedLlmClient::default()));

    let executor = RoundsExecutor::new(vec![]);
    let report = pipeline
        .run_with_executor(&ir_as_spec(&order_ir()), executor, &CancelToken::unbounded())
        .await
        .expect("pipeline");

    assert!(matches!(
        report.outcome,
        RunOutcome::Converged { iterations: 0, .. }
    ));
    assert!((report.final_smoke.pass_rate - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_repair_cycle_converges_after_database_fix() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(tmp.path());
    // Everything must pass; the single failing create keeps us below target.
    config.repair.target_pass_rate = 1.0;
    let pipeline = Pipeline::new(config, Arc::new(ScriptedLlmClient::default()));

    // The order create fails once with an IntegrityError on the required
    // FK, then passes (the injected 404 guard resolves it).
    let executor = RoundsExecutor::new(vec![(
        "happy_create_order",
        vec![(500, INTEGRITY_ERROR), (201, ""), (201, "")],
    )]);

    let report = pipeline
        .run_with_executor(&ir_as_spec(&order_ir()), executor, &CancelToken::unbounded())
        .await
        .expect("pipeline");

    match report.outcome {
        RunOutcome::Converged {
            iterations,
            pass_rate,
        } => {
            assert!(iterations >= 1, "the fix takes at least one iteration");
            assert!((pass_rate - 1.0).abs() < f64::EPSILON);
        }
        other => panic!("expected convergence, got {other:?}"),
    }

    // The database strategy injected the existence check into the route.
    let routes = std::fs::read_to_string(report.app_dir.join("src/routes/order_routes.py"))
        .expect("routes file");
    assert!(
        routes.contains("if session.get(Customer, payload.customer_id) is None:"),
        "{routes}"
    );
    assert!(routes.contains("status_code=404"));

    // Backpropagation recorded the realignment in the repair history.
    // (The injected guard realigns the flow's preconditions only when a
    // flow was attributed; the audit record of the mutation itself lives
    // in the manifest-adjacent history, so the minimum check here is that
    // the pipeline converged with the guard on disk.)
}

#[tokio::test]
async fn test_regression_rolls_back_the_last_iteration() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(tmp.path());
    config.repair.target_pass_rate = 1.0;
    let pipeline = Pipeline::new(config, Arc::new(ScriptedLlmClient::default()));

    // Round 0: the create fails (repairable). Round 1: the create passes
    // but two reads break, dropping the rate below round 0.
    let executor = RoundsExecutor::new(vec![
        (
            "happy_create_order",
            vec![(500, INTEGRITY_ERROR), (201, ""), (201, "")],
        ),
        ("happy_list_orders", vec![(200, ""), (500, "boom"), (500, "boom")]),
        ("happy_get_health", vec![(200, ""), (500, "boom"), (500, "boom")]),
        ("happy_get_metrics", vec![(200, ""), (500, "boom"), (500, "boom")]),
    ]);

    let report = pipeline
        .run_with_executor(&ir_as_spec(&order_ir()), executor, &CancelToken::unbounded())
        .await
        .expect("pipeline");

    assert!(
        matches!(report.outcome, RunOutcome::Regressed { .. }),
        "expected regression, got {:?}",
        report.outcome
    );

    // The iteration's mutation (the injected guard) was rolled back; the
    // route file matches its pre-repair emission again.
    let routes = std::fs::read_to_string(report.app_dir.join("src/routes/order_routes.py"))
        .expect("routes file");
    assert!(
        !routes.contains("if session.get(Customer, payload.customer_id) is None:"),
        "rollback must restore the pre-iteration content"
    );
}

#[tokio::test]
async fn test_template_protection_rejects_llm_patch() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(tmp.path());
    config.execution_mode = specforge::ExecutionMode::Hybrid;
    config.repair.target_pass_rate = 1.0;
    config.repair.max_iterations = 1;

    // Slot fills and the README get a benign body; the repair fallback
    // proposes a patch against the compose file, which must be refused.
    let llm = Arc::new(ScriptedLlmClient::repeating(
        "{\"file\": \"docker-compose.yml\", \"slot\": null, \"body\": \"return None\"}",
    ));
    let pipeline = Pipeline::new(config, llm);

    // A generic 500 on the flow endpoint routes the violation to the LLM
    // fallback (the service method exists, so the service strategy passes).
    let executor = RoundsExecutor::new(vec![(
        "e2e_pay_order",
        vec![(500, "RuntimeError: exploded"), (500, "RuntimeError: exploded")],
    )]);

    let report = pipeline
        .run_with_executor(&ir_as_spec(&order_ir()), executor, &CancelToken::unbounded())
        .await
        .expect("pipeline");

    // No file was modified: the compose file is still the template output.
    let compose = std::fs::read_to_string(report.app_dir.join("docker-compose.yml"))
        .expect("compose file");
    assert!(compose.contains("services:"));
    assert!(!compose.contains("return None"));

    // The refusal was remembered as a high-severity anti-pattern.
    let store = specforge::learning::LearningStore::open_file(
        tmp.path().join("patterns.json"),
        "test",
        false,
    )
    .expect("store");
    let patterns = store.patterns_for_flow("pay_order", 1, 10);
    assert!(
        patterns
            .iter()
            .any(|p| p.wrong_snippet.contains("docker-compose.yml")),
        "expected a protected-path anti-pattern, got {patterns:?}"
    );
}

#[tokio::test]
async fn test_inferred_nested_delete_scenarios_run() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = test_config(tmp.path());
    let pipeline = Pipeline::new(config, Arc::new(ScriptedLlmClient::default()));

    let mut ir = ApplicationIr::new("Registry");
    ir.domain.entities.push(Entity {
        name: "Parent".to_string(),
        fields: vec![field("id", SemanticType::Uuid)],
    });
    ir.domain.entities.push(Entity {
        name: "Child".to_string(),
        fields: vec![field("id", SemanticType::Uuid), fk_field("parent_id", "Parent")],
    });
    ir.api
        .endpoints
        .push(endpoint(HttpMethod::Post, "/parents", "create_parent", "Parent"));
    ir.api.endpoints.push(endpoint(
        HttpMethod::Post,
        "/parents/{id}/children",
        "create_parent_child",
        "Child",
    ));

    let executor = RoundsExecutor::new(vec![]);
    let report = pipeline
        .run_with_executor(&ir_as_spec(&ir), executor, &CancelToken::unbounded())
        .await
        .expect("pipeline");

    assert!(matches!(report.outcome, RunOutcome::Converged { .. }));
    // Enrichment materialized the nested delete and smoke exercised both
    // the mismatched-pair (404) and matched-pair (204) scenarios.
    let routes = std::fs::read_to_string(report.app_dir.join("src/routes/child_routes.py"))
        .expect("child routes");
    assert!(routes.contains("child.parent_id != parent_id"), "{routes}");
}

#[tokio::test]
async fn test_learning_store_accumulates_smoke_failures() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(tmp.path());
    config.repair.target_pass_rate = 1.0;
    config.repair.max_iterations = 1;
    let pipeline = Pipeline::new(config, Arc::new(ScriptedLlmClient::default()));

    // A persistent failure: every round 500s with an IntegrityError the
    // SAFE-mode strategies cannot fully resolve (field is not optional and
    // carries no FK), so error knowledge accumulates.
    let executor = RoundsExecutor::new(vec![(
        "happy_create_order",
        vec![(
            500,
            "sqlalchemy.exc.IntegrityError: null value in column \"total\" violates not-null constraint",
        )],
    )]);

    let _ = pipeline
        .run_with_executor(&ir_as_spec(&order_ir()), executor, &CancelToken::unbounded())
        .await
        .expect("pipeline");

    let store = specforge::learning::LearningStore::open_file(
        tmp.path().join("patterns.json"),
        "test",
        false,
    )
    .expect("store");
    // The bridge converted the runtime error into a generation-time
    // anti-pattern keyed by structural entity and endpoint extraction.
    let anti = store.anti_pattern("Order|/orders");
    assert!(anti.is_some(), "expected a bridged anti-pattern");
}
