//! TestsIR generation: seed/smoke UUID agreement and the boundary
//! behaviors around degenerate entities and flows.

mod common;

use common::{endpoint, field, fk_field, widget_ir};
use specforge::emitter::ast_gen;
use specforge::icbr;
use specforge::ir::{ApplicationIr, Entity, Flow, HttpMethod, SemanticType};
use specforge::smoke::fixtures::FixtureSet;
use specforge::smoke::TestsIr;

#[test]
fn test_seed_script_and_smoke_agree_on_uuids() {
    let mut ir = widget_ir();
    ir.domain.entities.push(Entity {
        name: "Review".to_string(),
        fields: vec![
            field("id", SemanticType::Uuid),
            fk_field("widget_id", "Widget"),
        ],
    });
    ir.api.endpoints.push(endpoint(
        HttpMethod::Get,
        "/reviews/{id}",
        "get_review",
        "Review",
    ));

    let fixtures = FixtureSet::build(&ir);
    let seed = ast_gen::seed_script(&ir, &fixtures);
    let tests = TestsIr::generate(&ir);

    // Every UUID the runner substitutes into a path is literally present
    // in the seed script - agreement by construction.
    for entity in ["Widget", "Review"] {
        let id = fixtures.id_for(entity).expect("fixture id").to_string();
        assert!(seed.contains(&id), "seed script must insert {entity} id {id}");
    }
    let get_review = tests
        .scenarios
        .iter()
        .find(|s| s.name == "happy_get_review")
        .expect("review scenario");
    let review_id = fixtures.id_for("Review").expect("review id").to_string();
    assert!(get_review.path.contains(&review_id));
}

#[test]
fn test_zero_field_entity_emits_empty_body_and_happy_path() {
    let mut ir = ApplicationIr::new("Stub");
    ir.domain.entities.push(Entity {
        name: "Ping".to_string(),
        fields: vec![field("id", SemanticType::Uuid)],
    });
    ir.api
        .endpoints
        .push(endpoint(HttpMethod::Post, "/pings", "create_ping", "Ping"));

    // The create schema for an id-only entity has no fields.
    let schemas = ast_gen::schemas_file(&ir);
    let create_class = schemas
        .split("class ")
        .find(|c| c.starts_with("PingCreate"))
        .expect("create schema");
    assert!(create_class.contains("pass"), "{create_class}");

    // The happy path exists with an empty payload; no validation-error
    // scenario can be constructed.
    let tests = TestsIr::generate(&ir);
    let happy = tests
        .scenarios
        .iter()
        .find(|s| s.name == "happy_create_ping")
        .expect("happy scenario");
    assert_eq!(
        happy.payload.as_ref().and_then(|p| p.as_object()).map(serde_json::Map::len),
        Some(0)
    );
    assert!(tests.scenarios.iter().all(|s| s.name != "invalid_create_ping"));
}

#[test]
fn test_fk_only_entity_has_no_update_surface() {
    let mut ir = ApplicationIr::new("Links");
    ir.domain.entities.push(Entity {
        name: "Target".to_string(),
        fields: vec![field("id", SemanticType::Uuid)],
    });
    ir.domain.entities.push(Entity {
        name: "Link".to_string(),
        fields: vec![field("id", SemanticType::Uuid), fk_field("target_id", "Target")],
    });
    ir.api
        .endpoints
        .push(endpoint(HttpMethod::Put, "/links/{id}", "update_link", "Link"));

    // The repository emits no update method and smoke generates no update
    // scenario.
    let link = ir.domain.entity("Link").expect("entity");
    assert!(!ast_gen::repository_file(link).contains("def update"));
    let tests = TestsIr::generate(&ir);
    assert!(tests.scenarios.iter().all(|s| s.name != "happy_update_link"));
}

#[test]
fn test_flow_with_empty_postconditions_is_a_pure_read() {
    let mut ir = ApplicationIr::new("Readonly");
    ir.domain.entities.push(Entity {
        name: "Report".to_string(),
        fields: vec![field("id", SemanticType::Uuid)],
    });
    ir.behavior.flows.push(Flow {
        name: "get_report_summary".to_string(),
        source_entity: Some("Report".to_string()),
        target_entity: None,
        creates_entity: None,
        guards: vec![],
        preconditions: vec![],
        postconditions: vec![],
        invariants: vec![],
        steps: vec![specforge::ir::FlowStep {
            action: specforge::ir::StepAction::Read,
            entity: "Report".to_string(),
            field: None,
            detail: None,
        }],
        status_transitions: vec![],
        field_mappings: vec![],
        golden: false,
    });

    let behavior = icbr::lower(&ir).expect("behavior lowering");
    let flow = behavior.flow("get_report_summary").expect("flow");
    assert!(!flow.mutating);

    let body = ast_gen::emit_workflow_slot_body(flow, &ir);
    assert!(
        !body.contains("self.session.flush()"),
        "a pure read does not flush: {body}"
    );
    assert!(body.trim_end().ends_with("return report"));
}
