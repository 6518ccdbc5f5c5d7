//! Shared builders for integration tests.
#![allow(dead_code)]

use specforge::config::Config;
use specforge::ir::{
    ApiModel, ApplicationIr, BehaviorModel, ConstraintValue, Endpoint, Entity, Field,
    FieldConstraint, Flow, ForeignKey, HttpMethod, InferenceSource, SemanticType, StatusTransition,
    ValidationType,
};
use specforge::smoke::{ExecutionOutcome, Scenario, ScenarioExecutor};
use std::collections::HashMap;
use std::sync::Arc;

pub fn field(name: &str, ty: SemanticType) -> Field {
    Field {
        name: name.to_string(),
        semantic_type: ty,
        nullable: false,
        default: None,
        sql_default: false,
        constraints: vec![],
        foreign_key: None,
        enum_values: vec![],
    }
}

pub fn fk_field(name: &str, target: &str) -> Field {
    let mut f = field(name, SemanticType::Uuid);
    f.foreign_key = Some(ForeignKey {
        entity: target.to_string(),
        field: "id".to_string(),
    });
    f
}

pub fn endpoint(method: HttpMethod, path: &str, op: &str, entity: &str) -> Endpoint {
    Endpoint {
        method,
        path: path.to_string(),
        operation_id: op.to_string(),
        path_params: path
            .split('/')
            .filter(|s| s.starts_with('{'))
            .map(|_| "id".to_string())
            .collect(),
        request_schema: None,
        response_schema: None,
        entity: entity.to_string(),
        inferred: false,
        inference_source: InferenceSource::Spec,
        flow: None,
    }
}

/// The spec §-style demo app: a Widget with a constrained name and price
/// and a POST endpoint.
pub fn widget_ir() -> ApplicationIr {
    let mut ir = ApplicationIr::new("WidgetStore");
    let mut name = field("name", SemanticType::String);
    name.constraints = vec![
        FieldConstraint::new(ValidationType::LengthMin, ConstraintValue::Int(1)),
        FieldConstraint::new(ValidationType::LengthMax, ConstraintValue::Int(64)),
    ];
    let mut price = field("price", SemanticType::Decimal);
    price.constraints = vec![FieldConstraint::new(
        ValidationType::RangeMin,
        ConstraintValue::Float(0.01),
    )];
    ir.domain.entities.push(Entity {
        name: "Widget".to_string(),
        fields: vec![field("id", SemanticType::Uuid), name, price],
    });
    ir.api = ApiModel {
        endpoints: vec![endpoint(HttpMethod::Post, "/widgets", "create_widget", "Widget")],
        schemas: vec![],
    };
    ir
}

/// An Order/Customer app where Order carries a required FK, as in the
/// repair-cycle scenario.
pub fn order_ir() -> ApplicationIr {
    let mut ir = ApplicationIr::new("OrderDesk");
    ir.domain.entities.push(Entity {
        name: "Customer".to_string(),
        fields: vec![field("id", SemanticType::Uuid)],
    });
    let mut status = field("status", SemanticType::Enum);
    status.enum_values = vec!["created".to_string(), "paid".to_string()];
    ir.domain.entities.push(Entity {
        name: "Order".to_string(),
        fields: vec![
            field("id", SemanticType::Uuid),
            fk_field("customer_id", "Customer"),
            field("total", SemanticType::Decimal),
            status,
        ],
    });
    ir.api.endpoints.push(endpoint(
        HttpMethod::Post,
        "/orders",
        "create_order",
        "Order",
    ));
    let mut pay = endpoint(HttpMethod::Post, "/orders/{id}/pay", "pay_order", "Order");
    pay.flow = Some("pay_order".to_string());
    ir.api.endpoints.push(pay);
    ir.behavior = BehaviorModel {
        flows: vec![Flow {
            name: "pay_order".to_string(),
            source_entity: Some("Order".to_string()),
            target_entity: None,
            creates_entity: None,
            guards: vec![],
            preconditions: vec!["status == \"created\"".to_string()],
            postconditions: vec!["status == \"paid\"".to_string()],
            invariants: vec![],
            steps: vec![],
            status_transitions: vec![StatusTransition {
                entity: "Order".to_string(),
                field: "status".to_string(),
                from: "created".to_string(),
                to: "paid".to_string(),
            }],
            field_mappings: vec![],
            golden: false,
        }],
    };
    ir
}

/// Serialize an IR so it can be fed to the pipeline as a pre-lowered spec.
pub fn ir_as_spec(ir: &ApplicationIr) -> String {
    serde_json::to_string_pretty(ir).expect("serializable IR")
}

/// A test config rooted in a temp directory: SAFE mode by default so no
/// network is touched, learning store and output under the temp root.
pub fn test_config(root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.execution_mode = specforge::ExecutionMode::Safe;
    config.cache.dir = root.join("ir-cache");
    config.learning.store_path = root.join("patterns.json");
    config.output.dir = root.join("generated");
    config
}

/// Per-scenario scripted statuses: each scenario consumes its own list of
/// outcomes round by round, repeating the last entry when exhausted.
/// Scenarios without a script answer with their expected status.
pub struct RoundsExecutor {
    scripts: parking_lot::Mutex<HashMap<String, (usize, Vec<(u16, String)>)>>,
}

impl RoundsExecutor {
    pub fn new(scripts: Vec<(&str, Vec<(u16, &str)>)>) -> Arc<Self> {
        let scripts = scripts
            .into_iter()
            .map(|(name, rounds)| {
                (
                    name.to_string(),
                    (
                        0usize,
                        rounds
                            .into_iter()
                            .map(|(status, body)| (status, body.to_string()))
                            .collect(),
                    ),
                )
            })
            .collect();
        Arc::new(RoundsExecutor {
            scripts: parking_lot::Mutex::new(scripts),
        })
    }
}

#[async_trait::async_trait]
impl ScenarioExecutor for RoundsExecutor {
    async fn execute(&self, scenario: &Scenario) -> Result<ExecutionOutcome, String> {
        let mut scripts = self.scripts.lock();
        if let Some((cursor, rounds)) = scripts.get_mut(&scenario.name) {
            let idx = (*cursor).min(rounds.len().saturating_sub(1));
            *cursor += 1;
            let (status, body) = rounds[idx].clone();
            return Ok(ExecutionOutcome {
                status,
                body: body.clone(),
                server_log: body,
            });
        }
        Ok(ExecutionOutcome {
            status: scenario.expected_status,
            body: String::new(),
            server_log: String::new(),
        })
    }
}
