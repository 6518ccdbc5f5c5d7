//! # Error Classifier
//!
//! Maps each violation to one of six repair classes with a fixed decision
//! procedure:
//!
//! 1. Exception class table (IntegrityError → DATABASE, ValidationError →
//!    VALIDATION, ImportError → IMPORT, ...)
//! 2. HTTP 500 without a recognized exception: endpoint shape - action
//!    verbs or nested resources - means SERVICE
//! 3. HTTP 404 on an endpoint the API model declares → ROUTE
//! 4. HTTP 422 on an endpoint whose request schema carries matching
//!    constraints → VALIDATION
//! 5. Everything else → GENERIC
//!
//! The constraint graph decides whether a failure spans multiple entities
//! and therefore needs a composite repair.

use crate::ir::{ApplicationIr, ConstraintGraph};
use crate::smoke::Violation;
use serde::Serialize;
use std::fmt;

/// Repair class of a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorClass {
    Database,
    Validation,
    Service,
    Import,
    Route,
    Generic,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Database => "DATABASE",
            ErrorClass::Validation => "VALIDATION",
            ErrorClass::Service => "SERVICE",
            ErrorClass::Import => "IMPORT",
            ErrorClass::Route => "ROUTE",
            ErrorClass::Generic => "GENERIC",
        };
        f.write_str(s)
    }
}

/// Classification result with the multi-entity judgement.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub class: ErrorClass,
    /// Whether the failure spans multiple entities (composite repair)
    pub multi_entity: bool,
    /// Entities implicated, from the flow or the endpoint's FK cluster
    pub entities: Vec<String>,
}

/// Structural exception-class table. First match wins.
fn class_from_exception(exception: &str) -> Option<ErrorClass> {
    const TABLE: &[(&str, ErrorClass)] = &[
        ("IntegrityError", ErrorClass::Database),
        ("OperationalError", ErrorClass::Database),
        ("DataError", ErrorClass::Database),
        ("ProgrammingError", ErrorClass::Database),
        ("ValidationError", ErrorClass::Validation),
        ("RequestValidationError", ErrorClass::Validation),
        ("ImportError", ErrorClass::Import),
        ("ModuleNotFoundError", ErrorClass::Import),
    ];
    TABLE
        .iter()
        .find(|(name, _)| *name == exception)
        .map(|(_, class)| *class)
}

/// Action verbs that mark a behavioral endpoint. Matched against the
/// trailing path segment, never against entity names.
const ACTION_VERBS: &[&str] = &[
    "pay", "cancel", "checkout", "confirm", "process", "complete", "submit", "approve",
];

/// Classify one violation.
pub fn classify(
    violation: &Violation,
    ir: &ApplicationIr,
    graph: &ConstraintGraph,
) -> Classification {
    let class = decide_class(violation, ir);
    let (multi_entity, entities) = entity_scope(violation, ir, graph);
    Classification {
        class,
        multi_entity,
        entities,
    }
}

fn decide_class(violation: &Violation, ir: &ApplicationIr) -> ErrorClass {
    // Step 1: structural exception table.
    if let Some(exception) = &violation.exception_class {
        // `<Name>Service object has no attribute` is a service failure even
        // though AttributeError is not in the table.
        if exception == "AttributeError"
            && (violation.server_log.contains("Service' object has no attribute")
                || violation.body.contains("Service' object has no attribute"))
        {
            return ErrorClass::Service;
        }
        if let Some(class) = class_from_exception(exception) {
            return class;
        }
    }

    let endpoint = ir
        .api
        .endpoints
        .iter()
        .find(|e| e.path == violation.endpoint && e.method == violation.method);

    // Step 2: 500 with endpoint shape evidence.
    if (500..600).contains(&violation.actual_status) {
        if let Some(ep) = endpoint {
            let is_action = ep
                .action_segment()
                .is_some_and(|seg| ACTION_VERBS.contains(&seg));
            if is_action || ep.is_nested() || ep.flow.is_some() {
                return ErrorClass::Service;
            }
        }
        return ErrorClass::Generic;
    }

    // Step 3: 404 on a declared endpoint.
    if violation.actual_status == 404 && endpoint.is_some() {
        return ErrorClass::Route;
    }

    // Step 4: 422 where the request schema has matching constraints.
    if violation.actual_status == 422 {
        if let Some(ep) = endpoint {
            let has_constraints = ir
                .domain
                .entity(&ep.entity)
                .is_some_and(|e| e.fields.iter().any(|f| !f.constraints.is_empty()));
            if has_constraints {
                return ErrorClass::Validation;
            }
        }
    }

    ErrorClass::Generic
}

fn entity_scope(
    violation: &Violation,
    ir: &ApplicationIr,
    graph: &ConstraintGraph,
) -> (bool, Vec<String>) {
    // Flow violations: the flow's entity set decides.
    if let Some(flow_name) = &violation.flow_id {
        if let Some(flow) = ir.behavior.flow(flow_name) {
            let entities: Vec<String> = flow.entities().iter().map(|e| (*e).to_string()).collect();
            return (entities.len() > 1, entities);
        }
    }

    // CRUD violations: the endpoint entity's FK cluster.
    let entity = ir
        .api
        .endpoints
        .iter()
        .find(|e| e.path == violation.endpoint && e.method == violation.method)
        .map(|e| e.entity.clone());
    match entity {
        Some(entity) => {
            let cluster = graph.entity_cluster(&entity);
            (cluster.len() > 1, cluster)
        }
        None => (false, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Endpoint, Entity, Field, HttpMethod, InferenceSource, SemanticType};

    fn violation(endpoint: &str, status: u16, exception: Option<&str>) -> Violation {
        Violation {
            endpoint: endpoint.to_string(),
            method: HttpMethod::Post,
            scenario: "s".to_string(),
            expected_status: 201,
            actual_status: status,
            error_type: "server_error".to_string(),
            exception_class: exception.map(str::to_string),
            stack_trace: vec![],
            flow_id: None,
            body: String::new(),
            server_log: String::new(),
            db_before: None,
            db_after: None,
        }
    }

    fn order_ir() -> ApplicationIr {
        let mut ir = ApplicationIr::new("Shop");
        ir.domain.entities.push(Entity {
            name: "Order".to_string(),
            fields: vec![Field {
                name: "id".to_string(),
                semantic_type: SemanticType::Uuid,
                nullable: false,
                default: None,
                sql_default: false,
                constraints: vec![],
                foreign_key: None,
                enum_values: vec![],
            }],
        });
        ir.api.endpoints.push(Endpoint {
            method: HttpMethod::Post,
            path: "/orders/{id}/pay".to_string(),
            operation_id: "pay_order".to_string(),
            path_params: vec!["id".to_string()],
            request_schema: None,
            response_schema: None,
            entity: "Order".to_string(),
            inferred: false,
            inference_source: InferenceSource::Spec,
            flow: Some("pay_order".to_string()),
        });
        ir
    }

    #[test]
    fn test_integrity_error_is_database() {
        let ir = order_ir();
        let graph = ConstraintGraph::build(&ir);
        let c = classify(
            &violation("/orders", 500, Some("IntegrityError")),
            &ir,
            &graph,
        );
        assert_eq!(c.class, ErrorClass::Database);
    }

    #[test]
    fn test_500_on_action_endpoint_is_service() {
        let ir = order_ir();
        let graph = ConstraintGraph::build(&ir);
        let c = classify(&violation("/orders/{id}/pay", 500, None), &ir, &graph);
        assert_eq!(c.class, ErrorClass::Service);
    }

    #[test]
    fn test_404_on_declared_endpoint_is_route() {
        let ir = order_ir();
        let graph = ConstraintGraph::build(&ir);
        let mut v = violation("/orders/{id}/pay", 404, None);
        v.expected_status = 200;
        let c = classify(&v, &ir, &graph);
        assert_eq!(c.class, ErrorClass::Route);
    }

    #[test]
    fn test_unknown_is_generic() {
        let ir = order_ir();
        let graph = ConstraintGraph::build(&ir);
        let c = classify(&violation("/nowhere", 418, None), &ir, &graph);
        assert_eq!(c.class, ErrorClass::Generic);
    }
}
