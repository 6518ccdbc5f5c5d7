//! # IR Enrichment
//!
//! Adds what the spec implied but did not state: CRUD endpoints that follow
//! from best practice, health/metrics endpoints, nested-resource endpoints
//! derived from FK topology, and implied flow invariants. Every addition is
//! flagged (`inferred` + source) so reports can distinguish spec-stated from
//! materialized surface, and `strict_mode` disables all of it.
//!
//! Nested resources are detected structurally, by FK edges - never by
//! entity or path names.

use crate::config::Config;
use crate::ir::{
    ApplicationIr, Endpoint, Flow, FlowInvariant, HttpMethod, InferenceSource, StepAction,
};
use crate::lowering::normalize;
use serde::Serialize;
use tracing::debug;

/// Inference rule tags carried by implied invariants so each rule can be
/// disabled individually.
pub const RULE_ADD_ITEM_EFFECTS: &str = "add_item_effects";
pub const RULE_CANCELLATION_REVERSE: &str = "cancellation_reverse";

/// Counts of what enrichment added, for telemetry and reports.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EnrichmentReport {
    pub inferred_endpoints: usize,
    pub inferred_invariants: usize,
    pub nested_resources: usize,
}

/// Enrich an IR in place. No-op under `strict_mode`.
pub fn enrich(ir: &mut ApplicationIr, config: &Config) -> EnrichmentReport {
    let mut report = EnrichmentReport::default();
    if config.strict_mode {
        debug!("strict_mode set; skipping enrichment");
        return report;
    }

    infer_crud_endpoints(ir, &mut report);
    infer_infra_endpoints(ir, &mut report);
    infer_nested_endpoints(ir, &mut report);
    infer_flow_invariants(ir, &mut report);
    report
}

/// Resource path for an entity: snake_case plural of its name.
fn resource_path(entity: &str) -> String {
    format!("/{}s", normalize::to_snake_case(entity))
}

fn has_endpoint(ir: &ApplicationIr, method: HttpMethod, path: &str) -> bool {
    ir.api.endpoint(method, path).is_some()
}

fn ensure_schema(ir: &mut ApplicationIr, name: &str) {
    if !ir.api.schemas.iter().any(|s| s == name) {
        ir.api.schemas.push(name.to_string());
    }
}

fn push_inferred(
    ir: &mut ApplicationIr,
    report: &mut EnrichmentReport,
    mut endpoint: Endpoint,
    source: InferenceSource,
) {
    // Operation ids must stay unique; skip rather than shadow a spec-stated id.
    if ir.api.by_operation_id(&endpoint.operation_id).is_some() {
        return;
    }
    endpoint.inferred = true;
    endpoint.inference_source = source;
    debug!(method = %endpoint.method, path = %endpoint.path, "inferred endpoint");
    ir.api.endpoints.push(endpoint);
    report.inferred_endpoints += 1;
}

/// For every entity with a POST, materialize the list GET and the DELETE.
fn infer_crud_endpoints(ir: &mut ApplicationIr, report: &mut EnrichmentReport) {
    let entities: Vec<String> = ir.domain.entities.iter().map(|e| e.name.clone()).collect();

    for entity in entities {
        let base = resource_path(&entity);
        if !has_endpoint(ir, HttpMethod::Post, &base) {
            continue;
        }
        let snake = normalize::to_snake_case(&entity);
        let read_schema = format!("{entity}Read");

        if !has_endpoint(ir, HttpMethod::Get, &base) {
            ensure_schema(ir, &read_schema);
            push_inferred(
                ir,
                report,
                Endpoint {
                    method: HttpMethod::Get,
                    path: base.clone(),
                    operation_id: format!("list_{snake}s"),
                    path_params: vec![],
                    request_schema: None,
                    response_schema: Some(read_schema.clone()),
                    entity: entity.clone(),
                    inferred: false,
                    inference_source: InferenceSource::Spec,
                    flow: None,
                },
                InferenceSource::CrudBestPractice,
            );
        }

        let item = format!("{base}/{{id}}");
        if !has_endpoint(ir, HttpMethod::Delete, &item) {
            push_inferred(
                ir,
                report,
                Endpoint {
                    method: HttpMethod::Delete,
                    path: item,
                    operation_id: format!("delete_{snake}"),
                    path_params: vec!["id".to_string()],
                    request_schema: None,
                    response_schema: None,
                    entity: entity.clone(),
                    inferred: false,
                    inference_source: InferenceSource::Spec,
                    flow: None,
                },
                InferenceSource::CrudBestPractice,
            );
        }
    }
}

/// Health and metrics endpoints from the infrastructure model.
fn infer_infra_endpoints(ir: &mut ApplicationIr, report: &mut EnrichmentReport) {
    let app = ir.app_name.clone();
    let health = ir.infrastructure.health_path.clone();
    let metrics = ir.infrastructure.metrics_path.clone();

    for (path, op) in [(health, "get_health"), (metrics, "get_metrics")] {
        if !has_endpoint(ir, HttpMethod::Get, &path) {
            push_inferred(
                ir,
                report,
                Endpoint {
                    method: HttpMethod::Get,
                    path,
                    operation_id: op.to_string(),
                    path_params: vec![],
                    request_schema: None,
                    response_schema: None,
                    entity: app.clone(),
                    inferred: false,
                    inference_source: InferenceSource::Spec,
                    flow: None,
                },
                InferenceSource::InfraBestPractice,
            );
        }
    }
}

/// Detect nested resources and materialize the child delete endpoint
/// wherever a nested create exists. Detection is by FK topology: a nested
/// POST only counts when its child entity actually carries an FK to another
/// entity, regardless of what the path segments are called.
fn infer_nested_endpoints(ir: &mut ApplicationIr, report: &mut EnrichmentReport) {
    let nested_creates: Vec<(String, String)> = ir
        .api
        .endpoints
        .iter()
        .filter(|ep| ep.method == HttpMethod::Post && ep.is_nested())
        .filter(|ep| {
            ir.domain
                .entity(&ep.entity)
                .is_some_and(|child| child.foreign_keys().any(|(_, fk)| fk.entity != child.name))
        })
        .map(|ep| (ep.path.clone(), ep.entity.clone()))
        .collect();

    for (create_path, child) in nested_creates {
        report.nested_resources += 1;

        let nested_delete = format!("{create_path}/{{id}}");
        if !has_endpoint(ir, HttpMethod::Delete, &nested_delete) {
            let parent_seg = nested_delete
                .split('/')
                .find(|s| !s.is_empty())
                .unwrap_or_default()
                .to_string();
            push_inferred(
                ir,
                report,
                Endpoint {
                    method: HttpMethod::Delete,
                    path: nested_delete,
                    operation_id: format!(
                        "delete_{}_{}",
                        normalize::to_snake_case(parent_seg.strip_suffix('s').unwrap_or(&parent_seg)),
                        normalize::to_snake_case(&child)
                    ),
                    path_params: vec!["id".to_string(), "child_id".to_string()],
                    request_schema: None,
                    response_schema: None,
                    entity: child.clone(),
                    inferred: false,
                    inference_source: InferenceSource::Spec,
                    flow: None,
                },
                InferenceSource::CrudBestPractice,
            );
        }
    }
}

/// Implied invariants:
/// - "add item to parent" flows derive stock and total effects
/// - cancellation transitions derive the reverse effect where the add flow
///   exists
fn infer_flow_invariants(ir: &mut ApplicationIr, report: &mut EnrichmentReport) {
    // Pass 1: find add-item flows and their derived effects.
    let mut add_effects: Vec<(String, Vec<String>)> = Vec::new();
    for flow in &ir.behavior.flows {
        let Some(effects) = add_item_effects(ir, flow) else {
            continue;
        };
        add_effects.push((flow.name.clone(), effects));
    }

    let has_add_flow = !add_effects.is_empty();
    let reverse_effects: Vec<String> = add_effects
        .iter()
        .flat_map(|(_, effects)| effects.iter())
        .filter(|e| e.contains("-="))
        .map(|e| e.replace("-=", "+="))
        .collect();

    for flow in &mut ir.behavior.flows {
        if let Some((_, effects)) = add_effects.iter().find(|(name, _)| *name == flow.name) {
            for expr in effects {
                if flow.invariants.iter().any(|i| i.expression == *expr) {
                    continue;
                }
                flow.invariants.push(FlowInvariant {
                    expression: expr.clone(),
                    inferred_by: Some(RULE_ADD_ITEM_EFFECTS.to_string()),
                    enabled: true,
                });
                report.inferred_invariants += 1;
            }
        }

        // Cancellation target: any transition whose destination is a
        // cancelling status.
        let cancels = flow
            .status_transitions
            .iter()
            .any(|t| t.to.contains("cancel"));
        if cancels && has_add_flow {
            for expr in &reverse_effects {
                if flow.invariants.iter().any(|i| i.expression == *expr) {
                    continue;
                }
                flow.invariants.push(FlowInvariant {
                    expression: expr.clone(),
                    inferred_by: Some(RULE_CANCELLATION_REVERSE.to_string()),
                    enabled: true,
                });
                report.inferred_invariants += 1;
            }
        }
    }
}

/// Effects implied by an "add item to parent" flow, or None when the flow
/// has no such shape. The shape is structural: the flow creates (or links)
/// a child carrying a `quantity` field, and some entity it reads carries
/// `stock`/`total`.
fn add_item_effects(ir: &ApplicationIr, flow: &Flow) -> Option<Vec<String>> {
    let child_name = flow.creates_entity.as_deref().or_else(|| {
        flow.steps
            .iter()
            .find(|s| matches!(s.action, StepAction::Create | StepAction::Link))
            .map(|s| s.entity.as_str())
    })?;
    let child = ir.domain.entity(child_name)?;
    child.field("quantity")?;

    let mut effects = Vec::new();
    for entity_name in flow.entities() {
        let Some(entity) = ir.domain.entity(entity_name) else {
            continue;
        };
        if entity.name == child.name {
            continue;
        }
        if let Some(stock) = entity.field("stock") {
            if stock.semantic_type.is_numeric() {
                effects.push(format!("{}.stock -= quantity", entity.name));
            }
        }
        if entity.field("total").is_some() && child.field("unit_price").is_some() {
            effects.push(format!("{}.total += quantity * unit_price", entity.name));
        }
    }

    if effects.is_empty() {
        None
    } else {
        Some(effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Entity, Field, ForeignKey, SemanticType};

    fn field(name: &str, ty: SemanticType, fk: Option<&str>) -> Field {
        Field {
            name: name.to_string(),
            semantic_type: ty,
            nullable: false,
            default: None,
            sql_default: false,
            constraints: vec![],
            foreign_key: fk.map(|e| ForeignKey {
                entity: e.to_string(),
                field: "id".to_string(),
            }),
            enum_values: vec![],
        }
    }

    fn post(path: &str, entity: &str, op: &str) -> Endpoint {
        Endpoint {
            method: HttpMethod::Post,
            path: path.to_string(),
            operation_id: op.to_string(),
            path_params: vec![],
            request_schema: None,
            response_schema: None,
            entity: entity.to_string(),
            inferred: false,
            inference_source: InferenceSource::Spec,
            flow: None,
        }
    }

    fn parent_child_ir() -> ApplicationIr {
        let mut ir = ApplicationIr::new("Demo");
        ir.domain.entities.push(Entity {
            name: "Parent".to_string(),
            fields: vec![field("id", SemanticType::Uuid, None)],
        });
        ir.domain.entities.push(Entity {
            name: "Child".to_string(),
            fields: vec![
                field("id", SemanticType::Uuid, None),
                field("parent_id", SemanticType::Uuid, Some("Parent")),
            ],
        });
        ir.api.endpoints.push(post("/parents", "Parent", "create_parent"));
        ir.api
            .endpoints
            .push(post("/parents/{id}/childs", "Child", "create_parent_child"));
        ir
    }

    #[test]
    fn test_crud_inference_adds_list_and_delete() {
        let mut ir = parent_child_ir();
        let report = enrich(&mut ir, &Config::default());
        assert!(report.inferred_endpoints >= 2);
        assert!(ir.api.endpoint(HttpMethod::Get, "/parents").is_some());
        assert!(ir.api.endpoint(HttpMethod::Delete, "/parents/{id}").is_some());

        let list = ir
            .api
            .endpoint(HttpMethod::Get, "/parents")
            .expect("list endpoint");
        assert!(list.inferred);
        assert_eq!(list.inference_source, InferenceSource::CrudBestPractice);
    }

    #[test]
    fn test_nested_delete_materialized_from_fk_topology() {
        let mut ir = parent_child_ir();
        enrich(&mut ir, &Config::default());
        let nested = ir
            .api
            .endpoint(HttpMethod::Delete, "/parents/{id}/childs/{id}")
            .expect("nested delete endpoint");
        assert!(nested.inferred);
        assert_eq!(nested.entity, "Child");
    }

    #[test]
    fn test_strict_mode_disables_everything() {
        let mut ir = parent_child_ir();
        let mut config = Config::default();
        config.strict_mode = true;
        let before = ir.api.endpoints.len();
        let report = enrich(&mut ir, &config);
        assert_eq!(report.inferred_endpoints, 0);
        assert_eq!(ir.api.endpoints.len(), before);
    }

    #[test]
    fn test_health_and_metrics_inferred() {
        let mut ir = parent_child_ir();
        enrich(&mut ir, &Config::default());
        assert!(ir.api.endpoint(HttpMethod::Get, "/health").is_some());
        assert!(ir.api.endpoint(HttpMethod::Get, "/metrics").is_some());
    }
}
