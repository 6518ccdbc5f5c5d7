//! # Causal Attribution
//!
//! Builds the chain from a failing scenario to the most specific IR element
//! responsible: TestScenario → Endpoint → Flow/Step → FieldConstraint.
//! Attribution uses the classifier output, stack-frame file paths matched
//! against the generation manifest, and keyword similarity between the
//! scenario and candidate flows. The chain carries a confidence score
//! `α·history + β·ir_context + γ·semantic_similarity` used to rank repair
//! candidates.

use super::classifier::Classification;
use crate::ir::ApplicationIr;
use crate::learning::bridge;
use crate::learning::LearningStore;
use crate::manifest::GenerationManifest;
use crate::smoke::Violation;
use serde::Serialize;

const ALPHA_HISTORY: f64 = 0.4;
const BETA_IR_CONTEXT: f64 = 0.4;
const GAMMA_SEMANTIC: f64 = 0.2;

/// The attribution result.
#[derive(Debug, Clone, Serialize)]
pub struct CausalChain {
    pub scenario: String,
    /// Operation id of the implicated endpoint
    pub operation_id: Option<String>,
    /// Flow implicated, by name
    pub flow: Option<String>,
    /// Most specific constraint key, when one can be pinned down
    pub constraint_key: Option<String>,
    /// Manifest-relative path of the offending file, from stack frames
    pub file: Option<String>,
    /// Ranking confidence in [0, 1]
    pub confidence: f64,
}

/// Attribute one violation.
pub fn attribute(
    violation: &Violation,
    classification: &Classification,
    ir: &ApplicationIr,
    manifest: &GenerationManifest,
    learning: Option<&LearningStore>,
) -> CausalChain {
    let endpoint = ir
        .api
        .endpoints
        .iter()
        .find(|e| e.path == violation.endpoint && e.method == violation.method);

    let flow = violation
        .flow_id
        .clone()
        .or_else(|| endpoint.and_then(|e| e.flow.clone()));

    // The offending file: first stack frame that resolves in the manifest.
    let file = violation
        .stack_trace
        .iter()
        .find_map(|frame| manifest.file_for_frame(&frame.file))
        .map(|(path, _)| path.to_string());

    // The most specific constraint: a violated field named in the evidence.
    let constraint_key = endpoint.and_then(|ep| {
        let entity = ir.domain.entity(&ep.entity)?;
        let evidence = format!("{} {}", violation.body, violation.server_log);
        entity.fields.iter().find_map(|field| {
            if !evidence.contains(&field.name) {
                return None;
            }
            field
                .constraints
                .first()
                .map(|c| format!("{}.{}.{}", entity.name, field.name, c.kind.key_name()))
        })
    });

    let history = history_score(violation, learning);
    let ir_context = ir_context_score(endpoint.is_some(), flow.is_some(), constraint_key.is_some());
    let semantic = semantic_score(violation, &flow, classification);

    CausalChain {
        scenario: violation.scenario.clone(),
        operation_id: endpoint.map(|e| e.operation_id.clone()),
        flow,
        constraint_key,
        file,
        confidence: (ALPHA_HISTORY * history + BETA_IR_CONTEXT * ir_context + GAMMA_SEMANTIC * semantic)
            .clamp(0.0, 1.0),
    }
}

/// How often this signature has been seen before, saturating at five
/// occurrences.
fn history_score(violation: &Violation, learning: Option<&LearningStore>) -> f64 {
    let Some(store) = learning else {
        return 0.0;
    };
    let endpoint = bridge::normalize_endpoint(&violation.endpoint);
    let entity = bridge::extract_entity(&endpoint).unwrap_or_default();
    let signature = format!("{entity}|{endpoint}");
    store
        .anti_pattern(&signature)
        .map(|p| (p.occurrence_count as f64 / 5.0).min(1.0))
        .unwrap_or(0.0)
}

/// Fraction of the chain that resolved against the IR.
fn ir_context_score(has_endpoint: bool, has_flow: bool, has_constraint: bool) -> f64 {
    let mut score = 0.0;
    if has_endpoint {
        score += 0.5;
    }
    if has_flow {
        score += 0.3;
    }
    if has_constraint {
        score += 0.2;
    }
    score
}

/// Keyword overlap between the scenario and the implicated flow/entities.
fn semantic_score(
    violation: &Violation,
    flow: &Option<String>,
    classification: &Classification,
) -> f64 {
    let mut sources: Vec<&str> = classification.entities.iter().map(String::as_str).collect();
    if let Some(flow) = flow {
        sources.push(flow.as_str());
    }
    if sources.is_empty() {
        return 0.0;
    }
    let matched = bridge::semantic_match_score(&violation.scenario, &sources);
    let keywords = crate::lowering::normalize::keywords(&violation.scenario).len();
    if keywords == 0 {
        0.0
    } else {
        matched as f64 / keywords as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::HttpMethod;
    use crate::manifest::FileRecord;
    use crate::repair::classifier::ErrorClass;
    use crate::smoke::StackFrame;

    fn manifest_with_service() -> GenerationManifest {
        let mut manifest = GenerationManifest::new(
            "app",
            "safe".to_string(),
            false,
            crate::ir::IrStats {
                total_entities: 1,
                total_endpoints: 1,
                inferred_endpoints: 0,
            },
        );
        manifest.record(
            "src/services/order_service.py",
            FileRecord {
                stratum: crate::emitter::stratum::Stratum::Llm,
                source_id: "slot:flow:pay_order".to_string(),
                atoms: vec!["flow:pay_order".to_string()],
                tokens_in: 0,
                tokens_out: 0,
                model: None,
                elapsed_ms: 0,
                passed: true,
            },
        );
        manifest
    }

    #[test]
    fn test_stack_frame_resolves_offending_file() {
        let ir = ApplicationIr::new("Shop");
        let manifest = manifest_with_service();
        let violation = Violation {
            endpoint: "/orders/{id}/pay".to_string(),
            method: HttpMethod::Post,
            scenario: "e2e_pay_order".to_string(),
            expected_status: 200,
            actual_status: 500,
            error_type: "server_error".to_string(),
            exception_class: Some("AttributeError".to_string()),
            stack_trace: vec![StackFrame {
                file: "/app/src/services/order_service.py".to_string(),
                line: 12,
                function: "pay_order".to_string(),
            }],
            flow_id: Some("pay_order".to_string()),
            body: String::new(),
            server_log: String::new(),
            db_before: None,
            db_after: None,
        };
        let classification = Classification {
            class: ErrorClass::Service,
            multi_entity: false,
            entities: vec!["Order".to_string()],
        };

        let chain = attribute(&violation, &classification, &ir, &manifest, None);
        assert_eq!(chain.file.as_deref(), Some("src/services/order_service.py"));
        assert_eq!(chain.flow.as_deref(), Some("pay_order"));
        assert!(chain.confidence > 0.0);
    }
}
