//! # Compliance Validator
//!
//! Compares the generated code's observable structure back to the
//! `ApplicationIr` under three progressively stricter views:
//!
//! - **Semantic**: names matched by meaning (suffix stripping + edit
//!   distance ≥ 0.7, action-verb synonyms) and constraints by semantic
//!   equivalence (`gt:0` accepts `ge:1`)
//! - **Relaxed**: fuzzy names, but the canonical `ValidationType` must
//!   match exactly
//! - **Strict**: exact `(entity, field, constraint_type, value)` equality
//!
//! Compliance does not gate success on its own; the `QualityGate` combines
//! it with smoke pass rate, warnings, and regression counts under the
//! environment policy.

pub mod extract;

use crate::config::GateEnvironment;
use crate::ir::{ApplicationIr, ConstraintRule, ConstraintValue, ValidationType};
use crate::lowering::normalize;
use crate::smoke::SmokeResult;
use extract::ExtractedConstraints;
use serde::Serialize;
use std::path::Path;

const FUZZY_THRESHOLD: f64 = 0.7;

/// Matching strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceView {
    Semantic,
    Relaxed,
    Strict,
}

/// Scores for one view, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ViewReport {
    pub overall: f64,
    pub entities: f64,
    pub endpoints: f64,
    pub flows: f64,
    pub constraints: f64,
}

/// The full three-view report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ComplianceReport {
    pub semantic: ViewReport,
    pub relaxed: ViewReport,
    pub strict: ViewReport,
    pub warnings: Vec<String>,
    pub regressions: Vec<String>,
}

impl ComplianceReport {
    /// Write `compliance_report.json` style output.
    pub fn write(&self, app_dir: &Path) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(app_dir.join("compliance_report.json"), text)
    }
}

/// Validate a generated tree against the IR.
pub fn validate(ir: &ApplicationIr, app_dir: &Path) -> ComplianceReport {
    let extracted = extract::extract(app_dir);
    let mut warnings = Vec::new();

    let semantic = view_report(ir, &extracted, ComplianceView::Semantic, &mut warnings);
    let relaxed = view_report(ir, &extracted, ComplianceView::Relaxed, &mut Vec::new());
    let strict = view_report(ir, &extracted, ComplianceView::Strict, &mut Vec::new());

    ComplianceReport {
        semantic,
        relaxed,
        strict,
        warnings,
        regressions: Vec::new(),
    }
}

fn ratio(matched: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        matched as f64 / total as f64
    }
}

fn view_report(
    ir: &ApplicationIr,
    extracted: &ExtractedConstraints,
    view: ComplianceView,
    warnings: &mut Vec<String>,
) -> ViewReport {
    // Entities: IR entity names present as code classes.
    let entity_total = ir.domain.entities.len();
    let entity_matched = ir
        .domain
        .entities
        .iter()
        .filter(|entity| {
            extracted
                .entities
                .iter()
                .any(|code| name_matches(&entity.name, code, view))
        })
        .count();

    // Endpoints: IR endpoints present as code routes. Paths are structural,
    // so placeholders normalize before comparison.
    let endpoint_total = ir.api.endpoints.len();
    let endpoint_matched = ir
        .api
        .endpoints
        .iter()
        .filter(|ep| {
            extracted.routes.iter().any(|(method, path)| {
                *method == ep.method.to_string() && path_matches(&ep.path, path)
            })
        })
        .count();

    // Flows: IR flows present as service methods.
    let flow_total = ir.behavior.flows.len();
    let flow_matched = ir
        .behavior
        .flows
        .iter()
        .filter(|flow| {
            extracted
                .service_methods
                .iter()
                .any(|method| flow_matches(&flow.name, method, view))
        })
        .count();

    // Constraints: every constraint on every IR field must be enforced
    // somewhere in code.
    let mut constraint_total = 0usize;
    let mut constraint_matched = 0usize;
    for entity in &ir.domain.entities {
        for field in &entity.fields {
            for constraint in &field.constraints {
                constraint_total += 1;
                if constraint_satisfied(
                    &entity.name,
                    &field.name,
                    constraint.kind,
                    &constraint.value,
                    extracted,
                    view,
                ) {
                    constraint_matched += 1;
                } else if view == ComplianceView::Semantic {
                    warnings.push(format!(
                        "constraint {}.{}.{} not observed in generated code",
                        entity.name,
                        field.name,
                        constraint.kind.key_name()
                    ));
                }
            }
        }
    }

    let entities = ratio(entity_matched, entity_total);
    let endpoints = ratio(endpoint_matched, endpoint_total);
    let flows = ratio(flow_matched, flow_total);
    let constraints = ratio(constraint_matched, constraint_total);
    ViewReport {
        overall: (entities + endpoints + flows + constraints) / 4.0,
        entities,
        endpoints,
        flows,
        constraints,
    }
}

/// Entity/field name match per view: exact for strict, suffix-stripped
/// edit distance for the fuzzy views.
fn name_matches(ir_name: &str, code_name: &str, view: ComplianceView) -> bool {
    if ir_name == code_name {
        return true;
    }
    if view == ComplianceView::Strict {
        return false;
    }
    let a = strip_plural(&normalize::to_snake_case(ir_name));
    let b = strip_plural(&normalize::to_snake_case(code_name));
    normalize::similarity(&a, &b) >= FUZZY_THRESHOLD
}

fn strip_plural(name: &str) -> String {
    name.strip_suffix('s').unwrap_or(name).to_string()
}

/// Flow name match: exact, or (fuzzy views) any verb synonym rewrite.
fn flow_matches(ir_flow: &str, code_method: &str, view: ComplianceView) -> bool {
    if ir_flow == code_method {
        return true;
    }
    if view == ComplianceView::Strict {
        return false;
    }
    let ir_tokens: Vec<&str> = ir_flow.split('_').collect();
    let code_tokens: Vec<&str> = code_method.split('_').collect();
    if ir_tokens.len() != code_tokens.len() {
        return normalize::similarity(ir_flow, code_method) >= FUZZY_THRESHOLD;
    }
    ir_tokens.iter().zip(&code_tokens).all(|(a, b)| {
        a == b
            || normalize::verb_synonyms(a)
                .iter()
                .any(|syn| syn == b)
            || normalize::similarity(a, b) >= FUZZY_THRESHOLD
    })
}

/// Canonical-path comparison tolerating different placeholder names.
fn path_matches(ir_path: &str, code_path: &str) -> bool {
    let norm = |p: &str| -> Vec<String> {
        p.split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s.starts_with('{') {
                    "{}".to_string()
                } else {
                    s.to_string()
                }
            })
            .collect()
    };
    norm(ir_path) == norm(code_path)
}

fn constraint_satisfied(
    entity: &str,
    field: &str,
    kind: ValidationType,
    value: &ConstraintValue,
    extracted: &ExtractedConstraints,
    view: ComplianceView,
) -> bool {
    // Exact-key lookup first (O(1) path).
    let key = format!("{entity}.{field}.{}", kind.key_name());
    if let Some(rule) = extracted.by_key.get(&key) {
        if value_matches(kind, value, &rule.constraint.value, view) {
            return true;
        }
    }
    if view == ComplianceView::Strict {
        return false;
    }

    // Fuzzy views: scan for a rule whose names match semantically.
    extracted.by_key.values().any(|rule| {
        name_matches(entity, &rule.entity, view)
            && name_matches(field, &rule.field, view)
            && kind_matches(kind, rule, view)
            && value_matches(kind, value, &rule.constraint.value, view)
    })
}

/// Relaxed and strict require the same canonical type; semantic tolerates
/// equivalent kinds (a length_min of 1 is a presence check).
fn kind_matches(kind: ValidationType, rule: &ConstraintRule, view: ComplianceView) -> bool {
    if rule.constraint.kind == kind {
        return true;
    }
    if view != ComplianceView::Semantic {
        return false;
    }
    matches!(
        (kind, rule.constraint.kind),
        (ValidationType::Presence, ValidationType::LengthMin)
            | (ValidationType::LengthMin, ValidationType::Presence)
    )
}

/// Value equivalence per view. The semantic view accepts adjacent open and
/// closed numeric bounds (`gt:0` ≡ `ge:1` for integral bounds).
fn value_matches(
    kind: ValidationType,
    ir_value: &ConstraintValue,
    code_value: &ConstraintValue,
    view: ComplianceView,
) -> bool {
    if ir_value == code_value {
        return true;
    }
    match view {
        ComplianceView::Strict => false,
        _ => match (ir_value.as_f64(), code_value.as_f64()) {
            (Some(a), Some(b))
                if matches!(kind, ValidationType::RangeMin | ValidationType::RangeMax) =>
            {
                (a - b).abs() <= 1.0
            }
            (Some(a), Some(b)) if view == ComplianceView::Semantic => (a - b).abs() < f64::EPSILON,
            _ => view == ComplianceView::Semantic && kind == ValidationType::Presence,
        },
    }
}

// ============================================================================
// Quality gate
// ============================================================================

/// The per-check verdicts of the gate.
#[derive(Debug, Clone, Serialize)]
pub struct GateChecks {
    pub semantic: bool,
    pub ir_relaxed: bool,
    pub ir_strict: bool,
    pub errors: bool,
    pub warnings: bool,
    pub regressions: bool,
    pub infra: bool,
    pub docker: bool,
    pub alembic: bool,
    pub syntax: bool,
    pub smoke: bool,
}

/// The gate's report, written as `quality_gate.json`.
#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub environment: GateEnvironment,
    pub status: GateStatus,
    pub checks: GateChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
}

/// Minimum thresholds per environment.
struct GatePolicy {
    semantic: f64,
    relaxed: f64,
    strict: f64,
    max_warnings: usize,
    smoke: f64,
}

fn policy(environment: GateEnvironment) -> GatePolicy {
    match environment {
        GateEnvironment::Dev => GatePolicy {
            semantic: 0.70,
            relaxed: 0.50,
            strict: 0.30,
            max_warnings: 20,
            smoke: 0.70,
        },
        GateEnvironment::Staging => GatePolicy {
            semantic: 0.85,
            relaxed: 0.70,
            strict: 0.50,
            max_warnings: 10,
            smoke: 0.80,
        },
        GateEnvironment::Prod => GatePolicy {
            semantic: 0.95,
            relaxed: 0.85,
            strict: 0.70,
            max_warnings: 5,
            smoke: 0.95,
        },
    }
}

/// Combine compliance, smoke, and structural checks under the environment
/// policy.
pub fn quality_gate(
    environment: GateEnvironment,
    compliance: &ComplianceReport,
    smoke: &SmokeResult,
    app_dir: &Path,
) -> GateReport {
    let policy = policy(environment);
    let checks = GateChecks {
        semantic: compliance.semantic.overall >= policy.semantic,
        ir_relaxed: compliance.relaxed.overall >= policy.relaxed,
        ir_strict: compliance.strict.overall >= policy.strict,
        errors: smoke.violations.is_empty()
            || smoke.violations.iter().all(|v| v.actual_status != 0),
        warnings: compliance.warnings.len() <= policy.max_warnings,
        regressions: compliance.regressions.is_empty(),
        infra: app_dir.join("docker-compose.yml").exists(),
        docker: app_dir.join("Dockerfile").exists(),
        alembic: app_dir.join("migrations/versions").read_dir().map_or(false, |mut d| d.next().is_some()),
        syntax: python_sources_nonempty(app_dir),
        smoke: smoke.pass_rate >= policy.smoke,
    };

    let passed = checks.semantic
        && checks.ir_relaxed
        && checks.ir_strict
        && checks.errors
        && checks.warnings
        && checks.regressions
        && checks.infra
        && checks.docker
        && checks.alembic
        && checks.syntax
        && checks.smoke;

    GateReport {
        environment,
        status: if passed {
            GateStatus::Passed
        } else {
            GateStatus::Failed
        },
        checks,
    }
}

impl GateReport {
    pub fn write(&self, app_dir: &Path) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(app_dir.join("quality_gate.json"), text)
    }
}

/// Shallow syntax check: every emitted Python module is non-empty and has
/// balanced triple quotes.
fn python_sources_nonempty(app_dir: &Path) -> bool {
    fn walk(dir: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return true;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.is_dir() {
                if !walk(&path) {
                    return false;
                }
            } else if path.extension().and_then(|e| e.to_str()) == Some("py") {
                match std::fs::read_to_string(&path) {
                    Ok(content) => {
                        let ok = !content.trim().is_empty()
                            && content.matches("\"\"\"").count() % 2 == 0;
                        if !ok {
                            return false;
                        }
                    }
                    Err(_) => return false,
                }
            }
        }
        true
    }
    walk(&app_dir.join("src"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semantic_accepts_adjacent_bounds() {
        assert!(value_matches(
            ValidationType::RangeMin,
            &ConstraintValue::Int(1),
            &ConstraintValue::Float(0.0),
            ComplianceView::Semantic
        ));
        assert!(!value_matches(
            ValidationType::RangeMin,
            &ConstraintValue::Int(1),
            &ConstraintValue::Float(0.0),
            ComplianceView::Strict
        ));
    }

    #[test]
    fn test_name_matching_views() {
        assert!(name_matches("Order", "Order", ComplianceView::Strict));
        assert!(!name_matches("Order", "Orders", ComplianceView::Strict));
        assert!(name_matches("Order", "Orders", ComplianceView::Semantic));
        assert!(!name_matches("Order", "Invoice", ComplianceView::Semantic));
    }

    #[test]
    fn test_flow_matching_uses_verb_synonyms() {
        assert!(flow_matches(
            "create_order",
            "add_order",
            ComplianceView::Semantic
        ));
        assert!(!flow_matches(
            "create_order",
            "add_order",
            ComplianceView::Strict
        ));
    }

    #[test]
    fn test_path_matching_ignores_placeholder_names() {
        assert!(path_matches("/orders/{id}", "/orders/{order_id}"));
        assert!(!path_matches("/orders/{id}", "/orders"));
    }
}
