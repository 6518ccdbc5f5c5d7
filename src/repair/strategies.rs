//! # Repair Strategies
//!
//! Tagged strategy variants sharing one four-method contract
//! (`applies_to`, `propose_fix`, `apply_fix`, `record_outcome`), tried in
//! fixed order: learned-pattern replay, database, validation, service,
//! import, route, LLM fallback. A strategy that cannot help returns `None`
//! or a `RepairFix` with `success = false`; it never throws. The
//! orchestrator decides fallbacks.

use super::attribution::CausalChain;
use super::backprop::IrRealignment;
use super::classifier::{Classification, ErrorClass};
use crate::config::ExecutionMode;
use crate::emitter::{ast_gen, slots, stratum};
use crate::icbr::BehaviorIr;
use crate::ir::ApplicationIr;
use crate::learning::{bridge, GenerationAntiPattern, LearningStore, PatternSeverity};
use crate::llm::{LlmClient, LlmRequest};
use crate::lowering::normalize;
use crate::manifest::GenerationManifest;
use crate::smoke::Violation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The fix kinds, matching the strategy that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixType {
    LearnedReplay,
    Database,
    Validation,
    Service,
    Import,
    Route,
    LlmFallback,
}

impl fmt::Display for FixType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FixType::LearnedReplay => "learned_replay",
            FixType::Database => "database",
            FixType::Validation => "validation",
            FixType::Service => "service",
            FixType::Import => "import",
            FixType::Route => "route",
            FixType::LlmFallback => "llm_fallback",
        };
        f.write_str(s)
    }
}

/// A structured code patch proposed by a strategy.
#[derive(Debug, Clone)]
pub struct RepairFix {
    pub file_path: String,
    pub fix_type: FixType,
    pub description: String,
    /// Full post-fix content of the file
    pub new_content: String,
    /// Whether the strategy considers the fix applicable; `false` means
    /// the orchestrator should fall through to the next strategy
    pub success: bool,
    /// The IR-level meaning of the fix, for backpropagation
    pub realignment: Option<IrRealignment>,
}

/// Everything a strategy may consult. The IR is read-only here; only the
/// backpropagator writes it.
pub struct RepairContext<'a> {
    pub ir: &'a ApplicationIr,
    pub behavior: &'a BehaviorIr,
    pub manifest: &'a GenerationManifest,
    pub app_dir: &'a Path,
    pub learning: Option<&'a LearningStore>,
    pub llm: Arc<dyn LlmClient>,
    pub llm_deadline: Duration,
    pub execution_mode: ExecutionMode,
    pub strict_mode: bool,
}

impl RepairContext<'_> {
    fn read(&self, rel_path: &str) -> Option<String> {
        std::fs::read_to_string(self.app_dir.join(rel_path)).ok()
    }
}

/// Canonical error signature shared with the learning store.
pub fn error_signature(violation: &Violation, class: ErrorClass) -> String {
    format!(
        "{}|{}|{}",
        bridge::normalize_endpoint(&violation.endpoint),
        class,
        violation.exception_class.as_deref().unwrap_or("-")
    )
}

/// The strategy variants, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStrategy {
    LearnedReplay,
    Database,
    Validation,
    Service,
    Import,
    Route,
    LlmFallback,
}

impl RepairStrategy {
    /// Fixed try order.
    pub const ORDERED: [RepairStrategy; 7] = [
        RepairStrategy::LearnedReplay,
        RepairStrategy::Database,
        RepairStrategy::Validation,
        RepairStrategy::Service,
        RepairStrategy::Import,
        RepairStrategy::Route,
        RepairStrategy::LlmFallback,
    ];

    pub fn fix_type(self) -> FixType {
        match self {
            RepairStrategy::LearnedReplay => FixType::LearnedReplay,
            RepairStrategy::Database => FixType::Database,
            RepairStrategy::Validation => FixType::Validation,
            RepairStrategy::Service => FixType::Service,
            RepairStrategy::Import => FixType::Import,
            RepairStrategy::Route => FixType::Route,
            RepairStrategy::LlmFallback => FixType::LlmFallback,
        }
    }

    /// Whether this strategy is worth asking for a proposal.
    pub fn applies_to(
        self,
        violation: &Violation,
        classification: &Classification,
        ctx: &RepairContext<'_>,
    ) -> bool {
        match self {
            RepairStrategy::LearnedReplay => {
                let signature = error_signature(violation, classification.class);
                ctx.learning
                    .is_some_and(|store| store.fix_for(&signature).is_some())
            }
            RepairStrategy::Database => classification.class == ErrorClass::Database,
            RepairStrategy::Validation => classification.class == ErrorClass::Validation,
            RepairStrategy::Service => classification.class == ErrorClass::Service,
            RepairStrategy::Import => classification.class == ErrorClass::Import,
            RepairStrategy::Route => classification.class == ErrorClass::Route,
            // The generic fallback takes anything, except when the LLM
            // stratum is disabled outright.
            RepairStrategy::LlmFallback => ctx.execution_mode != ExecutionMode::Safe,
        }
    }

    /// Produce a structured patch, or nothing.
    pub async fn propose_fix(
        self,
        violation: &Violation,
        chain: &CausalChain,
        classification: &Classification,
        ctx: &RepairContext<'_>,
    ) -> Option<RepairFix> {
        match self {
            RepairStrategy::LearnedReplay => propose_replay(violation, chain, classification, ctx),
            RepairStrategy::Database => propose_database(violation, chain, classification, ctx),
            RepairStrategy::Validation => propose_validation(chain, ctx),
            RepairStrategy::Service => propose_service(violation, chain, ctx),
            RepairStrategy::Import => propose_import(violation, chain, ctx),
            RepairStrategy::Route => propose_route(violation, ctx),
            RepairStrategy::LlmFallback => {
                propose_llm_fallback(violation, chain, classification, ctx).await
            }
        }
    }

    /// Apply a proposed fix to the tree (atomic write).
    pub fn apply_fix(fix: &RepairFix, app_dir: &Path) -> std::io::Result<()> {
        crate::emitter::write_atomic(app_dir, &fix.file_path, &fix.new_content)
    }

    /// Record the post-smoke outcome of an applied fix.
    pub fn record_outcome(
        violation_signature: &str,
        fix: &RepairFix,
        success: bool,
        learning: Option<&LearningStore>,
    ) {
        if let Some(store) = learning {
            if let Err(e) = store.record_fix_outcome(
                violation_signature,
                &fix.fix_type.to_string(),
                &fix.new_content,
                success,
            ) {
                warn!(error = %e, "failed to record fix outcome");
            }
        }
    }
}

// ============================================================================
// 1. Learned-pattern replay
// ============================================================================

fn propose_replay(
    violation: &Violation,
    chain: &CausalChain,
    classification: &Classification,
    ctx: &RepairContext<'_>,
) -> Option<RepairFix> {
    let store = ctx.learning?;
    let signature = error_signature(violation, classification.class);
    let pattern = store.fix_for(&signature)?;

    // Under strict_mode, patterns whose endpoint does not exist in the
    // unenriched API model never replay.
    if ctx.strict_mode {
        let endpoint = signature.split('|').next().unwrap_or_default();
        if !ctx.ir.api.declares_path(endpoint) {
            debug!(signature = %signature, "replay filtered by strict_mode");
            return None;
        }
    }

    let file_path = chain.file.clone()?;
    // The stored correct pattern applies verbatim when it targets the same
    // kind of file.
    if pattern.template.is_empty() {
        return None;
    }
    Some(RepairFix {
        file_path,
        fix_type: FixType::LearnedReplay,
        description: format!(
            "replayed stored fix for '{signature}' (success rate {:.2})",
            pattern.success_rate
        ),
        new_content: pattern.template,
        success: true,
        realignment: None,
    })
}

// ============================================================================
// 2. Database
// ============================================================================

fn propose_database(
    violation: &Violation,
    chain: &CausalChain,
    classification: &Classification,
    ctx: &RepairContext<'_>,
) -> Option<RepairFix> {
    let evidence = format!("{}\n{}", violation.body, violation.server_log);
    let column = offending_column(&evidence)?;

    let entity = classification
        .entities
        .iter()
        .find(|e| ctx.ir.field(e, &column).is_some())
        .cloned()
        .or_else(|| {
            ctx.ir
                .domain
                .entities
                .iter()
                .find(|e| e.field(&column).is_some())
                .map(|e| e.name.clone())
        })?;
    let field = ctx.ir.field(&entity, &column)?;

    if field.nullable || field.default.is_some() {
        // The IR says the column is optional; the emitted ORM definition
        // disagrees. Rebuild the model module from the IR.
        return Some(RepairFix {
            file_path: "src/models/entities.py".to_string(),
            fix_type: FixType::Database,
            description: format!("rebuilt ORM definition of {entity}.{column} from the IR"),
            new_content: ast_gen::entities_file(ctx.ir),
            success: true,
            realignment: None,
        });
    }

    if let Some(fk) = &field.foreign_key {
        // Required FK with a missing target object: precede the operation
        // with an existence check that answers 404.
        let routes_path = format!(
            "src/routes/{}_routes.py",
            normalize::to_snake_case(&entity)
        );
        let content = ctx.read(&routes_path)?;
        let op_id = chain.operation_id.as_deref().or_else(|| {
            ctx.ir
                .api
                .endpoints
                .iter()
                .find(|e| e.path == violation.endpoint && e.method == violation.method)
                .map(|e| e.operation_id.as_str())
        })?;
        let guarded = inject_fk_guard(&content, op_id, &field.name, &fk.entity)?;
        return Some(RepairFix {
            file_path: routes_path,
            fix_type: FixType::Database,
            description: format!(
                "injected 404 existence check for {}.{} before {op_id}",
                entity, field.name
            ),
            new_content: guarded,
            success: true,
            realignment: chain.flow.as_ref().map(|flow| IrRealignment::FlowPrecondition {
                flow: flow.clone(),
                predicate: format!("{}.id exists", fk.entity),
            }),
        });
    }

    None
}

/// Pull the offending column name out of a database error message.
/// Understands the postgres (`null value in column "x"`) and sqlite
/// (`NOT NULL constraint failed: orders.x`) shapes.
fn offending_column(evidence: &str) -> Option<String> {
    if let Some(idx) = evidence.find("null value in column") {
        let rest = &evidence[idx..];
        let start = rest.find('"')? + 1;
        let end = rest[start..].find('"')? + start;
        return Some(rest[start..end].to_string());
    }
    if let Some(idx) = evidence.find("constraint failed:") {
        let rest = evidence[idx + "constraint failed:".len()..].trim_start();
        let token = rest.split(|c: char| c.is_whitespace() || c == ',').next()?;
        let column = token.rsplit('.').next()?;
        if !column.is_empty() {
            return Some(column.trim().to_string());
        }
    }
    // Generic `column "x"` mention.
    if let Some(idx) = evidence.find("column \"") {
        let rest = &evidence[idx + "column \"".len()..];
        let end = rest.find('"')?;
        return Some(rest[..end].to_string());
    }
    None
}

/// Insert an FK existence guard at the top of a route handler body and
/// make sure the target entity is imported.
fn inject_fk_guard(content: &str, op_id: &str, fk_field: &str, fk_entity: &str) -> Option<String> {
    let def_marker = format!("def {op_id}(");
    let guard = format!(
        "    if session.get({fk_entity}, payload.{fk_field}) is None:\n        raise HTTPException(status_code=404, detail=\"{} not found\")\n",
        normalize::to_snake_case(fk_entity)
    );
    if content.contains(&guard) {
        return None;
    }

    let mut out = String::with_capacity(content.len() + guard.len());
    let mut injected = false;
    let mut in_signature = false;
    for line in content.lines() {
        // Extend the entities import if the FK target is missing from it.
        if line.starts_with("from src.models.entities import") && !line.contains(fk_entity) {
            out.push_str(line);
            out.push_str(", ");
            out.push_str(fk_entity);
            out.push('\n');
            continue;
        }
        out.push_str(line);
        out.push('\n');
        if injected {
            continue;
        }
        let signature_closes = line.trim_end().ends_with(':');
        if line.trim_start().starts_with(&def_marker) {
            if signature_closes {
                out.push_str(&guard);
                injected = true;
            } else {
                in_signature = true;
            }
        } else if in_signature && signature_closes {
            out.push_str(&guard);
            injected = true;
            in_signature = false;
        }
    }
    injected.then_some(out)
}

// ============================================================================
// 3. Validation
// ============================================================================

fn propose_validation(chain: &CausalChain, ctx: &RepairContext<'_>) -> Option<RepairFix> {
    // The schema module is rebuilt from the IR's FieldConstraints; a full
    // regeneration cannot invalidate other fields the way a hand-written
    // single-line patch could.
    let description = match &chain.constraint_key {
        Some(key) => format!("rebuilt schema field for constraint '{key}' from the IR"),
        None => "rebuilt request/response schemas from the IR".to_string(),
    };
    Some(RepairFix {
        file_path: "src/models/schemas.py".to_string(),
        fix_type: FixType::Validation,
        description,
        new_content: ast_gen::schemas_file(ctx.ir),
        success: true,
        realignment: None,
    })
}

// ============================================================================
// 4. Service
// ============================================================================

fn propose_service(
    violation: &Violation,
    chain: &CausalChain,
    ctx: &RepairContext<'_>,
) -> Option<RepairFix> {
    let evidence = format!("{}\n{}", violation.body, violation.server_log);

    // Resolve the target service class from the exception message in
    // preference to the endpoint path: the path may belong to another
    // entity's router while the failing attribute lives elsewhere.
    let (service_entity, missing_method) = match service_from_exception(&evidence) {
        Some(pair) => pair,
        None => {
            let flow = chain.flow.clone()?;
            let behavior = ctx.behavior.flow(&flow)?;
            (ast_gen::workflow_subject(behavior, ctx.ir), flow)
        }
    };

    let behavior = ctx.behavior.flow(&missing_method)?;
    let method = ast_gen::emit_workflow_method(behavior, ctx.ir);

    let service_path = format!(
        "src/services/{}_service.py",
        normalize::to_snake_case(&service_entity)
    );
    let new_content = match ctx.read(&service_path) {
        Some(existing) if existing.contains(&format!("def {missing_method}(")) => {
            // The method exists but misbehaves; replace the file's method by
            // appending a corrected override is not an option in Python, so
            // fall through to the LLM strategy.
            return None;
        }
        Some(existing) => format!("{existing}\n{method}"),
        None => format!(
            "\"\"\"Business logic for {service_entity}.\"\"\"\nimport uuid\n\nfrom sqlalchemy.orm import Session\n\nfrom src.models.entities import *  # noqa: F403\n\n\nclass {service_entity}Service:\n    def __init__(self, session: Session):\n        self.session = session\n\n{method}"
        ),
    };

    Some(RepairFix {
        file_path: service_path,
        fix_type: FixType::Service,
        description: format!(
            "generated missing {service_entity}Service.{missing_method} from the flow's conditions"
        ),
        new_content,
        success: true,
        realignment: None,
    })
}

/// `'OrderService' object has no attribute 'pay_order'` → (Order, pay_order).
fn service_from_exception(evidence: &str) -> Option<(String, String)> {
    let idx = evidence.find("Service' object has no attribute")?;
    let before = &evidence[..idx];
    let class_start = before.rfind('\'')? + 1;
    let entity = before[class_start..].to_string();

    let after = &evidence[idx + "Service' object has no attribute".len()..];
    let method_start = after.find('\'')? + 1;
    let method_end = after[method_start..].find('\'')? + method_start;
    let method = after[method_start..method_end].to_string();
    if entity.is_empty() || method.is_empty() {
        None
    } else {
        Some((entity, method))
    }
}

// ============================================================================
// 5. Import
// ============================================================================

fn propose_import(
    violation: &Violation,
    chain: &CausalChain,
    ctx: &RepairContext<'_>,
) -> Option<RepairFix> {
    let evidence = format!("{}\n{}", violation.body, violation.server_log);

    if let Some(module) = between(&evidence, "No module named '", "'") {
        // A missing service module is recreated as a skeleton.
        let rel_path = format!("{}.py", module.replace('.', "/"));
        if rel_path.starts_with("src/services/") {
            let entity = module
                .rsplit('.')
                .next()?
                .strip_suffix("_service")
                .map(normalize::to_pascal_case)?;
            return Some(RepairFix {
                file_path: rel_path,
                fix_type: FixType::Import,
                description: format!("recreated missing module '{module}'"),
                new_content: format!(
                    "\"\"\"Business logic for {entity}.\"\"\"\nimport uuid\n\nfrom sqlalchemy.orm import Session\n\nfrom src.models.entities import *  # noqa: F403\n\n\nclass {entity}Service:\n    def __init__(self, session: Session):\n        self.session = session\n"
                ),
                success: true,
                realignment: None,
            });
        }
        return None;
    }

    if let (Some(name), Some(module)) = (
        between(&evidence, "cannot import name '", "'"),
        between(&evidence, "' from '", "'"),
    ) {
        let file_path = chain.file.clone()?;
        let content = ctx.read(&file_path)?;
        let import_line = format!("from {module} import {name}");
        if content.contains(&import_line) {
            return None;
        }
        let new_content = add_import(&content, &import_line);
        return Some(RepairFix {
            file_path,
            fix_type: FixType::Import,
            description: format!("added missing import '{import_line}'"),
            new_content,
            success: true,
            realignment: None,
        });
    }
    None
}

fn between<'a>(haystack: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let s = haystack.find(start)? + start.len();
    let e = haystack[s..].find(end)? + s;
    Some(&haystack[s..e])
}

fn add_import(content: &str, import_line: &str) -> String {
    let mut out = String::with_capacity(content.len() + import_line.len() + 1);
    let mut inserted = false;
    let mut last_import_seen = false;
    for line in content.lines() {
        let is_import = line.starts_with("import ") || line.starts_with("from ");
        if last_import_seen && !is_import && !inserted {
            out.push_str(import_line);
            out.push('\n');
            inserted = true;
        }
        last_import_seen = is_import || (last_import_seen && line.trim().is_empty());
        out.push_str(line);
        out.push('\n');
    }
    if !inserted {
        out.push_str(import_line);
        out.push('\n');
    }
    out
}

// ============================================================================
// 6. Route
// ============================================================================

fn propose_route(violation: &Violation, ctx: &RepairContext<'_>) -> Option<RepairFix> {
    let endpoint = ctx
        .ir
        .api
        .endpoints
        .iter()
        .find(|e| e.path == violation.endpoint && e.method == violation.method)?;
    let entity = ctx.ir.domain.entity(&endpoint.entity)?;
    let routes_path = format!(
        "src/routes/{}_routes.py",
        normalize::to_snake_case(&entity.name)
    );

    if ctx.read(&routes_path).is_none() {
        // The route module itself is missing: regenerate it from the IR.
        return Some(RepairFix {
            file_path: routes_path,
            fix_type: FixType::Route,
            description: format!("recreated missing route module for {}", entity.name),
            new_content: ast_gen::routes_file(ctx.ir, entity),
            success: true,
            realignment: None,
        });
    }

    // The module exists but the router is not registered: rebuild the
    // bootstrap, which wires every router the API model declares.
    Some(RepairFix {
        file_path: "src/main.py".to_string(),
        fix_type: FixType::Route,
        description: format!(
            "re-registered routers in the bootstrap (missing {} {})",
            violation.method, violation.endpoint
        ),
        new_content: ast_gen::main_file(ctx.ir),
        success: true,
        realignment: None,
    })
}

// ============================================================================
// 7. LLM fallback
// ============================================================================

#[derive(Deserialize)]
struct LlmPatch {
    file: String,
    #[serde(default)]
    slot: Option<String>,
    body: String,
}

async fn propose_llm_fallback(
    violation: &Violation,
    chain: &CausalChain,
    classification: &Classification,
    ctx: &RepairContext<'_>,
) -> Option<RepairFix> {
    let file_path = chain
        .file
        .clone()
        .or_else(|| {
            chain.flow.as_ref().map(|flow| {
                let behavior = ctx.behavior.flow(flow);
                let entity = behavior
                    .map(|b| ast_gen::workflow_subject(b, ctx.ir))
                    .unwrap_or_default();
                format!("src/services/{}_service.py", normalize::to_snake_case(&entity))
            })
        })?;
    let file_content = ctx.read(&file_path)?;

    let warnings: Vec<String> = ctx
        .learning
        .map(|store| {
            store
                .patterns_for_flow(
                    chain.flow.as_deref().unwrap_or(&violation.scenario),
                    1,
                    5,
                )
                .iter()
                .map(GenerationAntiPattern::prompt_block)
                .collect()
        })
        .unwrap_or_default();

    let flow_context = chain
        .flow
        .as_ref()
        .and_then(|f| ctx.behavior.flow(f))
        .map(|b| serde_json::to_string_pretty(b).unwrap_or_default())
        .unwrap_or_default();

    let prompt = format!(
        "{warnings}\n\nThe deployed service failed a smoke scenario.\n\
         Endpoint: {method} {endpoint}\nExpected {expected}, got {actual} ({class}).\n\
         Server evidence:\n{log}\n\nOffending file `{file_path}`:\n```python\n{file_content}\n```\n\
         Flow context:\n{flow_context}\n\n\
         Respond with JSON only: {{\"file\": \"<path>\", \"slot\": \"<slot name or null>\", \
         \"body\": \"<replacement slot body>\"}}. You may only rewrite the body of a declared \
         LLM_SLOT region.",
        warnings = warnings.join("\n"),
        method = violation.method,
        endpoint = violation.endpoint,
        expected = violation.expected_status,
        actual = violation.actual_status,
        class = classification.class,
        log = violation.server_log,
    );

    let mut request = LlmRequest::new(
        "You repair generated Python services. Respond with a single JSON object.",
        prompt,
    );
    request.deadline = ctx.llm_deadline;
    let response = ctx.llm.complete(request).await.ok()?;

    let text = response.text.trim();
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text)
        .trim_end_matches("```")
        .trim();
    let patch: LlmPatch = serde_json::from_str(text).ok()?;

    // Template protection: a patch against a protected path is refused and
    // remembered as a high-severity anti-pattern. No file is modified.
    if stratum::is_template_protected(&patch.file) {
        warn!(path = %patch.file, "LLM patch rejected: template-protected path");
        if let Some(store) = ctx.learning {
            let _ = store.record_anti_pattern(GenerationAntiPattern {
                entity_pattern: classification
                    .entities
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "Unknown".to_string()),
                endpoint_pattern: bridge::normalize_endpoint(&violation.endpoint),
                wrong_snippet: format!("patch against protected path {}", patch.file),
                correct_snippet: "repairs must stay inside declared LLM slots".to_string(),
                severity: PatternSeverity::High,
                occurrence_count: 1,
                prevention_count: 0,
                error_message: violation.server_log.clone(),
            });
        }
        return Some(RepairFix {
            file_path: patch.file,
            fix_type: FixType::LlmFallback,
            description: "rejected: template-protected path".to_string(),
            new_content: String::new(),
            success: false,
            realignment: None,
        });
    }

    // Slot discipline: the patch must land inside a declared slot of the
    // file it targets.
    let slot_name = patch.slot.or_else(|| chain.flow.clone())?;
    let target_content = if patch.file == file_path {
        file_content
    } else {
        ctx.read(&patch.file)?
    };
    let all_slots = slots::find_slots(&target_content).ok()?;
    let slot = all_slots.iter().find(|s| s.name == slot_name)?;

    let constraints = slots::SlotConstraints::default();
    if let Err(slot_err) = slots::validate_body(slot, &patch.body, &constraints) {
        debug!(error = %slot_err, "LLM repair body rejected");
        return Some(RepairFix {
            file_path: patch.file,
            fix_type: FixType::LlmFallback,
            description: format!("rejected: {slot_err}"),
            new_content: String::new(),
            success: false,
            realignment: None,
        });
    }
    let new_content = slots::insert_body(&target_content, &slot_name, &patch.body).ok()?;

    Some(RepairFix {
        file_path: patch.file,
        fix_type: FixType::LlmFallback,
        description: format!("LLM rewrote slot '{slot_name}'"),
        new_content,
        success: true,
        realignment: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offending_column_postgres_and_sqlite() {
        assert_eq!(
            offending_column("null value in column \"customer_id\" violates not-null"),
            Some("customer_id".to_string())
        );
        assert_eq!(
            offending_column("NOT NULL constraint failed: orders.customer_id"),
            Some("customer_id".to_string())
        );
        assert_eq!(offending_column("nothing to see"), None);
    }

    #[test]
    fn test_service_resolution_prefers_exception_message() {
        let (entity, method) = service_from_exception(
            "'CartService' object has no attribute 'add_item_to_cart'",
        )
        .expect("parsed");
        assert_eq!(entity, "Cart");
        assert_eq!(method, "add_item_to_cart");
    }

    #[test]
    fn test_inject_fk_guard_adds_check_and_import() {
        let content = "\
from src.models.entities import Order
from src.repositories.order_repository import OrderRepository

router = APIRouter()


@router.post(\"/orders\", status_code=201, response_model=OrderRead)
def create_order(payload: OrderCreate, session: Session = Depends(get_session)) -> OrderRead:
    obj = OrderRepository(session).create(payload.model_dump(exclude_unset=True))
    session.commit()
    return obj
";
        let guarded =
            inject_fk_guard(content, "create_order", "customer_id", "Customer").expect("guard");
        assert!(guarded.contains("from src.models.entities import Order, Customer"));
        assert!(guarded.contains("if session.get(Customer, payload.customer_id) is None:"));
        let guard_pos = guarded.find("session.get(Customer").expect("guard pos");
        let create_pos = guarded.find("OrderRepository(session).create").expect("create pos");
        assert!(guard_pos < create_pos, "guard precedes the mutation");
    }

    #[test]
    fn test_add_import_after_import_block() {
        let content = "import uuid\nfrom x import y\n\nrouter = 1\n";
        let updated = add_import(content, "from a import B");
        let idx_new = updated.find("from a import B").expect("import added");
        let idx_router = updated.find("router = 1").expect("router");
        assert!(idx_new < idx_router);
    }
}
