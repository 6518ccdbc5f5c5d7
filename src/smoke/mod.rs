//! # Smoke Runner
//!
//! Executes the generated application against a TestsIR: a scenario set
//! derived deterministically from the API and behavior models - one
//! happy-path and one validation-error scenario per endpoint, plus one
//! end-to-end scenario per flow. Scenarios are generated, never written by
//! hand.
//!
//! Execution respects dependencies (child operations run only after their
//! parent scenario passed), runs independent read-only scenarios
//! concurrently under a cap, and serializes mutating scenarios that share
//! fixture state. Each failing scenario yields a structured violation with
//! the HTTP evidence, the parsed stack trace, and the flow that generated
//! it.

pub mod fixtures;

use crate::cancel::CancelToken;
use crate::ir::{ApplicationIr, HttpMethod, SemanticType, ValidationType};
use crate::learning::bridge::extract_exception_class;
use async_trait::async_trait;
use fixtures::FixtureSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-scenario deadline.
pub const SCENARIO_DEADLINE: Duration = Duration::from_secs(30);

/// What a scenario checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    HappyPath,
    ValidationError,
    EndToEnd,
}

/// One generated scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub kind: ScenarioKind,
    pub method: HttpMethod,
    /// Concrete path with fixture ids substituted
    pub path: String,
    /// Canonical endpoint path, for IR attribution
    pub endpoint_path: String,
    #[serde(default)]
    pub payload: Option<Value>,
    pub expected_status: u16,
    /// Scenario that must pass before this one may run
    #[serde(default)]
    pub depends_on: Option<String>,
    pub mutating: bool,
    /// Flow that generated this scenario, if any
    #[serde(default)]
    pub flow_id: Option<String>,
    /// Entities the scenario touches; the delta validator filters on these
    #[serde(default)]
    pub entities: Vec<String>,
}

/// The deterministically generated scenario set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestsIr {
    pub scenarios: Vec<Scenario>,
    pub fixtures: FixtureSet,
}

/// A parsed stack frame from server logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    pub function: String,
}

/// One failed scenario with its evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub endpoint: String,
    pub method: HttpMethod,
    pub scenario: String,
    pub expected_status: u16,
    pub actual_status: u16,
    /// Coarse failure category from the runner's perspective
    pub error_type: String,
    #[serde(default)]
    pub exception_class: Option<String>,
    #[serde(default)]
    pub stack_trace: Vec<StackFrame>,
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub server_log: String,
    /// Database snapshots around a failed mutating scenario, when the
    /// executor can capture them
    #[serde(default)]
    pub db_before: Option<String>,
    #[serde(default)]
    pub db_after: Option<String>,
}

impl Violation {
    /// Canonical key for per-violation repair budgets.
    pub fn budget_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.endpoint,
            self.error_type,
            self.exception_class.as_deref().unwrap_or("-")
        )
    }
}

/// The runner's structured output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmokeResult {
    pub scenarios_total: usize,
    pub scenarios_passed: usize,
    pub scenarios_skipped: usize,
    pub pass_rate: f64,
    pub violations: Vec<Violation>,
    pub server_logs: String,
    pub fixture_snapshot: FixtureSet,
}

impl SmokeResult {
    /// Whether a golden-path flow failed; the repair loop fail-fasts on it.
    pub fn golden_failure(&self, ir: &ApplicationIr) -> bool {
        self.violations.iter().any(|v| {
            v.flow_id
                .as_deref()
                .and_then(|f| ir.behavior.flow(f))
                .is_some_and(|f| f.golden)
        })
    }
}

/// What actually happened when a scenario ran.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: u16,
    pub body: String,
    /// Server log captured around the call, if the executor can see it
    pub server_log: String,
}

/// The seam between scenario generation and the deployed service. The HTTP
/// implementation talks to the real deployment; tests script outcomes.
#[async_trait]
pub trait ScenarioExecutor: Send + Sync {
    async fn execute(&self, scenario: &Scenario) -> Result<ExecutionOutcome, String>;

    /// Drain any server logs accumulated since the last call.
    async fn drain_logs(&self) -> String {
        String::new()
    }

    /// A database snapshot, when the executor can take one. Captured before
    /// and after each mutating scenario and attached to its violation.
    async fn snapshot(&self) -> Option<String> {
        None
    }
}

/// reqwest-based executor against a live base URL.
pub struct HttpExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpExecutor {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpExecutor {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ScenarioExecutor for HttpExecutor {
    async fn execute(&self, scenario: &Scenario) -> Result<ExecutionOutcome, String> {
        let url = format!("{}{}", self.base_url, scenario.path);
        let mut request = match scenario.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Patch => self.client.patch(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };
        if let Some(payload) = &scenario.payload {
            request = request.json(payload);
        }

        let send = async {
            let response = request.send().await.map_err(|e| e.to_string())?;
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Ok(ExecutionOutcome {
                status,
                body,
                server_log: String::new(),
            })
        };
        tokio::time::timeout(SCENARIO_DEADLINE, send)
            .await
            .map_err(|_| format!("scenario '{}' timed out", scenario.name))?
    }
}

// ============================================================================
// Scenario generation
// ============================================================================

impl TestsIr {
    /// Generate the scenario set for an IR. Deterministic: same IR, same
    /// scenarios in the same order.
    pub fn generate(ir: &ApplicationIr) -> Self {
        let fixtures = FixtureSet::build(ir);
        let mut reads: Vec<Scenario> = Vec::new();
        let mut creates: Vec<Scenario> = Vec::new();
        let mut validations: Vec<Scenario> = Vec::new();
        let mut flows: Vec<Scenario> = Vec::new();
        let mut deletes: Vec<Scenario> = Vec::new();

        for ep in &ir.api.endpoints {
            let entity = ir.domain.entity(&ep.entity);
            let entities = vec![ep.entity.clone()];

            match (ep.method, ep.flow.as_deref()) {
                (_, Some(flow_name)) => {
                    // End-to-end flow scenario; subject id from fixtures.
                    let path = substitute_ids(&ep.path, &ep.entity, ir, &fixtures, false);
                    flows.push(Scenario {
                        name: format!("e2e_{flow_name}"),
                        kind: ScenarioKind::EndToEnd,
                        method: ep.method,
                        path,
                        endpoint_path: ep.path.clone(),
                        payload: None,
                        expected_status: 200,
                        depends_on: None,
                        mutating: true,
                        flow_id: Some(flow_name.to_string()),
                        entities: ir
                            .behavior
                            .flow(flow_name)
                            .map(|f| f.entities().iter().map(|e| (*e).to_string()).collect())
                            .unwrap_or(entities),
                    });
                }
                (HttpMethod::Get, None) => {
                    let path = substitute_ids(&ep.path, &ep.entity, ir, &fixtures, false);
                    reads.push(Scenario {
                        name: format!("happy_{}", ep.operation_id),
                        kind: ScenarioKind::HappyPath,
                        method: HttpMethod::Get,
                        path,
                        endpoint_path: ep.path.clone(),
                        payload: None,
                        expected_status: 200,
                        depends_on: None,
                        mutating: false,
                        flow_id: None,
                        entities,
                    });
                }
                (HttpMethod::Post, None) => {
                    let Some(entity) = entity else { continue };
                    let nested = ep.is_nested();
                    let payload = {
                        let mut map = fixtures::create_payload(entity, &fixtures);
                        if nested {
                            // The parent id travels in the path, not the body.
                            for (field, _) in entity.foreign_keys() {
                                map.remove(&field.name);
                            }
                        }
                        Value::Object(map)
                    };
                    let path = substitute_ids(&ep.path, &ep.entity, ir, &fixtures, false);
                    creates.push(Scenario {
                        name: format!("happy_{}", ep.operation_id),
                        kind: ScenarioKind::HappyPath,
                        method: HttpMethod::Post,
                        path,
                        endpoint_path: ep.path.clone(),
                        payload: Some(payload),
                        expected_status: 201,
                        depends_on: None,
                        mutating: true,
                        flow_id: None,
                        entities: entities.clone(),
                    });

                    if let Some(invalid) = invalid_payload(entity, &fixtures, nested) {
                        validations.push(Scenario {
                            name: format!("invalid_{}", ep.operation_id),
                            kind: ScenarioKind::ValidationError,
                            method: HttpMethod::Post,
                            path: substitute_ids(&ep.path, &ep.entity, ir, &fixtures, false),
                            endpoint_path: ep.path.clone(),
                            payload: Some(invalid),
                            expected_status: 422,
                            depends_on: None,
                            mutating: false,
                            flow_id: None,
                            entities,
                        });
                    }
                }
                (HttpMethod::Put | HttpMethod::Patch, None) => {
                    let Some(entity) = entity else { continue };
                    // FK-only entities have no update surface.
                    if entity.fk_only() {
                        continue;
                    }
                    let updatable = entity
                        .fields
                        .iter()
                        .find(|f| f.name != "id" && f.foreign_key.is_none());
                    let Some(field) = updatable else { continue };
                    let path = substitute_ids(&ep.path, &ep.entity, ir, &fixtures, false);
                    let mut update_map = serde_json::Map::new();
                    update_map.insert(field.name.clone(), fixtures::sample_value(field));
                    creates.push(Scenario {
                        name: format!("happy_{}", ep.operation_id),
                        kind: ScenarioKind::HappyPath,
                        method: ep.method,
                        path,
                        endpoint_path: ep.path.clone(),
                        payload: Some(Value::Object(update_map)),
                        expected_status: 200,
                        depends_on: None,
                        mutating: true,
                        flow_id: None,
                        entities,
                    });
                }
                (HttpMethod::Delete, None) => {
                    if ep.is_nested() {
                        // Mismatched parent/child pair must 404; matched pair 204.
                        let mismatched = substitute_ids(&ep.path, &ep.entity, ir, &fixtures, true);
                        validations.push(Scenario {
                            name: format!("mismatch_{}", ep.operation_id),
                            kind: ScenarioKind::ValidationError,
                            method: HttpMethod::Delete,
                            path: mismatched,
                            endpoint_path: ep.path.clone(),
                            payload: None,
                            expected_status: 404,
                            depends_on: None,
                            mutating: false,
                            flow_id: None,
                            entities: entities.clone(),
                        });
                    }
                    let path = substitute_ids(&ep.path, &ep.entity, ir, &fixtures, false);
                    deletes.push(Scenario {
                        name: format!("happy_{}", ep.operation_id),
                        kind: ScenarioKind::HappyPath,
                        method: HttpMethod::Delete,
                        path,
                        endpoint_path: ep.path.clone(),
                        payload: None,
                        expected_status: 204,
                        depends_on: None,
                        mutating: true,
                        flow_id: None,
                        entities,
                    });
                }
            }
        }

        // Children delete before parents so FK constraints hold.
        deletes.sort_by_key(|s| {
            std::cmp::Reverse(
                s.entities
                    .first()
                    .and_then(|e| {
                        ir.domain
                            .topological_order()
                            .iter()
                            .position(|entity| entity.name == *e)
                    })
                    .unwrap_or(0),
            )
        });

        let mut scenarios = reads;
        scenarios.extend(creates);
        scenarios.extend(validations);
        scenarios.extend(flows);
        scenarios.extend(deletes);

        TestsIr {
            scenarios,
            fixtures,
        }
    }
}

/// Substitute `{...}` placeholders with fixture ids, left to right: the
/// first placeholder takes the path's root resource id, later ones the
/// endpoint entity's id. `mismatch` swaps the final id for one that exists
/// nowhere, producing the 404 pair scenario.
fn substitute_ids(
    path: &str,
    endpoint_entity: &str,
    ir: &ApplicationIr,
    fixtures: &FixtureSet,
    mismatch: bool,
) -> String {
    let placeholder_count = path.matches('{').count();
    let mut seen = 0usize;
    let segments: Vec<String> = path
        .split('/')
        .map(|seg| {
            if !(seg.starts_with('{') && seg.ends_with('}')) {
                return seg.to_string();
            }
            seen += 1;
            let is_last = seen == placeholder_count;
            if is_last && mismatch {
                return Uuid::new_v5(&Uuid::NAMESPACE_OID, b"mismatched-pair").to_string();
            }
            let entity = if is_last {
                endpoint_entity.to_string()
            } else {
                // Interior placeholder: the parent resource named by the
                // preceding segment, resolved through FK topology.
                parent_entity_for(path, endpoint_entity, ir)
            };
            fixtures
                .id_for(&entity)
                .map(|id| id.to_string())
                .unwrap_or_else(|| Uuid::nil().to_string())
        })
        .collect();
    segments.join("/")
}

fn parent_entity_for(path: &str, endpoint_entity: &str, ir: &ApplicationIr) -> String {
    let first_seg = path.split('/').find(|s| !s.is_empty()).unwrap_or_default();
    if let Some(entity) = ir.entity_for_segment(first_seg) {
        return entity.name.clone();
    }
    // Fall back to the child's FK target.
    ir.domain
        .entity(endpoint_entity)
        .and_then(|child| child.foreign_keys().next().map(|(_, fk)| fk.entity.clone()))
        .unwrap_or_else(|| endpoint_entity.to_string())
}

/// A payload with exactly one constraint-violating field, or None when the
/// entity has nothing to violate.
fn invalid_payload(
    entity: &crate::ir::Entity,
    fixtures: &FixtureSet,
    nested: bool,
) -> Option<Value> {
    let mut map = fixtures::create_payload(entity, fixtures);
    if nested {
        for (field, _) in entity.foreign_keys() {
            map.remove(&field.name);
        }
    }
    for field in &entity.fields {
        if field.name == "id" || field.foreign_key.is_some() {
            continue;
        }
        if let Some(bad) = fixtures::invalid_value(field) {
            map.insert(field.name.clone(), bad);
            return Some(Value::Object(map));
        }
    }
    // Entities whose create schema has required fields can at least omit one.
    let required: Vec<&crate::ir::Field> = entity
        .fields
        .iter()
        .filter(|f| f.name != "id" && f.required() && f.foreign_key.is_none())
        .collect();
    if let Some(field) = required.first() {
        if field.semantic_type != SemanticType::Boolean
            || field.constraint(ValidationType::Presence).is_some()
        {
            map.remove(&field.name);
            return Some(Value::Object(map));
        }
    }
    None
}

// ============================================================================
// Execution
// ============================================================================

/// The smoke runner. Holds the executor seam and the concurrency cap for
/// independent scenarios.
pub struct SmokeRunner {
    executor: Arc<dyn ScenarioExecutor>,
    concurrency: usize,
}

impl SmokeRunner {
    pub fn new(executor: Arc<dyn ScenarioExecutor>) -> Self {
        SmokeRunner {
            executor,
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run every scenario.
    pub async fn run(&self, tests: &TestsIr, cancel: &CancelToken) -> SmokeResult {
        self.run_filtered(tests, cancel, |_| true).await
    }

    /// Run the scenarios selected by `filter` (the delta validator narrows
    /// to the affected scope this way).
    pub async fn run_filtered(
        &self,
        tests: &TestsIr,
        cancel: &CancelToken,
        filter: impl Fn(&Scenario) -> bool,
    ) -> SmokeResult {
        let selected: Vec<&Scenario> = tests.scenarios.iter().filter(|s| filter(s)).collect();
        let mut passed_names: HashSet<String> = HashSet::new();
        let mut violations: Vec<Violation> = Vec::new();
        let mut server_logs = String::new();
        let mut passed = 0usize;
        let mut skipped = 0usize;

        // Read-only scenarios run concurrently under the cap; mutating ones
        // serialize because they share fixture state.
        let mut queue: Vec<&Scenario> = Vec::new();
        let mut waves: Vec<Vec<&Scenario>> = Vec::new();
        for &scenario in &selected {
            if scenario.mutating {
                waves.push(std::mem::take(&mut queue));
                waves.push(vec![scenario]);
            } else {
                queue.push(scenario);
            }
        }
        waves.push(queue);

        for wave in waves {
            if cancel.check().is_err() {
                warn!("smoke cancelled; remaining scenarios skipped");
                skipped += wave.len();
                continue;
            }
            // Mutating waves hold exactly one scenario; bracket it with DB
            // snapshots when the executor can take them.
            let mutating_wave = wave.len() == 1 && wave[0].mutating;
            let db_before = if mutating_wave {
                self.executor.snapshot().await
            } else {
                None
            };

            let outcomes = self.run_wave(&wave, &passed_names, cancel).await;
            for (scenario, outcome) in outcomes {
                match outcome {
                    WaveOutcome::Skipped => skipped += 1,
                    WaveOutcome::Passed => {
                        passed += 1;
                        passed_names.insert(scenario.name.clone());
                    }
                    WaveOutcome::Failed(mut violation) => {
                        if mutating_wave {
                            violation.db_before = db_before.clone();
                            violation.db_after = self.executor.snapshot().await;
                        }
                        if !violation.server_log.is_empty() {
                            server_logs.push_str(&violation.server_log);
                            server_logs.push('\n');
                        }
                        violations.push(violation);
                    }
                }
            }
        }

        let drained = self.executor.drain_logs().await;
        if !drained.is_empty() {
            server_logs.push_str(&drained);
        }

        let total = selected.len() - skipped;
        let pass_rate = if total == 0 {
            1.0
        } else {
            passed as f64 / total as f64
        };
        info!(
            total,
            passed,
            skipped,
            pass_rate = format!("{pass_rate:.2}"),
            violations = violations.len(),
            "smoke run complete"
        );

        SmokeResult {
            scenarios_total: total,
            scenarios_passed: passed,
            scenarios_skipped: skipped,
            pass_rate,
            violations,
            server_logs,
            fixture_snapshot: tests.fixtures.clone(),
        }
    }

    async fn run_wave<'a>(
        &self,
        wave: &[&'a Scenario],
        passed_names: &HashSet<String>,
        cancel: &CancelToken,
    ) -> Vec<(&'a Scenario, WaveOutcome)> {
        let mut results = Vec::with_capacity(wave.len());
        // Mutating waves have length one, so a plain loop serializes them;
        // read-only waves run concurrently up to the cap.
        for chunk in wave.chunks(self.concurrency.max(1)) {
            let mut join_set: tokio::task::JoinSet<(usize, Result<ExecutionOutcome, String>)> =
                tokio::task::JoinSet::new();
            for (idx, scenario) in chunk.iter().enumerate() {
                if cancel.is_cancelled() {
                    results.push((*scenario, WaveOutcome::Skipped));
                    continue;
                }
                if let Some(dep) = &scenario.depends_on {
                    if !passed_names.contains(dep) {
                        debug!(scenario = %scenario.name, dependency = %dep, "skipped: dependency failed");
                        results.push((*scenario, WaveOutcome::Skipped));
                        continue;
                    }
                }
                let executor = Arc::clone(&self.executor);
                let owned: Scenario = (*scenario).clone();
                join_set.spawn(async move { (idx, executor.execute(&owned).await) });
            }
            let mut outcomes: Vec<(usize, Result<ExecutionOutcome, String>)> = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(pair) => outcomes.push(pair),
                    Err(e) => warn!(error = %e, "scenario task failed"),
                }
            }
            outcomes.sort_by_key(|(idx, _)| *idx);
            for (idx, outcome) in outcomes {
                let scenario = chunk[idx];
                results.push((scenario, judge(scenario, outcome)));
            }
        }
        results
    }
}

enum WaveOutcome {
    Passed,
    Failed(Violation),
    Skipped,
}

/// Compare an execution outcome with the scenario's expectation.
fn judge(scenario: &Scenario, outcome: Result<ExecutionOutcome, String>) -> WaveOutcome {
    match outcome {
        Ok(outcome) if outcome.status == scenario.expected_status => WaveOutcome::Passed,
        Ok(outcome) => {
            let evidence = format!("{}\n{}", outcome.body, outcome.server_log);
            WaveOutcome::Failed(Violation {
                endpoint: scenario.endpoint_path.clone(),
                method: scenario.method,
                scenario: scenario.name.clone(),
                expected_status: scenario.expected_status,
                actual_status: outcome.status,
                error_type: categorize_status(outcome.status),
                exception_class: extract_exception_class(&evidence),
                stack_trace: parse_traceback(&outcome.server_log),
                flow_id: scenario.flow_id.clone(),
                body: outcome.body,
                server_log: outcome.server_log,
                db_before: None,
                db_after: None,
            })
        }
        Err(transport) => WaveOutcome::Failed(Violation {
            endpoint: scenario.endpoint_path.clone(),
            method: scenario.method,
            scenario: scenario.name.clone(),
            expected_status: scenario.expected_status,
            actual_status: 0,
            error_type: "connection".to_string(),
            exception_class: None,
            stack_trace: Vec::new(),
            flow_id: scenario.flow_id.clone(),
            body: String::new(),
            server_log: transport,
            db_before: None,
            db_after: None,
        }),
    }
}

fn categorize_status(status: u16) -> String {
    match status {
        500..=599 => "server_error".to_string(),
        422 => "validation_rejected".to_string(),
        404 => "not_found".to_string(),
        _ => "unexpected_status".to_string(),
    }
}

/// Parse Python traceback frames (`  File "x.py", line 12, in create`).
pub fn parse_traceback(log: &str) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    for line in log.lines() {
        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix("File \"") else {
            continue;
        };
        let Some((file, rest)) = rest.split_once('"') else {
            continue;
        };
        let Some(rest) = rest.strip_prefix(", line ") else {
            continue;
        };
        let (line_no, function) = match rest.split_once(", in ") {
            Some((n, f)) => (n, f.trim().to_string()),
            None => (rest.trim(), String::new()),
        };
        if let Ok(line_no) = line_no.trim().parse::<u32>() {
            frames.push(StackFrame {
                file: file.to_string(),
                line: line_no,
                function,
            });
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Endpoint, Entity, Field, ForeignKey, InferenceSource};
    use serde_json::json;

    fn field(name: &str, ty: SemanticType) -> Field {
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

    fn endpoint(method: HttpMethod, path: &str, op: &str, entity: &str) -> Endpoint {
        Endpoint {
            method,
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

    fn widget_ir() -> ApplicationIr {
        let mut ir = ApplicationIr::new("Shop");
        let mut name = field("name", SemanticType::String);
        name.constraints.push(crate::ir::FieldConstraint::new(
            ValidationType::LengthMin,
            crate::ir::ConstraintValue::Int(1),
        ));
        ir.domain.entities.push(Entity {
            name: "Widget".to_string(),
            fields: vec![field("id", SemanticType::Uuid), name],
        });
        ir.api
            .endpoints
            .push(endpoint(HttpMethod::Post, "/widgets", "create_widget", "Widget"));
        ir.api
            .endpoints
            .push(endpoint(HttpMethod::Get, "/widgets", "list_widgets", "Widget"));
        ir
    }

    #[test]
    fn test_happy_and_validation_scenarios_per_endpoint() {
        let tests = TestsIr::generate(&widget_ir());
        let names: Vec<&str> = tests.scenarios.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"happy_create_widget"));
        assert!(names.contains(&"invalid_create_widget"));
        assert!(names.contains(&"happy_list_widgets"));

        let invalid = tests
            .scenarios
            .iter()
            .find(|s| s.name == "invalid_create_widget")
            .expect("validation scenario");
        assert_eq!(invalid.expected_status, 422);
        let payload = invalid.payload.as_ref().expect("payload");
        assert_eq!(payload.get("name"), Some(&json!("")));
    }

    #[test]
    fn test_nested_delete_scenarios_pair() {
        let mut ir = ApplicationIr::new("Demo");
        ir.domain.entities.push(Entity {
            name: "Parent".to_string(),
            fields: vec![field("id", SemanticType::Uuid)],
        });
        ir.domain.entities.push(Entity {
            name: "Child".to_string(),
            fields: vec![field("id", SemanticType::Uuid), {
                let mut f = field("parent_id", SemanticType::Uuid);
                f.foreign_key = Some(ForeignKey {
                    entity: "Parent".to_string(),
                    field: "id".to_string(),
                });
                f
            }],
        });
        ir.api.endpoints.push(endpoint(
            HttpMethod::Delete,
            "/parents/{id}/childs/{id}",
            "delete_parent_child",
            "Child",
        ));

        let tests = TestsIr::generate(&ir);
        let mismatch = tests
            .scenarios
            .iter()
            .find(|s| s.name == "mismatch_delete_parent_child")
            .expect("mismatch scenario");
        assert_eq!(mismatch.expected_status, 404);

        let happy = tests
            .scenarios
            .iter()
            .find(|s| s.name == "happy_delete_parent_child")
            .expect("happy scenario");
        assert_eq!(happy.expected_status, 204);

        // The matched pair substitutes the seeded parent and child ids.
        let parent_id = tests.fixtures.id_for("Parent").expect("parent id").to_string();
        let child_id = tests.fixtures.id_for("Child").expect("child id").to_string();
        assert!(happy.path.contains(&parent_id));
        assert!(happy.path.contains(&child_id));
        // The mismatched pair keeps the parent but swaps the child.
        assert!(mismatch.path.contains(&parent_id));
        assert!(!mismatch.path.contains(&child_id));
    }

    #[test]
    fn test_fk_only_entity_gets_no_update_scenario() {
        let mut ir = ApplicationIr::new("Demo");
        ir.domain.entities.push(Entity {
            name: "Tag".to_string(),
            fields: vec![field("id", SemanticType::Uuid)],
        });
        ir.api
            .endpoints
            .push(endpoint(HttpMethod::Put, "/tags/{id}", "update_tag", "Tag"));

        let tests = TestsIr::generate(&ir);
        assert!(tests
            .scenarios
            .iter()
            .all(|s| s.name != "happy_update_tag"));
    }

    #[test]
    fn test_traceback_parsing() {
        let log = "Traceback (most recent call last):\n  File \"/app/src/services/cart_service.py\", line 42, in add_item_to_cart\n    cart.total += 1\nAttributeError: 'NoneType' object has no attribute 'total'\n";
        let frames = parse_traceback(log);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].file, "/app/src/services/cart_service.py");
        assert_eq!(frames[0].line, 42);
        assert_eq!(frames[0].function, "add_item_to_cart");
    }

    struct ScriptedExecutor {
        status: u16,
    }

    #[async_trait]
    impl ScenarioExecutor for ScriptedExecutor {
        async fn execute(&self, _scenario: &Scenario) -> Result<ExecutionOutcome, String> {
            Ok(ExecutionOutcome {
                status: self.status,
                body: String::new(),
                server_log: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_pass_rate_counts_only_executed() {
        let ir = widget_ir();
        let tests = TestsIr::generate(&ir);
        let runner = SmokeRunner::new(Arc::new(ScriptedExecutor { status: 200 }));
        let result = runner.run(&tests, &CancelToken::unbounded()).await;

        // GET passes with 200; POST expected 201 so it fails; the invalid
        // scenario expects 422 and fails too.
        assert_eq!(result.scenarios_total, 3);
        assert_eq!(result.scenarios_passed, 1);
        assert_eq!(result.violations.len(), 2);
        assert!((result.pass_rate - 1.0 / 3.0).abs() < 1e-9);
    }
}
