//! # Application IR
//!
//! The typed intermediate representation of a target application. The IR is
//! the single source of truth after lowering: no generator, validator, or
//! repair step reads spec text once an `ApplicationIr` has been accepted.
//!
//! ## Sub-models
//!
//! | Sub-model | Content |
//! |-----------|---------|
//! | `DomainModel` | entities, fields, normalized field constraints |
//! | `ApiModel` | endpoints with canonical `{id}` paths |
//! | `BehaviorModel` | ordered flows (guards, pre/postconditions, steps) |
//! | `ValidationModel` | constraint rules keyed `{entity}.{field}.{type}` |
//! | `InfrastructureModel` | database, runtime, ports, health checks |
//!
//! All identifiers are canonical: snake_case for fields, PascalCase for
//! entities. `ApplicationIr::validate` enforces the cross-model invariants
//! and is the acceptance gate after lowering.

pub mod constraint_graph;

pub use constraint_graph::ConstraintGraph;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Current IR schema version. Cached IRs with a different version are
/// rejected with `IrError::SchemaDrift`.
pub const IR_SCHEMA_VERSION: u32 = 3;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while constructing or validating an `ApplicationIr`.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum IrError {
    /// Entity name is not canonical PascalCase
    #[error("entity name '{name}' is not canonical PascalCase")]
    NonCanonicalEntity { name: String },

    /// Field name is not canonical snake_case
    #[error("field name '{entity}.{field}' is not canonical snake_case")]
    NonCanonicalField { entity: String, field: String },

    /// Duplicate field within an entity
    #[error("duplicate field '{field}' in entity '{entity}'")]
    DuplicateField { entity: String, field: String },

    /// Foreign key references a missing entity
    #[error("field '{entity}.{field}' references unknown entity '{target}'")]
    DanglingForeignKey {
        entity: String,
        field: String,
        target: String,
    },

    /// Duplicate operation id in the API model
    #[error("duplicate operation id '{operation_id}'")]
    DuplicateOperationId { operation_id: String },

    /// Endpoint references a schema that does not exist
    #[error("endpoint '{operation_id}' references unknown schema '{schema}'")]
    UnknownSchema {
        operation_id: String,
        schema: String,
    },

    /// Nested endpoint without a verified FK relationship to its parent
    #[error("nested endpoint '{path}' has no FK relationship from '{child}' to '{parent}'")]
    UnverifiedNesting {
        path: String,
        parent: String,
        child: String,
    },

    /// Flow references an entity, field, or status missing from the domain
    #[error("flow '{flow}' references unknown {kind} '{name}'")]
    UnknownFlowReference {
        flow: String,
        kind: String,
        name: String,
    },

    /// Two constraint rules share a key with different values
    #[error("conflicting constraint rules for key '{key}'")]
    ConflictingRules { key: String },

    /// Port collision in the infrastructure model
    #[error("port {port} assigned to both '{first}' and '{second}'")]
    PortCollision {
        port: u16,
        first: String,
        second: String,
    },

    /// Cached IR schema version mismatch
    #[error("IR schema version {found} does not match current version {current}")]
    SchemaDrift { found: u32, current: u32 },
}

// ============================================================================
// Domain model
// ============================================================================

/// Semantic type of a field, independent of any target ORM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Uuid,
    String,
    Text,
    Integer,
    Float,
    Decimal,
    Boolean,
    DateTime,
    Enum,
}

impl SemanticType {
    /// Whether range constraints make sense for the type.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            SemanticType::Integer | SemanticType::Float | SemanticType::Decimal
        )
    }
}

/// Canonical constraint kinds. Shared by emission and compliance so both
/// sides match constraints under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationType {
    RangeMin,
    RangeMax,
    Pattern,
    LengthMin,
    LengthMax,
    Presence,
    Uniqueness,
    FormatEmail,
    FormatUuid,
    FormatDateTime,
    Enumeration,
}

impl ValidationType {
    /// Canonical lowercase name, used in `{entity}.{field}.{constraint_type}` keys.
    pub fn key_name(self) -> &'static str {
        match self {
            ValidationType::RangeMin => "range_min",
            ValidationType::RangeMax => "range_max",
            ValidationType::Pattern => "pattern",
            ValidationType::LengthMin => "length_min",
            ValidationType::LengthMax => "length_max",
            ValidationType::Presence => "presence",
            ValidationType::Uniqueness => "uniqueness",
            ValidationType::FormatEmail => "format_email",
            ValidationType::FormatUuid => "format_uuid",
            ValidationType::FormatDateTime => "format_datetime",
            ValidationType::Enumeration => "enum",
        }
    }
}

impl fmt::Display for ValidationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_name())
    }
}

/// Constraint payload. Numeric bounds carry floats so `gt:0` / `ge:1`
/// style equivalences can be evaluated by the compliance matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstraintValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
}

impl ConstraintValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConstraintValue::Int(i) => Some(*i as f64),
            ConstraintValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConstraintValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ConstraintValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintValue::Bool(b) => write!(f, "{b}"),
            ConstraintValue::Int(i) => write!(f, "{i}"),
            ConstraintValue::Float(x) => write!(f, "{x}"),
            ConstraintValue::Str(s) => write!(f, "{s}"),
            ConstraintValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

/// A typed `(ValidationType, value)` pair. Fields carry these after
/// normalization; the compliance validator matches against the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConstraint {
    pub kind: ValidationType,
    pub value: ConstraintValue,
}

impl FieldConstraint {
    pub fn new(kind: ValidationType, value: ConstraintValue) -> Self {
        FieldConstraint { kind, value }
    }

    /// Presence constraint shorthand.
    pub fn presence() -> Self {
        FieldConstraint {
            kind: ValidationType::Presence,
            value: ConstraintValue::Bool(true),
        }
    }
}

/// Foreign key reference to another entity's field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Target entity (PascalCase)
    pub entity: String,
    /// Target field, usually `id`
    pub field: String,
}

/// A single field of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Canonical snake_case name
    pub name: String,
    pub semantic_type: SemanticType,
    pub nullable: bool,
    /// Default value, if any. SQL-expression defaults (e.g. `now()`) are
    /// represented as strings and flagged by `sql_default`.
    #[serde(default)]
    pub default: Option<ConstraintValue>,
    /// Whether `default` is a SQL expression rather than a literal
    #[serde(default)]
    pub sql_default: bool,
    /// Normalized constraints, possibly empty
    #[serde(default)]
    pub constraints: Vec<FieldConstraint>,
    /// FK relationship, if this field references another entity
    #[serde(default)]
    pub foreign_key: Option<ForeignKey>,
    /// Allowed values for `SemanticType::Enum` fields
    #[serde(default)]
    pub enum_values: Vec<String>,
}

impl Field {
    /// Look up a constraint by kind.
    pub fn constraint(&self, kind: ValidationType) -> Option<&FieldConstraint> {
        self.constraints.iter().find(|c| c.kind == kind)
    }

    /// Whether the field is required on create (non-nullable, no default).
    pub fn required(&self) -> bool {
        !self.nullable && self.default.is_none()
    }
}

/// An entity with an ordered field list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Canonical PascalCase name
    pub name: String,
    pub fields: Vec<Field>,
}

impl Entity {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The entity's status field, if it has one (an enum field named `status`).
    pub fn status_field(&self) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.name == "status" && f.semantic_type == SemanticType::Enum)
    }

    /// Fields that reference other entities.
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&Field, &ForeignKey)> {
        self.fields
            .iter()
            .filter_map(|f| f.foreign_key.as_ref().map(|fk| (f, fk)))
    }

    /// Whether the entity consists solely of its id and FK fields. Such
    /// entities get no update route and no update smoke scenario.
    pub fn fk_only(&self) -> bool {
        self.fields
            .iter()
            .all(|f| f.name == "id" || f.foreign_key.is_some())
    }
}

/// Set of entities making up the application domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainModel {
    pub entities: Vec<Entity>,
}

impl DomainModel {
    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Entities in FK-dependency topological order: an entity appears after
    /// every entity it references. Used by the fixture UUID generator and
    /// the seed-DB emitter so both agree by construction.
    pub fn topological_order(&self) -> Vec<&Entity> {
        let mut placed: HashSet<&str> = HashSet::new();
        let mut ordered: Vec<&Entity> = Vec::new();

        // Bounded by entity count; FK cycles fall back to declaration order
        // for the remainder.
        for _ in 0..=self.entities.len() {
            let mut progressed = false;
            for entity in &self.entities {
                if placed.contains(entity.name.as_str()) {
                    continue;
                }
                let deps_ready = entity
                    .foreign_keys()
                    .all(|(_, fk)| fk.entity == entity.name || placed.contains(fk.entity.as_str()));
                if deps_ready {
                    placed.insert(entity.name.as_str());
                    ordered.push(entity);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        for entity in &self.entities {
            if !placed.contains(entity.name.as_str()) {
                ordered.push(entity);
            }
        }
        ordered
    }
}

// ============================================================================
// API model
// ============================================================================

/// HTTP method of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Where an endpoint came from. Endpoints read from the spec carry `Spec`;
/// everything else was materialized by the enricher and is flagged
/// `inferred`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceSource {
    Spec,
    CrudBestPractice,
    InfraBestPractice,
    PatternBank,
}

/// A single API endpoint with a canonical path (`{id}` placeholders).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: HttpMethod,
    /// Canonical path, e.g. `/orders/{id}/items`
    pub path: String,
    /// Unique operation id, e.g. `create_order_item`
    pub operation_id: String,
    #[serde(default)]
    pub path_params: Vec<String>,
    /// Request schema reference (`{Entity}Create` etc.), if the endpoint
    /// takes a body
    #[serde(default)]
    pub request_schema: Option<String>,
    #[serde(default)]
    pub response_schema: Option<String>,
    /// Primary entity the endpoint operates on
    pub entity: String,
    #[serde(default)]
    pub inferred: bool,
    #[serde(default = "default_inference_source")]
    pub inference_source: InferenceSource,
    /// Flow implemented by this endpoint, if it is behavioral rather than CRUD
    #[serde(default)]
    pub flow: Option<String>,
}

fn default_inference_source() -> InferenceSource {
    InferenceSource::Spec
}

impl Endpoint {
    /// Path segments, e.g. `/orders/{id}/items` → `["orders", "{id}", "items"]`.
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Whether the path nests one resource under another (`/a/{id}/b`).
    pub fn is_nested(&self) -> bool {
        let segs = self.segments();
        segs.len() >= 3 && segs.iter().skip(1).any(|s| s.starts_with('{'))
    }

    /// The trailing path segment when it is an action verb rather than a
    /// resource or parameter (e.g. `/orders/{id}/cancel` → `Some("cancel")`).
    pub fn action_segment(&self) -> Option<&str> {
        let segs = self.segments();
        let last = segs.last()?;
        if last.starts_with('{') {
            return None;
        }
        if segs.len() >= 2 && segs[segs.len() - 2].starts_with('{') {
            Some(last)
        } else {
            None
        }
    }
}

/// Set of endpoints exposed by the generated application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiModel {
    pub endpoints: Vec<Endpoint>,
    /// Schema names referenced by endpoints (request/response shapes)
    #[serde(default)]
    pub schemas: Vec<String>,
}

impl ApiModel {
    pub fn endpoint(&self, method: HttpMethod, path: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.method == method && e.path == path)
    }

    pub fn by_operation_id(&self, operation_id: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.operation_id == operation_id)
    }

    /// Whether any declared endpoint matches the given path.
    pub fn declares_path(&self, path: &str) -> bool {
        self.endpoints.iter().any(|e| e.path == path)
    }
}

// ============================================================================
// Behavior model
// ============================================================================

/// Atomic action kind of a flow step. Lowered to ICBR operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Read,
    Create,
    Update,
    Link,
    Transition,
}

/// A single atomic step inside a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    pub action: StepAction,
    pub entity: String,
    /// Field touched by Update/Link/Transition steps
    #[serde(default)]
    pub field: Option<String>,
    /// Free-form detail, e.g. the update expression
    #[serde(default)]
    pub detail: Option<String>,
}

/// A status transition declared by a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub entity: String,
    pub field: String,
    pub from: String,
    pub to: String,
}

/// Explicit field mapping used by conversion flows (source → target).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
}

/// A flow invariant, possibly inferred by an enrichment rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInvariant {
    /// Predicate or effect expression, e.g. `parent.stock -= quantity`
    pub expression: String,
    /// Inference rule that produced this invariant; `None` for spec-stated
    #[serde(default)]
    pub inferred_by: Option<String>,
    /// Inferred invariants can be disabled individually
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A business flow: ordered steps with Hoare-style pre/postconditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Canonical snake_case name, e.g. `add_item_to_cart`
    pub name: String,
    #[serde(default)]
    pub source_entity: Option<String>,
    #[serde(default)]
    pub target_entity: Option<String>,
    #[serde(default)]
    pub creates_entity: Option<String>,
    #[serde(default)]
    pub guards: Vec<String>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub postconditions: Vec<String>,
    #[serde(default)]
    pub invariants: Vec<FlowInvariant>,
    #[serde(default)]
    pub steps: Vec<FlowStep>,
    #[serde(default)]
    pub status_transitions: Vec<StatusTransition>,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
    /// Golden flows short-circuit the repair loop into fail-fast mode
    #[serde(default)]
    pub golden: bool,
}

impl Flow {
    /// Entities this flow touches in any role.
    pub fn entities(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        fn push<'a>(out: &mut Vec<&'a str>, name: &'a Option<String>) {
            if let Some(n) = name {
                out.push(n.as_str());
            }
        }
        push(&mut out, &self.source_entity);
        push(&mut out, &self.target_entity);
        push(&mut out, &self.creates_entity);
        for step in &self.steps {
            out.push(step.entity.as_str());
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// Ordered collection of flows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorModel {
    pub flows: Vec<Flow>,
}

impl BehaviorModel {
    pub fn flow(&self, name: &str) -> Option<&Flow> {
        self.flows.iter().find(|f| f.name == name)
    }
}

// ============================================================================
// Validation model
// ============================================================================

/// Where a constraint rule was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    OpenApi,
    Pydantic,
    SqlAlchemy,
    BusinessLogic,
    Spec,
}

/// A normalized constraint rule with confidence and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintRule {
    pub entity: String,
    pub field: String,
    pub constraint: FieldConstraint,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub provenance: Provenance,
}

impl ConstraintRule {
    /// Canonical key `{entity}.{field}.{constraint_type}`.
    pub fn key(&self) -> String {
        format!(
            "{}.{}.{}",
            self.entity,
            self.field,
            self.constraint.kind.key_name()
        )
    }
}

/// Keyed constraint rules. `normalize` collapses duplicate keys by
/// confidence, logging the losing rule as an advisory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationModel {
    pub rules: Vec<ConstraintRule>,
}

impl ValidationModel {
    /// Collapse duplicate keys, keeping the highest-confidence rule.
    /// Returns advisory messages for each dropped conflict.
    pub fn normalize(&mut self) -> Vec<String> {
        let mut advisories = Vec::new();
        let mut best: HashMap<String, ConstraintRule> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for rule in self.rules.drain(..) {
            let key = rule.key();
            match best.get(&key) {
                None => {
                    order.push(key.clone());
                    best.insert(key, rule);
                }
                Some(existing) if existing.constraint.value == rule.constraint.value => {
                    if rule.confidence > existing.confidence {
                        best.insert(key, rule);
                    }
                }
                Some(existing) => {
                    if rule.confidence > existing.confidence {
                        advisories.push(format!(
                            "constraint conflict on '{key}': kept {} (confidence {:.2}), dropped {} (confidence {:.2})",
                            rule.constraint.value,
                            rule.confidence,
                            existing.constraint.value,
                            existing.confidence,
                        ));
                        best.insert(key, rule);
                    } else {
                        advisories.push(format!(
                            "constraint conflict on '{key}': kept {} (confidence {:.2}), dropped {} (confidence {:.2})",
                            existing.constraint.value,
                            existing.confidence,
                            rule.constraint.value,
                            rule.confidence,
                        ));
                    }
                }
            }
        }

        self.rules = order.into_iter().filter_map(|k| best.remove(&k)).collect();
        advisories
    }

    pub fn rule(&self, key: &str) -> Option<&ConstraintRule> {
        self.rules.iter().find(|r| r.key() == key)
    }

    /// Rules for a given entity.
    pub fn rules_for_entity<'a>(
        &'a self,
        entity: &'a str,
    ) -> impl Iterator<Item = &'a ConstraintRule> {
        self.rules.iter().filter(move |r| r.entity == entity)
    }
}

// ============================================================================
// Infrastructure model
// ============================================================================

/// Database engine of the generated application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    Postgres,
    Sqlite,
    Mysql,
}

/// A named service and its port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub service: String,
    pub port: u16,
}

/// Deployment-facing facts about the generated application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfrastructureModel {
    pub database: DatabaseKind,
    /// Target runtime, e.g. `python3.12`
    pub runtime: String,
    pub ports: Vec<ServicePort>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for InfrastructureModel {
    fn default() -> Self {
        InfrastructureModel {
            database: DatabaseKind::Postgres,
            runtime: "python3.12".to_string(),
            ports: vec![ServicePort {
                service: "api".to_string(),
                port: 8000,
            }],
            health_path: default_health_path(),
            metrics_path: default_metrics_path(),
        }
    }
}

impl InfrastructureModel {
    /// The application's own port (service `api`, or the first declared).
    pub fn app_port(&self) -> u16 {
        self.ports
            .iter()
            .find(|p| p.service == "api")
            .or_else(|| self.ports.first())
            .map_or(8000, |p| p.port)
    }
}

// ============================================================================
// Repair history
// ============================================================================

/// One IR realignment applied by the backpropagator during repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairRecord {
    pub iteration: u32,
    /// What was realigned, e.g. `Order.customer_id nullable=true`
    pub description: String,
    pub entity: Option<String>,
    pub field: Option<String>,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

// ============================================================================
// ApplicationIR
// ============================================================================

/// The complete typed representation of the target application.
///
/// Constructed once per pipeline run and owned by the pipeline coordinator.
/// All components borrow it immutably; the IR backpropagator holds the one
/// writable handle during repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationIr {
    /// Canonical PascalCase application name
    pub app_name: String,
    pub schema_version: u32,
    /// sha256 of the canonicalized spec this IR was lowered from
    pub spec_digest: String,
    pub domain: DomainModel,
    pub api: ApiModel,
    pub behavior: BehaviorModel,
    pub validation: ValidationModel,
    pub infrastructure: InfrastructureModel,
    #[serde(default)]
    pub repair_history: Vec<RepairRecord>,
}

impl ApplicationIr {
    /// New empty IR for the given app name. Mostly a test convenience; real
    /// IRs come out of lowering.
    pub fn new(app_name: impl Into<String>) -> Self {
        ApplicationIr {
            app_name: app_name.into(),
            schema_version: IR_SCHEMA_VERSION,
            spec_digest: String::new(),
            domain: DomainModel::default(),
            api: ApiModel::default(),
            behavior: BehaviorModel::default(),
            validation: ValidationModel::default(),
            infrastructure: InfrastructureModel::default(),
            repair_history: Vec::new(),
        }
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.domain.entity(name)
    }

    pub fn field(&self, entity: &str, field: &str) -> Option<&Field> {
        self.domain.entity(entity).and_then(|e| e.field(field))
    }

    /// Validate all cross-model invariants. This is the acceptance gate
    /// applied to lowered and cached IRs; failure is fatal.
    pub fn validate(&self) -> Result<(), IrError> {
        if self.schema_version != IR_SCHEMA_VERSION {
            return Err(IrError::SchemaDrift {
                found: self.schema_version,
                current: IR_SCHEMA_VERSION,
            });
        }

        self.validate_domain()?;
        self.validate_api()?;
        self.validate_behavior()?;
        self.validate_infrastructure()?;
        Ok(())
    }

    fn validate_domain(&self) -> Result<(), IrError> {
        for entity in &self.domain.entities {
            if !is_pascal_case(&entity.name) {
                return Err(IrError::NonCanonicalEntity {
                    name: entity.name.clone(),
                });
            }
            let mut seen = HashSet::new();
            for field in &entity.fields {
                if !is_snake_case(&field.name) {
                    return Err(IrError::NonCanonicalField {
                        entity: entity.name.clone(),
                        field: field.name.clone(),
                    });
                }
                if !seen.insert(field.name.as_str()) {
                    return Err(IrError::DuplicateField {
                        entity: entity.name.clone(),
                        field: field.name.clone(),
                    });
                }
                if let Some(fk) = &field.foreign_key {
                    if self.domain.entity(&fk.entity).is_none() {
                        return Err(IrError::DanglingForeignKey {
                            entity: entity.name.clone(),
                            field: field.name.clone(),
                            target: fk.entity.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_api(&self) -> Result<(), IrError> {
        let mut op_ids = HashSet::new();
        let schema_names: HashSet<&str> = self.api.schemas.iter().map(String::as_str).collect();

        for ep in &self.api.endpoints {
            if !op_ids.insert(ep.operation_id.as_str()) {
                return Err(IrError::DuplicateOperationId {
                    operation_id: ep.operation_id.clone(),
                });
            }
            for schema in [&ep.request_schema, &ep.response_schema]
                .into_iter()
                .flatten()
            {
                if !schema_names.contains(schema.as_str()) {
                    return Err(IrError::UnknownSchema {
                        operation_id: ep.operation_id.clone(),
                        schema: schema.clone(),
                    });
                }
            }
            if ep.is_nested() {
                self.verify_nesting(ep)?;
            }
        }
        Ok(())
    }

    /// A nested endpoint `/parents/{id}/children...` must have a real FK
    /// from the child entity to the parent entity.
    fn verify_nesting(&self, ep: &Endpoint) -> Result<(), IrError> {
        let segs = ep.segments();
        let parent_seg = segs[0];
        let parent = match self.entity_for_segment(parent_seg) {
            Some(e) => e,
            // Unknown parent segments (e.g. `/api/v1` prefixes) are not
            // nesting in the resource sense.
            None => return Ok(()),
        };
        let child = match self.domain.entity(&ep.entity) {
            Some(e) => e,
            None => return Ok(()),
        };
        if child.name == parent.name {
            return Ok(());
        }
        let has_fk = child.foreign_keys().any(|(_, fk)| fk.entity == parent.name);
        if has_fk {
            Ok(())
        } else {
            Err(IrError::UnverifiedNesting {
                path: ep.path.clone(),
                parent: parent.name.clone(),
                child: child.name.clone(),
            })
        }
    }

    fn validate_behavior(&self) -> Result<(), IrError> {
        for flow in &self.behavior.flows {
            for name in [
                &flow.source_entity,
                &flow.target_entity,
                &flow.creates_entity,
            ]
            .into_iter()
            .flatten()
            {
                if self.domain.entity(name).is_none() {
                    return Err(IrError::UnknownFlowReference {
                        flow: flow.name.clone(),
                        kind: "entity".to_string(),
                        name: name.clone(),
                    });
                }
            }
            for step in &flow.steps {
                if self.domain.entity(&step.entity).is_none() {
                    return Err(IrError::UnknownFlowReference {
                        flow: flow.name.clone(),
                        kind: "entity".to_string(),
                        name: step.entity.clone(),
                    });
                }
                if let Some(field) = &step.field {
                    if self.field(&step.entity, field).is_none() {
                        return Err(IrError::UnknownFlowReference {
                            flow: flow.name.clone(),
                            kind: "field".to_string(),
                            name: format!("{}.{field}", step.entity),
                        });
                    }
                }
            }
            for tr in &flow.status_transitions {
                let entity = self.domain.entity(&tr.entity).ok_or_else(|| {
                    IrError::UnknownFlowReference {
                        flow: flow.name.clone(),
                        kind: "entity".to_string(),
                        name: tr.entity.clone(),
                    }
                })?;
                let field =
                    entity
                        .field(&tr.field)
                        .ok_or_else(|| IrError::UnknownFlowReference {
                            flow: flow.name.clone(),
                            kind: "field".to_string(),
                            name: format!("{}.{}", tr.entity, tr.field),
                        })?;
                for status in [&tr.from, &tr.to] {
                    if !field.enum_values.is_empty() && !field.enum_values.contains(status) {
                        return Err(IrError::UnknownFlowReference {
                            flow: flow.name.clone(),
                            kind: "status".to_string(),
                            name: status.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_infrastructure(&self) -> Result<(), IrError> {
        let mut by_port: HashMap<u16, &str> = HashMap::new();
        for sp in &self.infrastructure.ports {
            if let Some(first) = by_port.insert(sp.port, sp.service.as_str()) {
                if first != sp.service {
                    return Err(IrError::PortCollision {
                        port: sp.port,
                        first: first.to_string(),
                        second: sp.service.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolve a path segment like `orders` to its entity (`Order`).
    /// Structural: strip trailing `s`, PascalCase-ify, look up.
    pub fn entity_for_segment(&self, segment: &str) -> Option<&Entity> {
        let name = crate::lowering::normalize::segment_to_entity(segment);
        self.domain.entity(&name)
    }

    /// Summary counts for the generation manifest.
    pub fn stats(&self) -> IrStats {
        IrStats {
            total_entities: self.domain.entities.len(),
            total_endpoints: self.api.endpoints.len(),
            inferred_endpoints: self.api.endpoints.iter().filter(|e| e.inferred).count(),
        }
    }
}

/// IR summary counts recorded in the generation manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrStats {
    pub total_entities: usize,
    pub total_endpoints: usize,
    pub inferred_endpoints: usize,
}

// ============================================================================
// Identifier shape checks
// ============================================================================

/// `snake_case`: lowercase ASCII, digits, underscores; must start with a letter.
pub fn is_snake_case(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// `PascalCase`: ASCII alphanumeric, starts uppercase, no separators.
pub fn is_pascal_case(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && s.chars().all(|c| c.is_ascii_alphanumeric())
}
