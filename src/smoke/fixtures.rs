//! # Fixtures
//!
//! Deterministic seed data shared by the seed-DB emitter and the smoke
//! runner. Both sides consume the same generator, so the UUID a scenario
//! uses for an entity is the UUID the seed script inserted - agreement by
//! construction, not by convention.
//!
//! Seed UUIDs are v5 (name-based) over the app name, the entity name, and
//! the entity's position in FK-dependency topological order. Payload values
//! are synthesized from `FieldConstraint`s: numeric fields pick min+1,
//! strings pick a sample satisfying pattern and length, enums pick the
//! first allowed value, emails follow a canonical template.

use crate::ir::{
    ApplicationIr, ConstraintValue, Entity, Field, SemanticType, ValidationType,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Namespace for seed UUID derivation. Fixed forever; changing it would
/// break seed/smoke agreement across versions.
const SEED_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5f, 0x0c, 0x9a, 0x2e, 0x41, 0x77, 0x4b, 0x0d, 0x8c, 0x3a, 0x11, 0x6f, 0xd2, 0x84, 0x90,
    0x27,
]);

/// The shared seed UUID generator.
#[derive(Debug, Clone)]
pub struct SeedUuidGenerator {
    app_name: String,
}

impl SeedUuidGenerator {
    pub fn new(app_name: impl Into<String>) -> Self {
        SeedUuidGenerator {
            app_name: app_name.into(),
        }
    }

    /// UUID for an entity at a given topological position and fixture row.
    pub fn uuid_for(&self, entity: &str, position: usize, row: usize) -> Uuid {
        let name = format!("{}/{entity}/{position}/{row}", self.app_name);
        Uuid::new_v5(&SEED_NAMESPACE, name.as_bytes())
    }
}

/// One seeded entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFixture {
    pub entity: String,
    /// Position in topological order; parents come first
    pub position: usize,
    pub id: Uuid,
    /// Column values, id included
    pub values: serde_json::Map<String, Value>,
}

/// The complete deterministic fixture set for an application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureSet {
    pub rows: Vec<EntityFixture>,
}

impl FixtureSet {
    /// Build fixtures for every entity, in topological order, one row per
    /// entity. FK columns reference the parent fixture's id.
    pub fn build(ir: &ApplicationIr) -> Self {
        let generator = SeedUuidGenerator::new(&ir.app_name);
        let ordered = ir.domain.topological_order();
        let mut rows: Vec<EntityFixture> = Vec::new();

        for (position, entity) in ordered.iter().enumerate() {
            let id = generator.uuid_for(&entity.name, position, 0);
            let mut values = serde_json::Map::new();

            for field in &entity.fields {
                if field.name == "id" {
                    values.insert("id".to_string(), json!(id.to_string()));
                    continue;
                }
                if let Some(fk) = &field.foreign_key {
                    let parent_id = rows
                        .iter()
                        .find(|r| r.entity == fk.entity)
                        .map(|r| r.id.to_string());
                    if let Some(parent_id) = parent_id {
                        values.insert(field.name.clone(), json!(parent_id));
                        continue;
                    }
                }
                values.insert(field.name.clone(), sample_value(field));
            }

            rows.push(EntityFixture {
                entity: entity.name.clone(),
                position,
                id,
                values,
            });
        }

        FixtureSet { rows }
    }

    pub fn fixture(&self, entity: &str) -> Option<&EntityFixture> {
        self.rows.iter().find(|r| r.entity == entity)
    }

    /// The seeded id for an entity, if present.
    pub fn id_for(&self, entity: &str) -> Option<Uuid> {
        self.fixture(entity).map(|f| f.id)
    }
}

/// Synthesize a valid value for a field from its constraints.
pub fn sample_value(field: &Field) -> Value {
    match field.semantic_type {
        SemanticType::Uuid => json!(Uuid::new_v5(
            &SEED_NAMESPACE,
            format!("value/{}", field.name).as_bytes()
        )
        .to_string()),
        SemanticType::Integer => json!(numeric_sample(field) as i64),
        SemanticType::Float | SemanticType::Decimal => json!(numeric_sample(field)),
        SemanticType::Boolean => json!(true),
        SemanticType::DateTime => json!("2024-01-01T00:00:00Z"),
        SemanticType::Enum => {
            let first = field.enum_values.first().cloned().unwrap_or_else(|| {
                field
                    .constraint(ValidationType::Enumeration)
                    .and_then(|c| match &c.value {
                        ConstraintValue::List(items) => items.first().cloned(),
                        _ => None,
                    })
                    .unwrap_or_default()
            });
            json!(first)
        }
        SemanticType::String | SemanticType::Text => json!(string_sample(field)),
    }
}

/// Numeric sample: `range_min + 1` when a lower bound exists, otherwise 1.
/// Using min+1 keeps the value strictly inside open-bound interpretations.
fn numeric_sample(field: &Field) -> f64 {
    let min = field
        .constraint(ValidationType::RangeMin)
        .and_then(|c| c.value.as_f64());
    let max = field
        .constraint(ValidationType::RangeMax)
        .and_then(|c| c.value.as_f64());

    let candidate = match min {
        Some(min) => min + 1.0,
        None => 1.0,
    };
    match max {
        Some(max) if candidate > max => max,
        _ => candidate,
    }
}

/// String sample satisfying format, length, and (simple) pattern
/// constraints.
fn string_sample(field: &Field) -> String {
    if field.constraint(ValidationType::FormatEmail).is_some()
        || field.name.contains("email")
    {
        return format!("{}@example.com", field.name.replace('_', "."));
    }
    if field.constraint(ValidationType::FormatUuid).is_some() {
        return Uuid::new_v5(&SEED_NAMESPACE, field.name.as_bytes()).to_string();
    }
    if field.constraint(ValidationType::FormatDateTime).is_some() {
        return "2024-01-01T00:00:00Z".to_string();
    }

    let min_len = field
        .constraint(ValidationType::LengthMin)
        .and_then(|c| c.value.as_f64())
        .map_or(1, |v| v as usize)
        .max(1);
    let max_len = field
        .constraint(ValidationType::LengthMax)
        .and_then(|c| c.value.as_f64())
        .map_or(64, |v| v as usize);

    // A lowercase alphabetic base satisfies the common identifier and name
    // patterns; repeat to reach the minimum length.
    let base = "sample";
    let mut out = String::new();
    while out.len() < min_len {
        out.push_str(base);
    }
    out.truncate(max_len.max(min_len));
    if out.is_empty() {
        out.push('x');
    }
    out
}

/// A value that violates the field's constraints, for validation-error
/// scenarios. None when no violation can be constructed (unconstrained
/// field).
pub fn invalid_value(field: &Field) -> Option<Value> {
    if let Some(min) = field
        .constraint(ValidationType::RangeMin)
        .and_then(|c| c.value.as_f64())
    {
        return Some(match field.semantic_type {
            SemanticType::Integer => json!((min - 1.0) as i64),
            _ => json!(min - 1.0),
        });
    }
    if field
        .constraint(ValidationType::LengthMin)
        .and_then(|c| c.value.as_f64())
        .map_or(false, |v| v >= 1.0)
    {
        return Some(json!(""));
    }
    if let Some(max) = field
        .constraint(ValidationType::LengthMax)
        .and_then(|c| c.value.as_f64())
    {
        return Some(json!("x".repeat(max as usize + 1)));
    }
    if field.semantic_type == SemanticType::Enum {
        return Some(json!("__not_a_member__"));
    }
    if field.semantic_type == SemanticType::Uuid && field.name != "id" {
        return Some(json!("not-a-uuid"));
    }
    None
}

/// The create-payload for an entity: every required non-id field, FKs
/// substituted from seeded fixtures.
pub fn create_payload(entity: &Entity, fixtures: &FixtureSet) -> serde_json::Map<String, Value> {
    let mut payload = serde_json::Map::new();
    for field in &entity.fields {
        if field.name == "id" || !field.required() {
            continue;
        }
        if let Some(fk) = &field.foreign_key {
            if let Some(id) = fixtures.id_for(&fk.entity) {
                payload.insert(field.name.clone(), json!(id.to_string()));
                continue;
            }
        }
        payload.insert(field.name.clone(), sample_value(field));
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Entity, ForeignKey};

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

    fn demo_ir() -> ApplicationIr {
        let mut ir = ApplicationIr::new("Demo");
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
        ir.domain.entities.push(Entity {
            name: "Parent".to_string(),
            fields: vec![field("id", SemanticType::Uuid)],
        });
        ir
    }

    #[test]
    fn test_uuids_are_deterministic() {
        let a = SeedUuidGenerator::new("Demo").uuid_for("Parent", 0, 0);
        let b = SeedUuidGenerator::new("Demo").uuid_for("Parent", 0, 0);
        assert_eq!(a, b);
        let other = SeedUuidGenerator::new("Demo").uuid_for("Parent", 1, 0);
        assert_ne!(a, other);
    }

    #[test]
    fn test_fixture_fk_references_parent_row() {
        let fixtures = FixtureSet::build(&demo_ir());
        let parent = fixtures.fixture("Parent").expect("parent fixture");
        let child = fixtures.fixture("Child").expect("child fixture");
        assert_eq!(parent.position, 0, "parents seed before children");
        assert_eq!(
            child.values.get("parent_id").and_then(Value::as_str),
            Some(parent.id.to_string().as_str())
        );
    }

    #[test]
    fn test_numeric_sample_uses_min_plus_one() {
        let mut f = field("price", SemanticType::Decimal);
        f.constraints.push(crate::ir::FieldConstraint::new(
            ValidationType::RangeMin,
            ConstraintValue::Float(0.01),
        ));
        assert_eq!(sample_value(&f), json!(1.01));
    }

    #[test]
    fn test_string_sample_respects_length_bounds() {
        let mut f = field("name", SemanticType::String);
        f.constraints.push(crate::ir::FieldConstraint::new(
            ValidationType::LengthMin,
            ConstraintValue::Int(1),
        ));
        f.constraints.push(crate::ir::FieldConstraint::new(
            ValidationType::LengthMax,
            ConstraintValue::Int(4),
        ));
        let v = sample_value(&f);
        let s = v.as_str().expect("string sample");
        assert!(!s.is_empty() && s.len() <= 4);
    }

    #[test]
    fn test_invalid_value_violates_range() {
        let mut f = field("price", SemanticType::Decimal);
        f.constraints.push(crate::ir::FieldConstraint::new(
            ValidationType::RangeMin,
            ConstraintValue::Float(0.01),
        ));
        let v = invalid_value(&f).expect("invalid value");
        assert!(v.as_f64().expect("number") < 0.01);
    }
}
