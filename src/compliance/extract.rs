//! # Code-side Constraint Extraction
//!
//! Walks the generated ORM and schema sources structurally and recovers the
//! constraints the code actually enforces, as `ConstraintRule`s with their
//! provenance. The ORM and schema parsers operate on disjoint files and run
//! in parallel; their outputs are normalized through the same
//! `SemanticNormalizer` the emitter used and collapsed per key by
//! confidence, so IR-side and code-side constraints meet in one normal
//! form.

use crate::ir::{
    ConstraintRule, ConstraintValue, FieldConstraint, Provenance, ValidationType,
};
use crate::lowering::normalize;
use std::collections::HashMap;
use std::path::Path;

/// Extraction result: rules keyed `{entity}.{field}.{constraint_type}` for
/// O(1) matching, duplicates collapsed to the highest confidence.
#[derive(Debug, Default)]
pub struct ExtractedConstraints {
    pub by_key: HashMap<String, ConstraintRule>,
    /// Entity class names seen in code
    pub entities: Vec<String>,
    /// (method, path) route pairs seen in code
    pub routes: Vec<(String, String)>,
    /// Service method names seen in code
    pub service_methods: Vec<String>,
}

impl ExtractedConstraints {
    fn insert(&mut self, rule: ConstraintRule) {
        let key = rule.key();
        match self.by_key.get(&key) {
            Some(existing) if existing.confidence >= rule.confidence => {}
            _ => {
                self.by_key.insert(key, rule);
            }
        }
    }
}

/// Extract everything compliance needs from a generated tree. The three
/// source walks are independent; rayon joins them.
pub fn extract(app_dir: &Path) -> ExtractedConstraints {
    let ((orm, schema), routes) = rayon::join(
        || {
            rayon::join(
                || extract_orm(app_dir),
                || extract_schemas(app_dir),
            )
        },
        || (extract_routes(app_dir), extract_services(app_dir)),
    );
    let (route_pairs, service_methods) = routes;

    let mut merged = ExtractedConstraints {
        by_key: HashMap::new(),
        entities: orm.1,
        routes: route_pairs,
        service_methods,
    };
    for rule in orm.0 {
        merged.insert(rule);
    }
    for rule in schema {
        merged.insert(rule);
    }
    merged
}

fn read(app_dir: &Path, rel: &str) -> Option<String> {
    std::fs::read_to_string(app_dir.join(rel)).ok()
}

/// Walk `src/models/entities.py`: `mapped_column` calls carry nullability,
/// uniqueness, length, and enum facts.
fn extract_orm(app_dir: &Path) -> (Vec<ConstraintRule>, Vec<String>) {
    let Some(content) = read(app_dir, "src/models/entities.py") else {
        return (Vec::new(), Vec::new());
    };
    let mut rules = Vec::new();
    let mut entities = Vec::new();
    let mut current_entity: Option<String> = None;

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("class ") {
            if let Some(name) = rest.split('(').next() {
                let name = name.trim().to_string();
                entities.push(name.clone());
                current_entity = Some(name);
            }
            continue;
        }
        let Some(entity) = &current_entity else {
            continue;
        };
        let trimmed = line.trim_start();
        let Some((field_part, rest)) = trimmed.split_once(':') else {
            continue;
        };
        if !rest.contains("mapped_column(") {
            continue;
        }
        let field = normalize::to_snake_case(field_part.trim());
        if field.is_empty() {
            continue;
        }

        let mut push = |kind: ValidationType, value: ConstraintValue| {
            rules.push(ConstraintRule {
                entity: entity.clone(),
                field: field.clone(),
                constraint: normalize::normalize_constraint(FieldConstraint::new(kind, value)),
                confidence: 0.9,
                provenance: Provenance::SqlAlchemy,
            });
        };

        if rest.contains("nullable=False") {
            push(ValidationType::Presence, ConstraintValue::Bool(true));
        }
        if rest.contains("unique=True") {
            push(ValidationType::Uniqueness, ConstraintValue::Bool(true));
        }
        if let Some(length) = numeric_arg(rest, "length=") {
            push(ValidationType::LengthMax, ConstraintValue::Float(length));
        }
        if let Some(members) = enum_members(rest) {
            push(ValidationType::Enumeration, ConstraintValue::List(members));
        }
    }
    (rules, entities)
}

/// Walk `src/models/schemas.py`: `Field(...)` arguments carry the request
/// validation facts.
fn extract_schemas(app_dir: &Path) -> Vec<ConstraintRule> {
    let Some(content) = read(app_dir, "src/models/schemas.py") else {
        return Vec::new();
    };
    let mut rules = Vec::new();
    let mut current_entity: Option<String> = None;

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("class ") {
            let name = rest.split('(').next().unwrap_or_default().trim();
            // Schema classes are `{Entity}{Create,Update,Read}`; constraints
            // attach to the entity.
            let entity = name
                .strip_suffix("Create")
                .or_else(|| name.strip_suffix("Update"))
                .or_else(|| name.strip_suffix("Read"))
                .unwrap_or(name);
            current_entity = Some(entity.to_string());
            continue;
        }
        let Some(entity) = &current_entity else {
            continue;
        };
        let trimmed = line.trim_start();
        let Some((field_part, rest)) = trimmed.split_once(':') else {
            continue;
        };
        let field = normalize::to_snake_case(field_part.trim());
        if field.is_empty() {
            continue;
        }

        let mut push = |kind: ValidationType, value: ConstraintValue| {
            rules.push(ConstraintRule {
                entity: entity.clone(),
                field: field.clone(),
                constraint: normalize::normalize_constraint(FieldConstraint::new(kind, value)),
                confidence: 0.8,
                provenance: Provenance::Pydantic,
            });
        };

        for (marker, kind) in [
            ("ge=", ValidationType::RangeMin),
            ("le=", ValidationType::RangeMax),
            ("min_length=", ValidationType::LengthMin),
            ("max_length=", ValidationType::LengthMax),
        ] {
            if let Some(value) = numeric_arg(rest, marker) {
                push(kind, ConstraintValue::Float(value));
            }
        }
        // `gt=0` is recorded as an exclusive lower bound; the semantic
        // matcher treats it as equivalent to `ge` of the next value.
        if let Some(value) = numeric_arg(rest, "gt=") {
            push(ValidationType::RangeMin, ConstraintValue::Float(value));
        }
        if let Some(pattern) = string_arg(rest, "pattern=r\"") {
            push(ValidationType::Pattern, ConstraintValue::Str(pattern));
        }
        if rest.contains("Literal[") {
            if let Some(members) = literal_members(rest) {
                push(ValidationType::Enumeration, ConstraintValue::List(members));
            }
        }
    }
    rules
}

/// Route decorators from every `src/routes/*.py` module.
fn extract_routes(app_dir: &Path) -> Vec<(String, String)> {
    let mut routes = Vec::new();
    let dir = app_dir.join("src/routes");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return routes;
    };
    let mut paths: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("py"))
        .collect();
    paths.sort();

    for path in paths {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for line in content.lines() {
            let trimmed = line.trim_start();
            let Some(rest) = trimmed.strip_prefix("@router.") else {
                continue;
            };
            let Some((method, rest)) = rest.split_once('(') else {
                continue;
            };
            let Some(route) = string_arg(rest, "\"") else {
                continue;
            };
            routes.push((method.to_ascii_uppercase(), route));
        }
    }
    routes
}

/// Method names defined in `src/services/*.py`.
fn extract_services(app_dir: &Path) -> Vec<String> {
    let mut methods = Vec::new();
    let dir = app_dir.join("src/services");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return methods;
    };
    let mut paths: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("py"))
        .collect();
    paths.sort();

    for path in paths {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for line in content.lines() {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix("def ") {
                if let Some(name) = rest.split('(').next() {
                    if name != "__init__" {
                        methods.push(name.to_string());
                    }
                }
            }
        }
    }
    methods
}

fn numeric_arg(text: &str, marker: &str) -> Option<f64> {
    let idx = text.find(marker)? + marker.len();
    let rest = &text[idx..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

fn string_arg(text: &str, marker: &str) -> Option<String> {
    let idx = text.find(marker)? + marker.len();
    let rest = &text[idx..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Members of an `sa.Enum("a", "b", name=...)` call.
fn enum_members(text: &str) -> Option<Vec<String>> {
    let idx = text.find("sa.Enum(")? + "sa.Enum(".len();
    let rest = &text[idx..];
    let end = rest.find(')')?;
    let members: Vec<String> = rest[..end]
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            part.strip_prefix('"')?.strip_suffix('"').map(str::to_string)
        })
        .collect();
    (!members.is_empty()).then_some(members)
}

/// Members of a `Literal["a", "b"]` annotation.
fn literal_members(text: &str) -> Option<Vec<String>> {
    let idx = text.find("Literal[")? + "Literal[".len();
    let rest = &text[idx..];
    let end = rest.find(']')?;
    let members: Vec<String> = rest[..end]
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            part.strip_prefix('"')?.strip_suffix('"').map(str::to_string)
        })
        .collect();
    (!members.is_empty()).then_some(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, content).expect("write");
    }

    #[test]
    fn test_extracts_orm_and_schema_constraints() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write(
            tmp.path(),
            "src/models/entities.py",
            "class Widget(Base):\n    __tablename__ = \"widgets\"\n\n    name: Mapped[str] = mapped_column(sa.String(length=64), nullable=False)\n",
        );
        write(
            tmp.path(),
            "src/models/schemas.py",
            "class WidgetCreate(BaseModel):\n    name: str = Field(min_length=1, max_length=64)\n    price: decimal.Decimal = Field(ge=0.01)\n",
        );

        let extracted = extract(tmp.path());
        assert!(extracted.entities.contains(&"Widget".to_string()));
        assert!(extracted.by_key.contains_key("Widget.name.length_max"));
        assert!(extracted.by_key.contains_key("Widget.name.presence"));
        assert!(extracted.by_key.contains_key("Widget.price.range_min"));
    }

    #[test]
    fn test_duplicate_keys_collapse_to_highest_confidence() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write(
            tmp.path(),
            "src/models/entities.py",
            "class Widget(Base):\n    name: Mapped[str] = mapped_column(sa.String(length=64), nullable=False)\n",
        );
        write(
            tmp.path(),
            "src/models/schemas.py",
            "class WidgetCreate(BaseModel):\n    name: str = Field(max_length=64)\n",
        );

        let extracted = extract(tmp.path());
        let rule = extracted
            .by_key
            .get("Widget.name.length_max")
            .expect("collapsed rule");
        // The ORM rule (0.9) wins over the pydantic one (0.8).
        assert_eq!(rule.provenance, Provenance::SqlAlchemy);
    }

    #[test]
    fn test_route_extraction() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write(
            tmp.path(),
            "src/routes/widget_routes.py",
            "@router.post(\"/widgets\", status_code=201)\ndef create_widget():\n    pass\n",
        );
        let extracted = extract(tmp.path());
        assert_eq!(
            extracted.routes,
            vec![("POST".to_string(), "/widgets".to_string())]
        );
    }
}
