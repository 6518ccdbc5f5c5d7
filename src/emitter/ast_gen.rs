//! # AST Stratum Generators
//!
//! Pure `IR → source` functions for every structural artifact of the
//! generated application: ORM entities, request/response schemas,
//! repositories, CRUD and nested routes, migrations, bootstrap, and the
//! seed script. Nothing here branches on an entity or field *name* - only
//! on IR structure - and output is structurally equal for equal IRs.

use crate::icbr::{AtomicOp, CmpOp, FlowBehavior, Operand, PredicateExpr};
use crate::ir::{
    ApplicationIr, ConstraintValue, Endpoint, Entity, Field, Flow, HttpMethod, SemanticType,
    ValidationType,
};
use crate::lowering::normalize;
use crate::smoke::fixtures::FixtureSet;
use serde_json::Value;

/// Which request/response shape a schema field is emitted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Create,
    Update,
    Read,
}

/// Fixed repository operation shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoOp {
    List,
    Get,
    Create,
    Update,
    Delete,
}

/// snake_case helper used across generators.
fn snake(name: &str) -> String {
    normalize::to_snake_case(name)
}

/// Plural table / resource name.
fn table(entity: &str) -> String {
    format!("{}s", snake(entity))
}

/// Render a JSON value as a Python literal.
fn py_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("\"{}\"", s.replace('"', "\\\"")),
        other => format!("\"{other}\""),
    }
}

fn constraint_literal(value: &ConstraintValue) -> String {
    match value {
        ConstraintValue::Bool(true) => "True".to_string(),
        ConstraintValue::Bool(false) => "False".to_string(),
        ConstraintValue::Int(i) => i.to_string(),
        ConstraintValue::Float(f) => format!("{f}"),
        ConstraintValue::Str(s) => format!("\"{}\"", s.replace('"', "\\\"")),
        ConstraintValue::List(items) => format!(
            "[{}]",
            items
                .iter()
                .map(|i| format!("\"{i}\""))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

// ============================================================================
// Columns and migrations
// ============================================================================

/// SQLAlchemy column type for a semantic type.
fn sa_type(field: &Field) -> String {
    match field.semantic_type {
        SemanticType::Uuid => "sa.Uuid()".to_string(),
        SemanticType::String => {
            let length = field
                .constraint(ValidationType::LengthMax)
                .and_then(|c| c.value.as_f64())
                .map_or(255, |v| v as i64);
            format!("sa.String(length={length})")
        }
        SemanticType::Text => "sa.Text()".to_string(),
        SemanticType::Integer => "sa.Integer()".to_string(),
        SemanticType::Float => "sa.Float()".to_string(),
        SemanticType::Decimal => "sa.Numeric(12, 2)".to_string(),
        SemanticType::Boolean => "sa.Boolean()".to_string(),
        SemanticType::DateTime => "sa.DateTime()".to_string(),
        SemanticType::Enum => {
            let members = field
                .enum_values
                .iter()
                .map(|v| format!("\"{v}\""))
                .collect::<Vec<_>>()
                .join(", ");
            format!("sa.Enum({members}, name=\"{}_kind\")", snake(&field.name))
        }
    }
}

/// Migration column call for a field. SQL-expression defaults are wrapped
/// in the ORM's text literal; plain defaults are emitted as literals.
pub fn emit_migration_column(field: &Field) -> String {
    let mut parts = vec![format!("\"{}\"", field.name), sa_type(field)];

    if let Some(fk) = &field.foreign_key {
        parts.push(format!(
            "sa.ForeignKey(\"{}.{}\")",
            table(&fk.entity),
            fk.field
        ));
    }
    if field.name == "id" {
        parts.push("primary_key=True".to_string());
    } else {
        parts.push(format!(
            "nullable={}",
            if field.nullable { "True" } else { "False" }
        ));
    }
    if field.constraint(ValidationType::Uniqueness).is_some() {
        parts.push("unique=True".to_string());
    }
    if let Some(default) = &field.default {
        if field.sql_default {
            parts.push(format!(
                "server_default=sa.text(\"{}\")",
                default.to_string().replace('"', "'")
            ));
        } else {
            parts.push(format!("server_default={}", constraint_literal(default)));
        }
    }

    format!("sa.Column({})", parts.join(", "))
}

/// The initial migration creating every table in FK-topological order.
pub fn migration_file(ir: &ApplicationIr) -> String {
    let mut out = String::new();
    out.push_str("\"\"\"initial schema\"\"\"\n");
    out.push_str("import sqlalchemy as sa\nfrom alembic import op\n\n");
    out.push_str("revision = \"0001\"\ndown_revision = None\n\n\n");
    out.push_str("def upgrade() -> None:\n");

    let ordered = ir.domain.topological_order();
    if ordered.is_empty() {
        out.push_str("    pass\n");
    }
    for entity in &ordered {
        out.push_str(&format!("    op.create_table(\n        \"{}\",\n", table(&entity.name)));
        for field in &entity.fields {
            out.push_str(&format!("        {},\n", emit_migration_column(field)));
        }
        out.push_str("    )\n");
    }
    out.push_str("\n\ndef downgrade() -> None:\n");
    if ordered.is_empty() {
        out.push_str("    pass\n");
    }
    for entity in ordered.iter().rev() {
        out.push_str(&format!("    op.drop_table(\"{}\")\n", table(&entity.name)));
    }
    out
}

// ============================================================================
// ORM entities
// ============================================================================

fn py_type(field: &Field) -> &'static str {
    match field.semantic_type {
        SemanticType::Uuid => "uuid.UUID",
        SemanticType::String | SemanticType::Text | SemanticType::Enum => "str",
        SemanticType::Integer => "int",
        SemanticType::Float => "float",
        SemanticType::Decimal => "decimal.Decimal",
        SemanticType::Boolean => "bool",
        SemanticType::DateTime => "datetime.datetime",
    }
}

fn mapped_column(field: &Field) -> String {
    let mut parts = vec![sa_type(field)];
    if let Some(fk) = &field.foreign_key {
        parts.push(format!(
            "sa.ForeignKey(\"{}.{}\")",
            table(&fk.entity),
            fk.field
        ));
    }
    if field.name == "id" {
        parts.push("primary_key=True".to_string());
        parts.push("default=uuid.uuid4".to_string());
    } else {
        parts.push(format!(
            "nullable={}",
            if field.nullable { "True" } else { "False" }
        ));
    }
    if field.constraint(ValidationType::Uniqueness).is_some() {
        parts.push("unique=True".to_string());
    }
    if let Some(default) = &field.default {
        if field.sql_default {
            parts.push(format!(
                "server_default=sa.text(\"{}\")",
                default.to_string().replace('"', "'")
            ));
        } else {
            parts.push(format!("default={}", constraint_literal(default)));
        }
    }
    let annotation = if field.nullable {
        format!("Mapped[{} | None]", py_type(field))
    } else {
        format!("Mapped[{}]", py_type(field))
    };
    format!(
        "    {}: {annotation} = mapped_column({})",
        field.name,
        parts.join(", ")
    )
}

/// The ORM model module covering every entity.
pub fn entities_file(ir: &ApplicationIr) -> String {
    let mut out = String::new();
    out.push_str("\"\"\"ORM models.\"\"\"\n");
    out.push_str("import datetime\nimport decimal\nimport uuid\n\n");
    out.push_str("import sqlalchemy as sa\nfrom sqlalchemy.orm import Mapped, mapped_column\n\n");
    out.push_str("from src.models.base import Base\n\n");

    for entity in &ir.domain.entities {
        out.push_str(&format!(
            "\nclass {}(Base):\n    __tablename__ = \"{}\"\n\n",
            entity.name,
            table(&entity.name)
        ));
        for field in &entity.fields {
            out.push_str(&mapped_column(field));
            out.push('\n');
        }
    }
    out
}

// ============================================================================
// Pydantic schemas
// ============================================================================

/// One schema field line. The kind decides nullability and which
/// constraints apply; constraints come from `FieldConstraint` only.
pub fn emit_pydantic_field(field: &Field, kind: SchemaKind) -> String {
    let base_type = match field.semantic_type {
        SemanticType::Enum if !field.enum_values.is_empty() => format!(
            "Literal[{}]",
            field
                .enum_values
                .iter()
                .map(|v| format!("\"{v}\""))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        _ => py_type(field).to_string(),
    };

    let mut args: Vec<String> = Vec::new();
    if kind != SchemaKind::Read {
        for constraint in &field.constraints {
            let arg = match constraint.kind {
                ValidationType::RangeMin => Some(format!("ge={}", constraint.value)),
                ValidationType::RangeMax => Some(format!("le={}", constraint.value)),
                ValidationType::LengthMin => Some(format!("min_length={}", constraint.value)),
                ValidationType::LengthMax => Some(format!("max_length={}", constraint.value)),
                ValidationType::Pattern => constraint
                    .value
                    .as_str()
                    .map(|p| format!("pattern=r\"{p}\"")),
                _ => None,
            };
            if let Some(arg) = arg {
                args.push(arg);
            }
        }
    }

    let optional = match kind {
        SchemaKind::Create => field.nullable,
        SchemaKind::Update => true,
        SchemaKind::Read => field.nullable,
    };

    let annotation = if optional {
        format!("{base_type} | None")
    } else {
        base_type
    };

    let default = if optional {
        if args.is_empty() {
            " = None".to_string()
        } else {
            format!(" = Field(default=None, {})", args.join(", "))
        }
    } else if args.is_empty() {
        String::new()
    } else {
        format!(" = Field({})", args.join(", "))
    };

    format!("    {}: {annotation}{default}", field.name)
}

fn schema_fields(entity: &Entity, kind: SchemaKind) -> Vec<String> {
    entity
        .fields
        .iter()
        .filter(|f| match kind {
            // Ids are generated server-side and FKs of nested creates come
            // from the path, but top-level FK fields stay in the body.
            SchemaKind::Create | SchemaKind::Update => f.name != "id",
            SchemaKind::Read => true,
        })
        .map(|f| emit_pydantic_field(f, kind))
        .collect()
}

/// The request/response schema module.
pub fn schemas_file(ir: &ApplicationIr) -> String {
    let mut out = String::new();
    out.push_str("\"\"\"Request and response schemas.\"\"\"\n");
    out.push_str("import datetime\nimport decimal\nimport uuid\n");
    out.push_str("from typing import Literal\n\n");
    out.push_str("from pydantic import BaseModel, ConfigDict, Field\n\n");

    for entity in &ir.domain.entities {
        for (kind, suffix) in [
            (SchemaKind::Create, "Create"),
            (SchemaKind::Update, "Update"),
            (SchemaKind::Read, "Read"),
        ] {
            // FK-only entities take no update payload at all.
            if kind == SchemaKind::Update && entity.fk_only() {
                continue;
            }
            out.push_str(&format!("\nclass {}{suffix}(BaseModel):\n", entity.name));
            if kind == SchemaKind::Read {
                out.push_str("    model_config = ConfigDict(from_attributes=True)\n");
            }
            let fields = schema_fields(entity, kind);
            if fields.is_empty() {
                out.push_str("    pass\n");
            } else {
                for line in fields {
                    out.push_str(&line);
                    out.push('\n');
                }
            }
        }
    }
    out
}

// ============================================================================
// Repositories
// ============================================================================

/// One repository method with its fixed shape.
pub fn emit_repository_method(entity: &Entity, op: RepoOp) -> String {
    let name = &entity.name;
    let var = snake(name);
    match op {
        RepoOp::List => format!(
            "    def list(self) -> list[{name}]:\n\
             \x20       return list(self.session.scalars(sa.select({name})))\n"
        ),
        RepoOp::Get => format!(
            "    def get(self, {var}_id: uuid.UUID) -> {name} | None:\n\
             \x20       return self.session.get({name}, {var}_id)\n"
        ),
        RepoOp::Create => format!(
            "    def create(self, data: dict) -> {name}:\n\
             \x20       obj = {name}(**data)\n\
             \x20       self.session.add(obj)\n\
             \x20       self.session.flush()\n\
             \x20       return obj\n"
        ),
        RepoOp::Update => format!(
            "    def update(self, {var}_id: uuid.UUID, data: dict) -> {name} | None:\n\
             \x20       obj = self.session.get({name}, {var}_id)\n\
             \x20       if obj is None:\n\
             \x20           return None\n\
             \x20       for key, value in data.items():\n\
             \x20           setattr(obj, key, value)\n\
             \x20       self.session.flush()\n\
             \x20       return obj\n"
        ),
        RepoOp::Delete => format!(
            "    def delete(self, {var}_id: uuid.UUID) -> bool:\n\
             \x20       obj = self.session.get({name}, {var}_id)\n\
             \x20       if obj is None:\n\
             \x20           return False\n\
             \x20       self.session.delete(obj)\n\
             \x20       self.session.flush()\n\
             \x20       return True\n"
        ),
    }
}

/// The repository module for one entity. FK-only entities get no update
/// method.
pub fn repository_file(entity: &Entity) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "\"\"\"Data access for {}.\"\"\"\n",
        entity.name
    ));
    out.push_str("import uuid\n\nimport sqlalchemy as sa\nfrom sqlalchemy.orm import Session\n\n");
    out.push_str(&format!("from src.models.entities import {}\n\n\n", entity.name));
    out.push_str(&format!(
        "class {}Repository:\n    def __init__(self, session: Session):\n        self.session = session\n\n",
        entity.name
    ));

    let mut ops = vec![RepoOp::List, RepoOp::Get, RepoOp::Create];
    if !entity.fk_only() {
        ops.push(RepoOp::Update);
    }
    ops.push(RepoOp::Delete);

    let methods: Vec<String> = ops
        .into_iter()
        .map(|op| emit_repository_method(entity, op))
        .collect();
    out.push_str(&methods.join("\n"));
    out
}

// ============================================================================
// Routes
// ============================================================================

/// Existence-checked nested delete: 404 on a mismatched parent/child pair,
/// 204 on success.
pub fn emit_nested_delete(endpoint: &Endpoint, parent: &Entity, child: &Entity, fk_field: &str) -> String {
    let path = positional_path(&endpoint.path, &["parent_id", "child_id"]);
    let child_var = snake(&child.name);
    let op_id = &endpoint.operation_id;
    format!(
        "@router.delete(\"{path}\", status_code=204)\n\
         def {op_id}(parent_id: uuid.UUID, child_id: uuid.UUID, session: Session = Depends(get_session)) -> None:\n\
         \x20   {child_var} = session.get({child}, child_id)\n\
         \x20   if {child_var} is None or {child_var}.{fk_field} != parent_id:\n\
         \x20       raise HTTPException(status_code=404, detail=\"{parent_lower} {child_lower} not found\")\n\
         \x20   session.delete({child_var})\n\
         \x20   session.commit()\n",
        child = child.name,
        parent_lower = snake(&parent.name),
        child_lower = child_var,
    )
}

/// Nested create: existence check on the parent, payload composed from the
/// request body plus the parent id, 201 on success.
pub fn emit_create_child(
    endpoint: &Endpoint,
    parent: &Entity,
    child: &Entity,
    fk_field: &str,
) -> String {
    let path = positional_path(&endpoint.path, &["parent_id"]);
    let op_id = &endpoint.operation_id;
    format!(
        "@router.post(\"{path}\", status_code=201, response_model={child}Read)\n\
         def {op_id}(parent_id: uuid.UUID, payload: {child}Create, session: Session = Depends(get_session)) -> {child}Read:\n\
         \x20   parent = session.get({parent}, parent_id)\n\
         \x20   if parent is None:\n\
         \x20       raise HTTPException(status_code=404, detail=\"{parent_lower} not found\")\n\
         \x20   data = payload.model_dump(exclude_unset=True)\n\
         \x20   data[\"{fk_field}\"] = parent_id\n\
         \x20   obj = {child}(**data)\n\
         \x20   session.add(obj)\n\
         \x20   session.commit()\n\
         \x20   session.refresh(obj)\n\
         \x20   return obj\n",
        parent = parent.name,
        child = child.name,
        parent_lower = snake(&parent.name),
    )
}

/// Rewrite `{id}` placeholders into positional parameter names so nested
/// paths bind distinct function arguments.
fn positional_path(path: &str, names: &[&str]) -> String {
    let mut idx = 0usize;
    path.split('/')
        .map(|seg| {
            if seg.starts_with('{') && seg.ends_with('}') {
                let name = names.get(idx).copied().unwrap_or("id");
                idx += 1;
                format!("{{{name}}}")
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn crud_route(endpoint: &Endpoint, entity: &Entity) -> String {
    let name = &entity.name;
    let var = snake(name);
    let op_id = &endpoint.operation_id;
    let id_param = format!("{var}_id");
    let item_path = positional_path(&endpoint.path, &[id_param.as_str()]);
    match endpoint.method {
        HttpMethod::Get if endpoint.path_params.is_empty() => format!(
            "@router.get(\"{path}\", response_model=list[{name}Read])\n\
             def {op_id}(session: Session = Depends(get_session)) -> list[{name}Read]:\n\
             \x20   return {name}Repository(session).list()\n",
            path = endpoint.path,
        ),
        HttpMethod::Get => format!(
            "@router.get(\"{item_path}\", response_model={name}Read)\n\
             def {op_id}({var}_id: uuid.UUID, session: Session = Depends(get_session)) -> {name}Read:\n\
             \x20   obj = {name}Repository(session).get({var}_id)\n\
             \x20   if obj is None:\n\
             \x20       raise HTTPException(status_code=404, detail=\"{var} not found\")\n\
             \x20   return obj\n",
        ),
        HttpMethod::Post => format!(
            "@router.post(\"{path}\", status_code=201, response_model={name}Read)\n\
             def {op_id}(payload: {name}Create, session: Session = Depends(get_session)) -> {name}Read:\n\
             \x20   obj = {name}Repository(session).create(payload.model_dump(exclude_unset=True))\n\
             \x20   session.commit()\n\
             \x20   session.refresh(obj)\n\
             \x20   return obj\n",
            path = endpoint.path,
        ),
        HttpMethod::Put | HttpMethod::Patch => format!(
            "@router.{method}(\"{item_path}\", response_model={name}Read)\n\
             def {op_id}({var}_id: uuid.UUID, payload: {name}Update, session: Session = Depends(get_session)) -> {name}Read:\n\
             \x20   obj = {name}Repository(session).update({var}_id, payload.model_dump(exclude_unset=True))\n\
             \x20   if obj is None:\n\
             \x20       raise HTTPException(status_code=404, detail=\"{var} not found\")\n\
             \x20   session.commit()\n\
             \x20   return obj\n",
            method = if endpoint.method == HttpMethod::Put { "put" } else { "patch" },
        ),
        HttpMethod::Delete => format!(
            "@router.delete(\"{item_path}\", status_code=204)\n\
             def {op_id}({var}_id: uuid.UUID, session: Session = Depends(get_session)) -> None:\n\
             \x20   if not {name}Repository(session).delete({var}_id):\n\
             \x20       raise HTTPException(status_code=404, detail=\"{var} not found\")\n\
             \x20   session.commit()\n",
        ),
    }
}

/// Action endpoint (`/orders/{id}/pay`) delegating to the service layer.
fn action_route(endpoint: &Endpoint, entity: &Entity, flow: &str) -> String {
    let name = &entity.name;
    let var = snake(name);
    let op_id = &endpoint.operation_id;
    let id_param = format!("{var}_id");
    let path = positional_path(&endpoint.path, &[id_param.as_str()]);
    format!(
        "@router.post(\"{path}\", response_model={name}Read)\n\
         def {op_id}({var}_id: uuid.UUID, session: Session = Depends(get_session)) -> {name}Read:\n\
         \x20   try:\n\
         \x20       result = {name}Service(session).{flow}({var}_id)\n\
         \x20   except LookupError as exc:\n\
         \x20       raise HTTPException(status_code=404, detail=str(exc)) from exc\n\
         \x20   except ValueError as exc:\n\
         \x20       raise HTTPException(status_code=422, detail=str(exc)) from exc\n\
         \x20   session.commit()\n\
         \x20   return result\n"
    )
}

/// The route module for one entity: its CRUD surface plus nested and action
/// endpoints.
pub fn routes_file(ir: &ApplicationIr, entity: &Entity) -> String {
    let endpoints: Vec<&Endpoint> = ir
        .api
        .endpoints
        .iter()
        .filter(|ep| ep.entity == entity.name)
        .collect();

    let mut out = String::new();
    out.push_str(&format!("\"\"\"Routes for {}.\"\"\"\n", entity.name));
    out.push_str("import uuid\n\n");
    out.push_str("from fastapi import APIRouter, Depends, HTTPException\nfrom sqlalchemy.orm import Session\n\n");
    out.push_str("from src.core.db import get_session\n");

    let mut imported_entities = vec![entity.name.clone()];
    let mut needs_service = false;
    for ep in &endpoints {
        if ep.flow.is_some() {
            needs_service = true;
        }
        if ep.is_nested() {
            if let Some(parent) = nested_parent(ir, ep) {
                if !imported_entities.contains(&parent) {
                    imported_entities.push(parent);
                }
            }
        }
    }

    out.push_str(&format!(
        "from src.models.entities import {}\n",
        imported_entities.join(", ")
    ));
    out.push_str(&format!(
        "from src.models.schemas import {name}Create, {name}Read{update}\n",
        name = entity.name,
        update = if entity.fk_only() {
            String::new()
        } else {
            format!(", {}Update", entity.name)
        },
    ));
    out.push_str(&format!(
        "from src.repositories.{}_repository import {}Repository\n",
        snake(&entity.name),
        entity.name
    ));
    if needs_service {
        out.push_str(&format!(
            "from src.services.{}_service import {}Service\n",
            snake(&entity.name),
            entity.name
        ));
    }
    out.push_str("\nrouter = APIRouter()\n\n\n");

    let mut blocks = Vec::new();
    for ep in endpoints {
        if let Some(flow) = &ep.flow {
            blocks.push(action_route(ep, entity, flow));
            continue;
        }
        if ep.is_nested() {
            let Some(parent_name) = nested_parent(ir, ep) else {
                blocks.push(crud_route(ep, entity));
                continue;
            };
            let parent = ir.domain.entity(&parent_name).cloned();
            let fk_field = entity
                .foreign_keys()
                .find(|(_, fk)| fk.entity == parent_name)
                .map(|(f, _)| f.name.clone());
            if let (Some(parent), Some(fk_field)) = (parent, fk_field) {
                match ep.method {
                    HttpMethod::Post => {
                        blocks.push(emit_create_child(ep, &parent, entity, &fk_field));
                    }
                    HttpMethod::Delete => {
                        blocks.push(emit_nested_delete(ep, &parent, entity, &fk_field));
                    }
                    _ => blocks.push(crud_route(ep, entity)),
                }
                continue;
            }
        }
        blocks.push(crud_route(ep, entity));
    }

    out.push_str(&blocks.join("\n\n"));
    out.push('\n');
    out
}

/// The parent entity of a nested endpoint, resolved through the child's FK
/// topology rather than the path text.
fn nested_parent(ir: &ApplicationIr, endpoint: &Endpoint) -> Option<String> {
    let child = ir.domain.entity(&endpoint.entity)?;
    // Prefer the FK whose target matches the first path segment; fall back
    // to the child's only out-edge.
    let seg_entity = endpoint
        .segments()
        .first()
        .map(|seg| normalize::segment_to_entity(seg));
    let mut fks = child.foreign_keys();
    if let Some(seg_entity) = seg_entity {
        if child
            .foreign_keys()
            .any(|(_, fk)| fk.entity == seg_entity)
        {
            return Some(seg_entity);
        }
    }
    fks.next().map(|(_, fk)| fk.entity.clone())
}

// ============================================================================
// Conversion flows and workflow methods
// ============================================================================

/// Render a predicate operand to Python against a receiver variable.
fn render_operand(operand: &Operand, receiver: &str) -> String {
    match operand {
        Operand::Field { entity, field } => match entity {
            Some(entity) => format!("{}.{field}", snake(entity)),
            None => format!("{receiver}.{field}"),
        },
        Operand::Int(i) => i.to_string(),
        Operand::Float(f) => f.to_string(),
        Operand::Str(s) => format!("\"{s}\""),
        Operand::Bool(true) => "True".to_string(),
        Operand::Bool(false) => "False".to_string(),
        Operand::Arith { op, left, right } => {
            let symbol = match op {
                crate::icbr::ArithOp::Add => "+",
                crate::icbr::ArithOp::Sub => "-",
                crate::icbr::ArithOp::Mul => "*",
                crate::icbr::ArithOp::Div => "/",
            };
            format!(
                "({} {symbol} {})",
                render_operand(left, receiver),
                render_operand(right, receiver)
            )
        }
    }
}

/// Render a structural predicate to a Python expression.
fn render_predicate(expr: &PredicateExpr, receiver: &str) -> Option<String> {
    match expr {
        PredicateExpr::Cmp { left, op, right } => {
            let symbol = match op {
                CmpOp::Eq => "==",
                CmpOp::Ne => "!=",
                CmpOp::Gt => ">",
                CmpOp::Ge => ">=",
                CmpOp::Lt => "<",
                CmpOp::Le => "<=",
            };
            Some(format!(
                "{} {symbol} {}",
                render_operand(left, receiver),
                render_operand(right, receiver)
            ))
        }
        PredicateExpr::And(terms) => {
            let rendered: Option<Vec<String>> =
                terms.iter().map(|t| render_predicate(t, receiver)).collect();
            rendered.map(|r| r.join(" and "))
        }
        PredicateExpr::Or(terms) => {
            let rendered: Option<Vec<String>> =
                terms.iter().map(|t| render_predicate(t, receiver)).collect();
            rendered.map(|r| format!("({})", r.join(" or ")))
        }
        PredicateExpr::Not(inner) => {
            render_predicate(inner, receiver).map(|r| format!("not ({r})"))
        }
        PredicateExpr::Truthy(operand) => Some(render_operand(operand, receiver)),
        PredicateExpr::Opaque(_) => None,
    }
}

/// Conversion flow: read the source, construct the target via the IR's
/// explicit field mapping, and write both status transitions in one
/// transaction.
pub fn emit_conversion_flow(flow: &Flow, source: &Entity, target: &Entity) -> String {
    let method = &flow.name;
    let source_var = snake(&source.name);
    let target_var = snake(&target.name);

    let mut out = format!(
        "    def {method}(self, {source_var}_id: uuid.UUID) -> {target}:\n\
         \x20       {source_var} = self.session.get({source}, {source_var}_id)\n\
         \x20       if {source_var} is None:\n\
         \x20           raise LookupError(\"{source_var} not found\")\n",
        source = source.name,
        target = target.name,
    );

    let mappings: Vec<String> = flow
        .field_mappings
        .iter()
        .map(|m| format!("{}={source_var}.{}", m.target, m.source))
        .collect();
    out.push_str(&format!(
        "        {target_var} = {target}({})\n",
        mappings.join(", "),
        target = target.name,
    ));

    // Both sides of the conversion transition atomically.
    out.push_str("        with self.session.begin_nested():\n");
    for tr in &flow.status_transitions {
        let var = if tr.entity == source.name {
            &source_var
        } else {
            &target_var
        };
        out.push_str(&format!("            {var}.{} = \"{}\"\n", tr.field, tr.to));
    }
    out.push_str(&format!("            self.session.add({target_var})\n"));
    out.push_str("        self.session.flush()\n");
    out.push_str(&format!("        return {target_var}\n"));
    out
}

/// Slot body (zero indent) for a lowered flow: precondition checks from
/// structural predicates, effects from atomic operations, transitions last.
/// Flows with empty postconditions and no mutating ops come out as pure
/// reads. This is what SAFE mode inserts into service slots and what the
/// service repair strategy regenerates missing methods from.
pub fn emit_workflow_slot_body(behavior: &FlowBehavior, ir: &ApplicationIr) -> String {
    let subject = workflow_subject(behavior, ir);
    let subject_var = snake(&subject);

    let mut lines: Vec<String> = vec![
        format!("{subject_var} = self.session.get({subject}, {subject_var}_id)"),
        format!("if {subject_var} is None:"),
        format!("    raise LookupError(\"{subject_var} not found\")"),
    ];

    for predicate in behavior.guards.iter().chain(&behavior.preconditions) {
        if let Some(rendered) = render_predicate(&predicate.expr, &subject_var) {
            lines.push(format!("if not ({rendered}):"));
            lines.push(format!(
                "    raise ValueError(\"precondition failed: {}\")",
                predicate.source.replace('"', "'")
            ));
        }
    }

    if !behavior.mutating {
        lines.push(format!("return {subject_var}"));
        return lines.join("\n");
    }

    for op in &behavior.operations {
        match op {
            AtomicOp::Update {
                entity,
                field: Some(field),
                expression,
            } => {
                let var = if *entity == subject {
                    subject_var.clone()
                } else {
                    snake(entity)
                };
                match expression {
                    Some(expr) => {
                        lines.push(format!("{var}.{field} = {}", python_effect(expr, &var)));
                    }
                    None => lines.push(format!("{var}.{field} = {var}.{field}")),
                }
            }
            AtomicOp::Transition {
                entity,
                field,
                from,
                to,
            } => {
                let var = if *entity == subject {
                    subject_var.clone()
                } else {
                    snake(entity)
                };
                lines.push(format!("if {var}.{field} != \"{from}\":"));
                lines.push(format!(
                    "    raise ValueError(\"invalid transition from \" + str({var}.{field}))"
                ));
                lines.push(format!("{var}.{field} = \"{to}\""));
            }
            _ => {}
        }
    }

    lines.push("self.session.flush()".to_string());
    lines.push(format!("return {subject_var}"));
    lines.join("\n")
}

/// A complete workflow method (class indentation) built around the slot
/// body. The service repair strategy uses this to generate missing methods.
pub fn emit_workflow_method(behavior: &FlowBehavior, ir: &ApplicationIr) -> String {
    let subject = workflow_subject(behavior, ir);
    let subject_var = snake(&subject);
    let method = &behavior.flow;

    let mut out = format!("    def {method}(self, {subject_var}_id: uuid.UUID) -> {subject}:\n");
    for line in emit_workflow_slot_body(behavior, ir).lines() {
        out.push_str("        ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// The entity a workflow method operates on: the flow's source entity, or
/// the first entity any operation touches.
pub fn workflow_subject(behavior: &FlowBehavior, ir: &ApplicationIr) -> String {
    if let Some(flow) = ir.behavior.flow(&behavior.flow) {
        if let Some(source) = &flow.source_entity {
            return source.clone();
        }
    }
    for op in &behavior.operations {
        match op {
            AtomicOp::Read { entity }
            | AtomicOp::Create { entity }
            | AtomicOp::Update { entity, .. }
            | AtomicOp::Transition { entity, .. } => return entity.clone(),
            AtomicOp::Link { child, .. } => return child.clone(),
        }
    }
    ir.domain
        .entities
        .first()
        .map(|e| e.name.clone())
        .unwrap_or_default()
}

/// Translate an effect expression (`stock -= quantity`) to a Python
/// right-hand side on the receiver.
fn python_effect(expr: &str, receiver: &str) -> String {
    let trimmed = expr.trim();
    if let Some((lhs, rhs)) = trimmed.split_once("-=") {
        return format!("{receiver}.{} - {}", lhs.trim(), rhs.trim());
    }
    if let Some((lhs, rhs)) = trimmed.split_once("+=") {
        return format!("{receiver}.{} + {}", lhs.trim(), rhs.trim());
    }
    trimmed.to_string()
}

// ============================================================================
// Services, bootstrap, seed
// ============================================================================

/// Whether a flow has the conversion shape the AST stratum can express
/// directly: a source, a target, and explicit field mappings.
pub fn is_conversion_flow(flow: &Flow) -> bool {
    flow.source_entity.is_some() && flow.target_entity.is_some() && !flow.field_mappings.is_empty()
}

/// Service skeleton. Conversion-shaped flows are emitted structurally;
/// every other flow method declares an `LLM_SLOT` region for its body. The
/// slot bodies are filled by the LLM stratum (or deterministically in SAFE
/// mode); everything outside the markers is structural.
pub fn service_skeleton(entity: &Entity, flows: &[&Flow], ir: &ApplicationIr) -> String {
    let mut out = String::new();
    out.push_str(&format!("\"\"\"Business logic for {}.\"\"\"\n", entity.name));
    out.push_str("import uuid\n\nfrom sqlalchemy.orm import Session\n\n");
    out.push_str("from src.models.entities import *  # noqa: F403\n\n\n");
    out.push_str(&format!(
        "class {}Service:\n    def __init__(self, session: Session):\n        self.session = session\n",
        entity.name
    ));

    for flow in flows {
        if is_conversion_flow(flow) {
            let source = flow
                .source_entity
                .as_deref()
                .and_then(|n| ir.domain.entity(n));
            let target = flow
                .target_entity
                .as_deref()
                .and_then(|n| ir.domain.entity(n));
            if let (Some(source), Some(target)) = (source, target) {
                out.push('\n');
                out.push_str(&emit_conversion_flow(flow, source, target));
                continue;
            }
        }
        let subject_var = snake(&entity.name);
        out.push_str(&format!(
            "\n    def {flow_name}(self, {subject_var}_id: uuid.UUID):\n\
             \x20       # LLM_SLOT:start:{flow_name}\n\
             \x20       # LLM_SLOT:end:{flow_name}\n",
            flow_name = flow.name,
        ));
    }
    out
}

/// Application bootstrap: FastAPI app with every router registered.
pub fn main_file(ir: &ApplicationIr) -> String {
    let mut out = String::new();
    out.push_str("\"\"\"Application entry point.\"\"\"\n");
    out.push_str("from fastapi import FastAPI\n\n");
    out.push_str("from src.core.db import init_db\n");
    out.push_str("from src.routes.health import router as health_router\n");

    let mut entity_routers = Vec::new();
    for entity in &ir.domain.entities {
        let var = snake(&entity.name);
        let has_routes = ir.api.endpoints.iter().any(|ep| ep.entity == entity.name);
        if has_routes {
            out.push_str(&format!(
                "from src.routes.{var}_routes import router as {var}_router\n"
            ));
            entity_routers.push(var);
        }
    }

    out.push_str("\napp = FastAPI()\napp.include_router(health_router)\n");
    for var in entity_routers {
        out.push_str(&format!("app.include_router({var}_router)\n"));
    }
    out.push_str("\n\n@app.on_event(\"startup\")\ndef startup() -> None:\n    init_db()\n");
    out
}

/// The seed script. Row ids come from the shared fixture generator, so the
/// smoke runner's parameter substitution agrees with the database content.
pub fn seed_script(ir: &ApplicationIr, fixtures: &FixtureSet) -> String {
    let mut out = String::new();
    out.push_str("\"\"\"Seed deterministic fixtures.\"\"\"\n");
    out.push_str("import uuid\n\n");
    out.push_str("from src.core.db import SessionLocal, init_db\n");
    let entity_names: Vec<&str> = ir.domain.entities.iter().map(|e| e.name.as_str()).collect();
    out.push_str(&format!(
        "from src.models.entities import {}\n\n",
        entity_names.join(", ")
    ));

    out.push_str("\ndef seed() -> None:\n    init_db()\n    session = SessionLocal()\n");
    for row in &fixtures.rows {
        let entity = ir.domain.entity(&row.entity);
        let args: Vec<String> = row
            .values
            .iter()
            .map(|(key, value)| {
                let literal = py_literal(value);
                let is_uuid = entity
                    .and_then(|e| e.field(key))
                    .map_or(key == "id", |f| f.semantic_type == SemanticType::Uuid);
                if is_uuid && value.is_string() {
                    format!("{key}=uuid.UUID({literal})")
                } else {
                    format!("{key}={literal}")
                }
            })
            .collect();
        out.push_str(&format!(
            "    session.merge({}({}))\n",
            row.entity,
            args.join(", ")
        ));
    }
    out.push_str("    session.commit()\n    session.close()\n\n\n");
    out.push_str("if __name__ == \"__main__\":\n    seed()\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FieldConstraint, ForeignKey};

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

    #[test]
    fn test_migration_column_shapes() {
        let mut name = field("name", SemanticType::String);
        name.constraints.push(FieldConstraint::new(
            ValidationType::LengthMax,
            ConstraintValue::Int(64),
        ));
        assert_eq!(
            emit_migration_column(&name),
            "sa.Column(\"name\", sa.String(length=64), nullable=False)"
        );

        let id = field("id", SemanticType::Uuid);
        assert_eq!(
            emit_migration_column(&id),
            "sa.Column(\"id\", sa.Uuid(), primary_key=True)"
        );

        let mut created = field("created_at", SemanticType::DateTime);
        created.default = Some(ConstraintValue::Str("now()".to_string()));
        created.sql_default = true;
        assert!(emit_migration_column(&created).contains("server_default=sa.text(\"now()\")"));
    }

    #[test]
    fn test_fk_column_emits_foreign_key() {
        let mut fk = field("customer_id", SemanticType::Uuid);
        fk.foreign_key = Some(ForeignKey {
            entity: "Customer".to_string(),
            field: "id".to_string(),
        });
        assert!(emit_migration_column(&fk).contains("sa.ForeignKey(\"customers.id\")"));
    }

    #[test]
    fn test_pydantic_field_kinds() {
        let mut price = field("price", SemanticType::Decimal);
        price.constraints.push(FieldConstraint::new(
            ValidationType::RangeMin,
            ConstraintValue::Float(0.01),
        ));

        let create = emit_pydantic_field(&price, SchemaKind::Create);
        assert!(create.contains("ge=0.01"), "{create}");

        let update = emit_pydantic_field(&price, SchemaKind::Update);
        assert!(update.contains("| None"), "{update}");

        let read = emit_pydantic_field(&price, SchemaKind::Read);
        assert!(!read.contains("ge="), "read schemas carry no input constraints");
    }

    #[test]
    fn test_repository_update_skipped_for_fk_only_entity() {
        let entity = Entity {
            name: "Link".to_string(),
            fields: vec![field("id", SemanticType::Uuid), {
                let mut f = field("target_id", SemanticType::Uuid);
                f.foreign_key = Some(ForeignKey {
                    entity: "Link".to_string(),
                    field: "id".to_string(),
                });
                f
            }],
        };
        let module = repository_file(&entity);
        assert!(!module.contains("def update"));
        assert!(module.contains("def delete"));
    }

    #[test]
    fn test_nested_delete_checks_fk_match() {
        let parent = Entity {
            name: "Parent".to_string(),
            fields: vec![field("id", SemanticType::Uuid)],
        };
        let child = Entity {
            name: "Child".to_string(),
            fields: vec![field("id", SemanticType::Uuid)],
        };
        let endpoint = Endpoint {
            method: HttpMethod::Delete,
            path: "/parents/{id}/children/{id}".to_string(),
            operation_id: "delete_parent_child".to_string(),
            path_params: vec![],
            request_schema: None,
            response_schema: None,
            entity: "Child".to_string(),
            inferred: true,
            inference_source: crate::ir::InferenceSource::CrudBestPractice,
            flow: None,
        };
        let code = emit_nested_delete(&endpoint, &parent, &child, "parent_id");
        assert!(code.contains("child.parent_id != parent_id"), "{code}");
        assert!(code.contains("status_code=404"));
        assert!(code.contains("status_code=204"));
    }

    #[test]
    fn test_service_skeleton_has_paired_slots() {
        let entity = Entity {
            name: "Order".to_string(),
            fields: vec![field("id", SemanticType::Uuid)],
        };
        let flow = Flow {
            name: "pay_order".to_string(),
            source_entity: Some("Order".to_string()),
            target_entity: None,
            creates_entity: None,
            guards: vec![],
            preconditions: vec![],
            postconditions: vec![],
            invariants: vec![],
            steps: vec![],
            status_transitions: vec![],
            field_mappings: vec![],
            golden: false,
        };
        let mut ir = ApplicationIr::new("Demo");
        ir.domain.entities.push(entity.clone());
        let skeleton = service_skeleton(&entity, &[&flow], &ir);
        assert!(skeleton.contains("# LLM_SLOT:start:pay_order"));
        assert!(skeleton.contains("# LLM_SLOT:end:pay_order"));
    }
}
