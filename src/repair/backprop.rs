//! # IR Backpropagation
//!
//! After a successful repair iteration, the mutations are mapped back to IR
//! elements and the `ApplicationIr` is updated so later smoke runs and
//! compliance checks see a consistent IR-to-code projection. This module
//! holds the single writable handle to the IR after lowering; every
//! realignment appends to the IR's `repair_history`, and realignment is
//! idempotent - applying the same set twice leaves the IR unchanged.

use super::mutation::Mutation;
use crate::ir::{ApplicationIr, ConstraintValue, FieldConstraint, RepairRecord, ValidationType};
use serde::Serialize;
use tracing::debug;

/// The IR-level meaning of a code mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "realignment_kind", rename_all = "snake_case")]
pub enum IrRealignment {
    /// A column became nullable (e.g. repair added `nullable=True`)
    FieldNullable { entity: String, field: String },
    /// A field default was introduced
    FieldDefault {
        entity: String,
        field: String,
        value: ConstraintValue,
        sql: bool,
    },
    /// A constraint value was rebuilt
    Constraint {
        entity: String,
        field: String,
        kind: ValidationType,
        value: ConstraintValue,
    },
    /// A flow gained a precondition (e.g. an injected existence check)
    FlowPrecondition { flow: String, predicate: String },
}

/// The single IR writer used during repair.
pub struct IrBackpropagator;

impl IrBackpropagator {
    /// Apply every realignment implied by an iteration's mutations.
    /// Returns how many changed the IR (idempotent re-application returns
    /// zero).
    pub fn realign(ir: &mut ApplicationIr, mutations: &[Mutation], iteration: u32) -> usize {
        let mut applied = 0usize;
        for mutation in mutations {
            let Some(realignment) = &mutation.realignment else {
                continue;
            };
            if Self::apply(ir, realignment) {
                applied += 1;
                let (entity, field) = realignment_target(realignment);
                ir.repair_history.push(RepairRecord {
                    iteration,
                    description: describe(realignment),
                    entity,
                    field,
                    applied_at: chrono::Utc::now(),
                });
                debug!(description = %describe(realignment), "IR realigned");
            }
        }
        applied
    }

    /// Apply one realignment. Returns false when the IR already reflects
    /// it.
    fn apply(ir: &mut ApplicationIr, realignment: &IrRealignment) -> bool {
        match realignment {
            IrRealignment::FieldNullable { entity, field } => {
                let Some(field) = field_mut(ir, entity, field) else {
                    return false;
                };
                if field.nullable {
                    false
                } else {
                    field.nullable = true;
                    true
                }
            }
            IrRealignment::FieldDefault {
                entity,
                field,
                value,
                sql,
            } => {
                let Some(field) = field_mut(ir, entity, field) else {
                    return false;
                };
                if field.default.as_ref() == Some(value) && field.sql_default == *sql {
                    false
                } else {
                    field.default = Some(value.clone());
                    field.sql_default = *sql;
                    true
                }
            }
            IrRealignment::Constraint {
                entity,
                field,
                kind,
                value,
            } => {
                let Some(field) = field_mut(ir, entity, field) else {
                    return false;
                };
                match field.constraints.iter_mut().find(|c| c.kind == *kind) {
                    Some(existing) if existing.value == *value => false,
                    Some(existing) => {
                        existing.value = value.clone();
                        true
                    }
                    None => {
                        field
                            .constraints
                            .push(FieldConstraint::new(*kind, value.clone()));
                        true
                    }
                }
            }
            IrRealignment::FlowPrecondition { flow, predicate } => {
                let Some(flow) = ir.behavior.flows.iter_mut().find(|f| f.name == *flow) else {
                    return false;
                };
                if flow.preconditions.iter().any(|p| p == predicate) {
                    false
                } else {
                    flow.preconditions.push(predicate.clone());
                    true
                }
            }
        }
    }
}

fn field_mut<'a>(
    ir: &'a mut ApplicationIr,
    entity: &str,
    field: &str,
) -> Option<&'a mut crate::ir::Field> {
    ir.domain
        .entities
        .iter_mut()
        .find(|e| e.name == entity)?
        .fields
        .iter_mut()
        .find(|f| f.name == field)
}

fn realignment_target(realignment: &IrRealignment) -> (Option<String>, Option<String>) {
    match realignment {
        IrRealignment::FieldNullable { entity, field }
        | IrRealignment::FieldDefault { entity, field, .. }
        | IrRealignment::Constraint { entity, field, .. } => {
            (Some(entity.clone()), Some(field.clone()))
        }
        IrRealignment::FlowPrecondition { .. } => (None, None),
    }
}

fn describe(realignment: &IrRealignment) -> String {
    match realignment {
        IrRealignment::FieldNullable { entity, field } => {
            format!("{entity}.{field} nullable=true")
        }
        IrRealignment::FieldDefault {
            entity,
            field,
            value,
            ..
        } => format!("{entity}.{field} default={value}"),
        IrRealignment::Constraint {
            entity,
            field,
            kind,
            value,
        } => format!("{entity}.{field}.{kind}={value}"),
        IrRealignment::FlowPrecondition { flow, predicate } => {
            format!("{flow} precondition '{predicate}'")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Entity, Field, SemanticType};

    fn ir_with_field() -> ApplicationIr {
        let mut ir = ApplicationIr::new("Shop");
        ir.domain.entities.push(Entity {
            name: "Order".to_string(),
            fields: vec![Field {
                name: "customer_id".to_string(),
                semantic_type: SemanticType::Uuid,
                nullable: false,
                default: None,
                sql_default: false,
                constraints: vec![],
                foreign_key: None,
                enum_values: vec![],
            }],
        });
        ir
    }

    fn nullable_mutation() -> Mutation {
        Mutation {
            file_path: "src/models/entities.py".to_string(),
            violation_key: "k".to_string(),
            fix_type: "database".to_string(),
            description: "d".to_string(),
            diff: String::new(),
            after: String::new(),
            outcome: None,
            realignment: Some(IrRealignment::FieldNullable {
                entity: "Order".to_string(),
                field: "customer_id".to_string(),
            }),
        }
    }

    #[test]
    fn test_realignment_updates_ir_and_history() {
        let mut ir = ir_with_field();
        let applied = IrBackpropagator::realign(&mut ir, &[nullable_mutation()], 1);
        assert_eq!(applied, 1);
        assert!(ir.field("Order", "customer_id").expect("field").nullable);
        assert_eq!(ir.repair_history.len(), 1);
        assert_eq!(ir.repair_history[0].iteration, 1);
    }

    #[test]
    fn test_realignment_is_idempotent() {
        let mut ir = ir_with_field();
        let mutations = [nullable_mutation()];
        IrBackpropagator::realign(&mut ir, &mutations, 1);
        let second = IrBackpropagator::realign(&mut ir, &mutations, 2);
        assert_eq!(second, 0, "re-applying the same mutations changes nothing");
        assert_eq!(ir.repair_history.len(), 1);
    }
}
