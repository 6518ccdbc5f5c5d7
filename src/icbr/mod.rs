//! # ICBR - Intermediate Canonical Behavior Representation
//!
//! Lowers the `BehaviorModel` into the only form behavior emission consumes:
//! canonical predicates (typed boolean expressions over field values and
//! entity states), atomic operations (read / create / update / link /
//! transition), and a state-transition relation. The lowering is pure and
//! deterministic, so the ICBR is cacheable and always re-derivable from the
//! `ApplicationIr`; the behavior model can be revised without touching any
//! emitter.
//!
//! Predicate surface syntax is parsed with a PEG grammar
//! (`predicate.pest`). Conditions that do not parse as expressions (the
//! spec author wrote prose) are preserved as opaque predicates: they still
//! reach LLM prompts but structural emitters ignore them.

use crate::ir::{ApplicationIr, Flow, StepAction};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[grammar = "icbr/predicate.pest"]
struct PredicateParser;

/// Errors raised during behavior lowering.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IcbrError {
    /// A step references structure the domain model does not have
    #[error("flow '{flow}' step on '{entity}' cannot be lowered: {reason}")]
    UnloweredStep {
        flow: String,
        entity: String,
        reason: String,
    },
}

// ============================================================================
// Predicates
// ============================================================================

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Arithmetic operators inside predicate operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A predicate operand: a field reference, a literal, or arithmetic over
/// operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// `entity.field` or bare `field` (entity resolved by context)
    Field {
        entity: Option<String>,
        field: String,
    },
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Arith {
        op: ArithOp,
        left: Box<Operand>,
        right: Box<Operand>,
    },
}

/// A canonical boolean expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PredicateExpr {
    Cmp {
        left: Operand,
        op: CmpOp,
        right: Operand,
    },
    And(Vec<PredicateExpr>),
    Or(Vec<PredicateExpr>),
    Not(Box<PredicateExpr>),
    /// A bare operand used as a truth value (`active`)
    Truthy(Operand),
    /// Prose the grammar cannot express; carried for prompts only
    Opaque(String),
}

/// A predicate with its original surface text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPredicate {
    pub source: String,
    pub expr: PredicateExpr,
}

impl CanonicalPredicate {
    /// Parse surface text into a canonical predicate. Never fails: prose
    /// degrades to `Opaque`.
    pub fn parse(source: &str) -> Self {
        let expr = parse_predicate(source)
            .unwrap_or_else(|| PredicateExpr::Opaque(source.trim().to_string()));
        CanonicalPredicate {
            source: source.trim().to_string(),
            expr,
        }
    }

    /// Whether the predicate is structural (usable by emitters) rather than
    /// opaque prose.
    pub fn is_structural(&self) -> bool {
        !matches!(self.expr, PredicateExpr::Opaque(_))
    }
}

fn parse_predicate(source: &str) -> Option<PredicateExpr> {
    let mut pairs = PredicateParser::parse(Rule::predicate, source.trim()).ok()?;
    let predicate = pairs.next()?;
    let or_expr = predicate.into_inner().find(|p| p.as_rule() == Rule::or_expr)?;
    build_or(or_expr)
}

fn build_or(pair: Pair<Rule>) -> Option<PredicateExpr> {
    let mut terms = Vec::new();
    for inner in pair.into_inner() {
        if inner.as_rule() == Rule::and_expr {
            terms.push(build_and(inner)?);
        }
    }
    match terms.len() {
        0 => None,
        1 => terms.pop(),
        _ => Some(PredicateExpr::Or(terms)),
    }
}

fn build_and(pair: Pair<Rule>) -> Option<PredicateExpr> {
    let mut terms = Vec::new();
    for inner in pair.into_inner() {
        if inner.as_rule() == Rule::not_expr {
            terms.push(build_not(inner)?);
        }
    }
    match terms.len() {
        0 => None,
        1 => terms.pop(),
        _ => Some(PredicateExpr::And(terms)),
    }
}

fn build_not(pair: Pair<Rule>) -> Option<PredicateExpr> {
    let mut negate = false;
    let mut result = None;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::not_op => negate = true,
            Rule::not_expr => result = Some(build_not(inner)?),
            Rule::comparison => result = Some(build_comparison(inner)?),
            Rule::group => {
                let or = inner.into_inner().find(|p| p.as_rule() == Rule::or_expr)?;
                result = Some(build_or(or)?);
            }
            _ => {}
        }
    }
    result.map(|expr| {
        if negate {
            PredicateExpr::Not(Box::new(expr))
        } else {
            expr
        }
    })
}

fn build_comparison(pair: Pair<Rule>) -> Option<PredicateExpr> {
    let mut inner = pair.into_inner();
    let left = build_sum(inner.next()?)?;
    match (inner.next(), inner.next()) {
        (Some(op), Some(right)) => {
            let op = match op.as_str() {
                "==" | "=" => CmpOp::Eq,
                "!=" => CmpOp::Ne,
                ">=" => CmpOp::Ge,
                "<=" => CmpOp::Le,
                ">" => CmpOp::Gt,
                "<" => CmpOp::Lt,
                _ => return None,
            };
            Some(PredicateExpr::Cmp {
                left,
                op,
                right: build_sum(right)?,
            })
        }
        _ => Some(PredicateExpr::Truthy(left)),
    }
}

fn build_sum(pair: Pair<Rule>) -> Option<Operand> {
    let mut inner = pair.into_inner();
    let mut acc = build_product(inner.next()?)?;
    while let (Some(op), Some(rhs)) = (inner.next(), inner.next()) {
        let op = match op.as_str() {
            "+" => ArithOp::Add,
            "-" => ArithOp::Sub,
            _ => return None,
        };
        acc = Operand::Arith {
            op,
            left: Box::new(acc),
            right: Box::new(build_product(rhs)?),
        };
    }
    Some(acc)
}

fn build_product(pair: Pair<Rule>) -> Option<Operand> {
    let mut inner = pair.into_inner();
    let mut acc = build_atom(inner.next()?)?;
    while let (Some(op), Some(rhs)) = (inner.next(), inner.next()) {
        let op = match op.as_str() {
            "*" => ArithOp::Mul,
            "/" => ArithOp::Div,
            _ => return None,
        };
        acc = Operand::Arith {
            op,
            left: Box::new(acc),
            right: Box::new(build_atom(rhs)?),
        };
    }
    Some(acc)
}

fn build_atom(pair: Pair<Rule>) -> Option<Operand> {
    match pair.as_rule() {
        Rule::atom => {
            let inner = pair.into_inner().next()?;
            match inner.as_rule() {
                Rule::number => {
                    let text = inner.as_str();
                    if text.contains('.') {
                        text.parse().ok().map(Operand::Float)
                    } else {
                        text.parse().ok().map(Operand::Int)
                    }
                }
                Rule::string => {
                    let text = inner.as_str();
                    Some(Operand::Str(text[1..text.len() - 1].to_string()))
                }
                Rule::boolean => Some(Operand::Bool(inner.as_str() == "true")),
                Rule::field_ref => {
                    let text = inner.as_str();
                    match text.split_once('.') {
                        Some((entity, field)) => Some(Operand::Field {
                            entity: Some(entity.to_string()),
                            field: field.to_string(),
                        }),
                        None => Some(Operand::Field {
                            entity: None,
                            field: text.to_string(),
                        }),
                    }
                }
                Rule::sum => build_sum(inner),
                _ => None,
            }
        }
        _ => None,
    }
}

// ============================================================================
// Atomic operations and transitions
// ============================================================================

/// The atomic operations behavior emission composes flows from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AtomicOp {
    Read {
        entity: String,
    },
    Create {
        entity: String,
    },
    Update {
        entity: String,
        field: Option<String>,
        /// Effect expression, e.g. `stock -= quantity`
        expression: Option<String>,
    },
    Link {
        parent: String,
        child: String,
        fk_field: String,
    },
    Transition {
        entity: String,
        field: String,
        from: String,
        to: String,
    },
}

/// One edge of the state-transition relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEdge {
    pub entity: String,
    pub field: String,
    pub from: String,
    pub to: String,
    pub flow: String,
}

/// A fully lowered flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowBehavior {
    pub flow: String,
    pub guards: Vec<CanonicalPredicate>,
    pub preconditions: Vec<CanonicalPredicate>,
    pub postconditions: Vec<CanonicalPredicate>,
    pub invariants: Vec<CanonicalPredicate>,
    pub operations: Vec<AtomicOp>,
    pub transitions: Vec<TransitionEdge>,
    /// Whether the flow mutates anything; pure reads emit no transaction
    pub mutating: bool,
}

/// The complete lowered behavior model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorIr {
    pub flows: Vec<FlowBehavior>,
    pub transition_relation: Vec<TransitionEdge>,
}

impl BehaviorIr {
    pub fn flow(&self, name: &str) -> Option<&FlowBehavior> {
        self.flows.iter().find(|f| f.flow == name)
    }
}

/// Lower the behavior model of an IR. Pure and deterministic.
pub fn lower(ir: &ApplicationIr) -> Result<BehaviorIr, IcbrError> {
    let mut flows = Vec::new();
    let mut transition_relation = Vec::new();

    for flow in &ir.behavior.flows {
        let lowered = lower_flow(ir, flow)?;
        transition_relation.extend(lowered.transitions.iter().cloned());
        flows.push(lowered);
    }

    Ok(BehaviorIr {
        flows,
        transition_relation,
    })
}

fn lower_flow(ir: &ApplicationIr, flow: &Flow) -> Result<FlowBehavior, IcbrError> {
    let parse_all = |texts: &[String]| -> Vec<CanonicalPredicate> {
        texts.iter().map(|t| CanonicalPredicate::parse(t)).collect()
    };

    let mut operations = Vec::new();
    for step in &flow.steps {
        let op = match step.action {
            StepAction::Read => AtomicOp::Read {
                entity: step.entity.clone(),
            },
            StepAction::Create => AtomicOp::Create {
                entity: step.entity.clone(),
            },
            StepAction::Update => AtomicOp::Update {
                entity: step.entity.clone(),
                field: step.field.clone(),
                expression: step.detail.clone(),
            },
            StepAction::Link => {
                // The linking FK lives on the step's entity; resolve its target.
                let child = ir.domain.entity(&step.entity).ok_or_else(|| {
                    IcbrError::UnloweredStep {
                        flow: flow.name.clone(),
                        entity: step.entity.clone(),
                        reason: "unknown entity".to_string(),
                    }
                })?;
                let (fk_field, fk) = match &step.field {
                    Some(name) => {
                        let field = child.field(name).ok_or_else(|| IcbrError::UnloweredStep {
                            flow: flow.name.clone(),
                            entity: step.entity.clone(),
                            reason: format!("unknown link field '{name}'"),
                        })?;
                        let fk = field.foreign_key.as_ref().ok_or_else(|| {
                            IcbrError::UnloweredStep {
                                flow: flow.name.clone(),
                                entity: step.entity.clone(),
                                reason: format!("link field '{name}' is not a foreign key"),
                            }
                        })?;
                        (field.name.clone(), fk.clone())
                    }
                    None => {
                        let (field, fk) = child.foreign_keys().next().ok_or_else(|| {
                            IcbrError::UnloweredStep {
                                flow: flow.name.clone(),
                                entity: step.entity.clone(),
                                reason: "no foreign key to link through".to_string(),
                            }
                        })?;
                        (field.name.clone(), fk.clone())
                    }
                };
                AtomicOp::Link {
                    parent: fk.entity,
                    child: step.entity.clone(),
                    fk_field,
                }
            }
            StepAction::Transition => {
                // Transition steps are realized from the flow's declared
                // status transitions below; keep the read side here.
                AtomicOp::Read {
                    entity: step.entity.clone(),
                }
            }
        };
        operations.push(op);
    }

    let mut transitions = Vec::new();
    for tr in &flow.status_transitions {
        operations.push(AtomicOp::Transition {
            entity: tr.entity.clone(),
            field: tr.field.clone(),
            from: tr.from.clone(),
            to: tr.to.clone(),
        });
        transitions.push(TransitionEdge {
            entity: tr.entity.clone(),
            field: tr.field.clone(),
            from: tr.from.clone(),
            to: tr.to.clone(),
            flow: flow.name.clone(),
        });
    }

    // A creates_entity with no explicit Create step still creates.
    if let Some(created) = &flow.creates_entity {
        let has_create = operations
            .iter()
            .any(|op| matches!(op, AtomicOp::Create { entity } if entity == created));
        if !has_create {
            operations.push(AtomicOp::Create {
                entity: created.clone(),
            });
        }
    }

    let mutating = operations.iter().any(|op| {
        !matches!(op, AtomicOp::Read { .. })
    });

    let invariants: Vec<CanonicalPredicate> = flow
        .invariants
        .iter()
        .filter(|i| i.enabled)
        .map(|i| CanonicalPredicate::parse(&i.expression))
        .collect();

    Ok(FlowBehavior {
        flow: flow.name.clone(),
        guards: parse_all(&flow.guards),
        preconditions: parse_all(&flow.preconditions),
        postconditions: parse_all(&flow.postconditions),
        invariants,
        operations,
        transitions,
        mutating,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_comparison() {
        let p = CanonicalPredicate::parse("total > 0");
        assert!(p.is_structural());
        assert_eq!(
            p.expr,
            PredicateExpr::Cmp {
                left: Operand::Field {
                    entity: None,
                    field: "total".to_string()
                },
                op: CmpOp::Gt,
                right: Operand::Int(0),
            }
        );
    }

    #[test]
    fn test_parse_qualified_field_and_conjunction() {
        let p = CanonicalPredicate::parse("cart.total >= 10 and status == \"open\"");
        match p.expr {
            PredicateExpr::And(terms) => assert_eq!(terms.len(), 2),
            other => panic!("expected conjunction, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_arithmetic_operand() {
        let p = CanonicalPredicate::parse("total + quantity * unit_price >= 100");
        let PredicateExpr::Cmp { left, op, .. } = p.expr else {
            panic!("expected comparison");
        };
        assert_eq!(op, CmpOp::Ge);
        assert!(matches!(left, Operand::Arith { op: ArithOp::Add, .. }));
    }

    #[test]
    fn test_prose_degrades_to_opaque() {
        let p = CanonicalPredicate::parse("the customer must already exist");
        assert!(!p.is_structural());
        assert_eq!(
            p.expr,
            PredicateExpr::Opaque("the customer must already exist".to_string())
        );
    }

    #[test]
    fn test_negation_and_grouping() {
        let p = CanonicalPredicate::parse("not (stock < quantity)");
        assert!(matches!(p.expr, PredicateExpr::Not(_)));
    }
}
