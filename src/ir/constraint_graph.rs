//! # Constraint Graph
//!
//! A frozen entity↔constraint↔entity graph used by the error classifier to
//! decide whether a runtime failure spans multiple entities (and therefore
//! needs a composite repair).
//!
//! The graph is built up-front from the IR and never mutated afterwards.
//! Nodes live in a flat array addressed by integer index; edges are one-way
//! and sorted by destination index, so traversal is deterministic and there
//! are no back-pointers to keep consistent.

use super::ApplicationIr;
use std::collections::HashMap;

/// Node kinds in the constraint graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphNode {
    /// An entity, by canonical name
    Entity(String),
    /// A constraint rule, by canonical key `{entity}.{field}.{type}`
    Constraint(String),
    /// A flow, by canonical name
    Flow(String),
}

/// Frozen adjacency-list graph over entities, constraints, and flows.
#[derive(Debug, Clone)]
pub struct ConstraintGraph {
    nodes: Vec<GraphNode>,
    /// Outgoing edges per node, sorted by destination index
    adjacency: Vec<Vec<usize>>,
    /// Entity name → node index
    entity_index: HashMap<String, usize>,
}

impl ConstraintGraph {
    /// Build the graph from an IR. Edges:
    /// - entity → constraint for every rule on one of its fields
    /// - entity → entity for every FK relationship
    /// - flow → entity for every entity the flow touches
    pub fn build(ir: &ApplicationIr) -> Self {
        let mut nodes = Vec::new();
        let mut entity_index = HashMap::new();
        let mut constraint_index = HashMap::new();
        let mut flow_index = HashMap::new();

        for entity in &ir.domain.entities {
            entity_index.insert(entity.name.clone(), nodes.len());
            nodes.push(GraphNode::Entity(entity.name.clone()));
        }
        for rule in &ir.validation.rules {
            let key = rule.key();
            constraint_index.insert(key.clone(), nodes.len());
            nodes.push(GraphNode::Constraint(key));
        }
        for flow in &ir.behavior.flows {
            flow_index.insert(flow.name.clone(), nodes.len());
            nodes.push(GraphNode::Flow(flow.name.clone()));
        }

        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

        for rule in &ir.validation.rules {
            if let (Some(&from), Some(&to)) = (
                entity_index.get(&rule.entity),
                constraint_index.get(&rule.key()),
            ) {
                adjacency[from].push(to);
            }
        }
        for entity in &ir.domain.entities {
            let from = entity_index[&entity.name];
            for (_, fk) in entity.foreign_keys() {
                if let Some(&to) = entity_index.get(&fk.entity) {
                    adjacency[from].push(to);
                }
            }
        }
        for flow in &ir.behavior.flows {
            let from = flow_index[&flow.name];
            for entity in flow.entities() {
                if let Some(&to) = entity_index.get(entity) {
                    adjacency[from].push(to);
                }
            }
        }

        for edges in &mut adjacency {
            edges.sort_unstable();
            edges.dedup();
        }

        ConstraintGraph {
            nodes,
            adjacency,
            entity_index,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, idx: usize) -> Option<&GraphNode> {
        self.nodes.get(idx)
    }

    pub fn neighbors(&self, idx: usize) -> &[usize] {
        self.adjacency.get(idx).map_or(&[], Vec::as_slice)
    }

    /// Entities reachable from `entity` through FK edges, the entity itself
    /// included. Bounded breadth-first walk over the frozen adjacency.
    pub fn entity_cluster(&self, entity: &str) -> Vec<String> {
        let Some(&start) = self.entity_index.get(entity) else {
            return Vec::new();
        };
        let mut visited = vec![false; self.nodes.len()];
        let mut queue = vec![start];
        let mut cluster = Vec::new();
        visited[start] = true;

        while let Some(idx) = queue.pop() {
            if let GraphNode::Entity(name) = &self.nodes[idx] {
                cluster.push(name.clone());
            }
            for &next in self.neighbors(idx) {
                if !visited[next] && matches!(self.nodes[next], GraphNode::Entity(_)) {
                    visited[next] = true;
                    queue.push(next);
                }
            }
        }
        cluster.sort_unstable();
        cluster
    }

    /// Whether a flow touches more than one entity. Multi-entity failures
    /// get composite repairs instead of single-field fixes.
    pub fn is_multi_entity_flow(&self, ir: &ApplicationIr, flow_name: &str) -> bool {
        ir.behavior
            .flow(flow_name)
            .map_or(false, |f| f.entities().len() > 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        ConstraintRule, ConstraintValue, Entity, Field, FieldConstraint, ForeignKey, Provenance,
        SemanticType, ValidationType,
    };

    fn field(name: &str, fk: Option<&str>) -> Field {
        Field {
            name: name.to_string(),
            semantic_type: SemanticType::Uuid,
            nullable: false,
            default: None,
            sql_default: false,
            constraints: vec![],
            foreign_key: fk.map(|e| ForeignKey {
                entity: e.to_string(),
                field: "id".to_string(),
            }),
            enum_values: vec![],
        }
    }

    #[test]
    fn test_entity_cluster_follows_fk_edges() {
        let mut ir = ApplicationIr::new("Shop");
        ir.domain.entities.push(Entity {
            name: "Cart".to_string(),
            fields: vec![field("id", None)],
        });
        ir.domain.entities.push(Entity {
            name: "CartItem".to_string(),
            fields: vec![field("id", None), field("cart_id", Some("Cart"))],
        });
        ir.domain.entities.push(Entity {
            name: "Product".to_string(),
            fields: vec![field("id", None)],
        });

        let graph = ConstraintGraph::build(&ir);
        let cluster = graph.entity_cluster("CartItem");
        assert_eq!(cluster, vec!["Cart".to_string(), "CartItem".to_string()]);
        assert_eq!(graph.entity_cluster("Product"), vec!["Product".to_string()]);
    }

    #[test]
    fn test_edges_sorted_and_deduped() {
        let mut ir = ApplicationIr::new("Shop");
        ir.domain.entities.push(Entity {
            name: "Widget".to_string(),
            fields: vec![field("id", None)],
        });
        for kind in [ValidationType::LengthMin, ValidationType::LengthMax] {
            ir.validation.rules.push(ConstraintRule {
                entity: "Widget".to_string(),
                field: "id".to_string(),
                constraint: FieldConstraint::new(kind, ConstraintValue::Int(1)),
                confidence: 1.0,
                provenance: Provenance::Spec,
            });
        }

        let graph = ConstraintGraph::build(&ir);
        let edges = graph.neighbors(0);
        let mut sorted = edges.to_vec();
        sorted.sort_unstable();
        assert_eq!(edges, sorted.as_slice());
        assert_eq!(edges.len(), 2);
    }
}
