//! # Delta Validator
//!
//! After a round of mutations, the next smoke iteration may restrict
//! itself to the affected scope: the entities and endpoints whose
//! generated files were touched, resolved through the generation
//! manifest's atom ids. Strictly an optimization - the orchestrator still
//! requires at least one full smoke run per pipeline before any result may
//! be declared converged.

use super::mutation::Mutation;
use crate::ir::ApplicationIr;
use crate::manifest::GenerationManifest;
use crate::smoke::Scenario;
use std::collections::HashSet;

/// The entities and endpoints a mutation round touched.
#[derive(Debug, Clone, Default)]
pub struct AffectedScope {
    pub entities: HashSet<String>,
    pub operation_ids: HashSet<String>,
}

impl AffectedScope {
    /// Resolve the scope of a mutation set through the manifest.
    pub fn from_mutations(
        mutations: &[Mutation],
        manifest: &GenerationManifest,
        ir: &ApplicationIr,
    ) -> Self {
        let mut scope = AffectedScope::default();
        for mutation in mutations {
            let Some(record) = manifest.files.get(&mutation.file_path) else {
                continue;
            };
            for atom in &record.atoms {
                if let Some(entity) = atom.strip_prefix("entity:") {
                    scope.entities.insert(entity.to_string());
                } else if let Some(op) = atom.strip_prefix("endpoint:") {
                    scope.operation_ids.insert(op.to_string());
                    if let Some(ep) = ir.api.by_operation_id(op) {
                        scope.entities.insert(ep.entity.clone());
                    }
                } else if let Some(flow) = atom.strip_prefix("flow:") {
                    if let Some(flow) = ir.behavior.flow(flow) {
                        for entity in flow.entities() {
                            scope.entities.insert(entity.to_string());
                        }
                    }
                }
            }
        }
        scope
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.operation_ids.is_empty()
    }

    /// Whether a scenario belongs to the affected scope.
    pub fn selects(&self, scenario: &Scenario) -> bool {
        scenario
            .entities
            .iter()
            .any(|entity| self.entities.contains(entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::stratum::Stratum;
    use crate::ir::IrStats;
    use crate::manifest::FileRecord;

    #[test]
    fn test_scope_resolves_entities_through_atoms() {
        let ir = ApplicationIr::new("Shop");
        let mut manifest = GenerationManifest::new(
            "app",
            "safe".to_string(),
            false,
            IrStats {
                total_entities: 1,
                total_endpoints: 1,
                inferred_endpoints: 0,
            },
        );
        manifest.record(
            "src/models/schemas.py",
            FileRecord {
                stratum: Stratum::Ast,
                source_id: "ast:schemas".to_string(),
                atoms: vec!["entity:Widget".to_string()],
                tokens_in: 0,
                tokens_out: 0,
                model: None,
                elapsed_ms: 0,
                passed: true,
            },
        );

        let mutation = Mutation {
            file_path: "src/models/schemas.py".to_string(),
            violation_key: "k".to_string(),
            fix_type: "validation".to_string(),
            description: "d".to_string(),
            diff: String::new(),
            after: String::new(),
            outcome: None,
            realignment: None,
        };
        let scope = AffectedScope::from_mutations(&[mutation], &manifest, &ir);
        assert!(scope.entities.contains("Widget"));
    }
}
