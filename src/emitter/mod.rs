//! # Stratified Emitter
//!
//! Emits the full source tree of the target application. Every file belongs
//! to exactly one stratum (Template / AST / LLM) decided by the
//! classification table in `stratum`; the LLM writes only inside declared
//! slots, and template-protected paths are off-limits to it entirely.
//!
//! Emission runs level by level - templates, then AST files, then LLM slot
//! fills - with atoms inside a level executed in parallel (rayon for the
//! CPU-bound strata, a bounded tokio pool for LLM calls). Files are written
//! atomically (temp + rename) and every file lands in the generation
//! manifest with its source id, atoms, token usage, and elapsed time.

pub mod ast_gen;
pub mod llm_stratum;
pub mod slots;
pub mod stratum;
pub mod templates;

use crate::cancel::CancelToken;
use crate::config::{Config, ExecutionMode};
use crate::error::PipelineError;
use crate::icbr::BehaviorIr;
use crate::ir::ApplicationIr;
use crate::learning::LearningStore;
use crate::llm::LlmClient;
use crate::lowering::normalize;
use crate::manifest::{FileRecord, GenerationManifest};
use crate::smoke::fixtures::FixtureSet;
use rayon::prelude::*;
use slots::SlotConstraints;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratum::Stratum;
use tracing::{debug, info};

/// Everything emission reads. The IR is borrowed immutably; the emitter
/// never writes it.
pub struct EmitInputs<'a> {
    pub ir: &'a ApplicationIr,
    pub behavior: &'a BehaviorIr,
    pub fixtures: &'a FixtureSet,
    pub config: &'a Config,
    pub learning: Option<&'a LearningStore>,
}

/// One planned, rendered file waiting to be written.
struct RenderedFile {
    path: String,
    stratum: Stratum,
    source_id: String,
    atoms: Vec<String>,
    content: String,
    tokens_in: u32,
    tokens_out: u32,
    model: Option<String>,
    elapsed_ms: u64,
    passed: bool,
}

/// The stratified emitter.
pub struct StratifiedEmitter {
    llm: Arc<dyn LlmClient>,
    llm_deadline: Duration,
}

impl StratifiedEmitter {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        StratifiedEmitter {
            llm,
            llm_deadline: crate::llm::DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.llm_deadline = deadline;
        self
    }

    /// Emit the application into `out_dir` and return the manifest.
    pub async fn emit(
        &self,
        inputs: &EmitInputs<'_>,
        out_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<GenerationManifest, PipelineError> {
        let ir = inputs.ir;
        let app_id = format!(
            "{}-{}",
            normalize::to_snake_case(&ir.app_name),
            ir.spec_digest.get(..8).unwrap_or("00000000")
        );
        let mut manifest = GenerationManifest::new(
            app_id,
            format!("{:?}", inputs.config.execution_mode).to_lowercase(),
            inputs.config.strict_mode,
            ir.stats(),
        );

        let lint = EmissionLint::build(ir);

        // Level 0: templates.
        cancel.check().map_err(|_| PipelineError::Cancelled)?;
        let template_files = self.emit_templates(inputs, &lint)?;
        write_all(out_dir, &template_files, &mut manifest)?;

        // Level 1: AST files.
        cancel.check().map_err(|_| PipelineError::Cancelled)?;
        let ast_files = self.emit_ast(inputs)?;
        write_all(out_dir, &ast_files, &mut manifest)?;

        // Level 2: services and free-form artifacts.
        cancel.check().map_err(|_| PipelineError::Cancelled)?;
        let llm_files = self.emit_llm_level(inputs, cancel).await?;
        write_all(out_dir, &llm_files, &mut manifest)?;

        manifest.write(out_dir)?;
        info!(
            files = manifest.files.len(),
            template = manifest.stratum_summary.template_files,
            ast = manifest.stratum_summary.ast_files,
            llm = manifest.stratum_summary.llm_files,
            "emission complete"
        );
        Ok(manifest)
    }

    fn emit_templates(
        &self,
        inputs: &EmitInputs<'_>,
        lint: &EmissionLint,
    ) -> Result<Vec<RenderedFile>, PipelineError> {
        let rendered: Vec<Result<RenderedFile, PipelineError>> =
            templates::render_all(&inputs.ir.app_name, &inputs.ir.infrastructure)
                .into_par_iter()
                .map(|file| {
                    let start = Instant::now();
                    stratum::check_write(file.path, Stratum::Template).map_err(violation_error)?;
                    lint.check(file.path, &file.content)?;
                    Ok(RenderedFile {
                        path: file.path.to_string(),
                        stratum: Stratum::Template,
                        source_id: file.source_id,
                        atoms: vec![],
                        content: file.content,
                        tokens_in: 0,
                        tokens_out: 0,
                        model: None,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                        passed: true,
                    })
                })
                .collect();
        rendered.into_iter().collect()
    }

    fn emit_ast(&self, inputs: &EmitInputs<'_>) -> Result<Vec<RenderedFile>, PipelineError> {
        let ir = inputs.ir;

        // Plan: (path, source_id, atoms, generator)
        type Gen<'a> = Box<dyn Fn() -> String + Send + Sync + 'a>;
        let mut plan: Vec<(String, String, Vec<String>, Gen<'_>)> = Vec::new();

        plan.push((
            "src/models/entities.py".to_string(),
            "ast:entities".to_string(),
            ir.domain
                .entities
                .iter()
                .map(|e| format!("entity:{}", e.name))
                .collect(),
            Box::new(move || ast_gen::entities_file(ir)),
        ));
        plan.push((
            "src/models/schemas.py".to_string(),
            "ast:schemas".to_string(),
            ir.domain
                .entities
                .iter()
                .map(|e| format!("entity:{}", e.name))
                .collect(),
            Box::new(move || ast_gen::schemas_file(ir)),
        ));
        plan.push((
            "migrations/versions/0001_initial.py".to_string(),
            "ast:migration".to_string(),
            ir.domain
                .entities
                .iter()
                .map(|e| format!("entity:{}", e.name))
                .collect(),
            Box::new(move || ast_gen::migration_file(ir)),
        ));
        plan.push((
            "src/main.py".to_string(),
            "ast:bootstrap".to_string(),
            vec![],
            Box::new(move || ast_gen::main_file(ir)),
        ));
        let fixtures = inputs.fixtures;
        plan.push((
            "scripts/seed.py".to_string(),
            "ast:seed".to_string(),
            ir.domain
                .entities
                .iter()
                .map(|e| format!("entity:{}", e.name))
                .collect(),
            Box::new(move || ast_gen::seed_script(ir, fixtures)),
        ));

        for entity in &ir.domain.entities {
            let snake = normalize::to_snake_case(&entity.name);
            plan.push((
                format!("src/repositories/{snake}_repository.py"),
                "ast:repository".to_string(),
                vec![format!("entity:{}", entity.name)],
                Box::new(move || ast_gen::repository_file(entity)),
            ));

            let endpoint_atoms: Vec<String> = ir
                .api
                .endpoints
                .iter()
                .filter(|ep| ep.entity == entity.name)
                .map(|ep| format!("endpoint:{}", ep.operation_id))
                .collect();
            if !endpoint_atoms.is_empty() {
                plan.push((
                    format!("src/routes/{snake}_routes.py"),
                    "ast:routes".to_string(),
                    endpoint_atoms,
                    Box::new(move || ast_gen::routes_file(ir, entity)),
                ));
            }
        }

        let rendered: Vec<Result<RenderedFile, PipelineError>> = plan
            .into_par_iter()
            .map(|(path, source_id, atoms, generate)| {
                let start = Instant::now();
                stratum::check_write(&path, Stratum::Ast).map_err(violation_error)?;
                Ok(RenderedFile {
                    path,
                    stratum: Stratum::Ast,
                    source_id,
                    atoms,
                    content: generate(),
                    tokens_in: 0,
                    tokens_out: 0,
                    model: None,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    passed: true,
                })
            })
            .collect();
        rendered.into_iter().collect()
    }

    async fn emit_llm_level(
        &self,
        inputs: &EmitInputs<'_>,
        cancel: &CancelToken,
    ) -> Result<Vec<RenderedFile>, PipelineError> {
        let ir = inputs.ir;
        let config = inputs.config;
        let safe = config.execution_mode == ExecutionMode::Safe;
        let constraints = slot_constraints(config.execution_mode);
        let llm_stratum = Arc::new(llm_stratum::LlmStratum::new(
            Arc::clone(&self.llm),
            self.llm_deadline,
        ));

        // Group flows by their subject entity.
        let mut by_entity: Vec<(String, Vec<String>)> = Vec::new();
        for behavior in &inputs.behavior.flows {
            let subject = ast_gen::workflow_subject(behavior, ir);
            match by_entity.iter_mut().find(|(e, _)| *e == subject) {
                Some((_, flows)) => flows.push(behavior.flow.clone()),
                None => by_entity.push((subject, vec![behavior.flow.clone()])),
            }
        }

        let mut out = Vec::new();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            num_cpus::get().clamp(1, 4),
        ));
        let mut join_set: tokio::task::JoinSet<Result<RenderedFile, PipelineError>> =
            tokio::task::JoinSet::new();

        for (entity_name, flow_names) in by_entity {
            cancel.check().map_err(|_| PipelineError::Cancelled)?;
            let Some(entity) = ir.domain.entity(&entity_name) else {
                continue;
            };
            let flows: Vec<&crate::ir::Flow> = flow_names
                .iter()
                .filter_map(|name| ir.behavior.flow(name))
                .collect();
            if flows.is_empty() {
                continue;
            }

            let skeleton = ast_gen::service_skeleton(entity, &flows, ir);
            let path = format!(
                "src/services/{}_service.py",
                normalize::to_snake_case(&entity_name)
            );
            stratum::check_write(&path, Stratum::Llm).map_err(violation_error)?;

            // Pre-compute everything the spawned task needs by value.
            let slot_jobs: Vec<(slots::Slot, crate::icbr::FlowBehavior, Vec<String>)> =
                slots::find_slots(&skeleton)
                    .map_err(|e| PipelineError::EmissionFailed {
                        reason: e.to_string(),
                    })?
                    .into_iter()
                    .filter_map(|slot| {
                        let behavior = inputs.behavior.flow(&slot.name)?.clone();
                        let warnings = llm_stratum::LlmStratum::pattern_warnings(
                            inputs.learning,
                            ir,
                            &slot.name,
                            config.learning.min_pattern_occurrences,
                            config.learning.max_patterns_per_prompt,
                            config.strict_mode,
                        );
                        Some((slot, behavior, warnings))
                    })
                    .collect();

            let atoms: Vec<String> = flow_names.iter().map(|f| format!("flow:{f}")).collect();
            let ir_clone = ir.clone();
            let stratum_handle = Arc::clone(&llm_stratum);
            let permit_source = Arc::clone(&semaphore);
            let constraints = constraints.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let _permit = permit_source
                    .acquire()
                    .await
                    .map_err(|_| PipelineError::Cancelled)?;
                let start = Instant::now();
                let mut content = skeleton;
                let mut tokens_in = 0u32;
                let mut tokens_out = 0u32;
                let mut model = None;
                let mut passed = true;

                for (slot, behavior, warnings) in slot_jobs {
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                    let body = if safe {
                        ast_gen::emit_workflow_slot_body(&behavior, &ir_clone)
                    } else {
                        let fill = stratum_handle
                            .fill_slot(&slot, &behavior, &warnings, &constraints)
                            .await;
                        tokens_in += fill.tokens_in;
                        tokens_out += fill.tokens_out;
                        if fill.model.is_some() {
                            model = fill.model;
                        }
                        passed = passed && !fill.fallback;
                        fill.body
                    };
                    content = slots::insert_body(&content, &slot.name, &body).map_err(|e| {
                        PipelineError::EmissionFailed {
                            reason: e.to_string(),
                        }
                    })?;
                }

                Ok(RenderedFile {
                    path,
                    stratum: Stratum::Llm,
                    source_id: format!("slot:{}", atoms.join("+")),
                    atoms,
                    content,
                    tokens_in,
                    tokens_out,
                    model,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    passed,
                })
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let rendered = joined.map_err(|e| PipelineError::EmissionFailed {
                reason: format!("emission worker panicked: {e}"),
            })??;
            out.push(rendered);
        }
        // Deterministic write order regardless of completion order.
        out.sort_by(|a, b| a.path.cmp(&b.path));

        // README is the one free-form artifact.
        cancel.check().map_err(|_| PipelineError::Cancelled)?;
        let start = Instant::now();
        let readme = if safe {
            llm_stratum::SlotFill {
                body: llm_stratum::deterministic_readme(ir),
                tokens_in: 0,
                tokens_out: 0,
                model: None,
                fallback: false,
            }
        } else {
            llm_stratum.readme(ir).await
        };
        stratum::check_write("README.md", Stratum::Llm).map_err(violation_error)?;
        out.push(RenderedFile {
            path: "README.md".to_string(),
            stratum: Stratum::Llm,
            source_id: "llm:readme".to_string(),
            atoms: vec![],
            content: readme.body,
            tokens_in: readme.tokens_in,
            tokens_out: readme.tokens_out,
            model: readme.model,
            elapsed_ms: start.elapsed().as_millis() as u64,
            passed: !readme.fallback,
        });

        Ok(out)
    }
}

/// Slot constraints per execution mode. RESEARCH relaxes enforcement.
fn slot_constraints(mode: ExecutionMode) -> SlotConstraints {
    match mode {
        ExecutionMode::Research => SlotConstraints {
            no_imports: false,
            no_class_defs: false,
            max_lines: 200,
            must_end_with_return: false,
            no_side_effect_calls: false,
        },
        _ => SlotConstraints::default(),
    }
}

fn violation_error(violation: stratum::StratumViolation) -> PipelineError {
    match violation {
        stratum::StratumViolation::ProtectedPath { path } => PipelineError::TemplateProtected {
            path,
            stratum: "llm".to_string(),
        },
        other => PipelineError::EmissionFailed {
            reason: other.to_string(),
        },
    }
}

/// Write rendered files atomically and record them in the manifest.
fn write_all(
    out_dir: &Path,
    files: &[RenderedFile],
    manifest: &mut GenerationManifest,
) -> Result<(), PipelineError> {
    for file in files {
        write_atomic(out_dir, &file.path, &file.content)?;
        debug!(path = %file.path, stratum = %file.stratum, "emitted");
        manifest.record(
            file.path.clone(),
            FileRecord {
                stratum: file.stratum,
                source_id: file.source_id.clone(),
                atoms: file.atoms.clone(),
                tokens_in: file.tokens_in,
                tokens_out: file.tokens_out,
                model: file.model.clone(),
                elapsed_ms: file.elapsed_ms,
                passed: file.passed,
            },
        );
    }
    Ok(())
}

/// Atomic write: temp file in the same directory, then rename.
pub fn write_atomic(root: &Path, rel_path: &str, content: &str) -> std::io::Result<()> {
    let path = root.join(rel_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp.emit");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// The forbidden-literal lint: template-stratum output must not contain
/// any entity identifier in any of its canonical forms.
struct EmissionLint {
    patterns: Vec<(String, regex::Regex)>,
}

impl EmissionLint {
    fn build(ir: &ApplicationIr) -> Self {
        // The app name legitimately appears in infrastructure files (image
        // names, database names); an entity sharing it is not a leak.
        let app_snake = normalize::to_snake_case(&ir.app_name);
        let mut patterns = Vec::new();
        for entity in &ir.domain.entities {
            let snake = normalize::to_snake_case(&entity.name);
            for form in [entity.name.clone(), snake.clone(), format!("{snake}s")] {
                if form == ir.app_name || form == app_snake {
                    continue;
                }
                if let Ok(re) = regex::Regex::new(&format!(r"\b{}\b", regex::escape(&form))) {
                    patterns.push((form, re));
                }
            }
        }
        EmissionLint { patterns }
    }

    fn check(&self, path: &str, content: &str) -> Result<(), PipelineError> {
        for (literal, re) in &self.patterns {
            if re.is_match(content) {
                return Err(PipelineError::EmissionFailed {
                    reason: format!(
                        "template file '{path}' contains domain literal '{literal}'"
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Entity, Field, SemanticType};

    #[test]
    fn test_lint_catches_domain_literals() {
        let mut ir = ApplicationIr::new("Shop");
        ir.domain.entities.push(Entity {
            name: "Order".to_string(),
            fields: vec![Field {
                name: "id".to_string(),
                semantic_type: SemanticType::Uuid,
                nullable: false,
                default: None,
                sql_default: false,
                constraints: vec![],
                foreign_key: None,
                enum_values: vec![],
            }],
        });
        let lint = EmissionLint::build(&ir);
        assert!(lint.check("Dockerfile", "RUN echo orders").is_err());
        assert!(lint.check("Dockerfile", "RUN pip install .").is_ok());
    }
}
