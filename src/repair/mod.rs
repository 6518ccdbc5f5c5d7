//! # Repair Orchestrator
//!
//! The engine's core control loop: run smoke, classify and attribute each
//! violation, apply the first strategy that proposes a fix, realign the IR,
//! and iterate until the target pass rate is reached or the trajectory
//! proves it cannot be.
//!
//! Budgets and guarantees:
//! - at most `max_iterations` repair rounds, each snapshot-isolated
//! - at most `per_violation_budget` attempts per canonical violation key;
//!   the next occurrence escalates back to the caller unresolved
//! - no fix signature applies more than twice per pipeline (cycle guard)
//! - regression rolls the current iteration's mutations back to the prior
//!   snapshot
//! - a delta-restricted smoke may never declare convergence; a full run
//!   must confirm it

pub mod attribution;
pub mod backprop;
pub mod classifier;
pub mod convergence;
pub mod delta;
pub mod mutation;
pub mod strategies;

pub use attribution::CausalChain;
pub use backprop::{IrBackpropagator, IrRealignment};
pub use classifier::{classify, Classification, ErrorClass};
pub use convergence::{ConvergenceMonitor, Verdict};
pub use delta::AffectedScope;
pub use mutation::{unified_diff, Mutation, MutationHistory};
pub use strategies::{error_signature, FixType, RepairContext, RepairFix, RepairStrategy};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::deploy::Deployer;
use crate::error::{PipelineError, RunOutcome};
use crate::icbr::BehaviorIr;
use crate::ir::{ApplicationIr, ConstraintGraph};
use crate::learning::LearningStore;
use crate::llm::LlmClient;
use crate::manifest::GenerationManifest;
use crate::smoke::{ScenarioExecutor, SmokeResult, SmokeRunner, TestsIr};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Borrowed collaborators for one repair run. The orchestrator holds the
/// only mutable IR handle and lends it to the backpropagator between smoke
/// runs.
pub struct RepairRun<'a> {
    pub ir: &'a mut ApplicationIr,
    pub behavior: &'a BehaviorIr,
    pub tests: &'a TestsIr,
    pub manifest: &'a GenerationManifest,
    pub app_dir: &'a Path,
    pub executor: Arc<dyn ScenarioExecutor>,
    pub learning: Option<&'a LearningStore>,
    /// Present when Docker rebuilds between iterations are possible
    pub deployer: Option<&'a Deployer>,
}

/// The repair loop driver.
pub struct RepairOrchestrator {
    config: Config,
    llm: Arc<dyn LlmClient>,
    llm_deadline: Duration,
}

impl RepairOrchestrator {
    pub fn new(config: Config, llm: Arc<dyn LlmClient>) -> Self {
        let llm_deadline = Duration::from_secs(config.llm.timeout_seconds);
        RepairOrchestrator {
            config,
            llm,
            llm_deadline,
        }
    }

    /// Run the loop to a terminal status. Exactly one `RunOutcome` comes
    /// back; fatal errors propagate as errors and become `AbortedFatal` at
    /// the pipeline boundary.
    pub async fn run(
        &self,
        mut run: RepairRun<'_>,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, PipelineError> {
        let target = self.config.repair.target_pass_rate;
        let runner = SmokeRunner::new(Arc::clone(&run.executor));
        let mut monitor =
            ConvergenceMonitor::new(target, self.config.repair.convergence_epsilon);
        let mut history = MutationHistory::new();
        let mut budgets: HashMap<String, u32> = HashMap::new();
        let mut escalated: Vec<String> = Vec::new();
        let mut scope: Option<AffectedScope> = None;
        let mut prev_iteration: Option<u32> = None;

        // The whole repair cycle shares one wall-clock budget.
        let repair_cancel = cancel.child(Duration::from_secs(
            self.config.repair.wall_clock_seconds,
        ));
        let max_iterations = self.config.repair.max_iterations;

        for iteration in 0..=max_iterations {
            repair_cancel
                .check()
                .map_err(|_| PipelineError::Cancelled)?;

            // Delta-restricted smoke is an optimization only; convergence is
            // always confirmed by a full run.
            let mut smoke = match &scope {
                Some(s) if !s.is_empty() => {
                    let s = s.clone();
                    runner
                        .run_filtered(run.tests, &repair_cancel, |sc| s.selects(sc))
                        .await
                }
                _ => runner.run(run.tests, &repair_cancel).await,
            };
            if scope.is_some() && smoke.pass_rate >= target {
                info!("delta smoke reached target; confirming with a full run");
                smoke = runner.run(run.tests, &repair_cancel).await;
            }

            monitor.record(smoke.pass_rate);
            info!(
                iteration,
                pass_rate = format!("{:.2}", smoke.pass_rate),
                violations = smoke.violations.len(),
                "smoke iteration recorded"
            );

            // Judge the previous iteration's mutations against this run.
            if let Some(prev) = prev_iteration {
                self.judge_previous(&mut history, prev, &smoke, run.learning);
            }

            match monitor.verdict() {
                Verdict::ReachedTarget => {
                    return Ok(RunOutcome::Converged {
                        iterations: iteration,
                        pass_rate: smoke.pass_rate,
                    });
                }
                Verdict::Regressed => {
                    let restored = history.rollback_current(run.app_dir)?;
                    warn!(restored, "pass rate regressed; rolled back current iteration");
                    return Ok(RunOutcome::Regressed {
                        pass_rate: smoke.pass_rate,
                    });
                }
                Verdict::Stalled => {
                    return Ok(RunOutcome::Stalled {
                        pass_rate: smoke.pass_rate,
                    });
                }
                Verdict::Continue => {}
            }

            if iteration == max_iterations {
                break;
            }

            // Golden-path fail-fast: once a golden flow has survived one
            // repair round and still fails, stop burning iterations.
            if smoke.golden_failure(run.ir) && iteration > 0 {
                warn!("golden flow still failing after repair; fail-fast");
                break;
            }

            let (applied, cycled) = self
                .repair_iteration(
                    &mut run,
                    &smoke,
                    iteration,
                    &mut history,
                    &mut budgets,
                    &mut escalated,
                    &mut monitor,
                    &repair_cancel,
                )
                .await?;

            if cycled {
                // The iteration was rolled back on disk; its mutations must
                // neither realign the IR nor be judged against later runs.
                scope = None;
                prev_iteration = None;
                continue;
            }

            // IR realignment commits happen-before the next smoke run.
            IrBackpropagator::realign(run.ir, history.current_mutations(), iteration);

            scope = {
                let s = AffectedScope::from_mutations(
                    history.current_mutations(),
                    run.manifest,
                    run.ir,
                );
                (!s.is_empty()).then_some(s)
            };
            prev_iteration = Some(iteration);

            if applied == 0 {
                info!("no strategy produced a fix; next smoke decides the terminal state");
            }

            if self.config.docker.rebuild_between_repairs {
                if let Some(deployer) = run.deployer {
                    deployer.rebuild_no_cache(run.app_dir).await?;
                }
            }
        }

        if !escalated.is_empty() {
            warn!(count = escalated.len(), "violations escalated unresolved");
        }
        Ok(RunOutcome::MaxIterations {
            pass_rate: monitor.latest(),
        })
    }

    /// One repair round: classify, attribute, and fix every violation
    /// within budget. Returns how many fixes were applied and whether the
    /// round aborted on a repair cycle.
    #[allow(clippy::too_many_arguments)]
    async fn repair_iteration(
        &self,
        run: &mut RepairRun<'_>,
        smoke: &SmokeResult,
        iteration: u32,
        history: &mut MutationHistory,
        budgets: &mut HashMap<String, u32>,
        escalated: &mut Vec<String>,
        monitor: &mut ConvergenceMonitor,
        cancel: &CancelToken,
    ) -> Result<(usize, bool), PipelineError> {
        history.begin_iteration(iteration, run.app_dir)?;

        // Strategies read a stable view of the IR; the backpropagator gets
        // the mutable handle only after this round.
        let ir_view = run.ir.clone();
        let graph = ConstraintGraph::build(&ir_view);
        let ctx = RepairContext {
            ir: &ir_view,
            behavior: run.behavior,
            manifest: run.manifest,
            app_dir: run.app_dir,
            learning: run.learning,
            llm: Arc::clone(&self.llm),
            llm_deadline: self.llm_deadline,
            execution_mode: self.config.execution_mode,
            strict_mode: self.config.strict_mode,
        };

        // Deterministic violation order: canonical key, endpoint first.
        let mut violations = smoke.violations.clone();
        violations.sort_by(|a, b| a.budget_key().cmp(&b.budget_key()));

        let mut applied = 0usize;
        for violation in &violations {
            cancel.check().map_err(|_| PipelineError::Cancelled)?;

            let classification = classify(violation, &ir_view, &graph);
            let signature = error_signature(violation, classification.class);

            // Learning happens for every violation, budget or not.
            if let Some(store) = run.learning {
                let recorded = store.record_error(
                    &violation.endpoint,
                    &classification.class.to_string(),
                    violation.exception_class.as_deref().unwrap_or("-"),
                    &violation.server_log,
                );
                if let Err(e) = recorded {
                    if self.config.learning.required {
                        return Err(PipelineError::LearningStoreUnavailable {
                            reason: e.to_string(),
                        });
                    }
                    warn!(error = %e, "learning store write failed");
                }
            }

            let attempts = budgets.entry(signature.clone()).or_insert(0);
            if *attempts >= self.config.repair.per_violation_budget {
                if !escalated.contains(&signature) {
                    warn!(signature = %signature, "per-violation budget exhausted; escalating");
                    escalated.push(signature.clone());
                }
                continue;
            }

            let chain = attribution::attribute(
                violation,
                &classification,
                &ir_view,
                run.manifest,
                run.learning,
            );

            for strategy in RepairStrategy::ORDERED {
                if !strategy.applies_to(violation, &classification, &ctx) {
                    continue;
                }
                let Some(fix) = strategy
                    .propose_fix(violation, &chain, &classification, &ctx)
                    .await
                else {
                    continue;
                };
                if !fix.success {
                    // Strategy-local failure: fall through to the next one.
                    continue;
                }

                let before = history
                    .snapshot_content(&fix.file_path)
                    .unwrap_or_default()
                    .to_string();
                let mutation = Mutation {
                    file_path: fix.file_path.clone(),
                    violation_key: signature.clone(),
                    fix_type: fix.fix_type.to_string(),
                    description: fix.description.clone(),
                    diff: unified_diff(&fix.file_path, &before, &fix.new_content),
                    after: fix.new_content.clone(),
                    outcome: None,
                    realignment: fix.realignment.clone(),
                };

                if !monitor.note_fix(&mutation.signature()) {
                    // Repair cycle: same signature a third time. Roll the
                    // iteration back and let the trajectory end as a stall.
                    warn!(signature = %mutation.signature(), "repair cycle detected; aborting iteration");
                    history.rollback_current(run.app_dir)?;
                    return Ok((applied, true));
                }

                match history.record(mutation) {
                    Ok(()) => {}
                    Err(e) => {
                        // A fix outside the snapshot is rejected outright.
                        warn!(error = %e, "mutation rejected");
                        continue;
                    }
                }

                RepairStrategy::apply_fix(&fix, run.app_dir)?;
                info!(
                    file = %fix.file_path,
                    fix_type = %fix.fix_type,
                    description = %fix.description,
                    "repair applied"
                );
                *attempts += 1;
                applied += 1;
                break;
            }
        }

        Ok((applied, false))
    }

    /// Mark the previous iteration's mutations as succeeded or failed based
    /// on whether their violation keys survived into this smoke run, and
    /// push the outcomes into the learning store.
    fn judge_previous(
        &self,
        history: &mut MutationHistory,
        prev_iteration: u32,
        smoke: &SmokeResult,
        learning: Option<&LearningStore>,
    ) {
        let graph_free_keys: std::collections::HashSet<String> = smoke
            .violations
            .iter()
            .map(crate::smoke::Violation::budget_key)
            .collect();
        // A mutation succeeded when no surviving violation shares its key's
        // endpoint and exception.
        history.judge_iteration(prev_iteration, |m| {
            !graph_free_keys
                .iter()
                .any(|k| share_endpoint(k, &m.violation_key))
        });

        for mutation in history.mutations_for(prev_iteration) {
            if let Some(success) = mutation.outcome {
                let fix = RepairFix {
                    file_path: mutation.file_path.clone(),
                    fix_type: parse_fix_type(&mutation.fix_type),
                    description: mutation.description.clone(),
                    new_content: mutation.after.clone(),
                    success: true,
                    realignment: None,
                };
                RepairStrategy::record_outcome(&mutation.violation_key, &fix, success, learning);
            }
        }
    }
}

fn share_endpoint(budget_key: &str, violation_key: &str) -> bool {
    let endpoint_a = budget_key.split('|').next().unwrap_or_default();
    let endpoint_b = violation_key.split('|').next().unwrap_or_default();
    !endpoint_a.is_empty() && endpoint_a == endpoint_b
}

fn parse_fix_type(s: &str) -> FixType {
    match s {
        "learned_replay" => FixType::LearnedReplay,
        "database" => FixType::Database,
        "validation" => FixType::Validation,
        "service" => FixType::Service,
        "import" => FixType::Import,
        "route" => FixType::Route,
        _ => FixType::LlmFallback,
    }
}
