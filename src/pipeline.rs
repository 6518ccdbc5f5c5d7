//! # Pipeline Coordinator
//!
//! Owns the `ApplicationIr` for the lifetime of a run and drives the
//! one-way pipeline with its two feedback edges:
//!
//! ```text
//! spec → lower → enrich → behavior lowering → stratified emission
//!      → deploy → smoke ⇄ repair (IR backpropagation)
//!      → compliance → quality gate
//! ```
//!
//! Every other component borrows the IR immutably; only the repair
//! orchestrator's backpropagator writes it, and only between smoke runs.
//! The coordinator is also where fatal errors become the user-visible
//! `AbortedFatal` outcome and where partial metrics are flushed on
//! cancellation.

use crate::cancel::CancelToken;
use crate::compliance::{self, ComplianceReport, GateReport};
use crate::config::{Config, QaLevel};
use crate::deploy::{Deployer, Deployment, LiveExecutor};
use crate::emitter::{EmitInputs, StratifiedEmitter};
use crate::enrich;
use crate::error::{PipelineError, RunOutcome};
use crate::icbr;
use crate::ir::ApplicationIr;
use crate::learning::{LearningStore, PatternBank};
use crate::llm::LlmClient;
use crate::lowering::cache::{self, IrCache};
use crate::lowering::SpecLowering;
use crate::manifest::GenerationManifest;
use crate::repair::{RepairOrchestrator, RepairRun};
use crate::smoke::{ScenarioExecutor, SmokeResult, SmokeRunner, TestsIr};
use crate::telemetry::{self, PipelineTrace};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Everything a finished run hands back to the caller.
#[derive(Debug)]
pub struct PipelineReport {
    pub outcome: RunOutcome,
    pub manifest: GenerationManifest,
    pub compliance: ComplianceReport,
    pub gate: GateReport,
    pub final_smoke: SmokeResult,
    pub app_dir: PathBuf,
}

/// The pipeline coordinator.
pub struct Pipeline {
    config: Config,
    llm: Arc<dyn LlmClient>,
}

impl Pipeline {
    pub fn new(config: Config, llm: Arc<dyn LlmClient>) -> Self {
        Pipeline { config, llm }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lower a spec to its validated, enriched IR without emitting.
    pub async fn lower(
        &self,
        spec: &str,
        cancel: &CancelToken,
    ) -> Result<ApplicationIr, PipelineError> {
        let cache = Arc::new(IrCache::new(
            &self.config.cache.dir,
            self.config.cache.ir_cache_ttl_seconds,
        ));
        if let Ok(removed) =
            cache::sweep_expired(&self.config.cache.dir, self.config.cache.ir_cache_ttl_seconds)
        {
            if removed > 0 {
                info!(removed, "swept expired IR cache entries");
            }
        }

        let lowering = SpecLowering::new(Arc::clone(&self.llm), cache)
            .with_deadline(Duration::from_secs(self.config.llm.timeout_seconds));
        let mut ir = lowering.lower(spec, &self.config, cancel).await?;

        let report = enrich::enrich(&mut ir, &self.config);
        info!(
            inferred_endpoints = report.inferred_endpoints,
            inferred_invariants = report.inferred_invariants,
            "enrichment complete"
        );
        ir.validate()?;
        Ok(ir)
    }

    /// Lower and emit, no smoke. Returns the IR and the manifest.
    pub async fn emit(
        &self,
        spec: &str,
        cancel: &CancelToken,
    ) -> Result<(ApplicationIr, GenerationManifest, PathBuf), PipelineError> {
        let mut trace = PipelineTrace::new();
        let (ir, _behavior, manifest, app_dir, _learning) =
            self.lower_and_emit(spec, cancel, &mut trace).await?;
        Ok((ir, manifest, app_dir))
    }

    /// The full pipeline against a real deployment.
    pub async fn run(
        &self,
        spec: &str,
        cancel: &CancelToken,
    ) -> Result<PipelineReport, PipelineError> {
        let mut trace = PipelineTrace::new();
        let (ir, behavior, manifest, app_dir, learning) =
            self.lower_and_emit(spec, cancel, &mut trace).await?;

        // Deploy per QA level: FAST launches in-process, HEAVY goes through
        // Docker (degrading only when the policy allows).
        let deployer = Deployer::from_config(&self.config);
        let started = Instant::now();
        let deployment: Arc<Deployment> = match self.config.qa_level {
            QaLevel::Fast => Arc::new(deployer.deploy_in_process(&app_dir, &ir, cancel).await?),
            QaLevel::Heavy => Arc::new(deployer.deploy(&app_dir, &ir, cancel).await?),
        };
        trace.record("deploy", started, format!("{:?}", deployment.kind));

        let executor: Arc<dyn ScenarioExecutor> = Arc::new(LiveExecutor::new(Arc::clone(&deployment)));
        let report = self
            .smoke_and_repair(
                ir,
                behavior,
                manifest,
                app_dir,
                executor,
                learning.as_ref(),
                Some(&deployer),
                cancel,
                trace,
            )
            .await;

        deployment.shutdown().await;
        report
    }

    /// The full pipeline against a caller-supplied executor. This is the
    /// seam integration tests drive: no Docker, no child processes.
    pub async fn run_with_executor(
        &self,
        spec: &str,
        executor: Arc<dyn ScenarioExecutor>,
        cancel: &CancelToken,
    ) -> Result<PipelineReport, PipelineError> {
        let mut trace = PipelineTrace::new();
        let (ir, behavior, manifest, app_dir, learning) =
            self.lower_and_emit(spec, cancel, &mut trace).await?;
        self.smoke_and_repair(
            ir,
            behavior,
            manifest,
            app_dir,
            executor,
            learning.as_ref(),
            None,
            cancel,
            trace,
        )
        .await
    }

    /// Shared front half: lowering, enrichment, behavior lowering, fixture
    /// construction, emission.
    async fn lower_and_emit(
        &self,
        spec: &str,
        cancel: &CancelToken,
        trace: &mut PipelineTrace,
    ) -> Result<
        (
            ApplicationIr,
            icbr::BehaviorIr,
            GenerationManifest,
            PathBuf,
            Option<LearningStore>,
        ),
        PipelineError,
    > {
        let started = Instant::now();
        let ir = self.lower(spec, cancel).await?;
        trace.record(
            "lowering",
            started,
            format!(
                "{} entities, {} endpoints",
                ir.domain.entities.len(),
                ir.api.endpoints.len()
            ),
        );

        let started = Instant::now();
        let behavior = icbr::lower(&ir).map_err(|e| PipelineError::LoweringFailed {
            reason: e.to_string(),
        })?;
        trace.record("behavior_lowering", started, format!("{} flows", behavior.flows.len()));

        let learning = self.open_learning(&ir)?;
        let bank = PatternBank::new();
        if let Some(store) = &learning {
            bank.init_from(store);
            if !bank.is_empty() {
                info!(templates = bank.len(), "pattern bank warmed from store");
            }
        }

        let fixtures = crate::smoke::fixtures::FixtureSet::build(&ir);
        let app_dir = self.config.output.dir.join(crate::lowering::normalize::to_snake_case(&ir.app_name));

        let started = Instant::now();
        let emitter = StratifiedEmitter::new(Arc::clone(&self.llm))
            .with_deadline(Duration::from_secs(self.config.llm.timeout_seconds));
        let inputs = EmitInputs {
            ir: &ir,
            behavior: &behavior,
            fixtures: &fixtures,
            config: &self.config,
            learning: learning.as_ref(),
        };
        let manifest = emitter.emit(&inputs, &app_dir, cancel).await?;
        trace.record("emission", started, format!("{} files", manifest.files.len()));

        Ok((ir, behavior, manifest, app_dir, learning))
    }

    /// Shared back half: smoke, repair, compliance, gate, metric flush.
    #[allow(clippy::too_many_arguments)]
    async fn smoke_and_repair(
        &self,
        mut ir: ApplicationIr,
        behavior: icbr::BehaviorIr,
        manifest: GenerationManifest,
        app_dir: PathBuf,
        executor: Arc<dyn ScenarioExecutor>,
        learning: Option<&LearningStore>,
        deployer: Option<&Deployer>,
        cancel: &CancelToken,
        mut trace: PipelineTrace,
    ) -> Result<PipelineReport, PipelineError> {
        let tests = TestsIr::generate(&ir);
        info!(scenarios = tests.scenarios.len(), "tests IR generated");

        let started = Instant::now();
        let orchestrator = RepairOrchestrator::new(self.config.clone(), Arc::clone(&self.llm));
        let repair_result = orchestrator
            .run(
                RepairRun {
                    ir: &mut ir,
                    behavior: &behavior,
                    tests: &tests,
                    manifest: &manifest,
                    app_dir: &app_dir,
                    executor: Arc::clone(&executor),
                    learning,
                    deployer,
                },
                cancel,
            )
            .await;

        let outcome = match repair_result {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => {
                // Flush what we have before surfacing the abort.
                warn!(error = %e, "pipeline aborted");
                let _ = telemetry::write_stratum_metrics(&app_dir, &trace, &manifest);
                return Ok(PipelineReport {
                    outcome: RunOutcome::AbortedFatal {
                        reason: e.to_string(),
                    },
                    manifest,
                    compliance: ComplianceReport::default(),
                    gate: compliance::quality_gate(
                        self.config.quality_gate.environment,
                        &ComplianceReport::default(),
                        &SmokeResult::default(),
                        &app_dir,
                    ),
                    final_smoke: SmokeResult::default(),
                    app_dir,
                });
            }
            Err(e) => return Err(e),
        };
        trace.record("repair", started, format!("{outcome:?}"));

        // One confirming full smoke feeds the gate.
        let started = Instant::now();
        let runner = SmokeRunner::new(Arc::clone(&executor));
        let final_smoke = runner.run(&tests, cancel).await;
        trace.record(
            "final_smoke",
            started,
            format!("pass rate {:.2}", final_smoke.pass_rate),
        );

        let started = Instant::now();
        let compliance_report = compliance::validate(&ir, &app_dir);
        let gate = compliance::quality_gate(
            self.config.quality_gate.environment,
            &compliance_report,
            &final_smoke,
            &app_dir,
        );
        trace.record("compliance", started, format!("{:?}", gate.status));

        if let Err(e) = compliance_report.write(&app_dir) {
            warn!(error = %e, "failed to write compliance report");
        }
        if let Err(e) = gate.write(&app_dir) {
            warn!(error = %e, "failed to write quality gate report");
        }
        if let Err(e) = telemetry::write_stratum_metrics(&app_dir, &trace, &manifest) {
            warn!(error = %e, "failed to write stratum metrics");
        }

        Ok(PipelineReport {
            outcome,
            manifest,
            compliance: compliance_report,
            gate,
            final_smoke,
            app_dir,
        })
    }

    fn open_learning(&self, ir: &ApplicationIr) -> Result<Option<LearningStore>, PipelineError> {
        // RESEARCH mode writes to a sandboxed store next to the real one.
        let path: &Path = &self.config.learning.store_path;
        let path = if self.config.execution_mode == crate::config::ExecutionMode::Research {
            path.with_extension("research.json")
        } else {
            path.to_path_buf()
        };

        match LearningStore::open_file(&path, &ir.app_name, self.config.learning.required) {
            Ok(store) => Ok(Some(store)),
            Err(e) if self.config.learning.required => {
                Err(PipelineError::LearningStoreUnavailable {
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                warn!(error = %e, "learning store unavailable; continuing without learning");
                Ok(None)
            }
        }
    }
}
