//! # SpecForge
//!
//! A cognitive compiler: lowers a human-written application specification
//! (Markdown) into a deployable server application through a deterministic,
//! multi-stage pipeline built around a typed intermediate representation.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Spec (Markdown)
//!     ↓
//! [SpecLowering]        → ApplicationIR (canonical identifiers)
//!     ↓
//! [IREnricher]          → inferred endpoints + implied invariants
//!     ↓
//! [BehaviorLowering]    → ICBR (predicates + atomic operations)
//!     ↓
//! [StratifiedEmitter]   → Template / AST / LLM strata + manifest
//!     ↓
//! [Deployer]            → Docker compose or in-process launch
//!     ↓
//! [SmokeRunner]         → TestsIR scenarios, structured violations
//!     ↓
//! [RepairOrchestrator]  → classify → attribute → fix → realign IR
//!     ↓
//! [LearningStore]       → anti-patterns + fix patterns across runs
//! ```
//!
//! The IR is the single source of truth after lowering: no generator,
//! validator, or repair step reads spec text again. The LLM participates
//! only at two confined points - natural-language lowering (validated
//! against the IR schema) and slot-restricted code emission.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use specforge::{Config, Pipeline};
//! use specforge::llm::HttpLlmClient;
//! use std::sync::Arc;
//!
//! let config = Config::load()?;
//! let llm = Arc::new(HttpLlmClient::new(&config.llm.endpoint, &config.llm.model));
//! let pipeline = Pipeline::new(config, llm);
//!
//! let report = pipeline.run(&spec_text, &CancelToken::unbounded()).await?;
//! println!("{:?}", report.outcome);
//! ```

// IR and lowering front-end
pub mod ir;
pub mod lowering;

// Enrichment and behavior lowering
pub mod enrich;
pub mod icbr;

// Code emission
pub mod emitter;
pub mod manifest;

// Runtime feedback loop
pub mod deploy;
pub mod repair;
pub mod smoke;

// Learning substrate
pub mod learning;

// Validation and reporting
pub mod compliance;
pub mod telemetry;

// Infrastructure
pub mod cancel;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;

// Re-export the types most callers need
pub use cancel::CancelToken;
pub use config::{Config, ExecutionMode, GateEnvironment, QaLevel};
pub use error::{PipelineError, RunOutcome, Severity};
pub use ir::{ApplicationIr, IrError, IR_SCHEMA_VERSION};
pub use manifest::GenerationManifest;
pub use pipeline::{Pipeline, PipelineReport};

// Re-export the stratum vocabulary (used by callers inspecting manifests)
pub use emitter::stratum::{Stratum, TEMPLATE_PROTECTED_PATHS};

// Re-export smoke/repair surface types for report consumers
pub use repair::{ErrorClass, FixType, RepairFix};
pub use smoke::{SmokeResult, TestsIr, Violation};
