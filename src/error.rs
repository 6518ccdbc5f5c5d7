//! Error taxonomy for the pipeline.
//!
//! Errors are values everywhere; only cancellation and unrecoverable IO are
//! allowed to unwind. Each error kind maps to one propagation policy:
//!
//! | Kind | Policy |
//! |------|--------|
//! | Fatal | abort the pipeline |
//! | IterationLocal | roll back the current repair iteration |
//! | StrategyLocal | fall through to the next repair strategy |
//! | Recoverable | log and continue |
//! | Advisory | recorded, never surfaced |

use serde::Serialize;

/// Propagation policy of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Fatal,
    IterationLocal,
    StrategyLocal,
    Recoverable,
    Advisory,
}

/// Top-level pipeline error. The orchestrator is the only component that
/// converts these into a user-visible result.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Lowering validation failure after the bounded retry
    #[error("lowering failed: {reason}")]
    LoweringFailed { reason: String },

    /// Cached or in-flight IR schema version mismatch
    #[error(transparent)]
    Ir(#[from] crate::ir::IrError),

    /// Write attempt on a template-protected path
    #[error("write to template-protected path '{path}' by the {stratum} stratum")]
    TemplateProtected { path: String, stratum: String },

    /// Emission failure (lint hit, slot violation after retry, IO)
    #[error("emission failed: {reason}")]
    EmissionFailed { reason: String },

    /// Learning store unreachable while learning is required
    #[error("learning store unreachable: {reason}")]
    LearningStoreUnavailable { reason: String },

    /// Docker required but missing
    #[error("docker runtime required but unavailable: {reason}")]
    DockerUnavailable { reason: String },

    /// Deployment failed in a way no repair can address
    #[error("deployment failed: {reason}")]
    DeploymentFailed { reason: String },

    /// LLM failure after retry and generic-strategy escalation
    #[error(transparent)]
    Llm(#[from] crate::llm::LlmError),

    /// Cooperative cancellation observed at a suspension point
    #[error("pipeline cancelled")]
    Cancelled,

    /// Component-local deadline exceeded
    #[error("{component} exceeded its deadline of {seconds}s")]
    DeadlineExceeded { component: String, seconds: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PipelineError {
    /// The propagation policy for this error.
    pub fn severity(&self) -> Severity {
        match self {
            PipelineError::LoweringFailed { .. }
            | PipelineError::Ir(_)
            | PipelineError::TemplateProtected { .. }
            | PipelineError::LearningStoreUnavailable { .. }
            | PipelineError::DockerUnavailable { .. }
            | PipelineError::DeploymentFailed { .. }
            | PipelineError::Cancelled => Severity::Fatal,

            PipelineError::DeadlineExceeded { .. } => Severity::IterationLocal,

            PipelineError::EmissionFailed { .. } | PipelineError::Serde(_) => {
                Severity::StrategyLocal
            }

            PipelineError::Llm(_) => Severity::Recoverable,

            PipelineError::Io(_) => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

/// Terminal result of a pipeline run. Exactly one is returned per run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Target pass rate reached (or a fixed point at/above target)
    Converged { iterations: u32, pass_rate: f64 },
    /// Pass rate dropped below the previous iteration; mutations rolled back
    Regressed { pass_rate: f64 },
    /// Fixed point below target
    Stalled { pass_rate: f64 },
    /// Iteration budget exhausted without convergence
    MaxIterations { pass_rate: f64 },
    /// Fatal error aborted the pipeline
    AbortedFatal { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(PipelineError::LoweringFailed {
            reason: "bad".to_string()
        }
        .is_fatal());
        assert!(PipelineError::TemplateProtected {
            path: "docker-compose.yml".to_string(),
            stratum: "llm".to_string()
        }
        .is_fatal());
        assert_eq!(
            PipelineError::EmissionFailed {
                reason: "lint".to_string()
            }
            .severity(),
            Severity::StrategyLocal
        );
    }
}
