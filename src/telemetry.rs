//! # Pipeline Trace
//!
//! Stage-by-stage record of a pipeline run: what ran, how long it took,
//! and the headline counts. Written next to the generated application as
//! `stratum_metrics.json` together with the per-stratum token totals from
//! the generation manifest.

use crate::manifest::GenerationManifest;
use serde::Serialize;
use std::path::Path;
use std::time::Instant;

/// One recorded stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: String,
    pub elapsed_ms: u64,
    pub detail: String,
}

/// Trace of the pipeline stages in execution order.
#[derive(Debug)]
pub struct PipelineTrace {
    started: Instant,
    stages: Vec<StageRecord>,
}

impl PipelineTrace {
    pub fn new() -> Self {
        PipelineTrace {
            started: Instant::now(),
            stages: Vec::new(),
        }
    }

    /// Record a completed stage with a short human-readable detail.
    pub fn record(&mut self, stage: impl Into<String>, started: Instant, detail: impl Into<String>) {
        self.stages.push(StageRecord {
            stage: stage.into(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            detail: detail.into(),
        });
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn total_elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl Default for PipelineTrace {
    fn default() -> Self {
        PipelineTrace::new()
    }
}

#[derive(Serialize)]
struct StratumMetrics<'a> {
    total_elapsed_ms: u64,
    stages: &'a [StageRecord],
    stratum_summary: &'a crate::manifest::StratumSummary,
}

/// Write `stratum_metrics.json` into the generated app directory.
pub fn write_stratum_metrics(
    app_dir: &Path,
    trace: &PipelineTrace,
    manifest: &GenerationManifest,
) -> std::io::Result<()> {
    let metrics = StratumMetrics {
        total_elapsed_ms: trace.total_elapsed_ms(),
        stages: trace.stages(),
        stratum_summary: &manifest.stratum_summary,
    };
    let text = serde_json::to_string_pretty(&metrics)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let path = app_dir.join("stratum_metrics.json");
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}
