//! # Generation Manifest
//!
//! The audit record of an emission run: per file, which stratum produced
//! it, from which generator or slot, over which IR atoms, at what token and
//! time cost. The repair loop's causal attributor reads the manifest to map
//! stack-frame file paths back to IR elements; the backpropagator reads it
//! to find which IR atoms a mutated file projects.

use crate::emitter::stratum::Stratum;
use crate::ir::IrStats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Per-file manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub stratum: Stratum,
    /// Template id, AST generator id, or LLM slot id
    pub source_id: String,
    /// IR atom ids this file was generated from (`entity:Order`,
    /// `endpoint:create_order`, `flow:pay_order`)
    #[serde(default)]
    pub atoms: Vec<String>,
    #[serde(default)]
    pub tokens_in: u32,
    #[serde(default)]
    pub tokens_out: u32,
    /// Model name for LLM-stratum files
    #[serde(default)]
    pub model: Option<String>,
    pub elapsed_ms: u64,
    /// Whether post-emission validation passed
    pub passed: bool,
}

/// Counts per stratum plus token totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratumSummary {
    pub template_files: usize,
    pub ast_files: usize,
    pub llm_files: usize,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
}

/// The manifest document written next to the generated application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationManifest {
    pub app_id: String,
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub execution_mode: String,
    pub strict_mode: bool,
    pub files: BTreeMap<String, FileRecord>,
    pub stratum_summary: StratumSummary,
    pub ir_stats: IrStats,
}

impl GenerationManifest {
    pub fn new(app_id: impl Into<String>, execution_mode: String, strict_mode: bool, ir_stats: IrStats) -> Self {
        GenerationManifest {
            app_id: app_id.into(),
            generated_at: chrono::Utc::now(),
            execution_mode,
            strict_mode,
            files: BTreeMap::new(),
            stratum_summary: StratumSummary::default(),
            ir_stats,
        }
    }

    /// Record one emitted file and fold it into the summary.
    pub fn record(&mut self, path: impl Into<String>, record: FileRecord) {
        match record.stratum {
            Stratum::Template => self.stratum_summary.template_files += 1,
            Stratum::Ast => self.stratum_summary.ast_files += 1,
            Stratum::Llm => self.stratum_summary.llm_files += 1,
        }
        self.stratum_summary.total_tokens_in += u64::from(record.tokens_in);
        self.stratum_summary.total_tokens_out += u64::from(record.tokens_out);
        self.files.insert(path.into(), record);
    }

    /// Look up the record for a file path, tolerating absolute stack-frame
    /// paths that end in a manifest-relative path.
    pub fn file_for_frame(&self, frame_path: &str) -> Option<(&str, &FileRecord)> {
        let normalized = frame_path.replace('\\', "/");
        self.files
            .iter()
            .find(|(path, _)| normalized == **path || normalized.ends_with(&format!("/{path}")))
            .map(|(path, record)| (path.as_str(), record))
    }

    /// Files generated from a given IR atom.
    pub fn files_for_atom<'a>(&'a self, atom: &'a str) -> impl Iterator<Item = &'a str> {
        self.files
            .iter()
            .filter(move |(_, record)| record.atoms.iter().any(|a| a == atom))
            .map(|(path, _)| path.as_str())
    }

    /// Write the manifest atomically into the generated app directory.
    pub fn write(&self, app_dir: &Path) -> std::io::Result<()> {
        let path = app_dir.join("generation_manifest.json");
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(app_dir: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(app_dir.join("generation_manifest.json"))?;
        serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> IrStats {
        IrStats {
            total_entities: 2,
            total_endpoints: 6,
            inferred_endpoints: 3,
        }
    }

    #[test]
    fn test_summary_accumulates() {
        let mut manifest = GenerationManifest::new("app", "safe".to_string(), false, stats());
        manifest.record(
            "Dockerfile",
            FileRecord {
                stratum: Stratum::Template,
                source_id: "template:dockerfile".to_string(),
                atoms: vec![],
                tokens_in: 0,
                tokens_out: 0,
                model: None,
                elapsed_ms: 1,
                passed: true,
            },
        );
        manifest.record(
            "src/services/cart_service.py",
            FileRecord {
                stratum: Stratum::Llm,
                source_id: "slot:add_item_to_cart".to_string(),
                atoms: vec!["flow:add_item_to_cart".to_string()],
                tokens_in: 120,
                tokens_out: 48,
                model: Some("scripted".to_string()),
                elapsed_ms: 12,
                passed: true,
            },
        );

        assert_eq!(manifest.stratum_summary.template_files, 1);
        assert_eq!(manifest.stratum_summary.llm_files, 1);
        assert_eq!(manifest.stratum_summary.total_tokens_out, 48);
    }

    #[test]
    fn test_frame_lookup_matches_absolute_paths() {
        let mut manifest = GenerationManifest::new("app", "safe".to_string(), false, stats());
        manifest.record(
            "src/services/cart_service.py",
            FileRecord {
                stratum: Stratum::Llm,
                source_id: "slot:add_item_to_cart".to_string(),
                atoms: vec![],
                tokens_in: 0,
                tokens_out: 0,
                model: None,
                elapsed_ms: 0,
                passed: true,
            },
        );

        let (path, _) = manifest
            .file_for_frame("/app/src/services/cart_service.py")
            .expect("frame resolves");
        assert_eq!(path, "src/services/cart_service.py");
    }
}
