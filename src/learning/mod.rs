//! # Learning Store
//!
//! Persists what failed and what fixed it, across runs. Three logical
//! tables:
//!
//! - `ErrorKnowledge`: historical smoke failures keyed by normalized
//!   endpoint + error type + exception class
//! - `FixPattern`: repairs that worked, with success accounting
//! - `GenerationAntiPattern`: emission-time warnings injected into LLM
//!   prompts
//!
//! Two relationships connect them: `BRIDGED_FROM` (error knowledge →
//! anti-pattern) and `APPLIED_AS` (anti-pattern → fix pattern). The backing
//! storage is process-external and abstracted behind `PatternStore`; the
//! file-backed implementation keeps the whole store as one JSON document
//! with single-writer semantics.

pub mod bridge;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Prompt severity of an anti-pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSeverity {
    Low,
    Medium,
    High,
}

/// Historical record of a smoke failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorKnowledge {
    pub endpoint_normalized: String,
    pub error_type: String,
    pub exception_class: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
}

impl ErrorKnowledge {
    /// Canonical signature shared with fix patterns and anti-patterns.
    pub fn signature(&self) -> String {
        format!(
            "{}|{}|{}",
            self.endpoint_normalized, self.error_type, self.exception_class
        )
    }
}

/// A repair that has historically worked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixPattern {
    pub error_signature: String,
    pub fix_type: String,
    /// The reusable patch template (code text with `{entity}`-style holes)
    pub template: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    /// Distinct projects the pattern succeeded in
    #[serde(default)]
    pub projects: Vec<String>,
}

impl FixPattern {
    fn update_rate(&mut self) {
        let total = self.success_count + self.failure_count;
        self.success_rate = if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        };
    }

    /// Eligible for template promotion: ≥ 0.7 success over ≥ 3 successes
    /// across ≥ 3 distinct projects.
    pub fn promotion_eligible(&self) -> bool {
        self.success_rate >= 0.7 && self.success_count >= 3 && self.projects.len() >= 3
    }

    /// The stricter gate for promoting a pattern out of the LLM stratum
    /// into structural generation: 3+ projects, ≥ 0.7 success, 10+
    /// successful runs, and zero golden-app regressions observed.
    pub fn stratum_promotion_eligible(&self, golden_regressions: u64) -> bool {
        self.promotion_eligible() && self.success_count >= 10 && golden_regressions == 0
    }
}

/// An emission-time warning bridged from runtime failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationAntiPattern {
    pub entity_pattern: String,
    pub endpoint_pattern: String,
    pub wrong_snippet: String,
    pub correct_snippet: String,
    pub severity: PatternSeverity,
    pub occurrence_count: u64,
    pub prevention_count: u64,
    /// Error message tokens kept for semantic matching
    #[serde(default)]
    pub error_message: String,
}

impl GenerationAntiPattern {
    pub fn signature(&self) -> String {
        format!("{}|{}", self.entity_pattern, self.endpoint_pattern)
    }

    /// Prompt block in the `⚠️ AVOID … ✅ PREFER …` format.
    pub fn prompt_block(&self) -> String {
        format!(
            "⚠️ AVOID ({} {}): {}\n✅ PREFER: {}",
            self.entity_pattern, self.endpoint_pattern, self.wrong_snippet, self.correct_snippet
        )
    }
}

/// The serialized store document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    pub errors: BTreeMap<String, ErrorKnowledge>,
    pub fixes: BTreeMap<String, FixPattern>,
    pub anti_patterns: BTreeMap<String, GenerationAntiPattern>,
    /// BRIDGED_FROM: error signature → anti-pattern signature
    #[serde(default)]
    pub bridged_from: BTreeMap<String, String>,
    /// APPLIED_AS: anti-pattern signature → fix signature
    #[serde(default)]
    pub applied_as: BTreeMap<String, String>,
}

/// Store backend errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("pattern store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pattern store corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Backing storage seam. Implementations must provide single-writer
/// semantics per document.
pub trait PatternStore: Send + Sync {
    fn load(&self) -> Result<StoreData, StoreError>;
    fn save(&self, data: &StoreData) -> Result<(), StoreError>;
}

/// JSON-file-backed store. Writes are atomic (temp + rename).
pub struct FilePatternStore {
    path: PathBuf,
}

impl FilePatternStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FilePatternStore { path: path.into() }
    }
}

impl PatternStore for FilePatternStore {
    fn load(&self) -> Result<StoreData, StoreError> {
        if !self.path.exists() {
            return Ok(StoreData::default());
        }
        let text = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn save(&self, data: &StoreData) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(data)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// The learning substrate: in-memory view over a `PatternStore`, flushed
/// after every write batch so store commits happen-before the next emission
/// cycle.
pub struct LearningStore {
    backend: Box<dyn PatternStore>,
    data: RwLock<StoreData>,
    /// Project identity for fix-pattern promotion accounting
    project: String,
    /// Whether store write failures are fatal or merely logged
    required: bool,
}

impl LearningStore {
    pub fn open(backend: Box<dyn PatternStore>, project: impl Into<String>, required: bool)
        -> Result<Self, StoreError>
    {
        let data = backend.load()?;
        Ok(LearningStore {
            backend,
            data: RwLock::new(data),
            project: project.into(),
            required,
        })
    }

    pub fn open_file(
        path: impl Into<PathBuf>,
        project: impl Into<String>,
        required: bool,
    ) -> Result<Self, StoreError> {
        Self::open(Box::new(FilePatternStore::new(path)), project, required)
    }

    /// Record a smoke failure and immediately bridge it to an anti-pattern.
    pub fn record_error(
        &self,
        endpoint: &str,
        error_type: &str,
        exception_class: &str,
        error_message: &str,
    ) -> Result<(), StoreError> {
        let normalized = bridge::normalize_endpoint(endpoint);
        let now = Utc::now();
        {
            let mut data = self.data.write();
            let key = format!("{normalized}|{error_type}|{exception_class}");
            let entry = data.errors.entry(key.clone()).or_insert(ErrorKnowledge {
                endpoint_normalized: normalized.clone(),
                error_type: error_type.to_string(),
                exception_class: exception_class.to_string(),
                first_seen: now,
                last_seen: now,
                occurrence_count: 0,
            });
            entry.last_seen = now;
            entry.occurrence_count += 1;

            Self::bridge_error(&mut data, &key, error_message);
        }
        self.flush()
    }

    /// The ErrorKnowledgeBridge: convert an error row into an anti-pattern,
    /// deduplicating by signature and incrementing occurrences on dupes.
    fn bridge_error(data: &mut StoreData, error_key: &str, error_message: &str) {
        let Some(error) = data.errors.get(error_key) else {
            return;
        };
        let entity_pattern = bridge::extract_entity(&error.endpoint_normalized)
            .unwrap_or_else(|| "Unknown".to_string());
        let endpoint_pattern = error.endpoint_normalized.clone();

        let anti = GenerationAntiPattern {
            entity_pattern,
            endpoint_pattern,
            wrong_snippet: format!(
                "{} raised {}",
                error.error_type, error.exception_class
            ),
            correct_snippet: format!(
                "guard the operation against {} before mutating",
                error.exception_class
            ),
            severity: PatternSeverity::Medium,
            occurrence_count: 1,
            prevention_count: 0,
            error_message: error_message.to_string(),
        };
        let signature = anti.signature();

        match data.anti_patterns.get_mut(&signature) {
            Some(existing) => {
                existing.occurrence_count += 1;
                if !error_message.is_empty() {
                    existing.error_message = error_message.to_string();
                }
            }
            None => {
                data.anti_patterns.insert(signature.clone(), anti);
            }
        }
        data.bridged_from
            .insert(error.signature(), signature);
    }

    /// Record an anti-pattern directly (e.g. a rejected template-protected
    /// patch at emission time).
    pub fn record_anti_pattern(&self, anti: GenerationAntiPattern) -> Result<(), StoreError> {
        {
            let mut data = self.data.write();
            let signature = anti.signature();
            match data.anti_patterns.get_mut(&signature) {
                Some(existing) => {
                    existing.occurrence_count += 1;
                    // An escalation replaces the remembered snippets along
                    // with the severity.
                    if anti.severity > existing.severity {
                        existing.severity = anti.severity;
                        existing.wrong_snippet = anti.wrong_snippet;
                        existing.correct_snippet = anti.correct_snippet;
                    }
                }
                None => {
                    data.anti_patterns.insert(signature, anti);
                }
            }
        }
        self.flush()
    }

    /// Record the outcome of applying a fix. Creates the pattern on first
    /// use; updates the running success rate every time.
    pub fn record_fix_outcome(
        &self,
        error_signature: &str,
        fix_type: &str,
        template: &str,
        success: bool,
    ) -> Result<(), StoreError> {
        {
            let mut data = self.data.write();
            let key = format!("{error_signature}|{fix_type}");
            let project = self.project.clone();
            let entry = data.fixes.entry(key.clone()).or_insert(FixPattern {
                error_signature: error_signature.to_string(),
                fix_type: fix_type.to_string(),
                template: template.to_string(),
                success_count: 0,
                failure_count: 0,
                success_rate: 0.0,
                projects: Vec::new(),
            });
            if success {
                entry.success_count += 1;
                if !entry.projects.contains(&project) {
                    entry.projects.push(project);
                }
            } else {
                entry.failure_count += 1;
            }
            entry.update_rate();

            // APPLIED_AS: connect the anti-pattern that predicted this
            // failure to the fix that resolved it.
            if let Some(anti_sig) = data.bridged_from.get(error_signature).cloned() {
                data.applied_as.insert(anti_sig, key);
            }
        }
        self.flush()
    }

    /// A stored fix pattern matching the signature, if any. Used by the
    /// learned-pattern replay strategy.
    pub fn fix_for(&self, error_signature: &str) -> Option<FixPattern> {
        let data = self.data.read();
        data.fixes
            .values()
            .filter(|f| f.error_signature == error_signature)
            .max_by(|a, b| {
                a.success_rate
                    .partial_cmp(&b.success_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    /// Anti-patterns relevant to a flow, ranked by keyword intersection and
    /// severity. Patterns below `min_occurrences` are not escalated into
    /// prompts.
    pub fn patterns_for_flow(
        &self,
        flow_name: &str,
        min_occurrences: u64,
        limit: usize,
    ) -> Vec<GenerationAntiPattern> {
        let data = self.data.read();
        let mut scored: Vec<(usize, GenerationAntiPattern)> = data
            .anti_patterns
            .values()
            .filter(|p| p.occurrence_count >= min_occurrences)
            .filter_map(|p| {
                let sources = [
                    p.endpoint_pattern.as_str(),
                    p.entity_pattern.as_str(),
                    p.error_message.as_str(),
                ];
                let score = bridge::semantic_match_score(flow_name, &sources);
                if score == 0 {
                    None
                } else {
                    Some((score, p.clone()))
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.severity.cmp(&a.1.severity))
                .then(b.1.occurrence_count.cmp(&a.1.occurrence_count))
        });
        scored.into_iter().take(limit).map(|(_, p)| p).collect()
    }

    /// Fix patterns currently eligible for template promotion.
    pub fn promotion_candidates(&self) -> Vec<FixPattern> {
        self.data
            .read()
            .fixes
            .values()
            .filter(|f| f.promotion_eligible())
            .cloned()
            .collect()
    }

    /// Count anti-patterns (tests and telemetry).
    pub fn anti_pattern_count(&self) -> usize {
        self.data.read().anti_patterns.len()
    }

    pub fn anti_pattern(&self, signature: &str) -> Option<GenerationAntiPattern> {
        self.data.read().anti_patterns.get(signature).cloned()
    }

    /// Flush the document to the backend. Failures are fatal only when the
    /// store was opened as required.
    fn flush(&self) -> Result<(), StoreError> {
        let data = self.data.read();
        match self.backend.save(&data) {
            Ok(()) => Ok(()),
            Err(e) if self.required => Err(e),
            Err(e) => {
                warn!(error = %e, "learning store write failed; continuing without persistence");
                Ok(())
            }
        }
    }
}

/// Read-mostly registry of promoted fix templates, rebuilt from the store
/// at pipeline start and queried by emitters. One of the three process-wide
/// registries with explicit init and teardown.
pub struct PatternBank {
    templates: RwLock<BTreeMap<String, String>>,
}

impl PatternBank {
    pub fn new() -> Self {
        PatternBank {
            templates: RwLock::new(BTreeMap::new()),
        }
    }

    /// Initialize from the learning store's promotion candidates.
    pub fn init_from(&self, store: &LearningStore) {
        let mut templates = self.templates.write();
        templates.clear();
        for fix in store.promotion_candidates() {
            debug!(signature = %fix.error_signature, "promoting fix pattern to bank");
            templates.insert(fix.error_signature.clone(), fix.template.clone());
        }
    }

    pub fn template(&self, signature: &str) -> Option<String> {
        self.templates.read().get(signature).cloned()
    }

    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }

    /// Teardown: drop all entries. Called at pipeline shutdown.
    pub fn clear(&self) {
        self.templates.write().clear();
    }
}

impl Default for PatternBank {
    fn default() -> Self {
        PatternBank::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> LearningStore {
        struct Null;
        impl PatternStore for Null {
            fn load(&self) -> Result<StoreData, StoreError> {
                Ok(StoreData::default())
            }
            fn save(&self, _data: &StoreData) -> Result<(), StoreError> {
                Ok(())
            }
        }
        LearningStore::open(Box::new(Null), "test_project", false).expect("open")
    }

    #[test]
    fn test_error_bridges_to_anti_pattern() {
        let store = memory_store();
        store
            .record_error(
                "/carts/42/items",
                "DATABASE",
                "IntegrityError",
                "stock underflow",
            )
            .expect("record");

        assert_eq!(store.anti_pattern_count(), 1);
        let anti = store
            .anti_pattern("Cart|/carts/{id}/items")
            .expect("bridged anti-pattern");
        assert_eq!(anti.occurrence_count, 1);

        // A duplicate failure increments the counter instead of duplicating.
        store
            .record_error(
                "/carts/7/items",
                "DATABASE",
                "IntegrityError",
                "stock underflow",
            )
            .expect("record");
        assert_eq!(store.anti_pattern_count(), 1);
        let anti = store
            .anti_pattern("Cart|/carts/{id}/items")
            .expect("bridged anti-pattern");
        assert_eq!(anti.occurrence_count, 2);
    }

    #[test]
    fn test_fix_rate_updates_on_every_application() {
        let store = memory_store();
        store
            .record_fix_outcome("sig", "database", "template", true)
            .expect("record");
        store
            .record_fix_outcome("sig", "database", "template", false)
            .expect("record");

        let fix = store.fix_for("sig").expect("fix pattern");
        assert_eq!(fix.success_count, 1);
        assert_eq!(fix.failure_count, 1);
        assert!((fix.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_promotion_requires_three_projects() {
        let mut fix = FixPattern {
            error_signature: "sig".to_string(),
            fix_type: "database".to_string(),
            template: "t".to_string(),
            success_count: 5,
            failure_count: 0,
            success_rate: 1.0,
            projects: vec!["a".to_string(), "b".to_string()],
        };
        assert!(!fix.promotion_eligible());
        fix.projects.push("c".to_string());
        assert!(fix.promotion_eligible());

        // Stratum promotion is stricter: ten successful runs and no golden
        // regressions.
        assert!(!fix.stratum_promotion_eligible(0));
        fix.success_count = 10;
        assert!(fix.stratum_promotion_eligible(0));
        assert!(!fix.stratum_promotion_eligible(1));
    }

    #[test]
    fn test_semantic_query_finds_cart_patterns() {
        let store = memory_store();
        store
            .record_error("/carts/42/items", "DATABASE", "IntegrityError", "stock")
            .expect("record");
        store
            .record_error("/carts/42/items", "DATABASE", "IntegrityError", "stock")
            .expect("record");
        store
            .record_error("/invoices", "ROUTE", "HTTPNotFoundError", "missing route")
            .expect("record");

        let patterns = store.patterns_for_flow("add_item_to_cart", 2, 5);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].entity_pattern, "Cart");
    }
}
