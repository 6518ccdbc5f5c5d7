//! # Mutation History
//!
//! Every code mutation a repair strategy applies is recorded as a unified
//! diff against a per-iteration snapshot of the generated source tree,
//! tagged with the violation that triggered it and - after the next smoke
//! run - its outcome. On regression, the orchestrator rolls the tree back
//! to the prior snapshot; commits happen in application order, so rollback
//! is deterministic. A repair that targets a file outside the snapshot is
//! rejected.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Extensions captured by source-tree snapshots.
const SNAPSHOT_EXTENSIONS: &[&str] = &["py", "toml", "yml", "yaml", "ini", "md", "txt"];

/// One applied mutation.
#[derive(Debug, Clone, Serialize)]
pub struct Mutation {
    pub file_path: String,
    /// Canonical violation key that triggered this mutation
    pub violation_key: String,
    pub fix_type: String,
    pub description: String,
    /// Unified diff against the iteration snapshot
    pub diff: String,
    /// Full content after the mutation (the replay template)
    pub after: String,
    /// Outcome after the next smoke run; None until judged
    pub outcome: Option<bool>,
    /// IR realignment implied by this mutation, applied by backpropagation
    pub realignment: Option<super::backprop::IrRealignment>,
}

impl Mutation {
    /// Signature for repair-cycle detection.
    pub fn signature(&self) -> String {
        format!("{}|{}|{}", self.file_path, self.fix_type, self.violation_key)
    }
}

/// Mutation recording errors.
#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    /// The target file is not part of the current snapshot
    #[error("mutation targets '{path}' which is not in the iteration snapshot")]
    OutsideSnapshot { path: String },

    #[error("no open iteration; call begin_iteration first")]
    NoIteration,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A snapshot of the source tree at the start of an iteration.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    iteration: u32,
    files: BTreeMap<String, String>,
    mutations: Vec<Mutation>,
}

/// Ordered mutation history across repair iterations.
#[derive(Debug, Default)]
pub struct MutationHistory {
    snapshots: Vec<Snapshot>,
}

impl MutationHistory {
    pub fn new() -> Self {
        MutationHistory::default()
    }

    /// Snapshot the tree and open a new iteration.
    pub fn begin_iteration(&mut self, iteration: u32, app_dir: &Path) -> std::io::Result<()> {
        let mut files = BTreeMap::new();
        collect_files(app_dir, app_dir, &mut files)?;
        self.snapshots.push(Snapshot {
            iteration,
            files,
            mutations: Vec::new(),
        });
        Ok(())
    }

    /// Record a mutation in the open iteration. The file must exist in the
    /// iteration snapshot (new files are introduced by emission, never by
    /// repair).
    pub fn record(&mut self, mutation: Mutation) -> Result<(), MutationError> {
        let snapshot = self.snapshots.last_mut().ok_or(MutationError::NoIteration)?;
        if !snapshot.files.contains_key(&mutation.file_path) {
            return Err(MutationError::OutsideSnapshot {
                path: mutation.file_path.clone(),
            });
        }
        snapshot.mutations.push(mutation);
        Ok(())
    }

    /// Content of a file as of the open iteration's snapshot.
    pub fn snapshot_content(&self, path: &str) -> Option<&str> {
        self.snapshots
            .last()
            .and_then(|s| s.files.get(path))
            .map(String::as_str)
    }

    /// Mutations applied in the open iteration.
    pub fn current_mutations(&self) -> &[Mutation] {
        self.snapshots.last().map_or(&[], |s| s.mutations.as_slice())
    }

    /// Set the outcome of every mutation in the given iteration.
    pub fn judge_iteration(&mut self, iteration: u32, judge: impl Fn(&Mutation) -> bool) {
        if let Some(snapshot) = self.snapshots.iter_mut().find(|s| s.iteration == iteration) {
            for mutation in &mut snapshot.mutations {
                let success = judge(mutation);
                mutation.outcome = Some(success);
            }
        }
    }

    /// Mutations of a closed iteration, for outcome recording.
    pub fn mutations_for(&self, iteration: u32) -> &[Mutation] {
        self.snapshots
            .iter()
            .find(|s| s.iteration == iteration)
            .map_or(&[], |s| s.mutations.as_slice())
    }

    /// Restore every file of the open iteration's snapshot to disk,
    /// undoing that iteration's mutations. Returns the number of files
    /// restored.
    pub fn rollback_current(&self, app_dir: &Path) -> std::io::Result<usize> {
        let Some(snapshot) = self.snapshots.last() else {
            return Ok(0);
        };
        let mut restored = 0usize;
        let touched: std::collections::HashSet<&str> = snapshot
            .mutations
            .iter()
            .map(|m| m.file_path.as_str())
            .collect();
        for path in touched {
            if let Some(content) = snapshot.files.get(path) {
                crate::emitter::write_atomic(app_dir, path, content)?;
                restored += 1;
            }
        }
        Ok(restored)
    }
}

fn collect_files(
    root: &Path,
    dir: &Path,
    files: &mut BTreeMap<String, String>,
) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == "__pycache__" {
            continue;
        }
        if path.is_dir() {
            collect_files(root, &path, files)?;
            continue;
        }
        let keep = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| SNAPSHOT_EXTENSIONS.contains(&ext))
            || name == "Dockerfile";
        if !keep {
            continue;
        }
        if let (Ok(rel), Ok(content)) = (path.strip_prefix(root), std::fs::read_to_string(&path)) {
            files.insert(rel.to_string_lossy().replace('\\', "/"), content);
        }
    }
    Ok(())
}

/// Minimal unified diff between two texts. Line-based LCS; one hunk per
/// contiguous change run. Deterministic, which is what rollback and replay
/// care about.
pub fn unified_diff(path: &str, before: &str, after: &str) -> String {
    if before == after {
        return String::new();
    }
    let a: Vec<&str> = before.lines().collect();
    let b: Vec<&str> = after.lines().collect();

    // LCS table; generated files are small enough for the quadratic table.
    let mut lcs = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut out = format!("--- a/{path}\n+++ b/{path}\n");
    let mut i = 0usize;
    let mut j = 0usize;
    let mut hunk: Vec<String> = Vec::new();
    let mut hunk_start = (0usize, 0usize);

    let mut flush = |hunk: &mut Vec<String>, start: (usize, usize), out: &mut String| {
        if hunk.is_empty() {
            return;
        }
        let removed = hunk.iter().filter(|l| l.starts_with('-')).count();
        let added = hunk.iter().filter(|l| l.starts_with('+')).count();
        out.push_str(&format!(
            "@@ -{},{removed} +{},{added} @@\n",
            start.0 + 1,
            start.1 + 1
        ));
        for line in hunk.drain(..) {
            out.push_str(&line);
            out.push('\n');
        }
    };

    while i < a.len() || j < b.len() {
        if i < a.len() && j < b.len() && a[i] == b[j] {
            flush(&mut hunk, hunk_start, &mut out);
            i += 1;
            j += 1;
        } else if j < b.len() && (i == a.len() || lcs[i][j + 1] >= lcs[i + 1][j]) {
            if hunk.is_empty() {
                hunk_start = (i, j);
            }
            hunk.push(format!("+{}", b[j]));
            j += 1;
        } else if i < a.len() {
            if hunk.is_empty() {
                hunk_start = (i, j);
            }
            hunk.push(format!("-{}", a[i]));
            i += 1;
        }
    }
    flush(&mut hunk, hunk_start, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_marks_changed_lines() {
        let before = "a\nb\nc\n";
        let after = "a\nB\nc\n";
        let diff = unified_diff("f.py", before, after);
        assert!(diff.contains("-b"));
        assert!(diff.contains("+B"));
        assert!(diff.starts_with("--- a/f.py"));
    }

    #[test]
    fn test_identical_files_empty_diff() {
        assert_eq!(unified_diff("f.py", "same\n", "same\n"), "");
    }

    #[test]
    fn test_record_rejects_unknown_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("known.py"), "x = 1\n").expect("write");

        let mut history = MutationHistory::new();
        history.begin_iteration(0, tmp.path()).expect("snapshot");

        let bad = Mutation {
            file_path: "unknown.py".to_string(),
            violation_key: "k".to_string(),
            fix_type: "database".to_string(),
            description: "d".to_string(),
            diff: String::new(),
            after: String::new(),
            outcome: None,
            realignment: None,
        };
        assert!(matches!(
            history.record(bad),
            Err(MutationError::OutsideSnapshot { .. })
        ));
    }

    #[test]
    fn test_rollback_restores_snapshot() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("app.py"), "original\n").expect("write");

        let mut history = MutationHistory::new();
        history.begin_iteration(0, tmp.path()).expect("snapshot");
        history
            .record(Mutation {
                file_path: "app.py".to_string(),
                violation_key: "k".to_string(),
                fix_type: "validation".to_string(),
                description: "d".to_string(),
                diff: String::new(),
                after: "mutated\n".to_string(),
                outcome: None,
                realignment: None,
            })
            .expect("record");
        std::fs::write(tmp.path().join("app.py"), "mutated\n").expect("mutate");

        let restored = history.rollback_current(tmp.path()).expect("rollback");
        assert_eq!(restored, 1);
        let content = std::fs::read_to_string(tmp.path().join("app.py")).expect("read");
        assert_eq!(content, "original\n");
    }
}
