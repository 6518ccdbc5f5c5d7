//! # Stratum Classification
//!
//! Every emitted file belongs to exactly one stratum, decided by a total,
//! side-effect-free path table:
//!
//! | Stratum | Role | LLM? |
//! |---------|------|------|
//! | Template | IR-independent infrastructure | never |
//! | Ast | IR-dependent structure | never |
//! | Llm | business-logic slot bodies + free-form artifacts | confined |
//!
//! A subset of template paths is *protected*: the LLM stratum may never
//! write there, and an attempted write is a hard error rather than a
//! skipped patch.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Generation class of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stratum {
    Template,
    Ast,
    Llm,
}

impl fmt::Display for Stratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stratum::Template => "template",
            Stratum::Ast => "ast",
            Stratum::Llm => "llm",
        };
        f.write_str(s)
    }
}

/// Paths the LLM stratum is forbidden to touch: compose, Dockerfile,
/// observability config, base model, health route, config module, and
/// migration tooling.
pub const TEMPLATE_PROTECTED_PATHS: &[&str] = &[
    "docker-compose.yml",
    "Dockerfile",
    "observability.yaml",
    "src/models/base.py",
    "src/routes/health.py",
    "src/core/config.py",
    "migrations/env.py",
    "alembic.ini",
];

/// Whether a path is in the template-protected set.
pub fn is_template_protected(path: &str) -> bool {
    TEMPLATE_PROTECTED_PATHS.contains(&path)
}

/// Classify a path into its stratum. Total: every path maps to exactly one
/// stratum, unknown paths default to Template (the LLM-free class).
pub fn classify(path: &str) -> Stratum {
    if is_template_protected(path) || path == "pyproject.toml" {
        return Stratum::Template;
    }
    if path == "README.md" || path == "requirements-extra.txt" {
        return Stratum::Llm;
    }
    if path.starts_with("src/services/") {
        return Stratum::Llm;
    }
    if path.starts_with("src/models/")
        || path.starts_with("src/repositories/")
        || path.starts_with("src/routes/")
        || path.starts_with("src/schemas/")
        || path.starts_with("migrations/versions/")
        || path.starts_with("scripts/")
        || path == "src/main.py"
    {
        return Stratum::Ast;
    }
    Stratum::Template
}

/// Guard an intended write: the write is rejected when the writing stratum
/// does not match the path's classification, and a protected-path write by
/// the LLM stratum is the hard-error case the caller must abort on.
pub fn check_write(path: &str, writer: Stratum) -> Result<(), StratumViolation> {
    if writer == Stratum::Llm && is_template_protected(path) {
        return Err(StratumViolation::ProtectedPath {
            path: path.to_string(),
        });
    }
    let expected = classify(path);
    if expected != writer {
        return Err(StratumViolation::WrongStratum {
            path: path.to_string(),
            expected,
            actual: writer,
        });
    }
    Ok(())
}

/// Stratum discipline violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StratumViolation {
    #[error("LLM write to template-protected path '{path}'")]
    ProtectedPath { path: String },

    #[error("path '{path}' belongs to the {expected} stratum, not {actual}")]
    WrongStratum {
        path: String,
        expected: Stratum,
        actual: Stratum,
    },
}
