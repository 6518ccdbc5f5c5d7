//! # SpecForge CLI
//!
//! Drives the pipeline from the command line:
//!
//! ```bash
//! # Full pipeline: lower, emit, deploy, smoke, repair
//! specforge build app-spec.md
//!
//! # Lowering only - print the ApplicationIR as JSON
//! specforge lower app-spec.md
//!
//! # Emit the source tree without smoke testing
//! specforge emit app-spec.md
//!
//! # Inspect the learning store
//! specforge patterns
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use specforge::llm::HttpLlmClient;
use specforge::{CancelToken, Config, Pipeline, RunOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "specforge", version, about = "Lower application specs into deployable services")]
struct Cli {
    /// Configuration file (defaults to specforge.toml in the working dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline: lower, emit, deploy, smoke, repair
    Build {
        /// Markdown spec file
        spec: PathBuf,
    },
    /// Lower the spec and print the ApplicationIR as JSON
    Lower {
        spec: PathBuf,
    },
    /// Emit the generated source tree without smoke testing
    Emit {
        spec: PathBuf,
    },
    /// Show learned fix patterns eligible for promotion
    Patterns,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    match &config.logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "specforge.log");
            if config.logging.json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json().with_writer(appender))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(appender))
                    .init();
            }
        }
        None => {
            if config.logging.json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json())
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer())
                    .init();
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path).context("loading configuration")?,
        None => Config::load().context("loading configuration")?,
    };
    init_tracing(&config);

    let mut llm = HttpLlmClient::new(&config.llm.endpoint, &config.llm.model);
    if let Some(key) = &config.llm.api_key {
        llm = llm.with_api_key(key);
    }
    let pipeline = Pipeline::new(config.clone(), Arc::new(llm));
    let cancel = CancelToken::unbounded();

    match cli.command {
        Command::Build { spec } => {
            let text = std::fs::read_to_string(&spec)
                .with_context(|| format!("reading spec {}", spec.display()))?;
            let report = pipeline.run(&text, &cancel).await?;

            println!("app:        {}", report.app_dir.display());
            match &report.outcome {
                RunOutcome::Converged {
                    iterations,
                    pass_rate,
                } => println!("outcome:    converged after {iterations} iterations ({pass_rate:.2})"),
                RunOutcome::Regressed { pass_rate } => {
                    println!("outcome:    regressed ({pass_rate:.2}), mutations rolled back");
                }
                RunOutcome::Stalled { pass_rate } => println!("outcome:    stalled ({pass_rate:.2})"),
                RunOutcome::MaxIterations { pass_rate } => {
                    println!("outcome:    iteration budget exhausted ({pass_rate:.2})");
                }
                RunOutcome::AbortedFatal { reason } => println!("outcome:    aborted: {reason}"),
            }
            println!("gate:       {:?} ({:?})", report.gate.status, report.gate.environment);
            println!(
                "compliance: semantic {:.2} / relaxed {:.2} / strict {:.2}",
                report.compliance.semantic.overall,
                report.compliance.relaxed.overall,
                report.compliance.strict.overall
            );
            if matches!(report.outcome, RunOutcome::AbortedFatal { .. }) {
                std::process::exit(1);
            }
        }
        Command::Lower { spec } => {
            let text = std::fs::read_to_string(&spec)
                .with_context(|| format!("reading spec {}", spec.display()))?;
            let ir = pipeline.lower(&text, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&ir)?);
        }
        Command::Emit { spec } => {
            let text = std::fs::read_to_string(&spec)
                .with_context(|| format!("reading spec {}", spec.display()))?;
            let (_ir, manifest, app_dir) = pipeline.emit(&text, &cancel).await?;
            println!("emitted {} files to {}", manifest.files.len(), app_dir.display());
            for (path, record) in &manifest.files {
                println!("  [{}] {}", record.stratum, path);
            }
        }
        Command::Patterns => {
            let store = specforge::learning::LearningStore::open_file(
                &config.learning.store_path,
                "cli",
                false,
            )
            .context("opening learning store")?;
            let candidates = store.promotion_candidates();
            if candidates.is_empty() {
                println!("no fix patterns eligible for promotion");
            }
            for fix in candidates {
                println!(
                    "{} [{}] success {:.2} over {} projects",
                    fix.error_signature,
                    fix.fix_type,
                    fix.success_rate,
                    fix.projects.len()
                );
            }
        }
    }
    Ok(())
}
