//! # Deployer
//!
//! Brings the generated application up for smoke testing. Two modes:
//!
//! - **Docker**: `docker compose up --build` in the generated directory,
//!   with a hard build deadline and an optional no-cache rebuild between
//!   repair iterations.
//! - **Local process**: seed script + uvicorn as a child process when
//!   Docker is unavailable. The degradation is explicit - it happens only
//!   when `enforce_runtime` is off; otherwise missing Docker aborts the
//!   pipeline.
//!
//! The deployment handle captures server stdout/stderr so the smoke runner
//! can attach logs to violations.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::PipelineError;
use crate::ir::ApplicationIr;
use crate::smoke::{ExecutionOutcome, HttpExecutor, Scenario, ScenarioExecutor};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// How the application is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentKind {
    Docker,
    LocalProcess,
}

/// A running deployment.
pub struct Deployment {
    pub kind: DeploymentKind,
    base_url: String,
    app_dir: PathBuf,
    child: tokio::sync::Mutex<Option<Child>>,
    log_buffer: Arc<Mutex<String>>,
}

impl Deployment {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Server logs captured since the last drain.
    pub fn drain_logs(&self) -> String {
        std::mem::take(&mut *self.log_buffer.lock())
    }

    /// Stop the deployment. Docker deployments run `compose down`; local
    /// processes are killed.
    pub async fn shutdown(&self) {
        if self.kind == DeploymentKind::Docker {
            let _ = Command::new("docker")
                .args(["compose", "down", "--remove-orphans"])
                .current_dir(&self.app_dir)
                .output()
                .await;
        }
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

/// Deployment driver honoring the Docker lifecycle policy.
pub struct Deployer {
    enforce_runtime: bool,
    build_timeout: Duration,
}

impl Deployer {
    pub fn from_config(config: &Config) -> Self {
        Deployer {
            enforce_runtime: config.docker.enforce_runtime,
            build_timeout: Duration::from_secs(config.docker.build_timeout_seconds),
        }
    }

    /// Whether a usable Docker daemon is present.
    pub async fn docker_available() -> bool {
        Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Deploy the generated app and wait for its health endpoint.
    pub async fn deploy(
        &self,
        app_dir: &Path,
        ir: &ApplicationIr,
        cancel: &CancelToken,
    ) -> Result<Deployment, PipelineError> {
        cancel.check().map_err(|_| PipelineError::Cancelled)?;

        let deployment = if Self::docker_available().await {
            self.deploy_docker(app_dir, ir).await?
        } else if self.enforce_runtime {
            return Err(PipelineError::DockerUnavailable {
                reason: "docker daemon not reachable and enforce_runtime is set".to_string(),
            });
        } else {
            warn!("docker unavailable; degrading to in-process launch");
            self.deploy_local(app_dir, ir).await?
        };

        self.wait_ready(&deployment, ir, cancel).await?;
        Ok(deployment)
    }

    /// Deploy as a local child process regardless of Docker availability.
    /// Used by the FAST QA level, which never builds containers.
    pub async fn deploy_in_process(
        &self,
        app_dir: &Path,
        ir: &ApplicationIr,
        cancel: &CancelToken,
    ) -> Result<Deployment, PipelineError> {
        cancel.check().map_err(|_| PipelineError::Cancelled)?;
        let deployment = self.deploy_local(app_dir, ir).await?;
        self.wait_ready(&deployment, ir, cancel).await?;
        Ok(deployment)
    }

    /// Rebuild the container image without cache. Used between repair
    /// iterations when `rebuild_between_repairs` is set.
    pub async fn rebuild_no_cache(&self, app_dir: &Path) -> Result<(), PipelineError> {
        info!("rebuilding container without cache");
        let build = Command::new("docker")
            .args(["compose", "build", "--no-cache"])
            .current_dir(app_dir)
            .output();
        let output = tokio::time::timeout(self.build_timeout, build)
            .await
            .map_err(|_| PipelineError::DeadlineExceeded {
                component: "docker build".to_string(),
                seconds: self.build_timeout.as_secs(),
            })??;
        if !output.status.success() {
            return Err(PipelineError::DeploymentFailed {
                reason: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    async fn deploy_docker(
        &self,
        app_dir: &Path,
        ir: &ApplicationIr,
    ) -> Result<Deployment, PipelineError> {
        info!(dir = %app_dir.display(), "deploying with docker compose");
        let up = Command::new("docker")
            .args(["compose", "up", "--build", "--detach", "--wait"])
            .current_dir(app_dir)
            .output();
        let output = tokio::time::timeout(self.build_timeout, up)
            .await
            .map_err(|_| PipelineError::DeadlineExceeded {
                component: "docker compose up".to_string(),
                seconds: self.build_timeout.as_secs(),
            })??;
        if !output.status.success() {
            return Err(PipelineError::DeploymentFailed {
                reason: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(Deployment {
            kind: DeploymentKind::Docker,
            base_url: format!("http://localhost:{}", ir.infrastructure.app_port()),
            app_dir: app_dir.to_path_buf(),
            child: tokio::sync::Mutex::new(None),
            log_buffer: Arc::new(Mutex::new(String::new())),
        })
    }

    async fn deploy_local(
        &self,
        app_dir: &Path,
        ir: &ApplicationIr,
    ) -> Result<Deployment, PipelineError> {
        let port = ir.infrastructure.app_port();

        // Seed first so fixture ids exist before the server answers.
        let seed = Command::new("python")
            .args(["scripts/seed.py"])
            .current_dir(app_dir)
            .env("DATABASE_URL", "sqlite:///./smoke.db")
            .output()
            .await?;
        if !seed.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&seed.stderr),
                "seed script failed; continuing with an empty database"
            );
        }

        let mut child = Command::new("python")
            .args([
                "-m",
                "uvicorn",
                "src.main:app",
                "--host",
                "127.0.0.1",
                "--port",
                &port.to_string(),
            ])
            .current_dir(app_dir)
            .env("DATABASE_URL", "sqlite:///./smoke.db")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let log_buffer = Arc::new(Mutex::new(String::new()));
        if let Some(stdout) = child.stdout.take() {
            spawn_log_pump(stdout, Arc::clone(&log_buffer));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_pump(stderr, Arc::clone(&log_buffer));
        }

        Ok(Deployment {
            kind: DeploymentKind::LocalProcess,
            base_url: format!("http://127.0.0.1:{port}"),
            app_dir: app_dir.to_path_buf(),
            child: tokio::sync::Mutex::new(Some(child)),
            log_buffer,
        })
    }

    /// Poll the health endpoint until it answers 200 or the deadline
    /// passes.
    async fn wait_ready(
        &self,
        deployment: &Deployment,
        ir: &ApplicationIr,
        cancel: &CancelToken,
    ) -> Result<(), PipelineError> {
        let url = format!(
            "{}{}",
            deployment.base_url(),
            ir.infrastructure.health_path
        );
        let client = reqwest::Client::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(60);

        loop {
            cancel.check().map_err(|_| PipelineError::Cancelled)?;
            if let Ok(response) = client.get(&url).send().await {
                if response.status().is_success() {
                    info!(url = %url, "deployment healthy");
                    return Ok(());
                }
            }
            if std::time::Instant::now() > deadline {
                return Err(PipelineError::DeploymentFailed {
                    reason: format!("health endpoint {url} never became ready"),
                });
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

fn spawn_log_pump(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    buffer: Arc<Mutex<String>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut buf = buffer.lock();
            buf.push_str(&line);
            buf.push('\n');
        }
    });
}

/// Scenario executor bound to a live deployment: HTTP against the base URL
/// with server logs attached from the deployment's capture buffer.
pub struct LiveExecutor {
    http: HttpExecutor,
    deployment: Arc<Deployment>,
}

impl LiveExecutor {
    pub fn new(deployment: Arc<Deployment>) -> Self {
        LiveExecutor {
            http: HttpExecutor::new(deployment.base_url().to_string()),
            deployment,
        }
    }
}

#[async_trait]
impl ScenarioExecutor for LiveExecutor {
    async fn execute(&self, scenario: &Scenario) -> Result<ExecutionOutcome, String> {
        let mut outcome = self.http.execute(scenario).await?;
        outcome.server_log = self.deployment.drain_logs();
        Ok(outcome)
    }

    async fn drain_logs(&self) -> String {
        self.deployment.drain_logs()
    }
}
