//! Thin wrapper over the Docker Engine API.
//!
//! Talks to the daemon through `bollard` instead of shelling out to the
//! `docker` CLI: build, run, exec, inspect, logs, network create/remove,
//! port probe, and health wait all have a directly corresponding Engine API
//! call, so nothing here depends on parsing CLI output (see DESIGN.md).

use std::collections::HashMap;
use std::net::TcpListener;
use std::time::{Duration, Instant};

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogsOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::error::ErrorCode;

#[derive(Debug, Error)]
pub enum DockerEngineError {
    #[error("docker daemon unavailable: {0}")]
    Unavailable(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("container start failed: {0}")]
    ContainerStartFailed(String),

    #[error("health check timed out for container {0}")]
    HealthTimeout(String),

    #[error("exec timed out after {0:?}")]
    ExecTimeout(Duration),

    #[error("exec exited with code {0}: {1}")]
    ExecFailed(i64, String),
}

impl ErrorCode for DockerEngineError {
    fn code(&self) -> &'static str {
        match self {
            DockerEngineError::Unavailable(_) => "DOCKER_UNAVAILABLE",
            DockerEngineError::ContainerNotFound(_) => "CONTAINER_START_FAILED",
            DockerEngineError::BuildFailed(_) => "BUILD_FAILED",
            DockerEngineError::ContainerStartFailed(_) => "CONTAINER_START_FAILED",
            DockerEngineError::HealthTimeout(_) => "HEALTH_TIMEOUT",
            DockerEngineError::ExecTimeout(_) => "HEALTH_TIMEOUT",
            DockerEngineError::ExecFailed(_, _) => "CONTAINER_START_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, DockerEngineError>;

/// Lazy build event sequence element.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    BuildStart,
    BuildLog(String),
    BuildEnd { success: bool, error: Option<String> },
}

/// Observed container runtime status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    Dead,
    NotFound,
    Created,
    Paused,
    Restarting,
}

impl ContainerStatus {
    fn from_state(state: &str) -> Self {
        match state {
            "running" => ContainerStatus::Running,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            "created" => ContainerStatus::Created,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            _ => ContainerStatus::NotFound,
        }
    }
}

/// Declarative spec for a container to run.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    /// (container_port, host_port)
    pub ports: Vec<(u16, u16)>,
    pub network: Option<String>,
    pub command: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    /// Streams `{build_start, build_log, build_end}` while building `image`
    /// from `context_dir`/`dockerfile`. The caller drives the returned
    /// stream to completion; dropping it early aborts consumption (the
    /// underlying build continues server-side, matching `docker build`).
    pub fn build_image(
        &self,
        context_tar: Vec<u8>,
        dockerfile: &str,
        image_tag: &str,
    ) -> ReceiverStream<BuildEvent> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let dockerfile = dockerfile.to_string();
        let image_tag = image_tag.to_string();

        tokio::spawn(async move {
            let _ = tx.send(BuildEvent::BuildStart).await;

            let options = BuildImageOptions {
                dockerfile: dockerfile.as_str(),
                t: image_tag.as_str(),
                rm: true,
                ..Default::default()
            };

            let mut stream = client.build_image(options, None, Some(context_tar.into()));
            let mut error: Option<String> = None;

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(info) => {
                        if let Some(stream_line) = info.stream {
                            let _ = tx.send(BuildEvent::BuildLog(stream_line)).await;
                        }
                        if let Some(err) = info.error {
                            error = Some(err.clone());
                            let _ = tx.send(BuildEvent::BuildLog(err)).await;
                        }
                    }
                    Err(e) => {
                        error = Some(e.to_string());
                        let _ = tx.send(BuildEvent::BuildLog(e.to_string())).await;
                        break;
                    }
                }
            }

            let _ = tx
                .send(BuildEvent::BuildEnd {
                    success: error.is_none(),
                    error,
                })
                .await;
        });

        ReceiverStream::new(rx)
    }

    /// Creates and starts a container, returning its id.
    pub async fn start_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for (container_port, host_port) in &spec.ports {
            let key = format!("{}/tcp", container_port);
            port_bindings.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
            exposed_ports.insert(key, HashMap::new());
        }

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            cmd: spec.command.clone(),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| DockerEngineError::ContainerStartFailed(e.to_string()))?;

        self.client
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| DockerEngineError::ContainerStartFailed(e.to_string()))?;

        info!(container = %spec.name, id = %created.id, "container started");
        Ok(created.id)
    }

    /// Idempotent: a missing container is treated as already stopped.
    pub async fn stop_container(&self, name: &str) -> Result<()> {
        match self
            .client
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = name, "already absent on stop");
            }
            Err(e) => return Err(e.into()),
        }

        match self
            .client
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) | Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_container_status(&self, name: &str) -> Result<ContainerStatus> {
        match self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let state = info
                    .state
                    .and_then(|s| s.status)
                    .map(|s| s.to_string().to_lowercase())
                    .unwrap_or_default();
                Ok(ContainerStatus::from_state(&state))
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ContainerStatus::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Polls `docker inspect` health every `interval` until healthy,
    /// `retries` exhausted, or `timeout` elapses.
    pub async fn wait_for_healthy(
        &self,
        name: &str,
        interval: Duration,
        timeout: Duration,
        retries: u32,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;

        loop {
            let info = self
                .client
                .inspect_container(name, None::<InspectContainerOptions>)
                .await?;

            let healthy = info
                .state
                .as_ref()
                .and_then(|s| s.health.as_ref())
                .and_then(|h| h.status)
                .map(|status| matches!(status, bollard::models::HealthStatusEnum::HEALTHY))
                .unwrap_or_else(|| {
                    // no healthcheck declared: treat "running" as healthy
                    info.state
                        .as_ref()
                        .and_then(|s| s.running)
                        .unwrap_or(false)
                });

            if healthy {
                return Ok(true);
            }

            attempts += 1;
            if attempts >= retries || Instant::now() >= deadline {
                warn!(container = name, attempts, "health wait exhausted");
                return Ok(false);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Create-if-missing bridge network; noop if it exists.
    pub async fn ensure_network(&self, name: &str) -> Result<()> {
        let existing = self.client.list_networks::<String>(None).await?;
        if existing.iter().any(|n| n.name.as_deref() == Some(name)) {
            return Ok(());
        }

        match self
            .client
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_network(&self, name: &str) -> Result<()> {
        match self.client.remove_network(name).await {
            Ok(()) | Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Attempts a loopback bind; an `EADDRINUSE` bind error is treated as
    /// "in use". The engine never retries -- retries belong to higher
    /// layers.
    pub fn is_port_in_use(&self, port: u16) -> bool {
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(_) => false,
            Err(e) => e.kind() == std::io::ErrorKind::AddrInUse,
        }
    }

    /// Runs `cmd` inside `container`, returning combined stdout, erroring if
    /// the exit code is nonzero or the wall-clock deadline is exceeded.
    pub async fn exec_in_container(
        &self,
        container: &str,
        cmd: Vec<String>,
        timeout: Duration,
    ) -> Result<String> {
        let exec = self
            .client
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| DockerEngineError::ExecFailed(-1, e.to_string()))?;

        self.do_exec(&exec.id, timeout).await
    }

    async fn do_exec(&self, exec_id: &str, timeout: Duration) -> Result<String> {
        let fut = async {
            let mut combined = String::new();
            match self.client.start_exec(exec_id, None).await? {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(chunk) = output.next().await {
                        let chunk = chunk?;
                        combined.push_str(&chunk.to_string());
                    }
                }
                StartExecResults::Detached => {}
            }
            Ok::<String, bollard::errors::Error>(combined)
        };

        let combined = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| DockerEngineError::ExecTimeout(timeout))??;

        let inspect = self.client.inspect_exec(exec_id).await?;
        let code = inspect.exit_code.unwrap_or(0);
        if code != 0 {
            return Err(DockerEngineError::ExecFailed(code, combined));
        }
        Ok(combined)
    }
}

/// Streams container logs as raw lines; used by `dockerExec` callers and
/// diagnostics that want recent output for a crashed container.
pub async fn tail_logs(
    engine: &DockerEngine,
    container: &str,
    tail: &str,
) -> Result<Vec<String>> {
    let mut stream = engine.client.logs(
        container,
        Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        }),
    );

    let mut lines = Vec::new();
    while let Some(chunk) = stream.next().await {
        if let Ok(chunk) = chunk {
            lines.push(chunk.to_string());
        }
    }
    Ok(lines)
}
