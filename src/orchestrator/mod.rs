//! Builds/starts/tears down N services honoring a `dependsOn` topology
//!.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::docker::{ContainerSpec, DockerEngine, DockerEngineError};
use crate::error::ErrorCode;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("cyclic service dependency involving: {0:?}")]
    CyclicDependency(Vec<String>),

    #[error("unknown service in dependsOn: {0}")]
    UnknownDependency(String),

    #[error("docker error: {0}")]
    Docker(#[from] DockerEngineError),
}

impl ErrorCode for OrchestratorError {
    fn code(&self) -> &'static str {
        match self {
            OrchestratorError::CyclicDependency(_) => "CONFIG_ERROR",
            OrchestratorError::UnknownDependency(_) => "CONFIG_ERROR",
            OrchestratorError::Docker(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// One declared service.
#[derive(Debug, Clone)]
pub struct ServiceDef {
    pub name: String,
    pub depends_on: Vec<String>,
    pub dockerfile: String,
    pub context_dir: String,
    pub image_tag: String,
    pub container: ContainerSpec,
    pub healthcheck: Option<HealthcheckSpec>,
}

#[derive(Debug, Clone)]
pub struct HealthcheckSpec {
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

/// Rejects cycles statically; never attempts runtime
/// cycle-breaking. Returns services in dependency order (dependencies
/// before dependents).
pub fn topological_sort(services: &[ServiceDef]) -> Result<Vec<String>> {
    let names: HashSet<&str> = services.iter().map(|s| s.name.as_str()).collect();
    for service in services {
        for dep in &service.depends_on {
            if !names.contains(dep.as_str()) {
                return Err(OrchestratorError::UnknownDependency(dep.clone()));
            }
        }
    }

    let mut indegree: HashMap<&str, usize> = services.iter().map(|s| (s.name.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for service in services {
        for dep in &service.depends_on {
            *indegree.get_mut(service.name.as_str()).unwrap() += 1;
            dependents.entry(dep.as_str()).or_default().push(service.name.as_str());
        }
    }

    // deterministic order among ties, matching declaration order
    let order_index: HashMap<&str, usize> = services.iter().enumerate().map(|(i, s)| (s.name.as_str(), i)).collect();
    let mut initial: Vec<&str> = indegree
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(&name, _)| name)
        .collect();
    initial.sort_by_key(|n| order_index[n]);
    let mut queue: VecDeque<&str> = initial.into();

    let mut sorted = Vec::new();
    while let Some(name) = queue.pop_front() {
        sorted.push(name.to_string());
        if let Some(deps) = dependents.get(name) {
            let mut newly_free = Vec::new();
            for &dependent in deps {
                let count = indegree.get_mut(dependent).unwrap();
                *count -= 1;
                if *count == 0 {
                    newly_free.push(dependent);
                }
            }
            newly_free.sort_by_key(|n| order_index[n]);
            for n in newly_free {
                queue.push_back(n);
            }
        }
    }

    if sorted.len() != services.len() {
        let remaining: Vec<String> = services
            .iter()
            .map(|s| s.name.clone())
            .filter(|n| !sorted.contains(n))
            .collect();
        return Err(OrchestratorError::CyclicDependency(remaining));
    }

    Ok(sorted)
}

/// Coordinates N services' build/start/teardown lifecycle over their
/// dependency graph.
pub struct MultiServiceOrchestrator {
    docker: DockerEngine,
}

impl MultiServiceOrchestrator {
    pub fn new(docker: DockerEngine) -> Self {
        Self { docker }
    }

    /// Builds every service's image. `parallel` selects whether independent
    /// builds run concurrently; dependency order is irrelevant to building
    /// (only to starting), so with `parallel` set every service builds at
    /// once.
    pub async fn build_all(&self, services: &[ServiceDef], parallel: bool) -> Result<()> {
        topological_sort(services)?; // validates the graph even though build order is independent

        if parallel {
            let mut handles = Vec::new();
            for service in services {
                let docker = self.docker.clone();
                let dockerfile = service.dockerfile.clone();
                let image_tag = service.image_tag.clone();
                let name = service.name.clone();
                handles.push(tokio::spawn(async move {
                    build_one(&docker, &name, &dockerfile, &image_tag).await
                }));
            }
            for handle in handles {
                handle.await.map_err(|_| DockerEngineError::BuildFailed("build task panicked".into()))??;
            }
        } else {
            for service in services {
                build_one(&self.docker, &service.name, &service.dockerfile, &service.image_tag).await?;
            }
        }
        Ok(())
    }

    /// Starts services in topological order, waiting for each one's
    /// healthcheck (if declared) before starting its dependents.
    pub async fn start_all(&self, services: &[ServiceDef]) -> Result<()> {
        let order = topological_sort(services)?;
        let by_name: HashMap<&str, &ServiceDef> = services.iter().map(|s| (s.name.as_str(), s)).collect();

        for name in order {
            let service = by_name[name.as_str()];
            self.docker.start_container(&service.container).await?;
            info!(service = %name, "service started");

            if let Some(hc) = &service.healthcheck {
                let healthy = self
                    .docker
                    .wait_for_healthy(&service.container.name, hc.interval, hc.timeout, hc.retries)
                    .await?;
                if !healthy {
                    return Err(DockerEngineError::HealthTimeout(service.container.name.clone()).into());
                }
            }
        }
        Ok(())
    }

    /// Stops services in reverse topological order; idempotent. Errors are
    /// swallowed and reported back as warnings rather than aborting, so
    /// teardown completes best-effort.
    pub async fn clean_all(&self, services: &[ServiceDef]) -> Vec<String> {
        let mut warnings = Vec::new();
        let order = match topological_sort(services) {
            Ok(order) => order,
            Err(e) => {
                warnings.push(e.to_string());
                services.iter().map(|s| s.name.clone()).collect()
            }
        };

        for name in order.into_iter().rev() {
            if let Some(service) = services.iter().find(|s| s.name == name) {
                if let Err(e) = self.docker.stop_container(&service.container.name).await {
                    warn!(service = %name, error = %e, "clean: stop failed, continuing best-effort");
                    warnings.push(format!("{}: {}", name, e));
                }
            }
        }
        warnings
    }
}

async fn build_one(docker: &DockerEngine, name: &str, dockerfile: &str, image_tag: &str) -> Result<()> {
    use tokio_stream::StreamExt;
    let mut stream = docker.build_image(Vec::new(), dockerfile, image_tag);
    let mut error = None;
    while let Some(event) = stream.next().await {
        if let crate::docker::BuildEvent::BuildEnd { success, error: err } = event {
            if !success {
                error = err;
            }
        }
    }
    if let Some(error) = error {
        warn!(service = name, %error, "build failed");
        return Err(DockerEngineError::BuildFailed(error).into());
    }
    Ok(())
}
