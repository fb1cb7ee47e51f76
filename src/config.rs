//! `argus.config.{yaml,json,toml}` shape: `serde`-deserializable and
//! `schemars`-exportable so an adapter can validate documents against a
//! published JSON Schema.

use std::collections::HashMap;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::mocks::{MockResponse, MockRoute, OpenApiMockMode};
use crate::orchestrator::{HealthcheckSpec, ServiceDef};
use crate::parallel::ExecutionMode;
use crate::retry::{Backoff, BackoffStrategy, RetryPolicy};

fn default_network() -> String {
    "e2e-network".to_string()
}

fn default_history_dir() -> String {
    ".argus/history.db".to_string()
}

fn default_max_runs() -> u32 {
    100
}

fn default_max_age() -> String {
    "30d".to_string()
}

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct E2EConfig {
    pub version: u32,
    pub project: ProjectConfig,
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub tests: Option<TestsConfig>,
    #[serde(default)]
    pub resilience: Option<ResilienceConfig>,
    #[serde(default)]
    pub history: Option<HistoryConfig>,
    #[serde(default = "default_network")]
    pub network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectConfig {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub build: BuildConfig,
    pub container: ContainerConfig,
    #[serde(default)]
    pub mocks: HashMap<String, MockConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BuildConfig {
    pub dockerfile: String,
    #[serde(default = "default_context")]
    pub context: String,
    pub image: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

fn default_context() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ContainerConfig {
    pub name: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// `"containerPort:hostPort"` or a bare port (host chosen by the
    /// allocator).
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub healthcheck: Option<HealthcheckConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthcheckConfig {
    #[serde(default = "default_healthcheck_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_healthcheck_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_healthcheck_retries")]
    pub retries: u32,
}

fn default_healthcheck_interval_ms() -> u64 {
    1000
}

fn default_healthcheck_timeout_ms() -> u64 {
    30_000
}

fn default_healthcheck_retries() -> u32 {
    30
}

impl From<&HealthcheckConfig> for HealthcheckSpec {
    fn from(c: &HealthcheckConfig) -> Self {
        HealthcheckSpec {
            interval: Duration::from_millis(c.interval_ms),
            timeout: Duration::from_millis(c.timeout_ms),
            retries: c.retries,
        }
    }
}

/// One declared `service.mocks[name]` entry: a port plus either a static
/// `routes` list or a spec-driven `openapi` mock.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MockConfig {
    pub port: u16,
    #[serde(default)]
    pub routes: Vec<MockRouteConfig>,
    #[serde(default)]
    pub openapi: Option<OpenApiMockConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenApiMockConfig {
    pub spec_file: String,
    #[serde(default = "default_openapi_mode")]
    pub mode: String,
    #[serde(default)]
    pub upstream_base_url: Option<String>,
    #[serde(default = "default_openapi_max_depth")]
    pub max_depth: usize,
    #[serde(default)]
    pub validate_requests: bool,
    #[serde(default)]
    pub recordings_dir: Option<String>,
}

fn default_openapi_mode() -> String {
    "mock".to_string()
}

fn default_openapi_max_depth() -> usize {
    3
}

impl OpenApiMockConfig {
    pub fn parsed_mode(&self) -> OpenApiMockMode {
        match self.mode.as_str() {
            "record" => OpenApiMockMode::Record,
            "replay" => OpenApiMockMode::Replay,
            "smart" => OpenApiMockMode::Smart,
            _ => OpenApiMockMode::Mock,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MockRouteConfig {
    pub method: String,
    pub path: String,
    pub response: MockResponseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MockResponseConfig {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl From<&MockRouteConfig> for MockRoute {
    fn from(c: &MockRouteConfig) -> Self {
        MockRoute {
            method: c.method.clone(),
            path: c.path.clone(),
            response: MockResponse {
                status: c.response.status,
                headers: c.response.headers.clone(),
                body: c.response.body.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestsConfig {
    #[serde(default)]
    pub suites: Vec<SuiteConfig>,
    #[serde(default)]
    pub execution_mode: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub fail_fast: bool,
}

impl TestsConfig {
    pub fn parsed_execution_mode(&self) -> ExecutionMode {
        match self.execution_mode.as_deref() {
            Some("by-suite") => ExecutionMode::BySuite,
            Some("by-file") => ExecutionMode::ByFile,
            _ => ExecutionMode::Serial,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SuiteConfig {
    pub id: String,
    pub name: String,
    pub file: String,
    pub runner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_strategy")]
    pub backoff_strategy: String,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    /// Category allowlist retries are restricted to, e.g. `["timeout",
    /// "connection_refused"]`. Unset retries every category; unrecognized
    /// names are ignored rather than rejected.
    #[serde(default)]
    pub retry_categories: Option<Vec<String>>,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_strategy() -> String {
    "fixed".to_string()
}

fn default_initial_delay_ms() -> u64 {
    500
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(c: &ResilienceConfig) -> Self {
        let strategy = match c.backoff_strategy.as_str() {
            "linear" => BackoffStrategy::Linear,
            "exponential" => BackoffStrategy::Exponential,
            _ => BackoffStrategy::Fixed,
        };
        let retry_categories = c.retry_categories.as_ref().map(|names| {
            names.iter().filter_map(|n| crate::knowledge::FailureCategory::parse(n)).collect()
        });
        RetryPolicy {
            max_attempts: c.max_attempts,
            backoff: Backoff {
                strategy,
                initial: Duration::from_millis(c.initial_delay_ms),
                max: c.max_delay_ms.map(Duration::from_millis),
            },
            retry_categories,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_history_dir")]
    pub db_path: String,
    #[serde(default = "default_max_runs")]
    pub max_runs: u32,
    #[serde(default = "default_max_age")]
    pub max_age: String,
}

impl E2EConfig {
    /// Draft-7 JSON Schema for `E2EConfig`, for IDE/editor validation.
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(E2EConfig)
    }

    /// `(containerPort, hostPort)` pairs parsed from `"container:host"` or a
    /// bare `"container"` entry (host left `0`, meaning "allocate").
    pub fn parse_ports(ports: &[String]) -> Vec<(u16, Option<u16>)> {
        ports
            .iter()
            .filter_map(|p| {
                let mut parts = p.splitn(2, ':');
                let container = parts.next()?.parse::<u16>().ok()?;
                let host = parts.next().and_then(|h| h.parse::<u16>().ok());
                Some((container, host))
            })
            .collect()
    }

    pub fn service_defs(&self) -> Vec<ServiceDef> {
        self.services
            .iter()
            .map(|svc| crate::orchestrator::ServiceDef {
                name: svc.name.clone(),
                depends_on: svc.depends_on.clone(),
                dockerfile: svc.build.dockerfile.clone(),
                context_dir: svc.build.context.clone(),
                image_tag: svc.build.image.clone(),
                container: crate::docker::ContainerSpec {
                    name: svc.container.name.clone(),
                    image: svc.build.image.clone(),
                    env: svc.container.env.clone(),
                    ports: Vec::new(), // host ports are assigned by the allocator at build() time
                    network: None,
                    command: None,
                },
                healthcheck: svc.container.healthcheck.as_ref().map(HealthcheckSpec::from),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
version: 1
project:
  name: demo
network: custom-net
services:
  - name: api
    build:
      dockerfile: Dockerfile
      image: demo-api:test
    container:
      name: demo-api
      ports: ["8080:0"]
  - name: db
    build:
      dockerfile: Dockerfile.db
      image: demo-db:test
    container:
      name: demo-db
tests:
  suites:
    - id: smoke
      name: Smoke
      file: tests/smoke.yaml
      runner: yaml-http
  executionMode: by-suite
  failFast: true
"#
    }

    #[test]
    fn parses_minimal_config() {
        let config: E2EConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        assert_eq!(config.project.name, "demo");
        assert_eq!(config.network, "custom-net");
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.tests.as_ref().unwrap().suites.len(), 1);
        assert_eq!(
            config.tests.as_ref().unwrap().parsed_execution_mode(),
            ExecutionMode::BySuite
        );
    }

    #[test]
    fn defaults_network_when_absent() {
        let yaml = r#"
version: 1
project:
  name: demo
services: []
"#;
        let config: E2EConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network, "e2e-network");
    }

    #[test]
    fn parse_ports_handles_bare_and_mapped_forms() {
        let ports = vec!["8080:0".to_string(), "9000".to_string()];
        let parsed = E2EConfig::parse_ports(&ports);
        assert_eq!(parsed, vec![(8080, Some(0)), (9000, None)]);
    }

    #[test]
    fn json_schema_exports_root_object() {
        let schema = E2EConfig::json_schema();
        assert!(schema.schema.object.is_some());
    }

    #[test]
    fn parses_resilience_block_with_retry_categories() {
        let yaml = r#"
version: 1
project:
  name: demo
services: []
resilience:
  maxAttempts: 4
  backoffStrategy: exponential
  initialDelayMs: 200
  maxDelayMs: 2000
  retryCategories: [timeout, connection_refused]
"#;
        let config: E2EConfig = serde_yaml::from_str(yaml).unwrap();
        let resilience = config.resilience.as_ref().unwrap();
        assert_eq!(resilience.max_attempts, 4);
        assert_eq!(resilience.retry_categories.as_ref().unwrap().len(), 2);

        let policy = RetryPolicy::from(resilience);
        assert_eq!(policy.max_attempts, 4);
        assert!(policy.matches(crate::knowledge::FailureCategory::Timeout));
        assert!(policy.matches(crate::knowledge::FailureCategory::ConnectionRefused));
        assert!(!policy.matches(crate::knowledge::FailureCategory::AssertionMismatch));
    }

    #[test]
    fn resilience_without_retry_categories_matches_everything() {
        let resilience = ResilienceConfig {
            max_attempts: 2,
            backoff_strategy: "fixed".to_string(),
            initial_delay_ms: 100,
            max_delay_ms: None,
            retry_categories: None,
        };
        let policy = RetryPolicy::from(&resilience);
        assert!(policy.matches(crate::knowledge::FailureCategory::Unknown));
    }

    #[test]
    fn parses_mocks_map_with_static_routes_and_openapi_variants() {
        let yaml = r#"
version: 1
project:
  name: demo
services:
  - name: api
    build:
      dockerfile: Dockerfile
      image: demo-api:test
    container:
      name: demo-api
    mocks:
      upstream:
        port: 9100
        routes:
          - method: GET
            path: /health
            response:
              status: 200
              body: '{"ok":true}'
      payments:
        port: 9101
        openapi:
          specFile: specs/payments.yaml
          mode: smart
          validateRequests: true
"#;
        let config: E2EConfig = serde_yaml::from_str(yaml).unwrap();
        let service = &config.services[0];
        assert_eq!(service.mocks.len(), 2);

        let upstream = &service.mocks["upstream"];
        assert_eq!(upstream.port, 9100);
        assert_eq!(upstream.routes.len(), 1);
        assert!(upstream.openapi.is_none());

        let payments = &service.mocks["payments"];
        assert_eq!(payments.port, 9101);
        let openapi = payments.openapi.as_ref().unwrap();
        assert_eq!(openapi.spec_file, "specs/payments.yaml");
        assert_eq!(openapi.parsed_mode(), OpenApiMockMode::Smart);
        assert!(openapi.validate_requests);
        assert_eq!(openapi.max_depth, 3);
    }
}
