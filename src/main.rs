//! Thin CLI adapter binary for local smoke-testing of the core. The real
//! tool-protocol/dashboard adapters live outside this crate; this binary
//! only exercises [`argus_core::facade::Argus`] enough to be useful from a
//! terminal during development.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use argus_core::config::E2EConfig;
use argus_core::docker::DockerEngine;
use argus_core::history::Trigger;
use argus_core::ports::PortAllocator;
use argus_core::Argus;

#[derive(Parser)]
#[command(name = "argus-core")]
#[command(about = "Argus end-to-end test orchestrator (core smoke-test CLI)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the E2EConfig JSON Schema (Draft-7), for IDE validation.
    Schema,
    /// Run `init -> build -> setup -> run -> clean` against a config file.
    Run {
        /// Path to an E2EConfig document (YAML or JSON).
        #[arg(short, long, env = "E2E_CONFIG", default_value = "e2e.config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("argus_core={}", log_level).into()),
        )
        .init();

    match cli.command {
        Commands::Schema => {
            let schema = E2EConfig::json_schema();
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        Commands::Run { config } => {
            run_once(&config).await?;
        }
    }

    Ok(())
}

async fn run_once(config_path: &str) -> Result<()> {
    let raw = tokio::fs::read_to_string(config_path).await?;
    let config: E2EConfig = if config_path.ends_with(".json") {
        serde_json::from_str(&raw)?
    } else if config_path.ends_with(".toml") {
        toml::from_str(&raw)?
    } else {
        serde_yaml::from_str(&raw)?
    };

    let project_path = std::env::current_dir()?.to_string_lossy().into_owned();
    let docker = DockerEngine::connect()?;
    let argus = Argus::new(docker, PortAllocator::default());

    info!(project = %project_path, "init");
    argus.init(&project_path, &config, Some(config_path.to_string())).await?;

    info!("build");
    argus.build(&project_path, &config, false).await?;

    info!("setup");
    argus.setup(&project_path, &config).await?;

    info!("run");
    let result = argus.run(&project_path, &config, Trigger::Cli).await?;
    for suite in &result.suites {
        info!(suite = %suite.suite_id, status = ?suite.status, passed = suite.passed, failed = suite.failed, "suite finished");
    }

    info!("clean");
    let warnings = argus.clean(&project_path, &config).await?;
    for warning in warnings {
        tracing::warn!(%warning, "clean warning");
    }

    Ok(())
}
