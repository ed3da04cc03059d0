//! Engine entry point: serve the API + queue workers, or validate a
//! workflow file offline.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use strand_workflow_engine::handlers::HandlerPorts;
use strand_workflow_engine::state::SledGateway;
use strand_workflow_engine::{Engine, EngineConfig, Workflow};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strand-workflow", version, about = "Workflow execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine: queue workers plus the REST/SSE surface
    Serve {
        /// Listen address, overrides STRAND_BIND
        #[arg(long)]
        bind: Option<String>,
        /// Data directory, overrides STRAND_DATA_DIR
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Validate a workflow JSON file and print any violations
    Validate {
        /// Path to the workflow definition
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { bind, data_dir } => serve(bind, data_dir).await,
        Command::Validate { file } => validate(file),
    }
}

async fn serve(bind: Option<String>, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env().context("loading configuration")?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(dir) = data_dir {
        config.server.data_dir = dir.to_string_lossy().into_owned();
    }

    let gateway = Arc::new(
        SledGateway::open(&config.server.data_dir).context("opening state store")?,
    );
    let engine = Arc::new(Engine::new(
        config.clone(),
        gateway,
        HandlerPorts::development(),
    ));
    engine.start_workers().await.context("starting workers")?;

    let app = strand_workflow_engine::api::router(engine);
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    info!(bind = %config.server.bind, "engine listening");
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}

fn validate(file: PathBuf) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let workflow: Workflow = serde_json::from_str(&raw).context("parsing workflow")?;
    match strand_workflow_engine::validation::validate(&workflow) {
        Ok(()) => {
            println!("ok: {} nodes, {} edges", workflow.nodes.len(), workflow.edges.len());
            Ok(())
        }
        Err(violations) => {
            for violation in &violations {
                eprintln!("violation: {}", violation);
            }
            anyhow::bail!("{} violation(s)", violations.len());
        }
    }
}
