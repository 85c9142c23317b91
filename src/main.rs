mod bootstrap;

use std::io::stdout;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strata_agent::StartRequest;
use strata_core::types::{Condition, ExecutionId, ExecutionStatus, SessionId, WorkflowGraph};
use strata_gateway::GatewayServer;
use strata_tools::ToolRegistry;

use crate::bootstrap::{Output, Runtime};

#[derive(Parser)]
#[command(
    name = "strata",
    version,
    about = "Checkpointed execution of declared and autonomous task graphs"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "strata.toml", env = "STRATA_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP + WebSocket gateway
    Serve,
    /// Run one execution to completion and print its record
    Run {
        /// Declared graph (JSON)
        #[arg(long, conflicts_with = "goal")]
        graph: Option<PathBuf>,
        /// Goal for an autonomous run
        #[arg(long)]
        goal: Option<String>,
        /// Input payload (JSON)
        #[arg(long)]
        input: Option<PathBuf>,
        /// Session to attribute the run to
        #[arg(long)]
        session: Option<String>,
    },
    /// Check a declared graph against the built-in tools
    Validate {
        /// Graph file (JSON)
        graph: PathBuf,
    },
    /// Show the checkpoint history of an execution
    History {
        execution_id: String,
        /// Only the last N checkpoints
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("strata=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Completions need no config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "strata", &mut stdout());
        return Ok(());
    }

    let config = bootstrap::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let runtime = Runtime::build(config, Output::Gateway)?;
            let server = GatewayServer::new(
                runtime.config.gateway.clone(),
                Arc::clone(&runtime.service),
                Arc::clone(&runtime.connections),
                Arc::clone(&runtime.batcher),
                Arc::clone(&runtime.events),
            );

            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested");
                    ctrl_c.cancel();
                }
            });

            let served = server.run(cancel).await;
            runtime.shutdown().await?;
            served?;
        }
        Commands::Run {
            graph,
            goal,
            input,
            session,
        } => {
            let graph = graph.as_deref().map(read_graph).transpose()?;
            let input = match input {
                Some(path) => read_json(&path)?,
                None => serde_json::Value::Null,
            };
            let request = StartRequest {
                session_id: session
                    .map(|s| SessionId::from_string(&s))
                    .unwrap_or_default(),
                condition: if graph.is_some() {
                    Condition::Declared
                } else {
                    Condition::Autonomous
                },
                graph,
                goal,
                input,
            };

            let runtime = Runtime::build(config, Output::Console)?;
            let service = Arc::clone(&runtime.service);
            let started = service.start(request).await?;
            let id = started.execution_id;
            info!(execution_id = %id, "Execution started");

            let record = tokio::select! {
                record = service.wait(&id) => record?,
                _ = tokio::signal::ctrl_c() => {
                    warn!(execution_id = %id, "Interrupted, cancelling");
                    service.cancel(&id).await?;
                    service.wait(&id).await?
                }
            };
            runtime.shutdown().await?;

            println!("{}", serde_json::to_string_pretty(&record)?);
            if record.status == ExecutionStatus::Failed {
                anyhow::bail!(
                    "execution {} failed: {}",
                    record.id,
                    record.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Validate { graph } => {
            let graph = read_graph(&graph)?;
            let validated = strata_agent::validate(&graph, &ToolRegistry::with_builtins())?;
            println!("Graph OK: {} nodes", validated.len());
            for (i, node) in validated.order.iter().enumerate() {
                let marker = if validated.is_critical(node) { " (critical)" } else { "" };
                println!("  {:>2}. {node}{marker}", i + 1);
            }
        }
        Commands::History {
            execution_id,
            limit,
        } => {
            use strata_core::traits::CheckpointStore;

            let store = bootstrap::open_store(&config)?;
            let id = ExecutionId::from_string(&execution_id);
            match store.load_execution(&id).await? {
                Some(record) => println!(
                    "Execution {} [{}] {}: {} steps, {} checkpoints",
                    record.id,
                    record.condition,
                    record.status,
                    record.steps_completed,
                    record.checkpoints_written
                ),
                None => anyhow::bail!("execution {execution_id} not found"),
            }
            for checkpoint in store.history(&id, limit).await? {
                println!(
                    "  {:>4}  {:<16} {:<20} {}",
                    checkpoint.step,
                    checkpoint.kind.to_string(),
                    checkpoint.node_id.as_deref().unwrap_or("-"),
                    checkpoint.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                );
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        // Handled before config load
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn read_json(path: &Path) -> anyhow::Result<serde_json::Value> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn read_graph(path: &Path) -> anyhow::Result<WorkflowGraph> {
    Ok(serde_json::from_value(read_json(path)?)?)
}
