use std::io::stdout;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use graphflow_core::config::EngineConfig;
use graphflow_core::execution::ExecutionRequest;
use graphflow_core::graph::GraphDefinition;
use graphflow_core::security::CallerIdentity;
use graphflow_core::traits::ExecutionStore;
use graphflow_core::validation::ValidationResult;
use graphflow_engine::{GraphEngine, InMemoryExecutionStore};
use graphflow_nodes::{EchoModel, KeywordIndex, RetrieverRegistry};
use graphflow_store::SqliteExecutionStore;

#[derive(Parser)]
#[command(
    name = "graphflow",
    version,
    about = "Validate and run declarative LLM workflow graphs"
)]
struct Cli {
    /// Config file path. Defaults to ~/.graphflow/config.toml when present.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all validation layers against a graph without executing it
    Validate {
        /// Graph definition (JSON)
        graph: PathBuf,
        /// Caller identity the security and resource layers evaluate
        #[arg(long, default_value = "anonymous")]
        caller: String,
        /// Caller role
        #[arg(long)]
        role: Option<String>,
    },
    /// Execute a graph offline with the echo model
    Run {
        /// Graph definition (JSON)
        graph: PathBuf,
        /// Input variable as key=value; values parse as JSON, else as text
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Keyword index as name=dir; every file in dir becomes a document
        #[arg(long = "index", value_name = "NAME=DIR")]
        indexes: Vec<String>,
        /// Include history, log and variables in the result
        #[arg(long)]
        debug: bool,
        #[arg(long, default_value = "anonymous")]
        caller: String,
        #[arg(long)]
        role: Option<String>,
        /// Keep execution records in memory instead of the SQLite store
        #[arg(long)]
        ephemeral: bool,
    },
    /// Show recently stored executions
    History {
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("graphflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Completions need no config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "graphflow", &mut stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate {
            graph,
            caller,
            role,
        } => {
            let graph = GraphDefinition::load(&graph)
                .with_context(|| format!("loading graph {}", graph.display()))?;
            let engine = GraphEngine::offline(config);
            let report = engine.validate(&graph, &identity(caller, role)).await;
            print_report(&report);
            if !report.is_valid() {
                std::process::exit(1);
            }
        }
        Commands::Run {
            graph,
            inputs,
            indexes,
            debug,
            caller,
            role,
            ephemeral,
        } => {
            let graph = GraphDefinition::load(&graph)
                .with_context(|| format!("loading graph {}", graph.display()))?;
            let mut request = ExecutionRequest::default().with_debug(debug);
            for pair in &inputs {
                let (key, value) = parse_input(pair)?;
                request = request.with_input(key, value);
            }

            let store = open_store(&config, ephemeral);
            let engine = GraphEngine::new(config, Arc::new(EchoModel), store)
                .with_retrievers(load_indexes(&indexes)?);

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Cancelling execution...");
                cancel_clone.cancel();
            });

            let result = engine
                .execute(request, &graph, &identity(caller, role), cancel)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Commands::History { limit } => {
            let store = SqliteExecutionStore::open(&config.store.resolved_path())?;
            let records = store.list_recent(limit).await?;
            if records.is_empty() {
                println!("No executions recorded.");
            }
            for record in records {
                println!(
                    "{}  {:<10} {:<24} {} node(s)  {}",
                    record.started_at.format("%Y-%m-%d %H:%M:%S"),
                    record.status.as_str(),
                    record.source_id.as_deref().unwrap_or("-"),
                    record.history.len(),
                    record.execution_id,
                );
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}

/// Explicit path must exist; the default path is optional.
fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    if let Some(path) = path {
        return EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()));
    }
    let default = EngineConfig::default_path();
    if default.exists() {
        info!(path = %default.display(), "Loading config");
        Ok(EngineConfig::load(&default)?)
    } else {
        Ok(EngineConfig::default())
    }
}

fn open_store(config: &EngineConfig, ephemeral: bool) -> Arc<dyn ExecutionStore> {
    if ephemeral {
        return Arc::new(InMemoryExecutionStore::new());
    }
    let path = config.store.resolved_path();
    match SqliteExecutionStore::open(&path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Execution store unavailable, using memory");
            Arc::new(InMemoryExecutionStore::new())
        }
    }
}

fn identity(caller: String, role: Option<String>) -> CallerIdentity {
    let identity = CallerIdentity::new(caller);
    match role {
        Some(role) => identity.with_role(role),
        None => identity,
    }
}

fn parse_input(pair: &str) -> anyhow::Result<(String, Value)> {
    let Some((key, raw)) = pair.split_once('=') else {
        bail!("input must be KEY=VALUE, got '{}'", pair);
    };
    if key.is_empty() {
        bail!("input key is empty in '{}'", pair);
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn load_indexes(entries: &[String]) -> anyhow::Result<RetrieverRegistry> {
    let mut registry = RetrieverRegistry::new();
    for entry in entries {
        let Some((name, dir)) = entry.split_once('=') else {
            bail!("index must be NAME=DIR, got '{}'", entry);
        };
        let mut index = KeywordIndex::new();
        for file in std::fs::read_dir(dir).with_context(|| format!("reading index dir {}", dir))? {
            let path = file?.path();
            if !path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let id = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            index.add(id, content, Value::Null);
        }
        info!(index = %name, documents = index.len(), "Loaded keyword index");
        registry.register(name, Arc::new(index));
    }
    Ok(registry)
}

fn print_report(report: &ValidationResult) {
    for layer in &report.layers {
        let status = if layer.is_ok() { "ok" } else { "FAILED" };
        println!("{:<11} {}", layer.layer.as_str(), status);
        for issue in &layer.errors {
            println!("  error   {}", issue);
        }
        for issue in &layer.warnings {
            println!("  warning {}", issue);
        }
    }
    if report.is_valid() {
        println!("\nGraph is valid.");
    } else {
        println!("\nGraph is invalid ({} error(s)).", report.errors().count());
    }
}
