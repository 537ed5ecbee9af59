use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use trellis_core::config::{home_dir, AppConfig};
use trellis_core::traits::CheckpointStore;
use trellis_core::types::{GraphDefinition, Variables};
use trellis_core::{EngineEvent, ExecutionRecord};
use trellis_engine::{compile, WorkflowEngine};

#[derive(Parser)]
#[command(name = "trellis", version, about = "Graph-based task orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph file without running it
    Validate {
        /// Graph definition (.json or .toml)
        file: PathBuf,
    },
    /// Run a graph file to completion
    Run {
        /// Graph definition (.json or .toml)
        file: PathBuf,
        /// Initial variable as key=value (value parsed as JSON, else string)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, serde_json::Value)>,
        /// Permission granted to capabilities (repeatable)
        #[arg(long = "permission")]
        permissions: Vec<String>,
    },
    /// Resume a paused or interrupted run from its last checkpoint
    Resume {
        /// Graph definition the run was started from
        file: PathBuf,
        /// Execution id
        execution_id: String,
    },
    /// List registered capabilities
    Capabilities,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TRELLIS_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("trellis=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "trellis", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { file } => {
            let definition = load_graph(&file)?;
            let compiled = compile(&definition)?;
            println!(
                "{}: ok ({} nodes, {} edges, entry {})",
                file.display(),
                definition.nodes.len(),
                definition.edges.len(),
                compiled.entry()
            );
        }
        Commands::Run {
            file,
            vars,
            permissions,
        } => {
            let engine = WorkflowEngine::from_config(config)?;
            let graph = engine.create_graph_from(load_graph(&file)?)?;
            let variables: Variables = vars.into_iter().collect();
            let permissions = (!permissions.is_empty()).then_some(permissions);

            let printer = spawn_event_printer(&engine);
            let handle = engine.start_execution(&graph.id, variables, permissions)?;
            info!(execution_id = %handle.execution_id(), "Execution started");

            let execution_id = handle.execution_id().to_string();
            let record = tokio::select! {
                record = handle.wait() => record?,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("\n[cancelling {}]", execution_id);
                    engine.cancel_execution(&execution_id);
                    wait_for_stop(&engine, &execution_id).await?
                }
            };
            printer.abort();
            print_record(&record)?;
        }
        Commands::Resume { file, execution_id } => {
            let engine = WorkflowEngine::from_config(config)?;
            let state = engine
                .checkpoints()
                .load(&execution_id)
                .with_context(|| format!("No checkpoint for execution {}", execution_id))?;
            let mut definition = load_graph(&file)?;
            definition.id = state.graph_id.clone();
            engine.create_graph_from(definition)?;

            let printer = spawn_event_printer(&engine);
            let record = engine.resume_execution(&execution_id).await?;
            printer.abort();
            print_record(&record)?;
        }
        Commands::Capabilities => {
            let engine = WorkflowEngine::from_config(config)?;
            for cap in engine.list_capabilities().await {
                let perms = if cap.required_permissions.is_empty() {
                    String::new()
                } else {
                    format!(" [requires: {}]", cap.required_permissions.join(", "))
                };
                println!("{:<16} {:?}  {}{}", cap.name, cap.kind, cap.description, perms);
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = home_dir().map(|h| h.join(".trellis").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    Ok(AppConfig::default())
}

/// Read a graph definition. `.toml` files are parsed as TOML, anything else as JSON.
fn load_graph(path: &Path) -> anyhow::Result<GraphDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read graph file {}", path.display()))?;
    let definition: GraphDefinition = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("Invalid TOML graph {}", path.display()))?,
        _ => serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON graph {}", path.display()))?,
    };
    Ok(definition)
}

fn parse_var(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{}`", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in `{}`", raw));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn spawn_event_printer(engine: &WorkflowEngine) -> tokio::task::JoinHandle<()> {
    let mut rx = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                EngineEvent::RunStarted {
                    execution_id,
                    graph_id,
                } => eprintln!("[run {} started on graph {}]", execution_id, graph_id),
                EngineEvent::NodeStarted { node_id, kind, .. } => {
                    eprintln!("[node: {} ({})]", node_id, kind)
                }
                EngineEvent::NodeFinished {
                    node_id,
                    succeeded,
                    elapsed_ms,
                    ..
                } => {
                    let status = if succeeded { "ok" } else { "ERROR" };
                    eprintln!("[{}: {}] {}ms", node_id, status, elapsed_ms);
                }
                EngineEvent::CheckpointSaved { .. } => {}
                EngineEvent::RunFinished { status, .. } => eprintln!("[run {}]", status),
            }
        }
    })
}

/// After a cancel request, poll until the runner has recorded the stop.
async fn wait_for_stop(engine: &WorkflowEngine, execution_id: &str) -> anyhow::Result<ExecutionRecord> {
    loop {
        let record = engine.get_execution(execution_id)?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

fn print_record(record: &ExecutionRecord) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}
