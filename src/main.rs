use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use agir_core::config::AppConfig;
use agir_core::error::AgirError;
use agir_core::event::EventBus;
use agir_core::process::{ProcessDefinition, LEARNER_ROLE};
use agir_core::traits::{LearnerResponder, Persistence};
use agir_core::types::RunEvent;

use agir_engine::{EvolutionEngine, InteractiveLearner, SimulatedLearner};
use agir_llm::{ProviderKind, ProviderRegistry};
use agir_store::SqliteStore;

#[derive(Parser)]
#[command(name = "agir", version, about = "Run role-based processes with LLM participants")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agir.toml", global = true)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a process definition end to end
    Run {
        /// Process definition (YAML)
        file: PathBuf,
        /// Provider used for every model: auto, openai, anthropic, ollama, dummy, or a preset name
        #[arg(long, default_value = "auto")]
        provider: String,
        /// Answer learner nodes from stdin instead of simulating them
        #[arg(long)]
        interactive: bool,
    },
    /// Parse and validate a process definition without running it
    Validate {
        /// Process definition (YAML)
        file: PathBuf,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "agir=debug,warn" } else { "agir=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            file,
            provider,
            interactive,
        } => run_process(&config, &file, &provider, interactive).await,
        Commands::Validate { file } => validate(&file),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&redacted(&config))?);
            Ok(())
        }
    }
}

/// Explicit path first, then `~/.agir/config.toml`, then built-in defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let path = match dirs_home().map(|h| h.join(".agir").join("config.toml")) {
        Some(home_config) if !path.exists() && home_config.exists() => home_config,
        _ => path.to_path_buf(),
    };
    if path.exists() {
        info!(path = %path.display(), "Loading config");
    } else {
        debug!("No config file found, using defaults");
    }
    Ok(AppConfig::load_or_default(&path)?)
}

fn load_process(file: &Path) -> anyhow::Result<ProcessDefinition> {
    ProcessDefinition::load(file)
        .with_context(|| format!("loading process definition {}", file.display()))
}

async fn run_process(
    config: &AppConfig,
    file: &Path,
    provider: &str,
    interactive: bool,
) -> anyhow::Result<()> {
    let process = load_process(file)?;

    let forced = match provider {
        "auto" => None,
        other => Some(other.parse::<ProviderKind>()?),
    };

    let db_path = config.database_path();
    let store = Arc::new(SqliteStore::open(&db_path)?);
    debug!(path = %db_path.display(), "Database ready");

    for user in &config.users {
        store.upsert_user(&user.to_user()).await?;
    }
    if !config.users.is_empty() {
        info!(count = config.users.len(), "Seeded users from config");
    }

    let registry = Arc::new(ProviderRegistry::new(config).with_forced(forced));
    let learner: Arc<dyn LearnerResponder> = if interactive {
        Arc::new(InteractiveLearner::stdio())
    } else {
        Arc::new(SimulatedLearner::new())
    };

    let event_bus = Arc::new(EventBus::default());
    let engine = EvolutionEngine::new(store, registry, learner)
        .with_config(config.engine.clone())
        .with_event_bus(event_bus.clone());

    let mut rx = event_bus.subscribe();
    let print_handle = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                RunEvent::RunStarted { instance_id, process } => {
                    eprintln!("[{}] instance {}", process, instance_id);
                }
                RunEvent::NodeStarted { node, role, model } => {
                    eprintln!("\n[{} as {} via {}]", node, role, model);
                }
                RunEvent::NodeCompleted { role, text, .. } => {
                    if !(interactive && role == LEARNER_ROLE) {
                        println!("{}: {}", role, text);
                    }
                }
                RunEvent::StepPersistFailed { node, error } => {
                    eprintln!("[warning] step for {} not saved: {}", node, error);
                }
                RunEvent::ReflectionSaved { field, .. } => {
                    eprintln!("[reflection saved as {}]", field);
                }
                RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. } => {}
            }
        }
    });

    let outcome = engine.run(&process).await;

    // Closing the bus lets the printer drain and exit.
    drop(engine);
    drop(event_bus);
    print_handle.await.ok();

    let result = outcome?;
    println!(
        "\nProcess '{}' completed: {} steps in {} ms (instance {})",
        process.name(),
        result.history.len(),
        result.elapsed_ms,
        result.instance_id
    );
    if let Some(reflection) = result.reflection {
        println!("\n=== Reflection ===\n{}", reflection);
    }
    Ok(())
}

fn validate(file: &Path) -> anyhow::Result<()> {
    let process = load_process(file)?;

    println!("Process: {}", process.name());
    if !process.description().is_empty() {
        println!("  {}", process.description());
    }
    println!("Learner: {}", process.learner().username);
    println!("Roles: {}", process.roles().len());
    println!("Nodes:");
    for node in process.nodes() {
        let served_by = if node.is_learner() {
            match &node.assigned_to {
                Some(user) => format!("learner (user {})", user),
                None => "learner".to_string(),
            }
        } else {
            let model = process
                .role(&node.role_id)
                .and_then(|r| r.model.as_deref())
                .unwrap_or("no model");
            format!("{} ({})", process.acting_as(node), model)
        };
        let next: Vec<&str> = process.outgoing(node).map(|t| t.to.as_str()).collect();
        if next.is_empty() {
            println!("  - {} [{}]", node.name, served_by);
        } else {
            println!("  - {} [{}] -> {}", node.name, served_by, next.join(", "));
        }
    }
    if let Some(evolution) = process.evolution() {
        println!("Evolution: {}", evolution.method);
    }
    println!("OK");
    Ok(())
}

/// Config with secrets masked for display.
fn redacted(config: &AppConfig) -> AppConfig {
    let mut shown = config.clone();
    for provider in shown.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some("***".to_string());
        }
    }
    shown
}

fn report(e: &anyhow::Error) {
    match e.chain().find_map(|c| c.downcast_ref::<AgirError>()) {
        Some(AgirError::Execution { node, message }) => {
            eprintln!("error [execution] at node '{}': {}", node, message);
        }
        Some(AgirError::Configuration { node, role }) => {
            eprintln!(
                "error [configuration] at node '{}': no model configured for role '{}'",
                node, role
            );
        }
        Some(AgirError::ProviderUnavailable {
            node,
            model,
            message,
        }) => {
            eprintln!(
                "error [configuration] at node '{}': provider for model '{}' unavailable: {}",
                node, model, message
            );
        }
        Some(AgirError::LoopDetected { node, limit }) => {
            eprintln!(
                "error [loop] at node '{}': more than {} steps, the process graph likely cycles",
                node, limit
            );
        }
        Some(agir) => {
            eprintln!("error [{:?}]: {:#}", agir.kind(), e);
        }
        None => eprintln!("error: {:#}", e),
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_prefers_explicit_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"[engine]\nmax_steps = 7\n").unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.engine.max_steps, 7);
    }

    #[test]
    fn test_load_config_rejects_malformed_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"[engine\n").unwrap();
        let err = load_config(tmp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgirError>(),
            Some(AgirError::Config(_))
        ));
    }
}
