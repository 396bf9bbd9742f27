// crates/pipecli/src/main.rs

mod interaction;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use interaction::StdioInteraction;
use pipecore::{DataMap, ExecutionEvent, ExecutionState, PipelineFile};
use pipehandlers::OpenAiGenerator;
use piperuntime::{HandlerRegistry, PipeRuntime, RuntimeConfig};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipe")]
#[command(about = "Pipeline Engine CLI", long_about = None)]
struct Cli {
    /// Log filter, e.g. "info" or "piperuntime=debug"
    #[arg(long, env = "PIPE_LOG", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline file
    Run {
        /// Path to pipeline JSON file
        #[arg(short, long, env = "PIPE_FILE")]
        file: PathBuf,

        /// Initial text input
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read the initial text input from a file
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Default model for generation nodes
        #[arg(long, env = "MODEL_NAME", default_value = "gpt-4o-mini")]
        model: String,

        /// OpenAI-compatible endpoint
        #[arg(long, env = "MODEL_BASE_URL", default_value = "https://api.openai.com/v1")]
        base_url: String,

        #[arg(long, env = "MODEL_API_KEY", default_value = "", hide_env_values = true)]
        api_key: String,

        /// Worker pool size
        #[arg(long, env = "MAX_WORKERS", default_value_t = 8)]
        max_workers: usize,

        /// JSON object merged over the file's config
        #[arg(long)]
        global_config: Option<String>,

        /// Serve socket nodes over stdin/stdout
        #[arg(long)]
        socket_stdio: bool,

        /// Message sent before a socket node waits for input
        #[arg(long, default_value = "Waiting for input (session {session_id})")]
        announce: String,
    },

    /// Validate a pipeline file and print its layers
    Validate {
        /// Path to pipeline JSON file
        #[arg(short, long, env = "PIPE_FILE")]
        file: PathBuf,
    },

    /// List registered handler names
    Handlers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            file,
            input,
            input_file,
            model,
            base_url,
            api_key,
            max_workers,
            global_config,
            socket_stdio,
            announce,
        } => {
            let input = match (input, input_file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read input file {}", path.display()))?,
                (None, None) => String::new(),
            };
            let options = RunOptions {
                model,
                base_url,
                api_key,
                max_workers,
                global_config,
                socket_stdio,
                announce,
            };
            run_pipeline(file, input, options).await?;
        }

        Commands::Validate { file } => {
            validate_pipeline(file)?;
        }

        Commands::Handlers => {
            list_handlers();
        }
    }

    Ok(())
}

struct RunOptions {
    model: String,
    base_url: String,
    api_key: String,
    max_workers: usize,
    global_config: Option<String>,
    socket_stdio: bool,
    announce: String,
}

fn default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    pipehandlers::register_all(&mut registry);
    registry
}

fn load_pipeline(file: &Path) -> Result<PipelineFile> {
    PipelineFile::load(file).with_context(|| format!("Failed to load pipeline {}", file.display()))
}

async fn run_pipeline(file: PathBuf, input: String, options: RunOptions) -> Result<()> {
    println!("🚀 Loading pipeline from: {}", file.display());
    let pipeline = load_pipeline(&file)?;
    println!("   Nodes: {}", pipeline.nodes.len());
    println!();

    let mut config = Value::Object(pipeline.config);
    if let Some(overlay) = options.global_config {
        let overlay: Value =
            serde_json::from_str(&overlay).context("--global-config must be valid JSON")?;
        if !overlay.is_object() {
            anyhow::bail!("--global-config must be a JSON object");
        }
        merge_json(&mut config, overlay);
    }
    let global_config: DataMap = match config {
        Value::Object(map) => map,
        _ => DataMap::new(),
    };

    let generator = OpenAiGenerator::new(options.base_url, options.model)
        .with_api_key(options.api_key)
        .with_options(&global_config);

    let runtime_config = RuntimeConfig {
        max_workers: options.max_workers,
        announce_message: options.announce,
        ..RuntimeConfig::default()
    };
    let mut runtime = PipeRuntime::with_config(Arc::new(default_registry()), runtime_config)
        .with_generator(Arc::new(generator))
        .with_global_config(global_config);
    if options.socket_stdio {
        runtime = runtime.with_interaction(Arc::new(StdioInteraction::new()));
    }

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::RunStarted { session_id, node_count, .. } => {
                    println!("▶️  Session {} started ({} nodes)", session_id, node_count);
                }
                ExecutionEvent::GraphStarted { graph_id, iteration_path, .. } => {
                    println!("  🔁 Graph {} at {:?}", graph_id, iteration_path);
                }
                ExecutionEvent::NodeStarted { node_id, .. } => {
                    println!("  ⚡ Starting node: {}", node_id);
                }
                ExecutionEvent::NodeFinished { node_id, state, error, duration_ms, .. } => match state {
                    ExecutionState::Completed => {
                        println!("  ✅ Node {} completed in {}ms", node_id, duration_ms);
                    }
                    ExecutionState::ErrorIgnored => {
                        println!(
                            "  ⚠️  Node {} failed (ignored): {}",
                            node_id,
                            error.unwrap_or_default()
                        );
                    }
                    _ => {
                        println!("  ❌ Node {} failed: {}", node_id, error.unwrap_or_default());
                    }
                },
                ExecutionEvent::RunAborted { failed, .. } => {
                    println!("  🛑 Aborting, failed node(s): {}", failed.join(", "));
                }
                ExecutionEvent::RunCompleted { success, duration_ms, .. } => {
                    if success {
                        println!("✨ Pipeline completed successfully in {}ms", duration_ms);
                    } else {
                        println!("💥 Pipeline failed after {}ms", duration_ms);
                    }
                }
            }
        }
    });

    let result = runtime.run(pipeline.nodes, input).await;

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    let result = result?;
    println!();
    println!("📊 Execution Summary:");
    println!("   Session ID: {}", result.session_id);
    for node in &result.nodes {
        println!("   Node {}: {}", node.node_id, node.state);
        if let Some(record) = &node.record {
            if !record.output_data.is_empty() {
                println!("{}", serde_json::to_string_pretty(&record.output_data)?);
            } else if !record.text.is_empty() {
                println!("{}", record.text);
            }
        }
    }

    Ok(())
}

fn validate_pipeline(file: PathBuf) -> Result<()> {
    println!("🔍 Validating pipeline: {}", file.display());

    let pipeline = load_pipeline(&file)?;
    let runtime = PipeRuntime::new(Arc::new(default_registry()));
    let graph = runtime.validate(&pipeline.nodes)?;

    println!("✅ Pipeline is valid:");
    for graph_id in graph.graph_ids() {
        if let Some(plan) = graph.get(graph_id) {
            println!("   Graph {} ({} nodes)", graph_id, plan.node_count());
            for (index, layer) in plan.layers().iter().enumerate() {
                println!("     Layer {}: {}", index, layer.join(", "));
            }
        }
    }

    Ok(())
}

fn list_handlers() {
    println!("📦 Registered Handlers:");
    println!();

    let registry = default_registry();
    for prefix in registry.prefixes() {
        println!("  Backend {}", prefix);
    }
    println!();
    for name in registry.registered_names() {
        println!("  • {}", name);
    }
}

/// Recursively merge `overlay` into `base`; objects merge key by key, any
/// other value replaces.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_json_is_deep() {
        let mut base = json!({ "llm_config": { "temperature": 0.1, "top_p": 1 }, "name": "a" });
        merge_json(&mut base, json!({ "llm_config": { "temperature": 0.7 }, "extra": true }));

        assert_eq!(
            base,
            json!({ "llm_config": { "temperature": 0.7, "top_p": 1 }, "name": "a", "extra": true })
        );
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["pipe", "run", "--file", "p.json", "--input", "hi", "--max-workers", "2"])
            .unwrap();
        match cli.command {
            Commands::Run { input, max_workers, .. } => {
                assert_eq!(input.as_deref(), Some("hi"));
                assert_eq!(max_workers, 2);
            }
            _ => panic!("expected run"),
        }
    }
}
