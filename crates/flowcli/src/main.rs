// crates/flowcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{Block, BlockType, SourceHandle, Workflow};
use flowruntime::{ExecutionOptions, ExecutionResult, FlowRuntime, RuntimeConfig, WorkflowGraph};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON string
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Execute a workflow one layer at a time
    Step {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long)]
        input: Option<String>,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available block handlers
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Run { file, input } => run_workflow(&file, input.as_deref()).await,
        Commands::Step { file, input } => step_workflow(&file, input.as_deref()).await,
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Nodes => {
            list_nodes();
            Ok(())
        }
        Commands::Init { output } => create_example_workflow(&output),
    }
}

fn runtime() -> FlowRuntime {
    FlowRuntime::with_registry(
        Arc::new(flownodes::default_registry()),
        RuntimeConfig::from_env(),
    )
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let workflow: Workflow = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", file.display()))?;
    tracing::debug!(blocks = workflow.blocks.len(), "Loaded workflow {}", workflow.name);
    Ok(workflow)
}

fn parse_input(input: Option<&str>) -> Result<Value> {
    let Some(raw) = input else {
        return Ok(json!({}));
    };
    let value: Value = serde_json::from_str(raw).context("input is not valid JSON")?;
    if !value.is_object() {
        bail!("Input must be a JSON object");
    }
    Ok(value)
}

async fn run_workflow(file: &Path, input: Option<&str>) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let workflow = load_workflow(file)?;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Blocks: {}", workflow.blocks.len());
    println!("   Connections: {}", workflow.connections.len());
    println!();

    let options = ExecutionOptions::new().with_input(parse_input(input)?);
    let result = runtime().execute(&workflow, options).await?;

    report(&result)
}

async fn step_workflow(file: &Path, input: Option<&str>) -> Result<()> {
    let workflow = load_workflow(file)?;
    let rt = runtime();

    let options = ExecutionOptions::new()
        .with_input(parse_input(input)?)
        .debug();
    let mut result = rt.execute(&workflow, options).await?;
    let mut layer = 1;

    while result.metadata.is_debug_session {
        let pending = result.metadata.pending_blocks.clone();
        println!("⏸  Layer {}: {}", layer, pending.join(", "));

        let Some(ctx) = result.metadata.context.take() else {
            bail!("debug session returned without its context");
        };
        result = rt
            .continue_execution(&workflow, ctx, &pending, ExecutionOptions::new())
            .await?;
        layer += 1;
    }

    report(&result)
}

fn report(result: &ExecutionResult) -> Result<()> {
    for log in &result.logs {
        let mark = if log.success { "✅" } else { "❌" };
        println!("{} {} ({} ms)", mark, log.block_id, log.duration_ms);
        if let Some(error) = &log.error {
            println!("   {}", error);
        }
    }
    println!();

    if result.success {
        println!("✅ Workflow completed in {} ms", result.metadata.duration_ms);
        println!("{}", serde_json::to_string_pretty(&result.output)?);
        Ok(())
    } else {
        bail!(
            "workflow failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        )
    }
}

fn validate_workflow(file: &Path) -> Result<()> {
    let workflow = load_workflow(file)?;
    let graph = WorkflowGraph::build(&workflow)?;

    println!("✅ Workflow is valid");
    println!("   Name: {}", workflow.name);
    println!("   Blocks: {}", graph.blocks().count());
    println!("   Loops: {}", workflow.loops.len());
    println!("   Parallels: {}", workflow.parallels.len());
    Ok(())
}

fn list_nodes() {
    println!("📦 Available block handlers:");
    println!();
    for meta in flownodes::default_registry().list() {
        println!("  {:<12} [{}] {}", meta.name, meta.category, meta.description);
    }
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut wf = Workflow::new("Example Workflow");
    wf.description = Some("Branches on the input score".to_string());

    wf.add_block(
        Block::new("start", BlockType::Starter)
            .with_config("input_format", json!([{"name": "score", "type": "number"}])),
    );
    wf.add_block(Block::new("check", BlockType::Condition).with_config(
        "conditions",
        json!([
            {"id": "high", "left": "<start.score>", "operator": ">=", "right": 50},
            {"id": "low"}
        ]),
    ));
    wf.add_block(
        Block::new("pass", BlockType::Function).with_config("output", json!({"grade": "pass"})),
    );
    wf.add_block(
        Block::new("fail", BlockType::Function).with_config("output", json!({"grade": "fail"})),
    );
    wf.add_block(
        Block::new("respond", BlockType::Response)
            .with_config("data", "<check.selectedConditionId>"),
    );

    wf.connect("start", "check");
    wf.connect_handle("check", "pass", SourceHandle::condition("high"));
    wf.connect_handle("check", "fail", SourceHandle::condition("low"));
    wf.connect("pass", "respond");
    wf.connect("fail", "respond");

    std::fs::write(output, serde_json::to_string_pretty(&wf)?)?;
    println!("✅ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  flow run --file {} --input '{{\"score\": 72}}'", output.display());
    Ok(())
}
