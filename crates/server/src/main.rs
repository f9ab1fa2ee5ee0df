use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "cascade")]
#[command(about = "Workflow orchestration engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "cascade.toml")]
    config: PathBuf,

    /// Data directory for execution history
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Run a workflow file once and exit instead of serving
    #[arg(long)]
    run: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cascade=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting Cascade");
    tracing::info!("Data directory: {}", args.data_dir.display());

    // Load configuration
    let config = ServerConfig::load(&args.config, args.data_dir)?;

    if let Some(workflow_path) = args.run {
        return run_once(&config, &workflow_path).await;
    }

    // Start API server
    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, config).await?;

    Ok(())
}

/// One-shot manual trigger: execute a workflow file through the full
/// pipeline, print the execution, exit non-zero if the run failed.
async fn run_once(config: &ServerConfig, workflow_path: &PathBuf) -> Result<()> {
    use cascade_core::types::ExecutionStatus;
    use cascade_core::workflow::load_workflow_file;

    let state = config::AppState::new(config).await?;
    let workflow = load_workflow_file(workflow_path)?;
    let execution = state
        .engine
        .run_workflow(&workflow, Default::default())
        .await?;

    println!("{}", serde_json::to_string_pretty(&execution)?);
    if execution.status == ExecutionStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}
