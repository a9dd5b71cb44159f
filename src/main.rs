use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pulse::config::SyncConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "pulse")]
#[command(version, about = "Live sync client for AI build-pipeline dashboards")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// REST API base URL (falls back to PULSE_API_BASE)
    #[arg(long, global = true)]
    pub api_base: Option<String>,

    /// Explicit push-channel base URL (falls back to PULSE_WS_BASE)
    #[arg(long, global = true)]
    pub ws_base: Option<String>,

    /// Auth token (falls back to PULSE_TOKEN)
    #[arg(long, global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Follow a job live: progress, agent dialogue, and ticket changes
    Watch { job_id: String },
    /// One-shot snapshot of a job with projected progress
    Status { job_id: String },
    /// Send an operator chat message to a collecting job
    Send { job_id: String, message: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "pulse=debug" } else { "pulse=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = SyncConfig::resolve(cli.api_base, cli.ws_base, cli.token)?;

    match cli.command {
        Commands::Watch { job_id } => cmd::watch(&cfg, &job_id).await,
        Commands::Status { job_id } => cmd::status(&cfg, &job_id).await,
        Commands::Send { job_id, message } => cmd::send(&cfg, &job_id, &message).await,
    }
}
