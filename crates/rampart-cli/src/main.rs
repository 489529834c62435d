//! rampart — operator CLI for progressive delivery rollouts.
//!
//! Validates rollout plans and manages the persisted rollout records that
//! the orchestrator drives.
//!
//! # Usage
//!
//! ```text
//! rampart validate --plan canary.toml
//! rampart --data-dir /var/lib/rampart start --plan canary.toml
//! rampart status
//! rampart history --id api-green-1700000000
//! rampart abort --id api-green-1700000000 --reason "latency regression"
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "rampart",
    about = "Rampart — progressive delivery controller",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Directory holding the rollout store.
    #[arg(long, global = true, default_value = "./rampart-data")]
    data_dir: PathBuf,

    /// Controller config (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a rollout plan without storing anything
    Validate {
        #[arg(short, long)]
        plan: PathBuf,
    },
    /// Create a pending rollout from a plan
    Start {
        #[arg(short, long)]
        plan: PathBuf,
        /// Rollout id (default: `<candidate>-<unix seconds>`)
        #[arg(long)]
        id: Option<String>,
    },
    /// Show one rollout, or all of them
    Status {
        #[arg(long)]
        id: Option<String>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Show the transition log of a rollout
    History {
        #[arg(long)]
        id: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Request an operator rollback. Traffic is restored on the next tick.
    Abort {
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "operator abort")]
        reason: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let ctx = commands::Context::load(cli.data_dir, cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { plan } => commands::plan::validate(&ctx, &plan),
        Commands::Start { plan, id } => commands::plan::start(&ctx, &plan, id.as_deref()),
        Commands::Status { id, format } => commands::inspect::status(&ctx, id.as_deref(), &format),
        Commands::History { id, format } => commands::inspect::history(&ctx, &id, &format),
        Commands::Abort { id, reason } => commands::abort::abort(&ctx, &id, &reason),
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("warn,rampart=info"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
