//! Stepwise CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Stepwise build pipeline runner", long_about = None)]
struct Cli {
    /// Runner configuration file (defaults to ./stepwise.kdl when present)
    #[arg(long, global = true, env = "STEPWISE_CONFIG")]
    config: Option<PathBuf>,

    /// Queue database file
    #[arg(long, global = true, env = "STEPWISE_DATABASE")]
    database: Option<PathBuf>,

    /// Directory holding job logs and workspaces
    #[arg(long, global = true, env = "STEPWISE_JOBS_ROOT")]
    jobs_root: Option<PathBuf>,

    /// Emit diagnostics as JSON
    #[arg(long, global = true, env = "STEPWISE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job to the queue
    Submit(commands::jobs::SubmitArgs),
    /// Show the state and progress of a job
    Status {
        /// Job ID
        id: String,
        /// Print the job as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the log of a job
    Logs {
        /// Job ID
        id: String,
        /// Keep printing until the job finishes
        #[arg(short, long)]
        follow: bool,
    },
    /// List recent jobs
    List {
        /// Only show jobs in this state (waiting, active, completed, failed)
        #[arg(long)]
        state: Option<String>,
        /// Maximum number of jobs to show
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Run a worker that executes queued jobs
    Worker(commands::worker::WorkerArgs),
    /// Validate a pipeline definition file
    Validate {
        /// Path to the pipeline file
        #[arg(default_value = "pipeline.kdl")]
        path: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Commands::Validate { path } = &cli.command {
        return commands::validate(path);
    }

    let ctx = commands::Context::load(
        cli.config.as_deref(),
        cli.database.clone(),
        cli.jobs_root.clone(),
    )?;

    match cli.command {
        Commands::Submit(args) => {
            commands::jobs::submit(&ctx, args).await?;
        }
        Commands::Status { id, json } => {
            commands::jobs::status(&ctx, &id, json).await?;
        }
        Commands::Logs { id, follow } => {
            commands::jobs::logs(&ctx, &id, follow).await?;
        }
        Commands::List { state, limit } => {
            commands::jobs::list(&ctx, state.as_deref(), limit).await?;
        }
        Commands::Worker(args) => {
            commands::worker::run(ctx, args).await?;
        }
        Commands::Validate { .. } => {}
    }

    Ok(())
}
