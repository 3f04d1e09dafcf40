//! Worker command.

use anyhow::{Result, bail};
use clap::Args;
use std::sync::Arc;
use stepwise_executor::{ShellExecutor, Workspaces};
use stepwise_scheduler::{JobOutcome, PipelineRunner, Worker, WorkerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Context;

#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Jobs to run at the same time
    #[arg(long, env = "STEPWISE_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Identity recorded on claimed jobs
    #[arg(long, env = "STEPWISE_WORKER_ID")]
    worker_id: Option<String>,

    /// Process queued jobs one by one and exit once the queue is empty
    #[arg(long)]
    drain: bool,
}

pub async fn run(ctx: Context, args: WorkerArgs) -> Result<()> {
    let mut config = ctx.config.clone();
    if let Some(concurrency) = args.concurrency {
        if concurrency == 0 {
            bail!("--concurrency must be at least 1");
        }
        config.concurrency = concurrency;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker_id = worker_id;
    }

    let queue = Arc::new(ctx.open_queue().await?);
    let runner = Arc::new(PipelineRunner::new(
        Arc::new(ShellExecutor::new(config.shell.clone())),
        queue.clone(),
        Workspaces::new(&config.jobs_root),
        config.git_host.clone(),
    ));
    let worker = Worker::new(
        WorkerConfig {
            worker_id: config.worker_id.clone(),
            concurrency: config.concurrency,
            poll_interval: config.poll_interval,
            lease: config.lease,
            heartbeat_interval: config.lease / 3,
            ..WorkerConfig::default()
        },
        queue.clone(),
        runner,
        ctx.logs(),
    );

    info!(
        worker_id = %config.worker_id,
        lease_secs = config.lease.as_secs(),
        database = %config.database.display(),
        jobs_root = %config.jobs_root.display(),
        shell = %config.shell,
        "Worker configured"
    );

    if args.drain {
        worker.recover_stalled().await?;
        while let Some((id, outcome)) = worker.run_once().await? {
            match outcome {
                JobOutcome::Completed => println!("{} completed", id),
                JobOutcome::Retrying { reason } => println!("{} requeued: {}", id, reason),
                JobOutcome::Failed { reason } => println!("{} failed: {}", id, reason),
            }
        }
        queue.close().await;
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, finishing in-flight jobs");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    worker.run(shutdown).await?;
    queue.close().await;
    Ok(())
}
