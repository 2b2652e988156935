//! Migrator binary.
//!
//! `migrator run` starts the controller: plan or resume a job, spawn the
//! worker pool, monitor to completion. `migrator worker <job_id> <index>`
//! is the entry point the controller spawns for each pool member; it is not
//! normally invoked by hand.

use anyhow::Context;
use tracing::error;
use uuid::Uuid;

use migrator_core::config::MigratorConfig;
use migrator_core::controller::MigrationController;
use migrator_core::logging;
use migrator_core::worker;

fn usage() -> ! {
    eprintln!("usage: migrator run");
    eprintln!("       migrator worker <job_id> <pool_index>");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("run") => run_controller().await,
        Some("worker") => {
            if args.len() != 3 {
                usage();
            }
            let job_id: Uuid = args[1].parse().context("invalid job id")?;
            let pool_index: usize = args[2].parse().context("invalid pool index")?;
            run_worker(job_id, pool_index).await
        }
        _ => usage(),
    };

    if let Err(err) = &result {
        error!(error = %err, "migrator exited with error");
    }
    result
}

async fn run_controller() -> anyhow::Result<()> {
    let config = MigratorConfig::load()?;
    let shutdown = migrator_core::signals::shutdown_listener()
        .context("failed to install signal handlers")?;

    let mut controller = MigrationController::new(config, shutdown);
    controller.run().await?;
    Ok(())
}

async fn run_worker(job_id: Uuid, pool_index: usize) -> anyhow::Result<()> {
    let config = MigratorConfig::load()?;
    worker::run_worker_process(job_id, pool_index, &config).await?;
    Ok(())
}
