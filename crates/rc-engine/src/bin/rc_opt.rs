//! rc-opt: soil parameter calibration worker
//!
//! Runs trials of a shared study against the simulator. Any number of
//! workers started with the same configuration and run id cooperate on one
//! study; restarting a worker resumes where the study left off.
//!
//! ```bash
//! rc-opt trial_config.json --n-trials 50
//! HPC=1 SLURM_ARRAY_JOB_ID=1234 SLURM_ARRAY_TASK_ID=3 rc-opt trial_config.json
//! ```

use anyhow::Context;
use clap::Parser;
use rc_engine::{Driver, SimulatorCommand, TrialExecutor, DEFAULT_SIMULATOR};
use rc_optimizer::open_storage;
use rc_types::{RunIdentity, TrialConfiguration};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rc-opt")]
#[command(about = "Calibrate soil parameters against recorded rover telemetry")]
struct Args {
    /// Trial configuration document (JSON)
    config: PathBuf,

    /// Ask the simulator to render each run
    #[arg(short, long)]
    render: bool,

    /// Show simulator output and debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Trials to run in this worker (defaults to optimizer.n_trials)
    #[arg(long)]
    n_trials: Option<usize>,

    /// Resume a specific run instead of deriving the id from the environment
    #[arg(long)]
    run_id: Option<String>,

    /// Simulator executable
    #[arg(long, default_value = DEFAULT_SIMULATOR)]
    simulator: String,

    /// Seed for the sampler's random stream
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let mut config = TrialConfiguration::from_path(&args.config)
        .with_context(|| format!("failed to load configuration {}", args.config.display()))?;
    config.render |= args.render;
    config.verbose |= args.verbose;

    let mut identity = RunIdentity::from_env();
    if let Some(run_id) = args.run_id {
        identity.run_id = run_id;
    }
    info!("Run {} (task {})", identity.run_id, identity.task_id);

    let storage = open_storage(&config.results.storage).context("failed to open study storage")?;
    let executor = TrialExecutor::new(SimulatorCommand::new(args.simulator), identity.clone());
    let n_trials = args.n_trials.unwrap_or(config.optimizer.n_trials);

    let mut driver = Driver::new(config, identity, Arc::from(storage), Box::new(executor));
    if let Some(seed) = args.seed {
        driver = driver.with_seed(seed);
    }

    let summary = driver.run_study(n_trials).await?;
    match &summary.best_trial {
        Some(best) => {
            info!("Best trial {} with value {:?}", best.number, best.value);
            for (name, value) in &best.params {
                info!("    {}: {}", name, value);
            }
        }
        None => info!("No completed trials in study {}", summary.study_name),
    }
    Ok(())
}
