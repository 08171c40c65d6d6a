use clap::{Parser, Subcommand};
use drover::{
    config::{drover_home, RunnerConfig},
    distributed::{
        broker::Broker,
        records::RecordStore,
        util::{hostname, prepend_hostname},
        worker::{Worker, WorkerSettings},
    },
    gpu::GpuLockManager,
};
use std::{path::PathBuf, process::exit, sync::Arc, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(version)]
#[command(about = "Runs and tracks training jobs on local, Slurm and queue backends")]
struct Args {
    /// Runner config, defaults plus environment overrides if not given
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a worker consuming the distributed job queue
    Worker {
        /// Worker name, the hostname by default
        #[arg(long)]
        name: Option<String>,

        /// Number of jobs run at the same time, overrides the config
        #[arg(long)]
        slots: Option<usize>,
    },

    /// Show the GPU pool of this host and how many devices are free
    Gpus,

    /// Validate the config and exit
    Check,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RunnerConfig::load(path).unwrap_or_log(),
        None => RunnerConfig::from_env(),
    };

    if config.preflight_checks() {
        error!("Config contains errors, aborting");
        exit(1);
    }

    match args.command {
        Commands::Worker { name, slots } => run_worker(&config, name, slots),
        Commands::Gpus => {
            let gpus = GpuLockManager::from_env(&config.lock_dir);
            println!("devices: {}", gpus.devices().join(","));
            println!("free: {}/{}", gpus.num_free(), gpus.devices().len());
        }
        Commands::Check => info!("Config is valid"),
    }
}

fn run_worker(config: &RunnerConfig, name: Option<String>, slots: Option<usize>) {
    let Some(distributed) = &config.distributed else {
        error!("A worker needs a `distributed` config section");
        exit(2);
    };

    let name = name.unwrap_or_else(|| hostname().expect_or_log("Failed to read the hostname"));

    let records_path = match &distributed.worker.records {
        Some(path) => path.clone(),
        None => {
            let mut path = drover_home().join(format!("worker_{name}.db"));
            prepend_hostname(&mut path).unwrap_or_log();
            path
        }
    };

    let broker = Broker::open(&distributed.broker, distributed.poll_interval()).unwrap_or_log();
    let records = RecordStore::open(&records_path).unwrap_or_log();
    let gpus = GpuLockManager::from_env(&config.lock_dir);
    info!(worker = %name, devices = ?gpus.devices(), records = ?records_path, "Starting worker");

    let worker = Worker::new(
        Arc::new(broker),
        Arc::new(records),
        gpus,
        WorkerSettings {
            name,
            slots: slots.unwrap_or(distributed.worker.slots),
            poll_interval: distributed.poll_interval(),
            monitor_interval: Duration::from_millis(distributed.worker.monitor_interval_ms),
            kill_grace: distributed.worker.kill_grace_secs.map(Duration::from_secs),
            interpreter: config.interpreter.clone(),
            scripts_path: config.scripts_path.clone(),
        },
    );

    worker.run().unwrap_or_log();
}
