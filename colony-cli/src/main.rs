use clap::{Args, Parser, Subcommand};
use colony_core::{ConfigError, Profile, WorkerId};
use colony_env::{EnvError, JsonlTrailStore, SimulationConfig, SimulationMode};
use colony_mesh::MeshError;
use colony_node::{
    AllocationPolicy, CircuitBreakerConfig, MasterConfig, MasterNode, NodeError, RetryPolicy,
    WorkerConfig, WorkerNode, cancel_on_signal, shutdown_signal,
};
use colony_observability::{LogFormat, ObservabilityError, init_tracing};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod demo;

#[derive(Parser, Debug)]
#[command(name = "colony", version)]
#[command(about = "Colony - distributed multi-agent simulation runtime")]
struct Cli {
    /// Log output: json, pretty or compact
    #[arg(long, global = true, env = "COLONY_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the master: wait for workers, allocate the demo population, simulate
    Master(MasterArgs),
    /// Run a worker that hosts agents for a master
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
struct MasterArgs {
    /// Interface to listen on
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// `round` or `timed:<interval>`, e.g. `timed:500ms`
    #[arg(long)]
    mode: Option<SimulationMode>,
    #[arg(long)]
    max_steps: Option<u64>,
    /// Quiet period that ends a round, e.g. `2s`
    #[arg(long, value_parser = humantime::parse_duration)]
    idle_timeout: Option<Duration>,
    /// Workers to wait for before allocating
    #[arg(long, default_value_t = 1)]
    workers: usize,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    worker_wait: Duration,
    /// Size of the demo population
    #[arg(long, default_value_t = 4)]
    agents: usize,
    /// `round-robin` or `least-loaded`
    #[arg(long, default_value = "round-robin")]
    policy: AllocationPolicy,
    /// Append the trail to this JSON-lines file instead of keeping it in memory
    #[arg(long)]
    trail: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[arg(long, env = "COLONY_WORKER_ID")]
    worker_id: String,
    #[arg(long, env = "COLONY_MASTER_URL", default_value = "http://127.0.0.1:50051")]
    master_url: String,
    /// Interface to listen on; also advertised unless --advertise-host is set
    #[arg(long, env = "COLONY_WORKER_HOST")]
    host: Option<String>,
    #[arg(long, env = "COLONY_WORKER_ADVERTISE_HOST")]
    advertise_host: Option<String>,
    /// 0 picks a free port
    #[arg(long, env = "COLONY_WORKER_PORT", default_value_t = 0)]
    port: u16,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Observability(#[from] ObservabilityError),

    #[error("Invalid worker id '{id}': {message}")]
    WorkerId { id: String, message: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.log_format) {
        eprintln!("{err}");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Master(args) => run_master(args).await,
            Commands::Worker(args) => run_worker(args).await,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "colony exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run_master(args: MasterArgs) -> Result<(), CliError> {
    let mut config = MasterConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_host = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let population = demo::population(args.agents)?;
    let mut simulation = SimulationConfig::from_env()?
        .with_termination_set(population.iter().map(|c| c.agent_id.clone()));
    if let Some(mode) = args.mode {
        simulation = simulation.with_mode(mode);
    }
    if let Some(max_steps) = args.max_steps {
        simulation = simulation.with_max_steps(max_steps);
    }
    if let Some(idle) = args.idle_timeout {
        simulation = simulation.with_idle_timeout(idle);
    }

    let mut profile = Profile::new();
    profile.update("score", json!(0));
    let mut builder = MasterNode::builder(config, simulation)
        .policy(args.policy)
        .env_profile(profile);
    if let Some(path) = &args.trail {
        builder = builder.trail_store(Arc::new(JsonlTrailStore::open(path).await?));
    }
    let master = builder.build()?;

    let listener = master.bind().await?;
    let server = master.spawn(listener);
    {
        let master = master.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            master.shutdown("interrupted").await;
        });
    }

    master
        .wait_for_workers(args.workers, args.worker_wait)
        .await?;
    let allocation = master.allocate(population).await?;
    for failure in &allocation.failures {
        warn!(agent_id = %failure.agent_id, error = %failure.error, "Agent not allocated");
    }

    let report = master.run_simulation().await?;
    let score = master.env().get_data("score").await;
    info!(
        final_state = %report.final_state,
        steps = report.steps_completed,
        run_ms = report.run_ms,
        paused_ms = report.paused_ms,
        events = report.events_dispatched,
        score = ?score,
        "Simulation finished"
    );
    match serde_json::to_string_pretty(&report) {
        Ok(text) => println!("{text}"),
        Err(err) => warn!(error = %err, "Failed to render report"),
    }

    master.shutdown("simulation finished").await;
    match server.await {
        Ok(result) => result?,
        Err(err) => warn!(error = %err, "Master server task failed"),
    }
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), CliError> {
    let worker_id = WorkerId::parse(&args.worker_id).map_err(|e| CliError::WorkerId {
        id: args.worker_id.clone(),
        message: e.to_string(),
    })?;

    let mut config = WorkerConfig::new(worker_id, args.master_url).with_port(args.port);
    if let Some(host) = args.host {
        config.bind_host = host.clone();
        config.advertise_host = host;
    }
    if let Some(host) = args.advertise_host {
        config.advertise_host = host;
    }
    config.retry = RetryPolicy::from_env()?;
    config.breaker = CircuitBreakerConfig::from_env()?;

    let worker = WorkerNode::new(config, Arc::new(demo::agent_types()))?;
    let listener = worker.bind().await?;
    cancel_on_signal(worker.cancellation());
    worker.serve(listener).await?;
    Ok(())
}
