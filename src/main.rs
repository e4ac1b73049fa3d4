use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scoot::api::{self, ApiState};
use scoot::client::ApiClient;
use scoot::cluster::{ClusterIngest, ClusterView, Node};
use scoot::config::SchedulerConfig;
use scoot::error::ScootError;
use scoot::saga::{FileSagaLog, InMemorySagaLog, SagaLog};
use scoot::scheduler::{JobDefinition, Scheduler};
use scoot::shutdown::shutdown_token;
use scoot::worker::LocalConnector;

#[derive(Parser, Debug)]
#[command(name = "scoot")]
#[command(about = "Distributed job scheduler for build and test workloads")]
struct Args {
    /// Scheduler API address
    #[arg(long, default_value = "http://127.0.0.1:9090")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler
    Serve {
        /// Address the API listens on
        #[arg(long, default_value = "127.0.0.1:9090")]
        listen: SocketAddr,

        /// Directory for the durable saga log; omit for in-memory
        #[arg(long)]
        saga_dir: Option<PathBuf>,

        /// Comma-separated worker node ids to run locally
        #[arg(long, default_value = "worker-1")]
        workers: String,

        /// Abort the whole job when any task fails
        #[arg(long)]
        strict: bool,
    },
    /// Submit a job definition from a JSON file
    Schedule { file: PathBuf },
    /// Show the status of a job
    Status { job_id: String },
    /// Kill a job
    Kill { job_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Exit codes: 0 success, 1 client error, 2 server error.
fn exit_code(e: &ScootError) -> u8 {
    match e {
        ScootError::InvalidJob(_)
        | ScootError::JobNotFound(_)
        | ScootError::AlreadyTerminal(_) => 1,
        _ => 2,
    }
}

async fn run(args: Args) -> Result<(), ScootError> {
    match args.command {
        Commands::Serve {
            listen,
            saga_dir,
            workers,
            strict,
        } => serve(listen, saga_dir, workers, strict).await,
        Commands::Schedule { file } => {
            let raw = std::fs::read_to_string(&file)?;
            let definition: JobDefinition = serde_json::from_str(&raw)
                .map_err(|e| ScootError::InvalidJob(format!("{}: {}", file.display(), e)))?;
            definition.validate()?;
            let job_id = ApiClient::new(args.addr).schedule(&definition).await?;
            println!("{}", job_id);
            Ok(())
        }
        Commands::Status { job_id } => {
            let report = ApiClient::new(args.addr).status(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Kill { job_id } => {
            ApiClient::new(args.addr).kill(&job_id).await?;
            println!("killed {}", job_id);
            Ok(())
        }
    }
}

async fn serve(
    listen: SocketAddr,
    saga_dir: Option<PathBuf>,
    workers: String,
    strict: bool,
) -> Result<(), ScootError> {
    let mut config = SchedulerConfig {
        listen_addr: listen,
        abort_on_task_failure: strict,
        ..Default::default()
    };
    config.saga_dir = saga_dir;

    let log: Arc<dyn SagaLog> = match &config.saga_dir {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "Using durable saga log");
            Arc::new(FileSagaLog::open(dir)?)
        }
        None => {
            tracing::warn!("No saga directory configured, sagas will not survive restarts");
            Arc::new(InMemorySagaLog::new())
        }
    };

    let nodes: Vec<Node> = workers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|id| Node::new(id, "local"))
        .collect();
    tracing::info!(workers = nodes.len(), "Starting local worker fleet");

    let (cluster, ingest_tx) = ClusterView::spawn(Vec::new());
    ingest_tx
        .send(ClusterIngest::Snapshot(nodes))
        .await
        .map_err(|_| ScootError::Internal("cluster view stopped".to_string()))?;

    let shutdown = shutdown_token();
    let connector = Arc::new(LocalConnector {
        default_timeout: config.default_task_timeout,
        stats_interval: std::time::Duration::from_millis(500),
        shutdown: shutdown.clone(),
    });
    let (scheduler, handle) = Scheduler::new(config.clone(), log, connector);

    let subscription = cluster
        .subscribe()
        .await
        .ok_or_else(|| ScootError::Internal("cluster view stopped".to_string()))?;

    let api_state = ApiState {
        scheduler: handle,
        cluster,
    };
    let api_shutdown = shutdown.clone();
    let api_task = tokio::spawn(api::serve(config.listen_addr, api_state, api_shutdown));

    scheduler.run(subscription, shutdown.clone()).await?;

    shutdown.cancel();
    let _ = api_task.await;
    Ok(())
}
