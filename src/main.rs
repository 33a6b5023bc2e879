use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use executor_dispatch::config::{parse_queue_limits, DispatchConfig, VersionGate};
use executor_dispatch::server::Server;
use executor_dispatch::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "executor-dispatch")]
#[command(version)]
#[command(about = "Hands queued jobs to polling executors over HTTP")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the dispatch server on in-memory queues
    Server(ServerArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the executor routes to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "3189")]
    port: u16,

    /// Queues to serve, as "name:limit:weight" (comma-separated)
    /// Example: "codeintel:250:1,batches:50:4"
    #[arg(long, default_value = "codeintel:250:1,batches:50:4")]
    queues: String,

    /// Width of the multi-queue dequeue rate-limit window in seconds
    #[arg(long, default_value = "120")]
    dequeue_window_secs: u64,

    /// How often expired dequeue-cache entries are pruned, in seconds
    #[arg(long, default_value = "5")]
    cleanup_interval_secs: u64,

    /// Requeue processing records after this many seconds without a heartbeat
    #[arg(long, default_value = "60")]
    stalled_after_secs: u64,

    /// Minimum executor version that receives v2 job payloads
    #[arg(long, default_value = executor_dispatch::config::DEFAULT_MIN_VERSION)]
    min_version: String,
}

impl ServerArgs {
    fn into_config(self) -> Result<DispatchConfig, Box<dyn std::error::Error>> {
        let listen_addr: SocketAddr = format!("{}:{}", self.host, self.port).parse()?;
        let queues = parse_queue_limits(&self.queues)?;
        if queues.is_empty() {
            return Err("at least one queue must be configured".into());
        }

        let mut config = DispatchConfig::new(listen_addr);
        config.multiqueue.queues = queues;
        config.multiqueue.window = Duration::from_secs(self.dequeue_window_secs);
        config.multiqueue.cleanup_interval = Duration::from_secs(self.cleanup_interval_secs.max(1));
        config.stalled_after = Duration::from_secs(self.stalled_after_secs);
        config.version_gate = VersionGate::with_min_version(self.min_version)?;
        Ok(config)
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.into_config()?;
    tracing::info!(
        addr = %config.listen_addr,
        queues = ?config.multiqueue.queues,
        window_secs = config.multiqueue.window.as_secs(),
        min_version = %config.version_gate.min_version,
        "Starting executor dispatch server"
    );

    let shutdown = install_shutdown_handler();
    Server::new(config).run(shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
    }
    Ok(())
}
