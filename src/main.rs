use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

use quarry::queue_store::QueueStore;
use quarry::semaphore::TenantSemaphore;
use quarry::server::run_grpc_with_janitor;
use quarry::settings::AppConfig;
use quarry::trace;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Application CLI arguments
struct Args {
    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration before tracing so the log format is honored.
    let cfg = AppConfig::load(args.config.as_deref())?;
    trace::init(cfg.server.log_format);

    // Start the FDB client network thread; the guard must outlive every
    // database handle, so hold it for the whole of main.
    let _network = unsafe { foundationdb::boot() };

    let store = Arc::new(QueueStore::open(cfg.database.cluster_file.as_deref())?);
    let semaphore = Arc::new(TenantSemaphore::open(
        cfg.semaphore_cluster_file(),
        cfg.semaphore.self_hosted,
    )?);

    let addr: SocketAddr = cfg.server.grpc_addr.parse()?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    // Bind first so we can fail fast if the port is unavailable
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(err) => {
            error!(addr = %addr, error = %err, "failed to bind gRPC listener");
            return Err(anyhow::anyhow!(err));
        }
    };

    let server = tokio::spawn(run_grpc_with_janitor(
        listener,
        store,
        semaphore,
        cfg,
        shutdown_rx,
    ));

    // Wait for Ctrl+C, then signal shutdown and wait for the server
    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(());
    server
        .await?
        .map_err(|err| anyhow::anyhow!("server error: {err}"))?;
    Ok(())
}
