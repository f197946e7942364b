//! Portway bridge binary.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use portway_bridge::config::BridgeConfig;
use portway_bridge::pool::WorkerPool;
use portway_bridge::poller::{run_stale_reaper, PollDriver};
use portway_bridge::processor::JobProcessor;
use portway_bridge::registry::ConnectionRegistry;
use portway_bridge::server::{JobIntake, TcpServer};
use portway_bridge::transform::{Base64Transformer, PayloadTransformer};
use portway_bridge::upstream::UpstreamClient;
use portway_store::{JobRepository, StoreConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("portway_bridge=info".parse()?),
        )
        .init();

    info!("Portway bridge starting");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "bridge.toml".to_owned());
    let config = BridgeConfig::load_from(&config_path)?;

    info!(
        bind_address = %config.server.bind_address(),
        upstream = %config.api.base_url,
        pool_size = config.worker.pool_size,
        "Configuration loaded"
    );

    // The claim-eligibility ceiling reuses the upstream retry count, as in
    // the original deployment.
    let store_config = StoreConfig {
        url: config.database.connection_string.clone(),
        max_connections: config.database.max_open_conns,
        min_connections: config.database.max_idle_conns,
        conn_max_lifetime: config.database.conn_max_lifetime,
        table_name: config.database.table_name.clone(),
        response_table: config.database.response_table.clone(),
        max_job_retries: config.api.max_retries as i32,
    };

    let repo = JobRepository::connect(&store_config).await?;
    repo.ensure_schema().await?;
    info!(
        max_open_conns = config.database.max_open_conns,
        table = %config.database.table_name,
        "Database connection established"
    );

    let registry = Arc::new(ConnectionRegistry::new());
    let transformer: Arc<dyn PayloadTransformer> = Arc::new(Base64Transformer::new());
    let upstream = UpstreamClient::new(&config.api)?;

    if let Err(e) = upstream.health_check().await {
        warn!(error = %e, "upstream health check failed at startup");
    }

    let processor = Arc::new(JobProcessor::new(
        repo.clone(),
        upstream,
        transformer,
        Arc::clone(&registry),
        config.worker.process_timeout,
    ));

    let pool = WorkerPool::start(config.worker.pool_size, config.worker.queue_size, processor);
    let abort = pool.abort_token();

    let accept_cancel = CancellationToken::new();
    let poll_cancel = CancellationToken::new();
    let reaper_cancel = CancellationToken::new();

    let intake: Arc<dyn JobIntake> = Arc::new(repo.clone());
    let server = TcpServer::bind(config.server.clone(), Arc::clone(&registry), intake).await?;

    let server_handle = {
        let cancel = accept_cancel.clone();
        tokio::spawn(server.run(cancel))
    };

    // Claim at most what the queue can hold per tick.
    let driver = PollDriver::new(
        repo.clone(),
        pool.handle(),
        config.worker.queue_size as i64,
        config.database.poll_interval,
    );
    let poller_handle = {
        let cancel = poll_cancel.clone();
        tokio::spawn(driver.run(cancel))
    };

    let reaper_handle = {
        let cancel = reaper_cancel.clone();
        tokio::spawn(run_stale_reaper(
            repo.clone(),
            config.worker.process_timeout,
            cancel,
        ))
    };

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown");

    // A second signal aborts in-flight jobs instead of waiting out the drain.
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Second shutdown signal, aborting in-flight jobs");
        abort.cancel();
    });

    // Shutdown flows top-down: stop accepting, stop claiming, drain the
    // pool, then close the remaining sockets.
    accept_cancel.cancel();
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "TCP server error"),
        Err(e) => error!(error = %e, "TCP server task panicked"),
    }

    poll_cancel.cancel();
    let _ = poller_handle.await;

    reaper_cancel.cancel();
    let _ = reaper_handle.await;

    pool.shutdown().await;
    registry.close_all();

    info!("Portway bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C");
        }
        () = terminate => {
            info!("Received SIGTERM");
        }
    }
}
