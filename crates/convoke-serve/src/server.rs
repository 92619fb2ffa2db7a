// ABOUTME: TCP server setup and lifecycle for the router
// ABOUTME: Accept loop feeding the router actor, with graceful shutdown on Ctrl+C or SIGTERM

use std::future::Future;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::config::RouterConfig;
use crate::connection::handle_connection;
use crate::router::Router;

/// Run the router until Ctrl+C or SIGTERM.
pub async fn run(config: RouterConfig) -> Result<()> {
    run_until(config, shutdown_signal()).await
}

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn run_until<F>(config: RouterConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    serve(listener, config, shutdown).await
}

/// Serve on an already-bound listener.
pub async fn serve<F>(listener: TcpListener, config: RouterConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let addr = listener.local_addr().context("reading listener address")?;
    info!("Starting router");
    info!("  Listen address: {}", addr);
    info!(
        "  Heartbeat: every {:?}, degraded after {:?}, evicted after {:?}",
        config.heartbeat_interval,
        config.degraded_after(),
        config.evicted_after()
    );

    let (router, actor) = Router::spawn(config);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(stream, peer, router.clone()));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }

    router.shutdown().await;
    actor.await.context("router task failed")?;
    info!("Router shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
