use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use vision_db::Database;
use vision_server::build_app;
use vision_server::cleanup;
use vision_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vision=debug,tower_http=debug".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {:#}", e);
            eprintln!("       Set it in your .env file and restart.");
            std::process::exit(1);
        }
    };

    let db = Arc::new(Database::open(&config.db_path)?);
    let (app, dispatcher) = build_app(&config, db.clone());

    // Background upkeep: idle presence and expired tombstones
    let idle_sweep = dispatcher.spawn_idle_sweep();
    let purge = tokio::spawn(cleanup::run_purge_loop(
        db,
        config.restore_window,
        config.purge_interval,
    ));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Vision server listening on {}", addr);
    info!(
        "Auth timeout {:?}, presence grace {:?}, restore window {} hours",
        config.gateway.auth_timeout,
        config.gateway.presence_grace,
        config.restore_window.num_hours()
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_dispatcher = dispatcher.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open sockets keep the server alive; close them first.
            shutdown_dispatcher.shutdown().await;
        })
        .await?;

    idle_sweep.abort();
    purge.abort();
    info!("Vision server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Could not install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
