//! Process entry point: loads configuration, wires the coordinator, and
//! runs the HTTP and DNS listeners side by side until shutdown. Shutdown
//! follows a signal-then-grace-period pattern, reusing the coordinator's
//! own `tokio::sync::watch` shutdown signal (see `konsul_core::coordinator`'s
//! header) rather than standing up a second, redundant broadcast channel.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer, web};
use clap::Parser;
use konsul_config::{Cli, KonsulConfig};
use konsul_core::Coordinator;
use tracing::info;

use konsul_server::auth::TokenStore;
use konsul_server::dns::{DnsServer, DnsServerConfig};
use konsul_server::http;
use konsul_server::logging;
use konsul_server::rate_limit_middleware::RateLimitMiddleware;
use konsul_server::state::AppState;
use konsul_server::watch::ClientWatchLimiter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = KonsulConfig::load(&cli).map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let _logging_guard = logging::init(&logging::LoggingConfig::from_app_config(&config.data_dir))?;
    info!(listen_addr = %config.listen_addr, dns_port = config.dns_port, "starting konsul");

    let data_dir = config.persistence_enabled.then(|| Path::new(&config.data_dir));
    let mut coordinator = Coordinator::new(
        data_dir,
        Duration::from_secs(config.service_ttl_secs),
        config.watch.buffer_size,
    )
    .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    if config.acl.enabled {
        if let Err(e) = coordinator.acl.load_dir(Path::new(&config.acl.policy_dir)) {
            tracing::warn!("failed to load ACL policies from {}: {e}", config.acl.policy_dir);
        }
    }

    let coordinator = Arc::new(coordinator);
    coordinator.start_sweeper(Duration::from_secs(config.cleanup_interval_secs));

    let dns_server = DnsServer::new(
        DnsServerConfig {
            bind_address: "0.0.0.0".to_string(),
            port: config.dns_port,
            domain: config.dns_domain.clone(),
        },
        coordinator.clone(),
    );
    dns_server.start().await?;

    let state = web::Data::new(AppState {
        coordinator: coordinator.clone(),
        config: Arc::new(config.clone()),
        tokens: Arc::new(TokenStore::new()),
        watch_limiter: Arc::new(ClientWatchLimiter::new()),
    });

    let listen_addr = config.listen_addr.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(RateLimitMiddleware)
            .configure(http::configure)
    })
    .bind(&listen_addr)?
    .run();

    let server_handle = server.handle();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, stopping HTTP listener");
        server_handle.stop(true).await;
    });

    server.await?;
    coordinator.shutdown(SHUTDOWN_GRACE).await;
    info!("konsul stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
