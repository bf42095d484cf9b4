// relay: connects to the upstream live-timing hub and fans feeds out to
// push-socket subscribers through the two-tier cache.

use relay::cache::CacheTier;
use relay::coordinator::Coordinator;
use relay::health::HealthReporter;
use relay::hub::SubscriberHub;
use relay::socket::AppState;
use relay::upstream::UpstreamClient;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "relay starting");

    let cfg = match std::env::args().nth(1) {
        Some(path) => relay::config::load_config_from_path(std::path::Path::new(&path)),
        None => relay::config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => {
            info!(
                upstream = %cfg.upstream.url,
                hub = %cfg.upstream.hub_name,
                bind = %cfg.hub.bind,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // L2 is best-effort from the start: a dead endpoint at boot leaves the
    // tier in failover and the health check brings it back later.
    let l2 = match &cfg.cache.l2_url {
        Some(url) => match relay::cache::l2::RedisStore::connect(url).await {
            Ok(store) => {
                info!(url = %url, "L2 connected");
                Some(Arc::new(store) as Arc<dyn relay::cache::l2::L2Store>)
            }
            Err(e) => {
                error!(error = %e, "L2 unavailable at startup; running memory-only");
                None
            }
        },
        None => None,
    };
    let cache = Arc::new(CacheTier::new(&cfg.cache, l2));
    tokio::spawn(
        cache
            .clone()
            .run_maintenance(cfg.health.check_interval, shutdown_rx.clone()),
    );

    let hub = Arc::new(SubscriberHub::new(cfg.hub.clone(), cache.clone()));
    tokio::spawn(hub.clone().run_heartbeat_loop(shutdown_rx.clone()));

    let (upstream_client, upstream_handle, frames_rx, state_rx) =
        UpstreamClient::new(cfg.upstream.clone());
    let upstream_task = tokio::spawn(async move {
        if let Err(e) = upstream_client.run().await {
            error!(error = %e, "upstream client terminated");
        }
    });

    let coordinator = Arc::new(Coordinator::new(
        cache.clone(),
        hub.clone(),
        upstream_handle.clone(),
    ));
    tokio::spawn(
        coordinator
            .clone()
            .run(frames_rx, state_rx.clone(), shutdown_rx.clone()),
    );

    let health = Arc::new(HealthReporter::new(state_rx, cache, hub.clone()));
    let router = relay::socket::build_router(AppState { hub, health });
    let listener = match tokio::net::TcpListener::bind(&cfg.hub.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {e}", cfg.hub.bind);
            std::process::exit(1);
        }
    };
    info!(addr = %cfg.hub.bind, "push socket listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap_or_else(|e| error!(error = %e, "server error"));

    // Propagate shutdown to every component task.
    let _ = shutdown_tx.send(true);
    upstream_handle.stop();
    let _ = upstream_task.await;
    info!("relay shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
