use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use payment_tracker as api;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Build the configured store (connects and migrates for the database backend)
    let store = api::store::build_store(&cfg).await.map_err(|e| {
        error!("Failed to initialise payment store: {}", e);
        e
    })?;

    if cfg.stripe_secret_key.trim().is_empty() {
        warn!("No Stripe secret key configured; gateway calls will be rejected by Stripe");
    }
    if cfg.stripe_webhook_secret.is_none() {
        warn!("No Stripe webhook secret configured; webhooks will be refused");
    }
    let gateway = Arc::new(api::gateway::StripeGateway::from_config(&cfg)?);

    // Compose shared app state
    let app_state = api::AppState::new(store, gateway, cfg.clone());
    let app = api::app_router(app_state);

    let host: std::net::IpAddr = cfg
        .host
        .parse()
        .with_context(|| format!("invalid host address '{}'", cfg.host))?;
    let addr = SocketAddr::from((host, cfg.port));
    info!(
        environment = %cfg.environment,
        store = %cfg.store_backend,
        "payment-tracker listening on http://{}",
        addr
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
