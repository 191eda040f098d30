mod api;
mod auth;
mod config;
mod debrid;
mod models;
mod poller;
mod state;
mod store;
mod ui;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::debrid::DebridClient;
use crate::poller::FeedPoller;
use crate::state::{AppState, SessionAuth};
use crate::store::{AuthStore, SeenStore, SettingsStore};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::load());

    let auth = Arc::new(AuthStore::open(config.auth_store_path())?);
    if auth
        .ensure_user(&config.username, &config.default_password)
        .await?
    {
        warn!(
            "created default account \"{}\"; change the password after signing in",
            config.username
        );
    }

    let settings = Arc::new(SettingsStore::open(config.settings_store_path())?);
    let seen = Arc::new(SeenStore::open(config.seen_store_path())?);
    if settings.rd_api_key().await.trim().is_empty() {
        warn!("no Real-Debrid API key configured; feeds are not polled until one is saved");
    }

    let debrid = Arc::new(DebridClient::new(&config, settings.clone()));
    let poller = Arc::new(FeedPoller::new(
        config.clone(),
        settings.clone(),
        seen.clone(),
        debrid.clone(),
    ));
    let _poll_task = poller.clone().spawn();

    let state = Arc::new(AppState {
        config: config.clone(),
        auth,
        settings,
        seen,
        debrid,
        poller,
        session: SessionAuth::from_config(&config),
    });

    let app = api::router(state);

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("rdgrab listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
