#![forbid(unsafe_code)]

//! tube-relay entry point: wire configuration, caches and the resolver
//! together, then serve until Ctrl+C.

use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tube_relay::config::Config;
use tube_relay::cookies;
use tube_relay::server::{AppState, build_router};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Root would survive most misconfigurations that should fail loudly.
    if Uid::current().is_root() {
        bail!("tube-relay must not run as root; use a dedicated service account");
    }

    let config = Config::from_env();
    let cookies_file = cookies::init(config.cookies.as_deref());

    let state = AppState::build(&config, cookies_file)?;
    state.spawn_background_tasks();
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        port = config.port,
        proxy_configured = config.proxy_url.is_some(),
        pot_provider_configured = config.pot_provider_url.is_some(),
        "tube-relay listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;
    Ok(())
}

async fn shutdown_signal() {
    // Shutdown still happens if the handler fails to install; it is just no
    // longer graceful.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {err}");
    }
}
