use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use campfire_server::config::CampfireConfig;
use campfire_server::db::pool::{create_pool, run_migrations};
use campfire_server::engine::presence::spawn_presence_sweeper;
use campfire_server::store::MemoryStore;
use campfire_server::web::app_state::AppState;
use campfire_server::web::router::build_router;

#[derive(Debug, Parser)]
#[command(name = "campfire-server", version, about = "Realtime servers, channels and presence")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "campfire.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = CampfireConfig::load(&cli.config).context("failed to load configuration")?;

    let pool = create_pool(&config.database.url)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    let store = Arc::new(
        MemoryStore::open(pool.clone())
            .await
            .context("failed to load store from database")?,
    );

    let cancel = CancellationToken::new();
    let sweeper = spawn_presence_sweeper(
        store.clone(),
        config.presence_ttl(),
        config.sweep_interval(),
        cancel.clone(),
    );

    let app_state = Arc::new(AppState {
        store: store.clone(),
        settings: config.session_settings(),
    });
    let app = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server.web_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.web_address))?;
    info!("Campfire server starting on {}", config.server.web_address);

    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                signal.cancel();
            }
            Err(e) => error!("failed to listen for shutdown signal: {e}"),
        }
    });

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")?;

    cancel.cancel();
    let _ = sweeper.await;
    store.flush().await.context("failed to flush store")?;
    pool.close().await;
    info!("Campfire server stopped");
    Ok(())
}
