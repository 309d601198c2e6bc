use auth_gateway::AppResources;
use auth_gateway::api::start_webserver;
use auth_gateway::config::load_config;
use auth_gateway::sweep::spawn_sweep_task;
use color_eyre::eyre::WrapErr;
use sea_orm::Database;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_tracing() {
    let default_directives = "auth_gateway=info,sea_orm=info,tower_http=info";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_level(true);

    registry.with(layer).init();
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown requested");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    initialize_tracing();

    let config = load_config().wrap_err("Failed to load configuration")?;

    let db = Arc::new(
        Database::connect(&config.database_url)
            .await
            .wrap_err("Failed to connect to database")?,
    );

    let shutdown = CancellationToken::new();
    let resources = AppResources::new(db, config, shutdown.clone());
    tracing::info!(
        issuer = %resources.config.issuer(),
        sweep_enabled = resources.config.sweep.enabled,
        rate_limit_enabled = resources.config.rate_limit.enabled,
        "Configuration loaded"
    );

    resources
        .store
        .blacklist()
        .sync_from_database()
        .await
        .wrap_err("Failed to prime token blacklist")?;

    spawn_sweep_task(resources.clone(), shutdown.clone());
    tokio::spawn(shutdown_signal(shutdown.clone()));

    start_webserver(resources, shutdown).await?;
    Ok(())
}
