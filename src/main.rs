use std::process::ExitCode;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use todo_api::config::Config;
use todo_api::{app, AppState, Database};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("unable to start server: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;
    info!(database = %config.database_path.display(), "starting todo-api");

    let db = Database::connect(&config.database_path)?;
    info!("database connection established");

    if config.environment.is_production() {
        info!("production mode, skipping schema sync");
    } else {
        db.migrate().context("creating schema")?;
        info!("database tables synchronized");
    }

    if config.seed_demo {
        let inserted = db.seed_demo().context("seeding demo todos")?;
        info!(inserted, "demo todos seeded");
    }

    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("server is running on http://{addr}");

    axum::serve(listener, app(AppState::new(db)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}
