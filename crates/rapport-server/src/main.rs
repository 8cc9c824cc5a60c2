mod config;

use std::sync::Arc;

use tracing::info;

use rapport_api::auth::{AppState, AppStateInner};
use rapport_api::typing::run_sweep_loop;
use rapport_db::Database;
use rapport_gateway::dispatcher::Dispatcher;
use rapport_gateway::signaling::SignalBus;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rapport=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Database::open(&config.db_path)?;
    info!("Database ready at {}", config.db_path.display());

    // Shared state
    let dispatcher = Dispatcher::new(SignalBus::new(config.signal_channel_capacity));
    let state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret: config.jwt_secret.clone(),
        dispatcher,
    });

    if config.typing_sweep_secs > 0 {
        tokio::spawn(run_sweep_loop(state.clone(), config.typing_sweep_secs));
    }

    let app = rapport_api::router(state);

    let addr = config.addr()?;
    info!("Rapport server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
