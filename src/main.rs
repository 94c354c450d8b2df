use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use league_server::config::{generate_config_template, Config};
use league_server::jobs::{self, JobContext};
use league_server::predict::CarryForwardPredictor;
use league_server::routes;
use league_server::state::AppState;
use league_server::store::memory::MemoryStore;
use league_server::ws::maintenance;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "league_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "league_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("league server v{} starting", env!("CARGO_PKG_VERSION"));

    // Registries, broadcast engine and task runner
    let state = AppState::build(&config.realtime, &config.tasks);

    // External collaborators. The in-memory store and the carry-forward
    // predictor stand in until real persistence and model backends are
    // attached at this seam.
    let store = Arc::new(MemoryStore::new());
    let predictor = Arc::new(CarryForwardPredictor);
    jobs::register_default_jobs(
        &state.runner,
        JobContext {
            store,
            predictor,
            broadcaster: state.broadcaster.clone(),
        },
    )?;

    // Spawn the maintenance loops and the scheduler
    let maintenance_token = CancellationToken::new();
    tokio::spawn(maintenance::stale_sweep_loop(
        state.connections.clone(),
        state.topics.clone(),
        config.realtime.clone(),
        maintenance_token.clone(),
    ));
    tokio::spawn(maintenance::stats_heartbeat_loop(
        state.topics.clone(),
        state.broadcaster.clone(),
        config.realtime.clone(),
        maintenance_token.clone(),
    ));
    tokio::spawn({
        let runner = state.runner.clone();
        async move { runner.run().await }
    });

    // Build router, bind and serve
    let app = routes::build_router(state.clone());
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop taking new maintenance iterations, then drain task executions.
    // In-flight broadcasts finish before their loop observes the cancel.
    maintenance_token.cancel();
    state.runner.shutdown().await;
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
