use std::sync::Arc;

use dashborg::api::job_routes;
use dashborg::config::EngineConfig;
use dashborg::jobs::{JobEngine, spawn_retention_task};
use dashborg::store::LibSqlBackend;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env();

    eprintln!("DashBorg v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Tool: {}", config.tool);
    eprintln!("   Configs: {}", config.config_dir.display());
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!(
        "   Stats follow-up: {}",
        if config.stats_follow_up {
            "enabled"
        } else {
            "disabled"
        }
    );
    eprintln!("   API: http://0.0.0.0:{}/api/jobs\n", config.port);

    let history = Arc::new(LibSqlBackend::new_local(&config.database_path).await?);

    let port = config.port;
    let (sweep_interval, retention) = (config.sweep_interval, config.retention);
    let engine = Arc::new(JobEngine::new(config, history));

    // Evict finished jobs from memory once they are safely persisted
    let _retention_handle = spawn_retention_task(engine.live_store(), sweep_interval, retention);

    let app = job_routes(engine);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(port, "Job API server started");
    axum::serve(listener, app).await?;

    Ok(())
}
