//! taskmesh server binary.
//!
//! All construction happens here, in order: logging, configuration,
//! database + migrations, the orchestrator, background loops, then the
//! HTTP listener. No component reaches for global state.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use taskmesh_engine::{EngineConfig, Orchestrator};
use taskmesh_kernel::PoolSampler;
use taskmesh_store::Database;
use taskmesh_web::{serve, AppState, InFlightSampler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env()?;
    tracing::info!(
        environment = %config.environment,
        database = %config.database_path,
        "taskmesh starting"
    );

    let db = Database::open_and_migrate(config.database_path.clone()).await?;

    let in_flight = InFlightSampler::new(256);
    let samplers: Vec<Arc<dyn PoolSampler>> = vec![Arc::clone(&in_flight) as Arc<dyn PoolSampler>];

    let orch = Orchestrator::new(db, config, samplers);
    orch.start_background();

    serve(AppState::new(orch, in_flight)).await
}
