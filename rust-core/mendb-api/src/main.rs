// SPDX-License-Identifier: PMPL-1.0-or-later
//! MendDB service binary
//!
//! Runs the detector and fixer loops against the in-memory repository and
//! serves the status API until Ctrl-C.

use std::sync::Arc;

use mendb_api::{MendConfig, Orchestrator};
use mendb_store::{InMemoryRepository, MetricsRepository};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = MendConfig::load()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let store = match &config.seed {
        Some(path) => {
            tracing::info!(seed = %path.display(), "Seeding in-memory repository");
            InMemoryRepository::load_json_file(path).await?
        }
        None => InMemoryRepository::new(),
    };
    let repository = Arc::new(MetricsRepository::new(store));

    let mut orchestrator = Orchestrator::new(repository.clone(), &config)?;
    orchestrator.start()?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };
    mendb_api::serve(orchestrator.app_state(), &config.server, shutdown).await?;

    let snapshot = orchestrator.shutdown().await?;
    let stats = repository.stats().await;
    tracing::info!(
        detected = snapshot.statistics.detected,
        fixed = snapshot.statistics.fixed,
        failed = snapshot.statistics.failed,
        repository_reads = stats.reads,
        repository_writes = stats.writes,
        repository_failures = stats.failures,
        "MendDB stopped"
    );

    Ok(())
}
