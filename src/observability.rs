//! Logging and metrics setup.

use crate::config::ObservabilityConfig;
use crate::error::{LockstepError, Result};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing. `RUST_LOG` overrides the configured level.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| LockstepError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| LockstepError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    Ok(())
}

/// Run the Prometheus metrics server.
pub async fn run_metrics_server(config: ObservabilityConfig) -> Result<()> {
    let builder = PrometheusBuilder::new();

    let handle = builder
        .install_recorder()
        .map_err(|e| LockstepError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    register_metrics();

    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| LockstepError::Transport(e.to_string()))?;

    Ok(())
}

/// Register the service's counters so they export as zero before first use.
fn register_metrics() {
    // Lock authority
    counter!("lockstep_lock_grants_total").absolute(0);
    counter!("lockstep_lock_retries_total").absolute(0);
    counter!("lockstep_lock_revokes_sent_total").absolute(0);
    counter!("lockstep_lock_retry_callbacks_total").absolute(0);

    // Client cache
    counter!("lockstep_cache_hits_total").absolute(0);
    counter!("lockstep_cache_server_acquires_total").absolute(0);

    // Consensus
    counter!("lockstep_paxos_rounds_total").absolute(0);
    counter!("lockstep_paxos_decided_total").absolute(0);
    counter!("lockstep_paxos_commits_total").absolute(0);
}
