//! Lockstep - A replicated lock service with caching clients.
//!
//! Lockstep serves named locks to distributed clients. Clients cache granted
//! locks and hand them between local tasks without server traffic; the server
//! revokes a cached lock only when another client wants it. Lock authority is
//! replicated, with membership views agreed through a Paxos engine and lock
//! state transferable wholesale to a catching-up replica.
//!
//! # Features
//!
//! - **Caching Lock Clients**: a granted lock stays with the client until
//!   revoked, so repeat acquires cost nothing.
//! - **Revoke/Retry Callbacks**: the authority calls subscribers back to move
//!   contended locks and wake refused waiters.
//! - **Paxos-Agreed Views**: each membership view is one consensus instance
//!   decided by a proposer/acceptor pair on every replica.
//! - **Durable Acceptor Log**: promises and decisions are written ahead, so a
//!   restarted acceptor keeps every promise it made.
//! - **State Transfer**: the authority's lock state marshals to bytes for
//!   replica catch-up.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Lockstep                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Clients: Lock Cache | Releaser | Callback Listener         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Lock Authority: Owners | Waiters | Revoker | Retryer       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Consensus: Paxos Proposer | Acceptor | Durable Log         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Replica: View Log | Primary Role | State Transfer          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use lockstep::config::LockstepConfig;
//!
//! #[tokio::main]
//! async fn main() -> lockstep::Result<()> {
//!     // Use development configuration
//!     let config = LockstepConfig::development();
//!
//!     // Start a standalone replica
//!     lockstep::run(config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod lock;
pub mod paxos;
pub mod replica;
pub mod transport;

pub mod cli;
pub mod observability;

// Re-exports
pub use error::{LockstepError, Result};
pub use types::*;

use config::LockstepConfig;
use lock::LockAuthority;
use paxos::{Acceptor, NoFaults, Proposer, RocksWal};
use replica::{ReplicaRole, ViewLog};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use transport::http::{self, HttpAcceptors, HttpCallbacks, ReplicaContext};

/// Run a lockstep replica with the given configuration.
pub async fn run(config: LockstepConfig) -> Result<()> {
    config.validate()?;
    observability::init(&config.observability)?;

    info!(node_id = config.node.id, "Starting lockstep replica");

    std::fs::create_dir_all(&config.node.data_dir)?;

    // Durable consensus state. Replay delivers no upcalls, so the view log
    // is seeded from the acceptor's decided instances afterwards.
    let wal = RocksWal::open(config.node.data_dir.join("paxos"))?;
    let views = Arc::new(ViewLog::new());
    let acceptor = Arc::new(Acceptor::open(
        config.node.id,
        wal,
        Arc::clone(&views),
        Some(&config.consensus.bootstrap_view()),
    )?);
    views.seed(acceptor.decided());

    let role = Arc::new(ReplicaRole::new(config.node.primary));
    let authority = LockAuthority::new(
        Arc::new(HttpCallbacks::new(
            config.lock.connect_timeout,
            config.lock.rpc_timeout,
        )),
        Arc::clone(&role),
    );
    let proposer = Arc::new(Proposer::new(
        config.node.id,
        Arc::clone(&acceptor),
        Arc::new(HttpAcceptors::new(
            config.lock.connect_timeout,
            config.consensus.rpc_timeout,
        )),
        Arc::new(NoFaults),
        config.consensus.rpc_timeout,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    authority.spawn_workers(shutdown_rx.clone());

    let context = ReplicaContext {
        authority,
        acceptor,
        proposer,
        views,
    };
    let (listener, addr) = http::bind(config.node.bind_addr).await?;
    info!(
        node_id = config.node.id,
        addr = %addr,
        primary = role.is_primary(),
        "Replica listening"
    );

    let server = tokio::spawn(http::serve(
        listener,
        http::replica_router(context),
        shutdown_rx.clone(),
    ));

    if config.observability.metrics_enabled {
        let obs_config = config.observability.clone();
        tokio::spawn(async move {
            if let Err(e) = observability::run_metrics_server(obs_config).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down lockstep replica");
    let _ = shutdown_tx.send(true);

    match server.await {
        Ok(result) => result?,
        Err(e) => error!(error = %e, "Server task failed"),
    }

    info!("Lockstep shutdown complete");
    Ok(())
}
