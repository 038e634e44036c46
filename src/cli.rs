//! Command-line interface for lockstep.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Lockstep - A replicated lock service with caching clients.
#[derive(Parser)]
#[command(name = "lockstep")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "LOCKSTEP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOCKSTEP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start a lockstep replica
    Serve {
        /// Node ID
        #[arg(short, long, env = "LOCKSTEP_NODE_ID", default_value_t = 1)]
        node_id: u64,

        /// Bind address for the replica's HTTP endpoints
        #[arg(long, default_value = "0.0.0.0:7800")]
        bind_addr: String,

        /// Acceptor peer addresses (format: id=addr,id=addr)
        #[arg(long)]
        peers: Option<String>,

        /// Data directory for the durable consensus log
        #[arg(long, default_value = "/var/lib/lockstep")]
        data_dir: PathBuf,

        /// Start as backup (default is primary)
        #[arg(long)]
        backup: bool,
    },

    /// Show a replica's health, lock statistics, and current view
    Status {
        /// Replica address
        #[arg(short, long, default_value = "127.0.0.1:7800")]
        addr: String,
    },

    /// Put a membership view up for agreement
    ProposeView {
        /// Replica address
        #[arg(short, long, default_value = "127.0.0.1:7800")]
        addr: String,

        /// The view to propose (format: id=addr,id=addr)
        view: String,
    },

    /// Show version information
    Version,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
