//! Error types for the lockstep lock service.
//!
//! This module provides a unified error type [`LockstepError`] for all
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! Errors are organized into the following categories:
//!
//! - **Lock protocol**: Misuse and state errors on the caching client
//! - **Consensus**: Aborted proposal rounds and replay failures
//! - **Transport**: Connection failures, timeouts, malformed replies
//! - **Storage**: Durable log and serialization errors
//! - **Configuration**: Invalid settings or peer specifications
//!
//! The lock protocol's wire statuses map onto this type as follows:
//! `RETRY` is not an error (it is carried in
//! [`AcquireStatus`](crate::lock::protocol::AcquireStatus) and consumed
//! inside the client cache), transport-level failures surface as [`Transport`] or
//! [`Timeout`] (retryable), and protocol-level failures surface as
//! [`Protocol`] or [`ProposalAborted`] (round aborted, process keeps
//! running).
//!
//! [`Transport`]: LockstepError::Transport
//! [`Timeout`]: LockstepError::Timeout
//! [`Protocol`]: LockstepError::Protocol
//! [`ProposalAborted`]: LockstepError::ProposalAborted
//!
//! # Example
//!
//! ```rust
//! use lockstep::error::{LockstepError, Result};
//!
//! fn handle_error(err: &LockstepError) {
//!     if err.is_retryable() {
//!         println!("Retrying operation...");
//!     } else {
//!         println!("Fatal error: {}", err);
//!     }
//! }
//! ```

use crate::types::{LockId, LockState};
use std::io;
use thiserror::Error;

/// Main error type for lockstep operations.
#[derive(Error, Debug)]
pub enum LockstepError {
    // Lock protocol errors
    #[error("Lock {lock} is not held by this task (state: {state})")]
    NotHeld { lock: LockId, state: LockState },

    #[error("Lock service shut down: {0}")]
    Shutdown(String),

    // Consensus errors
    #[error("Proposal round aborted: {0}")]
    ProposalAborted(String),

    #[error("Consensus replay failed: {0}")]
    ReplayFailed(String),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Invalid peer specification: {0} (expected id=host:port)")]
    InvalidPeer(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LockstepError {
    /// Check if the error is retryable.
    ///
    /// Transport-level failures generally are: the peer may come back, and
    /// every lock and consensus operation is safe to reissue.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockstepError::Transport(_) | LockstepError::Timeout(_) | LockstepError::Shutdown(_)
        )
    }
}

impl From<rocksdb::Error> for LockstepError {
    fn from(e: rocksdb::Error) -> Self {
        LockstepError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for LockstepError {
    fn from(e: bincode::Error) -> Self {
        LockstepError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for LockstepError {
    fn from(e: serde_json::Error) -> Self {
        LockstepError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for LockstepError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LockstepError::Timeout(e.to_string())
        } else {
            LockstepError::Transport(e.to_string())
        }
    }
}

/// Result type alias for lockstep operations.
pub type Result<T> = std::result::Result<T, LockstepError>;
