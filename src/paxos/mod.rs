//! Paxos consensus for the replicated lock authority.
//!
//! Each configuration instance is one Paxos agreement: a proposer drives
//! prepare, accept, and decide against the acceptors of the current view,
//! and decided values reach the replica layer through [`CommitHandler`].
//! Acceptor state is durable; a restarted node replays its log and keeps
//! every promise it made before the crash.

// Deny unsafe code patterns in this critical consensus module.
// unwrap() calls can cause panics that break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod acceptor;
pub mod messages;
mod proposer;
pub mod storage;

pub use acceptor::Acceptor;
pub use messages::{
    AcceptRequest, AcceptResponse, DecideRequest, DecideResponse, PaxosMessage, PrepareRequest,
    PrepareResponse,
};
pub use proposer::Proposer;
pub use storage::{MemWal, RocksWal, WalRecord, WalStore};

use crate::types::PaxosInstance;

/// Receives decided instances. The replica layer implements this to grow
/// its view log as consensus commits configuration values.
pub trait CommitHandler: Send + Sync {
    fn committed(&self, instance: PaxosInstance, value: &str);
}

/// Points in a proposal round where a test may inject a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Between the prepare and accept phases.
    AfterPrepare,
    /// Between the accept and decide phases.
    AfterAccept,
}

/// Hook the proposer consults between phases. Tests install an
/// implementation that reports a crash to abort the round mid-flight;
/// production uses [`NoFaults`].
pub trait FaultInjector: Send + Sync {
    fn crashed(&self, point: CrashPoint) -> bool {
        let _ = point;
        false
    }
}

/// The production injector: never crashes.
pub struct NoFaults;

impl FaultInjector for NoFaults {}

/// Smallest count that constitutes a majority of `total` nodes.
pub fn majority(total: usize) -> usize {
    total / 2 + 1
}
