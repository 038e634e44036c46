//! Core type definitions for the lockstep lock service.
//!
//! This module contains the fundamental data types shared by the lock
//! protocol and the consensus engine.
//!
//! # Type Aliases
//!
//! Common identifiers are defined as type aliases for clarity:
//!
//! - [`LockId`] = `u64`: Opaque lock identifier chosen by the application
//! - [`ClientId`] = `u64`: Unique identifier for a client process
//! - [`SequenceId`] = `u64`: Per-(client, lock) acquire-cycle counter
//! - [`NodeId`] = `u64`: Replica node identifier
//! - [`PaxosInstance`] = `u64`: Consensus slot number (first slot is 1)
//!
//! # Key Types
//!
//! - [`ProposalNumber`]: Totally ordered Paxos proposal number
//! - [`LockState`]: Client-side cache state of a single lock
//! - [`Peer`]: A replica node identity plus its network address

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Opaque lock identifier. The service never interprets it.
pub type LockId = u64;

/// Unique identifier for a client process.
pub type ClientId = u64;

/// Per-(client, lock) sequence number, bumped once per acquire cycle.
/// Stale callbacks are detected by comparing against it.
pub type SequenceId = u64;

/// Unique identifier for a replica node in the cluster.
pub type NodeId = u64;

/// Paxos instance (slot) number. Instance 1 carries the initial view.
pub type PaxosInstance = u64;

/// A Paxos proposal number.
///
/// Ordered by round first and proposer identity second, so two distinct
/// proposers can never generate equal numbers. The derive relies on the
/// field declaration order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProposalNumber {
    /// Round counter, strictly increasing per proposer.
    pub round: u64,
    /// Identity of the proposer that generated this number.
    pub node: NodeId,
}

impl ProposalNumber {
    pub fn new(round: u64, node: NodeId) -> Self {
        Self { round, node }
    }

    /// The baseline number an acceptor holds before any promise
    /// (and again after each decided instance).
    pub fn zero(node: NodeId) -> Self {
        Self { round: 0, node }
    }

    /// True once this number belongs to a real proposal. Generated
    /// numbers always have a round of at least 1.
    pub fn is_proposal(&self) -> bool {
        self.round > 0
    }
}

impl std::fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.round, self.node)
    }
}

/// Client-side cache state of a single lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    /// Not cached; the next acquire must go to the server.
    None,
    /// An acquire RPC cycle is in flight.
    Acquiring,
    /// Cached and granted, but no local task holds it.
    Free,
    /// Cached and held by a local task.
    Locked,
    /// A revoke arrived; the lock goes back to the server on release.
    Releasing,
}

impl LockState {
    /// True while an RPC cycle owns the entry and other tasks must wait.
    pub fn is_busy(&self) -> bool {
        matches!(self, LockState::Acquiring | LockState::Releasing)
    }

    /// True when a local task currently holds the lock.
    pub fn is_held(&self) -> bool {
        matches!(self, LockState::Locked | LockState::Releasing)
    }
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockState::None => write!(f, "none"),
            LockState::Acquiring => write!(f, "acquiring"),
            LockState::Free => write!(f, "free"),
            LockState::Locked => write!(f, "locked"),
            LockState::Releasing => write!(f, "releasing"),
        }
    }
}

/// A replica node identity plus the address its HTTP endpoints listen on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    /// `host:port`, without a scheme.
    pub addr: String,
}

impl Peer {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

impl FromStr for Peer {
    type Err = crate::LockstepError;

    /// Parse the `id=host:port` form used in configuration peer lists.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .split_once('=')
            .ok_or_else(|| crate::LockstepError::InvalidPeer(s.to_string()))?;
        let id: NodeId = id
            .trim()
            .parse()
            .map_err(|_| crate::LockstepError::InvalidPeer(s.to_string()))?;
        let addr = addr.trim();
        if addr.is_empty() || !addr.contains(':') {
            return Err(crate::LockstepError::InvalidPeer(s.to_string()));
        }
        Ok(Peer::new(id, addr))
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.id, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proposal_number_ordering() {
        let low = ProposalNumber::new(1, 5);
        let high = ProposalNumber::new(2, 1);
        assert!(high > low);

        // Same round: proposer identity breaks the tie.
        let a = ProposalNumber::new(3, 1);
        let b = ProposalNumber::new(3, 2);
        assert!(b > a);
        assert!(a > ProposalNumber::zero(9));
    }

    #[test]
    fn test_proposal_number_zero_is_not_a_proposal() {
        assert!(!ProposalNumber::zero(4).is_proposal());
        assert!(ProposalNumber::new(1, 4).is_proposal());
    }

    #[test]
    fn test_lock_state_predicates() {
        assert!(LockState::Acquiring.is_busy());
        assert!(LockState::Releasing.is_busy());
        assert!(!LockState::Free.is_busy());

        assert!(LockState::Locked.is_held());
        assert!(LockState::Releasing.is_held());
        assert!(!LockState::None.is_held());
    }

    #[test]
    fn test_peer_parsing() {
        let peer: Peer = "3=10.0.0.7:9090".parse().unwrap();
        assert_eq!(peer.id, 3);
        assert_eq!(peer.addr, "10.0.0.7:9090");
        assert_eq!(peer.to_string(), "3=10.0.0.7:9090");

        assert!("nonsense".parse::<Peer>().is_err());
        assert!("x=1.2.3.4:80".parse::<Peer>().is_err());
        assert!("1=".parse::<Peer>().is_err());
        assert!("1=noport".parse::<Peer>().is_err());
    }
}
