//! Paxos RPC message definitions.
//!
//! Field declaration order is the wire order; the binary codec relies on it.

use crate::types::{PaxosInstance, ProposalNumber};
use serde::{Deserialize, Serialize};

/// Paxos RPC messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PaxosMessage {
    /// Phase-one reservation of a proposal number.
    Prepare(PrepareRequest),
    /// Response to Prepare.
    PrepareResponse(PrepareResponse),
    /// Phase-two request to accept a value.
    Accept(AcceptRequest),
    /// Response to Accept.
    AcceptResponse(AcceptResponse),
    /// Broadcast of a decided value.
    Decide(DecideRequest),
    /// Response to Decide.
    DecideResponse(DecideResponse),
}

/// Prepare RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// Instance (slot) being agreed on.
    pub instance: PaxosInstance,
    /// Proposal number being reserved.
    pub number: ProposalNumber,
    /// The proposer's candidate value. Carried for wire compatibility;
    /// acceptors decide nothing from it during prepare.
    pub value: String,
}

/// Prepare RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareResponse {
    /// The instance was already decided; `accepted_value` carries the
    /// decided value so a lagging proposer can catch up.
    pub old_instance: bool,
    /// The acceptor promises not to accept proposals below `number`.
    pub accept: bool,
    /// Highest proposal number this acceptor has accepted (zero round if
    /// none). Meaningful when `accept` is true.
    pub accepted_number: ProposalNumber,
    /// Value of the highest accepted proposal, or the decided value when
    /// `old_instance` is true.
    pub accepted_value: String,
}

impl PrepareResponse {
    /// A rejection: no promise, nothing reported.
    pub fn reject() -> Self {
        Self {
            old_instance: false,
            accept: false,
            accepted_number: ProposalNumber::default(),
            accepted_value: String::new(),
        }
    }
}

/// Accept RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptRequest {
    /// Instance (slot) being agreed on.
    pub instance: PaxosInstance,
    /// Proposal number from the prepare phase.
    pub number: ProposalNumber,
    /// Value to accept.
    pub value: String,
}

/// Accept RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptResponse {
    /// True if the acceptor recorded the proposal.
    pub accepted: bool,
}

/// Decide RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecideRequest {
    /// Instance (slot) that was decided.
    pub instance: PaxosInstance,
    /// The decided value.
    pub value: String,
}

/// Decide RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecideResponse {
    /// True if the decision was newly recorded (false for duplicates).
    pub committed: bool,
}
