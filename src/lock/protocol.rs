//! Wire types for the caching lock protocol.
//!
//! Clients send `acquire`/`release`/`subscribe` to the authority; the
//! authority calls back with `revoke` and `retry`. Field order is the wire
//! order.

use crate::types::{ClientId, LockId, SequenceId};
use serde::{Deserialize, Serialize};

/// Outcome of an acquire RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquireStatus {
    /// The lock is now owned by the caller.
    Granted,
    /// The lock is held elsewhere; wait for a retry callback and resend.
    Retry,
}

/// Acquire RPC arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireRequest {
    /// Requesting client.
    pub client: ClientId,
    /// Lock being requested.
    pub lock: LockId,
    /// Client-side sequence number for this acquire cycle.
    pub seq: SequenceId,
}

/// Acquire RPC reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireResponse {
    pub status: AcquireStatus,
}

/// Release RPC arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub client: ClientId,
    pub lock: LockId,
    /// Sequence number of the acquire cycle being released.
    pub seq: SequenceId,
}

/// Registers a client's callback endpoint with the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub client: ClientId,
    /// Address the authority dials for revoke/retry callbacks.
    pub callback_addr: String,
}

/// Server-to-client demand to give a cached lock back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeRequest {
    pub lock: LockId,
    /// Sequence number of the acquire the revoke applies to.
    pub seq: SequenceId,
}

/// Server-to-client hint that a previously refused acquire may now succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRequest {
    pub lock: LockId,
    /// Sequence number of the acquire the retry applies to.
    pub seq: SequenceId,
}

/// Plain acknowledgement for one-way style RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_wire_shape() {
        let req = AcquireRequest {
            client: 7,
            lock: 42,
            seq: 3,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["client"], 7);
        assert_eq!(json["lock"], 42);
        assert_eq!(json["seq"], 3);

        let back: AcquireRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [AcquireStatus::Granted, AcquireStatus::Retry] {
            let encoded = serde_json::to_string(&status).unwrap();
            let decoded: AcquireStatus = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, status);
        }
    }
}
