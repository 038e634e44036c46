//! RPC transport traits.
//!
//! Each service gets its own client trait: the lock cache dials the
//! authority, the authority dials client callback endpoints, and the
//! proposer dials peer acceptors. HTTP implementations live in
//! [`http`]; tests swap in the in-memory mocks.

pub mod http;

use crate::error::Result;
use crate::lock::protocol::{
    Ack, AcquireRequest, AcquireResponse, ReleaseRequest, RetryRequest, RevokeRequest,
    SubscribeRequest,
};
use crate::paxos::messages::{
    AcceptRequest, AcceptResponse, DecideRequest, DecideResponse, PrepareRequest, PrepareResponse,
};
use crate::types::Peer;

/// Client-to-authority lock RPCs. The target address is fixed at
/// construction time.
#[async_trait::async_trait]
pub trait AuthorityTransport: Send + Sync {
    /// Request lock ownership.
    async fn acquire(&self, request: AcquireRequest) -> Result<AcquireResponse>;

    /// Give lock ownership back.
    async fn release(&self, request: ReleaseRequest) -> Result<Ack>;

    /// Register the caller's callback endpoint.
    async fn subscribe(&self, request: SubscribeRequest) -> Result<Ack>;
}

/// Authority-to-client callback RPCs, dialed per subscriber address.
#[async_trait::async_trait]
pub trait CallbackTransport: Send + Sync {
    /// Demand a cached lock back from its holder.
    async fn revoke(&self, addr: &str, request: RevokeRequest) -> Result<Ack>;

    /// Tell a waiting client its acquire may now succeed.
    async fn retry(&self, addr: &str, request: RetryRequest) -> Result<Ack>;
}

/// Proposer-to-acceptor consensus RPCs, dialed per view member.
#[async_trait::async_trait]
pub trait AcceptorTransport: Send + Sync {
    /// Phase one.
    async fn prepare(&self, peer: &Peer, request: PrepareRequest) -> Result<PrepareResponse>;

    /// Phase two.
    async fn accept(&self, peer: &Peer, request: AcceptRequest) -> Result<AcceptResponse>;

    /// Broadcast a decided instance.
    async fn decide(&self, peer: &Peer, request: DecideRequest) -> Result<DecideResponse>;
}
