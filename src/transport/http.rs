//! HTTP transport implementations.
//!
//! `reqwest` clients back the three service traits; `axum` routers serve
//! the replica (lock service, acceptor, state transfer) and the client
//! callback listener. Route tables are built once at startup.

use super::{AcceptorTransport, AuthorityTransport, CallbackTransport};
use crate::error::{LockstepError, Result};
use crate::lock::authority::LockAuthority;
use crate::lock::cache::LockCache;
use crate::lock::protocol::{
    Ack, AcquireRequest, AcquireResponse, ReleaseRequest, RetryRequest, RevokeRequest,
    SubscribeRequest,
};
use crate::paxos::messages::{
    AcceptRequest, AcceptResponse, DecideRequest, DecideResponse, PrepareRequest, PrepareResponse,
};
use crate::paxos::storage::RocksWal;
use crate::paxos::{Acceptor, Proposer};
use crate::replica::{StateTransfer, ViewLog};
use crate::types::{PaxosInstance, Peer};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

fn build_client(connect_timeout: Duration, request_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(request_timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Lock RPC client pinned to one authority address.
pub struct HttpAuthority {
    addr: String,
    client: reqwest::Client,
}

impl HttpAuthority {
    pub fn new(
        addr: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            addr: addr.into(),
            client: build_client(connect_timeout, request_timeout),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("http://{}/{}", self.addr, endpoint)
    }
}

#[async_trait::async_trait]
impl AuthorityTransport for HttpAuthority {
    async fn acquire(&self, request: AcquireRequest) -> Result<AcquireResponse> {
        let response = self
            .client
            .post(self.url("lock/acquire"))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        response
            .json()
            .await
            .map_err(|e| LockstepError::Serialization(e.to_string()))
    }

    async fn release(&self, request: ReleaseRequest) -> Result<Ack> {
        let response = self
            .client
            .post(self.url("lock/release"))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        response
            .json()
            .await
            .map_err(|e| LockstepError::Serialization(e.to_string()))
    }

    async fn subscribe(&self, request: SubscribeRequest) -> Result<Ack> {
        let response = self
            .client
            .post(self.url("lock/subscribe"))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        response
            .json()
            .await
            .map_err(|e| LockstepError::Serialization(e.to_string()))
    }
}

/// Revoke/retry callback client, dialed per subscriber address.
pub struct HttpCallbacks {
    client: reqwest::Client,
}

impl HttpCallbacks {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            client: build_client(connect_timeout, request_timeout),
        }
    }
}

#[async_trait::async_trait]
impl CallbackTransport for HttpCallbacks {
    async fn revoke(&self, addr: &str, request: RevokeRequest) -> Result<Ack> {
        let response = self
            .client
            .post(format!("http://{addr}/callback/revoke"))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        response
            .json()
            .await
            .map_err(|e| LockstepError::Serialization(e.to_string()))
    }

    async fn retry(&self, addr: &str, request: RetryRequest) -> Result<Ack> {
        let response = self
            .client
            .post(format!("http://{addr}/callback/retry"))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        response
            .json()
            .await
            .map_err(|e| LockstepError::Serialization(e.to_string()))
    }
}

/// Consensus RPC client, dialed per view member.
pub struct HttpAcceptors {
    client: reqwest::Client,
}

impl HttpAcceptors {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            client: build_client(connect_timeout, request_timeout),
        }
    }
}

#[async_trait::async_trait]
impl AcceptorTransport for HttpAcceptors {
    async fn prepare(&self, peer: &Peer, request: PrepareRequest) -> Result<PrepareResponse> {
        let response = self
            .client
            .post(format!("http://{}/paxos/prepare", peer.addr))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        response
            .json()
            .await
            .map_err(|e| LockstepError::Serialization(e.to_string()))
    }

    async fn accept(&self, peer: &Peer, request: AcceptRequest) -> Result<AcceptResponse> {
        let response = self
            .client
            .post(format!("http://{}/paxos/accept", peer.addr))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        response
            .json()
            .await
            .map_err(|e| LockstepError::Serialization(e.to_string()))
    }

    async fn decide(&self, peer: &Peer, request: DecideRequest) -> Result<DecideResponse> {
        let response = self
            .client
            .post(format!("http://{}/paxos/decide", peer.addr))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        response
            .json()
            .await
            .map_err(|e| LockstepError::Serialization(e.to_string()))
    }
}

/// Ask a replica to drive one proposal round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeRequest {
    /// The membership view to put up for agreement.
    pub value: String,
}

/// Outcome of a proposal round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeResponse {
    /// Whether this round decided. False means lost, lagging, or a round
    /// already in flight; the caller may re-issue.
    pub decided: bool,
    /// The instance the round targeted.
    pub instance: PaxosInstance,
}

/// The replica's latest committed view. Zero instance means none yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewStatus {
    pub instance: PaxosInstance,
    pub view: String,
}

/// Shared state for the replica's handlers.
#[derive(Clone)]
pub struct ReplicaContext {
    pub authority: Arc<LockAuthority>,
    pub acceptor: Arc<Acceptor<RocksWal>>,
    pub proposer: Arc<Proposer<RocksWal>>,
    pub views: Arc<ViewLog>,
}

/// The replica's full HTTP surface.
pub fn replica_router(context: ReplicaContext) -> Router {
    Router::new()
        .route("/lock/acquire", post(handle_acquire))
        .route("/lock/release", post(handle_release))
        .route("/lock/subscribe", post(handle_subscribe))
        .route("/lock/stats", get(handle_stats))
        .route("/paxos/prepare", post(handle_prepare))
        .route("/paxos/accept", post(handle_accept))
        .route("/paxos/decide", post(handle_decide))
        .route("/paxos/propose", post(handle_propose))
        .route("/paxos/view", get(handle_view))
        .route("/replica/state", get(handle_state_dump).post(handle_state_install))
        .route("/health", get(health_check))
        .with_state(context)
}

/// The client's callback listener.
pub fn callback_router(cache: Arc<LockCache>) -> Router {
    Router::new()
        .route("/callback/revoke", post(handle_callback_revoke))
        .route("/callback/retry", post(handle_callback_retry))
        .with_state(cache)
}

/// Bind a listener, returning the resolved address for `:0` binds.
pub async fn bind(addr: SocketAddr) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

/// Serve a router until the shutdown signal flips or its sender drops.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| LockstepError::Transport(e.to_string()))
}

fn internal(e: LockstepError) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// Handlers

async fn health_check() -> &'static str {
    "OK"
}

async fn handle_acquire(
    State(context): State<ReplicaContext>,
    Json(request): Json<AcquireRequest>,
) -> std::result::Result<Json<AcquireResponse>, (StatusCode, String)> {
    context.authority.acquire(request).map(Json).map_err(internal)
}

async fn handle_release(
    State(context): State<ReplicaContext>,
    Json(request): Json<ReleaseRequest>,
) -> std::result::Result<Json<Ack>, (StatusCode, String)> {
    context.authority.release(request).map(Json).map_err(internal)
}

async fn handle_subscribe(
    State(context): State<ReplicaContext>,
    Json(request): Json<SubscribeRequest>,
) -> std::result::Result<Json<Ack>, (StatusCode, String)> {
    context.authority.subscribe(request).map(Json).map_err(internal)
}

async fn handle_stats(State(context): State<ReplicaContext>) -> Json<crate::lock::AuthorityStatsSnapshot> {
    Json(context.authority.stats())
}

async fn handle_prepare(
    State(context): State<ReplicaContext>,
    Json(request): Json<PrepareRequest>,
) -> std::result::Result<Json<PrepareResponse>, (StatusCode, String)> {
    context.acceptor.handle_prepare(request).map(Json).map_err(internal)
}

async fn handle_accept(
    State(context): State<ReplicaContext>,
    Json(request): Json<AcceptRequest>,
) -> std::result::Result<Json<AcceptResponse>, (StatusCode, String)> {
    context.acceptor.handle_accept(request).map(Json).map_err(internal)
}

async fn handle_decide(
    State(context): State<ReplicaContext>,
    Json(request): Json<DecideRequest>,
) -> std::result::Result<Json<DecideResponse>, (StatusCode, String)> {
    context.acceptor.handle_decide(request).map(Json).map_err(internal)
}

async fn handle_propose(
    State(context): State<ReplicaContext>,
    Json(request): Json<ProposeRequest>,
) -> std::result::Result<Json<ProposeResponse>, (StatusCode, String)> {
    let peers = context.views.latest_peers().map_err(internal)?;
    if peers.is_empty() {
        return Err(internal(LockstepError::Protocol(
            "no committed view to propose against".into(),
        )));
    }
    let instance = context.views.next_instance();
    let decided = context
        .proposer
        .run(instance, &peers, &request.value)
        .await
        .map_err(internal)?;
    Ok(Json(ProposeResponse { decided, instance }))
}

async fn handle_view(State(context): State<ReplicaContext>) -> Json<ViewStatus> {
    let (instance, view) = context.views.latest().unwrap_or((0, String::new()));
    Json(ViewStatus { instance, view })
}

async fn handle_state_dump(
    State(context): State<ReplicaContext>,
) -> std::result::Result<Vec<u8>, (StatusCode, String)> {
    context.authority.marshal().map_err(internal)
}

async fn handle_state_install(
    State(context): State<ReplicaContext>,
    body: Bytes,
) -> std::result::Result<Json<Ack>, (StatusCode, String)> {
    context
        .authority
        .unmarshal(&body)
        .map(|()| Json(Ack::ok()))
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

async fn handle_callback_revoke(
    State(cache): State<Arc<LockCache>>,
    Json(request): Json<RevokeRequest>,
) -> Json<Ack> {
    cache.handle_revoke(request);
    Json(Ack::ok())
}

async fn handle_callback_retry(
    State(cache): State<Arc<LockCache>>,
    Json(request): Json<RetryRequest>,
) -> Json<Ack> {
    cache.handle_retry(request);
    Json(Ack::ok())
}
