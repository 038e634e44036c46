//! Server-side lock cache, the replicated lock authority.
//!
//! Grants are sticky: a client keeps a granted lock cached until the
//! authority revokes it on behalf of a waiter. Two worker tasks drive the
//! callback traffic: the revoker asks current owners to give locks back,
//! the retryer tells waiters to resend. Only the primary replica sends
//! callbacks; backups apply the same mutations and stay silent.

use crate::error::Result;
use crate::lock::protocol::{
    Ack, AcquireRequest, AcquireResponse, AcquireStatus, ReleaseRequest, RetryRequest,
    RevokeRequest, SubscribeRequest,
};
use crate::replica::{ReplicaRole, StateTransfer};
use crate::transport::CallbackTransport;
use crate::types::{ClientId, LockId, SequenceId};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Replicated lock state. One coarse guard; critical sections never span
/// an outbound call.
#[derive(Default)]
struct AuthorityState {
    lock_owner: HashMap<LockId, ClientId>,
    retry_map: HashMap<LockId, BTreeSet<ClientId>>,
    sequence_store: HashMap<(ClientId, LockId), SequenceId>,
    revoke_queue: VecDeque<LockId>,
    retry_queue: VecDeque<LockId>,
}

/// Wire image for state transfer. Field order is the transfer order; the
/// subscriber table is deliberately absent, clients re-subscribe against a
/// new primary themselves.
#[derive(Serialize, Deserialize)]
struct AuthorityImage {
    lock_owner: BTreeMap<LockId, ClientId>,
    retry_map: BTreeMap<LockId, BTreeSet<ClientId>>,
    retry_queue: Vec<LockId>,
    revoke_queue: Vec<LockId>,
    sequence_store: BTreeMap<ClientId, BTreeMap<LockId, SequenceId>>,
}

/// Node-local counters, excluded from state transfer.
#[derive(Default)]
pub struct AuthorityStats {
    acquires_granted: AtomicU64,
    retries_returned: AtomicU64,
    revokes_sent: AtomicU64,
    retries_sent: AtomicU64,
}

/// Point-in-time copy of [`AuthorityStats`], served by `GET /lock/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityStatsSnapshot {
    pub acquires_granted: u64,
    pub retries_returned: u64,
    pub revokes_sent: u64,
    pub retries_sent: u64,
}

impl AuthorityStats {
    fn snapshot(&self) -> AuthorityStatsSnapshot {
        AuthorityStatsSnapshot {
            acquires_granted: self.acquires_granted.load(Ordering::Relaxed),
            retries_returned: self.retries_returned.load(Ordering::Relaxed),
            revokes_sent: self.revokes_sent.load(Ordering::Relaxed),
            retries_sent: self.retries_sent.load(Ordering::Relaxed),
        }
    }
}

pub struct LockAuthority {
    state: Mutex<AuthorityState>,
    subscribers: RwLock<HashMap<ClientId, String>>,
    revoke_notify: Notify,
    retry_notify: Notify,
    callbacks: Arc<dyn CallbackTransport>,
    role: Arc<ReplicaRole>,
    stats: AuthorityStats,
}

impl LockAuthority {
    pub fn new(callbacks: Arc<dyn CallbackTransport>, role: Arc<ReplicaRole>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AuthorityState::default()),
            subscribers: RwLock::new(HashMap::new()),
            revoke_notify: Notify::new(),
            retry_notify: Notify::new(),
            callbacks,
            role,
            stats: AuthorityStats::default(),
        })
    }

    /// Grant the lock if it is unowned; otherwise queue the caller and
    /// schedule a revoke against the current owner.
    pub fn acquire(&self, req: AcquireRequest) -> Result<AcquireResponse> {
        let mut state = self.state.lock();
        state
            .sequence_store
            .insert((req.client, req.lock), req.seq);

        if state.lock_owner.contains_key(&req.lock) {
            state
                .retry_map
                .entry(req.lock)
                .or_default()
                .insert(req.client);
            state.revoke_queue.push_back(req.lock);
            drop(state);

            self.revoke_notify.notify_one();
            self.stats.retries_returned.fetch_add(1, Ordering::Relaxed);
            counter!("lockstep_lock_retries_total").increment(1);
            debug!(
                client = req.client,
                lock = req.lock,
                seq = req.seq,
                "Lock busy, queued waiter"
            );
            Ok(AcquireResponse {
                status: AcquireStatus::Retry,
            })
        } else {
            state.lock_owner.insert(req.lock, req.client);
            drop(state);

            self.stats.acquires_granted.fetch_add(1, Ordering::Relaxed);
            counter!("lockstep_lock_grants_total").increment(1);
            debug!(
                client = req.client,
                lock = req.lock,
                seq = req.seq,
                "Granted lock"
            );
            Ok(AcquireResponse {
                status: AcquireStatus::Granted,
            })
        }
    }

    /// Take the lock back from its owner and schedule retry callbacks for
    /// any waiters. Releases from non-owners are late duplicates; they are
    /// logged and ignored.
    pub fn release(&self, req: ReleaseRequest) -> Result<Ack> {
        let mut state = self.state.lock();

        match state.sequence_store.get(&(req.client, req.lock)) {
            Some(&stored) if stored != req.seq => {
                warn!(
                    client = req.client,
                    lock = req.lock,
                    stored,
                    seq = req.seq,
                    "Release with unexpected sequence"
                );
            }
            None => {
                warn!(
                    client = req.client,
                    lock = req.lock,
                    "Release from client with no recorded acquire"
                );
            }
            _ => {}
        }

        if state.lock_owner.get(&req.lock) == Some(&req.client) {
            state.lock_owner.remove(&req.lock);
            state.retry_queue.push_back(req.lock);
            drop(state);

            self.retry_notify.notify_one();
            debug!(client = req.client, lock = req.lock, "Lock released");
        } else {
            drop(state);
            debug!(
                client = req.client,
                lock = req.lock,
                "Ignoring release from non-owner"
            );
        }
        Ok(Ack::ok())
    }

    /// Record the caller's callback endpoint. Idempotent; a re-subscribe
    /// replaces the stored address.
    pub fn subscribe(&self, req: SubscribeRequest) -> Result<Ack> {
        info!(client = req.client, addr = %req.callback_addr, "Client subscribed");
        self.subscribers
            .write()
            .insert(req.client, req.callback_addr);
        Ok(Ack::ok())
    }

    pub fn stats(&self) -> AuthorityStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn the revoker and retryer loops.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        tokio::spawn(Arc::clone(self).run_revoker(shutdown.clone()));
        tokio::spawn(Arc::clone(self).run_retryer(shutdown));
    }

    /// Ask owners of contended locks to give them back.
    pub async fn run_revoker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            // Register for a wakeup before checking the queue, so a push
            // landing between the check and the await is not lost.
            let notified = self.revoke_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = {
                let mut state = self.state.lock();
                match state.revoke_queue.pop_front() {
                    None => None,
                    Some(lock) => {
                        let target = state.lock_owner.get(&lock).map(|&owner| {
                            let seq = state
                                .sequence_store
                                .get(&(owner, lock))
                                .copied()
                                .unwrap_or(0);
                            (owner, seq)
                        });
                        Some((lock, target))
                    }
                }
            };

            match popped {
                None => {
                    tokio::select! {
                        _ = &mut notified => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                Some((lock, None)) => {
                    // Owner already released; nothing left to revoke.
                    debug!(lock, "Skipping revoke for unowned lock");
                }
                Some((lock, Some((owner, seq)))) => {
                    if !self.role.is_primary() {
                        debug!(lock, owner, "Backup skipping revoke send");
                        continue;
                    }
                    let addr = self.subscribers.read().get(&owner).cloned();
                    match addr {
                        None => {
                            warn!(client = owner, lock, "No subscription for revoke target");
                        }
                        Some(addr) => {
                            match self
                                .callbacks
                                .revoke(&addr, RevokeRequest { lock, seq })
                                .await
                            {
                                Ok(_) => {
                                    self.stats.revokes_sent.fetch_add(1, Ordering::Relaxed);
                                    counter!("lockstep_lock_revokes_sent_total").increment(1);
                                    debug!(client = owner, lock, seq, "Sent revoke");
                                }
                                Err(e) => {
                                    warn!(client = owner, lock, error = %e, "Revoke callback failed");
                                }
                            }
                        }
                    }
                }
            }
        }
        debug!("Revoker stopped");
    }

    /// Tell waiters their acquire may now succeed. The waiter set is
    /// drained even on backups so replica state stays convergent.
    pub async fn run_retryer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let notified = self.retry_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = {
                let mut state = self.state.lock();
                match state.retry_queue.pop_front() {
                    None => None,
                    Some(lock) => {
                        let drained = state.retry_map.remove(&lock).unwrap_or_default();
                        let waiters: Vec<(ClientId, SequenceId)> = drained
                            .into_iter()
                            .map(|client| {
                                let seq = state
                                    .sequence_store
                                    .get(&(client, lock))
                                    .copied()
                                    .unwrap_or(0);
                                (client, seq)
                            })
                            .collect();
                        Some((lock, waiters))
                    }
                }
            };

            match popped {
                None => {
                    tokio::select! {
                        _ = &mut notified => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                Some((_, waiters)) if waiters.is_empty() => {}
                Some((lock, waiters)) => {
                    if !self.role.is_primary() {
                        debug!(lock, waiters = waiters.len(), "Backup skipping retry sends");
                        continue;
                    }
                    for (client, seq) in waiters {
                        let addr = self.subscribers.read().get(&client).cloned();
                        match addr {
                            None => {
                                warn!(client, lock, "No subscription for retry target");
                            }
                            Some(addr) => {
                                match self
                                    .callbacks
                                    .retry(&addr, RetryRequest { lock, seq })
                                    .await
                                {
                                    Ok(_) => {
                                        self.stats.retries_sent.fetch_add(1, Ordering::Relaxed);
                                        counter!("lockstep_lock_retry_callbacks_total")
                                            .increment(1);
                                        debug!(client, lock, seq, "Sent retry");
                                    }
                                    Err(e) => {
                                        warn!(client, lock, error = %e, "Retry callback failed");
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        debug!("Retryer stopped");
    }
}

impl StateTransfer for LockAuthority {
    fn marshal(&self) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let mut sequence_store: BTreeMap<ClientId, BTreeMap<LockId, SequenceId>> = BTreeMap::new();
        for (&(client, lock), &seq) in &state.sequence_store {
            sequence_store.entry(client).or_default().insert(lock, seq);
        }
        let image = AuthorityImage {
            lock_owner: state.lock_owner.iter().map(|(&l, &c)| (l, c)).collect(),
            retry_map: state
                .retry_map
                .iter()
                .map(|(&l, waiters)| (l, waiters.clone()))
                .collect(),
            retry_queue: state.retry_queue.iter().copied().collect(),
            revoke_queue: state.revoke_queue.iter().copied().collect(),
            sequence_store,
        };
        drop(state);
        Ok(bincode::serialize(&image)?)
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<()> {
        let image: AuthorityImage = bincode::deserialize(bytes)?;
        {
            let mut state = self.state.lock();
            state.lock_owner = image.lock_owner.into_iter().collect();
            state.retry_map = image.retry_map.into_iter().collect();
            state.retry_queue = image.retry_queue.into();
            state.revoke_queue = image.revoke_queue.into();
            state.sequence_store = image
                .sequence_store
                .into_iter()
                .flat_map(|(client, locks)| {
                    locks
                        .into_iter()
                        .map(move |(lock, seq)| ((client, lock), seq))
                })
                .collect();
        }
        info!("Installed transferred lock state");

        // The restored queues may hold work.
        self.revoke_notify.notify_one();
        self.retry_notify.notify_one();
        Ok(())
    }
}
