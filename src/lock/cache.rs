//! Client-side lock cache.
//!
//! A granted lock stays cached after release: local tasks hand it to each
//! other without server traffic until the authority revokes it. One entry
//! exists per lock, created lazily; the entry map guard covers lookup and
//! insert only, all waiting happens on the per-entry state.
//!
//! Acquire follows the server handshake: at most one task per lock runs
//! the RPC cycle (`Acquiring`), resending on `Retry` after the matching
//! retry callback. A revoke demotes the holder to `Releasing`; the lock
//! then goes back to the server through the releaser task on the next
//! release.

use crate::error::{LockstepError, Result};
use crate::lock::protocol::{
    AcquireRequest, AcquireStatus, ReleaseRequest, RetryRequest, RevokeRequest, SubscribeRequest,
};
use crate::transport::AuthorityTransport;
use crate::types::{ClientId, LockId, LockState, SequenceId};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

struct EntryState {
    state: LockState,
    /// Current acquire-cycle sequence number; bumped when a revoked lock
    /// is handed back, so stale callbacks can be told apart.
    seq: SequenceId,
    retry_present: bool,
    revoke_present: bool,
}

struct LockEntry {
    state: Mutex<EntryState>,
    notify: Notify,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState {
                state: LockState::None,
                seq: 1,
                retry_present: false,
                revoke_present: false,
            }),
            notify: Notify::new(),
        }
    }
}

/// Node-local cache counters.
#[derive(Default)]
pub struct CacheStats {
    cache_hits: AtomicU64,
    server_acquires: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    /// Acquires satisfied without any server round trip.
    pub cache_hits: u64,
    /// Acquire RPCs sent, including resends after retry callbacks.
    pub server_acquires: u64,
}

pub struct LockCache {
    client_id: ClientId,
    callback_addr: String,
    transport: Arc<dyn AuthorityTransport>,
    entries: Mutex<HashMap<LockId, Arc<LockEntry>>>,
    release_tx: mpsc::UnboundedSender<LockId>,
    release_rx: Mutex<Option<mpsc::UnboundedReceiver<LockId>>>,
    subscribed: AtomicBool,
    release_retry_delay: Duration,
    stats: CacheStats,
}

impl LockCache {
    pub fn new(
        client_id: ClientId,
        transport: Arc<dyn AuthorityTransport>,
        callback_addr: String,
        release_retry_delay: Duration,
    ) -> Arc<Self> {
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            client_id,
            callback_addr,
            transport,
            entries: Mutex::new(HashMap::new()),
            release_tx,
            release_rx: Mutex::new(Some(release_rx)),
            subscribed: AtomicBool::new(false),
            release_retry_delay,
            stats: CacheStats::default(),
        })
    }

    /// Block until this client holds the lock.
    ///
    /// On a transport error the entry is reset to `None`, waiting tasks are
    /// woken, and the subscription is marked dirty for the next attempt.
    pub async fn acquire(&self, lock: LockId) -> Result<()> {
        self.ensure_subscribed().await?;
        let entry = self.entry(lock);
        let mut used_server = false;

        loop {
            // Let any in-flight RPC cycle on this entry finish first.
            self.wait_until(&entry, |s| !s.state.is_busy()).await;

            let cycle_seq = {
                let mut state = entry.state.lock();
                if state.state == LockState::None {
                    state.state = LockState::Acquiring;
                    Some(state.seq)
                } else {
                    None
                }
            };

            if let Some(seq) = cycle_seq {
                used_server = true;
                if let Err(e) = self.acquire_cycle(&entry, lock, seq).await {
                    let mut state = entry.state.lock();
                    state.state = LockState::None;
                    drop(state);
                    entry.notify.notify_waiters();
                    self.subscribed.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }

            // Take the lock once it is free. Waking up to `None` means the
            // cycle we were waiting on died or the lock went back to the
            // server; start over.
            let grabbed = loop {
                let notified = entry.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let mut state = entry.state.lock();
                    match state.state {
                        LockState::Free => {
                            state.state = LockState::Locked;
                            if state.revoke_present {
                                state.state = LockState::Releasing;
                                state.revoke_present = false;
                            }
                            break true;
                        }
                        LockState::None => break false,
                        _ => {}
                    }
                }
                notified.await;
            };

            if grabbed {
                if !used_server {
                    self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    counter!("lockstep_cache_hits_total").increment(1);
                }
                debug!(client = self.client_id, lock, "Acquired lock");
                return Ok(());
            }
        }
    }

    /// The server RPC cycle: send acquire, park on `Retry` until the
    /// matching retry callback, resend. Ends with the entry `Free`.
    async fn acquire_cycle(&self, entry: &Arc<LockEntry>, lock: LockId, seq: SequenceId) -> Result<()> {
        loop {
            self.stats.server_acquires.fetch_add(1, Ordering::Relaxed);
            counter!("lockstep_cache_server_acquires_total").increment(1);
            let resp = self
                .transport
                .acquire(AcquireRequest {
                    client: self.client_id,
                    lock,
                    seq,
                })
                .await?;

            match resp.status {
                AcquireStatus::Granted => {
                    let mut state = entry.state.lock();
                    state.state = LockState::Free;
                    drop(state);
                    entry.notify.notify_waiters();
                    debug!(client = self.client_id, lock, seq, "Server granted lock");
                    return Ok(());
                }
                AcquireStatus::Retry => {
                    debug!(client = self.client_id, lock, seq, "Server asked to retry");
                    loop {
                        let notified = entry.notify.notified();
                        tokio::pin!(notified);
                        notified.as_mut().enable();

                        {
                            let mut state = entry.state.lock();
                            if state.retry_present {
                                state.retry_present = false;
                                break;
                            }
                        }
                        notified.await;
                    }
                }
            }
        }
    }

    /// Release a held lock. Local by default: the lock stays cached as
    /// `Free`. If a revoke made the entry `Releasing`, the sequence number
    /// is bumped, pending callbacks are voided, and the lock is queued for
    /// the releaser to hand back to the server.
    pub fn release(&self, lock: LockId) -> Result<()> {
        let entry = self.entry(lock);
        let mut state = entry.state.lock();
        match state.state {
            LockState::Releasing => {
                state.seq += 1;
                state.retry_present = false;
                state.revoke_present = false;
                drop(state);
                self.release_tx
                    .send(lock)
                    .map_err(|_| LockstepError::Shutdown("releaser stopped".into()))?;
                debug!(client = self.client_id, lock, "Queued lock for server release");
                Ok(())
            }
            LockState::Locked => {
                state.state = LockState::Free;
                drop(state);
                entry.notify.notify_waiters();
                debug!(client = self.client_id, lock, "Released lock to local cache");
                Ok(())
            }
            other => {
                drop(state);
                Err(LockstepError::NotHeld { lock, state: other })
            }
        }
    }

    /// Server callback: give the lock back.
    pub fn handle_revoke(&self, req: RevokeRequest) {
        let Some(entry) = self.lookup(req.lock) else {
            debug!(client = self.client_id, lock = req.lock, "Revoke for unknown lock");
            return;
        };

        let mut state = entry.state.lock();
        if state.seq != req.seq {
            debug!(
                client = self.client_id,
                lock = req.lock,
                seq = req.seq,
                current = state.seq,
                "Ignoring revoke for another cycle"
            );
            return;
        }

        state.revoke_present = true;
        let release_now = state.state == LockState::Free;
        if state.state != LockState::Acquiring {
            state.state = LockState::Releasing;
        }
        drop(state);

        if release_now {
            debug!(client = self.client_id, lock = req.lock, "Revoked while free, releasing");
            if self.release_tx.send(req.lock).is_err() {
                error!(lock = req.lock, "Releaser gone, cannot hand lock back");
            }
        }
    }

    /// Server callback: a refused acquire may now succeed.
    pub fn handle_retry(&self, req: RetryRequest) {
        let Some(entry) = self.lookup(req.lock) else {
            debug!(client = self.client_id, lock = req.lock, "Retry for unknown lock");
            return;
        };

        let mut state = entry.state.lock();
        if state.seq == req.seq {
            state.retry_present = true;
        } else {
            debug!(
                client = self.client_id,
                lock = req.lock,
                seq = req.seq,
                current = state.seq,
                "Stale retry callback"
            );
        }
        drop(state);
        entry.notify.notify_waiters();
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            server_acquires: self.stats.server_acquires.load(Ordering::Relaxed),
        }
    }

    /// Spawn the releaser task feeding queued locks back to the server.
    pub fn spawn_releaser(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        tokio::spawn(Arc::clone(self).run_releaser(shutdown));
    }

    pub async fn run_releaser(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut queue) = self.release_rx.lock().take() else {
            error!(client = self.client_id, "Releaser already running");
            return;
        };

        loop {
            tokio::select! {
                popped = queue.recv() => {
                    match popped {
                        Some(lock) => self.release_to_server(lock).await,
                        None => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(client = self.client_id, "Releaser stopped");
    }

    /// Send one queued release. The server must observe it, so failures
    /// requeue the lock after a delay instead of dropping it.
    async fn release_to_server(&self, lock: LockId) {
        let entry = self.entry(lock);
        let seq = entry.state.lock().seq;

        let result = self
            .transport
            .release(ReleaseRequest {
                client: self.client_id,
                lock,
                seq,
            })
            .await;

        match result {
            Ok(_) => {
                let mut state = entry.state.lock();
                state.state = LockState::None;
                drop(state);
                entry.notify.notify_waiters();
                debug!(client = self.client_id, lock, seq, "Returned lock to server");
            }
            Err(e) => {
                warn!(client = self.client_id, lock, error = %e, "Server release failed, requeueing");
                self.subscribed.store(false, Ordering::SeqCst);
                tokio::time::sleep(self.release_retry_delay).await;
                if self.release_tx.send(lock).is_err() {
                    error!(lock, "Releaser queue closed while requeueing");
                }
            }
        }
    }

    /// Register the callback endpoint, once per (re)connection. A failed
    /// lock RPC marks the subscription dirty and the next acquire
    /// re-subscribes, which also covers primary failover.
    async fn ensure_subscribed(&self) -> Result<()> {
        if self.subscribed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.transport
            .subscribe(SubscribeRequest {
                client: self.client_id,
                callback_addr: self.callback_addr.clone(),
            })
            .await?;
        self.subscribed.store(true, Ordering::SeqCst);
        info!(client = self.client_id, addr = %self.callback_addr, "Subscribed to lock authority");
        Ok(())
    }

    fn entry(&self, lock: LockId) -> Arc<LockEntry> {
        Arc::clone(
            self.entries
                .lock()
                .entry(lock)
                .or_insert_with(|| Arc::new(LockEntry::new())),
        )
    }

    fn lookup(&self, lock: LockId) -> Option<Arc<LockEntry>> {
        self.entries.lock().get(&lock).cloned()
    }

    /// Park until the entry satisfies `ready`. Interest is registered
    /// before the check so wakeups cannot slip through.
    async fn wait_until(&self, entry: &LockEntry, ready: impl Fn(&EntryState) -> bool) {
        loop {
            let notified = entry.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if ready(&entry.state.lock()) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::authority::LockAuthority;
    use crate::lock::protocol::AcquireResponse;
    use crate::replica::ReplicaRole;
    use crate::transport::mock::{DirectCallbacks, LoopbackAuthority, ScriptedAuthority};
    use crate::transport::CallbackTransport;

    fn cache_with(transport: Arc<dyn AuthorityTransport>, client: ClientId) -> Arc<LockCache> {
        LockCache::new(
            client,
            transport,
            format!("client-{client}"),
            Duration::from_millis(20),
        )
    }

    fn entry_state(cache: &LockCache, lock: LockId) -> LockState {
        cache.entries.lock()[&lock].state.lock().state
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_acquire_caches_across_releases() {
        let transport = ScriptedAuthority::new();
        let cache = cache_with(transport.clone(), 1);

        cache.acquire(5).await.unwrap();
        cache.release(5).unwrap();
        cache.acquire(5).await.unwrap();
        cache.release(5).unwrap();

        // One subscribe, one server acquire, no server release.
        assert_eq!(transport.subscribes.lock().len(), 1);
        assert_eq!(transport.acquires.lock().len(), 1);
        assert!(transport.releases.lock().is_empty());

        let stats = cache.stats();
        assert_eq!(stats.server_acquires, 1);
        assert_eq!(stats.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_release_without_holding_is_an_error() {
        let transport = ScriptedAuthority::new();
        let cache = cache_with(transport.clone(), 1);

        let err = cache.release(5).unwrap_err();
        assert!(matches!(err, LockstepError::NotHeld { lock: 5, .. }));

        cache.acquire(5).await.unwrap();
        cache.release(5).unwrap();
        let err = cache.release(5).unwrap_err();
        assert!(matches!(
            err,
            LockstepError::NotHeld {
                lock: 5,
                state: LockState::Free
            }
        ));
    }

    #[tokio::test]
    async fn test_retry_callback_resumes_acquire() {
        let transport = ScriptedAuthority::new();
        let attempts = Arc::new(AtomicU64::new(0));
        {
            let attempts = Arc::clone(&attempts);
            transport.on_acquire(move |_| {
                let status = if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    AcquireStatus::Retry
                } else {
                    AcquireStatus::Granted
                };
                Ok(AcquireResponse { status })
            });
        }
        let cache = cache_with(transport.clone(), 1);

        let pending = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.acquire(9).await })
        };

        eventually(|| transport.acquires.lock().len() == 1).await;

        // A stale retry does not wake the cycle.
        cache.handle_retry(RetryRequest { lock: 9, seq: 42 });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.acquires.lock().len(), 1);

        cache.handle_retry(RetryRequest { lock: 9, seq: 1 });
        pending.await.unwrap().unwrap();

        let acquires = transport.acquires.lock();
        assert_eq!(acquires.len(), 2);
        assert!(acquires.iter().all(|r| r.seq == 1));
    }

    #[tokio::test]
    async fn test_revoke_while_held_defers_until_release() {
        let transport = ScriptedAuthority::new();
        let cache = cache_with(transport.clone(), 1);
        let (_tx, shutdown) = watch::channel(false);
        cache.spawn_releaser(shutdown);

        cache.acquire(5).await.unwrap();
        cache.handle_revoke(RevokeRequest { lock: 5, seq: 1 });
        assert_eq!(entry_state(&cache, 5), LockState::Releasing);
        assert!(transport.releases.lock().is_empty());

        cache.release(5).unwrap();
        eventually(|| !transport.releases.lock().is_empty()).await;

        // The handed-back release carries the bumped sequence number.
        let releases = transport.releases.lock();
        assert_eq!(releases[0].lock, 5);
        assert_eq!(releases[0].seq, 2);
        drop(releases);

        eventually(|| entry_state(&cache, 5) == LockState::None).await;

        // The next acquire is a fresh server cycle under the new seq.
        cache.acquire(5).await.unwrap();
        assert_eq!(transport.acquires.lock().last().map(|r| r.seq), Some(2));
    }

    #[tokio::test]
    async fn test_revoke_while_free_releases_immediately() {
        let transport = ScriptedAuthority::new();
        let cache = cache_with(transport.clone(), 1);
        let (_tx, shutdown) = watch::channel(false);
        cache.spawn_releaser(shutdown);

        cache.acquire(5).await.unwrap();
        cache.release(5).unwrap();
        assert_eq!(entry_state(&cache, 5), LockState::Free);

        cache.handle_revoke(RevokeRequest { lock: 5, seq: 1 });
        eventually(|| !transport.releases.lock().is_empty()).await;
        assert_eq!(transport.releases.lock()[0].seq, 1);
        eventually(|| entry_state(&cache, 5) == LockState::None).await;
    }

    #[tokio::test]
    async fn test_stale_revoke_is_ignored() {
        let transport = ScriptedAuthority::new();
        let cache = cache_with(transport.clone(), 1);

        cache.acquire(5).await.unwrap();
        cache.handle_revoke(RevokeRequest { lock: 5, seq: 0 });
        assert_eq!(entry_state(&cache, 5), LockState::Locked);

        // Unknown locks are ignored outright.
        cache.handle_revoke(RevokeRequest { lock: 99, seq: 1 });
        assert!(!cache.entries.lock().contains_key(&99));
    }

    #[tokio::test]
    async fn test_transport_error_resets_entry() {
        let transport = ScriptedAuthority::new();
        transport.on_acquire(|_| Err(LockstepError::Transport("connection refused".into())));
        let cache = cache_with(transport.clone(), 1);

        let err = cache.acquire(5).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(entry_state(&cache, 5), LockState::None);

        // The next attempt re-subscribes and succeeds.
        transport.on_acquire(|_| {
            Ok(AcquireResponse {
                status: AcquireStatus::Granted,
            })
        });
        cache.acquire(5).await.unwrap();
        assert_eq!(transport.subscribes.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_mutual_exclusion_across_tasks() {
        let transport = ScriptedAuthority::new();
        let cache = cache_with(transport.clone(), 1);
        let in_section = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let in_section = Arc::clone(&in_section);
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    cache.acquire(3).await.unwrap();
                    assert_eq!(in_section.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    in_section.fetch_sub(1, Ordering::SeqCst);
                    cache.release(3).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // The whole run cost a single server acquire.
        assert_eq!(transport.acquires.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_handoff_between_clients() {
        let callbacks = DirectCallbacks::new();
        let authority = LockAuthority::new(
            callbacks.clone() as Arc<dyn CallbackTransport>,
            Arc::new(ReplicaRole::new(true)),
        );
        let (_tx, shutdown) = watch::channel(false);
        authority.spawn_workers(shutdown.clone());

        let cache_a = cache_with(Arc::new(LoopbackAuthority(Arc::clone(&authority))), 1);
        let cache_b = cache_with(Arc::new(LoopbackAuthority(Arc::clone(&authority))), 2);
        cache_a.spawn_releaser(shutdown.clone());
        cache_b.spawn_releaser(shutdown.clone());
        callbacks.attach("client-1", Arc::clone(&cache_a));
        callbacks.attach("client-2", Arc::clone(&cache_b));

        cache_a.acquire(7).await.unwrap();

        let waiter = {
            let cache_b = Arc::clone(&cache_b);
            tokio::spawn(async move { cache_b.acquire(7).await })
        };

        // Let the server's revoke land while A still holds the lock.
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache_a.release(7).unwrap();

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        cache_b.release(7).unwrap();

        // Getting it back revokes B's now-free cached copy.
        tokio::time::timeout(Duration::from_secs(5), cache_a.acquire(7))
            .await
            .unwrap()
            .unwrap();
        cache_a.release(7).unwrap();
    }
}
