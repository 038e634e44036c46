//! Paxos proposer.
//!
//! Drives a single instance through prepare, accept, and decide against a
//! fixed view of acceptors. Runs are single-flight per proposer; a round
//! that falls short of a majority is a normal "no decision" outcome the
//! caller may retry with a fresh number.

use crate::error::{LockstepError, Result};
use crate::paxos::acceptor::Acceptor;
use crate::paxos::messages::{AcceptRequest, DecideRequest, PrepareRequest};
use crate::paxos::storage::WalStore;
use crate::paxos::{majority, CrashPoint, FaultInjector};
use crate::transport::AcceptorTransport;
use crate::types::{NodeId, PaxosInstance, Peer, ProposalNumber};
use futures::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Clears the single-flight flag when a run ends, on every exit path.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Proposer<S: WalStore> {
    me: NodeId,
    acceptor: Arc<Acceptor<S>>,
    transport: Arc<dyn AcceptorTransport>,
    faults: Arc<dyn FaultInjector>,
    rpc_timeout: Duration,
    my_n: Mutex<ProposalNumber>,
    running: AtomicBool,
}

impl<S: WalStore> Proposer<S> {
    pub fn new(
        me: NodeId,
        acceptor: Arc<Acceptor<S>>,
        transport: Arc<dyn AcceptorTransport>,
        faults: Arc<dyn FaultInjector>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            me,
            acceptor,
            transport,
            faults,
            rpc_timeout,
            my_n: Mutex::new(ProposalNumber::zero(me)),
            running: AtomicBool::new(false),
        }
    }

    /// Propose `value` for `instance` against the given view.
    ///
    /// Returns `Ok(true)` when the instance was decided by this run,
    /// `Ok(false)` when the round ended without a decision (no majority,
    /// the instance was already decided elsewhere, or another run is in
    /// flight on this proposer), and `Err` on protocol failures.
    pub async fn run(&self, instance: PaxosInstance, nodes: &[Peer], value: &str) -> Result<bool> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(node_id = self.me, instance, "Proposer busy, skipping round");
            return Ok(false);
        }
        let _guard = RunGuard(&self.running);

        let number = self.next_number();
        counter!("lockstep_paxos_rounds_total").increment(1);
        info!(node_id = self.me, instance, number = %number, "Starting proposal round");

        let Some((promised, chosen)) = self
            .prepare_phase(instance, number, value, nodes)
            .await?
        else {
            return Ok(false);
        };

        if self.faults.crashed(CrashPoint::AfterPrepare) {
            return Err(LockstepError::ProposalAborted(
                "crash injected after prepare phase".into(),
            ));
        }

        let accepted = self
            .accept_phase(instance, number, &chosen, &promised)
            .await?;
        if accepted.len() < majority(nodes.len()) {
            debug!(
                node_id = self.me,
                instance,
                accepted = accepted.len(),
                "No accept majority"
            );
            return Ok(false);
        }

        if self.faults.crashed(CrashPoint::AfterAccept) {
            return Err(LockstepError::ProposalAborted(
                "crash injected after accept phase".into(),
            ));
        }

        self.decide_phase(instance, &chosen, &accepted).await?;
        Ok(true)
    }

    /// Pick a number above everything this proposer has used and everything
    /// its local acceptor has promised.
    fn next_number(&self) -> ProposalNumber {
        let mut my_n = self.my_n.lock();
        let promised = self.acceptor.highest_promised();
        *my_n = ProposalNumber::new(my_n.round.max(promised.round) + 1, self.me);
        *my_n
    }

    /// Phase one. Returns the promising peers and the value to carry into
    /// the accept phase, or `None` when the round ends here.
    async fn prepare_phase(
        &self,
        instance: PaxosInstance,
        number: ProposalNumber,
        value: &str,
        nodes: &[Peer],
    ) -> Result<Option<(Vec<Peer>, String)>> {
        let calls = nodes.iter().map(|peer| async move {
            let request = PrepareRequest {
                instance,
                number,
                value: value.to_string(),
            };
            let reply = timeout(self.rpc_timeout, self.transport.prepare(peer, request)).await;
            (peer, reply)
        });

        let mut promised: Vec<Peer> = Vec::new();
        let mut chosen = value.to_string();
        let mut best = ProposalNumber::zero(self.me);

        for (peer, reply) in join_all(calls).await {
            match reply {
                Ok(Ok(resp)) if resp.old_instance => {
                    // We are behind; learn the decided value and stop.
                    info!(
                        node_id = self.me,
                        instance,
                        peer = peer.id,
                        "Instance already decided, adopting"
                    );
                    self.acceptor.commit(instance, &resp.accepted_value)?;
                    return Ok(None);
                }
                Ok(Ok(resp)) if resp.accept => {
                    if resp.accepted_number.is_proposal() && resp.accepted_number > best {
                        best = resp.accepted_number;
                        chosen = resp.accepted_value.clone();
                    }
                    promised.push(peer.clone());
                }
                Ok(Ok(_)) => {
                    debug!(node_id = self.me, peer = peer.id, "Prepare rejected");
                }
                Ok(Err(e)) if e.is_retryable() => {
                    debug!(node_id = self.me, peer = peer.id, error = %e, "Prepare failed");
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(node_id = self.me, peer = peer.id, "Prepare timed out");
                }
            }
        }

        if promised.len() < majority(nodes.len()) {
            debug!(
                node_id = self.me,
                instance,
                promised = promised.len(),
                "No prepare majority"
            );
            return Ok(None);
        }

        if best.is_proposal() {
            debug!(node_id = self.me, instance, adopted = %best, "Carrying previously accepted value");
        }
        Ok(Some((promised, chosen)))
    }

    /// Phase two against the peers that promised.
    async fn accept_phase(
        &self,
        instance: PaxosInstance,
        number: ProposalNumber,
        value: &str,
        peers: &[Peer],
    ) -> Result<Vec<Peer>> {
        let calls = peers.iter().map(|peer| async move {
            let request = AcceptRequest {
                instance,
                number,
                value: value.to_string(),
            };
            let reply = timeout(self.rpc_timeout, self.transport.accept(peer, request)).await;
            (peer, reply)
        });

        let mut accepted = Vec::new();
        for (peer, reply) in join_all(calls).await {
            match reply {
                Ok(Ok(resp)) if resp.accepted => accepted.push(peer.clone()),
                Ok(Ok(_)) => {
                    debug!(node_id = self.me, peer = peer.id, "Accept rejected");
                }
                Ok(Err(e)) if e.is_retryable() => {
                    debug!(node_id = self.me, peer = peer.id, error = %e, "Accept failed");
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(node_id = self.me, peer = peer.id, "Accept timed out");
                }
            }
        }
        Ok(accepted)
    }

    /// Commit locally, then tell the accepting peers. The broadcast is
    /// best-effort; a peer that misses it learns the value from a later
    /// prepare.
    async fn decide_phase(
        &self,
        instance: PaxosInstance,
        value: &str,
        peers: &[Peer],
    ) -> Result<()> {
        self.acceptor.commit(instance, value)?;

        let calls = peers
            .iter()
            .filter(|peer| peer.id != self.me)
            .map(|peer| async move {
                let request = DecideRequest {
                    instance,
                    value: value.to_string(),
                };
                let reply = timeout(self.rpc_timeout, self.transport.decide(peer, request)).await;
                (peer, reply)
            });

        for (peer, reply) in join_all(calls).await {
            match reply {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(node_id = self.me, peer = peer.id, error = %e, "Decide broadcast failed");
                }
                Err(_) => {
                    warn!(node_id = self.me, peer = peer.id, "Decide broadcast timed out");
                }
            }
        }

        counter!("lockstep_paxos_decided_total").increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::storage::MemWal;
    use crate::paxos::NoFaults;
    use crate::transport::mock::MockAcceptors;

    struct FlagFaults {
        point: Mutex<Option<CrashPoint>>,
    }

    impl FlagFaults {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                point: Mutex::new(None),
            })
        }

        fn arm(&self, point: CrashPoint) {
            *self.point.lock() = Some(point);
        }

        fn disarm(&self) {
            *self.point.lock() = None;
        }
    }

    impl FaultInjector for FlagFaults {
        fn crashed(&self, point: CrashPoint) -> bool {
            *self.point.lock() == Some(point)
        }
    }

    fn proposer_on(cluster: &Arc<MockAcceptors>, me: NodeId) -> Proposer<MemWal> {
        proposer_with_faults(cluster, me, Arc::new(NoFaults))
    }

    fn proposer_with_faults(
        cluster: &Arc<MockAcceptors>,
        me: NodeId,
        faults: Arc<dyn FaultInjector>,
    ) -> Proposer<MemWal> {
        Proposer::new(
            me,
            cluster.acceptor(me),
            Arc::clone(cluster) as Arc<dyn AcceptorTransport>,
            faults,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_decides_with_full_cluster() {
        let cluster = MockAcceptors::new(&[1, 2, 3]);
        let peers = cluster.peers();
        let proposer = proposer_on(&cluster, 1);

        let decided = proposer.run(1, &peers, "view-1").await.unwrap();
        assert!(decided);

        for id in [1, 2, 3] {
            assert_eq!(
                cluster.acceptor(id).decided_value(1).as_deref(),
                Some("view-1")
            );
        }
    }

    #[tokio::test]
    async fn test_decides_with_minority_down() {
        let cluster = MockAcceptors::new(&[1, 2, 3]);
        let peers = cluster.peers();
        cluster.set_down(3);

        let proposer = proposer_on(&cluster, 1);
        let decided = proposer.run(1, &peers, "view-1").await.unwrap();
        assert!(decided);
        assert_eq!(
            cluster.acceptor(2).decided_value(1).as_deref(),
            Some("view-1")
        );
        assert_eq!(cluster.acceptor(3).decided_value(1), None);

        // The recovered node catches up through its own round: its prepare
        // hits oldinstance replies and it adopts the decided value.
        cluster.set_up(3);
        let late = proposer_on(&cluster, 3);
        let decided = late.run(1, &peers, "view-other").await.unwrap();
        assert!(!decided);
        assert_eq!(
            cluster.acceptor(3).decided_value(1).as_deref(),
            Some("view-1")
        );
    }

    #[tokio::test]
    async fn test_no_majority_means_no_decision() {
        let cluster = MockAcceptors::new(&[1, 2, 3]);
        let peers = cluster.peers();
        cluster.set_down(2);
        cluster.set_down(3);

        let proposer = proposer_on(&cluster, 1);
        let decided = proposer.run(1, &peers, "view-1").await.unwrap();
        assert!(!decided);
        assert_eq!(cluster.acceptor(1).decided_value(1), None);
    }

    #[tokio::test]
    async fn test_adopts_previously_accepted_value() {
        let cluster = MockAcceptors::new(&[1, 2, 3]);
        let peers = cluster.peers();

        // A partial earlier round got "view-a" accepted on a majority.
        let stale = ProposalNumber::new(1, 1);
        for id in [1, 2] {
            let acceptor = cluster.acceptor(id);
            acceptor
                .handle_prepare(PrepareRequest {
                    instance: 1,
                    number: stale,
                    value: String::new(),
                })
                .unwrap();
            acceptor
                .handle_accept(AcceptRequest {
                    instance: 1,
                    number: stale,
                    value: "view-a".to_string(),
                })
                .unwrap();
        }

        let proposer = proposer_on(&cluster, 3);
        let decided = proposer.run(1, &peers, "view-b").await.unwrap();
        assert!(decided);

        for id in [1, 2, 3] {
            assert_eq!(
                cluster.acceptor(id).decided_value(1).as_deref(),
                Some("view-a")
            );
        }
    }

    #[tokio::test]
    async fn test_single_flight_rejects_overlapping_run() {
        let cluster = MockAcceptors::new(&[1, 2, 3]);
        cluster.set_delay(Duration::from_millis(50));
        let peers = cluster.peers();
        let proposer = Arc::new(proposer_on(&cluster, 1));

        let first = {
            let proposer = Arc::clone(&proposer);
            let peers = peers.clone();
            tokio::spawn(async move { proposer.run(1, &peers, "view-a").await })
        };
        let second = {
            let proposer = Arc::clone(&proposer);
            let peers = peers.clone();
            tokio::spawn(async move { proposer.run(1, &peers, "view-b").await })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_injected_crash_aborts_round_then_recovers() {
        let cluster = MockAcceptors::new(&[1, 2, 3]);
        let peers = cluster.peers();
        let faults = FlagFaults::new();
        let proposer = proposer_with_faults(&cluster, 1, faults.clone());

        faults.arm(CrashPoint::AfterPrepare);
        let err = proposer.run(1, &peers, "view-1").await.unwrap_err();
        assert!(matches!(err, LockstepError::ProposalAborted(_)));
        assert_eq!(cluster.acceptor(2).decided_value(1), None);

        faults.disarm();
        let decided = proposer.run(1, &peers, "view-1").await.unwrap();
        assert!(decided);
        assert_eq!(
            cluster.acceptor(2).decided_value(1).as_deref(),
            Some("view-1")
        );
    }

    #[tokio::test]
    async fn test_crash_after_accept_preserves_chosen_value() {
        let cluster = MockAcceptors::new(&[1, 2, 3]);
        let peers = cluster.peers();
        let faults = FlagFaults::new();

        // The first proposer dies after its value was accepted by a
        // majority but before anyone learned the decision.
        let doomed = proposer_with_faults(&cluster, 1, faults.clone());
        faults.arm(CrashPoint::AfterAccept);
        let err = doomed.run(1, &peers, "view-a").await.unwrap_err();
        assert!(matches!(err, LockstepError::ProposalAborted(_)));
        assert_eq!(cluster.acceptor(1).decided_value(1), None);

        // Any later round must converge on the accepted value.
        let successor = proposer_on(&cluster, 2);
        let decided = successor.run(1, &peers, "view-b").await.unwrap();
        assert!(decided);
        for id in [1, 2, 3] {
            assert_eq!(
                cluster.acceptor(id).decided_value(1).as_deref(),
                Some("view-a")
            );
        }
    }
}
