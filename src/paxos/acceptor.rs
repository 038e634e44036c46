//! Paxos acceptor.
//!
//! Holds the promise state for the current instance and the history of
//! decided values. Every promise, accepted proposal, and decision is
//! appended to the durable log before the reply goes out, so a restarted
//! acceptor never walks back a promise it already made.

use crate::error::Result;
use crate::paxos::messages::{
    AcceptRequest, AcceptResponse, DecideRequest, DecideResponse, PrepareRequest, PrepareResponse,
};
use crate::paxos::storage::{WalRecord, WalStore};
use crate::paxos::CommitHandler;
use crate::types::{NodeId, PaxosInstance, ProposalNumber};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

struct AcceptorState {
    /// Highest proposal number promised in the current instance.
    n_h: ProposalNumber,
    /// Highest proposal number accepted in the current instance.
    n_a: ProposalNumber,
    /// Value of the highest accepted proposal.
    v_a: String,
    /// Highest decided instance.
    instance_h: PaxosInstance,
    /// Decided values, by instance.
    values: BTreeMap<PaxosInstance, String>,
}

impl AcceptorState {
    fn fresh(me: NodeId) -> Self {
        Self {
            n_h: ProposalNumber::zero(me),
            n_a: ProposalNumber::zero(me),
            v_a: String::new(),
            instance_h: 0,
            values: BTreeMap::new(),
        }
    }

    /// Apply one log record. Decisions fold in the same promise reset the
    /// live path performs, so replay converges on the pre-crash state.
    fn apply(&mut self, me: NodeId, record: WalRecord) {
        match record {
            WalRecord::PromisedHigh { number } => self.n_h = number,
            WalRecord::AcceptedProposal { number, value } => {
                self.n_a = number;
                self.v_a = value;
            }
            WalRecord::DecidedInstance { instance, value } => {
                self.values.insert(instance, value);
                self.instance_h = instance;
                self.reset_promises(me);
            }
        }
    }

    fn reset_promises(&mut self, me: NodeId) {
        self.n_h = ProposalNumber::zero(me);
        self.n_a = ProposalNumber::zero(me);
        self.v_a.clear();
    }
}

/// The acceptor half of a replica's Paxos engine.
pub struct Acceptor<S: WalStore> {
    me: NodeId,
    inner: Mutex<AcceptorState>,
    wal: S,
    commit: Arc<dyn CommitHandler>,
}

impl<S: WalStore> Acceptor<S> {
    /// Open an acceptor over a durable log, replaying any existing records.
    ///
    /// Replay does not re-deliver commit upcalls; callers reseed their view
    /// of decided instances from [`Acceptor::decided`]. A fresh acceptor
    /// given an initial view self-commits it as instance 1 so the first
    /// configuration exists before any proposer runs.
    pub fn open(
        me: NodeId,
        wal: S,
        commit: Arc<dyn CommitHandler>,
        initial_view: Option<&str>,
    ) -> Result<Self> {
        let mut state = AcceptorState::fresh(me);
        let records = wal.replay()?;
        let replayed = records.len();
        for record in records {
            state.apply(me, record);
        }
        if replayed > 0 {
            info!(
                node_id = me,
                records = replayed,
                instance = state.instance_h,
                "Replayed acceptor log"
            );
        }

        let acceptor = Self {
            me,
            inner: Mutex::new(state),
            wal,
            commit,
        };

        if acceptor.highest_instance() == 0 {
            if let Some(view) = initial_view.filter(|v| !v.is_empty()) {
                info!(node_id = me, view = %view, "Seeding initial view");
                acceptor.commit(1, view)?;
            }
        }

        Ok(acceptor)
    }

    /// Phase-one handler.
    pub fn handle_prepare(&self, req: PrepareRequest) -> Result<PrepareResponse> {
        let mut state = self.inner.lock();

        if req.instance <= state.instance_h {
            let decided = state.values.get(&req.instance).cloned().unwrap_or_default();
            debug!(
                node_id = self.me,
                instance = req.instance,
                "Rejecting prepare for decided instance"
            );
            return Ok(PrepareResponse {
                old_instance: true,
                accept: false,
                accepted_number: ProposalNumber::zero(self.me),
                accepted_value: decided,
            });
        }

        if req.number > state.n_h {
            state.n_h = req.number;
            self.wal.append(&WalRecord::PromisedHigh { number: req.number })?;
            debug!(
                node_id = self.me,
                instance = req.instance,
                number = %req.number,
                "Promised proposal"
            );
            Ok(PrepareResponse {
                old_instance: false,
                accept: true,
                accepted_number: state.n_a,
                accepted_value: state.v_a.clone(),
            })
        } else {
            debug!(
                node_id = self.me,
                number = %req.number,
                promised = %state.n_h,
                "Rejecting prepare below promise"
            );
            Ok(PrepareResponse::reject())
        }
    }

    /// Phase-two handler.
    pub fn handle_accept(&self, req: AcceptRequest) -> Result<AcceptResponse> {
        let mut state = self.inner.lock();

        if req.instance <= state.instance_h {
            return Ok(AcceptResponse { accepted: false });
        }

        if req.number >= state.n_h {
            state.n_a = req.number;
            state.v_a = req.value.clone();
            self.wal.append(&WalRecord::AcceptedProposal {
                number: req.number,
                value: req.value,
            })?;
            debug!(
                node_id = self.me,
                instance = req.instance,
                number = %req.number,
                "Accepted proposal"
            );
            Ok(AcceptResponse { accepted: true })
        } else {
            Ok(AcceptResponse { accepted: false })
        }
    }

    /// Decide handler. Also reached locally when this node's proposer wins.
    pub fn handle_decide(&self, req: DecideRequest) -> Result<DecideResponse> {
        self.commit(req.instance, &req.value)?;
        Ok(DecideResponse { committed: true })
    }

    /// Record a decided instance, reset promise state for the next one, and
    /// deliver the commit upcall. Duplicate decides are idempotent no-ops.
    pub fn commit(&self, instance: PaxosInstance, value: &str) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if instance <= state.instance_h {
                debug!(
                    node_id = self.me,
                    instance, "Ignoring duplicate decide"
                );
                return Ok(());
            }

            self.wal.append(&WalRecord::DecidedInstance {
                instance,
                value: value.to_string(),
            })?;
            state.values.insert(instance, value.to_string());
            state.instance_h = instance;
            state.reset_promises(self.me);
        }

        info!(node_id = self.me, instance, value = %value, "Decided instance");
        counter!("lockstep_paxos_commits_total").increment(1);

        // Upcall with no internal lock held.
        self.commit.committed(instance, value);
        Ok(())
    }

    /// Highest proposal number promised so far; proposers pick above this.
    pub fn highest_promised(&self) -> ProposalNumber {
        self.inner.lock().n_h
    }

    /// Highest decided instance.
    pub fn highest_instance(&self) -> PaxosInstance {
        self.inner.lock().instance_h
    }

    /// Decided value for one instance, if that instance has been decided.
    pub fn decided_value(&self, instance: PaxosInstance) -> Option<String> {
        self.inner.lock().values.get(&instance).cloned()
    }

    /// All decided instances, in order.
    pub fn decided(&self) -> BTreeMap<PaxosInstance, String> {
        self.inner.lock().values.clone()
    }

    /// Serialize the durable log for consensus-layer state transfer.
    pub fn dump(&self) -> Result<Vec<u8>> {
        self.wal.dump()
    }

    /// Replace the durable log and rebuild in-memory state from it.
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        self.wal.restore(bytes)?;
        let mut rebuilt = AcceptorState::fresh(self.me);
        for record in self.wal.replay()? {
            rebuilt.apply(self.me, record);
        }
        let instance = rebuilt.instance_h;
        *self.inner.lock() = rebuilt;
        info!(node_id = self.me, instance, "Restored acceptor state");
        Ok(())
    }
}
