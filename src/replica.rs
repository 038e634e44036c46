//! Replica-level glue between consensus and the lock authority.
//!
//! [`ViewLog`] accumulates decided configuration values. [`ReplicaRole`]
//! gates outbound callbacks to the primary. [`StateTransfer`] is the
//! capability a replicated service implements so a catching-up replica can
//! be brought to the current state.

use crate::error::Result;
use crate::paxos::CommitHandler;
use crate::types::{PaxosInstance, Peer};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Serialize a service's full state for replica catch-up.
///
/// The replica harness holds this capability by reference: `marshal` on
/// the node handing state over, `unmarshal` on the node catching up.
pub trait StateTransfer: Send + Sync {
    fn marshal(&self) -> Result<Vec<u8>>;
    fn unmarshal(&self, bytes: &[u8]) -> Result<()>;
}

/// Whether this replica currently acts as primary.
///
/// Backups apply the same mutations as the primary but must stay silent:
/// outbound revoke/retry callbacks are sent by the primary only.
pub struct ReplicaRole {
    primary: AtomicBool,
}

impl ReplicaRole {
    pub fn new(primary: bool) -> Self {
        Self {
            primary: AtomicBool::new(primary),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    pub fn set_primary(&self, primary: bool) {
        let was = self.primary.swap(primary, Ordering::SeqCst);
        if was != primary {
            info!(primary, "Replica role changed");
        }
    }
}

/// Decided configuration values, by instance.
#[derive(Default)]
pub struct ViewLog {
    views: RwLock<BTreeMap<PaxosInstance, String>>,
}

impl ViewLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install already-decided views, e.g. after an acceptor log replay.
    pub fn seed(&self, views: BTreeMap<PaxosInstance, String>) {
        let mut guard = self.views.write();
        for (instance, value) in views {
            guard.entry(instance).or_insert(value);
        }
    }

    pub fn view(&self, instance: PaxosInstance) -> Option<String> {
        self.views.read().get(&instance).cloned()
    }

    pub fn latest(&self) -> Option<(PaxosInstance, String)> {
        self.views
            .read()
            .iter()
            .next_back()
            .map(|(instance, value)| (*instance, value.clone()))
    }

    /// The members of the most recent view.
    pub fn latest_peers(&self) -> Result<Vec<Peer>> {
        match self.latest() {
            Some((_, view)) => parse_view(&view),
            None => Ok(Vec::new()),
        }
    }

    /// The instance the next proposal should target.
    pub fn next_instance(&self) -> PaxosInstance {
        self.latest().map(|(instance, _)| instance).unwrap_or(0) + 1
    }
}

impl CommitHandler for ViewLog {
    fn committed(&self, instance: PaxosInstance, value: &str) {
        self.views.write().insert(instance, value.to_string());
        info!(instance, view = %value, "View committed");
    }
}

/// Parse a comma-separated view value into its member peers.
pub fn parse_view(view: &str) -> Result<Vec<Peer>> {
    view.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_flips_once() {
        let role = ReplicaRole::new(false);
        assert!(!role.is_primary());
        role.set_primary(true);
        role.set_primary(true);
        assert!(role.is_primary());
        role.set_primary(false);
        assert!(!role.is_primary());
    }

    #[test]
    fn test_view_log_tracks_latest() {
        let log = ViewLog::new();
        assert_eq!(log.latest(), None);
        assert_eq!(log.next_instance(), 1);

        log.committed(1, "1=a:1,2=b:2");
        log.committed(2, "1=a:1");
        assert_eq!(log.view(1).as_deref(), Some("1=a:1,2=b:2"));
        assert_eq!(log.latest(), Some((2, "1=a:1".to_string())));
        assert_eq!(log.next_instance(), 3);
    }

    #[test]
    fn test_seed_does_not_clobber_commits() {
        let log = ViewLog::new();
        log.committed(2, "live");

        let mut replayed = BTreeMap::new();
        replayed.insert(1, "old".to_string());
        replayed.insert(2, "stale".to_string());
        log.seed(replayed);

        assert_eq!(log.view(1).as_deref(), Some("old"));
        assert_eq!(log.view(2).as_deref(), Some("live"));
    }

    #[test]
    fn test_parse_view() {
        let peers = parse_view("1=10.0.0.1:7000, 2=10.0.0.2:7000").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1], Peer::new(2, "10.0.0.2:7000"));

        assert!(parse_view("nonsense").is_err());
        assert_eq!(parse_view("").unwrap(), Vec::new());
    }
}
