//! Durable log for the Paxos acceptor.
//!
//! Every promise, accepted proposal, and decided instance is appended here
//! before the acceptor replies, so a restarted node replays the log and
//! resumes with the exact promises it made.

use crate::error::{LockstepError, Result};
use crate::types::{PaxosInstance, ProposalNumber};
use parking_lot::Mutex;
use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

const RECORD_PREFIX: &[u8] = b"paxos_wal_";

/// One durable log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    /// The acceptor promised not to accept proposals below this number.
    PromisedHigh { number: ProposalNumber },
    /// The acceptor accepted a proposal.
    AcceptedProposal {
        number: ProposalNumber,
        value: String,
    },
    /// An instance was decided.
    DecidedInstance {
        instance: PaxosInstance,
        value: String,
    },
}

/// Append-only durable log consumed by the acceptor.
///
/// `append` must make the record durable before returning; `replay` returns
/// every record in append order. `dump`/`restore` serialize the whole log
/// for tests and consensus-layer state transfer.
pub trait WalStore: Send + Sync + 'static {
    fn append(&self, record: &WalRecord) -> Result<()>;
    fn replay(&self) -> Result<Vec<WalRecord>>;

    fn dump(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.replay()?)?)
    }

    fn restore(&self, bytes: &[u8]) -> Result<()>;
}

impl<T: WalStore> WalStore for std::sync::Arc<T> {
    fn append(&self, record: &WalRecord) -> Result<()> {
        (**self).append(record)
    }

    fn replay(&self) -> Result<Vec<WalRecord>> {
        (**self).replay()
    }

    fn dump(&self) -> Result<Vec<u8>> {
        (**self).dump()
    }

    fn restore(&self, bytes: &[u8]) -> Result<()> {
        (**self).restore(bytes)
    }
}

/// RocksDB-backed durable log.
///
/// Records live under a dedicated key prefix with big-endian sequence
/// numbers, so a forward iteration yields them in append order.
pub struct RocksWal {
    db: DB,
    next_seq: AtomicU64,
}

impl RocksWal {
    /// Open or create a durable log at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;

        // Resume the sequence counter after the highest stored record.
        let mut next_seq = 0u64;
        let iter = db.iterator(rocksdb::IteratorMode::From(
            RECORD_PREFIX,
            rocksdb::Direction::Forward,
        ));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(RECORD_PREFIX) {
                break;
            }
            next_seq = parse_record_key(&key)? + 1;
        }

        Ok(Self {
            db,
            next_seq: AtomicU64::new(next_seq),
        })
    }

    fn clear(&self) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            RECORD_PREFIX,
            rocksdb::Direction::Forward,
        ));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(RECORD_PREFIX) {
                break;
            }
            batch.delete(&key);
        }
        self.db.write(batch)?;
        self.next_seq.store(0, Ordering::SeqCst);
        Ok(())
    }
}

impl WalStore for RocksWal {
    fn append(&self, record: &WalRecord) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let value = bincode::serialize(record)?;
        self.db.put(record_key(seq), value)?;
        self.db.flush()?;
        Ok(())
    }

    fn replay(&self) -> Result<Vec<WalRecord>> {
        let mut records = Vec::new();
        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            RECORD_PREFIX,
            rocksdb::Direction::Forward,
        ));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(RECORD_PREFIX) {
                break;
            }
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }

    fn restore(&self, bytes: &[u8]) -> Result<()> {
        let records: Vec<WalRecord> = bincode::deserialize(bytes)?;
        self.clear()?;
        let mut batch = rocksdb::WriteBatch::default();
        for (seq, record) in records.iter().enumerate() {
            batch.put(record_key(seq as u64), bincode::serialize(record)?);
        }
        self.db.write(batch)?;
        self.db.flush()?;
        self.next_seq.store(records.len() as u64, Ordering::SeqCst);
        Ok(())
    }
}

fn record_key(seq: u64) -> Vec<u8> {
    let mut key = RECORD_PREFIX.to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn parse_record_key(key: &[u8]) -> Result<u64> {
    if key.len() < RECORD_PREFIX.len() + 8 {
        return Err(LockstepError::Storage("Invalid log key".into()));
    }
    let seq_bytes: [u8; 8] = key[RECORD_PREFIX.len()..]
        .try_into()
        .map_err(|_| LockstepError::Storage("Invalid log key".into()))?;
    Ok(u64::from_be_bytes(seq_bytes))
}

/// In-memory log for tests and ephemeral acceptors.
#[derive(Default)]
pub struct MemWal {
    records: Mutex<Vec<WalRecord>>,
}

impl MemWal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WalStore for MemWal {
    fn append(&self, record: &WalRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn replay(&self) -> Result<Vec<WalRecord>> {
        Ok(self.records.lock().clone())
    }

    fn restore(&self, bytes: &[u8]) -> Result<()> {
        let records: Vec<WalRecord> = bincode::deserialize(bytes)?;
        *self.records.lock() = records;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_records() -> Vec<WalRecord> {
        vec![
            WalRecord::PromisedHigh {
                number: ProposalNumber::new(1, 2),
            },
            WalRecord::AcceptedProposal {
                number: ProposalNumber::new(1, 2),
                value: "view-1".to_string(),
            },
            WalRecord::DecidedInstance {
                instance: 1,
                value: "view-1".to_string(),
            },
        ]
    }

    #[test]
    fn test_rocks_append_replay() {
        let dir = tempdir().unwrap();
        let wal = RocksWal::open(dir.path()).unwrap();

        for record in sample_records() {
            wal.append(&record).unwrap();
        }

        let replayed = wal.replay().unwrap();
        assert_eq!(replayed, sample_records());
    }

    #[test]
    fn test_rocks_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let wal = RocksWal::open(dir.path()).unwrap();
            for record in sample_records() {
                wal.append(&record).unwrap();
            }
        }

        let wal = RocksWal::open(dir.path()).unwrap();
        assert_eq!(wal.replay().unwrap(), sample_records());

        // New appends land after the replayed ones.
        wal.append(&WalRecord::PromisedHigh {
            number: ProposalNumber::new(7, 1),
        })
        .unwrap();
        let replayed = wal.replay().unwrap();
        assert_eq!(replayed.len(), 4);
        assert_eq!(
            replayed[3],
            WalRecord::PromisedHigh {
                number: ProposalNumber::new(7, 1)
            }
        );
    }

    #[test]
    fn test_dump_restore_replaces_contents() {
        let dir = tempdir().unwrap();
        let source = MemWal::new();
        for record in sample_records() {
            source.append(&record).unwrap();
        }

        let target = RocksWal::open(dir.path()).unwrap();
        target
            .append(&WalRecord::PromisedHigh {
                number: ProposalNumber::new(99, 9),
            })
            .unwrap();

        target.restore(&source.dump().unwrap()).unwrap();
        assert_eq!(target.replay().unwrap(), sample_records());
    }

    #[test]
    fn test_mem_wal_round_trip() {
        let wal = MemWal::new();
        for record in sample_records() {
            wal.append(&record).unwrap();
        }

        let other = MemWal::new();
        other.restore(&wal.dump().unwrap()).unwrap();
        assert_eq!(other.replay().unwrap(), sample_records());
    }
}
