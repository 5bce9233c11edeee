//! Append-only journal backing the batch writer's acknowledgement.
//!
//! A mutation is acknowledged only after its `Enqueued` record is durable.
//! Flush and dead-letter markers retire it; anything not retired is replayed
//! on the next start. A dead-letter marker carries the letters themselves,
//! which stay owed until a `DeadLetterStored` marker says the store has them.

mod file;
mod memory;

pub use file::FileJournal;
pub use memory::MemoryJournal;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::BatchError;
use crate::mutation::{BatchedMutation, DeadLetter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum JournalRecord {
    Enqueued(BatchedMutation),
    Flushed { seqs: Vec<u64> },
    DeadLettered { letters: Vec<DeadLetter> },
    /// Dead letters, by mutation id, now persisted in the store.
    DeadLetterStored { ids: Vec<String> },
}

#[async_trait]
pub trait Journal: Send + Sync {
    /// Durably append records, in order.
    async fn append(&self, records: &[JournalRecord]) -> Result<(), BatchError>;

    /// Every record, oldest first.
    async fn records(&self) -> Result<Vec<JournalRecord>, BatchError>;

    /// Drop every record. Only called when nothing journaled is outstanding.
    async fn truncate(&self) -> Result<(), BatchError>;

    fn name(&self) -> &'static str;
}

pub type DynJournal = Arc<dyn Journal>;

/// What a journal still owes after a restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replay {
    /// Enqueued but neither flushed nor dead-lettered, in sequence order.
    pub outstanding: Vec<BatchedMutation>,
    /// Dead letters not yet persisted in the store, oldest first.
    pub unstored_dead_letters: Vec<DeadLetter>,
}

pub fn replay(records: Vec<JournalRecord>) -> Replay {
    let mut pending = BTreeMap::new();
    let mut letters: Vec<DeadLetter> = Vec::new();
    for record in records {
        match record {
            JournalRecord::Enqueued(mutation) => {
                pending.insert(mutation.seq, mutation);
            }
            JournalRecord::Flushed { seqs } => {
                for seq in seqs {
                    pending.remove(&seq);
                }
            }
            JournalRecord::DeadLettered { letters: failed } => {
                for letter in &failed {
                    pending.remove(&letter.mutation.seq);
                }
                letters.extend(failed);
            }
            JournalRecord::DeadLetterStored { ids } => {
                let stored: HashSet<String> = ids.into_iter().collect();
                letters.retain(|letter| !stored.contains(&letter.mutation.id));
            }
        }
    }
    Replay {
        outstanding: pending.into_values().collect(),
        unstored_dead_letters: letters,
    }
}

/// Mutations that were enqueued but neither flushed nor dead-lettered, in
/// sequence order.
pub fn outstanding(records: Vec<JournalRecord>) -> Vec<BatchedMutation> {
    replay(records).outstanding
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;
    use wiseup_storage::RowOperation;

    fn mutation(seq: u64) -> BatchedMutation {
        BatchedMutation {
            id: format!("m{seq}"),
            seq,
            target_table: "stat".into(),
            target_key: "k".into(),
            operation: RowOperation::Increment { delta: 1 },
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }

    fn letter(seq: u64) -> DeadLetter {
        DeadLetter {
            mutation: mutation(seq),
            error: "store unavailable".into(),
            attempts: 3,
            failed_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_dead_letters_owed_until_stored() {
        let replayed = replay(vec![
            JournalRecord::Enqueued(mutation(1)),
            JournalRecord::Enqueued(mutation(2)),
            JournalRecord::Enqueued(mutation(3)),
            JournalRecord::Flushed { seqs: vec![1] },
            JournalRecord::DeadLettered {
                letters: vec![letter(2), letter(3)],
            },
            JournalRecord::DeadLetterStored {
                ids: vec!["m2".into()],
            },
        ]);
        assert!(replayed.outstanding.is_empty());
        assert_eq!(replayed.unstored_dead_letters.len(), 1);
        assert_eq!(replayed.unstored_dead_letters[0].mutation.id, "m3");
        assert_eq!(replayed.unstored_dead_letters[0].error, "store unavailable");
    }
}
