use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::{Journal, JournalRecord};
use crate::error::BatchError;

/// Journal kept in memory. Clones share the same records, which lets tests
/// simulate a restart by building a new writer over the same journal.
#[derive(Clone, Default)]
pub struct MemoryJournal {
    records: Arc<Mutex<Vec<JournalRecord>>>,
    failing: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
    appends: Arc<AtomicUsize>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every append fail, as a full disk would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every append, as a slow `fsync` would.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `append` calls made.
    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, records: &[JournalRecord]) -> Result<(), BatchError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BatchError::Journal("memory journal failing".into()));
        }
        self.records.lock().extend_from_slice(records);
        Ok(())
    }

    async fn records(&self) -> Result<Vec<JournalRecord>, BatchError> {
        Ok(self.records.lock().clone())
    }

    async fn truncate(&self) -> Result<(), BatchError> {
        self.records.lock().clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
