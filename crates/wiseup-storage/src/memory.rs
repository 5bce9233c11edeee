//! In-memory authoritative store.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::StoreError;
use crate::traits::AuthoritativeStore;
use crate::types::{BatchOutcome, MutationBatch, RowOperation, StoredRow, row_key};

/// How many applied batch ids are remembered for duplicate detection.
const APPLIED_BATCH_MEMORY: usize = 65_536;

/// One operation as observed by the store, in application order.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOperation {
    pub table: String,
    pub key: String,
    pub operation: RowOperation,
}

#[derive(Default)]
struct AppliedBatches {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl AppliedBatches {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn remember(&mut self, id: &str) {
        if self.ids.insert(id.to_string()) {
            self.order.push_back(id.to_string());
            while self.order.len() > APPLIED_BATCH_MEMORY {
                if let Some(old) = self.order.pop_front() {
                    self.ids.remove(&old);
                }
            }
        }
    }
}

/// Row store backed by a sharded concurrent map.
///
/// Each row lives in one DashMap entry, so holding the entry gives single-row
/// atomicity. Fault injection (`set_available`, `fail_next`, `set_latency`)
/// lets callers exercise degraded and retry paths.
pub struct MemoryStore {
    rows: DashMap<String, StoredRow>,
    applied_batches: Mutex<AppliedBatches>,
    operation_log: Option<Mutex<Vec<AppliedOperation>>>,
    available: AtomicBool,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            applied_batches: Mutex::new(AppliedBatches::default()),
            operation_log: None,
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Store that records every batch operation it applies.
    pub fn with_operation_log() -> Self {
        Self {
            operation_log: Some(Mutex::new(Vec::new())),
            ..Self::new()
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Operations applied so far for one row, oldest first.
    pub fn operations_for(&self, table: &str, key: &str) -> Vec<RowOperation> {
        self.operation_log
            .as_ref()
            .map(|log| {
                log.lock()
                    .iter()
                    .filter(|op| op.table == table && op.key == key)
                    .map(|op| op.operation.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    async fn check_faults(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory store offline"));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::unavailable("injected failure"));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_operation(
    table: &str,
    key: &str,
    current: Option<Value>,
    operation: &RowOperation,
) -> Result<Option<Value>, StoreError> {
    match operation {
        RowOperation::Insert { value } => match current {
            Some(_) => Err(StoreError::already_exists(table, key)),
            None => Ok(Some(value.clone())),
        },
        RowOperation::Upsert { value } => Ok(Some(value.clone())),
        RowOperation::Delete => Ok(None),
        RowOperation::Increment { delta } => {
            let base = match current {
                None => 0,
                Some(v) => v.as_i64().ok_or_else(|| {
                    StoreError::serialization(format!("{table}/{key} is not an integer counter"))
                })?,
            };
            let next = base
                .checked_add(*delta)
                .ok_or_else(|| StoreError::internal(format!("{table}/{key} counter overflow")))?;
            Ok(Some(Value::from(next)))
        }
    }
}

fn new_row(table: &str, key: &str, value: Value) -> StoredRow {
    StoredRow {
        table: table.to_string(),
        key: key.to_string(),
        value,
        version: 1,
        updated_at: OffsetDateTime::now_utc(),
    }
}

#[async_trait]
impl AuthoritativeStore for MemoryStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRow>, StoreError> {
        self.check_faults().await?;
        Ok(self.rows.get(&row_key(table, key)).map(|r| r.clone()))
    }

    async fn put(&self, table: &str, key: &str, value: Value) -> Result<u64, StoreError> {
        self.check_faults().await?;
        match self.rows.entry(row_key(table, key)) {
            Entry::Occupied(mut occupied) => {
                let row = occupied.get_mut();
                row.value = value;
                row.version += 1;
                row.updated_at = OffsetDateTime::now_utc();
                Ok(row.version)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(new_row(table, key, value));
                Ok(1)
            }
        }
    }

    async fn compare_and_put(
        &self,
        table: &str,
        key: &str,
        expected_version: Option<u64>,
        value: Value,
    ) -> Result<u64, StoreError> {
        self.check_faults().await?;
        match self.rows.entry(row_key(table, key)) {
            Entry::Occupied(mut occupied) => {
                let row = occupied.get_mut();
                if expected_version != Some(row.version) {
                    return Err(StoreError::version_conflict(
                        table,
                        key,
                        expected_version,
                        Some(row.version),
                    ));
                }
                row.value = value;
                row.version += 1;
                row.updated_at = OffsetDateTime::now_utc();
                Ok(row.version)
            }
            Entry::Vacant(vacant) => {
                if expected_version.is_some() {
                    return Err(StoreError::version_conflict(
                        table,
                        key,
                        expected_version,
                        None,
                    ));
                }
                vacant.insert(new_row(table, key, value));
                Ok(1)
            }
        }
    }

    async fn delete(&self, table: &str, key: &str) -> Result<bool, StoreError> {
        self.check_faults().await?;
        Ok(self.rows.remove(&row_key(table, key)).is_some())
    }

    async fn apply_batch(&self, batch: &MutationBatch) -> Result<BatchOutcome, StoreError> {
        self.check_faults().await?;

        let table = batch.table.as_str();
        let key = batch.key.as_str();
        let entry = self.rows.entry(row_key(table, key));

        if self.applied_batches.lock().contains(&batch.batch_id) {
            tracing::debug!(batch_id = %batch.batch_id, "duplicate batch ignored");
            return Ok(BatchOutcome::Duplicate);
        }

        let (mut value, version) = match &entry {
            Entry::Occupied(o) => (Some(o.get().value.clone()), o.get().version),
            Entry::Vacant(_) => (None, 0),
        };
        for operation in &batch.operations {
            value = apply_operation(table, key, value, operation)?;
        }

        let new_version = match (entry, value) {
            (Entry::Occupied(mut o), Some(v)) => {
                let row = o.get_mut();
                row.value = v;
                row.version += 1;
                row.updated_at = OffsetDateTime::now_utc();
                row.version
            }
            (Entry::Occupied(o), None) => {
                o.remove();
                0
            }
            (Entry::Vacant(v), Some(val)) => {
                let mut row = new_row(table, key, val);
                row.version = version + 1;
                v.insert(row).version
            }
            (Entry::Vacant(_), None) => 0,
        };

        self.applied_batches.lock().remember(&batch.batch_id);
        if let Some(log) = &self.operation_log {
            let mut log = log.lock();
            for operation in &batch.operations {
                log.push(AppliedOperation {
                    table: table.to_string(),
                    key: key.to_string(),
                    operation: operation.clone(),
                });
            }
        }

        Ok(BatchOutcome::Applied {
            version: new_version,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_faults().await
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(id: &str, key: &str, operations: Vec<RowOperation>) -> MutationBatch {
        MutationBatch {
            batch_id: id.to_string(),
            table: "stats".to_string(),
            key: key.to_string(),
            operations,
        }
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryStore::new();
        assert_eq!(store.put("users", "42", json!({"name": "Ada"})).await.unwrap(), 1);
        assert_eq!(store.put("users", "42", json!({"name": "Ada L."})).await.unwrap(), 2);

        let row = store.get("users", "42").await.unwrap().unwrap();
        assert_eq!(row.version, 2);
        assert_eq!(row.value["name"], "Ada L.");
        assert!(store.get("users", "43").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_put() {
        let store = MemoryStore::new();
        let v1 = store
            .compare_and_put("families", "f1", None, json!({"active": "a"}))
            .await
            .unwrap();
        assert_eq!(v1, 1);

        let conflict = store
            .compare_and_put("families", "f1", None, json!({"active": "x"}))
            .await
            .unwrap_err();
        assert!(conflict.is_version_conflict());

        let v2 = store
            .compare_and_put("families", "f1", Some(1), json!({"active": "b"}))
            .await
            .unwrap();
        assert_eq!(v2, 2);

        let stale = store
            .compare_and_put("families", "f1", Some(1), json!({"active": "c"}))
            .await
            .unwrap_err();
        assert!(stale.is_version_conflict());
        let row = store.get("families", "f1").await.unwrap().unwrap();
        assert_eq!(row.value["active"], "b");
    }

    #[tokio::test]
    async fn test_batch_increment_and_dedupe() {
        let store = MemoryStore::new();
        let b = batch(
            "b1",
            "logins",
            vec![
                RowOperation::Increment { delta: 3 },
                RowOperation::Increment { delta: 2 },
            ],
        );
        assert!(matches!(
            store.apply_batch(&b).await.unwrap(),
            BatchOutcome::Applied { version: 1 }
        ));
        assert_eq!(store.apply_batch(&b).await.unwrap(), BatchOutcome::Duplicate);

        let row = store.get("stats", "logins").await.unwrap().unwrap();
        assert_eq!(row.as_counter(), 5);
    }

    #[tokio::test]
    async fn test_failed_batch_is_not_remembered() {
        let store = MemoryStore::new();
        store.put("stats", "k", json!("text")).await.unwrap();
        let b = batch("b2", "k", vec![RowOperation::Increment { delta: 1 }]);
        assert!(store.apply_batch(&b).await.is_err());

        store.put("stats", "k", json!(10)).await.unwrap();
        store.apply_batch(&b).await.unwrap();
        assert_eq!(store.get("stats", "k").await.unwrap().unwrap().as_counter(), 11);
    }

    #[tokio::test]
    async fn test_insert_conflict_and_delete() {
        let store = MemoryStore::new();
        let insert = RowOperation::Insert { value: json!({"a": 1}) };
        store
            .apply_batch(&batch("i1", "row", vec![insert.clone()]))
            .await
            .unwrap();
        let err = store
            .apply_batch(&batch("i2", "row", vec![insert]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        let outcome = store
            .apply_batch(&batch("d1", "row", vec![RowOperation::Delete]))
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Applied { version: 0 });
        assert!(store.get("stats", "row").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        store.fail_next(2);
        assert!(store.ping().await.unwrap_err().is_transient());
        assert!(store.ping().await.is_err());
        assert!(store.ping().await.is_ok());

        store.set_available(false);
        assert!(store.get("a", "b").await.is_err());
    }

    #[tokio::test]
    async fn test_operation_log_preserves_order() {
        let store = MemoryStore::with_operation_log();
        for i in 0..5 {
            store
                .apply_batch(&batch(
                    &format!("b{i}"),
                    "seq",
                    vec![RowOperation::Upsert { value: json!(i) }],
                ))
                .await
                .unwrap();
        }
        let ops = store.operations_for("stats", "seq");
        let values: Vec<i64> = ops
            .iter()
            .filter_map(|op| match op {
                RowOperation::Upsert { value } => value.as_i64(),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }
}
