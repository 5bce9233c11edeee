//! Batch Writer.
//!
//! `enqueue` journals a mutation, queues it in its row's partition and
//! acknowledges; a background loop flushes partitions to the authoritative
//! store on a timer or when the backlog crosses `flush_threshold`.
//!
//! Journal appends are group-committed: callers stage their mutation, and
//! whichever of them takes the commit lock first writes everything staged so
//! far with one append, so concurrent enqueues share one `fsync`.
//!
//! Ordering: one flush cycle runs at a time and each partition is handled by
//! a single task within a cycle, so mutations to one row reach the store in
//! enqueue order. Different rows are flushed in parallel.
//!
//! Dead letters stay in the journal until their store row is written, and
//! later cycles retry those writes; the journal is not compacted past them.

use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use time::OffsetDateTime;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wiseup_cache::CacheTierManager;
use wiseup_core::retry_with_backoff;
use wiseup_storage::{
    BatchOutcome, DynStore, MutationBatch, RowOperation, StoreError, row_key,
};
use wiseup_telemetry::names::*;
use wiseup_telemetry::{EventLevel, MetricsAggregator, ObservabilityHub};

use crate::config::{BatchConfig, table_view_prefix};
use crate::error::BatchError;
use crate::journal::{DynJournal, JournalRecord, Replay, replay};
use crate::mutation::{Ack, BatchedMutation, DeadLetter, Mutation};

struct Queued {
    mutation: BatchedMutation,
    /// Released when the mutation leaves the writer.
    _permit: Option<OwnedSemaphorePermit>,
}

/// A mutation waiting for the next group commit.
struct Staged {
    mutation: BatchedMutation,
    permit: OwnedSemaphorePermit,
    committed: oneshot::Sender<Result<(), BatchError>>,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    flushed: AtomicU64,
    retries: AtomicU64,
    dead_letters: AtomicU64,
    flush_cycles: AtomicU64,
    journal_appends: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub pending: usize,
    pub partitions: usize,
    pub enqueued: u64,
    pub flushed: u64,
    pub retries: u64,
    pub dead_letters: u64,
    /// Dead letters journaled but not yet written to the store.
    pub unstored_dead_letters: usize,
    pub flush_cycles: u64,
    /// Group commits of enqueued mutations.
    pub journal_appends: u64,
}

/// Result of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub duplicates: usize,
    pub dead_lettered: usize,
    /// Still queued after the cycle (partitions longer than `max_batch_size`).
    pub remaining: usize,
}

enum PartitionOutcome {
    Applied(usize),
    Duplicate(usize),
    DeadLettered(usize),
}

pub struct BatchWriter {
    config: BatchConfig,
    store: DynStore,
    journal: DynJournal,
    cache: Option<Arc<CacheTierManager>>,
    metrics: Arc<MetricsAggregator>,
    hub: Option<Arc<ObservabilityHub>>,
    partitions: Mutex<HashMap<String, VecDeque<Queued>>>,
    capacity: Arc<Semaphore>,
    next_seq: AtomicU64,
    pending: AtomicUsize,
    /// Sequence numbers are assigned under this lock, so staged order is
    /// sequence order.
    staged: Mutex<Vec<Staged>>,
    /// Held by the caller committing staged mutations; keeps journal order,
    /// sequence order and queue order identical.
    enqueue_lock: tokio::sync::Mutex<()>,
    flush_lock: tokio::sync::Mutex<()>,
    pending_deltas: DashMap<String, i64>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    /// Dead letters whose store row has not been written yet.
    unstored: Mutex<Vec<DeadLetter>>,
    counters: Counters,
    notify: Notify,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchWriter {
    pub fn new(
        config: BatchConfig,
        store: DynStore,
        journal: DynJournal,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            capacity: Arc::new(Semaphore::new(config.max_pending.max(1))),
            config,
            store,
            journal,
            cache: None,
            metrics,
            hub: None,
            partitions: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            staged: Mutex::new(Vec::new()),
            enqueue_lock: tokio::sync::Mutex::new(()),
            flush_lock: tokio::sync::Mutex::new(()),
            pending_deltas: DashMap::new(),
            dead_letters: Mutex::new(Vec::new()),
            unstored: Mutex::new(Vec::new()),
            counters: Counters::default(),
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Cache kept consistent with queued writes (read-your-writes).
    pub fn with_cache(mut self, cache: Arc<CacheTierManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_hub(mut self, hub: Arc<ObservabilityHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Re-queue every journaled mutation that was never flushed and restore
    /// dead letters the store does not have yet. Call once, before `start`
    /// and before the first `enqueue`. Returns the number re-queued.
    pub async fn recover(&self) -> Result<usize, BatchError> {
        let Replay {
            outstanding: recovered,
            unstored_dead_letters,
        } = replay(self.journal.records().await?);
        if !unstored_dead_letters.is_empty() {
            tracing::warn!(
                count = unstored_dead_letters.len(),
                "recovered dead letters not yet written to the store"
            );
            self.dead_letters
                .lock()
                .extend(unstored_dead_letters.iter().cloned());
            self.unstored.lock().extend(unstored_dead_letters);
        }
        if recovered.is_empty() {
            return Ok(0);
        }
        let _order = self.enqueue_lock.lock().await;
        let count = recovered.len();
        let mut max_seq = 0;
        for mutation in recovered {
            max_seq = max_seq.max(mutation.seq);
            // Recovered work may exceed capacity; it is queued regardless.
            let permit = Arc::clone(&self.capacity).try_acquire_owned().ok();
            self.track_delta(&mutation, 1);
            self.push(Queued {
                mutation,
                _permit: permit,
            });
        }
        self.next_seq.fetch_max(max_seq + 1, Ordering::SeqCst);
        self.update_pending_gauge();
        tracing::info!(
            count,
            journal = self.journal.name(),
            "recovered unflushed mutations from journal"
        );
        Ok(count)
    }

    /// Start the background flush loop.
    pub fn start(self: &Arc<Self>) {
        let writer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(writer.config.flush_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = writer.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = writer.notify.notified() => {}
                }
                let report = writer.flush().await;
                if report.remaining >= writer.config.flush_threshold {
                    writer.notify.notify_one();
                }
            }
            tracing::debug!("batch flush loop stopped");
        });
        *self.task.lock() = Some(handle);
        tracing::info!(
            interval_ms = self.config.flush_interval.as_millis() as u64,
            threshold = self.config.flush_threshold,
            "batch writer started"
        );
    }

    /// Durably queue a mutation. Waits for capacity when `max_pending`
    /// mutations are outstanding. Returns once the journal append is durable;
    /// the store is written later.
    pub async fn enqueue(&self, mutation: Mutation) -> Result<Ack, BatchError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BatchError::ShuttingDown);
        }
        let permit = Arc::clone(&self.capacity)
            .acquire_owned()
            .await
            .map_err(|_| BatchError::ShuttingDown)?;

        let (committed, mut on_commit) = oneshot::channel();
        let batched = {
            let mut staged = self.staged.lock();
            let batched = BatchedMutation {
                id: uuid::Uuid::new_v4().to_string(),
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                target_table: mutation.table,
                target_key: mutation.key,
                operation: mutation.operation,
                enqueued_at: OffsetDateTime::now_utc(),
            };
            staged.push(Staged {
                mutation: batched.clone(),
                permit,
                committed,
            });
            batched
        };

        let outcome = {
            let _order = self.enqueue_lock.lock().await;
            match on_commit.try_recv() {
                // Committed by whoever held the lock before us.
                Ok(outcome) => outcome,
                Err(_) => {
                    self.commit_staged().await;
                    on_commit
                        .await
                        .unwrap_or_else(|_| Err(BatchError::Journal("commit abandoned".into())))
                }
            }
        };
        outcome?;

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment(
            BATCH_ENQUEUED_TOTAL,
            &[("operation", batched.operation.as_str())],
        );
        self.update_pending_gauge();
        self.sync_cache_on_enqueue(&batched).await;

        if self.pending.load(Ordering::SeqCst) >= self.config.flush_threshold {
            self.notify.notify_one();
        }
        Ok(Ack {
            id: batched.id,
            seq: batched.seq,
            enqueued_at: batched.enqueued_at,
        })
    }

    /// Run one flush cycle.
    pub async fn flush(&self) -> FlushReport {
        let _cycle = self.flush_lock.lock().await;
        let stored = self.retry_unstored_dead_letters().await;
        let work = self.take_work();
        if work.is_empty() {
            if stored > 0 {
                self.compact_journal().await;
            }
            return FlushReport::default();
        }
        let tables: BTreeSet<String> = work
            .iter()
            .filter_map(|items| items.first())
            .map(|queued| queued.mutation.target_table.clone())
            .collect();

        let span = self.hub.as_ref().map(|hub| hub.start_span("batch.flush"));
        let started = tokio::time::Instant::now();
        let concurrency = self.config.flush_concurrency.max(1);
        let outcomes: Vec<PartitionOutcome> = stream::iter(work)
            .map(|items| self.flush_partition(items))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = FlushReport::default();
        for outcome in outcomes {
            match outcome {
                PartitionOutcome::Applied(n) => report.applied += n,
                PartitionOutcome::Duplicate(n) => report.duplicates += n,
                PartitionOutcome::DeadLettered(n) => report.dead_lettered += n,
            }
        }
        report.remaining = self.pending.load(Ordering::SeqCst);

        if let Some(cache) = &self.cache {
            for table in &tables {
                cache.invalidate_prefix(&table_view_prefix(table)).await;
            }
        }

        self.counters.flush_cycles.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .observe_duration(BATCH_FLUSH_DURATION_MS, started.elapsed(), &[]);
        self.update_pending_gauge();
        if report.remaining == 0 {
            self.compact_journal().await;
        }
        if let Some(span) = span {
            span.succeed();
        }
        tracing::debug!(
            applied = report.applied,
            duplicates = report.duplicates,
            dead_lettered = report.dead_lettered,
            remaining = report.remaining,
            "flush cycle complete"
        );
        report
    }

    /// Flush until nothing is queued.
    pub async fn flush_all(&self) -> FlushReport {
        let mut total = FlushReport::default();
        loop {
            let report = self.flush().await;
            total.applied += report.applied;
            total.duplicates += report.duplicates;
            total.dead_lettered += report.dead_lettered;
            total.remaining = report.remaining;
            if report.remaining == 0 || report == FlushReport::default() {
                break;
            }
        }
        total
    }

    /// Stop accepting mutations, stop the loop, and drain the queue.
    pub async fn shutdown(&self) -> FlushReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let report = self.flush_all().await;
        self.capacity.close();
        tracing::info!(
            applied = report.applied,
            dead_lettered = report.dead_lettered,
            "batch writer drained"
        );
        report
    }

    /// Sum of queued increments for a row.
    pub fn pending_delta(&self, table: &str, key: &str) -> i64 {
        self.pending_deltas
            .get(&row_key(table, key))
            .map(|d| *d)
            .unwrap_or(0)
    }

    /// Counter value as the store will hold it once the queue drains: stored
    /// value plus queued increments. May briefly double count a batch that
    /// is being applied.
    pub async fn read_counter(&self, table: &str, key: &str) -> Result<i64, BatchError> {
        let stored = self
            .store
            .get(table, key)
            .await?
            .map(|row| row.as_counter())
            .unwrap_or(0);
        Ok(stored + self.pending_delta(table, key))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().clone()
    }

    pub fn stats(&self) -> BatchStats {
        let c = &self.counters;
        BatchStats {
            pending: self.pending.load(Ordering::SeqCst),
            partitions: self.partitions.lock().len(),
            enqueued: c.enqueued.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            dead_letters: c.dead_letters.load(Ordering::Relaxed),
            unstored_dead_letters: self.unstored.lock().len(),
            flush_cycles: c.flush_cycles.load(Ordering::Relaxed),
            journal_appends: c.journal_appends.load(Ordering::Relaxed),
        }
    }

    /// Journal every staged mutation with one append, then queue them in
    /// sequence order. Caller holds `enqueue_lock`.
    async fn commit_staged(&self) {
        let staged = std::mem::take(&mut *self.staged.lock());
        if staged.is_empty() {
            return;
        }
        let records: Vec<JournalRecord> = staged
            .iter()
            .map(|s| JournalRecord::Enqueued(s.mutation.clone()))
            .collect();
        let appended = self.journal.append(&records).await;
        self.counters.journal_appends.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = appended {
            tracing::error!(count = staged.len(), error = %e, "journal append failed; mutations rejected");
            for s in staged {
                let _ = s.committed.send(Err(e.clone()));
            }
            return;
        }
        tracing::trace!(count = staged.len(), "journal group commit");
        for Staged {
            mutation,
            permit,
            committed,
        } in staged
        {
            self.track_delta(&mutation, 1);
            self.push(Queued {
                mutation,
                _permit: Some(permit),
            });
            let _ = committed.send(Ok(()));
        }
    }

    fn push(&self, queued: Queued) {
        let partition = queued.mutation.partition();
        self.partitions
            .lock()
            .entry(partition)
            .or_default()
            .push_back(queued);
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn take_work(&self) -> Vec<Vec<Queued>> {
        let max = self.config.max_batch_size.max(1);
        let mut partitions = self.partitions.lock();
        let mut work = Vec::with_capacity(partitions.len());
        partitions.retain(|_, queue| {
            let take = queue.len().min(max);
            work.push(queue.drain(..take).collect::<Vec<_>>());
            !queue.is_empty()
        });
        work
    }

    fn track_delta(&self, mutation: &BatchedMutation, sign: i64) {
        if let RowOperation::Increment { delta } = mutation.operation {
            let mut entry = self.pending_deltas.entry(mutation.partition()).or_insert(0);
            *entry = entry.saturating_add(delta * sign);
            let drained = *entry == 0;
            drop(entry);
            if drained {
                self.pending_deltas
                    .remove_if(&mutation.partition(), |_, d| *d == 0);
            }
        }
    }

    async fn sync_cache_on_enqueue(&self, mutation: &BatchedMutation) {
        let Some(cache) = &self.cache else {
            return;
        };
        let key = mutation.partition();
        match &mutation.operation {
            RowOperation::Insert { value } | RowOperation::Upsert { value } => {
                match serde_json::to_vec(value) {
                    Ok(bytes) => cache.set(&key, bytes, self.config.cache_ttl).await,
                    Err(_) => cache.invalidate(&key).await,
                }
            }
            RowOperation::Delete => cache.invalidate(&key).await,
            RowOperation::Increment { .. } => {}
        }
    }

    async fn flush_partition(&self, items: Vec<Queued>) -> PartitionOutcome {
        let mutations: Vec<BatchedMutation> = items.iter().map(|q| q.mutation.clone()).collect();
        let count = mutations.len();
        let batch = build_batch(&mutations);
        let seqs: Vec<u64> = mutations.iter().map(|m| m.seq).collect();

        let attempts = AtomicU32::new(0);
        let store = &self.store;
        let timeout = self.config.store_timeout;
        let result = retry_with_backoff(
            &self.config.retry,
            "batch_flush",
            |attempt| {
                attempts.store(attempt + 1, Ordering::Relaxed);
                if attempt > 0 {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    self.metrics.increment(BATCH_FLUSH_RETRIES_TOTAL, &[]);
                }
                let apply = store.apply_batch(&batch);
                async move {
                    match tokio::time::timeout(timeout, apply).await {
                        Ok(result) => result,
                        Err(_) => Err(StoreError::timeout(timeout.as_millis() as u64)),
                    }
                }
            },
            StoreError::is_transient,
        )
        .await;

        let outcome = match result {
            Ok(outcome) => {
                if let Err(e) = self
                    .journal
                    .append(&[JournalRecord::Flushed { seqs }])
                    .await
                {
                    tracing::error!(
                        partition = %batch.key,
                        error = %e,
                        "applied batch but failed to journal flush marker"
                    );
                }
                self.counters
                    .flushed
                    .fetch_add(count as u64, Ordering::Relaxed);
                self.metrics.increment_by(
                    BATCH_FLUSHED_TOTAL,
                    &[("table", batch.table.as_str())],
                    count as u64,
                );
                match outcome {
                    BatchOutcome::Applied { .. } => PartitionOutcome::Applied(count),
                    BatchOutcome::Duplicate => {
                        tracing::debug!(batch_id = %batch.batch_id, "batch already applied");
                        PartitionOutcome::Duplicate(count)
                    }
                }
            }
            Err(source) => {
                let error = BatchError::FlushFailed {
                    table: batch.table.clone(),
                    key: batch.key.clone(),
                    attempts: attempts.load(Ordering::Relaxed),
                    source,
                };
                self.dead_letter(mutations.clone(), &error).await;
                PartitionOutcome::DeadLettered(count)
            }
        };

        for mutation in &mutations {
            self.track_delta(mutation, -1);
        }
        if let Some(cache) = &self.cache {
            let has_increments = mutations
                .iter()
                .any(|m| matches!(m.operation, RowOperation::Increment { .. }));
            if has_increments {
                cache.invalidate(&row_key(&batch.table, &batch.key)).await;
            }
        }
        self.pending.fetch_sub(count, Ordering::SeqCst);
        // Permits are released here, after the store has the mutations.
        drop(items);
        outcome
    }

    async fn dead_letter(&self, mutations: Vec<BatchedMutation>, error: &BatchError) {
        let attempts = match error {
            BatchError::FlushFailed { attempts, .. } => *attempts,
            _ => 1,
        };
        let failed_at = OffsetDateTime::now_utc();
        let letters: Vec<DeadLetter> = mutations
            .into_iter()
            .map(|mutation| DeadLetter {
                mutation,
                error: error.to_string(),
                attempts,
                failed_at,
            })
            .collect();
        let count = letters.len();

        tracing::error!(
            count,
            attempts,
            error = %error,
            "mutations moved to dead letters"
        );
        if let Err(e) = self
            .journal
            .append(&[JournalRecord::DeadLettered {
                letters: letters.clone(),
            }])
            .await
        {
            // The enqueued records stay outstanding and are replayed instead.
            tracing::error!(error = %e, "failed to journal dead letters");
        }
        let owed = self.store_dead_letters(letters.clone()).await;
        self.unstored.lock().extend(owed);

        self.counters
            .dead_letters
            .fetch_add(count as u64, Ordering::Relaxed);
        self.metrics
            .increment_by(BATCH_DEAD_LETTERS_TOTAL, &[], count as u64);
        if let Some(hub) = &self.hub {
            hub.record_event(
                EventLevel::Error,
                "batch flush dead-lettered mutations",
                &[("count", count.to_string()), ("error", error.to_string())],
            );
        }
        self.dead_letters.lock().extend(letters);
    }

    /// Write dead letters to the store and journal the ones that made it.
    /// Stops at the first failure; returns the letters still owed.
    async fn store_dead_letters(&self, letters: Vec<DeadLetter>) -> Vec<DeadLetter> {
        let mut stored = Vec::new();
        let mut owed = Vec::new();
        for letter in letters {
            if !owed.is_empty() {
                owed.push(letter);
                continue;
            }
            match self.put_dead_letter(&letter).await {
                Ok(()) => stored.push(letter.mutation.id.clone()),
                Err(e) => {
                    tracing::warn!(
                        id = %letter.mutation.id,
                        error = %e,
                        "dead letter not written to store; kept in journal"
                    );
                    owed.push(letter);
                }
            }
        }
        if !stored.is_empty()
            && let Err(e) = self
                .journal
                .append(&[JournalRecord::DeadLetterStored { ids: stored }])
                .await
        {
            // Replay writes the rows again; puts by id are idempotent.
            tracing::warn!(error = %e, "failed to journal stored dead letters");
        }
        owed
    }

    async fn put_dead_letter(&self, letter: &DeadLetter) -> Result<(), BatchError> {
        let value = serde_json::to_value(letter)?;
        let timeout = self.config.store_timeout;
        let put = self
            .store
            .put(&self.config.dead_letter_table, &letter.mutation.id, value);
        match tokio::time::timeout(timeout, put).await {
            Ok(result) => result.map(|_| ()).map_err(BatchError::from),
            Err(_) => Err(StoreError::timeout(timeout.as_millis() as u64).into()),
        }
    }

    /// Returns how many owed dead letters reached the store.
    async fn retry_unstored_dead_letters(&self) -> usize {
        let owed = std::mem::take(&mut *self.unstored.lock());
        if owed.is_empty() {
            return 0;
        }
        let before = owed.len();
        let still_owed = self.store_dead_letters(owed).await;
        let stored = before - still_owed.len();
        if stored > 0 {
            tracing::info!(stored, remaining = still_owed.len(), "wrote owed dead letters to store");
        }
        let mut unstored = self.unstored.lock();
        let newer = std::mem::replace(&mut *unstored, still_owed);
        unstored.extend(newer);
        stored
    }

    async fn compact_journal(&self) {
        let _order = self.enqueue_lock.lock().await;
        if self.pending.load(Ordering::SeqCst) > 0 || !self.unstored.lock().is_empty() {
            return;
        }
        if let Err(e) = self.journal.truncate().await {
            tracing::warn!(error = %e, "journal compaction failed");
        }
    }

    fn update_pending_gauge(&self) {
        self.metrics.set_gauge(
            BATCH_PENDING,
            self.pending.load(Ordering::SeqCst) as f64,
            &[],
        );
    }
}

/// One store batch for a partition, merging runs of adjacent increments.
/// The batch id is derived from the mutation ids, so a retry is recognised
/// by the store as the same batch.
fn build_batch(mutations: &[BatchedMutation]) -> MutationBatch {
    let mut operations: Vec<RowOperation> = Vec::with_capacity(mutations.len());
    for mutation in mutations {
        match (operations.last_mut(), &mutation.operation) {
            (Some(RowOperation::Increment { delta: acc }), RowOperation::Increment { delta })
                if acc.checked_add(*delta).is_some() =>
            {
                *acc += delta;
            }
            (_, operation) => operations.push(operation.clone()),
        }
    }
    let first = &mutations[0];
    let last_seq = mutations.last().map(|m| m.seq).unwrap_or(first.seq);
    MutationBatch {
        batch_id: format!("{}:{}-{}", first.id, first.seq, last_seq),
        table: first.target_table.clone(),
        key: first.target_key.clone(),
        operations,
    }
}

impl std::fmt::Debug for BatchWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("pending", &self.pending_count())
            .field("journal", &self.journal.name())
            .field("store", &self.store.backend_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEAD_LETTER_TABLE;
    use crate::journal::{Journal, MemoryJournal};
    use serde_json::json;
    use std::time::Duration;
    use wiseup_core::BackoffPolicy;
    use wiseup_storage::{AuthoritativeStore, MemoryStore};

    fn config() -> BatchConfig {
        BatchConfig {
            retry: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 3),
            ..BatchConfig::default()
        }
    }

    fn writer(store: &Arc<MemoryStore>, journal: &MemoryJournal) -> BatchWriter {
        BatchWriter::new(
            config(),
            store.clone(),
            Arc::new(journal.clone()),
            MetricsAggregator::new_shared(Default::default()),
        )
    }

    #[test]
    fn test_build_batch_coalesces_adjacent_increments() {
        let m = |seq, operation| BatchedMutation {
            id: format!("m{seq}"),
            seq,
            target_table: "stat".into(),
            target_key: "k".into(),
            operation,
            enqueued_at: OffsetDateTime::now_utc(),
        };
        let batch = build_batch(&[
            m(1, RowOperation::Increment { delta: 2 }),
            m(2, RowOperation::Increment { delta: 3 }),
            m(3, RowOperation::Upsert { value: json!(0) }),
            m(4, RowOperation::Increment { delta: 1 }),
        ]);
        assert_eq!(
            batch.operations,
            vec![
                RowOperation::Increment { delta: 5 },
                RowOperation::Upsert { value: json!(0) },
                RowOperation::Increment { delta: 1 },
            ]
        );
        assert_eq!(batch.batch_id, "m1:1-4");
    }

    #[tokio::test]
    async fn test_hundred_increments_flush_exactly() {
        let store = Arc::new(MemoryStore::new());
        let journal = MemoryJournal::new();
        let writer = writer(&store, &journal);
        for _ in 0..100 {
            writer
                .enqueue(Mutation::increment("stat", "logins", 1))
                .await
                .unwrap();
        }
        assert_eq!(writer.pending_delta("stat", "logins"), 100);
        assert_eq!(writer.read_counter("stat", "logins").await.unwrap(), 100);

        let report = writer.flush_all().await;
        assert_eq!(report.applied, 100);
        let row = store.get("stat", "logins").await.unwrap().unwrap();
        assert_eq!(row.as_counter(), 100);
        assert_eq!(writer.pending_delta("stat", "logins"), 0);
        assert!(journal.is_empty());
    }

    #[tokio::test]
    async fn test_per_key_order_preserved() {
        let store = Arc::new(MemoryStore::with_operation_log());
        let journal = MemoryJournal::new();
        let writer = writer(&store, &journal);
        for i in 0..10 {
            writer
                .enqueue(Mutation::upsert("profile", "u1", json!(i)))
                .await
                .unwrap();
            writer
                .enqueue(Mutation::upsert("profile", "u2", json!(i * 10)))
                .await
                .unwrap();
        }
        writer.flush_all().await;
        let ops = store.operations_for("profile", "u1");
        let values: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                RowOperation::Upsert { value } => value.as_i64(),
                _ => None,
            })
            .collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
        assert_eq!(
            store.get("profile", "u2").await.unwrap().unwrap().value,
            json!(90)
        );
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let store = Arc::new(MemoryStore::new());
        let writer = writer(&store, &MemoryJournal::new());
        writer
            .enqueue(Mutation::increment("stat", "k", 5))
            .await
            .unwrap();
        store.fail_next(2);
        let report = writer.flush().await;
        assert_eq!(report.applied, 1);
        assert_eq!(writer.stats().retries, 2);
        assert_eq!(store.get("stat", "k").await.unwrap().unwrap().as_counter(), 5);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let store = Arc::new(MemoryStore::new());
        let journal = MemoryJournal::new();
        let writer = writer(&store, &journal);
        writer
            .enqueue(Mutation::increment("stat", "k", 1))
            .await
            .unwrap();
        store.set_available(false);
        let report = writer.flush().await;
        assert_eq!(report.dead_lettered, 1);

        let letters = writer.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].mutation.target_key, "k");
        assert_eq!(writer.pending_count(), 0);
        assert_eq!(writer.pending_delta("stat", "k"), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_survives_restart_while_store_down() {
        let store = Arc::new(MemoryStore::new());
        let journal = MemoryJournal::new();
        {
            let first = writer(&store, &journal);
            first
                .enqueue(Mutation::increment("stat", "k", 4))
                .await
                .unwrap();
            store.set_available(false);
            let report = first.flush().await;
            assert_eq!(report.dead_lettered, 1);
            assert_eq!(first.stats().unstored_dead_letters, 1);
            // Not compacted: the journal is the only copy of the letter.
            assert!(!journal.is_empty());
        }

        store.set_available(true);
        let second = writer(&store, &journal);
        assert_eq!(second.recover().await.unwrap(), 0);
        let letters = second.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].mutation.target_key, "k");

        second.flush().await;
        let row = store
            .get(DEAD_LETTER_TABLE, &letters[0].mutation.id)
            .await
            .unwrap();
        assert!(row.is_some());
        assert_eq!(second.stats().unstored_dead_letters, 0);
        assert!(journal.is_empty());

        // Nothing is owed any more; a third start restores nothing.
        let third = writer(&store, &journal);
        third.recover().await.unwrap();
        assert!(third.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_owed_dead_letter_written_on_a_later_cycle() {
        let store = Arc::new(MemoryStore::new());
        let journal = MemoryJournal::new();
        let writer = writer(&store, &journal);
        writer
            .enqueue(Mutation::upsert("profile", "u1", json!({"n": 1})))
            .await
            .unwrap();
        store.set_available(false);
        writer.flush().await;
        let id = writer.dead_letters()[0].mutation.id.clone();

        // Still down: the letter stays owed.
        writer.flush().await;
        assert_eq!(writer.stats().unstored_dead_letters, 1);

        store.set_available(true);
        let report = writer.flush().await;
        assert_eq!(report, FlushReport::default());
        assert!(store.get(DEAD_LETTER_TABLE, &id).await.unwrap().is_some());
        assert!(journal.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_share_journal_appends() {
        let store = Arc::new(MemoryStore::new());
        let journal = MemoryJournal::new();
        journal.set_latency(Duration::from_millis(20));
        let writer = Arc::new(writer(&store, &journal));

        let mut handles = Vec::new();
        for i in 0..32 {
            let writer = Arc::clone(&writer);
            handles.push(tokio::spawn(async move {
                writer
                    .enqueue(Mutation::increment("stat", format!("k{}", i % 4), 1))
                    .await
            }));
        }
        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap().unwrap().seq);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=32).collect::<Vec<u64>>());
        assert!(journal.append_count() < 32, "{} appends", journal.append_count());
        assert_eq!(writer.stats().journal_appends as usize, journal.append_count());

        // Journal order is sequence order.
        let journaled: Vec<u64> = journal
            .records()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|record| match record {
                JournalRecord::Enqueued(m) => Some(m.seq),
                _ => None,
            })
            .collect();
        assert_eq!(journaled, (1..=32).collect::<Vec<u64>>());
        assert_eq!(writer.pending_count(), 32);

        journal.set_latency(Duration::ZERO);
        writer.flush_all().await;
        for i in 0..4 {
            let row = store.get("stat", &format!("k{i}")).await.unwrap().unwrap();
            assert_eq!(row.as_counter(), 8);
        }
    }

    #[tokio::test]
    async fn test_flush_drops_cached_table_views() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CacheTierManager::new(
            wiseup_core::InstanceId::generate(),
            wiseup_cache::CacheConfig::default(),
            MetricsAggregator::new_shared(Default::default()),
        ));
        let writer = writer(&store, &MemoryJournal::new()).with_cache(Arc::clone(&cache));
        let ttl = Duration::from_secs(60);
        cache.set("auth_stats:totals", b"41".to_vec(), ttl).await;
        cache.set("profile:listing", b"[]".to_vec(), ttl).await;

        writer
            .enqueue(Mutation::increment("auth_stats", "logins", 1))
            .await
            .unwrap();
        writer.flush().await;

        assert!(cache.get("auth_stats:totals").await.is_none());
        assert!(cache.get("profile:listing").await.is_some());
    }

    #[tokio::test]
    async fn test_non_transient_failure_dead_letters_once() {
        let store = Arc::new(MemoryStore::new());
        store.put("stat", "k", json!("text")).await.unwrap();
        let writer = writer(&store, &MemoryJournal::new());
        writer
            .enqueue(Mutation::increment("stat", "k", 1))
            .await
            .unwrap();
        writer.flush().await;
        let letters = writer.dead_letters();
        assert_eq!(letters[0].attempts, 1);
        let persisted = store
            .get(DEAD_LETTER_TABLE, &letters[0].mutation.id)
            .await
            .unwrap();
        assert!(persisted.is_some());
    }

    #[tokio::test]
    async fn test_journal_failure_rejects_enqueue() {
        let store = Arc::new(MemoryStore::new());
        let journal = MemoryJournal::new();
        let writer = writer(&store, &journal);
        journal.set_failing(true);
        let err = writer
            .enqueue(Mutation::increment("stat", "k", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Journal(_)));
        assert_eq!(writer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_recover_replays_unflushed() {
        let store = Arc::new(MemoryStore::new());
        let journal = MemoryJournal::new();
        {
            let first = writer(&store, &journal);
            for _ in 0..7 {
                first
                    .enqueue(Mutation::increment("stat", "logins", 1))
                    .await
                    .unwrap();
            }
            // dropped without flushing, as in a crash
        }
        let second = writer(&store, &journal);
        assert_eq!(second.recover().await.unwrap(), 7);
        let ack = second
            .enqueue(Mutation::increment("stat", "logins", 1))
            .await
            .unwrap();
        assert_eq!(ack.seq, 8);
        second.flush_all().await;
        assert_eq!(
            store.get("stat", "logins").await.unwrap().unwrap().as_counter(),
            8
        );
    }

    #[tokio::test]
    async fn test_enqueue_blocks_at_capacity() {
        let store = Arc::new(MemoryStore::new());
        let writer = Arc::new(BatchWriter::new(
            BatchConfig {
                max_pending: 2,
                ..config()
            },
            store.clone(),
            Arc::new(MemoryJournal::new()),
            MetricsAggregator::new_shared(Default::default()),
        ));
        writer.enqueue(Mutation::increment("s", "a", 1)).await.unwrap();
        writer.enqueue(Mutation::increment("s", "b", 1)).await.unwrap();

        let blocked = {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { writer.enqueue(Mutation::increment("s", "c", 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        writer.flush().await;
        blocked.await.unwrap().unwrap();
        assert_eq!(writer.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects() {
        let store = Arc::new(MemoryStore::new());
        let writer = Arc::new(writer(&store, &MemoryJournal::new()));
        writer.start();
        writer.enqueue(Mutation::increment("s", "k", 3)).await.unwrap();
        writer.shutdown().await;
        assert_eq!(store.get("s", "k").await.unwrap().unwrap().as_counter(), 3);
        assert!(matches!(
            writer.enqueue(Mutation::increment("s", "k", 1)).await,
            Err(BatchError::ShuttingDown)
        ));
    }
}
