//! Crash recovery through the file journal.

use std::sync::Arc;
use wiseup_batch::{BatchConfig, BatchWriter, FileJournal, Mutation};
use wiseup_storage::{AuthoritativeStore, MemoryStore};
use wiseup_telemetry::MetricsAggregator;

async fn writer(path: &std::path::Path, store: &Arc<MemoryStore>) -> BatchWriter {
    let journal = FileJournal::open(path).await.unwrap();
    BatchWriter::new(
        BatchConfig::default(),
        store.clone(),
        Arc::new(journal),
        MetricsAggregator::new_shared(Default::default()),
    )
}

#[tokio::test]
async fn test_acknowledged_mutations_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batch.jsonl");
    let store = Arc::new(MemoryStore::new());

    {
        let first = writer(&path, &store).await;
        for _ in 0..25 {
            first
                .enqueue(Mutation::increment("stat", "logins", 2))
                .await
                .unwrap();
        }
        first
            .enqueue(Mutation::upsert("audit", "a1", serde_json::json!({"event": "login"})))
            .await
            .unwrap();
    }
    assert!(store.get("stat", "logins").await.unwrap().is_none());

    let second = writer(&path, &store).await;
    assert_eq!(second.recover().await.unwrap(), 26);
    assert_eq!(second.read_counter("stat", "logins").await.unwrap(), 50);
    second.shutdown().await;

    assert_eq!(
        store.get("stat", "logins").await.unwrap().unwrap().as_counter(),
        50
    );
    assert!(store.get("audit", "a1").await.unwrap().is_some());

    // drained: the journal was compacted, a third start finds nothing
    let third = writer(&path, &store).await;
    assert_eq!(third.recover().await.unwrap(), 0);
}
