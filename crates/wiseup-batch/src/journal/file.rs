//! JSON-lines journal file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{Journal, JournalRecord};
use crate::error::BatchError;

/// One JSON record per line, `sync_data` after every append.
///
/// A torn final line (crash mid-write) is skipped on read; it was never
/// acknowledged.
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, BatchError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = open_append(&path).await?;
        tracing::info!(path = %path.display(), "opened batch journal");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

#[async_trait]
impl Journal for FileJournal {
    async fn append(&self, records: &[JournalRecord]) -> Result<(), BatchError> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn records(&self) -> Result<Vec<JournalRecord>, BatchError> {
        let _file = self.file.lock().await;
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = line_no + 1,
                    error = %e,
                    "skipping unreadable journal record"
                ),
            }
        }
        Ok(records)
    }

    async fn truncate(&self) -> Result<(), BatchError> {
        let mut file = self.file.lock().await;
        file.set_len(0).await?;
        file.sync_all().await?;
        *file = open_append(&self.path).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::outstanding;
    use crate::mutation::BatchedMutation;
    use time::OffsetDateTime;
    use wiseup_storage::RowOperation;

    fn mutation(seq: u64) -> BatchedMutation {
        BatchedMutation {
            id: format!("m{seq}"),
            seq,
            target_table: "stat".into(),
            target_key: "logins".into(),
            operation: RowOperation::Increment { delta: 1 },
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_reopen_replays_outstanding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal").join("batch.jsonl");
        {
            let journal = FileJournal::open(&path).await.unwrap();
            journal
                .append(&[
                    JournalRecord::Enqueued(mutation(1)),
                    JournalRecord::Enqueued(mutation(2)),
                    JournalRecord::Enqueued(mutation(3)),
                ])
                .await
                .unwrap();
            journal
                .append(&[JournalRecord::Flushed { seqs: vec![1] }])
                .await
                .unwrap();
        }

        let journal = FileJournal::open(&path).await.unwrap();
        let pending = outstanding(journal.records().await.unwrap());
        assert_eq!(pending.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_torn_tail_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.jsonl");
        let journal = FileJournal::open(&path).await.unwrap();
        journal
            .append(&[JournalRecord::Enqueued(mutation(1))])
            .await
            .unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).await.unwrap();
            file.write_all(b"{\"record\":\"enq").await.unwrap();
        }
        assert_eq!(journal.records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_truncate_empties_file() {
        let dir = tempfile::tempdir().unwrap();
        let journal = FileJournal::open(dir.path().join("batch.jsonl")).await.unwrap();
        journal
            .append(&[JournalRecord::Enqueued(mutation(1))])
            .await
            .unwrap();
        journal.truncate().await.unwrap();
        assert!(journal.records().await.unwrap().is_empty());
        journal
            .append(&[JournalRecord::Enqueued(mutation(2))])
            .await
            .unwrap();
        assert_eq!(journal.records().await.unwrap().len(), 1);
    }
}
