//! Outbox queue: typed access to the `outbox` collection.

use crate::core::{QueuedSubmission, Result, SyncError};
use crate::storage::{OUTBOX_COLLECTION, Record, RecordKey, StoreHandle};

impl Record for QueuedSubmission {
    fn key(&self) -> Option<RecordKey> {
        self.id.map(RecordKey::Seq)
    }

    fn assign_key(&mut self, key: RecordKey) {
        self.id = key.as_seq();
    }
}

#[derive(Clone)]
pub struct OutboxQueue {
    store: StoreHandle,
}

impl OutboxQueue {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Stores a submission and returns its store-assigned id.
    ///
    /// Any id already on the record is discarded; identity always comes from the store.
    pub async fn enqueue(&self, mut submission: QueuedSubmission) -> Result<u64> {
        submission.id = None;
        let key = self
            .store
            .store()
            .await?
            .put(OUTBOX_COLLECTION, submission)
            .await?;
        key.as_seq().ok_or_else(|| {
            SyncError::Storage(format!("outbox assigned a non-sequence key '{}'", key))
        })
    }

    /// Snapshot of every pending submission, oldest first.
    pub async fn list_all(&self) -> Result<Vec<QueuedSubmission>> {
        self.store
            .store()
            .await?
            .get_all(OUTBOX_COLLECTION)
            .await
    }

    pub async fn get(&self, id: u64) -> Result<Option<QueuedSubmission>> {
        self.store
            .store()
            .await?
            .get(OUTBOX_COLLECTION, &RecordKey::Seq(id))
            .await
    }

    pub async fn remove(&self, id: u64) -> Result<()> {
        self.store
            .store()
            .await?
            .delete(OUTBOX_COLLECTION, &RecordKey::Seq(id))
            .await
    }

    pub async fn len(&self) -> Result<usize> {
        self.store.store().await?.count(OUTBOX_COLLECTION).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drops every pending submission.
    pub async fn clear(&self) -> Result<()> {
        self.store.store().await?.clear(OUTBOX_COLLECTION).await
    }
}
