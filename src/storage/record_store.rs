//! Durable record store: named collections of MessagePack-encoded records.

use crate::core::{Result, SyncError};
use crate::storage::collection::{Collection, CollectionSchema, RecordKey};
use crate::storage::persistence::{
    DurabilityMode, LockGuard, PersistenceManager, StoreImage, WalEntry,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A value that can live in a collection.
///
/// `key()` returns `None` for records whose identity the store assigns.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    fn key(&self) -> Option<RecordKey>;
    fn assign_key(&mut self, key: RecordKey);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSchema {
    pub name: String,
    pub version: u32,
    pub collections: Vec<CollectionSchema>,
}

impl StoreSchema {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            collections: Vec::new(),
        }
    }

    pub fn collection(mut self, schema: CollectionSchema) -> Self {
        self.collections.push(schema);
        self
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub data_dir: PathBuf,
    pub schema: StoreSchema,
    pub durability: DurabilityMode,
    pub checkpoint_threshold: usize,
}

impl StoreOptions {
    pub fn new(data_dir: impl Into<PathBuf>, schema: StoreSchema) -> Self {
        Self {
            data_dir: data_dir.into(),
            schema,
            durability: DurabilityMode::default(),
            checkpoint_threshold: 256,
        }
    }

    pub fn durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    pub fn checkpoint_threshold(mut self, threshold: usize) -> Self {
        self.checkpoint_threshold = threshold;
        self
    }
}

struct StoreState {
    image: StoreImage,
    persistence: PersistenceManager,
}

impl StoreState {
    /// Takes the directory lock and refreshes the image from disk.
    ///
    /// Other processes may write the same files, so no image is trusted
    /// without replaying what they appended first.
    fn lock(&mut self) -> Result<LockedState<'_>> {
        let mut guard = self.persistence.lock()?;
        if let Some(guard) = guard.as_mut() {
            self.persistence.catch_up(guard, &mut self.image)?;
        }
        Ok(LockedState { state: self, guard })
    }
}

/// The image while the directory lock is held. Dropping it releases the lock.
struct LockedState<'a> {
    state: &'a mut StoreState,
    guard: Option<LockGuard>,
}

impl LockedState<'_> {
    fn image(&self) -> &StoreImage {
        &self.state.image
    }

    fn collection(&self, name: &str) -> Result<&Collection> {
        self.state
            .image
            .collections
            .get(name)
            .ok_or_else(|| SyncError::CollectionNotFound(name.to_string()))
    }

    /// Logs first, then applies, so the in-memory image never runs ahead of the WAL.
    ///
    /// Once the entry is in the WAL the write has happened. A checkpoint
    /// failure after that point is logged and retried a threshold later.
    fn commit(&mut self, entry: WalEntry) -> Result<()> {
        let StoreState { image, persistence } = &mut *self.state;
        persistence.log(&entry)?;
        image.apply(entry);
        if persistence.needs_checkpoint() {
            match persistence.checkpoint(self.guard.as_mut(), image) {
                Ok(()) => debug!("record store checkpointed"),
                Err(err) => {
                    persistence.postpone_checkpoint();
                    warn!(error = %err, "checkpoint failed, WAL kept for the next attempt");
                }
            }
        }
        Ok(())
    }

    fn upgrade(&mut self, schema: &StoreSchema) -> Result<()> {
        let stored = self.state.image.schema_version;
        if schema.version < stored {
            return Err(SyncError::SchemaVersion {
                stored,
                requested: schema.version,
            });
        }
        if schema.version == stored {
            return Ok(());
        }
        for collection in &schema.collections {
            if !self.state.image.collections.contains_key(&collection.name) {
                self.commit(WalEntry::CreateCollection(collection.clone()))?;
            }
        }
        self.commit(WalEntry::SchemaVersion(schema.version))?;
        info!(
            store = %schema.name,
            from = stored,
            to = schema.version,
            "record store schema upgraded"
        );
        Ok(())
    }
}

/// Keyed collections persisted through a WAL and snapshots.
///
/// Any number of stores, in this process or others, may be open on one data
/// directory. Each operation holds the directory lock and first replays what
/// the other stores wrote, so keys stay unique and no write is lost.
pub struct RecordStore {
    state: Mutex<StoreState>,
}

impl RecordStore {
    /// Opens (or creates) the store under `options.data_dir`, recovering its
    /// contents and applying the schema.
    pub fn open(options: &StoreOptions) -> Result<Self> {
        let mut persistence = PersistenceManager::new(&options.data_dir, options.durability)?;
        persistence
            .wal_mut()
            .set_checkpoint_threshold(options.checkpoint_threshold);
        let mut state = StoreState {
            image: StoreImage::default(),
            persistence,
        };
        let version = {
            let mut locked = state.lock()?;
            locked.upgrade(&options.schema)?;
            locked.image().schema_version
        };

        debug!(
            store = %options.schema.name,
            data_dir = %options.data_dir.display(),
            version,
            "record store opened"
        );

        Ok(Self {
            state: Mutex::new(state),
        })
    }

    pub async fn schema_version(&self) -> Result<u32> {
        let mut state = self.state.lock().await;
        let locked = state.lock()?;
        Ok(locked.image().schema_version)
    }

    /// Re-applies a schema against an already open store. Same version is a no-op.
    pub async fn ensure_schema(&self, schema: &StoreSchema) -> Result<()> {
        let mut state = self.state.lock().await;
        state.lock()?.upgrade(schema)
    }

    /// Inserts or overwrites a record and returns its key.
    ///
    /// Key assignment and insertion happen under one lock acquisition, so
    /// concurrent writers never receive the same auto-increment key.
    pub async fn put<T: Record>(&self, collection: &str, mut record: T) -> Result<RecordKey> {
        let mut state = self.state.lock().await;
        let mut locked = state.lock()?;
        let key = locked.collection(collection)?.resolve_key(record.key())?;
        record.assign_key(key.clone());
        let bytes = rmp_serde::to_vec(&record)?;
        locked.commit(WalEntry::Put {
            collection: collection.to_string(),
            key: key.clone(),
            bytes,
        })?;
        Ok(key)
    }

    pub async fn get<T: Record>(&self, collection: &str, key: &RecordKey) -> Result<Option<T>> {
        let mut state = self.state.lock().await;
        let locked = state.lock()?;
        locked
            .collection(collection)?
            .get(key)
            .map(|bytes| rmp_serde::from_slice(bytes).map_err(SyncError::from))
            .transpose()
    }

    /// Every record of the collection, in key order.
    pub async fn get_all<T: Record>(&self, collection: &str) -> Result<Vec<T>> {
        let mut state = self.state.lock().await;
        let locked = state.lock()?;
        locked
            .collection(collection)?
            .values()
            .map(|bytes| rmp_serde::from_slice(bytes).map_err(SyncError::from))
            .collect()
    }

    /// Removes a record. Deleting a missing key is not an error.
    pub async fn delete(&self, collection: &str, key: &RecordKey) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut locked = state.lock()?;
        if locked.collection(collection)?.get(key).is_none() {
            return Ok(());
        }
        locked.commit(WalEntry::Delete {
            collection: collection.to_string(),
            key: key.clone(),
        })
    }

    /// Removes every record. Clearing an empty collection writes nothing.
    pub async fn clear(&self, collection: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut locked = state.lock()?;
        if locked.collection(collection)?.is_empty() {
            return Ok(());
        }
        locked.commit(WalEntry::Clear {
            collection: collection.to_string(),
        })
    }

    pub async fn count(&self, collection: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        let locked = state.lock()?;
        Ok(locked.collection(collection)?.len())
    }
}
