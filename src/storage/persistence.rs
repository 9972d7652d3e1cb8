//! Write-Ahead Logging (WAL) and snapshot files backing the record store

use crate::core::{Result, SyncError};
use crate::storage::collection::{Collection, CollectionSchema, RecordKey};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const WAL_FILE: &str = "storysync.wal";
pub const SNAPSHOT_FILE: &str = "storysync.snapshot";
pub const LOCK_FILE: &str = "storysync.lock";
const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ============================================================================
// WAL Entry Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntry {
    CreateCollection(CollectionSchema),
    SchemaVersion(u32),
    Put {
        collection: String,
        key: RecordKey,
        bytes: Vec<u8>,
    },
    Delete {
        collection: String,
        key: RecordKey,
    },
    Clear {
        collection: String,
    },
}

/// Recovered store contents: schema version plus every collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreImage {
    pub schema_version: u32,
    pub collections: BTreeMap<String, Collection>,
}

impl StoreImage {
    /// Applies one logged mutation. Entries naming an unknown collection are ignored.
    pub fn apply(&mut self, entry: WalEntry) {
        match entry {
            WalEntry::CreateCollection(schema) => {
                self.collections
                    .entry(schema.name.clone())
                    .or_insert_with(|| Collection::new(schema));
            }
            WalEntry::SchemaVersion(version) => {
                self.schema_version = version;
            }
            WalEntry::Put {
                collection,
                key,
                bytes,
            } => {
                if let Some(col) = self.collections.get_mut(&collection) {
                    col.put(key, bytes);
                }
            }
            WalEntry::Delete { collection, key } => {
                if let Some(col) = self.collections.get_mut(&collection) {
                    col.delete(&key);
                }
            }
            WalEntry::Clear { collection } => {
                if let Some(col) = self.collections.get_mut(&collection) {
                    col.clear();
                }
            }
        }
    }
}

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub image: StoreImage,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at_unix_ms: i64,
    pub record_count: usize,
    pub collection_count: usize,
}

impl StoreSnapshot {
    pub fn new(image: StoreImage) -> Self {
        let record_count = image.collections.values().map(Collection::len).sum();
        let collection_count = image.collections.len();

        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            image,
            metadata: SnapshotMetadata {
                created_at_unix_ms: Utc::now().timestamp_millis(),
                record_count,
                collection_count,
            },
        }
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// fsync every WAL append.
    #[default]
    Sync,
    /// Flush to the OS on every append, leave fsync to the OS.
    Async,
    /// Keep everything in memory. Nothing survives a restart.
    None,
}

impl std::str::FromStr for DurabilityMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            "none" | "memory" => Ok(Self::None),
            other => Err(SyncError::Config(format!(
                "unknown durability mode '{}'",
                other
            ))),
        }
    }
}

fn storage_err(action: &str, err: impl std::fmt::Display) -> SyncError {
    SyncError::Storage(format!("{}: {}", action, err))
}

// ============================================================================
// Directory Lock
// ============================================================================

/// Advisory lock shared by every process that opens the same data directory.
///
/// The lock file also carries the checkpoint generation. A handle that sees a
/// generation it has not loaded reloads the snapshot before replaying the WAL.
pub struct StoreLock {
    file: File,
}

impl StoreLock {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path.as_ref())
            .map_err(|e| storage_err("failed to open store lock", e))?;
        Ok(Self { file })
    }

    /// Blocks until no other handle holds the lock.
    pub fn acquire(&self) -> Result<LockGuard> {
        let file = self
            .file
            .try_clone()
            .map_err(|e| storage_err("failed to clone store lock", e))?;
        FileExt::lock_exclusive(&file).map_err(|e| storage_err("failed to lock store", e))?;
        Ok(LockGuard { file })
    }
}

pub struct LockGuard {
    file: File,
}

impl LockGuard {
    pub fn generation(&mut self) -> Result<u64> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| storage_err("failed to read store generation", e))?;
        let mut bytes = [0u8; 8];
        match self.file.read_exact(&mut bytes) {
            Ok(()) => Ok(u64::from_le_bytes(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(0),
            Err(e) => Err(storage_err("failed to read store generation", e)),
        }
    }

    pub fn set_generation(&mut self, generation: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&generation.to_le_bytes()))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| storage_err("failed to write store generation", e))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

// ============================================================================
// WAL Manager
// ============================================================================

pub struct WalManager {
    wal_path: PathBuf,
    wal_file: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    /// Bytes of the WAL already applied to the caller's image.
    offset: u64,
    entries_since_checkpoint: usize,
    checkpoint_threshold: usize,
}

impl WalManager {
    pub fn new<P: AsRef<Path>>(wal_path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();

        let wal_file = if durability_mode != DurabilityMode::None {
            if let Some(parent) = wal_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| storage_err("failed to create WAL directory", e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&wal_path)
                .map_err(|e| storage_err("failed to open WAL file", e))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            wal_path,
            wal_file,
            durability_mode,
            offset: 0,
            entries_since_checkpoint: 0,
            checkpoint_threshold: 256,
        })
    }

    /// Appends one entry. The caller must have replayed every earlier entry.
    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let file = self
            .wal_file
            .as_mut()
            .ok_or_else(|| SyncError::Storage("WAL file not initialized".to_string()))?;
        let serialized = rmp_serde::to_vec(entry)?;
        let len = serialized.len() as u32;
        file.write_all(&len.to_le_bytes())
            .map_err(|e| storage_err("failed to write WAL", e))?;
        file.write_all(&serialized)
            .map_err(|e| storage_err("failed to write WAL", e))?;
        file.flush()
            .map_err(|e| storage_err("failed to flush WAL", e))?;
        if self.durability_mode == DurabilityMode::Sync {
            file.get_mut()
                .sync_all()
                .map_err(|e| storage_err("failed to sync WAL", e))?;
        }
        self.offset += 4 + serialized.len() as u64;
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    /// Reads the complete entries written since the last call.
    ///
    /// Must run under the store lock. A torn trailing entry (crash mid-append)
    /// is cut off so that later appends stay readable.
    pub fn read_new(&mut self) -> Result<Vec<WalEntry>> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(Vec::new());
        }
        let mut file = match File::open(&self.wal_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err("failed to open WAL for reading", e)),
        };
        let metadata = file
            .metadata()
            .map_err(|e| storage_err("failed to stat WAL", e))?;
        if !metadata.is_file() {
            return Err(SyncError::Storage(format!(
                "WAL path {} is not a regular file",
                self.wal_path.display()
            )));
        }
        let len = metadata.len();
        if len < self.offset {
            return Err(SyncError::Storage(format!(
                "WAL shrank to {} bytes below replayed position {}",
                len, self.offset
            )));
        }
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| storage_err("failed to seek WAL", e))?;
        let mut reader = BufReader::new(file);

        let mut entries = Vec::new();
        let mut torn = false;
        while self.offset < len {
            if len - self.offset < 4 {
                torn = true;
                break;
            }
            let mut len_bytes = [0u8; 4];
            reader
                .read_exact(&mut len_bytes)
                .map_err(|e| storage_err("failed to read WAL entry length", e))?;
            let entry_len = u32::from_le_bytes(len_bytes) as u64;
            if len - self.offset - 4 < entry_len {
                torn = true;
                break;
            }
            let mut data = vec![0u8; entry_len as usize];
            reader
                .read_exact(&mut data)
                .map_err(|e| storage_err("failed to read WAL entry data", e))?;
            entries.push(rmp_serde::from_slice(&data)?);
            self.offset += 4 + entry_len;
            self.entries_since_checkpoint += 1;
        }

        if torn {
            tracing::warn!(
                wal = %self.wal_path.display(),
                offset = self.offset,
                "dropping torn WAL tail"
            );
            OpenOptions::new()
                .write(true)
                .open(&self.wal_path)
                .and_then(|file| file.set_len(self.offset))
                .map_err(|e| storage_err("failed to cut torn WAL tail", e))?;
        }
        Ok(entries)
    }

    /// Forgets the replay position; the next `read_new` starts from the first entry.
    pub fn rewind(&mut self) {
        self.offset = 0;
        self.entries_since_checkpoint = 0;
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let file = self
            .wal_file
            .as_mut()
            .ok_or_else(|| SyncError::Storage("WAL file not initialized".to_string()))?;
        file.flush()
            .and_then(|_| file.get_mut().set_len(0))
            .map_err(|e| storage_err("failed to truncate WAL", e))?;
        self.rewind();
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.entries_since_checkpoint >= self.checkpoint_threshold
    }

    /// Waits another full threshold before the next checkpoint attempt.
    pub fn postpone_checkpoint(&mut self) {
        self.entries_since_checkpoint = 0;
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold.max(1);
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Writes through a temp file in the same directory and renames it into place.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let parent = self
            .snapshot_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)
            .map_err(|e| storage_err("failed to create snapshot directory", e))?;
        let serialized = rmp_serde::to_vec(snapshot)?;
        let mut temp = NamedTempFile::new_in(&parent)
            .map_err(|e| storage_err("failed to create temp file", e))?;
        temp.write_all(&serialized)
            .map_err(|e| storage_err("failed to write snapshot", e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| storage_err("failed to sync snapshot", e))?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| storage_err("failed to rename snapshot", e))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| storage_err("failed to open snapshot", e))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| storage_err("failed to read snapshot", e))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data)?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(SyncError::Storage(format!(
                "unsupported snapshot format version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}

// ============================================================================
// Persistence Manager
// ============================================================================

pub struct PersistenceManager {
    wal: WalManager,
    snapshot: SnapshotManager,
    lock: Option<StoreLock>,
    /// Checkpoint generation the caller's image was rebuilt from.
    loaded_generation: Option<u64>,
    durability_mode: DurabilityMode,
}

impl PersistenceManager {
    pub fn new<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let wal = WalManager::new(data_dir.join(WAL_FILE), durability_mode)?;
        let snapshot = SnapshotManager::new(data_dir.join(SNAPSHOT_FILE));
        let lock = if durability_mode != DurabilityMode::None {
            Some(StoreLock::open(data_dir.join(LOCK_FILE))?)
        } else {
            None
        };
        Ok(Self {
            wal,
            snapshot,
            lock,
            loaded_generation: None,
            durability_mode,
        })
    }

    /// Takes the directory lock. `None` in memory mode, where nothing is shared.
    pub fn lock(&self) -> Result<Option<LockGuard>> {
        self.lock.as_ref().map(StoreLock::acquire).transpose()
    }

    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        self.wal.append(entry)
    }

    /// Brings `image` up to date with everything other handles wrote.
    ///
    /// Reloads from the snapshot after another handle checkpointed, otherwise
    /// replays only the WAL entries appended since the last call.
    pub fn catch_up(&mut self, guard: &mut LockGuard, image: &mut StoreImage) -> Result<()> {
        let generation = guard.generation()?;
        if self.loaded_generation != Some(generation) {
            *image = self.recover()?;
            self.loaded_generation = Some(generation);
            return Ok(());
        }
        for entry in self.wal.read_new()? {
            image.apply(entry);
        }
        Ok(())
    }

    /// Folds the WAL into a fresh snapshot and bumps the generation.
    ///
    /// The generation moves before the WAL is truncated, so a failure between
    /// the two only makes other handles replay entries the snapshot already holds.
    pub fn checkpoint(&mut self, guard: Option<&mut LockGuard>, image: &StoreImage) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let snapshot = StoreSnapshot::new(image.clone());
        self.snapshot.save(&snapshot)?;
        if let Some(guard) = guard {
            let generation = guard.generation()? + 1;
            guard.set_generation(generation)?;
            self.loaded_generation = Some(generation);
        }
        self.wal.clear()
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.wal.needs_checkpoint()
    }

    pub fn postpone_checkpoint(&mut self) {
        self.wal.postpone_checkpoint();
    }

    /// Loads the last snapshot and replays the whole WAL on top of it.
    pub fn recover(&mut self) -> Result<StoreImage> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(StoreImage::default());
        }
        let mut image = match self.snapshot.load()? {
            Some(snapshot) => snapshot.image,
            None => StoreImage::default(),
        };
        self.wal.rewind();
        for entry in self.wal.read_new()? {
            image.apply(entry);
        }
        Ok(image)
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    pub fn wal_mut(&mut self) -> &mut WalManager {
        &mut self.wal
    }

    pub fn snapshot(&self) -> &SnapshotManager {
        &self.snapshot
    }
}
