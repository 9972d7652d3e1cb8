//! Lazily opened, shared store handles.
//!
//! Each execution context (foreground, background worker) owns a
//! [`StoreHandle`]. The first operation opens the store; every later one
//! reuses the cached `Arc`. Handles for the same data directory resolve to
//! the same [`RecordStore`] instance through a process-wide registry. Stores
//! in other processes stay coherent through the directory lock that every
//! store operation takes.

use crate::core::Result;
use crate::storage::record_store::{RecordStore, StoreOptions};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::OnceCell;
use tracing::debug;

lazy_static! {
    static ref OPEN_STORES: Mutex<HashMap<PathBuf, Weak<RecordStore>>> =
        Mutex::new(HashMap::new());
}

fn registry_key(options: &StoreOptions) -> PathBuf {
    std::fs::canonicalize(&options.data_dir).unwrap_or_else(|_| options.data_dir.clone())
}

/// Returns the live store for `options.data_dir`, opening it if no context holds it.
pub async fn open_shared(options: &StoreOptions) -> Result<Arc<RecordStore>> {
    if options.durability != crate::storage::DurabilityMode::None {
        std::fs::create_dir_all(&options.data_dir)?;
    }
    let key = registry_key(options);

    let existing = {
        let mut stores = OPEN_STORES.lock()?;
        if let Some(store) = stores.get(&key).and_then(Weak::upgrade) {
            store
        } else {
            let store = Arc::new(RecordStore::open(options)?);
            stores.insert(key.clone(), Arc::downgrade(&store));
            debug!(data_dir = %key.display(), "store registered");
            return Ok(store);
        }
    };

    existing.ensure_schema(&options.schema).await?;
    Ok(existing)
}

struct HandleInner {
    options: StoreOptions,
    store: OnceCell<Arc<RecordStore>>,
}

/// Per-context handle: cheap to clone, opens the store at most once.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<HandleInner>,
}

impl StoreHandle {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                options,
                store: OnceCell::new(),
            }),
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// The open store. A failed open is not cached; the next call retries.
    pub async fn store(&self) -> Result<Arc<RecordStore>> {
        self.inner
            .store
            .get_or_try_init(|| open_shared(&self.inner.options))
            .await
            .cloned()
    }

    pub fn is_open(&self) -> bool {
        self.inner.store.initialized()
    }
}
