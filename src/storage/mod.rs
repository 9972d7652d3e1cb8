pub mod collection;
pub mod handle;
pub mod persistence;
pub mod record_store;

pub use collection::{Collection, CollectionSchema, KeyPolicy, RecordKey};
pub use handle::{StoreHandle, open_shared};
pub use persistence::{DurabilityMode, LOCK_FILE, SNAPSHOT_FILE, WAL_FILE};
pub use record_store::{Record, RecordStore, StoreOptions, StoreSchema};

/// Name of the physical store shared by every context.
pub const STORE_NAME: &str = "story-app-db";
/// Current schema version of [`default_schema`].
pub const STORE_VERSION: u32 = 1;
/// Auto-increment collection of pending submissions.
pub const OUTBOX_COLLECTION: &str = "outbox";
/// Collection of pinned stories keyed by remote story id.
pub const SAVED_COLLECTION: &str = "saved";

pub fn default_schema() -> StoreSchema {
    StoreSchema::new(STORE_NAME, STORE_VERSION)
        .collection(CollectionSchema::explicit(SAVED_COLLECTION))
        .collection(CollectionSchema::auto_increment(OUTBOX_COLLECTION))
}
