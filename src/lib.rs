// ============================================================================
// storysync: offline-first story submission
// ============================================================================

pub mod app;
pub mod background;
pub mod config;
pub mod connectivity;
pub mod core;
pub mod credentials;
pub mod delivery;
pub mod gate;
pub mod messages;
pub mod notify;
pub mod outbox;
pub mod saved;
pub mod storage;
pub mod sync;

// Re-export main types for convenience
pub use app::{StorySync, StorySyncBuilder};
pub use background::{BackgroundWorker, SYNC_TAG, SyncRegistrar, SyncTrigger};
pub use config::SyncConfig;
pub use connectivity::{Connectivity, ConnectivityProbe};
pub use crate::core::{
    ApiResponse, DeliveryOutcome, FailureReason, GeoPoint, NewSubmission, Photo,
    QueuedSubmission, Result, SavedStory, SyncError,
};
pub use credentials::{CredentialProvider, SharedCredentials};
pub use delivery::{HttpDelivery, StoryDelivery};
pub use gate::{FlushTrigger, SubmissionGate, SubmitResult};
pub use messages::{BackgroundInbox, ClientMessage, MessageBus};
pub use notify::{ForegroundNotifier, NoopNotifier, NotificationSink, TracingNotifier};
pub use outbox::OutboxQueue;
pub use saved::{LocationFilter, SavedQuery, SavedSort, SavedStories};
pub use sync::{DrainPolicy, DrainReport, DrainStatus, SyncCoordinator};
