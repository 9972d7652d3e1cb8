pub mod error;
pub mod types;

pub use error::{Result, SyncError};
pub use types::{
    ApiResponse, DEFAULT_PHOTO_FILE_NAME, DeliveryOutcome, FailureReason, GeoPoint,
    NewSubmission, Photo, QueuedSubmission, SavedStory,
};
