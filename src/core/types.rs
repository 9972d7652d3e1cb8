use super::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// File name used for the photo part when the caller did not supply one.
pub const DEFAULT_PHOTO_FILE_NAME: &str = "offline.jpg";

// ============================================================================
// Submission payload
// ============================================================================

/// A latitude/longitude pair. Carried as a unit so a story can never hold
/// one coordinate without the other.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Builds a point from two optional coordinates, rejecting a half-set pair.
    pub fn from_parts(lat: Option<f64>, lon: Option<f64>) -> Result<Option<Self>> {
        match (lat, lon) {
            (Some(lat), Some(lon)) => Ok(Some(Self { lat, lon })),
            (None, None) => Ok(None),
            _ => Err(SyncError::Validation(
                "latitude and longitude must be provided together".to_string(),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(SyncError::Validation(format!(
                "latitude {} is out of range",
                self.lat
            )));
        }
        if !self.lon.is_finite() || !(-180.0..=180.0).contains(&self.lon) {
            return Err(SyncError::Validation(format!(
                "longitude {} is out of range",
                self.lon
            )));
        }
        Ok(())
    }
}

/// Binary photo payload with the metadata needed to send it as a multipart part.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
}

impl Photo {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            file_name: DEFAULT_PHOTO_FILE_NAME.to_string(),
            mime_type: mime_type.into(),
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Photo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Photo")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A story as entered by the user, before any credential is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubmission {
    pub description: String,
    pub photo: Photo,
    pub location: Option<GeoPoint>,
}

impl NewSubmission {
    pub fn new(description: impl Into<String>, photo: Photo) -> Self {
        Self {
            description: description.into(),
            photo,
            location: None,
        }
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }
}

// ============================================================================
// Durable records
// ============================================================================

/// One not-yet-delivered story sitting in the outbox.
///
/// `id` is `None` until the record store assigns it on insert. The record is
/// never mutated after that; it is either delivered and removed, or left as is.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedSubmission {
    pub id: Option<u64>,
    pub description: String,
    pub photo: Photo,
    pub location: Option<GeoPoint>,
    /// Credential captured at enqueue time. Never refreshed.
    pub auth_token: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedSubmission {
    pub fn new(submission: NewSubmission, auth_token: impl Into<String>) -> Self {
        Self {
            id: None,
            description: submission.description,
            photo: submission.photo,
            location: submission.location,
            auth_token: auth_token.into(),
            enqueued_at: Utc::now(),
        }
    }

    /// Whether the record carries everything a delivery attempt needs.
    pub fn is_deliverable(&self) -> bool {
        !self.auth_token.is_empty() && !self.photo.is_empty()
    }
}

impl fmt::Debug for QueuedSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedSubmission")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("photo", &self.photo)
            .field("location", &self.location)
            .field("auth_token", &"<redacted>")
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

/// A user-pinned copy of an already published story, kept for offline viewing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedStory {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub photo_url: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
}

impl SavedStory {
    pub fn location(&self) -> Option<GeoPoint> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
            _ => None,
        }
    }
}

// ============================================================================
// Delivery results
// ============================================================================

/// Body returned by the remote API, both on success and on error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The credential was rejected (HTTP 401).
    Auth,
    /// Any other non-2xx response.
    Status { code: u16, message: String },
    Timeout,
    Transport(String),
}

impl FailureReason {
    /// Authentication failures only clear up after the user signs in again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth => f.write_str("auth"),
            Self::Status { code, message } if message.is_empty() => write!(f, "http {}", code),
            Self::Status { code, message } => write!(f, "http {}: {}", code, message),
            Self::Timeout => f.write_str("timeout"),
            Self::Transport(msg) => write!(f, "transport: {}", msg),
        }
    }
}

/// Transient result of one delivery attempt. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered(ApiResponse),
    Failed(FailureReason),
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }

    /// `None` on success.
    pub fn retryable(&self) -> Option<bool> {
        match self {
            Self::Delivered(_) => None,
            Self::Failed(reason) => Some(reason.is_retryable()),
        }
    }
}
