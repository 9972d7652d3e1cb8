//! Submission gate: direct delivery when online, durable queuing otherwise.

use crate::background::{SYNC_TAG, SyncRegistrar};
use crate::connectivity::Connectivity;
use crate::core::{
    ApiResponse, DeliveryOutcome, FailureReason, NewSubmission, QueuedSubmission, Result,
    SyncError,
};
use crate::credentials::CredentialProvider;
use crate::delivery::StoryDelivery;
use crate::messages::{ClientMessage, MessageBus};
use crate::outbox::OutboxQueue;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Upload size accepted by the remote API.
pub const DEFAULT_MAX_PHOTO_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitResult {
    /// Published immediately; the outbox was not touched.
    Delivered(ApiResponse),
    /// Stored in the outbox for the background context to deliver.
    /// `reason` is `None` when no attempt was made because the device was offline.
    Queued {
        id: u64,
        reason: Option<FailureReason>,
    },
}

impl SubmitResult {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

/// How the gate asks the background context to flush after queuing.
#[derive(Clone)]
pub enum FlushTrigger {
    /// Register the background-sync tag; the worker fires once online.
    BackgroundSync(SyncRegistrar),
    /// Post `FLUSH_OUTBOX` directly.
    Message(MessageBus),
    Disabled,
}

impl FlushTrigger {
    fn request(&self) {
        let accepted = match self {
            Self::BackgroundSync(registrar) => registrar.register(SYNC_TAG),
            Self::Message(bus) => bus.post_to_background(ClientMessage::FlushOutbox),
            Self::Disabled => return,
        };
        if !accepted {
            event!(Level::DEBUG, "flush request not accepted");
        }
    }
}

/// Checks a submission before any network or storage work.
pub fn validate_submission(submission: &NewSubmission, max_photo_bytes: usize) -> Result<()> {
    if submission.description.trim().is_empty() {
        return Err(SyncError::Validation("description is required".to_string()));
    }
    let photo = &submission.photo;
    if photo.is_empty() {
        return Err(SyncError::Validation("photo is required".to_string()));
    }
    if photo.len() > max_photo_bytes {
        return Err(SyncError::Validation(format!(
            "photo is {} bytes, limit is {}",
            photo.len(),
            max_photo_bytes
        )));
    }
    if !photo.mime_type.to_ascii_lowercase().starts_with("image/") {
        return Err(SyncError::Validation(format!(
            "photo must be an image, got '{}'",
            photo.mime_type
        )));
    }
    if let Some(location) = &submission.location {
        location.validate()?;
    }
    Ok(())
}

pub struct SubmissionGate {
    outbox: OutboxQueue,
    delivery: Arc<dyn StoryDelivery>,
    connectivity: Connectivity,
    credentials: Arc<dyn CredentialProvider>,
    flush: FlushTrigger,
    max_photo_bytes: usize,
}

impl SubmissionGate {
    pub fn new(
        outbox: OutboxQueue,
        delivery: Arc<dyn StoryDelivery>,
        connectivity: Connectivity,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            outbox,
            delivery,
            connectivity,
            credentials,
            flush: FlushTrigger::Disabled,
            max_photo_bytes: DEFAULT_MAX_PHOTO_BYTES,
        }
    }

    pub fn with_flush_trigger(mut self, flush: FlushTrigger) -> Self {
        self.flush = flush;
        self
    }

    pub fn with_max_photo_bytes(mut self, max_photo_bytes: usize) -> Self {
        self.max_photo_bytes = max_photo_bytes;
        self
    }

    /// Submits a story.
    ///
    /// Errors only for validation, a missing credential, or a store that
    /// cannot accept the fallback write. Every delivery failure ends in the outbox.
    pub async fn submit(&self, submission: NewSubmission) -> Result<SubmitResult> {
        validate_submission(&submission, self.max_photo_bytes)?;
        let token = self.credentials.token().ok_or_else(|| {
            SyncError::NotAuthenticated("sign in before submitting a story".to_string())
        })?;
        let record = QueuedSubmission::new(submission, token);

        let span = info_span!("gate.submit", online = self.connectivity.is_online());
        async {
            if !self.connectivity.is_online() {
                event!(Level::DEBUG, "offline, queuing without a delivery attempt");
                return self.queue(record, None).await;
            }

            match self.delivery.deliver(&record).await {
                DeliveryOutcome::Delivered(api) => Ok(SubmitResult::Delivered(api)),
                DeliveryOutcome::Failed(reason) => {
                    if reason.is_retryable() {
                        event!(Level::WARN, reason = %reason, "direct delivery failed, queuing");
                    } else {
                        event!(
                            Level::WARN,
                            "credential rejected, queuing until the user signs in again"
                        );
                    }
                    self.queue(record, Some(reason)).await
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn queue(
        &self,
        record: QueuedSubmission,
        reason: Option<FailureReason>,
    ) -> Result<SubmitResult> {
        let id = match self.outbox.enqueue(record).await {
            Ok(id) => id,
            Err(err) => {
                event!(
                    Level::ERROR,
                    error = %err,
                    "submission could not be queued and is held only by the caller"
                );
                return Err(err);
            }
        };

        // A rejected credential will be rejected again; wait for a later trigger.
        if !matches!(reason, Some(FailureReason::Auth)) {
            self.flush.request();
        }
        event!(Level::INFO, outbox_id = id, "submission queued");
        Ok(SubmitResult::Queued { id, reason })
    }
}
