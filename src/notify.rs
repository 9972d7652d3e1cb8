//! Completion notifications emitted by the background context.

use crate::core::QueuedSubmission;
use crate::messages::{ClientMessage, MessageBus};
use tracing::info;

/// Title of the notification shown after a queued story is delivered.
pub const UPLOADED_TITLE: &str = "Sync succeeded";
/// Title used for local notifications that did not carry one.
pub const DEFAULT_LOCAL_TITLE: &str = "Story";

pub trait NotificationSink: Send + Sync {
    /// A queued submission was delivered and removed from the outbox.
    fn story_uploaded(&self, submission: &QueuedSubmission);

    /// A plain local notification.
    fn show(&self, title: &str, body: &str);
}

pub struct NoopNotifier;

impl NotificationSink for NoopNotifier {
    fn story_uploaded(&self, _submission: &QueuedSubmission) {}

    fn show(&self, _title: &str, _body: &str) {}
}

/// Renders notifications as log events.
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn story_uploaded(&self, submission: &QueuedSubmission) {
        self.show(UPLOADED_TITLE, &submission.description);
    }

    fn show(&self, title: &str, body: &str) {
        info!(title, body, "notification");
    }
}

/// Logs the notification and tells every open foreground to refresh its lists.
pub struct ForegroundNotifier {
    bus: MessageBus,
}

impl ForegroundNotifier {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }
}

impl NotificationSink for ForegroundNotifier {
    fn story_uploaded(&self, submission: &QueuedSubmission) {
        TracingNotifier.story_uploaded(submission);
        self.bus.post_to_foreground(ClientMessage::RefreshHome);
    }

    fn show(&self, title: &str, body: &str) {
        TracingNotifier.show(title, body);
    }
}
