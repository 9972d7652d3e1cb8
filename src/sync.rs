//! Sync coordinator: drains the outbox through the delivery client.
//!
//! A drain works on the snapshot returned by one `list_all()` call and walks
//! it in store order. Records enqueued while a drain is running wait for the
//! next trigger. Only one drain per coordinator runs at a time; a second call
//! made while one is active returns [`DrainStatus::AlreadyRunning`] at once.
//!
//! Failure policy (default [`DrainPolicy::ContinuePastTransient`]):
//! - delivered: remove the record, then notify
//! - auth failure: stop the drain, keep the record and everything after it
//! - transient failure: keep the record and move on to the next one

use crate::core::{DeliveryOutcome, SyncError};
use crate::delivery::StoryDelivery;
use crate::notify::NotificationSink;
use crate::outbox::OutboxQueue;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Instrument, Level, debug, event, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainPolicy {
    /// Transient failures are isolated per record; auth failures end the drain.
    #[default]
    ContinuePastTransient,
    /// Any failure ends the drain.
    AbortOnFirstFailure,
}

impl FromStr for DrainPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" | "continue-past-transient" => Ok(Self::ContinuePastTransient),
            "abort" | "abort-on-first-failure" => Ok(Self::AbortOnFirstFailure),
            other => Err(SyncError::Config(format!("unknown drain policy '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// Every record in the snapshot was visited.
    Completed,
    /// Another drain held the guard; nothing was done.
    AlreadyRunning,
    /// A credential was rejected; remaining records were not attempted.
    AbortedOnAuth,
    /// A transient failure ended the drain under [`DrainPolicy::AbortOnFirstFailure`].
    AbortedOnFailure,
    /// The outbox could not be read, or a delivered record could not be removed.
    StorageUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub status: DrainStatus,
    /// Size of the snapshot taken at the start of the drain.
    pub snapshot_len: usize,
    /// Number of delivery calls made.
    pub attempted: usize,
    pub delivered: Vec<u64>,
    pub failed: Vec<u64>,
    /// Records left alone because they lack a credential or a photo.
    pub skipped: Vec<u64>,
}

impl DrainReport {
    fn new(status: DrainStatus) -> Self {
        Self {
            status,
            snapshot_len: 0,
            attempted: 0,
            delivered: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Records of the snapshot that are still queued (assuming removals succeeded).
    pub fn retained(&self) -> usize {
        self.snapshot_len.saturating_sub(self.delivered.len())
    }
}

/// Holds the drain flag for the duration of one drain; released on every exit path,
/// unwinding included.
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SyncCoordinator {
    outbox: OutboxQueue,
    delivery: Arc<dyn StoryDelivery>,
    notifier: Arc<dyn NotificationSink>,
    policy: DrainPolicy,
    draining: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(
        outbox: OutboxQueue,
        delivery: Arc<dyn StoryDelivery>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            outbox,
            delivery,
            notifier,
            policy: DrainPolicy::default(),
            draining: AtomicBool::new(false),
        }
    }

    pub fn with_policy(mut self, policy: DrainPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> DrainPolicy {
        self.policy
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// One pass over the current outbox snapshot.
    ///
    /// Delivery and storage failures are turned into the report's status and
    /// never returned as errors.
    pub async fn drain(&self) -> DrainReport {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            debug!("drain already running");
            return DrainReport::new(DrainStatus::AlreadyRunning);
        };

        let span = info_span!("sync.drain", policy = ?self.policy);
        let report = self.drain_snapshot().instrument(span).await;
        event!(
            Level::INFO,
            status = ?report.status,
            snapshot = report.snapshot_len,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "drain finished"
        );
        report
    }

    async fn drain_snapshot(&self) -> DrainReport {
        let mut report = DrainReport::new(DrainStatus::Completed);

        let snapshot = match self.outbox.list_all().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                event!(Level::ERROR, error = %err, "outbox unavailable");
                report.status = DrainStatus::StorageUnavailable;
                return report;
            }
        };
        report.snapshot_len = snapshot.len();

        for record in snapshot {
            let Some(id) = record.id else {
                continue;
            };
            if !record.is_deliverable() {
                event!(Level::WARN, outbox_id = id, "skipping record without credential or photo");
                report.skipped.push(id);
                continue;
            }

            report.attempted += 1;
            match self.delivery.deliver(&record).await {
                DeliveryOutcome::Delivered(_) => {
                    report.delivered.push(id);
                    if let Err(err) = self.outbox.remove(id).await {
                        event!(
                            Level::ERROR,
                            outbox_id = id,
                            error = %err,
                            "delivered record could not be removed"
                        );
                        report.status = DrainStatus::StorageUnavailable;
                        break;
                    }
                    self.notifier.story_uploaded(&record);
                }
                DeliveryOutcome::Failed(reason) if !reason.is_retryable() => {
                    event!(
                        Level::WARN,
                        outbox_id = id,
                        reason = %reason,
                        "credential rejected, stopping drain"
                    );
                    report.failed.push(id);
                    report.status = DrainStatus::AbortedOnAuth;
                    break;
                }
                DeliveryOutcome::Failed(reason) => {
                    event!(
                        Level::WARN,
                        outbox_id = id,
                        reason = %reason,
                        "delivery failed, record stays queued"
                    );
                    report.failed.push(id);
                    if self.policy == DrainPolicy::AbortOnFirstFailure {
                        report.status = DrainStatus::AbortedOnFailure;
                        break;
                    }
                }
            }
        }

        report
    }
}
