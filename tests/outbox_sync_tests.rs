mod common;

use async_trait::async_trait;
use common::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storysync::storage::{SNAPSHOT_FILE, StoreHandle, StoreOptions, WAL_FILE, default_schema};
use storysync::{
    ClientMessage, Connectivity, DeliveryOutcome, DrainPolicy, DrainStatus, FailureReason,
    FlushTrigger, MessageBus, OutboxQueue, QueuedSubmission, SharedCredentials, StoryDelivery,
    SubmissionGate, SubmitResult, SyncCoordinator, SyncError,
};
use tempfile::TempDir;

fn coordinator(
    dir: &TempDir,
    delivery: Arc<ScriptedDelivery>,
    notifier: Arc<RecordingNotifier>,
) -> SyncCoordinator {
    SyncCoordinator::new(outbox_in(dir.path()), delivery, notifier)
}

fn gate(dir: &TempDir, delivery: Arc<ScriptedDelivery>, online: bool) -> SubmissionGate {
    SubmissionGate::new(
        outbox_in(dir.path()),
        delivery,
        Connectivity::new(online),
        Arc::new(SharedCredentials::new(Some("token-123".to_string()))),
    )
}

// ============================================================================
// Queue properties
// ============================================================================

#[tokio::test]
async fn test_offline_submissions_are_listed_exactly_once() {
    let dir = TempDir::new().unwrap();
    let delivery = Arc::new(ScriptedDelivery::always_ok());
    let gate = gate(&dir, delivery.clone(), false);
    let outbox = outbox_in(dir.path());

    let mut ids = Vec::new();
    for description in ["first", "second", "third"] {
        match gate.submit(submission(description)).await.unwrap() {
            SubmitResult::Queued { id, reason } => {
                assert!(reason.is_none());
                ids.push(id);
            }
            other => panic!("expected queued, got {:?}", other),
        }

        let listed = outbox.list_all().await.unwrap();
        let last = *ids.last().unwrap();
        assert_eq!(listed.iter().filter(|r| r.id == Some(last)).count(), 1);
        assert_eq!(listed.len(), ids.len());
    }

    assert_eq!(delivery.call_count(), 0);
}

#[tokio::test]
async fn test_delivered_records_are_removed_once_and_redrain_is_noop() {
    let dir = TempDir::new().unwrap();
    let outbox = outbox_in(dir.path());
    outbox.enqueue(queued("a")).await.unwrap();
    outbox.enqueue(queued("b")).await.unwrap();

    let delivery = Arc::new(ScriptedDelivery::always_ok());
    let notifier = Arc::new(RecordingNotifier::default());
    let coordinator = coordinator(&dir, delivery.clone(), notifier.clone());

    let first = coordinator.drain().await;
    assert_eq!(first.status, DrainStatus::Completed);
    assert_eq!(first.delivered.len(), 2);
    assert!(outbox.is_empty().await.unwrap());

    let second = coordinator.drain().await;
    assert_eq!(second.status, DrainStatus::Completed);
    assert_eq!(second.snapshot_len, 0);
    assert_eq!(second.attempted, 0);
    assert_eq!(delivery.call_count(), 2);
    assert_eq!(notifier.uploaded(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_drain_preserves_enqueue_order() {
    let dir = TempDir::new().unwrap();
    let outbox = outbox_in(dir.path());
    let a = outbox.enqueue(queued("A")).await.unwrap();
    let b = outbox.enqueue(queued("B")).await.unwrap();
    let c = outbox.enqueue(queued("C")).await.unwrap();

    let delivery = Arc::new(ScriptedDelivery::always_ok());
    let report = coordinator(&dir, delivery.clone(), Arc::default()).drain().await;

    assert_eq!(delivery.calls(), vec!["A", "B", "C"]);
    assert_eq!(report.delivered, vec![a, b, c]);
}

#[tokio::test]
async fn test_auth_failure_short_circuits_drain() {
    let dir = TempDir::new().unwrap();
    let outbox = outbox_in(dir.path());
    for description in ["A", "B", "C"] {
        outbox.enqueue(queued(description)).await.unwrap();
    }

    let delivery = Arc::new(ScriptedDelivery::new([failed(FailureReason::Auth)]));
    let notifier = Arc::new(RecordingNotifier::default());
    let report = coordinator(&dir, delivery.clone(), notifier.clone())
        .drain()
        .await;

    assert_eq!(report.status, DrainStatus::AbortedOnAuth);
    assert_eq!(delivery.calls(), vec!["A"]);
    assert_eq!(outbox.len().await.unwrap(), 3);
    assert!(notifier.uploaded().is_empty());
}

#[tokio::test]
async fn test_transient_failure_is_isolated_to_its_record() {
    let dir = TempDir::new().unwrap();
    let outbox = outbox_in(dir.path());
    let a = outbox.enqueue(queued("A")).await.unwrap();
    let b = outbox.enqueue(queued("B")).await.unwrap();

    let delivery = Arc::new(ScriptedDelivery::new([failed(FailureReason::Timeout)]));
    let report = coordinator(&dir, delivery.clone(), Arc::default()).drain().await;

    assert_eq!(report.status, DrainStatus::Completed);
    assert_eq!(report.failed, vec![a]);
    assert_eq!(report.delivered, vec![b]);
    assert!(outbox.get(a).await.unwrap().is_some());
    assert!(outbox.get(b).await.unwrap().is_none());
}

#[tokio::test]
async fn test_abort_policy_stops_on_transient_failure() {
    let dir = TempDir::new().unwrap();
    let outbox = outbox_in(dir.path());
    outbox.enqueue(queued("A")).await.unwrap();
    outbox.enqueue(queued("B")).await.unwrap();

    let delivery = Arc::new(ScriptedDelivery::new([failed(FailureReason::Status {
        code: 503,
        message: "unavailable".to_string(),
    })]));
    let report = coordinator(&dir, delivery.clone(), Arc::default())
        .with_policy(DrainPolicy::AbortOnFirstFailure)
        .drain()
        .await;

    assert_eq!(report.status, DrainStatus::AbortedOnFailure);
    assert_eq!(delivery.call_count(), 1);
    assert_eq!(outbox.len().await.unwrap(), 2);
}

#[tokio::test]
async fn test_concurrent_drains_make_a_single_pass() {
    let dir = TempDir::new().unwrap();
    let outbox = outbox_in(dir.path());
    outbox.enqueue(queued("A")).await.unwrap();
    outbox.enqueue(queued("B")).await.unwrap();

    let delivery = Arc::new(GatedDelivery::new());
    let coordinator = Arc::new(SyncCoordinator::new(
        outbox.clone(),
        delivery.clone(),
        Arc::new(RecordingNotifier::default()),
    ));

    let first = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.drain().await })
    };
    delivery.started.acquire().await.unwrap().forget();
    assert!(coordinator.is_draining());

    let second = coordinator.drain().await;
    assert_eq!(second.status, DrainStatus::AlreadyRunning);
    assert_eq!(second.attempted, 0);

    delivery.release.add_permits(2);
    let first = first.await.unwrap();
    assert_eq!(first.status, DrainStatus::Completed);
    assert_eq!(first.delivered.len(), 2);
    assert_eq!(delivery.call_count(), 2);
    assert!(!coordinator.is_draining());
}

#[tokio::test]
async fn test_records_enqueued_during_drain_wait_for_next_pass() {
    let dir = TempDir::new().unwrap();
    let outbox = outbox_in(dir.path());
    outbox.enqueue(queued("A")).await.unwrap();

    let delivery = Arc::new(GatedDelivery::new());
    let coordinator = Arc::new(SyncCoordinator::new(
        outbox.clone(),
        delivery.clone(),
        Arc::new(RecordingNotifier::default()),
    ));
    let running = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.drain().await })
    };
    delivery.started.acquire().await.unwrap().forget();

    let late = outbox.enqueue(queued("late")).await.unwrap();
    delivery.release.add_permits(1);
    let report = running.await.unwrap();

    assert_eq!(report.snapshot_len, 1);
    assert!(outbox.get(late).await.unwrap().is_some());

    delivery.release.add_permits(1);
    let next = coordinator.drain().await;
    assert_eq!(next.delivered, vec![late]);
}

// ============================================================================
// Gate + coordinator scenarios
// ============================================================================

#[tokio::test]
async fn test_offline_submit_then_reconnect_and_drain() {
    let dir = TempDir::new().unwrap();
    let delivery = Arc::new(ScriptedDelivery::always_ok());
    let notifier = Arc::new(RecordingNotifier::default());
    let connectivity = Connectivity::new(false);
    let gate = SubmissionGate::new(
        outbox_in(dir.path()),
        delivery.clone(),
        connectivity.clone(),
        Arc::new(SharedCredentials::new(Some("token-123".to_string()))),
    );
    let outbox = outbox_in(dir.path());

    let result = gate.submit(submission("beach at dusk")).await.unwrap();
    assert!(result.is_queued());
    assert_eq!(outbox.list_all().await.unwrap().len(), 1);

    connectivity.set_online(true);
    let report = coordinator(&dir, delivery, notifier.clone()).drain().await;

    assert_eq!(report.delivered.len(), 1);
    assert!(outbox.list_all().await.unwrap().is_empty());
    assert_eq!(notifier.uploaded(), vec!["beach at dusk"]);
}

#[tokio::test]
async fn test_online_network_failure_falls_back_to_queue() {
    let dir = TempDir::new().unwrap();
    let delivery = Arc::new(ScriptedDelivery::new([failed(FailureReason::Transport(
        "connection reset".to_string(),
    ))]));
    let (bus, mut inbox) = MessageBus::channel();
    let gate = gate(&dir, delivery.clone(), true).with_flush_trigger(FlushTrigger::Message(bus));

    let result = gate.submit(submission("mountain")).await.unwrap();

    assert!(matches!(
        result,
        SubmitResult::Queued {
            reason: Some(FailureReason::Transport(_)),
            ..
        }
    ));
    assert_eq!(outbox_in(dir.path()).len().await.unwrap(), 1);
    assert_eq!(delivery.call_count(), 1);
    assert_eq!(inbox.recv().await, Some(ClientMessage::FlushOutbox));
}

#[tokio::test]
async fn test_invalid_credential_leaves_whole_queue() {
    let dir = TempDir::new().unwrap();
    let outbox = outbox_in(dir.path());
    for description in ["one", "two", "three"] {
        outbox.enqueue(queued(description)).await.unwrap();
    }

    let delivery = Arc::new(ScriptedDelivery::new([
        failed(FailureReason::Auth),
        failed(FailureReason::Auth),
        failed(FailureReason::Auth),
    ]));
    let report = coordinator(&dir, delivery.clone(), Arc::default()).drain().await;

    assert_eq!(report.status, DrainStatus::AbortedOnAuth);
    assert_eq!(outbox.len().await.unwrap(), 3);
    assert_eq!(delivery.call_count(), 1);
}

#[tokio::test]
async fn test_online_success_bypasses_outbox() {
    let dir = TempDir::new().unwrap();
    let delivery = Arc::new(ScriptedDelivery::always_ok());
    let gate = gate(&dir, delivery.clone(), true);

    let result = gate.submit(submission("direct")).await.unwrap();

    assert!(matches!(result, SubmitResult::Delivered(ref api) if !api.error));
    assert!(outbox_in(dir.path()).is_empty().await.unwrap());
}

#[tokio::test]
async fn test_rejected_credential_queues_without_flush_request() {
    let dir = TempDir::new().unwrap();
    let delivery = Arc::new(ScriptedDelivery::new([failed(FailureReason::Auth)]));
    let (bus, mut inbox) = MessageBus::channel();
    let gate = gate(&dir, delivery, true).with_flush_trigger(FlushTrigger::Message(bus));

    let result = gate.submit(submission("expired session")).await.unwrap();

    assert!(matches!(
        result,
        SubmitResult::Queued {
            reason: Some(FailureReason::Auth),
            ..
        }
    ));
    let pending = tokio::time::timeout(Duration::from_millis(50), inbox.recv()).await;
    assert!(pending.is_err());
}

#[tokio::test]
async fn test_submit_requires_credential_and_valid_input() {
    let dir = TempDir::new().unwrap();
    let delivery = Arc::new(ScriptedDelivery::always_ok());
    let signed_out = SubmissionGate::new(
        outbox_in(dir.path()),
        delivery.clone(),
        Connectivity::new(false),
        Arc::new(SharedCredentials::default()),
    );

    let err = signed_out.submit(submission("no token")).await.unwrap_err();
    assert!(matches!(err, SyncError::NotAuthenticated(_)));

    let err = gate(&dir, delivery.clone(), true)
        .submit(submission("  "))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    assert!(outbox_in(dir.path()).is_empty().await.unwrap());
    assert_eq!(delivery.call_count(), 0);
}

// ============================================================================
// Storage failures
// ============================================================================

/// A data dir path that cannot be created because a file sits in its way.
fn unusable_dir(dir: &TempDir) -> PathBuf {
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();
    blocker.join("store")
}

/// Replaces `path` with a non-empty directory so any file operation on it fails.
fn occupy_with_dir(path: &Path) {
    if path.is_file() {
        std::fs::remove_file(path).unwrap();
    }
    std::fs::create_dir(path).unwrap();
    std::fs::write(path.join("occupied"), b"x").unwrap();
}

/// Delivers successfully, but the WAL becomes unusable during the first call.
struct BreaksWalOnDelivery {
    data_dir: PathBuf,
    inner: ScriptedDelivery,
}

#[async_trait]
impl StoryDelivery for BreaksWalOnDelivery {
    async fn deliver(&self, submission: &QueuedSubmission) -> DeliveryOutcome {
        let wal = self.data_dir.join(WAL_FILE);
        if wal.is_file() {
            occupy_with_dir(&wal);
        }
        self.inner.deliver(submission).await
    }
}

#[tokio::test]
async fn test_unreadable_outbox_reports_storage_unavailable() {
    let dir = TempDir::new().unwrap();
    let delivery = Arc::new(ScriptedDelivery::always_ok());
    let coordinator = SyncCoordinator::new(
        outbox_in(&unusable_dir(&dir)),
        delivery.clone(),
        Arc::new(RecordingNotifier::default()),
    );

    let report = coordinator.drain().await;

    assert_eq!(report.status, DrainStatus::StorageUnavailable);
    assert_eq!(report.snapshot_len, 0);
    assert_eq!(delivery.call_count(), 0);
    assert!(!coordinator.is_draining());
}

#[tokio::test]
async fn test_failed_removal_stops_drain_without_notifying() {
    let dir = TempDir::new().unwrap();
    let outbox = outbox_in(dir.path());
    let first = outbox.enqueue(queued("A")).await.unwrap();
    outbox.enqueue(queued("B")).await.unwrap();

    let delivery = Arc::new(BreaksWalOnDelivery {
        data_dir: dir.path().to_path_buf(),
        inner: ScriptedDelivery::always_ok(),
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let report = SyncCoordinator::new(outbox, delivery.clone(), notifier.clone())
        .drain()
        .await;

    assert_eq!(report.status, DrainStatus::StorageUnavailable);
    assert_eq!(report.snapshot_len, 2);
    assert_eq!(report.attempted, 1);
    assert_eq!(report.delivered, vec![first]);
    assert_eq!(delivery.inner.calls(), vec!["A"]);
    assert!(notifier.uploaded().is_empty());
}

#[tokio::test]
async fn test_submit_surfaces_storage_error_when_fallback_fails() {
    let dir = TempDir::new().unwrap();
    let delivery = Arc::new(ScriptedDelivery::new([failed(FailureReason::Timeout)]));
    let (bus, mut inbox) = MessageBus::channel();
    let gate = SubmissionGate::new(
        outbox_in(&unusable_dir(&dir)),
        delivery.clone(),
        Connectivity::new(true),
        Arc::new(SharedCredentials::new(Some("token-123".to_string()))),
    )
    .with_flush_trigger(FlushTrigger::Message(bus));

    let err = gate.submit(submission("lost signal")).await.unwrap_err();

    assert!(err.is_storage(), "{:?}", err);
    assert_eq!(delivery.call_count(), 1);
    let pending = tokio::time::timeout(Duration::from_millis(50), inbox.recv()).await;
    assert!(pending.is_err());
}

#[tokio::test]
async fn test_failed_checkpoint_does_not_fail_or_duplicate_submission() {
    let dir = TempDir::new().unwrap();
    let outbox = OutboxQueue::new(StoreHandle::new(
        StoreOptions::new(dir.path(), default_schema()).checkpoint_threshold(1),
    ));
    assert!(outbox.is_empty().await.unwrap());
    occupy_with_dir(&dir.path().join(SNAPSHOT_FILE));

    let gate = SubmissionGate::new(
        outbox.clone(),
        Arc::new(ScriptedDelivery::always_ok()),
        Connectivity::new(false),
        Arc::new(SharedCredentials::new(Some("token-123".to_string()))),
    );

    let first = gate.submit(submission("stormy pier")).await.unwrap();
    assert!(matches!(first, SubmitResult::Queued { id: 1, .. }));
    assert_eq!(outbox.len().await.unwrap(), 1);

    let second = gate.submit(submission("calm pier")).await.unwrap();
    assert!(matches!(second, SubmitResult::Queued { id: 2, .. }));
    let descriptions: Vec<String> = outbox
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.description)
        .collect();
    assert_eq!(descriptions, vec!["stormy pier", "calm pier"]);
}
