#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use storysync::storage::{StoreHandle, StoreOptions, default_schema};
use storysync::{
    ApiResponse, DeliveryOutcome, FailureReason, NewSubmission, NotificationSink, OutboxQueue,
    Photo, QueuedSubmission, StoryDelivery,
};
use tokio::sync::Semaphore;

pub fn store_handle(dir: &Path) -> StoreHandle {
    StoreHandle::new(StoreOptions::new(dir, default_schema()))
}

pub fn outbox_in(dir: &Path) -> OutboxQueue {
    OutboxQueue::new(store_handle(dir))
}

pub fn photo() -> Photo {
    Photo::new(vec![0xFF, 0xD8, 0xFF, 0xE0], "image/jpeg")
}

pub fn submission(description: &str) -> NewSubmission {
    NewSubmission::new(description, photo())
}

pub fn queued(description: &str) -> QueuedSubmission {
    QueuedSubmission::new(submission(description), "token-123")
}

pub fn delivered() -> DeliveryOutcome {
    DeliveryOutcome::Delivered(ApiResponse {
        error: false,
        message: "Story created successfully".to_string(),
    })
}

pub fn failed(reason: FailureReason) -> DeliveryOutcome {
    DeliveryOutcome::Failed(reason)
}

/// Replays scripted outcomes in order, then falls back to success.
/// Records the description of every submission it was asked to deliver.
#[derive(Default)]
pub struct ScriptedDelivery {
    script: Mutex<VecDeque<DeliveryOutcome>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedDelivery {
    pub fn new(script: impl IntoIterator<Item = DeliveryOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl StoryDelivery for ScriptedDelivery {
    async fn deliver(&self, submission: &QueuedSubmission) -> DeliveryOutcome {
        self.calls
            .lock()
            .unwrap()
            .push(submission.description.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(delivered)
    }
}

/// Blocks every delivery until the test hands out a permit.
pub struct GatedDelivery {
    pub started: Semaphore,
    pub release: Semaphore,
    calls: AtomicUsize,
}

impl GatedDelivery {
    pub fn new() -> Self {
        Self {
            started: Semaphore::new(0),
            release: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoryDelivery for GatedDelivery {
    async fn deliver(&self, _submission: &QueuedSubmission) -> DeliveryOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.add_permits(1);
        self.release.acquire().await.unwrap().forget();
        delivered()
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    uploaded: Mutex<Vec<String>>,
    shown: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }

    pub fn shown(&self) -> Vec<(String, String)> {
        self.shown.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingNotifier {
    fn story_uploaded(&self, submission: &QueuedSubmission) {
        self.uploaded
            .lock()
            .unwrap()
            .push(submission.description.clone());
    }

    fn show(&self, title: &str, body: &str) {
        self.shown
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
    }
}
