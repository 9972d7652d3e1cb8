//! Wires the foreground context and the background worker around one store.

use crate::background::{BackgroundWorker, SyncTrigger};
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::core::{NewSubmission, Result};
use crate::credentials::{CredentialProvider, SharedCredentials};
use crate::delivery::{HttpDelivery, StoryDelivery};
use crate::gate::{FlushTrigger, SubmissionGate, SubmitResult};
use crate::messages::{ClientMessage, MessageBus};
use crate::notify::{ForegroundNotifier, NotificationSink};
use crate::outbox::OutboxQueue;
use crate::saved::SavedStories;
use crate::storage::StoreHandle;
use crate::sync::{DrainReport, SyncCoordinator};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub struct StorySyncBuilder {
    config: SyncConfig,
    delivery: Option<Arc<dyn StoryDelivery>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    connectivity: Option<Connectivity>,
}

impl StorySyncBuilder {
    pub fn delivery(mut self, delivery: Arc<dyn StoryDelivery>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Opens nothing eagerly; spawns the background worker. Requires a tokio runtime.
    pub fn start(self) -> Result<StorySync> {
        let config = self.config;
        let delivery = match self.delivery {
            Some(delivery) => delivery,
            None => Arc::new(HttpDelivery::new(
                &config.api_base_url,
                config.request_timeout,
            )?),
        };
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(SharedCredentials::default()));
        let connectivity = self.connectivity.unwrap_or_else(|| Connectivity::new(true));
        let (bus, inbox) = MessageBus::channel();
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(ForegroundNotifier::new(bus.clone())));

        // Each context gets its own handle; both resolve to the same store.
        let foreground_store = StoreHandle::new(config.store_options());
        let background_store = StoreHandle::new(config.store_options());

        let coordinator = Arc::new(
            SyncCoordinator::new(
                OutboxQueue::new(background_store),
                Arc::clone(&delivery),
                Arc::clone(&notifier),
            )
            .with_policy(config.drain_policy),
        );
        let worker = BackgroundWorker::spawn(
            Arc::clone(&coordinator),
            connectivity.clone(),
            inbox,
            notifier,
            config.background_sync_interval,
        );

        let flush = if config.background_sync_supported {
            FlushTrigger::BackgroundSync(worker.registrar())
        } else {
            FlushTrigger::Message(bus.clone())
        };
        let outbox = OutboxQueue::new(foreground_store.clone());
        let gate = SubmissionGate::new(outbox.clone(), delivery, connectivity.clone(), credentials)
            .with_flush_trigger(flush)
            .with_max_photo_bytes(config.max_photo_bytes);

        info!(data_dir = %config.data_dir.display(), "story sync started");
        Ok(StorySync {
            config,
            connectivity,
            bus,
            outbox,
            saved: SavedStories::new(foreground_store),
            gate,
            worker,
        })
    }
}

/// Foreground view of a running sync subsystem.
pub struct StorySync {
    config: SyncConfig,
    connectivity: Connectivity,
    bus: MessageBus,
    outbox: OutboxQueue,
    saved: SavedStories,
    gate: SubmissionGate,
    worker: BackgroundWorker,
}

impl StorySync {
    pub fn builder(config: SyncConfig) -> StorySyncBuilder {
        StorySyncBuilder {
            config,
            delivery: None,
            credentials: None,
            notifier: None,
            connectivity: None,
        }
    }

    pub async fn submit(&self, submission: NewSubmission) -> Result<SubmitResult> {
        self.gate.submit(submission).await
    }

    /// Asks the background worker to drain now.
    pub fn request_flush(&self) -> bool {
        self.bus.post_to_background(ClientMessage::FlushOutbox)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn outbox(&self) -> &OutboxQueue {
        &self.outbox
    }

    pub fn saved(&self) -> &SavedStories {
        &self.saved
    }

    pub fn drain_reports(&self) -> watch::Receiver<Option<(SyncTrigger, DrainReport)>> {
        self.worker.reports()
    }

    pub async fn shutdown(self) -> Result<()> {
        self.worker.stop().await
    }
}
