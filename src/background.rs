//! The background context: owns drains and reacts to sync triggers.

use crate::connectivity::Connectivity;
use crate::core::{Result, SyncError};
use crate::messages::{BackgroundInbox, ClientMessage};
use crate::notify::{DEFAULT_LOCAL_TITLE, NotificationSink};
use crate::sync::{DrainReport, SyncCoordinator};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Tag registered by the foreground after queuing a submission.
pub const SYNC_TAG: &str = "sync-new-stories";

/// Why a drain was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
    Startup,
    /// Back online. `deferred` lists the sync tags registered while offline,
    /// which this drain serves.
    ConnectivityRestored { deferred: Vec<String> },
    BackgroundSync(String),
    Periodic,
    FlushRequested,
}

/// Registers background-sync tags with the worker.
///
/// A tag registered while offline fires once connectivity returns; repeated
/// registrations of the same tag collapse into one event.
#[derive(Clone)]
pub struct SyncRegistrar {
    tx: mpsc::UnboundedSender<String>,
}

impl SyncRegistrar {
    pub fn register(&self, tag: &str) -> bool {
        self.tx.send(tag.to_string()).is_ok()
    }
}

pub struct BackgroundWorker {
    registrar: SyncRegistrar,
    reports: watch::Receiver<Option<(SyncTrigger, DrainReport)>>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    /// Starts the worker. Drains immediately when already online.
    ///
    /// `periodic` of `None` disables the periodic trigger.
    pub fn spawn(
        coordinator: Arc<SyncCoordinator>,
        connectivity: Connectivity,
        inbox: BackgroundInbox,
        notifier: Arc<dyn NotificationSink>,
        periodic: Option<Duration>,
    ) -> Self {
        let (tag_tx, tag_rx) = mpsc::unbounded_channel();
        let (report_tx, reports) = watch::channel(None);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let state = WorkerState {
            coordinator,
            connectivity,
            notifier,
            report_tx,
            pending_tags: BTreeSet::new(),
        };
        let join_handle = tokio::spawn(state.run(inbox, tag_rx, stop_rx, periodic));

        Self {
            registrar: SyncRegistrar { tx: tag_tx },
            reports,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    pub fn registrar(&self) -> SyncRegistrar {
        self.registrar.clone()
    }

    /// Most recent drain and what started it.
    pub fn reports(&self) -> watch::Receiver<Option<(SyncTrigger, DrainReport)>> {
        self.reports.clone()
    }

    /// Signals the worker to stop and waits for the current drain, if any, to end.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| {
                    SyncError::Io(std::io::Error::other(format!(
                        "background worker join: {}",
                        err
                    )))
                })?;
        }
        Ok(())
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

struct WorkerState {
    coordinator: Arc<SyncCoordinator>,
    connectivity: Connectivity,
    notifier: Arc<dyn NotificationSink>,
    report_tx: watch::Sender<Option<(SyncTrigger, DrainReport)>>,
    pending_tags: BTreeSet<String>,
}

impl WorkerState {
    async fn run(
        mut self,
        mut inbox: BackgroundInbox,
        mut tag_rx: mpsc::UnboundedReceiver<String>,
        mut stop_rx: oneshot::Receiver<()>,
        periodic: Option<Duration>,
    ) {
        let mut online_rx = self.connectivity.subscribe();
        let mut was_online = *online_rx.borrow_and_update();
        let mut ticker = periodic.map(periodic_ticker);
        let mut inbox_open = true;
        let mut tags_open = true;

        if was_online {
            self.drain(SyncTrigger::Startup).await;
        }

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    if online && !was_online {
                        let deferred = std::mem::take(&mut self.pending_tags)
                            .into_iter()
                            .collect();
                        self.drain(SyncTrigger::ConnectivityRestored { deferred }).await;
                    }
                    was_online = online;
                }
                tag = tag_rx.recv(), if tags_open => match tag {
                    Some(tag) if self.connectivity.is_online() => {
                        self.drain(SyncTrigger::BackgroundSync(tag)).await;
                    }
                    Some(tag) => {
                        debug!(tag = %tag, "offline, sync deferred");
                        self.pending_tags.insert(tag);
                    }
                    None => tags_open = false,
                },
                message = inbox.recv(), if inbox_open => match message {
                    Some(message) => self.handle_message(message).await,
                    None => inbox_open = false,
                },
                _ = next_tick(&mut ticker), if ticker.is_some() => {
                    if self.connectivity.is_online() {
                        self.drain(SyncTrigger::Periodic).await;
                    }
                }
            }
        }
        debug!("background worker stopped");
    }

    async fn handle_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::FlushOutbox => self.drain(SyncTrigger::FlushRequested).await,
            ClientMessage::LocalNotify { title, body } => {
                let title = title.unwrap_or_else(|| DEFAULT_LOCAL_TITLE.to_string());
                self.notifier.show(&title, &body);
            }
            other => {
                debug!(message = ?other, "ignoring message not meant for the background")
            }
        }
    }

    async fn drain(&mut self, trigger: SyncTrigger) {
        info!(trigger = ?trigger, "starting drain");
        // A panicking delivery must not take the worker down with it.
        match AssertUnwindSafe(self.coordinator.drain()).catch_unwind().await {
            Ok(report) => {
                self.report_tx.send_replace(Some((trigger, report)));
            }
            Err(_) => error!(trigger = ?trigger, "drain panicked; records stay queued"),
        }
    }
}

fn periodic_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
