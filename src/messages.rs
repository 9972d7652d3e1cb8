//! Messages exchanged between the foreground and the background context.

use crate::core::{Result, SyncError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const BACKGROUND_QUEUE_CAPACITY: usize = 64;
const FOREGROUND_QUEUE_CAPACITY: usize = 64;

/// Wire shape: a JSON object tagged by `type`, e.g. `{"type":"FLUSH_OUTBOX"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Foreground asks the background context to drain the outbox.
    FlushOutbox,
    /// Background tells the foreground a record was delivered.
    RefreshHome,
    /// Background tells the foreground to change route.
    Navigate { url: String },
    /// Foreground asks the background context to show a local notification.
    LocalNotify {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        body: String,
    },
}

impl ClientMessage {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SyncError::Serialization(format!("invalid client message: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

/// Receiving end owned by the background context.
pub struct BackgroundInbox {
    rx: mpsc::Receiver<ClientMessage>,
}

impl BackgroundInbox {
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        self.rx.recv().await
    }
}

/// Both directions of the foreground/background channel.
#[derive(Clone)]
pub struct MessageBus {
    to_background: mpsc::Sender<ClientMessage>,
    to_foreground: broadcast::Sender<ClientMessage>,
}

impl MessageBus {
    pub fn channel() -> (Self, BackgroundInbox) {
        let (to_background, rx) = mpsc::channel(BACKGROUND_QUEUE_CAPACITY);
        let (to_foreground, _) = broadcast::channel(FOREGROUND_QUEUE_CAPACITY);
        (
            Self {
                to_background,
                to_foreground,
            },
            BackgroundInbox { rx },
        )
    }

    /// Fire-and-forget post to the background context. Returns whether it was accepted.
    pub fn post_to_background(&self, message: ClientMessage) -> bool {
        match self.to_background.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                debug!(?message, "background queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(message)) => {
                warn!(?message, "no background context is listening");
                false
            }
        }
    }

    /// Broadcasts to every open foreground subscriber. Zero subscribers is not an error.
    pub fn post_to_foreground(&self, message: ClientMessage) -> usize {
        self.to_foreground.send(message).unwrap_or(0)
    }

    pub fn subscribe_foreground(&self) -> broadcast::Receiver<ClientMessage> {
        self.to_foreground.subscribe()
    }
}
