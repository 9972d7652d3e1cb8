//! Delivery client: one network attempt per submission, no queue knowledge.

use crate::core::{
    ApiResponse, DeliveryOutcome, FailureReason, Photo, QueuedSubmission, Result, SyncError,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};

/// Default bound on a single delivery attempt.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait StoryDelivery: Send + Sync {
    /// Attempts to publish one submission. Never touches the outbox.
    async fn deliver(&self, submission: &QueuedSubmission) -> DeliveryOutcome;
}

/// `POST {base_url}/stories` as multipart with a bearer credential.
#[derive(Debug, Clone)]
pub struct HttpDelivery {
    client: reqwest::Client,
    stories_url: String,
    timeout: Duration,
}

impl HttpDelivery {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url, timeout))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            stories_url: format!("{}/stories", base_url.trim_end_matches('/')),
            timeout,
        }
    }

    pub fn stories_url(&self) -> &str {
        &self.stories_url
    }

    async fn send(&self, submission: &QueuedSubmission) -> DeliveryOutcome {
        // The per-request timeout drops the in-flight transport when it fires,
        // and the timer goes away with the request future on every exit path.
        let result = self
            .client
            .post(&self.stories_url)
            .bearer_auth(&submission.auth_token)
            .multipart(build_form(submission))
            .timeout(self.timeout)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => return DeliveryOutcome::Failed(classify_transport_error(&err)),
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return DeliveryOutcome::Failed(FailureReason::Auth);
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => return DeliveryOutcome::Failed(classify_transport_error(&err)),
        };
        let parsed = serde_json::from_slice::<ApiResponse>(&body).ok();

        if status.is_success() {
            DeliveryOutcome::Delivered(parsed.unwrap_or_default())
        } else {
            DeliveryOutcome::Failed(FailureReason::Status {
                code: status.as_u16(),
                message: parsed.map(|api| api.message).unwrap_or_default(),
            })
        }
    }
}

#[async_trait]
impl StoryDelivery for HttpDelivery {
    async fn deliver(&self, submission: &QueuedSubmission) -> DeliveryOutcome {
        let span = info_span!("delivery.deliver", outbox_id = ?submission.id);
        async {
            let outcome = self.send(submission).await;
            match &outcome {
                DeliveryOutcome::Delivered(api) => {
                    event!(Level::DEBUG, api_message = %api.message, "story delivered")
                }
                DeliveryOutcome::Failed(reason) => {
                    event!(Level::DEBUG, reason = %reason, "story delivery failed")
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }
}

fn classify_transport_error(err: &reqwest::Error) -> FailureReason {
    if err.is_timeout() {
        FailureReason::Timeout
    } else {
        FailureReason::Transport(err.to_string())
    }
}

fn photo_part(photo: &Photo) -> Part {
    let base = || Part::bytes(photo.bytes.clone()).file_name(photo.file_name.clone());
    base().mime_str(&photo.mime_type).unwrap_or_else(|_| base())
}

pub(crate) fn build_form(submission: &QueuedSubmission) -> Form {
    let mut form = Form::new()
        .text("description", submission.description.clone())
        .part("photo", photo_part(&submission.photo));
    if let Some(location) = submission.location {
        form = form
            .text("lat", location.lat.to_string())
            .text("lon", location.lon.to_string());
    }
    form
}
