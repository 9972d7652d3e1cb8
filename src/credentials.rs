//! Opaque credential source. Token storage itself lives outside this crate.

use std::sync::{Arc, RwLock};

pub trait CredentialProvider: Send + Sync {
    /// Current bearer token, if the user is signed in.
    fn token(&self) -> Option<String>;
}

/// In-memory token slot shared between whoever signs in and whoever submits.
#[derive(Clone, Default)]
pub struct SharedCredentials {
    token: Arc<RwLock<Option<String>>>,
}

impl SharedCredentials {
    pub fn new(token: Option<String>) -> Self {
        let credentials = Self::default();
        if let Some(token) = token {
            credentials.save_token(token);
        }
        credentials
    }

    pub fn save_token(&self, token: impl Into<String>) {
        let token = token.into();
        let value = (!token.is_empty()).then_some(token);
        match self.token.write() {
            Ok(mut slot) => *slot = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    pub fn clear(&self) {
        match self.token.write() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.token().is_some()
    }
}

impl CredentialProvider for SharedCredentials {
    fn token(&self) -> Option<String> {
        match self.token.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
