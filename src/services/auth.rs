//! Credential provider injected into the transport.
//!
//! Lifecycle: initialised from config on start, `invalidate` on any 401,
//! `issue` again after the user logs in. Observers watch `SessionState` to
//! route the user to a login entry point when the session ends.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    Bearer,
    Token,
}

impl AuthScheme {
    fn prefix(self) -> &'static str {
        match self {
            AuthScheme::Bearer => "Bearer",
            AuthScheme::Token => "Token",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    SignedIn,
    SignedOut,
}

pub struct CredentialProvider {
    scheme: AuthScheme,
    token: ArcSwapOption<String>,
    state: watch::Sender<SessionState>,
}

impl CredentialProvider {
    pub fn new(scheme: AuthScheme, initial: Option<String>) -> Arc<Self> {
        let initial = initial.filter(|t| !t.trim().is_empty());
        let state = if initial.is_some() {
            SessionState::SignedIn
        } else {
            SessionState::SignedOut
        };
        let (state, _) = watch::channel(state);

        Arc::new(Self {
            scheme,
            token: ArcSwapOption::from(initial.map(Arc::new)),
            state,
        })
    }

    /// Store a freshly issued token (after login).
    pub fn issue(&self, token: impl Into<String>) {
        let token = token.into();
        if token.trim().is_empty() {
            self.invalidate();
            return;
        }
        self.token.store(Some(Arc::new(token)));
        self.state.send_replace(SessionState::SignedIn);
        log::debug!("Credential issued");
    }

    /// Drop the cached token and signal observers that re-authentication is needed.
    pub fn invalidate(&self) {
        let had_token = self.token.swap(None).is_some();
        self.state.send_replace(SessionState::SignedOut);
        if had_token {
            log::warn!("Credential invalidated; re-authentication required");
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.load().is_some()
    }

    pub fn session_state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Value for the `Authorization` header.
    pub fn authorization(&self) -> Result<String, ClientError> {
        let token = self.token.load_full().ok_or(ClientError::NotAuthenticated)?;
        Ok(format!("{} {}", self.scheme.prefix(), token))
    }
}
