#![deny(missing_docs)]
//! The Token Provider (§4.5): OAuth-style refresh-on-expiry for the
//! credential that the Dispatcher injects into every worker assignment.
//!
//! Holds an optional `{access_token, refresh_token, expires_at, scopes}`
//! tuple. [`TokenProvider::get_valid_access_token`] returns the stored
//! access token unless it is within [`REFRESH_MARGIN`] of expiry, in
//! which case it synchronously refreshes (rotating the refresh token)
//! and replaces the stored tuple. The authorization-code exchange and
//! PKCE state live outside this crate; this provider only ever refreshes
//! a token it has already been seeded with.

use persona_secret::SecretValue;
use reqwest::Client;
use serde::Deserialize;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::time::interval;
use tracing::{error, warn};

/// How close to expiry triggers a synchronous refresh before handing
/// out an access token.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(10 * 60);

/// Interval of the background keep-warm timer.
pub const KEEP_WARM_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Errors from the Token Provider.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token has been seeded yet.
    #[error("no token available")]
    NoToken,

    /// The refresh endpoint rejected the request or was unreachable.
    #[error("refresh failed: {0}")]
    RefreshFailed(String),
}

/// The stored access/refresh token pair and its metadata.
struct TokenState {
    access_token: SecretValue,
    refresh_token: SecretValue,
    expires_at: SystemTime,
    scopes: Vec<String>,
}

impl Clone for TokenState {
    fn clone(&self) -> Self {
        Self {
            access_token: self.access_token.with_bytes(|b| SecretValue::new(b.to_vec())),
            refresh_token: self.refresh_token.with_bytes(|b| SecretValue::new(b.to_vec())),
            expires_at: self.expires_at,
            scopes: self.scopes.clone(),
        }
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
}

/// Holds and refreshes the single OAuth-style credential used by the
/// Dispatcher to authenticate workers against upstream providers.
pub struct TokenProvider {
    http: Client,
    refresh_url: String,
    client_id: String,
    state: RwLock<Option<TokenState>>,
}

impl TokenProvider {
    /// Create a provider pointed at a refresh-token endpoint. The
    /// provider starts empty: call [`TokenProvider::seed`] once the
    /// authorization-code exchange has produced an initial token.
    pub fn new(refresh_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            refresh_url: refresh_url.into(),
            client_id: client_id.into(),
            state: RwLock::new(None),
        }
    }

    /// Seed (or replace) the stored token, e.g. after the external
    /// authorization-code exchange completes.
    pub fn seed(
        &self,
        access_token: Vec<u8>,
        refresh_token: Vec<u8>,
        expires_at: SystemTime,
        scopes: Vec<String>,
    ) {
        let mut guard = self.state.write().expect("token state lock poisoned");
        *guard = Some(TokenState {
            access_token: SecretValue::new(access_token),
            refresh_token: SecretValue::new(refresh_token),
            expires_at,
            scopes,
        });
    }

    /// Returns the stored access token, refreshing it first if it is
    /// within [`REFRESH_MARGIN`] of expiry. Returns `None` if no token
    /// has been seeded or the refresh attempt failed — callers fall
    /// back to whatever stored token they already hold (§4.3 step 1).
    pub async fn get_valid_access_token(&self) -> Option<String> {
        let needs_refresh = {
            let guard = self.state.read().expect("token state lock poisoned");
            match guard.as_ref() {
                None => return None,
                Some(state) => {
                    state.expires_at
                        <= SystemTime::now() + REFRESH_MARGIN
                }
            }
        };

        if needs_refresh {
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "token refresh failed, serving stale token if present");
            }
        }

        let guard = self.state.read().expect("token state lock poisoned");
        guard
            .as_ref()
            .map(|state| state.access_token.with_bytes(|b| String::from_utf8_lossy(b).into_owned()))
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        let refresh_token = {
            let guard = self.state.read().expect("token state lock poisoned");
            match guard.as_ref() {
                Some(state) => state
                    .refresh_token
                    .with_bytes(|b| String::from_utf8_lossy(b).into_owned()),
                None => return Err(AuthError::NoToken),
            }
        };

        let response = self
            .http
            .post(&self.refresh_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::RefreshFailed(format!(
                "refresh endpoint returned {}",
                response.status()
            )));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        let mut guard = self.state.write().expect("token state lock poisoned");
        let scopes = guard.as_ref().map(|s| s.scopes.clone()).unwrap_or_default();
        *guard = Some(TokenState {
            access_token: SecretValue::new(body.access_token.into_bytes()),
            refresh_token: SecretValue::new(body.refresh_token.into_bytes()),
            expires_at: SystemTime::now() + Duration::from_secs(body.expires_in),
            scopes,
        });
        Ok(())
    }

    /// Spawn the process-wide background timer that calls
    /// `get_valid_access_token` every [`KEEP_WARM_INTERVAL`] to keep the
    /// downstream token store warm. Returns the join handle so the
    /// caller can hold it for the life of the process.
    pub fn spawn_keep_warm(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(KEEP_WARM_INTERVAL);
            loop {
                ticker.tick().await;
                if self.get_valid_access_token().await.is_none() {
                    error!("keep-warm tick found no token to refresh");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_provider_returns_none() {
        let provider = TokenProvider::new("http://localhost/refresh", "client-1");
        assert!(provider.get_valid_access_token().await.is_none());
    }

    #[tokio::test]
    async fn seeded_token_far_from_expiry_is_returned_without_refresh() {
        let provider = TokenProvider::new("http://localhost/refresh", "client-1");
        provider.seed(
            b"access-1".to_vec(),
            b"refresh-1".to_vec(),
            SystemTime::now() + Duration::from_secs(3600),
            vec!["read".to_string()],
        );
        let token = provider.get_valid_access_token().await;
        assert_eq!(token.as_deref(), Some("access-1"));
    }

    #[tokio::test]
    async fn token_within_refresh_margin_attempts_refresh_and_falls_back_on_failure() {
        let provider = TokenProvider::new("http://127.0.0.1:1/refresh", "client-1");
        provider.seed(
            b"access-1".to_vec(),
            b"refresh-1".to_vec(),
            SystemTime::now() + Duration::from_secs(60),
            vec![],
        );
        // The refresh endpoint is unreachable; the stale token is still served.
        let token = provider.get_valid_access_token().await;
        assert_eq!(token.as_deref(), Some("access-1"));
    }
}
