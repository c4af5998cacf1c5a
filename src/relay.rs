//! Credential exchange with the session relay
//!
//! API keys never reach this process. The relay hands out short-lived
//! websocket URLs that already embed an ephemeral token, so the only secret
//! we ever hold is single-use and expires on its own.

use async_trait::async_trait;
use serde::Deserialize;

use crate::{Error, Result};

/// Connection material returned by the relay
#[derive(Debug, Clone, Deserialize)]
pub struct RelayCredentials {
    /// Websocket URL with an ephemeral token baked in
    pub url: String,
}

/// Fetches fresh connection credentials before each connection attempt
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fetch credentials for a new realtime connection.
    ///
    /// Called on every connect, including reconnects; credentials must never
    /// be cached across attempts since the embedded token is short-lived.
    async fn fetch(&self) -> Result<RelayCredentials>;
}

/// HTTP client for the session relay
pub struct RelayClient {
    client: reqwest::Client,
    url: String,
}

impl RelayClient {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl CredentialProvider for RelayClient {
    async fn fetch(&self) -> Result<RelayCredentials> {
        tracing::debug!(url = %self.url, "requesting session credentials");

        let response = self.client.get(&self.url).send().await.map_err(|e| {
            tracing::error!(error = %e, "relay request failed");
            e
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "relay returned an error");
            return Err(Error::Relay(format!("relay error {status}: {body}")));
        }

        let creds: RelayCredentials = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse relay response");
            e
        })?;

        if creds.url.is_empty() {
            return Err(Error::Relay("relay returned an empty session url".into()));
        }

        tracing::debug!("session credentials received");
        Ok(creds)
    }
}
