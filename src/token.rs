//! Access tokens for the avatar service

use crate::runtime::traits::{Credential, TokenProvider, TransportError};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Fetches a fresh token per session from the token endpoint
pub struct HttpTokenProvider {
    client: Client,
    url: String,
}

impl HttpTokenProvider {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch(&self) -> Result<Credential, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::credential(format!("Token request timeout: {e}"))
                } else {
                    TransportError::credential(format!("Token request failed: {e}"))
                }
            })?;

        let token = response
            .text()
            .await
            .map_err(|e| TransportError::credential(format!("Failed to read token: {e}")))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(TransportError::credential("Token endpoint returned an empty token"));
        }

        tracing::debug!(url = %self.url, "Fetched avatar access token");
        Ok(Credential::new(token))
    }
}
