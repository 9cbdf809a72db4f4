//! Authenticated client for the generation backend.

use super::error::{error_message, ApiError};
use super::types::{
    AnimationHistoryItem, AnimationResult, GenerateRequest, HistoryResponse, TokenBalance,
};
use crate::credentials::CredentialCache;
use anyhow::{Context, Result};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// HTTP client for the generation API.
///
/// Every call except [`ApiClient::check_health`] carries the cached backend
/// credential as a bearer token. Calls are never retried.
pub struct ApiClient {
    http_client: Client,
    base_url: String,
    cache: Arc<CredentialCache>,
}

impl ApiClient {
    /// # Arguments
    /// * `base_url` - Backend base URL (e.g. "http://localhost:3000")
    /// * `cache` - Credential cache supplying the bearer token
    /// * `request_timeout` - Upper bound for a single request
    pub fn new(base_url: &str, cache: Arc<CredentialCache>, request_timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }

    /// Absolute URL for a video or code path returned by the backend.
    pub fn asset_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            self.url(path)
        }
    }

    /// Sends an authenticated request and decodes the JSON response.
    ///
    /// # Errors
    /// * `Unauthenticated` - no cached credential (no request is sent)
    /// * `Http` - non-2xx status, with the backend's message when available
    /// * `Network` - the request could not be completed
    /// * `Decode` - the response body is not the expected JSON
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<T, ApiError> {
        let token = self
            .cache
            .get()
            .credential
            .map(|c| c.token)
            .ok_or(ApiError::Unauthenticated)?;

        let url = self.url(endpoint);
        debug!(method = %method, url = %url, "API request");

        let mut request = self.http_client.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "API request failed to send");
            ApiError::Network(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = error_message(status, &text);
            warn!(url = %url, status = status.as_u16(), message = %message, "API error response");
            return Err(ApiError::Http {
                status: status.as_u16(),
                message,
            });
        }

        response.json::<T>().await.map_err(ApiError::from)
    }

    /// Untyped variant of [`ApiClient::call`].
    pub async fn call_json(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        self.call(method, endpoint, body).await
    }

    /// GET /api/user/tokens
    pub async fn get_user_tokens(&self) -> Result<TokenBalance, ApiError> {
        self.call(Method::GET, "/api/user/tokens", None).await
    }

    /// POST /api/generate
    pub async fn generate_animation(&self, prompt: &str) -> Result<AnimationResult, ApiError> {
        let body = serde_json::to_value(GenerateRequest { prompt })
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        self.call(Method::POST, "/api/generate", Some(&body)).await
    }

    /// GET /api/animations/history
    pub async fn animation_history(&self) -> Result<Vec<AnimationHistoryItem>, ApiError> {
        let response: HistoryResponse = self
            .call(Method::GET, "/api/animations/history", None)
            .await?;
        Ok(response.animations)
    }

    /// Fetches a rendered video and writes it to `dest`, returning the number
    /// of bytes saved.
    ///
    /// Videos are served as static files, so no credential is sent.
    pub async fn download_video(&self, video_url: &str, dest: &Path) -> Result<u64, ApiError> {
        let url = self.asset_url(video_url);
        debug!(url = %url, dest = %dest.display(), "Downloading video");

        let response = self.http_client.get(&url).send().await.map_err(|e| {
            warn!(url = %url, error = %e, "Video download failed to send");
            ApiError::Network(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = error_message(status, &text);
            warn!(url = %url, status = status.as_u16(), message = %message, "Video download rejected");
            return Err(ApiError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| ApiError::Io(format!("{}: {}", dest.display(), e)))?;

        info!(dest = %dest.display(), bytes = bytes.len(), "Video saved");
        Ok(bytes.len() as u64)
    }

    /// GET /health, unauthenticated. Advisory only: `false` means the
    /// backend did not answer with a 2xx.
    pub async fn check_health(&self) -> bool {
        match self.http_client.get(self.url("/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Health check failed");
                false
            }
        }
    }
}
