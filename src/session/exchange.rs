//! Backend token exchange.
//!
//! Trades an identity session for the application's own bearer credential via
//! `POST /api/auth/verify-oauth-user`. The backend treats the call as
//! get-or-create for the user record, so the client sends only the email and
//! the provider subject.

use crate::api::error_message;
use crate::credentials::{BackendCredential, CredentialCache, UserProfile, DEFAULT_PLAN};
use crate::identity::IdentitySession;
use anyhow::Context;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Token exchange failures. None of them touch the cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("identity session is missing a subject or email")]
    InvalidSession,
    #[error("login rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("login server unreachable: {0}")]
    Network(String),
    #[error("invalid login response: {0}")]
    InvalidResponse(String),
    #[error("failed to store credential: {0}")]
    Storage(String),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest<'a> {
    email: &'a str,
    supabase_id: &'a str,
}

#[derive(Deserialize, Debug)]
struct VerifyResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    user: Option<VerifiedUser>,
}

#[derive(Deserialize, Debug, Default)]
struct VerifiedUser {
    #[serde(default)]
    tokens: Option<i64>,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

/// Mints backend credentials, at most once per signed-in subject.
pub struct TokenExchange {
    http_client: Client,
    base_url: String,
    cache: Arc<CredentialCache>,
}

impl TokenExchange {
    pub fn new(base_url: &str, cache: Arc<CredentialCache>, request_timeout: Duration) -> anyhow::Result<Self> {
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

    /// Returns the backend credential for `session`.
    ///
    /// A credential already cached for the same subject is returned without a
    /// network call. Otherwise exactly one verification request is made; only a
    /// complete, successful response is written to the cache.
    pub async fn exchange(
        &self,
        session: &IdentitySession,
    ) -> Result<BackendCredential, ExchangeError> {
        if session.subject.trim().is_empty() || session.email.trim().is_empty() {
            return Err(ExchangeError::InvalidSession);
        }

        if let Some(cached) = self
            .cache
            .get()
            .credential
            .filter(|c| c.user_id == session.subject)
        {
            debug!(user_id = %cached.user_id, "Using cached backend credential");
            return Ok(cached);
        }

        let url = format!("{}/api/auth/verify-oauth-user", self.base_url);
        debug!(email = %session.email, "Requesting backend credential");

        let response = self
            .http_client
            .post(&url)
            .json(&VerifyRequest {
                email: &session.email,
                supabase_id: &session.subject,
            })
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Verification request failed to send");
                ExchangeError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = error_message(status, &text);
            warn!(status = status.as_u16(), message = %message, "Verification rejected");
            return Err(ExchangeError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let verified: VerifyResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        let token = verified
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ExchangeError::InvalidResponse("no token in response".to_string()))?;
        let user = verified.user.unwrap_or_default();

        if user.tokens.is_none() {
            debug!("Backend reported no balance, showing the starting balance");
        }

        let credential = BackendCredential {
            token,
            user_id: session.subject.clone(),
            tokens: user.tokens,
        };
        let profile = UserProfile {
            email: session.email.clone(),
            avatar_url: session.avatar_url.clone().or(user.avatar),
            plan: user.plan.unwrap_or_else(|| DEFAULT_PLAN.to_string()),
            tokens: user.tokens,
        };

        self.cache
            .set(session, &credential, &profile)
            .map_err(|e| ExchangeError::Storage(e.to_string()))?;

        info!(email = %session.email, "Backend credential issued");
        Ok(credential)
    }
}
