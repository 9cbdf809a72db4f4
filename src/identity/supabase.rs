//! Supabase (GoTrue) identity provider over its REST API.
//!
//! Mirrors what the supabase-js SDK does in a browser: the current session is
//! persisted in local storage under `sb-auth-token`, refreshed shortly before
//! it expires, and every change is announced to subscribers.

use super::{AuthError, AuthEvent, IdentityProvider, IdentitySession};
use crate::credentials::LocalStorage;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const SESSION_KEY: &str = "sb-auth-token";

/// Lifetime assumed when the token response carries no expiry at all.
const FALLBACK_EXPIRES_IN: i64 = 3600;

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct PkceRequest<'a> {
    auth_code: &'a str,
    code_verifier: &'a str,
}

/// GoTrue token response
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: GoTrueUser,
}

#[derive(Deserialize, Debug)]
struct GoTrueUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    app_metadata: AppMetadata,
    #[serde(default)]
    user_metadata: UserMetadata,
}

#[derive(Deserialize, Debug, Default)]
struct AppMetadata {
    #[serde(default)]
    provider: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct UserMetadata {
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

/// GoTrue error bodies come in several shapes depending on the endpoint.
#[derive(Deserialize, Debug, Default)]
struct ErrorBody {
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl TokenResponse {
    fn into_identity(self) -> Result<IdentitySession, AuthError> {
        let email = self
            .user
            .email
            .filter(|e| !e.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("user has no email".to_string()))?;

        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => Utc
                .timestamp_opt(at, 0)
                .single()
                .ok_or_else(|| AuthError::InvalidResponse(format!("bad expires_at {}", at)))?,
            (None, Some(secs)) => Utc::now() + Duration::seconds(secs),
            (None, None) => Utc::now() + Duration::seconds(FALLBACK_EXPIRES_IN),
        };

        let metadata = self.user.user_metadata;
        Ok(IdentitySession {
            subject: self.user.id,
            email,
            provider: self
                .user
                .app_metadata
                .provider
                .unwrap_or_else(|| "google".to_string()),
            access_token: self.access_token,
            refresh_token: Some(self.refresh_token),
            expires_at,
            name: metadata.full_name.or(metadata.name),
            avatar_url: metadata.avatar_url,
        })
    }
}

/// Supabase auth client.
pub struct SupabaseAuth {
    http_client: Client,
    base_url: String,
    anon_key: String,
    storage: Arc<LocalStorage>,
    refresh_margin: Duration,
    events: broadcast::Sender<AuthEvent>,
}

impl SupabaseAuth {
    /// Creates a client for the project at `base_url` (e.g. `https://xyz.supabase.co`).
    /// `request_timeout` bounds every GoTrue call.
    pub fn new(
        base_url: &str,
        anon_key: &str,
        storage: Arc<LocalStorage>,
        request_timeout: std::time::Duration,
    ) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let (events, _) = broadcast::channel(16);
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            storage,
            refresh_margin: Duration::minutes(5),
            events,
        })
    }

    /// How long before expiry `get_session` refreshes the session.
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    fn load_session(&self) -> Result<Option<IdentitySession>, AuthError> {
        let raw = self
            .storage
            .get(SESSION_KEY)
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(error = %e, "Discarding malformed stored session");
                self.forget_session();
                Ok(None)
            }
        }
    }

    fn persist_session(&self, session: &IdentitySession) -> Result<(), AuthError> {
        let json = serde_json::to_string(session)
            .map_err(|e| AuthError::Storage(format!("Failed to serialize session: {}", e)))?;
        self.storage
            .set(SESSION_KEY, &json)
            .map_err(|e| AuthError::Storage(e.to_string()))
    }

    fn forget_session(&self) {
        if let Err(e) = self.storage.remove(SESSION_KEY) {
            warn!(error = %e, "Failed to remove stored session");
        }
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }

    async fn token_request<B: Serialize>(
        &self,
        grant_type: &str,
        body: &B,
    ) -> Result<IdentitySession, AuthError> {
        let url = format!("{}/auth/v1/token?grant_type={}", self.base_url, grant_type);

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        token_response.into_identity()
    }

    async fn refresh(&self, refresh_token: &str) -> Result<IdentitySession, AuthError> {
        debug!("Refreshing identity session");
        self.token_request("refresh_token", &RefreshRequest { refresh_token })
            .await
    }
}

async fn rejected(response: reqwest::Response) -> AuthError {
    let status = response.status();
    let body: ErrorBody = response.json().await.unwrap_or_default();
    let message = body
        .error_description
        .or(body.msg)
        .or(body.message)
        .or(body.error)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string());

    AuthError::Rejected {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl IdentityProvider for SupabaseAuth {
    async fn get_session(&self) -> Result<Option<IdentitySession>, AuthError> {
        let Some(session) = self.load_session()? else {
            return Ok(None);
        };

        if !session.expires_within(self.refresh_margin) {
            return Ok(Some(session));
        }

        let Some(refresh_token) = session.refresh_token.clone() else {
            if session.is_live() {
                return Ok(Some(session));
            }
            debug!("Stored session expired and cannot be refreshed");
            self.forget_session();
            self.emit(AuthEvent::SignedOut);
            return Ok(None);
        };

        match self.refresh(&refresh_token).await {
            Ok(refreshed) => {
                self.persist_session(&refreshed)?;
                debug!(expires_at = %refreshed.expires_at, "Identity session refreshed");
                self.emit(AuthEvent::TokenRefreshed);
                Ok(Some(refreshed))
            }
            Err(AuthError::Rejected { status, message }) => {
                info!(status, message = %message, "Refresh token rejected, signing out");
                self.forget_session();
                self.emit(AuthEvent::SignedOut);
                Ok(None)
            }
            Err(e) if session.is_live() => {
                // Still usable; try again on the next check
                warn!(error = %e, "Session refresh failed");
                Ok(Some(session))
            }
            Err(e) => Err(e),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let session = self.load_session().unwrap_or(None);
        self.forget_session();
        self.emit(AuthEvent::SignedOut);

        let Some(session) = session else {
            return Ok(());
        };

        let url = format!("{}/auth/v1/logout", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        info!(email = %session.email, "Signed out");
        Ok(())
    }

    fn authorize_url(&self, redirect_to: &str, code_challenge: &str) -> String {
        format!(
            "{}/auth/v1/authorize?provider=google&redirect_to={}&code_challenge={}&code_challenge_method=s256&scopes={}",
            self.base_url,
            urlencoding::encode(redirect_to),
            urlencoding::encode(code_challenge),
            urlencoding::encode("email profile")
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<IdentitySession, AuthError> {
        let session = self
            .token_request(
                "pkce",
                &PkceRequest {
                    auth_code: code,
                    code_verifier,
                },
            )
            .await?;

        self.persist_session(&session)?;
        info!(email = %session.email, provider = %session.provider, "Signed in");
        self.emit(AuthEvent::SignedIn);
        Ok(session)
    }
}
