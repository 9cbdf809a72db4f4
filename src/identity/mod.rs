//! Third-party identity provider interface.
//!
//! The provider owns the user's sign-in: it issues sessions, refreshes them,
//! and announces changes. The rest of the crate only consumes the
//! [`IdentityProvider`] trait; [`SupabaseAuth`] is the production
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

mod callback;
mod login;
pub mod pkce;
mod supabase;

pub use callback::{
    create_callback_router, AuthorizationCode, CallbackOutcome, CallbackState, PendingLogin,
    PendingLogins,
};
pub use login::{run_loopback_login, CALLBACK_PATH};
pub use supabase::SupabaseAuth;

/// Provider-issued proof of sign-in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySession {
    /// Provider user id
    pub subject: String,
    pub email: String,
    /// Upstream OAuth provider (e.g. "google")
    pub provider: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl IdentitySession {
    /// True while the access token has not expired.
    pub fn is_live(&self) -> bool {
        self.expires_at > Utc::now()
    }

    /// True when the access token expires within `margin` (or already has).
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at - Utc::now() < margin
    }
}

/// Push notification from the provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// Identity provider failures.
///
/// `NoSession` is the ordinary signed-out condition, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no active session")]
    NoSession,
    #[error("identity provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("identity provider unreachable: {0}")]
    Network(String),
    #[error("session storage error: {0}")]
    Storage(String),
    #[error("invalid identity provider response: {0}")]
    InvalidResponse(String),
}

/// Identity provider interface.
///
/// # Contract
/// - `get_session` returns the current session, refreshing it first when the
///   implementation decides it is close to expiry. `Ok(None)` means signed out.
/// - `subscribe` delivers push notifications; consumers must still tolerate
///   missed events (the session bridge polls as a fallback).
/// - `sign_out` forgets the local session even if the remote call fails.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn get_session(&self) -> Result<Option<IdentitySession>, AuthError>;

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;

    async fn sign_out(&self) -> Result<(), AuthError>;

    /// URL that starts the OAuth redirect flow and returns to `redirect_to`.
    fn authorize_url(&self, redirect_to: &str, code_challenge: &str) -> String;

    /// Completes the redirect flow with the authorization code.
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<IdentitySession, AuthError>;
}
