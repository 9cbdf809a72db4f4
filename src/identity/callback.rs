//! Loopback OAuth callback endpoint.
//!
//! The identity provider redirects the browser to
//! `http://127.0.0.1:<port>/auth/callback?state=…&code=…`. The handler checks
//! the CSRF state, pairs the code with its PKCE verifier and hands both to the
//! waiting login task.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A login waiting for its redirect.
#[derive(Clone, Debug)]
pub struct PendingLogin {
    pub code_verifier: String,
    pub created_at: DateTime<Utc>,
}

/// Single-use CSRF states with expiry, each bound to a PKCE verifier.
#[derive(Clone)]
pub struct PendingLogins {
    states: Arc<Mutex<HashMap<String, PendingLogin>>>,
    expiry_duration: Duration,
}

impl PendingLogins {
    /// # Arguments
    /// * `expiry_seconds` - How long a login may wait for its redirect
    pub fn new(expiry_seconds: i64) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            expiry_duration: Duration::seconds(expiry_seconds),
        }
    }

    /// Registers a login and returns its state token (UUID v4).
    pub fn create(&self, code_verifier: &str) -> String {
        let state = Uuid::new_v4().to_string();
        let entry = PendingLogin {
            code_verifier: code_verifier.to_string(),
            created_at: Utc::now(),
        };

        if let Ok(mut states) = self.states.lock() {
            states.insert(state.clone(), entry);
        }
        state
    }

    /// Removes the state and returns its login if it has not expired.
    pub fn validate_and_consume(&self, state: &str) -> Option<PendingLogin> {
        let entry = self.states.lock().ok()?.remove(state)?;

        if Utc::now() - entry.created_at > self.expiry_duration {
            return None;
        }
        Some(entry)
    }
}

/// Authorization code paired with the verifier that started the flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code: String,
    pub code_verifier: String,
}

/// What the callback delivers to the waiting login: a code, or the
/// provider's error description.
pub type CallbackOutcome = Result<AuthorizationCode, String>;

#[derive(Clone)]
pub struct CallbackState {
    pub pending: PendingLogins,
    pub outcomes: mpsc::Sender<CallbackOutcome>,
}

#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

enum CallbackError {
    BadRequest(String),
    Unauthorized(String),
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            CallbackError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            CallbackError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

pub fn create_callback_router(state: CallbackState) -> Router {
    Router::new()
        .route(super::CALLBACK_PATH, get(oauth_callback))
        .with_state(Arc::new(state))
}

/// GET /auth/callback
///
/// Nothing reaches the login task, not even a provider error, unless the
/// request carries a live state.
async fn oauth_callback(
    State(state): State<Arc<CallbackState>>,
    Query(callback): Query<OAuthCallback>,
) -> Result<&'static str, CallbackError> {
    let csrf_state = callback
        .state
        .ok_or_else(|| CallbackError::BadRequest("Missing 'state' parameter".to_string()))?;

    let pending = state
        .pending
        .validate_and_consume(&csrf_state)
        .ok_or_else(|| {
            warn!("Invalid or expired OAuth state");
            CallbackError::Unauthorized("Invalid or expired sign-in attempt".to_string())
        })?;

    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, description = %description, "OAuth authorization failed");

        let message = format!("{} - {}", error, description);
        let _ = state.outcomes.send(Err(message.clone())).await;
        return Err(CallbackError::BadRequest(format!("Sign-in failed: {}", message)));
    }

    let Some(code) = callback.code else {
        // The state is spent, so the login cannot succeed any more
        let message = "Missing 'code' parameter".to_string();
        let _ = state.outcomes.send(Err(message.clone())).await;
        return Err(CallbackError::BadRequest(message));
    };

    debug!("OAuth callback accepted");
    let _ = state
        .outcomes
        .send(Ok(AuthorizationCode {
            code,
            code_verifier: pending.code_verifier,
        }))
        .await;

    Ok("Signed in. You can close this window and return to the terminal.")
}
