//! Local credential state: storage, encryption and the credential cache.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialCache                    │
//! │  - identity / backend token / flag       │
//! │  - atomic set + clear                    │
//! │  - change notifications (broadcast)      │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       LocalStorage                       │
//! │  - SQLite key/value table                │
//! │  - optional AES-256-GCM sealing          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The identity provider shares the same [`LocalStorage`] for its own session
//! record, the way an SDK shares browser storage with the page.

use serde::{Deserialize, Serialize};

pub use crate::identity::IdentitySession;

mod cache;
mod encryption;
mod storage;

pub use cache::{CacheEvent, CredentialCache};
pub use encryption::{Sealed, StorageCipher};
pub use storage::LocalStorage;

/// Balance shown to a user whose backend record carries no balance yet.
///
/// Display-only: never written back to storage.
pub const DEFAULT_STARTING_CREDITS: i64 = 5;

/// Plan label shown when the backend does not report one.
pub const DEFAULT_PLAN: &str = "Free";

/// Application credential minted by the backend from an identity session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCredential {
    /// Opaque bearer token for the generation API
    pub token: String,

    /// Identity subject this credential was minted for
    pub user_id: String,

    /// Credit balance as last reported by the backend
    pub tokens: Option<i64>,
}

/// Display data for the signed-in user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub email: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default = "default_plan")]
    pub plan: String,
    #[serde(default)]
    pub tokens: Option<i64>,
}

fn default_plan() -> String {
    DEFAULT_PLAN.to_string()
}

impl UserProfile {
    /// Credit balance to display, falling back to the starting balance for
    /// records the backend has not populated.
    pub fn balance(&self) -> i64 {
        self.tokens.unwrap_or(DEFAULT_STARTING_CREDITS)
    }
}

/// Snapshot of everything the cache holds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CachedAuth {
    pub identity: Option<IdentitySession>,
    pub credential: Option<BackendCredential>,
    pub profile: Option<UserProfile>,
    /// Raw stored flag. Use [`CachedAuth::is_authenticated`] to decide login state.
    pub authenticated: bool,
}

impl CachedAuth {
    /// The one rule for "am I logged in": the flag is set, the identity
    /// session is live, and a backend credential is present.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
            && self.identity.as_ref().is_some_and(|i| i.is_live())
            && self.credential.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.identity.is_none()
            && self.credential.is_none()
            && self.profile.is_none()
            && !self.authenticated
    }

    /// Bearer token, if a credential is cached.
    pub fn bearer(&self) -> Option<&str> {
        self.credential.as_ref().map(|c| c.token.as_str())
    }
}
