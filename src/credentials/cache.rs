//! Credential cache over local storage.
//!
//! Holds the cached identity session, the backend bearer token, the
//! authenticated flag, the last-known user id and the display profile.
//! Writes and clears are single transactions followed by one change
//! notification on a broadcast channel.

use super::{BackendCredential, CachedAuth, LocalStorage, UserProfile};
use crate::identity::IdentitySession;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const IDENTITY_KEY: &str = "auth.identity";
const TOKEN_KEY: &str = "auth.backend_token";
const AUTHENTICATED_KEY: &str = "auth.authenticated";
const USER_ID_KEY: &str = "auth.current_user_id";
const PROFILE_KEY: &str = "auth.user";

const ALL_KEYS: [&str; 5] = [
    IDENTITY_KEY,
    TOKEN_KEY,
    AUTHENTICATED_KEY,
    USER_ID_KEY,
    PROFILE_KEY,
];

/// Change notification emitted after every successful write or clear.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheEvent {
    Updated,
    Cleared,
}

/// Local credential cache.
///
/// Cheap to share behind an `Arc`; every consumer reads through
/// [`CredentialCache::get`] and observes changes via
/// [`CredentialCache::subscribe`].
pub struct CredentialCache {
    storage: Arc<LocalStorage>,
    events: broadcast::Sender<CacheEvent>,
}

impl CredentialCache {
    pub fn new(storage: Arc<LocalStorage>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self { storage, events }
    }

    /// Underlying storage (shared with the identity provider).
    pub fn storage(&self) -> &Arc<LocalStorage> {
        &self.storage
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Reads the cached state.
    ///
    /// Never fails: unreadable or malformed entries are logged and read as
    /// absent.
    pub fn get(&self) -> CachedAuth {
        let identity = self.read_json::<IdentitySession>(IDENTITY_KEY);
        let token = self.read(TOKEN_KEY);
        let user_id = self.read(USER_ID_KEY);
        let profile = self.read_json::<UserProfile>(PROFILE_KEY);
        let authenticated = self.read(AUTHENTICATED_KEY).as_deref() == Some("true");

        let credential = match (token, user_id) {
            (Some(token), Some(user_id)) => Some(BackendCredential {
                token,
                user_id,
                tokens: profile.as_ref().and_then(|p| p.tokens),
            }),
            (Some(_), None) => {
                warn!("Cached backend token has no user id, ignoring it");
                None
            }
            _ => None,
        };

        CachedAuth {
            identity,
            credential,
            profile,
            authenticated,
        }
    }

    /// Stores a freshly minted credential together with the identity it was
    /// minted from, and marks the cache authenticated.
    pub fn set(
        &self,
        identity: &IdentitySession,
        credential: &BackendCredential,
        profile: &UserProfile,
    ) -> Result<()> {
        let identity_json =
            serde_json::to_string(identity).context("Failed to serialize identity")?;
        let profile_json = serde_json::to_string(profile).context("Failed to serialize profile")?;

        self.storage
            .set_many(&[
                (IDENTITY_KEY, identity_json.as_str()),
                (TOKEN_KEY, credential.token.as_str()),
                (USER_ID_KEY, credential.user_id.as_str()),
                (PROFILE_KEY, profile_json.as_str()),
                (AUTHENTICATED_KEY, "true"),
            ])
            .context("Failed to store credentials")?;

        debug!(user_id = %credential.user_id, "Credential cache updated");
        self.notify(CacheEvent::Updated);
        Ok(())
    }

    /// Removes every cached field in one transaction, then notifies.
    pub fn clear(&self) -> Result<()> {
        let removed = self
            .storage
            .remove_many(&ALL_KEYS)
            .context("Failed to clear credentials")?;

        debug!(removed, "Credential cache cleared");
        self.notify(CacheEvent::Cleared);
        Ok(())
    }

    /// Replaces the cached identity after the provider refreshed its tokens.
    pub fn update_identity(&self, identity: &IdentitySession) -> Result<()> {
        let identity_json =
            serde_json::to_string(identity).context("Failed to serialize identity")?;
        self.storage
            .set(IDENTITY_KEY, &identity_json)
            .context("Failed to store identity")?;

        self.notify(CacheEvent::Updated);
        Ok(())
    }

    /// Records a new credit balance reported by the backend.
    ///
    /// Returns `false` (and writes nothing) when no profile is cached.
    pub fn update_balance(&self, tokens: i64) -> Result<bool> {
        let Some(mut profile) = self.read_json::<UserProfile>(PROFILE_KEY) else {
            return Ok(false);
        };
        if profile.tokens == Some(tokens) {
            return Ok(true);
        }

        profile.tokens = Some(tokens);
        let profile_json = serde_json::to_string(&profile).context("Failed to serialize profile")?;
        self.storage
            .set(PROFILE_KEY, &profile_json)
            .context("Failed to store balance")?;

        debug!(tokens, "Cached balance updated");
        self.notify(CacheEvent::Updated);
        Ok(true)
    }

    fn notify(&self, event: CacheEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.storage.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Unreadable cache entry, treating as empty");
                None
            }
        }
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.read(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Malformed cache entry, treating as empty");
                None
            }
        }
    }
}
