//! Session bridge: keeps the credential cache aligned with the identity
//! provider.

use super::exchange::TokenExchange;
use crate::credentials::{CredentialCache, UserProfile};
use crate::identity::{AuthError, IdentityProvider, IdentitySession};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Observable login state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing checked yet
    Uninitialized,
    Checking,
    Authenticated,
    Unauthenticated,
}

/// Reconciles the provider's session with the local credential cache.
///
/// One reconciliation runs at a time. `sign_out` bumps an epoch so a
/// reconciliation that was awaiting the provider or the backend when the user
/// signed out cannot resurrect the old state.
pub struct SessionBridge {
    provider: Arc<dyn IdentityProvider>,
    exchange: TokenExchange,
    cache: Arc<CredentialCache>,
    state_tx: watch::Sender<SessionState>,
    in_flight: AtomicBool,
    epoch: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Resets the in-flight flag when a reconciliation ends, including on
/// cancellation.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SessionBridge {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        exchange: TokenExchange,
        cache: Arc<CredentialCache>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        Self {
            provider,
            exchange,
            cache,
            state_tx,
            in_flight: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.cache.get().is_authenticated()
    }

    /// Profile of the signed-in user, if any.
    pub fn profile(&self) -> Option<UserProfile> {
        let auth = self.cache.get();
        if auth.is_authenticated() {
            auth.profile
        } else {
            None
        }
    }

    /// Message of the last failed login, cleared by the next successful one.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Aligns the cache with the provider and returns the resulting state.
    ///
    /// Returns the current state untouched if another reconciliation is
    /// already running.
    pub async fn reconcile(&self) -> SessionState {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("Reconciliation already in flight, skipping");
            return self.state();
        };

        let epoch = self.epoch.load(Ordering::Acquire);
        let previous = self.state();
        if matches!(
            previous,
            SessionState::Uninitialized | SessionState::Unauthenticated
        ) {
            self.set_state(SessionState::Checking);
        }

        let outcome = self.resolve(previous).await;

        if self.epoch.load(Ordering::Acquire) != epoch {
            debug!(?outcome, "Discarding stale reconciliation result");
            let current = self.state();
            if current == SessionState::Unauthenticated {
                // A late exchange may have written credentials after sign-out
                self.clear_cache();
            }
            return current;
        }

        self.set_state(outcome);
        outcome
    }

    async fn resolve(&self, previous: SessionState) -> SessionState {
        let session = match self.provider.get_session().await {
            Ok(Some(session)) if session.is_live() => session,
            Ok(Some(_)) => {
                debug!("Provider session expired");
                self.clear_cache();
                return SessionState::Unauthenticated;
            }
            Ok(None) | Err(AuthError::NoSession) => {
                debug!("No provider session");
                self.clear_cache();
                return SessionState::Unauthenticated;
            }
            Err(e) => {
                // Transient: keep the cache and an established login, retry on the next poll
                warn!(error = %e, "Failed to read provider session");
                return match previous {
                    SessionState::Authenticated => SessionState::Authenticated,
                    _ => SessionState::Unauthenticated,
                };
            }
        };

        match self.exchange.exchange(&session).await {
            Ok(_) => {
                self.set_last_error(None);
                self.store_refreshed_identity(&session);
                SessionState::Authenticated
            }
            Err(e) => {
                warn!(email = %session.email, error = %e, "Backend login failed");
                self.set_last_error(Some(format!("Login failed: {}", e)));
                SessionState::Unauthenticated
            }
        }
    }

    /// Signs out at the provider and clears every cached credential.
    ///
    /// A provider failure is logged; the local state is cleared regardless.
    pub async fn sign_out(&self) -> Result<()> {
        self.epoch.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = self.provider.sign_out().await {
            warn!(error = %e, "Provider sign-out failed, clearing local state anyway");
        }

        let cleared = self.cache.clear();
        self.set_state(SessionState::Unauthenticated);
        info!("Signed out");
        cleared
    }

    /// Starts the background reconciliation task.
    ///
    /// The task reconciles once immediately, then on every provider event and,
    /// while authenticated or holding a cached credential, on each poll tick.
    pub fn spawn(self: &Arc<Self>, poll_interval: Duration) -> BridgeHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let bridge = Arc::clone(self);
        // Subscribe before the first reconciliation so no event is missed
        let mut events = self.provider.subscribe();
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);

        let task = tokio::spawn(async move {
            info!(poll_ms = poll_interval.as_millis() as u64, "Session bridge started");
            bridge.reconcile().await;

            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;

            let mut events_open = true;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,

                    result = events.recv(), if events_open => {
                        match result {
                            Ok(event) => {
                                debug!(?event, "Provider event");
                                bridge.reconcile().await;
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped = skipped, "Missed provider events, reconciling");
                                bridge.reconcile().await;
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                error!("Provider event channel closed, relying on polling");
                                events_open = false;
                            }
                        }
                    }

                    _ = ticker.tick() => {
                        if bridge.state() == SessionState::Authenticated
                            || bridge.is_authenticated()
                        {
                            bridge.reconcile().await;
                        }
                    }
                }
            }

            info!("Session bridge stopped");
        });

        BridgeHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    fn store_refreshed_identity(&self, session: &IdentitySession) {
        if self.cache.get().identity.as_ref() == Some(session) {
            return;
        }
        if let Err(e) = self.cache.update_identity(session) {
            warn!(error = %e, "Failed to store refreshed identity");
        }
    }

    fn clear_cache(&self) {
        if self.cache.get().is_empty() {
            return;
        }
        if let Err(e) = self.cache.clear() {
            error!(error = %e, "Failed to clear credential cache");
        }
    }

    fn set_state(&self, next: SessionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!(state = ?next, "Session state changed");
        }
    }

    fn set_last_error(&self, message: Option<String>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = message;
    }
}

/// Handle to a running bridge task. Dropping it also stops the task.
pub struct BridgeHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// Stops the task and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "Session bridge task failed");
        }
    }
}
