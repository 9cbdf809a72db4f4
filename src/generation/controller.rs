use crate::api::{AnimationResult, ApiClient, ApiError};
use crate::credentials::{CredentialCache, DEFAULT_STARTING_CREDITS};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Remote operations the controller depends on.
#[async_trait]
pub trait AnimationBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<AnimationResult, ApiError>;

    /// Current credit balance.
    async fn user_tokens(&self) -> Result<i64, ApiError>;
}

#[async_trait]
impl AnimationBackend for ApiClient {
    async fn generate(&self, prompt: &str) -> Result<AnimationResult, ApiError> {
        self.generate_animation(prompt).await
    }

    async fn user_tokens(&self) -> Result<i64, ApiError> {
        Ok(self.get_user_tokens().await?.tokens)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationStatus {
    Idle,
    Generating,
    Complete,
    Error,
}

/// Observable state of the current submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationState {
    pub status: GenerationStatus,
    pub prompt: String,
    pub result: Option<AnimationResult>,
    pub error: Option<String>,
    /// Displayed credit balance
    pub tokens: i64,
}

impl GenerationState {
    fn idle(tokens: i64) -> Self {
        Self {
            status: GenerationStatus::Idle,
            prompt: String::new(),
            result: None,
            error: None,
            tokens,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitRejection {
    EmptyPrompt,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Nothing was sent and the state is unchanged
    Rejected(SubmitRejection),
    /// A generation is already running; nothing was sent
    Busy,
    /// The submission finished (or was abandoned); carries the state after it
    Settled(GenerationState),
}

/// Drives one prompt at a time through the generation API.
///
/// Status transitions happen under the watch channel's lock, together with
/// the epoch read or bump, so a `reset` racing a running submission always
/// wins.
pub struct GenerationController {
    backend: Arc<dyn AnimationBackend>,
    cache: Arc<CredentialCache>,
    timeout: Option<Duration>,
    state_tx: watch::Sender<GenerationState>,
    epoch: AtomicU64,
}

impl GenerationController {
    /// # Arguments
    /// * `backend` - Generation API
    /// * `cache` - Credential cache; supplies the initial balance and receives updates
    /// * `timeout` - Upper bound for one generation, `None` to wait indefinitely
    pub fn new(
        backend: Arc<dyn AnimationBackend>,
        cache: Arc<CredentialCache>,
        timeout: Option<Duration>,
    ) -> Self {
        let tokens = cache
            .get()
            .profile
            .map(|p| p.balance())
            .unwrap_or(DEFAULT_STARTING_CREDITS);
        let (state_tx, _) = watch::channel(GenerationState::idle(tokens));

        Self {
            backend,
            cache,
            timeout,
            state_tx,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> GenerationState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GenerationState> {
        self.state_tx.subscribe()
    }

    /// Submits `prompt` and waits for it to settle.
    pub async fn submit(&self, prompt: &str) -> SubmitOutcome {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return SubmitOutcome::Rejected(SubmitRejection::EmptyPrompt);
        }

        let mut epoch = None;
        self.state_tx.send_if_modified(|state| {
            if state.status == GenerationStatus::Generating {
                return false;
            }
            epoch = Some(self.epoch.load(Ordering::Acquire));
            state.status = GenerationStatus::Generating;
            state.prompt = prompt.to_string();
            state.result = None;
            state.error = None;
            true
        });
        let Some(epoch) = epoch else {
            debug!("Generation already running, ignoring submission");
            return SubmitOutcome::Busy;
        };

        info!(prompt_len = prompt.len(), "Generation started");

        match self.run(prompt).await {
            Ok(result) => {
                let tokens = result.remaining_tokens;
                let video_url = result.video_url.clone();
                let applied = self.settle(epoch, |state| {
                    state.status = GenerationStatus::Complete;
                    state.tokens = tokens;
                    state.result = Some(result);
                });
                if applied {
                    info!(video_url = %video_url, remaining_tokens = tokens, "Generation complete");
                    self.store_balance(tokens);
                }
            }
            Err(message) => {
                let applied = self.settle(epoch, |state| {
                    state.status = GenerationStatus::Error;
                    state.error = Some(message.clone());
                });
                if applied {
                    warn!(error = %message, "Generation failed");
                }
            }
        }

        SubmitOutcome::Settled(self.state())
    }

    async fn run(&self, prompt: &str) -> Result<AnimationResult, String> {
        let request = self.backend.generate(prompt);
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, request).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(format!(
                        "Generation timed out after {} seconds. Please try again.",
                        limit.as_secs()
                    ))
                }
            },
            None => request.await,
        };
        result.map_err(|e| e.user_message())
    }

    /// Applies a terminal transition unless the submission was abandoned.
    fn settle(&self, epoch: u64, apply: impl FnOnce(&mut GenerationState)) -> bool {
        self.state_tx.send_if_modified(|state| {
            if self.epoch.load(Ordering::Acquire) != epoch {
                debug!("Discarding result of abandoned generation");
                return false;
            }
            apply(state);
            true
        })
    }

    /// Returns to `Idle`, abandoning any running submission.
    pub fn reset(&self) {
        self.state_tx.send_modify(|state| {
            self.epoch.fetch_add(1, Ordering::AcqRel);
            *state = GenerationState::idle(state.tokens);
        });
    }

    /// Fetches the balance from the backend. On failure the displayed balance
    /// is kept.
    pub async fn refresh_balance(&self) -> Result<i64, ApiError> {
        match self.backend.user_tokens().await {
            Ok(tokens) => {
                self.state_tx.send_if_modified(|state| {
                    if state.tokens == tokens {
                        false
                    } else {
                        state.tokens = tokens;
                        true
                    }
                });
                self.store_balance(tokens);
                Ok(tokens)
            }
            Err(e) => {
                warn!(error = %e, "Failed to refresh balance");
                Err(e)
            }
        }
    }

    fn store_balance(&self, tokens: i64) {
        match self.cache.update_balance(tokens) {
            Ok(true) => {}
            Ok(false) => debug!("No cached profile, balance not stored"),
            Err(e) => warn!(error = %e, "Failed to store balance"),
        }
    }
}
