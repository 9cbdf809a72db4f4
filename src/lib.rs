// Local credential storage and cache
pub mod credentials;

// Identity provider (Supabase) and OAuth redirect
pub mod identity;

// Backend token exchange and session reconciliation
pub mod session;

// Generation API client
pub mod api;

// Generation flow controller
pub mod generation;

// Configuration
pub mod config;

pub use api::{ApiClient, ApiError};
pub use config::{load_config, ClientConfig};
pub use credentials::{CachedAuth, CredentialCache, LocalStorage};
pub use generation::{GenerationController, GenerationState, GenerationStatus, SubmitOutcome};
pub use identity::{IdentityProvider, IdentitySession, SupabaseAuth};
pub use session::{SessionBridge, SessionState, TokenExchange};
