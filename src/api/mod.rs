//! Generation backend API: the authenticated request wrapper and its types.

mod client;
mod error;
mod types;

pub use client::ApiClient;
pub use error::ApiError;
pub(crate) use error::error_message;
pub use reqwest::Method;
pub use types::{AnimationHistoryItem, AnimationResult, TokenBalance};
