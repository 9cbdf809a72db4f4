use serde::{Deserialize, Serialize};

/// Response of `POST /api/generate`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimationResult {
    pub video_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_url: Option<String>,
    pub remaining_tokens: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Response of `GET /api/user/tokens`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct TokenBalance {
    pub tokens: i64,
}

/// One entry of `GET /api/animations/history`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimationHistoryItem {
    pub id: String,
    pub user_id: String,
    pub prompt: String,
    pub video_url: String,
    #[serde(default)]
    pub code_url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryResponse {
    #[serde(default)]
    pub animations: Vec<AnimationHistoryItem>,
}

#[derive(Serialize)]
pub(crate) struct GenerateRequest<'a> {
    pub prompt: &'a str,
}
