use reqwest::StatusCode;
use serde::Deserialize;

/// Failures surfaced by the generation API client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// No backend credential is cached; nothing was sent.
    #[error("not signed in")]
    Unauthenticated,
    /// The backend answered with a non-2xx status.
    #[error("{message} (HTTP {status})")]
    Http { status: u16, message: String },
    /// The request could not be sent or the connection failed.
    #[error("network error: {0}")]
    Network(String),
    /// A 2xx response whose body did not match the expected shape.
    #[error("invalid response: {0}")]
    Decode(String),
    /// A downloaded file could not be written locally.
    #[error("failed to save file: {0}")]
    Io(String),
}

impl ApiError {
    /// Text suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Unauthenticated => "Please sign in to continue.".to_string(),
            ApiError::Http { message, .. } => message.clone(),
            ApiError::Network(_) => {
                "Could not reach the server. Check your connection and try again.".to_string()
            }
            ApiError::Decode(_) => "The server sent an unexpected response.".to_string(),
            ApiError::Io(e) => format!("Failed to save the video: {}", e),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Best available message for a failed response.
///
/// Prefers `message`, then `error` from a JSON body, then the raw body text,
/// then the status reason phrase.
pub(crate) fn error_message(status: StatusCode, body: &str) -> String {
    let fallback = || {
        status
            .canonical_reason()
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
    };

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed
            .message
            .or(parsed.error)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(fallback),
        Err(_) => {
            let text = body.trim();
            if text.is_empty() {
                fallback()
            } else {
                text.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_field_wins() {
        let msg = error_message(
            StatusCode::PAYMENT_REQUIRED,
            r#"{"message":"Not enough tokens","error":"insufficient_tokens"}"#,
        );
        assert_eq!(msg, "Not enough tokens");
    }

    #[test]
    fn test_error_field_fallback() {
        let msg = error_message(StatusCode::BAD_REQUEST, r#"{"error":"Prompt is required"}"#);
        assert_eq!(msg, "Prompt is required");
    }

    #[test]
    fn test_raw_text_fallback() {
        let msg = error_message(StatusCode::BAD_GATEWAY, "upstream timed out\n");
        assert_eq!(msg, "upstream timed out");
    }

    #[test]
    fn test_status_reason_fallback() {
        assert_eq!(
            error_message(StatusCode::INTERNAL_SERVER_ERROR, ""),
            "Internal Server Error"
        );
        assert_eq!(error_message(StatusCode::NOT_FOUND, "{}"), "Not Found");
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(
            ApiError::Http {
                status: 402,
                message: "Not enough tokens".to_string()
            }
            .user_message(),
            "Not enough tokens"
        );
        assert!(ApiError::Network("refused".to_string())
            .user_message()
            .contains("Could not reach the server"));
        assert!(ApiError::Io("disk full".to_string())
            .user_message()
            .contains("disk full"));
    }
}
