use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized - credential rejected by the server")]
    Unauthorized,

    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Not logged in")]
    Unauthenticated,

    #[error("Credential storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Network error: {0}")]
    NetworkFailure(#[from] reqwest::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Failed to encode request body: {0}")]
    Encode(serde_json::Error),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Whether this error means the caller has to log in again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            ApiError::SessionExpired | ApiError::Unauthenticated | ApiError::Unauthorized
        )
    }
}
