//! Error normalization for gateway API calls.

use std::fmt;

/// Maximum number of response-body characters surfaced in an error message.
const MAX_ERROR_CHARS: usize = 200;

pub type ApiResult<T> = Result<T, ApiError>;

/// Uniform error for every gateway call.
///
/// `status` is the HTTP status code, or `0` for failures below the HTTP layer
/// (DNS, timeouts, TLS).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    #[must_use]
    pub fn network(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: 0,
            message: message.into(),
            details,
        }
    }

    /// Build an error from a non-2xx response.
    #[must_use]
    pub fn http(status: reqwest::StatusCode, body: &str) -> Self {
        let trimmed = body.trim();
        let message = if trimmed.is_empty() {
            format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )
        } else {
            truncate_body(trimmed)
        };

        Self {
            status: status.as_u16(),
            message,
            details: None,
        }
    }

    #[must_use]
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn is_network(&self) -> bool {
        self.status == 0
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

/// Map a transport-layer failure onto a stable, user-facing category.
pub(crate) fn normalize_request_error(err: &reqwest::Error, url: &str) -> ApiError {
    let chain = error_chain(err);
    let lowered = chain.to_lowercase();

    let message = if lowered.contains("dns")
        || lowered.contains("resolve")
        || lowered.contains("name or service not known")
        || lowered.contains("nodename")
    {
        "Server not found".to_string()
    } else if err.is_timeout() || lowered.contains("timed out") || lowered.contains("timeout") {
        "Connection timed out".to_string()
    } else if lowered.contains("reset") {
        "Connection reset".to_string()
    } else if lowered.contains("certificate") || lowered.contains("cert") {
        "Certificate error".to_string()
    } else {
        chain.clone()
    };

    ApiError::network(message, Some(format!("{url}: {chain}")))
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut chain = err.to_string();
    let mut source = std::error::Error::source(err);

    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }

    chain
}

pub(crate) fn truncate_body(body: &str) -> String {
    body.chars().take(MAX_ERROR_CHARS).collect()
}
