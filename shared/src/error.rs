use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::capabilities::http::HttpError;

// ============================================================================
// Error Kinds
// ============================================================================

/// Classification of a failed remote operation, surfaced as data in the
/// sync and detail state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport-level failure, no response was received.
    Network,
    /// A response arrived with a non-success status.
    Server,
    /// The response body did not have the expected shape.
    Decode,
    /// The service confirmed that the requested incident does not exist.
    NotFound,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Server => "SERVER_ERROR",
            Self::Decode => "DECODE_ERROR",
            Self::NotFound => "NOT_FOUND",
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Server)
    }

    #[must_use]
    pub const fn http_status_hint(self) -> Option<u16> {
        match self {
            Self::NotFound => Some(404),
            Self::Server => Some(500),
            Self::Network | Self::Decode => None,
        }
    }

    #[must_use]
    pub const fn user_facing_message(self) -> &'static str {
        match self {
            Self::Network => {
                "Unable to reach the incident service. Showing the last known data."
            }
            Self::Server => "The incident service reported an error. Retrying shortly.",
            Self::Decode => {
                "Received data in an unexpected format. Please contact support if this persists."
            }
            Self::NotFound => "Incident Not Found",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// ============================================================================
// Fetch Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FetchError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("HTTP error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("invalid response: {reason}")]
    Decode { reason: String },

    #[error("incident not found: {id}")]
    NotFound { id: String },
}

impl FetchError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Server { .. } => ErrorKind::Server,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Builds a `Server` error for a non-success status, preferring the
    /// message the service put in the body.
    #[must_use]
    pub fn from_http_status(status: u16, body: &[u8]) -> Self {
        let message = server_message(body).unwrap_or_else(|| format!("HTTP error: {status}"));
        Self::Server { status, message }
    }
}

/// Extracts `detail` or `message` from a JSON error body.
fn server_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object()?;
    ["detail", "message"]
        .iter()
        .filter_map(|key| object.get(*key))
        .find_map(|v| v.as_str().map(str::to_owned))
        .filter(|m| !m.trim().is_empty())
}

impl From<HttpError> for FetchError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::InvalidResponse { .. } | HttpError::ResponseTooLarge { .. } => {
                Self::decode(e.to_string())
            }
            other => Self::network(other.to_string()),
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
