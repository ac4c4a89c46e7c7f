//! Error types shared by the tracker, the registry and the transport layer.

use thiserror::Error;

pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON serialization/deserialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The attempt ceiling was reached without the server reporting a terminal status.
    #[error("generation timed out after {attempts} polling attempts{}", last_error_suffix(.last_error))]
    Timeout {
        attempts: u32,
        last_error: Option<String>,
    },

    /// The server reported `failed`, `cancelled` or `error` for the run.
    #[error("{message}")]
    RunFailed { status: String, message: String },

    #[error("output transform failed: {0}")]
    Transform(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid response: {field} - {reason}")]
    InvalidResponse { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn last_error_suffix(last: &Option<String>) -> String {
    match last {
        Some(e) => format!(": {e}"),
        None => String::new(),
    }
}

impl TrackerError {
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_response(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Transport-level failures that are worth another polling cycle.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            TrackerError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            TrackerError::Api { status, .. } => *status >= 500 || *status == 429,
            TrackerError::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_mentions_timed_out_and_last_error() {
        let e = TrackerError::Timeout {
            attempts: 3,
            last_error: Some("request timed out".into()),
        };
        let msg = e.to_string();
        assert!(msg.contains("timed out after 3 polling attempts"));
        assert!(msg.ends_with(": request timed out"));

        let bare = TrackerError::Timeout {
            attempts: 150,
            last_error: None,
        };
        assert_eq!(bare.to_string(), "generation timed out after 150 polling attempts");
    }

    #[test]
    fn api_errors_are_recoverable_only_for_server_side_statuses() {
        assert!(TrackerError::api_error(503, "busy").is_recoverable());
        assert!(TrackerError::api_error(429, "slow down").is_recoverable());
        assert!(!TrackerError::api_error(404, "no such run").is_recoverable());
        assert!(!TrackerError::invalid_response("status", "missing").is_recoverable());
    }
}
