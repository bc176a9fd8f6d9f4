//! Error types for credential storage and token operations.

use std::io;
use std::path::PathBuf;

/// Result type alias for credential store operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for token broker operations.
pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Errors raised while loading, validating or persisting the credential record.
///
/// Every variant is recoverable by an operator fixing the record on disk.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The credential file does not exist.
    #[error("credential file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The credential file exists but holds no record.
    #[error("credential file is empty: {}", .0.display())]
    Empty(PathBuf),

    /// A field required for the record to be usable is absent.
    #[error("credential record is missing required field `{0}`")]
    MissingField(&'static str),

    /// A field required for authentication is empty.
    #[error("credential record is incomplete: `{0}` is empty")]
    Incomplete(&'static str),

    /// The account identifier is not an email address.
    #[error("account identifier is not an email address: {0}")]
    MalformedEmail(String),

    /// The native record declares a schema version this build cannot read.
    #[error("unsupported credential record version {0}")]
    UnsupportedVersion(u32),

    /// A field cannot be written in the legacy layout without corrupting it.
    #[error("field `{0}` contains a delimiter or line break and cannot be written in the legacy layout")]
    Unencodable(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the token broker.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The token endpoint answered with a non-success status.
    #[error("token refresh rejected with HTTP {status}: {body}")]
    RefreshRejected {
        /// HTTP status code.
        status: u16,
        /// Response body as sent by the server.
        body: String,
    },

    /// The request never produced a response (timeout, connect, TLS).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The identity endpoint refused the access token.
    #[error("identity check rejected with HTTP {status}: {body}")]
    IdentityRejected {
        /// HTTP status code.
        status: u16,
        /// Response body as sent by the server.
        body: String,
    },

    /// A success response did not carry what the protocol requires.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

impl AuthError {
    /// Returns true when the server rejected the refresh token itself,
    /// meaning the account must be authorized again.
    #[must_use]
    pub fn requires_reauthorization(&self) -> bool {
        matches!(self, Self::RefreshRejected { body, .. } if body.contains("invalid_grant"))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_rejected_keeps_server_text() {
        let err = AuthError::RefreshRejected {
            status: 401,
            body: r#"{"error":"invalid_grant"}"#.to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("401"));
        assert!(message.contains("invalid_grant"));
        assert!(err.requires_reauthorization());
    }

    #[test]
    fn test_other_rejection_does_not_require_reauthorization() {
        let err = AuthError::RefreshRejected {
            status: 503,
            body: "temporarily unavailable".to_string(),
        };
        assert!(!err.requires_reauthorization());
    }

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::NotFound(PathBuf::from("/tmp/outlook_token.txt"));
        assert_eq!(
            err.to_string(),
            "credential file not found: /tmp/outlook_token.txt"
        );
        assert_eq!(
            ConfigError::MissingField("refresh_token").to_string(),
            "credential record is missing required field `refresh_token`"
        );
    }
}
