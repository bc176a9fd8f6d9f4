//! Error types for message retrieval.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while fetching messages.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The token broker could not supply a token.
    #[error("token error: {0}")]
    Token(#[from] mailkey_oauth::AuthError),

    /// The mail server refused the XOAUTH2 credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The mail server answered a command with an error.
    #[error("server error: {0}")]
    Server(String),

    /// Protocol violation or unexpected data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The REST API answered with a non-success status.
    #[error("API request failed with HTTP {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body as sent by the server.
        body: String,
    },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake failed, for example on an untrusted certificate.
    #[error("TLS error: {0}")]
    Tls(rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// A network step did not complete in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, FetchError>;
