//! Authorization server and identity endpoint configuration.
//!
//! Only one identity provider is supported: Microsoft personal accounts
//! (`consumers` tenant). The URLs can be overridden so tests can point the
//! broker at a local server.

use url::Url;

/// Token endpoint of the Microsoft identity platform, `consumers` tenant.
pub const TOKEN_URL: &str = "https://login.microsoftonline.com/consumers/oauth2/v2.0/token";

/// Graph identity endpoint used to check a token end to end.
pub const IDENTITY_URL: &str = "https://graph.microsoft.com/v1.0/me";

/// Scope requested for REST API tokens. Legacy protocol tokens carry no scope.
pub const API_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Client identifier used when the credential record does not carry one.
pub const DEFAULT_CLIENT_ID: &str = "bb2aec70-3c74-48ab-9c37-13d36c32d99f";

/// Endpoint set used by the token broker.
#[derive(Debug, Clone)]
pub struct Provider {
    /// Token endpoint URL.
    pub token_url: Url,
    /// Identity endpoint URL.
    pub identity_url: Url,
    /// Scope parameter sent for API tokens.
    pub api_scope: String,
}

impl Provider {
    /// Microsoft consumer-account endpoints.
    ///
    /// # Panics
    ///
    /// Never: the URLs are compile-time constants covered by tests.
    #[must_use]
    #[allow(clippy::missing_panics_doc, clippy::expect_used)]
    pub fn microsoft() -> Self {
        Self {
            token_url: Url::parse(TOKEN_URL).expect("TOKEN_URL is a valid URL"),
            identity_url: Url::parse(IDENTITY_URL).expect("IDENTITY_URL is a valid URL"),
            api_scope: API_SCOPE.to_string(),
        }
    }

    /// Overrides the token endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn with_token_url(mut self, url: impl AsRef<str>) -> Result<Self, url::ParseError> {
        self.token_url = Url::parse(url.as_ref())?;
        Ok(self)
    }

    /// Overrides the identity endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn with_identity_url(mut self, url: impl AsRef<str>) -> Result<Self, url::ParseError> {
        self.identity_url = Url::parse(url.as_ref())?;
        Ok(self)
    }
}

impl Default for Provider {
    fn default() -> Self {
        Self::microsoft()
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
    fn test_microsoft_provider() {
        let provider = Provider::microsoft();
        assert_eq!(provider.token_url.as_str(), TOKEN_URL);
        assert_eq!(provider.identity_url.as_str(), IDENTITY_URL);
        assert_eq!(provider.api_scope, API_SCOPE);
    }

    #[test]
    fn test_overridden_endpoints() {
        let provider = Provider::microsoft()
            .with_token_url("http://127.0.0.1:8080/token")
            .unwrap()
            .with_identity_url("http://127.0.0.1:8080/me")
            .unwrap();

        assert_eq!(provider.token_url.path(), "/token");
        assert_eq!(provider.identity_url.path(), "/me");
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        assert!(Provider::microsoft().with_token_url("not a url").is_err());
    }

    #[test]
    fn test_default_client_id_is_uuid_shaped() {
        assert_eq!(DEFAULT_CLIENT_ID.len(), 36);
        assert_eq!(DEFAULT_CLIENT_ID.matches('-').count(), 4);
    }
}
