//! Wire types of the token and identity endpoints.

use crate::error::{AuthError, AuthResult};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifetime assumed when the token endpoint omits `expires_in`.
pub const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Safety margin subtracted from the server-reported lifetime so a refresh
/// always happens before the token really expires.
pub const EXPIRY_MARGIN_SECS: i64 = 300;

/// What a token is going to be used for.
///
/// The REST API needs a scoped token; the legacy protocols use the implicit
/// scope granted at authorization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TokenPurpose {
    /// Microsoft Graph REST API.
    #[serde(rename = "GRAPH")]
    Graph,
    /// IMAP with XOAUTH2.
    #[serde(rename = "IMAP_OAUTH")]
    Imap,
    /// POP3 with XOAUTH2.
    #[serde(rename = "POP3_OAUTH")]
    Pop3,
}

impl TokenPurpose {
    /// Returns true if the refresh request must carry the API scope.
    #[must_use]
    pub const fn requires_scope(self) -> bool {
        matches!(self, Self::Graph)
    }

    /// Short protocol label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Graph => "GRAPH",
            Self::Imap => "IMAP_OAUTH",
            Self::Pop3 => "POP3_OAUTH",
        }
    }
}

impl fmt::Display for TokenPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token response from the authorization server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    /// Access token. Required; kept optional so a missing value maps to
    /// [`AuthError::InvalidResponse`] instead of a JSON error.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Rotated refresh token, only present when the server rotates it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    /// Token type (usually "Bearer").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// A successfully refreshed token pair.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// New access token.
    pub access_token: String,
    /// Rotated refresh token, if the server issued one.
    pub refresh_token: Option<String>,
    /// Expiry with the safety margin already applied.
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("access_token_len", &self.access_token.len())
            .field("refresh_token_rotated", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl TokenResponse {
    /// Converts the response into an [`IssuedToken`] issued at `issued_at`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidResponse`] if no access token is present
    /// or `expires_in` does not yield a representable expiry.
    pub fn into_issued(self, issued_at: DateTime<Utc>) -> AuthResult<IssuedToken> {
        let access_token = self
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("missing access_token".into()))?;
        let expires_at = expiry_from(issued_at, self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN))
            .ok_or_else(|| AuthError::InvalidResponse("expires_in out of range".into()))?;

        Ok(IssuedToken {
            access_token,
            refresh_token: self.refresh_token.filter(|token| !token.is_empty()),
            expires_at,
        })
    }
}

/// Computes `issued_at + expires_in - 300s`, or `None` on overflow.
#[must_use]
pub fn expiry_from(issued_at: DateTime<Utc>, expires_in: i64) -> Option<DateTime<Utc>> {
    let lifetime = TimeDelta::try_seconds(expires_in.checked_sub(EXPIRY_MARGIN_SECS)?)?;
    issued_at.checked_add_signed(lifetime)
}

/// Raw identity endpoint response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityResponse {
    /// Primary SMTP address, often null for personal accounts.
    #[serde(default)]
    pub mail: Option<String>,
    /// Sign-in name, used when `mail` is absent.
    #[serde(default)]
    pub user_principal_name: Option<String>,
    /// Display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Directory object id.
    #[serde(default)]
    pub id: Option<String>,
}

/// Identity of the account the access token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityInfo {
    /// Mailbox address.
    pub account_email: Option<String>,
    /// Display name.
    pub display_name: Option<String>,
    /// Server-side account identifier.
    pub account_id: Option<String>,
}

impl From<IdentityResponse> for IdentityInfo {
    fn from(response: IdentityResponse) -> Self {
        Self {
            account_email: response.mail.or(response.user_principal_name),
            display_name: response.display_name,
            account_id: response.id,
        }
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
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_expiry_applies_margin() {
        assert_eq!(expiry_from(at(1000), 3600), Some(at(4300)));
    }

    #[test]
    fn test_missing_expires_in_defaults_to_an_hour() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"abc","token_type":"Bearer"}"#).unwrap();
        let issued = response.into_issued(at(1000)).unwrap();

        assert_eq!(issued.access_token, "abc");
        assert!(issued.refresh_token.is_none());
        assert_eq!(issued.expires_at, at(4300));
    }

    #[test]
    fn test_rotated_refresh_token_is_kept() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"abc","refresh_token":"new-rt","expires_in":600}"#,
        )
        .unwrap();
        let issued = response.into_issued(at(0)).unwrap();

        assert_eq!(issued.refresh_token.as_deref(), Some("new-rt"));
        assert_eq!(issued.expires_at, at(300));
    }

    #[test]
    fn test_missing_access_token_is_invalid() {
        let response: TokenResponse = serde_json::from_str(r#"{"expires_in":3600}"#).unwrap();
        let err = response.into_issued(at(0)).unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(_)));
    }

    #[test]
    fn test_out_of_range_expires_in_is_invalid() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"abc","expires_in":9223372036854775807}"#)
                .unwrap();
        let err = response.into_issued(at(1000)).unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(ref msg) if msg == "expires_in out of range"));

        assert!(expiry_from(at(1000), i64::MIN).is_none());
        assert!(expiry_from(DateTime::<Utc>::MAX_UTC, 3600).is_none());
    }

    #[test]
    fn test_issued_token_debug_hides_value() {
        let issued = IssuedToken {
            access_token: "super-secret".into(),
            refresh_token: Some("also-secret".into()),
            expires_at: at(0),
        };
        let debug = format!("{issued:?}");
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("also-secret"));
    }

    #[test]
    fn test_identity_prefers_mail_over_upn() {
        let response: IdentityResponse = serde_json::from_str(
            r#"{"mail":"a@outlook.com","userPrincipalName":"b@outlook.com","displayName":"A","id":"42"}"#,
        )
        .unwrap();
        let info = IdentityInfo::from(response);
        assert_eq!(info.account_email.as_deref(), Some("a@outlook.com"));
        assert_eq!(info.display_name.as_deref(), Some("A"));
        assert_eq!(info.account_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_identity_falls_back_to_upn() {
        let response: IdentityResponse =
            serde_json::from_str(r#"{"mail":null,"userPrincipalName":"b@outlook.com"}"#).unwrap();
        let info = IdentityInfo::from(response);
        assert_eq!(info.account_email.as_deref(), Some("b@outlook.com"));
        assert!(info.display_name.is_none());
    }

    #[test]
    fn test_only_graph_requires_scope() {
        assert!(TokenPurpose::Graph.requires_scope());
        assert!(!TokenPurpose::Imap.requires_scope());
        assert!(!TokenPurpose::Pop3.requires_scope());
    }
}
