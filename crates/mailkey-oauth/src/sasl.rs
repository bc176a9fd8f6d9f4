//! XOAUTH2 SASL initial response (Google/Microsoft proprietary).
//!
//! IMAP sends the base64 form as the `AUTHENTICATE XOAUTH2` argument; POP3
//! sends it on its own line after `AUTH XOAUTH2`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Builds the raw XOAUTH2 initial response.
///
/// Format: `user=<user>\x01auth=Bearer <token>\x01\x01`
///
/// # Example
///
/// ```
/// use mailkey_oauth::sasl::xoauth2_initial_response;
///
/// let raw = xoauth2_initial_response("user@outlook.com", "EwB4A8l6");
/// assert_eq!(raw, "user=user@outlook.com\x01auth=Bearer EwB4A8l6\x01\x01");
/// ```
#[must_use]
pub fn xoauth2_initial_response(user: &str, token: &str) -> String {
    format!("user={user}\x01auth=Bearer {token}\x01\x01")
}

/// Builds the base64-encoded XOAUTH2 initial response.
///
/// # Example
///
/// ```
/// use mailkey_oauth::sasl::xoauth2_response;
///
/// let response = xoauth2_response("user@outlook.com", "EwB4A8l6");
/// // Send: AUTHENTICATE XOAUTH2 {response}
/// ```
#[must_use]
pub fn xoauth2_response(user: &str, token: &str) -> String {
    STANDARD.encode(xoauth2_initial_response(user, token).as_bytes())
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
    fn test_xoauth2_format() {
        let response = xoauth2_response("test@test.com", "abc");
        let decoded = STANDARD.decode(&response).unwrap();
        let decoded_str = String::from_utf8(decoded).unwrap();

        assert_eq!(decoded_str, "user=test@test.com\x01auth=Bearer abc\x01\x01");
    }

    #[test]
    fn test_response_is_base64() {
        let response = xoauth2_response("user@example.com", "token");
        assert!(!response.contains("user@example.com"));
        assert!(STANDARD.decode(&response).is_ok());
    }
}
