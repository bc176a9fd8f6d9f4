//! The durable credential record and its on-disk encodings.
//!
//! Two encodings exist:
//!
//! - **Native**: a single-line JSON object with an explicit schema version.
//!   JSON escaping keeps every field delimiter-safe. This is what the store
//!   writes by default.
//! - **Legacy**: `account---secret---refresh---access---expires---client`,
//!   positional and unescaped. It is read as an import path and can still be
//!   written for tools that only understand it, but the writer rejects values
//!   that would corrupt the layout.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, ConfigResult};
use crate::provider::DEFAULT_CLIENT_ID;
use crate::token::IssuedToken;

/// Field separator of the legacy layout.
pub const LEGACY_DELIMITER: &str = "---";

/// Schema version written by the native encoder.
pub const RECORD_VERSION: u32 = 1;

/// On-disk encoding of a credential record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordFormat {
    /// Versioned JSON, delimiter-safe.
    #[default]
    Native,
    /// Positional `---` layout.
    Legacy,
}

impl RecordFormat {
    /// Guesses the encoding of a stored line.
    #[must_use]
    pub fn detect(line: &str) -> Self {
        if line.trim_start().starts_with('{') {
            Self::Native
        } else {
            Self::Legacy
        }
    }
}

/// Durable account and token state, one per mailbox.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    /// Mailbox address.
    pub account_id: String,
    /// Opaque legacy secret, may be empty.
    pub secret: String,
    /// `OAuth2` client identifier.
    pub client_id: String,
    /// Long-lived refresh token.
    pub refresh_token: String,
    /// Last issued access token, empty if none.
    pub access_token: String,
    /// Expiry of `access_token`, margin already applied.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    /// Creates a record with the default client id and no cached access token.
    #[must_use]
    pub fn new(account_id: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            secret: String::new(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            refresh_token: refresh_token.into(),
            access_token: String::new(),
            expires_at: None,
        }
    }

    /// Sets the client id.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Sets the legacy secret.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// Sets the cached access token and its expiry.
    #[must_use]
    pub fn with_access_token(
        mut self,
        access_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        self.access_token = access_token.into();
        self.expires_at = Some(expires_at);
        self
    }

    /// Returns true if the expiry is set and strictly after `now`.
    #[must_use]
    pub fn is_unexpired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at > now)
    }

    /// Applies a refresh result. A refresh token that was not rotated is kept.
    pub fn apply(&mut self, issued: &IssuedToken) {
        self.access_token.clone_from(&issued.access_token);
        if let Some(rotated) = &issued.refresh_token {
            self.refresh_token.clone_from(rotated);
        }
        self.expires_at = Some(issued.expires_at);
    }

    /// Encodes the record in the given format, without a trailing newline.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Unencodable`] if a field cannot be represented
    /// in the legacy layout.
    pub fn encode(&self, format: RecordFormat) -> ConfigResult<String> {
        match format {
            RecordFormat::Native => Ok(serde_json::to_string(&NativeRecord::from(self))?),
            RecordFormat::Legacy => self.encode_legacy(),
        }
    }

    fn encode_legacy(&self) -> ConfigResult<String> {
        let expires = self.expires_at.map(format_epoch).unwrap_or_default();
        let fields: [(&'static str, &str); 6] = [
            ("account_id", &self.account_id),
            ("secret", &self.secret),
            ("refresh_token", &self.refresh_token),
            ("access_token", &self.access_token),
            ("expires_at", &expires),
            ("client_id", &self.client_id),
        ];

        for (name, value) in fields {
            if value.contains(LEGACY_DELIMITER) || value.contains(['\n', '\r']) {
                return Err(ConfigError::Unencodable(name));
            }
        }

        Ok(fields.map(|(_, value)| value).join(LEGACY_DELIMITER))
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("account_id", &self.account_id)
            .field("has_secret", &!self.secret.is_empty())
            .field("client_id", &self.client_id)
            .field("refresh_token_len", &self.refresh_token.len())
            .field("access_token_len", &self.access_token.len())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A record decoded from storage, with what the decoder saw.
#[derive(Debug, Clone)]
pub struct Decoded {
    /// The record.
    pub record: CredentialRecord,
    /// Encoding the line was written in.
    pub format: RecordFormat,
    /// Number of fields present in the stored line.
    pub field_count: usize,
}

/// Decodes a stored line in whichever format it was written.
///
/// # Errors
///
/// Returns [`ConfigError::MissingField`] if the account id or refresh token is
/// absent, or a JSON/version error for malformed native records.
pub fn decode(line: &str) -> ConfigResult<Decoded> {
    match RecordFormat::detect(line) {
        RecordFormat::Native => decode_native(line),
        RecordFormat::Legacy => decode_legacy(line),
    }
}

/// Decodes the positional legacy layout.
///
/// Fields beyond the supplied count default to empty, except the client id,
/// which defaults to [`DEFAULT_CLIENT_ID`].
///
/// # Errors
///
/// Returns [`ConfigError::MissingField`] if position 0 or 2 is absent or empty.
pub fn decode_legacy(line: &str) -> ConfigResult<Decoded> {
    let parts: Vec<&str> = line.trim().split(LEGACY_DELIMITER).collect();
    let field = |index: usize| parts.get(index).copied().unwrap_or_default();

    let account_id = field(0);
    if account_id.is_empty() {
        return Err(ConfigError::MissingField("account_id"));
    }
    let refresh_token = field(2);
    if refresh_token.is_empty() {
        return Err(ConfigError::MissingField("refresh_token"));
    }

    let raw_expiry = field(4);
    let expires_at = if raw_expiry.is_empty() {
        None
    } else {
        let parsed = parse_epoch(raw_expiry);
        if parsed.is_none() {
            warn!("Ignoring unparseable expiry timestamp in credential record");
        }
        parsed
    };

    let record = CredentialRecord {
        account_id: account_id.to_string(),
        secret: field(1).to_string(),
        client_id: parts
            .get(5)
            .map_or_else(|| DEFAULT_CLIENT_ID.to_string(), |id| (*id).to_string()),
        refresh_token: refresh_token.to_string(),
        access_token: field(3).to_string(),
        expires_at,
    };

    Ok(Decoded {
        record,
        format: RecordFormat::Legacy,
        field_count: parts.len(),
    })
}

/// Decodes the native JSON layout.
///
/// # Errors
///
/// Returns [`ConfigError::UnsupportedVersion`] for unknown schema versions,
/// [`ConfigError::Json`] for malformed JSON and [`ConfigError::MissingField`]
/// if the account id or refresh token is absent or empty.
pub fn decode_native(line: &str) -> ConfigResult<Decoded> {
    let probe: VersionProbe = serde_json::from_str(line)?;
    if probe.version != RECORD_VERSION {
        return Err(ConfigError::UnsupportedVersion(probe.version));
    }

    let native: NativeRecord = serde_json::from_str(line)?;
    if native.account_id.is_empty() {
        return Err(ConfigError::MissingField("account_id"));
    }
    if native.refresh_token.is_empty() {
        return Err(ConfigError::MissingField("refresh_token"));
    }

    let field_count = native.field_count();
    Ok(Decoded {
        record: native.into(),
        format: RecordFormat::Native,
        field_count,
    })
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct NativeRecord {
    version: u32,
    #[serde(default)]
    account_id: String,
    #[serde(default)]
    secret: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_client_id")]
    client_id: String,
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

impl NativeRecord {
    fn field_count(&self) -> usize {
        [
            !self.account_id.is_empty(),
            !self.secret.is_empty(),
            !self.refresh_token.is_empty(),
            !self.access_token.is_empty(),
            self.expires_at.is_some(),
            !self.client_id.is_empty(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }
}

impl From<&CredentialRecord> for NativeRecord {
    fn from(record: &CredentialRecord) -> Self {
        Self {
            version: RECORD_VERSION,
            account_id: record.account_id.clone(),
            secret: record.secret.clone(),
            refresh_token: record.refresh_token.clone(),
            access_token: record.access_token.clone(),
            expires_at: record.expires_at,
            client_id: record.client_id.clone(),
        }
    }
}

impl From<NativeRecord> for CredentialRecord {
    fn from(native: NativeRecord) -> Self {
        Self {
            account_id: native.account_id,
            secret: native.secret,
            client_id: native.client_id,
            refresh_token: native.refresh_token,
            access_token: native.access_token,
            expires_at: native.expires_at,
        }
    }
}

/// Parses Unix seconds with an optional fraction, e.g. `1712345678.25`.
fn parse_epoch(raw: &str) -> Option<DateTime<Utc>> {
    let (whole, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    let secs: i64 = whole.parse().ok()?;
    if !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let digits: String = fraction.chars().chain("000000000".chars()).take(9).collect();
    let nanos: u32 = digits.parse().ok()?;
    DateTime::from_timestamp(secs, nanos)
}

/// Formats an instant as Unix seconds, with a fraction only when needed.
fn format_epoch(instant: DateTime<Utc>) -> String {
    let nanos = instant.timestamp_subsec_nanos();
    if nanos == 0 {
        instant.timestamp().to_string()
    } else {
        let fraction = format!("{nanos:09}");
        format!("{}.{}", instant.timestamp(), fraction.trim_end_matches('0'))
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
    use proptest::prelude::*;

    const FULL_LINE: &str = "user@outlook.com---pw---M.C5_rt---EwA_at---1712345678.5---11111111-2222-3333-4444-555555555555";

    #[test]
    fn test_full_legacy_line() {
        let decoded = decode(FULL_LINE).unwrap();
        assert_eq!(decoded.format, RecordFormat::Legacy);
        assert_eq!(decoded.field_count, 6);

        let record = decoded.record;
        assert_eq!(record.account_id, "user@outlook.com");
        assert_eq!(record.secret, "pw");
        assert_eq!(record.refresh_token, "M.C5_rt");
        assert_eq!(record.access_token, "EwA_at");
        assert_eq!(
            record.expires_at,
            Some(Utc.timestamp_opt(1712345678, 500_000_000).unwrap())
        );
        assert_eq!(record.client_id, "11111111-2222-3333-4444-555555555555");
    }

    #[test]
    fn test_four_field_legacy_line_defaults_trailing_fields() {
        let decoded = decode("user@outlook.com---pw---rt---").unwrap();
        assert_eq!(decoded.field_count, 4);
        assert_eq!(decoded.record.access_token, "");
        assert!(decoded.record.expires_at.is_none());
        assert_eq!(decoded.record.client_id, DEFAULT_CLIENT_ID);
    }

    #[test]
    fn test_three_field_legacy_line() {
        let decoded = decode("user@outlook.com---pw---rt").unwrap();
        assert_eq!(decoded.record.refresh_token, "rt");
        assert_eq!(decoded.record.client_id, DEFAULT_CLIENT_ID);
    }

    #[test]
    fn test_present_but_empty_client_id_stays_empty() {
        let decoded = decode("user@outlook.com---pw---rt---at---1000---").unwrap();
        assert_eq!(decoded.record.client_id, "");
    }

    #[test]
    fn test_missing_refresh_token() {
        let err = decode("user@outlook.com---pw").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("refresh_token")));

        let err = decode("user@outlook.com---pw------at").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("refresh_token")));
    }

    #[test]
    fn test_missing_account_id() {
        let err = decode("---pw---rt").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("account_id")));
    }

    #[test]
    fn test_unparseable_expiry_is_absent() {
        let decoded = decode("user@outlook.com---pw---rt---at---soon").unwrap();
        assert!(decoded.record.expires_at.is_none());
    }

    #[test]
    fn test_epoch_formats() {
        assert_eq!(parse_epoch("4300"), Some(Utc.timestamp_opt(4300, 0).unwrap()));
        assert_eq!(
            parse_epoch("4300.123456"),
            Some(Utc.timestamp_opt(4300, 123_456_000).unwrap())
        );
        assert_eq!(parse_epoch("12.x"), None);
        assert_eq!(format_epoch(Utc.timestamp_opt(4300, 0).unwrap()), "4300");
        assert_eq!(
            format_epoch(Utc.timestamp_opt(4300, 250_000_000).unwrap()),
            "4300.25"
        );
    }

    #[test]
    fn test_legacy_encoding_is_positional() {
        let record = CredentialRecord::new("user@outlook.com", "rt")
            .with_secret("pw")
            .with_access_token("at", Utc.timestamp_opt(4300, 0).unwrap());

        assert_eq!(
            record.encode(RecordFormat::Legacy).unwrap(),
            format!("user@outlook.com---pw---rt---at---4300---{DEFAULT_CLIENT_ID}")
        );
    }

    #[test]
    fn test_legacy_writer_rejects_delimiter() {
        let record = CredentialRecord::new("user@outlook.com", "rt").with_secret("a---b");
        let err = record.encode(RecordFormat::Legacy).unwrap_err();
        assert!(matches!(err, ConfigError::Unencodable("secret")));

        let record = CredentialRecord::new("user@outlook.com", "rt\n");
        let err = record.encode(RecordFormat::Legacy).unwrap_err();
        assert!(matches!(err, ConfigError::Unencodable("refresh_token")));
    }

    #[test]
    fn test_native_encoding_carries_version() {
        let record = CredentialRecord::new("user@outlook.com", "rt");
        let line = record.encode(RecordFormat::Native).unwrap();

        assert!(line.starts_with('{'));
        assert!(line.contains(r#""version":1"#));
        assert!(!line.contains('\n'));
        assert_eq!(decode(&line).unwrap().format, RecordFormat::Native);
    }

    #[test]
    fn test_native_unknown_version() {
        let err = decode(r#"{"version":7,"account_id":"a@b","refresh_token":"rt"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(7)));
    }

    #[test]
    fn test_native_missing_refresh_token() {
        let err = decode(r#"{"version":1,"account_id":"a@b"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("refresh_token")));
    }

    #[test]
    fn test_native_defaults_client_id() {
        let decoded = decode(r#"{"version":1,"account_id":"a@b","refresh_token":"rt"}"#).unwrap();
        assert_eq!(decoded.record.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(decoded.field_count, 3);
    }

    #[test]
    fn test_apply_keeps_refresh_token_when_not_rotated() {
        let mut record = CredentialRecord::new("user@outlook.com", "old-rt");
        record.apply(&IssuedToken {
            access_token: "at".into(),
            refresh_token: None,
            expires_at: Utc.timestamp_opt(4300, 0).unwrap(),
        });

        assert_eq!(record.refresh_token, "old-rt");
        assert_eq!(record.access_token, "at");
        assert_eq!(record.expires_at, Some(Utc.timestamp_opt(4300, 0).unwrap()));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let record = CredentialRecord::new("user@outlook.com", "refresh-value")
            .with_secret("secret-value")
            .with_access_token("access-value", Utc.timestamp_opt(0, 0).unwrap());
        let debug = format!("{record:?}");

        assert!(debug.contains("user@outlook.com"));
        assert!(!debug.contains("refresh-value"));
        assert!(!debug.contains("secret-value"));
        assert!(!debug.contains("access-value"));
    }

    proptest! {
        #[test]
        fn native_encoding_survives_arbitrary_field_content(
            secret in ".*",
            refresh in ".+",
            access in ".*",
        ) {
            let record = CredentialRecord::new("user@outlook.com", refresh)
                .with_secret(secret)
                .with_access_token(access, Utc.timestamp_opt(1_700_000_000, 0).unwrap());

            let line = record.encode(RecordFormat::Native).unwrap();
            prop_assert!(!line.contains('\n'));
            prop_assert_eq!(decode(&line).unwrap().record, record);
        }
    }
}
