//! File-backed credential store.
//!
//! The store owns one path. Loading is a pure function of the file contents;
//! persisting replaces the file atomically (temp file, fsync, rename) so a
//! crash mid-write never leaves a truncated refresh token behind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::record::{self, CredentialRecord, RecordFormat};

/// Loads, validates and persists a [`CredentialRecord`].
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    format: RecordFormat,
}

impl CredentialStore {
    /// Creates a store for `path` that writes the native format.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: RecordFormat::Native,
        }
    }

    /// Sets the format used by [`persist`](Self::persist).
    #[must_use]
    pub const fn with_format(mut self, format: RecordFormat) -> Self {
        self.format = format;
        self
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the format written by [`persist`](Self::persist).
    #[must_use]
    pub const fn format(&self) -> RecordFormat {
        self.format
    }

    /// Loads the record from the first line of the backing file.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::NotFound`] if the file does not exist
    /// - [`ConfigError::Empty`] if it holds no record
    /// - [`ConfigError::MissingField`] if the account id or refresh token is absent
    pub fn load(&self) -> ConfigResult<CredentialRecord> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let line = content.lines().next().map(str::trim).unwrap_or_default();
        if line.is_empty() {
            return Err(ConfigError::Empty(self.path.clone()));
        }

        let decoded = record::decode(line)?;
        let record = decoded.record;

        info!(
            account = %record.account_id,
            client_id = %record.client_id,
            fields = decoded.field_count,
            format = ?decoded.format,
            has_access_token = !record.access_token.is_empty(),
            expires_at = ?record.expires_at,
            "Loaded credential record"
        );

        Ok(record)
    }

    /// Checks that a record can be used to authenticate.
    ///
    /// A client id that is not UUID-shaped only produces a warning.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Incomplete`] if the account id, client id or refresh token is empty
    /// - [`ConfigError::MalformedEmail`] if the account id has no `@`
    pub fn validate(record: &CredentialRecord) -> ConfigResult<()> {
        if record.account_id.is_empty() {
            return Err(ConfigError::Incomplete("account_id"));
        }
        if record.client_id.is_empty() {
            return Err(ConfigError::Incomplete("client_id"));
        }
        if record.refresh_token.is_empty() {
            return Err(ConfigError::Incomplete("refresh_token"));
        }
        if !record.account_id.contains('@') {
            return Err(ConfigError::MalformedEmail(record.account_id.clone()));
        }

        if record.client_id.len() != 36 || record.client_id.matches('-').count() != 4 {
            warn!(client_id = %record.client_id, "Client ID does not look like a UUID");
        }

        Ok(())
    }

    /// Writes the record, replacing the backing file atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded in the store's format
    /// or the file cannot be written. The previous file is left intact on error.
    pub fn persist(&self, record: &CredentialRecord) -> ConfigResult<()> {
        let mut line = record.encode(self.format)?;
        line.push('\n');

        let tmp_path = self.tmp_path();
        let written = write_synced(&tmp_path, line.as_bytes())
            .and_then(|()| fs::rename(&tmp_path, &self.path));

        if let Err(e) = written {
            warn!(path = %self.path.display(), "Failed to persist credential record: {e}");
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        debug!(
            path = %self.path.display(),
            format = ?self.format,
            has_access_token = !record.access_token.is_empty(),
            expires_at = ?record.expires_at,
            "Persisted credential record"
        );
        Ok(())
    }

    /// Sibling temp file, so the final rename stays on one filesystem.
    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map_or_else(|| "credentials".into(), |n| n.to_string_lossy().into_owned());
        self.path.with_file_name(format!(".{name}.tmp"))
    }
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file: File = options.open(path)?;
    file.write_all(data)?;
    file.flush()?;
    file.sync_all()
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
    use crate::provider::DEFAULT_CLIENT_ID;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn store_with(content: &str) -> (TempDir, CredentialStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outlook_token.txt");
        fs::write(&path, content).unwrap();
        (dir, CredentialStore::new(path))
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("absent.txt"));
        assert!(matches!(store.load(), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_empty_file() {
        let (_dir, store) = store_with("");
        assert!(matches!(store.load(), Err(ConfigError::Empty(_))));

        let (_dir, store) = store_with("   \n");
        assert!(matches!(store.load(), Err(ConfigError::Empty(_))));
    }

    #[test]
    fn test_load_missing_required_field() {
        let (_dir, store) = store_with("user@outlook.com---pw\n");
        assert!(matches!(
            store.load(),
            Err(ConfigError::MissingField("refresh_token"))
        ));
    }

    #[test]
    fn test_load_four_of_six_fields() {
        let (_dir, store) = store_with("user@outlook.com---pw---rt---\n");
        let record = store.load().unwrap();

        assert_eq!(record.access_token, "");
        assert!(record.expires_at.is_none());
        assert_eq!(record.client_id, DEFAULT_CLIENT_ID);
    }

    #[test]
    fn test_load_reads_only_first_line() {
        let (_dir, store) = store_with("user@outlook.com---pw---rt\ngarbage---line\n");
        assert_eq!(store.load().unwrap().refresh_token, "rt");
    }

    #[test]
    fn test_round_trip_is_fixed_point_native() {
        let (_dir, store) = store_with(
            "user@outlook.com---pw---rt---at---1712345678.125---11111111-2222-3333-4444-555555555555\n",
        );
        let first = store.load().unwrap();
        store.persist(&first).unwrap();
        let second = store.load().unwrap();

        assert_eq!(first, second);
        let content = fs::read_to_string(store.path()).unwrap();
        assert!(content.starts_with('{'));
    }

    #[test]
    fn test_round_trip_is_fixed_point_legacy() {
        let line = "user@outlook.com---pw---rt---at---1712345678.125---11111111-2222-3333-4444-555555555555\n";
        let (_dir, store) = store_with(line);
        let store = store.with_format(RecordFormat::Legacy);

        let first = store.load().unwrap();
        store.persist(&first).unwrap();
        let second = store.load().unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(store.path()).unwrap(), line);
    }

    #[test]
    fn test_persist_leaves_no_temp_file() {
        let (dir, store) = store_with("user@outlook.com---pw---rt\n");
        let record = store.load().unwrap();
        store.persist(&record).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_unencodable_legacy_persist_keeps_previous_file() {
        let line = "user@outlook.com---pw---rt\n";
        let (_dir, store) = store_with(line);
        let store = store.with_format(RecordFormat::Legacy);

        let record = store.load().unwrap().with_secret("has---delimiter");
        let err = store.persist(&record).unwrap_err();

        assert!(matches!(err, ConfigError::Unencodable("secret")));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), line);
    }

    #[test]
    fn test_native_persist_accepts_delimiter_in_secret() {
        let (_dir, store) = store_with("user@outlook.com---pw---rt\n");
        let record = store.load().unwrap().with_secret("has---delimiter");
        store.persist(&record).unwrap();

        assert_eq!(store.load().unwrap().secret, "has---delimiter");
    }

    #[test]
    fn test_persist_into_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("nested/missing/token.txt"));
        let record = CredentialRecord::new("user@outlook.com", "rt");
        assert!(matches!(store.persist(&record), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_validate_ok() {
        let record = CredentialRecord::new("user@outlook.com", "rt");
        CredentialStore::validate(&record).unwrap();
    }

    #[test]
    fn test_validate_incomplete() {
        let record = CredentialRecord::new("user@outlook.com", "rt").with_client_id("");
        assert!(matches!(
            CredentialStore::validate(&record),
            Err(ConfigError::Incomplete("client_id"))
        ));

        let record = CredentialRecord::new("user@outlook.com", "");
        assert!(matches!(
            CredentialStore::validate(&record),
            Err(ConfigError::Incomplete("refresh_token"))
        ));
    }

    #[test]
    fn test_validate_malformed_email() {
        let record = CredentialRecord::new("user.outlook.com", "rt");
        assert!(matches!(
            CredentialStore::validate(&record),
            Err(ConfigError::MalformedEmail(_))
        ));
    }

    #[test]
    fn test_validate_non_uuid_client_id_is_advisory() {
        let record = CredentialRecord::new("user@outlook.com", "rt").with_client_id("short-id");
        CredentialStore::validate(&record).unwrap();
    }

    #[test]
    fn test_persisted_expiry_survives_reload() {
        let (_dir, store) = store_with("user@outlook.com---pw---rt\n");
        let expires = Utc.timestamp_opt(4300, 0).unwrap();
        let record = store.load().unwrap().with_access_token("at", expires);
        store.persist(&record).unwrap();

        assert_eq!(store.load().unwrap().expires_at, Some(expires));
    }
}
