//! Command implementations.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use mailkey_fetch::{MessageSource, MessageSummary};
use mailkey_oauth::{
    CredentialRecord, CredentialStore, IdentityInfo, RecordFormat, TokenBroker, TokenPurpose,
};
use serde_json::json;
use tracing::{error, info};

use crate::cli::SourceArg;

/// Opens the store and loads a validated record.
pub fn load(path: &Path, format: RecordFormat) -> Result<(CredentialStore, CredentialRecord)> {
    let store = CredentialStore::new(path).with_format(format);
    let record = store
        .load()
        .with_context(|| format!("Failed to load credentials from {}", path.display()))?;
    CredentialStore::validate(&record).context("Credential record is not usable")?;
    Ok((store, record))
}

/// Builds a broker over a freshly loaded record.
pub fn broker(path: &Path, format: RecordFormat) -> Result<TokenBroker> {
    let (store, record) = load(path, format)?;
    TokenBroker::new(store, record).context("Failed to create token broker")
}

/// Offline view of the stored record.
#[derive(Debug)]
pub struct CheckReport {
    account_id: String,
    client_id: String,
    refresh_token_len: usize,
    access_token_len: usize,
    expires_at: Option<DateTime<Utc>>,
    valid: bool,
}

impl CheckReport {
    fn new(record: &CredentialRecord, now: DateTime<Utc>) -> Self {
        Self {
            account_id: record.account_id.clone(),
            client_id: record.client_id.clone(),
            refresh_token_len: record.refresh_token.len(),
            access_token_len: record.access_token.len(),
            expires_at: record.expires_at,
            valid: record.is_unexpired_at(now) && !record.access_token.is_empty(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "account_id": self.account_id,
            "client_id": self.client_id,
            "refresh_token_len": self.refresh_token_len,
            "access_token_len": self.access_token_len,
            "expires_at": self.expires_at,
            "valid": self.valid,
        })
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Account:        {}", self.account_id)?;
        writeln!(f, "Client ID:      {}", self.client_id)?;
        writeln!(f, "Refresh token:  {} chars", self.refresh_token_len)?;
        if self.access_token_len == 0 {
            writeln!(f, "Access token:   none cached")?;
        } else {
            writeln!(f, "Access token:   {} chars", self.access_token_len)?;
        }
        match self.expires_at {
            Some(at) => writeln!(f, "Expires at:     {}", at.to_rfc3339())?,
            None => writeln!(f, "Expires at:     unknown")?,
        }
        write!(
            f,
            "Cached token:   {}",
            if self.valid { "usable" } else { "needs refresh" }
        )
    }
}

/// `check`: validates the stored record without network access.
pub fn check(path: &Path, format: RecordFormat, json: bool) -> Result<()> {
    let (_, record) = load(path, format)?;
    let report = CheckReport::new(&record, Utc::now());

    if json {
        println!("{}", report.to_json());
    } else {
        println!("{report}");
    }
    Ok(())
}

fn print_identity(identity: &IdentityInfo, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(identity)?);
        return Ok(());
    }

    println!(
        "Account:      {}",
        identity.account_email.as_deref().unwrap_or("(unknown)")
    );
    println!(
        "Display name: {}",
        identity.display_name.as_deref().unwrap_or("(unknown)")
    );
    println!(
        "Account ID:   {}",
        identity.account_id.as_deref().unwrap_or("(unknown)")
    );
    Ok(())
}

/// `whoami`: proves the credentials work end to end.
pub async fn whoami(broker: &TokenBroker, json: bool) -> Result<()> {
    let identity = identify(broker).await?;
    print_identity(&identity, json)
}

async fn identify(broker: &TokenBroker) -> Result<IdentityInfo> {
    broker
        .validate_against_server()
        .await
        .context("Token validation failed")
}

/// `refresh`: forces a new access token and stores it.
pub async fn refresh(broker: &TokenBroker, json: bool) -> Result<()> {
    broker
        .force_refresh(TokenPurpose::Graph)
        .await
        .context("Token refresh failed")?;

    let record = broker.snapshot().await;
    let report = CheckReport::new(&record, Utc::now());
    if json {
        println!("{}", report.to_json());
    } else {
        println!("{report}");
    }
    Ok(())
}

/// Builds the source named on the command line.
pub fn source(arg: SourceArg) -> Result<MessageSource> {
    Ok(match arg {
        SourceArg::Graph => MessageSource::graph()?,
        SourceArg::Imap => MessageSource::imap(),
        SourceArg::Pop3 => MessageSource::pop3(),
    })
}

fn print_summaries(
    source: &MessageSource,
    summaries: &[MessageSummary],
    json: bool,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(summaries)?);
        return Ok(());
    }

    println!("{} message(s) via {source}", summaries.len());
    for (i, summary) in summaries.iter().enumerate() {
        println!("\n#{} {summary}", i + 1);
    }
    Ok(())
}

/// `fetch`: reads the newest messages over one protocol.
pub async fn fetch(
    broker: &TokenBroker,
    source: &MessageSource,
    count: usize,
    json: bool,
) -> Result<()> {
    let summaries = fetch_from(broker, source, count).await?;
    print_summaries(source, &summaries, json)
}

async fn fetch_from(
    broker: &TokenBroker,
    source: &MessageSource,
    count: usize,
) -> Result<Vec<MessageSummary>> {
    source
        .fetch_recent(broker, count)
        .await
        .with_context(|| format!("Fetching over {source} failed"))
}

/// Outcome of one protocol during `all`.
struct SourceOutcome<'a> {
    source: &'a MessageSource,
    result: Result<Vec<MessageSummary>>,
}

impl SourceOutcome<'_> {
    fn to_json(&self) -> serde_json::Value {
        match &self.result {
            Ok(summaries) => json!({ "source": self.source.name(), "messages": summaries }),
            Err(e) => json!({ "source": self.source.name(), "error": format!("{e:#}") }),
        }
    }
}

/// Single JSON document for `all`: the identity plus one entry per source.
fn all_to_json(identity: &IdentityInfo, outcomes: &[SourceOutcome<'_>]) -> serde_json::Value {
    json!({
        "identity": identity,
        "sources": outcomes.iter().map(SourceOutcome::to_json).collect::<Vec<_>>(),
    })
}

/// `all`: verifies the token, then tries every protocol.
///
/// A failing protocol is reported and the next one still runs. The command
/// fails if token validation fails or no protocol succeeds. With `--json`
/// everything is printed as one document once all sources have run.
pub async fn all(broker: &TokenBroker, count: usize, json: bool) -> Result<()> {
    let identity = identify(broker).await?;
    if !json {
        print_identity(&identity, false)?;
    }

    let sources = [
        MessageSource::graph()?,
        MessageSource::imap(),
        MessageSource::pop3(),
    ];
    let mut outcomes = Vec::with_capacity(sources.len());

    for source in &sources {
        let result = fetch_from(broker, source, count).await;
        match &result {
            Ok(summaries) if !json => print_summaries(source, summaries, false)?,
            Ok(_) => {}
            Err(e) => error!("{e:#}"),
        }
        outcomes.push(SourceOutcome { source, result });
    }

    if json {
        println!("{}", all_to_json(&identity, &outcomes));
    }

    let succeeded = outcomes.iter().filter(|o| o.result.is_ok()).count();
    info!(succeeded, total = sources.len(), "Finished reading all sources");
    if succeeded == 0 {
        bail!("No message source succeeded");
    }
    Ok(())
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
    use tempfile::TempDir;

    #[test]
    fn test_load_legacy_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outlook_token.txt");
        std::fs::write(&path, "user@outlook.com---pw---rt---at---4300.0---client-1\n").unwrap();

        let (store, record) = load(&path, RecordFormat::Legacy).unwrap();
        assert_eq!(store.format(), RecordFormat::Legacy);
        assert_eq!(record.account_id, "user@outlook.com");
        assert_eq!(record.client_id, "client-1");
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.txt");

        let err = load(&path, RecordFormat::Native).unwrap_err();
        assert!(err.to_string().starts_with("Failed to load credentials from"));
    }

    #[test]
    fn test_load_rejects_invalid_email() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outlook_token.txt");
        std::fs::write(&path, "not-an-email---pw---rt\n").unwrap();

        let err = load(&path, RecordFormat::Native).unwrap_err();
        assert_eq!(err.to_string(), "Credential record is not usable");
    }

    #[test]
    fn test_all_json_is_one_document() {
        let identity = IdentityInfo {
            account_email: Some("user@outlook.com".into()),
            display_name: None,
            account_id: Some("42".into()),
        };
        let graph = MessageSource::graph().unwrap();
        let imap = MessageSource::imap();
        let summary = MessageSummary::from_rfc822(
            TokenPurpose::Imap,
            b"Subject: hello\r\nFrom: a@example.com\r\n\r\nbody\r\n",
        );
        let outcomes = [
            SourceOutcome {
                source: &graph,
                result: Err(anyhow::anyhow!("HTTP 401")),
            },
            SourceOutcome {
                source: &imap,
                result: Ok(vec![summary]),
            },
        ];

        let doc = all_to_json(&identity, &outcomes);
        assert_eq!(doc["identity"]["account_email"], "user@outlook.com");
        assert_eq!(doc["sources"][0]["source"], "graph");
        assert_eq!(doc["sources"][0]["error"], "HTTP 401");
        assert_eq!(doc["sources"][1]["source"], "imap");
        assert_eq!(doc["sources"][1]["messages"][0]["subject"], "hello");
        assert_eq!(doc["sources"][1]["messages"][0]["protocol"], "IMAP_OAUTH");
    }

    #[test]
    fn test_check_report() {
        let record = CredentialRecord::new("user@outlook.com", "refresh")
            .with_access_token("access", Utc.timestamp_opt(4300, 0).unwrap());

        let fresh = CheckReport::new(&record, Utc.timestamp_opt(1000, 0).unwrap());
        assert!(fresh.valid);
        let text = fresh.to_string();
        assert!(text.contains("user@outlook.com"));
        assert!(text.contains("Refresh token:  7 chars"));
        assert!(text.contains("usable"));

        let stale = CheckReport::new(&record, Utc.timestamp_opt(4300, 0).unwrap());
        assert!(!stale.valid);
        assert_eq!(stale.to_json()["valid"], false);
    }
}
