//! Minimal IMAP4rev1 client: XOAUTH2 login and whole-message fetch.
//!
//! Only the handful of commands needed to read the newest messages of one
//! mailbox are implemented. Responses are handled line by line; a line
//! ending in a `{N}` literal marker is followed by `N` raw bytes that belong
//! to the same response.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mailkey_oauth::sasl::xoauth2_response;
use mailkey_oauth::{TokenBroker, TokenPurpose};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::{FetchError, Result};
use crate::framed::{DEFAULT_TIMEOUT, FramedStream, connect_tls, trim_crlf};
use crate::message::MessageSummary;

/// Outlook IMAP host.
pub const IMAP_HOST: &str = "outlook.office365.com";

/// Implicit-TLS IMAP port.
pub const IMAP_PORT: u16 = 993;

/// One untagged response, with any literals it carried.
#[derive(Debug, Default)]
struct Untagged {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Outcome of a tagged command.
enum Completion {
    Ok,
    No(String),
    Bad(String),
}

/// An IMAP connection past the greeting.
pub struct ImapSession<S> {
    stream: FramedStream<S>,
    tag_counter: u32,
}

impl<S> ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads the server greeting.
    ///
    /// # Errors
    ///
    /// [`FetchError::Server`] on a `BYE` greeting, [`FetchError::Protocol`]
    /// on anything other than `* OK`.
    pub async fn start(stream: S, timeout: Duration) -> Result<Self> {
        let mut stream = FramedStream::new(stream, timeout);
        let greeting = stream.read_text_line().await?;
        debug!("IMAP greeting: {greeting}");

        if let Some(text) = greeting.strip_prefix("* BYE") {
            return Err(FetchError::Server(text.trim().to_string()));
        }
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(FetchError::Protocol(format!("unexpected greeting: {greeting}")));
        }

        Ok(Self {
            stream,
            tag_counter: 0,
        })
    }

    fn next_tag(&mut self) -> String {
        self.tag_counter += 1;
        format!("A{:04}", self.tag_counter)
    }

    /// Authenticates with `AUTHENTICATE XOAUTH2` and an initial response.
    ///
    /// A failing server sends a base64 JSON challenge first; it is answered
    /// with an empty line so the server can complete the command.
    ///
    /// # Errors
    ///
    /// [`FetchError::Auth`] if the server rejects the token.
    pub async fn authenticate_xoauth2(&mut self, user: &str, access_token: &str) -> Result<()> {
        let tag = self.next_tag();
        let response = xoauth2_response(user, access_token);
        self.stream
            .write_line(&format!("{tag} AUTHENTICATE XOAUTH2 {response}"))
            .await?;

        loop {
            let line = self.stream.read_text_line().await?;

            if let Some(challenge) = line.strip_prefix('+') {
                let challenge = challenge.trim();
                let detail = STANDARD
                    .decode(challenge)
                    .map_or_else(|_| challenge.to_string(), |b| String::from_utf8_lossy(&b).into_owned());
                warn!("IMAP XOAUTH2 challenge: {detail}");
                self.stream.write_line("").await?;
                continue;
            }

            let Some(rest) = line.strip_prefix(&tag) else {
                debug!("IMAP untagged during AUTHENTICATE: {line}");
                continue;
            };

            return match parse_completion(rest) {
                Completion::Ok => Ok(()),
                Completion::No(text) | Completion::Bad(text) => Err(FetchError::Auth(text)),
            };
        }
    }

    /// Selects `mailbox` and returns its message count.
    ///
    /// # Errors
    ///
    /// [`FetchError::Server`] if the server refuses the mailbox.
    pub async fn select(&mut self, mailbox: &str) -> Result<u32> {
        let responses = self
            .command(&format!("SELECT {}", quote_mailbox(mailbox)))
            .await?;

        let exists = responses
            .iter()
            .rev()
            .find_map(|r| {
                let mut words = r.text.split_whitespace();
                let n = words.next()?.parse::<u32>().ok()?;
                words.next()?.eq_ignore_ascii_case("EXISTS").then_some(n)
            })
            .unwrap_or(0);
        Ok(exists)
    }

    /// Returns every message sequence number in the selected mailbox.
    ///
    /// # Errors
    ///
    /// [`FetchError::Server`] if the search is refused.
    pub async fn search_all(&mut self) -> Result<Vec<u32>> {
        let responses = self.command("SEARCH ALL").await?;

        let mut ids: Vec<u32> = responses
            .iter()
            .filter_map(|r| r.text.strip_prefix("SEARCH"))
            .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse::<u32>().ok()))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Fetches the full RFC 822 text of message `id`.
    ///
    /// # Errors
    ///
    /// [`FetchError::Protocol`] if the response carries no message literal.
    pub async fn fetch_rfc822(&mut self, id: u32) -> Result<Vec<u8>> {
        let responses = self.command(&format!("FETCH {id} RFC822")).await?;

        responses
            .into_iter()
            .filter(|r| r.text.contains("FETCH"))
            .find_map(|r| r.literals.into_iter().next())
            .ok_or_else(|| FetchError::Protocol(format!("no RFC822 literal for message {id}")))
    }

    /// Ends the session. Errors after the command is sent are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error only if the `LOGOUT` command cannot be written.
    pub async fn logout(mut self) -> Result<()> {
        let tag = self.next_tag();
        self.stream.write_line(&format!("{tag} LOGOUT")).await?;
        let _ = self.read_until_tagged(&tag).await;
        Ok(())
    }

    /// Sends a tagged command and collects untagged responses until completion.
    async fn command(&mut self, command: &str) -> Result<Vec<Untagged>> {
        let tag = self.next_tag();
        debug!("IMAP > {tag} {command}");
        self.stream.write_line(&format!("{tag} {command}")).await?;

        let (responses, completion) = self.read_until_tagged(&tag).await?;
        match completion {
            Completion::Ok => Ok(responses),
            Completion::No(text) | Completion::Bad(text) => {
                Err(FetchError::Server(format!("{command}: {text}")))
            }
        }
    }

    async fn read_until_tagged(&mut self, tag: &str) -> Result<(Vec<Untagged>, Completion)> {
        let mut responses = Vec::new();

        loop {
            let line = self.stream.read_line().await?;

            if let Some(untagged) = line.strip_prefix(b"* ") {
                let response = self.read_untagged(untagged).await?;
                responses.push(response);
                continue;
            }

            let text = String::from_utf8_lossy(trim_crlf(&line)).into_owned();
            if let Some(rest) = text.strip_prefix(tag) {
                return Ok((responses, parse_completion(rest)));
            }
            debug!("IMAP ignoring line: {text}");
        }
    }

    /// Reads the remainder of an untagged response, following literals.
    async fn read_untagged(&mut self, first: &[u8]) -> Result<Untagged> {
        let mut response = Untagged::default();
        let mut line = first.to_vec();

        loop {
            response
                .text
                .push_str(&String::from_utf8_lossy(trim_crlf(&line)));

            let Some(len) = parse_literal_length(&line) else {
                return Ok(response);
            };
            response.literals.push(self.stream.read_exact(len).await?);
            line = self.stream.read_line().await?;
        }
    }
}

/// Splits `" OK text"` into a completion.
fn parse_completion(rest: &str) -> Completion {
    let rest = rest.trim_start();
    let (status, text) = rest.split_once(' ').unwrap_or((rest, ""));
    let text = text.to_string();

    if status.eq_ignore_ascii_case("OK") {
        Completion::Ok
    } else if status.eq_ignore_ascii_case("NO") {
        Completion::No(text)
    } else {
        Completion::Bad(text)
    }
}

/// Parses a trailing `{N}` or `{N+}` literal marker.
fn parse_literal_length(line: &[u8]) -> Option<usize> {
    let line = trim_crlf(line);
    let inner = line.strip_suffix(b"}")?;
    let open = inner.iter().rposition(|&b| b == b'{')?;
    let digits = &inner[open + 1..];
    let digits = digits.strip_suffix(b"+").unwrap_or(digits);

    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn quote_mailbox(name: &str) -> String {
    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b"._/-".contains(&b)) {
        return name.to_string();
    }
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Reads the newest messages of a mailbox over IMAP.
#[derive(Debug, Clone)]
pub struct ImapSource {
    /// Server host name.
    pub host: String,
    /// Server port (implicit TLS).
    pub port: u16,
    /// Mailbox to read.
    pub mailbox: String,
    /// Per-step network timeout.
    pub timeout: Duration,
}

impl Default for ImapSource {
    fn default() -> Self {
        Self {
            host: IMAP_HOST.to_string(),
            port: IMAP_PORT,
            mailbox: "INBOX".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ImapSource {
    /// Connects, authenticates with a token from `broker` and returns up to
    /// `count` summaries, newest first.
    ///
    /// # Errors
    ///
    /// Token, connection, authentication and protocol failures.
    pub async fn fetch_recent(
        &self,
        broker: &TokenBroker,
        count: usize,
    ) -> Result<Vec<MessageSummary>> {
        let token = broker.get_access_token(TokenPurpose::Imap, false).await?;

        info!(host = %self.host, port = self.port, "Connecting to IMAP server");
        let stream = connect_tls(&self.host, self.port, self.timeout).await?;
        self.fetch_with_stream(stream, broker.account_id(), &token, count)
            .await
    }

    /// Runs the session over an already-connected stream.
    ///
    /// # Errors
    ///
    /// Authentication and protocol failures.
    pub async fn fetch_with_stream<S>(
        &self,
        stream: S,
        user: &str,
        access_token: &str,
        count: usize,
    ) -> Result<Vec<MessageSummary>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = ImapSession::start(stream, self.timeout).await?;
        session.authenticate_xoauth2(user, access_token).await?;

        let exists = session.select(&self.mailbox).await?;
        debug!(mailbox = %self.mailbox, exists, "Mailbox selected");

        let ids = session.search_all().await?;
        let newest = &ids[ids.len().saturating_sub(count)..];

        let mut summaries = Vec::with_capacity(newest.len());
        for &id in newest.iter().rev() {
            let raw = session.fetch_rfc822(id).await?;
            summaries.push(MessageSummary::from_rfc822(TokenPurpose::Imap, &raw));
        }

        session.logout().await?;
        info!(count = summaries.len(), "Fetched messages over IMAP");
        Ok(summaries)
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
    use tokio_test::io::Builder;

    const USER: &str = "user@outlook.com";
    const TOKEN: &str = "tok";

    fn auth_line(tag: &str) -> Vec<u8> {
        format!(
            "{tag} AUTHENTICATE XOAUTH2 {}\r\n",
            xoauth2_response(USER, TOKEN)
        )
        .into_bytes()
    }

    fn message(subject: &str) -> String {
        format!("Subject: {subject}\r\nFrom: a@example.com\r\n\r\nbody of {subject}\r\n")
    }

    fn fetch_response(id: u32, subject: &str) -> Vec<u8> {
        let msg = message(subject);
        format!("* {id} FETCH (RFC822 {{{}}}\r\n{msg})\r\n", msg.len()).into_bytes()
    }

    #[test]
    fn test_parse_literal_length() {
        assert_eq!(parse_literal_length(b"* 1 FETCH (RFC822 {42}\r\n"), Some(42));
        assert_eq!(parse_literal_length(b"* 1 FETCH (RFC822 {7+}\r\n"), Some(7));
        assert_eq!(parse_literal_length(b"* 1 FETCH (FLAGS ())\r\n"), None);
        assert_eq!(parse_literal_length(b"{abc}\r\n"), None);
    }

    #[test]
    fn test_quote_mailbox() {
        assert_eq!(quote_mailbox("INBOX"), "INBOX");
        assert_eq!(quote_mailbox("Sent Items"), "\"Sent Items\"");
        assert_eq!(quote_mailbox("a\"b"), "\"a\\\"b\"");
    }

    #[tokio::test]
    async fn test_fetch_newest_first() {
        let mock = Builder::new()
            .read(b"* OK Outlook.com IMAP4rev1 server ready\r\n")
            .write(&auth_line("A0001"))
            .read(b"* CAPABILITY IMAP4rev1\r\nA0001 OK AUTHENTICATE completed.\r\n")
            .write(b"A0002 SELECT INBOX\r\n")
            .read(b"* 3 EXISTS\r\n* 0 RECENT\r\nA0002 OK [READ-WRITE] SELECT completed.\r\n")
            .write(b"A0003 SEARCH ALL\r\n")
            .read(b"* SEARCH 1 2 3\r\nA0003 OK SEARCH completed.\r\n")
            .write(b"A0004 FETCH 3 RFC822\r\n")
            .read(&fetch_response(3, "third"))
            .read(b"A0004 OK FETCH completed.\r\n")
            .write(b"A0005 FETCH 2 RFC822\r\n")
            .read(&fetch_response(2, "second"))
            .read(b"A0005 OK FETCH completed.\r\n")
            .write(b"A0006 LOGOUT\r\n")
            .read(b"* BYE\r\nA0006 OK LOGOUT completed.\r\n")
            .build();

        let source = ImapSource::default();
        let summaries = source.fetch_with_stream(mock, USER, TOKEN, 2).await.unwrap();

        let subjects: Vec<_> = summaries.iter().map(|s| s.subject.as_str()).collect();
        assert_eq!(subjects, ["third", "second"]);
        assert_eq!(summaries[0].preview, "body of third");
        assert_eq!(summaries[0].protocol, TokenPurpose::Imap);
    }

    #[tokio::test]
    async fn test_tagged_completion_after_split_crlf() {
        let mock = Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 SEARCH ALL\r\n")
            .read(b"* SEARCH 3 1 2\r")
            .read(b"\nA0001 OK SEARCH completed.\r")
            .read(b"\n")
            .build();

        let mut session = ImapSession::start(mock, DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(session.search_all().await.unwrap(), [1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_mailbox() {
        let mock = Builder::new()
            .read(b"* OK ready\r\n")
            .write(&auth_line("A0001"))
            .read(b"A0001 OK done\r\n")
            .write(b"A0002 SELECT INBOX\r\n")
            .read(b"* 0 EXISTS\r\nA0002 OK done\r\n")
            .write(b"A0003 SEARCH ALL\r\n")
            .read(b"* SEARCH\r\nA0003 OK done\r\n")
            .write(b"A0004 LOGOUT\r\n")
            .read(b"A0004 OK bye\r\n")
            .build();

        let summaries = ImapSource::default()
            .fetch_with_stream(mock, USER, TOKEN, 5)
            .await
            .unwrap();
        assert!(summaries.is_empty());
    }

    #[tokio::test]
    async fn test_auth_rejected_after_challenge() {
        let challenge = STANDARD.encode(br#"{"status":"401","schemes":"bearer"}"#);
        let mock = Builder::new()
            .read(b"* OK ready\r\n")
            .write(&auth_line("A0001"))
            .read(format!("+ {challenge}\r\n").as_bytes())
            .write(b"\r\n")
            .read(b"A0001 NO AUTHENTICATE failed.\r\n")
            .build();

        let mut session = ImapSession::start(mock, DEFAULT_TIMEOUT).await.unwrap();
        let err = session.authenticate_xoauth2(USER, TOKEN).await.unwrap_err();
        match err {
            FetchError::Auth(text) => assert_eq!(text, "AUTHENTICATE failed."),
            other => panic!("expected Auth, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bye_greeting() {
        let mock = Builder::new().read(b"* BYE too many connections\r\n").build();
        let err = ImapSession::start(mock, DEFAULT_TIMEOUT).await.err().unwrap();
        assert!(matches!(err, FetchError::Server(text) if text == "too many connections"));
    }

    #[tokio::test]
    async fn test_select_refused() {
        let mock = Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 SELECT Missing\r\n")
            .read(b"A0001 NO Mailbox does not exist\r\n")
            .build();

        let mut session = ImapSession::start(mock, DEFAULT_TIMEOUT).await.unwrap();
        let err = session.select("Missing").await.unwrap_err();
        assert!(err.to_string().contains("Mailbox does not exist"));
    }

    #[tokio::test]
    async fn test_fetch_without_literal() {
        let mock = Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 FETCH 9 RFC822\r\n")
            .read(b"A0001 OK FETCH completed.\r\n")
            .build();

        let mut session = ImapSession::start(mock, DEFAULT_TIMEOUT).await.unwrap();
        let err = session.fetch_rfc822(9).await.unwrap_err();
        assert!(matches!(err, FetchError::Protocol(_)));
    }
}
