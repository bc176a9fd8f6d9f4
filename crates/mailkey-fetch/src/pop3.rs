//! Minimal POP3 client: `AUTH XOAUTH2`, `STAT`, `RETR`, `QUIT`.

use std::time::Duration;

use mailkey_oauth::sasl::xoauth2_response;
use mailkey_oauth::{TokenBroker, TokenPurpose};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::error::{FetchError, Result};
use crate::framed::{DEFAULT_TIMEOUT, FramedStream, connect_tls, trim_crlf};
use crate::message::MessageSummary;

/// Outlook POP3 host.
pub const POP3_HOST: &str = "outlook.office365.com";

/// Implicit-TLS POP3 port.
pub const POP3_PORT: u16 = 995;

/// A POP3 connection past the greeting.
pub struct Pop3Session<S> {
    stream: FramedStream<S>,
}

impl<S> Pop3Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads the `+OK` greeting.
    ///
    /// # Errors
    ///
    /// [`FetchError::Server`] if the server greets with `-ERR`.
    pub async fn start(stream: S, timeout: Duration) -> Result<Self> {
        let mut session = Self {
            stream: FramedStream::new(stream, timeout),
        };
        let greeting = session.read_status().await?;
        debug!("POP3 greeting: {greeting}");
        Ok(session)
    }

    /// Authenticates with `AUTH XOAUTH2` followed by the encoded response.
    ///
    /// # Errors
    ///
    /// [`FetchError::Auth`] if the server answers `-ERR` at either step.
    pub async fn authenticate_xoauth2(&mut self, user: &str, access_token: &str) -> Result<()> {
        self.stream.write_line("AUTH XOAUTH2").await?;
        let line = self.stream.read_text_line().await?;
        if !line.starts_with('+') || line.starts_with("+OK") {
            return Err(FetchError::Auth(format!("AUTH XOAUTH2 not accepted: {line}")));
        }

        self.stream
            .write_line(&xoauth2_response(user, access_token))
            .await?;
        let line = self.stream.read_text_line().await?;

        if line.starts_with("+OK") {
            return Ok(());
        }
        if line.starts_with('+') {
            // Error challenge; an empty reply lets the server finish with -ERR.
            debug!("POP3 XOAUTH2 challenge: {line}");
            self.stream.write_line("").await?;
            let line = self.stream.read_text_line().await?;
            return Err(FetchError::Auth(strip_status(&line).to_string()));
        }
        Err(FetchError::Auth(strip_status(&line).to_string()))
    }

    /// Returns the number of messages in the maildrop.
    ///
    /// # Errors
    ///
    /// [`FetchError::Protocol`] if the reply is not `+OK count size`.
    pub async fn stat(&mut self) -> Result<usize> {
        self.stream.write_line("STAT").await?;
        let reply = self.read_status().await?;

        reply
            .split_whitespace()
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| FetchError::Protocol(format!("malformed STAT reply: {reply}")))
    }

    /// Retrieves message `index` (1-based) as raw bytes with CRLF line ends.
    ///
    /// # Errors
    ///
    /// [`FetchError::Server`] if the message does not exist.
    pub async fn retr(&mut self, index: usize) -> Result<Vec<u8>> {
        self.stream.write_line(&format!("RETR {index}")).await?;
        self.read_status().await?;

        let mut message = Vec::new();
        loop {
            let line = self.stream.read_line().await?;
            let content = trim_crlf(&line);
            if content == b"." {
                return Ok(message);
            }
            // Dot-unstuffing.
            let content = content.strip_prefix(b".").unwrap_or(content);
            message.extend_from_slice(content);
            message.extend_from_slice(b"\r\n");
        }
    }

    /// Ends the session. The server's reply is not awaited for errors.
    ///
    /// # Errors
    ///
    /// Returns an error only if the `QUIT` command cannot be written.
    pub async fn quit(mut self) -> Result<()> {
        self.stream.write_line("QUIT").await?;
        let _ = self.stream.read_line().await;
        Ok(())
    }

    /// Reads a single-line status reply, returning the text after `+OK`.
    async fn read_status(&mut self) -> Result<String> {
        let line = self.stream.read_text_line().await?;
        if line.starts_with("+OK") {
            return Ok(strip_status(&line).to_string());
        }
        if line.starts_with("-ERR") {
            return Err(FetchError::Server(strip_status(&line).to_string()));
        }
        Err(FetchError::Protocol(format!("unexpected reply: {line}")))
    }
}

fn strip_status(line: &str) -> &str {
    line.strip_prefix("+OK")
        .or_else(|| line.strip_prefix("-ERR"))
        .unwrap_or(line)
        .trim()
}

/// Reads the newest messages over POP3.
#[derive(Debug, Clone)]
pub struct Pop3Source {
    /// Server host name.
    pub host: String,
    /// Server port (implicit TLS).
    pub port: u16,
    /// Per-step network timeout.
    pub timeout: Duration,
}

impl Default for Pop3Source {
    fn default() -> Self {
        Self {
            host: POP3_HOST.to_string(),
            port: POP3_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Pop3Source {
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
        let token = broker.get_access_token(TokenPurpose::Pop3, false).await?;

        info!(host = %self.host, port = self.port, "Connecting to POP3 server");
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
        let mut session = Pop3Session::start(stream, self.timeout).await?;
        session.authenticate_xoauth2(user, access_token).await?;

        let total = session.stat().await?;
        let oldest = total.saturating_sub(count) + 1;

        let mut summaries = Vec::new();
        for index in (oldest..=total).rev() {
            let raw = session.retr(index).await?;
            summaries.push(MessageSummary::from_rfc822(TokenPurpose::Pop3, &raw));
        }

        session.quit().await?;
        info!(count = summaries.len(), "Fetched messages over POP3");
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

    fn response_line() -> Vec<u8> {
        format!("{}\r\n", xoauth2_response(USER, TOKEN)).into_bytes()
    }

    #[tokio::test]
    async fn test_fetch_newest_first() {
        let mock = Builder::new()
            .read(b"+OK The Microsoft Exchange POP3 service is ready.\r\n")
            .write(b"AUTH XOAUTH2\r\n")
            .read(b"+ \r\n")
            .write(&response_line())
            .read(b"+OK User successfully authenticated.\r\n")
            .write(b"STAT\r\n")
            .read(b"+OK 3 3000\r\n")
            .write(b"RETR 3\r\n")
            .read(b"+OK\r\nSubject: three\r\n\r\n..leading dot\r\n.\r\n")
            .write(b"RETR 2\r\n")
            .read(b"+OK\r\nSubject: two\r\n\r\nsecond\r\n.\r\n")
            .write(b"QUIT\r\n")
            .read(b"+OK Microsoft Exchange Server POP3 server signing off.\r\n")
            .build();

        let summaries = Pop3Source::default()
            .fetch_with_stream(mock, USER, TOKEN, 2)
            .await
            .unwrap();

        let subjects: Vec<_> = summaries.iter().map(|s| s.subject.as_str()).collect();
        assert_eq!(subjects, ["three", "two"]);
        assert_eq!(summaries[0].preview, ".leading dot");
        assert_eq!(summaries[1].protocol, TokenPurpose::Pop3);
    }

    #[tokio::test]
    async fn test_retr_terminator_after_split_crlf() {
        let mock = Builder::new()
            .read(b"+OK ready\r\n")
            .write(b"RETR 1\r\n")
            .read(b"+OK\r\nSubject: split\r\n\r\n..dot\r")
            .read(b"\nbody\r")
            .read(b"\n.\r\n")
            .build();

        let mut session = Pop3Session::start(mock, DEFAULT_TIMEOUT).await.unwrap();
        let message = session.retr(1).await.unwrap();
        assert_eq!(message, b"Subject: split\r\n\r\n.dot\r\nbody\r\n");
    }

    #[tokio::test]
    async fn test_count_larger_than_maildrop() {
        let mock = Builder::new()
            .read(b"+OK ready\r\n")
            .write(b"AUTH XOAUTH2\r\n")
            .read(b"+ \r\n")
            .write(&response_line())
            .read(b"+OK\r\n")
            .write(b"STAT\r\n")
            .read(b"+OK 1 100\r\n")
            .write(b"RETR 1\r\n")
            .read(b"+OK\r\nSubject: only\r\n\r\n.\r\n")
            .write(b"QUIT\r\n")
            .read(b"+OK\r\n")
            .build();

        let summaries = Pop3Source::default()
            .fetch_with_stream(mock, USER, TOKEN, 10)
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].subject, "only");
    }

    #[tokio::test]
    async fn test_empty_maildrop() {
        let mock = Builder::new()
            .read(b"+OK ready\r\n")
            .write(b"AUTH XOAUTH2\r\n")
            .read(b"+ \r\n")
            .write(&response_line())
            .read(b"+OK\r\n")
            .write(b"STAT\r\n")
            .read(b"+OK 0 0\r\n")
            .write(b"QUIT\r\n")
            .read(b"+OK\r\n")
            .build();

        let summaries = Pop3Source::default()
            .fetch_with_stream(mock, USER, TOKEN, 5)
            .await
            .unwrap();
        assert!(summaries.is_empty());
    }

    #[tokio::test]
    async fn test_auth_rejected() {
        let mock = Builder::new()
            .read(b"+OK ready\r\n")
            .write(b"AUTH XOAUTH2\r\n")
            .read(b"+ \r\n")
            .write(&response_line())
            .read(b"-ERR Authentication failure: unknown user name or bad password.\r\n")
            .build();

        let mut session = Pop3Session::start(mock, DEFAULT_TIMEOUT).await.unwrap();
        let err = session.authenticate_xoauth2(USER, TOKEN).await.unwrap_err();
        match err {
            FetchError::Auth(text) => assert!(text.starts_with("Authentication failure")),
            other => panic!("expected Auth, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_greeting() {
        let mock = Builder::new().read(b"-ERR server busy\r\n").build();
        let err = Pop3Session::start(mock, DEFAULT_TIMEOUT).await.err().unwrap();
        assert!(matches!(err, FetchError::Server(text) if text == "server busy"));
    }

    #[tokio::test]
    async fn test_retr_missing_message() {
        let mock = Builder::new()
            .read(b"+OK ready\r\n")
            .write(b"RETR 7\r\n")
            .read(b"-ERR no such message\r\n")
            .build();

        let mut session = Pop3Session::start(mock, DEFAULT_TIMEOUT).await.unwrap();
        let err = session.retr(7).await.unwrap_err();
        assert!(matches!(err, FetchError::Server(_)));
    }
}
