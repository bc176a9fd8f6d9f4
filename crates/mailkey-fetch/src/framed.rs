//! CRLF-framed I/O shared by the IMAP and POP3 sessions.
//!
//! Every read and write is bounded by the session timeout so a silent server
//! cannot stall a fetch forever.

#![allow(clippy::missing_errors_doc)]

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::error::{FetchError, Result};

/// Default per-step network timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum line length to prevent memory exhaustion.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Maximum literal size to prevent memory exhaustion.
pub const MAX_LITERAL_SIZE: usize = 100 * 1024 * 1024;

/// Line-oriented stream with per-operation timeouts.
pub struct FramedStream<S> {
    reader: BufReader<S>,
    timeout: Duration,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a connected stream.
    #[must_use]
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(stream),
            timeout,
        }
    }

    /// Reads one CRLF-terminated line, including the terminator.
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        let timeout = self.timeout;
        let reader = &mut self.reader;
        bounded(timeout, async move {
            let mut line = Vec::new();
            loop {
                let buf = reader.fill_buf().await?;
                if buf.is_empty() {
                    return Err(FetchError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    )));
                }

                // CR at the end of the previous chunk, LF at the start of this one.
                if line.last() == Some(&b'\r') && buf[0] == b'\n' {
                    line.push(b'\n');
                    reader.consume(1);
                    return Ok(line);
                }

                if let Some(pos) = find_crlf(buf) {
                    line.extend_from_slice(&buf[..pos + 2]);
                    reader.consume(pos + 2);
                    return Ok(line);
                }

                let len = buf.len();
                line.extend_from_slice(buf);
                reader.consume(len);

                if line.len() > MAX_LINE_LENGTH {
                    return Err(FetchError::Protocol("line too long".to_string()));
                }
            }
        })
        .await
    }

    /// Reads one line as text with the CRLF stripped.
    pub async fn read_text_line(&mut self) -> Result<String> {
        let line = self.read_line().await?;
        Ok(String::from_utf8_lossy(trim_crlf(&line)).into_owned())
    }

    /// Reads exactly `len` bytes.
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > MAX_LITERAL_SIZE {
            return Err(FetchError::Protocol(format!(
                "literal too large: {len} bytes (max {MAX_LITERAL_SIZE})"
            )));
        }
        let timeout = self.timeout;
        let reader = &mut self.reader;
        bounded(timeout, async move {
            let mut data = vec![0u8; len];
            reader.read_exact(&mut data).await?;
            Ok(data)
        })
        .await
    }

    /// Writes `line` followed by CRLF and flushes.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let timeout = self.timeout;
        let stream = self.reader.get_mut();
        bounded(timeout, async move {
            let mut data = Vec::with_capacity(line.len() + 2);
            data.extend_from_slice(line.as_bytes());
            data.extend_from_slice(b"\r\n");
            stream.write_all(&data).await?;
            stream.flush().await?;
            Ok(())
        })
        .await
    }
}

async fn bounded<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| FetchError::Timeout(timeout))?
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Strips a trailing CRLF (or bare LF).
#[must_use]
pub fn trim_crlf(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r\n")
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line)
}

/// Connects to `host:port` over implicit TLS.
pub async fn connect_tls(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let connector = create_tls_connector();
    let server_name = ServerName::try_from(host.to_string())?;
    let addr = format!("{host}:{port}");

    bounded(timeout, async move {
        let tcp = TcpStream::connect(&addr).await?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(handshake_error)
    })
    .await
}

/// Recovers the rustls error that tokio-rustls wraps in `io::Error`.
fn handshake_error(err: io::Error) -> FetchError {
    match err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(tls) => FetchError::Tls(tls.clone()),
        None => FetchError::Io(err),
    }
}

/// Creates a TLS connector with the webpki root certificates.
fn create_tls_connector() -> TlsConnector {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
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

    #[tokio::test]
    async fn test_read_line_across_chunks() {
        let mock = Builder::new().read(b"+OK PO").read(b"P3 ready\r\nrest").build();
        let mut framed = FramedStream::new(mock, DEFAULT_TIMEOUT);

        assert_eq!(framed.read_text_line().await.unwrap(), "+OK POP3 ready");
        assert_eq!(framed.read_exact(4).await.unwrap(), b"rest");
    }

    #[tokio::test]
    async fn test_read_line_crlf_split_across_chunks() {
        let mock = Builder::new()
            .read(b"* SEARCH 1 2 3\r")
            .read(b"\nA0003 OK done\r\n")
            .build();
        let mut framed = FramedStream::new(mock, DEFAULT_TIMEOUT);

        assert_eq!(framed.read_text_line().await.unwrap(), "* SEARCH 1 2 3");
        assert_eq!(framed.read_text_line().await.unwrap(), "A0003 OK done");
    }

    #[tokio::test]
    async fn test_read_line_keeps_bare_cr() {
        let mock = Builder::new().read(b"a\r").read(b"b\r\n").build();
        let mut framed = FramedStream::new(mock, DEFAULT_TIMEOUT);

        assert_eq!(framed.read_line().await.unwrap(), b"a\rb\r\n");
    }

    #[tokio::test]
    async fn test_read_line_eof() {
        let mock = Builder::new().read(b"partial").build();
        let mut framed = FramedStream::new(mock, DEFAULT_TIMEOUT);

        let err = framed.read_line().await.unwrap_err();
        assert!(matches!(err, FetchError::Io(_)));
    }

    #[tokio::test]
    async fn test_write_line_appends_crlf() {
        let mock = Builder::new().write(b"QUIT\r\n").build();
        let mut framed = FramedStream::new(mock, DEFAULT_TIMEOUT);

        framed.write_line("QUIT").await.unwrap();
    }

    #[tokio::test]
    async fn test_literal_size_validation() {
        let mock = Builder::new().build();
        let mut framed = FramedStream::new(mock, DEFAULT_TIMEOUT);

        let err = framed.read_exact(MAX_LITERAL_SIZE + 1).await.unwrap_err();
        assert!(err.to_string().contains("literal too large"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let mock = Builder::new().wait(Duration::from_secs(60)).build();
        let mut framed = FramedStream::new(mock, Duration::from_secs(5));

        let err = framed.read_line().await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
    }

    #[test]
    fn test_handshake_error_keeps_tls_cause() {
        let cause = rustls::Error::InvalidCertificate(rustls::CertificateError::Expired);
        let err = handshake_error(io::Error::new(io::ErrorKind::InvalidData, cause));
        assert!(matches!(
            err,
            FetchError::Tls(rustls::Error::InvalidCertificate(rustls::CertificateError::Expired))
        ));

        let err = handshake_error(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(err, FetchError::Io(_)));
    }

    #[test]
    fn test_trim_crlf() {
        assert_eq!(trim_crlf(b"abc\r\n"), b"abc");
        assert_eq!(trim_crlf(b"abc\n"), b"abc");
        assert_eq!(trim_crlf(b"abc"), b"abc");
    }
}
