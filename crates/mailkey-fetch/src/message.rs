//! Message summaries and a lenient RFC 822 reader.
//!
//! Only what a summary needs is parsed: the `Subject`, `From` and `Date`
//! headers and the first `text/plain` body. Malformed input never fails the
//! parse; undecodable pieces are passed through as-is.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mailkey_oauth::TokenPurpose;
use serde::Serialize;

/// Maximum number of characters kept in a preview before `...` is appended.
pub const PREVIEW_CHARS: usize = 500;

/// Placeholder for a message without a subject.
pub const NO_SUBJECT: &str = "(no subject)";

/// Placeholder for a message without a sender.
pub const UNKNOWN_SENDER: &str = "(unknown sender)";

/// One fetched message, reduced to what gets printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageSummary {
    /// Which protocol produced this summary.
    pub protocol: TokenPurpose,
    /// Decoded subject.
    pub subject: String,
    /// Sender address or display form.
    pub from: String,
    /// Receive time as reported by the server.
    pub received: String,
    /// Read flag, where the protocol reports one.
    pub is_read: Option<bool>,
    /// Attachment flag, where the protocol reports one.
    pub has_attachments: Option<bool>,
    /// Start of the text body.
    pub preview: String,
}

impl MessageSummary {
    /// Builds a summary from a raw RFC 822 message.
    #[must_use]
    pub fn from_rfc822(protocol: TokenPurpose, raw: &[u8]) -> Self {
        let message = RawMessage::parse(raw);

        Self {
            protocol,
            subject: message
                .header("subject")
                .map(decode_encoded_words)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| NO_SUBJECT.to_string()),
            from: message
                .header("from")
                .map(decode_encoded_words)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_SENDER.to_string()),
            received: message.header("date").unwrap_or_default().to_string(),
            is_read: None,
            has_attachments: None,
            preview: preview(&message.text_body().unwrap_or_default()),
        }
    }
}

impl fmt::Display for MessageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] {}", self.protocol, self.subject)?;
        writeln!(f, "  From:     {}", self.from)?;
        writeln!(f, "  Received: {}", self.received)?;
        if let Some(read) = self.is_read {
            writeln!(f, "  Read:     {read}")?;
        }
        if let Some(attachments) = self.has_attachments {
            writeln!(f, "  Attachments: {attachments}")?;
        }
        write!(f, "  {}", self.preview.replace('\n', "\n  "))
    }
}

/// Truncates `text` to [`PREVIEW_CHARS`] characters, appending `...` when cut.
#[must_use]
pub fn preview(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Header block plus body of one entity.
struct RawMessage {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RawMessage {
    fn parse(raw: &[u8]) -> Self {
        let (head, body) = split_head(raw);
        Self {
            headers: parse_headers(&String::from_utf8_lossy(head)),
            body: body.to_vec(),
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn content_type(&self) -> ContentType {
        self.header("content-type")
            .map_or_else(ContentType::text_plain, ContentType::parse)
    }

    /// Decoded first `text/plain` body, searching nested multiparts.
    fn text_body(&self) -> Option<String> {
        let content_type = self.content_type();

        if content_type.is_multipart() {
            let boundary = content_type.boundary?;
            return split_multipart(&self.body, &boundary)
                .into_iter()
                .map(Self::parse)
                .find_map(|part| part.text_body());
        }

        if content_type.mime_type != "text/plain" {
            return None;
        }

        let decoded = match self
            .header("content-transfer-encoding")
            .map(|e| e.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("base64") => decode_base64_lenient(&self.body),
            Some("quoted-printable") => decode_quoted_printable(&self.body),
            _ => self.body.clone(),
        };
        Some(String::from_utf8_lossy(&decoded).into_owned())
    }
}

struct ContentType {
    mime_type: String,
    boundary: Option<String>,
}

impl ContentType {
    fn text_plain() -> Self {
        Self {
            mime_type: "text/plain".to_string(),
            boundary: None,
        }
    }

    fn parse(value: &str) -> Self {
        let mut params = value.split(';');
        let mime_type = params.next().unwrap_or_default().trim().to_ascii_lowercase();

        let boundary = params.find_map(|param| {
            let (key, value) = param.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("boundary")
                .then(|| value.trim().trim_matches('"').to_string())
        });

        Self {
            mime_type,
            boundary,
        }
    }

    fn is_multipart(&self) -> bool {
        self.mime_type.starts_with("multipart/")
    }
}

/// Splits at the first blank line; a message without one is all headers.
fn split_head(raw: &[u8]) -> (&[u8], &[u8]) {
    let crlf = raw.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = raw.windows(2).position(|w| w == b"\n\n");

    match (crlf, lf) {
        (Some(c), Some(l)) if l < c => (&raw[..l], &raw[l + 2..]),
        (Some(c), _) => (&raw[..c], &raw[c + 4..]),
        (None, Some(l)) => (&raw[..l], &raw[l + 2..]),
        (None, None) => (raw, &[]),
    }
}

/// Parses an unfolded header block, keeping header order.
fn parse_headers(text: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }

        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    headers
}

/// Returns the body of each part between `--boundary` delimiters.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut start: Option<usize> = None;
    let mut pos = 0;

    while pos < body.len() {
        let line_end = body[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(body.len(), |i| pos + i + 1);
        let line = trim_line_end(&body[pos..line_end]);

        if line.starts_with(delimiter.as_bytes()) {
            if let Some(s) = start {
                parts.push(trim_line_end(&body[s..pos]));
            }
            if line[delimiter.len()..].starts_with(b"--") {
                return parts;
            }
            start = Some(line_end);
        }
        pos = line_end;
    }

    if let Some(s) = start {
        parts.push(&body[s..]);
    }
    parts
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn decode_base64_lenient(body: &[u8]) -> Vec<u8> {
    let cleaned: Vec<u8> = body
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD.decode(&cleaned).unwrap_or_else(|_| body.to_vec())
}

/// Decodes quoted-printable bytes, passing malformed escapes through.
fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        if input[i] != b'=' {
            out.push(input[i]);
            i += 1;
            continue;
        }

        // Soft line break.
        if input[i + 1..].starts_with(b"\r\n") {
            i += 3;
            continue;
        }
        if input[i + 1..].starts_with(b"\n") {
            i += 2;
            continue;
        }

        match input.get(i + 1..i + 3).and_then(hex_byte) {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(b'=');
                i += 1;
            }
        }
    }

    out
}

fn hex_byte(pair: &[u8]) -> Option<u8> {
    if !pair.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let s = std::str::from_utf8(pair).ok()?;
    u8::from_str_radix(s, 16).ok()
}

/// Decodes every RFC 2047 encoded word in a header value.
///
/// Whitespace between two adjacent encoded words is dropped. Words in an
/// unknown encoding are kept verbatim.
#[must_use]
pub fn decode_encoded_words(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    let mut last_was_word = false;

    while let Some(start) = rest.find("=?") {
        let (before, candidate) = rest.split_at(start);

        if let Some((decoded, consumed)) = parse_encoded_word(candidate) {
            if !(last_was_word && before.trim().is_empty()) {
                out.push_str(before);
            }
            out.push_str(&decoded);
            rest = &candidate[consumed..];
            last_was_word = true;
        } else {
            out.push_str(before);
            out.push_str("=?");
            rest = &candidate[2..];
            last_was_word = false;
        }
    }

    out.push_str(rest);
    out
}

/// Parses `=?charset?enc?text?=` at the start of `s`.
///
/// Returns the decoded text and the number of bytes consumed.
fn parse_encoded_word(s: &str) -> Option<(String, usize)> {
    let inner = s.strip_prefix("=?")?;
    let (_charset, rest) = inner.split_once('?')?;
    let (encoding, rest) = rest.split_once('?')?;
    let end = rest.find("?=")?;
    let text = &rest[..end];
    if text.contains(char::is_whitespace) {
        return None;
    }

    let bytes = match encoding {
        "B" | "b" => STANDARD.decode(text).ok()?,
        "Q" | "q" => decode_quoted_printable(text.replace('_', " ").as_bytes()),
        _ => return None,
    };

    let consumed = s.len() - rest.len() + end + 2;
    Some((String::from_utf8_lossy(&bytes).into_owned(), consumed))
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
    fn test_simple_message() {
        let raw = b"From: Alice <alice@example.com>\r\n\
Subject: Hello\r\n\
Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n\
\r\n\
Body text\r\n";
        let summary = MessageSummary::from_rfc822(TokenPurpose::Imap, raw);

        assert_eq!(summary.protocol, TokenPurpose::Imap);
        assert_eq!(summary.subject, "Hello");
        assert_eq!(summary.from, "Alice <alice@example.com>");
        assert_eq!(summary.received, "Mon, 1 Jan 2024 10:00:00 +0000");
        assert_eq!(summary.preview, "Body text");
        assert_eq!(summary.is_read, None);
    }

    #[test]
    fn test_missing_headers_use_placeholders() {
        let summary = MessageSummary::from_rfc822(TokenPurpose::Pop3, b"\r\nbody");
        assert_eq!(summary.subject, NO_SUBJECT);
        assert_eq!(summary.from, UNKNOWN_SENDER);
        assert_eq!(summary.received, "");
    }

    #[test]
    fn test_folded_header() {
        let raw = b"Subject: a very\r\n long subject\r\n\r\n";
        let summary = MessageSummary::from_rfc822(TokenPurpose::Imap, raw);
        assert_eq!(summary.subject, "a very long subject");
    }

    #[test]
    fn test_bare_lf_message() {
        let raw = b"Subject: unix\nFrom: bob@example.com\n\nline one\nline two\n";
        let summary = MessageSummary::from_rfc822(TokenPurpose::Pop3, raw);
        assert_eq!(summary.subject, "unix");
        assert_eq!(summary.preview, "line one\nline two");
    }

    #[test]
    fn test_encoded_words() {
        assert_eq!(decode_encoded_words("=?utf-8?B?SMOpbGxv?="), "Héllo");
        assert_eq!(decode_encoded_words("=?UTF-8?Q?H=C3=A9llo_there?="), "Héllo there");
        assert_eq!(
            decode_encoded_words("Re: =?utf-8?Q?caf=C3=A9?= time"),
            "Re: café time"
        );
        // Whitespace between adjacent encoded words is dropped.
        assert_eq!(decode_encoded_words("=?utf-8?Q?a?= =?utf-8?Q?b?="), "ab");
        assert_eq!(decode_encoded_words("plain =? text"), "plain =? text");
        assert_eq!(decode_encoded_words("=?utf-8?X?abc?="), "=?utf-8?X?abc?=");
    }

    #[test]
    fn test_multipart_prefers_text_plain() {
        let raw = b"Subject: multi\r\n\
Content-Type: multipart/alternative; boundary=\"XYZ\"\r\n\
\r\n\
preamble\r\n\
--XYZ\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>html</p>\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
caf=C3=A9 au=\r\n\
 lait\r\n\
--XYZ--\r\n";
        let summary = MessageSummary::from_rfc822(TokenPurpose::Imap, raw);
        assert_eq!(summary.preview, "café au lait");
    }

    #[test]
    fn test_nested_multipart_base64() {
        let raw = b"Content-Type: multipart/mixed; boundary=outer\r\n\
\r\n\
--outer\r\n\
Content-Type: multipart/alternative; boundary=inner\r\n\
\r\n\
--inner\r\n\
Content-Type: text/plain\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
SGVsbG8s\r\n\
IFdvcmxkIQ==\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: application/pdf\r\n\
\r\n\
%PDF\r\n\
--outer--\r\n";
        let summary = MessageSummary::from_rfc822(TokenPurpose::Pop3, raw);
        assert_eq!(summary.preview, "Hello, World!");
    }

    #[test]
    fn test_html_only_has_empty_preview() {
        let raw = b"Content-Type: text/html\r\n\r\n<p>hi</p>";
        let summary = MessageSummary::from_rfc822(TokenPurpose::Imap, raw);
        assert_eq!(summary.preview, "");
    }

    #[test]
    fn test_preview_truncation() {
        let short = "x".repeat(PREVIEW_CHARS);
        assert_eq!(preview(&short), short);

        let long = "é".repeat(PREVIEW_CHARS + 1);
        let cut = preview(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), PREVIEW_CHARS + 3);
    }

    #[test]
    fn test_quoted_printable_malformed_escape() {
        assert_eq!(decode_quoted_printable(b"a=ZZb="), b"a=ZZb=");
        assert_eq!(decode_quoted_printable(b"x=+Ay"), b"x=+Ay");
        assert_eq!(decode_quoted_printable(b"x=-1y"), b"x=-1y");
    }
}
