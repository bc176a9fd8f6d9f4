//! One entry point over the three retrieval protocols.

use std::fmt;

use mailkey_oauth::TokenBroker;
use tracing::{Instrument, info_span};

use crate::error::Result;
use crate::graph::GraphSource;
use crate::imap::ImapSource;
use crate::message::MessageSummary;
use crate::pop3::Pop3Source;

/// A place messages can be read from.
///
/// Every variant asks the broker for a token with its own purpose, right
/// before it connects, and never caches it.
#[derive(Debug, Clone)]
pub enum MessageSource {
    /// Microsoft Graph REST API.
    Graph(GraphSource),
    /// IMAP over implicit TLS.
    Imap(ImapSource),
    /// POP3 over implicit TLS.
    Pop3(Pop3Source),
}

impl MessageSource {
    /// Graph source against the public endpoint.
    ///
    /// # Errors
    ///
    /// Fails only if the HTTP client cannot be built.
    pub fn graph() -> Result<Self> {
        Ok(Self::Graph(GraphSource::new()?))
    }

    /// IMAP source against the Outlook server.
    #[must_use]
    pub fn imap() -> Self {
        Self::Imap(ImapSource::default())
    }

    /// POP3 source against the Outlook server.
    #[must_use]
    pub fn pop3() -> Self {
        Self::Pop3(Pop3Source::default())
    }

    /// Short protocol name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Graph(_) => "graph",
            Self::Imap(_) => "imap",
            Self::Pop3(_) => "pop3",
        }
    }

    /// Returns up to `count` summaries, newest first.
    ///
    /// # Errors
    ///
    /// Whatever the underlying protocol reports; see
    /// [`FetchError`](crate::FetchError).
    pub async fn fetch_recent(
        &self,
        broker: &TokenBroker,
        count: usize,
    ) -> Result<Vec<MessageSummary>> {
        let span = info_span!("fetch", source = self.name(), count);
        async {
            match self {
                Self::Graph(source) => source.fetch_recent(broker, count).await,
                Self::Imap(source) => source.fetch_recent(broker, count).await,
                Self::Pop3(source) => source.fetch_recent(broker, count).await,
            }
        }
        .instrument(span)
        .await
    }
}

impl fmt::Display for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
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
    fn test_names() {
        assert_eq!(MessageSource::graph().unwrap().name(), "graph");
        assert_eq!(MessageSource::imap().to_string(), "imap");
        assert_eq!(MessageSource::pop3().name(), "pop3");
    }

    #[test]
    fn test_default_endpoints() {
        let MessageSource::Imap(imap) = MessageSource::imap() else {
            panic!("expected imap");
        };
        assert_eq!((imap.host.as_str(), imap.port), ("outlook.office365.com", 993));
        assert_eq!(imap.mailbox, "INBOX");

        let MessageSource::Pop3(pop3) = MessageSource::pop3() else {
            panic!("expected pop3");
        };
        assert_eq!(pop3.port, 995);
    }
}
