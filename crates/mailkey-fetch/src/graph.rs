//! Microsoft Graph mail listing.

use std::time::Duration;

use mailkey_oauth::{TokenBroker, TokenPurpose};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::error::{FetchError, Result};
use crate::framed::DEFAULT_TIMEOUT;
use crate::message::{MessageSummary, NO_SUBJECT, UNKNOWN_SENDER, preview};

/// Graph API root.
pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0/";

const SELECT_FIELDS: &str = "subject,body,receivedDateTime,from,hasAttachments,isRead";

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    value: Vec<GraphMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    subject: Option<String>,
    body: Option<ItemBody>,
    received_date_time: Option<String>,
    from: Option<Recipient>,
    has_attachments: Option<bool>,
    is_read: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: Option<EmailAddress>,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    address: Option<String>,
}

impl GraphMessage {
    fn into_summary(self) -> MessageSummary {
        let body = self.body.map(ItemBody::into_text).unwrap_or_default();

        MessageSummary {
            protocol: TokenPurpose::Graph,
            subject: self
                .subject
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| NO_SUBJECT.to_string()),
            from: self
                .from
                .and_then(|r| r.email_address)
                .and_then(|e| e.address)
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| UNKNOWN_SENDER.to_string()),
            received: self.received_date_time.unwrap_or_default(),
            is_read: self.is_read,
            has_attachments: self.has_attachments,
            preview: preview(&body),
        }
    }
}

impl ItemBody {
    fn into_text(self) -> String {
        let content = self.content.unwrap_or_default();
        let is_html = self
            .content_type
            .is_some_and(|t| t.eq_ignore_ascii_case("html"));
        if !is_html {
            return content;
        }

        htmd::convert(&content).unwrap_or_else(|e| {
            warn!("HTML body conversion failed: {e}");
            content
        })
    }
}

/// Lists the newest messages through the Graph REST API.
#[derive(Debug, Clone)]
pub struct GraphSource {
    base_url: Url,
    http_client: Client,
}

impl GraphSource {
    /// Creates a source against the public Graph endpoint.
    ///
    /// # Errors
    ///
    /// [`FetchError::Http`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let base_url = Url::parse(GRAPH_BASE_URL)
            .map_err(|e| FetchError::Protocol(format!("invalid Graph URL: {e}")))?;
        Self::with_base_url(base_url, DEFAULT_TIMEOUT)
    }

    /// Creates a source against another API root, such as a local test server.
    ///
    /// # Errors
    ///
    /// [`FetchError::Http`] if the HTTP client cannot be built.
    pub fn with_base_url(base_url: Url, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            http_client,
        })
    }

    /// Returns up to `count` summaries, newest first.
    ///
    /// # Errors
    ///
    /// [`FetchError::Token`] if no token is available,
    /// [`FetchError::Api`] on a non-200 answer, [`FetchError::Http`] on
    /// transport or decoding failures.
    pub async fn fetch_recent(
        &self,
        broker: &TokenBroker,
        count: usize,
    ) -> Result<Vec<MessageSummary>> {
        let token = broker.get_access_token(TokenPurpose::Graph, false).await?;

        let url = self
            .base_url
            .join("me/messages")
            .map_err(|e| FetchError::Protocol(format!("invalid Graph URL: {e}")))?;

        let response = self
            .http_client
            .get(url)
            .bearer_auth(&token)
            .query(&[
                ("$top", count.to_string().as_str()),
                ("$select", SELECT_FIELDS),
                ("$orderby", "receivedDateTime desc"),
            ])
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Graph request rejected: {body}");
            return Err(FetchError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let list: MessageList = response.json().await?;
        let summaries: Vec<_> = list
            .value
            .into_iter()
            .map(GraphMessage::into_summary)
            .collect();

        info!(count = summaries.len(), "Fetched messages over Graph");
        Ok(summaries)
    }
}
