//! Graph listing against a mock API server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mailkey_fetch::{FetchError, GraphSource, MessageSource};
use mailkey_oauth::{AuthError, CredentialRecord, CredentialStore, Provider, TokenBroker, TokenPurpose};

const ACCOUNT: &str = "user@outlook.com";

fn broker(dir: &TempDir, record: CredentialRecord, server: &MockServer) -> TokenBroker {
    let store = CredentialStore::new(dir.path().join("outlook_token.txt"));
    let provider = Provider::microsoft()
        .with_token_url(format!("{}/token", server.uri()))
        .unwrap();
    TokenBroker::new(store, record)
        .unwrap()
        .with_provider(provider)
}

fn cached_record() -> CredentialRecord {
    CredentialRecord::new(ACCOUNT, "rt")
        .with_access_token("graph-token", Utc::now() + chrono::Duration::hours(1))
}

fn source(server: &MockServer) -> MessageSource {
    let base = Url::parse(&server.uri()).unwrap();
    MessageSource::Graph(GraphSource::with_base_url(base, Duration::from_secs(5)).unwrap())
}

#[tokio::test]
async fn lists_messages_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/messages"))
        .and(header("authorization", "Bearer graph-token"))
        .and(query_param("$top", "2"))
        .and(query_param("$orderby", "receivedDateTime desc"))
        .and(query_param(
            "$select",
            "subject,body,receivedDateTime,from,hasAttachments,isRead",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {
                    "subject": "Quarterly report",
                    "body": { "contentType": "html", "content": "<p>Numbers are <b>up</b></p>" },
                    "receivedDateTime": "2024-05-01T10:00:00Z",
                    "from": { "emailAddress": { "name": "Boss", "address": "boss@example.com" } },
                    "hasAttachments": true,
                    "isRead": false
                },
                {
                    "body": { "contentType": "text", "content": "plain body" },
                    "receivedDateTime": "2024-04-30T09:00:00Z"
                }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let broker = broker(&dir, cached_record(), &server);
    let summaries = source(&server).fetch_recent(&broker, 2).await.unwrap();

    assert_eq!(summaries.len(), 2);

    let first = &summaries[0];
    assert_eq!(first.protocol, TokenPurpose::Graph);
    assert_eq!(first.subject, "Quarterly report");
    assert_eq!(first.from, "boss@example.com");
    assert_eq!(first.received, "2024-05-01T10:00:00Z");
    assert_eq!(first.is_read, Some(false));
    assert_eq!(first.has_attachments, Some(true));
    assert!(first.preview.contains("Numbers are"));
    assert!(!first.preview.contains("<p>"));

    let second = &summaries[1];
    assert_eq!(second.subject, "(no subject)");
    assert_eq!(second.from, "(unknown sender)");
    assert_eq!(second.preview, "plain body");
    assert_eq!(second.is_read, None);
}

#[tokio::test]
async fn long_bodies_are_truncated() {
    let server = MockServer::start().await;
    let content = "a".repeat(800);
    Mock::given(method("GET"))
        .and(path("/me/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{ "subject": "long", "body": { "contentType": "text", "content": content } }]
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let broker = broker(&dir, cached_record(), &server);
    let summaries = source(&server).fetch_recent(&broker, 1).await.unwrap();

    assert_eq!(summaries[0].preview, format!("{}...", "a".repeat(500)));
}

#[tokio::test]
async fn api_error_keeps_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/messages"))
        .respond_with(
            ResponseTemplate::new(403).set_body_string(r#"{"error":{"code":"ErrorAccessDenied"}}"#),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let broker = broker(&dir, cached_record(), &server);
    let err = source(&server).fetch_recent(&broker, 5).await.unwrap_err();

    match err {
        FetchError::Api { status, body } => {
            assert_eq!(status, 403);
            assert!(body.contains("ErrorAccessDenied"));
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn token_failure_stops_before_the_api_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/messages"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let broker = broker(&dir, CredentialRecord::new(ACCOUNT, "stale"), &server);
    let err = source(&server).fetch_recent(&broker, 5).await.unwrap_err();

    match err {
        FetchError::Token(inner @ AuthError::RefreshRejected { .. }) => {
            assert!(inner.requires_reauthorization());
        }
        other => panic!("expected token error, got {other:?}"),
    }
}
