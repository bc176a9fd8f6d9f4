//! Token broker tests against a mock authorization server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::task::JoinSet;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mailkey_oauth::time::MockClock;
use mailkey_oauth::{
    AuthError, CredentialRecord, CredentialStore, Provider, TokenBroker, TokenPurpose,
};

const ACCOUNT: &str = "user@outlook.com";

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

struct Harness {
    dir: TempDir,
    server: MockServer,
    store: CredentialStore,
    clock: Arc<MockClock>,
}

impl Harness {
    async fn new(record: &CredentialRecord, now: i64) -> Self {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("outlook_token.txt"));
        store.persist(record).unwrap();

        Self {
            dir,
            server: MockServer::start().await,
            store,
            clock: MockClock::shared(at(now)),
        }
    }

    fn broker(&self) -> TokenBroker {
        self.broker_with_store(self.store.clone())
    }

    fn broker_with_store(&self, store: CredentialStore) -> TokenBroker {
        let provider = Provider::microsoft()
            .with_token_url(format!("{}/token", self.server.uri()))
            .unwrap()
            .with_identity_url(format!("{}/me", self.server.uri()))
            .unwrap();
        let record = self.store.load().unwrap();

        TokenBroker::new(store, record)
            .unwrap()
            .with_provider(provider)
            .with_clock(Arc::clone(&self.clock))
    }

    async fn mount_token(&self, response: ResponseTemplate, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(response)
            .expect(expected_calls)
            .mount(&self.server)
            .await;
    }

    async fn token_request_bodies(&self) -> Vec<String> {
        self.server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|request| request.url.path() == "/token")
            .map(|request| String::from_utf8(request.body).unwrap())
            .collect()
    }
}

fn stale_record() -> CredentialRecord {
    CredentialRecord::new(ACCOUNT, "old-rt").with_access_token("stale", at(900))
}

fn granted(access: &str, refresh: Option<&str>, expires_in: i64) -> ResponseTemplate {
    let mut body = serde_json::json!({
        "token_type": "Bearer",
        "access_token": access,
        "expires_in": expires_in,
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = serde_json::Value::from(refresh);
    }
    ResponseTemplate::new(200).set_body_json(body)
}

#[tokio::test]
async fn refresh_sets_expiry_with_margin() {
    let harness = Harness::new(&stale_record(), 1000).await;
    harness.mount_token(granted("fresh", None, 3600), 1).await;
    let broker = harness.broker();

    let token = broker
        .get_access_token(TokenPurpose::Graph, false)
        .await
        .unwrap();

    assert_eq!(token, "fresh");
    assert_eq!(broker.snapshot().await.expires_at, Some(at(4300)));
    assert!(broker.is_valid().await);
}

#[tokio::test]
async fn refresh_without_rotation_keeps_refresh_token() {
    let harness = Harness::new(&stale_record(), 1000).await;
    harness.mount_token(granted("fresh", None, 3600), 1).await;

    harness
        .broker()
        .get_access_token(TokenPurpose::Imap, false)
        .await
        .unwrap();

    let persisted = harness.store.load().unwrap();
    assert_eq!(persisted.refresh_token, "old-rt");
    assert_eq!(persisted.access_token, "fresh");
    assert_eq!(persisted.expires_at, Some(at(4300)));
}

#[tokio::test]
async fn rotated_refresh_token_is_persisted() {
    let harness = Harness::new(&stale_record(), 1000).await;
    harness
        .mount_token(granted("fresh", Some("new-rt"), 3600), 1)
        .await;

    harness
        .broker()
        .get_access_token(TokenPurpose::Pop3, false)
        .await
        .unwrap();

    assert_eq!(harness.store.load().unwrap().refresh_token, "new-rt");
}

#[tokio::test]
async fn valid_cached_token_makes_no_request() {
    let record = CredentialRecord::new(ACCOUNT, "rt").with_access_token("cached", at(4300));
    let harness = Harness::new(&record, 1000).await;
    harness.mount_token(granted("fresh", None, 3600), 0).await;

    let token = harness
        .broker()
        .get_access_token(TokenPurpose::Graph, false)
        .await
        .unwrap();

    assert_eq!(token, "cached");
}

#[tokio::test]
async fn empty_cached_token_is_refreshed_even_if_unexpired() {
    let record = CredentialRecord::new(ACCOUNT, "rt").with_access_token("", at(4300));
    let harness = Harness::new(&record, 1000).await;
    harness.mount_token(granted("fresh", None, 3600), 1).await;

    let broker = harness.broker();
    assert!(broker.is_valid().await);
    let token = broker
        .get_access_token(TokenPurpose::Graph, false)
        .await
        .unwrap();

    assert_eq!(token, "fresh");
}

#[tokio::test]
async fn force_refresh_ignores_valid_cache() {
    let record = CredentialRecord::new(ACCOUNT, "rt").with_access_token("cached", at(4300));
    let harness = Harness::new(&record, 1000).await;
    harness.mount_token(granted("forced", None, 3600), 1).await;

    let broker = harness.broker();
    broker.force_refresh(TokenPurpose::Graph).await.unwrap();

    assert_eq!(broker.snapshot().await.access_token, "forced");
    assert_eq!(harness.store.load().unwrap().access_token, "forced");
}

#[tokio::test]
async fn scope_is_sent_only_for_api_tokens() {
    let harness = Harness::new(&stale_record(), 1000).await;
    harness.mount_token(granted("fresh", None, 3600), 2).await;
    let broker = harness.broker();

    broker.force_refresh(TokenPurpose::Graph).await.unwrap();
    broker.force_refresh(TokenPurpose::Imap).await.unwrap();

    let bodies = harness.token_request_bodies().await;
    assert_eq!(bodies.len(), 2);
    assert!(bodies[0].contains("scope=https%3A%2F%2Fgraph.microsoft.com%2F.default"));
    assert!(!bodies[1].contains("scope="));
    for body in &bodies {
        assert!(body.contains("refresh_token=old-rt"));
        assert!(body.contains("client_id=bb2aec70-3c74-48ab-9c37-13d36c32d99f"));
    }
}

#[tokio::test]
async fn rejected_refresh_leaves_cache_untouched() {
    let record = CredentialRecord::new(ACCOUNT, "rt").with_access_token("cached", at(4300));
    let harness = Harness::new(&record, 1000).await;
    harness
        .mount_token(
            ResponseTemplate::new(401).set_body_string(r#"{"error":"invalid_grant"}"#),
            1,
        )
        .await;
    let broker = harness.broker();

    let err = broker.force_refresh(TokenPurpose::Graph).await.unwrap_err();
    match &err {
        AuthError::RefreshRejected { status, body } => {
            assert_eq!(*status, 401);
            assert!(body.contains("invalid_grant"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.requires_reauthorization());

    assert!(broker.is_valid().await);
    assert_eq!(
        broker
            .get_access_token(TokenPurpose::Graph, false)
            .await
            .unwrap(),
        "cached"
    );
    assert_eq!(harness.store.load().unwrap(), record);
}

#[tokio::test]
async fn failure_is_not_sticky() {
    let harness = Harness::new(&stale_record(), 1000).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&harness.server)
        .await;
    harness.mount_token(granted("fresh", None, 3600), 1).await;
    let broker = harness.broker();

    let err = broker
        .get_access_token(TokenPurpose::Graph, false)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::RefreshRejected { status: 503, .. }));

    let token = broker
        .get_access_token(TokenPurpose::Graph, false)
        .await
        .unwrap();
    assert_eq!(token, "fresh");
}

#[tokio::test]
async fn success_without_access_token_is_invalid() {
    let harness = Harness::new(&stale_record(), 1000).await;
    harness
        .mount_token(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"expires_in": 3600})),
            1,
        )
        .await;

    let err = harness
        .broker()
        .get_access_token(TokenPurpose::Graph, false)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidResponse(_)));
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    let harness = Harness::new(&stale_record(), 1000).await;
    let provider = Provider::microsoft()
        .with_token_url("http://127.0.0.1:9/token")
        .unwrap();
    let broker = TokenBroker::new(harness.store.clone(), harness.store.load().unwrap())
        .unwrap()
        .with_provider(provider);

    let err = broker
        .get_access_token(TokenPurpose::Graph, false)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Transport(_)));
}

#[tokio::test]
async fn persist_failure_still_returns_token() {
    let harness = Harness::new(&stale_record(), 1000).await;
    harness.mount_token(granted("fresh", None, 3600), 1).await;
    let unwritable = CredentialStore::new(harness.dir.path().join("missing/outlook_token.txt"));
    let broker = harness.broker_with_store(unwritable);

    let token = broker
        .get_access_token(TokenPurpose::Graph, false)
        .await
        .unwrap();

    assert_eq!(token, "fresh");
    assert!(broker.is_valid().await);
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let harness = Harness::new(&stale_record(), 1000).await;
    harness
        .mount_token(
            granted("shared", Some("new-rt"), 3600)
                .set_delay(std::time::Duration::from_millis(100)),
            1,
        )
        .await;
    let broker = Arc::new(harness.broker());

    let mut callers = JoinSet::new();
    for purpose in [
        TokenPurpose::Graph,
        TokenPurpose::Imap,
        TokenPurpose::Pop3,
        TokenPurpose::Graph,
        TokenPurpose::Imap,
        TokenPurpose::Pop3,
        TokenPurpose::Graph,
        TokenPurpose::Imap,
    ] {
        let broker = Arc::clone(&broker);
        callers.spawn(async move { broker.get_access_token(purpose, false).await });
    }

    let mut tokens = Vec::new();
    while let Some(joined) = callers.join_next().await {
        tokens.push(joined.unwrap().unwrap());
    }

    assert_eq!(tokens.len(), 8);
    assert!(tokens.iter().all(|token| token == "shared"));
    assert_eq!(harness.token_request_bodies().await.len(), 1);
    assert_eq!(harness.store.load().unwrap().refresh_token, "new-rt");
}

#[tokio::test]
async fn validate_against_server_maps_identity() {
    let harness = Harness::new(&stale_record(), 1000).await;
    harness.mount_token(granted("fresh", None, 3600), 1).await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "mail": null,
            "userPrincipalName": ACCOUNT,
            "displayName": "Mail User",
            "id": "00000000-0000-0000-0000-000000000042",
        })))
        .expect(1)
        .mount(&harness.server)
        .await;

    let identity = harness.broker().validate_against_server().await.unwrap();

    assert_eq!(identity.account_email.as_deref(), Some(ACCOUNT));
    assert_eq!(identity.display_name.as_deref(), Some("Mail User"));
    assert_eq!(
        identity.account_id.as_deref(),
        Some("00000000-0000-0000-0000-000000000042")
    );
}

#[tokio::test]
async fn validate_against_server_rejected() {
    let record = CredentialRecord::new(ACCOUNT, "rt").with_access_token("cached", at(4300));
    let harness = Harness::new(&record, 1000).await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .respond_with(ResponseTemplate::new(403).set_body_string("Forbidden"))
        .mount(&harness.server)
        .await;

    let err = harness
        .broker()
        .validate_against_server()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AuthError::IdentityRejected { status: 403, ref body } if body == "Forbidden"
    ));
}
