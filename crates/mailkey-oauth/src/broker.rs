//! Token broker: the single owner of the refresh path.
//!
//! Every protocol client asks the broker for a bearer token. The broker
//! serves the cached token while it is unexpired and otherwise performs one
//! refresh-token grant, persists the result through the [`CredentialStore`]
//! and hands the new token out.
//!
//! The check, refresh and persist steps run under one async mutex, so callers
//! racing on a stale token trigger a single refresh and all observe the
//! token it produced.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{AuthError, AuthResult};
use crate::provider::Provider;
use crate::record::CredentialRecord;
use crate::store::CredentialStore;
use crate::time::{Clock, SystemClock};
use crate::token::{IdentityInfo, IdentityResponse, IssuedToken, TokenPurpose, TokenResponse};

/// Upper bound on every HTTP request the broker makes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Hands out valid access tokens, refreshing them when needed.
pub struct TokenBroker {
    store: CredentialStore,
    provider: Provider,
    http_client: Client,
    clock: Arc<dyn Clock>,
    account_id: String,
    state: Mutex<CredentialRecord>,
}

impl std::fmt::Debug for TokenBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBroker")
            .field("store", &self.store)
            .field("provider", &self.provider)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

impl TokenBroker {
    /// Creates a broker over a record already loaded from `store`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Transport`] if the HTTP client cannot be built.
    pub fn new(store: CredentialStore, record: CredentialRecord) -> AuthResult<Self> {
        let http_client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            store,
            provider: Provider::microsoft(),
            http_client,
            clock: Arc::new(SystemClock),
            account_id: record.account_id.clone(),
            state: Mutex::new(record),
        })
    }

    /// Replaces the endpoint set.
    #[must_use]
    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Mailbox address the tokens belong to.
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Copy of the current record, for diagnostics.
    pub async fn snapshot(&self) -> CredentialRecord {
        self.state.lock().await.clone()
    }

    /// Returns true iff the cached expiry is set and strictly in the future.
    ///
    /// This looks at the expiry only; an empty token with a future expiry is
    /// still "valid" here. [`get_access_token`](Self::get_access_token)
    /// additionally requires a non-empty token before serving from cache.
    pub async fn is_valid(&self) -> bool {
        self.state.lock().await.is_unexpired_at(self.clock.now())
    }

    /// Returns a usable access token for `purpose`.
    ///
    /// Serves the cached token unless it is expired, empty, or
    /// `force_refresh` is set; otherwise refreshes against the token endpoint.
    /// A failure to persist the refreshed record is logged and does not fail
    /// the call.
    ///
    /// # Errors
    ///
    /// - [`AuthError::RefreshRejected`] if the server answered with a non-200 status
    /// - [`AuthError::Transport`] if no response was received
    /// - [`AuthError::InvalidResponse`] if a 200 response lacks an access token
    pub async fn get_access_token(
        &self,
        purpose: TokenPurpose,
        force_refresh: bool,
    ) -> AuthResult<String> {
        let mut record = self.state.lock().await;

        if !force_refresh
            && record.is_unexpired_at(self.clock.now())
            && !record.access_token.is_empty()
        {
            debug!(
                %purpose,
                token_len = record.access_token.len(),
                expires_at = ?record.expires_at,
                "Using cached access token"
            );
            return Ok(record.access_token.clone());
        }

        info!(%purpose, forced = force_refresh, "Requesting access token");
        let issued = self.request_token(&record, purpose).await?;

        let rotated = issued
            .refresh_token
            .as_ref()
            .is_some_and(|token| *token != record.refresh_token);
        record.apply(&issued);

        if let Err(e) = self.store.persist(&record) {
            error!(
                path = %self.store.path().display(),
                "Refreshed token was not persisted: {e}"
            );
        }

        info!(
            %purpose,
            refresh_token_rotated = rotated,
            token_len = issued.access_token.len(),
            expires_at = %issued.expires_at,
            "Access token refreshed"
        );
        Ok(issued.access_token)
    }

    /// Refreshes unconditionally, discarding the token.
    ///
    /// # Errors
    ///
    /// Same as [`get_access_token`](Self::get_access_token).
    pub async fn force_refresh(&self, purpose: TokenPurpose) -> AuthResult<()> {
        info!(%purpose, "Forcing access token refresh");
        self.get_access_token(purpose, true).await.map(drop)
    }

    /// Exercises the refresh token, client id and scope end to end by reading
    /// the identity of the token's owner.
    ///
    /// # Errors
    ///
    /// Any [`get_access_token`](Self::get_access_token) error, or
    /// [`AuthError::IdentityRejected`] if the identity endpoint refuses the token.
    pub async fn validate_against_server(&self) -> AuthResult<IdentityInfo> {
        let token = self.get_access_token(TokenPurpose::Graph, false).await?;

        let response = self
            .http_client
            .get(self.provider.identity_url.clone())
            .bearer_auth(&token)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Identity check rejected: {body}");
            return Err(AuthError::IdentityRejected {
                status: status.as_u16(),
                body,
            });
        }

        let identity: IdentityResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("identity response: {e}")))?;
        let info = IdentityInfo::from(identity);

        info!(account = ?info.account_email, "Access token verified against identity endpoint");
        Ok(info)
    }

    async fn request_token(
        &self,
        record: &CredentialRecord,
        purpose: TokenPurpose,
    ) -> AuthResult<IssuedToken> {
        let mut params = vec![
            ("client_id", record.client_id.as_str()),
            ("refresh_token", record.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        if purpose.requires_scope() {
            params.push(("scope", self.provider.api_scope.as_str()));
        }

        let response = self
            .http_client
            .post(self.provider.token_url.clone())
            .form(&params)
            .send()
            .await
            .inspect_err(|e| warn!(%purpose, "Token request failed: {e}"))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!(%purpose, status = status.as_u16(), "Token refresh rejected: {body}");
            return Err(AuthError::RefreshRejected {
                status: status.as_u16(),
                body,
            });
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        token_response.into_issued(self.clock.now())
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
    use crate::time::MockClock;
    use chrono::{TimeZone, Utc};

    fn broker_at(now: i64, record: CredentialRecord) -> (Arc<MockClock>, TokenBroker) {
        let clock = MockClock::shared(Utc.timestamp_opt(now, 0).unwrap());
        let store = CredentialStore::new("/nonexistent/outlook_token.txt");
        let broker = TokenBroker::new(store, record)
            .unwrap()
            .with_clock(Arc::clone(&clock));
        (clock, broker)
    }

    fn record_expiring_at(secs: i64) -> CredentialRecord {
        CredentialRecord::new("user@outlook.com", "rt")
            .with_access_token("cached", Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[tokio::test]
    async fn test_is_valid_is_strict() {
        let (clock, broker) = broker_at(4299, record_expiring_at(4300));
        assert!(broker.is_valid().await);

        clock.set(Utc.timestamp_opt(4300, 0).unwrap());
        assert!(!broker.is_valid().await);

        clock.set(Utc.timestamp_opt(4301, 0).unwrap());
        assert!(!broker.is_valid().await);
    }

    #[tokio::test]
    async fn test_is_valid_without_expiry() {
        let (_clock, broker) = broker_at(0, CredentialRecord::new("user@outlook.com", "rt"));
        assert!(!broker.is_valid().await);
    }

    #[tokio::test]
    async fn test_is_valid_ignores_empty_token() {
        let record = CredentialRecord::new("user@outlook.com", "rt")
            .with_access_token("", Utc.timestamp_opt(5000, 0).unwrap());
        let (_clock, broker) = broker_at(1000, record);
        assert!(broker.is_valid().await);
    }

    #[tokio::test]
    async fn test_cached_token_served_without_network() {
        // The provider points at the real endpoint; a network call would fail the test.
        let (_clock, broker) = broker_at(1000, record_expiring_at(4300));
        let token = broker
            .get_access_token(TokenPurpose::Imap, false)
            .await
            .unwrap();
        assert_eq!(token, "cached");
    }

    #[tokio::test]
    async fn test_account_id() {
        let (_clock, broker) = broker_at(0, record_expiring_at(0));
        assert_eq!(broker.account_id(), "user@outlook.com");
        assert_eq!(broker.snapshot().await.refresh_token, "rt");
    }
}
