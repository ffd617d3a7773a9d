//! Token refresh coordination.
//!
//! [`RefreshCoordinator::fresh_credential`] is the single entry point the
//! pipeline uses to obtain a usable access token. Concurrent callers holding
//! the same refresh token coalesce onto one network exchange: a per-token
//! flight lock serializes refreshes, and the winner's result is visible to
//! the losers through the token cache before they reach the network.
//!
//! Refresh token rotation is persisted immediately. An `invalid_grant`
//! response clears the stored refresh token so the caller sees a clean
//! "re-login required" signal instead of an endless retry loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, instrument, warn};

use crate::config::OAuthSettings;
use crate::constants::{EXPIRY_SAFETY_MARGIN_SECS, MAX_ATTEMPTS};
use crate::credentials::{mask_token, AuthStore, CredentialRecord};
use crate::error::{Error, Result};
use crate::retry::{backoff_delay, delay_from_headers};

use super::oauth::{TokenErrorResponse, TokenResponse};

/// A cached access token keyed by the refresh token that minted it.
#[derive(Debug, Clone)]
struct CachedAccess {
    access_token: String,
    expires_at: i64,
}

impl CachedAccess {
    fn is_valid(&self) -> bool {
        self.expires_at > chrono::Utc::now().timestamp() + EXPIRY_SAFETY_MARGIN_SECS
    }
}

/// Coordinates token refreshes for one gate instance.
pub struct RefreshCoordinator {
    http: reqwest::Client,
    oauth: OAuthSettings,
    /// One flight lock per refresh token.
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Access tokens minted by completed flights.
    cache: Mutex<HashMap<String, CachedAccess>>,
}

impl RefreshCoordinator {
    /// Create a coordinator using the given HTTP client and OAuth settings.
    pub fn new(http: reqwest::Client, oauth: OAuthSettings) -> Self {
        Self {
            http,
            oauth,
            flights: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn flight_lock(&self, refresh_token: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        flights
            .entry(refresh_token.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the flight entry once no other caller holds or awaits it,
    /// so rotated-away refresh tokens do not leave stale locks behind.
    fn release_flight(&self, refresh_token: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map's own reference left means no waiter remains.
        if flights
            .get(refresh_token)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            flights.remove(refresh_token);
        }
    }

    #[cfg(test)]
    fn flight_count(&self) -> usize {
        self.flights.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn cached(&self, refresh_token: &str) -> Option<CachedAccess> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(refresh_token).filter(|c| c.is_valid()).cloned()
    }

    fn remember(&self, refresh_token: &str, access: CachedAccess) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(refresh_token.to_string(), access);
    }

    fn forget(&self, refresh_token: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(refresh_token);
    }

    /// Return a credential whose access token is valid for at least the
    /// safety margin, refreshing it if needed.
    ///
    /// Fails with [`Error::MissingRefreshToken`] when the store holds no
    /// refresh token, and [`Error::TokenRevoked`] when the authorization
    /// server reports `invalid_grant` (the stored credential is cleared
    /// before the error is returned).
    #[instrument(skip_all)]
    pub async fn fresh_credential(&self, store: &dyn AuthStore) -> Result<CredentialRecord> {
        let record = store
            .get_credential()
            .await?
            .ok_or(Error::MissingRefreshToken)?;
        if record.refresh_token.is_empty() {
            return Err(Error::MissingRefreshToken);
        }

        if record.has_valid_access_token() {
            return Ok(record);
        }
        if let Some(cached) = self.cached(&record.refresh_token) {
            let mut fresh = record;
            fresh.access_token = Some(cached.access_token);
            fresh.expires_at = Some(cached.expires_at);
            return Ok(fresh);
        }

        let key = record.refresh_token.clone();
        let lock = self.flight_lock(&key);
        let result = {
            let _flight = lock.lock().await;
            self.refresh_locked(store).await
        };
        self.release_flight(&key, lock);
        result
    }

    /// The refresh path proper, entered with the flight lock held.
    async fn refresh_locked(&self, store: &dyn AuthStore) -> Result<CredentialRecord> {
        // Re-check after acquiring: a concurrent flight may have finished.
        let record = store
            .get_credential()
            .await?
            .ok_or(Error::MissingRefreshToken)?;
        if record.refresh_token.is_empty() {
            return Err(Error::MissingRefreshToken);
        }
        if record.has_valid_access_token() {
            return Ok(record);
        }
        if let Some(cached) = self.cached(&record.refresh_token) {
            let mut fresh = record;
            fresh.access_token = Some(cached.access_token);
            fresh.expires_at = Some(cached.expires_at);
            return Ok(fresh);
        }

        debug!(token = %mask_token(&record.refresh_token), "refreshing access token");
        let token = match self.exchange_refresh_token(&record.refresh_token).await {
            Ok(token) => token,
            Err(Error::TokenRevoked) => {
                warn!("refresh token revoked, clearing stored credential");
                self.forget(&record.refresh_token);
                store.set_credential(&record.revoked()).await?;
                return Err(Error::TokenRevoked);
            }
            Err(e) => return Err(e),
        };

        let mut fresh = record;
        let mut rotated = false;
        if let Some(new_token) = token.refresh_token {
            if new_token != fresh.refresh_token {
                debug!("refresh token rotated");
                self.forget(&fresh.refresh_token);
                fresh.refresh_token = new_token;
                rotated = true;
            }
        }
        fresh = fresh.with_access_token(token.access_token.clone(), token.expires_in);
        // Unchanged refresh tokens are not written back; the token cache
        // carries the access token and the store avoids churn.
        if rotated {
            store.set_credential(&fresh).await?;
        }
        self.remember(
            &fresh.refresh_token,
            CachedAccess {
                access_token: token.access_token,
                expires_at: fresh.expires_at.unwrap_or_default(),
            },
        );

        Ok(fresh)
    }

    /// Perform the refresh-token grant with bounded retries.
    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenResponse> {
        for attempt in 0..MAX_ATTEMPTS {
            let last = attempt + 1 == MAX_ATTEMPTS;

            let form = [
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
            ];
            let response = match self
                .http
                .post(&self.oauth.token_url)
                .form(&form)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    let err = Error::from(e);
                    if err.is_transient() && !last {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response.json::<TokenResponse>().await?);
            }

            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();

            if let Ok(err) = serde_json::from_str::<TokenErrorResponse>(&body) {
                if err.error == "invalid_grant" {
                    return Err(Error::TokenRevoked);
                }
            }

            if (status.is_server_error() || status.as_u16() == 429) && !last {
                let delay = delay_from_headers(&headers).unwrap_or_else(|| backoff_delay(attempt));
                warn!(attempt, status = status.as_u16(),
                    delay_ms = delay.as_millis() as u64, "token refresh failed, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }

            return Err(Error::RefreshFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        unreachable!("refresh loop returns on the final attempt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryAuthStore;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn coordinator(token_url: &str) -> RefreshCoordinator {
        let oauth = OAuthSettings {
            token_url: token_url.to_string(),
            ..OAuthSettings::default()
        };
        RefreshCoordinator::new(reqwest::Client::new(), oauth)
    }

    fn token_body(access: &str) -> serde_json::Value {
        serde_json::json!({
            "access_token": access,
            "expires_in": 3600
        })
    }

    #[tokio::test]
    async fn test_valid_token_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let store = MemoryAuthStore::with_credential(
            CredentialRecord::new("rt-1").with_access_token("at-valid".into(), 3600),
        );
        let coord = coordinator(&format!("{}/token", server.uri()));

        let record = coord.fresh_credential(&store).await.unwrap();
        assert_eq!(record.access_token.as_deref(), Some("at-valid"));
    }

    #[tokio::test]
    async fn test_expired_token_refreshed_via_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-new")))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryAuthStore::with_credential(
            CredentialRecord::new("rt-1").with_access_token("at-old".into(), -100),
        );
        let coord = coordinator(&format!("{}/token", server.uri()));

        let record = coord.fresh_credential(&store).await.unwrap();
        assert_eq!(record.access_token.as_deref(), Some("at-new"));
        assert!(record.has_valid_access_token());

        // No rotation: the store is left untouched and the token cache
        // serves the second call (the mock expects exactly one exchange).
        let persisted = store.get_credential().await.unwrap().unwrap();
        assert_eq!(persisted.refresh_token, "rt-1");
        assert_eq!(persisted.access_token.as_deref(), Some("at-old"));

        let again = coord.fresh_credential(&store).await.unwrap();
        assert_eq!(again.access_token.as_deref(), Some("at-new"));
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_persisted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-new",
                "refresh_token": "rt-rotated",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let store = MemoryAuthStore::with_credential(CredentialRecord::new("rt-1"));
        let coord = coordinator(&format!("{}/token", server.uri()));

        let record = coord.fresh_credential(&store).await.unwrap();
        assert_eq!(record.refresh_token, "rt-rotated");

        let persisted = store.get_credential().await.unwrap().unwrap();
        assert_eq!(persisted.refresh_token, "rt-rotated");
    }

    #[tokio::test]
    async fn test_invalid_grant_revokes_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryAuthStore::with_credential(CredentialRecord::new("rt-1"));
        let coord = coordinator(&format!("{}/token", server.uri()));

        let err = coord.fresh_credential(&store).await.unwrap_err();
        assert!(matches!(err, Error::TokenRevoked));

        // The stored credential now signals "re-login required".
        let persisted = store.get_credential().await.unwrap().unwrap();
        assert!(persisted.refresh_token.is_empty());

        let err = coord.fresh_credential(&store).await.unwrap_err();
        assert!(matches!(err, Error::MissingRefreshToken));
    }

    #[tokio::test]
    async fn test_missing_credential_errors() {
        let store = MemoryAuthStore::new();
        let coord = coordinator("http://localhost:1/token");
        let err = coord.fresh_credential(&store).await.unwrap_err();
        assert!(matches!(err, Error::MissingRefreshToken));
    }

    #[tokio::test]
    async fn test_non_revocation_failure_is_refresh_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_request"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryAuthStore::with_credential(CredentialRecord::new("rt-1"));
        let coord = coordinator(&format!("{}/token", server.uri()));

        let err = coord.fresh_credential(&store).await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)));

        // The refresh token survives a non-revocation failure.
        let persisted = store.get_credential().await.unwrap().unwrap();
        assert_eq!(persisted.refresh_token, "rt-1");
    }

    #[tokio::test]
    async fn test_server_error_retried_with_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(503).insert_header("x-retry-after-ms", "10"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-new")))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryAuthStore::with_credential(CredentialRecord::new("rt-1"));
        let coord = coordinator(&format!("{}/token", server.uri()));

        let record = coord.fresh_credential(&store).await.unwrap();
        assert_eq!(record.access_token.as_deref(), Some("at-new"));
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_coalesce() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-shared")))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryAuthStore::with_credential(CredentialRecord::new("rt-1"));
        let coord = Arc::new(coordinator(&format!("{}/token", server.uri())));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coord = coord.clone();
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                coord.fresh_credential(&store).await
            }));
        }

        for handle in handles {
            let record = handle.await.unwrap().unwrap();
            assert_eq!(record.access_token.as_deref(), Some("at-shared"));
        }

        // The flight entries are gone once the last caller finishes.
        assert_eq!(coord.flight_count(), 0);
    }

    #[tokio::test]
    async fn test_flight_entry_released_after_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-new")))
            .mount(&server)
            .await;

        let store = MemoryAuthStore::with_credential(
            CredentialRecord::new("rt-1").with_access_token("at-old".into(), -100),
        );
        let coord = coordinator(&format!("{}/token", server.uri()));

        coord.fresh_credential(&store).await.unwrap();
        assert_eq!(coord.flight_count(), 0);
    }
}
