//! Project context resolution.
//!
//! Every rewritten call needs a cloud project id. Resolution order: the
//! explicit configured override, then ids already on the credential, then a
//! `loadCodeAssist` call, then free-tier onboarding. Results are cached per
//! (refresh token, override) and concurrent resolutions for the same key
//! coalesce onto one network flight, mirroring the refresh coordinator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::constants::{
    internal_action_path, CLIENT_METADATA, FREE_TIER_ID, ONBOARD_POLL_ATTEMPTS,
    ONBOARD_POLL_INTERVAL,
};
use crate::credentials::{AuthStore, CredentialRecord};
use crate::error::{Error, Result};

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadResponse {
    #[serde(default)]
    cloudaicompanion_project: Option<String>,
    #[serde(default)]
    current_tier: Option<Tier>,
    #[serde(default)]
    allowed_tiers: Vec<Tier>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Tier {
    id: String,
    #[serde(default)]
    is_default: bool,
    /// The tier requires a user-supplied cloud project.
    #[serde(default)]
    user_defined_cloudaicompanion_project: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnboardOperation {
    #[serde(default)]
    done: bool,
    #[serde(default)]
    response: Option<OnboardResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnboardResult {
    #[serde(default)]
    cloudaicompanion_project: Option<ProjectRef>,
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    id: String,
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves and caches the effective project id for a credential.
pub struct ProjectResolver {
    http: reqwest::Client,
    endpoint: String,
    /// Explicitly configured project override, from [`GateConfig`](crate::GateConfig).
    explicit: Option<String>,
    poll_interval: Duration,
    cache: Mutex<HashMap<String, String>>,
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProjectResolver {
    /// Create a resolver for the given backend endpoint.
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, explicit: Option<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            explicit,
            poll_interval: ONBOARD_POLL_INTERVAL,
            cache: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Override the onboarding poll interval (useful for testing).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn cache_key(&self, record: &CredentialRecord) -> String {
        format!(
            "{}::{}",
            record.refresh_token,
            self.explicit.as_deref().unwrap_or("")
        )
    }

    fn cached(&self, key: &str) -> Option<String> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(key).cloned()
    }

    fn remember(&self, key: &str, project: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(key.to_string(), project.to_string());
    }

    fn flight_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        flights
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the flight entry once no other caller holds or awaits it.
    fn release_flight(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map's own reference left means no waiter remains.
        if flights.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            flights.remove(key);
        }
    }

    #[cfg(test)]
    fn flight_count(&self) -> usize {
        self.flights.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Project id without touching the network, if one is already known.
    fn local(&self, record: &CredentialRecord) -> Option<String> {
        self.explicit
            .clone()
            .or_else(|| record.project_id.clone())
            .or_else(|| record.managed_project_id.clone())
    }

    /// Resolve the effective project id for a credential.
    ///
    /// `access_token` must already be valid; the resolver never refreshes.
    /// A discovered managed project is persisted back through `store`.
    #[instrument(skip_all)]
    pub async fn resolve(
        &self,
        store: &dyn AuthStore,
        record: &CredentialRecord,
        access_token: &str,
    ) -> Result<String> {
        if let Some(project) = self.local(record) {
            return Ok(project);
        }
        let key = self.cache_key(record);
        if let Some(project) = self.cached(&key) {
            return Ok(project);
        }

        let lock = self.flight_lock(&key);
        let resolved = {
            let _flight = lock.lock().await;
            match self.cached(&key) {
                Some(project) => Ok((project, false)),
                None => self.resolve_remote(access_token).await.map(|project| {
                    self.remember(&key, &project);
                    (project, true)
                }),
            }
        };
        self.release_flight(&key, lock);
        let (project, fresh) = resolved?;
        if !fresh {
            return Ok(project);
        }

        let mut updated = record.clone();
        updated.managed_project_id = Some(project.clone());
        store.set_credential(&updated).await?;

        Ok(project)
    }

    async fn post_internal(
        &self,
        access_token: &str,
        action: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.endpoint, internal_action_path(action, false));
        Ok(self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(body)
            .send()
            .await?)
    }

    async fn resolve_remote(&self, access_token: &str) -> Result<String> {
        let metadata: serde_json::Value = serde_json::from_str(CLIENT_METADATA)?;
        let body = json!({ "metadata": metadata });

        debug!("loading code assist profile");
        let response = self.post_internal(access_token, "loadCodeAssist", &body).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 403
                && (text.contains("SECURITY_POLICY_VIOLATED") || text.contains("VPC Service Controls"))
            {
                // VPC-SC blocks discovery; the account behaves as a standard
                // tier and must bring its own project.
                warn!("load blocked by VPC service controls");
                return Err(Error::ProjectIdRequired);
            }
            return Err(Error::ProjectResolve {
                status: status.as_u16(),
                message: text,
            });
        }

        let load: LoadResponse = response.json().await?;
        if let Some(project) = load.cloudaicompanion_project {
            debug!(project = %project, "managed project already assigned");
            return Ok(project);
        }

        if let Some(tier) = load.current_tier {
            if tier.user_defined_cloudaicompanion_project {
                return Err(Error::ProjectIdRequired);
            }
            // Tier already assigned but no project yet: onboard onto it.
            return self.onboard(access_token, &tier.id, &metadata).await;
        }

        // No current tier: pick the default (or first) allowed tier. Anything
        // beyond the free tier needs a user-supplied project.
        let mut tiers = load.allowed_tiers;
        let tier_id = if tiers.is_empty() {
            FREE_TIER_ID.to_string()
        } else {
            let default_pos = tiers.iter().position(|t| t.is_default).unwrap_or(0);
            let tier = tiers.swap_remove(default_pos);
            if tier.user_defined_cloudaicompanion_project || tier.id != FREE_TIER_ID {
                return Err(Error::ProjectIdRequired);
            }
            tier.id
        };

        self.onboard(access_token, &tier_id, &metadata).await
    }

    /// Onboard the user onto a managed project and poll until it exists.
    async fn onboard(
        &self,
        access_token: &str,
        tier_id: &str,
        metadata: &serde_json::Value,
    ) -> Result<String> {
        let body = json!({
            "tierId": tier_id,
            "metadata": metadata,
        });

        debug!(tier = %tier_id, "onboarding user");
        for attempt in 0..ONBOARD_POLL_ATTEMPTS {
            let response = self.post_internal(access_token, "onboardUser", &body).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::ProjectResolve {
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
            }

            let operation: OnboardOperation = response.json().await?;
            if operation.done {
                let project = operation
                    .response
                    .and_then(|r| r.cloudaicompanion_project)
                    .map(|p| p.id)
                    .ok_or_else(|| Error::ProjectResolve {
                        status: status.as_u16(),
                        message: "onboarding finished without a project id".to_string(),
                    })?;
                debug!(project = %project, "onboarding complete");
                return Ok(project);
            }

            debug!(attempt, "onboarding pending");
            tokio::time::sleep(self.poll_interval).await;
        }

        Err(Error::ProjectResolve {
            status: 504,
            message: "onboarding did not complete in time".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryAuthStore;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resolver(endpoint: &str, explicit: Option<&str>) -> ProjectResolver {
        ProjectResolver::new(
            reqwest::Client::new(),
            endpoint,
            explicit.map(str::to_string),
        )
        .with_poll_interval(Duration::from_millis(10))
    }

    fn record() -> CredentialRecord {
        CredentialRecord::new("rt-1").with_access_token("at-1".into(), 3600)
    }

    #[tokio::test]
    async fn test_explicit_override_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let resolver = resolver(&server.uri(), Some("explicit-project"));
        let store = MemoryAuthStore::new();
        let project = resolver.resolve(&store, &record(), "at-1").await.unwrap();
        assert_eq!(project, "explicit-project");
    }

    #[tokio::test]
    async fn test_credential_managed_id_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let mut rec = record();
        rec.managed_project_id = Some("managed-cached".into());
        let resolver = resolver(&server.uri(), None);
        let store = MemoryAuthStore::new();
        let project = resolver.resolve(&store, &rec, "at-1").await.unwrap();
        assert_eq!(project, "managed-cached");
    }

    #[tokio::test]
    async fn test_load_returns_managed_project() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:loadCodeAssist"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "cloudaicompanionProject": "proj-managed",
                "currentTier": {"id": "standard-tier"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = resolver(&server.uri(), None);
        let store = MemoryAuthStore::with_credential(record());

        let project = resolver.resolve(&store, &record(), "at-1").await.unwrap();
        assert_eq!(project, "proj-managed");

        // Persisted onto the credential.
        let persisted = store.get_credential().await.unwrap().unwrap();
        assert_eq!(persisted.managed_project_id.as_deref(), Some("proj-managed"));

        // Second resolution is served from the cache (mock expects one call).
        let again = resolver.resolve(&store, &record(), "at-1").await.unwrap();
        assert_eq!(again, "proj-managed");
    }

    #[tokio::test]
    async fn test_free_tier_onboards() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:loadCodeAssist"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "allowedTiers": [
                    {"id": "free-tier", "isDefault": true}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1internal:onboardUser"))
            .and(body_string_contains("free-tier"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "operations/onboard-1",
                "done": true,
                "response": {"cloudaicompanionProject": {"id": "proj-onboarded"}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = resolver(&server.uri(), None);
        let store = MemoryAuthStore::with_credential(record());
        let project = resolver.resolve(&store, &record(), "at-1").await.unwrap();
        assert_eq!(project, "proj-onboarded");
    }

    #[tokio::test]
    async fn test_onboarding_polls_until_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:loadCodeAssist"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1internal:onboardUser"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "operations/onboard-1",
                "done": false
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1internal:onboardUser"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "done": true,
                "response": {"cloudaicompanionProject": {"id": "proj-late"}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = resolver(&server.uri(), None);
        let store = MemoryAuthStore::with_credential(record());
        let project = resolver.resolve(&store, &record(), "at-1").await.unwrap();
        assert_eq!(project, "proj-late");
    }

    #[tokio::test]
    async fn test_paid_tier_without_project_requires_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:loadCodeAssist"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "currentTier": {
                    "id": "standard-tier",
                    "userDefinedCloudaicompanionProject": true
                }
            })))
            .mount(&server)
            .await;

        let resolver = resolver(&server.uri(), None);
        let store = MemoryAuthStore::with_credential(record());
        let err = resolver.resolve(&store, &record(), "at-1").await.unwrap_err();
        assert!(matches!(err, Error::ProjectIdRequired));
    }

    #[tokio::test]
    async fn test_non_free_default_tier_requires_project() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:loadCodeAssist"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "allowedTiers": [
                    {"id": "free-tier"},
                    {"id": "standard-tier", "isDefault": true}
                ]
            })))
            .mount(&server)
            .await;

        let resolver = resolver(&server.uri(), None);
        let store = MemoryAuthStore::with_credential(record());
        let err = resolver.resolve(&store, &record(), "at-1").await.unwrap_err();
        assert!(matches!(err, Error::ProjectIdRequired));
    }

    #[tokio::test]
    async fn test_vpc_service_controls_requires_project() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:loadCodeAssist"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": {
                    "code": 403,
                    "message": "Request is prohibited by organization's policy",
                    "details": [{"violations": [{"type": "VPC_SERVICE_CONTROLS"}]}],
                    "status": "PERMISSION_DENIED",
                    "reason": "SECURITY_POLICY_VIOLATED"
                }
            })))
            .mount(&server)
            .await;

        let resolver = resolver(&server.uri(), None);
        let store = MemoryAuthStore::with_credential(record());
        let err = resolver.resolve(&store, &record(), "at-1").await.unwrap_err();
        assert!(matches!(err, Error::ProjectIdRequired));
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:loadCodeAssist"))
            .respond_with(ResponseTemplate::new(500).set_body_string("backend down"))
            .mount(&server)
            .await;

        let resolver = resolver(&server.uri(), None);
        let store = MemoryAuthStore::with_credential(record());
        let err = resolver.resolve(&store, &record(), "at-1").await.unwrap_err();
        match err {
            Error::ProjectResolve { status, message } => {
                assert_eq!(status, 500);
                assert!(message.contains("backend down"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_coalesce() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:loadCodeAssist"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(50))
                    .set_body_json(serde_json::json!({
                        "cloudaicompanionProject": "proj-shared"
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let resolver = Arc::new(resolver(&server.uri(), None));
        let store = MemoryAuthStore::with_credential(record());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let resolver = resolver.clone();
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                resolver.resolve(&store, &record(), "at-1").await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "proj-shared");
        }

        // The flight entries are gone once the last caller finishes.
        assert_eq!(resolver.flight_count(), 0);
    }
}
