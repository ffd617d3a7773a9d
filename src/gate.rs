//! Gate activation and the per-call fetch pipeline.
//!
//! [`CodeAssistGate::activate`] is called once per provider activation and
//! wires together the refresh coordinator, project resolver, retry engine,
//! and a process-lifetime session id. [`CodeAssistGate::fetch`] is the
//! wrapped per-call entry point: calls aimed at the public surface are
//! rewritten onto the internal backend; everything else is sent exactly once
//! and returned untouched.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, TRANSFER_ENCODING};
use reqwest::{Method, StatusCode};
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::auth::{build_authorize_url, exchange_code, CodeReplayGuard, Pkce, RefreshCoordinator};
use crate::config::GateConfig;
use crate::constants::{CONNECT_TIMEOUT, REQUEST_TIMEOUT};
use crate::credentials::AuthStore;
use crate::error::{Error, Result};
use crate::project::ProjectResolver;
use crate::retry::{RetryEngine, SendOutcome, ThrottleKey};
use crate::transform::{self, enhance, SseRewriteStream};

/// Boxed byte stream for streaming response bodies.
pub type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// An outbound call intercepted by the gate.
#[derive(Debug)]
pub struct OutboundCall {
    /// HTTP method.
    pub method: Method,
    /// Full target URL as the caller issued it.
    pub url: String,
    /// Headers as the caller issued them.
    pub headers: HeaderMap,
    /// Request body, if any.
    pub body: Option<Bytes>,
}

impl OutboundCall {
    /// Convenience constructor for a JSON POST.
    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Some(body.into()),
        }
    }
}

/// Body of a [`GateResponse`].
pub enum ResponseBody {
    /// Fully buffered body.
    Buffered(Bytes),
    /// Live byte stream (SSE or pass-through).
    Stream(ByteStream),
}

impl ResponseBody {
    /// Collect the body into memory, draining a stream if necessary.
    pub async fn collect(self) -> Result<Bytes> {
        match self {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Stream(mut stream) => {
                use futures::StreamExt;
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            ResponseBody::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// Response returned by [`CodeAssistGate::fetch`].
#[derive(Debug)]
pub struct GateResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers, including any usage counters or retry hints the
    /// gate added.
    pub headers: HeaderMap,
    /// Response body.
    pub body: ResponseBody,
}

/// The request/response translation layer.
pub struct CodeAssistGate {
    http: reqwest::Client,
    config: GateConfig,
    store: Arc<dyn AuthStore>,
    refresh: RefreshCoordinator,
    resolver: ProjectResolver,
    retry: RetryEngine,
    replay_guard: CodeReplayGuard,
    /// Process-lifetime session id, attached to requests lacking their own.
    session_id: String,
}

impl CodeAssistGate {
    /// Activate the gate for a credential store.
    pub fn activate(config: GateConfig, store: Arc<dyn AuthStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        let refresh = RefreshCoordinator::new(http.clone(), config.oauth.clone());
        let resolver = ProjectResolver::new(
            http.clone(),
            config.endpoint.clone(),
            config.project_id.clone(),
        );
        let retry = RetryEngine::new(config.capacity_cooldown());

        Ok(Self {
            http,
            config,
            store,
            refresh,
            resolver,
            retry,
            replay_guard: CodeReplayGuard::new(),
            session_id: Uuid::new_v4().to_string(),
        })
    }

    /// Build the authorization URL for the interactive login flow.
    pub fn authorize_url(&self, pkce: &Pkce, state: &str) -> String {
        build_authorize_url(&self.config.oauth, pkce, state)
    }

    /// Complete the login flow by exchanging the authorization code, and
    /// persist the resulting credential.
    pub async fn complete_login(&self, code: &str, verifier: &str) -> Result<()> {
        let record = exchange_code(
            &self.http,
            &self.config.oauth,
            &self.replay_guard,
            code,
            verifier,
        )
        .await?;
        self.store.set_credential(&record).await
    }

    /// The per-call entry point.
    #[instrument(skip_all, fields(url = %call.url))]
    pub async fn fetch(&self, call: OutboundCall) -> Result<GateResponse> {
        let url = Url::parse(&call.url)
            .map_err(|e| Error::config(format!("invalid outbound url: {}", e)))?;

        let Some(target) = transform::detect_target(&url, &self.config.public_host) else {
            return self.pass_through(call).await;
        };
        debug!(model = %target.model, action = %target.action, "rewriting public-surface call");

        let credential = self.refresh.fresh_credential(self.store.as_ref()).await?;
        let token = credential
            .access_token
            .clone()
            .ok_or_else(|| Error::RefreshFailed("refresh produced no access token".into()))?;
        let project = self
            .resolver
            .resolve(self.store.as_ref(), &credential, &token)
            .await?;

        let body: serde_json::Value = match call.body.as_deref() {
            None | Some(b"") => serde_json::json!({}),
            Some(raw) => serde_json::from_slice(raw)?,
        };
        let prepared = transform::prepare(
            &target,
            &call.headers,
            body,
            &self.config.endpoint,
            &project,
            &token,
            &self.session_id,
        )?;

        let key = ThrottleKey::new(&self.config.endpoint, &project, &prepared.effective_model);
        let outcome = self
            .retry
            .execute(&key, || {
                let mut request = self
                    .http
                    .post(&prepared.url)
                    .headers(prepared.headers.clone())
                    .json(&prepared.body);
                if !prepared.streaming {
                    request = request.timeout(REQUEST_TIMEOUT);
                }
                request.send()
            })
            .await?;

        match outcome {
            SendOutcome::Success(response) => {
                self.success_response(response, prepared.streaming).await
            }
            SendOutcome::Failed {
                status,
                headers,
                body,
            } => Ok(failure_response(
                status,
                headers,
                &body,
                &prepared.requested_model,
            )),
        }
    }

    async fn success_response(
        &self,
        response: reqwest::Response,
        streaming: bool,
    ) -> Result<GateResponse> {
        let status = response.status();
        let mut headers = response.headers().clone();
        // The body is rewritten, so the original framing no longer holds.
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);

        if streaming {
            let stream = SseRewriteStream::new(response.bytes_stream());
            return Ok(GateResponse {
                status,
                headers,
                body: ResponseBody::Stream(Box::pin(stream)),
            });
        }

        let raw = response.bytes().await?;
        match transform::unwrap_buffered(&raw) {
            Ok(payload) => {
                headers.extend(transform::usage_headers(&payload));
                let body = serde_json::to_vec(&payload).map(Bytes::from).unwrap_or(raw);
                Ok(GateResponse {
                    status,
                    headers,
                    body: ResponseBody::Buffered(body),
                })
            }
            // Non-JSON bodies pass through untouched.
            Err(e) => {
                warn!(error = %e, "success body is not valid JSON, returning it raw");
                Ok(GateResponse {
                    status,
                    headers,
                    body: ResponseBody::Buffered(raw),
                })
            }
        }
    }

    /// Send a non-matching call exactly once and hand back the live response.
    ///
    /// Pass-through bodies are not replayable, so they never enter the retry
    /// engine.
    async fn pass_through(&self, call: OutboundCall) -> Result<GateResponse> {
        debug!("passing call through unmodified");
        let mut request = self
            .http
            .request(call.method, &call.url)
            .headers(call.headers);
        if let Some(body) = call.body {
            request = request.body(body);
        }
        let response = request.send().await?;

        Ok(GateResponse {
            status: response.status(),
            headers: response.headers().clone(),
            body: ResponseBody::Stream(Box::pin(response.bytes_stream())),
        })
    }
}

fn failure_response(
    status: StatusCode,
    mut headers: HeaderMap,
    body: &Bytes,
    requested_model: &str,
) -> GateResponse {
    let enhanced = enhance::enhance(status, &headers, body, requested_model);
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    headers.extend(enhanced.extra_headers);
    GateResponse {
        status,
        headers,
        body: ResponseBody::Buffered(enhanced.body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialRecord, MemoryAuthStore};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gate_for(server: &MockServer) -> CodeAssistGate {
        let config = GateConfig::default()
            .with_endpoint(server.uri())
            .with_public_host("127.0.0.1")
            .with_project_id("proj-test")
            .with_token_url(format!("{}/token", server.uri()));
        let store = MemoryAuthStore::with_credential(
            CredentialRecord::new("rt-1").with_access_token("at-1".into(), 3600),
        );
        CodeAssistGate::activate(config, Arc::new(store)).unwrap()
    }

    #[tokio::test]
    async fn test_pass_through_sent_once_unmodified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/unrelated"))
            .respond_with(ResponseTemplate::new(200).set_body_string("untouched"))
            .expect(1)
            .mount(&server)
            .await;

        let gate = gate_for(&server);
        let call = OutboundCall {
            method: Method::GET,
            url: format!("{}/unrelated", server.uri().replace("127.0.0.1", "localhost")),
            headers: HeaderMap::new(),
            body: None,
        };
        // "localhost" does not match the configured public host "127.0.0.1".
        let response = gate.fetch(call).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body.collect().await.unwrap(), "untouched");
    }

    #[tokio::test]
    async fn test_rewritten_call_hits_internal_surface() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": {"candidates": []},
                "traceId": "t-1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gate = gate_for(&server);
        let call = OutboundCall::post(
            format!("{}/v1beta/models/gemini-2.5-pro:generateContent", server.uri()),
            r#"{"contents":[]}"#,
        );
        let response = gate.fetch(call).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let body = response.body.collect().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["responseId"], "t-1");
    }

    #[tokio::test]
    async fn test_malformed_success_body_returned_raw() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let gate = gate_for(&server);
        let call = OutboundCall::post(
            format!("{}/v1beta/models/gemini-2.5-pro:generateContent", server.uri()),
            r#"{"contents":[]}"#,
        );
        let response = gate.fetch(call).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            response.body.collect().await.unwrap(),
            "<html>maintenance</html>"
        );
    }

    #[tokio::test]
    async fn test_empty_body_becomes_empty_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": {"candidates": []}
            })))
            .mount(&server)
            .await;

        let gate = gate_for(&server);
        let call = OutboundCall {
            method: Method::POST,
            url: format!("{}/v1beta/models/gemini-2.5-pro:generateContent", server.uri()),
            headers: HeaderMap::new(),
            body: None,
        };
        assert!(gate.fetch(call).await.is_ok());
    }
}
