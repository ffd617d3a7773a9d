//! Bounded retry with quota-aware delays.
//!
//! Every rewritten call goes through [`RetryEngine::execute`]: at most
//! [`MAX_ATTEMPTS`] sends, with the delay between attempts resolved from the
//! most precise hint available. Terminal quota failures ([`quota`]) stop the
//! loop immediately. A cooldown map keyed by (endpoint, project, model)
//! carries standing throttle state across calls, so a capacity incident on
//! one model delays later calls to that model without touching others.

pub mod quota;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::constants::{
    BACKOFF_BASE, BACKOFF_CAP, BACKOFF_JITTER, MAX_ATTEMPTS, RETRY_AFTER_MS_HEADER,
};
use crate::error::{Error, Result};

use quota::{classify_429, delay_from_message_text};

// ============================================================================
// Throttle state
// ============================================================================

/// Identity of a throttled backend slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    /// Backend endpoint base URL.
    pub endpoint: String,
    /// Resolved project id ("" when unresolved).
    pub project: String,
    /// Effective model name.
    pub model: String,
}

impl ThrottleKey {
    /// Build a key from its parts.
    pub fn new(
        endpoint: impl Into<String>,
        project: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            project: project.into(),
            model: model.into(),
        }
    }
}

/// Standing cooldowns keyed by [`ThrottleKey`].
///
/// A later, longer cooldown extends the deadline; a shorter one never
/// shortens it.
#[derive(Debug, Default)]
pub struct CooldownMap {
    inner: Mutex<HashMap<ThrottleKey, Instant>>,
}

impl CooldownMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cooldown for a key.
    pub fn note(&self, key: &ThrottleKey, delay: Duration) {
        let deadline = Instant::now() + delay;
        if let Ok(mut map) = self.inner.lock() {
            let entry = map.entry(key.clone()).or_insert(deadline);
            if deadline > *entry {
                *entry = deadline;
            }
        }
    }

    /// Time remaining before the key may be used, if any.
    pub fn remaining(&self, key: &ThrottleKey) -> Option<Duration> {
        let mut map = self.inner.lock().ok()?;
        let deadline = map.get(key)?;
        let now = Instant::now();
        if *deadline > now {
            Some(*deadline - now)
        } else {
            map.remove(key);
            None
        }
    }
}

// ============================================================================
// Delay resolution
// ============================================================================

/// Exponential backoff with jitter for the given zero-based attempt.
///
/// Base 5s doubling per attempt, capped at 30s, then jittered by up to
/// plus or minus 30%.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.as_millis() as u64;
    let cap = BACKOFF_CAP.as_millis() as u64;
    let raw = base.saturating_mul(1u64 << attempt.min(16)).min(cap);
    let jitter = rand::rng().random_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
    let jittered = (raw as f64 * (1.0 + jitter)).max(0.0);
    Duration::from_millis(jittered as u64)
}

/// Extract a retry delay from response headers.
///
/// The millisecond header wins over `Retry-After`; `Retry-After` may be
/// either delta-seconds or an HTTP-date.
pub fn delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = headers
        .get(RETRY_AFTER_MS_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_millis(ms));
    }

    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

/// Resolve the delay before the next attempt after a rate-limited response.
///
/// Precision order: millisecond header, `Retry-After`, structured quota
/// classification, free-text hint in the body, exponential backoff.
fn resolve_retry_delay(
    attempt: u32,
    headers: &HeaderMap,
    classified_delay: Option<Duration>,
    body_text: &str,
) -> Duration {
    delay_from_headers(headers)
        .or(classified_delay)
        .or_else(|| delay_from_message_text(body_text))
        .unwrap_or_else(|| backoff_delay(attempt))
}

// ============================================================================
// Retry engine
// ============================================================================

/// Result of an exhausted or terminated send.
#[derive(Debug)]
pub enum SendOutcome {
    /// A 2xx response, body unread (streaming bodies stay live).
    Success(reqwest::Response),
    /// A non-2xx response the engine will not retry further.
    Failed {
        /// Final HTTP status.
        status: StatusCode,
        /// Final response headers.
        headers: HeaderMap,
        /// Final response body, fully read.
        body: Bytes,
    },
}

/// Retry engine shared by all calls through one gate instance.
pub struct RetryEngine {
    cooldowns: CooldownMap,
    capacity_cooldown: Duration,
}

impl RetryEngine {
    /// Create an engine with the given capacity-incident cooldown.
    pub fn new(capacity_cooldown: Duration) -> Self {
        Self {
            cooldowns: CooldownMap::new(),
            capacity_cooldown,
        }
    }

    /// The standing cooldown map.
    pub fn cooldowns(&self) -> &CooldownMap {
        &self.cooldowns
    }

    /// Send a call with bounded retries.
    ///
    /// `send` is invoked once per attempt and must build a fresh request
    /// each time. Any standing cooldown for `key` is awaited before the
    /// first attempt.
    pub async fn execute<F, Fut>(&self, key: &ThrottleKey, send: F) -> Result<SendOutcome>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = reqwest::Result<reqwest::Response>>,
    {
        if let Some(wait) = self.cooldowns.remaining(key) {
            debug!(model = %key.model, wait_ms = wait.as_millis() as u64, "standing cooldown");
            tokio::time::sleep(wait).await;
        }

        for attempt in 0..MAX_ATTEMPTS {
            let last = attempt + 1 == MAX_ATTEMPTS;

            let response = match send().await {
                Ok(r) => r,
                Err(e) => {
                    let err = Error::from(e);
                    if err.is_transient() && !last {
                        let delay = backoff_delay(attempt);
                        warn!(attempt, delay_ms = delay.as_millis() as u64,
                            "transport failure, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(err);
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(SendOutcome::Success(response));
            }

            let headers = response.headers().clone();
            let body = response.bytes().await.unwrap_or_default();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let body_text = String::from_utf8_lossy(&body);
                let parsed: serde_json::Value =
                    serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
                let classification = classify_429(&parsed);

                if classification.terminal {
                    if classification.reason.as_deref() == Some("MODEL_CAPACITY_EXHAUSTED") {
                        // No hint from the backend: impose a standing cooldown
                        // so follow-up calls don't hammer a saturated model.
                        self.cooldowns.note(key, self.capacity_cooldown);
                    }
                    warn!(model = %key.model, reason = ?classification.reason,
                        "terminal quota failure");
                    return Ok(SendOutcome::Failed {
                        status,
                        headers,
                        body,
                    });
                }

                let delay = resolve_retry_delay(
                    attempt,
                    &headers,
                    classification.retry_delay,
                    &body_text,
                );
                self.cooldowns.note(key, delay);

                if last {
                    return Ok(SendOutcome::Failed {
                        status,
                        headers,
                        body,
                    });
                }
                debug!(attempt, delay_ms = delay.as_millis() as u64, "rate limited, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }

            if status.is_server_error() {
                if last {
                    return Ok(SendOutcome::Failed {
                        status,
                        headers,
                        body,
                    });
                }
                let delay = delay_from_headers(&headers).unwrap_or_else(|| backoff_delay(attempt));
                warn!(attempt, status = status.as_u16(),
                    delay_ms = delay.as_millis() as u64, "server error, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }

            // Remaining 4xx statuses are not retryable.
            return Ok(SendOutcome::Failed {
                status,
                headers,
                body,
            });
        }

        unreachable!("retry loop returns on the final attempt")
    }
}
