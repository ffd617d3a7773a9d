//! Constants and configuration for the Code Assist API.
//!
//! This module contains API endpoints, OAuth defaults, the model fallback
//! table, header values, and the retry/quota tuning constants used
//! throughout the library.

use std::time::Duration;

// ============================================================================
// API Endpoints
// ============================================================================

/// Production Code Assist API endpoint.
pub const CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";

/// Host of the public generative-language API surface.
///
/// Outbound calls targeting this host are rewritten onto the Code Assist
/// backend; everything else passes through unmodified.
pub const PUBLIC_API_HOST: &str = "generativelanguage.googleapis.com";

/// API version segment for the internal surface.
pub const INTERNAL_API_VERSION: &str = "v1internal";

/// Backend hostnames whose structured error details we trust for quota
/// classification. Details from any other domain are ignored.
pub const ERROR_DOMAIN_ALLOWLIST: &[&str] = &[
    "cloudcode-pa.googleapis.com",
    "daily-cloudcode-pa.googleapis.com",
    "staging-cloudcode-pa.sandbox.googleapis.com",
];

/// Build the internal API path for an action, e.g. `/v1internal:generateContent`.
pub fn internal_action_path(action: &str, streaming: bool) -> String {
    if streaming {
        format!("/{}:{}?alt=sse", INTERNAL_API_VERSION, action)
    } else {
        format!("/{}:{}", INTERNAL_API_VERSION, action)
    }
}

// ============================================================================
// OAuth Configuration
// ============================================================================

/// Default OAuth authorization URL.
pub const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Default OAuth token URL.
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Default OAuth client ID.
///
/// These credentials are intentionally public, matching the installed CLI
/// application they impersonate.
pub const DEFAULT_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";

/// Default OAuth client secret (public, installed-app flow).
pub const DEFAULT_CLIENT_SECRET: &str = "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";

/// Default OAuth scopes required for Code Assist access.
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

// ============================================================================
// Credentials
// ============================================================================

/// Safety margin for access token expiry checks (60 seconds).
///
/// An access token is only trusted when its expiry is more than this margin
/// in the future.
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 60;

// ============================================================================
// Model Fallbacks
// ============================================================================

/// Static model fallback table.
///
/// Insulates callers from backend model-availability churn: image-capable
/// variants map to their base text model and preview aliases map to their
/// canonical names.
pub const MODEL_FALLBACKS: &[(&str, &str)] = &[
    ("gemini-2.5-flash-image", "gemini-2.5-flash"),
    ("gemini-2.5-flash-image-preview", "gemini-2.5-flash"),
    ("gemini-3-pro-preview", "gemini-3-pro"),
    ("gemini-3-flash-preview", "gemini-3-flash"),
];

/// Apply the model fallback table, returning the effective model name.
pub fn apply_model_fallback(model: &str) -> &str {
    for (alias, canonical) in MODEL_FALLBACKS {
        if *alias == model {
            return canonical;
        }
    }
    model
}

/// Check whether a model name matches the generation-3 naming pattern.
///
/// Generation-3 models are preview-gated; a 404 for one of these gets a
/// preview-access explanation rather than a bare not-found.
pub fn is_generation3_model(model: &str) -> bool {
    let lower = model.to_lowercase();
    lower.starts_with("gemini-3") || lower.starts_with("gemini-3.")
}

/// Action name that denotes server-streamed output.
pub const STREAM_ACTION: &str = "streamGenerateContent";

// ============================================================================
// Thought Signatures
// ============================================================================

/// Placeholder thought signature attached to replayed function-call parts.
///
/// Newer model generations reject function-call history without a signature;
/// this sentinel instructs the backend to skip validation.
pub const THOUGHT_SIGNATURE_PLACEHOLDER: &str = "skip_thought_signature_validator";

// ============================================================================
// HTTP Headers
// ============================================================================

/// User-Agent header value for API requests.
pub const USER_AGENT: &str = "GeminiCLI/0.8.0 (codeassist-gate)";

/// X-Goog-Api-Client header value.
pub const GOOG_API_CLIENT: &str = "gl-node/22.0.0 codeassist-gate/0.1.0";

/// Client-Metadata header value (JSON).
pub const CLIENT_METADATA: &str =
    r#"{"ideType":"IDE_UNSPECIFIED","platform":"PLATFORM_UNSPECIFIED","pluginType":"GEMINI"}"#;

/// Per-call trace identifier header.
pub const TRACE_ID_HEADER: &str = "x-activity-request-id";

/// Millisecond-precision retry hint header (response side, advisory).
pub const RETRY_AFTER_MS_HEADER: &str = "x-retry-after-ms";

/// API-key header stripped from outbound calls (replaced by the bearer token).
pub const API_KEY_HEADER: &str = "x-goog-api-key";

// ============================================================================
// Retry / Backoff
// ============================================================================

/// Total attempts per outbound call (initial attempt plus retries).
pub const MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff.
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Cap for exponential backoff.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Jitter applied to backoff delays (fraction of the delay, plus or minus).
pub const BACKOFF_JITTER: f64 = 0.3;

/// Default retry delay for a rate-limited call without an explicit hint.
pub const RATE_LIMIT_DEFAULT_DELAY: Duration = Duration::from_secs(10);

/// Retry delay for explicit per-minute quota violations.
pub const PER_MINUTE_VIOLATION_DELAY: Duration = Duration::from_secs(60);

/// Standing cooldown applied after a capacity incident with no retry hint.
pub const CAPACITY_COOLDOWN: Duration = Duration::from_secs(8);

// ============================================================================
// Project Onboarding
// ============================================================================

/// Maximum polls of the onboarding long-running operation.
pub const ONBOARD_POLL_ATTEMPTS: u32 = 10;

/// Interval between onboarding polls.
pub const ONBOARD_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Tier identifier for the free tier.
pub const FREE_TIER_ID: &str = "free-tier";

// ============================================================================
// Remediation Links
// ============================================================================

/// Enrollment link surfaced when a preview-gated model returns 404.
pub const PREVIEW_ENROLLMENT_URL: &str = "https://goo.gle/code-assist-preview";

// ============================================================================
// Timeouts
// ============================================================================

/// Connection timeout for HTTP requests.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Request timeout for non-streaming requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
