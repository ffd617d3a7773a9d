//! Response transformation for buffered (non-streaming) bodies.
//!
//! The internal surface nests the public payload under `response` and hangs
//! a `traceId` beside it. Unwrapping restores the public shape; the trace id
//! becomes `responseId` when the payload lacks one, and usage counters are
//! lifted into response headers so callers get accounting without parsing
//! the body.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

/// Header carrying the prompt token count.
pub const PROMPT_TOKENS_HEADER: &str = "x-usage-prompt-tokens";
/// Header carrying the candidate (output) token count.
pub const OUTPUT_TOKENS_HEADER: &str = "x-usage-output-tokens";
/// Header carrying the total token count.
pub const TOTAL_TOKENS_HEADER: &str = "x-usage-total-tokens";
/// Header carrying the cached-content token count.
pub const CACHED_TOKENS_HEADER: &str = "x-usage-cached-tokens";

/// Unwrap one internal-surface payload into its public shape.
///
/// Used by both the buffered path and the per-line streaming rewrite.
/// Payloads without the `response` nesting come back unchanged.
pub fn unwrap_payload(value: Value) -> Value {
    let Value::Object(mut outer) = value else {
        return value;
    };
    let Some(inner) = outer.remove("response") else {
        return Value::Object(outer);
    };

    let mut inner = match inner {
        Value::Object(map) => map,
        other => return other,
    };
    if let Some(trace) = outer.remove("traceId") {
        inner.entry("responseId".to_string()).or_insert(trace);
    }
    Value::Object(inner)
}

/// Parse and unwrap a buffered response body.
///
/// Tolerates a top-level single-element array, which the backend emits for
/// some non-streaming calls.
pub fn unwrap_buffered(body: &[u8]) -> serde_json::Result<Value> {
    let parsed: Value = serde_json::from_slice(body)?;
    let payload = match parsed {
        Value::Array(mut items) if items.len() == 1 => items.pop().unwrap_or(Value::Null),
        other => other,
    };
    Ok(unwrap_payload(payload))
}

/// Lift usage counters out of a payload into response headers.
pub fn usage_headers(payload: &Value) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let Some(usage) = payload.get("usageMetadata") else {
        return headers;
    };
    let pairs = [
        (PROMPT_TOKENS_HEADER, "promptTokenCount"),
        (OUTPUT_TOKENS_HEADER, "candidatesTokenCount"),
        (TOTAL_TOKENS_HEADER, "totalTokenCount"),
        (CACHED_TOKENS_HEADER, "cachedContentTokenCount"),
    ];
    for (header, field) in pairs {
        if let Some(count) = usage.get(field).and_then(Value::as_i64) {
            if let Ok(value) = HeaderValue::from_str(&count.to_string()) {
                headers.insert(header, value);
            }
        }
    }
    headers
}
