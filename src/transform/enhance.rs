//! Error-response enhancement.
//!
//! Failures that survive the retry engine come back to the caller with the
//! upstream status and body, but the raw backend messages are often
//! unactionable. Enhancement appends remediation context to the error
//! message for the cases that have one (account validation, quota, preview
//! gating) and surfaces any retry hint as a `Retry-After` header plus a
//! millisecond-precision companion, whether or not the message changed.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;

use crate::constants::{is_generation3_model, PREVIEW_ENROLLMENT_URL, RETRY_AFTER_MS_HEADER};
use crate::retry::delay_from_headers;
use crate::retry::quota::{classify_429, delay_from_message_text};

/// Enhanced failure: extra headers plus the (possibly rewritten) body.
#[derive(Debug)]
pub struct EnhancedError {
    /// Headers to add to the response.
    pub extra_headers: HeaderMap,
    /// Response body to return.
    pub body: Bytes,
}

fn error_message(parsed: &Value) -> Option<&str> {
    parsed.get("error")?.get("message")?.as_str()
}

/// Whether a 403 is the account-validation gate.
///
/// The backend marks it with a `VALIDATION`-suffixed `ErrorInfo` reason;
/// older responses only say so in the message text.
fn validation_required(parsed: &Value, message: &str) -> bool {
    if message.to_lowercase().contains("validation") {
        return true;
    }
    parsed
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(Value::as_array)
        .is_some_and(|details| {
            details.iter().any(|detail| {
                detail
                    .get("reason")
                    .and_then(Value::as_str)
                    .is_some_and(|reason| reason.contains("VALIDATION"))
            })
        })
}

/// Collect `google.rpc.Help` links from the error details.
fn help_links(parsed: &Value) -> Vec<String> {
    let mut links = Vec::new();
    let details = parsed
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(Value::as_array);
    let Some(details) = details else {
        return links;
    };
    for detail in details {
        let type_url = detail.get("@type").and_then(Value::as_str).unwrap_or("");
        if !type_url.ends_with("Help") {
            continue;
        }
        if let Some(entries) = detail.get("links").and_then(Value::as_array) {
            for entry in entries {
                if let Some(url) = entry.get("url").and_then(Value::as_str) {
                    links.push(url.to_string());
                }
            }
        }
    }
    links
}

fn with_message(mut parsed: Value, message: String) -> Value {
    if let Some(error) = parsed.get_mut("error").and_then(Value::as_object_mut) {
        error.insert("message".to_string(), Value::String(message));
    }
    parsed
}

/// Enhance a terminal failure response.
pub fn enhance(
    status: StatusCode,
    headers: &HeaderMap,
    body: &Bytes,
    requested_model: &str,
) -> EnhancedError {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let message = parsed.as_ref().and_then(error_message).map(str::to_string);

    let classification = if status == StatusCode::TOO_MANY_REQUESTS {
        parsed.as_ref().map(classify_429)
    } else {
        None
    };

    let retry_delay = delay_from_headers(headers)
        .or_else(|| classification.as_ref().and_then(|c| c.retry_delay))
        .or_else(|| message.as_deref().and_then(delay_from_message_text));

    let mut extra_headers = HeaderMap::new();
    if let Some(delay) = retry_delay {
        let ms = delay.as_millis() as u64;
        let secs = ms.div_ceil(1000);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            extra_headers.insert(RETRY_AFTER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&ms.to_string()) {
            extra_headers.insert(RETRY_AFTER_MS_HEADER, value);
        }
    }

    let (Some(parsed), Some(message)) = (parsed, message) else {
        // Non-JSON bodies pass through untouched.
        return EnhancedError {
            extra_headers,
            body: body.clone(),
        };
    };

    let appended = match status {
        StatusCode::FORBIDDEN if validation_required(&parsed, &message) => {
            let links = help_links(&parsed);
            match links.split_first() {
                Some((primary, rest)) => {
                    let mut extra =
                        format!("Complete the account validation at {}, then retry.", primary);
                    if let Some(more) = rest.iter().find(|url| *url != primary) {
                        extra.push_str(&format!(" Learn more: {}", more));
                    }
                    Some(extra)
                }
                None => {
                    Some("Complete the account validation in your browser, then retry.".to_string())
                }
            }
        }
        StatusCode::TOO_MANY_REQUESTS => match classification {
            Some(c) if c.terminal => Some(format!(
                "Quota exhausted for {}. Retrying will not help; wait for the quota to reset or switch models.",
                requested_model
            )),
            _ => retry_delay.map(|d| {
                format!("Rate limited; retry after {}s.", d.as_millis().div_ceil(1000))
            }),
        },
        StatusCode::NOT_FOUND if is_generation3_model(requested_model) => Some(format!(
            "{} requires preview access; enroll at {}.",
            requested_model, PREVIEW_ENROLLMENT_URL
        )),
        _ => None,
    };

    let body = match appended {
        Some(extra) => {
            let rewritten = with_message(parsed, format!("{} {}", message, extra));
            serde_json::to_vec(&rewritten)
                .map(Bytes::from)
                .unwrap_or_else(|_| body.clone())
        }
        None => body.clone(),
    };

    EnhancedError {
        extra_headers,
        body,
    }
}
