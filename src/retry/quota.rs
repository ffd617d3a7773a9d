//! Quota classification for 429 responses.
//!
//! The backend reports rate limiting through Google's structured error
//! detail format (`ErrorInfo.reason`, `RetryInfo.retryDelay`,
//! `QuotaFailure.violations`), inconsistently. This module turns a 429 body
//! into a [`QuotaClassification`] the retry engine and the response
//! enhancer share, so both sides agree on what is terminal.

use std::time::Duration;

use serde_json::Value;

use crate::constants::{
    ERROR_DOMAIN_ALLOWLIST, PER_MINUTE_VIOLATION_DELAY, RATE_LIMIT_DEFAULT_DELAY,
};

/// Outcome of classifying a 429 body.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaClassification {
    /// Do not retry this call.
    pub terminal: bool,
    /// Retry after this delay, when one was derived.
    pub retry_delay: Option<Duration>,
    /// The structured reason, when one was recognized.
    pub reason: Option<String>,
}

impl QuotaClassification {
    fn unclassified(retry_delay: Option<Duration>) -> Self {
        Self {
            terminal: false,
            retry_delay,
            reason: None,
        }
    }
}

/// Classify a parsed 429 body.
///
/// Error-detail domains outside the backend allow-list are ignored, so
/// unrelated services sharing the detail format fall back to generic 429
/// handling.
pub fn classify_429(body: &Value) -> QuotaClassification {
    let error = body.get("error").unwrap_or(body);
    let details = match error.get("details").and_then(Value::as_array) {
        Some(d) => d,
        None => return QuotaClassification::unclassified(None),
    };

    let mut reason: Option<String> = None;
    let mut retry_delay: Option<Duration> = None;
    let mut violations_text = String::new();

    for detail in details {
        let type_url = detail.get("@type").and_then(Value::as_str).unwrap_or("");

        if type_url.ends_with("RetryInfo") {
            if let Some(delay) = detail
                .get("retryDelay")
                .and_then(Value::as_str)
                .and_then(parse_google_duration)
            {
                retry_delay = Some(delay);
            }
        } else if type_url.ends_with("ErrorInfo") {
            let domain = detail.get("domain").and_then(Value::as_str).unwrap_or("");
            if !ERROR_DOMAIN_ALLOWLIST.contains(&domain) {
                continue;
            }
            if let Some(r) = detail.get("reason").and_then(Value::as_str) {
                reason = Some(r.to_string());
            }
        } else if type_url.ends_with("QuotaFailure") {
            if let Some(violations) = detail.get("violations").and_then(Value::as_array) {
                for violation in violations {
                    for field in ["description", "subject", "quotaId"] {
                        if let Some(text) = violation.get(field).and_then(Value::as_str) {
                            violations_text.push_str(text);
                            violations_text.push('\n');
                        }
                    }
                }
            }
        }
    }

    let violations_lower = violations_text.to_lowercase();
    let daily = violations_lower.contains("per day")
        || violations_lower.contains("perday")
        || violations_lower.contains("daily");
    let per_minute =
        violations_lower.contains("per minute") || violations_lower.contains("perminute");

    match reason.as_deref() {
        Some("QUOTA_EXHAUSTED") => QuotaClassification {
            terminal: true,
            retry_delay: None,
            reason,
        },
        Some("RATE_LIMIT_EXCEEDED") => {
            let default = if per_minute {
                PER_MINUTE_VIOLATION_DELAY
            } else {
                RATE_LIMIT_DEFAULT_DELAY
            };
            // A smaller explicit RetryInfo delay wins over the default.
            let delay = match retry_delay {
                Some(d) if d < default => d,
                _ => default,
            };
            QuotaClassification {
                terminal: false,
                retry_delay: Some(delay),
                reason,
            }
        }
        Some("MODEL_CAPACITY_EXHAUSTED") => match retry_delay {
            // An explicit delay downgrades the capacity incident to retryable.
            Some(delay) => QuotaClassification {
                terminal: false,
                retry_delay: Some(delay),
                reason,
            },
            None => QuotaClassification {
                terminal: true,
                retry_delay: None,
                reason,
            },
        },
        _ if daily => QuotaClassification {
            terminal: true,
            retry_delay: None,
            reason: reason.or_else(|| Some("QUOTA_EXHAUSTED".to_string())),
        },
        _ if per_minute => QuotaClassification {
            terminal: false,
            retry_delay: Some(retry_delay.unwrap_or(PER_MINUTE_VIOLATION_DELAY)),
            reason: reason.or_else(|| Some("RATE_LIMIT_EXCEEDED".to_string())),
        },
        _ => QuotaClassification::unclassified(retry_delay),
    }
}

/// Parse a protobuf-style duration string such as `"1.5s"` or `"1500ms"`.
pub fn parse_google_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(ms) = raw.strip_suffix("ms") {
        let value: f64 = ms.trim().parse().ok()?;
        return duration_from_millis(value);
    }
    if let Some(secs) = raw.strip_suffix('s') {
        let value: f64 = secs.trim().parse().ok()?;
        return duration_from_millis(value * 1000.0);
    }
    None
}

fn duration_from_millis(ms: f64) -> Option<Duration> {
    if ms.is_finite() && ms >= 0.0 {
        Some(Duration::from_millis(ms as u64))
    } else {
        None
    }
}

/// Scan free-text for a retry hint ("Please retry in 5s", "after 1500ms").
pub fn delay_from_message_text(text: &str) -> Option<Duration> {
    let lower = text.to_lowercase();
    for marker in ["retry in ", "after "] {
        let mut search_from = 0;
        while let Some(pos) = lower[search_from..].find(marker) {
            let start = search_from + pos + marker.len();
            if let Some(delay) = parse_leading_duration(&lower[start..]) {
                return Some(delay);
            }
            search_from = start;
        }
    }
    None
}

/// Parse a duration at the start of a string: a number followed by `ms` or `s`.
fn parse_leading_duration(text: &str) -> Option<Duration> {
    let digits: String = text
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() {
        return None;
    }
    let rest = &text[digits.len()..];
    let value: f64 = digits.parse().ok()?;
    if rest.starts_with("ms") {
        duration_from_millis(value)
    } else if rest.starts_with('s') {
        duration_from_millis(value * 1000.0)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body_with_details(details: Value) -> Value {
        json!({
            "error": {
                "code": 429,
                "message": "Resource has been exhausted",
                "status": "RESOURCE_EXHAUSTED",
                "details": details
            }
        })
    }

    fn error_info(reason: &str) -> Value {
        json!({
            "@type": "type.googleapis.com/google.rpc.ErrorInfo",
            "reason": reason,
            "domain": "cloudcode-pa.googleapis.com"
        })
    }

    #[test]
    fn test_quota_exhausted_is_terminal() {
        let body = body_with_details(json!([error_info("QUOTA_EXHAUSTED")]));
        let c = classify_429(&body);
        assert!(c.terminal);
        assert!(c.retry_delay.is_none());
        assert_eq!(c.reason.as_deref(), Some("QUOTA_EXHAUSTED"));
    }

    #[test]
    fn test_rate_limit_default_delay() {
        let body = body_with_details(json!([error_info("RATE_LIMIT_EXCEEDED")]));
        let c = classify_429(&body);
        assert!(!c.terminal);
        assert_eq!(c.retry_delay, Some(RATE_LIMIT_DEFAULT_DELAY));
    }

    #[test]
    fn test_rate_limit_smaller_explicit_delay_wins() {
        let body = body_with_details(json!([
            error_info("RATE_LIMIT_EXCEEDED"),
            {
                "@type": "type.googleapis.com/google.rpc.RetryInfo",
                "retryDelay": "1500ms"
            }
        ]));
        let c = classify_429(&body);
        assert!(!c.terminal);
        assert_eq!(c.retry_delay, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_rate_limit_larger_explicit_delay_loses_to_default() {
        let body = body_with_details(json!([
            error_info("RATE_LIMIT_EXCEEDED"),
            {
                "@type": "type.googleapis.com/google.rpc.RetryInfo",
                "retryDelay": "45s"
            }
        ]));
        let c = classify_429(&body);
        assert_eq!(c.retry_delay, Some(RATE_LIMIT_DEFAULT_DELAY));
    }

    #[test]
    fn test_per_minute_violation_uses_minute_delay() {
        let body = body_with_details(json!([
            error_info("RATE_LIMIT_EXCEEDED"),
            {
                "@type": "type.googleapis.com/google.rpc.QuotaFailure",
                "violations": [{"description": "Quota exceeded for requests per minute"}]
            }
        ]));
        let c = classify_429(&body);
        assert!(!c.terminal);
        assert_eq!(c.retry_delay, Some(PER_MINUTE_VIOLATION_DELAY));
    }

    #[test]
    fn test_daily_violation_is_terminal_without_error_info() {
        let body = body_with_details(json!([
            {
                "@type": "type.googleapis.com/google.rpc.QuotaFailure",
                "violations": [{"description": "Quota exceeded for requests per day"}]
            }
        ]));
        let c = classify_429(&body);
        assert!(c.terminal);
    }

    #[test]
    fn test_capacity_without_delay_is_terminal() {
        let body = body_with_details(json!([error_info("MODEL_CAPACITY_EXHAUSTED")]));
        let c = classify_429(&body);
        assert!(c.terminal);
        assert_eq!(c.reason.as_deref(), Some("MODEL_CAPACITY_EXHAUSTED"));
    }

    #[test]
    fn test_capacity_with_delay_is_retryable() {
        let body = body_with_details(json!([
            error_info("MODEL_CAPACITY_EXHAUSTED"),
            {
                "@type": "type.googleapis.com/google.rpc.RetryInfo",
                "retryDelay": "2s"
            }
        ]));
        let c = classify_429(&body);
        assert!(!c.terminal);
        assert_eq!(c.retry_delay, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_unknown_domain_is_ignored() {
        let body = body_with_details(json!([
            {
                "@type": "type.googleapis.com/google.rpc.ErrorInfo",
                "reason": "QUOTA_EXHAUSTED",
                "domain": "someoneelse.example.com"
            }
        ]));
        let c = classify_429(&body);
        // No classification: generic 429 handling applies.
        assert!(!c.terminal);
        assert!(c.reason.is_none());
    }

    #[test]
    fn test_missing_details_is_unclassified() {
        let body = json!({"error": {"code": 429, "message": "slow down"}});
        let c = classify_429(&body);
        assert!(!c.terminal);
        assert!(c.retry_delay.is_none());
        assert!(c.reason.is_none());
    }

    #[test]
    fn test_parse_google_duration() {
        assert_eq!(parse_google_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_google_duration("1500ms"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_google_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_google_duration("0s"), Some(Duration::ZERO));
        assert_eq!(parse_google_duration("abc"), None);
        assert_eq!(parse_google_duration(""), None);
    }

    #[test]
    fn test_delay_from_message_text() {
        assert_eq!(
            delay_from_message_text("Please retry in 5s."),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            delay_from_message_text("Try again after 1500ms"),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            delay_from_message_text("Please retry in 2.5s"),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(delay_from_message_text("no hint here"), None);
        // A marker without a parseable duration does not loop forever.
        assert_eq!(delay_from_message_text("retry in a bit"), None);
    }
}
