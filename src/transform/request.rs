//! Request transformation.
//!
//! Turns a call aimed at the public generative-language surface into the
//! envelope the internal surface expects: `{project, model, user_prompt_id,
//! request}` posted to `/v1internal:{action}`, with streaming actions routed
//! through `?alt=sse`. Bodies already carrying the envelope shape are never
//! re-wrapped; only their model is patched through the fallback table.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde_json::{json, Map, Value};
use url::Url;
use uuid::Uuid;

use crate::constants::{
    apply_model_fallback, internal_action_path, API_KEY_HEADER, CLIENT_METADATA, GOOG_API_CLIENT,
    STREAM_ACTION, THOUGHT_SIGNATURE_PLACEHOLDER, TRACE_ID_HEADER,
    USER_AGENT as USER_AGENT_VALUE,
};
use crate::error::{Error, Result};

use super::schema::normalize_tools;
use super::thinking::normalize_thinking_config;

// ============================================================================
// Target detection
// ============================================================================

/// Model and action extracted from a public-surface URL.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetAction {
    /// Model name as requested by the caller.
    pub model: String,
    /// Action verb, e.g. `generateContent`.
    pub action: String,
}

/// Detect whether a URL targets the public surface.
///
/// Matches `…/models/{model}:{action}` on the configured public host;
/// anything else returns `None` and passes through untouched.
pub fn detect_target(url: &Url, public_host: &str) -> Option<TargetAction> {
    let host = url.host_str()?;
    if !host.eq_ignore_ascii_case(public_host) {
        return None;
    }
    let (_, tail) = url.path().rsplit_once("/models/")?;
    let (model, action) = tail.split_once(':')?;
    if model.is_empty() || action.is_empty() {
        return None;
    }
    Some(TargetAction {
        model: model.to_string(),
        action: action.to_string(),
    })
}

// ============================================================================
// Body transformation
// ============================================================================

/// A request ready to send to the internal surface.
#[derive(Debug)]
pub struct PreparedRequest {
    /// Full target URL, including `?alt=sse` for streaming actions.
    pub url: String,
    /// Headers to send.
    pub headers: HeaderMap,
    /// Envelope body.
    pub body: Value,
    /// Whether the response will be a server-sent event stream.
    pub streaming: bool,
    /// Model name the caller originally asked for, for error messaging.
    pub requested_model: String,
    /// Model name after the fallback table.
    pub effective_model: String,
}

fn take_alias(map: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    let mut found = None;
    for key in keys {
        if let Some(value) = map.remove(*key) {
            // Earlier keys (the canonical spelling first) win.
            found.get_or_insert(value);
        }
    }
    found
}

/// Convert OpenAI-style `tool_calls` turns into native `functionCall` parts
/// and backfill the thought-signature placeholder on function-call history.
fn normalize_contents(contents: &mut Value) {
    let Some(contents) = contents.as_array_mut() else {
        return;
    };
    for content in contents {
        let Some(entry) = content.as_object_mut() else {
            continue;
        };

        if let Some(Value::Array(calls)) = entry.remove("tool_calls") {
            let parts = entry
                .entry("parts".to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(parts) = parts.as_array_mut() {
                for call in calls {
                    let function = call.get("function");
                    let name = function
                        .and_then(|f| f.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let args = function
                        .and_then(|f| f.get("arguments"))
                        .and_then(Value::as_str)
                        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                        .unwrap_or_else(|| json!({}));
                    parts.push(json!({
                        "functionCall": {"name": name, "args": args},
                        "thoughtSignature": THOUGHT_SIGNATURE_PLACEHOLDER,
                    }));
                }
            }
        }

        if let Some(parts) = entry.get_mut("parts").and_then(Value::as_array_mut) {
            for part in parts {
                let Some(part) = part.as_object_mut() else {
                    continue;
                };
                if part.contains_key("functionCall") && !part.contains_key("thoughtSignature") {
                    part.insert(
                        "thoughtSignature".to_string(),
                        Value::String(THOUGHT_SIGNATURE_PLACEHOLDER.to_string()),
                    );
                }
            }
        }
    }
}

/// Consolidate the cached-content aliases from the top level and the extra
/// bags into a single `cachedContent` field.
fn consolidate_cached_content(inner: &mut Map<String, Value>) {
    let mut cached = take_alias(inner, &["cachedContent", "cached_content"]);
    for bag_key in ["extra", "extra_body"] {
        let Some(bag) = inner.get_mut(bag_key).and_then(Value::as_object_mut) else {
            continue;
        };
        if let Some(value) = take_alias(bag, &["cachedContent", "cached_content"]) {
            cached.get_or_insert(value);
        }
        if bag.is_empty() {
            inner.remove(bag_key);
        }
    }
    if let Some(cached) = cached {
        inner.insert("cachedContent".to_string(), cached);
    }
}

/// Build the envelope for an unwrapped public-surface body.
fn build_envelope(
    mut inner: Map<String, Value>,
    project: &str,
    effective_model: &str,
    session_id: &str,
) -> Value {
    if let Some(system) = take_alias(&mut inner, &["systemInstruction", "system_instruction"]) {
        inner.insert("systemInstruction".to_string(), system);
    }
    if let Some(mut generation) = take_alias(&mut inner, &["generationConfig", "generation_config"])
    {
        normalize_thinking_config(&mut generation);
        inner.insert("generationConfig".to_string(), generation);
    }
    if let Some(contents) = inner.get_mut("contents") {
        normalize_contents(contents);
    }
    if let Some(tools) = inner.get_mut("tools") {
        normalize_tools(tools);
    }
    consolidate_cached_content(&mut inner);
    inner.remove("model");

    let prompt_id = take_alias(
        &mut inner,
        &["user_prompt_id", "userPromptId", "prompt_id", "promptId"],
    )
    .and_then(|v| v.as_str().map(str::to_string))
    .unwrap_or_else(|| Uuid::new_v4().to_string());

    let session = take_alias(&mut inner, &["session_id", "sessionId"])
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| session_id.to_string());
    inner.insert("session_id".to_string(), Value::String(session));

    json!({
        "project": project,
        "model": effective_model,
        "user_prompt_id": prompt_id,
        "request": Value::Object(inner),
    })
}

/// Transform a detected public-surface call into a [`PreparedRequest`].
///
/// `session_id` is the process-lifetime session identifier used when the
/// caller did not supply one.
pub fn prepare(
    target: &TargetAction,
    original_headers: &HeaderMap,
    body: Value,
    endpoint: &str,
    project: &str,
    access_token: &str,
    session_id: &str,
) -> Result<PreparedRequest> {
    let streaming = target.action == STREAM_ACTION;
    let requested_model = target.model.clone();

    let (envelope, effective_model) = match body {
        Value::Object(map) if map.contains_key("project") && map.contains_key("request") => {
            // Already wrapped: patch the model, never re-wrap.
            let mut map = map;
            let requested = map
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(&target.model)
                .to_string();
            let effective = apply_model_fallback(&requested).to_string();
            map.insert("model".to_string(), Value::String(effective.clone()));
            (Value::Object(map), effective)
        }
        Value::Object(map) => {
            let effective = apply_model_fallback(&target.model).to_string();
            (
                build_envelope(map, project, &effective, session_id),
                effective,
            )
        }
        other => {
            return Err(Error::config(format!(
                "request body must be a JSON object, got {}",
                match other {
                    Value::Null => "null",
                    Value::Bool(_) => "a boolean",
                    Value::Number(_) => "a number",
                    Value::String(_) => "a string",
                    Value::Array(_) => "an array",
                    Value::Object(_) => unreachable!(),
                }
            )));
        }
    };

    let mut headers = original_headers.clone();
    headers.remove(API_KEY_HEADER);
    headers.remove(reqwest::header::HOST);
    headers.remove(reqwest::header::CONTENT_LENGTH);

    let bearer: HeaderValue = format!("Bearer {}", access_token)
        .parse()
        .map_err(|_| Error::config("access token is not a valid header value"))?;
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
    headers.insert("x-goog-api-client", HeaderValue::from_static(GOOG_API_CLIENT));
    headers.insert("client-metadata", HeaderValue::from_static(CLIENT_METADATA));
    let trace: HeaderValue = Uuid::new_v4()
        .to_string()
        .parse()
        .map_err(|_| Error::config("trace id is not a valid header value"))?;
    headers.insert(TRACE_ID_HEADER, trace);
    if streaming {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    }

    Ok(PreparedRequest {
        url: format!(
            "{}{}",
            endpoint,
            internal_action_path(&target.action, streaming)
        ),
        headers,
        body: envelope,
        streaming,
        requested_model,
        effective_model,
    })
}
