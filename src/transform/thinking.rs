//! Thinking-config canonicalization.
//!
//! Callers send the reasoning controls under either naming convention;
//! the internal surface only understands camelCase. Both spellings of the
//! config key and its fields are folded into `thinkingConfig` with
//! `thinkingBudget` / `thinkingLevel` (lower-cased) / `includeThoughts`.
//! A config carrying none of the three recognized fields is removed
//! outright rather than forwarded as a dead object.

use serde_json::Value;

const FIELD_ALIASES: &[(&str, &str)] = &[
    ("thinking_budget", "thinkingBudget"),
    ("thinking_level", "thinkingLevel"),
    ("include_thoughts", "includeThoughts"),
];

/// Canonicalize the thinking config inside a generation config object.
pub fn normalize_thinking_config(generation_config: &mut Value) {
    let Some(config) = generation_config.as_object_mut() else {
        return;
    };

    let thinking = match (config.remove("thinkingConfig"), config.remove("thinking_config")) {
        (Some(camel), _) => Some(camel),
        (None, snake) => snake,
    };
    let Some(mut thinking) = thinking else {
        return;
    };

    if let Some(fields) = thinking.as_object_mut() {
        for (snake, camel) in FIELD_ALIASES {
            if let Some(value) = fields.remove(*snake) {
                // The camelCase spelling wins when both are present.
                fields.entry(camel.to_string()).or_insert(value);
            }
        }
        let lowered = fields
            .get("thinkingLevel")
            .and_then(Value::as_str)
            .map(str::to_lowercase);
        if let Some(lowered) = lowered {
            fields.insert("thinkingLevel".to_string(), Value::String(lowered));
        }
        if !FIELD_ALIASES
            .iter()
            .any(|(_, camel)| fields.contains_key(*camel))
        {
            return;
        }
    }

    config.insert("thinkingConfig".to_string(), thinking);
}
