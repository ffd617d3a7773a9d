//! Tool schema normalization.
//!
//! The internal surface rejects JSON schemas where a union (`anyOf`) has
//! sibling constraints. Normalization keeps the union and drops every
//! sibling except `$defs`/`definitions`, recursing through the whole tree so
//! nested unions inside properties, array items, and definitions all get the
//! same treatment. The snake_case `any_of` spelling is folded into `anyOf`.

use serde_json::Value;

/// Normalize one schema tree in place.
pub fn normalize_schema(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let union = map.remove("anyOf").or_else(|| map.remove("any_of"));
            if let Some(mut union) = union {
                let defs = map.remove("$defs");
                let definitions = map.remove("definitions");
                map.clear();

                normalize_schema(&mut union);
                map.insert("anyOf".to_string(), union);
                if let Some(mut defs) = defs {
                    normalize_schema(&mut defs);
                    map.insert("$defs".to_string(), defs);
                }
                if let Some(mut definitions) = definitions {
                    normalize_schema(&mut definitions);
                    map.insert("definitions".to_string(), definitions);
                }
            } else {
                for child in map.values_mut() {
                    normalize_schema(child);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                normalize_schema(item);
            }
        }
        _ => {}
    }
}

/// Normalize the parameter schema of every function declaration in a tools
/// array, covering both naming conventions.
pub fn normalize_tools(tools: &mut Value) {
    let Some(tools) = tools.as_array_mut() else {
        return;
    };
    for tool in tools {
        for decls_key in ["functionDeclarations", "function_declarations"] {
            let Some(decls) = tool.get_mut(decls_key).and_then(Value::as_array_mut) else {
                continue;
            };
            for decl in decls {
                for params_key in ["parameters", "parametersJsonSchema", "parameters_json_schema"]
                {
                    if let Some(schema) = decl.get_mut(params_key) {
                        normalize_schema(schema);
                    }
                }
            }
        }
    }
}
