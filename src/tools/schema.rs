//! Minimal JSON-schema argument validation for tool calls.
//!
//! Checks required fields, primitive types, and enum membership. Unknown
//! properties pass through; nested schemas are not descended into.

use serde_json::Value;

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

/// Validate `args` against a tool's input schema. Returns a human-readable
/// message on the first violation.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(args_obj) = args.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !args_obj.contains_key(name) {
                return Err(format!("Missing required parameter '{name}'"));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (name, spec) in properties {
        let Some(value) = args_obj.get(name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if let Some(expected) = spec.get("type").and_then(Value::as_str) {
            if !type_matches(expected, value) {
                return Err(format!("Parameter '{name}' must be of type {expected}"));
            }
        }
        if let Some(allowed) = spec.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                let options: Vec<String> = allowed.iter().map(ToString::to_string).collect();
                return Err(format!(
                    "Parameter '{name}' must be one of: {}",
                    options.join(", ")
                ));
            }
        }
    }

    Ok(())
}
