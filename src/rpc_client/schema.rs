//! Structural argument validation against a tool's declared input schema.
//!
//! Supports the subset of JSON Schema that tool catalogs use in practice:
//! `type`, `properties`, `required`, `additionalProperties`, `items` and
//! `enum`. Unknown keywords are ignored.

use serde_json::Value;

use super::errors::RpcError;

/// Validate `arguments` for `tool` against `schema`.
///
/// A null or empty schema accepts anything.
pub fn validate_arguments(tool: &str, schema: &Value, arguments: &Value) -> Result<(), RpcError> {
    check(schema, arguments, "arguments").map_err(|reason| RpcError::SchemaValidation {
        tool: tool.to_string(),
        reason,
    })
}

fn check(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(types) => types.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, value)) {
            return Err(format!(
                "{path}: expected {}, got {}",
                allowed.join(" or "),
                type_name(value)
            ));
        }
    }

    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            return Err(format!("{path}: {value} is not one of the allowed values"));
        }
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(field) {
                    return Err(format!("{path}: missing required field '{field}'"));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        for (key, field_value) in object {
            match properties.and_then(|props| props.get(key)) {
                Some(field_schema) => check(field_schema, field_value, &format!("{path}.{key}"))?,
                None => match schema.get("additionalProperties") {
                    Some(Value::Bool(false)) => {
                        return Err(format!("{path}: unexpected field '{key}'"));
                    }
                    Some(extra @ Value::Object(_)) => {
                        check(extra, field_value, &format!("{path}.{key}"))?
                    }
                    _ => {}
                },
            }
        }
    }

    if let (Some(items), Some(array)) = (schema.get("items"), value.as_array()) {
        for (index, item) in array.iter().enumerate() {
            check(items, item, &format!("{path}[{index}]"))?;
        }
    }

    Ok(())
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.as_f64().is_some_and(|f| f.fract() != 0.0) => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
