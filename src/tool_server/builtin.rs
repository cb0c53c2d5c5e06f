//! Demo tools: integer math and string helpers.

use serde_json::{json, Map, Value};

use super::server::{ToolFailure, ToolServer};

/// Separator used by `concat` when none is given.
pub const DEFAULT_SEPARATOR: &str = " ";

/// `math-server`: `add` and `multiply`.
pub fn math_server() -> ToolServer {
    let mut server = ToolServer::new("math-server", env!("CARGO_PKG_VERSION"));
    server
        .register(
            "add",
            "Add two integers together and return the sum.",
            operand_schema(),
            add,
        )
        .register(
            "multiply",
            "Multiply two integers and return the product.",
            operand_schema(),
            multiply,
        );
    server
}

/// `string-server`: `uppercase` and `concat`.
pub fn string_server() -> ToolServer {
    let mut server = ToolServer::new("string-server", env!("CARGO_PKG_VERSION"));
    server
        .register(
            "uppercase",
            "Convert a string to uppercase letters.",
            json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string", "description": "The text to convert to uppercase"}
                },
                "required": ["text"]
            }),
            uppercase,
        )
        .register(
            "concat",
            "Concatenate two strings with a separator between them.",
            json!({
                "type": "object",
                "properties": {
                    "a": {"type": "string", "description": "First string"},
                    "b": {"type": "string", "description": "Second string"},
                    "separator": {
                        "type": "string",
                        "description": "Separator to place between the strings",
                        "default": DEFAULT_SEPARATOR
                    }
                },
                "required": ["a", "b"]
            }),
            concat,
        );
    server
}

fn operand_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "a": {"type": "integer", "description": "First operand"},
            "b": {"type": "integer", "description": "Second operand"}
        },
        "required": ["a", "b"]
    })
}

// ─── Tool bodies ─────────────────────────────────────────────────────────────

fn add(args: Map<String, Value>) -> Result<Value, ToolFailure> {
    let (a, b) = (int_arg(&args, "a")?, int_arg(&args, "b")?);
    a.checked_add(b)
        .map(Value::from)
        .ok_or_else(|| ToolFailure::new("overflow", format!("{a} + {b} overflows a 64-bit integer")))
}

fn multiply(args: Map<String, Value>) -> Result<Value, ToolFailure> {
    let (a, b) = (int_arg(&args, "a")?, int_arg(&args, "b")?);
    a.checked_mul(b)
        .map(Value::from)
        .ok_or_else(|| ToolFailure::new("overflow", format!("{a} * {b} overflows a 64-bit integer")))
}

fn uppercase(args: Map<String, Value>) -> Result<Value, ToolFailure> {
    Ok(Value::from(str_arg(&args, "text")?.to_uppercase()))
}

fn concat(args: Map<String, Value>) -> Result<Value, ToolFailure> {
    let a = str_arg(&args, "a")?;
    let b = str_arg(&args, "b")?;
    let separator = match args.get("separator") {
        None | Some(Value::Null) => DEFAULT_SEPARATOR,
        Some(_) => str_arg(&args, "separator")?,
    };
    Ok(Value::from(format!("{a}{separator}{b}")))
}

fn int_arg(args: &Map<String, Value>, name: &str) -> Result<i64, ToolFailure> {
    args.get(name)
        .and_then(|value| value.as_i64().or_else(|| integral_f64(value)))
        .ok_or_else(|| ToolFailure::invalid_arguments(format!("'{name}' must be an integer")))
}

/// `5.0` counts as the integer 5 when it fits in an `i64`.
fn integral_f64(value: &Value) -> Option<i64> {
    let f = value.as_f64()?;
    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
    (f.fract() == 0.0 && in_range).then_some(f as i64)
}

fn str_arg<'a>(args: &'a Map<String, Value>, name: &str) -> Result<&'a str, ToolFailure> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolFailure::invalid_arguments(format!("'{name}' must be a string")))
}
