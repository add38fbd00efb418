use serde_json::Value;
use thiserror::Error;

/// Why a tool call's arguments didn't satisfy its schema.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required argument(s): {}", .0.join(", "))]
    MissingRequired(Vec<String>),
    #[error("argument '{field}' expected type {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },
    #[error("argument '{field}' must be one of [{}], got '{got}'", .allowed.join(", "))]
    EnumMismatch {
        field: String,
        allowed: Vec<String>,
        got: String,
    },
    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(String),
}

/// Validates `arguments` against a JSON Schema `{"type":"object",
/// "properties": {...}, "required": [...]}` value, the shape every
/// [`crate::registry::ToolSchema::parameters`] carries. Only the subset of
/// JSON Schema the Tool Registry actually renders is checked: presence of
/// required fields, primitive type agreement, and `enum` membership.
/// Unknown/extra properties are allowed through, matching how providers
/// themselves are permissive about extra keys a model might add.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), ValidationError> {
    let Value::Object(args) = arguments else {
        return Err(ValidationError::NotAnObject(type_name(arguments).into()));
    };

    let required: Vec<String> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let missing: Vec<String> = required
        .iter()
        .filter(|name| !args.contains_key(name.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingRequired(missing));
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (field, prop_schema) in properties {
        let Some(value) = args.get(field) else {
            continue;
        };

        if let Some(expected) = prop_schema.get("type").and_then(Value::as_str) {
            if !type_matches(expected, value) {
                return Err(ValidationError::TypeMismatch {
                    field: field.clone(),
                    expected: expected.to_string(),
                    got: type_name(value).to_string(),
                });
            }
        }

        if let Some(allowed) = prop_schema.get("enum").and_then(Value::as_array) {
            let allowed_strs: Vec<String> = allowed
                .iter()
                .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                .collect();
            let got = value.as_str().map(String::from).unwrap_or_else(|| value.to_string());
            if !allowed_strs.iter().any(|a| a == &got) {
                return Err(ValidationError::EnumMismatch {
                    field: field.clone(),
                    allowed: allowed_strs,
                    got,
                });
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
