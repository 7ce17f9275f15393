//! Two-stage action validation
//!
//! Stage one tries the fixed union (`bash`, `computer`, `str_replace_editor`).
//! Stage two accepts any other non-empty tool name with an object of params.
//! A payload naming a fixed tool never falls through to stage two, so a typo in
//! a computer action surfaces as an error instead of an extension call.

use serde_json::{json, Map, Value};
use thiserror::Error;

use super::types::{Action, ExtensionCall, ValidatedAction, FIXED_TOOLS};

/// A payload that matched neither the fixed union nor the extension schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid action for tool '{}': {message}", .tool.as_deref().unwrap_or("<missing>"))]
pub struct ValidationError {
    /// Offending tool name, if the payload carried one
    pub tool: Option<String>,
    pub message: String,
}

impl ValidationError {
    fn new(tool: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.map(str::to_string),
            message: message.into(),
        }
    }
}

enum FixedMismatch {
    NotFixed,
    Invalid(ValidationError),
}

/// Validate a raw `{tool, params}` payload
pub fn validate(raw: &Value) -> Result<ValidatedAction, ValidationError> {
    let object = raw
        .as_object()
        .ok_or_else(|| ValidationError::new(None, "payload must be a JSON object"))?;

    let tool = match object.get("tool") {
        Some(Value::String(name)) if !name.is_empty() => name.as_str(),
        Some(Value::String(_)) => return Err(ValidationError::new(Some(""), "tool name must not be empty")),
        Some(_) => return Err(ValidationError::new(None, "tool name must be a string")),
        None => return Err(ValidationError::new(None, "missing tool name")),
    };

    match validate_fixed(tool, raw) {
        Ok(action) => return Ok(ValidatedAction::Fixed(action)),
        Err(FixedMismatch::Invalid(err)) => return Err(err),
        Err(FixedMismatch::NotFixed) => {}
    }

    validate_extension(tool, object.get("params")).map(ValidatedAction::Extension)
}

/// Validate a tool-call intent given as a separate name and input
pub fn validate_call(name: &str, input: &Value) -> Result<ValidatedAction, ValidationError> {
    validate(&json!({ "tool": name, "params": input }))
}

fn validate_fixed(tool: &str, raw: &Value) -> Result<Action, FixedMismatch> {
    if !FIXED_TOOLS.contains(&tool) {
        return Err(FixedMismatch::NotFixed);
    }

    let action: Action = serde_json::from_value(raw.clone())
        .map_err(|e| FixedMismatch::Invalid(ValidationError::new(Some(tool), e.to_string())))?;

    action
        .check()
        .map_err(|msg| FixedMismatch::Invalid(ValidationError::new(Some(tool), msg)))?;

    Ok(action)
}

fn validate_extension(tool: &str, params: Option<&Value>) -> Result<ExtensionCall, ValidationError> {
    let params = match params {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(ValidationError::new(
                Some(tool),
                "params must be a key-value mapping",
            ))
        }
    };

    Ok(ExtensionCall {
        tool: tool.to_string(),
        params,
    })
}
