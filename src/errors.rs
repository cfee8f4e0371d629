//! Error normalization for invocation outcomes.
//!
//! A handler can fail with anything: a structured error, a bare string, or an
//! arbitrary JSON value. Everything funnels through [`ErrorValue`] and is
//! rendered into the canonical [`ErrorEnvelope`] posted to the control
//! endpoint. Rendering is total: no input, however malformed, makes it fail.

use std::any::Any;
use std::backtrace::Backtrace;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Diagnostic used when an error value claims to be structured but is missing
/// the pieces needed to report it.
pub const FALLBACK_ERROR_MESSAGE: &str = "callback called with Error argument, but there was a \
     problem while retrieving one or more of its message, name, and stack";

/// Invocation-context failures surfaced while reading invoke metadata.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The request-id header was absent or empty. There is no id to report
    /// against, so this surfaces through the generic uncaught path.
    #[error("invocation id is missing or invalid")]
    MissingInvocationId,

    /// A JSON-valued header could not be parsed.
    #[error("cannot parse {name} as json: {detail}")]
    MalformedHeaderJson { name: &'static str, detail: String },
}

/// A value reported as an invocation failure.
///
/// Tagged rendition of "whatever the handler threw": a structured error
/// carrying name/message/stack plus any extra enumerable properties, a bare
/// string, or an arbitrary JSON value.
#[derive(Debug, Clone)]
pub enum ErrorValue {
    Error {
        name: String,
        message: String,
        stack: Option<String>,
        properties: Map<String, Value>,
    },
    Message(String),
    Value(Value),
}

impl ErrorValue {
    /// Structured error with a captured backtrace.
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            name: name.into(),
            message: message.into(),
            stack: Some(Backtrace::force_capture().to_string()),
            properties: Map::new(),
        }
    }

    /// Attach an extra enumerable property, preserved by [`to_formatted`].
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        if let Self::Error { properties, .. } = &mut self {
            properties.insert(key.into(), value);
        }
        self
    }

    /// A panic that escaped the handler.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::error("Runtime.HandlerPanic", panic_message(payload))
    }

    /// A panic that escaped a background task spawned by the handler.
    pub fn from_background_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::error("Runtime.BackgroundTaskPanic", panic_message(payload))
    }

    /// Whether the value carries enough structure to derive a trace from.
    pub fn is_error_like(&self) -> bool {
        matches!(self, Self::Error { stack: Some(stack), .. } if !stack.is_empty())
    }
}

impl From<ContextError> for ErrorValue {
    fn from(err: ContextError) -> Self {
        let name = match &err {
            ContextError::MissingInvocationId => "Runtime.MissingInvocationId",
            ContextError::MalformedHeaderJson { .. } => "Runtime.MalformedHeaderJson",
        };
        Self::error(name, err.to_string())
    }
}

impl From<&str> for ErrorValue {
    fn from(message: &str) -> Self {
        Self::Message(message.to_string())
    }
}

impl From<String> for ErrorValue {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "panic with a non-string payload".to_string(),
        },
    }
}

/// Canonical error body posted to the control endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "errorType")]
    pub error_type: String,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
    pub trace: Vec<String>,
}

impl ErrorEnvelope {
    fn handled_fallback() -> Self {
        Self {
            error_type: "handled".to_string(),
            error_message: FALLBACK_ERROR_MESSAGE.to_string(),
            trace: Vec::new(),
        }
    }
}

/// Convert any error value into a postable envelope. Total by construction: a
/// structured error missing its stack degrades to a fixed "handled" envelope
/// instead of failing.
pub fn to_runtime_response(value: &ErrorValue) -> ErrorEnvelope {
    match value {
        ErrorValue::Error {
            name,
            message,
            stack: Some(stack),
            ..
        } if !stack.is_empty() => ErrorEnvelope {
            error_type: name.clone(),
            error_message: message.clone(),
            trace: stack.lines().map(str::to_string).collect(),
        },
        ErrorValue::Error { .. } => ErrorEnvelope::handled_fallback(),
        ErrorValue::Message(message) => ErrorEnvelope {
            error_type: "string".to_string(),
            error_message: message.clone(),
            trace: Vec::new(),
        },
        ErrorValue::Value(value) => ErrorEnvelope {
            error_type: json_type_name(value).to_string(),
            error_message: display_value(value),
            trace: Vec::new(),
        },
    }
}

/// Render a leading-tab-prefixed JSON document for log output, preserving the
/// error's extra properties alongside the standard fields. Falls back to the
/// plain envelope if the enriched form cannot be serialized.
pub fn to_formatted(value: &ErrorValue) -> String {
    match serde_json::to_string(&enriched(value)) {
        Ok(json) => format!("\t{json}"),
        Err(_) => {
            let envelope = to_runtime_response(value);
            let json = serde_json::to_string(&envelope)
                .unwrap_or_else(|_| format!(r#"{{"errorType":"{}"}}"#, envelope.error_type));
            format!("\t{json}")
        }
    }
}

/// Name, message, and stack are hoisted into explicit fields so they survive
/// serialization next to the user-provided properties.
fn enriched(value: &ErrorValue) -> Value {
    match value {
        ErrorValue::Error {
            name,
            message,
            stack,
            properties,
        } => {
            let mut doc = Map::new();
            doc.insert("errorType".to_string(), Value::String(name.clone()));
            doc.insert("errorMessage".to_string(), Value::String(message.clone()));
            for (key, value) in properties {
                doc.insert(key.clone(), value.clone());
            }
            if let Some(stack) = stack {
                doc.insert(
                    "stack".to_string(),
                    Value::Array(stack.lines().map(|l| Value::String(l.to_string())).collect()),
                );
            }
            Value::Object(doc)
        }
        ErrorValue::Message(message) => Value::String(message.clone()),
        ErrorValue::Value(value) => value.clone(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Null | Value::Array(_) | Value::Object(_) => "object",
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_error_maps_to_envelope_with_trace() {
        let value = ErrorValue::Error {
            name: "Error".to_string(),
            message: "boom".to_string(),
            stack: Some("Error: boom\nat handler /var/task/app.rs:3:1".to_string()),
            properties: Map::new(),
        };

        let envelope = to_runtime_response(&value);
        assert_eq!(envelope.error_type, "Error");
        assert_eq!(envelope.error_message, "boom");
        assert_eq!(envelope.trace.len(), 2);
    }

    #[test]
    fn missing_stack_degrades_to_handled_envelope() {
        let value = ErrorValue::Error {
            name: "Error".to_string(),
            message: "boom".to_string(),
            stack: None,
            properties: Map::new(),
        };

        let envelope = to_runtime_response(&value);
        assert_eq!(envelope.error_type, "handled");
        assert_eq!(envelope.error_message, FALLBACK_ERROR_MESSAGE);
        assert!(envelope.trace.is_empty());

        let empty = ErrorValue::Error {
            name: "Error".to_string(),
            message: "boom".to_string(),
            stack: Some(String::new()),
            properties: Map::new(),
        };
        assert_eq!(to_runtime_response(&empty).error_type, "handled");
    }

    #[test]
    fn bare_string_maps_to_string_envelope() {
        let envelope = to_runtime_response(&ErrorValue::Message("handled".to_string()));
        assert_eq!(envelope.error_type, "string");
        assert_eq!(envelope.error_message, "handled");
        assert!(envelope.trace.is_empty());
    }

    #[test]
    fn arbitrary_values_map_to_typeof_style_envelopes() {
        let number = to_runtime_response(&ErrorValue::Value(json!(7)));
        assert_eq!(number.error_type, "number");
        assert_eq!(number.error_message, "7");

        let object = to_runtime_response(&ErrorValue::Value(json!({"oops": true})));
        assert_eq!(object.error_type, "object");

        let null = to_runtime_response(&ErrorValue::Value(Value::Null));
        assert_eq!(null.error_type, "object");
    }

    #[test]
    fn formatted_output_preserves_extra_properties() {
        let value = ErrorValue::Error {
            name: "ExtendedError".to_string(),
            message: "custom message".to_string(),
            stack: Some("ExtendedErrorStack".to_string()),
            properties: Map::new(),
        }
        .with_property("code", json!(100))
        .with_property("customProperty", json!("ExtendedErrorCustomProperty"));

        let formatted = to_formatted(&value);
        assert!(formatted.starts_with('\t'));

        let doc: Value = serde_json::from_str(formatted.trim()).unwrap();
        assert_eq!(doc["errorType"], "ExtendedError");
        assert_eq!(doc["errorMessage"], "custom message");
        assert_eq!(doc["code"], 100);
        assert_eq!(doc["customProperty"], "ExtendedErrorCustomProperty");
        assert_eq!(doc["stack"], json!(["ExtendedErrorStack"]));
    }

    #[test]
    fn formatted_output_never_fails_for_plain_values() {
        let formatted = to_formatted(&ErrorValue::Value(json!({"deep": {"nested": [1, 2, 3]}})));
        assert!(formatted.starts_with('\t'));
        assert!(serde_json::from_str::<Value>(formatted.trim()).is_ok());
    }

    #[test]
    fn panic_payloads_become_structured_errors() {
        let value = ErrorValue::from_panic(Box::new("kaboom".to_string()));
        let envelope = to_runtime_response(&value);
        assert_eq!(envelope.error_type, "Runtime.HandlerPanic");
        assert_eq!(envelope.error_message, "kaboom");
    }

    #[test]
    fn context_errors_carry_the_field_name() {
        let err = ContextError::MalformedHeaderJson {
            name: "ClientContext",
            detail: "expected value at line 1 column 2".to_string(),
        };
        let envelope = to_runtime_response(&err.into());
        assert_eq!(envelope.error_type, "Runtime.MalformedHeaderJson");
        assert!(envelope.error_message.contains("ClientContext"));
    }
}
