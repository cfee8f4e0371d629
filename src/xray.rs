//! Secondary stack-trace rendering for the tracing backend.
//!
//! Derives a structured cause document from an error's stack text. This is a
//! best-effort side channel: anything that cannot be derived yields an empty
//! string, never a failure.

use serde::Serialize;

use crate::errors::ErrorValue;

#[derive(Debug, Serialize)]
pub struct TraceDocument {
    pub working_directory: String,
    pub exceptions: Vec<TraceException>,
    pub paths: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TraceException {
    #[serde(rename = "type")]
    pub exception_type: String,
    pub message: String,
    pub stack: Vec<StackEntry>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct StackEntry {
    pub path: String,
    pub line: Option<u32>,
    pub label: String,
}

/// Render the cause document as JSON, or an empty string when the value is
/// not error-like or the document cannot be serialized.
pub fn to_formatted(value: &ErrorValue) -> String {
    if !value.is_error_like() {
        return String::new();
    }

    let ErrorValue::Error {
        name,
        message,
        stack: Some(stack),
        ..
    } = value
    else {
        return String::new();
    };

    let document = TraceDocument::from_parts(name, message, stack);
    serde_json::to_string(&document).unwrap_or_default()
}

impl TraceDocument {
    fn from_parts(name: &str, message: &str, stack: &str) -> Self {
        // The first stack line repeats the error header, not a frame.
        let entries: Vec<StackEntry> = stack.lines().skip(1).map(parse_stack_line).collect();

        let mut paths = Vec::new();
        for entry in &entries {
            if !paths.contains(&entry.path) {
                paths.push(entry.path.clone());
            }
        }

        Self {
            working_directory: std::env::current_dir()
                .map(|dir| dir.display().to_string())
                .unwrap_or_default(),
            exceptions: vec![TraceException {
                exception_type: name.to_string(),
                message: message.to_string(),
                stack: entries,
            }],
            paths,
        }
    }
}

/// Frames look like `<label> <path>:<line>:<column>`; a frame with no
/// separable label is all path.
fn parse_stack_line(raw: &str) -> StackEntry {
    let cleaned = raw.trim().replace(['(', ')'], "");
    let rest = match cleaned.find(' ') {
        Some(at) => &cleaned[at + 1..],
        None => cleaned.as_str(),
    };

    let label = rest.rfind(' ').map(|at| &rest[..at]);
    let location = match label {
        Some(label) if !label.is_empty() => {
            let at = rest.rfind(' ').unwrap_or(0);
            &rest[at + 1..]
        }
        _ => rest,
    };

    let mut parts = location.split(':');
    let path = parts.next().unwrap_or_default().to_string();
    let line = parts.next().and_then(|value| value.parse::<u32>().ok());

    StackEntry {
        path,
        line,
        label: match label {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => "anonymous".to_string(),
        },
    }
}
