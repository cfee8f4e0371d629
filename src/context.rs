//! Per-invocation context derived from invoke headers and the environment.

use std::future::Future;

use chrono::Utc;
use http::HeaderMap;
use serde_json::Value;

use crate::errors::{ContextError, ErrorValue};
use crate::gate::CompletionGate;
use crate::runtime::BackgroundTasks;

pub const HEADER_ARN: &str = "lambda-runtime-invoked-function-arn";
pub const HEADER_REQUEST_ID: &str = "lambda-runtime-aws-request-id";
pub const HEADER_CLIENT_CONTEXT: &str = "lambda-runtime-client-context";
pub const HEADER_COGNITO_IDENTITY: &str = "lambda-runtime-cognito-identity";
pub const HEADER_DEADLINE_MS: &str = "lambda-runtime-deadline-ms";
pub const HEADER_TRACE_ID: &str = "lambda-runtime-trace-id";

pub const TRACE_ID_ENV: &str = "_X_AMZN_TRACE_ID";

/// View over one invocation's headers.
///
/// `http::HeaderMap` stores names lowercased, so lookup is case-insensitive
/// no matter how the control endpoint spelled them.
pub struct InvokeContext {
    headers: HeaderMap,
}

impl InvokeContext {
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// The invocation id. Absent or empty is unrecoverable for this
    /// invocation: there is nothing to report an outcome against.
    pub fn invoke_id(&self) -> Result<String, ContextError> {
        match self.header_value(HEADER_REQUEST_ID) {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(ContextError::MissingInvocationId),
        }
    }

    /// Propagate the tracing token into the environment for the duration of
    /// the invocation; clear it when the invocation carries none.
    pub fn forward_trace_context(&self) {
        match self.header_value(HEADER_TRACE_ID) {
            Some(token) if !token.is_empty() => std::env::set_var(TRACE_ID_ENV, token),
            _ => std::env::remove_var(TRACE_ID_ENV),
        }
    }

    /// Parse the header-borne invocation data. JSON-valued headers fail with
    /// an error naming the field; that failure belongs to the invocation,
    /// not the process.
    pub fn header_data(&self) -> Result<HeaderData, ContextError> {
        Ok(HeaderData {
            aws_request_id: self.header_value(HEADER_REQUEST_ID).map(str::to_string),
            invoked_function_arn: self.header_value(HEADER_ARN).map(str::to_string),
            client_context: parse_json_header(
                self.header_value(HEADER_CLIENT_CONTEXT),
                "ClientContext",
            )?,
            identity: parse_json_header(
                self.header_value(HEADER_COGNITO_IDENTITY),
                "CognitoIdentity",
            )?,
            deadline_ms: self
                .header_value(HEADER_DEADLINE_MS)
                .and_then(|raw| raw.trim().parse::<i64>().ok()),
        })
    }
}

fn parse_json_header(
    raw: Option<&str>,
    name: &'static str,
) -> Result<Option<Value>, ContextError> {
    match raw {
        None => Ok(None),
        Some(raw) => serde_json::from_str(raw)
            .map(Some)
            .map_err(|err| ContextError::MalformedHeaderJson {
                name,
                detail: err.to_string(),
            }),
    }
}

/// Invocation metadata carried in headers.
#[derive(Debug, Clone)]
pub struct HeaderData {
    pub aws_request_id: Option<String>,
    pub invoked_function_arn: Option<String>,
    pub client_context: Option<Value>,
    pub identity: Option<Value>,
    pub deadline_ms: Option<i64>,
}

/// Process-wide values read from the environment, captured once per
/// invocation and immutable for its duration.
#[derive(Debug, Clone)]
pub struct EnvironmentSnapshot {
    pub function_name: Option<String>,
    pub function_version: Option<String>,
    pub memory_limit_in_mb: Option<String>,
    pub log_group_name: Option<String>,
    pub log_stream_name: Option<String>,
}

impl EnvironmentSnapshot {
    pub fn capture() -> Self {
        Self {
            function_name: std::env::var("AWS_LAMBDA_FUNCTION_NAME").ok(),
            function_version: std::env::var("AWS_LAMBDA_FUNCTION_VERSION").ok(),
            memory_limit_in_mb: std::env::var("AWS_LAMBDA_FUNCTION_MEMORY_SIZE").ok(),
            log_group_name: std::env::var("AWS_LAMBDA_LOG_GROUP_NAME").ok(),
            log_stream_name: std::env::var("AWS_LAMBDA_LOG_STREAM_NAME").ok(),
        }
    }
}

/// The context object handed to the handler: environment and header data plus
/// the completion entry points.
pub struct Context {
    pub function_name: Option<String>,
    pub function_version: Option<String>,
    pub memory_limit_in_mb: Option<String>,
    pub log_group_name: Option<String>,
    pub log_stream_name: Option<String>,
    pub aws_request_id: Option<String>,
    pub invoked_function_arn: Option<String>,
    pub client_context: Option<Value>,
    pub identity: Option<Value>,
    deadline_ms: Option<i64>,
    gate: CompletionGate,
    background: BackgroundTasks,
}

impl Context {
    pub(crate) fn new(
        environment: EnvironmentSnapshot,
        headers: HeaderData,
        gate: CompletionGate,
        background: BackgroundTasks,
    ) -> Self {
        Self {
            function_name: environment.function_name,
            function_version: environment.function_version,
            memory_limit_in_mb: environment.memory_limit_in_mb,
            log_group_name: environment.log_group_name,
            log_stream_name: environment.log_stream_name,
            aws_request_id: headers.aws_request_id,
            invoked_function_arn: headers.invoked_function_arn,
            client_context: headers.client_context,
            identity: headers.identity,
            deadline_ms: headers.deadline_ms,
            gate,
            background,
        }
    }

    /// Milliseconds until the deadline. NaN when the invocation carried no
    /// deadline header; callers must tolerate it.
    pub fn remaining_time_millis(&self) -> f64 {
        match self.deadline_ms {
            Some(deadline) => deadline as f64 - Utc::now().timestamp_millis() as f64,
            None => f64::NAN,
        }
    }

    pub fn succeed(&self, result: Value) {
        self.gate.succeed(result);
    }

    pub fn fail(&self, error: Option<ErrorValue>) {
        self.gate.fail(error);
    }

    pub fn done(&self, error: Option<ErrorValue>, result: Option<Value>) {
        self.gate.done(error, result);
    }

    pub fn callback(&self, error: Option<ErrorValue>, result: Option<Value>) {
        self.gate.callback(error, result);
    }

    pub fn wait_for_quiescence(&self) -> bool {
        self.gate.wait_for_quiescence()
    }

    pub fn set_wait_for_quiescence(&self, value: bool) {
        self.gate.set_wait_for_quiescence(value);
    }

    /// Start background work that the loop will wait for (unless the
    /// quiescence flag is cleared) before fetching the next invocation.
    pub fn spawn_background<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.background.spawn(future);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mixed = InvokeContext::new(headers_with("Lambda-Runtime-Aws-Request-Id", "id-1"));
        let lower = InvokeContext::new(headers_with("lambda-runtime-aws-request-id", "id-1"));

        assert_eq!(mixed.invoke_id().unwrap(), "id-1");
        assert_eq!(lower.invoke_id().unwrap(), "id-1");
    }

    #[test]
    fn missing_or_empty_invoke_id_fails() {
        let absent = InvokeContext::new(HeaderMap::new());
        assert!(matches!(
            absent.invoke_id(),
            Err(ContextError::MissingInvocationId)
        ));

        let empty = InvokeContext::new(headers_with(HEADER_REQUEST_ID, ""));
        assert!(matches!(
            empty.invoke_id(),
            Err(ContextError::MissingInvocationId)
        ));
    }

    #[test]
    fn malformed_client_context_names_the_field() {
        let context = InvokeContext::new(headers_with(HEADER_CLIENT_CONTEXT, "{not json"));
        let err = context.header_data().unwrap_err();
        assert!(err.to_string().contains("ClientContext"));
    }

    #[test]
    fn malformed_identity_names_the_field() {
        let context = InvokeContext::new(headers_with(HEADER_COGNITO_IDENTITY, "[oops"));
        let err = context.header_data().unwrap_err();
        assert!(err.to_string().contains("CognitoIdentity"));
    }

    #[test]
    fn valid_json_headers_parse() {
        let mut headers = headers_with(HEADER_CLIENT_CONTEXT, r#"{"env":{"locale":"en"}}"#);
        headers.insert(
            HeaderName::from_static(HEADER_DEADLINE_MS),
            HeaderValue::from_static("1700000000000"),
        );

        let data = InvokeContext::new(headers).header_data().unwrap();
        assert_eq!(data.client_context.unwrap()["env"]["locale"], "en");
        assert_eq!(data.deadline_ms, Some(1_700_000_000_000));
    }

    fn bare_context(deadline_ms: Option<i64>) -> Context {
        let (gate, _rx) = CompletionGate::new();
        Context::new(
            EnvironmentSnapshot {
                function_name: None,
                function_version: None,
                memory_limit_in_mb: None,
                log_group_name: None,
                log_stream_name: None,
            },
            HeaderData {
                aws_request_id: Some("id-1".to_string()),
                invoked_function_arn: None,
                client_context: None,
                identity: None,
                deadline_ms,
            },
            gate,
            BackgroundTasks::unattended(),
        )
    }

    #[test]
    fn remaining_time_decreases_with_wall_clock() {
        let deadline = Utc::now().timestamp_millis() + 5_000;
        let context = bare_context(Some(deadline));

        let first = context.remaining_time_millis();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let second = context.remaining_time_millis();

        assert!(first > second);
        assert!(first <= 5_000.0);
    }

    #[test]
    fn remaining_time_is_nan_without_a_deadline() {
        let context = bare_context(None);
        assert!(context.remaining_time_millis().is_nan());
    }
}
