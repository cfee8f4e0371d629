//! HTTP client for the runtime control endpoint.
//!
//! One persistent connection, one outstanding request at a time: invocations
//! are delivered strictly sequentially, so a single reusable socket is all
//! the pooling this client needs. Transport failures are fatal to the
//! process; a broken control channel cannot safely keep serving invocations.

use bytes::Bytes;
use http::HeaderMap;
use serde_json::Value;

use crate::errors::{self, ErrorEnvelope, ErrorValue};
use crate::xray;

const ERROR_TYPE_HEADER: &str = "lambda-runtime-function-error-type";
const XRAY_ERROR_CAUSE_HEADER: &str = "lambda-runtime-function-xray-error-cause";

const USER_AGENT: &str = concat!("aws-lambda-rust/", env!("CARGO_PKG_VERSION"));

/// One unit of work delivered by the control endpoint.
#[derive(Debug)]
pub struct NextInvocation {
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct RuntimeApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl RuntimeApiClient {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .http1_only()
            .pool_max_idle_per_host(1)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { base_url, http })
    }

    /// Long-poll for the next invocation. Blocks until the control endpoint
    /// delivers one.
    pub async fn next_invocation(&self) -> anyhow::Result<NextInvocation> {
        let url = format!("{}/2018-06-01/runtime/invocation/next", self.base_url);
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("fetch next invocation failed (status {status})");
        }

        let headers = resp.headers().clone();
        let body = resp.bytes().await?;

        Ok(NextInvocation { headers, body })
    }

    pub async fn post_invocation_response(&self, id: &str, response: &Value) -> anyhow::Result<()> {
        let path = format!("/2018-06-01/runtime/invocation/{id}/response");
        self.post(&path, serialize_or_null(response), Vec::new()).await
    }

    /// Report an invocation failure. The envelope travels as the body; the
    /// error type and the tracing cause (empty for non-error values) travel
    /// as headers.
    pub async fn post_invocation_error(&self, id: &str, error: &ErrorValue) -> anyhow::Result<()> {
        let envelope = errors::to_runtime_response(error);
        let cause = xray::to_formatted(error);
        let path = format!("/2018-06-01/runtime/invocation/{id}/error");

        self.post(
            &path,
            serialize_envelope(&envelope),
            vec![
                (ERROR_TYPE_HEADER, envelope.error_type.clone()),
                (XRAY_ERROR_CAUSE_HEADER, cause),
            ],
        )
        .await
    }

    pub async fn post_init_error(&self, error: &ErrorValue) -> anyhow::Result<()> {
        let envelope = errors::to_runtime_response(error);
        self.post(
            "/2018-06-01/runtime/init/error",
            serialize_envelope(&envelope),
            vec![(ERROR_TYPE_HEADER, envelope.error_type.clone())],
        )
        .await
    }

    async fn post(
        &self,
        path: &str,
        body: Vec<u8>,
        headers: Vec<(&'static str, String)>,
    ) -> anyhow::Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .post(url)
            .header(http::header::CONTENT_TYPE, "application/json");

        for (name, value) in headers {
            // Header values must be visible ASCII; anything else would turn a
            // report into a transport failure, so sanitize instead.
            let value = http::HeaderValue::from_str(&value)
                .unwrap_or_else(|_| http::HeaderValue::from_static(""));
            req = req.header(name, value);
        }

        let resp = req.body(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("post to {path} failed (status {status})");
        }
        Ok(())
    }
}

fn serialize_or_null(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec())
}

fn serialize_envelope(envelope: &ErrorEnvelope) -> Vec<u8> {
    serde_json::to_vec(envelope).unwrap_or_else(|_| {
        br#"{"errorType":"handled","errorMessage":"unable to serialize error body","trace":[]}"#
            .to_vec()
    })
}
