use std::time::Duration;

use core_types::GatewayError;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde_json::Value;
use tracing::warn;

/// Per-adapter limits. `request` bounds a whole non-streaming exchange and the
/// wait for streaming headers; `resource` bounds a full streaming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub request: Duration,
    pub resource: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(60),
            resource: Duration::from_secs(300),
        }
    }
}

impl Timeouts {
    pub fn from_secs(request: u64, resource: u64) -> Self {
        Self {
            request: Duration::from_secs(request),
            resource: Duration::from_secs(resource),
        }
    }
}

pub(crate) fn build_client(timeouts: Timeouts) -> Result<Client, GatewayError> {
    Client::builder()
        .connect_timeout(timeouts.request)
        .build()
        .map_err(|err| GatewayError::Transport(format!("failed to build http client: {err}")))
}

/// Validates an endpoint and returns it without trailing slashes.
pub(crate) fn normalize_endpoint(endpoint: &str) -> Result<String, GatewayError> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    let url = Url::parse(trimmed).map_err(|_| GatewayError::InvalidUrl)?;
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(trimmed.to_string()),
        _ => Err(GatewayError::InvalidUrl),
    }
}

pub(crate) fn transport(err: reqwest::Error) -> GatewayError {
    if err.is_builder() {
        GatewayError::InvalidUrl
    } else {
        GatewayError::Transport(err.to_string())
    }
}

/// Sends a request whose body will be streamed, bounding only the wait for
/// response headers.
pub(crate) async fn send_streaming(
    builder: RequestBuilder,
    deadline: Duration,
) -> Result<Response, GatewayError> {
    match tokio::time::timeout(deadline, builder.send()).await {
        Ok(result) => result.map_err(transport),
        Err(_) => Err(GatewayError::Transport(format!(
            "no response headers within {}s",
            deadline.as_secs()
        ))),
    }
}

pub(crate) async fn ensure_success(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), "backend rejected request");
    Err(GatewayError::from_status(status.as_u16(), &body))
}

/// Extracts the message of an `error` field carried inside a payload.
pub(crate) fn payload_error(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    match error {
        Value::Null => None,
        Value::String(message) => Some(message.clone()),
        other => Some(
            other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        ),
    }
}

pub(crate) fn parse_json(text: &str) -> Result<Value, GatewayError> {
    serde_json::from_str(text)
        .map_err(|err| GatewayError::InvalidResponse(format!("malformed json payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_valid_endpoints() {
        assert_eq!(
            normalize_endpoint(" https://api.openai.com/v1/ ").expect("valid"),
            "https://api.openai.com/v1"
        );
        assert_eq!(
            normalize_endpoint("http://localhost:11434").expect("valid"),
            "http://localhost:11434"
        );
    }

    #[test]
    fn rejects_unusable_endpoints() {
        for endpoint in ["", "not a url", "ftp://example.com", "file:///tmp/x"] {
            assert_eq!(
                normalize_endpoint(endpoint),
                Err(GatewayError::InvalidUrl),
                "{endpoint}"
            );
        }
    }

    #[test]
    fn reads_error_fields() {
        assert_eq!(
            payload_error(&json!({"error": {"message": "model not found"}})),
            Some("model not found".to_string())
        );
        assert_eq!(
            payload_error(&json!({"error": "boom"})),
            Some("boom".to_string())
        );
        assert_eq!(payload_error(&json!({"error": null})), None);
        assert_eq!(payload_error(&json!({"response": "ok"})), None);
    }
}
