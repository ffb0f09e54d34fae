use async_trait::async_trait;
use core_types::{
    ChatAdapter, ChunkStream, GatewayError, Message, ModelParameters, ProbeReport, ProviderKind,
};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::framing::{Frame, decode_lines};
use crate::http::{
    Timeouts, build_client, ensure_success, normalize_endpoint, payload_error, send_streaming,
    transport,
};

const CHAT_COMPLETIONS_SUFFIX: &str = "/chat/completions";

/// Adapter for any backend speaking the OpenAI chat-completions protocol.
pub struct OpenAiAdapter {
    client: Client,
    chat_url: String,
    models_url: String,
    secret: String,
    model: String,
    timeouts: Timeouts,
}

impl OpenAiAdapter {
    pub fn new(
        endpoint: &str,
        secret: &str,
        model: &str,
        timeouts: Timeouts,
    ) -> Result<Self, GatewayError> {
        let endpoint = normalize_endpoint(endpoint)?;
        let (chat_url, base) = match endpoint.strip_suffix(CHAT_COMPLETIONS_SUFFIX) {
            Some(base) => (endpoint.clone(), base.to_string()),
            None => (format!("{endpoint}{CHAT_COMPLETIONS_SUFFIX}"), endpoint.clone()),
        };
        Ok(Self {
            client: build_client(timeouts)?,
            chat_url,
            models_url: format!("{base}/models"),
            secret: secret.trim().to_string(),
            model: model.to_string(),
            timeouts,
        })
    }

    fn body(&self, messages: &[Message], parameters: &ModelParameters, stream: bool) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|message| json!({ "role": message.role.as_str(), "content": message.content }))
            .collect();
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": parameters.temperature,
            "max_tokens": parameters.max_tokens,
            "top_p": parameters.top_p,
            "frequency_penalty": parameters.frequency_penalty,
            "presence_penalty": parameters.presence_penalty,
            "stream": stream,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.secret.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.secret)
        }
    }
}

#[async_trait]
impl ChatAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiCompatible
    }

    async fn send(
        &self,
        messages: &[Message],
        parameters: &ModelParameters,
    ) -> Result<Message, GatewayError> {
        debug!(url = %self.chat_url, model = %self.model, "sending chat completion");
        let request = self
            .client
            .post(&self.chat_url)
            .timeout(self.timeouts.request)
            .json(&self.body(messages, parameters, false));
        let response = self.authorized(request).send().await.map_err(transport)?;
        let response = ensure_success(response).await?;
        let text = response.text().await.map_err(transport)?;
        Ok(Message::assistant(completion_content(&text)?))
    }

    async fn stream(
        &self,
        messages: &[Message],
        parameters: &ModelParameters,
    ) -> Result<ChunkStream, GatewayError> {
        debug!(url = %self.chat_url, model = %self.model, "opening chat completion stream");
        let request = self
            .client
            .post(&self.chat_url)
            .timeout(self.timeouts.resource)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&self.body(messages, parameters, true));
        let response = send_streaming(self.authorized(request), self.timeouts.request).await?;
        let response = ensure_success(response).await?;
        Ok(decode_lines(response.bytes_stream(), decode_sse_line))
    }

    async fn probe(&self) -> Result<ProbeReport, GatewayError> {
        let request = self
            .client
            .get(&self.models_url)
            .timeout(self.timeouts.request);
        let response = self.authorized(request).send().await.map_err(transport)?;
        let status = response.status().as_u16();
        debug!(url = %self.models_url, status, "probed openai-compatible endpoint");
        if status >= 500 {
            return Err(GatewayError::ServerError(status));
        }
        Ok(ProbeReport {
            status,
            auth_rejected: matches!(status, 401 | 403),
        })
    }
}

/// Content of a non-streaming completion; the raw body when no message
/// content is present.
fn completion_content(text: &str) -> Result<String, GatewayError> {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Ok(text.to_string());
    };
    if let Some(message) = payload_error(&value) {
        return Err(GatewayError::InvalidResponse(message));
    }
    Ok(value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| text.to_string()))
}

fn decode_sse_line(line: &str) -> Result<Frame, GatewayError> {
    let Some(payload) = line.trim().strip_prefix("data:") else {
        return Ok(Frame::Skip);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(Frame::Skip);
    }
    if payload == "[DONE]" {
        return Ok(Frame::Done(String::new()));
    }

    let value: Value = serde_json::from_str(payload)
        .map_err(|err| GatewayError::InvalidResponse(format!("malformed stream payload: {err}")))?;
    if let Some(message) = payload_error(&value) {
        return Err(GatewayError::InvalidResponse(message));
    }
    let text = value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok(Frame::Chunk(text.to_string()))
}
