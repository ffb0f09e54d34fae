use async_trait::async_trait;
use core_types::{
    ChatAdapter, ChunkStream, GatewayError, Message, ModelParameters, ProbeReport, ProviderKind,
};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::framing::{Frame, decode_lines};
use crate::http::{
    Timeouts, build_client, ensure_success, normalize_endpoint, parse_json, payload_error,
    send_streaming, transport,
};

/// Adapter for a local Ollama daemon using the generate API.
pub struct OllamaAdapter {
    client: Client,
    generate_url: String,
    tags_url: String,
    model: String,
    timeouts: Timeouts,
}

impl OllamaAdapter {
    pub fn new(endpoint: &str, model: &str, timeouts: Timeouts) -> Result<Self, GatewayError> {
        let base = normalize_endpoint(endpoint)?;
        Ok(Self {
            client: build_client(timeouts)?,
            generate_url: format!("{base}/api/generate"),
            tags_url: format!("{base}/api/tags"),
            model: model.to_string(),
            timeouts,
        })
    }

    fn body(&self, messages: &[Message], parameters: &ModelParameters, stream: bool) -> Value {
        json!({
            "model": self.model,
            "prompt": transcript(messages),
            "stream": stream,
            "options": {
                "temperature": parameters.temperature,
                "num_predict": parameters.max_tokens,
                "top_p": parameters.top_p,
                "frequency_penalty": parameters.frequency_penalty,
                "presence_penalty": parameters.presence_penalty,
            },
        })
    }
}

/// Flattens a conversation into `role: content` lines.
pub(crate) fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|message| format!("{}: {}", message.role, message.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl ChatAdapter for OllamaAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn send(
        &self,
        messages: &[Message],
        parameters: &ModelParameters,
    ) -> Result<Message, GatewayError> {
        debug!(url = %self.generate_url, model = %self.model, "sending generate request");
        let response = self
            .client
            .post(&self.generate_url)
            .timeout(self.timeouts.request)
            .json(&self.body(messages, parameters, false))
            .send()
            .await
            .map_err(transport)?;
        let response = ensure_success(response).await?;
        let text = response.text().await.map_err(transport)?;

        let value = parse_json(&text)?;
        if let Some(message) = payload_error(&value) {
            return Err(GatewayError::InvalidResponse(message));
        }
        let content = value
            .get("response")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GatewayError::InvalidResponse("generate reply has no `response` field".to_string())
            })?;
        Ok(Message::assistant(content))
    }

    async fn stream(
        &self,
        messages: &[Message],
        parameters: &ModelParameters,
    ) -> Result<ChunkStream, GatewayError> {
        debug!(url = %self.generate_url, model = %self.model, "opening generate stream");
        let request = self
            .client
            .post(&self.generate_url)
            .timeout(self.timeouts.resource)
            .json(&self.body(messages, parameters, true));
        let response = send_streaming(request, self.timeouts.request).await?;
        let response = ensure_success(response).await?;
        Ok(decode_lines(response.bytes_stream(), decode_ndjson_line))
    }

    async fn probe(&self) -> Result<ProbeReport, GatewayError> {
        let response = self
            .client
            .get(&self.tags_url)
            .timeout(self.timeouts.request)
            .send()
            .await
            .map_err(transport)?;
        let response = ensure_success(response).await?;
        let status = response.status().as_u16();
        debug!(url = %self.tags_url, status, "probed ollama daemon");
        Ok(ProbeReport {
            status,
            auth_rejected: false,
        })
    }

    async fn list_models(&self) -> Result<Vec<String>, GatewayError> {
        let response = self
            .client
            .get(&self.tags_url)
            .timeout(self.timeouts.request)
            .send()
            .await
            .map_err(transport)?;
        let response = ensure_success(response).await?;
        let text = response.text().await.map_err(transport)?;
        let value = parse_json(&text)?;
        let models = value
            .get("models")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::InvalidResponse("tags reply has no `models`".to_string()))?;
        Ok(models
            .iter()
            .filter_map(|model| model.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}

fn decode_ndjson_line(line: &str) -> Result<Frame, GatewayError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Frame::Skip);
    }
    let value = parse_json(line)?;
    if let Some(message) = payload_error(&value) {
        return Err(GatewayError::InvalidResponse(message));
    }
    let text = value
        .get("response")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if value.get("done").and_then(Value::as_bool) == Some(true) {
        return Ok(Frame::Done(text));
    }
    Ok(Frame::Chunk(text))
}
