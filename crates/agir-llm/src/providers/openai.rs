use futures::future::BoxFuture;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use agir_core::error::{AgirError, Result};
use agir_core::traits::LlmProvider;
use agir_core::types::GenerationRequest;

use crate::streaming::{collect_text, SseEvent, SseStream, StopReason, StreamDelta};

pub const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
    name: String,
    model: String,
    endpoint: String,
    api_key: Option<String>,
    extra_headers: Vec<(String, String)>,
}

impl OpenAiClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            name: "openai".to_string(),
            model: model.into(),
            endpoint: OPENAI_API_URL.to_string(),
            api_key: None,
            extra_headers: Vec::new(),
        }
    }

    /// Provider name reported in logs (e.g. "ollama" for a preset).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.extra_headers = headers;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_o_series(&self) -> bool {
        self.model.starts_with("o1") || self.model.starts_with("o3") || self.model.starts_with("o4")
    }

    fn build_request(&self, request: &GenerationRequest) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_prompt {
            messages.push(OaiMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(OaiMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        let o_series = self.is_o_series();
        ChatRequest {
            model: self.model.clone(),
            messages,
            // o-series models reject max_tokens and temperature
            max_tokens: if o_series { None } else { Some(request.max_tokens) },
            max_completion_tokens: if o_series { Some(request.max_tokens) } else { None },
            temperature: if o_series { None } else { Some(request.temperature) },
            stream: true,
        }
    }
}

// Request types
#[derive(Serialize, Debug)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct OaiMessage {
    role: String,
    content: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDeltaContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct ChunkError {
    message: String,
}

fn parse_chunk(event: SseEvent) -> Vec<Result<StreamDelta>> {
    if event.data.trim() == "[DONE]" {
        return vec![];
    }

    let chunk: StreamChunk = match serde_json::from_str(&event.data) {
        Ok(c) => c,
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse OpenAI SSE chunk");
            return vec![];
        }
    };

    if let Some(err) = chunk.error {
        return vec![Err(AgirError::LlmStream(err.message))];
    }

    let mut deltas = Vec::new();

    if let Some(usage) = chunk.usage {
        deltas.push(Ok(StreamDelta::Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }));
    }

    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(text) = choice.delta.and_then(|d| d.content) {
            if !text.is_empty() {
                deltas.push(Ok(StreamDelta::TextDelta(text)));
            }
        }
        if let Some(reason) = choice.finish_reason {
            let stop = match reason.as_str() {
                "length" => StopReason::MaxTokens,
                _ => StopReason::EndTurn,
            };
            deltas.push(Ok(StreamDelta::Stop(stop)));
        }
    }

    deltas
}

impl LlmProvider for OpenAiClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let body = self.build_request(&request);
            debug!(provider = %self.name, model = %self.model, "Sending chat completion");

            let mut req = self.http.post(&self.endpoint).json(&body);

            if let Some(api_key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            for (k, v) in &self.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req
                .send()
                .await
                .map_err(|e| AgirError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(AgirError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            read_completion(response.bytes_stream()).await
        })
    }
}

/// Decode a streamed chat completion body into its text.
async fn read_completion<S>(body: S) -> Result<String>
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Unpin,
{
    let delta_stream = SseStream::new(body)
        .map(|event| match event {
            Ok(event) => futures::stream::iter(parse_chunk(event)),
            Err(e) => futures::stream::iter(vec![Err(e)]),
        })
        .flatten();

    collect_text(Box::pin(delta_stream)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use agir_core::types::GenerationParams;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_request_body_with_system_prompt() {
        let client = OpenAiClient::new("gpt-4o");
        let req = GenerationRequest::new("Hello", GenerationParams::default()).with_system("Be brief");
        let body = serde_json::to_value(client.build_request(&req)).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hello");
        assert_eq!(body["max_tokens"], 1000);
        assert!((body["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_o_series_drops_temperature() {
        let client = OpenAiClient::new("o3-mini");
        let req = GenerationRequest::new("Hi", GenerationParams::default());
        let body = serde_json::to_value(client.build_request(&req)).unwrap();
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["max_completion_tokens"], 1000);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_chunk_text_and_stop() {
        let deltas = parse_chunk(event(
            r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#,
        ));
        assert_eq!(deltas.len(), 1);
        assert!(matches!(&deltas[0], Ok(StreamDelta::TextDelta(t)) if t == "Hi"));

        let deltas = parse_chunk(event(r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#));
        assert!(matches!(deltas[0], Ok(StreamDelta::Stop(StopReason::MaxTokens))));

        assert!(parse_chunk(event("[DONE]")).is_empty());
        assert!(parse_chunk(event("garbage")).is_empty());
    }

    fn body(chunks: &[&'static str]) -> impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Unpin {
        let chunks: Vec<std::result::Result<Bytes, reqwest::Error>> = chunks
            .iter()
            .copied()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        futures::stream::iter(chunks)
    }

    #[tokio::test]
    async fn test_read_completion_joins_chunks() {
        let text = read_completion(body(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ]))
        .await
        .unwrap();
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn test_read_completion_rejects_non_sse_body() {
        let err = read_completion(body(&["<html><body>502 Bad Gateway</body></html>"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AgirError::LlmParse(_)));

        // A server that ignored `stream: true`
        let err = read_completion(body(&[
            r#"{"choices":[{"message":{"role":"assistant","content":"real answer"}}]}"#,
        ]))
        .await
        .unwrap_err();
        assert!(matches!(err, AgirError::LlmParse(_)));
    }

    #[tokio::test]
    async fn test_read_completion_rejects_unparseable_events() {
        let err = read_completion(body(&["data: not json\n\n", "data: still not json\n\n"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AgirError::LlmParse(_)));
    }

    #[test]
    fn test_parse_chunk_error() {
        let deltas = parse_chunk(event(r#"{"error":{"message":"model not found"}}"#));
        assert!(matches!(&deltas[0], Err(AgirError::LlmStream(m)) if m == "model not found"));
    }
}
