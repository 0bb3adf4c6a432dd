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

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
    model: String,
    endpoint: String,
    api_key: Option<String>,
}

impl AnthropicClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            model: model.into(),
            endpoint: ANTHROPIC_API_URL.to_string(),
            api_key: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, request: &GenerationRequest) -> AnthropicRequest {
        AnthropicRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens,
            temperature: Some(request.temperature),
            messages: vec![ApiMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            system: request.system_prompt.clone(),
            stream: true,
        }
    }
}

// Anthropic API request types
#[derive(Serialize, Debug)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct ApiMessage {
    role: String,
    content: String,
}

// Anthropic API response types
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
#[allow(dead_code)]
enum SseData {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageInfo },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { index: usize },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: DeltaInfo },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta { delta: MessageDeltaInfo, usage: Option<UsageInfo> },
    #[serde(rename = "message_stop")]
    MessageStop {},
    #[serde(rename = "ping")]
    Ping {},
    #[serde(rename = "error")]
    Error { error: ApiError },
}

#[derive(Deserialize, Debug)]
struct MessageInfo {
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum DeltaInfo {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct MessageDeltaInfo {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

fn parse_sse_to_delta(event: SseEvent) -> Option<Result<StreamDelta>> {
    if event.data.trim() == "[DONE]" {
        return None;
    }

    let parsed: std::result::Result<SseData, _> = serde_json::from_str(&event.data);
    match parsed {
        Ok(data) => match data {
            SseData::MessageStart { message } => message.usage.map(|usage| {
                Ok(StreamDelta::Usage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                })
            }),
            SseData::ContentBlockDelta { delta, .. } => match delta {
                DeltaInfo::TextDelta { text } => Some(Ok(StreamDelta::TextDelta(text))),
                DeltaInfo::Other => None,
            },
            SseData::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    debug!(output_tokens = usage.output_tokens, "Anthropic usage update");
                }
                let stop = match delta.stop_reason.as_deref() {
                    Some("end_turn") => Some(StopReason::EndTurn),
                    Some("max_tokens") => Some(StopReason::MaxTokens),
                    Some("stop_sequence") => Some(StopReason::StopSequence),
                    _ => None,
                };
                stop.map(|s| Ok(StreamDelta::Stop(s)))
            }
            SseData::Error { error } => Some(Err(AgirError::LlmStream(error.message))),
            SseData::ContentBlockStart { .. }
            | SseData::ContentBlockStop { .. }
            | SseData::MessageStop {}
            | SseData::Ping {} => None,
        },
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse SSE data");
            None
        }
    }
}

impl LlmProvider for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let api_key = self
                .api_key
                .as_deref()
                .ok_or_else(|| AgirError::Config("Anthropic API key not set".into()))?;

            let body = self.build_request(&request);
            debug!(model = %self.model, "Sending Anthropic message");

            let response = self
                .http
                .post(&self.endpoint)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| AgirError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(AgirError::LlmRequest(format!(
                    "HTTP {}: {}",
                    status, body
                )));
            }

            read_completion(response.bytes_stream()).await
        })
    }
}

/// Decode a streamed Messages API body into its text.
async fn read_completion<S>(body: S) -> Result<String>
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Unpin,
{
    let delta_stream = SseStream::new(body).filter_map(|event| async move {
        match event {
            Ok(event) => parse_sse_to_delta(event),
            Err(e) => Some(Err(e)),
        }
    });

    collect_text(Box::pin(delta_stream)).await
}
