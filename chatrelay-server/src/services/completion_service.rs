//! OpenAI-compatible streaming chat completions client.

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use shared::config::server::CompletionConfig;
use shared::llms::{
    CompletionError, CompletionRequest, CompletionResult, CompletionSource, FragmentStream,
};
use shared::models::ChatMessage;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes are buffered until a full line arrives, so chunk boundaries that
/// split a line or a UTF-8 sequence are harmless.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // Comments, `event:`, `id:` and `retry:` carry nothing we need.
        }

        events
    }

    /// Flushes a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let rest = String::from_utf8_lossy(&rest);
            if let Some(value) = rest.trim_end_matches('\r').strip_prefix("data:") {
                self.data.push(value.trim_start().to_string());
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        if payload.trim() == "[DONE]" {
            Some(SseEvent::Done)
        } else {
            Some(SseEvent::Data(payload))
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionsBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChunkBody {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    message: String,
}

/// Extracts `choices[0].delta.content` from one streamed chunk.
fn parse_chunk(payload: &str) -> CompletionResult<Option<String>> {
    let chunk: ChunkBody = serde_json::from_str(payload)?;
    if let Some(error) = chunk.error {
        return Err(CompletionError::transport(error.message));
    }
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content))
}

/// Completion source speaking the `/chat/completions` streaming protocol.
#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    idle_timeout: Duration,
    defaults: CompletionConfig,
}

impl ChatCompletionsClient {
    /// # Errors
    /// Returns a transport error when the HTTP client cannot be built.
    pub fn from_config(config: &CompletionConfig) -> CompletionResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|err| CompletionError::transport(err.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs.max(1)),
            defaults: config.clone(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CompletionSource for ChatCompletionsClient {
    #[instrument(skip_all, fields(model = %self.model, messages = request.messages.len()))]
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> CompletionResult<FragmentStream> {
        if request.messages.is_empty() {
            return Err(CompletionError::invalid_input("no messages to complete"));
        }

        let body = ChatCompletionsBody {
            model: &self.model,
            messages: &request.messages,
            stream: true,
            max_completion_tokens: request
                .max_completion_tokens
                .or(Some(self.defaults.max_completion_tokens)),
            temperature: request.temperature.or(Some(self.defaults.temperature)),
            top_p: request.top_p.or(Some(self.defaults.top_p)),
        };

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| CompletionError::transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "completion request rejected");
            return Err(CompletionError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let idle = self.idle_timeout;
        let stream = try_stream! {
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            'read: loop {
                let next = tokio::time::timeout(idle, bytes.next())
                    .await
                    .map_err(|_| CompletionError::Timeout { seconds: idle.as_secs() })?;

                let (events, exhausted) = match next {
                    Some(chunk) => {
                        let chunk = chunk.map_err(|err| CompletionError::transport(err.to_string()))?;
                        (decoder.feed(&chunk), false)
                    }
                    None => (decoder.finish().into_iter().collect::<Vec<_>>(), true),
                };

                for event in events {
                    match event {
                        SseEvent::Done => {
                            debug!("completion stream finished");
                            break 'read;
                        }
                        SseEvent::Data(payload) => {
                            if let Some(text) = parse_chunk(&payload)? {
                                yield text;
                            }
                        }
                    }
                }

                if exhausted {
                    break;
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
