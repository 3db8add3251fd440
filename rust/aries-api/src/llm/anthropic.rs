//! Upstream Anthropic Messages API adapter.
//!
//! Translates the generic chat shape into upstream calls, both
//! non-streaming and streaming. Streaming SSE events are translated into
//! [`StreamEvent`]s; the gateway layer re-renders them on its own wire.

use crate::config::UpstreamConfig;
use crate::error::{FabricError, Result};
use crate::llm::{
    ChatDriver, ChatRequest, ChatResponse, EventSink, Message, MessageRole, StreamEvent,
    TokenUsage,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Upstream API version header value.
const API_VERSION: &str = "2023-06-01";

/// Beta header advertised for OAuth-style credentials.
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// Credentials with this prefix authenticate as Bearer tokens.
const OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat";

/// Maximum accepted upstream response body.
const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024;

/// Upstream error body excerpt length carried into errors.
const ERROR_EXCERPT_LEN: usize = 300;

/// Anthropic Messages API driver.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    config: UpstreamConfig,
    client: Client,
}

impl AnthropicClient {
    /// Create a new driver from upstream settings.
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| FabricError::Transport(format!("http client: {e}")))?;

        Ok(Self { config, client })
    }

    fn api_url(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    /// Strip the provider prefix from a qualified model id.
    fn upstream_model(model: &str) -> &str {
        model.split_once('/').map_or(model, |(_, name)| name)
    }

    /// Partition messages into the upstream system string and turn list.
    ///
    /// All system messages concatenate (newline-separated) into one system
    /// string; everything else becomes an ordered user/assistant sequence.
    /// An empty sequence gets a single `user: "Hello"` turn.
    fn convert_messages(messages: &[Message]) -> (String, Vec<serde_json::Value>) {
        let mut system_parts = Vec::new();
        let mut converted = Vec::new();

        for msg in messages {
            match msg.role {
                MessageRole::System => system_parts.push(msg.content.clone()),
                MessageRole::User | MessageRole::Tool => {
                    converted.push(serde_json::json!({
                        "role": "user",
                        "content": msg.content,
                    }));
                }
                MessageRole::Assistant => {
                    converted.push(serde_json::json!({
                        "role": "assistant",
                        "content": msg.content,
                    }));
                }
            }
        }

        if converted.is_empty() {
            converted.push(serde_json::json!({"role": "user", "content": "Hello"}));
        }

        (system_parts.join("\n"), converted)
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> serde_json::Value {
        let (system, messages) = Self::convert_messages(&req.messages);

        let mut body = serde_json::json!({
            "model": Self::upstream_model(&req.model),
            "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(self.config.max_tokens),
        });

        if !system.is_empty() {
            body["system"] = serde_json::Value::String(system);
        }
        if let Some(temperature) = req.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = req.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if stream {
            body["stream"] = serde_json::Value::Bool(true);
        }

        body
    }

    /// Attach auth headers for the configured credential.
    ///
    /// OAuth-style tokens send a Bearer authorization plus the beta header;
    /// anything else is an API key sent via `x-api-key`. Both modes send
    /// the fixed API-version header.
    fn authorize(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let credential = self
            .config
            .credential
            .as_deref()
            .ok_or_else(|| FabricError::Transport("no upstream credential configured".into()))?;

        let builder = builder.header("anthropic-version", API_VERSION);

        Ok(if credential.starts_with(OAUTH_TOKEN_PREFIX) {
            builder
                .header("authorization", format!("Bearer {credential}"))
                .header("anthropic-beta", OAUTH_BETA)
        } else {
            builder.header("x-api-key", credential)
        })
    }

    /// Read a bounded response body, refusing oversized payloads.
    async fn read_capped(resp: reqwest::Response) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(FabricError::from)?;
            if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(FabricError::Transport(format!(
                    "upstream response exceeds {MAX_RESPONSE_BYTES} bytes"
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }

    async fn upstream_error(resp: reqwest::Response) -> FabricError {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        let excerpt: String = text.chars().take(ERROR_EXCERPT_LEN).collect();
        FabricError::Upstream { status, excerpt }
    }
}

#[async_trait]
impl ChatDriver for AnthropicClient {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(req, false);

        let request = self.authorize(self.client.post(self.api_url()))?;
        let resp = request
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(FabricError::from)?;

        if !resp.status().is_success() {
            return Err(Self::upstream_error(resp).await);
        }

        let bytes = Self::read_capped(resp).await?;
        let parsed: MessagesResponse = serde_json::from_slice(&bytes)
            .map_err(|e| FabricError::Transport(format!("malformed upstream response: {e}")))?;

        let content = parsed
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let finish_reason = match parsed.stop_reason.as_deref() {
            Some("end_turn") | None => "stop".to_string(),
            Some(other) => other.to_string(),
        };

        Ok(ChatResponse {
            model: req.model.clone(),
            content,
            usage: parsed.usage.map(UpstreamUsage::into_usage).unwrap_or_default(),
            finish_reason,
        })
    }

    async fn stream(&self, req: &ChatRequest, sink: EventSink) -> Result<TokenUsage> {
        let body = self.build_body(req, true);

        let request = self.authorize(self.client.post(self.api_url()))?;
        let resp = match request
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let err = FabricError::from(e);
                let _ = sink
                    .send(StreamEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
        };

        if !resp.status().is_success() {
            let err = Self::upstream_error(resp).await;
            let _ = sink
                .send(StreamEvent::Error {
                    message: err.to_string(),
                })
                .await;
            return Err(err);
        }

        let mut usage = TokenUsage::default();
        let mut stop_reason: Option<String> = None;
        let mut buffer = String::new();
        let mut byte_stream = resp.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let err = FabricError::from(e);
                    let _ = sink
                        .send(StreamEvent::Error {
                            message: err.to_string(),
                        })
                        .await;
                    return Err(err);
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete SSE frames (blank-line separated).
            while let Some(pos) = buffer.find("\n\n") {
                let frame = buffer[..pos].to_string();
                buffer.drain(..pos + 2);

                for line in frame.lines() {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let event: SseEvent = match serde_json::from_str(data) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::warn!(error = %e, "unparseable upstream SSE event");
                            continue;
                        }
                    };

                    match event.event_type.as_str() {
                        "message_start" => {
                            if let Some(start_usage) =
                                event.message.and_then(|m| m.usage)
                            {
                                usage.input_tokens = start_usage.input_tokens;
                                usage.cache_read_input_tokens =
                                    start_usage.cache_read_input_tokens.unwrap_or(0);
                                usage.cache_creation_input_tokens =
                                    start_usage.cache_creation_input_tokens.unwrap_or(0);
                            }
                        }
                        "content_block_delta" => {
                            if let Some(delta) = event.delta {
                                if delta.delta_type.as_deref() == Some("text_delta") {
                                    if let Some(text) = delta.text {
                                        if sink
                                            .send(StreamEvent::Delta { content: text })
                                            .await
                                            .is_err()
                                        {
                                            // Sink dropped; stop reading.
                                            return Ok(usage);
                                        }
                                    }
                                }
                            }
                        }
                        "message_delta" => {
                            if let Some(delta_usage) = event.usage {
                                usage.output_tokens = delta_usage.output_tokens.unwrap_or(0);
                            }
                            if let Some(reason) =
                                event.delta.and_then(|d| d.stop_reason)
                            {
                                stop_reason = Some(reason);
                            }
                        }
                        "error" => {
                            let message = event
                                .error
                                .map(|e| e.message)
                                .unwrap_or_else(|| "upstream stream error".to_string());
                            let _ = sink.send(StreamEvent::Error { message }).await;
                            return Ok(usage);
                        }
                        // message_stop and the remaining content_block_*
                        // events carry nothing we need.
                        _ => {}
                    }
                }
            }
        }

        let reason = match stop_reason.as_deref() {
            Some("end_turn") | None => "stop".to_string(),
            Some(other) => other.to_string(),
        };

        let _ = sink.send(StreamEvent::Usage { usage }).await;
        let _ = sink.send(StreamEvent::Stop { reason }).await;

        Ok(usage)
    }
}

/// Non-streaming Messages API response.
#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<UpstreamUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
}

impl UpstreamUsage {
    fn into_usage(self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens.unwrap_or(0),
            cache_read_input_tokens: self.cache_read_input_tokens.unwrap_or(0),
            cache_creation_input_tokens: self.cache_creation_input_tokens.unwrap_or(0),
        }
    }
}

/// Upstream SSE event envelope.
#[derive(Debug, Deserialize)]
struct SseEvent {
    #[serde(rename = "type")]
    event_type: String,
    message: Option<SseMessage>,
    delta: Option<SseDelta>,
    usage: Option<UpstreamUsage>,
    error: Option<SseError>,
}

#[derive(Debug, Deserialize)]
struct SseMessage {
    usage: Option<UpstreamUsage>,
}

#[derive(Debug, Deserialize)]
struct SseDelta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_messages_concatenate() {
        let messages = vec![
            Message::system("first"),
            Message::user("question"),
            Message::system("second"),
        ];
        let (system, turns) = AnthropicClient::convert_messages(&messages);
        assert_eq!(system, "first\nsecond");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0]["role"], "user");
    }

    #[test]
    fn test_empty_turns_get_hello() {
        let messages = vec![Message::system("only system")];
        let (_, turns) = AnthropicClient::convert_messages(&messages);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0]["content"], "Hello");
    }

    #[test]
    fn test_tool_messages_become_user_turns() {
        let messages = vec![Message {
            role: MessageRole::Tool,
            content: "result".to_string(),
            tool_call_id: Some("call_1".to_string()),
        }];
        let (_, turns) = AnthropicClient::convert_messages(&messages);
        assert_eq!(turns[0]["role"], "user");
        assert_eq!(turns[0]["content"], "result");
    }

    #[test]
    fn test_upstream_model_strips_provider() {
        assert_eq!(
            AnthropicClient::upstream_model("anthropic/claude-opus-4-1"),
            "claude-opus-4-1"
        );
        assert_eq!(AnthropicClient::upstream_model("claude-opus-4-1"), "claude-opus-4-1");
    }
}
