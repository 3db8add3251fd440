//! Chat request/response model and the upstream driver trait.
//!
//! The [`ChatDriver`] trait defines the adapter interface the gateway
//! multiplexes through. The production implementation is
//! [`anthropic::AnthropicClient`], which translates the generic chat shape
//! into upstream Messages API calls.

pub mod anthropic;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User message.
    User,
    /// Assistant response.
    Assistant,
    /// Tool response.
    Tool,
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    /// Text content.
    pub content: String,
    /// Optional tool call ID (for tool responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            tool_call_id: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_call_id: None,
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call_id: None,
        }
    }
}

/// A generic chat request, before alias resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier (alias or fully qualified).
    pub model: String,
    /// Ordered conversation messages.
    pub messages: Vec<Message>,
    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Whether the caller wants a streamed response.
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Create a non-streaming request with messages.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: false,
        }
    }

    /// Set the maximum output tokens.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Token usage counters for one upstream call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens consumed.
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion tokens produced.
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens served from the upstream prompt cache.
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    /// Tokens written into the upstream prompt cache.
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    /// Total billable tokens (input + output).
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A completed chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Model that actually served the request.
    pub model: String,
    /// Assistant content (all text blocks concatenated).
    pub content: String,
    /// Token usage for this call.
    pub usage: TokenUsage,
    /// Finish reason (`stop`, or the upstream value passed through).
    pub finish_reason: String,
}

/// A streaming event emitted into the caller's sink.
///
/// The terminal event of a well-formed stream is exactly one `Stop` or
/// `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Partial assistant text.
    Delta {
        /// The content delta.
        content: String,
    },
    /// Usage counters, emitted once near the end of the stream.
    Usage {
        /// The accumulated usage.
        usage: TokenUsage,
    },
    /// Stream completed normally.
    Stop {
        /// Finish reason (`stop`, or the upstream value passed through).
        reason: String,
    },
    /// Stream terminated with an error.
    Error {
        /// Error description.
        message: String,
    },
}

impl StreamEvent {
    /// Whether this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop { .. } | Self::Error { .. })
    }
}

/// Sink for streaming events.
pub type EventSink = mpsc::Sender<StreamEvent>;

/// Trait for upstream chat drivers.
#[async_trait]
pub trait ChatDriver: Send + Sync {
    /// Perform a non-streaming completion.
    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse>;

    /// Perform a streaming completion, emitting events into `sink`.
    ///
    /// Returns the final usage counters. An HTTP error before any body
    /// bytes is reported both as an `Error` event in the sink and as the
    /// returned `Err`, so callers that have not yet forwarded events may
    /// fall back to another model.
    async fn stream(&self, req: &ChatRequest, sink: EventSink) -> Result<TokenUsage>;
}
