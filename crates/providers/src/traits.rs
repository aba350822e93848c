use serde::{Deserialize, Serialize};

use ta_domain::error::Result;
use ta_domain::message::Role;
use ta_domain::tool::{ToolCall, ToolDefinition};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A flattened history message. The context manager renders its tiered
/// store down to these before every generate call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// A provider-agnostic generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    /// Model identifier override. `None` = provider default.
    pub model: Option<String>,
    pub system_prompt: String,
    pub user_message: String,
    /// Tools the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Prior conversation, oldest first.
    pub history: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn accumulate(&mut self, delta: &TokenUsage) {
        self.prompt_tokens += delta.prompt_tokens;
        self.completion_tokens += delta.completion_tokens;
    }
}

/// A provider-agnostic generation response.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
}

impl GenerateResponse {
    /// A plain text completion ending the turn.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: TokenUsage::default(),
        }
    }

    /// A tool-calling turn.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            text: None,
            tool_calls: calls,
            finish_reason: FinishReason::ToolCalls,
            usage: TokenUsage::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter must implement.
///
/// Implementations translate between these types and the wire format of
/// one provider family. They must be safe for concurrent generate calls.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a generation request and wait for the full response.
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;

    /// The model used when the request names none.
    fn default_model(&self) -> &str;
}
