//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, Together, and any other
//! endpoint that follows the OpenAI chat completions contract.

use serde_json::{json, Value};

use ta_domain::config::ProviderConfig;
use ta_domain::error::{EngineError, Error, ErrorCode, Result};
use ta_domain::message::Role;
use ta_domain::tool::ToolCall;

use crate::traits::{
    FinishReason, GenerateRequest, GenerateResponse, LlmProvider, TokenUsage,
};

#[derive(Debug)]
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a provider from its config entry.
    ///
    /// The API key is resolved eagerly: a direct `api_key` wins, otherwise
    /// the env var named by `api_key_env` is read. A missing key is the
    /// dedicated fatal condition `AGENT_API_KEY_MISSING`.
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let api_key = match (&cfg.api_key, &cfg.api_key_env) {
            (Some(key), _) if !key.is_empty() => key.clone(),
            (_, Some(env_name)) => std::env::var(env_name).map_err(|_| {
                Error::Engine(EngineError::new(
                    ErrorCode::AgentApiKeyMissing,
                    format!("provider '{}': env var {env_name} is not set", cfg.id),
                ))
            })?,
            _ => {
                return Err(Error::Engine(EngineError::new(
                    ErrorCode::AgentApiKeyMissing,
                    format!("provider '{}': no api_key or api_key_env configured", cfg.id),
                )))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg.default_model.clone(),
            client,
        })
    }

    fn role_str(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            // Tool results travel as user-visible context; the engine
            // flattens them before they reach a provider.
            Role::Tool => "user",
        }
    }

    fn build_body(&self, req: &GenerateRequest) -> Value {
        let mut messages = Vec::new();
        if !req.system_prompt.is_empty() {
            messages.push(json!({ "role": "system", "content": req.system_prompt }));
        }
        for msg in &req.history {
            messages.push(json!({
                "role": Self::role_str(msg.role),
                "content": msg.content,
            }));
        }
        messages.push(json!({ "role": "user", "content": req.user_message }));

        let mut body = json!({
            "model": req.model.as_deref().unwrap_or(&self.default_model),
            "messages": messages,
        });

        if !req.tools.is_empty() {
            body["tools"] = Value::Array(
                req.tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(max_tokens) = req.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = req.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }

    fn parse_response(&self, body: &Value) -> Result<GenerateResponse> {
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| Error::Provider {
                provider: self.id.clone(),
                message: "response contained no choices".into(),
            })?;
        let message = choice.get("message").ok_or_else(|| Error::Provider {
            provider: self.id.clone(),
            message: "choice contained no message".into(),
        })?;

        let text = message
            .get("content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let mut tool_calls = Vec::new();
        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            for tc in calls {
                let call_id = tc
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let function = tc.get("function").cloned().unwrap_or(Value::Null);
                let tool_name = function
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let raw_args = function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}");
                let arguments = serde_json::from_str(raw_args).unwrap_or_else(|e| {
                    tracing::warn!(
                        tool = %tool_name,
                        error = %e,
                        "tool call arguments are not valid JSON; defaulting to empty object"
                    );
                    json!({})
                });
                tool_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                });
            }
        }

        let finish_reason = match choice.get("finish_reason").and_then(Value::as_str) {
            Some("stop") | Some("end_turn") => FinishReason::Stop,
            Some("tool_calls") => FinishReason::ToolCalls,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        };

        let usage = body
            .get("usage")
            .map(|u| TokenUsage {
                prompt_tokens: u
                    .get("prompt_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
                completion_tokens: u
                    .get("completion_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
            })
            .unwrap_or_default();

        Ok(GenerateResponse {
            text,
            tool_calls,
            finish_reason,
            usage,
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse> {
        let body = self.build_body(&req);
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            let message = payload
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string();
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("{status}: {message}"),
            });
        }

        self.parse_response(&payload)
    }

    fn provider_id(&self) -> &str {
        &self.id
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ta_domain::config::ProviderKind;

    fn provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider::from_config(&ProviderConfig {
            id: "test".into(),
            kind: ProviderKind::OpenaiCompat,
            base_url: "https://example.invalid/v1".into(),
            default_model: "test-model".into(),
            api_key_env: None,
            api_key: Some("sk-test".into()),
            timeout_ms: 1000,
        })
        .unwrap()
    }

    #[test]
    fn missing_key_is_the_dedicated_fatal_code() {
        let err = OpenAiCompatProvider::from_config(&ProviderConfig {
            id: "nokey".into(),
            kind: ProviderKind::OpenaiCompat,
            base_url: "https://example.invalid/v1".into(),
            default_model: "m".into(),
            api_key_env: None,
            api_key: None,
            timeout_ms: 1000,
        })
        .unwrap_err();
        match err {
            Error::Engine(e) => assert_eq!(e.code, ErrorCode::AgentApiKeyMissing),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn body_includes_system_history_and_tools() {
        let p = provider();
        let req = GenerateRequest {
            model: None,
            system_prompt: "You are helpful.".into(),
            user_message: "hi".into(),
            tools: vec![ta_domain::tool::ToolDefinition {
                name: "task_execute".into(),
                description: "run an action".into(),
                parameters: json!({ "type": "object" }),
            }],
            history: vec![crate::traits::ChatMessage {
                role: Role::Assistant,
                content: "earlier".into(),
            }],
            max_tokens: Some(256),
            temperature: Some(0.2),
        };
        let body = p.build_body(&req);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["messages"][2]["content"], "hi");
        assert_eq!(body["tools"][0]["function"]["name"], "task_execute");
        assert_eq!(body["max_tokens"], 256);
    }

    #[test]
    fn parses_tool_call_response() {
        let p = provider();
        let body = json!({
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {
                            "name": "task_execute",
                            "arguments": "{\"action\":\"create_element\"}"
                        }
                    }]
                }
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
        });
        let resp = p.parse_response(&body).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].tool_name, "task_execute");
        assert_eq!(resp.tool_calls[0].arguments["action"], "create_element");
        assert_eq!(resp.usage.prompt_tokens, 12);
    }

    #[test]
    fn malformed_arguments_default_to_empty_object() {
        let p = provider();
        let body = json!({
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": "x", "arguments": "{not json" }
                    }]
                }
            }]
        });
        let resp = p.parse_response(&body).unwrap();
        assert_eq!(resp.tool_calls[0].arguments, json!({}));
    }

    #[test]
    fn stop_response_parses_text() {
        let p = provider();
        let body = json!({
            "choices": [{
                "finish_reason": "stop",
                "message": { "content": "Hello there." }
            }]
        });
        let resp = p.parse_response(&body).unwrap();
        assert_eq!(resp.text.as_deref(), Some("Hello there."));
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert!(resp.tool_calls.is_empty());
    }
}
