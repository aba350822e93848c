//! Scripted provider for tests.
//!
//! Plays back a fixed sequence of responses (or errors) and records every
//! request it receives, so tests can assert on both sides of the provider
//! boundary without a network.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde_json::Value;

use ta_domain::error::{Error, Result};
use ta_domain::tool::ToolCall;

use crate::traits::{GenerateRequest, GenerateResponse, LlmProvider};

/// One scripted turn: a canned response or a canned failure.
pub enum ScriptedTurn {
    Respond(GenerateResponse),
    Fail(String),
}

pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<GenerateRequest>>,
    model: String,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            model: "scripted".into(),
        }
    }

    /// Convenience: a single text completion.
    pub fn text_turn(text: impl Into<String>) -> ScriptedTurn {
        ScriptedTurn::Respond(GenerateResponse::text(text))
    }

    /// Convenience: one tool-calling turn.
    pub fn tool_turn(calls: Vec<(&str, Value)>) -> ScriptedTurn {
        let calls = calls
            .into_iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCall {
                call_id: format!("call_{}", i + 1),
                tool_name: name.to_string(),
                arguments: args,
            })
            .collect();
        ScriptedTurn::Respond(GenerateResponse::tool_calls(calls))
    }

    /// Requests seen so far (cloned).
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining_turns(&self) -> usize {
        self.turns.lock().len()
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse> {
        self.requests.lock().push(req);
        match self.turns.lock().pop_front() {
            Some(ScriptedTurn::Respond(resp)) => Ok(resp),
            Some(ScriptedTurn::Fail(message)) => Err(Error::Provider {
                provider: self.model.clone(),
                message,
            }),
            None => Ok(GenerateResponse::text("[script exhausted]")),
        }
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}
