use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::state::PlanTask;

/// Events emitted during an engine run.
///
/// The event sequence for one run is finite, ordered, and ends with exactly
/// one terminal event (`complete`, `failed`, `timeout`, or `cancelled`);
/// `interrupted` may precede the terminal when a clarification is pending.
/// The gateway projects these 1:1 onto SSE frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// First event of every run.
    #[serde(rename = "system")]
    System {
        session_id: String,
        model: String,
        tools: Vec<String>,
        agents: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Entering the THINK phase.
    #[serde(rename = "thinking")]
    Thinking { iteration: u32 },

    /// Context assembled for this iteration (budget snapshot).
    #[serde(rename = "context")]
    Context {
        iteration: u32,
        messages: usize,
        tokens_used: u32,
        tokens_budget: u32,
    },

    /// Text content produced by the model in this iteration.
    #[serde(rename = "reasoning")]
    Reasoning { iteration: u32, text: String },

    /// The current plan (emitted when the task list changes).
    #[serde(rename = "plan")]
    Plan { iteration: u32, tasks: Vec<PlanTask> },

    #[serde(rename = "step_start")]
    StepStart { iteration: u32, step_id: String },

    #[serde(rename = "step_complete")]
    StepComplete { iteration: u32, step_id: String },

    /// A tool call is about to be dispatched.
    #[serde(rename = "acting")]
    Acting {
        iteration: u32,
        tool: String,
        input: serde_json::Value,
    },

    /// A tool call finished; carries the observed result.
    #[serde(rename = "observing")]
    Observing {
        iteration: u32,
        tool: String,
        call_id: String,
        result: serde_json::Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },

    /// A pre-hook vetoed a tool call.
    #[serde(rename = "blocked")]
    Blocked {
        iteration: u32,
        tool: String,
        reason: String,
    },

    /// A state/task update from the plan tool.
    #[serde(rename = "task_update")]
    TaskUpdate {
        iteration: u32,
        task_id: String,
        status: String,
    },

    /// Ephemeral context was injected (state summary, task list, corrections).
    #[serde(rename = "context_injected")]
    ContextInjected {
        iteration: u32,
        kind: String,
        tokens: u32,
    },

    /// The echo monitor queued a correction for the next iteration.
    #[serde(rename = "correction")]
    Correction { iteration: u32, text: String },

    /// A clarification interrupt was raised; the turn short-circuits.
    #[serde(rename = "clarification_needed")]
    ClarificationNeeded {
        iteration: u32,
        clarification_id: String,
        questions: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<Vec<String>>,
    },

    #[serde(rename = "alias_resolving")]
    AliasResolving { iteration: u32, alias: String },

    #[serde(rename = "alias_resolved")]
    AliasResolved {
        iteration: u32,
        alias: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        failed: bool,
    },

    /// Periodic checkpoint emitted (the durable store is external).
    #[serde(rename = "checkpoint")]
    Checkpoint { iteration: u32, session_id: String },

    /// A delegation decision spawned one or more sub-agents.
    #[serde(rename = "delegating")]
    Delegating {
        iteration: u32,
        strategy: String,
        contracts: Vec<String>,
    },

    /// One sub-agent contract finished.
    #[serde(rename = "delegation_complete")]
    DelegationComplete {
        iteration: u32,
        contract_id: String,
        success: bool,
        summary: String,
    },

    /// A generation error is being retried in place.
    #[serde(rename = "recovery")]
    Recovery {
        iteration: u32,
        error: String,
        attempt: u32,
    },

    #[serde(rename = "warning")]
    Warning { iteration: u32, message: String },

    /// A non-terminal error was recorded.
    #[serde(rename = "error")]
    Error {
        iteration: u32,
        error: EngineError,
    },

    /// Terminal: the loop finished with a final answer.
    #[serde(rename = "complete")]
    Complete { iteration: u32, summary: String },

    /// The loop is paused pending a user clarification. Precedes the
    /// terminal close of the stream.
    #[serde(rename = "interrupted")]
    Interrupted {
        iteration: u32,
        clarification_id: String,
    },

    /// Terminal: the error budget was exhausted.
    #[serde(rename = "failed")]
    Failed {
        iteration: u32,
        reason: String,
        errors: Vec<EngineError>,
    },

    /// Terminal: the iteration limit was reached.
    #[serde(rename = "timeout")]
    Timeout { iteration: u32 },

    /// Terminal: the caller cancelled the run.
    #[serde(rename = "cancelled")]
    Cancelled { iteration: u32, reason: String },
}

impl EngineEvent {
    /// Terminal events close the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::Complete { .. }
                | EngineEvent::Failed { .. }
                | EngineEvent::Timeout { .. }
                | EngineEvent::Cancelled { .. }
        )
    }

    /// The wire name of this event (the serde tag), used by the SSE
    /// projection to build `data-<type>` frame names.
    pub fn type_name(&self) -> &'static str {
        match self {
            EngineEvent::System { .. } => "system",
            EngineEvent::Thinking { .. } => "thinking",
            EngineEvent::Context { .. } => "context",
            EngineEvent::Reasoning { .. } => "reasoning",
            EngineEvent::Plan { .. } => "plan",
            EngineEvent::StepStart { .. } => "step_start",
            EngineEvent::StepComplete { .. } => "step_complete",
            EngineEvent::Acting { .. } => "acting",
            EngineEvent::Observing { .. } => "observing",
            EngineEvent::Blocked { .. } => "blocked",
            EngineEvent::TaskUpdate { .. } => "task_update",
            EngineEvent::ContextInjected { .. } => "context_injected",
            EngineEvent::Correction { .. } => "correction",
            EngineEvent::ClarificationNeeded { .. } => "clarification_needed",
            EngineEvent::AliasResolving { .. } => "alias_resolving",
            EngineEvent::AliasResolved { .. } => "alias_resolved",
            EngineEvent::Checkpoint { .. } => "checkpoint",
            EngineEvent::Delegating { .. } => "delegating",
            EngineEvent::DelegationComplete { .. } => "delegation_complete",
            EngineEvent::Recovery { .. } => "recovery",
            EngineEvent::Warning { .. } => "warning",
            EngineEvent::Error { .. } => "error",
            EngineEvent::Complete { .. } => "complete",
            EngineEvent::Interrupted { .. } => "interrupted",
            EngineEvent::Failed { .. } => "failed",
            EngineEvent::Timeout { .. } => "timeout",
            EngineEvent::Cancelled { .. } => "cancelled",
        }
    }
}
