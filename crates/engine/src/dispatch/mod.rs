//! Tool dispatch: validation, hooks, execution, typed outcomes.
//!
//! Tools declare a JSON schema; the dispatcher validates input before the
//! executor runs, wraps execution in the hook pipeline, and returns a
//! typed outcome. Failures are data — the loop decides what they mean.

pub mod builtin;
pub mod hooks;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use ta_adapters::traits::ActionAdapter;
use ta_domain::error::{EngineError, ErrorCode};
use ta_domain::state::PlanTask;
use ta_domain::tool::ToolDefinition;

use crate::checkpoint::CheckpointStore;
use crate::context::manager::ContextManager;
use crate::dispatch::hooks::{HookContext, HookDecision, HookEvent, HookRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared handles the builtin tools work against. The orchestrator
/// rebuilds one per iteration (the Arcs make that cheap) so tools see
/// the current iteration number and resource state.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub adapter: Option<Arc<dyn ActionAdapter>>,
    pub context: Arc<tokio::sync::Mutex<ContextManager>>,
    pub plan: Arc<Mutex<Vec<PlanTask>>>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Event channel for tools that narrate their progress (delegation).
    pub events: Option<tokio::sync::mpsc::Sender<ta_domain::event::EngineEvent>>,
    pub iteration: u32,
    /// Budget left in this run, for delegation pressure decisions.
    pub remaining_budget: u32,
    pub delegation: Option<Arc<crate::delegation::DelegationEngine>>,
    /// Snapshot of the run's resources, for checkpoints.
    pub resources: ta_domain::state::AgentResources,
}

#[derive(Debug)]
pub enum ToolOutcome {
    Success {
        result: Value,
    },
    Error {
        error: EngineError,
    },
    /// A pre-hook vetoed the call; it never executed.
    Blocked {
        reason: String,
    },
    /// The tool asked the user a question; the turn ends here.
    Clarification {
        clarification_id: String,
        questions: Vec<String>,
        options: Option<Vec<String>>,
    },
}

impl ToolOutcome {
    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        ToolOutcome::Error {
            error: EngineError::new(code, message),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error { .. })
    }

    /// Render the outcome as JSON for context storage and events.
    pub fn to_value(&self) -> Value {
        match self {
            ToolOutcome::Success { result } => result.clone(),
            ToolOutcome::Error { error } => serde_json::json!({
                "success": false,
                "error": error,
            }),
            ToolOutcome::Blocked { reason } => serde_json::json!({
                "success": false,
                "blocked": true,
                "reason": reason,
            }),
            ToolOutcome::Clarification {
                clarification_id,
                questions,
                options,
            } => serde_json::json!({
                "clarification_id": clarification_id,
                "questions": questions,
                "options": options,
            }),
        }
    }
}

#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutcome;
}

struct RegisteredTool {
    definition: ToolDefinition,
    executor: Arc<dyn ToolExecutor>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolDispatcher {
    tools: RwLock<Arc<HashMap<String, Arc<RegisteredTool>>>>,
    hooks: Arc<HookRegistry>,
    /// Hard per-call execution timeout.
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(hooks: Arc<HookRegistry>) -> Self {
        Self {
            tools: RwLock::new(Arc::new(HashMap::new())),
            hooks,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register(&self, definition: ToolDefinition, executor: Arc<dyn ToolExecutor>) {
        let mut guard = self.tools.write();
        let mut next: HashMap<String, Arc<RegisteredTool>> = (**guard).clone();
        next.insert(
            definition.name.clone(),
            Arc::new(RegisteredTool {
                definition,
                executor,
            }),
        );
        *guard = Arc::new(next);
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .values()
            .map(|t| t.definition.clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Validate, run hooks, execute. Never panics or throws; every
    /// failure mode is a [`ToolOutcome`].
    pub async fn dispatch(&self, tool_name: &str, input: Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(tool) = self.tools.read().get(tool_name).cloned() else {
            return ToolOutcome::err(
                ErrorCode::ToolNotFound,
                format!("unknown tool '{tool_name}'"),
            );
        };

        if let Err(error) = validate_input(&tool.definition.parameters, &input) {
            return ToolOutcome::Error { error };
        }

        // Pre-hooks may veto.
        let decision = self
            .hooks
            .dispatch(&HookContext {
                event: HookEvent::PreToolUse,
                session_id: &ctx.session_id,
                tool_name: Some(tool_name),
                input: Some(&input),
                result: None,
            })
            .await;
        if let HookDecision {
            proceed: false,
            reason,
        } = decision
        {
            return ToolOutcome::Blocked {
                reason: reason.unwrap_or_else(|| "blocked by hook".into()),
            };
        }

        let outcome = match tokio::time::timeout(
            self.timeout,
            tool.executor.execute(input.clone(), ctx),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => ToolOutcome::err(
                ErrorCode::ToolTimeout,
                format!(
                    "tool '{tool_name}' timed out after {}s",
                    self.timeout.as_secs()
                ),
            ),
        };

        // A result carrying a clarification id ends the turn regardless
        // of which executor produced it.
        let outcome = promote_clarification(outcome);

        let result_value = outcome.to_value();
        let post_event = if outcome.is_error() {
            HookEvent::PostToolUseFailure
        } else {
            HookEvent::PostToolUse
        };
        if !matches!(outcome, ToolOutcome::Blocked { .. }) {
            self.hooks
                .dispatch(&HookContext {
                    event: post_event,
                    session_id: &ctx.session_id,
                    tool_name: Some(tool_name),
                    input: Some(&input),
                    result: Some(&result_value),
                })
                .await;
        }

        outcome
    }
}

/// A success result with a `clarification_id` field is a clarification
/// interrupt, whichever tool returned it.
fn promote_clarification(outcome: ToolOutcome) -> ToolOutcome {
    let ToolOutcome::Success { result } = &outcome else {
        return outcome;
    };
    let id = result
        .get("clarification_id")
        .or_else(|| result.get("clarificationId"))
        .and_then(Value::as_str);
    let Some(id) = id else {
        return outcome;
    };
    let questions = result
        .get("questions")
        .and_then(Value::as_array)
        .map(|qs| {
            qs.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let options = result.get("options").and_then(Value::as_array).map(|os| {
        os.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    });
    ToolOutcome::Clarification {
        clarification_id: id.to_string(),
        questions,
        options,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate input against the declarative schema: required fields and
/// primitive property types.
pub fn validate_input(schema: &Value, input: &Value) -> Result<(), EngineError> {
    let Some(obj) = input.as_object() else {
        return Err(EngineError::new(
            ErrorCode::ValidationInvalidType,
            "tool input must be an object",
        ));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(field) {
                return Err(EngineError::new(
                    ErrorCode::ValidationMissingField,
                    format!("missing required field '{field}'"),
                ));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (field, value) in obj {
            let Some(spec) = properties.get(field) else {
                continue; // unknown fields pass through
            };
            let Some(expected) = spec.get("type").and_then(Value::as_str) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                _ => true,
            };
            if !ok {
                return Err(EngineError::new(
                    ErrorCode::ValidationInvalidType,
                    format!("field '{field}' must be of type {expected}"),
                ));
            }
            if let Some(allowed) = spec.get("enum").and_then(Value::as_array) {
                if !allowed.contains(value) {
                    return Err(EngineError::new(
                        ErrorCode::ValidationOutOfRange,
                        format!("field '{field}' must be one of {allowed:?}"),
                    ));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::context::compressor::Compressor;
    use crate::context::estimator::TokenEstimator;
    use serde_json::json;

    fn test_ctx() -> ToolContext {
        ToolContext {
            session_id: "s1".into(),
            adapter: None,
            context: Arc::new(tokio::sync::Mutex::new(ContextManager::new(
                10_000,
                Compressor::new(TokenEstimator::default()),
            ))),
            plan: Arc::new(Mutex::new(Vec::new())),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            events: None,
            iteration: 0,
            remaining_budget: 10_000,
            delegation: None,
            resources: ta_domain::state::AgentResources::new("test", "test task"),
        }
    }

    struct EchoTool;

    #[async_trait::async_trait]
    impl ToolExecutor for EchoTool {
        async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolOutcome {
            ToolOutcome::Success { result: input }
        }
    }

    fn echo_definition() -> ToolDefinition {
        ToolDefinition {
            name: "echo".into(),
            description: "echo the input".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "mode": { "type": "string", "enum": ["loud", "quiet"] }
                },
                "required": ["text"]
            }),
        }
    }

    #[tokio::test]
    async fn dispatches_registered_tool() {
        let dispatcher = ToolDispatcher::new(Arc::new(HookRegistry::new()));
        dispatcher.register(echo_definition(), Arc::new(EchoTool));

        let outcome = dispatcher
            .dispatch("echo", json!({ "text": "hi" }), &test_ctx())
            .await;
        match outcome {
            ToolOutcome::Success { result } => assert_eq!(result["text"], "hi"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_typed_error() {
        let dispatcher = ToolDispatcher::new(Arc::new(HookRegistry::new()));
        let outcome = dispatcher.dispatch("ghost", json!({}), &test_ctx()).await;
        match outcome {
            ToolOutcome::Error { error } => assert_eq!(error.code, ErrorCode::ToolNotFound),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn validation_rejects_missing_and_mistyped() {
        let dispatcher = ToolDispatcher::new(Arc::new(HookRegistry::new()));
        dispatcher.register(echo_definition(), Arc::new(EchoTool));
        let ctx = test_ctx();

        let outcome = dispatcher.dispatch("echo", json!({}), &ctx).await;
        match outcome {
            ToolOutcome::Error { error } => {
                assert_eq!(error.code, ErrorCode::ValidationMissingField)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let outcome = dispatcher.dispatch("echo", json!({ "text": 7 }), &ctx).await;
        match outcome {
            ToolOutcome::Error { error } => {
                assert_eq!(error.code, ErrorCode::ValidationInvalidType)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let outcome = dispatcher
            .dispatch("echo", json!({ "text": "x", "mode": "silent" }), &ctx)
            .await;
        match outcome {
            ToolOutcome::Error { error } => {
                assert_eq!(error.code, ErrorCode::ValidationOutOfRange)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    struct BlockAllHook;

    #[async_trait::async_trait]
    impl hooks::Hook for BlockAllHook {
        fn name(&self) -> &str {
            "block-all"
        }
        fn events(&self) -> &[HookEvent] {
            &[HookEvent::PreToolUse]
        }
        async fn on_event(
            &self,
            _ctx: &HookContext<'_>,
        ) -> ta_domain::error::Result<HookDecision> {
            Ok(HookDecision::block("nothing gets through"))
        }
    }

    #[tokio::test]
    async fn pre_hook_blocks_execution() {
        let hooks = Arc::new(HookRegistry::new());
        hooks.register(Arc::new(BlockAllHook));
        let dispatcher = ToolDispatcher::new(hooks);
        dispatcher.register(echo_definition(), Arc::new(EchoTool));

        let outcome = dispatcher
            .dispatch("echo", json!({ "text": "hi" }), &test_ctx())
            .await;
        match outcome {
            ToolOutcome::Blocked { reason } => assert_eq!(reason, "nothing gets through"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clarification_results_are_promoted() {
        struct ClarifyTool;

        #[async_trait::async_trait]
        impl ToolExecutor for ClarifyTool {
            async fn execute(&self, _input: Value, _ctx: &ToolContext) -> ToolOutcome {
                ToolOutcome::Success {
                    result: json!({
                        "clarification_id": "c1",
                        "questions": ["Which colour?"]
                    }),
                }
            }
        }

        let dispatcher = ToolDispatcher::new(Arc::new(HookRegistry::new()));
        dispatcher.register(
            ToolDefinition {
                name: "ask".into(),
                description: "ask the user".into(),
                parameters: json!({ "type": "object", "properties": {} }),
            },
            Arc::new(ClarifyTool),
        );

        let outcome = dispatcher.dispatch("ask", json!({}), &test_ctx()).await;
        match outcome {
            ToolOutcome::Clarification {
                clarification_id,
                questions,
                ..
            } => {
                assert_eq!(clarification_id, "c1");
                assert_eq!(questions, vec!["Which colour?"]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_tool_times_out_recoverably() {
        struct SlowTool;

        #[async_trait::async_trait]
        impl ToolExecutor for SlowTool {
            async fn execute(&self, _input: Value, _ctx: &ToolContext) -> ToolOutcome {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ToolOutcome::Success { result: json!({}) }
            }
        }

        let dispatcher = ToolDispatcher::new(Arc::new(HookRegistry::new()))
            .with_timeout(Duration::from_millis(20));
        dispatcher.register(
            ToolDefinition {
                name: "slow".into(),
                description: "sleeps".into(),
                parameters: json!({ "type": "object", "properties": {} }),
            },
            Arc::new(SlowTool),
        );

        let outcome = dispatcher.dispatch("slow", json!({}), &test_ctx()).await;
        match outcome {
            ToolOutcome::Error { error } => {
                assert_eq!(error.code, ErrorCode::ToolTimeout);
                assert!(error.recoverable);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
