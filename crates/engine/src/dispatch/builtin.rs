//! The canonical, domain-agnostic tool surface.
//!
//! Eight tools every engine instance exposes: engine-memory access,
//! action execution through the adapter, checkpoints, planning,
//! delegation, and the clarification interrupt.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use ta_domain::error::ErrorCode;
use ta_domain::state::{ready_tasks, PlanTask, TaskStatus};
use ta_domain::tier::Tier;
use ta_domain::tool::ToolDefinition;

use crate::checkpoint::{CheckpointDocument, CheckpointMetadata};
use crate::dispatch::{ToolContext, ToolDispatcher, ToolExecutor, ToolOutcome};

/// Register the canonical tool surface on a dispatcher.
pub fn register_builtin_tools(dispatcher: &ToolDispatcher) {
    dispatcher.register(context_read_def(), Arc::new(ContextReadTool));
    dispatcher.register(context_write_def(), Arc::new(ContextWriteTool));
    dispatcher.register(context_search_def(), Arc::new(ContextSearchTool));
    dispatcher.register(task_execute_def(), Arc::new(TaskExecuteTool));
    dispatcher.register(state_snapshot_def(), Arc::new(StateSnapshotTool));
    dispatcher.register(agent_delegate_def(), Arc::new(AgentDelegateTool));
    dispatcher.register(agent_plan_def(), Arc::new(AgentPlanTool));
    dispatcher.register(agent_clarify_def(), Arc::new(AgentClarifyTool));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// context_read / context_write / context_search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn context_read_def() -> ToolDefinition {
    ToolDefinition {
        name: "context_read".into(),
        description: "Read recent engine memory: the latest conversation and tool exchanges."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Max messages to return (default 10)" }
            }
        }),
    }
}

struct ContextReadTool;

#[async_trait::async_trait]
impl ToolExecutor for ContextReadTool {
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutcome {
        let limit = input.get("limit").and_then(Value::as_u64).unwrap_or(10) as usize;
        let manager = ctx.context.lock().await;
        let messages: Vec<Value> = manager
            .tier_messages(Tier::Recent)
            .iter()
            .rev()
            .take(limit)
            .rev()
            .map(|m| {
                json!({
                    "role": m.role,
                    "content": m.content.extract_all_text(),
                })
            })
            .collect();
        ToolOutcome::Success {
            result: json!({ "messages": messages }),
        }
    }
}

fn context_write_def() -> ToolDefinition {
    ToolDefinition {
        name: "context_write".into(),
        description: "Store a note in engine memory for later iterations.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "Note content" }
            },
            "required": ["content"]
        }),
    }
}

struct ContextWriteTool;

#[async_trait::async_trait]
impl ToolExecutor for ContextWriteTool {
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutcome {
        let content = input
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let mut manager = ctx.context.lock().await;
        let mut msg = ta_domain::message::ContextMessage::assistant(content);
        msg.metadata.provenance = Some("agent_note".into());
        let id = manager.add_message(msg, Tier::Recent);
        ToolOutcome::Success {
            result: json!({ "stored": true, "id": id.to_string() }),
        }
    }
}

fn context_search_def() -> ToolDefinition {
    ToolDefinition {
        name: "context_search".into(),
        description: "Search engine memory across all tiers.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search text" },
                "limit": { "type": "integer", "description": "Max hits (default 5)" }
            },
            "required": ["query"]
        }),
    }
}

struct ContextSearchTool;

#[async_trait::async_trait]
impl ToolExecutor for ContextSearchTool {
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutcome {
        let query = input.get("query").and_then(Value::as_str).unwrap_or_default();
        let limit = input.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;
        let manager = ctx.context.lock().await;
        let hits: Vec<Value> = manager
            .search(query, limit)
            .into_iter()
            .map(|(id, snippet)| json!({ "id": id.to_string(), "snippet": snippet }))
            .collect();
        ToolOutcome::Success {
            result: json!({ "hits": hits }),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// task_execute
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn task_execute_def() -> ToolDefinition {
    ToolDefinition {
        name: "task_execute".into(),
        description: "Execute a domain action through the connected backend. \
                      Use list-style read actions to discover current state."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "description": "Action name (see available actions)" },
                "params": { "type": "object", "description": "Action parameters" }
            },
            "required": ["action"]
        }),
    }
}

struct TaskExecuteTool;

#[async_trait::async_trait]
impl ToolExecutor for TaskExecuteTool {
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(adapter) = ctx.adapter.as_ref() else {
            return ToolOutcome::err(
                ErrorCode::AdapterConnection,
                "no action backend is connected",
            );
        };
        let action = input.get("action").and_then(Value::as_str).unwrap_or_default();
        let params = input.get("params").cloned().unwrap_or(json!({}));

        if !adapter.supports_action(action) {
            return ToolOutcome::err(
                ErrorCode::ToolValidation,
                format!("backend does not support action '{action}'"),
            );
        }

        let result = adapter.execute(action, params).await;
        match result.error {
            Some(error) => ToolOutcome::Error { error },
            None => ToolOutcome::Success {
                result: json!({
                    "success": result.success,
                    "data": result.data,
                    "duration_ms": result.metadata.duration_ms,
                }),
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// state_snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn state_snapshot_def() -> ToolDefinition {
    ToolDefinition {
        name: "state_snapshot".into(),
        description: "Save a named checkpoint of the engine state.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Optional snapshot label" }
            }
        }),
    }
}

struct StateSnapshotTool;

#[async_trait::async_trait]
impl ToolExecutor for StateSnapshotTool {
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutcome {
        let name = input
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("snapshot-{}", Uuid::new_v4()));
        let snapshot_id = format!("{}:{name}", ctx.session_id);

        let doc = {
            let manager = ctx.context.lock().await;
            CheckpointDocument {
                session_id: snapshot_id.clone(),
                updated_at: Utc::now(),
                messages: manager.export_messages(),
                budget: manager.budget().clone(),
                resources: ctx.resources.clone(),
                task_state: ctx.plan.lock().clone(),
                metadata: CheckpointMetadata {
                    last_state_snapshot: None,
                    iteration: ctx.iteration,
                },
            }
        };

        match ctx.checkpoints.save(&doc) {
            Ok(()) => ToolOutcome::Success {
                result: json!({ "snapshot_id": snapshot_id }),
            },
            Err(e) => ToolOutcome::err(ErrorCode::ToolExecution, e.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// agent_delegate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn agent_delegate_def() -> ToolDefinition {
    ToolDefinition {
        name: "agent_delegate".into(),
        description: "Delegate a task to one or more sub-agents. The engine decides \
                      between direct, isolated, and parallel-isolated execution; \
                      only summarised results come back."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "The task to delegate" },
                "strategy": {
                    "type": "string",
                    "enum": ["direct", "isolated", "parallel"],
                    "description": "Optional override of the delegation decision"
                },
                "expected_output": { "type": "string", "description": "What the sub-agent should produce" }
            },
            "required": ["task"]
        }),
    }
}

struct AgentDelegateTool;

#[async_trait::async_trait]
impl ToolExecutor for AgentDelegateTool {
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(delegation) = ctx.delegation.as_ref() else {
            return ToolOutcome::err(
                ErrorCode::ToolExecution,
                "delegation is not available in this session",
            );
        };
        let task = input.get("task").and_then(Value::as_str).unwrap_or_default();
        let override_strategy = input
            .get("strategy")
            .and_then(Value::as_str)
            .and_then(crate::delegation::Strategy::parse);
        let expected_output = input
            .get("expected_output")
            .and_then(Value::as_str)
            .unwrap_or("a short summary of what was done");

        match delegation
            .run_task(
                task,
                expected_output,
                override_strategy,
                ctx.remaining_budget,
                ctx.events.clone(),
                ctx.iteration,
            )
            .await
        {
            Ok(result) => ToolOutcome::Success { result },
            Err(e) => ToolOutcome::err(ErrorCode::AgentExecutionFailed, e.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// agent_plan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn agent_plan_def() -> ToolDefinition {
    ToolDefinition {
        name: "agent_plan".into(),
        description: "Create or update the task plan. Steps reference each other \
                      by id; a step is ready when its dependencies are completed."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "set": {
                    "type": "array",
                    "description": "Replace the plan with these steps: [{id, description, depends_on?}]"
                },
                "update": {
                    "type": "array",
                    "description": "Status updates: [{id, status}] with status in pending|in_progress|completed|skipped"
                }
            }
        }),
    }
}

struct AgentPlanTool;

#[async_trait::async_trait]
impl ToolExecutor for AgentPlanTool {
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutcome {
        let mut plan_changed = false;
        let mut status_updates: Vec<(String, String)> = Vec::new();

        let (ready, tasks) = {
        let mut plan = ctx.plan.lock();

        if let Some(steps) = input.get("set").and_then(Value::as_array) {
            let mut next: Vec<PlanTask> = Vec::new();
            for step in steps {
                let Some(id) = step.get("id").and_then(Value::as_str) else {
                    return ToolOutcome::err(
                        ErrorCode::ValidationMissingField,
                        "every plan step needs an 'id'",
                    );
                };
                let description = step
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let depends_on: Vec<String> = step
                    .get("depends_on")
                    .and_then(Value::as_array)
                    .map(|deps| {
                        deps.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                next.push(PlanTask {
                    id: id.to_string(),
                    description: description.to_string(),
                    status: TaskStatus::Pending,
                    depends_on,
                });
            }
            // Dependencies must reference known step ids.
            for step in &next {
                for dep in &step.depends_on {
                    if !next.iter().any(|s| s.id == *dep) {
                        return ToolOutcome::err(
                            ErrorCode::ValidationInvalidFormat,
                            format!("step '{}' depends on unknown step '{dep}'", step.id),
                        );
                    }
                }
            }
            *plan = next;
            plan_changed = true;
        }

        if let Some(updates) = input.get("update").and_then(Value::as_array) {
            for update in updates {
                let id = update.get("id").and_then(Value::as_str).unwrap_or_default();
                let status = match update.get("status").and_then(Value::as_str) {
                    Some("pending") => TaskStatus::Pending,
                    Some("in_progress") => TaskStatus::InProgress,
                    Some("completed") => TaskStatus::Completed,
                    Some("skipped") => TaskStatus::Skipped,
                    other => {
                        return ToolOutcome::err(
                            ErrorCode::ValidationOutOfRange,
                            format!("invalid status {other:?}"),
                        )
                    }
                };
                match plan.iter_mut().find(|t| t.id == id) {
                    Some(task) => {
                        task.status = status;
                        status_updates.push((
                            task.id.clone(),
                            update
                                .get("status")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        ));
                    }
                    None => {
                        return ToolOutcome::err(
                            ErrorCode::ValidationInvalidFormat,
                            format!("no plan step with id '{id}'"),
                        )
                    }
                }
            }
        }

        let ready: Vec<String> = ready_tasks(&plan).iter().map(|t| t.id.clone()).collect();
        let tasks = plan.clone();
        (ready, tasks)
        };

        if let Some(events) = &ctx.events {
            if plan_changed {
                let _ = events
                    .send(ta_domain::event::EngineEvent::Plan {
                        iteration: ctx.iteration,
                        tasks: tasks.clone(),
                    })
                    .await;
            }
            for (task_id, status) in status_updates {
                let _ = events
                    .send(ta_domain::event::EngineEvent::TaskUpdate {
                        iteration: ctx.iteration,
                        task_id,
                        status,
                    })
                    .await;
            }
        }

        ToolOutcome::Success {
            result: json!({
                "tasks": tasks,
                "ready": ready,
            }),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// agent_clarify
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn agent_clarify_def() -> ToolDefinition {
    ToolDefinition {
        name: "agent_clarify".into(),
        description: "Ask the user a clarifying question. This pauses the task \
                      until the user answers; remaining tool calls this turn are \
                      skipped."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "questions": { "type": "array", "description": "Questions for the user" },
                "options": { "type": "array", "description": "Optional answer choices" },
                "reason": { "type": "string", "description": "Why clarification is needed" }
            },
            "required": ["questions"]
        }),
    }
}

struct AgentClarifyTool;

#[async_trait::async_trait]
impl ToolExecutor for AgentClarifyTool {
    async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolOutcome {
        let questions = input.get("questions").cloned().unwrap_or(json!([]));
        let options = input.get("options").cloned();
        let reason = input.get("reason").cloned();
        ToolOutcome::Success {
            result: json!({
                "clarification_id": Uuid::new_v4().to_string(),
                "questions": questions,
                "options": options,
                "reason": reason,
                "type": "clarification",
            }),
        }
    }
}
