//! The loop orchestrator.
//!
//! `Engine::run` spawns one driver task per user task and returns a
//! channel of [`EngineEvent`]s. Each iteration walks THINK → GENERATE →
//! ACT → OBSERVE → DECIDE; the stream always ends after a terminal
//! decision. Cancellation is cooperative and checked at the start of
//! every phase and after every suspension point.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use ta_adapters::traits::{ActionAdapter, AwarenessOptions, StateOptions};
use ta_domain::config::Config;
use ta_domain::decision::Decision;
use ta_domain::error::{EngineError, Error, ErrorCode};
use ta_domain::event::EngineEvent;
use ta_domain::message::{priority, ContextMessage};
use ta_domain::state::{AgentResources, LoopState};
use ta_domain::tier::Tier;
use ta_providers::traits::{FinishReason, GenerateRequest, LlmProvider};

use crate::checkpoint::{
    CheckpointDocument, CheckpointMetadata, CheckpointStore, MemoryCheckpointStore,
};
use crate::context::compressor::{Compressor, Summarizer, ToolCompressorRegistry};
use crate::context::estimator::TokenEstimator;
use crate::context::manager::{build_context_manager, PrepareOptions};
use crate::delegation::DelegationEngine;
use crate::dispatch::builtin::register_builtin_tools;
use crate::dispatch::hooks::{HookContext, HookEvent, HookRegistry};
use crate::dispatch::{ToolContext, ToolDispatcher, ToolOutcome};
use crate::handle::{CancelMap, CancelToken, QueryHandle};
use crate::lifecycle::ToolResultLifecycle;
use crate::monitor::{EchoMonitor, IssueKind};
use crate::resolver::{AliasRegistry, AliasResolver, ResolveContext};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-run options layered over the engine config.
pub struct EngineOptions {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_iterations: Option<u32>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Sub-agents may not delegate further.
    pub allow_delegation: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            model: None,
            system_prompt: None,
            max_iterations: None,
            max_tokens: None,
            temperature: None,
            allow_delegation: true,
        }
    }
}

pub struct Engine {
    provider: Arc<dyn LlmProvider>,
    adapter: Option<Arc<dyn ActionAdapter>>,
    config: Arc<Config>,
    cancel_map: Arc<CancelMap>,
    hooks: Arc<HookRegistry>,
    aliases: Arc<AliasRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    summarizer: Option<Arc<dyn Summarizer>>,
    tool_compressors: ToolCompressorRegistry,
}

impl Engine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        adapter: Option<Arc<dyn ActionAdapter>>,
        config: Arc<Config>,
        cancel_map: Arc<CancelMap>,
    ) -> Self {
        Self {
            provider,
            adapter,
            config,
            cancel_map,
            hooks: Arc::new(HookRegistry::new()),
            aliases: Arc::new(AliasRegistry::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            summarizer: None,
            tool_compressors: ToolCompressorRegistry::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_aliases(mut self, aliases: Arc<AliasRegistry>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_tool_compressors(mut self, registry: ToolCompressorRegistry) -> Self {
        self.tool_compressors = registry;
        self
    }

    /// Start a run. Returns the control handle and the event stream; the
    /// stream ends after its terminal event.
    pub fn run(&self, task: String, opts: EngineOptions) -> (QueryHandle, mpsc::Receiver<EngineEvent>) {
        let session_id = opts
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let token = self.cancel_map.register(&session_id);
        let handle = QueryHandle::new(session_id.clone(), token.clone(), opts.model.clone());

        let (tx, rx) = mpsc::channel::<EngineEvent>(256);

        let driver = Driver {
            provider: self.provider.clone(),
            adapter: self.adapter.clone(),
            config: self.config.clone(),
            cancel_map: self.cancel_map.clone(),
            hooks: self.hooks.clone(),
            aliases: self.aliases.clone(),
            checkpoints: self.checkpoints.clone(),
            summarizer: self.summarizer.clone(),
            tool_compressors: self.tool_compressors.clone(),
            session_id: session_id.clone(),
            token,
            handle: handle.clone(),
            opts,
            task,
        };

        let cancel_map = self.cancel_map.clone();
        let run_handle = handle.clone();
        tokio::spawn(async move {
            driver.drive(tx).await;
            cancel_map.remove(&session_id);
            run_handle.mark_finished();
        });

        (handle, rx)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Driver — one task, one logical thread of control
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Driver {
    provider: Arc<dyn LlmProvider>,
    adapter: Option<Arc<dyn ActionAdapter>>,
    config: Arc<Config>,
    cancel_map: Arc<CancelMap>,
    hooks: Arc<HookRegistry>,
    aliases: Arc<AliasRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    summarizer: Option<Arc<dyn Summarizer>>,
    tool_compressors: ToolCompressorRegistry,
    session_id: String,
    token: CancelToken,
    handle: QueryHandle,
    opts: EngineOptions,
    task: String,
}

impl Driver {
    async fn drive(&self, tx: mpsc::Sender<EngineEvent>) {
        let emit = |event: EngineEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event).await;
            }
        };

        let max_iterations = self
            .opts
            .max_iterations
            .unwrap_or(self.config.r#loop.max_iterations);
        let max_errors = self.config.r#loop.max_errors as usize;

        // ── Build per-run machinery ──────────────────────────────────
        let mut budget_cfg = self.config.budget.clone();
        if let Some(max_tokens) = self.opts.max_tokens {
            budget_cfg.max_tokens = max_tokens;
        }
        let mut compressor = Compressor::new(TokenEstimator::new(budget_cfg.safety_margin))
            .with_tool_compressors(self.tool_compressors.clone());
        if let Some(summarizer) = &self.summarizer {
            compressor = compressor.with_summarizer(summarizer.clone());
        }
        let mut manager = build_context_manager(&budget_cfg, compressor);

        let domain = self
            .adapter
            .as_ref()
            .map(|a| a.domain().to_string())
            .unwrap_or_else(|| "none".into());

        let system_prompt = self
            .opts
            .system_prompt
            .clone()
            .unwrap_or_else(|| default_system_prompt(&domain));
        manager.add_system_message(system_prompt);

        let dispatcher = ToolDispatcher::new(self.hooks.clone());
        register_builtin_tools(&dispatcher);
        let tool_names: Vec<String> = dispatcher
            .definitions()
            .iter()
            .map(|d| d.name.clone())
            .collect();

        // Tool and action catalogues live in the tools tier.
        manager.add_message(tools_tier_message(&dispatcher), Tier::Tools);
        if let Some(adapter) = &self.adapter {
            manager.add_message(actions_tier_message(adapter.as_ref()), Tier::Tools);
        }

        let delegation = if self.opts.allow_delegation {
            Some(Arc::new(DelegationEngine::new(
                self.provider.clone(),
                self.adapter.clone(),
                self.config.clone(),
                self.cancel_map.clone(),
                self.session_id.clone(),
            )))
        } else {
            None
        };

        let manager = Arc::new(tokio::sync::Mutex::new(manager));
        let plan = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut lifecycle = ToolResultLifecycle::new(
            self.config.lifecycle.clone(),
            self.tool_compressors.clone(),
        );
        let mut monitor = EchoMonitor::new(self.config.monitor.clone());
        let resolver = AliasResolver::new(self.config.resolver.clone(), self.aliases.clone());

        let mut state = LoopState::new(
            AgentResources::new(domain.clone(), self.task.clone()),
            self.config.r#loop.history_cap,
        );

        if let Some(adapter) = &self.adapter {
            if !adapter.is_connected() {
                if let Err(e) = adapter.connect().await {
                    tracing::warn!(error = %e, "backend connect failed; continuing detached");
                }
            }
        }

        self.hooks
            .dispatch(&HookContext {
                event: HookEvent::SessionStart,
                session_id: &self.session_id,
                tool_name: None,
                input: None,
                result: None,
            })
            .await;

        emit(EngineEvent::System {
            session_id: self.session_id.clone(),
            model: self
                .handle
                .model()
                .unwrap_or_else(|| self.provider.default_model().to_string()),
            tools: tool_names,
            agents: vec!["worker".into()],
            timestamp: Utc::now(),
        })
        .await;

        // ── Think / Act / Observe / Decide ───────────────────────────
        'outer: loop {
            if self.token.is_cancelled() {
                emit(EngineEvent::Cancelled {
                    iteration: state.iteration,
                    reason: "cancelled by caller".into(),
                })
                .await;
                break;
            }

            state.iteration += 1;
            let iteration = state.iteration;
            emit(EngineEvent::Thinking { iteration }).await;

            // ── THINK ────────────────────────────────────────────────
            manager.lock().await.begin_iteration();

            if let Some(adapter) = &self.adapter {
                if state.resources.context.awareness_is_stale
                    || state.resources.context.awareness.is_none()
                {
                    match adapter
                        .get_awareness(AwarenessOptions {
                            include_skeleton: true,
                            include_relevant: true,
                            max_tokens: Some(self.config.r#loop.awareness_budget),
                            context_hint: Some(self.task.clone()),
                        })
                        .await
                    {
                        Ok(awareness) => state.resources.set_awareness(awareness),
                        Err(e) => {
                            emit(EngineEvent::Warning {
                                iteration,
                                message: format!("awareness refresh failed: {e}"),
                            })
                            .await;
                        }
                    }
                }

                match adapter.get_state(StateOptions::default()).await {
                    Ok(snapshot) => state.last_state_snapshot = Some(snapshot),
                    Err(e) => {
                        // Keep the previous snapshot on failure.
                        emit(EngineEvent::Warning {
                            iteration,
                            message: format!("state snapshot failed: {e}"),
                        })
                        .await;
                    }
                }

                if self.token.is_cancelled() {
                    emit(EngineEvent::Cancelled {
                        iteration,
                        reason: "cancelled by caller".into(),
                    })
                    .await;
                    break;
                }
            }

            // Age tool results and mirror the transitions into context.
            let aging = lifecycle.age_results(iteration);
            {
                let mut mgr = manager.lock().await;
                for call_id in aging.compressed.iter().chain(aging.archived.iter()) {
                    if let (Some(msg_id), Some(content)) =
                        (mgr.find_by_call_id(call_id), lifecycle.get_content(call_id))
                    {
                        let content = content.to_string();
                        mgr.replace_content(msg_id, content);
                    }
                }
                for call_id in &aging.evicted {
                    if let Some(msg_id) = mgr.find_by_call_id(call_id) {
                        mgr.remove(msg_id);
                    }
                }
                if !aging.archived.is_empty() {
                    for call_id in &aging.archived {
                        if let Some(msg_id) = mgr.find_by_call_id(call_id) {
                            mgr.move_to_tier(msg_id, Tier::Archived);
                        }
                    }
                }
            }

            // Ephemeral injections: state, plan, corrections.
            {
                let mut mgr = manager.lock().await;
                if let Some(snapshot) = &state.last_state_snapshot {
                    let text = format!("Current state: {}", snapshot.summary);
                    let tokens = mgr.estimator().estimate_text(&text);
                    mgr.add_ephemeral(text, "state", priority::HIGH);
                    emit(EngineEvent::ContextInjected {
                        iteration,
                        kind: "state".into(),
                        tokens,
                    })
                    .await;
                }
                let tasks = plan.lock().clone();
                if !tasks.is_empty() {
                    let lines: Vec<String> = tasks
                        .iter()
                        .map(|t: &ta_domain::state::PlanTask| format!("- [{}] {}: {}", status_mark(t.status), t.id, t.description))
                        .collect();
                    let text = format!("Task plan:\n{}", lines.join("\n"));
                    let tokens = mgr.estimator().estimate_text(&text);
                    mgr.add_ephemeral(text, "tasks", priority::HIGH);
                    emit(EngineEvent::ContextInjected {
                        iteration,
                        kind: "tasks".into(),
                        tokens,
                    })
                    .await;
                }
                if let Some(corrections) = monitor.pop_pending_corrections() {
                    emit(EngineEvent::Correction {
                        iteration,
                        text: corrections.clone(),
                    })
                    .await;
                    let tokens = mgr.estimator().estimate_text(&corrections);
                    mgr.add_ephemeral(corrections, "corrections", priority::CRITICAL);
                    emit(EngineEvent::ContextInjected {
                        iteration,
                        kind: "corrections".into(),
                        tokens,
                    })
                    .await;
                }
            }

            // Alias expansion on the task text.
            let resolve_ctx = ResolveContext {
                session_id: self.session_id.clone(),
                task: self.task.clone(),
                domain: domain.clone(),
            };
            for alias in resolver.find_aliases(&self.task) {
                emit(EngineEvent::AliasResolving {
                    iteration,
                    alias: alias.display(),
                })
                .await;
            }
            let remaining = manager.lock().await.budget().remaining();
            let resolved_task = match resolver
                .resolve_prompt(&self.task, &resolve_ctx, remaining)
                .await
            {
                Ok(resolved) => {
                    for alias in &resolved.resolved {
                        emit(EngineEvent::AliasResolved {
                            iteration,
                            alias: alias.display(),
                            failed: false,
                        })
                        .await;
                    }
                    for err in &resolved.errors {
                        emit(EngineEvent::AliasResolved {
                            iteration,
                            alias: format!("@{}", err.name),
                            failed: true,
                        })
                        .await;
                    }
                    if let Some(section) = resolved.context_section {
                        let mut msg = ContextMessage::user(section);
                        msg.priority = priority::NORMAL;
                        msg.metadata.provenance = Some("alias_context".into());
                        manager.lock().await.add_message(msg, Tier::Resources);
                    }
                    resolved.text
                }
                Err(e) => {
                    // fail_fast policy: alias failure fails the turn.
                    emit(EngineEvent::Failed {
                        iteration,
                        reason: format!("alias resolution failed: {e}"),
                        errors: state.errors.clone(),
                    })
                    .await;
                    break;
                }
            };

            let user_text = assemble_user_message(
                &resolved_task,
                &state,
                self.config.r#loop.history_lines_in_prompt,
            );

            // ── GENERATE ─────────────────────────────────────────────
            let prepared = {
                let mut mgr = manager.lock().await;
                match mgr
                    .prepare_for_request(PrepareOptions {
                        incoming: Some(ContextMessage::user(user_text.clone())),
                    })
                    .await
                {
                    Ok(prepared) => prepared,
                    Err(e) => {
                        emit(EngineEvent::Failed {
                            iteration,
                            reason: format!("context overflow: {e}"),
                            errors: state.errors.clone(),
                        })
                        .await;
                        break;
                    }
                }
            };
            emit(EngineEvent::Context {
                iteration,
                messages: prepared.messages.len(),
                tokens_used: prepared.total_tokens,
                tokens_budget: budget_cfg.max_tokens,
            })
            .await;

            let (history, _) = {
                let mgr = manager.lock().await;
                let mut api = mgr.to_api_format(&prepared);
                // The assembled user message travels separately.
                let user = api.pop();
                (api, user)
            };

            let response = self
                .provider
                .generate(GenerateRequest {
                    model: self.handle.model(),
                    system_prompt: prepared.system_prompt.clone(),
                    user_message: user_text,
                    tools: dispatcher.definitions(),
                    history,
                    max_tokens: Some(budget_cfg.response_reserve),
                    temperature: self.opts.temperature.or(Some(0.2)),
                })
                .await;

            if self.token.is_cancelled() {
                emit(EngineEvent::Cancelled {
                    iteration,
                    reason: "cancelled by caller".into(),
                })
                .await;
                break;
            }

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    if is_api_key_missing(&e) {
                        let error =
                            EngineError::new(ErrorCode::AgentApiKeyMissing, e.to_string());
                        emit(EngineEvent::Failed {
                            iteration,
                            reason: error.user_message().to_string(),
                            errors: vec![error],
                        })
                        .await;
                        break;
                    }

                    let message = e.to_string();
                    if let Some(detected) = monitor.detect_error_loop(&message, "generate") {
                        monitor.add_repeated_error_correction("generate", detected.count);
                    }
                    state
                        .errors
                        .push(EngineError::new(
                            ErrorCode::AgentGenerationFailed,
                            message.clone(),
                        ));
                    tracing::warn!(
                        iteration,
                        error = %message,
                        errors = state.errors.len(),
                        "generation failed"
                    );
                    if state.errors.len() >= max_errors {
                        emit(EngineEvent::Failed {
                            iteration,
                            reason: "generation error budget exhausted".into(),
                            errors: state.errors.clone(),
                        })
                        .await;
                        break;
                    }
                    emit(EngineEvent::Recovery {
                        iteration,
                        error: message,
                        attempt: state.errors.len() as u32,
                    })
                    .await;
                    // Retry the same iteration number.
                    state.iteration -= 1;
                    continue;
                }
            };

            if let Some(text) = response.text.as_deref().filter(|t| !t.trim().is_empty()) {
                emit(EngineEvent::Reasoning {
                    iteration,
                    text: text.to_string(),
                })
                .await;
                manager.lock().await.add_assistant_message(text);
            }

            // A text-only stop turn is the natural completion; the DECIDE
            // rules consume it below.
            let natural_complete = if response.tool_calls.is_empty()
                && response.finish_reason == FinishReason::Stop
            {
                Some(
                    response
                        .text
                        .as_deref()
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                )
            } else {
                None
            };

            // ── ACT ──────────────────────────────────────────────────
            let remaining_budget = {
                let mgr = manager.lock().await;
                mgr.budget().available().saturating_sub(prepared.total_tokens)
            };
            let tool_ctx = ToolContext {
                session_id: self.session_id.clone(),
                adapter: self.adapter.clone(),
                context: manager.clone(),
                plan: plan.clone(),
                checkpoints: self.checkpoints.clone(),
                events: Some(tx.clone()),
                iteration,
                remaining_budget,
                delegation: delegation.clone(),
                resources: state.resources.clone(),
            };

            let mut interrupted: Option<String> = None;
            let mut executed: Vec<(ta_domain::tool::ToolCall, Value, bool)> = Vec::new();

            for call in &response.tool_calls {
                if self.token.is_cancelled() {
                    emit(EngineEvent::Cancelled {
                        iteration,
                        reason: "cancelled by caller".into(),
                    })
                    .await;
                    break 'outer;
                }

                emit(EngineEvent::Acting {
                    iteration,
                    tool: call.tool_name.clone(),
                    input: call.arguments.clone(),
                })
                .await;

                let outcome = dispatcher
                    .dispatch(&call.tool_name, call.arguments.clone(), &tool_ctx)
                    .await;

                match outcome {
                    ToolOutcome::Blocked { reason } => {
                        emit(EngineEvent::Blocked {
                            iteration,
                            tool: call.tool_name.clone(),
                            reason,
                        })
                        .await;
                    }
                    ToolOutcome::Clarification {
                        clarification_id,
                        questions,
                        options,
                    } => {
                        let result = serde_json::json!({
                            "clarification_id": clarification_id.clone(),
                            "questions": questions.clone(),
                        });
                        emit(EngineEvent::Observing {
                            iteration,
                            tool: call.tool_name.clone(),
                            call_id: call.call_id.clone(),
                            result,
                            is_error: false,
                        })
                        .await;
                        emit(EngineEvent::ClarificationNeeded {
                            iteration,
                            clarification_id: clarification_id.clone(),
                            questions,
                            options,
                        })
                        .await;
                        interrupted = Some(clarification_id);
                        // Remaining calls in this turn are skipped.
                        break;
                    }
                    outcome => {
                        let value = outcome.to_value();
                        let is_error = outcome.is_error();
                        emit(EngineEvent::Observing {
                            iteration,
                            tool: call.tool_name.clone(),
                            call_id: call.call_id.clone(),
                            result: value.clone(),
                            is_error,
                        })
                        .await;
                        if let ToolOutcome::Error { error } = &outcome {
                            state.errors.push(error.clone());
                        }
                        manager.lock().await.add_tool_result(
                            call.call_id.as_str(),
                            call.tool_name.as_str(),
                            value.to_string(),
                            is_error,
                        );
                        executed.push((call.clone(), value, is_error));
                    }
                }
            }

            // ── OBSERVE ──────────────────────────────────────────────
            for (call, value, is_error) in &executed {
                lifecycle.add(
                    call.call_id.as_str(),
                    call.tool_name.as_str(),
                    value.clone(),
                    value.to_string(),
                    iteration,
                );

                let error_message = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let repeated =
                    monitor.record(&call.tool_name, &call.arguments, error_message.as_deref());

                if *is_error {
                    if let Some(message) = &error_message {
                        if let Some(detected) =
                            monitor.detect_error_loop(message, &call.tool_name)
                        {
                            monitor
                                .add_repeated_error_correction(&call.tool_name, detected.count);
                        }
                    }
                } else {
                    monitor.clear_error_streak(&call.tool_name);

                    // Identical failing calls are caught by the error
                    // streak above; the fingerprint hint covers the loop
                    // that keeps re-issuing a call that succeeds.
                    if let Some(repeated) = repeated {
                        monitor.add_repeated_call_correction(&repeated.tool, repeated.count);
                    }

                    if let Some(snapshot) = &state.last_state_snapshot {
                        let validation =
                            monitor.validate_tool_result(&call.tool_name, value, snapshot);
                        for issue in validation.issues {
                            match issue.kind {
                                IssueKind::InvalidId => {
                                    monitor.add_invalid_id_correction(&issue.claimed)
                                }
                                IssueKind::StaleState => {
                                    monitor.add_stale_state_correction(&issue.claimed)
                                }
                            }
                        }
                    }
                }

                state.push_history(ta_domain::state::HistoryEntry {
                    tool: call.tool_name.clone(),
                    result: preview(&value.to_string(), 200),
                    is_error: *is_error,
                });

                // Mutation effect rule: mutating tools invalidate
                // awareness, read-only tools only bump the version.
                if self.is_mutating_call(call) {
                    state.resources.record_mutation();
                } else {
                    state.resources.record_read();
                }
            }
            state.task_state = plan.lock().clone();

            // Periodic checkpoint.
            let interval = self.config.r#loop.checkpoint_interval;
            if interval > 0 && iteration % interval == 0 {
                let doc = {
                    let mgr = manager.lock().await;
                    CheckpointDocument {
                        session_id: self.session_id.clone(),
                        updated_at: Utc::now(),
                        messages: mgr.export_messages(),
                        budget: mgr.budget().clone(),
                        resources: state.resources.clone(),
                        task_state: state.task_state.clone(),
                        metadata: CheckpointMetadata {
                            last_state_snapshot: state.last_state_snapshot.clone(),
                            iteration,
                        },
                    }
                };
                if let Err(e) = self.checkpoints.save(&doc) {
                    tracing::warn!(error = %e, "checkpoint save failed");
                } else {
                    emit(EngineEvent::Checkpoint {
                        iteration,
                        session_id: self.session_id.clone(),
                    })
                    .await;
                }
            }

            // ── DECIDE (ordered) ─────────────────────────────────────
            let decision = decide(
                self.token.is_cancelled(),
                natural_complete,
                interrupted,
                &state.errors,
                max_errors,
                iteration,
                max_iterations,
            );
            match decision {
                Decision::Continue => {
                    state.is_first_iteration = false;
                }
                Decision::Complete { summary } => {
                    emit(EngineEvent::Complete { iteration, summary }).await;
                    break;
                }
                Decision::Interrupted { clarification_id } => {
                    emit(EngineEvent::Interrupted {
                        iteration,
                        clarification_id,
                    })
                    .await;
                    break;
                }
                Decision::Failed { reason, errors } => {
                    emit(EngineEvent::Failed {
                        iteration,
                        reason,
                        errors,
                    })
                    .await;
                    break;
                }
                Decision::Cancelled { reason } => {
                    emit(EngineEvent::Cancelled { iteration, reason }).await;
                    break;
                }
                Decision::Timeout => {
                    emit(EngineEvent::Timeout { iteration }).await;
                    break;
                }
            }
        }

        self.hooks
            .dispatch(&HookContext {
                event: HookEvent::SessionEnd,
                session_id: &self.session_id,
                tool_name: None,
                input: None,
                result: None,
            })
            .await;
    }

    fn is_mutating_call(&self, call: &ta_domain::tool::ToolCall) -> bool {
        match call.tool_name.as_str() {
            "task_execute" => {
                let action = call
                    .arguments
                    .get("action")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.adapter
                    .as_ref()
                    .map(|a| a.is_mutation(action))
                    .unwrap_or(false)
            }
            // Sub-agents act on the backend on our behalf.
            "agent_delegate" => true,
            _ => false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt assembly helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn default_system_prompt(domain: &str) -> String {
    format!(
        "You are Tandem, an execution agent operating the '{domain}' backend.\n\
         Work through the user's task with the available tools. Use task_execute \
         for domain actions, agent_plan to track multi-step work, and agent_clarify \
         when the task is ambiguous. When the task is complete, reply with a short \
         summary instead of calling more tools."
    )
}

fn tools_tier_message(dispatcher: &ToolDispatcher) -> ContextMessage {
    let lines: Vec<String> = dispatcher
        .definitions()
        .iter()
        .map(|d| format!("- {}: {}", d.name, d.description))
        .collect();
    let mut msg = ContextMessage::system(format!("Available tools:\n{}", lines.join("\n")));
    msg.priority = priority::HIGH;
    msg
}

fn actions_tier_message(adapter: &dyn ActionAdapter) -> ContextMessage {
    let lines: Vec<String> = adapter
        .available_actions()
        .iter()
        .map(|a| format!("- {}: {}", a.name, a.description))
        .collect();
    let mut msg = ContextMessage::system(format!(
        "Backend actions for task_execute:\n{}",
        lines.join("\n")
    ));
    msg.priority = priority::HIGH;
    msg
}

fn assemble_user_message(resolved_task: &str, state: &LoopState, history_lines: usize) -> String {
    let mut parts = vec![format!("Task: {resolved_task}")];

    if let Some(awareness) = &state.resources.context.awareness {
        parts.push(format!("State summary: {}", awareness.summary));
        if let Some(skeleton) = &awareness.skeleton {
            if !skeleton.is_empty() {
                parts.push(format!("Structure:\n{skeleton}"));
            }
        }
        if !awareness.relevant.is_empty() {
            parts.push(format!("Relevant items: {}", awareness.relevant.join(", ")));
        }
    }

    let recent = state.recent_history_lines(history_lines);
    if !recent.is_empty() {
        parts.push(format!("Recent tool activity:\n{}", recent.join("\n")));
    }

    parts.push(
        "Decide the next step. Call tools to make progress, or reply with a final \
         summary if the task is done."
            .into(),
    );
    parts.join("\n\n")
}

fn status_mark(status: ta_domain::state::TaskStatus) -> &'static str {
    match status {
        ta_domain::state::TaskStatus::Pending => " ",
        ta_domain::state::TaskStatus::InProgress => "~",
        ta_domain::state::TaskStatus::Completed => "x",
        ta_domain::state::TaskStatus::Skipped => "-",
    }
}

/// The ordered DECIDE check list. Exactly one rule fires per call:
/// cancellation, natural completion, interrupts, the error budget, the
/// iteration limit, then continue.
#[allow(clippy::too_many_arguments)]
fn decide(
    cancelled: bool,
    natural_complete: Option<String>,
    interrupted: Option<String>,
    errors: &[EngineError],
    max_errors: usize,
    iteration: u32,
    max_iterations: u32,
) -> Decision {
    if cancelled {
        return Decision::Cancelled {
            reason: "cancelled by caller".into(),
        };
    }
    if let Some(summary) = natural_complete {
        return Decision::Complete { summary };
    }
    if let Some(clarification_id) = interrupted {
        return Decision::Interrupted { clarification_id };
    }
    if errors.len() >= max_errors {
        return Decision::Failed {
            reason: "error budget exhausted".into(),
            errors: errors.to_vec(),
        };
    }
    if iteration >= max_iterations {
        return Decision::Timeout;
    }
    Decision::Continue
}

fn is_api_key_missing(error: &Error) -> bool {
    matches!(
        error,
        Error::Engine(EngineError {
            code: ErrorCode::AgentApiKeyMissing,
            ..
        })
    )
}

fn preview(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut boundary = max;
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}…", &text[..boundary])
}
