//! End-to-end loop scenarios against the scripted provider and the
//! in-memory board backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use ta_adapters::traits::ActionAdapter;
use ta_adapters::BoardAdapter;
use ta_domain::config::Config;
use ta_domain::error::Result;
use ta_domain::event::EngineEvent;
use ta_engine::delegation::DelegationEngine;
use ta_engine::dispatch::hooks::{Hook, HookContext, HookDecision, HookEvent, HookRegistry};
use ta_engine::{CancelMap, Engine, EngineOptions};
use ta_providers::mock::{ScriptedProvider, ScriptedTurn};

async fn collect(mut rx: mpsc::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn names(events: &[EngineEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.type_name()).collect()
}

fn engine(provider: ScriptedProvider, adapter: Option<Arc<dyn ActionAdapter>>) -> Engine {
    Engine::new(
        Arc::new(provider),
        adapter,
        Arc::new(Config::default()),
        Arc::new(CancelMap::new()),
    )
}

// ── S1: single-turn completion, no tools ──────────────────────────

#[tokio::test]
async fn s1_single_turn_completion() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_turn("Hello there.")]);
    let engine = engine(provider, None);

    let (_handle, rx) = engine.run(
        "Say hello".into(),
        EngineOptions {
            max_iterations: Some(5),
            ..Default::default()
        },
    );
    let events = collect(rx).await;
    let kinds = names(&events);

    assert_eq!(kinds, vec!["system", "thinking", "context", "reasoning", "complete"]);
    match events.last().unwrap() {
        EngineEvent::Complete { summary, .. } => assert_eq!(summary, "Hello there."),
        other => panic!("unexpected terminal: {other:?}"),
    }
}

// ── S2: tool call then completion ─────────────────────────────────

struct SuccessWatcher {
    saw_success: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Hook for SuccessWatcher {
    fn name(&self) -> &str {
        "success-watcher"
    }
    fn events(&self) -> &[HookEvent] {
        &[HookEvent::PostToolUse]
    }
    async fn on_event(&self, ctx: &HookContext<'_>) -> Result<HookDecision> {
        if ctx.tool_name == Some("task_execute") {
            let success = ctx
                .result
                .and_then(|r| r.get("success"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if success {
                self.saw_success.store(true, Ordering::SeqCst);
            }
        }
        Ok(HookDecision::proceed())
    }
}

#[tokio::test]
async fn s2_tool_call_then_completion() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_turn(vec![(
            "task_execute",
            json!({ "action": "create_element", "params": { "type": "rectangle" } }),
        )]),
        ScriptedProvider::text_turn("Done."),
    ]);
    let board = Arc::new(BoardAdapter::new());
    let saw_success = Arc::new(AtomicBool::new(false));
    let hooks = Arc::new(HookRegistry::new());
    hooks.register(Arc::new(SuccessWatcher {
        saw_success: saw_success.clone(),
    }));

    let engine = Engine::new(
        Arc::new(provider),
        Some(board.clone() as Arc<dyn ActionAdapter>),
        Arc::new(Config::default()),
        Arc::new(CancelMap::new()),
    )
    .with_hooks(hooks);

    let (_handle, rx) = engine.run("Create a rectangle".into(), EngineOptions::default());
    let events = collect(rx).await;
    let kinds = names(&events);

    let acting = kinds.iter().filter(|k| **k == "acting").count();
    let observing = kinds.iter().filter(|k| **k == "observing").count();
    assert_eq!(acting, 1);
    assert_eq!(observing, 1);
    assert_eq!(*kinds.last().unwrap(), "complete");
    assert!(saw_success.load(Ordering::SeqCst), "post-hook saw the success");
    assert_eq!(board.element_count(), 1);

    // The observing event carries the created id.
    let created = events.iter().find_map(|e| match e {
        EngineEvent::Observing { result, .. } => result
            .get("data")
            .and_then(|d| d.get("id"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string),
        _ => None,
    });
    assert_eq!(created.as_deref(), Some("el-1"));
}

// ── S3: clarification interrupt short-circuits the turn ───────────

#[tokio::test]
async fn s3_clarification_interrupt() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::tool_turn(vec![
        ("agent_clarify", json!({ "questions": ["Which colour?"] })),
        (
            "task_execute",
            json!({ "action": "create_element", "params": { "type": "rectangle" } }),
        ),
    ])]);
    let board = Arc::new(BoardAdapter::new());
    let engine = engine(provider, Some(board.clone() as Arc<dyn ActionAdapter>));

    let (_handle, rx) = engine.run("Create something".into(), EngineOptions::default());
    let events = collect(rx).await;
    let kinds = names(&events);

    // Exactly one acting/observing pair (the clarify call), then the
    // interrupt; the second proposed call never runs.
    assert_eq!(kinds.iter().filter(|k| **k == "acting").count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == "observing").count(), 1);
    assert!(kinds.contains(&"clarification_needed"));
    assert_eq!(*kinds.last().unwrap(), "interrupted");
    assert_eq!(board.element_count(), 0);

    let (clarification_event_id, interrupted_id) = {
        let from_event = events.iter().find_map(|e| match e {
            EngineEvent::ClarificationNeeded {
                clarification_id, ..
            } => Some(clarification_id.clone()),
            _ => None,
        });
        let from_terminal = events.iter().find_map(|e| match e {
            EngineEvent::Interrupted {
                clarification_id, ..
            } => Some(clarification_id.clone()),
            _ => None,
        });
        (from_event.unwrap(), from_terminal.unwrap())
    };
    assert_eq!(clarification_event_id, interrupted_id);
}

// ── S4: repeated identical errors trigger the corrector ───────────

#[tokio::test]
async fn s4_error_loop_correction() {
    let failing_call = || {
        ScriptedProvider::tool_turn(vec![(
            "task_execute",
            json!({ "action": "delete_element", "params": { "id": "ghost" } }),
        )])
    };
    let provider = ScriptedProvider::new(vec![
        failing_call(),
        failing_call(),
        failing_call(),
        ScriptedProvider::text_turn("Giving up on ghost."),
    ]);
    let board = Arc::new(BoardAdapter::new());

    let mut config = Config::default();
    config.r#loop.max_errors = 10; // keep the error budget out of the way
    config.r#loop.max_iterations = 8;

    let engine = Engine::new(
        Arc::new(provider),
        Some(board as Arc<dyn ActionAdapter>),
        Arc::new(config),
        Arc::new(CancelMap::new()),
    );

    let (_handle, rx) = engine.run("Delete the ghost element".into(), EngineOptions::default());
    let events = collect(rx).await;
    let kinds = names(&events);

    // The corrector fired and was injected, and the loop was not
    // terminated by it.
    let correction = events.iter().find_map(|e| match e {
        EngineEvent::Correction { text, .. } => Some(text.clone()),
        _ => None,
    });
    let correction = correction.expect("a correction was injected");
    assert!(correction.contains("3 times"));
    assert_eq!(*kinds.last().unwrap(), "complete");
}

// ── S5: aging to archived relieves budget pressure ────────────────

#[tokio::test]
async fn s5_lifecycle_archives_under_pressure() {
    use ta_domain::config::LifecycleConfig;
    use ta_engine::context::compressor::{Compressor, ToolCompressorRegistry};
    use ta_engine::context::manager::{ContextManager, PrepareOptions};
    use ta_engine::{ResultStage, TokenEstimator, ToolResultLifecycle};

    let mut lifecycle =
        ToolResultLifecycle::new(LifecycleConfig::default(), ToolCompressorRegistry::new());
    let mut manager = ContextManager::new(1000, Compressor::new(TokenEstimator::default()));

    // Four fat tool results created at turn 0.
    let fat = "created 25 elements\n".to_string()
        + &"detail row with coordinates and styling data\n".repeat(40);
    for i in 0..4 {
        let call_id = format!("c{i}");
        lifecycle.add(call_id.as_str(), "task_execute", json!({}), fat.clone(), 0);
        manager.add_tool_result(call_id.as_str(), "task_execute", fat.clone(), false);
    }

    // Six turns later everything ages to archived one-liners.
    let report = lifecycle.age_results(6);
    assert_eq!(report.archived.len(), 4);
    for i in 0..4 {
        let call_id = format!("c{i}");
        assert_eq!(lifecycle.get(&call_id).unwrap().stage, ResultStage::Archived);
        let msg_id = manager.find_by_call_id(&call_id).unwrap();
        manager.replace_content(msg_id, lifecycle.get_content(&call_id).unwrap().to_string());
        manager.move_to_tier(msg_id, ta_domain::tier::Tier::Archived);
    }

    let prepared = manager.prepare_for_request(PrepareOptions::default()).await.unwrap();
    assert!(prepared.total_tokens <= 1000);
    // Nothing remains in the recent tier; the archived tier holds the
    // one-line summaries.
    assert!(manager.tier_messages(ta_domain::tier::Tier::Recent).is_empty());
    assert_eq!(
        manager.tier_messages(ta_domain::tier::Tier::Archived).len(),
        4
    );
    assert!(lifecycle.total_tokens() <= 4 * 100);
}

// ── S6: parallel-isolated delegation ──────────────────────────────

#[tokio::test]
async fn s6_parallel_isolated_delegation() {
    // Three sub-loops, one scripted completion each. The script is
    // shared, so every turn carries the same summary text.
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::text_turn("section complete"),
        ScriptedProvider::text_turn("section complete"),
        ScriptedProvider::text_turn("section complete"),
    ]);
    let delegation = DelegationEngine::new(
        Arc::new(provider),
        None,
        Arc::new(Config::default()),
        Arc::new(CancelMap::new()),
        "parent".into(),
    );

    let task = "create the header section, create the timeline, create the statistics panel";
    let decision = delegation.decide(task, "a summary", None, 100_000);
    let expected_order: Vec<String> = decision
        .contracts
        .iter()
        .map(|c| c.contract_id.clone())
        .collect();
    assert_eq!(expected_order.len(), 3);

    let (tx, mut rx) = mpsc::channel::<EngineEvent>(64);
    let result = delegation
        .run_task(task, "a summary", None, 100_000, Some(tx), 1)
        .await
        .unwrap();
    drop(delegation);

    assert_eq!(result["strategy"], "parallel-isolated");
    let reports = result["reports"].as_array().unwrap();
    assert_eq!(reports.len(), 3);
    for report in reports {
        assert_eq!(report["success"], true);
        assert_eq!(report["summary"], "section complete");
    }

    // Completion events arrive in contract order, and only summaries
    // cross the boundary (no sub-agent messages).
    let mut completed: Vec<String> = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::DelegationComplete { contract_id, .. } = event {
            completed.push(contract_id);
        }
    }
    let decision_ids: Vec<String> = reports
        .iter()
        .map(|r| r["contract_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(completed, decision_ids);
}

// ── Cancellation ──────────────────────────────────────────────────

#[tokio::test]
async fn interrupt_cancels_the_run() {
    // A provider that never stops calling tools.
    let turns: Vec<ScriptedTurn> = (0..50)
        .map(|_| {
            ScriptedProvider::tool_turn(vec![(
                "task_execute",
                json!({ "action": "create_element", "params": { "type": "rectangle" } }),
            )])
        })
        .collect();
    let provider = ScriptedProvider::new(turns);
    let board = Arc::new(BoardAdapter::new());
    let engine = engine(provider, Some(board as Arc<dyn ActionAdapter>));

    let (handle, rx) = engine.run("Create rectangles forever".into(), EngineOptions::default());
    handle.interrupt();
    let events = collect(rx).await;
    assert_eq!(*names(&events).last().unwrap(), "cancelled");
}

// ── Iteration limit ───────────────────────────────────────────────

#[tokio::test]
async fn iteration_limit_times_out() {
    let turns: Vec<ScriptedTurn> = (0..10)
        .map(|_| {
            ScriptedProvider::tool_turn(vec![(
                "task_execute",
                json!({ "action": "create_element", "params": { "type": "rectangle" } }),
            )])
        })
        .collect();
    let provider = ScriptedProvider::new(turns);
    let board = Arc::new(BoardAdapter::new());
    let engine = engine(provider, Some(board as Arc<dyn ActionAdapter>));

    let (_handle, rx) = engine.run(
        "Create rectangles".into(),
        EngineOptions {
            max_iterations: Some(3),
            ..Default::default()
        },
    );
    let events = collect(rx).await;
    assert_eq!(*names(&events).last().unwrap(), "timeout");
}

// ── Generation failure retry then recovery ────────────────────────

#[tokio::test]
async fn generation_error_retries_in_place() {
    let provider = ScriptedProvider::new(vec![
        ScriptedTurn::Fail("upstream hiccup".into()),
        ScriptedProvider::text_turn("Recovered."),
    ]);
    let engine = engine(provider, None);

    let (_handle, rx) = engine.run("Say something".into(), EngineOptions::default());
    let events = collect(rx).await;
    let kinds = names(&events);

    assert!(kinds.contains(&"recovery"));
    assert_eq!(*kinds.last().unwrap(), "complete");
    // The retried iteration keeps its number: the completing iteration
    // is still iteration 1.
    match events.last().unwrap() {
        EngineEvent::Complete { iteration, .. } => assert_eq!(*iteration, 1),
        other => panic!("unexpected terminal: {other:?}"),
    }
}

// ── Blocked tools are skipped, not failed ─────────────────────────

struct DenyExecution;

#[async_trait::async_trait]
impl Hook for DenyExecution {
    fn name(&self) -> &str {
        "deny-task-execute"
    }
    fn events(&self) -> &[HookEvent] {
        &[HookEvent::PreToolUse]
    }
    async fn on_event(&self, ctx: &HookContext<'_>) -> Result<HookDecision> {
        if ctx.tool_name == Some("task_execute") {
            Ok(HookDecision::block("writes are disabled"))
        } else {
            Ok(HookDecision::proceed())
        }
    }
}

#[tokio::test]
async fn blocked_tool_is_skipped() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_turn(vec![(
            "task_execute",
            json!({ "action": "create_element", "params": { "type": "rectangle" } }),
        )]),
        ScriptedProvider::text_turn("Could not create anything."),
    ]);
    let board = Arc::new(BoardAdapter::new());
    let hooks = Arc::new(HookRegistry::new());
    hooks.register(Arc::new(DenyExecution));

    let engine = Engine::new(
        Arc::new(provider),
        Some(board.clone() as Arc<dyn ActionAdapter>),
        Arc::new(Config::default()),
        Arc::new(CancelMap::new()),
    )
    .with_hooks(hooks);

    let (_handle, rx) = engine.run("Create a rectangle".into(), EngineOptions::default());
    let events = collect(rx).await;
    let kinds = names(&events);

    assert!(kinds.contains(&"blocked"));
    assert_eq!(kinds.iter().filter(|k| **k == "observing").count(), 0);
    assert_eq!(board.element_count(), 0);
    // A block is not an error: the run still completes.
    assert_eq!(*kinds.last().unwrap(), "complete");
}
