//! Sub-agent delegation.
//!
//! Given a task, the engine decides between running it in the parent
//! loop (direct), spawning one isolated sub-loop, or fanning out
//! parallel isolated sub-loops with disjoint work regions. Sub-loops get
//! a fresh context seeded only from their contract; the parent sees
//! nothing but the summarised report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use ta_adapters::scoped::ScopedAdapter;
use ta_adapters::traits::ActionAdapter;
use ta_domain::config::Config;
use ta_domain::contract::{Bounds, ContractLimits, SubAgentContract, SubAgentReport, WorkRegion};
use ta_domain::error::{EngineError, Error, ErrorCode, Result};
use ta_domain::event::EngineEvent;
use ta_providers::traits::LlmProvider;

use crate::handle::CancelMap;
use crate::orchestrator::{Engine, EngineOptions};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct,
    Isolated,
    ParallelIsolated,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Strategy::Direct),
            "isolated" => Some(Strategy::Isolated),
            "parallel" | "parallel-isolated" => Some(Strategy::ParallelIsolated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Direct => "direct",
            Strategy::Isolated => "isolated",
            Strategy::ParallelIsolated => "parallel-isolated",
        }
    }
}

#[derive(Debug)]
pub struct DelegationDecision {
    pub strategy: Strategy,
    pub reason: String,
    pub confidence: f64,
    pub contracts: Vec<SubAgentContract>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default)]
struct TaskAnalysis {
    estimated_operations: u32,
    has_specialization: bool,
    specialists: u32,
    multiple_goals: bool,
    subtasks: Vec<String>,
    sequential: bool,
    high_risk: bool,
}

const ACTION_VERBS: [&str; 14] = [
    "create", "add", "build", "draw", "generate", "update", "move", "align", "resize",
    "delete", "remove", "replace", "arrange", "clear",
];

const HIGH_RISK_PHRASES: [&str; 5] =
    ["delete all", "replace all", "clear", "remove all", "wipe"];

const SEQUENCE_MARKERS: [&str; 4] = ["then", "after that", "once", "followed by"];

const SPECIALIST_GROUPS: [&[&str]; 4] = [
    &["layout", "align", "arrange", "grid"],
    &["style", "color", "colour", "theme"],
    &["data", "chart", "statistic", "timeline"],
    &["text", "copy", "headline", "label"],
];

fn analyze(task: &str) -> TaskAnalysis {
    let lower = task.to_lowercase();

    let verb_count = ACTION_VERBS
        .iter()
        .map(|v| lower.matches(v).count() as u32)
        .sum::<u32>();

    // Comma/and-separated segments that carry their own verb are
    // candidate subtasks.
    let subtasks: Vec<String> = lower
        .split([',', ';'])
        .flat_map(|part| part.split(" and "))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter(|part| ACTION_VERBS.iter().any(|v| part.contains(v)) || part.len() > 3)
        .map(str::to_string)
        .collect();

    let specialists = SPECIALIST_GROUPS
        .iter()
        .filter(|group| group.iter().any(|kw| lower.contains(kw)))
        .count() as u32;

    TaskAnalysis {
        estimated_operations: verb_count.max(subtasks.len() as u32),
        has_specialization: specialists >= 1,
        specialists,
        multiple_goals: subtasks.len() >= 2,
        sequential: SEQUENCE_MARKERS.iter().any(|m| lower.contains(m)),
        high_risk: HIGH_RISK_PHRASES.iter().any(|p| lower.contains(p)),
        subtasks,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DelegationEngine {
    provider: Arc<dyn LlmProvider>,
    adapter: Option<Arc<dyn ActionAdapter>>,
    config: Arc<Config>,
    cancel_map: Arc<CancelMap>,
    /// The parent session, for cascading cancellation.
    parent_session: String,
}

impl DelegationEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        adapter: Option<Arc<dyn ActionAdapter>>,
        config: Arc<Config>,
        cancel_map: Arc<CancelMap>,
        parent_session: String,
    ) -> Self {
        Self {
            provider,
            adapter,
            config,
            cancel_map,
            parent_session,
        }
    }

    fn default_limits(&self) -> ContractLimits {
        let d = &self.config.delegation;
        ContractLimits {
            max_iterations: d.sub_agent_max_iterations,
            max_tokens: d.sub_agent_max_tokens,
            timeout_ms: d.sub_agent_timeout_ms,
        }
    }

    fn contract(&self, task: &str, expected_output: &str, region: WorkRegion) -> SubAgentContract {
        SubAgentContract {
            contract_id: format!("ct-{}", Uuid::new_v4()),
            agent_type: "worker".into(),
            task: task.to_string(),
            work_region: region,
            inputs: Value::Null,
            expected_output: expected_output.to_string(),
            limits: self.default_limits(),
        }
    }

    /// The ordered heuristic rule set. Exactly one rule fires.
    pub fn decide(
        &self,
        task: &str,
        expected_output: &str,
        user_override: Option<Strategy>,
        remaining_budget: u32,
    ) -> DelegationDecision {
        let analysis = analyze(task);
        let d = &self.config.delegation;

        // 1. User override wins.
        if let Some(strategy) = user_override {
            return self.build_decision(
                strategy,
                "user override",
                1.0,
                task,
                expected_output,
                &analysis,
            );
        }

        // 2. Trivial tasks run in the parent loop.
        if analysis.estimated_operations <= d.direct_ops_threshold
            && !analysis.has_specialization
            && !analysis.multiple_goals
        {
            return self.build_decision(
                Strategy::Direct,
                "few operations, single goal",
                0.9,
                task,
                expected_output,
                &analysis,
            );
        }

        // 3. High-risk verbs are contained in isolation.
        if analysis.high_risk {
            return self.build_decision(
                Strategy::Isolated,
                "destructive operation, isolating blast radius",
                0.85,
                task,
                expected_output,
                &analysis,
            );
        }

        // 4. Independent subtasks fan out.
        if analysis.subtasks.len() >= 2 && !analysis.sequential {
            return self.build_decision(
                Strategy::ParallelIsolated,
                "independent subtasks with no ordering dependency",
                0.75,
                task,
                expected_output,
                &analysis,
            );
        }

        // 5. Multiple implied specialists isolate.
        if analysis.specialists >= 2 {
            return self.build_decision(
                Strategy::Isolated,
                "multiple specialisations implied",
                0.7,
                task,
                expected_output,
                &analysis,
            );
        }

        // 6. Budget pressure pushes medium tasks out of the parent.
        if remaining_budget < d.low_budget_tokens && analysis.estimated_operations > 5 {
            return self.build_decision(
                Strategy::Isolated,
                "parent context is low on budget",
                0.65,
                task,
                expected_output,
                &analysis,
            );
        }

        // 7. Large tasks isolate regardless.
        if analysis.estimated_operations > d.isolate_ops_threshold {
            return self.build_decision(
                Strategy::Isolated,
                "operation count exceeds the direct threshold",
                0.7,
                task,
                expected_output,
                &analysis,
            );
        }

        // 8/9. Single specialist or anything else: direct.
        self.build_decision(
            Strategy::Direct,
            "moderate task, no isolation trigger",
            0.6,
            task,
            expected_output,
            &analysis,
        )
    }

    fn build_decision(
        &self,
        strategy: Strategy,
        reason: &str,
        confidence: f64,
        task: &str,
        expected_output: &str,
        analysis: &TaskAnalysis,
    ) -> DelegationDecision {
        let mut warnings = Vec::new();
        let contracts = match strategy {
            Strategy::Direct => Vec::new(),
            Strategy::Isolated => vec![self.contract(
                task,
                expected_output,
                WorkRegion {
                    scope: "entire workspace".into(),
                    bounds: None,
                },
            )],
            Strategy::ParallelIsolated => {
                // One contract per subtask, laid out in disjoint columns.
                const COLUMN_WIDTH: f64 = 1000.0;
                analysis
                    .subtasks
                    .iter()
                    .enumerate()
                    .map(|(i, subtask)| {
                        self.contract(
                            subtask,
                            expected_output,
                            WorkRegion {
                                scope: subtask.clone(),
                                bounds: Some(Bounds {
                                    x: i as f64 * COLUMN_WIDTH,
                                    y: 0.0,
                                    width: COLUMN_WIDTH,
                                    height: COLUMN_WIDTH,
                                }),
                            },
                        )
                    })
                    .collect()
            }
        };

        if analysis.high_risk && strategy != Strategy::Isolated {
            warnings.push("task contains destructive verbs".into());
        }

        DelegationDecision {
            strategy,
            reason: reason.to_string(),
            confidence,
            contracts,
            warnings,
        }
    }

    // ── Execution ─────────────────────────────────────────────────

    /// Decide and execute. Returns the JSON result for the
    /// `agent_delegate` tool.
    pub async fn run_task(
        &self,
        task: &str,
        expected_output: &str,
        user_override: Option<Strategy>,
        remaining_budget: u32,
        events: Option<mpsc::Sender<EngineEvent>>,
        iteration: u32,
    ) -> Result<Value> {
        let decision = self.decide(task, expected_output, user_override, remaining_budget);

        if decision.strategy == Strategy::Direct {
            return Ok(json!({
                "strategy": "direct",
                "reason": decision.reason,
                "confidence": decision.confidence,
                "guidance": "run this task in the current loop with task_execute",
            }));
        }

        if let Some(tx) = &events {
            let _ = tx
                .send(EngineEvent::Delegating {
                    iteration,
                    strategy: decision.strategy.as_str().into(),
                    contracts: decision
                        .contracts
                        .iter()
                        .map(|c| c.contract_id.clone())
                        .collect(),
                })
                .await;
        }

        let reports = match decision.strategy {
            Strategy::Direct => unreachable!("handled above"),
            Strategy::Isolated => {
                let mut reports = Vec::new();
                for contract in &decision.contracts {
                    reports.push(self.execute_contract(contract).await);
                }
                reports
            }
            Strategy::ParallelIsolated => {
                verify_disjoint(&decision.contracts)?;
                // Concurrent sub-loops; join_all keeps contract order.
                join_all(
                    decision
                        .contracts
                        .iter()
                        .map(|contract| self.execute_contract(contract)),
                )
                .await
            }
        };

        if let Some(tx) = &events {
            for report in &reports {
                let _ = tx
                    .send(EngineEvent::DelegationComplete {
                        iteration,
                        contract_id: report.contract_id.clone(),
                        success: report.success,
                        summary: report.summary.clone(),
                    })
                    .await;
            }
        }

        Ok(json!({
            "strategy": decision.strategy.as_str(),
            "reason": decision.reason,
            "confidence": decision.confidence,
            "warnings": decision.warnings,
            "reports": reports,
        }))
    }

    /// Spawn one isolated sub-loop and wait for its summary. The parent
    /// never sees the sub-loop's messages.
    pub async fn execute_contract(&self, contract: &SubAgentContract) -> SubAgentReport {
        let started = Instant::now();
        let session_id = contract.contract_id.clone();

        let adapter: Option<Arc<dyn ActionAdapter>> = self.adapter.as_ref().map(|inner| {
            Arc::new(ScopedAdapter::new(inner.clone(), contract.work_region.clone()))
                as Arc<dyn ActionAdapter>
        });

        let system_prompt = format!(
            "You are a focused sub-agent. Complete exactly this task and nothing else.\n\
             Work region: {}.\nExpected output: {}.\n\
             When finished, reply with a short summary of what you produced.",
            contract.work_region.scope, contract.expected_output
        );

        let sub_engine = Engine::new(
            self.provider.clone(),
            adapter,
            self.config.clone(),
            self.cancel_map.clone(),
        );

        let task_text = if contract.inputs.is_null() {
            contract.task.clone()
        } else {
            format!("{}\n\nInputs:\n{}", contract.task, contract.inputs)
        };

        let (handle, mut rx) = sub_engine.run(
            task_text,
            EngineOptions {
                session_id: Some(session_id.clone()),
                system_prompt: Some(system_prompt),
                max_iterations: Some(contract.limits.max_iterations),
                max_tokens: Some(contract.limits.max_tokens),
                allow_delegation: false,
                ..Default::default()
            },
        );
        self.cancel_map
            .add_to_group(&self.parent_session, &session_id);

        let mut summary = String::new();
        let mut success = false;
        let mut error: Option<EngineError> = None;
        let mut produced_ids: Vec<String> = Vec::new();
        let mut tokens_used = 0u32;

        let deadline = Duration::from_millis(contract.limits.timeout_ms);
        let drain = async {
            while let Some(event) = rx.recv().await {
                match event {
                    EngineEvent::Complete { summary: text, .. } => {
                        summary = text;
                        success = true;
                    }
                    EngineEvent::Failed { reason, errors, .. } => {
                        summary = reason;
                        error = errors.into_iter().next();
                    }
                    EngineEvent::Timeout { .. } => {
                        summary = "sub-agent ran out of iterations".into();
                        error = Some(EngineError::new(
                            ErrorCode::AgentMaxIterations,
                            "sub-agent iteration limit reached",
                        ));
                    }
                    EngineEvent::Cancelled { reason, .. } => {
                        summary = format!("sub-agent cancelled: {reason}");
                        error = Some(EngineError::new(ErrorCode::AgentCancelled, reason));
                    }
                    EngineEvent::Observing { result, .. } => {
                        if let Some(id) = result
                            .get("data")
                            .and_then(|d| d.get("id"))
                            .and_then(Value::as_str)
                        {
                            produced_ids.push(id.to_string());
                        }
                    }
                    EngineEvent::Context {
                        tokens_used: used, ..
                    } => {
                        tokens_used = tokens_used.max(used);
                    }
                    _ => {}
                }
            }
        };

        if tokio::time::timeout(deadline, drain).await.is_err() {
            handle.interrupt();
            summary = "sub-agent timed out".into();
            success = false;
            error = Some(EngineError::new(
                ErrorCode::AgentTimeout,
                format!("sub-agent exceeded {}ms", contract.limits.timeout_ms),
            ));
        }

        self.cancel_map
            .remove_from_group(&self.parent_session, &session_id);

        SubAgentReport {
            contract_id: contract.contract_id.clone(),
            success,
            summary,
            produced_ids,
            tokens_used,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        }
    }
}

/// Parallel contracts with bounds must not overlap.
fn verify_disjoint(contracts: &[SubAgentContract]) -> Result<()> {
    for (i, a) in contracts.iter().enumerate() {
        for b in &contracts[i + 1..] {
            if let (Some(ba), Some(bb)) = (a.work_region.bounds, b.work_region.bounds) {
                if ba.intersects(&bb) {
                    return Err(Error::Other(format!(
                        "contracts {} and {} have overlapping work regions",
                        a.contract_id, b.contract_id
                    )));
                }
            }
        }
    }
    Ok(())
}
