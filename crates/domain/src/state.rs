use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::awareness::{Awareness, StateSnapshot};
use crate::error::EngineError;

/// One recorded tool exchange in the capped history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tool: String,
    pub result: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
}

/// A plan step. Steps live in a flat list keyed by id; dependencies are
/// id strings, never references, so the plan serializes without cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Compute the tasks whose dependencies are all completed, in plan order.
pub fn ready_tasks(tasks: &[PlanTask]) -> Vec<&PlanTask> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.depends_on.iter().all(|dep| {
                tasks
                    .iter()
                    .find(|other| other.id == *dep)
                    .map(|other| other.status == TaskStatus::Completed)
                    // Unknown dependency ids never become ready; the plan
                    // tool validates ids on write.
                    .unwrap_or(false)
            })
        })
        .collect()
}

/// Context the loop carries about the external world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awareness: Option<Awareness>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awareness_fetched_at: Option<DateTime<Utc>>,
    pub awareness_is_stale: bool,
    /// Bumped by every executed tool; mutations additionally invalidate
    /// awareness.
    pub version: u64,
}

impl Default for ResourceContext {
    fn default() -> Self {
        Self {
            awareness: None,
            awareness_fetched_at: None,
            awareness_is_stale: true,
            version: 0,
        }
    }
}

/// Resources available to the agent for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResources {
    /// Domain label of the attached adapter (e.g. "board").
    pub domain: String,
    /// The original user task text.
    pub task: String,
    pub context: ResourceContext,
    /// Recent tool exchange lines formatted for the prompt.
    #[serde(default)]
    pub history: Vec<String>,
}

impl AgentResources {
    pub fn new(domain: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            task: task.into(),
            context: ResourceContext::default(),
            history: Vec::new(),
        }
    }

    /// A mutating tool ran: bump the version and invalidate awareness.
    pub fn record_mutation(&mut self) {
        self.context.version += 1;
        self.context.awareness_is_stale = true;
    }

    /// A read-only tool ran: bump the version, awareness stays valid.
    pub fn record_read(&mut self) {
        self.context.version += 1;
    }

    pub fn set_awareness(&mut self, awareness: Awareness) {
        self.context.awareness = Some(awareness);
        self.context.awareness_fetched_at = Some(Utc::now());
        self.context.awareness_is_stale = false;
    }
}

/// Mutable state owned exclusively by the loop orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    pub iteration: u32,
    pub errors: Vec<EngineError>,
    pub history: Vec<HistoryEntry>,
    /// Cap on `history`; oldest entries are dropped first.
    pub history_cap: usize,
    pub task_state: Vec<PlanTask>,
    pub start_time: DateTime<Utc>,
    pub resources: AgentResources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_state_snapshot: Option<StateSnapshot>,
    pub is_first_iteration: bool,
}

impl LoopState {
    pub fn new(resources: AgentResources, history_cap: usize) -> Self {
        Self {
            iteration: 0,
            errors: Vec::new(),
            history: Vec::new(),
            history_cap,
            task_state: Vec::new(),
            start_time: Utc::now(),
            resources,
            last_state_snapshot: None,
            is_first_iteration: true,
        }
    }

    /// Append to the capped history, dropping the oldest on overflow.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if self.history.len() > self.history_cap {
            let excess = self.history.len() - self.history_cap;
            self.history.drain(..excess);
        }
    }

    /// Last `n` history lines formatted for the prompt.
    pub fn recent_history_lines(&self, n: usize) -> Vec<String> {
        self.history
            .iter()
            .rev()
            .take(n)
            .rev()
            .map(|entry| {
                let marker = if entry.is_error { "error" } else { "ok" };
                format!("{} [{}]: {}", entry.tool, marker, entry.result)
            })
            .collect()
    }
}
