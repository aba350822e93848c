use serde::{Deserialize, Serialize};
use serde_json::Value;

use ta_domain::awareness::{Awareness, StateSnapshot};
use ta_domain::error::{EngineError, ErrorCode, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Whether an action changes backend state. Mutations invalidate the
/// engine's cached awareness; reads only bump the resource version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionCategory {
    Read,
    Mutate,
}

/// One action the backend can perform, with its declarative input schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the action's parameters.
    pub input_schema: Value,
    pub category: ActionCategory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionMetadata {
    pub duration_ms: u64,
}

/// The uniform result of executing an action. Failures are data, not
/// panics: the loop inspects `error` and keeps running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
    #[serde(default)]
    pub metadata: ActionMetadata,
}

impl ActionResult {
    pub fn ok(data: Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: ActionMetadata { duration_ms },
        }
    }

    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(EngineError::new(code, message)),
            metadata: ActionMetadata::default(),
        }
    }
}

/// Options for state snapshots.
#[derive(Debug, Clone, Default)]
pub struct StateOptions {
    /// Snapshot format hint (adapter-specific, e.g. "summary", "full").
    pub format: Option<String>,
    /// Traversal depth for hierarchical backends.
    pub depth: Option<u32>,
}

/// Options for awareness projections.
#[derive(Debug, Clone, Default)]
pub struct AwarenessOptions {
    pub include_skeleton: bool,
    pub include_relevant: bool,
    /// Token budget for the projection.
    pub max_tokens: Option<u32>,
    /// Current task text; adapters use it to pick relevant items.
    pub context_hint: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core adapter trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every domain backend adapter implements.
///
/// Implementations must be safe for concurrent `execute`/`get_state`
/// calls: adapters are shared across tasks.
#[async_trait::async_trait]
pub trait ActionAdapter: Send + Sync {
    /// Establish the backend connection. Returns `true` when connected.
    async fn connect(&self) -> Result<bool>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    fn connection_state(&self) -> ConnectionState;

    /// Execute an action. Failures are returned as error results,
    /// never as `Err` — only infrastructure bugs abort the call chain.
    async fn execute(&self, action: &str, params: Value) -> ActionResult;

    async fn get_state(&self, opts: StateOptions) -> Result<StateSnapshot>;

    async fn get_awareness(&self, opts: AwarenessOptions) -> Result<Awareness>;

    fn available_actions(&self) -> Vec<ActionDefinition>;

    fn supports_action(&self, name: &str) -> bool {
        self.available_actions().iter().any(|a| a.name == name)
    }

    fn action_schema(&self, name: &str) -> Option<ActionDefinition> {
        self.available_actions().into_iter().find(|a| a.name == name)
    }

    /// Whether an action mutates backend state. Unknown actions are
    /// treated as mutations so staleness errs on the safe side.
    fn is_mutation(&self, name: &str) -> bool {
        self.action_schema(name)
            .map(|a| a.category == ActionCategory::Mutate)
            .unwrap_or(true)
    }

    /// Domain label used in prompts and resource context (e.g. "board").
    fn domain(&self) -> &str;
}
