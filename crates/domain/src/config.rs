use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub r#loop: LoopConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub delegation: DelegationConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loop limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Maximum LLM round-trips before the run times out.
    #[serde(default = "d_25")]
    pub max_iterations: u32,
    /// Cumulative error budget before the run fails.
    #[serde(default = "d_3")]
    pub max_errors: u32,
    /// Cap on the tool-exchange history ring.
    #[serde(default = "d_50")]
    pub history_cap: usize,
    /// Emit a checkpoint every N iterations. 0 disables checkpointing.
    #[serde(default)]
    pub checkpoint_interval: u32,
    /// History lines included in the assembled user message.
    #[serde(default = "d_5usize")]
    pub history_lines_in_prompt: usize,
    /// Sub-budget (tokens) for awareness fetches during THINK.
    #[serde(default = "d_1500")]
    pub awareness_budget: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            max_errors: 3,
            history_cap: 50,
            checkpoint_interval: 0,
            history_lines_in_prompt: 5,
            awareness_budget: 1500,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token budget
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Total context budget (tokens) for one prepared request.
    #[serde(default = "d_100000")]
    pub max_tokens: u32,
    /// Held back for the model's response.
    #[serde(default = "d_4096")]
    pub response_reserve: u32,
    /// Held back for tool schema payloads.
    #[serde(default = "d_2000")]
    pub tool_reserve: u32,
    /// Token estimator safety margin multiplier.
    #[serde(default = "d_margin")]
    pub safety_margin: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            response_reserve: 4096,
            tool_reserve: 2000,
            safety_margin: 1.05,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool-result lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Age (turns) at which full results are compressed.
    #[serde(default = "d_1")]
    pub recent_threshold: u32,
    /// Age (turns) at which results collapse to one-line summaries.
    #[serde(default = "d_5")]
    pub archive_threshold: u32,
    /// Age (turns) at which entries are dropped entirely.
    #[serde(default = "d_15")]
    pub evict_threshold: u32,
    #[serde(default = "d_5000")]
    pub immediate_max_tokens: u32,
    #[serde(default = "d_500")]
    pub recent_max_tokens: u32,
    #[serde(default = "d_100")]
    pub archived_max_tokens: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            recent_threshold: 1,
            archive_threshold: 5,
            evict_threshold: 15,
            immediate_max_tokens: 5000,
            recent_max_tokens: 500,
            archived_max_tokens: 100,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Echo / staleness monitor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Consecutive identical errors in one scope, or identical call
    /// fingerprints, before the corrector fires.
    #[serde(default = "d_3")]
    pub error_loop_n: u32,
    /// Element-count delta treated as a significant external change.
    #[serde(default = "d_10usize")]
    pub significant_change: usize,
    /// Fingerprint FIFO capacity.
    #[serde(default = "d_32")]
    pub fingerprint_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            error_loop_n: 3,
            significant_change: 10,
            fingerprint_capacity: 32,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Alias resolver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Per-call resolution timeout.
    #[serde(default = "d_500u64")]
    pub timeout_ms: u64,
    #[serde(default = "d_2")]
    pub max_retries: u32,
    /// Abort the whole prompt on the first failed alias.
    #[serde(default)]
    pub fail_fast: bool,
    /// Drop failed aliases from the prompt instead of leaving the
    /// `[unresolved: @name]` placeholder.
    #[serde(default)]
    pub skip_unresolved: bool,
    /// Fraction of the remaining budget granted to resolved context.
    #[serde(default = "d_tenth")]
    pub resource_budget_ratio: f64,
    /// How long a resolved value may be reused without re-resolving.
    #[serde(default = "d_30000")]
    pub cache_ttl_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            max_retries: 2,
            fail_fast: false,
            skip_unresolved: false,
            resource_budget_ratio: 0.10,
            cache_ttl_ms: 30_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delegation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    /// Operations at or below this run directly without a sub-agent.
    #[serde(default = "d_3")]
    pub direct_ops_threshold: u32,
    /// Operations above this always isolate.
    #[serde(default = "d_10")]
    pub isolate_ops_threshold: u32,
    /// Remaining budget below which medium tasks isolate.
    #[serde(default = "d_20000")]
    pub low_budget_tokens: u32,
    #[serde(default = "d_10")]
    pub sub_agent_max_iterations: u32,
    #[serde(default = "d_30000u32")]
    pub sub_agent_max_tokens: u32,
    #[serde(default = "d_120000")]
    pub sub_agent_timeout_ms: u64,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            direct_ops_threshold: 3,
            isolate_ops_threshold: 10,
            low_budget_tokens: 20_000,
            sub_agent_max_iterations: 10,
            sub_agent_max_tokens: 30_000,
            sub_agent_timeout_ms: 120_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Circuit breaker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "d_5")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe.
    #[serde(default = "d_30000")]
    pub open_duration_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 30_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Checkpointing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory for the file store. Unset = in-memory only.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { dir: None }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_3400")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Bearer token for API auth. Unset = dev mode, no auth.
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3400,
            host: d_host(),
            api_token: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Provider id used when a request names none.
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Model tier shortcuts: fast | balanced | powerful → model id.
    #[serde(default)]
    pub tiers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider id (e.g. "openai", "local-vllm").
    pub id: String,
    #[serde(default = "d_kind")]
    pub kind: ProviderKind,
    #[serde(default = "d_openai_url")]
    pub base_url: String,
    pub default_model: String,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Direct key (discouraged; prefer `api_key_env`).
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "d_60000")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompat,
}

// ── serde default helpers ──────────────────────────────────────────

fn d_1() -> u32 {
    1
}
fn d_2() -> u32 {
    2
}
fn d_3() -> u32 {
    3
}
fn d_5() -> u32 {
    5
}
fn d_10() -> u32 {
    10
}
fn d_15() -> u32 {
    15
}
fn d_25() -> u32 {
    25
}
fn d_32() -> usize {
    32
}
fn d_50() -> usize {
    50
}
fn d_5usize() -> usize {
    5
}
fn d_10usize() -> usize {
    10
}
fn d_500u64() -> u64 {
    500
}
fn d_100() -> u32 {
    100
}
fn d_500() -> u32 {
    500
}
fn d_1500() -> u32 {
    1500
}
fn d_2000() -> u32 {
    2000
}
fn d_4096() -> u32 {
    4096
}
fn d_5000() -> u32 {
    5000
}
fn d_20000() -> u32 {
    20_000
}
fn d_30000u32() -> u32 {
    30_000
}
fn d_100000() -> u32 {
    100_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_60000() -> u64 {
    60_000
}
fn d_120000() -> u64 {
    120_000
}
fn d_3400() -> u16 {
    3400
}
fn d_margin() -> f64 {
    1.05
}
fn d_tenth() -> f64 {
    0.10
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_kind() -> ProviderKind {
    ProviderKind::OpenaiCompat
}
fn d_openai_url() -> String {
    "https://api.openai.com/v1".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.r#loop.max_iterations, 25);
        assert_eq!(config.r#loop.max_errors, 3);
        assert_eq!(config.budget.max_tokens, 100_000);
        assert_eq!(config.lifecycle.recent_threshold, 1);
        assert_eq!(config.lifecycle.archive_threshold, 5);
        assert_eq!(config.lifecycle.evict_threshold, 15);
        assert_eq!(config.monitor.error_loop_n, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.open_duration_ms, 30_000);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [loop]
            max_iterations = 7

            [resolver]
            timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.r#loop.max_iterations, 7);
        assert_eq!(config.r#loop.max_errors, 3);
        assert_eq!(config.resolver.timeout_ms, 250);
        assert_eq!(config.resolver.max_retries, 2);
        assert!(!config.resolver.fail_fast);
        assert!(!config.resolver.skip_unresolved);
    }

    #[test]
    fn provider_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [[llm.providers]]
            id = "openai"
            default_model = "gpt-4o-mini"
            api_key_env = "OPENAI_API_KEY"

            [llm.tiers]
            fast = "gpt-4o-mini"
            powerful = "gpt-4o"
            "#,
        )
        .unwrap();
        assert_eq!(config.llm.providers.len(), 1);
        assert_eq!(config.llm.providers[0].kind, ProviderKind::OpenaiCompat);
        assert_eq!(config.llm.tiers["fast"], "gpt-4o-mini");
    }
}
