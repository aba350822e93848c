use serde::{Deserialize, Serialize};

/// Shared error type used across all Tandem crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("config: {0}")]
    Config(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("context overflow: need {needed} tokens, budget {budget}")]
    Overflow { needed: u32, budget: u32 },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes surfaced at component boundaries.
///
/// Codes are grouped by prefix and serialized in SCREAMING_SNAKE form; the
/// set is part of the public contract and must not be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Tool dispatch
    ToolValidation,
    ToolExecution,
    ToolTimeout,
    ToolPartialWrite,
    ToolConflict,
    ToolSecurity,
    ToolLimit,
    ToolNotFound,

    // Action adapter
    AdapterConnection,
    AdapterTimeout,
    AdapterExecution,
    AdapterInvalidResponse,
    AdapterServer,
    AdapterCircuitOpen,
    AdapterOutOfScope,

    // Hooks
    HookBlocked,
    HookPreFailed,
    HookPostFailed,
    HookValidation,

    // Agent loop
    AgentGenerationFailed,
    AgentExecutionFailed,
    AgentMaxIterations,
    AgentTimeout,
    AgentCancelled,
    AgentStream,
    AgentApiKeyMissing,

    // Input validation
    ValidationMissingField,
    ValidationInvalidType,
    ValidationInvalidFormat,
    ValidationOutOfRange,
}

impl ErrorCode {
    /// The fixed allowlist of recoverable conditions. `recoverable` on an
    /// [`EngineError`] is advisory, but values outside this set are always
    /// treated as non-recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ToolTimeout
                | ErrorCode::ToolPartialWrite
                | ErrorCode::ToolConflict
                | ErrorCode::AdapterTimeout
                | ErrorCode::AdapterCircuitOpen
        )
    }

    /// Map to a user-facing string: no stack traces, no internal identifiers.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCode::ToolValidation
            | ErrorCode::ValidationMissingField
            | ErrorCode::ValidationInvalidType
            | ErrorCode::ValidationInvalidFormat
            | ErrorCode::ValidationOutOfRange => "The request contained invalid input.",
            ErrorCode::ToolExecution | ErrorCode::AdapterExecution => {
                "An action failed to complete."
            }
            ErrorCode::ToolTimeout | ErrorCode::AdapterTimeout => {
                "An action took too long and was stopped."
            }
            ErrorCode::ToolPartialWrite => "An action only partially completed.",
            ErrorCode::ToolConflict => "An action conflicted with a concurrent change.",
            ErrorCode::ToolSecurity => "An action was rejected for safety reasons.",
            ErrorCode::ToolLimit => "An action exceeded its configured limits.",
            ErrorCode::ToolNotFound => "The requested capability is not available.",
            ErrorCode::AdapterConnection => "The backend is not reachable.",
            ErrorCode::AdapterInvalidResponse | ErrorCode::AdapterServer => {
                "The backend returned an unexpected response."
            }
            ErrorCode::AdapterCircuitOpen => {
                "The backend is temporarily unavailable after repeated failures."
            }
            ErrorCode::AdapterOutOfScope => {
                "An action outside the permitted work region was rejected."
            }
            ErrorCode::HookBlocked => "An action was blocked by policy.",
            ErrorCode::HookPreFailed | ErrorCode::HookPostFailed | ErrorCode::HookValidation => {
                "A policy check failed."
            }
            ErrorCode::AgentGenerationFailed => "The model failed to respond.",
            ErrorCode::AgentExecutionFailed => "The task could not be completed.",
            ErrorCode::AgentMaxIterations => "The task ran out of iterations.",
            ErrorCode::AgentTimeout => "The task timed out.",
            ErrorCode::AgentCancelled => "The task was cancelled.",
            ErrorCode::AgentStream => "The response stream was interrupted.",
            ErrorCode::AgentApiKeyMissing => {
                "No API key is configured for the selected model provider."
            }
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse the serde rename so logs and wire agree on the code string.
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(s.trim_matches('"'))
    }
}

/// A typed failure surfaced as data rather than a panic: tool results,
/// adapter results, and terminal events all carry one of these.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable: code.is_recoverable(),
        }
    }

    pub fn user_message(&self) -> &'static str {
        self.code.user_message()
    }
}
