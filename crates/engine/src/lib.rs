//! The Tandem execution engine.
//!
//! Drives an LLM through a bounded Think/Act/Observe/Decide loop against
//! an action adapter. The engine owns the context memory, the token
//! budget, tool dispatch, and sub-agent delegation; providers and
//! adapters stay behind their capability traits.

pub mod checkpoint;
pub mod context;
pub mod delegation;
pub mod dispatch;
pub mod handle;
pub mod lifecycle;
pub mod monitor;
pub mod orchestrator;
pub mod resolver;

pub use context::compressor::{CompressionStrategy, Compressor, Summarizer};
pub use context::estimator::TokenEstimator;
pub use context::manager::{ContextManager, PreparedRequest};
pub use handle::{CancelMap, CancelToken, QueryHandle};
pub use lifecycle::{ResultStage, ToolResultLifecycle};
pub use monitor::EchoMonitor;
pub use orchestrator::{Engine, EngineOptions};
pub use resolver::{AliasDefinition, AliasRegistry, AliasResolver};
