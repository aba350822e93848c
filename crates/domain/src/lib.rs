//! Shared domain types for the Tandem agentic execution engine.
//!
//! This crate is dependency-light and I/O-free: every other crate in the
//! workspace builds on these types, so nothing here may pull in the async
//! runtime or HTTP stacks.

pub mod awareness;
pub mod budget;
pub mod config;
pub mod contract;
pub mod decision;
pub mod error;
pub mod event;
pub mod message;
pub mod state;
pub mod tier;
pub mod tool;

pub use awareness::{Awareness, StateSnapshot};
pub use budget::TokenBudget;
pub use config::Config;
pub use contract::{ContractLimits, SubAgentContract, SubAgentReport, WorkRegion};
pub use decision::Decision;
pub use error::{EngineError, Error, ErrorCode, Result};
pub use event::EngineEvent;
pub use message::{ContentPart, ContextMessage, MessageContent, MessageId, MessageMetadata, Role};
pub use state::{AgentResources, LoopState, PlanTask, TaskStatus};
pub use tier::{Tier, TierPolicies, TierPolicy};
pub use tool::{ToolCall, ToolDefinition};
