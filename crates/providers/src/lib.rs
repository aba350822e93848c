//! LLM provider adapters for the Tandem engine.
//!
//! The engine consumes the [`LlmProvider`] capability and never sees a
//! provider's wire format. Providers are stateless: conversation history is
//! passed explicitly on every generate call.

pub mod mock;
pub mod openai_compat;
pub mod registry;
pub mod traits;

pub use mock::ScriptedProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use registry::{ProviderInitError, ProviderRegistry};
pub use traits::{
    ChatMessage, FinishReason, GenerateRequest, GenerateResponse, LlmProvider, TokenUsage,
};
