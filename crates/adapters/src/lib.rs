//! Action adapters for the Tandem engine.
//!
//! An [`ActionAdapter`] fronts a domain backend behind a uniform surface:
//! connect, execute, state snapshots, awareness projections, and an action
//! catalogue. The engine never talks to a backend directly; composition
//! (circuit breaking, work-region scoping) happens with wrapper adapters.

pub mod board;
pub mod breaker;
pub mod scoped;
pub mod traits;

pub use board::BoardAdapter;
pub use breaker::{BreakerAdapter, CircuitBreaker, CircuitState};
pub use scoped::ScopedAdapter;
pub use traits::{
    ActionAdapter, ActionCategory, ActionDefinition, ActionMetadata, ActionResult,
    AwarenessOptions, ConnectionState, StateOptions,
};
