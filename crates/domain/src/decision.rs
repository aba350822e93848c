use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Outcome of the DECIDE phase for one iteration.
///
/// Exactly one rule of the ordered check list produces each decision:
/// cancellation, then natural completion, then interrupts, then the error
/// budget, then the iteration limit, then continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Continue,
    Complete {
        summary: String,
    },
    Interrupted {
        clarification_id: String,
    },
    Failed {
        reason: String,
        errors: Vec<EngineError>,
    },
    Cancelled {
        reason: String,
    },
    Timeout,
}

impl Decision {
    /// `Continue` keeps the loop alive; everything else ends the run
    /// (interrupted ends the run pending user input).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Decision::Continue)
    }
}
