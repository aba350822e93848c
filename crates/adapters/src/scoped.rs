//! Work-region scoping for delegated sub-agents.
//!
//! A [`ScopedAdapter`] wraps the shared backend adapter and rejects
//! mutations that fall outside the contract's work region, so parallel
//! sub-agents cannot write over each other.

use std::sync::Arc;

use serde_json::Value;

use ta_domain::awareness::{Awareness, StateSnapshot};
use ta_domain::contract::{Bounds, WorkRegion};
use ta_domain::error::{ErrorCode, Result};

use crate::traits::{
    ActionAdapter, ActionDefinition, ActionResult, AwarenessOptions, ConnectionState, StateOptions,
};

pub struct ScopedAdapter {
    inner: Arc<dyn ActionAdapter>,
    region: WorkRegion,
}

impl ScopedAdapter {
    pub fn new(inner: Arc<dyn ActionAdapter>, region: WorkRegion) -> Self {
        Self { inner, region }
    }

    pub fn region(&self) -> &WorkRegion {
        &self.region
    }

    /// Extract target bounds from action params, when present. Mutations
    /// that carry no coordinates (e.g. delete by id) pass the scope check;
    /// the region's `scope` text still steers the sub-agent's prompt.
    fn param_bounds(params: &Value) -> Option<Bounds> {
        let x = params.get("x").and_then(Value::as_f64)?;
        let y = params.get("y").and_then(Value::as_f64)?;
        let width = params.get("width").and_then(Value::as_f64).unwrap_or(0.0);
        let height = params.get("height").and_then(Value::as_f64).unwrap_or(0.0);
        Some(Bounds {
            x,
            y,
            width,
            height,
        })
    }
}

#[async_trait::async_trait]
impl ActionAdapter for ScopedAdapter {
    async fn connect(&self) -> Result<bool> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    async fn execute(&self, action: &str, params: Value) -> ActionResult {
        if self.inner.is_mutation(action) {
            if let (Some(region_bounds), Some(target)) =
                (self.region.bounds, Self::param_bounds(&params))
            {
                if !region_bounds.contains(&target) {
                    return ActionResult::err(
                        ErrorCode::AdapterOutOfScope,
                        format!(
                            "action '{action}' targets ({}, {}) outside work region '{}'",
                            target.x, target.y, self.region.scope
                        ),
                    );
                }
            }
        }
        self.inner.execute(action, params).await
    }

    async fn get_state(&self, opts: StateOptions) -> Result<StateSnapshot> {
        self.inner.get_state(opts).await
    }

    async fn get_awareness(&self, opts: AwarenessOptions) -> Result<Awareness> {
        self.inner.get_awareness(opts).await
    }

    fn available_actions(&self) -> Vec<ActionDefinition> {
        self.inner.available_actions()
    }

    fn domain(&self) -> &str {
        self.inner.domain()
    }
}
