use serde::{Deserialize, Serialize};

/// Rectangular bounds used to keep parallel sub-agents off each other's
/// territory. Interpretation is adapter-specific; the engine only checks
/// overlap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }

    pub fn contains(&self, other: &Bounds) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }
}

/// The region of external state a sub-agent may touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRegion {
    /// Human-readable scope description (e.g. "header section").
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
}

/// Resource ceilings for a sub-agent run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContractLimits {
    pub max_iterations: u32,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

impl Default for ContractLimits {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_tokens: 30_000,
            timeout_ms: 120_000,
        }
    }
}

/// The input record for a sub-agent delegation. The sub-agent sees only
/// what the contract names: its task, inputs, and work region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentContract {
    pub contract_id: String,
    pub agent_type: String,
    pub task: String,
    pub work_region: WorkRegion,
    #[serde(default)]
    pub inputs: serde_json::Value,
    pub expected_output: String,
    #[serde(default)]
    pub limits: ContractLimits,
}

/// Everything the parent learns about a sub-agent run. Sub-agent messages
/// never cross this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentReport {
    pub contract_id: String,
    pub success: bool,
    pub summary: String,
    #[serde(default)]
    pub produced_ids: Vec<String>,
    pub tokens_used: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::EngineError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(x: f64, y: f64, w: f64, h: f64) -> Bounds {
        Bounds { x, y, width: w, height: h }
    }

    #[test]
    fn disjoint_bounds_do_not_intersect() {
        let a = bounds(0.0, 0.0, 10.0, 10.0);
        let b = bounds(20.0, 0.0, 10.0, 10.0);
        assert!(!a.intersects(&b));
        assert!(!b.intersects(&a));
    }

    #[test]
    fn overlapping_bounds_intersect() {
        let a = bounds(0.0, 0.0, 10.0, 10.0);
        let b = bounds(5.0, 5.0, 10.0, 10.0);
        assert!(a.intersects(&b));
    }

    #[test]
    fn touching_edges_do_not_intersect() {
        let a = bounds(0.0, 0.0, 10.0, 10.0);
        let b = bounds(10.0, 0.0, 10.0, 10.0);
        assert!(!a.intersects(&b));
    }

    #[test]
    fn containment() {
        let outer = bounds(0.0, 0.0, 100.0, 100.0);
        let inner = bounds(10.0, 10.0, 20.0, 20.0);
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
    }
}
