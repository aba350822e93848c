use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A compact, token-budgeted semantic projection of external state,
/// produced by the action adapter for the model to reason over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Awareness {
    pub summary: String,
    /// Structural outline of the backing state (e.g. element tree).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skeleton: Option<String>,
    /// Items judged relevant to the current task hint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relevant: Vec<String>,
    pub tokens_used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
}

/// A point-in-time snapshot of external state, used by the echo monitor
/// to ground tool results against reality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    /// Identifiers that exist in the backend at snapshot time.
    #[serde(default)]
    pub element_ids: Vec<String>,
    pub element_count: usize,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
}

impl StateSnapshot {
    pub fn empty() -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            summary: String::new(),
            element_ids: Vec::new(),
            element_count: 0,
            data: serde_json::Value::Null,
            tokens_used: None,
        }
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.element_ids.iter().any(|e| e == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_id_lookup() {
        let mut snap = StateSnapshot::empty();
        snap.element_ids = vec!["r1".into(), "r2".into()];
        snap.element_count = 2;
        assert!(snap.contains_id("r1"));
        assert!(!snap.contains_id("r9"));
    }
}
