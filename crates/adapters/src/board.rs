//! In-memory element board — the reference backend.
//!
//! Holds a flat set of positioned elements behind the [`ActionAdapter`]
//! surface. Used by the engine test-suite, the delegation work-region
//! checks, and `tandem serve --demo`.

use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use ta_domain::awareness::{Awareness, StateSnapshot};
use ta_domain::error::{ErrorCode, Result};

use crate::traits::{
    ActionAdapter, ActionCategory, ActionDefinition, ActionResult, AwarenessOptions,
    ConnectionState, StateOptions,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub kind: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

struct BoardState {
    elements: Vec<Element>,
    next_id: u64,
    connection: ConnectionState,
}

/// An in-memory board of positioned elements.
pub struct BoardAdapter {
    state: RwLock<BoardState>,
}

impl BoardAdapter {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(BoardState {
                elements: Vec::new(),
                next_id: 1,
                connection: ConnectionState::Disconnected,
            }),
        }
    }

    pub fn element_count(&self) -> usize {
        self.state.read().elements.len()
    }

    pub fn element_ids(&self) -> Vec<String> {
        self.state.read().elements.iter().map(|e| e.id.clone()).collect()
    }

    fn f64_param(params: &Value, key: &str) -> f64 {
        params.get(key).and_then(Value::as_f64).unwrap_or(0.0)
    }

    fn summary_line(elements: &[Element]) -> String {
        if elements.is_empty() {
            return "The board is empty.".into();
        }
        let mut kinds: Vec<(String, usize)> = Vec::new();
        for el in elements {
            match kinds.iter_mut().find(|(k, _)| *k == el.kind) {
                Some((_, n)) => *n += 1,
                None => kinds.push((el.kind.clone(), 1)),
            }
        }
        let parts: Vec<String> = kinds.iter().map(|(k, n)| format!("{n} {k}")).collect();
        format!("{} elements: {}", elements.len(), parts.join(", "))
    }
}

impl Default for BoardAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ActionAdapter for BoardAdapter {
    async fn connect(&self) -> Result<bool> {
        self.state.write().connection = ConnectionState::Connected;
        Ok(true)
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.write().connection = ConnectionState::Disconnected;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.read().connection
    }

    async fn execute(&self, action: &str, params: Value) -> ActionResult {
        let started = Instant::now();
        let mut state = self.state.write();

        let outcome = match action {
            "create_element" => {
                let kind = params
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("rectangle")
                    .to_string();
                let id = format!("el-{}", state.next_id);
                state.next_id += 1;
                let element = Element {
                    id: id.clone(),
                    kind,
                    x: Self::f64_param(&params, "x"),
                    y: Self::f64_param(&params, "y"),
                    width: Self::f64_param(&params, "width"),
                    height: Self::f64_param(&params, "height"),
                    label: params
                        .get("label")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                };
                state.elements.push(element);
                Ok(json!({ "id": id }))
            }
            "update_element" => {
                let id = params.get("id").and_then(Value::as_str).unwrap_or("");
                match state.elements.iter_mut().find(|e| e.id == id) {
                    Some(el) => {
                        if let Some(x) = params.get("x").and_then(Value::as_f64) {
                            el.x = x;
                        }
                        if let Some(y) = params.get("y").and_then(Value::as_f64) {
                            el.y = y;
                        }
                        if let Some(w) = params.get("width").and_then(Value::as_f64) {
                            el.width = w;
                        }
                        if let Some(h) = params.get("height").and_then(Value::as_f64) {
                            el.height = h;
                        }
                        if let Some(label) = params.get("label").and_then(Value::as_str) {
                            el.label = Some(label.to_string());
                        }
                        Ok(json!({ "id": id }))
                    }
                    None => Err((ErrorCode::AdapterExecution, format!("no element '{id}'"))),
                }
            }
            "delete_element" => {
                let id = params.get("id").and_then(Value::as_str).unwrap_or("");
                let before = state.elements.len();
                state.elements.retain(|e| e.id != id);
                if state.elements.len() < before {
                    Ok(json!({ "deleted": id }))
                } else {
                    Err((ErrorCode::AdapterExecution, format!("no element '{id}'")))
                }
            }
            "clear_board" => {
                let removed = state.elements.len();
                state.elements.clear();
                Ok(json!({ "removed": removed }))
            }
            "list_elements" => {
                let elements = serde_json::to_value(&state.elements)
                    .unwrap_or(Value::Array(Vec::new()));
                Ok(json!({ "elements": elements }))
            }
            "get_element" => {
                let id = params.get("id").and_then(Value::as_str).unwrap_or("");
                match state.elements.iter().find(|e| e.id == id) {
                    Some(el) => Ok(serde_json::to_value(el).unwrap_or(Value::Null)),
                    None => Err((ErrorCode::AdapterExecution, format!("no element '{id}'"))),
                }
            }
            other => Err((
                ErrorCode::AdapterExecution,
                format!("unknown action '{other}'"),
            )),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(data) => ActionResult::ok(data, duration_ms),
            Err((code, message)) => ActionResult::err(code, message),
        }
    }

    async fn get_state(&self, _opts: StateOptions) -> Result<StateSnapshot> {
        let state = self.state.read();
        Ok(StateSnapshot {
            id: None,
            timestamp: Utc::now(),
            summary: Self::summary_line(&state.elements),
            element_ids: state.elements.iter().map(|e| e.id.clone()).collect(),
            element_count: state.elements.len(),
            data: serde_json::to_value(&state.elements).unwrap_or(Value::Null),
            tokens_used: None,
        })
    }

    async fn get_awareness(&self, opts: AwarenessOptions) -> Result<Awareness> {
        let state = self.state.read();
        let summary = Self::summary_line(&state.elements);

        let skeleton = if opts.include_skeleton {
            let mut lines: Vec<String> = state
                .elements
                .iter()
                .map(|e| format!("{} {} at ({}, {})", e.id, e.kind, e.x, e.y))
                .collect();
            // Keep the projection inside the caller's budget: one skeleton
            // line is roughly 8 tokens.
            if let Some(max) = opts.max_tokens {
                let max_lines = (max as usize / 8).max(1);
                lines.truncate(max_lines);
            }
            Some(lines.join("\n"))
        } else {
            None
        };

        let relevant = if opts.include_relevant {
            let hint = opts.context_hint.as_deref().unwrap_or("").to_lowercase();
            state
                .elements
                .iter()
                .filter(|e| {
                    !hint.is_empty()
                        && (hint.contains(&e.kind)
                            || e.label
                                .as_deref()
                                .map(|l| hint.contains(&l.to_lowercase()))
                                .unwrap_or(false))
                })
                .map(|e| e.id.clone())
                .collect()
        } else {
            Vec::new()
        };

        let chars = summary.len() + skeleton.as_deref().map(str::len).unwrap_or(0);
        Ok(Awareness {
            summary,
            skeleton,
            relevant,
            tokens_used: (chars / 4) as u32,
            compression_ratio: None,
        })
    }

    fn available_actions(&self) -> Vec<ActionDefinition> {
        vec![
            ActionDefinition {
                name: "create_element".into(),
                description: "Create an element on the board. Returns its id.".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "type": { "type": "string", "description": "Element kind (rectangle, text, ...)" },
                        "x": { "type": "number" },
                        "y": { "type": "number" },
                        "width": { "type": "number" },
                        "height": { "type": "number" },
                        "label": { "type": "string" }
                    },
                    "required": ["type"]
                }),
                category: ActionCategory::Mutate,
            },
            ActionDefinition {
                name: "update_element".into(),
                description: "Update position, size, or label of an element.".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "id": { "type": "string" },
                        "x": { "type": "number" },
                        "y": { "type": "number" },
                        "width": { "type": "number" },
                        "height": { "type": "number" },
                        "label": { "type": "string" }
                    },
                    "required": ["id"]
                }),
                category: ActionCategory::Mutate,
            },
            ActionDefinition {
                name: "delete_element".into(),
                description: "Delete an element by id.".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "id": { "type": "string" } },
                    "required": ["id"]
                }),
                category: ActionCategory::Mutate,
            },
            ActionDefinition {
                name: "clear_board".into(),
                description: "Remove every element from the board.".into(),
                input_schema: json!({ "type": "object", "properties": {} }),
                category: ActionCategory::Mutate,
            },
            ActionDefinition {
                name: "list_elements".into(),
                description: "List all elements with their positions.".into(),
                input_schema: json!({ "type": "object", "properties": {} }),
                category: ActionCategory::Read,
            },
            ActionDefinition {
                name: "get_element".into(),
                description: "Fetch one element by id.".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "id": { "type": "string" } },
                    "required": ["id"]
                }),
                category: ActionCategory::Read,
            },
        ]
    }

    fn domain(&self) -> &str {
        "board"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_snapshot() {
        let board = BoardAdapter::new();
        board.connect().await.unwrap();

        let result = board
            .execute("create_element", json!({ "type": "rectangle", "width": 10.0 }))
            .await;
        assert!(result.success);
        let id = result.data.unwrap()["id"].as_str().unwrap().to_string();
        assert_eq!(id, "el-1");

        let snap = board.get_state(StateOptions::default()).await.unwrap();
        assert_eq!(snap.element_count, 1);
        assert!(snap.contains_id("el-1"));
        assert!(snap.summary.contains("rectangle"));
    }

    #[tokio::test]
    async fn delete_unknown_is_error_result() {
        let board = BoardAdapter::new();
        let result = board.execute("delete_element", json!({ "id": "ghost" })).await;
        assert!(!result.success);
        let err = result.error.unwrap();
        assert_eq!(err.code, ErrorCode::AdapterExecution);
    }

    #[tokio::test]
    async fn mutation_classification() {
        let board = BoardAdapter::new();
        assert!(board.is_mutation("create_element"));
        assert!(board.is_mutation("clear_board"));
        assert!(!board.is_mutation("list_elements"));
        assert!(!board.is_mutation("get_element"));
        // Unknown actions are treated as mutations.
        assert!(board.is_mutation("mystery"));
    }

    #[tokio::test]
    async fn awareness_respects_skeleton_budget() {
        let board = BoardAdapter::new();
        for _ in 0..50 {
            board
                .execute("create_element", json!({ "type": "rectangle" }))
                .await;
        }
        let awareness = board
            .get_awareness(AwarenessOptions {
                include_skeleton: true,
                include_relevant: false,
                max_tokens: Some(40),
                context_hint: None,
            })
            .await
            .unwrap();
        let lines = awareness.skeleton.unwrap().lines().count();
        assert!(lines <= 5, "skeleton should be truncated, got {lines} lines");
    }

    #[tokio::test]
    async fn relevant_items_follow_hint() {
        let board = BoardAdapter::new();
        board
            .execute("create_element", json!({ "type": "rectangle" }))
            .await;
        board
            .execute("create_element", json!({ "type": "text", "label": "Title" }))
            .await;

        let awareness = board
            .get_awareness(AwarenessOptions {
                include_skeleton: false,
                include_relevant: true,
                max_tokens: None,
                context_hint: Some("update the text element".into()),
            })
            .await
            .unwrap();
        assert_eq!(awareness.relevant, vec!["el-2".to_string()]);
    }
}
