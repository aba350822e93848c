use serde::{Deserialize, Serialize};

/// A tool exposed to the LLM, with its declarative input schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A tool call proposed by the LLM (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_round_trips() {
        let call = ToolCall {
            call_id: "c1".into(),
            tool_name: "task_execute".into(),
            arguments: serde_json::json!({ "action": "create_element" }),
        };
        let json = serde_json::to_string(&call).unwrap();
        let back: ToolCall = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_name, "task_execute");
        assert_eq!(back.arguments["action"], "create_element");
    }
}
