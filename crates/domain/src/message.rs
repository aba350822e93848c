use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message priority levels. Higher survives budget pressure longer.
pub mod priority {
    pub const CRITICAL: u8 = 100;
    pub const HIGH: u8 = 75;
    pub const NORMAL: u8 = 50;
    pub const LOW: u8 = 25;
    pub const EPHEMERAL: u8 = 10;
}

/// Stable identity for a message, assigned at insertion.
///
/// Lookups and deduplication use this id; the engine never relies on
/// pointer equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// Concrete per-message metadata. Fields the engine acts on are typed;
/// anything else lands in the sealed `attributes` map and round-trips
/// through checkpoints untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Turns this message survives in the ephemeral tier. `None` = one turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_turns: Option<u32>,
    /// Where the content came from (e.g. "alias:@selection", "corrector").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// A message held by the context manager.
///
/// `tokens` is a cached estimate, recomputed whenever content mutates.
/// `sequence` is a monotonic insertion counter used for in-tier ordering
/// (timestamps alone can collide within a turn).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: MessageContent,
    pub tokens: u32,
    pub priority: u8,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub compressible: bool,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl ContextMessage {
    fn base(role: Role, content: MessageContent, priority: u8) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content,
            tokens: 0,
            priority,
            sequence: 0,
            created_at: Utc::now(),
            compressible: true,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        let mut msg = Self::base(
            Role::System,
            MessageContent::Text(text.into()),
            priority::CRITICAL,
        );
        msg.compressible = false;
        msg
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::base(Role::User, MessageContent::Text(text.into()), priority::NORMAL)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::base(
            Role::Assistant,
            MessageContent::Text(text.into()),
            priority::HIGH,
        )
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        let call_id = call_id.into();
        let tool_name = tool_name.into();
        let mut msg = Self::base(
            Role::Tool,
            MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: call_id.clone(),
                content: content.into(),
                is_error,
            }]),
            priority::NORMAL,
        );
        msg.metadata.tool_name = Some(tool_name);
        msg.metadata.call_id = Some(call_id);
        msg
    }

    /// Replace the textual content and invalidate the token cache.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.content = MessageContent::Text(text.into());
        self.tokens = 0;
    }

    /// Key used for deduplication within a tier: same role + same content.
    pub fn dedup_key(&self) -> (Role, String) {
        (self.role, self.content.extract_all_text())
    }
}

impl MessageContent {
    /// First text span, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t.as_str()),
            MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }

    /// Join all text-bearing spans (text parts and tool-result bodies).
    pub fn extract_all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ToolResult { content, .. } => Some(content.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn has_image(&self) -> bool {
        matches!(self, MessageContent::Parts(parts)
            if parts.iter().any(|p| matches!(p, ContentPart::Image { .. })))
    }

    /// Count of tool_use / tool_result blocks, for estimator overheads.
    pub fn block_counts(&self) -> (usize, usize) {
        match self {
            MessageContent::Text(_) => (0, 0),
            MessageContent::Parts(parts) => {
                let uses = parts
                    .iter()
                    .filter(|p| matches!(p, ContentPart::ToolUse { .. }))
                    .count();
                let results = parts
                    .iter()
                    .filter(|p| matches!(p, ContentPart::ToolResult { .. }))
                    .count();
                (uses, results)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_are_critical_and_incompressible() {
        let msg = ContextMessage::system("identity");
        assert_eq!(msg.priority, priority::CRITICAL);
        assert!(!msg.compressible);
    }

    #[test]
    fn tool_result_carries_metadata() {
        let msg = ContextMessage::tool_result("c1", "task_execute", "ok", false);
        assert_eq!(msg.metadata.tool_name.as_deref(), Some("task_execute"));
        assert_eq!(msg.metadata.call_id.as_deref(), Some("c1"));
        assert_eq!(msg.role, Role::Tool);
    }

    #[test]
    fn extract_all_text_joins_parts() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "a".into() },
            ContentPart::ToolUse {
                id: "c1".into(),
                name: "x".into(),
                input: serde_json::json!({}),
            },
            ContentPart::ToolResult {
                tool_use_id: "c1".into(),
                content: "b".into(),
                is_error: false,
            },
        ]);
        assert_eq!(content.extract_all_text(), "a\nb");
    }

    #[test]
    fn dedup_key_matches_same_role_and_content() {
        let a = ContextMessage::user("hello");
        let b = ContextMessage::user("hello");
        assert_ne!(a.id, b.id);
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn set_text_invalidates_token_cache() {
        let mut msg = ContextMessage::user("hello");
        msg.tokens = 42;
        msg.set_text("world");
        assert_eq!(msg.tokens, 0);
    }
}
