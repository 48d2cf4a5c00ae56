pub mod dispatcher;
pub mod host_bridge;
pub mod schema;

pub use dispatcher::ToolDispatcher;

use serde::{Deserialize, Serialize};

/// One block of tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

/// Structured result of a tool invocation. Failures travel in-band through
/// `is_error`; the dispatch loop never relies on thrown errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Concatenated text blocks, for logs and assertions.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolContent::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Description of a tool for registration with the agent's tool-call
/// transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_wire_shape() {
        let result = ToolCallResult::text("done");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][0]["text"], "done");
        assert!(json.get("isError").is_none());

        let err = ToolCallResult::error("nope");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["isError"], true);
    }

    #[test]
    fn text_content_joins_blocks() {
        let mut result = ToolCallResult::text("one");
        result.content.push(ToolContent::Text { text: "two".into() });
        assert_eq!(result.text_content(), "one\ntwo");
    }
}
