//! Agent wire protocol: the stdin configuration blob and the framed
//! stdout payloads.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Literal marker preceding one JSON payload on agent stdout.
pub const OUTPUT_START_MARKER: &str = "---NANOCLAW_OUTPUT_START---";
/// Literal marker following one JSON payload on agent stdout.
pub const OUTPUT_END_MARKER: &str = "---NANOCLAW_OUTPUT_END---";

/// Initial configuration written to the agent's stdin as one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInput {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_scheduled_task: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Success,
    Error,
}

/// One framed payload emitted by the agent. A non-null `result` is an
/// outbound message; `new_session_id` updates the folder's resumable
/// session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    pub status: AgentStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Incremental extractor for marker-framed payloads in a line stream.
///
/// Text outside the markers (agent logging, tool noise) is ignored.
#[derive(Debug, Default)]
pub struct FrameExtractor {
    in_frame: bool,
    buffer: String,
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout line. Returns a parsed payload when the line closes
    /// a frame.
    pub fn push_line(&mut self, line: &str) -> Option<anyhow::Result<AgentOutput>> {
        let trimmed = line.trim();
        if trimmed == OUTPUT_START_MARKER {
            self.in_frame = true;
            self.buffer.clear();
            return None;
        }
        if trimmed == OUTPUT_END_MARKER {
            if !self.in_frame {
                return None;
            }
            self.in_frame = false;
            let parsed = serde_json::from_str::<AgentOutput>(&self.buffer)
                .map_err(|e| anyhow::anyhow!("Invalid agent output frame: {e}"));
            return Some(parsed);
        }
        if self.in_frame {
            self.buffer.push_str(line);
            self.buffer.push('\n');
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_input_uses_camel_case_wire_names() {
        let input = AgentInput {
            prompt: "hi".into(),
            session_id: Some("s-1".into()),
            group_folder: "owner-dm".into(),
            chat_jid: "discord:1".into(),
            is_main: true,
            is_scheduled_task: None,
            secrets: None,
            sender_ids: None,
            trust_config: None,
        };
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["groupFolder"], "owner-dm");
        assert_eq!(json["chatJid"], "discord:1");
        assert_eq!(json["isMain"], true);
        assert!(json.get("isScheduledTask").is_none());
    }

    #[test]
    fn extractor_parses_one_frame() {
        let mut extractor = FrameExtractor::new();
        assert!(extractor.push_line("agent booting...").is_none());
        assert!(extractor.push_line(OUTPUT_START_MARKER).is_none());
        assert!(extractor
            .push_line(r#"{"status":"success","result":"hello","newSessionId":"s-2"}"#)
            .is_none());
        let payload = extractor
            .push_line(OUTPUT_END_MARKER)
            .expect("frame closed")
            .unwrap();
        assert_eq!(payload.status, AgentStatus::Success);
        assert_eq!(payload.result.as_deref(), Some("hello"));
        assert_eq!(payload.new_session_id.as_deref(), Some("s-2"));
    }

    #[test]
    fn extractor_handles_multiline_json_and_multiple_frames() {
        let mut extractor = FrameExtractor::new();
        let mut outputs = Vec::new();
        let stream = format!(
            "noise\n{OUTPUT_START_MARKER}\n{{\n  \"status\": \"success\",\n  \"result\": \"one\"\n}}\n{OUTPUT_END_MARKER}\nmore noise\n{OUTPUT_START_MARKER}\n{{\"status\":\"success\",\"result\":null}}\n{OUTPUT_END_MARKER}"
        );
        for line in stream.lines() {
            if let Some(result) = extractor.push_line(line) {
                outputs.push(result.unwrap());
            }
        }
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].result.as_deref(), Some("one"));
        assert_eq!(outputs[1].result, None);
    }

    #[test]
    fn stray_end_marker_is_ignored() {
        let mut extractor = FrameExtractor::new();
        assert!(extractor.push_line(OUTPUT_END_MARKER).is_none());
    }

    #[test]
    fn malformed_frame_surfaces_error() {
        let mut extractor = FrameExtractor::new();
        extractor.push_line(OUTPUT_START_MARKER);
        extractor.push_line("this is not json");
        let result = extractor.push_line(OUTPUT_END_MARKER).expect("frame closed");
        assert!(result.is_err());
    }

    #[test]
    fn error_payload_roundtrip() {
        let raw = r#"{"status":"error","result":null,"error":"boom"}"#;
        let payload: AgentOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.status, AgentStatus::Error);
        assert_eq!(payload.error.as_deref(), Some("boom"));
    }
}
