use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages carried over the file-drop transport, discriminated by `type`.
///
/// The producer and consumer may live in different processes; these shapes
/// are the wire contract and must stay stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcMessage {
    /// A user turn injected into a running agent, or an outbound message
    /// the agent asks the host to deliver.
    Message {
        #[serde(rename = "chatJid")]
        chat_jid: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        #[serde(rename = "groupFolder")]
        group_folder: String,
        timestamp: DateTime<Utc>,
    },
    VoiceMessage {
        #[serde(rename = "chatJid")]
        chat_jid: String,
        #[serde(rename = "audioPath")]
        audio_path: String,
        #[serde(rename = "groupFolder")]
        group_folder: String,
        timestamp: DateTime<Utc>,
    },
    ScheduleTask {
        prompt: String,
        schedule_type: String,
        schedule_value: String,
        context_mode: String,
        #[serde(rename = "targetJid")]
        target_jid: String,
        #[serde(rename = "createdBy")]
        created_by: String,
        timestamp: DateTime<Utc>,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: String,
        #[serde(rename = "isMain")]
        is_main: bool,
        timestamp: DateTime<Utc>,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: String,
        #[serde(rename = "isMain")]
        is_main: bool,
        timestamp: DateTime<Utc>,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: String,
        #[serde(rename = "isMain")]
        is_main: bool,
        timestamp: DateTime<Utc>,
    },
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_wire_field_names() {
        let msg = IpcMessage::Message {
            chat_jid: "discord:42".into(),
            text: "hi".into(),
            sender: Some("alice".into()),
            group_folder: "family".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["chatJid"], "discord:42");
        assert_eq!(json["groupFolder"], "family");
        assert!(json.get("chat_jid").is_none());
    }

    #[test]
    fn schedule_task_mixed_casing_preserved() {
        let msg = IpcMessage::ScheduleTask {
            prompt: "check the weather".into(),
            schedule_type: "cron".into(),
            schedule_value: "0 9 * * *".into(),
            context_mode: "group".into(),
            target_jid: "web:main".into(),
            created_by: "owner-dm".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "schedule_task");
        assert_eq!(json["schedule_type"], "cron");
        assert_eq!(json["targetJid"], "web:main");
        assert_eq!(json["createdBy"], "owner-dm");
    }

    #[test]
    fn task_control_roundtrip() {
        let msg = IpcMessage::CancelTask {
            task_id: "abc".into(),
            group_folder: "owner-dm".into(),
            is_main: true,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"taskId\""));
        assert!(json.contains("\"isMain\""));
        let parsed: IpcMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"detonate","chatJid":"x"}"#;
        assert!(serde_json::from_str::<IpcMessage>(raw).is_err());
    }
}
