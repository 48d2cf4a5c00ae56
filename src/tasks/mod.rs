pub mod diagnose;
pub mod engine;
pub mod schedule;
pub mod store;

pub use engine::TaskEngine;
pub use store::TaskStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Cron,
    Interval,
    Once,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Once => "once",
        }
    }
}

impl TryFrom<&str> for ScheduleType {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "cron" => Ok(Self::Cron),
            "interval" => Ok(Self::Interval),
            "once" => Ok(Self::Once),
            _ => Err(format!(
                "Invalid schedule type '{value}'. Expected one of: 'cron', 'interval', 'once'"
            )),
        }
    }
}

/// Which conversation a scheduled run joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    /// Reuse the folder's current session.
    #[default]
    Group,
    /// Fresh conversation every run.
    Isolated,
}

impl ContextMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Isolated => "isolated",
        }
    }

    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("isolated") {
            Self::Isolated
        } else {
            Self::Group
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Error,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Completed => "completed",
        }
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid task status '{value}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub folder: String,
    pub jid: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    /// Cron expression, interval milliseconds, or an RFC 3339 timestamp,
    /// depending on `schedule_type`.
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub status: TaskStatus,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

/// Everything a caller supplies to create a task; the store fills in the
/// id, status, and first `next_run`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub folder: String,
    pub jid: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub context_mode: ContextMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// One append-only run record, retained for failure diagnosis.
#[derive(Debug, Clone)]
pub struct TaskRunLog {
    pub task_id: String,
    pub run_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_type_parse_is_case_insensitive() {
        assert_eq!(ScheduleType::try_from("cron").unwrap(), ScheduleType::Cron);
        assert_eq!(ScheduleType::try_from("ONCE").unwrap(), ScheduleType::Once);
        assert_eq!(
            ScheduleType::try_from("Interval").unwrap(),
            ScheduleType::Interval
        );
        assert!(ScheduleType::try_from("daily").is_err());
    }

    #[test]
    fn context_mode_parse_defaults_to_group() {
        assert_eq!(ContextMode::parse("isolated"), ContextMode::Isolated);
        assert_eq!(ContextMode::parse("group"), ContextMode::Group);
        assert_eq!(ContextMode::parse("anything-else"), ContextMode::Group);
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            TaskStatus::Active,
            TaskStatus::Paused,
            TaskStatus::Error,
            TaskStatus::Completed,
        ] {
            assert_eq!(TaskStatus::try_from(status.as_str()).unwrap(), status);
        }
    }
}
