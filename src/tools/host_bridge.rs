//! Built-in container plugins bridging the agent back to the host.
//!
//! Every host-affecting side effect — sending a message, scheduling or
//! controlling a task, registering a new chat — is expressed as an IPC file
//! dropped into the agent's outbox. These tools never do network I/O of
//! their own, which keeps each side effect auditable and cancellable.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use super::ToolCallResult;
use crate::ipc::IpcMessage;
use crate::plugins::manifest::{Capability, PluginManifest, PluginTarget};
use crate::plugins::{Plugin, PluginTool, ToolContext};
use crate::tasks::{schedule, ScheduleType, ScheduledTask};

fn outbox_dir(ctx: &ToolContext) -> PathBuf {
    ctx.plugin.ipc.root().join(&ctx.folder).join("outbox")
}

fn drop_to_outbox(ctx: &ToolContext, message: &IpcMessage) -> anyhow::Result<()> {
    let contents = serde_json::to_string(message)?;
    ctx.plugin.ipc.write_file(&outbox_dir(ctx), &contents)?;
    Ok(())
}

/// Resolve the JID a tool call targets. Only the main chat may address
/// other chats.
fn resolve_target(ctx: &ToolContext, requested: Option<&str>) -> Result<String, ToolCallResult> {
    match requested {
        None => Ok(ctx.jid.clone()),
        Some(jid) if jid == ctx.jid => Ok(ctx.jid.clone()),
        Some(jid) => {
            if ctx.is_main {
                Ok(jid.to_string())
            } else {
                Err(ToolCallResult::error(
                    "Only the main chat can target other chats",
                ))
            }
        }
    }
}

// ── messaging ─────────────────────────────────────────────────────

struct SendMessageTool;

#[async_trait]
impl PluginTool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to the current chat (or, from the main chat, to any chat by JID)"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Message text to send" },
                "to": { "type": "string", "description": "Target JID; defaults to the current chat" }
            },
            "required": ["text"]
        })
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: serde_json::Value,
    ) -> anyhow::Result<ToolCallResult> {
        let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("");
        let target = match resolve_target(ctx, args.get("to").and_then(|v| v.as_str())) {
            Ok(jid) => jid,
            Err(result) => return Ok(result),
        };

        drop_to_outbox(
            ctx,
            &IpcMessage::Message {
                chat_jid: target.clone(),
                text: text.to_string(),
                sender: None,
                group_folder: ctx.folder.clone(),
                timestamp: Utc::now(),
            },
        )?;
        Ok(ToolCallResult::text(format!("Message queued for {target}")))
    }
}

pub struct MessagingPlugin;

#[async_trait]
impl Plugin for MessagingPlugin {
    fn name(&self) -> &str {
        "messaging"
    }

    fn tools(&self) -> Vec<Arc<dyn PluginTool>> {
        vec![Arc::new(SendMessageTool)]
    }
}

// ── task-scheduler ────────────────────────────────────────────────

struct ScheduleTaskTool;

#[async_trait]
impl PluginTool for ScheduleTaskTool {
    fn name(&self) -> &str {
        "schedule_task"
    }

    fn description(&self) -> &str {
        "Schedule a recurring (cron/interval) or one-shot task that runs a prompt in this chat"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string", "description": "Prompt the task runs" },
                "schedule_type": { "type": "string", "enum": ["cron", "interval", "once"] },
                "schedule_value": {
                    "type": "string",
                    "description": "Cron expression, interval in milliseconds, or RFC 3339 timestamp"
                },
                "context_mode": { "type": "string", "enum": ["group", "isolated"] },
                "target_jid": { "type": "string", "description": "Chat the task belongs to; main only" }
            },
            "required": ["prompt", "schedule_type", "schedule_value"]
        })
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: serde_json::Value,
    ) -> anyhow::Result<ToolCallResult> {
        let prompt = args.get("prompt").and_then(|v| v.as_str()).unwrap_or("");
        let schedule_type_raw = args
            .get("schedule_type")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let schedule_value = args
            .get("schedule_value")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let schedule_type = match ScheduleType::try_from(schedule_type_raw) {
            Ok(t) => t,
            Err(e) => return Ok(ToolCallResult::error(e)),
        };
        if let Err(e) = schedule::validate_schedule_value(schedule_type, schedule_value, None) {
            return Ok(ToolCallResult::error(format!("Invalid schedule: {e}")));
        }

        let target = match resolve_target(ctx, args.get("target_jid").and_then(|v| v.as_str())) {
            Ok(jid) => jid,
            Err(result) => return Ok(result),
        };
        let context_mode = args
            .get("context_mode")
            .and_then(|v| v.as_str())
            .unwrap_or("group");

        drop_to_outbox(
            ctx,
            &IpcMessage::ScheduleTask {
                prompt: prompt.to_string(),
                schedule_type: schedule_type.as_str().to_string(),
                schedule_value: schedule_value.to_string(),
                context_mode: context_mode.to_string(),
                target_jid: target.clone(),
                created_by: ctx.folder.clone(),
                timestamp: Utc::now(),
            },
        )?;
        Ok(ToolCallResult::text(format!(
            "Task scheduled for {target} ({} {schedule_value})",
            schedule_type.as_str()
        )))
    }
}

struct ListTasksTool;

#[async_trait]
impl PluginTool for ListTasksTool {
    fn name(&self) -> &str {
        "list_tasks"
    }

    fn description(&self) -> &str {
        "List the scheduled tasks visible to this chat"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _args: serde_json::Value,
    ) -> anyhow::Result<ToolCallResult> {
        let snapshot_path = ctx
            .plugin
            .ipc
            .root()
            .join(&ctx.folder)
            .join("tasks_snapshot.json");
        let raw = match ctx.plugin.ipc.read_file(&snapshot_path) {
            Ok(raw) => raw,
            Err(e) if e.downcast_ref::<crate::error::CoreError>().is_some() => return Err(e),
            Err(_) => return Ok(ToolCallResult::text("No scheduled tasks.")),
        };
        let tasks: Vec<ScheduledTask> = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("corrupt task snapshot: {e}"))?;
        if tasks.is_empty() {
            return Ok(ToolCallResult::text("No scheduled tasks."));
        }

        let mut lines = vec![format!("Scheduled tasks ({}):", tasks.len())];
        for task in &tasks {
            let next = task
                .next_run
                .map_or_else(|| "never".into(), |d| d.to_rfc3339());
            lines.push(format!(
                "- {} | {} {} | {} | next={} | {}",
                task.id,
                task.schedule_type.as_str(),
                task.schedule_value,
                task.status.as_str(),
                next,
                crate::util::truncate_with_ellipsis(&task.prompt, 60),
            ));
        }
        Ok(ToolCallResult::text(lines.join("\n")))
    }
}

macro_rules! task_control_tool {
    ($tool:ident, $name:literal, $desc:literal, $variant:ident) => {
        struct $tool;

        #[async_trait]
        impl PluginTool for $tool {
            fn name(&self) -> &str {
                $name
            }

            fn description(&self) -> &str {
                $desc
            }

            fn input_schema(&self) -> serde_json::Value {
                json!({
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string", "description": "Id of the task" }
                    },
                    "required": ["task_id"]
                })
            }

            async fn execute(
                &self,
                ctx: &ToolContext,
                args: serde_json::Value,
            ) -> anyhow::Result<ToolCallResult> {
                let task_id = args.get("task_id").and_then(|v| v.as_str()).unwrap_or("");
                drop_to_outbox(
                    ctx,
                    &IpcMessage::$variant {
                        task_id: task_id.to_string(),
                        group_folder: ctx.folder.clone(),
                        is_main: ctx.is_main,
                        timestamp: Utc::now(),
                    },
                )?;
                Ok(ToolCallResult::text(format!(
                    concat!($name, " requested for {}"),
                    task_id
                )))
            }
        }
    };
}

task_control_tool!(PauseTaskTool, "pause_task", "Pause a scheduled task", PauseTask);
task_control_tool!(ResumeTaskTool, "resume_task", "Resume a paused task", ResumeTask);
task_control_tool!(CancelTaskTool, "cancel_task", "Cancel and delete a scheduled task", CancelTask);

pub struct TaskSchedulerPlugin;

#[async_trait]
impl Plugin for TaskSchedulerPlugin {
    fn name(&self) -> &str {
        "task-scheduler"
    }

    fn tools(&self) -> Vec<Arc<dyn PluginTool>> {
        vec![
            Arc::new(ScheduleTaskTool),
            Arc::new(ListTasksTool),
            Arc::new(PauseTaskTool),
            Arc::new(ResumeTaskTool),
            Arc::new(CancelTaskTool),
        ]
    }
}

// ── group-registry ────────────────────────────────────────────────

struct RegisterGroupTool;

#[async_trait]
impl PluginTool for RegisterGroupTool {
    fn name(&self) -> &str {
        "register_group"
    }

    fn description(&self) -> &str {
        "Register a new chat so the assistant responds there (main chat only)"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "jid": { "type": "string" },
                "name": { "type": "string" },
                "folder": { "type": "string" },
                "trigger": { "type": "string", "description": "Optional trigger pattern" }
            },
            "required": ["jid", "name", "folder"]
        })
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: serde_json::Value,
    ) -> anyhow::Result<ToolCallResult> {
        if !ctx.is_main {
            return Ok(ToolCallResult::error(
                "Only the main chat can register new chats",
            ));
        }
        let jid = args.get("jid").and_then(|v| v.as_str()).unwrap_or("");
        let name = args.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let folder = args.get("folder").and_then(|v| v.as_str()).unwrap_or("");
        drop_to_outbox(
            ctx,
            &IpcMessage::RegisterGroup {
                jid: jid.to_string(),
                name: name.to_string(),
                folder: folder.to_string(),
                trigger: args
                    .get("trigger")
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string),
                timestamp: Utc::now(),
            },
        )?;
        Ok(ToolCallResult::text(format!("Chat '{name}' registered as {folder}")))
    }
}

pub struct GroupRegistryPlugin;

#[async_trait]
impl Plugin for GroupRegistryPlugin {
    fn name(&self) -> &str {
        "group-registry"
    }

    fn tools(&self) -> Vec<Arc<dyn PluginTool>> {
        vec![Arc::new(RegisterGroupTool)]
    }
}

// ── manifests ─────────────────────────────────────────────────────

fn manifest(
    name: &str,
    description: &str,
    capabilities: Vec<Capability>,
) -> PluginManifest {
    PluginManifest {
        name: name.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: Some(description.to_string()),
        target: PluginTarget::Container,
        capabilities,
        dependencies: Vec::new(),
        main_entry: "index.ts".to_string(),
    }
}

/// The compiled-in container plugins, with their manifests.
pub fn builtin_plugins() -> Vec<(PluginManifest, Arc<dyn Plugin>)> {
    vec![
        (
            manifest(
                "messaging",
                "Send messages back through the host",
                vec![Capability::IpcWrite, Capability::MessagesWrite],
            ),
            Arc::new(MessagingPlugin),
        ),
        (
            manifest(
                "task-scheduler",
                "Create and control scheduled tasks",
                vec![
                    Capability::IpcRead,
                    Capability::IpcWrite,
                    Capability::TasksManage,
                ],
            ),
            Arc::new(TaskSchedulerPlugin),
        ),
        (
            manifest(
                "group-registry",
                "Register new chats from the main chat",
                vec![Capability::IpcWrite, Capability::GroupsManage],
            ),
            Arc::new(GroupRegistryPlugin),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::ipc;
    use crate::plugins::{MessagesApi, PluginContext, ServiceSet, TasksApi};
    use crate::tasks::NewTask;
    use tempfile::TempDir;

    struct NoMessages;

    #[async_trait]
    impl MessagesApi for NoMessages {
        async fn send_message(&self, _jid: &str, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send_voice(&self, _jid: &str, _audio_path: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn set_typing(&self, _jid: &str, _on: bool) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NoTasks;

    #[async_trait]
    impl TasksApi for NoTasks {
        async fn create_task(&self, _new: NewTask) -> anyhow::Result<ScheduledTask> {
            anyhow::bail!("unused")
        }
        async fn list_tasks(
            &self,
            _folder: &str,
            _all: bool,
        ) -> anyhow::Result<Vec<ScheduledTask>> {
            Ok(Vec::new())
        }
        async fn pause_task(&self, _id: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn resume_task(&self, _id: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn cancel_task(&self, _id: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    fn tool_ctx(tmp: &TempDir, plugin_name: &str, jid: &str, is_main: bool) -> ToolContext {
        let services = ServiceSet {
            event_bus: EventBus::new(),
            ipc_root: tmp.path().to_path_buf(),
            messages: Arc::new(NoMessages),
            tasks: Arc::new(NoTasks),
        };
        let (manifest, _) = builtin_plugins()
            .into_iter()
            .find(|(m, _)| m.name == plugin_name)
            .expect("builtin exists");
        ToolContext {
            plugin: PluginContext::build(&manifest, &services, serde_json::json!({})),
            jid: jid.to_string(),
            folder: "owner-dm".to_string(),
            is_main,
        }
    }

    fn drain_outbox(tmp: &TempDir) -> Vec<IpcMessage> {
        ipc::drain(&tmp.path().join("owner-dm").join("outbox")).unwrap()
    }

    #[tokio::test]
    async fn send_message_drops_outbox_file() {
        let tmp = TempDir::new().unwrap();
        let ctx = tool_ctx(&tmp, "messaging", "discord:1", false);

        let result = SendMessageTool
            .execute(&ctx, json!({"text": "hello there"}))
            .await
            .unwrap();
        assert!(!result.is_error);

        let drained = drain_outbox(&tmp);
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            IpcMessage::Message { chat_jid, text, group_folder, .. } => {
                assert_eq!(chat_jid, "discord:1");
                assert_eq!(text, "hello there");
                assert_eq!(group_folder, "owner-dm");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_main_cannot_target_other_chats() {
        let tmp = TempDir::new().unwrap();
        let ctx = tool_ctx(&tmp, "messaging", "discord:1", false);

        let result = SendMessageTool
            .execute(&ctx, json!({"text": "x", "to": "discord:999"}))
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(drain_outbox(&tmp).is_empty());
    }

    #[tokio::test]
    async fn main_can_target_other_chats() {
        let tmp = TempDir::new().unwrap();
        let ctx = tool_ctx(&tmp, "messaging", "web:main", true);

        let result = SendMessageTool
            .execute(&ctx, json!({"text": "x", "to": "discord:999"}))
            .await
            .unwrap();
        assert!(!result.is_error);
        let drained = drain_outbox(&tmp);
        match &drained[0] {
            IpcMessage::Message { chat_jid, .. } => assert_eq!(chat_jid, "discord:999"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn schedule_task_validates_before_dropping() {
        let tmp = TempDir::new().unwrap();
        let ctx = tool_ctx(&tmp, "task-scheduler", "discord:1", false);

        let bad = ScheduleTaskTool
            .execute(
                &ctx,
                json!({"prompt": "p", "schedule_type": "cron", "schedule_value": "not a cron"}),
            )
            .await
            .unwrap();
        assert!(bad.is_error);
        assert!(drain_outbox(&tmp).is_empty());

        let good = ScheduleTaskTool
            .execute(
                &ctx,
                json!({"prompt": "check the weather", "schedule_type": "cron",
                       "schedule_value": "*/5 * * * *", "context_mode": "isolated"}),
            )
            .await
            .unwrap();
        assert!(!good.is_error, "got: {}", good.text_content());

        let drained = drain_outbox(&tmp);
        match &drained[0] {
            IpcMessage::ScheduleTask { schedule_type, context_mode, target_jid, created_by, .. } => {
                assert_eq!(schedule_type, "cron");
                assert_eq!(context_mode, "isolated");
                assert_eq!(target_jid, "discord:1");
                assert_eq!(created_by, "owner-dm");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_task_drops_control_file() {
        let tmp = TempDir::new().unwrap();
        let ctx = tool_ctx(&tmp, "task-scheduler", "web:main", true);

        CancelTaskTool
            .execute(&ctx, json!({"task_id": "t-42"}))
            .await
            .unwrap();

        let drained = drain_outbox(&tmp);
        match &drained[0] {
            IpcMessage::CancelTask { task_id, is_main, .. } => {
                assert_eq!(task_id, "t-42");
                assert!(is_main);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_tasks_reads_snapshot() {
        let tmp = TempDir::new().unwrap();
        let ctx = tool_ctx(&tmp, "task-scheduler", "web:main", true);

        // no snapshot yet
        let empty = ListTasksTool.execute(&ctx, json!({})).await.unwrap();
        assert_eq!(empty.text_content(), "No scheduled tasks.");

        let snapshot_dir = tmp.path().join("owner-dm");
        std::fs::create_dir_all(&snapshot_dir).unwrap();
        let task = ScheduledTask {
            id: "t-1".into(),
            folder: "owner-dm".into(),
            jid: "web:main".into(),
            prompt: "water the plants".into(),
            schedule_type: ScheduleType::Cron,
            schedule_value: "0 9 * * *".into(),
            context_mode: crate::tasks::ContextMode::Group,
            status: crate::tasks::TaskStatus::Active,
            next_run: Some(Utc::now()),
            last_run: None,
            last_result: None,
            last_error: None,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
        };
        std::fs::write(
            snapshot_dir.join("tasks_snapshot.json"),
            serde_json::to_string(&vec![task]).unwrap(),
        )
        .unwrap();

        let listed = ListTasksTool.execute(&ctx, json!({})).await.unwrap();
        assert!(listed.text_content().contains("t-1"));
        assert!(listed.text_content().contains("water the plants"));
    }

    #[tokio::test]
    async fn register_group_is_main_only() {
        let tmp = TempDir::new().unwrap();
        let non_main = tool_ctx(&tmp, "group-registry", "discord:1", false);
        let denied = RegisterGroupTool
            .execute(
                &non_main,
                json!({"jid": "discord:5", "name": "Family", "folder": "family"}),
            )
            .await
            .unwrap();
        assert!(denied.is_error);

        let main = tool_ctx(&tmp, "group-registry", "web:main", true);
        let ok = RegisterGroupTool
            .execute(
                &main,
                json!({"jid": "discord:5", "name": "Family", "folder": "family", "trigger": "@bot"}),
            )
            .await
            .unwrap();
        assert!(!ok.is_error);

        let drained = drain_outbox(&tmp);
        match &drained[0] {
            IpcMessage::RegisterGroup { jid, folder, trigger, .. } => {
                assert_eq!(jid, "discord:5");
                assert_eq!(folder, "family");
                assert_eq!(trigger.as_deref(), Some("@bot"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn builtin_manifests_declare_container_target() {
        for (manifest, plugin) in builtin_plugins() {
            assert_eq!(manifest.target, PluginTarget::Container);
            assert_eq!(manifest.name, plugin.name());
            assert!(manifest.grants(Capability::IpcWrite));
        }
    }
}
