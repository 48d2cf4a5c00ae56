//! Host composition.
//!
//! Wires the stores, event bus, queues, scheduler, plugin registry, and
//! channel router together, and runs the outbox monitor that turns
//! agent-written IPC files into host actions. Only initialization failures
//! abort; every runtime failure is logged and the loops continue.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

use crate::agent::AgentRunner;
use crate::channels::{Channel, ChannelRouter, Outbound};
use crate::config::Config;
use crate::db::ChatStore;
use crate::events::{Event, EventBus};
use crate::ipc::{self, IpcMessage};
use crate::plugins::{MessagesApi, PluginLoader, Runtime, ServiceSet, TasksApi};
use crate::queue::{ChatQueues, QueueDeps};
use crate::tasks::engine::TaskService;
use crate::tasks::{ContextMode, NewTask, ScheduleType, TaskEngine, TaskStore};

pub struct Host {
    config: Config,
    chats: ChatStore,
    outbound: Arc<Outbound>,
    tasks: Arc<TaskService>,
    task_store: TaskStore,
    router: Arc<ChannelRouter>,
    engine: Arc<TaskEngine>,
    bus: EventBus,
}

impl Host {
    /// Build the full component graph. Failures here are the only thing
    /// allowed to abort the process.
    pub fn new(config: Config, channels: Vec<Arc<dyn Channel>>) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("Failed to create state dir: {}", config.state_dir.display()))?;
        std::fs::create_dir_all(config.ipc_root()).context("Failed to create IPC root")?;
        std::fs::create_dir_all(config.groups_dir()).context("Failed to create groups dir")?;

        let bus =
            EventBus::with_handler_timeout(Duration::from_secs(config.events.handler_timeout_secs));
        let chats = ChatStore::open(&config.db_path()).context("chat store unusable")?;
        let task_store = TaskStore::open(&config.db_path()).context("task store unusable")?;
        let outbound = Arc::new(Outbound::new(channels.clone()));
        let tasks = Arc::new(TaskService::new(
            config.clone(),
            task_store.clone(),
            bus.clone(),
        ));

        let queues = ChatQueues::new(QueueDeps {
            config: config.clone(),
            runner: AgentRunner::new(&config.agent),
            chats: chats.clone(),
            outbound: outbound.clone(),
            bus: bus.clone(),
        });
        let engine = TaskEngine::new(
            config.clone(),
            task_store.clone(),
            chats.clone(),
            queues.clone(),
            outbound.clone(),
            bus.clone(),
        );
        let router = Arc::new(ChannelRouter::new(
            config.clone(),
            channels,
            chats.clone(),
            queues,
            bus.clone(),
        ));

        Ok(Self {
            config,
            chats,
            outbound,
            tasks,
            task_store,
            router,
            engine,
            bus,
        })
    }

    pub fn task_service(&self) -> Arc<TaskService> {
        self.tasks.clone()
    }

    pub fn chats(&self) -> &ChatStore {
        &self.chats
    }

    /// Load host-target plugins from the configured search paths.
    async fn load_host_plugins(&self) -> Result<()> {
        if !self.config.plugins.enabled {
            info!("plugin system disabled");
            return Ok(());
        }
        let services = ServiceSet {
            event_bus: self.bus.clone(),
            ipc_root: self.config.ipc_root(),
            messages: self.outbound.clone() as Arc<dyn MessagesApi>,
            tasks: self.tasks.clone() as Arc<dyn TasksApi>,
        };
        let loader = PluginLoader::new(Runtime::Host, services);
        let registry = loader.load_all(&self.config.plugin_paths()).await?;
        info!(plugins = registry.len(), "host plugins loaded");
        Ok(())
    }

    /// Run everything. Returns only on router shutdown.
    pub async fn run(self) -> Result<()> {
        if let Err(e) = self.load_host_plugins().await {
            warn!(error = %e, "host plugin load failed, continuing without plugins");
        }

        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run().await {
                warn!(error = %e, "task scheduler stopped");
            }
        });

        let monitor = OutboxMonitor {
            config: self.config.clone(),
            chats: self.chats.clone(),
            outbound: self.outbound.clone(),
            tasks: self.tasks.clone(),
            task_store: self.task_store.clone(),
            router: self.router.clone(),
            bus: self.bus.clone(),
        };
        tokio::spawn(async move { monitor.run().await });

        info!("host started");
        self.router.clone().run().await
    }
}

/// Drains every agent outbox on the IPC poll interval and applies the
/// requested host actions.
struct OutboxMonitor {
    config: Config,
    chats: ChatStore,
    outbound: Arc<Outbound>,
    tasks: Arc<TaskService>,
    task_store: TaskStore,
    router: Arc<ChannelRouter>,
    bus: EventBus,
}

impl OutboxMonitor {
    async fn run(&self) {
        let poll = Duration::from_millis(self.config.ipc.poll_interval_ms.max(50));
        let mut interval = time::interval(poll);
        loop {
            interval.tick().await;
            if let Err(e) = self.drain_all().await {
                warn!(error = %e, "outbox sweep failed");
            }
        }
    }

    async fn drain_all(&self) -> Result<()> {
        let root = self.config.ipc_root();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            let folder_dir = entry.path();
            if !folder_dir.is_dir() {
                continue;
            }
            let outbox = folder_dir.join("outbox");
            let messages = match ipc::drain(&outbox) {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(dir = %outbox.display(), error = %e, "outbox drain failed");
                    continue;
                }
            };
            for message in messages {
                self.apply(message).await;
            }
        }
        Ok(())
    }

    async fn apply(&self, message: IpcMessage) {
        match message {
            IpcMessage::Message { chat_jid, text, .. } => {
                if let Err(e) = self.outbound.send_message(&chat_jid, &text).await {
                    warn!(jid = %chat_jid, error = %e, "agent outbound send failed");
                    return;
                }
                self.bus
                    .emit(Event::MessageOutbound {
                        jid: chat_jid,
                        content: text,
                    })
                    .await;
            }
            IpcMessage::VoiceMessage {
                chat_jid,
                audio_path,
                ..
            } => {
                if let Err(e) = self.outbound.send_voice(&chat_jid, &audio_path).await {
                    warn!(jid = %chat_jid, error = %e, "agent voice send failed");
                }
            }
            IpcMessage::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                target_jid,
                created_by,
                ..
            } => {
                let schedule_type = match ScheduleType::try_from(schedule_type.as_str()) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "schedule_task dropped");
                        return;
                    }
                };
                let chat = match self.chats.get_by_jid(&target_jid) {
                    Ok(Some(chat)) => chat,
                    _ => {
                        warn!(jid = %target_jid, created_by = %created_by, "schedule_task for unknown chat dropped");
                        return;
                    }
                };
                let result = self
                    .tasks
                    .create_task(NewTask {
                        folder: chat.folder,
                        jid: target_jid,
                        prompt,
                        schedule_type,
                        schedule_value,
                        context_mode: ContextMode::parse(&context_mode),
                    })
                    .await;
                if let Err(e) = result {
                    warn!(error = %e, "schedule_task rejected");
                }
            }
            IpcMessage::PauseTask {
                task_id,
                group_folder,
                is_main,
                ..
            } => {
                if self.authorized(&task_id, &group_folder, is_main) {
                    match self.tasks.pause_task(&task_id).await {
                        Ok(true) => info!(task_id = %task_id, "task paused"),
                        Ok(false) => debug!(task_id = %task_id, "pause was a no-op"),
                        Err(e) => warn!(task_id = %task_id, error = %e, "pause failed"),
                    }
                }
            }
            IpcMessage::ResumeTask {
                task_id,
                group_folder,
                is_main,
                ..
            } => {
                if self.authorized(&task_id, &group_folder, is_main) {
                    match self.tasks.resume_task(&task_id).await {
                        Ok(true) => info!(task_id = %task_id, "task resumed"),
                        Ok(false) => debug!(task_id = %task_id, "resume was a no-op"),
                        Err(e) => warn!(task_id = %task_id, error = %e, "resume failed"),
                    }
                }
            }
            IpcMessage::CancelTask {
                task_id,
                group_folder,
                is_main,
                ..
            } => {
                if self.authorized(&task_id, &group_folder, is_main) {
                    match self.tasks.cancel_task(&task_id).await {
                        Ok(true) => info!(task_id = %task_id, "task cancelled"),
                        Ok(false) => debug!(task_id = %task_id, "cancel was a no-op"),
                        Err(e) => warn!(task_id = %task_id, error = %e, "cancel failed"),
                    }
                }
            }
            IpcMessage::RegisterGroup {
                jid,
                name,
                folder,
                trigger,
                ..
            } => {
                if let Err(e) =
                    self.router
                        .register_chat(&jid, &name, &folder, trigger.as_deref())
                {
                    warn!(jid = %jid, error = %e, "register_group failed");
                }
            }
        }
    }

    /// Task control from a non-main chat only reaches that chat's own
    /// tasks.
    fn authorized(&self, task_id: &str, group_folder: &str, is_main: bool) -> bool {
        if is_main {
            return true;
        }
        match self.task_store.get(task_id) {
            Ok(Some(task)) if task.folder == group_folder => true,
            Ok(Some(task)) => {
                warn!(
                    task_id = %task_id,
                    owner = %task.folder,
                    requester = %group_folder,
                    "task control denied"
                );
                false
            }
            // unknown task: let the operation no-op downstream
            Ok(None) => true,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "task authorization lookup failed");
                false
            }
        }
    }
}

/// Ensure the main chat's folder exists even before the first message.
pub fn ensure_main_folder(config: &Config) -> Result<()> {
    let dir = config.group_dir(&config.channels.main_folder);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create main folder: {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskStatus;
    use chrono::Utc;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct NullChannel {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl Channel for NullChannel {
        fn name(&self) -> &str {
            "web"
        }
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        fn owns_jid(&self, jid: &str) -> bool {
            jid.starts_with("web:")
        }
        async fn send_message(&self, jid: &str, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((jid.to_string(), text.to_string()));
            Ok(())
        }
        async fn listen(
            &self,
            _tx: tokio::sync::mpsc::Sender<crate::channels::InboundEvent>,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        monitor: OutboxMonitor,
        channel: Arc<NullChannel>,
        config: Config,
        _tmp: TempDir,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.state_dir = tmp.path().join("state");

        let channel = Arc::new(NullChannel {
            sent: Mutex::new(Vec::new()),
        });
        let channels: Vec<Arc<dyn Channel>> = vec![channel.clone()];
        let host = Host::new(config.clone(), channels).unwrap();
        let monitor = OutboxMonitor {
            config: host.config.clone(),
            chats: host.chats.clone(),
            outbound: host.outbound.clone(),
            tasks: host.tasks.clone(),
            task_store: host.task_store.clone(),
            router: host.router.clone(),
            bus: host.bus.clone(),
        };
        Fixture {
            monitor,
            channel,
            config,
            _tmp: tmp,
        }
    }

    fn drop_outbox(config: &Config, folder: &str, message: &IpcMessage) {
        ipc::write_message(&config.ipc_root(), &config.ipc_outbox(folder), message).unwrap();
    }

    #[tokio::test]
    async fn agent_message_files_are_delivered_outbound() {
        let fixture = fixture();
        drop_outbox(
            &fixture.config,
            "owner-dm",
            &IpcMessage::Message {
                chat_jid: "web:main".into(),
                text: "from the agent".into(),
                sender: None,
                group_folder: "owner-dm".into(),
                timestamp: Utc::now(),
            },
        );

        fixture.monitor.drain_all().await.unwrap();
        let sent = fixture.channel.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("web:main".to_string(), "from the agent".to_string())]);
    }

    #[tokio::test]
    async fn register_group_then_schedule_task_roundtrip() {
        let fixture = fixture();
        drop_outbox(
            &fixture.config,
            "owner-dm",
            &IpcMessage::RegisterGroup {
                jid: "web:main".into(),
                name: "Main".into(),
                folder: "owner-dm".into(),
                trigger: None,
                timestamp: Utc::now(),
            },
        );
        fixture.monitor.drain_all().await.unwrap();
        assert!(fixture
            .monitor
            .chats
            .get_by_jid("web:main")
            .unwrap()
            .is_some());

        drop_outbox(
            &fixture.config,
            "owner-dm",
            &IpcMessage::ScheduleTask {
                prompt: "daily digest".into(),
                schedule_type: "cron".into(),
                schedule_value: "0 9 * * *".into(),
                context_mode: "group".into(),
                target_jid: "web:main".into(),
                created_by: "owner-dm".into(),
                timestamp: Utc::now(),
            },
        );
        fixture.monitor.drain_all().await.unwrap();

        let tasks = fixture.monitor.task_store.list_all().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].prompt, "daily digest");
        assert_eq!(tasks[0].folder, "owner-dm");
    }

    #[tokio::test]
    async fn non_main_cannot_control_foreign_tasks() {
        let fixture = fixture();
        let task = fixture
            .monitor
            .task_store
            .create(
                NewTask {
                    folder: "owner-dm".into(),
                    jid: "web:main".into(),
                    prompt: "p".into(),
                    schedule_type: ScheduleType::Interval,
                    schedule_value: "60000".into(),
                    context_mode: ContextMode::Group,
                },
                3,
                None,
            )
            .unwrap();

        drop_outbox(
            &fixture.config,
            "family",
            &IpcMessage::CancelTask {
                task_id: task.id.clone(),
                group_folder: "family".into(),
                is_main: false,
                timestamp: Utc::now(),
            },
        );
        fixture.monitor.drain_all().await.unwrap();
        assert!(fixture.monitor.task_store.get(&task.id).unwrap().is_some());

        // main can
        drop_outbox(
            &fixture.config,
            "owner-dm",
            &IpcMessage::PauseTask {
                task_id: task.id.clone(),
                group_folder: "owner-dm".into(),
                is_main: true,
                timestamp: Utc::now(),
            },
        );
        fixture.monitor.drain_all().await.unwrap();
        assert_eq!(
            fixture.monitor.task_store.get(&task.id).unwrap().unwrap().status,
            TaskStatus::Paused
        );
    }

    #[tokio::test]
    async fn cancel_for_unknown_task_is_a_noop() {
        let fixture = fixture();
        drop_outbox(
            &fixture.config,
            "owner-dm",
            &IpcMessage::CancelTask {
                task_id: "never-existed".into(),
                group_folder: "owner-dm".into(),
                is_main: true,
                timestamp: Utc::now(),
            },
        );
        // twice: idempotent
        fixture.monitor.drain_all().await.unwrap();
        fixture.monitor.drain_all().await.unwrap();
    }
}
