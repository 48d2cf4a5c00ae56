//! Capability-gated plugin contexts.
//!
//! A context is assembled from a fixed set of real services and the
//! manifest's declared capability list. Granular services (`ipc`) gate each
//! operation individually; whole-object services (`messages`, `tasks`) are
//! either the live object or a stub whose every method refuses with a
//! capability-denial error. A denied call never touches the underlying
//! resource.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::manifest::{Capability, PluginManifest};
use crate::error::CoreError;
use crate::events::EventBus;
use crate::ipc;
use crate::tasks::{NewTask, ScheduledTask};

// ── Logger ────────────────────────────────────────────────────────

/// Structured logger scoped to one plugin.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin: String,
}

impl PluginLogger {
    pub fn new(plugin: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
        }
    }

    pub fn info(&self, message: &str) {
        info!(plugin = %self.plugin, "{message}");
    }

    pub fn warn(&self, message: &str) {
        warn!(plugin = %self.plugin, "{message}");
    }

    pub fn error(&self, message: &str) {
        error!(plugin = %self.plugin, "{message}");
    }
}

// ── IPC service (granular gating) ─────────────────────────────────

/// Filesystem access limited to the IPC root. `read_file` requires
/// `ipc:read`; `write_file` requires `ipc:write`.
#[derive(Debug, Clone)]
pub struct IpcService {
    root: PathBuf,
    can_read: bool,
    can_write: bool,
}

impl IpcService {
    pub fn new(root: PathBuf, manifest: &PluginManifest) -> Self {
        Self {
            root,
            can_read: manifest.grants(Capability::IpcRead),
            can_write: manifest.grants(Capability::IpcWrite),
        }
    }

    /// The IPC root all reads and writes are contained under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn denied(operation: &str, capability: Capability) -> anyhow::Error {
        CoreError::CapabilityDenied {
            operation: operation.to_string(),
            capability: capability.as_str().to_string(),
        }
        .into()
    }

    pub fn read_file(&self, path: &Path) -> anyhow::Result<String> {
        if !self.can_read {
            return Err(Self::denied("ipc.read_file", Capability::IpcRead));
        }
        let contained = ipc::contained_path(&self.root, path)?;
        std::fs::read_to_string(&contained)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", contained.display()))
    }

    /// Atomic drop-file write into a directory under the IPC root.
    pub fn write_file(&self, dir: &Path, contents: &str) -> anyhow::Result<PathBuf> {
        if !self.can_write {
            return Err(Self::denied("ipc.write_file", Capability::IpcWrite));
        }
        ipc::write_raw(&self.root, dir, contents)
    }
}

// ── Whole-object services ─────────────────────────────────────────

/// Outbound messaging on behalf of a plugin.
#[async_trait]
pub trait MessagesApi: Send + Sync {
    async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()>;
    async fn send_voice(&self, jid: &str, audio_path: &str) -> anyhow::Result<()>;
    async fn set_typing(&self, jid: &str, on: bool) -> anyhow::Result<()>;
}

/// Scheduled-task management on behalf of a plugin.
#[async_trait]
pub trait TasksApi: Send + Sync {
    async fn create_task(&self, new: NewTask) -> anyhow::Result<ScheduledTask>;
    async fn list_tasks(&self, folder: &str, all_folders: bool)
        -> anyhow::Result<Vec<ScheduledTask>>;
    async fn pause_task(&self, id: &str) -> anyhow::Result<bool>;
    async fn resume_task(&self, id: &str) -> anyhow::Result<bool>;
    async fn cancel_task(&self, id: &str) -> anyhow::Result<bool>;
}

struct DeniedMessages;

impl DeniedMessages {
    fn denied(operation: &str) -> anyhow::Error {
        CoreError::CapabilityDenied {
            operation: operation.to_string(),
            capability: Capability::MessagesWrite.as_str().to_string(),
        }
        .into()
    }
}

#[async_trait]
impl MessagesApi for DeniedMessages {
    async fn send_message(&self, _jid: &str, _text: &str) -> anyhow::Result<()> {
        Err(Self::denied("messages.send_message"))
    }

    async fn send_voice(&self, _jid: &str, _audio_path: &str) -> anyhow::Result<()> {
        Err(Self::denied("messages.send_voice"))
    }

    async fn set_typing(&self, _jid: &str, _on: bool) -> anyhow::Result<()> {
        Err(Self::denied("messages.set_typing"))
    }
}

struct DeniedTasks;

impl DeniedTasks {
    fn denied(operation: &str) -> anyhow::Error {
        CoreError::CapabilityDenied {
            operation: operation.to_string(),
            capability: Capability::TasksManage.as_str().to_string(),
        }
        .into()
    }
}

#[async_trait]
impl TasksApi for DeniedTasks {
    async fn create_task(&self, _new: NewTask) -> anyhow::Result<ScheduledTask> {
        Err(Self::denied("tasks.create_task"))
    }

    async fn list_tasks(
        &self,
        _folder: &str,
        _all_folders: bool,
    ) -> anyhow::Result<Vec<ScheduledTask>> {
        Err(Self::denied("tasks.list_tasks"))
    }

    async fn pause_task(&self, _id: &str) -> anyhow::Result<bool> {
        Err(Self::denied("tasks.pause_task"))
    }

    async fn resume_task(&self, _id: &str) -> anyhow::Result<bool> {
        Err(Self::denied("tasks.resume_task"))
    }

    async fn cancel_task(&self, _id: &str) -> anyhow::Result<bool> {
        Err(Self::denied("tasks.cancel_task"))
    }
}

// ── Context assembly ──────────────────────────────────────────────

/// The live services contexts are built from.
#[derive(Clone)]
pub struct ServiceSet {
    pub event_bus: EventBus,
    pub ipc_root: PathBuf,
    pub messages: Arc<dyn MessagesApi>,
    pub tasks: Arc<dyn TasksApi>,
}

/// Per-plugin view of the host, gated by the manifest's capabilities.
#[derive(Clone)]
pub struct PluginContext {
    pub logger: PluginLogger,
    pub event_bus: EventBus,
    pub config: serde_json::Value,
    pub ipc: IpcService,
    pub messages: Arc<dyn MessagesApi>,
    pub tasks: Arc<dyn TasksApi>,
}

impl PluginContext {
    pub fn build(manifest: &PluginManifest, services: &ServiceSet, config: serde_json::Value) -> Self {
        let messages: Arc<dyn MessagesApi> = if manifest.grants(Capability::MessagesWrite) {
            services.messages.clone()
        } else {
            Arc::new(DeniedMessages)
        };
        let tasks: Arc<dyn TasksApi> = if manifest.grants(Capability::TasksManage) {
            services.tasks.clone()
        } else {
            Arc::new(DeniedTasks)
        };
        Self {
            logger: PluginLogger::new(&manifest.name),
            event_bus: services.event_bus.clone(),
            config,
            ipc: IpcService::new(services.ipc_root.clone(), manifest),
            messages,
            tasks,
        }
    }
}

/// A plugin context extended with the invocation's chat identity.
#[derive(Clone)]
pub struct ToolContext {
    pub plugin: PluginContext,
    pub jid: String,
    pub folder: String,
    pub is_main: bool,
}
