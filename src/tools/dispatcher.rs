//! Tool dispatch inside the agent process.
//!
//! Registers every tool of every loaded container plugin under its declared
//! name. Each invocation gets a freshly built, capability-gated context
//! extended with the chat identity, and returns a structured result —
//! errors included — rather than propagating failures into the transport.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::host_bridge;
use super::schema::validate_args;
use super::{ToolCallResult, ToolSpec};
use crate::config::Config;
use crate::events::EventBus;
use crate::plugins::{
    MessagesApi, PluginContext, PluginLoader, PluginManifest, PluginRegistry, PluginTool, Runtime,
    ServiceSet, TasksApi, ToolContext,
};
use crate::tasks::{NewTask, ScheduledTask};

struct RegisteredTool {
    manifest: PluginManifest,
    tool: Arc<dyn PluginTool>,
}

pub struct ToolDispatcher {
    services: ServiceSet,
    tools: HashMap<String, RegisteredTool>,
}

impl ToolDispatcher {
    pub fn new(services: ServiceSet) -> Self {
        Self {
            services,
            tools: HashMap::new(),
        }
    }

    /// Register every tool from every tool-declaring plugin in the registry.
    pub fn register_plugins(&mut self, registry: &PluginRegistry) {
        for plugin in registry.tool_plugins() {
            for tool in plugin.instance.tools() {
                let name = tool.name().to_string();
                if self.tools.contains_key(&name) {
                    warn!(tool = %name, plugin = %plugin.manifest.name, "tool name already registered, skipping");
                    continue;
                }
                debug!(tool = %name, plugin = %plugin.manifest.name, "tool registered");
                self.tools.insert(
                    name,
                    RegisteredTool {
                        manifest: plugin.manifest.clone(),
                        tool,
                    },
                );
            }
        }
    }

    /// Specs for registration with the agent's tool-call transport.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|r| ToolSpec {
                name: r.tool.name().to_string(),
                description: r.tool.description().to_string(),
                input_schema: r.tool.input_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Invoke one tool. Every failure mode comes back as an `is_error`
    /// result.
    pub async fn dispatch(
        &self,
        name: &str,
        args: serde_json::Value,
        jid: &str,
        folder: &str,
        is_main: bool,
    ) -> ToolCallResult {
        let Some(registered) = self.tools.get(name) else {
            return ToolCallResult::error(format!("Unknown tool '{name}'"));
        };

        if let Err(message) = validate_args(&registered.tool.input_schema(), &args) {
            return ToolCallResult::error(message);
        }

        let plugin_ctx = PluginContext::build(
            &registered.manifest,
            &self.services,
            serde_json::Value::Object(serde_json::Map::new()),
        );
        let ctx = ToolContext {
            plugin: plugin_ctx,
            jid: jid.to_string(),
            folder: folder.to_string(),
            is_main,
        };

        match registered.tool.execute(&ctx, args).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %name, error = %e, "tool execution failed");
                ToolCallResult::error(e.to_string())
            }
        }
    }
}

// ── Container-side bootstrap ──────────────────────────────────────

/// Inside the agent container the whole-object services are reached through
/// tools, never called directly.
struct ContainerMessages;

#[async_trait]
impl MessagesApi for ContainerMessages {
    async fn send_message(&self, _jid: &str, _text: &str) -> Result<()> {
        anyhow::bail!("messages service is unavailable in the agent container; use the send_message tool")
    }
    async fn send_voice(&self, _jid: &str, _audio_path: &str) -> Result<()> {
        anyhow::bail!("messages service is unavailable in the agent container; use the send_message tool")
    }
    async fn set_typing(&self, _jid: &str, _on: bool) -> Result<()> {
        Ok(())
    }
}

struct ContainerTasks;

#[async_trait]
impl TasksApi for ContainerTasks {
    async fn create_task(&self, _new: NewTask) -> Result<ScheduledTask> {
        anyhow::bail!("tasks service is unavailable in the agent container; use the schedule_task tool")
    }
    async fn list_tasks(&self, _folder: &str, _all: bool) -> Result<Vec<ScheduledTask>> {
        anyhow::bail!("tasks service is unavailable in the agent container; use the list_tasks tool")
    }
    async fn pause_task(&self, _id: &str) -> Result<bool> {
        anyhow::bail!("tasks service is unavailable in the agent container; use the pause_task tool")
    }
    async fn resume_task(&self, _id: &str) -> Result<bool> {
        anyhow::bail!("tasks service is unavailable in the agent container; use the resume_task tool")
    }
    async fn cancel_task(&self, _id: &str) -> Result<bool> {
        anyhow::bail!("tasks service is unavailable in the agent container; use the cancel_task tool")
    }
}

/// Agent-side startup: load the container-target plugins through the
/// registry and expose their tools. The agent harness registers each spec
/// with its tool-call transport and routes invocations to `dispatch`.
pub async fn load_container_tools(
    config: &Config,
    bus: EventBus,
) -> Result<(PluginRegistry, ToolDispatcher)> {
    let services = ServiceSet {
        event_bus: bus,
        ipc_root: config.ipc_root(),
        messages: Arc::new(ContainerMessages),
        tasks: Arc::new(ContainerTasks),
    };
    let mut loader = PluginLoader::new(Runtime::Container, services.clone());
    for (manifest, plugin) in host_bridge::builtin_plugins() {
        loader.register_builtin(manifest, plugin);
    }
    let registry = loader.load_all(&config.plugin_paths()).await?;
    let mut dispatcher = ToolDispatcher::new(services);
    dispatcher.register_plugins(&registry);
    Ok((registry, dispatcher))
}
