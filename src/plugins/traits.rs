//! The contract plugin implementations compile against.
//!
//! Manifests are discovered on disk, but implementations are pre-linked:
//! a loaded plugin is a statically-registered [`Plugin`] bound to its
//! manifest by name.

use async_trait::async_trait;
use std::sync::Arc;

use super::context::{PluginContext, ToolContext};
use crate::tools::ToolCallResult;

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Must match the manifest's `name`.
    fn name(&self) -> &str;

    /// Tools this plugin exposes to the agent.
    fn tools(&self) -> Vec<Arc<dyn PluginTool>> {
        Vec::new()
    }

    async fn on_load(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_unload(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait PluginTool: Send + Sync {
    /// Name the tool registers under with the agent's tool-call transport.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the tool's arguments.
    fn input_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: serde_json::Value,
    ) -> anyhow::Result<ToolCallResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BarePlugin;

    #[async_trait]
    impl Plugin for BarePlugin {
        fn name(&self) -> &str {
            "bare"
        }
    }

    #[test]
    fn default_plugin_has_no_tools() {
        assert!(BarePlugin.tools().is_empty());
    }

    #[tokio::test]
    async fn default_unload_succeeds() {
        assert!(BarePlugin.on_unload().await.is_ok());
    }
}
