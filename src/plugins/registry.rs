//! The set of successfully loaded plugins, in load order.

use std::path::PathBuf;
use std::sync::Arc;

use super::manifest::PluginManifest;
use super::traits::Plugin;

/// A plugin instance bound to its manifest.
#[derive(Clone)]
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
    pub instance: Arc<dyn Plugin>,
    /// Directory the manifest was discovered in.
    pub dir: PathBuf,
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<LoadedPlugin>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.iter().map(|p| &p.manifest.name).collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, plugin: LoadedPlugin) {
        self.plugins.push(plugin);
    }

    pub fn get(&self, name: &str) -> Option<&LoadedPlugin> {
        self.plugins.iter().find(|p| p.manifest.name == name)
    }

    /// All loaded plugins in load order.
    pub fn get_all(&self) -> &[LoadedPlugin] {
        &self.plugins
    }

    /// Plugins declaring at least one tool.
    pub fn tool_plugins(&self) -> Vec<&LoadedPlugin> {
        self.plugins
            .iter()
            .filter(|p| !p.instance.tools().is_empty())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::manifest::PluginTarget;
    use async_trait::async_trait;

    struct NoToolPlugin;

    #[async_trait]
    impl Plugin for NoToolPlugin {
        fn name(&self) -> &str {
            "no-tools"
        }
    }

    fn loaded(name: &str) -> LoadedPlugin {
        LoadedPlugin {
            manifest: PluginManifest {
                name: name.into(),
                version: "0.1.0".into(),
                description: None,
                target: PluginTarget::Host,
                capabilities: Vec::new(),
                dependencies: Vec::new(),
                main_entry: "index.ts".into(),
            },
            instance: Arc::new(NoToolPlugin),
            dir: PathBuf::from("/plugins/x"),
        }
    }

    #[test]
    fn registry_preserves_load_order() {
        let mut registry = PluginRegistry::new();
        registry.push(loaded("first"));
        registry.push(loaded("second"));

        let names: Vec<&str> = registry
            .get_all()
            .iter()
            .map(|p| p.manifest.name.as_str())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(registry.get("first").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn tool_plugins_filters_out_toolless() {
        let mut registry = PluginRegistry::new();
        registry.push(loaded("no-tools"));
        assert!(registry.tool_plugins().is_empty());
    }
}
