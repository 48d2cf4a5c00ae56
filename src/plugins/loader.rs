//! Plugin loader — discovery, dependency ordering, lifecycle timeouts.
//!
//! Two kinds of plugins go through the same pipeline: compiled-in builtins
//! registered with their manifests inline, and disk-discovered manifests
//! bound to a pre-linked implementation by name. Disk plugins additionally
//! pass the entry-path checks. A dependency cycle aborts the entire load
//! before any plugin runs.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use super::context::{PluginContext, ServiceSet};
use super::discovery::discover_plugins;
use super::manifest::{PluginManifest, Runtime};
use super::registry::{LoadedPlugin, PluginRegistry};
use super::sort::dependency_order;
use super::traits::Plugin;
use crate::events::Event;

/// Hard limit for `on_load`; a slow plugin fails its load.
pub const ON_LOAD_TIMEOUT: Duration = Duration::from_secs(30);
/// Soft limit for `on_unload`; expiry is logged and unloading continues.
pub const ON_UNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

struct Candidate {
    manifest: PluginManifest,
    /// Manifest directory for disk plugins; `None` for builtins.
    dir: Option<PathBuf>,
}

pub struct PluginLoader {
    runtime: Runtime,
    services: ServiceSet,
    builtins: Vec<(PluginManifest, Arc<dyn Plugin>)>,
    implementations: HashMap<String, Arc<dyn Plugin>>,
    on_load_timeout: Duration,
    on_unload_timeout: Duration,
}

impl PluginLoader {
    pub fn new(runtime: Runtime, services: ServiceSet) -> Self {
        Self {
            runtime,
            services,
            builtins: Vec::new(),
            implementations: HashMap::new(),
            on_load_timeout: ON_LOAD_TIMEOUT,
            on_unload_timeout: ON_UNLOAD_TIMEOUT,
        }
    }

    /// Shrink the lifecycle timeouts (used by tests).
    pub fn with_timeouts(mut self, on_load: Duration, on_unload: Duration) -> Self {
        self.on_load_timeout = on_load;
        self.on_unload_timeout = on_unload;
        self
    }

    /// Register a compiled-in plugin together with its manifest.
    pub fn register_builtin(&mut self, manifest: PluginManifest, plugin: Arc<dyn Plugin>) {
        self.builtins.push((manifest, plugin));
    }

    /// Register an implementation that disk-discovered manifests bind to by
    /// name.
    pub fn register_implementation(&mut self, plugin: Arc<dyn Plugin>) {
        self.implementations
            .insert(plugin.name().to_string(), plugin);
    }

    /// `main_entry` must resolve to an existing file inside the plugin
    /// directory.
    fn resolve_entry(dir: &Path, entry: &str) -> Result<PathBuf> {
        let candidate = dir.join(entry);
        if !candidate.exists() {
            anyhow::bail!("entry '{entry}' does not exist in {}", dir.display());
        }
        let canonical_dir = dir
            .canonicalize()
            .with_context(|| format!("plugin dir vanished: {}", dir.display()))?;
        let canonical = candidate
            .canonicalize()
            .with_context(|| format!("entry unresolvable: {}", candidate.display()))?;
        if !canonical.starts_with(&canonical_dir) {
            anyhow::bail!(
                "entry '{entry}' resolves outside the plugin directory {}",
                dir.display()
            );
        }
        Ok(canonical)
    }

    fn resolve_instance(&self, candidate: &Candidate) -> Option<Arc<dyn Plugin>> {
        match &candidate.dir {
            None => self
                .builtins
                .iter()
                .find(|(m, _)| m.name == candidate.manifest.name)
                .map(|(_, p)| p.clone()),
            Some(dir) => {
                if let Err(e) = Self::resolve_entry(dir, &candidate.manifest.main_entry) {
                    warn!(plugin = %candidate.manifest.name, error = %e, "plugin entry rejected");
                    return None;
                }
                let found = self.implementations.get(&candidate.manifest.name).cloned();
                if found.is_none() {
                    warn!(
                        plugin = %candidate.manifest.name,
                        "no compiled implementation registered for manifest"
                    );
                }
                found
            }
        }
    }

    /// Discover, filter by runtime target, sort by dependencies, and load.
    pub async fn load_all(&self, search_paths: &[PathBuf]) -> Result<PluginRegistry> {
        let mut candidates: Vec<Candidate> = self
            .builtins
            .iter()
            .filter(|(m, _)| m.target.matches(self.runtime))
            .map(|(m, _)| Candidate {
                manifest: m.clone(),
                dir: None,
            })
            .collect();

        let discovery = discover_plugins(search_paths);
        candidates.extend(
            discovery
                .plugins
                .into_iter()
                .filter(|p| p.manifest.target.matches(self.runtime))
                .map(|p| Candidate {
                    manifest: p.manifest,
                    dir: Some(p.dir),
                }),
        );

        // A cycle aborts the whole batch: nothing below runs.
        let manifests: Vec<PluginManifest> =
            candidates.iter().map(|c| c.manifest.clone()).collect();
        let order = dependency_order(&manifests)?;

        let mut registry = PluginRegistry::new();
        let mut seen: HashSet<String> = HashSet::new();

        for idx in order {
            let candidate = &candidates[idx];
            let name = candidate.manifest.name.clone();

            if !seen.insert(name.clone()) {
                warn!(plugin = %name, "duplicate plugin name, skipping later copy");
                continue;
            }

            let Some(instance) = self.resolve_instance(candidate) else {
                continue;
            };

            let ctx = PluginContext::build(
                &candidate.manifest,
                &self.services,
                serde_json::Value::Object(serde_json::Map::new()),
            );

            match timeout(self.on_load_timeout, instance.on_load(&ctx)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(plugin = %name, error = %e, "on_load failed");
                    continue;
                }
                Err(_) => {
                    warn!(
                        plugin = %name,
                        timeout_secs = self.on_load_timeout.as_secs(),
                        "on_load timed out"
                    );
                    continue;
                }
            }

            info!(plugin = %name, version = %candidate.manifest.version, "plugin loaded");
            registry.push(LoadedPlugin {
                manifest: candidate.manifest.clone(),
                instance,
                dir: candidate.dir.clone().unwrap_or_default(),
            });
            self.services
                .event_bus
                .emit(Event::PluginLoaded { name })
                .await;
        }

        Ok(registry)
    }

    /// Unload in reverse load order. Failures and timeouts never stop the
    /// remaining plugins from unloading.
    pub async fn unload_all(&self, registry: &PluginRegistry) {
        for plugin in registry.get_all().iter().rev() {
            let name = plugin.manifest.name.clone();
            match timeout(self.on_unload_timeout, plugin.instance.on_unload()).await {
                Ok(Ok(())) => info!(plugin = %name, "plugin unloaded"),
                Ok(Err(e)) => warn!(plugin = %name, error = %e, "on_unload failed"),
                Err(_) => warn!(
                    plugin = %name,
                    timeout_secs = self.on_unload_timeout.as_secs(),
                    "on_unload timed out"
                ),
            }
            self.services
                .event_bus
                .emit(Event::PluginUnloaded { name })
                .await;
        }
    }
}
