//! Plugin discovery — scans directories for plugin manifests.
//!
//! Each subdirectory of a search path containing `plugin.json` is a
//! candidate. Invalid manifests are reported and skipped; they never abort
//! the scan.

use std::path::{Path, PathBuf};
use tracing::warn;

use super::manifest::{load_manifest, ManifestLoadResult, PluginManifest, PLUGIN_MANIFEST_FILENAME};

/// A discovered plugin before loading.
#[derive(Debug)]
pub struct DiscoveredPlugin {
    pub manifest: PluginManifest,
    pub dir: PathBuf,
}

/// Result of a discovery scan.
pub struct DiscoveryResult {
    pub plugins: Vec<DiscoveredPlugin>,
    pub warnings: Vec<String>,
}

fn scan_dir(dir: &Path, plugins: &mut Vec<DiscoveredPlugin>, warnings: &mut Vec<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        // A missing search path simply has no plugins.
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with('.'))
        {
            continue;
        }
        if !path.join(PLUGIN_MANIFEST_FILENAME).exists() {
            continue;
        }

        match load_manifest(&path) {
            ManifestLoadResult::Ok { manifest, .. } => {
                plugins.push(DiscoveredPlugin { manifest, dir: path });
            }
            ManifestLoadResult::Err { error, path: mp } => {
                warn!(manifest = %mp.display(), error = %error, "skipping invalid plugin manifest");
                warnings.push(format!("{}: {error}", mp.display()));
            }
        }
    }
}

/// Discover plugins from the configured search paths, in path order.
pub fn discover_plugins(search_paths: &[PathBuf]) -> DiscoveryResult {
    let mut plugins = Vec::new();
    let mut warnings = Vec::new();
    for path in search_paths {
        scan_dir(path, &mut plugins, &mut warnings);
    }
    DiscoveryResult { plugins, warnings }
}
