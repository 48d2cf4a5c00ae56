//! Plugin manifest — the `plugin.json` descriptor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Filename plugins must use for their manifest.
pub const PLUGIN_MANIFEST_FILENAME: &str = "plugin.json";

/// Which process a plugin runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginTarget {
    Host,
    Container,
    Both,
}

/// The runtime currently loading plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    Host,
    Container,
}

impl PluginTarget {
    pub fn matches(self, runtime: Runtime) -> bool {
        match self {
            Self::Both => true,
            Self::Host => runtime == Runtime::Host,
            Self::Container => runtime == Runtime::Container,
        }
    }
}

/// A named permission a plugin may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Capability {
    IpcRead,
    IpcWrite,
    FsRead,
    FsWrite,
    Network,
    Shell,
    MessagesRead,
    MessagesWrite,
    TasksManage,
    GroupsManage,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IpcRead => "ipc:read",
            Self::IpcWrite => "ipc:write",
            Self::FsRead => "fs:read",
            Self::FsWrite => "fs:write",
            Self::Network => "network",
            Self::Shell => "shell",
            Self::MessagesRead => "messages:read",
            Self::MessagesWrite => "messages:write",
            Self::TasksManage => "tasks:manage",
            Self::GroupsManage => "groups:manage",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Capability {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "ipc:read" => Ok(Self::IpcRead),
            "ipc:write" => Ok(Self::IpcWrite),
            "fs:read" => Ok(Self::FsRead),
            "fs:write" => Ok(Self::FsWrite),
            "network" => Ok(Self::Network),
            "shell" => Ok(Self::Shell),
            "messages:read" => Ok(Self::MessagesRead),
            "messages:write" => Ok(Self::MessagesWrite),
            "tasks:manage" => Ok(Self::TasksManage),
            "groups:manage" => Ok(Self::GroupsManage),
            other => Err(format!("unknown capability '{other}'")),
        }
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.as_str().to_string()
    }
}

/// Parsed plugin manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique kebab-case identifier (e.g. `"task-scheduler"`).
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub target: PluginTarget,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_main_entry", rename = "mainEntry")]
    pub main_entry: String,
}

fn default_main_entry() -> String {
    "index.ts".to_string()
}

impl PluginManifest {
    pub fn grants(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Result of attempting to load a manifest from a directory.
pub enum ManifestLoadResult {
    Ok {
        manifest: PluginManifest,
        path: PathBuf,
    },
    Err {
        error: String,
        path: PathBuf,
    },
}

/// Load and validate `plugin.json` from `root_dir`.
pub fn load_manifest(root_dir: &Path) -> ManifestLoadResult {
    let manifest_path = root_dir.join(PLUGIN_MANIFEST_FILENAME);
    if !manifest_path.exists() {
        return ManifestLoadResult::Err {
            error: format!("manifest not found: {}", manifest_path.display()),
            path: manifest_path,
        };
    }
    let raw = match fs::read_to_string(&manifest_path) {
        Ok(s) => s,
        Err(e) => {
            return ManifestLoadResult::Err {
                error: format!("failed to read manifest: {e}"),
                path: manifest_path,
            }
        }
    };
    match serde_json::from_str::<PluginManifest>(&raw) {
        Ok(manifest) => {
            if !valid_name(&manifest.name) {
                return ManifestLoadResult::Err {
                    error: format!(
                        "invalid plugin name '{}' (expected ^[a-z0-9-]+$)",
                        manifest.name
                    ),
                    path: manifest_path,
                };
            }
            ManifestLoadResult::Ok {
                manifest,
                path: manifest_path,
            }
        }
        Err(e) => ManifestLoadResult::Err {
            error: format!("failed to parse manifest: {e}"),
            path: manifest_path,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn load_valid_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(PLUGIN_MANIFEST_FILENAME),
            r#"{
                "name": "speech",
                "version": "1.2.0",
                "description": "Text to speech",
                "target": "container",
                "capabilities": ["ipc:write", "fs:read"],
                "dependencies": ["audio-core"]
            }"#,
        )
        .unwrap();

        match load_manifest(dir.path()) {
            ManifestLoadResult::Ok { manifest, .. } => {
                assert_eq!(manifest.name, "speech");
                assert_eq!(manifest.target, PluginTarget::Container);
                assert!(manifest.grants(Capability::IpcWrite));
                assert!(!manifest.grants(Capability::IpcRead));
                assert_eq!(manifest.dependencies, vec!["audio-core"]);
                assert_eq!(manifest.main_entry, "index.ts");
            }
            ManifestLoadResult::Err { error, .. } => panic!("unexpected error: {error}"),
        }
    }

    #[test]
    fn load_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        match load_manifest(dir.path()) {
            ManifestLoadResult::Err { error, .. } => assert!(error.contains("not found")),
            ManifestLoadResult::Ok { .. } => panic!("should fail"),
        }
    }

    #[test]
    fn invalid_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(PLUGIN_MANIFEST_FILENAME),
            r#"{"name": "Bad Name!", "version": "0.1.0", "target": "host"}"#,
        )
        .unwrap();
        match load_manifest(dir.path()) {
            ManifestLoadResult::Err { error, .. } => assert!(error.contains("invalid plugin name")),
            ManifestLoadResult::Ok { .. } => panic!("should fail"),
        }
    }

    #[test]
    fn unknown_capability_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(PLUGIN_MANIFEST_FILENAME),
            r#"{"name": "x", "version": "0.1.0", "target": "host", "capabilities": ["root:everything"]}"#,
        )
        .unwrap();
        match load_manifest(dir.path()) {
            ManifestLoadResult::Err { error, .. } => assert!(error.contains("unknown capability")),
            ManifestLoadResult::Ok { .. } => panic!("should fail"),
        }
    }

    #[test]
    fn target_matching() {
        assert!(PluginTarget::Both.matches(Runtime::Host));
        assert!(PluginTarget::Both.matches(Runtime::Container));
        assert!(PluginTarget::Host.matches(Runtime::Host));
        assert!(!PluginTarget::Host.matches(Runtime::Container));
        assert!(!PluginTarget::Container.matches(Runtime::Host));
    }

    #[test]
    fn capability_wire_form_roundtrip() {
        let json = serde_json::to_string(&Capability::MessagesWrite).unwrap();
        assert_eq!(json, "\"messages:write\"");
        let parsed: Capability = serde_json::from_str("\"tasks:manage\"").unwrap();
        assert_eq!(parsed, Capability::TasksManage);
    }
}
