use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// State directory (database, IPC root, chat folders) - computed, not serialized
    #[serde(skip)]
    pub state_dir: PathBuf,
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// IANA timezone for cron next-run evaluation (e.g. "America/New_York").
    /// Cron expressions evaluate in UTC when unset.
    #[serde(default)]
    pub timezone: Option<String>,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub ipc: IpcConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,

    #[serde(default)]
    pub channels: ChannelsConfig,
}

// ── Agent subprocess ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Command used to launch the per-chat agent subprocess.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Extra arguments passed to the agent command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Interactive idle timeout: seconds without a streamed result before
    /// the host writes the close sentinel.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Idle timeout for scheduled task runs, independent of the interactive one.
    #[serde(default = "default_task_idle_timeout_secs")]
    pub task_idle_timeout_secs: u64,
    /// Grace window between the close sentinel and hard termination.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

fn default_agent_command() -> String {
    "nanoclaw-agent".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    180
}

fn default_task_idle_timeout_secs() -> u64 {
    300
}

fn default_kill_grace_secs() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: Vec::new(),
            idle_timeout_secs: default_idle_timeout_secs(),
            task_idle_timeout_secs: default_task_idle_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

// ── IPC transport ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Poll interval for draining IPC drop directories.
    #[serde(default = "default_ipc_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_ipc_poll_ms() -> u64 {
    500
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_ipc_poll_ms(),
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Due-scan poll interval in seconds.
    #[serde(default = "default_scheduler_poll_secs")]
    pub poll_secs: u64,
    /// Default retry budget for new tasks.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound on stored tasks.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
}

fn default_scheduler_poll_secs() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_tasks() -> usize {
    100
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_secs: default_scheduler_poll_secs(),
            max_retries: default_max_retries(),
            max_tasks: default_max_tasks(),
        }
    }
}

// ── Event bus ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Per-handler timeout for event fan-out.
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
}

fn default_handler_timeout_secs() -> u64 {
    5
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            handler_timeout_secs: default_handler_timeout_secs(),
        }
    }
}

// ── Plugins ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Extra plugin directories scanned in addition to `<state>/plugins`.
    #[serde(default)]
    pub load_paths: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            load_paths: Vec::new(),
        }
    }
}

// ── Channels ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// The single folder where cross-chat administrative tools are permitted.
    #[serde(default = "default_main_folder")]
    pub main_folder: String,
}

fn default_main_folder() -> String {
    "owner-dm".to_string()
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            main_folder: default_main_folder(),
        }
    }
}

// ── Loading & derived paths ───────────────────────────────────────

impl Config {
    /// Load configuration from `path`, or from `<state>/config.toml` when
    /// `path` is `None`. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let state_dir = Self::default_state_dir()?;
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => state_dir.join("config.toml"),
        };

        let mut config = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config: {}", config_path.display()))?;
            toml::from_str::<Config>(&raw)
                .with_context(|| format!("Failed to parse config: {}", config_path.display()))?
        } else {
            Config::default()
        };

        config.state_dir = state_dir;
        config.config_path = config_path;
        Ok(config)
    }

    fn default_state_dir() -> Result<PathBuf> {
        let base = BaseDirs::new().context("Could not resolve home directory")?;
        Ok(base.home_dir().join(".nanoclaw"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("nanoclaw.db")
    }

    /// Root for all IPC drop directories.
    pub fn ipc_root(&self) -> PathBuf {
        self.state_dir.join("ipc")
    }

    /// Host→agent drop directory for a chat folder.
    pub fn ipc_inbox(&self, folder: &str) -> PathBuf {
        self.ipc_root().join(folder).join("inbox")
    }

    /// Agent→host drop directory for a chat folder.
    pub fn ipc_outbox(&self, folder: &str) -> PathBuf {
        self.ipc_root().join(folder).join("outbox")
    }

    /// Read-only task snapshot consumed by the agent's list_tasks tool.
    pub fn tasks_snapshot_path(&self, folder: &str) -> PathBuf {
        self.ipc_root().join(folder).join("tasks_snapshot.json")
    }

    /// Root directory for per-chat working folders.
    pub fn groups_dir(&self) -> PathBuf {
        self.state_dir.join("groups")
    }

    pub fn group_dir(&self, folder: &str) -> PathBuf {
        self.groups_dir().join(folder)
    }

    /// Default plugin search paths: `<state>/plugins` plus configured extras.
    pub fn plugin_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.state_dir.join("plugins")];
        for raw in &self.plugins.load_paths {
            paths.push(PathBuf::from(shellexpand::tilde(raw).as_ref()));
        }
        paths
    }
}
