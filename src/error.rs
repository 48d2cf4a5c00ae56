//! Core error kinds.
//!
//! Most of the crate propagates `anyhow::Result`; this enum exists for the
//! places where a caller must distinguish the kind — capability gating,
//! IPC containment, configuration rejects.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad manifest, missing config, invalid cron expression. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A gated service stub refused a call the plugin's manifest did not
    /// declare.
    #[error("capability denied: '{operation}' requires capability '{capability}'")]
    CapabilityDenied {
        operation: String,
        capability: String,
    },

    /// An IPC write resolved outside the designated root.
    #[error("ipc path escape: '{path}' is outside ipc root '{root}'")]
    IpcPathEscape { path: String, root: String },
}
