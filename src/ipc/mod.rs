//! File-drop IPC transport.
//!
//! A per-agent bidirectional transport rooted at a known directory. Writers
//! drop complete JSON files (temp-file-then-rename, so readers never see a
//! partial document); readers drain `*.json` in filename order, which equals
//! chronological order because filenames are epoch-prefixed. A zero-content
//! `_close` file signals end of session.

pub mod types;

pub use types::IpcMessage;

use anyhow::{Context, Result};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::error::CoreError;

/// Filename of the end-of-session sentinel.
pub const CLOSE_SENTINEL: &str = "_close";

/// Default interval between drain scans.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Validate that `candidate` lies under `root` once both are canonical.
///
/// The candidate's parent must already exist (the caller creates drop
/// directories before writing). Returns the canonical path of the file.
pub fn contained_path(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let canonical_root = root
        .canonicalize()
        .with_context(|| format!("IPC root does not exist: {}", root.display()))?;
    let parent = candidate
        .parent()
        .ok_or_else(|| anyhow::anyhow!("IPC path has no parent: {}", candidate.display()))?;
    let file_name = candidate
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("IPC path has no filename: {}", candidate.display()))?;
    let canonical = parent
        .canonicalize()
        .with_context(|| format!("IPC directory does not exist: {}", parent.display()))?
        .join(file_name);

    if !canonical.starts_with(&canonical_root) {
        return Err(CoreError::IpcPathEscape {
            path: canonical.display().to_string(),
            root: canonical_root.display().to_string(),
        }
        .into());
    }
    Ok(canonical)
}

fn drop_filename() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{millis}-{suffix}.json")
}

/// Atomically write one raw document into `dir` (which must lie under
/// `root`). Returns the final path.
pub fn write_raw(root: &Path, dir: &Path, contents: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create IPC directory: {}", dir.display()))?;
    let final_path = contained_path(root, &dir.join(drop_filename()))?;
    let tmp_path = final_path.with_extension("json.tmp");

    std::fs::write(&tmp_path, contents)
        .with_context(|| format!("Failed to write IPC temp file: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, &final_path)
        .with_context(|| format!("Failed to commit IPC file: {}", final_path.display()))?;
    debug!(path = %final_path.display(), "ipc file written");
    Ok(final_path)
}

/// Atomically write one message into `dir` (which must lie under `root`).
pub fn write_message(root: &Path, dir: &Path, message: &IpcMessage) -> Result<PathBuf> {
    let contents = serde_json::to_string(message).context("Failed to serialize IPC message")?;
    write_raw(root, dir, &contents)
}

/// Write the `_close` sentinel into `dir`.
pub fn write_close_sentinel(root: &Path, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create IPC directory: {}", dir.display()))?;
    let final_path = contained_path(root, &dir.join(CLOSE_SENTINEL))?;
    let tmp_path = final_path.with_extension("tmp");
    std::fs::write(&tmp_path, b"")
        .with_context(|| format!("Failed to write sentinel temp: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, &final_path)
        .with_context(|| format!("Failed to commit sentinel: {}", final_path.display()))?;
    Ok(())
}

/// Detect and consume the `_close` sentinel. Returns true if it was present.
pub fn take_close_sentinel(dir: &Path) -> bool {
    let sentinel = dir.join(CLOSE_SENTINEL);
    if sentinel.exists() {
        if let Err(e) = std::fs::remove_file(&sentinel) {
            warn!(path = %sentinel.display(), error = %e, "failed to unlink close sentinel");
        }
        return true;
    }
    false
}

/// Drain all complete messages from `dir` in chronological order.
///
/// Each file is unlinked after a successful parse. Files that fail to parse
/// are unlinked and logged; they never block the rest of the drain.
pub fn drain(dir: &Path) -> Result<Vec<IpcMessage>> {
    let mut names: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect(),
        // A drop directory that does not exist yet has nothing to drain.
        Err(_) => return Ok(Vec::new()),
    };
    names.sort();

    let mut messages = Vec::new();
    for path in names {
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read IPC file");
                continue;
            }
        };
        match serde_json::from_str::<IpcMessage>(&raw) {
            Ok(message) => {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to unlink drained IPC file");
                }
                messages.push(message);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unparseable IPC file dropped");
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to unlink bad IPC file");
                }
            }
        }
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn text_message(n: u32) -> IpcMessage {
        IpcMessage::Message {
            chat_jid: "web:main".into(),
            text: format!("msg-{n}"),
            sender: None,
            group_folder: "main".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn write_then_drain_roundtrip_in_order() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let dir = root.join("main").join("inbox");

        for n in 0..5 {
            write_message(root, &dir, &text_message(n)).unwrap();
            // filenames are millisecond-prefixed; space out the writes
            std::thread::sleep(Duration::from_millis(2));
        }

        let drained = drain(&dir).unwrap();
        let texts: Vec<String> = drained
            .into_iter()
            .map(|m| match m {
                IpcMessage::Message { text, .. } => text,
                other => panic!("unexpected message: {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);

        // drained files are gone
        assert!(drain(&dir).unwrap().is_empty());
    }

    #[test]
    fn no_partial_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let dir = root.join("main").join("inbox");
        write_message(root, &dir, &text_message(1)).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn write_outside_root_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("ipc");
        std::fs::create_dir_all(&root).unwrap();
        let outside = tmp.path().join("elsewhere");

        let err = write_message(&root, &outside, &text_message(1)).unwrap_err();
        let core = err.downcast_ref::<CoreError>().expect("core error");
        assert!(matches!(core, CoreError::IpcPathEscape { .. }));
        // nothing was created at the escape target
        assert!(drain(&outside).unwrap().is_empty());
    }

    #[test]
    fn traversal_components_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("ipc");
        let dir = root.join("main").join("inbox");
        std::fs::create_dir_all(&dir).unwrap();

        let sneaky = dir.join("..").join("..").join("..").join("evil.json");
        std::fs::create_dir_all(sneaky.parent().unwrap()).unwrap();
        let err = contained_path(&root, &sneaky).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::IpcPathEscape { .. })
        ));
    }

    #[test]
    fn unparseable_file_is_dropped_and_skipped() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let dir = root.join("main").join("inbox");
        std::fs::create_dir_all(&dir).unwrap();

        std::fs::write(dir.join("0000000000000-aaaaaa.json"), "not json {{").unwrap();
        write_message(root, &dir, &text_message(7)).unwrap();

        let drained = drain(&dir).unwrap();
        assert_eq!(drained.len(), 1);
        assert!(!dir.join("0000000000000-aaaaaa.json").exists());
    }

    #[test]
    fn close_sentinel_detect_and_consume() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let dir = root.join("main").join("inbox");

        assert!(!take_close_sentinel(&dir));
        write_close_sentinel(root, &dir).unwrap();
        assert!(take_close_sentinel(&dir));
        // consuming is idempotent
        assert!(!take_close_sentinel(&dir));
    }

    #[test]
    fn drain_missing_directory_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(drain(&tmp.path().join("nope")).unwrap().is_empty());
    }
}
