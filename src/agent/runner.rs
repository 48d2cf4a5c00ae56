//! Agent subprocess lifecycle.
//!
//! One long-running child process per chat. The host writes the initial
//! configuration to stdin, pumps framed payloads off stdout, and keeps the
//! process warm across turns: follow-up user text arrives through the
//! agent's IPC inbox, and the `_close` sentinel ends the multi-turn loop.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use super::protocol::{AgentInput, AgentOutput, AgentStatus, FrameExtractor};
use crate::config::AgentConfig;
use crate::ipc;

/// Everything needed to launch one agent process.
#[derive(Debug, Clone)]
pub struct AgentSpawnSpec {
    pub input: AgentInput,
    /// Chat folder used as the child's working directory.
    pub working_dir: PathBuf,
    /// IPC root for containment checks.
    pub ipc_root: PathBuf,
    /// The agent's inbox; the host writes `_close` here on kill.
    pub inbox: PathBuf,
}

/// Aggregated outcome of one agent run.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub status: AgentStatus,
    /// Last non-null streamed result.
    pub result: Option<String>,
    pub new_session_id: Option<String>,
    pub error: Option<String>,
}

pub struct AgentRunner {
    command: String,
    args: Vec<String>,
    kill_grace: Duration,
}

impl AgentRunner {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            kill_grace: Duration::from_secs(config.kill_grace_secs),
        }
    }

    /// Spawn the agent and pump it to completion.
    ///
    /// Every framed payload is forwarded through `outputs` as it arrives. A
    /// `kill` notification writes the close sentinel into the agent's inbox
    /// and, after the grace window, terminates the process.
    pub async fn run(
        &self,
        spec: AgentSpawnSpec,
        outputs: mpsc::Sender<AgentOutput>,
        kill: Arc<Notify>,
    ) -> Result<AgentRunResult> {
        std::fs::create_dir_all(&spec.working_dir).with_context(|| {
            format!("Failed to create agent workdir: {}", spec.working_dir.display())
        })?;
        std::fs::create_dir_all(&spec.inbox)
            .with_context(|| format!("Failed to create agent inbox: {}", spec.inbox.display()))?;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .current_dir(&spec.working_dir)
            .env("NANOCLAW_IPC_DIR", spec.inbox.parent().unwrap_or(&spec.inbox))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn agent command '{}'", self.command))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent missing stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent missing stdout pipe"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent missing stderr pipe"))?;

        let blob = serde_json::to_string(&spec.input).context("Failed to serialize agent input")?;
        stdin
            .write_all(blob.as_bytes())
            .await
            .context("Failed to write agent input")?;
        stdin.write_all(b"\n").await.ok();
        drop(stdin);

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut all = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if !all.is_empty() {
                    all.push('\n');
                }
                all.push_str(&line);
            }
            all
        });

        let mut extractor = FrameExtractor::new();
        let mut last_result: Option<String> = None;
        let mut new_session_id: Option<String> = None;
        let mut last_error: Option<String> = None;
        let mut saw_error = false;

        let mut lines = BufReader::new(stdout).lines();
        let mut kill_requested = false;
        let mut grace_sleep: Option<Pin<Box<tokio::time::Sleep>>> = None;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read agent stdout")? else {
                        break;
                    };
                    let Some(frame) = extractor.push_line(&line) else {
                        continue;
                    };
                    match frame {
                        Ok(payload) => {
                            if let Some(result) = &payload.result {
                                last_result = Some(result.clone());
                            }
                            if let Some(session) = &payload.new_session_id {
                                new_session_id = Some(session.clone());
                            }
                            if payload.status == AgentStatus::Error {
                                saw_error = true;
                                last_error = payload.error.clone();
                            }
                            if outputs.send(payload).await.is_err() {
                                debug!("agent output receiver dropped");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping malformed agent frame");
                        }
                    }
                }
                _ = kill.notified(), if !kill_requested => {
                    kill_requested = true;
                    if let Err(e) = ipc::write_close_sentinel(&spec.ipc_root, &spec.inbox) {
                        warn!(error = %e, "failed to write close sentinel on kill");
                    }
                    grace_sleep = Some(Box::pin(tokio::time::sleep(self.kill_grace)));
                }
                () = async { grace_sleep.as_mut().unwrap().await }, if grace_sleep.is_some() => {
                    warn!(grace_secs = self.kill_grace.as_secs(), "agent ignored close sentinel, terminating");
                    grace_sleep = None;
                    child.start_kill().context("Failed to terminate agent")?;
                }
            }
        }

        let status = child.wait().await.context("Failed to await agent exit")?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() && !saw_error {
            saw_error = true;
            last_error = Some(format!(
                "agent exited with {status}. stderr: {}",
                crate::util::truncate_with_ellipsis(stderr_text.trim(), 500)
            ));
        }

        Ok(AgentRunResult {
            status: if saw_error {
                AgentStatus::Error
            } else {
                AgentStatus::Success
            },
            result: last_result,
            new_session_id,
            error: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_fake_agent(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn spec(tmp: &TempDir) -> AgentSpawnSpec {
        AgentSpawnSpec {
            input: AgentInput {
                prompt: "hello".into(),
                session_id: None,
                group_folder: "main".into(),
                chat_jid: "web:main".into(),
                is_main: true,
                is_scheduled_task: None,
                secrets: None,
                sender_ids: None,
                trust_config: None,
            },
            working_dir: tmp.path().join("groups").join("main"),
            ipc_root: tmp.path().join("ipc"),
            inbox: tmp.path().join("ipc").join("main").join("inbox"),
        }
    }

    fn runner(command: &str) -> AgentRunner {
        AgentRunner {
            command: command.to_string(),
            args: Vec::new(),
            kill_grace: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn streams_frames_and_aggregates_final_result() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("ipc")).unwrap();
        let script = write_fake_agent(
            tmp.path(),
            r#"cat > /dev/null
echo '---NANOCLAW_OUTPUT_START---'
echo '{"status":"success","result":"partial","newSessionId":"s-9"}'
echo '---NANOCLAW_OUTPUT_END---'
echo 'log noise'
echo '---NANOCLAW_OUTPUT_START---'
echo '{"status":"success","result":"final answer"}'
echo '---NANOCLAW_OUTPUT_END---'"#,
        );

        let (tx, mut rx) = mpsc::channel(16);
        let result = runner(script.to_str().unwrap())
            .run(spec(&tmp), tx, Arc::new(Notify::new()))
            .await
            .unwrap();

        assert_eq!(result.status, AgentStatus::Success);
        assert_eq!(result.result.as_deref(), Some("final answer"));
        assert_eq!(result.new_session_id.as_deref(), Some("s-9"));

        let mut streamed = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            streamed.push(payload.result);
        }
        assert_eq!(
            streamed,
            vec![Some("partial".to_string()), Some("final answer".to_string())]
        );
    }

    #[tokio::test]
    async fn nonzero_exit_without_error_frame_is_a_process_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("ipc")).unwrap();
        let script = write_fake_agent(
            tmp.path(),
            "cat > /dev/null\necho 'dying horribly' >&2\nexit 3",
        );

        let (tx, _rx) = mpsc::channel(16);
        let result = runner(script.to_str().unwrap())
            .run(spec(&tmp), tx, Arc::new(Notify::new()))
            .await
            .unwrap();

        assert_eq!(result.status, AgentStatus::Error);
        let error = result.error.unwrap();
        assert!(error.contains("dying horribly"), "error was: {error}");
    }

    #[tokio::test]
    async fn error_frame_is_surfaced() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("ipc")).unwrap();
        let script = write_fake_agent(
            tmp.path(),
            r#"cat > /dev/null
echo '---NANOCLAW_OUTPUT_START---'
echo '{"status":"error","result":null,"error":"model unavailable"}'
echo '---NANOCLAW_OUTPUT_END---'"#,
        );

        let (tx, _rx) = mpsc::channel(16);
        let result = runner(script.to_str().unwrap())
            .run(spec(&tmp), tx, Arc::new(Notify::new()))
            .await
            .unwrap();

        assert_eq!(result.status, AgentStatus::Error);
        assert_eq!(result.error.as_deref(), Some("model unavailable"));
    }

    #[tokio::test]
    async fn kill_writes_sentinel_then_terminates_after_grace() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("ipc")).unwrap();
        // Ignores the sentinel and sleeps well past the grace window.
        let script = write_fake_agent(tmp.path(), "cat > /dev/null\nexec sleep 60");

        let kill = Arc::new(Notify::new());
        let (tx, _rx) = mpsc::channel(16);
        let spawn_spec = spec(&tmp);
        let inbox = spawn_spec.inbox.clone();

        let kill_clone = kill.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            kill_clone.notify_one();
        });

        let start = std::time::Instant::now();
        let result = runner(script.to_str().unwrap())
            .run(spawn_spec, tx, kill)
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(result.status, AgentStatus::Error);
        // the sentinel was dropped for the (unresponsive) agent
        assert!(inbox.join(ipc::CLOSE_SENTINEL).exists());
    }

    #[tokio::test]
    async fn missing_command_fails_to_spawn() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("ipc")).unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let err = runner("/definitely/not/a/real/agent")
            .run(spec(&tmp), tx, Arc::new(Notify::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }
}
