//! Scheduled task engine.
//!
//! A due-scan loop submits runs into the per-chat queues, so scheduled and
//! interactive work share one serialization point per JID. Failures are
//! diagnosed against the run history and drive an auto-recovery policy:
//! backoff retries, auto-pause on persistent errors, auto-complete on
//! orphaned tasks, with a structured notification to the owning chat on
//! every terminal transition.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time;
use tracing::{debug, info, warn};

use super::diagnose::{classify, Diagnosis, FailurePattern};
use super::store::TaskStore;
use super::{schedule, ContextMode, NewTask, RunStatus, ScheduleType, ScheduledTask, TaskRunLog, TaskStatus};
use crate::agent::{AgentInput, AgentOutput, AgentRunner, AgentSpawnSpec, AgentStatus};
use crate::config::Config;
use crate::db::ChatStore;
use crate::events::{Event, EventBus};
use crate::ipc;
use crate::plugins::{MessagesApi, TasksApi};
use crate::queue::ChatQueues;
use crate::util::truncate_with_ellipsis;

/// Fixed backoff ladder. Rate-limited failures always use the last rung.
pub const RETRY_LADDER: [Duration; 3] = [
    Duration::from_secs(30),
    Duration::from_secs(120),
    Duration::from_secs(600),
];

pub struct TaskEngine {
    config: Config,
    store: TaskStore,
    chats: ChatStore,
    queues: Arc<ChatQueues>,
    outbound: Arc<dyn MessagesApi>,
    runner: AgentRunner,
    bus: EventBus,
    retry_ladder: [Duration; 3],
    /// Tasks submitted to a queue and not yet finished; guards against the
    /// due scan re-picking a task mid-run.
    in_flight: Mutex<HashSet<String>>,
}

impl TaskEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: TaskStore,
        chats: ChatStore,
        queues: Arc<ChatQueues>,
        outbound: Arc<dyn MessagesApi>,
        bus: EventBus,
    ) -> Arc<Self> {
        let runner = AgentRunner::new(&config.agent);
        Arc::new(Self {
            config,
            store,
            chats,
            queues,
            outbound,
            runner,
            bus,
            retry_ladder: RETRY_LADDER,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Shrink the backoff ladder (used by tests).
    pub fn with_retry_ladder(self: Arc<Self>, ladder: [Duration; 3]) -> Arc<Self> {
        let mut engine = Arc::try_unwrap(self).unwrap_or_else(|_| panic!("engine already shared"));
        engine.retry_ladder = ladder;
        Arc::new(engine)
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// The due-scan loop. Never returns under normal operation; every scan
    /// failure is logged and the loop continues.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let poll = self.config.scheduler.poll_secs.max(1);
        let mut interval = time::interval(Duration::from_secs(poll));
        info!(poll_secs = poll, "task scheduler started");
        loop {
            interval.tick().await;
            if let Err(e) = self.clone().scan_once() {
                warn!(error = %e, "due scan failed");
            }
        }
    }

    /// One due scan: submit every active task whose time has come.
    pub fn scan_once(self: Arc<Self>) -> Result<()> {
        let due = self.store.due_tasks(Utc::now())?;
        for task in due {
            self.clone().submit(&task.id);
        }
        Ok(())
    }

    /// Queue one task run under its JID. Duplicate submissions while a run
    /// is in flight are dropped.
    pub fn submit(self: Arc<Self>, task_id: &str) {
        {
            let mut in_flight = self.in_flight.lock().expect("in_flight lock");
            if !in_flight.insert(task_id.to_string()) {
                return;
            }
        }

        let task = match self.store.get(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.in_flight.lock().expect("in_flight lock").remove(task_id);
                return;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "failed to read task for submission");
                self.in_flight.lock().expect("in_flight lock").remove(task_id);
                return;
            }
        };

        let engine = self.clone();
        let id = task_id.to_string();
        let queued = self.queues.enqueue_task(
            &task.jid,
            &task.folder,
            task_id,
            Box::new(move |kill| {
                Box::pin(async move {
                    engine.run_task(&id, kill).await;
                })
            }),
        );
        if let Err(e) = queued {
            warn!(task_id = %task_id, error = %e, "failed to enqueue task run");
            self.in_flight.lock().expect("in_flight lock").remove(task_id);
        }
    }

    async fn run_task(self: Arc<Self>, task_id: &str, kill: Arc<Notify>) {
        // Re-read: the task may have been paused or cancelled since the scan.
        let task = match self.store.get(task_id) {
            Ok(Some(task)) => task,
            _ => {
                self.in_flight.lock().expect("in_flight lock").remove(task_id);
                return;
            }
        };
        if !matches!(task.status, TaskStatus::Active | TaskStatus::Error) {
            debug!(task_id = %task_id, status = task.status.as_str(), "skipping run, task no longer runnable");
            self.in_flight.lock().expect("in_flight lock").remove(task_id);
            return;
        }

        let run_at = Utc::now();
        let started = std::time::Instant::now();
        let outcome = self.execute_run(&task, kill).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        // Recent history is captured before this run's log entry so the
        // diagnosis compares the current error against prior runs only.
        let prior_runs = self.store.recent_runs(task_id, 5).unwrap_or_default();

        match outcome {
            Ok(run) => {
                let log = TaskRunLog {
                    task_id: task_id.to_string(),
                    run_at,
                    duration_ms,
                    status: RunStatus::Success,
                    result: run.result.clone(),
                    error: None,
                };
                if let Err(e) = self.store.append_run_log(&log) {
                    warn!(task_id = %task_id, error = %e, "failed to append run log");
                }
                self.complete_success(&task, run.result.as_deref()).await;
                self.in_flight.lock().expect("in_flight lock").remove(task_id);
            }
            Err(error) => {
                let log = TaskRunLog {
                    task_id: task_id.to_string(),
                    run_at,
                    duration_ms,
                    status: RunStatus::Error,
                    result: None,
                    error: Some(error.clone()),
                };
                if let Err(e) = self.store.append_run_log(&log) {
                    warn!(task_id = %task_id, error = %e, "failed to append run log");
                }
                if let Err(e) = self.store.mark_failure(task_id, &error) {
                    warn!(task_id = %task_id, error = %e, "failed to record failure");
                }
                self.advance_next_run(&task);
                // next_run is already advanced, so clearing in_flight here
                // cannot double-run the task; retries re-submit through it.
                self.in_flight.lock().expect("in_flight lock").remove(task_id);
                self.handle_failure(&task, &error, &prior_runs).await;
            }
        }
    }

    /// Run the task's prompt through the per-chat agent machinery, streaming
    /// results to the owning channel. Returns the final error string on any
    /// failure.
    async fn execute_run(
        &self,
        task: &ScheduledTask,
        kill: Arc<Notify>,
    ) -> Result<crate::agent::AgentRunResult, String> {
        self.do_execute(task, kill).await.map_err(|e| format!("{e:#}"))
    }

    async fn do_execute(
        &self,
        task: &ScheduledTask,
        kill: Arc<Notify>,
    ) -> Result<crate::agent::AgentRunResult> {
        let chat = self
            .chats
            .get_by_jid(&task.jid)
            .context("chat lookup failed")?
            .ok_or_else(|| anyhow::anyhow!("group not found: {}", task.jid))?;

        self.write_tasks_snapshot(&task.folder)?;

        let session_id = match task.context_mode {
            ContextMode::Group => self.chats.get_session(&task.folder).unwrap_or(None),
            ContextMode::Isolated => None,
        };
        let is_main = task.folder == self.config.channels.main_folder;

        let input = AgentInput {
            prompt: task.prompt.clone(),
            session_id,
            group_folder: task.folder.clone(),
            chat_jid: chat.jid.clone(),
            is_main,
            is_scheduled_task: Some(true),
            secrets: None,
            sender_ids: None,
            trust_config: None,
        };
        let inbox = self.config.ipc_inbox(&task.folder);
        let spec = AgentSpawnSpec {
            input,
            working_dir: self.config.group_dir(&task.folder),
            ipc_root: self.config.ipc_root(),
            inbox: inbox.clone(),
        };

        // The task's own idle timer, independent of the interactive one.
        let idle_timeout = Duration::from_secs(self.config.agent.task_idle_timeout_secs);
        let deadline = Arc::new(Mutex::new(time::Instant::now() + idle_timeout));
        let watchdog = {
            let deadline = deadline.clone();
            let ipc_root = self.config.ipc_root();
            let inbox = inbox.clone();
            tokio::spawn(async move {
                loop {
                    let at = *deadline.lock().expect("deadline lock");
                    if time::Instant::now() >= at {
                        if let Err(e) = ipc::write_close_sentinel(&ipc_root, &inbox) {
                            warn!(error = %e, "task idle close failed");
                        }
                        break;
                    }
                    time::sleep_until(at).await;
                }
            })
        };

        let (tx, mut rx) = mpsc::channel::<AgentOutput>(32);
        let forwarder = {
            let deadline = deadline.clone();
            let outbound = self.outbound.clone();
            let chats = self.chats.clone();
            let jid = chat.jid.clone();
            let folder = task.folder.clone();
            let group_context = task.context_mode == ContextMode::Group;
            tokio::spawn(async move {
                while let Some(output) = rx.recv().await {
                    *deadline.lock().expect("deadline lock") = time::Instant::now() + idle_timeout;
                    if group_context {
                        if let Some(session) = &output.new_session_id {
                            if let Err(e) = chats.set_session(&folder, session) {
                                warn!(folder = %folder, error = %e, "failed to persist session");
                            }
                        }
                    }
                    if let Some(result) = output.result {
                        if let Err(e) = outbound.send_message(&jid, &result).await {
                            warn!(jid = %jid, error = %e, "task outbound send failed");
                        }
                    }
                }
            })
        };

        let result = self.runner.run(spec, tx, kill).await;
        watchdog.abort();
        let _ = forwarder.await;

        let run = result.map_err(|e| anyhow::anyhow!("{e:#}"))?;
        if run.status == AgentStatus::Error {
            anyhow::bail!(run.error.unwrap_or_else(|| "agent failed".to_string()));
        }
        Ok(run)
    }

    /// Read-only snapshot of the visible task set, so the agent's
    /// list_tasks tool sees coherent data. Main sees everything.
    fn write_tasks_snapshot(&self, folder: &str) -> Result<()> {
        let tasks = if folder == self.config.channels.main_folder {
            self.store.list_all()?
        } else {
            self.store.list_for_folder(folder)?
        };
        let path = self.config.tasks_snapshot_path(folder);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string(&tasks)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    async fn complete_success(&self, task: &ScheduledTask, result: Option<&str>) {
        if task.schedule_type == ScheduleType::Once {
            if let Err(e) = self.store.mark_success(&task.id, result, None) {
                warn!(task_id = %task.id, error = %e, "failed to record success");
            }
            if let Err(e) = self.store.mark_completed(&task.id) {
                warn!(task_id = %task.id, error = %e, "failed to complete once task");
            }
            self.bus
                .emit(Event::TaskCompleted {
                    task_id: task.id.clone(),
                    status: "completed".into(),
                })
                .await;
            return;
        }

        let next = schedule::next_after_run(
            task.schedule_type,
            &task.schedule_value,
            self.config.timezone.as_deref(),
            Utc::now(),
        )
        .unwrap_or_else(|e| {
            warn!(task_id = %task.id, error = %e, "next-run computation failed");
            None
        });
        if let Err(e) = self.store.mark_success(&task.id, result, next) {
            warn!(task_id = %task.id, error = %e, "failed to record success");
        }
        self.bus
            .emit(Event::TaskCompleted {
                task_id: task.id.clone(),
                status: "success".into(),
            })
            .await;
    }

    /// Advance `next_run` after a failed run, independent of the retry
    /// outcome, so the due scan never double-picks a failing task.
    fn advance_next_run(&self, task: &ScheduledTask) {
        let next = schedule::next_after_run(
            task.schedule_type,
            &task.schedule_value,
            self.config.timezone.as_deref(),
            Utc::now(),
        )
        .unwrap_or(None);
        if let Err(e) = self.store.set_next_run(&task.id, next) {
            warn!(task_id = %task.id, error = %e, "failed to advance next_run");
        }
    }

    async fn handle_failure(
        self: Arc<Self>,
        task: &ScheduledTask,
        error: &str,
        prior_runs: &[TaskRunLog],
    ) {
        let diagnosis = classify(error, prior_runs);
        info!(
            task_id = %task.id,
            pattern = diagnosis.pattern.as_str(),
            error = %truncate_with_ellipsis(error, 120),
            "task run failed"
        );

        match diagnosis.pattern {
            FailurePattern::Orphaned => {
                if let Err(e) = self.store.mark_completed(&task.id) {
                    warn!(task_id = %task.id, error = %e, "failed to deactivate orphaned task");
                }
                self.notify(task, &diagnosis, error, "was deactivated").await;
            }
            FailurePattern::Persistent => {
                if let Err(e) = self.store.set_status(&task.id, TaskStatus::Paused) {
                    warn!(task_id = %task.id, error = %e, "failed to pause task");
                }
                self.notify(task, &diagnosis, error, "was paused").await;
            }
            FailurePattern::RateLimited => {
                // Always the top rung, regardless of retry count.
                let top_rung = self.retry_ladder.len() - 1;
                self.schedule_retry(task, &diagnosis, error, Some(top_rung))
                    .await;
            }
            FailurePattern::Timeout | FailurePattern::Transient | FailurePattern::Unknown => {
                self.schedule_retry(task, &diagnosis, error, None).await;
            }
        }
    }

    async fn schedule_retry(
        self: Arc<Self>,
        task: &ScheduledTask,
        diagnosis: &Diagnosis,
        error: &str,
        rung_override: Option<usize>,
    ) {
        let new_count = match self.store.increment_retry(&task.id) {
            Ok(count) => count,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "failed to advance retry count");
                return;
            }
        };

        if new_count > task.max_retries {
            if let Err(e) = self.store.set_status(&task.id, TaskStatus::Error) {
                warn!(task_id = %task.id, error = %e, "failed to mark task errored");
            }
            self.notify(
                task,
                diagnosis,
                error,
                &format!("failed {new_count} times and was stopped"),
            )
            .await;
            return;
        }

        let rung = rung_override
            .unwrap_or_else(|| ((new_count as usize).saturating_sub(1)).min(self.retry_ladder.len() - 1));
        let delay = self.retry_ladder[rung];
        info!(
            task_id = %task.id,
            retry = new_count,
            delay_secs = delay.as_secs(),
            "retry scheduled"
        );

        let engine = self.clone();
        let task_id = task.id.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            // Re-check: pause or cancel since scheduling drops the retry.
            match engine.store.get(&task_id) {
                Ok(Some(task)) if matches!(task.status, TaskStatus::Active | TaskStatus::Error) => {
                    engine.submit(&task_id);
                }
                _ => debug!(task_id = %task_id, "retry dropped, task no longer runnable"),
            }
        });
    }

    /// One structured notification to the task's chat per terminal
    /// transition.
    async fn notify(&self, task: &ScheduledTask, diagnosis: &Diagnosis, error: &str, action: &str) {
        let text = format!(
            "⚠️ Scheduled task \"{}\" {}.\nDiagnosis: {} ({})\nRecommended: {}\nError: {}\nUse resume_task (or `nanoclaw task resume {}`) to start it again.",
            truncate_with_ellipsis(&task.prompt, 60),
            action,
            diagnosis.summary,
            diagnosis.pattern.as_str(),
            diagnosis.recommendation,
            truncate_with_ellipsis(error, 200),
            task.id,
        );
        if let Err(e) = self.outbound.send_message(&task.jid, &text).await {
            warn!(jid = %task.jid, error = %e, "failed to deliver task notification");
        }
    }
}

// ── Task management service ───────────────────────────────────────

/// The mutation surface shared by plugin tools, the dashboard, and the
/// outbox control messages. All writes go through the same store the
/// scheduler reads.
pub struct TaskService {
    config: Config,
    store: TaskStore,
    bus: EventBus,
}

impl TaskService {
    pub fn new(config: Config, store: TaskStore, bus: EventBus) -> Self {
        Self { config, store, bus }
    }
}

#[async_trait]
impl TasksApi for TaskService {
    async fn create_task(&self, new: NewTask) -> Result<ScheduledTask> {
        if self.store.count()? >= self.config.scheduler.max_tasks {
            anyhow::bail!(
                "Maximum number of scheduled tasks ({}) reached",
                self.config.scheduler.max_tasks
            );
        }
        let tz = self.config.timezone.as_deref();
        schedule::validate_schedule_value(new.schedule_type, &new.schedule_value, tz)
            .map_err(|e| crate::error::CoreError::Configuration(format!("{e:#}")))?;
        let task = self
            .store
            .create(new, self.config.scheduler.max_retries, tz)?;
        info!(task_id = %task.id, folder = %task.folder, "task created");
        self.bus
            .emit(Event::TaskCreated {
                task_id: task.id.clone(),
                folder: task.folder.clone(),
            })
            .await;
        Ok(task)
    }

    async fn list_tasks(&self, folder: &str, all_folders: bool) -> Result<Vec<ScheduledTask>> {
        if all_folders {
            self.store.list_all()
        } else {
            self.store.list_for_folder(folder)
        }
    }

    async fn pause_task(&self, id: &str) -> Result<bool> {
        match self.store.get(id)? {
            Some(task) if task.status != TaskStatus::Completed => {
                self.store.set_status(id, TaskStatus::Paused)
            }
            _ => Ok(false),
        }
    }

    async fn resume_task(&self, id: &str) -> Result<bool> {
        let Some(task) = self.store.get(id)? else {
            return Ok(false);
        };
        if !matches!(task.status, TaskStatus::Paused | TaskStatus::Error) {
            return Ok(false);
        }
        // A stale next_run would fire a burst of missed runs; restart the
        // recurrence from now.
        if task.schedule_type != ScheduleType::Once {
            let next = schedule::next_after_run(
                task.schedule_type,
                &task.schedule_value,
                self.config.timezone.as_deref(),
                Utc::now(),
            )?;
            self.store.set_next_run(id, next)?;
        }
        self.store.set_status(id, TaskStatus::Active)
    }

    async fn cancel_task(&self, id: &str) -> Result<bool> {
        self.store.cancel(id)
    }
}
