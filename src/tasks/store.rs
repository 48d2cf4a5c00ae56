//! Persistent task store and append-only run log.
//!
//! All status, retry, and next-run updates are single-row writes. The store
//! never decides policy; the engine drives every transition.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::schedule;
use super::{
    ContextMode, NewTask, RunStatus, ScheduleType, ScheduledTask, TaskRunLog, TaskStatus,
};

#[derive(Debug, Clone)]
pub struct TaskStore {
    db_path: PathBuf,
}

impl TaskStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.with_connection(|_| Ok(()))?;
        Ok(store)
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state dir: {}", parent.display()))?;
        }
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id             TEXT PRIMARY KEY,
                folder         TEXT NOT NULL,
                jid            TEXT NOT NULL,
                prompt         TEXT NOT NULL,
                schedule_type  TEXT NOT NULL,
                schedule_value TEXT NOT NULL,
                context_mode   TEXT NOT NULL,
                status         TEXT NOT NULL,
                next_run       TEXT,
                last_run       TEXT,
                last_result    TEXT,
                last_error     TEXT,
                retry_count    INTEGER NOT NULL DEFAULT 0,
                max_retries    INTEGER NOT NULL DEFAULT 3,
                created_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON scheduled_tasks(next_run);
            CREATE INDEX IF NOT EXISTS idx_tasks_folder ON scheduled_tasks(folder);
            CREATE TABLE IF NOT EXISTS task_runs (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id     TEXT NOT NULL,
                run_at      TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                status      TEXT NOT NULL,
                result      TEXT,
                error       TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_task_runs_task ON task_runs(task_id);",
        )
        .context("Failed to initialize task schema")?;
        f(&conn)
    }

    /// Create a task with a computed first `next_run`.
    pub fn create(
        &self,
        new: NewTask,
        max_retries: u32,
        tz: Option<&str>,
    ) -> Result<ScheduledTask> {
        let now = Utc::now();
        let next_run =
            schedule::initial_next_run(new.schedule_type, &new.schedule_value, tz, now)?;
        let task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            folder: new.folder,
            jid: new.jid,
            prompt: new.prompt,
            schedule_type: new.schedule_type,
            schedule_value: new.schedule_value,
            context_mode: new.context_mode,
            status: TaskStatus::Active,
            next_run: Some(next_run),
            last_run: None,
            last_result: None,
            last_error: None,
            retry_count: 0,
            max_retries,
            created_at: now,
        };

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks
                 (id, folder, jid, prompt, schedule_type, schedule_value, context_mode,
                  status, next_run, retry_count, max_retries, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11)",
                params![
                    task.id,
                    task.folder,
                    task.jid,
                    task.prompt,
                    task.schedule_type.as_str(),
                    task.schedule_value,
                    task.context_mode.as_str(),
                    task.status.as_str(),
                    task.next_run.map(|d| d.to_rfc3339()),
                    task.max_retries,
                    task.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert task")?;
            Ok(())
        })?;
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Option<ScheduledTask>> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!("{SELECT_TASK} WHERE id = ?1"),
                params![id],
                row_to_task,
            )
            .optional()
            .context("Failed to query task")
        })
    }

    pub fn list_all(&self) -> Result<Vec<ScheduledTask>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_TASK} ORDER BY created_at ASC"))?;
            let tasks = collect_tasks(stmt.query_map([], row_to_task)?);
            tasks
        })
    }

    pub fn list_for_folder(&self, folder: &str) -> Result<Vec<ScheduledTask>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_TASK} WHERE folder = ?1 ORDER BY created_at ASC"
            ))?;
            let tasks = collect_tasks(stmt.query_map(params![folder], row_to_task)?);
            tasks
        })
    }

    /// Active tasks whose `next_run` has arrived, in firing order.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_TASK} WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
                 ORDER BY next_run ASC"
            ))?;
            let tasks = collect_tasks(stmt.query_map(params![now.to_rfc3339()], row_to_task)?);
            tasks
        })
    }

    pub fn count(&self) -> Result<usize> {
        self.with_connection(|conn| {
            let count: usize =
                conn.query_row("SELECT COUNT(*) FROM scheduled_tasks", [], |row| row.get(0))?;
            Ok(count)
        })
    }

    /// Successful run: reset the retry budget, clear the error, advance
    /// `next_run`.
    pub fn mark_success(
        &self,
        id: &str,
        result: Option<&str>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks
                 SET last_run = ?1, last_result = ?2, last_error = NULL,
                     retry_count = 0, next_run = ?3
                 WHERE id = ?4",
                params![
                    Utc::now().to_rfc3339(),
                    result,
                    next_run.map(|d| d.to_rfc3339()),
                    id
                ],
            )
            .context("Failed to record task success")?;
            Ok(())
        })
    }

    /// Failed run: record the error. The retry counter moves separately so
    /// the engine controls when it advances.
    pub fn mark_failure(&self, id: &str, error: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET last_run = ?1, last_error = ?2 WHERE id = ?3",
                params![Utc::now().to_rfc3339(), error, id],
            )
            .context("Failed to record task failure")?;
            Ok(())
        })
    }

    /// Advance the retry counter and return its new value.
    pub fn increment_retry(&self, id: &str) -> Result<u32> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET retry_count = retry_count + 1 WHERE id = ?1",
                params![id],
            )?;
            let count: u32 = conn.query_row(
                "SELECT retry_count FROM scheduled_tasks WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    pub fn set_status(&self, id: &str, status: TaskStatus) -> Result<bool> {
        let changed = self.with_connection(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update task status")
        })?;
        Ok(changed > 0)
    }

    /// Terminal transition; also clears `next_run` so a completed `once`
    /// task can never be re-picked.
    pub fn mark_completed(&self, id: &str) -> Result<bool> {
        let changed = self.with_connection(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET status = 'completed', next_run = NULL WHERE id = ?1",
                params![id],
            )
            .context("Failed to complete task")
        })?;
        Ok(changed > 0)
    }

    pub fn set_next_run(&self, id: &str, next_run: Option<DateTime<Utc>>) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET next_run = ?1 WHERE id = ?2",
                params![next_run.map(|d| d.to_rfc3339()), id],
            )?;
            Ok(())
        })
    }

    /// Delete a task. Idempotent: deleting an unknown id returns `false`.
    pub fn cancel(&self, id: &str) -> Result<bool> {
        let changed = self.with_connection(|conn| {
            conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])
                .context("Failed to delete task")
        })?;
        Ok(changed > 0)
    }

    /// Append one run record. A completed task is terminal: appending to it
    /// is refused.
    pub fn append_run_log(&self, log: &TaskRunLog) -> Result<()> {
        self.with_connection(|conn| {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM scheduled_tasks WHERE id = ?1",
                    params![log.task_id],
                    |row| row.get(0),
                )
                .optional()?;
            if status.as_deref() == Some("completed") {
                anyhow::bail!("task {} is completed; run log is closed", log.task_id);
            }
            conn.execute(
                "INSERT INTO task_runs (task_id, run_at, duration_ms, status, result, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    log.task_id,
                    log.run_at.to_rfc3339(),
                    log.duration_ms,
                    log.status.as_str(),
                    log.result,
                    log.error,
                ],
            )
            .context("Failed to append run log")?;
            Ok(())
        })
    }

    /// Most recent runs first.
    pub fn recent_runs(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRunLog>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, run_at, duration_ms, status, result, error
                 FROM task_runs WHERE task_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![task_id, limit], |row| {
                let run_at_raw: String = row.get(1)?;
                let status_raw: String = row.get(3)?;
                Ok(TaskRunLog {
                    task_id: row.get(0)?,
                    run_at: DateTime::parse_from_rfc3339(&run_at_raw)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    duration_ms: row.get(2)?,
                    status: if status_raw == "success" {
                        RunStatus::Success
                    } else {
                        RunStatus::Error
                    },
                    result: row.get(4)?,
                    error: row.get(5)?,
                })
            })?;
            let mut runs = Vec::new();
            for row in rows {
                runs.push(row?);
            }
            Ok(runs)
        })
    }
}

const SELECT_TASK: &str = "SELECT id, folder, jid, prompt, schedule_type, schedule_value,
     context_mode, status, next_run, last_run, last_result, last_error,
     retry_count, max_retries, created_at
     FROM scheduled_tasks";

fn parse_opt_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .ok()
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let schedule_type_raw: String = row.get(4)?;
    let context_mode_raw: String = row.get(6)?;
    let status_raw: String = row.get(7)?;
    let created_raw: String = row.get(14)?;
    Ok(ScheduledTask {
        id: row.get(0)?,
        folder: row.get(1)?,
        jid: row.get(2)?,
        prompt: row.get(3)?,
        schedule_type: ScheduleType::try_from(schedule_type_raw.as_str())
            .unwrap_or(ScheduleType::Once),
        schedule_value: row.get(5)?,
        context_mode: ContextMode::parse(&context_mode_raw),
        status: TaskStatus::try_from(status_raw.as_str()).unwrap_or(TaskStatus::Error),
        next_run: parse_opt_ts(row.get(8)?),
        last_run: parse_opt_ts(row.get(9)?),
        last_result: row.get(10)?,
        last_error: row.get(11)?,
        retry_count: row.get(12)?,
        max_retries: row.get(13)?,
        created_at: DateTime::parse_from_rfc3339(&created_raw)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn collect_tasks(
    rows: impl Iterator<Item = rusqlite::Result<ScheduledTask>>,
) -> Result<Vec<ScheduledTask>> {
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row?);
    }
    Ok(tasks)
}
