//! Durable interaction store: tasks, iterations and mined playbooks.
//!
//! Iteration rows are write-once and strictly sequential per task; terminal
//! task statuses are never re-transitioned. Violations surface as
//! [`StoreConflict`] inside the returned `anyhow::Error`.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, instrument};

use crate::core::types::{
    IterationRecord, Playbook, PrdRequest, TaskHistory, TaskRow, TaskSpec, TaskStatus, TestOutcome,
};

/// Persistence boundary used by the driver, the miner and the CLI.
pub trait InteractionStore {
    /// Insert a new `in_progress` task row.
    fn record_task_started(&self, task_id: &str, prd: &PrdRequest, created_at: &str) -> Result<()>;

    /// Move an `in_progress` task to a terminal status.
    fn record_task_finished(
        &self,
        task_id: &str,
        status: TaskStatus,
        completed_at: &str,
        final_code: Option<&str>,
    ) -> Result<()>;

    /// Append the next iteration of a task.
    fn record_iteration(&self, record: &IterationRecord) -> Result<()>;

    fn task(&self, task_id: &str) -> Result<Option<TaskRow>>;

    /// Iterations of `task_id` in ascending order.
    fn iterations(&self, task_id: &str) -> Result<Vec<IterationRecord>>;

    /// Every task with its iteration count and last spec, oldest first.
    fn task_histories(&self) -> Result<Vec<TaskHistory>>;

    /// Insert or fully replace the playbook with the same pattern.
    fn upsert_playbook(&self, playbook: &Playbook) -> Result<()>;

    /// All playbooks ordered by pattern.
    fn playbooks(&self) -> Result<Vec<Playbook>>;
}

/// Write rejected because it would break history invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConflict {
    DuplicateIteration {
        task_id: String,
        iteration: u32,
    },
    IterationGap {
        task_id: String,
        expected: u32,
        got: u32,
    },
    TerminalTransition {
        task_id: String,
        current: TaskStatus,
    },
    UnknownTask {
        task_id: String,
    },
    NotTerminal {
        task_id: String,
        status: TaskStatus,
    },
}

impl fmt::Display for StoreConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateIteration { task_id, iteration } => {
                write!(f, "iteration {iteration} of {task_id} already recorded")
            }
            Self::IterationGap {
                task_id,
                expected,
                got,
            } => write!(
                f,
                "iteration {got} of {task_id} out of order (expected {expected})"
            ),
            Self::TerminalTransition { task_id, current } => write!(
                f,
                "task {task_id} is already {} and cannot change status",
                current.as_str()
            ),
            Self::UnknownTask { task_id } => write!(f, "unknown task {task_id}"),
            Self::NotTerminal { task_id, status } => write!(
                f,
                "task {task_id} cannot finish with non-terminal status {}",
                status.as_str()
            ),
        }
    }
}

impl std::error::Error for StoreConflict {}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    task_id      TEXT PRIMARY KEY,
    prd          TEXT NOT NULL,
    status       TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    completed_at TEXT,
    final_code   TEXT
);

CREATE TABLE IF NOT EXISTS task_iterations (
    task_id      TEXT NOT NULL,
    iteration    INTEGER NOT NULL,
    spec         TEXT NOT NULL,
    agent_output TEXT NOT NULL,
    test_result  TEXT NOT NULL,
    error        TEXT,
    duration_ms  INTEGER NOT NULL,
    PRIMARY KEY (task_id, iteration)
);

CREATE TABLE IF NOT EXISTS playbooks (
    pattern               TEXT PRIMARY KEY,
    success_rate          REAL NOT NULL,
    avg_iterations        REAL NOT NULL,
    common_errors         TEXT NOT NULL,
    winning_spec_template TEXT NOT NULL,
    last_updated          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
";

/// SQLite-backed store. One connection guarded by a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` in WAL mode.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create store dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open store {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .context("configure store")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory store")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("create store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// A poisoned lock still holds a usable connection.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Stand-in used when the database cannot be opened: every call fails, so the
/// driver logs and counts each write and runs without audit history.
#[derive(Debug, Clone)]
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn err<T>(&self) -> Result<T> {
        Err(anyhow!("interaction store unavailable: {}", self.reason))
    }
}

impl InteractionStore for UnavailableStore {
    fn record_task_started(&self, _: &str, _: &PrdRequest, _: &str) -> Result<()> {
        self.err()
    }

    fn record_task_finished(&self, _: &str, _: TaskStatus, _: &str, _: Option<&str>) -> Result<()> {
        self.err()
    }

    fn record_iteration(&self, _: &IterationRecord) -> Result<()> {
        self.err()
    }

    fn task(&self, _: &str) -> Result<Option<TaskRow>> {
        self.err()
    }

    fn iterations(&self, _: &str) -> Result<Vec<IterationRecord>> {
        self.err()
    }

    fn task_histories(&self) -> Result<Vec<TaskHistory>> {
        self.err()
    }

    fn upsert_playbook(&self, _: &Playbook) -> Result<()> {
        self.err()
    }

    fn playbooks(&self) -> Result<Vec<Playbook>> {
        self.err()
    }
}

fn parse_status(raw: &str) -> rusqlite::Result<TaskStatus> {
    TaskStatus::parse(raw).ok_or_else(|| invalid_column(format!("task status {raw:?}")))
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|err| invalid_column(err.to_string()))
}

fn invalid_column(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    let prd: String = row.get("prd")?;
    let status: String = row.get("status")?;
    Ok(TaskRow {
        task_id: row.get("task_id")?,
        prd: parse_json(&prd)?,
        status: parse_status(&status)?,
        created_at: row.get("created_at")?,
        completed_at: row.get("completed_at")?,
        final_code: row.get("final_code")?,
    })
}

fn iteration_from_row(row: &Row<'_>) -> rusqlite::Result<IterationRecord> {
    let spec: String = row.get("spec")?;
    let outcome: String = row.get("test_result")?;
    let duration: i64 = row.get("duration_ms")?;
    Ok(IterationRecord {
        task_id: row.get("task_id")?,
        iteration: row.get("iteration")?,
        spec: parse_json(&spec)?,
        agent_output: row.get("agent_output")?,
        test_result: TestOutcome::parse(&outcome)
            .ok_or_else(|| invalid_column(format!("test result {outcome:?}")))?,
        error: row.get("error")?,
        duration_ms: u64::try_from(duration).unwrap_or_default(),
    })
}

fn playbook_from_row(row: &Row<'_>) -> rusqlite::Result<Playbook> {
    let errors: String = row.get("common_errors")?;
    Ok(Playbook {
        pattern: row.get("pattern")?,
        success_rate: row.get("success_rate")?,
        avg_iterations: row.get("avg_iterations")?,
        common_errors: parse_json(&errors)?,
        winning_spec_template: row.get("winning_spec_template")?,
        last_updated: row.get("last_updated")?,
    })
}

impl InteractionStore for SqliteStore {
    #[instrument(skip(self, prd))]
    fn record_task_started(&self, task_id: &str, prd: &PrdRequest, created_at: &str) -> Result<()> {
        let prd_json = serde_json::to_string(prd).context("serialize prd")?;
        self.lock()
            .execute(
                "INSERT INTO tasks (task_id, prd, status, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![task_id, prd_json, TaskStatus::InProgress.as_str(), created_at],
            )
            .with_context(|| format!("insert task {task_id}"))?;
        debug!("task row inserted");
        Ok(())
    }

    #[instrument(skip(self, status, final_code), fields(status = status.as_str()))]
    fn record_task_finished(
        &self,
        task_id: &str,
        status: TaskStatus,
        completed_at: &str,
        final_code: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(StoreConflict::NotTerminal {
                task_id: task_id.to_string(),
                status,
            }
            .into());
        }
        let mut conn = self.lock();
        let tx = conn.transaction().context("begin task update")?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("read task {task_id}"))?;
        let current = match current {
            None => {
                return Err(StoreConflict::UnknownTask {
                    task_id: task_id.to_string(),
                }
                .into());
            }
            Some(raw) => parse_status(&raw).with_context(|| format!("read task {task_id}"))?,
        };
        if current.is_terminal() {
            return Err(StoreConflict::TerminalTransition {
                task_id: task_id.to_string(),
                current,
            }
            .into());
        }
        tx.execute(
            "UPDATE tasks SET status = ?2, completed_at = ?3, final_code = ?4 WHERE task_id = ?1",
            params![task_id, status.as_str(), completed_at, final_code],
        )
        .with_context(|| format!("update task {task_id}"))?;
        tx.commit().context("commit task update")?;
        debug!("task finished");
        Ok(())
    }

    #[instrument(skip_all, fields(task_id = %record.task_id, iteration = record.iteration))]
    fn record_iteration(&self, record: &IterationRecord) -> Result<()> {
        let spec_json = serde_json::to_string(&record.spec).context("serialize spec snapshot")?;
        let mut conn = self.lock();
        let tx = conn.transaction().context("begin iteration insert")?;
        let last: Option<u32> = tx
            .query_row(
                "SELECT MAX(iteration) FROM task_iterations WHERE task_id = ?1",
                params![record.task_id],
                |row| row.get(0),
            )
            .context("read last iteration")?;
        let expected = last.unwrap_or(0) + 1;
        if record.iteration < expected {
            return Err(StoreConflict::DuplicateIteration {
                task_id: record.task_id.clone(),
                iteration: record.iteration,
            }
            .into());
        }
        if record.iteration > expected {
            return Err(StoreConflict::IterationGap {
                task_id: record.task_id.clone(),
                expected,
                got: record.iteration,
            }
            .into());
        }
        tx.execute(
            "INSERT INTO task_iterations
                (task_id, iteration, spec, agent_output, test_result, error, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.task_id,
                record.iteration,
                spec_json,
                record.agent_output,
                record.test_result.as_str(),
                record.error,
                i64::try_from(record.duration_ms).unwrap_or(i64::MAX),
            ],
        )
        .context("insert iteration")?;
        tx.commit().context("commit iteration")?;
        debug!("iteration recorded");
        Ok(())
    }

    fn task(&self, task_id: &str) -> Result<Option<TaskRow>> {
        self.lock()
            .query_row(
                "SELECT task_id, prd, status, created_at, completed_at, final_code
                 FROM tasks WHERE task_id = ?1",
                params![task_id],
                task_from_row,
            )
            .optional()
            .with_context(|| format!("read task {task_id}"))
    }

    fn iterations(&self, task_id: &str) -> Result<Vec<IterationRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT task_id, iteration, spec, agent_output, test_result, error, duration_ms
                 FROM task_iterations WHERE task_id = ?1 ORDER BY iteration",
            )
            .context("prepare iterations query")?;
        let rows = stmt
            .query_map(params![task_id], iteration_from_row)
            .context("query iterations")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("read iterations of {task_id}"))?;
        Ok(rows)
    }

    fn task_histories(&self) -> Result<Vec<TaskHistory>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT t.task_id, t.prd, t.status, t.created_at,
                        (SELECT COUNT(*) FROM task_iterations i WHERE i.task_id = t.task_id)
                            AS iterations,
                        (SELECT i.spec FROM task_iterations i WHERE i.task_id = t.task_id
                            ORDER BY i.iteration DESC LIMIT 1) AS final_spec
                 FROM tasks t ORDER BY t.created_at, t.task_id",
            )
            .context("prepare history query")?;
        let rows = stmt
            .query_map([], |row| {
                let prd: String = row.get("prd")?;
                let status: String = row.get("status")?;
                let final_spec: Option<String> = row.get("final_spec")?;
                Ok(TaskHistory {
                    task_id: row.get("task_id")?,
                    prd: parse_json(&prd)?,
                    status: parse_status(&status)?,
                    created_at: row.get("created_at")?,
                    iterations: row.get("iterations")?,
                    final_spec: final_spec
                        .as_deref()
                        .map(parse_json::<TaskSpec>)
                        .transpose()?,
                })
            })
            .context("query task history")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read task history")?;
        Ok(rows)
    }

    #[instrument(skip_all, fields(pattern = %playbook.pattern))]
    fn upsert_playbook(&self, playbook: &Playbook) -> Result<()> {
        let errors = serde_json::to_string(&playbook.common_errors).context("serialize errors")?;
        self.lock()
            .execute(
                "INSERT INTO playbooks
                    (pattern, success_rate, avg_iterations, common_errors,
                     winning_spec_template, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(pattern) DO UPDATE SET
                    success_rate = excluded.success_rate,
                    avg_iterations = excluded.avg_iterations,
                    common_errors = excluded.common_errors,
                    winning_spec_template = excluded.winning_spec_template,
                    last_updated = excluded.last_updated",
                params![
                    playbook.pattern,
                    playbook.success_rate,
                    playbook.avg_iterations,
                    errors,
                    playbook.winning_spec_template,
                    playbook.last_updated,
                ],
            )
            .with_context(|| format!("upsert playbook {}", playbook.pattern))?;
        Ok(())
    }

    fn playbooks(&self) -> Result<Vec<Playbook>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT pattern, success_rate, avg_iterations, common_errors,
                        winning_spec_template, last_updated
                 FROM playbooks ORDER BY pattern",
            )
            .context("prepare playbooks query")?;
        let rows = stmt
            .query_map([], playbook_from_row)
            .context("query playbooks")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read playbooks")?;
        Ok(rows)
    }
}
