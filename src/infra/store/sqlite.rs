//! SQLite-backed task store.
//!
//! One `Connection` behind a `parking_lot::Mutex`: every call holds the lock
//! for the duration of a single statement or transaction, which gives the
//! single-writer serialisation `claim` relies on. Timestamps are stored as
//! epoch milliseconds.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{zeroed_counts, TaskStore};
use crate::core::{
    CancelOutcome, DaemonError, NewTask, RecurringRule, Task, TaskContext, TaskId, TaskStatus,
    TranscriptEntry, TranscriptKind, ValidatedTask,
};
use crate::util::clock::{from_millis, now, to_millis};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS tasks (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    title            TEXT NOT NULL,
    description      TEXT NOT NULL DEFAULT '',
    status           TEXT NOT NULL DEFAULT 'pending'
                     CHECK (status IN ('pending', 'in_progress', 'completed', 'failed', 'cancelled')),
    priority         INTEGER NOT NULL DEFAULT 5,
    due_at_ms        INTEGER,
    recurring_rule   TEXT,
    result           TEXT,
    error            TEXT,
    context          TEXT NOT NULL DEFAULT '{}',
    created_at_ms    INTEGER NOT NULL,
    updated_at_ms    INTEGER NOT NULL,
    started_at_ms    INTEGER,
    finished_at_ms   INTEGER,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    successor_id     INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (status, priority DESC, due_at_ms);

CREATE TABLE IF NOT EXISTS task_transcript (
    task_id       INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    seq           INTEGER NOT NULL,
    kind          TEXT NOT NULL,
    content       TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    PRIMARY KEY (task_id, seq)
);
";

const TASK_COLUMNS: &str = "id, title, description, status, priority, due_at_ms, recurring_rule, \
     result, error, context, created_at_ms, updated_at_ms, started_at_ms, finished_at_ms, \
     cancel_requested, successor_id";

/// Task store persisted in a SQLite database file.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DaemonError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DaemonError::StoreCorrupt(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, for tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self, DaemonError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DaemonError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("sqlite task store ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(conn: &Connection, task: &ValidatedTask, at: DateTime<Utc>) -> Result<TaskId, DaemonError> {
        let context = serde_json::to_string(&task.context)
            .map_err(|e| DaemonError::InvalidTask(format!("context not serialisable: {e}")))?;
        let at_ms = to_millis(at);
        conn.execute(
            "INSERT INTO tasks (title, description, status, priority, due_at_ms, recurring_rule, \
             context, created_at_ms, updated_at_ms) \
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                task.title,
                task.description,
                task.priority,
                task.due_at.map(to_millis),
                task.recurring_rule.map(|r| r.to_string()),
                context,
                at_ms,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn fetch(conn: &Connection, id: TaskId) -> Result<Option<Task>, DaemonError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], row_to_task).optional()?)
    }

    fn query_tasks(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Task>, DaemonError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    fn finish(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, DaemonError> {
        let conn = self.conn.lock();
        let at_ms = to_millis(now());
        let changed = conn.execute(
            "UPDATE tasks SET status = ?2, result = ?3, error = ?4, finished_at_ms = ?5, \
             updated_at_ms = ?5 \
             WHERE id = ?1 AND status IN ('pending', 'in_progress')",
            params![id, status, result, error, at_ms],
        )?;
        Ok(changed == 1)
    }
}

impl TaskStore for SqliteTaskStore {
    fn add(&self, task: NewTask) -> Result<TaskId, DaemonError> {
        let task = task.validate()?;
        let conn = self.conn.lock();
        let id = Self::insert(&conn, &task, now())?;
        tracing::debug!(task_id = id, title = %task.title, "task added");
        Ok(id)
    }

    fn get(&self, id: TaskId) -> Result<Option<Task>, DaemonError> {
        let conn = self.conn.lock();
        Self::fetch(&conn, id)
    }

    fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>, DaemonError> {
        let conn = self.conn.lock();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        match status {
            Some(status) => Self::query_tasks(
                &conn,
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY id DESC LIMIT ?2"),
                params![status, limit],
            ),
            None => Self::query_tasks(
                &conn,
                &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id DESC LIMIT ?1"),
                params![limit],
            ),
        }
    }

    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DaemonError> {
        let conn = self.conn.lock();
        // NULL due dates sort first under ASC in SQLite.
        Self::query_tasks(
            &conn,
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE status = 'pending' AND (due_at_ms IS NULL OR due_at_ms <= ?1) \
                 ORDER BY priority DESC, due_at_ms ASC, id ASC"
            ),
            params![to_millis(now)],
        )
    }

    fn list_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DaemonError> {
        let conn = self.conn.lock();
        Self::query_tasks(
            &conn,
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE status = 'pending' AND due_at_ms > ?1 \
                 ORDER BY due_at_ms ASC, id ASC"
            ),
            params![to_millis(now)],
        )
    }

    fn claim(&self, id: TaskId) -> Result<bool, DaemonError> {
        let conn = self.conn.lock();
        let at_ms = to_millis(now());
        let changed = conn.execute(
            "UPDATE tasks SET status = 'in_progress', started_at_ms = ?2, updated_at_ms = ?2 \
             WHERE id = ?1 AND status = 'pending'",
            params![id, at_ms],
        )?;
        Ok(changed == 1)
    }

    fn complete(&self, id: TaskId, result: &str) -> Result<bool, DaemonError> {
        self.finish(id, TaskStatus::Completed, Some(result), None)
    }

    fn fail(&self, id: TaskId, error: &str) -> Result<bool, DaemonError> {
        self.finish(id, TaskStatus::Failed, None, Some(error))
    }

    fn cancel(&self, id: TaskId) -> Result<CancelOutcome, DaemonError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let status: Option<TaskStatus> = tx
            .query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        let at_ms = to_millis(now());
        let outcome = match status {
            None => return Err(DaemonError::NotFound(id)),
            Some(TaskStatus::Pending) => {
                tx.execute(
                    "UPDATE tasks SET status = 'cancelled', error = 'cancelled before start', \
                     finished_at_ms = ?2, updated_at_ms = ?2 WHERE id = ?1",
                    params![id, at_ms],
                )?;
                CancelOutcome::Cancelled
            }
            Some(TaskStatus::InProgress) => {
                tx.execute(
                    "UPDATE tasks SET cancel_requested = 1, updated_at_ms = ?2 WHERE id = ?1",
                    params![id, at_ms],
                )?;
                CancelOutcome::Signalled
            }
            Some(other) => CancelOutcome::NotCancellable(other),
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn mark_cancelled(&self, id: TaskId, note: &str) -> Result<bool, DaemonError> {
        self.finish(id, TaskStatus::Cancelled, None, Some(note))
    }

    fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, DaemonError> {
        let conn = self.conn.lock();
        let ms: Option<i64> = conn.query_row(
            "SELECT MIN(COALESCE(due_at_ms, created_at_ms)) FROM tasks WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(ms.map(from_millis))
    }

    fn reschedule_recurring(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, DaemonError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let task = Self::fetch(&tx, id)?.ok_or(DaemonError::NotFound(id))?;
        let Some(rule) = task.recurring_rule else {
            return Ok(None);
        };
        let finished = matches!(task.status, TaskStatus::Completed | TaskStatus::Failed);
        if !finished || task.cancel_requested || task.successor_id.is_some() {
            return Ok(None);
        }
        let successor = ValidatedTask::successor_of(&task, rule.next_occurrence(now));
        let successor_id = Self::insert(&tx, &successor, now)?;
        tx.execute(
            "UPDATE tasks SET successor_id = ?2 WHERE id = ?1",
            params![id, successor_id],
        )?;
        let created = Self::fetch(&tx, successor_id)?;
        tx.commit()?;
        tracing::info!(
            task_id = id,
            successor_id,
            rule = %rule,
            "recurring task rescheduled"
        );
        Ok(created)
    }

    fn counts_by_status(&self) -> Result<BTreeMap<TaskStatus, u64>, DaemonError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, TaskStatus>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = zeroed_counts();
        for row in rows {
            let (status, n) = row?;
            counts.insert(status, u64::try_from(n).unwrap_or_default());
        }
        Ok(counts)
    }

    fn append_transcript(
        &self,
        id: TaskId,
        kind: TranscriptKind,
        content: &str,
    ) -> Result<(), DaemonError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO task_transcript (task_id, seq, kind, content, created_at_ms) \
             SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3, ?4 \
             FROM task_transcript WHERE task_id = ?1",
            params![id, kind.as_str(), content, to_millis(now())],
        )?;
        Ok(())
    }

    fn transcript(&self, id: TaskId) -> Result<Vec<TranscriptEntry>, DaemonError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, kind, content, created_at_ms FROM task_transcript \
             WHERE task_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(TranscriptEntry {
                seq: row.get(0)?,
                kind: parse_column(row, 1)?,
                content: row.get(2)?,
                created_at: from_millis(row.get(3)?),
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn recover_interrupted(&self, note: &str) -> Result<Vec<TaskId>, DaemonError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare("SELECT id FROM tasks WHERE status = 'in_progress'")?;
            let rows = stmt.query_map([], |row| row.get::<_, TaskId>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let at_ms = to_millis(now());
        tx.execute(
            "UPDATE tasks SET status = 'failed', error = ?1, finished_at_ms = ?2, updated_at_ms = ?2 \
             WHERE status = 'in_progress'",
            params![note, at_ms],
        )?;
        tx.commit()?;
        Ok(ids)
    }
}

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: DaemonError| FromSqlError::Other(Box::new(e)))
    }
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = DaemonError>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let recurring_rule = row
        .get::<_, Option<String>>(6)?
        .map(|text| RecurringRule::from_str(&text))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    let context_text: String = row.get(9)?;
    let context: TaskContext = serde_json::from_str(&context_text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        due_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
        recurring_rule,
        result: row.get(7)?,
        error: row.get(8)?,
        context,
        created_at: from_millis(row.get(10)?),
        updated_at: from_millis(row.get(11)?),
        started_at: row.get::<_, Option<i64>>(12)?.map(from_millis),
        finished_at: row.get::<_, Option<i64>>(13)?.map(from_millis),
        cancel_requested: row.get(14)?,
        successor_id: row.get(15)?,
    })
}
