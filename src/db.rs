use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::models::{Task, TaskStatus, UserStat};

/// Database schema version.
///
/// Bump this when introducing a new migration.
const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("task {0} not found")]
    TaskNotFound(i64),

    #[error("illegal status transition for task {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("db schema version {found} is newer than this build supports ({supported})")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Database handle wrapper.
///
/// Notes:
/// - This uses `rusqlite::Connection`, which is not `Send`/`Sync`.
/// - The polling driver is the single writer; no internal locking is needed
///   beyond SQLite's own statement atomicity.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database file at `path` and apply migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;

        // pragmatic defaults for a long-running daemon:
        // - WAL for concurrent readers
        // - foreign keys ON
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&mut conn)?;
        info!("opened task store at {}", path.display());

        Ok(Self { conn })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // ------------------------------------------------------------------
    // Task operations
    // ------------------------------------------------------------------

    /// Insert a new task in `pending` state and return its assigned id.
    pub fn enqueue_task(&mut self, user_id: i64, url: &str) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            r#"
            INSERT INTO tasks (user_id, url, status, created_at, updated_at, file_path, error_message)
            VALUES (?1, ?2, ?3, ?4, ?4, NULL, NULL)
            "#,
            params![user_id, url, TaskStatus::Pending.as_str(), now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Retrieve a task by id.
    pub fn get_task(&mut self, id: i64) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, user_id, url, status, created_at, updated_at, file_path, error_message
                FROM tasks
                WHERE id = ?1
                "#,
                params![id],
                row_to_task,
            )
            .optional()?;
        Ok(row)
    }

    /// The oldest `pending` task (smallest `created_at`, ties broken by smallest id).
    pub fn next_pending_task(&mut self) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, user_id, url, status, created_at, updated_at, file_path, error_message
                FROM tasks
                WHERE status = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                "#,
                [],
                row_to_task,
            )
            .optional()?;
        Ok(row)
    }

    pub fn mark_downloading(&mut self, id: i64) -> Result<()> {
        self.transition(id, TaskStatus::Downloading, None, None)
    }

    pub fn mark_completed(&mut self, id: i64, file_path: &str) -> Result<()> {
        self.transition(id, TaskStatus::Completed, Some(file_path), None)
    }

    pub fn mark_failed(&mut self, id: i64, error_message: &str) -> Result<()> {
        self.transition(id, TaskStatus::Failed, None, Some(error_message))
    }

    pub fn mark_sent(&mut self, id: i64) -> Result<()> {
        self.transition(id, TaskStatus::Sent, None, None)
    }

    pub fn mark_notified(&mut self, id: i64) -> Result<()> {
        self.transition(id, TaskStatus::Notified, None, None)
    }

    /// Completed tasks not yet delivered, oldest `updated_at` first.
    pub fn completed_unsent(&mut self, limit: u32) -> Result<Vec<Task>> {
        self.tasks_in_status(TaskStatus::Completed, limit)
    }

    /// Failed tasks not yet notified, oldest `updated_at` first.
    pub fn failed_unnotified(&mut self, limit: u32) -> Result<Vec<Task>> {
        self.tasks_in_status(TaskStatus::Failed, limit)
    }

    /// Count tasks whose status is in `statuses`.
    pub fn count_by_status(&mut self, statuses: &[TaskStatus]) -> Result<u64> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!("SELECT COUNT(*) FROM tasks WHERE status IN ({placeholders})");
        let count: i64 = self.conn.query_row(
            &sql,
            params_from_iter(statuses.iter().map(|s| s.as_str())),
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    /// Fail any task left in `downloading` by a previous run.
    ///
    /// Called once at startup, before the first tick, to restore the
    /// at-most-one-downloading invariant after a crash.
    pub fn fail_stale_downloads(&mut self, reason: &str) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            r#"
            UPDATE tasks
            SET status = 'failed', error_message = ?1, updated_at = ?2
            WHERE status = 'downloading'
            "#,
            params![reason, now],
        )?;
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // User stats
    // ------------------------------------------------------------------

    pub fn get_user_stat(&mut self, user_id: i64) -> Result<Option<UserStat>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT user_id, downloads_count, last_request, requests_hour, last_hour_reset
                FROM user_stats
                WHERE user_id = ?1
                "#,
                params![user_id],
                row_to_user_stat,
            )
            .optional()?;
        Ok(row)
    }

    /// Insert or overwrite the stat row for `stat.user_id`.
    pub fn upsert_user_stat(&mut self, stat: &UserStat) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO user_stats (user_id, downloads_count, last_request, requests_hour, last_hour_reset)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(user_id) DO UPDATE SET
              downloads_count = excluded.downloads_count,
              last_request = excluded.last_request,
              requests_hour = excluded.requests_hour,
              last_hour_reset = excluded.last_hour_reset
            "#,
            params![
                stat.user_id,
                stat.downloads_count,
                stat.last_request.to_rfc3339(),
                stat.requests_hour,
                stat.last_hour_reset,
            ],
        )?;
        Ok(())
    }

    /// Bump the lifetime completed-download counter for a user.
    pub fn increment_downloads(&mut self, user_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE user_stats SET downloads_count = downloads_count + 1 WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Validated status transition. Sets `updated_at` and the payload field
    /// relevant to the target status; rejects any edge outside the allowed set.
    fn transition(
        &mut self,
        id: i64,
        to: TaskStatus,
        file_path: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let from: Option<String> = self
            .conn
            .query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .optional()?;
        let from = from.ok_or(DbError::TaskNotFound(id))?;
        let from = TaskStatus::from_str(&from).ok_or(rusqlite::Error::InvalidQuery)?;

        if !from.can_transition_to(to) {
            return Err(DbError::InvalidTransition { id, from, to });
        }

        let now = Utc::now().to_rfc3339();
        match to {
            TaskStatus::Completed => {
                self.conn.execute(
                    "UPDATE tasks SET status = ?2, file_path = ?3, updated_at = ?4 WHERE id = ?1",
                    params![id, to.as_str(), file_path, now],
                )?;
            }
            TaskStatus::Failed => {
                self.conn.execute(
                    "UPDATE tasks SET status = ?2, error_message = ?3, updated_at = ?4 WHERE id = ?1",
                    params![id, to.as_str(), error_message, now],
                )?;
            }
            _ => {
                self.conn.execute(
                    "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, to.as_str(), now],
                )?;
            }
        }
        Ok(())
    }

    fn tasks_in_status(&mut self, status: TaskStatus, limit: u32) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, url, status, created_at, updated_at, file_path, error_message
            FROM tasks
            WHERE status = ?1
            ORDER BY updated_at ASC, id ASC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![status.as_str(), limit], row_to_task)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(Task {
        id: row.get(0)?,
        user_id: row.get(1)?,
        url: row.get(2)?,
        status: TaskStatus::from_str(&status).ok_or(rusqlite::Error::InvalidQuery)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        file_path: row.get(6)?,
        error_message: row.get(7)?,
    })
}

fn row_to_user_stat(row: &Row) -> rusqlite::Result<UserStat> {
    let last_request: String = row.get(2)?;
    Ok(UserStat {
        user_id: row.get(0)?,
        downloads_count: row.get(1)?,
        last_request: parse_ts(&last_request)?,
        requests_hour: row.get(3)?,
        last_hour_reset: row.get(4)?,
    })
}

/// Apply migrations to bring the database to the current schema.
fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        "#,
    )?;

    let existing: Option<String> = conn
        .query_row(
            r#"SELECT value FROM meta WHERE key = 'schema_version'"#,
            [],
            |r| r.get(0),
        )
        .optional()?;

    let current_version: i64 = existing
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        return Err(DbError::SchemaTooNew {
            found: current_version,
            supported: SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        migration_v1(conn)?;
        set_schema_version(conn, 1)?;
    }

    // Future:
    // if current_version < 2 { migration_v2(conn)?; set_schema_version(conn, 2)?; }

    Ok(())
}

fn set_schema_version(conn: &mut Connection, v: i64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO meta(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![v.to_string()],
    )?;
    Ok(())
}

fn migration_v1(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          user_id INTEGER NOT NULL,
          url TEXT NOT NULL,
          status TEXT NOT NULL,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL,
          file_path TEXT NULL,
          error_message TEXT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);

        CREATE TABLE IF NOT EXISTS user_stats (
          user_id INTEGER PRIMARY KEY,
          downloads_count INTEGER NOT NULL DEFAULT 0,
          last_request TEXT NOT NULL,
          requests_hour INTEGER NOT NULL DEFAULT 0,
          last_hour_reset TEXT NOT NULL
        );
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Db {
        Db::open_in_memory().expect("in-memory db")
    }

    #[test]
    fn enqueue_assigns_monotonic_ids() {
        let mut db = db();
        let a = db.enqueue_task(1, "https://youtu.be/a").unwrap();
        let b = db.enqueue_task(1, "https://youtu.be/b").unwrap();
        assert!(b > a);

        let task = db.get_task(a).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.user_id, 1);
        assert_eq!(task.file_path, None);
        assert_eq!(task.error_message, None);
    }

    #[test]
    fn next_pending_is_oldest_with_id_tiebreak() {
        let mut db = db();
        let a = db.enqueue_task(1, "https://youtu.be/a").unwrap();
        let b = db.enqueue_task(2, "https://youtu.be/b").unwrap();

        // Force identical created_at so the id tie-break decides.
        db.conn()
            .execute(
                "UPDATE tasks SET created_at = '2026-01-01T00:00:00+00:00'",
                [],
            )
            .unwrap();

        let next = db.next_pending_task().unwrap().unwrap();
        assert_eq!(next.id, a);

        db.mark_downloading(a).unwrap();
        let next = db.next_pending_task().unwrap().unwrap();
        assert_eq!(next.id, b);
    }

    #[test]
    fn full_lifecycle_success_path() {
        let mut db = db();
        let id = db.enqueue_task(7, "https://youtu.be/x").unwrap();

        db.mark_downloading(id).unwrap();
        assert_eq!(db.count_by_status(&[TaskStatus::Downloading]).unwrap(), 1);

        db.mark_completed(id, "/tmp/task_1.mp4").unwrap();
        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.file_path.as_deref(), Some("/tmp/task_1.mp4"));

        db.mark_sent(id).unwrap();
        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Sent);
        // Payload survives the terminal transition.
        assert_eq!(task.file_path.as_deref(), Some("/tmp/task_1.mp4"));
    }

    #[test]
    fn full_lifecycle_failure_path() {
        let mut db = db();
        let id = db.enqueue_task(7, "https://youtu.be/x").unwrap();

        db.mark_downloading(id).unwrap();
        db.mark_failed(id, "timed out after 300s").unwrap();
        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("timed out after 300s"));
        assert_eq!(task.file_path, None);

        db.mark_notified(id).unwrap();
        assert_eq!(
            db.get_task(id).unwrap().unwrap().status,
            TaskStatus::Notified
        );
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut db = db();
        let id = db.enqueue_task(1, "https://youtu.be/x").unwrap();

        // pending -> completed skips downloading
        let err = db.mark_completed(id, "/tmp/x").unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition { .. }));

        db.mark_downloading(id).unwrap();
        db.mark_completed(id, "/tmp/x").unwrap();

        // completed -> notified is the wrong terminal edge
        let err = db.mark_notified(id).unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition { .. }));

        // task stays completed
        assert_eq!(
            db.get_task(id).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[test]
    fn missing_task_is_not_found() {
        let mut db = db();
        let err = db.mark_downloading(999).unwrap_err();
        assert!(matches!(err, DbError::TaskNotFound(999)));
    }

    #[test]
    fn unsent_lists_are_oldest_first() {
        let mut db = db();
        let a = db.enqueue_task(1, "https://youtu.be/a").unwrap();
        let b = db.enqueue_task(1, "https://youtu.be/b").unwrap();

        // Complete b first, then a: b has the older updated_at.
        for id in [b, a] {
            db.mark_downloading(id).unwrap();
            db.mark_completed(id, "/tmp/f").unwrap();
        }
        db.conn()
            .execute(
                "UPDATE tasks SET updated_at = '2026-01-01T00:00:01+00:00' WHERE id = ?1",
                params![a],
            )
            .unwrap();
        db.conn()
            .execute(
                "UPDATE tasks SET updated_at = '2026-01-01T00:00:00+00:00' WHERE id = ?1",
                params![b],
            )
            .unwrap();

        let unsent = db.completed_unsent(5).unwrap();
        assert_eq!(unsent.iter().map(|t| t.id).collect::<Vec<_>>(), vec![b, a]);

        let unsent = db.completed_unsent(1).unwrap();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].id, b);
    }

    #[test]
    fn count_by_status_set() {
        let mut db = db();
        let a = db.enqueue_task(1, "https://youtu.be/a").unwrap();
        db.enqueue_task(1, "https://youtu.be/b").unwrap();
        db.mark_downloading(a).unwrap();
        db.mark_failed(a, "boom").unwrap();

        assert_eq!(db.count_by_status(&[TaskStatus::Pending]).unwrap(), 1);
        assert_eq!(
            db.count_by_status(&[TaskStatus::Pending, TaskStatus::Failed])
                .unwrap(),
            2
        );
        assert_eq!(db.count_by_status(&[]).unwrap(), 0);
    }

    #[test]
    fn user_stats_roundtrip_and_increment() {
        let mut db = db();
        assert!(db.get_user_stat(42).unwrap().is_none());

        let stat = UserStat {
            user_id: 42,
            downloads_count: 0,
            last_request: Utc::now(),
            requests_hour: 1,
            last_hour_reset: "2026-08-06-14".to_string(),
        };
        db.upsert_user_stat(&stat).unwrap();

        let got = db.get_user_stat(42).unwrap().unwrap();
        assert_eq!(got.requests_hour, 1);
        assert_eq!(got.last_hour_reset, "2026-08-06-14");

        db.increment_downloads(42).unwrap();
        db.increment_downloads(42).unwrap();
        assert_eq!(db.get_user_stat(42).unwrap().unwrap().downloads_count, 2);
    }

    #[test]
    fn stale_downloads_are_failed_at_startup() {
        let mut db = db();
        let a = db.enqueue_task(1, "https://youtu.be/a").unwrap();
        let b = db.enqueue_task(1, "https://youtu.be/b").unwrap();
        db.mark_downloading(a).unwrap();

        let n = db.fail_stale_downloads("interrupted by restart").unwrap();
        assert_eq!(n, 1);

        let task = db.get_task(a).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("interrupted by restart"));
        assert_eq!(db.get_task(b).unwrap().unwrap().status, TaskStatus::Pending);
    }
}
