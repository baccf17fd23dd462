use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the control-plane database.
///
/// Wraps `MasterDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<MasterDb>>,
}

impl DbHandle {
    pub fn new(db: MasterDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&MasterDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, MasterDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct MasterDb {
    conn: Connection,
}

impl MasterDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS operators (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE,
                    name TEXT,
                    role TEXT NOT NULL DEFAULT 'master',
                    password_hash TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS plan_links (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo TEXT NOT NULL,
                    plan_path TEXT NOT NULL,
                    title TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(repo, plan_path)
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    repo TEXT NOT NULL,
                    model TEXT NOT NULL,
                    plan_path TEXT NOT NULL,
                    prompt_preview TEXT NOT NULL DEFAULT '',
                    timeout_ms INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    exit_code INTEGER,
                    user_id INTEGER,
                    started_at TEXT NOT NULL DEFAULT (datetime('now')),
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS audit_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER,
                    path TEXT NOT NULL,
                    method TEXT NOT NULL,
                    ip TEXT NOT NULL,
                    status INTEGER NOT NULL,
                    meta TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_plan_links_repo ON plan_links(repo);
                CREATE INDEX IF NOT EXISTS idx_tasks_started ON tasks(started_at);
                CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Operators ─────────────────────────────────────────────────────

    pub fn create_operator(
        &self,
        email: &str,
        name: Option<&str>,
        role: Role,
        password_hash: &str,
    ) -> Result<Operator> {
        self.conn
            .execute(
                "INSERT INTO operators (email, name, role, password_hash) VALUES (?1, ?2, ?3, ?4)",
                params![email, name, role.as_str(), password_hash],
            )
            .context("Failed to insert operator")?;
        let id = self.conn.last_insert_rowid();
        self.get_operator(id)?
            .context("Operator not found after insert")
    }

    pub fn get_operator(&self, id: i64) -> Result<Option<Operator>> {
        self.query_operator("WHERE id = ?1", params![id])
    }

    pub fn find_operator_by_email(&self, email: &str) -> Result<Option<Operator>> {
        self.query_operator("WHERE email = ?1 COLLATE NOCASE", params![email.trim()])
    }

    fn query_operator(&self, filter: &str, args: impl rusqlite::Params) -> Result<Option<Operator>> {
        let sql = format!(
            "SELECT id, email, name, role, password_hash FROM operators {}",
            filter
        );
        let row = self
            .conn
            .query_row(&sql, args, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .optional()
            .context("Failed to query operator")?;
        match row {
            Some((id, email, name, role, password_hash)) => Ok(Some(Operator {
                id,
                email,
                name,
                role: Role::from_str(&role).map_err(|e| anyhow::anyhow!(e))?,
                password_hash,
            })),
            None => Ok(None),
        }
    }

    // ── Plan links ────────────────────────────────────────────────────

    /// Record that `plan_path` is linked to `repo`. Re-linking returns the existing row.
    pub fn link_plan(&self, repo: &str, plan_path: &str, title: Option<&str>) -> Result<PlanLink> {
        self.conn
            .execute(
                "INSERT INTO plan_links (repo, plan_path, title) VALUES (?1, ?2, ?3)
                 ON CONFLICT(repo, plan_path) DO NOTHING",
                params![repo, plan_path, title],
            )
            .context("Failed to insert plan link")?;
        self.get_plan_link(repo, plan_path)?
            .context("Plan link not found after insert")
    }

    pub fn get_plan_link(&self, repo: &str, plan_path: &str) -> Result<Option<PlanLink>> {
        self.conn
            .query_row(
                "SELECT id, repo, plan_path, title, created_at FROM plan_links
                 WHERE repo = ?1 AND plan_path = ?2",
                params![repo, plan_path],
                row_to_plan_link,
            )
            .optional()
            .context("Failed to query plan link")
    }

    pub fn list_plan_links(&self, repo: Option<&str>) -> Result<Vec<PlanLink>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, repo, plan_path, title, created_at FROM plan_links
                 WHERE ?1 IS NULL OR repo = ?1 ORDER BY id DESC",
            )
            .context("Failed to prepare list_plan_links")?;
        let rows = stmt
            .query_map(params![repo], row_to_plan_link)
            .context("Failed to query plan links")?;
        let mut links = Vec::new();
        for row in rows {
            links.push(row.context("Failed to read plan link row")?);
        }
        Ok(links)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn insert_task(&self, spec: &TaskSpec, user_id: Option<i64>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tasks (id, repo, model, plan_path, prompt_preview, timeout_ms, status, user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'running', ?7)",
                params![
                    spec.id,
                    spec.repo,
                    spec.model.as_str(),
                    spec.plan_path,
                    preview(&spec.prompt, 200),
                    spec.timeout_ms as i64,
                    user_id,
                ],
            )
            .context("Failed to insert task")?;
        Ok(())
    }

    pub fn finish_task(&self, id: &str, status: TaskStatus, exit_code: Option<i32>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET status = ?1, exit_code = ?2, finished_at = datetime('now')
                 WHERE id = ?3",
                params![status.as_str(), exit_code, id],
            )
            .context("Failed to update task status")?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        self.conn
            .query_row(
                "SELECT id, repo, model, plan_path, prompt_preview, timeout_ms, status, exit_code,
                        user_id, started_at, finished_at
                 FROM tasks WHERE id = ?1",
                params![id],
                row_to_task,
            )
            .optional()
            .context("Failed to query task")
    }

    pub fn list_tasks(&self, limit: i64) -> Result<Vec<TaskRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, repo, model, plan_path, prompt_preview, timeout_ms, status, exit_code,
                        user_id, started_at, finished_at
                 FROM tasks ORDER BY started_at DESC, rowid DESC LIMIT ?1",
            )
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(params![limit], row_to_task)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?);
        }
        Ok(tasks)
    }

    // ── Audit log ─────────────────────────────────────────────────────

    pub fn insert_audit(
        &self,
        user_id: Option<i64>,
        path: &str,
        method: &str,
        ip: &str,
        status: u16,
        meta: &serde_json::Value,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO audit_log (user_id, path, method, ip, status, meta)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![user_id, path, method, ip, status, meta.to_string()],
            )
            .context("Failed to insert audit entry")?;
        Ok(())
    }

    pub fn list_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT user_id, path, method, ip, status, meta, created_at
                 FROM audit_log ORDER BY id DESC LIMIT ?1",
            )
            .context("Failed to prepare list_audit")?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let meta: String = row.get(5)?;
                Ok(AuditEntry {
                    user_id: row.get(0)?,
                    path: row.get(1)?,
                    method: row.get(2)?,
                    ip: row.get(3)?,
                    status: row.get(4)?,
                    meta: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query audit log")?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("Failed to read audit row")?);
        }
        Ok(entries)
    }
}

fn row_to_plan_link(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanLink> {
    Ok(PlanLink {
        id: row.get(0)?,
        repo: row.get(1)?,
        plan_path: row.get(2)?,
        title: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status: String = row.get(6)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        repo: row.get(1)?,
        model: row.get(2)?,
        plan_path: row.get(3)?,
        prompt_preview: row.get(4)?,
        timeout_ms: row.get(5)?,
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Failed),
        exit_code: row.get(7)?,
        user_id: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
    })
}
