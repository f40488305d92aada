//! Task Store — persistent record of every task's status, progress,
//! branch, PR linkage, message history, and log transcript (spec.md §3,
//! §6). Backed by `rusqlite`, following `factory::db::FactoryDb`'s shape:
//! one `Connection`, a migration run on open, and a method per query.
//!
//! The teacher's root `Cargo.toml` lists `libsql` but `factory::db.rs`
//! itself imports `rusqlite` directly — see DESIGN.md for why this crate
//! follows the code (`rusqlite`, with the `bundled` feature, matching the
//! `forge-runtime` sub-crate's own `rusqlite = { version = "0.32",
//! features = ["bundled"] }` dependency) rather than the `Cargo.toml`
//! entry that is never actually exercised by the source.

pub mod handle;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::task::{
    AgentKind, Connector, ConnectorType, LogEntry, MessageRole, SandboxProviderKind, Task,
    TaskMessage, TaskStatus,
};

pub use handle::DbHandle;

pub struct TaskDb {
    conn: Connection,
}

impl TaskDb {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    repo_url TEXT NOT NULL,
                    selected_agent TEXT NOT NULL,
                    selected_model TEXT,
                    sandbox_provider TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    progress INTEGER NOT NULL DEFAULT 0,
                    branch_name TEXT,
                    existing_branch_name TEXT,
                    logs TEXT NOT NULL DEFAULT '[]',
                    sandbox_url TEXT,
                    pr_number INTEGER,
                    pr_url TEXT,
                    keep_alive INTEGER NOT NULL DEFAULT 0,
                    max_duration TEXT NOT NULL DEFAULT '30m',
                    mcp_server_ids TEXT NOT NULL DEFAULT '[]',
                    install_dependencies INTEGER NOT NULL DEFAULT 1,
                    current_sub_agent TEXT,
                    sub_agent_activity TEXT,
                    last_heartbeat TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                    deleted_at TEXT
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_user_branch
                    ON tasks(user_id, branch_name) WHERE branch_name IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_tasks_user_created
                    ON tasks(user_id, created_at);

                CREATE TABLE IF NOT EXISTS task_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
                );
                CREATE INDEX IF NOT EXISTS idx_task_messages_task ON task_messages(task_id);

                CREATE TABLE IF NOT EXISTS connectors (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    connector_type TEXT NOT NULL,
                    command TEXT,
                    url TEXT,
                    env_encrypted TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS keys (
                    user_id TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    value_encrypted TEXT NOT NULL,
                    PRIMARY KEY (user_id, provider)
                );

                CREATE TABLE IF NOT EXISTS api_tokens (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    token_hash TEXT NOT NULL,
                    token_prefix TEXT NOT NULL,
                    expires_at TEXT,
                    last_used_at TEXT
                );
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Task CRUD ─────────────────────────────────────────────────────

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tasks (
                    id, user_id, prompt, repo_url, selected_agent, selected_model,
                    sandbox_provider, status, progress, branch_name, existing_branch_name,
                    logs, keep_alive, max_duration, mcp_server_ids, install_dependencies,
                    created_at, updated_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
                params![
                    task.id,
                    task.user_id,
                    task.prompt,
                    task.repo_url,
                    task.selected_agent.as_str(),
                    task.selected_model,
                    task.sandbox_provider.as_str(),
                    task.status.as_str(),
                    task.progress,
                    task.branch_name,
                    task.existing_branch_name,
                    serde_json::to_string(&task.logs)?,
                    task.keep_alive as i64,
                    task.max_duration,
                    serde_json::to_string(&task.mcp_server_ids)?,
                    task.install_dependencies as i64,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert task")?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let mut stmt = self.conn.prepare(SELECT_TASK_COLUMNS)
            .context("Failed to prepare get_task")?;
        stmt.query_row(params![id], row_to_task)
            .optional()
            .context("Failed to query task")
    }

    /// Task status as of right now, for cheap cancellation probes — avoids
    /// deserializing the full log transcript on every stage boundary.
    pub fn get_task_status(&self, id: &str) -> Result<Option<TaskStatus>> {
        self.conn
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("Failed to query task status")?
            .map(|s| TaskStatus::from_str(&s).map_err(anyhow::Error::msg))
            .transpose()
    }

    pub fn set_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update task status")?;
        Ok(())
    }

    pub fn set_progress(&self, id: &str, progress: u8) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET progress = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?2",
                params![progress.min(100), id],
            )
            .context("Failed to update task progress")?;
        Ok(())
    }

    pub fn set_branch_name(&self, id: &str, branch_name: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET branch_name = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?2 AND branch_name IS NULL",
                params![branch_name, id],
            )
            .context("Failed to set branch name")?;
        Ok(())
    }

    pub fn set_sandbox_url(&self, id: &str, url: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET sandbox_url = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?2",
                params![url, id],
            )
            .context("Failed to set sandbox url")?;
        Ok(())
    }

    pub fn set_pr_info(&self, id: &str, pr_number: i64, pr_url: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET pr_number = ?1, pr_url = ?2, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?3",
                params![pr_number, pr_url, id],
            )
            .context("Failed to set PR info")?;
        Ok(())
    }

    pub fn set_sub_agent_telemetry(&self, id: &str, name: Option<&str>, activity: Option<&serde_json::Value>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET current_sub_agent = ?1, sub_agent_activity = ?2,
                 last_heartbeat = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?3",
                params![name, activity.map(|v| v.to_string()), id],
            )
            .context("Failed to update sub-agent telemetry")?;
        Ok(())
    }

    /// Overwrite the full log transcript. Callers (the Log Sink) are
    /// responsible for serializing entries in arrival order and for
    /// holding the per-task mutex that makes this read-modify-write safe
    /// under concurrent flushes.
    pub fn replace_logs(&self, id: &str, logs: &[LogEntry]) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET logs = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?2",
                params![serde_json::to_string(logs)?, id],
            )
            .context("Failed to replace logs")?;
        Ok(())
    }

    pub fn get_logs(&self, id: &str) -> Result<Vec<LogEntry>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT logs FROM tasks WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .context("Failed to query logs")?;
        match raw {
            Some(s) => Ok(serde_json::from_str(&s)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn soft_delete(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET deleted_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to soft delete task")?;
        Ok(())
    }

    /// Count of this user's non-soft-deleted tasks created within the
    /// trailing `window` — the Rate Limiter's sole query (spec.md §9).
    pub fn count_tasks_since(&self, user_id: &str, since: chrono::DateTime<chrono::Utc>) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE user_id = ?1 AND deleted_at IS NULL AND created_at > ?2",
                params![user_id, since.to_rfc3339()],
                |row| row.get(0),
            )
            .context("Failed to count tasks")
    }

    pub fn oldest_task_created_at(&self, user_id: &str, since: chrono::DateTime<chrono::Utc>) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT MIN(created_at) FROM tasks WHERE user_id = ?1 AND deleted_at IS NULL AND created_at > ?2",
                params![user_id, since.to_rfc3339()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query oldest task")?
            .flatten();
        raw.map(|s| chrono::DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&chrono::Utc)))
            .transpose()
            .context("Failed to parse oldest task timestamp")
    }

    /// Tasks still in `processing` whose last update is older than
    /// `max_age` — feeds the orphan-sandbox sweep (spec.md §4.5).
    pub fn stale_processing_tasks(&self, max_age: chrono::Duration) -> Result<Vec<Task>> {
        let cutoff = (chrono::Utc::now() - max_age).to_rfc3339();
        let sql = format!(
            "{} WHERE status = 'processing' AND updated_at < ?1",
            SELECT_TASK_COLUMNS.trim_end_matches(|_: char| false)
        );
        let sql = sql.replacen("SELECT", "SELECT", 1);
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare stale_processing_tasks")?;
        let rows = stmt
            .query_map(params![cutoff], row_to_task)
            .context("Failed to query stale tasks")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read task row")?);
        }
        Ok(out)
    }

    // ── Task messages ─────────────────────────────────────────────────

    pub fn insert_task_message(&self, task_id: &str, role: MessageRole, content: &str) -> Result<TaskMessage> {
        self.conn
            .execute(
                "INSERT INTO task_messages (task_id, role, content) VALUES (?1, ?2, ?3)",
                params![task_id, role.as_str(), content],
            )
            .context("Failed to insert task message")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, task_id, role, content, created_at FROM task_messages WHERE id = ?1",
                params![id],
                |row| {
                    let role: String = row.get(2)?;
                    Ok(TaskMessage {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        role: MessageRole::from_str(&role).unwrap_or(MessageRole::User),
                        content: row.get(3)?,
                        created_at: parse_dt(row.get::<_, String>(4)?),
                    })
                },
            )
            .context("Failed to read back task message")
    }

    pub fn list_task_messages(&self, task_id: &str) -> Result<Vec<TaskMessage>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, task_id, role, content, created_at FROM task_messages WHERE task_id = ?1 ORDER BY id")
            .context("Failed to prepare list_task_messages")?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                let role: String = row.get(2)?;
                Ok(TaskMessage {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    role: MessageRole::from_str(&role).unwrap_or(MessageRole::User),
                    content: row.get(3)?,
                    created_at: parse_dt(row.get::<_, String>(4)?),
                })
            })
            .context("Failed to query task messages")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read task message row")?);
        }
        Ok(out)
    }

    // ── Credential Store support ──────────────────────────────────────

    pub fn get_encrypted_key(&self, user_id: &str, provider: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value_encrypted FROM keys WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query encrypted key")
    }

    pub fn put_encrypted_key(&self, user_id: &str, provider: &str, value_encrypted: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO keys (user_id, provider, value_encrypted) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, provider) DO UPDATE SET value_encrypted = excluded.value_encrypted",
                params![user_id, provider, value_encrypted],
            )
            .context("Failed to upsert encrypted key")?;
        Ok(())
    }

    pub fn get_connector(&self, id: &str) -> Result<Option<Connector>> {
        self.conn
            .query_row(
                "SELECT id, user_id, name, connector_type, command, url, env_encrypted FROM connectors WHERE id = ?1",
                params![id],
                |row| {
                    let ct: String = row.get(3)?;
                    Ok(Connector {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        name: row.get(2)?,
                        connector_type: ConnectorType::from_str(&ct).unwrap_or(ConnectorType::Local),
                        command: row.get(4)?,
                        url: row.get(5)?,
                        env_encrypted: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query connector")
    }

    pub fn insert_connector(&self, connector: &Connector) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO connectors (id, user_id, name, connector_type, command, url, env_encrypted)
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    connector.id,
                    connector.user_id,
                    connector.name,
                    connector.connector_type.as_str(),
                    connector.command,
                    connector.url,
                    connector.env_encrypted,
                ],
            )
            .context("Failed to insert connector")?;
        Ok(())
    }

    pub fn count_tasks_for_user(&self, user_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE user_id = ?1 AND deleted_at IS NULL",
                params![user_id],
                |row| row.get(0),
            )
            .context("Failed to count tasks for user")
    }
}

const SELECT_TASK_COLUMNS: &str = "SELECT id, user_id, prompt, repo_url, selected_agent, selected_model,
    sandbox_provider, status, progress, branch_name, existing_branch_name, logs, sandbox_url,
    pr_number, pr_url, keep_alive, max_duration, mcp_server_ids, install_dependencies,
    current_sub_agent, sub_agent_activity, last_heartbeat, created_at, updated_at, deleted_at
    FROM tasks";

fn parse_dt(s: String) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let selected_agent: String = row.get(4)?;
    let sandbox_provider: String = row.get(6)?;
    let status: String = row.get(7)?;
    let logs: String = row.get(11)?;
    let mcp_server_ids: String = row.get(17)?;
    let sub_agent_activity: Option<String> = row.get(20)?;
    let last_heartbeat: Option<String> = row.get(21)?;
    let created_at: String = row.get(22)?;
    let updated_at: String = row.get(23)?;
    let deleted_at: Option<String> = row.get(24)?;

    Ok(Task {
        id: row.get(0)?,
        user_id: row.get(1)?,
        prompt: row.get(2)?,
        repo_url: row.get(3)?,
        selected_agent: AgentKind::from_str(&selected_agent).unwrap_or(AgentKind::Claude),
        selected_model: row.get(5)?,
        sandbox_provider: SandboxProviderKind::from_str(&sandbox_provider).unwrap_or(SandboxProviderKind::Docker),
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Error),
        progress: row.get::<_, i64>(8)? as u8,
        branch_name: row.get(9)?,
        existing_branch_name: row.get(10)?,
        logs: serde_json::from_str(&logs).unwrap_or_default(),
        sandbox_url: row.get(12)?,
        pr_number: row.get(13)?,
        pr_url: row.get(14)?,
        keep_alive: row.get::<_, i64>(15)? != 0,
        max_duration: row.get(16)?,
        mcp_server_ids: serde_json::from_str(&mcp_server_ids).unwrap_or_default(),
        install_dependencies: row.get::<_, i64>(18)? != 0,
        current_sub_agent: row.get(19)?,
        sub_agent_activity: sub_agent_activity.and_then(|s| serde_json::from_str(&s).ok()),
        last_heartbeat: last_heartbeat.map(parse_dt),
        created_at: parse_dt(created_at),
        updated_at: parse_dt(updated_at),
        deleted_at: deleted_at.map(parse_dt),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SandboxProviderKind;

    fn sample_task(id: &str, user_id: &str) -> Task {
        Task {
            id: id.into(),
            user_id: user_id.into(),
            prompt: "add a readme section".into(),
            repo_url: "https://example.com/acme/widgets".into(),
            selected_agent: AgentKind::Claude,
            selected_model: None,
            sandbox_provider: SandboxProviderKind::Vercel,
            status: TaskStatus::Pending,
            progress: 0,
            branch_name: None,
            existing_branch_name: None,
            logs: vec![],
            sandbox_url: None,
            pr_number: None,
            pr_url: None,
            keep_alive: false,
            max_duration: "30m".into(),
            mcp_server_ids: vec![],
            install_dependencies: true,
            current_sub_agent: None,
            sub_agent_activity: None,
            last_heartbeat: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn insert_and_get_round_trips() -> Result<()> {
        let db = TaskDb::new_in_memory()?;
        let task = sample_task("t1", "u1");
        db.insert_task(&task)?;
        let fetched = db.get_task("t1")?.expect("task should exist");
        assert_eq!(fetched.id, "t1");
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert_eq!(fetched.prompt, task.prompt);
        Ok(())
    }

    #[test]
    fn set_branch_name_is_set_once() -> Result<()> {
        let db = TaskDb::new_in_memory()?;
        db.insert_task(&sample_task("t1", "u1"))?;
        db.set_branch_name("t1", "feature/a-aaaaaa")?;
        db.set_branch_name("t1", "feature/b-bbbbbb")?;
        let task = db.get_task("t1")?.unwrap();
        assert_eq!(task.branch_name.as_deref(), Some("feature/a-aaaaaa"));
        Ok(())
    }

    #[test]
    fn unique_branch_per_user_is_enforced() -> Result<()> {
        let db = TaskDb::new_in_memory()?;
        let mut t1 = sample_task("t1", "u1");
        t1.branch_name = Some("feature/dup".into());
        db.insert_task(&t1)?;
        let mut t2 = sample_task("t2", "u1");
        t2.branch_name = Some("feature/dup".into());
        assert!(db.insert_task(&t2).is_err());
        Ok(())
    }

    #[test]
    fn soft_deleted_tasks_excluded_from_count() -> Result<()> {
        let db = TaskDb::new_in_memory()?;
        db.insert_task(&sample_task("t1", "u1"))?;
        db.insert_task(&sample_task("t2", "u1"))?;
        db.soft_delete("t1")?;
        assert_eq!(db.count_tasks_for_user("u1")?, 1);
        Ok(())
    }

    #[test]
    fn replace_logs_round_trips() -> Result<()> {
        let db = TaskDb::new_in_memory()?;
        db.insert_task(&sample_task("t1", "u1"))?;
        let logs = vec![LogEntry::new(crate::task::LogEntryType::Info, "hello")];
        db.replace_logs("t1", &logs)?;
        let fetched = db.get_logs("t1")?;
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].message, "hello");
        Ok(())
    }

    #[test]
    fn task_messages_append_in_order() -> Result<()> {
        let db = TaskDb::new_in_memory()?;
        db.insert_task(&sample_task("t1", "u1"))?;
        db.insert_task_message("t1", MessageRole::User, "also add logging")?;
        db.insert_task_message("t1", MessageRole::Agent, "done")?;
        let messages = db.list_task_messages("t1")?;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Agent);
        Ok(())
    }

    #[test]
    fn encrypted_key_upsert_overwrites() -> Result<()> {
        let db = TaskDb::new_in_memory()?;
        db.put_encrypted_key("u1", "claude", "v1")?;
        db.put_encrypted_key("u1", "claude", "v2")?;
        assert_eq!(db.get_encrypted_key("u1", "claude")?.as_deref(), Some("v2"));
        Ok(())
    }
}
