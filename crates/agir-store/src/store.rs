use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use agir_core::error::{AgirError, Result};
use agir_core::process::{Node, ProcessDefinition, Role};
use agir_core::traits::Persistence;
use agir_core::types::{
    ConversationEntry, InstanceId, InstanceRecord, RunStatus, StepRecord, User,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        first_name TEXT,
        last_name TEXT,
        email TEXT,
        llm_model TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        profile TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS user_custom_fields (
        username TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (username, key)
    );

    CREATE TABLE IF NOT EXISTS processes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS process_instances (
        id TEXT PRIMARY KEY,
        process_id INTEGER NOT NULL REFERENCES processes(id),
        learner TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT
    );

    CREATE TABLE IF NOT EXISTS process_roles (
        instance_id TEXT NOT NULL REFERENCES process_instances(id),
        role_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        model TEXT,
        PRIMARY KEY (instance_id, role_id)
    );

    CREATE TABLE IF NOT EXISTS process_nodes (
        instance_id TEXT NOT NULL REFERENCES process_instances(id),
        node_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        role_id TEXT NOT NULL,
        assigned_to TEXT,
        PRIMARY KEY (instance_id, node_id)
    );

    CREATE TABLE IF NOT EXISTS process_instance_steps (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        instance_id TEXT NOT NULL REFERENCES process_instances(id),
        step_index INTEGER NOT NULL,
        node_id TEXT NOT NULL,
        role_id TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_steps_instance
        ON process_instance_steps(instance_id, step_index);
";

/// SQLite-backed user directory and run store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> AgirError {
    AgirError::Database(e.to_string())
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AgirError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Read a user custom field.
    pub fn custom_field(&self, username: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.query_row(
            "SELECT value FROM user_custom_fields WHERE username = ?1 AND key = ?2",
            params![username, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    /// Most recent instances, newest first.
    pub fn list_instances(&self, limit: usize) -> Result<Vec<InstanceRecord>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT i.id, p.name, i.learner, i.status, i.started_at, i.finished_at
                 FROM process_instances i JOIN processes p ON p.id = i.process_id
                 ORDER BY i.started_at DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], instance_columns)
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(instance_from_columns(row.map_err(db_err)?)?);
        }
        Ok(out)
    }
}

type InstanceColumns = (String, String, String, String, String, Option<String>);

fn instance_columns(row: &Row<'_>) -> rusqlite::Result<InstanceColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn instance_from_columns(cols: InstanceColumns) -> Result<InstanceRecord> {
    let (id, process_name, learner, status, started_at, finished_at) = cols;
    Ok(InstanceRecord {
        id: InstanceId(id),
        process_name,
        learner,
        status: status.parse()?,
        started_at: parse_ts(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(db_err)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<(User, String)> {
    let is_active: i64 = row.get(5)?;
    let profile: String = row.get(6)?;
    Ok((
        User {
            username: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            email: row.get(3)?,
            llm_model: row.get(4)?,
            is_active: is_active != 0,
            profile: serde_json::Map::new(),
        },
        profile,
    ))
}

fn finish_user((mut user, profile): (User, String)) -> Result<User> {
    user.profile = serde_json::from_str(&profile)?;
    Ok(user)
}

const USER_COLUMNS: &str =
    "username, first_name, last_name, email, llm_model, is_active, profile";

impl Persistence for SqliteStore {
    fn upsert_user(&self, user: &User) -> BoxFuture<'_, Result<()>> {
        let user = user.clone();

        Box::pin(async move {
            let profile = serde_json::to_string(&user.profile)?;
            let now = Utc::now().to_rfc3339();
            let conn = self.conn.lock().map_err(db_err)?;
            // Absent fields never erase what another source configured
            conn.execute(
                "INSERT INTO users (username, first_name, last_name, email, llm_model,
                                    is_active, profile, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(username) DO UPDATE SET
                    first_name = COALESCE(excluded.first_name, users.first_name),
                    last_name = COALESCE(excluded.last_name, users.last_name),
                    email = COALESCE(excluded.email, users.email),
                    llm_model = COALESCE(excluded.llm_model, users.llm_model),
                    is_active = excluded.is_active,
                    profile = CASE WHEN excluded.profile = '{}'
                                   THEN users.profile ELSE excluded.profile END,
                    updated_at = excluded.updated_at",
                params![
                    user.username,
                    user.first_name,
                    user.last_name,
                    user.email,
                    user.llm_model,
                    user.is_active as i64,
                    profile,
                    now,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn find_user(&self, username: &str) -> BoxFuture<'_, Result<Option<User>>> {
        let username = username.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
                    params![username],
                    user_from_row,
                )
                .optional()
                .map_err(db_err)?;
            row.map(finish_user).transpose()
        })
    }

    fn first_active_user_with_model(&self) -> BoxFuture<'_, Result<Option<User>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM users
                         WHERE is_active = 1 AND llm_model IS NOT NULL AND TRIM(llm_model) != ''
                         ORDER BY id LIMIT 1",
                        USER_COLUMNS
                    ),
                    [],
                    user_from_row,
                )
                .optional()
                .map_err(db_err)?;
            row.map(finish_user).transpose()
        })
    }

    fn create_instance(
        &self,
        process: &ProcessDefinition,
        learner: &str,
    ) -> BoxFuture<'_, Result<InstanceId>> {
        let name = process.name().to_string();
        let description = process.description().to_string();
        let learner = learner.to_string();

        Box::pin(async move {
            let id = InstanceId::new();
            let now = Utc::now().to_rfc3339();
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO processes (name, description, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET description = excluded.description",
                params![name, description, now],
            )
            .map_err(db_err)?;
            let process_id: i64 = conn
                .query_row(
                    "SELECT id FROM processes WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            conn.execute(
                "INSERT INTO process_instances (id, process_id, learner, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.0, process_id, learner, RunStatus::Running.as_str(), now],
            )
            .map_err(db_err)?;
            debug!(instance = %id, process = %name, "Instance created");
            Ok(id)
        })
    }

    fn materialize_roles(&self, id: &InstanceId, roles: &[Role]) -> BoxFuture<'_, Result<()>> {
        let id = id.0.clone();
        let roles = roles.to_vec();

        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            for role in &roles {
                tx.execute(
                    "INSERT INTO process_roles (instance_id, role_id, name, description, model)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, role.id, role.name, role.description, role.model],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(())
        })
    }

    fn materialize_nodes(&self, id: &InstanceId, nodes: &[Node]) -> BoxFuture<'_, Result<()>> {
        let id = id.0.clone();
        let nodes = nodes.to_vec();

        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            for (position, node) in nodes.iter().enumerate() {
                tx.execute(
                    "INSERT INTO process_nodes
                        (instance_id, node_id, position, name, description, role_id, assigned_to)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        id,
                        node.id,
                        position as i64,
                        node.name,
                        node.description,
                        node.role_id,
                        node.assigned_to
                    ],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(())
        })
    }

    fn record_step(
        &self,
        id: &InstanceId,
        step_index: usize,
        entry: &ConversationEntry,
    ) -> BoxFuture<'_, Result<()>> {
        let id = id.0.clone();
        let entry = entry.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO process_instance_steps
                    (instance_id, step_index, node_id, role_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    step_index as i64,
                    entry.node_id,
                    entry.role_id,
                    entry.content,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn finalize_instance(&self, id: &InstanceId, status: RunStatus) -> BoxFuture<'_, Result<()>> {
        let id = id.0.clone();

        Box::pin(async move {
            if !status.is_terminal() {
                return Err(AgirError::Database(format!(
                    "cannot finalize instance {} as {}",
                    id, status
                )));
            }
            let conn = self.conn.lock().map_err(db_err)?;
            let changed = conn
                .execute(
                    "UPDATE process_instances SET status = ?1, finished_at = ?2
                     WHERE id = ?3 AND status = 'RUNNING'",
                    params![status.as_str(), Utc::now().to_rfc3339(), id],
                )
                .map_err(db_err)?;
            if changed == 0 {
                let current: Option<String> = conn
                    .query_row(
                        "SELECT status FROM process_instances WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                return Err(match current {
                    Some(s) => AgirError::Database(format!("instance {} already {}", id, s)),
                    None => AgirError::Database(format!("unknown instance {}", id)),
                });
            }
            Ok(())
        })
    }

    fn load_instance(&self, id: &InstanceId) -> BoxFuture<'_, Result<Option<InstanceRecord>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let cols = conn
                .query_row(
                    "SELECT i.id, p.name, i.learner, i.status, i.started_at, i.finished_at
                     FROM process_instances i JOIN processes p ON p.id = i.process_id
                     WHERE i.id = ?1",
                    params![id],
                    instance_columns,
                )
                .optional()
                .map_err(db_err)?;
            cols.map(instance_from_columns).transpose()
        })
    }

    fn load_steps(&self, id: &InstanceId) -> BoxFuture<'_, Result<Vec<StepRecord>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT step_index, node_id, role_id, content, created_at
                     FROM process_instance_steps WHERE instance_id = ?1
                     ORDER BY step_index, id",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(db_err)?;

            let mut steps = Vec::new();
            for row in rows {
                let (step_index, node_id, role_id, content, created_at) = row.map_err(db_err)?;
                steps.push(StepRecord {
                    step_index: step_index as usize,
                    node_id,
                    role_id,
                    content,
                    created_at: parse_ts(&created_at)?,
                });
            }
            Ok(steps)
        })
    }

    fn save_custom_field(
        &self,
        username: &str,
        key: &str,
        value: &str,
    ) -> BoxFuture<'_, Result<()>> {
        let username = username.to_string();
        let key = key.to_string();
        let value = value.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO user_custom_fields (username, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(username, key) DO UPDATE SET
                    value = excluded.value, updated_at = excluded.updated_at",
                params![username, key, value, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }
}
