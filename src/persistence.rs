//! The `Store` trait boundary: all SQL in this crate lives behind it, per
//! the persistence-coupling design note. [`SqliteStore`] is the one
//! concrete adapter, backed by an embedded SQLite file so the crate runs
//! standalone without an external database process.

use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::packet::Language;
use crate::store::{Agent, Tasking};

/// A node in the per-agent observed-filesystem forest (`TASK_DIR_LIST`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDirectoryEntry {
    pub id: i64,
    pub session_id: String,
    pub parent_id: Option<i64>,
    pub name: String,
    pub path: String,
    pub is_file: bool,
}

/// At most one row: the global autorun command enqueued on every agent's
/// first STAGE2 activation.
#[derive(Debug, Clone, Default)]
pub struct GlobalConfigRow {
    pub autorun_command: String,
    pub autorun_data: String,
}

/// Everything the persistence layer needs to know about one queued task,
/// independent of the in-memory [`Tasking`] kept on the agent row.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: u16,
    pub agent: String,
    pub user_id: i64,
    pub name: u16,
    pub body: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub module_name: Option<String>,
}

pub trait Store: Send + Sync {
    fn upsert_agent(&self, agent: &Agent) -> Result<()>;
    fn delete_agent(&self, session_id: &str) -> Result<()>;
    fn delete_all_agents(&self) -> Result<()>;
    fn load_all_agents(&self) -> Result<Vec<Agent>>;

    fn insert_task(&self, task: &TaskRow) -> Result<()>;
    fn insert_blank_result(&self, agent: &str, id: u16, user_id: i64) -> Result<()>;
    fn append_result_data(&self, agent: &str, id: u16, text: &str) -> Result<()>;
    fn max_task_id(&self, agent: &str) -> Result<Option<u16>>;
    fn mark_tasks_drained(&self, agent: &str, ids: &[u16]) -> Result<()>;
    fn task_module_name(&self, agent: &str, id: u16) -> Result<Option<String>>;

    fn replace_directory_children(
        &self,
        session_id: &str,
        parent_path: &str,
        parent_name: &str,
        entries: &[FileDirectoryEntry],
    ) -> Result<()>;
    fn directory_children(&self, session_id: &str, parent_path: &str) -> Result<Vec<FileDirectoryEntry>>;

    fn get_global_config(&self) -> Result<GlobalConfigRow>;
    fn set_global_config(&self, cfg: &GlobalConfigRow) -> Result<()>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agents (
    session_id TEXT PRIMARY KEY,
    name TEXT UNIQUE NOT NULL,
    language TEXT NOT NULL,
    language_version TEXT NOT NULL DEFAULT '',
    session_key BLOB NOT NULL,
    staging_key BLOB NOT NULL,
    nonce TEXT NOT NULL,
    delay INTEGER NOT NULL DEFAULT 0,
    jitter REAL NOT NULL DEFAULT 0,
    lost_limit INTEGER NOT NULL DEFAULT 0,
    kill_date TEXT NOT NULL DEFAULT '',
    working_hours TEXT NOT NULL DEFAULT '',
    profile TEXT NOT NULL DEFAULT '',
    external_ip TEXT NOT NULL DEFAULT '',
    internal_ip TEXT NOT NULL DEFAULT '',
    hostname TEXT NOT NULL DEFAULT '',
    username TEXT NOT NULL DEFAULT '',
    os_details TEXT NOT NULL DEFAULT '',
    high_integrity INTEGER NOT NULL DEFAULT 0,
    process_name TEXT NOT NULL DEFAULT '',
    process_id INTEGER NOT NULL DEFAULT 0,
    listener TEXT NOT NULL DEFAULT '',
    checkin_time TEXT NOT NULL,
    lastseen_time TEXT NOT NULL,
    results TEXT NOT NULL DEFAULT '',
    functions TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS taskings (
    id INTEGER NOT NULL,
    agent TEXT NOT NULL,
    data BLOB NOT NULL,
    name INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    module_name TEXT,
    drained_at TEXT,
    PRIMARY KEY (id, agent)
);
CREATE TABLE IF NOT EXISTS results (
    id INTEGER NOT NULL,
    agent TEXT NOT NULL,
    user_id INTEGER NOT NULL DEFAULT 0,
    data TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (id, agent)
);
CREATE TABLE IF NOT EXISTS file_directory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    parent_id INTEGER REFERENCES file_directory(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    is_file INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS config (
    autorun_command TEXT NOT NULL DEFAULT '',
    autorun_data TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    last_logon_time TEXT
);
";

impl SqliteStore {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection mutex poisoned")
    }
}

fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn from_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).single().unwrap())
}

impl Store for SqliteStore {
    fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO agents (
                session_id, name, language, language_version, session_key, staging_key,
                nonce, delay, jitter, lost_limit, kill_date, working_hours, profile,
                external_ip, internal_ip, hostname, username, os_details, high_integrity,
                process_name, process_id, listener, checkin_time, lastseen_time, results, functions
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26)
            ON CONFLICT(session_id) DO UPDATE SET
                name=excluded.name, language=excluded.language, language_version=excluded.language_version,
                session_key=excluded.session_key, staging_key=excluded.staging_key, nonce=excluded.nonce,
                delay=excluded.delay, jitter=excluded.jitter, lost_limit=excluded.lost_limit,
                kill_date=excluded.kill_date, working_hours=excluded.working_hours, profile=excluded.profile,
                external_ip=excluded.external_ip, internal_ip=excluded.internal_ip, hostname=excluded.hostname,
                username=excluded.username, os_details=excluded.os_details, high_integrity=excluded.high_integrity,
                process_name=excluded.process_name, process_id=excluded.process_id, listener=excluded.listener,
                checkin_time=excluded.checkin_time, lastseen_time=excluded.lastseen_time,
                results=excluded.results, functions=excluded.functions",
            params![
                agent.session_id,
                agent.name,
                agent.language.as_str(),
                agent.language_version,
                agent.session_key,
                agent.staging_key,
                agent.nonce,
                agent.delay,
                agent.jitter,
                agent.lost_limit,
                agent.kill_date,
                agent.working_hours,
                agent.profile,
                agent.external_ip,
                agent.internal_ip,
                agent.hostname,
                agent.username,
                agent.os_details,
                agent.high_integrity as i64,
                agent.process_name,
                agent.process_id,
                agent.listener,
                to_rfc3339(agent.checkin_time),
                to_rfc3339(agent.lastseen_time),
                agent.results,
                agent.functions.join(","),
            ],
        )?;
        Ok(())
    }

    fn delete_agent(&self, session_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM agents WHERE session_id = ?1", params![session_id])?;
        conn.execute("DELETE FROM taskings WHERE agent = ?1", params![session_id])?;
        conn.execute("DELETE FROM results WHERE agent = ?1", params![session_id])?;
        conn.execute(
            "DELETE FROM file_directory WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    fn delete_all_agents(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "DELETE FROM agents; DELETE FROM taskings; DELETE FROM results; DELETE FROM file_directory;",
        )?;
        Ok(())
    }

    fn load_all_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT session_id, name, language, language_version, session_key, staging_key, nonce, delay, jitter, lost_limit, kill_date, working_hours, profile, external_ip, internal_ip, hostname, username, os_details, high_integrity, process_name, process_id, listener, checkin_time, lastseen_time, results, functions FROM agents")?;
        let rows = stmt.query_map([], |row| {
            let language_str: String = row.get(2)?;
            let checkin: String = row.get(22)?;
            let lastseen: String = row.get(23)?;
            let functions: String = row.get(25)?;
            Ok(Agent {
                session_id: row.get(0)?,
                name: row.get(1)?,
                language: Language::parse_str(&language_str).unwrap_or(Language::Powershell),
                language_version: row.get(3)?,
                session_key: row.get(4)?,
                staging_key: row.get(5)?,
                nonce: row.get(6)?,
                delay: row.get(7)?,
                jitter: row.get(8)?,
                lost_limit: row.get(9)?,
                kill_date: row.get(10)?,
                working_hours: row.get(11)?,
                profile: row.get(12)?,
                external_ip: row.get(13)?,
                internal_ip: row.get(14)?,
                hostname: row.get(15)?,
                username: row.get(16)?,
                os_details: row.get(17)?,
                high_integrity: row.get::<_, i64>(18)? != 0,
                process_name: row.get(19)?,
                process_id: row.get(20)?,
                listener: row.get(21)?,
                checkin_time: from_rfc3339(&checkin),
                lastseen_time: from_rfc3339(&lastseen),
                taskings: Vec::new(),
                results: row.get(24)?,
                functions: if functions.is_empty() {
                    Vec::new()
                } else {
                    functions.split(',').map(str::to_string).collect()
                },
            })
        })?;
        let mut agents = Vec::new();
        for row in rows {
            let mut agent = row?;
            agent.taskings = self.load_pending_taskings(&agent.session_id)?;
            agents.push(agent);
        }
        Ok(agents)
    }

    fn insert_task(&self, task: &TaskRow) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO taskings (id, agent, data, name, user_id, timestamp, module_name, drained_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)
             ON CONFLICT(id, agent) DO UPDATE SET
                data=excluded.data, name=excluded.name, user_id=excluded.user_id,
                timestamp=excluded.timestamp, module_name=excluded.module_name, drained_at=NULL",
            params![
                task.id,
                task.agent,
                task.body,
                task.name,
                task.user_id,
                to_rfc3339(task.timestamp),
                task.module_name,
            ],
        )?;
        Ok(())
    }

    fn insert_blank_result(&self, agent: &str, id: u16, user_id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO results (id, agent, user_id, data) VALUES (?1, ?2, ?3, '')
             ON CONFLICT(id, agent) DO NOTHING",
            params![id, agent, user_id],
        )?;
        Ok(())
    }

    fn append_result_data(&self, agent: &str, id: u16, text: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE results SET data = data || ?1 WHERE id = ?2 AND agent = ?3",
            params![text, id, agent],
        )?;
        Ok(())
    }

    fn max_task_id(&self, agent: &str) -> Result<Option<u16>> {
        let conn = self.lock();
        let max: Option<i64> = conn
            .query_row(
                "SELECT MAX(id) FROM taskings WHERE agent = ?1",
                params![agent],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(max.map(|v| v as u16))
    }

    fn mark_tasks_drained(&self, agent: &str, ids: &[u16]) -> Result<()> {
        let conn = self.lock();
        for id in ids {
            conn.execute(
                "UPDATE taskings SET drained_at = ?1 WHERE id = ?2 AND agent = ?3",
                params![to_rfc3339(Utc::now()), id, agent],
            )?;
        }
        Ok(())
    }

    fn task_module_name(&self, agent: &str, id: u16) -> Result<Option<String>> {
        let conn = self.lock();
        let name: Option<Option<String>> = conn
            .query_row(
                "SELECT module_name FROM taskings WHERE id = ?1 AND agent = ?2",
                params![id, agent],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name.flatten())
    }

    fn replace_directory_children(
        &self,
        session_id: &str,
        parent_path: &str,
        parent_name: &str,
        entries: &[FileDirectoryEntry],
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let parent_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM file_directory WHERE session_id = ?1 AND path = ?2",
                params![session_id, parent_path],
                |row| row.get(0),
            )
            .optional()?;

        let parent_id = match parent_id {
            Some(id) => id,
            None => {
                tx.execute(
                    "INSERT INTO file_directory (session_id, parent_id, name, path, is_file) VALUES (?1, NULL, ?2, ?3, 0)",
                    params![session_id, parent_name, parent_path],
                )?;
                tx.last_insert_rowid()
            }
        };

        // Cascading delete of existing children, then fresh insert —
        // TASK_DIR_LIST replaces a directory's children wholesale.
        tx.execute(
            "DELETE FROM file_directory WHERE parent_id = ?1",
            params![parent_id],
        )?;

        for entry in entries {
            tx.execute(
                "INSERT INTO file_directory (session_id, parent_id, name, path, is_file) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, parent_id, entry.name, entry.path, entry.is_file as i64],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn directory_children(&self, session_id: &str, parent_path: &str) -> Result<Vec<FileDirectoryEntry>> {
        let conn = self.lock();
        let parent_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM file_directory WHERE session_id = ?1 AND path = ?2",
                params![session_id, parent_path],
                |row| row.get(0),
            )
            .optional()?;
        let Some(parent_id) = parent_id else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare(
            "SELECT id, parent_id, name, path, is_file FROM file_directory WHERE parent_id = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![parent_id], |row| {
                Ok(FileDirectoryEntry {
                    id: row.get(0)?,
                    session_id: session_id.to_string(),
                    parent_id: row.get(1)?,
                    name: row.get(2)?,
                    path: row.get(3)?,
                    is_file: row.get::<_, i64>(4)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get_global_config(&self) -> Result<GlobalConfigRow> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT autorun_command, autorun_data FROM config LIMIT 1",
                [],
                |row| {
                    Ok(GlobalConfigRow {
                        autorun_command: row.get(0)?,
                        autorun_data: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or_default())
    }

    fn set_global_config(&self, cfg: &GlobalConfigRow) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch("DELETE FROM config;")?;
        conn.execute(
            "INSERT INTO config (autorun_command, autorun_data) VALUES (?1, ?2)",
            params![cfg.autorun_command, cfg.autorun_data],
        )?;
        Ok(())
    }
}

impl SqliteStore {
    fn load_pending_taskings(&self, agent: &str) -> Result<Vec<Tasking>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, data FROM taskings WHERE agent = ?1 AND drained_at IS NULL ORDER BY id",
        )?;
        let rows = stmt.query_map(params![agent], |row| {
            Ok(Tasking {
                task_id: row.get::<_, i64>(0)? as u16,
                name: row.get::<_, i64>(1)? as u16,
                body: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Agent;

    fn sample_agent(id: &str) -> Agent {
        Agent::new_staged(
            id.to_string(),
            Language::Python,
            vec![9u8; 32],
            vec![8u8; 32],
            "0000000000000000".to_string(),
            "http".to_string(),
            5,
            0.0,
            10,
            String::new(),
            String::new(),
            String::new(),
        )
    }

    #[test]
    fn upsert_then_load_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_agent(&sample_agent("SESSION1")).unwrap();
        let loaded = store.load_all_agents().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].session_id, "SESSION1");
        assert_eq!(loaded[0].language, Language::Python);
    }

    #[test]
    fn task_id_wraps_are_tracked_by_max() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_agent(&sample_agent("SESSION1")).unwrap();
        assert_eq!(store.max_task_id("SESSION1").unwrap(), None);
        store
            .insert_task(&TaskRow {
                id: 65535,
                agent: "SESSION1".to_string(),
                user_id: 1,
                name: 1,
                body: vec![],
                timestamp: Utc::now(),
                module_name: None,
            })
            .unwrap();
        assert_eq!(store.max_task_id("SESSION1").unwrap(), Some(65535));
    }

    #[test]
    fn task_module_name_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_agent(&sample_agent("SESSION1")).unwrap();
        store
            .insert_task(&TaskRow {
                id: 1,
                agent: "SESSION1".to_string(),
                user_id: 1,
                name: 1,
                body: vec![],
                timestamp: Utc::now(),
                module_name: Some("keylogger".to_string()),
            })
            .unwrap();
        assert_eq!(
            store.task_module_name("SESSION1", 1).unwrap(),
            Some("keylogger".to_string())
        );
        assert_eq!(store.task_module_name("SESSION1", 2).unwrap(), None);
    }

    #[test]
    fn directory_replace_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_agent(&sample_agent("SESSION1")).unwrap();
        let entries = vec![FileDirectoryEntry {
            id: 0,
            session_id: "SESSION1".to_string(),
            parent_id: None,
            name: "a.txt".to_string(),
            path: "C:\\a.txt".to_string(),
            is_file: true,
        }];
        store
            .replace_directory_children("SESSION1", "C:\\", "C:\\", &entries)
            .unwrap();
        store
            .replace_directory_children("SESSION1", "C:\\", "C:\\", &entries)
            .unwrap();
        let conn = store.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM file_directory WHERE session_id = 'SESSION1' AND is_file = 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
