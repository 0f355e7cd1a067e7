//! Agent data model and the coarse-mutex in-memory table that mirrors the
//! persisted `agents` row set (invariant I1).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::{AgentError, Result};
use crate::packet::Language;
use crate::persistence::Store;

/// A single queued task, kept in memory on the agent row until drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tasking {
    pub task_id: u16,
    pub name: u16,
    pub body: Vec<u8>,
}

/// An authenticated remote endpoint.
#[derive(Debug, Clone)]
pub struct Agent {
    pub session_id: String,
    pub name: String,
    pub language: Language,
    pub language_version: String,
    pub session_key: Vec<u8>,
    pub staging_key: Vec<u8>,
    pub nonce: String,
    pub delay: u32,
    pub jitter: f64,
    pub lost_limit: u32,
    pub kill_date: String,
    pub working_hours: String,
    pub profile: String,
    pub external_ip: String,
    pub internal_ip: String,
    pub hostname: String,
    pub username: String,
    pub os_details: String,
    pub high_integrity: bool,
    pub process_name: String,
    pub process_id: u32,
    pub listener: String,
    pub checkin_time: DateTime<Utc>,
    pub lastseen_time: DateTime<Utc>,
    pub taskings: Vec<Tasking>,
    pub results: String,
    pub functions: Vec<String>,
}

impl Agent {
    /// A freshly staged agent: only the fields known at STAGE1 are
    /// populated. Sysinfo fields are filled in at STAGE2.
    pub fn new_staged(
        session_id: String,
        language: Language,
        session_key: Vec<u8>,
        staging_key: Vec<u8>,
        nonce: String,
        listener_name: String,
        default_delay: u32,
        default_jitter: f64,
        default_lost_limit: u32,
        default_profile: String,
        kill_date: String,
        working_hours: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: session_id.clone(),
            session_id,
            language,
            language_version: String::new(),
            session_key,
            staging_key,
            nonce,
            delay: default_delay,
            jitter: default_jitter,
            lost_limit: default_lost_limit,
            kill_date,
            working_hours,
            profile: default_profile,
            external_ip: String::new(),
            internal_ip: String::new(),
            hostname: String::new(),
            username: String::new(),
            os_details: String::new(),
            high_integrity: false,
            process_name: String::new(),
            process_id: 0,
            listener: listener_name,
            checkin_time: now,
            lastseen_time: now,
            taskings: Vec::new(),
            results: String::new(),
            functions: Vec::new(),
        }
    }
}

/// Thread-safe in-memory table of live sessions, backed by a durable
/// mirror behind the [`Store`] trait. Every mutation writes to both
/// within the same critical section (I1, R1, R3).
pub struct AgentStore {
    table: Mutex<HashMap<String, Agent>>,
    pub(crate) db: Arc<dyn Store>,
}

impl AgentStore {
    /// Rehydrate the in-memory table from the persistent store at startup.
    pub fn open(db: Arc<dyn Store>) -> Result<Self> {
        let agents = db.load_all_agents()?;
        let mut table = HashMap::new();
        for agent in agents {
            table.insert(agent.session_id.clone(), agent);
        }
        Ok(Self {
            table: Mutex::new(table),
            db,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Agent>> {
        self.table.lock().expect("agent store mutex poisoned")
    }

    pub fn add_agent(&self, agent: Agent) -> Result<()> {
        let mut table = self.lock();
        self.db.upsert_agent(&agent)?;
        table.insert(agent.session_id.clone(), agent);
        Ok(())
    }

    /// `remove_agent("%")` removes all agents (operator kill switch).
    pub fn remove_agent(&self, session_id: &str) -> Result<()> {
        let mut table = self.lock();
        if session_id == "%" {
            self.db.delete_all_agents()?;
            table.clear();
        } else {
            self.db.delete_agent(session_id)?;
            table.remove(session_id);
        }
        Ok(())
    }

    pub fn rename_agent(&self, session_id: &str, new_name: &str) -> Result<()> {
        let mut table = self.lock();
        let agent = table
            .get_mut(session_id)
            .ok_or_else(|| AgentError::AgentUnknown(session_id.to_string()))?;
        agent.name = new_name.to_string();
        self.db.upsert_agent(agent)?;
        Ok(())
    }

    pub fn update_lastseen(&self, session_id: &str) -> Result<()> {
        let mut table = self.lock();
        let agent = table
            .get_mut(session_id)
            .ok_or_else(|| AgentError::AgentUnknown(session_id.to_string()))?;
        agent.lastseen_time = Utc::now();
        self.db.upsert_agent(agent)?;
        Ok(())
    }

    pub fn update_listener(&self, session_id: &str, listener: &str) -> Result<()> {
        let mut table = self.lock();
        let agent = table
            .get_mut(session_id)
            .ok_or_else(|| AgentError::AgentUnknown(session_id.to_string()))?;
        agent.listener = listener.to_string();
        self.db.upsert_agent(agent)?;
        Ok(())
    }

    /// Re-applies the STAGE2 sysinfo fields (used both by STAGE2 itself
    /// and by the `TASK_SYSINFO` opcode, which re-runs the same update
    /// without a nonce check).
    pub fn update_sysinfo(
        &self,
        session_id: &str,
        mutate: impl FnOnce(&mut Agent),
    ) -> Result<()> {
        let mut table = self.lock();
        let agent = table
            .get_mut(session_id)
            .ok_or_else(|| AgentError::AgentUnknown(session_id.to_string()))?;
        mutate(agent);
        self.db.upsert_agent(agent)?;
        Ok(())
    }

    pub fn get_agent(&self, session_id: &str) -> Option<Agent> {
        self.lock().get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn all_session_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Append text to the agent's accumulated `results` and persist it.
    pub fn append_results_text(&self, session_id: &str, text: &str) -> Result<()> {
        let mut table = self.lock();
        let agent = table
            .get_mut(session_id)
            .ok_or_else(|| AgentError::AgentUnknown(session_id.to_string()))?;
        if !agent.results.is_empty() {
            agent.results.push('\n');
        }
        agent.results.push_str(text);
        self.db.upsert_agent(agent)?;
        Ok(())
    }

    pub(crate) fn with_agent_mut<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Agent, &dyn Store) -> Result<T>,
    ) -> Result<T> {
        let mut table = self.lock();
        let agent = table
            .get_mut(session_id)
            .ok_or_else(|| AgentError::AgentUnknown(session_id.to_string()))?;
        f(agent, self.db.as_ref())
    }
}
