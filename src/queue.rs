//! Per-agent FIFO task queue: monotonic wrap-around task IDs (I3), atomic
//! enqueue/drain (R5), persisted across restart.

use chrono::Utc;

use crate::error::Result;
use crate::persistence::TaskRow;
use crate::store::{AgentStore, Tasking};

impl AgentStore {
    /// `enqueue(session_id, task_name, body, user_id, module_name) -> task_id`.
    ///
    /// `task_id = (max_existing + 1) mod 65536`, where `max_existing`
    /// starts at 0 for an agent with no task history yet — so the first
    /// task minted for any agent is id 1, matching the wrap sequence
    /// `1, 2, …, 65535, 0, 1, …`.
    pub fn enqueue(
        &self,
        session_id: &str,
        task_name: u16,
        body: Vec<u8>,
        user_id: i64,
        module_name: Option<String>,
    ) -> Result<u16> {
        self.with_agent_mut(session_id, |agent, db| {
            let max: u32 = db.max_task_id(session_id)?.map(u32::from).unwrap_or(0);
            let task_id = ((max + 1) % 65536) as u16;

            db.insert_task(&TaskRow {
                id: task_id,
                agent: session_id.to_string(),
                user_id,
                name: task_name,
                body: body.clone(),
                timestamp: Utc::now(),
                module_name,
            })?;
            db.insert_blank_result(session_id, task_id, user_id)?;

            agent.taskings.push(Tasking {
                task_id,
                name: task_name,
                body,
            });

            Ok(task_id)
        })
    }

    /// Atomically returns and clears the agent's pending tasks.
    pub fn drain(&self, session_id: &str) -> Result<Vec<Tasking>> {
        self.with_agent_mut(session_id, |agent, db| {
            let drained = std::mem::take(&mut agent.taskings);
            let ids: Vec<u16> = drained.iter().map(|t| t.task_id).collect();
            db.mark_tasks_drained(session_id, &ids)?;
            Ok(drained)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Language;
    use crate::persistence::{SqliteStore, Store};
    use crate::store::Agent;
    use std::sync::Arc;

    fn store_with_agent(id: &str) -> AgentStore {
        let db: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = AgentStore::open(db).unwrap();
        store
            .add_agent(Agent::new_staged(
                id.to_string(),
                Language::Powershell,
                vec![0u8; 32],
                vec![1u8; 32],
                "1111111111111111".to_string(),
                "http".to_string(),
                5,
                0.0,
                10,
                String::new(),
                String::new(),
                String::new(),
            ))
            .unwrap();
        store
    }

    #[test]
    fn ids_start_at_one_and_increment() {
        let store = store_with_agent("A1");
        assert_eq!(store.enqueue("A1", 1, vec![], 1, None).unwrap(), 1);
        assert_eq!(store.enqueue("A1", 1, vec![], 1, None).unwrap(), 2);
    }

    #[test]
    fn wraps_around_after_65535() {
        let store = store_with_agent("A1");
        let mut last = 0u16;
        for _ in 0..65537 {
            last = store.enqueue("A1", 1, vec![], 1, None).unwrap();
            store.drain("A1").unwrap();
        }
        // 65537 enqueues starting at 1: ..., 65535 (#65535), 0 (#65536), 1 (#65537)
        assert_eq!(last, 1);
    }

    #[test]
    fn drain_is_atomic_and_clears_pending() {
        let store = store_with_agent("A1");
        store.enqueue("A1", 1, b"a".to_vec(), 1, None).unwrap();
        store.enqueue("A1", 2, b"b".to_vec(), 1, None).unwrap();
        let drained = store.drain("A1").unwrap();
        assert_eq!(drained.len(), 2);
        let second = store.drain("A1").unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn unknown_agent_is_rejected() {
        let store = store_with_agent("A1");
        assert!(store.enqueue("NOPE", 1, vec![], 1, None).is_err());
    }
}
