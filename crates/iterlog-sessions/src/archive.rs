//! Durable side of the session store.
//!
//! Two tables sit behind [`KvStore`]: the current-session pointers
//! (agent id -> session id) and one [`AgentHistory`] record per agent.
//! Read failures are logged and come back empty; pointer and history
//! writes are best-effort, except for archiving a session, whose result
//! decides whether the in-memory copy may be dropped.

use std::collections::HashMap;
use std::sync::Arc;

use iterlog_db::{KvStore, StoreError, Table};
use serde_json::Value;

use crate::types::{AgentHistory, Session};

pub struct SessionArchive {
    store: Arc<dyn KvStore>,
}

impl SessionArchive {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Read the persisted current-session pointers.
    pub async fn load_pointers(&self) -> HashMap<String, String> {
        match self.store.entries(Table::CurrentSessions).await {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|(agent_id, value)| match value {
                    Value::String(session_id) => Some((agent_id, session_id)),
                    other => {
                        tracing::warn!("Ignoring malformed session pointer for {}: {}", agent_id, other);
                        None
                    }
                })
                .collect(),
            Err(e) => {
                tracing::warn!("Failed to load session pointers: {}", e);
                HashMap::new()
            }
        }
    }

    /// Rewrite the whole pointer table.
    pub async fn save_pointers(&self, pointers: &HashMap<String, String>) {
        let entries = pointers
            .iter()
            .map(|(agent_id, session_id)| (agent_id.clone(), Value::String(session_id.clone())))
            .collect();

        if let Err(e) = self.store.replace_all(Table::CurrentSessions, entries).await {
            tracing::warn!("Failed to persist session pointers: {}", e);
        }
    }

    /// Load an agent's history record, if any.
    pub async fn load_history(&self, agent_id: &str) -> Result<Option<AgentHistory>, StoreError> {
        match self.store.get(Table::Histories, agent_id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Merge sessions into the agent's history.
    ///
    /// Read-modify-write: existing sessions under other ids are kept. A
    /// session already in the history is merged by iteration id and keeps
    /// its earliest start. `latest` becomes the record's `current_session`.
    pub async fn archive_sessions(
        &self,
        agent_id: &str,
        latest: &str,
        sessions: &[Session],
    ) -> Result<(), StoreError> {
        let mut history = self
            .load_history(agent_id)
            .await?
            .unwrap_or_else(|| AgentHistory::new(agent_id));

        for session in sessions {
            match history.sessions.get_mut(&session.session_id) {
                Some(existing) => merge_session(existing, session),
                None => {
                    history
                        .sessions
                        .insert(session.session_id.clone(), session.clone());
                }
            }
        }
        history.current_session = latest.to_string();

        let value = serde_json::to_value(&history)?;
        self.store.put(Table::Histories, agent_id, value).await?;

        tracing::debug!(
            "archived {} session(s) for {} ({} total)",
            sessions.len(),
            agent_id,
            history.sessions.len()
        );
        Ok(())
    }

    /// All archived sessions of an agent, most recent start first.
    pub async fn historical_sessions(&self, agent_id: &str) -> Vec<Session> {
        match self.load_history(agent_id).await {
            Ok(Some(history)) => {
                let mut sessions: Vec<Session> = history.sessions.into_values().collect();
                sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
                sessions
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to load history for {}: {}", agent_id, e);
                Vec::new()
            }
        }
    }

    /// Delete an agent's whole history record.
    pub async fn clear_history(&self, agent_id: &str) {
        match self.store.delete(Table::Histories, agent_id).await {
            Ok(existed) => tracing::debug!("cleared history for {} (existed: {})", agent_id, existed),
            Err(e) => tracing::warn!("Failed to clear history for {}: {}", agent_id, e),
        }
    }
}

fn merge_session(existing: &mut Session, incoming: &Session) {
    for iteration in &incoming.iterations {
        match existing.iterations.iter_mut().find(|i| i.id == iteration.id) {
            Some(slot) => *slot = iteration.clone(),
            None => existing.iterations.push(iteration.clone()),
        }
    }
    existing.iterations.sort_by_key(|i| i.session_iteration_number);
    existing.start_time = existing.start_time.min(incoming.start_time);
    existing.end_time = existing.end_time.max(incoming.end_time);
}
