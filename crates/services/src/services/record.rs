//! Durable session record, owned by the surrounding application.
//!
//! The orchestrator reads it only for the stale-write guard (has the session
//! been cancelled externally?) and writes state tags, progress, turn totals
//! and the final outcome. Storage technology is the embedder's business.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use executors::SessionResult;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::services::git::DiffStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    WaitingForInput,
    Completed,
    Error,
    /// Written only by the surrounding application; the orchestrator treats
    /// it as "stop updating this record".
    Cancelled,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Pending | SessionState::Running | SessionState::WaitingForInput
        )
    }
}

/// What a finished session left behind, for human review.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub stats: DiffStats,
    pub changed_files: Vec<String>,
    pub commit_log: String,
}

#[async_trait]
pub trait SessionRecordStore: Send + Sync {
    async fn state(&self, session_id: &str) -> anyhow::Result<Option<SessionState>>;

    async fn set_state(&self, session_id: &str, state: SessionState) -> anyhow::Result<()>;

    /// Latest agent message (thinking text, phase marker, error detail).
    async fn record_progress(&self, session_id: &str, message: &str) -> anyhow::Result<()>;

    /// Running turn/cost totals from a completed turn.
    async fn record_turn(&self, session_id: &str, result: &SessionResult) -> anyhow::Result<()>;

    /// Final diff statistics, changed files and commit log.
    async fn record_outcome(&self, session_id: &str, outcome: &SessionOutcome)
    -> anyhow::Result<()>;

    /// Sessions the durable record believes are still running or waiting.
    /// Zombie reconciliation checks these against the registry.
    async fn active_sessions(&self) -> anyhow::Result<Vec<String>>;
}

/// Everything the in-memory store knows about one session.
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    pub state: Option<SessionState>,
    pub last_message: String,
    pub turns: u64,
    pub cost_usd: Option<f64>,
    pub outcome: Option<SessionOutcome>,
}

/// Reference implementation backed by a map. Used in tests and as a default
/// for embedders that do their own persistence elsewhere.
#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    records: Arc<RwLock<HashMap<String, SessionRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<SessionRecord> {
        self.records.read().await.get(session_id).cloned()
    }

    /// Seed a record directly, e.g. to simulate a pre-restart session.
    pub async fn insert(&self, session_id: &str, record: SessionRecord) {
        self.records
            .write()
            .await
            .insert(session_id.to_string(), record);
    }
}

#[async_trait]
impl SessionRecordStore for InMemoryRecordStore {
    async fn state(&self, session_id: &str) -> anyhow::Result<Option<SessionState>> {
        Ok(self
            .records
            .read()
            .await
            .get(session_id)
            .and_then(|r| r.state))
    }

    async fn set_state(&self, session_id: &str, state: SessionState) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        records.entry(session_id.to_string()).or_default().state = Some(state);
        Ok(())
    }

    async fn record_progress(&self, session_id: &str, message: &str) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        let record = records.entry(session_id.to_string()).or_default();
        record.last_message = message.to_string();
        Ok(())
    }

    async fn record_turn(&self, session_id: &str, result: &SessionResult) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        let record = records.entry(session_id.to_string()).or_default();
        record.turns = result.turns;
        if result.cost_usd.is_some() {
            record.cost_usd = result.cost_usd;
        }
        if !result.text.is_empty() {
            record.last_message = result.text.clone();
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        session_id: &str,
        outcome: &SessionOutcome,
    ) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        records.entry(session_id.to_string()).or_default().outcome = Some(outcome.clone());
        Ok(())
    }

    async fn active_sessions(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.state.is_some_and(|s| s.is_active()))
            .map(|(id, _)| id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn turn_updates_accumulate_totals() {
        let store = InMemoryRecordStore::new();
        store
            .record_turn(
                "s1",
                &SessionResult {
                    turns: 1,
                    cost_usd: Some(0.5),
                    text: "first".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .record_turn(
                "s1",
                &SessionResult {
                    turns: 2,
                    cost_usd: None,
                    text: String::new(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let record = store.snapshot("s1").await.unwrap();
        assert_eq!(record.turns, 2);
        // A turn without cost keeps the last known total.
        assert_eq!(record.cost_usd, Some(0.5));
        assert_eq!(record.last_message, "first");
    }

    #[tokio::test]
    async fn active_sessions_reflect_state_tags() {
        let store = InMemoryRecordStore::new();
        store.set_state("a", SessionState::Running).await.unwrap();
        store
            .set_state("b", SessionState::WaitingForInput)
            .await
            .unwrap();
        store.set_state("c", SessionState::Completed).await.unwrap();
        store.set_state("d", SessionState::Cancelled).await.unwrap();

        let mut active = store.active_sessions().await.unwrap();
        active.sort();
        assert_eq!(active, vec!["a", "b"]);
    }
}
