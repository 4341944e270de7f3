//! Process-wide table of live sessions.
//!
//! In-memory only: the registry lives and dies with the orchestrator
//! process. Durable session state belongs to the record store; the registry
//! tracks exactly what cannot be persisted, the live process handles. Lookups
//! prune entries whose process has already exited, so the table self-cleans
//! without a background sweep.

use std::{collections::HashMap, sync::Arc, time::Duration};

use executors::{SessionInput, SessionMode, SharedChild, claude::kill_gracefully};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::services::record::SessionState;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session `{0}` already has a live process")]
    AlreadyRunning(String),
}

/// One live session: its process handle, input handle, mode and state.
#[derive(Clone)]
pub struct SessionEntry {
    pub child: SharedChild,
    pub input: SessionInput,
    pub mode: SessionMode,
    pub state: SessionState,
}

impl SessionEntry {
    pub fn new(child: SharedChild, input: SessionInput, mode: SessionMode) -> Self {
        Self {
            child,
            input,
            mode,
            state: SessionState::Running,
        }
    }
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    /// Session id → notification-channel message id, so status updates can
    /// edit the previous notification instead of posting a new one.
    messages: Arc<RwLock<HashMap<String, String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session's live process. At most one live process may exist
    /// per session identifier: a dead incumbent is pruned, a live one is an
    /// error.
    pub async fn register(&self, session_id: &str, entry: SessionEntry) -> Result<(), RegistryError> {
        let mut map = self.sessions.write().await;
        if let Some(existing) = map.get(session_id) {
            if process_is_live(&existing.child).await {
                return Err(RegistryError::AlreadyRunning(session_id.to_string()));
            }
            map.remove(session_id);
        }
        map.insert(session_id.to_string(), entry);
        Ok(())
    }

    /// Look up a session, pruning it if its process has exited.
    pub async fn get(&self, session_id: &str) -> Option<SessionEntry> {
        let mut map = self.sessions.write().await;
        let entry = map.get(session_id)?.clone();
        if process_is_live(&entry.child).await {
            Some(entry)
        } else {
            map.remove(session_id);
            None
        }
    }

    pub async fn contains_live(&self, session_id: &str) -> bool {
        self.get(session_id).await.is_some()
    }

    /// Release a session's process slot. The message-id mapping survives so
    /// later status updates (merge, discard) can still edit in place.
    pub async fn remove(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn set_state(&self, session_id: &str, state: SessionState) {
        if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
            entry.state = state;
        }
    }

    /// Ids of sessions whose process is still running. Prunes as it goes.
    pub async fn live_sessions(&self) -> Vec<String> {
        let mut map = self.sessions.write().await;
        let mut live = Vec::new();
        let mut dead = Vec::new();
        for (id, entry) in map.iter() {
            if process_is_live(&entry.child).await {
                live.push(id.clone());
            } else {
                dead.push(id.clone());
            }
        }
        for id in dead {
            map.remove(&id);
        }
        live
    }

    /// Shutdown hook: terminate every still-live process so no orphaned
    /// agents survive the orchestrator.
    pub async fn kill_all(&self, grace: Duration) {
        let entries: Vec<(String, SessionEntry)> = {
            let map = self.sessions.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (id, entry) in entries {
            tracing::info!("terminating session {id} on shutdown");
            kill_gracefully(&entry.child, grace).await;
        }
        self.sessions.write().await.clear();
        self.messages.write().await.clear();
    }

    pub async fn set_message_id(&self, session_id: &str, message_id: String) {
        self.messages
            .write()
            .await
            .insert(session_id.to_string(), message_id);
    }

    pub async fn message_id(&self, session_id: &str) -> Option<String> {
        self.messages.read().await.get(session_id).cloned()
    }
}

async fn process_is_live(child: &SharedChild) -> bool {
    let mut guard = child.write().await;
    matches!(guard.try_wait(), Ok(None))
}

#[cfg(test)]
mod tests {
    use std::process::Stdio;

    use command_group::AsyncCommandGroup;
    use tokio::process::Command;

    use super::*;

    async fn spawn_child(cmd: &str) -> SharedChild {
        let child = Command::new("sh")
            .args(["-c", cmd])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .group_spawn()
            .unwrap();
        Arc::new(RwLock::new(child))
    }

    fn entry(child: SharedChild) -> SessionEntry {
        SessionEntry::new(child, SessionInput::closed(), SessionMode::OneShot)
    }

    #[tokio::test]
    async fn at_most_one_live_process_per_session_id() {
        let registry = SessionRegistry::new();
        let first = spawn_child("sleep 30").await;
        registry.register("s1", entry(first.clone())).await.unwrap();

        let second = spawn_child("sleep 30").await;
        let err = registry.register("s1", entry(second.clone())).await;
        assert!(matches!(err, Err(RegistryError::AlreadyRunning(_))));

        kill_gracefully(&first, Duration::from_millis(200)).await;
        kill_gracefully(&second, Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn dead_incumbent_is_pruned_on_register() {
        let registry = SessionRegistry::new();
        let dead = spawn_child("true").await;
        registry.register("s2", entry(dead.clone())).await.unwrap();
        // Let the short-lived process exit.
        {
            let mut guard = dead.write().await;
            let _ = guard.wait().await;
        }
        let replacement = spawn_child("sleep 30").await;
        registry
            .register("s2", entry(replacement.clone()))
            .await
            .unwrap();
        kill_gracefully(&replacement, Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn lookups_prune_exited_sessions() {
        let registry = SessionRegistry::new();
        let child = spawn_child("true").await;
        registry.register("s3", entry(child.clone())).await.unwrap();
        {
            let mut guard = child.write().await;
            let _ = guard.wait().await;
        }
        assert!(registry.get("s3").await.is_none());
        assert!(registry.live_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn kill_all_terminates_every_live_session() {
        let registry = SessionRegistry::new();
        let a = spawn_child("sleep 30").await;
        let b = spawn_child("sleep 30").await;
        registry.register("a", entry(a.clone())).await.unwrap();
        registry.register("b", entry(b.clone())).await.unwrap();

        registry.kill_all(Duration::from_millis(200)).await;
        assert!(registry.live_sessions().await.is_empty());
        assert!(!process_is_live(&a).await);
        assert!(!process_is_live(&b).await);
    }

    #[tokio::test]
    async fn message_ids_track_per_session() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.message_id("s4").await, None);
        registry.set_message_id("s4", "msg-1".to_string()).await;
        assert_eq!(registry.message_id("s4").await, Some("msg-1".to_string()));
        registry.set_message_id("s4", "msg-2".to_string()).await;
        assert_eq!(registry.message_id("s4").await, Some("msg-2".to_string()));
        // Releasing the process slot keeps the message mapping for later
        // status edits.
        registry.remove("s4").await;
        assert_eq!(registry.message_id("s4").await, Some("msg-2".to_string()));
    }
}
