//! Session lifecycle: start/resume, event consumption, finalization.
//!
//! State machine per interactive session:
//! `pending → running → waiting_for_input ⇄ running → completed`, with
//! `error` reachable from any non-terminal state. The working copy and
//! branch outlive the process: partial work survives crashes and stays
//! available for inspection, resume, or an explicit merge.

use std::sync::Arc;

use executors::{
    AgentExecutor, ExecutorError, SessionEvent, SessionMode, claude::kill_gracefully,
};
use thiserror::Error;
use tokio::sync::mpsc;
use utils::session_log::SessionLogger;

use crate::services::{
    config::OrchestratorConfig,
    git::{GitService, GitServiceError, WorktreeInfo},
    notification::{Notifier, NotifyAction},
    record::{SessionOutcome, SessionRecordStore, SessionState},
    registry::{RegistryError, SessionEntry, SessionRegistry},
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Git(#[from] GitServiceError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("session `{0}` is not registered")]
    UnknownSession(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("durable record error: {0}")]
    Record(#[from] anyhow::Error),
}

/// A caller's request to run one session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Opaque identifier; registry key, log-file name, worktree directory
    /// name and branch suffix all derive from it.
    pub session_id: String,
    /// Free-text task for the agent.
    pub task: String,
    pub context: Option<String>,
    pub mode: SessionMode,
    /// Keep the working copy when the session errors, e.g. for a later
    /// resume attempt.
    pub preserve_on_error: bool,
}

impl SessionRequest {
    pub fn new(session_id: impl Into<String>, task: impl Into<String>, mode: SessionMode) -> Self {
        Self {
            session_id: session_id.into(),
            task: task.into(),
            context: None,
            mode,
            preserve_on_error: false,
        }
    }
}

#[derive(Clone)]
pub struct SessionOrchestrator {
    config: Arc<OrchestratorConfig>,
    git: GitService,
    registry: SessionRegistry,
    executor: AgentExecutor,
    record: Arc<dyn SessionRecordStore>,
    notifier: Arc<dyn Notifier>,
}

impl SessionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        record: Arc<dyn SessionRecordStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let git = GitService::new(
            config.repo_path.clone(),
            config.worktree_root.clone(),
            config.main_branch.clone(),
            config.remote.clone(),
        );
        let executor = AgentExecutor::new(config.executor.clone());
        Self {
            config: Arc::new(config),
            git,
            registry: SessionRegistry::new(),
            executor,
            record,
            notifier,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn git(&self) -> &GitService {
        &self.git
    }

    /// Start a session on a fresh working copy.
    pub async fn start_session(&self, request: SessionRequest) -> Result<(), OrchestratorError> {
        let session_id = request.session_id.clone();
        if self.registry.contains_live(&session_id).await {
            return Err(RegistryError::AlreadyRunning(session_id).into());
        }
        let branch = self.config.branch_name(&session_id);
        let info = self.git.create_worktree(&branch, &session_id)?;
        match self.spawn_and_watch(request, info.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The session never ran; its empty working copy has nothing
                // worth preserving.
                self.git.cleanup(&info.path, &info.branch);
                Err(e)
            }
        }
    }

    /// Start a new agent process against a session's existing working copy,
    /// keeping its partial work on error so another attempt remains possible.
    pub async fn resume_session(
        &self,
        mut request: SessionRequest,
    ) -> Result<(), OrchestratorError> {
        let session_id = request.session_id.clone();
        if self.registry.contains_live(&session_id).await {
            return Err(RegistryError::AlreadyRunning(session_id).into());
        }
        let path = self.git.worktree_path(&session_id);
        if !path.exists() {
            return Err(GitServiceError::WorktreeMissing(path).into());
        }
        request.preserve_on_error = true;
        let info = WorktreeInfo {
            path,
            branch: self.config.branch_name(&session_id),
        };
        self.spawn_and_watch(request, info).await
    }

    async fn spawn_and_watch(
        &self,
        request: SessionRequest,
        info: WorktreeInfo,
    ) -> Result<(), OrchestratorError> {
        let session_id = request.session_id.clone();
        let task = match &request.context {
            Some(context) => format!("{}\n\n{}", request.task, context),
            None => request.task.clone(),
        };
        let logger = SessionLogger::create(&self.config.log_dir, &session_id).await?;
        let session = self
            .executor
            .spawn(&session_id, request.mode, &task, &info.path, logger)
            .await?;

        let entry = SessionEntry::new(session.child(), session.input.clone(), request.mode);
        if let Err(e) = self.registry.register(&session_id, entry).await {
            session.kill().await;
            return Err(e.into());
        }

        self.record_set_state(&session_id, SessionState::Running).await;
        self.notify(&session_id, "session running", &[]).await;

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator
                .run_event_loop(request, info, session.events)
                .await;
        });
        Ok(())
    }

    /// Consume one session's event stream until its process is gone, then
    /// finalize. Events for a given turn arrive in emission order.
    async fn run_event_loop(
        &self,
        request: SessionRequest,
        info: WorktreeInfo,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let session_id = &request.session_id;
        let mut failure: Option<String> = None;

        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Thinking { text } => {
                    if !self.is_cancelled(session_id).await {
                        if let Err(e) = self.record.record_progress(session_id, &text).await {
                            tracing::warn!("progress update for {session_id} failed: {e}");
                        }
                    }
                }
                SessionEvent::ToolCall { .. } | SessionEvent::ToolResult => {}
                SessionEvent::TurnResult(result) => {
                    if !self.is_cancelled(session_id).await {
                        if let Err(e) = self.record.record_turn(session_id, &result).await {
                            tracing::warn!("turn update for {session_id} failed: {e}");
                        }
                        if request.mode == SessionMode::Bidirectional {
                            self.registry
                                .set_state(session_id, SessionState::WaitingForInput)
                                .await;
                            self.record_set_state(session_id, SessionState::WaitingForInput)
                                .await;
                            self.notify(session_id, "session waiting for input", &[])
                                .await;
                        }
                    }
                }
                SessionEvent::Error { message } => {
                    failure = Some(message);
                }
            }
        }

        self.finalize(&request, &info, failure).await;
    }

    /// Runs exactly once per session, after process exit, so it always
    /// observes the working copy's final state.
    async fn finalize(&self, request: &SessionRequest, info: &WorktreeInfo, failure: Option<String>) {
        let session_id = &request.session_id;
        let cancelled = self.is_cancelled(session_id).await;

        match failure {
            Some(message) => {
                if !cancelled {
                    if let Err(e) = self.record.record_progress(session_id, &message).await {
                        tracing::warn!("error update for {session_id} failed: {e}");
                    }
                    self.record_set_state(session_id, SessionState::Error).await;
                }
                self.notify(session_id, &format!("session failed: {message}"), &[])
                    .await;
                if !request.preserve_on_error {
                    self.git.cleanup(&info.path, &info.branch);
                }
            }
            None => match self.gather_outcome(info) {
                Ok(outcome) => {
                    if !cancelled {
                        if let Err(e) = self.record.record_outcome(session_id, &outcome).await {
                            tracing::warn!("outcome update for {session_id} failed: {e}");
                        }
                        self.record_set_state(session_id, SessionState::Completed).await;
                    }
                    let actions = [
                        NotifyAction::new(format!("merge:{session_id}"), "Merge"),
                        NotifyAction::new(format!("discard:{session_id}"), "Discard"),
                    ];
                    self.notify(
                        session_id,
                        &format!(
                            "session completed: {} file(s) changed",
                            outcome.stats.files_changed
                        ),
                        &actions,
                    )
                    .await;
                }
                Err(e) => {
                    let message = format!("failed to gather session outcome: {e}");
                    if !cancelled {
                        let _ = self.record.record_progress(session_id, &message).await;
                        self.record_set_state(session_id, SessionState::Error).await;
                    }
                    self.notify(session_id, &message, &[]).await;
                }
            },
        }

        self.registry.remove(session_id).await;
    }

    /// Send a follow-up message to a waiting bidirectional session.
    pub async fn send_input(&self, session_id: &str, text: &str) -> Result<(), OrchestratorError> {
        let entry = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownSession(session_id.to_string()))?;
        entry.input.send(text).await?;
        self.registry.set_state(session_id, SessionState::Running).await;
        self.record_set_state(session_id, SessionState::Running).await;
        Ok(())
    }

    /// Close a bidirectional session's input; it finishes its turn and exits.
    pub async fn close_input(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let entry = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownSession(session_id.to_string()))?;
        entry.input.close().await;
        Ok(())
    }

    /// Kill a session's process. Graceful first, forced after the grace
    /// period; a no-op if the process already exited.
    pub async fn kill_session(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let entry = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownSession(session_id.to_string()))?;
        kill_gracefully(&entry.child, self.config.executor.kill_grace()).await;
        Ok(())
    }

    /// Fast-forward the mainline to a completed session's branch and clean
    /// up its working copy.
    pub fn merge_session(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let path = self.git.worktree_path(session_id);
        let branch = self.config.branch_name(session_id);
        self.git.merge(&path, &branch)?;
        Ok(())
    }

    /// Discard a session's working copy and branch without merging.
    pub fn discard_session(&self, session_id: &str) {
        let path = self.git.worktree_path(session_id);
        let branch = self.config.branch_name(session_id);
        self.git.cleanup(&path, &branch);
    }

    /// Reconcile sessions whose backing process died without the
    /// orchestrator observing it, e.g. across a restart. A surviving
    /// working copy is turned into a reviewable completed record; a missing
    /// one is an unrecoverable error.
    pub async fn reconcile_zombie_sessions(&self) -> Result<(), OrchestratorError> {
        let active = self.record.active_sessions().await?;
        for session_id in active {
            if self.registry.contains_live(&session_id).await {
                continue;
            }
            if self.git.worktree_exists(&session_id) {
                let info = WorktreeInfo {
                    path: self.git.worktree_path(&session_id),
                    branch: self.config.branch_name(&session_id),
                };
                match self.gather_outcome(&info) {
                    Ok(outcome) => {
                        tracing::info!(
                            "recovered zombie session {session_id}: {} file(s) changed",
                            outcome.stats.files_changed
                        );
                        let _ = self.record.record_outcome(&session_id, &outcome).await;
                        self.record_set_state(&session_id, SessionState::Completed).await;
                        self.notify(
                            &session_id,
                            "session process was lost; partial work is ready for review",
                            &[],
                        )
                        .await;
                    }
                    Err(e) => {
                        let _ = self
                            .record
                            .record_progress(
                                &session_id,
                                &format!("zombie session recovery failed: {e}"),
                            )
                            .await;
                        self.record_set_state(&session_id, SessionState::Error).await;
                    }
                }
            } else {
                let _ = self
                    .record
                    .record_progress(
                        &session_id,
                        "session process died and its working copy is gone; state is unrecoverable",
                    )
                    .await;
                self.record_set_state(&session_id, SessionState::Error).await;
            }
        }
        Ok(())
    }

    /// Shutdown hook: terminate every live session so no agent outlives the
    /// orchestrator.
    pub async fn shutdown(&self) {
        self.registry
            .kill_all(self.config.executor.kill_grace())
            .await;
    }

    fn gather_outcome(&self, info: &WorktreeInfo) -> Result<SessionOutcome, GitServiceError> {
        Ok(SessionOutcome {
            stats: self.git.diff_stats(&info.path)?,
            changed_files: self.git.changed_files(&info.path)?,
            commit_log: self.git.commit_log(&info.path)?,
        })
    }

    async fn is_cancelled(&self, session_id: &str) -> bool {
        matches!(
            self.record.state(session_id).await,
            Ok(Some(SessionState::Cancelled))
        )
    }

    async fn record_set_state(&self, session_id: &str, state: SessionState) {
        if let Err(e) = self.record.set_state(session_id, state).await {
            tracing::warn!("state update for {session_id} failed: {e}");
        }
    }

    /// Fire-and-forget status notification; edits the previous channel
    /// message in place when one exists. Failure is tolerated silently.
    async fn notify(&self, session_id: &str, text: &str, actions: &[NotifyAction]) {
        let previous = self.registry.message_id(session_id).await;
        match self
            .notifier
            .send_or_update(session_id, previous.as_deref(), text, actions)
            .await
        {
            Ok(message_id) if !message_id.is_empty() => {
                self.registry.set_message_id(session_id, message_id).await;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("notification for session {session_id} failed: {e}"),
        }
    }
}
