//! Fully hands-off change flow, composed from the session primitives.
//!
//! `planning → plan_ready → executing → pushing → reviewing`, with review
//! findings feeding bounded `fixing → reviewing` rounds. Plan approval
//! auto-advances after a timeout so the flow never stalls waiting on a
//! human. Every phase runs a fresh agent process against the same working
//! copy, so context accumulates in the branch, not in the orchestrator.

use std::sync::Arc;

use executors::{AgentExecutor, ExecutorError, SessionEvent, SessionMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use utils::session_log::SessionLogger;

use crate::services::{
    config::OrchestratorConfig,
    git::{GitService, GitServiceError, WorktreeInfo},
    notification::Notifier,
    record::{SessionOutcome, SessionRecordStore, SessionState},
    registry::{RegistryError, SessionEntry, SessionRegistry},
};

const PLANNING_PREAMBLE: &str = "Write a concrete implementation plan for the task below. \
Inspect the repository as needed but do not modify any files yet.\n\nTask: ";

const EXECUTING_PREAMBLE: &str = "Implement the task below, committing your work as you go.\n\nTask: ";

const REVIEWING_PREAMBLE: &str = "Review the changes on the current branch against the task below. \
If the implementation is correct and complete, reply with LGTM. \
Otherwise list the concrete issues that must be fixed.\n\nTask: ";

const FIXING_PREAMBLE: &str = "A reviewer found the following issues with the current branch. \
Fix them and commit your work.\n\nIssues:\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutopilotState {
    Planning,
    PlanReady,
    Executing,
    Pushing,
    Reviewing,
    Fixing,
    Completed,
    Error,
}

impl AutopilotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::PlanReady => "plan_ready",
            Self::Executing => "executing",
            Self::Pushing => "pushing",
            Self::Reviewing => "reviewing",
            Self::Fixing => "fixing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for AutopilotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AutopilotError {
    #[error(transparent)]
    Git(#[from] GitServiceError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("agent failed while {state}: {message}")]
    PhaseFailed {
        state: AutopilotState,
        message: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct AutopilotRequest {
    pub session_id: String,
    pub task: String,
    pub context: Option<String>,
    pub preserve_on_error: bool,
}

impl AutopilotRequest {
    pub fn new(session_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            task: task.into(),
            context: None,
            preserve_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotOutcome {
    pub plan: String,
    /// Number of fix rounds that ran.
    pub review_rounds: u32,
    pub final_review: String,
    /// Whether the final review contained the clean-review marker. False
    /// means the round bound was exhausted with issues outstanding; the
    /// branch is still pushed for human judgment.
    pub clean_review: bool,
    pub outcome: SessionOutcome,
}

#[derive(Clone)]
pub struct AutopilotFlow {
    config: Arc<OrchestratorConfig>,
    git: GitService,
    registry: SessionRegistry,
    executor: AgentExecutor,
    record: Arc<dyn SessionRecordStore>,
    notifier: Arc<dyn Notifier>,
}

impl AutopilotFlow {
    pub fn new(
        config: OrchestratorConfig,
        registry: SessionRegistry,
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
            registry,
            executor,
            record,
            notifier,
        }
    }

    /// Drive the flow to completion. `approval` releases the plan-ready
    /// gate early; otherwise the configured timeout releases it.
    pub async fn run(
        &self,
        request: AutopilotRequest,
        approval: oneshot::Receiver<()>,
    ) -> Result<AutopilotOutcome, AutopilotError> {
        let branch = self.config.branch_name(&request.session_id);
        let info = self.git.create_worktree(&branch, &request.session_id)?;
        let logger = SessionLogger::create(&self.config.log_dir, &request.session_id).await?;

        let result = self.drive(&request, &info, &logger, approval).await;
        if let Err(e) = &result {
            let session_id = &request.session_id;
            let _ = self
                .record
                .record_progress(session_id, &format!("autopilot failed: {e}"))
                .await;
            let _ = self.record.set_state(session_id, SessionState::Error).await;
            self.notify(session_id, &format!("autopilot failed: {e}")).await;
            if !request.preserve_on_error {
                self.git.cleanup(&info.path, &info.branch);
            }
        }
        result
    }

    async fn drive(
        &self,
        request: &AutopilotRequest,
        info: &WorktreeInfo,
        logger: &SessionLogger,
        approval: oneshot::Receiver<()>,
    ) -> Result<AutopilotOutcome, AutopilotError> {
        let session_id = &request.session_id;
        let task = match &request.context {
            Some(context) => format!("{}\n\n{}", request.task, context),
            None => request.task.clone(),
        };

        self.enter_phase(session_id, AutopilotState::Planning).await;
        let plan = self
            .run_phase(
                session_id,
                AutopilotState::Planning,
                SessionMode::OneShot,
                &format!("{PLANNING_PREAMBLE}{task}"),
                info,
                logger,
            )
            .await?;

        self.enter_phase(session_id, AutopilotState::PlanReady).await;
        tokio::select! {
            _ = approval => {
                logger.log("plan approved explicitly").await;
            }
            _ = tokio::time::sleep(self.config.autopilot.plan_approval_timeout()) => {
                logger.log("plan auto-approved after timeout").await;
            }
        }

        self.enter_phase(session_id, AutopilotState::Executing).await;
        let execute_task = format!("{EXECUTING_PREAMBLE}{task}\n\nPlan:\n{plan}");
        self.run_phase(
            session_id,
            AutopilotState::Executing,
            SessionMode::Autonomous,
            &execute_task,
            info,
            logger,
        )
        .await?;

        self.enter_phase(session_id, AutopilotState::Pushing).await;
        self.git.push_branch(&info.path, &info.branch)?;

        let mut review_rounds = 0u32;
        let (final_review, clean_review) = loop {
            self.enter_phase(session_id, AutopilotState::Reviewing).await;
            let review = self
                .run_phase(
                    session_id,
                    AutopilotState::Reviewing,
                    SessionMode::OneShot,
                    &format!("{REVIEWING_PREAMBLE}{task}"),
                    info,
                    logger,
                )
                .await?;
            if review.contains(&self.config.autopilot.clean_review_marker) {
                break (review, true);
            }
            if review_rounds >= self.config.autopilot.max_review_rounds {
                logger
                    .log("review rounds exhausted with issues outstanding")
                    .await;
                break (review, false);
            }
            review_rounds += 1;

            self.enter_phase(session_id, AutopilotState::Fixing).await;
            self.run_phase(
                session_id,
                AutopilotState::Fixing,
                SessionMode::Autonomous,
                &format!("{FIXING_PREAMBLE}{review}"),
                info,
                logger,
            )
            .await?;
            self.git.push_branch(&info.path, &info.branch)?;
        };

        let outcome = SessionOutcome {
            stats: self.git.diff_stats(&info.path)?,
            changed_files: self.git.changed_files(&info.path)?,
            commit_log: self.git.commit_log(&info.path)?,
        };
        let _ = self.record.record_outcome(session_id, &outcome).await;
        self.enter_phase(session_id, AutopilotState::Completed).await;
        self.notify(
            session_id,
            &format!(
                "autopilot completed: {} file(s) changed, branch {} pushed",
                outcome.stats.files_changed, info.branch
            ),
        )
        .await;

        Ok(AutopilotOutcome {
            plan,
            review_rounds,
            final_review,
            clean_review,
            outcome,
        })
    }

    /// Run one agent process for a phase and return its final result text.
    /// The process is registered under the flow's session id, so the
    /// shutdown hook and the one-live-process invariant both apply.
    async fn run_phase(
        &self,
        session_id: &str,
        state: AutopilotState,
        mode: SessionMode,
        task: &str,
        info: &WorktreeInfo,
        logger: &SessionLogger,
    ) -> Result<String, AutopilotError> {
        let session = self
            .executor
            .spawn(session_id, mode, task, &info.path, logger.clone())
            .await?;
        let entry = SessionEntry::new(session.child(), session.input.clone(), mode);
        if let Err(e) = self.registry.register(session_id, entry).await {
            session.kill().await;
            return Err(e.into());
        }

        let mut events = session.events;
        let mut last_text = String::new();
        let mut failure: Option<String> = None;
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Thinking { text } => {
                    let _ = self.record.record_progress(session_id, &text).await;
                }
                SessionEvent::TurnResult(result) => {
                    let _ = self.record.record_turn(session_id, &result).await;
                    if !result.text.is_empty() {
                        last_text = result.text;
                    }
                }
                SessionEvent::Error { message } => failure = Some(message),
                SessionEvent::ToolCall { .. } | SessionEvent::ToolResult => {}
            }
        }
        self.registry.remove(session_id).await;

        match failure {
            Some(message) => Err(AutopilotError::PhaseFailed { state, message }),
            None => Ok(last_text),
        }
    }

    async fn enter_phase(&self, session_id: &str, state: AutopilotState) {
        let record_state = match state {
            AutopilotState::Completed => SessionState::Completed,
            AutopilotState::Error => SessionState::Error,
            _ => SessionState::Running,
        };
        let _ = self
            .record
            .record_progress(session_id, &format!("autopilot phase: {state}"))
            .await;
        let _ = self.record.set_state(session_id, record_state).await;
        self.notify(session_id, &format!("autopilot {state}")).await;
    }

    async fn notify(&self, session_id: &str, text: &str) {
        let previous = self.registry.message_id(session_id).await;
        match self
            .notifier
            .send_or_update(session_id, previous.as_deref(), text, &[])
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
