//! Spawning and supervision of the coding-agent process.
//!
//! One spawned process per session, in one of three modes. The process group
//! is managed through `command-group` so a kill reaches the agent's own
//! children (shell tools), and termination always escalates from a graceful
//! interrupt to a forced group kill after a grace period.

use std::{
    path::Path,
    process::{ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use nix::{sys::signal, unistd::Pid};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::{Mutex, RwLock, mpsc},
    time::timeout,
};
use utils::{session_log::SessionLogger, shell::resolve_executable_path};

use crate::protocol::{OutboundMessage, SessionEvent, SessionResult, StreamParser};

/// Tool-invocation patterns passed to the agent in the permission-checked
/// modes: file read/edit/write, search, and a narrow set of shell prefixes
/// for version control, builds/typechecks, tests and package management.
/// The allowlist is enforced by the agent itself.
pub const ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "MultiEdit",
    "Glob",
    "Grep",
    "LS",
    "Bash(git:*)",
    "Bash(cargo:*)",
    "Bash(npm:*)",
    "Bash(pnpm:*)",
];

/// Secret-bearing variable names stripped from the child environment. The
/// rest of the environment is inherited so the agent binary keeps whatever
/// system-level credential access it needs to authenticate as the operator,
/// while server-side secrets stay out of reach of its shell tools.
pub const BLOCKED_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "SLACK_BOT_TOKEN",
    "SLACK_APP_TOKEN",
    "SLACK_SIGNING_SECRET",
    "DATABASE_URL",
    "POSTGRES_URL",
    "REDIS_URL",
    "GITHUB_TOKEN",
    "SENTRY_DSN",
];

pub type SharedChild = Arc<RwLock<AsyncGroupChild>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Task on the command line; one result, then exit. Wall-clock timeout.
    OneShot,
    /// Task and follow-ups over stdin; stays alive between turns. No timeout.
    Bidirectional,
    /// Unrestricted permissions, stdin closed at spawn. Wall-clock and cost
    /// ceilings both apply.
    Autonomous,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("agent binary `{0}` not found or not executable")]
    AgentNotFound(String),
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("agent stdio was not captured")]
    MissingStdio,
    #[error("failed to write agent input: {0}")]
    Input(#[source] std::io::Error),
    #[error("session is not accepting input")]
    InputClosed,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub agent_binary: String,
    pub model: Option<String>,
    pub oneshot_timeout_ms: u64,
    pub autonomous_timeout_ms: u64,
    /// Cumulative-cost ceiling for autonomous sessions. None disables it.
    pub autonomous_cost_ceiling_usd: Option<f64>,
    /// How long a graceful interrupt may take before the forced group kill.
    pub kill_grace_ms: u64,
    /// Treat a zero exit with no observed result as an error instead of an
    /// empty completion.
    pub error_on_empty_exit: bool,
    pub env_blocklist: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            agent_binary: "claude".to_string(),
            model: None,
            oneshot_timeout_ms: 30 * 60 * 1000,
            autonomous_timeout_ms: 60 * 60 * 1000,
            autonomous_cost_ceiling_usd: Some(10.0),
            kill_grace_ms: 5_000,
            error_on_empty_exit: false,
            env_blocklist: BLOCKED_ENV_VARS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ExecutorConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    fn wall_ceiling(&self, mode: SessionMode) -> Option<Duration> {
        match mode {
            SessionMode::OneShot => Some(Duration::from_millis(self.oneshot_timeout_ms)),
            SessionMode::Autonomous => Some(Duration::from_millis(self.autonomous_timeout_ms)),
            SessionMode::Bidirectional => None,
        }
    }
}

/// Write half of a bidirectional session's stdin. Cloneable so the registry
/// and the orchestrator can share it.
#[derive(Clone)]
pub struct SessionInput {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
}

impl SessionInput {
    fn new(stdin: Option<ChildStdin>) -> Self {
        Self {
            stdin: Arc::new(Mutex::new(stdin)),
        }
    }

    /// An input handle that accepts nothing, for sessions whose stdin was
    /// closed at spawn.
    pub fn closed() -> Self {
        Self::new(None)
    }

    /// Send one follow-up user message as a line-delimited JSON envelope.
    pub async fn send(&self, text: &str) -> Result<(), ExecutorError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ExecutorError::InputClosed)?;
        let mut line = serde_json::to_string(&OutboundMessage::new_user(text))?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(ExecutorError::Input)?;
        stdin.flush().await.map_err(ExecutorError::Input)?;
        Ok(())
    }

    /// Close the input stream; the agent finishes its turn and exits.
    pub async fn close(&self) {
        self.stdin.lock().await.take();
    }
}

/// A live agent process: the session-event stream, the input handle, and the
/// shared child used by the registry and the kill path.
pub struct SpawnedSession {
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub input: SessionInput,
    child: SharedChild,
    kill_grace: Duration,
}

impl SpawnedSession {
    pub fn child(&self) -> SharedChild {
        self.child.clone()
    }

    /// Graceful interrupt, escalating to a forced group kill. Idempotent.
    pub async fn kill(&self) {
        kill_gracefully(&self.child, self.kill_grace).await;
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentExecutor {
    config: ExecutorConfig,
}

impl AgentExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Spawn the agent for one session and wire up its event stream.
    ///
    /// The returned channel delivers progress and results in emission order
    /// and closes once the process has exited and stdout is fully drained.
    pub async fn spawn(
        &self,
        session_id: &str,
        mode: SessionMode,
        task: &str,
        cwd: &Path,
        logger: SessionLogger,
    ) -> Result<SpawnedSession, ExecutorError> {
        let binary = resolve_executable_path(&self.config.agent_binary)
            .ok_or_else(|| ExecutorError::AgentNotFound(self.config.agent_binary.clone()))?;
        let args = self.build_args(mode, task);

        let mut cmd = Command::new(&binary);
        cmd.args(&args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for name in &self.config.env_blocklist {
            cmd.env_remove(name);
        }

        let mut child = cmd.group_spawn().map_err(ExecutorError::Spawn)?;
        logger
            .log(&format!(
                "spawn[{session_id}] {} {}",
                binary.display(),
                args.join(" ")
            ))
            .await;

        let stdout = child
            .inner()
            .stdout
            .take()
            .ok_or(ExecutorError::MissingStdio)?;
        let stderr = child
            .inner()
            .stderr
            .take()
            .ok_or(ExecutorError::MissingStdio)?;
        let stdin = child.inner().stdin.take();

        // Only bidirectional sessions keep stdin; the other modes close it at
        // spawn so the agent can never block waiting for input.
        let input = match mode {
            SessionMode::Bidirectional => SessionInput::new(stdin),
            _ => {
                drop(stdin);
                SessionInput::new(None)
            }
        };

        let shared: SharedChild = Arc::new(RwLock::new(child));

        // The caller's task is the first structured input message of a
        // bidirectional session. A failed send means the agent is already
        // gone; don't leak the process.
        if mode == SessionMode::Bidirectional {
            if let Err(e) = input.send(task).await {
                kill_gracefully(&shared, self.config.kill_grace()).await;
                return Err(e);
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let saw_terminal = Arc::new(AtomicBool::new(false));

        let cost_ceiling = match mode {
            SessionMode::Autonomous => self.config.autonomous_cost_ceiling_usd,
            _ => None,
        };
        let kill_grace = self.config.kill_grace();

        let reader = {
            let tx = tx.clone();
            let child = shared.clone();
            let logger = logger.clone();
            let saw_terminal = saw_terminal.clone();
            tokio::spawn(async move {
                let mut parser = StreamParser::new();
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    for event in parser.parse_line(&line) {
                        log_event(&logger, &event).await;
                        let breach = match &event {
                            SessionEvent::TurnResult(res) => {
                                saw_terminal.store(true, Ordering::SeqCst);
                                match (res.cost_usd, cost_ceiling) {
                                    (Some(cost), Some(ceiling)) if cost > ceiling => {
                                        Some((cost, ceiling))
                                    }
                                    _ => None,
                                }
                            }
                            SessionEvent::Error { .. } => {
                                saw_terminal.store(true, Ordering::SeqCst);
                                None
                            }
                            _ => None,
                        };
                        let _ = tx.send(event);
                        if let Some((cost, ceiling)) = breach {
                            let message = format!(
                                "cost ceiling breached: cumulative cost ${cost:.2} exceeds ceiling ${ceiling:.2}"
                            );
                            logger.log(&message).await;
                            let _ = tx.send(SessionEvent::Error { message });
                            kill_gracefully(&child, kill_grace).await;
                            return;
                        }
                    }
                }
            })
        };

        let stderr_task = {
            let logger = logger.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logger.log(&format!("stderr: {line}")).await;
                }
            })
        };

        let wall_ceiling = self.config.wall_ceiling(mode);
        let error_on_empty = self.config.error_on_empty_exit;
        {
            let child = shared.clone();
            let logger = logger.clone();
            let saw_terminal = saw_terminal.clone();
            tokio::spawn(async move {
                let ceiling_timer = async {
                    match wall_ceiling {
                        Some(d) => tokio::time::sleep(d).await,
                        None => std::future::pending().await,
                    }
                };
                let exit_status = tokio::select! {
                    status = wait_for_exit(&child) => status,
                    _ = ceiling_timer => {
                        let secs = wall_ceiling.unwrap_or_default().as_secs_f64();
                        let message =
                            format!("wall-clock ceiling breached after {secs:.0}s; terminating agent");
                        logger.log(&message).await;
                        saw_terminal.store(true, Ordering::SeqCst);
                        let _ = tx.send(SessionEvent::Error { message });
                        kill_gracefully(&child, kill_grace).await;
                        wait_for_exit(&child).await
                    }
                };

                // Drain stdout/stderr fully before deciding on synthesis, so
                // a result emitted just before exit is never raced.
                let _ = reader.await;
                let _ = stderr_task.await;

                match exit_status {
                    Some(status) => logger.log(&format!("exit: {status}")).await,
                    None => logger.log("exit: status unavailable").await,
                }

                if !saw_terminal.load(Ordering::SeqCst) {
                    let _ = tx.send(synthesize_exit_event(exit_status, error_on_empty));
                }
                // tx drops here; the event channel closes.
            });
        }

        Ok(SpawnedSession {
            events: rx,
            input,
            child: shared,
            kill_grace,
        })
    }

    fn build_args(&self, mode: SessionMode, task: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(model) = &self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        match mode {
            SessionMode::OneShot => {
                args.push("--allowedTools".to_string());
                args.push(ALLOWED_TOOLS.join(","));
                args.push("--".to_string());
                args.push(task.to_string());
            }
            SessionMode::Bidirectional => {
                args.push("--allowedTools".to_string());
                args.push(ALLOWED_TOOLS.join(","));
                args.push("--input-format".to_string());
                args.push("stream-json".to_string());
            }
            SessionMode::Autonomous => {
                args.push("--dangerously-skip-permissions".to_string());
                args.push("--".to_string());
                args.push(task.to_string());
            }
        }
        args
    }
}

/// Interrupt the process group, wait out the grace period, then force-kill.
/// Killing an already-exited process is a no-op.
pub async fn kill_gracefully(child: &SharedChild, grace: Duration) {
    {
        let mut guard = child.write().await;
        match guard.try_wait() {
            Ok(Some(_)) | Err(_) => return,
            Ok(None) => {
                // The child is its own process-group leader, so its id is the
                // group id and the interrupt reaches shell-tool children too.
                if let Some(pid) = guard.id() {
                    let _ = signal::killpg(Pid::from_raw(pid as i32), signal::Signal::SIGINT);
                }
            }
        }
    }
    if timeout(grace, wait_for_exit(child)).await.is_err() {
        let mut guard = child.write().await;
        if let Err(e) = guard.kill().await {
            tracing::warn!("failed to force-kill agent process group: {e}");
        }
    }
}

/// Poll the child for exit without holding its lock across the wait, so the
/// kill path is never blocked out.
async fn wait_for_exit(child: &SharedChild) -> Option<ExitStatus> {
    loop {
        {
            let mut guard = child.write().await;
            match guard.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(_) => return None,
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn synthesize_exit_event(status: Option<ExitStatus>, error_on_empty: bool) -> SessionEvent {
    use std::os::unix::process::ExitStatusExt;
    match status {
        Some(status) if status.success() => {
            if error_on_empty {
                SessionEvent::Error {
                    message: "agent exited cleanly without producing a result".to_string(),
                }
            } else {
                // Some valid short sessions genuinely produce no textual
                // result; a clean exit without one is an empty completion.
                SessionEvent::TurnResult(SessionResult::default())
            }
        }
        Some(status) => {
            let message = match (status.code(), status.signal()) {
                (Some(code), _) => format!("agent exited with code {code}"),
                (None, Some(sig)) => format!("agent terminated by signal {sig}"),
                (None, None) => "agent exited abnormally".to_string(),
            };
            SessionEvent::Error { message }
        }
        None => SessionEvent::Error {
            message: "agent exit status could not be determined".to_string(),
        },
    }
}

async fn log_event(logger: &SessionLogger, event: &SessionEvent) {
    match event {
        SessionEvent::Thinking { text } => logger.log(&format!("text: {text}")).await,
        SessionEvent::ToolCall { tool, summary } => {
            logger.log(&format!("tool: {tool} {summary}")).await
        }
        SessionEvent::ToolResult => {}
        SessionEvent::TurnResult(res) => {
            logger
                .log(&format!(
                    "turn result: turns={} cost={}",
                    res.turns,
                    res.cost_usd
                        .map_or_else(|| "unknown".to_string(), |c| format!("${c:.2}"))
                ))
                .await
        }
        SessionEvent::Error { message } => logger.log(&format!("error: {message}")).await,
    }
}
