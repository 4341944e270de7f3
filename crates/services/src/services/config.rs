use std::{path::PathBuf, time::Duration};

use executors::ExecutorConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Main repository checkout the orchestrator operates against.
    pub repo_path: PathBuf,
    /// Directory under which per-session worktrees are created.
    pub worktree_root: PathBuf,
    /// Directory for per-session audit log files.
    pub log_dir: PathBuf,
    pub main_branch: String,
    pub remote: String,
    /// Session branches are named `<branch_prefix>/<session_id>`.
    pub branch_prefix: String,
    pub executor: ExecutorConfig,
    pub autopilot: AutopilotConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            worktree_root: std::env::temp_dir().join("agent-worktrees"),
            log_dir: std::env::temp_dir().join("agent-session-logs"),
            main_branch: "main".to_string(),
            remote: "origin".to_string(),
            branch_prefix: "agent".to_string(),
            executor: ExecutorConfig::default(),
            autopilot: AutopilotConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn branch_name(&self, session_id: &str) -> String {
        format!("{}/{}", self.branch_prefix, session_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotConfig {
    /// How long plan-ready waits for an explicit approval before advancing
    /// on its own, so the flow never stalls on an absent human.
    pub plan_approval_timeout_ms: u64,
    /// Upper bound on review → fix → review cycles.
    pub max_review_rounds: u32,
    /// Marker in the review text meaning the reviewer found nothing to fix.
    pub clean_review_marker: String,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            plan_approval_timeout_ms: 5 * 60 * 1000,
            max_review_rounds: 2,
            clean_review_marker: "LGTM".to_string(),
        }
    }
}

impl AutopilotConfig {
    pub fn plan_approval_timeout(&self) -> Duration {
        Duration::from_millis(self.plan_approval_timeout_ms)
    }
}
