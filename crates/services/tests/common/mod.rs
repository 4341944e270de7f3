//! Shared fixtures: throwaway git repositories, fake agent binaries, and an
//! orchestrator wired to in-memory record/notification doubles.
#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use executors::ExecutorConfig;
use services::services::{
    config::OrchestratorConfig,
    notification::{Notifier, NotifyAction},
    orchestrator::SessionOrchestrator,
    record::{InMemoryRecordStore, SessionState},
};
use tempfile::TempDir;

pub fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Initialize a repository with three tracked files on `main`.
pub fn init_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "test@test.com"]);
    git(dir, &["config", "user.name", "Test"]);
    for name in ["README.md", "alpha.txt", "beta.txt"] {
        std::fs::write(dir.join(name), format!("{name}\n")).unwrap();
    }
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "Initial commit"]);
}

pub fn write_fake_agent(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Notifier double that records every message and hands out stable ids so
/// edit-in-place behavior is observable.
#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: tokio::sync::Mutex<Vec<(String, String)>>,
    counter: AtomicUsize,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_or_update(
        &self,
        session_id: &str,
        previous_message_id: Option<&str>,
        text: &str,
        _actions: &[NotifyAction],
    ) -> anyhow::Result<String> {
        self.messages
            .lock()
            .await
            .push((session_id.to_string(), text.to_string()));
        Ok(match previous_message_id {
            Some(id) => id.to_string(),
            None => format!("msg-{}", self.counter.fetch_add(1, Ordering::SeqCst)),
        })
    }
}

impl RecordingNotifier {
    pub async fn texts_for(&self, session_id: &str) -> Vec<String> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == session_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

pub struct TestHarness {
    pub temp: TempDir,
    pub repo: PathBuf,
    pub config: OrchestratorConfig,
    pub record: InMemoryRecordStore,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: SessionOrchestrator,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

pub fn harness(agent_body: &str) -> TestHarness {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let repo = temp.path().join("repo");
    init_repo(&repo);
    let agent = write_fake_agent(temp.path(), agent_body);

    let config = OrchestratorConfig {
        repo_path: repo.clone(),
        worktree_root: temp.path().join("worktrees"),
        log_dir: temp.path().join("logs"),
        executor: ExecutorConfig {
            agent_binary: agent.display().to_string(),
            kill_grace_ms: 200,
            ..Default::default()
        },
        ..Default::default()
    };
    let record = InMemoryRecordStore::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let orchestrator = SessionOrchestrator::new(
        config.clone(),
        Arc::new(record.clone()),
        notifier.clone(),
    );
    TestHarness {
        temp,
        repo,
        config,
        record,
        notifier,
        orchestrator,
    }
}

/// Poll the record store until the session reaches `state`.
pub async fn wait_for_state(record: &InMemoryRecordStore, session_id: &str, state: SessionState) {
    let deadline = Duration::from_secs(20);
    tokio::time::timeout(deadline, async {
        loop {
            if record
                .snapshot(session_id)
                .await
                .and_then(|r| r.state)
                .is_some_and(|s| s == state)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!("session {session_id} never reached {state:?}");
    });
}
