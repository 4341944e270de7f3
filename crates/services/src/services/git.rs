//! Working-copy management: one isolated worktree + branch per session.
//!
//! A session's worktree is created from the freshest available mainline
//! reference, owned exclusively by that session for its entire lifetime
//! (including after process death), and only ever leaves through a
//! fast-forward merge or an explicit cleanup. The mainline itself is never
//! committed to directly.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod cli;

pub use cli::{GitCli, GitCliError};

#[derive(Debug, Error)]
pub enum GitServiceError {
    #[error(transparent)]
    GitCli(#[from] GitCliError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("working copy already exists at {0}")]
    WorktreeExists(PathBuf),
    #[error("working copy missing at {0}")]
    WorktreeMissing(PathBuf),
    #[error("{0}")]
    RebaseRequired(String),
}

/// Location of one session's isolated working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
}

/// Diff statistics against the mainline divergence point. All-zero (with an
/// empty summary) when the working copy has no changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct GitService {
    repo_path: PathBuf,
    worktree_root: PathBuf,
    main_branch: String,
    remote: String,
    git: GitCli,
}

impl GitService {
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_root: impl Into<PathBuf>,
        main_branch: impl Into<String>,
        remote: impl Into<String>,
    ) -> Self {
        Self {
            repo_path: repo_path.into(),
            worktree_root: worktree_root.into(),
            main_branch: main_branch.into(),
            remote: remote.into(),
            git: GitCli::new(),
        }
    }

    pub fn worktree_path(&self, session_id: &str) -> PathBuf {
        self.worktree_root.join(session_id)
    }

    /// Whether a session still has a working copy on disk. Used by zombie
    /// reconciliation to decide if partial work is recoverable.
    pub fn worktree_exists(&self, session_id: &str) -> bool {
        self.worktree_path(session_id).exists()
    }

    /// Create the session's branch and working copy from the freshest
    /// mainline. The fetch is best-effort: an unreachable remote degrades to
    /// the local mainline rather than failing the session.
    pub fn create_worktree(
        &self,
        branch: &str,
        session_id: &str,
    ) -> Result<WorktreeInfo, GitServiceError> {
        let path = self.worktree_path(session_id);
        if path.exists() {
            return Err(GitServiceError::WorktreeExists(path));
        }
        std::fs::create_dir_all(&self.worktree_root)?;

        if let Err(e) = self
            .git
            .fetch_branch(&self.repo_path, &self.remote, &self.main_branch)
        {
            tracing::warn!(
                "fetch of {}/{} failed, falling back to local mainline: {e}",
                self.remote,
                self.main_branch
            );
        }
        let base = self.freshest_mainline_ref(&self.repo_path);
        self.git.worktree_add(&self.repo_path, &path, branch, &base)?;

        Ok(WorktreeInfo {
            path,
            branch: branch.to_string(),
        })
    }

    /// Diff statistics for the working copy (committed and uncommitted)
    /// against its divergence point from the mainline.
    pub fn diff_stats(&self, path: &Path) -> Result<DiffStats, GitServiceError> {
        let base = self.divergence_base(path)?;
        let entries = self.git.diff_numstat(path, &base)?;
        let summary = self.git.diff_shortstat(path, &base)?;
        let (insertions, deletions) = entries
            .iter()
            .fold((0, 0), |(i, d), (ins, del, _)| (i + ins, d + del));
        Ok(DiffStats {
            files_changed: entries.len(),
            insertions: insertions as usize,
            deletions: deletions as usize,
            summary,
        })
    }

    /// Paths touched since divergence from the mainline.
    pub fn changed_files(&self, path: &Path) -> Result<Vec<String>, GitServiceError> {
        let base = self.divergence_base(path)?;
        Ok(self.git.diff_name_only(path, &base)?)
    }

    /// Commit log since divergence from the mainline, oldest last.
    pub fn commit_log(&self, path: &Path) -> Result<String, GitServiceError> {
        let base = self.divergence_base(path)?;
        Ok(self.git.log_oneline(path, &format!("{base}..HEAD"))?)
    }

    /// Fast-forward the mainline to the session branch, then clean up the
    /// working copy and branch. Never attempts a three-way merge: a mainline
    /// that has advanced past the branch point is the caller's to rebase.
    pub fn merge(&self, path: &Path, branch: &str) -> Result<(), GitServiceError> {
        if !self.git.is_ancestor(&self.repo_path, &self.main_branch, branch)? {
            return Err(GitServiceError::RebaseRequired(format!(
                "cannot fast-forward {} to {branch}: the mainline has commits not on the session branch; rebase the session branch onto {} and retry",
                self.main_branch, self.main_branch
            )));
        }
        self.git.checkout(&self.repo_path, &self.main_branch)?;
        self.git.merge_ff_only(&self.repo_path, branch)?;
        self.cleanup(path, branch);
        Ok(())
    }

    /// Best-effort, idempotent removal of the working copy and its branch,
    /// forcing through uncommitted changes. Used after merges and on error
    /// paths that do not preserve partial work.
    pub fn cleanup(&self, path: &Path, branch: &str) {
        if path.exists() {
            if let Err(e) = self.git.worktree_remove(&self.repo_path, path, true) {
                tracing::warn!("failed to remove worktree {}: {e}", path.display());
                let _ = std::fs::remove_dir_all(path);
            }
        }
        let _ = self.git.worktree_prune(&self.repo_path);
        if let Err(e) = self.git.branch_delete(&self.repo_path, branch) {
            tracing::debug!("branch {branch} not deleted: {e}");
        }
    }

    /// Push the session branch to the remote (autopilot pushing phase).
    pub fn push_branch(&self, path: &Path, branch: &str) -> Result<(), GitServiceError> {
        if !path.exists() {
            return Err(GitServiceError::WorktreeMissing(path.to_path_buf()));
        }
        Ok(self.git.push(path, &self.remote, branch)?)
    }

    /// The freshest mainline reference visible from `repo`: the
    /// remote-tracking ref when it exists, the local branch otherwise.
    fn freshest_mainline_ref(&self, repo: &Path) -> String {
        let remote_ref = format!("refs/remotes/{}/{}", self.remote, self.main_branch);
        if self.git.rev_parse_verify(repo, &remote_ref) {
            remote_ref
        } else {
            self.main_branch.clone()
        }
    }

    fn divergence_base(&self, path: &Path) -> Result<String, GitServiceError> {
        if !path.exists() {
            return Err(GitServiceError::WorktreeMissing(path.to_path_buf()));
        }
        let mainline = self.freshest_mainline_ref(path);
        Ok(self.git.merge_base(path, &mainline, "HEAD")?)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, process::Command};

    use tempfile::TempDir;

    use super::*;

    fn init_repo(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            let out = Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .unwrap();
            assert!(out.status.success());
        }
        fs::write(dir.join("README.md"), "# readme\n").unwrap();
        commit_all(dir, "Initial commit");
    }

    fn commit_all(dir: &Path, message: &str) {
        for args in [vec!["add", "-A"], vec!["commit", "-m", message]] {
            let out = Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .unwrap();
            assert!(out.status.success(), "git {args:?} failed");
        }
    }

    fn service(temp: &TempDir) -> GitService {
        let repo = temp.path().join("repo");
        init_repo(&repo);
        GitService::new(repo, temp.path().join("worktrees"), "main", "origin")
    }

    #[test]
    fn fresh_worktree_has_zero_diff_stats() {
        let temp = TempDir::new().unwrap();
        let git = service(&temp);
        let info = git.create_worktree("agent/s1", "s1").unwrap();

        let stats = git.diff_stats(&info.path).unwrap();
        assert_eq!(stats.files_changed, 0);
        assert_eq!(stats.insertions, 0);
        assert_eq!(stats.deletions, 0);
        assert!(stats.summary.is_empty());
        assert!(git.changed_files(&info.path).unwrap().is_empty());
        assert!(git.commit_log(&info.path).unwrap().is_empty());
    }

    #[test]
    fn duplicate_session_worktree_is_rejected() {
        let temp = TempDir::new().unwrap();
        let git = service(&temp);
        git.create_worktree("agent/s1", "s1").unwrap();
        let err = git.create_worktree("agent/s1-b", "s1").unwrap_err();
        assert!(matches!(err, GitServiceError::WorktreeExists(_)));
    }

    #[test]
    fn uncommitted_edits_show_up_in_stats_and_files() {
        let temp = TempDir::new().unwrap();
        let git = service(&temp);
        let info = git.create_worktree("agent/s2", "s2").unwrap();

        fs::write(info.path.join("README.md"), "# readme\nmore\n").unwrap();
        let stats = git.diff_stats(&info.path).unwrap();
        assert_eq!(stats.files_changed, 1);
        assert_eq!(stats.insertions, 1);
        assert_eq!(stats.deletions, 0);
        assert!(stats.summary.contains("1 file changed"));
        assert_eq!(git.changed_files(&info.path).unwrap(), vec!["README.md"]);
    }

    #[test]
    fn commit_log_covers_divergence_only() {
        let temp = TempDir::new().unwrap();
        let git = service(&temp);
        let info = git.create_worktree("agent/s3", "s3").unwrap();

        fs::write(info.path.join("new.txt"), "data\n").unwrap();
        commit_all(&info.path, "session work");

        let log = git.commit_log(&info.path).unwrap();
        assert!(log.contains("session work"));
        assert!(!log.contains("Initial commit"));
    }

    #[test]
    fn cleanup_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let git = service(&temp);
        let info = git.create_worktree("agent/s4", "s4").unwrap();
        // Dirty the worktree so cleanup has to force through it.
        fs::write(info.path.join("scratch.txt"), "uncommitted\n").unwrap();

        git.cleanup(&info.path, &info.branch);
        assert!(!info.path.exists());
        // Second call must not panic or error.
        git.cleanup(&info.path, &info.branch);
        assert!(!git.worktree_exists("s4"));
    }

    #[test]
    fn merge_fast_forwards_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let git = service(&temp);
        let repo = temp.path().join("repo");
        let info = git.create_worktree("agent/s5", "s5").unwrap();

        fs::write(info.path.join("feature.txt"), "feature\n").unwrap();
        commit_all(&info.path, "feature work");

        git.merge(&info.path, &info.branch).unwrap();

        assert!(repo.join("feature.txt").exists());
        assert!(!info.path.exists());
        assert!(!GitCli::new().rev_parse_verify(&repo, "agent/s5"));
    }

    #[test]
    fn diverged_mainline_demands_a_rebase() {
        let temp = TempDir::new().unwrap();
        let git = service(&temp);
        let repo = temp.path().join("repo");
        let info = git.create_worktree("agent/s6", "s6").unwrap();

        fs::write(info.path.join("feature.txt"), "feature\n").unwrap();
        commit_all(&info.path, "feature work");

        // Mainline advances behind the session's back.
        fs::write(repo.join("hotfix.txt"), "hotfix\n").unwrap();
        commit_all(&repo, "hotfix on main");

        let err = git.merge(&info.path, &info.branch).unwrap_err();
        assert!(matches!(err, GitServiceError::RebaseRequired(_)));
        assert!(err.to_string().contains("rebase"));
        // No fallback merge happened: the worktree and branch survive.
        assert!(info.path.exists());
        assert!(!repo.join("feature.txt").exists());
    }

    #[test]
    fn worktree_base_prefers_the_remote_tracking_ref() {
        let temp = TempDir::new().unwrap();
        let upstream = temp.path().join("upstream");
        init_repo(&upstream);

        // Clone, then advance the upstream so the clone's local main is stale.
        let clone = temp.path().join("clone");
        let out = Command::new("git")
            .args([
                "clone",
                upstream.to_str().unwrap(),
                clone.to_str().unwrap(),
            ])
            .output()
            .unwrap();
        assert!(out.status.success());
        fs::write(upstream.join("fresh.txt"), "fresh\n").unwrap();
        commit_all(&upstream, "fresh upstream commit");

        let git = GitService::new(clone.clone(), temp.path().join("wts"), "main", "origin");
        let info = git.create_worktree("agent/s7", "s7").unwrap();

        // The worktree was cut from origin/main, which the create fetched.
        assert!(info.path.join("fresh.txt").exists());
    }
}
