//! Thin subprocess layer over the `git` binary.
//!
//! Every invocation uses an explicit argument vector (never a shell), and the
//! network-touching commands run with `GIT_TERMINAL_PROMPT=0` so a credential
//! prompt can never wedge the orchestrator. Working-tree mutations go through
//! the CLI on purpose: it refuses to clobber uncommitted changes unless
//! explicitly forced, which is exactly the protection worktree cleanup relies
//! on when it *does* force.

use std::{
    ffi::{OsStr, OsString},
    path::Path,
    process::{Command, Stdio},
};

use thiserror::Error;
use utils::shell::resolve_executable_path;

#[derive(Debug, Error)]
pub enum GitCliError {
    #[error("git executable not found or not runnable")]
    NotAvailable,
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("branch or reference not found: {0}")]
    InvalidReference(String),
}

#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self {}
    }

    /// `git worktree add -b <branch> <path> <base>`
    pub fn worktree_add(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), GitCliError> {
        let args: Vec<OsString> = vec![
            "worktree".into(),
            "add".into(),
            "-b".into(),
            OsString::from(branch),
            worktree_path.as_os_str().into(),
            OsString::from(base),
        ];
        self.git(repo_path, args)?;
        Ok(())
    }

    /// `git worktree remove [--force] <path>`
    pub fn worktree_remove(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        force: bool,
    ) -> Result<(), GitCliError> {
        let mut args: Vec<OsString> = vec!["worktree".into(), "remove".into()];
        if force {
            args.push("--force".into());
        }
        args.push(worktree_path.as_os_str().into());
        self.git(repo_path, args)?;
        Ok(())
    }

    /// Prune stale worktree metadata.
    pub fn worktree_prune(&self, repo_path: &Path) -> Result<(), GitCliError> {
        self.git(repo_path, ["worktree", "prune"])?;
        Ok(())
    }

    /// `git branch -D <branch>`
    pub fn branch_delete(&self, repo_path: &Path, branch: &str) -> Result<(), GitCliError> {
        self.git(repo_path, ["branch", "-D", branch])?;
        Ok(())
    }

    /// Fetch one branch from a remote. Never prompts for credentials.
    pub fn fetch_branch(
        &self,
        repo_path: &Path,
        remote: &str,
        branch: &str,
    ) -> Result<(), GitCliError> {
        let envs = [(OsString::from("GIT_TERMINAL_PROMPT"), OsString::from("0"))];
        self.git_with_env(repo_path, ["fetch", remote, branch], &envs)?;
        Ok(())
    }

    /// Push a branch to a remote. Never prompts for credentials.
    pub fn push(&self, repo_path: &Path, remote: &str, branch: &str) -> Result<(), GitCliError> {
        let envs = [(OsString::from("GIT_TERMINAL_PROMPT"), OsString::from("0"))];
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        self.git_with_env(repo_path, ["push", remote, refspec.as_str()], &envs)?;
        Ok(())
    }

    /// True when `refname` resolves in the repository.
    pub fn rev_parse_verify(&self, repo_path: &Path, refname: &str) -> bool {
        let spec = format!("{refname}^{{commit}}");
        self.git(repo_path, ["rev-parse", "--verify", "--quiet", spec.as_str()])
            .is_ok()
    }

    /// Merge base of two commits, e.g. a session branch and the mainline.
    pub fn merge_base(&self, repo_path: &Path, a: &str, b: &str) -> Result<String, GitCliError> {
        let out = self.git(repo_path, ["merge-base", a, b])?;
        Ok(out.trim().to_string())
    }

    /// True when `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(
        &self,
        repo_path: &Path,
        ancestor: &str,
        descendant: &str,
    ) -> Result<bool, GitCliError> {
        // Exit code 1 is the documented "no" answer, not a failure.
        let git = resolve_executable_path("git").ok_or(GitCliError::NotAvailable)?;
        let out = Command::new(git)
            .arg("-C")
            .arg(repo_path)
            .args(["merge-base", "--is-ancestor", ancestor, descendant])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| GitCliError::CommandFailed(e.to_string()))?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(GitCliError::CommandFailed(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            )),
        }
    }

    /// `git diff --numstat <base>` parsed into (insertions, deletions, path).
    /// Binary files report `-` counts and contribute zero lines.
    pub fn diff_numstat(
        &self,
        worktree_path: &Path,
        base: &str,
    ) -> Result<Vec<(u64, u64, String)>, GitCliError> {
        let out = self.git(worktree_path, ["diff", "--numstat", base])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            let mut parts = line.split('\t');
            let (Some(ins), Some(del), Some(path)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            entries.push((
                ins.parse().unwrap_or(0),
                del.parse().unwrap_or(0),
                path.to_string(),
            ));
        }
        Ok(entries)
    }

    /// One-line `git diff --shortstat <base>` summary; empty when clean.
    pub fn diff_shortstat(&self, worktree_path: &Path, base: &str) -> Result<String, GitCliError> {
        let out = self.git(worktree_path, ["diff", "--shortstat", base])?;
        Ok(out.trim().to_string())
    }

    /// Paths touched since `base`, one per line.
    pub fn diff_name_only(
        &self,
        worktree_path: &Path,
        base: &str,
    ) -> Result<Vec<String>, GitCliError> {
        let out = self.git(worktree_path, ["diff", "--name-only", base])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// `git log --oneline <range>`.
    pub fn log_oneline(&self, worktree_path: &Path, range: &str) -> Result<String, GitCliError> {
        let out = self.git(worktree_path, ["log", "--oneline", range])?;
        Ok(out.trim().to_string())
    }

    /// `git checkout <branch>`
    pub fn checkout(&self, repo_path: &Path, branch: &str) -> Result<(), GitCliError> {
        self.git(repo_path, ["checkout", branch])?;
        Ok(())
    }

    /// `git merge --ff-only <branch>` onto the current branch.
    pub fn merge_ff_only(&self, repo_path: &Path, branch: &str) -> Result<(), GitCliError> {
        self.git(repo_path, ["merge", "--ff-only", branch])?;
        Ok(())
    }

    /// True when the working tree has staged or unstaged changes.
    pub fn has_changes(&self, worktree_path: &Path) -> Result<bool, GitCliError> {
        let out = self.git(
            worktree_path,
            ["--no-optional-locks", "status", "--porcelain"],
        )?;
        Ok(!out.trim().is_empty())
    }

    /// Run `git -C <repo_path> <args...>` and return stdout on success.
    /// Prefer the dedicated helpers above so command choices and parsing stay
    /// centralized; call this directly only in tests.
    pub fn git<I, S>(&self, repo_path: &Path, args: I) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.git_with_env(repo_path, args, &[])
    }

    fn git_with_env<I, S>(
        &self,
        repo_path: &Path,
        args: I,
        envs: &[(OsString, OsString)],
    ) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let git = resolve_executable_path("git").ok_or(GitCliError::NotAvailable)?;
        let mut cmd = Command::new(git);
        cmd.arg("-C").arg(repo_path);
        for (k, v) in envs {
            cmd.env(k, v);
        }
        for a in args {
            cmd.arg(a);
        }
        cmd.stdin(Stdio::null());

        tracing::trace!(repo = ?repo_path, "running git command: {:?}", cmd);

        let out = cmd
            .output()
            .map_err(|e| GitCliError::CommandFailed(e.to_string()))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
            let combined = match (stdout.is_empty(), stderr.is_empty()) {
                (true, true) => "command failed with no output".to_string(),
                (false, false) => format!("--- stderr\n{stderr}\n--- stdout\n{stdout}"),
                (true, false) => format!("--- stderr\n{stderr}"),
                (false, true) => format!("--- stdout\n{stdout}"),
            };
            if combined.contains("invalid reference:")
                || combined.contains("not a valid ref")
                || combined.contains("unknown revision")
            {
                return Err(GitCliError::InvalidReference(combined));
            }
            return Err(GitCliError::CommandFailed(combined));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }
}
