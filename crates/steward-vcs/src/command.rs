//! Git command execution
//!
//! One required method (`exec`) runs a raw git invocation; the typed
//! helpers layered on top build the argument lists the checkpoint verbs
//! need and map failures to errors that keep the subcommand and exit code.
//! Probes that are allowed to fail (`rev-parse` during repo detection) go
//! through `exec` directly.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Output;
use steward_core::{Result, StewardError};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Exit code git uses for fatal usage errors, "not a repository" included
const FATAL_EXIT: i32 = 128;

/// Output from a git command
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: Option<i32>,
}

impl GitOutput {
    /// Successful output with the given stdout (test helper)
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
            exit_code: Some(0),
        }
    }

    /// Failed output with the given stderr (test helper)
    pub fn err(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
            exit_code: Some(1),
        }
    }

    /// Non-empty, trimmed lines of stdout
    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    }

    /// Turn a failed invocation into a typed error naming the subcommand
    /// and the exit code
    pub fn expect_success(self, verb: &str) -> Result<GitOutput> {
        if self.success {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let message = match self.exit_code {
            Some(FATAL_EXIT) if detail.contains("not a git repository") => {
                format!("git {}: not inside a repository", verb)
            }
            Some(code) => format!("git {} failed (exit {}): {}", verb, code, detail),
            None => format!("git {} killed by a signal: {}", verb, detail),
        };
        Err(StewardError::GitCommand(message))
    }
}

impl From<Output> for GitOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            exit_code: output.status.code(),
        }
    }
}

/// Trait for executing git commands (allows mocking in tests)
#[async_trait]
pub trait GitExecutor: Send + Sync {
    /// Execute a raw git command; a non-zero exit is NOT an `Err` here
    async fn exec(&self, args: &[&str]) -> Result<GitOutput>;

    /// Get the repository root
    fn repo_root(&self) -> &PathBuf;

    /// `git add -A`
    async fn add_all(&self) -> Result<()> {
        self.exec(&["add", "-A"]).await?.expect_success("add")?;
        Ok(())
    }

    /// `git commit -m <message>`; the raw output comes back so callers can
    /// tolerate "nothing to commit"
    async fn commit(&self, message: &str, allow_empty: bool) -> Result<GitOutput> {
        if allow_empty {
            self.exec(&["commit", "--allow-empty", "-m", message]).await
        } else {
            self.exec(&["commit", "-m", message]).await
        }
    }

    /// `git tag <name>`
    async fn tag(&self, name: &str) -> Result<()> {
        self.exec(&["tag", name]).await?.expect_success("tag")?;
        Ok(())
    }

    /// `git reset --hard <rev>`
    async fn reset_hard(&self, rev: &str) -> Result<()> {
        self.exec(&["reset", "--hard", rev])
            .await?
            .expect_success("reset")?;
        Ok(())
    }

    /// `git clean -fd`
    async fn clean_untracked(&self) -> Result<()> {
        self.exec(&["clean", "-fd"]).await?.expect_success("clean")?;
        Ok(())
    }

    /// `git status --porcelain`, raw stdout
    async fn status_porcelain(&self) -> Result<String> {
        let out = self
            .exec(&["status", "--porcelain"])
            .await?
            .expect_success("status")?;
        Ok(out.stdout)
    }

    /// Tracked files differing from `rev`
    async fn diff_names(&self, rev: &str) -> Result<Vec<String>> {
        let out = self
            .exec(&["diff", "--name-only", rev])
            .await?
            .expect_success("diff")?;
        Ok(out.stdout_lines())
    }

    /// Untracked files not covered by ignore rules
    async fn untracked_files(&self) -> Result<Vec<String>> {
        let out = self
            .exec(&["ls-files", "--others", "--exclude-standard"])
            .await?
            .expect_success("ls-files")?;
        Ok(out.stdout_lines())
    }

    /// Files currently staged
    async fn staged_names(&self) -> Result<Vec<String>> {
        let out = self
            .exec(&["diff", "--cached", "--name-only"])
            .await?
            .expect_success("diff")?;
        Ok(out.stdout_lines())
    }
}

/// Real git command executor
#[derive(Clone)]
pub struct GitCommand {
    repo_root: PathBuf,
}

impl GitCommand {
    /// Create a new git command executor for the given repository
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }
}

#[async_trait]
impl GitExecutor for GitCommand {
    #[instrument(skip(self), fields(repo = %self.repo_root.display()))]
    async fn exec(&self, args: &[&str]) -> Result<GitOutput> {
        debug!("Executing git {:?}", args);

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|e| StewardError::GitCommand(format!("Failed to execute git: {}", e)))?;

        let git_output = GitOutput::from(output);

        if !git_output.success {
            debug!("Git command failed: {}", git_output.stderr);
        }

        Ok(git_output)
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}

/// Mock git executor for testing
#[derive(Clone)]
pub struct MockGitExecutor {
    repo_root: PathBuf,
    responses: std::collections::HashMap<String, GitOutput>,
}

impl Default for MockGitExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGitExecutor {
    pub fn new() -> Self {
        Self {
            repo_root: PathBuf::from("/mock/repo"),
            responses: std::collections::HashMap::new(),
        }
    }

    pub fn with_response(mut self, command: &str, output: GitOutput) -> Self {
        self.responses.insert(command.to_string(), output);
        self
    }
}

#[async_trait]
impl GitExecutor for MockGitExecutor {
    async fn exec(&self, args: &[&str]) -> Result<GitOutput> {
        let key = args.join(" ");
        self.responses
            .get(&key)
            .cloned()
            .ok_or_else(|| StewardError::GitCommand(format!("No mock response for: {}", key)))
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_executor() {
        let executor = MockGitExecutor::new()
            .with_response("status --porcelain", GitOutput::ok(" M src/lib.rs\n"));

        let output = executor.exec(&["status", "--porcelain"]).await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, " M src/lib.rs\n");
    }

    #[tokio::test]
    async fn test_mock_missing_response_errors() {
        let executor = MockGitExecutor::new();
        assert!(executor.exec(&["log"]).await.is_err());
    }

    #[tokio::test]
    async fn test_typed_helper_builds_the_expected_invocation() {
        let executor = MockGitExecutor::new()
            .with_response("reset --hard v1", GitOutput::ok("HEAD is now at abc"));
        executor.reset_hard("v1").await.unwrap();
    }

    #[test]
    fn test_failure_mapping_keeps_verb_and_exit_code() {
        let err = GitOutput::err("pathspec did not match")
            .expect_success("tag")
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("git tag failed (exit 1)"), "got: {}", msg);
        assert!(msg.contains("pathspec did not match"));
    }

    #[test]
    fn test_fatal_exit_reports_missing_repository() {
        let fatal = GitOutput {
            stdout: String::new(),
            stderr: "fatal: not a git repository (or any parent)".to_string(),
            success: false,
            exit_code: Some(128),
        };
        let msg = fatal.expect_success("status").unwrap_err().to_string();
        assert!(msg.contains("not inside a repository"), "got: {}", msg);
    }

    #[test]
    fn test_stdout_lines_drops_blanks() {
        let out = GitOutput::ok("a.rs\n\n  b.rs  \n");
        assert_eq!(out.stdout_lines(), vec!["a.rs", "b.rs"]);
    }
}
