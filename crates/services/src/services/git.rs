//! Git adapter shared by the worktree store and the repository facade.
//!
//! Worktree, fetch, staging and history operations shell out to `git`; ref
//! resolution and submodule enumeration go through libgit2 so they don't pay
//! for a subprocess per query.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    process::Command,
};

#[derive(Debug, Error)]
pub enum GitCliError {
    #[error("git {args} failed: {stderr}")]
    CommandFailed { args: String, stderr: String },
    #[error(transparent)]
    Git(#[from] git2::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wrapper for executing git commands in a fixed working directory.
#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
}

impl GitCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Run a git command, failing on non-zero exit, and capture stdout.
    pub async fn run(&self, args: &[&str]) -> Result<String, GitCliError> {
        let output = self.command(args).output().await?;
        if !output.status.success() {
            return Err(GitCliError::CommandFailed {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a git command and report success as a bool. Used for idempotent
    /// operations where a failure is an acceptable outcome.
    pub async fn run_ok(&self, args: &[&str]) -> Result<bool, GitCliError> {
        let output = self.command(args).output().await?;
        Ok(output.status.success())
    }

    /// Run a git command, streaming its stdout into `sink`.
    pub async fn stream(
        &self,
        args: &[&str],
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), GitCliError> {
        let mut child = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdout) = child.stdout.take() {
            tokio::io::copy(&mut stdout, sink).await?;
        }
        sink.flush().await?;

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(GitCliError::CommandFailed {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Porcelain status of the working tree, including untracked files.
    pub async fn status_porcelain(&self) -> Result<String, GitCliError> {
        self.run(&["status", "--porcelain"]).await
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Resolve a revision against `repo_path` to a full commit id.
pub fn resolve_commit(repo_path: &Path, rev: &str) -> Result<String, git2::Error> {
    let repo = git2::Repository::open(repo_path)?;
    let object = repo.revparse_single(rev)?;
    let commit = object.peel_to_commit()?;
    Ok(commit.id().to_string())
}

/// Enumerate the submodule paths registered in `.gitmodules`, relative to the
/// repository root. Returns an empty list for repositories without submodules.
pub fn submodule_paths(repo_path: &Path) -> Result<Vec<PathBuf>, git2::Error> {
    let repo = git2::Repository::open(repo_path)?;
    Ok(repo
        .submodules()?
        .iter()
        .map(|s| s.path().to_path_buf())
        .collect())
}
