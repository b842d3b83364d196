//! Repository facade: the contract that every successful environment
//! mutation is visible both in the live workdir tree and as a commit on the
//! environment's branch, and that the user's repository is only ever touched
//! by an explicit checkout.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::{io::AsyncWrite, sync::Mutex};
use uuid::Uuid;

use crate::services::{
    config::{self, Config},
    environment::{
        Environment, EnvironmentError, EnvironmentInfo, EnvironmentState, STATE_DIR_NAME,
        STATE_FILE_NAME,
    },
    executor::{ContainerExecutor, ExecutorError},
    git::{self, GitCli, GitCliError},
    worktree::{self, REMOTE_NAME, WorktreeError, WorktreeStore},
};

/// Serializes mutations per environment. Repositories are constructed per
/// request, so the lock table has to outlive them.
static ENV_LOCKS: Lazy<DashMap<String, Arc<Mutex<()>>>> = Lazy::new(DashMap::new);

const FALLBACK_UPDATE_MESSAGE: &str = "Update environment";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("git ref not found: {0}")]
    RefNotFound(String),
    #[error("environment not found: {0}")]
    EnvNotFound(String),
    #[error("source repository has uncommitted changes:\n{0}")]
    DirtyWorkingTree(String),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Git(#[from] GitCliError),
    #[error("invalid environment state: {0}")]
    State(#[from] serde_json::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WorktreeError> for RepositoryError {
    fn from(err: WorktreeError) -> Self {
        match err {
            WorktreeError::RefNotFound(r) => RepositoryError::RefNotFound(r),
            WorktreeError::EnvNotFound(id) => RepositoryError::EnvNotFound(id),
            WorktreeError::Git(e) => RepositoryError::Git(e),
            WorktreeError::Io(e) => RepositoryError::Io(e),
        }
    }
}

pub struct Repository {
    source_path: PathBuf,
    state_dir: PathBuf,
    store: WorktreeStore,
    submodules: Vec<PathBuf>,
    defaults: Config,
}

impl Repository {
    /// Open the repository at `source`, initializing its worktree store under
    /// the user state directory.
    pub async fn open(source: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let state_dir = utils::paths::state_dir();
        Self::open_in(source, &state_dir).await
    }

    /// Like `open` but with an explicit state directory. Tests use this to
    /// keep stores isolated.
    pub async fn open_in(
        source: impl AsRef<Path>,
        state_dir: &Path,
    ) -> Result<Self, RepositoryError> {
        let source_path = tokio::fs::canonicalize(source.as_ref()).await?;
        // Opening the repo also validates that `source` is a git repository.
        let submodules = git::submodule_paths(&source_path).map_err(GitCliError::from)?;
        let store = WorktreeStore::init(state_dir, &source_path).await?;
        let defaults = config::load_config_from_file(&state_dir.join("config.json")).await;
        Ok(Self {
            source_path,
            state_dir: state_dir.to_path_buf(),
            store,
            submodules,
            defaults,
        })
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn submodules(&self) -> &[PathBuf] {
        &self.submodules
    }

    /// Create a new environment branched from `from_git_ref` (default HEAD).
    pub async fn create(
        &self,
        executor: &Arc<dyn ContainerExecutor>,
        title: &str,
        explanation: &str,
        from_git_ref: &str,
    ) -> Result<Environment, RepositoryError> {
        let from_ref = if from_git_ref.is_empty() {
            "HEAD"
        } else {
            from_git_ref
        };
        let base_commit = git::resolve_commit(&self.source_path, from_ref)
            .map_err(|_| RepositoryError::RefNotFound(from_ref.to_string()))?;

        let env_id = Uuid::new_v4().to_string();
        let worktree_path = self.store.create_branch(&env_id, &base_commit).await?;

        let now = Utc::now();
        let state = EnvironmentState {
            title: title.to_string(),
            config: self.defaults.environment_config(),
            created_at: now,
            updated_at: now,
            base_commit,
        };
        self.write_state(&worktree_path, &state).await?;
        let message = if explanation.is_empty() {
            format!("Create environment '{title}'")
        } else {
            explanation.to_string()
        };
        self.store.commit_all(&env_id, &message).await?;

        let info = EnvironmentInfo {
            id: env_id.clone(),
            state,
        };
        let scratch = self.materialize_scratch(&env_id).await?;
        executor.build(&env_id, &info.state.config).await?;

        tracing::info!(env_id = %env_id, "created environment");
        Ok(Environment::new(
            info,
            scratch,
            self.submodules.clone(),
            executor.clone(),
        ))
    }

    /// Load an environment from its branch metadata and rebuild the workdir
    /// tree from the branch tip (skipped when the tip hasn't moved).
    pub async fn get(
        &self,
        executor: &Arc<dyn ContainerExecutor>,
        env_id: &str,
    ) -> Result<Environment, RepositoryError> {
        let info = self.env_info(env_id).await?;
        let scratch = self.materialize_scratch(env_id).await?;
        executor.build(env_id, &info.state.config).await?;
        Ok(Environment::new(
            info,
            scratch,
            self.submodules.clone(),
            executor.clone(),
        ))
    }

    /// Reconcile the environment's workdir tree into its branch. A tree
    /// identical to the branch tip is a no-op and creates no commit.
    pub async fn update(
        &self,
        env: &mut Environment,
        explanation: &str,
    ) -> Result<(), RepositoryError> {
        let env_id = env.id().to_string();
        let result = self.update_inner(env, explanation).await;
        if result.is_err() {
            self.invalidate_scratch(&env_id).await;
        }
        result
    }

    async fn update_inner(
        &self,
        env: &mut Environment,
        explanation: &str,
    ) -> Result<(), RepositoryError> {
        let lock = env_lock(env.id());
        let _guard = lock.lock().await;

        self.store
            .sync_tree(env.id(), env.workdir_tree(), &self.submodules)
            .await?;
        if !self.store.has_changes(env.id()).await? {
            return Ok(());
        }

        env.info.state.updated_at = Utc::now();
        let worktree_path = self.store.open_worktree(env.id()).await?;
        self.write_state(&worktree_path, &env.info.state).await?;
        self.store
            .commit_all(env.id(), commit_message(explanation))
            .await?;
        self.write_head_marker(env.id()).await?;
        Ok(())
    }

    /// `update` scoped to a single file; semantics are otherwise identical.
    pub async fn update_file(
        &self,
        env: &mut Environment,
        target_file: &str,
        explanation: &str,
    ) -> Result<(), RepositoryError> {
        let env_id = env.id().to_string();
        let result = self.update_file_inner(env, target_file, explanation).await;
        if result.is_err() {
            self.invalidate_scratch(&env_id).await;
        }
        result
    }

    async fn update_file_inner(
        &self,
        env: &mut Environment,
        target_file: &str,
        explanation: &str,
    ) -> Result<(), RepositoryError> {
        let rel = env.rel_path(target_file)?;
        if self.submodules.iter().any(|s| rel.starts_with(s)) {
            // Submodule content never reaches the branch.
            return Ok(());
        }

        let lock = env_lock(env.id());
        let _guard = lock.lock().await;

        self.store
            .sync_path(env.id(), env.workdir_tree(), &rel)
            .await?;
        if !self.store.has_changes(env.id()).await? {
            return Ok(());
        }

        env.info.state.updated_at = Utc::now();
        let worktree_path = self.store.open_worktree(env.id()).await?;
        self.write_state(&worktree_path, &env.info.state).await?;
        self.store
            .commit_all(env.id(), commit_message(explanation))
            .await?;
        self.write_head_marker(env.id()).await?;
        Ok(())
    }

    /// Metadata for every environment in the store, in arbitrary order.
    pub async fn list(&self) -> Result<Vec<EnvironmentInfo>, RepositoryError> {
        let ids = self.store.list_env_ids().await?;
        let reads = ids.into_iter().map(|id| async move {
            match self.env_info(&id).await {
                Ok(info) => Some(info),
                Err(err) => {
                    tracing::warn!(env_id = %id, "skipping unreadable environment: {err}");
                    None
                }
            }
        });
        Ok(futures::future::join_all(reads)
            .await
            .into_iter()
            .flatten()
            .collect())
    }

    /// Delete an environment: its containers, worktree, branch, scratch tree
    /// and lock entry. Idempotent.
    pub async fn delete(
        &self,
        executor: &Arc<dyn ContainerExecutor>,
        env_id: &str,
    ) -> Result<(), RepositoryError> {
        if let Err(err) = executor.remove(env_id).await {
            tracing::warn!(env_id = %env_id, "container cleanup failed: {err}");
        }
        self.store.delete(env_id).await?;

        let scratch = self.scratch_dir(env_id);
        if scratch.exists() {
            tokio::fs::remove_dir_all(&scratch).await?;
        }
        let marker = self.head_marker_path(env_id);
        if marker.exists() {
            tokio::fs::remove_file(&marker).await?;
        }
        ENV_LOCKS.remove(env_id);
        tracing::info!(env_id = %env_id, "deleted environment");
        Ok(())
    }

    /// Check out the environment's branch in the source repository so the
    /// user can inspect it with native git tooling. Refuses to clobber a
    /// dirty working tree.
    pub async fn checkout(
        &self,
        env_id: &str,
        target_branch: &str,
    ) -> Result<String, RepositoryError> {
        if !self.store.branch_exists(env_id).await? {
            return Err(RepositoryError::EnvNotFound(env_id.to_string()));
        }

        let source_git = GitCli::new(&self.source_path);
        let status = source_git.status_porcelain().await?;
        if !status.trim().is_empty() {
            return Err(RepositoryError::DirtyWorkingTree(status));
        }

        source_git.run(&["fetch", REMOTE_NAME]).await?;
        let branch = if target_branch.is_empty() {
            worktree::branch_name(env_id)
        } else {
            target_branch.to_string()
        };
        source_git
            .run(&[
                "checkout",
                "-B",
                &branch,
                &format!("refs/remotes/{REMOTE_NAME}/{env_id}"),
            ])
            .await?;
        Ok(branch)
    }

    pub async fn log(
        &self,
        env_id: &str,
        with_patches: bool,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), RepositoryError> {
        self.store.log(env_id, with_patches, sink).await?;
        Ok(())
    }

    pub async fn diff(
        &self,
        env_id: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), RepositoryError> {
        let info = self.env_info(env_id).await?;
        self.store
            .diff(env_id, &info.state.base_commit, sink)
            .await?;
        Ok(())
    }

    /// Whether the source working tree has uncommitted changes, with the
    /// porcelain status for display.
    pub async fn is_dirty(&self) -> Result<(bool, String), RepositoryError> {
        let status = GitCli::new(&self.source_path).status_porcelain().await?;
        let trimmed = status.trim().to_string();
        Ok((!trimmed.is_empty(), trimmed))
    }

    async fn env_info(&self, env_id: &str) -> Result<EnvironmentInfo, RepositoryError> {
        let raw = self
            .store
            .show_file(env_id, &format!("{STATE_DIR_NAME}/{STATE_FILE_NAME}"))
            .await?;
        let state: EnvironmentState = serde_json::from_str(&raw)?;
        Ok(EnvironmentInfo {
            id: env_id.to_string(),
            state,
        })
    }

    fn scratch_dir(&self, env_id: &str) -> PathBuf {
        self.state_dir.join("scratch").join(env_id)
    }

    fn head_marker_path(&self, env_id: &str) -> PathBuf {
        self.state_dir.join("scratch").join(format!("{env_id}.head"))
    }

    async fn write_head_marker(&self, env_id: &str) -> Result<(), RepositoryError> {
        let tip = self.store.branch_tip(env_id).await?;
        tokio::fs::write(self.head_marker_path(env_id), tip).await?;
        Ok(())
    }

    /// Drop the marker so the next `get` rebuilds the workdir tree from the
    /// last committed state instead of trusting a half-reconciled one.
    async fn invalidate_scratch(&self, env_id: &str) {
        let _ = tokio::fs::remove_file(self.head_marker_path(env_id)).await;
    }

    /// Build the environment's workdir tree from the branch tip: the checked
    /// out worktree minus metadata, plus submodule contents copied from the
    /// source so the environment can read them. Skipped when the marker shows
    /// the tree already matches the tip.
    async fn materialize_scratch(&self, env_id: &str) -> Result<PathBuf, RepositoryError> {
        let worktree_path = self.store.open_worktree(env_id).await?;
        let tip = self.store.branch_tip(env_id).await?;
        let scratch = self.scratch_dir(env_id);

        let marker = self.head_marker_path(env_id);
        if scratch.exists()
            && let Ok(recorded) = tokio::fs::read_to_string(&marker).await
            && recorded.trim() == tip
        {
            return Ok(scratch);
        }

        if scratch.exists() {
            tokio::fs::remove_dir_all(&scratch).await?;
        }
        tokio::fs::create_dir_all(&scratch).await?;

        let source = self.source_path.clone();
        let submodules = self.submodules.clone();
        let scratch_clone = scratch.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let skip_reserved = |rel: &Path| {
                matches!(
                    rel.components().next(),
                    Some(std::path::Component::Normal(name))
                        if name == ".git" || name == STATE_DIR_NAME
                )
            };
            worktree::copy_tree(&worktree_path, &scratch_clone, &skip_reserved)?;
            for submodule in &submodules {
                let from = source.join(submodule);
                if from.is_dir() {
                    worktree::copy_tree(&from, &scratch_clone.join(submodule), &|_| false)?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;

        tokio::fs::write(&marker, &tip).await?;
        Ok(scratch)
    }

    async fn write_state(
        &self,
        worktree_path: &Path,
        state: &EnvironmentState,
    ) -> Result<(), RepositoryError> {
        let dir = worktree_path.join(STATE_DIR_NAME);
        tokio::fs::create_dir_all(&dir).await?;
        let raw = serde_json::to_string_pretty(state)?;
        tokio::fs::write(dir.join(STATE_FILE_NAME), raw).await?;
        Ok(())
    }
}

fn commit_message(explanation: &str) -> &str {
    if explanation.trim().is_empty() {
        FALLBACK_UPDATE_MESSAGE
    } else {
        explanation
    }
}

fn env_lock(env_id: &str) -> Arc<Mutex<()>> {
    ENV_LOCKS
        .entry(env_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_message_falls_back_when_empty() {
        assert_eq!(commit_message(""), FALLBACK_UPDATE_MESSAGE);
        assert_eq!(commit_message("   "), FALLBACK_UPDATE_MESSAGE);
        assert_eq!(commit_message("add tests"), "add tests");
    }

    #[test]
    fn env_locks_are_shared_per_id() {
        let a = env_lock("lock-test-env");
        let b = env_lock("lock-test-env");
        assert!(Arc::ptr_eq(&a, &b));
        ENV_LOCKS.remove("lock-test-env");
    }
}
