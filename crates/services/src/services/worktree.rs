//! Durable history for environments: a bare git store separate from the
//! user's repository, one branch and one on-disk worktree per environment.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWrite;

use crate::services::{
    environment::STATE_DIR_NAME,
    git::{GitCli, GitCliError},
};

/// Store branches are prefixed so a checkout in the source repository never
/// collides with user branches.
pub const BRANCH_PREFIX: &str = "cu-";
/// Remote name registered in the source repository. Its refspec maps
/// `cu-<id>` store branches onto `container-use/<id>` tracking refs, which is
/// the form users see.
pub const REMOTE_NAME: &str = "container-use";

const COMMIT_AUTHOR_ARGS: [&str; 4] = [
    "-c",
    "user.name=container-use",
    "-c",
    "user.email=agent@container-use.local",
];

pub fn branch_name(env_id: &str) -> String {
    format!("{BRANCH_PREFIX}{env_id}")
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git ref not found: {0}")]
    RefNotFound(String),
    #[error("environment not found: {0}")]
    EnvNotFound(String),
    #[error(transparent)]
    Git(#[from] GitCliError),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WorktreeStore {
    source_path: PathBuf,
    store_dir: PathBuf,
    worktrees_dir: PathBuf,
    git: GitCli,
}

impl WorktreeStore {
    /// Open (creating if absent) the store for `source_path` under
    /// `state_dir`, refresh objects from the source, and make sure the source
    /// knows the store as the `container-use` remote.
    pub async fn init(state_dir: &Path, source_path: &Path) -> Result<Self, WorktreeError> {
        let store_dir = state_dir.join("repos").join(store_name(source_path));
        let worktrees_dir = state_dir.join("worktrees");
        tokio::fs::create_dir_all(&store_dir).await?;
        tokio::fs::create_dir_all(&worktrees_dir).await?;

        let git = GitCli::new(&store_dir);
        if !store_dir.join("HEAD").exists() {
            git.run(&["init", "--bare"]).await?;
        }

        let source = source_path.to_string_lossy();
        if !git.run_ok(&["remote", "add", "origin", &source]).await? {
            git.run(&["remote", "set-url", "origin", &source]).await?;
        }
        // Share commit objects with the source so branches can start at any
        // of its commits.
        git.run(&[
            "fetch",
            "--no-tags",
            "origin",
            "+refs/heads/*:refs/remotes/origin/*",
        ])
        .await?;

        let store = Self {
            source_path: source_path.to_path_buf(),
            store_dir,
            worktrees_dir,
            git,
        };
        store.ensure_source_remote().await?;
        Ok(store)
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn worktree_path(&self, env_id: &str) -> PathBuf {
        self.worktrees_dir.join(env_id)
    }

    async fn ensure_source_remote(&self) -> Result<(), WorktreeError> {
        let source_git = GitCli::new(&self.source_path);
        let store = self.store_dir.to_string_lossy();
        if !source_git
            .run_ok(&["remote", "add", REMOTE_NAME, &store])
            .await?
        {
            source_git
                .run(&["remote", "set-url", REMOTE_NAME, &store])
                .await?;
        }
        source_git
            .run(&[
                "config",
                &format!("remote.{REMOTE_NAME}.fetch"),
                &format!("+refs/heads/{BRANCH_PREFIX}*:refs/remotes/{REMOTE_NAME}/*"),
            ])
            .await?;
        Ok(())
    }

    pub async fn branch_exists(&self, env_id: &str) -> Result<bool, WorktreeError> {
        let branch = branch_name(env_id);
        Ok(self
            .git
            .run_ok(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])
            .await?)
    }

    pub async fn branch_tip(&self, env_id: &str) -> Result<String, WorktreeError> {
        let branch = branch_name(env_id);
        let oid = self.git.run(&["rev-parse", &branch]).await?;
        Ok(oid.trim().to_string())
    }

    /// Create branch `cu-<env_id>` at `base_commit` and materialize its
    /// worktree. `base_commit` must already be resolved against the source.
    pub async fn create_branch(
        &self,
        env_id: &str,
        base_commit: &str,
    ) -> Result<PathBuf, WorktreeError> {
        let branch = branch_name(env_id);
        self.git.run(&["branch", &branch, base_commit]).await?;
        let path = self.worktree_path(env_id);
        self.git
            .run(&["worktree", "add", &path.to_string_lossy(), &branch])
            .await?;
        Ok(path)
    }

    /// Return the worktree directory for an environment, re-materializing it
    /// if it was cleaned up. Fails with `EnvNotFound` for unknown ids.
    pub async fn open_worktree(&self, env_id: &str) -> Result<PathBuf, WorktreeError> {
        if !self.branch_exists(env_id).await? {
            return Err(WorktreeError::EnvNotFound(env_id.to_string()));
        }
        let path = self.worktree_path(env_id);
        if !path.exists() {
            let branch = branch_name(env_id);
            self.git.run_ok(&["worktree", "prune"]).await?;
            self.git
                .run(&["worktree", "add", &path.to_string_lossy(), &branch])
                .await?;
        }
        Ok(path)
    }

    pub async fn list_env_ids(&self) -> Result<Vec<String>, WorktreeError> {
        let out = self
            .git
            .run(&[
                "for-each-ref",
                "--format=%(refname:short)",
                &format!("refs/heads/{BRANCH_PREFIX}*"),
            ])
            .await?;
        Ok(out
            .lines()
            .filter_map(|line| line.trim().strip_prefix(BRANCH_PREFIX))
            .map(|id| id.to_string())
            .collect())
    }

    /// Read a file from the branch tip without touching the worktree.
    pub async fn show_file(&self, env_id: &str, path: &str) -> Result<String, WorktreeError> {
        if !self.branch_exists(env_id).await? {
            return Err(WorktreeError::EnvNotFound(env_id.to_string()));
        }
        let branch = branch_name(env_id);
        Ok(self.git.run(&["show", &format!("{branch}:{path}")]).await?)
    }

    /// Mirror `tree` into the environment's worktree: copy everything over,
    /// then drop worktree entries that no longer exist in `tree`. Paths under
    /// `excludes` (registered submodules) and the metadata directory are
    /// never written or deleted, so container writes into submodules vanish
    /// here instead of reaching the history or the host.
    pub async fn sync_tree(
        &self,
        env_id: &str,
        tree: &Path,
        excludes: &[PathBuf],
    ) -> Result<(), WorktreeError> {
        let worktree = self.open_worktree(env_id).await?;
        let tree = tree.to_path_buf();
        let worktree_clone = worktree.clone();
        let excludes = excludes.to_vec();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let skip = |rel: &Path| is_reserved(rel) || under_any(rel, &excludes);
            copy_tree(&tree, &worktree_clone, &skip)?;
            remove_stale(&tree, &worktree_clone, &skip)?;
            Ok(())
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;
        Ok(())
    }

    /// Mirror a single path from `tree` into the worktree (copy or delete).
    pub async fn sync_path(
        &self,
        env_id: &str,
        tree: &Path,
        rel: &Path,
    ) -> Result<(), WorktreeError> {
        let worktree = self.open_worktree(env_id).await?;
        let src = tree.join(rel);
        let dst = worktree.join(rel);
        if src.exists() {
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&src, &dst).await?;
        } else if dst.exists() {
            tokio::fs::remove_file(&dst).await?;
        }
        Ok(())
    }

    pub async fn has_changes(&self, env_id: &str) -> Result<bool, WorktreeError> {
        let worktree = self.open_worktree(env_id).await?;
        let status = GitCli::new(&worktree).status_porcelain().await?;
        Ok(!status.trim().is_empty())
    }

    /// Stage everything in the worktree and commit. Callers are expected to
    /// have checked `has_changes` first; committing with a clean tree fails.
    pub async fn commit_all(&self, env_id: &str, message: &str) -> Result<(), WorktreeError> {
        let worktree = self.open_worktree(env_id).await?;
        let git = GitCli::new(&worktree);
        git.run(&["add", "-A"]).await?;
        let mut args: Vec<&str> = COMMIT_AUTHOR_ARGS.to_vec();
        args.extend(["commit", "-m", message]);
        git.run(&args).await?;
        Ok(())
    }

    pub async fn log(
        &self,
        env_id: &str,
        with_patches: bool,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), WorktreeError> {
        if !self.branch_exists(env_id).await? {
            return Err(WorktreeError::EnvNotFound(env_id.to_string()));
        }
        let branch = branch_name(env_id);
        let mut args = vec!["log"];
        if with_patches {
            args.push("--patch");
        }
        args.push(&branch);
        args.push("--");
        self.git.stream(&args, sink).await?;
        Ok(())
    }

    pub async fn diff(
        &self,
        env_id: &str,
        base_commit: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), WorktreeError> {
        if !self.branch_exists(env_id).await? {
            return Err(WorktreeError::EnvNotFound(env_id.to_string()));
        }
        let branch = branch_name(env_id);
        let range = format!("{base_commit}..{branch}");
        self.git.stream(&["diff", &range], sink).await?;
        Ok(())
    }

    /// Remove the worktree and branch. Idempotent: deleting an unknown
    /// environment is a no-op.
    pub async fn delete(&self, env_id: &str) -> Result<(), WorktreeError> {
        let path = self.worktree_path(env_id);
        self.git
            .run_ok(&["worktree", "remove", "--force", &path.to_string_lossy()])
            .await?;
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }
        self.git.run_ok(&["worktree", "prune"]).await?;
        self.git
            .run_ok(&["branch", "-D", &branch_name(env_id)])
            .await?;
        Ok(())
    }
}

/// Stable per-source directory name: the path flattened into one component.
fn store_name(source_path: &Path) -> String {
    source_path
        .to_string_lossy()
        .trim_start_matches(['/', '\\'])
        .replace(['/', '\\', ':'], "-")
}

fn is_reserved(rel: &Path) -> bool {
    matches!(
        rel.components().next(),
        Some(std::path::Component::Normal(name)) if name == ".git" || name == STATE_DIR_NAME
    )
}

fn under_any(rel: &Path, prefixes: &[PathBuf]) -> bool {
    prefixes.iter().any(|prefix| rel.starts_with(prefix))
}

/// Recursively copy `src` into `dst`, skipping relative paths for which
/// `skip` returns true and any `.git` entry.
pub(crate) fn copy_tree(
    src: &Path,
    dst: &Path,
    skip: &dyn Fn(&Path) -> bool,
) -> std::io::Result<()> {
    copy_tree_inner(src, dst, Path::new(""), skip)
}

fn copy_tree_inner(
    src: &Path,
    dst: &Path,
    rel: &Path,
    skip: &dyn Fn(&Path) -> bool,
) -> std::io::Result<()> {
    std::fs::create_dir_all(dst.join(rel))?;
    for entry in std::fs::read_dir(src.join(rel))? {
        let entry = entry?;
        let name = entry.file_name();
        let entry_rel = rel.join(&name);
        if name == ".git" || skip(&entry_rel) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            copy_tree_inner(src, dst, &entry_rel, skip)?;
        } else {
            std::fs::copy(entry.path(), dst.join(&entry_rel))?;
        }
    }
    Ok(())
}

/// Remove entries in `dst` that do not exist in `src`, honoring `skip`.
fn remove_stale(src: &Path, dst: &Path, skip: &dyn Fn(&Path) -> bool) -> std::io::Result<()> {
    remove_stale_inner(src, dst, Path::new(""), skip)
}

fn remove_stale_inner(
    src: &Path,
    dst: &Path,
    rel: &Path,
    skip: &dyn Fn(&Path) -> bool,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dst.join(rel))? {
        let entry = entry?;
        let name = entry.file_name();
        let entry_rel = rel.join(&name);
        if name == ".git" || skip(&entry_rel) {
            continue;
        }
        let in_src = src.join(&entry_rel);
        if entry.file_type()?.is_dir() {
            if in_src.is_dir() {
                remove_stale_inner(src, dst, &entry_rel, skip)?;
            } else {
                std::fs::remove_dir_all(entry.path())?;
            }
        } else if !in_src.exists() {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names_are_prefixed() {
        assert_eq!(branch_name("abc-123"), "cu-abc-123");
    }

    #[test]
    fn store_name_flattens_paths() {
        assert_eq!(
            store_name(Path::new("/home/user/my repo")),
            "home-user-my repo"
        );
    }

    #[test]
    fn copy_and_remove_stale_round_trip() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        std::fs::create_dir_all(src.path().join("sub")).expect("mkdir");
        std::fs::write(src.path().join("a.txt"), "a").expect("write");
        std::fs::write(src.path().join("sub/b.txt"), "b").expect("write");
        std::fs::write(dst.path().join("stale.txt"), "old").expect("write");

        let skip = |_: &Path| false;
        copy_tree(src.path(), dst.path(), &skip).expect("copy");
        remove_stale(src.path(), dst.path(), &skip).expect("remove");

        assert!(dst.path().join("a.txt").exists());
        assert!(dst.path().join("sub/b.txt").exists());
        assert!(!dst.path().join("stale.txt").exists());
    }

    #[test]
    fn sync_skip_predicate_protects_reserved_paths() {
        assert!(is_reserved(Path::new(".git")));
        assert!(is_reserved(Path::new(".container-use/state.json")));
        assert!(!is_reserved(Path::new("src/.gitignore")));
        assert!(under_any(
            Path::new("submodule/x"),
            &[PathBuf::from("submodule")]
        ));
        assert!(!under_any(
            Path::new("submodule-2/x"),
            &[PathBuf::from("submodule")]
        ));
    }
}
