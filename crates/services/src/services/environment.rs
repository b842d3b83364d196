use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::services::executor::{
    ContainerExecutor, EndpointMappings, ExecutorError, RunRequest,
};

/// Directory at the root of every environment branch holding metadata.
/// Excluded from everything the agent can see or mutate.
pub const STATE_DIR_NAME: &str = ".container-use";
pub const STATE_FILE_NAME: &str = "state.json";

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("cannot write to {0}: path is inside a submodule and submodules are read-only")]
    SubmoduleWriteForbidden(PathBuf),
    #[error(
        "search text matched {count} times (byte offsets {positions:?}); pass which_match to select one"
    )]
    AmbiguousMatch { count: usize, positions: Vec<usize> },
    #[error("search text not found in {0}")]
    SearchTextNotFound(PathBuf),
    #[error("invalid which_match {given:?}: expected a 1-based index no greater than {count}")]
    InvalidWhichMatch { given: String, count: usize },
    #[error("path {0} is outside the environment workdir")]
    PathOutsideWorkdir(PathBuf),
    #[error("service {0} already exists in this environment")]
    ServiceExists(String),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub base_image: String,
    /// Commands executed in order on top of the base image, like `RUN`
    /// instructions in a Dockerfile.
    pub setup_commands: Vec<String>,
    /// `KEY=VALUE` pairs baked into the environment.
    pub env: Vec<String>,
    pub workdir: String,
}

impl EnvironmentConfig {
    /// Deep copy taken before staging mutations, so a rejected update never
    /// aliases into the live config.
    pub fn copy(&self) -> Self {
        self.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub title: String,
    pub config: EnvironmentConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Commit the environment branch was created from; the base for diffs.
    pub base_commit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub id: String,
    pub state: EnvironmentState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub exposed_ports: Vec<u16>,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    #[serde(flatten)]
    pub config: ServiceConfig,
    pub endpoints: EndpointMappings,
}

/// A live environment: metadata plus the workdir tree materialized on disk
/// and the executor that runs commands against it. Constructed by the
/// repository facade; mutations are reconciled back into the environment
/// branch by `Repository::update`/`update_file`.
pub struct Environment {
    pub info: EnvironmentInfo,
    pub services: Vec<Service>,
    workdir_tree: PathBuf,
    submodules: Vec<PathBuf>,
    executor: Arc<dyn ContainerExecutor>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("info", &self.info)
            .field("services", &self.services)
            .field("workdir_tree", &self.workdir_tree)
            .field("submodules", &self.submodules)
            .finish_non_exhaustive()
    }
}

impl Environment {
    pub(crate) fn new(
        info: EnvironmentInfo,
        workdir_tree: PathBuf,
        submodules: Vec<PathBuf>,
        executor: Arc<dyn ContainerExecutor>,
    ) -> Self {
        Self {
            info,
            services: Vec::new(),
            workdir_tree,
            submodules,
            executor,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn workdir_tree(&self) -> &Path {
        &self.workdir_tree
    }

    /// Token cancelling in-flight command executions for this environment.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve a tool-supplied path to a path relative to the workdir.
    /// Absolute paths must fall inside the configured workdir; traversal out
    /// of the tree is rejected.
    pub fn rel_path(&self, target: &str) -> Result<PathBuf, EnvironmentError> {
        let raw = Path::new(target);
        let rel = if raw.is_absolute() {
            raw.strip_prefix(&self.info.state.config.workdir)
                .map_err(|_| EnvironmentError::PathOutsideWorkdir(raw.to_path_buf()))?
        } else {
            raw
        };

        let mut clean = PathBuf::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                _ => return Err(EnvironmentError::PathOutsideWorkdir(raw.to_path_buf())),
            }
        }
        Ok(clean)
    }

    fn host_path(&self, target: &str) -> Result<PathBuf, EnvironmentError> {
        Ok(self.workdir_tree.join(self.rel_path(target)?))
    }

    fn guard_submodule(&self, rel: &Path) -> Result<(), EnvironmentError> {
        for submodule in &self.submodules {
            if rel.starts_with(submodule) {
                return Err(EnvironmentError::SubmoduleWriteForbidden(rel.to_path_buf()));
            }
        }
        Ok(())
    }

    pub async fn file_read(
        &self,
        target_file: &str,
        entire_file: bool,
        start_line: usize,
        end_line: usize,
    ) -> Result<String, EnvironmentError> {
        let path = self.host_path(target_file)?;
        let contents = tokio::fs::read_to_string(&path).await?;
        if entire_file || start_line == 0 {
            return Ok(contents);
        }
        let mut out = String::new();
        for (index, segment) in contents.split_inclusive('\n').enumerate() {
            let line = index + 1;
            if line < start_line {
                continue;
            }
            if end_line != 0 && line > end_line {
                break;
            }
            out.push_str(segment);
        }
        Ok(out)
    }

    /// List a directory, one entry per line, directories suffixed with `/`.
    pub async fn file_list(&self, path: &str) -> Result<String, EnvironmentError> {
        let dir = self.host_path(path)?;
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == STATE_DIR_NAME || name == ".git" {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                entries.push(format!("{name}/"));
            } else {
                entries.push(name);
            }
        }
        entries.sort();
        Ok(entries.join("\n"))
    }

    pub async fn file_write(
        &self,
        target_file: &str,
        contents: &str,
    ) -> Result<(), EnvironmentError> {
        let rel = self.rel_path(target_file)?;
        self.guard_submodule(&rel)?;
        let path = self.workdir_tree.join(&rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        Ok(())
    }

    pub async fn file_edit(
        &self,
        target_file: &str,
        search_text: &str,
        replace_text: &str,
        which_match: &str,
    ) -> Result<(), EnvironmentError> {
        let rel = self.rel_path(target_file)?;
        self.guard_submodule(&rel)?;
        let path = self.workdir_tree.join(&rel);
        let contents = tokio::fs::read_to_string(&path).await?;
        let edited = apply_edit(&contents, search_text, replace_text, which_match, &rel)?;
        tokio::fs::write(&path, edited).await?;
        Ok(())
    }

    pub async fn file_delete(&self, target_file: &str) -> Result<(), EnvironmentError> {
        let rel = self.rel_path(target_file)?;
        self.guard_submodule(&rel)?;
        let path = self.workdir_tree.join(&rel);
        let metadata = tokio::fs::metadata(&path).await?;
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    pub async fn run(
        &self,
        command: &str,
        shell: &str,
        use_entrypoint: bool,
    ) -> Result<String, EnvironmentError> {
        self.executor
            .build(&self.info.id, &self.info.state.config)
            .await?;
        let stdout = self
            .executor
            .run(self.run_request(command, shell, use_entrypoint), &self.cancel)
            .await?;
        Ok(stdout)
    }

    pub async fn run_background(
        &self,
        command: &str,
        shell: &str,
        ports: &[u16],
        use_entrypoint: bool,
    ) -> Result<EndpointMappings, EnvironmentError> {
        self.executor
            .build(&self.info.id, &self.info.state.config)
            .await?;
        let endpoints = self
            .executor
            .run_background(self.run_request(command, shell, use_entrypoint), ports)
            .await?;
        Ok(endpoints)
    }

    pub async fn add_service(
        &mut self,
        config: ServiceConfig,
    ) -> Result<Service, EnvironmentError> {
        if self.services.iter().any(|s| s.config.name == config.name) {
            return Err(EnvironmentError::ServiceExists(config.name));
        }
        let endpoints = self.executor.start_service(&self.info.id, &config).await?;
        let service = Service { config, endpoints };
        self.services.push(service.clone());
        Ok(service)
    }

    /// Replace the environment config and rebuild. All previous in-container
    /// state outside the workdir is lost; the next run starts from the new
    /// image.
    pub async fn update_config(
        &mut self,
        config: EnvironmentConfig,
    ) -> Result<(), EnvironmentError> {
        self.executor.build(&self.info.id, &config).await?;
        self.info.state.config = config;
        Ok(())
    }

    pub async fn checkpoint(&self, destination: &str) -> Result<String, EnvironmentError> {
        self.executor
            .build(&self.info.id, &self.info.state.config)
            .await?;
        let reference = self
            .executor
            .checkpoint(
                &self.info.id,
                &self.info.state.config,
                &self.workdir_tree,
                destination,
            )
            .await?;
        Ok(reference)
    }

    fn run_request<'a>(
        &'a self,
        command: &'a str,
        shell: &'a str,
        use_entrypoint: bool,
    ) -> RunRequest<'a> {
        RunRequest {
            env_id: &self.info.id,
            config: &self.info.state.config,
            workdir_tree: &self.workdir_tree,
            shell,
            command,
            use_entrypoint,
        }
    }
}

/// Exact-match find and replace. `which_match` is a 1-based index required
/// when the search text occurs more than once.
fn apply_edit(
    contents: &str,
    search_text: &str,
    replace_text: &str,
    which_match: &str,
    rel: &Path,
) -> Result<String, EnvironmentError> {
    let positions: Vec<usize> = contents
        .match_indices(search_text)
        .map(|(offset, _)| offset)
        .collect();

    if positions.is_empty() {
        return Err(EnvironmentError::SearchTextNotFound(rel.to_path_buf()));
    }

    let which_match = which_match.trim();
    let index = if which_match.is_empty() {
        if positions.len() > 1 {
            return Err(EnvironmentError::AmbiguousMatch {
                count: positions.len(),
                positions,
            });
        }
        0
    } else {
        match which_match.parse::<usize>() {
            Ok(n) if (1..=positions.len()).contains(&n) => n - 1,
            _ => {
                return Err(EnvironmentError::InvalidWhichMatch {
                    given: which_match.to_string(),
                    count: positions.len(),
                });
            }
        }
    };

    let offset = positions[index];
    let mut edited = String::with_capacity(contents.len() + replace_text.len());
    edited.push_str(&contents[..offset]);
    edited.push_str(replace_text);
    edited.push_str(&contents[offset + search_text.len()..]);
    Ok(edited)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::test_support::LocalShellExecutor;

    fn test_env() -> Environment {
        let config = EnvironmentConfig {
            base_image: "ubuntu:24.04".to_string(),
            setup_commands: Vec::new(),
            env: Vec::new(),
            workdir: "/workspace".to_string(),
        };
        let now = Utc::now();
        let info = EnvironmentInfo {
            id: "env-test".to_string(),
            state: EnvironmentState {
                title: "test".to_string(),
                config,
                created_at: now,
                updated_at: now,
                base_commit: "0".repeat(40),
            },
        };
        Environment::new(
            info,
            PathBuf::from("/tmp/env-test"),
            vec![PathBuf::from("submodule")],
            Arc::new(LocalShellExecutor),
        )
    }

    #[test]
    fn rel_path_resolves_inside_the_workdir() {
        let env = test_env();
        assert_eq!(
            env.rel_path("src/main.rs").expect("relative"),
            PathBuf::from("src/main.rs")
        );
        assert_eq!(
            env.rel_path("/workspace/src/main.rs").expect("absolute"),
            PathBuf::from("src/main.rs")
        );
        assert!(matches!(
            env.rel_path("/etc/passwd"),
            Err(EnvironmentError::PathOutsideWorkdir(_))
        ));
        assert!(matches!(
            env.rel_path("../escape"),
            Err(EnvironmentError::PathOutsideWorkdir(_))
        ));
    }

    #[test]
    fn submodule_paths_are_write_protected() {
        let env = test_env();
        assert!(matches!(
            env.guard_submodule(Path::new("submodule/x")),
            Err(EnvironmentError::SubmoduleWriteForbidden(_))
        ));
        assert!(env.guard_submodule(Path::new("src/x")).is_ok());
    }

    #[test]
    fn config_copy_is_independent() {
        let original = EnvironmentConfig {
            base_image: "ubuntu:24.04".to_string(),
            setup_commands: vec!["apt-get update".to_string()],
            env: vec!["FOO=bar".to_string()],
            workdir: "/workspace".to_string(),
        };
        let snapshot = original.clone();

        let mut copy = original.copy();
        copy.base_image = "alpine:3.20".to_string();
        copy.setup_commands.push("apk add git".to_string());
        copy.env.clear();

        assert_eq!(original, snapshot);
    }

    #[test]
    fn edit_single_match_needs_no_disambiguator() {
        let edited = apply_edit("a\nfoo\nb", "foo", "F", "", Path::new("f")).expect("edit");
        assert_eq!(edited, "a\nF\nb");
    }

    #[test]
    fn edit_with_multiple_matches_is_ambiguous() {
        let err = apply_edit("a\nfoo\nb\nfoo\nc", "foo", "F", "", Path::new("f"))
            .expect_err("two matches without which_match");
        match err {
            EnvironmentError::AmbiguousMatch { count, positions } => {
                assert_eq!(count, 2);
                assert_eq!(positions.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn edit_which_match_selects_one_occurrence() {
        let edited =
            apply_edit("a\nfoo\nb\nfoo\nc", "foo", "F", "2", Path::new("f")).expect("edit");
        assert_eq!(edited, "a\nfoo\nb\nF\nc");
    }

    #[test]
    fn edit_rejects_out_of_range_which_match() {
        let err = apply_edit("foo foo", "foo", "F", "3", Path::new("f"))
            .expect_err("index past match count");
        assert!(matches!(
            err,
            EnvironmentError::InvalidWhichMatch { count: 2, .. }
        ));
    }

    #[test]
    fn edit_missing_search_text_fails() {
        let err = apply_edit("abc", "zzz", "F", "", Path::new("f")).expect_err("no match");
        assert!(matches!(err, EnvironmentError::SearchTextNotFound(_)));
    }
}
