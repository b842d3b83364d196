//! Capability boundary to the container runtime.
//!
//! The rest of the system treats the runtime as "apply a config to a workdir
//! tree and execute commands against it". The docker-backed implementation
//! lives in the `docker-runtime` crate; tests substitute a host-shell stub.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::services::environment::{EnvironmentConfig, ServiceConfig};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("command failed with exit code {exit_code}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    CommandFailed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("container runtime error: {0}")]
    Container(String),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Addresses under which a published port can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointMapping {
    pub port: u16,
    /// Address reachable from other commands and services in this environment.
    pub environment_internal: String,
    /// Address reachable from the user's machine.
    pub host_external: String,
}

pub type EndpointMappings = Vec<EndpointMapping>;

/// One command execution against an environment's workdir tree.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub env_id: &'a str,
    pub config: &'a EnvironmentConfig,
    /// Host directory materializing the container workdir.
    pub workdir_tree: &'a Path,
    pub shell: &'a str,
    pub command: &'a str,
    pub use_entrypoint: bool,
}

#[async_trait]
pub trait ContainerExecutor: Send + Sync {
    /// Build (or reuse) the image for `config`, returning an image reference.
    /// Implementations memoize on the config so repeated calls are cheap.
    async fn build(
        &self,
        env_id: &str,
        config: &EnvironmentConfig,
    ) -> Result<String, ExecutorError>;

    /// Run a command synchronously. Filesystem effects under the workdir land
    /// in `workdir_tree`. Non-zero exit returns `CommandFailed` with captured
    /// output; the workdir tree keeps whatever state the command reached.
    async fn run(
        &self,
        req: RunRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError>;

    /// Start a long-running command detached from the environment. Background
    /// commands observe a copy of the workdir tree; their writes never reach
    /// later runs or the environment history.
    async fn run_background(
        &self,
        req: RunRequest<'_>,
        ports: &[u16],
    ) -> Result<EndpointMappings, ExecutorError>;

    /// Start an auxiliary service container attached to the environment.
    async fn start_service(
        &self,
        env_id: &str,
        config: &ServiceConfig,
    ) -> Result<EndpointMappings, ExecutorError>;

    /// Publish the environment's current state as a container image and
    /// return a content-addressed reference.
    async fn checkpoint(
        &self,
        env_id: &str,
        config: &EnvironmentConfig,
        workdir_tree: &Path,
        destination: &str,
    ) -> Result<String, ExecutorError>;

    /// Tear down containers, networks and images belonging to an environment.
    async fn remove(&self, env_id: &str) -> Result<(), ExecutorError>;
}
