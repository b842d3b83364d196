//! Shared fixtures for unit and integration tests.

use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::services::{
    environment::{EnvironmentConfig, ServiceConfig},
    executor::{
        ContainerExecutor, EndpointMapping, EndpointMappings, ExecutorError, RunRequest,
    },
};

/// Executes commands directly on the host with the workdir tree as the
/// current directory. Behaviorally equivalent to the container runtime for
/// everything the repository layer cares about (workdir mutations, captured
/// output, exit codes, cancellation) without needing a docker daemon.
#[derive(Debug, Default)]
pub struct LocalShellExecutor;

#[async_trait]
impl ContainerExecutor for LocalShellExecutor {
    async fn build(
        &self,
        env_id: &str,
        _config: &EnvironmentConfig,
    ) -> Result<String, ExecutorError> {
        Ok(format!("local/{env_id}"))
    }

    async fn run(
        &self,
        req: RunRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        let mut cmd = Command::new(req.shell);
        cmd.arg("-c")
            .arg(req.command)
            .current_dir(req.workdir_tree)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for pair in &req.config.env {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }
        let child = cmd.spawn()?;

        tokio::select! {
            _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
            output = child.wait_with_output() => {
                let output = output?;
                if !output.status.success() {
                    return Err(ExecutorError::CommandFailed {
                        exit_code: output.status.code().unwrap_or(-1),
                        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    });
                }
                Ok(String::from_utf8_lossy(&output.stdout).to_string())
            }
        }
    }

    async fn run_background(
        &self,
        _req: RunRequest<'_>,
        ports: &[u16],
    ) -> Result<EndpointMappings, ExecutorError> {
        Ok(fake_endpoints(ports))
    }

    async fn start_service(
        &self,
        _env_id: &str,
        config: &ServiceConfig,
    ) -> Result<EndpointMappings, ExecutorError> {
        Ok(fake_endpoints(&config.exposed_ports))
    }

    async fn checkpoint(
        &self,
        _env_id: &str,
        _config: &EnvironmentConfig,
        _workdir_tree: &Path,
        destination: &str,
    ) -> Result<String, ExecutorError> {
        Ok(format!("{destination}@sha256:{}", "0".repeat(64)))
    }

    async fn remove(&self, _env_id: &str) -> Result<(), ExecutorError> {
        Ok(())
    }
}

fn fake_endpoints(ports: &[u16]) -> EndpointMappings {
    ports
        .iter()
        .map(|&port| EndpointMapping {
            port,
            environment_internal: format!("localhost:{port}"),
            host_external: format!("127.0.0.1:{port}"),
        })
        .collect()
}
