//! Container executor backed by the `docker` CLI.
//!
//! An environment's image is built from a generated Dockerfile (base image,
//! env vars, setup commands, workdir). Foreground commands run in throwaway
//! containers with the environment's workdir tree bind-mounted, so filesystem
//! effects under the workdir land directly in the tree the repository layer
//! reconciles. Background commands and services run detached on a per-
//! environment network.

use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use dashmap::DashMap;
use services::services::{
    environment::{EnvironmentConfig, ServiceConfig},
    executor::{ContainerExecutor, EndpointMapping, EndpointMappings, ExecutorError, RunRequest},
};
use tokio::{io::AsyncWriteExt, process::Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct DockerExecutor {
    /// env id + serialized config → image tag already built.
    built: DashMap<String, String>,
}

impl DockerExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn image_tag(env_id: &str) -> String {
        format!("container-use/env-{env_id}")
    }

    fn network_name(env_id: &str) -> String {
        format!("container-use-{env_id}")
    }

    async fn ensure_network(&self, env_id: &str) -> Result<String, ExecutorError> {
        let network = Self::network_name(env_id);
        run_docker_ok(&["network", "create", &network]).await?;
        Ok(network)
    }

    fn run_args<'a>(
        network: &'a str,
        mount: &'a str,
        req: &'a RunRequest<'_>,
        detach: bool,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".into()];
        if detach {
            args.push("--detach".into());
        } else {
            args.push("--rm".into());
        }
        args.extend(["--network".into(), network.into()]);
        args.extend(["--volume".into(), mount.into()]);
        args.extend(["--workdir".into(), req.config.workdir.clone()]);
        if !req.use_entrypoint {
            args.extend(["--entrypoint".into(), req.shell.into()]);
        }
        args
    }
}

#[async_trait]
impl ContainerExecutor for DockerExecutor {
    async fn build(
        &self,
        env_id: &str,
        config: &EnvironmentConfig,
    ) -> Result<String, ExecutorError> {
        let key = format!(
            "{env_id}:{}",
            serde_json::to_string(config).map_err(|e| ExecutorError::Container(e.to_string()))?
        );
        if let Some(tag) = self.built.get(&key) {
            return Ok(tag.clone());
        }

        let tag = Self::image_tag(env_id);
        let dockerfile = render_dockerfile(config);
        tracing::debug!(env_id, image = %tag, "building environment image");

        // `docker build -` reads the Dockerfile from stdin with an empty
        // build context; the workdir tree is mounted at run time instead.
        let mut child = Command::new("docker")
            .args(["build", "--tag", &tag, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(dockerfile.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ExecutorError::Container(format!(
                "docker build failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        self.built.insert(key, tag.clone());
        Ok(tag)
    }

    async fn run(
        &self,
        req: RunRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        let image = self.build(req.env_id, req.config).await?;
        let network = self.ensure_network(req.env_id).await?;
        let mount = format!(
            "{}:{}",
            req.workdir_tree.to_string_lossy(),
            req.config.workdir
        );

        let mut args = Self::run_args(&network, &mount, &req, false);
        args.push(image);
        if req.use_entrypoint {
            args.push(req.shell.into());
        }
        args.extend(["-c".into(), req.command.into()]);

        let child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

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
        req: RunRequest<'_>,
        ports: &[u16],
    ) -> Result<EndpointMappings, ExecutorError> {
        let image = self.build(req.env_id, req.config).await?;
        let network = self.ensure_network(req.env_id).await?;

        // Background commands see a copy of the workdir tree: their writes
        // must stay invisible to later runs and to the environment history.
        let staging = tempfile::Builder::new()
            .prefix("container-use-bg-")
            .tempdir()?;
        copy_dir(req.workdir_tree, staging.path())?;
        let staging_path = staging.keep();
        let mount = format!("{}:{}", staging_path.to_string_lossy(), req.config.workdir);

        let name = format!(
            "container-use-{}-bg-{}",
            req.env_id,
            utils::text::short_uuid(&Uuid::new_v4())
        );
        let mut args = Self::run_args(&network, &mount, &req, true);
        args.extend(["--name".into(), name.clone()]);
        for port in ports {
            args.extend(["--publish".into(), format!("127.0.0.1::{port}")]);
        }
        args.push(image);
        if req.use_entrypoint {
            args.push(req.shell.into());
        }
        args.extend(["-c".into(), req.command.into()]);

        run_docker(&args.iter().map(String::as_str).collect::<Vec<_>>()).await?;
        endpoints_for(&name, ports).await
    }

    async fn start_service(
        &self,
        env_id: &str,
        config: &ServiceConfig,
    ) -> Result<EndpointMappings, ExecutorError> {
        let network = self.ensure_network(env_id).await?;
        let name = format!("container-use-{}-svc-{}", env_id, config.name);

        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            name.clone(),
            "--network".into(),
            network,
            "--network-alias".into(),
            config.name.clone(),
        ];
        for pair in &config.env {
            args.extend(["--env".into(), pair.clone()]);
        }
        for port in &config.exposed_ports {
            args.extend(["--publish".into(), format!("127.0.0.1::{port}")]);
        }
        args.push(config.image.clone());
        if let Some(command) = &config.command {
            args.extend(["sh".into(), "-c".into(), command.clone()]);
        }

        run_docker(&args.iter().map(String::as_str).collect::<Vec<_>>()).await?;

        let mut endpoints = endpoints_for(&name, &config.exposed_ports).await?;
        for endpoint in &mut endpoints {
            // Services are addressed by name from inside the environment.
            endpoint.environment_internal = format!("{}:{}", config.name, endpoint.port);
        }
        Ok(endpoints)
    }

    async fn checkpoint(
        &self,
        env_id: &str,
        config: &EnvironmentConfig,
        workdir_tree: &Path,
        destination: &str,
    ) -> Result<String, ExecutorError> {
        let image = self.build(env_id, config).await?;

        let container = run_docker(&["create", &image]).await?;
        let container = container.trim().to_string();
        let copy_src = format!("{}/.", workdir_tree.to_string_lossy());
        let copy_dst = format!("{container}:{}", config.workdir);
        let result = async {
            run_docker(&["cp", &copy_src, &copy_dst]).await?;
            run_docker(&[
                "commit",
                "--change",
                "ENTRYPOINT [\"sh\"]",
                &container,
                destination,
            ])
            .await?;
            run_docker(&["push", destination]).await?;
            let digest = run_docker(&[
                "inspect",
                "--format",
                "{{index .RepoDigests 0}}",
                destination,
            ])
            .await?;
            Ok::<String, ExecutorError>(digest.trim().to_string())
        }
        .await;
        run_docker_ok(&["rm", "--force", &container]).await?;

        let digest = result?;
        if digest.is_empty() {
            Ok(destination.to_string())
        } else {
            Ok(digest)
        }
    }

    async fn remove(&self, env_id: &str) -> Result<(), ExecutorError> {
        let prefix = format!("container-use-{env_id}");
        let out = run_docker(&[
            "ps",
            "--all",
            "--quiet",
            "--filter",
            &format!("name={prefix}"),
        ])
        .await?;
        for container in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            run_docker_ok(&["rm", "--force", container]).await?;
        }
        run_docker_ok(&["network", "rm", &Self::network_name(env_id)]).await?;
        run_docker_ok(&["rmi", "--force", &Self::image_tag(env_id)]).await?;
        self.built.retain(|key, _| !key.starts_with(env_id));
        Ok(())
    }
}

fn render_dockerfile(config: &EnvironmentConfig) -> String {
    let mut dockerfile = format!("FROM {}\n", config.base_image);
    for pair in &config.env {
        if let Some((key, value)) = pair.split_once('=') {
            dockerfile.push_str(&format!("ENV {key}={value}\n"));
        }
    }
    for command in &config.setup_commands {
        dockerfile.push_str(&format!("RUN {command}\n"));
    }
    dockerfile.push_str(&format!("WORKDIR {}\n", config.workdir));
    dockerfile
}

async fn endpoints_for(container: &str, ports: &[u16]) -> Result<EndpointMappings, ExecutorError> {
    let mut endpoints = Vec::with_capacity(ports.len());
    for &port in ports {
        let out = run_docker(&["port", container, &port.to_string()]).await?;
        let host_external = out
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        endpoints.push(EndpointMapping {
            port,
            environment_internal: format!("{container}:{port}"),
            host_external,
        });
    }
    Ok(endpoints)
}

async fn run_docker(args: &[&str]) -> Result<String, ExecutorError> {
    let output = Command::new("docker")
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.status.success() {
        return Err(ExecutorError::Container(format!(
            "docker {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Variant for teardown paths where failure is acceptable.
async fn run_docker_ok(args: &[&str]) -> Result<bool, ExecutorError> {
    let output = Command::new("docker")
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;
    Ok(output.status.success())
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        if entry.file_name() == ".git" {
            continue;
        }
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dockerfile_reflects_config() {
        let config = EnvironmentConfig {
            base_image: "ubuntu:24.04".to_string(),
            setup_commands: vec!["apt-get update".to_string(), "apt-get install -y git".to_string()],
            env: vec!["FOO=bar".to_string(), "malformed".to_string()],
            workdir: "/workspace".to_string(),
        };
        let dockerfile = render_dockerfile(&config);
        assert_eq!(
            dockerfile,
            "FROM ubuntu:24.04\nENV FOO=bar\nRUN apt-get update\nRUN apt-get install -y git\nWORKDIR /workspace\n"
        );
    }

    #[test]
    fn naming_is_stable_per_environment() {
        assert_eq!(
            DockerExecutor::image_tag("abc"),
            "container-use/env-abc"
        );
        assert_eq!(DockerExecutor::network_name("abc"), "container-use-abc");
    }
}
