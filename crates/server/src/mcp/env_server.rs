use std::sync::Arc;

use rmcp::{
    ErrorData, ServerHandler, ServiceExt,
    handler::server::{tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo,
    },
    tool, tool_handler, tool_router,
    transport::stdio,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use services::services::{
    environment::{
        Environment, EnvironmentConfig, EnvironmentError, EnvironmentInfo, Service, ServiceConfig,
    },
    executor::{ContainerExecutor, ExecutorError},
    repository::{Repository, RepositoryError},
    session::SessionState,
};

const SERVER_INSTRUCTIONS: &str = "Containerized environments for coding agents. ALWAYS use environments for any work: create one with environment_create (or open an existing one with environment_open), then run commands and edit files through the environment_* tools. Any changes you make are committed to the environment's remote ref; share the checkout/log/diff commands from the responses with the user so they can inspect your work. If the environment is missing tools or instructions, update it with environment_config. DO NOT change environments without explicit permission from the user.";

#[derive(Clone)]
pub struct EnvServer {
    executor: Arc<dyn ContainerExecutor>,
    session: Arc<SessionState>,
    single_tenant: bool,
    tool_router: ToolRouter<EnvServer>,
}

#[derive(Debug, Serialize)]
pub struct EnvironmentResponse {
    pub id: String,
    pub title: String,
    pub config: EnvironmentConfig,
    pub remote_ref: String,
    pub checkout_command_to_share_with_user: String,
    pub log_command_to_share_with_user: String,
    pub diff_command_to_share_with_user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<Service>>,
}

impl EnvironmentResponse {
    fn from_info(info: &EnvironmentInfo) -> Self {
        Self {
            id: info.id.clone(),
            title: info.state.title.clone(),
            config: info.state.config.clone(),
            remote_ref: format!("container-use/{}", info.id),
            checkout_command_to_share_with_user: format!("container-use checkout {}", info.id),
            log_command_to_share_with_user: format!("container-use log {}", info.id),
            diff_command_to_share_with_user: format!("container-use diff {}", info.id),
            services: None,
        }
    }

    fn from_env(env: &Environment) -> Self {
        let mut response = Self::from_info(&env.info);
        if !env.services.is_empty() {
            response.services = Some(env.services.clone());
        }
        response
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentOpenRequest {
    #[schemars(description = "One sentence explanation for why this tool is being called.")]
    pub explanation: Option<String>,
    #[schemars(description = "Absolute path to the source git repository for the environment.")]
    pub environment_source: Option<String>,
    #[schemars(description = "The UUID of the environment for this command.")]
    pub environment_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentCreateRequest {
    #[schemars(description = "One sentence explanation for why this tool is being called.")]
    pub explanation: Option<String>,
    #[schemars(description = "Absolute path to the source git repository for the environment.")]
    pub environment_source: Option<String>,
    #[schemars(
        description = "Short description of the work that is happening in this environment."
    )]
    pub title: String,
    #[schemars(
        description = "Git reference to create the environment from (e.g., HEAD, main, feature-branch, SHA). Defaults to HEAD if not specified."
    )]
    pub from_git_ref: Option<String>,
    #[schemars(
        description = "If true and an environment already exists for this session, destructively replace it with a new one."
    )]
    pub allow_replace: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentUpdateMetadataRequest {
    #[schemars(description = "One sentence explanation for why this tool is being called.")]
    pub explanation: Option<String>,
    #[schemars(description = "Absolute path to the source git repository for the environment.")]
    pub environment_source: Option<String>,
    #[schemars(description = "The UUID of the environment for this command.")]
    pub environment_id: Option<String>,
    #[schemars(
        description = "Updated title describing the work being done in this environment."
    )]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentConfigInput {
    #[schemars(description = "Base image for the environment")]
    pub base_image: Option<String>,
    #[schemars(
        description = "Commands that should be executed on top of the base image to set up the environment. Similar to `RUN` instructions in Dockerfiles."
    )]
    pub setup_commands: Option<Vec<String>>,
    #[schemars(
        description = "The environment variables to set (e.g. `[\"FOO=bar\", \"BAZ=qux\"]`)."
    )]
    pub envs: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentConfigRequest {
    #[schemars(description = "One sentence explanation for why this tool is being called.")]
    pub explanation: Option<String>,
    #[schemars(description = "Absolute path to the source git repository for the environment.")]
    pub environment_source: Option<String>,
    #[schemars(description = "The UUID of the environment for this command.")]
    pub environment_id: Option<String>,
    #[schemars(description = "Environment configuration changes to apply.")]
    pub config: EnvironmentConfigInput,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentListRequest {
    #[schemars(description = "One sentence explanation for why this tool is being called.")]
    pub explanation: Option<String>,
    #[schemars(description = "Absolute path to the source git repository for the environment.")]
    pub environment_source: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentRunCmdRequest {
    #[schemars(description = "One sentence explanation for why this tool is being called.")]
    pub explanation: Option<String>,
    #[schemars(description = "Absolute path to the source git repository for the environment.")]
    pub environment_source: Option<String>,
    #[schemars(description = "The UUID of the environment for this command.")]
    pub environment_id: Option<String>,
    #[schemars(
        description = "The terminal command to execute. If empty, the environment's default command is used."
    )]
    pub command: Option<String>,
    #[schemars(description = "The shell that will be interpreting this command (default: sh)")]
    pub shell: Option<String>,
    #[schemars(
        description = "Run the command in the background. Must ALWAYS be set for long running command (e.g. http server). Failure to do so will result in the tool being stuck, awaiting for the command to finish."
    )]
    pub background: Option<bool>,
    #[schemars(
        description = "Use the image entrypoint, if present, by prepending it to the args."
    )]
    pub use_entrypoint: Option<bool>,
    #[schemars(
        description = "Ports to expose. Only works with background environments. For each port, returns the environment_internal (for use inside environments) and host_external (for use by the user) addresses."
    )]
    pub ports: Option<Vec<u16>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentFileReadRequest {
    #[schemars(description = "One sentence explanation for why this tool is being called.")]
    pub explanation: Option<String>,
    #[schemars(description = "Absolute path to the source git repository for the environment.")]
    pub environment_source: Option<String>,
    #[schemars(description = "The UUID of the environment for this command.")]
    pub environment_id: Option<String>,
    #[schemars(description = "Path of the file to read, absolute or relative to the workdir")]
    pub target_file: String,
    #[schemars(description = "Whether to read the entire file. Defaults to false.")]
    pub should_read_entire_file: Option<bool>,
    #[schemars(
        description = "The starting line (1-indexed, inclusive) to read from the file. Must specify both start_line and end_line if not reading entire file."
    )]
    pub start_line_one_indexed_inclusive: Option<usize>,
    #[schemars(
        description = "The ending line (1-indexed, inclusive) to read from the file. Must specify both start_line and end_line if not reading entire file."
    )]
    pub end_line_one_indexed_inclusive: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentFileListRequest {
    #[schemars(description = "One sentence explanation for why this tool is being called.")]
    pub explanation: Option<String>,
    #[schemars(description = "Absolute path to the source git repository for the environment.")]
    pub environment_source: Option<String>,
    #[schemars(description = "The UUID of the environment for this command.")]
    pub environment_id: Option<String>,
    #[schemars(
        description = "Path of the directory to list contents of, absolute or relative to the workdir"
    )]
    pub path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentFileWriteRequest {
    #[schemars(description = "One sentence explanation for why this tool is being called.")]
    pub explanation: Option<String>,
    #[schemars(description = "Absolute path to the source git repository for the environment.")]
    pub environment_source: Option<String>,
    #[schemars(description = "The UUID of the environment for this command.")]
    pub environment_id: Option<String>,
    #[schemars(description = "Path of the file to write, absolute or relative to the workdir.")]
    pub target_file: String,
    #[schemars(description = "Full text content of the file you want to write.")]
    pub contents: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentFileEditRequest {
    #[schemars(description = "One sentence explanation for why this tool is being called.")]
    pub explanation: Option<String>,
    #[schemars(description = "Absolute path to the source git repository for the environment.")]
    pub environment_source: Option<String>,
    #[schemars(description = "The UUID of the environment for this command.")]
    pub environment_id: Option<String>,
    #[schemars(description = "Path of the file to write, absolute or relative to the workdir.")]
    pub target_file: String,
    #[schemars(description = "The text to find and replace.")]
    pub search_text: String,
    #[schemars(description = "The text to insert.")]
    pub replace_text: String,
    #[schemars(description = "The ID of the match to replace, if there were multiple matches.")]
    pub which_match: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentFileDeleteRequest {
    #[schemars(description = "One sentence explanation for why this tool is being called.")]
    pub explanation: Option<String>,
    #[schemars(description = "Absolute path to the source git repository for the environment.")]
    pub environment_source: Option<String>,
    #[schemars(description = "The UUID of the environment for this command.")]
    pub environment_id: Option<String>,
    #[schemars(description = "Path of the file to delete, absolute or relative to the workdir.")]
    pub target_file: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentAddServiceRequest {
    #[schemars(description = "One sentence explanation for why this tool is being called.")]
    pub explanation: Option<String>,
    #[schemars(description = "Absolute path to the source git repository for the environment.")]
    pub environment_source: Option<String>,
    #[schemars(description = "The UUID of the environment for this command.")]
    pub environment_id: Option<String>,
    #[schemars(description = "The name of the service to start.")]
    pub name: String,
    #[schemars(description = "The image of the service to start.")]
    pub image: String,
    #[schemars(
        description = "The command to start the service. If not provided the image default command will be used."
    )]
    pub command: Option<String>,
    #[schemars(
        description = "Ports to expose. For each port, returns the container_internal (for use by environments) and host_external (for use by the user) address."
    )]
    pub ports: Option<Vec<u16>>,
    #[schemars(
        description = "The environment variables to set (e.g. `[\"FOO=bar\", \"BAZ=qux\"]`)."
    )]
    pub envs: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnvironmentCheckpointRequest {
    #[schemars(description = "One sentence explanation for why this tool is being called.")]
    pub explanation: Option<String>,
    #[schemars(description = "Absolute path to the source git repository for the environment.")]
    pub environment_source: Option<String>,
    #[schemars(description = "The UUID of the environment for this command.")]
    pub environment_id: Option<String>,
    #[schemars(
        description = "Container image destination to checkpoint to (e.g. registry.com/user/image:tag)"
    )]
    pub destination: String,
}

impl EnvServer {
    pub fn new(executor: Arc<dyn ContainerExecutor>, single_tenant: bool) -> Self {
        Self::with_session(executor, single_tenant, Arc::new(SessionState::new()))
    }

    pub fn with_session(
        executor: Arc<dyn ContainerExecutor>,
        single_tenant: bool,
        session: Arc<SessionState>,
    ) -> Self {
        Self {
            executor,
            session,
            single_tenant,
            tool_router: Self::tool_router(),
        }
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    fn success<T: Serialize>(data: &T) -> Result<CallToolResult, ErrorData> {
        Ok(CallToolResult::success(vec![Content::text(
            serde_json::to_string(data)
                .unwrap_or_else(|_| "Failed to serialize response".to_string()),
        )]))
    }

    fn text(message: String) -> Result<CallToolResult, ErrorData> {
        Ok(CallToolResult::success(vec![Content::text(message)]))
    }

    async fn resolve_source(&self, source: Option<String>) -> Result<String, CallToolResult> {
        if let Some(source) = source.filter(|s| !s.is_empty()) {
            return Ok(source);
        }
        if self.single_tenant {
            self.session
                .current_source()
                .await
                .map_err(|e| error_result("no_current_environment", e))
        } else {
            Err(error_result(
                "invalid_params",
                "environment_source is required",
            ))
        }
    }

    async fn resolve_env_id(&self, env_id: Option<String>) -> Result<String, CallToolResult> {
        if let Some(env_id) = env_id.filter(|s| !s.is_empty()) {
            return Ok(env_id);
        }
        if self.single_tenant {
            self.session
                .current_id()
                .await
                .map_err(|e| error_result("no_current_environment", e))
        } else {
            Err(error_result("invalid_params", "environment_id is required"))
        }
    }

    async fn open_repository(&self, source: &str) -> Result<Repository, CallToolResult> {
        Repository::open(source).await.map_err(repo_error)
    }

    async fn open_environment(
        &self,
        source: Option<String>,
        env_id: Option<String>,
    ) -> Result<(Repository, Environment), CallToolResult> {
        let source = self.resolve_source(source).await?;
        let env_id = self.resolve_env_id(env_id).await?;
        let repo = self.open_repository(&source).await?;
        let env = repo
            .get(&self.executor, &env_id)
            .await
            .map_err(repo_error)?;
        Ok((repo, env))
    }
}

#[tool_router]
impl EnvServer {
    #[tool(
        description = "Opens an existing environment. Return format is same as environment_create."
    )]
    async fn environment_open(
        &self,
        Parameters(req): Parameters<EnvironmentOpenRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        // environment_open always takes explicit arguments; it is how a
        // single-tenant session selects its current environment.
        let Some(source) = req.environment_source.filter(|s| !s.is_empty()) else {
            return Ok(error_result(
                "invalid_params",
                "environment_source is required",
            ));
        };
        let Some(env_id) = req.environment_id.filter(|s| !s.is_empty()) else {
            return Ok(error_result("invalid_params", "environment_id is required"));
        };

        let repo = match self.open_repository(&source).await {
            Ok(repo) => repo,
            Err(result) => return Ok(result),
        };
        let env = match repo.get(&self.executor, &env_id).await {
            Ok(env) => env,
            Err(err) => return Ok(repo_error(err)),
        };

        if self.single_tenant {
            self.session.set_current(&env_id, &source).await;
        }
        Self::success(&EnvironmentResponse::from_env(&env))
    }

    #[tool(
        description = "Creates a new development environment. The environment is the result of the setup commands on top of the base image. Environment configuration is managed by the user via container-use config commands."
    )]
    async fn environment_create(
        &self,
        Parameters(req): Parameters<EnvironmentCreateRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let source = match self.resolve_source(req.environment_source).await {
            Ok(source) => source,
            Err(result) => return Ok(result),
        };

        if self.single_tenant
            && !req.allow_replace.unwrap_or(false)
            && let Ok(current) = self.session.current_id().await
        {
            return Ok(error_result(
                "environment_already_exists",
                format!(
                    "environment_id {current} already exists for this session. Tools can be used directly. You can environment_open {current} for more information, or set allow_replace=true to destructively replace it"
                ),
            ));
        }

        let repo = match self.open_repository(&source).await {
            Ok(repo) => repo,
            Err(result) => return Ok(result),
        };

        let from_git_ref = req.from_git_ref.unwrap_or_default();
        let env = match repo
            .create(
                &self.executor,
                &req.title,
                req.explanation.as_deref().unwrap_or_default(),
                &from_git_ref,
            )
            .await
        {
            Ok(env) => env,
            Err(err) => return Ok(repo_error(err)),
        };

        if self.single_tenant {
            self.session.set_current(env.id(), &source).await;
        }

        let response = EnvironmentResponse::from_env(&env);
        let out = serde_json::to_string(&response)
            .unwrap_or_else(|_| "Failed to serialize response".to_string());

        let (dirty, status) = match repo.is_dirty().await {
            Ok(result) => result,
            Err(err) => return Ok(repo_error(err)),
        };
        if !dirty {
            return Self::text(out);
        }

        Self::text(format!(
            "{out}\n\nCRITICAL: You MUST inform the user that the repository {source} has uncommitted changes that are NOT included in this environment. The environment was created from the last committed state only.\n\nUncommitted changes detected:\n{status}\n\nYou MUST tell the user: To include these changes in the environment, they need to commit them first using git commands outside the environment."
        ))
    }

    #[tool(
        description = "Update environment metadata such as title. This updates the descriptive information about what work is being done in the environment."
    )]
    async fn environment_update_metadata(
        &self,
        Parameters(req): Parameters<EnvironmentUpdateMetadataRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let (repo, mut env) = match self
            .open_environment(req.environment_source, req.environment_id)
            .await
        {
            Ok(pair) => pair,
            Err(result) => return Ok(result),
        };

        if let Some(title) = req.title.filter(|t| !t.is_empty()) {
            env.info.state.title = title;
        }
        if let Err(err) = repo
            .update(&mut env, req.explanation.as_deref().unwrap_or_default())
            .await
        {
            return Ok(repo_error(err));
        }

        let response = serde_json::to_string(&EnvironmentResponse::from_env(&env))
            .unwrap_or_else(|_| "Failed to serialize response".to_string());
        Self::text(format!(
            "Environment metadata updated successfully.\n{response}"
        ))
    }

    #[tool(
        description = "Make environment config changes such as base image and setup commands. If the environment is missing any tools or instructions, you MUST call this function to update the environment. You MUST update the environment with any useful tools. You will be resumed with no other context than the information provided here."
    )]
    async fn environment_config(
        &self,
        Parameters(req): Parameters<EnvironmentConfigRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let (repo, mut env) = match self
            .open_environment(req.environment_source, req.environment_id)
            .await
        {
            Ok(pair) => pair,
            Err(result) => return Ok(result),
        };

        let mut updated = env.info.state.config.copy();
        if let Some(base_image) = req.config.base_image {
            updated.base_image = base_image;
        }
        if let Some(setup_commands) = req.config.setup_commands {
            updated.setup_commands = setup_commands;
        }
        if let Some(envs) = req.config.envs {
            updated.env = envs;
        }

        if let Err(err) = env.update_config(updated).await {
            return Ok(env_error(err));
        }
        if let Err(err) = repo
            .update(&mut env, req.explanation.as_deref().unwrap_or_default())
            .await
        {
            return Ok(repo_error(err));
        }

        let response = serde_json::to_string(&EnvironmentResponse::from_env(&env))
            .unwrap_or_else(|_| "Failed to serialize response".to_string());
        Self::text(format!(
            "SUCCESS: Configuration successfully applied. Environment has been restarted, all previous commands have been lost.\nIMPORTANT: The configuration changes are LOCAL to this environment.\nTELL THE USER: To make these changes persistent, they will have to run \"container-use config import {}\"\n\n{response}",
            env.id()
        ))
    }

    #[tool(description = "List available environments")]
    async fn environment_list(
        &self,
        Parameters(req): Parameters<EnvironmentListRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let source = match self.resolve_source(req.environment_source).await {
            Ok(source) => source,
            Err(result) => return Ok(result),
        };
        let repo = match self.open_repository(&source).await {
            Ok(repo) => repo,
            Err(result) => return Ok(result),
        };
        let infos = match repo.list().await {
            Ok(infos) => infos,
            Err(err) => return Ok(repo_error(err)),
        };

        let responses: Vec<EnvironmentResponse> =
            infos.iter().map(EnvironmentResponse::from_info).collect();
        let out = serde_json::to_string(&responses)
            .unwrap_or_else(|_| "Failed to serialize response".to_string());
        Self::text(format!(
            "{out}\n\nDO NOT change environments without explicit permission from the user"
        ))
    }

    #[tool(
        description = "Run a terminal command inside a NEW container within the environment."
    )]
    async fn environment_run_cmd(
        &self,
        Parameters(req): Parameters<EnvironmentRunCmdRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let (repo, mut env) = match self
            .open_environment(req.environment_source, req.environment_id)
            .await
        {
            Ok(pair) => pair,
            Err(result) => return Ok(result),
        };

        let command = req.command.unwrap_or_default();
        let shell = req.shell.unwrap_or_else(|| "sh".to_string());
        let use_entrypoint = req.use_entrypoint.unwrap_or(false);
        let explanation = req.explanation.unwrap_or_default();
        let workdir = env.info.state.config.workdir.clone();
        let env_id = env.id().to_string();

        if req.background.unwrap_or(false) {
            let ports = req.ports.unwrap_or_default();
            let run_result = env
                .run_background(&command, &shell, &ports, use_entrypoint)
                .await;
            // Commit whatever state the container reached, even on failure.
            if let Err(err) = repo.update(&mut env, &explanation).await {
                return Ok(repo_error(err));
            }
            let endpoints = match run_result {
                Ok(endpoints) => endpoints,
                Err(err) => return Ok(env_error(err)),
            };
            let out = serde_json::to_string(&endpoints)
                .unwrap_or_else(|_| "Failed to serialize endpoints".to_string());
            return Self::text(format!(
                "Command started in the background in NEW container. Endpoints are {out}\n\nTo access from the user's machine: use host_external. To access from other commands in this environment: use environment_internal.\n\nAny changes to the container workdir ({workdir}) WILL NOT be committed to container-use/{env_id}\n\nBackground commands are unaffected by filesystem and any other kind of changes. You need to start a new command for changes to take effect."
            ));
        }

        let run_result = env.run(&command, &shell, use_entrypoint).await;
        // Commit whatever state the container reached, even on failure.
        if let Err(err) = repo.update(&mut env, &explanation).await {
            return Ok(repo_error(err));
        }
        let stdout = match run_result {
            Ok(stdout) => stdout,
            Err(err) => return Ok(env_error(err)),
        };
        Self::text(format!(
            "{stdout}\n\nAny changes to the container workdir ({workdir}) have been committed and pushed to container-use/{env_id} remote ref"
        ))
    }

    #[tool(
        description = "Read the contents of a file, specifying a line range or the entire file."
    )]
    async fn environment_file_read(
        &self,
        Parameters(req): Parameters<EnvironmentFileReadRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let (_repo, env) = match self
            .open_environment(req.environment_source, req.environment_id)
            .await
        {
            Ok(pair) => pair,
            Err(result) => return Ok(result),
        };

        match env
            .file_read(
                &req.target_file,
                req.should_read_entire_file.unwrap_or(false),
                req.start_line_one_indexed_inclusive.unwrap_or(0),
                req.end_line_one_indexed_inclusive.unwrap_or(0),
            )
            .await
        {
            Ok(contents) => Self::text(contents),
            Err(err) => Ok(env_error(err)),
        }
    }

    #[tool(description = "List the contents of a directory")]
    async fn environment_file_list(
        &self,
        Parameters(req): Parameters<EnvironmentFileListRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let (_repo, env) = match self
            .open_environment(req.environment_source, req.environment_id)
            .await
        {
            Ok(pair) => pair,
            Err(result) => return Ok(result),
        };

        match env.file_list(&req.path).await {
            Ok(listing) => Self::text(listing),
            Err(err) => Ok(env_error(err)),
        }
    }

    #[tool(description = "Write the contents of a file.")]
    async fn environment_file_write(
        &self,
        Parameters(req): Parameters<EnvironmentFileWriteRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let (repo, mut env) = match self
            .open_environment(req.environment_source, req.environment_id)
            .await
        {
            Ok(pair) => pair,
            Err(result) => return Ok(result),
        };
        let explanation = req.explanation.unwrap_or_default();

        if let Err(err) = env.file_write(&req.target_file, &req.contents).await {
            // Best-effort commit of anything already on disk.
            let _ = repo.update(&mut env, &explanation).await;
            return Ok(env_error(err));
        }
        if let Err(err) = repo
            .update_file(&mut env, &req.target_file, &explanation)
            .await
        {
            return Ok(repo_error(err));
        }

        Self::text(format!(
            "file {} written successfully and committed to container-use/{} remote ref",
            req.target_file,
            env.id()
        ))
    }

    #[tool(description = "Find and replace text in a file.")]
    async fn environment_file_edit(
        &self,
        Parameters(req): Parameters<EnvironmentFileEditRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let (repo, mut env) = match self
            .open_environment(req.environment_source, req.environment_id)
            .await
        {
            Ok(pair) => pair,
            Err(result) => return Ok(result),
        };
        let explanation = req.explanation.unwrap_or_default();

        if let Err(err) = env
            .file_edit(
                &req.target_file,
                &req.search_text,
                &req.replace_text,
                req.which_match.as_deref().unwrap_or_default(),
            )
            .await
        {
            let _ = repo.update(&mut env, &explanation).await;
            return Ok(env_error(err));
        }
        if let Err(err) = repo
            .update_file(&mut env, &req.target_file, &explanation)
            .await
        {
            return Ok(repo_error(err));
        }

        Self::text(format!(
            "file {} edited successfully and committed to container-use/{} remote ref",
            req.target_file,
            env.id()
        ))
    }

    #[tool(description = "Deletes a file at the specified path.")]
    async fn environment_file_delete(
        &self,
        Parameters(req): Parameters<EnvironmentFileDeleteRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let (repo, mut env) = match self
            .open_environment(req.environment_source, req.environment_id)
            .await
        {
            Ok(pair) => pair,
            Err(result) => return Ok(result),
        };
        let explanation = req.explanation.unwrap_or_default();

        if let Err(err) = env.file_delete(&req.target_file).await {
            let _ = repo.update(&mut env, &explanation).await;
            return Ok(env_error(err));
        }
        if let Err(err) = repo.update(&mut env, &explanation).await {
            return Ok(repo_error(err));
        }

        Self::text(format!(
            "file {} deleted successfully and committed to container-use/{} remote ref",
            req.target_file,
            env.id()
        ))
    }

    #[tool(description = "Add a service to the environment (e.g. database, cache, etc.)")]
    async fn environment_add_service(
        &self,
        Parameters(req): Parameters<EnvironmentAddServiceRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let (repo, mut env) = match self
            .open_environment(req.environment_source, req.environment_id)
            .await
        {
            Ok(pair) => pair,
            Err(result) => return Ok(result),
        };

        let service_config = ServiceConfig {
            name: req.name,
            image: req.image,
            command: req.command,
            exposed_ports: req.ports.unwrap_or_default(),
            env: req.envs.unwrap_or_default(),
        };
        let service = match env.add_service(service_config).await {
            Ok(service) => service,
            Err(err) => return Ok(env_error(err)),
        };
        if let Err(err) = repo
            .update(&mut env, req.explanation.as_deref().unwrap_or_default())
            .await
        {
            return Ok(repo_error(err));
        }

        let out = serde_json::to_string(&service)
            .unwrap_or_else(|_| "Failed to serialize service".to_string());
        Self::text(format!("Service added and started successfully: {out}"))
    }

    #[tool(description = "Checkpoints an environment in its current state as a container.")]
    async fn environment_checkpoint(
        &self,
        Parameters(req): Parameters<EnvironmentCheckpointRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let (_repo, env) = match self
            .open_environment(req.environment_source, req.environment_id)
            .await
        {
            Ok(pair) => pair,
            Err(result) => return Ok(result),
        };

        match env.checkpoint(&req.destination).await {
            Ok(endpoint) => Self::text(format!(
                "Checkpoint pushed to \"{endpoint}\". You MUST use the full content addressed (@sha256:...) reference in `docker` commands. The entrypoint is set to `sh`, keep that in mind when giving commands to the container."
            )),
            Err(err) => Ok(env_error(err)),
        }
    }
}

#[tool_handler]
impl ServerHandler for EnvServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "container-use".to_string(),
                title: Some("Container Use".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(SERVER_INSTRUCTIONS.to_string()),
        }
    }
}

fn error_result(kind: &str, message: impl std::fmt::Display) -> CallToolResult {
    CallToolResult::error(vec![Content::text(
        serde_json::json!({ "kind": kind, "message": message.to_string() }).to_string(),
    )])
}

fn repo_error(err: RepositoryError) -> CallToolResult {
    error_result(repository_error_kind(&err), err)
}

fn env_error(err: EnvironmentError) -> CallToolResult {
    error_result(environment_error_kind(&err), err)
}

fn repository_error_kind(err: &RepositoryError) -> &'static str {
    match err {
        RepositoryError::RefNotFound(_) => "ref_not_found",
        RepositoryError::EnvNotFound(_) => "env_not_found",
        RepositoryError::DirtyWorkingTree(_) => "dirty_working_tree",
        RepositoryError::Environment(e) => environment_error_kind(e),
        RepositoryError::Executor(e) => executor_error_kind(e),
        RepositoryError::Git(_) | RepositoryError::State(_) => "git",
        RepositoryError::Io(_) => "io",
    }
}

fn environment_error_kind(err: &EnvironmentError) -> &'static str {
    match err {
        EnvironmentError::SubmoduleWriteForbidden(_) => "submodule_write_forbidden",
        EnvironmentError::AmbiguousMatch { .. } => "ambiguous_match",
        EnvironmentError::SearchTextNotFound(_)
        | EnvironmentError::InvalidWhichMatch { .. }
        | EnvironmentError::ServiceExists(_) => "invalid_params",
        EnvironmentError::PathOutsideWorkdir(_) | EnvironmentError::Io(_) => "io",
        EnvironmentError::Executor(e) => executor_error_kind(e),
    }
}

fn executor_error_kind(err: &ExecutorError) -> &'static str {
    match err {
        ExecutorError::CommandFailed { .. } => "command_failed",
        ExecutorError::Cancelled => "cancelled",
        ExecutorError::Container(_) => "container",
        ExecutorError::Io(_) => "io",
    }
}

/// Serve the tool surface over stdio until the transport closes.
pub async fn serve_stdio(
    executor: Arc<dyn ContainerExecutor>,
    single_tenant: bool,
) -> anyhow::Result<()> {
    tracing::info!(single_tenant, "starting server");
    let service = EnvServer::new(executor, single_tenant)
        .serve(stdio())
        .await?;
    service.waiting().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rmcp::ServerHandler as _;
    use services::test_support::LocalShellExecutor;

    use super::*;

    async fn init_source_repo(dir: &std::path::Path) {
        let git = services::services::git::GitCli::new(dir);
        git.run(&["init", "-b", "main"]).await.expect("init");
        git.run(&["config", "user.name", "Test"]).await.expect("config");
        git.run(&["config", "user.email", "test@example.com"])
            .await
            .expect("config");
        std::fs::write(dir.join("README.md"), "hello\n").expect("write");
        git.run(&["add", "."]).await.expect("add");
        git.run(&["commit", "-m", "init"]).await.expect("commit");
    }

    fn server() -> EnvServer {
        EnvServer::new(Arc::new(LocalShellExecutor), true)
    }

    #[test]
    fn tool_router_registers_the_full_surface() {
        let server = server();
        for tool in [
            "environment_open",
            "environment_create",
            "environment_update_metadata",
            "environment_config",
            "environment_list",
            "environment_run_cmd",
            "environment_file_read",
            "environment_file_list",
            "environment_file_write",
            "environment_file_edit",
            "environment_file_delete",
            "environment_add_service",
            "environment_checkpoint",
        ] {
            assert!(
                server.tool_router.map.contains_key(tool),
                "missing tool {tool}"
            );
        }

        let info = server.get_info();
        assert!(info.instructions.is_some());
    }

    #[tokio::test]
    async fn single_tenant_create_requires_allow_replace() {
        let state_dir = tempfile::tempdir().expect("state dir");
        // Route Repository::open through the temp state dir.
        unsafe { std::env::set_var("CONTAINER_USE_STATE_DIR", state_dir.path()) };
        let source = tempfile::tempdir().expect("source");
        init_source_repo(source.path()).await;

        let server = server();
        let source_arg = source.path().to_string_lossy().to_string();

        let first = server
            .environment_create(Parameters(EnvironmentCreateRequest {
                explanation: None,
                environment_source: Some(source_arg.clone()),
                title: "first".to_string(),
                from_git_ref: None,
                allow_replace: None,
            }))
            .await
            .expect("first create");
        assert_ne!(first.is_error, Some(true), "first create should succeed");
        let first_id = server.session().current_id().await.expect("current id");

        let second = server
            .environment_create(Parameters(EnvironmentCreateRequest {
                explanation: None,
                environment_source: Some(source_arg.clone()),
                title: "second".to_string(),
                from_git_ref: None,
                allow_replace: None,
            }))
            .await
            .expect("second create call");
        assert_eq!(second.is_error, Some(true));

        let replaced = server
            .environment_create(Parameters(EnvironmentCreateRequest {
                explanation: None,
                environment_source: Some(source_arg),
                title: "third".to_string(),
                from_git_ref: None,
                allow_replace: Some(true),
            }))
            .await
            .expect("replace create");
        assert_ne!(replaced.is_error, Some(true), "replace should succeed");
        let new_id = server.session().current_id().await.expect("current id");
        assert_ne!(new_id, first_id);
    }

    #[tokio::test]
    async fn multi_tenant_requires_explicit_arguments() {
        let server = EnvServer::new(Arc::new(LocalShellExecutor), false);
        let result = server
            .environment_list(Parameters(EnvironmentListRequest {
                explanation: None,
                environment_source: None,
            }))
            .await
            .expect("call");
        assert_eq!(result.is_error, Some(true));
    }
}
