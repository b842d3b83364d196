use std::sync::Arc;

use clap::{Parser, Subcommand};
use docker_runtime::DockerExecutor;
use services::services::executor::ContainerExecutor;
use tracing_subscriber::{EnvFilter, prelude::*};

mod commands;
mod mcp;

#[derive(Debug, Parser)]
#[command(
    name = "container-use",
    about = "Containerized environments for coding agents",
    long_about = "Container Use creates isolated development environments for AI agents.\nEach environment runs in its own container with dedicated git branches."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Launch the MCP server on stdin/stdout
    Stdio {
        /// Serve multiple concurrent agent sessions; every tool call must
        /// pass environment_source and environment_id explicitly.
        #[arg(long)]
        multi_tenant: bool,
    },
    /// Check out an environment's branch in the source repository
    Checkout {
        env_id: String,
        /// Branch to create or update at the environment's tip
        #[arg(short, long)]
        branch: Option<String>,
    },
    /// Show the commit history of an environment
    Log {
        env_id: String,
        /// Include patches
        #[arg(short, long)]
        patch: bool,
    },
    /// Show changes an environment made on top of its base commit
    Diff { env_id: String },
    /// List available environments
    List,
    /// Delete an environment and its resources
    Delete { env_id: String },
    /// Delete environments older than specified age
    #[command(
        long_about = "Delete environments that haven't been updated within the specified time period.\nThis permanently removes old environments and their associated resources including\nbranches and container state. By default, environments older than 1 week are pruned."
    )]
    Prune {
        /// Delete environments older than this duration (e.g. 24h, 3d, 2w)
        #[arg(long, default_value = "1w")]
        before: String,
        /// Show what would be pruned without actually deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Inspect or change the defaults applied to new environments
    Config {
        #[command(subcommand)]
        command: commands::ConfigCommands,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the MCP transport in stdio mode; all logging goes to
    // stderr unconditionally.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("container_use=info,server=info,services=info,docker_runtime=info"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .init();

    let executor: Arc<dyn ContainerExecutor> = Arc::new(DockerExecutor::new());

    match cli.command {
        Commands::Stdio { multi_tenant } => {
            mcp::env_server::serve_stdio(executor, !multi_tenant).await
        }
        Commands::Checkout { env_id, branch } => {
            commands::checkout(&env_id, branch.as_deref().unwrap_or_default()).await
        }
        Commands::Log { env_id, patch } => commands::log(&env_id, patch).await,
        Commands::Diff { env_id } => commands::diff(&env_id).await,
        Commands::List => commands::list().await,
        Commands::Delete { env_id } => commands::delete(&executor, &env_id).await,
        Commands::Prune { before, dry_run } => {
            commands::prune(&executor, &before, dry_run).await
        }
        Commands::Config { command } => commands::config(command).await,
    }
}
