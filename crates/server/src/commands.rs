//! CLI subcommands. Everything delegates to the repository facade; the
//! current directory is the source repository.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Subcommand;
use services::services::{config, executor::ContainerExecutor, repository::Repository};
use utils::text::{time_ago, truncate_with_ellipsis};

const LIST_TITLE_WIDTH: usize = 50;

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print the current defaults
    Show,
    /// Set the default base image for new environments
    SetBaseImage { image: String },
    /// Append a setup command run on top of the base image
    AddSetupCommand { command: String },
    /// Add a default KEY=VALUE environment variable
    SetEnv { env: String },
    /// Set the default container workdir
    SetWorkdir { dir: String },
    /// Adopt an existing environment's config as the new defaults
    Import { env_id: String },
}

async fn open_repository() -> anyhow::Result<Repository> {
    Repository::open(".")
        .await
        .context("failed to open repository")
}

pub async fn checkout(env_id: &str, target_branch: &str) -> anyhow::Result<()> {
    let repo = open_repository().await?;
    let branch = repo.checkout(env_id, target_branch).await?;
    println!("Switched to branch '{branch}'");
    Ok(())
}

pub async fn log(env_id: &str, patch: bool) -> anyhow::Result<()> {
    let repo = open_repository().await?;
    let mut stdout = tokio::io::stdout();
    repo.log(env_id, patch, &mut stdout).await?;
    Ok(())
}

pub async fn diff(env_id: &str) -> anyhow::Result<()> {
    let repo = open_repository().await?;
    let mut stdout = tokio::io::stdout();
    repo.diff(env_id, &mut stdout).await?;
    Ok(())
}

pub async fn list() -> anyhow::Result<()> {
    let repo = open_repository().await?;
    let mut envs = repo.list().await?;
    envs.sort_by(|a, b| b.state.updated_at.cmp(&a.state.updated_at));
    for env in envs {
        let title = truncate_with_ellipsis(&env.state.title, LIST_TITLE_WIDTH);
        println!(
            "{}\t{} (updated {})",
            env.id,
            title,
            time_ago(env.state.updated_at)
        );
    }
    Ok(())
}

pub async fn delete(executor: &Arc<dyn ContainerExecutor>, env_id: &str) -> anyhow::Result<()> {
    let repo = open_repository().await?;
    repo.delete(executor, env_id).await?;
    println!("Environment '{env_id}' deleted successfully.");
    Ok(())
}

pub async fn prune(
    executor: &Arc<dyn ContainerExecutor>,
    before: &str,
    dry_run: bool,
) -> anyhow::Result<()> {
    let duration = humantime::parse_duration(before)
        .with_context(|| format!("invalid --before format: {before}"))?;
    let cutoff = Utc::now()
        - chrono::Duration::from_std(duration).context("duration out of range")?;

    let repo = open_repository().await?;
    let envs = repo.list().await?;
    if envs.is_empty() {
        println!("No environments found.");
        return Ok(());
    }

    let to_prune: Vec<String> = envs
        .into_iter()
        .filter(|env| env.state.updated_at < cutoff)
        .map(|env| env.id)
        .collect();

    if to_prune.is_empty() {
        println!("No environments older than {before} found.");
        return Ok(());
    }

    if dry_run {
        println!("Would prune {} environment(s) older than {before}:", to_prune.len());
        for env_id in &to_prune {
            println!("  - {env_id}");
        }
        return Ok(());
    }

    println!("Pruning {} environment(s) older than {before}...", to_prune.len());
    let mut deleted = 0usize;
    for env_id in &to_prune {
        match repo.delete(executor, env_id).await {
            Ok(()) => {
                println!("Environment '{env_id}' deleted successfully.");
                deleted += 1;
            }
            Err(err) => println!("Failed to delete environment '{env_id}': {err}"),
        }
    }
    println!("Successfully deleted {deleted} environment(s).");
    Ok(())
}

pub async fn config(command: ConfigCommands) -> anyhow::Result<()> {
    let config_path = utils::paths::config_path();
    let mut config = config::load_config_from_file(&config_path).await;

    match command {
        ConfigCommands::Show => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        ConfigCommands::SetBaseImage { image } => config.base_image = image,
        ConfigCommands::AddSetupCommand { command } => config.setup_commands.push(command),
        ConfigCommands::SetEnv { env } => {
            anyhow::ensure!(env.contains('='), "expected KEY=VALUE, got '{env}'");
            config.envs.push(env);
        }
        ConfigCommands::SetWorkdir { dir } => config.workdir = dir,
        ConfigCommands::Import { env_id } => {
            let repo = open_repository().await?;
            let envs = repo.list().await?;
            let env = envs
                .into_iter()
                .find(|e| e.id == env_id)
                .with_context(|| format!("environment not found: {env_id}"))?;
            config.adopt(&env.state.config);
        }
    }

    config::save_config_to_file(&config, &config_path).await?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn prune_durations_parse_week_forms() {
        assert!(humantime::parse_duration("1w").is_ok());
        assert!(humantime::parse_duration("24h").is_ok());
        assert!(humantime::parse_duration("3d").is_ok());
        assert!(humantime::parse_duration("not-a-duration").is_err());
    }
}
