use serde::{Deserialize, Serialize};

use crate::services::environment::EnvironmentConfig;

pub const DEFAULT_BASE_IMAGE: &str = "ubuntu:24.04";
pub const DEFAULT_WORKDIR: &str = "/workspace";

/// User-level defaults applied to newly created environments. Agents can
/// diverge per environment via `environment_config`; `config import` adopts
/// an environment's config back into these defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_image: String,
    pub setup_commands: Vec<String>,
    pub envs: Vec<String>,
    pub workdir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            setup_commands: Vec::new(),
            envs: Vec::new(),
            workdir: DEFAULT_WORKDIR.to_string(),
        }
    }
}

impl Config {
    pub fn from_raw(raw: &str) -> Self {
        match serde_json::from_str(raw) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Invalid config file, falling back to defaults: {}", err);
                Config::default()
            }
        }
    }

    pub fn environment_config(&self) -> EnvironmentConfig {
        EnvironmentConfig {
            base_image: self.base_image.clone(),
            setup_commands: self.setup_commands.clone(),
            env: self.envs.clone(),
            workdir: self.workdir.clone(),
        }
    }

    pub fn adopt(&mut self, config: &EnvironmentConfig) {
        self.base_image = config.base_image.clone();
        self.setup_commands = config.setup_commands.clone();
        self.envs = config.env.clone();
        self.workdir = config.workdir.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_raw_config_falls_back_to_defaults() {
        let config = Config::from_raw("{not json");
        assert_eq!(config.base_image, DEFAULT_BASE_IMAGE);
        assert_eq!(config.workdir, DEFAULT_WORKDIR);
    }

    #[test]
    fn partial_raw_config_keeps_defaults_for_missing_fields() {
        let config = Config::from_raw(r#"{"base_image": "alpine:3.20"}"#);
        assert_eq!(config.base_image, "alpine:3.20");
        assert_eq!(config.workdir, DEFAULT_WORKDIR);
    }
}
