//! Per-process state for single-tenant sessions.
//!
//! A single-tenant MCP server serves exactly one chat session, so the
//! "current" environment can live in memory and most tools can omit
//! `environment_id`/`environment_source`. Nothing here is persisted.

use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no current environment set. Use environment_create or environment_open first")]
    NoCurrentEnvironment,
}

#[derive(Debug, Default, Clone)]
struct CurrentEnvironment {
    id: String,
    source: String,
}

#[derive(Debug, Default)]
pub struct SessionState {
    current: RwLock<CurrentEnvironment>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current_id(&self) -> Result<String, SessionError> {
        let current = self.current.read().await;
        if current.id.is_empty() {
            return Err(SessionError::NoCurrentEnvironment);
        }
        Ok(current.id.clone())
    }

    pub async fn current_source(&self) -> Result<String, SessionError> {
        let current = self.current.read().await;
        if current.source.is_empty() {
            return Err(SessionError::NoCurrentEnvironment);
        }
        Ok(current.source.clone())
    }

    pub async fn set_current_id(&self, id: &str) {
        self.current.write().await.id = id.to_string();
    }

    pub async fn set_current_source(&self, source: &str) {
        self.current.write().await.source = source.to_string();
    }

    pub async fn set_current(&self, id: &str, source: &str) {
        let mut current = self.current.write().await;
        current.id = id.to_string();
        current.source = source.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn getters_fail_until_set() {
        let state = SessionState::new();
        assert!(matches!(
            state.current_id().await,
            Err(SessionError::NoCurrentEnvironment)
        ));
        assert!(matches!(
            state.current_source().await,
            Err(SessionError::NoCurrentEnvironment)
        ));

        state.set_current("env-1", "/tmp/repo").await;
        assert_eq!(state.current_id().await.expect("id"), "env-1");
        assert_eq!(state.current_source().await.expect("source"), "/tmp/repo");
    }

    #[tokio::test]
    async fn setting_empty_values_clears_the_session() {
        let state = SessionState::new();
        state.set_current("env-1", "/tmp/repo").await;
        state.set_current("", "").await;
        assert!(state.current_id().await.is_err());
        assert!(state.current_source().await.is_err());
    }

    #[tokio::test]
    async fn individual_setters_update_one_half() {
        let state = SessionState::new();
        state.set_current_source("/tmp/repo").await;
        assert!(state.current_id().await.is_err());
        assert_eq!(state.current_source().await.expect("source"), "/tmp/repo");

        state.set_current_id("env-2").await;
        assert_eq!(state.current_id().await.expect("id"), "env-2");
    }
}
