//! CLI Common Utilities
//!
//! Shared initialization for command handlers: config resolution, database
//! access and the agent runtime.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::ai::provider::{ProviderConfig, create_provider};
use crate::config::{Config, ConfigLoader};
use crate::jobs::Worker;
use crate::lesson::AgentRuntime;
use crate::storage::{Database, PoolConfig, SharedDatabase};
use crate::types::{ForgeError, Result};

/// Provider name that runs agents from fixtures only
pub const FIXTURE_PROVIDER: &str = "fixture";

/// Command execution context
#[derive(Clone)]
pub struct CommandContext {
    pub config: Config,
    pub db: SharedDatabase,
}

impl CommandContext {
    /// Resolve config, then open the initialized job database
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = load_config(config_path)?;
        if config_path.is_none() {
            require_initialized()?;
        }
        let db = open_db(&config)?;
        Ok(Self { config, db })
    }

    /// Worker bound to this context's database and config
    pub fn worker(&self) -> Result<Arc<Worker>> {
        let runtime = build_runtime(&self.config)?;
        Ok(Arc::new(Worker::new(
            self.db.clone(),
            runtime,
            self.config.clone(),
        )))
    }
}

/// Explicit `--config` file, or the global → project → env chain
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(ForgeError::NotFound(format!(
                    "config file {}",
                    path.display()
                )));
            }
            ConfigLoader::load_from_file(path)
        }
        None => ConfigLoader::load(),
    }
}

pub fn require_initialized() -> Result<()> {
    if ConfigLoader::is_project_initialized() {
        Ok(())
    } else {
        Err(ForgeError::NotInitialized)
    }
}

/// Open the configured database sized for the worker pool
pub fn open_db(config: &Config) -> Result<SharedDatabase> {
    let pool = PoolConfig::for_workers(config.worker.max_concurrent_jobs);
    let db = Database::open_with_config(&config.storage.db_path, pool)?;
    if !db.is_initialized()? {
        debug!("Schema missing in {}, creating", config.storage.db_path.display());
        db.initialize()?;
    }
    Ok(Arc::new(db))
}

/// Agent runtime for the configured provider; `fixture` runs without one
pub fn build_runtime(config: &Config) -> Result<Arc<AgentRuntime>> {
    let provider = if config.llm.provider == FIXTURE_PROVIDER {
        if config.generation.fixtures_dir.is_none() {
            return Err(ForgeError::Config(
                "llm.provider = \"fixture\" requires generation.fixtures_dir".to_string(),
            ));
        }
        None
    } else {
        Some(create_provider(&ProviderConfig::from_llm_config(&config.llm))?)
    };
    Ok(Arc::new(AgentRuntime::new(provider, config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/lessonforge.toml"))).unwrap_err();
        assert!(matches!(err, ForgeError::NotFound(_)));
    }

    #[test]
    fn test_open_db_creates_schema() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.db_path = dir.path().join("nested/jobs.db");

        let db = open_db(&config).unwrap();
        assert!(db.is_initialized().unwrap());
        assert!(config.storage.db_path.exists());
    }

    #[test]
    fn test_fixture_provider_requires_fixtures_dir() {
        let mut config = Config::default();
        config.llm.provider = FIXTURE_PROVIDER.to_string();
        assert!(matches!(build_runtime(&config), Err(ForgeError::Config(_))));

        let dir = TempDir::new().unwrap();
        config.generation.fixtures_dir = Some(dir.path().to_path_buf());
        assert!(build_runtime(&config).is_ok());
    }
}
