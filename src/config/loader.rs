//! Configuration Loader (Figment-based)
//!
//! Loads and merges configuration from multiple sources using Figment:
//! 1. Built-in defaults (Serialized)
//! 2. Global config (~/.config/lessonforge/config.toml)
//! 3. Project config (.lessonforge/config.toml)
//! 4. Environment variables (LESSONFORGE_* prefix, `__` separates nesting)

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::types::Config;
use crate::types::{ForgeError, Result};

const ENV_PREFIX: &str = "LESSONFORGE_";

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with full resolution chain:
    /// defaults → global → project → env vars
    pub fn load() -> Result<Config> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            debug!("Loading global config from: {}", global_path.display());
            figment = figment.merge(Toml::file(&global_path));
        }

        let project_path = Self::project_config_path();
        if project_path.exists() {
            debug!("Loading project config from: {}", project_path.display());
            figment = figment.merge(Toml::file(&project_path));
        }

        Self::extract(figment.merge(Self::env_provider()))
    }

    /// Load configuration from a specific file plus environment overrides
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Self::env_provider());
        Self::extract(figment)
    }

    fn env_provider() -> Env {
        // LESSONFORGE_WORKER__BATCH_SIZE -> worker.batch_size
        Env::prefixed(ENV_PREFIX).split("__").lowercase(true)
    }

    fn extract(figment: Figment) -> Result<Config> {
        let config: Config = figment
            .extract()
            .map_err(|e| ForgeError::Config(format!("Configuration error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    // =========================================================================
    // Path Management
    // =========================================================================

    /// Get path to global config directory (~/.config/lessonforge/)
    pub fn global_dir() -> Option<PathBuf> {
        env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                env::var("HOME")
                    .ok()
                    .map(|home| PathBuf::from(home).join(".config"))
            })
            .map(|p| p.join("lessonforge"))
    }

    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn project_config_path() -> PathBuf {
        Self::project_dir().join("config.toml")
    }

    pub fn project_dir() -> PathBuf {
        PathBuf::from(".lessonforge")
    }

    pub fn is_project_initialized() -> bool {
        Self::project_dir().exists()
    }

    // =========================================================================
    // Rendering
    // =========================================================================

    /// Render a config as TOML or JSON
    pub fn render(config: &Config, as_json: bool) -> Result<String> {
        if as_json {
            Ok(serde_json::to_string_pretty(config)?)
        } else {
            toml::to_string_pretty(config).map_err(|e| ForgeError::Config(e.to_string()))
        }
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Create `.lessonforge/` with a default config; existing files are kept
    pub fn init_project(root: &Path) -> Result<PathBuf> {
        let project_dir = root.join(Self::project_dir());
        fs::create_dir_all(&project_dir)?;
        fs::create_dir_all(project_dir.join("fixtures"))?;

        let config_path = project_dir.join("config.toml");
        if !config_path.exists() {
            fs::write(&config_path, Self::default_project_config())?;
            info!("Created project config: {}", config_path.display());
        } else {
            info!("Project config exists: {}", config_path.display());
        }

        Ok(project_dir)
    }

    fn default_project_config() -> String {
        r#"# lessonforge project configuration
# Values here override ~/.config/lessonforge/config.toml.
# Environment overrides use LESSONFORGE_<SECTION>__<KEY>, e.g. LESSONFORGE_LLM__MODEL.

version = "1.0"

[llm]
provider = "openai"
model = "gpt-4o-mini"
timeout_secs = 180

[generation]
section_concurrency = 1
enable_repair = true
default_blueprint = "standard"
# fixtures_dir = ".lessonforge/fixtures"

[worker]
poll_interval_ms = 2000
max_concurrent_jobs = 4

[storage]
db_path = ".lessonforge/lessonforge.db"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_from_file_merges_over_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[generation]\nsection_concurrency = 3\n\n[repair]\nnoise_threshold = 5\n",
        )
        .unwrap();

        let config = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(config.generation.section_concurrency, 3);
        assert_eq!(config.repair.noise_threshold, 5);
        assert!(config.generation.enable_repair);
    }

    #[test]
    fn test_load_from_file_runs_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[llm]\ntemperature = 5.0\n").unwrap();

        assert!(matches!(
            ConfigLoader::load_from_file(&path),
            Err(ForgeError::Config(_))
        ));
    }

    #[test]
    fn test_init_project_writes_parseable_config() {
        let dir = TempDir::new().unwrap();
        let project_dir = ConfigLoader::init_project(dir.path()).unwrap();

        let config_path = project_dir.join("config.toml");
        assert!(config_path.exists());
        assert!(project_dir.join("fixtures").exists());

        let config = ConfigLoader::load_from_file(&config_path).unwrap();
        assert_eq!(config.llm.provider, "openai");
    }

    #[test]
    fn test_render_toml() {
        let rendered = ConfigLoader::render(&Config::default(), false).unwrap();
        assert!(rendered.contains("[generation]"));
    }
}
