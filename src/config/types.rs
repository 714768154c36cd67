//! Configuration Types
//!
//! All configuration structures with defaults.
//! Supports global (~/.config/lessonforge/) and project (.lessonforge/) level configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants;
use crate::types::{ForgeError, Result};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// LLM provider settings
    pub llm: LlmConfig,

    /// Lesson generation settings
    pub generation: GenerationConfig,

    /// Repair engine settings
    pub repair: RepairConfig,

    /// Background worker settings
    pub worker: WorkerConfig,

    /// Job progress tracker settings
    pub tracker: TrackerConfig,

    /// Per-user quota limits
    pub quota: QuotaConfig,

    /// USD pricing per model, keyed by model name
    pub pricing: BTreeMap<String, ModelPricing>,

    /// Storage settings
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut pricing = BTreeMap::new();
        pricing.insert(
            "gpt-4o-mini".to_string(),
            ModelPricing {
                input_per_1k: 0.00015,
                output_per_1k: 0.0006,
            },
        );
        pricing.insert(
            "gpt-4o".to_string(),
            ModelPricing {
                input_per_1k: 0.0025,
                output_per_1k: 0.01,
            },
        );

        Self {
            version: "1.0".to_string(),
            llm: LlmConfig::default(),
            generation: GenerationConfig::default(),
            repair: RepairConfig::default(),
            worker: WorkerConfig::default(),
            tracker: TrackerConfig::default(),
            quota: QuotaConfig::default(),
            pricing,
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `ForgeError::Config` on validation failure.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ForgeError::Config(format!(
                "LLM temperature must be between 0.0 and 2.0, got {}",
                self.llm.temperature
            )));
        }

        if self.llm.timeout_secs == 0 {
            return Err(ForgeError::Config(
                "LLM timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.generation.section_concurrency == 0 {
            return Err(ForgeError::Config(
                "generation.section_concurrency must be at least 1".to_string(),
            ));
        }

        if self.repair.noise_threshold == 0 {
            return Err(ForgeError::Config(
                "repair.noise_threshold must be greater than 0".to_string(),
            ));
        }

        if self.worker.batch_size == 0 || self.worker.max_concurrent_jobs == 0 {
            return Err(ForgeError::Config(
                "worker.batch_size and worker.max_concurrent_jobs must be greater than 0"
                    .to_string(),
            ));
        }

        if self.worker.soft_timeout_secs > self.worker.hard_timeout_secs {
            return Err(ForgeError::Config(format!(
                "worker.soft_timeout_secs ({}) exceeds hard_timeout_secs ({})",
                self.worker.soft_timeout_secs, self.worker.hard_timeout_secs
            )));
        }

        if self.tracker.log_window == 0 {
            return Err(ForgeError::Config(
                "tracker.log_window must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// LLM Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name ("openai" or "fixture")
    pub provider: String,

    /// Model name
    pub model: String,

    /// Override for the OpenAI-compatible base URL
    pub api_base: Option<String>,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Sampling temperature
    pub temperature: f32,

    /// Completion token cap
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: constants::llm::DEFAULT_MODEL.to_string(),
            api_base: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: constants::llm::DEFAULT_TIMEOUT_SECS,
            temperature: constants::llm::DEFAULT_TEMPERATURE,
            max_tokens: constants::llm::DEFAULT_MAX_TOKENS,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// =============================================================================
// Generation Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Sections built concurrently within one job (1 = sequential)
    pub section_concurrency: usize,

    /// Run the repair engine when a section fails validation
    pub enable_repair: bool,

    /// Blueprint used when a request names none
    pub default_blueprint: String,

    /// Widget kinds allowed when a request names none (empty = blueprint defaults)
    pub default_widgets: Vec<String>,

    /// Directory of deterministic agent fixtures; bypasses live generation
    pub fixtures_dir: Option<PathBuf>,

    /// Directory of prompt template overrides
    pub prompts_dir: Option<PathBuf>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            section_concurrency: 1,
            enable_repair: true,
            default_blueprint: "standard".to_string(),
            default_widgets: Vec::new(),
            fixtures_dir: None,
            prompts_dir: None,
        }
    }
}

// =============================================================================
// Repair Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Error count on one target above which messages are collapsed
    pub noise_threshold: usize,

    /// Allow the model-assisted patch step
    pub model_repair: bool,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            noise_threshold: constants::repair::NOISE_THRESHOLD,
            model_repair: true,
        }
    }
}

// =============================================================================
// Worker Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_concurrent_jobs: usize,
    /// Elapsed time after which a warning is logged at the next stage boundary
    pub soft_timeout_secs: u64,
    /// Elapsed time after which the job is aborted at the next stage boundary
    pub hard_timeout_secs: u64,
    /// Maximum client-requested retries per job
    pub retry_limit: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: constants::worker::DEFAULT_POLL_INTERVAL_MS,
            batch_size: constants::worker::DEFAULT_BATCH_SIZE,
            max_concurrent_jobs: constants::worker::DEFAULT_MAX_CONCURRENT_JOBS,
            soft_timeout_secs: constants::worker::DEFAULT_SOFT_TIMEOUT_SECS,
            hard_timeout_secs: constants::worker::DEFAULT_HARD_TIMEOUT_SECS,
            retry_limit: constants::worker::DEFAULT_RETRY_LIMIT,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// =============================================================================
// Tracker Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Rolling log lines kept on the job record
    pub log_window: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            log_window: constants::tracker::DEFAULT_LOG_WINDOW,
        }
    }
}

// =============================================================================
// Quota Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Accounting period label ("monthly", "daily", ...)
    pub period: String,

    /// Lessons per user per period (unset = unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lessons_limit: Option<u32>,

    /// Sections per user per period (unset = unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sections_limit: Option<u32>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            period: constants::quota::DEFAULT_PERIOD.to_string(),
            lessons_limit: None,
            sections_limit: None,
        }
    }
}

// =============================================================================
// Pricing
// =============================================================================

/// USD per 1K tokens
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

// =============================================================================
// Storage Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".lessonforge/lessonforge.db"),
        }
    }
}
