//! LLM Provider Abstraction
//!
//! Defines the [`LlmProvider`] capability consumed by agents: free-text
//! generation and schema-constrained JSON generation. Every response carries
//! token usage so callers can record cost per call.
//!
//! ## Modules
//!
//! - `openai`: OpenAI-compatible Chat Completions client
//! - `parse`: JSON extraction from raw model text

mod openai;
mod parse;

pub use openai::OpenAiProvider;
pub use parse::extract_json;

pub use crate::types::{ErrorCategory, ErrorClassifier, LlmError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::types::{ForgeError, Result};

// =============================================================================
// LLM Response with Usage Metrics
// =============================================================================

/// LLM response including content and usage metrics
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Generated content (`Value::String` for text generation)
    pub content: Value,
    pub usage: TokenUsage,
    /// Provider-reported cost in USD (0.0 when the provider does not report it)
    pub cost_usd: f64,
    pub timing: ResponseTiming,
    pub metadata: ResponseMetadata,
}

impl LlmResponse {
    /// Response with content only (usage unknown)
    pub fn content_only(content: Value) -> Self {
        Self {
            content,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            timing: ResponseTiming::default(),
            metadata: ResponseMetadata::default(),
        }
    }

    /// Text content, if the response is a string
    pub fn text(&self) -> Option<&str> {
        self.content.as_str()
    }
}

/// Token usage metrics for cost tracking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Response timing metrics
#[derive(Debug, Clone, Default)]
pub struct ResponseTiming {
    /// Wall clock time in milliseconds
    pub total_ms: u64,
}

impl ResponseTiming {
    pub fn from_duration(duration: std::time::Duration) -> Self {
        Self {
            total_ms: duration.as_millis() as u64,
        }
    }
}

/// Provider and model that actually served a call
#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata {
    pub model: String,
    pub provider: String,
}

/// Shared LLM provider type for concurrent access across agents.
pub type SharedProvider = Arc<dyn LlmProvider + Send + Sync>;

// =============================================================================
// Provider Configuration
// =============================================================================

/// Configuration for LLM providers.
///
/// The API key is never serialized and is redacted in debug output.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: String,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    pub max_tokens: u32,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("temperature", &self.temperature)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_base", &self.api_base)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl ProviderConfig {
    /// Build from the `[llm]` config section, reading the key from its env var
    pub fn from_llm_config(llm: &LlmConfig) -> Self {
        Self {
            provider: llm.provider.clone(),
            model: llm.model.clone(),
            timeout_secs: llm.timeout_secs,
            temperature: llm.temperature,
            api_key: std::env::var(&llm.api_key_env).ok(),
            api_base: llm.api_base.clone(),
            max_tokens: llm.max_tokens,
        }
    }
}

// =============================================================================
// LLM Provider Trait
// =============================================================================

/// LLM provider capability.
///
/// Failures are reported as [`ForgeError::Llm`] with a category; a
/// [`ErrorCategory::ParseError`] means the model answered but the output was
/// not the requested JSON.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate free text; `content` is a `Value::String`
    async fn generate_text(&self, prompt: &str) -> Result<LlmResponse>;

    /// Generate JSON constrained by `schema`
    async fn generate_structured(&self, prompt: &str, schema: &Value) -> Result<LlmResponse>;

    /// Provider name for logging
    fn name(&self) -> &str;

    /// Model name currently in use
    fn model(&self) -> &str;
}

/// Create a shared provider from configuration
pub fn create_provider(config: &ProviderConfig) -> Result<SharedProvider> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiProvider::new(config.clone())?)),
        other => Err(ForgeError::Config(format!(
            "Unknown provider: {}. Supported: openai (or 'fixture' with generation.fixtures_dir)",
            other
        ))),
    }
}
