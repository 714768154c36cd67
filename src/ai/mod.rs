//! AI Integration Layer
//!
//! Provider abstraction, prompt construction, usage accounting and timeouts
//! shared by the lesson agents.

pub mod prompt;
pub mod provider;
pub mod timeout;
pub mod usage;

pub use prompt::{PromptBuilder, PromptLibrary, PromptName};
pub use provider::{
    LlmProvider, LlmResponse, OpenAiProvider, ProviderConfig, ResponseMetadata, ResponseTiming,
    SharedProvider, TokenUsage, create_provider, extract_json,
};
pub use timeout::{JobDeadline, with_timeout};
pub use usage::{CostSummary, PricingTable, UsageRecord};
