//! Lesson Agents
//!
//! - [`Planner`]: request → lesson plan
//! - [`SectionBuilder`]: plan section → section payload
//! - [`Repairer`]: invalid section → patched section (wraps the repair engine)
//! - [`Stitcher`]: validated sections → final lesson (deterministic)
//!
//! Every agent shares one [`AgentRuntime`]: provider, pricing, fixtures,
//! prompt library, schema service and blueprints, all loaded once.

mod fixtures;
mod planner;
mod repairer;
mod section;
mod stitcher;

pub use fixtures::FixtureSet;
pub use planner::Planner;
pub use repairer::Repairer;
pub use section::{SectionBuilder, SectionRequest};
pub use stitcher::{StitchInput, Stitcher};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::blueprint::BlueprintRegistry;
use super::schema::SchemaService;
use super::types::{GenerationRequest, JobContext};
use super::widgets::{KindSet, WidgetRegistry};
use crate::ai::{PricingTable, PromptLibrary, SharedProvider, UsageRecord, with_timeout};
use crate::config::Config;
use crate::types::{AgentError, ForgeError, Result};

/// Output of one agent call with its usage records
#[derive(Debug, Clone)]
pub struct AgentRun<T> {
    pub output: T,
    pub usage: Vec<UsageRecord>,
    /// Produced from a fixture instead of a live call
    pub fixture: bool,
}

impl<T> AgentRun<T> {
    pub fn live(output: T, usage: Vec<UsageRecord>) -> Self {
        Self {
            output,
            usage,
            fixture: false,
        }
    }

    pub fn fixture(output: T) -> Self {
        Self {
            output,
            usage: Vec::new(),
            fixture: true,
        }
    }

    /// Output without any provider call
    pub fn local(output: T) -> Self {
        Self::live(output, Vec::new())
    }
}

/// Agent contract consumed by the orchestrator
#[async_trait]
pub trait Agent: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    fn name(&self) -> &'static str;

    async fn run(
        &self,
        input: &Self::Input,
        ctx: &JobContext,
    ) -> std::result::Result<AgentRun<Self::Output>, AgentError>;
}

// =============================================================================
// Agent Runtime
// =============================================================================

/// Shared collaborators for all agents of one process
pub struct AgentRuntime {
    provider: Option<SharedProvider>,
    pricing: PricingTable,
    fixtures: FixtureSet,
    prompts: PromptLibrary,
    schemas: SchemaService,
    blueprints: BlueprintRegistry,
    call_timeout: Duration,
}

impl AgentRuntime {
    /// Build from configuration. Without a provider, every agent call must be
    /// served by a fixture.
    pub fn new(provider: Option<SharedProvider>, config: &Config) -> Result<Self> {
        Ok(Self {
            provider,
            pricing: PricingTable::new(config.pricing.clone()),
            fixtures: FixtureSet::load(config.generation.fixtures_dir.as_deref())?,
            prompts: PromptLibrary::load(config.generation.prompts_dir.as_deref())?,
            schemas: SchemaService::new(Arc::new(WidgetRegistry::builtin())),
            blueprints: BlueprintRegistry::builtin(),
            call_timeout: config.llm.timeout(),
        })
    }

    pub fn with_fixtures(mut self, fixtures: FixtureSet) -> Self {
        self.fixtures = fixtures;
        self
    }

    pub fn fixtures(&self) -> &FixtureSet {
        &self.fixtures
    }

    pub fn prompts(&self) -> &PromptLibrary {
        &self.prompts
    }

    pub fn schemas(&self) -> &SchemaService {
        &self.schemas
    }

    pub fn widgets(&self) -> &WidgetRegistry {
        self.schemas.registry()
    }

    pub fn blueprints(&self) -> &BlueprintRegistry {
        &self.blueprints
    }

    /// Provider name actually in use (`fixture` when none)
    pub fn provider_name(&self) -> &str {
        self.provider.as_ref().map(|p| p.name()).unwrap_or("fixture")
    }

    pub fn model_name(&self) -> &str {
        self.provider.as_ref().map(|p| p.model()).unwrap_or("fixture")
    }

    /// Widget kinds a request may use after blueprint narrowing
    pub fn allowed_widgets(&self, request: &GenerationRequest) -> KindSet {
        self.blueprints
            .effective_widgets(&request.blueprint, request.allowed_widgets)
    }

    /// One structured call with a single retry.
    ///
    /// `decode` turns the raw JSON into the agent's output; a decode failure is
    /// treated like a provider parse error. A retryable failure gets exactly
    /// one more attempt with the failure message appended to the prompt.
    pub async fn structured<T, F>(
        &self,
        agent: &str,
        prompt: &str,
        schema: &Value,
        decode: F,
    ) -> std::result::Result<(T, Vec<UsageRecord>), AgentError>
    where
        T: Send,
        F: Fn(Value) -> std::result::Result<T, String> + Send + Sync,
    {
        let provider = self.provider.as_ref().ok_or_else(|| {
            AgentError::fatal(agent, "no LLM provider configured and no fixture available")
        })?;
        let mut usage = Vec::new();

        let first = self
            .attempt(provider, agent, prompt, schema, &decode, &mut usage)
            .await;
        let failure = match first {
            Ok(output) => return Ok((output, usage)),
            Err(err) if err.is_retryable() => err,
            Err(err) => return Err(err),
        };

        warn!("{} output rejected, retrying once: {}", agent, failure.message());
        let retry_prompt = format!(
            "{}\n\n<PREVIOUS_ATTEMPT_FAILED>\n{}\nReturn JSON that matches the schema exactly.\n</PREVIOUS_ATTEMPT_FAILED>",
            prompt,
            failure.message()
        );
        let second = self
            .attempt(provider, agent, &retry_prompt, schema, &decode, &mut usage)
            .await;
        match second {
            Ok(output) => Ok((output, usage)),
            Err(err) => Err(err.into_fatal()),
        }
    }

    async fn attempt<T, F>(
        &self,
        provider: &SharedProvider,
        agent: &str,
        prompt: &str,
        schema: &Value,
        decode: &F,
        usage: &mut Vec<UsageRecord>,
    ) -> std::result::Result<T, AgentError>
    where
        F: Fn(Value) -> std::result::Result<T, String>,
    {
        debug!(agent, prompt_chars = prompt.len(), "Structured call");
        let call = provider.generate_structured(prompt, schema);
        match with_timeout(self.call_timeout, call, agent).await {
            Ok(response) => {
                usage.push(self.pricing.record(agent, &response));
                debug!(agent, "Raw output: {}", response.content);
                decode(response.content).map_err(|msg| AgentError::retryable(agent, msg))
            }
            Err(ForgeError::Llm(err)) => Err(AgentError::from_llm(agent, &err)),
            Err(err @ ForgeError::Timeout { .. }) => {
                Err(AgentError::retryable(agent, err.to_string()))
            }
            Err(err) => Err(AgentError::fatal(agent, err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedProvider;
    use crate::types::LlmError;
    use serde_json::json;

    fn runtime(provider: Option<SharedProvider>) -> AgentRuntime {
        AgentRuntime::new(provider, &Config::default()).unwrap()
    }

    fn decode_object(value: Value) -> std::result::Result<Value, String> {
        if value.is_object() {
            Ok(value)
        } else {
            Err(format!("expected an object, got {}", value))
        }
    }

    #[tokio::test]
    async fn test_structured_without_provider_is_fatal() {
        let err = runtime(None)
            .structured("planner", "p", &json!({}), decode_object)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_parse_failure_retries_once_with_error_appended() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_err(LlmError::parse("unexpected end of input"))
                .then_ok(json!({"ok": true})),
        );
        let rt = runtime(Some(provider.clone()));

        let (value, usage) = rt
            .structured("planner", "base prompt", &json!({}), decode_object)
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(usage.len(), 1);
        assert_eq!(provider.calls(), 2);
        let prompts = provider.prompts();
        assert!(prompts[1].starts_with("base prompt"));
        assert!(prompts[1].contains("unexpected end of input"));
    }

    #[tokio::test]
    async fn test_decode_failure_counts_as_retryable() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_ok(json!([1, 2]))
                .then_ok(json!("still wrong")),
        );
        let rt = runtime(Some(provider.clone()));

        let err = rt
            .structured("section_builder", "p", &json!({}), decode_object)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::new().then_err(LlmError::new(
            crate::types::ErrorCategory::Auth,
            "invalid api key",
        )));
        let rt = runtime(Some(provider.clone()));

        assert!(rt.structured("planner", "p", &json!({}), decode_object).await.is_err());
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn test_identifiers_without_provider() {
        let rt = runtime(None);
        assert_eq!(rt.provider_name(), "fixture");
        assert_eq!(rt.model_name(), "fixture");
    }
}
