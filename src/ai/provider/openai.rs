//! OpenAI API Provider
//!
//! OpenAI-compatible Chat Completions client. Structured calls request
//! `json_object` output and embed the (provider-sanitized) schema in the
//! system message.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{
    LlmProvider, LlmResponse, ProviderConfig, ResponseMetadata, ResponseTiming, TokenUsage,
    extract_json,
};
use crate::types::{ErrorClassifier, ForgeError, LlmError, Result};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const PROVIDER: &str = "openai";

const TEXT_SYSTEM: &str = "You are an expert instructional designer writing lesson material.";

/// OpenAI API Provider with secure API key handling
pub struct OpenAiProvider {
    api_key: SecretString,
    endpoint: url::Url,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("api_key", &"[REDACTED]")
            .field("endpoint", &self.endpoint.as_str())
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let api_key = config.api_key.ok_or_else(|| {
            ForgeError::Config(
                "OpenAI API key not found. Set OPENAI_API_KEY (or llm.api_key_env)".to_string(),
            )
        })?;

        let base = config
            .api_base
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let endpoint = url::Url::parse(&format!("{}/chat/completions", base.trim_end_matches('/')))
            .map_err(|e| ForgeError::Config(format!("Invalid llm.api_base '{}': {}", base, e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ForgeError::LlmApi(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key: SecretString::from(api_key),
            endpoint,
            model: config.model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }

    fn build_request(&self, prompt: &str, schema: Option<&Value>) -> Result<ChatCompletionRequest> {
        let (system, response_format) = match schema {
            None => (TEXT_SYSTEM.to_string(), None),
            Some(schema) => {
                let schema_str = serde_json::to_string(schema)?;
                (
                    format!(
                        "{TEXT_SYSTEM} Respond ONLY with a JSON object matching this schema, no prose:\n{schema_str}"
                    ),
                    Some(ResponseFormat {
                        format_type: "json_object".to_string(),
                    }),
                )
            }
        };

        Ok(ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system,
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: self.temperature,
            max_tokens: Some(self.max_tokens),
            response_format,
        })
    }

    async fn complete(&self, request: ChatCompletionRequest) -> Result<(String, TokenUsage, Duration)> {
        let started = Instant::now();
        debug!(model = %self.model, "Sending chat completion request");

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| ErrorClassifier::classify(&e.to_string(), PROVIDER))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ErrorClassifier::classify_http_status(status.as_u16(), &body, PROVIDER).into());
        }

        let body: ChatCompletionResponse = response.json().await.map_err(|e| {
            LlmError::with_provider(
                crate::types::ErrorCategory::Transient,
                format!("Malformed completion envelope: {}", e),
                PROVIDER,
            )
        })?;

        let usage = body
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::parse("Completion contained no message content"))?;

        Ok((content, usage, started.elapsed()))
    }

    fn response(&self, content: Value, usage: TokenUsage, elapsed: Duration) -> LlmResponse {
        LlmResponse {
            content,
            usage,
            cost_usd: 0.0,
            timing: ResponseTiming::from_duration(elapsed),
            metadata: ResponseMetadata {
                model: self.model.clone(),
                provider: PROVIDER.to_string(),
            },
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn generate_text(&self, prompt: &str) -> Result<LlmResponse> {
        let request = self.build_request(prompt, None)?;
        let (content, usage, elapsed) = self.complete(request).await?;
        Ok(self.response(Value::String(content), usage, elapsed))
    }

    async fn generate_structured(&self, prompt: &str, schema: &Value) -> Result<LlmResponse> {
        let request = self.build_request(prompt, Some(schema))?;
        let (content, usage, elapsed) = self.complete(request).await?;
        debug!("Raw structured output: {}", content);
        let parsed = extract_json(&content).map_err(|e| LlmError {
            provider: Some(PROVIDER.to_string()),
            ..e
        })?;
        Ok(self.response(parsed, usage, elapsed))
    }

    fn name(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    prompt_tokens: u32,
    completion_tokens: u32,
}
