//! Unified Error Type System
//!
//! Centralized error types for the lesson pipeline.
//!
//! ## Layers
//!
//! - [`ForgeError`]: application error returned by storage, config, providers
//!   and the job tracker
//! - [`LlmError`] + [`ErrorCategory`]: structured provider failures with retry hints
//! - [`AgentError`]: explicit retryable/fatal outcome of a single agent call
//!
//! Cancellation and quota exhaustion are ordinary variants so callers can route
//! them to quiet job outcomes instead of treating them as defects.

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Error Categories
// =============================================================================

/// Error categories for retry routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rate limited - wait then retry
    RateLimit,
    /// Context/token limit exceeded
    TokenLimit,
    /// Authentication failed - fail fast
    Auth,
    /// Network/connectivity issues
    Network,
    /// Provider unavailable
    Unavailable,
    /// Invalid request - don't retry
    BadRequest,
    /// Model output could not be parsed - retry with the parser error appended
    ParseError,
    /// Temporary server issues
    Transient,
    /// Unknown error
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimit => write!(f, "RATE_LIMIT"),
            Self::TokenLimit => write!(f, "TOKEN_LIMIT"),
            Self::Auth => write!(f, "AUTH"),
            Self::Network => write!(f, "NETWORK"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
            Self::BadRequest => write!(f, "BAD_REQUEST"),
            Self::ParseError => write!(f, "PARSE_ERROR"),
            Self::Transient => write!(f, "TRANSIENT"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl ErrorCategory {
    /// Whether an agent may spend its single extra attempt on this failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Network | Self::Transient | Self::ParseError
        )
    }

    pub fn recommended_delay(&self) -> Duration {
        match self {
            Self::RateLimit => Duration::from_secs(30),
            Self::Network => Duration::from_secs(5),
            Self::Transient => Duration::from_secs(2),
            _ => Duration::ZERO,
        }
    }
}

// =============================================================================
// LLM Error
// =============================================================================

/// LLM error with category, provider and retry hint
#[derive(Debug, Clone)]
pub struct LlmError {
    pub category: ErrorCategory,
    pub message: String,
    pub provider: Option<String>,
    pub retry_after: Option<Duration>,
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(provider) = &self.provider {
            write!(f, "[{}:{}] {}", provider, self.category, self.message)
        } else {
            write!(f, "[{}] {}", self.category, self.message)
        }
    }
}

impl std::error::Error for LlmError {}

impl LlmError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            provider: None,
            retry_after: None,
        }
    }

    pub fn with_provider(
        category: ErrorCategory,
        message: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            category,
            message: message.into(),
            provider: Some(provider.into()),
            retry_after: None,
        }
    }

    /// Output that is not the JSON the caller asked for
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ParseError, message)
    }

    pub fn retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    pub fn recommended_delay(&self) -> Duration {
        self.retry_after
            .unwrap_or_else(|| self.category.recommended_delay())
    }
}

// =============================================================================
// Error Classifier
// =============================================================================

/// Maps raw provider failures onto [`ErrorCategory`]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify a free-form error message
    pub fn classify(message: &str, provider: &str) -> LlmError {
        let lower = message.to_lowercase();

        if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests")
        {
            return LlmError::with_provider(ErrorCategory::RateLimit, message, provider)
                .retry_after(Duration::from_secs(30));
        }

        if lower.contains("context length")
            || lower.contains("maximum context")
            || (lower.contains("token") && lower.contains("limit"))
        {
            return LlmError::with_provider(ErrorCategory::TokenLimit, message, provider);
        }

        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("api key")
            || lower.contains("unauthorized")
        {
            return LlmError::with_provider(ErrorCategory::Auth, message, provider);
        }

        if lower.contains("connection")
            || lower.contains("dns")
            || lower.contains("timed out")
            || lower.contains("timeout")
        {
            return LlmError::with_provider(ErrorCategory::Network, message, provider)
                .retry_after(Duration::from_secs(5));
        }

        if lower.contains("502")
            || lower.contains("503")
            || lower.contains("overloaded")
            || lower.contains("service unavailable")
        {
            return LlmError::with_provider(ErrorCategory::Transient, message, provider)
                .retry_after(Duration::from_secs(2));
        }

        if lower.contains("parse")
            || lower.contains("json")
            || lower.contains("expected value")
            || lower.contains("eof while")
        {
            return LlmError::with_provider(ErrorCategory::ParseError, message, provider);
        }

        if lower.contains("400") || lower.contains("bad request") {
            return LlmError::with_provider(ErrorCategory::BadRequest, message, provider);
        }

        LlmError::with_provider(ErrorCategory::Unknown, message, provider)
    }

    /// Classify an HTTP status code directly
    pub fn classify_http_status(status: u16, message: &str, provider: &str) -> LlmError {
        match status {
            429 => LlmError::with_provider(ErrorCategory::RateLimit, message, provider)
                .retry_after(Duration::from_secs(30)),
            401 | 403 => LlmError::with_provider(ErrorCategory::Auth, message, provider),
            400 | 422 => LlmError::with_provider(ErrorCategory::BadRequest, message, provider),
            500 | 502 | 503 | 504 => {
                LlmError::with_provider(ErrorCategory::Transient, message, provider)
                    .retry_after(Duration::from_secs(5))
            }
            404 => LlmError::with_provider(ErrorCategory::Unavailable, message, provider),
            _ => LlmError::with_provider(ErrorCategory::Unknown, message, provider),
        }
    }
}

// =============================================================================
// Agent Error
// =============================================================================

/// Outcome of a failed agent call.
///
/// `Retryable` failures get exactly one more attempt at the call site with the
/// failure message appended to the prompt; `Fatal` failures abort the stage.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("{agent} (retryable): {message}")]
    Retryable { agent: String, message: String },

    #[error("{agent}: {message}")]
    Fatal { agent: String, message: String },
}

impl AgentError {
    pub fn retryable(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Retryable {
            agent: agent.into(),
            message: message.into(),
        }
    }

    pub fn fatal(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            agent: agent.into(),
            message: message.into(),
        }
    }

    /// Convert a provider failure, keeping its retry classification
    pub fn from_llm(agent: &str, err: &LlmError) -> Self {
        if err.is_retryable() {
            Self::retryable(agent, err.to_string())
        } else {
            Self::fatal(agent, err.to_string())
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable { message, .. } | Self::Fatal { message, .. } => message,
        }
    }

    /// Escalate a retryable failure once the retry budget is spent
    pub fn into_fatal(self) -> Self {
        match self {
            Self::Retryable { agent, message } => Self::Fatal { agent, message },
            fatal => fatal,
        }
    }
}

// =============================================================================
// Application Error
// =============================================================================

#[derive(Debug, Error)]
pub enum ForgeError {
    // -------------------------------------------------------------------------
    // System Errors (auto From impl)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // -------------------------------------------------------------------------
    // LLM Errors
    // -------------------------------------------------------------------------
    #[error("LLM error: {0}")]
    Llm(LlmError),

    #[error("LLM API error: {0}")]
    LlmApi(String),

    #[error(transparent)]
    Agent(#[from] AgentError),

    // -------------------------------------------------------------------------
    // Job Errors
    // -------------------------------------------------------------------------
    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Job {job_id} was canceled")]
    Canceled { job_id: String },

    #[error("Quota exceeded for {metric}: {used}/{limit} used")]
    QuotaExceeded { metric: String, limit: u32, used: u32 },

    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Retry limit reached for job {job_id} ({limit} retries)")]
    RetryLimit { job_id: String, limit: u32 },

    // -------------------------------------------------------------------------
    // Domain Errors
    // -------------------------------------------------------------------------
    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not initialized: run 'lessonforge init' first")]
    NotInitialized,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Fixture error: {0}")]
    Fixture(String),
}

impl From<LlmError> for ForgeError {
    fn from(err: LlmError) -> Self {
        ForgeError::Llm(err)
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;

// =============================================================================
// Helper Functions
// =============================================================================

impl ForgeError {
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn canceled(job_id: impl Into<String>) -> Self {
        Self::Canceled {
            job_id: job_id.into(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// Generic category surfaced to clients polling job status.
    ///
    /// Raw messages stay in the logs; clients only see this label.
    pub fn client_category(&self) -> &'static str {
        match self {
            Self::Canceled { .. } => "canceled",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Timeout { .. } => "timeout",
            Self::Config(_) | Self::NotInitialized => "configuration",
            Self::Io(_) | Self::Database(_) | Self::Storage(_) => "storage",
            _ => "generation_failed",
        }
    }
}

/// Context extension trait for adding context to errors
pub trait ResultExt<T> {
    fn with_context<C: Into<String>>(self, context: C) -> Result<T>;

    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn with_context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| ForgeError::Storage(format!("{}: {}", context.into(), e)))
    }

    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| ForgeError::Storage(format!("{}: {}", f().into(), e)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retryable() {
        assert!(ErrorCategory::RateLimit.is_retryable());
        assert!(ErrorCategory::ParseError.is_retryable());
        assert!(!ErrorCategory::Auth.is_retryable());
        assert!(!ErrorCategory::BadRequest.is_retryable());
    }

    #[test]
    fn test_classify_parse_error() {
        let err = ErrorClassifier::classify("expected value at line 1 column 1", "openai");
        assert_eq!(err.category, ErrorCategory::ParseError);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_http_status() {
        let rate = ErrorClassifier::classify_http_status(429, "slow down", "openai");
        assert_eq!(rate.category, ErrorCategory::RateLimit);

        let auth = ErrorClassifier::classify_http_status(401, "nope", "openai");
        assert_eq!(auth.category, ErrorCategory::Auth);
        assert!(!auth.is_retryable());
    }

    #[test]
    fn test_agent_error_from_llm() {
        let parse = LlmError::parse("trailing characters");
        assert!(AgentError::from_llm("Planner", &parse).is_retryable());

        let auth = LlmError::new(ErrorCategory::Auth, "bad key");
        let err = AgentError::from_llm("Planner", &auth);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Planner: [AUTH] bad key");
    }

    #[test]
    fn test_agent_error_into_fatal() {
        let err = AgentError::retryable("SectionBuilder", "bad json").into_fatal();
        assert!(!err.is_retryable());
        assert_eq!(err.message(), "bad json");
    }

    #[test]
    fn test_client_category() {
        assert_eq!(ForgeError::canceled("j1").client_category(), "canceled");
        let quota = ForgeError::QuotaExceeded {
            metric: "lessons".into(),
            limit: 3,
            used: 3,
        };
        assert_eq!(quota.client_category(), "quota_exceeded");
        assert_eq!(
            ForgeError::LlmApi("boom".into()).client_category(),
            "generation_failed"
        );
    }
}
