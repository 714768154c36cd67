//! lessonforge - Multi-Agent Lesson Generation
//!
//! Turns a topic and a handful of learner preferences into a structured,
//! validated lesson document by running a pipeline of LLM agents behind a
//! durable job queue.
//!
//! ## Core Features
//!
//! - **Agent Pipeline**: plan, build sections in parallel, repair, stitch
//! - **Closed Widget Set**: every content item is checked against a known shape
//! - **Targeted Repair**: deterministic fixes first, model patches second
//! - **Durable Jobs**: SQLite-backed queue with cancel, retry and resume
//! - **Quotas**: per-user lesson and section limits per period
//!
//! ## Quick Start
//!
//! ```ignore
//! use lessonforge::{Config, Database, GenerationRequest, Worker, submit};
//!
//! let config = Config::default();
//! let db = Arc::new(Database::open(&config.storage.db_path)?);
//! db.initialize()?;
//! let job = submit(db.as_ref(), GenerationRequest::new("Photosynthesis", 4), None, 2)?;
//!
//! let runtime = Arc::new(AgentRuntime::new(Some(provider), &config)?);
//! let worker = Arc::new(Worker::new(db, runtime, config));
//! worker.run_once().await?;
//! ```
//!
//! ## Modules
//!
//! - [`ai`]: LLM provider abstraction, prompts, usage and deadlines
//! - [`lesson`]: request/plan/section types, widgets, schema, repair, agents
//! - [`jobs`]: job records, tracker, quotas and the background worker
//! - [`storage`]: SQLite persistence with connection pooling
//! - [`config`]: layered configuration

pub mod ai;
pub mod cli;
pub mod config;
pub mod constants;
pub mod jobs;
pub mod lesson;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_support;

// =============================================================================
// Core Re-exports
// =============================================================================

// Configuration
pub use config::{Config, ConfigLoader};

// Error Types
pub use types::error::{AgentError, ErrorCategory, ForgeError, Result, ResultExt};
pub use types::JobId;

// Storage
pub use storage::{Database, PoolConfig, SharedDatabase};

// =============================================================================
// Pipeline Re-exports
// =============================================================================

pub use lesson::{
    AgentRuntime, FinalLesson, GenerateOptions, GenerationRequest, JobContext, KindSet,
    LessonPlan, OrchestrationResult, Orchestrator, StructuredSection,
};

pub use jobs::{JobRecord, JobStatus, JobStore, JobTracker, QuotaService, Worker, submit};

// =============================================================================
// AI Re-exports
// =============================================================================

pub use ai::{CostSummary, JobDeadline, LlmProvider, LlmResponse, with_timeout};
