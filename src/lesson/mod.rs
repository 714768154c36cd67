//! Lesson Generation Pipeline
//!
//! ```text
//! GenerationRequest → Planner → SectionBuilder × N → validate ─┬→ Stitcher → FinalLesson
//!                                                              └→ Repairer ┘
//! ```
//!
//! - [`types`]: data contracts shared by every stage
//! - [`widgets`]: closed set of content kinds and their shapes
//! - [`schema`]: validation, provider-ready schemas, soft passes
//! - [`repair`]: targeted JSON repair engine
//! - [`agents`]: Planner, SectionBuilder, Repairer, Stitcher
//! - [`orchestrator`]: sequencing, progress, failure snapshots

pub mod agents;
pub mod blueprint;
pub mod orchestrator;
pub mod path;
pub mod repair;
pub mod schema;
pub mod types;
pub mod widgets;

pub use agents::{Agent, AgentRun, AgentRuntime, FixtureSet};
pub use blueprint::{Blueprint, BlueprintRegistry};
pub use orchestrator::{
    ChildJobCreator, FailureKind, GenerateOptions, NoopProgress, OrchestrationError,
    OrchestrationResult, Orchestrator, ProgressSink, ProgressUpdate, ResumeState, SectionStore,
};
pub use schema::SchemaService;
pub use types::{FinalLesson, GenerationRequest, JobContext, LessonPlan, StructuredSection};
pub use widgets::{ContentKind, KindSet, WidgetRegistry};
