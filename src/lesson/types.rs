//! Lesson Pipeline Data Contracts
//!
//! Request, job context, plan, per-section records and the final lesson.
//! Section payloads stay as `serde_json::Value` until they validate; the typed
//! [`LessonDocument`] exists only for content that passed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::widgets::{KindSet, Widget};
use crate::ai::JobDeadline;
use crate::constants::document as limits;
use crate::types::{ForgeError, JobId, Result};

// =============================================================================
// Generation Request
// =============================================================================

/// What to generate. Built once per job and never mutated by agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub topic: String,
    pub section_count: u32,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub teaching_styles: Vec<String>,
    #[serde(default = "default_level")]
    pub learner_level: String,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default = "KindSet::all")]
    pub allowed_widgets: KindSet,
    #[serde(default = "default_blueprint")]
    pub blueprint: String,
}

fn default_level() -> String {
    "beginner".to_string()
}

fn default_languages() -> Vec<String> {
    vec!["en".to_string()]
}

fn default_blueprint() -> String {
    "standard".to_string()
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>, section_count: u32) -> Self {
        Self {
            topic: topic.into(),
            section_count,
            details: String::new(),
            teaching_styles: Vec::new(),
            learner_level: default_level(),
            languages: default_languages(),
            allowed_widgets: KindSet::all(),
            blueprint: default_blueprint(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn with_teaching_styles(mut self, styles: Vec<String>) -> Self {
        self.teaching_styles = styles;
        self
    }

    pub fn with_learner_level(mut self, level: impl Into<String>) -> Self {
        self.learner_level = level.into();
        self
    }

    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages;
        self
    }

    pub fn with_allowed_widgets(mut self, kinds: KindSet) -> Self {
        self.allowed_widgets = kinds;
        self
    }

    pub fn with_blueprint(mut self, blueprint: impl Into<String>) -> Self {
        self.blueprint = blueprint.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(ForgeError::Config("Lesson topic must not be empty".into()));
        }
        if self.section_count == 0 || self.section_count as usize > limits::MAX_SECTIONS {
            return Err(ForgeError::Config(format!(
                "Section count must be between 1 and {}, got {}",
                limits::MAX_SECTIONS,
                self.section_count
            )));
        }
        if self.allowed_widgets.is_empty() {
            return Err(ForgeError::Config(
                "At least one content widget must be allowed".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Job Context
// =============================================================================

/// Per-job context passed by reference to every agent call
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
    pub request: GenerationRequest,
    /// Caller-scoped values (user id, resolved settings)
    pub metadata: BTreeMap<String, Value>,
    pub cancel: CancellationToken,
    pub deadline: Option<Arc<JobDeadline>>,
}

impl JobContext {
    pub fn new(job_id: JobId, request: GenerationRequest) -> Self {
        Self {
            job_id,
            created_at: Utc::now(),
            request,
            metadata: BTreeMap::new(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: JobDeadline) -> Self {
        self.deadline = Some(Arc::new(deadline));
        self
    }

    /// Cooperative stage-boundary check: cancellation first, then deadline
    pub fn checkpoint(&self, stage: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ForgeError::canceled(self.job_id.as_str()));
        }
        match &self.deadline {
            Some(deadline) => deadline.check(stage),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Plan
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonPlan {
    pub title: String,
    pub sections: Vec<PlanSection>,
}

impl LessonPlan {
    pub fn section(&self, number: u32) -> Option<&PlanSection> {
        self.sections.iter().find(|s| s.number == number)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSection {
    /// 1-based position
    pub number: u32,
    pub title: String,
    #[serde(default)]
    pub subsections: Vec<PlanSubsection>,
    #[serde(default)]
    pub goals: String,
    #[serde(default)]
    pub continuity_note: String,
    #[serde(default)]
    pub data_collection_points: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSubsection {
    pub title: String,
    #[serde(default)]
    pub planned_widgets: Vec<String>,
}

// =============================================================================
// Section Records
// =============================================================================

/// Provenance of a section: which plan entry it was built from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionDraft {
    pub number: u32,
    pub title: String,
    pub plan: PlanSection,
}

impl From<&PlanSection> for SectionDraft {
    fn from(plan: &PlanSection) -> Self {
        Self {
            number: plan.number,
            title: plan.title.clone(),
            plan: plan.clone(),
        }
    }
}

/// Generated section payload plus its current validation errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredSection {
    pub number: u32,
    pub payload: Value,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Storage row id once persisted
    #[serde(default)]
    pub row_ref: Option<i64>,
}

impl StructuredSection {
    pub fn new(number: u32, payload: Value) -> Self {
        Self {
            number,
            payload,
            errors: Vec::new(),
            row_ref: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairInput {
    pub draft: SectionDraft,
    pub section: StructuredSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairResult {
    pub fixed: Value,
    /// Change tags, e.g. `deterministic_repair`, `ai_repair`
    pub changes: Vec<String>,
    /// Residual errors; empty means repaired
    pub errors: Vec<String>,
    /// Provider calls spent on this repair
    #[serde(default)]
    pub model_calls: u32,
}

impl RepairResult {
    pub fn is_fixed(&self) -> bool {
        self.errors.is_empty()
    }
}

// =============================================================================
// Final Lesson
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetadata {
    /// Accepted length/count overruns
    pub soft_issues: Vec<String>,
    /// Sections that needed repair
    pub repaired_sections: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalLesson {
    pub title: String,
    pub sections: Vec<Value>,
    #[serde(default)]
    pub validation: Option<ValidationMetadata>,
}

impl FinalLesson {
    /// Wire document: `{"lesson": {"title", "sections"}}`
    pub fn to_document(&self) -> Value {
        json!({"lesson": {"title": self.title, "sections": self.sections}})
    }
}

// =============================================================================
// Parsed Document Model
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonDocument {
    pub lesson: LessonBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonBody {
    pub title: String,
    pub sections: Vec<LessonSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonSection {
    pub title: String,
    #[serde(deserialize_with = "any_form_widgets")]
    pub items: Vec<Widget>,
    #[serde(default, deserialize_with = "nullable_list")]
    pub subsections: Vec<LessonSubsection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonSubsection {
    pub heading: String,
    #[serde(deserialize_with = "any_form_widgets")]
    pub items: Vec<Widget>,
}

fn any_form_widgets<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<Widget>, D::Error> {
    let raw = Vec::<Value>::deserialize(deserializer)?;
    raw.iter()
        .map(|item| Widget::from_item(item).map_err(serde::de::Error::custom))
        .collect()
}

fn nullable_list<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
