//! SectionBuilder - plan section → section payload

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use super::{Agent, AgentRun, AgentRuntime};
use crate::ai::PromptBuilder;
use crate::lesson::types::{JobContext, SectionDraft, StructuredSection};
use crate::types::AgentError;

const AGENT: &str = "section_builder";

/// What a section build needs besides the job context
#[derive(Debug, Clone)]
pub struct SectionRequest {
    pub draft: SectionDraft,
    pub lesson_title: String,
    /// Every planned section title, in order
    pub outline: Vec<String>,
}

pub struct SectionBuilder {
    runtime: Arc<AgentRuntime>,
}

impl SectionBuilder {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }

    fn build_prompt(&self, input: &SectionRequest, ctx: &JobContext) -> String {
        let request = &ctx.request;
        let widgets = self.runtime.allowed_widgets(request);
        let plan = &input.draft.plan;

        let planned_subsections: Vec<Value> = plan
            .subsections
            .iter()
            .map(|s| json!({"heading": s.title, "planned_widgets": s.planned_widgets}))
            .collect();

        PromptBuilder::new()
            .role("teacher and writer", "clear, accurate lesson content")
            .text(self.runtime.prompts().get(crate::ai::PromptName::Section))
            .context_item("Lesson", &input.lesson_title)
            .context_item("Topic", &request.topic)
            .context_item("Learner level", &request.learner_level)
            .context_item("Languages", &request.languages.join(", "))
            .context_item("Teaching styles", &request.teaching_styles.join(", "))
            .context_item("Outline", &input.outline.join(" | "))
            .context_item(
                "This section",
                &format!("{}. {}", input.draft.number, input.draft.title),
            )
            .context_item("Goals", &plan.goals)
            .context_item("Continuity", &plan.continuity_note)
            .context_item("Check points", &plan.data_collection_points.join("; "))
            .json("Planned subsections", &Value::Array(planned_subsections))
            .section("Allowed widgets", &self.runtime.widgets().describe(widgets))
            .rules(&[
                format!("Use \"{}\" as the section title", input.draft.title),
                "Use only the allowed widgets, one widget key per item".to_string(),
                "Do not repeat material from other sections".to_string(),
            ])
            .build()
    }
}

/// Accept a section object, unwrapping a `{"section": {...}}` envelope
pub(crate) fn decode_section(value: Value) -> Result<Value, String> {
    match value {
        Value::Object(mut obj) if obj.len() == 1 && obj.get("section").is_some_and(Value::is_object) => {
            Ok(obj.remove("section").unwrap_or_default())
        }
        Value::Object(obj) => Ok(Value::Object(obj)),
        other => Err(format!(
            "section must be a JSON object, got {}",
            crate::types::json_type_name(&other)
        )),
    }
}

#[async_trait]
impl Agent for SectionBuilder {
    type Input = SectionRequest;
    type Output = StructuredSection;

    fn name(&self) -> &'static str {
        AGENT
    }

    async fn run(
        &self,
        input: &SectionRequest,
        ctx: &JobContext,
    ) -> Result<AgentRun<StructuredSection>, AgentError> {
        let number = input.draft.number;

        if let Some(fixture) = self.runtime.fixtures().section(number) {
            debug!(job_id = %ctx.job_id, section = number, "Section served from fixture");
            let payload = decode_section(fixture.clone()).map_err(|e| AgentError::fatal(AGENT, e))?;
            return Ok(AgentRun::fixture(StructuredSection::new(number, payload)));
        }

        let prompt = self.build_prompt(input, ctx);
        let schema = self
            .runtime
            .schemas()
            .section_schema(self.runtime.allowed_widgets(&ctx.request));
        let (payload, usage) = self
            .runtime
            .structured(AGENT, &prompt, &schema, decode_section)
            .await?;

        Ok(AgentRun::live(StructuredSection::new(number, payload), usage))
    }
}
