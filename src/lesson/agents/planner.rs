//! Planner - request → lesson plan

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Agent, AgentRun, AgentRuntime};
use crate::ai::PromptBuilder;
use crate::lesson::types::{GenerationRequest, JobContext, LessonPlan};
use crate::types::AgentError;

const AGENT: &str = "planner";

pub struct Planner {
    runtime: Arc<AgentRuntime>,
}

impl Planner {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }

    fn build_prompt(&self, request: &GenerationRequest) -> String {
        let blueprint = self.runtime.blueprints().resolve(&request.blueprint);
        let widgets = self.runtime.allowed_widgets(request);

        PromptBuilder::new()
            .role("instructional designer", "structured lesson outlines")
            .text(self.runtime.prompts().get(blueprint.planner_prompt))
            .context_item("Topic", &request.topic)
            .context_item("Details", &request.details)
            .context_item("Learner level", &request.learner_level)
            .context_item("Teaching styles", &request.teaching_styles.join(", "))
            .context_item("Languages", &request.languages.join(", "))
            .context_item("Section count", &request.section_count.to_string())
            .section("Allowed widgets", &self.runtime.widgets().describe(widgets))
            .rules(&[
                format!(
                    "Return exactly {} sections numbered 1 to {} in teaching order",
                    request.section_count, request.section_count
                ),
                "planned_widgets may only name allowed widgets or side-job hints such as audio_coach or illustration".to_string(),
                "Keep titles short and concrete".to_string(),
            ])
            .build()
    }
}

/// Decode and normalize a plan: sections sorted by number, duplicates dropped
pub(crate) fn decode_plan(value: Value) -> Result<LessonPlan, String> {
    let mut plan: LessonPlan =
        serde_json::from_value(value).map_err(|e| format!("plan does not match schema: {}", e))?;
    if plan.sections.is_empty() {
        return Err("plan has no sections".to_string());
    }

    plan.sections.sort_by_key(|s| s.number);
    let mut seen = BTreeSet::new();
    plan.sections.retain(|s| {
        let first = seen.insert(s.number);
        if !first {
            debug!("Dropping duplicate plan section {}", s.number);
        }
        first
    });
    Ok(plan)
}

#[async_trait]
impl Agent for Planner {
    type Input = GenerationRequest;
    type Output = LessonPlan;

    fn name(&self) -> &'static str {
        AGENT
    }

    async fn run(
        &self,
        request: &GenerationRequest,
        ctx: &JobContext,
    ) -> Result<AgentRun<LessonPlan>, AgentError> {
        if let Some(fixture) = self.runtime.fixtures().planner() {
            debug!(job_id = %ctx.job_id, "Planner served from fixture");
            let plan = decode_plan(fixture.clone()).map_err(|e| AgentError::fatal(AGENT, e))?;
            return Ok(AgentRun::fixture(plan));
        }

        let prompt = self.build_prompt(request);
        let schema = self.runtime.schemas().plan_schema();
        let (plan, usage) = self
            .runtime
            .structured(AGENT, &prompt, &schema, decode_plan)
            .await?;

        info!(
            job_id = %ctx.job_id,
            "Planned '{}' with {} section(s)",
            plan.title,
            plan.sections.len()
        );
        Ok(AgentRun::live(plan, usage))
    }
}
