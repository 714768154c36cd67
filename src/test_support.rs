//! Shared test doubles: scripted provider, recording sinks, request builders.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::ai::{LlmProvider, LlmResponse, ResponseMetadata, TokenUsage};
use crate::lesson::orchestrator::{ChildJobCreator, ProgressSink, ProgressUpdate};
use crate::lesson::types::{GenerationRequest, JobContext, PlanSection, PlanSubsection};
use crate::types::{ForgeError, JobId, LlmError, Result};

/// Provider answering from a queue of canned results
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<std::result::Result<Value, LlmError>>>,
    prompts: Mutex<Vec<String>>,
    schemas: Mutex<Vec<Value>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_ok(self, value: Value) -> Self {
        self.push(Ok(value));
        self
    }

    pub fn then_err(self, err: LlmError) -> Self {
        self.push(Err(err));
        self
    }

    fn push(&self, entry: std::result::Result<Value, LlmError>) {
        self.script.lock().unwrap().push_back(entry);
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn schemas(&self) -> Vec<Value> {
        self.schemas.lock().unwrap().clone()
    }

    fn next(&self, prompt: &str, schema: Option<&Value>) -> Result<LlmResponse> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(schema) = schema {
            self.schemas.lock().unwrap().push(schema.clone());
        }
        let entry = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::parse("script exhausted")));
        let content = entry.map_err(ForgeError::Llm)?;

        let mut response = LlmResponse::content_only(content);
        response.usage = TokenUsage::new(10, 5);
        response.metadata = ResponseMetadata {
            model: "scripted".into(),
            provider: "scripted".into(),
        };
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate_text(&self, prompt: &str) -> Result<LlmResponse> {
        self.next(prompt, None)
    }

    async fn generate_structured(&self, prompt: &str, schema: &Value) -> Result<LlmResponse> {
        self.next(prompt, Some(schema))
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

/// Progress sink that keeps every update
#[derive(Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<ProgressUpdate>>,
    cancel_after: Option<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `Canceled` once `n` updates have been accepted
    pub fn canceling_after(n: usize) -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
            cancel_after: Some(n),
        }
    }

    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn report(&self, update: ProgressUpdate) -> Result<()> {
        let mut updates = self.updates.lock().unwrap();
        if self.cancel_after.is_some_and(|n| updates.len() >= n) {
            return Err(ForgeError::canceled("test"));
        }
        updates.push(update);
        Ok(())
    }
}

/// Child-job creator that records requests
#[derive(Default)]
pub struct RecordingChildren {
    created: Mutex<Vec<(String, Value)>>,
}

impl RecordingChildren {
    pub fn created(&self) -> Vec<(String, Value)> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChildJobCreator for RecordingChildren {
    async fn create(&self, agent: &str, payload: Value) -> Result<()> {
        self.created.lock().unwrap().push((agent.to_string(), payload));
        Ok(())
    }
}

pub fn request(sections: u32) -> GenerationRequest {
    GenerationRequest::new("Tides", sections)
}

pub fn context(sections: u32) -> JobContext {
    JobContext::new(JobId::new("job-test"), request(sections))
}

/// Planner output with sections "Part 1".."Part n"
pub fn plan_json(sections: u32) -> Value {
    let sections: Vec<Value> = (1..=sections)
        .map(|i| {
            json!({
                "number": i,
                "title": format!("Part {}", i),
                "subsections": [{"title": format!("Part {} detail", i), "planned_widgets": ["markdown"]}],
                "goals": "understand tides"
            })
        })
        .collect();
    json!({"title": "Tides", "sections": sections})
}

/// A section payload that passes validation
pub fn section_json(title: &str) -> Value {
    json!({
        "title": title,
        "items": [{"markdown": format!("About {}", title)}],
        "subsections": [{"heading": format!("{} detail", title), "items": [{"markdown": "More"}]}]
    })
}

pub fn plan_section(number: u32) -> PlanSection {
    PlanSection {
        number,
        title: format!("Part {}", number),
        subsections: vec![PlanSubsection {
            title: format!("Part {} detail", number),
            planned_widgets: vec!["markdown".into()],
        }],
        goals: "understand tides".into(),
        continuity_note: String::new(),
        data_collection_points: Vec::new(),
    }
}
