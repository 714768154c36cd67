//! Submit Command
//!
//! Queue a lesson job for a worker to pick up.

use crate::cli::CommandContext;
use crate::cli::ui::Output;
use crate::config::Config;
use crate::jobs::{JobRecord, submit};
use crate::lesson::{GenerationRequest, KindSet};
use crate::types::{ForgeError, Result};

/// Lesson request as given on the command line
#[derive(Debug, Clone, Default)]
pub struct SubmitArgs {
    pub topic: String,
    pub sections: u32,
    pub details: Option<String>,
    pub level: Option<String>,
    pub styles: Vec<String>,
    pub languages: Vec<String>,
    pub widgets: Vec<String>,
    pub blueprint: Option<String>,
    pub user: Option<String>,
}

impl SubmitArgs {
    /// Build the request, filling blueprint and widgets from config defaults
    pub fn to_request(&self, config: &Config) -> Result<GenerationRequest> {
        let mut request = GenerationRequest::new(self.topic.clone(), self.sections)
            .with_teaching_styles(self.styles.clone())
            .with_blueprint(
                self.blueprint
                    .clone()
                    .unwrap_or_else(|| config.generation.default_blueprint.clone()),
            );
        if let Some(details) = &self.details {
            request = request.with_details(details.clone());
        }
        if !self.languages.is_empty() {
            request = request.with_languages(self.languages.clone());
        }
        if let Some(level) = &self.level {
            request = request.with_learner_level(level.clone());
        }

        let widgets = if self.widgets.is_empty() {
            &config.generation.default_widgets
        } else {
            &self.widgets
        };
        if !widgets.is_empty() {
            let kinds = KindSet::parse_names(widgets).map_err(|unknown| {
                ForgeError::Config(format!("Unknown widget kind(s): {}", unknown.join(", ")))
            })?;
            request = request.with_allowed_widgets(kinds);
        }
        Ok(request)
    }
}

/// Queue the job and return its record
pub fn enqueue(ctx: &CommandContext, args: &SubmitArgs) -> Result<JobRecord> {
    let request = args.to_request(&ctx.config)?;
    submit(
        ctx.db.as_ref(),
        request,
        args.user.clone(),
        ctx.config.worker.retry_limit,
    )
}

pub fn run(ctx: &CommandContext, args: &SubmitArgs, format: &str) -> Result<()> {
    let record = enqueue(ctx, args)?;
    let out = Output::new();
    if format == "json" {
        out.json(&serde_json::json!({
            "job_id": record.id,
            "status": record.status,
            "expected_sections": record.expected_sections,
        }))
    } else {
        out.success(&format!("Queued job {}", record.id));
        out.field("topic", &args.topic);
        out.field("sections", record.expected_sections);
        println!();
        println!("Run 'lessonforge worker' to process it, or 'lessonforge status {}' to follow it.", record.id);
        Ok(())
    }
}
