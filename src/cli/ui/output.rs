use console::style;
use serde::Serialize;

use crate::jobs::{JobRecord, JobStatus};
use crate::types::Result;

pub struct Output;

impl Output {
    pub fn new() -> Self {
        Self
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", style("✓").green(), message);
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red(), message);
    }

    pub fn warning(&self, message: &str) {
        println!("{} {}", style("⚠").yellow(), message);
    }

    pub fn info(&self, message: &str) {
        println!("{} {}", style("ℹ").blue(), message);
    }

    pub fn header(&self, message: &str) {
        println!("\n{}", style(message).bold().underlined());
    }

    pub fn section(&self, message: &str) {
        println!("\n{}", style(message).bold());
        println!("{}", "─".repeat(40));
    }

    pub fn field(&self, key: &str, value: impl std::fmt::Display) {
        println!("  {:<12} {}", style(key).dim(), value);
    }

    pub fn json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    /// One-line summary of a job
    pub fn job_line(&self, job: &JobRecord) {
        println!(
            "{}  {:<9} {:>3}%  {:<12} {}",
            job.id,
            status_label(job.status),
            job.progress_percent,
            job.phase,
            job.request.as_ref().map(|r| r.topic.as_str()).unwrap_or(&job.kind)
        );
    }

    /// Full job view: progress, sections, log tail and error category
    pub fn job(&self, job: &JobRecord) {
        self.header(&format!("Job {}", job.id));
        self.field("kind", &job.kind);
        self.field("status", status_label(job.status));
        match &job.subphase {
            Some(sub) => self.field("phase", format!("{} / {}", job.phase, sub)),
            None => self.field("phase", &job.phase),
        }
        self.field(
            "progress",
            format!(
                "{}% ({}/{} steps)",
                job.progress_percent, job.completed_steps, job.total_steps
            ),
        );
        if job.is_lesson() {
            self.field(
                "sections",
                format!(
                    "{:?} of {}",
                    job.completed_sections, job.expected_sections
                ),
            );
        }
        if job.retry_count > 0 {
            self.field("retries", format!("{}/{}", job.retry_count, job.retry_limit));
        }
        if job.cost.calls > 0 {
            self.field(
                "cost",
                format!("${:.4} over {} call(s)", job.cost.total_usd, job.cost.calls),
            );
        }
        if let Some(category) = &job.error_category {
            self.field("error", category);
        }
        if !job.logs.is_empty() {
            self.section("Recent log");
            for line in &job.logs {
                println!("  {}", line);
            }
        }
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}

fn status_label(status: JobStatus) -> String {
    let label = status.as_str();
    match status {
        JobStatus::Done => style(label).green().to_string(),
        JobStatus::Error => style(label).red().to_string(),
        JobStatus::Canceled => style(label).yellow().to_string(),
        JobStatus::Running => style(label).cyan().to_string(),
        JobStatus::Queued => style(label).dim().to_string(),
    }
}
