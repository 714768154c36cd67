//! Job records and status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ai::CostSummary;
use crate::constants::{tracker, worker};
use crate::lesson::GenerationRequest;
use crate::types::{ForgeError, JobId, Result, truncate_chars};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            "canceled" => Ok(Self::Canceled),
            other => Err(ForgeError::Storage(format!("Unknown job status '{}'", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Canceled)
    }

    /// `queued → running → done|error|canceled`, `queued → canceled`, and the
    /// external requeue `error|canceled → queued`
    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (*self, to),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Done)
                | (Running, Error)
                | (Running, Canceled)
                | (Error, Queued)
                | (Canceled, Queued)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of one job attempt
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Done { result: Value, cost: CostSummary },
    Error { category: String, message: String },
    Canceled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Done { .. } => JobStatus::Done,
            Self::Error { .. } => JobStatus::Error,
            Self::Canceled => JobStatus::Canceled,
        }
    }
}

/// Persistent state of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Agent name; `lesson` for the main pipeline
    pub kind: String,
    pub status: JobStatus,
    pub phase: String,
    pub subphase: Option<String>,
    pub expected_sections: u32,
    /// Completed 1-based section numbers in completion order, no duplicates
    pub completed_sections: Vec<u32>,
    pub retry_count: u32,
    pub retry_limit: u32,
    /// Rolling log window, oldest first
    pub logs: Vec<String>,
    pub completed_steps: u32,
    pub total_steps: u32,
    pub progress_percent: u8,
    pub cost: CostSummary,
    /// Partial document while running, final document when done
    pub result: Option<Value>,
    pub error_category: Option<String>,
    pub error_message: Option<String>,
    pub request: Option<GenerationRequest>,
    pub user_id: Option<String>,
    pub parent_job_id: Option<JobId>,
    pub child_payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn blank(kind: &str, retry_limit: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            kind: kind.to_string(),
            status: JobStatus::Queued,
            phase: "queued".to_string(),
            subphase: None,
            expected_sections: 0,
            completed_sections: Vec::new(),
            retry_count: 0,
            retry_limit,
            logs: Vec::new(),
            completed_steps: 0,
            total_steps: 0,
            progress_percent: 0,
            cost: CostSummary::default(),
            result: None,
            error_category: None,
            error_message: None,
            request: None,
            user_id: None,
            parent_job_id: None,
            child_payload: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Queued main-pipeline job
    pub fn lesson(request: GenerationRequest, user_id: Option<String>, retry_limit: u32) -> Self {
        let mut record = Self::blank(worker::LESSON_AGENT, retry_limit);
        record.expected_sections = request.section_count;
        record.total_steps = tracker::FIXED_STEPS + request.section_count;
        record.request = Some(request);
        record.user_id = user_id;
        record
    }

    /// Queued side job spawned by a lesson
    pub fn child(agent: &str, parent: &JobRecord, payload: Value) -> Self {
        let mut record = Self::blank(agent, parent.retry_limit);
        record.user_id = parent.user_id.clone();
        record.parent_job_id = Some(parent.id.clone());
        record.child_payload = Some(payload);
        record
    }

    pub fn is_lesson(&self) -> bool {
        self.kind == worker::LESSON_AGENT
    }

    /// Record a completed section; repeated numbers keep their first position
    pub fn mark_section_completed(&mut self, number: u32) -> bool {
        if self.completed_sections.contains(&number) {
            return false;
        }
        self.completed_sections.push(number);
        true
    }

    /// Append to the rolling log window
    pub fn push_log(&mut self, line: &str, window: usize) {
        self.logs.push(truncate_chars(line, tracker::MAX_LOG_LINE));
        if self.logs.len() > window {
            let excess = self.logs.len() - window;
            self.logs.drain(..excess);
        }
    }

    /// One more step, clamped to the total; the percentage never regresses
    pub fn advance_step(&mut self) {
        self.completed_steps = (self.completed_steps + 1).min(self.total_steps.max(1));
        self.refresh_percent();
    }

    pub fn refresh_percent(&mut self) {
        if self.total_steps == 0 {
            return;
        }
        let computed = (self.completed_steps.min(self.total_steps) * 100 / self.total_steps) as u8;
        self.progress_percent = self.progress_percent.max(computed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn lesson() -> JobRecord {
        JobRecord::lesson(GenerationRequest::new("Tides", 3), Some("u1".into()), 2)
    }

    #[test]
    fn test_status_round_trip_and_transitions() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Error,
            JobStatus::Canceled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("paused").is_err());
        assert!(JobStatus::Running.can_transition(JobStatus::Canceled));
        assert!(!JobStatus::Canceled.can_transition(JobStatus::Running));
        assert!(!JobStatus::Done.can_transition(JobStatus::Queued));
        assert!(JobStatus::Error.can_transition(JobStatus::Queued));
    }

    #[test]
    fn test_lesson_record_defaults() {
        let record = lesson();
        assert_eq!(record.kind, "lesson");
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.total_steps, 5);
        assert_eq!(record.expected_sections, 3);
    }

    #[test]
    fn test_child_inherits_parent() {
        let parent = lesson();
        let child = JobRecord::child("illustrator", &parent, serde_json::json!({"hint": "image"}));
        assert_eq!(child.kind, "illustrator");
        assert_eq!(child.parent_job_id.as_ref(), Some(&parent.id));
        assert_eq!(child.user_id.as_deref(), Some("u1"));
        assert!(!child.is_lesson());
    }

    #[test]
    fn test_log_window_drops_oldest() {
        let mut record = lesson();
        for i in 0..5 {
            record.push_log(&format!("line {}", i), 3);
        }
        assert_eq!(record.logs, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_steps_clamp_and_percent_never_regresses() {
        let mut record = lesson();
        for _ in 0..10 {
            record.advance_step();
        }
        assert_eq!(record.completed_steps, 5);
        assert_eq!(record.progress_percent, 100);

        record.total_steps = 10;
        record.refresh_percent();
        assert_eq!(record.progress_percent, 100);
    }

    proptest! {
        #[test]
        fn prop_completed_sections_dedup(numbers in proptest::collection::vec(1u32..8, 0..30)) {
            let mut record = lesson();
            for n in &numbers {
                record.mark_section_completed(*n);
            }
            let mut expected = Vec::new();
            for n in numbers {
                if !expected.contains(&n) {
                    expected.push(n);
                }
            }
            prop_assert_eq!(&record.completed_sections, &expected);

            let before = record.completed_sections.clone();
            if let Some(last) = before.last().copied() {
                prop_assert!(!record.mark_section_completed(last));
                prop_assert_eq!(&record.completed_sections, &before);
            }
        }
    }
}
