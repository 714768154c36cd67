//! Job Progress Tracker
//!
//! Applies [`ProgressUpdate`]s to a job's record. Every write re-reads the
//! record first: once a job is `canceled`, the next write fires the job's
//! cancellation token and fails with [`ForgeError::Canceled`], whatever stage
//! is reporting.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::record::{JobOutcome, JobRecord, JobStatus};
use super::store::JobStore;
use crate::ai::CostSummary;
use crate::constants::tracker::FIXED_STEPS;
use crate::lesson::orchestrator::{ProgressSink, ProgressUpdate, SectionStatus};
use crate::types::{ForgeError, JobId, Result};

#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    cancel: CancellationToken,
    log_window: usize,
}

impl JobTracker {
    pub fn new(store: Arc<dyn JobStore>, job_id: JobId, log_window: usize) -> Self {
        Self {
            store,
            job_id,
            cancel: CancellationToken::new(),
            log_window: log_window.max(1),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Token fired when the job is observed as canceled
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn load(&self) -> Result<JobRecord> {
        let record = self
            .store
            .get(&self.job_id)?
            .ok_or_else(|| ForgeError::NotFound(format!("job {}", self.job_id)))?;
        if record.status == JobStatus::Canceled {
            return Err(self.canceled());
        }
        Ok(record)
    }

    fn canceled(&self) -> ForgeError {
        if !self.cancel.is_cancelled() {
            info!(job_id = %self.job_id, "Cancellation observed");
            self.cancel.cancel();
        }
        ForgeError::canceled(self.job_id.as_str())
    }

    fn save(&self, record: &mut JobRecord) -> Result<()> {
        record.updated_at = Utc::now();
        if self.store.save_progress(record)? {
            Ok(())
        } else {
            Err(self.canceled())
        }
    }

    /// Size the step counter for the sections this attempt will build
    pub fn begin(&self, target_sections: u32) -> Result<()> {
        let mut record = self.load()?;
        let total = FIXED_STEPS + target_sections;
        record.total_steps = record.total_steps.max(total);
        record.phase = "starting".to_string();
        record.subphase = None;
        if record.retry_count > 0 {
            record.push_log(
                &format!("Retry {} of {}", record.retry_count, record.retry_limit),
                self.log_window,
            );
        }
        self.save(&mut record)
    }

    /// Append one line to the job's log window
    pub fn log(&self, line: &str) -> Result<()> {
        let mut record = self.load()?;
        record.push_log(line, self.log_window);
        self.save(&mut record)
    }

    /// Apply one progress update
    pub fn advance(&self, update: &ProgressUpdate) -> Result<()> {
        let mut record = self.load()?;

        record.phase = update.phase.clone();
        record.subphase = update.subphase.clone();
        for message in &update.messages {
            record.push_log(message, self.log_window);
        }
        if update.advance {
            record.advance_step();
        }
        if let Some(progress) = &update.section_progress
            && progress.status == SectionStatus::Completed
            && !record.mark_section_completed(progress.number)
        {
            debug!(job_id = %self.job_id, section = progress.number, "Section already recorded");
        }
        if let Some(cost) = &update.cost {
            record.cost = cost.clone();
        }
        if let Some(document) = &update.partial_document {
            record.result = Some(document.clone());
        }
        self.save(&mut record)
    }

    /// Terminal success
    pub fn complete(&self, document: serde_json::Value, cost: CostSummary) -> Result<()> {
        self.finish(&JobOutcome::Done {
            result: document,
            cost,
        })
    }

    /// Terminal failure with a client-facing category
    pub fn fail(&self, category: &str, message: &str) -> Result<()> {
        self.finish(&JobOutcome::Error {
            category: category.to_string(),
            message: message.to_string(),
        })
    }

    /// Terminal cancellation
    pub fn cancel(&self) -> Result<()> {
        self.cancel.cancel();
        self.store
            .finish(&self.job_id, &JobOutcome::Canceled)
            .map(|_| ())
    }

    fn finish(&self, outcome: &JobOutcome) -> Result<()> {
        if self.store.finish(&self.job_id, outcome)? {
            info!(job_id = %self.job_id, status = %outcome.status(), "Job finished");
            Ok(())
        } else {
            Err(self.canceled())
        }
    }
}

#[async_trait]
impl ProgressSink for JobTracker {
    async fn report(&self, update: ProgressUpdate) -> Result<()> {
        // Pool checkout and SQLite writes block
        let tracker = self.clone();
        tokio::task::spawn_blocking(move || tracker.advance(&update))
            .await
            .map_err(|e| ForgeError::Io(std::io::Error::other(e.to_string())))?
    }
}
