//! Background Lesson Worker
//!
//! Polls the job store for queued lesson jobs, claims a batch per cycle and
//! runs each job as its own tokio task, at most `worker.max_concurrent_jobs`
//! at a time. A job attempt:
//!
//! 1. reserves one unit of the lessons quota (skipped when resuming)
//! 2. caps the section filter by the remaining sections quota
//! 3. runs the orchestrator with the job tracker as progress sink
//! 4. commits the lesson reservation once a plan exists, releases it otherwise
//! 5. writes the terminal outcome through the tracker

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::quota::{QuotaService, Reservation, period_key};
use super::record::JobRecord;
use super::store::JobStore;
use super::tracker::JobTracker;
use crate::ai::JobDeadline;
use crate::config::Config;
use crate::constants::{quota, worker::LESSON_AGENT};
use crate::lesson::orchestrator::{
    ChildJobCreator, GenerateOptions, OrchestrationError, Orchestrator, ResumeState, SectionStore,
};
use crate::lesson::{AgentRuntime, GenerationRequest, JobContext};
use crate::storage::SharedDatabase;
use crate::types::{ForgeError, Result};

/// Why an attempt ended without a document
#[derive(Debug)]
enum JobFailure {
    Canceled,
    Failed {
        category: &'static str,
        message: String,
    },
}

impl From<ForgeError> for JobFailure {
    fn from(err: ForgeError) -> Self {
        if err.is_canceled() {
            Self::Canceled
        } else {
            Self::Failed {
                category: err.client_category(),
                message: err.to_string(),
            }
        }
    }
}

impl From<OrchestrationError> for JobFailure {
    fn from(err: OrchestrationError) -> Self {
        if err.is_canceled() {
            Self::Canceled
        } else {
            Self::Failed {
                category: err.client_category(),
                message: err.message,
            }
        }
    }
}

/// Sections an attempt may build under the sections quota
struct SectionCap {
    filter: BTreeSet<u32>,
    allowed: u32,
    wanted: usize,
}

/// Persists fan-out requests as queued child jobs
struct StoreChildJobs {
    jobs: Arc<dyn JobStore>,
    parent: JobRecord,
}

#[async_trait]
impl ChildJobCreator for StoreChildJobs {
    async fn create(&self, agent: &str, payload: Value) -> Result<()> {
        let child = JobRecord::child(agent, &self.parent, payload);
        self.jobs.create(&child)?;
        debug!(parent = %self.parent.id, child = %child.id, agent, "Child job queued");
        Ok(())
    }
}

/// Validate a request and queue it as a lesson job
pub fn submit(
    jobs: &dyn JobStore,
    request: GenerationRequest,
    user_id: Option<String>,
    retry_limit: u32,
) -> Result<JobRecord> {
    request.validate()?;
    let record = JobRecord::lesson(request, user_id, retry_limit);
    jobs.create(&record)?;
    info!(job_id = %record.id, sections = record.expected_sections, "Lesson job queued");
    Ok(record)
}

pub struct Worker {
    jobs: Arc<dyn JobStore>,
    sections: Arc<dyn SectionStore>,
    quota: Arc<dyn QuotaService>,
    orchestrator: Arc<Orchestrator>,
    config: Config,
}

impl Worker {
    pub fn new(db: SharedDatabase, runtime: Arc<AgentRuntime>, config: Config) -> Self {
        let jobs: Arc<dyn JobStore> = db.clone();
        let sections: Arc<dyn SectionStore> = db.clone();
        let quota: Arc<dyn QuotaService> = db;
        let orchestrator = Orchestrator::new(runtime, &config).with_section_store(sections.clone());
        Self {
            jobs,
            sections,
            quota,
            orchestrator: Arc::new(orchestrator),
            config,
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Poll until `shutdown` fires, then wait for in-flight jobs
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let max_jobs = self.config.worker.max_concurrent_jobs.max(1);
        let poll = self.config.worker.poll_interval();
        info!(
            max_jobs,
            poll_ms = poll.as_millis() as u64,
            "Worker started"
        );

        let mut running: JoinSet<()> = JoinSet::new();
        loop {
            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    error!("Job task panicked: {}", e);
                }
            }
            if shutdown.is_cancelled() {
                break;
            }

            let free = max_jobs.saturating_sub(running.len());
            if free > 0 {
                match self
                    .jobs
                    .claim_batch(LESSON_AGENT, free.min(self.config.worker.batch_size))
                {
                    Ok(claimed) => {
                        for record in claimed {
                            let worker = self.clone();
                            running.spawn(async move { worker.process(record).await });
                        }
                    }
                    Err(e) => error!("Failed to claim jobs: {}", e),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!("Job task panicked: {}", e);
                    }
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }

        if !running.is_empty() {
            info!("Shutting down, waiting for {} job(s)", running.len());
        }
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!("Job task panicked: {}", e);
            }
        }
        info!("Worker stopped");
        Ok(())
    }

    /// Claim one batch and run it to completion; returns the number of jobs run
    pub async fn run_once(self: &Arc<Self>) -> Result<usize> {
        let limit = self
            .config
            .worker
            .batch_size
            .min(self.config.worker.max_concurrent_jobs)
            .max(1);
        let claimed = self.jobs.claim_batch(LESSON_AGENT, limit)?;
        let count = claimed.len();

        let mut tasks = JoinSet::new();
        for record in claimed {
            let worker = self.clone();
            tasks.spawn(async move { worker.process(record).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Job task panicked: {}", e);
            }
        }
        Ok(count)
    }

    /// Run one claimed job and record its terminal outcome
    #[instrument(skip_all, fields(job_id = %record.id, retry = record.retry_count))]
    pub async fn process(&self, record: JobRecord) {
        let tracker = JobTracker::new(
            self.jobs.clone(),
            record.id.clone(),
            self.config.tracker.log_window,
        );

        let finished = match self.execute(&record, &tracker).await {
            Ok(()) => Ok(()),
            Err(JobFailure::Canceled) => {
                info!("Job canceled");
                tracker.cancel()
            }
            Err(JobFailure::Failed { category, message }) => {
                if category == "quota_exceeded" {
                    info!("Job stopped by quota: {}", message);
                } else {
                    error!(category, "Job failed: {}", message);
                }
                tracker.fail(category, &message)
            }
        };

        if let Err(err) = finished {
            if err.is_canceled() {
                info!("Job was canceled before its outcome was written");
            } else {
                error!("Failed to record job outcome: {}", err);
            }
        }
    }

    async fn execute(
        &self,
        record: &JobRecord,
        tracker: &JobTracker,
    ) -> std::result::Result<(), JobFailure> {
        let request = record
            .request
            .clone()
            .ok_or_else(|| ForgeError::Storage(format!("job {} has no request", record.id)))?;
        request.validate()?;

        let period = period_key(&self.config.quota.period, Utc::now());
        let resume = self.load_resume(record)?;

        let reservation = match (&record.user_id, &resume) {
            (Some(user), None) => Some(self.quota.reserve(
                user,
                quota::LESSONS_METRIC,
                &period,
                1,
                self.config.quota.lessons_limit,
            )?),
            _ => None,
        };

        let cap = match self.section_cap(record, &request, &period, resume.as_ref()) {
            Ok(cap) => cap,
            Err(err) => {
                self.settle(reservation.as_ref(), false);
                return Err(err.into());
            }
        };

        let expected = request.section_count;
        let reused = resume.as_ref().map_or(0, |r| r.sections.len() as u32);
        let target = cap
            .as_ref()
            .map_or(expected, |c| c.filter.len() as u32)
            .saturating_sub(reused);
        let prepared = tracker.begin(target).and_then(|()| match &cap {
            Some(cap) => tracker.log(&format!(
                "Section quota caps generation at {} of {} sections",
                cap.allowed, cap.wanted
            )),
            None => Ok(()),
        });
        if let Err(err) = prepared {
            self.settle(reservation.as_ref(), false);
            return Err(err.into());
        }

        let mut options = GenerateOptions::default()
            .with_repair(self.config.generation.enable_repair)
            .with_resume(resume);
        if let Some(cap) = cap {
            options = options.with_filter(cap.filter);
        }

        let mut ctx = JobContext::new(record.id.clone(), request.clone())
            .with_cancel(tracker.token())
            .with_deadline(JobDeadline::new(
                Duration::from_secs(self.config.worker.soft_timeout_secs),
                Duration::from_secs(self.config.worker.hard_timeout_secs),
            ));
        if let Some(user) = &record.user_id {
            ctx = ctx.with_metadata("user_id", json!(user));
        }

        let children = StoreChildJobs {
            jobs: self.jobs.clone(),
            parent: record.clone(),
        };
        let outcome = self
            .orchestrator
            .generate(&request, &ctx, options, tracker, Some(&children))
            .await;

        let planned = match &outcome {
            Ok(_) => true,
            Err(err) => err.snapshot.plan.is_some(),
        };
        self.settle(reservation.as_ref(), planned);
        let result = outcome?;

        if let Some(user) = &record.user_id {
            let built = result.artifacts.drafts.len() as u32;
            if built > 0
                && let Err(err) =
                    self.quota
                        .consume(user, quota::SECTIONS_METRIC, &period, built, None)
            {
                warn!("Failed to record section usage: {}", err);
            }
        }
        if let Some(issues) = &result.validation_errors {
            info!(issues = issues.len(), "Lesson accepted with soft validation issues");
        }

        tracker.complete(result.document, result.cost)?;
        Ok(())
    }

    /// Stored plan and the sections the record already counts as completed
    fn load_resume(&self, record: &JobRecord) -> Result<Option<ResumeState>> {
        if record.retry_count == 0 {
            return Ok(None);
        }
        let Some(mut resume) = ResumeState::load(self.sections.as_ref(), &record.id)? else {
            return Ok(None);
        };
        resume
            .sections
            .retain(|s| record.completed_sections.contains(&s.number));
        debug!(
            done = resume.sections.len(),
            "Resuming from stored plan"
        );
        Ok(Some(resume))
    }

    /// Filter of sections this attempt may build; `None` when uncapped
    fn section_cap(
        &self,
        record: &JobRecord,
        request: &GenerationRequest,
        period: &str,
        resume: Option<&ResumeState>,
    ) -> Result<Option<SectionCap>> {
        let Some(user) = &record.user_id else {
            return Ok(None);
        };
        let limit = self.config.quota.sections_limit;
        let Some(remaining) = self
            .quota
            .remaining(user, quota::SECTIONS_METRIC, period, limit)?
        else {
            return Ok(None);
        };

        let done: BTreeSet<u32> = resume
            .map(|r| r.sections.iter().map(|s| s.number).collect())
            .unwrap_or_default();
        let missing: Vec<u32> = (1..=request.section_count)
            .filter(|n| !done.contains(n))
            .collect();
        if missing.len() <= remaining as usize {
            return Ok(None);
        }
        if remaining == 0 {
            let limit = limit.unwrap_or(0);
            return Err(ForgeError::QuotaExceeded {
                metric: quota::SECTIONS_METRIC.to_string(),
                limit,
                used: limit,
            });
        }

        let mut filter = done;
        filter.extend(missing.iter().take(remaining as usize));
        Ok(Some(SectionCap {
            filter,
            allowed: remaining,
            wanted: missing.len(),
        }))
    }

    fn settle(&self, reservation: Option<&Reservation>, planned: bool) {
        let Some(reservation) = reservation else {
            return;
        };
        let settled = if planned {
            self.quota.commit(reservation)
        } else {
            self.quota.release(reservation)
        };
        if let Err(err) = settled {
            warn!("Failed to settle lesson quota: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use crate::lesson::FixtureSet;
    use crate::storage::Database;
    use crate::test_support::{plan_json, request, section_json};

    fn database() -> SharedDatabase {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        db
    }

    fn worker(db: &SharedDatabase, fixtures: FixtureSet, config: Config) -> Arc<Worker> {
        let runtime = AgentRuntime::new(None, &config)
            .unwrap()
            .with_fixtures(fixtures);
        Arc::new(Worker::new(db.clone(), Arc::new(runtime), config))
    }

    fn fixtures(sections: u32, built: &[u32]) -> FixtureSet {
        let mut set = FixtureSet::empty().with_entry("planner", plan_json(sections));
        for n in built {
            set = set.with_entry(&format!("section_{}", n), section_json(&format!("Part {}", n)));
        }
        set
    }

    #[tokio::test]
    async fn test_run_once_completes_lesson() {
        let db = database();
        let mut plan = plan_json(2);
        plan["sections"][0]["subsections"][0]["planned_widgets"] =
            serde_json::json!(["illustration"]);
        let fixtures = fixtures(2, &[1, 2]).with_entry("planner", plan);
        let worker = worker(&db, fixtures, Config::default());

        let record = submit(db.as_ref(), request(2), Some("u1".into()), 2).unwrap();
        assert_eq!(worker.run_once().await.unwrap(), 1);

        let done = db.get(&record.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.progress_percent, 100);
        assert_eq!(done.completed_sections, vec![1, 2]);
        let result = done.result.unwrap();
        assert_eq!(result["lesson"]["sections"].as_array().unwrap().len(), 2);
        assert_eq!(db.load_sections(&record.id).unwrap().len(), 2);

        let children: Vec<JobRecord> = db
            .list(Some(JobStatus::Queued), 10)
            .unwrap()
            .into_iter()
            .filter(|j| j.parent_job_id.as_ref() == Some(&record.id))
            .collect();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].kind, "illustrator");

        // nothing left to claim; child jobs are not lessons
        assert_eq!(worker.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_section_quota_caps_filter() {
        let db = database();
        let mut config = Config::default();
        config.quota.sections_limit = Some(2);
        let worker = worker(&db, fixtures(5, &[1, 2, 3, 4, 5]), config.clone());

        let record = submit(db.as_ref(), request(5), Some("u1".into()), 2).unwrap();
        worker.run_once().await.unwrap();

        let done = db.get(&record.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.completed_sections, vec![1, 2]);
        assert!(
            done.logs
                .iter()
                .any(|l| l == "Section quota caps generation at 2 of 5 sections")
        );
        let stored: Vec<u32> = db
            .load_sections(&record.id)
            .unwrap()
            .iter()
            .map(|s| s.number)
            .collect();
        assert_eq!(stored, vec![1, 2]);

        let period = period_key(&config.quota.period, Utc::now());
        assert_eq!(
            db.remaining("u1", quota::SECTIONS_METRIC, &period, Some(2)).unwrap(),
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_exhausted_section_quota_fails_quietly() {
        let db = database();
        let mut config = Config::default();
        config.quota.sections_limit = Some(1);
        config.quota.lessons_limit = Some(5);
        let period = period_key(&config.quota.period, Utc::now());
        db.consume("u1", quota::SECTIONS_METRIC, &period, 1, Some(1))
            .unwrap();
        let worker = worker(&db, fixtures(2, &[1, 2]), config);

        let record = submit(db.as_ref(), request(2), Some("u1".into()), 2).unwrap();
        worker.run_once().await.unwrap();

        let failed = db.get(&record.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert_eq!(failed.error_category.as_deref(), Some("quota_exceeded"));
        assert!(db.load_plan(&record.id).unwrap().is_none());
        // the lesson reservation was released
        assert_eq!(
            db.remaining("u1", quota::LESSONS_METRIC, &period, Some(5)).unwrap(),
            Some(5)
        );
    }

    #[tokio::test]
    async fn test_lesson_quota_blocks_job() {
        let db = database();
        let mut config = Config::default();
        config.quota.lessons_limit = Some(0);
        let worker = worker(&db, fixtures(1, &[1]), config);

        let record = submit(db.as_ref(), request(1), Some("u1".into()), 2).unwrap();
        worker.run_once().await.unwrap();

        let failed = db.get(&record.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert_eq!(failed.error_category.as_deref(), Some("quota_exceeded"));
    }

    #[tokio::test]
    async fn test_failed_planning_releases_lesson_quota() {
        let db = database();
        let mut config = Config::default();
        config.quota.lessons_limit = Some(1);
        let worker = worker(&db, FixtureSet::empty(), config.clone());

        let record = submit(db.as_ref(), request(1), Some("u1".into()), 2).unwrap();
        worker.run_once().await.unwrap();

        let failed = db.get(&record.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert_eq!(failed.error_category.as_deref(), Some("generation_failed"));

        let period = period_key(&config.quota.period, Utc::now());
        assert_eq!(
            db.remaining("u1", quota::LESSONS_METRIC, &period, Some(1)).unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_retry_resumes_from_stored_plan() {
        let db = database();
        let first = worker(&db, fixtures(2, &[1]), Config::default());
        let record = submit(db.as_ref(), request(2), None, 2).unwrap();
        first.run_once().await.unwrap();

        let failed = db.get(&record.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert_eq!(failed.completed_sections, vec![1]);

        db.requeue(&record.id).unwrap();
        // no planner and no section 1 fixture: both must come from storage
        let second_fixtures = FixtureSet::empty()
            .with_entry("section_2", section_json("Part 2"));
        let second = worker(&db, second_fixtures, Config::default());
        assert_eq!(second.run_once().await.unwrap(), 1);

        let done = db.get(&record.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.retry_count, 1);
        assert_eq!(done.completed_sections, vec![1, 2]);
        assert!(done.logs.iter().any(|l| l == "Retry 1 of 2"));
        // plan, the one rebuilt section, stitch
        assert_eq!(done.total_steps, 3);
    }

    #[tokio::test]
    async fn test_canceled_job_is_not_claimed() {
        let db = database();
        let worker = worker(&db, fixtures(1, &[1]), Config::default());
        let record = submit(db.as_ref(), request(1), None, 2).unwrap();
        db.cancel(&record.id).unwrap();

        assert_eq!(worker.run_once().await.unwrap(), 0);
        assert_eq!(
            db.get(&record.id).unwrap().unwrap().status,
            JobStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let db = database();
        let mut config = Config::default();
        config.worker.poll_interval_ms = 10;
        let worker = worker(&db, fixtures(1, &[1]), config);
        let record = submit(db.as_ref(), request(1), None, 2).unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.clone().run(shutdown.clone()));
        for _ in 0..200 {
            if db.get(&record.id).unwrap().unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(db.get(&record.id).unwrap().unwrap().status, JobStatus::Done);
    }
}
