//! Lesson Orchestrator
//!
//! Sequences the agents for one job:
//!
//! ```text
//! Planner → SectionBuilder ─┬─ valid ──────────────────────────┬→ Stitcher → finalize
//!    (once)   (per section) └─ invalid → Repairer → re-validate ┘
//! ```
//!
//! Sections may be built by a bounded pool but are always consumed, persisted
//! and reported in plan order; the first failure in that order aborts the run.
//! Every fatal path returns an [`OrchestrationError`] with the accumulated log
//! trail and a snapshot of the artifacts produced so far.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, info, instrument, warn};

use super::agents::{
    Agent, AgentRuntime, Planner, Repairer, SectionBuilder, SectionRequest, StitchInput, Stitcher,
};
use super::types::{
    FinalLesson, GenerationRequest, JobContext, LessonPlan, RepairInput, RepairResult,
    SectionDraft, StructuredSection, ValidationMetadata,
};
use super::widgets::KindSet;
use crate::ai::{CostSummary, UsageRecord};
use crate::config::Config;
use crate::types::{ForgeError, JobId, Result};

pub const PHASE_PLANNING: &str = "planning";
pub const PHASE_SECTIONS: &str = "sections";
pub const PHASE_STITCHING: &str = "stitching";
pub const PHASE_FINALIZING: &str = "finalizing";

// =============================================================================
// Progress
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Generating,
    Retrying,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionProgress {
    pub number: u32,
    pub status: SectionStatus,
    pub completed_count: u32,
    pub target_count: u32,
}

/// One progress report from the pipeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub phase: String,
    pub subphase: Option<String>,
    pub messages: Vec<String>,
    /// Counts as one completed step
    pub advance: bool,
    /// `{"lesson": {"title", "sections"}}` built so far
    pub partial_document: Option<Value>,
    pub section_progress: Option<SectionProgress>,
    pub cost: Option<CostSummary>,
}

impl ProgressUpdate {
    pub fn phase(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            ..Default::default()
        }
    }

    pub fn subphase(mut self, subphase: impl Into<String>) -> Self {
        self.subphase = Some(subphase.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    pub fn step(mut self) -> Self {
        self.advance = true;
        self
    }

    pub fn with_partial(mut self, document: Value) -> Self {
        self.partial_document = Some(document);
        self
    }

    pub fn with_section(mut self, progress: SectionProgress) -> Self {
        self.section_progress = Some(progress);
        self
    }

    pub fn with_cost(mut self, cost: CostSummary) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// Receives progress; a `Canceled` error aborts the run
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, update: ProgressUpdate) -> Result<()>;
}

/// Sink that drops every update
pub struct NoopProgress;

#[async_trait]
impl ProgressSink for NoopProgress {
    async fn report(&self, _update: ProgressUpdate) -> Result<()> {
        Ok(())
    }
}

/// Enqueues side jobs requested by the plan
#[async_trait]
pub trait ChildJobCreator: Send + Sync {
    async fn create(&self, agent: &str, payload: Value) -> Result<()>;
}

/// Persistence of a job's plan and validated sections
pub trait SectionStore: Send + Sync {
    fn save_plan(&self, job_id: &JobId, plan: &LessonPlan) -> Result<()>;
    fn load_plan(&self, job_id: &JobId) -> Result<Option<LessonPlan>>;
    /// Store a validated section; returns its row id
    fn save_section(&self, job_id: &JobId, section: &StructuredSection) -> Result<i64>;
    fn load_sections(&self, job_id: &JobId) -> Result<Vec<StructuredSection>>;
}

// =============================================================================
// Options & Results
// =============================================================================

/// Work already done by an earlier attempt of the same job
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeState {
    pub plan: LessonPlan,
    pub sections: Vec<StructuredSection>,
}

impl ResumeState {
    /// Stored plan and sections, if a plan was persisted
    pub fn load(store: &dyn SectionStore, job_id: &JobId) -> Result<Option<Self>> {
        let Some(plan) = store.load_plan(job_id)? else {
            return Ok(None);
        };
        Ok(Some(Self {
            plan,
            sections: store.load_sections(job_id)?,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Build only these section numbers
    pub section_filter: Option<BTreeSet<u32>>,
    pub enable_repair: bool,
    pub resume: Option<ResumeState>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            section_filter: None,
            enable_repair: true,
            resume: None,
        }
    }
}

impl GenerateOptions {
    pub fn with_filter(mut self, sections: BTreeSet<u32>) -> Self {
        self.section_filter = Some(sections);
        self
    }

    pub fn with_repair(mut self, enabled: bool) -> Self {
        self.enable_repair = enabled;
        self
    }

    pub fn with_resume(mut self, resume: Option<ResumeState>) -> Self {
        self.resume = resume;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Planning,
    SectionGeneration,
    MissingSections,
    Stitching,
    Protocol,
    Persistence,
    Canceled,
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::SectionGeneration => "section_generation",
            Self::MissingSections => "missing_sections",
            Self::Stitching => "stitching",
            Self::Protocol => "protocol",
            Self::Persistence => "persistence",
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
        }
    }

    fn of_interrupt(err: &ForgeError) -> Self {
        match err {
            ForgeError::Canceled { .. } => Self::Canceled,
            ForgeError::Timeout { .. } => Self::Timeout,
            _ => Self::Protocol,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest artifacts at the moment of failure
#[derive(Debug, Clone, Default, Serialize)]
pub struct FailureSnapshot {
    pub plan: Option<LessonPlan>,
    pub drafts: Vec<SectionDraft>,
    pub structured: Vec<StructuredSection>,
    pub repairs: Vec<RepairResult>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OrchestrationError {
    pub kind: FailureKind,
    pub message: String,
    pub logs: Vec<String>,
    pub snapshot: FailureSnapshot,
}

impl OrchestrationError {
    pub fn is_canceled(&self) -> bool {
        self.kind == FailureKind::Canceled
    }

    /// Generic label shown to clients
    pub fn client_category(&self) -> &'static str {
        match self.kind {
            FailureKind::Canceled => "canceled",
            FailureKind::Timeout => "timeout",
            FailureKind::Persistence => "storage",
            _ => "generation_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Artifacts {
    pub plan: LessonPlan,
    pub drafts: Vec<SectionDraft>,
    pub structured: Vec<StructuredSection>,
    pub repairs: Vec<RepairResult>,
    pub final_document: Value,
}

#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    pub lesson: FinalLesson,
    /// Wire document `{"lesson": {...}}`
    pub document: Value,
    pub provider: String,
    pub model: String,
    /// Soft-pass issues of the final document; `None` when strictly valid
    pub validation_errors: Option<Vec<String>>,
    pub logs: Vec<String>,
    pub cost: CostSummary,
    pub usage: Vec<UsageRecord>,
    pub artifacts: Artifacts,
}

// =============================================================================
// Run State
// =============================================================================

type Interrupt = (FailureKind, String);

#[derive(Default)]
struct RunState {
    plan: Option<LessonPlan>,
    drafts: Vec<SectionDraft>,
    structured: Vec<StructuredSection>,
    repairs: Vec<RepairResult>,
    repaired: Vec<u32>,
    usage: Vec<UsageRecord>,
    logs: Vec<String>,
}

impl RunState {
    fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!("{}", line);
        self.logs.push(line);
    }

    fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> OrchestrationError {
        let message = message.into();
        if kind == FailureKind::Canceled {
            info!("{}", message);
        } else {
            error!(kind = %kind, "{}", message);
        }
        self.logs.push(message.clone());
        OrchestrationError {
            kind,
            message,
            logs: self.logs.clone(),
            snapshot: FailureSnapshot {
                plan: self.plan.clone(),
                drafts: self.drafts.clone(),
                structured: self.structured.clone(),
                repairs: self.repairs.clone(),
            },
        }
    }

    fn interrupt(&mut self, (kind, message): Interrupt) -> OrchestrationError {
        self.fail(kind, message)
    }

    fn cost(&self) -> CostSummary {
        CostSummary::from_records(&self.usage)
    }

    fn partial_document(&self, title: &str) -> Value {
        let mut sections: Vec<&StructuredSection> = self.structured.iter().collect();
        sections.sort_by_key(|s| s.number);
        let payloads: Vec<&Value> = sections.iter().map(|s| &s.payload).collect();
        json!({"lesson": {"title": title, "sections": payloads}})
    }
}

/// Result of building one section, merged into [`RunState`] in plan order
struct SectionWork {
    draft: SectionDraft,
    section: Option<StructuredSection>,
    repair: Option<RepairResult>,
    usage: Vec<UsageRecord>,
    logs: Vec<String>,
    failure: Option<Interrupt>,
}

impl SectionWork {
    fn new(draft: SectionDraft) -> Self {
        Self {
            draft,
            section: None,
            repair: None,
            usage: Vec::new(),
            logs: Vec::new(),
            failure: None,
        }
    }

    fn log(&mut self, line: String) {
        info!("{}", line);
        self.logs.push(line);
    }

    fn failed(mut self, kind: FailureKind, message: String) -> Self {
        self.failure = Some((kind, message));
        self
    }
}

/// Per-run values shared by all section builds
struct BuildScope<'a> {
    lesson_title: &'a str,
    outline: &'a [String],
    allowed: KindSet,
    enable_repair: bool,
    target_count: u32,
    completed: &'a AtomicU32,
}

impl BuildScope<'_> {
    fn progress(&self, number: u32, status: SectionStatus) -> SectionProgress {
        SectionProgress {
            number,
            status,
            completed_count: self.completed.load(Ordering::SeqCst),
            target_count: self.target_count,
        }
    }
}

/// Report progress; only a cancellation stops the run
async fn report(
    progress: &dyn ProgressSink,
    update: ProgressUpdate,
) -> std::result::Result<(), Interrupt> {
    match progress.report(update).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_canceled() => Err((FailureKind::Canceled, err.to_string())),
        Err(err) => {
            warn!("Progress report failed: {}", err);
            Ok(())
        }
    }
}

/// Race `future` against the job's cancellation token
async fn until_canceled<F: Future>(ctx: &JobContext, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => None,
        output = future => Some(output),
    }
}

fn canceled(ctx: &JobContext, stage: &str) -> Interrupt {
    (
        FailureKind::Canceled,
        format!("Job {} canceled during {}", ctx.job_id, stage),
    )
}

fn checkpoint(ctx: &JobContext, stage: &str) -> std::result::Result<(), Interrupt> {
    ctx.checkpoint(stage)
        .map_err(|err| (FailureKind::of_interrupt(&err), err.to_string()))
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    runtime: Arc<AgentRuntime>,
    planner: Planner,
    builder: SectionBuilder,
    repairer: Repairer,
    stitcher: Stitcher,
    sections: Option<Arc<dyn SectionStore>>,
    concurrency: usize,
}

impl Orchestrator {
    pub fn new(runtime: Arc<AgentRuntime>, config: &Config) -> Self {
        Self {
            planner: Planner::new(runtime.clone()),
            builder: SectionBuilder::new(runtime.clone()),
            repairer: Repairer::new(runtime.clone(), &config.repair),
            stitcher: Stitcher::new(),
            sections: None,
            concurrency: config.generation.section_concurrency.max(1),
            runtime,
        }
    }

    /// Persist the plan and every validated section
    pub fn with_section_store(mut self, store: Arc<dyn SectionStore>) -> Self {
        self.sections = Some(store);
        self
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    /// Run the whole pipeline for one job
    #[instrument(skip_all, fields(job_id = %ctx.job_id, sections = request.section_count))]
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        ctx: &JobContext,
        options: GenerateOptions,
        progress: &dyn ProgressSink,
        child_jobs: Option<&dyn ChildJobCreator>,
    ) -> std::result::Result<OrchestrationResult, OrchestrationError> {
        let mut state = RunState::default();
        let allowed = self.runtime.allowed_widgets(request);
        let expected = request.section_count;

        // 1. Plan
        let resumed = options.resume.is_some();
        let (plan, done) = match options.resume {
            Some(resume) => {
                state.log(format!(
                    "Resuming with stored plan and {} completed section(s)",
                    resume.sections.len()
                ));
                (resume.plan, resume.sections)
            }
            None => {
                let plan = self.plan(request, ctx, progress, &mut state).await?;
                (plan, Vec::new())
            }
        };
        state.plan = Some(plan.clone());

        if let Some(bad) = plan.sections.iter().find(|s| s.number == 0 || s.number > expected) {
            return Err(state.fail(
                FailureKind::Protocol,
                format!(
                    "Planner returned section {} outside 1..={}",
                    bad.number, expected
                ),
            ));
        }

        if !resumed {
            if let Some(store) = &self.sections
                && let Err(err) = store.save_plan(&ctx.job_id, &plan)
            {
                return Err(state.fail(
                    FailureKind::Persistence,
                    format!("Failed to persist plan: {}", err),
                ));
            }
            if let Some(creator) = child_jobs {
                self.fan_out(&plan, ctx, creator, &mut state).await;
            }
        }

        report(
            progress,
            ProgressUpdate::phase(PHASE_PLANNING)
                .message(format!("Plan ready: {} section(s)", plan.sections.len()))
                .step()
                .with_partial(state.partial_document(&plan.title))
                .with_cost(state.cost()),
        )
        .await
        .map_err(|i| state.interrupt(i))?;

        // 2. Sections
        let targeted: BTreeSet<u32> = (1..=expected)
            .filter(|n| options.section_filter.as_ref().is_none_or(|f| f.contains(n)))
            .collect();
        let done_numbers: BTreeSet<u32> = done
            .iter()
            .map(|s| s.number)
            .filter(|n| (1..=expected).contains(n))
            .collect();
        state.structured.extend(
            done.into_iter()
                .filter(|s| done_numbers.contains(&s.number)),
        );

        let mut drafts: Vec<SectionDraft> = plan
            .sections
            .iter()
            .filter(|s| targeted.contains(&s.number) && !done_numbers.contains(&s.number))
            .map(SectionDraft::from)
            .collect();
        drafts.sort_by_key(|d| d.number);
        if targeted.len() < expected as usize {
            state.log(format!(
                "Building {} of {} section(s): {:?}",
                targeted.len(),
                expected,
                targeted
            ));
        }

        let outline: Vec<String> = plan.sections.iter().map(|s| s.title.clone()).collect();
        let completed = AtomicU32::new(
            targeted.intersection(&done_numbers).count() as u32,
        );
        let scope = BuildScope {
            lesson_title: &plan.title,
            outline: &outline,
            allowed,
            enable_repair: options.enable_repair,
            target_count: targeted.len() as u32,
            completed: &completed,
        };

        let mut builds = stream::iter(drafts)
            .map(|draft| self.build_section(ctx, draft, &scope, progress))
            .buffered(self.concurrency);

        while let Some(work) = builds.next().await {
            let SectionWork {
                draft,
                section,
                repair,
                usage,
                logs,
                failure,
            } = work;
            let number = draft.number;
            state.drafts.push(draft);
            state.usage.extend(usage);
            state.logs.extend(logs);
            let repaired = repair.is_some();
            state.repairs.extend(repair);

            if let Some(interrupt) = failure {
                state.structured.extend(section);
                return Err(state.interrupt(interrupt));
            }
            let Some(mut section) = section else {
                return Err(state.fail(
                    FailureKind::Protocol,
                    format!("Section {} produced no payload", number),
                ));
            };

            if let Some(store) = &self.sections {
                match store.save_section(&ctx.job_id, &section) {
                    Ok(row) => section.row_ref = Some(row),
                    Err(err) => {
                        return Err(state.fail(
                            FailureKind::Persistence,
                            format!("Failed to persist section {}: {}", number, err),
                        ));
                    }
                }
            }
            state.structured.push(section);
            if repaired {
                state.repaired.push(number);
            }

            let count = completed.fetch_add(1, Ordering::SeqCst) + 1;
            report(
                progress,
                ProgressUpdate::phase(PHASE_SECTIONS)
                    .subphase(format!("section {}", number))
                    .message(format!("Section {} completed", number))
                    .step()
                    .with_partial(state.partial_document(&plan.title))
                    .with_section(SectionProgress {
                        number,
                        status: SectionStatus::Completed,
                        completed_count: count,
                        target_count: scope.target_count,
                    })
                    .with_cost(state.cost()),
            )
            .await
            .map_err(|i| state.interrupt(i))?;
        }
        drop(builds);

        // 3. Missing-section guard
        let produced: BTreeSet<u32> = state.structured.iter().map(|s| s.number).collect();
        let missing: Vec<String> = targeted
            .iter()
            .filter(|n| !produced.contains(n))
            .map(u32::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(state.fail(
                FailureKind::MissingSections,
                format!("Missing sections: {}", missing.join(", ")),
            ));
        }

        // 4. Stitch
        checkpoint(ctx, PHASE_STITCHING).map_err(|i| state.interrupt(i))?;
        report(
            progress,
            ProgressUpdate::phase(PHASE_STITCHING).message("Stitching lesson"),
        )
        .await
        .map_err(|i| state.interrupt(i))?;

        let input = StitchInput {
            title: plan.title.clone(),
            sections: state.structured.clone(),
        };
        let mut lesson = match self.stitcher.run(&input, ctx).await {
            Ok(run) => run.output,
            Err(err) => {
                return Err(state.fail(
                    FailureKind::Stitching,
                    format!("Stitcher failed: {}", err),
                ));
            }
        };
        let document = lesson.to_document();
        let validation = self.runtime.schemas().validate_document(&document, allowed);
        if !validation.is_acceptable() {
            let errors = validation.error_strings();
            return Err(state.fail(
                FailureKind::Stitching,
                format!(
                    "Stitched document failed validation ({} issue(s)): {}",
                    errors.len(),
                    errors.iter().take(10).cloned().collect::<Vec<_>>().join("; ")
                ),
            ));
        }
        let soft_issues = if validation.ok {
            Vec::new()
        } else {
            validation.error_strings()
        };
        if !soft_issues.is_empty() || !state.repaired.is_empty() {
            lesson.validation = Some(ValidationMetadata {
                soft_issues: soft_issues.clone(),
                repaired_sections: state.repaired.clone(),
            });
        }

        // 5. Finalize
        let cost = state.cost();
        state.log(format!(
            "Lesson complete: {} section(s), {} call(s), ${:.4}",
            lesson.sections.len(),
            cost.calls,
            cost.total_usd
        ));
        report(
            progress,
            ProgressUpdate::phase(PHASE_FINALIZING)
                .message("Lesson ready")
                .step()
                .with_partial(document.clone())
                .with_cost(cost.clone()),
        )
        .await
        .map_err(|i| state.interrupt(i))?;

        let RunState {
            drafts,
            structured,
            repairs,
            usage,
            logs,
            ..
        } = state;
        Ok(OrchestrationResult {
            provider: self.runtime.provider_name().to_string(),
            model: self.runtime.model_name().to_string(),
            validation_errors: (!soft_issues.is_empty()).then_some(soft_issues),
            logs,
            cost,
            usage,
            artifacts: Artifacts {
                plan,
                drafts,
                structured,
                repairs,
                final_document: document.clone(),
            },
            document,
            lesson,
        })
    }

    async fn plan(
        &self,
        request: &GenerationRequest,
        ctx: &JobContext,
        progress: &dyn ProgressSink,
        state: &mut RunState,
    ) -> std::result::Result<LessonPlan, OrchestrationError> {
        checkpoint(ctx, PHASE_PLANNING).map_err(|i| state.interrupt(i))?;
        report(
            progress,
            ProgressUpdate::phase(PHASE_PLANNING).message(format!("Planning '{}'", request.topic)),
        )
        .await
        .map_err(|i| state.interrupt(i))?;

        let run = match until_canceled(ctx, self.planner.run(request, ctx)).await {
            Some(Ok(run)) => run,
            Some(Err(err)) => {
                return Err(state.fail(FailureKind::Planning, format!("Planner failed: {}", err)));
            }
            None => return Err(state.interrupt(canceled(ctx, PHASE_PLANNING))),
        };
        state.usage.extend(run.usage);
        state.log(format!(
            "Planner completed: '{}' with {} section(s){}",
            run.output.title,
            run.output.sections.len(),
            if run.fixture { " (fixture)" } else { "" }
        ));
        Ok(run.output)
    }

    /// One child job per planned widget hint that names a side-job agent
    async fn fan_out(
        &self,
        plan: &LessonPlan,
        ctx: &JobContext,
        creator: &dyn ChildJobCreator,
        state: &mut RunState,
    ) {
        let registry = self.runtime.widgets();
        for section in &plan.sections {
            for subsection in &section.subsections {
                for hint in &subsection.planned_widgets {
                    let Some(agent) = registry.side_job_agent(hint) else {
                        continue;
                    };
                    let payload = json!({
                        "parent_job_id": ctx.job_id,
                        "section_number": section.number,
                        "section_title": section.title,
                        "subsection_title": subsection.title,
                        "hint": hint,
                        "topic": ctx.request.topic,
                    });
                    match creator.create(agent, payload).await {
                        Ok(()) => state.log(format!(
                            "Queued {} child job for section {} ({})",
                            agent, section.number, subsection.title
                        )),
                        Err(err) => {
                            warn!("Child job {} failed to enqueue: {}", agent, err);
                            state.logs.push(format!("Child job {} not queued: {}", agent, err));
                        }
                    }
                }
            }
        }
    }

    /// Build, validate and, when needed, repair one section
    async fn build_section(
        &self,
        ctx: &JobContext,
        draft: SectionDraft,
        scope: &BuildScope<'_>,
        progress: &dyn ProgressSink,
    ) -> SectionWork {
        let number = draft.number;
        let stage = format!("section {}", number);
        let mut work = SectionWork::new(draft.clone());

        if let Err((kind, message)) = checkpoint(ctx, &stage) {
            return work.failed(kind, message);
        }
        if let Err((kind, message)) = report(
            progress,
            ProgressUpdate::phase(PHASE_SECTIONS)
                .subphase(stage.clone())
                .message(format!("Generating section {}: {}", number, draft.title))
                .with_section(scope.progress(number, SectionStatus::Generating)),
        )
        .await
        {
            return work.failed(kind, message);
        }

        let request = SectionRequest {
            draft: draft.clone(),
            lesson_title: scope.lesson_title.to_string(),
            outline: scope.outline.to_vec(),
        };
        let run = match until_canceled(ctx, self.builder.run(&request, ctx)).await {
            Some(Ok(run)) => run,
            Some(Err(err)) => {
                return work.failed(
                    FailureKind::SectionGeneration,
                    format!("SectionBuilder failed: {}", err),
                );
            }
            None => {
                let (kind, message) = canceled(ctx, &stage);
                return work.failed(kind, message);
            }
        };
        work.usage.extend(run.usage);
        let mut section = run.output;
        if section.number != number {
            let message = format!(
                "SectionBuilder returned section {} for planned section {}",
                section.number, number
            );
            work.section = Some(section);
            return work.failed(FailureKind::Protocol, message);
        }

        let topic = &ctx.request.topic;
        let schemas = self.runtime.schemas();
        let validation = schemas.validate_section(&section.payload, topic, number, scope.allowed);
        if validation.ok {
            if !validation.soft_issues.is_empty() {
                work.log(format!(
                    "Section {} accepted with {} overrun(s)",
                    number,
                    validation.soft_issues.len()
                ));
            }
            work.log(format!("Section {} validated", number));
            work.section = Some(section);
            return work;
        }

        section.errors = validation.errors;
        let error_count = section.errors.len();
        debug!("Section {} errors: {}", number, section.errors.join("; "));
        if !scope.enable_repair {
            let message = format!(
                "Section {} failed validation with {} error(s); repair disabled",
                number, error_count
            );
            work.section = Some(section);
            return work.failed(FailureKind::SectionGeneration, message);
        }

        work.log(format!(
            "Section {} failed validation with {} error(s), repairing",
            number, error_count
        ));
        if let Err((kind, message)) = report(
            progress,
            ProgressUpdate::phase(PHASE_SECTIONS)
                .subphase(stage.clone())
                .message(format!("Repairing section {}", number))
                .with_section(scope.progress(number, SectionStatus::Retrying)),
        )
        .await
        {
            work.section = Some(section);
            return work.failed(kind, message);
        }

        let input = RepairInput {
            draft,
            section: section.clone(),
        };
        let repaired = match until_canceled(ctx, self.repairer.run(&input, ctx)).await {
            Some(Ok(run)) => {
                work.usage.extend(run.usage);
                run.output
            }
            Some(Err(err)) => {
                work.section = Some(section);
                return work.failed(
                    FailureKind::SectionGeneration,
                    format!("Repairer failed: {}", err),
                );
            }
            None => {
                work.section = Some(section);
                let (kind, message) = canceled(ctx, &stage);
                return work.failed(kind, message);
            }
        };

        let revalidated =
            schemas.validate_section(&repaired.fixed, topic, number, scope.allowed);
        let changes = repaired.changes.join(", ");
        if !repaired.is_fixed() || !revalidated.ok {
            let residual = if repaired.errors.is_empty() {
                revalidated.errors.clone()
            } else {
                repaired.errors.clone()
            };
            let message = format!(
                "Section {} still invalid after repair ({} error(s)): {}",
                number,
                residual.len(),
                residual.iter().take(5).cloned().collect::<Vec<_>>().join("; ")
            );
            section.payload = repaired.fixed.clone();
            section.errors = residual;
            work.section = Some(section);
            work.repair = Some(repaired);
            return work.failed(FailureKind::SectionGeneration, message);
        }

        work.log(format!("Section {} repaired: {}", number, changes));
        section.payload = repaired.fixed.clone();
        section.errors.clear();
        work.section = Some(section);
        work.repair = Some(repaired);
        work
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::SharedProvider;
    use crate::lesson::agents::FixtureSet;
    use crate::test_support::{
        RecordingChildren, RecordingSink, ScriptedProvider, context, plan_json, section_json,
    };
    use crate::types::{ErrorCategory, LlmError};

    fn orchestrator(provider: &Arc<ScriptedProvider>) -> Orchestrator {
        let provider: SharedProvider = provider.clone();
        let runtime = AgentRuntime::new(Some(provider), &Config::default()).unwrap();
        Orchestrator::new(Arc::new(runtime), &Config::default())
    }

    async fn run(
        orchestrator: &Orchestrator,
        sections: u32,
        options: GenerateOptions,
        sink: &RecordingSink,
    ) -> std::result::Result<OrchestrationResult, OrchestrationError> {
        let ctx = context(sections);
        orchestrator
            .generate(&ctx.request, &ctx, options, sink, None)
            .await
    }

    #[tokio::test]
    async fn test_two_sections_happy_path() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_ok(plan_json(2))
                .then_ok(section_json("Part 1"))
                .then_ok(section_json("Part 2")),
        );
        let sink = RecordingSink::new();
        let result = run(&orchestrator(&provider), 2, GenerateOptions::default(), &sink)
            .await
            .unwrap();

        assert_eq!(result.lesson.sections.len(), 2);
        assert_eq!(result.lesson.sections[0]["title"], "Part 1");
        assert_eq!(result.lesson.sections[1]["title"], "Part 2");
        assert!(result.validation_errors.is_none());
        assert!(result.lesson.validation.is_none());
        assert_eq!(result.provider, "scripted");
        assert_eq!(result.cost.calls, 3);
        assert_eq!(result.document["lesson"]["sections"].as_array().unwrap().len(), 2);

        let completed: Vec<u32> = sink
            .updates()
            .iter()
            .filter_map(|u| u.section_progress.as_ref())
            .filter(|p| p.status == SectionStatus::Completed)
            .map(|p| p.completed_count)
            .collect();
        assert_eq!(completed, vec![1, 2]);
        let steps = sink.updates().iter().filter(|u| u.advance).count();
        assert_eq!(steps, 4);
    }

    #[tokio::test]
    async fn test_local_repair_needs_no_model_call() {
        let broken = serde_json::json!({
            "title": "Part 1",
            "items": [{"markdown": "intro"}],
            "subsections": [{"title": "Moon pull", "items": [{"markdown": "x"}]}]
        });
        let provider = Arc::new(ScriptedProvider::new().then_ok(plan_json(1)).then_ok(broken));
        let sink = RecordingSink::new();
        let result = run(&orchestrator(&provider), 1, GenerateOptions::default(), &sink)
            .await
            .unwrap();

        assert_eq!(provider.calls(), 2);
        let repair = &result.artifacts.repairs[0];
        assert_eq!(repair.model_calls, 0);
        assert!(
            repair
                .changes
                .contains(&"subsections.0.heading:migrated_from_title".to_string())
        );
        assert_eq!(result.lesson.sections[0]["subsections"][0]["heading"], "Moon pull");
        assert_eq!(
            result.lesson.validation.as_ref().unwrap().repaired_sections,
            vec![1]
        );
        assert!(sink.updates().iter().any(|u| {
            u.section_progress
                .as_ref()
                .is_some_and(|p| p.status == SectionStatus::Retrying)
        }));
    }

    #[tokio::test]
    async fn test_section_failure_keeps_logs_and_prior_sections() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_ok(plan_json(2))
                .then_ok(section_json("Part 1"))
                .then_err(LlmError::new(ErrorCategory::Auth, "key revoked")),
        );
        let err = run(&orchestrator(&provider), 2, GenerateOptions::default(), &RecordingSink::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, FailureKind::SectionGeneration);
        assert!(err.logs.iter().any(|l| l.starts_with("SectionBuilder failed: ")));
        assert!(err.snapshot.plan.is_some());
        assert_eq!(err.snapshot.structured.len(), 1);
        assert!(err.snapshot.structured[0].is_valid());
        assert_eq!(err.snapshot.drafts.len(), 2);
        assert_eq!(err.client_category(), "generation_failed");
    }

    #[tokio::test]
    async fn test_unrepairable_section_is_fatal() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_ok(plan_json(1))
                .then_ok(serde_json::json!({"title": "Part 1", "items": [{"markdown": 1}]})),
        );
        let options = GenerateOptions::default().with_repair(false);
        let err = run(&orchestrator(&provider), 1, options, &RecordingSink::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, FailureKind::SectionGeneration);
        assert!(err.message.contains("repair disabled"));
        assert!(!err.snapshot.structured[0].is_valid());
    }

    #[tokio::test]
    async fn test_section_filter_limits_generation() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_ok(plan_json(5))
                .then_ok(section_json("Part 1"))
                .then_ok(section_json("Part 2")),
        );
        let options = GenerateOptions::default().with_filter(BTreeSet::from([1, 2]));
        let result = run(&orchestrator(&provider), 5, options, &RecordingSink::new())
            .await
            .unwrap();

        assert_eq!(provider.calls(), 3);
        assert_eq!(result.lesson.sections.len(), 2);
        assert!(result.logs.iter().any(|l| l.starts_with("Building 2 of 5")));
    }

    #[tokio::test]
    async fn test_missing_sections_are_fatal() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_ok(plan_json(1))
                .then_ok(section_json("Part 1")),
        );
        let err = run(&orchestrator(&provider), 3, GenerateOptions::default(), &RecordingSink::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, FailureKind::MissingSections);
        assert_eq!(err.message, "Missing sections: 2, 3");
    }

    #[tokio::test]
    async fn test_out_of_range_plan_section_is_protocol_violation() {
        let mut plan = plan_json(2);
        plan["sections"][1]["number"] = serde_json::json!(7);
        let provider = Arc::new(ScriptedProvider::new().then_ok(plan));
        let err = run(&orchestrator(&provider), 2, GenerateOptions::default(), &RecordingSink::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, FailureKind::Protocol);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_canceled_token_stops_before_planning() {
        let provider = Arc::new(ScriptedProvider::new().then_ok(plan_json(1)));
        let ctx = context(1);
        ctx.cancel.cancel();
        let err = orchestrator(&provider)
            .generate(&ctx.request, &ctx, GenerateOptions::default(), &NoopProgress, None)
            .await
            .unwrap_err();

        assert!(err.is_canceled());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_canceled_progress_write_aborts() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_ok(plan_json(2))
                .then_ok(section_json("Part 1"))
                .then_ok(section_json("Part 2")),
        );
        // planning start, plan ready, then section 1 "generating" is refused
        let sink = RecordingSink::canceling_after(2);
        let err = run(&orchestrator(&provider), 2, GenerateOptions::default(), &sink)
            .await
            .unwrap_err();

        assert_eq!(err.kind, FailureKind::Canceled);
        assert_eq!(err.client_category(), "canceled");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_resume_skips_planning_and_done_sections() {
        let provider = Arc::new(ScriptedProvider::new().then_ok(section_json("Part 2")));
        let mut plan_value = plan_json(2);
        plan_value["sections"][0]["subsections"][0]["planned_widgets"] =
            serde_json::json!(["illustration"]);
        let plan: LessonPlan = serde_json::from_value(plan_value).unwrap();
        let resume = ResumeState {
            plan,
            sections: vec![StructuredSection::new(1, section_json("Part 1"))],
        };
        let children = RecordingChildren::default();
        let ctx = context(2);
        let result = orchestrator(&provider)
            .generate(
                &ctx.request,
                &ctx,
                GenerateOptions::default().with_resume(Some(resume)),
                &NoopProgress,
                Some(&children),
            )
            .await
            .unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(result.lesson.sections.len(), 2);
        assert!(children.created().is_empty());
    }

    #[tokio::test]
    async fn test_widget_hints_fan_out_child_jobs() {
        let mut plan = plan_json(1);
        plan["sections"][0]["subsections"][0]["planned_widgets"] =
            serde_json::json!(["illustration", "quiz"]);
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_ok(plan)
                .then_ok(section_json("Part 1")),
        );
        let children = RecordingChildren::default();
        let ctx = context(1);
        orchestrator(&provider)
            .generate(&ctx.request, &ctx, GenerateOptions::default(), &NoopProgress, Some(&children))
            .await
            .unwrap();

        let created = children.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "illustrator");
        assert_eq!(created[0].1["parent_job_id"], "job-test");
        assert_eq!(created[0].1["section_number"], 1);
    }

    #[tokio::test]
    async fn test_parallel_sections_report_in_plan_order() {
        let fixtures = FixtureSet::empty()
            .with_entry("planner", plan_json(3))
            .with_entry("section_1", section_json("Part 1"))
            .with_entry("section_2", section_json("Part 2"))
            .with_entry("section_3", section_json("Part 3"));
        let runtime = AgentRuntime::new(None, &Config::default())
            .unwrap()
            .with_fixtures(fixtures);
        let mut config = Config::default();
        config.generation.section_concurrency = 3;
        let orchestrator = Orchestrator::new(Arc::new(runtime), &config);

        let sink = RecordingSink::new();
        let result = run(&orchestrator, 3, GenerateOptions::default(), &sink)
            .await
            .unwrap();

        assert_eq!(result.provider, "fixture");
        assert_eq!(result.cost.calls, 0);
        let order: Vec<u32> = sink
            .updates()
            .iter()
            .filter_map(|u| u.section_progress.as_ref())
            .filter(|p| p.status == SectionStatus::Completed)
            .map(|p| p.number)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
