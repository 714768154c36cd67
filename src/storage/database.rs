//! Database Layer with Connection Pooling and Safe Transactions
//!
//! SQLite storage for jobs, lesson plans, generated sections and quota usage:
//! - Connection pooling via r2d2 for concurrent access
//! - Panic-safe transactions with automatic rollback
//! - Conditional updates so an external cancel always wins over progress writes
//! - WAL mode for concurrent worker reads and writes

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::jobs::quota::{QuotaService, Reservation, check_limit};
use crate::jobs::{JobOutcome, JobRecord, JobStatus, JobStore};
use crate::lesson::orchestrator::SectionStore;
use crate::lesson::{LessonPlan, StructuredSection};
use crate::types::{ForgeError, JobId, Result, ResultExt};

/// Shared database handle for async contexts.
pub type SharedDatabase = Arc<Database>;

const SCHEMA: &str = include_str!("schema.sql");

/// Current schema version
const SCHEMA_VERSION: u32 = 1;

const JOB_COLUMNS: &str = "id, kind, status, phase, subphase, expected_sections, \
     completed_sections, retry_count, retry_limit, logs, completed_steps, total_steps, \
     progress_percent, cost, result, error_category, error_message, request, user_id, \
     parent_job_id, child_payload, created_at, updated_at, started_at, finished_at";

/// Connection pool configuration
///
/// Pool size is dynamically calculated based on CPU cores.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool
    pub max_size: u32,
    /// Minimum idle connections to keep ready
    pub min_idle: u32,
    /// Timeout for acquiring a connection (seconds)
    pub connection_timeout_secs: u64,
}

impl PoolConfig {
    const MIN_POOL_SIZE: u32 = 4;
    const MAX_POOL_SIZE: u32 = 32;
    const POOL_SIZE_MULTIPLIER: f32 = 2.0;

    /// clamp(cores * 2, MIN, MAX)
    pub fn optimal_pool_size() -> u32 {
        let cores = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);

        let calculated = (cores as f32 * Self::POOL_SIZE_MULTIPLIER) as u32;
        calculated.clamp(Self::MIN_POOL_SIZE, Self::MAX_POOL_SIZE)
    }

    /// Pool sized for the worker's job concurrency on top of the CPU default
    pub fn for_workers(max_concurrent_jobs: usize) -> Self {
        let mut config = Self::auto();
        let wanted = (max_concurrent_jobs as u32 + 2).min(Self::MAX_POOL_SIZE);
        config.max_size = config.max_size.max(wanted);
        config
    }

    pub fn auto() -> Self {
        let max_size = Self::optimal_pool_size();
        Self {
            max_size,
            min_idle: (max_size / 4).max(2),
            connection_timeout_secs: 30,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

/// Thread-safe database with connection pooling.
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, PoolConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: PoolConfig) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let manager =
            SqliteConnectionManager::file(path.as_ref()).with_init(Self::configure_connection);

        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(std::time::Duration::from_secs(
                config.connection_timeout_secs,
            ))
            .build(manager)
            .map_err(|e| ForgeError::Storage(format!("Failed to create connection pool: {}", e)))?;

        Ok(Self { pool })
    }

    /// In-memory database for tests. Single connection: never hold a
    /// connection across another call on the same handle.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| ForgeError::Storage(format!("Failed to create in-memory pool: {}", e)))?;

        Ok(Self { pool })
    }

    fn configure_connection(conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA cache_size = -64000;
            PRAGMA busy_timeout = 5000;
            PRAGMA wal_autocheckpoint = 1000;
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            ForgeError::Storage(format!("Failed to acquire database connection: {}", e))
        })
    }

    /// Create tables if missing and stamp the schema version.
    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)
            .with_context("Failed to initialize database schema")?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .with_context("Failed to set schema version")?;
        Ok(())
    }

    /// Whether [`Database::initialize`] has run against this file
    pub fn is_initialized(&self) -> Result<bool> {
        let conn = self.conn()?;
        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .with_context("Failed to read schema version")?;
        Ok(version >= SCHEMA_VERSION)
    }

    /// Execute a function within a panic-safe database transaction.
    ///
    /// If the closure errors or panics, the transaction is rolled back on drop
    /// and an error is returned instead of poisoning the pool.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + std::panic::UnwindSafe,
    {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .with_context("Failed to start transaction")?;

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&tx)));

        match result {
            Ok(Ok(value)) => {
                tx.commit().with_context("Failed to commit transaction")?;
                Ok(value)
            }
            Ok(Err(e)) => Err(e),
            Err(panic_payload) => {
                let panic_msg = panic_payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Unknown panic".to_string());

                tracing::error!("Transaction panicked: {}", panic_msg);
                Err(ForgeError::Storage(format!(
                    "Transaction panicked: {}",
                    panic_msg
                )))
            }
        }
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

/// Fixed-precision RFC 3339 so stored timestamps sort lexically
fn stamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn now_stamp() -> String {
    stamp(&Utc::now())
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value).with_context_fn(|| format!("Failed to serialize {}", what))
}

fn to_json_opt<T: Serialize>(value: Option<&T>, what: &str) -> Result<Option<String>> {
    value.map(|v| to_json(v, what)).transpose()
}

fn from_json<T: DeserializeOwned>(raw: &str, what: &str, id: &str) -> Result<T> {
    serde_json::from_str(raw).with_context_fn(|| format!("Corrupted {} for job {}", what, id))
}

fn parse_time(raw: &str, id: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context_fn(|| format!("Corrupted timestamp for job {}", id))
}

fn parse_time_opt(raw: Option<String>, id: &str) -> Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_time(&r, id)).transpose()
}

/// Raw `jobs` row before JSON and timestamp decoding
struct JobRow {
    id: String,
    kind: String,
    status: String,
    phase: String,
    subphase: Option<String>,
    expected_sections: u32,
    completed_sections: String,
    retry_count: u32,
    retry_limit: u32,
    logs: String,
    completed_steps: u32,
    total_steps: u32,
    progress_percent: u8,
    cost: String,
    result: Option<String>,
    error_category: Option<String>,
    error_message: Option<String>,
    request: Option<String>,
    user_id: Option<String>,
    parent_job_id: Option<String>,
    child_payload: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            status: row.get(2)?,
            phase: row.get(3)?,
            subphase: row.get(4)?,
            expected_sections: row.get(5)?,
            completed_sections: row.get(6)?,
            retry_count: row.get(7)?,
            retry_limit: row.get(8)?,
            logs: row.get(9)?,
            completed_steps: row.get(10)?,
            total_steps: row.get(11)?,
            progress_percent: row.get(12)?,
            cost: row.get(13)?,
            result: row.get(14)?,
            error_category: row.get(15)?,
            error_message: row.get(16)?,
            request: row.get(17)?,
            user_id: row.get(18)?,
            parent_job_id: row.get(19)?,
            child_payload: row.get(20)?,
            created_at: row.get(21)?,
            updated_at: row.get(22)?,
            started_at: row.get(23)?,
            finished_at: row.get(24)?,
        })
    }

    fn into_record(self) -> Result<JobRecord> {
        let id = self.id.as_str();
        Ok(JobRecord {
            kind: self.kind,
            status: JobStatus::parse(&self.status)?,
            phase: self.phase,
            subphase: self.subphase,
            expected_sections: self.expected_sections,
            completed_sections: from_json(&self.completed_sections, "completed_sections", id)?,
            retry_count: self.retry_count,
            retry_limit: self.retry_limit,
            logs: from_json(&self.logs, "logs", id)?,
            completed_steps: self.completed_steps,
            total_steps: self.total_steps,
            progress_percent: self.progress_percent,
            cost: from_json(&self.cost, "cost", id)?,
            result: self
                .result
                .map(|r| from_json(&r, "result", id))
                .transpose()?,
            error_category: self.error_category,
            error_message: self.error_message,
            request: self
                .request
                .map(|r| from_json(&r, "request", id))
                .transpose()?,
            user_id: self.user_id,
            parent_job_id: self.parent_job_id.map(JobId::from),
            child_payload: self
                .child_payload
                .map(|p| from_json(&p, "child_payload", id))
                .transpose()?,
            created_at: parse_time(&self.created_at, id)?,
            updated_at: parse_time(&self.updated_at, id)?,
            started_at: parse_time_opt(self.started_at, id)?,
            finished_at: parse_time_opt(self.finished_at, id)?,
            id: JobId::from(self.id),
        })
    }
}

fn collect_jobs(rows: Vec<JobRow>) -> Result<Vec<JobRecord>> {
    rows.into_iter().map(JobRow::into_record).collect()
}

fn load_job(conn: &Connection, id: &JobId) -> Result<Option<JobRecord>> {
    let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
    conn.query_row(&sql, params![id.as_str()], JobRow::from_row)
        .optional()
        .with_context_fn(|| format!("Failed to load job {}", id))?
        .map(JobRow::into_record)
        .transpose()
}

// =============================================================================
// Job Store
// =============================================================================

impl JobStore for Database {
    fn create(&self, record: &JobRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, \
             ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
            JOB_COLUMNS
        );
        self.conn()?
            .execute(
                &sql,
                params![
                    record.id.as_str(),
                    record.kind,
                    record.status.as_str(),
                    record.phase,
                    record.subphase,
                    record.expected_sections,
                    to_json(&record.completed_sections, "completed_sections")?,
                    record.retry_count,
                    record.retry_limit,
                    to_json(&record.logs, "logs")?,
                    record.completed_steps,
                    record.total_steps,
                    record.progress_percent,
                    to_json(&record.cost, "cost")?,
                    to_json_opt(record.result.as_ref(), "result")?,
                    record.error_category,
                    record.error_message,
                    to_json_opt(record.request.as_ref(), "request")?,
                    record.user_id,
                    record.parent_job_id.as_ref().map(|p| p.as_str()),
                    to_json_opt(record.child_payload.as_ref(), "child_payload")?,
                    stamp(&record.created_at),
                    stamp(&record.updated_at),
                    record.started_at.as_ref().map(stamp),
                    record.finished_at.as_ref().map(stamp),
                ],
            )
            .with_context_fn(|| format!("Failed to create job {}", record.id))?;

        tracing::debug!(job_id = %record.id, kind = %record.kind, "Job created");
        Ok(())
    }

    fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let conn = self.conn()?;
        load_job(&conn, id)
    }

    fn claim_batch(&self, kind: &str, limit: usize) -> Result<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = now_stamp();
        let sql = format!(
            "UPDATE jobs SET status = 'running', phase = 'starting', started_at = ?1, updated_at = ?1
             WHERE id IN (
                 SELECT id FROM jobs
                 WHERE status = 'queued' AND kind = ?2
                 ORDER BY created_at, rowid
                 LIMIT ?3
             )
             RETURNING {}",
            JOB_COLUMNS
        );

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&sql)
            .with_context("Failed to prepare claim query")?;
        let rows = stmt
            .query_map(params![now, kind, limit as i64], JobRow::from_row)
            .with_context("Failed to claim jobs")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context("Failed to read claimed jobs")?;

        let mut claimed = collect_jobs(rows)?;
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if !claimed.is_empty() {
            tracing::debug!(count = claimed.len(), kind, "Claimed jobs");
        }
        Ok(claimed)
    }

    fn save_progress(&self, record: &JobRecord) -> Result<bool> {
        let affected = self
            .conn()?
            .execute(
                "UPDATE jobs SET
                     phase = ?1, subphase = ?2, completed_sections = ?3, logs = ?4,
                     completed_steps = ?5, total_steps = ?6, progress_percent = ?7,
                     cost = ?8, result = ?9, updated_at = ?10
                 WHERE id = ?11 AND status != 'canceled'",
                params![
                    record.phase,
                    record.subphase,
                    to_json(&record.completed_sections, "completed_sections")?,
                    to_json(&record.logs, "logs")?,
                    record.completed_steps,
                    record.total_steps,
                    record.progress_percent,
                    to_json(&record.cost, "cost")?,
                    to_json_opt(record.result.as_ref(), "result")?,
                    stamp(&record.updated_at),
                    record.id.as_str(),
                ],
            )
            .with_context_fn(|| format!("Failed to save progress for job {}", record.id))?;
        Ok(affected > 0)
    }

    fn finish(&self, id: &JobId, outcome: &JobOutcome) -> Result<bool> {
        let now = now_stamp();
        let conn = self.conn()?;
        let affected = match outcome {
            JobOutcome::Done { result, cost } => conn.execute(
                "UPDATE jobs SET status = 'done', phase = 'done', subphase = NULL,
                     result = ?1, cost = ?2, progress_percent = 100,
                     completed_steps = total_steps, updated_at = ?3, finished_at = ?3
                 WHERE id = ?4 AND status = 'running'",
                params![to_json(result, "result")?, to_json(cost, "cost")?, now, id.as_str()],
            ),
            JobOutcome::Error { category, message } => conn.execute(
                "UPDATE jobs SET status = 'error', error_category = ?1, error_message = ?2,
                     updated_at = ?3, finished_at = ?3
                 WHERE id = ?4 AND status = 'running'",
                params![category, message, now, id.as_str()],
            ),
            JobOutcome::Canceled => conn.execute(
                "UPDATE jobs SET status = 'canceled', updated_at = ?1, finished_at = ?1
                 WHERE id = ?2 AND status IN ('queued', 'running')",
                params![now, id.as_str()],
            ),
        }
        .with_context_fn(|| format!("Failed to finish job {}", id))?;

        if affected > 0 {
            return Ok(true);
        }
        // A cancel that already landed counts as success for a cancel outcome
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .with_context_fn(|| format!("Failed to read status of job {}", id))?;
        match status.as_deref() {
            None => Err(ForgeError::NotFound(format!("job {}", id))),
            Some("canceled") => Ok(matches!(outcome, JobOutcome::Canceled)),
            Some(other) => Err(ForgeError::InvalidTransition {
                from: other.to_string(),
                to: outcome.status().to_string(),
            }),
        }
    }

    fn cancel(&self, id: &JobId) -> Result<bool> {
        let now = now_stamp();
        let conn = self.conn()?;
        let affected = conn
            .execute(
                "UPDATE jobs SET status = 'canceled', updated_at = ?1, finished_at = ?1
                 WHERE id = ?2 AND status IN ('queued', 'running')",
                params![now, id.as_str()],
            )
            .with_context_fn(|| format!("Failed to cancel job {}", id))?;
        if affected > 0 {
            tracing::info!(job_id = %id, "Job canceled");
            return Ok(true);
        }

        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![id.as_str()], |row| {
                row.get(0)
            })
            .optional()
            .with_context("Failed to look up job")?;
        match exists {
            Some(_) => Ok(false),
            None => Err(ForgeError::NotFound(format!("job {}", id))),
        }
    }

    fn requeue(&self, id: &JobId) -> Result<JobRecord> {
        let id = id.clone();
        self.transaction(move |conn| {
            let record =
                load_job(conn, &id)?.ok_or_else(|| ForgeError::NotFound(format!("job {}", id)))?;

            if !record.status.can_transition(JobStatus::Queued) {
                return Err(ForgeError::InvalidTransition {
                    from: record.status.to_string(),
                    to: JobStatus::Queued.to_string(),
                });
            }
            if record.retry_count >= record.retry_limit {
                return Err(ForgeError::RetryLimit {
                    job_id: id.to_string(),
                    limit: record.retry_limit,
                });
            }

            conn.execute(
                "UPDATE jobs SET status = 'queued', phase = 'queued', subphase = NULL,
                     retry_count = retry_count + 1, error_category = NULL, error_message = NULL,
                     completed_steps = 0, total_steps = 0, progress_percent = 0,
                     updated_at = ?1, started_at = NULL, finished_at = NULL
                 WHERE id = ?2",
                params![now_stamp(), id.as_str()],
            )
            .with_context_fn(|| format!("Failed to requeue job {}", id))?;

            load_job(conn, &id)?.ok_or_else(|| ForgeError::NotFound(format!("job {}", id)))
        })
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<JobRecord>> {
        let conn = self.conn()?;
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                    JOB_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![status.as_str(), limit as i64], JobRow::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                    JOB_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![limit as i64], JobRow::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        collect_jobs(rows)
    }
}

// =============================================================================
// Section Store
// =============================================================================

impl SectionStore for Database {
    fn save_plan(&self, job_id: &JobId, plan: &LessonPlan) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO lesson_plans (job_id, plan, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(job_id) DO UPDATE SET plan = excluded.plan",
                params![job_id.as_str(), to_json(plan, "plan")?, now_stamp()],
            )
            .with_context_fn(|| format!("Failed to save plan for job {}", job_id))?;
        Ok(())
    }

    fn load_plan(&self, job_id: &JobId) -> Result<Option<LessonPlan>> {
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT plan FROM lesson_plans WHERE job_id = ?1",
                params![job_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .with_context_fn(|| format!("Failed to load plan for job {}", job_id))?;
        raw.map(|r| from_json(&r, "plan", job_id.as_str()))
            .transpose()
    }

    fn save_section(&self, job_id: &JobId, section: &StructuredSection) -> Result<i64> {
        if !section.is_valid() {
            return Err(ForgeError::Storage(format!(
                "Refusing to store invalid section {} for job {}",
                section.number, job_id
            )));
        }
        let row_id: i64 = self
            .conn()?
            .query_row(
                "INSERT INTO lesson_sections (job_id, number, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(job_id, number) DO UPDATE SET payload = excluded.payload
                 RETURNING id",
                params![
                    job_id.as_str(),
                    section.number,
                    to_json(&section.payload, "section")?,
                    now_stamp(),
                ],
                |row| row.get(0),
            )
            .with_context_fn(|| {
                format!("Failed to save section {} for job {}", section.number, job_id)
            })?;
        Ok(row_id)
    }

    fn load_sections(&self, job_id: &JobId) -> Result<Vec<StructuredSection>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, number, payload FROM lesson_sections
                 WHERE job_id = ?1 ORDER BY number",
            )
            .with_context("Failed to prepare sections query")?;
        let rows = stmt
            .query_map(params![job_id.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context("Failed to fetch sections")?;

        rows.into_iter()
            .map(|(row_id, number, payload)| {
                let mut section =
                    StructuredSection::new(number, from_json(&payload, "section", job_id.as_str())?);
                section.row_ref = Some(row_id);
                Ok(section)
            })
            .collect()
    }
}

// =============================================================================
// Quota
// =============================================================================

fn quota_row(conn: &Connection, user: &str, metric: &str, period: &str) -> Result<(u32, u32)> {
    let row = conn
        .query_row(
            "SELECT used, reserved FROM quota_usage
             WHERE user_id = ?1 AND metric = ?2 AND period = ?3",
            params![user, metric, period],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .with_context("Failed to read quota usage")?;
    Ok(row.unwrap_or((0, 0)))
}

impl QuotaService for Database {
    fn reserve(
        &self,
        user: &str,
        metric: &str,
        period: &str,
        quantity: u32,
        limit: Option<u32>,
    ) -> Result<Reservation> {
        let reservation = Reservation {
            user: user.to_string(),
            metric: metric.to_string(),
            period: period.to_string(),
            quantity,
        };
        let held = reservation.clone();
        self.transaction(move |conn| {
            let (used, reserved) = quota_row(conn, &held.user, &held.metric, &held.period)?;
            check_limit(&held.metric, used, reserved, held.quantity, limit)?;
            conn.execute(
                "INSERT INTO quota_usage (user_id, metric, period, used, reserved)
                 VALUES (?1, ?2, ?3, 0, ?4)
                 ON CONFLICT(user_id, metric, period) DO UPDATE SET reserved = reserved + ?4",
                params![held.user, held.metric, held.period, held.quantity],
            )
            .with_context("Failed to reserve quota")?;
            Ok(())
        })?;
        tracing::debug!(user, metric, period, quantity, "Quota reserved");
        Ok(reservation)
    }

    fn commit(&self, reservation: &Reservation) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE quota_usage SET
                     used = used + ?4,
                     reserved = MAX(reserved - ?4, 0)
                 WHERE user_id = ?1 AND metric = ?2 AND period = ?3",
                params![
                    reservation.user,
                    reservation.metric,
                    reservation.period,
                    reservation.quantity
                ],
            )
            .with_context("Failed to commit quota")?;
        Ok(())
    }

    fn release(&self, reservation: &Reservation) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE quota_usage SET reserved = MAX(reserved - ?4, 0)
                 WHERE user_id = ?1 AND metric = ?2 AND period = ?3",
                params![
                    reservation.user,
                    reservation.metric,
                    reservation.period,
                    reservation.quantity
                ],
            )
            .with_context("Failed to release quota")?;
        Ok(())
    }

    fn remaining(
        &self,
        user: &str,
        metric: &str,
        period: &str,
        limit: Option<u32>,
    ) -> Result<Option<u32>> {
        let Some(limit) = limit else {
            return Ok(None);
        };
        let conn = self.conn()?;
        let (used, reserved) = quota_row(&conn, user, metric, period)?;
        Ok(Some(limit.saturating_sub(used + reserved)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::CostSummary;
    use crate::lesson::GenerationRequest;
    use serde_json::json;

    fn db() -> Database {
        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        db.initialize().expect("Failed to initialize schema");
        db
    }

    fn queued(db: &Database) -> JobRecord {
        let record = JobRecord::lesson(GenerationRequest::new("Tides", 3), Some("u1".into()), 2);
        db.create(&record).unwrap();
        record
    }

    #[test]
    fn test_open_in_memory() {
        let db = db();
        assert!(db.is_initialized().unwrap());

        let conn = db.conn().expect("Failed to get connection");
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in ["jobs", "lesson_plans", "lesson_sections", "quota_usage"] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_transaction_panic_safety() {
        let db = db();

        let result = db.transaction(|_conn| {
            panic!("Intentional panic for testing");
            #[allow(unreachable_code)]
            Ok(())
        });

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("panicked"));
        assert!(db.conn().is_ok());
    }

    #[test]
    fn test_job_round_trip() {
        let db = db();
        let record = queued(&db);
        let loaded = db.get(&record.id).unwrap().unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.request, record.request);
        assert_eq!(loaded.total_steps, 5);
        assert!(db.get(&JobId::from("missing")).unwrap().is_none());
    }

    #[test]
    fn test_claim_batch_is_exclusive() {
        let db = db();
        let first = queued(&db);
        let second = queued(&db);

        let claimed = db.claim_batch("lesson", 1).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first.id);
        assert_eq!(claimed[0].status, JobStatus::Running);
        assert!(claimed[0].started_at.is_some());

        let claimed = db.claim_batch("lesson", 5).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, second.id);

        assert!(db.claim_batch("lesson", 5).unwrap().is_empty());
        assert!(db.claim_batch("illustrator", 5).unwrap().is_empty());
    }

    #[test]
    fn test_save_progress_skips_canceled_job() {
        let db = db();
        let mut record = queued(&db);
        db.claim_batch("lesson", 1).unwrap();

        record.phase = "planning".into();
        assert!(db.save_progress(&record).unwrap());

        assert!(db.cancel(&record.id).unwrap());
        record.phase = "sections".into();
        assert!(!db.save_progress(&record).unwrap());

        let loaded = db.get(&record.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Canceled);
        assert_eq!(loaded.phase, "planning");
    }

    #[test]
    fn test_finish_done_and_error() {
        let db = db();
        let record = queued(&db);
        db.claim_batch("lesson", 1).unwrap();
        let done = JobOutcome::Done {
            result: json!({"lesson": {"title": "Tides"}}),
            cost: CostSummary::default(),
        };
        assert!(db.finish(&record.id, &done).unwrap());

        let loaded = db.get(&record.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Done);
        assert_eq!(loaded.progress_percent, 100);
        assert!(loaded.finished_at.is_some());

        // terminal jobs cannot finish twice
        let err = db
            .finish(
                &record.id,
                &JobOutcome::Error {
                    category: "generation_failed".into(),
                    message: "late".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ForgeError::InvalidTransition { .. }));
    }

    #[test]
    fn test_finish_after_cancel_reports_false() {
        let db = db();
        let record = queued(&db);
        db.claim_batch("lesson", 1).unwrap();
        db.cancel(&record.id).unwrap();

        let done = JobOutcome::Done {
            result: json!({}),
            cost: CostSummary::default(),
        };
        assert!(!db.finish(&record.id, &done).unwrap());
        assert!(db.finish(&record.id, &JobOutcome::Canceled).unwrap());
        assert_eq!(
            db.get(&record.id).unwrap().unwrap().status,
            JobStatus::Canceled
        );
    }

    #[test]
    fn test_cancel_states() {
        let db = db();
        let record = queued(&db);
        assert!(db.cancel(&record.id).unwrap());
        assert!(!db.cancel(&record.id).unwrap());
        assert!(matches!(
            db.cancel(&JobId::from("nope")),
            Err(ForgeError::NotFound(_))
        ));
    }

    #[test]
    fn test_requeue_respects_retry_limit() {
        let db = db();
        let record = queued(&db);

        let err = db.requeue(&record.id).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidTransition { .. }));

        for attempt in 1..=2 {
            db.claim_batch("lesson", 1).unwrap();
            db.finish(
                &record.id,
                &JobOutcome::Error {
                    category: "generation_failed".into(),
                    message: "boom".into(),
                },
            )
            .unwrap();
            let requeued = db.requeue(&record.id).unwrap();
            assert_eq!(requeued.status, JobStatus::Queued);
            assert_eq!(requeued.retry_count, attempt);
            assert!(requeued.error_category.is_none());
        }

        db.claim_batch("lesson", 1).unwrap();
        db.cancel(&record.id).unwrap();
        let err = db.requeue(&record.id).unwrap_err();
        assert!(matches!(err, ForgeError::RetryLimit { limit: 2, .. }));
    }

    #[test]
    fn test_requeue_resets_step_counter_but_keeps_sections() {
        let db = db();
        let record = queued(&db);
        let mut running = db.claim_batch("lesson", 1).unwrap().remove(0);
        running.total_steps = 5;
        running.completed_steps = 4;
        running.progress_percent = 80;
        running.mark_section_completed(1);
        assert!(db.save_progress(&running).unwrap());
        db.finish(
            &record.id,
            &JobOutcome::Error {
                category: "timeout".into(),
                message: "hard timeout".into(),
            },
        )
        .unwrap();

        let requeued = db.requeue(&record.id).unwrap();
        assert_eq!(requeued.completed_steps, 0);
        assert_eq!(requeued.total_steps, 0);
        assert_eq!(requeued.progress_percent, 0);
        assert_eq!(requeued.completed_sections, vec![1]);
    }

    #[test]
    fn test_list_filters_by_status() {
        let db = db();
        let a = queued(&db);
        let _b = queued(&db);
        db.cancel(&a.id).unwrap();

        assert_eq!(db.list(None, 10).unwrap().len(), 2);
        let canceled = db.list(Some(JobStatus::Canceled), 10).unwrap();
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].id, a.id);
    }

    #[test]
    fn test_sections_round_trip() {
        let db = db();
        let record = queued(&db);

        assert!(db.load_plan(&record.id).unwrap().is_none());
        let plan = LessonPlan {
            title: "Tides".into(),
            sections: Vec::new(),
        };
        db.save_plan(&record.id, &plan).unwrap();
        assert_eq!(db.load_plan(&record.id).unwrap(), Some(plan));

        let second = StructuredSection::new(2, json!({"title": "Two"}));
        let first = StructuredSection::new(1, json!({"title": "One"}));
        let row_two = db.save_section(&record.id, &second).unwrap();
        db.save_section(&record.id, &first).unwrap();

        // upsert keeps the row
        let again = StructuredSection::new(2, json!({"title": "Two again"}));
        assert_eq!(db.save_section(&record.id, &again).unwrap(), row_two);

        let loaded = db.load_sections(&record.id).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].number, 1);
        assert_eq!(loaded[1].payload["title"], "Two again");
        assert_eq!(loaded[1].row_ref, Some(row_two));
    }

    #[test]
    fn test_invalid_section_is_rejected() {
        let db = db();
        let record = queued(&db);
        let mut section = StructuredSection::new(1, json!({}));
        section.errors.push("title: required".into());
        assert!(db.save_section(&record.id, &section).is_err());
        assert!(db.load_sections(&record.id).unwrap().is_empty());
    }

    #[test]
    fn test_quota_reserve_commit_release() {
        let db = db();
        let first = db.reserve("u1", "lessons", "2026-03", 1, Some(2)).unwrap();
        let second = db.reserve("u1", "lessons", "2026-03", 1, Some(2)).unwrap();
        assert_eq!(
            db.remaining("u1", "lessons", "2026-03", Some(2)).unwrap(),
            Some(0)
        );

        let err = db.reserve("u1", "lessons", "2026-03", 1, Some(2)).unwrap_err();
        assert_eq!(err.client_category(), "quota_exceeded");

        db.commit(&first).unwrap();
        db.release(&second).unwrap();
        assert_eq!(
            db.remaining("u1", "lessons", "2026-03", Some(2)).unwrap(),
            Some(1)
        );
        assert_eq!(db.remaining("u1", "lessons", "2026-03", None).unwrap(), None);
        assert_eq!(
            db.remaining("u2", "lessons", "2026-03", Some(2)).unwrap(),
            Some(2)
        );
    }

    #[test]
    fn test_consume_commits_immediately() {
        let db = db();
        db.consume("u1", "sections", "2026-03", 3, Some(5)).unwrap();
        assert_eq!(
            db.remaining("u1", "sections", "2026-03", Some(5)).unwrap(),
            Some(2)
        );
        assert!(db.consume("u1", "sections", "2026-03", 3, Some(5)).is_err());
    }

    #[test]
    fn test_pool_config_sizing() {
        let size = PoolConfig::optimal_pool_size();
        assert!(size >= PoolConfig::MIN_POOL_SIZE);
        assert!(size <= PoolConfig::MAX_POOL_SIZE);

        let auto = PoolConfig::auto();
        assert_eq!(auto.max_size, size);
        assert!(auto.min_idle >= 2);

        let workers = PoolConfig::for_workers(40);
        assert_eq!(workers.max_size, PoolConfig::MAX_POOL_SIZE);
    }
}
