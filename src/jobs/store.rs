//! Job persistence contract.

use super::record::{JobOutcome, JobRecord, JobStatus};
use crate::types::{JobId, Result};

/// Storage for [`JobRecord`]s.
///
/// Every write that could race an external cancel must leave a `canceled`
/// record untouched and report that it did so.
pub trait JobStore: Send + Sync {
    fn create(&self, record: &JobRecord) -> Result<()>;

    fn get(&self, id: &JobId) -> Result<Option<JobRecord>>;

    /// Atomically move up to `limit` queued jobs of `kind` to `running`
    fn claim_batch(&self, kind: &str, limit: usize) -> Result<Vec<JobRecord>>;

    /// Write progress fields; `false` when the job was canceled meanwhile
    fn save_progress(&self, record: &JobRecord) -> Result<bool>;

    /// Terminal write for a running job; `false` when the job was canceled
    fn finish(&self, id: &JobId, outcome: &JobOutcome) -> Result<bool>;

    /// Cancel a queued or running job; `false` when it was already terminal
    fn cancel(&self, id: &JobId) -> Result<bool>;

    /// `error|canceled → queued` with an incremented retry count
    fn requeue(&self, id: &JobId) -> Result<JobRecord>;

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<JobRecord>>;
}
