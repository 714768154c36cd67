//! Job lifecycle: records, persistence contract, quota accounting, progress
//! tracking and the background worker.

pub mod quota;
pub mod record;
pub mod store;
pub mod tracker;
pub mod worker;

pub use quota::{QuotaService, Reservation, period_key};
pub use record::{JobOutcome, JobRecord, JobStatus};
pub use store::JobStore;
pub use tracker::JobTracker;
pub use worker::{Worker, submit};
