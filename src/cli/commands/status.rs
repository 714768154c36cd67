//! Status Command
//!
//! Show one job in detail, or list recent jobs.

use crate::cli::CommandContext;
use crate::cli::ui::Output;
use crate::jobs::{JobStatus, JobStore};
use crate::types::{ForgeError, JobId, Result};

pub fn show(ctx: &CommandContext, id: &str, format: &str) -> Result<()> {
    let record = ctx
        .db
        .get(&JobId::new(id))?
        .ok_or_else(|| ForgeError::NotFound(format!("job {}", id)))?;

    let out = Output::new();
    if format == "json" {
        out.json(&record)
    } else {
        out.job(&record);
        Ok(())
    }
}

pub fn list(ctx: &CommandContext, status: Option<&str>, limit: usize, format: &str) -> Result<()> {
    let status = status.map(JobStatus::parse).transpose()?;
    let records = ctx.db.list(status, limit)?;

    let out = Output::new();
    if format == "json" {
        return out.json(&records);
    }
    if records.is_empty() {
        out.info("No jobs found");
        return Ok(());
    }
    out.header("Jobs");
    for record in &records {
        out.job_line(record);
    }
    Ok(())
}
