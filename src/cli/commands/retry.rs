//! Retry Command
//!
//! Requeue a failed or canceled job. The worker resumes it from the stored
//! plan and any sections that already validated.

use crate::cli::CommandContext;
use crate::cli::ui::Output;
use crate::jobs::JobStore;
use crate::types::{JobId, Result};

pub fn run(ctx: &CommandContext, id: &str) -> Result<()> {
    let record = ctx.db.requeue(&JobId::new(id))?;
    let out = Output::new();
    out.success(&format!(
        "Job {} requeued (retry {} of {})",
        record.id, record.retry_count, record.retry_limit
    ));
    if !record.completed_sections.is_empty() {
        out.field("resume", format!("sections {:?} kept", record.completed_sections));
    }
    Ok(())
}
