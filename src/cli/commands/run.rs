//! Run Command
//!
//! Submit a lesson and process it in-process, following progress until the
//! job reaches a terminal state. Ctrl-C cancels the job.

use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::submit::{SubmitArgs, enqueue};
use crate::cli::CommandContext;
use crate::cli::ui::Output;
use crate::jobs::{JobRecord, JobStatus, JobStore};
use crate::types::{ForgeError, JobId, Result};

const FOLLOW_INTERVAL: Duration = Duration::from_millis(250);

pub async fn run(ctx: &CommandContext, args: &SubmitArgs, output: Option<&Path>) -> Result<()> {
    let out = Output::new();
    let worker = ctx.worker()?;
    let record = enqueue(ctx, args)?;
    out.info(&format!("Job {} queued: {}", record.id, args.topic));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.clone().run(shutdown.clone()));

    let finished = follow(ctx, &record.id, &out).await;
    shutdown.cancel();
    match handle.await {
        Ok(Err(e)) => warn!("Worker stopped with error: {}", e),
        Err(e) => warn!("Worker task failed: {}", e),
        Ok(Ok(())) => {}
    }
    let finished = finished?;

    match finished.status {
        JobStatus::Done => {
            let document = finished.result.clone().unwrap_or_default();
            let rendered = serde_json::to_string_pretty(&document)?;
            match output {
                Some(path) => {
                    std::fs::write(path, rendered)?;
                    out.success(&format!("Lesson written to {}", path.display()));
                }
                None => println!("{}", rendered),
            }
            if finished.cost.calls > 0 {
                out.field(
                    "cost",
                    format!("${:.4} over {} call(s)", finished.cost.total_usd, finished.cost.calls),
                );
            }
            Ok(())
        }
        JobStatus::Canceled => {
            out.warning(&format!("Job {} canceled", finished.id));
            Ok(())
        }
        _ => Err(ForgeError::Storage(format!(
            "Job {} failed: {}",
            finished.id,
            finished.error_category.as_deref().unwrap_or("unknown")
        ))),
    }
}

/// Print new log lines until the job is terminal
async fn follow(ctx: &CommandContext, id: &JobId, out: &Output) -> Result<JobRecord> {
    let mut printed: Vec<String> = Vec::new();
    let mut interrupted = false;

    loop {
        let record = ctx
            .db
            .get(id)?
            .ok_or_else(|| ForgeError::NotFound(format!("job {}", id)))?;

        let start = overlap(&printed, &record.logs);
        for line in &record.logs[start..] {
            out.info(line);
        }
        printed = record.logs.clone();

        if record.status.is_terminal() {
            return Ok(record);
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                out.warning("Interrupted, canceling job");
                ctx.db.cancel(id)?;
            }
            _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
        }
    }
}

/// Index of the first line in `current` not already shown from `previous`
fn overlap(previous: &[String], current: &[String]) -> usize {
    (0..=current.len().min(previous.len()))
        .rev()
        .find(|&n| previous.ends_with(&current[..n]))
        .unwrap_or(0)
}
