//! Worker Command
//!
//! Process queued lesson jobs until Ctrl-C, or drain one batch with `--once`.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::CommandContext;
use crate::cli::ui::Output;
use crate::types::Result;

pub async fn run(ctx: &CommandContext, once: bool) -> Result<()> {
    let out = Output::new();
    let worker = ctx.worker()?;

    if once {
        let count = worker.run_once().await?;
        out.success(&format!("Processed {} job(s)", count));
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal.cancel();
        }
    });

    out.info(&format!(
        "Worker running ({} concurrent job(s)); Ctrl-C to stop",
        ctx.config.worker.max_concurrent_jobs
    ));
    worker.run(shutdown).await?;
    out.success("Worker stopped");
    Ok(())
}
