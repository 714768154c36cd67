//! Cancel Command

use crate::cli::CommandContext;
use crate::cli::ui::Output;
use crate::jobs::JobStore;
use crate::types::{JobId, Result};

pub fn run(ctx: &CommandContext, id: &str) -> Result<()> {
    let out = Output::new();
    if ctx.db.cancel(&JobId::new(id))? {
        out.success(&format!("Job {} canceled", id));
    } else {
        out.warning(&format!("Job {} already finished; nothing to cancel", id));
    }
    Ok(())
}
