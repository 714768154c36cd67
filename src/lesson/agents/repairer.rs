//! Repairer - invalid section → repaired section

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{Agent, AgentRun, AgentRuntime};
use crate::config::RepairConfig;
use crate::lesson::repair::RepairEngine;
use crate::lesson::types::{JobContext, RepairInput, RepairResult};
use crate::types::AgentError;

pub struct Repairer {
    runtime: Arc<AgentRuntime>,
    engine: RepairEngine,
}

impl Repairer {
    pub fn new(runtime: Arc<AgentRuntime>, config: &RepairConfig) -> Self {
        Self {
            engine: RepairEngine::new(runtime.clone(), config),
            runtime,
        }
    }
}

#[async_trait]
impl Agent for Repairer {
    type Input = RepairInput;
    type Output = RepairResult;

    fn name(&self) -> &'static str {
        "repairer"
    }

    /// Never fails; residual errors are carried in the result
    async fn run(
        &self,
        input: &RepairInput,
        ctx: &JobContext,
    ) -> Result<AgentRun<RepairResult>, AgentError> {
        let number = input.section.number;
        if let Some(fixture) = self.runtime.fixtures().repair(number) {
            debug!(job_id = %ctx.job_id, section = number, "Repair served from fixture");
            return Ok(AgentRun::fixture(self.engine.apply_fixture(fixture, number, ctx)));
        }

        let (result, usage) = self.engine.repair(input, ctx).await;
        Ok(AgentRun::live(result, usage))
    }
}
