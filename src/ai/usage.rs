//! Usage and Cost Accounting
//!
//! Every agent call yields a [`UsageRecord`]; the orchestrator folds them into
//! a [`CostSummary`] for the job record and the final result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ai::provider::{LlmResponse, TokenUsage};
use crate::config::ModelPricing;

/// One provider call attributed to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub agent: String,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

/// Aggregated usage for a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_usd: f64,
    /// Cost per agent name
    #[serde(default)]
    pub by_agent: BTreeMap<String, f64>,
}

impl CostSummary {
    pub fn from_records(records: &[UsageRecord]) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.add(record);
        }
        summary
    }

    pub fn add(&mut self, record: &UsageRecord) {
        self.calls += 1;
        self.input_tokens += u64::from(record.usage.input_tokens);
        self.output_tokens += u64::from(record.usage.output_tokens);
        self.total_usd += record.cost_usd;
        *self.by_agent.entry(record.agent.clone()).or_default() += record.cost_usd;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Per-model USD pricing used when a provider does not report cost itself
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    models: BTreeMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new(models: BTreeMap<String, ModelPricing>) -> Self {
        Self { models }
    }

    /// Cost of `usage` on `model`; unknown models cost nothing
    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.models
            .get(model)
            .map(|p| {
                f64::from(usage.input_tokens) / 1000.0 * p.input_per_1k
                    + f64::from(usage.output_tokens) / 1000.0 * p.output_per_1k
            })
            .unwrap_or(0.0)
    }

    /// Turn a provider response into a usage record for `agent`
    pub fn record(&self, agent: &str, response: &LlmResponse) -> UsageRecord {
        let cost_usd = if response.cost_usd > 0.0 {
            response.cost_usd
        } else {
            self.cost(&response.metadata.model, &response.usage)
        };
        UsageRecord {
            agent: agent.to_string(),
            provider: response.metadata.provider.clone(),
            model: response.metadata.model.clone(),
            usage: response.usage,
            cost_usd,
        }
    }
}
