//! Targeted JSON Repair Engine
//!
//! Turns a section with known validation failures into a corrected section,
//! touching as little of the original content as possible:
//!
//! 1. Local structural fallbacks (no model call)
//! 2. Target extraction from error paths, at content-item granularity
//! 3. Error-noise collapsing for items that matched no variant
//! 4. Minimal widget schema for the implicated kinds
//! 5. One model call returning `(path, replacement)` patches, retried once
//! 6. Re-validation
//!
//! Repair never fails: an unrepairable section comes back unchanged with its
//! residual errors, and the caller decides what that means.

mod local;
mod targets;

pub use targets::{ParsedError, RepairTarget, collapse_noise, parse_errors};

use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use self::targets::{extract_targets, implicated_kinds};
use super::agents::AgentRuntime;
use super::path::JsonPath;
use super::types::{JobContext, RepairInput, RepairResult};
use super::widgets::KindSet;
use crate::ai::{PromptBuilder, PromptName, UsageRecord};
use crate::config::RepairConfig;
use crate::constants::repair::MAX_FRAGMENT_CHARS;
use crate::types::truncate_chars;

pub const DETERMINISTIC_REPAIR: &str = "deterministic_repair";
pub const AI_REPAIR: &str = "ai_repair";
pub const FIXTURE_REPAIR: &str = "fixture_repair";

const AGENT: &str = "repairer";

pub struct RepairEngine {
    runtime: Arc<AgentRuntime>,
    noise_threshold: usize,
    model_repair: bool,
}

impl RepairEngine {
    pub fn new(runtime: Arc<AgentRuntime>, config: &RepairConfig) -> Self {
        Self {
            runtime,
            noise_threshold: config.noise_threshold,
            model_repair: config.model_repair,
        }
    }

    fn validate(&self, payload: &Value, number: u32, ctx: &JobContext) -> Vec<String> {
        let allowed = self.runtime.allowed_widgets(&ctx.request);
        self.runtime
            .schemas()
            .validate_section(payload, &ctx.request.topic, number, allowed)
            .errors
    }

    /// Repair one section; returns the result and any usage it cost
    #[instrument(skip_all, fields(job_id = %ctx.job_id, section = input.section.number))]
    pub async fn repair(&self, input: &RepairInput, ctx: &JobContext) -> (RepairResult, Vec<UsageRecord>) {
        let number = input.section.number;
        let mut payload = input.section.payload.clone();
        let mut changes = Vec::new();

        let mut errors = if input.section.errors.is_empty() {
            self.validate(&payload, number, ctx)
        } else {
            input.section.errors.clone()
        };
        if errors.is_empty() {
            return (result(payload, changes, errors, 0), Vec::new());
        }

        // 1. Local fallbacks
        let local_tags = local::apply(&mut payload, &parse_errors(&errors), &input.draft);
        if !local_tags.is_empty() {
            debug!("Local fallbacks applied: {}", local_tags.join(", "));
            changes.push(DETERMINISTIC_REPAIR.to_string());
            changes.extend(local_tags);
            errors = self.validate(&payload, number, ctx);
            if errors.is_empty() {
                info!("Section {} repaired locally", number);
                return (result(payload, changes, errors, 0), Vec::new());
            }
        }

        if !self.model_repair {
            return (result(payload, changes, errors, 0), Vec::new());
        }

        // 2-3. Targets with collapsed errors
        let mut targets = extract_targets(&payload, &parse_errors(&errors));
        if targets.is_empty() {
            warn!("Section {}: no resolvable repair targets", number);
            return (result(payload, changes, errors, 0), Vec::new());
        }
        for target in &mut targets {
            target.errors = collapse_noise(
                &target.path,
                &target.value,
                std::mem::take(&mut target.errors),
                self.noise_threshold,
            );
        }

        // 4. Minimal schema
        let allowed = self.runtime.allowed_widgets(&ctx.request);
        let kinds = implicated_kinds(&targets, allowed);
        let value_schema = if targets.iter().all(|t| t.is_item) {
            self.runtime.schemas().widget_schema(kinds)
        } else {
            json!({})
        };
        let paths: Vec<String> = targets.iter().map(|t| t.path.to_string()).collect();
        let schema = self.runtime.schemas().patch_schema(&paths, value_schema);

        // 5. Model-assisted patching
        let prompt = self.build_prompt(input, ctx, &targets, kinds);
        let (patches, usage) = match self
            .runtime
            .structured(AGENT, &prompt, &schema, decode_patches)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("Section {}: model repair failed: {}", number, err);
                return (result(payload, changes, errors, 0), Vec::new());
            }
        };

        let known: BTreeSet<&str> = paths.iter().map(String::as_str).collect();
        let mut applied = Vec::new();
        for (path, value) in patches {
            if !known.contains(path.as_str()) {
                debug!("Ignoring patch for unknown path '{}'", path);
                continue;
            }
            if JsonPath::parse(&path).set(&mut payload, value) {
                applied.push(path);
            }
        }
        if !applied.is_empty() {
            changes.push(AI_REPAIR.to_string());
            changes.extend(applied.iter().map(|p| format!("{}:patched", p)));
        }

        // 6. Re-validate
        let errors = self.validate(&payload, number, ctx);
        if errors.is_empty() {
            info!("Section {} repaired with {} patch(es)", number, applied.len());
        } else {
            warn!("Section {} still has {} error(s) after repair", number, errors.len());
        }
        let calls = usage.len() as u32;
        (result(payload, changes, errors, calls), usage)
    }

    /// Validate a fixture replacement for a section
    pub fn apply_fixture(&self, fixture: &Value, number: u32, ctx: &JobContext) -> RepairResult {
        let errors = self.validate(fixture, number, ctx);
        result(fixture.clone(), vec![FIXTURE_REPAIR.to_string()], errors, 0)
    }

    fn build_prompt(
        &self,
        input: &RepairInput,
        ctx: &JobContext,
        targets: &[RepairTarget],
        kinds: KindSet,
    ) -> String {
        let fragments: Vec<Value> = targets
            .iter()
            .map(|t| {
                let rendered = t.value.to_string();
                let value = if rendered.chars().count() > MAX_FRAGMENT_CHARS {
                    json!(truncate_chars(&rendered, MAX_FRAGMENT_CHARS))
                } else {
                    t.value.clone()
                };
                json!({"path": t.path.to_string(), "value": value, "errors": t.errors})
            })
            .collect();

        PromptBuilder::new()
            .role("content editor", "fixing structured lesson JSON")
            .text(self.runtime.prompts().get(PromptName::Repair))
            .context_item("Topic", &ctx.request.topic)
            .context_item(
                "Section",
                &format!("{}. {}", input.draft.number, input.draft.title),
            )
            .json("Failing fragments", &Value::Array(fragments))
            .section("Allowed widgets", &self.runtime.widgets().describe(kinds))
            .rules(&[
                "Return one patch per failing fragment, using its path exactly",
                "A patch value replaces the whole fragment",
                "Keep the original wording unless an error requires a change",
            ])
            .build()
    }
}

fn result(fixed: Value, changes: Vec<String>, errors: Vec<String>, model_calls: u32) -> RepairResult {
    RepairResult {
        fixed,
        changes,
        errors,
        model_calls,
    }
}

/// `{"patches": [{"path", "value"}]}` (a bare list is accepted too)
pub(crate) fn decode_patches(value: Value) -> Result<Vec<(String, Value)>, String> {
    let list = match value {
        Value::Object(mut obj) => match obj.remove("patches") {
            Some(Value::Array(list)) => list,
            _ => return Err("expected a 'patches' list".to_string()),
        },
        Value::Array(list) => list,
        _ => return Err("expected a 'patches' list".to_string()),
    };

    list.into_iter()
        .map(|patch| {
            let path = patch
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| "patch without a string 'path'".to_string())?
                .to_string();
            let value = patch
                .get("value")
                .cloned()
                .ok_or_else(|| format!("patch for '{}' has no 'value'", path))?;
            Ok((path, value))
        })
        .collect()
}
