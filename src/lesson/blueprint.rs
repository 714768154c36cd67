//! Content-style blueprints.
//!
//! A blueprint picks the planning prompt variant and the widget set used when
//! a request does not narrow it.

use std::collections::BTreeMap;
use tracing::warn;

use super::widgets::{ContentKind, KindSet};
use crate::ai::PromptName;

pub const DEFAULT_BLUEPRINT: &str = "standard";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blueprint {
    pub name: String,
    pub planner_prompt: PromptName,
    pub default_widgets: KindSet,
}

/// Load-once blueprint table
#[derive(Debug, Clone)]
pub struct BlueprintRegistry {
    blueprints: BTreeMap<String, Blueprint>,
}

impl Default for BlueprintRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl BlueprintRegistry {
    pub fn builtin() -> Self {
        use ContentKind::*;

        let entries = [
            (DEFAULT_BLUEPRINT, PromptName::Planner, KindSet::all()),
            (
                "exam_prep",
                PromptName::PlannerExamPrep,
                [Markdown, Callout, Quiz, Flashcards, Definition, FillBlank]
                    .into_iter()
                    .collect(),
            ),
            (
                "storytelling",
                PromptName::PlannerStorytelling,
                [Markdown, Callout, Timeline, Quiz, Definition]
                    .into_iter()
                    .collect(),
            ),
        ];

        let blueprints = entries
            .into_iter()
            .map(|(name, planner_prompt, default_widgets)| {
                (
                    name.to_string(),
                    Blueprint {
                        name: name.to_string(),
                        planner_prompt,
                        default_widgets,
                    },
                )
            })
            .collect();
        Self { blueprints }
    }

    pub fn names(&self) -> Vec<&str> {
        self.blueprints.keys().map(String::as_str).collect()
    }

    /// Look up a blueprint; unknown names fall back to `standard`
    pub fn resolve(&self, name: &str) -> &Blueprint {
        if let Some(found) = self.blueprints.get(name) {
            return found;
        }
        warn!("Unknown blueprint '{}', using '{}'", name, DEFAULT_BLUEPRINT);
        &self.blueprints[DEFAULT_BLUEPRINT]
    }

    /// Widgets for a request: the blueprint's defaults narrowed by the
    /// request's own set, or the request's set alone if they do not overlap
    pub fn effective_widgets(&self, name: &str, requested: KindSet) -> KindSet {
        let defaults = self.resolve(name).default_widgets;
        let narrowed: KindSet = requested.iter().filter(|k| defaults.contains(*k)).collect();
        if narrowed.is_empty() { requested } else { narrowed }
    }
}
