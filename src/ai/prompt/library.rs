//! Prompt template cache.
//!
//! Templates are resolved once at construction (built-in text, optionally
//! overridden by `<prompts_dir>/<name>.md`) and are immutable afterwards.
//! Editing an override file takes effect on the next process start.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::types::{Result, ResultExt};

/// Template identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptName {
    Planner,
    PlannerExamPrep,
    PlannerStorytelling,
    Section,
    Repair,
}

impl PromptName {
    pub const ALL: [PromptName; 5] = [
        Self::Planner,
        Self::PlannerExamPrep,
        Self::PlannerStorytelling,
        Self::Section,
        Self::Repair,
    ];

    pub fn file_stem(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::PlannerExamPrep => "planner_exam_prep",
            Self::PlannerStorytelling => "planner_storytelling",
            Self::Section => "section",
            Self::Repair => "repair",
        }
    }

    fn builtin(&self) -> &'static str {
        match self {
            Self::Planner => PLANNER,
            Self::PlannerExamPrep => PLANNER_EXAM_PREP,
            Self::PlannerStorytelling => PLANNER_STORYTELLING,
            Self::Section => SECTION,
            Self::Repair => REPAIR,
        }
    }
}

/// Load-once prompt template cache
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    templates: HashMap<PromptName, String>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self {
            templates: PromptName::ALL
                .iter()
                .map(|name| (*name, name.builtin().to_string()))
                .collect(),
        }
    }
}

impl PromptLibrary {
    /// Resolve every template, preferring overrides found in `dir`
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let mut library = Self::default();
        let Some(dir) = dir else {
            return Ok(library);
        };

        for name in PromptName::ALL {
            let path = dir.join(format!("{}.md", name.file_stem()));
            if path.exists() {
                let text = fs::read_to_string(&path)
                    .with_context_fn(|| format!("reading prompt override {}", path.display()))?;
                debug!("Prompt override loaded: {}", path.display());
                library.templates.insert(name, text);
            }
        }
        info!("Prompt library ready ({} templates)", library.templates.len());
        Ok(library)
    }

    pub fn get(&self, name: PromptName) -> &str {
        self.templates
            .get(&name)
            .map(String::as_str)
            .unwrap_or_else(|| name.builtin())
    }
}

// =============================================================================
// Built-in Templates
// =============================================================================

const PLANNER: &str = "\
Design a lesson outline. Each section builds on the previous one and ends with
a short check for understanding. Give every subsection a concrete title and
list the content widgets you intend to use in it (planned_widgets). Widget
names must come from the allowed list.";

const PLANNER_EXAM_PREP: &str = "\
Design an exam-preparation lesson outline. Front-load key definitions, then
alternate short explanations with practice (quiz, fill_blank, flashcards).
Close each section with a recap of what is most likely to be examined.";

const PLANNER_STORYTELLING: &str = "\
Design a narrative lesson outline. Introduce the topic through a story or
historical thread that continues across sections; use timeline and callout
widgets to anchor facts inside the narrative.";

const SECTION: &str = r#"Write the content for exactly one lesson section. Items are content widgets in
shorthand form: an object with a single key naming the widget kind, e.g.
{"markdown": "..."} or {"quiz": {"question": "...", "options": [...], "answer": 0}}.
Subsections use the key "heading" for their title and hold their own items list.
Stay within the length limits given in the schema."#;

const REPAIR: &str = "\
Some fragments of a generated lesson section failed validation. For each
failing fragment return a replacement value that fixes every listed error while
keeping the original wording wherever possible. Answer with a list of patches,
one per fragment, and only for the listed paths.";

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_templates() {
        let library = PromptLibrary::default();
        assert!(library.get(PromptName::Section).contains("heading"));
        assert!(library.get(PromptName::Repair).contains("patches"));
    }

    #[test]
    fn test_override_from_dir() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("planner.md"), "custom planner text").unwrap();

        let library = PromptLibrary::load(Some(dir.path())).unwrap();
        assert_eq!(library.get(PromptName::Planner), "custom planner text");
        assert_eq!(
            library.get(PromptName::Repair),
            PromptName::Repair.builtin()
        );
    }
}
