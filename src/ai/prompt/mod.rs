//! Prompt Builder System
//!
//! Standardized prompt construction for agent calls:
//! role, numbered objectives, ordered context, rule lists and JSON payloads.
//! Template text comes from the load-once [`PromptLibrary`].

mod library;

pub use library::{PromptLibrary, PromptName};

use serde_json::Value;

/// Prompt section types
#[derive(Debug, Clone)]
pub enum PromptSection {
    Role { expertise: String, task: String },
    Objectives(Vec<String>),
    /// Ordered key/value pairs
    Context(Vec<(String, String)>),
    Text {
        header: Option<String>,
        content: String,
    },
    /// Pretty-printed JSON under a header
    Json { header: String, value: Value },
    /// Hard rules the output must satisfy
    Rules(Vec<String>),
    Custom(String),
}

/// Prompt builder for consistent prompt construction
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    sections: Vec<PromptSection>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(mut self, expertise: &str, task: &str) -> Self {
        self.sections.push(PromptSection::Role {
            expertise: expertise.to_string(),
            task: task.to_string(),
        });
        self
    }

    pub fn objectives<S: AsRef<str>>(mut self, objectives: &[S]) -> Self {
        self.sections.push(PromptSection::Objectives(
            objectives.iter().map(|s| s.as_ref().to_string()).collect(),
        ));
        self
    }

    /// Add a context item; items accumulate into one ordered context block.
    /// Empty values are skipped.
    pub fn context_item(mut self, key: &str, value: &str) -> Self {
        if value.trim().is_empty() {
            return self;
        }
        let entry = (key.to_string(), value.to_string());
        match self
            .sections
            .iter_mut()
            .find_map(|s| match s {
                PromptSection::Context(items) => Some(items),
                _ => None,
            }) {
            Some(items) => items.push(entry),
            None => self.sections.push(PromptSection::Context(vec![entry])),
        }
        self
    }

    pub fn section(mut self, header: &str, content: &str) -> Self {
        self.sections.push(PromptSection::Text {
            header: Some(header.to_string()),
            content: content.to_string(),
        });
        self
    }

    pub fn text(mut self, content: &str) -> Self {
        self.sections.push(PromptSection::Text {
            header: None,
            content: content.to_string(),
        });
        self
    }

    pub fn json(mut self, header: &str, value: &Value) -> Self {
        self.sections.push(PromptSection::Json {
            header: header.to_string(),
            value: value.clone(),
        });
        self
    }

    pub fn rules<S: AsRef<str>>(mut self, rules: &[S]) -> Self {
        self.sections.push(PromptSection::Rules(
            rules.iter().map(|s| s.as_ref().to_string()).collect(),
        ));
        self
    }

    pub fn custom(mut self, content: &str) -> Self {
        self.sections.push(PromptSection::Custom(content.to_string()));
        self
    }

    /// Build the final prompt string
    pub fn build(self) -> String {
        let mut prompt = String::new();

        for section in self.sections {
            match section {
                PromptSection::Role { expertise, task } => {
                    prompt.push_str("<ROLE>\n");
                    prompt.push_str(&format!(
                        "You are an expert {} specializing in {}.\n",
                        expertise, task
                    ));
                    prompt.push_str("</ROLE>\n\n");
                }
                PromptSection::Objectives(objectives) => {
                    prompt.push_str("<OBJECTIVES>\n");
                    for (i, obj) in objectives.iter().enumerate() {
                        prompt.push_str(&format!("{}. {}\n", i + 1, obj));
                    }
                    prompt.push_str("</OBJECTIVES>\n\n");
                }
                PromptSection::Context(items) => {
                    prompt.push_str("# Context\n\n");
                    for (key, value) in items {
                        prompt.push_str(&format!("**{}**: {}\n", key, value));
                    }
                    prompt.push('\n');
                }
                PromptSection::Text { header, content } => {
                    if let Some(h) = header {
                        prompt.push_str(&format!("# {}\n\n", h));
                    }
                    prompt.push_str(content.trim_end());
                    prompt.push_str("\n\n");
                }
                PromptSection::Json { header, value } => {
                    let body = serde_json::to_string_pretty(&value)
                        .unwrap_or_else(|_| value.to_string());
                    prompt.push_str(&format!("# {}\n\n```json\n{}\n```\n\n", header, body));
                }
                PromptSection::Rules(rules) => {
                    prompt.push_str("<RULES>\n");
                    for rule in rules {
                        prompt.push_str(&format!("- {}\n", rule));
                    }
                    prompt.push_str("</RULES>\n\n");
                }
                PromptSection::Custom(content) => {
                    prompt.push_str(&content);
                    prompt.push_str("\n\n");
                }
            }
        }

        prompt.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_prompt() {
        let prompt = PromptBuilder::new()
            .role("instructional designer", "lesson planning")
            .objectives(&["Outline sections", "Pick widgets"])
            .build();

        assert!(prompt.contains("<ROLE>"));
        assert!(prompt.contains("instructional designer"));
        assert!(prompt.contains("1. Outline sections"));
        assert!(prompt.contains("2. Pick widgets"));
    }

    #[test]
    fn test_context_items_keep_order_and_skip_empty() {
        let prompt = PromptBuilder::new()
            .context_item("Topic", "Photosynthesis")
            .context_item("Details", "")
            .context_item("Level", "beginner")
            .build();

        let topic = prompt.find("**Topic**").unwrap();
        let level = prompt.find("**Level**").unwrap();
        assert!(topic < level);
        assert!(!prompt.contains("**Details**"));
    }

    #[test]
    fn test_json_and_rules() {
        let prompt = PromptBuilder::new()
            .json("Failing fragments", &json!({"path": "items.0"}))
            .rules(&["Only patch listed paths"])
            .build();

        assert!(prompt.contains("```json"));
        assert!(prompt.contains("\"path\": \"items.0\""));
        assert!(prompt.contains("- Only patch listed paths"));
    }
}
