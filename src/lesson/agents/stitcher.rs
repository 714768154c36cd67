//! Stitcher - validated sections → final lesson
//!
//! Deterministic: no provider call. Sections are ordered by number, widgets
//! are rewritten to shorthand where that is lossless, and null `subsections`
//! are dropped.

use async_trait::async_trait;
use serde_json::Value;

use super::{Agent, AgentRun};
use crate::constants::document::MAX_LESSON_TITLE;
use crate::lesson::types::{FinalLesson, JobContext, StructuredSection};
use crate::lesson::widgets::to_shorthand;
use crate::types::AgentError;

#[derive(Debug, Clone)]
pub struct StitchInput {
    pub title: String,
    pub sections: Vec<StructuredSection>,
}

#[derive(Debug, Default)]
pub struct Stitcher;

impl Stitcher {
    pub fn new() -> Self {
        Self
    }

    fn normalize_items(container: &mut serde_json::Map<String, Value>) {
        if let Some(Value::Array(items)) = container.get_mut("items") {
            for item in items.iter_mut() {
                if let Some(short) = to_shorthand(item) {
                    *item = short;
                }
            }
        }
    }

    fn normalize_section(mut payload: Value) -> Value {
        let Some(section) = payload.as_object_mut() else {
            return payload;
        };
        Self::normalize_items(section);

        if section.get("subsections").is_some_and(Value::is_null) {
            section.remove("subsections");
        }
        if let Some(Value::Array(subsections)) = section.get_mut("subsections") {
            for sub in subsections.iter_mut().filter_map(Value::as_object_mut) {
                Self::normalize_items(sub);
            }
        }
        payload
    }

    /// Merge sections into a lesson; pure and order-independent in its input
    pub fn stitch(input: &StitchInput) -> FinalLesson {
        let mut sections = input.sections.clone();
        sections.sort_by_key(|s| s.number);

        let title = input.title.trim();
        let title = if title.is_empty() {
            "Lesson".to_string()
        } else {
            title.chars().take(MAX_LESSON_TITLE).collect()
        };

        FinalLesson {
            title,
            sections: sections
                .into_iter()
                .map(|s| Self::normalize_section(s.payload))
                .collect(),
            validation: None,
        }
    }
}

#[async_trait]
impl Agent for Stitcher {
    type Input = StitchInput;
    type Output = FinalLesson;

    fn name(&self) -> &'static str {
        "stitcher"
    }

    async fn run(
        &self,
        input: &StitchInput,
        _ctx: &JobContext,
    ) -> Result<AgentRun<FinalLesson>, AgentError> {
        if input.sections.is_empty() {
            return Err(AgentError::fatal(self.name(), "no sections to stitch"));
        }
        Ok(AgentRun::local(Self::stitch(input)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use serde_json::json;

    #[test]
    fn test_stitch_orders_and_normalizes() {
        let input = StitchInput {
            title: "Tides".into(),
            sections: vec![
                StructuredSection::new(2, json!({"title": "B", "items": [], "subsections": null})),
                StructuredSection::new(
                    1,
                    json!({
                        "title": "A",
                        "items": [
                            {"type": "markdown", "content": "lossless"},
                            {"type": "markdown", "content": "kept", "id": "w1"}
                        ],
                        "subsections": [{"heading": "H", "items": [{"type": "code", "content": {"language": "rs", "source": "x"}}]}]
                    }),
                ),
            ],
        };
        let lesson = Stitcher::stitch(&input);

        assert_eq!(lesson.title, "Tides");
        assert_eq!(lesson.sections[0]["title"], "A");
        assert_eq!(lesson.sections[0]["items"][0], json!({"markdown": "lossless"}));
        assert_eq!(lesson.sections[0]["items"][1]["id"], "w1");
        assert_eq!(
            lesson.sections[0]["subsections"][0]["items"][0],
            json!({"code": {"language": "rs", "source": "x"}})
        );
        assert!(lesson.sections[1].get("subsections").is_none());
    }

    #[tokio::test]
    async fn test_empty_input_is_fatal() {
        let input = StitchInput {
            title: "T".into(),
            sections: vec![],
        };
        assert!(Stitcher::new().run(&input, &context(1)).await.is_err());
    }
}
