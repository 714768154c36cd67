//! Structural validator.
//!
//! Walks a [`Shape`] against a JSON value and reports every violation with a
//! dot-path. Message wording is stable: the repair engine and the repair
//! prompt both read it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

use super::shape::Shape;
use crate::lesson::widgets::{ContentKind, ItemForm, KindSet, identify};

pub const FIELD_REQUIRED: &str = "Field required";
pub const EXTRA_FORBIDDEN: &str = "Extra inputs are not permitted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Missing,
    WrongType,
    TooLong,
    TooMany,
    TooFew,
    Extra,
    Literal,
    Ambiguous,
}

/// One validation failure
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Issue {
    pub path: String,
    pub message: String,
    pub kind: IssueKind,
}

impl Issue {
    /// Length/count overruns only; the content itself is well-formed
    pub fn is_soft(&self) -> bool {
        matches!(self.kind, IssueKind::TooLong | IssueKind::TooMany)
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Validates values against shapes, restricting widgets to `allowed` kinds
pub struct Validator {
    allowed: KindSet,
    path: Vec<String>,
    issues: Vec<Issue>,
}

impl Validator {
    /// Validate `value` against `shape`; issues are deduplicated, first
    /// occurrence order kept.
    pub fn run(shape: &Shape, value: &Value, allowed: KindSet) -> Vec<Issue> {
        let mut validator = Self {
            allowed,
            path: Vec::new(),
            issues: Vec::new(),
        };
        validator.check(shape, value);

        let mut seen = HashSet::new();
        validator
            .issues
            .into_iter()
            .filter(|issue| seen.insert((issue.path.clone(), issue.message.clone())))
            .collect()
    }

    fn report(&mut self, kind: IssueKind, message: impl Into<String>) {
        self.issues.push(Issue {
            path: self.path.join("."),
            message: message.into(),
            kind,
        });
    }

    fn report_at(&mut self, segment: &str, kind: IssueKind, message: impl Into<String>) {
        self.path.push(segment.to_string());
        self.report(kind, message);
        self.path.pop();
    }

    fn nested(&mut self, segment: impl Into<String>, shape: &Shape, value: &Value) {
        self.path.push(segment.into());
        self.check(shape, value);
        self.path.pop();
    }

    fn check(&mut self, shape: &Shape, value: &Value) {
        match shape {
            Shape::Text { max_len } => match value.as_str() {
                None => self.report(IssueKind::WrongType, "Input should be a valid string"),
                Some("") => self.report(IssueKind::TooFew, "String should have at least 1 character"),
                Some(s) if s.chars().count() > *max_len => self.report(
                    IssueKind::TooLong,
                    format!("String should have at most {} characters", max_len),
                ),
                Some(_) => {}
            },
            Shape::Integer => {
                if !(value.is_i64() || value.is_u64()) {
                    self.report(IssueKind::WrongType, "Input should be a valid integer");
                }
            }
            Shape::OneOf(options) => {
                if !value.as_str().is_some_and(|s| options.contains(&s)) {
                    self.report(IssueKind::Literal, literal_message(options));
                }
            }
            Shape::List {
                item,
                min_items,
                max_items,
            } => {
                let Some(items) = value.as_array() else {
                    self.report(IssueKind::WrongType, "Input should be a valid list");
                    return;
                };
                if items.len() > *max_items {
                    self.report(
                        IssueKind::TooMany,
                        format!("List should have at most {} items", max_items),
                    );
                }
                if items.len() < *min_items {
                    self.report(
                        IssueKind::TooFew,
                        format!("List should have at least {} items", min_items),
                    );
                }
                for (i, element) in items.iter().enumerate() {
                    self.nested(i.to_string(), item, element);
                }
            }
            Shape::Record(fields) => {
                let Some(obj) = value.as_object() else {
                    self.report(IssueKind::WrongType, "Input should be a valid dictionary");
                    return;
                };
                for field in fields.iter() {
                    match obj.get(field.name) {
                        None | Some(Value::Null) if field.required => {
                            self.report_at(field.name, IssueKind::Missing, FIELD_REQUIRED)
                        }
                        None | Some(Value::Null) => {}
                        Some(member) => self.nested(field.name, &field.shape, member),
                    }
                }
                for key in obj.keys() {
                    if !fields.iter().any(|f| f.name == key) {
                        self.report_at(key, IssueKind::Extra, EXTRA_FORBIDDEN);
                    }
                }
            }
            Shape::Widget => self.check_widget(value),
        }
    }

    fn check_widget(&mut self, value: &Value) {
        let Some(obj) = value.as_object() else {
            self.report(IssueKind::WrongType, "Input should be a valid dictionary");
            return;
        };

        match identify(value, self.allowed) {
            ItemForm::Shorthand(kind) => {
                if let Some(body) = obj.get(kind.as_str()) {
                    self.nested(kind.as_str(), kind.body_shape(), body);
                }
            }
            ItemForm::FullForm(kind) => match obj.get("content") {
                Some(body) => self.nested("content", kind.body_shape(), body),
                None => self.report_at("content", IssueKind::Missing, FIELD_REQUIRED),
            },
            ItemForm::Unrecognized => self.check_unrecognized(obj),
        }
    }

    /// Item matching no variant: report what each allowed variant wanted.
    fn check_unrecognized(&mut self, obj: &Map<String, Value>) {
        let present: Vec<ContentKind> = obj
            .keys()
            .filter_map(|k| ContentKind::parse(k))
            .filter(|k| self.allowed.contains(*k))
            .collect();

        match present.as_slice() {
            [] => {
                let allowed: Vec<ContentKind> = self.allowed.iter().collect();
                for kind in allowed {
                    self.report_at(kind.as_str(), IssueKind::Missing, FIELD_REQUIRED);
                }
            }
            [kind] => {
                if let Some(body) = obj.get(kind.as_str()) {
                    self.nested(kind.as_str(), kind.body_shape(), body);
                }
            }
            many => {
                let names: Vec<&str> = many.iter().map(|k| k.as_str()).collect();
                self.report(
                    IssueKind::Ambiguous,
                    format!(
                        "Content item must contain exactly one widget key, found: {}",
                        names.join(", ")
                    ),
                );
            }
        }

        for key in obj.keys() {
            let is_allowed_kind = ContentKind::parse(key).is_some_and(|k| self.allowed.contains(k));
            if !is_allowed_kind {
                self.report_at(key, IssueKind::Extra, EXTRA_FORBIDDEN);
            }
        }
    }
}

fn literal_message(options: &[&str]) -> String {
    let quoted: Vec<String> = options.iter().map(|o| format!("'{}'", o)).collect();
    match quoted.split_last() {
        Some((last, rest)) if !rest.is_empty() => {
            format!("Input should be {} or {}", rest.join(", "), last)
        }
        Some((only, _)) => format!("Input should be {}", only),
        None => "Input should be a valid literal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lesson::schema::shape::{SECTION, SUBSECTION};
    use serde_json::json;

    fn messages(issues: &[Issue]) -> Vec<String> {
        issues.iter().map(|i| i.to_string()).collect()
    }

    #[test]
    fn test_valid_section_has_no_issues() {
        let section = json!({
            "title": "Light reactions",
            "items": [{"markdown": "Plants capture light."}],
            "subsections": [{
                "heading": "Chlorophyll",
                "items": [{"quiz": {"question": "Color?", "options": ["green", "red"], "answer": 0}}]
            }]
        });
        assert!(Validator::run(&SECTION, &section, KindSet::all()).is_empty());
    }

    #[test]
    fn test_legacy_title_key_reports_missing_heading() {
        let sub = json!({"title": "Old", "items": []});
        let issues = Validator::run(&SUBSECTION, &sub, KindSet::all());
        assert_eq!(
            messages(&issues),
            vec![
                "heading: Field required".to_string(),
                "title: Extra inputs are not permitted".to_string(),
            ]
        );
    }

    #[test]
    fn test_overlong_text_is_soft() {
        let section = json!({"title": "x".repeat(200), "items": []});
        let issues = Validator::run(&SECTION, &section, KindSet::all());
        assert_eq!(issues.len(), 1);
        assert!(issues[0].is_soft());
        assert_eq!(issues[0].message, "String should have at most 120 characters");
    }

    #[test]
    fn test_unrecognized_item_reports_every_variant() {
        let section = json!({"title": "T", "items": [{"video": "x"}]});
        let issues = Validator::run(&SECTION, &section, KindSet::all());
        let required = issues.iter().filter(|i| i.message == FIELD_REQUIRED).count();
        assert_eq!(required, ContentKind::ALL.len());
        assert!(
            issues
                .iter()
                .any(|i| i.path == "items.0.video" && i.kind == IssueKind::Extra)
        );
    }

    #[test]
    fn test_disallowed_kind_is_unrecognized() {
        let allowed = KindSet::parse_names(&["markdown"]).unwrap();
        let section = json!({"title": "T", "items": [{"quiz": {}}]});
        let issues = Validator::run(&SECTION, &section, allowed);
        assert_eq!(
            messages(&issues),
            vec![
                "items.0.markdown: Field required".to_string(),
                "items.0.quiz: Extra inputs are not permitted".to_string(),
            ]
        );
    }

    #[test]
    fn test_widget_body_errors_are_pathed() {
        let section = json!({
            "title": "T",
            "items": [{"callout": {"tone": "loud", "text": 5}}]
        });
        let issues = Validator::run(&SECTION, &section, KindSet::all());
        assert_eq!(
            messages(&issues),
            vec![
                "items.0.callout.tone: Input should be 'info', 'tip' or 'warning'".to_string(),
                "items.0.callout.text: Input should be a valid string".to_string(),
            ]
        );
    }

    #[test]
    fn test_full_form_item_validates_content() {
        let section = json!({
            "title": "T",
            "items": [{"type": "definition", "content": {"term": "Cell"}}]
        });
        let issues = Validator::run(&SECTION, &section, KindSet::all());
        assert_eq!(
            messages(&issues),
            vec!["items.0.content.meaning: Field required".to_string()]
        );
    }

    #[test]
    fn test_two_widget_keys_is_ambiguous() {
        let section = json!({"title": "T", "items": [{"markdown": "a", "code": {}}]});
        let issues = Validator::run(&SECTION, &section, KindSet::all());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::Ambiguous);
    }

    #[test]
    fn test_quiz_needs_two_options() {
        let section = json!({
            "title": "T",
            "items": [{"quiz": {"question": "?", "options": ["only"], "answer": 0}}]
        });
        let issues = Validator::run(&SECTION, &section, KindSet::all());
        assert_eq!(issues[0].kind, IssueKind::TooFew);
        assert!(!issues[0].is_soft());
    }
}
