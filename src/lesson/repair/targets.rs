//! Error parsing, repair targets and noise collapsing.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::constants::repair::UNRECOGNIZED_CONTENT;
use crate::lesson::path::{JsonPath, Segment};
use crate::lesson::widgets::{ContentKind, ItemForm, KindSet, identify};

static ERROR_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<path>[A-Za-z0-9_$-]+(?:\.[A-Za-z0-9_$-]+)*): (?P<message>.+?)\s*$").ok()
});

/// Generic type-mismatch wording kept when collapsing noise
const TYPE_MISMATCH: &str = "Input should be";

/// One validation error, path relative to the section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedError {
    pub path: JsonPath,
    pub message: String,
}

impl ParsedError {
    pub fn line(&self) -> String {
        if self.path.is_empty() {
            self.message.clone()
        } else {
            format!("{}: {}", self.path, self.message)
        }
    }
}

/// Parse `path: message` lines and strip the `lesson.sections.<n>` wrapper
pub fn parse_errors<S: AsRef<str>>(errors: &[S]) -> Vec<ParsedError> {
    errors
        .iter()
        .map(|line| {
            let line = line.as_ref();
            let (path, message) = ERROR_LINE
                .as_ref()
                .and_then(|re| re.captures(line))
                .and_then(|caps| Some((caps.name("path")?.as_str(), caps.name("message")?.as_str())))
                .unwrap_or(("", line));
            ParsedError {
                path: strip_wrapper(JsonPath::parse(path)),
                message: message.trim().to_string(),
            }
        })
        .collect()
}

fn strip_wrapper(path: JsonPath) -> JsonPath {
    let wrapped = matches!(
        path.segments(),
        [Segment::Key(lesson), Segment::Key(sections), Segment::Index(_), ..]
            if lesson == "lesson" && sections == "sections"
    );
    if wrapped { path.skip(3) } else { path }
}

/// Subsection index named by an error path, if any
pub fn subsection_index(path: &JsonPath) -> Option<usize> {
    match path.segments() {
        [Segment::Key(key), Segment::Index(i), ..] if key == "subsections" => Some(*i),
        _ => None,
    }
}

/// A failing fragment of the section
#[derive(Debug, Clone, PartialEq)]
pub struct RepairTarget {
    pub path: JsonPath,
    pub value: Value,
    pub errors: Vec<String>,
    /// Target is one content item
    pub is_item: bool,
}

/// Granularity rule: errors inside an item belong to the item
fn item_path(path: &JsonPath) -> Option<JsonPath> {
    match path.segments() {
        [Segment::Key(items), Segment::Index(_), ..] if items == "items" => Some(path.truncate(2)),
        [
            Segment::Key(subs),
            Segment::Index(_),
            Segment::Key(items),
            Segment::Index(_),
            ..,
        ] if subs == "subsections" && items == "items" => Some(path.truncate(4)),
        _ => None,
    }
}

/// Map errors onto resolvable targets, one per failing item or field
pub fn extract_targets(payload: &Value, errors: &[ParsedError]) -> Vec<RepairTarget> {
    let mut grouped: BTreeMap<JsonPath, (bool, Vec<String>)> = BTreeMap::new();

    for error in errors {
        let line = error.line();
        if let Some(item) = item_path(&error.path) {
            let entry = grouped.entry(item).or_default();
            entry.0 = true;
            entry.1.push(line);
            continue;
        }

        // Whole-subsection errors expand to its items
        if subsection_index(&error.path).is_some() && error.path.len() == 2 {
            let items_path = error.path.key("items");
            if let Some(items) = items_path.resolve(payload).and_then(Value::as_array)
                && !items.is_empty()
            {
                for i in 0..items.len() {
                    let entry = grouped.entry(items_path.index(i)).or_default();
                    entry.0 = true;
                    entry.1.push(line.clone());
                }
                continue;
            }
        }

        grouped.entry(error.path.clone()).or_default().1.push(line);
    }

    grouped
        .into_iter()
        .filter_map(|(path, (is_item, errors))| {
            let value = path.resolve(payload)?.clone();
            Some(RepairTarget {
                path,
                value,
                errors,
                is_item,
            })
        })
        .collect()
}

/// Collapse the error flood produced when an item matched no variant.
///
/// Above `threshold` errors: a single-key object at `path` keeps only errors
/// whose path below `path` starts with that key, plus generic type
/// mismatches; anything else becomes one summary.
pub fn collapse_noise(
    path: &JsonPath,
    value: &Value,
    errors: Vec<String>,
    threshold: usize,
) -> Vec<String> {
    if errors.len() <= threshold {
        return errors;
    }

    let single_key = value
        .as_object()
        .filter(|obj| obj.len() == 1)
        .and_then(|obj| obj.keys().next());

    let Some(key) = single_key else {
        return vec![UNRECOGNIZED_CONTENT.to_string()];
    };

    let kept: Vec<String> = errors
        .into_iter()
        .filter(|e| mentions_key(e, path, key) || e.contains(TYPE_MISMATCH))
        .collect();
    if kept.is_empty() {
        vec![UNRECOGNIZED_CONTENT.to_string()]
    } else {
        kept
    }
}

fn mentions_key(error: &str, target: &JsonPath, key: &str) -> bool {
    let Some((raw, _)) = error.split_once(": ") else {
        return false;
    };
    JsonPath::parse(raw)
        .strip_prefix(target)
        .is_some_and(|rest| matches!(rest.segments().first(), Some(Segment::Key(k)) if k == key))
}

/// Content kinds the targets are trying to be, limited to `allowed`.
/// Falls back to `allowed` when nothing can be inferred.
pub fn implicated_kinds(targets: &[RepairTarget], allowed: KindSet) -> KindSet {
    let mut kinds = KindSet::empty();
    for target in targets.iter().filter(|t| t.is_item) {
        match identify(&target.value, KindSet::all()) {
            ItemForm::Shorthand(kind) | ItemForm::FullForm(kind) => kinds.insert(kind),
            ItemForm::Unrecognized => {
                if let Some(obj) = target.value.as_object() {
                    for kind in obj.keys().filter_map(|k| ContentKind::parse(k)) {
                        kinds.insert(kind);
                    }
                }
            }
        }
    }

    let narrowed: KindSet = kinds.iter().filter(|k| allowed.contains(*k)).collect();
    if narrowed.is_empty() { allowed } else { narrowed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_parse_strips_wrapper() {
        let parsed = parse_errors(&[
            "lesson.sections.0.items.1.quiz.answer: Input should be a valid integer",
            "something odd",
        ]);
        assert_eq!(parsed[0].path.to_string(), "items.1.quiz.answer");
        assert_eq!(parsed[0].message, "Input should be a valid integer");
        assert!(parsed[1].path.is_empty());
        assert_eq!(parsed[1].line(), "something odd");
    }

    #[test]
    fn test_item_errors_group_per_item() {
        let payload = json!({
            "title": "T",
            "items": [{"markdown": "ok"}, {"quiz": {"question": 1}}],
            "subsections": [{"heading": "H", "items": [{"code": {}}]}]
        });
        let errors = parse_errors(&[
            "items.1.quiz.question: Input should be a valid string",
            "items.1.quiz.options: Field required",
            "subsections.0.items.0.code.language: Field required",
        ]);
        let targets = extract_targets(&payload, &errors);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].path.to_string(), "items.1");
        assert_eq!(targets[0].errors.len(), 2);
        assert!(targets[0].is_item);
        assert_eq!(targets[1].path.to_string(), "subsections.0.items.0");
    }

    #[test]
    fn test_subsection_error_expands_to_items() {
        let payload = json!({
            "title": "T",
            "items": [],
            "subsections": [{"heading": "H", "items": [{"markdown": "a"}, {"markdown": "b"}]}]
        });
        let errors = parse_errors(&["subsections.0: Input should be a valid dictionary"]);
        let targets = extract_targets(&payload, &errors);
        let paths: Vec<String> = targets.iter().map(|t| t.path.to_string()).collect();
        assert_eq!(paths, vec!["subsections.0.items.0", "subsections.0.items.1"]);
    }

    #[test]
    fn test_unresolvable_targets_are_dropped() {
        let payload = json!({"title": "T", "items": []});
        let errors = parse_errors(&["subsections.3.heading: Field required"]);
        assert!(extract_targets(&payload, &errors).is_empty());
    }

    #[test]
    fn test_field_target_keeps_field_path() {
        let payload = json!({"title": 5, "items": []});
        let errors = parse_errors(&["title: Input should be a valid string"]);
        let targets = extract_targets(&payload, &errors);
        assert_eq!(targets.len(), 1);
        assert!(!targets[0].is_item);
        assert_eq!(targets[0].value, json!(5));
    }

    #[test]
    fn test_collapse_keeps_key_and_type_mismatch() {
        let mut errors: Vec<String> = (0..12)
            .map(|i| format!("items.0.kind{}: Field required", i))
            .collect();
        errors.push("items.0.quiz.question: Input should be a valid string".to_string());

        let value = json!({"quiz": {"question": 7}});
        let collapsed = collapse_noise(&JsonPath::parse("items.0"), &value, errors, 8);
        assert!(collapsed.len() <= 2);
        assert!(collapsed.iter().any(|e| e.contains("Input should be a valid string")));
    }

    #[test]
    fn test_collapse_multi_key_object_to_summary() {
        let errors: Vec<String> = (0..10).map(|i| format!("items.0.k{}: Field required", i)).collect();
        let value = json!({"a": 1, "b": 2});
        assert_eq!(
            collapse_noise(&JsonPath::parse("items.0"), &value, errors, 8),
            vec![UNRECOGNIZED_CONTENT.to_string()]
        );
    }

    #[test]
    fn test_collapse_below_threshold_is_untouched() {
        let errors = vec!["items.0.markdown: Field required".to_string()];
        assert_eq!(
            collapse_noise(&JsonPath::parse("items.0"), &json!({}), errors.clone(), 8),
            errors
        );
    }

    #[test]
    fn test_collapse_ignores_container_segments_matching_key() {
        // A misplaced subsection body sitting in an item slot
        let target = JsonPath::parse("subsections.0.items.0");
        let value = json!({"items": [{"markdown": "stray"}]});
        let mut errors: Vec<String> = ContentKind::ALL
            .iter()
            .map(|kind| format!("subsections.0.items.0.{}: Field required", kind.as_str()))
            .collect();
        errors.push("subsections.0.items.0.items: Extra inputs are not permitted".to_string());

        let collapsed = collapse_noise(&target, &value, errors, 8);
        assert_eq!(
            collapsed,
            vec!["subsections.0.items.0.items: Extra inputs are not permitted".to_string()]
        );
    }

    #[test]
    fn test_collapse_keeps_type_mismatch_not_naming_key() {
        let target = JsonPath::parse("items.2");
        let mut errors: Vec<String> = (0..10)
            .map(|i| format!("items.2.variant{}: Field required", i))
            .collect();
        errors.push("items.2: Input should be string".to_string());

        let collapsed = collapse_noise(&target, &json!({"callout": 3}), errors, 8);
        assert_eq!(collapsed, vec!["items.2: Input should be string".to_string()]);
    }

    #[test]
    fn test_implicated_kinds() {
        let allowed = KindSet::all();
        let targets = vec![
            RepairTarget {
                path: JsonPath::parse("items.0"),
                value: json!({"quiz": {}}),
                errors: vec![],
                is_item: true,
            },
            RepairTarget {
                path: JsonPath::parse("items.1"),
                value: json!({"type": "code", "content": {}}),
                errors: vec![],
                is_item: true,
            },
        ];
        let kinds = implicated_kinds(&targets, allowed);
        assert_eq!(kinds.len(), 2);
        assert!(kinds.contains(ContentKind::Quiz) && kinds.contains(ContentKind::Code));

        let unknown = vec![RepairTarget {
            path: JsonPath::parse("items.0"),
            value: json!({"video": 1}),
            errors: vec![],
            is_item: true,
        }];
        assert_eq!(implicated_kinds(&unknown, allowed), allowed);
    }

    proptest! {
        #[test]
        fn prop_collapse_never_grows(extra in 0usize..40, key in "[a-z]{1,8}") {
            let errors: Vec<String> = (0..extra)
                .map(|i| format!("items.0.v{}: Field required", i))
                .collect();
            let value = json!({ key: {} });
            let collapsed = collapse_noise(&JsonPath::parse("items.0"), &value, errors.clone(), 8);
            prop_assert!(!collapsed.is_empty() || errors.is_empty());
            prop_assert!(collapsed.len() <= errors.len().max(1));
        }
    }
}
