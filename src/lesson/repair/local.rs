//! Deterministic structural fixes applied before any model call.

use serde_json::{Map, Value, json};
use std::collections::BTreeSet;

use super::targets::{ParsedError, subsection_index};
use crate::constants::document::{HEADING_KEY, LEGACY_HEADING_KEYS};
use crate::lesson::types::SectionDraft;

/// Apply local fallbacks in place; returns one tag per alteration
pub fn apply(payload: &mut Value, errors: &[ParsedError], draft: &SectionDraft) -> Vec<String> {
    let mut tags = Vec::new();
    let Some(section) = payload.as_object_mut() else {
        return tags;
    };

    fill_title(section, draft, &mut tags);

    if errors.iter().any(|e| e.path.to_string() == "items") {
        coerce_items(section, "items", &mut tags);
    }

    let mut touched: BTreeSet<usize> = errors
        .iter()
        .filter_map(|e| subsection_index(&e.path))
        .collect();
    touched.extend(move_misplaced_subsections(section, &mut tags));

    if let Some(Value::Array(subsections)) = section.get_mut("subsections") {
        for index in touched {
            if let Some(Value::Object(sub)) = subsections.get_mut(index) {
                normalize_subsection(index, sub, draft, &mut tags);
            }
        }
    }
    tags
}

fn fill_title(section: &mut Map<String, Value>, draft: &SectionDraft, tags: &mut Vec<String>) {
    let present = section
        .get("title")
        .and_then(Value::as_str)
        .is_some_and(|t| !t.trim().is_empty());
    if !present && !draft.title.trim().is_empty() {
        section.insert("title".into(), json!(draft.title));
        tags.push("title:filled_from_plan".into());
    }
}

fn heading_like(obj: &Map<String, Value>) -> bool {
    std::iter::once(HEADING_KEY)
        .chain(LEGACY_HEADING_KEYS.iter().copied())
        .any(|k| obj.get(k).is_some_and(Value::is_string))
}

/// An item with a title-like key and its own `items` list is a subsection
fn is_subsection_shaped(item: &Value) -> bool {
    item.as_object()
        .is_some_and(|obj| heading_like(obj) && obj.get("items").is_some_and(Value::is_array))
}

/// Move subsection-shaped entries out of `items`; returns their new indices
fn move_misplaced_subsections(section: &mut Map<String, Value>, tags: &mut Vec<String>) -> Vec<usize> {
    let Some(Value::Array(items)) = section.get_mut("items") else {
        return Vec::new();
    };
    if !items.iter().any(is_subsection_shaped) {
        return Vec::new();
    }

    let mut moved = Vec::new();
    let mut kept = Vec::with_capacity(items.len());
    for (i, item) in std::mem::take(items).into_iter().enumerate() {
        if is_subsection_shaped(&item) {
            tags.push(format!("items.{}:moved_to_subsections", i));
            moved.push(item);
        } else {
            kept.push(item);
        }
    }
    *items = kept;

    let subsections = section
        .entry("subsections")
        .or_insert_with(|| Value::Array(Vec::new()));
    match subsections {
        Value::Array(_) => {}
        Value::Object(_) => {
            let single = std::mem::take(subsections);
            *subsections = Value::Array(vec![single]);
            tags.push("subsections:wrapped_object".into());
        }
        _ => *subsections = Value::Array(Vec::new()),
    }

    let Value::Array(list) = subsections else {
        return Vec::new();
    };
    let start = list.len();
    list.extend(moved);
    (start..list.len()).collect()
}

fn normalize_subsection(
    index: usize,
    sub: &mut Map<String, Value>,
    draft: &SectionDraft,
    tags: &mut Vec<String>,
) {
    let has_heading = sub
        .get(HEADING_KEY)
        .and_then(Value::as_str)
        .is_some_and(|h| !h.trim().is_empty());

    if !has_heading {
        let legacy = LEGACY_HEADING_KEYS.iter().find_map(|key| {
            sub.get(*key)
                .and_then(Value::as_str)
                .filter(|v| !v.trim().is_empty())
                .map(|v| (*key, v.to_string()))
        });
        match legacy {
            Some((key, heading)) => {
                sub.insert(HEADING_KEY.into(), json!(heading));
                tags.push(format!("subsections.{}.heading:migrated_from_{}", index, key));
            }
            None => {
                if let Some(planned) = draft.plan.subsections.get(index) {
                    sub.insert(HEADING_KEY.into(), json!(planned.title));
                    tags.push(format!("subsections.{}.heading:filled_from_plan", index));
                }
            }
        }
    }

    if sub.get(HEADING_KEY).is_some_and(Value::is_string) {
        for key in LEGACY_HEADING_KEYS.iter().copied() {
            if sub.remove(key).is_some() {
                tags.push(format!("subsections.{}.{}:dropped_alias", index, key));
            }
        }
    }

    let before = tags.len();
    coerce_items(sub, "items", tags);
    for tag in tags.iter_mut().skip(before) {
        *tag = format!("subsections.{}.{}", index, tag);
    }
}

/// Make `obj[key]` a list: wrap objects, parse JSON-looking strings, fall
/// back to a single markdown item
fn coerce_items(obj: &mut Map<String, Value>, key: &str, tags: &mut Vec<String>) {
    let current = obj.remove(key).unwrap_or(Value::Null);
    let (items, tag) = match current {
        Value::Array(list) => (list, None),
        Value::Null => (Vec::new(), Some("defaulted_empty")),
        Value::Object(map) => (vec![Value::Object(map)], Some("wrapped_object")),
        Value::String(text) => match parse_embedded(&text) {
            Some(Value::Array(list)) => (list, Some("parsed_json")),
            Some(object @ Value::Object(_)) => (vec![object], Some("parsed_json")),
            _ if text.trim().is_empty() => (Vec::new(), Some("defaulted_empty")),
            _ => (vec![json!({"markdown": text})], Some("wrapped_markdown")),
        },
        scalar => (vec![json!({"markdown": scalar.to_string()})], Some("wrapped_markdown")),
    };
    obj.insert(key.to_string(), Value::Array(items));
    if let Some(tag) = tag {
        tags.push(format!("{}:{}", key, tag));
    }
}

fn parse_embedded(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if !(trimmed.starts_with('[') || trimmed.starts_with('{')) {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lesson::repair::targets::parse_errors;
    use crate::lesson::types::{PlanSection, PlanSubsection};

    fn draft() -> SectionDraft {
        SectionDraft::from(&PlanSection {
            number: 1,
            title: "Moon".into(),
            subsections: vec![PlanSubsection {
                title: "Gravity".into(),
                planned_widgets: vec![],
            }],
            goals: String::new(),
            continuity_note: String::new(),
            data_collection_points: vec![],
        })
    }

    #[test]
    fn test_legacy_title_migrates_to_heading() {
        let mut payload = json!({
            "title": "Moon",
            "items": [],
            "subsections": [{"title": "Pull", "items": []}]
        });
        let errors = parse_errors(&[
            "lesson.sections.0.subsections.0.heading: Field required",
            "lesson.sections.0.subsections.0.title: Extra inputs are not permitted",
        ]);
        let tags = apply(&mut payload, &errors, &draft());

        assert_eq!(payload["subsections"][0], json!({"heading": "Pull", "items": []}));
        assert!(tags.contains(&"subsections.0.heading:migrated_from_title".to_string()));
        assert!(tags.contains(&"subsections.0.title:dropped_alias".to_string()));
    }

    #[test]
    fn test_missing_heading_filled_from_plan() {
        let mut payload = json!({"title": "Moon", "items": [], "subsections": [{"items": []}]});
        let errors = parse_errors(&["subsections.0.heading: Field required"]);
        let tags = apply(&mut payload, &errors, &draft());
        assert_eq!(payload["subsections"][0]["heading"], "Gravity");
        assert_eq!(tags, vec!["subsections.0.heading:filled_from_plan"]);
    }

    #[test]
    fn test_misplaced_subsection_moves() {
        let mut payload = json!({
            "title": "Moon",
            "items": [
                {"markdown": "intro"},
                {"subsection_title": "Orbit", "items": [{"markdown": "x"}]}
            ]
        });
        let tags = apply(&mut payload, &[], &draft());

        assert_eq!(payload["items"], json!([{"markdown": "intro"}]));
        assert_eq!(
            payload["subsections"],
            json!([{"heading": "Orbit", "items": [{"markdown": "x"}]}])
        );
        assert_eq!(tags[0], "items.1:moved_to_subsections");
    }

    #[test]
    fn test_items_coercion() {
        let mut payload = json!({
            "title": "Moon",
            "items": [],
            "subsections": [
                {"heading": "A", "items": "plain words"},
                {"heading": "B", "items": "[{\"markdown\": \"parsed\"}]"},
                {"heading": "C"}
            ]
        });
        let errors = parse_errors(&[
            "subsections.0.items: Input should be a valid list",
            "subsections.1.items: Input should be a valid list",
            "subsections.2.items: Field required",
        ]);
        let tags = apply(&mut payload, &errors, &draft());

        assert_eq!(payload["subsections"][0]["items"], json!([{"markdown": "plain words"}]));
        assert_eq!(payload["subsections"][1]["items"], json!([{"markdown": "parsed"}]));
        assert_eq!(payload["subsections"][2]["items"], json!([]));
        assert!(tags.contains(&"subsections.0.items:wrapped_markdown".to_string()));
        assert!(tags.contains(&"subsections.1.items:parsed_json".to_string()));
        assert!(tags.contains(&"subsections.2.items:defaulted_empty".to_string()));
    }

    #[test]
    fn test_missing_title_filled_from_draft() {
        let mut payload = json!({"items": []});
        let tags = apply(&mut payload, &parse_errors(&["title: Field required"]), &draft());
        assert_eq!(payload["title"], "Moon");
        assert_eq!(tags, vec!["title:filled_from_plan"]);
    }

    #[test]
    fn test_untouched_subsections_are_left_alone() {
        let mut payload = json!({
            "title": "Moon",
            "items": [],
            "subsections": [{"title": "Old", "items": []}]
        });
        let tags = apply(&mut payload, &[], &draft());
        assert!(tags.is_empty());
        assert_eq!(payload["subsections"][0]["title"], "Old");
    }

    #[test]
    fn test_non_object_payload_is_ignored() {
        let mut payload = json!("text");
        assert!(apply(&mut payload, &[], &draft()).is_empty());
    }
}
