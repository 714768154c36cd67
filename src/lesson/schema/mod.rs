//! Schema Validation & Sanitization Service
//!
//! Single authority for whether a JSON value is a valid lesson or section,
//! and for the schemas handed to structured-generation calls.

mod sanitize;
pub mod shape;
mod validate;

pub use sanitize::sanitize_for_provider;
pub use validate::{EXTRA_FORBIDDEN, FIELD_REQUIRED, Issue, IssueKind, Validator};

use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use self::shape::{DOCUMENT, SECTION};
use super::types::LessonDocument;
use super::widgets::{KindSet, WidgetRegistry};
use crate::constants::document as limits;

/// Outcome of full-document validation
#[derive(Debug, Clone)]
pub struct DocumentValidation {
    pub ok: bool,
    pub issues: Vec<Issue>,
    /// Typed model, present whenever the document is acceptable
    pub parsed: Option<LessonDocument>,
}

impl DocumentValidation {
    /// Strictly valid, or only length/count overruns
    pub fn is_acceptable(&self) -> bool {
        self.ok || self.issues.iter().all(Issue::is_soft)
    }

    pub fn error_strings(&self) -> Vec<String> {
        self.issues.iter().map(ToString::to_string).collect()
    }
}

/// Outcome of section validation
#[derive(Debug, Clone, Default)]
pub struct SectionValidation {
    pub ok: bool,
    /// Blocking errors as `path: message`, document-wrapper prefix included
    pub errors: Vec<String>,
    /// Overruns accepted by a soft pass
    pub soft_issues: Vec<String>,
    /// The accepted payload
    pub payload: Option<Value>,
}

/// Validation and schema construction over one [`WidgetRegistry`]
pub struct SchemaService {
    registry: Arc<WidgetRegistry>,
    widget_cache: DashMap<KindSet, Value>,
    section_cache: DashMap<KindSet, Value>,
}

impl SchemaService {
    pub fn new(registry: Arc<WidgetRegistry>) -> Self {
        Self {
            registry,
            widget_cache: DashMap::new(),
            section_cache: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &WidgetRegistry {
        &self.registry
    }

    // =========================================================================
    // Validation
    // =========================================================================

    pub fn validate_document(&self, payload: &Value, allowed: KindSet) -> DocumentValidation {
        let issues = Validator::run(&DOCUMENT, payload, allowed);
        let ok = issues.is_empty();
        let parsed = if ok || issues.iter().all(Issue::is_soft) {
            serde_json::from_value::<LessonDocument>(payload.clone())
                .map_err(|e| debug!("Typed document parse failed: {}", e))
                .ok()
        } else {
            None
        };
        DocumentValidation { ok, issues, parsed }
    }

    /// Validate one section by wrapping it as a one-section document.
    ///
    /// A section whose only issues are maximum-length or maximum-count
    /// overruns passes softly: it is accepted and the overruns are returned
    /// in `soft_issues`.
    pub fn validate_section(
        &self,
        payload: &Value,
        topic: &str,
        index: u32,
        allowed: KindSet,
    ) -> SectionValidation {
        let title: String = topic.trim().chars().take(limits::MAX_LESSON_TITLE).collect();
        let title = if title.is_empty() { "Lesson".to_string() } else { title };
        let wrapped = json!({"lesson": {"title": title, "sections": [payload]}});

        let issues = Validator::run(&DOCUMENT, &wrapped, allowed);
        if issues.is_empty() {
            return SectionValidation {
                ok: true,
                payload: Some(payload.clone()),
                ..Default::default()
            };
        }

        let strings: Vec<String> = issues.iter().map(ToString::to_string).collect();
        if issues.iter().all(Issue::is_soft) {
            warn!(
                "Section {} accepted with {} length/count overrun(s): {}",
                index,
                strings.len(),
                strings.join("; ")
            );
            return SectionValidation {
                ok: true,
                errors: Vec::new(),
                soft_issues: strings,
                payload: Some(payload.clone()),
            };
        }

        debug!("Section {} failed validation with {} issue(s)", index, strings.len());
        SectionValidation {
            ok: false,
            errors: strings,
            soft_issues: Vec::new(),
            payload: None,
        }
    }

    // =========================================================================
    // Schema Builders
    // =========================================================================

    /// Provider-ready union container accepting only `kinds`
    pub fn widget_schema(&self, kinds: KindSet) -> Value {
        self.widget_cache
            .entry(kinds)
            .or_insert_with(|| sanitize_for_provider(&self.registry.union_schema(kinds)))
            .clone()
    }

    /// Provider-ready schema for one section whose items are limited to `kinds`
    pub fn section_schema(&self, kinds: KindSet) -> Value {
        self.section_cache
            .entry(kinds)
            .or_insert_with(|| {
                let mut schema = SECTION.to_schema();
                schema["$defs"] = json!({"ContentItem": self.registry.union_schema(kinds)});
                sanitize_for_provider(&schema)
            })
            .clone()
    }

    pub fn plan_schema(&self) -> Value {
        let text = |max: usize| json!({"type": "string", "maxLength": max});
        let subsection = json!({
            "type": "object",
            "properties": {
                "title": text(limits::MAX_SECTION_TITLE),
                "planned_widgets": {"type": "array", "items": {"type": "string"}},
            },
            "required": ["title", "planned_widgets"],
            "additionalProperties": false,
        });
        let section = json!({
            "type": "object",
            "properties": {
                "number": {"type": "integer"},
                "title": text(limits::MAX_SECTION_TITLE),
                "subsections": {"type": "array", "items": subsection, "maxItems": limits::MAX_SUBSECTIONS},
                "goals": {"type": "string"},
                "continuity_note": {"type": "string"},
                "data_collection_points": {"type": "array", "items": {"type": "string"}},
            },
            "required": ["number", "title", "subsections", "goals", "continuity_note", "data_collection_points"],
            "additionalProperties": false,
        });
        json!({
            "type": "object",
            "properties": {
                "title": text(limits::MAX_LESSON_TITLE),
                "sections": {"type": "array", "items": section, "maxItems": limits::MAX_SECTIONS},
            },
            "required": ["title", "sections"],
            "additionalProperties": false,
        })
    }

    /// Patch list restricted to known target paths
    pub fn patch_schema(&self, paths: &[String], value_schema: Value) -> Value {
        json!({
            "type": "object",
            "properties": {
                "patches": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "path": {"type": "string", "enum": paths},
                            "value": value_schema,
                        },
                        "required": ["path", "value"],
                        "additionalProperties": false,
                    },
                },
            },
            "required": ["patches"],
            "additionalProperties": false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> SchemaService {
        SchemaService::new(Arc::new(WidgetRegistry::builtin()))
    }

    #[test]
    fn test_valid_section_passes() {
        let section = json!({"title": "Moon", "items": [{"markdown": "Gravity."}]});
        let result = service().validate_section(&section, "Tides", 1, KindSet::all());
        assert!(result.ok);
        assert!(result.errors.is_empty());
        assert_eq!(result.payload, Some(section));
    }

    #[test]
    fn test_structural_error_keeps_wrapper_prefix() {
        let section = json!({"title": "Moon", "items": [{"markdown": 3}]});
        let result = service().validate_section(&section, "Tides", 1, KindSet::all());
        assert!(!result.ok);
        assert_eq!(
            result.errors,
            vec!["lesson.sections.0.items.0.markdown: Input should be a valid string"]
        );
        assert!(result.payload.is_none());
    }

    #[test]
    fn test_overlong_only_is_soft_pass() {
        let section = json!({"title": "m".repeat(130), "items": [{"markdown": "x"}]});
        let result = service().validate_section(&section, "Tides", 2, KindSet::all());
        assert!(result.ok);
        assert!(result.errors.is_empty());
        assert_eq!(result.soft_issues.len(), 1);
        assert!(result.payload.is_some());
    }

    #[test]
    fn test_soft_and_structural_mix_fails() {
        let section = json!({"title": "m".repeat(130), "items": "oops"});
        let result = service().validate_section(&section, "Tides", 1, KindSet::all());
        assert!(!result.ok);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_validation_is_idempotent() {
        let svc = service();
        let section = json!({"title": "T", "items": [{"video": 1}]});
        let first = svc.validate_section(&section, "Tides", 1, KindSet::all());
        let second = svc.validate_section(&section, "Tides", 1, KindSet::all());
        assert_eq!(first.errors, second.errors);
    }

    #[test]
    fn test_empty_topic_still_wraps() {
        let section = json!({"title": "Moon", "items": []});
        assert!(service().validate_section(&section, "  ", 1, KindSet::all()).ok);
    }

    #[test]
    fn test_validate_document_parses_typed_model() {
        let doc = json!({
            "lesson": {
                "title": "Tides",
                "sections": [{"title": "Moon", "items": [{"definition": {"term": "Tide", "meaning": "Sea level change"}}]}]
            }
        });
        let result = service().validate_document(&doc, KindSet::all());
        assert!(result.ok);
        let parsed = result.parsed.unwrap();
        assert_eq!(parsed.lesson.sections[0].items.len(), 1);
    }

    #[test]
    fn test_validate_document_reports_paths() {
        let doc = json!({"lesson": {"sections": []}});
        let result = service().validate_document(&doc, KindSet::all());
        assert!(!result.is_acceptable());
        assert_eq!(result.error_strings(), vec!["lesson.title: Field required"]);
        assert!(result.parsed.is_none());
    }

    #[test]
    fn test_widget_schema_only_allows_requested_kinds() {
        let svc = service();
        let kinds = KindSet::parse_names(&["quiz", "code"]).unwrap();
        let schema = svc.widget_schema(kinds);
        let props = schema["properties"].as_object().unwrap();
        assert_eq!(props.len(), 2);
        assert!(props.contains_key("quiz") && props.contains_key("code"));
        assert_eq!(schema["maxProperties"], 1);
        assert_eq!(svc.widget_schema(kinds), schema);
        assert_eq!(svc.widget_cache.len(), 1);
    }

    #[test]
    fn test_section_schema_is_inlined() {
        let schema = service().section_schema(KindSet::all());
        let rendered = schema.to_string();
        assert!(!rendered.contains("$ref"));
        assert!(!rendered.contains("minLength"));
        assert_eq!(schema["properties"]["items"]["items"]["maxProperties"], 1);
        assert_eq!(
            schema["properties"]["subsections"]["type"],
            json!(["array", "null"])
        );
    }

    #[test]
    fn test_patch_schema_enumerates_paths() {
        let paths = vec!["items.0".to_string(), "items.2".to_string()];
        let schema = service().patch_schema(&paths, json!({}));
        assert_eq!(
            schema["properties"]["patches"]["items"]["properties"]["path"]["enum"],
            json!(["items.0", "items.2"])
        );
    }
}
