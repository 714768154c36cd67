//! Content Widgets
//!
//! The closed set of content kinds a lesson item may take, their body shapes,
//! and the typed [`Widget`] model.
//!
//! ## Wire forms
//!
//! - **Shorthand** (canonical): `{"quiz": {...}}`, a single key naming the kind
//! - **Full form**: `{"type": "quiz", "content": {...}, "id"?: .., "meta"?: ..}`
//!
//! Both validate; the stitcher rewrites full form to shorthand when no `id`
//! or `meta` would be lost.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt;

use super::schema::shape::{Field, Shape};

// =============================================================================
// Content Kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Markdown,
    Callout,
    Quiz,
    Flashcards,
    Table,
    Code,
    Definition,
    Timeline,
    FillBlank,
}

impl ContentKind {
    pub const ALL: [ContentKind; 9] = [
        Self::Markdown,
        Self::Callout,
        Self::Quiz,
        Self::Flashcards,
        Self::Table,
        Self::Code,
        Self::Definition,
        Self::Timeline,
        Self::FillBlank,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Callout => "callout",
            Self::Quiz => "quiz",
            Self::Flashcards => "flashcards",
            Self::Table => "table",
            Self::Code => "code",
            Self::Definition => "definition",
            Self::Timeline => "timeline",
            Self::FillBlank => "fill_blank",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    fn bit(&self) -> u16 {
        1 << (*self as u16)
    }

    /// Shape of the widget body (the value under the kind key)
    pub fn body_shape(&self) -> &'static Shape {
        match self {
            Self::Markdown => &MARKDOWN_BODY,
            Self::Callout => &CALLOUT_BODY,
            Self::Quiz => &QUIZ_BODY,
            Self::Flashcards => &FLASHCARDS_BODY,
            Self::Table => &TABLE_BODY,
            Self::Code => &CODE_BODY,
            Self::Definition => &DEFINITION_BODY,
            Self::Timeline => &TIMELINE_BODY,
            Self::FillBlank => &FILL_BLANK_BODY,
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::Markdown => "prose in Markdown",
            Self::Callout => "highlighted note with tone info|tip|warning",
            Self::Quiz => "multiple choice question with 2-6 options and a 0-based answer index",
            Self::Flashcards => "front/back recall cards",
            Self::Table => "headers plus rows of cells",
            Self::Code => "source snippet with its language",
            Self::Definition => "term and its meaning",
            Self::Timeline => "ordered events (when/what)",
            Self::FillBlank => "sentence with ___ blanks and accepted answers",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Body Shapes
// =============================================================================

const MARKDOWN_BODY: Shape = Shape::Text { max_len: 4000 };

const CALLOUT_BODY: Shape = Shape::Record(&[
    Field {
        name: "tone",
        shape: Shape::OneOf(&["info", "tip", "warning"]),
        required: true,
    },
    Field {
        name: "text",
        shape: Shape::Text { max_len: 600 },
        required: true,
    },
]);

const QUIZ_OPTION: Shape = Shape::Text { max_len: 200 };

const QUIZ_BODY: Shape = Shape::Record(&[
    Field {
        name: "question",
        shape: Shape::Text { max_len: 300 },
        required: true,
    },
    Field {
        name: "options",
        shape: Shape::List {
            item: &QUIZ_OPTION,
            min_items: 2,
            max_items: 6,
        },
        required: true,
    },
    Field {
        name: "answer",
        shape: Shape::Integer,
        required: true,
    },
    Field {
        name: "explanation",
        shape: Shape::Text { max_len: 600 },
        required: false,
    },
]);

const CARD: Shape = Shape::Record(&[
    Field {
        name: "front",
        shape: Shape::Text { max_len: 200 },
        required: true,
    },
    Field {
        name: "back",
        shape: Shape::Text { max_len: 400 },
        required: true,
    },
]);

const FLASHCARDS_BODY: Shape = Shape::Record(&[Field {
    name: "cards",
    shape: Shape::List {
        item: &CARD,
        min_items: 1,
        max_items: 20,
    },
    required: true,
}]);

const TABLE_HEADER: Shape = Shape::Text { max_len: 80 };
const TABLE_CELL: Shape = Shape::Text { max_len: 200 };
const TABLE_ROW: Shape = Shape::List {
    item: &TABLE_CELL,
    min_items: 0,
    max_items: 8,
};

const TABLE_BODY: Shape = Shape::Record(&[
    Field {
        name: "headers",
        shape: Shape::List {
            item: &TABLE_HEADER,
            min_items: 1,
            max_items: 8,
        },
        required: true,
    },
    Field {
        name: "rows",
        shape: Shape::List {
            item: &TABLE_ROW,
            min_items: 0,
            max_items: 30,
        },
        required: true,
    },
]);

const CODE_BODY: Shape = Shape::Record(&[
    Field {
        name: "language",
        shape: Shape::Text { max_len: 40 },
        required: true,
    },
    Field {
        name: "source",
        shape: Shape::Text { max_len: 4000 },
        required: true,
    },
]);

const DEFINITION_BODY: Shape = Shape::Record(&[
    Field {
        name: "term",
        shape: Shape::Text { max_len: 120 },
        required: true,
    },
    Field {
        name: "meaning",
        shape: Shape::Text { max_len: 600 },
        required: true,
    },
]);

const EVENT: Shape = Shape::Record(&[
    Field {
        name: "when",
        shape: Shape::Text { max_len: 60 },
        required: true,
    },
    Field {
        name: "what",
        shape: Shape::Text { max_len: 300 },
        required: true,
    },
]);

const TIMELINE_BODY: Shape = Shape::Record(&[Field {
    name: "events",
    shape: Shape::List {
        item: &EVENT,
        min_items: 1,
        max_items: 20,
    },
    required: true,
}]);

const FILL_ANSWER: Shape = Shape::Text { max_len: 80 };

const FILL_BLANK_BODY: Shape = Shape::Record(&[
    Field {
        name: "prompt",
        shape: Shape::Text { max_len: 300 },
        required: true,
    },
    Field {
        name: "answers",
        shape: Shape::List {
            item: &FILL_ANSWER,
            min_items: 1,
            max_items: 6,
        },
        required: true,
    },
]);

// =============================================================================
// Kind Sets
// =============================================================================

/// Set of content kinds, stored as a bitset
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "Vec<ContentKind>", from = "Vec<ContentKind>")]
pub struct KindSet(u16);

impl KindSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        ContentKind::ALL.into_iter().collect()
    }

    pub fn insert(&mut self, kind: ContentKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(&self, kind: ContentKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = ContentKind> + '_ {
        ContentKind::ALL.into_iter().filter(|k| self.contains(*k))
    }

    /// Parse kind names; unknown names are returned as the error
    pub fn parse_names<S: AsRef<str>>(names: &[S]) -> Result<Self, Vec<String>> {
        let mut set = Self::empty();
        let mut unknown = Vec::new();
        for name in names {
            match ContentKind::parse(name.as_ref().trim()) {
                Some(kind) => set.insert(kind),
                None => unknown.push(name.as_ref().to_string()),
            }
        }
        if unknown.is_empty() { Ok(set) } else { Err(unknown) }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.iter().map(|k| k.as_str()).collect()
    }
}

impl fmt::Debug for KindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

impl FromIterator<ContentKind> for KindSet {
    fn from_iter<I: IntoIterator<Item = ContentKind>>(iter: I) -> Self {
        let mut set = Self::empty();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

impl From<Vec<ContentKind>> for KindSet {
    fn from(kinds: Vec<ContentKind>) -> Self {
        kinds.into_iter().collect()
    }
}

impl From<KindSet> for Vec<ContentKind> {
    fn from(set: KindSet) -> Self {
        set.iter().collect()
    }
}

// =============================================================================
// Item Forms
// =============================================================================

/// How a content item identifies its kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemForm {
    Shorthand(ContentKind),
    FullForm(ContentKind),
    Unrecognized,
}

const FULL_FORM_KEYS: [&str; 4] = ["type", "content", "id", "meta"];

/// Identify an item's form. Kinds outside `allowed` are unrecognized.
pub fn identify(item: &Value, allowed: KindSet) -> ItemForm {
    let Some(obj) = item.as_object() else {
        return ItemForm::Unrecognized;
    };

    if let Some(kind) = obj
        .get("type")
        .and_then(Value::as_str)
        .and_then(ContentKind::parse)
        && allowed.contains(kind)
        && obj.keys().all(|k| FULL_FORM_KEYS.contains(&k.as_str()))
    {
        return ItemForm::FullForm(kind);
    }

    if obj.len() == 1
        && let Some(kind) = obj.keys().next().and_then(|k| ContentKind::parse(k))
        && allowed.contains(kind)
    {
        return ItemForm::Shorthand(kind);
    }

    ItemForm::Unrecognized
}

/// Rewrite a full-form item as shorthand when nothing would be lost.
///
/// Returns `None` for shorthand items, unrecognized items and full-form items
/// carrying an `id` or non-empty `meta`.
pub fn to_shorthand(item: &Value) -> Option<Value> {
    let ItemForm::FullForm(kind) = identify(item, KindSet::all()) else {
        return None;
    };
    let obj = item.as_object()?;

    let carries = |key: &str| match obj.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::Object(m)) => !m.is_empty(),
        Some(_) => true,
    };
    if carries("id") || carries("meta") {
        return None;
    }

    let body = obj.get("content")?.clone();
    let mut out = Map::new();
    out.insert(kind.as_str().to_string(), body);
    Some(Value::Object(out))
}

// =============================================================================
// Typed Widget Model
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callout {
    pub tone: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quiz {
    pub question: String,
    pub options: Vec<String>,
    pub answer: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub front: String,
    pub back: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flashcards {
    pub cards: Vec<Card>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub language: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    pub term: String,
    pub meaning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub when: String,
    pub what: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillBlank {
    pub prompt: String,
    pub answers: Vec<String>,
}

/// One content item; serializes to the shorthand wire form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Widget {
    Markdown(String),
    Callout(Callout),
    Quiz(Quiz),
    Flashcards(Flashcards),
    Table(Table),
    Code(Code),
    Definition(Definition),
    Timeline(Timeline),
    FillBlank(FillBlank),
}

impl Widget {
    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Markdown(_) => ContentKind::Markdown,
            Self::Callout(_) => ContentKind::Callout,
            Self::Quiz(_) => ContentKind::Quiz,
            Self::Flashcards(_) => ContentKind::Flashcards,
            Self::Table(_) => ContentKind::Table,
            Self::Code(_) => ContentKind::Code,
            Self::Definition(_) => ContentKind::Definition,
            Self::Timeline(_) => ContentKind::Timeline,
            Self::FillBlank(_) => ContentKind::FillBlank,
        }
    }

    /// Parse either wire form
    pub fn from_item(item: &Value) -> Result<Self, serde_json::Error> {
        match identify(item, KindSet::all()) {
            ItemForm::FullForm(kind) => {
                let body = item.get("content").cloned().unwrap_or(Value::Null);
                serde_json::from_value(json!({ kind.as_str(): body }))
            }
            _ => serde_json::from_value(item.clone()),
        }
    }
}

// =============================================================================
// Widget Registry
// =============================================================================

/// Load-once registry of widget variant schemas and side-job hints.
///
/// Variant schemas are rendered once at construction; [`union_schema`]
/// filters that precomputed set. Nothing is mutated after construction.
///
/// [`union_schema`]: WidgetRegistry::union_schema
#[derive(Debug, Clone)]
pub struct WidgetRegistry {
    variants: BTreeMap<ContentKind, Value>,
    side_jobs: BTreeMap<String, String>,
}

impl Default for WidgetRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl WidgetRegistry {
    pub fn builtin() -> Self {
        let variants = ContentKind::ALL
            .iter()
            .map(|kind| {
                let schema = json!({
                    "title": kind.as_str(),
                    "type": "object",
                    "properties": { kind.as_str(): kind.body_shape().to_schema() },
                    "required": [kind.as_str()],
                    "additionalProperties": false,
                });
                (*kind, schema)
            })
            .collect();

        let side_jobs = [
            ("audio_coach", "audio_coach"),
            ("narration", "audio_coach"),
            ("illustration", "illustrator"),
            ("image", "illustrator"),
            ("diagram", "illustrator"),
        ]
        .into_iter()
        .map(|(hint, agent)| (hint.to_string(), agent.to_string()))
        .collect();

        Self {
            variants,
            side_jobs,
        }
    }

    /// Add or replace a planned-widget hint that fans out to a side job
    pub fn with_side_job(mut self, hint: &str, agent: &str) -> Self {
        self.side_jobs.insert(hint.to_string(), agent.to_string());
        self
    }

    /// Child agent responsible for a planned-widget hint, if any
    pub fn side_job_agent(&self, hint: &str) -> Option<&str> {
        self.side_jobs.get(hint).map(String::as_str)
    }

    pub fn variant_schema(&self, kind: ContentKind) -> Option<&Value> {
        self.variants.get(&kind)
    }

    /// `anyOf` over the variants in `kinds`
    pub fn union_schema(&self, kinds: KindSet) -> Value {
        let members: Vec<Value> = kinds
            .iter()
            .filter_map(|k| self.variants.get(&k).cloned())
            .collect();
        json!({ "anyOf": members })
    }

    /// One line per kind, for prompts
    pub fn describe(&self, kinds: KindSet) -> String {
        kinds
            .iter()
            .map(|k| format!("- {}: {}", k.as_str(), k.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_roundtrip() {
        for kind in ContentKind::ALL {
            assert_eq!(ContentKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ContentKind::parse("video"), None);
    }

    #[test]
    fn test_kind_set_parse_names() {
        let set = KindSet::parse_names(&["quiz", "markdown"]).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(ContentKind::Quiz));
        assert!(!set.contains(ContentKind::Table));
        assert_eq!(set.names(), vec!["markdown", "quiz"]);

        let err = KindSet::parse_names(&["quiz", "hologram"]).unwrap_err();
        assert_eq!(err, vec!["hologram".to_string()]);
    }

    #[test]
    fn test_kind_set_serde_as_list() {
        let set: KindSet = [ContentKind::Code, ContentKind::Callout].into_iter().collect();
        let json = serde_json::to_value(set).unwrap();
        assert_eq!(json, json!(["callout", "code"]));
        let back: KindSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_identify_forms() {
        let all = KindSet::all();
        assert_eq!(
            identify(&json!({"markdown": "hi"}), all),
            ItemForm::Shorthand(ContentKind::Markdown)
        );
        assert_eq!(
            identify(&json!({"type": "code", "content": {}}), all),
            ItemForm::FullForm(ContentKind::Code)
        );
        assert_eq!(
            identify(&json!({"markdown": "a", "quiz": {}}), all),
            ItemForm::Unrecognized
        );

        let only_md = KindSet::parse_names(&["markdown"]).unwrap();
        assert_eq!(
            identify(&json!({"quiz": {}}), only_md),
            ItemForm::Unrecognized
        );
    }

    #[test]
    fn test_to_shorthand_only_when_lossless() {
        let plain = json!({"type": "markdown", "content": "Hello"});
        assert_eq!(to_shorthand(&plain), Some(json!({"markdown": "Hello"})));

        let empty_meta = json!({"type": "markdown", "content": "Hello", "meta": {}});
        assert_eq!(to_shorthand(&empty_meta), Some(json!({"markdown": "Hello"})));

        let with_id = json!({"type": "markdown", "content": "Hello", "id": "w1"});
        assert_eq!(to_shorthand(&with_id), None);

        assert_eq!(to_shorthand(&json!({"markdown": "x"})), None);
    }

    #[test]
    fn test_widget_from_both_forms() {
        let short = json!({"definition": {"term": "Cell", "meaning": "Unit of life"}});
        let full = json!({"type": "definition", "content": {"term": "Cell", "meaning": "Unit of life"}});
        let a = Widget::from_item(&short).unwrap();
        let b = Widget::from_item(&full).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.kind(), ContentKind::Definition);
        assert_eq!(serde_json::to_value(&a).unwrap(), short);
    }

    #[test]
    fn test_registry_union_filters_variants() {
        let registry = WidgetRegistry::builtin();
        let kinds = KindSet::parse_names(&["quiz", "table"]).unwrap();
        let union = registry.union_schema(kinds);
        let members = union["anyOf"].as_array().unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0]["required"], json!(["quiz"]));
        assert_eq!(members[1]["required"], json!(["table"]));
    }

    #[test]
    fn test_registry_side_jobs() {
        let registry = WidgetRegistry::builtin().with_side_job("podcast", "audio_coach");
        assert_eq!(registry.side_job_agent("illustration"), Some("illustrator"));
        assert_eq!(registry.side_job_agent("podcast"), Some("audio_coach"));
        assert_eq!(registry.side_job_agent("quiz"), None);
    }
}
