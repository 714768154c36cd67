//! Static content shapes.
//!
//! One description of the lesson document drives both the validator and the
//! JSON Schema handed to providers.

use serde_json::{Map, Value, json};

use crate::constants::document as limits;

/// Shape of a JSON value
#[derive(Debug)]
pub enum Shape {
    Text {
        max_len: usize,
    },
    Integer,
    /// String restricted to a fixed set of literals
    OneOf(&'static [&'static str]),
    List {
        item: &'static Shape,
        min_items: usize,
        max_items: usize,
    },
    Record(&'static [Field]),
    /// Content item: a widget of any allowed kind
    Widget,
}

/// Named member of a [`Shape::Record`]
#[derive(Debug)]
pub struct Field {
    pub name: &'static str,
    pub shape: Shape,
    pub required: bool,
}

// =============================================================================
// Document Shapes
// =============================================================================

const WIDGET: Shape = Shape::Widget;

pub const SUBSECTION: Shape = Shape::Record(&[
    Field {
        name: limits::HEADING_KEY,
        shape: Shape::Text {
            max_len: limits::MAX_SECTION_TITLE,
        },
        required: true,
    },
    Field {
        name: "items",
        shape: Shape::List {
            item: &WIDGET,
            min_items: 0,
            max_items: limits::MAX_SUBSECTION_ITEMS,
        },
        required: true,
    },
]);

pub const SECTION: Shape = Shape::Record(&[
    Field {
        name: "title",
        shape: Shape::Text {
            max_len: limits::MAX_SECTION_TITLE,
        },
        required: true,
    },
    Field {
        name: "items",
        shape: Shape::List {
            item: &WIDGET,
            min_items: 0,
            max_items: limits::MAX_SECTION_ITEMS,
        },
        required: true,
    },
    Field {
        name: "subsections",
        shape: Shape::List {
            item: &SUBSECTION,
            min_items: 0,
            max_items: limits::MAX_SUBSECTIONS,
        },
        required: false,
    },
]);

const LESSON_BODY: Shape = Shape::Record(&[
    Field {
        name: "title",
        shape: Shape::Text {
            max_len: limits::MAX_LESSON_TITLE,
        },
        required: true,
    },
    Field {
        name: "sections",
        shape: Shape::List {
            item: &SECTION,
            min_items: 0,
            max_items: limits::MAX_SECTIONS,
        },
        required: true,
    },
]);

/// `{"lesson": {"title", "sections": [...]}}`
pub const DOCUMENT: Shape = Shape::Record(&[Field {
    name: "lesson",
    shape: LESSON_BODY,
    required: true,
}]);

// =============================================================================
// JSON Schema Rendering
// =============================================================================

/// Reference used for content items; resolved from `$defs`
pub const WIDGET_REF: &str = "#/$defs/ContentItem";

impl Shape {
    /// Render as JSON Schema. Optional members become `anyOf [X, null]` and
    /// widgets become `$ref`s, the same way a model-derived schema looks before
    /// provider sanitization.
    pub fn to_schema(&self) -> Value {
        match self {
            Shape::Text { max_len } => json!({"type": "string", "minLength": 1, "maxLength": max_len}),
            Shape::Integer => json!({"type": "integer"}),
            Shape::OneOf(options) => json!({"type": "string", "enum": options}),
            Shape::List {
                item,
                min_items,
                max_items,
            } => {
                let mut schema = json!({
                    "type": "array",
                    "items": item.to_schema(),
                    "maxItems": max_items,
                });
                if *min_items > 0 {
                    schema["minItems"] = json!(min_items);
                }
                schema
            }
            Shape::Record(fields) => {
                let mut properties = Map::new();
                let mut required = Vec::new();
                for field in fields.iter() {
                    let member = field.shape.to_schema();
                    if field.required {
                        required.push(Value::from(field.name));
                        properties.insert(field.name.to_string(), member);
                    } else {
                        properties.insert(
                            field.name.to_string(),
                            json!({"anyOf": [member, {"type": "null"}], "default": null}),
                        );
                    }
                }
                json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                    "additionalProperties": false,
                })
            }
            Shape::Widget => json!({"$ref": WIDGET_REF}),
        }
    }
}
