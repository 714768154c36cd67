//! Provider schema sanitization.
//!
//! Structured-generation endpoints reject or misread parts of ordinary JSON
//! Schema. [`sanitize_for_provider`] rewrites a schema into the subset they
//! accept:
//!
//! - local `$ref`s are inlined and `$defs` removed
//! - metadata and minimum bounds are stripped; `maxLength`/`maxItems` stay
//! - `anyOf [X, null]` becomes a nullable `type` array
//! - a union of single-key object variants becomes one container object with
//!   `maxProperties: 1` plus an `anyOf` of `required` sets, so exactly one
//!   known key may appear

use serde_json::{Map, Value, json};

const STRIPPED_KEYS: &[&str] = &[
    "title",
    "$schema",
    "$id",
    "$defs",
    "definitions",
    "examples",
    "default",
    "$comment",
    "minLength",
    "minItems",
    "minProperties",
    "format",
];

/// References deeper than this are replaced by an empty schema.
const MAX_REF_DEPTH: usize = 32;

pub fn sanitize_for_provider(schema: &Value) -> Value {
    let defs = schema
        .get("$defs")
        .or_else(|| schema.get("definitions"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    transform(schema, &defs, 0)
}

fn transform(node: &Value, defs: &Map<String, Value>, depth: usize) -> Value {
    let Some(obj) = node.as_object() else {
        return node.clone();
    };

    if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
        return match resolve_ref(reference, defs) {
            Some(target) if depth < MAX_REF_DEPTH => transform(target, defs, depth + 1),
            _ => json!({}),
        };
    }

    let mut out = Map::new();
    for (key, value) in obj {
        if STRIPPED_KEYS.contains(&key.as_str()) {
            continue;
        }
        let rewritten = match key.as_str() {
            "properties" => match value.as_object() {
                Some(props) => Value::Object(
                    props
                        .iter()
                        .map(|(k, v)| (k.clone(), transform(v, defs, depth)))
                        .collect(),
                ),
                None => value.clone(),
            },
            "items" | "additionalProperties" if value.is_object() => transform(value, defs, depth),
            "anyOf" | "oneOf" => match value.as_array() {
                Some(members) => Value::Array(
                    members.iter().map(|m| transform(m, defs, depth)).collect(),
                ),
                None => value.clone(),
            },
            _ => value.clone(),
        };
        // oneOf is normalized to anyOf; exclusivity comes from maxProperties
        let key = if key == "oneOf" { "anyOf" } else { key.as_str() };
        out.insert(key.to_string(), rewritten);
    }

    if let Some(Value::Array(members)) = out.get("anyOf").cloned() {
        if let Some(collapsed) = collapse_nullable(&members) {
            out.remove("anyOf");
            return merge(out, collapsed);
        }
        if let Some(container) = flatten_single_key_union(&members) {
            out.remove("anyOf");
            return merge(out, container);
        }
    }

    Value::Object(out)
}

fn resolve_ref<'a>(reference: &str, defs: &'a Map<String, Value>) -> Option<&'a Value> {
    let name = reference
        .strip_prefix("#/$defs/")
        .or_else(|| reference.strip_prefix("#/definitions/"))?;
    defs.get(name)
}

/// Overlay `inner` onto the remaining sibling keys of a union node
fn merge(mut siblings: Map<String, Value>, inner: Value) -> Value {
    match inner {
        Value::Object(fields) => {
            for (k, v) in fields {
                siblings.insert(k, v);
            }
            Value::Object(siblings)
        }
        other => other,
    }
}

fn is_null_schema(v: &Value) -> bool {
    v.get("type").and_then(Value::as_str) == Some("null")
}

/// `anyOf [X, {"type": "null"}]` → X with `"null"` added to its type
fn collapse_nullable(members: &[Value]) -> Option<Value> {
    let [a, b] = members else {
        return None;
    };
    let inner = match (is_null_schema(a), is_null_schema(b)) {
        (true, false) => b,
        (false, true) => a,
        _ => return None,
    };

    let mut schema = inner.as_object()?.clone();
    match schema.get("type").cloned() {
        Some(Value::String(t)) => {
            schema.insert("type".into(), json!([t, "null"]));
        }
        Some(Value::Array(mut types)) => {
            if !types.iter().any(|t| t == "null") {
                types.push(json!("null"));
            }
            schema.insert("type".into(), Value::Array(types));
        }
        // Typeless member (e.g. a container); keep the union
        _ => return None,
    }
    Some(Value::Object(schema))
}

/// Each member is `{"type":"object","properties":{k: ..},"required":[k]}`
fn single_key_variant(member: &Value) -> Option<(&String, &Value)> {
    let props = member.get("properties")?.as_object()?;
    if props.len() != 1 {
        return None;
    }
    let (key, body) = props.iter().next()?;
    let required = member.get("required")?.as_array()?;
    (required.len() == 1 && required[0].as_str() == Some(key.as_str())).then_some((key, body))
}

fn flatten_single_key_union(members: &[Value]) -> Option<Value> {
    if members.is_empty() {
        return None;
    }
    let variants: Vec<(&String, &Value)> = members
        .iter()
        .map(single_key_variant)
        .collect::<Option<Vec<_>>>()?;

    let mut properties = Map::new();
    let mut required_sets = Vec::with_capacity(variants.len());
    for (key, body) in variants {
        properties.insert(key.clone(), body.clone());
        required_sets.push(json!({"required": [key]}));
    }

    Some(json!({
        "type": "object",
        "properties": properties,
        "additionalProperties": false,
        "maxProperties": 1,
        "anyOf": required_sets,
    }))
}
