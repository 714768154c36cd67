//! Typed dot-paths into JSON payloads.
//!
//! Validation errors and repair patches name locations as dot-strings
//! (`subsections.1.items.0.quiz`). Internally they are [`JsonPath`]s so the
//! repair engine can resolve, compare and rewrite them without string games.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => f.write_str(k),
            Self::Index(i) => write!(f, "{}", i),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JsonPath(Vec<Segment>);

/// Location of a resolved path: the container path and the slot within it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub parent: JsonPath,
    pub slot: Segment,
}

impl JsonPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse a dot-string. Purely numeric segments become indices.
    pub fn parse(raw: &str) -> Self {
        let segments = raw
            .trim()
            .split('.')
            .filter(|s| !s.is_empty())
            .map(|s| match s.parse::<usize>() {
                Ok(i) => Segment::Index(i),
                Err(_) => Segment::Key(s.to_string()),
            })
            .collect();
        Self(segments)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, segment: Segment) -> Self {
        let mut next = self.0.clone();
        next.push(segment);
        Self(next)
    }

    pub fn key(&self, key: &str) -> Self {
        self.child(Segment::Key(key.to_string()))
    }

    pub fn index(&self, index: usize) -> Self {
        self.child(Segment::Index(index))
    }

    pub fn starts_with(&self, prefix: &JsonPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Remaining segments after `prefix`, if it is one
    pub fn strip_prefix(&self, prefix: &JsonPath) -> Option<JsonPath> {
        self.0.strip_prefix(prefix.0.as_slice()).map(|rest| Self(rest.to_vec()))
    }

    /// First `n` segments
    pub fn truncate(&self, n: usize) -> JsonPath {
        Self(self.0.iter().take(n).cloned().collect())
    }

    /// Path without its first `n` segments
    pub fn skip(&self, n: usize) -> JsonPath {
        Self(self.0.iter().skip(n).cloned().collect())
    }

    pub fn split_last(&self) -> Option<ResolvedTarget> {
        let (slot, parent) = self.0.split_last()?;
        Some(ResolvedTarget {
            parent: Self(parent.to_vec()),
            slot: slot.clone(),
        })
    }

    pub fn resolve<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(value, |node, segment| match segment {
            Segment::Key(k) => node.as_object()?.get(k),
            Segment::Index(i) => node.as_array()?.get(*i),
        })
    }

    pub fn resolve_mut<'a>(&self, value: &'a mut Value) -> Option<&'a mut Value> {
        self.0.iter().try_fold(value, |node, segment| match segment {
            Segment::Key(k) => node.as_object_mut()?.get_mut(k),
            Segment::Index(i) => node.as_array_mut()?.get_mut(*i),
        })
    }

    /// Replace the value at an existing location; `false` if it does not
    /// resolve. Object keys may be new, array indices must exist.
    pub fn set(&self, root: &mut Value, replacement: Value) -> bool {
        let Some(target) = self.split_last() else {
            *root = replacement;
            return true;
        };
        let Some(parent) = target.parent.resolve_mut(root) else {
            return false;
        };
        match (&target.slot, parent) {
            (Segment::Key(k), Value::Object(map)) => {
                map.insert(k.clone(), replacement);
                true
            }
            (Segment::Index(i), Value::Array(items)) if *i < items.len() => {
                items[*i] = replacement;
                true
            }
            _ => false,
        }
    }
}

impl FromStr for JsonPath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}
