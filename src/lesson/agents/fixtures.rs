//! Deterministic agent fixtures.
//!
//! A fixtures directory holds one JSON file per agent call:
//! `planner.json`, `section_<n>.json`, `repair_<n>.json`. Files are read once
//! at startup; a present fixture replaces the live provider call.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::types::{ForgeError, Result, ResultExt};

#[derive(Debug, Clone, Default)]
pub struct FixtureSet {
    entries: BTreeMap<String, Value>,
}

impl FixtureSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every `*.json` file in `dir`, keyed by file stem
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let Some(dir) = dir else {
            return Ok(Self::empty());
        };
        if !dir.is_dir() {
            return Err(ForgeError::Fixture(format!(
                "fixtures directory not found: {}",
                dir.display()
            )));
        }

        let mut entries = BTreeMap::new();
        let listing = fs::read_dir(dir)
            .with_context_fn(|| format!("listing fixtures in {}", dir.display()))?;
        for entry in listing {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = fs::read_to_string(&path)?;
            let value: Value = serde_json::from_str(&raw).map_err(|e| {
                ForgeError::Fixture(format!("{} is not valid JSON: {}", path.display(), e))
            })?;
            entries.insert(stem.to_string(), value);
        }

        info!("Loaded {} fixture(s) from {}", entries.len(), dir.display());
        Ok(Self { entries })
    }

    pub fn with_entry(mut self, key: &str, value: Value) -> Self {
        self.entries.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn planner(&self) -> Option<&Value> {
        self.get("planner")
    }

    pub fn section(&self, number: u32) -> Option<&Value> {
        self.get(&format!("section_{}", number))
    }

    pub fn repair(&self, number: u32) -> Option<&Value> {
        self.get(&format!("repair_{}", number))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
