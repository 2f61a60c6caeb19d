//! Semantic answer cache keyed by normalized question text and type

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::types::AnswerValue;

/// An answer the reasoning service produced once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnswer {
    pub value: AnswerValue,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub stored_at: DateTime<Utc>,
}

/// Answers shared across attempts, sessions and tabs.
///
/// Each key is written at most once; later writers keep the first answer.
#[derive(Debug, Default)]
pub struct SemanticCache {
    entries: DashMap<String, CachedAnswer>,
}

impl SemanticCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<CachedAnswer> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Store an answer unless the key already has one; returns whether it was stored
    pub fn insert(&self, key: String, answer: CachedAnswer) -> bool {
        let mut stored = false;
        self.entries.entry(key).or_insert_with(|| {
            stored = true;
            answer
        });
        stored
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load a cache saved with [`SemanticCache::save`]; a missing file is an empty cache
    pub fn load(path: &Path) -> Result<Self> {
        let cache = Self::new();
        if !path.exists() {
            debug!("No answer cache at {}", path.display());
            return Ok(cache);
        }
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read answer cache '{}'", path.display()))?;
        let entries: BTreeMap<String, CachedAnswer> = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse answer cache '{}'", path.display()))?;
        for (key, answer) in entries {
            cache.entries.insert(key, answer);
        }
        info!("Loaded {} cached answer(s)", cache.len());
        Ok(cache)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let entries: BTreeMap<String, CachedAnswer> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&entries)?)
            .with_context(|| format!("Failed to write answer cache '{}'", path.display()))?;
        debug!("Saved {} cached answer(s) to {}", entries.len(), path.display());
        Ok(())
    }
}
