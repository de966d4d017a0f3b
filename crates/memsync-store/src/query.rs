//! Structured search query and the filter evaluation shared by adapters.

use crate::adapter::Capabilities;
use crate::error::StoreError;
use crate::model::{Record, RecordKind, SearchResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Equality filters plus an optional embedding for similarity search.
///
/// All filters are combined with AND. An empty query matches every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Exact record kind.
    #[serde(default)]
    pub kind: Option<RecordKind>,
    /// Metadata equality filters keyed by dotted path.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Case-insensitive content substring.
    #[serde(default)]
    pub content_contains: Option<String>,
    /// Query embedding; only vector adapters accept it.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Maximum number of results.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    /// Query matching every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Query matching one kind.
    pub fn by_kind(kind: RecordKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Query ranking by similarity to `embedding`.
    pub fn nearest(embedding: Vec<f32>, limit: usize) -> Self {
        Self {
            embedding: Some(embedding),
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Restrict to one kind.
    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Add a metadata equality filter.
    pub fn with_metadata(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(path.into(), value.into());
        self
    }

    /// Require a content substring.
    pub fn containing(mut self, text: impl Into<String>) -> Self {
        self.content_contains = Some(text.into());
        self
    }

    /// Cap the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject filters the adapter cannot evaluate.
    pub fn check_supported(&self, store: &str, caps: Capabilities) -> Result<(), StoreError> {
        if self.embedding.is_some() && !caps.embedding_search {
            return Err(unsupported(store, "embedding search is not available"));
        }
        if self.content_contains.is_some() && !caps.content_filter {
            return Err(unsupported(store, "content filters are not available"));
        }
        if !self.metadata.is_empty() && !caps.metadata_filter {
            return Err(unsupported(store, "metadata filters are not available"));
        }
        for path in self.metadata.keys() {
            if path.is_empty() || path.split('.').any(str::is_empty) {
                return Err(unsupported(
                    store,
                    &format!("invalid metadata path '{path}'"),
                ));
            }
        }
        Ok(())
    }

    /// Evaluate the equality filters against a record. Ignores the embedding.
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(kind) = self.kind {
            if record.kind != kind {
                return false;
            }
        }
        for (path, expected) in &self.metadata {
            if record.metadata_path(path) != Some(expected) {
                return false;
            }
        }
        if let Some(needle) = &self.content_contains {
            let haystack = record.content_text().to_lowercase();
            if !haystack.contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }

    /// Lexical relevance in (0, 1]: the share of the content covered by the
    /// substring filter. Queries without a text filter score 1.0.
    pub fn relevance(&self, record: &Record) -> f32 {
        let Some(needle) = &self.content_contains else {
            return 1.0;
        };
        let content_len = record.content_text().chars().count();
        if content_len == 0 {
            return 1.0;
        }
        let needle_len = needle.chars().count().max(1);
        (needle_len as f32 / content_len as f32).min(1.0)
    }

    /// Filter, score and rank records without an embedding.
    pub fn scan<'a>(
        &self,
        records: impl IntoIterator<Item = &'a Record>,
        source: &str,
    ) -> Vec<SearchResult> {
        let mut results: Vec<SearchResult> = records
            .into_iter()
            .filter(|record| self.matches(record))
            .map(|record| SearchResult::scored(record.clone(), self.relevance(record), source))
            .collect();
        rank(&mut results);
        if let Some(limit) = self.limit {
            results.truncate(limit);
        }
        results
    }
}

/// Sort by descending score, then id for a stable order.
pub fn rank(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
}

fn unsupported(store: &str, reason: &str) -> StoreError {
    StoreError::UnsupportedQuery {
        store: store.to_string(),
        reason: reason.to_string(),
    }
}
