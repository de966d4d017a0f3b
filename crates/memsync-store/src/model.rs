//! Record model shared by every store adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Reserved metadata key holding the workflow phase tag.
pub const PHASE_KEY: &str = "phase";
/// Reserved metadata key holding the logical version number.
pub const VERSION_KEY: &str = "version";
/// Reserved metadata key holding the parent cycle identifier.
pub const PARENT_CYCLE_KEY: &str = "parent_cycle";
/// Reserved metadata key listing ids of related records.
pub const REFERENCES_KEY: &str = "references";

/// Free-form record metadata.
pub type Metadata = Map<String, Value>;

/// Semantic category of a record. Fixed at creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Source code or a code analysis artifact.
    Code,
    /// Documentation fragment.
    Documentation,
    /// Working memory scoped to a single task.
    ShortTerm,
    /// Durable memory carried across tasks.
    LongTerm,
    /// Snapshot of a collaborating team's state.
    TeamState,
    /// Proposed solution.
    Solution,
    /// Result of dialectical reasoning.
    DialecticalReasoning,
    /// Knowledge-graph fact.
    KnowledgeGraph,
    /// Relationship edge between two records.
    Relationship,
    /// Peer review artifact.
    PeerReview,
    /// Task history entry.
    TaskHistory,
}

impl RecordKind {
    /// Every kind, in declaration order.
    pub const ALL: [RecordKind; 11] = [
        RecordKind::Code,
        RecordKind::Documentation,
        RecordKind::ShortTerm,
        RecordKind::LongTerm,
        RecordKind::TeamState,
        RecordKind::Solution,
        RecordKind::DialecticalReasoning,
        RecordKind::KnowledgeGraph,
        RecordKind::Relationship,
        RecordKind::PeerReview,
        RecordKind::TaskHistory,
    ];

    /// Return the kind as its snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Code => "code",
            RecordKind::Documentation => "documentation",
            RecordKind::ShortTerm => "short_term",
            RecordKind::LongTerm => "long_term",
            RecordKind::TeamState => "team_state",
            RecordKind::Solution => "solution",
            RecordKind::DialecticalReasoning => "dialectical_reasoning",
            RecordKind::KnowledgeGraph => "knowledge_graph",
            RecordKind::Relationship => "relationship",
            RecordKind::PeerReview => "peer_review",
            RecordKind::TaskHistory => "task_history",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        RecordKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown record kind: {value}"))
    }
}

/// Workflow phases recognised by phase-scoped helpers, in cycle order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowPhase {
    Expand,
    Differentiate,
    Refine,
    Retrospect,
}

impl WorkflowPhase {
    /// Tag stored under the reserved phase key.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Expand => "EXPAND",
            WorkflowPhase::Differentiate => "DIFFERENTIATE",
            WorkflowPhase::Refine => "REFINE",
            WorkflowPhase::Retrospect => "RETROSPECT",
        }
    }

    /// Parse a stored tag; case-insensitive.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "EXPAND" => Some(WorkflowPhase::Expand),
            "DIFFERENTIATE" => Some(WorkflowPhase::Differentiate),
            "REFINE" => Some(WorkflowPhase::Refine),
            "RETROSPECT" => Some(WorkflowPhase::Retrospect),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of storage. The same logical entity keeps the same `id` in every adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Record identifier.
    pub id: String,
    /// Opaque payload.
    pub content: Value,
    /// Semantic category.
    pub kind: RecordKind,
    /// Metadata used for filtering and conflict resolution.
    #[serde(default)]
    pub metadata: Metadata,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Embedding used by vector adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Record {
    /// Create a record with empty metadata, stamped now.
    pub fn new(id: impl Into<String>, kind: RecordKind, content: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            kind,
            metadata: Metadata::new(),
            created_at: Utc::now(),
            embedding: None,
        }
    }

    /// Create a record with a freshly generated id.
    pub fn generated(kind: RecordKind, content: impl Into<Value>) -> Self {
        Self::new(Uuid::new_v4().to_string(), kind, content)
    }

    /// Set a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach an embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Content as text; structured payloads are rendered as JSON.
    pub fn content_text(&self) -> Cow<'_, str> {
        match &self.content {
            Value::String(text) => Cow::Borrowed(text.as_str()),
            other => Cow::Owned(other.to_string()),
        }
    }

    /// Look up a metadata value by dotted path (`a.b.c`).
    pub fn metadata_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.metadata.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Workflow phase tag, if any.
    pub fn phase(&self) -> Option<WorkflowPhase> {
        self.metadata
            .get(PHASE_KEY)
            .and_then(Value::as_str)
            .and_then(WorkflowPhase::parse)
    }

    /// Logical version number, if any.
    pub fn version(&self) -> Option<u64> {
        self.metadata.get(VERSION_KEY).and_then(Value::as_u64)
    }

    /// Ids listed under the reserved references key.
    pub fn references(&self) -> Vec<String> {
        match self.metadata.get(REFERENCES_KEY) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(single)) => vec![single.clone()],
            _ => Vec::new(),
        }
    }

    /// True when content and metadata are equal.
    pub fn same_payload(&self, other: &Record) -> bool {
        self.content == other.content && self.metadata == other.metadata
    }
}

/// Read-only projection returned by search and routing.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Matched record.
    pub record: Record,
    /// Cosine similarity for embedding searches.
    pub similarity: Option<f32>,
    /// Ranking score (similarity, or lexical relevance otherwise).
    pub score: f32,
    /// Name of the adapter that produced the result.
    pub source: String,
}

impl SearchResult {
    /// Build a result ranked by lexical relevance.
    pub fn scored(record: Record, score: f32, source: impl Into<String>) -> Self {
        Self {
            record,
            similarity: None,
            score,
            source: source.into(),
        }
    }

    /// Build a result ranked by embedding similarity.
    pub fn similar(record: Record, similarity: f32, source: impl Into<String>) -> Self {
        Self {
            record,
            similarity: Some(similarity),
            score: similarity,
            source: source.into(),
        }
    }

    /// Identifier of the matched record.
    pub fn id(&self) -> &str {
        &self.record.id
    }
}
