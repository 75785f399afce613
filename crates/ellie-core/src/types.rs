use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::EllieError;

/// Tenant boundary. Every read and write is scoped by an org id.
pub type OrgId = Uuid;

/// Unique identifier for a memory.
pub type MemoryId = Uuid;

/// Unique identifier for a chat room.
pub type RoomId = Uuid;

/// Unique identifier for a project.
pub type ProjectId = Uuid;

// ── Memories ───────────────────────────────────────────────────

/// What sort of knowledge a memory captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Preference,
    TechnicalDecision,
    ProcessDecision,
    Fact,
    Lesson,
    AntiPattern,
    Pattern,
    Context,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 8] = [
        MemoryKind::Preference,
        MemoryKind::TechnicalDecision,
        MemoryKind::ProcessDecision,
        MemoryKind::Fact,
        MemoryKind::Lesson,
        MemoryKind::AntiPattern,
        MemoryKind::Pattern,
        MemoryKind::Context,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Preference => "preference",
            MemoryKind::TechnicalDecision => "technical_decision",
            MemoryKind::ProcessDecision => "process_decision",
            MemoryKind::Fact => "fact",
            MemoryKind::Lesson => "lesson",
            MemoryKind::AntiPattern => "anti_pattern",
            MemoryKind::Pattern => "pattern",
            MemoryKind::Context => "context",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryKind {
    type Err = EllieError;

    /// Accepts the canonical snake_case names plus the loose spellings models
    /// tend to produce ("anti-pattern", "decision").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "preference" => Ok(MemoryKind::Preference),
            "technical_decision" | "decision" => Ok(MemoryKind::TechnicalDecision),
            "process_decision" => Ok(MemoryKind::ProcessDecision),
            "fact" => Ok(MemoryKind::Fact),
            "lesson" => Ok(MemoryKind::Lesson),
            "anti_pattern" | "antipattern" => Ok(MemoryKind::AntiPattern),
            "pattern" => Ok(MemoryKind::Pattern),
            "context" => Ok(MemoryKind::Context),
            other => Err(EllieError::Validation(format!("unknown memory kind '{other}'"))),
        }
    }
}

/// Lifecycle of a memory. Deprecated memories are kept, never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Active,
    Deprecated,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Active => "active",
            MemoryStatus::Deprecated => "deprecated",
        }
    }
}

impl FromStr for MemoryStatus {
    type Err = EllieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MemoryStatus::Active),
            "deprecated" => Ok(MemoryStatus::Deprecated),
            other => Err(EllieError::Validation(format!("unknown memory status '{other}'"))),
        }
    }
}

/// A durable fact, preference, decision or lesson.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub org_id: OrgId,
    pub kind: MemoryKind,
    pub title: String,
    pub content: String,
    /// Open key/value metadata (always a JSON object).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// 1 (trivia) to 5 (critical).
    pub importance: u8,
    /// 0.0 - 1.0.
    pub confidence: f64,
    pub status: MemoryStatus,
    /// Forward pointer to the memory that replaced this one.
    #[serde(default)]
    pub superseded_by: Option<MemoryId>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Memory {
    pub fn is_active(&self) -> bool {
        self.status == MemoryStatus::Active
    }

    /// True when the memory carries a non-empty embedding vector.
    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Text used when embedding a memory.
    pub fn embedding_text(&self) -> String {
        format!("{}\n{}", self.title, self.content)
    }
}

/// Clamp importance into the 1..=5 range.
pub fn clamp_importance(importance: i64) -> u8 {
    importance.clamp(1, 5) as u8
}

/// Clamp a confidence score into [0, 1]. NaN becomes 0.
pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// A memory that has not been persisted yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub org_id: OrgId,
    pub kind: MemoryKind,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub importance: u8,
    pub confidence: f64,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl NewMemory {
    /// Build a new memory with clamped scores and empty provenance.
    pub fn new(
        org_id: OrgId,
        kind: MemoryKind,
        title: impl Into<String>,
        content: impl Into<String>,
        importance: i64,
        confidence: f64,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            org_id,
            kind,
            title: title.into(),
            content: content.into(),
            metadata: serde_json::Map::new(),
            importance: clamp_importance(importance),
            confidence: clamp_confidence(confidence),
            occurred_at,
            project_id: None,
            conversation_id: None,
            room_id: None,
            embedding: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

// ── Chat ───────────────────────────────────────────────────────

/// A raw chat message as stored by the conversation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub org_id: OrgId,
    pub room_id: RoomId,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    pub author: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Last-processed position of the ingestion worker inside one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomCursor {
    pub org_id: OrgId,
    pub room_id: RoomId,
    pub last_message_id: Option<Uuid>,
    pub last_created_at: Option<DateTime<Utc>>,
}

impl RoomCursor {
    /// A cursor positioned before the first message of the room.
    pub fn start(org_id: OrgId, room_id: RoomId) -> Self {
        Self {
            org_id,
            room_id,
            last_message_id: None,
            last_created_at: None,
        }
    }

    /// Whether `msg` sorts strictly after this cursor by (created_at, id).
    pub fn is_before(&self, msg: &ChatMessage) -> bool {
        match (self.last_created_at, self.last_message_id) {
            (Some(at), Some(id)) => (msg.created_at, msg.id) > (at, id),
            (Some(at), None) => msg.created_at > at,
            _ => true,
        }
    }

    /// Move the cursor to `msg`. Never moves backwards.
    pub fn advance_to(&mut self, msg: &ChatMessage) {
        if self.is_before(msg) {
            self.last_created_at = Some(msg.created_at);
            self.last_message_id = Some(msg.id);
        }
    }
}

// ── Taxonomy ───────────────────────────────────────────────────

/// One node of an org's classification tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub id: Uuid,
    pub org_id: OrgId,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub slug: String,
    pub depth: u32,
}

// ── Entities ───────────────────────────────────────────────────

/// A frequently mentioned named thing (service, library, team...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub org_id: OrgId,
    pub name: String,
    pub mention_count: u32,
    /// The canonical definition memory, once synthesized.
    #[serde(default)]
    pub synthesis_memory_id: Option<MemoryId>,
    /// Set when new mentions arrived after the last synthesis.
    pub stale: bool,
}

// ── Retrieval tuning ───────────────────────────────────────────

/// How eagerly proactive injection surfaces context. Only a human may change it.
///
/// Shifts the relevance threshold used by injection and fixture replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Relaxed,
    Standard,
    Strict,
}

/// Widest scope retrieval may search. Only a human may change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalScope {
    Room,
    Project,
    Org,
}

/// Retrieval knobs the tuner hill-climbs over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Minimum relevance a candidate needs to be surfaced (0.0 - 1.0).
    pub min_relevance: f64,
    /// Maximum number of results returned or injected.
    pub max_results: usize,
    /// Maximum characters of rendered context.
    pub max_chars: usize,
    pub sensitivity: Sensitivity,
    pub scope: RetrievalScope,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            min_relevance: 0.62,
            max_results: 5,
            max_chars: 1600,
            sensitivity: Sensitivity::Standard,
            scope: RetrievalScope::Org,
        }
    }
}

impl Sensitivity {
    /// Shift applied to the tuned minimum relevance.
    pub fn relevance_offset(self) -> f64 {
        match self {
            Sensitivity::Relaxed => -0.05,
            Sensitivity::Standard => 0.0,
            Sensitivity::Strict => 0.10,
        }
    }
}

impl TunerConfig {
    /// Threshold a candidate must clear once sensitivity is applied, in [0, 1].
    pub fn effective_min_relevance(&self) -> f64 {
        let base = if self.min_relevance.is_finite() { self.min_relevance } else { 0.0 };
        (base + self.sensitivity.relevance_offset()).clamp(0.0, 1.0)
    }
}
