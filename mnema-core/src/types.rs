//! Core type definitions for the mnema consolidation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity Types
// ---------------------------------------------------------------------------

/// Unique identifier for a user whose conversations are consolidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Create a new random user ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a conversation (story) owning a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoryId(pub Uuid);

impl StoryId {
    /// Create a new random story ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a durable memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random memory ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message IDs are monotonic SQLite rowids; creation order == id order.
pub type MessageId = i64;

// ---------------------------------------------------------------------------
// Conversation turns
// ---------------------------------------------------------------------------

/// Speaker role of a conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human user.
    User,
    /// The assistant.
    Assistant,
    /// System-injected context.
    System,
}

impl Role {
    /// Stable wire/storage spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Parse from the storage spelling. Unknown roles map to `System`.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::System,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One conversational turn in the message log.
///
/// `extracted` transitions false→true exactly once, and only after all
/// memory effects of the message's extraction batch have been attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Monotonic rowid.
    pub id: MessageId,
    /// Owning conversation.
    pub story_id: StoryId,
    /// User this conversation belongs to.
    pub user_id: UserId,
    /// Speaker role.
    pub role: Role,
    /// Turn text.
    pub content: String,
    /// Whether this turn has been consumed by a consolidation run.
    pub extracted: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time (flips when `extracted` is set).
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Facts and memories
// ---------------------------------------------------------------------------

/// Closed category taxonomy for facts and memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryCategory {
    /// Biographical information about the user.
    UserInfo,
    /// A stated like/dislike or preference.
    UserPreference,
    /// Something the user wants to achieve.
    UserGoal,
    /// A relationship the user mentioned.
    UserRelationship,
    /// A dated or datable occurrence.
    Event,
    /// Anything that fits no other bucket.
    Other,
}

impl MemoryCategory {
    /// Stable wire/storage spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryCategory::UserInfo => "USER_INFO",
            MemoryCategory::UserPreference => "USER_PREFERENCE",
            MemoryCategory::UserGoal => "USER_GOAL",
            MemoryCategory::UserRelationship => "USER_RELATIONSHIP",
            MemoryCategory::Event => "EVENT",
            MemoryCategory::Other => "OTHER",
        }
    }

    /// Parse from the wire spelling. Unknown categories fall back to
    /// `Other` — models occasionally invent labels and that must not be
    /// fatal for a whole extraction batch.
    #[must_use]
    pub fn from_wire(s: &str) -> Self {
        match s {
            "USER_INFO" => MemoryCategory::UserInfo,
            "USER_PREFERENCE" => MemoryCategory::UserPreference,
            "USER_GOAL" => MemoryCategory::UserGoal,
            "USER_RELATIONSHIP" => MemoryCategory::UserRelationship,
            "EVENT" => MemoryCategory::Event,
            _ => MemoryCategory::Other,
        }
    }

    /// All category wire spellings, for schema enum construction.
    #[must_use]
    pub fn wire_names() -> [&'static str; 6] {
        [
            "USER_INFO",
            "USER_PREFERENCE",
            "USER_GOAL",
            "USER_RELATIONSHIP",
            "EVENT",
            "OTHER",
        ]
    }
}

impl<'de> Deserialize<'de> for MemoryCategory {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(MemoryCategory::from_wire(&s))
    }
}

impl fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a memory's last write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoryAction {
    /// Created as a genuinely new memory.
    Add,
    /// Merged/overwritten from a newer fact.
    Update,
}

impl MemoryAction {
    /// Stable wire/storage spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryAction::Add => "ADD",
            MemoryAction::Update => "UPDATE",
        }
    }

    /// Parse from the wire spelling.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "ADD" => Some(MemoryAction::Add),
            "UPDATE" => Some(MemoryAction::Update),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ephemeral candidate memory emitted by the extraction model.
///
/// Facts live only within one consolidation run and are never persisted
/// directly; a fact becomes a [`Memory`] only through an ADD decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    /// The atomic fact text.
    pub text: String,
    /// Category bucket.
    pub category: MemoryCategory,
    /// How much this fact matters (0–1).
    pub importance: f32,
    /// How certain the model is (0–1).
    pub confidence: f32,
}

impl Fact {
    /// Clamp importance and confidence into [0, 1]. Model outputs are not
    /// trusted to respect the schema's numeric bounds.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.importance = self.importance.clamp(0.0, 1.0);
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

/// A dense vector embedding for semantic similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    /// Dimensionality of the embedding.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    /// Cosine similarity between two embeddings, in [-1, 1].
    /// Returns 0.0 for mismatched dimensions or zero vectors.
    #[must_use]
    pub fn cosine_similarity(&self, other: &Self) -> f32 {
        if self.0.len() != other.0.len() || self.0.is_empty() {
            return 0.0;
        }
        let (mut dot, mut norm_a, mut norm_b) = (0.0_f32, 0.0_f32, 0.0_f32);
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }
        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom < f32::EPSILON { 0.0 } else { dot / denom }
    }

    /// Cosine distance, bounded to [0, 2] (0 = identical, 2 = opposite).
    #[must_use]
    pub fn cosine_distance(&self, other: &Self) -> f32 {
        (1.0 - self.cosine_similarity(other)).clamp(0.0, 2.0)
    }
}

/// A durable long-term memory record about a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Unique ID.
    pub id: MemoryId,
    /// Owning user.
    pub user_id: UserId,
    /// Current text.
    pub content: String,
    /// Text before the most recent UPDATE, if any.
    pub prev_content: Option<String>,
    /// Category bucket.
    pub category: MemoryCategory,
    /// How much this memory matters (0–1).
    pub importance: f32,
    /// How certain the source model was (0–1).
    pub confidence: f32,
    /// Embedding of `content`. Regenerated whenever content changes.
    pub embedding: Embedding,
    /// Provenance of the last write.
    pub action: MemoryAction,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Adjudication decisions
// ---------------------------------------------------------------------------

/// One adjudication decision from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Unified-namespace id, integer encoded as a string.
    pub id: String,
    /// ADD (new memory) or UPDATE (merge into existing memory).
    pub event: MemoryAction,
    /// The text to store. Falls back to the originating fact's text when
    /// omitted.
    #[serde(default)]
    pub text: Option<String>,
}

/// Where a unified-namespace id resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifiedRef {
    /// Zero-based index into the run's unique existing memories.
    Existing(usize),
    /// Zero-based index into the run's extracted facts.
    Fresh(usize),
}

/// Transient integer-id mapping built once per consolidation run.
///
/// Existing memories retrieved during dedup are numbered `1..=N` in
/// discovery order; extracted facts are numbered `N+1..=N+M` in extraction
/// order. The namespace lets the adjudication model reference both kinds
/// of candidate with small unambiguous integers. It is rebuilt fresh each
/// run and never persisted.
#[derive(Debug, Clone, Copy)]
pub struct UnifiedNamespace {
    existing: usize,
    fresh: usize,
}

impl UnifiedNamespace {
    /// Build a namespace over `existing` unique memories and `fresh` facts.
    #[must_use]
    pub fn new(existing: usize, fresh: usize) -> Self {
        Self { existing, fresh }
    }

    /// Unified id (1-based) for the existing memory at `index`.
    #[must_use]
    pub fn existing_id(&self, index: usize) -> usize {
        index + 1
    }

    /// Unified id (1-based) for the fact at `index`.
    #[must_use]
    pub fn fresh_id(&self, index: usize) -> usize {
        self.existing + index + 1
    }

    /// Resolve a raw decision id back into a candidate reference.
    ///
    /// Returns `None` for non-integer ids and ids outside both ranges;
    /// callers skip such decisions rather than failing the run.
    #[must_use]
    pub fn resolve(&self, raw: &str) -> Option<UnifiedRef> {
        let id: usize = raw.trim().parse().ok()?;
        if id == 0 {
            return None;
        }
        if id <= self.existing {
            Some(UnifiedRef::Existing(id - 1))
        } else if id <= self.existing + self.fresh {
            Some(UnifiedRef::Fresh(id - self.existing - 1))
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Run outcome
// ---------------------------------------------------------------------------

/// Counts reporting what one consolidation run attempted and achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    /// Facts the extraction model emitted.
    pub facts_extracted: usize,
    /// Memory rows successfully written (ADD + UPDATE).
    pub memories_updated: usize,
    /// Messages flipped to `extracted = true`.
    pub messages_extracted: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_wire_round_trip() {
        for name in MemoryCategory::wire_names() {
            let cat = MemoryCategory::from_wire(name);
            assert_eq!(cat.as_str(), name);
        }
    }

    #[test]
    fn unknown_category_falls_back_to_other() {
        assert_eq!(
            MemoryCategory::from_wire("USER_MOOD"),
            MemoryCategory::Other
        );
        let parsed: MemoryCategory =
            serde_json::from_str("\"SOMETHING_NEW\"").expect("deserialize");
        assert_eq!(parsed, MemoryCategory::Other);
    }

    #[test]
    fn action_wire_spellings() {
        assert_eq!(MemoryAction::from_wire("ADD"), Some(MemoryAction::Add));
        assert_eq!(
            MemoryAction::from_wire("UPDATE"),
            Some(MemoryAction::Update)
        );
        assert_eq!(MemoryAction::from_wire("DELETE"), None);
    }

    #[test]
    fn fact_clamping() {
        let fact = Fact {
            text: "likes tea".into(),
            category: MemoryCategory::UserPreference,
            importance: 1.7,
            confidence: -0.2,
        }
        .clamped();
        assert_eq!(fact.importance, 1.0);
        assert_eq!(fact.confidence, 0.0);
    }

    #[test]
    fn unified_namespace_round_trip() {
        // 3 existing memories, 2 facts: ids 1..=3 existing, 4..=5 fresh.
        let ns = UnifiedNamespace::new(3, 2);

        for i in 0..3 {
            let id = ns.existing_id(i);
            assert_eq!(ns.resolve(&id.to_string()), Some(UnifiedRef::Existing(i)));
        }
        for i in 0..2 {
            let id = ns.fresh_id(i);
            assert_eq!(ns.resolve(&id.to_string()), Some(UnifiedRef::Fresh(i)));
        }
    }

    #[test]
    fn unified_namespace_rejects_out_of_range() {
        let ns = UnifiedNamespace::new(3, 2);
        assert_eq!(ns.resolve("0"), None);
        assert_eq!(ns.resolve("6"), None);
        assert_eq!(ns.resolve("10"), None); // N+M+5
        assert_eq!(ns.resolve("-1"), None);
        assert_eq!(ns.resolve("two"), None);
        assert_eq!(ns.resolve(""), None);
    }

    #[test]
    fn unified_namespace_trims_whitespace() {
        let ns = UnifiedNamespace::new(1, 1);
        assert_eq!(ns.resolve(" 2 "), Some(UnifiedRef::Fresh(0)));
    }

    #[test]
    fn cosine_distance_bounds() {
        let a = Embedding(vec![1.0, 0.0]);
        let b = Embedding(vec![-1.0, 0.0]);
        let c = Embedding(vec![0.0, 1.0]);

        assert!(a.cosine_distance(&a) < 1e-6);
        assert!((a.cosine_distance(&b) - 2.0).abs() < 1e-6);
        assert!((a.cosine_distance(&c) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_mismatched_dims_is_zero() {
        let a = Embedding(vec![1.0, 0.0]);
        let b = Embedding(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.cosine_similarity(&b), 0.0);
    }

    #[test]
    fn decision_text_defaults_to_none() {
        let d: Decision =
            serde_json::from_str(r#"{"id": "4", "event": "ADD"}"#).expect("parse");
        assert_eq!(d.id, "4");
        assert_eq!(d.event, MemoryAction::Add);
        assert!(d.text.is_none());
    }
}
