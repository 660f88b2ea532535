use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Content classification of a memory. `Core` doubles as a retention tier:
/// it overrides the content category, is exempt from decay, and is only ever
/// set by the user or by explicit promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Preference,
    Fact,
    Decision,
    Entity,
    Other,
    Core,
}

impl MemoryCategory {
    pub fn slug(self) -> &'static str {
        match self {
            Self::Preference => "preference",
            Self::Fact => "fact",
            Self::Decision => "decision",
            Self::Entity => "entity",
            Self::Other => "other",
            Self::Core => "core",
        }
    }

    /// Content categories an LLM may assign. `core` is deliberately absent:
    /// the tier is never oracle-assigned.
    pub fn from_llm_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "preference" => Some(Self::Preference),
            "fact" => Some(Self::Fact),
            "decision" => Some(Self::Decision),
            "entity" => Some(Self::Entity),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Where a memory is in its enrichment lifecycle.
///
/// Transitions are monotonic: `Pending` may move to any terminal state, and
/// terminal states never change. A transient extraction failure keeps the
/// status `Pending` and bumps `extraction_retries` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Pending,
    Complete,
    Failed,
    Skipped,
}

impl ExtractionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn can_transition_to(self, next: ExtractionStatus) -> bool {
        self == Self::Pending || self == next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Event,
    Concept,
}

impl EntityType {
    pub fn from_llm_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "person" => Some(Self::Person),
            "organization" => Some(Self::Organization),
            "location" => Some(Self::Location),
            "event" => Some(Self::Event),
            "concept" => Some(Self::Concept),
            _ => None,
        }
    }
}

/// Typed edges between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    WorksAt,
    LivesAt,
    Knows,
    MarriedTo,
    Prefers,
    Decided,
    RelatedTo,
}

impl RelationType {
    pub fn from_llm_label(label: &str) -> Option<Self> {
        match label.trim().to_uppercase().as_str() {
            "WORKS_AT" => Some(Self::WorksAt),
            "LIVES_AT" => Some(Self::LivesAt),
            "KNOWS" => Some(Self::Knows),
            "MARRIED_TO" => Some(Self::MarriedTo),
            "PREFERS" => Some(Self::Prefers),
            "DECIDED" => Some(Self::Decided),
            "RELATED_TO" => Some(Self::RelatedTo),
            _ => None,
        }
    }
}

/// A stored utterance plus its metadata and embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub text: String,
    /// Unit-norm vector; every embedding in a store shares one dimension.
    pub embedding: Vec<f32>,
    pub category: MemoryCategory,
    /// Semantic weight in `[0.1, 1.0]`; 0.5 is the neutral default.
    pub importance: f64,
    pub retrieval_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub extraction_status: ExtractionStatus,
    pub extraction_retries: u32,
    pub user_pinned: bool,
    /// Soft-delete marker: hides the memory from retrieval and from every
    /// later consolidation phase without reclaiming storage.
    pub invalidated: bool,
    pub agent_id: Option<String>,
    /// SHA-256 hex of `text`, for exact-duplicate idempotence.
    pub content_hash: String,
}

impl Memory {
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.created_at).num_seconds().max(0) as f64) / 86_400.0
    }

    pub fn days_since_access(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.last_accessed_at).num_seconds().max(0) as f64) / 86_400.0
    }
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extracted referent of a memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    /// Lowercased, trimmed, non-empty; unique within `entity_type`.
    pub name: String,
    pub entity_type: EntityType,
    pub aliases: Vec<String>,
    pub description: Option<String>,
}

/// Categorisation keyword. `name` is lowercased and globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
    pub category: String,
}

/// Truncate on a char boundary, for log lines and prompt blocks.
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        use ExtractionStatus::*;
        assert!(Pending.can_transition_to(Complete));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Pending.can_transition_to(Pending));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(Skipped.can_transition_to(Skipped));
    }

    #[test]
    fn llm_labels_are_lenient_but_never_core() {
        assert_eq!(MemoryCategory::from_llm_label(" Fact "), Some(MemoryCategory::Fact));
        assert_eq!(MemoryCategory::from_llm_label("core"), None);
        assert_eq!(MemoryCategory::from_llm_label("gibberish"), None);
        assert_eq!(EntityType::from_llm_label("PERSON"), Some(EntityType::Person));
        assert_eq!(EntityType::from_llm_label("planet"), None);
        assert_eq!(RelationType::from_llm_label("works_at"), Some(RelationType::WorksAt));
        assert_eq!(RelationType::from_llm_label("ENEMY_OF"), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 2), "hé");
        assert_eq!(truncate_str("short", 10), "short");
    }
}
